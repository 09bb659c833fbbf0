//! Generic object file: the in-memory artifact the encoder emits into.
//!
//! Sections hold raw bytes (or a fill spec for uninitialized data), symbols
//! name offsets within sections, and relocations record displacement fields
//! a later pass or the linker must patch. By convention the code section is
//! always present at index 0. Serializing this to ELF/COFF bytes on disk is
//! a downstream concern.

use std::fmt;

use serde::Serialize;

// ─── Symbols ────────────────────────────────────────────────────────────────

/// Classification of a symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SymbolKind {
    None,
    Function,
    /// Local data, including `.L`-prefixed labels the encoder strips itself.
    Static,
    /// Like `Static` but visible to other objects.
    Export,
    /// Defined elsewhere; the linker resolves it.
    External,
}

#[derive(Debug, Clone, Serialize)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub name: String,
    /// Name of the section this symbol is defined in.
    pub section_name: String,
    /// Offset of the definition within that section.
    pub byte_offset: usize,
}

// ─── Relocations ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RelocKind {
    /// Patch a 32-bit field with `symbol_address - (byte_offset + 4) + addend`.
    Disp32Pcrel,
    /// Patch a 32-bit field with `symbol_address + addend`.
    Disp32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Relocation {
    pub kind: RelocKind,
    pub sym: Symbol,
    pub addend: i64,
}

// ─── Sections ───────────────────────────────────────────────────────────────

/// Section attribute flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SectionAttrs {
    pub writable: bool,
    pub executable: bool,
}

/// Payload of a section: literal bytes, or a run-length fill for
/// uninitialized data.
#[derive(Debug, Clone, Serialize)]
pub enum SectionData {
    Bytes(Vec<u8>),
    Fill { value: u8, amount: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct Section {
    pub name: String,
    pub attrs: SectionAttrs,
    pub data: SectionData,
}

impl Section {
    pub fn new(name: impl Into<String>, attrs: SectionAttrs) -> Self {
        Section {
            name: name.into(),
            attrs,
            data: SectionData::Bytes(Vec::new()),
        }
    }

    /// Current size of the section payload in bytes.
    pub fn len(&self) -> usize {
        match &self.data {
            SectionData::Bytes(b) => b.len(),
            SectionData::Fill { amount, .. } => *amount,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bytes_mut(&mut self) -> &mut Vec<u8> {
        match &mut self.data {
            SectionData::Bytes(b) => b,
            SectionData::Fill { .. } => panic!("cannot write bytes into a fill section"),
        }
    }

    pub fn write1(&mut self, b0: u8) {
        self.bytes_mut().push(b0);
    }

    pub fn write2(&mut self, b0: u8, b1: u8) {
        self.bytes_mut().extend_from_slice(&[b0, b1]);
    }

    pub fn write3(&mut self, b0: u8, b1: u8, b2: u8) {
        self.bytes_mut().extend_from_slice(&[b0, b1, b2]);
    }

    pub fn write4(&mut self, b0: u8, b1: u8, b2: u8, b3: u8) {
        self.bytes_mut().extend_from_slice(&[b0, b1, b2, b3]);
    }

    pub fn write_n(&mut self, buf: &[u8]) {
        self.bytes_mut().extend_from_slice(buf);
    }
}

// ─── Object ─────────────────────────────────────────────────────────────────

/// Name of the code section, created at object init as section 0.
pub const TEXT_SECTION: &str = ".text";
/// Name of the data section used for static variables.
pub const DATA_SECTION: &str = ".data";

#[derive(Debug, Clone, Serialize)]
pub struct Object {
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    pub relocs: Vec<Relocation>,
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

impl Object {
    pub fn new() -> Self {
        Object {
            sections: vec![Section::new(
                TEXT_SECTION,
                SectionAttrs {
                    writable: false,
                    executable: true,
                },
            )],
            symbols: Vec::new(),
            relocs: Vec::new(),
        }
    }

    /// The code section (always section 0).
    pub fn code(&self) -> &Section {
        &self.sections[0]
    }

    pub fn code_mut(&mut self) -> &mut Section {
        &mut self.sections[0]
    }

    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section_by_name_mut(&mut self, name: &str) -> Option<&mut Section> {
        self.sections.iter_mut().find(|s| s.name == name)
    }

    /// Find the named section, creating it (with the given attributes) on
    /// first use.
    pub fn section_mut_or_create(&mut self, name: &str, attrs: SectionAttrs) -> &mut Section {
        if let Some(idx) = self.sections.iter().position(|s| s.name == name) {
            return &mut self.sections[idx];
        }
        self.sections.push(Section::new(name, attrs));
        self.sections.last_mut().unwrap()
    }

    pub fn push_symbol(&mut self, sym: Symbol) {
        self.symbols.push(sym);
    }

    pub fn push_reloc(&mut self, reloc: Relocation) {
        self.relocs.push(reloc);
    }

    /// Add a `Disp32Pcrel`/`Disp32` relocation pointing at the current end
    /// of the code section.
    pub fn reloc_here(&mut self, kind: RelocKind, name: &str, sym_kind: SymbolKind) {
        let byte_offset = self.code().len();
        let section_name = self.code().name.clone();
        self.relocs.push(Relocation {
            kind,
            sym: Symbol {
                kind: sym_kind,
                name: name.to_owned(),
                section_name,
                byte_offset,
            },
            addend: 0,
        });
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for sec in &self.sections {
            writeln!(f, "section {} ({} bytes)", sec.name, sec.len())?;
        }
        for sym in &self.symbols {
            writeln!(
                f,
                "symbol {:?} {} @ {}+{:#x}",
                sym.kind, sym.name, sym.section_name, sym.byte_offset
            )?;
        }
        for reloc in &self.relocs {
            writeln!(
                f,
                "reloc {:?} -> {} @ {}+{:#x} addend {}",
                reloc.kind, reloc.sym.name, reloc.sym.section_name, reloc.sym.byte_offset,
                reloc.addend
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_section_is_zeroth() {
        let obj = Object::new();
        assert_eq!(obj.sections[0].name, TEXT_SECTION);
        assert!(obj.sections[0].attrs.executable);
        assert!(obj.code().is_empty());
    }

    #[test]
    fn write_primitives_append() {
        let mut obj = Object::new();
        obj.code_mut().write1(0xc3);
        obj.code_mut().write2(0x0f, 0x05);
        obj.code_mut().write4(1, 2, 3, 4);
        obj.code_mut().write_n(&[9, 9]);
        match &obj.code().data {
            SectionData::Bytes(b) => {
                assert_eq!(b, &[0xc3, 0x0f, 0x05, 1, 2, 3, 4, 9, 9]);
            }
            SectionData::Fill { .. } => unreachable!(),
        }
    }

    #[test]
    fn section_lookup_and_create() {
        let mut obj = Object::new();
        assert!(obj.section_by_name(DATA_SECTION).is_none());
        let attrs = SectionAttrs {
            writable: true,
            executable: false,
        };
        obj.section_mut_or_create(DATA_SECTION, attrs).write1(42);
        assert_eq!(obj.section_by_name(DATA_SECTION).unwrap().len(), 1);
        // Second lookup returns the same section.
        obj.section_mut_or_create(DATA_SECTION, attrs).write1(43);
        assert_eq!(obj.section_by_name(DATA_SECTION).unwrap().len(), 2);
    }
}
