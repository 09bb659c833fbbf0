//! sable: the back half of a small statically-typed language compiler.
//!
//! Takes a type-checked AST and produces a linkable x86-64 object image:
//!
//! ```text
//! AST ─▶ ir_gen ─▶ IR ─▶ isel ─▶ MIR ─▶ regalloc ─▶ MIR' ─▶ arch::x64 ─▶ Object
//! ```
//!
//! The stages run strictly in sequence, single-threaded; each consumes
//! the previous stage's structure. [`compile`] drives the whole pipeline
//! from an AST; [`compile_module`] enters it with hand-built (or parsed)
//! IR instead, which is how most tests drive it.

pub mod arch;
pub mod ast;
pub mod ir;
pub mod ir_gen;
pub mod ir_parse;
pub mod isel;
pub mod mangle;
pub mod mir;
pub mod obj;
pub mod regalloc;

#[cfg(test)]
mod disasm_tests;

use std::fmt;

pub use arch::CallingConvention;
use arch::x64::{assign_block_labels, emit_function, emit_static_vars, resolve_local_labels, Emitter};
use arch::MachineDesc;

// ─── Options ────────────────────────────────────────────────────────────────

/// Per-compile configuration. There are no globals; everything the
/// pipeline consults travels through this record.
#[derive(Debug, Clone, Copy)]
pub struct CompileOptions {
    pub convention: CallingConvention,
    /// Enables frame elision, fallthrough branch elision, and skipping of
    /// unreferenced statics and labels.
    pub optimize: bool,
    /// Dump the IR to stderr before lowering.
    pub verbose: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            convention: CallingConvention::SysV,
            optimize: true,
            verbose: false,
        }
    }
}

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Failures surfaced to the caller of [`compile`]. Structural invariant
/// violations and encoder limit overflows are programming errors and
/// panic instead; no partial object is ever produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// A name was referenced but never declared.
    UnresolvedSymbol { name: String },
    /// A reachable construct this backend does not implement yet.
    Unsupported { what: String },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::UnresolvedSymbol { name } => {
                write!(f, "unresolved symbol '{name}'")
            }
            CompileError::Unsupported { what } => {
                write!(f, "unsupported construct: {what}")
            }
        }
    }
}

impl std::error::Error for CompileError {}

// ─── Pipeline ───────────────────────────────────────────────────────────────

/// Compile a type-checked program to an in-memory object file.
pub fn compile(
    program: &ast::Program,
    options: &CompileOptions,
) -> Result<obj::Object, CompileError> {
    let mut module = ir_gen::build_module(program)?;
    compile_module(&mut module, options)
}

/// Run the back half of the pipeline over an existing IR module.
pub fn compile_module(
    module: &mut ir::Module,
    options: &CompileOptions,
) -> Result<obj::Object, CompileError> {
    let desc = MachineDesc::for_convention(options.convention);

    mangle::apply(module);
    if options.verbose {
        eprintln!("{module}");
    }

    log::debug!(
        "compile: {} function(s), {} static(s)",
        module.funcs.len(),
        module.statics.len()
    );

    let mut mirs = Vec::with_capacity(module.funcs.len());
    for func in module.funcs.ids() {
        let mut mf = isel::lower_function(module, func, desc, options.optimize)?;
        if !mf.is_extern {
            regalloc::allocate(&mut mf, desc);
        }
        module.funcs[func].locals_total_size =
            mf.frame_objects.iter().map(|fo| fo.size).sum();
        module.funcs[func].registers_in_use = mf.registers_in_use;
        mirs.push(mf);
    }

    assign_block_labels(&mut mirs, options.optimize);

    let mut object = obj::Object::new();
    {
        let mut emitter = Emitter {
            obj: &mut object,
            desc,
            optimize: options.optimize,
        };
        emit_static_vars(&mut emitter, module);
        for mf in &mut mirs {
            emit_function(&mut emitter, module, mf);
        }
    }
    resolve_local_labels(&mut object);
    log::debug!("compile: emitted {} code bytes", object.code().len());
    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, FuncDecl, Item, Linkage, Program, Type};
    use crate::obj::SymbolKind;

    fn main_returning(body: Vec<Expr>) -> Program {
        Program {
            items: vec![Item::Function(FuncDecl {
                name: "main".into(),
                params: vec![],
                ret: Type::Integer,
                body,
                linkage: Linkage::Exported,
            })],
        }
    }

    #[test]
    fn compiling_produces_a_main_symbol_in_text() {
        let object = compile(
            &main_returning(vec![Expr::int(42)]),
            &CompileOptions::default(),
        )
        .unwrap();
        let main = object
            .symbols
            .iter()
            .find(|s| s.name == "main")
            .expect("main symbol");
        assert_eq!(main.kind, SymbolKind::Function);
        assert_eq!(main.section_name, obj::TEXT_SECTION);
        assert_eq!(main.byte_offset, 0);
        assert!(!object.code().is_empty());
    }

    #[test]
    fn no_local_labels_survive_compilation() {
        let object = compile(
            &main_returning(vec![Expr::If {
                cond: Box::new(Expr::int(1)),
                then_body: vec![Expr::int(1)],
                else_body: vec![Expr::int(2)],
            }]),
            &CompileOptions::default(),
        )
        .unwrap();
        assert!(object.symbols.iter().all(|s| !s.name.starts_with(".L")));
        assert!(object
            .relocs
            .iter()
            .all(|r| !r.sym.name.starts_with(".L")));
    }

    #[test]
    fn every_surviving_relocation_names_a_known_or_external_symbol() {
        let program = Program {
            items: vec![
                Item::Function(FuncDecl {
                    name: "putchar".into(),
                    params: vec![crate::ast::Param {
                        name: "c".into(),
                        ty: Type::Integer,
                    }],
                    ret: Type::Integer,
                    body: vec![],
                    linkage: Linkage::Imported,
                }),
                Item::Function(FuncDecl {
                    name: "main".into(),
                    params: vec![],
                    ret: Type::Integer,
                    body: vec![Expr::Call {
                        callee: Box::new(Expr::var("putchar")),
                        args: vec![Expr::int(65)],
                    }],
                    linkage: Linkage::Exported,
                }),
            ],
        };
        let object = compile(&program, &CompileOptions::default()).unwrap();
        for reloc in &object.relocs {
            assert!(
                object.symbols.iter().any(|s| s.name == reloc.sym.name),
                "relocation against unknown symbol {}",
                reloc.sym.name
            );
        }
        // The extern shows up as an external symbol.
        let ext = object
            .symbols
            .iter()
            .find(|s| s.name == "putchar")
            .unwrap();
        assert_eq!(ext.kind, SymbolKind::External);
    }

    #[test]
    fn unresolved_reference_produces_no_object() {
        let err = compile(
            &main_returning(vec![Expr::var("missing")]),
            &CompileOptions::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            CompileError::UnresolvedSymbol {
                name: "missing".into()
            }
        );
    }
}
