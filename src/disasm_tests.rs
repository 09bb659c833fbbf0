//! End-to-end tests over the emitted machine code, checked by decoding
//! the code section back with yaxpeax.

use yaxpeax_arch::LengthedInstruction;
use yaxpeax_arch::{Decoder, U8Reader};
use yaxpeax_x86::amd64::InstDecoder;

use crate::ast::{Expr, FuncDecl, Item, Linkage, Param, Program, Type};
use crate::ir_parse::parse_module;
use crate::obj::{Object, RelocKind, SectionData, SymbolKind};
use crate::{compile, compile_module, CompileOptions};

fn code_bytes(object: &Object) -> &[u8] {
    match &object.code().data {
        SectionData::Bytes(b) => b,
        SectionData::Fill { .. } => unreachable!("code section is never a fill"),
    }
}

/// Decode the whole code section into formatted instructions, panicking
/// on anything the decoder rejects.
fn disasm(code: &[u8]) -> Vec<String> {
    let decoder = InstDecoder::default();
    let mut reader = U8Reader::new(code);
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        match decoder.decode(&mut reader) {
            Ok(inst) => {
                let len = inst.len().to_const() as usize;
                out.push(format!("{inst}"));
                offset += len;
            }
            Err(e) => panic!(
                "decode error at {offset:#x} (byte {:#04x}): {e}",
                code[offset]
            ),
        }
    }
    out
}

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
fn trivial_main_is_mov_eax_ret() {
    let object = compile(
        &main_returning(vec![Expr::int(42)]),
        &CompileOptions::default(),
    )
    .unwrap();
    assert_eq!(code_bytes(&object), &[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
    let insts = disasm(code_bytes(&object));
    assert_eq!(insts, vec!["mov eax, 0x2a", "ret"]);
}

#[test]
fn empty_function_returns_zero() {
    let object = compile(&main_returning(vec![]), &CompileOptions::default()).unwrap();
    assert_eq!(code_bytes(&object), &[0xb8, 0x00, 0x00, 0x00, 0x00, 0xc3]);
}

#[test]
fn tail_call_unwinds_then_jumps() {
    let mut module = parse_module(
        "defun other : integer(integer) {\n\
         bb0:\n\
         %0 = param 0\n\
         return %0\n\
         }\n\
         defun f : integer(integer) {\n\
         bb0:\n\
         %0 = param 0\n\
         %1 = call other(%0) tail\n\
         unreachable\n\
         }\n",
    )
    .unwrap();
    let object = compile_module(&mut module, &CompileOptions::default()).unwrap();
    let insts = disasm(code_bytes(&object));
    let text = insts.join("\n");
    // The tail transfer is a jump, not a call, and the jump displacement
    // is a relocation against the callee.
    assert!(insts.iter().any(|i| i.starts_with("jmp")), "{text}");
    assert!(object
        .relocs
        .iter()
        .any(|r| r.sym.name.starts_with("_XF5other")), "{text}");
}

#[test]
fn two_argument_add_stays_in_registers() {
    let mut module = parse_module(
        "defun add : integer(integer, integer) {\n\
         bb0:\n\
         %0 = param 0\n\
         %1 = param 1\n\
         %2 = add %0, %1\n\
         return %2\n\
         }\n",
    )
    .unwrap();
    let object = compile_module(&mut module, &CompileOptions::default()).unwrap();
    let insts = disasm(code_bytes(&object));
    // Leaf with no locals: no prologue at all, arguments come in RDI and
    // RSI, the sum leaves in RAX.
    assert_eq!(
        insts,
        vec!["mov rax, rdi", "mov rcx, rsi", "add rax, rcx", "ret"]
    );
    // The definition symbol carries the mangled name.
    assert!(object
        .symbols
        .iter()
        .any(|s| s.name == "_XF3addF7integer7integer7integerE"));
}

#[test]
fn if_else_joins_through_one_register() {
    let object = compile(
        &main_returning(vec![Expr::If {
            cond: Box::new(Expr::int(1)),
            then_body: vec![Expr::int(1)],
            else_body: vec![Expr::int(2)],
        }]),
        &CompileOptions::default(),
    )
    .unwrap();
    let insts = disasm(code_bytes(&object));
    let text = insts.join("\n");
    assert!(text.contains("test"), "{text}");
    assert!(text.contains("jz"), "{text}");
    // Exactly one ret; both arms fall into it.
    assert_eq!(insts.iter().filter(|i| i.as_str() == "ret").count(), 1);
}

#[test]
fn local_variable_gets_a_full_frame() {
    let object = compile(
        &main_returning(vec![
            Expr::Decl {
                name: "x".into(),
                ty: Type::Integer,
                init: Some(Box::new(Expr::int(7))),
            },
            Expr::var("x"),
        ]),
        &CompileOptions::default(),
    )
    .unwrap();
    let insts = disasm(code_bytes(&object));
    let text = insts.join("\n");
    // One local of 8 bytes pads to a 16-byte frame.
    assert!(text.contains("push rbp"), "{text}");
    assert!(text.contains("mov rbp, rsp"), "{text}");
    assert!(text.contains("sub rsp, 0x10"), "{text}");
    // The store folded its immediate; the load reads the slot back.
    assert!(text.contains("[rbp - 0x8]"), "{text}");
    assert!(text.contains("pop rbp"), "{text}");
    let stores = insts
        .iter()
        .filter(|i| i.starts_with("mov") && i.contains("[rbp - 0x8],"))
        .count();
    let loads = insts
        .iter()
        .filter(|i| i.starts_with("mov") && i.ends_with("[rbp - 0x8]"))
        .count();
    assert_eq!(stores, 1, "{text}");
    assert_eq!(loads, 1, "{text}");
}

#[test]
fn extern_call_moves_argument_and_relocates() {
    let program = Program {
        items: vec![
            Item::Function(FuncDecl {
                name: "printf".into(),
                params: vec![Param {
                    name: "fmt".into(),
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
                    callee: Box::new(Expr::var("printf")),
                    args: vec![Expr::int(9)],
                }],
                linkage: Linkage::Exported,
            }),
        ],
    };
    let object = compile(&program, &CompileOptions::default()).unwrap();
    let insts = disasm(code_bytes(&object));
    let text = insts.join("\n");
    assert!(text.contains("mov rdi") || text.contains("mov edi"), "{text}");
    // The call displacement is left for the linker.
    assert!(
        insts.iter().any(|i| i.starts_with("call")),
        "{text}"
    );
    let reloc = object
        .relocs
        .iter()
        .find(|r| r.sym.name == "printf")
        .expect("call relocation against printf");
    assert_eq!(reloc.kind, RelocKind::Disp32Pcrel);
}

#[test]
fn string_literal_lands_in_data_with_nul() {
    let object = compile(
        &main_returning(vec![
            Expr::Decl {
                name: "s".into(),
                ty: Type::Byte.ptr(),
                init: Some(Box::new(Expr::Str("hi".into()))),
            },
            Expr::int(0),
        ]),
        &CompileOptions::default(),
    )
    .unwrap();
    let data = object.section_by_name(".data").expect("data section");
    match &data.data {
        SectionData::Bytes(b) => assert_eq!(b, &[0x68, 0x69, 0x00]),
        SectionData::Fill { .. } => unreachable!(),
    }
    // The address is fetched RIP-relative through a pc-relative
    // relocation against the interned symbol.
    let reloc = object
        .relocs
        .iter()
        .find(|r| r.sym.name == "__str0")
        .expect("string literal relocation");
    assert_eq!(reloc.kind, RelocKind::Disp32Pcrel);
    assert!(object
        .symbols
        .iter()
        .any(|s| s.name == "__str0" && s.kind == SymbolKind::Static));
    let insts = disasm(code_bytes(&object));
    assert!(
        insts.iter().any(|i| i.starts_with("lea")),
        "{}",
        insts.join("\n")
    );
}

#[test]
fn value_across_call_saves_a_callee_saved_register() {
    let mut module = parse_module(
        "defun other : integer() {\n\
         bb0:\n\
         %0 = imm 3\n\
         return %0\n\
         }\n\
         defun f : integer(integer) {\n\
         bb0:\n\
         %0 = param 0\n\
         %1 = call other()\n\
         %2 = add %0, %1\n\
         return %2\n\
         }\n",
    )
    .unwrap();
    let object = compile_module(&mut module, &CompileOptions::default()).unwrap();
    let insts = disasm(code_bytes(&object));
    let text = insts.join("\n");
    // The parameter lives across the call: it is kept in R12, which the
    // prologue saves and the epilogue restores.
    assert!(text.contains("push r12"), "{text}");
    assert!(text.contains("pop r12"), "{text}");
    // Minimal frame: 8 alignment + 8 push padding.
    assert!(text.contains("sub rsp, 0x10"), "{text}");
    assert!(text.contains("add rsp, 0x10"), "{text}");
}

#[test]
fn loops_branch_backwards() {
    let object = compile(
        &main_returning(vec![
            Expr::Decl {
                name: "i".into(),
                ty: Type::Integer,
                init: Some(Box::new(Expr::int(0))),
            },
            Expr::While {
                cond: Box::new(Expr::binary(
                    crate::ast::BinOp::Lt,
                    Expr::var("i"),
                    Expr::int(10),
                )),
                body: vec![Expr::Assign {
                    target: Box::new(Expr::var("i")),
                    value: Box::new(Expr::binary(
                        crate::ast::BinOp::Add,
                        Expr::var("i"),
                        Expr::int(1),
                    )),
                }],
            },
            Expr::var("i"),
        ]),
        &CompileOptions::default(),
    )
    .unwrap();
    // All local labels resolved; decoding must be clean and contain the
    // loop's back edge.
    assert!(object.relocs.is_empty());
    let insts = disasm(code_bytes(&object));
    let text = insts.join("\n");
    assert!(insts.iter().any(|i| i.starts_with("jmp")), "{text}");
    assert!(text.contains("cmp"), "{text}");
}

#[test]
fn win64_uses_rcx_and_shadow_space() {
    let mut module = parse_module(
        "defun other : integer(integer) {\n\
         bb0:\n\
         %0 = param 0\n\
         return %0\n\
         }\n\
         defun f : integer() {\n\
         bb0:\n\
         %0 = imm 5\n\
         %1 = call other(%0)\n\
         return %1\n\
         }\n",
    )
    .unwrap();
    let options = CompileOptions {
        convention: crate::CallingConvention::Win64,
        ..CompileOptions::default()
    };
    let object = compile_module(&mut module, &options).unwrap();
    let insts = disasm(code_bytes(&object));
    let text = insts.join("\n");
    // First argument arrives in RCX on Win64.
    assert!(text.contains("rcx"), "{text}");
    // Shadow space: the minimal frame reserves 8 + 40 bytes.
    assert!(text.contains("sub rsp, 0x30"), "{text}");
}

#[test]
fn byte_to_integer_cast_zero_extends() {
    let object = compile(
        &main_returning(vec![
            Expr::Decl {
                name: "c".into(),
                ty: Type::Byte,
                init: Some(Box::new(Expr::Int {
                    value: 65,
                    ty: Type::Byte,
                })),
            },
            Expr::Cast {
                ty: Type::Integer,
                operand: Box::new(Expr::var("c")),
            },
        ]),
        &CompileOptions::default(),
    )
    .unwrap();
    let insts = disasm(code_bytes(&object));
    let text = insts.join("\n");
    // Byte load widens through movzx; byte is unsigned.
    assert!(text.contains("movzx"), "{text}");
    assert!(text.contains("[rbp - 0x1]"), "{text}");
}

#[test]
fn division_emits_cqo_idiv() {
    let mut module = parse_module(
        "defun halve : integer(integer, integer) {\n\
         bb0:\n\
         %0 = param 0\n\
         %1 = param 1\n\
         %2 = div %0, %1\n\
         return %2\n\
         }\n",
    )
    .unwrap();
    let object = compile_module(&mut module, &CompileOptions::default()).unwrap();
    let insts = disasm(code_bytes(&object));
    let text = insts.join("\n");
    assert!(text.contains("cqo"), "{text}");
    assert!(text.contains("idiv"), "{text}");
}

#[test]
fn unoptimized_compile_keeps_full_frames() {
    let options = CompileOptions {
        optimize: false,
        ..CompileOptions::default()
    };
    let object = compile(&main_returning(vec![Expr::int(1)]), &options).unwrap();
    let insts = disasm(code_bytes(&object));
    let text = insts.join("\n");
    assert!(text.contains("push rbp"), "{text}");
    assert!(text.contains("mov rbp, rsp"), "{text}");
}
