//! Textual IR parser.
//!
//! Parses the text format produced by the IR `Display` impls back into a
//! [`Module`]. Two passes: parse text → unresolved AST, then resolve
//! value numbers and block references through the builder. Tests use this
//! to write IR compactly and to round-trip the printer.

use std::collections::HashMap;

use chumsky::prelude::*;

use crate::ast::{Linkage, Type};
use crate::ir::{BinaryOp, Builder, FuncId, InstId, InstKind, Module, StaticInit};

// ─── AST types (first pass) ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum AstType {
    Prim(String),
    Ptr(Box<AstType>),
    Array(u64, Box<AstType>),
    Func(Box<AstType>, Vec<AstType>),
}

#[derive(Debug, Clone)]
enum AstCallee {
    Name(String),
    Value(u64),
}

#[derive(Debug, Clone)]
enum AstOp {
    Imm(u64),
    Param(u64),
    Reg(u64),
    Alloca(u64),
    StaticRef(String),
    FuncRef(String),
    LitInt(u64),
    Load(u64),
    Store(u64, u64),
    Bin(BinaryOp, u64, u64),
    Not(u64),
    Copy(u64),
    Sext(u64),
    Zext(u64),
    Trunc(u64),
    Branch(u64),
    CBranch(u64, u64, u64),
    Return(Option<u64>),
    Unreachable,
    Call {
        callee: AstCallee,
        args: Vec<u64>,
        tail: bool,
    },
    Phi(Vec<(u64, u64)>),
}

#[derive(Debug, Clone)]
struct AstInst {
    dst: Option<u64>,
    op: AstOp,
}

#[derive(Debug, Clone)]
struct AstBlock {
    insts: Vec<AstInst>,
}

#[derive(Debug, Clone)]
struct AstFunc {
    name: String,
    attrs: Vec<String>,
    ty: AstType,
    blocks: Vec<AstBlock>,
}

#[derive(Debug, Clone)]
enum AstItem {
    Static {
        name: String,
        ty: AstType,
        init: Option<AstStaticInit>,
    },
    Func(AstFunc),
}

#[derive(Debug, Clone)]
enum AstStaticInit {
    Int(u64),
    Str(String),
}

// ─── Parsers ────────────────────────────────────────────────────────────────

type Extra<'src> = extra::Err<Rich<'src, char>>;

fn uint<'src>() -> impl Parser<'src, &'src str, u64, Extra<'src>> + Clone {
    text::int::<_, Extra<'_>>(10).map(|s: &str| s.parse::<u64>().unwrap())
}

/// `%42` — a value reference.
fn vref<'src>() -> impl Parser<'src, &'src str, u64, Extra<'src>> + Clone {
    just('%').ignore_then(uint())
}

/// `bb3` — a block reference.
fn bref<'src>() -> impl Parser<'src, &'src str, u64, Extra<'src>> + Clone {
    just("bb").ignore_then(uint())
}

fn ident<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    text::ident().map(|s: &str| s.to_owned())
}

/// A double-quoted string with the escapes the printer emits.
fn quoted<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    let escape = just('\\').ignore_then(choice((
        just('\\').to('\\'),
        just('"').to('"'),
        just('n').to('\n'),
        just('t').to('\t'),
        just('0').to('\0'),
    )));
    let plain = any().filter(|c: &char| *c != '"' && *c != '\\');
    choice((escape, plain))
        .repeated()
        .collect::<String>()
        .delimited_by(just('"'), just('"'))
}

fn ty<'src>() -> impl Parser<'src, &'src str, AstType, Extra<'src>> + Clone {
    recursive(|ty| {
        let prim = ident().map(AstType::Prim);
        let ptr = just('@')
            .ignore_then(ty.clone())
            .map(|t| AstType::Ptr(Box::new(t)));
        let array = just('[')
            .ignore_then(ty.clone().padded())
            .then(uint().padded())
            .then_ignore(just(']'))
            .map(|(of, len)| AstType::Array(len, Box::new(of)));
        let base = choice((ptr, array, prim));
        // `integer(integer, integer)` — a function type.
        base.then(
            ty.clone()
                .padded()
                .separated_by(just(','))
                .collect::<Vec<_>>()
                .delimited_by(just('('), just(')'))
                .or_not(),
        )
        .map(|(base, params)| match params {
            Some(params) => AstType::Func(Box::new(base), params),
            None => base,
        })
    })
}

fn binop<'src>() -> impl Parser<'src, &'src str, BinaryOp, Extra<'src>> + Clone {
    choice((
        just("add").to(BinaryOp::Add),
        just("sub").to(BinaryOp::Sub),
        just("mul").to(BinaryOp::Mul),
        just("div").to(BinaryOp::Div),
        just("mod").to(BinaryOp::Mod),
        just("shl").to(BinaryOp::Shl),
        just("sar").to(BinaryOp::Sar),
        just("shr").to(BinaryOp::Shr),
        just("and").to(BinaryOp::And),
        just("or").to(BinaryOp::Or),
        just("lt").to(BinaryOp::Lt),
        just("le").to(BinaryOp::Le),
        just("gt").to(BinaryOp::Gt),
        just("ge").to(BinaryOp::Ge),
        just("eq").to(BinaryOp::Eq),
        just("ne").to(BinaryOp::Ne),
    ))
}

fn op<'src>() -> impl Parser<'src, &'src str, AstOp, Extra<'src>> + Clone {
    let pair = |kw: &'static str| {
        just(kw)
            .ignore_then(vref().padded())
            .then_ignore(just(','))
            .then(vref().padded())
    };
    let unary = |kw: &'static str| just(kw).ignore_then(vref().padded());

    let call = just("call")
        .ignore_then(
            choice((
                vref().map(AstCallee::Value),
                ident().map(AstCallee::Name),
            ))
            .padded(),
        )
        .then(
            vref()
                .padded()
                .separated_by(just(','))
                .collect::<Vec<_>>()
                .delimited_by(just('('), just(')')),
        )
        .then(just(" tail").or_not())
        .map(|((callee, args), tail)| AstOp::Call {
            callee,
            args,
            tail: tail.is_some(),
        });

    let phi_arg = just('[')
        .ignore_then(bref().padded())
        .then_ignore(just(':'))
        .then(vref().padded())
        .then_ignore(just(']'));
    let phi = just("phi")
        .ignore_then(
            phi_arg
                .padded()
                .separated_by(just(','))
                .collect::<Vec<_>>(),
        )
        .map(AstOp::Phi);

    choice((
        just("imm").ignore_then(uint().padded()).map(AstOp::Imm),
        just("param").ignore_then(uint().padded()).map(AstOp::Param),
        just("reg").ignore_then(uint().padded()).map(AstOp::Reg),
        just("alloca").ignore_then(uint().padded()).map(AstOp::Alloca),
        just("static.ref")
            .ignore_then(ident().padded())
            .map(AstOp::StaticRef),
        just("func.ref")
            .ignore_then(ident().padded())
            .map(AstOp::FuncRef),
        just("lit.int").ignore_then(uint().padded()).map(AstOp::LitInt),
        unary("load").map(AstOp::Load),
        pair("store").map(|(v, a)| AstOp::Store(v, a)),
        unary("not").map(AstOp::Not),
        unary("copy").map(AstOp::Copy),
        unary("sext").map(AstOp::Sext),
        unary("zext").map(AstOp::Zext),
        unary("trunc").map(AstOp::Trunc),
        just("branch").ignore_then(bref().padded()).map(AstOp::Branch),
        just("cbranch")
            .ignore_then(vref().padded())
            .then_ignore(just(','))
            .then(bref().padded())
            .then_ignore(just(','))
            .then(bref().padded())
            .map(|((c, t), e)| AstOp::CBranch(c, t, e)),
        just("return")
            .ignore_then(vref().padded().or_not())
            .map(AstOp::Return),
        just("unreachable").to(AstOp::Unreachable),
        call,
        phi,
        binop()
            .then_ignore(just(' '))
            .then(vref().padded())
            .then_ignore(just(','))
            .then(vref().padded())
            .map(|((op, l), r)| AstOp::Bin(op, l, r)),
    ))
}

fn inst<'src>() -> impl Parser<'src, &'src str, AstInst, Extra<'src>> + Clone {
    vref()
        .padded()
        .then_ignore(just('='))
        .or_not()
        .then(op().padded())
        .map(|(dst, op)| AstInst { dst, op })
}

fn block<'src>() -> impl Parser<'src, &'src str, AstBlock, Extra<'src>> + Clone {
    bref()
        .padded()
        .then_ignore(just(':'))
        .ignore_then(inst().padded().repeated().collect::<Vec<_>>())
        .map(|insts| AstBlock { insts })
}

fn func<'src>() -> impl Parser<'src, &'src str, AstFunc, Extra<'src>> + Clone {
    let attrs = ident()
        .padded()
        .separated_by(just(','))
        .collect::<Vec<_>>()
        .delimited_by(just('['), just(']'));
    just("defun")
        .ignore_then(ident().padded())
        .then(attrs.padded().or_not())
        .then_ignore(just(':'))
        .then(ty().padded())
        .then(
            block()
                .padded()
                .repeated()
                .collect::<Vec<_>>()
                .delimited_by(just('{'), just('}')),
        )
        .map(|(((name, attrs), ty), blocks)| AstFunc {
            name,
            attrs: attrs.unwrap_or_default(),
            ty,
            blocks,
        })
}

fn static_var<'src>() -> impl Parser<'src, &'src str, AstItem, Extra<'src>> + Clone {
    let init = just('=').ignore_then(
        choice((
            quoted().map(AstStaticInit::Str),
            uint().map(AstStaticInit::Int),
        ))
        .padded(),
    );
    just("static")
        .ignore_then(ident().padded())
        .then_ignore(just(':'))
        .then(ty().padded())
        .then(init.or_not())
        .map(|((name, ty), init)| AstItem::Static { name, ty, init })
}

fn module_parser<'src>() -> impl Parser<'src, &'src str, Vec<AstItem>, Extra<'src>> {
    choice((static_var(), func().map(AstItem::Func)))
        .padded()
        .repeated()
        .collect::<Vec<_>>()
        .then_ignore(end())
}

// ─── Resolution (second pass) ───────────────────────────────────────────────

#[derive(Debug)]
pub struct ParseError(pub String);

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ir parse error: {}", self.0)
    }
}

impl std::error::Error for ParseError {}

fn resolve_type(t: &AstType) -> Result<Type, ParseError> {
    Ok(match t {
        AstType::Prim(name) => match name.as_str() {
            "void" => Type::Void,
            "integer" => Type::Integer,
            "integer_literal" => Type::IntegerLiteral,
            "byte" => Type::Byte,
            other => Type::Named {
                name: other.to_owned(),
                underlying: None,
            },
        },
        AstType::Ptr(to) => Type::Pointer(Box::new(resolve_type(to)?)),
        AstType::Array(len, of) => Type::Array {
            len: *len,
            of: Box::new(resolve_type(of)?),
        },
        AstType::Func(ret, params) => Type::Function {
            ret: Box::new(resolve_type(ret)?),
            params: params.iter().map(resolve_type).collect::<Result<_, _>>()?,
        },
    })
}

/// Parse a textual IR module.
pub fn parse_module(source: &str) -> Result<Module, ParseError> {
    let items = module_parser()
        .parse(source)
        .into_result()
        .map_err(|errs| {
            let msgs: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
            ParseError(msgs.join("; "))
        })?;

    let mut module = Module::new();
    let mut statics = HashMap::new();
    let mut funcs: HashMap<String, FuncId> = HashMap::new();

    // Create statics and function shells first so references resolve in
    // any order.
    for item in &items {
        match item {
            AstItem::Static { name, ty, init } => {
                let init = match init {
                    Some(AstStaticInit::Int(v)) => Some(StaticInit::Int(*v)),
                    Some(AstStaticInit::Str(s)) => Some(StaticInit::Str(s.clone())),
                    None => None,
                };
                let id =
                    module.create_static(name.clone(), resolve_type(ty)?, Linkage::Internal, init);
                statics.insert(name.clone(), id);
            }
            AstItem::Func(f) => {
                let id = Builder::function(&mut module, f.name.clone(), resolve_type(&f.ty)?).func;
                for attr in &f.attrs {
                    let attrs = &mut module.funcs[id].attrs;
                    match attr.as_str() {
                        "global" => attrs.global = true,
                        "extern" => attrs.is_extern = true,
                        "noreturn" => attrs.noreturn = true,
                        "leaf" => attrs.leaf = true,
                        other => return Err(ParseError(format!("unknown attribute {other}"))),
                    }
                }
                funcs.insert(f.name.clone(), id);
            }
        }
    }

    for item in &items {
        let AstItem::Func(f) = item else { continue };
        resolve_func(&mut module, f, &statics, &funcs)?;
        // Compute the leaf attribute the same way the AST walk does.
        let id = funcs[&f.name];
        let has_call = module.funcs[id]
            .insts
            .ids()
            .any(|i| matches!(module.funcs[id].insts[i].kind, InstKind::Call { .. }));
        if !module.funcs[id].attrs.leaf {
            module.funcs[id].attrs.leaf = !has_call;
        }
    }
    Ok(module)
}

fn resolve_func(
    module: &mut Module,
    f: &AstFunc,
    statics: &HashMap<String, crate::ir::StaticId>,
    funcs: &HashMap<String, FuncId>,
) -> Result<(), ParseError> {
    let func = funcs[&f.name];
    let mut b = Builder::resume(module, func);
    let mut values: HashMap<u64, InstId> = HashMap::new();
    let mut blocks = Vec::with_capacity(f.blocks.len());
    blocks.push(b.current_block());
    for _ in 1..f.blocks.len() {
        blocks.push(b.block_create());
    }
    let block_at = |n: u64| -> Result<crate::ir::BlockId, ParseError> {
        blocks
            .get(n as usize)
            .copied()
            .ok_or_else(|| ParseError(format!("reference to unknown block bb{n}")))
    };
    // Phi arguments may reference values from later blocks (loops), so
    // they are wired after everything else exists.
    let mut deferred_phis: Vec<(InstId, Vec<(u64, u64)>)> = Vec::new();

    for (bi, ast_block) in f.blocks.iter().enumerate() {
        if bi > 0 {
            b.block_attach(blocks[bi]);
        }
        for ast in &ast_block.insts {
            let lookup = |values: &HashMap<u64, InstId>, n: u64| -> Result<InstId, ParseError> {
                values
                    .get(&n)
                    .copied()
                    .ok_or_else(|| ParseError(format!("reference to undefined value %{n}")))
            };
            let produced: Option<InstId> = match &ast.op {
                AstOp::Imm(v) => Some(b.immediate(Type::Integer, *v)),
                AstOp::Param(i) => Some(b.parameter(*i as usize)),
                AstOp::Reg(r) => Some(b.register(Type::Integer, *r as u32)),
                AstOp::Alloca(size) => {
                    // Sizes round-trip through a byte array of the right
                    // length.
                    let ty = Type::Array {
                        len: *size,
                        of: Box::new(Type::Byte),
                    };
                    Some(b.stack_allocate(&ty))
                }
                AstOp::StaticRef(name) => {
                    let id = *statics
                        .get(name)
                        .ok_or_else(|| ParseError(format!("unknown static {name}")))?;
                    Some(b.static_reference(id))
                }
                AstOp::FuncRef(name) => {
                    let id = *funcs
                        .get(name)
                        .ok_or_else(|| ParseError(format!("unknown function {name}")))?;
                    Some(b.funcref(id))
                }
                AstOp::LitInt(v) => Some(b.immediate(Type::IntegerLiteral, *v)),
                AstOp::Load(a) => Some(b.load(lookup(&values, *a)?)),
                AstOp::Store(v, a) => {
                    let value = lookup(&values, *v)?;
                    let addr = lookup(&values, *a)?;
                    b.store(value, addr);
                    None
                }
                AstOp::Bin(op, l, r) => {
                    Some(b.binary(*op, lookup(&values, *l)?, lookup(&values, *r)?))
                }
                AstOp::Not(v) => Some(b.not(lookup(&values, *v)?)),
                AstOp::Copy(v) => Some(b.copy(lookup(&values, *v)?)),
                AstOp::Sext(v) => Some(b.sign_extend(Type::Integer, lookup(&values, *v)?)),
                AstOp::Zext(v) => Some(b.zero_extend(Type::Integer, lookup(&values, *v)?)),
                AstOp::Trunc(v) => Some(b.truncate(Type::Byte, lookup(&values, *v)?)),
                AstOp::Branch(t) => {
                    b.branch(block_at(*t)?);
                    None
                }
                AstOp::CBranch(c, t, e) => {
                    let cond = lookup(&values, *c)?;
                    b.branch_conditional(cond, block_at(*t)?, block_at(*e)?);
                    None
                }
                AstOp::Return(v) => {
                    let value = match v {
                        Some(n) => Some(lookup(&values, *n)?),
                        None => None,
                    };
                    b.ret(value);
                    None
                }
                AstOp::Unreachable => {
                    b.unreachable();
                    None
                }
                AstOp::Call { callee, args, tail } => {
                    let call = match callee {
                        AstCallee::Name(name) => {
                            let id = *funcs
                                .get(name)
                                .ok_or_else(|| ParseError(format!("unknown function {name}")))?;
                            b.direct_call(id)
                        }
                        AstCallee::Value(v) => {
                            let target = lookup(&values, *v)?;
                            b.indirect_call(target)
                        }
                    };
                    for arg in args {
                        let v = lookup(&values, *arg)?;
                        b.add_argument(call, v);
                    }
                    if *tail {
                        let func = b.func;
                        if let InstKind::Call { tail, .. } =
                            &mut b.module.funcs[func].insts[call].kind
                        {
                            *tail = true;
                        }
                    }
                    b.insert_call(call);
                    Some(call)
                }
                AstOp::Phi(args) => {
                    let phi = b.phi(Type::Integer);
                    deferred_phis.push((phi, args.clone()));
                    Some(phi)
                }
            };
            if let (Some(dst), Some(id)) = (ast.dst, produced) {
                values.insert(dst, id);
            }
        }
    }

    for (phi, args) in deferred_phis {
        for (block_n, value_n) in args {
            let block = block_at(block_n)?;
            let value = values
                .get(&value_n)
                .copied()
                .ok_or_else(|| ParseError(format!("reference to undefined value %{value_n}")))?;
            b.phi_argument(phi, block, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::FunctionDisplay;

    #[test]
    fn parses_a_simple_function() {
        let module = parse_module(
            "defun add : integer(integer, integer) {\n\
             bb0:\n\
             %0 = param 0\n\
             %1 = param 1\n\
             %2 = add %0, %1\n\
             return %2\n\
             }\n",
        )
        .unwrap();
        let func = module.func_by_name("add").unwrap();
        let f = &module.funcs[func];
        assert_eq!(f.arity(), 2);
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.block_order.len(), 1);
    }

    #[test]
    fn parses_control_flow_and_phi() {
        let module = parse_module(
            "defun pick : integer(integer) {\n\
             bb0:\n\
             %0 = param 0\n\
             cbranch %0, bb1, bb2\n\
             bb1:\n\
             %1 = imm 1\n\
             branch bb3\n\
             bb2:\n\
             %2 = imm 2\n\
             branch bb3\n\
             bb3:\n\
             %3 = phi [bb1: %1], [bb2: %2]\n\
             return %3\n\
             }\n",
        )
        .unwrap();
        let func = module.func_by_name("pick").unwrap();
        let f = &module.funcs[func];
        assert_eq!(f.block_order.len(), 4);
        let phi = f
            .insts
            .ids()
            .find(|&i| matches!(f.insts[i].kind, InstKind::Phi { .. }))
            .unwrap();
        let InstKind::Phi { args } = &f.insts[phi].kind else {
            unreachable!()
        };
        assert_eq!(args.len(), 2);
        for arg in args {
            assert!(f.is_predecessor(arg.block, f.insts[phi].block));
        }
    }

    #[test]
    fn round_trips_through_display() {
        let source = "defun loopy : integer(integer) {\n\
                      bb0:\n\
                      %0 = param 0\n\
                      branch bb1\n\
                      bb1:\n\
                      %1 = phi [bb0: %0], [bb2: %2]\n\
                      cbranch %1, bb2, bb3\n\
                      bb2:\n\
                      %2 = imm 1\n\
                      branch bb1\n\
                      bb3:\n\
                      return %1\n\
                      }\n";
        let module = parse_module(source).unwrap();
        let func = module.func_by_name("loopy").unwrap();
        let printed = FunctionDisplay {
            module: &module,
            func,
        }
        .to_string();
        let module2 = parse_module(&printed).unwrap();
        let func2 = module2.func_by_name("loopy").unwrap();
        let printed2 = FunctionDisplay {
            module: &module2,
            func: func2,
        }
        .to_string();
        assert_eq!(printed, printed2);
    }

    #[test]
    fn parses_statics_and_references() {
        let module = parse_module(
            "static greeting : [byte 3] = \"hi\"\n\
             defun main [global] : integer() {\n\
             bb0:\n\
             %0 = static.ref greeting\n\
             return %0\n\
             }\n",
        )
        .unwrap();
        assert_eq!(module.statics.len(), 1);
        let (_, var) = module.statics.iter().next().unwrap();
        assert!(matches!(&var.init, Some(StaticInit::Str(s)) if s == "hi"));
        let main = module.func_by_name("main").unwrap();
        assert!(module.funcs[main].attrs.global);
    }

    #[test]
    fn reports_undefined_values() {
        let err = parse_module(
            "defun bad : integer() {\n\
             bb0:\n\
             return %7\n\
             }\n",
        )
        .unwrap_err();
        assert!(err.0.contains("%7"), "{err}");
    }
}
