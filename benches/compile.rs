use divan::{black_box, Bencher};

use sable::ast::{BinOp, Expr, FuncDecl, Item, Linkage, Param, Program, Type};
use sable::{compile, CompileOptions};

fn main() {
    divan::main();
}

fn int() -> Type {
    Type::Integer
}

/// `fn fib(n) = if (n < 2) n else fib(n-1) + fib(n-2)` plus a main that
/// calls it — enough control flow and calls to exercise every pipeline
/// stage.
fn fib_program() -> Program {
    let fib_body = vec![Expr::If {
        cond: Box::new(Expr::binary(BinOp::Lt, Expr::var("n"), Expr::int(2))),
        then_body: vec![Expr::var("n")],
        else_body: vec![Expr::binary(
            BinOp::Add,
            Expr::Call {
                callee: Box::new(Expr::var("fib")),
                args: vec![Expr::binary(BinOp::Sub, Expr::var("n"), Expr::int(1))],
            },
            Expr::Call {
                callee: Box::new(Expr::var("fib")),
                args: vec![Expr::binary(BinOp::Sub, Expr::var("n"), Expr::int(2))],
            },
        )],
    }];
    Program {
        items: vec![
            Item::Function(FuncDecl {
                name: "fib".into(),
                params: vec![Param {
                    name: "n".into(),
                    ty: int(),
                }],
                ret: int(),
                body: fib_body,
                linkage: Linkage::Exported,
            }),
            Item::Function(FuncDecl {
                name: "main".into(),
                params: vec![],
                ret: int(),
                body: vec![Expr::Call {
                    callee: Box::new(Expr::var("fib")),
                    args: vec![Expr::int(20)],
                }],
                linkage: Linkage::Exported,
            }),
        ],
    }
}

#[divan::bench]
fn compile_fib(bencher: Bencher) {
    let program = fib_program();
    bencher.bench(|| {
        black_box(compile(black_box(&program), &CompileOptions::default()).unwrap())
    });
}

#[divan::bench]
fn compile_fib_unoptimized(bencher: Bencher) {
    let program = fib_program();
    let options = CompileOptions {
        optimize: false,
        ..CompileOptions::default()
    };
    bencher.bench(|| black_box(compile(black_box(&program), &options).unwrap()));
}
