//! IR construction from the typed AST.
//!
//! A recursive walk of each expression emits the instruction stream and
//! returns the value instruction it produced. Locals are allocas tracked
//! in a lexically scoped map; globals are statics referenced through
//! `StaticRef`. Assignment re-walks its left-hand side "for address",
//! stopping one dereference earlier than an rvalue walk would.

use std::collections::HashMap;

use crate::ast::{BinOp, Expr, FuncDecl, Item, Linkage, Program, Type, UnOp};
use crate::ir::{BinaryOp, Builder, FuncId, InstId, Module, StaticId, StaticInit};
use crate::CompileError;

/// Build an IR module from a type-checked program.
pub fn build_module(program: &Program) -> Result<Module, CompileError> {
    let mut module = Module::new();
    let mut globals: HashMap<String, StaticId> = HashMap::new();
    let mut funcs: HashMap<String, FuncId> = HashMap::new();

    // First pass: create every function and static up front so bodies can
    // reference them in any order.
    for item in &program.items {
        match item {
            Item::Global(g) => {
                let init = match &g.init {
                    None => None,
                    Some(Expr::Int { value, .. }) => Some(StaticInit::Int(*value)),
                    Some(Expr::Str(s)) => Some(StaticInit::Str(s.clone())),
                    Some(other) => panic!("non-literal static initializer: {other:?}"),
                };
                let id = module.create_static(g.name.clone(), g.ty.clone(), g.linkage, init);
                globals.insert(g.name.clone(), id);
            }
            Item::Function(f) => {
                let id = Builder::function(&mut module, f.name.clone(), f.ty()).func;
                let attrs = &mut module.funcs[id].attrs;
                attrs.is_extern = f.is_extern();
                attrs.global = f.linkage == Linkage::Exported || f.name == "main";
                funcs.insert(f.name.clone(), id);
            }
        }
    }

    // Second pass: lower bodies.
    let mut str_count = 0usize;
    for item in &program.items {
        let Item::Function(decl) = item else { continue };
        if decl.is_extern() {
            continue;
        }
        let func = funcs[&decl.name];
        log::debug!("ir_gen: function {}", decl.name);
        let mut gen = FuncGen {
            b: Builder::resume(&mut module, func),
            scopes: vec![HashMap::new()],
            globals: &globals,
            funcs: &funcs,
            str_count: &mut str_count,
            has_call: false,
        };
        gen.function_body(decl)?;
        let has_call = gen.has_call;
        module.funcs[func].attrs.leaf = !has_call;
    }
    Ok(module)
}

struct FuncGen<'a, 'm> {
    b: Builder<'m>,
    /// Innermost scope last; maps a name to its alloca.
    scopes: Vec<HashMap<String, InstId>>,
    globals: &'a HashMap<String, StaticId>,
    funcs: &'a HashMap<String, FuncId>,
    str_count: &'a mut usize,
    has_call: bool,
}

impl FuncGen<'_, '_> {
    fn lookup_local(&self, name: &str) -> Option<InstId> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }

    fn function_body(&mut self, decl: &FuncDecl) -> Result<(), CompileError> {
        // One alloca per parameter; the incoming register value is stored
        // into it so the body can take addresses and reassign.
        for (i, param) in decl.params.iter().enumerate() {
            let value = self.b.parameter(i);
            let slot = self.b.stack_allocate(&param.ty);
            self.b.store(value, slot);
            self.scopes
                .last_mut()
                .unwrap()
                .insert(param.name.clone(), slot);
        }

        let mut last = None;
        for expr in &decl.body {
            last = self.gen_expr(expr)?;
        }
        let func = self.b.func;
        if !self.b.module.funcs[func].is_closed(self.b.current_block()) {
            let value = match last {
                Some(v) => v,
                None => self.b.immediate(Type::Integer, 0),
            };
            self.b.ret(Some(value));
        }
        Ok(())
    }

    /// Generate code for a sequence of expressions in a fresh scope,
    /// returning the last value produced.
    fn gen_body(&mut self, body: &[Expr]) -> Result<Option<InstId>, CompileError> {
        self.scopes.push(HashMap::new());
        let mut last = None;
        for expr in body {
            last = self.gen_expr(expr)?;
        }
        self.scopes.pop();
        Ok(last)
    }

    fn gen_expr(&mut self, expr: &Expr) -> Result<Option<InstId>, CompileError> {
        match expr {
            Expr::Int { value, ty } => Ok(Some(self.b.immediate(ty.clone(), *value))),

            Expr::Str(s) => {
                let name = format!("__str{}", *self.str_count);
                *self.str_count += 1;
                let ty = Type::Array {
                    len: s.len() as u64 + 1,
                    of: Box::new(Type::Byte),
                };
                let var = self.b.module.create_static(
                    name,
                    ty,
                    Linkage::Internal,
                    Some(StaticInit::Str(s.clone())),
                );
                Ok(Some(self.b.static_reference(var)))
            }

            Expr::Var(name) => {
                if let Some(slot) = self.lookup_local(name) {
                    return Ok(Some(self.b.load(slot)));
                }
                if let Some(&var) = self.globals.get(name) {
                    let addr = self.b.static_reference(var);
                    return Ok(Some(self.b.load(addr)));
                }
                if let Some(&func) = self.funcs.get(name) {
                    return Ok(Some(self.b.funcref(func)));
                }
                Err(CompileError::UnresolvedSymbol { name: name.clone() })
            }

            Expr::Decl { name, ty, init } => {
                let slot = self.b.stack_allocate(ty);
                self.scopes
                    .last_mut()
                    .unwrap()
                    .insert(name.clone(), slot);
                if let Some(init) = init {
                    let value = self.expect_value(init)?;
                    self.b.store(value, slot);
                }
                Ok(None)
            }

            Expr::Assign { target, value } => {
                let value = self.expect_value(value)?;
                let addr = self.gen_lvalue(target)?;
                self.b.store(value, addr);
                Ok(Some(value))
            }

            Expr::Unary { op, operand } => match op {
                UnOp::Not => {
                    let v = self.expect_value(operand)?;
                    Ok(Some(self.b.not(v)))
                }
                UnOp::Deref => {
                    let addr = self.expect_value(operand)?;
                    Ok(Some(self.b.load(addr)))
                }
                UnOp::AddrOf => Ok(Some(self.gen_lvalue(operand)?)),
            },

            Expr::Binary { op, lhs, rhs } => {
                let l = self.expect_value(lhs)?;
                let r = self.expect_value(rhs)?;
                Ok(Some(self.b.binary(binary_op(*op), l, r)))
            }

            Expr::Call { callee, args } => {
                self.has_call = true;
                let call = match &**callee {
                    Expr::Var(name) if self.funcs.contains_key(name) => {
                        self.b.direct_call(self.funcs[name])
                    }
                    other => {
                        let target = self.expect_value(other)?;
                        self.b.indirect_call(target)
                    }
                };
                for arg in args {
                    let v = self.expect_value(arg)?;
                    self.b.add_argument(call, v);
                }
                self.b.insert_call(call);
                Ok(Some(call))
            }

            Expr::If {
                cond,
                then_body,
                else_body,
            } => {
                let cond = self.expect_value(cond)?;
                let then_block = self.b.block_create();
                let else_block = self.b.block_create();
                let join = self.b.block_create();
                self.b.branch_conditional(cond, then_block, else_block);

                // An arm that produces no value contributes a literal 0.
                self.b.block_attach(then_block);
                let then_value = match self.gen_body(then_body)? {
                    Some(v) => v,
                    None => self.b.immediate(Type::Integer, 0),
                };
                let last_then = self.b.current_block();
                self.b.branch(join);

                self.b.block_attach(else_block);
                let else_value = match self.gen_body(else_body)? {
                    Some(v) => v,
                    None => self.b.immediate(Type::Integer, 0),
                };
                let last_else = self.b.current_block();
                self.b.branch(join);

                self.b.block_attach(join);
                let phi = self.b.phi(Type::Integer);
                self.b.phi_argument(phi, last_then, then_value);
                self.b.phi_argument(phi, last_else, else_value);
                Ok(Some(phi))
            }

            Expr::While { cond, body } => {
                let header = self.b.block_create();
                let body_block = self.b.block_create();
                let exit = self.b.block_create();
                self.b.branch(header);
                self.b.block_attach(header);
                let c = self.expect_value(cond)?;
                self.b.branch_conditional(c, body_block, exit);
                self.b.block_attach(body_block);
                self.gen_body(body)?;
                self.b.branch(header);
                self.b.block_attach(exit);
                Ok(None)
            }

            Expr::For {
                init,
                cond,
                step,
                body,
            } => {
                self.scopes.push(HashMap::new());
                self.gen_expr(init)?;
                let header = self.b.block_create();
                let body_block = self.b.block_create();
                let exit = self.b.block_create();
                self.b.branch(header);
                self.b.block_attach(header);
                let c = self.expect_value(cond)?;
                self.b.branch_conditional(c, body_block, exit);
                self.b.block_attach(body_block);
                for expr in body {
                    self.gen_expr(expr)?;
                }
                self.gen_expr(step)?;
                self.b.branch(header);
                self.b.block_attach(exit);
                self.scopes.pop();
                Ok(None)
            }

            Expr::Block(body) => self.gen_body(body),

            Expr::Cast { ty, operand } => {
                let v = self.expect_value(operand)?;
                let from_size = {
                    let func = self.b.func;
                    self.b.module.funcs[func].insts[v].ty.size_of()
                };
                let to_size = ty.size_of();
                let value = if to_size > from_size {
                    let signed = {
                        let func = self.b.func;
                        self.b.module.funcs[func].insts[v].ty.is_signed()
                    };
                    if signed {
                        self.b.sign_extend(ty.clone(), v)
                    } else {
                        self.b.zero_extend(ty.clone(), v)
                    }
                } else if to_size < from_size {
                    self.b.truncate(ty.clone(), v)
                } else {
                    self.b.copy(v)
                };
                Ok(Some(value))
            }
        }
    }

    /// Generate an expression that must produce a value.
    fn expect_value(&mut self, expr: &Expr) -> Result<InstId, CompileError> {
        match self.gen_expr(expr)? {
            Some(v) => Ok(v),
            None => Ok(self.b.immediate(Type::Integer, 0)),
        }
    }

    /// Walk an expression "for address": dereferences stop one level
    /// earlier than in an rvalue context.
    fn gen_lvalue(&mut self, expr: &Expr) -> Result<InstId, CompileError> {
        match expr {
            Expr::Var(name) => {
                if let Some(slot) = self.lookup_local(name) {
                    return Ok(slot);
                }
                if let Some(&var) = self.globals.get(name) {
                    return Ok(self.b.static_reference(var));
                }
                Err(CompileError::UnresolvedSymbol { name: name.clone() })
            }
            Expr::Unary {
                op: UnOp::Deref,
                operand,
            } => self.expect_value(operand),
            other => Err(CompileError::Unsupported {
                what: format!("assignment target {other:?}"),
            }),
        }
    }
}

fn binary_op(op: BinOp) -> BinaryOp {
    match op {
        BinOp::Add => BinaryOp::Add,
        BinOp::Sub => BinaryOp::Sub,
        BinOp::Mul => BinaryOp::Mul,
        BinOp::Div => BinaryOp::Div,
        BinOp::Mod => BinaryOp::Mod,
        BinOp::Shl => BinaryOp::Shl,
        BinOp::Sar => BinaryOp::Sar,
        BinOp::Shr => BinaryOp::Shr,
        BinOp::And => BinaryOp::And,
        BinOp::Or => BinaryOp::Or,
        BinOp::Lt => BinaryOp::Lt,
        BinOp::Le => BinaryOp::Le,
        BinOp::Gt => BinaryOp::Gt,
        BinOp::Ge => BinaryOp::Ge,
        BinOp::Eq => BinaryOp::Eq,
        BinOp::Ne => BinaryOp::Ne,
    }
}
