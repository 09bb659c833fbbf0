//! SSA intermediate representation.
//!
//! A [`Module`] owns functions and static variables. Each function owns its
//! instructions and blocks in typed arenas — blocks and instructions are
//! indices, never pointers, and link fields are ids. Values flow through
//! instruction operands; control-flow re-joins are expressed by phis.
//!
//! The [`Builder`] allocates instructions, attaches them at the current
//! insert point and keeps both sides of the def/use relation in sync. The
//! optimizer-facing surface (`replace_uses`, `remove`, `for_each_child`)
//! lives on [`Function`].

use std::fmt;
use std::marker::PhantomData;

use crate::ast::{Linkage, Type};

// ─── Arena and ID types ─────────────────────────────────────────────────────

/// Typed index into an [`Arena`]. Generic over the element type for type
/// safety.
pub struct Id<T> {
    index: u32,
    _phantom: PhantomData<T>,
}

// Manual impls to avoid requiring T: Clone/Copy/Debug/PartialEq/Eq/Hash.
// Id<T> equality depends only on the index, not on T.
impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

impl<T> Id<T> {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    /// The raw index into the arena.
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Vec-backed arena with typed indexing via [`Id`].
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn push(&mut self, item: T) -> Id<T> {
        let id = Id::new(self.items.len() as u32);
        self.items.push(item);
        id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (Id::new(i as u32), item))
    }

    pub fn ids(&self) -> impl Iterator<Item = Id<T>> {
        (0..self.items.len() as u32).map(Id::new)
    }
}

impl<T> std::ops::Index<Id<T>> for Arena<T> {
    type Output = T;
    fn index(&self, id: Id<T>) -> &T {
        &self.items[id.index()]
    }
}

impl<T> std::ops::IndexMut<Id<T>> for Arena<T> {
    fn index_mut(&mut self, id: Id<T>) -> &mut T {
        &mut self.items[id.index()]
    }
}

impl<T: fmt::Debug> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

pub type InstId = Id<Inst>;
pub type BlockId = Id<Block>;
pub type FuncId = Id<Function>;
pub type StaticId = Id<StaticVar>;

// ─── Instruction vocabulary ─────────────────────────────────────────────────

/// Binary operation kinds, comparisons included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Sar,
    Shr,
    And,
    Or,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne
        )
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Mod => "mod",
            BinaryOp::Shl => "shl",
            BinaryOp::Sar => "sar",
            BinaryOp::Shr => "shr",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Lt => "lt",
            BinaryOp::Le => "le",
            BinaryOp::Gt => "gt",
            BinaryOp::Ge => "ge",
            BinaryOp::Eq => "eq",
            BinaryOp::Ne => "ne",
        }
    }
}

/// One incoming phi edge: the value to take when control arrives from
/// `block`.
#[derive(Debug, Clone, Copy)]
pub struct PhiArg {
    pub block: BlockId,
    pub value: InstId,
}

/// Callee of a call instruction.
#[derive(Debug, Clone, Copy)]
pub enum Callee {
    Direct(FuncId),
    Indirect(InstId),
}

/// The operation an instruction performs. Operand payloads live in the
/// matching variant only.
#[derive(Debug, Clone)]
pub enum InstKind {
    // Values.
    Immediate {
        value: u64,
    },
    Parameter {
        index: usize,
    },
    /// A precolored physical register (not produced by the AST walk; used
    /// by hand-built IR).
    Register {
        reg: u32,
    },
    Alloca {
        size: u64,
    },
    StaticRef {
        var: StaticId,
    },
    FuncRef {
        func: FuncId,
    },
    /// Literal payloads for static initializers; never executed.
    LitInteger {
        value: u64,
    },
    LitString {
        value: String,
    },

    // Memory.
    Load {
        addr: InstId,
    },
    Store {
        addr: InstId,
        value: InstId,
    },

    // Arithmetic, bitwise, comparison.
    Binary {
        op: BinaryOp,
        lhs: InstId,
        rhs: InstId,
    },
    Not {
        operand: InstId,
    },
    Copy {
        source: InstId,
    },

    // Width changes.
    SignExtend {
        operand: InstId,
    },
    ZeroExtend {
        operand: InstId,
    },
    Truncate {
        operand: InstId,
    },

    // Control flow.
    Branch {
        target: BlockId,
    },
    CondBranch {
        cond: InstId,
        then_block: BlockId,
        else_block: BlockId,
    },
    Return {
        value: Option<InstId>,
    },
    Unreachable,

    Call {
        callee: Callee,
        args: Vec<InstId>,
        tail: bool,
    },
    Phi {
        args: Vec<PhiArg>,
    },
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Branch { .. }
                | InstKind::CondBranch { .. }
                | InstKind::Return { .. }
                | InstKind::Unreachable
        )
    }

    /// Whether this instruction produces a value usable as an operand.
    pub fn yields_value(&self) -> bool {
        !matches!(
            self,
            InstKind::Store { .. }
                | InstKind::Branch { .. }
                | InstKind::CondBranch { .. }
                | InstKind::Return { .. }
                | InstKind::Unreachable
        )
    }
}

/// An instruction node in the SSA graph.
#[derive(Debug)]
pub struct Inst {
    pub kind: InstKind,
    pub ty: Type,
    /// Owning block.
    pub block: BlockId,
    /// Instructions that reference this one as an operand.
    pub users: Vec<InstId>,
}

// ─── Blocks and functions ───────────────────────────────────────────────────

/// A list of instructions with control flow entering at the top and
/// leaving through the single terminator at the bottom.
#[derive(Debug)]
pub struct Block {
    /// Label, assigned just before emission. Empty until then.
    pub name: String,
    pub insts: Vec<InstId>,
    pub attached: bool,
}

/// Attribute flags on a function.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuncAttrs {
    pub consteval: bool,
    pub forceinline: bool,
    pub global: bool,
    pub leaf: bool,
    pub noreturn: bool,
    pub pure_: bool,
    pub is_extern: bool,
}

#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub ty: Type,
    pub insts: Arena<Inst>,
    pub blocks: Arena<Block>,
    /// Blocks in attach order; emission follows this order.
    pub block_order: Vec<BlockId>,
    /// Parameter instructions, in index order.
    pub params: Vec<InstId>,
    pub attrs: FuncAttrs,
    pub locals_total_size: u64,
    /// Bitset of physical registers the allocator assigned, filled in
    /// after register allocation.
    pub registers_in_use: u32,
    /// Detached slots available for reuse.
    free_insts: Vec<InstId>,
    free_blocks: Vec<BlockId>,
}

impl Function {
    fn new(name: String, ty: Type) -> Self {
        Function {
            name,
            ty,
            insts: Arena::new(),
            blocks: Arena::new(),
            block_order: Vec::new(),
            params: Vec::new(),
            attrs: FuncAttrs::default(),
            locals_total_size: 0,
            registers_in_use: 0,
            free_insts: Vec::new(),
            free_blocks: Vec::new(),
        }
    }

    pub fn arity(&self) -> usize {
        match self.ty.canonical() {
            Type::Function { params, .. } => params.len(),
            _ => 0,
        }
    }

    pub fn return_type(&self) -> Type {
        match self.ty.canonical() {
            Type::Function { ret, .. } => (**ret).clone(),
            _ => Type::Void,
        }
    }

    /// The entry block (first attached).
    pub fn entry(&self) -> BlockId {
        self.block_order[0]
    }

    /// Whether a block's last instruction is a terminator.
    pub fn is_closed(&self, block: BlockId) -> bool {
        self.blocks[block]
            .insts
            .last()
            .is_some_and(|&i| self.insts[i].kind.is_terminator())
    }

    /// CFG successors of a block.
    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        match self.blocks[block].insts.last() {
            Some(&term) => match self.insts[term].kind {
                InstKind::Branch { target } => vec![target],
                InstKind::CondBranch {
                    then_block,
                    else_block,
                    ..
                } => vec![then_block, else_block],
                _ => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    /// Whether `pred` is a CFG predecessor of `block`.
    pub fn is_predecessor(&self, pred: BlockId, block: BlockId) -> bool {
        self.successors(pred).contains(&block)
    }

    // ── Use-list maintenance ────────────────────────────────────────────

    /// Record that `user` references `usee` as an operand.
    pub fn mark_used(&mut self, usee: InstId, user: InstId) {
        self.insts[usee].users.push(user);
    }

    /// Remove one `user` entry from `usee`'s users list.
    pub fn remove_use(&mut self, usee: InstId, user: InstId) {
        let users = &mut self.insts[usee].users;
        if let Some(pos) = users.iter().position(|&u| u == user) {
            users.swap_remove(pos);
        }
    }

    /// Enumerate the operand instructions of `inst`, uniformly over all
    /// variants.
    pub fn for_each_child(&self, inst: InstId, mut f: impl FnMut(InstId)) {
        match &self.insts[inst].kind {
            InstKind::Load { addr } => f(*addr),
            InstKind::Store { addr, value } => {
                f(*addr);
                f(*value);
            }
            InstKind::Binary { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            InstKind::Not { operand }
            | InstKind::Copy { source: operand }
            | InstKind::SignExtend { operand }
            | InstKind::ZeroExtend { operand }
            | InstKind::Truncate { operand } => f(*operand),
            InstKind::CondBranch { cond, .. } => f(*cond),
            InstKind::Return { value: Some(v) } => f(*v),
            InstKind::Call { callee, args, .. } => {
                if let Callee::Indirect(c) = callee {
                    f(*c);
                }
                for a in args {
                    f(*a);
                }
            }
            InstKind::Phi { args } => {
                for a in args {
                    f(a.value);
                }
            }
            InstKind::Immediate { .. }
            | InstKind::Parameter { .. }
            | InstKind::Register { .. }
            | InstKind::Alloca { .. }
            | InstKind::StaticRef { .. }
            | InstKind::FuncRef { .. }
            | InstKind::LitInteger { .. }
            | InstKind::LitString { .. }
            | InstKind::Branch { .. }
            | InstKind::Return { value: None }
            | InstKind::Unreachable => {}
        }
    }

    /// Like [`for_each_child`](Self::for_each_child) but yields mutable
    /// operand slots, for positional rewriting.
    pub fn for_each_child_mut(&mut self, inst: InstId, mut f: impl FnMut(&mut InstId)) {
        match &mut self.insts[inst].kind {
            InstKind::Load { addr } => f(addr),
            InstKind::Store { addr, value } => {
                f(addr);
                f(value);
            }
            InstKind::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Not { operand }
            | InstKind::Copy { source: operand }
            | InstKind::SignExtend { operand }
            | InstKind::ZeroExtend { operand }
            | InstKind::Truncate { operand } => f(operand),
            InstKind::CondBranch { cond, .. } => f(cond),
            InstKind::Return { value: Some(v) } => f(v),
            InstKind::Call { callee, args, .. } => {
                if let Callee::Indirect(c) = callee {
                    f(c);
                }
                for a in args {
                    f(a);
                }
            }
            InstKind::Phi { args } => {
                for a in args {
                    f(&mut a.value);
                }
            }
            _ => {}
        }
    }

    /// Rewrite every user of `old` to use `new` instead. `new` absorbs
    /// `old`'s users in one pass; the biconditional between operand slots
    /// and users lists is preserved.
    pub fn replace_uses(&mut self, old: InstId, new: InstId) {
        if old == new {
            return;
        }
        let users = std::mem::take(&mut self.insts[old].users);
        for &user in &users {
            self.for_each_child_mut(user, |slot| {
                if *slot == old {
                    *slot = new;
                }
            });
        }
        self.insts[new].users.extend(users);
    }

    /// Remove `inst` from the users lists of all its operands.
    pub fn unmark_usees(&mut self, inst: InstId) {
        let mut children = Vec::new();
        self.for_each_child(inst, |c| children.push(c));
        for c in children {
            self.remove_use(c, inst);
        }
    }

    /// Detach `inst` from its block, unmark its usees and free its slot
    /// for reuse. The instruction must itself be unused.
    pub fn remove(&mut self, inst: InstId) {
        debug_assert!(
            self.insts[inst].users.is_empty(),
            "removing an instruction that still has users"
        );
        self.unmark_usees(inst);
        let block = self.insts[inst].block;
        let insts = &mut self.blocks[block].insts;
        if let Some(pos) = insts.iter().position(|&i| i == inst) {
            insts.remove(pos);
        }
        self.free_insts.push(inst);
    }

    /// Mark `block` as ending with `unreachable`: drop it from every phi
    /// that referenced it, then replace its terminator.
    pub fn mark_unreachable(&mut self, block: BlockId) {
        // Drop phi edges coming from this block.
        let phis: Vec<InstId> = self
            .insts
            .ids()
            .filter(|&i| matches!(self.insts[i].kind, InstKind::Phi { .. }))
            .collect();
        for phi in phis {
            let dropped: Vec<InstId> = match &mut self.insts[phi].kind {
                InstKind::Phi { args } => {
                    let before: Vec<PhiArg> = std::mem::take(args);
                    let (gone, kept): (Vec<_>, Vec<_>) =
                        before.into_iter().partition(|a| a.block == block);
                    *args = kept;
                    gone.iter().map(|a| a.value).collect()
                }
                _ => unreachable!(),
            };
            for value in dropped {
                self.remove_use(value, phi);
            }
        }

        // Replace the terminator.
        if let Some(&term) = self.blocks[block].insts.last() {
            if self.insts[term].kind.is_terminator() {
                self.unmark_usees(term);
                self.blocks[block].insts.pop();
                self.free_insts.push(term);
            }
        }
        let unreachable = self.alloc_inst(Inst {
            kind: InstKind::Unreachable,
            ty: Type::Void,
            block,
            users: Vec::new(),
        });
        self.blocks[block].insts.push(unreachable);
    }

    fn alloc_inst(&mut self, inst: Inst) -> InstId {
        match self.free_insts.pop() {
            Some(id) => {
                self.insts[id] = inst;
                id
            }
            None => self.insts.push(inst),
        }
    }

    fn alloc_block(&mut self, block: Block) -> BlockId {
        match self.free_blocks.pop() {
            Some(id) => {
                self.blocks[id] = block;
                id
            }
            None => self.blocks.push(block),
        }
    }
}

// ─── Static variables ───────────────────────────────────────────────────────

/// Literal-only initializer of a static variable.
#[derive(Debug, Clone)]
pub enum StaticInit {
    Int(u64),
    Str(String),
}

#[derive(Debug)]
pub struct StaticVar {
    pub name: String,
    pub ty: Type,
    pub linkage: Linkage,
    pub init: Option<StaticInit>,
    /// `StaticRef` instructions pointing at this variable.
    pub references: Vec<(FuncId, InstId)>,
}

impl StaticVar {
    /// A static is referenced iff some reference to it is itself used.
    pub fn is_referenced(&self, module: &Module) -> bool {
        self.references
            .iter()
            .any(|&(f, i)| !module.funcs[f].insts[i].users.is_empty())
    }
}

// ─── Module ─────────────────────────────────────────────────────────────────

#[derive(Default, Debug)]
pub struct Module {
    pub funcs: Arena<Function>,
    pub statics: Arena<StaticVar>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.funcs
            .iter()
            .find(|(_, f)| f.name == name)
            .map(|(id, _)| id)
    }

    /// Create a variable with static storage duration.
    pub fn create_static(
        &mut self,
        name: impl Into<String>,
        ty: Type,
        linkage: Linkage,
        init: Option<StaticInit>,
    ) -> StaticId {
        self.statics.push(StaticVar {
            name: name.into(),
            ty,
            linkage,
            init,
            references: Vec::new(),
        })
    }
}

// ─── Builder ────────────────────────────────────────────────────────────────

/// Constructs IR at an insert point (current function + current block).
///
/// Constructors allocate the instruction, attach it at the insert point,
/// wire its operands into the use lists and return its id. Attaching past
/// a terminator is a programming error and panics.
pub struct Builder<'m> {
    pub module: &'m mut Module,
    pub func: FuncId,
    block: BlockId,
}

impl<'m> Builder<'m> {
    /// Start a new function: create it, create and attach its entry block
    /// and make that the insert point.
    pub fn function(module: &'m mut Module, name: impl Into<String>, ty: Type) -> Self {
        let name = name.into();
        log::trace!("ir: begin function {name}");
        let func = module.funcs.push(Function::new(name, ty));
        let entry = module.funcs[func].alloc_block(Block {
            name: String::new(),
            insts: Vec::new(),
            attached: true,
        });
        module.funcs[func].block_order.push(entry);
        Builder {
            module,
            func,
            block: entry,
        }
    }

    /// Resume building an existing function at its last attached block.
    pub fn resume(module: &'m mut Module, func: FuncId) -> Self {
        let block = *module.funcs[func]
            .block_order
            .last()
            .expect("function has no blocks");
        Builder {
            module,
            func,
            block,
        }
    }

    pub fn current_block(&self) -> BlockId {
        self.block
    }

    fn f(&mut self) -> &mut Function {
        &mut self.module.funcs[self.func]
    }

    /// Allocate an instruction, wire operand use lists, append it to the
    /// current block.
    fn insert(&mut self, kind: InstKind, ty: Type) -> InstId {
        let block = self.block;
        assert!(
            !self.module.funcs[self.func].is_closed(block),
            "inserting an instruction into a closed block"
        );
        let func = self.f();
        let id = func.alloc_inst(Inst {
            kind,
            ty,
            block,
            users: Vec::new(),
        });
        let mut children = Vec::new();
        func.for_each_child(id, |c| children.push(c));
        for c in children {
            func.mark_used(c, id);
        }
        func.blocks[block].insts.push(id);
        id
    }

    // ── Blocks ──────────────────────────────────────────────────────────

    /// Create a detached block.
    pub fn block_create(&mut self) -> BlockId {
        self.f().alloc_block(Block {
            name: String::new(),
            insts: Vec::new(),
            attached: false,
        })
    }

    /// Attach a detached block to the current function and make it the
    /// insert point. The previous block must be closed.
    pub fn block_attach(&mut self, block: BlockId) {
        assert!(
            self.module.funcs[self.func].is_closed(self.block),
            "attaching a block while the current block is still open"
        );
        let func = self.f();
        assert!(!func.blocks[block].attached, "block attached twice");
        func.blocks[block].attached = true;
        func.block_order.push(block);
        self.block = block;
    }

    // ── Value constructors ──────────────────────────────────────────────

    pub fn immediate(&mut self, ty: Type, value: u64) -> InstId {
        self.insert(InstKind::Immediate { value }, ty)
    }

    /// Parameter instructions may only appear in the entry block.
    pub fn parameter(&mut self, index: usize) -> InstId {
        let func = &self.module.funcs[self.func];
        assert_eq!(
            self.block,
            func.entry(),
            "parameter outside the entry block"
        );
        assert!(index < func.arity(), "parameter index out of range");
        let ty = match func.ty.canonical() {
            Type::Function { params, .. } => params[index].clone(),
            _ => Type::Integer,
        };
        let id = self.insert(InstKind::Parameter { index }, ty);
        self.f().params.push(id);
        id
    }

    /// A precolored physical register value.
    pub fn register(&mut self, ty: Type, reg: u32) -> InstId {
        self.insert(InstKind::Register { reg }, ty)
    }

    pub fn stack_allocate(&mut self, ty: &Type) -> InstId {
        let size = ty.size_of();
        self.insert(InstKind::Alloca { size }, ty.clone().ptr())
    }

    pub fn static_reference(&mut self, var: StaticId) -> InstId {
        let ty = self.module.statics[var].ty.clone().ptr();
        let id = self.insert(InstKind::StaticRef { var }, ty);
        let func = self.func;
        self.module.statics[var].references.push((func, id));
        id
    }

    pub fn funcref(&mut self, func: FuncId) -> InstId {
        let ty = self.module.funcs[func].ty.clone();
        self.insert(InstKind::FuncRef { func }, ty)
    }

    // ── Memory ──────────────────────────────────────────────────────────

    pub fn load(&mut self, addr: InstId) -> InstId {
        let ty = match self.module.funcs[self.func].insts[addr].ty.canonical() {
            Type::Pointer(to) => (**to).clone(),
            other => other.clone(),
        };
        self.insert(InstKind::Load { addr }, ty)
    }

    pub fn store(&mut self, value: InstId, addr: InstId) -> InstId {
        self.insert(InstKind::Store { addr, value }, Type::Void)
    }

    // ── Arithmetic ──────────────────────────────────────────────────────

    pub fn binary(&mut self, op: BinaryOp, lhs: InstId, rhs: InstId) -> InstId {
        let ty = if op.is_comparison() {
            Type::Integer
        } else {
            self.module.funcs[self.func].insts[lhs].ty.clone()
        };
        self.insert(InstKind::Binary { op, lhs, rhs }, ty)
    }

    pub fn not(&mut self, operand: InstId) -> InstId {
        let ty = self.module.funcs[self.func].insts[operand].ty.clone();
        self.insert(InstKind::Not { operand }, ty)
    }

    pub fn copy(&mut self, source: InstId) -> InstId {
        let ty = self.module.funcs[self.func].insts[source].ty.clone();
        self.insert(InstKind::Copy { source }, ty)
    }

    pub fn sign_extend(&mut self, ty: Type, operand: InstId) -> InstId {
        self.insert(InstKind::SignExtend { operand }, ty)
    }

    pub fn zero_extend(&mut self, ty: Type, operand: InstId) -> InstId {
        self.insert(InstKind::ZeroExtend { operand }, ty)
    }

    pub fn truncate(&mut self, ty: Type, operand: InstId) -> InstId {
        self.insert(InstKind::Truncate { operand }, ty)
    }

    // ── Control flow ────────────────────────────────────────────────────

    pub fn branch(&mut self, target: BlockId) -> InstId {
        self.insert(InstKind::Branch { target }, Type::Void)
    }

    pub fn branch_conditional(
        &mut self,
        cond: InstId,
        then_block: BlockId,
        else_block: BlockId,
    ) -> InstId {
        self.insert(
            InstKind::CondBranch {
                cond,
                then_block,
                else_block,
            },
            Type::Void,
        )
    }

    pub fn ret(&mut self, value: Option<InstId>) -> InstId {
        self.insert(InstKind::Return { value }, Type::Void)
    }

    pub fn unreachable(&mut self) -> InstId {
        self.insert(InstKind::Unreachable, Type::Void)
    }

    // ── Phis ────────────────────────────────────────────────────────────

    pub fn phi(&mut self, ty: Type) -> InstId {
        self.insert(InstKind::Phi { args: Vec::new() }, ty)
    }

    /// Add an incoming edge to a phi. `block` must be a CFG predecessor of
    /// the phi's block by the time the function is complete.
    pub fn phi_argument(&mut self, phi: InstId, block: BlockId, value: InstId) {
        let func = self.f();
        match &mut func.insts[phi].kind {
            InstKind::Phi { args } => args.push(PhiArg { block, value }),
            _ => panic!("phi_argument on a non-phi instruction"),
        }
        func.mark_used(value, phi);
    }

    // ── Calls ───────────────────────────────────────────────────────────
    //
    // Calls are built detached (create, add arguments, then insert) so the
    // argument list is complete before the instruction joins a block.

    pub fn direct_call(&mut self, callee: FuncId) -> InstId {
        let ty = self.module.funcs[callee].return_type();
        let block = self.block;
        self.f().alloc_inst(Inst {
            kind: InstKind::Call {
                callee: Callee::Direct(callee),
                args: Vec::new(),
                tail: false,
            },
            ty,
            block,
            users: Vec::new(),
        })
    }

    pub fn indirect_call(&mut self, callee: InstId) -> InstId {
        let ty = match self.module.funcs[self.func].insts[callee].ty.canonical() {
            Type::Function { ret, .. } => (**ret).clone(),
            _ => Type::Integer,
        };
        let block = self.block;
        let id = self.f().alloc_inst(Inst {
            kind: InstKind::Call {
                callee: Callee::Indirect(callee),
                args: Vec::new(),
                tail: false,
            },
            ty,
            block,
            users: Vec::new(),
        });
        self.f().mark_used(callee, id);
        id
    }

    pub fn add_argument(&mut self, call: InstId, arg: InstId) {
        let func = self.f();
        match &mut func.insts[call].kind {
            InstKind::Call { args, .. } => args.push(arg),
            _ => panic!("add_argument on a non-call instruction"),
        }
        func.mark_used(arg, call);
    }

    /// Attach a call built with [`direct_call`](Self::direct_call) /
    /// [`indirect_call`](Self::indirect_call) at the insert point.
    pub fn insert_call(&mut self, call: InstId) {
        let block = self.block;
        assert!(
            !self.module.funcs[self.func].is_closed(block),
            "inserting a call into a closed block"
        );
        let func = self.f();
        func.insts[call].block = block;
        func.blocks[block].insts.push(call);
    }
}

// ─── Display ────────────────────────────────────────────────────────────────

/// Per-function value numbering used by the textual form.
pub fn number_insts(func: &Function) -> Vec<Option<u32>> {
    let mut numbers = vec![None; func.insts.len()];
    let mut next = 0u32;
    for &b in &func.block_order {
        for &i in &func.blocks[b].insts {
            if func.insts[i].kind.yields_value() {
                numbers[i.index()] = Some(next);
                next += 1;
            }
        }
    }
    numbers
}

fn block_number(func: &Function, block: BlockId) -> usize {
    func.block_order
        .iter()
        .position(|&b| b == block)
        .unwrap_or(usize::MAX)
}

struct InstDisplay<'a> {
    module: &'a Module,
    func: &'a Function,
    numbers: &'a [Option<u32>],
    inst: InstId,
}

impl fmt::Display for InstDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let func = self.func;
        let val = |i: InstId| -> String {
            match self.numbers[i.index()] {
                Some(n) => format!("%{n}"),
                None => "%?".to_owned(),
            }
        };
        let bb = |b: BlockId| format!("bb{}", block_number(func, b));
        let inst = &func.insts[self.inst];
        if inst.kind.yields_value() {
            write!(f, "{} = ", val(self.inst))?;
        }
        match &inst.kind {
            InstKind::Immediate { value } => write!(f, "imm {value}"),
            InstKind::Parameter { index } => write!(f, "param {index}"),
            InstKind::Register { reg } => write!(f, "reg {reg}"),
            InstKind::Alloca { size } => write!(f, "alloca {size}"),
            InstKind::StaticRef { var } => {
                write!(f, "static.ref {}", self.module.statics[*var].name)
            }
            InstKind::FuncRef { func: target } => {
                write!(f, "func.ref {}", self.module.funcs[*target].name)
            }
            InstKind::LitInteger { value } => write!(f, "lit.int {value}"),
            InstKind::LitString { value } => write!(f, "lit.str {value:?}"),
            InstKind::Load { addr } => write!(f, "load {}", val(*addr)),
            InstKind::Store { addr, value } => {
                write!(f, "store {}, {}", val(*value), val(*addr))
            }
            InstKind::Binary { op, lhs, rhs } => {
                write!(f, "{} {}, {}", op.mnemonic(), val(*lhs), val(*rhs))
            }
            InstKind::Not { operand } => write!(f, "not {}", val(*operand)),
            InstKind::Copy { source } => write!(f, "copy {}", val(*source)),
            InstKind::SignExtend { operand } => write!(f, "sext {}", val(*operand)),
            InstKind::ZeroExtend { operand } => write!(f, "zext {}", val(*operand)),
            InstKind::Truncate { operand } => write!(f, "trunc {}", val(*operand)),
            InstKind::Branch { target } => write!(f, "branch {}", bb(*target)),
            InstKind::CondBranch {
                cond,
                then_block,
                else_block,
            } => write!(
                f,
                "cbranch {}, {}, {}",
                val(*cond),
                bb(*then_block),
                bb(*else_block)
            ),
            InstKind::Return { value: Some(v) } => write!(f, "return {}", val(*v)),
            InstKind::Return { value: None } => write!(f, "return"),
            InstKind::Unreachable => write!(f, "unreachable"),
            InstKind::Call { callee, args, tail } => {
                match callee {
                    Callee::Direct(target) => {
                        write!(f, "call {}(", self.module.funcs[*target].name)?
                    }
                    Callee::Indirect(c) => write!(f, "call {}(", val(*c))?,
                }
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", val(*a))?;
                }
                write!(f, ")")?;
                if *tail {
                    write!(f, " tail")?;
                }
                Ok(())
            }
            InstKind::Phi { args } => {
                write!(f, "phi")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " [{}: {}]", bb(a.block), val(a.value))?;
                }
                Ok(())
            }
        }
    }
}

/// Prints a function in the textual form `ir_parse` reads back.
pub struct FunctionDisplay<'a> {
    pub module: &'a Module,
    pub func: FuncId,
}

impl fmt::Display for FunctionDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let func = &self.module.funcs[self.func];
        let numbers = number_insts(func);
        write!(f, "defun {}", func.name)?;
        let mut attrs = Vec::new();
        if func.attrs.global {
            attrs.push("global");
        }
        if func.attrs.is_extern {
            attrs.push("extern");
        }
        if func.attrs.noreturn {
            attrs.push("noreturn");
        }
        if !attrs.is_empty() {
            write!(f, " [{}]", attrs.join(","))?;
        }
        writeln!(f, " : {} {{", func.ty)?;
        for (bi, &b) in func.block_order.iter().enumerate() {
            writeln!(f, "  bb{bi}:")?;
            for &i in &func.blocks[b].insts {
                writeln!(
                    f,
                    "    {}",
                    InstDisplay {
                        module: self.module,
                        func,
                        numbers: &numbers,
                        inst: i,
                    }
                )?;
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (_, var) in self.statics.iter() {
            write!(f, "static {} : {}", var.name, var.ty)?;
            match &var.init {
                Some(StaticInit::Int(v)) => writeln!(f, " = {v}")?,
                Some(StaticInit::Str(s)) => writeln!(f, " = {s:?}")?,
                None => writeln!(f)?,
            }
        }
        for id in self.funcs.ids() {
            write!(
                f,
                "{}",
                FunctionDisplay {
                    module: self,
                    func: id
                }
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int() -> Type {
        Type::Integer
    }

    fn func_ty(arity: usize) -> Type {
        Type::Function {
            ret: Box::new(int()),
            params: vec![int(); arity],
        }
    }

    #[test]
    fn use_lists_track_operands() {
        let mut module = Module::new();
        let mut b = Builder::function(&mut module, "f", func_ty(0));
        let one = b.immediate(int(), 1);
        let two = b.immediate(int(), 2);
        let sum = b.binary(BinaryOp::Add, one, two);
        b.ret(Some(sum));
        let fid = b.func;
        let f = &module.funcs[fid];
        assert_eq!(f.insts[one].users, vec![sum]);
        assert_eq!(f.insts[two].users, vec![sum]);
        assert_eq!(f.insts[sum].users.len(), 1); // the return
    }

    #[test]
    fn replace_uses_preserves_biconditional() {
        let mut module = Module::new();
        let mut b = Builder::function(&mut module, "f", func_ty(0));
        let one = b.immediate(int(), 1);
        let two = b.immediate(int(), 2);
        let three = b.immediate(int(), 3);
        let sum = b.binary(BinaryOp::Add, one, one);
        b.ret(Some(sum));
        let func_id = b.func;
        let f = &mut module.funcs[func_id];
        f.replace_uses(one, three);
        assert!(f.insts[one].users.is_empty());
        assert_eq!(f.insts[three].users, vec![sum, sum]);
        match f.insts[sum].kind {
            InstKind::Binary { lhs, rhs, .. } => {
                assert_eq!(lhs, three);
                assert_eq!(rhs, three);
            }
            _ => unreachable!(),
        }
        // `two` never had users.
        assert!(f.insts[two].users.is_empty());
    }

    #[test]
    fn remove_frees_slot_for_reuse() {
        let mut module = Module::new();
        let mut b = Builder::function(&mut module, "f", func_ty(0));
        let dead = b.immediate(int(), 1);
        let live = b.immediate(int(), 2);
        b.ret(Some(live));
        let func_id = b.func;
        let count_before = module.funcs[func_id].insts.len();
        module.funcs[func_id].remove(dead);
        // A new function-local allocation reuses the freed slot.
        let f = &mut module.funcs[func_id];
        let entry = f.entry();
        let reused = f.alloc_inst(Inst {
            kind: InstKind::Immediate { value: 9 },
            ty: int(),
            block: entry,
            users: Vec::new(),
        });
        assert_eq!(reused, dead);
        assert_eq!(module.funcs[func_id].insts.len(), count_before);
    }

    #[test]
    #[should_panic(expected = "closed block")]
    fn inserting_past_terminator_panics() {
        let mut module = Module::new();
        let mut b = Builder::function(&mut module, "f", func_ty(0));
        let v = b.immediate(int(), 0);
        b.ret(Some(v));
        b.immediate(int(), 1);
    }

    #[test]
    fn every_block_has_one_terminator() {
        let mut module = Module::new();
        let mut b = Builder::function(&mut module, "f", func_ty(0));
        let exit = b.block_create();
        let v = b.immediate(int(), 0);
        b.branch(exit);
        b.block_attach(exit);
        b.ret(Some(v));
        let fid = b.func;
        let f = &module.funcs[fid];
        for &blk in &f.block_order {
            let terms = f.blocks[blk]
                .insts
                .iter()
                .filter(|&&i| f.insts[i].kind.is_terminator())
                .count();
            assert_eq!(terms, 1);
            assert!(f.is_closed(blk));
        }
    }

    #[test]
    fn mark_unreachable_prunes_phis() {
        let mut module = Module::new();
        let mut b = Builder::function(&mut module, "f", func_ty(0));
        let then_b = b.block_create();
        let else_b = b.block_create();
        let join = b.block_create();
        let cond = b.immediate(int(), 1);
        b.branch_conditional(cond, then_b, else_b);
        b.block_attach(then_b);
        let v1 = b.immediate(int(), 1);
        b.branch(join);
        b.block_attach(else_b);
        let v2 = b.immediate(int(), 2);
        b.branch(join);
        b.block_attach(join);
        let phi = b.phi(int());
        b.phi_argument(phi, then_b, v1);
        b.phi_argument(phi, else_b, v2);
        b.ret(Some(phi));
        let func_id = b.func;
        let f = &mut module.funcs[func_id];
        f.mark_unreachable(else_b);
        match &f.insts[phi].kind {
            InstKind::Phi { args } => {
                assert_eq!(args.len(), 1);
                assert_eq!(args[0].value, v1);
            }
            _ => unreachable!(),
        }
        assert!(f.insts[v2].users.is_empty());
        // The block now ends in unreachable.
        let last = *f.blocks[else_b].insts.last().unwrap();
        assert!(matches!(f.insts[last].kind, InstKind::Unreachable));
    }

    #[test]
    fn phi_predecessor_invariant_holds_for_if_shape() {
        let mut module = Module::new();
        let mut b = Builder::function(&mut module, "f", func_ty(0));
        let then_b = b.block_create();
        let else_b = b.block_create();
        let join = b.block_create();
        let cond = b.immediate(int(), 1);
        b.branch_conditional(cond, then_b, else_b);
        b.block_attach(then_b);
        let v1 = b.immediate(int(), 1);
        b.branch(join);
        b.block_attach(else_b);
        let v2 = b.immediate(int(), 2);
        b.branch(join);
        b.block_attach(join);
        let phi = b.phi(int());
        b.phi_argument(phi, then_b, v1);
        b.phi_argument(phi, else_b, v2);
        b.ret(Some(phi));
        let fid = b.func;
        let f = &module.funcs[fid];
        match &f.insts[phi].kind {
            InstKind::Phi { args } => {
                for a in args {
                    assert!(f.is_predecessor(a.block, join));
                }
            }
            _ => unreachable!(),
        }
    }
}
