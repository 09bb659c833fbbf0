//! Lowering and instruction selection: IR → machine IR.
//!
//! Lowering walks each function in block order, materializing one machine
//! instruction per IR value and memoizing the virtual register it lands
//! in; re-demanding a lowered value only bumps a reference count. Phis
//! lower to copies in their predecessors, call arguments to copies into
//! ABI registers, allocas to frame objects.
//!
//! Selection then rewrites the target-neutral stream into x86-64
//! instructions: a table of operand-constrained patterns is tried first
//! (longest first, optionally matching commutatively), and a one-to-one
//! default lowering covers everything the table does not.

use crate::arch::x64::{Cond, X64Op};
use crate::arch::MachineDesc;
use crate::ir::{BinaryOp, Callee, FuncId, InstId, InstKind, Module};
use crate::mir::{MInst, MachineOperand, MirBlock, MirFunction, Opcode, Reg, RegSize};
use crate::CompileError;

use MachineOperand as Op;

// ─── Lowering ───────────────────────────────────────────────────────────────

struct Lowering<'m> {
    module: &'m Module,
    func: FuncId,
    desc: &'static MachineDesc,
    mf: MirFunction,
    /// Virtual register each lowered IR value lives in.
    memo: Vec<Option<Reg>>,
    /// Where each lowered value's defining instruction sits, for
    /// reference counting.
    def_pos: Vec<Option<(usize, usize)>>,
    /// Frame object index per alloca.
    frame_slot: Vec<Option<usize>>,
    cur_block: usize,
}

/// Lower one IR function to machine IR with virtual registers.
pub fn lower_function(
    module: &Module,
    func: FuncId,
    desc: &'static MachineDesc,
    optimize: bool,
) -> Result<MirFunction, CompileError> {
    let f = &module.funcs[func];
    let mut mf = MirFunction::new(func, f.name.clone());
    mf.is_extern = f.attrs.is_extern;
    if f.attrs.is_extern {
        return Ok(mf);
    }
    log::trace!("isel: lowering {}", f.name);

    for &b in &f.block_order {
        mf.blocks.push(MirBlock {
            name: String::new(),
            origin: Some(b),
            insts: Vec::new(),
        });
    }

    let mut lowering = Lowering {
        module,
        func,
        desc,
        mf,
        memo: vec![None; f.insts.len()],
        def_pos: vec![None; f.insts.len()],
        frame_slot: vec![None; f.insts.len()],
        cur_block: 0,
    };
    lowering.prepass();
    lowering.walk()?;
    lowering.lower_phis();

    let mut mf = lowering.mf;
    select_instructions(&mut mf, desc, optimize);
    Ok(mf)
}

impl Lowering<'_> {
    fn f(&self) -> &crate::ir::Function {
        &self.module.funcs[self.func]
    }

    fn mir_block_of(&self, block: crate::ir::BlockId) -> usize {
        self.f()
            .block_order
            .iter()
            .position(|&b| b == block)
            .expect("branch to a detached block")
    }

    /// Assign phi virtual registers and alloca frame slots before the
    /// main walk, so forward references resolve.
    fn prepass(&mut self) {
        let f = self.f();
        let mut slots = Vec::new();
        let mut phis = Vec::new();
        for &b in &f.block_order {
            for &i in &f.blocks[b].insts {
                match &f.insts[i].kind {
                    InstKind::Alloca { size } => slots.push((i, *size)),
                    InstKind::Phi { .. } => phis.push((i, f.insts[i].ty.size_of())),
                    _ => {}
                }
            }
        }
        for (i, size) in slots {
            self.frame_slot[i.index()] = Some(self.mf.push_frame_object(size));
        }
        for (i, size) in phis {
            let vreg = self.mf.new_vreg(RegSize::from_bytes(size));
            self.memo[i.index()] = Some(vreg);
        }
    }

    /// Append a machine instruction to the current block, recording the
    /// defining position of `origin` when given.
    fn push(&mut self, origin: Option<InstId>, mi: MInst) {
        let bi = self.cur_block;
        let pos = self.mf.blocks[bi].insts.len();
        if let Some(origin) = origin {
            self.def_pos[origin.index()] = Some((bi, pos));
        }
        self.mf.blocks[bi].insts.push(mi);
    }

    /// The virtual register holding `id`'s value. A repeat demand bumps
    /// the defining instruction's reference count; allocas materialize
    /// their address on first demand.
    fn value(&mut self, id: InstId) -> Reg {
        if let Some(reg) = self.memo[id.index()] {
            if let Some((b, i)) = self.def_pos[id.index()] {
                self.mf.blocks[b].insts[i].refcount += 1;
            }
            return reg;
        }
        match &self.f().insts[id].kind {
            InstKind::Alloca { .. } => {
                let slot = self.frame_slot[id.index()].expect("alloca without a frame slot");
                let dst = self.mf.new_vreg(RegSize::R64);
                self.push(
                    Some(id),
                    MInst::new(Opcode::Alloca, Some(dst), vec![Op::Local(slot)]),
                );
                self.memo[id.index()] = Some(dst);
                dst
            }
            other => panic!("value demanded before definition: {other:?}"),
        }
    }

    fn walk(&mut self) -> Result<(), CompileError> {
        let f = self.f();
        let order: Vec<Vec<InstId>> = f
            .block_order
            .iter()
            .map(|&b| f.blocks[b].insts.clone())
            .collect();
        for (bi, insts) in order.into_iter().enumerate() {
            self.cur_block = bi;
            for id in insts {
                self.lower_inst(id)?;
            }
        }
        Ok(())
    }

    fn lower_inst(&mut self, id: InstId) -> Result<(), CompileError> {
        let kind = self.f().insts[id].kind.clone();
        let ty_size = self.f().insts[id].ty.size_of();
        match kind {
            // Allocas are materialized lazily; phis were pre-assigned and
            // emit nothing themselves; literal payloads never execute.
            InstKind::Alloca { .. }
            | InstKind::Phi { .. }
            | InstKind::LitInteger { .. }
            | InstKind::LitString { .. } => {}

            InstKind::Immediate { value } => {
                let size = if value <= u32::MAX as u64 {
                    RegSize::R32
                } else {
                    RegSize::R64
                };
                let dst = self.mf.new_vreg(size);
                self.push(
                    Some(id),
                    MInst::new(Opcode::Imm, Some(dst), vec![Op::Imm(value as i64)]),
                );
                self.memo[id.index()] = Some(dst);
            }

            InstKind::Parameter { index } => {
                if index >= self.desc.argument_registers.len() {
                    return Err(CompileError::Unsupported {
                        what: format!(
                            "stack-passed argument {index} of {}",
                            self.f().name
                        ),
                    });
                }
                let src = Reg::new(self.desc.argument_registers[index].value(), RegSize::R64);
                let dst = self.mf.new_vreg(RegSize::R64);
                self.push(
                    Some(id),
                    MInst::new(Opcode::Copy, Some(dst), vec![Op::Reg(src)]),
                );
                self.memo[id.index()] = Some(dst);
            }

            InstKind::Register { reg } => {
                self.memo[id.index()] = Some(Reg::new(reg, RegSize::R64));
            }

            InstKind::StaticRef { var } => {
                let dst = self.mf.new_vreg(RegSize::R64);
                self.push(
                    Some(id),
                    MInst::new(Opcode::Copy, Some(dst), vec![Op::Static(var)]),
                );
                self.memo[id.index()] = Some(dst);
            }

            InstKind::FuncRef { func } => {
                let dst = self.mf.new_vreg(RegSize::R64);
                self.push(
                    Some(id),
                    MInst::new(Opcode::Copy, Some(dst), vec![Op::Func(func)]),
                );
                self.memo[id.index()] = Some(dst);
            }

            InstKind::Load { addr } => {
                // Loads of aggregate values decay to the address itself.
                if matches!(
                    self.f().insts[id].ty.canonical(),
                    crate::ast::Type::Array { .. }
                ) {
                    let reg = self.addr_value(addr);
                    self.memo[id.index()] = Some(reg);
                    return Ok(());
                }
                let size = RegSize::from_bytes(ty_size);
                let dst = self.mf.new_vreg(size);
                let addr_op = self.addr_operand(addr);
                self.push(Some(id), MInst::new(Opcode::Load, Some(dst), vec![addr_op]));
                self.memo[id.index()] = Some(dst);
            }

            InstKind::Store { addr, value } => {
                let vsize = RegSize::from_bytes(self.f().insts[value].ty.size_of().max(1));
                let mut v = self.value(value);
                v.size = vsize;
                let addr_op = self.addr_operand(addr);
                self.push(
                    Some(id),
                    MInst::new(Opcode::Store, None, vec![Op::Reg(v), addr_op]),
                );
            }

            InstKind::Binary { op, lhs, rhs } => {
                let l = self.value(lhs);
                let r = self.value(rhs);
                let dst = self.mf.new_vreg(RegSize::R64);
                self.push(
                    Some(id),
                    MInst::new(Opcode::Bin(op), Some(dst), vec![Op::Reg(l), Op::Reg(r)]),
                );
                self.memo[id.index()] = Some(dst);
            }

            InstKind::Not { operand } => {
                let src = self.value(operand);
                let dst = self.mf.new_vreg(RegSize::R64);
                self.push(
                    Some(id),
                    MInst::new(Opcode::Not, Some(dst), vec![Op::Reg(src)]),
                );
                self.memo[id.index()] = Some(dst);
            }

            InstKind::Copy { source } => {
                let src = self.value(source);
                // A copy that feeds a phi shares the phi's register.
                let phi_user = {
                    let f = self.f();
                    f.insts[id]
                        .users
                        .iter()
                        .find(|&&u| matches!(f.insts[u].kind, InstKind::Phi { .. }))
                        .copied()
                };
                let dst = match phi_user {
                    Some(phi) => self.memo[phi.index()].expect("phi without a register"),
                    None => self.mf.new_vreg(src.size),
                };
                self.push(
                    Some(id),
                    MInst::new(Opcode::Copy, Some(dst), vec![Op::Reg(src)]),
                );
                self.memo[id.index()] = Some(dst);
            }

            InstKind::SignExtend { operand } => {
                self.lower_extend(id, operand, Opcode::SExt, ty_size)
            }
            InstKind::ZeroExtend { operand } => {
                self.lower_extend(id, operand, Opcode::ZExt, ty_size)
            }
            InstKind::Truncate { operand } => {
                self.lower_extend(id, operand, Opcode::Trunc, ty_size)
            }

            InstKind::Branch { target } => {
                let t = self.mir_block_of(target);
                self.push(None, MInst::new(Opcode::Branch, None, vec![Op::Block(t)]));
            }

            InstKind::CondBranch {
                cond,
                then_block,
                else_block,
            } => {
                let c = self.value(cond);
                let t = self.mir_block_of(then_block);
                let e = self.mir_block_of(else_block);
                self.push(
                    None,
                    MInst::new(
                        Opcode::CondBranch,
                        None,
                        vec![Op::Reg(c), Op::Block(t), Op::Block(e)],
                    ),
                );
            }

            InstKind::Return { value } => {
                let operands = match value {
                    Some(v) => vec![Op::Reg(self.value(v))],
                    None => Vec::new(),
                };
                self.push(None, MInst::new(Opcode::Return, None, operands));
            }

            InstKind::Unreachable => {
                self.push(None, MInst::new(Opcode::Machine(X64Op::Ud2), None, vec![]));
            }

            InstKind::Call { callee, args, tail } => {
                if args.len() > self.desc.argument_registers.len() {
                    return Err(CompileError::Unsupported {
                        what: format!(
                            "stack-passed call arguments ({} arguments to {})",
                            args.len(),
                            self.f().name
                        ),
                    });
                }
                let arg_vals: Vec<Reg> = args.iter().map(|&a| self.value(a)).collect();
                let callee_op = match callee {
                    Callee::Direct(f) => Op::Func(f),
                    Callee::Indirect(c) => Op::Reg(self.value(c)),
                };
                // Materialize each argument into its ABI register just
                // before the call.
                let mut operands = vec![callee_op];
                for (i, v) in arg_vals.into_iter().enumerate() {
                    let phys = Reg::new(self.desc.argument_registers[i].value(), RegSize::R64);
                    self.push(None, MInst::new(Opcode::Copy, Some(phys), vec![Op::Reg(v)]));
                    operands.push(Op::Reg(phys));
                }
                self.mf.is_leaf = false;
                if tail {
                    // Tail calls jump out of the frame; emission unwinds
                    // first.
                    let target = operands.remove(0);
                    self.push(None, MInst::new(Opcode::Machine(X64Op::Jmp), None, vec![target]));
                } else {
                    let dst = self.mf.new_vreg(RegSize::R64);
                    self.push(Some(id), MInst::new(Opcode::Call, Some(dst), operands));
                    self.memo[id.index()] = Some(dst);
                }
            }
        }
        Ok(())
    }

    fn lower_extend(&mut self, id: InstId, operand: InstId, op: Opcode, ty_size: u64) {
        let src_size = RegSize::from_bytes(self.f().insts[operand].ty.size_of().max(1));
        let mut src = self.value(operand);
        src.size = src_size;
        let dst = self.mf.new_vreg(RegSize::from_bytes(ty_size.max(1)));
        self.push(Some(id), MInst::new(op, Some(dst), vec![Op::Reg(src)]));
        self.memo[id.index()] = Some(dst);
    }

    /// Memory operand for a load/store address: allocas and static
    /// references fold into direct frame/symbol operands, anything else
    /// is a register indirection.
    fn addr_operand(&mut self, addr: InstId) -> Op {
        match self.f().insts[addr].kind {
            InstKind::Alloca { .. } => {
                Op::Local(self.frame_slot[addr.index()].expect("alloca without a frame slot"))
            }
            InstKind::StaticRef { var } => Op::Static(var),
            _ => Op::Reg(self.value(addr)),
        }
    }

    /// The address of `addr` as a register value (for array decay).
    fn addr_value(&mut self, addr: InstId) -> Reg {
        self.value(addr)
    }

    /// Insert phi-argument copies at the end of each predecessor, before
    /// its terminator. The phi itself emits nothing.
    fn lower_phis(&mut self) {
        let f = &self.module.funcs[self.func];
        let mut copies: Vec<(usize, Reg, Reg)> = Vec::new();
        for &b in &f.block_order {
            for &i in &f.blocks[b].insts {
                let InstKind::Phi { args } = &f.insts[i].kind else {
                    continue;
                };
                let dst = self.memo[i.index()].expect("phi without a register");
                for arg in args {
                    let src = self.memo[arg.value.index()].expect("phi argument not lowered");
                    if src == dst {
                        // A copy feeding the phi already shares its register.
                        continue;
                    }
                    let pred = f
                        .block_order
                        .iter()
                        .position(|&blk| blk == arg.block)
                        .expect("phi argument from a detached block");
                    copies.push((pred, dst, src));
                }
            }
        }
        for (pred, dst, src) in copies {
            let at = self.mf.blocks[pred].terminator_index();
            self.mf.blocks[pred]
                .insts
                .insert(at, MInst::new(Opcode::Copy, Some(dst), vec![Op::Reg(src)]));
        }
    }
}

// ─── Instruction selection ──────────────────────────────────────────────────

/// Operand constraint inside a pattern.
#[derive(Debug, Clone, Copy)]
enum OperandPat {
    Any,
    /// An immediate within the inclusive range.
    ImmRange(i64, i64),
    /// The register defined by an earlier instruction in the window.
    DefOf(usize),
    /// A frame-object operand.
    Local,
}

/// Opcode constraint for one instruction in a pattern window.
#[derive(Debug, Clone, Copy)]
enum OpcodePat {
    Imm,
    Bin(&'static [BinaryOp]),
    Store,
}

struct InstPat {
    opcode: OpcodePat,
    operands: &'static [OperandPat],
    /// Require the instruction's value to have exactly one consumer.
    used_once: bool,
}

struct Pattern {
    insts: &'static [InstPat],
    /// Try the final instruction's first two operands in either order.
    commutative: bool,
    emit: fn(&[MInst], &'static MachineDesc) -> Vec<MInst>,
}

const I32_MIN: i64 = i32::MIN as i64;
const I32_MAX: i64 = i32::MAX as i64;

/// The pattern table, longest patterns first. Anything unmatched falls
/// through to [`default_lower`].
static PATTERNS: &[Pattern] = &[
    // imm ⊕ reg, for commutative ops: fold the immediate into the
    // operation.
    Pattern {
        insts: &[
            InstPat {
                opcode: OpcodePat::Imm,
                operands: &[OperandPat::ImmRange(I32_MIN, I32_MAX)],
                used_once: true,
            },
            InstPat {
                opcode: OpcodePat::Bin(&[BinaryOp::Add, BinaryOp::Mul, BinaryOp::And, BinaryOp::Or]),
                operands: &[OperandPat::DefOf(0), OperandPat::Any],
                used_once: false,
            },
        ],
        commutative: true,
        emit: emit_imm_binop,
    },
    // reg − imm: subtraction folds only on the right.
    Pattern {
        insts: &[
            InstPat {
                opcode: OpcodePat::Imm,
                operands: &[OperandPat::ImmRange(I32_MIN, I32_MAX)],
                used_once: true,
            },
            InstPat {
                opcode: OpcodePat::Bin(&[BinaryOp::Sub]),
                operands: &[OperandPat::Any, OperandPat::DefOf(0)],
                used_once: false,
            },
        ],
        commutative: false,
        emit: emit_imm_binop,
    },
    // reg ⋈ imm comparison: compare against the immediate directly.
    Pattern {
        insts: &[
            InstPat {
                opcode: OpcodePat::Imm,
                operands: &[OperandPat::ImmRange(I32_MIN, I32_MAX)],
                used_once: true,
            },
            InstPat {
                opcode: OpcodePat::Bin(&[
                    BinaryOp::Lt,
                    BinaryOp::Le,
                    BinaryOp::Gt,
                    BinaryOp::Ge,
                    BinaryOp::Eq,
                    BinaryOp::Ne,
                ]),
                operands: &[OperandPat::Any, OperandPat::DefOf(0)],
                used_once: false,
            },
        ],
        commutative: false,
        emit: emit_imm_compare,
    },
    // store of an immediate into a frame slot.
    Pattern {
        insts: &[
            InstPat {
                opcode: OpcodePat::Imm,
                operands: &[OperandPat::ImmRange(I32_MIN, I32_MAX)],
                used_once: true,
            },
            InstPat {
                opcode: OpcodePat::Store,
                operands: &[OperandPat::DefOf(0), OperandPat::Local],
                used_once: false,
            },
        ],
        commutative: false,
        emit: emit_imm_store,
    },
];

fn pattern_imm(window: &[MInst]) -> i64 {
    match window[0].operands[0] {
        Op::Imm(v) => v,
        _ => unreachable!("pattern guaranteed an immediate"),
    }
}

fn emit_imm_binop(window: &[MInst], _desc: &'static MachineDesc) -> Vec<MInst> {
    let imm = pattern_imm(window);
    let bin = &window[1];
    let Opcode::Bin(op) = bin.opcode else {
        unreachable!()
    };
    let dst = bin.dst.expect("binary op without a destination");
    let imm_def = window[0].dst.expect("imm without a destination");
    // The register operand is whichever side is not the folded immediate.
    let other = bin
        .operands
        .iter()
        .find_map(|o| match o {
            Op::Reg(r) if *r != imm_def => Some(*r),
            _ => None,
        })
        .expect("no register operand left after folding");
    let x64 = match op {
        BinaryOp::Add => X64Op::Add,
        BinaryOp::Sub => X64Op::Sub,
        BinaryOp::Mul => X64Op::Imul,
        BinaryOp::And => X64Op::And,
        BinaryOp::Or => X64Op::Or,
        _ => unreachable!(),
    };
    vec![
        MInst::new(
            Opcode::Machine(X64Op::Mov),
            None,
            vec![Op::Reg(other), Op::Reg(dst)],
        ),
        MInst::new(
            Opcode::Machine(x64),
            None,
            vec![Op::Imm(imm), Op::Reg(dst)],
        ),
    ]
}

fn emit_imm_compare(window: &[MInst], _desc: &'static MachineDesc) -> Vec<MInst> {
    let imm = pattern_imm(window);
    let bin = &window[1];
    let Opcode::Bin(op) = bin.opcode else {
        unreachable!()
    };
    let dst = bin.dst.expect("comparison without a destination");
    let lhs = match bin.operands[0] {
        Op::Reg(r) => r,
        _ => unreachable!(),
    };
    vec![
        MInst::new(
            Opcode::Machine(X64Op::Cmp),
            None,
            vec![Op::Imm(imm), Op::Reg(lhs)],
        ),
        MInst::new(
            Opcode::Machine(X64Op::Mov),
            None,
            vec![Op::Imm(0), Op::Reg(Reg::new(dst.value, RegSize::R32))],
        ),
        MInst::new(
            Opcode::Machine(X64Op::Setcc),
            None,
            vec![
                Op::Imm(compare_cond(op).to_imm()),
                Op::Reg(Reg::new(dst.value, RegSize::R8)),
            ],
        ),
    ]
}

fn emit_imm_store(window: &[MInst], _desc: &'static MachineDesc) -> Vec<MInst> {
    let imm = pattern_imm(window);
    let slot = match window[1].operands[1] {
        Op::Local(l) => l,
        _ => unreachable!(),
    };
    vec![MInst::new(
        Opcode::Machine(X64Op::Mov),
        None,
        vec![Op::Imm(imm), Op::Local(slot)],
    )]
}

fn compare_cond(op: BinaryOp) -> Cond {
    match op {
        BinaryOp::Eq => Cond::E,
        BinaryOp::Ne => Cond::Ne,
        BinaryOp::Gt => Cond::G,
        BinaryOp::Lt => Cond::L,
        BinaryOp::Ge => Cond::Ge,
        BinaryOp::Le => Cond::Le,
        _ => panic!("{op:?} is not a comparison"),
    }
}

fn operand_matches(pat: OperandPat, operand: &MachineOperand, window: &[MInst]) -> bool {
    match pat {
        OperandPat::Any => true,
        OperandPat::ImmRange(min, max) => {
            matches!(operand, Op::Imm(v) if (min..=max).contains(v))
        }
        OperandPat::DefOf(idx) => {
            let def = window.get(idx).and_then(|mi| mi.dst);
            matches!((operand, def), (Op::Reg(r), Some(d)) if *r == d)
        }
        OperandPat::Local => matches!(operand, Op::Local(_)),
    }
}

fn inst_matches(pat: &InstPat, mi: &MInst, window: &[MInst], commutative: bool) -> bool {
    let opcode_ok = match pat.opcode {
        OpcodePat::Imm => mi.opcode == Opcode::Imm,
        OpcodePat::Bin(ops) => matches!(mi.opcode, Opcode::Bin(op) if ops.contains(&op)),
        OpcodePat::Store => mi.opcode == Opcode::Store,
    };
    if !opcode_ok || pat.used_once && mi.refcount != 1 {
        return false;
    }
    if mi.operands.len() < pat.operands.len() {
        return false;
    }
    let direct = pat
        .operands
        .iter()
        .zip(&mi.operands)
        .all(|(p, o)| operand_matches(*p, o, window));
    if direct {
        return true;
    }
    // Commutative patterns may match the first two operands swapped.
    if commutative && pat.operands.len() >= 2 && mi.operands.len() >= 2 {
        let mut swapped: Vec<&MachineOperand> = mi.operands.iter().collect();
        swapped.swap(0, 1);
        return pat
            .operands
            .iter()
            .zip(swapped)
            .all(|(p, o)| operand_matches(*p, o, window));
    }
    false
}

fn try_patterns(
    insts: &[MInst],
    at: usize,
    desc: &'static MachineDesc,
) -> Option<(usize, Vec<MInst>)> {
    'patterns: for pattern in PATTERNS {
        let len = pattern.insts.len();
        if at + len > insts.len() {
            continue;
        }
        let window = &insts[at..at + len];
        for (i, pat) in pattern.insts.iter().enumerate() {
            // Only the last instruction of a pattern may match
            // commutatively.
            let comm = pattern.commutative && i == len - 1;
            if !inst_matches(pat, &window[i], &window[..i], comm) {
                continue 'patterns;
            }
        }
        return Some((len, (pattern.emit)(window, desc)));
    }
    None
}

/// Rewrite every generic instruction in `mf` into x86-64 instructions.
pub fn select_instructions(mf: &mut MirFunction, desc: &'static MachineDesc, optimize: bool) {
    let rax = desc.result_register.value();
    let nblocks = mf.blocks.len();
    for bi in 0..nblocks {
        let insts = std::mem::take(&mut mf.blocks[bi].insts);
        let mut out = Vec::with_capacity(insts.len());
        let mut i = 0;
        while i < insts.len() {
            if insts[i].opcode.is_generic() {
                if let Some((consumed, emitted)) = try_patterns(&insts, i, desc) {
                    out.extend(emitted);
                    i += consumed;
                    continue;
                }
            }
            default_lower(&insts[i], bi, rax, optimize, &mut out);
            i += 1;
        }
        mf.blocks[bi].insts = out;
    }
}

/// One-to-one lowering used when no pattern matches.
fn default_lower(mi: &MInst, block: usize, rax: u32, optimize: bool, out: &mut Vec<MInst>) {
    let machine = |op: X64Op, operands: Vec<MachineOperand>| {
        MInst::new(Opcode::Machine(op), None, operands)
    };
    match mi.opcode {
        Opcode::Machine(_) => out.push(mi.clone()),

        Opcode::Imm => {
            let dst = mi.dst.expect("imm without a destination");
            out.push(machine(
                X64Op::Mov,
                vec![mi.operands[0].clone(), Op::Reg(dst)],
            ));
        }

        Opcode::Copy => {
            let dst = mi.dst.expect("copy without a destination");
            match &mi.operands[0] {
                Op::Reg(src) => out.push(machine(X64Op::Mov, vec![Op::Reg(*src), Op::Reg(dst)])),
                Op::Static(s) => out.push(machine(X64Op::Lea, vec![Op::Static(*s), Op::Reg(dst)])),
                Op::Func(f) => out.push(machine(X64Op::Lea, vec![Op::Func(*f), Op::Reg(dst)])),
                other => panic!("copy of {other}"),
            }
        }

        Opcode::Alloca => {
            let dst = mi.dst.expect("alloca without a destination");
            out.push(machine(X64Op::Lea, vec![mi.operands[0].clone(), Op::Reg(dst)]));
        }

        Opcode::Load => {
            let dst = mi.dst.expect("load without a destination");
            // Narrow destinations are zeroed before the partial move.
            if dst.size == RegSize::R8 || dst.size == RegSize::R16 {
                out.push(machine(
                    X64Op::Mov,
                    vec![Op::Imm(0), Op::Reg(Reg::new(dst.value, RegSize::R32))],
                ));
            }
            match &mi.operands[0] {
                Op::Local(_) | Op::Static(_) => out.push(machine(
                    X64Op::Mov,
                    vec![mi.operands[0].clone(), Op::Reg(dst)],
                )),
                Op::Reg(addr) => out.push(machine(
                    X64Op::Mov,
                    vec![Op::Reg(*addr), Op::Imm(0), Op::Reg(dst)],
                )),
                other => panic!("load from {other}"),
            }
        }

        Opcode::Store => {
            let value = mi.operands[0].clone();
            match &mi.operands[1] {
                Op::Local(_) | Op::Static(_) => out.push(machine(
                    X64Op::Mov,
                    vec![value, mi.operands[1].clone()],
                )),
                Op::Reg(addr) => out.push(machine(
                    X64Op::Mov,
                    vec![value, Op::Reg(*addr), Op::Imm(0)],
                )),
                other => panic!("store to {other}"),
            }
        }

        Opcode::Bin(op) => lower_binary(mi, op, out),

        Opcode::Not => {
            let dst = mi.dst.expect("not without a destination");
            out.push(machine(
                X64Op::Mov,
                vec![mi.operands[0].clone(), Op::Reg(dst)],
            ));
            out.push(machine(X64Op::Not, vec![Op::Reg(dst)]));
        }

        Opcode::SExt => {
            let dst = mi.dst.expect("sext without a destination");
            out.push(machine(
                X64Op::Movsx,
                vec![mi.operands[0].clone(), Op::Reg(dst)],
            ));
        }

        Opcode::ZExt => {
            let dst = mi.dst.expect("zext without a destination");
            let src = match mi.operands[0] {
                Op::Reg(r) => r,
                ref other => panic!("zext of {other}"),
            };
            if src.size == RegSize::R32 {
                // A 32-bit move already zero-extends to 64 bits.
                out.push(machine(
                    X64Op::Mov,
                    vec![
                        Op::Reg(src),
                        Op::Reg(Reg::new(dst.value, RegSize::R32)),
                    ],
                ));
            } else {
                out.push(machine(X64Op::Movzx, vec![Op::Reg(src), Op::Reg(dst)]));
            }
        }

        Opcode::Trunc => {
            let dst = mi.dst.expect("trunc without a destination");
            let src = match mi.operands[0] {
                Op::Reg(r) => r,
                ref other => panic!("trunc of {other}"),
            };
            out.push(machine(
                X64Op::Mov,
                vec![
                    Op::Reg(Reg::new(src.value, dst.size)),
                    Op::Reg(dst),
                ],
            ));
        }

        Opcode::Branch => {
            let target = match mi.operands[0] {
                Op::Block(b) => b,
                ref other => panic!("branch to {other}"),
            };
            // Fall through to the next block when possible.
            if !(optimize && target == block + 1) {
                out.push(machine(X64Op::Jmp, vec![Op::Block(target)]));
            }
        }

        Opcode::CondBranch => {
            let cond = match mi.operands[0] {
                Op::Reg(r) => r,
                ref other => panic!("conditional branch on {other}"),
            };
            let (then_b, else_b) = match (&mi.operands[1], &mi.operands[2]) {
                (Op::Block(t), Op::Block(e)) => (*t, *e),
                _ => panic!("conditional branch without block targets"),
            };
            out.push(machine(X64Op::Test, vec![Op::Reg(cond), Op::Reg(cond)]));
            if optimize && then_b == block + 1 {
                out.push(machine(
                    X64Op::Jcc,
                    vec![Op::Imm(Cond::E.to_imm()), Op::Block(else_b)],
                ));
            } else if optimize && else_b == block + 1 {
                out.push(machine(
                    X64Op::Jcc,
                    vec![Op::Imm(Cond::Ne.to_imm()), Op::Block(then_b)],
                ));
            } else {
                out.push(machine(
                    X64Op::Jcc,
                    vec![Op::Imm(Cond::E.to_imm()), Op::Block(else_b)],
                ));
                out.push(machine(X64Op::Jmp, vec![Op::Block(then_b)]));
            }
        }

        Opcode::Return => {
            if let Some(Op::Reg(v)) = mi.operands.first() {
                out.push(machine(
                    X64Op::Mov,
                    vec![Op::Reg(*v), Op::Reg(Reg::new(rax, RegSize::R64))],
                ));
            }
            out.push(machine(X64Op::Ret, vec![]));
        }

        Opcode::Call => {
            let dst = mi.dst.expect("call without a destination");
            out.push(machine(X64Op::Call, mi.operands.clone()));
            out.push(machine(
                X64Op::Mov,
                vec![Op::Reg(Reg::new(rax, RegSize::R64)), Op::Reg(dst)],
            ));
        }
    }
}

fn lower_binary(mi: &MInst, op: BinaryOp, out: &mut Vec<MInst>) {
    let machine = |op: X64Op, operands: Vec<MachineOperand>| {
        MInst::new(Opcode::Machine(op), None, operands)
    };
    let dst = mi.dst.expect("binary op without a destination");
    let (lhs, rhs) = match (&mi.operands[0], &mi.operands[1]) {
        (Op::Reg(l), Op::Reg(r)) => (*l, *r),
        _ => panic!("binary op without register operands"),
    };
    let rax = Reg::new(crate::arch::x64::Gpr::Rax.value(), RegSize::R64);
    let rcx = Reg::new(crate::arch::x64::Gpr::Rcx.value(), RegSize::R64);
    let rdx = Reg::new(crate::arch::x64::Gpr::Rdx.value(), RegSize::R64);
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::And | BinaryOp::Or => {
            let x64 = match op {
                BinaryOp::Add => X64Op::Add,
                BinaryOp::Sub => X64Op::Sub,
                BinaryOp::Mul => X64Op::Imul,
                BinaryOp::And => X64Op::And,
                BinaryOp::Or => X64Op::Or,
                _ => unreachable!(),
            };
            out.push(machine(X64Op::Mov, vec![Op::Reg(lhs), Op::Reg(dst)]));
            out.push(machine(x64, vec![Op::Reg(rhs), Op::Reg(dst)]));
        }

        BinaryOp::Div | BinaryOp::Mod => {
            // Dividend in RAX, sign-extend into RDX, quotient in RAX,
            // remainder in RDX. The allocator keeps the divisor clear of
            // both. The divide is always 64-bit to match CQO.
            let rhs64 = Reg::new(rhs.value, RegSize::R64);
            out.push(machine(X64Op::Mov, vec![Op::Reg(lhs), Op::Reg(rax)]));
            out.push(machine(X64Op::Cqo, vec![]));
            out.push(machine(X64Op::Idiv, vec![Op::Reg(rhs64)]));
            let result = if op == BinaryOp::Div { rax } else { rdx };
            out.push(machine(X64Op::Mov, vec![Op::Reg(result), Op::Reg(dst)]));
        }

        BinaryOp::Shl | BinaryOp::Sar | BinaryOp::Shr => {
            let x64 = match op {
                BinaryOp::Shl => X64Op::Shl,
                BinaryOp::Sar => X64Op::Sar,
                BinaryOp::Shr => X64Op::Shr,
                _ => unreachable!(),
            };
            out.push(machine(X64Op::Mov, vec![Op::Reg(rhs), Op::Reg(rcx)]));
            out.push(machine(X64Op::Mov, vec![Op::Reg(lhs), Op::Reg(dst)]));
            out.push(machine(x64, vec![Op::Reg(dst)]));
        }

        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne => {
            out.push(machine(X64Op::Cmp, vec![Op::Reg(rhs), Op::Reg(lhs)]));
            out.push(machine(
                X64Op::Mov,
                vec![Op::Imm(0), Op::Reg(Reg::new(dst.value, RegSize::R32))],
            ));
            out.push(machine(
                X64Op::Setcc,
                vec![
                    Op::Imm(compare_cond(op).to_imm()),
                    Op::Reg(Reg::new(dst.value, RegSize::R8)),
                ],
            ));
        }
    }
}
