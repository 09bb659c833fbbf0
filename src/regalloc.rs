//! Graph-coloring register allocation.
//!
//! Works on selected machine IR: block-level liveness by dataflow, an
//! interference graph over virtual registers (with precolored conflicts
//! against physical registers and per-opcode clobber masks), then
//! simplify-and-select coloring. Uncolorable values are spilled to frame
//! slots and the whole thing reruns until a valid coloring lands.
//!
//! Calls clobber every caller-saved register, which is how values live
//! across a call end up callee-saved. Between equal choices the lowest
//! pool index wins, so output is stable.

use std::collections::HashMap;

use crate::arch::x64::{Gpr, X64Op};
use crate::arch::MachineDesc;
use crate::mir::{MInst, MachineOperand, MirFunction, Opcode, Reg, RegSize};

// ─── Bit sets ───────────────────────────────────────────────────────────────

/// Dense bit set over virtual-register indices.
#[derive(Clone, PartialEq, Eq)]
struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    fn new(len: usize) -> BitSet {
        BitSet {
            words: vec![0; len.div_ceil(64)],
        }
    }

    fn insert(&mut self, i: usize) {
        self.words[i / 64] |= 1 << (i % 64);
    }

    fn remove(&mut self, i: usize) {
        self.words[i / 64] &= !(1 << (i % 64));
    }

    /// Union in `other`; reports whether anything changed.
    fn union_with(&mut self, other: &BitSet) -> bool {
        let mut changed = false;
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            let next = *a | *b;
            changed |= next != *a;
            *a = next;
        }
        changed
    }

    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &w)| {
            (0..64).filter(move |b| w & (1 << b) != 0).map(move |b| wi * 64 + b)
        })
    }
}

/// Values live at a program point: virtual registers plus a mask of live
/// physical registers.
#[derive(Clone, PartialEq, Eq)]
struct LiveSet {
    vregs: BitSet,
    phys: u32,
}

// ─── Instruction access classification ──────────────────────────────────────

/// Which operand slots an instruction reads and writes, plus registers it
/// touches implicitly.
#[derive(Debug, Default)]
struct Access {
    uses: Vec<usize>,
    defs: Vec<usize>,
    implicit_uses: u32,
    implicit_defs: u32,
}

fn classify(mi: &MInst, desc: &MachineDesc) -> Access {
    use MachineOperand as Op;
    let op = match mi.opcode {
        Opcode::Machine(op) => op,
        other => panic!("allocator given an unselected instruction: {other}"),
    };
    let mut acc = Access::default();
    match op {
        X64Op::Mov => match &mi.operands[..] {
            [Op::Imm(_), Op::Reg(_)] => acc.defs.push(1),
            [Op::Imm(_), Op::Local(_)] | [Op::Imm(_), Op::Static(_)] => {}
            [Op::Reg(_), Op::Reg(_)] => {
                acc.uses.push(0);
                acc.defs.push(1);
            }
            [Op::Reg(_), Op::Local(_)] | [Op::Reg(_), Op::Static(_)] => acc.uses.push(0),
            [Op::Local(_), Op::Reg(_)] | [Op::Static(_), Op::Reg(_)] => acc.defs.push(1),
            [Op::Reg(_), Op::Reg(_), Op::Imm(_)] => {
                acc.uses.push(0);
                acc.uses.push(1);
            }
            [Op::Reg(_), Op::Imm(_), Op::Reg(_)] => {
                acc.uses.push(0);
                acc.defs.push(2);
            }
            _ => panic!("mov: unhandled operand shape {mi}"),
        },

        X64Op::Lea => acc.defs.push(1),

        X64Op::Add | X64Op::Sub | X64Op::And | X64Op::Or | X64Op::Imul => {
            if matches!(mi.operands[0], Op::Reg(_)) {
                acc.uses.push(0);
            }
            acc.uses.push(1);
            acc.defs.push(1);
        }

        X64Op::Cmp | X64Op::Test => {
            for (i, operand) in mi.operands.iter().enumerate() {
                if matches!(operand, Op::Reg(_)) {
                    acc.uses.push(i);
                }
            }
        }

        X64Op::Movsx | X64Op::Movzx => {
            acc.uses.push(0);
            acc.defs.push(1);
        }

        X64Op::Setcc => {
            acc.uses.push(1);
            acc.defs.push(1);
        }

        X64Op::Not => {
            acc.uses.push(0);
            acc.defs.push(0);
        }

        X64Op::Idiv => {
            acc.uses.push(0);
            acc.implicit_uses = Gpr::Rax.mask() | Gpr::Rdx.mask();
            acc.implicit_defs = Gpr::Rax.mask() | Gpr::Rdx.mask();
        }

        X64Op::Shl | X64Op::Shr | X64Op::Sar => {
            acc.uses.push(0);
            acc.defs.push(0);
            acc.implicit_uses = Gpr::Rcx.mask();
        }

        X64Op::Cdq | X64Op::Cqo => {
            acc.implicit_uses = Gpr::Rax.mask();
            acc.implicit_defs = Gpr::Rdx.mask();
        }

        X64Op::Push => acc.uses.push(0),
        X64Op::Pop => acc.defs.push(0),

        X64Op::Call => {
            for (i, operand) in mi.operands.iter().enumerate() {
                if matches!(operand, Op::Reg(_)) {
                    acc.uses.push(i);
                }
            }
            // The call tramples every caller-saved register.
            acc.implicit_defs = desc.caller_saved_mask();
        }

        X64Op::Jmp => {
            if matches!(mi.operands.first(), Some(Op::Reg(_))) {
                acc.uses.push(0);
            }
        }

        X64Op::Jcc => {}

        X64Op::Ret => acc.implicit_uses = Gpr::Rax.mask(),

        X64Op::Ud2 | X64Op::Int3 | X64Op::Syscall => {}
    }
    acc
}

fn operand_reg(mi: &MInst, idx: usize) -> Reg {
    match mi.operands[idx] {
        MachineOperand::Reg(r) => r,
        ref other => panic!("operand {idx} is not a register: {other}"),
    }
}

// ─── Control flow ───────────────────────────────────────────────────────────

/// A block falls through unless it ends in a return, an unconditional
/// jump, or unreachable.
fn block_successors(mf: &MirFunction, bi: usize) -> Vec<usize> {
    let block = &mf.blocks[bi];
    let mut succs = Vec::new();
    for mi in &block.insts {
        if let Opcode::Machine(X64Op::Jmp | X64Op::Jcc) = mi.opcode {
            for operand in &mi.operands {
                if let MachineOperand::Block(t) = operand {
                    if !succs.contains(t) {
                        succs.push(*t);
                    }
                }
            }
        }
    }
    let falls = match block.insts.last() {
        None => true,
        Some(mi) => !matches!(
            mi.opcode,
            Opcode::Machine(X64Op::Ret | X64Op::Jmp | X64Op::Ud2)
        ),
    };
    if falls && bi + 1 < mf.blocks.len() && !succs.contains(&(bi + 1)) {
        succs.push(bi + 1);
    }
    succs
}

// ─── Allocation ─────────────────────────────────────────────────────────────

const MAX_ROUNDS: usize = 16;

/// Assign physical registers to every virtual register in `mf`,
/// rewriting operands in place. Records used registers in
/// `mf.registers_in_use`. Idempotent on already-allocated input.
pub fn allocate(mf: &mut MirFunction, desc: &'static MachineDesc) {
    for round in 0..MAX_ROUNDS {
        let spilled = try_allocate(mf, desc);
        if spilled == 0 {
            return;
        }
        log::debug!(
            "regalloc {}: round {round} spilled {spilled} value(s)",
            mf.name
        );
    }
    panic!("register allocation did not converge for {}", mf.name);
}

fn try_allocate(mf: &mut MirFunction, desc: &'static MachineDesc) -> usize {
    // Collect virtual registers into a dense index space.
    let mut index: HashMap<u32, usize> = HashMap::new();
    let mut values: Vec<u32> = Vec::new();
    for block in &mf.blocks {
        for mi in &block.insts {
            for operand in &mi.operands {
                if let MachineOperand::Reg(r) = operand {
                    if r.is_virtual() && !index.contains_key(&r.value) {
                        index.insert(r.value, values.len());
                        values.push(r.value);
                    }
                }
            }
        }
    }
    let n = values.len();
    if n == 0 {
        finish(mf, desc, &HashMap::new());
        return 0;
    }

    // Per-vreg bookkeeping for spill choice.
    let mut use_count = vec![0u32; n];
    let mut first_use = vec![usize::MAX; n];
    {
        let mut pos = 0usize;
        for block in &mf.blocks {
            for mi in &block.insts {
                let acc = classify(mi, desc);
                for &u in &acc.uses {
                    let r = operand_reg(mi, u);
                    if let Some(&i) = index.get(&r.value) {
                        use_count[i] += 1;
                        first_use[i] = first_use[i].min(pos);
                    }
                }
                pos += 1;
            }
        }
    }

    // Liveness: live-in per block to fixpoint.
    let nblocks = mf.blocks.len();
    let empty = LiveSet {
        vregs: BitSet::new(n),
        phys: 0,
    };
    let mut live_in: Vec<LiveSet> = vec![empty.clone(); nblocks];
    loop {
        let mut changed = false;
        for bi in (0..nblocks).rev() {
            let mut live = empty.clone();
            for s in block_successors(mf, bi) {
                live.vregs.union_with(&live_in[s].vregs);
                live.phys |= live_in[s].phys;
            }
            scan_block(mf, desc, bi, &index, &mut live, None);
            if live.vregs != live_in[bi].vregs || live.phys != live_in[bi].phys {
                live_in[bi] = live;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Interference: adjacency between vregs, forbidden physical masks.
    let mut adj: Vec<BitSet> = vec![BitSet::new(n); n];
    let mut forbidden = vec![0u32; n];
    for bi in 0..nblocks {
        let mut live = empty.clone();
        for s in block_successors(mf, bi) {
            live.vregs.union_with(&live_in[s].vregs);
            live.phys |= live_in[s].phys;
        }
        scan_block(
            mf,
            desc,
            bi,
            &index,
            &mut live,
            Some((&mut adj, &mut forbidden)),
        );
    }

    // Simplify: peel low-degree nodes, spill-select when stuck.
    let k = desc.registers.len();
    let mut degree: Vec<usize> = adj.iter().map(|a| a.iter().count()).collect();
    let mut removed = vec![false; n];
    let mut stack = Vec::with_capacity(n);
    while stack.len() < n {
        let simplifiable = (0..n).find(|&i| !removed[i] && degree[i] < k);
        let chosen = match simplifiable {
            Some(i) => i,
            None => {
                // Prefer high degree and low use density; between equal
                // candidates, the one first used latest.
                (0..n)
                    .filter(|&i| !removed[i])
                    .max_by(|&a, &b| {
                        degree[a]
                            .cmp(&degree[b])
                            .then(use_count[b].cmp(&use_count[a]))
                            .then(first_use[a].cmp(&first_use[b]))
                    })
                    .expect("no candidate left to spill-select")
            }
        };
        removed[chosen] = true;
        for nb in adj[chosen].iter() {
            degree[nb] = degree[nb].saturating_sub(1);
        }
        stack.push(chosen);
    }

    // Select: pop and take the lowest-index available color.
    let mut color: Vec<Option<Gpr>> = vec![None; n];
    let mut spills = Vec::new();
    while let Some(i) = stack.pop() {
        let mut taken = forbidden[i];
        for nb in adj[i].iter() {
            if let Some(c) = color[nb] {
                taken |= c.mask();
            }
        }
        match desc.registers.iter().find(|r| taken & r.mask() == 0) {
            Some(&reg) => color[i] = Some(reg),
            None => spills.push(i),
        }
    }

    if spills.is_empty() {
        let assignment: HashMap<u32, Gpr> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, color[i].expect("colored value without a color")))
            .collect();
        finish(mf, desc, &assignment);
        return 0;
    }

    for &i in &spills {
        rewrite_spill(mf, desc, values[i]);
    }
    spills.len()
}

/// Backward scan of one block: updates `live`, and (when `record` is
/// given) adds interference edges and forbidden-register masks.
fn scan_block(
    mf: &MirFunction,
    desc: &MachineDesc,
    bi: usize,
    index: &HashMap<u32, usize>,
    live: &mut LiveSet,
    mut record: Option<(&mut Vec<BitSet>, &mut Vec<u32>)>,
) {
    for mi in mf.blocks[bi].insts.iter().rev() {
        let acc = classify(mi, desc);
        let clobber = desc.opcode_interference(mi.opcode) | acc.implicit_defs;

        if let Some((adj, forbidden)) = record.as_mut() {
            // Defs interfere with everything live across the instruction.
            for &d in &acc.defs {
                let dr = operand_reg(mi, d);
                if let Some(&di) = index.get(&dr.value) {
                    for l in live.vregs.iter() {
                        if l != di {
                            adj[di].insert(l);
                            adj[l].insert(di);
                        }
                    }
                    forbidden[di] |= live.phys;
                } else {
                    // Physical def: everything live avoids it.
                    for l in live.vregs.iter() {
                        forbidden[l] |= 1 << dr.value;
                    }
                }
            }
            // Clobbers and opcode demands constrain live values and the
            // instruction's own register operands.
            if clobber != 0 {
                for l in live.vregs.iter() {
                    forbidden[l] |= clobber;
                }
                let demands = desc.opcode_interference(mi.opcode);
                if demands != 0 {
                    for &u in &acc.uses {
                        let ur = operand_reg(mi, u);
                        if let Some(&ui) = index.get(&ur.value) {
                            forbidden[ui] |= demands;
                        }
                    }
                }
            }
        }

        // Kill defs, gen uses.
        for &d in &acc.defs {
            let dr = operand_reg(mi, d);
            match index.get(&dr.value) {
                Some(&di) => live.vregs.remove(di),
                None => live.phys &= !(1 << dr.value),
            }
        }
        live.phys &= !acc.implicit_defs;
        for &u in &acc.uses {
            let ur = operand_reg(mi, u);
            match index.get(&ur.value) {
                Some(&ui) => live.vregs.insert(ui),
                None => live.phys |= 1 << ur.value,
            }
        }
        live.phys |= acc.implicit_uses;

        // Live physical registers are off limits for simultaneously live
        // virtual ones.
        if let Some((_, forbidden)) = record.as_mut() {
            if live.phys != 0 {
                for l in live.vregs.iter() {
                    forbidden[l] |= live.phys;
                }
            }
        }
    }
}

/// Rewrite every def and use of a spilled value through a fresh frame
/// slot.
fn rewrite_spill(mf: &mut MirFunction, desc: &MachineDesc, value: u32) {
    let slot = mf.push_frame_object(8);
    for bi in 0..mf.blocks.len() {
        let insts = std::mem::take(&mut mf.blocks[bi].insts);
        let mut out = Vec::with_capacity(insts.len());
        for mut mi in insts {
            let acc = classify(&mi, desc);
            let touches_use = acc
                .uses
                .iter()
                .any(|&u| operand_reg(&mi, u).value == value);
            let touches_def = acc
                .defs
                .iter()
                .any(|&d| operand_reg(&mi, d).value == value);
            if !touches_use && !touches_def {
                out.push(mi);
                continue;
            }
            let tmp = mf.new_vreg(RegSize::R64);
            for operand in &mut mi.operands {
                if let MachineOperand::Reg(r) = operand {
                    if r.value == value {
                        r.value = tmp.value;
                    }
                }
            }
            if touches_use {
                out.push(MInst::new(
                    Opcode::Machine(X64Op::Mov),
                    None,
                    vec![MachineOperand::Local(slot), MachineOperand::Reg(tmp)],
                ));
            }
            out.push(mi);
            if touches_def {
                out.push(MInst::new(
                    Opcode::Machine(X64Op::Mov),
                    None,
                    vec![MachineOperand::Reg(tmp), MachineOperand::Local(slot)],
                ));
            }
        }
        mf.blocks[bi].insts = out;
    }
}

/// Substitute the final assignment into operands and record the set of
/// physical registers the function touches.
fn finish(mf: &mut MirFunction, _desc: &MachineDesc, assignment: &HashMap<u32, Gpr>) {
    let mut in_use = 0u32;
    for block in &mut mf.blocks {
        for mi in &mut block.insts {
            for operand in &mut mi.operands {
                if let MachineOperand::Reg(r) = operand {
                    if r.is_virtual() {
                        let phys = assignment
                            .get(&r.value)
                            .unwrap_or_else(|| panic!("virtual register {r} left unassigned"));
                        r.value = phys.value();
                    }
                    in_use |= 1 << r.value;
                }
            }
        }
    }
    mf.registers_in_use = in_use;
}
