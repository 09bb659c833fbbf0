//! Target layer: machine descriptions and the x86-64 encoder.

pub mod x64;

use crate::ir::BinaryOp;
use crate::mir::Opcode;
use x64::{Gpr, X64Op};

/// Which calling convention a compile targets. The two differ only in
/// argument-register lists, caller-saved sets and shadow space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// System V AMD64 (Linux).
    SysV,
    /// Microsoft x64.
    Win64,
}

/// Everything the allocator and encoder need to know about the target,
/// collected behind one description per convention.
pub struct MachineDesc {
    pub convention: CallingConvention,
    /// Allocatable general-purpose registers, in assignment preference
    /// order. Excludes RSP and RBP.
    pub registers: &'static [Gpr],
    /// ABI argument registers, in argument order.
    pub argument_registers: &'static [Gpr],
    pub caller_saved: &'static [Gpr],
    pub result_register: Gpr,
    /// Bytes reserved above the return address for callee scratch
    /// (Win64 shadow space; 0 on System V).
    pub shadow_space: u64,
}

static SYSV: MachineDesc = MachineDesc {
    convention: CallingConvention::SysV,
    registers: &[
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::Rbx,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ],
    argument_registers: &[Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9],
    caller_saved: &[
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
    ],
    result_register: Gpr::Rax,
    shadow_space: 0,
};

static WIN64: MachineDesc = MachineDesc {
    convention: CallingConvention::Win64,
    registers: &[
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::Rbx,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ],
    argument_registers: &[Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9],
    caller_saved: &[
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
    ],
    result_register: Gpr::Rax,
    // 4 home slots plus alignment padding.
    shadow_space: 4 * 8 + 8,
};

impl MachineDesc {
    pub fn for_convention(cc: CallingConvention) -> &'static MachineDesc {
        match cc {
            CallingConvention::SysV => &SYSV,
            CallingConvention::Win64 => &WIN64,
        }
    }

    pub fn is_caller_saved(&self, reg: Gpr) -> bool {
        self.caller_saved.contains(&reg)
    }

    /// Callee-saved: allocatable but not caller-saved.
    pub fn is_callee_saved(&self, reg: Gpr) -> bool {
        self.registers.contains(&reg) && !self.caller_saved.contains(&reg)
    }

    pub fn caller_saved_mask(&self) -> u32 {
        self.caller_saved.iter().fold(0, |m, r| m | r.mask())
    }

    /// Physical registers an opcode inherently demands or clobbers, as a
    /// bitmask. Operands of such an instruction must not be assigned
    /// these registers, and values live across it must avoid them too.
    pub fn opcode_interference(&self, op: Opcode) -> u32 {
        match op {
            Opcode::Bin(BinaryOp::Shl | BinaryOp::Shr | BinaryOp::Sar)
            | Opcode::Machine(X64Op::Shl | X64Op::Shr | X64Op::Sar) => Gpr::Rcx.mask(),
            Opcode::Bin(BinaryOp::Div | BinaryOp::Mod) | Opcode::Machine(X64Op::Idiv) => {
                Gpr::Rax.mask() | Gpr::Rdx.mask()
            }
            Opcode::Machine(X64Op::Cqo | X64Op::Cdq) => {
                Gpr::Rax.mask() | Gpr::Rdx.mask()
            }
            Opcode::Call | Opcode::Machine(X64Op::Call) => Gpr::Rax.mask(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysv_argument_order() {
        let d = MachineDesc::for_convention(CallingConvention::SysV);
        assert_eq!(
            d.argument_registers,
            &[Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9]
        );
        assert_eq!(d.result_register, Gpr::Rax);
        assert_eq!(d.shadow_space, 0);
    }

    #[test]
    fn win64_reserves_shadow_space() {
        let d = MachineDesc::for_convention(CallingConvention::Win64);
        assert_eq!(d.argument_registers.len(), 4);
        assert_eq!(d.shadow_space, 40);
        // RSI/RDI are callee-saved on Win64, caller-saved on SysV.
        assert!(d.is_callee_saved(Gpr::Rsi));
        assert!(MachineDesc::for_convention(CallingConvention::SysV).is_caller_saved(Gpr::Rsi));
    }

    #[test]
    fn shift_and_division_interference() {
        let d = MachineDesc::for_convention(CallingConvention::SysV);
        assert_eq!(
            d.opcode_interference(Opcode::Machine(X64Op::Idiv)),
            Gpr::Rax.mask() | Gpr::Rdx.mask()
        );
        assert_eq!(
            d.opcode_interference(Opcode::Machine(X64Op::Shl)),
            Gpr::Rcx.mask()
        );
        assert_eq!(
            d.opcode_interference(Opcode::Machine(X64Op::Call)),
            Gpr::Rax.mask()
        );
        assert_eq!(d.opcode_interference(Opcode::Machine(X64Op::Mov)), 0);
    }
}
