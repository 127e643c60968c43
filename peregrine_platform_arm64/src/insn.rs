// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A64 instruction patterns for the handful of instructions the misaligned
//! trap handler must recognize, and field extractors for them.

/// Compare-and-swap pair, acquire-release (CASPAL). Bit 30 selects the pair
/// element size.
pub const CASPAL_MASK: u32 = 0xBFE0_FC00;
pub const CASPAL_INST: u32 = 0x0860_FC00;

/// Single-register compare-and-swap, acquire-release (CASAL/CASALH/CASALB).
pub const CASAL_MASK: u32 = 0x3FE0_FC00;
pub const CASAL_INST: u32 = 0x08E0_FC00;

/// LSE atomic memory operations, acquire-release (LDADDAL and friends, SWPAL).
/// Bits [15:12] carry the operation selector.
pub const ATOMIC_MEM_MASK: u32 = 0x3FE0_0C00;
pub const ATOMIC_MEM_INST: u32 = 0x38E0_0000;

/// Load-acquire (LDAR).
pub const LDAR_MASK: u32 = 0x3FFF_FC00;
pub const LDAR_INST: u32 = 0x08DF_FC00;

/// Store-release (STLR).
pub const STLR_MASK: u32 = 0x3FFF_FC00;
pub const STLR_INST: u32 = 0x089F_FC00;

/// Load-acquire exclusive (LDAXR).
pub const LDAXR_MASK: u32 = 0x3FFF_FC00;
pub const LDAXR_INST: u32 = 0x085F_FC00;

/// Store-release exclusive (STLXR).
pub const STLXR_MASK: u32 = 0x3FE0_FC00;
pub const STLXR_INST: u32 = 0x0800_FC00;

/// 128-bit load-acquire exclusive pair (LDAXP, 64-bit elements).
pub const LDAXP_MASK: u32 = 0xFFFF_8000;
pub const LDAXP_INST: u32 = 0xC85F_8000;

/// Compare-and-branch-nonzero (CBNZ), either register width.
pub const CBNZ_MASK: u32 = 0x7F00_0000;
pub const CBNZ_INST: u32 = 0x3500_0000;

/// Shifted-register ALU ops, ignoring sf and the shift fields.
pub const ALU_OP_MASK: u32 = 0x7F20_0000;
pub const ADD_INST: u32 = 0x0B00_0000;
pub const SUB_INST: u32 = 0x4B00_0000;
pub const AND_INST: u32 = 0x0A00_0000;
pub const OR_INST: u32 = 0x2A00_0000;
pub const EOR_INST: u32 = 0x4A00_0000;

/// Register number 31: the zero register in these encodings.
pub const ZERO_REG: u32 = 31;

pub const fn rd(instr: u32) -> u32 {
    instr & 0b11111
}

pub const fn rn(instr: u32) -> u32 {
    (instr >> 5) & 0b11111
}

pub const fn rm(instr: u32) -> u32 {
    (instr >> 16) & 0b11111
}

pub const fn rt2(instr: u32) -> u32 {
    (instr >> 10) & 0b11111
}

/// Access width in bytes from the standard size field at [31:30].
pub const fn access_size(instr: u32) -> u64 {
    1 << (instr >> 30)
}

/// The operation selector nibble of an LSE atomic memory op.
pub const fn atomic_mem_op(instr: u32) -> u8 {
    ((instr >> 12) & 0xF) as u8
}

/// LSE atomic memory operations by their [15:12] selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum AtomicMemOp {
    Add = 0x0,
    Clr = 0x1,
    Eor = 0x2,
    Set = 0x3,
    Swap = 0x8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_casal() {
        // casal x2, x3, [x5]
        let instr = CASAL_INST | (0b11 << 30) | (2 << 16) | (5 << 5) | 3;
        assert_eq!(instr & CASAL_MASK, CASAL_INST);
        assert_eq!(rm(instr), 2);
        assert_eq!(rn(instr), 5);
        assert_eq!(rd(instr), 3);
        assert_eq!(access_size(instr), 8);
    }

    #[test]
    fn decodes_ldaddal() {
        // ldaddal w1, w2, [x3]
        let instr = ATOMIC_MEM_INST | (0b10 << 30) | (1 << 16) | (3 << 5) | 2;
        assert_eq!(instr & ATOMIC_MEM_MASK, ATOMIC_MEM_INST);
        assert_eq!(atomic_mem_op(instr), AtomicMemOp::Add as u8);
        assert_eq!(access_size(instr), 4);
    }

    #[test]
    fn decodes_swpal() {
        // swpal x1, x2, [x3]
        let instr = ATOMIC_MEM_INST | (0b11 << 30) | (0x8 << 12) | (1 << 16) | (3 << 5) | 2;
        assert_eq!(instr & ATOMIC_MEM_MASK, ATOMIC_MEM_INST);
        assert_eq!(
            AtomicMemOp::try_from(atomic_mem_op(instr)),
            Ok(AtomicMemOp::Swap)
        );
    }

    #[test]
    fn alu_patterns_are_disjoint() {
        for inst in [ADD_INST, SUB_INST, AND_INST, OR_INST, EOR_INST] {
            assert_eq!(inst & ALU_OP_MASK, inst);
        }
        // sub w2, wzr, w1 (i.e. neg)
        let neg = SUB_INST | (1 << 16) | (ZERO_REG << 5) | 2;
        assert_eq!(neg & ALU_OP_MASK, SUB_INST);
        assert_eq!(rn(neg), ZERO_REG);
    }

    #[test]
    fn exclusive_patterns() {
        // ldaxr w1, [x0]
        let ldaxr = LDAXR_INST | (0b10 << 30) | 1;
        assert_eq!(ldaxr & LDAXR_MASK, LDAXR_INST);
        // stlxr w3, w1, [x0]
        let stlxr = STLXR_INST | (0b10 << 30) | (3 << 16) | 1;
        assert_eq!(stlxr & STLXR_MASK, STLXR_INST);
        assert_eq!(rm(stlxr), 3);
        // They must not shadow each other.
        assert_ne!(ldaxr & STLXR_MASK, STLXR_INST);
        assert_ne!(stlxr & LDAXR_MASK, LDAXR_INST);
    }
}
