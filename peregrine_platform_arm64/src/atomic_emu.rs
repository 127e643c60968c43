// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Emulation of misaligned guest atomics.
//!
//! x86 guests may issue LOCK-prefixed operations at any address. The host's
//! exclusive/CAS/acquire-release instructions raise SIGBUS with `BUS_ADRALN`
//! when the address is not naturally aligned, so the SIGBUS handler lands
//! here: the trapping instruction is decoded, the access is decomposed into
//! naturally aligned host primitives wide enough to cover it, and the host PC
//! is advanced past the emulated sequence.
//!
//! An access that fits inside one aligned 4/8/16-byte container is emulated
//! with a single masked CAS loop on that container and is exactly as atomic
//! as the guest expects. An access that straddles a 16-byte boundary needs
//! two CASes and can tear; the tear is surfaced to the guest through the
//! returned expected value, never to the host.

use crate::atomics;
use crate::context::HostContext;
use crate::insn::{self, AtomicMemOp};
use crate::telemetry;

/// Entry point from the SIGBUS handler.
///
/// Returns true if the trap was an alignment fault on an instruction we
/// emulate; the host PC has then been advanced past the emulated sequence.
/// Any other SIGBUS is declined.
pub fn handle_misaligned_access(ctx: &mut dyn HostContext, si_code: i32) -> bool {
    if si_code != libc::BUS_ADRALN {
        // This only handles alignment problems.
        return false;
    }

    let pc = ctx.pc();
    let instr = unsafe { (pc as *const u32).read() };

    let advance = if instr & insn::CASPAL_MASK == insn::CASPAL_INST {
        handle_cas_pair(ctx, instr).then_some(4)
    } else if instr & insn::CASAL_MASK == insn::CASAL_INST {
        handle_cas(ctx, instr).then_some(4)
    } else if instr & insn::ATOMIC_MEM_MASK == insn::ATOMIC_MEM_INST {
        handle_atomic_mem_op(ctx, instr).then_some(4)
    } else if instr & insn::LDAR_MASK == insn::LDAR_INST {
        handle_atomic_load(ctx, instr).then_some(4)
    } else if instr & insn::STLR_MASK == insn::STLR_INST {
        handle_atomic_store(ctx, instr).then_some(4)
    } else if instr & insn::LDAXP_MASK == insn::LDAXP_INST {
        handle_atomic_load_pair(ctx, instr).then_some(4)
    } else if instr & insn::LDAXR_MASK == insn::LDAXR_INST {
        handle_exclusive_idiom(ctx, pc, instr)
    } else {
        None
    };

    match advance {
        Some(bytes) => {
            ctx.set_pc(pc + bytes);
            true
        }
        None => false,
    }
}

/// An emulatable word width: the guest-visible slice a CAS loop operates on.
trait CasWord: Copy + PartialEq {
    const BYTES: u64;
    const BITS: u32;
    fn to_u128(self) -> u128;
    fn from_u128(value: u128) -> Self;
    fn from_gpr(value: u64) -> Self;
    fn to_gpr(self) -> u64;
    fn wrapping_add(self, rhs: Self) -> Self;
    fn wrapping_sub(self, rhs: Self) -> Self;
    fn wrapping_neg(self) -> Self;
    fn and(self, rhs: Self) -> Self;
    fn and_not(self, rhs: Self) -> Self;
    fn or(self, rhs: Self) -> Self;
    fn xor(self, rhs: Self) -> Self;
}

macro_rules! impl_cas_word {
    ($ty:ty, $bytes:expr) => {
        impl CasWord for $ty {
            const BYTES: u64 = $bytes;
            const BITS: u32 = $bytes * 8;

            fn to_u128(self) -> u128 {
                self.into()
            }

            fn from_u128(value: u128) -> Self {
                value as $ty
            }

            fn from_gpr(value: u64) -> Self {
                value as $ty
            }

            fn to_gpr(self) -> u64 {
                self as u64
            }

            fn wrapping_add(self, rhs: Self) -> Self {
                <$ty>::wrapping_add(self, rhs)
            }

            fn wrapping_sub(self, rhs: Self) -> Self {
                <$ty>::wrapping_sub(self, rhs)
            }

            fn wrapping_neg(self) -> Self {
                <$ty>::wrapping_neg(self)
            }

            fn and(self, rhs: Self) -> Self {
                self & rhs
            }

            fn and_not(self, rhs: Self) -> Self {
                self & !rhs
            }

            fn or(self, rhs: Self) -> Self {
                self | rhs
            }

            fn xor(self, rhs: Self) -> Self {
                self ^ rhs
            }
        }
    };
}

impl_cas_word!(u16, 2);
impl_cas_word!(u32, 4);
impl_cas_word!(u64, 8);

/// Both callbacks receive the observed slice first and the caller-supplied
/// source second.
type CasFn<T> = fn(T, T) -> T;

fn nop_expected<T: CasWord>(observed: T, _src: T) -> T {
    observed
}

fn identity<T: CasWord>(_observed: T, src: T) -> T {
    src
}

/// The read-modify-write operations the emulated sequences can encode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RmwOp {
    Swap,
    Add,
    Sub,
    And,
    AndNot,
    Or,
    Eor,
    Neg,
}

fn rmw_desired_fn<T: CasWord>(op: RmwOp) -> CasFn<T> {
    match op {
        RmwOp::Swap => |_, src| src,
        RmwOp::Add => |v, src| v.wrapping_add(src),
        RmwOp::Sub => |v, src| v.wrapping_sub(src),
        RmwOp::And => |v, src| v.and(src),
        RmwOp::AndNot => |v, src| v.and_not(src),
        RmwOp::Or => |v, src| v.or(src),
        RmwOp::Eor => |v, src| v.xor(src),
        RmwOp::Neg => |v, _| v.wrapping_neg(),
    }
}

fn container_load(addr: u64, bytes: u64) -> u128 {
    match bytes {
        4 => atomics::load_acquire_u32(addr).into(),
        8 => atomics::load_acquire_u64(addr).into(),
        16 => atomics::load_acquire_u128(addr),
        _ => unreachable!(),
    }
}

fn container_cas(expected: &mut u128, desired: u128, addr: u64, bytes: u64) -> bool {
    match bytes {
        4 => {
            let mut e = *expected as u32;
            let ok = atomics::store_cas_u32(&mut e, desired as u32, addr);
            *expected = e.into();
            ok
        }
        8 => {
            let mut e = *expected as u64;
            let ok = atomics::store_cas_u64(&mut e, desired as u64, addr);
            *expected = e.into();
            ok
        }
        16 => atomics::store_cas_u128(expected, desired, addr),
        _ => unreachable!(),
    }
}

fn half_load(addr: u64, bytes: u64) -> u128 {
    match bytes {
        1 => atomics::load_acquire_u8(addr).into(),
        4 => atomics::load_acquire_u32(addr).into(),
        8 => atomics::load_acquire_u64(addr).into(),
        _ => unreachable!(),
    }
}

fn half_cas(expected: &mut u128, desired: u128, addr: u64, bytes: u64) -> bool {
    match bytes {
        1 => {
            let mut e = *expected as u8;
            let ok = atomics::store_cas_u8(&mut e, desired as u8, addr);
            *expected = e.into();
            ok
        }
        4 => {
            let mut e = *expected as u32;
            let ok = atomics::store_cas_u32(&mut e, desired as u32, addr);
            *expected = e.into();
            ok
        }
        8 => {
            let mut e = *expected as u64;
            let ok = atomics::store_cas_u64(&mut e, desired as u64, addr);
            *expected = e.into();
            ok
        }
        _ => unreachable!(),
    }
}

/// Emulates a W-wide CAS/RMW at `addr`, picking the decomposition by
/// (width, offset-in-16-byte-line).
///
/// `retry == false` gives CAS semantics: one architectural attempt whose
/// failure returns the observed slice as the failed expected value.
/// `retry == true` gives RMW/store semantics: the loop runs until the update
/// commits (or, on a straddle, until it tears; see [`cas_split`]).
///
/// Returns the pre-operation value of the slice on success, or the
/// failed-expected slice on CAS failure.
fn do_cas<T: CasWord>(
    desired_src: T,
    expected_src: T,
    addr: u64,
    expected_fn: CasFn<T>,
    desired_fn: CasFn<T>,
    retry: bool,
) -> T {
    match T::BYTES {
        2 => {
            if addr & 63 == 63 {
                telemetry::record_split_lock();
            }
            if addr & 15 == 15 {
                telemetry::record_split_lock_16b();
                cas_split(desired_src, expected_src, addr, expected_fn, desired_fn, retry, 1)
            } else if addr & 0b111 == 7 {
                cas_contained(desired_src, expected_src, addr, expected_fn, desired_fn, retry, 16)
            } else if addr & 0b11 == 3 {
                cas_contained(desired_src, expected_src, addr, expected_fn, desired_fn, retry, 8)
            } else {
                cas_contained(desired_src, expected_src, addr, expected_fn, desired_fn, retry, 4)
            }
        }
        4 => {
            if addr & 63 > 60 {
                telemetry::record_split_lock();
            }
            if addr & 15 > 12 {
                telemetry::record_split_lock_16b();
                cas_split(desired_src, expected_src, addr, expected_fn, desired_fn, retry, 4)
            } else if addr & 0b111 >= 5 {
                cas_contained(desired_src, expected_src, addr, expected_fn, desired_fn, retry, 16)
            } else {
                cas_contained(desired_src, expected_src, addr, expected_fn, desired_fn, retry, 8)
            }
        }
        8 => {
            if addr & 63 > 56 {
                telemetry::record_split_lock();
            }
            if addr & 15 > 8 {
                telemetry::record_split_lock_16b();
                cas_split(desired_src, expected_src, addr, expected_fn, desired_fn, retry, 8)
            } else {
                cas_contained(desired_src, expected_src, addr, expected_fn, desired_fn, retry, 16)
            }
        }
        _ => unreachable!(),
    }
}

/// Single-container loop: the access fits inside one aligned container of
/// `container_bytes`.
fn cas_contained<T: CasWord>(
    desired_src: T,
    expected_src: T,
    addr: u64,
    expected_fn: CasFn<T>,
    desired_fn: CasFn<T>,
    retry: bool,
    container_bytes: u64,
) -> T {
    let shift = ((addr & (container_bytes - 1)) * 8) as u32;
    let aligned = addr & !(container_bytes - 1);
    let mask = (((1u128 << (T::BITS - 1)) << 1) - 1) << shift;

    loop {
        let actual = container_load(aligned, container_bytes);
        let slice = T::from_u128(actual >> shift);

        let desired = desired_fn(slice, desired_src);
        let expected = expected_fn(slice, expected_src);

        let mut tmp_expected = (actual & !mask) | (expected.to_u128() << shift);
        let tmp_desired = (tmp_expected & !mask) | (desired.to_u128() << shift);

        if container_cas(&mut tmp_expected, tmp_desired, aligned, container_bytes) {
            return expected;
        }

        if retry {
            // Atomic memory ops retry until they commit.
            continue;
        }

        // Bits outside our slice changed: not a guest-visible failure, go
        // again.
        if ((tmp_expected & !mask) ^ (tmp_desired & !mask)) != 0 {
            continue;
        }

        // Our slice no longer matches (or someone else already stored our
        // desired value). Either way the CAS failed for the guest; hand back
        // what memory held.
        return T::from_u128((tmp_expected & mask) >> shift);
    }
}

/// Cross-boundary dual-CAS loop: the access straddles two adjacent aligned
/// containers of `half_bytes`.
///
/// The upper half is loaded and CASed first. If the upper CAS commits and the
/// lower fails, the operation has torn; there is no recovery for RMW
/// semantics without transactional memory, so the observed slice is returned
/// as a failed expected value and the guest re-evaluates.
fn cas_split<T: CasWord>(
    desired_src: T,
    expected_src: T,
    addr: u64,
    expected_fn: CasFn<T>,
    desired_fn: CasFn<T>,
    retry: bool,
    half_bytes: u64,
) -> T {
    let align = addr & (half_bytes - 1);
    let shift = (align * 8) as u32;
    let lower_addr = addr & !(half_bytes - 1);
    let upper_addr = lower_addr + half_bytes;
    let half_bits = (half_bytes * 8) as u32;
    let half_mask = ((1u128 << (half_bits - 1)) << 1) - 1;
    let mask = (((1u128 << (T::BITS - 1)) << 1) - 1) << shift;

    loop {
        // Upper first; the guest observes the halves in this order.
        let upper = half_load(upper_addr, half_bytes);
        let actual = (upper << half_bits) | half_load(lower_addr, half_bytes);
        let slice = T::from_u128(actual >> shift);

        let desired = desired_fn(slice, desired_src);
        let expected = expected_fn(slice, expected_src);

        let tmp_expected = (actual & !mask) | (expected.to_u128() << shift);
        let tmp_desired = (tmp_expected & !mask) | (desired.to_u128() << shift);

        let mut observed = actual;
        let mut tear = false;
        if tmp_expected == actual {
            let mut expected_upper = tmp_expected >> half_bits;
            let mut expected_lower = tmp_expected & half_mask;
            if half_cas(&mut expected_upper, tmp_desired >> half_bits, upper_addr, half_bytes) {
                if half_cas(&mut expected_lower, tmp_desired & half_mask, lower_addr, half_bytes) {
                    return expected;
                }
                // The upper half is already committed: the CAS tore.
                tear = true;
            }
            observed = (expected_upper << half_bits) | expected_lower;
        }

        // Bits outside our slice changed: go again.
        if ((observed & !mask) ^ (tmp_desired & !mask)) != 0 {
            continue;
        }

        let failed = T::from_u128((observed & mask) >> shift);
        if retry {
            if tear {
                // Nothing sane to do here without TME; let the guest see an
                // unexpected value.
                return failed;
            }
            continue;
        }
        return failed;
    }
}

/// Emulates a misaligned W-wide acquire load.
fn do_load<T: CasWord>(addr: u64) -> T {
    match T::BYTES {
        2 => {
            if addr & 15 == 15 {
                load_split(addr, 1)
            } else if addr & 0b111 == 7 {
                load_contained(addr, 16)
            } else if addr & 0b11 == 3 {
                load_contained(addr, 8)
            } else {
                load_contained(addr, 4)
            }
        }
        4 => {
            if addr & 15 > 12 {
                load_split(addr, 4)
            } else if addr & 0b111 >= 5 {
                load_contained(addr, 16)
            } else {
                load_contained(addr, 8)
            }
        }
        8 => {
            if addr & 15 > 8 {
                load_split(addr, 8)
            } else {
                load_contained(addr, 16)
            }
        }
        _ => unreachable!(),
    }
}

fn load_contained<T: CasWord>(addr: u64, container_bytes: u64) -> T {
    let shift = ((addr & (container_bytes - 1)) * 8) as u32;
    let aligned = addr & !(container_bytes - 1);
    T::from_u128(container_load(aligned, container_bytes) >> shift)
}

fn load_split<T: CasWord>(addr: u64, half_bytes: u64) -> T {
    let shift = ((addr & (half_bytes - 1)) * 8) as u32;
    let lower_addr = addr & !(half_bytes - 1);
    let upper_addr = lower_addr + half_bytes;
    let half_bits = (half_bytes * 8) as u32;
    // Upper first.
    let upper = half_load(upper_addr, half_bytes);
    let value = (upper << half_bits) | half_load(lower_addr, half_bytes);
    T::from_u128(value >> shift)
}

/// Emulates a misaligned 128-bit acquire load as two monitor-clearing 128-bit
/// loads, returning the (lower, upper) destination register values.
fn do_load128(addr: u64) -> (u64, u64) {
    let align = (addr & 15) as usize;
    let base = addr & !15;

    // Upper loaded first, matching the other split loads.
    let upper = atomics::load_acquire_u128(base + 16);
    let lower = atomics::load_acquire_u128(base);
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(&lower.to_le_bytes());
    bytes[16..].copy_from_slice(&upper.to_le_bytes());

    let lo = u64::from_le_bytes(bytes[align..align + 8].try_into().unwrap());
    let hi = u64::from_le_bytes(bytes[align + 8..align + 16].try_into().unwrap());
    (lo, hi)
}

/// CASP: 64-bit payload compare-and-swap pair built from two 32-bit
/// registers. The 64-bit-pair form is not emitted for guest atomics and is
/// declined.
fn handle_cas_pair(ctx: &mut dyn HostContext, instr: u32) -> bool {
    let pair_64bit = (instr >> 30) & 1 != 0;
    if pair_64bit {
        return false;
    }

    let desired_reg = insn::rd(instr);
    let expected_reg = insn::rm(instr);
    let addr = ctx.gpr(insn::rn(instr));

    let desired =
        (ctx.gpr(desired_reg + 1) as u32 as u64) << 32 | ctx.gpr(desired_reg) as u32 as u64;
    let expected =
        (ctx.gpr(expected_reg + 1) as u32 as u64) << 32 | ctx.gpr(expected_reg) as u32 as u64;

    let result = do_cas::<u64>(desired, expected, addr, identity, identity, false);

    if expected_reg != insn::ZERO_REG {
        ctx.set_gpr(expected_reg, result as u32 as u64);
    }
    if expected_reg + 1 != insn::ZERO_REG {
        ctx.set_gpr(expected_reg + 1, result >> 32);
    }
    true
}

/// Single-register CAS. One-byte CAS cannot misalign and is declined.
fn handle_cas(ctx: &mut dyn HostContext, instr: u32) -> bool {
    match insn::access_size(instr) {
        2 => run_cas::<u16>(ctx, instr),
        4 => run_cas::<u32>(ctx, instr),
        8 => run_cas::<u64>(ctx, instr),
        _ => return false,
    }
    true
}

fn run_cas<T: CasWord>(ctx: &mut dyn HostContext, instr: u32) {
    let desired_reg = insn::rd(instr);
    let expected_reg = insn::rm(instr);
    let addr = ctx.gpr(insn::rn(instr));

    let result = do_cas::<T>(
        T::from_gpr(ctx.gpr(desired_reg)),
        T::from_gpr(ctx.gpr(expected_reg)),
        addr,
        identity,
        identity,
        false,
    );

    // Pass or fail, the expected register observes memory.
    if expected_reg != insn::ZERO_REG {
        ctx.set_gpr(expected_reg, result.to_gpr());
    }
}

/// LSE atomic read-modify-write (LDADDAL/LDCLRAL/LDEORAL/LDSETAL/SWPAL).
fn handle_atomic_mem_op(ctx: &mut dyn HostContext, instr: u32) -> bool {
    let op = match AtomicMemOp::try_from(insn::atomic_mem_op(instr)) {
        Ok(AtomicMemOp::Add) => RmwOp::Add,
        Ok(AtomicMemOp::Clr) => RmwOp::AndNot,
        Ok(AtomicMemOp::Eor) => RmwOp::Eor,
        Ok(AtomicMemOp::Set) => RmwOp::Or,
        Ok(AtomicMemOp::Swap) => RmwOp::Swap,
        Err(_) => panic!(
            "unhandled atomic memory op {:#x} at misaligned trap",
            insn::atomic_mem_op(instr)
        ),
    };

    match insn::access_size(instr) {
        2 => run_atomic_mem_op::<u16>(ctx, instr, op),
        4 => run_atomic_mem_op::<u32>(ctx, instr, op),
        8 => run_atomic_mem_op::<u64>(ctx, instr, op),
        _ => return false,
    }
    true
}

fn run_atomic_mem_op<T: CasWord>(ctx: &mut dyn HostContext, instr: u32, op: RmwOp) {
    let result_reg = insn::rd(instr);
    let source_reg = insn::rm(instr);
    let addr = ctx.gpr(insn::rn(instr));

    let result = do_cas::<T>(
        T::from_gpr(ctx.gpr(source_reg)),
        T::from_u128(0),
        addr,
        nop_expected,
        rmw_desired_fn(op),
        true,
    );

    // The destination register observes the value before the operation.
    if result_reg != insn::ZERO_REG {
        ctx.set_gpr(result_reg, result.to_gpr());
    }
}

/// Misaligned LDAR.
fn handle_atomic_load(ctx: &mut dyn HostContext, instr: u32) -> bool {
    let result_reg = insn::rd(instr);
    let addr = ctx.gpr(insn::rn(instr));

    let result = match insn::access_size(instr) {
        2 => do_load::<u16>(addr).to_gpr(),
        4 => do_load::<u32>(addr).to_gpr(),
        8 => do_load::<u64>(addr).to_gpr(),
        _ => return false,
    };

    if result_reg != insn::ZERO_REG {
        ctx.set_gpr(result_reg, result);
    }
    true
}

/// Misaligned STLR, emulated as a retrying masked CAS so the release store
/// always commits.
fn handle_atomic_store(ctx: &mut dyn HostContext, instr: u32) -> bool {
    let data_reg = insn::rd(instr);
    let addr = ctx.gpr(insn::rn(instr));
    let data = ctx.gpr(data_reg);

    match insn::access_size(instr) {
        2 => {
            do_cas::<u16>(data as u16, 0, addr, nop_expected, identity, true);
        }
        4 => {
            do_cas::<u32>(data as u32, 0, addr, nop_expected, identity, true);
        }
        8 => {
            do_cas::<u64>(data, 0, addr, nop_expected, identity, true);
        }
        _ => return false,
    }
    true
}

/// Misaligned 128-bit acquire load pair.
fn handle_atomic_load_pair(ctx: &mut dyn HostContext, instr: u32) -> bool {
    let result_reg = insn::rd(instr);
    let result_reg2 = insn::rt2(instr);
    let addr = ctx.gpr(insn::rn(instr));

    let (lo, hi) = do_load128(addr);
    if result_reg != insn::ZERO_REG {
        ctx.set_gpr(result_reg, lo);
    }
    if result_reg2 != insn::ZERO_REG {
        ctx.set_gpr(result_reg2, hi);
    }
    true
}

/// Emulates the JIT's exclusive idiom when its load-exclusive traps.
///
/// The JIT emits a fixed shape for non-LSE guest atomics:
///
/// ```text
///   ldaxr   tmp, [addr]
///   <alu>   res, tmp, src      ; absent for swap
///   stlxr   status, res, [addr]
///   cbnz    status, <loop top>
/// ```
///
/// Identification assumptions, which the JIT upholds:
/// - An ALU op's first source is the loaded value and its second source is
///   the incoming data, except SUB from the zero register, which encodes NEG
///   of the loaded value.
/// - No ALU op between the exclusive pair means swap, with the data taken
///   from the store's data register.
/// - The store's status register equals its data register exactly when the
///   sequence is the non-fetch variant (the JIT reuses the scratch).
///
/// Returns the byte count from the load-exclusive through the CBNZ so the
/// caller can step the host PC over the whole loop.
fn handle_exclusive_idiom(ctx: &mut dyn HostContext, pc: u64, instr: u32) -> Option<u64> {
    let result_reg = insn::rd(instr);
    let addr_reg = insn::rn(instr);
    let addr = ctx.gpr(addr_reg);

    let mut instructions_to_skip = 0u64;
    let mut atomic_fetch = false;
    let mut data_source_reg = 0u32;
    let mut op = RmwOp::Swap;

    // Scan forward at most five instructions for the rest of the idiom.
    for i in 1..6u64 {
        let next = unsafe { ((pc + i * 4) as *const u32).read() };
        if next & insn::ALU_OP_MASK == insn::ADD_INST {
            op = RmwOp::Add;
            data_source_reg = insn::rm(next);
        } else if next & insn::ALU_OP_MASK == insn::SUB_INST {
            op = if insn::rn(next) == insn::ZERO_REG {
                RmwOp::Neg
            } else {
                RmwOp::Sub
            };
            data_source_reg = insn::rm(next);
        } else if next & insn::ALU_OP_MASK == insn::AND_INST {
            op = RmwOp::And;
            data_source_reg = insn::rm(next);
        } else if next & insn::ALU_OP_MASK == insn::OR_INST {
            op = RmwOp::Or;
            data_source_reg = insn::rm(next);
        } else if next & insn::ALU_OP_MASK == insn::EOR_INST {
            op = RmwOp::Eor;
            data_source_reg = insn::rm(next);
        } else if next & insn::STLXR_MASK == insn::STLXR_INST {
            assert_eq!(
                insn::rn(next),
                addr_reg,
                "store-exclusive memory register does not match its load-exclusive"
            );
            let status_reg = insn::rm(next);
            let store_data_reg = insn::rd(next);
            atomic_fetch = status_reg != store_data_reg;
            if op == RmwOp::Swap {
                // No ALU op in between: the data comes straight from the
                // store.
                data_source_reg = store_data_reg;
            }
        } else if next & insn::CBNZ_MASK == insn::CBNZ_INST {
            instructions_to_skip = i + 1;
            break;
        } else {
            panic!("unknown instruction {next:#010x} inside exclusive atomic idiom");
        }
    }

    if instructions_to_skip == 0 {
        return None;
    }

    let pre_op = match insn::access_size(instr) {
        2 => run_exclusive_rmw::<u16>(ctx, addr, data_source_reg, op),
        4 => run_exclusive_rmw::<u32>(ctx, addr, data_source_reg, op),
        8 => run_exclusive_rmw::<u64>(ctx, addr, data_source_reg, op),
        _ => return None,
    };

    if atomic_fetch && result_reg != insn::ZERO_REG {
        // The fetch variant hands the pre-op memory value back through the
        // load's destination register.
        ctx.set_gpr(result_reg, pre_op);
    }

    Some(instructions_to_skip * 4)
}

fn run_exclusive_rmw<T: CasWord>(
    ctx: &mut dyn HostContext,
    addr: u64,
    data_source_reg: u32,
    op: RmwOp,
) -> u64 {
    do_cas::<T>(
        T::from_gpr(ctx.gpr(data_source_reg)),
        T::from_u128(0),
        addr,
        nop_expected,
        rmw_desired_fn(op),
        true,
    )
    .to_gpr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockContext;

    /// A 64-byte-aligned chunk of "guest" memory.
    #[repr(align(64))]
    struct Page([u8; 192]);

    impl Page {
        fn new() -> Box<Self> {
            Box::new(Page([0; 192]))
        }

        fn addr(&self, offset: u64) -> u64 {
            self.0.as_ptr() as u64 + offset
        }

        fn read_u32(&self, offset: usize) -> u32 {
            u32::from_le_bytes(self.0[offset..offset + 4].try_into().unwrap())
        }

        fn write_u32(&mut self, offset: usize, value: u32) {
            self.0[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }

        fn read_u64(&self, offset: usize) -> u64 {
            u64::from_le_bytes(self.0[offset..offset + 8].try_into().unwrap())
        }

        fn write_u64(&mut self, offset: usize, value: u64) {
            self.0[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn encode_casal(size: u32, expected: u32, desired: u32, addr: u32) -> u32 {
        insn::CASAL_INST | (size << 30) | (expected << 16) | (addr << 5) | desired
    }

    fn encode_ldaddal(size: u32, src: u32, dst: u32, addr: u32) -> u32 {
        insn::ATOMIC_MEM_INST | (size << 30) | (src << 16) | (addr << 5) | dst
    }

    fn encode_swpal(size: u32, src: u32, dst: u32, addr: u32) -> u32 {
        insn::ATOMIC_MEM_INST | (size << 30) | (0x8 << 12) | (src << 16) | (addr << 5) | dst
    }

    fn encode_ldar(size: u32, dst: u32, addr: u32) -> u32 {
        insn::LDAR_INST | (size << 30) | (addr << 5) | dst
    }

    fn encode_stlr(size: u32, data: u32, addr: u32) -> u32 {
        insn::STLR_INST | (size << 30) | (addr << 5) | data
    }

    fn encode_ldaxr(size: u32, dst: u32, addr: u32) -> u32 {
        insn::LDAXR_INST | (size << 30) | (addr << 5) | dst
    }

    fn encode_stlxr(size: u32, status: u32, data: u32, addr: u32) -> u32 {
        insn::STLXR_INST | (size << 30) | (status << 16) | (addr << 5) | data
    }

    fn encode_cbnz(reg: u32) -> u32 {
        insn::CBNZ_INST | (0x1000 << 5) | reg
    }

    fn encode_ldaxp(dst: u32, dst2: u32, addr: u32) -> u32 {
        insn::LDAXP_INST | (dst2 << 10) | (addr << 5) | dst
    }

    fn encode_caspal(expected: u32, desired: u32, addr: u32) -> u32 {
        insn::CASPAL_INST | (expected << 16) | (addr << 5) | desired
    }

    /// Runs one instruction through the trap handler with pc pointed at it.
    fn trap(ctx: &mut MockContext, code: &[u32]) -> bool {
        ctx.pc = code.as_ptr() as u64;
        handle_misaligned_access(ctx, libc::BUS_ADRALN)
    }

    #[test]
    fn declines_non_alignment_sigbus() {
        let mut ctx = MockContext::new();
        let code = [encode_casal(0b11, 2, 3, 5)];
        ctx.pc = code.as_ptr() as u64;
        assert!(!handle_misaligned_access(&mut ctx, libc::BUS_ADRERR));
    }

    #[test]
    fn declines_unknown_instruction() {
        let mut ctx = MockContext::new();
        let code = [0xd503_201f]; // nop
        assert!(!trap(&mut ctx, &code));
    }

    #[test]
    fn cas32_straddling_16b_boundary() {
        // Scenario S1: 4-byte CAS at offset 13 of a 16-byte line.
        telemetry::reset();
        let mut page = Page::new();
        page.write_u32(13, 0xAABB_CCDD);

        let mut ctx = MockContext::new();
        ctx.regs[5] = page.addr(13);
        ctx.regs[2] = 0xAABB_CCDD; // expected
        ctx.regs[3] = 0x1122_3344; // desired
        let code = [encode_casal(0b10, 2, 3, 5)];

        assert!(trap(&mut ctx, &code));
        assert_eq!(ctx.pc, code.as_ptr() as u64 + 4);
        assert_eq!(page.read_u32(13), 0x1122_3344);
        assert_eq!(ctx.regs[2], 0xAABB_CCDD);
        assert!(telemetry::split_lock_16b());
        assert!(!telemetry::split_lock());
    }

    #[test]
    fn cas64_within_line_mismatch_leaves_memory() {
        // Scenario S2: 8-byte CAS occupying the top half of a 16-byte line.
        telemetry::reset();
        let mut page = Page::new();
        page.write_u64(8, 0x0011_2233_4455_6677);

        let mut ctx = MockContext::new();
        ctx.regs[5] = page.addr(8);
        ctx.regs[2] = 0; // expected: mismatch
        ctx.regs[3] = u64::MAX;
        let code = [encode_casal(0b11, 2, 3, 5)];

        assert!(trap(&mut ctx, &code));
        assert_eq!(page.read_u64(8), 0x0011_2233_4455_6677);
        assert_eq!(ctx.regs[2], 0x0011_2233_4455_6677);
        assert!(!telemetry::split_lock());
        assert!(!telemetry::split_lock_16b());
    }

    #[test]
    fn cas64_straddling_16b_boundary() {
        telemetry::reset();
        let mut page = Page::new();
        page.write_u64(9, 0x0102_0304_0506_0708);

        let mut ctx = MockContext::new();
        ctx.regs[5] = page.addr(9);
        ctx.regs[2] = 0x0102_0304_0506_0708;
        ctx.regs[3] = 0x1112_1314_1516_1718;
        let code = [encode_casal(0b11, 2, 3, 5)];

        assert!(trap(&mut ctx, &code));
        assert_eq!(page.read_u64(9), 0x1112_1314_1516_1718);
        assert_eq!(ctx.regs[2], 0x0102_0304_0506_0708);
        assert!(telemetry::split_lock_16b());
    }

    #[test]
    fn cas16_dual_byte_at_offset_15() {
        telemetry::reset();
        let mut page = Page::new();
        page.0[15] = 0x34;
        page.0[16] = 0x12;

        let mut ctx = MockContext::new();
        ctx.regs[5] = page.addr(15);
        ctx.regs[2] = 0x1234;
        ctx.regs[3] = 0x5678;
        let code = [encode_casal(0b01, 2, 3, 5)];

        assert!(trap(&mut ctx, &code));
        assert_eq!(page.0[15], 0x78);
        assert_eq!(page.0[16], 0x56);
        assert_eq!(ctx.regs[2], 0x1234);
        assert!(telemetry::split_lock_16b());
    }

    #[test]
    fn cas_split_lock_telemetry_at_cacheline() {
        telemetry::reset();
        let mut page = Page::new();
        page.write_u32(62, 0);

        let mut ctx = MockContext::new();
        ctx.regs[5] = page.addr(62);
        ctx.regs[2] = 0;
        ctx.regs[3] = 0x0102_0304;
        let code = [encode_casal(0b10, 2, 3, 5)];

        assert!(trap(&mut ctx, &code));
        assert_eq!(page.read_u32(62), 0x0102_0304);
        assert!(telemetry::split_lock());
        assert!(telemetry::split_lock_16b());
    }

    #[test]
    fn casp_pair_success_and_failure() {
        let mut page = Page::new();
        page.write_u64(6, 0x8899_aabb_ccdd_eeff);

        // casp with expected pair (w2, w3), desired pair (w6, w7).
        let mut ctx = MockContext::new();
        ctx.regs[5] = page.addr(6);
        ctx.regs[2] = 0xccdd_eeff;
        ctx.regs[3] = 0x8899_aabb;
        ctx.regs[6] = 0x0405_0607;
        ctx.regs[7] = 0x0001_0203;
        let code = [encode_caspal(2, 6, 5)];

        assert!(trap(&mut ctx, &code));
        assert_eq!(page.read_u64(6), 0x0001_0203_0405_0607);
        assert_eq!(ctx.regs[2], 0xccdd_eeff);
        assert_eq!(ctx.regs[3], 0x8899_aabb);

        // Run again with a now-stale expected pair: memory is untouched and
        // the expected registers observe the stored value.
        let mut ctx2 = MockContext::new();
        ctx2.regs[5] = page.addr(6);
        ctx2.regs[2] = 0xccdd_eeff;
        ctx2.regs[3] = 0x8899_aabb;
        ctx2.regs[6] = 0;
        ctx2.regs[7] = 0;
        assert!(trap(&mut ctx2, &code));
        assert_eq!(page.read_u64(6), 0x0001_0203_0405_0607);
        assert_eq!(ctx2.regs[2], 0x0405_0607);
        assert_eq!(ctx2.regs[3], 0x0001_0203);
    }

    #[test]
    fn ldaddal_rmw_and_fetch_result() {
        let mut page = Page::new();
        page.write_u32(7, 40);

        let mut ctx = MockContext::new();
        ctx.regs[3] = page.addr(7);
        ctx.regs[1] = 2;
        let code = [encode_ldaddal(0b10, 1, 2, 3)];

        assert!(trap(&mut ctx, &code));
        assert_eq!(page.read_u32(7), 42);
        // Destination observes the pre-op value.
        assert_eq!(ctx.regs[2], 40);
    }

    #[test]
    fn swpal_swaps() {
        let mut page = Page::new();
        page.write_u64(3, 0x5555);

        let mut ctx = MockContext::new();
        ctx.regs[3] = page.addr(3);
        ctx.regs[1] = 0xaaaa;
        let code = [encode_swpal(0b11, 1, 2, 3)];

        assert!(trap(&mut ctx, &code));
        assert_eq!(page.read_u64(3), 0xaaaa);
        assert_eq!(ctx.regs[2], 0x5555);
    }

    #[test]
    fn misaligned_acquire_load() {
        let mut page = Page::new();
        page.write_u64(7, 0x1122_3344_5566_7788);

        let mut ctx = MockContext::new();
        ctx.regs[3] = page.addr(7);
        let code = [encode_ldar(0b11, 1, 3)];

        assert!(trap(&mut ctx, &code));
        assert_eq!(ctx.regs[1], 0x1122_3344_5566_7788);
    }

    #[test]
    fn misaligned_release_store() {
        let mut page = Page::new();

        let mut ctx = MockContext::new();
        ctx.regs[3] = page.addr(15);
        ctx.regs[1] = 0xdead_beef;
        let code = [encode_stlr(0b10, 1, 3)];

        assert!(trap(&mut ctx, &code));
        assert_eq!(page.read_u32(15), 0xdead_beef);
    }

    #[test]
    fn misaligned_load_pair() {
        let mut page = Page::new();
        page.write_u64(9, 0x0101_0202_0303_0404);
        page.write_u64(17, 0x0505_0606_0707_0808);

        let mut ctx = MockContext::new();
        ctx.regs[3] = page.addr(9);
        let code = [encode_ldaxp(1, 2, 3)];

        assert!(trap(&mut ctx, &code));
        assert_eq!(ctx.regs[1], 0x0101_0202_0303_0404);
        assert_eq!(ctx.regs[2], 0x0505_0606_0707_0808);
    }

    #[test]
    fn exclusive_idiom_non_fetch_add() {
        // Scenario S3: ldaxr/add/stlxr/cbnz at a straddling address.
        let mut page = Page::new();
        page.write_u32(14, 0x0000_0005);

        let mut ctx = MockContext::new();
        ctx.regs[0] = page.addr(14);
        ctx.regs[1] = 0xdead; // scratch, must not be written back
        ctx.regs[2] = 7;
        let code = [
            encode_ldaxr(0b10, 1, 0),
            insn::ADD_INST | (2 << 16) | (1 << 5) | 1,
            encode_stlxr(0b10, 1, 1, 0),
            encode_cbnz(1),
        ];

        assert!(trap(&mut ctx, &code));
        assert_eq!(page.read_u32(14), 0x0000_000C);
        assert_eq!(ctx.pc, code.as_ptr() as u64 + 16);
        assert_eq!(ctx.regs[1], 0xdead);
    }

    #[test]
    fn exclusive_idiom_fetch_add_writes_back() {
        let mut page = Page::new();
        page.write_u32(13, 100);

        let mut ctx = MockContext::new();
        ctx.regs[0] = page.addr(13);
        ctx.regs[2] = 1;
        let code = [
            encode_ldaxr(0b10, 1, 0),
            insn::ADD_INST | (2 << 16) | (1 << 5) | 3,
            encode_stlxr(0b10, 4, 3, 0),
            encode_cbnz(4),
        ];

        assert!(trap(&mut ctx, &code));
        assert_eq!(page.read_u32(13), 101);
        assert_eq!(ctx.regs[1], 100);
        assert_eq!(ctx.pc, code.as_ptr() as u64 + 16);
    }

    #[test]
    fn exclusive_idiom_neg() {
        let mut page = Page::new();
        page.write_u32(14, 5);

        let mut ctx = MockContext::new();
        ctx.regs[0] = page.addr(14);
        let code = [
            encode_ldaxr(0b10, 1, 0),
            insn::SUB_INST | (1 << 16) | (insn::ZERO_REG << 5) | 3,
            encode_stlxr(0b10, 4, 3, 0),
            encode_cbnz(4),
        ];

        assert!(trap(&mut ctx, &code));
        assert_eq!(page.read_u32(14), 5u32.wrapping_neg());
    }

    #[test]
    fn exclusive_idiom_swap() {
        let mut page = Page::new();
        page.write_u64(11, 0x1111);

        let mut ctx = MockContext::new();
        ctx.regs[0] = page.addr(11);
        ctx.regs[2] = 0x2222;
        let code = [
            encode_ldaxr(0b11, 1, 0),
            encode_stlxr(0b11, 4, 2, 0),
            encode_cbnz(4),
        ];

        assert!(trap(&mut ctx, &code));
        assert_eq!(page.read_u64(11), 0x2222);
        // Fetch form: destination observes the old value.
        assert_eq!(ctx.regs[1], 0x1111);
        assert_eq!(ctx.pc, code.as_ptr() as u64 + 12);
    }

    #[test]
    fn contained_load_strategies_cover_all_offsets() {
        let mut page = Page::new();
        for offset in 0..32 {
            page.0[offset] = offset as u8;
        }
        for offset in 1..15u64 {
            let expected = u16::from_le_bytes([offset as u8, offset as u8 + 1]);
            assert_eq!(do_load::<u16>(page.addr(offset)), expected);
        }
        for offset in 1..13u64 {
            assert_eq!(
                do_load::<u32>(page.addr(offset)),
                u32::from_le_bytes([
                    offset as u8,
                    offset as u8 + 1,
                    offset as u8 + 2,
                    offset as u8 + 3
                ])
            );
        }
    }
}
