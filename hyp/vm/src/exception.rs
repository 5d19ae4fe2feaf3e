//! Guest exception injection.
//!
//! When a guest access faults in a way the hypervisor cannot (or will not)
//! handle, the fault is reflected back into the guest's EL1 as a
//! synchronous external abort: the guest's ESR/FAR/ELR/SPSR are set up as
//! the hardware would on a native exception, and the VCPU's return state
//! is redirected to the appropriate vector slot of VBAR_EL1.
//!
//! Everything operates on the VCPU's saved register file, so the logic is
//! identical on hardware and under `cargo test`; the trap exit path loads
//! the modified sysregs back into the CPU.

use boson_core::{kdebug, kwarn};
use boson_sched::VcpuRegs;

use crate::esr::{self, ec, fsc};

// SPSR.M values for 64-bit EL0/EL1 and 32-bit user.
const SPSR_M_EL0T: u64 = 0b0000;
const SPSR_M_EL1T: u64 = 0b0100;
const SPSR_M_EL1H: u64 = 0b0101;
const SPSR_M_EL2T: u64 = 0b1000;
const SPSR_M_EL2H: u64 = 0b1001;
const SPSR_M_AA32_USER: u64 = 0b10000;
const SPSR_M_MASK: u64 = 0x1f;

// SPSR bits adjusted during injection.
const SPSR_F: u64 = 1 << 6;
const SPSR_I: u64 = 1 << 7;
const SPSR_A: u64 = 1 << 8;
const SPSR_D: u64 = 1 << 9;
const SPSR_IL: u64 = 1 << 20;
const SPSR_SS: u64 = 1 << 21;

// Vector slot offsets from VBAR_EL1.
const VECTOR_CURRENT_SP0: u64 = 0x000;
const VECTOR_CURRENT_SPX: u64 = 0x200;
const VECTOR_LOWER_A64: u64 = 0x400;
const VECTOR_LOWER_A32: u64 = 0x600;

/// Outcome of an injection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectResult {
    /// The abort was written into the guest's EL1 state.
    Injected,
    /// Injecting would recurse (the fault came from the guest's own sync
    /// vector); the VCPU should be blocked instead.
    WouldLoop,
}

/// Redirects the VCPU to its EL1 synchronous exception vector.
///
/// The guest's SPSR_EL1 receives the pre-exception SPSR, ELR_EL1 the
/// faulting pc; the new SPSR masks all of DAIF, clears IL and the
/// single-step bit, and lands the guest in handler mode (EL1h).
fn enter_vector(regs: &mut VcpuRegs) {
    let vector_base = regs.sysregs.vbar_el1;
    let spsr = regs.spsr_el2;

    let slot = match spsr & SPSR_M_MASK {
        SPSR_M_EL0T => VECTOR_LOWER_A64,
        SPSR_M_EL1T => VECTOR_CURRENT_SP0,
        SPSR_M_EL1H => VECTOR_CURRENT_SPX,
        SPSR_M_AA32_USER => VECTOR_LOWER_A32,
        SPSR_M_EL2T | SPSR_M_EL2H => panic!("injecting exception to EL2"),
        mode => panic!("illegal or unsupported guest CPU mode {mode:#x}"),
    };

    regs.sysregs.spsr_el1 = spsr;
    regs.sysregs.elr_el1 = regs.pc;

    let mut new_spsr = spsr;
    new_spsr |= SPSR_D | SPSR_A | SPSR_I | SPSR_F;
    new_spsr &= !(SPSR_IL | SPSR_SS);
    new_spsr = (new_spsr & !SPSR_M_MASK) | SPSR_M_EL1H;
    regs.spsr_el2 = new_spsr;

    regs.pc = vector_base + slot;
}

/// Returns `true` when the faulting pc sits in the guest's EL1h sync
/// vector slot: injecting there would loop forever.
fn inject_would_loop(regs: &VcpuRegs) -> bool {
    if regs.spsr_el2 & SPSR_M_MASK != SPSR_M_EL1H {
        return false;
    }
    let el1h_sync = regs.sysregs.vbar_el1 + VECTOR_CURRENT_SPX;
    regs.pc & !0x7f == el1h_sync
}

/// Injects a synchronous external abort for an unhandled stage-2 data or
/// instruction abort.
///
/// `esr_el2` is the trapped syndrome, `far` the faulting virtual address
/// and `ipa` the faulting intermediate physical address (for the log).
/// Returns [`InjectResult::WouldLoop`] — without touching the guest state
/// — when injection would recurse from the guest's own sync vector.
pub fn inject_abort(
    regs: &mut VcpuRegs,
    esr_el2: u64,
    far: u64,
    ipa: u64,
    is_data_abort: bool,
) -> InjectResult {
    let trapped_ec = esr::esr_ec(esr_el2);
    debug_assert!(
        trapped_ec == ec::DATA_ABORT_LO || trapped_ec == ec::INST_ABORT_LO,
        "abort injection from a non-abort trap"
    );

    if inject_would_loop(regs) {
        kdebug!(
            "detected exception inject loop, ESR_EL2 = {esr_el2:#x}, ELR_EL2 = {:#x}, VBAR_EL1 = {:#x}",
            regs.pc,
            regs.sysregs.vbar_el1
        );
        return InjectResult::WouldLoop;
    }

    // Promote the class when the guest was already in EL1.
    let from_el1 = matches!(regs.spsr_el2 & SPSR_M_MASK, SPSR_M_EL1T | SPSR_M_EL1H);
    let new_ec = match (is_data_abort, from_el1) {
        (true, true) => ec::DATA_ABORT,
        (true, false) => ec::DATA_ABORT_LO,
        (false, true) => ec::INST_ABORT,
        (false, false) => ec::INST_ABORT_LO,
    };

    // Rewrite the syndrome as a clean synchronous external abort: FSC set,
    // ISV/SAS/SRT and the walk bits cleared.
    let new_esr = esr::esr_build(new_ec, esr::esr_il(esr_el2), fsc::SYNC_EXTERNAL);

    regs.sysregs.esr_el1 = new_esr;
    regs.sysregs.far_el1 = far;

    kdebug!(
        "injecting abort, original ESR_EL2 = {esr_el2:#x}, VA = {far:#x}, IPA = {ipa:#x}, ELR_EL2 = {:#x}",
        regs.pc
    );

    enter_vector(regs);
    InjectResult::Injected
}

/// Injects an undefined-instruction (Unknown) exception, used for trapped
/// accesses the hypervisor refuses to emulate.
pub fn inject_undef(regs: &mut VcpuRegs, esr_el2: u64) {
    regs.sysregs.esr_el1 = esr::esr_build(ec::UNKNOWN, esr::esr_il(esr_el2), 0);

    kwarn!(
        "injecting unknown abort, original ESR_EL2 = {esr_el2:#x}, ELR_EL2 = {:#x}",
        regs.pc
    );

    enter_vector(regs);
}
