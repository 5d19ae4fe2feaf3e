//! Trapped system register emulation.
//!
//! Guest MSR/MRS accesses that trap to the hypervisor are decoded from the
//! syndrome and emulated here. Reads of the ID register space return
//! virtualized values — one consistent CPU description regardless of which
//! physical core the VCPU is on, so a migrating VCPU never observes the
//! hardware changing under it. A small set of registers is tolerated as
//! read-as-zero / write-ignored; everything else gets an Unknown exception
//! injected.

use boson_sched::VcpuRegs;

use crate::esr::SysregIss;
use crate::exception;

/// Outcome of a sysreg trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysregResult {
    /// The access was emulated; advance the guest pc.
    Handled,
    /// An Unknown exception was injected instead.
    Unhandled,
}

/// The virtualized ID register values presented to every VCPU.
///
/// The defaults describe a generic ARMv8.0-A core; the platform layer may
/// install its own copy at boot.
#[derive(Debug, Clone, Copy)]
pub struct VirtIdRegs {
    /// MIDR_EL1: implementer/part/revision.
    pub midr: u64,
    /// MPIDR_EL1 base; the VCPU index is inserted into Aff0.
    pub mpidr_base: u64,
    /// ID_AA64PFR0_EL1: EL0–EL3 present, AArch64 only.
    pub id_aa64pfr0: u64,
    /// ID_AA64PFR1_EL1.
    pub id_aa64pfr1: u64,
    /// ID_AA64ISAR0_EL1.
    pub id_aa64isar0: u64,
    /// ID_AA64ISAR1_EL1.
    pub id_aa64isar1: u64,
    /// ID_AA64MMFR0_EL1: 48-bit PA, 4 KiB granule.
    pub id_aa64mmfr0: u64,
    /// ID_AA64MMFR1_EL1.
    pub id_aa64mmfr1: u64,
    /// ID_AA64MMFR2_EL1.
    pub id_aa64mmfr2: u64,
    /// ID_AA64DFR0_EL1.
    pub id_aa64dfr0: u64,
}

/// The ID values presented by default: a generic ARMv8.0-A core with
/// AArch64-only EL0–EL2, 48-bit PAs and the 4 KiB granule.
static DEFAULT_ID_REGS: VirtIdRegs = VirtIdRegs {
    // Implementer 'A' (Arm), generic part number.
    midr: 0x410f_d0f0,
    mpidr_base: 0x8000_0000,
    id_aa64pfr0: 0x0000_0011,
    id_aa64pfr1: 0,
    id_aa64isar0: 0,
    id_aa64isar1: 0,
    // PARange = 48 bits (0b0101), TGran4 supported (0).
    id_aa64mmfr0: 0x0000_0005,
    id_aa64mmfr1: 0,
    id_aa64mmfr2: 0,
    id_aa64dfr0: 0,
};

impl Default for VirtIdRegs {
    fn default() -> Self {
        DEFAULT_ID_REGS
    }
}

fn write_rt(regs: &mut VcpuRegs, rt: usize, value: u64) {
    // x31 encodes xzr in the syndrome; writes to it vanish.
    if rt < 31 {
        regs.x[rt] = value;
    }
}

/// Emulates one trapped sysreg access described by `iss`, with the VCPU
/// index (for MPIDR Aff0) and the trapped syndrome for injection.
pub fn handle_sysreg_trap(
    regs: &mut VcpuRegs,
    iss: SysregIss,
    esr_el2: u64,
    vcpu_index: u64,
) -> SysregResult {
    let id = &DEFAULT_ID_REGS;

    // Only op0=3, op1=0 space is trapped and emulated here.
    if iss.op0 != 3 || iss.op1 != 0 {
        exception::inject_undef(regs, esr_el2);
        return SysregResult::Unhandled;
    }

    if iss.is_read {
        let value = match (iss.crn, iss.crm, iss.op2) {
            // MIDR_EL1 / MPIDR_EL1 / REVIDR_EL1
            (0, 0, 0) => Some(id.midr),
            (0, 0, 5) => Some(id.mpidr_base | (vcpu_index & 0xff)),
            (0, 0, 6) => Some(0),
            // ID_AA64PFR0/1
            (0, 4, 0) => Some(id.id_aa64pfr0),
            (0, 4, 1) => Some(id.id_aa64pfr1),
            // ID_AA64DFR0/1
            (0, 5, 0) => Some(id.id_aa64dfr0),
            (0, 5, 1) => Some(0),
            // ID_AA64ISAR0/1
            (0, 6, 0) => Some(id.id_aa64isar0),
            (0, 6, 1) => Some(id.id_aa64isar1),
            // ID_AA64MMFR0/1/2
            (0, 7, 0) => Some(id.id_aa64mmfr0),
            (0, 7, 1) => Some(id.id_aa64mmfr1),
            (0, 7, 2) => Some(id.id_aa64mmfr2),
            // The remaining ID space (crm 1–7) reads as zero: features the
            // hypervisor does not virtualize are reported absent.
            (0, 1..=7, _) => Some(0),
            _ => None,
        };
        match value {
            Some(value) => {
                write_rt(regs, iss.rt, value);
                SysregResult::Handled
            }
            None => {
                exception::inject_undef(regs, esr_el2);
                SysregResult::Unhandled
            }
        }
    } else {
        // The ID space is read-only; any trapped write is refused.
        exception::inject_undef(regs, esr_el2);
        SysregResult::Unhandled
    }
}
