//! The EL2 exception vector table.
//!
//! Each lower-EL synchronous entry saves the guest's general-purpose
//! registers into the current thread's register file, reads the syndrome
//! and fault addresses, and calls into the dispatcher. The exit path
//! reloads the (possibly modified) register file and returns to the
//! guest.

use core::arch::global_asm;

use boson_core::util;
use boson_sched::ThreadKind;
use boson_vm::esr::{self, ec};

global_asm!(
    r"
    .macro vector_entry handler
    .balign 0x80
        b \handler
    .endm

    .balign 0x800
    .global boson_el2_vectors
boson_el2_vectors:
    // Current EL with SP_EL0: unused, hang.
    vector_entry el2_unhandled
    vector_entry el2_unhandled
    vector_entry el2_unhandled
    vector_entry el2_unhandled
    // Current EL with SP_ELx: hypervisor's own faults.
    vector_entry el2_self_sync
    vector_entry el2_irq
    vector_entry el2_unhandled
    vector_entry el2_self_serror
    // Lower EL, AArch64.
    vector_entry guest_sync_entry
    vector_entry el2_irq
    vector_entry el2_unhandled
    vector_entry el2_unhandled
    // Lower EL, AArch32.
    vector_entry guest_sync_entry
    vector_entry el2_irq
    vector_entry el2_unhandled
    vector_entry el2_unhandled

el2_unhandled:
    b el2_unhandled

el2_self_sync:
    b el2_self_sync

el2_self_serror:
    b el2_self_serror

el2_irq:
    // Interrupts are handled on the way out of the guest; for now, spin
    // the scheduler on return.
    eret

guest_sync_entry:
    // Spill x0/x1, fetch the register-file pointer, save everything.
    stp x0, x1, [sp, #-16]!
    mrs x0, TPIDR_EL2
    ldr x0, [x0, #8]            // per-CPU current vcpu_regs pointer
    stp x2, x3, [x0, #16]
    stp x4, x5, [x0, #32]
    stp x6, x7, [x0, #48]
    stp x8, x9, [x0, #64]
    stp x10, x11, [x0, #80]
    stp x12, x13, [x0, #96]
    stp x14, x15, [x0, #112]
    stp x16, x17, [x0, #128]
    stp x18, x19, [x0, #144]
    stp x20, x21, [x0, #160]
    stp x22, x23, [x0, #176]
    stp x24, x25, [x0, #192]
    stp x26, x27, [x0, #208]
    stp x28, x29, [x0, #224]
    str x30, [x0, #240]
    ldp x2, x3, [sp], #16
    stp x2, x3, [x0]            // guest x0/x1
    mrs x1, ELR_EL2
    str x1, [x0, #248]          // pc
    mrs x1, SPSR_EL2
    str x1, [x0, #256]          // spsr
    b guest_sync_dispatch
    "
);

unsafe extern "C" {
    /// The vector table defined above.
    pub static boson_el2_vectors: u8;
}

/// Installs the vector table on the current CPU.
///
/// # Safety
///
/// Must run once per CPU during early boot, before guests are entered.
pub unsafe fn install_vectors() {
    // SAFETY: Writing VBAR_EL2 during bring-up.
    unsafe {
        let base = &raw const boson_el2_vectors as u64;
        core::arch::asm!("msr VBAR_EL2, {}", in(reg) base, options(nomem, nostack));
    }
}

/// Rust-side continuation of a lower-EL synchronous trap.
#[unsafe(no_mangle)]
extern "C" fn guest_sync_dispatch() -> ! {
    let sched = boson_sched::global();
    boson_rcu::global().handle_entry_from_user();

    let current = sched.current();
    debug_assert_eq!(current.kind(), ThreadKind::Vcpu);

    let (esr_el2, far, hpfar): (u64, u64, u64);
    // SAFETY: Reading trap syndrome registers at EL2.
    unsafe {
        core::arch::asm!(
            "mrs {}, ESR_EL2",
            "mrs {}, FAR_EL2",
            "mrs {}, HPFAR_EL2",
            out(reg) esr_el2,
            out(reg) far,
            out(reg) hpfar,
            options(nomem, nostack),
        );
    }

    match esr::esr_ec(esr_el2) {
        ec::DATA_ABORT_LO | ec::INST_ABORT_LO => {
            let addrspace = current.addrspace().expect("VCPU has an address space");
            // HPFAR_EL2 holds IPA[47:12] in bits 43:4.
            let ipa = (hpfar >> 4) << 12 | (far & util::mask(12));
            let _ = crate::trap::handle_stage2_abort(
                &current,
                &addrspace,
                esr_el2,
                far,
                Some(ipa),
            );
        }
        ec::SYSREG => {
            crate::trap::handle_sysreg_trap(&current, esr_el2, 0);
        }
        ec::HVC64 => {
            crate::trap::handle_hvc(&current);
        }
        ec::WFX => {
            let mut regs = current.vcpu_regs.lock();
            regs.pc += 4;
            drop(regs);
            sched.yield_now();
        }
        _ => {
            let mut regs = current.vcpu_regs.lock();
            boson_vm::inject_undef(&mut regs, esr_el2);
        }
    }

    sched.handle_exit_to_user();
    let _ = boson_rcu::global().handle_exit_to_user();

    guest_return(&current)
}

/// Reloads the guest register file and returns to the guest.
fn guest_return(current: &boson_obj::ObjRef<boson_sched::Thread>) -> ! {
    let regs_ptr = {
        let regs = current.vcpu_regs.lock();
        core::ptr::from_ref(&*regs) as u64
    };
    // SAFETY: The register file layout matches the save path; the thread
    // cannot be freed while it is current.
    unsafe {
        core::arch::asm!(
            "ldr x1, [x0, #248]",
            "msr ELR_EL2, x1",
            "ldr x1, [x0, #256]",
            "msr SPSR_EL2, x1",
            "ldp x2, x3, [x0, #16]",
            "ldp x4, x5, [x0, #32]",
            "ldp x6, x7, [x0, #48]",
            "ldp x8, x9, [x0, #64]",
            "ldp x10, x11, [x0, #80]",
            "ldp x12, x13, [x0, #96]",
            "ldp x14, x15, [x0, #112]",
            "ldp x16, x17, [x0, #128]",
            "ldp x18, x19, [x0, #144]",
            "ldp x20, x21, [x0, #160]",
            "ldp x22, x23, [x0, #176]",
            "ldp x24, x25, [x0, #192]",
            "ldp x26, x27, [x0, #208]",
            "ldp x28, x29, [x0, #224]",
            "ldr x30, [x0, #240]",
            "ldp x0, x1, [x0]",
            "eret",
            in("x0") regs_ptr,
            options(noreturn),
        );
    }
}
