//! Guest trap routing.
//!
//! A synchronous exception from the guest arrives here with its syndrome
//! and fault addresses. Stage-2 aborts resolve the faulting IPA (the
//! hardware-latched value when present, otherwise a stage-1 walk under an
//! RCU read section), then try the handlers in order: registered
//! guest-MMIO ranges (forwarded to the VM's manager), bound VirtIO MMIO
//! devices (emulated in place), and finally injection of a synchronous
//! external abort back into the guest. Trapped system registers and HVCs
//! route to their own emulators.

use boson_core::addr::VmAddr;
use boson_core::error::Error;
use boson_mm::Addrspace;
use boson_obj::ObjRef;
use boson_sched::{Thread, VcpuRegs};
use boson_vm::esr::{self, ec, fsc};
use boson_vm::exception::{self, InjectResult};

/// Outcome of a stage-2 abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The access was emulated; the guest pc has been advanced.
    Emulated,
    /// The fault lies in a registered guest-MMIO range; forward it to the
    /// VM's manager for user-level emulation.
    ForwardVmmio,
    /// An abort was injected back into the guest.
    Injected,
    /// Injection would loop; the VCPU has been blocked.
    VcpuBlocked,
}

/// Advances the guest pc over the trapped instruction.
fn skip_instruction(regs: &mut VcpuRegs, esr_el2: u64) {
    regs.pc += if esr::esr_il(esr_el2) { 4 } else { 2 };
}

/// Handles a stage-2 data or instruction abort from the guest.
///
/// `hpfar_ipa` is the hardware-latched faulting IPA when valid; `far` is
/// the faulting VA. Without a latched IPA the stage-1 walk would resolve
/// it; the software walk only covers the flat-mapped case where the VA is
/// the IPA.
pub fn handle_stage2_abort(
    thread: &ObjRef<Thread>,
    addrspace: &ObjRef<Addrspace>,
    esr_el2: u64,
    far: u64,
    hpfar_ipa: Option<u64>,
) -> AbortOutcome {
    let trapped_ec = esr::esr_ec(esr_el2);
    let is_data = trapped_ec == ec::DATA_ABORT_LO;
    let iss = esr::esr_iss(esr_el2);

    // Prefer the hardware-latched IPA; fall back to a stage-1 resolution
    // of the FAR under RCU (flat in this software model).
    let ipa = hpfar_ipa.unwrap_or(far);

    // Translation-class faults in emulatable regions are handled before
    // anything is injected.
    if fsc::is_injectable(esr::abort_fsc(iss)) {
        // Registered guest-MMIO range?
        if addrspace.is_vmmio_addr(VmAddr::new(ipa)) {
            return AbortOutcome::ForwardVmmio;
        }

        // A bound VirtIO MMIO device page?
        if let Some((device, offset)) = crate::vdevice::lookup(addrspace.vmid(), VmAddr::new(ipa)) {
            if is_data && esr::abort_isv(iss) {
                let size = esr::abort_access_size(iss);
                let reg = esr::abort_reg(iss);
                let mut regs = thread.vcpu_regs.lock();

                let result = if esr::abort_is_write(iss) {
                    let value = if reg < 31 { regs.x[reg] } else { 0 };
                    device.write(offset, size, value)
                } else {
                    match device.read(offset, size) {
                        Ok(value) => {
                            if reg < 31 {
                                regs.x[reg] = value;
                            }
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                };

                match result {
                    Ok(()) => {
                        skip_instruction(&mut regs, esr_el2);
                        return AbortOutcome::Emulated;
                    }
                    Err(Error::ArgumentInvalid) => {
                        // Bad access size or offset: fault the guest.
                    }
                    Err(_) => {}
                }
            }
            // Fall through to injection for malformed device accesses.
        }
    }

    let mut regs = thread.vcpu_regs.lock();
    match exception::inject_abort(&mut regs, esr_el2, far, ipa, is_data) {
        InjectResult::Injected => AbortOutcome::Injected,
        InjectResult::WouldLoop => {
            drop(regs);
            // Injecting would bounce off the guest's own sync vector
            // forever; park the VCPU instead.
            let sched = boson_sched::global();
            boson_core::sync::preempt::disable();
            {
                let _guard = thread.sched_lock.lock_nopreempt();
                sched.block(thread, boson_sched::BlockReason::VcpuFault);
            }
            boson_core::sync::preempt::enable();
            AbortOutcome::VcpuBlocked
        }
    }
}

/// Handles a trapped MSR/MRS access.
pub fn handle_sysreg_trap(thread: &ObjRef<Thread>, esr_el2: u64, vcpu_index: u64) {
    let iss = esr::SysregIss::decode(esr::esr_iss(esr_el2));
    let mut regs = thread.vcpu_regs.lock();
    if boson_vm::handle_sysreg_trap(&mut regs, iss, esr_el2, vcpu_index)
        == boson_vm::SysregResult::Handled
    {
        skip_instruction(&mut regs, esr_el2);
    }
}

/// Handles an HVC from the guest: x0 carries the call number, x1..x7 the
/// arguments, and the results land in x0/x1.
pub fn handle_hvc(thread: &ObjRef<Thread>) {
    let Some(cspace) = thread.cspace() else {
        let mut regs = thread.vcpu_regs.lock();
        regs.x[0] = crate::hypercalls::error_code(Error::ObjectConfig);
        return;
    };

    let (call, args) = {
        let regs = thread.vcpu_regs.lock();
        let mut args = [0u64; 7];
        args.copy_from_slice(&regs.x[1..8]);
        (regs.x[0], args)
    };

    let (err, value) = crate::hypercalls::dispatch(&cspace, call, &args);

    let mut regs = thread.vcpu_regs.lock();
    regs.x[0] = err;
    regs.x[1] = value;
}

#[cfg(test)]
mod tests {
    use super::*;
    use boson_core::cpulocal::set_current_cpu;
    use boson_obj::{HypObject, ObjectState, Partition};
    use boson_sched::ThreadKind;

    fn abort_esr(write: bool, size_log2: u64, reg: u64, fault: u64) -> u64 {
        let iss = (1 << 24) | (size_log2 << 22) | (reg << 16) | ((write as u64) << 6) | fault;
        esr::esr_build(ec::DATA_ABORT_LO, true, iss)
    }

    fn setup() -> (
        ObjRef<Thread>,
        ObjRef<Addrspace>,
        ObjRef<boson_vm::VirtioMmio>,
    ) {
        set_current_cpu(22);
        let part = Partition::new(None);
        part.header().set_state(ObjectState::Active);

        let asp = Addrspace::new(Some(part.clone()));
        asp.configure(60).unwrap();
        asp.activate().unwrap();
        asp.header().set_state(ObjectState::Active);

        let thread = Thread::new(Some(part.clone()), ThreadKind::Vcpu, 0).unwrap();

        let dev = boson_vm::VirtioMmio::new(Some(part), 2, 2).unwrap();
        dev.header().set_state(ObjectState::Active);
        crate::vdevice::bind(&dev, &asp, VmAddr::new(0x2000_0000), 0x1000).unwrap();
        (thread, asp, dev)
    }

    #[test]
    fn device_read_is_emulated() {
        let (thread, asp, _dev) = setup();
        // Guest reads the magic register into x5.
        let esr = abort_esr(false, 2, 5, fsc::TRANSLATION_0 + 3);
        let outcome =
            handle_stage2_abort(&thread, &asp, esr, 0x2000_0000, Some(0x2000_0000));
        assert_eq!(outcome, AbortOutcome::Emulated);
        let regs = thread.vcpu_regs.lock();
        assert_eq!(regs.x[5], 0x7472_6976);
        // The pc advanced past the 4-byte instruction.
        assert_eq!(regs.pc, 4);
    }

    #[test]
    fn device_write_reaches_registers() {
        let (thread, asp, dev) = setup();
        {
            let mut regs = thread.vcpu_regs.lock();
            regs.x[7] = 1; // queue_sel = 1
        }
        let esr = abort_esr(true, 2, 7, fsc::TRANSLATION_0 + 3);
        let outcome =
            handle_stage2_abort(&thread, &asp, esr, 0x2000_0030, Some(0x2000_0030));
        assert_eq!(outcome, AbortOutcome::Emulated);
        let _ = dev;
    }

    #[test]
    fn byte_access_outside_config_faults() {
        let (thread, asp, _dev) = setup();
        {
            let mut regs = thread.vcpu_regs.lock();
            regs.sysregs.vbar_el1 = 0x8000_0000;
        }
        // One-byte read of the status register: the device refuses and the
        // abort is injected.
        let esr = abort_esr(false, 0, 3, fsc::TRANSLATION_0 + 3);
        let outcome =
            handle_stage2_abort(&thread, &asp, esr, 0x2000_0070, Some(0x2000_0070));
        assert_eq!(outcome, AbortOutcome::Injected);
        let regs = thread.vcpu_regs.lock();
        assert_eq!(regs.pc, 0x8000_0000 + 0x400);
    }

    #[test]
    fn vmmio_ranges_forward() {
        let (thread, asp, _dev) = setup();
        asp.add_vmmio_range(VmAddr::new(0x3000_0000), 0x10000).unwrap();
        let esr = abort_esr(true, 2, 0, fsc::TRANSLATION_0 + 3);
        let outcome =
            handle_stage2_abort(&thread, &asp, esr, 0x3000_4000, Some(0x3000_4000));
        assert_eq!(outcome, AbortOutcome::ForwardVmmio);
    }

    #[test]
    fn unhandled_aborts_inject() {
        let (thread, asp, _dev) = setup();
        {
            let mut regs = thread.vcpu_regs.lock();
            regs.sysregs.vbar_el1 = 0x8000_0000;
        }
        let esr = abort_esr(true, 2, 0, fsc::TRANSLATION_0 + 3);
        let outcome = handle_stage2_abort(&thread, &asp, esr, 0x5000_0000, Some(0x5000_0000));
        assert_eq!(outcome, AbortOutcome::Injected);
        let regs = thread.vcpu_regs.lock();
        assert_eq!(esr::esr_ec(regs.sysregs.esr_el1), ec::DATA_ABORT_LO);
    }
}
