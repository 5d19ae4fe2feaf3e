//! Threads: VCPUs and the per-CPU idle threads.
//!
//! A thread owns a hypervisor stack allocated from its partition, a saved
//! `(pc, sp, fp)` context block for switching, and — for VCPUs — the guest
//! register file plus attachments to a capability space and an address
//! space. Lifecycle: threads are created READY-blocked, activation
//! initializes the context and clears the lifecycle block, `kill` flips
//! READY→KILLED with a compare-exchange, and the victim exits itself at
//! its next exit-to-guest boundary. A thread holds a reference to itself
//! from activation until exit, so a running thread can never be freed
//! under its own feet.

use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;

use boson_core::addr::PAGE_SIZE;
use boson_core::cpulocal::{CPU_INDEX_INVALID, CpuIndex};
use boson_core::error::{Error, Result};
use boson_core::sync::SpinLock;
use boson_core::time::Ticks;
use boson_cspace::Cspace;
use boson_mm::Addrspace;
use boson_obj::{HypObject, ObjRef, ObjectHeader, ObjectType, Partition};

/// Hypervisor stack size per thread.
pub const STACK_SIZE: usize = PAGE_SIZE as usize;
/// Upper bound accepted for caller-specified stack sizes.
pub const STACK_MAX_SIZE: usize = 4 * PAGE_SIZE as usize;

/// Kind of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    /// A guest virtual CPU.
    Vcpu,
    /// A per-CPU idle thread; never queued but always selectable.
    Idle,
}

/// Lifecycle state, driven by compare-exchange from READY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Created but not activated.
    Init = 0,
    /// Activated; may be scheduled.
    Ready = 1,
    /// Killed; will exit at its next exit-to-guest boundary.
    Killed = 2,
    /// Exited; only teardown remains.
    Exited = 3,
}

bitflags! {
    /// VCPU activation options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VcpuOptions: u32 {
        /// This VCPU belongs to the HLOS VM.
        const HLOS_VM = 1 << 0;
        /// The VCPU is pinned to its home CPU.
        const PINNED = 1 << 1;
    }
}

/// Reasons a thread can be blocked from scheduling. A thread is runnable
/// only when no reason is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockReason {
    /// Between create and activate, and after exit.
    ThreadLifecycle = 0,
    /// An affinity change is waiting for its migration sync.
    AffinityChanged = 1,
    /// Blocked by an unrecoverable guest fault.
    VcpuFault = 2,
    /// The VCPU is powered off.
    VcpuOff = 3,
    /// The VCPU is suspended.
    VcpuSuspend = 4,
}

impl BlockReason {
    pub(crate) const fn bit(self) -> u64 {
        1u64 << (self as u32)
    }
}

/// The saved EL1/EL0 system registers a VCPU context carries for traps and
/// exception injection.
#[derive(Debug, Clone, Copy, Default)]
pub struct VcpuSysRegs {
    /// Guest vector base.
    pub vbar_el1: u64,
    /// Guest system control.
    pub sctlr_el1: u64,
    /// Guest syndrome register (written by injection).
    pub esr_el1: u64,
    /// Guest fault address (written by injection).
    pub far_el1: u64,
    /// Guest exception link (written by injection).
    pub elr_el1: u64,
    /// Guest saved program status (written by injection).
    pub spsr_el1: u64,
}

/// A VCPU's trapped register file.
#[derive(Debug, Clone, Copy)]
pub struct VcpuRegs {
    /// General-purpose registers x0–x30.
    pub x: [u64; 31],
    /// Guest program counter (ELR_EL2 at trap time).
    pub pc: u64,
    /// Guest program status (SPSR_EL2 at trap time).
    pub spsr_el2: u64,
    /// EL1 system registers involved in trap emulation.
    pub sysregs: VcpuSysRegs,
}

impl Default for VcpuRegs {
    fn default() -> Self {
        Self {
            x: [0; 31],
            pc: 0,
            spsr_el2: 0,
            sysregs: VcpuSysRegs::default(),
        }
    }
}

/// Saved hypervisor execution state across a context switch.
#[derive(Debug, Default)]
pub struct ThreadContext {
    pub(crate) pc: Cell<usize>,
    pub(crate) sp: Cell<usize>,
    pub(crate) fp: Cell<usize>,
}

/// Scheduler bookkeeping.
///
/// Access discipline (matching the scheduler's locking rules): fields are
/// read or written either while holding the thread's scheduler lock, or
/// from the CPU that currently owns the thread — i.e. with the thread
/// active on, queued on, or being picked by that CPU's runqueue under its
/// lock. Configuration paths take the thread lock and dequeue the thread
/// first, so the owning CPU never observes a field mid-change.
pub(crate) struct SchedFields {
    pub(crate) priority: Cell<u8>,
    pub(crate) base_timeslice: Cell<Ticks>,
    pub(crate) active_timeslice: Cell<Ticks>,
    pub(crate) schedtime: Cell<Ticks>,
    pub(crate) affinity: Cell<Option<CpuIndex>>,
    pub(crate) prev_affinity: Cell<Option<CpuIndex>>,
    pub(crate) pin_count: Cell<u32>,
    pub(crate) block_bits: Cell<u64>,
    pub(crate) queued: Cell<bool>,
    pub(crate) running: Cell<bool>,
    pub(crate) need_requeue: Cell<bool>,
    /// Directed-yield target; holds a reference.
    pub(crate) yield_to: core::cell::RefCell<Option<ObjRef<Thread>>>,
    /// Donor of the current directed yield (non-owning back-pointer).
    pub(crate) yielded_from: Cell<Option<NonNull<Thread>>>,
}

/// A schedulable execution context.
pub struct Thread {
    header: ObjectHeader,
    kind: ThreadKind,
    state: AtomicU8,
    /// Stack allocation from the owning partition: `(base, size)`.
    pub(crate) stack: Cell<Option<(NonNull<u8>, usize)>>,
    pub(crate) context: ThreadContext,
    /// Guest register file. Only touched by the thread itself or while it
    /// is demonstrably off-CPU.
    pub vcpu_regs: SpinLock<VcpuRegs>,
    vcpu_options: Cell<VcpuOptions>,
    cspace: SpinLock<Option<ObjRef<Cspace>>>,
    addrspace: SpinLock<Option<ObjRef<Addrspace>>>,
    stack_map_index: Cell<usize>,
    /// The per-thread scheduler lock: held across scheduler configuration
    /// calls (affinity, priority, timeslice, block/unblock) on this thread.
    pub sched_lock: SpinLock<()>,
    pub(crate) sched: SchedFields,
    /// CPU this thread is running on, or `CPU_INDEX_INVALID`.
    pub(crate) active_affinity: AtomicUsize,
}

// SAFETY: The Cells are confined to the lifecycle phases that own them
// (create/activate/teardown); the rest is lock- or atomic-protected.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl HypObject for Thread {
    const TYPE: ObjectType = ObjectType::Thread;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn deactivate(&self) {
        *self.cspace.lock() = None;
        let addrspace = self.addrspace.lock().take();
        if let Some(asp) = addrspace {
            asp.free_stack_index(self.stack_map_index.get());
        }

        if let Some((base, size)) = self.stack.take() {
            let partition = self
                .header
                .partition()
                .cloned()
                .unwrap_or_else(boson_obj::partition::private);
            // SAFETY: The stack came from this partition at create time and
            // the thread can no longer run.
            unsafe { partition.free(base, size, PAGE_SIZE as usize) };
        }
    }
}

impl Thread {
    /// Creates a thread with a freshly allocated stack, blocked on
    /// [`BlockReason::ThreadLifecycle`] until activation.
    pub fn new(
        partition: Option<ObjRef<Partition>>,
        kind: ThreadKind,
        stack_size: usize,
    ) -> Result<ObjRef<Self>> {
        let stack_size = if stack_size == 0 { STACK_SIZE } else { stack_size };
        if stack_size > STACK_MAX_SIZE {
            return Err(Error::ArgumentSize);
        }
        if !boson_core::util::is_aligned(stack_size as u64, PAGE_SIZE) {
            return Err(Error::ArgumentAlignment);
        }

        let alloc_partition = partition
            .clone()
            .unwrap_or_else(boson_obj::partition::private);
        let stack = alloc_partition.alloc(stack_size, PAGE_SIZE as usize)?;

        Ok(ObjRef::new(Self {
            header: ObjectHeader::new(ObjectType::Thread, partition),
            kind,
            state: AtomicU8::new(ThreadState::Init as u8),
            stack: Cell::new(Some((stack, stack_size))),
            context: ThreadContext::default(),
            vcpu_regs: SpinLock::new(VcpuRegs::default()),
            vcpu_options: Cell::new(VcpuOptions::empty()),
            cspace: SpinLock::new(None),
            addrspace: SpinLock::new(None),
            stack_map_index: Cell::new(0),
            sched_lock: SpinLock::new(()),
            sched: SchedFields {
                priority: Cell::new(crate::scheduler::DEFAULT_PRIORITY),
                base_timeslice: Cell::new(boson_core::time::ns_to_ticks(
                    crate::scheduler::DEFAULT_TIMESLICE_NS,
                )),
                active_timeslice: Cell::new(0),
                schedtime: Cell::new(0),
                affinity: Cell::new(None),
                prev_affinity: Cell::new(None),
                pin_count: Cell::new(0),
                block_bits: Cell::new(BlockReason::ThreadLifecycle.bit()),
                queued: Cell::new(false),
                running: Cell::new(false),
                need_requeue: Cell::new(false),
                yield_to: core::cell::RefCell::new(None),
                yielded_from: Cell::new(None),
            },
            active_affinity: AtomicUsize::new(CPU_INDEX_INVALID),
        }))
    }

    /// Returns the thread kind.
    #[must_use]
    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        match self.state.load(Ordering::Relaxed) {
            0 => ThreadState::Init,
            1 => ThreadState::Ready,
            2 => ThreadState::Killed,
            _ => ThreadState::Exited,
        }
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Requests termination. Succeeds from READY (the thread exits at its
    /// next exit-to-guest boundary) and is a no-op if already killed or
    /// exited; fails with [`Error::ObjectState`] before activation.
    pub fn kill(&self) -> Result<()> {
        match self.state.compare_exchange(
            ThreadState::Ready as u8,
            ThreadState::Killed as u8,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => Ok(()),
            Err(observed)
                if observed == ThreadState::Killed as u8
                    || observed == ThreadState::Exited as u8 =>
            {
                Ok(())
            }
            Err(_) => Err(Error::ObjectState),
        }
    }

    /// Returns `true` once `kill` has been observed.
    #[must_use]
    pub fn is_dying(&self) -> bool {
        self.state() == ThreadState::Killed
    }

    // -----------------------------------------------------------------------
    // Attachments
    // -----------------------------------------------------------------------

    /// Attaches a capability space. Only valid before activation; replaces
    /// any earlier attachment.
    pub fn attach_cspace(&self, cspace: &ObjRef<Cspace>) -> Result<()> {
        assert_eq!(self.header.state(), boson_obj::ObjectState::Init);
        if !cspace.header().is_active() {
            return Err(Error::ObjectState);
        }
        *self.cspace.lock() = Some(cspace.clone());
        Ok(())
    }

    /// Returns the attached capability space.
    #[must_use]
    pub fn cspace(&self) -> Option<ObjRef<Cspace>> {
        self.cspace.lock().clone()
    }

    /// Attaches an address space and claims one of its stack map slots.
    /// VCPUs only; only valid before activation.
    pub fn attach_addrspace(&self, addrspace: &ObjRef<Addrspace>) -> Result<()> {
        assert_eq!(self.header.state(), boson_obj::ObjectState::Init);
        if self.kind != ThreadKind::Vcpu {
            return Err(Error::ArgumentInvalid);
        }
        if !addrspace.header().is_active() {
            return Err(Error::ObjectState);
        }

        let stack_index = addrspace.allocate_stack_index()?;

        let mut slot = self.addrspace.lock();
        if let Some(old) = slot.take() {
            old.free_stack_index(self.stack_map_index.get());
        }
        *slot = Some(addrspace.clone());
        self.stack_map_index.set(stack_index);
        Ok(())
    }

    /// Returns the attached address space.
    #[must_use]
    pub fn addrspace(&self) -> Option<ObjRef<Addrspace>> {
        self.addrspace.lock().clone()
    }

    /// Returns the VCPU option flags.
    #[must_use]
    pub fn vcpu_options(&self) -> VcpuOptions {
        self.vcpu_options.get()
    }

    pub(crate) fn set_vcpu_options(&self, options: VcpuOptions) {
        self.vcpu_options.set(options);
    }

    /// Returns the CPU the thread is currently running on.
    #[must_use]
    pub fn active_cpu(&self) -> Option<CpuIndex> {
        let cpu = self.active_affinity.load(Ordering::Relaxed);
        boson_core::cpulocal::index_valid(cpu).then_some(cpu)
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
