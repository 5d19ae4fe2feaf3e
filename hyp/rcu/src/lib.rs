//! Read-copy-update for the Boson hypervisor.
//!
//! Readers are cooperative: an RCU read section is a preemption-disabled
//! region entered with [`read_start`] and left with [`read_finish`]. A grace
//! period has elapsed once every CPU that was active at its start has passed
//! through a quiescent point (a scheduler quiesce, an idle transition, or an
//! exit to the guest). Callbacks enqueued with [`RcuState::enqueue`] run on
//! their enqueueing CPU after at least one full grace period.
//!
//! # Grace period tracking
//!
//! The global state packs the current generation number and a bitmap of
//! CPUs that still owe an acknowledgement into one atomic word. A CPU
//! acknowledges by clearing its bit; the CPU that clears the last bit starts
//! the next period (if any CPU is waiting for one) by snapshotting the
//! active-CPU set and bumping the generation. CPUs with nothing to wait for
//! take themselves out of the active set entirely — an idle or
//! guest-running CPU costs nothing.
//!
//! Two seq-cst fences make closure safe against racing (de)activation: one
//! after a CPU joins the active set (ordering the join before any read
//! section), one before the new period's active-set snapshot (ordering it
//! after the closing CPU's prior stores). See [`RcuState::quiesce`] and
//! `activate_cpu`.
//!
//! # Callback batches
//!
//! Each CPU keeps three batches per update class: *next* (new enqueues),
//! *waiting* (awaiting the target generation), and *ready* (runnable). On
//! each generation crossing the batches shift next→waiting→ready, so an
//! entry always waits out the period *after* the one in progress when it was
//! enqueued — it can never run early.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering, fence};

use boson_core::cpulocal::{self, CpuIndex, CpuLocal, MAX_CPUS};
use boson_core::ipi::{self, IpiReason};
use boson_core::static_assert;
use boson_core::sync::preempt;
use boson_core::util;

static_assert!(MAX_CPUS <= 32, "grace period bitmap packs one bit per CPU");

// ---------------------------------------------------------------------------
// Update classes and entries
// ---------------------------------------------------------------------------

/// Deferred-update classes. Each class has one handler, registered once at
/// boot by the subsystem that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum RcuClass {
    /// Final release of a refcounted hypervisor object.
    ObjectRelease = 0,
    /// Free of an empty capability table level.
    CspaceReleaseTable = 1,
    /// Free of a collapsed memory-database table level.
    MemdbReleaseTable = 2,
    /// Free of a collapsed memory-database bitmap level.
    MemdbReleaseBitmap = 3,
    /// Completion of a thread affinity change that needed a grace period.
    AffinityChanged = 4,
    /// Internal class used by [`RcuState::sync`].
    Sync = 5,
}

/// Number of update classes.
pub const NUM_CLASSES: usize = 6;

/// An intrusive deferred-update node.
///
/// Embed this as the **first field** of a `#[repr(C)]` struct; the class
/// handler receives the entry pointer and casts it back to the containing
/// type. The entry must stay alive and untouched from enqueue until the
/// handler runs.
#[derive(Debug)]
#[repr(C)]
pub struct RcuEntry {
    next: Cell<*mut RcuEntry>,
}

impl RcuEntry {
    /// Creates an unlinked entry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: Cell::new(ptr::null_mut()),
        }
    }
}

impl Default for RcuEntry {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: An RcuEntry is only manipulated by its owning CPU (with preemption
// disabled) between enqueue and dispatch; the batch lists hand it across a
// grace period, never concurrently.
unsafe impl Send for RcuEntry {}
unsafe impl Sync for RcuEntry {}

/// A class handler: runs one deferred update, returning `true` if the update
/// unblocked a thread and a reschedule is needed.
pub type ClassHandler = fn(*mut RcuEntry) -> bool;

static CLASS_HANDLERS: [AtomicPtr<()>; NUM_CLASSES] =
    [const { AtomicPtr::new(ptr::null_mut()) }; NUM_CLASSES];

/// Registers the handler for an update class (boot / subsystem init only).
pub fn set_class_handler(class: RcuClass, handler: ClassHandler) {
    CLASS_HANDLERS[class as usize].store(handler as *mut (), Ordering::Release);
}

fn dispatch(class: usize, entry: *mut RcuEntry) -> bool {
    let ptr = CLASS_HANDLERS[class].load(Ordering::Acquire);
    assert!(!ptr.is_null(), "RCU update with unregistered class handler");
    // SAFETY: Only valid ClassHandler pointers are stored in CLASS_HANDLERS.
    let f: ClassHandler = unsafe { core::mem::transmute(ptr) };
    f(entry)
}

// ---------------------------------------------------------------------------
// Read sections
// ---------------------------------------------------------------------------

/// Enters an RCU read section. Disables preemption; sleeping is forbidden
/// until the matching [`read_finish`].
#[inline]
pub fn read_start() {
    preempt::disable();
}

/// Leaves an RCU read section and re-enables preemption.
#[inline]
pub fn read_finish() {
    preempt::enable();
}

/// Runs `f` inside an RCU read section.
#[inline]
pub fn read_protected<R>(f: impl FnOnce() -> R) -> R {
    read_start();
    let result = f();
    read_finish();
    result
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Generation counters wrap; differences beyond half the range are treated
/// as wrap-around.
const A_LONG_TIME: u32 = 1 << 31;

/// Returns `true` if generation `a` is before `b`, assuming both belong to
/// CPUs actively participating in the counter ring.
#[inline]
fn is_before(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) >= A_LONG_TIME
}

const fn pack_period(generation: u32, cpu_bitmap: u32) -> u64 {
    ((generation as u64) << 32) | cpu_bitmap as u64
}

const fn period_generation(packed: u64) -> u32 {
    (packed >> 32) as u32
}

const fn period_bitmap(packed: u64) -> u32 {
    packed as u32
}

/// One CPU's batch heads, one list per update class.
struct Batch {
    heads: [Cell<*mut RcuEntry>; NUM_CLASSES],
}

impl Batch {
    const fn new() -> Self {
        Self {
            heads: [const { Cell::new(ptr::null_mut()) }; NUM_CLASSES],
        }
    }
}

/// Per-CPU RCU state. Only the owning CPU touches the batches and the
/// `is_active` flag (with preemption disabled); `target` and `update_count`
/// are read remotely.
struct RcuCpuState {
    is_active: Cell<bool>,
    /// Generation this CPU is waiting for (valid only while it has updates).
    target: AtomicU32,
    /// Number of updates enqueued on this CPU and not yet dispatched.
    update_count: AtomicU64,
    ready_updates: Cell<bool>,
    next_batch: Batch,
    waiting_batch: Batch,
    ready_batch: Batch,
}

impl RcuCpuState {
    const fn new() -> Self {
        Self {
            is_active: Cell::new(false),
            target: AtomicU32::new(0),
            update_count: AtomicU64::new(0),
            ready_updates: Cell::new(false),
            next_batch: Batch::new(),
            waiting_batch: Batch::new(),
            ready_batch: Batch::new(),
        }
    }
}

// SAFETY: Batches and flags are only accessed by the owning CPU with
// preemption disabled; the atomics are safe from any CPU.
unsafe impl Sync for RcuCpuState {}
unsafe impl Send for RcuCpuState {}

/// Global RCU state: the grace-period ring plus per-CPU batch state.
///
/// The kernel uses the [`global`] instance; tests construct their own.
pub struct RcuState {
    /// `(generation, outstanding CPU bitmap)` of the period in progress.
    current_period: AtomicU64,
    /// CPUs currently required to acknowledge grace periods.
    active_cpus: AtomicU32,
    /// Highest generation any CPU is waiting for.
    max_target: AtomicU32,
    /// Number of CPUs that have pending updates.
    waiter_count: AtomicU64,
    cpu: CpuLocal<RcuCpuState>,
}

impl RcuState {
    /// Creates an idle RCU state with no active CPUs.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current_period: AtomicU64::new(0),
            active_cpus: AtomicU32::new(0),
            max_target: AtomicU32::new(0),
            waiter_count: AtomicU64::new(0),
            cpu: CpuLocal::new([const { RcuCpuState::new() }; MAX_CPUS]),
        }
    }

    fn should_run(&self) -> bool {
        let should_run = self.waiter_count.load(Ordering::Relaxed) > 0;
        if should_run {
            fence(Ordering::Acquire);
        }
        should_run
    }

    /// Requests a reschedule on every active CPU, so each will either switch
    /// threads or hit a scheduler quiescent event. A direct quiesce IPI is
    /// not used here: an idle CPU would not leave its fast-IPI loop for it,
    /// and then never deactivate.
    fn refresh_active(&self) {
        let mut active = self.active_cpus.load(Ordering::Relaxed);
        while active != 0 {
            let cpu = active.trailing_zeros() as CpuIndex;
            ipi::one(IpiReason::Reschedule, cpu);
            active &= !(util::bit(cpu as u32) as u32);
        }
    }

    /// Enqueues a deferred update on the current CPU.
    ///
    /// The entry's class handler will run on this CPU after at least one
    /// full grace period.
    ///
    /// # Safety
    ///
    /// `entry` must point to a live `RcuEntry` embedded at the start of its
    /// containing `#[repr(C)]` object, and the object must remain valid (and
    /// not be re-enqueued) until the class handler has run.
    pub unsafe fn enqueue(&self, entry: *mut RcuEntry, class: RcuClass) {
        preempt::disable();

        let cpu = cpulocal::current_cpu();
        let my_state = self.cpu.get_for(cpu);

        if my_state.update_count.fetch_add(1, Ordering::Relaxed) == 0
            && self.waiter_count.fetch_add(1, Ordering::Relaxed) == 0
        {
            // CPUs may have stopped tracking quiescent states because there
            // were no waiters, so prod them all. Any CPU sitting in idle or
            // running a guest will take itself out of the active set in
            // response, letting us ignore it until it does something.
            self.refresh_active();
        }

        let head = &my_state.next_batch.heads[class as usize];
        // SAFETY: The entry is live per the caller contract; it is only
        // linked into this CPU's batch, which only this CPU touches.
        unsafe { (*entry).next.set(head.get()) };
        head.set(entry);

        // Request a new grace period if possible. Deferring the notify via a
        // relaxed IPI improves batching when no period is in progress.
        ipi::one_relaxed(IpiReason::RcuNotify, cpu);

        preempt::enable();
    }

    /// Marks the current CPU as needing to acknowledge grace periods.
    ///
    /// Called on entry from the guest, on a preemption interrupt, when the
    /// idle thread is switched away from, and when a CPU comes online.
    pub fn activate_cpu(&self) {
        preempt::assert_disabled();
        let cpu = cpulocal::current_cpu();
        let my_state = self.cpu.get_for(cpu);

        if !my_state.is_active.get() {
            my_state.is_active.set(true);
            self.active_cpus
                .fetch_or(util::bit(cpu as u32) as u32, Ordering::Relaxed);

            // Order the active-set join before any load in a subsequent read
            // section, so a grace period that starts after such a load sees
            // this CPU as active. Must be seq-cst to order loads after
            // stores; the matching fence is in quiesce() before the
            // active-set snapshot.
            fence(Ordering::SeqCst);
        }
    }

    /// Removes the current CPU from the active set and quiesces it.
    ///
    /// Called when entering idle or exiting to the guest with updates
    /// pending, and when a CPU goes offline.
    pub fn deactivate_cpu(&self) -> bool {
        preempt::assert_disabled();
        let cpu = cpulocal::current_cpu();
        let my_state = self.cpu.get_for(cpu);

        my_state.is_active.set(false);

        // Removal wants release-like ordering after the end of any read
        // section, but needs no ordering against the quiesce below; at worst
        // a late removal earns a redundant IPI.
        self.active_cpus
            .fetch_and(!(util::bit(cpu as u32) as u32), Ordering::Relaxed);

        // Matches the fence in quiesce() when a new period starts: either we
        // clear our active bit first (and receive a quiesce IPI), or the
        // other CPU starts the period before our quiesce acknowledges it.
        fence(Ordering::SeqCst);

        let _ = ipi::clear(IpiReason::RcuQuiesce);
        self.quiesce()
    }

    /// Acknowledges the current grace period on this CPU.
    ///
    /// The CPU clearing the last outstanding bit starts the next period when
    /// one is wanted, snapshots the active set into it, and notifies every
    /// CPU whose target generation has now been reached. Returns `true` if a
    /// reschedule is needed.
    pub fn quiesce(&self) -> bool {
        preempt::assert_disabled();
        let this_cpu = cpulocal::current_cpu();
        let cpu_bit = util::bit(this_cpu as u32) as u32;
        let mut new_period = false;
        let mut reschedule = false;

        let mut current = self.current_period.load(Ordering::Acquire);
        let mut next;
        loop {
            let mut bitmap = period_bitmap(current) & !cpu_bit;
            let mut generation = period_generation(current);

            if bitmap != 0 {
                // Other CPUs are still owed; we are not starting a period.
                new_period = false;
            } else {
                // We are the last acknowledgement of the current period.
                // Start a new one if some CPU has not reached its target.
                new_period = self.max_target.load(Ordering::Relaxed) != generation;

                if new_period {
                    // Order the snapshot of the active set after any store
                    // on this CPU that must precede the new period. Matches
                    // the fence in activate_cpu(). (Stores on other CPUs are
                    // ordered by the acquire on the period load here and the
                    // release on their period store.)
                    fence(Ordering::SeqCst);

                    bitmap = self.active_cpus.load(Ordering::Relaxed);
                    generation = generation.wrapping_add(1);
                }
            }

            next = pack_period(generation, bitmap);
            match self.current_period.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        if new_period {
            // Matches the fence in deactivate_cpu().
            fence(Ordering::SeqCst);

            // CPUs that raced with us by deactivating after the snapshot.
            let cpus_needing_quiesce =
                period_bitmap(next) & !self.active_cpus.load(Ordering::Relaxed);

            let generation = period_generation(next);
            for cpu in 0..MAX_CPUS {
                if cpu == this_cpu {
                    continue;
                }
                let target = self.cpu.get_for(cpu).target.load(Ordering::Relaxed);
                if !is_before(generation, target) {
                    ipi::one(IpiReason::RcuNotify, cpu);
                }
                if cpus_needing_quiesce & (util::bit(cpu as u32) as u32) != 0 {
                    ipi::one(IpiReason::RcuQuiesce, cpu);
                }
            }

            // Process the completion locally, then trigger another quiesce
            // on this CPU so the new period can close in turn.
            reschedule = self.notify();
            ipi::one_relaxed(IpiReason::RcuQuiesce, this_cpu);
        }

        reschedule
    }

    fn request_grace_period(&self, my_state: &RcuCpuState, current_gen: u32) {
        preempt::assert_disabled();

        // The current period may already have been running when our updates
        // were enqueued, so we must wait for the one after the next.
        let target = current_gen.wrapping_add(2);
        my_state.target.store(target, Ordering::Relaxed);

        let mut old_max = self.max_target.load(Ordering::Relaxed);
        loop {
            if is_before(target, old_max) {
                break;
            }
            match self.max_target.compare_exchange_weak(
                old_max,
                target,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => old_max = observed,
            }
        }
    }

    /// Processes batch state on the current CPU after a generation change.
    ///
    /// Shifts next→waiting→ready when this CPU's target generation has been
    /// reached, dispatches ready updates, and requests a further grace
    /// period while updates are still waiting. Returns `true` if a
    /// reschedule is needed.
    pub fn notify(&self) -> bool {
        preempt::assert_disabled();
        let cpu = cpulocal::current_cpu();
        let my_state = self.cpu.get_for(cpu);
        let mut reschedule = false;

        // Nothing queued on this CPU: nothing to do.
        if my_state.update_count.load(Ordering::Relaxed) == 0 {
            return false;
        }

        // Ready updates must be dispatched before the shift below, so the
        // ready batch never needs merging.
        if my_state.ready_updates.get() {
            let _ = ipi::clear(IpiReason::RcuUpdate);
            reschedule = self.update();
        }

        // Has the period we are waiting for (if any) expired? The acquire
        // pairs with the release in quiesce().
        let target = my_state.target.load(Ordering::Relaxed);
        let current = self.current_period.load(Ordering::Acquire);
        if is_before(period_generation(current), target) {
            return reschedule;
        }

        // Advance the batches.
        let mut waiting_updates = false;
        for class in 0..NUM_CLASSES {
            debug_assert!(my_state.ready_batch.heads[class].get().is_null());

            let waiting_head = my_state.waiting_batch.heads[class].get();
            let next_head = my_state.next_batch.heads[class].get();

            if !waiting_head.is_null() {
                my_state.ready_updates.set(true);
            }
            if !next_head.is_null() {
                waiting_updates = true;
            }

            my_state.next_batch.heads[class].set(ptr::null_mut());
            my_state.waiting_batch.heads[class].set(next_head);
            my_state.ready_batch.heads[class].set(waiting_head);
        }

        if my_state.ready_updates.get() {
            ipi::one_relaxed(IpiReason::RcuUpdate, cpu);
        }

        if waiting_updates {
            self.request_grace_period(my_state, period_generation(current));
            if period_bitmap(current) == 0 {
                ipi::one_relaxed(IpiReason::RcuQuiesce, cpu);
            }
        }

        reschedule
    }

    /// Dispatches all ready updates on the current CPU.
    ///
    /// Returns `true` if any handler requested a reschedule.
    pub fn update(&self) -> bool {
        preempt::assert_disabled();
        let cpu = cpulocal::current_cpu();
        let my_state = self.cpu.get_for(cpu);
        let mut update_count: u64 = 0;
        let mut reschedule = false;

        if !my_state.ready_updates.get() {
            return false;
        }

        for class in 0..NUM_CLASSES {
            let mut entry = my_state.ready_batch.heads[class].get();
            my_state.ready_batch.heads[class].set(ptr::null_mut());

            while !entry.is_null() {
                // Read the next pointer before dispatching, in case the
                // handler frees the containing object.
                // SAFETY: Entries on the ready batch are live until their
                // handler runs, per the enqueue contract.
                let next = unsafe { (*entry).next.get() };
                reschedule |= dispatch(class, entry);
                entry = next;
                update_count += 1;
            }
        }

        if update_count != 0
            && my_state
                .update_count
                .fetch_sub(update_count, Ordering::Relaxed)
                == update_count
        {
            self.waiter_count.fetch_sub(1, Ordering::Relaxed);
        }

        my_state.ready_updates.set(false);

        reschedule
    }

    // -----------------------------------------------------------------------
    // Event hooks, called by the scheduler / idle / trap paths
    // -----------------------------------------------------------------------

    /// Quiescent point that neither activates nor deactivates the CPU.
    pub fn handle_scheduler_quiescent(&self) -> bool {
        let _ = ipi::clear(IpiReason::RcuQuiesce);
        self.quiesce()
    }

    /// Pre-context-switch hook. `from_idle` is `true` when the thread being
    /// switched away from is the idle thread.
    pub fn handle_context_switch_pre(&self, from_idle: bool) -> bool {
        if from_idle {
            self.activate_cpu();
        }
        if self.should_run() {
            let _ = ipi::clear(IpiReason::RcuQuiesce);
            self.quiesce()
        } else {
            false
        }
    }

    /// The idle thread is about to wait for an interrupt.
    pub fn handle_idle_yield(&self) -> bool {
        if self.should_run() {
            self.deactivate_cpu()
        } else {
            false
        }
    }

    /// The current thread is about to return to the guest.
    pub fn handle_exit_to_user(&self) -> bool {
        if self.should_run() {
            self.deactivate_cpu()
        } else {
            false
        }
    }

    /// The current CPU took a trap from the guest.
    pub fn handle_entry_from_user(&self) {
        self.activate_cpu();
    }

    /// The current CPU came online.
    pub fn handle_cpu_online(&self) {
        self.activate_cpu();
    }

    /// The current CPU wants to suspend. Refused while updates are pending,
    /// because their callbacks could only run here.
    pub fn handle_cpu_suspend(&self) -> boson_core::error::Result<()> {
        let my_state = self.cpu.get();
        if my_state.update_count.load(Ordering::Relaxed) != 0 {
            Err(boson_core::error::Error::Busy)
        } else {
            // Always deactivate, even if RCU has no work right now; being
            // woken spuriously later is far more expensive.
            let _ = self.deactivate_cpu();
            Ok(())
        }
    }

    /// The current CPU is going offline. Must not have pending updates.
    pub fn handle_cpu_offline(&self) {
        assert_eq!(
            self.cpu.get().update_count.load(Ordering::Relaxed),
            0,
            "CPU going offline with pending RCU updates"
        );
        let _ = self.deactivate_cpu();
    }

    /// Returns whether this CPU has updates that have not yet run.
    #[must_use]
    pub fn has_pending_updates(&self) -> bool {
        self.should_run() && self.cpu.get().update_count.load(Ordering::Relaxed) != 0
    }

    /// Processes any RCU IPIs pending on the current CPU.
    ///
    /// The kernel's idle loop and [`sync`](Self::sync) use this; test
    /// harnesses call it to pump simulated CPUs. Returns `true` if a
    /// reschedule was requested.
    pub fn pump_current_cpu(&self) -> bool {
        preempt::disable();
        let mut reschedule = false;
        if ipi::clear(IpiReason::RcuQuiesce) {
            reschedule |= self.quiesce();
        }
        if ipi::clear(IpiReason::RcuNotify) {
            reschedule |= self.notify();
        }
        if ipi::clear(IpiReason::RcuUpdate) {
            reschedule |= self.update();
        }
        preempt::enable();
        reschedule
    }

    /// Waits for a full grace period: every read section that was in
    /// progress when this is called has finished on return.
    ///
    /// Must be called with preemption enabled. The calling CPU participates
    /// cooperatively by pumping its own RCU work while it waits; other
    /// active CPUs are driven by the usual IPIs.
    pub fn sync(&self) {
        use core::sync::atomic::AtomicBool;

        #[repr(C)]
        struct SyncEntry {
            entry: RcuEntry,
            done: AtomicBool,
        }

        fn sync_handler(entry: *mut RcuEntry) -> bool {
            // SAFETY: Entries in the Sync class are always SyncEntry, with
            // the RcuEntry as first field of a repr(C) struct.
            let sync = unsafe { &*entry.cast::<SyncEntry>() };
            sync.done.store(true, Ordering::Release);
            false
        }

        set_class_handler(RcuClass::Sync, sync_handler);

        let mut marker = SyncEntry {
            entry: RcuEntry::new(),
            done: AtomicBool::new(false),
        };

        // The CPU must be active so the grace period cannot close without
        // it, and the marker must be enqueued before we start pumping.
        preempt::disable();
        self.activate_cpu();
        preempt::enable();

        // SAFETY: The marker outlives the wait loop below, which only
        // returns once the handler has run.
        unsafe { self.enqueue(&raw mut marker.entry, RcuClass::Sync) };

        while !marker.done.load(Ordering::Acquire) {
            self.pump_current_cpu();
            core::hint::spin_loop();
        }
    }
}

impl Default for RcuState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global instance
// ---------------------------------------------------------------------------

static RCU: RcuState = RcuState::new();

/// Returns the system-wide RCU state.
#[must_use]
pub fn global() -> &'static RcuState {
    &RCU
}

/// Enqueues a deferred update on the global RCU state.
///
/// # Safety
///
/// Same contract as [`RcuState::enqueue`].
pub unsafe fn enqueue(entry: *mut RcuEntry, class: RcuClass) {
    // SAFETY: Forwarded contract.
    unsafe { RCU.enqueue(entry, class) };
}

/// Waits for a grace period on the global RCU state.
pub fn sync() {
    RCU.sync();
}

#[cfg(test)]
mod tests;
