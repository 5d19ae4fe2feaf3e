//! The fixed-priority round-robin scheduler.
//!
//! Each CPU has one FIFO runqueue per priority and a bitmap of non-empty
//! priorities. `pick` always prefers a higher priority; within one
//! priority it rotates only when the running thread's timeslice is spent.
//! A directed yield donates the remaining timeslice: the donor pins
//! itself, records the target, and the next pick switches to the target if
//! it is runnable here, marking the donor as `yielded_from` so a plain
//! yield can hand the remainder back.
//!
//! Blocking removes a thread from its runqueue; unblocking re-queues it,
//! or just marks `need_requeue` when the thread is still running somewhere
//! (it is re-queued when it switches out), or sends a reschedule IPI when
//! the thread belongs to another CPU. Affinity changes block the thread
//! with a dedicated reason, run the migration hook, and — if the hook
//! demands synchronization — hold the thread blocked across an RCU grace
//! period before releasing it on its new home.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use boson_core::cpulocal::{self, CPU_INDEX_INVALID, CpuIndex, CpuLocal, MAX_CPUS};
use boson_core::error::{Error, Result};
use boson_core::ipi::{self, IpiReason};
use boson_core::sync::{SpinLock, preempt};
use boson_core::time::{self, Ticks};
use boson_core::{kdebug, util};
use boson_obj::{ObjRef, Partition};
use boson_rcu::{RcuClass, RcuEntry};

use crate::thread::{BlockReason, Thread, ThreadKind, ThreadState, VcpuOptions};

/// Number of distinct priorities.
pub const NUM_PRIORITIES: usize = 64;
/// Lowest priority.
pub const MIN_PRIORITY: u8 = 0;
/// Highest priority.
pub const MAX_PRIORITY: u8 = (NUM_PRIORITIES - 1) as u8;
/// Priority given to threads that don't specify one.
pub const DEFAULT_PRIORITY: u8 = 32;

/// Default timeslice in nanoseconds.
pub const DEFAULT_TIMESLICE_NS: u64 = 5_000_000;
/// Largest configurable timeslice.
pub const MAX_TIMESLICE_NS: u64 = 100_000_000;
/// Smallest configurable timeslice.
pub const MIN_TIMESLICE_NS: u64 = 100_000;

boson_core::static_assert!(
    DEFAULT_PRIORITY >= MIN_PRIORITY && DEFAULT_PRIORITY <= MAX_PRIORITY,
    "default priority is invalid"
);
boson_core::static_assert!(
    DEFAULT_TIMESLICE_NS <= MAX_TIMESLICE_NS && DEFAULT_TIMESLICE_NS >= MIN_TIMESLICE_NS,
    "default timeslice is invalid"
);

/// Per-CPU runqueue state, under the CPU's scheduler lock.
struct RunQueues {
    queues: [VecDeque<ObjRef<Thread>>; NUM_PRIORITIES],
    /// Bit `i` set when `queues[i]` is non-empty (index 0 = highest).
    prio_bitmap: u64,
    /// Thread last granted the CPU (None while idling).
    active: Option<ObjRef<Thread>>,
    /// Pending reschedule timeout, if the timer is armed.
    timeout: Option<Ticks>,
}

impl RunQueues {
    fn new() -> Self {
        Self {
            queues: core::array::from_fn(|_| VecDeque::new()),
            prio_bitmap: 0,
            active: None,
            timeout: None,
        }
    }

    fn queue_index(priority: u8) -> usize {
        (MAX_PRIORITY - priority) as usize
    }

    fn add(&mut self, thread: ObjRef<Thread>) {
        let index = Self::queue_index(thread.sched.priority.get());
        let was_empty = self.queues[index].is_empty();
        debug_assert!(was_empty || self.prio_bitmap & util::bit(index as u32) != 0);
        self.queues[index].push_back(thread);
        if was_empty {
            self.prio_bitmap |= util::bit(index as u32);
        }
    }

    fn remove(&mut self, thread: &Thread) {
        let index = Self::queue_index(thread.sched.priority.get());
        debug_assert!(self.prio_bitmap & util::bit(index as u32) != 0);
        let queue = &mut self.queues[index];
        queue.retain(|t| !core::ptr::eq(t.as_ptr(), thread));
        if queue.is_empty() {
            self.prio_bitmap &= !util::bit(index as u32);
        }
    }

    fn pop_head(&mut self, index: usize) -> ObjRef<Thread> {
        debug_assert!(self.prio_bitmap & util::bit(index as u32) != 0);
        let head = self.queues[index].pop_front().expect("bitmap bit implies work");
        debug_assert_eq!(Self::queue_index(head.sched.priority.get()), index);
        if self.queues[index].is_empty() {
            self.prio_bitmap &= !util::bit(index as u32);
        }
        head
    }

    fn first_set(&self) -> Option<usize> {
        (self.prio_bitmap != 0).then(|| self.prio_bitmap.trailing_zeros() as usize)
    }
}

struct Scheduler {
    lock: SpinLock<RunQueues>,
}

/// The migration hook: called for a thread moving `prev → next`; returns
/// `true` if the move must wait for cross-CPU synchronization (e.g. a TLB
/// shootdown) before the thread may run again.
pub type MigrateHook = fn(&Thread, Option<CpuIndex>, Option<CpuIndex>) -> bool;

fn null_migrate(_t: &Thread, _prev: Option<CpuIndex>, _next: Option<CpuIndex>) -> bool {
    false
}

static MIGRATE_HOOK: AtomicPtr<()> = AtomicPtr::new(null_migrate as *mut ());

/// Registers the migration hook (boot only).
pub fn set_migrate_hook(hook: MigrateHook) {
    MIGRATE_HOOK.store(hook as *mut (), Ordering::Release);
}

fn migrate_hook(t: &Thread, prev: Option<CpuIndex>, next: Option<CpuIndex>) -> bool {
    let ptr = MIGRATE_HOOK.load(Ordering::Acquire);
    // SAFETY: Only valid MigrateHook pointers are stored.
    let f: MigrateHook = unsafe { core::mem::transmute(ptr) };
    f(t, prev, next)
}

/// System scheduler state: one runqueue set per CPU plus the per-CPU
/// current/idle/primary thread tracking.
///
/// The kernel uses [`global`]; tests construct their own instance.
pub struct SchedState {
    cpus: CpuLocal<Scheduler>,
    idle: CpuLocal<SpinLock<Option<ObjRef<Thread>>>>,
    /// First HLOS VCPU activated on each CPU.
    primary: CpuLocal<AtomicPtr<Thread>>,
    /// Thread currently executing on each CPU.
    running: CpuLocal<AtomicPtr<Thread>>,
}

impl SchedState {
    /// Creates a scheduler with no CPUs initialized.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cpus: CpuLocal::new(core::array::from_fn(|_| Scheduler {
                lock: SpinLock::new(RunQueues::new()),
            })),
            idle: CpuLocal::new(core::array::from_fn(|_| SpinLock::new(None))),
            primary: CpuLocal::new([const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_CPUS]),
            running: CpuLocal::new([const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_CPUS]),
        }
    }

    /// Creates the current CPU's idle thread and makes it current.
    pub fn init_cpu(&self, partition: Option<ObjRef<Partition>>) -> Result<()> {
        let cpu = cpulocal::current_cpu();
        let idle = Thread::new(partition, ThreadKind::Idle, 0)?;
        {
            let _guard = idle.sched_lock.lock();
            idle.sched.affinity.set(Some(cpu));
            idle.sched.block_bits.set(0);
        }
        idle.set_state(ThreadState::Ready);
        crate::arch::init_context(&idle);

        idle.sched.running.set(true);
        idle.active_affinity.store(cpu, Ordering::Relaxed);
        self.running
            .get_for(cpu)
            .store(idle.as_ptr().cast_mut(), Ordering::Release);
        // The running slot holds one reference.
        core::mem::forget(idle.clone());

        *self.idle.get_for(cpu).lock() = Some(idle);
        Ok(())
    }

    /// Returns the idle thread of `cpu`.
    ///
    /// # Panics
    ///
    /// Panics if the CPU was never initialized.
    #[must_use]
    pub fn idle_thread(&self, cpu: CpuIndex) -> ObjRef<Thread> {
        self.idle
            .get_for(cpu)
            .lock()
            .clone()
            .expect("CPU not initialized")
    }

    /// Returns the thread currently executing on this CPU.
    ///
    /// # Panics
    ///
    /// Panics if the CPU was never initialized.
    #[must_use]
    pub fn current(&self) -> ObjRef<Thread> {
        let ptr = self.running.get().load(Ordering::Acquire);
        assert!(!ptr.is_null(), "no current thread");
        boson_rcu::read_start();
        // SAFETY: The running slot holds a reference, so the thread is
        // alive; get_safe can only observe a nonzero count.
        let t = unsafe { ObjRef::get_safe(ptr.cast_const()) }.expect("current thread is alive");
        boson_rcu::read_finish();
        t
    }

    fn current_ptr(&self) -> *const Thread {
        self.running.get().load(Ordering::Acquire).cast_const()
    }

    /// Returns the primary (first HLOS) VCPU of `cpu`, if any.
    #[must_use]
    pub fn primary_vcpu(&self, cpu: CpuIndex) -> Option<NonNull<Thread>> {
        NonNull::new(self.primary.get_for(cpu).load(Ordering::Acquire))
    }

    // -----------------------------------------------------------------------
    // Thread lifecycle
    // -----------------------------------------------------------------------

    /// Activates a thread: initializes its switch context, takes its
    /// self-reference, moves it to READY and clears the lifecycle block.
    pub fn activate_thread(&self, thread: &ObjRef<Thread>) -> Result<()> {
        if thread.state() != ThreadState::Init {
            return Err(Error::ObjectState);
        }
        // Threads cannot migrate on this scheduler, so a valid affinity is
        // required by activation time.
        {
            let _guard = thread.sched_lock.lock();
            if thread.sched.affinity.get().is_none() {
                return Err(Error::ObjectConfig);
            }
        }

        crate::arch::init_context(thread);

        // The thread holds a reference to itself until exit; from here it
        // can only be deleted through kill.
        core::mem::forget(thread.clone());
        thread.set_state(ThreadState::Ready);

        let _guard = thread.sched_lock.lock();
        if self.unblock(thread, BlockReason::ThreadLifecycle) {
            self.trigger();
        }
        Ok(())
    }

    /// Applies VCPU activation options: the first HLOS VCPU on each CPU
    /// becomes that CPU's primary VCPU and is pinned, as is any explicitly
    /// pinned VCPU. Returns `false` if the options cannot be satisfied.
    pub fn vcpu_activate(&self, thread: &ObjRef<Thread>, options: VcpuOptions) -> bool {
        assert_eq!(thread.kind(), ThreadKind::Vcpu);

        let _guard = thread.sched_lock.lock();
        let mut pin = false;

        if options.contains(VcpuOptions::HLOS_VM) {
            let Some(affinity) = thread.sched.affinity.get() else {
                return false;
            };
            let slot = self.primary.get_for(affinity);
            if slot
                .compare_exchange(
                    core::ptr::null_mut(),
                    thread.as_ptr().cast_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                return false;
            }
            // The primary thread can't be migrated.
            pin = true;
        }

        if options.contains(VcpuOptions::PINNED) {
            if thread.sched.affinity.get().is_none() {
                return false;
            }
            pin = true;
        }

        let mut applied = options;
        if pin {
            self.pin(thread);
            applied |= VcpuOptions::PINNED;
        }
        thread.set_vcpu_options(applied);
        true
    }

    /// Exits the current thread: blocks it permanently and releases its
    /// self-reference, then schedules away.
    pub fn exit_current(&self) {
        let current = self.current();
        preempt::disable();

        current.set_state(ThreadState::Exited);
        {
            let _guard = current.sched_lock.lock_nopreempt();
            self.block(&current, BlockReason::ThreadLifecycle);
        }

        // Drop the self-reference taken at activation. The CPU still holds
        // one, released when the thread switches out.
        // SAFETY: Activation took this reference and exit runs only once.
        unsafe { boson_obj::put_raw(boson_obj::ObjectType::Thread, current.as_ptr().cast()) };

        let _ = self.schedule();
        preempt::enable();
    }

    /// Exit-to-guest boundary: a killed thread exits here.
    pub fn handle_exit_to_user(&self) {
        let current = self.current();
        match current.state() {
            ThreadState::Killed => self.exit_current(),
            state => debug_assert_eq!(state, ThreadState::Ready),
        }
    }

    // -----------------------------------------------------------------------
    // Blocking
    // -----------------------------------------------------------------------

    /// Sets `reason` on `thread` and dequeues it. Caller holds the
    /// thread's scheduler lock.
    pub fn block(&self, thread: &Thread, reason: BlockReason) {
        preempt::assert_disabled();
        kdebug!(
            "scheduler: block {:#x}, reason: {:?}",
            thread as *const Thread as usize,
            reason
        );
        thread
            .sched
            .block_bits
            .set(thread.sched.block_bits.get() | reason.bit());
        if thread.sched.queued.get() {
            self.remove_thread(thread);
        }
    }

    /// Clears `reason`; if the thread became runnable, queues it (or marks
    /// it for requeue while it is still running somewhere). Returns `true`
    /// if the caller should reschedule. Caller holds the thread's
    /// scheduler lock.
    pub fn unblock(&self, thread: &ObjRef<Thread>, reason: BlockReason) -> bool {
        preempt::assert_disabled();
        let bits = thread.sched.block_bits.get();
        let was_blocked = bits & reason.bit() != 0;
        thread.sched.block_bits.set(bits & !reason.bit());

        let mut need_schedule = was_blocked && self.is_runnable(thread);
        if need_schedule {
            debug_assert!(!thread.sched.queued.get());
            if thread.sched.running.get() {
                // Still on a CPU: mark for requeue at switch-out.
                thread.sched.need_requeue.set(true);
                need_schedule = self.resched_running(thread);
            } else {
                need_schedule = self.add_thread(thread);
            }
        }
        kdebug!(
            "scheduler: unblock {:#x}, reason: {:?}, local run: {}",
            thread.as_ptr() as usize,
            reason,
            need_schedule
        );
        need_schedule
    }

    /// Returns whether `reason` is set.
    #[must_use]
    pub fn is_blocked(&self, thread: &Thread, reason: BlockReason) -> bool {
        thread.sched.block_bits.get() & reason.bit() != 0
    }

    /// Returns whether no block reason is set.
    #[must_use]
    pub fn is_runnable(&self, thread: &Thread) -> bool {
        thread.sched.block_bits.get() == 0
    }

    fn add_thread(&self, thread: &ObjRef<Thread>) -> bool {
        preempt::assert_disabled();
        debug_assert!(self.is_runnable(thread));
        debug_assert!(!thread.sched.running.get());
        debug_assert!(!thread.sched.queued.get());

        let Some(affinity) = thread.sched.affinity.get() else {
            return false;
        };
        let cpu = cpulocal::current_cpu();
        let scheduler = self.cpus.get_for(affinity);

        let mut need_schedule = true;
        {
            let mut rq = scheduler.lock.lock_nopreempt();
            reset_sched_params(thread);
            thread.sched.queued.set(true);
            rq.add(thread.clone());

            if let Some(active) = &rq.active {
                if thread.sched.priority.get() < active.sched.priority.get() {
                    // Lower priority than the active thread: nothing to do
                    // until the active thread blocks.
                    need_schedule = false;
                }
            }
        }

        if need_schedule && cpu != affinity {
            ipi::one(IpiReason::Reschedule, affinity);
            need_schedule = false;
        }
        need_schedule
    }

    fn remove_thread(&self, thread: &Thread) {
        preempt::assert_disabled();
        let Some(affinity) = thread.sched.affinity.get() else {
            return;
        };
        debug_assert!(thread.sched.queued.get());

        let scheduler = self.cpus.get_for(affinity);
        let mut rq = scheduler.lock.lock_nopreempt();
        let was_active = rq
            .active
            .as_ref()
            .is_some_and(|a| core::ptr::eq(a.as_ptr(), thread));
        if was_active {
            rq.active = None;
        } else {
            rq.remove(thread);
        }
        thread.sched.queued.set(false);
        // The queue's reference (or the active slot's) is dropped with the
        // ObjRef that left the structure above.
    }

    fn resched_running(&self, thread: &Thread) -> bool {
        preempt::assert_disabled();
        debug_assert!(thread.sched.running.get());
        let cpu = thread.active_affinity.load(Ordering::Relaxed);
        debug_assert!(cpulocal::index_valid(cpu));
        if cpu != cpulocal::current_cpu() {
            ipi::one(IpiReason::Reschedule, cpu);
            false
        } else {
            true
        }
    }

    // -----------------------------------------------------------------------
    // Picking and switching
    // -----------------------------------------------------------------------

    fn get_next_target(&self, rq: &mut RunQueues, cpu: CpuIndex) -> ObjRef<Thread> {
        preempt::assert_disabled();
        let curticks = time::current_ticks();
        let prev = rq.active.clone();
        let mut target = prev.clone();

        let timeslice_expired = match &target {
            Some(t) => update_timeslice(t, curticks),
            None => false,
        };

        if let Some(index) = rq.first_set() {
            let priority = MAX_PRIORITY - index as u8;
            // Always prefer a higher priority; rotate within the same
            // priority only when the timeslice has been used up.
            let should_switch = match &target {
                None => true,
                Some(t) if timeslice_expired => priority >= t.sched.priority.get(),
                Some(t) => priority > t.sched.priority.get(),
            };
            if should_switch {
                let picked = rq.pop_head(index);
                target = Some(picked);
            }
        }

        match target {
            Some(t) => {
                t.sched.schedtime.set(curticks);
                rq.active = Some(t.clone());
                if let Some(prev) = prev {
                    if !core::ptr::eq(prev.as_ptr(), t.as_ptr()) {
                        rq.add(prev);
                    }
                }
                t
            }
            None => {
                rq.active = None;
                // `prev` was None here: the active slot survives unless the
                // thread blocked, in which case remove_thread cleared it.
                self.idle_thread(cpu)
            }
        }
    }

    fn set_next_timeout(&self, rq: &mut RunQueues, target: &ObjRef<Thread>, cpu: CpuIndex) {
        preempt::assert_disabled();
        let is_idle = core::ptr::eq(target.as_ptr(), self.idle_thread(cpu).as_ptr());

        let need_timeout = !is_idle && {
            // A timeout is needed if the current priority queue has more
            // work, or a directed yield may expire.
            let index = RunQueues::queue_index(target.sched.priority.get());
            rq.prio_bitmap & util::bit(index as u32) != 0
                || target.sched.yield_to.borrow().is_some()
        };

        if need_timeout {
            let timeout = target_timeout(target);
            // The timer only needs updating when the timeout changed.
            if rq.timeout != Some(timeout) {
                rq.timeout = Some(timeout);
            }
        } else {
            rq.timeout = None;
        }
    }

    fn can_yield_to(&self, yield_to: &Thread) -> bool {
        preempt::assert_disabled();
        let cpu = cpulocal::current_cpu();

        // The target must be homed here (or unpinned), not already picked
        // by another CPU through a different donor, and runnable.
        if let Some(affinity) = yield_to.sched.affinity.get() {
            if affinity != cpu {
                return false;
            }
        }
        if yield_to.sched.yielded_from.get().is_some()
            && !core::ptr::eq(yield_to, self.current_ptr())
        {
            return false;
        }
        self.is_runnable(yield_to)
    }

    fn select_yield_target(&self, target: ObjRef<Thread>) -> ObjRef<Thread> {
        preempt::assert_disabled();

        let yield_to = target.sched.yield_to.borrow().clone();
        if let Some(yield_to) = yield_to {
            let _guard = yield_to.sched_lock.lock_nopreempt();
            let can_yield = self.can_yield_to(&yield_to);
            if can_yield {
                yield_to
                    .sched
                    .yielded_from
                    .set(Some(NonNull::from(&*target)));
            }
            drop(_guard);
            if can_yield {
                return yield_to;
            }
            discard_yield_to(&target);
        }
        target
    }

    /// Runs the scheduler on the current CPU. Returns `true` if a context
    /// switch happened.
    pub fn schedule(&self) -> bool {
        let mut switched = false;
        preempt::disable();

        let cpu = cpulocal::current_cpu();
        loop {
            let scheduler = self.cpus.get_for(cpu);
            let target = {
                let mut rq = scheduler.lock.lock_nopreempt();
                let target = self.get_next_target(&mut rq, cpu);
                self.set_next_timeout(&mut rq, &target, cpu);
                target
            };

            let target = self.select_yield_target(target);

            if core::ptr::eq(target.as_ptr(), self.current_ptr()) {
                let _ = boson_rcu::global().handle_scheduler_quiescent();
                break;
            }

            if self.switch_to(&target).is_ok() {
                switched = true;
                if !ipi::clear(IpiReason::Reschedule) {
                    break;
                }
            }
            // Pick again: either the switch was refused (the target was
            // claimed elsewhere first) or a reschedule arrived meanwhile.
        }

        preempt::enable();
        switched
    }

    /// Requests a scheduler pass on the current CPU.
    pub fn trigger(&self) {
        ipi::one_relaxed(IpiReason::Reschedule, cpulocal::current_cpu());
    }

    /// Context-switches to `next`.
    fn switch_to(&self, next: &ObjRef<Thread>) -> Result<()> {
        preempt::assert_disabled();
        let cpu = cpulocal::current_cpu();
        let prev_ptr = self.current_ptr();
        debug_assert!(!core::ptr::eq(next.as_ptr(), prev_ptr));

        // SAFETY: The running slot holds a reference to prev.
        let prev_is_idle = unsafe { (*prev_ptr).kind() == ThreadKind::Idle };
        let _ = boson_rcu::global().handle_context_switch_pre(prev_is_idle);

        // Validate and claim the target. Its affinity may have changed
        // since it was picked, or another CPU may have claimed it.
        {
            let _guard = next.sched_lock.lock_nopreempt();
            let affinity = next.sched.affinity.get();
            let yielded_from = next.sched.yielded_from.get();

            let runnable = !next.sched.running.get()
                && (self.is_runnable(next) || next.kind() == ThreadKind::Idle);
            let affinity_valid = affinity == Some(cpu)
                || (affinity.is_none() && yielded_from.is_some());

            if !(runnable && affinity_valid) {
                if let Some(donor) = yielded_from {
                    // SAFETY: The donor is the thread we are switching away
                    // from; it is alive and pinned during its yield.
                    discard_yield_to(unsafe { donor.as_ref() });
                    next.sched.yielded_from.set(None);
                }
                return Err(Error::Denied);
            }

            debug_assert!(next.state() != ThreadState::Init);
            debug_assert!(!next.sched.need_requeue.get());
            next.sched.running.set(true);
            next.active_affinity.store(cpu, Ordering::Relaxed);
        }

        // The running slot takes a reference to next.
        core::mem::forget(next.clone());
        self.running
            .get()
            .store(next.as_ptr().cast_mut(), Ordering::Release);

        // SAFETY: prev is kept alive by the reference the running slot
        // held; it is released in switch_post below.
        let prev = unsafe { &*prev_ptr };
        // On hardware this resumes here only when something later switches
        // back to `prev`, and the actual predecessor is whatever ran last;
        // the arch layer reports it.
        let actual_prev = crate::arch::switch_context(prev, next);

        self.switch_post(actual_prev);
        Ok(())
    }

    /// Post-switch bookkeeping for the thread that was switched away from,
    /// including the release of the old running-slot reference.
    fn switch_post(&self, prev_ptr: *const Thread) {
        preempt::assert_disabled();
        // SAFETY: The old running-slot reference is still live.
        let prev = unsafe { &*prev_ptr };

        let mut need_schedule = false;
        {
            let _guard = prev.sched_lock.lock_nopreempt();
            prev.sched.yielded_from.set(None);
            prev.sched.running.set(false);

            if prev.sched.need_requeue.get() {
                // The thread may have blocked after being marked; check
                // again before queueing.
                if self.is_runnable(prev) {
                    // SAFETY: As above; constructing a temporary ObjRef for
                    // the queue insert.
                    let prev_ref = boson_rcu::read_protected(|| unsafe {
                        ObjRef::get_safe(prev_ptr)
                    });
                    if let Some(prev_ref) = prev_ref {
                        need_schedule = self.add_thread(&prev_ref);
                    }
                }
                prev.sched.need_requeue.set(false);
            }

            if self.is_blocked(prev, BlockReason::AffinityChanged) {
                need_schedule |= self.start_affinity_changed(prev_ptr);
            }

            // Publish that the thread is off-CPU, for scheduler_sync.
            prev.active_affinity.store(CPU_INDEX_INVALID, Ordering::Release);
        }

        // Release the old running-slot reference.
        // SAFETY: The slot owned exactly one reference to prev.
        unsafe { boson_obj::put_raw(boson_obj::ObjectType::Thread, prev_ptr.cast()) };

        if need_schedule {
            self.trigger();
        }
    }

    /// Completes switch bookkeeping on a thread's first entry (the arch
    /// layer calls this from the entry trampoline).
    #[cfg_attr(not(all(target_os = "none", target_arch = "aarch64")), allow(dead_code))]
    pub(crate) fn finish_first_entry(&self, prev: *const Thread) {
        self.switch_post(prev);
    }

    /// Waits until `thread` is no longer running on any CPU.
    pub fn sync(&self, thread: &Thread) {
        let cpu = thread.active_affinity.load(Ordering::Acquire);
        if cpulocal::index_valid(cpu) {
            ipi::one(IpiReason::Reschedule, cpu);
            while cpulocal::index_valid(thread.active_affinity.load(Ordering::Acquire)) {
                core::hint::spin_loop();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Yielding
    // -----------------------------------------------------------------------

    /// Gives up the CPU: hands a donated timeslice back to the donor, or
    /// zeroes the caller's own remaining timeslice.
    pub fn yield_now(&self) {
        preempt::disable();
        let current = self.current();
        let yielded_from = current.sched.yielded_from.get();
        if let Some(donor) = yielded_from {
            // SAFETY: The donor is pinned and alive during its yield.
            discard_yield_to(unsafe { donor.as_ref() });
        } else {
            current.sched.active_timeslice.set(0);
        }
        let _ = self.schedule();
        preempt::enable();
    }

    /// Donates the remaining timeslice to `target`.
    pub fn yield_to(&self, target: &ObjRef<Thread>) {
        let current = self.current();
        assert!(!core::ptr::eq(current.as_ptr(), target.as_ptr()));

        preempt::disable();

        // Pin the caller for the duration: migration during a directed
        // yield is unsupported, and pinning lets the yield_to pointer be
        // read without the thread lock.
        {
            let _guard = current.sched_lock.lock_nopreempt();
            self.pin(&current);
        }

        let yielded_from = current.sched.yielded_from.get();
        match yielded_from {
            Some(donor) if core::ptr::eq(donor.as_ptr(), target.as_ptr()) => {
                // Yielding back to our own donor ends the donation.
                // SAFETY: The donor is pinned and alive during its yield.
                discard_yield_to(unsafe { donor.as_ref() });
            }
            Some(donor) => {
                // Forward the donated slice to the new target.
                // SAFETY: As above.
                let donor = unsafe { donor.as_ref() };
                discard_yield_to(donor);
                set_yield_to(donor, target);
            }
            None => set_yield_to(&current, target),
        }

        let _ = self.schedule();

        {
            let _guard = current.sched_lock.lock_nopreempt();
            self.unpin(&current);
        }
        preempt::enable();
    }

    // -----------------------------------------------------------------------
    // Parameters and affinity
    // -----------------------------------------------------------------------

    fn pin(&self, thread: &Thread) {
        preempt::assert_disabled();
        thread.sched.pin_count.set(thread.sched.pin_count.get() + 1);
    }

    fn unpin(&self, thread: &Thread) {
        preempt::assert_disabled();
        let count = thread.sched.pin_count.get();
        debug_assert!(count > 0);
        thread.sched.pin_count.set(count - 1);
    }

    /// Returns the thread's homed affinity. Caller holds the thread lock.
    #[must_use]
    pub fn affinity(&self, thread: &Thread) -> Option<CpuIndex> {
        thread.sched.affinity.get()
    }

    /// Changes the thread's home CPU. The thread is blocked for the
    /// duration of the migration; if the migration hook demands
    /// synchronization, the unblock waits out an RCU grace period.
    /// Caller holds the thread's scheduler lock.
    pub fn set_affinity(&self, thread: &ObjRef<Thread>, target_cpu: CpuIndex) -> Result<()> {
        preempt::assert_disabled();
        if !cpulocal::index_valid(target_cpu) {
            return Err(Error::ArgumentInvalid);
        }
        let prev_cpu = thread.sched.affinity.get();
        if prev_cpu == Some(target_cpu) {
            return Ok(());
        }
        if thread.sched.pin_count.get() != 0 {
            return Err(Error::Denied);
        }
        if self.is_blocked(thread, BlockReason::AffinityChanged) {
            return Err(Error::Retry);
        }

        // Block the thread so affinity changes serialize, holding an extra
        // reference until the change completes (dropped by the event path).
        core::mem::forget(thread.clone());
        self.block(thread, BlockReason::AffinityChanged);

        thread.sched.prev_affinity.set(prev_cpu);
        thread.sched.affinity.set(Some(target_cpu));

        let need_schedule = if thread.sched.running.get() {
            // Reschedule the running CPU; its switch-out runs the events.
            self.resched_running(thread)
        } else {
            self.start_affinity_changed(thread.as_ptr())
        };

        if need_schedule {
            self.trigger();
        }
        Ok(())
    }

    /// Starts the migration events for a thread blocked on
    /// `AffinityChanged`. Consumes the reference taken by `set_affinity`.
    fn start_affinity_changed(&self, thread_ptr: *const Thread) -> bool {
        preempt::assert_disabled();
        // SAFETY: set_affinity holds a reference across the change.
        let thread = unsafe { &*thread_ptr };
        debug_assert!(self.is_blocked(thread, BlockReason::AffinityChanged));

        let need_sync = migrate_hook(
            thread,
            thread.sched.prev_affinity.get(),
            thread.sched.affinity.get(),
        );

        if need_sync {
            // Hold the thread blocked across a grace period; the RCU
            // callback completes the unblock.
            boson_rcu::set_class_handler(RcuClass::AffinityChanged, affinity_change_handler);
            let entry = Box::new(AffinityChangeEntry {
                entry: RcuEntry::new(),
                sched: self as *const SchedState,
                thread: thread_ptr,
            });
            let raw = Box::into_raw(entry);
            // SAFETY: The box is leaked; the handler reclaims it.
            unsafe { boson_rcu::enqueue(raw.cast::<RcuEntry>(), RcuClass::AffinityChanged) };
            false
        } else {
            // SAFETY: As above; temporary ObjRef for the unblock.
            let thread_ref = boson_rcu::read_protected(|| unsafe { ObjRef::get_safe(thread_ptr) })
                .expect("migrating thread holds a reference");
            let need_schedule = self.unblock(&thread_ref, BlockReason::AffinityChanged);
            // Drop the reference held across the change.
            // SAFETY: Taken in set_affinity.
            unsafe { boson_obj::put_raw(boson_obj::ObjectType::Thread, thread_ptr.cast()) };
            need_schedule
        }
    }

    /// Changes a thread's priority. Caller holds the thread lock.
    pub fn set_priority(&self, thread: &ObjRef<Thread>, priority: u8) -> Result<()> {
        preempt::assert_disabled();
        if priority > MAX_PRIORITY {
            return Err(Error::ArgumentInvalid);
        }
        if thread.sched.priority.get() != priority {
            self.update_params(thread, priority, thread.sched.base_timeslice.get());
        }
        Ok(())
    }

    /// Changes a thread's timeslice. Caller holds the thread lock.
    pub fn set_timeslice(&self, thread: &ObjRef<Thread>, timeslice_ns: u64) -> Result<()> {
        preempt::assert_disabled();
        if !(MIN_TIMESLICE_NS..=MAX_TIMESLICE_NS).contains(&timeslice_ns) {
            return Err(Error::ArgumentInvalid);
        }
        let ticks = time::ns_to_ticks(timeslice_ns);
        if thread.sched.base_timeslice.get() != ticks {
            self.update_params(thread, thread.sched.priority.get(), ticks);
        }
        Ok(())
    }

    fn update_params(&self, thread: &ObjRef<Thread>, priority: u8, timeslice: Ticks) {
        preempt::assert_disabled();
        // Safe to update in place when the thread is blocked or already
        // marked for requeue; otherwise dequeue around the change.
        let requeue = self.is_runnable(thread) && !thread.sched.need_requeue.get();

        if requeue && thread.sched.queued.get() {
            self.remove_thread(thread);
        }

        thread.sched.priority.set(priority);
        thread.sched.base_timeslice.set(timeslice);

        if requeue {
            let need_schedule = if thread.sched.running.get() {
                thread.sched.need_requeue.set(true);
                self.resched_running(thread)
            } else {
                self.add_thread(thread)
            };
            if need_schedule {
                self.trigger();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Idle and timers
    // -----------------------------------------------------------------------

    /// Returns whether the current thread may enter the idle loop.
    #[must_use]
    pub fn current_can_idle(&self) -> bool {
        preempt::assert_disabled();
        let cpu = cpulocal::current_cpu();
        let current_ptr = self.current_ptr();

        if core::ptr::eq(current_ptr, self.idle_thread(cpu).as_ptr()) {
            return true;
        }

        let rq = self.cpus.get_for(cpu).lock.lock_nopreempt();
        match &rq.active {
            Some(active) if core::ptr::eq(active.as_ptr(), current_ptr) => rq.prio_bitmap == 0,
            // Not the active thread: a reschedule is due first.
            _ => false,
        }
    }

    /// The reschedule timer for this CPU fired.
    pub fn handle_timer(&self) {
        preempt::assert_disabled();
        self.cpus.get().lock.lock_nopreempt().timeout = None;
        self.trigger();
    }

    /// Returns the armed reschedule timeout for `cpu`, if any.
    #[must_use]
    pub fn timeout_for(&self, cpu: CpuIndex) -> Option<Ticks> {
        self.cpus.get_for(cpu).lock.lock().timeout
    }
}

impl Default for SchedState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Timeslice and yield helpers
// ---------------------------------------------------------------------------

fn target_timeout(target: &Thread) -> Ticks {
    target.sched.schedtime.get() + target.sched.active_timeslice.get()
}

fn reset_sched_params(target: &Thread) {
    target
        .sched
        .active_timeslice
        .set(target.sched.base_timeslice.get());
}

/// Charges elapsed time to the target. Returns `true` if its timeslice
/// expired (which also drops any directed-yield donation).
fn update_timeslice(target: &Thread, curticks: Ticks) -> bool {
    let timeout = target_timeout(target);
    let expired = timeout <= curticks;

    if expired {
        reset_sched_params(target);
        if target.sched.yield_to.borrow().is_some() {
            discard_yield_to(target);
        }
    } else {
        // Account for the time the target has used.
        target.sched.active_timeslice.set(timeout - curticks);
    }
    expired
}

fn set_yield_to(target: &Thread, yield_to: &ObjRef<Thread>) {
    debug_assert!(!core::ptr::eq(target, yield_to.as_ptr()));
    let mut slot = target.sched.yield_to.borrow_mut();
    debug_assert!(slot.is_none());
    *slot = Some(yield_to.clone());
}

fn discard_yield_to(target: &Thread) {
    let taken = target.sched.yield_to.borrow_mut().take();
    debug_assert!(taken.is_some());
    drop(taken);
}

// ---------------------------------------------------------------------------
// Affinity-change RCU entries
// ---------------------------------------------------------------------------

#[repr(C)]
struct AffinityChangeEntry {
    entry: RcuEntry,
    sched: *const SchedState,
    thread: *const Thread,
}

fn affinity_change_handler(entry: *mut RcuEntry) -> bool {
    // SAFETY: Only AffinityChangeEntry boxes are enqueued with this class.
    let entry = unsafe { Box::from_raw(entry.cast::<AffinityChangeEntry>()) };
    // SAFETY: The scheduler state outlives all threads; the thread holds
    // the reference taken by set_affinity.
    let sched = unsafe { &*entry.sched };
    let thread_ptr = entry.thread;

    let need_schedule = {
        // SAFETY: As above.
        let thread = unsafe { &*thread_ptr };
        let _guard = thread.sched_lock.lock();
        debug_assert!(sched.is_blocked(thread, BlockReason::AffinityChanged));
        let thread_ref = boson_rcu::read_protected(|| unsafe { ObjRef::get_safe(thread_ptr) })
            .expect("migrating thread holds a reference");
        sched.unblock(&thread_ref, BlockReason::AffinityChanged)
    };

    // SAFETY: Drops the reference taken by set_affinity.
    unsafe { boson_obj::put_raw(boson_obj::ObjectType::Thread, thread_ptr.cast()) };
    need_schedule
}

// ---------------------------------------------------------------------------
// Global instance
// ---------------------------------------------------------------------------

static GLOBAL: AtomicPtr<SchedState> = AtomicPtr::new(core::ptr::null_mut());

/// Returns the system scheduler, creating it on first use.
#[must_use]
pub fn global() -> &'static SchedState {
    let ptr = GLOBAL.load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: Leaked for the process lifetime.
        return unsafe { &*ptr };
    }
    let fresh = Box::into_raw(Box::new(SchedState::new()));
    match GLOBAL.compare_exchange(
        core::ptr::null_mut(),
        fresh,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        // SAFETY: Just installed and leaked.
        Ok(_) => unsafe { &*fresh },
        Err(existing) => {
            // SAFETY: `fresh` lost the race and was never shared.
            drop(unsafe { Box::from_raw(fresh) });
            // SAFETY: The winner's install is permanent.
            unsafe { &*existing }
        }
    }
}
