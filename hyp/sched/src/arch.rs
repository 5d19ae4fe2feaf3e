//! Architecture-specific thread context handling.
//!
//! On the kernel target the context switch saves pc, sp and fp into the
//! outgoing thread's context block — with every other integer register in
//! the clobber list, so the compiler spills whatever it needs — loads the
//! incoming thread's triple, and branches. A thread's first switch-in
//! enters [`thread_entry`] with the outgoing thread pointer in x0.
//!
//! Host builds substitute a bookkeeping-only switch so the scheduler's
//! pick/claim/post logic is fully testable with `cargo test`.

use crate::thread::Thread;

/// Initializes a thread's context so its first switch-in enters
/// [`thread_entry`] on its own stack.
pub(crate) fn init_context(thread: &Thread) {
    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    {
        thread.context.pc.set(thread_entry as usize);
        let (base, size) = thread
            .stack
            .get()
            .map(|(b, s)| (b.as_ptr() as usize, s))
            .expect("activating thread has a stack");
        thread.context.sp.set(base + size);
        thread.context.fp.set(0);
    }
    #[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
    {
        thread.context.pc.set(0);
        thread.context.sp.set(0);
        thread.context.fp.set(0);
    }
}

/// Switches execution from `prev` to `next`, returning the thread that was
/// actually running before control came back to `prev`.
#[cfg(all(target_os = "none", target_arch = "aarch64"))]
pub(crate) fn switch_context(prev: &Thread, next: &Thread) -> *const Thread {
    let mut actual_prev: usize = core::ptr::from_ref(prev) as usize;

    // SAFETY: The context block is the (pc, sp, fp) triple; the incoming
    // context was produced by this function or init_context. x0 carries
    // the outgoing thread pointer so thread_entry receives it on a first
    // switch-in. The new PC is in x16 so BTI treats the branch as a call
    // trampoline. Everything not pinned or rebuilt by the template is
    // clobbered, forcing the compiler to spill live state.
    unsafe {
        core::arch::asm!(
            "adr x9, 2f",
            "mov x10, sp",
            "stp x9, x10, [x2]",
            "str x29, [x2, #16]",
            "mov sp, x3",
            "mov x29, x4",
            "br x16",
            "2:",
            in("x2") core::ptr::from_ref(&prev.context) as usize,
            in("x3") next.context.sp.get(),
            in("x4") next.context.fp.get(),
            in("x16") next.context.pc.get(),
            inout("x0") actual_prev,
            lateout("x1") _, lateout("x5") _, lateout("x6") _, lateout("x7") _,
            lateout("x8") _, lateout("x9") _, lateout("x10") _, lateout("x11") _,
            lateout("x12") _, lateout("x13") _, lateout("x14") _, lateout("x15") _,
            lateout("x17") _, lateout("x19") _, lateout("x20") _, lateout("x21") _,
            lateout("x22") _, lateout("x23") _, lateout("x24") _, lateout("x25") _,
            lateout("x26") _, lateout("x27") _, lateout("x28") _, lateout("x30") _,
        );
    }

    actual_prev as *const Thread
}

/// Host stand-in: the switch is pure bookkeeping and control continues in
/// the caller, so the previous thread is exactly `prev`.
#[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
pub(crate) fn switch_context(prev: &Thread, next: &Thread) -> *const Thread {
    let _ = next;
    core::ptr::from_ref(prev)
}

/// First-entry point for freshly activated threads (kernel target).
#[cfg(all(target_os = "none", target_arch = "aarch64"))]
extern "C" fn thread_entry(prev: *const Thread) -> ! {
    let sched = crate::scheduler::global();
    sched.finish_first_entry(prev);

    match sched.current().kind() {
        crate::thread::ThreadKind::Idle => crate::idle::idle_loop(),
        crate::thread::ThreadKind::Vcpu => {
            // Hand control to the guest entry path installed by the trap
            // layer; it never returns here.
            boson_core::sync::preempt::enable();
            loop {
                sched.handle_exit_to_user();
                core::hint::spin_loop();
            }
        }
    }
}
