//! Message queues.
//!
//! A message queue is a bounded FIFO of variable-size messages with a
//! fixed maximum, backed by a ring of `(length, payload)` records in
//! partition-allocated memory. Send and receive serialize on the queue
//! lock. Wake-up is edge-triggered VIRQ signalling: the sender asserts the
//! receiver's line when the fill level crosses the not-empty threshold (or
//! on an explicit push), and the receiver asserts the sender's line when
//! it crosses back through the not-full threshold. Both lines answer
//! re-assertion races through their check-pending callbacks, re-reporting
//! the level-based condition.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::ptr::NonNull;

use boson_core::error::{Error, Result};
use boson_core::sync::SpinLock;
use boson_obj::{HypObject, ObjRef, ObjectHeader, ObjectType, Partition};
use boson_vm::virq::{Vic, Virq, VirqSource};


/// Largest configurable queue depth.
pub const MAX_QUEUE_DEPTH: u32 = 256;
/// Largest configurable message size in bytes.
pub const MAX_MSG_SIZE: usize = 1024;

/// Sentinel: leave a threshold unchanged.
pub const THRESHOLD_UNCHANGED: u32 = u32::MAX;
/// Sentinel: set the not-empty threshold to the queue depth.
pub const THRESHOLD_MAXIMUM: u32 = u32::MAX - 1;
/// Sentinel: leave a delay unchanged. Non-sentinel delays are not
/// implemented.
pub const DELAY_UNCHANGED: u32 = u32::MAX;

struct Ring {
    buf: Option<(NonNull<u8>, usize)>,
    max_msg_size: usize,
    depth: u32,
    count: u32,
    head: usize,
    tail: usize,
    notfull_thd: u32,
    notempty_thd: u32,
}

impl Ring {
    const fn slot_size(&self) -> usize {
        self.max_msg_size + core::mem::size_of::<usize>()
    }

    fn buf_size(&self) -> usize {
        self.slot_size() * self.depth as usize
    }
}

// SAFETY: The ring buffer pointer is only dereferenced under the queue
// lock that owns the Ring.
unsafe impl Send for Ring {}

/// A bounded FIFO message queue.
pub struct MsgQueue {
    header: ObjectHeader,
    inner: SpinLock<Ring>,
    /// Not-full signalling towards the sender.
    send_source: VirqSource,
    /// Not-empty signalling towards the receiver.
    rcv_source: VirqSource,
}

impl HypObject for MsgQueue {
    const TYPE: ObjectType = ObjectType::MsgQueue;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn deactivate(&self) {
        let mut ring = self.inner.lock();
        if let Some((buf, size)) = ring.buf.take() {
            let partition = self
                .header
                .partition()
                .cloned()
                .unwrap_or_else(boson_obj::partition::private);
            // SAFETY: The buffer came from this partition at activation.
            unsafe { partition.free(buf, size, core::mem::align_of::<usize>()) };
        }
        drop(ring);

        self.send_source.unbind();
        self.rcv_source.unbind();
    }
}

fn rx_check_pending(owner: *const (), reasserted: bool) -> bool {
    if reasserted {
        // The previous VIRQ is still undelivered; dropping it here could
        // race a concurrent send on another CPU.
        return true;
    }
    // SAFETY: The owner pointer is the MsgQueue embedding the source.
    let queue = unsafe { &*owner.cast::<MsgQueue>() };
    let ring = queue.inner.lock();
    ring.count >= ring.notempty_thd
}

fn tx_check_pending(owner: *const (), reasserted: bool) -> bool {
    if reasserted {
        // As for the receive side, with a concurrent receive.
        return true;
    }
    // SAFETY: As above.
    let queue = unsafe { &*owner.cast::<MsgQueue>() };
    let ring = queue.inner.lock();
    ring.count <= ring.notfull_thd
}

impl MsgQueue {
    /// Creates an unconfigured message queue.
    #[must_use]
    pub fn new(partition: Option<ObjRef<Partition>>) -> ObjRef<Self> {
        let queue = ObjRef::new(Self {
            header: ObjectHeader::new(ObjectType::MsgQueue, partition),
            inner: SpinLock::new(Ring {
                buf: None,
                max_msg_size: 0,
                depth: 0,
                count: 0,
                head: 0,
                tail: 0,
                notfull_thd: 0,
                notempty_thd: 0,
            }),
            send_source: VirqSource::new(),
            rcv_source: VirqSource::new(),
        });
        // SAFETY: The sources are embedded in the queue and dropped with it.
        unsafe {
            queue
                .rcv_source
                .set_check_pending(queue.as_ptr().cast(), rx_check_pending);
            queue
                .send_source
                .set_check_pending(queue.as_ptr().cast(), tx_check_pending);
        }
        queue
    }

    /// Sets the queue geometry. Only valid before activation.
    pub fn configure(&self, max_msg_size: usize, depth: u32) -> Result<()> {
        assert_eq!(self.header.state(), boson_obj::ObjectState::Init);
        if depth == 0 || max_msg_size == 0 || depth > MAX_QUEUE_DEPTH || max_msg_size > MAX_MSG_SIZE
        {
            return Err(Error::ArgumentInvalid);
        }
        let mut ring = self.inner.lock();
        ring.max_msg_size = max_msg_size;
        ring.depth = depth;
        Ok(())
    }

    /// Allocates the ring and installs the default thresholds
    /// (`depth - 1` not-full, `1` not-empty).
    pub fn activate(&self) -> Result<()> {
        let mut ring = self.inner.lock();
        assert!(ring.buf.is_none());

        if ring.depth == 0 || ring.max_msg_size == 0 {
            return Err(Error::ObjectConfig);
        }

        let partition = self
            .header
            .partition()
            .cloned()
            .unwrap_or_else(boson_obj::partition::private);
        let size = ring.buf_size();
        let buf = partition.alloc(size, core::mem::align_of::<usize>())?;

        ring.buf = Some((buf, size));
        ring.count = 0;
        ring.head = 0;
        ring.tail = 0;
        ring.notfull_thd = ring.depth - 1;
        ring.notempty_thd = 1;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transfer
    // -----------------------------------------------------------------------

    /// Enqueues `msg`. With `push`, the receiver is signalled regardless
    /// of the not-empty threshold. Returns `false` when the queue became
    /// (or stays) full, as a hint that further sends will fail.
    pub fn send(&self, msg: &[u8], push: bool) -> Result<bool> {
        let mut ring = self.inner.lock();
        let Some((buf, _)) = ring.buf else {
            return Err(Error::ObjectState);
        };

        if msg.len() > ring.max_msg_size {
            return Err(Error::ArgumentSize);
        }
        if ring.count == ring.depth {
            return Err(Error::MsgQueueFull);
        }

        // Record layout: the length word, then the payload.
        let tail = ring.tail;
        // SAFETY: tail is record-aligned within the ring; the record fits.
        unsafe {
            let record = buf.as_ptr().add(tail);
            record.cast::<usize>().write_unaligned(msg.len());
            core::ptr::copy_nonoverlapping(
                msg.as_ptr(),
                record.add(core::mem::size_of::<usize>()),
                msg.len(),
            );
        }
        ring.count += 1;
        ring.tail = tail + ring.slot_size();
        if ring.tail == ring.buf_size() {
            ring.tail = 0;
        }

        // Crossing the not-empty threshold (or an explicit push) wakes the
        // receiver. The assert runs outside the lock: its check-pending
        // callback re-reads the fill level.
        let wake_receiver = push || ring.count == ring.notempty_thd;
        let not_full = ring.count != ring.depth;
        drop(ring);

        if wake_receiver {
            let _ = self.rcv_source.assert();
        }
        Ok(not_full)
    }

    /// Dequeues the oldest message into `out`. Returns its length and
    /// whether more messages remain.
    pub fn receive(&self, out: &mut [u8]) -> Result<(usize, bool)> {
        let mut ring = self.inner.lock();
        let Some((buf, _)) = ring.buf else {
            return Err(Error::ObjectState);
        };

        if ring.count == 0 {
            return Err(Error::MsgQueueEmpty);
        }

        let head = ring.head;
        // SAFETY: head points at a fully written record.
        let len = unsafe { buf.as_ptr().add(head).cast::<usize>().read_unaligned() };
        if len > out.len() {
            return Err(Error::ArgumentSize);
        }
        // SAFETY: The payload follows the length word within the record.
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf.as_ptr().add(head + core::mem::size_of::<usize>()),
                out.as_mut_ptr(),
                len,
            );
        }

        ring.count -= 1;
        ring.head = head + ring.slot_size();
        if ring.head == ring.buf_size() {
            ring.head = 0;
        }

        // Dropping back through the not-full threshold wakes the sender.
        let wake_sender = ring.count == ring.notfull_thd;
        let not_empty = ring.count != 0;
        drop(ring);

        if wake_sender {
            let _ = self.send_source.assert();
        }
        Ok((len, not_empty))
    }

    /// Empties the queue, waking the sender and dropping any pending
    /// receiver signal.
    pub fn flush(&self) {
        let mut ring = self.inner.lock();
        let Some((buf, size)) = ring.buf else {
            return;
        };

        let had_messages = ring.count != 0;

        // SAFETY: The whole ring belongs to this queue.
        unsafe { core::ptr::write_bytes(buf.as_ptr(), 0, size) };
        ring.count = 0;
        ring.head = 0;
        ring.tail = 0;
        drop(ring);

        // Any pending receiver signal is stale now; the sender always has
        // room again.
        if had_messages {
            let _ = self.send_source.assert();
            let _ = self.rcv_source.clear();
        }
    }

    // -----------------------------------------------------------------------
    // Configuration and binding
    // -----------------------------------------------------------------------

    /// Updates the sender-side (not-full) threshold.
    pub fn configure_send(&self, notfull_thd: u32, notfull_delay: u32) -> Result<()> {
        if notfull_delay != DELAY_UNCHANGED {
            return Err(Error::Unimplemented);
        }
        let mut ring = self.inner.lock();
        if notfull_thd == THRESHOLD_UNCHANGED {
            return Ok(());
        }
        if notfull_thd >= ring.depth {
            return Err(Error::ArgumentInvalid);
        }
        ring.notfull_thd = notfull_thd;
        let level = ring.count <= ring.notfull_thd;
        drop(ring);
        if level {
            let _ = self.send_source.assert();
        } else {
            let _ = self.send_source.clear();
        }
        Ok(())
    }

    /// Updates the receiver-side (not-empty) threshold.
    pub fn configure_receive(&self, notempty_thd: u32, notempty_delay: u32) -> Result<()> {
        if notempty_delay != DELAY_UNCHANGED {
            return Err(Error::Unimplemented);
        }
        if notempty_thd == 0 {
            return Err(Error::ArgumentInvalid);
        }
        let mut ring = self.inner.lock();
        if notempty_thd == THRESHOLD_UNCHANGED {
            return Ok(());
        }
        if notempty_thd == THRESHOLD_MAXIMUM {
            ring.notempty_thd = ring.depth;
            return Ok(());
        }
        if notempty_thd > ring.depth {
            return Err(Error::ArgumentInvalid);
        }
        ring.notempty_thd = notempty_thd;
        let level = ring.count >= ring.notempty_thd;
        drop(ring);
        if level {
            let _ = self.rcv_source.assert();
        } else {
            let _ = self.rcv_source.clear();
        }
        Ok(())
    }

    /// Binds the sender-side VIRQ.
    pub fn bind_send(&self, vic: &alloc::sync::Arc<Vic>, virq: Virq) -> Result<()> {
        self.send_source.bind(vic, virq)
    }

    /// Binds the receiver-side VIRQ.
    pub fn bind_receive(&self, vic: &alloc::sync::Arc<Vic>, virq: Virq) -> Result<()> {
        self.rcv_source.bind(vic, virq)
    }

    /// Unbinds the sender-side VIRQ.
    pub fn unbind_send(&self) {
        self.send_source.unbind();
    }

    /// Unbinds the receiver-side VIRQ.
    pub fn unbind_receive(&self) {
        self.rcv_source.unbind();
    }

    /// Returns the current fill level (diagnostics and tests).
    #[must_use]
    pub fn count(&self) -> u32 {
        self.inner.lock().count
    }
}
