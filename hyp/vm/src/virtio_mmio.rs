//! VirtIO MMIO virtual devices.
//!
//! The guest-facing side emulates the VirtIO MMIO register block: a
//! stage-2 abort landing in the device's page is decoded into a register
//! read or write here. The backend side is a user-level device server
//! driven over hypercalls; the two meet in the shared register state and
//! a pair of VIRQ lines (frontend interrupt towards the guest, backend
//! notification towards the server).
//!
//! Access rules follow the VirtIO specification: the header and queue
//! registers take 4-byte accesses only; the device-specific configuration
//! space takes 1-, 2- or 4-byte accesses. Anything else faults back to the
//! caller, which injects an external abort.

use alloc::vec::Vec;

use bitflags::bitflags;

use boson_core::error::{Error, Result};
use boson_core::sync::SpinLock;
use boson_obj::{HypObject, ObjRef, ObjectHeader, ObjectType, Partition};

use crate::virq::VirqSource;

// Register offsets.
const REG_MAGIC: u64 = 0x00;
const REG_VERSION: u64 = 0x04;
const REG_DEVICE_ID: u64 = 0x08;
const REG_VENDOR_ID: u64 = 0x0c;
const REG_DEV_FEATURES: u64 = 0x10;
const REG_DEV_FEATURES_SEL: u64 = 0x14;
const REG_DRV_FEATURES: u64 = 0x20;
const REG_DRV_FEATURES_SEL: u64 = 0x24;
const REG_QUEUE_SEL: u64 = 0x30;
const REG_QUEUE_NUM_MAX: u64 = 0x34;
const REG_QUEUE_NUM: u64 = 0x38;
const REG_QUEUE_READY: u64 = 0x44;
const REG_QUEUE_NOTIFY: u64 = 0x50;
const REG_INT_STATUS: u64 = 0x60;
const REG_INT_ACK: u64 = 0x64;
const REG_STATUS: u64 = 0x70;
const REG_QUEUE_DESC_LOW: u64 = 0x80;
const REG_QUEUE_DESC_HIGH: u64 = 0x84;
const REG_QUEUE_DRV_LOW: u64 = 0x90;
const REG_QUEUE_DRV_HIGH: u64 = 0x94;
const REG_QUEUE_DEV_LOW: u64 = 0xa0;
const REG_QUEUE_DEV_HIGH: u64 = 0xa4;
const REG_CONFIG_GEN: u64 = 0xfc;
const REG_CONFIG: u64 = 0x100;

/// Size of the device-specific configuration space.
pub const CONFIG_BYTES: usize = 0x100;

/// "virt" in little-endian.
const MAGIC: u32 = 0x7472_6976;
/// Modern (v2) VirtIO MMIO.
const VERSION: u32 = 2;
const VENDOR_ID: u32 = 0x0a00_b500;

/// Feature banks selectable via the feature-select registers.
const FEATURE_BANKS: usize = 2;

/// Upper bound on configurable virtqueues.
pub const MAX_QUEUES: u32 = 8;

/// Status register bits written by the guest driver.
const STATUS_DRIVER_OK: u32 = 1 << 2;
const STATUS_FAILED: u32 = 1 << 7;

bitflags! {
    /// Pending reasons the backend is being notified for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NotifyReason: u32 {
        /// A queue was notified; the bitmap of queues is kept separately.
        const NEW_BUFFER = 1 << 0;
        /// The driver completed initialization.
        const DRIVER_OK = 1 << 1;
        /// The driver gave up on the device.
        const FAILED = 1 << 2;
        /// The driver requested a device reset.
        const RESET_RQST = 1 << 3;
        /// A queue's ready state changed.
        const QUEUE_READY = 1 << 4;
    }
}

/// Per-queue banked registers.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueRegs {
    /// Largest queue size the backend supports.
    pub num_max: u32,
    /// Queue size chosen by the driver.
    pub num: u32,
    /// Driver-controlled ready flag.
    pub ready: u32,
    /// Descriptor area address.
    pub desc: u64,
    /// Driver area address.
    pub drv: u64,
    /// Device area address.
    pub dev: u64,
}

struct Inner {
    device_id: u32,
    dev_features: [u32; FEATURE_BANKS],
    drv_features: [u32; FEATURE_BANKS],
    dev_features_sel: u32,
    drv_features_sel: u32,
    queue_sel: u32,
    queues: Vec<QueueRegs>,
    status: u32,
    int_status: u32,
    config_gen: u32,
    config: [u8; CONFIG_BYTES],
    reason: NotifyReason,
    /// Bitmap of queues notified since the last backend read.
    notified_queues: u32,
}

/// A VirtIO MMIO virtual device.
pub struct VirtioMmio {
    header: ObjectHeader,
    inner: SpinLock<Inner>,
    /// Interrupt towards the guest driver.
    frontend_source: VirqSource,
    /// Notification towards the backend server.
    backend_source: VirqSource,
}

impl HypObject for VirtioMmio {
    const TYPE: ObjectType = ObjectType::VirtioMmio;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn deactivate(&self) {
        self.frontend_source.unbind();
        self.backend_source.unbind();
    }
}

impl VirtioMmio {
    /// Creates a device of VirtIO type `device_id` with `num_queues`
    /// virtqueues.
    pub fn new(
        partition: Option<ObjRef<Partition>>,
        device_id: u32,
        num_queues: u32,
    ) -> Result<ObjRef<Self>> {
        if num_queues == 0 || num_queues > MAX_QUEUES {
            return Err(Error::ArgumentInvalid);
        }
        Ok(ObjRef::new(Self {
            header: ObjectHeader::new(ObjectType::VirtioMmio, partition),
            inner: SpinLock::new(Inner {
                device_id,
                dev_features: [0; FEATURE_BANKS],
                drv_features: [0; FEATURE_BANKS],
                dev_features_sel: 0,
                drv_features_sel: 0,
                queue_sel: 0,
                queues: alloc::vec![QueueRegs::default(); num_queues as usize],
                status: 0,
                int_status: 0,
                config_gen: 0,
                config: [0; CONFIG_BYTES],
                reason: NotifyReason::empty(),
                notified_queues: 0,
            }),
            frontend_source: VirqSource::new(),
            backend_source: VirqSource::new(),
        }))
    }

    /// Returns the frontend (guest interrupt) VIRQ source.
    #[must_use]
    pub fn frontend_source(&self) -> &VirqSource {
        &self.frontend_source
    }

    /// Returns the backend (server notification) VIRQ source.
    #[must_use]
    pub fn backend_source(&self) -> &VirqSource {
        &self.backend_source
    }

    fn access_allowed(offset: u64, size: u64) -> bool {
        if offset & (size - 1) != 0 {
            // Accesses must be size-aligned.
            false
        } else if size == 4 {
            true
        } else if size == 1 || size == 2 {
            // Sub-word accesses are only allowed in the config space.
            (REG_CONFIG..REG_CONFIG + CONFIG_BYTES as u64).contains(&offset)
        } else {
            false
        }
    }

    fn notify_backend(&self, inner: &mut Inner, reason: NotifyReason) {
        inner.reason |= reason;
        let _ = self.backend_source.assert();
    }

    // -----------------------------------------------------------------------
    // Guest-facing register access
    // -----------------------------------------------------------------------

    /// Emulates a guest read of `size` bytes at `offset`.
    ///
    /// Returns the value zero-extended to 64 bits, or
    /// [`Error::ArgumentInvalid`] for an access the device faults.
    pub fn read(&self, offset: u64, size: u64) -> Result<u64> {
        if !Self::access_allowed(offset, size) {
            return Err(Error::ArgumentInvalid);
        }

        let inner = self.inner.lock();
        if offset >= REG_CONFIG {
            let start = (offset - REG_CONFIG) as usize;
            let mut value: u64 = 0;
            for i in (0..size as usize).rev() {
                value = (value << 8) | u64::from(inner.config[start + i]);
            }
            return Ok(value);
        }

        let value = match offset {
            REG_MAGIC => MAGIC,
            REG_VERSION => VERSION,
            REG_DEVICE_ID => inner.device_id,
            REG_VENDOR_ID => VENDOR_ID,
            REG_DEV_FEATURES => inner
                .dev_features
                .get(inner.dev_features_sel as usize)
                .copied()
                .unwrap_or(0),
            REG_DEV_FEATURES_SEL => inner.dev_features_sel,
            REG_DRV_FEATURES => inner
                .drv_features
                .get(inner.drv_features_sel as usize)
                .copied()
                .unwrap_or(0),
            REG_DRV_FEATURES_SEL => inner.drv_features_sel,
            REG_QUEUE_SEL => inner.queue_sel,
            REG_QUEUE_NUM_MAX => inner.queues[inner.queue_sel as usize].num_max,
            REG_QUEUE_NUM => inner.queues[inner.queue_sel as usize].num,
            REG_QUEUE_READY => inner.queues[inner.queue_sel as usize].ready,
            REG_INT_STATUS => inner.int_status,
            REG_STATUS => inner.status,
            REG_QUEUE_DESC_LOW => inner.queues[inner.queue_sel as usize].desc as u32,
            REG_QUEUE_DESC_HIGH => (inner.queues[inner.queue_sel as usize].desc >> 32) as u32,
            REG_QUEUE_DRV_LOW => inner.queues[inner.queue_sel as usize].drv as u32,
            REG_QUEUE_DRV_HIGH => (inner.queues[inner.queue_sel as usize].drv >> 32) as u32,
            REG_QUEUE_DEV_LOW => inner.queues[inner.queue_sel as usize].dev as u32,
            REG_QUEUE_DEV_HIGH => (inner.queues[inner.queue_sel as usize].dev >> 32) as u32,
            REG_CONFIG_GEN => inner.config_gen,
            // Write-only registers read as zero.
            REG_QUEUE_NOTIFY | REG_INT_ACK => 0,
            _ => return Err(Error::ArgumentInvalid),
        };
        Ok(u64::from(value))
    }

    /// Emulates a guest write of `size` bytes at `offset`.
    pub fn write(&self, offset: u64, size: u64, value: u64) -> Result<()> {
        if !Self::access_allowed(offset, size) {
            return Err(Error::ArgumentInvalid);
        }

        let mut inner = self.inner.lock();
        if offset >= REG_CONFIG {
            let start = (offset - REG_CONFIG) as usize;
            let mut shifted = value;
            for i in 0..size as usize {
                inner.config[start + i] = shifted as u8;
                shifted >>= 8;
            }
            return Ok(());
        }

        let value = value as u32;
        match offset {
            REG_DEV_FEATURES_SEL => inner.dev_features_sel = value,
            REG_DRV_FEATURES => {
                let sel = inner.drv_features_sel as usize;
                if let Some(bank) = inner.drv_features.get_mut(sel) {
                    *bank = value;
                }
            }
            REG_DRV_FEATURES_SEL => inner.drv_features_sel = value,
            REG_QUEUE_SEL => {
                if (value as usize) < inner.queues.len() {
                    inner.queue_sel = value;
                }
                // Out-of-range selects are ignored; the banked registers
                // keep showing the previous queue.
            }
            REG_QUEUE_NUM => {
                let sel = inner.queue_sel as usize;
                let max = inner.queues[sel].num_max;
                inner.queues[sel].num = value.min(max);
            }
            REG_QUEUE_READY => {
                let sel = inner.queue_sel as usize;
                inner.queues[sel].ready = value & 1;
                self.notify_backend(&mut inner, NotifyReason::QUEUE_READY);
            }
            REG_QUEUE_NOTIFY => {
                if value < MAX_QUEUES {
                    inner.notified_queues |= 1 << value;
                    self.notify_backend(&mut inner, NotifyReason::NEW_BUFFER);
                }
            }
            REG_INT_ACK => {
                inner.int_status &= !value;
            }
            REG_STATUS => {
                let old = inner.status;
                if value == 0 {
                    // A zero write is a reset request; the backend confirms
                    // it with acknowledge_reset.
                    self.notify_backend(&mut inner, NotifyReason::RESET_RQST);
                } else {
                    inner.status = value;
                    if old & STATUS_DRIVER_OK == 0 && value & STATUS_DRIVER_OK != 0 {
                        self.notify_backend(&mut inner, NotifyReason::DRIVER_OK);
                    } else if old & STATUS_FAILED == 0 && value & STATUS_FAILED != 0 {
                        self.notify_backend(&mut inner, NotifyReason::FAILED);
                    }
                }
            }
            REG_QUEUE_DESC_LOW => set_low(&mut queue_mut(&mut inner).desc, value),
            REG_QUEUE_DESC_HIGH => set_high(&mut queue_mut(&mut inner).desc, value),
            REG_QUEUE_DRV_LOW => set_low(&mut queue_mut(&mut inner).drv, value),
            REG_QUEUE_DRV_HIGH => set_high(&mut queue_mut(&mut inner).drv, value),
            REG_QUEUE_DEV_LOW => set_low(&mut queue_mut(&mut inner).dev, value),
            REG_QUEUE_DEV_HIGH => set_high(&mut queue_mut(&mut inner).dev, value),
            // Read-only registers fault on write.
            _ => return Err(Error::ArgumentInvalid),
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Backend operations
    // -----------------------------------------------------------------------

    /// Sets one bank of device features offered to the guest.
    pub fn set_dev_features(&self, sel: u32, features: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.dev_features.get_mut(sel as usize) {
            Some(bank) => {
                *bank = features;
                Ok(())
            }
            None => Err(Error::ArgumentInvalid),
        }
    }

    /// Returns one bank of the features the driver accepted.
    pub fn drv_features(&self, sel: u32) -> Result<u32> {
        let inner = self.inner.lock();
        inner
            .drv_features
            .get(sel as usize)
            .copied()
            .ok_or(Error::ArgumentInvalid)
    }

    /// Sets the maximum size of a queue.
    pub fn set_queue_num_max(&self, queue: u32, num_max: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.queues.get_mut(queue as usize) {
            Some(q) => {
                q.num_max = num_max;
                Ok(())
            }
            None => Err(Error::ArgumentInvalid),
        }
    }

    /// Returns a queue's banked registers.
    pub fn queue_info(&self, queue: u32) -> Result<QueueRegs> {
        let inner = self.inner.lock();
        inner
            .queues
            .get(queue as usize)
            .copied()
            .ok_or(Error::ArgumentInvalid)
    }

    /// Returns and clears the pending notification reasons and the bitmap
    /// of queues notified since the last call.
    pub fn take_notification(&self) -> (NotifyReason, u32) {
        let mut inner = self.inner.lock();
        let reason = inner.reason;
        let queues = inner.notified_queues;
        inner.reason = NotifyReason::empty();
        inner.notified_queues = 0;
        (reason, queues)
    }

    /// Raises the guest-facing interrupt with the used-buffer bit.
    pub fn assert_virq(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.int_status |= 1;
        }
        self.frontend_source.assert().map(|_| ())
    }

    /// Completes a guest-requested reset: clears all driver-visible state.
    pub fn acknowledge_reset(&self) {
        let mut inner = self.inner.lock();
        inner.status = 0;
        inner.int_status = 0;
        inner.drv_features = [0; FEATURE_BANKS];
        inner.notified_queues = 0;
        for q in &mut inner.queues {
            q.num = 0;
            q.ready = 0;
            q.desc = 0;
            q.drv = 0;
            q.dev = 0;
        }
        inner.config_gen = inner.config_gen.wrapping_add(1);
    }

    /// Backend-side status update (e.g. DEVICE_NEEDS_RESET).
    pub fn update_status(&self, set: u32, clear: u32) {
        let mut inner = self.inner.lock();
        inner.status = (inner.status & !clear) | set;
    }

    /// Writes into the device-specific config space and bumps the
    /// generation counter.
    pub fn write_config(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if offset + bytes.len() > CONFIG_BYTES {
            return Err(Error::ArgumentSize);
        }
        inner.config[offset..offset + bytes.len()].copy_from_slice(bytes);
        inner.config_gen = inner.config_gen.wrapping_add(1);
        Ok(())
    }
}

fn queue_mut(inner: &mut Inner) -> &mut QueueRegs {
    let sel = inner.queue_sel as usize;
    &mut inner.queues[sel]
}

fn set_low(reg: &mut u64, value: u32) {
    *reg = (*reg & !0xffff_ffff) | u64::from(value);
}

fn set_high(reg: &mut u64, value: u32) {
    *reg = (*reg & 0xffff_ffff) | (u64::from(value) << 32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virq::Vic;
    use boson_core::cpulocal::set_current_cpu;

    fn device() -> ObjRef<VirtioMmio> {
        set_current_cpu(20);
        VirtioMmio::new(None, 18, 2).unwrap()
    }

    #[test]
    fn header_reads() {
        let dev = device();
        assert_eq!(dev.read(REG_MAGIC, 4), Ok(u64::from(MAGIC)));
        assert_eq!(dev.read(REG_VERSION, 4), Ok(2));
        assert_eq!(dev.read(REG_DEVICE_ID, 4), Ok(18));
        assert_eq!(dev.read(REG_VENDOR_ID, 4), Ok(u64::from(VENDOR_ID)));
    }

    #[test]
    fn access_size_rules() {
        let dev = device();
        // Byte access outside the config space faults.
        assert_eq!(dev.read(REG_STATUS, 1), Err(Error::ArgumentInvalid));
        assert_eq!(dev.write(REG_QUEUE_NUM, 2, 1), Err(Error::ArgumentInvalid));
        // Misaligned word access faults.
        assert_eq!(dev.read(REG_MAGIC + 2, 4), Err(Error::ArgumentInvalid));
        // Byte/halfword access inside the config space is allowed.
        dev.write_config(4, &[0xaa, 0xbb, 0xcc, 0xdd]).unwrap();
        assert_eq!(dev.read(REG_CONFIG + 4, 1), Ok(0xaa));
        assert_eq!(dev.read(REG_CONFIG + 4, 2), Ok(0xbbaa));
        assert_eq!(dev.read(REG_CONFIG + 4, 4), Ok(0xddcc_bbaa));
        // Writes to read-only registers fault.
        assert_eq!(dev.write(REG_MAGIC, 4, 0), Err(Error::ArgumentInvalid));
        assert_eq!(dev.write(REG_INT_STATUS, 4, 0), Err(Error::ArgumentInvalid));
    }

    #[test]
    fn feature_banks_select() {
        let dev = device();
        dev.set_dev_features(0, 0x1111).unwrap();
        dev.set_dev_features(1, 0x2222).unwrap();
        assert_eq!(dev.read(REG_DEV_FEATURES, 4), Ok(0x1111));
        dev.write(REG_DEV_FEATURES_SEL, 4, 1).unwrap();
        assert_eq!(dev.read(REG_DEV_FEATURES, 4), Ok(0x2222));

        dev.write(REG_DRV_FEATURES, 4, 0xaaaa).unwrap();
        dev.write(REG_DRV_FEATURES_SEL, 4, 1).unwrap();
        dev.write(REG_DRV_FEATURES, 4, 0xbbbb).unwrap();
        assert_eq!(dev.drv_features(0), Ok(0xaaaa));
        assert_eq!(dev.drv_features(1), Ok(0xbbbb));
    }

    #[test]
    fn queue_sel_banks_registers() {
        let dev = device();
        dev.set_queue_num_max(0, 256).unwrap();
        dev.set_queue_num_max(1, 128).unwrap();

        assert_eq!(dev.read(REG_QUEUE_NUM_MAX, 4), Ok(256));
        dev.write(REG_QUEUE_DESC_LOW, 4, 0x1000).unwrap();
        dev.write(REG_QUEUE_DESC_HIGH, 4, 0x2).unwrap();

        dev.write(REG_QUEUE_SEL, 4, 1).unwrap();
        assert_eq!(dev.read(REG_QUEUE_NUM_MAX, 4), Ok(128));
        // The other queue's registers are untouched.
        dev.write(REG_QUEUE_NUM, 4, 64).unwrap();
        dev.write(REG_QUEUE_READY, 4, 1).unwrap();

        let q0 = dev.queue_info(0).unwrap();
        assert_eq!(q0.desc, 0x2_0000_1000);
        assert_eq!(q0.num, 0);
        let q1 = dev.queue_info(1).unwrap();
        assert_eq!(q1.num, 64);
        assert_eq!(q1.ready, 1);

        // The driver cannot exceed the backend's max.
        dev.write(REG_QUEUE_NUM, 4, 1024).unwrap();
        assert_eq!(dev.queue_info(1).unwrap().num, 128);

        // Out-of-range queue select is ignored.
        dev.write(REG_QUEUE_SEL, 4, 7).unwrap();
        assert_eq!(dev.read(REG_QUEUE_SEL, 4), Ok(1));
    }

    #[test]
    fn notifications_reach_backend() {
        let dev = device();
        let vic = Vic::new();
        dev.backend_source().bind(&vic, 40).unwrap();

        dev.write(REG_QUEUE_NOTIFY, 4, 1).unwrap();
        assert!(vic.is_pending(40));
        let (reason, queues) = dev.take_notification();
        assert!(reason.contains(NotifyReason::NEW_BUFFER));
        assert_eq!(queues, 0b10);

        // Driver-OK transition raises its own reason.
        dev.write(REG_STATUS, 4, u64::from(STATUS_DRIVER_OK)).unwrap();
        let (reason, _queues) = dev.take_notification();
        assert!(reason.contains(NotifyReason::DRIVER_OK));

        // Reset request then backend acknowledge.
        dev.write(REG_STATUS, 4, 0).unwrap();
        let (reason, _queues) = dev.take_notification();
        assert!(reason.contains(NotifyReason::RESET_RQST));
        assert_eq!(dev.read(REG_STATUS, 4), Ok(u64::from(STATUS_DRIVER_OK)));
        dev.acknowledge_reset();
        assert_eq!(dev.read(REG_STATUS, 4), Ok(0));
        assert_eq!(dev.queue_info(1).unwrap().ready, 0);
    }

    #[test]
    fn interrupt_status_and_ack() {
        let dev = device();
        let vic = Vic::new();
        dev.frontend_source().bind(&vic, 41).unwrap();

        dev.assert_virq().unwrap();
        assert_eq!(dev.read(REG_INT_STATUS, 4), Ok(1));
        assert!(vic.is_pending(41));

        dev.write(REG_INT_ACK, 4, 1).unwrap();
        assert_eq!(dev.read(REG_INT_STATUS, 4), Ok(0));
    }
}
