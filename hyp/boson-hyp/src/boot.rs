//! Boot initialization.
//!
//! Cold init wires the process-wide state in dependency order: the
//! private partition, the memory database (seeded with the hypervisor
//! image and boot heap), the VMID namespace, and then per-CPU state (idle
//! thread, RCU activation) on each core as it comes up. Everything is
//! one-shot; none of it is torn down.

use boson_core::addr::PhysAddr;
use boson_core::error::Result;
use boson_memdb::MemdbType;

/// Describes the boot memory layout handed over by the entry code.
#[derive(Debug, Clone, Copy)]
pub struct BootLayout {
    /// Physical range of the hypervisor image: `(base, size)`.
    pub image: (u64, u64),
    /// Physical range of the boot heap handed to the allocator.
    pub heap: (u64, u64),
}

/// One-shot cold initialization, run on the boot CPU.
pub fn cold_init(layout: &BootLayout) -> Result<()> {
    boson_obj::partition::init_private();
    let hyp_partition = boson_obj::partition::private();

    boson_mm::addrspace::init_vmids();

    // Assign the hypervisor's image to the private partition, then hand
    // the boot heap over to its allocator.
    let memdb = boson_memdb::global();
    let (image_base, image_size) = layout.image;
    memdb.insert(
        PhysAddr::new(image_base),
        PhysAddr::new(image_base + image_size - 1),
        hyp_partition.as_ptr() as usize,
        MemdbType::Partition,
    )?;

    let (heap_base, heap_size) = layout.heap;
    memdb.insert(
        PhysAddr::new(heap_base),
        PhysAddr::new(heap_base + heap_size - 1),
        hyp_partition.as_ptr() as usize,
        MemdbType::Partition,
    )?;
    memdb.update(
        PhysAddr::new(heap_base),
        PhysAddr::new(heap_base + heap_size - 1),
        hyp_partition.as_ptr() as usize,
        MemdbType::Allocator,
        hyp_partition.as_ptr() as usize,
        MemdbType::Partition,
    )?;

    Ok(())
}

/// Per-CPU bring-up: idle thread and RCU activation. Run on each CPU,
/// including the boot CPU after [`cold_init`].
pub fn cpu_init() -> Result<()> {
    let sched = boson_sched::global();
    sched.init_cpu(Some(boson_obj::partition::private()))?;

    boson_core::sync::preempt::disable();
    boson_rcu::global().handle_cpu_online();
    boson_core::sync::preempt::enable();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use boson_core::cpulocal::set_current_cpu;

    #[test]
    fn cold_init_seeds_ownership() {
        set_current_cpu(23);
        let layout = BootLayout {
            image: (0x20_0000_0000, 0x20_0000),
            heap: (0x20_1000_0000, 0x100_0000),
        };
        cold_init(&layout).unwrap();

        let hyp = boson_obj::partition::private();
        let memdb = boson_memdb::global();
        assert_eq!(
            memdb.lookup(PhysAddr::new(0x20_0000_0000)),
            Ok((hyp.as_ptr() as usize, MemdbType::Partition))
        );
        assert_eq!(
            memdb.lookup(PhysAddr::new(0x20_1000_0000)),
            Ok((hyp.as_ptr() as usize, MemdbType::Allocator))
        );

        cpu_init().unwrap();
        let sched = boson_sched::global();
        assert_eq!(
            sched.current().kind(),
            boson_sched::ThreadKind::Idle
        );
        set_current_cpu(0);
    }
}
