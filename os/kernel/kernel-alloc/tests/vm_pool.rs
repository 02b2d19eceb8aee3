use kernel_alloc::vm_pool::VmPoolError;
use kernel_alloc::vmm::{MemoryLayout, Vmm};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::sim::SimMachine;
use kernel_vmem::{FaultError, PageFaultError, directory_window};

const RAM: u32 = 32 * 1024 * 1024;
const BASE: VirtualAddress = VirtualAddress::new(0x4000_0000);

#[test]
fn capacity_runs_out_after_bookkeeping_page() {
    let sim = SimMachine::new(RAM);
    let mut vmm = Vmm::bootstrap(&sim, MemoryLayout::default()).expect("bootstrap");
    let mut pool = vmm.new_vm_pool(BASE, 4 * PAGE_SIZE).expect("pool");
    assert_eq!(pool.remaining_capacity(), 3 * PAGE_SIZE);

    assert_eq!(pool.allocate(PAGE_SIZE), Ok(BASE + PAGE_SIZE));
    assert_eq!(pool.allocate(2 * PAGE_SIZE), Ok(BASE + 2 * PAGE_SIZE));
    assert_eq!(
        pool.allocate(PAGE_SIZE),
        Err(VmPoolError::CapacityExceeded {
            requested: PAGE_SIZE,
            remaining: 0
        })
    );
    assert_eq!(pool.regions().len(), 3);
}

#[test]
fn sizes_round_up_to_pages() {
    let sim = SimMachine::new(RAM);
    let mut vmm = Vmm::bootstrap(&sim, MemoryLayout::default()).expect("bootstrap");
    let mut pool = vmm.new_vm_pool(BASE, 16 * PAGE_SIZE).expect("pool");

    let a = pool.allocate(1).expect("region");
    let b = pool.allocate(PAGE_SIZE + 1).expect("region");
    assert_eq!(a, BASE + PAGE_SIZE);
    assert_eq!(b, BASE + 2 * PAGE_SIZE);
    assert_eq!(pool.regions()[2].length(), 2 * PAGE_SIZE);
    assert_eq!(pool.remaining_capacity(), 12 * PAGE_SIZE);

    assert!(matches!(
        pool.allocate(0),
        Err(VmPoolError::CapacityExceeded { requested: 0, .. })
    ));
    assert_eq!(pool.allocate(12 * PAGE_SIZE - 10), Ok(BASE + 4 * PAGE_SIZE));
    assert_eq!(pool.remaining_capacity(), 0);
    assert!(matches!(
        pool.allocate(1),
        Err(VmPoolError::CapacityExceeded { remaining: 0, .. })
    ));
}

#[test]
fn release_restores_capacity_and_keeps_regions_disjoint() {
    let sim = SimMachine::new(RAM);
    let mut vmm = Vmm::bootstrap(&sim, MemoryLayout::default()).expect("bootstrap");
    let mut pool = vmm.new_vm_pool(BASE, 8 * PAGE_SIZE).expect("pool");

    let a = pool.allocate(2 * PAGE_SIZE).expect("region");
    let b = pool.allocate(3 * PAGE_SIZE).expect("region");
    let c = pool.allocate(2 * PAGE_SIZE).expect("region");
    assert_eq!(pool.remaining_capacity(), 0);

    vmm.release(&mut pool, a).expect("release");
    assert_eq!(pool.remaining_capacity(), 2 * PAGE_SIZE);

    // the tail is full; the hole left by `a` is reused
    let d = pool.allocate(PAGE_SIZE).expect("region");
    assert_eq!(d, a);
    let e = pool.allocate(PAGE_SIZE).expect("region");
    assert_eq!(e, a + PAGE_SIZE);

    vmm.release(&mut pool, b).expect("release");
    vmm.release(&mut pool, c).expect("release");
    let used: u32 = pool.regions().iter().map(|r| r.length()).sum();
    assert_eq!(pool.remaining_capacity() + used, pool.capacity());

    let mut regions = pool.regions().to_vec();
    regions.sort_by_key(|r| r.start());
    for pair in regions.windows(2) {
        assert!(pair[0].end() <= u64::from(pair[1].start().as_u32()));
    }
}

#[test]
fn scattered_capacity_is_reported() {
    let sim = SimMachine::new(RAM);
    let mut vmm = Vmm::bootstrap(&sim, MemoryLayout::default()).expect("bootstrap");
    let mut pool = vmm.new_vm_pool(BASE, 5 * PAGE_SIZE).expect("pool");

    let a = pool.allocate(PAGE_SIZE).expect("region");
    pool.allocate(PAGE_SIZE).expect("region");
    let c = pool.allocate(PAGE_SIZE).expect("region");
    pool.allocate(PAGE_SIZE).expect("region");
    vmm.release(&mut pool, a).expect("release");
    vmm.release(&mut pool, c).expect("release");

    assert_eq!(pool.remaining_capacity(), 2 * PAGE_SIZE);
    assert_eq!(
        pool.allocate(2 * PAGE_SIZE),
        Err(VmPoolError::NoContiguousRange(2 * PAGE_SIZE))
    );
}

#[test]
fn release_rejects_unknown_and_bookkeeping_regions() {
    let sim = SimMachine::new(RAM);
    let mut vmm = Vmm::bootstrap(&sim, MemoryLayout::default()).expect("bootstrap");
    let mut pool = vmm.new_vm_pool(BASE, 8 * PAGE_SIZE).expect("pool");
    let a = pool.allocate(2 * PAGE_SIZE).expect("region");

    assert_eq!(
        vmm.release(&mut pool, BASE),
        Err(VmPoolError::BookkeepingRegion(BASE))
    );
    assert_eq!(
        vmm.release(&mut pool, a + PAGE_SIZE),
        Err(VmPoolError::RegionNotFound(a + PAGE_SIZE))
    );
    assert_eq!(pool.remaining_capacity(), 5 * PAGE_SIZE);
    assert_eq!(pool.regions().len(), 2);
}

#[test]
fn legitimacy_boundary() {
    let sim = SimMachine::new(RAM);
    let mut vmm = Vmm::bootstrap(&sim, MemoryLayout::default()).expect("bootstrap");
    let capacity = 64 * PAGE_SIZE;
    let pool = vmm.new_vm_pool(BASE, capacity).expect("pool");

    assert!(!pool.is_legitimate(VirtualAddress::new(BASE.as_u32() - 1)));
    assert!(pool.is_legitimate(BASE));
    assert!(pool.is_legitimate(BASE + (capacity - 1)));
    assert!(!pool.is_legitimate(BASE + capacity));

    // the fault handler applies the same boundary
    assert!(vmm.page_fault(BASE + (capacity - 1), PageFaultError::new()).is_ok());
    assert_eq!(
        vmm.page_fault(BASE + capacity, PageFaultError::new()),
        Err(FaultError::InvalidAddress(BASE + capacity))
    );
}

#[test]
fn windows_must_avoid_shared_range_and_recursive_slot() {
    let sim = SimMachine::new(RAM);
    let mut vmm = Vmm::bootstrap(&sim, MemoryLayout::default()).expect("bootstrap");

    for (base, capacity) in [
        (VirtualAddress::new(0x0030_0000), 0x20_0000),
        (directory_window(), PAGE_SIZE),
        (VirtualAddress::new(0xFF80_0000), 0x80_0000),
        (VirtualAddress::new(0x4000_0100), PAGE_SIZE),
        (BASE, PAGE_SIZE + 1),
        (BASE, 0),
    ] {
        assert_eq!(
            vmm.new_vm_pool(base, capacity).map(|p| p.base_address()),
            Err(VmPoolError::InvalidWindow { base, capacity })
        );
    }
    assert!(vmm.context().registry().is_empty());

    let top = vmm
        .new_vm_pool(VirtualAddress::new(0xFF80_0000), 0x40_0000)
        .expect("window just below the recursive slot");
    assert_eq!(top.id().index(), 0);
}
