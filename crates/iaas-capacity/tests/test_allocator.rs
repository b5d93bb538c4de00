use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use iaas_capacity::core::allocator::LastHostRelease;
use iaas_capacity::core::common::{AllocationVerdict, CapacityType, EntityId, RecordKey};
use iaas_capacity::core::config::capacity_config::CapacityConfig;
use iaas_capacity::core::directory::{Host, InMemoryDirectory};
use iaas_capacity::core::error::{CapacityError, StoreError};
use iaas_capacity::core::ledger::PlacementState;
use iaas_capacity::core::store::{CapacityDelta, CapacityRecord, CapacityStore, InMemoryCapacityStore};
use iaas_capacity::core::workload::{ServiceOffering, VirtualMachine, Volume};
use iaas_capacity::manager::CapacityManager;

const GB: u64 = 1 << 30;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn create_manager(store: Arc<dyn CapacityStore>) -> CapacityManager {
    init_logger();
    let directory = Arc::new(InMemoryDirectory::new());
    directory.add_host(Host::new(1, "h1", 1, 1, 8, 1000, 16 * GB));
    directory.add_host(Host::new(2, "h2", 1, 1, 8, 1000, 16 * GB));
    let manager = CapacityManager::new(CapacityConfig::new(), directory, store).unwrap();
    manager.register_host(1).unwrap();
    manager.register_host(2).unwrap();
    manager
}

fn record(manager: &CapacityManager, host_id: u32, capacity_type: CapacityType) -> CapacityRecord {
    manager
        .record(EntityId::Host(host_id), capacity_type)
        .unwrap()
        .unwrap()
}

fn vm(id: u32, cpu_num: u32, ram_size: u64) -> VirtualMachine {
    VirtualMachine::new(id, ServiceOffering::new(cpu_num, 1000, ram_size))
}

#[test]
// Reserve, start and release return the host to its initial state.
fn test_allocate_release_round_trip() {
    let manager = create_manager(Arc::new(InMemoryCapacityStore::new()));
    let initial = (record(&manager, 1, CapacityType::Cpu), record(&manager, 1, CapacityType::Memory));
    let vm = vm(1, 2, 1024).on_host(1);

    let outcome = manager.allocate_vm(&vm, false).unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.verdict, AllocationVerdict::Success);
    assert_eq!(outcome.changes.len(), 2);
    assert_eq!(outcome.changes[0].before.reserved, 0);
    assert_eq!(outcome.changes[0].after.reserved, 2000);
    assert_eq!(record(&manager, 1, CapacityType::Memory).reserved, GB);

    assert!(manager.commit_started(1, 1).unwrap());
    let cpu = record(&manager, 1, CapacityType::Cpu);
    assert_eq!((cpu.used, cpu.reserved), (2000, 0));
    assert_eq!(
        manager.ledger().placement(EntityId::Host(1), 1).unwrap().state,
        PlacementState::Used
    );

    assert!(manager.release_vm(&vm, false, false, 1).unwrap());
    assert_eq!(
        (record(&manager, 1, CapacityType::Cpu), record(&manager, 1, CapacityType::Memory)),
        initial
    );
}

#[test]
// Releasing twice, or releasing capacity that was never allocated, is a no-op.
fn test_release_idempotent() {
    let manager = create_manager(Arc::new(InMemoryCapacityStore::new()));
    let first = vm(1, 2, 1024).on_host(1);
    let second = vm(2, 3, 1024).on_host(1);
    manager.allocate_vm(&first, false).unwrap();
    manager.allocate_vm(&second, false).unwrap();

    assert!(manager.release_vm(&first, true, false, 1).unwrap());
    assert_eq!(record(&manager, 1, CapacityType::Cpu).reserved, 3000);
    assert!(!manager.release_vm(&first, true, false, 1).unwrap());
    assert_eq!(record(&manager, 1, CapacityType::Cpu).reserved, 3000);

    assert!(!manager.release_vm(&vm(3, 1, 512), false, false, 1).unwrap());
    assert!(!manager.release_vm(&second, true, false, 2).unwrap());
    assert!(!manager.release_vm(&second, true, false, 42).unwrap());
    assert_eq!(record(&manager, 1, CapacityType::Cpu).reserved, 3000);
}

#[test]
// Capacity is released from wherever it sits, even if the caller expects it elsewhere.
fn test_release_from_actual_state() {
    let manager = create_manager(Arc::new(InMemoryCapacityStore::new()));
    let vm = vm(1, 2, 1024).on_host(1);
    manager.allocate_vm(&vm, false).unwrap();
    manager.commit_started(1, 1).unwrap();

    assert!(manager.release_vm(&vm, true, false, 1).unwrap());
    let cpu = record(&manager, 1, CapacityType::Cpu);
    assert_eq!((cpu.used, cpu.reserved), (0, 0));
}

#[test]
// A stopped VM may keep its capacity reserved on the host and reuse it when restarted there.
fn test_stop_and_restart_on_same_host() {
    let manager = create_manager(Arc::new(InMemoryCapacityStore::new()));
    let running = vm(1, 2, 1024).on_host(1);
    manager.allocate_vm(&running, false).unwrap();
    manager.commit_started(1, 1).unwrap();

    assert!(manager.release_vm(&running, false, true, 1).unwrap());
    let cpu = record(&manager, 1, CapacityType::Cpu);
    assert_eq!((cpu.used, cpu.reserved), (0, 2000));
    assert!(manager.check_host_reserved_capacity(1, 2000, GB));

    let restarted = vm(1, 2, 1024).on_host(1).with_last_host(1);
    let outcome = manager.allocate_vm(&restarted, true).unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.verdict, AllocationVerdict::AlreadyAllocated);
    assert_eq!(record(&manager, 1, CapacityType::Cpu).reserved, 2000);

    assert!(manager.commit_started(1, 1).unwrap());
    let cpu = record(&manager, 1, CapacityType::Cpu);
    assert_eq!((cpu.used, cpu.reserved), (2000, 0));
}

#[test]
// Starting on another host moves the reservation: it is taken on the new host and dropped on the last one.
fn test_allocate_from_last_host() {
    let manager = create_manager(Arc::new(InMemoryCapacityStore::new()));
    let stopped = vm(1, 2, 1024).on_host(1);
    manager.allocate_vm(&stopped, false).unwrap();

    let moved = vm(1, 2, 1024).on_host(2).with_last_host(1);
    let outcome = manager.allocate_vm(&moved, true).unwrap();
    assert_eq!(outcome.verdict, AllocationVerdict::Success);
    assert_eq!(outcome.last_host_release, Some(LastHostRelease::Released { host_id: 1 }));
    // records of both hosts are reported, new host first
    assert_eq!(outcome.changes.len(), 4);
    assert_eq!(outcome.changes[0].after.entity, EntityId::Host(2));
    assert_eq!(outcome.changes[2].before.entity, EntityId::Host(1));
    assert_eq!(outcome.changes[2].before.reserved, 2000);
    assert_eq!(outcome.changes[2].after.reserved, 0);
    assert_eq!(record(&manager, 1, CapacityType::Cpu).reserved, 0);
    assert_eq!(record(&manager, 1, CapacityType::Memory).reserved, 0);
    assert_eq!(record(&manager, 2, CapacityType::Cpu).reserved, 2000);
    assert!(manager.ledger().placement(EntityId::Host(1), 1).is_none());

    // without the flag the last host keeps its reservation
    let other = vm(2, 1, 1024).on_host(1);
    manager.allocate_vm(&other, false).unwrap();
    manager
        .allocate_vm(&vm(2, 1, 1024).on_host(2).with_last_host(1), false)
        .unwrap();
    assert_eq!(record(&manager, 1, CapacityType::Cpu).reserved, 1000);
    assert_eq!(record(&manager, 2, CapacityType::Cpu).reserved, 3000);

    // a last host holding nothing for the VM is reported as such
    let outcome = manager
        .allocate_vm(&vm(3, 1, 1024).on_host(2).with_last_host(1), true)
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.last_host_release, Some(LastHostRelease::NothingHeld { host_id: 1 }));
    assert_eq!(outcome.changes.len(), 2);
}

#[test]
// A failed reservation on the new host leaves the reservation on the last host in place.
fn test_allocate_from_last_host_rejected() {
    let manager = create_manager(Arc::new(InMemoryCapacityStore::new()));
    manager.allocate_vm(&vm(1, 8, 1024).on_host(2), false).unwrap();
    manager.allocate_vm(&vm(2, 2, 1024).on_host(1), false).unwrap();

    let outcome = manager
        .allocate_vm(&vm(2, 2, 1024).on_host(2).with_last_host(1), true)
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.verdict, AllocationVerdict::NotEnoughCPU);
    assert_eq!(outcome.last_host_release, None);
    assert_eq!(record(&manager, 1, CapacityType::Cpu).reserved, 2000);
    assert_eq!(record(&manager, 2, CapacityType::Cpu).reserved, 8000);
}

#[test]
// Rejected allocations report the reason and leave records untouched.
fn test_allocate_rejected() {
    let manager = create_manager(Arc::new(InMemoryCapacityStore::new()));
    manager.allocate_vm(&vm(1, 6, 1024).on_host(1), false).unwrap();

    let outcome = manager.allocate_vm(&vm(2, 3, 1024).on_host(1), false).unwrap();
    assert_eq!(outcome.verdict, AllocationVerdict::NotEnoughCPU);
    assert!(outcome.changes.iter().all(|change| change.before == change.after));
    assert_eq!(record(&manager, 1, CapacityType::Cpu).reserved, 6000);

    let outcome = manager.allocate_vm(&vm(3, 1, 16 * 1024).on_host(1), false).unwrap();
    assert_eq!(outcome.verdict, AllocationVerdict::NotEnoughMemory);
    assert_eq!(record(&manager, 1, CapacityType::Memory).reserved, GB);

    let outcome = manager.allocate_vm(&vm(4, 1, 1024).on_host(42), false).unwrap();
    assert_eq!(outcome.verdict, AllocationVerdict::HostNotFound);
    assert!(matches!(
        manager.allocate_vm(&vm(5, 1, 1024), false),
        Err(CapacityError::InvalidInput(_))
    ));
    // volumes without a pool are refused by every mutation
    let unplaced = Volume::new(6, GB, 0);
    assert!(matches!(manager.allocate_volume(&unplaced), Err(CapacityError::InvalidInput(_))));
    assert!(matches!(manager.resize_volume(&unplaced, 2 * GB), Err(CapacityError::InvalidInput(_))));
    assert!(matches!(manager.release_volume(&unplaced), Err(CapacityError::InvalidInput(_))));
}

#[test]
// Repeated allocation of the same VM is detected and doesn't reserve twice.
fn test_allocate_twice() {
    let manager = create_manager(Arc::new(InMemoryCapacityStore::new()));
    let vm = vm(1, 2, 1024).on_host(1);
    manager.allocate_vm(&vm, false).unwrap();

    let outcome = manager.allocate_vm(&vm, false).unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.verdict, AllocationVerdict::AlreadyAllocated);
    assert_eq!(record(&manager, 1, CapacityType::Cpu).reserved, 2000);
    assert!(!manager.commit_started(7, 1).unwrap());
}

#[test]
// 20 threads race for a host that fits 8 of their VMs: exactly 8 win and the host is never overcommitted.
fn test_concurrent_allocations() {
    let manager = Arc::new(create_manager(Arc::new(InMemoryCapacityStore::new())));

    let mut handles = Vec::new();
    for id in 0..20 {
        let manager = manager.clone();
        handles.push(thread::spawn(move || {
            let outcome = manager.allocate_vm(&vm(id, 1, 1024).on_host(1), false).unwrap();
            if outcome.success {
                assert!(manager.commit_started(id, 1).unwrap());
            }
            outcome.success
        }));
    }
    let successes = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|success| *success)
        .count();

    assert_eq!(successes, 8);
    let cpu = record(&manager, 1, CapacityType::Cpu);
    assert_eq!(cpu.allocated(), 8000);
    assert_eq!(cpu.used, 8000);
    assert_eq!(record(&manager, 1, CapacityType::Memory).used, 8 * GB);
}

#[test]
// Concurrent allocate and release on the same host keep the records consistent with the placements.
fn test_concurrent_allocate_release() {
    let manager = Arc::new(create_manager(Arc::new(InMemoryCapacityStore::new())));

    let mut handles = Vec::new();
    for id in 0..8 {
        let manager = manager.clone();
        handles.push(thread::spawn(move || {
            let vm = vm(id, 1, 256).on_host(1);
            for _ in 0..50 {
                assert!(manager.allocate_vm(&vm, false).unwrap().success);
                assert!(manager.commit_started(id, 1).unwrap());
                assert!(manager.release_vm(&vm, false, false, 1).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let cpu = record(&manager, 1, CapacityType::Cpu);
    assert_eq!((cpu.used, cpu.reserved), (0, 0));
    assert_eq!(record(&manager, 1, CapacityType::Memory).allocated(), 0);
}

/// Store failing updates of memory records while `failing` is set, only those of `host_id` if one is given.
struct FlakyStore {
    inner: InMemoryCapacityStore,
    failing: AtomicBool,
    host_id: Option<u32>,
}

impl FlakyStore {
    fn new(host_id: Option<u32>) -> Self {
        Self {
            inner: InMemoryCapacityStore::new(),
            failing: AtomicBool::new(false),
            host_id,
        }
    }

    fn fails_on(&self, key: &RecordKey) -> bool {
        self.failing.load(Ordering::SeqCst)
            && key.capacity_type == CapacityType::Memory
            && self.host_id.map_or(true, |host_id| key.entity == EntityId::Host(host_id))
    }
}

impl CapacityStore for FlakyStore {
    fn get(&self, key: &RecordKey) -> Result<Option<CapacityRecord>, StoreError> {
        self.inner.get(key)
    }

    fn insert(&self, record: CapacityRecord) -> Result<(), StoreError> {
        self.inner.insert(record)
    }

    fn upsert_delta(&self, key: &RecordKey, delta: &CapacityDelta) -> Result<Option<CapacityRecord>, StoreError> {
        if self.fails_on(key) {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.upsert_delta(key, delta)
    }

    fn remove(&self, key: &RecordKey) -> Result<Option<CapacityRecord>, StoreError> {
        self.inner.remove(key)
    }
}

#[test]
// CPU is reserved before memory. When the memory update fails, the CPU update is reverted.
fn test_store_failure_compensated() {
    let store = Arc::new(FlakyStore::new(None));
    let manager = create_manager(store.clone());
    let vm = vm(1, 2, 1024).on_host(1);

    store.failing.store(true, Ordering::SeqCst);
    let result = manager.allocate_vm(&vm, false);
    assert!(matches!(result, Err(CapacityError::Store(StoreError::Unavailable(_)))));
    assert_eq!(record(&manager, 1, CapacityType::Cpu).reserved, 0);
    assert_eq!(record(&manager, 1, CapacityType::Memory).reserved, 0);
    assert!(manager.ledger().placement(EntityId::Host(1), 1).is_none());

    store.failing.store(false, Ordering::SeqCst);
    assert!(manager.allocate_vm(&vm, false).unwrap().success);

    store.failing.store(true, Ordering::SeqCst);
    assert!(manager.release_vm(&vm, true, false, 1).is_err());
    assert_eq!(record(&manager, 1, CapacityType::Cpu).reserved, 2000);
    assert!(manager.ledger().placement(EntityId::Host(1), 1).is_some());

    store.failing.store(false, Ordering::SeqCst);
    assert!(manager.release_vm(&vm, true, false, 1).unwrap());
    assert_eq!(record(&manager, 1, CapacityType::Cpu).reserved, 0);
}

#[test]
// The VM moves to host 2 but the store fails while its reservation on host 1 is released: the move still succeeds,
// the failure is reported and host 1 keeps counting the VM until it is released again.
fn test_last_host_release_failure_reported() {
    let store = Arc::new(FlakyStore::new(Some(1)));
    let manager = create_manager(store.clone());
    manager.allocate_vm(&vm(1, 2, 1024).on_host(1), false).unwrap();

    store.failing.store(true, Ordering::SeqCst);
    let moved = vm(1, 2, 1024).on_host(2).with_last_host(1);
    let outcome = manager.allocate_vm(&moved, true).unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.verdict, AllocationVerdict::Success);
    assert!(matches!(
        outcome.last_host_release,
        Some(LastHostRelease::Failed { host_id: 1, .. })
    ));
    assert!(outcome
        .changes
        .iter()
        .all(|change| change.after.entity == EntityId::Host(2)));
    assert_eq!(record(&manager, 2, CapacityType::Cpu).reserved, 2000);
    assert_eq!(record(&manager, 1, CapacityType::Cpu).reserved, 2000);
    assert_eq!(record(&manager, 1, CapacityType::Memory).reserved, GB);
    assert!(manager.ledger().placement(EntityId::Host(1), 1).is_some());

    store.failing.store(false, Ordering::SeqCst);
    assert!(manager.release_vm(&moved, true, false, 1).unwrap());
    assert_eq!(record(&manager, 1, CapacityType::Cpu).reserved, 0);
    assert_eq!(record(&manager, 2, CapacityType::Cpu).reserved, 2000);
}

#[test]
// Decommissioned hosts drop their records and reject further allocations.
fn test_decommission() {
    let manager = create_manager(Arc::new(InMemoryCapacityStore::new()));
    let vm = vm(1, 2, 1024).on_host(1);
    manager.allocate_vm(&vm, false).unwrap();

    let removed = manager.decommission_host(1).unwrap();
    assert_eq!(removed.len(), 2);
    assert!(manager.record(EntityId::Host(1), CapacityType::Cpu).unwrap().is_none());
    assert_eq!(
        manager.allocate_vm(&vm, false).unwrap().verdict,
        AllocationVerdict::HostNotFound
    );
    assert!(!manager.release_vm(&vm, true, false, 1).unwrap());
    assert!(!manager.check_host_capacity(1, 0, 0, true, None, None));
}
