use std::sync::Arc;

use iaas_capacity::core::common::{CapacityType, EntityId};
use iaas_capacity::core::config::capacity_config::CapacityConfig;
use iaas_capacity::core::directory::{Host, InMemoryDirectory, StoragePool};
use iaas_capacity::core::ledger::PlacementState;
use iaas_capacity::core::store::{CapacityRecord, InMemoryCapacityStore};
use iaas_capacity::core::workload::{ServiceOffering, VirtualMachine, VmStatus, Volume};
use iaas_capacity::manager::CapacityManager;

const GB: u64 = 1 << 30;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn create_manager() -> (Arc<InMemoryDirectory>, CapacityManager) {
    init_logger();
    let mut config = CapacityConfig::new();
    config.global.capacity_calculate_workers = Some(3);

    let directory = Arc::new(InMemoryDirectory::new());
    directory.add_host(Host::new(1, "h1", 1, 1, 8, 1000, 16 * GB));
    directory.add_host(Host::new(2, "h2", 1, 1, 8, 1000, 16 * GB));
    directory.add_pool(StoragePool::new(10, 1, 1000 * GB).with_iops(5000));
    let manager = CapacityManager::new(config, directory.clone(), Arc::new(InMemoryCapacityStore::new())).unwrap();
    manager.register_host(1).unwrap();
    manager.register_host(2).unwrap();
    manager.register_pool(10).unwrap();
    (directory, manager)
}

fn vm(id: u32, cpu_num: u32, status: VmStatus) -> VirtualMachine {
    VirtualMachine::new(id, ServiceOffering::new(cpu_num, 1000, 1024)).with_status(status)
}

fn record(manager: &CapacityManager, entity: EntityId, capacity_type: CapacityType) -> CapacityRecord {
    manager.record(entity, capacity_type).unwrap().unwrap()
}

fn populate_hosts(directory: &InMemoryDirectory) {
    directory.upsert_vm(vm(1, 2, VmStatus::Running).on_host(1));
    directory.upsert_vm(vm(2, 1, VmStatus::Starting).on_host(1));
    directory.upsert_vm(vm(3, 1, VmStatus::Stopped).with_last_host(1));
    directory.upsert_vm(vm(4, 4, VmStatus::Destroyed).on_host(1));
    directory.upsert_vm(vm(5, 3, VmStatus::Migrating).on_host(2));
}

#[test]
// Running VMs count as used, starting VMs and VMs stopped on the host as reserved, destroyed VMs not at all.
fn test_reconcile_host() {
    let (directory, manager) = create_manager();
    populate_hosts(&directory);

    assert!(manager.reconcile_host(1).unwrap());
    let cpu = record(&manager, EntityId::Host(1), CapacityType::Cpu);
    assert_eq!((cpu.total, cpu.used, cpu.reserved), (8000, 2000, 2000));
    let memory = record(&manager, EntityId::Host(1), CapacityType::Memory);
    assert_eq!((memory.used, memory.reserved), (GB, 2 * GB));

    let ledger = manager.ledger();
    assert_eq!(
        ledger.placement(EntityId::Host(1), 1).unwrap().state,
        PlacementState::Used
    );
    assert_eq!(
        ledger.placement(EntityId::Host(1), 3).unwrap().state,
        PlacementState::Reserved
    );
    assert!(ledger.placement(EntityId::Host(1), 4).is_none());

    // consistent records are left alone
    assert!(!manager.reconcile_host(1).unwrap());
    assert!(!manager.reconcile_host(42).unwrap());
}

#[test]
// Rebuilt placements let the allocator release capacity it never allocated itself.
fn test_release_after_reconcile() {
    let (directory, manager) = create_manager();
    populate_hosts(&directory);
    manager.reconcile_host(1).unwrap();

    let running = vm(1, 2, VmStatus::Running).on_host(1);
    assert!(manager.release_vm(&running, false, false, 1).unwrap());
    assert_eq!(record(&manager, EntityId::Host(1), CapacityType::Cpu).used, 0);
    assert!(!manager.release_vm(&running, false, false, 1).unwrap());
}

#[test]
// Capacity of a VM that disappeared without a release is recovered.
fn test_reconcile_lost_release() {
    let (directory, manager) = create_manager();
    let lost = vm(7, 4, VmStatus::Starting).on_host(2);
    directory.upsert_vm(lost.clone());
    assert!(manager.allocate_vm(&lost, false).unwrap().success);
    assert!(!manager.reconcile_host(2).unwrap());

    directory.remove_vm(7);
    assert!(manager.reconcile_host(2).unwrap());
    let cpu = record(&manager, EntityId::Host(2), CapacityType::Cpu);
    assert_eq!((cpu.used, cpu.reserved), (0, 0));
    assert!(manager.ledger().placement(EntityId::Host(2), 7).is_none());
}

#[test]
// Totals follow hardware changes reported by the directory; unregistered hosts get records.
fn test_reconcile_totals() {
    let (directory, manager) = create_manager();
    directory.add_host(Host::new(1, "h1", 1, 1, 16, 1000, 32 * GB));
    assert!(manager.reconcile_host(1).unwrap());
    assert_eq!(record(&manager, EntityId::Host(1), CapacityType::Cpu).total, 16000);
    assert_eq!(record(&manager, EntityId::Host(1), CapacityType::Memory).total, 32 * GB);

    directory.add_host(Host::new(3, "h3", 1, 1, 4, 2000, 8 * GB));
    directory.upsert_vm(vm(8, 1, VmStatus::Running).on_host(3));
    assert!(manager.reconcile_host(3).unwrap());
    let cpu = record(&manager, EntityId::Host(3), CapacityType::Cpu);
    assert_eq!((cpu.total, cpu.used), (8000, 1000));
}

#[test]
// Allocated storage and IOPS come from volumes, written bytes stay as reported by storage statistics.
fn test_reconcile_pool() {
    let (directory, manager) = create_manager();
    directory.upsert_volume(Volume::new(1, 100 * GB, 1000).on_pool(10));
    directory.upsert_volume(Volume::new(2, 50 * GB, 0).on_pool(10));
    directory.upsert_volume(Volume::new(3, 70 * GB, 0).on_pool(11));
    manager.record_pool_usage(10, 30 * GB).unwrap();

    assert!(manager.reconcile_pool(10).unwrap());
    assert_eq!(manager.allocated_pool_capacity(10, None), Some(150 * GB));
    assert_eq!(manager.used_iops(10), 1000);
    assert_eq!(manager.used_bytes(10), 30 * GB);
    assert!(!manager.reconcile_pool(10).unwrap());

    assert!(manager.release_volume(&Volume::new(2, 50 * GB, 0).on_pool(10)).unwrap());
    assert_eq!(manager.allocated_pool_capacity(10, None), Some(100 * GB));
}

#[test]
// Full sweep reconciles every host and pool and reports what it corrected.
fn test_recalculate_all() {
    let (directory, manager) = create_manager();
    populate_hosts(&directory);
    directory.upsert_volume(Volume::new(1, 100 * GB, 0).on_pool(10));

    let summary = manager.recalculate_all();
    assert_eq!(summary.hosts_checked, 2);
    assert_eq!(summary.hosts_corrected, 2);
    assert_eq!(summary.pools_checked, 1);
    assert_eq!(summary.pools_corrected, 1);
    assert!(summary.failures.is_empty());
    assert_eq!(record(&manager, EntityId::Host(2), CapacityType::Cpu).used, 3000);
    assert_eq!(manager.allocated_pool_capacity(10, None), Some(100 * GB));

    let summary = manager.recalculate_all();
    assert_eq!(summary.hosts_corrected, 0);
    assert_eq!(summary.pools_corrected, 0);
}
