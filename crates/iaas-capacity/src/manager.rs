use std::sync::Arc;

use log::info;
use sugars::arc;

use crate::core::admission::AdmissionChecker;
use crate::core::allocator::{AllocationOutcome, CapacityAllocator};
use crate::core::common::{CapacityType, EntityId, ResourceScope};
use crate::core::config::capacity_config::CapacityConfig;
use crate::core::config::keys::{ConfigKey, ConfigValue};
use crate::core::config::resolver::ConfigResolver;
use crate::core::directory::ResourceDirectory;
use crate::core::error::{CapacityError, CapacityResult};
use crate::core::ledger::CapacityLedger;
use crate::core::reconciler::{host_totals, pool_totals, RecalculationSummary, Reconciler};
use crate::core::store::{CapacityRecord, CapacityStore};
use crate::core::workload::{ServiceOffering, Template, VirtualMachine, Volume};

/// Entry point wiring configuration, ledger, checks, allocation and reconciliation together.
///
/// All methods take `&self`, the manager can be shared between threads behind an `Arc`.
pub struct CapacityManager {
    resolver: Arc<ConfigResolver>,
    ledger: Arc<CapacityLedger>,
    directory: Arc<dyn ResourceDirectory>,
    checker: AdmissionChecker,
    allocator: CapacityAllocator,
    reconciler: Reconciler,
}

impl CapacityManager {
    pub fn new(
        config: CapacityConfig,
        directory: Arc<dyn ResourceDirectory>,
        store: Arc<dyn CapacityStore>,
    ) -> CapacityResult<Self> {
        let resolver = arc!(ConfigResolver::new(config)?);
        let ledger = arc!(CapacityLedger::new(store));
        Ok(Self {
            checker: AdmissionChecker::new(resolver.clone(), ledger.clone(), directory.clone()),
            allocator: CapacityAllocator::new(resolver.clone(), ledger.clone(), directory.clone()),
            reconciler: Reconciler::new(resolver.clone(), ledger.clone(), directory.clone()),
            resolver,
            ledger,
            directory,
        })
    }

    /// Creates manager with configuration read from YAML file.
    pub fn from_file(
        file_name: &str,
        directory: Arc<dyn ResourceDirectory>,
        store: Arc<dyn CapacityStore>,
    ) -> CapacityResult<Self> {
        Self::new(CapacityConfig::from_file(file_name)?, directory, store)
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    pub fn ledger(&self) -> &CapacityLedger {
        &self.ledger
    }

    pub fn checker(&self) -> &AdmissionChecker {
        &self.checker
    }

    pub fn allocator(&self) -> &CapacityAllocator {
        &self.allocator
    }

    /// Creates capacity records for a host known to the directory.
    pub fn register_host(&self, host_id: u32) -> CapacityResult<()> {
        let host = self
            .directory
            .get_host(host_id)
            .ok_or_else(|| CapacityError::InvalidInput(format!("host #{} is not in the directory", host_id)))?;
        self.ledger.register(EntityId::Host(host_id), &host_totals(&host))?;
        info!(
            "registered host #{} ({}) with {} MHz and {} bytes",
            host_id,
            host.name,
            host.total_cpu(),
            host.memory
        );
        Ok(())
    }

    /// Creates capacity records for a storage pool known to the directory.
    pub fn register_pool(&self, pool_id: u32) -> CapacityResult<()> {
        let pool = self
            .directory
            .get_pool(pool_id)
            .ok_or_else(|| CapacityError::InvalidInput(format!("pool #{} is not in the directory", pool_id)))?;
        self.ledger.register(EntityId::Pool(pool_id), &pool_totals(&pool))?;
        info!("registered pool #{} with {} bytes", pool_id, pool.capacity_bytes);
        Ok(())
    }

    /// Removes the host's capacity records. Returns the removed records.
    pub fn decommission_host(&self, host_id: u32) -> CapacityResult<Vec<CapacityRecord>> {
        let removed = self.ledger.decommission(EntityId::Host(host_id))?;
        info!("decommissioned host #{}", host_id);
        Ok(removed)
    }

    /// Removes the pool's capacity records. Returns the removed records.
    pub fn decommission_pool(&self, pool_id: u32) -> CapacityResult<Vec<CapacityRecord>> {
        let removed = self.ledger.decommission(EntityId::Pool(pool_id))?;
        info!("decommissioned pool #{}", pool_id);
        Ok(removed)
    }

    /// Reads the current record, `None` if the entity has no such record.
    pub fn record(&self, entity: EntityId, capacity_type: CapacityType) -> CapacityResult<Option<CapacityRecord>> {
        self.ledger.record(entity, capacity_type)
    }

    pub fn reload_config(&self, config: CapacityConfig) -> CapacityResult<()> {
        self.resolver.reload(config)
    }

    pub fn set_override(
        &self,
        scope: ResourceScope,
        id: u32,
        key: ConfigKey,
        value: ConfigValue,
    ) -> CapacityResult<()> {
        self.resolver.set_override(scope, id, key, value)
    }

    /// Applies overrides such as `cluster:3[cpu.overprovisioning.factor=2.0]`.
    pub fn apply_options(&self, config_str: &str) -> CapacityResult<()> {
        self.resolver.apply_options(config_str)
    }

    pub fn cluster_overprovisioning_factor(&self, cluster_id: u32, capacity_type: CapacityType) -> f64 {
        self.checker.cluster_overprovisioning_factor(cluster_id, capacity_type)
    }

    pub fn check_host_capacity(
        &self,
        host_id: u32,
        cpu_requested: u64,
        ram_requested: u64,
        consider_reserved: bool,
        cpu_factor: Option<f64>,
        mem_factor: Option<f64>,
    ) -> bool {
        self.checker.check_host_capacity(
            host_id,
            cpu_requested,
            ram_requested,
            consider_reserved,
            cpu_factor,
            mem_factor,
        )
    }

    pub fn check_host_reserved_capacity(&self, host_id: u32, cpu_requested: u64, ram_requested: u64) -> bool {
        self.checker
            .check_host_reserved_capacity(host_id, cpu_requested, ram_requested)
    }

    pub fn check_cluster_threshold(&self, cluster_id: u32, cpu_requested: u64, ram_requested: u64) -> bool {
        self.checker
            .check_cluster_threshold(cluster_id, cpu_requested, ram_requested)
    }

    pub fn check_guest_limit(&self, host_id: u32) -> bool {
        self.checker.check_guest_limit(host_id)
    }

    pub fn check_cpu_capability(&self, host_id: u32, cpu_num: u32, cpu_speed: u32) -> bool {
        self.checker.check_cpu_capability(host_id, cpu_num, cpu_speed)
    }

    pub fn check_cpu_capability_and_capacity(
        &self,
        host_id: u32,
        offering: &ServiceOffering,
        consider_reserved: bool,
    ) -> (bool, bool) {
        self.checker
            .check_cpu_capability_and_capacity(host_id, offering, consider_reserved)
    }

    pub fn is_cluster_excluded_from_storage(&self, cluster_id: u32) -> bool {
        self.checker.is_cluster_excluded_from_storage(cluster_id)
    }

    pub fn allocated_pool_capacity(&self, pool_id: u32, template_for_vm_creation: Option<&Template>) -> Option<u64> {
        self.checker
            .allocated_pool_capacity(pool_id, template_for_vm_creation)
    }

    pub fn used_bytes(&self, pool_id: u32) -> u64 {
        self.checker.used_bytes(pool_id)
    }

    pub fn used_iops(&self, pool_id: u32) -> u64 {
        self.checker.used_iops(pool_id)
    }

    pub fn pool_has_space(&self, pool_id: u32, requested_bytes: u64) -> bool {
        self.checker.pool_has_space(pool_id, requested_bytes)
    }

    pub fn pool_has_allocated_space(&self, pool_id: u32, requested_bytes: u64, for_resize: bool) -> bool {
        self.checker
            .pool_has_allocated_space(pool_id, requested_bytes, for_resize)
    }

    pub fn pool_has_iops(&self, pool_id: u32, requested_iops: u64) -> bool {
        self.checker.pool_has_iops(pool_id, requested_iops)
    }

    pub fn image_store_has_space(&self, store_id: u32) -> bool {
        self.checker.image_store_has_space(store_id)
    }

    pub fn allocate_vm(&self, vm: &VirtualMachine, from_last_host: bool) -> CapacityResult<AllocationOutcome> {
        self.allocator.allocate(vm, from_last_host)
    }

    pub fn commit_started(&self, vm_id: u32, host_id: u32) -> CapacityResult<bool> {
        self.allocator.commit_started(vm_id, host_id)
    }

    pub fn release_vm(
        &self,
        vm: &VirtualMachine,
        move_from_reserved: bool,
        move_to_reserved: bool,
        host_id: u32,
    ) -> CapacityResult<bool> {
        self.allocator
            .release(vm, move_from_reserved, move_to_reserved, host_id)
    }

    pub fn allocate_volume(&self, volume: &Volume) -> CapacityResult<AllocationOutcome> {
        self.allocator.allocate_volume(volume)
    }

    pub fn resize_volume(&self, volume: &Volume, new_size: u64) -> CapacityResult<AllocationOutcome> {
        self.allocator.resize_volume(volume, new_size)
    }

    pub fn release_volume(&self, volume: &Volume) -> CapacityResult<bool> {
        self.allocator.release_volume(volume)
    }

    pub fn record_pool_usage(&self, pool_id: u32, used_bytes: u64) -> CapacityResult<bool> {
        self.allocator.record_pool_usage(pool_id, used_bytes)
    }

    pub fn reconcile_host(&self, host_id: u32) -> CapacityResult<bool> {
        self.reconciler.reconcile_host(host_id)
    }

    pub fn reconcile_pool(&self, pool_id: u32) -> CapacityResult<bool> {
        self.reconciler.reconcile_pool(pool_id)
    }

    pub fn recalculate_all(&self) -> RecalculationSummary {
        self.reconciler.recalculate_all()
    }
}
