//! Read-only admission checks for hosts and clusters.

use std::sync::Arc;

use log::{debug, warn};

use crate::core::calculator::{effective_capacity, free_capacity, would_cross_threshold};
use crate::core::common::{CapacityType, EntityId, ScopeRef};
use crate::core::config::keys::ConfigKey;
use crate::core::config::resolver::ConfigResolver;
use crate::core::directory::{Host, ResourceDirectory};
use crate::core::ledger::CapacityLedger;
use crate::core::store::CapacityRecord;
use crate::core::workload::ServiceOffering;

/// Answers whether hosts, clusters and pools can accept a workload.
///
/// Every check is a snapshot: it reads the current records without taking entity locks and can become stale before
/// the caller allocates. The allocator re-checks headroom under the lock when it commits.
///
/// Unknown entities and unreadable records always produce the answer that blocks placement.
pub struct AdmissionChecker {
    pub(crate) resolver: Arc<ConfigResolver>,
    pub(crate) ledger: Arc<CapacityLedger>,
    pub(crate) directory: Arc<dyn ResourceDirectory>,
}

impl AdmissionChecker {
    pub fn new(
        resolver: Arc<ConfigResolver>,
        ledger: Arc<CapacityLedger>,
        directory: Arc<dyn ResourceDirectory>,
    ) -> Self {
        Self {
            resolver,
            ledger,
            directory,
        }
    }

    /// Reads the record, treating store failures as a missing record.
    pub(crate) fn read_record(&self, entity: EntityId, capacity_type: CapacityType) -> Option<CapacityRecord> {
        match self.ledger.record(entity, capacity_type) {
            Ok(record) => record,
            Err(e) => {
                warn!("can't read {} {} record: {}", entity, capacity_type, e);
                None
            }
        }
    }

    fn host_records(&self, host: &Host) -> Option<(CapacityRecord, CapacityRecord)> {
        let entity = EntityId::Host(host.id);
        let cpu = self.read_record(entity, CapacityType::Cpu)?;
        let memory = self.read_record(entity, CapacityType::Memory)?;
        Some((cpu, memory))
    }

    /// Returns the overprovisioning factor applied to hosts of the cluster.
    pub fn cluster_overprovisioning_factor(&self, cluster_id: u32, capacity_type: CapacityType) -> f64 {
        self.resolver
            .overprovisioning_factor(capacity_type, ScopeRef::Cluster(cluster_id))
    }

    /// Checks whether the host can fit the requested CPU (MHz) and memory (bytes).
    ///
    /// Effective capacity is the raw capacity scaled by the given factors, or by the factors resolved for the host's
    /// cluster when `None`. Reserved capacity counts as taken only if `consider_reserved` is set. Both dimensions
    /// must fit.
    pub fn check_host_capacity(
        &self,
        host_id: u32,
        cpu_requested: u64,
        ram_requested: u64,
        consider_reserved: bool,
        cpu_factor: Option<f64>,
        mem_factor: Option<f64>,
    ) -> bool {
        let host = match self.directory.get_host(host_id) {
            Some(host) => host,
            None => {
                debug!("host #{} not found, rejecting", host_id);
                return false;
            }
        };
        let (cpu, memory) = match self.host_records(&host) {
            Some(records) => records,
            None => {
                debug!("host #{} has no capacity records, rejecting", host_id);
                return false;
            }
        };
        let cpu_factor =
            cpu_factor.unwrap_or_else(|| self.cluster_overprovisioning_factor(host.cluster_id, CapacityType::Cpu));
        let mem_factor =
            mem_factor.unwrap_or_else(|| self.cluster_overprovisioning_factor(host.cluster_id, CapacityType::Memory));

        let free_cpu = free_capacity(
            effective_capacity(cpu.total, cpu_factor),
            cpu.used,
            cpu.reserved,
            consider_reserved,
        );
        let free_memory = free_capacity(
            effective_capacity(memory.total, mem_factor),
            memory.used,
            memory.reserved,
            consider_reserved,
        );
        let has_capacity = cpu_requested <= free_cpu && ram_requested <= free_memory;
        debug!(
            "host #{}: requested cpu {} / free {}, requested ram {} / free {}, has capacity: {}",
            host_id, cpu_requested, free_cpu, ram_requested, free_memory, has_capacity
        );
        has_capacity
    }

    /// Checks whether the capacity reserved on the host alone covers the request.
    ///
    /// Used when a stopped VM is started again on the host that kept its reservation.
    pub fn check_host_reserved_capacity(&self, host_id: u32, cpu_requested: u64, ram_requested: u64) -> bool {
        let host = match self.directory.get_host(host_id) {
            Some(host) => host,
            None => return false,
        };
        match self.host_records(&host) {
            Some((cpu, memory)) => cpu.reserved >= cpu_requested && memory.reserved >= ram_requested,
            None => false,
        }
    }

    /// Checks whether placing the request in the cluster pushes its CPU or memory allocation above the cluster
    /// disable thresholds. Returns true if the cluster must be skipped.
    ///
    /// Totals are summed over the records of the cluster hosts that are currently up. A cluster without such hosts
    /// is reported as crossed.
    pub fn check_cluster_threshold(&self, cluster_id: u32, cpu_requested: u64, ram_requested: u64) -> bool {
        let members: Vec<Host> = self
            .directory
            .get_cluster_members(cluster_id)
            .into_iter()
            .filter(|host| host.is_up())
            .collect();
        if members.is_empty() {
            debug!("cluster #{} has no active hosts", cluster_id);
            return true;
        }
        let scope = ScopeRef::Cluster(cluster_id);
        let checks = [
            (
                CapacityType::Cpu,
                cpu_requested,
                ConfigKey::ClusterCpuCapacityDisableThreshold,
            ),
            (
                CapacityType::Memory,
                ram_requested,
                ConfigKey::ClusterMemoryCapacityDisableThreshold,
            ),
        ];
        for (capacity_type, requested, threshold_key) in checks {
            let factor = self.resolver.overprovisioning_factor(capacity_type, scope);
            let threshold = self.resolver.number(threshold_key, scope);
            let mut allocated: u64 = 0;
            let mut effective_total: u64 = 0;
            for host in &members {
                match self.ledger.record(EntityId::Host(host.id), capacity_type) {
                    Ok(Some(record)) => {
                        allocated = allocated.saturating_add(record.allocated());
                        effective_total = effective_total.saturating_add(effective_capacity(record.total, factor));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("can't read {} record of host #{}: {}", capacity_type, host.id, e);
                        return true;
                    }
                }
            }
            if would_cross_threshold(allocated, requested, effective_total, threshold) {
                debug!(
                    "cluster #{} crosses {} threshold {}: allocated {} + requested {} of {}",
                    cluster_id, capacity_type, threshold, allocated, requested, effective_total
                );
                return true;
            }
        }
        false
    }

    /// Checks whether the host already runs as many guests as its hypervisor allows.
    pub fn check_guest_limit(&self, host_id: u32) -> bool {
        let host = match self.directory.get_host(host_id) {
            Some(host) => host,
            None => return true,
        };
        let limit = self.resolver.guest_limit(host.hypervisor);
        let running = self.directory.running_guest_count(host_id);
        if running >= limit {
            debug!(
                "host #{} reached {} guest limit: {} of {}",
                host_id, host.hypervisor, running, limit
            );
            return true;
        }
        false
    }

    /// Checks that the host has enough cores and that each core is fast enough.
    pub fn check_cpu_capability(&self, host_id: u32, cpu_num: u32, cpu_speed: u32) -> bool {
        match self.directory.get_host(host_id) {
            Some(host) => {
                let capable = host.cpu_cores >= cpu_num && host.cpu_speed >= cpu_speed;
                if !capable {
                    debug!(
                        "host #{} with {} cores at {} MHz can't run {} vCPUs at {} MHz",
                        host_id, host.cpu_cores, host.cpu_speed, cpu_num, cpu_speed
                    );
                }
                capable
            }
            None => false,
        }
    }

    /// Returns CPU capability and capacity verdicts for the offering separately.
    pub fn check_cpu_capability_and_capacity(
        &self,
        host_id: u32,
        offering: &ServiceOffering,
        consider_reserved: bool,
    ) -> (bool, bool) {
        let capability = self.check_cpu_capability(host_id, offering.cpu_num, offering.cpu_speed);
        let capacity = self.check_host_capacity(
            host_id,
            offering.cpu_requested(),
            offering.ram_requested(),
            consider_reserved,
            None,
            None,
        );
        (capability, capacity)
    }
}
