//! Recomputation of capacity records from actual workload placement.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use threadpool::ThreadPool;

use crate::core::common::{CapacityType, EntityId};
use crate::core::config::resolver::ConfigResolver;
use crate::core::directory::{Host, ResourceDirectory, StoragePool};
use crate::core::error::CapacityResult;
use crate::core::ledger::{CapacityLedger, Placement, PlacementState};
use crate::core::store::{CapacityDelta, CapacityRecord};
use crate::core::workload::{VirtualMachine, VmStatus};

/// Raw capacity totals of a host.
pub fn host_totals(host: &Host) -> Vec<(CapacityType, u64)> {
    vec![(CapacityType::Cpu, host.total_cpu()), (CapacityType::Memory, host.memory)]
}

/// Raw capacity totals of a storage pool. Pools without IOPS accounting get a zero IOPS total.
pub fn pool_totals(pool: &StoragePool) -> Vec<(CapacityType, u64)> {
    vec![
        (CapacityType::StorageAllocated, pool.capacity_bytes),
        (CapacityType::StorageUsed, pool.capacity_bytes),
        (CapacityType::StorageIops, pool.capacity_iops.unwrap_or(0)),
    ]
}

/// Result of a full recalculation.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RecalculationSummary {
    pub hosts_checked: usize,
    pub hosts_corrected: usize,
    pub pools_checked: usize,
    pub pools_corrected: usize,
    pub failures: Vec<(EntityId, String)>,
}

/// Rebuilds records and placement tables from what the directory reports as placed.
///
/// Fixes drift left by crashes, lost releases or half-finished moves between hosts. Reconciling an entity that is
/// already consistent writes nothing.
#[derive(Clone)]
pub struct Reconciler {
    resolver: Arc<ConfigResolver>,
    ledger: Arc<CapacityLedger>,
    directory: Arc<dyn ResourceDirectory>,
}

impl Reconciler {
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

    // Starting VMs hold a reservation, stopped ones keep it on their last host.
    fn host_placement(host_id: u32, vm: &VirtualMachine) -> Option<Placement> {
        let state = match vm.status {
            VmStatus::Starting if vm.host_id == Some(host_id) => PlacementState::Reserved,
            VmStatus::Running | VmStatus::Migrating | VmStatus::Stopping if vm.host_id == Some(host_id) => {
                PlacementState::Used
            }
            VmStatus::Stopped if vm.host_id.is_none() && vm.last_host_id == Some(host_id) => PlacementState::Reserved,
            _ => return None,
        };
        Some(Placement::new(
            vm.id,
            state,
            &[
                (CapacityType::Cpu, vm.cpu_requested()),
                (CapacityType::Memory, vm.ram_requested()),
            ],
        ))
    }

    /// Recomputes CPU and memory records of the host. Returns true if anything had to be corrected.
    pub fn reconcile_host(&self, host_id: u32) -> CapacityResult<bool> {
        let host = match self.directory.get_host(host_id) {
            Some(host) => host,
            None => {
                debug!("host #{} not found, nothing to reconcile", host_id);
                return Ok(false);
            }
        };
        let totals = host_totals(&host);
        let placements: Vec<Placement> = self
            .directory
            .host_workloads(host_id)
            .iter()
            .filter_map(|vm| Self::host_placement(host_id, vm))
            .collect();
        self.reconcile(EntityId::Host(host_id), &totals, placements, &[])
    }

    /// Recomputes allocated storage and IOPS records of the pool. Returns true if anything had to be corrected.
    ///
    /// Written bytes are reported by storage statistics, so only the total of that record is reconciled.
    pub fn reconcile_pool(&self, pool_id: u32) -> CapacityResult<bool> {
        let pool = match self.directory.get_pool(pool_id) {
            Some(pool) => pool,
            None => {
                debug!("pool #{} not found, nothing to reconcile", pool_id);
                return Ok(false);
            }
        };
        let totals = pool_totals(&pool);
        let placements: Vec<Placement> = self
            .directory
            .pool_volumes(pool_id)
            .iter()
            .map(|volume| {
                Placement::new(
                    volume.id,
                    PlacementState::Used,
                    &[
                        (CapacityType::StorageAllocated, volume.size),
                        (CapacityType::StorageIops, volume.iops),
                    ],
                )
            })
            .collect();
        self.reconcile(EntityId::Pool(pool_id), &totals, placements, &[CapacityType::StorageUsed])
    }

    fn reconcile(
        &self,
        entity: EntityId,
        totals: &[(CapacityType, u64)],
        placements: Vec<Placement>,
        externally_tracked: &[CapacityType],
    ) -> CapacityResult<bool> {
        if !self.ledger.contains(entity) {
            self.ledger.register(entity, totals)?;
        }

        let mut expected: BTreeMap<CapacityType, (u64, u64)> = BTreeMap::new();
        for placement in &placements {
            for (capacity_type, amount) in &placement.amounts {
                let (used, reserved) = expected.entry(*capacity_type).or_default();
                match placement.state {
                    PlacementState::Used => *used += amount,
                    PlacementState::Reserved => *reserved += amount,
                }
            }
        }

        let result = self.ledger.with_entity(entity, |txn| -> CapacityResult<bool> {
            let mut deltas: Vec<(CapacityType, CapacityDelta)> = Vec::new();
            for &(capacity_type, total) in totals {
                let current = txn.record(capacity_type)?;
                let target = if externally_tracked.contains(&capacity_type) {
                    CapacityRecord { total, ..current }
                } else {
                    let (used, reserved) = expected.get(&capacity_type).copied().unwrap_or_default();
                    CapacityRecord {
                        total,
                        used,
                        reserved,
                        ..current
                    }
                };
                let delta = current.delta_to(&target)?;
                if !delta.is_zero() {
                    debug!("{} {}: correcting {:?} to {:?}", entity, capacity_type, current, target);
                    deltas.push((capacity_type, delta));
                }
            }
            txn.apply(&deltas)?;
            txn.replace_placements(placements);
            Ok(!deltas.is_empty())
        });
        result.unwrap_or(Ok(false))
    }

    /// Reconciles every host and pool of the directory on `capacity.calculate.workers` threads.
    pub fn recalculate_all(&self) -> RecalculationSummary {
        let hosts = self.directory.list_hosts();
        let pools = self.directory.list_pools();
        let num_threads = self.resolver.calculate_workers().max(1);
        let summary = Arc::new(Mutex::new(RecalculationSummary {
            hosts_checked: hosts.len(),
            pools_checked: pools.len(),
            ..Default::default()
        }));

        let workers = ThreadPool::new(num_threads);
        let jobs = hosts
            .into_iter()
            .map(EntityId::Host)
            .chain(pools.into_iter().map(EntityId::Pool));
        for entity in jobs {
            let reconciler = self.clone();
            let summary = summary.clone();
            workers.execute(move || {
                let result = match entity {
                    EntityId::Host(id) => reconciler.reconcile_host(id),
                    EntityId::Pool(id) => reconciler.reconcile_pool(id),
                };
                let mut summary = summary.lock();
                match result {
                    Ok(true) => match entity {
                        EntityId::Host(_) => summary.hosts_corrected += 1,
                        EntityId::Pool(_) => summary.pools_corrected += 1,
                    },
                    Ok(false) => {}
                    Err(e) => {
                        warn!("failed to reconcile {}: {}", entity, e);
                        summary.failures.push((entity, e.to_string()));
                    }
                }
            });
        }
        workers.join();

        let mut summary = summary.lock().clone();
        summary.failures.sort_by_key(|(entity, _)| *entity);
        info!(
            "recalculated capacity: {} of {} hosts and {} of {} pools corrected, {} failures",
            summary.hosts_corrected,
            summary.hosts_checked,
            summary.pools_corrected,
            summary.pools_checked,
            summary.failures.len()
        );
        summary
    }
}
