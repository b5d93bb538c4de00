//! State transitions of capacity held by workloads.

use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;

use crate::core::calculator::effective_capacity;
use crate::core::common::{AllocationVerdict, CapacityType, EntityId, ScopeRef};
use crate::core::config::resolver::ConfigResolver;
use crate::core::directory::ResourceDirectory;
use crate::core::error::{CapacityError, CapacityResult};
use crate::core::ledger::{CapacityLedger, EntityTxn, Placement, PlacementState, RecordChange};
use crate::core::store::{signed_amount, signed_difference, CapacityDelta};
use crate::core::workload::{VirtualMachine, Volume};

/// Result of an allocation attempt together with the touched records before and after it.
///
/// Rejected and repeated allocations report the current records with `before == after`. When a VM moves away from
/// its last host, `changes` also holds the last host's records and `last_host_release` tells whether that step
/// took place.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AllocationOutcome {
    pub success: bool,
    pub verdict: AllocationVerdict,
    pub changes: Vec<RecordChange>,
    pub last_host_release: Option<LastHostRelease>,
}

/// Second step of moving a VM: releasing what it held on its last host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum LastHostRelease {
    Released { host_id: u32 },
    /// The last host held nothing for the VM.
    NothingHeld { host_id: u32 },
    /// The VM stays counted on the last host until it is released again or the host is reconciled.
    Failed { host_id: u32, error: String },
}

impl AllocationOutcome {
    fn applied(changes: Vec<RecordChange>) -> Self {
        Self {
            success: true,
            verdict: AllocationVerdict::Success,
            changes,
            last_host_release: None,
        }
    }

    fn unchanged(verdict: AllocationVerdict, txn: &EntityTxn, types: &[CapacityType]) -> CapacityResult<Self> {
        let mut changes = Vec::with_capacity(types.len());
        for &capacity_type in types {
            let record = txn.record(capacity_type)?;
            changes.push(RecordChange {
                before: record,
                after: record,
            });
        }
        Ok(Self {
            success: verdict.is_success(),
            verdict,
            changes,
            last_host_release: None,
        })
    }

    fn not_found(verdict: AllocationVerdict) -> Self {
        Self {
            success: false,
            verdict,
            changes: Vec::new(),
            last_host_release: None,
        }
    }
}

/// Mutates capacity records on behalf of placement decisions.
///
/// A VM moves through the following states on a host:
///
/// * `allocate` reserves its CPU and memory after re-checking headroom under the host lock,
/// * `commit_started` moves the reservation to used capacity once the VM runs,
/// * `release` frees the capacity, optionally keeping it reserved for a later restart on the same host.
///
/// The placement table kept per host makes each step idempotent: repeated allocations and releases of the same VM
/// are detected and change nothing.
pub struct CapacityAllocator {
    resolver: Arc<ConfigResolver>,
    ledger: Arc<CapacityLedger>,
    directory: Arc<dyn ResourceDirectory>,
}

impl CapacityAllocator {
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

    /// Reserves capacity for the VM on its current host.
    ///
    /// With `from_last_host` set and a known last host:
    /// - if the last host is the target and still holds a reservation for the VM, that reservation is reused,
    /// - otherwise the VM is first reserved on the target host, then its reservation on the last host is released.
    ///   Between the two steps the VM is counted on both hosts. A failed release doesn't undo the reservation on the
    ///   target host and is reported in [`AllocationOutcome::last_host_release`].
    pub fn allocate(&self, vm: &VirtualMachine, from_last_host: bool) -> CapacityResult<AllocationOutcome> {
        let host_id = vm
            .host_id
            .ok_or_else(|| CapacityError::InvalidInput(format!("vm {} has no target host", vm.id)))?;

        let last_host_id = if from_last_host { vm.last_host_id } else { None };
        if last_host_id == Some(host_id) {
            let reused = self
                .ledger
                .with_entity(EntityId::Host(host_id), |txn| -> CapacityResult<Option<AllocationOutcome>> {
                    match txn.placement(vm.id) {
                        Some(placement) if placement.state == PlacementState::Reserved => {
                            AllocationOutcome::unchanged(AllocationVerdict::AlreadyAllocated, txn, &CapacityType::HOST)
                                .map(Some)
                        }
                        _ => Ok(None),
                    }
                });
            if let Some(outcome) = reused.transpose()?.flatten() {
                debug!("vm {} reuses its reservation on host #{}", vm.id, host_id);
                return Ok(outcome);
            }
        }

        let mut outcome = self.reserve_on_host(vm, host_id)?;

        if let Some(last_host_id) = last_host_id.filter(|last| *last != host_id) {
            if outcome.verdict == AllocationVerdict::Success {
                let release = match self.release_placement(vm, true, false, last_host_id) {
                    Ok(Some(changes)) => {
                        debug!(
                            "moved reservation of vm {} from host #{} to host #{}",
                            vm.id, last_host_id, host_id
                        );
                        outcome.changes.extend(changes);
                        LastHostRelease::Released { host_id: last_host_id }
                    }
                    Ok(None) => LastHostRelease::NothingHeld { host_id: last_host_id },
                    Err(e) => {
                        warn!(
                            "vm {} reserved on host #{} but its reservation on host #{} was not released: {}",
                            vm.id, host_id, last_host_id, e
                        );
                        LastHostRelease::Failed {
                            host_id: last_host_id,
                            error: e.to_string(),
                        }
                    }
                };
                outcome.last_host_release = Some(release);
            }
        }
        Ok(outcome)
    }

    fn reserve_on_host(&self, vm: &VirtualMachine, host_id: u32) -> CapacityResult<AllocationOutcome> {
        let host = match self.directory.get_host(host_id) {
            Some(host) => host,
            None => return Ok(AllocationOutcome::not_found(AllocationVerdict::HostNotFound)),
        };
        let scope = ScopeRef::Cluster(host.cluster_id);
        let cpu_factor = self.resolver.overprovisioning_factor(CapacityType::Cpu, scope);
        let mem_factor = self.resolver.overprovisioning_factor(CapacityType::Memory, scope);
        let cpu = vm.cpu_requested();
        let ram = vm.ram_requested();
        let (cpu_delta, ram_delta) = (signed_amount(cpu)?, signed_amount(ram)?);

        let result = self.ledger.with_entity(EntityId::Host(host_id), |txn| -> CapacityResult<AllocationOutcome> {
            if txn.placement(vm.id).is_some() {
                return AllocationOutcome::unchanged(AllocationVerdict::AlreadyAllocated, txn, &CapacityType::HOST);
            }
            let cpu_record = txn.record(CapacityType::Cpu)?;
            let memory_record = txn.record(CapacityType::Memory)?;
            let cpu_limit = effective_capacity(cpu_record.total, cpu_factor);
            let memory_limit = effective_capacity(memory_record.total, mem_factor);
            let verdict = if cpu_record.allocated().saturating_add(cpu) > cpu_limit {
                AllocationVerdict::NotEnoughCPU
            } else if memory_record.allocated().saturating_add(ram) > memory_limit {
                AllocationVerdict::NotEnoughMemory
            } else {
                AllocationVerdict::Success
            };
            if verdict != AllocationVerdict::Success {
                debug!(
                    "rejected placement of vm {} on host #{} due to insufficient resources: {:?}",
                    vm.id, host_id, verdict
                );
                return AllocationOutcome::unchanged(verdict, txn, &CapacityType::HOST);
            }

            let changes = txn.apply(&[
                (CapacityType::Cpu, CapacityDelta::reserved(cpu_delta)),
                (CapacityType::Memory, CapacityDelta::reserved(ram_delta)),
            ])?;
            txn.insert_placement(Placement::new(
                vm.id,
                PlacementState::Reserved,
                &[(CapacityType::Cpu, cpu), (CapacityType::Memory, ram)],
            ));
            debug!("reserved cpu {} and ram {} for vm {} on host #{}", cpu, ram, vm.id, host_id);
            Ok(AllocationOutcome::applied(changes))
        });
        result.unwrap_or_else(|| Ok(AllocationOutcome::not_found(AllocationVerdict::HostNotFound)))
    }

    /// Moves the VM's reservation on the host to used capacity. Returns false if the VM holds nothing there.
    pub fn commit_started(&self, vm_id: u32, host_id: u32) -> CapacityResult<bool> {
        let result = self.ledger.with_entity(EntityId::Host(host_id), |txn| -> CapacityResult<bool> {
            let placement = match txn.placement(vm_id) {
                Some(placement) => placement.clone(),
                None => return Ok(false),
            };
            if placement.state == PlacementState::Used {
                return Ok(true);
            }
            let deltas = placement
                .amounts
                .iter()
                .map(|(capacity_type, amount)| -> CapacityResult<(CapacityType, CapacityDelta)> {
                    Ok((*capacity_type, CapacityDelta::reserved_to_used(signed_amount(*amount)?)))
                })
                .collect::<CapacityResult<Vec<_>>>()?;
            txn.apply(&deltas)?;
            txn.set_placement_state(vm_id, PlacementState::Used);
            debug!("vm {} started on host #{}", vm_id, host_id);
            Ok(true)
        });
        result.unwrap_or(Ok(false))
    }

    /// Releases the capacity the VM holds on the host.
    ///
    /// The capacity is taken from wherever it currently sits; `move_from_reserved` states where the caller expects
    /// it. With `move_to_reserved`, capacity released from used is kept as a reservation so that the VM can restart
    /// on the same host. Returns false if the host or the VM's placement on it is unknown, which makes a repeated
    /// release a no-op.
    pub fn release(
        &self,
        vm: &VirtualMachine,
        move_from_reserved: bool,
        move_to_reserved: bool,
        host_id: u32,
    ) -> CapacityResult<bool> {
        self.release_placement(vm, move_from_reserved, move_to_reserved, host_id)
            .map(|changes| changes.is_some())
    }

    /// Releases the VM's capacity on the host and returns the changed records, `None` if it held nothing there.
    fn release_placement(
        &self,
        vm: &VirtualMachine,
        move_from_reserved: bool,
        move_to_reserved: bool,
        host_id: u32,
    ) -> CapacityResult<Option<Vec<RecordChange>>> {
        let entity = EntityId::Host(host_id);
        let result = self.ledger.with_entity(entity, |txn| -> CapacityResult<Option<Vec<RecordChange>>> {
            let placement = match txn.placement(vm.id) {
                Some(placement) => placement.clone(),
                None => {
                    debug!("vm {} holds no capacity on host #{}", vm.id, host_id);
                    return Ok(None);
                }
            };
            let from_reserved = placement.state == PlacementState::Reserved;
            if from_reserved != move_from_reserved {
                debug!(
                    "capacity of vm {} on host #{} sits in {:?}, releasing from there",
                    vm.id, host_id, placement.state
                );
            }
            let keep_reserved = !from_reserved && move_to_reserved;
            let deltas = placement
                .amounts
                .iter()
                .map(|(capacity_type, amount)| -> CapacityResult<(CapacityType, CapacityDelta)> {
                    let amount = signed_amount(*amount)?;
                    let delta = if from_reserved {
                        CapacityDelta::reserved(-amount)
                    } else if keep_reserved {
                        CapacityDelta::reserved_to_used(-amount)
                    } else {
                        CapacityDelta::used(-amount)
                    };
                    Ok((*capacity_type, delta))
                })
                .collect::<CapacityResult<Vec<_>>>()?;
            let changes = txn.apply(&deltas)?;
            if keep_reserved {
                txn.set_placement_state(vm.id, PlacementState::Reserved);
            } else {
                txn.remove_placement(vm.id);
            }
            debug!(
                "released capacity of vm {} on host #{} (kept reserved: {})",
                vm.id, host_id, keep_reserved
            );
            Ok(Some(changes))
        });
        result.unwrap_or_else(|| {
            debug!("host #{} not found, nothing to release for vm {}", host_id, vm.id);
            Ok(None)
        })
    }

    /// Allocates the volume's size and IOPS on its pool.
    pub fn allocate_volume(&self, volume: &Volume) -> CapacityResult<AllocationOutcome> {
        let pool_id = volume
            .pool_id
            .ok_or_else(|| CapacityError::InvalidInput(format!("volume {} has no target pool", volume.id)))?;
        let pool = match self.directory.get_pool(pool_id) {
            Some(pool) => pool,
            None => return Ok(AllocationOutcome::not_found(AllocationVerdict::PoolNotFound)),
        };
        let touched = [CapacityType::StorageAllocated, CapacityType::StorageIops];
        let (size_delta, iops_delta) = (signed_amount(volume.size)?, signed_amount(volume.iops)?);
        let factor = self.resolver.overprovisioning_factor(
            CapacityType::StorageAllocated,
            ScopeRef::StoragePool {
                id: pool.id,
                zone_id: pool.zone_id,
            },
        );

        let result = self.ledger.with_entity(EntityId::Pool(pool_id), |txn| -> CapacityResult<AllocationOutcome> {
            if txn.placement(volume.id).is_some() {
                return AllocationOutcome::unchanged(AllocationVerdict::AlreadyAllocated, txn, &touched);
            }
            let storage = txn.record(CapacityType::StorageAllocated)?;
            let iops = txn.record(CapacityType::StorageIops)?;
            let storage_limit = effective_capacity(storage.total, factor);
            let verdict = if storage.allocated().saturating_add(volume.size) > storage_limit {
                AllocationVerdict::NotEnoughStorage
            } else if pool.capacity_iops.is_some() && iops.allocated().saturating_add(volume.iops) > iops.total {
                AllocationVerdict::NotEnoughIops
            } else {
                AllocationVerdict::Success
            };
            if verdict != AllocationVerdict::Success {
                debug!("rejected volume {} on pool #{}: {:?}", volume.id, pool_id, verdict);
                return AllocationOutcome::unchanged(verdict, txn, &touched);
            }

            let changes = txn.apply(&[
                (CapacityType::StorageAllocated, CapacityDelta::used(size_delta)),
                (CapacityType::StorageIops, CapacityDelta::used(iops_delta)),
            ])?;
            txn.insert_placement(Placement::new(
                volume.id,
                PlacementState::Used,
                &[
                    (CapacityType::StorageAllocated, volume.size),
                    (CapacityType::StorageIops, volume.iops),
                ],
            ));
            debug!("allocated volume {} of {} bytes on pool #{}", volume.id, volume.size, pool_id);
            Ok(AllocationOutcome::applied(changes))
        });
        result.unwrap_or_else(|| Ok(AllocationOutcome::not_found(AllocationVerdict::PoolNotFound)))
    }

    /// Changes the size allocated to a volume already placed on its pool.
    ///
    /// Growing is checked against the overprovisioned capacity, shrinking always succeeds.
    pub fn resize_volume(&self, volume: &Volume, new_size: u64) -> CapacityResult<AllocationOutcome> {
        let pool_id = volume
            .pool_id
            .ok_or_else(|| CapacityError::InvalidInput(format!("volume {} has no pool", volume.id)))?;
        let pool = match self.directory.get_pool(pool_id) {
            Some(pool) => pool,
            None => return Ok(AllocationOutcome::not_found(AllocationVerdict::PoolNotFound)),
        };
        let factor = self.resolver.overprovisioning_factor(
            CapacityType::StorageAllocated,
            ScopeRef::StoragePool {
                id: pool.id,
                zone_id: pool.zone_id,
            },
        );

        let result = self.ledger.with_entity(EntityId::Pool(pool_id), |txn| -> CapacityResult<AllocationOutcome> {
            let mut placement = match txn.placement(volume.id) {
                Some(placement) => placement.clone(),
                None => {
                    return Err(CapacityError::InvalidInput(format!(
                        "volume {} is not allocated on pool #{}",
                        volume.id, pool_id
                    )))
                }
            };
            let current = placement.amount(CapacityType::StorageAllocated);
            let storage = txn.record(CapacityType::StorageAllocated)?;
            if new_size > current {
                let grown = storage.allocated().saturating_add(new_size - current);
                if grown > effective_capacity(storage.total, factor) {
                    return AllocationOutcome::unchanged(
                        AllocationVerdict::NotEnoughStorage,
                        txn,
                        &[CapacityType::StorageAllocated],
                    );
                }
            }
            let changes = txn.apply(&[(
                CapacityType::StorageAllocated,
                CapacityDelta::used(signed_difference(new_size, current)?),
            )])?;
            placement.amounts.insert(CapacityType::StorageAllocated, new_size);
            txn.insert_placement(placement);
            debug!("resized volume {} on pool #{} from {} to {}", volume.id, pool_id, current, new_size);
            Ok(AllocationOutcome::applied(changes))
        });
        result.unwrap_or_else(|| Ok(AllocationOutcome::not_found(AllocationVerdict::PoolNotFound)))
    }

    /// Releases the volume's size and IOPS on its pool. Returns false if the volume holds nothing there.
    pub fn release_volume(&self, volume: &Volume) -> CapacityResult<bool> {
        let pool_id = volume
            .pool_id
            .ok_or_else(|| CapacityError::InvalidInput(format!("volume {} has no pool", volume.id)))?;
        let result = self.ledger.with_entity(EntityId::Pool(pool_id), |txn| -> CapacityResult<bool> {
            let placement = match txn.placement(volume.id) {
                Some(placement) => placement.clone(),
                None => return Ok(false),
            };
            let deltas = placement
                .amounts
                .iter()
                .map(|(capacity_type, amount)| -> CapacityResult<(CapacityType, CapacityDelta)> {
                    Ok((*capacity_type, CapacityDelta::used(-signed_amount(*amount)?)))
                })
                .collect::<CapacityResult<Vec<_>>>()?;
            txn.apply(&deltas)?;
            txn.remove_placement(volume.id);
            debug!("released volume {} on pool #{}", volume.id, pool_id);
            Ok(true)
        });
        result.unwrap_or(Ok(false))
    }

    /// Records the number of bytes actually written on the pool, as reported by storage statistics.
    pub fn record_pool_usage(&self, pool_id: u32, used_bytes: u64) -> CapacityResult<bool> {
        let result = self.ledger.with_entity(EntityId::Pool(pool_id), |txn| -> CapacityResult<bool> {
            let record = txn.record(CapacityType::StorageUsed)?;
            let delta = CapacityDelta::used(signed_difference(used_bytes, record.used)?);
            if !delta.is_zero() {
                txn.apply(&[(CapacityType::StorageUsed, delta)])?;
            }
            Ok(true)
        });
        result.unwrap_or(Ok(false))
    }
}
