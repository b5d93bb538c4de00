//! Authoritative capacity state: records in the store plus per-entity placement tables.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{trace, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::core::common::{CapacityType, EntityId, RecordKey};
use crate::core::error::{CapacityError, CapacityResult, StoreError};
use crate::core::store::{signed_difference, CapacityDelta, CapacityRecord, CapacityStore};

/// Where the capacity held for a workload currently sits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PlacementState {
    Reserved,
    Used,
}

/// Capacity held by one workload on one host or pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub workload_id: u32,
    pub state: PlacementState,
    pub amounts: BTreeMap<CapacityType, u64>,
}

impl Placement {
    pub fn new(workload_id: u32, state: PlacementState, amounts: &[(CapacityType, u64)]) -> Self {
        Self {
            workload_id,
            state,
            amounts: amounts.iter().cloned().collect(),
        }
    }

    pub fn amount(&self, capacity_type: CapacityType) -> u64 {
        self.amounts.get(&capacity_type).copied().unwrap_or(0)
    }
}

/// Record state before and after a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RecordChange {
    pub before: CapacityRecord,
    pub after: CapacityRecord,
}

#[derive(Default)]
struct EntityState {
    placements: BTreeMap<u32, Placement>,
    capacity_types: Vec<CapacityType>,
    removed: bool,
}

/// Stores capacity records of hosts and pools and serializes their updates.
///
/// Records live in the [`CapacityStore`]. Reads go straight to the store and never wait for writers. Every mutation
/// of an entity's records runs under that entity's lock via [`CapacityLedger::with_entity`], so concurrent
/// allocations on the same host or pool are applied one at a time, while different entities are updated
/// independently.
///
/// The ledger itself never rejects a write because of insufficient capacity: callers check headroom inside the
/// locked section before writing.
pub struct CapacityLedger {
    store: Arc<dyn CapacityStore>,
    entities: RwLock<HashMap<EntityId, Arc<Mutex<EntityState>>>>,
}

impl CapacityLedger {
    pub fn new(store: Arc<dyn CapacityStore>) -> Self {
        Self {
            store,
            entities: RwLock::new(HashMap::new()),
        }
    }

    /// Creates records for a new host or pool.
    ///
    /// Records already present in the store (e.g. persisted before a restart) are kept, only their total is updated.
    pub fn register(&self, entity: EntityId, totals: &[(CapacityType, u64)]) -> CapacityResult<()> {
        let state = self
            .entities
            .write()
            .entry(entity)
            .or_insert_with(|| Arc::new(Mutex::new(EntityState::default())))
            .clone();
        let mut state = state.lock();
        state.removed = false;
        for &(capacity_type, total) in totals {
            let record = CapacityRecord::new(entity, capacity_type, total);
            match self.store.insert(record) {
                Ok(()) => {}
                Err(StoreError::AlreadyExists(key)) => {
                    if let Some(existing) = self.store.get(&key)? {
                        let delta = CapacityDelta {
                            total: signed_difference(total, existing.total)?,
                            ..Default::default()
                        };
                        if !delta.is_zero() {
                            self.store.upsert_delta(&key, &delta)?;
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
            if !state.capacity_types.contains(&capacity_type) {
                state.capacity_types.push(capacity_type);
            }
        }
        trace!("registered capacity records of {}", entity);
        Ok(())
    }

    /// Removes the entity and its records. Returns the removed records.
    ///
    /// Mutations that were waiting for the entity lock observe the entity as missing afterwards.
    pub fn decommission(&self, entity: EntityId) -> CapacityResult<Vec<CapacityRecord>> {
        let state = match self.entities.write().remove(&entity) {
            Some(state) => state,
            None => return Ok(Vec::new()),
        };
        let mut state = state.lock();
        state.removed = true;
        state.placements.clear();
        let mut removed = Vec::new();
        for capacity_type in state.capacity_types.drain(..) {
            if let Some(record) = self.store.remove(&RecordKey::new(entity, capacity_type))? {
                removed.push(record);
            }
        }
        trace!("decommissioned capacity records of {}", entity);
        Ok(removed)
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.entities.read().contains_key(&entity)
    }

    /// Returns IDs of all registered entities.
    pub fn entities(&self) -> Vec<EntityId> {
        let mut entities: Vec<EntityId> = self.entities.read().keys().cloned().collect();
        entities.sort();
        entities
    }

    /// Reads a record without taking the entity lock.
    pub fn record(&self, entity: EntityId, capacity_type: CapacityType) -> CapacityResult<Option<CapacityRecord>> {
        Ok(self.store.get(&RecordKey::new(entity, capacity_type))?)
    }

    /// Reads several records of the entity. Returns `None` if any of them is missing.
    pub fn records(&self, entity: EntityId, types: &[CapacityType]) -> CapacityResult<Option<Vec<CapacityRecord>>> {
        let mut records = Vec::with_capacity(types.len());
        for &capacity_type in types {
            match self.record(entity, capacity_type)? {
                Some(record) => records.push(record),
                None => return Ok(None),
            }
        }
        Ok(Some(records))
    }

    /// Returns a copy of the placement the workload holds on the entity.
    pub fn placement(&self, entity: EntityId, workload_id: u32) -> Option<Placement> {
        let state = self.entities.read().get(&entity)?.clone();
        let state = state.lock();
        state.placements.get(&workload_id).cloned()
    }

    /// Runs `f` with exclusive access to the entity. Returns `None` if the entity is not registered.
    pub fn with_entity<R>(&self, entity: EntityId, f: impl FnOnce(&mut EntityTxn) -> R) -> Option<R> {
        let state = self.entities.read().get(&entity)?.clone();
        let mut state = state.lock();
        if state.removed {
            return None;
        }
        let mut txn = EntityTxn {
            entity,
            store: self.store.as_ref(),
            state: &mut *state,
        };
        Some(f(&mut txn))
    }
}

/// Exclusive access to one entity's records and placements.
pub struct EntityTxn<'a> {
    entity: EntityId,
    store: &'a dyn CapacityStore,
    state: &'a mut EntityState,
}

impl<'a> EntityTxn<'a> {
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn record(&self, capacity_type: CapacityType) -> CapacityResult<CapacityRecord> {
        let key = RecordKey::new(self.entity, capacity_type);
        self.store.get(&key)?.ok_or(CapacityError::MissingRecord(key))
    }

    pub fn placement(&self, workload_id: u32) -> Option<&Placement> {
        self.state.placements.get(&workload_id)
    }

    pub fn placements(&self) -> impl Iterator<Item = &Placement> {
        self.state.placements.values()
    }

    pub fn insert_placement(&mut self, placement: Placement) {
        self.state.placements.insert(placement.workload_id, placement);
    }

    pub fn remove_placement(&mut self, workload_id: u32) -> Option<Placement> {
        self.state.placements.remove(&workload_id)
    }

    pub fn set_placement_state(&mut self, workload_id: u32, state: PlacementState) {
        if let Some(placement) = self.state.placements.get_mut(&workload_id) {
            placement.state = state;
        }
    }

    /// Replaces the whole placement table.
    pub fn replace_placements(&mut self, placements: Vec<Placement>) {
        self.state.placements = placements
            .into_iter()
            .map(|placement| (placement.workload_id, placement))
            .collect();
    }

    /// Applies the deltas to the entity's records.
    ///
    /// Either all deltas are applied or none: if the store fails midway, the already applied deltas are reverted
    /// and the error is returned.
    pub fn apply(&mut self, deltas: &[(CapacityType, CapacityDelta)]) -> CapacityResult<Vec<RecordChange>> {
        let mut changes: Vec<RecordChange> = Vec::with_capacity(deltas.len());
        for (capacity_type, delta) in deltas {
            match self.apply_one(*capacity_type, delta) {
                Ok(change) => changes.push(change),
                Err(e) => {
                    self.compensate(&changes);
                    return Err(e);
                }
            }
        }
        Ok(changes)
    }

    fn apply_one(&mut self, capacity_type: CapacityType, delta: &CapacityDelta) -> CapacityResult<RecordChange> {
        let key = RecordKey::new(self.entity, capacity_type);
        let before = self.store.get(&key)?.ok_or(CapacityError::MissingRecord(key))?;
        if (delta.used < 0 && delta.used.unsigned_abs() > before.used)
            || (delta.reserved < 0 && delta.reserved.unsigned_abs() > before.reserved)
        {
            warn!(
                "{}: delta {:?} exceeds current values (used {}, reserved {}), clamping at zero",
                key, delta, before.used, before.reserved
            );
        }
        let after = self
            .store
            .upsert_delta(&key, delta)?
            .ok_or(CapacityError::MissingRecord(key))?;
        Ok(RecordChange { before, after })
    }

    fn compensate(&mut self, changes: &[RecordChange]) {
        for change in changes.iter().rev() {
            let key = change.before.key();
            let reverted = change
                .after
                .delta_to(&change.before)
                .and_then(|undo| self.store.upsert_delta(&key, &undo).map_err(CapacityError::from));
            if let Err(e) = reverted {
                warn!("failed to revert {} after a partial update: {}", key, e);
            }
        }
    }
}
