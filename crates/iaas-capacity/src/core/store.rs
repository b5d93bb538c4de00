//! Persistence boundary for capacity records.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::common::{CapacityType, EntityId, RecordKey};
use crate::core::error::{CapacityError, CapacityResult, StoreError};

/// Total, used and reserved capacity of one resource of one host or pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRecord {
    pub entity: EntityId,
    pub capacity_type: CapacityType,
    /// Raw capacity, before overprovisioning.
    pub total: u64,
    /// Capacity consumed by running workloads.
    pub used: u64,
    /// Capacity promised to workloads that are not running yet.
    pub reserved: u64,
}

impl CapacityRecord {
    pub fn new(entity: EntityId, capacity_type: CapacityType, total: u64) -> Self {
        Self {
            entity,
            capacity_type,
            total,
            used: 0,
            reserved: 0,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.entity, self.capacity_type)
    }

    /// Returns used plus reserved capacity.
    pub fn allocated(&self) -> u64 {
        self.used.saturating_add(self.reserved)
    }

    /// Returns the record with the delta applied. Values are clamped at zero.
    pub fn with_delta(&self, delta: &CapacityDelta) -> Self {
        Self {
            entity: self.entity,
            capacity_type: self.capacity_type,
            total: add_signed(self.total, delta.total),
            used: add_signed(self.used, delta.used),
            reserved: add_signed(self.reserved, delta.reserved),
        }
    }

    /// Returns the delta turning this record into `target`.
    pub fn delta_to(&self, target: &CapacityRecord) -> CapacityResult<CapacityDelta> {
        Ok(CapacityDelta {
            total: signed_difference(target.total, self.total)?,
            used: signed_difference(target.used, self.used)?,
            reserved: signed_difference(target.reserved, self.reserved)?,
        })
    }
}

/// Converts an amount of capacity into a delta component.
pub fn signed_amount(amount: u64) -> CapacityResult<i64> {
    i64::try_from(amount)
        .map_err(|_| CapacityError::InvalidInput(format!("capacity amount {} does not fit a delta", amount)))
}

/// Returns `target - current` as a delta component.
pub fn signed_difference(target: u64, current: u64) -> CapacityResult<i64> {
    i64::try_from(i128::from(target) - i128::from(current)).map_err(|_| {
        CapacityError::InvalidInput(format!(
            "capacity change from {} to {} does not fit a delta",
            current, target
        ))
    })
}

fn add_signed(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// Signed change of a capacity record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityDelta {
    pub total: i64,
    pub used: i64,
    pub reserved: i64,
}

impl CapacityDelta {
    pub fn used(amount: i64) -> Self {
        Self {
            used: amount,
            ..Default::default()
        }
    }

    pub fn reserved(amount: i64) -> Self {
        Self {
            reserved: amount,
            ..Default::default()
        }
    }

    /// Moves the amount between reserved and used. Positive values move from reserved to used.
    pub fn reserved_to_used(amount: i64) -> Self {
        Self {
            total: 0,
            used: amount,
            reserved: -amount,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    pub fn inverse(&self) -> Self {
        Self {
            total: self.total.saturating_neg(),
            used: self.used.saturating_neg(),
            reserved: self.reserved.saturating_neg(),
        }
    }
}

/// Key-value store holding the authoritative capacity records.
///
/// A read must observe the most recent committed write on the same key. A failed call must leave the record
/// unchanged.
pub trait CapacityStore: Send + Sync {
    fn get(&self, key: &RecordKey) -> Result<Option<CapacityRecord>, StoreError>;

    /// Creates the record. Fails if a record with the same key exists.
    fn insert(&self, record: CapacityRecord) -> Result<(), StoreError>;

    /// Applies the delta to an existing record and returns the updated record, `None` if there is no such record.
    fn upsert_delta(&self, key: &RecordKey, delta: &CapacityDelta) -> Result<Option<CapacityRecord>, StoreError>;

    fn remove(&self, key: &RecordKey) -> Result<Option<CapacityRecord>, StoreError>;
}

/// Store keeping records in process memory.
#[derive(Default)]
pub struct InMemoryCapacityStore {
    records: RwLock<HashMap<RecordKey, CapacityRecord>>,
}

impl InMemoryCapacityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl CapacityStore for InMemoryCapacityStore {
    fn get(&self, key: &RecordKey) -> Result<Option<CapacityRecord>, StoreError> {
        Ok(self.records.read().get(key).copied())
    }

    fn insert(&self, record: CapacityRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        if records.contains_key(&record.key()) {
            return Err(StoreError::AlreadyExists(record.key()));
        }
        records.insert(record.key(), record);
        Ok(())
    }

    fn upsert_delta(&self, key: &RecordKey, delta: &CapacityDelta) -> Result<Option<CapacityRecord>, StoreError> {
        let mut records = self.records.write();
        Ok(records.get_mut(key).map(|record| {
            *record = record.with_delta(delta);
            *record
        }))
    }

    fn remove(&self, key: &RecordKey) -> Result<Option<CapacityRecord>, StoreError> {
        Ok(self.records.write().remove(key))
    }
}
