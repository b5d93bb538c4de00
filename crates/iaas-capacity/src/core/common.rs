//! Identifiers and tags shared by all capacity components.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Kind of capacity tracked by a single record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CapacityType {
    /// Host CPU in MHz.
    Cpu,
    /// Host memory in bytes.
    Memory,
    /// Storage pool space promised to volumes, in bytes.
    StorageAllocated,
    /// Storage pool space actually written, in bytes.
    StorageUsed,
    /// Storage pool IOPS promised to volumes.
    StorageIops,
}

impl CapacityType {
    /// Capacity types recorded for every host.
    pub const HOST: [CapacityType; 2] = [CapacityType::Cpu, CapacityType::Memory];
    /// Capacity types recorded for every storage pool.
    pub const POOL: [CapacityType; 3] = [
        CapacityType::StorageAllocated,
        CapacityType::StorageUsed,
        CapacityType::StorageIops,
    ];
}

impl Display for CapacityType {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            CapacityType::Cpu => write!(f, "cpu"),
            CapacityType::Memory => write!(f, "memory"),
            CapacityType::StorageAllocated => write!(f, "storage_allocated"),
            CapacityType::StorageUsed => write!(f, "storage_used"),
            CapacityType::StorageIops => write!(f, "storage_iops"),
        }
    }
}

/// Granularity at which a configuration value may be overridden.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceScope {
    Global,
    Zone,
    Cluster,
    StoragePool,
    ImageStore,
}

/// Concrete scope instance used for configuration lookups.
///
/// A pool carries its zone so that resolution can fall back from pool to zone without consulting the directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScopeRef {
    Global,
    Zone(u32),
    Cluster(u32),
    StoragePool { id: u32, zone_id: u32 },
    ImageStore(u32),
}

impl ScopeRef {
    pub fn scope(&self) -> ResourceScope {
        match self {
            ScopeRef::Global => ResourceScope::Global,
            ScopeRef::Zone(_) => ResourceScope::Zone,
            ScopeRef::Cluster(_) => ResourceScope::Cluster,
            ScopeRef::StoragePool { .. } => ResourceScope::StoragePool,
            ScopeRef::ImageStore(_) => ResourceScope::ImageStore,
        }
    }

    /// Returns the scopes to consult for this instance, from the most specific one to global.
    pub fn chain(&self) -> Vec<ScopeRef> {
        match *self {
            ScopeRef::Global => vec![ScopeRef::Global],
            ScopeRef::Zone(id) => vec![ScopeRef::Zone(id), ScopeRef::Global],
            ScopeRef::Cluster(id) => vec![ScopeRef::Cluster(id), ScopeRef::Global],
            ScopeRef::StoragePool { id, zone_id } => vec![
                ScopeRef::StoragePool { id, zone_id },
                ScopeRef::Zone(zone_id),
                ScopeRef::Global,
            ],
            ScopeRef::ImageStore(id) => vec![ScopeRef::ImageStore(id), ScopeRef::Global],
        }
    }
}

impl Display for ScopeRef {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ScopeRef::Global => write!(f, "global"),
            ScopeRef::Zone(id) => write!(f, "zone #{}", id),
            ScopeRef::Cluster(id) => write!(f, "cluster #{}", id),
            ScopeRef::StoragePool { id, .. } => write!(f, "pool #{}", id),
            ScopeRef::ImageStore(id) => write!(f, "image store #{}", id),
        }
    }
}

/// Entity owning capacity records. Hosts and pools have separate ID spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityId {
    Host(u32),
    Pool(u32),
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            EntityId::Host(id) => write!(f, "host #{}", id),
            EntityId::Pool(id) => write!(f, "pool #{}", id),
        }
    }
}

/// Key of a single capacity record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub entity: EntityId,
    pub capacity_type: CapacityType,
}

impl RecordKey {
    pub fn new(entity: EntityId, capacity_type: CapacityType) -> Self {
        Self { entity, capacity_type }
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{} {}", self.entity, self.capacity_type)
    }
}

/// Result of checking or applying an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AllocationVerdict {
    Success,
    /// The same workload is already placed on the entity, nothing was changed.
    AlreadyAllocated,
    NotEnoughCPU,
    NotEnoughMemory,
    NotEnoughStorage,
    NotEnoughIops,
    HostNotFound,
    PoolNotFound,
}

impl AllocationVerdict {
    pub fn is_success(&self) -> bool {
        matches!(self, AllocationVerdict::Success | AllocationVerdict::AlreadyAllocated)
    }
}
