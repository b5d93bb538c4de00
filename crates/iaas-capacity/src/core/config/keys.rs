//! Recognized configuration keys.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::core::common::{CapacityType, ResourceScope};
use crate::core::error::{CapacityError, CapacityResult};

/// Configuration key understood by the capacity subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    CpuOverprovisioningFactor,
    MemOverprovisioningFactor,
    StorageOverprovisioningFactor,
    StorageCapacityDisableThreshold,
    StorageAllocatedCapacityDisableThreshold,
    StorageAllocatedResizeCapacityDisableThreshold,
    SecondaryStorageCapacityThreshold,
    ClusterCpuCapacityDisableThreshold,
    ClusterMemoryCapacityDisableThreshold,
    StorageOperationsExcludeCluster,
    CapacityCalculateWorkers,
}

/// Kind of value stored under a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    /// Multiplier, finite and positive.
    Factor,
    /// Fraction in [0, 1].
    Threshold,
    Flag,
    Count,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConfigValue {
    Number(f64),
    Flag(bool),
    Count(usize),
}

impl ConfigValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            ConfigValue::Number(value) => value,
            ConfigValue::Flag(value) => {
                if value {
                    1.
                } else {
                    0.
                }
            }
            ConfigValue::Count(value) => value as f64,
        }
    }

    pub fn as_bool(&self) -> bool {
        match *self {
            ConfigValue::Number(value) => value != 0.,
            ConfigValue::Flag(value) => value,
            ConfigValue::Count(value) => value != 0,
        }
    }

    pub fn as_count(&self) -> usize {
        match *self {
            ConfigValue::Number(value) => value.max(0.) as usize,
            ConfigValue::Flag(value) => value as usize,
            ConfigValue::Count(value) => value,
        }
    }
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 11] = [
        ConfigKey::CpuOverprovisioningFactor,
        ConfigKey::MemOverprovisioningFactor,
        ConfigKey::StorageOverprovisioningFactor,
        ConfigKey::StorageCapacityDisableThreshold,
        ConfigKey::StorageAllocatedCapacityDisableThreshold,
        ConfigKey::StorageAllocatedResizeCapacityDisableThreshold,
        ConfigKey::SecondaryStorageCapacityThreshold,
        ConfigKey::ClusterCpuCapacityDisableThreshold,
        ConfigKey::ClusterMemoryCapacityDisableThreshold,
        ConfigKey::StorageOperationsExcludeCluster,
        ConfigKey::CapacityCalculateWorkers,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ConfigKey::CpuOverprovisioningFactor => "cpu.overprovisioning.factor",
            ConfigKey::MemOverprovisioningFactor => "mem.overprovisioning.factor",
            ConfigKey::StorageOverprovisioningFactor => "storage.overprovisioning.factor",
            ConfigKey::StorageCapacityDisableThreshold => "pool.storage.capacity.disablethreshold",
            ConfigKey::StorageAllocatedCapacityDisableThreshold => "pool.storage.allocated.capacity.disablethreshold",
            ConfigKey::StorageAllocatedResizeCapacityDisableThreshold => {
                "pool.storage.allocated.resize.capacity.disablethreshold"
            }
            ConfigKey::SecondaryStorageCapacityThreshold => "secondary.storage.capacity.threshold",
            ConfigKey::ClusterCpuCapacityDisableThreshold => "cluster.cpu.allocated.capacity.disablethreshold",
            ConfigKey::ClusterMemoryCapacityDisableThreshold => "cluster.memory.allocated.capacity.disablethreshold",
            ConfigKey::StorageOperationsExcludeCluster => "cluster.storage.operations.exclude",
            ConfigKey::CapacityCalculateWorkers => "capacity.calculate.workers",
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            ConfigKey::CpuOverprovisioningFactor
            | ConfigKey::MemOverprovisioningFactor
            | ConfigKey::StorageOverprovisioningFactor => ValueKind::Factor,
            ConfigKey::StorageOperationsExcludeCluster => ValueKind::Flag,
            ConfigKey::CapacityCalculateWorkers => ValueKind::Count,
            _ => ValueKind::Threshold,
        }
    }

    /// Scopes below global at which the key may be overridden. Global is always allowed.
    pub fn scopes(&self) -> &'static [ResourceScope] {
        match self {
            ConfigKey::CpuOverprovisioningFactor
            | ConfigKey::MemOverprovisioningFactor
            | ConfigKey::ClusterCpuCapacityDisableThreshold
            | ConfigKey::ClusterMemoryCapacityDisableThreshold
            | ConfigKey::StorageOperationsExcludeCluster => &[ResourceScope::Cluster],
            ConfigKey::StorageOverprovisioningFactor => &[ResourceScope::StoragePool],
            ConfigKey::StorageCapacityDisableThreshold
            | ConfigKey::StorageAllocatedCapacityDisableThreshold
            | ConfigKey::StorageAllocatedResizeCapacityDisableThreshold => {
                &[ResourceScope::StoragePool, ResourceScope::Zone]
            }
            ConfigKey::SecondaryStorageCapacityThreshold => &[ResourceScope::ImageStore],
            ConfigKey::CapacityCalculateWorkers => &[],
        }
    }

    pub fn allowed_at(&self, scope: ResourceScope) -> bool {
        scope == ResourceScope::Global || self.scopes().contains(&scope)
    }

    pub fn default_value(&self) -> ConfigValue {
        match self {
            ConfigKey::CpuOverprovisioningFactor | ConfigKey::MemOverprovisioningFactor => ConfigValue::Number(1.0),
            ConfigKey::StorageOverprovisioningFactor => ConfigValue::Number(2.0),
            ConfigKey::StorageCapacityDisableThreshold | ConfigKey::StorageAllocatedCapacityDisableThreshold => {
                ConfigValue::Number(0.85)
            }
            ConfigKey::StorageAllocatedResizeCapacityDisableThreshold => ConfigValue::Number(0.90),
            ConfigKey::SecondaryStorageCapacityThreshold => ConfigValue::Number(0.90),
            ConfigKey::ClusterCpuCapacityDisableThreshold | ConfigKey::ClusterMemoryCapacityDisableThreshold => {
                ConfigValue::Number(0.85)
            }
            ConfigKey::StorageOperationsExcludeCluster => ConfigValue::Flag(false),
            ConfigKey::CapacityCalculateWorkers => ConfigValue::Count(1),
        }
    }

    /// Returns the overprovisioning factor key for the capacity type, if the type is overprovisioned.
    pub fn overprovisioning_for(capacity_type: CapacityType) -> Option<ConfigKey> {
        match capacity_type {
            CapacityType::Cpu => Some(ConfigKey::CpuOverprovisioningFactor),
            CapacityType::Memory => Some(ConfigKey::MemOverprovisioningFactor),
            CapacityType::StorageAllocated => Some(ConfigKey::StorageOverprovisioningFactor),
            CapacityType::StorageUsed | CapacityType::StorageIops => None,
        }
    }

    /// Parses a textual value according to the key kind.
    pub fn parse_value(&self, value: &str) -> CapacityResult<ConfigValue> {
        let value = value.trim();
        let invalid = || CapacityError::InvalidConfig(format!("bad value '{}' for {}", value, self));
        let parsed = match self.kind() {
            ValueKind::Factor | ValueKind::Threshold => {
                ConfigValue::Number(value.parse::<f64>().map_err(|_| invalid())?)
            }
            ValueKind::Flag => ConfigValue::Flag(value.parse::<bool>().map_err(|_| invalid())?),
            ValueKind::Count => ConfigValue::Count(value.parse::<usize>().map_err(|_| invalid())?),
        };
        self.validate(parsed)?;
        Ok(parsed)
    }

    /// Checks that the value has the right kind and lies in the accepted range.
    pub fn validate(&self, value: ConfigValue) -> CapacityResult<()> {
        let ok = match (self.kind(), value) {
            (ValueKind::Factor, ConfigValue::Number(v)) => v.is_finite() && v > 0.,
            (ValueKind::Threshold, ConfigValue::Number(v)) => (0.0..=1.0).contains(&v),
            (ValueKind::Flag, ConfigValue::Flag(_)) => true,
            (ValueKind::Count, ConfigValue::Count(v)) => v >= 1,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(CapacityError::InvalidConfig(format!("{:?} is not a valid value for {}", value, self)))
        }
    }
}

impl Display for ConfigKey {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ConfigKey {
    type Err = CapacityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        ConfigKey::ALL
            .iter()
            .find(|key| key.name() == s)
            .copied()
            .ok_or_else(|| CapacityError::UnknownConfigKey(s.to_string()))
    }
}
