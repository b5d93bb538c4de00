//! Capacity configuration: global defaults plus per-scope overrides.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::core::common::{ResourceScope, ScopeRef};
use crate::core::config::keys::{ConfigKey, ConfigValue};
use crate::core::config::options::{parse_config_value, parse_options};
use crate::core::error::{CapacityError, CapacityResult};
use crate::core::hypervisor::HypervisorType;

/// Values explicitly configured at one scope instance. Absent fields fall through to the next scope.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ScopeOverrides {
    #[serde(rename = "cpu.overprovisioning.factor", skip_serializing_if = "Option::is_none")]
    pub cpu_overprovisioning_factor: Option<f64>,
    #[serde(rename = "mem.overprovisioning.factor", skip_serializing_if = "Option::is_none")]
    pub mem_overprovisioning_factor: Option<f64>,
    #[serde(rename = "storage.overprovisioning.factor", skip_serializing_if = "Option::is_none")]
    pub storage_overprovisioning_factor: Option<f64>,
    #[serde(rename = "pool.storage.capacity.disablethreshold", skip_serializing_if = "Option::is_none")]
    pub storage_capacity_disable_threshold: Option<f64>,
    #[serde(
        rename = "pool.storage.allocated.capacity.disablethreshold",
        skip_serializing_if = "Option::is_none"
    )]
    pub storage_allocated_capacity_disable_threshold: Option<f64>,
    #[serde(
        rename = "pool.storage.allocated.resize.capacity.disablethreshold",
        skip_serializing_if = "Option::is_none"
    )]
    pub storage_allocated_resize_capacity_disable_threshold: Option<f64>,
    #[serde(rename = "secondary.storage.capacity.threshold", skip_serializing_if = "Option::is_none")]
    pub secondary_storage_capacity_threshold: Option<f64>,
    #[serde(
        rename = "cluster.cpu.allocated.capacity.disablethreshold",
        skip_serializing_if = "Option::is_none"
    )]
    pub cluster_cpu_capacity_disable_threshold: Option<f64>,
    #[serde(
        rename = "cluster.memory.allocated.capacity.disablethreshold",
        skip_serializing_if = "Option::is_none"
    )]
    pub cluster_memory_capacity_disable_threshold: Option<f64>,
    #[serde(rename = "cluster.storage.operations.exclude", skip_serializing_if = "Option::is_none")]
    pub storage_operations_exclude_cluster: Option<bool>,
    #[serde(rename = "capacity.calculate.workers", skip_serializing_if = "Option::is_none")]
    pub capacity_calculate_workers: Option<usize>,
}

impl ScopeOverrides {
    /// Returns the value configured for the key at this scope, if any.
    pub fn get(&self, key: ConfigKey) -> Option<ConfigValue> {
        match key {
            ConfigKey::CpuOverprovisioningFactor => self.cpu_overprovisioning_factor.map(ConfigValue::Number),
            ConfigKey::MemOverprovisioningFactor => self.mem_overprovisioning_factor.map(ConfigValue::Number),
            ConfigKey::StorageOverprovisioningFactor => self.storage_overprovisioning_factor.map(ConfigValue::Number),
            ConfigKey::StorageCapacityDisableThreshold => {
                self.storage_capacity_disable_threshold.map(ConfigValue::Number)
            }
            ConfigKey::StorageAllocatedCapacityDisableThreshold => {
                self.storage_allocated_capacity_disable_threshold.map(ConfigValue::Number)
            }
            ConfigKey::StorageAllocatedResizeCapacityDisableThreshold => self
                .storage_allocated_resize_capacity_disable_threshold
                .map(ConfigValue::Number),
            ConfigKey::SecondaryStorageCapacityThreshold => {
                self.secondary_storage_capacity_threshold.map(ConfigValue::Number)
            }
            ConfigKey::ClusterCpuCapacityDisableThreshold => {
                self.cluster_cpu_capacity_disable_threshold.map(ConfigValue::Number)
            }
            ConfigKey::ClusterMemoryCapacityDisableThreshold => {
                self.cluster_memory_capacity_disable_threshold.map(ConfigValue::Number)
            }
            ConfigKey::StorageOperationsExcludeCluster => {
                self.storage_operations_exclude_cluster.map(ConfigValue::Flag)
            }
            ConfigKey::CapacityCalculateWorkers => self.capacity_calculate_workers.map(ConfigValue::Count),
        }
    }

    /// Stores the value for the key. The value must already be validated.
    pub fn set(&mut self, key: ConfigKey, value: ConfigValue) {
        match key {
            ConfigKey::CpuOverprovisioningFactor => self.cpu_overprovisioning_factor = Some(value.as_f64()),
            ConfigKey::MemOverprovisioningFactor => self.mem_overprovisioning_factor = Some(value.as_f64()),
            ConfigKey::StorageOverprovisioningFactor => self.storage_overprovisioning_factor = Some(value.as_f64()),
            ConfigKey::StorageCapacityDisableThreshold => {
                self.storage_capacity_disable_threshold = Some(value.as_f64())
            }
            ConfigKey::StorageAllocatedCapacityDisableThreshold => {
                self.storage_allocated_capacity_disable_threshold = Some(value.as_f64())
            }
            ConfigKey::StorageAllocatedResizeCapacityDisableThreshold => {
                self.storage_allocated_resize_capacity_disable_threshold = Some(value.as_f64())
            }
            ConfigKey::SecondaryStorageCapacityThreshold => {
                self.secondary_storage_capacity_threshold = Some(value.as_f64())
            }
            ConfigKey::ClusterCpuCapacityDisableThreshold => {
                self.cluster_cpu_capacity_disable_threshold = Some(value.as_f64())
            }
            ConfigKey::ClusterMemoryCapacityDisableThreshold => {
                self.cluster_memory_capacity_disable_threshold = Some(value.as_f64())
            }
            ConfigKey::StorageOperationsExcludeCluster => {
                self.storage_operations_exclude_cluster = Some(value.as_bool())
            }
            ConfigKey::CapacityCalculateWorkers => self.capacity_calculate_workers = Some(value.as_count()),
        }
    }

    /// Drops the value configured for the key at this scope.
    pub fn clear(&mut self, key: ConfigKey) {
        match key {
            ConfigKey::CpuOverprovisioningFactor => self.cpu_overprovisioning_factor = None,
            ConfigKey::MemOverprovisioningFactor => self.mem_overprovisioning_factor = None,
            ConfigKey::StorageOverprovisioningFactor => self.storage_overprovisioning_factor = None,
            ConfigKey::StorageCapacityDisableThreshold => self.storage_capacity_disable_threshold = None,
            ConfigKey::StorageAllocatedCapacityDisableThreshold => {
                self.storage_allocated_capacity_disable_threshold = None
            }
            ConfigKey::StorageAllocatedResizeCapacityDisableThreshold => {
                self.storage_allocated_resize_capacity_disable_threshold = None
            }
            ConfigKey::SecondaryStorageCapacityThreshold => self.secondary_storage_capacity_threshold = None,
            ConfigKey::ClusterCpuCapacityDisableThreshold => self.cluster_cpu_capacity_disable_threshold = None,
            ConfigKey::ClusterMemoryCapacityDisableThreshold => self.cluster_memory_capacity_disable_threshold = None,
            ConfigKey::StorageOperationsExcludeCluster => self.storage_operations_exclude_cluster = None,
            ConfigKey::CapacityCalculateWorkers => self.capacity_calculate_workers = None,
        }
    }

    fn validate(&self, scope: ResourceScope, label: &str) -> CapacityResult<()> {
        for key in ConfigKey::ALL {
            if let Some(value) = self.get(key) {
                if !key.allowed_at(scope) {
                    return Err(CapacityError::InvalidConfig(format!(
                        "{} can't be overridden at {}",
                        key, label
                    )));
                }
                key.validate(value)?;
            }
        }
        Ok(())
    }
}

/// Holds raw capacity config parsed from YAML file.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
struct RawCapacityConfig {
    pub global: Option<ScopeOverrides>,
    pub zones: Option<IndexMap<u32, ScopeOverrides>>,
    pub clusters: Option<IndexMap<u32, ScopeOverrides>>,
    pub pools: Option<IndexMap<u32, ScopeOverrides>>,
    pub image_stores: Option<IndexMap<u32, ScopeOverrides>>,
    pub guest_limits: Option<IndexMap<HypervisorType, u32>>,
}

/// Represents capacity configuration.
///
/// Instances are treated as immutable snapshots once handed to the
/// [`ConfigResolver`](crate::core::config::resolver::ConfigResolver).
#[derive(Debug, Default, PartialEq, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CapacityConfig {
    /// Values overriding built-in key defaults everywhere.
    pub global: ScopeOverrides,
    /// Overrides per zone ID.
    pub zones: IndexMap<u32, ScopeOverrides>,
    /// Overrides per cluster ID.
    pub clusters: IndexMap<u32, ScopeOverrides>,
    /// Overrides per storage pool ID.
    pub pools: IndexMap<u32, ScopeOverrides>,
    /// Overrides per image store ID.
    pub image_stores: IndexMap<u32, ScopeOverrides>,
    /// Maximum running guests per host, by hypervisor.
    pub guest_limits: IndexMap<HypervisorType, u32>,
}

impl CapacityConfig {
    /// Creates config with built-in defaults and no overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates capacity config by reading values from YAML file
    /// (uses default values if some parameters are absent).
    pub fn from_file(file_name: &str) -> CapacityResult<Self> {
        let content = std::fs::read_to_string(file_name).map_err(|source| CapacityError::ConfigRead {
            path: file_name.to_string(),
            source,
        })?;
        let raw: RawCapacityConfig = serde_yaml::from_str(&content).map_err(|source| CapacityError::ConfigParse {
            path: file_name.to_string(),
            source,
        })?;

        let config = Self {
            global: raw.global.unwrap_or_default(),
            zones: raw.zones.unwrap_or_default(),
            clusters: raw.clusters.unwrap_or_default(),
            pools: raw.pools.unwrap_or_default(),
            image_stores: raw.image_stores.unwrap_or_default(),
            guest_limits: raw.guest_limits.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges and that every override sits at a scope its key supports.
    pub fn validate(&self) -> CapacityResult<()> {
        self.global.validate(ResourceScope::Global, "global scope")?;
        let tables = [
            (ResourceScope::Zone, "zone", &self.zones),
            (ResourceScope::Cluster, "cluster", &self.clusters),
            (ResourceScope::StoragePool, "pool", &self.pools),
            (ResourceScope::ImageStore, "image store", &self.image_stores),
        ];
        for (scope, name, table) in tables {
            for (id, overrides) in table {
                overrides.validate(scope, &format!("{} #{}", name, id))?;
            }
        }
        if let Some((hypervisor, _)) = self.guest_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(CapacityError::InvalidConfig(format!(
                "guest limit for {} must be positive",
                hypervisor
            )));
        }
        Ok(())
    }

    fn overrides_at(&self, scope: &ScopeRef) -> Option<&ScopeOverrides> {
        match scope {
            ScopeRef::Global => Some(&self.global),
            ScopeRef::Zone(id) => self.zones.get(id),
            ScopeRef::Cluster(id) => self.clusters.get(id),
            ScopeRef::StoragePool { id, .. } => self.pools.get(id),
            ScopeRef::ImageStore(id) => self.image_stores.get(id),
        }
    }

    /// Returns overrides for the scope instance, creating an empty entry if needed.
    /// The `id` is ignored for the global scope.
    pub fn overrides_mut(&mut self, scope: ResourceScope, id: u32) -> &mut ScopeOverrides {
        match scope {
            ResourceScope::Global => &mut self.global,
            ResourceScope::Zone => self.zones.entry(id).or_default(),
            ResourceScope::Cluster => self.clusters.entry(id).or_default(),
            ResourceScope::StoragePool => self.pools.entry(id).or_default(),
            ResourceScope::ImageStore => self.image_stores.entry(id).or_default(),
        }
    }

    /// Resolves the effective value of the key for the scope instance.
    ///
    /// Walks the scope chain from the most specific level to global, skipping levels at which the key can't be set,
    /// and returns the first configured value. Unknown scope IDs simply have no overrides.
    pub fn resolve(&self, key: ConfigKey, scope: ScopeRef) -> ConfigValue {
        scope
            .chain()
            .iter()
            .filter(|level| key.allowed_at(level.scope()))
            .find_map(|level| self.overrides_at(level).and_then(|overrides| overrides.get(key)))
            .unwrap_or_else(|| key.default_value())
    }

    /// Sets an override after checking the value and the scope.
    pub fn set_override(
        &mut self,
        scope: ResourceScope,
        id: u32,
        key: ConfigKey,
        value: ConfigValue,
    ) -> CapacityResult<()> {
        if !key.allowed_at(scope) {
            return Err(CapacityError::InvalidConfig(format!(
                "{} can't be overridden at {:?} scope",
                key, scope
            )));
        }
        key.validate(value)?;
        self.overrides_mut(scope, id).set(key, value);
        Ok(())
    }

    /// Applies overrides written as `scope[key=value,...]`.
    ///
    /// Scope is `global`, `zone:ID`, `cluster:ID`, `pool:ID` or `image_store:ID`. Example:
    /// `cluster:3[cpu.overprovisioning.factor=2.0,mem.overprovisioning.factor=1.5]`.
    /// Nothing is applied if any of the options is invalid.
    pub fn apply_options(&mut self, config_str: &str) -> CapacityResult<()> {
        let (scope_str, options) = parse_config_value(config_str)?;
        let (scope, id) = parse_scope(scope_str)?;
        let options = options.ok_or_else(|| CapacityError::InvalidConfig(format!("no options in '{}'", config_str)))?;

        let mut updated = self.clone();
        for (name, value) in parse_options(options)? {
            let key = name.parse::<ConfigKey>()?;
            let value = key.parse_value(&value)?;
            updated.set_override(scope, id, key, value)?;
        }
        *self = updated;
        Ok(())
    }

    /// Returns the guest ceiling for hosts running the hypervisor.
    pub fn guest_limit(&self, hypervisor: HypervisorType) -> u32 {
        self.guest_limits
            .get(&hypervisor)
            .copied()
            .unwrap_or_else(|| hypervisor.default_guest_limit())
    }
}

fn parse_scope(scope_str: &str) -> CapacityResult<(ResourceScope, u32)> {
    let scope_str = scope_str.trim();
    if scope_str == "global" {
        return Ok((ResourceScope::Global, 0));
    }
    let invalid = || CapacityError::InvalidConfig(format!("bad scope '{}'", scope_str));
    let (name, id) = scope_str.split_once(':').ok_or_else(invalid)?;
    let id = id.trim().parse::<u32>().map_err(|_| invalid())?;
    let scope = match name.trim() {
        "zone" => ResourceScope::Zone,
        "cluster" => ResourceScope::Cluster,
        "pool" => ResourceScope::StoragePool,
        "image_store" => ResourceScope::ImageStore,
        _ => return Err(invalid()),
    };
    Ok((scope, id))
}
