//! Hot-reloadable access to the capacity configuration.

use std::sync::Arc;

use log::{debug, info};
use parking_lot::RwLock;

use crate::core::common::{CapacityType, ResourceScope, ScopeRef};
use crate::core::config::capacity_config::CapacityConfig;
use crate::core::config::keys::{ConfigKey, ConfigValue};
use crate::core::error::CapacityResult;
use crate::core::hypervisor::HypervisorType;

/// Resolves effective configuration values for scopes.
///
/// The configuration is kept as an immutable snapshot behind a lock that is held only to clone or replace the `Arc`.
/// Readers resolve against the snapshot they grabbed, so a concurrent reload is never observed half-applied. Updates
/// are copy-on-write: a modified clone is validated and swapped in.
pub struct ConfigResolver {
    snapshot: RwLock<Arc<CapacityConfig>>,
}

impl ConfigResolver {
    pub fn new(config: CapacityConfig) -> CapacityResult<Self> {
        config.validate()?;
        Ok(Self {
            snapshot: RwLock::new(Arc::new(config)),
        })
    }

    /// Returns the current configuration snapshot.
    pub fn snapshot(&self) -> Arc<CapacityConfig> {
        self.snapshot.read().clone()
    }

    /// Replaces the configuration. An invalid config is rejected and the current one stays in effect.
    pub fn reload(&self, config: CapacityConfig) -> CapacityResult<()> {
        config.validate()?;
        *self.snapshot.write() = Arc::new(config);
        info!("capacity configuration reloaded");
        Ok(())
    }

    /// Sets a single override. Concurrent updates are serialized so none of them is lost.
    pub fn set_override(
        &self,
        scope: ResourceScope,
        id: u32,
        key: ConfigKey,
        value: ConfigValue,
    ) -> CapacityResult<()> {
        let mut guard = self.snapshot.write();
        let mut updated = CapacityConfig::clone(&guard);
        updated.set_override(scope, id, key, value)?;
        *guard = Arc::new(updated);
        debug!("{} set to {:?} at {:?} #{}", key, value, scope, id);
        Ok(())
    }

    /// Applies overrides given as an option string, see [`CapacityConfig::apply_options`].
    pub fn apply_options(&self, config_str: &str) -> CapacityResult<()> {
        let mut guard = self.snapshot.write();
        let mut updated = CapacityConfig::clone(&guard);
        updated.apply_options(config_str)?;
        *guard = Arc::new(updated);
        debug!("applied configuration overrides {}", config_str);
        Ok(())
    }

    pub fn resolve(&self, key: ConfigKey, scope: ScopeRef) -> ConfigValue {
        self.snapshot().resolve(key, scope)
    }

    pub fn number(&self, key: ConfigKey, scope: ScopeRef) -> f64 {
        self.resolve(key, scope).as_f64()
    }

    pub fn flag(&self, key: ConfigKey, scope: ScopeRef) -> bool {
        self.resolve(key, scope).as_bool()
    }

    /// Returns the overprovisioning factor of the capacity type, 1.0 for types that are never overprovisioned.
    pub fn overprovisioning_factor(&self, capacity_type: CapacityType, scope: ScopeRef) -> f64 {
        match ConfigKey::overprovisioning_for(capacity_type) {
            Some(key) => self.number(key, scope),
            None => 1.0,
        }
    }

    pub fn guest_limit(&self, hypervisor: HypervisorType) -> u32 {
        self.snapshot().guest_limit(hypervisor)
    }

    /// Number of workers used by the capacity recalculation sweep.
    pub fn calculate_workers(&self) -> usize {
        self.resolve(ConfigKey::CapacityCalculateWorkers, ScopeRef::Global).as_count()
    }
}
