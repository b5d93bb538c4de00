//! Read-only admission checks for primary and secondary storage.

use log::debug;

use crate::core::admission::AdmissionChecker;
use crate::core::calculator::{effective_capacity, would_cross_threshold};
use crate::core::common::{CapacityType, EntityId, ScopeRef};
use crate::core::config::keys::ConfigKey;
use crate::core::directory::StoragePool;
use crate::core::workload::Template;

fn pool_scope(pool: &StoragePool) -> ScopeRef {
    ScopeRef::StoragePool {
        id: pool.id,
        zone_id: pool.zone_id,
    }
}

impl AdmissionChecker {
    /// Checks whether the cluster is excluded from storage operations.
    pub fn is_cluster_excluded_from_storage(&self, cluster_id: u32) -> bool {
        self.resolver
            .flag(ConfigKey::StorageOperationsExcludeCluster, ScopeRef::Cluster(cluster_id))
    }

    /// Returns the pool if it exists and its cluster is not excluded from storage operations.
    fn usable_pool(&self, pool_id: u32) -> Option<StoragePool> {
        let pool = self.directory.get_pool(pool_id)?;
        if let Some(cluster_id) = pool.cluster_id {
            if self.is_cluster_excluded_from_storage(cluster_id) {
                debug!("pool #{} skipped: cluster #{} is excluded from storage operations", pool_id, cluster_id);
                return None;
            }
        }
        Some(pool)
    }

    /// Returns storage committed to volumes on the pool, in bytes.
    ///
    /// If `template_for_vm_creation` is given and the pool would need a copy of the template to create a VM from it,
    /// the template size is added as well. Returns `None` for an unknown or unregistered pool.
    pub fn allocated_pool_capacity(&self, pool_id: u32, template_for_vm_creation: Option<&Template>) -> Option<u64> {
        let pool = self.directory.get_pool(pool_id)?;
        let allocated = self
            .read_record(EntityId::Pool(pool_id), CapacityType::StorageAllocated)?
            .allocated();
        let template_footprint = match template_for_vm_creation {
            Some(template) if !pool.managed && !self.directory.template_on_pool(template.id, pool_id) => template.size,
            _ => 0,
        };
        Some(allocated.saturating_add(template_footprint))
    }

    /// Returns bytes actually written on the pool.
    pub fn used_bytes(&self, pool_id: u32) -> u64 {
        self.read_record(EntityId::Pool(pool_id), CapacityType::StorageUsed)
            .map_or(0, |record| record.used)
    }

    /// Returns IOPS promised to volumes on the pool.
    pub fn used_iops(&self, pool_id: u32) -> u64 {
        self.read_record(EntityId::Pool(pool_id), CapacityType::StorageIops)
            .map_or(0, |record| record.allocated())
    }

    /// Checks that writing `requested_bytes` keeps the raw usage of the pool under its disable threshold.
    pub fn pool_has_space(&self, pool_id: u32, requested_bytes: u64) -> bool {
        let pool = match self.usable_pool(pool_id) {
            Some(pool) => pool,
            None => return false,
        };
        let record = match self.read_record(EntityId::Pool(pool_id), CapacityType::StorageUsed) {
            Some(record) => record,
            None => return false,
        };
        let threshold = self
            .resolver
            .number(ConfigKey::StorageCapacityDisableThreshold, pool_scope(&pool));
        let crossed = would_cross_threshold(record.used, requested_bytes, record.total, threshold);
        if crossed {
            debug!(
                "pool #{} usage {} + {} of {} crosses threshold {}",
                pool_id, record.used, requested_bytes, record.total, threshold
            );
        }
        !crossed
    }

    /// Checks that allocating `requested_bytes` keeps the allocated storage of the pool under its disable threshold.
    ///
    /// Allocation is measured against the overprovisioned capacity. Resizes use their own, usually higher,
    /// threshold.
    pub fn pool_has_allocated_space(&self, pool_id: u32, requested_bytes: u64, for_resize: bool) -> bool {
        let pool = match self.usable_pool(pool_id) {
            Some(pool) => pool,
            None => return false,
        };
        let record = match self.read_record(EntityId::Pool(pool_id), CapacityType::StorageAllocated) {
            Some(record) => record,
            None => return false,
        };
        let scope = pool_scope(&pool);
        let factor = self
            .resolver
            .overprovisioning_factor(CapacityType::StorageAllocated, scope);
        let threshold_key = if for_resize {
            ConfigKey::StorageAllocatedResizeCapacityDisableThreshold
        } else {
            ConfigKey::StorageAllocatedCapacityDisableThreshold
        };
        let threshold = self.resolver.number(threshold_key, scope);
        let effective_total = effective_capacity(record.total, factor);
        let crossed = would_cross_threshold(record.allocated(), requested_bytes, effective_total, threshold);
        if crossed {
            debug!(
                "pool #{} allocation {} + {} of {} crosses {} {}",
                pool_id,
                record.allocated(),
                requested_bytes,
                effective_total,
                threshold_key,
                threshold
            );
        }
        !crossed
    }

    /// Checks that the pool can guarantee `requested_iops` more. Pools without IOPS accounting always can.
    pub fn pool_has_iops(&self, pool_id: u32, requested_iops: u64) -> bool {
        let pool = match self.usable_pool(pool_id) {
            Some(pool) => pool,
            None => return false,
        };
        if pool.capacity_iops.is_none() || requested_iops == 0 {
            return true;
        }
        match self.read_record(EntityId::Pool(pool_id), CapacityType::StorageIops) {
            Some(record) => record.allocated().saturating_add(requested_iops) <= record.total,
            None => false,
        }
    }

    /// Checks that the image store is below the secondary storage threshold.
    pub fn image_store_has_space(&self, store_id: u32) -> bool {
        let store = match self.directory.get_image_store(store_id) {
            Some(store) => store,
            None => return false,
        };
        let threshold = self
            .resolver
            .number(ConfigKey::SecondaryStorageCapacityThreshold, ScopeRef::ImageStore(store_id));
        !would_cross_threshold(store.used_bytes, 0, store.total_bytes, threshold)
    }
}
