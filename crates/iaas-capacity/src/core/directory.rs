//! Read-only view of hosts, clusters and storage owned by the surrounding system.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::hypervisor::HypervisorType;
use crate::core::workload::{VirtualMachine, VmStatus, Volume};

/// Host state as reported by its agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostStatus {
    Up,
    Down,
    Disconnected,
    Maintenance,
}

/// Physical host: resource capacity and position in the scope hierarchy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: u32,
    pub name: String,
    pub zone_id: u32,
    pub cluster_id: u32,
    pub hypervisor: HypervisorType,
    /// Number of physical cores.
    pub cpu_cores: u32,
    /// Speed of each core in MHz.
    pub cpu_speed: u32,
    /// Memory in bytes.
    pub memory: u64,
    pub status: HostStatus,
}

impl Host {
    pub fn new(
        id: u32,
        name: &str,
        zone_id: u32,
        cluster_id: u32,
        cpu_cores: u32,
        cpu_speed: u32,
        memory: u64,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            zone_id,
            cluster_id,
            hypervisor: HypervisorType::Kvm,
            cpu_cores,
            cpu_speed,
            memory,
            status: HostStatus::Up,
        }
    }

    pub fn with_hypervisor(mut self, hypervisor: HypervisorType) -> Self {
        self.hypervisor = hypervisor;
        self
    }

    pub fn with_status(mut self, status: HostStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns raw CPU capacity in MHz.
    pub fn total_cpu(&self) -> u64 {
        self.cpu_cores as u64 * self.cpu_speed as u64
    }

    pub fn is_up(&self) -> bool {
        self.status == HostStatus::Up
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: u32,
    pub zone_id: u32,
    pub name: String,
}

/// Primary storage pool. Cluster-wide pools have `cluster_id` set, zone-wide pools don't.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoragePool {
    pub id: u32,
    pub zone_id: u32,
    pub cluster_id: Option<u32>,
    /// Raw capacity in bytes.
    pub capacity_bytes: u64,
    /// IOPS capacity, `None` if the pool does not account IOPS.
    pub capacity_iops: Option<u64>,
    /// Managed pools create a dedicated volume per VM instead of caching templates.
    pub managed: bool,
}

impl StoragePool {
    pub fn new(id: u32, zone_id: u32, capacity_bytes: u64) -> Self {
        Self {
            id,
            zone_id,
            cluster_id: None,
            capacity_bytes,
            capacity_iops: None,
            managed: false,
        }
    }

    pub fn in_cluster(mut self, cluster_id: u32) -> Self {
        self.cluster_id = Some(cluster_id);
        self
    }

    pub fn with_iops(mut self, capacity_iops: u64) -> Self {
        self.capacity_iops = Some(capacity_iops);
        self
    }

    pub fn managed(mut self) -> Self {
        self.managed = true;
        self
    }
}

/// Secondary storage holding templates, snapshots and ISOs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageStore {
    pub id: u32,
    pub zone_id: u32,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// Query interface for the entities whose capacity is accounted.
///
/// Implementations must be safe to query from many threads. Missing entities are reported as `None` or empty lists,
/// never as errors.
pub trait ResourceDirectory: Send + Sync {
    fn get_host(&self, host_id: u32) -> Option<Host>;

    fn get_cluster(&self, cluster_id: u32) -> Option<Cluster>;

    /// Returns all hosts of the cluster regardless of their status.
    fn get_cluster_members(&self, cluster_id: u32) -> Vec<Host>;

    fn get_pool(&self, pool_id: u32) -> Option<StoragePool>;

    fn get_image_store(&self, store_id: u32) -> Option<ImageStore>;

    fn list_hosts(&self) -> Vec<u32>;

    fn list_pools(&self) -> Vec<u32>;

    /// Checks whether the template is already present on the pool.
    fn template_on_pool(&self, template_id: u32, pool_id: u32) -> bool;

    /// Returns VMs placed on the host plus stopped VMs whose last host it is.
    fn host_workloads(&self, host_id: u32) -> Vec<VirtualMachine>;

    fn pool_volumes(&self, pool_id: u32) -> Vec<Volume>;

    /// Returns the number of guests currently occupying the host.
    fn running_guest_count(&self, host_id: u32) -> u32 {
        self.host_workloads(host_id)
            .iter()
            .filter(|vm| vm.host_id == Some(host_id) && !matches!(vm.status, VmStatus::Stopped | VmStatus::Destroyed))
            .count() as u32
    }
}

#[derive(Default)]
struct DirectoryState {
    hosts: BTreeMap<u32, Host>,
    clusters: BTreeMap<u32, Cluster>,
    pools: BTreeMap<u32, StoragePool>,
    image_stores: BTreeMap<u32, ImageStore>,
    pool_templates: BTreeMap<u32, BTreeSet<u32>>,
    vms: BTreeMap<u32, VirtualMachine>,
    volumes: BTreeMap<u32, Volume>,
}

/// Directory kept in memory. Used when embedding the capacity subsystem without an external inventory.
#[derive(Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the host.
    pub fn add_host(&self, host: Host) {
        self.state.write().hosts.insert(host.id, host);
    }

    pub fn remove_host(&self, host_id: u32) -> Option<Host> {
        self.state.write().hosts.remove(&host_id)
    }

    pub fn set_host_status(&self, host_id: u32, status: HostStatus) {
        if let Some(host) = self.state.write().hosts.get_mut(&host_id) {
            host.status = status;
        }
    }

    pub fn add_cluster(&self, cluster: Cluster) {
        self.state.write().clusters.insert(cluster.id, cluster);
    }

    pub fn add_pool(&self, pool: StoragePool) {
        self.state.write().pools.insert(pool.id, pool);
    }

    pub fn remove_pool(&self, pool_id: u32) -> Option<StoragePool> {
        let mut state = self.state.write();
        state.pool_templates.remove(&pool_id);
        state.pools.remove(&pool_id)
    }

    pub fn add_image_store(&self, store: ImageStore) {
        self.state.write().image_stores.insert(store.id, store);
    }

    /// Records that the template has been copied to the pool.
    pub fn add_template_to_pool(&self, template_id: u32, pool_id: u32) {
        self.state
            .write()
            .pool_templates
            .entry(pool_id)
            .or_default()
            .insert(template_id);
    }

    /// Adds or replaces the VM.
    pub fn upsert_vm(&self, vm: VirtualMachine) {
        self.state.write().vms.insert(vm.id, vm);
    }

    pub fn remove_vm(&self, vm_id: u32) -> Option<VirtualMachine> {
        self.state.write().vms.remove(&vm_id)
    }

    /// Adds or replaces the volume.
    pub fn upsert_volume(&self, volume: Volume) {
        self.state.write().volumes.insert(volume.id, volume);
    }

    pub fn remove_volume(&self, volume_id: u32) -> Option<Volume> {
        self.state.write().volumes.remove(&volume_id)
    }
}

impl ResourceDirectory for InMemoryDirectory {
    fn get_host(&self, host_id: u32) -> Option<Host> {
        self.state.read().hosts.get(&host_id).cloned()
    }

    fn get_cluster(&self, cluster_id: u32) -> Option<Cluster> {
        self.state.read().clusters.get(&cluster_id).cloned()
    }

    fn get_cluster_members(&self, cluster_id: u32) -> Vec<Host> {
        self.state
            .read()
            .hosts
            .values()
            .filter(|host| host.cluster_id == cluster_id)
            .cloned()
            .collect()
    }

    fn get_pool(&self, pool_id: u32) -> Option<StoragePool> {
        self.state.read().pools.get(&pool_id).cloned()
    }

    fn get_image_store(&self, store_id: u32) -> Option<ImageStore> {
        self.state.read().image_stores.get(&store_id).cloned()
    }

    fn list_hosts(&self) -> Vec<u32> {
        self.state.read().hosts.keys().cloned().collect()
    }

    fn list_pools(&self) -> Vec<u32> {
        self.state.read().pools.keys().cloned().collect()
    }

    fn template_on_pool(&self, template_id: u32, pool_id: u32) -> bool {
        self.state
            .read()
            .pool_templates
            .get(&pool_id)
            .map_or(false, |templates| templates.contains(&template_id))
    }

    fn host_workloads(&self, host_id: u32) -> Vec<VirtualMachine> {
        self.state
            .read()
            .vms
            .values()
            .filter(|vm| match vm.status {
                VmStatus::Destroyed => false,
                VmStatus::Stopped => vm.host_id.is_none() && vm.last_host_id == Some(host_id),
                _ => vm.host_id == Some(host_id),
            })
            .cloned()
            .collect()
    }

    fn pool_volumes(&self, pool_id: u32) -> Vec<Volume> {
        self.state
            .read()
            .volumes
            .values()
            .filter(|volume| volume.pool_id == Some(pool_id))
            .cloned()
            .collect()
    }
}
