//! Workloads whose capacity is accounted: virtual machines and volumes.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

const MB: u64 = 1024 * 1024;

/// Compute shape requested by a VM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceOffering {
    /// Number of vCPUs.
    pub cpu_num: u32,
    /// Required speed of each vCPU in MHz.
    pub cpu_speed: u32,
    /// Memory in MB.
    pub ram_size: u64,
}

impl ServiceOffering {
    pub fn new(cpu_num: u32, cpu_speed: u32, ram_size: u64) -> Self {
        Self {
            cpu_num,
            cpu_speed,
            ram_size,
        }
    }

    /// Returns aggregate CPU demand in MHz.
    pub fn cpu_requested(&self) -> u64 {
        self.cpu_num as u64 * self.cpu_speed as u64
    }

    /// Returns memory demand in bytes.
    pub fn ram_requested(&self) -> u64 {
        self.ram_size * MB
    }
}

/// Status of virtual machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmStatus {
    Starting,
    Running,
    Migrating,
    Stopping,
    Stopped,
    Destroyed,
}

impl Display for VmStatus {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            VmStatus::Starting => write!(f, "starting"),
            VmStatus::Running => write!(f, "running"),
            VmStatus::Migrating => write!(f, "migrating"),
            VmStatus::Stopping => write!(f, "stopping"),
            VmStatus::Stopped => write!(f, "stopped"),
            VmStatus::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Represents virtual machine (VM).
///
// The host fields follow the VM across its lifecycle: `host_id` is where it runs or is being started now,
// `last_host_id` is where it ran before, which may still hold a reservation for it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: u32,
    pub offering: ServiceOffering,
    pub status: VmStatus,
    pub host_id: Option<u32>,
    pub last_host_id: Option<u32>,
}

impl VirtualMachine {
    /// Creates a VM that is not placed anywhere yet.
    pub fn new(id: u32, offering: ServiceOffering) -> Self {
        Self {
            id,
            offering,
            status: VmStatus::Starting,
            host_id: None,
            last_host_id: None,
        }
    }

    /// Sets the current host.
    pub fn on_host(mut self, host_id: u32) -> Self {
        self.host_id = Some(host_id);
        self
    }

    /// Sets the host the VM previously ran on.
    pub fn with_last_host(mut self, host_id: u32) -> Self {
        self.last_host_id = Some(host_id);
        self
    }

    pub fn with_status(mut self, status: VmStatus) -> Self {
        self.status = status;
        self
    }

    pub fn cpu_requested(&self) -> u64 {
        self.offering.cpu_requested()
    }

    pub fn ram_requested(&self) -> u64 {
        self.offering.ram_requested()
    }
}

/// Template from which VM root volumes are created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: u32,
    /// Space the template takes once copied to a primary storage pool, in bytes.
    pub size: u64,
}

/// Volume allocated on a primary storage pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: u32,
    pub pool_id: Option<u32>,
    /// Provisioned size in bytes.
    pub size: u64,
    /// Provisioned IOPS, zero if the volume has no IOPS guarantee.
    pub iops: u64,
}

impl Volume {
    pub fn new(id: u32, size: u64, iops: u64) -> Self {
        Self {
            id,
            pool_id: None,
            size,
            iops,
        }
    }

    pub fn on_pool(mut self, pool_id: u32) -> Self {
        self.pool_id = Some(pool_id);
        self
    }
}
