use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Hypervisor running on a host. Determines the static ceiling on guests per host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorType {
    Kvm,
    XenServer,
    VMware,
    Hyperv,
    Lxc,
    Simulator,
}

impl HypervisorType {
    /// Returns the guest ceiling used when the configuration does not override it.
    pub fn default_guest_limit(&self) -> u32 {
        match self {
            HypervisorType::Kvm => 50,
            HypervisorType::XenServer => 500,
            HypervisorType::VMware => 1024,
            HypervisorType::Hyperv => 1024,
            HypervisorType::Lxc => 50,
            HypervisorType::Simulator => 50,
        }
    }
}

impl Display for HypervisorType {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            HypervisorType::Kvm => write!(f, "kvm"),
            HypervisorType::XenServer => write!(f, "xenserver"),
            HypervisorType::VMware => write!(f, "vmware"),
            HypervisorType::Hyperv => write!(f, "hyperv"),
            HypervisorType::Lxc => write!(f, "lxc"),
            HypervisorType::Simulator => write!(f, "simulator"),
        }
    }
}
