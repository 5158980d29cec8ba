//! Snapshot of a cloud instance as observed by a provider

use std::collections::BTreeMap;

/// Lifecycle status of a cloud instance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceStatus {
    /// The cloud accepted the create but the instance is not running yet
    Creating,
    /// The instance is up
    Running,
    /// Deletion is in progress on the cloud side
    Deleting,
    /// The provider could not map the cloud state to one of the above
    Unknown,
}

/// Point-in-time view of one cloud instance
///
/// Returned by [`crate::CloudProvider::get`] and
/// [`crate::CloudProvider::create`]. The machine reconciler uses
/// `provider_id` and `addresses` for node matching and requeues until
/// `status` is [`InstanceStatus::Running`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    /// Instance name as known to the cloud
    pub name: String,
    /// Cloud-assigned opaque instance id
    pub id: String,
    /// Provider id in the scheme the node's kubelet will report
    /// (e.g. `hcloud://12345`), when the provider has one
    pub provider_id: Option<String>,
    /// Map of address to address type ("InternalIP", "ExternalIP", "Hostname")
    pub addresses: BTreeMap<String, String>,
    /// Current lifecycle status
    pub status: InstanceStatus,
}

impl Instance {
    /// All addresses of the instance, regardless of type
    pub fn address_set(&self) -> impl Iterator<Item = &str> {
        self.addresses.keys().map(String::as_str)
    }

    /// Whether the instance is up and ready for a node to join
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }
}
