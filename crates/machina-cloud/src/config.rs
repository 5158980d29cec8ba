//! The outer structure of `machine.spec.providerSpec.value`
//!
//! The core only parses the discriminators (`cloudProvider`,
//! `operatingSystem`) and hands `cloudProviderSpec` to the owning provider
//! untouched.

use serde::{Deserialize, Serialize};

use machina_common::{Error, Result};

/// All infrastructure backends the config schema knows about
///
/// Parsing accepts the full fleet so that a spec naming any of them decodes;
/// whether a backend is actually constructible is the registry's decision
/// (see [`crate::new_cloud_provider`]).
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum CloudProviderKind {
    /// Amazon Web Services
    #[serde(rename = "aws")]
    Aws,
    /// Microsoft Azure
    #[serde(rename = "azure")]
    Azure,
    /// Google Compute Engine
    #[serde(rename = "gce")]
    Gce,
    /// DigitalOcean droplets
    #[serde(rename = "digitalocean")]
    DigitalOcean,
    /// Hetzner Cloud servers
    #[serde(rename = "hetzner")]
    Hetzner,
    /// Linode instances
    #[serde(rename = "linode")]
    Linode,
    /// OpenStack
    #[serde(rename = "openstack")]
    OpenStack,
    /// Nutanix AHV
    #[serde(rename = "nutanix")]
    Nutanix,
    /// VMware vSphere
    #[serde(rename = "vsphere")]
    Vsphere,
    /// VMware Cloud Director
    #[serde(rename = "vmware-cloud-director")]
    VmwareCloudDirector,
    /// KubeVirt virtual machines
    #[serde(rename = "kubevirt")]
    KubeVirt,
    /// Anexia Engine
    #[serde(rename = "anexia")]
    Anexia,
    /// Vultr instances
    #[serde(rename = "vultr")]
    Vultr,
    /// Scaleway instances
    #[serde(rename = "scaleway")]
    Scaleway,
    /// Alibaba Cloud ECS
    #[serde(rename = "alibaba")]
    Alibaba,
    /// Equinix Metal (formerly Packet)
    #[serde(rename = "equinixmetal", alias = "packet")]
    EquinixMetal,
    /// In-memory provider for tests
    #[serde(rename = "fake")]
    Fake,
}

impl std::fmt::Display for CloudProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Gce => "gce",
            Self::DigitalOcean => "digitalocean",
            Self::Hetzner => "hetzner",
            Self::Linode => "linode",
            Self::OpenStack => "openstack",
            Self::Nutanix => "nutanix",
            Self::Vsphere => "vsphere",
            Self::VmwareCloudDirector => "vmware-cloud-director",
            Self::KubeVirt => "kubevirt",
            Self::Anexia => "anexia",
            Self::Vultr => "vultr",
            Self::Scaleway => "scaleway",
            Self::Alibaba => "alibaba",
            Self::EquinixMetal => "equinixmetal",
            Self::Fake => "fake",
        };
        write!(f, "{s}")
    }
}

impl CloudProviderKind {
    /// Reduce a node's `spec.providerID` to the bare instance identifier this
    /// provider's instances report, so the two can be compared.
    ///
    /// AWS encodes the zone (`aws:///eu-central-1a/i-0abc...`); Hetzner,
    /// OpenStack and Linode use plain scheme prefixes; everything else is
    /// compared verbatim.
    pub fn normalize_provider_id<'a>(&self, provider_id: &'a str) -> &'a str {
        match self {
            Self::Aws => provider_id
                .strip_prefix("aws:///")
                .and_then(|rest| rest.split_once('/').map(|(_zone, id)| id))
                .unwrap_or(provider_id),
            Self::Hetzner => provider_id.strip_prefix("hcloud://").unwrap_or(provider_id),
            Self::OpenStack => provider_id
                .strip_prefix("openstack:///")
                .unwrap_or(provider_id),
            Self::Linode => provider_id.strip_prefix("linode://").unwrap_or(provider_id),
            Self::DigitalOcean => provider_id
                .strip_prefix("digitalocean://")
                .unwrap_or(provider_id),
            Self::Vultr => provider_id.strip_prefix("vultr://").unwrap_or(provider_id),
            _ => provider_id,
        }
    }
}

/// Operating systems the userdata source can render bootstrap data for
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperatingSystem {
    /// Ubuntu LTS
    #[default]
    Ubuntu,
    /// Flatcar Container Linux
    Flatcar,
    /// Rocky Linux
    RockyLinux,
    /// Red Hat Enterprise Linux
    Rhel,
    /// Amazon Linux 2
    #[serde(rename = "amzn2")]
    AmazonLinux2,
}

/// Parsed outer provider configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Which backend owns this machine
    pub cloud_provider: CloudProviderKind,

    /// Provider-owned configuration blob, passed through untouched
    #[serde(default)]
    pub cloud_provider_spec: serde_json::Value,

    /// Operating system for userdata rendering
    #[serde(default)]
    pub operating_system: OperatingSystem,

    /// OS-specific settings, owned by the userdata source
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub operating_system_spec: serde_json::Value,

    /// SSH public keys installed on the instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_public_keys: Vec<String>,
}

impl ProviderConfig {
    /// Parse the outer provider config from a machine's `providerSpec.value`
    pub fn from_provider_spec(value: Option<&serde_json::Value>) -> Result<Self> {
        let value = value.ok_or_else(|| {
            Error::invalid_configuration("machine.spec.providerSpec.value is empty")
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            Error::invalid_configuration(format!("cannot parse providerSpec.value: {e}"))
        })
    }
}

/// Rewrite renamed cloud providers inside a raw `providerSpec.value`
///
/// Returns true when the value was changed and needs to be written back.
/// Currently covers the Packet → Equinix Metal rename.
pub fn migrate_provider_kind(value: &mut serde_json::Value) -> bool {
    match value.get("cloudProvider").and_then(|v| v.as_str()) {
        Some("packet") => {
            value["cloudProvider"] = serde_json::Value::String("equinixmetal".to_string());
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_config_parses_minimal_spec() {
        let raw = serde_json::json!({
            "cloudProvider": "digitalocean",
            "cloudProviderSpec": {"region": "fra1", "size": "s-2vcpu-4gb"},
            "operatingSystem": "ubuntu"
        });
        let config = ProviderConfig::from_provider_spec(Some(&raw)).unwrap();
        assert_eq!(config.cloud_provider, CloudProviderKind::DigitalOcean);
        assert_eq!(config.cloud_provider_spec["region"], "fra1");
    }

    #[test]
    fn test_missing_value_is_terminal() {
        let err = ProviderConfig::from_provider_spec(None).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_packet_alias_still_parses() {
        let raw = serde_json::json!({"cloudProvider": "packet"});
        let config = ProviderConfig::from_provider_spec(Some(&raw)).unwrap();
        assert_eq!(config.cloud_provider, CloudProviderKind::EquinixMetal);
    }

    #[test]
    fn test_packet_rename_mutation() {
        let mut value = serde_json::json!({"cloudProvider": "packet", "cloudProviderSpec": {}});
        assert!(migrate_provider_kind(&mut value));
        assert_eq!(value["cloudProvider"], "equinixmetal");

        // already-migrated specs are untouched
        assert!(!migrate_provider_kind(&mut value));
    }

    #[test]
    fn test_provider_id_normalization() {
        assert_eq!(
            CloudProviderKind::Aws.normalize_provider_id("aws:///eu-central-1a/i-0123456789"),
            "i-0123456789"
        );
        assert_eq!(
            CloudProviderKind::Hetzner.normalize_provider_id("hcloud://4242"),
            "4242"
        );
        assert_eq!(
            CloudProviderKind::OpenStack
                .normalize_provider_id("openstack:///b7e7cb35-2f4c-4b33-a7e0-c1c7e4e3761c"),
            "b7e7cb35-2f4c-4b33-a7e0-c1c7e4e3761c"
        );
        // azure ids are compared verbatim
        let azure = "azure:///subscriptions/abc/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/vm-0";
        assert_eq!(CloudProviderKind::Azure.normalize_provider_id(azure), azure);
    }
}
