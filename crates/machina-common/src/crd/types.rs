//! Supporting types shared by the Machine, MachineSet and MachineDeployment CRDs

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Opaque, provider-owned machine configuration
///
/// The controller core never interprets `value` beyond extracting the
/// `cloudProvider` discriminator; everything else belongs to the owning
/// provider implementation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Raw provider configuration, round-trip preserved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Component versions requested for a machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineVersionInfo {
    /// Kubelet version the node should run (e.g. "1.31.2")
    pub kubelet: String,
}

/// Template from which MachineSets stamp out Machines
///
/// `metadata.labels` must be a superset of the owning object's selector.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateSpec {
    /// Labels and annotations copied onto stamped Machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,

    /// Machine spec copied onto stamped Machines
    pub spec: super::MachineSpec,
}

impl MachineTemplateSpec {
    /// Labels of the template, empty map when unset
    pub fn labels(&self) -> std::collections::BTreeMap<String, String> {
        self.metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default()
    }
}

/// Observable lifecycle phase of a Machine
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachinePhase {
    /// Cloud instance requested but not yet running
    Provisioning,
    /// Cloud instance up; node may or may not be bound yet
    Running,
    /// Deletion in progress (eviction, instance teardown, node removal)
    Terminating,
}

/// Terminal error classes surfaced on machine status
///
/// A machine carrying one of these is not retried until its spec changes;
/// the owning MachineSet counts it as unhealthy and schedules a replacement.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachineErrorReason {
    /// The provider spec is unusable (bad credentials, region, size, image)
    #[serde(rename = "InvalidConfigurationMachineError")]
    InvalidConfiguration,
    /// The cloud refused or failed instance creation in a way that will not heal
    #[serde(rename = "CreateMachineError")]
    Create,
    /// Instance deletion failed terminally
    #[serde(rename = "DeleteMachineError")]
    Delete,
    /// The cloud is out of capacity for the requested shape
    #[serde(rename = "InsufficientResourcesMachineError")]
    InsufficientResources,
}

impl std::fmt::Display for MachineErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidConfiguration => "InvalidConfigurationMachineError",
            Self::Create => "CreateMachineError",
            Self::Delete => "DeleteMachineError",
            Self::InsufficientResources => "InsufficientResourcesMachineError",
        };
        write!(f, "{s}")
    }
}
