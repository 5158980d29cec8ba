//! Machine Custom Resource Definition
//!
//! A Machine represents one desired Kubernetes worker node and the cloud VM
//! backing it. Machines are stamped out by MachineSets and driven through
//! their lifecycle by the machine reconciler alone.

use k8s_openapi::api::core::v1::{NodeAddress, NodeConfigSource, ObjectReference, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{MachineErrorReason, MachinePhase, MachineVersionInfo, ProviderSpec};

/// Specification for a Machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Machine",
    plural = "machines",
    shortname = "ma",
    status = "MachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.providerSpec.value.cloudProvider"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeRef.name"}"#,
    printcolumn = r#"{"name":"Kubelet","type":"string","jsonPath":".spec.versions.kubelet"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Opaque provider configuration; only the owning cloud provider parses it
    #[serde(default)]
    pub provider_spec: ProviderSpec,

    /// Requested component versions
    #[serde(default)]
    pub versions: MachineVersionInfo,

    /// Taints applied to the node on registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taints: Option<Vec<Taint>>,

    /// Optional kubelet config source for the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_source: Option<NodeConfigSource>,
}

/// Status for a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Reference to the Node this machine is bound to, once matched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,

    /// When the status was last written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<Time>,

    /// Versions actually observed on the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<MachineVersionInfo>,

    /// Addresses reported by the cloud instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<NodeAddress>>,

    /// Terminal error class; set means the machine is parked until spec change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<MachineErrorReason>,

    /// Human-readable terminal error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Provider-owned status blob, round-trip preserved by the core
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<serde_json::Value>,

    /// Observable lifecycle phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<MachinePhase>,
}

impl Machine {
    /// Whether the machine carries a terminal error
    pub fn has_terminal_error(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.error_reason.is_some() || s.error_message.is_some())
            .unwrap_or(false)
    }

    /// Name of the bound node, if any
    pub fn node_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.node_ref.as_ref())
            .and_then(|r| r.name.as_deref())
    }

    /// The cloud provider discriminator from the opaque provider spec
    pub fn cloud_provider_name(&self) -> Option<&str> {
        self.spec
            .provider_spec
            .value
            .as_ref()
            .and_then(|v| v.get("cloudProvider"))
            .and_then(|v| v.as_str())
    }
}
