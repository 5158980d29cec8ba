//! MachineSet Custom Resource Definition
//!
//! A MachineSet is one versioned generation of a MachineDeployment's
//! template, analogous to a ReplicaSet: it holds the replica count for that
//! generation and owns the Machines stamped from it.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{MachineErrorReason, MachineTemplateSpec};
use crate::Error;

/// Specification for a MachineSet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "MachineSet",
    plural = "machinesets",
    shortname = "ms",
    status = "MachineSetStatus",
    namespaced,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    /// Desired number of Machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Minimum seconds a node must be Ready before its machine counts as available
    #[serde(default)]
    pub min_ready_seconds: i32,

    /// Which machines to remove first on scale-down: "Random" (default when
    /// empty), "Newest" or "Oldest". Anything else is a configuration error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_policy: Option<String>,

    /// Label selector for the Machines owned by this set; must match the
    /// template labels
    pub selector: LabelSelector,

    /// Template the set stamps Machines from
    pub template: MachineTemplateSpec,
}

/// Status for a MachineSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetStatus {
    /// Observed number of non-deleting Machines matching the selector
    #[serde(default)]
    pub replicas: i32,

    /// Machines whose labels are a superset of the template labels
    #[serde(default)]
    pub fully_labeled_replicas: i32,

    /// Machines whose node reports Ready
    #[serde(default)]
    pub ready_replicas: i32,

    /// Machines whose node has been Ready for at least minReadySeconds
    #[serde(default)]
    pub available_replicas: i32,

    /// Generation of the spec this status was computed from
    #[serde(default)]
    pub observed_generation: i64,

    /// Terminal error class bubbled up from a machine, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<MachineErrorReason>,

    /// Terminal error message bubbled up from a machine, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl MachineSet {
    /// Desired replicas; errors when unset, which only happens for objects
    /// that bypassed defaulting
    pub fn replicas(&self) -> crate::Result<i32> {
        self.spec.replicas.ok_or_else(|| {
            Error::internal_with_context(
                "machineset",
                format!(
                    "spec.replicas for machine set {} is nil, this is unexpected",
                    self.metadata.name.as_deref().unwrap_or_default()
                ),
            )
        })
    }

    /// Whether this set still wants or has machines
    pub fn is_active(&self) -> bool {
        self.spec.replicas.unwrap_or(0) > 0 || self.status.as_ref().map_or(0, |s| s.replicas) > 0
    }
}

impl MachineSetSpec {
    /// Validate the set spec: the selector must actually select the template
    pub fn validate(&self, name: &str) -> crate::Result<()> {
        let template_labels = self.template.labels();
        if let Some(match_labels) = &self.selector.match_labels {
            for (k, v) in match_labels {
                if template_labels.get(k) != Some(v) {
                    return Err(Error::validation_for_field(
                        name,
                        "spec.template.metadata.labels",
                        format!("selector label {k}={v} not present on template"),
                    ));
                }
            }
        }
        if let Some(policy) = self.delete_policy.as_deref() {
            if !matches!(policy, "" | "Random" | "Newest" | "Oldest") {
                return Err(Error::validation_for_field(
                    name,
                    "spec.deletePolicy",
                    format!("unsupported delete policy {policy:?}, must be one of 'Random', 'Newest', or 'Oldest'"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn labeled_spec(labels: &[(&str, &str)]) -> MachineSetSpec {
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        MachineSetSpec {
            replicas: Some(3),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: MachineTemplateSpec {
                metadata: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_selector_must_match_template_labels() {
        let spec = labeled_spec(&[("pool", "workers")]);
        assert!(spec.validate("ms-1").is_ok());

        let mut broken = spec.clone();
        broken.template.metadata.as_mut().unwrap().labels = Some(BTreeMap::new());
        let err = broken.validate("ms-1").unwrap_err();
        assert!(err.to_string().contains("not present on template"));
    }

    #[test]
    fn test_unknown_delete_policy_rejected() {
        let mut spec = labeled_spec(&[("pool", "workers")]);
        for ok in ["Random", "Newest", "Oldest", ""] {
            spec.delete_policy = Some(ok.to_string());
            assert!(spec.validate("ms-1").is_ok(), "{ok} should be accepted");
        }
        spec.delete_policy = Some("Cheapest".to_string());
        assert!(spec.validate("ms-1").is_err());
    }

    #[test]
    fn test_is_active_considers_spec_and_status() {
        let mut ms = MachineSet::new("ms-1", labeled_spec(&[("pool", "w")]));
        assert!(ms.is_active());

        ms.spec.replicas = Some(0);
        assert!(!ms.is_active());

        ms.status = Some(MachineSetStatus {
            replicas: 2,
            ..Default::default()
        });
        assert!(ms.is_active(), "still draining machines counts as active");
    }
}
