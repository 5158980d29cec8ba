//! MachineDeployment Custom Resource Definition
//!
//! The declarative top of the stack: a template plus a replica count. The
//! deployment reconciler materializes it into revisioned MachineSets and
//! drives rolling updates between them.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::MachineTemplateSpec;
use crate::Error;

/// The only rollout strategy currently supported
pub const ROLLING_UPDATE_STRATEGY: &str = "RollingUpdate";

/// Specification for a MachineDeployment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "MachineDeployment",
    plural = "machinedeployments",
    shortname = "md",
    status = "MachineDeploymentStatus",
    namespaced,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Paused","type":"boolean","jsonPath":".spec.paused"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentSpec {
    /// Desired total number of Machines across all owned sets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Label selector for owned MachineSets and Machines; defaulted from the
    /// template labels when empty
    #[serde(default)]
    pub selector: LabelSelector,

    /// Template for the current generation of Machines
    pub template: MachineTemplateSpec,

    /// Rollout strategy; only RollingUpdate is supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<MachineDeploymentStrategy>,

    /// Minimum seconds a node must be Ready before counting as available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_ready_seconds: Option<i32>,

    /// How many old (zero-replica) MachineSets to retain for rollback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,

    /// When true, only proportional scaling happens; no new sets are created
    /// and no rollout progresses
    #[serde(default)]
    pub paused: bool,

    /// Seconds without rollout progress before the deployment is considered stalled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_deadline_seconds: Option<i32>,
}

/// Rollout strategy for a MachineDeployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentStrategy {
    /// Strategy name; unknown values are configuration errors
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    /// RollingUpdate parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<MachineRollingUpdate>,
}

/// Budgets for a rolling update, absolute or percentage
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineRollingUpdate {
    /// How many machines may be unavailable below spec.replicas during rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,

    /// How many machines may exist above spec.replicas during rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrString>,
}

/// Status for a MachineDeployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentStatus {
    /// Generation of the spec this status was computed from
    #[serde(default)]
    pub observed_generation: i64,

    /// Actual (status) replicas summed over all owned sets
    #[serde(default)]
    pub replicas: i32,

    /// Actual replicas of the newest set
    #[serde(default)]
    pub updated_replicas: i32,

    /// Ready replicas summed over all owned sets
    #[serde(default)]
    pub ready_replicas: i32,

    /// Available replicas summed over all owned sets
    #[serde(default)]
    pub available_replicas: i32,

    /// max(total - available, 0)
    #[serde(default)]
    pub unavailable_replicas: i32,

    /// Incremented whenever a template-hash collision forces a new set name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,
}

impl MachineDeployment {
    /// Desired replicas; errors when unset, which only happens for objects
    /// that bypassed defaulting
    pub fn replicas(&self) -> crate::Result<i32> {
        self.spec.replicas.ok_or_else(|| {
            Error::internal_with_context(
                "machinedeployment",
                format!(
                    "spec.replicas for deployment {} is nil, this is unexpected",
                    self.metadata.name.as_deref().unwrap_or_default()
                ),
            )
        })
    }

    /// Whether the strategy resolves to RollingUpdate
    pub fn is_rolling_update(&self) -> bool {
        self.spec
            .strategy
            .as_ref()
            .and_then(|s| s.type_.as_deref())
            .map(|t| t == ROLLING_UPDATE_STRATEGY)
            .unwrap_or(false)
    }
}

/// Fill in every defaulted field of a MachineDeployment in place
///
/// Mirrors what the mutating webhook would do server-side, so reconcilers
/// can rely on the defaults even when the webhook is not deployed:
/// replicas=1, minReadySeconds=0, revisionHistoryLimit=1,
/// progressDeadlineSeconds=600, strategy=RollingUpdate(maxSurge=1,
/// maxUnavailable=0), selector defaulted from template labels.
pub fn populate_defaults(md: &mut MachineDeployment) {
    if md.spec.replicas.is_none() {
        md.spec.replicas = Some(1);
    }
    if md.spec.min_ready_seconds.is_none() {
        md.spec.min_ready_seconds = Some(0);
    }
    if md.spec.revision_history_limit.is_none() {
        md.spec.revision_history_limit = Some(1);
    }
    if md.spec.progress_deadline_seconds.is_none() {
        md.spec.progress_deadline_seconds = Some(600);
    }

    let strategy = md.spec.strategy.get_or_insert_with(Default::default);
    if strategy.type_.is_none() {
        strategy.type_ = Some(ROLLING_UPDATE_STRATEGY.to_string());
    }
    if strategy.type_.as_deref() == Some(ROLLING_UPDATE_STRATEGY) {
        let rolling = strategy.rolling_update.get_or_insert_with(Default::default);
        if rolling.max_surge.is_none() {
            rolling.max_surge = Some(IntOrString::Int(1));
        }
        if rolling.max_unavailable.is_none() {
            rolling.max_unavailable = Some(IntOrString::Int(0));
        }
    }

    let selector_empty = md.spec.selector.match_labels.as_ref().map_or(true, |m| m.is_empty())
        && md.spec.selector.match_expressions.as_ref().map_or(true, |m| m.is_empty());
    if selector_empty {
        let labels = md.spec.template.labels();
        if !labels.is_empty() {
            md.spec.selector.match_labels = Some(labels);
        }
    }
}

impl MachineDeploymentSpec {
    /// Validate the deployment spec after defaulting
    pub fn validate(&self, name: &str) -> crate::Result<()> {
        if self.replicas.map_or(false, |r| r < 0) {
            return Err(Error::validation_for_field(
                name,
                "spec.replicas",
                "replicas must not be negative",
            ));
        }

        let strategy_type = self.strategy.as_ref().and_then(|s| s.type_.as_deref());
        match strategy_type {
            Some(ROLLING_UPDATE_STRATEGY) | None => {}
            Some(other) => {
                return Err(Error::validation_for_field(
                    name,
                    "spec.strategy.type",
                    format!("unknown strategy {other:?}, only RollingUpdate is supported"),
                ));
            }
        }

        let template_labels = self.template.labels();
        if let Some(match_labels) = &self.selector.match_labels {
            for (k, v) in match_labels {
                if template_labels.get(k) != Some(v) {
                    return Err(Error::validation_for_field(
                        name,
                        "spec.selector",
                        format!("selector label {k}={v} not present on template"),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn deployment_with_labels(labels: &[(&str, &str)]) -> MachineDeployment {
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        MachineDeployment::new(
            "md-workers",
            MachineDeploymentSpec {
                template: MachineTemplateSpec {
                    metadata: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_defaults_fill_every_optional_field() {
        let mut md = deployment_with_labels(&[("pool", "workers")]);
        populate_defaults(&mut md);

        assert_eq!(md.spec.replicas, Some(1));
        assert_eq!(md.spec.min_ready_seconds, Some(0));
        assert_eq!(md.spec.revision_history_limit, Some(1));
        assert_eq!(md.spec.progress_deadline_seconds, Some(600));
        assert!(md.is_rolling_update());

        let rolling = md.spec.strategy.unwrap().rolling_update.unwrap();
        assert_eq!(rolling.max_surge, Some(IntOrString::Int(1)));
        assert_eq!(rolling.max_unavailable, Some(IntOrString::Int(0)));
    }

    #[test]
    fn test_empty_selector_defaults_to_template_labels() {
        let mut md = deployment_with_labels(&[("pool", "workers")]);
        populate_defaults(&mut md);

        let selector = md.spec.selector.match_labels.unwrap();
        assert_eq!(selector.get("pool").map(String::as_str), Some("workers"));
    }

    #[test]
    fn test_existing_selector_is_preserved() {
        let mut md = deployment_with_labels(&[("pool", "workers"), ("tier", "web")]);
        md.spec.selector.match_labels = Some(
            [("pool".to_string(), "workers".to_string())]
                .into_iter()
                .collect(),
        );
        populate_defaults(&mut md);

        assert_eq!(md.spec.selector.match_labels.unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_strategy_is_a_config_error() {
        let mut md = deployment_with_labels(&[("pool", "workers")]);
        populate_defaults(&mut md);
        md.spec.strategy.as_mut().unwrap().type_ = Some("Recreate".to_string());

        let err = md.spec.validate("md-workers").unwrap_err();
        assert!(err.to_string().contains("Recreate"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_selector_must_select_template() {
        let mut md = deployment_with_labels(&[("pool", "workers")]);
        md.spec.selector.match_labels = Some(
            [("pool".to_string(), "databases".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(md.spec.validate("md-workers").is_err());
    }
}
