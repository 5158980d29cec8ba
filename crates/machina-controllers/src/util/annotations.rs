//! Revision and replica annotations carried on MachineSets
//!
//! The deployment reconciler records three annotations on every owned set:
//! the monotonic rollout revision, the deployment's desired replicas and the
//! desired replicas plus surge budget. The latter two feed the proportional
//! scaling tie-breaks.

use std::collections::BTreeMap;

use machina_common::crd::{MachineDeployment, MachineSet};
use machina_common::{
    DESIRED_REPLICAS_ANNOTATION, MAX_REPLICAS_ANNOTATION, REVISION_ANNOTATION,
};

/// Annotations never copied from a deployment onto its sets
const SKIPPED_ANNOTATIONS: &[&str] = &[
    REVISION_ANNOTATION,
    DESIRED_REPLICAS_ANNOTATION,
    MAX_REPLICAS_ANNOTATION,
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision-history",
];

fn annotations_mut(ms: &mut MachineSet) -> &mut BTreeMap<String, String> {
    ms.metadata.annotations.get_or_insert_with(Default::default)
}

fn parse_i32_annotation(
    annotations: Option<&BTreeMap<String, String>>,
    key: &str,
) -> Option<i32> {
    annotations?.get(key)?.parse().ok()
}

/// Revision of a set from its annotation; 0 when missing or unparsable
pub fn revision_of(ms: &MachineSet) -> i64 {
    ms.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(REVISION_ANNOTATION))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// The desired-replicas annotation of a set, if present and numeric
pub fn desired_replicas_annotation(ms: &MachineSet) -> Option<i32> {
    parse_i32_annotation(ms.metadata.annotations.as_ref(), DESIRED_REPLICAS_ANNOTATION)
}

/// The max-replicas annotation of a set, if present and numeric
pub fn max_replicas_annotation(ms: &MachineSet) -> Option<i32> {
    parse_i32_annotation(ms.metadata.annotations.as_ref(), MAX_REPLICAS_ANNOTATION)
}

/// Whether the replica annotations disagree with the given targets
pub fn replicas_annotations_need_update(
    ms: &MachineSet,
    desired_replicas: i32,
    max_replicas: i32,
) -> bool {
    desired_replicas_annotation(ms) != Some(desired_replicas)
        || max_replicas_annotation(ms) != Some(max_replicas)
}

/// Write the replica annotations; returns true when something changed
pub fn set_replicas_annotations(
    ms: &mut MachineSet,
    desired_replicas: i32,
    max_replicas: i32,
) -> bool {
    if !replicas_annotations_need_update(ms, desired_replicas, max_replicas) {
        return false;
    }
    let annotations = annotations_mut(ms);
    annotations.insert(
        DESIRED_REPLICAS_ANNOTATION.to_string(),
        desired_replicas.to_string(),
    );
    annotations.insert(MAX_REPLICAS_ANNOTATION.to_string(), max_replicas.to_string());
    true
}

/// Copy the deployment's annotations onto the set, except the bookkeeping
/// ones the controller manages itself; returns true when something changed
pub fn copy_deployment_annotations(md: &MachineDeployment, ms: &mut MachineSet) -> bool {
    let mut changed = false;
    let source = md.metadata.annotations.clone().unwrap_or_default();
    for (k, v) in source {
        if SKIPPED_ANNOTATIONS.contains(&k.as_str()) {
            continue;
        }
        let annotations = annotations_mut(ms);
        if annotations.get(&k) != Some(&v) {
            annotations.insert(k, v);
            changed = true;
        }
    }
    changed
}

/// Bring a (new) machine set's annotations in line with its deployment:
/// copied annotations, the revision (only ever increased), and the replica
/// annotations. Returns true when the set was modified.
pub fn set_new_machine_set_annotations(
    md: &MachineDeployment,
    ms: &mut MachineSet,
    new_revision: i64,
    surge: i32,
) -> bool {
    let mut changed = copy_deployment_annotations(md, ms);

    // Revisions are monotonic; a stale reconcile must not roll one back.
    if revision_of(ms) < new_revision {
        annotations_mut(ms).insert(REVISION_ANNOTATION.to_string(), new_revision.to_string());
        changed = true;
    }

    let desired = md.spec.replicas.unwrap_or(0);
    if set_replicas_annotations(ms, desired, desired + surge) {
        changed = true;
    }
    changed
}

/// Record the rollout revision on the deployment itself; returns true when
/// the annotation changed
pub fn set_deployment_revision(md: &mut MachineDeployment, revision: &str) -> bool {
    let annotations = md.metadata.annotations.get_or_insert_with(Default::default);
    if annotations.get(REVISION_ANNOTATION).map(String::as_str) == Some(revision) {
        return false;
    }
    annotations.insert(REVISION_ANNOTATION.to_string(), revision.to_string());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::testing::{deployment, machine_set};

    #[test]
    fn test_revision_parse_defaults_to_zero() {
        let mut ms = machine_set("ms-1", 3, 100);
        assert_eq!(revision_of(&ms), 0);

        annotations_mut(&mut ms).insert(REVISION_ANNOTATION.to_string(), "7".to_string());
        assert_eq!(revision_of(&ms), 7);

        annotations_mut(&mut ms).insert(REVISION_ANNOTATION.to_string(), "junk".to_string());
        assert_eq!(revision_of(&ms), 0);
    }

    #[test]
    fn test_revision_never_decreases() {
        let md = deployment("md-1", 3);
        let mut ms = machine_set("ms-1", 3, 100);

        assert!(set_new_machine_set_annotations(&md, &mut ms, 5, 1));
        assert_eq!(revision_of(&ms), 5);

        // a stale reconcile carrying an older revision leaves 5 in place
        set_new_machine_set_annotations(&md, &mut ms, 3, 1);
        assert_eq!(revision_of(&ms), 5);
    }

    #[test]
    fn test_replica_annotations_round_trip() {
        let mut ms = machine_set("ms-1", 3, 100);
        assert!(replicas_annotations_need_update(&ms, 3, 4));
        assert!(set_replicas_annotations(&mut ms, 3, 4));
        assert_eq!(desired_replicas_annotation(&ms), Some(3));
        assert_eq!(max_replicas_annotation(&ms), Some(4));

        // second write is a no-op
        assert!(!set_replicas_annotations(&mut ms, 3, 4));
    }

    #[test]
    fn test_bookkeeping_annotations_are_not_copied() {
        let mut md = deployment("md-1", 3);
        md.metadata.annotations = Some(
            [
                (REVISION_ANNOTATION.to_string(), "999".to_string()),
                ("team".to_string(), "infra".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        let mut ms = machine_set("ms-1", 3, 100);

        assert!(copy_deployment_annotations(&md, &mut ms));
        let annotations = ms.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations.get("team").map(String::as_str), Some("infra"));
        assert!(annotations.get(REVISION_ANNOTATION).is_none());
    }

    #[test]
    fn test_deployment_revision_set_is_idempotent() {
        let mut md = deployment("md-1", 3);
        assert!(set_deployment_revision(&mut md, "4"));
        assert!(!set_deployment_revision(&mut md, "4"));
        assert!(set_deployment_revision(&mut md, "5"));
    }
}
