//! Pure helpers shared by the reconcilers
//!
//! Everything in here is side-effect free and operates on already-fetched
//! objects, which is what makes the rollout math unit-testable without a
//! cluster.

mod annotations;
mod hash;
mod rollout;

pub use annotations::{
    copy_deployment_annotations, desired_replicas_annotation, max_replicas_annotation,
    replicas_annotations_need_update, revision_of, set_deployment_revision,
    set_new_machine_set_annotations, set_replicas_annotations,
};
pub use hash::{compute_hash, equal_ignore_hash, safe_encode};
pub use rollout::{
    deployment_complete, find_new_machine_set, find_old_machine_sets, find_one_active_or_latest,
    get_proportion, is_saturated, max_surge, max_unavailable, new_ms_new_replicas,
    resolve_int_or_percent,
};

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use rand::Rng;

use machina_common::crd::MachineSet;

/// Alphabet used for generated name suffixes; vowels are left out so no
/// English words can form
const NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Random 5-character suffix for machine names
pub fn rand_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..5)
        .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
        .collect()
}

/// Whether a label selector selects the given label set
///
/// Supports matchLabels and the four matchExpressions operators. An empty
/// selector selects nothing (the K8s convention for workload controllers).
pub fn selector_matches_labels(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> bool {
    let match_labels = selector.match_labels.as_ref();
    let match_expressions = selector.match_expressions.as_ref();

    let labels_empty = match_labels.map_or(true, |m| m.is_empty());
    let expressions_empty = match_expressions.map_or(true, |m| m.is_empty());
    if labels_empty && expressions_empty {
        return false;
    }

    if let Some(match_labels) = match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }

    if let Some(expressions) = match_expressions {
        for expr in expressions {
            let value = labels.get(&expr.key);
            let values = expr.values.as_deref().unwrap_or_default();
            let matches = match expr.operator.as_str() {
                "In" => value.map_or(false, |v| values.contains(v)),
                "NotIn" => value.map_or(true, |v| !values.contains(v)),
                "Exists" => value.is_some(),
                "DoesNotExist" => value.is_none(),
                _ => false,
            };
            if !matches {
                return false;
            }
        }
    }

    true
}

/// Creation timestamp of a set, distant past when unset
pub fn creation_time(ms: &MachineSet) -> Time {
    ms.metadata
        .creation_timestamp
        .clone()
        .unwrap_or_else(|| Time(chrono::DateTime::<chrono::Utc>::MIN_UTC))
}

/// Sort sets oldest first, name as tiebreaker for determinism
pub fn sort_by_creation_asc(sets: &mut [MachineSet]) {
    sets.sort_by(|a, b| {
        creation_time(a)
            .0
            .cmp(&creation_time(b).0)
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
}

/// Sort sets for proportional scaling: larger desired-replicas annotation
/// first, then larger max-replicas annotation, then older creation time.
/// The leftover from rounding is later assigned to index 0.
pub fn sort_by_desired_replicas_desc(sets: &mut [MachineSet]) {
    sets.sort_by(|a, b| {
        revision_sort_key(b)
            .cmp(&revision_sort_key(a))
            .then_with(|| creation_time(a).0.cmp(&creation_time(b).0))
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
}

fn revision_sort_key(ms: &MachineSet) -> (i64, i64) {
    let desired = annotations::desired_replicas_annotation(ms).unwrap_or(-1) as i64;
    let max = annotations::max_replicas_annotation(ms).unwrap_or(-1) as i64;
    (desired, max)
}

/// Sum of spec.replicas over the given sets
pub fn replica_count(sets: &[MachineSet]) -> i32 {
    sets.iter().map(|ms| ms.spec.replicas.unwrap_or(0)).sum()
}

/// Sum of status.replicas over the given sets
pub fn actual_replica_count(sets: &[MachineSet]) -> i32 {
    sets.iter()
        .map(|ms| ms.status.as_ref().map_or(0, |s| s.replicas))
        .sum()
}

/// Sum of status.readyReplicas over the given sets
pub fn ready_replica_count(sets: &[MachineSet]) -> i32 {
    sets.iter()
        .map(|ms| ms.status.as_ref().map_or(0, |s| s.ready_replicas))
        .sum()
}

/// Sum of status.availableReplicas over the given sets
pub fn available_replica_count(sets: &[MachineSet]) -> i32 {
    sets.iter()
        .map(|ms| ms.status.as_ref().map_or(0, |s| s.available_replicas))
        .sum()
}

/// Sets that still want replicas
pub fn filter_active(sets: &[MachineSet]) -> Vec<MachineSet> {
    sets.iter()
        .filter(|ms| ms.spec.replicas.unwrap_or(0) > 0)
        .cloned()
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    #[test]
    fn test_rand_suffix_shape() {
        let suffix = rand_suffix();
        assert_eq!(suffix.len(), 5);
        assert!(suffix.bytes().all(|b| NAME_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_empty_selector_selects_nothing() {
        let selector = LabelSelector::default();
        assert!(!selector_matches_labels(
            &selector,
            &testing::labels(&[("a", "b")])
        ));
    }

    #[test]
    fn test_match_labels_requires_all_pairs() {
        let selector = LabelSelector {
            match_labels: Some(testing::labels(&[("pool", "workers"), ("tier", "web")])),
            ..Default::default()
        };
        assert!(selector_matches_labels(
            &selector,
            &testing::labels(&[("pool", "workers"), ("tier", "web"), ("extra", "ok")])
        ));
        assert!(!selector_matches_labels(
            &selector,
            &testing::labels(&[("pool", "workers")])
        ));
    }

    #[test]
    fn test_match_expressions_operators() {
        let selector = LabelSelector {
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "pool".into(),
                    operator: "In".into(),
                    values: Some(vec!["workers".into(), "batch".into()]),
                },
                LabelSelectorRequirement {
                    key: "forbidden".into(),
                    operator: "DoesNotExist".into(),
                    values: None,
                },
            ]),
            ..Default::default()
        };
        assert!(selector_matches_labels(
            &selector,
            &testing::labels(&[("pool", "batch")])
        ));
        assert!(!selector_matches_labels(
            &selector,
            &testing::labels(&[("pool", "batch"), ("forbidden", "x")])
        ));
        assert!(!selector_matches_labels(
            &selector,
            &testing::labels(&[("pool", "db")])
        ));
    }

    #[test]
    fn test_replica_counters() {
        let sets = vec![
            testing::machine_set("a", 2, 100),
            testing::machine_set("b", 3, 50),
        ];
        assert_eq!(replica_count(&sets), 5);
        assert_eq!(actual_replica_count(&sets), 5);
        assert_eq!(available_replica_count(&sets), 5);

        let active = filter_active(&[
            testing::machine_set("a", 0, 100),
            testing::machine_set("b", 3, 50),
        ]);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].metadata.name.as_deref(), Some("b"));
    }

    #[test]
    fn test_sort_by_creation_is_stable_on_names() {
        let mut sets = vec![
            testing::machine_set("b", 1, 50),
            testing::machine_set("a", 1, 50),
            testing::machine_set("c", 1, 100),
        ];
        sort_by_creation_asc(&mut sets);
        let names: Vec<_> = sets.iter().map(|s| s.metadata.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }
}
