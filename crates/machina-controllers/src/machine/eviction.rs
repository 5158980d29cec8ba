//! Pod eviction ahead of machine deletion
//!
//! Eviction only runs when it can possibly succeed: the machine must have a
//! bound, existing node, and the cluster must have somewhere to put the
//! evicted pods (another Ready node, or a provisioning machine whose node
//! is about to appear). After `skip_eviction_after` the machine is torn
//! down regardless, so a stuck eviction can never block deletion forever.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;

use machina_common::crd::Machine;
use machina_common::{MIRROR_POD_ANNOTATION, SAFE_TO_EVICT_ANNOTATION};

/// Whether the deletion flow should evict pods before tearing the VM down
pub fn should_evict(
    machine: &Machine,
    node: Option<&Node>,
    other_nodes: &[Node],
    other_machines: &[Machine],
    skip_eviction_after: std::time::Duration,
    now: DateTime<Utc>,
) -> bool {
    // Past the deadline the machine goes away no matter what.
    if !skip_eviction_after.is_zero() {
        if let Some(deleted_at) = machine.metadata.deletion_timestamp.as_ref() {
            let elapsed = now - deleted_at.0;
            if elapsed
                > chrono::Duration::from_std(skip_eviction_after).unwrap_or(chrono::Duration::MAX)
            {
                return false;
            }
        }
    }

    // Nothing to evict from.
    if machine.status.as_ref().and_then(|s| s.node_ref.as_ref()).is_none() || node.is_none() {
        return false;
    }

    let self_node = node.map(|n| n.name_any()).unwrap_or_default();

    // Evicted pods need a target: another Ready node, or capacity that is
    // already on its way (a live machine that has not bound a node yet).
    let other_ready_node = other_nodes
        .iter()
        .any(|n| n.name_any() != self_node && node_is_ready(n));
    let incoming_capacity = other_machines.iter().any(|m| {
        m.metadata.uid != machine.metadata.uid
            && m.metadata.deletion_timestamp.is_none()
            && m.status.as_ref().and_then(|s| s.node_ref.as_ref()).is_none()
            && !m.has_terminal_error()
    });

    other_ready_node || incoming_capacity
}

fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// The pods on a node that eviction must remove
///
/// Mirror pods live and die with the kubelet, DaemonSet pods reschedule
/// right back, already-deleting pods are in flight, and pods that opted out
/// via the safe-to-evict annotation are honored.
pub fn evictable_pods(pods: &[Pod]) -> Vec<&Pod> {
    pods.iter()
        .filter(|pod| {
            if pod.metadata.deletion_timestamp.is_some() {
                return false;
            }
            let annotations = pod.metadata.annotations.clone().unwrap_or_default();
            if annotations.contains_key(MIRROR_POD_ANNOTATION) {
                return false;
            }
            if annotations.get(SAFE_TO_EVICT_ANNOTATION).map(String::as_str) == Some("false") {
                return false;
            }
            let daemonset_owned = pod
                .metadata
                .owner_references
                .as_ref()
                .map(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
                .unwrap_or(false);
            !daemonset_owned
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus, ObjectReference};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
    use machina_common::crd::{MachineSpec, MachineStatus};
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn ready_node(name: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node.status = Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        node
    }

    fn deleting_machine(bound_node: Option<&str>, deleted_secs_ago: i64) -> Machine {
        let mut machine = Machine::new("victim", MachineSpec::default());
        machine.metadata.uid = Some("uid-victim".into());
        machine.metadata.deletion_timestamp =
            Some(Time(now() - chrono::Duration::seconds(deleted_secs_ago)));
        if let Some(node) = bound_node {
            machine.status = Some(MachineStatus {
                node_ref: Some(ObjectReference {
                    kind: Some("Node".into()),
                    name: Some(node.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        machine
    }

    fn provisioning_machine(name: &str) -> Machine {
        let mut machine = Machine::new(name, MachineSpec::default());
        machine.metadata.uid = Some(format!("uid-{name}"));
        machine
    }

    #[test]
    fn test_no_node_ref_means_no_eviction() {
        let machine = deleting_machine(None, 10);
        assert!(!should_evict(
            &machine,
            None,
            &[ready_node("other")],
            &[],
            Duration::from_secs(7200),
            now()
        ));
    }

    #[test]
    fn test_eviction_with_second_ready_node() {
        let machine = deleting_machine(Some("node-a"), 10);
        let node = ready_node("node-a");
        assert!(should_evict(
            &machine,
            Some(&node),
            &[ready_node("node-a"), ready_node("node-b")],
            &[],
            Duration::from_secs(7200),
            now()
        ));
    }

    #[test]
    fn test_lone_node_without_incoming_capacity_skips_eviction() {
        let machine = deleting_machine(Some("node-a"), 10);
        let node = ready_node("node-a");
        assert!(!should_evict(
            &machine,
            Some(&node),
            &[ready_node("node-a")],
            &[],
            Duration::from_secs(7200),
            now()
        ));
    }

    #[test]
    fn test_provisioning_machine_counts_as_incoming_capacity() {
        let machine = deleting_machine(Some("node-a"), 10);
        let node = ready_node("node-a");
        assert!(should_evict(
            &machine,
            Some(&node),
            &[ready_node("node-a")],
            &[provisioning_machine("replacement")],
            Duration::from_secs(7200),
            now()
        ));
    }

    #[test]
    fn test_skip_timeout_fires() {
        let machine = deleting_machine(Some("node-a"), 8000);
        let node = ready_node("node-a");
        assert!(!should_evict(
            &machine,
            Some(&node),
            &[ready_node("node-a"), ready_node("node-b")],
            &[],
            Duration::from_secs(7200),
            now()
        ));
    }

    #[test]
    fn test_zero_skip_timeout_disables_the_deadline() {
        let machine = deleting_machine(Some("node-a"), 1_000_000);
        let node = ready_node("node-a");
        assert!(should_evict(
            &machine,
            Some(&node),
            &[ready_node("node-a"), ready_node("node-b")],
            &[],
            Duration::ZERO,
            now()
        ));
    }

    #[test]
    fn test_evictable_pods_filtering() {
        let plain = Pod::default();

        let mut mirror = Pod::default();
        mirror.metadata.annotations = Some(
            [(MIRROR_POD_ANNOTATION.to_string(), "hash".to_string())]
                .into_iter()
                .collect(),
        );

        let mut daemon = Pod::default();
        daemon.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".into(),
            kind: "DaemonSet".into(),
            name: "logging".into(),
            uid: "uid-ds".into(),
            controller: Some(true),
            block_owner_deletion: None,
        }]);

        let mut pinned = Pod::default();
        pinned.metadata.annotations = Some(
            [(SAFE_TO_EVICT_ANNOTATION.to_string(), "false".to_string())]
                .into_iter()
                .collect(),
        );

        let mut going = Pod::default();
        going.metadata.deletion_timestamp = Some(Time(now()));

        let pods = vec![plain, mirror, daemon, pinned, going];
        assert_eq!(evictable_pods(&pods).len(), 1);
    }
}
