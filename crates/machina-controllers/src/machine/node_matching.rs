//! Matching cloud instances to Node objects
//!
//! A Node belongs to a Machine when, in order: the node carries the owner
//! label with the machine's UID; its `spec.providerID` matches the
//! instance's (after provider-specific normalization); or one of the
//! instance addresses equals one of the node addresses. Hetzner nodes must
//! additionally match the instance name, since recycled private addresses
//! are common there.

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use machina_cloud::{CloudProviderKind, Instance};
use machina_common::crd::Machine;
use machina_common::NODE_OWNER_LABEL;

/// Find the node backing the machine, if it joined already
pub fn find_node_for_machine<'a>(
    machine: &Machine,
    instance: &Instance,
    kind: CloudProviderKind,
    nodes: &'a [Node],
) -> Option<&'a Node> {
    if let Some(node) = find_node_by_owner_label(machine, nodes) {
        return Some(node);
    }
    if let Some(node) = find_node_by_provider_id(instance, kind, nodes) {
        return Some(node);
    }
    find_node_by_addresses(instance, kind, nodes)
}

/// Match by the owner label written at binding time
pub fn find_node_by_owner_label<'a>(machine: &Machine, nodes: &'a [Node]) -> Option<&'a Node> {
    let uid = machine.metadata.uid.as_deref()?;
    nodes.iter().find(|node| {
        node.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(NODE_OWNER_LABEL))
            .map(String::as_str)
            == Some(uid)
    })
}

/// Match by normalized provider id; exactly one node must match
pub fn find_node_by_provider_id<'a>(
    instance: &Instance,
    kind: CloudProviderKind,
    nodes: &'a [Node],
) -> Option<&'a Node> {
    let instance_id = instance.provider_id.as_deref()?;
    let instance_id = kind.normalize_provider_id(instance_id);

    let mut matches = nodes.iter().filter(|node| {
        node.spec
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .map(|id| kind.normalize_provider_id(id) == instance_id)
            .unwrap_or(false)
    });

    let first = matches.next()?;
    if matches.next().is_some() {
        // ambiguous, let a later signal decide
        return None;
    }
    Some(first)
}

/// Match by address intersection; Hetzner additionally requires the node
/// name to equal the instance name
pub fn find_node_by_addresses<'a>(
    instance: &Instance,
    kind: CloudProviderKind,
    nodes: &'a [Node],
) -> Option<&'a Node> {
    nodes.iter().find(|node| {
        if kind == CloudProviderKind::Hetzner && node.name_any() != instance.name {
            return false;
        }
        let node_addresses = node
            .status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .map(|a| a.as_slice())
            .unwrap_or_default();
        node_addresses.iter().any(|node_addr| {
            (node_addr.type_ == "InternalIP" || node_addr.type_ == "ExternalIP")
                && instance.address_set().any(|a| a == node_addr.address)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeSpec, NodeStatus};
    use machina_cloud::InstanceStatus;
    use machina_common::crd::MachineSpec;
    use std::collections::BTreeMap;

    fn node(name: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node
    }

    fn node_with_provider_id(name: &str, provider_id: &str) -> Node {
        let mut node = node(name);
        node.spec = Some(NodeSpec {
            provider_id: Some(provider_id.to_string()),
            ..Default::default()
        });
        node
    }

    fn node_with_address(name: &str, address: &str, type_: &str) -> Node {
        let mut node = node(name);
        node.status = Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                address: address.to_string(),
                type_: type_.to_string(),
            }]),
            ..Default::default()
        });
        node
    }

    fn instance(name: &str, provider_id: Option<&str>, addresses: &[&str]) -> Instance {
        Instance {
            name: name.to_string(),
            id: "1".to_string(),
            provider_id: provider_id.map(String::from),
            addresses: addresses
                .iter()
                .map(|a| (a.to_string(), "InternalIP".to_string()))
                .collect(),
            status: InstanceStatus::Running,
        }
    }

    fn machine_with_uid(uid: &str) -> Machine {
        let mut machine = Machine::new("worker-0", MachineSpec::default());
        machine.metadata.uid = Some(uid.to_string());
        machine
    }

    #[test]
    fn test_owner_label_wins_over_everything() {
        let machine = machine_with_uid("uid-1");
        let mut labeled = node("labeled");
        labeled.metadata.labels = Some(BTreeMap::from([(
            NODE_OWNER_LABEL.to_string(),
            "uid-1".to_string(),
        )]));
        let by_address = node_with_address("by-address", "10.0.0.5", "InternalIP");

        let nodes = vec![by_address, labeled];
        let instance = instance("worker-0", None, &["10.0.0.5"]);

        let found =
            find_node_for_machine(&machine, &instance, CloudProviderKind::Fake, &nodes).unwrap();
        assert_eq!(found.name_any(), "labeled");
    }

    #[test]
    fn test_aws_provider_id_zone_prefix_is_stripped() {
        let machine = machine_with_uid("uid-1");
        let nodes = vec![node_with_provider_id(
            "ip-10-0-0-1",
            "aws:///eu-central-1a/i-0123456789abcdef0",
        )];
        let instance = instance("worker-0", Some("i-0123456789abcdef0"), &[]);

        let found =
            find_node_for_machine(&machine, &instance, CloudProviderKind::Aws, &nodes).unwrap();
        assert_eq!(found.name_any(), "ip-10-0-0-1");
    }

    #[test]
    fn test_ambiguous_provider_id_matches_nothing() {
        let nodes = vec![
            node_with_provider_id("node-a", "hcloud://42"),
            node_with_provider_id("node-b", "hcloud://42"),
        ];
        let instance = instance("worker-0", Some("hcloud://42"), &[]);

        assert!(find_node_by_provider_id(&instance, CloudProviderKind::Hetzner, &nodes).is_none());
    }

    #[test]
    fn test_address_fallback_matches_internal_ip() {
        let machine = machine_with_uid("uid-1");
        let nodes = vec![
            node_with_address("other", "10.0.0.9", "InternalIP"),
            node_with_address("mine", "10.0.0.5", "InternalIP"),
        ];
        let instance = instance("worker-0", None, &["10.0.0.5"]);

        let found =
            find_node_for_machine(&machine, &instance, CloudProviderKind::Fake, &nodes).unwrap();
        assert_eq!(found.name_any(), "mine");
    }

    #[test]
    fn test_hostname_type_addresses_do_not_match() {
        let nodes = vec![node_with_address("n", "worker-0", "Hostname")];
        let instance = instance("worker-0", None, &["worker-0"]);
        assert!(find_node_by_addresses(&instance, CloudProviderKind::Fake, &nodes).is_none());
    }

    #[test]
    fn test_hetzner_requires_name_match_on_address_fallback() {
        let nodes = vec![node_with_address("recycled-name", "10.0.0.5", "InternalIP")];
        let instance = instance("worker-hz-0", None, &["10.0.0.5"]);

        // address matches but the name does not: no binding
        assert!(find_node_by_addresses(&instance, CloudProviderKind::Hetzner, &nodes).is_none());

        let matching = vec![node_with_address("worker-hz-0", "10.0.0.5", "InternalIP")];
        assert!(find_node_by_addresses(&instance, CloudProviderKind::Hetzner, &matching).is_some());
    }

    #[test]
    fn test_no_signal_means_no_node() {
        let machine = machine_with_uid("uid-1");
        let nodes = vec![node_with_address("n", "10.9.9.9", "InternalIP")];
        let instance = instance("worker-0", None, &["10.0.0.5"]);

        assert!(
            find_node_for_machine(&machine, &instance, CloudProviderKind::Fake, &nodes).is_none()
        );
    }
}
