//! MachineSet status calculation
//!
//! Counts are derived from observed machines and their nodes:
//! fully-labeled (template labels are a subset of the machine's), ready
//! (node reports Ready) and available (Ready for at least minReadySeconds).

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::debug;

use machina_common::crd::{Machine, MachineSet, MachineSetStatus};
use machina_common::Result;

use super::Context;

/// Compute the status of a set from its machines and their nodes
pub fn calculate_status(
    ms: &MachineSet,
    machines_with_nodes: &[(Machine, Option<Node>)],
    now: DateTime<Utc>,
) -> MachineSetStatus {
    let template_labels = ms.spec.template.labels();
    let min_ready_seconds = ms.spec.min_ready_seconds;

    let mut fully_labeled = 0;
    let mut ready = 0;
    let mut available = 0;
    let mut error_reason = None;
    let mut error_message = None;

    for (machine, node) in machines_with_nodes {
        let machine_labels = machine.metadata.labels.clone().unwrap_or_default();
        if template_labels
            .iter()
            .all(|(k, v)| machine_labels.get(k) == Some(v))
        {
            fully_labeled += 1;
        }

        // The first terminal machine error is surfaced on the set so the
        // deployment layer can see the generation is unhealthy.
        if error_reason.is_none() {
            if let Some(status) = machine.status.as_ref() {
                error_reason = status.error_reason;
                error_message = status.error_message.clone();
            }
        }

        if let Some(node) = node {
            if is_node_ready(node) {
                ready += 1;
                if is_node_available(node, min_ready_seconds, now) {
                    available += 1;
                }
            }
        }
    }

    MachineSetStatus {
        replicas: machines_with_nodes.len() as i32,
        fully_labeled_replicas: fully_labeled,
        ready_replicas: ready,
        available_replicas: available,
        observed_generation: ms.metadata.generation.unwrap_or(0),
        error_reason,
        error_message,
    }
}

/// Whether the node's Ready condition is True
pub fn is_node_ready(node: &Node) -> bool {
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

/// Whether the node has been Ready for at least `min_ready_seconds`
pub fn is_node_available(node: &Node, min_ready_seconds: i32, now: DateTime<Utc>) -> bool {
    if !is_node_ready(node) {
        return false;
    }
    if min_ready_seconds == 0 {
        return true;
    }

    let ready_since = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .and_then(|c| c.last_transition_time.as_ref());

    match ready_since {
        Some(since) => {
            since.0 + chrono::Duration::seconds(min_ready_seconds as i64) < now
        }
        None => false,
    }
}

/// Write the status back, retrying once on conflict with a fresh read
pub(crate) async fn update_machine_set_status(
    ms: &MachineSet,
    new_status: MachineSetStatus,
    ctx: &Context,
) -> Result<()> {
    let current = ms.status.clone().unwrap_or_default();
    // Steady state: same counts and the generation was already observed.
    if current.replicas == new_status.replicas
        && current.fully_labeled_replicas == new_status.fully_labeled_replicas
        && current.ready_replicas == new_status.ready_replicas
        && current.available_replicas == new_status.available_replicas
        && current.observed_generation == ms.metadata.generation.unwrap_or(0)
    {
        return Ok(());
    }

    debug!(
        replicas = new_status.replicas,
        ready = new_status.ready_replicas,
        available = new_status.available_replicas,
        "updating machine set status"
    );

    let mut target = ms.clone();
    target.status = Some(new_status.clone());
    match ctx.kube.update_machine_set_status(&target).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_kube_conflict() => {
            // One retry with a fresh resourceVersion; after that the
            // controller requeues with backoff.
            let namespace = ms.metadata.namespace.as_deref().unwrap_or_default();
            let Some(mut fresh) = ctx.kube.get_machine_set(namespace, &ms.name_any()).await?
            else {
                return Ok(());
            };
            fresh.status = Some(new_status);
            ctx.kube.update_machine_set_status(&fresh).await
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machineset::MockSetKubeClient;
    use crate::util::testing::machine_set;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use machina_common::crd::{MachineErrorReason, MachineSpec, MachineStatus};
    use machina_common::NoopEventPublisher;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn ready_node(ready_for_seconds: i64) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: "True".into(),
                    last_transition_time: Some(Time(
                        now() - chrono::Duration::seconds(ready_for_seconds),
                    )),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn unready_node() -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: "False".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn labeled_machine(ms: &MachineSet) -> Machine {
        let mut m = Machine::new("m", MachineSpec::default());
        m.metadata.labels = Some(ms.spec.template.labels());
        m
    }

    #[test]
    fn test_counts_split_by_readiness_and_min_ready() {
        let mut ms = machine_set("ms-1", 3, 100);
        ms.spec.min_ready_seconds = 60;
        ms.metadata.generation = Some(4);

        let machines = vec![
            (labeled_machine(&ms), Some(ready_node(300))), // ready + available
            (labeled_machine(&ms), Some(ready_node(10))),  // ready, too fresh
            (labeled_machine(&ms), Some(unready_node())),  // not ready
            (labeled_machine(&ms), None),                  // no node yet
        ];

        let status = calculate_status(&ms, &machines, now());
        assert_eq!(status.replicas, 4);
        assert_eq!(status.fully_labeled_replicas, 4);
        assert_eq!(status.ready_replicas, 2);
        assert_eq!(status.available_replicas, 1);
        assert_eq!(status.observed_generation, 4);
    }

    #[test]
    fn test_zero_min_ready_means_ready_is_available() {
        let ms = machine_set("ms-1", 1, 100);
        let machines = vec![(labeled_machine(&ms), Some(ready_node(1)))];

        let status = calculate_status(&ms, &machines, now());
        assert_eq!(status.ready_replicas, 1);
        assert_eq!(status.available_replicas, 1);
    }

    #[test]
    fn test_partially_labeled_machines_are_counted_separately() {
        let ms = machine_set("ms-1", 2, 100);
        let mut unlabeled = Machine::new("m-unlabeled", MachineSpec::default());
        unlabeled.metadata.labels = Some(Default::default());

        let machines = vec![
            (labeled_machine(&ms), None),
            (unlabeled, None),
        ];

        let status = calculate_status(&ms, &machines, now());
        assert_eq!(status.replicas, 2);
        assert_eq!(status.fully_labeled_replicas, 1);
    }

    #[test]
    fn test_terminal_machine_error_bubbles_to_set_status() {
        let ms = machine_set("ms-1", 1, 100);
        let mut broken = labeled_machine(&ms);
        broken.status = Some(MachineStatus {
            error_reason: Some(MachineErrorReason::InvalidConfiguration),
            error_message: Some("region not found".into()),
            ..Default::default()
        });

        let status = calculate_status(&ms, &[(broken, None)], now());
        assert_eq!(status.error_reason, Some(MachineErrorReason::InvalidConfiguration));
        assert_eq!(status.error_message.as_deref(), Some("region not found"));
    }

    #[tokio::test]
    async fn test_status_update_retries_once_on_conflict() {
        let mut ms = machine_set("ms-1", 2, 100);
        ms.metadata.generation = Some(3);

        let mut kube = MockSetKubeClient::new();
        let mut attempts = 0;
        kube.expect_update_machine_set_status().times(2).returning(
            move |_| {
                attempts += 1;
                if attempts == 1 {
                    Err(machina_common::Error::Kube {
                        source: kube::Error::Api(kube::core::ErrorResponse {
                            status: "Failure".into(),
                            message: "conflict".into(),
                            reason: "Conflict".into(),
                            code: 409,
                        }),
                    })
                } else {
                    Ok(())
                }
            },
        );
        let fresh = ms.clone();
        kube.expect_get_machine_set()
            .times(1)
            .returning(move |_, _| Ok(Some(fresh.clone())));

        let ctx = Context {
            kube: Arc::new(kube),
            events: Arc::new(NoopEventPublisher),
        };

        let new_status = MachineSetStatus {
            replicas: 5,
            ..Default::default()
        };
        update_machine_set_status(&ms, new_status, &ctx).await.unwrap();
    }
}
