//! MachineSet controller
//!
//! Keeps the machine population of one set at `spec.replicas`: adopts
//! orphans that match the selector, releases machines that stopped
//! matching, creates replacements and picks scale-down victims by delete
//! priority.

mod delete_policy;
mod status;

pub use delete_policy::{machines_to_delete, DeletePolicy};
pub use status::calculate_status;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use machina_common::crd::{Machine, MachineSet};
use machina_common::metrics::ReconcileTimer;
use machina_common::{Error, EventPublisher, EventReason, Result};

use crate::machinedeployment::controller_of;
use crate::util;

/// Trait abstracting the Kubernetes operations the set reconciler needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SetKubeClient: Send + Sync {
    /// List machines in a namespace
    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>>;

    /// Create a machine
    async fn create_machine(&self, machine: &Machine) -> Result<Machine>;

    /// Update a machine (adoption/release writes)
    async fn update_machine(&self, machine: &Machine) -> Result<Machine>;

    /// Delete a machine; NotFound is not an error
    async fn delete_machine(&self, namespace: &str, name: &str) -> Result<()>;

    /// Get a node by name, None when absent
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Re-fetch the set (status conflict retry)
    async fn get_machine_set(&self, namespace: &str, name: &str) -> Result<Option<MachineSet>>;

    /// Write the set status subresource
    async fn update_machine_set_status(&self, ms: &MachineSet) -> Result<()>;
}

/// Real client implementation
pub struct SetKubeClientImpl {
    client: Client,
}

impl SetKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn machines(&self, namespace: &str) -> Api<Machine> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SetKubeClient for SetKubeClientImpl {
    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>> {
        Ok(self
            .machines(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn create_machine(&self, machine: &Machine) -> Result<Machine> {
        let namespace = machine.metadata.namespace.as_deref().unwrap_or_default();
        Ok(self
            .machines(namespace)
            .create(&PostParams::default(), machine)
            .await?)
    }

    async fn update_machine(&self, machine: &Machine) -> Result<Machine> {
        let namespace = machine.metadata.namespace.as_deref().unwrap_or_default();
        let name = machine.metadata.name.as_deref().unwrap_or_default();
        Ok(self
            .machines(namespace)
            .replace(name, &PostParams::default(), machine)
            .await?)
    }

    async fn delete_machine(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .machines(namespace)
            .delete(name, &Default::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(node) => Ok(Some(node)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_machine_set(&self, namespace: &str, name: &str) -> Result<Option<MachineSet>> {
        let api: Api<MachineSet> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(ms) => Ok(Some(ms)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_machine_set_status(&self, ms: &MachineSet) -> Result<()> {
        let namespace = ms.metadata.namespace.as_deref().unwrap_or_default();
        let name = ms.metadata.name.as_deref().unwrap_or_default();
        let api: Api<MachineSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": ms.status });
        api.patch_status(
            name,
            &PatchParams::apply("machina-machineset-controller"),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Shared context for the set reconciler
pub struct Context {
    /// Kubernetes access
    pub kube: Arc<dyn SetKubeClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Production context from a kube client
    pub fn new(client: Client, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            kube: Arc::new(SetKubeClientImpl::new(client)),
            events,
        }
    }
}

/// Reconcile one MachineSet
#[instrument(skip(ms, ctx), fields(machineset = %ms.name_any()))]
pub async fn reconcile(ms: Arc<MachineSet>, ctx: Arc<Context>) -> Result<Action> {
    let timer = ReconcileTimer::start("machineset");
    let result = reconcile_inner(&ms, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(e) => timer.error(if e.is_retryable() { "transient" } else { "terminal" }),
    }
    result
}

async fn reconcile_inner(ms: &MachineSet, ctx: &Context) -> Result<Action> {
    let name = ms.name_any();

    if ms.metadata.deletion_timestamp.is_some() {
        debug!("machine set is being deleted, nothing to reconcile");
        return Ok(Action::await_change());
    }

    if let Err(e) = ms.spec.validate(&name) {
        warn!(error = %e, "machine set validation failed");
        ctx.events
            .publish(
                &ms.object_ref(&()),
                EventReason::ValidationFailed,
                Some(e.to_string()),
            )
            .await;
        return Ok(Action::await_change());
    }

    let filtered = claim_machines(ms, ctx).await?;

    // Machines already on their way out do not count towards the
    // population; their replacement starts immediately.
    let active: Vec<Machine> = filtered
        .iter()
        .filter(|m| m.metadata.deletion_timestamp.is_none())
        .cloned()
        .collect();

    sync_replicas(ms, &active, ctx).await?;

    // Status is computed from observed machines and their nodes.
    let mut machines_with_nodes = Vec::with_capacity(active.len());
    for machine in &active {
        let node = match machine.node_name() {
            Some(node_name) => ctx.kube.get_node(node_name).await?,
            None => None,
        };
        machines_with_nodes.push((machine.clone(), node));
    }

    let new_status = status::calculate_status(ms, &machines_with_nodes, chrono::Utc::now());
    status::update_machine_set_status(ms, new_status, ctx).await?;

    Ok(Action::requeue(Duration::from_secs(30)))
}

/// Error policy for the set controller
pub fn error_policy(ms: Arc<MachineSet>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        error = %error,
        machineset = %ms.name_any(),
        "machine set reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::await_change()
    }
}

/// Adopt matching orphans, release owned machines that stopped matching,
/// and return the machines this set currently controls
async fn claim_machines(ms: &MachineSet, ctx: &Context) -> Result<Vec<Machine>> {
    let namespace = ms.metadata.namespace.as_deref().unwrap_or_default();
    let all = ctx.kube.list_machines(namespace).await?;
    let ms_uid = ms.metadata.uid.as_deref().unwrap_or_default();

    let mut claimed = Vec::new();
    for machine in all {
        let labels = machine.metadata.labels.clone().unwrap_or_default();
        let matches = util::selector_matches_labels(&ms.spec.selector, &labels);
        let owner = controller_of(machine.metadata.owner_references.as_ref());

        match (matches, owner) {
            (true, Some(owner)) if owner.uid == ms_uid => claimed.push(machine),
            (true, Some(_)) => {} // controlled by another set
            (true, None) => {
                if machine.metadata.deletion_timestamp.is_some() {
                    continue;
                }
                let mut adopted = machine.clone();
                adopted
                    .metadata
                    .owner_references
                    .get_or_insert_with(Default::default)
                    .push(ms.controller_owner_ref(&()).expect("set has name and uid"));
                info!(machine = %adopted.name_any(), "adopting orphaned machine");
                claimed.push(ctx.kube.update_machine(&adopted).await?);
            }
            (false, Some(owner)) if owner.uid == ms_uid => {
                // Released: the selector no longer matches.
                let mut released = machine.clone();
                if let Some(refs) = released.metadata.owner_references.as_mut() {
                    refs.retain(|r| r.uid != ms_uid);
                }
                info!(machine = %released.name_any(), "releasing machine that no longer matches");
                ctx.kube.update_machine(&released).await?;
            }
            (false, _) => {}
        }
    }
    Ok(claimed)
}

/// Create or delete machines until the population matches spec.replicas
async fn sync_replicas(ms: &MachineSet, active: &[Machine], ctx: &Context) -> Result<()> {
    let desired = ms.replicas()?;
    let diff = active.len() as i32 - desired;

    if diff < 0 {
        let missing = (-diff) as usize;
        debug!(missing, "too few machines, creating");
        for _ in 0..missing {
            let machine = machine_from_template(ms);
            let created = ctx.kube.create_machine(&machine).await?;
            ctx.events
                .publish(
                    &ms.object_ref(&()),
                    EventReason::MachineCreated,
                    Some(format!("Created machine {}", created.name_any())),
                )
                .await;
        }
        return Ok(());
    }

    if diff > 0 {
        let policy = DeletePolicy::from_spec(ms.spec.delete_policy.as_deref())?;
        let victims = machines_to_delete(active, diff as usize, policy, chrono::Utc::now());
        debug!(count = victims.len(), ?policy, "too many machines, deleting");
        let namespace = ms.metadata.namespace.as_deref().unwrap_or_default();
        for victim in victims {
            ctx.kube.delete_machine(namespace, &victim.name_any()).await?;
            ctx.events
                .publish(
                    &ms.object_ref(&()),
                    EventReason::MachineDeleted,
                    Some(format!("Deleted machine {}", victim.name_any())),
                )
                .await;
        }
    }

    Ok(())
}

/// Stamp a machine out of the set's template
fn machine_from_template(ms: &MachineSet) -> Machine {
    let mut machine = Machine::new(
        &format!("{}-{}", ms.name_any(), util::rand_suffix()),
        ms.spec.template.spec.clone(),
    );
    machine.metadata.namespace = ms.metadata.namespace.clone();
    machine.metadata.labels = Some(ms.spec.template.labels());
    machine.metadata.annotations = ms
        .spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.clone());
    machine.metadata.owner_references =
        Some(vec![ms.controller_owner_ref(&()).expect("set has name and uid")]);
    machine
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::testing::{labels, machine_set};
    use machina_common::NoopEventPublisher;
    use std::sync::Mutex;

    fn test_ctx(kube: MockSetKubeClient) -> Context {
        Context {
            kube: Arc::new(kube),
            events: Arc::new(NoopEventPublisher),
        }
    }

    fn machine(name: &str, set: &MachineSet) -> Machine {
        let mut machine = Machine::new(name, set.spec.template.spec.clone());
        machine.metadata.namespace = set.metadata.namespace.clone();
        machine.metadata.uid = Some(format!("uid-{name}"));
        machine.metadata.labels = Some(set.spec.template.labels());
        machine.metadata.owner_references =
            Some(vec![set.controller_owner_ref(&()).unwrap()]);
        machine
    }

    #[test]
    fn test_machine_from_template_carries_labels_and_owner() {
        let ms = machine_set("ms-1", 3, 100);
        let machine = machine_from_template(&ms);

        let name = machine.metadata.name.as_deref().unwrap();
        assert!(name.starts_with("ms-1-"));
        assert_eq!(name.len(), "ms-1-".len() + 5);
        assert_eq!(machine.metadata.labels, Some(labels(&[("pool", "workers")])));

        let owner = controller_of(machine.metadata.owner_references.as_ref()).unwrap();
        assert_eq!(owner.kind, "MachineSet");
        assert_eq!(owner.name, "ms-1");
    }

    #[tokio::test]
    async fn test_scale_up_creates_missing_machines() {
        let ms = machine_set("ms-1", 3, 100);
        let existing = machine("ms-1-abcde", &ms);

        let created = Arc::new(Mutex::new(0));
        let created_clone = created.clone();
        let mut kube = MockSetKubeClient::new();
        kube.expect_create_machine().returning(move |m| {
            *created_clone.lock().unwrap() += 1;
            Ok(m.clone())
        });

        sync_replicas(&ms, &[existing], &test_ctx(kube)).await.unwrap();
        assert_eq!(*created.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_scale_down_deletes_prioritized_machines() {
        let ms = machine_set("ms-1", 1, 100);
        let keeper = machine("ms-1-keep1", &ms);
        let mut marked = machine("ms-1-marked", &ms);
        marked.metadata.annotations = Some(
            [(machina_common::DELETE_MACHINE_ANNOTATION.to_string(), "yes".to_string())]
                .into_iter()
                .collect(),
        );

        let deleted = Arc::new(Mutex::new(Vec::new()));
        let deleted_clone = deleted.clone();
        let mut kube = MockSetKubeClient::new();
        kube.expect_delete_machine().returning(move |_, name| {
            deleted_clone.lock().unwrap().push(name.to_string());
            Ok(())
        });

        sync_replicas(&ms, &[keeper, marked], &test_ctx(kube))
            .await
            .unwrap();

        // E4: the annotated machine goes first
        assert_eq!(*deleted.lock().unwrap(), vec!["ms-1-marked".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_delete_policy_is_fatal() {
        let mut ms = machine_set("ms-1", 0, 100);
        ms.spec.delete_policy = Some("Cheapest".into());
        let extra = machine("ms-1-extra", &ms);

        let kube = MockSetKubeClient::new();
        let err = sync_replicas(&ms, &[extra], &test_ctx(kube))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_claim_adopts_matching_orphan() {
        let ms = machine_set("ms-1", 1, 100);
        let mut orphan = machine("orphan", &ms);
        orphan.metadata.owner_references = None;

        let mut kube = MockSetKubeClient::new();
        let orphan_clone = orphan.clone();
        kube.expect_list_machines()
            .returning(move |_| Ok(vec![orphan_clone.clone()]));
        kube.expect_update_machine().times(1).returning(|m| {
            assert!(controller_of(m.metadata.owner_references.as_ref()).is_some());
            Ok(m.clone())
        });

        let claimed = claim_machines(&ms, &test_ctx(kube)).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_releases_machine_that_stopped_matching() {
        let ms = machine_set("ms-1", 1, 100);
        let mut stray = machine("stray", &ms);
        stray.metadata.labels = Some(labels(&[("pool", "somewhere-else")]));

        let mut kube = MockSetKubeClient::new();
        let stray_clone = stray.clone();
        kube.expect_list_machines()
            .returning(move |_| Ok(vec![stray_clone.clone()]));
        kube.expect_update_machine().times(1).returning(|m| {
            assert!(controller_of(m.metadata.owner_references.as_ref()).is_none());
            Ok(m.clone())
        });

        let claimed = claim_machines(&ms, &test_ctx(kube)).await.unwrap();
        assert!(claimed.is_empty());
    }
}
