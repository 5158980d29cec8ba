//! Machine controller
//!
//! Drives one Machine through its lifecycle: ensure the cloud instance
//! exists and runs, bind the node that joins with it, and on deletion
//! evict, tear the instance down and remove the node — in that order,
//! guarded by a finalizer so a crash mid-teardown never leaks a VM or a
//! ghost Node object.

mod eviction;
mod node_matching;
mod userdata;

pub use eviction::{evictable_pods, should_evict};
pub use node_matching::find_node_for_machine;
pub use userdata::{SecretUserdataSource, StaticUserdataSource, UserdataSource};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use machina_cloud::{
    CloudProvider, CloudProviderKind, ConfigVarResolver, Instance, ProviderConfig,
};
use machina_common::crd::{Machine, MachinePhase, MachineStatus};
use machina_common::metrics::{self, ReconcileTimer};
use machina_common::{
    Error, EventPublisher, EventReason, Result, INSTANCE_UID_ANNOTATION, MACHINE_FINALIZER,
    NODE_OWNER_LABEL,
};

use crate::machinedeployment::controller_of;

/// Tunables threaded in from the CLI
#[derive(Clone, Debug)]
pub struct MachineControllerSettings {
    /// Delete machines whose node never joined within this window
    /// (only MachineSet-owned machines, which the set replaces)
    pub join_cluster_timeout: Option<Duration>,
    /// Stop waiting for eviction this long after deletion started;
    /// zero disables the deadline
    pub skip_eviction_after: Duration,
}

impl Default for MachineControllerSettings {
    fn default() -> Self {
        Self {
            join_cluster_timeout: None,
            skip_eviction_after: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// Constructs providers per cloud kind; injectable for tests
pub trait ProviderRegistry: Send + Sync {
    /// Provider for the given kind, or a terminal configuration error
    fn provider(&self, kind: CloudProviderKind) -> Result<Arc<dyn CloudProvider>>;
}

/// Registry backed by the compiled-in provider implementations
pub struct DefaultProviderRegistry {
    resolver: Arc<dyn ConfigVarResolver>,
}

impl DefaultProviderRegistry {
    /// Create a registry resolving config vars with the given resolver
    pub fn new(resolver: Arc<dyn ConfigVarResolver>) -> Self {
        Self { resolver }
    }
}

impl ProviderRegistry for DefaultProviderRegistry {
    fn provider(&self, kind: CloudProviderKind) -> Result<Arc<dyn CloudProvider>> {
        machina_cloud::new_cloud_provider(kind, self.resolver.clone())
    }
}

/// Trait abstracting the Kubernetes operations the machine reconciler needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineKubeClient: Send + Sync {
    /// Update machine metadata/spec
    async fn update_machine(&self, machine: &Machine) -> Result<Machine>;

    /// Write the machine status subresource
    async fn update_machine_status(&self, machine: &Machine) -> Result<()>;

    /// Delete a machine; NotFound is not an error
    async fn delete_machine(&self, namespace: &str, name: &str) -> Result<()>;

    /// List machines in a namespace
    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>>;

    /// List all nodes
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Get a node by name, None when absent
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Update a node (binding writes)
    async fn update_node(&self, node: &Node) -> Result<Node>;

    /// Delete a node; NotFound is not an error
    async fn delete_node(&self, name: &str) -> Result<()>;

    /// Pods currently scheduled on the node
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;

    /// Evict one pod via the eviction subresource
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Real client implementation
pub struct MachineKubeClientImpl {
    client: Client,
}

impl MachineKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn machines(&self, namespace: &str) -> Api<Machine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl MachineKubeClient for MachineKubeClientImpl {
    async fn update_machine(&self, machine: &Machine) -> Result<Machine> {
        let namespace = machine.metadata.namespace.as_deref().unwrap_or_default();
        let name = machine.metadata.name.as_deref().unwrap_or_default();
        Ok(self
            .machines(namespace)
            .replace(name, &PostParams::default(), machine)
            .await?)
    }

    async fn update_machine_status(&self, machine: &Machine) -> Result<()> {
        let namespace = machine.metadata.namespace.as_deref().unwrap_or_default();
        let name = machine.metadata.name.as_deref().unwrap_or_default();
        let patch = serde_json::json!({ "status": machine.status });
        self.machines(namespace)
            .patch_status(
                name,
                &PatchParams::apply("machina-machine-controller"),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn delete_machine(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .machines(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>> {
        Ok(self
            .machines(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes().list(&ListParams::default()).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        match self.nodes().get(name).await {
            Ok(node) => Ok(Some(node)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        Ok(self
            .nodes()
            .replace(name, &PostParams::default(), node)
            .await?)
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        match self.nodes().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        Ok(api.list(&params).await?.items)
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.evict(name, &EvictParams::default()).await?;
        Ok(())
    }
}

/// Shared context for the machine reconciler
pub struct Context {
    /// Kubernetes access
    pub kube: Arc<dyn MachineKubeClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Cloud provider construction
    pub providers: Arc<dyn ProviderRegistry>,
    /// Bootstrap userdata lookup
    pub userdata: Arc<dyn UserdataSource>,
    /// CLI tunables
    pub settings: MachineControllerSettings,
}

/// Reconcile one Machine
#[instrument(skip(machine, ctx), fields(machine = %machine.name_any()))]
pub async fn reconcile(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action> {
    let timer = ReconcileTimer::start("machine");
    let result = reconcile_inner(&machine, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(e) => timer.error(if e.is_retryable() { "transient" } else { "terminal" }),
    }
    result
}

/// Error policy for the machine controller
pub fn error_policy(machine: Arc<Machine>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        error = %error,
        machine = %machine.name_any(),
        "machine reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::await_change()
    }
}

async fn reconcile_inner(machine: &Machine, ctx: &Context) -> Result<Action> {
    let mut machine = machine.clone();

    // Renamed providers are rewritten in place before anything else looks
    // at the spec (packet -> equinixmetal).
    if let Some(value) = machine.spec.provider_spec.value.as_mut() {
        if machina_cloud::migrate_provider_kind(value) {
            info!("rewrote renamed cloud provider in providerSpec");
            ctx.kube.update_machine(&machine).await?;
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
    }

    let config = match ProviderConfig::from_provider_spec(machine.spec.provider_spec.value.as_ref())
    {
        Ok(config) => config,
        Err(e) => return surface_terminal_error(&machine, e, ctx).await,
    };
    let kind = config.cloud_provider;
    let provider = match ctx.providers.provider(kind) {
        Ok(provider) => provider,
        Err(e) => return surface_terminal_error(&machine, e, ctx).await,
    };

    if machine.metadata.deletion_timestamp.is_some() {
        return delete_machine_flow(&machine, kind, provider.as_ref(), ctx).await;
    }

    // The finalizer must be in place before the first cloud call; a crash
    // between create and status write must still funnel through teardown.
    if !machine.finalizers().iter().any(|f| f == MACHINE_FINALIZER) {
        machine
            .metadata
            .finalizers
            .get_or_insert_with(Default::default)
            .push(MACHINE_FINALIZER.to_string());
        ctx.kube.update_machine(&machine).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // A terminal error parks the machine; the owning set replaces it.
    if machine.has_terminal_error() {
        debug!("machine has a terminal error, waiting for spec change or replacement");
        return Ok(Action::await_change());
    }

    // A recreated machine object keeps its instance: re-tag it from the
    // recorded UID to the current one.
    let recorded_uid = machine
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(INSTANCE_UID_ANNOTATION))
        .cloned();
    let current_uid = machine.metadata.uid.clone().unwrap_or_default();
    if let Some(recorded) = recorded_uid {
        if recorded != current_uid {
            info!(from = %recorded, to = %current_uid, "migrating instance UID tag");
            provider.migrate_uid(&machine, &current_uid).await?;
            machine
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(INSTANCE_UID_ANNOTATION.to_string(), current_uid.clone());
            ctx.kube.update_machine(&machine).await?;
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
    }

    match provider.get(&machine).await {
        Ok(instance) => ensure_instance_bound(&machine, instance, provider.as_ref(), kind, ctx).await,
        Err(e) if e.is_instance_not_found() => {
            create_instance(&machine, provider.as_ref(), kind, ctx).await
        }
        Err(e) => {
            metrics::record_provider_operation(&kind.to_string(), "get", false);
            if e.terminal_reason().is_some() {
                surface_terminal_error(&machine, e, ctx).await
            } else {
                Err(e)
            }
        }
    }
}

/// Provision the cloud instance for a machine that has none
async fn create_instance(
    machine: &Machine,
    provider: &dyn CloudProvider,
    kind: CloudProviderKind,
    ctx: &Context,
) -> Result<Action> {
    // Validation runs before every create so a broken spec is parked
    // without touching cloud state.
    let defaulted = provider.add_defaults(machine.spec.clone())?;
    if let Err(e) = provider.validate(&defaulted).await {
        metrics::record_provider_operation(&kind.to_string(), "validate", false);
        return surface_terminal_error(machine, e, ctx).await;
    }

    let userdata = match ctx.userdata.userdata_for(machine).await {
        Ok(userdata) => userdata,
        Err(e) => return surface_terminal_error(machine, e, ctx).await,
    };

    ctx.events
        .publish(
            &machine.object_ref(&()),
            EventReason::InstanceCreateStarted,
            Some("Creating cloud instance".to_string()),
        )
        .await;

    let instance = match provider.create(machine, &userdata).await {
        Ok(instance) => instance,
        Err(e) => {
            metrics::record_provider_operation(&kind.to_string(), "create", false);
            if e.terminal_reason().is_some() {
                return surface_terminal_error(machine, e, ctx).await;
            }
            return Err(e);
        }
    };
    metrics::record_provider_operation(&kind.to_string(), "create", true);
    info!(instance = %instance.id, "cloud instance created");

    // Record which UID the instance is tagged with; a future object
    // recreation migrates from this value.
    let mut updated = machine.clone();
    updated
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(
            INSTANCE_UID_ANNOTATION.to_string(),
            machine.metadata.uid.clone().unwrap_or_default(),
        );
    let updated = ctx.kube.update_machine(&updated).await?;

    write_status(&updated, instance_status(&updated, &instance, MachinePhase::Provisioning), ctx)
        .await?;
    Ok(Action::requeue(Duration::from_secs(10)))
}

/// Wait for the instance to run, then bind the node that joined with it
async fn ensure_instance_bound(
    machine: &Machine,
    instance: Instance,
    provider: &dyn CloudProvider,
    kind: CloudProviderKind,
    ctx: &Context,
) -> Result<Action> {
    if let Ok(labels) = provider.machine_metrics_labels(machine) {
        metrics::set_machine_gauge(&labels, 1);
    }

    if !instance.is_running() {
        debug!(status = ?instance.status, "instance not running yet");
        write_status(machine, instance_status(machine, &instance, MachinePhase::Provisioning), ctx)
            .await?;
        return Ok(Action::requeue(Duration::from_secs(10)));
    }

    let nodes = ctx.kube.list_nodes().await?;
    let Some(node) = node_matching::find_node_for_machine(machine, &instance, kind, &nodes) else {
        // No node yet. Machines that never join get replaced by their set.
        if let Some(timeout) = ctx.settings.join_cluster_timeout {
            let owned_by_set = controller_of(machine.metadata.owner_references.as_ref())
                .map(|o| o.kind == "MachineSet")
                .unwrap_or(false);
            if owned_by_set && machine_age(machine) > timeout {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "node never joined within the join timeout, deleting machine"
                );
                metrics::JOIN_TIMEOUTS.add(1, &[]);
                ctx.events
                    .publish(
                        &machine.object_ref(&()),
                        EventReason::JoinClusterTimeout,
                        Some(format!(
                            "Node did not join within {}s, deleting machine",
                            timeout.as_secs()
                        )),
                    )
                    .await;
                let namespace = machine.metadata.namespace.as_deref().unwrap_or_default();
                ctx.kube.delete_machine(namespace, &machine.name_any()).await?;
                return Ok(Action::await_change());
            }
        }
        write_status(machine, instance_status(machine, &instance, MachinePhase::Running), ctx)
            .await?;
        return Ok(Action::requeue(Duration::from_secs(30)));
    };

    // Bind: owner label plus controller ownerRef make the node exclusively
    // ours; both are idempotent.
    let machine_uid = machine.metadata.uid.clone().unwrap_or_default();
    let already_bound = node
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(NODE_OWNER_LABEL))
        .map(String::as_str)
        == Some(machine_uid.as_str());
    if !already_bound {
        let mut bound = node.clone();
        bound
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(NODE_OWNER_LABEL.to_string(), machine_uid.clone());
        bound
            .metadata
            .owner_references
            .get_or_insert_with(Default::default)
            .push(machine.controller_owner_ref(&()).expect("machine has name and uid"));
        ctx.kube.update_node(&bound).await?;
        info!(node = %node.name_any(), "bound node to machine");
        ctx.events
            .publish(
                &machine.object_ref(&()),
                EventReason::NodeBound,
                Some(format!("Bound node {}", node.name_any())),
            )
            .await;
    }

    let mut status = instance_status(machine, &instance, MachinePhase::Running);
    status.node_ref = Some(ObjectReference {
        kind: Some("Node".to_string()),
        name: Some(node.name_any()),
        uid: node.metadata.uid.clone(),
        ..Default::default()
    });
    status.versions = Some(machine.spec.versions.clone());
    write_status(machine, status, ctx).await?;

    Ok(Action::requeue(Duration::from_secs(60)))
}

/// Teardown: evict if feasible, release the instance, delete the node, and
/// only then drop the finalizer
async fn delete_machine_flow(
    machine: &Machine,
    kind: CloudProviderKind,
    provider: &dyn CloudProvider,
    ctx: &Context,
) -> Result<Action> {
    if !machine.finalizers().iter().any(|f| f == MACHINE_FINALIZER) {
        // Nothing to clean up; the API server finishes the delete.
        return Ok(Action::await_change());
    }

    let mut status = machine.status.clone().unwrap_or_default();
    if status.phase != Some(MachinePhase::Terminating) {
        status.phase = Some(MachinePhase::Terminating);
        write_status(machine, status, ctx).await?;
    }

    // Eviction, while it can succeed and we are within the deadline.
    let node_name = machine.node_name().map(String::from);
    let node = match node_name.as_deref() {
        Some(name) => ctx.kube.get_node(name).await?,
        None => None,
    };
    let namespace = machine.metadata.namespace.as_deref().unwrap_or_default();
    let all_nodes = ctx.kube.list_nodes().await?;
    let sibling_machines = ctx.kube.list_machines(namespace).await?;

    if eviction::should_evict(
        machine,
        node.as_ref(),
        &all_nodes,
        &sibling_machines,
        ctx.settings.skip_eviction_after,
        chrono::Utc::now(),
    ) {
        let node_name = node_name.as_deref().unwrap_or_default();
        let pods = ctx.kube.list_pods_on_node(node_name).await?;
        let victims = eviction::evictable_pods(&pods);
        if !victims.is_empty() {
            info!(pods = victims.len(), node = %node_name, "evicting pods");
            ctx.events
                .publish(
                    &machine.object_ref(&()),
                    EventReason::EvictionStarted,
                    Some(format!("Evicting {} pods from {node_name}", victims.len())),
                )
                .await;
            for pod in victims {
                let pod_namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
                let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
                // PodDisruptionBudgets legitimately reject evictions; those
                // pods are retried on the next pass.
                if let Err(e) = ctx.kube.evict_pod(pod_namespace, pod_name).await {
                    debug!(pod = %pod_name, error = %e, "eviction rejected, will retry");
                }
            }
            return Ok(Action::requeue(Duration::from_secs(10)));
        }
    }

    // Instance teardown. The finalizer stays until the provider confirms
    // everything instance-side is gone.
    match provider.cleanup(machine).await {
        Ok(true) => {
            metrics::record_provider_operation(&kind.to_string(), "cleanup", true);
            if let Ok(labels) = provider.machine_metrics_labels(machine) {
                metrics::set_machine_gauge(&labels, 0);
            }
        }
        Ok(false) => {
            debug!("instance still deleting");
            return Ok(Action::requeue(Duration::from_secs(10)));
        }
        Err(e) => {
            metrics::record_provider_operation(&kind.to_string(), "cleanup", false);
            if e.terminal_reason().is_some() {
                return surface_terminal_error(machine, e, ctx).await;
            }
            return Err(e);
        }
    }
    ctx.events
        .publish(
            &machine.object_ref(&()),
            EventReason::InstanceDeleted,
            Some("Cloud instance released".to_string()),
        )
        .await;

    // Node removal: by nodeRef when bound, else by owner label.
    let node_to_delete = match machine.node_name() {
        Some(name) => Some(name.to_string()),
        None => {
            let uid = machine.metadata.uid.clone().unwrap_or_default();
            ctx.kube.list_nodes().await?.into_iter().find_map(|n| {
                let owned = n
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(NODE_OWNER_LABEL))
                    .map(String::as_str)
                    == Some(uid.as_str());
                owned.then(|| n.name_any())
            })
        }
    };
    if let Some(name) = node_to_delete {
        ctx.kube.delete_node(&name).await?;
        info!(node = %name, "deleted node object");
        ctx.events
            .publish(
                &machine.object_ref(&()),
                EventReason::NodeDeleted,
                Some(format!("Deleted node {name}")),
            )
            .await;
    }

    // Everything is gone; let the object go too.
    let mut done = machine.clone();
    if let Some(finalizers) = done.metadata.finalizers.as_mut() {
        finalizers.retain(|f| f != MACHINE_FINALIZER);
    }
    ctx.kube.update_machine(&done).await?;
    info!("machine teardown complete");

    Ok(Action::await_change())
}

/// Write a terminal error to the machine status and stop retrying
async fn surface_terminal_error(machine: &Machine, error: Error, ctx: &Context) -> Result<Action> {
    let terminal = error.terminal_reason().map(|(r, m)| (r, m.to_string()));
    let Some((reason, message)) = terminal else {
        return Err(error);
    };
    warn!(%reason, error_message = %message, "terminal machine error");

    ctx.events
        .publish(
            &machine.object_ref(&()),
            EventReason::TerminalError,
            Some(format!("{reason}: {message}")),
        )
        .await;

    let mut status = machine.status.clone().unwrap_or_default();
    status.error_reason = Some(reason);
    status.error_message = Some(message);
    write_status(machine, status, ctx).await?;

    Ok(Action::await_change())
}

/// Status snapshot from an observed instance, preserving provider-owned fields
fn instance_status(machine: &Machine, instance: &Instance, phase: MachinePhase) -> MachineStatus {
    let mut status = machine.status.clone().unwrap_or_default();
    status.phase = Some(phase);
    status.addresses = Some(
        instance
            .addresses
            .iter()
            .map(|(address, type_)| k8s_openapi::api::core::v1::NodeAddress {
                address: address.clone(),
                type_: type_.clone(),
            })
            .collect(),
    );
    status
}

async fn write_status(machine: &Machine, mut status: MachineStatus, ctx: &Context) -> Result<()> {
    let unchanged = machine
        .status
        .as_ref()
        .map(|current| {
            let mut normalized = status.clone();
            normalized.last_updated = current.last_updated.clone();
            current == &normalized
        })
        .unwrap_or(false);
    if unchanged {
        return Ok(());
    }
    status.last_updated = Some(Time(chrono::Utc::now()));

    let mut updated = machine.clone();
    updated.status = Some(status);
    ctx.kube.update_machine_status(&updated).await
}

fn machine_age(machine: &Machine) -> Duration {
    machine
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(|t| (chrono::Utc::now() - t.0).to_std().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use machina_cloud::provider::FakeProvider;
    use machina_common::crd::{MachineErrorReason, MachineSpec, ProviderSpec};
    use machina_common::NoopEventPublisher;

    struct SingleProviderRegistry(Arc<FakeProvider>);

    impl ProviderRegistry for SingleProviderRegistry {
        fn provider(&self, _kind: CloudProviderKind) -> Result<Arc<dyn CloudProvider>> {
            Ok(self.0.clone())
        }
    }

    fn fake_machine(name: &str, uid: &str, pass_validation: bool) -> Machine {
        let mut machine = Machine::new(
            name,
            MachineSpec {
                provider_spec: ProviderSpec {
                    value: Some(serde_json::json!({
                        "cloudProvider": "fake",
                        "cloudProviderSpec": {"passValidation": pass_validation}
                    })),
                },
                ..Default::default()
            },
        );
        machine.metadata.namespace = Some("kube-system".to_string());
        machine.metadata.uid = Some(uid.to_string());
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        machine.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        machine
    }

    fn test_ctx(kube: MockMachineKubeClient, provider: Arc<FakeProvider>) -> Arc<Context> {
        Arc::new(Context {
            kube: Arc::new(kube),
            events: Arc::new(NoopEventPublisher),
            providers: Arc::new(SingleProviderRegistry(provider)),
            userdata: Arc::new(StaticUserdataSource("#cloud-config\n".to_string())),
            settings: MachineControllerSettings::default(),
        })
    }

    #[tokio::test]
    async fn test_missing_instance_is_created_and_uid_recorded() {
        let machine = fake_machine("worker-0", "uid-1", true);
        let provider = Arc::new(FakeProvider::new());

        let mut kube = MockMachineKubeClient::new();
        kube.expect_update_machine()
            .withf(|m| {
                m.metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(INSTANCE_UID_ANNOTATION))
                    .map(String::as_str)
                    == Some("uid-1")
            })
            .times(1)
            .returning(|m| Ok(m.clone()));
        kube.expect_update_machine_status()
            .withf(|m| {
                m.status.as_ref().and_then(|s| s.phase) == Some(MachinePhase::Provisioning)
            })
            .times(1)
            .returning(|_| Ok(()));

        let ctx = test_ctx(kube, provider.clone());
        reconcile(Arc::new(machine.clone()), ctx).await.unwrap();

        // E1/E5 invariant: exactly one instance exists for the UID
        assert!(provider.get(&machine).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_validation_parks_machine_with_terminal_error() {
        let machine = fake_machine("worker-0", "uid-1", false);
        let provider = Arc::new(FakeProvider::new());

        let mut kube = MockMachineKubeClient::new();
        kube.expect_update_machine_status()
            .withf(|m| {
                m.status.as_ref().and_then(|s| s.error_reason)
                    == Some(MachineErrorReason::InvalidConfiguration)
            })
            .times(1)
            .returning(|_| Ok(()));

        let ctx = test_ctx(kube, provider.clone());
        reconcile(Arc::new(machine.clone()), ctx).await.unwrap();

        // E5: no cloud instance was created
        assert!(provider.get(&machine).await.unwrap_err().is_instance_not_found());
    }

    #[tokio::test]
    async fn test_terminal_error_short_circuits_without_cloud_calls() {
        let mut machine = fake_machine("worker-0", "uid-1", true);
        machine.status = Some(MachineStatus {
            error_reason: Some(MachineErrorReason::Create),
            error_message: Some("quota exceeded".into()),
            ..Default::default()
        });
        let provider = Arc::new(FakeProvider::new());

        // no kube expectations: nothing may be called
        let kube = MockMachineKubeClient::new();
        let ctx = test_ctx(kube, provider.clone());
        reconcile(Arc::new(machine.clone()), ctx).await.unwrap();

        assert!(provider.get(&machine).await.unwrap_err().is_instance_not_found());
    }

    #[tokio::test]
    async fn test_finalizer_added_before_any_cloud_call() {
        let mut machine = fake_machine("worker-0", "uid-1", true);
        machine.metadata.finalizers = None;
        let provider = Arc::new(FakeProvider::new());

        let mut kube = MockMachineKubeClient::new();
        kube.expect_update_machine()
            .withf(|m| m.metadata.finalizers.as_ref().unwrap().contains(&MACHINE_FINALIZER.to_string()))
            .times(1)
            .returning(|m| Ok(m.clone()));

        let ctx = test_ctx(kube, provider.clone());
        reconcile(Arc::new(machine.clone()), ctx).await.unwrap();

        // the pass stopped after the finalizer write
        assert!(provider.get(&machine).await.unwrap_err().is_instance_not_found());
    }

    #[tokio::test]
    async fn test_deletion_removes_instance_node_and_finalizer_in_order() {
        let mut machine = fake_machine("worker-0", "uid-1", true);
        let provider = Arc::new(FakeProvider::new());
        provider.create(&machine, "").await.unwrap();

        machine.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        machine.status = Some(MachineStatus {
            node_ref: Some(ObjectReference {
                kind: Some("Node".into()),
                name: Some("node-1".into()),
                ..Default::default()
            }),
            phase: Some(MachinePhase::Terminating),
            ..Default::default()
        });

        let mut kube = MockMachineKubeClient::new();
        kube.expect_get_node().returning(|_| Ok(None)); // node object gone already
        kube.expect_list_nodes().returning(|| Ok(vec![]));
        kube.expect_list_machines().returning(|_| Ok(vec![]));
        kube.expect_delete_node()
            .withf(|name| name == "node-1")
            .times(1)
            .returning(|_| Ok(()));
        kube.expect_update_machine()
            .withf(|m| !m.finalizers().iter().any(|f| f == MACHINE_FINALIZER))
            .times(1)
            .returning(|m| Ok(m.clone()));

        let ctx = test_ctx(kube, provider.clone());
        reconcile(Arc::new(machine.clone()), ctx).await.unwrap();

        // finalizer safety: the instance is gone before the finalizer was
        assert!(provider.get(&machine).await.unwrap_err().is_instance_not_found());
    }

    #[tokio::test]
    async fn test_join_timeout_deletes_set_owned_machine() {
        let mut machine = fake_machine("worker-0", "uid-1", true);
        machine.metadata.creation_timestamp =
            Some(Time(chrono::Utc::now() - chrono::Duration::hours(2)));
        machine.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "cluster.k8s.io/v1alpha1".into(),
            kind: "MachineSet".into(),
            name: "ms-1".into(),
            uid: "uid-ms-1".into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]);

        let provider = Arc::new(FakeProvider::new());
        provider.create(&machine, "").await.unwrap();

        let mut kube = MockMachineKubeClient::new();
        kube.expect_list_nodes().returning(|| Ok(vec![])); // nothing ever joined
        kube.expect_delete_machine()
            .withf(|_, name| name == "worker-0")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut ctx = Context {
            kube: Arc::new(kube),
            events: Arc::new(NoopEventPublisher),
            providers: Arc::new(SingleProviderRegistry(provider)),
            userdata: Arc::new(StaticUserdataSource(String::new())),
            settings: MachineControllerSettings::default(),
        };
        ctx.settings.join_cluster_timeout = Some(Duration::from_secs(3600));

        reconcile(Arc::new(machine), Arc::new(ctx)).await.unwrap();
    }

    #[tokio::test]
    async fn test_node_binding_sets_label_owner_and_node_ref() {
        let machine = fake_machine("worker-0", "uid-1", true);
        let provider = Arc::new(FakeProvider::new());
        provider.create(&machine, "").await.unwrap();

        // the fake instance reports 192.0.2.1; give the node that address
        let mut node = Node::default();
        node.metadata.name = Some("node-1".to_string());
        node.status = Some(k8s_openapi::api::core::v1::NodeStatus {
            addresses: Some(vec![k8s_openapi::api::core::v1::NodeAddress {
                address: "192.0.2.1".into(),
                type_: "InternalIP".into(),
            }]),
            ..Default::default()
        });

        let mut kube = MockMachineKubeClient::new();
        let node_clone = node.clone();
        kube.expect_list_nodes().returning(move || Ok(vec![node_clone.clone()]));
        kube.expect_update_node()
            .withf(|n| {
                let labeled = n
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(NODE_OWNER_LABEL))
                    .map(String::as_str)
                    == Some("uid-1");
                let owned = n
                    .metadata
                    .owner_references
                    .as_ref()
                    .map(|r| r.iter().any(|o| o.kind == "Machine"))
                    .unwrap_or(false);
                labeled && owned
            })
            .times(1)
            .returning(|n| Ok(n.clone()));
        kube.expect_update_machine_status()
            .withf(|m| {
                let status = m.status.as_ref().unwrap();
                status.node_ref.as_ref().and_then(|r| r.name.as_deref()) == Some("node-1")
                    && status.phase == Some(MachinePhase::Running)
            })
            .times(1)
            .returning(|_| Ok(()));

        let ctx = test_ctx(kube, provider);
        reconcile(Arc::new(machine), ctx).await.unwrap();
    }
}
