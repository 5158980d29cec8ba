//! MachineDeployment controller
//!
//! Translates a declarative replica count plus template into revisioned
//! MachineSets. Paused deployments only scale proportionally; everything
//! else goes through the rolling-update state machine in [`rolling`].

mod rolling;
mod sync;

pub use rolling::rollout_rolling;
pub use sync::{calculate_status, cleanup_deployment, scale, sync_deployment_status};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use machina_common::crd::{populate_defaults, MachineDeployment, MachineSet};
use machina_common::metrics::ReconcileTimer;
use machina_common::{Error, EventPublisher, EventReason, Result};

use crate::util;

/// Trait abstracting the Kubernetes operations the deployment reconciler
/// needs, mockable in tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentKubeClient: Send + Sync {
    /// List all MachineSets in a namespace
    async fn list_machine_sets(&self, namespace: &str) -> Result<Vec<MachineSet>>;

    /// Get one MachineSet, None when absent
    async fn get_machine_set(&self, namespace: &str, name: &str) -> Result<Option<MachineSet>>;

    /// Create a MachineSet; surfaces AlreadyExists for collision handling
    async fn create_machine_set(&self, ms: &MachineSet) -> Result<MachineSet>;

    /// Update a MachineSet spec/metadata
    async fn update_machine_set(&self, ms: &MachineSet) -> Result<MachineSet>;

    /// Delete a MachineSet
    async fn delete_machine_set(&self, namespace: &str, name: &str) -> Result<()>;

    /// Update deployment metadata/spec
    async fn update_deployment(&self, md: &MachineDeployment) -> Result<MachineDeployment>;

    /// Write the deployment status subresource
    async fn update_deployment_status(&self, md: &MachineDeployment) -> Result<()>;
}

/// Real client implementation
pub struct DeploymentKubeClientImpl {
    client: Client,
}

impl DeploymentKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn sets(&self, namespace: &str) -> Api<MachineSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<MachineDeployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl DeploymentKubeClient for DeploymentKubeClientImpl {
    async fn list_machine_sets(&self, namespace: &str) -> Result<Vec<MachineSet>> {
        Ok(self
            .sets(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn get_machine_set(&self, namespace: &str, name: &str) -> Result<Option<MachineSet>> {
        match self.sets(namespace).get(name).await {
            Ok(ms) => Ok(Some(ms)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_machine_set(&self, ms: &MachineSet) -> Result<MachineSet> {
        let namespace = ms.metadata.namespace.as_deref().unwrap_or_default();
        Ok(self.sets(namespace).create(&PostParams::default(), ms).await?)
    }

    async fn update_machine_set(&self, ms: &MachineSet) -> Result<MachineSet> {
        let namespace = ms.metadata.namespace.as_deref().unwrap_or_default();
        let name = ms.metadata.name.as_deref().unwrap_or_default();
        Ok(self
            .sets(namespace)
            .replace(name, &PostParams::default(), ms)
            .await?)
    }

    async fn delete_machine_set(&self, namespace: &str, name: &str) -> Result<()> {
        match self.sets(namespace).delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_deployment(&self, md: &MachineDeployment) -> Result<MachineDeployment> {
        let namespace = md.metadata.namespace.as_deref().unwrap_or_default();
        let name = md.metadata.name.as_deref().unwrap_or_default();
        Ok(self
            .deployments(namespace)
            .replace(name, &PostParams::default(), md)
            .await?)
    }

    async fn update_deployment_status(&self, md: &MachineDeployment) -> Result<()> {
        let namespace = md.metadata.namespace.as_deref().unwrap_or_default();
        let name = md.metadata.name.as_deref().unwrap_or_default();
        let patch = serde_json::json!({ "status": md.status });
        self.deployments(namespace)
            .patch_status(
                name,
                &PatchParams::apply("machina-machinedeployment-controller"),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

/// Shared context for the deployment reconciler
pub struct Context {
    /// Kubernetes access
    pub kube: Arc<dyn DeploymentKubeClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Production context from a kube client
    pub fn new(client: Client, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            kube: Arc::new(DeploymentKubeClientImpl::new(client)),
            events,
        }
    }
}

/// Reconcile one MachineDeployment
#[instrument(skip(md, ctx), fields(machinedeployment = %md.name_any()))]
pub async fn reconcile(md: Arc<MachineDeployment>, ctx: Arc<Context>) -> Result<Action> {
    let timer = ReconcileTimer::start("machinedeployment");
    let result = reconcile_inner(&md, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(e) => timer.error(if e.is_retryable() { "transient" } else { "terminal" }),
    }
    result
}

async fn reconcile_inner(md: &MachineDeployment, ctx: &Context) -> Result<Action> {
    let name = md.name_any();

    if md.metadata.deletion_timestamp.is_some() {
        // Owned sets and machines are garbage-collected via ownerReferences.
        debug!("deployment is being deleted, nothing to reconcile");
        return Ok(Action::await_change());
    }

    let mut md = md.clone();
    populate_defaults(&mut md);

    if let Err(e) = md.spec.validate(&name) {
        warn!(error = %e, "deployment validation failed");
        ctx.events
            .publish(
                &md.object_ref(&()),
                EventReason::ValidationFailed,
                Some(e.to_string()),
            )
            .await;
        return Ok(Action::await_change());
    }

    let sets = machine_sets_for_deployment(&md, ctx).await?;
    debug!(sets = sets.len(), paused = md.spec.paused, "reconciling deployment");

    if md.spec.paused {
        sync::sync(&md, &sets, ctx).await?;
    } else {
        rolling::rollout_rolling(&md, &sets, ctx).await?;
    }

    Ok(Action::requeue(Duration::from_secs(30)))
}

/// Error policy: transient errors requeue with a delay, everything else
/// waits for a spec change
pub fn error_policy(md: Arc<MachineDeployment>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        error = %error,
        machinedeployment = %md.name_any(),
        "deployment reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::await_change()
    }
}

/// The controller owner reference of an object, if any
pub(crate) fn controller_of(
    owner_references: Option<&Vec<OwnerReference>>,
) -> Option<&OwnerReference> {
    owner_references?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// List the sets this deployment owns, adopting orphans that match its
/// selector
async fn machine_sets_for_deployment(
    md: &MachineDeployment,
    ctx: &Context,
) -> Result<Vec<MachineSet>> {
    let namespace = md.metadata.namespace.as_deref().unwrap_or_default();
    let all = ctx.kube.list_machine_sets(namespace).await?;
    let md_uid = md.metadata.uid.as_deref().unwrap_or_default();

    let mut owned = Vec::new();
    for ms in all {
        let labels = ms.metadata.labels.clone().unwrap_or_default();
        if !util::selector_matches_labels(&md.spec.selector, &labels) {
            continue;
        }
        match controller_of(ms.metadata.owner_references.as_ref()) {
            Some(owner) if owner.uid == md_uid => owned.push(ms),
            Some(_) => {} // someone else's set
            None => {
                // Orphan matching our selector: adopt it.
                let mut adopted = ms.clone();
                adopted
                    .metadata
                    .owner_references
                    .get_or_insert_with(Default::default)
                    .push(md.controller_owner_ref(&()).expect("deployment has name and uid"));
                info!(
                    machineset = %adopted.name_any(),
                    "adopting orphaned MachineSet"
                );
                owned.push(ctx.kube.update_machine_set(&adopted).await?);
            }
        }
    }
    Ok(owned)
}
