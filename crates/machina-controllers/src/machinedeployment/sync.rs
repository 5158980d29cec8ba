//! Revision sync, proportional scaling, status and history cleanup
//!
//! `sync` handles scaling events and paused deployments: no new sets are
//! created and nothing rolls, the existing sets are only resized. The
//! revision machinery here is shared with the rollout path.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use machina_common::crd::{
    MachineDeployment, MachineDeploymentStatus, MachineSet, MachineSetSpec,
};
use machina_common::{
    Error, EventReason, Result, FOREGROUND_DELETION_FINALIZER, MACHINE_TEMPLATE_HASH_LABEL,
};

use crate::util;

use super::{controller_of, Context};

/// Reconcile a paused deployment or a pure scaling event: resize sets
/// proportionally, then refresh status
pub(crate) async fn sync(
    md: &MachineDeployment,
    sets: &[MachineSet],
    ctx: &Context,
) -> Result<()> {
    let (new_ms, old_mss) =
        get_all_machine_sets_and_sync_revision(md, sets, false, ctx).await?;

    scale(md, new_ms.as_ref(), &old_mss, ctx).await?;

    let mut all = old_mss;
    if let Some(new_ms) = new_ms.clone() {
        all.push(new_ms);
    }
    sync_deployment_status(md, &all, new_ms.as_ref(), ctx).await
}

/// Partition the sets into (new, old) and sync the revision bookkeeping
///
/// With `create_if_not_exists`, a missing new set is created under the next
/// revision number, handling template-hash collisions by bumping
/// `status.collisionCount` and retrying on a later reconcile.
pub(crate) async fn get_all_machine_sets_and_sync_revision(
    md: &MachineDeployment,
    sets: &[MachineSet],
    create_if_not_exists: bool,
    ctx: &Context,
) -> Result<(Option<MachineSet>, Vec<MachineSet>)> {
    let old_mss = util::find_old_machine_sets(md, sets);
    let new_ms = get_new_machine_set(md, sets, &old_mss, create_if_not_exists, ctx).await?;
    Ok((new_ms, old_mss))
}

async fn get_new_machine_set(
    md: &MachineDeployment,
    sets: &[MachineSet],
    old_mss: &[MachineSet],
    create_if_not_exists: bool,
    ctx: &Context,
) -> Result<Option<MachineSet>> {
    let existing = util::find_new_machine_set(md, sets);
    let max_old_revision = old_mss.iter().map(util::revision_of).max().unwrap_or(0);
    let new_revision = max_old_revision + 1;
    let surge = util::max_surge(md);

    if let Some(existing) = existing {
        let mut copy = existing.clone();
        let annotations_updated =
            util::set_new_machine_set_annotations(md, &mut copy, new_revision, surge);

        let wanted_min_ready = md.spec.min_ready_seconds.unwrap_or(0);
        let min_ready_needs_update = copy.spec.min_ready_seconds != wanted_min_ready;

        if annotations_updated || min_ready_needs_update {
            copy.spec.min_ready_seconds = wanted_min_ready;
            ctx.kube.update_machine_set(&copy).await?;
            // The watch fires again once the update lands; no rollout this pass.
            return Ok(None);
        }

        // Carry the set's revision onto the deployment if it is missing there.
        let mut md_copy = md.clone();
        let revision = util::revision_of(&copy).to_string();
        if util::set_deployment_revision(&mut md_copy, &revision) {
            ctx.kube.update_deployment(&md_copy).await?;
        }
        return Ok(Some(copy));
    }

    if !create_if_not_exists {
        return Ok(None);
    }

    // Build the new set. The name derives from the template hash (plus the
    // collision count as uniquifier) so creation is idempotent.
    let collision_count = md.status.as_ref().and_then(|s| s.collision_count);
    let hash = util::safe_encode(util::compute_hash(&md.spec.template, collision_count));

    let mut template = md.spec.template.clone();
    template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(Default::default)
        .insert(MACHINE_TEMPLATE_HASH_LABEL.to_string(), hash.clone());

    let mut selector: LabelSelector = md.spec.selector.clone();
    selector
        .match_labels
        .get_or_insert_with(Default::default)
        .insert(MACHINE_TEMPLATE_HASH_LABEL.to_string(), hash.clone());

    let mut new_ms = MachineSet::new(
        &format!("{}-{hash}", md.name_any()),
        MachineSetSpec {
            replicas: Some(0),
            min_ready_seconds: md.spec.min_ready_seconds.unwrap_or(0),
            selector,
            template: template.clone(),
            ..Default::default()
        },
    );
    new_ms.metadata.namespace = md.metadata.namespace.clone();
    new_ms.metadata.labels = template.metadata.as_ref().and_then(|m| m.labels.clone());
    new_ms.metadata.owner_references = Some(vec![md
        .controller_owner_ref(&())
        .expect("deployment has name and uid")]);

    // Foreground deletion is inherited so `kubectl delete --cascade=foreground`
    // flows down to machines.
    if md
        .finalizers()
        .iter()
        .any(|f| f == FOREGROUND_DELETION_FINALIZER)
    {
        new_ms.metadata.finalizers = Some(vec![FOREGROUND_DELETION_FINALIZER.to_string()]);
    }

    let mut all = old_mss.to_vec();
    all.push(new_ms.clone());
    let initial_replicas = util::new_ms_new_replicas(md, &all, &new_ms)?;
    new_ms.spec.replicas = Some(initial_replicas);

    util::set_new_machine_set_annotations(md, &mut new_ms, new_revision, surge);

    let created = match ctx.kube.create_machine_set(&new_ms).await {
        Ok(created) => {
            info!(
                machineset = %created.name_any(),
                replicas = initial_replicas,
                "created new MachineSet"
            );
            ctx.events
                .publish(
                    &md.object_ref(&()),
                    EventReason::MachineSetCreated,
                    Some(format!("Created MachineSet {}", created.name_any())),
                )
                .await;
            created
        }
        Err(e) if e.is_kube_already_exists() => {
            // Slow cache or fast resync: the set may already be ours. If not,
            // this is a genuine hash collision.
            let namespace = md.metadata.namespace.as_deref().unwrap_or_default();
            let fetched = ctx
                .kube
                .get_machine_set(namespace, &new_ms.name_any())
                .await?
                .ok_or_else(|| {
                    Error::internal_with_context(
                        "machinedeployment",
                        "MachineSet reported AlreadyExists but cannot be fetched",
                    )
                })?;

            let owned = controller_of(fetched.metadata.owner_references.as_ref())
                .map(|o| o.uid == md.metadata.uid.clone().unwrap_or_default())
                .unwrap_or(false);
            if owned && util::equal_ignore_hash(&md.spec.template, &fetched.spec.template) {
                fetched
            } else {
                let mut md_copy = md.clone();
                let status = md_copy.status.get_or_insert_with(Default::default);
                status.collision_count = Some(status.collision_count.unwrap_or(0) + 1);
                warn!(
                    machineset = %new_ms.name_any(),
                    collision_count = ?status.collision_count,
                    "template hash collision, bumping collisionCount"
                );
                ctx.events
                    .publish(
                        &md.object_ref(&()),
                        EventReason::HashCollision,
                        Some(format!(
                            "MachineSet {} exists with a different template",
                            new_ms.name_any()
                        )),
                    )
                    .await;
                ctx.kube.update_deployment_status(&md_copy).await?;
                return Err(e);
            }
        }
        Err(e) => return Err(e),
    };

    let mut md_copy = md.clone();
    if util::set_deployment_revision(&mut md_copy, &new_revision.to_string()) {
        ctx.kube.update_deployment(&md_copy).await?;
    }

    Ok(Some(created))
}

/// Scale sets on scaling events or while paused
///
/// With one active set it is driven straight to the deployment size; with a
/// saturated new set the old ones go to zero; mid-rollout the delta is
/// distributed proportionally so the rollout's risk profile is preserved.
pub async fn scale(
    md: &MachineDeployment,
    new_ms: Option<&MachineSet>,
    old_mss: &[MachineSet],
    ctx: &Context,
) -> Result<()> {
    let desired = md.replicas()?;

    if let Some(active) = util::find_one_active_or_latest(new_ms, old_mss) {
        if active.replicas()? != desired {
            scale_machine_set(&active, desired, md, ctx).await?;
        }
        return Ok(());
    }

    if let Some(new_ms) = new_ms {
        if util::is_saturated(md, new_ms) {
            for old in util::filter_active(old_mss) {
                scale_machine_set(&old, 0, md, ctx).await?;
            }
            return Ok(());
        }
    }

    if !md.is_rolling_update() {
        return Ok(());
    }

    let mut all: Vec<MachineSet> = old_mss.to_vec();
    if let Some(new_ms) = new_ms {
        all.push(new_ms.clone());
    }
    let mut active = util::filter_active(&all);
    // The leftover below goes to index 0, which must be the largest set.
    util::sort_by_desired_replicas_desc(&mut active);

    let total = util::replica_count(&active);
    let allowed = if desired > 0 {
        desired + util::max_surge(md)
    } else {
        0
    };
    let to_add = allowed - total;

    let mut added = 0;
    let mut targets: Vec<i32> = Vec::with_capacity(active.len());
    for ms in &active {
        let proportion = util::get_proportion(ms, total, to_add, added);
        targets.push(ms.spec.replicas.unwrap_or(0) + proportion);
        added += proportion;
    }

    for (i, ms) in active.iter().enumerate() {
        let mut target = targets[i];
        if i == 0 && to_add != 0 {
            target += to_add - added;
            if target < 0 {
                target = 0;
            }
        }
        scale_machine_set_operation(ms, target, md, ctx).await?;
    }

    Ok(())
}

/// Scale one set if its size differs from the target
pub(crate) async fn scale_machine_set(
    ms: &MachineSet,
    new_scale: i32,
    md: &MachineDeployment,
    ctx: &Context,
) -> Result<bool> {
    if ms.replicas()? == new_scale {
        return Ok(false);
    }
    scale_machine_set_operation(ms, new_scale, md, ctx).await
}

async fn scale_machine_set_operation(
    ms: &MachineSet,
    new_scale: i32,
    md: &MachineDeployment,
    ctx: &Context,
) -> Result<bool> {
    let current = ms.replicas()?;
    let desired = md.replicas()?;
    let max = desired + util::max_surge(md);

    let size_needs_update = current != new_scale;
    let annotations_need_update = util::replicas_annotations_need_update(ms, desired, max);
    if !size_needs_update && !annotations_need_update {
        return Ok(false);
    }

    let mut copy = ms.clone();
    copy.spec.replicas = Some(new_scale);
    util::set_replicas_annotations(&mut copy, desired, max);
    ctx.kube.update_machine_set(&copy).await?;

    if size_needs_update {
        debug!(
            machineset = %ms.name_any(),
            from = current,
            to = new_scale,
            "scaled MachineSet"
        );
        ctx.events
            .publish(
                &md.object_ref(&()),
                EventReason::MachineSetScaled,
                Some(format!(
                    "Scaled MachineSet {} from {current} to {new_scale}",
                    ms.name_any()
                )),
            )
            .await;
    }
    Ok(size_needs_update)
}

/// Compute deployment status from its sets
pub fn calculate_status(
    md: &MachineDeployment,
    all: &[MachineSet],
    new_ms: Option<&MachineSet>,
) -> MachineDeploymentStatus {
    let available = util::available_replica_count(all);
    let total = util::actual_replica_count(all);
    let unavailable = (total - available).max(0);

    MachineDeploymentStatus {
        observed_generation: md.metadata.generation.unwrap_or(0),
        replicas: total,
        updated_replicas: new_ms
            .map(|ms| ms.status.as_ref().map_or(0, |s| s.replicas))
            .unwrap_or(0),
        ready_replicas: util::ready_replica_count(all),
        available_replicas: available,
        unavailable_replicas: unavailable,
        collision_count: md.status.as_ref().and_then(|s| s.collision_count),
    }
}

/// Write back the deployment status if it changed
pub async fn sync_deployment_status(
    md: &MachineDeployment,
    all: &[MachineSet],
    new_ms: Option<&MachineSet>,
    ctx: &Context,
) -> Result<()> {
    let new_status = calculate_status(md, all, new_ms);
    if md.status.as_ref() == Some(&new_status) {
        return Ok(());
    }
    let mut copy = md.clone();
    copy.status = Some(new_status);
    ctx.kube.update_deployment_status(&copy).await
}

/// Delete old, fully scaled-down sets beyond the revision history limit
pub async fn cleanup_deployment(
    md: &MachineDeployment,
    old_mss: &[MachineSet],
    ctx: &Context,
) -> Result<()> {
    let Some(limit) = md.spec.revision_history_limit else {
        return Ok(());
    };

    let mut cleanable: Vec<MachineSet> = old_mss
        .iter()
        .filter(|ms| ms.metadata.deletion_timestamp.is_none())
        .cloned()
        .collect();

    let diff = cleanable.len() as i32 - limit;
    if diff <= 0 {
        return Ok(());
    }

    util::sort_by_creation_asc(&mut cleanable);

    let mut deleted = 0;
    for ms in &cleanable {
        if deleted >= diff {
            break;
        }
        let status = ms.status.clone().unwrap_or_default();
        let spec_replicas = ms.replicas()?;
        // Only sets that are fully drained and caught up are history.
        if status.replicas != 0
            || spec_replicas != 0
            || ms.metadata.generation.unwrap_or(0) > status.observed_generation
            || ms.metadata.deletion_timestamp.is_some()
        {
            continue;
        }

        debug!(machineset = %ms.name_any(), "cleaning up old MachineSet");
        let namespace = ms.metadata.namespace.as_deref().unwrap_or_default();
        ctx.kube
            .delete_machine_set(namespace, &ms.name_any())
            .await?;
        deleted += 1;
    }

    Ok(())
}
