//! The rolling-update state machine
//!
//! Scale-up and scale-down are budgeted separately: the new set may only
//! grow into `replicas + maxSurge`, and old sets may only shrink while
//! availability stays at or above `replicas - maxUnavailable`. Unhealthy
//! replicas are culled first since removing them cannot reduce availability.

use tracing::debug;

use kube::ResourceExt;

use machina_common::crd::{MachineDeployment, MachineSet};
use machina_common::{Error, Result};

use crate::util;

use super::sync::{
    cleanup_deployment, get_all_machine_sets_and_sync_revision, scale_machine_set,
    sync_deployment_status,
};
use super::Context;

/// Drive one step of a rolling update
pub async fn rollout_rolling(
    md: &MachineDeployment,
    sets: &[MachineSet],
    ctx: &Context,
) -> Result<()> {
    let (new_ms, mut old_mss) =
        get_all_machine_sets_and_sync_revision(md, sets, true, ctx).await?;

    // No new set this pass (annotation sync happened instead); the next
    // event picks the rollout back up.
    let Some(mut new_ms) = new_ms else {
        return Ok(());
    };

    if let Some(scaled) = reconcile_new_machine_set(md, &old_mss, &new_ms, ctx).await? {
        new_ms = scaled;
    }

    let mut all = old_mss.clone();
    all.push(new_ms.clone());
    sync_deployment_status(md, &all, Some(&new_ms), ctx).await?;

    old_mss = reconcile_old_machine_sets(md, old_mss, &new_ms, ctx).await?;

    let mut all = old_mss.clone();
    all.push(new_ms.clone());
    sync_deployment_status(md, &all, Some(&new_ms), ctx).await?;

    let status = super::sync::calculate_status(md, &all, Some(&new_ms));
    if util::deployment_complete(md, &status) {
        cleanup_deployment(md, &old_mss, ctx).await?;
    }

    Ok(())
}

/// Scale the new set up into the surge headroom; returns the updated set
/// when a scale happened
async fn reconcile_new_machine_set(
    md: &MachineDeployment,
    old_mss: &[MachineSet],
    new_ms: &MachineSet,
    ctx: &Context,
) -> Result<Option<MachineSet>> {
    let desired = md.replicas()?;
    let current = new_ms.replicas()?;

    if current == desired {
        return Ok(None);
    }

    let target = if current > desired {
        // Rollback path: the new set overshot the (reduced) deployment size.
        desired
    } else {
        let mut all = old_mss.to_vec();
        all.push(new_ms.clone());
        util::new_ms_new_replicas(md, &all, new_ms)?
    };

    if scale_machine_set(new_ms, target, md, ctx).await? {
        let mut scaled = new_ms.clone();
        scaled.spec.replicas = Some(target);
        return Ok(Some(scaled));
    }
    Ok(None)
}

/// Scale old sets down as far as the unavailability budget allows; returns
/// the updated old sets
async fn reconcile_old_machine_sets(
    md: &MachineDeployment,
    old_mss: Vec<MachineSet>,
    new_ms: &MachineSet,
    ctx: &Context,
) -> Result<Vec<MachineSet>> {
    let desired = md.replicas()?;

    let old_machines_count = util::replica_count(&old_mss);
    if old_machines_count == 0 {
        // Can't scale down further.
        return Ok(old_mss);
    }

    let mut all = old_mss.clone();
    all.push(new_ms.clone());
    let all_machines_count = util::replica_count(&all);
    let max_unavailable = util::max_unavailable(md);
    let min_available = desired - max_unavailable;

    // Unavailable machines of the NEW set count against the budget too:
    // scaling old sets down while new machines are still coming up would
    // push availability below the floor.
    let new_ms_unavailable =
        new_ms.replicas()? - new_ms.status.as_ref().map_or(0, |s| s.available_replicas);
    let max_scaled_down = all_machines_count - min_available - new_ms_unavailable;
    if max_scaled_down <= 0 {
        return Ok(old_mss);
    }

    // Dead replicas first: culling them cannot reduce availability.
    let (old_mss, cleanup_count) =
        cleanup_unhealthy_replicas(md, old_mss, max_scaled_down, ctx).await?;
    debug!(reduction = cleanup_count, "cleaned up unhealthy old replicas");

    let (old_mss, scaled_down) =
        scale_down_old_machine_sets(md, old_mss, new_ms, ctx).await?;
    debug!(reduction = scaled_down, "scaled down old MachineSets");

    Ok(old_mss)
}

/// Scale down old sets by their unhealthy replica count, oldest set first,
/// bounded by `max_cleanup_count`
async fn cleanup_unhealthy_replicas(
    md: &MachineDeployment,
    mut old_mss: Vec<MachineSet>,
    max_cleanup_count: i32,
    ctx: &Context,
) -> Result<(Vec<MachineSet>, i32)> {
    util::sort_by_creation_asc(&mut old_mss);

    let mut total_scaled_down = 0;
    for ms in old_mss.iter_mut() {
        if total_scaled_down >= max_cleanup_count {
            break;
        }
        let replicas = ms.replicas()?;
        if replicas == 0 {
            continue;
        }
        let available = ms.status.as_ref().map_or(0, |s| s.available_replicas);
        if replicas == available {
            // fully healthy
            continue;
        }

        let unhealthy = replicas - available;
        let scale_down_by = unhealthy.min(max_cleanup_count - total_scaled_down);
        let new_replicas = replicas - scale_down_by;
        if new_replicas > replicas {
            return Err(Error::internal_with_context(
                "rollout",
                format!(
                    "invalid request to scale down {}/{} {replicas} -> {new_replicas} during cleanup",
                    ms.metadata.namespace.as_deref().unwrap_or_default(),
                    ms.name_any()
                ),
            ));
        }

        scale_machine_set(ms, new_replicas, md, ctx).await?;
        ms.spec.replicas = Some(new_replicas);
        total_scaled_down += scale_down_by;
    }

    Ok((old_mss, total_scaled_down))
}

/// Scale down healthy old replicas while availability stays at or above the
/// floor, oldest set first
async fn scale_down_old_machine_sets(
    md: &MachineDeployment,
    mut old_mss: Vec<MachineSet>,
    new_ms: &MachineSet,
    ctx: &Context,
) -> Result<(Vec<MachineSet>, i32)> {
    let desired = md.replicas()?;
    let min_available = desired - util::max_unavailable(md);

    let mut all = old_mss.clone();
    all.push(new_ms.clone());
    let available_machine_count = util::available_replica_count(&all);
    if available_machine_count <= min_available {
        // Cannot scale down.
        return Ok((old_mss, 0));
    }

    util::sort_by_creation_asc(&mut old_mss);

    let mut total_scaled_down = 0;
    let total_scale_down_count = available_machine_count - min_available;
    for ms in old_mss.iter_mut() {
        if total_scaled_down >= total_scale_down_count {
            break;
        }
        let replicas = ms.replicas()?;
        if replicas == 0 {
            continue;
        }

        let scale_down_by = replicas.min(total_scale_down_count - total_scaled_down);
        let new_replicas = replicas - scale_down_by;

        scale_machine_set(ms, new_replicas, md, ctx).await?;
        ms.spec.replicas = Some(new_replicas);
        total_scaled_down += scale_down_by;
    }

    Ok((old_mss, total_scaled_down))
}
