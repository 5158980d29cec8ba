//! Rolling-update arithmetic
//!
//! The budgets: during a rollout the total replica count may not exceed
//! `replicas + maxSurge`, and the available count may not fall below
//! `replicas - maxUnavailable`. Everything here is derived fresh from
//! observed state on each reconcile.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use machina_common::crd::{MachineDeployment, MachineDeploymentStatus, MachineSet};
use machina_common::{Error, Result};

use super::{
    available_replica_count, creation_time, desired_replicas_annotation, equal_ignore_hash,
    filter_active, replica_count,
};

/// Resolve an int-or-percent against a total
///
/// Percentages round up for surge and down for unavailability, so a
/// non-zero percentage never resolves both budgets to zero.
pub fn resolve_int_or_percent(value: &IntOrString, total: i32, round_up: bool) -> Result<i32> {
    match value {
        IntOrString::Int(i) => Ok(*i),
        IntOrString::String(s) => {
            let percent: f64 = s
                .strip_suffix('%')
                .ok_or_else(|| Error::validation(format!("invalid int-or-percent value {s:?}")))?
                .parse()
                .map_err(|e| Error::validation(format!("invalid percentage {s:?}: {e}")))?;
            let scaled = percent * total as f64 / 100.0;
            Ok(if round_up {
                scaled.ceil() as i32
            } else {
                scaled.floor() as i32
            })
        }
    }
}

fn rolling_update_budgets(md: &MachineDeployment) -> (Option<IntOrString>, Option<IntOrString>) {
    let rolling = md
        .spec
        .strategy
        .as_ref()
        .and_then(|s| s.rolling_update.as_ref());
    (
        rolling.and_then(|r| r.max_surge.clone()),
        rolling.and_then(|r| r.max_unavailable.clone()),
    )
}

/// Machines allowed above spec.replicas during a rollout
pub fn max_surge(md: &MachineDeployment) -> i32 {
    if !md.is_rolling_update() {
        return 0;
    }
    let replicas = md.spec.replicas.unwrap_or(0);
    let (surge, unavailable) = rolling_update_budgets(md);
    let surge_value = surge.unwrap_or(IntOrString::Int(0));
    let unavailable_value = unavailable.unwrap_or(IntOrString::Int(0));

    let mut surge = resolve_int_or_percent(&surge_value, replicas, true).unwrap_or(0);
    let unavailable = resolve_int_or_percent(&unavailable_value, replicas, false).unwrap_or(0);
    if surge == 0 && unavailable == 0 {
        // both zero would deadlock the rollout; surge one machine
        surge = 1;
    }
    surge
}

/// Machines allowed below spec.replicas during a rollout, clamped to replicas
pub fn max_unavailable(md: &MachineDeployment) -> i32 {
    let replicas = md.spec.replicas.unwrap_or(0);
    if !md.is_rolling_update() || replicas == 0 {
        return 0;
    }
    let (surge, unavailable) = rolling_update_budgets(md);
    let surge_value = surge.unwrap_or(IntOrString::Int(0));
    let unavailable_value = unavailable.unwrap_or(IntOrString::Int(0));

    let surge = resolve_int_or_percent(&surge_value, replicas, true).unwrap_or(0);
    let mut unavailable = resolve_int_or_percent(&unavailable_value, replicas, false).unwrap_or(0);
    if surge == 0 && unavailable == 0 {
        unavailable = 1;
    }
    unavailable.min(replicas)
}

/// The set whose template matches the deployment's, ignoring the hash label
///
/// Oldest match wins so a duplicate set created by a stale cache cannot
/// steal the rollout from the established one.
pub fn find_new_machine_set(md: &MachineDeployment, sets: &[MachineSet]) -> Option<MachineSet> {
    let mut sorted: Vec<MachineSet> = sets.to_vec();
    super::sort_by_creation_asc(&mut sorted);
    sorted
        .into_iter()
        .find(|ms| equal_ignore_hash(&ms.spec.template, &md.spec.template))
}

/// All sets except the new one
pub fn find_old_machine_sets(md: &MachineDeployment, sets: &[MachineSet]) -> Vec<MachineSet> {
    let new_name = find_new_machine_set(md, sets).and_then(|ms| ms.metadata.name);
    sets.iter()
        .filter(|ms| ms.metadata.name != new_name || new_name.is_none())
        .cloned()
        .collect()
}

/// If exactly one set is active, return it; with none active, prefer the new
/// set, else the newest old one. More than one active set means a rollout is
/// mid-flight and there is no single set to scale directly.
pub fn find_one_active_or_latest(
    new_ms: Option<&MachineSet>,
    old_mss: &[MachineSet],
) -> Option<MachineSet> {
    if new_ms.is_none() && old_mss.is_empty() {
        return None;
    }

    let mut old_sorted: Vec<MachineSet> = old_mss.to_vec();
    old_sorted.sort_by(|a, b| creation_time(b).0.cmp(&creation_time(a).0));

    let mut all: Vec<MachineSet> = old_sorted.clone();
    if let Some(new_ms) = new_ms {
        all.push(new_ms.clone());
    }
    let active = filter_active(&all);

    match active.len() {
        0 => new_ms.cloned().or_else(|| old_sorted.first().cloned()),
        1 => Some(active[0].clone()),
        _ => None,
    }
}

/// Whether the new set has reached the deployment's full size and all of it
/// is available
pub fn is_saturated(md: &MachineDeployment, ms: &MachineSet) -> bool {
    let desired = md.spec.replicas.unwrap_or(0);
    ms.spec.replicas == Some(desired)
        && desired_replicas_annotation(ms) == Some(desired)
        && ms.status.as_ref().map_or(0, |s| s.available_replicas) == desired
}

/// Target replicas for the new set during a rollout
///
/// The new set may grow only into the headroom left under
/// `replicas + maxSurge`, and never beyond the deployment size itself.
/// Outside a rolling update (paused deployments included) the current size
/// is returned unchanged.
pub fn new_ms_new_replicas(
    md: &MachineDeployment,
    all: &[MachineSet],
    new_ms: &MachineSet,
) -> Result<i32> {
    let desired = md.replicas()?;
    let new_replicas = new_ms.replicas()?;

    if !md.is_rolling_update() {
        return Ok(new_replicas);
    }

    let current_total = replica_count(all);
    let allowed_total = desired + max_surge(md);
    if current_total >= allowed_total {
        // no headroom
        return Ok(new_replicas);
    }

    let room = allowed_total - current_total;
    Ok(new_replicas + room.min(desired - new_replicas))
}

/// Whether the rollout has fully converged
pub fn deployment_complete(md: &MachineDeployment, status: &MachineDeploymentStatus) -> bool {
    let desired = md.spec.replicas.unwrap_or(0);
    status.updated_replicas == desired
        && status.available_replicas == desired
        && status.observed_generation >= md.metadata.generation.unwrap_or(0)
}

/// Proportional share of `to_add` for one set during a scaling event
///
/// The share is the set's fraction of the current total, clamped so the sum
/// of shares handed out never overshoots `to_add` (`added` is what previous
/// sets already received).
pub fn get_proportion(ms: &MachineSet, total: i32, to_add: i32, added: i32) -> i32 {
    let replicas = ms.spec.replicas.unwrap_or(0);
    if replicas == 0 || total <= 0 || to_add == 0 || to_add == added {
        return 0;
    }

    let fraction = (to_add as f64 * replicas as f64 / total as f64).round() as i32;
    let allowed = to_add - added;
    if to_add > 0 {
        fraction.min(allowed)
    } else {
        fraction.max(allowed)
    }
}
