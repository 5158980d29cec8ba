//! Scale-down victim selection
//!
//! Every candidate machine gets a priority in [0, 100]; the highest
//! priorities are deleted first. Machines already deleting, annotated for
//! deletion or carrying a terminal error always outrank healthy ones.

use chrono::{DateTime, Utc};

use machina_common::crd::Machine;
use machina_common::{Error, Result, DELETE_MACHINE_ANNOTATION};

const MUST_DELETE: f64 = 100.0;
const BETTER_DELETE: f64 = 50.0;
const COULD_DELETE: f64 = 20.0;
const MUST_NOT_DELETE: f64 = 0.0;

const SECONDS_PER_TEN_DAYS: f64 = 864_000.0;

/// Which machines to remove first when a set scales down
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Flagged machines first, otherwise an arbitrary candidate
    Random,
    /// Youngest machines first
    Newest,
    /// Oldest machines first
    Oldest,
}

impl DeletePolicy {
    /// Map the CRD string to a policy; empty and missing mean Random,
    /// anything unknown is a fatal configuration error
    pub fn from_spec(value: Option<&str>) -> Result<Self> {
        match value.unwrap_or("") {
            "" | "Random" => Ok(Self::Random),
            "Newest" => Ok(Self::Newest),
            "Oldest" => Ok(Self::Oldest),
            other => Err(Error::validation(format!(
                "unsupported delete policy {other:?}, must be one of 'Random', 'Newest', or 'Oldest'"
            ))),
        }
    }

    fn priority(&self, machine: &Machine, now: DateTime<Utc>) -> f64 {
        match self {
            Self::Random => random_delete_priority(machine),
            Self::Newest => newest_delete_priority(machine, now),
            Self::Oldest => oldest_delete_priority(machine, now),
        }
    }
}

fn is_flagged(machine: &Machine) -> bool {
    let annotated = machine
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DELETE_MACHINE_ANNOTATION))
        .map_or(false, |v| !v.is_empty());
    annotated || machine.has_terminal_error()
}

/// Age maps onto the priority range with a ten-day half-life style curve:
/// brand-new machines score near 0, ten-day-old ones approach 63.
fn oldest_delete_priority(machine: &Machine, now: DateTime<Utc>) -> f64 {
    if machine.metadata.deletion_timestamp.is_some() || is_flagged(machine) {
        return MUST_DELETE;
    }
    let Some(created) = machine.metadata.creation_timestamp.as_ref() else {
        return MUST_NOT_DELETE;
    };
    let age_seconds = (now - created.0).num_seconds() as f64;
    if age_seconds < 0.0 {
        return MUST_NOT_DELETE;
    }
    MUST_DELETE * (1.0 - (-age_seconds / SECONDS_PER_TEN_DAYS).exp())
}

fn newest_delete_priority(machine: &Machine, now: DateTime<Utc>) -> f64 {
    if machine.metadata.deletion_timestamp.is_some() || is_flagged(machine) {
        return MUST_DELETE;
    }
    MUST_DELETE - oldest_delete_priority(machine, now)
}

fn random_delete_priority(machine: &Machine) -> f64 {
    if machine.metadata.deletion_timestamp.is_some() {
        return MUST_DELETE;
    }
    if is_flagged(machine) {
        return BETTER_DELETE;
    }
    COULD_DELETE
}

/// Pick the `diff` machines to delete, highest priority first
pub fn machines_to_delete(
    machines: &[Machine],
    diff: usize,
    policy: DeletePolicy,
    now: DateTime<Utc>,
) -> Vec<Machine> {
    if diff >= machines.len() {
        return machines.to_vec();
    }
    if diff == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(f64, &Machine)> = machines
        .iter()
        .map(|m| (policy.priority(m, now), m))
        .collect();
    // high to low; name tiebreak keeps selection deterministic
    scored.sort_by(|(pa, ma), (pb, mb)| {
        pb.partial_cmp(pa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| ma.metadata.name.cmp(&mb.metadata.name))
    });

    scored.into_iter().take(diff).map(|(_, m)| m.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use machina_common::crd::{MachineErrorReason, MachineSpec, MachineStatus};

    fn machine(name: &str, age_seconds: i64, now: DateTime<Utc>) -> Machine {
        let mut machine = Machine::new(name, MachineSpec::default());
        machine.metadata.creation_timestamp =
            Some(Time(now - chrono::Duration::seconds(age_seconds)));
        machine
    }

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(DeletePolicy::from_spec(None).unwrap(), DeletePolicy::Random);
        assert_eq!(DeletePolicy::from_spec(Some("")).unwrap(), DeletePolicy::Random);
        assert_eq!(
            DeletePolicy::from_spec(Some("Newest")).unwrap(),
            DeletePolicy::Newest
        );
        assert_eq!(
            DeletePolicy::from_spec(Some("Oldest")).unwrap(),
            DeletePolicy::Oldest
        );
        assert!(DeletePolicy::from_spec(Some("Cheapest")).is_err());
    }

    #[test]
    fn test_priority_ordering_must_over_better_over_could() {
        let now = now();

        let mut deleting = machine("deleting", 100, now);
        deleting.metadata.deletion_timestamp = Some(Time(now));

        let mut failed = machine("failed", 100, now);
        failed.status = Some(MachineStatus {
            error_reason: Some(MachineErrorReason::Create),
            ..Default::default()
        });

        let healthy = machine("healthy", 100, now);

        // Random policy: deleting=100, failed=50, healthy=20
        assert_eq!(random_delete_priority(&deleting), MUST_DELETE);
        assert_eq!(random_delete_priority(&failed), BETTER_DELETE);
        assert_eq!(random_delete_priority(&healthy), COULD_DELETE);
    }

    #[test]
    fn test_oldest_policy_age_curve() {
        let now = now();
        let fresh = machine("fresh", 60, now);
        let ten_days = machine("ten-days", 864_000, now);
        let ancient = machine("ancient", 86_400 * 100, now);

        let fresh_p = oldest_delete_priority(&fresh, now);
        let ten_p = oldest_delete_priority(&ten_days, now);
        let ancient_p = oldest_delete_priority(&ancient, now);

        assert!(fresh_p < 1.0);
        assert!((ten_p - 63.2).abs() < 0.2, "ten-day score ~63.2, got {ten_p}");
        assert!(ancient_p > 99.0);
        assert!(fresh_p < ten_p && ten_p < ancient_p);
    }

    #[test]
    fn test_missing_creation_timestamp_is_never_deleted_first() {
        let now = now();
        let mut unborn = machine("unborn", 0, now);
        unborn.metadata.creation_timestamp = None;
        assert_eq!(oldest_delete_priority(&unborn, now), MUST_NOT_DELETE);
    }

    #[test]
    fn test_newest_policy_inverts_age() {
        let now = now();
        let young = machine("young", 60, now);
        let old = machine("old", 864_000 * 3, now);

        assert!(newest_delete_priority(&young, now) > newest_delete_priority(&old, now));
    }

    #[test]
    fn test_selection_takes_top_priorities() {
        let now = now();
        let mut annotated = machine("annotated", 50, now);
        annotated.metadata.annotations = Some(
            [(DELETE_MACHINE_ANNOTATION.to_string(), "true".to_string())]
                .into_iter()
                .collect(),
        );
        let plain_a = machine("plain-a", 50, now);
        let plain_b = machine("plain-b", 50, now);

        let victims = machines_to_delete(
            &[plain_a.clone(), annotated.clone(), plain_b.clone()],
            1,
            DeletePolicy::Random,
            now,
        );
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].metadata.name.as_deref(), Some("annotated"));

        // asking for more than exists returns everything
        let all = machines_to_delete(&[plain_a, plain_b], 5, DeletePolicy::Random, now);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_oldest_policy_selects_oldest() {
        let now = now();
        let machines = vec![
            machine("m-young", 3_600, now),
            machine("m-old", 864_000 * 5, now),
            machine("m-mid", 86_400, now),
        ];
        let victims = machines_to_delete(&machines, 2, DeletePolicy::Oldest, now);
        let names: Vec<_> = victims
            .iter()
            .map(|m| m.metadata.name.as_deref().unwrap())
            .collect();
        assert_eq!(names, vec!["m-old", "m-mid"]);
    }
}
