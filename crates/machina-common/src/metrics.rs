//! Metrics registry for machina observability
//!
//! Provides OpenTelemetry metrics for:
//! - Reconcile loops (duration, error counts) per controller
//! - Machine fleet state (machines by phase, by provider)
//! - Cloud provider calls (duration, error counts)
//! - CSR approvals

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for machina metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("machina"));

/// Histogram of reconciliation duration
///
/// Labels:
/// - `controller`: machinedeployment, machineset, machine, nodecsrapprover
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("machina_reconcile_duration_seconds")
        .with_description("Duration of reconciliations in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconciliation errors
///
/// Labels:
/// - `controller`: machinedeployment, machineset, machine, nodecsrapprover
/// - `error_type`: transient, terminal
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("machina_reconcile_errors_total")
        .with_description("Total number of reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Gauge of machines by provider, fed from `machine_metrics_labels`
///
/// Labels: whatever the owning provider returns (typically `provider`,
/// `region`, `size`).
pub static MACHINES: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("machina_machines")
        .with_description("Number of machines by provider labels")
        .with_unit("{machines}")
        .build()
});

/// Counter of cloud provider operations
///
/// Labels:
/// - `provider`: digitalocean, hetzner, ...
/// - `operation`: get, create, cleanup, migrate_uid, validate
/// - `result`: success, error
pub static PROVIDER_OPERATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("machina_provider_operations_total")
        .with_description("Total number of cloud provider operations")
        .with_unit("{operations}")
        .build()
});

/// Counter of machines deleted because their node never joined the cluster
pub static JOIN_TIMEOUTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("machina_join_cluster_timeouts_total")
        .with_description("Machines deleted after exceeding the join-cluster timeout")
        .with_unit("{machines}")
        .build()
});

/// Counter of approved node serving-certificate CSRs
pub static CSRS_APPROVED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("machina_node_csrs_approved_total")
        .with_description("Total number of auto-approved kubelet serving CSRs")
        .with_unit("{csrs}")
        .build()
});

/// Record a reconciliation with timing for one controller
pub struct ReconcileTimer {
    controller: &'static str,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(controller: &'static str) -> Self {
        Self {
            controller,
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion
    pub fn error(self, error_type: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("error_type", error_type.to_string()),
            ],
        );
    }
}

/// Record one provider operation outcome
pub fn record_provider_operation(provider: &str, operation: &'static str, ok: bool) {
    PROVIDER_OPERATIONS.add(
        1,
        &[
            KeyValue::new("provider", provider.to_string()),
            KeyValue::new("operation", operation),
            KeyValue::new("result", if ok { "success" } else { "error" }),
        ],
    );
}

/// Set the machine gauge for one label set produced by
/// `CloudProvider::machine_metrics_labels`
pub fn set_machine_gauge(labels: &std::collections::BTreeMap<String, String>, value: i64) {
    let kv: Vec<KeyValue> = labels
        .iter()
        .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
        .collect();
    MACHINES.record(value, &kv);
}
