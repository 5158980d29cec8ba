//! Tracing and metrics bootstrap for the operator process
//!
//! Log output adapts to where the process runs: JSON lines inside a cluster
//! (detected via the service-account environment), compact human-readable
//! output on a workstation. When an OTLP endpoint is configured, traces and
//! metrics are exported through it; the pipeline installs all-or-nothing so
//! a half-built exporter never becomes the global default.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::{runtime, Resource};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

/// Environment variables the Deployment's downward API populates, mapped to
/// their OpenTelemetry resource attribute keys
const K8S_RESOURCE_ATTRIBUTES: [(&str, &str); 3] = [
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("NODE_NAME", "k8s.node.name"),
];

/// How the process reports about itself
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every span, metric and log line
    pub service_name: String,

    /// OTLP collector endpoint; logging-only when unset
    pub otlp_endpoint: Option<String>,

    /// Emit JSON log lines (defaults to true when running in-cluster)
    pub json_logs: bool,

    /// Filter directives used when `RUST_LOG` is not set
    pub default_log_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "machina".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            json_logs: running_in_cluster(),
            default_log_filter: "info,machina=debug".to_string(),
        }
    }
}

/// Whether this process runs inside a Kubernetes pod
fn running_in_cluster() -> bool {
    std::env::var_os("KUBERNETES_SERVICE_HOST").is_some()
}

/// Install the global tracing subscriber and, when configured, the OTLP
/// trace and metric pipelines
pub fn init(config: TelemetryConfig) -> Result<()> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let tracer = install_otlp(endpoint, &config.service_name)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_log_filter));
    let registry = tracing_subscriber::registry().with(filter).with(otel_layer);

    let init_result = if config.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
    };
    init_result
        .map_err(|e| Error::internal_with_context("telemetry", format!("subscriber init: {e}")))
}

/// Describe this process for exported telemetry
fn process_resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ];
    for (env_var, attribute) in K8S_RESOURCE_ATTRIBUTES {
        if let Ok(value) = std::env::var(env_var) {
            attributes.push(KeyValue::new(attribute, value));
        }
    }
    Resource::new(attributes)
}

/// Build and install the OTLP trace and metric pipelines
///
/// Both exporters are constructed before either provider is installed
/// globally, so a failure leaves the process with plain logging instead of
/// a half-wired pipeline.
fn install_otlp(endpoint: &str, service_name: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::internal_with_context("telemetry", format!("span exporter: {e}")))?;
    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::internal_with_context("telemetry", format!("metric exporter: {e}")))?;

    let resource = process_resource(service_name);

    let tracer_provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(span_exporter, runtime::Tokio)
        .with_resource(resource.clone())
        .build();
    let meter_provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_reader(
            opentelemetry_sdk::metrics::PeriodicReader::builder(metric_exporter, runtime::Tokio)
                .build(),
        )
        .with_resource(resource)
        .build();

    let tracer = tracer_provider.tracer(service_name.to_string());
    global::set_tracer_provider(tracer_provider);
    global::set_meter_provider(meter_provider);

    Ok(tracer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_outside_cluster_uses_compact_logs() {
        // the test process has no service-account environment
        std::env::remove_var("KUBERNETES_SERVICE_HOST");
        let config = TelemetryConfig::default();
        assert!(!config.json_logs);
        assert_eq!(config.default_log_filter, "info,machina=debug");
    }

    #[test]
    fn test_process_resource_carries_service_identity() {
        let resource = process_resource("machina-operator");
        assert!(!resource.is_empty());
    }
}
