//! machina operator - declarative lifecycle for cloud-backed worker nodes

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, CustomResourceExt};
use tracing::{debug, error, info};

use machina_cloud::KubeConfigVarResolver;
use machina_common::crd::{Machine, MachineDeployment, MachineSet};
use machina_common::telemetry::{self, TelemetryConfig};
use machina_common::KubeEventPublisher;
use machina_controllers::machine::{
    DefaultProviderRegistry, MachineControllerSettings, SecretUserdataSource,
};
use machina_controllers::{machine, machinedeployment, machineset, nodecsrapprover};

mod leader;
mod probes;

/// machina - CRD-driven lifecycle controller for cloud-backed Kubernetes
/// worker nodes
#[derive(Parser, Debug)]
#[command(name = "machina-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Delete machines whose node has not joined after this many seconds
    /// (0 disables the timeout)
    #[arg(long = "join-cluster-timeout", default_value_t = 0)]
    join_cluster_timeout: u64,

    /// Skip pod eviction this many seconds after machine deletion started
    #[arg(long = "skip-evict-after", default_value_t = 7200)]
    skip_evict_after: u64,

    /// Maximum concurrent reconciliations per controller
    #[arg(long = "worker-count", default_value_t = 10)]
    worker_count: usize,

    /// Acquire a Lease before starting controllers
    #[arg(long = "leader-elect", default_value_t = true, action = clap::ArgAction::Set)]
    leader_elect: bool,

    /// Listen address for the metrics endpoint
    #[arg(long = "metrics-address", default_value = "0.0.0.0:8080")]
    metrics_address: SocketAddr,

    /// Listen address for the health probes
    #[arg(long = "health-probe-address", default_value = "0.0.0.0:8081")]
    health_probe_address: SocketAddr,

    /// Run the node CSR approver controller
    #[arg(long = "node-csr-approver", default_value_t = true, action = clap::ArgAction::Set)]
    node_csr_approver: bool,

    /// Restrict watches to one namespace (all namespaces when empty)
    #[arg(long)]
    namespace: Option<String>,

    /// Cluster DNS address handed to the userdata renderer
    #[arg(long = "cluster-dns", default_value = "10.10.10.10")]
    cluster_dns: String,

    /// Directory with the webhook serving certificate (accepted for
    /// deployment compatibility; admission is served separately)
    #[arg(long = "webhook-cert-dir", default_value = "")]
    webhook_cert_dir: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print_crds()?;
        return Ok(());
    }

    telemetry::init(TelemetryConfig {
        service_name: "machina-operator".to_string(),
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {e}"))?;

    run(cli).await
}

fn print_crds() -> anyhow::Result<()> {
    for crd in [
        MachineDeployment::crd(),
        MachineSet::crd(),
        Machine::crd(),
    ] {
        println!("---");
        print!(
            "{}",
            serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?
        );
    }
    Ok(())
}

/// Ensure the machina CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply so
/// the schema always matches the binary.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("machina-operator").force();

    for (name, crd) in [
        ("machinedeployments.cluster.k8s.io", MachineDeployment::crd()),
        ("machinesets.cluster.k8s.io", MachineSet::crd()),
        ("machines.cluster.k8s.io", Machine::crd()),
    ] {
        info!(crd = name, "installing CRD");
        crds.patch(name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install CRD {name}: {e}"))?;
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    info!("machina operator starting...");
    if !cli.webhook_cert_dir.is_empty() {
        debug!(dir = %cli.webhook_cert_dir, "webhook certificate directory configured");
    }

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    ensure_crds_installed(&client).await?;

    // Probes and metrics come up before leader election so a standby
    // replica still answers its liveness checks.
    let probe_server = probes::spawn(cli.health_probe_address, cli.metrics_address).await?;

    if cli.leader_elect {
        leader::acquire_and_hold(client.clone(), "machina-operator").await?;
    }

    let settings = MachineControllerSettings {
        join_cluster_timeout: (cli.join_cluster_timeout > 0)
            .then(|| Duration::from_secs(cli.join_cluster_timeout)),
        skip_eviction_after: Duration::from_secs(cli.skip_evict_after),
    };
    info!(
        worker_count = cli.worker_count,
        join_cluster_timeout = cli.join_cluster_timeout,
        skip_evict_after = cli.skip_evict_after,
        cluster_dns = %cli.cluster_dns,
        namespace = cli.namespace.as_deref().unwrap_or("<all>"),
        "controller configuration"
    );

    let deployments: Api<MachineDeployment> = scoped_api(&client, cli.namespace.as_deref());
    let sets: Api<MachineSet> = scoped_api(&client, cli.namespace.as_deref());
    let machines: Api<Machine> = scoped_api(&client, cli.namespace.as_deref());

    let md_ctx = Arc::new(machinedeployment::Context::new(
        client.clone(),
        Arc::new(KubeEventPublisher::new(
            client.clone(),
            "machina-machinedeployment-controller",
        )),
    ));
    let ms_ctx = Arc::new(machineset::Context::new(
        client.clone(),
        Arc::new(KubeEventPublisher::new(
            client.clone(),
            "machina-machineset-controller",
        )),
    ));

    let userdata_namespace = cli
        .namespace
        .clone()
        .unwrap_or_else(|| "kube-system".to_string());
    let machine_ctx = Arc::new(machine::Context {
        kube: Arc::new(machine::MachineKubeClientImpl::new(client.clone())),
        events: Arc::new(KubeEventPublisher::new(
            client.clone(),
            "machina-machine-controller",
        )),
        providers: Arc::new(DefaultProviderRegistry::new(Arc::new(
            KubeConfigVarResolver::new(client.clone()),
        ))),
        userdata: Arc::new(SecretUserdataSource::new(client.clone(), userdata_namespace)),
        settings,
    });

    info!("starting machina controllers...");
    info!("  - MachineDeployment controller");
    info!("  - MachineSet controller");
    info!("  - Machine controller");
    if cli.node_csr_approver {
        info!("  - NodeCSRApprover controller");
    }

    let md_controller = Controller::new(deployments, WatcherConfig::default())
        .shutdown_on_signal()
        .run(
            machinedeployment::reconcile,
            machinedeployment::error_policy,
            md_ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "machinedeployment reconciliation completed"),
                Err(e) => error!(error = ?e, "machinedeployment reconciliation error"),
            }
        });

    let ms_controller = Controller::new(sets, WatcherConfig::default())
        .shutdown_on_signal()
        .run(machineset::reconcile, machineset::error_policy, ms_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "machineset reconciliation completed"),
                Err(e) => error!(error = ?e, "machineset reconciliation error"),
            }
        });

    let machine_controller = Controller::new(machines, WatcherConfig::default())
        .shutdown_on_signal()
        .run(machine::reconcile, machine::error_policy, machine_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "machine reconciliation completed"),
                Err(e) => error!(error = ?e, "machine reconciliation error"),
            }
        });

    let csr_controller = if cli.node_csr_approver {
        let csrs: Api<k8s_openapi::api::certificates::v1::CertificateSigningRequest> =
            Api::all(client.clone());
        let csr_ctx = Arc::new(nodecsrapprover::Context::new(client.clone()));
        Some(
            Controller::new(csrs, WatcherConfig::default())
                .shutdown_on_signal()
                .run(
                    nodecsrapprover::reconcile,
                    nodecsrapprover::error_policy,
                    csr_ctx,
                )
                .for_each(|result| async move {
                    match result {
                        Ok(action) => debug!(?action, "csr reconciliation completed"),
                        Err(e) => error!(error = ?e, "csr reconciliation error"),
                    }
                }),
        )
    } else {
        None
    };

    // Run everything until shutdown; each controller finishes on SIGTERM.
    match csr_controller {
        Some(csr_controller) => {
            tokio::join!(md_controller, ms_controller, machine_controller, csr_controller);
        }
        None => {
            tokio::join!(md_controller, ms_controller, machine_controller);
        }
    }

    probe_server.abort();
    info!("machina operator shutting down");
    Ok(())
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}
