//! Lease-based leader election
//!
//! One replica holds a coordination/v1 Lease and runs the controllers;
//! standbys block in the acquire loop. Renewal happens in a background task
//! and a lost lease terminates the process so the next replica takes over
//! with a clean slate (finalizers make interrupted work resumable).

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

const LEASE_NAMESPACE: &str = "kube-system";
const LEASE_DURATION_SECONDS: i32 = 15;
const RENEW_PERIOD: Duration = Duration::from_secs(5);
const RETRY_PERIOD: Duration = Duration::from_secs(2);

fn holder_identity() -> String {
    let host = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "machina-operator".to_string());
    format!("{host}_{}", std::process::id())
}

/// Block until this process holds the lease, then keep renewing it in the
/// background. Renewal failure aborts the process.
pub async fn acquire_and_hold(client: Client, lease_name: &str) -> anyhow::Result<()> {
    let api: Api<Lease> = Api::namespaced(client, LEASE_NAMESPACE);
    let identity = holder_identity();

    info!(lease = lease_name, %identity, "acquiring leader lease");
    loop {
        match try_acquire(&api, lease_name, &identity).await {
            Ok(true) => break,
            Ok(false) => {
                debug!(lease = lease_name, "lease held elsewhere, waiting");
                tokio::time::sleep(RETRY_PERIOD).await;
            }
            Err(e) => {
                warn!(error = %e, "lease acquisition attempt failed, retrying");
                tokio::time::sleep(RETRY_PERIOD).await;
            }
        }
    }
    info!(lease = lease_name, "became leader");

    let lease_name = lease_name.to_string();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(RENEW_PERIOD).await;
            if let Err(e) = renew(&api, &lease_name, &identity).await {
                // Losing the lease while controllers run risks two leaders;
                // exit and let the replacement start clean.
                warn!(error = %e, "failed to renew leader lease, exiting");
                std::process::exit(1);
            }
        }
    });

    Ok(())
}

async fn try_acquire(api: &Api<Lease>, name: &str, identity: &str) -> anyhow::Result<bool> {
    let now = MicroTime(Utc::now());

    match api.get(name).await {
        Ok(existing) => {
            let spec = existing.spec.clone().unwrap_or_default();
            if let Some(holder) = spec.holder_identity.as_deref() {
                if holder != identity && !lease_expired(&spec) {
                    return Ok(false);
                }
            }

            let transitions = spec.lease_transitions.unwrap_or(0)
                + if spec.holder_identity.as_deref() == Some(identity) {
                    0
                } else {
                    1
                };
            let mut updated = existing;
            updated.spec = Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(transitions),
                ..Default::default()
            });
            match api
                .replace(name, &PostParams::default(), &updated)
                .await
            {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            let lease = Lease {
                metadata: kube::api::ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(LEASE_NAMESPACE.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                    acquire_time: Some(now.clone()),
                    renew_time: Some(now),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn lease_expired(spec: &LeaseSpec) -> bool {
    let Some(renewed) = spec.renew_time.as_ref() else {
        return true;
    };
    let duration = spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS) as i64;
    Utc::now() - renewed.0 > chrono::Duration::seconds(duration)
}

async fn renew(api: &Api<Lease>, name: &str, identity: &str) -> anyhow::Result<()> {
    let current = api.get(name).await?;
    let holder = current
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref());
    if holder != Some(identity) {
        anyhow::bail!("lease {name} is now held by {holder:?}");
    }

    let patch = serde_json::json!({
        "spec": { "renewTime": MicroTime(Utc::now()) }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
