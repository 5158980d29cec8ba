//! The provider capability set and registry
//!
//! Each infrastructure backend implements [`CloudProvider`]. The registry
//! maps a [`CloudProviderKind`] to a constructed provider; backends without
//! an implementation resolve to a terminal configuration error so the
//! machine is parked instead of retried.

mod digitalocean;
mod fake;
mod hetzner;
mod linode;
mod vultr;

pub use digitalocean::DigitalOceanProvider;
pub use fake::FakeProvider;
pub use hetzner::HetznerProvider;
pub use linode::LinodeProvider;
pub use vultr::VultrProvider;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use machina_common::crd::{Machine, MachineSpec};
use machina_common::{Error, Result};

use crate::config::CloudProviderKind;
use crate::configvar::ConfigVarResolver;
use crate::instance::Instance;

/// How long a provider polls for an instance to leave the creating state
pub(crate) const CREATE_CHECK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Poll interval while waiting on cloud-side state changes
pub(crate) const CREATE_CHECK_PERIOD: Duration = Duration::from_secs(5);

/// Uniform capability set every infrastructure backend implements
///
/// All operations identify the instance by the machine UID, which the
/// provider stamps onto the instance as a tag or label at create time. This
/// makes `create` idempotent: a retried create after a timeout finds the
/// instance by UID and returns it instead of booting a second VM.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Fill provider-specific defaults into the spec. Pure.
    fn add_defaults(&self, spec: MachineSpec) -> Result<MachineSpec> {
        Ok(spec)
    }

    /// Validate the spec against the cloud using read-only calls only.
    ///
    /// Invalid credentials, regions, sizes or images fail with a terminal
    /// `InvalidConfigurationMachineError`.
    async fn validate(&self, spec: &MachineSpec) -> Result<()>;

    /// Fetch the instance backing the machine.
    ///
    /// Returns [`Error::InstanceNotFound`] when no instance carries the
    /// machine's UID. Finding more than one instance for the UID is a
    /// terminal error: proceeding could double-delete.
    async fn get(&self, machine: &Machine) -> Result<Instance>;

    /// Create the instance, baking `userdata` into its boot metadata.
    ///
    /// Must be idempotent per machine UID.
    async fn create(&self, machine: &Machine, userdata: &str) -> Result<Instance>;

    /// Release the instance and everything the provider created for it.
    ///
    /// Returns `Ok(true)` only once all instance-side resources are gone;
    /// `Ok(false)` means deletion is still in flight and the caller should
    /// requeue.
    async fn cleanup(&self, machine: &Machine) -> Result<bool>;

    /// Re-tag the existing instance from the machine's recorded UID to `new_uid`.
    async fn migrate_uid(&self, machine: &Machine, new_uid: &str) -> Result<()>;

    /// Cheap label map describing the machine for metrics.
    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>>;
}

/// Construct the provider implementation for a kind
///
/// Backends whose SDK integration is not part of this controller resolve to
/// a terminal configuration error.
pub fn new_cloud_provider(
    kind: CloudProviderKind,
    resolver: Arc<dyn ConfigVarResolver>,
) -> Result<Arc<dyn CloudProvider>> {
    match kind {
        CloudProviderKind::Fake => Ok(Arc::new(FakeProvider::new())),
        CloudProviderKind::DigitalOcean => Ok(Arc::new(DigitalOceanProvider::new(resolver))),
        CloudProviderKind::Hetzner => Ok(Arc::new(HetznerProvider::new(resolver))),
        CloudProviderKind::Linode => Ok(Arc::new(LinodeProvider::new(resolver))),
        CloudProviderKind::Vultr => Ok(Arc::new(VultrProvider::new(resolver))),
        other => Err(Error::invalid_configuration(format!(
            "cloud provider {other} is not implemented in this controller"
        ))),
    }
}

/// Map a cloud HTTP status to the error taxonomy
///
/// 401/403 mean the credentials or permissions are wrong and will not heal;
/// 4xx on create means the request itself is bad; everything else is
/// retryable.
pub(crate) fn http_status_to_error(
    provider: &str,
    machine: &str,
    status: reqwest::StatusCode,
    body: String,
) -> Error {
    use machina_common::crd::MachineErrorReason;

    match status.as_u16() {
        401 | 403 => Error::terminal(
            MachineErrorReason::InvalidConfiguration,
            format!("{provider}: request rejected ({status}): {body}"),
        ),
        400 | 404 | 409 | 412 | 422 => Error::terminal(
            MachineErrorReason::Create,
            format!("{provider}: request invalid ({status}): {body}"),
        ),
        _ => Error::Provider {
            machine: machine.to_string(),
            provider: provider.to_string(),
            message: format!("unexpected status {status}: {body}"),
            retryable: true,
        },
    }
}

/// UID the instance should currently be tagged with: the recorded instance
/// UID when a migration is pending, else the object UID
pub(crate) fn machine_uid(machine: &Machine) -> String {
    machine
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(machina_common::INSTANCE_UID_ANNOTATION))
        .cloned()
        .unwrap_or_else(|| machine.metadata.uid.clone().unwrap_or_default())
}

/// Parse the outer provider config from a machine spec
pub(crate) fn provider_config(spec: &MachineSpec) -> Result<crate::config::ProviderConfig> {
    crate::config::ProviderConfig::from_provider_spec(spec.provider_spec.value.as_ref())
}

impl std::fmt::Debug for dyn CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn CloudProvider").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configvar::StaticConfigVarResolver;

    #[test]
    fn test_registry_builds_implemented_providers() {
        let resolver: Arc<dyn ConfigVarResolver> = Arc::new(StaticConfigVarResolver);
        for kind in [
            CloudProviderKind::Fake,
            CloudProviderKind::DigitalOcean,
            CloudProviderKind::Hetzner,
            CloudProviderKind::Linode,
            CloudProviderKind::Vultr,
        ] {
            assert!(
                new_cloud_provider(kind, resolver.clone()).is_ok(),
                "{kind} should construct"
            );
        }
    }

    #[test]
    fn test_registry_rejects_unimplemented_kinds_terminally() {
        let resolver: Arc<dyn ConfigVarResolver> = Arc::new(StaticConfigVarResolver);
        let err = new_cloud_provider(CloudProviderKind::Nutanix, resolver).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("nutanix"));
    }

    #[test]
    fn test_auth_failures_map_to_invalid_configuration() {
        let err = http_status_to_error(
            "digitalocean",
            "worker-0",
            reqwest::StatusCode::UNAUTHORIZED,
            "bad token".into(),
        );
        assert!(err.terminal_reason().is_some());
        assert!(!err.is_retryable());

        let err = http_status_to_error(
            "digitalocean",
            "worker-0",
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "oops".into(),
        );
        assert!(err.is_retryable());
    }
}
