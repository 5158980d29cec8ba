//! Bootstrap userdata lookup
//!
//! Rendering bootstrap data for an operating system is an external concern;
//! the machine reconciler only needs the finished blob. The production
//! source reads the rendered secret for the machine's operating-system
//! profile; tests inject a static blob.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use machina_common::crd::Machine;
use machina_common::{Error, Result, OPERATING_SYSTEM_PROFILE_ANNOTATION};

/// Key inside the rendered userdata secret
const USERDATA_SECRET_KEY: &str = "cloud-config";

/// Source of rendered bootstrap userdata for machines
#[async_trait]
pub trait UserdataSource: Send + Sync {
    /// Return the bootstrap blob for the machine
    async fn userdata_for(&self, machine: &Machine) -> Result<String>;
}

/// Reads the rendered userdata secret `userdata-<profile>` from a fixed
/// namespace; the profile comes from the machine's operating-system-profile
/// annotation (propagated down from the MachineDeployment template)
pub struct SecretUserdataSource {
    client: Client,
    namespace: String,
}

impl SecretUserdataSource {
    /// Create a source reading rendered secrets from `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl UserdataSource for SecretUserdataSource {
    async fn userdata_for(&self, machine: &Machine) -> Result<String> {
        let profile = machine
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(OPERATING_SYSTEM_PROFILE_ANNOTATION))
            .cloned()
            .ok_or_else(|| {
                Error::invalid_configuration(format!(
                    "machine has no {OPERATING_SYSTEM_PROFILE_ANNOTATION} annotation"
                ))
            })?;

        let secret_name = format!("userdata-{profile}");
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = api.get(&secret_name).await.map_err(|e| {
            Error::invalid_configuration(format!(
                "cannot read userdata secret {secret_name:?} in {:?}: {e}",
                self.namespace
            ))
        })?;

        secret
            .data
            .as_ref()
            .and_then(|d| d.get(USERDATA_SECRET_KEY))
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
            .ok_or_else(|| {
                Error::invalid_configuration(format!(
                    "userdata secret {secret_name:?} has no {USERDATA_SECRET_KEY:?} key"
                ))
            })
    }
}

/// Fixed userdata for tests and the fake provider
pub struct StaticUserdataSource(pub String);

#[async_trait]
impl UserdataSource for StaticUserdataSource {
    async fn userdata_for(&self, _machine: &Machine) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machina_common::crd::MachineSpec;

    #[tokio::test]
    async fn test_static_source_returns_blob() {
        let source = StaticUserdataSource("#cloud-config\n".to_string());
        let machine = Machine::new("m", MachineSpec::default());
        assert_eq!(source.userdata_for(&machine).await.unwrap(), "#cloud-config\n");
    }
}
