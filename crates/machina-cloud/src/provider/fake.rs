//! In-memory provider used by tests and dry runs
//!
//! Validation passes or fails based on a bool in its spec; instances live in
//! a process-local table keyed by machine UID, which makes the idempotency
//! and cleanup contracts observable without a cloud.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;

use machina_common::crd::{Machine, MachineSpec};
use machina_common::{Error, Result};

use crate::instance::{Instance, InstanceStatus};

use super::{machine_uid, CloudProvider};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FakeSpec {
    #[serde(default)]
    pass_validation: bool,
}

/// Provider that simulates a cloud in process memory
#[derive(Default)]
pub struct FakeProvider {
    instances: Mutex<BTreeMap<String, Instance>>,
}

impl FakeProvider {
    /// Create an empty fake cloud
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_spec(spec: &MachineSpec) -> Result<FakeSpec> {
        let value = spec.provider_spec.value.as_ref().ok_or_else(|| {
            Error::invalid_configuration("machine.spec.providerSpec.value is empty")
        })?;
        let cloud_spec = value.get("cloudProviderSpec").cloned().unwrap_or_default();
        serde_json::from_value(cloud_spec)
            .map_err(|e| Error::invalid_configuration(format!("cannot parse fake spec: {e}")))
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    async fn validate(&self, spec: &MachineSpec) -> Result<()> {
        let fake = Self::parse_spec(spec)?;
        if fake.pass_validation {
            tracing::debug!("succeeding validation as requested");
            return Ok(());
        }
        tracing::debug!("failing validation as requested");
        Err(Error::invalid_configuration("failing validation as requested"))
    }

    async fn get(&self, machine: &Machine) -> Result<Instance> {
        let uid = machine_uid(machine);
        self.instances
            .lock()
            .expect("fake instance table poisoned")
            .get(&uid)
            .cloned()
            .ok_or_else(|| Error::instance_not_found(machine.metadata.name.clone().unwrap_or_default()))
    }

    async fn create(&self, machine: &Machine, _userdata: &str) -> Result<Instance> {
        let uid = machine_uid(machine);
        let name = machine.metadata.name.clone().unwrap_or_default();
        let mut table = self.instances.lock().expect("fake instance table poisoned");
        let instance = table.entry(uid.clone()).or_insert_with(|| Instance {
            name,
            id: uid.clone(),
            provider_id: Some(format!("fake://{uid}")),
            addresses: BTreeMap::from([("192.0.2.1".to_string(), "InternalIP".to_string())]),
            status: InstanceStatus::Running,
        });
        Ok(instance.clone())
    }

    async fn cleanup(&self, machine: &Machine) -> Result<bool> {
        let uid = machine_uid(machine);
        self.instances
            .lock()
            .expect("fake instance table poisoned")
            .remove(&uid);
        Ok(true)
    }

    async fn migrate_uid(&self, machine: &Machine, new_uid: &str) -> Result<()> {
        let mut table = self.instances.lock().expect("fake instance table poisoned");
        if let Some(mut instance) = table.remove(&machine_uid(machine)) {
            instance.id = new_uid.to_string();
            instance.provider_id = Some(format!("fake://{new_uid}"));
            table.insert(new_uid.to_string(), instance);
        }
        Ok(())
    }

    fn machine_metrics_labels(&self, _machine: &Machine) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machina_common::crd::MachineSpec;

    fn machine_with(uid: &str, pass_validation: bool) -> Machine {
        let mut machine = Machine::new(
            "worker-0",
            MachineSpec {
                provider_spec: machina_common::crd::ProviderSpec {
                    value: Some(serde_json::json!({
                        "cloudProvider": "fake",
                        "cloudProviderSpec": {"passValidation": pass_validation}
                    })),
                },
                ..Default::default()
            },
        );
        machine.metadata.uid = Some(uid.to_string());
        machine
    }

    #[tokio::test]
    async fn test_validation_follows_the_spec_flag() {
        let provider = FakeProvider::new();
        assert!(provider.validate(&machine_with("u1", true).spec).await.is_ok());

        let err = provider
            .validate(&machine_with("u1", false).spec)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_uid() {
        let provider = FakeProvider::new();
        let machine = machine_with("uid-1", true);

        let first = provider.create(&machine, "#cloud-config").await.unwrap();
        let second = provider.create(&machine, "#cloud-config").await.unwrap();
        assert_eq!(first, second);

        let got = provider.get(&machine).await.unwrap();
        assert_eq!(got.id, "uid-1");
    }

    #[tokio::test]
    async fn test_cleanup_removes_instance_and_get_reports_not_found() {
        let provider = FakeProvider::new();
        let machine = machine_with("uid-2", true);
        provider.create(&machine, "").await.unwrap();

        assert!(provider.cleanup(&machine).await.unwrap());
        let err = provider.get(&machine).await.unwrap_err();
        assert!(err.is_instance_not_found());

        // cleanup of a missing instance stays done
        assert!(provider.cleanup(&machine).await.unwrap());
    }

    #[tokio::test]
    async fn test_migrate_uid_retags_instance() {
        let provider = FakeProvider::new();
        let mut machine = machine_with("old-uid", true);
        provider.create(&machine, "").await.unwrap();

        provider.migrate_uid(&machine, "new-uid").await.unwrap();
        assert!(provider.get(&machine).await.unwrap_err().is_instance_not_found());

        machine.metadata.uid = Some("new-uid".to_string());
        let instance = provider.get(&machine).await.unwrap();
        assert_eq!(instance.provider_id.as_deref(), Some("fake://new-uid"));
    }
}
