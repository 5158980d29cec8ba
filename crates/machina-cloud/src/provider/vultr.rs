//! Vultr instance provider
//!
//! Instances carry a tag equal to the machine UID. Userdata goes into the
//! create request base64 encoded. Vultr instance ids are UUIDs.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use machina_common::crd::{Machine, MachineSpec};
use machina_common::{Error, Result};

use crate::configvar::{ConfigVarResolver, ConfigVarString};
use crate::instance::{Instance, InstanceStatus};

use super::{http_status_to_error, machine_uid, provider_config, CloudProvider};

const DEFAULT_BASE_URL: &str = "https://api.vultr.com/v2";
const TOKEN_ENV: &str = "VULTR_API_KEY";
const PROVIDER: &str = "vultr";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    api_key: ConfigVarString,
    #[serde(default)]
    region: ConfigVarString,
    #[serde(default)]
    plan: ConfigVarString,
    #[serde(default)]
    os_id: ConfigVarString,
    #[serde(default)]
    tags: Vec<String>,
}

struct Config {
    api_key: String,
    region: String,
    plan: String,
    os_id: String,
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VultrInstance {
    id: String,
    label: String,
    status: String,
    #[serde(default)]
    power_status: String,
    #[serde(default)]
    main_ip: String,
    #[serde(default)]
    internal_ip: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    instances: Vec<VultrInstance>,
}

/// Vultr implementation of [`CloudProvider`]
pub struct VultrProvider {
    resolver: Arc<dyn ConfigVarResolver>,
    http: reqwest::Client,
    base_url: String,
}

impl VultrProvider {
    /// Create a provider using the given config resolver
    pub fn new(resolver: Arc<dyn ConfigVarResolver>) -> Self {
        Self {
            resolver,
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    fn raw_config(spec: &MachineSpec) -> Result<RawConfig> {
        let outer = provider_config(spec)?;
        serde_json::from_value(outer.cloud_provider_spec)
            .map_err(|e| Error::invalid_configuration(format!("cannot parse vultr spec: {e}")))
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config> {
        let raw = Self::raw_config(spec)?;
        Ok(Config {
            api_key: self.resolver.get_string_or_env(&raw.api_key, TOKEN_ENV).await?,
            region: self.resolver.get_string(&raw.region).await?,
            plan: self.resolver.get_string(&raw.plan).await?,
            os_id: self.resolver.get_string(&raw.os_id).await?,
            tags: raw.tags,
        })
    }

    async fn api_get<T: serde::de::DeserializeOwned>(
        &self,
        api_key: &str,
        machine: &str,
        path: &str,
    ) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|e| Error::provider_for(machine, PROVIDER, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_status_to_error(PROVIDER, machine, status, body));
        }
        response
            .json()
            .await
            .map_err(|e| Error::provider_for(machine, PROVIDER, format!("decode response: {e}")))
    }

    async fn find_instance(
        &self,
        config: &Config,
        machine: &Machine,
    ) -> Result<Option<VultrInstance>> {
        let uid = machine_uid(machine);
        let name = machine.metadata.name.clone().unwrap_or_default();
        let list: InstanceList = self
            .api_get(
                &config.api_key,
                &name,
                &format!("/instances?tag={uid}&per_page=500"),
            )
            .await?;

        let mut matches: Vec<VultrInstance> = list
            .instances
            .into_iter()
            .filter(|i| i.tags.iter().any(|t| t == &uid))
            .collect();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            n => Err(Error::terminal(
                machina_common::crd::MachineErrorReason::Delete,
                format!("found {n} instances tagged with machine UID {uid}, refusing to proceed"),
            )),
        }
    }
}

fn vultr_to_instance(vultr: &VultrInstance) -> Instance {
    let mut addresses = BTreeMap::new();
    if !vultr.main_ip.is_empty() && vultr.main_ip != "0.0.0.0" {
        addresses.insert(vultr.main_ip.clone(), "ExternalIP".to_string());
    }
    if !vultr.internal_ip.is_empty() {
        addresses.insert(vultr.internal_ip.clone(), "InternalIP".to_string());
    }

    let status = match (vultr.status.as_str(), vultr.power_status.as_str()) {
        ("pending", _) => InstanceStatus::Creating,
        ("active", "running") => InstanceStatus::Running,
        ("active", _) => InstanceStatus::Creating,
        _ => InstanceStatus::Unknown,
    };

    Instance {
        name: vultr.label.clone(),
        id: vultr.id.clone(),
        provider_id: Some(format!("vultr://{}", vultr.id)),
        addresses,
        status,
    }
}

#[async_trait]
impl CloudProvider for VultrProvider {
    async fn validate(&self, spec: &MachineSpec) -> Result<()> {
        let config = self.config(spec).await?;

        if config.api_key.is_empty() {
            return Err(Error::invalid_configuration("apiKey is missing"));
        }
        if config.region.is_empty() {
            return Err(Error::invalid_configuration("region is missing"));
        }
        if config.plan.is_empty() {
            return Err(Error::invalid_configuration("plan is missing"));
        }
        if config.os_id.is_empty() {
            return Err(Error::invalid_configuration("osId is missing"));
        }

        #[derive(Deserialize)]
        struct Regions {
            #[serde(default)]
            regions: Vec<RegionEntry>,
        }
        #[derive(Deserialize)]
        struct RegionEntry {
            id: String,
        }
        let regions: Regions = self
            .api_get(&config.api_key, "validate", "/regions?per_page=500")
            .await?;
        if !regions.regions.iter().any(|r| r.id == config.region) {
            return Err(Error::invalid_configuration(format!(
                "region {:?} not found",
                config.region
            )));
        }

        Ok(())
    }

    async fn get(&self, machine: &Machine) -> Result<Instance> {
        let config = self.config(&machine.spec).await?;
        match self.find_instance(&config, machine).await? {
            Some(instance) => Ok(vultr_to_instance(&instance)),
            None => Err(Error::instance_not_found(
                machine.metadata.name.clone().unwrap_or_default(),
            )),
        }
    }

    async fn create(&self, machine: &Machine, userdata: &str) -> Result<Instance> {
        let config = self.config(&machine.spec).await?;
        let name = machine.metadata.name.clone().unwrap_or_default();

        if let Some(existing) = self.find_instance(&config, machine).await? {
            return Ok(vultr_to_instance(&existing));
        }

        let os_id: i64 = config.os_id.parse().map_err(|_| {
            Error::invalid_configuration(format!("osId {:?} is not numeric", config.os_id))
        })?;

        let mut tags = config.tags.clone();
        tags.push(machine_uid(machine));

        let body = serde_json::json!({
            "label": name,
            "region": config.region,
            "plan": config.plan,
            "os_id": os_id,
            "tags": tags,
            "user_data": base64::engine::general_purpose::STANDARD.encode(userdata),
        });

        let response = self
            .http
            .post(format!("{}/instances", self.base_url))
            .bearer_auth(&config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::provider_for(&name, PROVIDER, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_status_to_error(PROVIDER, &name, status, body));
        }

        #[derive(Deserialize)]
        struct Created {
            instance: VultrInstance,
        }
        let created: Created = response
            .json()
            .await
            .map_err(|e| Error::provider_for(&name, PROVIDER, format!("decode response: {e}")))?;
        Ok(vultr_to_instance(&created.instance))
    }

    async fn cleanup(&self, machine: &Machine) -> Result<bool> {
        let config = self.config(&machine.spec).await?;
        let name = machine.metadata.name.clone().unwrap_or_default();

        let instance = match self.find_instance(&config, machine).await? {
            Some(instance) => instance,
            None => return Ok(true),
        };

        let response = self
            .http
            .delete(format!("{}/instances/{}", self.base_url, instance.id))
            .bearer_auth(&config.api_key)
            .send()
            .await
            .map_err(|e| Error::provider_for(&name, PROVIDER, e.to_string()))?;

        let status = response.status();
        if !status.is_success() && status.as_u16() != 404 {
            let body = response.text().await.unwrap_or_default();
            return Err(http_status_to_error(PROVIDER, &name, status, body));
        }

        Ok(false)
    }

    async fn migrate_uid(&self, machine: &Machine, new_uid: &str) -> Result<()> {
        let config = self.config(&machine.spec).await?;
        let name = machine.metadata.name.clone().unwrap_or_default();

        let instance = match self.find_instance(&config, machine).await? {
            Some(instance) => instance,
            None => return Ok(()),
        };

        let old_uid = machine_uid(machine);
        let tags: Vec<String> = instance
            .tags
            .iter()
            .map(|t| {
                if t == &old_uid {
                    new_uid.to_string()
                } else {
                    t.clone()
                }
            })
            .collect();

        let response = self
            .http
            .patch(format!("{}/instances/{}", self.base_url, instance.id))
            .bearer_auth(&config.api_key)
            .json(&serde_json::json!({"tags": tags}))
            .send()
            .await
            .map_err(|e| Error::provider_for(&name, PROVIDER, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_status_to_error(PROVIDER, &name, status, body));
        }
        Ok(())
    }

    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>> {
        let raw = Self::raw_config(&machine.spec)?;
        Ok(BTreeMap::from([
            ("provider".to_string(), PROVIDER.to_string()),
            ("region".to_string(), raw.region.value),
            ("plan".to_string(), raw.plan.value),
        ]))
    }
}
