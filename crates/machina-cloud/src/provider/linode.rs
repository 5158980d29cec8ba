//! Linode instance provider
//!
//! Instances are identified by a tag equal to the machine UID. Userdata is
//! delivered through the metadata service and must be base64 encoded. Linode
//! requires a root password on create; one is generated and thrown away
//! since access is key- or userdata-based.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;

use machina_common::crd::{Machine, MachineSpec};
use machina_common::{Error, Result};

use crate::configvar::{ConfigVarResolver, ConfigVarString};
use crate::instance::{Instance, InstanceStatus};

use super::{http_status_to_error, machine_uid, provider_config, CloudProvider};

const DEFAULT_BASE_URL: &str = "https://api.linode.com/v4";
const TOKEN_ENV: &str = "LINODE_TOKEN";
const PROVIDER: &str = "linode";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    token: ConfigVarString,
    #[serde(default)]
    region: ConfigVarString,
    #[serde(default, rename = "type")]
    type_: ConfigVarString,
    #[serde(default)]
    image: ConfigVarString,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    authorized_keys: Vec<String>,
}

struct Config {
    token: String,
    region: String,
    type_: String,
    image: String,
    tags: Vec<String>,
    authorized_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LinodeInstance {
    id: u64,
    label: String,
    status: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    ipv4: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    data: Vec<LinodeInstance>,
    #[serde(default)]
    pages: u32,
    #[serde(default)]
    page: u32,
}

/// Linode implementation of [`CloudProvider`]
pub struct LinodeProvider {
    resolver: Arc<dyn ConfigVarResolver>,
    http: reqwest::Client,
    base_url: String,
}

impl LinodeProvider {
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
            .map_err(|e| Error::invalid_configuration(format!("cannot parse linode spec: {e}")))
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config> {
        let raw = Self::raw_config(spec)?;
        Ok(Config {
            token: self.resolver.get_string_or_env(&raw.token, TOKEN_ENV).await?,
            region: self.resolver.get_string(&raw.region).await?,
            type_: self.resolver.get_string(&raw.type_).await?,
            image: self.resolver.get_string(&raw.image).await?,
            tags: raw.tags,
            authorized_keys: raw.authorized_keys,
        })
    }

    async fn api_get<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        machine: &str,
        path: &str,
    ) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(token)
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
    ) -> Result<Option<LinodeInstance>> {
        let uid = machine_uid(machine);
        let name = machine.metadata.name.clone().unwrap_or_default();

        let mut matches: Vec<LinodeInstance> = Vec::new();
        let mut page = 1u32;
        loop {
            let list: InstanceList = self
                .api_get(
                    &config.token,
                    &name,
                    &format!("/linode/instances?page={page}&page_size=500"),
                )
                .await?;
            matches.extend(
                list.data
                    .into_iter()
                    .filter(|i| i.tags.iter().any(|t| t == &uid)),
            );
            if list.page >= list.pages || list.pages == 0 {
                break;
            }
            page += 1;
        }

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            n => Err(Error::terminal(
                machina_common::crd::MachineErrorReason::Delete,
                format!("found {n} linodes tagged with machine UID {uid}, refusing to proceed"),
            )),
        }
    }
}

fn linode_to_instance(linode: &LinodeInstance) -> Instance {
    let mut addresses = BTreeMap::new();
    for ip in &linode.ipv4 {
        // Linode reports private RFC1918 addresses in the same list
        let kind = if ip.starts_with("192.168.") || ip.starts_with("10.") {
            "InternalIP"
        } else {
            "ExternalIP"
        };
        addresses.insert(ip.clone(), kind.to_string());
    }

    let status = match linode.status.as_str() {
        "provisioning" | "booting" | "offline" => InstanceStatus::Creating,
        "running" => InstanceStatus::Running,
        "deleting" | "shutting_down" => InstanceStatus::Deleting,
        _ => InstanceStatus::Unknown,
    };

    Instance {
        name: linode.label.clone(),
        id: linode.id.to_string(),
        provider_id: Some(format!("linode://{}", linode.id)),
        addresses,
        status,
    }
}

fn random_root_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[async_trait]
impl CloudProvider for LinodeProvider {
    async fn validate(&self, spec: &MachineSpec) -> Result<()> {
        let config = self.config(spec).await?;

        if config.token.is_empty() {
            return Err(Error::invalid_configuration("token is missing"));
        }
        if config.region.is_empty() {
            return Err(Error::invalid_configuration("region is missing"));
        }
        if config.type_.is_empty() {
            return Err(Error::invalid_configuration("type is missing"));
        }
        if config.image.is_empty() {
            return Err(Error::invalid_configuration("image is missing"));
        }

        // Read-only existence checks; a 404 from either means bad config.
        #[derive(Deserialize)]
        struct Ignored {}
        let region: Result<Ignored> = self
            .api_get(&config.token, "validate", &format!("/regions/{}", config.region))
            .await;
        if region.is_err() {
            return Err(Error::invalid_configuration(format!(
                "region {:?} not found",
                config.region
            )));
        }
        let type_: Result<Ignored> = self
            .api_get(
                &config.token,
                "validate",
                &format!("/linode/types/{}", config.type_),
            )
            .await;
        if type_.is_err() {
            return Err(Error::invalid_configuration(format!(
                "type {:?} not found",
                config.type_
            )));
        }

        Ok(())
    }

    async fn get(&self, machine: &Machine) -> Result<Instance> {
        let config = self.config(&machine.spec).await?;
        match self.find_instance(&config, machine).await? {
            Some(linode) => Ok(linode_to_instance(&linode)),
            None => Err(Error::instance_not_found(
                machine.metadata.name.clone().unwrap_or_default(),
            )),
        }
    }

    async fn create(&self, machine: &Machine, userdata: &str) -> Result<Instance> {
        let config = self.config(&machine.spec).await?;
        let name = machine.metadata.name.clone().unwrap_or_default();

        if let Some(existing) = self.find_instance(&config, machine).await? {
            return Ok(linode_to_instance(&existing));
        }

        let mut tags = config.tags.clone();
        tags.push(machine_uid(machine));

        let body = serde_json::json!({
            "label": name,
            "region": config.region,
            "type": config.type_,
            "image": config.image,
            "tags": tags,
            "root_pass": random_root_password(),
            "authorized_keys": config.authorized_keys,
            "metadata": {
                "user_data": base64::engine::general_purpose::STANDARD.encode(userdata),
            },
        });

        let response = self
            .http
            .post(format!("{}/linode/instances", self.base_url))
            .bearer_auth(&config.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::provider_for(&name, PROVIDER, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_status_to_error(PROVIDER, &name, status, body));
        }
        let created: LinodeInstance = response
            .json()
            .await
            .map_err(|e| Error::provider_for(&name, PROVIDER, format!("decode response: {e}")))?;
        Ok(linode_to_instance(&created))
    }

    async fn cleanup(&self, machine: &Machine) -> Result<bool> {
        let config = self.config(&machine.spec).await?;
        let name = machine.metadata.name.clone().unwrap_or_default();

        let linode = match self.find_instance(&config, machine).await? {
            Some(linode) => linode,
            None => return Ok(true),
        };

        let response = self
            .http
            .delete(format!("{}/linode/instances/{}", self.base_url, linode.id))
            .bearer_auth(&config.token)
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

        let linode = match self.find_instance(&config, machine).await? {
            Some(linode) => linode,
            None => return Ok(()),
        };

        let old_uid = machine_uid(machine);
        let tags: Vec<String> = linode
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
            .put(format!("{}/linode/instances/{}", self.base_url, linode.id))
            .bearer_auth(&config.token)
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
            ("type".to_string(), raw.type_.value),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_status_mapping() {
        let linode: LinodeInstance = serde_json::from_value(serde_json::json!({
            "id": 9000, "label": "worker-ln-0", "status": "running",
            "tags": ["uid-9"], "ipv4": ["192.168.128.5", "198.51.100.3"]
        }))
        .unwrap();

        let instance = linode_to_instance(&linode);
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.provider_id.as_deref(), Some("linode://9000"));
        assert_eq!(instance.addresses.get("192.168.128.5").unwrap(), "InternalIP");
        assert_eq!(instance.addresses.get("198.51.100.3").unwrap(), "ExternalIP");
    }

    #[test]
    fn test_random_root_password_length_and_charset() {
        let password = random_root_password();
        assert_eq!(password.len(), 32);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(password, random_root_password());
    }
}
