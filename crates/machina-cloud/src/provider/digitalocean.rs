//! DigitalOcean droplet provider
//!
//! Instances are identified by a droplet tag equal to the machine UID.
//! Droplet creation applies tags asynchronously, so create polls until the
//! UID tag is visible before reporting success.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use machina_common::crd::{Machine, MachineSpec};
use machina_common::{Error, Result};

use crate::config::OperatingSystem;
use crate::configvar::{ConfigVarBool, ConfigVarResolver, ConfigVarString};
use crate::instance::{Instance, InstanceStatus};

use super::{
    http_status_to_error, machine_uid, provider_config, CloudProvider, CREATE_CHECK_PERIOD,
    CREATE_CHECK_TIMEOUT,
};

const DEFAULT_BASE_URL: &str = "https://api.digitalocean.com/v2";
const TOKEN_ENV: &str = "DO_TOKEN";
const PROVIDER: &str = "digitalocean";

/// Raw, unresolved provider spec as carried on the machine
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    token: ConfigVarString,
    #[serde(default)]
    region: ConfigVarString,
    #[serde(default)]
    size: ConfigVarString,
    #[serde(default)]
    image: ConfigVarString,
    #[serde(default)]
    backups: ConfigVarBool,
    #[serde(default)]
    ipv6: ConfigVarBool,
    #[serde(default)]
    private_networking: ConfigVarBool,
    #[serde(default)]
    monitoring: ConfigVarBool,
    #[serde(default)]
    tags: Vec<ConfigVarString>,
}

/// Fully resolved configuration
struct Config {
    token: String,
    region: String,
    size: String,
    image: String,
    backups: bool,
    ipv6: bool,
    private_networking: bool,
    monitoring: bool,
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Droplet {
    id: u64,
    name: String,
    status: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    networks: Networks,
}

#[derive(Debug, Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkAddress>,
    #[serde(default)]
    v6: Vec<NetworkAddress>,
}

#[derive(Debug, Deserialize)]
struct NetworkAddress {
    ip_address: String,
    #[serde(rename = "type")]
    type_: String,
}

#[derive(Debug, Deserialize)]
struct DropletList {
    #[serde(default)]
    droplets: Vec<Droplet>,
}

#[derive(Debug, Deserialize)]
struct DropletGet {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct RegionList {
    #[serde(default)]
    regions: Vec<Region>,
}

#[derive(Debug, Deserialize)]
struct Region {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct SizeList {
    #[serde(default)]
    sizes: Vec<Size>,
}

#[derive(Debug, Deserialize)]
struct Size {
    slug: String,
    available: bool,
    #[serde(default)]
    regions: Vec<String>,
}

/// DigitalOcean implementation of [`CloudProvider`]
pub struct DigitalOceanProvider {
    resolver: Arc<dyn ConfigVarResolver>,
    http: reqwest::Client,
    base_url: String,
}

impl DigitalOceanProvider {
    /// Create a provider using the given config resolver
    pub fn new(resolver: Arc<dyn ConfigVarResolver>) -> Self {
        Self {
            resolver,
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    fn raw_config(spec: &MachineSpec) -> Result<(RawConfig, OperatingSystem)> {
        let outer = provider_config(spec)?;
        let raw: RawConfig = serde_json::from_value(outer.cloud_provider_spec.clone())
            .map_err(|e| Error::invalid_configuration(format!("cannot parse digitalocean spec: {e}")))?;
        Ok((raw, outer.operating_system))
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config> {
        let (raw, os) = Self::raw_config(spec)?;

        let token = self.resolver.get_string_or_env(&raw.token, TOKEN_ENV).await?;
        let region = self.resolver.get_string(&raw.region).await?;
        let size = self.resolver.get_string(&raw.size).await?;
        let mut image = self.resolver.get_string(&raw.image).await?;
        if image.is_empty() {
            image = default_image_slug(os)?.to_string();
        }

        let mut tags = Vec::with_capacity(raw.tags.len());
        for tag in &raw.tags {
            tags.push(self.resolver.get_string(tag).await?);
        }

        Ok(Config {
            token,
            region,
            size,
            image,
            backups: self.resolver.get_bool(&raw.backups).await?.unwrap_or(false),
            ipv6: self.resolver.get_bool(&raw.ipv6).await?.unwrap_or(false),
            private_networking: self
                .resolver
                .get_bool(&raw.private_networking)
                .await?
                .unwrap_or(false),
            monitoring: self.resolver.get_bool(&raw.monitoring).await?.unwrap_or(false),
            tags,
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

    async fn find_droplet(&self, config: &Config, machine: &Machine) -> Result<Option<Droplet>> {
        let uid = machine_uid(machine);
        let name = machine.metadata.name.clone().unwrap_or_default();
        let list: DropletList = self
            .api_get(
                &config.token,
                &name,
                &format!("/droplets?tag_name={uid}&per_page=200"),
            )
            .await?;

        let mut matches: Vec<Droplet> = list
            .droplets
            .into_iter()
            .filter(|d| d.tags.iter().any(|t| t == &uid))
            .collect();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            n => Err(Error::terminal(
                machina_common::crd::MachineErrorReason::Delete,
                format!("found {n} droplets tagged with machine UID {uid}, refusing to proceed"),
            )),
        }
    }
}

fn default_image_slug(os: OperatingSystem) -> Result<&'static str> {
    match os {
        OperatingSystem::Ubuntu => Ok("ubuntu-24-04-x64"),
        OperatingSystem::RockyLinux => Ok("rockylinux-9-x64"),
        os => Err(Error::invalid_configuration(format!(
            "operating system {os:?} is not supported on digitalocean"
        ))),
    }
}

fn droplet_to_instance(droplet: &Droplet) -> Instance {
    let mut addresses = BTreeMap::new();
    for addr in &droplet.networks.v4 {
        let kind = if addr.type_ == "public" {
            "ExternalIP"
        } else {
            "InternalIP"
        };
        addresses.insert(addr.ip_address.clone(), kind.to_string());
    }
    for addr in &droplet.networks.v6 {
        let kind = if addr.type_ == "public" {
            "ExternalIP"
        } else {
            "InternalIP"
        };
        addresses.insert(addr.ip_address.clone(), kind.to_string());
    }

    let status = match droplet.status.as_str() {
        "new" => InstanceStatus::Creating,
        "active" => InstanceStatus::Running,
        _ => InstanceStatus::Unknown,
    };

    Instance {
        name: droplet.name.clone(),
        id: droplet.id.to_string(),
        provider_id: Some(format!("digitalocean://{}", droplet.id)),
        addresses,
        status,
    }
}

#[async_trait]
impl CloudProvider for DigitalOceanProvider {
    async fn validate(&self, spec: &MachineSpec) -> Result<()> {
        let config = self.config(spec).await?;

        if config.token.is_empty() {
            return Err(Error::invalid_configuration("token is missing"));
        }
        if config.region.is_empty() {
            return Err(Error::invalid_configuration("region is missing"));
        }
        if config.size.is_empty() {
            return Err(Error::invalid_configuration("size is missing"));
        }

        let regions: RegionList = self
            .api_get(&config.token, "validate", "/regions?per_page=200")
            .await?;
        if !regions.regions.iter().any(|r| r.slug == config.region) {
            return Err(Error::invalid_configuration(format!(
                "region {:?} not found",
                config.region
            )));
        }

        let sizes: SizeList = self
            .api_get(&config.token, "validate", "/sizes?per_page=200")
            .await?;
        match sizes.sizes.iter().find(|s| s.slug == config.size) {
            None => {
                return Err(Error::invalid_configuration(format!(
                    "size {:?} not found",
                    config.size
                )))
            }
            Some(size) if !size.available => {
                return Err(Error::invalid_configuration(format!(
                    "size {:?} is not available",
                    config.size
                )))
            }
            Some(size) if !size.regions.iter().any(|r| r == &config.region) => {
                return Err(Error::invalid_configuration(format!(
                    "size {:?} is not available in region {:?}",
                    config.size, config.region
                )))
            }
            Some(_) => {}
        }

        Ok(())
    }

    async fn get(&self, machine: &Machine) -> Result<Instance> {
        let config = self.config(&machine.spec).await?;
        match self.find_droplet(&config, machine).await? {
            Some(droplet) => Ok(droplet_to_instance(&droplet)),
            None => Err(Error::instance_not_found(
                machine.metadata.name.clone().unwrap_or_default(),
            )),
        }
    }

    async fn create(&self, machine: &Machine, userdata: &str) -> Result<Instance> {
        let config = self.config(&machine.spec).await?;
        let uid = machine_uid(machine);
        let name = machine.metadata.name.clone().unwrap_or_default();

        // A retried create after a timeout must not boot a second droplet.
        if let Some(existing) = self.find_droplet(&config, machine).await? {
            return Ok(droplet_to_instance(&existing));
        }

        let mut tags = config.tags.clone();
        tags.push(uid.clone());

        let body = serde_json::json!({
            "name": name,
            "region": config.region,
            "size": config.size,
            "image": config.image,
            "ipv6": config.ipv6,
            "backups": config.backups,
            "monitoring": config.monitoring,
            "private_networking": config.private_networking,
            "user_data": userdata,
            "tags": tags,
        });

        let response = self
            .http
            .post(format!("{}/droplets", self.base_url))
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
        let created: DropletGet = response
            .json()
            .await
            .map_err(|e| Error::provider_for(&name, PROVIDER, format!("decode response: {e}")))?;

        // Tags apply only once the droplet is up; wait for the UID tag so a
        // concurrent get() can already find the instance.
        let deadline = std::time::Instant::now() + CREATE_CHECK_TIMEOUT;
        loop {
            let current: DropletGet = self
                .api_get(
                    &config.token,
                    &name,
                    &format!("/droplets/{}", created.droplet.id),
                )
                .await?;
            if current.droplet.tags.iter().any(|t| t == &uid) {
                return Ok(droplet_to_instance(&current.droplet));
            }
            if std::time::Instant::now() >= deadline {
                return Err(Error::provider_for(
                    &name,
                    PROVIDER,
                    format!(
                        "droplet {} got created but the UID tag never appeared",
                        created.droplet.id
                    ),
                ));
            }
            tokio::time::sleep(CREATE_CHECK_PERIOD).await;
        }
    }

    async fn cleanup(&self, machine: &Machine) -> Result<bool> {
        let config = self.config(&machine.spec).await?;
        let name = machine.metadata.name.clone().unwrap_or_default();

        let droplet = match self.find_droplet(&config, machine).await? {
            Some(droplet) => droplet,
            None => return Ok(true),
        };

        let response = self
            .http
            .delete(format!("{}/droplets/{}", self.base_url, droplet.id))
            .bearer_auth(&config.token)
            .send()
            .await
            .map_err(|e| Error::provider_for(&name, PROVIDER, e.to_string()))?;

        let status = response.status();
        if !status.is_success() && status.as_u16() != 404 {
            let body = response.text().await.unwrap_or_default();
            return Err(http_status_to_error(PROVIDER, &name, status, body));
        }

        // Deletion is asynchronous; the next reconcile observes the droplet
        // gone and reports done.
        Ok(false)
    }

    async fn migrate_uid(&self, machine: &Machine, new_uid: &str) -> Result<()> {
        let config = self.config(&machine.spec).await?;
        let name = machine.metadata.name.clone().unwrap_or_default();

        let droplet = match self.find_droplet(&config, machine).await? {
            Some(droplet) => droplet,
            None => return Ok(()),
        };

        // Tag creation is idempotent on the DO side.
        let response = self
            .http
            .post(format!("{}/tags", self.base_url))
            .bearer_auth(&config.token)
            .json(&serde_json::json!({"name": new_uid}))
            .send()
            .await
            .map_err(|e| Error::provider_for(&name, PROVIDER, e.to_string()))?;
        if !response.status().is_success() && response.status().as_u16() != 409 {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(http_status_to_error(PROVIDER, &name, status, body));
        }

        let resources = serde_json::json!({
            "resources": [{"resource_id": droplet.id.to_string(), "resource_type": "droplet"}]
        });
        let response = self
            .http
            .post(format!("{}/tags/{new_uid}/resources", self.base_url))
            .bearer_auth(&config.token)
            .json(&resources)
            .send()
            .await
            .map_err(|e| Error::provider_for(&name, PROVIDER, e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(http_status_to_error(PROVIDER, &name, status, body));
        }

        let old_uid = machine_uid(machine);
        let response = self
            .http
            .delete(format!("{}/tags/{old_uid}/resources", self.base_url))
            .bearer_auth(&config.token)
            .json(&resources)
            .send()
            .await
            .map_err(|e| Error::provider_for(&name, PROVIDER, e.to_string()))?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(http_status_to_error(PROVIDER, &name, status, body));
        }

        Ok(())
    }

    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>> {
        let (raw, _) = Self::raw_config(&machine.spec)?;
        // Metrics labels must stay cheap: only literal values, no resolver RPCs.
        Ok(BTreeMap::from([
            ("provider".to_string(), PROVIDER.to_string()),
            ("region".to_string(), raw.region.value),
            ("size".to_string(), raw.size.value),
        ]))
    }
}
