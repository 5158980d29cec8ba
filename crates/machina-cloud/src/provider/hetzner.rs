//! Hetzner Cloud server provider
//!
//! Instances carry a `machine-uid` label; lookup goes through the label
//! selector so no client-side filtering is needed. Node provider ids use the
//! `hcloud://<id>` scheme.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use machina_common::crd::{Machine, MachineSpec};
use machina_common::{Error, Result};

use crate::configvar::{ConfigVarResolver, ConfigVarString};
use crate::instance::{Instance, InstanceStatus};

use super::{http_status_to_error, machine_uid, provider_config, CloudProvider};

const DEFAULT_BASE_URL: &str = "https://api.hetzner.cloud/v1";
const TOKEN_ENV: &str = "HZ_TOKEN";
const PROVIDER: &str = "hetzner";
const UID_LABEL: &str = "machine-uid";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    token: ConfigVarString,
    #[serde(default)]
    server_type: ConfigVarString,
    #[serde(default)]
    image: ConfigVarString,
    #[serde(default)]
    location: ConfigVarString,
    #[serde(default)]
    datacenter: ConfigVarString,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

struct Config {
    token: String,
    server_type: String,
    image: String,
    location: String,
    datacenter: String,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Server {
    id: u64,
    name: String,
    status: String,
    #[serde(default)]
    public_net: PublicNet,
    #[serde(default)]
    private_net: Vec<PrivateNet>,
}

#[derive(Debug, Default, Deserialize)]
struct PublicNet {
    #[serde(default)]
    ipv4: Option<Ipv4>,
}

#[derive(Debug, Deserialize)]
struct Ipv4 {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct PrivateNet {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    #[serde(default)]
    servers: Vec<Server>,
}

#[derive(Debug, Deserialize)]
struct ServerTypeList {
    #[serde(default)]
    server_types: Vec<Named>,
}

#[derive(Debug, Deserialize)]
struct LocationList {
    #[serde(default)]
    locations: Vec<Named>,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

/// Hetzner Cloud implementation of [`CloudProvider`]
pub struct HetznerProvider {
    resolver: Arc<dyn ConfigVarResolver>,
    http: reqwest::Client,
    base_url: String,
}

impl HetznerProvider {
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
            .map_err(|e| Error::invalid_configuration(format!("cannot parse hetzner spec: {e}")))
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config> {
        let raw = Self::raw_config(spec)?;
        Ok(Config {
            token: self.resolver.get_string_or_env(&raw.token, TOKEN_ENV).await?,
            server_type: self.resolver.get_string(&raw.server_type).await?,
            image: self.resolver.get_string(&raw.image).await?,
            location: self.resolver.get_string(&raw.location).await?,
            datacenter: self.resolver.get_string(&raw.datacenter).await?,
            labels: raw.labels,
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

    async fn find_server(&self, config: &Config, machine: &Machine) -> Result<Option<Server>> {
        let uid = machine_uid(machine);
        let name = machine.metadata.name.clone().unwrap_or_default();
        let mut list: ServerList = self
            .api_get(
                &config.token,
                &name,
                &format!("/servers?label_selector={UID_LABEL}%3D%3D{uid}"),
            )
            .await?;

        match list.servers.len() {
            0 => Ok(None),
            1 => Ok(list.servers.pop()),
            n => Err(Error::terminal(
                machina_common::crd::MachineErrorReason::Delete,
                format!("found {n} servers labeled with machine UID {uid}, refusing to proceed"),
            )),
        }
    }
}

fn server_to_instance(server: &Server) -> Instance {
    let mut addresses = BTreeMap::new();
    if let Some(ipv4) = &server.public_net.ipv4 {
        addresses.insert(ipv4.ip.clone(), "ExternalIP".to_string());
    }
    for net in &server.private_net {
        addresses.insert(net.ip.clone(), "InternalIP".to_string());
    }

    let status = match server.status.as_str() {
        "initializing" | "starting" | "off" => InstanceStatus::Creating,
        "running" => InstanceStatus::Running,
        "deleting" => InstanceStatus::Deleting,
        _ => InstanceStatus::Unknown,
    };

    Instance {
        name: server.name.clone(),
        id: server.id.to_string(),
        provider_id: Some(format!("hcloud://{}", server.id)),
        addresses,
        status,
    }
}

#[async_trait]
impl CloudProvider for HetznerProvider {
    async fn validate(&self, spec: &MachineSpec) -> Result<()> {
        let config = self.config(spec).await?;

        if config.token.is_empty() {
            return Err(Error::invalid_configuration("token is missing"));
        }
        if config.server_type.is_empty() {
            return Err(Error::invalid_configuration("serverType is missing"));
        }
        if config.image.is_empty() {
            return Err(Error::invalid_configuration("image is missing"));
        }
        if config.location.is_empty() && config.datacenter.is_empty() {
            return Err(Error::invalid_configuration(
                "one of location or datacenter is required",
            ));
        }

        let types: ServerTypeList = self
            .api_get(&config.token, "validate", "/server_types?per_page=50")
            .await?;
        if !types.server_types.iter().any(|t| t.name == config.server_type) {
            return Err(Error::invalid_configuration(format!(
                "server type {:?} not found",
                config.server_type
            )));
        }

        if !config.location.is_empty() {
            let locations: LocationList = self
                .api_get(&config.token, "validate", "/locations")
                .await?;
            if !locations.locations.iter().any(|l| l.name == config.location) {
                return Err(Error::invalid_configuration(format!(
                    "location {:?} not found",
                    config.location
                )));
            }
        }

        Ok(())
    }

    async fn get(&self, machine: &Machine) -> Result<Instance> {
        let config = self.config(&machine.spec).await?;
        match self.find_server(&config, machine).await? {
            Some(server) => Ok(server_to_instance(&server)),
            None => Err(Error::instance_not_found(
                machine.metadata.name.clone().unwrap_or_default(),
            )),
        }
    }

    async fn create(&self, machine: &Machine, userdata: &str) -> Result<Instance> {
        let config = self.config(&machine.spec).await?;
        let name = machine.metadata.name.clone().unwrap_or_default();

        if let Some(existing) = self.find_server(&config, machine).await? {
            return Ok(server_to_instance(&existing));
        }

        let mut labels = config.labels.clone();
        labels.insert(UID_LABEL.to_string(), machine_uid(machine));

        let mut body = serde_json::json!({
            "name": name,
            "server_type": config.server_type,
            "image": config.image,
            "user_data": userdata,
            "labels": labels,
        });
        if !config.datacenter.is_empty() {
            body["datacenter"] = serde_json::Value::String(config.datacenter.clone());
        } else {
            body["location"] = serde_json::Value::String(config.location.clone());
        }

        let response = self
            .http
            .post(format!("{}/servers", self.base_url))
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

        #[derive(Deserialize)]
        struct Created {
            server: Server,
        }
        let created: Created = response
            .json()
            .await
            .map_err(|e| Error::provider_for(&name, PROVIDER, format!("decode response: {e}")))?;
        Ok(server_to_instance(&created.server))
    }

    async fn cleanup(&self, machine: &Machine) -> Result<bool> {
        let config = self.config(&machine.spec).await?;
        let name = machine.metadata.name.clone().unwrap_or_default();

        let server = match self.find_server(&config, machine).await? {
            Some(server) => server,
            None => return Ok(true),
        };

        let response = self
            .http
            .delete(format!("{}/servers/{}", self.base_url, server.id))
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

        let server = match self.find_server(&config, machine).await? {
            Some(server) => server,
            None => return Ok(()),
        };

        let mut labels = config.labels.clone();
        labels.insert(UID_LABEL.to_string(), new_uid.to_string());

        let response = self
            .http
            .put(format!("{}/servers/{}", self.base_url, server.id))
            .bearer_auth(&config.token)
            .json(&serde_json::json!({"labels": labels}))
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
            ("server_type".to_string(), raw.server_type.value),
            ("location".to_string(), raw.location.value),
        ]))
    }
}
