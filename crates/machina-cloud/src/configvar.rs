//! Indirect configuration values for provider specs
//!
//! Every string or bool field of a provider config can come from four
//! sources, tried in order: a literal `value`, a `secretKeyRef`, a
//! `configMapKeyRef`, and finally a named environment variable. The resolver
//! is stateless and safe for concurrent use.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use serde::{Deserialize, Serialize};

use machina_common::{Error, Result};

/// Reference into a namespaced Secret or ConfigMap key
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalObjectKeySelector {
    /// Namespace of the referenced object
    #[serde(default)]
    pub namespace: String,
    /// Name of the referenced object
    #[serde(default)]
    pub name: String,
    /// Key inside the object's data
    #[serde(default)]
    pub key: String,
}

impl GlobalObjectKeySelector {
    fn is_complete(&self) -> bool {
        !self.namespace.is_empty() && !self.name.is_empty() && !self.key.is_empty()
    }
}

/// A string config value with optional indirection
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigVarString {
    /// Literal value; wins when non-empty
    #[serde(default)]
    pub value: String,
    /// Secret reference, used when all three of namespace/name/key are set
    #[serde(default, skip_serializing_if = "is_default_selector")]
    pub secret_key_ref: GlobalObjectKeySelector,
    /// ConfigMap reference, used when all three of namespace/name/key are set
    #[serde(default, skip_serializing_if = "is_default_selector")]
    pub config_map_key_ref: GlobalObjectKeySelector,
}

fn is_default_selector(s: &GlobalObjectKeySelector) -> bool {
    !s.is_complete()
}

impl From<&str> for ConfigVarString {
    fn from(value: &str) -> Self {
        Self {
            value: value.to_string(),
            ..Default::default()
        }
    }
}

/// A bool config value with optional indirection
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigVarBool {
    /// Literal value
    #[serde(default)]
    pub value: Option<bool>,
    /// Secret reference, used when complete
    #[serde(default, skip_serializing_if = "is_default_selector")]
    pub secret_key_ref: GlobalObjectKeySelector,
    /// ConfigMap reference, used when complete
    #[serde(default, skip_serializing_if = "is_default_selector")]
    pub config_map_key_ref: GlobalObjectKeySelector,
}

/// Resolves [`ConfigVarString`] / [`ConfigVarBool`] values against their
/// possible sources
#[async_trait]
pub trait ConfigVarResolver: Send + Sync {
    /// Resolve a string value: literal, then secret ref, then configmap ref
    async fn get_string(&self, var: &ConfigVarString) -> Result<String>;

    /// Resolve a string value, falling back to the named environment
    /// variable when the config sources produce nothing
    async fn get_string_or_env(&self, var: &ConfigVarString, env_var: &str) -> Result<String> {
        let value = self.get_string(var).await?;
        if !value.is_empty() {
            return Ok(value);
        }
        Ok(std::env::var(env_var).unwrap_or_default())
    }

    /// Resolve a bool value; `None` means no source provided one, which
    /// lets callers distinguish "false" from "unset"
    async fn get_bool(&self, var: &ConfigVarBool) -> Result<Option<bool>>;

    /// Resolve a bool value, falling back to the named environment variable
    async fn get_bool_or_env(&self, var: &ConfigVarBool, env_var: &str) -> Result<bool> {
        if let Some(value) = self.get_bool(var).await? {
            return Ok(value);
        }
        match std::env::var(env_var) {
            Ok(raw) => raw.parse::<bool>().map_err(|e| {
                Error::validation(format!("cannot parse ${env_var}={raw:?} as bool: {e}"))
            }),
            Err(_) => Ok(false),
        }
    }
}

/// Resolver backed by the control-plane Kubernetes API
#[derive(Clone)]
pub struct KubeConfigVarResolver {
    client: Client,
}

impl KubeConfigVarResolver {
    /// Create a resolver using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn secret_value(&self, sel: &GlobalObjectKeySelector) -> Result<String> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &sel.namespace);
        let secret = api.get(&sel.name).await.map_err(|e| {
            Error::validation(format!(
                "error retrieving secret {:?} from namespace {:?}: {e}",
                sel.name, sel.namespace
            ))
        })?;
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(&sel.key))
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
            .ok_or_else(|| {
                Error::validation(format!(
                    "secret {:?} in namespace {:?} has no key {:?}",
                    sel.name, sel.namespace, sel.key
                ))
            })
    }

    async fn config_map_value(&self, sel: &GlobalObjectKeySelector) -> Result<String> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &sel.namespace);
        let cm = api.get(&sel.name).await.map_err(|e| {
            Error::validation(format!(
                "error retrieving configmap {:?} from namespace {:?}: {e}",
                sel.name, sel.namespace
            ))
        })?;
        cm.data
            .as_ref()
            .and_then(|d| d.get(&sel.key))
            .cloned()
            .ok_or_else(|| {
                Error::validation(format!(
                    "configmap {:?} in namespace {:?} has no key {:?}",
                    sel.name, sel.namespace, sel.key
                ))
            })
    }
}

#[async_trait]
impl ConfigVarResolver for KubeConfigVarResolver {
    async fn get_string(&self, var: &ConfigVarString) -> Result<String> {
        if !var.value.is_empty() {
            return Ok(var.value.clone());
        }
        if var.secret_key_ref.is_complete() {
            return self.secret_value(&var.secret_key_ref).await;
        }
        if var.config_map_key_ref.is_complete() {
            return self.config_map_value(&var.config_map_key_ref).await;
        }
        Ok(String::new())
    }

    async fn get_bool(&self, var: &ConfigVarBool) -> Result<Option<bool>> {
        if let Some(value) = var.value {
            return Ok(Some(value));
        }
        if var.secret_key_ref.is_complete() {
            let raw = self.secret_value(&var.secret_key_ref).await?;
            return parse_bool(&raw).map(Some);
        }
        if var.config_map_key_ref.is_complete() {
            let raw = self.config_map_value(&var.config_map_key_ref).await?;
            return parse_bool(&raw).map(Some);
        }
        Ok(None)
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    raw.trim()
        .parse::<bool>()
        .map_err(|e| Error::validation(format!("cannot parse {raw:?} as bool: {e}")))
}

/// Resolver that only sees literal values and the environment; used by the
/// fake provider and in tests
pub struct StaticConfigVarResolver;

#[async_trait]
impl ConfigVarResolver for StaticConfigVarResolver {
    async fn get_string(&self, var: &ConfigVarString) -> Result<String> {
        Ok(var.value.clone())
    }

    async fn get_bool(&self, var: &ConfigVarBool) -> Result<Option<bool>> {
        Ok(var.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_literal_value_wins_without_refs() {
        let resolver = StaticConfigVarResolver;
        let var = ConfigVarString::from("fra1");
        assert_eq!(resolver.get_string(&var).await.unwrap(), "fra1");
    }

    #[tokio::test]
    async fn test_env_fallback_only_when_empty() {
        let resolver = StaticConfigVarResolver;

        std::env::set_var("MACHINA_TEST_TOKEN", "from-env");
        let empty = ConfigVarString::default();
        assert_eq!(
            resolver
                .get_string_or_env(&empty, "MACHINA_TEST_TOKEN")
                .await
                .unwrap(),
            "from-env"
        );

        let set = ConfigVarString::from("explicit");
        assert_eq!(
            resolver
                .get_string_or_env(&set, "MACHINA_TEST_TOKEN")
                .await
                .unwrap(),
            "explicit"
        );
        std::env::remove_var("MACHINA_TEST_TOKEN");
    }

    #[tokio::test]
    async fn test_unset_bool_is_distinguishable_from_false() {
        let resolver = StaticConfigVarResolver;
        assert_eq!(resolver.get_bool(&ConfigVarBool::default()).await.unwrap(), None);

        let explicit_false = ConfigVarBool {
            value: Some(false),
            ..Default::default()
        };
        assert_eq!(resolver.get_bool(&explicit_false).await.unwrap(), Some(false));
    }

    #[test]
    fn test_config_var_deserializes_from_bare_refs() {
        let raw = serde_json::json!({
            "secretKeyRef": {"namespace": "kube-system", "name": "do-token", "key": "token"}
        });
        let var: ConfigVarString = serde_json::from_value(raw).unwrap();
        assert!(var.value.is_empty());
        assert!(var.secret_key_ref.is_complete());
        assert!(!var.config_map_key_ref.is_complete());
    }
}
