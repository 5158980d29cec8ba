//! Cloud provider abstraction for machina
//!
//! Every infrastructure backend implements the [`CloudProvider`] trait with
//! uniform Create/Get/Cleanup/Validate semantics: creates are idempotent and
//! keyed by the machine UID (tag or label on the instance), gets return
//! [`machina_common::Error::InstanceNotFound`] when no instance carries the
//! UID, and cleanup reports `true` only once every instance-side resource is
//! released.
//!
//! Provider configuration arrives as the opaque `providerSpec.value` blob on
//! the Machine; each field can come from a literal value, a Secret, a
//! ConfigMap or an environment variable (see [`configvar`]).

pub mod config;
pub mod configvar;
pub mod instance;
pub mod provider;

pub use config::{migrate_provider_kind, CloudProviderKind, OperatingSystem, ProviderConfig};
pub use configvar::{
    ConfigVarBool, ConfigVarResolver, ConfigVarString, KubeConfigVarResolver,
    StaticConfigVarResolver,
};
pub use instance::{Instance, InstanceStatus};
pub use provider::{new_cloud_provider, CloudProvider};
