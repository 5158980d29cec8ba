//! Error types for the machina controllers
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries enough context (machine names, provider types, terminal
//! reasons) for the reconcilers to decide between requeueing and parking the
//! object until its spec changes.

use thiserror::Error;

use crate::crd::MachineErrorReason;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for machina operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {object}: {message}")]
    Validation {
        /// Name of the object with invalid configuration
        object: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g. "spec.template.metadata.labels")
        field: Option<String>,
    },

    /// Cloud provider error
    #[error("provider error [{provider}] for {machine}: {message}")]
    Provider {
        /// Name of the machine being acted on
        machine: String,
        /// Provider kind (digitalocean, hetzner, ...)
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Terminal cloud error that will not self-heal; surfaced into
    /// `machine.status.errorReason`/`errorMessage` and not retried until
    /// the spec changes
    #[error("terminal error [{reason}]: {message}")]
    Terminal {
        /// Machine error reason written to status
        reason: MachineErrorReason,
        /// Human-readable message written to status
        message: String,
    },

    /// No cloud instance exists for the machine's UID
    #[error("no instance found for machine {machine}")]
    InstanceNotFound {
        /// Name of the machine the lookup ran for
        machine: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "machineset", "rollout")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context
    pub fn validation_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context and field path
    pub fn validation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider {
            machine: UNKNOWN_CONTEXT.to_string(),
            provider: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a retryable provider error with full context
    pub fn provider_for(
        machine: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            machine: machine.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a terminal error with the given reason
    pub fn terminal(reason: MachineErrorReason, msg: impl Into<String>) -> Self {
        Self::Terminal {
            reason,
            message: msg.into(),
        }
    }

    /// Create a terminal invalid-configuration error
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::Terminal {
            reason: MachineErrorReason::InvalidConfiguration,
            message: msg.into(),
        }
    }

    /// Create an instance-not-found error for the given machine
    pub fn instance_not_found(machine: impl Into<String>) -> Self {
        Self::InstanceNotFound {
            machine: machine.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, serialization and terminal errors require a spec change
    /// and are never retried. Kubernetes errors depend on the status code;
    /// optimistic-concurrency conflicts (409) requeue.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Validation { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::Terminal { .. } => false,
            Error::InstanceNotFound { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error represents a missing cloud instance
    pub fn is_instance_not_found(&self) -> bool {
        matches!(self, Error::InstanceNotFound { .. })
    }

    /// Terminal reason and message, if this is a terminal error
    pub fn terminal_reason(&self) -> Option<(MachineErrorReason, &str)> {
        match self {
            Error::Terminal { reason, message } => Some((*reason, message)),
            _ => None,
        }
    }

    /// Whether the underlying cause is a Kubernetes 404
    pub fn is_kube_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Whether the underlying cause is an optimistic-concurrency conflict
    pub fn is_kube_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Whether the underlying cause is a 409 AlreadyExists on create
    pub fn is_kube_already_exists(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) }
                if ae.code == 409 && ae.reason == "AlreadyExists"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: spec validation catches misconfigurations before any cloud call
    #[test]
    fn story_validation_prevents_invalid_machine_creation() {
        let err = Error::validation_for("md-webworkers", "selector does not match template labels");
        assert!(err.to_string().contains("md-webworkers"));
        assert!(!err.is_retryable());

        let err = Error::validation_for_field(
            "md-webworkers",
            "spec.strategy.type",
            "unknown strategy \"Recreate\"",
        );
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.strategy.type"));
            }
            _ => panic!("expected Validation variant"),
        }
    }

    /// Story: terminal errors park the machine until its spec changes
    #[test]
    fn story_terminal_errors_are_not_retryable() {
        let err = Error::invalid_configuration("region \"mars-1\" not found");
        assert!(!err.is_retryable());
        let (reason, message) = err.terminal_reason().expect("terminal");
        assert_eq!(reason, MachineErrorReason::InvalidConfiguration);
        assert!(message.contains("mars-1"));

        let err = Error::terminal(MachineErrorReason::Create, "quota exceeded");
        assert_eq!(err.to_string(), "terminal error [CreateMachineError]: quota exceeded");
    }

    /// Story: a missing instance is a signal, not a failure
    #[test]
    fn story_instance_not_found_is_distinguishable() {
        let err = Error::instance_not_found("worker-abc12");
        assert!(err.is_instance_not_found());
        assert!(err.to_string().contains("worker-abc12"));
        assert!(!Error::provider("timeout").is_instance_not_found());
    }

    #[test]
    fn test_provider_errors_respect_retryable_flag() {
        assert!(Error::provider("connection reset").is_retryable());
        let permanent = Error::Provider {
            machine: "m".into(),
            provider: "digitalocean".into(),
            message: "invalid token".into(),
            retryable: false,
        };
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn test_internal_errors_are_retryable() {
        let err = Error::internal_with_context("rollout", "unexpected nil replicas");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("[rollout]"));
    }
}
