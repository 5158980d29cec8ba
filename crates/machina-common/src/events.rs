//! Kubernetes Event recording for machina controllers.
//!
//! Controllers emit [`EventReason`] values rather than raw strings: each
//! reason knows whether it is a Normal or Warning event and which action it
//! belongs to, so severity can never drift between call sites. Publishing
//! is fire-and-forget — a failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Everything the controllers report as a Kubernetes Event.
///
/// The variant name is what shows up in the REASON column of
/// `kubectl get events`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventReason {
    /// Cloud instance creation was requested
    InstanceCreateStarted,
    /// Machine was bound to its Node
    NodeBound,
    /// Pod eviction started on the machine's node
    EvictionStarted,
    /// Cloud instance was released
    InstanceDeleted,
    /// The Node object bound to the machine was deleted
    NodeDeleted,
    /// A terminal provider error was written to the machine status
    TerminalError,
    /// Machine deleted because its node never joined the cluster
    JoinClusterTimeout,
    /// MachineSet created a new Machine
    MachineCreated,
    /// MachineSet deleted a Machine on scale-down
    MachineDeleted,
    /// MachineDeployment created a new MachineSet
    MachineSetCreated,
    /// MachineDeployment scaled a MachineSet
    MachineSetScaled,
    /// Template-hash collision detected, collisionCount bumped
    HashCollision,
    /// Spec validation failed
    ValidationFailed,
}

impl EventReason {
    /// Wire string for the REASON column
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstanceCreateStarted => "InstanceCreateStarted",
            Self::NodeBound => "NodeBound",
            Self::EvictionStarted => "EvictionStarted",
            Self::InstanceDeleted => "InstanceDeleted",
            Self::NodeDeleted => "NodeDeleted",
            Self::TerminalError => "TerminalError",
            Self::JoinClusterTimeout => "JoinClusterTimeout",
            Self::MachineCreated => "MachineCreated",
            Self::MachineDeleted => "MachineDeleted",
            Self::MachineSetCreated => "MachineSetCreated",
            Self::MachineSetScaled => "MachineSetScaled",
            Self::HashCollision => "HashCollision",
            Self::ValidationFailed => "ValidationFailed",
        }
    }

    /// Severity of the event; a reason is either always Normal or always a
    /// Warning, never both
    pub fn event_type(&self) -> EventType {
        match self {
            Self::TerminalError
            | Self::JoinClusterTimeout
            | Self::HashCollision
            | Self::ValidationFailed => EventType::Warning,
            _ => EventType::Normal,
        }
    }

    /// The controller action this reason is reported under
    pub fn action(&self) -> &'static str {
        match self {
            Self::MachineCreated | Self::MachineDeleted | Self::MachineSetScaled => "Scale",
            Self::EvictionStarted
            | Self::InstanceDeleted
            | Self::NodeDeleted
            | Self::JoinClusterTimeout => "Delete",
            _ => "Reconcile",
        }
    }
}

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event about `resource_ref` with an optional human-readable
    /// note; severity and action come from the reason itself
    async fn publish(&self, resource_ref: &ObjectReference, reason: EventReason, note: Option<String>);
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
///
/// The controller name appears as the "reportingComponent" on Events
/// (e.g. "machina-machine-controller").
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, resource_ref: &ObjectReference, reason: EventReason, note: Option<String>) {
        let event = Event {
            type_: reason.event_type(),
            reason: reason.as_str().to_string(),
            note,
            action: reason.action().to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason = reason.as_str(), error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _resource_ref: &ObjectReference, _reason: EventReason, _note: Option<String>) {
        // intentionally empty
    }
}
