//! Common types for machina: CRDs, errors, events and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, EventReason, KubeEventPublisher, NoopEventPublisher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the machina CRDs
pub const API_GROUP: &str = "cluster.k8s.io";

/// API version of the machina CRDs
pub const API_VERSION: &str = "cluster.k8s.io/v1alpha1";

/// Finalizer placed on Machines so the cloud instance and the Node object
/// are cleaned up before the Machine object is allowed to vanish
pub const MACHINE_FINALIZER: &str = "machine-node-delete-finalizer";

/// Label placed on Nodes once they are bound to a Machine; the value is the
/// Machine's UID. Matching on this label is the primary way a Node is
/// associated with its Machine.
pub const NODE_OWNER_LABEL: &str = "machina.dev/node-owner-id";

/// Label carried on MachineSets, their templates and child Machines to tie
/// a generation of Machines to one template hash
pub const MACHINE_TEMPLATE_HASH_LABEL: &str = "machine-template-hash";

/// Annotation that records which UID the cloud instance is currently tagged
/// with; differs from metadata.uid after an object was recreated
pub const INSTANCE_UID_ANNOTATION: &str = "machina.dev/instance-uid";

/// Annotation on Machines that forces the highest delete priority when the
/// owning MachineSet scales down
pub const DELETE_MACHINE_ANNOTATION: &str = "cluster.k8s.io/delete-machine";

/// Annotation on MachineDeployments naming the operating-system profile the
/// external userdata source renders bootstrap data from
pub const OPERATING_SYSTEM_PROFILE_ANNOTATION: &str = "k8c.io/operating-system-profile";

/// Annotation tracking the revision of a MachineSet under a MachineDeployment
pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Annotation on MachineSets recording the owning deployment's desired replicas
pub const DESIRED_REPLICAS_ANNOTATION: &str = "deployment.kubernetes.io/desired-replicas";

/// Annotation on MachineSets recording desired replicas plus the surge budget
pub const MAX_REPLICAS_ANNOTATION: &str = "deployment.kubernetes.io/max-replicas";

/// Finalizer that makes the API server delete dependents in the foreground
pub const FOREGROUND_DELETION_FINALIZER: &str = "foregroundDeletion";

/// Pod annotation marking static mirror pods, which are never evicted
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Pod annotation the cluster-autoscaler convention uses to veto eviction
pub const SAFE_TO_EVICT_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";
