//! Custom Resource Definitions for the machina API group
//!
//! Three CRDs live in `cluster.k8s.io/v1alpha1`: [`Machine`], [`MachineSet`]
//! and [`MachineDeployment`]. The layering mirrors the Kubernetes
//! `Deployment`/`ReplicaSet`/`Pod` triple, but the leaves are cloud VMs
//! instead of pods.

mod machine;
mod machine_deployment;
mod machine_set;
mod types;

pub use machine::{Machine, MachineSpec, MachineStatus};
pub use machine_deployment::{
    populate_defaults, MachineDeployment, MachineDeploymentSpec, MachineDeploymentStatus,
    MachineDeploymentStrategy, MachineRollingUpdate, ROLLING_UPDATE_STRATEGY,
};
pub use machine_set::{MachineSet, MachineSetSpec, MachineSetStatus};
pub use types::{
    MachineErrorReason, MachinePhase, MachineTemplateSpec, MachineVersionInfo, ProviderSpec,
};
