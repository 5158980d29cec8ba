//! The machina reconciler stack
//!
//! Three layered controllers mirror the Deployment/ReplicaSet/Pod triple for
//! cloud VMs, plus the node CSR approver:
//!
//! - [`machinedeployment`] tracks template revisions, creates and retires
//!   MachineSets and drives rolling updates within surge/unavailability
//!   budgets
//! - [`machineset`] keeps the machine population of one set at
//!   `spec.replicas`, choosing scale-down victims by delete priority
//! - [`machine`] owns the per-VM lifecycle: cloud instance create, node
//!   binding, eviction and crash-safe teardown behind a finalizer
//! - [`nodecsrapprover`] auto-approves kubelet serving certificates whose
//!   identity matches a known Machine
//!
//! All coordination happens through the API server; reconcilers never share
//! in-process state.

pub mod machine;
pub mod machinedeployment;
pub mod machineset;
pub mod nodecsrapprover;
pub mod util;
