//! Kubernetes integration
//!
//! Everything that touches the cluster goes through [`ResourceExecutor`]:
//! - Building labelled workload, config and network objects
//! - Submitting them and waiting for readiness
//! - Locating pods and running commands inside them
//! - Sweeping away everything a run created

mod cluster;
mod executor;
mod poll;
pub mod resources;

#[cfg(test)]
pub(crate) mod testing;

pub use cluster::{ClusterApi, CustomResourceType, ExecOutput, KubeCluster, ResourceKind};
pub use executor::{
    short_container_id, NodePlacement, ResourceExecutor, TeardownFailure, TeardownReport,
};
pub use poll::{poll_until, PollConfig};
pub use resources::{CpuLimit, CpuUnit, MemoryLimit, MemoryUnit, RegistryAuth};
