//! DSSim Kubernetes controller
//!
//! Deploys dataspace application instances into one namespace, tags every
//! object with a group label so a run can be torn down as a unit, and
//! injects per-instance network impairment through a node-local agent.

pub mod config;
pub mod error;
pub mod instance;
pub mod k8s;
pub mod network;
pub mod orchestrator;

pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
