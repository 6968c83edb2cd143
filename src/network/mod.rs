//! Network impairment
//!
//! Deploys the per-node traffic shaping agent and routes apply/clear
//! commands to the agent on whichever node an instance currently runs.

mod agent;
mod conditions;
mod types;

pub use agent::{
    agent_daemon_set_spec, clear_all_network_limitations, locate, set_network_control,
    ContainerInfo, NetworkControl, AGENT_NAME, AGENT_PULL_SECRET,
};
pub use conditions::{encode_body, ImpairmentCommand, AGENT_PORT};
pub use types::{Bandwidth, BandwidthUnit, Delay, NetworkConditions, TimeUnit};
