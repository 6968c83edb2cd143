//! Impairment agent commands
//!
//! The agent listens on `localhost:4080` of every node. Commands are issued
//! with curl from inside the agent container on the instance's node.

use super::types::{positive, NetworkConditions};

/// Port the agent serves on, on the host network of each node
pub const AGENT_PORT: u16 = 4080;

/// Form body for an apply request; only supplied fields, `&`-joined
pub fn encode_body(conditions: &NetworkConditions) -> String {
    let fields = [
        conditions
            .bandwidth
            .filter(|b| b.value > 0)
            .map(|b| format!("rate={}", b)),
        conditions
            .delay
            .filter(|d| d.value > 0)
            .map(|d| format!("delay={}", d)),
        positive(conditions.loss_rate).map(|r| format!("loss={}%", r)),
        positive(conditions.duplicate_rate).map(|r| format!("duplicate={}%", r)),
        positive(conditions.corruption_rate).map(|r| format!("corrupt={}%", r)),
    ];

    fields.into_iter().flatten().collect::<Vec<_>>().join("&")
}

/// A request to the agent for one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImpairmentCommand {
    Apply { container_id: String, body: String },
    Clear { container_id: String },
}

impl ImpairmentCommand {
    /// Apply `conditions`, or clear when none of them impair anything
    pub fn for_conditions(container_id: &str, conditions: &NetworkConditions) -> Self {
        if conditions.is_clear() {
            ImpairmentCommand::Clear {
                container_id: container_id.to_string(),
            }
        } else {
            ImpairmentCommand::Apply {
                container_id: container_id.to_string(),
                body: encode_body(conditions),
            }
        }
    }

    pub fn container_id(&self) -> &str {
        match self {
            ImpairmentCommand::Apply { container_id, .. } => container_id,
            ImpairmentCommand::Clear { container_id } => container_id,
        }
    }

    fn url(&self) -> String {
        format!("localhost:{}/{}", AGENT_PORT, self.container_id())
    }

    /// curl invocation to run inside the agent container; `-f` turns an HTTP
    /// error from the agent into a non-zero exit
    pub fn to_args(&self) -> Vec<String> {
        match self {
            ImpairmentCommand::Apply { body, .. } => vec![
                "curl".to_string(),
                "-fsS".to_string(),
                "-X".to_string(),
                "POST".to_string(),
                "-d".to_string(),
                body.clone(),
                self.url(),
            ],
            ImpairmentCommand::Clear { .. } => vec![
                "curl".to_string(),
                "-fsS".to_string(),
                "-X".to_string(),
                "DELETE".to_string(),
                self.url(),
            ],
        }
    }
}
