//! Per-node impairment agent and routing of commands to it

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::DaemonSetSpec;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, HostPathVolumeSource, LocalObjectReference,
    PodSpec, PodTemplateSpec, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use tracing::{info, instrument};

use super::conditions::{ImpairmentCommand, AGENT_PORT};
use super::types::NetworkConditions;
use crate::config::NetworkControlConfig;
use crate::error::{Error, Result};
use crate::k8s::{ExecOutput, RegistryAuth, ResourceExecutor};

/// Daemon set name; also the container name and the pods' `name` label
pub const AGENT_NAME: &str = "network-control";
pub const AGENT_PULL_SECRET: &str = "network-control-pull-secret";

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Pod spec of the agent: host networking, container runtime socket,
/// `NET_ADMIN` and the interface prefix it shapes
pub fn agent_daemon_set_spec(config: &NetworkControlConfig) -> DaemonSetSpec {
    let labels: BTreeMap<String, String> = [("name".to_string(), AGENT_NAME.to_string())]
        .into_iter()
        .collect();

    let container = Container {
        name: AGENT_NAME.to_string(),
        image: Some(config.image.clone()),
        image_pull_policy: Some("Always".to_string()),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(true),
            privileged: Some(false),
            read_only_root_filesystem: Some(false),
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ports: Some(vec![ContainerPort {
            name: Some("httpd".to_string()),
            container_port: i32::from(AGENT_PORT),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: "dockersocket".to_string(),
            mount_path: DOCKER_SOCKET.to_string(),
            ..Default::default()
        }]),
        env: Some(vec![EnvVar {
            name: "IFPREFIX".to_string(),
            value: Some(config.interface_prefix.clone()),
            ..Default::default()
        }]),
        ..Default::default()
    };

    DaemonSetSpec {
        selector: LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                image_pull_secrets: Some(vec![LocalObjectReference {
                    name: Some(AGENT_PULL_SECRET.to_string()),
                }]),
                host_network: Some(true),
                volumes: Some(vec![Volume {
                    name: "dockersocket".to_string(),
                    host_path: Some(HostPathVolumeSource {
                        path: DOCKER_SOCKET.to_string(),
                        type_: Some(String::new()),
                    }),
                    ..Default::default()
                }]),
                containers: vec![container],
                ..Default::default()
            }),
        },
        ..Default::default()
    }
}

/// The per-node traffic shaping agent
#[derive(Debug, Clone)]
pub struct NetworkControl {
    config: NetworkControlConfig,
}

impl NetworkControl {
    pub fn new(config: NetworkControlConfig) -> Self {
        Self { config }
    }

    /// Read `K8S_NETCONTROL_*`; fails before anything is submitted
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(NetworkControlConfig::from_env()?))
    }

    pub fn config(&self) -> &NetworkControlConfig {
        &self.config
    }

    /// Pull secret first, then the daemon set; returns once every node runs it
    #[instrument(skip_all)]
    pub async fn deploy(&self, executor: &ResourceExecutor) -> Result<()> {
        if self.config.interface_prefix.trim().is_empty() {
            return Err(Error::config(
                "Interface prefix not set for network control. Cannot deploy Network Control.",
            ));
        }
        info!("Starting network control..");

        let registries: BTreeMap<String, RegistryAuth> = [(
            self.config.image_registry.clone(),
            RegistryAuth {
                username: self.config.image_pull_username.clone(),
                password: self.config.image_pull_password.clone(),
            },
        )]
        .into_iter()
        .collect();
        executor
            .deploy_dockercfg_secret(AGENT_PULL_SECRET, &registries)
            .await?;

        executor
            .deploy_daemon_set(AGENT_NAME, agent_daemon_set_spec(&self.config))
            .await?;
        info!("Network control running on all nodes");
        Ok(())
    }
}

/// Where the first running container of a deployment lives, plus the agent
/// pod on the same node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub node_name: String,
    /// Agent pod on `node_name`
    pub agent_pod: String,
    pub container_id: String,
}

/// Resolve the current placement of `deployment` and its node's agent
pub async fn locate(executor: &ResourceExecutor, deployment: &str) -> Result<ContainerInfo> {
    let placements = executor.get_node_info_of_deployment(deployment).await?;
    let first = placements
        .first()
        .ok_or_else(|| Error::NotFound(format!("No running container for {}", deployment)))?;
    let agent_pod = executor
        .get_pod_name_of_deployment_on_node(&first.node_name, AGENT_NAME)
        .await?;

    Ok(ContainerInfo {
        node_name: first.node_name.clone(),
        agent_pod,
        container_id: first.container_id.clone(),
    })
}

async fn send(executor: &ResourceExecutor, deployment: &str, conditions: &NetworkConditions) -> Result<ExecOutput> {
    let target = locate(executor, deployment).await?;
    let command = ImpairmentCommand::for_conditions(&target.container_id, conditions);
    info!(
        deployment,
        node = %target.node_name,
        container = %target.container_id,
        ?command,
        "Sending impairment command"
    );
    executor
        .exec(&target.agent_pod, AGENT_NAME, command.to_args())
        .await
}

/// Apply `conditions` to the deployment's container, or clear all impairment
/// when nothing is requested
#[instrument(skip(executor, conditions))]
pub async fn set_network_control(
    executor: &ResourceExecutor,
    deployment: &str,
    conditions: &NetworkConditions,
) -> Result<()> {
    send(executor, deployment, conditions).await?;
    Ok(())
}

#[instrument(skip(executor))]
pub async fn clear_all_network_limitations(executor: &ResourceExecutor, deployment: &str) -> Result<()> {
    send(executor, deployment, &NetworkConditions::default()).await?;
    Ok(())
}
