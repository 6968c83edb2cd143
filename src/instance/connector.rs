//! Dataspace connector

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, PodSpec, Probe,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::base::{image_pull_secrets, InstanceBase};
use super::types::{ContainerImage, Endpoint};
use super::{Instance, PullSecrets};
use crate::error::Result;
use crate::k8s::resources::{ingress_path, ingress_rule, service_port};
use crate::k8s::{CpuLimit, MemoryLimit, ResourceExecutor};

/// Port the connector serves HTTPS on inside the pod
pub const CONNECTOR_PORT: i32 = 8080;

/// Service port in front of [`CONNECTOR_PORT`]
pub const SERVICE_PORT: i32 = 443;

const BACKEND_PROTOCOL: &str = "nginx.ingress.kubernetes.io/backend-protocol";

/// Single-container connector backed by a datasource login
#[derive(Debug, Clone)]
pub struct ConnectorInstance {
    base: InstanceBase,
    username: String,
    password: String,
}

impl ConnectorInstance {
    pub fn new(name: &str, username: &str, password: &str, images: Vec<ContainerImage>) -> Self {
        Self {
            base: InstanceBase::new(
                name,
                images,
                vec![Endpoint::new("main", "/api/ids/data", CONNECTOR_PORT)],
            ),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn with_limits(mut self, memory: Option<MemoryLimit>, cpu: Option<CpuLimit>) -> Self {
        self.base = self.base.with_limits(memory, cpu);
        self
    }

    fn readiness_probe() -> Probe {
        Probe {
            failure_threshold: Some(20),
            http_get: Some(HTTPGetAction {
                path: Some("/".to_string()),
                port: IntOrString::Int(CONNECTOR_PORT),
                scheme: Some("HTTPS".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(15),
            period_seconds: Some(10),
            success_threshold: Some(1),
            timeout_seconds: Some(2),
            ..Default::default()
        }
    }

    fn pod_spec(&self, pull_secrets: &PullSecrets) -> PodSpec {
        let env = vec![
            EnvVar {
                name: "SPRING_DATASOURCE_USERNAME".to_string(),
                value: Some(self.username.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "SPRING_DATASOURCE_PASSWORD".to_string(),
                value: Some(self.password.clone()),
                ..Default::default()
            },
        ];

        PodSpec {
            image_pull_secrets: image_pull_secrets(pull_secrets),
            containers: vec![Container {
                name: self.base.name().to_string(),
                image: self.base.images().first().map(|i| i.image.clone()),
                image_pull_policy: Some("Always".to_string()),
                ports: Some(vec![ContainerPort {
                    container_port: CONNECTOR_PORT,
                    name: Some("restendpoint".to_string()),
                    ..Default::default()
                }]),
                readiness_probe: Some(Self::readiness_probe()),
                env: Some(env),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl Instance for ConnectorInstance {
    fn base(&self) -> &InstanceBase {
        &self.base
    }

    async fn deploy_app(&self, executor: &ResourceExecutor, pull_secrets: &PullSecrets) -> Result<()> {
        let spec = self.base.app_deployment_spec(self.pod_spec(pull_secrets));
        self.base.deploy_app(executor, spec).await
    }

    /// HTTPS on 443, forwarded to the connector port
    async fn deploy_services(&self, executor: &ResourceExecutor) -> Result<()> {
        let name = self.base.name();
        executor
            .deploy_service(name, name, vec![service_port("https", SERVICE_PORT, CONNECTOR_PORT)])
            .await
    }

    async fn deploy_ingress(&mut self, executor: &ResourceExecutor) -> Result<()> {
        let name = self.base.name().to_string();
        let rule = ingress_rule(&name, vec![ingress_path(&name, "/", SERVICE_PORT)]);
        let annotations: BTreeMap<String, String> =
            [(BACKEND_PROTOCOL.to_string(), "HTTPS".to_string())]
                .into_iter()
                .collect();
        executor
            .deploy_ingress(&name, vec![rule], Some(annotations))
            .await?;

        let url = format!("https://{}", name);
        self.base.publish(Some(url.clone()), &name, Some(url));
        Ok(())
    }
}
