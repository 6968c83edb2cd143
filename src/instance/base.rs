//! Shared stage behavior
//!
//! Variants hold an [`InstanceBase`] and delegate the stages they do not
//! customise to it.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::DeploymentSpec;
use k8s_openapi::api::core::v1::{LocalObjectReference, PodSpec, PodTemplateSpec};
use k8s_openapi::api::networking::v1::IngressRule;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use tracing::{info, instrument};

use super::types::{ContainerImage, Endpoint};
use super::PullSecrets;
use crate::error::Result;
use crate::k8s::resources::{ingress_path, ingress_rule, service_port, APP_LABEL};
use crate::k8s::{CpuLimit, MemoryLimit, RegistryAuth, ResourceExecutor};

/// Identity, resources and published URLs of one instance
#[derive(Debug, Clone)]
pub struct InstanceBase {
    name: String,
    images: Vec<ContainerImage>,
    endpoints: Vec<Endpoint>,
    memory_limit: Option<MemoryLimit>,
    cpu_limit: Option<CpuLimit>,
    endpoint_url: Option<String>,
    hostname: Option<String>,
    health_check_url: Option<String>,
}

impl InstanceBase {
    pub fn new(name: &str, images: Vec<ContainerImage>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            name: name.to_string(),
            images,
            endpoints,
            memory_limit: None,
            cpu_limit: None,
            endpoint_url: None,
            hostname: None,
            health_check_url: None,
        }
    }

    pub fn with_limits(mut self, memory: Option<MemoryLimit>, cpu: Option<CpuLimit>) -> Self {
        self.memory_limit = memory;
        self.cpu_limit = cpu;
        self
    }

    /// Deployment name; also the name of every object the instance owns
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn images(&self) -> &[ContainerImage] {
        &self.images
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn memory_limit(&self) -> Option<&MemoryLimit> {
        self.memory_limit.as_ref()
    }

    pub fn cpu_limit(&self) -> Option<&CpuLimit> {
        self.cpu_limit.as_ref()
    }

    pub fn endpoint_url(&self) -> Option<&str> {
        self.endpoint_url.as_deref()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn health_check_url(&self) -> Option<&str> {
        self.health_check_url.as_deref()
    }

    /// Record where the instance is reachable once its ingress exists
    pub fn publish(&mut self, endpoint_url: Option<String>, hostname: &str, health_check_url: Option<String>) {
        self.endpoint_url = endpoint_url;
        self.hostname = Some(hostname.to_string());
        self.health_check_url = health_check_url;
    }

    /// One registry credential secret per credentialed image.
    ///
    /// Returns registry host -> secret name. "Already exists" is not an
    /// error, so repeating the stage yields the same mapping.
    #[instrument(skip_all, fields(instance = %self.name))]
    pub async fn deploy_pull_secrets(&self, executor: &ResourceExecutor) -> Result<PullSecrets> {
        let mut secrets = PullSecrets::new();

        for image in &self.images {
            let Some(pull_secret) = &image.pull_secret else {
                continue;
            };
            let secret_name = image.secret_name();
            info!(secret = %secret_name, "Deploy pull secret");

            let registries: BTreeMap<String, RegistryAuth> = [(
                pull_secret.registry.clone(),
                RegistryAuth {
                    username: pull_secret.username.clone(),
                    password: pull_secret.password.clone(),
                },
            )]
            .into_iter()
            .collect();
            executor
                .deploy_dockercfg_secret(&secret_name, &registries)
                .await?;

            secrets.insert(pull_secret.registry.clone(), secret_name);
        }

        Ok(secrets)
    }

    /// One service named after the instance exposing every endpoint port
    pub async fn deploy_services(&self, executor: &ResourceExecutor) -> Result<()> {
        let ports = self
            .endpoints
            .iter()
            .map(|e| service_port(&e.name, e.port, e.port))
            .collect();
        executor.deploy_service(&self.name, &self.name, ports).await
    }

    /// Host `<name>` with one prefix path per endpoint
    pub fn endpoint_ingress_rule(&self) -> IngressRule {
        let paths = self
            .endpoints
            .iter()
            .map(|e| ingress_path(&self.name, &e.path, e.port))
            .collect();
        ingress_rule(&self.name, paths)
    }

    pub async fn deploy_ingress(
        &self,
        executor: &ResourceExecutor,
        annotations: Option<BTreeMap<String, String>>,
    ) -> Result<()> {
        self.deploy_ingress_named(executor, &self.name, annotations).await
    }

    /// Endpoint routes under a different ingress object name
    pub async fn deploy_ingress_named(
        &self,
        executor: &ResourceExecutor,
        ingress_name: &str,
        annotations: Option<BTreeMap<String, String>>,
    ) -> Result<()> {
        executor
            .deploy_ingress(ingress_name, vec![self.endpoint_ingress_rule()], annotations)
            .await
    }

    /// Submit `spec` with this instance's limits and wait for readiness
    pub async fn deploy_app(&self, executor: &ResourceExecutor, spec: DeploymentSpec) -> Result<()> {
        executor
            .deploy_app(&self.name, spec, self.memory_limit(), self.cpu_limit())
            .await?;
        Ok(())
    }

    /// Single replica selected and labelled by `app=<name>`
    pub fn app_deployment_spec(&self, pod: PodSpec) -> DeploymentSpec {
        let labels: BTreeMap<String, String> = [(APP_LABEL.to_string(), self.name.clone())]
            .into_iter()
            .collect();

        DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }
    }
}

/// Pod references to every deployed pull secret
pub fn image_pull_secrets(pull_secrets: &PullSecrets) -> Option<Vec<LocalObjectReference>> {
    Some(
        pull_secrets
            .values()
            .map(|name| LocalObjectReference {
                name: Some(name.clone()),
            })
            .collect(),
    )
}

/// Pod reference to the secret of the registry `image` is pulled from, if any
pub fn image_pull_secret_for(
    image: &ContainerImage,
    pull_secrets: &PullSecrets,
) -> Option<Vec<LocalObjectReference>> {
    let registry = &image.pull_secret.as_ref()?.registry;
    let name = pull_secrets.get(registry)?;
    Some(vec![LocalObjectReference {
        name: Some(name.clone()),
    }])
}
