//! Generic service built from plain container images

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, Probe};

use super::base::{image_pull_secrets, InstanceBase};
use super::types::{ContainerImage, Endpoint};
use super::{Instance, PullSecrets};
use crate::error::Result;
use crate::k8s::ResourceExecutor;

/// One container per image, named `<name><index>`, each exposing every
/// endpoint port
#[derive(Debug, Clone)]
pub struct CustomService {
    base: InstanceBase,
    readiness_probes: Vec<Probe>,
}

impl CustomService {
    pub fn new(name: &str, images: Vec<ContainerImage>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            base: InstanceBase::new(name, images, endpoints),
            readiness_probes: Vec::new(),
        }
    }

    /// Probes are matched to images by position
    pub fn with_readiness_probes(mut self, probes: Vec<Probe>) -> Self {
        self.readiness_probes = probes;
        self
    }

    fn pod_spec(&self, pull_secrets: &PullSecrets) -> PodSpec {
        let ports: Vec<ContainerPort> = self
            .base
            .endpoints()
            .iter()
            .map(|e| ContainerPort {
                container_port: e.port,
                name: Some(e.name.clone()),
                ..Default::default()
            })
            .collect();

        let containers = self
            .base
            .images()
            .iter()
            .enumerate()
            .map(|(index, image)| Container {
                name: format!("{}{}", self.base.name(), index),
                image: Some(image.image.clone()),
                image_pull_policy: Some("Always".to_string()),
                ports: Some(ports.clone()),
                readiness_probe: self.readiness_probes.get(index).cloned(),
                ..Default::default()
            })
            .collect();

        PodSpec {
            image_pull_secrets: image_pull_secrets(pull_secrets),
            containers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Instance for CustomService {
    fn base(&self) -> &InstanceBase {
        &self.base
    }

    async fn deploy_app(&self, executor: &ResourceExecutor, pull_secrets: &PullSecrets) -> Result<()> {
        let spec = self.base.app_deployment_spec(self.pod_spec(pull_secrets));
        self.base.deploy_app(executor, spec).await
    }

    async fn deploy_ingress(&mut self, executor: &ResourceExecutor) -> Result<()> {
        self.base.deploy_ingress(executor, None).await?;
        let name = self.base.name().to_string();
        self.base.publish(Some(format!("https://{}", name)), &name, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::HTTPGetAction;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    #[test]
    fn test_containers_per_image() {
        let probe = Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/health".to_string()),
                port: IntOrString::Int(8080),
                ..Default::default()
            }),
            ..Default::default()
        };
        let service = CustomService::new(
            "web",
            vec![ContainerImage::new("nginx:1.25"), ContainerImage::new("envoy:1.28")],
            vec![Endpoint::new("http", "/", 8080), Endpoint::new("admin", "/admin", 9901)],
        )
        .with_readiness_probes(vec![probe.clone()]);

        let pull_secrets: PullSecrets = [("ghcr.io".to_string(), "ghcrioweb".to_string())].into_iter().collect();
        let pod = service.pod_spec(&pull_secrets);

        assert_eq!(pod.containers.len(), 2);
        assert_eq!(pod.containers[0].name, "web0");
        assert_eq!(pod.containers[1].name, "web1");
        assert_eq!(pod.containers[0].readiness_probe, Some(probe));
        assert!(pod.containers[1].readiness_probe.is_none());
        assert_eq!(pod.containers[1].ports.as_ref().unwrap().len(), 2);
        assert_eq!(
            pod.image_pull_secrets.unwrap()[0].name.as_deref(),
            Some("ghcrioweb")
        );
    }
}
