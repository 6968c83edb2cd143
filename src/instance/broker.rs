//! Metadata broker with its Fuseki triple store sidecar

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PodSpec, Volume, VolumeMount,
};

use super::base::{image_pull_secrets, InstanceBase};
use super::types::{ContainerImage, Endpoint};
use super::{Instance, PullSecrets};
use crate::error::{Error, Result};
use crate::k8s::ResourceExecutor;

pub const DEFAULT_BROKER_IMAGE: &str = "registry.gitlab.cc-asp.fraunhofer.de/eis-ids/broker-open/core:5.0.0";
pub const DEFAULT_FUSEKI_IMAGE: &str = "registry.gitlab.cc-asp.fraunhofer.de/eis-ids/broker-open/fuseki";

const KEY_FILE: &str = "server.key";
const CRT_FILE: &str = "server.crt";
const JKS_FILE: &str = "isstbroker-keystore.jks";
const CERT_DIR: &str = "/etc/cert";
const FUSEKI_NAME: &str = "fuseki";
const FUSEKI_PORT: i32 = 3030;
const BROKER_PORT: i32 = 8080;

pub fn broker_endpoints() -> Vec<Endpoint> {
    vec![
        Endpoint::new("broker", "/", BROKER_PORT),
        Endpoint::new(FUSEKI_NAME, "/fuseki", FUSEKI_PORT),
    ]
}

/// TLS material is passed base64 encoded and mounted under `/etc/cert`
#[derive(Debug, Clone)]
pub struct BrokerInstance {
    base: InstanceBase,
    config_map_name: String,
    crt_file: String,
    key_file: String,
    jks_file: String,
}

impl BrokerInstance {
    pub fn new(name: &str, crt_file: &str, key_file: &str, jks_file: &str) -> Self {
        Self {
            base: InstanceBase::new(
                name,
                vec![
                    ContainerImage::new(DEFAULT_BROKER_IMAGE),
                    ContainerImage::new(DEFAULT_FUSEKI_IMAGE),
                ],
                broker_endpoints(),
            ),
            config_map_name: format!("broker-pre-config-{}", name),
            crt_file: crt_file.to_string(),
            key_file: key_file.to_string(),
            jks_file: jks_file.to_string(),
        }
    }

    /// Broker image first, Fuseki second
    pub fn with_images(mut self, images: Vec<ContainerImage>) -> Self {
        self.base = InstanceBase::new(self.base.name(), images, broker_endpoints());
        self
    }

    fn pod_spec(&self, pull_secrets: &PullSecrets) -> Result<PodSpec> {
        let name = self.base.name();
        let [broker_image, fuseki_image] = self.base.images() else {
            return Err(Error::Config(format!(
                "Broker {} needs exactly two images (broker, fuseki)",
                name
            )));
        };

        let env = [
            ("SPARQL_ENDPOINT", format!("http://{}:{}/connectorData", name, FUSEKI_PORT)),
            ("SHACL_VALIDATION", "true".to_string()),
            ("DAPS_VALIDATE_INCOMING", "true".to_string()),
            ("IDENTITY_JAVAKEYSTORE", format!("{}/{}", CERT_DIR, JKS_FILE)),
            ("COMPONENT_URI", "https://localhost/".to_string()),
            ("COMPONENT_CATALOGURI", "https://localhost/connectors/".to_string()),
            ("JWKS_TRUSTEDHOSTS", "daps.aisec.fraunhofer.de,omejdn".to_string()),
        ]
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        })
        .collect();

        let broker = Container {
            name: name.to_string(),
            image: Some(broker_image.image.clone()),
            ports: Some(vec![ContainerPort {
                name: Some("root".to_string()),
                container_port: BROKER_PORT,
                ..Default::default()
            }]),
            env: Some(env),
            volume_mounts: Some(vec![VolumeMount {
                name: self.config_map_name.clone(),
                mount_path: CERT_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let fuseki = Container {
            name: FUSEKI_NAME.to_string(),
            image: Some(fuseki_image.image.clone()),
            ports: Some(vec![ContainerPort {
                name: Some(FUSEKI_NAME.to_string()),
                container_port: FUSEKI_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        };

        Ok(PodSpec {
            image_pull_secrets: image_pull_secrets(pull_secrets),
            volumes: Some(vec![Volume {
                name: self.config_map_name.clone(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(self.config_map_name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            containers: vec![broker, fuseki],
            ..Default::default()
        })
    }
}

#[async_trait]
impl Instance for BrokerInstance {
    fn base(&self) -> &InstanceBase {
        &self.base
    }

    async fn deploy_config_maps(&self, executor: &ResourceExecutor) -> Result<()> {
        let binary: BTreeMap<String, String> = [
            (KEY_FILE.to_string(), self.key_file.clone()),
            (CRT_FILE.to_string(), self.crt_file.clone()),
            (JKS_FILE.to_string(), self.jks_file.clone()),
        ]
        .into_iter()
        .collect();

        executor
            .deploy_config_map(&self.config_map_name, None, Some(&binary))
            .await
    }

    async fn deploy_app(&self, executor: &ResourceExecutor, pull_secrets: &PullSecrets) -> Result<()> {
        let spec = self.base.app_deployment_spec(self.pod_spec(pull_secrets)?);
        self.base.deploy_app(executor, spec).await
    }

    async fn deploy_ingress(&mut self, executor: &ResourceExecutor) -> Result<()> {
        let name = self.base.name().to_string();
        let annotations: BTreeMap<String, String> = [(
            "nginx.ingress.kubernetes.io/ssl-redirect".to_string(),
            "false".to_string(),
        )]
        .into_iter()
        .collect();
        self.base
            .deploy_ingress_named(executor, &format!("{}-admin", name), Some(annotations))
            .await?;

        let url = format!("https://{}", name);
        self.base.publish(Some(url.clone()), &name, Some(url));
        Ok(())
    }
}
