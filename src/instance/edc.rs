//! EDC connector
//!
//! Configuration is staged in a config map and copied into a writable
//! `emptyDir` by an init container before the connector starts.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, PodSpec,
    Volume, VolumeMount,
};

use super::base::{image_pull_secret_for, InstanceBase};
use super::types::{ContainerImage, Endpoint};
use super::{Instance, PullSecrets};
use crate::error::Result;
use crate::k8s::ResourceExecutor;

pub const DEFAULT_IMAGE: &str =
    "registry.gitlab.cc-asp.fraunhofer.de/dssim/dssim-kubernetes-controller/edc-ids-custom:latest";

const CONFIG_FILE: &str = "config.properties";
const VAULT_FILE: &str = "dataspaceconnector-vault.properties";
const KEYSTORE_FILE: &str = "keystore";
const CONFIG_DIR: &str = "config-dir";
const SSL_REDIRECT: &str = "nginx.ingress.kubernetes.io/ssl-redirect";

/// Renders `config.properties` from the hostname and endpoints
pub type ConfigFileGenerator = Arc<dyn Fn(&str, &[Endpoint]) -> String + Send + Sync>;

pub fn edc_endpoints() -> Vec<Endpoint> {
    vec![
        Endpoint::new("controller", "/api", 8181),
        Endpoint::new("ids", "/api/v1/ids", 8282),
        Endpoint::new("datamanagement", "/api/v1/data", 8383),
        Endpoint::new("dataplane", "/dataplane", 8484),
        Endpoint::new("control", "/control", 8585),
        Endpoint::new("public", "/public", 8686),
    ]
}

#[derive(Clone)]
pub struct EdcInstance {
    base: InstanceBase,
    config_map_name: String,
    generate_config_file: ConfigFileGenerator,
    /// Base64 encoded keystore
    keystore: String,
    vault_file: String,
    vault_password: String,
}

impl fmt::Debug for EdcInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdcInstance")
            .field("base", &self.base)
            .field("config_map_name", &self.config_map_name)
            .finish_non_exhaustive()
    }
}

impl EdcInstance {
    pub fn new(
        name: &str,
        generate_config_file: ConfigFileGenerator,
        keystore: &str,
        vault_file: &str,
        vault_password: &str,
    ) -> Self {
        Self {
            base: InstanceBase::new(name, vec![ContainerImage::new(DEFAULT_IMAGE)], edc_endpoints()),
            config_map_name: format!("edc-pre-config-{}", name),
            generate_config_file,
            keystore: keystore.to_string(),
            vault_file: vault_file.to_string(),
            vault_password: vault_password.to_string(),
        }
    }

    pub fn with_images(mut self, images: Vec<ContainerImage>) -> Self {
        self.base = InstanceBase::new(self.base.name(), images, edc_endpoints());
        self
    }

    pub fn config_map_name(&self) -> &str {
        &self.config_map_name
    }

    fn pod_spec(&self, pull_secrets: &PullSecrets) -> PodSpec {
        let config_mount = VolumeMount {
            name: CONFIG_DIR.to_string(),
            mount_path: "/config".to_string(),
            ..Default::default()
        };

        let init = Container {
            name: "init-config".to_string(),
            image: Some("alpine:latest".to_string()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "cp /preconfig/* /config/".to_string(),
            ]),
            volume_mounts: Some(vec![
                config_mount.clone(),
                VolumeMount {
                    name: self.config_map_name.clone(),
                    mount_path: "/preconfig".to_string(),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        let env = [
            ("EDC_FS_CONFIG", format!("/config/{}", CONFIG_FILE)),
            ("EDC_VAULT", format!("/config/{}", VAULT_FILE)),
            ("EDC_KEYSTORE", format!("/config/{}", KEYSTORE_FILE)),
            ("EDC_KEYSTORE_PASSWORD", self.vault_password.clone()),
        ]
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        })
        .collect();

        let image = self.base.images().first();
        let connector = Container {
            name: self.base.name().to_string(),
            image: image.map(|i| i.image.clone()),
            image_pull_policy: Some("Always".to_string()),
            ports: Some(
                self.base
                    .endpoints()
                    .iter()
                    .map(|e| ContainerPort {
                        container_port: e.port,
                        name: Some(e.name.clone()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            env: Some(env),
            volume_mounts: Some(vec![config_mount]),
            ..Default::default()
        };

        PodSpec {
            image_pull_secrets: image.and_then(|i| image_pull_secret_for(i, pull_secrets)),
            volumes: Some(vec![
                Volume {
                    name: CONFIG_DIR.to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                },
                Volume {
                    name: self.config_map_name.clone(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: Some(self.config_map_name.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            init_containers: Some(vec![init]),
            containers: vec![connector],
            ..Default::default()
        }
    }
}

#[async_trait]
impl Instance for EdcInstance {
    fn base(&self) -> &InstanceBase {
        &self.base
    }

    async fn deploy_config_maps(&self, executor: &ResourceExecutor) -> Result<()> {
        let config = (self.generate_config_file)(self.base.name(), self.base.endpoints());
        let data: BTreeMap<String, String> = [
            (CONFIG_FILE.to_string(), config),
            (VAULT_FILE.to_string(), self.vault_file.clone()),
        ]
        .into_iter()
        .collect();
        let binary: BTreeMap<String, String> = [(KEYSTORE_FILE.to_string(), self.keystore.clone())]
            .into_iter()
            .collect();

        executor
            .deploy_config_map(&self.config_map_name, Some(&data), Some(&binary))
            .await
    }

    async fn deploy_app(&self, executor: &ResourceExecutor, pull_secrets: &PullSecrets) -> Result<()> {
        let spec = self.base.app_deployment_spec(self.pod_spec(pull_secrets));
        self.base.deploy_app(executor, spec).await
    }

    async fn deploy_ingress(&mut self, executor: &ResourceExecutor) -> Result<()> {
        let name = self.base.name().to_string();
        let annotations: BTreeMap<String, String> = [(SSL_REDIRECT.to_string(), "false".to_string())]
            .into_iter()
            .collect();
        self.base
            .deploy_ingress_named(executor, &format!("{}-admin", name), Some(annotations))
            .await?;

        let health = self
            .base
            .endpoints()
            .iter()
            .find(|e| e.name == "datamanagement")
            .map(|e| format!("https://{}{}/check/health", name, e.path));
        self.base.publish(Some(format!("http://{}", name)), &name, health);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::testing::FakeCluster;
    use crate::k8s::PollConfig;

    fn edc(name: &str) -> EdcInstance {
        let generator: ConfigFileGenerator = Arc::new(|host: &str, endpoints: &[Endpoint]| {
            endpoints
                .iter()
                .map(|e| format!("web.http.{}.port={}\nweb.http.{}.path={}\n", e.name, e.port, e.name, e.path))
                .collect::<String>()
                + &format!("edc.hostname={}\n", host)
        });
        EdcInstance::new(name, generator, "a2V5c3RvcmU=", "edc.vault=1", "changeit")
    }

    #[tokio::test]
    async fn test_config_map_contents() {
        let cluster = FakeCluster::new();
        let executor = ResourceExecutor::new(cluster.clone(), "dssim", "run-1")
            .with_poll_config(PollConfig::immediate());

        edc("consumer").deploy_config_maps(&executor).await.unwrap();

        let config_map = &cluster.config_maps()[0];
        assert_eq!(config_map.metadata.name.as_deref(), Some("edc-pre-config-consumer"));
        let data = config_map.data.as_ref().unwrap();
        assert!(data[CONFIG_FILE].contains("edc.hostname=consumer"));
        assert!(data[CONFIG_FILE].contains("web.http.public.port=8686"));
        assert_eq!(data[VAULT_FILE], "edc.vault=1");
        let binary = config_map.binary_data.as_ref().unwrap();
        assert_eq!(binary[KEYSTORE_FILE].0, b"keystore".to_vec());
    }

    #[test]
    fn test_init_container_stages_config() {
        let instance = edc("consumer");
        let pod = instance.pod_spec(&PullSecrets::new());

        assert!(pod.image_pull_secrets.is_none());
        let init = &pod.init_containers.as_ref().unwrap()[0];
        let mounts: Vec<&str> = init
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.mount_path.as_str())
            .collect();
        assert_eq!(mounts, vec!["/config", "/preconfig"]);
        assert_eq!(pod.containers[0].ports.as_ref().unwrap().len(), 6);
    }

    #[test]
    fn test_pull_secret_of_first_image() {
        let instance = edc("consumer").with_images(vec![
            ContainerImage::new("ghcr.io/org/edc:0.1").with_pull_secret("ghcr.io", "u", "p")
        ]);
        let pull_secrets: PullSecrets = [("ghcr.io".to_string(), "ghcrioorgedc01".to_string())]
            .into_iter()
            .collect();

        let pod = instance.pod_spec(&pull_secrets);
        assert_eq!(
            pod.image_pull_secrets.unwrap()[0].name.as_deref(),
            Some("ghcrioorgedc01")
        );
    }

    #[tokio::test]
    async fn test_admin_ingress_and_health_url() {
        let cluster = FakeCluster::new();
        let executor = ResourceExecutor::new(cluster.clone(), "dssim", "run-1")
            .with_poll_config(PollConfig::immediate());
        let mut instance = edc("consumer");

        instance.deploy_ingress(&executor).await.unwrap();

        assert_eq!(cluster.ingresses()[0].metadata.name.as_deref(), Some("consumer-admin"));
        assert_eq!(instance.base().endpoint_url(), Some("http://consumer"));
        assert_eq!(
            instance.base().health_check_url(),
            Some("https://consumer/api/v1/data/check/health")
        );
    }
}
