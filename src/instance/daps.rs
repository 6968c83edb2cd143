//! Token issuer (Omejdn DAPS) with its admin UI

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, PodSpec,
    SecretVolumeSource, Volume, VolumeMount,
};

use super::base::{image_pull_secret_for, InstanceBase};
use super::types::ContainerImage;
use super::{Instance, PullSecrets};
use crate::config::DapsConfig;
use crate::error::{Error, Result};
use crate::k8s::resources::{ingress_path, ingress_rule, service_port};
use crate::k8s::ResourceExecutor;

pub const DEFAULT_SERVER_IMAGE: &str = "ghcr.io/fraunhofer-aisec/omejdn-server:1.7.1";
pub const DEFAULT_UI_IMAGE: &str = "ghcr.io/fraunhofer-aisec/omejdn-ui:dev";

const SERVER_CONTAINER: &str = "daps-container";
const UI_CONTAINER: &str = "daps-ui-container";
const SERVER_PORT: i32 = 4567;
const UI_PORT: i32 = 80;
const ISSUER: &str = "https://daps/";

/// Key id of the preregistered demo connector
const CONNECTOR_CLIENT_ID: &str = "CB:BA:EC:89:5A:4F:92:05:59:A7:1F:BF:AE:0D:5F:B1:92:44:5F:77:keyid:CB:BA:EC:89:5A:4F:92:05:59:A7:1F:BF:AE:0D:5F:B1:92:44:5F:77";

const OMEJDN_YML: &str = r#"---
user_backend_default: yaml
issuer: http://daps/
front_url: http://daps/
bind_to: 0.0.0.0:4567
environment: development
openid: true
default_audience: idsc:IDS_CONNECTORS_ALL
accept_audience: idsc:IDS_CONNECTORS_ALL
access_token:
  expiration: 3600
  algorithm: RS256
id_token:
  expiration: 3600
  algorithm: RS256
"#;

const SCOPE_MAPPING_YML: &str = r#"---
idsc:IDS_CONNECTOR_ATTRIBUTES_ALL:
- securityProfile
- referringConnector
- "@type"
- "@context"
- transportCertsSha256
"#;

fn clients_yml() -> String {
    format!(
        r#"---
- client_id: adminUI
  client_name: Omejdn Admin UI
  client_uri: https://dapsui
  logo_uri: https://dapsui/assets/img/fhg.jpg
  grant_types: authorization_code
  software_id: Omejdn Admin UI
  software_version: 0.0.0
  token_endpoint_auth_method: none
  redirect_uris: https://dapsui
  post_logout_redirect_uris: https://dapsui
  scope:
  - openid
  - omejdn:admin
  - omejdn:write
  - omejdn:read
  attributes: []
- client_id: {client_id}
  client_name: connector1
  grant_types: client_credentials
  token_endpoint_auth_method: private_key_jwt
  scope: idsc:IDS_CONNECTOR_ATTRIBUTES_ALL
  attributes:
  - key: idsc
    value: IDS_CONNECTOR_ATTRIBUTES_ALL
  - key: securityProfile
    value: idsc:BASE_SECURITY_PROFILE
  - key: referringConnector
    value: http://connector1.demo
  - key: "@type"
    value: ids:DatPayload
  - key: "@context"
    value: https://w3id.org/idsa/contexts/context.jsonld
  - key: transportCertsSha256
    value: 0c8956f59167e90ed6ae3d60e19c5bab7b517a96221e63f2fb382ad5d5ad7231
"#,
        client_id = CONNECTOR_CLIENT_ID
    )
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn env(pairs: Vec<(&str, String)>) -> Vec<EnvVar> {
    pairs
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        })
        .collect()
}

/// Token issuer. Key material comes from [`DapsConfig`], read from the
/// environment at the secrets stage unless supplied up front.
#[derive(Debug, Clone)]
pub struct DapsInstance {
    base: InstanceBase,
    username: String,
    password: String,
    keys: Option<DapsConfig>,
}

impl DapsInstance {
    pub fn new(name: &str, username: &str, password: &str) -> Self {
        Self {
            base: InstanceBase::new(
                name,
                vec![
                    ContainerImage::new(DEFAULT_SERVER_IMAGE),
                    ContainerImage::new(DEFAULT_UI_IMAGE),
                ],
                vec![],
            ),
            username: username.to_string(),
            password: password.to_string(),
            keys: None,
        }
    }

    pub fn with_keys(mut self, keys: DapsConfig) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Server image first, UI second
    pub fn with_images(mut self, images: Vec<ContainerImage>) -> Self {
        self.base = InstanceBase::new(self.base.name(), images, vec![]);
        self
    }

    fn config_map_name(&self) -> String {
        format!("{}-pre-config", self.base.name())
    }

    fn keys_secret_name(&self) -> String {
        format!("{}-keys", self.base.name())
    }

    fn ui_host(&self) -> String {
        format!("{}ui", self.base.name())
    }

    fn pod_spec(&self, pull_secrets: &PullSecrets) -> Result<PodSpec> {
        let [server_image, ui_image] = self.base.images() else {
            return Err(Error::Config(format!(
                "DAPS {} needs exactly two images (server, ui)",
                self.base.name()
            )));
        };

        let bootstrap = format!(
            "cp /opt/preconfig/* /opt/config/; \
             mkdir -p /opt/keys/omejdn; cp /opt/prekeys/omejdn.key /opt/keys/omejdn/; \
             mkdir -p /opt/keys/clients; cp /opt/prekeys/connector1.cert /opt/keys/clients/{}.cert",
            CONNECTOR_CLIENT_ID
        );
        let init = Container {
            name: "init-config".to_string(),
            image: Some("busybox:latest".to_string()),
            command: Some(vec!["sh".to_string(), "-c".to_string(), bootstrap]),
            volume_mounts: Some(vec![
                mount("config-dir", "/opt/config"),
                mount("pre-config", "/opt/preconfig"),
                mount("keys-dir", "/opt/keys"),
                mount("pre-keys", "/opt/prekeys"),
            ]),
            ..Default::default()
        };

        let server = Container {
            name: SERVER_CONTAINER.to_string(),
            image: Some(server_image.image.clone()),
            image_pull_policy: Some("Always".to_string()),
            ports: Some(vec![ContainerPort {
                container_port: SERVER_PORT,
                name: Some("restendpoint".to_string()),
                ..Default::default()
            }]),
            env: Some(env(vec![
                ("OMEJDN_ISSUER", ISSUER.to_string()),
                ("OMEJDN_FRONT_URL", ISSUER.to_string()),
                ("OMEJDN_OPENID", "true".to_string()),
                ("OMEJDN_ENVIRONMENT", "development".to_string()),
                ("OMEJDN_ACCEPT_AUDIENCE", "idsc:IDS_CONNECTORS_ALL".to_string()),
                ("OMEJDN_DEFAULT_AUDIENCE", "idsc:IDS_CONNECTORS_ALL".to_string()),
                ("OMEJDN_ADMIN", format!("{}:{}", self.username, self.password)),
            ])),
            volume_mounts: Some(vec![
                mount("config-dir", "/opt/config"),
                mount("keys-dir", "/opt/keys"),
            ]),
            ..Default::default()
        };

        let ui = Container {
            name: UI_CONTAINER.to_string(),
            image: Some(ui_image.image.clone()),
            ports: Some(vec![ContainerPort {
                container_port: UI_PORT,
                name: Some("ui".to_string()),
                ..Default::default()
            }]),
            env: Some(env(vec![
                ("OIDC_ISSUER", ISSUER.to_string()),
                ("API_URL", format!("{}api/v1", ISSUER)),
                ("CLIENT_ID", "adminUI".to_string()),
            ])),
            ..Default::default()
        };

        Ok(PodSpec {
            image_pull_secrets: image_pull_secret_for(server_image, pull_secrets),
            volumes: Some(vec![
                empty_dir("config-dir"),
                empty_dir("keys-dir"),
                Volume {
                    name: "pre-config".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: Some(self.config_map_name()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "pre-keys".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(self.keys_secret_name()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            init_containers: Some(vec![init]),
            containers: vec![server, ui],
            ..Default::default()
        })
    }
}

#[async_trait]
impl Instance for DapsInstance {
    fn base(&self) -> &InstanceBase {
        &self.base
    }

    async fn deploy_secrets(&self, executor: &ResourceExecutor) -> Result<()> {
        let keys = match &self.keys {
            Some(keys) => keys.clone(),
            None => DapsConfig::from_env()?,
        };
        let values: BTreeMap<String, String> = [
            ("connector1.cert".to_string(), keys.connector_cert),
            ("omejdn.key".to_string(), keys.signing_key),
        ]
        .into_iter()
        .collect();

        executor
            .deploy_opaque_secret(&self.keys_secret_name(), &values)
            .await
    }

    async fn deploy_config_maps(&self, executor: &ResourceExecutor) -> Result<()> {
        let data: BTreeMap<String, String> = [
            ("clients.yml".to_string(), clients_yml()),
            ("omejdn.yml".to_string(), OMEJDN_YML.to_string()),
            ("scope_mapping.yml".to_string(), SCOPE_MAPPING_YML.to_string()),
        ]
        .into_iter()
        .collect();

        executor
            .deploy_config_map(&self.config_map_name(), Some(&data), None)
            .await
    }

    async fn deploy_app(&self, executor: &ResourceExecutor, pull_secrets: &PullSecrets) -> Result<()> {
        let spec = self.base.app_deployment_spec(self.pod_spec(pull_secrets)?);
        self.base.deploy_app(executor, spec).await
    }

    async fn deploy_services(&self, executor: &ResourceExecutor) -> Result<()> {
        let name = self.base.name();
        executor
            .deploy_service(
                name,
                name,
                vec![
                    service_port("daps", SERVER_PORT, SERVER_PORT),
                    service_port("dapsui", UI_PORT, UI_PORT),
                ],
            )
            .await
    }

    /// `<name>` routes to the server, `<name>ui` to the admin UI
    async fn deploy_ingress(&mut self, executor: &ResourceExecutor) -> Result<()> {
        let name = self.base.name().to_string();
        let ui_host = self.ui_host();

        executor
            .deploy_ingress(
                &name,
                vec![ingress_rule(&name, vec![ingress_path(&name, "/", SERVER_PORT)])],
                None,
            )
            .await?;
        executor
            .deploy_ingress(
                &ui_host,
                vec![ingress_rule(&ui_host, vec![ingress_path(&name, "/", UI_PORT)])],
                None,
            )
            .await?;

        self.base.publish(Some(format!("https://{}", name)), &name, None);
        Ok(())
    }
}
