//! Kubernetes resource builders for DSSim
//!
//! Pure functions producing the objects the executor submits. Every builder
//! stamps the group label so teardown can find the object again.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ResourceRequirements, Secret, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Error, Result};

/// Label carrying the ownership marker
pub const GROUP_LABEL: &str = "group";
/// Label services select pods by
pub const APP_LABEL: &str = "app";

pub const DOCKERCONFIG_SECRET_TYPE: &str = "kubernetes.io/dockerconfigjson";
pub const DOCKERCONFIG_KEY: &str = ".dockerconfigjson";
pub const OPAQUE_SECRET_TYPE: &str = "Opaque";

/// Memory units accepted by the cluster's quantity syntax
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum MemoryUnit {
    Ki,
    Mi,
    Gi,
    Ti,
    K,
    M,
    G,
    T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
pub enum CpuUnit {
    /// Whole cores
    #[strum(serialize = "cpu")]
    Cpu,
    /// Thousandths of a core
    #[serde(rename = "milicpu")]
    #[strum(serialize = "milicpu")]
    MilliCpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimit {
    pub value: u64,
    pub unit: MemoryUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuLimit {
    pub value: u64,
    pub unit: CpuUnit,
}

impl MemoryLimit {
    pub fn new(value: u64, unit: MemoryUnit) -> Self {
        Self { value, unit }
    }

    /// Quantity string, e.g. `512Mi`
    pub fn render(&self) -> String {
        format!("{}{}", self.value, self.unit)
    }
}

impl CpuLimit {
    pub fn new(value: u64, unit: CpuUnit) -> Self {
        Self { value, unit }
    }

    /// Quantity string: `250m` for milli-cores, a bare number for cores
    pub fn render(&self) -> String {
        match self.unit {
            CpuUnit::MilliCpu => format!("{}m", self.value),
            CpuUnit::Cpu => self.value.to_string(),
        }
    }
}

/// Credentials for one container registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// Labels every owned object carries
pub fn group_labels(group: &str) -> BTreeMap<String, String> {
    [(GROUP_LABEL.to_string(), group.to_string())]
        .into_iter()
        .collect()
}

/// Group label plus the `app` label services select on
pub fn app_labels(name: &str, group: &str) -> BTreeMap<String, String> {
    let mut labels = group_labels(group);
    labels.insert(APP_LABEL.to_string(), name.to_string());
    labels
}

/// True when the object carries exactly this group label value
pub fn is_owned_by(metadata: &ObjectMeta, group: &str) -> bool {
    metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(GROUP_LABEL))
        .map(|value| value == group)
        .unwrap_or(false)
}

fn metadata(name: &str, namespace: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Limits block injected into every container of a deployment.
///
/// Zero-valued limits are left out.
pub fn resource_limits(memory: Option<&MemoryLimit>, cpu: Option<&CpuLimit>) -> ResourceRequirements {
    let mut limits = BTreeMap::new();

    if let Some(memory) = memory.filter(|m| m.value > 0) {
        limits.insert("memory".to_string(), Quantity(memory.render()));
    }
    if let Some(cpu) = cpu.filter(|c| c.value > 0) {
        limits.insert("cpu".to_string(), Quantity(cpu.render()));
    }

    ResourceRequirements {
        limits: Some(limits),
        ..Default::default()
    }
}

/// Deployment with group label and resource limits stamped in
pub fn create_deployment(
    name: &str,
    namespace: &str,
    group: &str,
    mut spec: DeploymentSpec,
    memory: Option<&MemoryLimit>,
    cpu: Option<&CpuLimit>,
) -> Deployment {
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(Default::default)
        .insert(GROUP_LABEL.to_string(), group.to_string());

    let resources = resource_limits(memory, cpu);
    if let Some(pod) = spec.template.spec.as_mut() {
        for container in pod.containers.iter_mut() {
            container.resources = Some(resources.clone());
        }
    }

    Deployment {
        metadata: metadata(name, namespace, app_labels(name, group)),
        spec: Some(spec),
        ..Default::default()
    }
}

pub fn create_daemon_set(name: &str, namespace: &str, group: &str, mut spec: DaemonSetSpec) -> DaemonSet {
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(Default::default)
        .insert(GROUP_LABEL.to_string(), group.to_string());

    DaemonSet {
        metadata: metadata(name, namespace, app_labels(name, group)),
        spec: Some(spec),
        ..Default::default()
    }
}

/// Registry credential secret in `.dockerconfigjson` form
pub fn create_dockercfg_secret(
    name: &str,
    namespace: &str,
    group: &str,
    registries: &BTreeMap<String, RegistryAuth>,
) -> Result<Secret> {
    let auths: serde_json::Map<String, serde_json::Value> = registries
        .iter()
        .map(|(registry, auth)| {
            let token = BASE64.encode(format!("{}:{}", auth.username, auth.password));
            (
                registry.clone(),
                serde_json::json!({
                    "username": auth.username,
                    "password": auth.password,
                    "auth": token,
                }),
            )
        })
        .collect();

    let payload = serde_json::to_vec(&serde_json::json!({ "auths": auths }))?;

    Ok(Secret {
        metadata: metadata(name, namespace, group_labels(group)),
        type_: Some(DOCKERCONFIG_SECRET_TYPE.to_string()),
        data: Some(
            [(DOCKERCONFIG_KEY.to_string(), ByteString(payload))]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    })
}

/// Generic secret; values are plain text
pub fn create_opaque_secret(
    name: &str,
    namespace: &str,
    group: &str,
    values: &BTreeMap<String, String>,
) -> Secret {
    Secret {
        metadata: metadata(name, namespace, group_labels(group)),
        type_: Some(OPAQUE_SECRET_TYPE.to_string()),
        string_data: Some(values.clone()),
        ..Default::default()
    }
}

/// Config map with text entries and base64-encoded binary entries
pub fn create_config_map(
    name: &str,
    namespace: &str,
    group: &str,
    data: Option<&BTreeMap<String, String>>,
    binary_data: Option<&BTreeMap<String, String>>,
) -> Result<ConfigMap> {
    let binary_data = match binary_data {
        Some(entries) => {
            let mut decoded = BTreeMap::new();
            for (key, value) in entries {
                let bytes = BASE64.decode(value.trim()).map_err(|e| {
                    Error::Config(format!("binary config entry '{}' is not base64: {}", key, e))
                })?;
                decoded.insert(key.clone(), ByteString(bytes));
            }
            Some(decoded)
        }
        None => None,
    };

    Ok(ConfigMap {
        metadata: metadata(name, namespace, group_labels(group)),
        data: data.cloned(),
        binary_data,
        ..Default::default()
    })
}

/// ClusterIP service selecting pods by `app=<app_name>`
pub fn create_service(
    name: &str,
    namespace: &str,
    group: &str,
    app_name: &str,
    ports: Vec<ServicePort>,
) -> Service {
    Service {
        metadata: metadata(name, namespace, group_labels(group)),
        spec: Some(ServiceSpec {
            selector: Some(
                [(APP_LABEL.to_string(), app_name.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ingress requesting TLS for every host named in its rules
pub fn create_ingress(
    name: &str,
    namespace: &str,
    group: &str,
    rules: Vec<IngressRule>,
    annotations: Option<BTreeMap<String, String>>,
) -> Ingress {
    let hosts = rules
        .iter()
        .map(|rule| rule.host.clone().unwrap_or_default())
        .collect();

    let mut meta = metadata(name, namespace, group_labels(group));
    meta.annotations = annotations;

    Ingress {
        metadata: meta,
        spec: Some(IngressSpec {
            rules: Some(rules),
            tls: Some(vec![IngressTLS {
                hosts: Some(hosts),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One prefix path routed to a port of a service
pub fn ingress_path(service: &str, path: &str, port: i32) -> HTTPIngressPath {
    HTTPIngressPath {
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: service.to_string(),
                port: Some(ServiceBackendPort {
                    number: Some(port),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        },
        path: Some(path.to_string()),
        path_type: "Prefix".to_string(),
    }
}

pub fn ingress_rule(host: &str, paths: Vec<HTTPIngressPath>) -> IngressRule {
    IngressRule {
        host: Some(host.to_string()),
        http: Some(HTTPIngressRuleValue { paths }),
    }
}

/// Service port forwarding `port` to the same port on the pod
pub fn service_port(name: &str, port: i32, target_port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(
            k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(target_port),
        ),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

    fn two_container_spec() -> DeploymentSpec {
        DeploymentSpec {
            selector: LabelSelector::default(),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![
                        Container {
                            name: "a".to_string(),
                            ..Default::default()
                        },
                        Container {
                            name: "b".to_string(),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_limit_rendering() {
        assert_eq!(MemoryLimit::new(512, MemoryUnit::Mi).render(), "512Mi");
        assert_eq!(CpuLimit::new(250, CpuUnit::MilliCpu).render(), "250m");
        assert_eq!(CpuLimit::new(2, CpuUnit::Cpu).render(), "2");
    }

    #[test]
    fn test_zero_limits_are_omitted() {
        let limits = resource_limits(
            Some(&MemoryLimit::new(0, MemoryUnit::Gi)),
            Some(&CpuLimit::new(500, CpuUnit::MilliCpu)),
        )
        .limits
        .unwrap();

        assert!(!limits.contains_key("memory"));
        assert_eq!(limits.get("cpu"), Some(&Quantity("500m".to_string())));
    }

    #[test]
    fn test_deployment_stamps_labels_and_limits() {
        let deployment = create_deployment(
            "svc1",
            "dssim",
            "run-1",
            two_container_spec(),
            Some(&MemoryLimit::new(512, MemoryUnit::Mi)),
            None,
        );

        let labels = deployment.metadata.labels.unwrap();
        assert_eq!(labels.get(GROUP_LABEL), Some(&"run-1".to_string()));
        assert_eq!(labels.get(APP_LABEL), Some(&"svc1".to_string()));

        let spec = deployment.spec.unwrap();
        let template_labels = spec.template.metadata.unwrap().labels.unwrap();
        assert_eq!(template_labels.get(GROUP_LABEL), Some(&"run-1".to_string()));

        for container in spec.template.spec.unwrap().containers {
            let limits = container.resources.unwrap().limits.unwrap();
            assert_eq!(limits.get("memory"), Some(&Quantity("512Mi".to_string())));
        }
    }

    #[test]
    fn test_ownership() {
        let owned = ObjectMeta {
            labels: Some(group_labels("run-1")),
            ..Default::default()
        };
        let foreign = ObjectMeta {
            labels: Some(group_labels("run-2")),
            ..Default::default()
        };

        assert!(is_owned_by(&owned, "run-1"));
        assert!(!is_owned_by(&foreign, "run-1"));
        assert!(!is_owned_by(&ObjectMeta::default(), "run-1"));
    }

    #[test]
    fn test_dockercfg_secret_payload() {
        let registries: BTreeMap<String, RegistryAuth> = [(
            "registry.example.org".to_string(),
            RegistryAuth {
                username: "bot".to_string(),
                password: "pw".to_string(),
            },
        )]
        .into_iter()
        .collect();

        let secret = create_dockercfg_secret("pull", "dssim", "run-1", &registries).unwrap();
        assert_eq!(secret.type_.as_deref(), Some(DOCKERCONFIG_SECRET_TYPE));

        let data = secret.data.unwrap();
        let payload: serde_json::Value =
            serde_json::from_slice(&data.get(DOCKERCONFIG_KEY).unwrap().0).unwrap();
        assert_eq!(payload["auths"]["registry.example.org"]["username"], "bot");
        assert_eq!(payload["auths"]["registry.example.org"]["auth"], "Ym90OnB3");
    }

    #[test]
    fn test_ingress_requests_tls_for_all_hosts() {
        let ingress = create_ingress(
            "daps",
            "dssim",
            "run-1",
            vec![
                ingress_rule("daps", vec![ingress_path("daps", "/", 4567)]),
                ingress_rule("dapsui", vec![ingress_path("daps", "/", 80)]),
            ],
            None,
        );

        let tls = ingress.spec.unwrap().tls.unwrap();
        assert_eq!(
            tls[0].hosts,
            Some(vec!["daps".to_string(), "dapsui".to_string()])
        );
    }

    #[test]
    fn test_config_map_rejects_invalid_binary() {
        let binary: BTreeMap<String, String> =
            [("keystore".to_string(), "not base64!".to_string())].into_iter().collect();
        let err = create_config_map("cm", "dssim", "run-1", None, Some(&binary)).unwrap_err();
        assert!(err.to_string().contains("keystore"));
    }
}
