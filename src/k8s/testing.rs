//! In-memory cluster used by unit tests

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetStatus, Deployment, DeploymentSpec, DeploymentStatus,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, ContainerStatus, Pod, PodSpec, PodStatus,
    PodTemplateSpec, Secret, Service,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, Status};
use kube::api::DynamicObject;
use serde::de::DeserializeOwned;
use serde::Serialize;
use strum::IntoEnumIterator;

use super::cluster::{ClusterApi, CustomResourceType, ExecOutput, ResourceKind};
use crate::config::NetworkControlConfig;
use crate::error::{api_error, Error, Result};

/// Scripted answer to a deployment status read
#[derive(Debug, Clone, Copy)]
pub enum StatusRead {
    Error,
    Ready(i32),
}

#[derive(Debug, Clone)]
struct Stored {
    meta: ObjectMeta,
    body: serde_json::Value,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceKind, Vec<Stored>>,
    pods: Vec<Pod>,
    status_script: VecDeque<StatusRead>,
    status_reads: usize,
    daemon_set_script: VecDeque<(i32, i32)>,
    daemon_set_reads: usize,
    fail_creates: bool,
    fail_deletes: HashSet<(ResourceKind, String)>,
    fail_lists: HashMap<ResourceKind, u16>,
    fail_execs: bool,
    exec_calls: Vec<(String, String, Vec<String>)>,
    calls: Vec<String>,
}

/// Fake [`ClusterApi`] recording everything it is asked to do
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn script_status(&self, reads: Vec<StatusRead>) {
        self.state().status_script = reads.into();
    }

    pub fn status_reads(&self) -> usize {
        self.state().status_reads
    }

    /// `(desired, ready)` pairs returned by successive daemon set reads
    pub fn script_daemon_set(&self, reads: Vec<(i32, i32)>) {
        self.state().daemon_set_script = reads.into();
    }

    pub fn daemon_set_reads(&self) -> usize {
        self.state().daemon_set_reads
    }

    pub fn fail_creates(&self, fail: bool) {
        self.state().fail_creates = fail;
    }

    pub fn fail_delete(&self, kind: ResourceKind, name: &str) {
        self.state().fail_deletes.insert((kind, name.to_string()));
    }

    pub fn fail_list(&self, kind: ResourceKind) {
        self.state().fail_lists.insert(kind, 403);
    }

    /// Every exec terminates with a non-zero exit code
    pub fn fail_execs(&self) {
        self.state().fail_execs = true;
    }

    /// Listing `kind` answers 404, as for a CRD that is not installed
    pub fn uninstall_kind(&self, kind: ResourceKind) {
        self.state().fail_lists.insert(kind, 404);
    }

    /// Pre-existing object, optionally carrying a group label
    pub fn seed(&self, kind: ResourceKind, name: &str, group: Option<&str>) {
        let meta = ObjectMeta {
            name: Some(name.to_string()),
            labels: group.map(|g| [("group".to_string(), g.to_string())].into_iter().collect()),
            ..Default::default()
        };
        let body = serde_json::json!({ "metadata": meta });
        self.state()
            .objects
            .entry(kind)
            .or_default()
            .push(Stored { meta, body });
    }

    pub fn add_pod(&self, name: &str, labels: &[(&str, &str)], node: &str, container_id: Option<&str>) {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..Default::default()
            }),
            status: container_id.map(|id| PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    container_id: Some(id.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        };
        self.state().pods.push(pod);
    }

    pub fn names(&self, kind: ResourceKind) -> Vec<String> {
        self.state()
            .objects
            .get(&kind)
            .map(|items| items.iter().filter_map(|s| s.meta.name.clone()).collect())
            .unwrap_or_default()
    }

    fn typed<K: DeserializeOwned>(&self, kind: ResourceKind) -> Vec<K> {
        self.state()
            .objects
            .get(&kind)
            .map(|items| {
                items
                    .iter()
                    .map(|s| serde_json::from_value(s.body.clone()).unwrap())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn deployments(&self) -> Vec<Deployment> {
        self.typed(ResourceKind::Deployment)
    }

    pub fn daemon_sets(&self) -> Vec<DaemonSet> {
        self.typed(ResourceKind::DaemonSet)
    }

    pub fn secrets(&self) -> Vec<Secret> {
        self.typed(ResourceKind::Secret)
    }

    pub fn config_maps(&self) -> Vec<ConfigMap> {
        self.typed(ResourceKind::ConfigMap)
    }

    pub fn services(&self) -> Vec<Service> {
        self.typed(ResourceKind::Service)
    }

    pub fn ingresses(&self) -> Vec<Ingress> {
        self.typed(ResourceKind::Ingress)
    }

    pub fn exec_calls(&self) -> Vec<(String, String, Vec<String>)> {
        self.state().exec_calls.clone()
    }

    /// Ordered log of create calls, e.g. `create Service/svc1`
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn store<K: Serialize>(&self, kind: ResourceKind, meta: &ObjectMeta, object: &K) -> Result<()> {
        let mut state = self.state();
        let name = meta.name.clone().unwrap_or_default();
        state.calls.push(format!("create {}/{}", kind, name));

        if state.fail_creates {
            return Err(api_error(500, "InternalError"));
        }

        let items = state.objects.entry(kind).or_default();
        if items.iter().any(|s| s.meta.name.as_deref() == Some(name.as_str())) {
            return Err(api_error(409, "AlreadyExists"));
        }
        items.push(Stored {
            meta: meta.clone(),
            body: serde_json::to_value(object)?,
        });
        Ok(())
    }

    fn find<K: DeserializeOwned>(&self, kind: ResourceKind, name: &str) -> Result<K> {
        let state = self.state();
        let stored = state
            .objects
            .get(&kind)
            .and_then(|items| items.iter().find(|s| s.meta.name.as_deref() == Some(name)))
            .ok_or_else(|| api_error(404, "NotFound"))?;
        Ok(serde_json::from_value(stored.body.clone())?)
    }

    fn custom_kind(resource: &CustomResourceType) -> Result<ResourceKind> {
        ResourceKind::iter()
            .find(|k| k.custom_type().as_ref() == Some(resource))
            .ok_or_else(|| Error::not_found(&format!("custom resource {}", resource.plural)))
    }
}

fn selector_matches(selector: Option<&str>, actual: impl Fn(&str) -> Option<String>) -> bool {
    match selector.and_then(|s| s.split_once('=')) {
        Some((key, value)) => actual(key).as_deref() == Some(value),
        None => true,
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        self.store(ResourceKind::Deployment, &deployment.metadata, deployment)?;
        Ok(deployment.clone())
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment> {
        self.find(ResourceKind::Deployment, name)
    }

    async fn get_deployment_status(&self, name: &str) -> Result<Deployment> {
        let next = {
            let mut state = self.state();
            state.status_reads += 1;
            state.status_script.pop_front().unwrap_or(StatusRead::Ready(1))
        };

        let mut deployment: Deployment = self.find(ResourceKind::Deployment, name)?;
        match next {
            StatusRead::Error => Err(api_error(503, "ServiceUnavailable")),
            StatusRead::Ready(ready) => {
                deployment.status = Some(DeploymentStatus {
                    ready_replicas: Some(ready),
                    ..Default::default()
                });
                Ok(deployment)
            }
        }
    }

    async fn patch_deployment(&self, name: &str, deployment: &Deployment) -> Result<Deployment> {
        let mut state = self.state();
        let stored = state
            .objects
            .get_mut(&ResourceKind::Deployment)
            .and_then(|items| items.iter_mut().find(|s| s.meta.name.as_deref() == Some(name)))
            .ok_or_else(|| api_error(404, "NotFound"))?;

        let mut current: Deployment = serde_json::from_value(stored.body.clone())?;
        if deployment.spec.is_some() {
            current.spec = deployment.spec.clone();
        }
        stored.body = serde_json::to_value(&current)?;
        Ok(current)
    }

    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> Result<DaemonSet> {
        self.store(ResourceKind::DaemonSet, &daemon_set.metadata, daemon_set)?;
        Ok(daemon_set.clone())
    }

    async fn get_daemon_set_status(&self, name: &str) -> Result<DaemonSet> {
        let (desired, ready) = {
            let mut state = self.state();
            state.daemon_set_reads += 1;
            state.daemon_set_script.pop_front().unwrap_or((1, 1))
        };

        let mut daemon_set: DaemonSet = self.find(ResourceKind::DaemonSet, name)?;
        daemon_set.status = Some(DaemonSetStatus {
            desired_number_scheduled: desired,
            number_ready: ready,
            ..Default::default()
        });
        Ok(daemon_set)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        self.store(ResourceKind::Secret, &secret.metadata, secret)?;
        Ok(secret.clone())
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        self.store(ResourceKind::ConfigMap, &config_map.metadata, config_map)?;
        Ok(config_map.clone())
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        self.store(ResourceKind::Service, &service.metadata, service)?;
        Ok(service.clone())
    }

    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress> {
        self.store(ResourceKind::Ingress, &ingress.metadata, ingress)?;
        Ok(ingress.clone())
    }

    async fn create_custom_object(
        &self,
        resource: &CustomResourceType,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let kind = Self::custom_kind(resource)?;
        self.store(kind, &object.metadata, object)?;
        Ok(object.clone())
    }

    async fn list_custom_objects(&self, resource: &CustomResourceType) -> Result<Vec<DynamicObject>> {
        let kind = Self::custom_kind(resource)?;
        Ok(self.typed(kind))
    }

    async fn list_pods(
        &self,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<Vec<Pod>> {
        let state = self.state();
        Ok(state
            .pods
            .iter()
            .filter(|pod| {
                selector_matches(label_selector, |key| {
                    pod.metadata.labels.as_ref().and_then(|l| l.get(key).cloned())
                }) && selector_matches(field_selector, |key| match key {
                    "spec.nodeName" => pod.spec.as_ref().and_then(|s| s.node_name.clone()),
                    _ => None,
                })
            })
            .cloned()
            .collect())
    }

    async fn exec(&self, pod: &str, container: &str, command: Vec<String>) -> Result<ExecOutput> {
        let mut state = self.state();
        state
            .exec_calls
            .push((pod.to_string(), container.to_string(), command));

        if state.fail_execs {
            return Ok(ExecOutput {
                status: Some(Status {
                    status: Some("Failure".to_string()),
                    reason: Some("NonZeroExitCode".to_string()),
                    message: Some("command terminated with non-zero exit code: 22".to_string()),
                    ..Default::default()
                }),
                stdout: String::new(),
                stderr: "curl: (22) The requested URL returned error: 400".to_string(),
            });
        }

        Ok(ExecOutput {
            status: Some(Status {
                status: Some("Success".to_string()),
                ..Default::default()
            }),
            stdout: "OK".to_string(),
            stderr: String::new(),
        })
    }

    async fn list_metadata(&self, kind: ResourceKind) -> Result<Vec<ObjectMeta>> {
        let state = self.state();
        match state.fail_lists.get(&kind) {
            Some(404) => return Err(api_error(404, "NotFound")),
            Some(&code) => return Err(api_error(code, "Forbidden")),
            None => {}
        }
        Ok(state
            .objects
            .get(&kind)
            .map(|items| items.iter().map(|s| s.meta.clone()).collect())
            .unwrap_or_default())
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_deletes.contains(&(kind, name.to_string())) {
            return Err(api_error(500, "InternalError"));
        }
        let items = state.objects.entry(kind).or_default();
        let before = items.len();
        items.retain(|s| s.meta.name.as_deref() != Some(name));
        if items.len() == before {
            return Err(api_error(404, "NotFound"));
        }
        Ok(())
    }
}

/// Minimal single-container deployment spec
pub fn deployment_spec(name: &str, ports: &[i32]) -> DeploymentSpec {
    DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some([("app".to_string(), name.to_string())].into_iter().collect()),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some([("app".to_string(), name.to_string())].into_iter().collect()),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: name.to_string(),
                    image: Some("nginx:latest".to_string()),
                    ports: Some(
                        ports
                            .iter()
                            .map(|p| ContainerPort {
                                container_port: *p,
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        ..Default::default()
    }
}

pub fn network_config() -> NetworkControlConfig {
    NetworkControlConfig {
        interface_prefix: "veth".to_string(),
        image: "registry.example.org/dssim/network-control:latest".to_string(),
        image_registry: "registry.example.org".to_string(),
        image_pull_username: "bot".to_string(),
        image_pull_password: "s3cret".to_string(),
    }
}
