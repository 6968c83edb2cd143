//! Cluster control-plane boundary
//!
//! [`ClusterApi`] is the only place the controller talks to the API server.
//! [`KubeCluster`] implements it with kube-rs; tests use an in-memory fake.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, AttachParams, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    discovery::ApiResource,
    Client, Config, Resource,
};
use serde::de::DeserializeOwned;
use strum::{Display, EnumIter};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};

/// A namespaced custom resource type addressed by group/version/plural
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CustomResourceType {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl CustomResourceType {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }

    /// Log routing flows of the logging operator
    pub fn logging_flows() -> Self {
        Self::new("logging.banzaicloud.io", "v1beta1", "Flow", "flows")
    }

    /// Log routing outputs of the logging operator
    pub fn logging_outputs() -> Self {
        Self::new("logging.banzaicloud.io", "v1beta1", "Output", "outputs")
    }

    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

/// Every kind of object the executor creates and therefore sweeps on teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter)]
pub enum ResourceKind {
    Deployment,
    DaemonSet,
    Ingress,
    Service,
    ConfigMap,
    Secret,
    LoggingFlow,
    LoggingOutput,
}

impl ResourceKind {
    pub fn custom_type(&self) -> Option<CustomResourceType> {
        match self {
            ResourceKind::LoggingFlow => Some(CustomResourceType::logging_flows()),
            ResourceKind::LoggingOutput => Some(CustomResourceType::logging_outputs()),
            _ => None,
        }
    }
}

/// Result of a command run inside a container
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub status: Option<Status>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn succeeded(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.status.as_deref())
            .map(|s| s == "Success")
            .unwrap_or(false)
    }

    /// Reason or message reported by the remote side
    pub fn failure_message(&self) -> String {
        self.status
            .as_ref()
            .and_then(|s| s.message.clone().or_else(|| s.reason.clone()))
            .unwrap_or_else(|| "no exit status reported".to_string())
    }
}

/// Operations the executor needs from the cluster, all scoped to one namespace
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment>;
    async fn get_deployment(&self, name: &str) -> Result<Deployment>;
    async fn get_deployment_status(&self, name: &str) -> Result<Deployment>;
    async fn patch_deployment(&self, name: &str, deployment: &Deployment) -> Result<Deployment>;

    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> Result<DaemonSet>;
    async fn get_daemon_set_status(&self, name: &str) -> Result<DaemonSet>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap>;
    async fn create_service(&self, service: &Service) -> Result<Service>;
    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress>;

    async fn create_custom_object(
        &self,
        resource: &CustomResourceType,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;
    async fn list_custom_objects(&self, resource: &CustomResourceType) -> Result<Vec<DynamicObject>>;

    /// Pods matching optional label and field selectors
    async fn list_pods(
        &self,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<Vec<Pod>>;

    /// Run a command in a container and wait for it to exit
    async fn exec(&self, pod: &str, container: &str, command: Vec<String>) -> Result<ExecOutput>;

    /// Metadata of every object of one kind in the namespace
    async fn list_metadata(&self, kind: ResourceKind) -> Result<Vec<ObjectMeta>>;
    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<()>;
}

/// [`ClusterApi`] backed by a kube-rs client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    /// Connect using an explicit kubeconfig file
    #[instrument(skip_all, fields(path = %path))]
    pub async fn from_kubeconfig(path: &str, namespace: &str) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path)
            .map_err(|e| Error::Config(format!("Failed to read kubeconfig {}: {}", path, e)))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::Config(format!("Invalid kubeconfig {}: {}", path, e)))?;
        let client = Client::try_from(config)?;

        info!(namespace, "Connected to Kubernetes cluster");
        Ok(Self::new(client, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn custom_api(&self, resource: &CustomResourceType) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &resource.api_resource())
    }

    async fn list_meta<K>(&self) -> Result<Vec<ObjectMeta>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let list = self.api::<K>().list(&ListParams::default()).await?;
        Ok(list.items.into_iter().map(|o| o.meta().clone()).collect())
    }

    async fn delete_named<K>(&self, name: &str) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>().delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> Result<String> {
    let mut out = String::new();
    if let Some(mut reader) = reader {
        reader
            .read_to_string(&mut out)
            .await
            .map_err(|e| Error::Exec(format!("Failed to read command output: {}", e)))?;
    }
    Ok(out)
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        Ok(self.api::<Deployment>().create(&PostParams::default(), deployment).await?)
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment> {
        Ok(self.api::<Deployment>().get(name).await?)
    }

    async fn get_deployment_status(&self, name: &str) -> Result<Deployment> {
        Ok(self.api::<Deployment>().get_status(name).await?)
    }

    async fn patch_deployment(&self, name: &str, deployment: &Deployment) -> Result<Deployment> {
        Ok(self
            .api::<Deployment>()
            .patch(name, &PatchParams::default(), &Patch::Merge(deployment))
            .await?)
    }

    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> Result<DaemonSet> {
        Ok(self.api::<DaemonSet>().create(&PostParams::default(), daemon_set).await?)
    }

    async fn get_daemon_set_status(&self, name: &str) -> Result<DaemonSet> {
        Ok(self.api::<DaemonSet>().get_status(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        Ok(self.api::<Secret>().create(&PostParams::default(), secret).await?)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        Ok(self.api::<ConfigMap>().create(&PostParams::default(), config_map).await?)
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        Ok(self.api::<Service>().create(&PostParams::default(), service).await?)
    }

    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress> {
        Ok(self.api::<Ingress>().create(&PostParams::default(), ingress).await?)
    }

    async fn create_custom_object(
        &self,
        resource: &CustomResourceType,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        Ok(self
            .custom_api(resource)
            .create(&PostParams::default(), object)
            .await?)
    }

    async fn list_custom_objects(&self, resource: &CustomResourceType) -> Result<Vec<DynamicObject>> {
        Ok(self
            .custom_api(resource)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn list_pods(
        &self,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<Vec<Pod>> {
        let mut params = ListParams::default();
        if let Some(labels) = label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = field_selector {
            params = params.fields(fields);
        }
        Ok(self.api::<Pod>().list(&params).await?.items)
    }

    async fn exec(&self, pod: &str, container: &str, command: Vec<String>) -> Result<ExecOutput> {
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = self.api::<Pod>().exec(pod, command, &params).await?;
        let status = attached.take_status();
        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let (stdout, stderr) = tokio::join!(drain(stdout_reader), drain(stderr_reader));

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| Error::Exec(format!("Command in {}/{} did not finish: {}", pod, container, e)))?;

        debug!(pod, container, ?status, "Command exited");
        Ok(ExecOutput {
            status,
            stdout: stdout?,
            stderr: stderr?,
        })
    }

    async fn list_metadata(&self, kind: ResourceKind) -> Result<Vec<ObjectMeta>> {
        match kind {
            ResourceKind::Deployment => self.list_meta::<Deployment>().await,
            ResourceKind::DaemonSet => self.list_meta::<DaemonSet>().await,
            ResourceKind::Ingress => self.list_meta::<Ingress>().await,
            ResourceKind::Service => self.list_meta::<Service>().await,
            ResourceKind::ConfigMap => self.list_meta::<ConfigMap>().await,
            ResourceKind::Secret => self.list_meta::<Secret>().await,
            ResourceKind::LoggingFlow | ResourceKind::LoggingOutput => {
                let resource = kind
                    .custom_type()
                    .ok_or_else(|| Error::not_found(&format!("custom resource type for {}", kind)))?;
                let items = self.list_custom_objects(&resource).await?;
                Ok(items.into_iter().map(|o| o.metadata).collect())
            }
        }
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<()> {
        match kind {
            ResourceKind::Deployment => self.delete_named::<Deployment>(name).await,
            ResourceKind::DaemonSet => self.delete_named::<DaemonSet>(name).await,
            ResourceKind::Ingress => self.delete_named::<Ingress>(name).await,
            ResourceKind::Service => self.delete_named::<Service>(name).await,
            ResourceKind::ConfigMap => self.delete_named::<ConfigMap>(name).await,
            ResourceKind::Secret => self.delete_named::<Secret>(name).await,
            ResourceKind::LoggingFlow | ResourceKind::LoggingOutput => {
                let resource = kind
                    .custom_type()
                    .ok_or_else(|| Error::not_found(&format!("custom resource type for {}", kind)))?;
                self.custom_api(&resource)
                    .delete(name, &DeleteParams::default())
                    .await?;
                Ok(())
            }
        }
    }
}
