//! Resource executor
//!
//! The single handle through which every component reaches the cluster. It
//! owns the namespace and the group label, stamps that label onto everything
//! it creates, and sweeps exactly those objects away on teardown.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use k8s_openapi::api::apps::v1::{DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Pod, ServicePort};
use k8s_openapi::api::networking::v1::IngressRule;
use kube::api::DynamicObject;
use strum::IntoEnumIterator;
use tracing::{debug, error, info, instrument, warn};

use super::cluster::{ClusterApi, CustomResourceType, ExecOutput, KubeCluster, ResourceKind};
use super::poll::{poll_until, PollConfig};
use super::resources::{
    self, is_owned_by, CpuLimit, MemoryLimit, RegistryAuth, APP_LABEL, GROUP_LABEL,
};
use crate::config::ClusterConfig;
use crate::error::{Error, Result};

/// Where a pod of a deployment currently runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePlacement {
    pub node_name: String,
    pub pod_name: String,
    /// Short (12 character) runtime container id of the first container
    pub container_id: String,
}

/// One object removed (or not) by the teardown sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub kind: ResourceKind,
    /// `None` when listing the kind failed
    pub name: Option<String>,
    pub error: String,
}

/// Outcome of a label-scoped teardown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub deleted: Vec<(ResourceKind, String)>,
    pub skipped: Vec<(ResourceKind, String)>,
    pub failed: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn merge(&mut self, other: TeardownReport) {
        self.deleted.extend(other.deleted);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
    }
}

/// Strip the runtime scheme (`docker://`, `containerd://`) and shorten to
/// the 12 character id the impairment agent uses.
pub fn short_container_id(raw: &str) -> Option<String> {
    let id = raw.split_once("://").map(|(_, id)| id).unwrap_or(raw);
    let short: String = id.chars().take(12).collect();
    if short.is_empty() {
        None
    } else {
        Some(short)
    }
}

fn placement_of(pod: &Pod) -> Option<NodePlacement> {
    let node_name = pod.spec.as_ref()?.node_name.clone()?;
    let pod_name = pod.metadata.name.clone()?;
    let container_id = pod
        .status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .first()?
        .container_id
        .as_deref()
        .and_then(short_container_id)?;

    Some(NodePlacement {
        node_name,
        pod_name,
        container_id,
    })
}

/// Facade over the cluster control plane for one namespace and one group
#[derive(Clone)]
pub struct ResourceExecutor {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    group_label: String,
    poll: PollConfig,
}

impl ResourceExecutor {
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: &str, group_label: &str) -> Self {
        Self {
            cluster,
            namespace: namespace.to_string(),
            group_label: group_label.to_string(),
            poll: PollConfig::default(),
        }
    }

    /// Connect to the cluster described by `config`
    pub async fn connect(config: &ClusterConfig) -> Result<Self> {
        let cluster = KubeCluster::from_kubeconfig(&config.kubeconfig_path, &config.namespace).await?;
        info!(
            namespace = %config.namespace,
            group = %config.group_label,
            "Resource executor ready"
        );
        Ok(Self::new(
            Arc::new(cluster),
            &config.namespace,
            &config.group_label,
        ))
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn group_label(&self) -> &str {
        &self.group_label
    }

    /// Submit a deployment and wait until at least one replica is ready.
    ///
    /// Only submission failures are errors; read errors while waiting are
    /// logged and polling continues.
    #[instrument(skip(self, spec, memory_limit, cpu_limit))]
    pub async fn deploy_app(
        &self,
        name: &str,
        spec: DeploymentSpec,
        memory_limit: Option<&MemoryLimit>,
        cpu_limit: Option<&CpuLimit>,
    ) -> Result<Deployment> {
        let deployment = resources::create_deployment(
            name,
            &self.namespace,
            &self.group_label,
            spec,
            memory_limit,
            cpu_limit,
        );
        debug!(
            memory = ?memory_limit.map(|m| m.render()),
            cpu = ?cpu_limit.map(|c| c.render()),
            "Deploying with resource limits"
        );

        let created = match self.cluster.create_deployment(&deployment).await {
            Ok(created) => created,
            Err(e) => {
                error!(error = %e, "Failed to create deployment");
                return Err(Error::Deploy(format!(
                    "Starting {} failed! Check logs..",
                    name
                )));
            }
        };
        info!("Successfully spawned, waiting for startup");

        self.wait_for_deployment_ready(name).await?;
        info!("Deployment ready");
        Ok(created)
    }

    /// Poll until the deployment reports `readyReplicas > 0`
    pub async fn wait_for_deployment_ready(&self, name: &str) -> Result<()> {
        let cluster = self.cluster.clone();
        poll_until(&self.poll, &format!("deployment {}", name), || {
            let cluster = cluster.clone();
            let name = name.to_string();
            async move {
                let deployment = cluster.get_deployment_status(&name).await?;
                let ready = deployment
                    .status
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or(0);
                Ok(ready > 0)
            }
        })
        .await?;
        Ok(())
    }

    /// Create a registry credential secret. "Already exists" counts as success.
    #[instrument(skip(self, registries))]
    pub async fn deploy_dockercfg_secret(
        &self,
        name: &str,
        registries: &BTreeMap<String, RegistryAuth>,
    ) -> Result<()> {
        let secret =
            resources::create_dockercfg_secret(name, &self.namespace, &self.group_label, registries)?;

        match self.cluster.create_secret(&secret).await {
            Ok(_) => {
                info!("Created pull secret");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                info!("Pull secret already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Create an opaque secret from plain text values
    #[instrument(skip(self, values))]
    pub async fn deploy_opaque_secret(
        &self,
        name: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<()> {
        let secret =
            resources::create_opaque_secret(name, &self.namespace, &self.group_label, values);
        self.cluster.create_secret(&secret).await?;
        info!("Created secret");
        Ok(())
    }

    /// Create a config map. Binary entries are passed base64 encoded.
    #[instrument(skip(self, data, binary_data))]
    pub async fn deploy_config_map(
        &self,
        name: &str,
        data: Option<&BTreeMap<String, String>>,
        binary_data: Option<&BTreeMap<String, String>>,
    ) -> Result<()> {
        let config_map = resources::create_config_map(
            name,
            &self.namespace,
            &self.group_label,
            data,
            binary_data,
        )?;

        if let Err(e) = self.cluster.create_config_map(&config_map).await {
            error!(error = %e, "Failed to create config map");
            return Err(Error::deploy("Deploying config map failed! Check logs.."));
        }
        info!("Created config map");
        Ok(())
    }

    /// Create a service selecting pods labelled `app=<app_name>`
    #[instrument(skip(self, ports))]
    pub async fn deploy_service(&self, name: &str, app_name: &str, ports: Vec<ServicePort>) -> Result<()> {
        let service =
            resources::create_service(name, &self.namespace, &self.group_label, app_name, ports);

        if let Err(e) = self.cluster.create_service(&service).await {
            error!(error = %e, "Failed to create service");
            return Err(Error::Deploy(format!(
                "Deploying service {} failed! Check logs..",
                name
            )));
        }
        info!("Configured service");
        Ok(())
    }

    /// Create an ingress; TLS is requested for every host in `rules`
    #[instrument(skip(self, rules, annotations))]
    pub async fn deploy_ingress(
        &self,
        name: &str,
        rules: Vec<IngressRule>,
        annotations: Option<BTreeMap<String, String>>,
    ) -> Result<()> {
        let ingress =
            resources::create_ingress(name, &self.namespace, &self.group_label, rules, annotations);

        if let Err(e) = self.cluster.create_ingress(&ingress).await {
            error!(error = %e, "Failed to create ingress");
            return Err(Error::Deploy(format!(
                "Deploying ingress {} failed! Check logs..",
                name
            )));
        }
        info!("Configured ingress");
        Ok(())
    }

    /// Create a daemon set and wait until every scheduled node reports ready
    #[instrument(skip(self, spec))]
    pub async fn deploy_daemon_set(&self, name: &str, spec: DaemonSetSpec) -> Result<()> {
        let daemon_set =
            resources::create_daemon_set(name, &self.namespace, &self.group_label, spec);

        if let Err(e) = self.cluster.create_daemon_set(&daemon_set).await {
            error!(error = %e, "Failed to create daemon set");
            return Err(Error::Deploy(format!(
                "Starting daemon set {} failed! Check logs..",
                name
            )));
        }

        info!("Waiting for daemon set to come up on all nodes");
        self.wait_for_daemon_set_ready(name).await
    }

    /// Poll until `numberReady == desiredNumberScheduled` (and at least one)
    pub async fn wait_for_daemon_set_ready(&self, name: &str) -> Result<()> {
        let cluster = self.cluster.clone();
        poll_until(&self.poll, &format!("daemon set {}", name), || {
            let cluster = cluster.clone();
            let name = name.to_string();
            async move {
                let daemon_set = cluster.get_daemon_set_status(&name).await?;
                Ok(daemon_set
                    .status
                    .map(|s| s.number_ready > 0 && s.number_ready == s.desired_number_scheduled)
                    .unwrap_or(false))
            }
        })
        .await?;
        Ok(())
    }

    pub async fn get_deployment(&self, name: &str) -> Result<Deployment> {
        self.cluster.get_deployment(name).await
    }

    pub async fn get_deployment_status(&self, name: &str) -> Result<Deployment> {
        self.cluster.get_deployment_status(name).await
    }

    #[instrument(skip(self, deployment))]
    pub async fn patch_deployment(&self, name: &str, deployment: &Deployment) -> Result<Deployment> {
        let patched = self.cluster.patch_deployment(name, deployment).await?;
        info!("Patched deployment");
        Ok(patched)
    }

    /// Current placement of every running pod of a deployment
    #[instrument(skip(self))]
    pub async fn get_node_info_of_deployment(&self, name: &str) -> Result<Vec<NodePlacement>> {
        let selector = format!("{}={}", APP_LABEL, name);
        let pods = self.cluster.list_pods(Some(&selector), None).await?;

        let placements: Vec<NodePlacement> = pods
            .iter()
            .filter_map(|pod| {
                let placement = placement_of(pod);
                if placement.is_none() {
                    debug!(pod = ?pod.metadata.name, "Pod has no node or container id yet");
                }
                placement
            })
            .collect();

        if placements.is_empty() {
            return Err(Error::NotFound(format!(
                "Node name or container id not found for deployment {}",
                name
            )));
        }
        Ok(placements)
    }

    /// Name of the pod labelled `name=<app_label>` scheduled on `node`
    #[instrument(skip(self))]
    pub async fn get_pod_name_of_deployment_on_node(&self, node: &str, app_label: &str) -> Result<String> {
        let field_selector = format!("spec.nodeName={}", node);
        let pods = self.cluster.list_pods(None, Some(&field_selector)).await?;

        pods.into_iter()
            .filter(|pod| {
                pod.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get("name"))
                    .map(|v| v == app_label)
                    .unwrap_or(false)
            })
            .find_map(|pod| pod.metadata.name)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "App not found on Node. Was looking for {} on {}.",
                    app_label, node
                ))
            })
    }

    /// Run a command in a container and wait for it to exit
    #[instrument(skip(self))]
    pub async fn exec(&self, pod: &str, container: &str, command: Vec<String>) -> Result<ExecOutput> {
        info!("Executing command");
        let output = self.cluster.exec(pod, container, command).await?;

        if !output.succeeded() {
            warn!(stderr = %output.stderr, "Command failed");
            return Err(Error::Exec(format!(
                "{} in {}/{}",
                output.failure_message(),
                pod,
                container
            )));
        }
        debug!(stdout = %output.stdout, "Command succeeded");
        Ok(output)
    }

    /// Create a custom object, stamping namespace and group label
    #[instrument(skip(self, body), fields(kind = %resource.kind))]
    pub async fn deploy_custom_object(
        &self,
        resource: &CustomResourceType,
        mut body: DynamicObject,
    ) -> Result<DynamicObject> {
        body.metadata.namespace = Some(self.namespace.clone());
        body.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(GROUP_LABEL.to_string(), self.group_label.clone());

        let created = self.cluster.create_custom_object(resource, &body).await?;
        info!(name = ?created.metadata.name, "Created custom object");
        Ok(created)
    }

    pub async fn list_custom_objects(&self, resource: &CustomResourceType) -> Result<Vec<DynamicObject>> {
        self.cluster.list_custom_objects(resource).await
    }

    /// Delete every object carrying this executor's group label.
    ///
    /// Best effort: each kind and each object is handled independently and
    /// failures are collected in the report instead of aborting the sweep.
    #[instrument(skip(self), fields(group = %self.group_label))]
    pub async fn tear_down(&self) -> TeardownReport {
        info!("Starting teardown");

        let sweeps = ResourceKind::iter().map(|kind| self.sweep(kind));
        let mut report = TeardownReport::default();
        for outcome in join_all(sweeps).await {
            report.merge(outcome);
        }

        if report.is_clean() {
            info!(deleted = report.deleted.len(), "Teardown finished");
        } else {
            warn!(
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "Teardown finished with errors"
            );
        }
        report
    }

    async fn sweep(&self, kind: ResourceKind) -> TeardownReport {
        let mut report = TeardownReport::default();

        let items = match self.cluster.list_metadata(kind).await {
            Ok(items) => items,
            Err(e) if e.is_not_found() => {
                debug!(%kind, "Kind not served by this cluster, nothing to tear down");
                return report;
            }
            Err(e) => {
                warn!(%kind, error = %e, "Failed to list resources for teardown");
                report.failed.push(TeardownFailure {
                    kind,
                    name: None,
                    error: e.to_string(),
                });
                return report;
            }
        };

        let mut owned = Vec::new();
        for meta in items {
            let Some(name) = meta.name.clone() else {
                continue;
            };
            if is_owned_by(&meta, &self.group_label) {
                owned.push(name);
            } else {
                debug!(%kind, name, "Leave alone");
                report.skipped.push((kind, name));
            }
        }

        let deletions = owned.into_iter().map(|name| async move {
            let outcome = self.cluster.delete(kind, &name).await;
            (name, outcome)
        });

        for (name, outcome) in join_all(deletions).await {
            match outcome {
                Ok(()) => {
                    info!(%kind, name, "Tore down");
                    report.deleted.push((kind, name));
                }
                Err(e) => {
                    warn!(%kind, name, error = %e, "Failed to delete");
                    report.failed.push(TeardownFailure {
                        kind,
                        name: Some(name),
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }
}
