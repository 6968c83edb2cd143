//! Public entry point: validate an instance, run its stages, tear down

use std::collections::HashSet;

use k8s_openapi::api::core::v1::Probe;
use tracing::{info, instrument};

use crate::config::NetworkControlConfig;
use crate::error::{Error, Result};
use crate::instance::{ContainerImage, CustomService, Endpoint, Instance, Stage};
use crate::k8s::{ResourceExecutor, TeardownReport};
use crate::network::NetworkControl;

/// Drives instances through the deployment stages on one executor
pub struct Orchestrator {
    executor: ResourceExecutor,
    network_control: Option<NetworkControl>,
}

impl Orchestrator {
    pub fn new(executor: ResourceExecutor) -> Self {
        Self {
            executor,
            network_control: None,
        }
    }

    /// Install the impairment agent during [`Orchestrator::setup`]
    pub fn with_network_control(mut self, config: NetworkControlConfig) -> Self {
        self.network_control = Some(NetworkControl::new(config));
        self
    }

    pub fn executor(&self) -> &ResourceExecutor {
        &self.executor
    }

    /// Prepare the environment before any instance is deployed
    pub async fn setup(&self) -> Result<()> {
        match &self.network_control {
            Some(network_control) => network_control.deploy(&self.executor).await?,
            None => info!("Network control not configured"),
        }
        info!(
            namespace = self.executor.namespace(),
            group = self.executor.group_label(),
            "Environment set up"
        );
        Ok(())
    }

    /// Run every stage of `instance` in order and hand it back deployed
    #[instrument(skip_all, fields(instance = %instance.name()))]
    pub async fn deploy_instance<I: Instance>(&self, mut instance: I) -> Result<I> {
        validate(&instance)?;
        let executor = &self.executor;

        info!(stage = %Stage::PullSecrets, "Running stage");
        let pull_secrets = instance.deploy_pull_secrets(executor).await?;
        info!(stage = %Stage::Secrets, "Running stage");
        instance.deploy_secrets(executor).await?;
        info!(stage = %Stage::ConfigMaps, "Running stage");
        instance.deploy_config_maps(executor).await?;
        info!(stage = %Stage::App, "Running stage");
        instance.deploy_app(executor, &pull_secrets).await?;
        info!(stage = %Stage::Services, "Running stage");
        instance.deploy_services(executor).await?;
        info!(stage = %Stage::Ingress, "Running stage");
        instance.deploy_ingress(executor).await?;

        info!(hostname = ?instance.base().hostname(), "Instance deployed");
        Ok(instance)
    }

    /// Wrap a single image as a [`CustomService`] and deploy it
    pub async fn deploy_containerized_service(
        &self,
        name: &str,
        image: ContainerImage,
        endpoints: Vec<Endpoint>,
        readiness_probe: Option<Probe>,
    ) -> Result<CustomService> {
        let service = CustomService::new(name, vec![image], endpoints)
            .with_readiness_probes(readiness_probe.into_iter().collect());
        self.deploy_instance(service).await
    }

    /// Delete everything carrying this executor's group label
    pub async fn tear_down(&self) -> TeardownReport {
        self.executor.tear_down().await
    }
}

fn validate<I: Instance>(instance: &I) -> Result<()> {
    let supported = instance.stages();
    let missing: Vec<String> = Stage::all()
        .difference(&supported)
        .map(|s| s.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(Error::Capability {
            instance: instance.name().to_string(),
            missing: missing.join(", "),
        });
    }

    let mut seen = HashSet::new();
    for endpoint in instance.base().endpoints() {
        if !seen.insert(endpoint.name.as_str()) {
            return Err(Error::Config(format!(
                "Endpoint name '{}' used twice in {}",
                endpoint.name,
                instance.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceBase;
    use crate::k8s::testing::{network_config, FakeCluster, StatusRead};
    use crate::k8s::PollConfig;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn orchestrator(cluster: &Arc<FakeCluster>) -> Orchestrator {
        Orchestrator::new(
            ResourceExecutor::new(cluster.clone(), "dssim", "run-1")
                .with_poll_config(PollConfig::immediate()),
        )
    }

    /// Leaves out the ingress stage
    struct Headless {
        base: InstanceBase,
    }

    impl Instance for Headless {
        fn base(&self) -> &InstanceBase {
            &self.base
        }

        fn stages(&self) -> BTreeSet<Stage> {
            let mut stages = Stage::all();
            stages.remove(&Stage::Ingress);
            stages
        }
    }

    #[tokio::test]
    async fn test_containerized_service_end_to_end() {
        let cluster = FakeCluster::new();
        cluster.script_status(vec![StatusRead::Error, StatusRead::Ready(1)]);

        let service = orchestrator(&cluster)
            .deploy_containerized_service(
                "svc1",
                ContainerImage::new("nginx:latest"),
                vec![Endpoint::new("http", "/", 8080)],
                None,
            )
            .await
            .unwrap();

        assert_eq!(
            cluster.calls(),
            vec![
                "create Deployment/svc1",
                "create Service/svc1",
                "create Ingress/svc1",
            ]
        );
        assert!(cluster.secrets().is_empty());
        assert!(cluster.config_maps().is_empty());

        let deployment = &cluster.deployments()[0];
        let containers = &deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].ports.as_ref().unwrap()[0].container_port, 8080);

        let service_spec = cluster.services()[0].spec.clone().unwrap();
        assert_eq!(
            service_spec.selector.unwrap().get("app").map(String::as_str),
            Some("svc1")
        );
        let port = &service_spec.ports.unwrap()[0];
        assert_eq!(port.port, 8080);
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));

        let rule = &cluster.ingresses()[0].spec.clone().unwrap().rules.unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("svc1"));
        let path = &rule.http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/"));
        assert_eq!(
            path.backend.service.as_ref().unwrap().port.as_ref().unwrap().number,
            Some(8080)
        );

        assert_eq!(service.base().hostname(), Some("svc1"));
    }

    #[tokio::test]
    async fn test_pull_secret_precedes_deployment() {
        let cluster = FakeCluster::new();
        let image = ContainerImage::new("ghcr.io/org/app:1").with_pull_secret("ghcr.io", "u", "p");

        orchestrator(&cluster)
            .deploy_containerized_service("app", image, vec![Endpoint::new("http", "/", 80)], None)
            .await
            .unwrap();

        let calls = cluster.calls();
        assert_eq!(calls[0], "create Secret/ghcrioorgapp1");
        assert_eq!(calls[1], "create Deployment/app");

        let pod = cluster.deployments()[0].spec.clone().unwrap().template.spec.unwrap();
        assert_eq!(
            pod.image_pull_secrets.unwrap()[0].name.as_deref(),
            Some("ghcrioorgapp1")
        );
    }

    #[tokio::test]
    async fn test_incomplete_instance_rejected() {
        let cluster = FakeCluster::new();
        let instance = Headless {
            base: InstanceBase::new("headless", vec![ContainerImage::new("busybox")], vec![]),
        };

        let err = orchestrator(&cluster)
            .deploy_instance(instance)
            .await
            .err()
            .unwrap();

        match err {
            Error::Capability { instance, missing } => {
                assert_eq!(instance, "headless");
                assert_eq!(missing, "ingress");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_endpoint_names_rejected() {
        let cluster = FakeCluster::new();
        let err = orchestrator(&cluster)
            .deploy_containerized_service(
                "svc1",
                ContainerImage::new("nginx"),
                vec![Endpoint::new("http", "/", 8080), Endpoint::new("http", "/alt", 8081)],
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_stage_stops_sequence() {
        let cluster = FakeCluster::new();
        cluster.fail_creates(true);

        let err = orchestrator(&cluster)
            .deploy_containerized_service("svc1", ContainerImage::new("nginx"), vec![], None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Deploy(_)));
        assert_eq!(cluster.calls(), vec!["create Deployment/svc1"]);
    }

    #[tokio::test]
    async fn test_setup_installs_network_control() {
        let cluster = FakeCluster::new();
        orchestrator(&cluster)
            .with_network_control(network_config())
            .setup()
            .await
            .unwrap();

        assert_eq!(cluster.daemon_sets().len(), 1);
        assert_eq!(cluster.daemon_set_reads(), 1);
    }

    #[tokio::test]
    async fn test_setup_without_network_control() {
        let cluster = FakeCluster::new();
        orchestrator(&cluster).setup().await.unwrap();
        assert!(cluster.calls().is_empty());
    }
}
