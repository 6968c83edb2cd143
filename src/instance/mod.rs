//! Deployable application instances
//!
//! Every instance is deployed through the same six stages, in order:
//! pull secrets, secrets, config maps, app, services, ingress. Variants
//! override the stages their topology needs and delegate the rest to
//! [`InstanceBase`].

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use strum::{Display, EnumIter, IntoEnumIterator};

use crate::error::Result;
use crate::k8s::ResourceExecutor;
use crate::network::{self, NetworkConditions};

mod base;
mod broker;
mod connector;
mod custom;
mod daps;
mod edc;
mod types;

pub use base::{image_pull_secret_for, image_pull_secrets, InstanceBase};
pub use broker::BrokerInstance;
pub use connector::ConnectorInstance;
pub use custom::CustomService;
pub use daps::DapsInstance;
pub use edc::{ConfigFileGenerator, EdcInstance};
pub use types::{ContainerImage, Endpoint, PullSecret};

/// Registry host -> name of its registry credential secret
pub type PullSecrets = BTreeMap<String, String>;

/// Deployment stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    PullSecrets,
    Secrets,
    ConfigMaps,
    App,
    Services,
    Ingress,
}

impl Stage {
    pub fn all() -> BTreeSet<Stage> {
        Stage::iter().collect()
    }
}

#[async_trait]
pub trait Instance: Send + Sync {
    fn base(&self) -> &InstanceBase;

    /// Stages this instance implements. Only instances supporting all of
    /// them can be deployed.
    fn stages(&self) -> BTreeSet<Stage> {
        Stage::all()
    }

    fn name(&self) -> &str {
        self.base().name()
    }

    async fn deploy_pull_secrets(&self, executor: &ResourceExecutor) -> Result<PullSecrets> {
        self.base().deploy_pull_secrets(executor).await
    }

    async fn deploy_secrets(&self, _executor: &ResourceExecutor) -> Result<()> {
        Ok(())
    }

    async fn deploy_config_maps(&self, _executor: &ResourceExecutor) -> Result<()> {
        Ok(())
    }

    async fn deploy_app(&self, _executor: &ResourceExecutor, _pull_secrets: &PullSecrets) -> Result<()> {
        Ok(())
    }

    async fn deploy_services(&self, executor: &ResourceExecutor) -> Result<()> {
        self.base().deploy_services(executor).await
    }

    /// Expose the endpoints and record the published URLs
    async fn deploy_ingress(&mut self, executor: &ResourceExecutor) -> Result<()> {
        self.base().deploy_ingress(executor, None).await
    }

    /// Apply `conditions`, or clear every impairment when none is set
    async fn set_network_control(
        &self,
        executor: &ResourceExecutor,
        conditions: &NetworkConditions,
    ) -> Result<()> {
        network::set_network_control(executor, self.name(), conditions).await
    }

    async fn clear_all_network_limitations(&self, executor: &ResourceExecutor) -> Result<()> {
        network::clear_all_network_limitations(executor, self.name()).await
    }
}
