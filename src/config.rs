//! Environment-sourced configuration
//!
//! Every value is read once at startup. A missing required key is a fatal
//! configuration error, never something to retry.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Cluster access settings for the resource executor
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    pub kubeconfig_path: String,
    pub namespace: String,
    pub group_label: String,
}

/// Settings for the per-node traffic shaping agent
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkControlConfig {
    /// Host interface prefix the agent shapes (e.g. `veth`, `cali`)
    pub interface_prefix: String,
    pub image: String,
    pub image_registry: String,
    pub image_pull_username: String,
    pub image_pull_password: String,
}

/// Key material for the token issuer
#[derive(Debug, Clone, PartialEq)]
pub struct DapsConfig {
    pub signing_key: String,
    pub connector_cert: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawClusterConfig {
    kubeconfig_path: Option<String>,
    namespace: Option<String>,
    grouplabel: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawNetworkControlConfig {
    ifprefix: Option<String>,
    image: Option<String>,
    image_hostname: Option<String>,
    image_pull_username: Option<String>,
    image_pull_password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDapsConfig {
    omejdnkey: Option<String>,
    connectorcert: Option<String>,
}

/// Load a `.env` file if one exists. Safe to call more than once.
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn read<T: for<'de> Deserialize<'de>>(
    prefix: Option<&str>,
    vars: Option<HashMap<String, String>>,
) -> Result<T> {
    let env = match prefix {
        Some(prefix) => config::Environment::with_prefix(prefix),
        None => config::Environment::default(),
    };

    let settings = config::Config::builder()
        .add_source(env.source(vars))
        .build()?;

    Ok(settings.try_deserialize()?)
}

fn require(value: Option<String>, var: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::Config(format!(
            "{} Environment Variable not set.",
            var
        ))),
    }
}

impl ClusterConfig {
    pub fn from_env() -> Result<Self> {
        load_dotenv();
        Self::from_vars(None)
    }

    /// Build from an explicit variable map instead of the process environment
    pub fn from_vars(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let raw: RawClusterConfig = read(Some("K8S"), vars)?;

        Ok(Self {
            kubeconfig_path: require(raw.kubeconfig_path, "K8S_KUBECONFIG_PATH")?,
            namespace: require(raw.namespace, "K8S_NAMESPACE")?,
            group_label: require(raw.grouplabel, "K8S_GROUPLABEL")?,
        })
    }
}

impl NetworkControlConfig {
    pub fn from_env() -> Result<Self> {
        load_dotenv();
        Self::from_vars(None)
    }

    pub fn from_vars(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let raw: RawNetworkControlConfig = read(Some("K8S_NETCONTROL"), vars)?;

        let interface_prefix = raw.ifprefix.filter(|v| !v.trim().is_empty()).ok_or_else(|| {
            Error::config(
                "Environment Variable K8S_NETCONTROL_IFPREFIX not set for network control. Cannot deploy Network Control.",
            )
        })?;

        Ok(Self {
            interface_prefix,
            image: require(raw.image, "K8S_NETCONTROL_IMAGE")?,
            image_registry: require(raw.image_hostname, "K8S_NETCONTROL_IMAGE_HOSTNAME")?,
            image_pull_username: require(
                raw.image_pull_username,
                "K8S_NETCONTROL_IMAGE_PULL_USERNAME",
            )?,
            image_pull_password: require(
                raw.image_pull_password,
                "K8S_NETCONTROL_IMAGE_PULL_PASSWORD",
            )?,
        })
    }
}

impl DapsConfig {
    pub fn from_env() -> Result<Self> {
        load_dotenv();
        Self::from_vars(None)
    }

    pub fn from_vars(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let raw: RawDapsConfig = read(None, vars)?;

        if raw.omejdnkey.is_none() || raw.connectorcert.is_none() {
            return Err(Error::config("Environment variables for Daps are not set."));
        }

        Ok(Self {
            signing_key: require(raw.omejdnkey, "OMEJDNKEY")?,
            connector_cert: require(raw.connectorcert, "CONNECTORCERT")?,
        })
    }
}
