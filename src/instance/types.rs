//! Identifying data of an instance

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Registry credentials attached to an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullSecret {
    /// Registry host, e.g. `ghcr.io`
    pub registry: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImage {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<PullSecret>,
}

impl ContainerImage {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
            pull_secret: None,
        }
    }

    pub fn with_pull_secret(mut self, registry: &str, username: &str, password: &str) -> Self {
        self.pull_secret = Some(PullSecret {
            registry: registry.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Secret name derived from the image: alphanumerics only, lower case
    pub fn secret_name(&self) -> String {
        self.image
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect()
    }
}

/// A named HTTP entry point of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub path: String,
    pub port: i32,
}

impl Endpoint {
    pub fn new(name: &str, path: &str, port: i32) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.name, self.path, self.port)
    }
}

/// Parses `name:path:port`
impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("Invalid endpoint '{}', expected name:path:port", s));

        let (name, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (path, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<i32>().map_err(|_| invalid())?;
        if name.is_empty() || !path.starts_with('/') {
            return Err(invalid());
        }
        Ok(Self::new(name, path, port))
    }
}
