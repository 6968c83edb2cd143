//! Traffic shaping parameters

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::error::{Error, Result};

/// Rate units understood by the impairment agent
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BandwidthUnit {
    Bit,
    Kbit,
    Mbit,
    Gbit,
    Bps,
    Kbps,
    Mbps,
    Gbps,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TimeUnit {
    Us,
    Ms,
    S,
}

/// Bandwidth cap, e.g. `10mbit`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bandwidth {
    pub value: u64,
    pub unit: BandwidthUnit,
}

/// Added latency, e.g. `100ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delay {
    pub value: u64,
    pub unit: TimeUnit,
}

impl Bandwidth {
    pub fn new(value: u64, unit: BandwidthUnit) -> Self {
        Self { value, unit }
    }
}

impl Delay {
    pub fn new(value: u64, unit: TimeUnit) -> Self {
        Self { value, unit }
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit)
    }
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit)
    }
}

/// Split `"100ms"` into `(100, "ms")`
fn split_quantity(s: &str) -> Result<(u64, &str)> {
    let s = s.trim();
    let digits = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (value, unit) = s.split_at(digits);
    let value = value
        .parse::<u64>()
        .map_err(|_| Error::Config(format!("Invalid quantity '{}'", s)))?;
    Ok((value, unit))
}

impl FromStr for Bandwidth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (value, unit) = split_quantity(s)?;
        let unit = unit
            .parse()
            .map_err(|_| Error::Config(format!("Unknown bandwidth unit in '{}'", s)))?;
        Ok(Self { value, unit })
    }
}

impl FromStr for Delay {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (value, unit) = split_quantity(s)?;
        let unit = unit
            .parse()
            .map_err(|_| Error::Config(format!("Unknown time unit in '{}'", s)))?;
        Ok(Self { value, unit })
    }
}

/// Impairment requested for one instance. Rates are percentages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<Bandwidth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<Delay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corruption_rate: Option<f64>,
}

impl NetworkConditions {
    /// True when no field asks for any impairment; zero counts as absent
    pub fn is_clear(&self) -> bool {
        self.bandwidth.filter(|b| b.value > 0).is_none()
            && self.delay.filter(|d| d.value > 0).is_none()
            && positive(self.loss_rate).is_none()
            && positive(self.duplicate_rate).is_none()
            && positive(self.corruption_rate).is_none()
    }
}

pub(crate) fn positive(rate: Option<f64>) -> Option<f64> {
    rate.filter(|r| *r > 0.0)
}
