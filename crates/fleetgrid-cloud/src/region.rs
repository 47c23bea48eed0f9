//! Region naming and operating-system billing names.

use serde::{Deserialize, Serialize};

use fleetgrid_state::Distro;

use crate::error::{CloudError, CloudResult};

/// Operating system family, as far as pricing is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsType {
    Linux,
    Windows,
}

impl OsType {
    /// Derived from a distro architecture string such as `windows_amd64`.
    pub fn from_arch(arch: &str) -> Self {
        if arch.contains("windows") {
            OsType::Windows
        } else {
            OsType::Linux
        }
    }

    pub fn for_distro(distro: &Distro) -> Self {
        Self::from_arch(&distro.arch)
    }

    /// `operatingSystem` attribute used by the on-demand catalog.
    pub fn billing_name(&self) -> &'static str {
        match self {
            OsType::Linux => "Linux",
            OsType::Windows => "Windows",
        }
    }

    /// Product description used by spot price history.
    pub fn spot_product(&self, vpc: bool) -> String {
        let base = match self {
            OsType::Linux => "Linux/UNIX",
            OsType::Windows => "Windows",
        };
        if vpc {
            format!("{base} (Amazon VPC)")
        } else {
            base.to_string()
        }
    }
}

impl std::str::FromStr for OsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(OsType::Linux),
            "windows" => Ok(OsType::Windows),
            other => Err(format!("unknown os {other:?}, expected linux or windows")),
        }
    }
}

/// A region is its availability zone minus the trailing zone letter.
pub fn az_to_region(zone: &str) -> &str {
    match zone.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => &zone[..zone.len() - 1],
        _ => zone,
    }
}

const REGION_NAMES: &[(&str, &str)] = &[
    ("us-east-1", "US East (N. Virginia)"),
    ("us-east-2", "US East (Ohio)"),
    ("us-west-1", "US West (N. California)"),
    ("us-west-2", "US West (Oregon)"),
    ("ca-central-1", "Canada (Central)"),
    ("eu-west-1", "EU (Ireland)"),
    ("eu-west-2", "EU (London)"),
    ("eu-central-1", "EU (Frankfurt)"),
    ("ap-south-1", "Asia Pacific (Mumbai)"),
    ("ap-southeast-1", "Asia Pacific (Singapore)"),
    ("ap-southeast-2", "Asia Pacific (Sydney)"),
    ("ap-northeast-1", "Asia Pacific (Tokyo)"),
    ("ap-northeast-2", "Asia Pacific (Seoul)"),
    ("sa-east-1", "South America (Sao Paulo)"),
];

/// The catalog's location name for a region code.
pub fn region_full_name(region: &str) -> CloudResult<&'static str> {
    REGION_NAMES
        .iter()
        .find(|(code, _)| *code == region)
        .map(|(_, name)| *name)
        .ok_or_else(|| CloudError::UnknownRegion(region.to_string()))
}
