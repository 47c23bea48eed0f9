//! fleet.toml configuration parser.
//!
//! Every field has a default, so an empty file yields a usable config.
//! Durations are kept as strings and resolved through the accessor
//! methods, which fall back to the default when a value is malformed.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::duration_or;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub scheduler: SchedulerConfig,
    pub hostinit: HostInitConfig,
    pub pricing: PricingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// When set, the scheduling runner exits without doing any work.
    pub disabled: bool,
    /// Desired wall-clock time to drain a distro's queue.
    pub target_makespan: String,
    /// Period between scheduling runs in the daemon.
    pub interval: String,
    /// Queue scheduler pool size; 0 means available parallelism.
    pub workers: usize,
    /// Expected duration assumed for tasks with no estimate.
    pub default_task_duration: String,
    /// Uninitialized intents older than this are removed before each run.
    pub stale_intent_cutoff: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            target_makespan: "30m".to_string(),
            interval: "20s".to_string(),
            workers: 0,
            default_task_duration: "10m".to_string(),
            stale_intent_cutoff: "3m".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn target_makespan(&self) -> Duration {
        duration_or(
            "scheduler.target_makespan",
            &self.target_makespan,
            Duration::from_secs(30 * 60),
        )
    }

    pub fn interval(&self) -> Duration {
        duration_or("scheduler.interval", &self.interval, Duration::from_secs(20))
    }

    pub fn default_task_duration(&self) -> Duration {
        duration_or(
            "scheduler.default_task_duration",
            &self.default_task_duration,
            Duration::from_secs(10 * 60),
        )
    }

    pub fn stale_intent_cutoff(&self) -> Duration {
        duration_or(
            "scheduler.stale_intent_cutoff",
            &self.stale_intent_cutoff,
            Duration::from_secs(3 * 60),
        )
    }

    /// Resolve the worker count, substituting host parallelism for 0.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostInitConfig {
    /// Unprovisioned hosts older than this are terminated.
    pub provisioning_cutoff: String,
    /// Unreachable hosts silent for longer than this are terminated.
    pub unreachable_cutoff: String,
    /// Hosts that never become ready within this window are terminated.
    pub readiness_cutoff: String,
    pub sweep_interval: String,
    pub ssh_timeout: String,
}

impl Default for HostInitConfig {
    fn default() -> Self {
        Self {
            provisioning_cutoff: "25m".to_string(),
            unreachable_cutoff: "5m".to_string(),
            readiness_cutoff: "20m".to_string(),
            sweep_interval: "30s".to_string(),
            ssh_timeout: "5s".to_string(),
        }
    }
}

impl HostInitConfig {
    pub fn provisioning_cutoff(&self) -> Duration {
        duration_or(
            "hostinit.provisioning_cutoff",
            &self.provisioning_cutoff,
            Duration::from_secs(25 * 60),
        )
    }

    pub fn unreachable_cutoff(&self) -> Duration {
        duration_or(
            "hostinit.unreachable_cutoff",
            &self.unreachable_cutoff,
            Duration::from_secs(5 * 60),
        )
    }

    pub fn readiness_cutoff(&self) -> Duration {
        duration_or(
            "hostinit.readiness_cutoff",
            &self.readiness_cutoff,
            Duration::from_secs(20 * 60),
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        duration_or(
            "hostinit.sweep_interval",
            &self.sweep_interval,
            Duration::from_secs(30),
        )
    }

    pub fn ssh_timeout(&self) -> Duration {
        duration_or("hostinit.ssh_timeout", &self.ssh_timeout, Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub on_demand_url: String,
    pub storage_url: String,
    /// Attempts per catalog fetch, including the first.
    pub retries: u32,
    pub retry_min_delay: String,
    pub retry_max_delay: String,
    /// Region used for on-demand lookups when the distro names none.
    pub default_region: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            on_demand_url:
                "https://pricing.us-east-1.amazonaws.com/offers/v1.0/aws/AmazonEC2/current/index.json"
                    .to_string(),
            storage_url: "http://a0.awsstatic.com/pricing/1/ebs/pricing-ebs.js".to_string(),
            retries: 5,
            retry_min_delay: "1s".to_string(),
            retry_max_delay: "30s".to_string(),
            default_region: "us-east-1".to_string(),
        }
    }
}

impl PricingConfig {
    pub fn retry_min_delay(&self) -> Duration {
        duration_or(
            "pricing.retry_min_delay",
            &self.retry_min_delay,
            Duration::from_secs(1),
        )
    }

    pub fn retry_max_delay(&self) -> Duration {
        duration_or(
            "pricing.retry_max_delay",
            &self.retry_max_delay,
            Duration::from_secs(30),
        )
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert!(!config.scheduler.disabled);
        assert_eq!(config.scheduler.target_makespan(), Duration::from_secs(1800));
        assert_eq!(config.hostinit.provisioning_cutoff(), Duration::from_secs(1500));
        assert_eq!(config.hostinit.unreachable_cutoff(), Duration::from_secs(300));
        assert_eq!(config.pricing.default_region, "us-east-1");
        assert_eq!(config.pricing.retries, 5);
    }

    #[test]
    fn partial_sections_override_only_named_fields() {
        let config = FleetConfig::from_toml_str(
            r#"
[scheduler]
disabled = true
target_makespan = "1h"
workers = 3

[pricing]
retries = 2
"#,
        )
        .unwrap();
        assert!(config.scheduler.disabled);
        assert_eq!(config.scheduler.target_makespan(), Duration::from_secs(3600));
        assert_eq!(config.scheduler.worker_count(), 3);
        assert_eq!(config.scheduler.interval(), Duration::from_secs(20));
        assert_eq!(config.pricing.retries, 2);
        assert!(config.pricing.storage_url.contains("pricing-ebs"));
    }

    #[test]
    fn malformed_duration_falls_back() {
        let config = FleetConfig::from_toml_str(
            r#"
[hostinit]
sweep_interval = "often"
"#,
        )
        .unwrap();
        assert_eq!(config.hostinit.sweep_interval(), Duration::from_secs(30));
    }

    #[test]
    fn zero_workers_means_parallelism() {
        let config = SchedulerConfig::default();
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn toml_roundtrip_keeps_values() {
        let mut config = FleetConfig::default();
        config.scheduler.workers = 8;
        let text = config.to_toml_string().unwrap();
        let back = FleetConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.scheduler.workers, 8);
    }
}
