//! fleet-core: configuration and helpers shared by every Fleetgrid crate.

pub mod config;
pub mod duration;

pub use config::{FleetConfig, HostInitConfig, PricingConfig, SchedulerConfig};
pub use duration::{duration_or, parse_duration};
