//! fleetgrid-cloud: compute backends, pricing and spot billing.
//!
//! ```text
//!                  ┌──────────────────┐
//!   HostInit ────▶ │ ProviderSelector │──┐
//!                  └──────────────────┘  │   ┌────────────────────────┐
//!                                        ├──▶│ dyn CloudProvider      │
//!                  ┌──────────────────┐  │   │  Ec2Provider / Mock    │
//!   accounting ──▶ │ CostCalculator   │──┘   └────────────────────────┘
//!                  └────────┬─────────┘
//!                           ▼
//!                  ┌──────────────────┐      ┌────────────────────────┐
//!                  │ PriceCache       │─────▶│ dyn CatalogSource      │
//!                  └──────────────────┘      │  HttpCatalog / Static  │
//!                                            └────────────────────────┘
//! ```
//!
//! The selector decides between on-demand and spot per host. The cost
//! calculator prices a host's runtime, replaying spot history into hourly
//! billing rates where needed.

pub mod catalog;
pub mod cost;
pub mod ec2;
pub mod error;
pub mod mock;
pub mod price_cache;
pub mod provider;
pub mod region;
pub mod retry;
pub mod selector;
pub mod spot;

pub use catalog::{CatalogSource, HttpCatalog, StaticCatalog};
pub use cost::CostCalculator;
pub use ec2::Ec2Provider;
pub use error::{CloudError, CloudResult};
pub use mock::{MockInstance, MockProvider};
pub use price_cache::PriceCache;
pub use provider::{
    CloudProvider, InstanceSnapshot, InstanceState, Market, SpawnOptions, SpotPriceFilter,
    SpotPricePage, SpotPriceSample, SubnetFilter,
};
pub use region::{OsType, az_to_region, region_full_name};
pub use retry::{RetryPolicy, retry};
pub use selector::ProviderSelector;
pub use spot::{SpotRate, hourly_rates, on_demand_cost, spot_cost_for_range};
