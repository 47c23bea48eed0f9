//! Error types for cloud providers and pricing.

use thiserror::Error;

/// Result type alias for cloud operations.
pub type CloudResult<T> = Result<T, CloudError>;

#[derive(Debug, Error)]
pub enum CloudError {
    /// EC2 API failure.
    #[error("EC2 error: {0}")]
    Ec2(#[from] aws_sdk_ec2::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("host {0} has no provider-assigned instance id")]
    NotSpawned(String),

    /// Transport failure while fetching a pricing catalog.
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// A pricing catalog was fetched but could not be understood.
    #[error("failed to parse pricing catalog: {0}")]
    Catalog(String),

    #[error("no on-demand price for {os} {instance_type} in {region}")]
    PriceNotFound {
        os: String,
        instance_type: String,
        region: String,
    },

    #[error("no storage price for region {0}")]
    StoragePriceNotFound(String),

    #[error("unknown region {0}")]
    UnknownRegion(String),

    #[error("no spot prices found for {instance_type} ({product})")]
    NoSpotPrices {
        instance_type: String,
        product: String,
    },

    #[error("invalid spot price {0:?}")]
    InvalidSpotPrice(String),

    #[error("no subnet for vpc {vpc} in {zone}")]
    NoSubnet { vpc: String, zone: String },
}

impl CloudError {
    pub fn from_ec2<E>(err: E) -> Self
    where
        aws_sdk_ec2::Error: From<E>,
    {
        Self::Ec2(aws_sdk_ec2::Error::from(err))
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CloudError::Fetch { .. } | CloudError::Catalog(_) | CloudError::Ec2(_)
        )
    }
}
