//! Cloud-provider driver abstraction
//!
//! Each provider implements the [`CloudDriver`] trait: read the external IPs
//! attached to an instance, attach a reserved IP as the primary external
//! access configuration, detach it again. All three operations are
//! idempotent; the reconciler relies on this for crash recovery.
//!
//! The driver for a pool is selected at reconcile time from the pool's
//! `cloud.provider` field via [`Drivers::for_provider`].

mod aws;
mod azure;
mod gcp;

pub use aws::AwsDriver;
pub use azure::AzureDriver;
pub use gcp::GcpDriver;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::crd::CloudProviderKind;
use crate::error::ErrorKind;

/// Errors a cloud driver can report
///
/// The reconciler maps these onto tick outcomes: `AlreadyAttached` and
/// `NotAttached` are successes, `InUseElsewhere` aborts the tick as a
/// conflict, `Auth` terminates the tick with its own kind, everything else
/// is transient and retried on the next tick.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The instance does not exist at the provider
    #[error("instance not found: {0}")]
    NotFound(String),

    /// The IP is already attached to this instance
    #[error("ip already attached: {0}")]
    AlreadyAttached(String),

    /// The IP is not attached to this instance
    #[error("ip not attached: {0}")]
    NotAttached(String),

    /// The IP is attached to a different instance; the driver must not
    /// steal it
    #[error("ip in use elsewhere: {0}")]
    InUseElsewhere(String),

    /// Credential or permission failure
    #[error("cloud authentication failed: {0}")]
    Auth(String),

    /// Retryable provider failure (5xx, timeout, transport)
    #[error("transient cloud error: {0}")]
    Transient(String),

    /// The provider has no driver implementation in this build
    #[error("provider not supported: {0}")]
    Unsupported(String),
}

impl DriverError {
    /// Reporting class for the `error_type` metrics label
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::InUseElsewhere(_) => ErrorKind::Conflict,
            Self::Unsupported(_) => ErrorKind::InvalidSpec,
            Self::NotFound(_) | Self::Transient(_) => ErrorKind::Transient,
            // Treated as success by the reconciler; classified for
            // completeness if one ever escapes.
            Self::AlreadyAttached(_) | Self::NotAttached(_) => ErrorKind::Internal,
        }
    }
}

/// Provider-side identity of a node's VM instance
///
/// Parsed from the node's `spec.providerID`, e.g.
/// `gce://my-project/europe-west1-b/node-a` or
/// `aws:///eu-west-1a/i-0123456789abcdef0`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceRef {
    /// Project or account scope; empty when the provider URI carries none
    pub project: String,
    /// Zone the instance lives in
    pub zone: String,
    /// Instance name or ID
    pub name: String,
}

impl InstanceRef {
    /// Parse a Kubernetes providerID URI
    ///
    /// Returns `None` when the URI does not carry at least a zone and an
    /// instance segment.
    pub fn parse(provider_id: &str) -> Option<Self> {
        let rest = provider_id.split_once("://").map(|(_, r)| r)?;
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [project, zone, name] => Some(Self {
                project: (*project).to_string(),
                zone: (*zone).to_string(),
                name: (*name).to_string(),
            }),
            [zone, name] => Some(Self {
                project: String::new(),
                zone: (*zone).to_string(),
                name: (*name).to_string(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.project.is_empty() {
            write!(f, "{}/{}", self.zone, self.name)
        } else {
            write!(f, "{}/{}/{}", self.project, self.zone, self.name)
        }
    }
}

/// Provider-specific binding of reserved IPs to VM instances
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudDriver: Send + Sync {
    /// Public IPs currently attached to the instance as primary external
    /// access configurations
    async fn get_external_ips(
        &self,
        instance: &InstanceRef,
    ) -> Result<BTreeSet<String>, DriverError>;

    /// Attach `ip` to the instance as its primary external access
    /// configuration
    async fn attach_ip(&self, instance: &InstanceRef, ip: &str) -> Result<(), DriverError>;

    /// Detach `ip` from the instance; `NotAttached` is a success for callers
    async fn detach_ip(&self, instance: &InstanceRef, ip: &str) -> Result<(), DriverError>;
}

/// Driver registry, one instance per provider, shared by all pool tasks
pub struct Drivers {
    gcp: Arc<dyn CloudDriver>,
    aws: Arc<dyn CloudDriver>,
    azure: Arc<dyn CloudDriver>,
}

impl Drivers {
    /// Build the production registry with the given per-call timeout
    pub fn new(timeout: Duration) -> Result<Self, DriverError> {
        Ok(Self {
            gcp: Arc::new(GcpDriver::new(timeout)?),
            aws: Arc::new(AwsDriver::new()),
            azure: Arc::new(AzureDriver::new()),
        })
    }

    /// Registry where every provider resolves to the same driver; for tests
    #[cfg(test)]
    pub fn uniform(driver: Arc<dyn CloudDriver>) -> Self {
        Self {
            gcp: driver.clone(),
            aws: driver.clone(),
            azure: driver,
        }
    }

    /// Driver for a pool's provider
    pub fn for_provider(&self, provider: CloudProviderKind) -> Arc<dyn CloudDriver> {
        match provider {
            CloudProviderKind::Gcp => self.gcp.clone(),
            CloudProviderKind::Aws => self.aws.clone(),
            CloudProviderKind::Azure => self.azure.clone(),
        }
    }
}
