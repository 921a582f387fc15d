//! Amazon EC2 driver
//!
//! Elastic IP association is not implemented yet; the driver keeps the
//! contract so pools selecting `aws` fail cleanly as unsupported instead of
//! failing to decode.

use std::collections::BTreeSet;

use async_trait::async_trait;

use super::{CloudDriver, DriverError, InstanceRef};

/// Placeholder EC2 implementation of [`CloudDriver`]
#[derive(Default)]
pub struct AwsDriver;

impl AwsDriver {
    /// Create the driver
    pub fn new() -> Self {
        Self
    }

    fn unsupported() -> DriverError {
        DriverError::Unsupported("aws elastic IP association is not implemented yet".to_string())
    }
}

#[async_trait]
impl CloudDriver for AwsDriver {
    async fn get_external_ips(
        &self,
        _instance: &InstanceRef,
    ) -> Result<BTreeSet<String>, DriverError> {
        Err(Self::unsupported())
    }

    async fn attach_ip(&self, _instance: &InstanceRef, _ip: &str) -> Result<(), DriverError> {
        Err(Self::unsupported())
    }

    async fn detach_ip(&self, _instance: &InstanceRef, _ip: &str) -> Result<(), DriverError> {
        Err(Self::unsupported())
    }
}
