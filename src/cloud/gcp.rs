//! Google Compute Engine driver
//!
//! Binds reserved IPs to instances through the Compute Engine REST API as
//! `ONE_TO_ONE_NAT` access configurations. Credentials come from the
//! instance metadata server (workload identity); the driver never reads key
//! files.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{CloudDriver, DriverError, InstanceRef};

const COMPUTE_API: &str = "https://compute.googleapis.com/compute/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Name GCE gives the primary external access configuration
const ACCESS_CONFIG_NAME: &str = "External NAT";
const ACCESS_CONFIG_TYPE: &str = "ONE_TO_ONE_NAT";
const NETWORK_INTERFACE: &str = "nic0";

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct Instance {
    #[serde(default, rename = "networkInterfaces")]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Deserialize)]
struct NetworkInterface {
    #[serde(default, rename = "accessConfigs")]
    access_configs: Vec<AccessConfig>,
}

#[derive(Deserialize)]
struct AccessConfig {
    #[serde(default, rename = "type")]
    type_: String,
    #[serde(default, rename = "natIP")]
    nat_ip: Option<String>,
}

/// Compute Engine implementation of [`CloudDriver`]
pub struct GcpDriver {
    http: reqwest::Client,
    api_base: String,
    token_url: String,
}

impl GcpDriver {
    /// Create a driver whose calls are bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self, DriverError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DriverError::Transient(format!("building http client: {e}")))?;
        Ok(Self {
            http,
            api_base: COMPUTE_API.to_string(),
            token_url: METADATA_TOKEN_URL.to_string(),
        })
    }

    async fn token(&self) -> Result<String, DriverError> {
        let response = self
            .http
            .get(&self.token_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| DriverError::Auth(format!("metadata server unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(DriverError::Auth(format!(
                "metadata server returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| DriverError::Auth(format!("decoding token response: {e}")))?;
        Ok(token.access_token)
    }

    fn instance_url(&self, instance: &InstanceRef) -> String {
        format!(
            "{}/projects/{}/zones/{}/instances/{}",
            self.api_base, instance.project, instance.zone, instance.name
        )
    }

    async fn get_instance(&self, instance: &InstanceRef) -> Result<Instance, DriverError> {
        let token = self.token().await?;
        let response = self
            .http
            .get(self.instance_url(instance))
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        if status == 200 {
            return response
                .json()
                .await
                .map_err(|e| DriverError::Transient(format!("decoding instance: {e}")));
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body, &instance.name))
    }
}

#[async_trait]
impl CloudDriver for GcpDriver {
    async fn get_external_ips(
        &self,
        instance: &InstanceRef,
    ) -> Result<BTreeSet<String>, DriverError> {
        let vm = self.get_instance(instance).await?;
        let ips = vm
            .network_interfaces
            .iter()
            .flat_map(|nic| nic.access_configs.iter())
            .filter(|ac| ac.type_ == ACCESS_CONFIG_TYPE)
            .filter_map(|ac| ac.nat_ip.clone())
            .collect();
        debug!(instance = %instance, ?ips, "discovered external IPs");
        Ok(ips)
    }

    async fn attach_ip(&self, instance: &InstanceRef, ip: &str) -> Result<(), DriverError> {
        let token = self.token().await?;
        let url = format!(
            "{}/addAccessConfig?networkInterface={}",
            self.instance_url(instance),
            NETWORK_INTERFACE
        );
        let body = serde_json::json!({
            "type": ACCESS_CONFIG_TYPE,
            "name": ACCESS_CONFIG_NAME,
            "natIP": ip,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            debug!(instance = %instance, ip, "attached access config");
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(classify_attach_error(status, &text, ip))
    }

    async fn detach_ip(&self, instance: &InstanceRef, ip: &str) -> Result<(), DriverError> {
        let token = self.token().await?;
        let url = format!(
            "{}/deleteAccessConfig?accessConfig={}&networkInterface={}",
            self.instance_url(instance),
            ACCESS_CONFIG_NAME.replace(' ', "%20"),
            NETWORK_INTERFACE
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            debug!(instance = %instance, ip, "deleted access config");
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(classify_detach_error(status, &text, ip))
    }
}

fn transport_error(e: reqwest::Error) -> DriverError {
    DriverError::Transient(format!("compute api request failed: {e}"))
}

/// Map a non-2xx instance read onto a driver error
fn classify_status(status: u16, body: &str, what: &str) -> DriverError {
    match status {
        401 | 403 => DriverError::Auth(format!("{status}: {}", truncate(body))),
        404 => DriverError::NotFound(what.to_string()),
        500..=599 => DriverError::Transient(format!("{status}: {}", truncate(body))),
        _ => DriverError::Transient(format!("unexpected status {status}: {}", truncate(body))),
    }
}

/// Map a failed addAccessConfig onto a driver error
///
/// GCE rejects a second binding of the same IP with an IP_IN_USE error and a
/// second access config on the interface with an alreadyExists condition.
fn classify_attach_error(status: u16, body: &str, ip: &str) -> DriverError {
    match status {
        401 | 403 => DriverError::Auth(format!("{status}: {}", truncate(body))),
        404 => DriverError::NotFound(format!("instance gone while attaching {ip}")),
        400 | 409 if body.contains("IP_IN_USE") || body.contains("already in use") => {
            DriverError::InUseElsewhere(format!("{ip}: {}", truncate(body)))
        }
        400 | 409 if body.contains("alreadyExists") || body.contains("already exists") => {
            DriverError::AlreadyAttached(ip.to_string())
        }
        500..=599 => DriverError::Transient(format!("{status}: {}", truncate(body))),
        _ => DriverError::Transient(format!("attach {ip} failed with {status}: {}", truncate(body))),
    }
}

/// Map a failed deleteAccessConfig onto a driver error
fn classify_detach_error(status: u16, body: &str, ip: &str) -> DriverError {
    match status {
        401 | 403 => DriverError::Auth(format!("{status}: {}", truncate(body))),
        404 => DriverError::NotAttached(ip.to_string()),
        400 if body.contains("not found") || body.contains("No access config") => {
            DriverError::NotAttached(ip.to_string())
        }
        500..=599 => DriverError::Transient(format!("{status}: {}", truncate(body))),
        _ => DriverError::Transient(format!("detach {ip} failed with {status}: {}", truncate(body))),
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(300).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // The HTTP round-trips are exercised against the real API; what must be
    // locked down here is the status classification the reconciler's
    // contract depends on.

    #[test]
    fn test_auth_statuses_classify_as_auth() {
        assert!(matches!(
            classify_status(403, "forbidden", "node-a"),
            DriverError::Auth(_)
        ));
        assert!(matches!(
            classify_attach_error(401, "no token", "34.1.1.1"),
            DriverError::Auth(_)
        ));
    }

    #[test]
    fn test_missing_instance_is_not_found() {
        assert!(matches!(
            classify_status(404, "", "node-a"),
            DriverError::NotFound(_)
        ));
    }

    #[test]
    fn test_ip_in_use_maps_to_in_use_elsewhere() {
        let err = classify_attach_error(
            400,
            r#"{"error": {"errors": [{"reason": "IP_IN_USE_BY_ANOTHER_RESOURCE"}]}}"#,
            "34.1.1.1",
        );
        assert!(matches!(err, DriverError::InUseElsewhere(_)));
    }

    #[test]
    fn test_duplicate_access_config_maps_to_already_attached() {
        let err = classify_attach_error(409, r#"{"error": {"code": "alreadyExists"}}"#, "34.1.1.1");
        assert!(matches!(err, DriverError::AlreadyAttached(_)));
    }

    #[test]
    fn test_missing_access_config_maps_to_not_attached() {
        assert!(matches!(
            classify_detach_error(404, "", "34.1.1.1"),
            DriverError::NotAttached(_)
        ));
        assert!(matches!(
            classify_detach_error(400, "No access config named 'External NAT'", "34.1.1.1"),
            DriverError::NotAttached(_)
        ));
    }

    #[test]
    fn test_server_errors_are_transient() {
        assert!(matches!(
            classify_attach_error(503, "backend unavailable", "34.1.1.1"),
            DriverError::Transient(_)
        ));
        assert!(matches!(
            classify_detach_error(500, "", "34.1.1.1"),
            DriverError::Transient(_)
        ));
    }

    #[test]
    fn test_instance_url_layout() {
        let driver = GcpDriver::new(Duration::from_secs(5)).unwrap();
        let instance = InstanceRef {
            project: "my-project".into(),
            zone: "europe-west1-b".into(),
            name: "node-a".into(),
        };
        assert_eq!(
            driver.instance_url(&instance),
            "https://compute.googleapis.com/compute/v1/projects/my-project/zones/europe-west1-b/instances/node-a"
        );
    }
}
