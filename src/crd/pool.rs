//! NetIPAllocation Custom Resource Definition
//!
//! A NetIPAllocation ("pool") declares a set of pre-reserved static public
//! IPs, the nodes allowed to hold them, the workload whose pods gate
//! detachment, and the cloud provider the instances live on. The controller
//! only reads pools; it writes no status subresource in this version.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{CloudSpec, DeploymentRef, RolloutStrategy, WorkloadRef};
use crate::Error;

/// Default reconcile interval in seconds
pub const DEFAULT_RECONCILE_INTERVAL: u64 = 30;

/// Specification for a NetIPAllocation pool
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "netinfra.darkbrains.com",
    version = "v1alpha1",
    kind = "NetIPAllocation",
    plural = "netipallocations",
    shortname = "nipa",
    printcolumn = r#"{"name":"IPs","type":"string","jsonPath":".spec.reservedIPs"}"#,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.cloud.provider"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetIPAllocationSpec {
    /// Reserved static public IPs owned by this pool, in priority order.
    /// Dotted-quad strings, unique within the pool.
    #[serde(rename = "reservedIPs")]
    pub reserved_ips: Vec<String>,

    /// Workload whose running pods defer IP detachment from cordoned nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_ref: Option<WorkloadRef>,

    /// Legacy alias for `workloadRef`; interpreted as a Deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_ref: Option<DeploymentRef>,

    /// Node label selector; every entry must match. Empty or absent selects
    /// all nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Cloud provider descriptor
    pub cloud: CloudSpec,

    /// Reconcile interval in seconds (default 30, minimum 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_interval: Option<u64>,

    /// Rolling-update overrides applied to a referenced Deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RolloutStrategy>,
}

impl NetIPAllocationSpec {
    /// Validate the pool specification
    ///
    /// Rejections mark the pool unhealthy; it is skipped until its spec
    /// changes. An empty `reservedIPs` list is valid and reconciles as a
    /// no-op.
    pub fn validate(&self, pool: &str) -> Result<(), Error> {
        let mut seen = std::collections::BTreeSet::new();
        for ip in &self.reserved_ips {
            if ip.parse::<Ipv4Addr>().is_err() {
                return Err(Error::invalid_spec(
                    pool,
                    format!("reserved IP {ip:?} is not a dotted-quad IPv4 address"),
                ));
            }
            if !seen.insert(ip.as_str()) {
                return Err(Error::invalid_spec(
                    pool,
                    format!("duplicate reserved IP {ip}"),
                ));
            }
        }

        if self.workload_ref.is_some() && self.deployment_ref.is_some() {
            return Err(Error::invalid_spec(
                pool,
                "workloadRef and deploymentRef are mutually exclusive",
            ));
        }

        if let Some(interval) = self.reconcile_interval {
            if interval < 1 {
                return Err(Error::invalid_spec(
                    pool,
                    "reconcileInterval must be at least 1 second",
                ));
            }
        }

        Ok(())
    }

    /// Normalized workload reference, resolving the legacy alias
    pub fn workload(&self) -> Option<WorkloadRef> {
        self.workload_ref
            .clone()
            .or_else(|| self.deployment_ref.as_ref().map(WorkloadRef::from))
    }

    /// Effective reconcile interval
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval.unwrap_or(DEFAULT_RECONCILE_INTERVAL))
    }

    /// Node selector, defaulting to the empty (match-all) selector
    pub fn selector(&self) -> BTreeMap<String, String> {
        self.node_selector.clone().unwrap_or_default()
    }

    /// Preferred zones in priority order
    pub fn zones(&self) -> Vec<String> {
        self.cloud.zones.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::{CloudProviderKind, WorkloadKind};

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn sample_spec() -> NetIPAllocationSpec {
        NetIPAllocationSpec {
            reserved_ips: vec!["34.1.1.1".to_string(), "34.1.1.2".to_string()],
            workload_ref: None,
            deployment_ref: None,
            node_selector: Some(BTreeMap::from([(
                "role".to_string(),
                "pub".to_string(),
            )])),
            cloud: CloudSpec {
                provider: CloudProviderKind::Gcp,
                region: Some("europe-west1".to_string()),
                zones: None,
            },
            reconcile_interval: None,
            strategy: None,
        }
    }

    // =========================================================================
    // Validation Stories
    // =========================================================================

    /// Story: a well-formed pool passes validation
    #[test]
    fn story_valid_pool_passes_validation() {
        assert!(sample_spec().validate("pool").is_ok());
    }

    /// Story: an empty pool is valid and reconciles as a no-op
    ///
    /// Operators sometimes create the pool resource before the IPs are
    /// reserved. That must not count as a broken spec.
    #[test]
    fn story_empty_reserved_ips_is_valid() {
        let mut spec = sample_spec();
        spec.reserved_ips.clear();
        assert!(spec.validate("pool").is_ok());
    }

    /// Story: duplicate and malformed IPs are rejected
    #[test]
    fn story_bad_ips_fail_validation() {
        let mut spec = sample_spec();
        spec.reserved_ips.push("34.1.1.1".to_string());
        let err = spec.validate("pool").unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("duplicate"));

        let mut spec = sample_spec();
        spec.reserved_ips = vec!["34.1.1".to_string()];
        assert!(spec
            .validate("pool")
            .unwrap_err()
            .to_string()
            .contains("dotted-quad"));

        let mut spec = sample_spec();
        spec.reserved_ips = vec!["2001:db8::1".to_string()];
        assert!(spec.validate("pool").is_err());
    }

    /// Story: a pool cannot name both the modern and the legacy reference
    #[test]
    fn story_conflicting_workload_refs_fail_validation() {
        let mut spec = sample_spec();
        spec.workload_ref = Some(WorkloadRef {
            kind: WorkloadKind::Deployment,
            name: "app".to_string(),
            namespace: "default".to_string(),
        });
        spec.deployment_ref = Some(DeploymentRef {
            name: "app".to_string(),
            namespace: None,
        });
        let err = spec.validate("pool").unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    /// Story: a sub-second reconcile interval is rejected
    #[test]
    fn story_zero_interval_fails_validation() {
        let mut spec = sample_spec();
        spec.reconcile_interval = Some(0);
        assert!(spec.validate("pool").is_err());

        spec.reconcile_interval = Some(1);
        assert!(spec.validate("pool").is_ok());
    }

    // =========================================================================
    // Normalization Stories
    // =========================================================================

    /// Story: the legacy deploymentRef is accepted and normalized
    ///
    /// Pools written for the previous controller generation use
    /// `deploymentRef: {name, namespace}`. They keep working and behave as
    /// `workloadRef: {kind: Deployment, ...}`.
    #[test]
    fn story_legacy_deployment_ref_is_normalized() {
        let yaml = r#"
reservedIPs:
  - "34.1.1.1"
deploymentRef:
  name: app
  namespace: ns
cloud:
  provider: gcp
"#;
        let spec: NetIPAllocationSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(spec.validate("legacy-pool").is_ok());

        let workload = spec.workload().expect("workload should be present");
        assert_eq!(workload.kind, WorkloadKind::Deployment);
        assert_eq!(workload.name, "app");
        assert_eq!(workload.namespace, "ns");
    }

    /// Story: a pool without any workload reference has no workload
    ///
    /// Without a workloadRef the pod-awareness check is skipped entirely;
    /// cordoned bound nodes drain immediately.
    #[test]
    fn story_absent_workload_ref_yields_none() {
        assert!(sample_spec().workload().is_none());
    }

    // =========================================================================
    // YAML Decode Stories
    // =========================================================================

    /// Story: operator defines a full pool in a YAML manifest
    #[test]
    fn story_yaml_manifest_defines_pool() {
        let yaml = r#"
reservedIPs:
  - "34.1.1.1"
  - "34.1.1.2"
workloadRef:
  kind: Deployment
  name: frontend
  namespace: web
nodeSelector:
  role: pub
cloud:
  provider: gcp
  region: europe-west1
  zones:
    - europe-west1-b
    - europe-west1-c
reconcileInterval: 15
strategy:
  maxSurge: 1
  maxUnavailable: 0
"#;
        let spec: NetIPAllocationSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(spec.validate("web-pool").is_ok());
        assert_eq!(spec.reserved_ips.len(), 2);
        assert_eq!(spec.interval(), Duration::from_secs(15));
        assert_eq!(spec.zones(), vec!["europe-west1-b", "europe-west1-c"]);
        assert_eq!(spec.selector().get("role").map(String::as_str), Some("pub"));
        assert!(spec.strategy.is_some());
    }

    /// Story: defaults apply when optional fields are omitted
    #[test]
    fn story_minimal_manifest_uses_defaults() {
        let yaml = r#"
reservedIPs:
  - "34.1.1.1"
cloud:
  provider: gcp
"#;
        let spec: NetIPAllocationSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.interval(), Duration::from_secs(30));
        assert!(spec.selector().is_empty());
        assert!(spec.zones().is_empty());
        assert!(spec.workload().is_none());
    }

    /// Story: spec survives a serialization roundtrip
    #[test]
    fn story_spec_survives_yaml_roundtrip() {
        let spec = sample_spec();
        let yaml = serde_yaml::to_string(&spec).unwrap();
        let parsed: NetIPAllocationSpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(spec, parsed);
        // The wire field name keeps its historical capitalization.
        assert!(yaml.contains("reservedIPs"));
    }
}
