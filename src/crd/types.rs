//! Shared types used by the NetIPAllocation spec

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kind of the workload a pool is aware of
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum WorkloadKind {
    /// A Deployment; pods are owned transitively through ReplicaSets
    Deployment,
    /// A StatefulSet; pods are owned directly
    StatefulSet,
    /// A DaemonSet; pods are owned directly
    DaemonSet,
}

impl WorkloadKind {
    /// Kubernetes kind string, as it appears in owner references
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
        }
    }
}

/// Reference to the workload whose pods gate IP detachment
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRef {
    /// Workload kind
    pub kind: WorkloadKind,
    /// Workload name
    pub name: String,
    /// Workload namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Legacy workload reference without a kind; always means a Deployment
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRef {
    /// Deployment name
    pub name: String,
    /// Deployment namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl From<&DeploymentRef> for WorkloadRef {
    fn from(legacy: &DeploymentRef) -> Self {
        WorkloadRef {
            kind: WorkloadKind::Deployment,
            name: legacy.name.clone(),
            namespace: legacy
                .namespace
                .clone()
                .unwrap_or_else(default_namespace),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Supported cloud providers
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CloudProviderKind {
    /// Google Compute Engine
    Gcp,
    /// Amazon EC2
    Aws,
    /// Azure virtual machines
    Azure,
}

impl CloudProviderKind {
    /// Lowercase provider name, for logs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gcp => "gcp",
            Self::Aws => "aws",
            Self::Azure => "azure",
        }
    }
}

/// Cloud placement descriptor for a pool
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudSpec {
    /// Provider the pool's instances live on
    pub provider: CloudProviderKind,
    /// Region hint, informational for most providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Preferred zones; attach targets in these zones are picked first,
    /// in list order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<String>>,
}

/// Rolling-update overrides applied to the referenced Deployment
///
/// When set and the workload is a Deployment, the controller patches the
/// Deployment's rolling-update strategy with these values each tick.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    /// Maximum surge during a rollout (count or percentage)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrString>,
    /// Maximum unavailable pods during a rollout (count or percentage)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
}

impl RolloutStrategy {
    /// True when neither field is set and the patch would be a no-op
    pub fn is_empty(&self) -> bool {
        self.max_surge.is_none() && self.max_unavailable.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_kind_strings_match_owner_reference_kinds() {
        assert_eq!(WorkloadKind::Deployment.as_str(), "Deployment");
        assert_eq!(WorkloadKind::StatefulSet.as_str(), "StatefulSet");
        assert_eq!(WorkloadKind::DaemonSet.as_str(), "DaemonSet");
    }

    #[test]
    fn test_provider_parses_lowercase() {
        let p: CloudProviderKind = serde_yaml::from_str("gcp").unwrap();
        assert_eq!(p, CloudProviderKind::Gcp);
        assert_eq!(p.as_str(), "gcp");
        assert!(serde_yaml::from_str::<CloudProviderKind>("ibm").is_err());
    }

    #[test]
    fn test_legacy_ref_converts_to_deployment_workload() {
        let legacy = DeploymentRef {
            name: "app".to_string(),
            namespace: Some("ns".to_string()),
        };
        let workload = WorkloadRef::from(&legacy);
        assert_eq!(workload.kind, WorkloadKind::Deployment);
        assert_eq!(workload.name, "app");
        assert_eq!(workload.namespace, "ns");
    }

    #[test]
    fn test_legacy_ref_namespace_defaults() {
        let legacy = DeploymentRef {
            name: "app".to_string(),
            namespace: None,
        };
        assert_eq!(WorkloadRef::from(&legacy).namespace, "default");
    }

    #[test]
    fn test_workload_ref_namespace_defaults_on_decode() {
        let workload: WorkloadRef =
            serde_yaml::from_str("kind: StatefulSet\nname: db").unwrap();
        assert_eq!(workload.namespace, "default");
    }

    #[test]
    fn test_rollout_strategy_accepts_counts_and_percentages() {
        let strategy: RolloutStrategy =
            serde_yaml::from_str("maxSurge: 2\nmaxUnavailable: \"25%\"").unwrap();
        assert_eq!(strategy.max_surge, Some(IntOrString::Int(2)));
        assert_eq!(
            strategy.max_unavailable,
            Some(IntOrString::String("25%".to_string()))
        );
        assert!(!strategy.is_empty());
        assert!(RolloutStrategy::default().is_empty());
    }
}
