//! Process configuration
//!
//! Every recognized environment variable maps through a clap flag so both
//! `--lease-duration 30` and `LEASE_DURATION=30` work. Pod identity falls
//! back to the hostname when the downward API is not wired up.

use clap::Parser;

use crate::DEFAULT_LEASE_NAME;

const SERVICE_ACCOUNT_NAMESPACE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// NetIP operator - binds pools of reserved static public IPs to nodes
#[derive(Parser, Debug, Clone)]
#[command(name = "netip-operator", version, about, long_about = None)]
pub struct Config {
    /// Generate the NetIPAllocation CRD manifest and exit
    #[arg(long)]
    pub crd: bool,

    /// Leader election lease name
    #[arg(long, env = "LEASE_NAME", default_value = DEFAULT_LEASE_NAME)]
    pub lease_name: String,

    /// Leader lease duration in seconds
    #[arg(long, env = "LEASE_DURATION", default_value_t = 60)]
    pub lease_duration: u64,

    /// Clock-skew allowance for lease expiry checks, in seconds
    #[arg(long, env = "LEASE_SKEW_GRACE_SEC", default_value_t = 2)]
    pub lease_skew_grace: u64,

    /// Port for the Prometheus metrics listener
    #[arg(long, env = "METRICS_PORT", default_value_t = 9999)]
    pub metrics_port: u16,

    /// Port for the health listener
    #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
    pub health_port: u16,

    /// Version label reported on controller_info
    #[arg(long, env = "CONTROLLER_VERSION", default_value = "1.0.0")]
    pub controller_version: String,

    /// Cluster label reported on controller_info
    #[arg(long, env = "CLUSTER_NAME")]
    pub cluster_name: Option<String>,

    /// This pod's name (downward API); falls back to the hostname
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Namespace for the leader lease and pod annotation; falls back to the
    /// mounted service-account namespace, then "default"
    #[arg(long, env = "POD_NAMESPACE")]
    pub pod_namespace: Option<String>,

    /// Timeout for individual cloud API calls, in seconds
    #[arg(long, env = "CLOUD_TIMEOUT_SECS", default_value_t = 60)]
    pub cloud_timeout_secs: u64,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    /// Stable identity of this replica for leader election
    pub fn identity(&self) -> String {
        self.pod_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "netip-operator".to_string())
    }

    /// Namespace the lease and leader annotation live in
    pub fn namespace(&self) -> String {
        self.pod_namespace
            .clone()
            .or_else(|| {
                std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            })
            .unwrap_or_else(|| "default".to_string())
    }
}
