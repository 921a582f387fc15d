//! NetIP operator - keeps reserved static public IPs bound to cluster nodes
//!
//! The operator reconciles `NetIPAllocation` custom resources against the
//! observed state of the cloud provider and of selector-matching nodes. For
//! every pool it guarantees that each reserved IP is attached to exactly one
//! schedulable node and that bound nodes carry the `ip.ready=true` label so
//! workloads with matching node affinity can schedule onto them.
//!
//! # Modules
//!
//! - [`crd`] - The `NetIPAllocation` custom resource definition
//! - [`cloud`] - Cloud-provider driver contract and implementations
//! - [`view`] - Read-only cluster snapshot and write-side Kubernetes access
//! - [`reconciler`] - The five-phase per-pool reconcile engine
//! - [`leader`] - Lease-backed single-writer election
//! - [`runtime`] - Pool supervision: watching pools, scheduling ticks
//! - [`metrics`] - Prometheus metric registry
//! - [`server`] - Health and metrics HTTP listeners
//! - [`config`] - Process configuration from flags and environment
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod cloud;
pub mod config;
pub mod crd;
pub mod error;
pub mod leader;
pub mod metrics;
pub mod reconciler;
pub mod runtime;
pub mod server;
pub mod view;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the NetIPAllocation custom resource
pub const API_GROUP: &str = "netinfra.darkbrains.com";

/// Node label set on nodes that hold a reserved IP
pub const READY_LABEL: &str = "ip.ready";

/// Value written for [`READY_LABEL`]
pub const READY_LABEL_VALUE: &str = "true";

/// Node annotation recording which reserved IP the controller bound to the node
///
/// The annotation is the controller's claim marker: a node carrying the ready
/// label whose annotation names an IP the node no longer holds is treated as
/// having a stale claim.
pub const ASSIGNED_IP_ANNOTATION: &str = "netinfra.darkbrains.com/assigned-ip";

/// Pod annotation set on the pod currently holding leadership
pub const LEADER_POD_ANNOTATION: &str = "controller-leader";

/// Default lease name for leader election
pub const DEFAULT_LEASE_NAME: &str = "ip-address-controller-leader";
