//! Cluster view: snapshot types and the Kubernetes access seams
//!
//! The reconciler talks to the cluster through two narrow traits:
//! [`ClusterView`] for reads and [`ClusterWriter`] for mutations. Both are
//! mockable so the engine can be tested without a cluster. The production
//! implementations live in [`kube`](self::kube) and snapshot by listing at
//! tick entry, so a tick never observes torn state.

mod kube;

pub use self::kube::KubeCluster;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::cloud::InstanceRef;
use crate::crd::{RolloutStrategy, WorkloadRef};
use crate::{Error, ASSIGNED_IP_ANNOTATION, READY_LABEL, READY_LABEL_VALUE};

/// Observed state of one eligible node
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeView {
    /// Node name
    pub name: String,
    /// Provider instance URI from `spec.providerID`
    pub provider_id: Option<String>,
    /// Topology zone label, when present
    pub zone: Option<String>,
    /// False iff the node is cordoned (`spec.unschedulable`)
    pub schedulable: bool,
    /// Node labels
    pub labels: BTreeMap<String, String>,
    /// Node annotations
    pub annotations: BTreeMap<String, String>,
}

impl NodeView {
    /// Provider instance identity, if the providerID parses
    pub fn instance_ref(&self) -> Option<InstanceRef> {
        self.provider_id.as_deref().and_then(InstanceRef::parse)
    }

    /// Whether the node carries `ip.ready=true`
    pub fn has_ready_label(&self) -> bool {
        self.labels.get(READY_LABEL).map(String::as_str) == Some(READY_LABEL_VALUE)
    }

    /// IP this controller recorded as bound to the node, if any
    pub fn assigned_ip(&self) -> Option<&str> {
        self.annotations.get(ASSIGNED_IP_ANNOTATION).map(String::as_str)
    }
}

/// Observed state of one workload pod
#[derive(Clone, Debug, PartialEq)]
pub struct WorkloadPod {
    /// Pod name
    pub name: String,
    /// Pod namespace
    pub namespace: String,
    /// Node the pod is scheduled on, if scheduled
    pub node: Option<String>,
    /// True while the pod is running and not terminating
    pub running: bool,
}

/// Read-only cluster queries used by the reconciler
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterView: Send + Sync {
    /// Nodes matching every entry of the label selector
    async fn eligible_nodes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<NodeView>, Error>;

    /// Pods owned by the workload, directly or transitively through a
    /// ReplicaSet for Deployments
    async fn workload_pods(&self, workload: &WorkloadRef) -> Result<Vec<WorkloadPod>, Error>;

    /// A single node by name; `None` when it does not exist
    async fn node(&self, name: &str) -> Result<Option<NodeView>, Error>;
}

/// Cluster mutations issued by the reconciler
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterWriter: Send + Sync {
    /// Set `ip.ready=true` and record the bound IP on the node
    async fn label_node(&self, node: &str, ip: &str) -> Result<(), Error>;

    /// Remove the ready label and the bound-IP record from the node
    async fn unlabel_node(&self, node: &str) -> Result<(), Error>;

    /// Delete a pod so its controller reschedules it elsewhere
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Patch a Deployment's rolling-update strategy
    async fn patch_deployment_strategy(
        &self,
        workload: &WorkloadRef,
        strategy: &RolloutStrategy,
    ) -> Result<(), Error>;
}
