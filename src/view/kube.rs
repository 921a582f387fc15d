//! Kubernetes-backed implementation of the cluster view and writer
//!
//! Reads snapshot by listing with label selectors at tick entry. Writes use
//! merge patches; label removal writes explicit nulls.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use tracing::debug;

use super::{ClusterView, ClusterWriter, NodeView, WorkloadPod};
use crate::crd::{RolloutStrategy, WorkloadKind, WorkloadRef};
use crate::{Error, ASSIGNED_IP_ANNOTATION, READY_LABEL, READY_LABEL_VALUE};

const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
const ZONE_LABEL_LEGACY: &str = "failure-domain.beta.kubernetes.io/zone";
const FIELD_MANAGER: &str = "netip-operator";

/// Production cluster access through the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Render a label map as a Kubernetes list selector (`k=v,k2=v2`)
///
/// BTreeMap iteration keeps the rendering deterministic.
fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn node_view(node: Node) -> NodeView {
    let labels = node.metadata.labels.unwrap_or_default();
    let annotations = node.metadata.annotations.unwrap_or_default();
    let spec = node.spec.unwrap_or_default();
    let zone = labels
        .get(ZONE_LABEL)
        .or_else(|| labels.get(ZONE_LABEL_LEGACY))
        .cloned();
    NodeView {
        name: node.metadata.name.unwrap_or_default(),
        provider_id: spec.provider_id,
        zone,
        schedulable: !spec.unschedulable.unwrap_or(false),
        labels,
        annotations,
    }
}

/// Whether an owner-reference list names a controller of `kind`/`name`
fn owned_by(refs: &[OwnerReference], kind: &str, name: &str) -> bool {
    refs.iter().any(|r| r.kind == kind && r.name == name)
}

fn workload_pod(pod: Pod) -> WorkloadPod {
    let running = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase == "Running")
        .unwrap_or(false)
        && pod.metadata.deletion_timestamp.is_none();
    WorkloadPod {
        name: pod.metadata.name.unwrap_or_default(),
        namespace: pod.metadata.namespace.unwrap_or_default(),
        node: pod.spec.and_then(|s| s.node_name),
        running,
    }
}

#[async_trait]
impl ClusterView for KubeCluster {
    async fn eligible_nodes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<NodeView>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector_string(selector));
        }
        let nodes = api.list(&params).await?;
        let mut views: Vec<NodeView> = nodes.into_iter().map(node_view).collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(views)
    }

    async fn workload_pods(&self, workload: &WorkloadRef) -> Result<Vec<WorkloadPod>, Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &workload.namespace);
        let all_pods = pods.list(&ListParams::default()).await?;

        let selected: Vec<WorkloadPod> = match workload.kind {
            WorkloadKind::Deployment => {
                // Deployments own pods through ReplicaSets; collect the live
                // ReplicaSet names first.
                let replica_sets: Api<ReplicaSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                let owned_rs: BTreeSet<String> = replica_sets
                    .list(&ListParams::default())
                    .await?
                    .into_iter()
                    .filter(|rs| {
                        rs.metadata
                            .owner_references
                            .as_deref()
                            .map(|refs| owned_by(refs, "Deployment", &workload.name))
                            .unwrap_or(false)
                    })
                    .filter_map(|rs| rs.metadata.name)
                    .collect();

                all_pods
                    .into_iter()
                    .filter(|pod| {
                        pod.metadata
                            .owner_references
                            .as_deref()
                            .map(|refs| {
                                refs.iter().any(|r| {
                                    r.kind == "ReplicaSet" && owned_rs.contains(&r.name)
                                })
                            })
                            .unwrap_or(false)
                    })
                    .map(workload_pod)
                    .collect()
            }
            WorkloadKind::StatefulSet | WorkloadKind::DaemonSet => all_pods
                .into_iter()
                .filter(|pod| {
                    pod.metadata
                        .owner_references
                        .as_deref()
                        .map(|refs| owned_by(refs, workload.kind.as_str(), &workload.name))
                        .unwrap_or(false)
                })
                .map(workload_pod)
                .collect(),
        };

        debug!(
            workload = %workload.name,
            namespace = %workload.namespace,
            count = selected.len(),
            "resolved workload pods"
        );
        Ok(selected)
    }

    async fn node(&self, name: &str) -> Result<Option<NodeView>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.map(node_view))
    }
}

#[async_trait]
impl ClusterWriter for KubeCluster {
    async fn label_node(&self, node: &str, ip: &str) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": {
                "labels": { READY_LABEL: READY_LABEL_VALUE },
                "annotations": { ASSIGNED_IP_ANNOTATION: ip },
            }
        });
        api.patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn unlabel_node(&self, node: &str) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        // Merge-patch nulls delete the keys.
        let patch = serde_json::json!({
            "metadata": {
                "labels": { READY_LABEL: null },
                "annotations": { ASSIGNED_IP_ANNOTATION: null },
            }
        });
        api.patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Already gone is what we wanted.
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_deployment_strategy(
        &self,
        workload: &WorkloadRef,
        strategy: &RolloutStrategy,
    ) -> Result<(), Error> {
        if strategy.is_empty() {
            return Ok(());
        }
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &workload.namespace);

        let mut rolling = serde_json::Map::new();
        if let Some(surge) = &strategy.max_surge {
            rolling.insert("maxSurge".to_string(), serde_json::to_value(surge)?);
        }
        if let Some(unavailable) = &strategy.max_unavailable {
            rolling.insert(
                "maxUnavailable".to_string(),
                serde_json::to_value(unavailable)?,
            );
        }
        let patch = serde_json::json!({
            "spec": {
                "strategy": {
                    "type": "RollingUpdate",
                    "rollingUpdate": serde_json::Value::Object(rolling),
                }
            }
        });
        api.patch(
            &workload.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeSpec, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn make_node(name: &str, unschedulable: bool, zone: Option<&str>) -> Node {
        let mut labels = BTreeMap::new();
        if let Some(zone) = zone {
            labels.insert(ZONE_LABEL.to_string(), zone.to_string());
        }
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(format!("gce://proj/zone-a/{name}")),
                unschedulable: Some(unschedulable),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn make_pod(name: &str, owner_kind: &str, owner_name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: owner_kind.to_string(),
                    name: owner_name.to_string(),
                    uid: "uid".to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("n1".to_string()),
                containers: vec![],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_selector_string_is_deterministic() {
        let selector = BTreeMap::from([
            ("role".to_string(), "pub".to_string()),
            ("arch".to_string(), "amd64".to_string()),
        ]);
        // BTreeMap orders keys, so arch sorts before role.
        assert_eq!(selector_string(&selector), "arch=amd64,role=pub");
        assert_eq!(selector_string(&BTreeMap::new()), "");
    }

    #[test]
    fn test_node_view_extracts_schedulability_and_zone() {
        let view = node_view(make_node("n1", false, Some("zone-a")));
        assert_eq!(view.name, "n1");
        assert!(view.schedulable);
        assert_eq!(view.zone.as_deref(), Some("zone-a"));
        assert_eq!(view.provider_id.as_deref(), Some("gce://proj/zone-a/n1"));

        let cordoned = node_view(make_node("n2", true, None));
        assert!(!cordoned.schedulable);
        assert_eq!(cordoned.zone, None);
    }

    #[test]
    fn test_legacy_zone_label_is_honored() {
        let mut node = make_node("n1", false, None);
        node.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(ZONE_LABEL_LEGACY.to_string(), "old-zone".to_string());
        assert_eq!(node_view(node).zone.as_deref(), Some("old-zone"));
    }

    #[test]
    fn test_owner_matching() {
        let refs = vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "ReplicaSet".to_string(),
            name: "web-abc123".to_string(),
            uid: "uid".to_string(),
            ..Default::default()
        }];
        assert!(owned_by(&refs, "ReplicaSet", "web-abc123"));
        assert!(!owned_by(&refs, "ReplicaSet", "other"));
        assert!(!owned_by(&refs, "StatefulSet", "web-abc123"));
    }

    #[test]
    fn test_workload_pod_running_requires_phase_and_no_deletion() {
        let pod = workload_pod(make_pod("p1", "ReplicaSet", "rs", "Running"));
        assert!(pod.running);
        assert_eq!(pod.node.as_deref(), Some("n1"));

        let pending = workload_pod(make_pod("p2", "ReplicaSet", "rs", "Pending"));
        assert!(!pending.running);

        let mut terminating = make_pod("p3", "ReplicaSet", "rs", "Running");
        terminating.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(!workload_pod(terminating).running);
    }
}
