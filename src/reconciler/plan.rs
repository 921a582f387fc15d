//! Pure planning core of the reconcile loop
//!
//! [`build_plan`] turns an immutable snapshot of pool, nodes and cloud state
//! into an ordered action list. It performs no I/O and is fully
//! deterministic: identical snapshots produce byte-identical plans, which is
//! what makes multi-replica deployments safe to reason about.

use std::collections::{BTreeMap, BTreeSet};

use crate::view::{NodeView, WorkloadPod};

/// One eligible node joined with its observed cloud state
#[derive(Clone, Debug, Default)]
pub struct NodeSnapshot {
    /// The node as seen by the cluster view
    pub node: NodeView,
    /// True when the node's providerID parsed into a usable instance ref;
    /// nodes without one can never be attach targets
    pub has_instance: bool,
    /// External IPs on the node that belong to the pool's reserved list
    pub pool_ips: BTreeSet<String>,
    /// External IPs on the node that do not belong to the pool
    pub foreign_ips: BTreeSet<String>,
    /// Running workload pods scheduled on this node
    pub running_pods: Vec<WorkloadPod>,
}

/// Immutable input to [`build_plan`]
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// Pool name, for logging
    pub pool: String,
    /// Reserved IPs in spec order
    pub reserved: Vec<String>,
    /// Preferred zones in priority order
    pub zones: Vec<String>,
    /// Eligible nodes
    pub nodes: Vec<NodeSnapshot>,
}

/// A single planned mutation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Delete a workload pod so its controller reschedules it
    Evict {
        /// Node the pod runs on
        node: String,
        /// Pod namespace
        namespace: String,
        /// Pod name
        pod: String,
    },
    /// Detach an IP from a node at the cloud level
    Detach {
        /// Node holding the IP
        node: String,
        /// IP to detach
        ip: String,
    },
    /// Remove the ready label and bound-IP record from a node
    Unlabel {
        /// Node to unlabel
        node: String,
    },
    /// Attach an IP to a node at the cloud level
    Attach {
        /// Target node
        node: String,
        /// IP to attach
        ip: String,
    },
    /// Set the ready label and bound-IP record on a node
    Label {
        /// Node to label
        node: String,
        /// IP recorded as bound
        ip: String,
    },
}

/// Output of the planning phase
#[derive(Clone, Debug, Default)]
pub struct Plan {
    /// Ordered action list; evictions, then detach-side work, then
    /// attach-side work
    pub actions: Vec<Action>,
    /// IP -> node bindings kept as-is this tick (healthy bound nodes and
    /// cordoned nodes still holding workload pods)
    pub retained: BTreeMap<String, String>,
    /// Reserved IPs that stay unattached because no eligible schedulable
    /// node is free; reported via metrics, not an error
    pub shortfall: Vec<String>,
}

impl Plan {
    /// True when the pool is already converged
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Compute the action list for one tick
///
/// Ordering guarantees: evictions first, then every detach (with its
/// unlabel), then label cleanups, then every attach (with its label), then
/// self-heal labels. Within each group actions are ordered by (node, ip)
/// ascending. Detaches strictly precede attaches so the cloud never sees a
/// second binding of the same IP.
pub fn build_plan(snap: &Snapshot) -> Plan {
    let mut nodes: Vec<&NodeSnapshot> = snap.nodes.iter().collect();
    nodes.sort_by(|a, b| a.node.name.cmp(&b.node.name));

    // Nodes drained because their claim marker is stale: they advertise a
    // bound IP they no longer hold while carrying a foreign one.
    let mut evicted: BTreeSet<&str> = BTreeSet::new();
    let mut evict_actions = Vec::new();
    for ns in &nodes {
        if ns.foreign_ips.is_empty() || !ns.node.has_ready_label() {
            continue;
        }
        let Some(claimed) = ns.node.assigned_ip() else {
            continue;
        };
        let still_holds = ns.pool_ips.contains(claimed) || ns.foreign_ips.contains(claimed);
        if still_holds {
            continue;
        }
        evicted.insert(ns.node.name.as_str());
        let mut pods: Vec<&WorkloadPod> = ns.running_pods.iter().collect();
        pods.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        for pod in pods {
            evict_actions.push(Action::Evict {
                node: ns.node.name.clone(),
                namespace: pod.namespace.clone(),
                pod: pod.name.clone(),
            });
        }
    }

    // Cordoned bound nodes split into drainable and pod-holding.
    let mut detach_actions = Vec::new();
    let mut retained: BTreeMap<String, String> = BTreeMap::new();
    for ns in &nodes {
        if ns.pool_ips.is_empty() {
            continue;
        }
        if ns.node.schedulable {
            for ip in &ns.pool_ips {
                retained.insert(ip.clone(), ns.node.name.clone());
            }
        } else if ns.running_pods.is_empty() {
            // Drainable: the workload has left, release the binding.
            for ip in &ns.pool_ips {
                detach_actions.push(Action::Detach {
                    node: ns.node.name.clone(),
                    ip: ip.clone(),
                });
            }
            detach_actions.push(Action::Unlabel {
                node: ns.node.name.clone(),
            });
        } else {
            // Pod-holding: the IP stays until the workload leaves.
            for ip in &ns.pool_ips {
                retained.insert(ip.clone(), ns.node.name.clone());
            }
        }
    }

    // Reserved IPs with no surviving binding, in spec order.
    let unattached: Vec<&String> = snap
        .reserved
        .iter()
        .filter(|ip| !retained.contains_key(*ip))
        .collect();

    // Attach targets: schedulable, free of pool IPs, addressable, and not
    // mid-eviction. Zone preference ranks targets by position in the pool's
    // zone list, then by name.
    let zone_rank = |ns: &NodeSnapshot| -> usize {
        ns.node
            .zone
            .as_deref()
            .and_then(|zone| snap.zones.iter().position(|z| z == zone))
            .unwrap_or(usize::MAX)
    };
    let mut targets: Vec<&NodeSnapshot> = nodes
        .iter()
        .filter(|ns| {
            ns.node.schedulable
                && ns.pool_ips.is_empty()
                && ns.has_instance
                && !evicted.contains(ns.node.name.as_str())
        })
        .copied()
        .collect();
    targets.sort_by(|a, b| {
        zone_rank(a)
            .cmp(&zone_rank(b))
            .then_with(|| a.node.name.cmp(&b.node.name))
    });

    let mut attach_actions = Vec::new();
    let mut attach_targets: BTreeSet<&str> = BTreeSet::new();
    for (ip, target) in unattached.iter().zip(targets.iter()) {
        attach_targets.insert(target.node.name.as_str());
        attach_actions.push(Action::Attach {
            node: target.node.name.clone(),
            ip: (*ip).clone(),
        });
        attach_actions.push(Action::Label {
            node: target.node.name.clone(),
            ip: (*ip).clone(),
        });
    }
    let shortfall: Vec<String> = unattached
        .iter()
        .skip(targets.len())
        .map(|ip| (*ip).clone())
        .collect();

    // Stale labels on nodes that hold no pool IP and receive no attach.
    let mut cleanup_actions = Vec::new();
    for ns in &nodes {
        if ns.pool_ips.is_empty()
            && ns.node.has_ready_label()
            && !attach_targets.contains(ns.node.name.as_str())
        {
            cleanup_actions.push(Action::Unlabel {
                node: ns.node.name.clone(),
            });
        }
    }

    // Self-heal: healthy bound nodes whose label or claim marker is wrong.
    let mut heal_actions = Vec::new();
    for ns in &nodes {
        if !ns.node.schedulable || ns.pool_ips.is_empty() {
            continue;
        }
        let claim_ok = ns
            .node
            .assigned_ip()
            .map(|ip| ns.pool_ips.contains(ip))
            .unwrap_or(false);
        if ns.node.has_ready_label() && claim_ok {
            continue;
        }
        let ip = ns
            .node
            .assigned_ip()
            .filter(|ip| ns.pool_ips.contains(*ip))
            .map(String::from)
            .or_else(|| ns.pool_ips.iter().next().cloned());
        if let Some(ip) = ip {
            heal_actions.push(Action::Label {
                node: ns.node.name.clone(),
                ip,
            });
        }
    }

    let mut actions = evict_actions;
    actions.extend(detach_actions);
    actions.extend(cleanup_actions);
    actions.extend(attach_actions);
    actions.extend(heal_actions);

    Plan {
        actions,
        retained,
        shortfall,
    }
}
