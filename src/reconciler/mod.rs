//! Per-pool reconciliation engine
//!
//! One tick runs five phases: discover cloud and cluster state, classify
//! nodes, plan an ordered action list, actuate it, and report metrics. The
//! planner lives in [`plan`] and is pure; this module owns the I/O around
//! it.
//!
//! Failure semantics: attach and detach failures abort the remainder of the
//! tick; label, unlabel and evict failures are logged and counted but do not
//! abort. The next tick always starts from scratch - there is no retry state.

pub mod plan;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::cloud::{CloudDriver, DriverError, Drivers, InstanceRef};
use crate::crd::{NetIPAllocation, WorkloadKind};
use crate::error::Error;
use crate::metrics;
use crate::view::{ClusterView, ClusterWriter, WorkloadPod};
use plan::{build_plan, Action, NodeSnapshot, Plan, Snapshot};

/// Result of a successful tick
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TickOutcome {
    /// Number of reserved IPs in the pool
    pub reserved: usize,
    /// IPs attached at the end of the tick
    pub attached: usize,
    /// IPs left unattached (no free eligible node)
    pub unattached: usize,
    /// Actions actually issued this tick
    pub actions: usize,
    /// Wall-clock duration of the tick
    pub duration: Duration,
}

impl TickOutcome {
    /// Pool health: every reserved IP is attached
    pub fn healthy(&self) -> bool {
        self.reserved == self.attached
    }
}

/// The per-pool reconcile engine
pub struct Reconciler {
    drivers: Arc<Drivers>,
    view: Arc<dyn ClusterView>,
    writer: Arc<dyn ClusterWriter>,
}

impl Reconciler {
    /// Create a reconciler over the given seams
    pub fn new(
        drivers: Arc<Drivers>,
        view: Arc<dyn ClusterView>,
        writer: Arc<dyn ClusterWriter>,
    ) -> Self {
        Self {
            drivers,
            view,
            writer,
        }
    }

    /// Run one tick for a pool
    ///
    /// Deterministic for a fixed snapshot of cluster and cloud state; safe
    /// to call repeatedly (idempotent once converged).
    pub async fn reconcile(&self, pool: &NetIPAllocation) -> Result<TickOutcome, Error> {
        let name = pool.name_any();
        let start = Instant::now();
        match self.run_tick(pool, &name).await {
            Ok(mut outcome) => {
                outcome.duration = start.elapsed();
                metrics::observe_tick(&name, outcome.duration, true);
                metrics::set_pool_gauges(&name, &outcome);
                info!(
                    pool = %name,
                    reserved = outcome.reserved,
                    attached = outcome.attached,
                    unattached = outcome.unattached,
                    actions = outcome.actions,
                    healthy = outcome.healthy(),
                    "tick complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                metrics::observe_tick(&name, start.elapsed(), false);
                metrics::record_tick_error(&name, e.kind());
                metrics::set_pool_health(&name, false);
                Err(e)
            }
        }
    }

    async fn run_tick(&self, pool: &NetIPAllocation, name: &str) -> Result<TickOutcome, Error> {
        let spec = &pool.spec;
        spec.validate(name)?;

        // An empty pool reconciles as a healthy no-op.
        if spec.reserved_ips.is_empty() {
            return Ok(TickOutcome {
                reserved: 0,
                attached: 0,
                unattached: 0,
                actions: 0,
                duration: Duration::ZERO,
            });
        }

        let driver = self.drivers.for_provider(spec.cloud.provider);
        let workload = spec.workload();

        // Phase 1 - discover. One snapshot per tick: nodes, workload pods,
        // then the cloud's view of each node.
        let selector = spec.selector();
        let nodes = self.view.eligible_nodes(&selector).await?;
        let pods: Vec<WorkloadPod> = match &workload {
            Some(w) => self.view.workload_pods(w).await?,
            None => Vec::new(),
        };

        let reserved: BTreeSet<&str> = spec.reserved_ips.iter().map(String::as_str).collect();
        let mut snapshot_nodes = Vec::with_capacity(nodes.len());
        for node in nodes {
            let instance = node.instance_ref();
            let (pool_ips, foreign_ips): (BTreeSet<String>, BTreeSet<String>) = match &instance {
                Some(instance) => {
                    let ips = driver.get_external_ips(instance).await.map_err(|e| {
                        Error::driver(name, "", &node.name, e)
                    })?;
                    ips.into_iter()
                        .partition(|ip| reserved.contains(ip.as_str()))
                }
                None => {
                    warn!(pool = %name, node = %node.name, "node has no usable providerID");
                    (BTreeSet::new(), BTreeSet::new())
                }
            };
            let running_pods: Vec<WorkloadPod> = pods
                .iter()
                .filter(|p| p.running && p.node.as_deref() == Some(node.name.as_str()))
                .cloned()
                .collect();
            snapshot_nodes.push(NodeSnapshot {
                has_instance: instance.is_some(),
                node,
                pool_ips,
                foreign_ips,
                running_pods,
            });
        }

        let snapshot = Snapshot {
            pool: name.to_string(),
            reserved: spec.reserved_ips.clone(),
            zones: spec.zones(),
            nodes: snapshot_nodes,
        };

        // Phases 2 + 3 - classify and plan, pure and deterministic.
        let plan = build_plan(&snapshot);
        debug!(pool = %name, actions = plan.actions.len(), "plan built");

        // Phase 4 - actuate.
        let attached = self
            .actuate(name, &snapshot, &plan, driver.as_ref())
            .await?;

        // Recovered behavior: keep the Deployment's rollout strategy in
        // sync with the pool spec. Never fatal.
        if let (Some(strategy), Some(workload)) = (&spec.strategy, &workload) {
            if workload.kind == WorkloadKind::Deployment && !strategy.is_empty() {
                if let Err(e) = self
                    .writer
                    .patch_deployment_strategy(workload, strategy)
                    .await
                {
                    warn!(pool = %name, workload = %workload.name, error = %e,
                        "failed to patch deployment strategy");
                }
            }
        }

        // Phase 5 - report.
        let reserved_count = spec.reserved_ips.len();
        for ip in &spec.reserved_ips {
            metrics::set_ip_attached(name, ip, attached.contains(ip));
        }
        Ok(TickOutcome {
            reserved: reserved_count,
            attached: attached.len(),
            unattached: reserved_count - attached.len(),
            actions: plan.actions.len(),
            duration: Duration::ZERO,
        })
    }

    /// Execute the plan sequentially; returns the set of IPs attached at the
    /// end of the tick
    async fn actuate(
        &self,
        pool: &str,
        snapshot: &Snapshot,
        plan: &Plan,
        driver: &dyn CloudDriver,
    ) -> Result<BTreeSet<String>, Error> {
        let instance_of = |node: &str| -> Option<InstanceRef> {
            snapshot
                .nodes
                .iter()
                .find(|ns| ns.node.name == node)
                .and_then(|ns| ns.node.instance_ref())
        };

        let mut attached: BTreeSet<String> = plan.retained.keys().cloned().collect();

        for action in &plan.actions {
            match action {
                Action::Evict {
                    node,
                    namespace,
                    pod,
                } => match self.writer.delete_pod(namespace, pod).await {
                    Ok(()) => {
                        info!(pool, node = %node, pod = %pod, "evicted workload pod");
                        metrics::observe_evict(pool, true);
                    }
                    Err(e) => {
                        warn!(pool, node = %node, pod = %pod, error = %e, "pod eviction failed");
                        metrics::observe_evict(pool, false);
                    }
                },
                Action::Detach { node, ip } => {
                    let instance = instance_of(node).ok_or_else(|| {
                        Error::internal("reconciler", format!("no instance ref for node {node}"))
                    })?;
                    match driver.detach_ip(&instance, ip).await {
                        Ok(()) | Err(DriverError::NotAttached(_)) => {
                            info!(pool, node = %node, ip = %ip, "detached ip");
                            metrics::observe_detach(pool, true);
                        }
                        Err(e) => {
                            metrics::observe_detach(pool, false);
                            return Err(Error::driver(pool, ip, node, e));
                        }
                    }
                }
                Action::Attach { node, ip } => {
                    let instance = instance_of(node).ok_or_else(|| {
                        Error::internal("reconciler", format!("no instance ref for node {node}"))
                    })?;
                    match driver.attach_ip(&instance, ip).await {
                        Ok(()) | Err(DriverError::AlreadyAttached(_)) => {
                            info!(pool, node = %node, ip = %ip, "attached ip");
                            metrics::observe_attach(pool, true);
                            attached.insert(ip.clone());
                        }
                        Err(e) => {
                            metrics::observe_attach(pool, false);
                            return Err(Error::driver(pool, ip, node, e));
                        }
                    }
                }
                Action::Label { node, ip } => match self.writer.label_node(node, ip).await {
                    Ok(()) => {
                        debug!(pool, node = %node, ip = %ip, "labeled node");
                        metrics::observe_label(pool, true);
                    }
                    Err(e) => {
                        warn!(pool, node = %node, error = %e, "node labeling failed");
                        metrics::observe_label(pool, false);
                    }
                },
                Action::Unlabel { node } => match self.writer.unlabel_node(node).await {
                    Ok(()) => {
                        debug!(pool, node = %node, "unlabeled node");
                        metrics::observe_label(pool, true);
                    }
                    Err(e) => {
                        warn!(pool, node = %node, error = %e, "node unlabeling failed");
                        metrics::observe_label(pool, false);
                    }
                },
            }
        }

        Ok(attached)
    }
}
