//! Pool supervision
//!
//! While this replica leads, [`run_pools`] watches NetIPAllocation
//! resources and keeps one ticker task per pool alive. Pool tasks are
//! independent: each owns its interval timer, reconciles sequentially (ticks
//! never overlap within a pool) and survives failed ticks. Cancellation is
//! cooperative through a watch channel; losing leadership or shutting down
//! cancels every task.

use std::collections::HashMap;
use std::sync::Arc;

use futures::TryStreamExt;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::crd::NetIPAllocation;
use crate::reconciler::Reconciler;
use crate::server::HealthState;
use crate::Result;

struct PoolTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
    spec_json: String,
}

impl PoolTask {
    fn stop(self) {
        let _ = self.cancel.send(true);
        // The task breaks out of its select promptly; no need to join.
    }
}

/// Watch pools and run their reconcile tickers until `shutdown` fires
///
/// Returns when the shutdown signal fires or the watch stream ends; the
/// caller decides whether to restart.
pub async fn run_pools(
    client: Client,
    reconciler: Arc<Reconciler>,
    health: Arc<HealthState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let api: Api<NetIPAllocation> = Api::all(client);
    let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());
    let mut tasks: HashMap<String, PoolTask> = HashMap::new();

    info!("pool supervisor started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("pool supervisor shutting down");
                break;
            }
            event = stream.try_next() => match event {
                Ok(Some(watcher::Event::Init)) => {}
                Ok(Some(watcher::Event::InitApply(pool)))
                | Ok(Some(watcher::Event::Apply(pool))) => {
                    upsert_pool(&mut tasks, pool, &reconciler, &health);
                }
                Ok(Some(watcher::Event::InitDone)) => {
                    info!(pools = tasks.len(), "pool watcher synced");
                    health.set_synced(true);
                    if tasks.is_empty() {
                        // Nothing to reconcile; the first tick is vacuously
                        // complete.
                        health.set_first_tick_done();
                    }
                }
                Ok(Some(watcher::Event::Delete(pool))) => {
                    let name = pool.name_any();
                    if let Some(task) = tasks.remove(&name) {
                        info!(pool = %name, "pool deleted, stopping its task");
                        task.stop();
                    }
                }
                Ok(None) => {
                    warn!("pool watch stream ended");
                    break;
                }
                Err(e) => {
                    // The backoff adapter already paced the retry.
                    warn!(error = %e, "pool watch error");
                }
            }
        }
    }

    for (_, task) in tasks.drain() {
        task.stop();
    }
    Ok(())
}

/// Start or restart the ticker task for a pool
///
/// A task is respawned when the spec changed or the previous task exited
/// (an invalid spec parks the task until the resource is edited).
fn upsert_pool(
    tasks: &mut HashMap<String, PoolTask>,
    pool: NetIPAllocation,
    reconciler: &Arc<Reconciler>,
    health: &Arc<HealthState>,
) {
    let name = pool.name_any();
    let spec_json = match serde_json::to_string(&pool.spec) {
        Ok(json) => json,
        Err(e) => {
            error!(pool = %name, error = %e, "pool spec does not serialize");
            return;
        }
    };

    if let Some(existing) = tasks.get(&name) {
        if existing.spec_json == spec_json && !existing.handle.is_finished() {
            debug!(pool = %name, "pool unchanged");
            return;
        }
        if let Some(task) = tasks.remove(&name) {
            info!(pool = %name, "pool changed, restarting its task");
            task.stop();
        }
    } else {
        info!(pool = %name, interval = ?pool.spec.interval(), "starting pool task");
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let handle = tokio::spawn(pool_task(
        pool,
        reconciler.clone(),
        health.clone(),
        cancel_rx,
    ));
    tasks.insert(
        name,
        PoolTask {
            cancel: cancel_tx,
            handle,
            spec_json,
        },
    );
}

/// Tick loop for a single pool
///
/// The interval is polled only after the previous tick returned, so ticks
/// never overlap within a pool. Failed ticks are logged and counted; the
/// next tick retries from scratch. An invalid spec ends the loop - the
/// watcher respawns the task when the resource changes.
async fn pool_task(
    pool: NetIPAllocation,
    reconciler: Arc<Reconciler>,
    health: Arc<HealthState>,
    mut cancel: watch::Receiver<bool>,
) {
    let name = pool.name_any();
    let mut interval = tokio::time::interval(pool.spec.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                debug!(pool = %name, "pool task cancelled");
                return;
            }
            _ = interval.tick() => {
                match reconciler.reconcile(&pool).await {
                    Ok(_) => health.set_first_tick_done(),
                    Err(e) if !e.is_retryable() => {
                        error!(
                            pool = %name,
                            error = %e,
                            error_type = e.kind().as_str(),
                            "pool spec rejected; parking until it changes"
                        );
                        return;
                    }
                    Err(e) => {
                        error!(
                            pool = %name,
                            error = %e,
                            error_type = e.kind().as_str(),
                            "tick failed; retrying next interval"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{Drivers, MockCloudDriver};
    use crate::crd::{CloudProviderKind, CloudSpec, NetIPAllocationSpec};
    use crate::leader::ElectionHeartbeat;
    use crate::view::{MockClusterView, MockClusterWriter};
    use kube::core::ObjectMeta;
    use std::time::Duration;

    fn empty_pool(name: &str) -> NetIPAllocation {
        NetIPAllocation {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: NetIPAllocationSpec {
                reserved_ips: vec![],
                workload_ref: None,
                deployment_ref: None,
                node_selector: None,
                cloud: CloudSpec {
                    provider: CloudProviderKind::Gcp,
                    region: None,
                    zones: None,
                },
                reconcile_interval: Some(1),
                strategy: None,
            },
        }
    }

    fn test_reconciler() -> Arc<Reconciler> {
        Arc::new(Reconciler::new(
            Arc::new(Drivers::uniform(Arc::new(MockCloudDriver::new()))),
            Arc::new(MockClusterView::new()),
            Arc::new(MockClusterWriter::new()),
        ))
    }

    fn test_health() -> Arc<HealthState> {
        let heartbeat = ElectionHeartbeat::default();
        heartbeat.beat();
        Arc::new(HealthState::new(60, heartbeat))
    }

    /// Story: a pool task ticks immediately and marks the first tick done
    #[tokio::test]
    async fn story_pool_task_runs_first_tick_immediately() {
        let health = test_health();
        health.set_leader(true);
        health.set_synced(true);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(pool_task(
            empty_pool("p"),
            test_reconciler(),
            health.clone(),
            cancel_rx,
        ));

        // The first interval tick fires immediately; give it a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(health.readiness().is_ok());

        let _ = cancel_tx.send(true);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task should stop on cancel")
            .expect("task should not panic");
    }

    /// Story: cancellation stops a pool task promptly
    #[tokio::test]
    async fn story_cancellation_is_cooperative() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(pool_task(
            empty_pool("p"),
            test_reconciler(),
            test_health(),
            cancel_rx,
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = cancel_tx.send(true);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task should stop on cancel")
            .expect("task should not panic");
    }

    /// Story: an invalid spec parks the task instead of retrying forever
    #[tokio::test]
    async fn story_invalid_spec_parks_the_task() {
        let mut pool = empty_pool("p");
        pool.spec.reserved_ips = vec!["34.1.1.1".to_string(), "34.1.1.1".to_string()];
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(pool_task(
            pool,
            test_reconciler(),
            test_health(),
            cancel_rx,
        ));

        // The task must exit on its own after the first rejected tick.
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task should park itself")
            .expect("task should not panic");
    }

    /// Story: spec changes restart a pool's task, unchanged specs do not
    #[tokio::test]
    async fn story_upsert_restarts_only_on_change() {
        let reconciler = test_reconciler();
        let health = test_health();
        let mut tasks = HashMap::new();

        upsert_pool(&mut tasks, empty_pool("p"), &reconciler, &health);
        let first_spec = tasks.get("p").unwrap().spec_json.clone();

        // Same spec: no restart.
        upsert_pool(&mut tasks, empty_pool("p"), &reconciler, &health);
        assert_eq!(tasks.get("p").unwrap().spec_json, first_spec);

        // Changed spec: task replaced.
        let mut changed = empty_pool("p");
        changed.spec.reconcile_interval = Some(5);
        upsert_pool(&mut tasks, changed, &reconciler, &health);
        assert_ne!(tasks.get("p").unwrap().spec_json, first_spec);

        for (_, task) in tasks.drain() {
            task.stop();
        }
    }
}
