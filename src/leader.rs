//! Leader election using Kubernetes Leases
//!
//! Single-writer election for HA deployments: only the replica holding the
//! lease actuates pools. Non-leaders keep serving health and metrics and
//! report `is_leader=0`.
//!
//! Timing: renewal runs at roughly a third of the lease duration and
//! acquisition retries at a quarter, so an expired lease is taken over well
//! before two replicas could both believe they lead. Expiry checks allow a
//! small clock-skew grace. A stepped-down leader may complete one in-flight
//! write; every operation it issues is idempotent, so the write is harmless.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Error, LEADER_POD_ANNOTATION};

const FIELD_MANAGER: &str = "netip-operator";

/// Timing derived from the configured lease duration
#[derive(Clone, Copy, Debug)]
pub struct LeaseTiming {
    /// How long a renewal keeps the lease valid
    pub duration: Duration,
    /// Renewal period while leading (≈ duration / 3)
    pub renew: Duration,
    /// Acquisition retry period while following (≈ duration / 4)
    pub retry: Duration,
    /// Clock-skew allowance added to expiry checks
    pub skew_grace: Duration,
}

impl LeaseTiming {
    /// Derive timing from a lease duration and skew grace in seconds
    pub fn from_secs(duration_secs: u64, skew_grace_secs: u64) -> Self {
        Self {
            duration: Duration::from_secs(duration_secs),
            renew: Duration::from_secs((duration_secs / 3).max(1)),
            retry: Duration::from_secs((duration_secs / 4).max(1)),
            skew_grace: Duration::from_secs(skew_grace_secs),
        }
    }
}

/// Whether a lease has expired at `now`
///
/// A lease with no renew time or duration counts as expired. The grace term
/// absorbs clock skew between replicas; renew times from the future are
/// treated as fresh.
fn lease_expired(
    renew_time: Option<&DateTime<Utc>>,
    duration_secs: Option<i32>,
    skew_grace: Duration,
    now: DateTime<Utc>,
) -> bool {
    let (Some(renewed), Some(duration)) = (renew_time, duration_secs) else {
        return true;
    };
    if *renewed > now {
        return false;
    }
    let grace = skew_grace.as_secs().max(5);
    now > *renewed + chrono::Duration::seconds(duration as i64 + grace as i64)
}

/// Shared liveness marker for the election loop
///
/// Beaten on every acquisition attempt and renewal; readiness checks treat a
/// stalled election loop as not-ready, matching the health contract.
#[derive(Clone, Default)]
pub struct ElectionHeartbeat(Arc<AtomicI64>);

impl ElectionHeartbeat {
    /// Record that the election loop just ran
    pub fn beat(&self) {
        self.0.store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    /// Whether the loop ran within the last `max_age_secs` seconds
    pub fn fresh_within(&self, max_age_secs: i64) -> bool {
        let last = self.0.load(Ordering::SeqCst);
        last != 0 && Utc::now().timestamp() - last <= max_age_secs
    }
}

/// Leader elector backed by a coordination.k8s.io Lease
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    timing: LeaseTiming,
    is_leader: Arc<AtomicBool>,
    heartbeat: ElectionHeartbeat,
}

impl LeaderElector {
    /// Create an elector for this replica
    pub fn new(
        client: Client,
        lease_name: &str,
        namespace: &str,
        identity: &str,
        timing: LeaseTiming,
        heartbeat: ElectionHeartbeat,
    ) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            timing,
            is_leader: Arc::new(AtomicBool::new(false)),
            heartbeat,
        }
    }

    /// Whether this replica currently believes it leads
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard renews the lease in the background; `lost()` resolves when
    /// renewal fails or another holder takes over.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "waiting for leadership"
        );

        loop {
            match self.try_acquire_lease().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.timing.retry.as_secs(),
                        "lease held by another replica"
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        "failed to acquire lease, retrying"
                    );
                }
            }
            tokio::time::sleep(self.timing.retry).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_lease(&self) -> Result<bool, Error> {
        self.heartbeat.beat();
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        match api.get(&self.lease_name).await {
            Ok(lease) => {
                let spec = lease.spec.as_ref();
                let holder = spec.and_then(|s| s.holder_identity.as_ref());

                if holder == Some(&self.identity) {
                    return self.renew_lease(&api, now).await;
                }

                let renew_time = spec.and_then(|s| s.renew_time.as_ref()).map(|t| t.0);
                let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
                if lease_expired(
                    renew_time.as_ref(),
                    duration_secs,
                    self.timing.skew_grace,
                    now,
                ) {
                    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
                    self.take_over_lease(&api, now, transitions).await
                } else {
                    Ok(false)
                }
            }
            Err(kube::Error::Api(e)) if e.code == 404 => self.create_lease(&api, now).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lease(&self, api: &Api<Lease>, now: DateTime<Utc>) -> Result<bool, Error> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.timing.duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "created leader lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn renew_lease(&self, api: &Api<Lease>, now: DateTime<Utc>) -> Result<bool, Error> {
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": {
                "renewTime": MicroTime(now),
            }
        });

        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;

        debug!(identity = %self.identity, "lease renewed");
        Ok(true)
    }

    async fn take_over_lease(
        &self,
        api: &Api<Lease>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool, Error> {
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": {
                "holderIdentity": self.identity,
                "acquireTime": MicroTime(now),
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": self.timing.duration.as_secs() as i32,
                "leaseTransitions": transitions + 1,
            }
        });

        match api
            .patch(
                &self.lease_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await
        {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    transitions = transitions + 1,
                    "took over expired lease"
                );
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.timing.renew).await;

            match self.try_acquire_lease().await {
                Ok(true) => {} // still leader
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "leadership lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }
}

/// Guard that maintains leadership while it lives
///
/// Dropping the guard aborts renewal and releases the leadership claim
/// locally; the lease itself expires on its own schedule.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        } else {
            // lost() already resolved once; never report leadership twice.
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "leadership released");
    }
}

/// Annotate this replica's pod with its leadership state
///
/// The annotation is a debugging aid (`kubectl get pod` shows the leader at
/// a glance); failures are logged and ignored.
pub async fn annotate_leader_pod(client: &Client, namespace: &str, pod: &str, leader: bool) {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let value = if leader {
        serde_json::Value::String("true".to_string())
    } else {
        serde_json::Value::Null
    };
    let patch = serde_json::json!({
        "metadata": { "annotations": { LEADER_POD_ANNOTATION: value } }
    });
    if let Err(e) = api
        .patch(pod, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        warn!(pod = %pod, error = %e, "failed to patch leader annotation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Expiry Arithmetic Stories
    // =========================================================================

    fn grace() -> Duration {
        Duration::from_secs(2)
    }

    /// Story: a freshly renewed lease is not expired
    #[test]
    fn story_fresh_lease_is_not_expired() {
        let now = Utc::now();
        let renewed = now - chrono::Duration::seconds(10);
        assert!(!lease_expired(Some(&renewed), Some(60), grace(), now));
    }

    /// Story: a lease past duration plus grace has expired
    #[test]
    fn story_stale_lease_expires_after_grace() {
        let now = Utc::now();
        // 60s duration + 5s effective grace; 70s old is past it.
        let renewed = now - chrono::Duration::seconds(70);
        assert!(lease_expired(Some(&renewed), Some(60), grace(), now));
        // 63s old is inside the grace window.
        let renewed = now - chrono::Duration::seconds(63);
        assert!(!lease_expired(Some(&renewed), Some(60), grace(), now));
    }

    /// Story: the grace floor protects against tiny configured values
    ///
    /// A sub-5s skew grace still yields at least 5 seconds of allowance so a
    /// single slow renewal does not trigger a takeover.
    #[test]
    fn story_grace_has_a_floor_of_five_seconds() {
        let now = Utc::now();
        let renewed = now - chrono::Duration::seconds(64);
        assert!(!lease_expired(
            Some(&renewed),
            Some(60),
            Duration::from_secs(0),
            now
        ));
    }

    /// Story: a renew time from the future is trusted, not taken over
    ///
    /// Clock skew can put another replica's renewal slightly ahead of our
    /// clock. Taking the lease over in that situation would create two
    /// leaders.
    #[test]
    fn story_future_renewal_is_not_expired() {
        let now = Utc::now();
        let renewed = now + chrono::Duration::seconds(30);
        assert!(!lease_expired(Some(&renewed), Some(60), grace(), now));
    }

    /// Story: a malformed lease is treated as expired and taken over
    #[test]
    fn story_lease_without_renewal_data_is_expired() {
        let now = Utc::now();
        assert!(lease_expired(None, Some(60), grace(), now));
        let renewed = now;
        assert!(lease_expired(Some(&renewed), None, grace(), now));
    }

    // =========================================================================
    // Timing Derivation
    // =========================================================================

    #[test]
    fn test_timing_derives_renew_and_retry_periods() {
        let timing = LeaseTiming::from_secs(60, 2);
        assert_eq!(timing.duration, Duration::from_secs(60));
        assert_eq!(timing.renew, Duration::from_secs(20));
        assert_eq!(timing.retry, Duration::from_secs(15));
        assert_eq!(timing.skew_grace, Duration::from_secs(2));
    }

    #[test]
    fn test_timing_never_goes_below_one_second() {
        let timing = LeaseTiming::from_secs(2, 0);
        assert_eq!(timing.renew, Duration::from_secs(1));
        assert_eq!(timing.retry, Duration::from_secs(1));
    }

    #[test]
    fn test_heartbeat_freshness() {
        let heartbeat = ElectionHeartbeat::default();
        // Never beaten: stale no matter the window.
        assert!(!heartbeat.fresh_within(3600));
        heartbeat.beat();
        assert!(heartbeat.fresh_within(5));
    }
}
