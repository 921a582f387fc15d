//! Prometheus metrics for the operator
//!
//! Metric names and label sets are part of the public contract; dashboards
//! and alerts depend on them. Everything registers against the default
//! registry, which the metrics listener encodes as Prometheus text.

use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, register_int_gauge_vec,
    GaugeVec, HistogramVec, IntCounterVec, IntGaugeVec,
};

use crate::error::ErrorKind;
use crate::reconciler::TickOutcome;

const STATUS_OK: &str = "ok";
const STATUS_ERROR: &str = "error";

/// Attach attempts by pool and outcome
///
/// Labels: `pool`, `status` (`ok`/`error`)
pub static IP_ATTACH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ip_attach_total",
        "IP attach operations by pool and status",
        &["pool", "status"]
    )
    .expect("register ip_attach_total")
});

/// Detach attempts by pool and outcome
///
/// Labels: `pool`, `status`
pub static IP_DETACH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ip_detach_total",
        "IP detach operations by pool and status",
        &["pool", "status"]
    )
    .expect("register ip_detach_total")
});

/// Workload pod evictions by pool and outcome
///
/// Labels: `pool`, `status`
pub static POD_EVICT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pod_evict_total",
        "Workload pod evictions by pool and status",
        &["pool", "status"]
    )
    .expect("register pod_evict_total")
});

/// Node label and unlabel writes by pool and outcome
///
/// Labels: `pool`, `status`
pub static NODE_LABEL_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "node_label_total",
        "Node label writes by pool and status",
        &["pool", "status"]
    )
    .expect("register node_label_total")
});

/// Per-IP attachment state (1 bound, 0 unbound)
///
/// Labels: `pool`, `ip`
pub static IP_ATTACHED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ip_attached",
        "Whether a reserved IP is currently attached (1) or not (0)",
        &["pool", "ip"]
    )
    .expect("register ip_attached")
});

/// Reserved IP count per pool
pub static POOL_RESERVED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pool_reserved_ips",
        "Reserved IPs declared by the pool",
        &["pool"]
    )
    .expect("register pool_reserved_ips")
});

/// Attached IP count per pool
pub static POOL_ATTACHED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pool_attached_ips",
        "Reserved IPs currently attached to a node",
        &["pool"]
    )
    .expect("register pool_attached_ips")
});

/// Unattached IP count per pool
pub static POOL_UNATTACHED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pool_unattached_ips",
        "Reserved IPs with no eligible node to hold them",
        &["pool"]
    )
    .expect("register pool_unattached_ips")
});

/// Pool health (1 iff every reserved IP is attached)
pub static POOL_HEALTHY: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pool_healthy",
        "1 when every reserved IP of the pool is attached",
        &["pool"]
    )
    .expect("register pool_healthy")
});

/// Tick duration by pool and result
///
/// Labels: `pool`, `result` (`ok`/`error`)
pub static RECONCILE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconcile_duration_seconds",
        "Duration of reconcile ticks",
        &["pool", "result"]
    )
    .expect("register reconcile_duration_seconds")
});

/// Tick errors by pool and error class
///
/// Labels: `pool`, `error_type`
pub static RECONCILE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "reconcile_errors_total",
        "Reconcile tick errors by pool and error class",
        &["pool", "error_type"]
    )
    .expect("register reconcile_errors_total")
});

/// Leadership state of this replica (1 leader, 0 observer)
///
/// Labels: `pod_name`
pub static CONTROLLER_IS_LEADER: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "controller_is_leader",
        "1 while this replica holds the leader lease",
        &["pod_name"]
    )
    .expect("register controller_is_leader")
});

/// Readiness of this replica
///
/// Labels: `pod_name`
pub static CONTROLLER_READY: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "controller_ready",
        "1 while this replica reports ready",
        &["pod_name"]
    )
    .expect("register controller_ready")
});

/// Build and identity information, constant 1
///
/// Labels: `version`, `pod_name`, `cluster`
pub static CONTROLLER_INFO: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "controller_info",
        "Controller build and identity information",
        &["version", "pod_name", "cluster"]
    )
    .expect("register controller_info")
});

fn status(ok: bool) -> &'static str {
    if ok {
        STATUS_OK
    } else {
        STATUS_ERROR
    }
}

/// Count one attach attempt
pub fn observe_attach(pool: &str, ok: bool) {
    IP_ATTACH_TOTAL.with_label_values(&[pool, status(ok)]).inc();
}

/// Count one detach attempt
pub fn observe_detach(pool: &str, ok: bool) {
    IP_DETACH_TOTAL.with_label_values(&[pool, status(ok)]).inc();
}

/// Count one pod eviction attempt
pub fn observe_evict(pool: &str, ok: bool) {
    POD_EVICT_TOTAL.with_label_values(&[pool, status(ok)]).inc();
}

/// Count one label or unlabel write
pub fn observe_label(pool: &str, ok: bool) {
    NODE_LABEL_TOTAL
        .with_label_values(&[pool, status(ok)])
        .inc();
}

/// Record the duration of a completed tick
pub fn observe_tick(pool: &str, duration: Duration, ok: bool) {
    RECONCILE_DURATION
        .with_label_values(&[pool, status(ok)])
        .observe(duration.as_secs_f64());
}

/// Count one failed tick by error class
pub fn record_tick_error(pool: &str, kind: ErrorKind) {
    RECONCILE_ERRORS
        .with_label_values(&[pool, kind.as_str()])
        .inc();
}

/// Publish the per-pool gauges after a successful tick
pub fn set_pool_gauges(pool: &str, outcome: &TickOutcome) {
    POOL_RESERVED
        .with_label_values(&[pool])
        .set(outcome.reserved as i64);
    POOL_ATTACHED
        .with_label_values(&[pool])
        .set(outcome.attached as i64);
    POOL_UNATTACHED
        .with_label_values(&[pool])
        .set(outcome.unattached as i64);
    set_pool_health(pool, outcome.healthy());
}

/// Publish the pool health gauge
pub fn set_pool_health(pool: &str, healthy: bool) {
    POOL_HEALTHY
        .with_label_values(&[pool])
        .set(i64::from(healthy));
}

/// Publish the attachment state of one reserved IP
pub fn set_ip_attached(pool: &str, ip: &str, attached: bool) {
    IP_ATTACHED
        .with_label_values(&[pool, ip])
        .set(i64::from(attached));
}

/// Publish leadership state
pub fn set_is_leader(pod_name: &str, leader: bool) {
    CONTROLLER_IS_LEADER
        .with_label_values(&[pod_name])
        .set(i64::from(leader));
}

/// Publish readiness state
pub fn set_ready(pod_name: &str, ready: bool) {
    CONTROLLER_READY
        .with_label_values(&[pod_name])
        .set(i64::from(ready));
}

/// Publish build and identity information once at startup
pub fn set_controller_info(version: &str, pod_name: &str, cluster: &str) {
    CONTROLLER_INFO
        .with_label_values(&[version, pod_name, cluster])
        .set(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accept_both_statuses() {
        observe_attach("pool-a", true);
        observe_attach("pool-a", false);
        observe_detach("pool-a", true);
        observe_evict("pool-a", false);
        observe_label("pool-a", true);
        assert!(IP_ATTACH_TOTAL.with_label_values(&["pool-a", "ok"]).get() >= 1);
        assert!(
            IP_ATTACH_TOTAL
                .with_label_values(&["pool-a", "error"])
                .get()
                >= 1
        );
    }

    #[test]
    fn test_pool_gauges_follow_outcome() {
        let outcome = TickOutcome {
            reserved: 3,
            attached: 2,
            unattached: 1,
            actions: 4,
            duration: Duration::from_millis(10),
        };
        set_pool_gauges("pool-b", &outcome);
        assert_eq!(POOL_RESERVED.with_label_values(&["pool-b"]).get(), 3);
        assert_eq!(POOL_ATTACHED.with_label_values(&["pool-b"]).get(), 2);
        assert_eq!(POOL_UNATTACHED.with_label_values(&["pool-b"]).get(), 1);
        assert_eq!(POOL_HEALTHY.with_label_values(&["pool-b"]).get(), 0);
    }

    #[test]
    fn test_ip_and_leadership_gauges() {
        set_ip_attached("pool-c", "34.1.1.1", true);
        assert_eq!(
            IP_ATTACHED.with_label_values(&["pool-c", "34.1.1.1"]).get(),
            1
        );
        set_ip_attached("pool-c", "34.1.1.1", false);
        assert_eq!(
            IP_ATTACHED.with_label_values(&["pool-c", "34.1.1.1"]).get(),
            0
        );

        set_is_leader("pod-1", true);
        assert_eq!(
            CONTROLLER_IS_LEADER.with_label_values(&["pod-1"]).get(),
            1
        );
    }

    #[test]
    fn test_tick_observation_does_not_panic() {
        observe_tick("pool-d", Duration::from_millis(42), true);
        record_tick_error("pool-d", ErrorKind::Conflict);
        assert!(
            RECONCILE_ERRORS
                .with_label_values(&["pool-d", "conflict"])
                .get()
                >= 1
        );
    }
}
