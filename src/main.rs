//! NetIP operator entry point
//!
//! Startup: parse configuration, initialize logging, start the health and
//! metrics listeners, then loop on leader election. While leading, the pool
//! supervisor watches NetIPAllocation resources and runs one reconcile
//! ticker per pool; losing the lease cancels every ticker and the process
//! falls back to observer mode until it re-acquires.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use netip_operator::cloud::Drivers;
use netip_operator::config::Config;
use netip_operator::crd::NetIPAllocation;
use netip_operator::leader::{annotate_leader_pod, ElectionHeartbeat, LeaderElector, LeaseTiming};
use netip_operator::reconciler::Reconciler;
use netip_operator::runtime::run_pools;
use netip_operator::server::{run_health_server, run_metrics_server, HealthState};
use netip_operator::view::KubeCluster;
use netip_operator::{metrics, Error, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    if config.crd {
        let crd = serde_yaml::to_string(&NetIPAllocation::crd())
            .map_err(|e| Error::internal("main", format!("serializing CRD: {e}")))?;
        print!("{crd}");
        return Ok(());
    }

    init_logging(&config);

    let identity = config.identity();
    let namespace = config.namespace();
    info!(
        version = %config.controller_version,
        identity = %identity,
        namespace = %namespace,
        lease = %config.lease_name,
        "netip-operator starting"
    );

    let client = Client::try_default().await?;

    let heartbeat = ElectionHeartbeat::default();
    let health = Arc::new(HealthState::new(config.lease_duration, heartbeat.clone()));

    // Health and metrics serve in leader and observer mode alike.
    let health_state = health.clone();
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_state).await {
            error!(error = %e, "health server exited");
        }
    });
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_port).await {
            error!(error = %e, "metrics server exited");
        }
    });

    metrics::set_controller_info(
        &config.controller_version,
        &identity,
        config.cluster_name.as_deref().unwrap_or(""),
    );
    metrics::set_is_leader(&identity, false);
    metrics::set_ready(&identity, false);

    // Mirror readiness into the gauge for leaders and followers alike.
    {
        let health = health.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                metrics::set_ready(&identity, health.readiness().is_ok());
            }
        });
    }

    let cluster = Arc::new(KubeCluster::new(client.clone()));
    let drivers = Arc::new(
        Drivers::new(Duration::from_secs(config.cloud_timeout_secs))
            .map_err(|e| Error::internal("main", format!("building cloud drivers: {e}")))?,
    );
    let reconciler = Arc::new(Reconciler::new(drivers, cluster.clone(), cluster));

    let elector = Arc::new(LeaderElector::new(
        client.clone(),
        &config.lease_name,
        &namespace,
        &identity,
        LeaseTiming::from_secs(config.lease_duration, config.lease_skew_grace),
        heartbeat,
    ));

    loop {
        // Observer mode: wait for the lease or for shutdown.
        let mut guard = tokio::select! {
            guard = elector.clone().acquire() => guard,
            _ = shutdown_signal() => break,
        };

        metrics::set_is_leader(&identity, true);
        health.set_leader(true);
        annotate_leader_pod(&client, &namespace, &identity, true).await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let supervisor = tokio::spawn(run_pools(
            client.clone(),
            reconciler.clone(),
            health.clone(),
            cancel_rx,
        ));

        let shutting_down = tokio::select! {
            _ = guard.lost() => {
                warn!(identity = %identity, "leadership lost, cancelling pool tasks");
                false
            }
            _ = shutdown_signal() => {
                info!("shutdown requested");
                true
            }
        };

        // Cooperative teardown: in-flight cloud calls complete to their
        // timeout, post-tick writes are suppressed by cancellation. A final
        // write from this stepped-down leader is harmless - everything it
        // does is idempotent.
        let _ = cancel_tx.send(true);
        let _ = supervisor.await;
        drop(guard);

        health.set_leader(false);
        metrics::set_is_leader(&identity, false);
        annotate_leader_pod(&client, &namespace, &identity, false).await;

        if shutting_down {
            break;
        }
    }

    info!("netip-operator stopped");
    Ok(())
}

/// Resolve on SIGTERM or ctrl-c
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sig) => sig,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,netip_operator=debug,kube=info,tower=warn,hyper=warn")
    });

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
