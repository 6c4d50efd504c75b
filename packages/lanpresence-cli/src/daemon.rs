//! Background daemon mode for continuous presence sweeps.
//!
//! This module implements the periodic driver:
//! - Runs a sweep cycle immediately, then on a fixed interval
//! - Never overlaps cycles: a tick that fires mid-cycle is dropped
//!   with a warning, not queued
//! - Handles graceful shutdown via SIGTERM/SIGINT, waiting out the
//!   in-flight cycle within a grace period

use anyhow::Result;
use lanpresence_core::config::{AgentConfig, SHUTDOWN_GRACE_SECS};
use lanpresence_core::notify::{self, TracingNotifier};
use lanpresence_core::scanner::{self, ProbeMethod};
use lanpresence_core::tracker::{Medium, Tracker};
use lanpresence_core::CollectorClient;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration};

pub struct DaemonOptions {
    pub ssid: String,
    pub interface: String,
    pub method: ProbeMethod,
    /// Push reports to the remote collector instead of reconciling
    /// them in-process.
    pub push: bool,
}

/// Where a cycle's reports end up.
enum ReportSink {
    Remote(CollectorClient),
    Local {
        tracker: tokio::sync::Mutex<Tracker>,
        notifier: TracingNotifier,
    },
}

/// Run the periodic sweep driver until terminated.
pub async fn run_daemon(options: DaemonOptions, config: AgentConfig) -> Result<()> {
    let shutdown = Arc::new(Notify::new());
    setup_signal_handlers(shutdown.clone());
    run_until_shutdown(options, config, shutdown).await
}

async fn run_until_shutdown(
    options: DaemonOptions,
    config: AgentConfig,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let sink = if options.push {
        tracing::info!(
            "Daemon pushing to collector at {} ({})",
            config.collector_url,
            config.collector_url_source
        );
        ReportSink::Remote(CollectorClient::new(&config.collector_url)?)
    } else {
        let mut tracker = Tracker::new();
        let registered = tracker.register_network(&options.ssid, "", Medium::Wifi)?;
        tracing::info!(
            "Daemon tracking `{}` in-process (join secret: {})",
            registered.ssid,
            registered.join_secret
        );
        ReportSink::Local {
            tracker: tokio::sync::Mutex::new(tracker),
            notifier: TracingNotifier,
        }
    };
    let sink = Arc::new(sink);

    tracing::info!(
        "Starting daemon: sweeping `{}` on {} every {}s",
        options.ssid,
        options.interface,
        config.sweep_interval.as_secs()
    );

    // First tick fires immediately.
    let mut ticker = interval(config.sweep_interval);
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                tracing::info!("Shutdown requested, stopping daemon");
                break;
            }
            _ = ticker.tick() => {
                if cycle_still_running(&in_flight) {
                    tracing::warn!("Previous sweep cycle still running, dropping this tick");
                    continue;
                }

                let ssid = options.ssid.clone();
                let interface = options.interface.clone();
                let method = options.method;
                let sweep_options = config.sweep_options.clone();
                let sink = sink.clone();
                in_flight = Some(tokio::spawn(async move {
                    run_one_cycle(&ssid, &interface, method, &sweep_options, &sink).await;
                }));
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    // Let the in-flight cycle finish; individual probes cannot be
    // interrupted mid-flight, so past the grace period we abandon it.
    if let Some(handle) = in_flight {
        if !handle.is_finished() {
            tracing::info!(
                "Waiting up to {}s for the in-flight cycle to finish",
                SHUTDOWN_GRACE_SECS
            );
            if timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), handle)
                .await
                .is_err()
            {
                tracing::warn!("In-flight cycle did not finish in time, abandoning it");
            }
        }
    }

    tracing::info!("Daemon stopped");
    Ok(())
}

fn cycle_still_running(in_flight: &Option<JoinHandle<()>>) -> bool {
    in_flight.as_ref().is_some_and(|handle| !handle.is_finished())
}

/// One sweep cycle plus report delivery. Failures are logged and
/// absorbed; the next tick always gets its chance.
async fn run_one_cycle(
    ssid: &str,
    interface: &str,
    method: ProbeMethod,
    sweep_options: &scanner::SweepOptions,
    sink: &ReportSink,
) {
    let reports = match scanner::run_cycle(ssid, interface, method, sweep_options).await {
        Ok(reports) => reports,
        Err(e) => {
            tracing::error!("Sweep cycle failed: {:#}", e);
            return;
        }
    };

    match sink {
        ReportSink::Remote(client) => {
            if let Err(e) = client.push_reports(&reports).await {
                tracing::error!("Failed to push reports: {:#}", e);
            }
        }
        ReportSink::Local { tracker, notifier } => {
            let mut tracker = tracker.lock().await;
            // Cycle-scoped ingestion: an empty sweep still counts a
            // missed heartbeat against every open session.
            match tracker.ingest_cycle(ssid, &reports, chrono::Utc::now()) {
                Ok(changes) => {
                    notify::dispatch(notifier, &tracker, ssid, &changes).await;
                }
                Err(e) => tracing::error!("Reconciliation failed: {}", e),
            }
        }
    }
}

/// Set up SIGTERM and SIGINT handlers for graceful shutdown. The
/// `Notify` wakes the driver loop immediately, even mid-interval.
fn setup_signal_handlers(shutdown: Arc<Notify>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let shutdown_term = shutdown.clone();
        tokio::spawn(async move {
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM");
                shutdown_term.notify_one();
            }
        });

        let shutdown_int = shutdown;
        tokio::spawn(async move {
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT");
                shutdown_int.notify_one();
            }
        });
    }

    #[cfg(not(unix))]
    {
        // On non-Unix platforms, rely on tokio::signal::ctrl_c() in the main loop
        let _ = shutdown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overlap_detection_tracks_task_completion() {
        assert!(!cycle_still_running(&None));

        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        let in_flight = Some(handle);
        assert!(cycle_still_running(&in_flight));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!cycle_still_running(&in_flight));
    }

    #[tokio::test]
    async fn shutdown_signal_interrupts_the_interval_wait() {
        let mut config = AgentConfig::default();
        // An interval far longer than the test: the loop must react
        // to the shutdown signal without waiting for the next tick.
        config.sweep_interval = Duration::from_secs(3600);

        let options = DaemonOptions {
            ssid: "TestNet".to_string(),
            interface: "does-not-exist0".to_string(),
            method: ProbeMethod::Icmp,
            push: false,
        };

        let shutdown = Arc::new(Notify::new());
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.notify_one();
        });

        let result = timeout(
            Duration::from_secs(10),
            run_until_shutdown(options, config, shutdown),
        )
        .await;
        assert!(result.is_ok(), "daemon kept waiting for the next tick");
    }
}
