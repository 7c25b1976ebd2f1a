//! SessionGuard binary
//!
//! Runs the filtering loop and takes operator commands on stdin.

use sessionguard::control::{Command, ControlSurface, Reply, HELP};
use sessionguard::{GuardRuntime, GuardSettings};
use sessionguard_common::{config::Config, telemetry, Metrics};
use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread;
use tokio::signal;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

const SERVICE_NAME: &str = "sessionguard";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load(SERVICE_NAME)?;

    // Initialize telemetry
    telemetry::init(SERVICE_NAME, &config.telemetry)?;

    info!(
        "Starting {} v{} ({})",
        SERVICE_NAME,
        env!("CARGO_PKG_VERSION"),
        config.environment
    );

    let settings = GuardSettings::load(SERVICE_NAME)?;
    let metrics = Metrics::from_config(&config.metrics);
    if !metrics.is_enabled() {
        info!("Metrics collection disabled");
    }
    let runtime = GuardRuntime::from_settings(&settings, metrics)?;
    info!(filter = %runtime.filter(), "Capture filter");

    let opened = match runtime.open_capture() {
        Ok(opened) => opened,
        Err(e) => {
            error!(error = %e, code = e.error_code(), "Cannot open packet capture");
            return Err(e.into());
        }
    };
    let sink = match opened.tap {
        Some(tap) => {
            warn!("Running on the loopback backend; no live traffic is filtered");
            Some(tap.spawn_sink()?)
        }
        None => None,
    };

    let handle = runtime.start(opened.capture)?;
    let control = Arc::new(runtime.control());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (quit_tx, quit_rx) = oneshot::channel();
    spawn_console(Arc::clone(&control), quit_tx)?;
    let periodic_handle = spawn_periodic_tasks(Arc::clone(&control), shutdown_rx);

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        Ok(()) = quit_rx => info!("Console requested shutdown"),
    }

    let _ = shutdown_tx.send(true);
    periodic_handle.abort();

    match tokio::task::spawn_blocking(move || handle.shutdown()).await? {
        Ok(report) => info!(
            reason = ?report.reason,
            stats = %report.stats,
            "Filtering loop finished"
        ),
        Err(e) => error!(error = %e, "Filtering loop ended with an error"),
    }
    if let Some(sink) = sink {
        match sink.join() {
            Ok(discarded) => debug!(discarded, "Loopback re-injections discarded"),
            Err(_) => warn!("Loopback sink panicked"),
        }
    }

    let whitelist = control.whitelist();
    info!(entries = whitelist.len(), "Final whitelist");
    for entry in &whitelist {
        info!(
            address = %entry.address,
            label = entry.label.as_deref().unwrap_or(""),
            added_at = %entry.added_at,
            "Whitelist entry"
        );
    }

    info!("SessionGuard shutdown complete");
    Ok(())
}

/// Read operator commands from stdin.
///
/// Runs on a plain thread so a pending read never holds up runtime shutdown.
fn spawn_console(
    control: Arc<ControlSurface>,
    quit_tx: oneshot::Sender<()>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            println!("{}", HELP);
            for line in io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to read console input");
                        return;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                match Command::parse(&line) {
                    Ok(command) => match control.execute(command) {
                        Reply::Message(message) => println!("{}", message),
                        Reply::Quit => {
                            let _ = quit_tx.send(());
                            return;
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, code = e.error_code(), "Rejected console command");
                        println!("error: {}", e);
                    }
                }
            }
            info!("Console input closed");
        })?;
    Ok(())
}

/// Prune expired activity and refresh gauges
fn spawn_periodic_tasks(
    control: Arc<ControlSurface>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(15));

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Periodic tasks shutting down");
                        break;
                    }
                }
                _ = interval.tick() => {
                    control.refresh_gauges();
                    let status = control.status();
                    debug!(%status, "Guard status");
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C signal"),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGTERM signal"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
