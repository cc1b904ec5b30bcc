use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;
use watchcow::capture::CaptureBus;
use watchcow::docker::DockerWatcher;
use watchcow::inject::borrow::FdBorrower;
use watchcow::{capture, Config, Orchestrator};

const APP_EVENT_QUEUE: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "watchcow", version)]
#[command(about = "Docker injector for the fnOS desktop shell")]
struct Args {
    /// Enable debug mode (verbose payload logging with hex dumps)
    #[arg(long)]
    debug: bool,

    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/watchcow/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = Config::load_or_default(&args.config);
    config.debug |= args.debug;

    info!("WatchCow - Docker injector for fnOS");
    if config.debug {
        info!("debug mode enabled");
    }

    // Without cross-process fd duplication nothing can be injected.
    FdBorrower::probe_support().context("pidfd support check failed")?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (app_tx, app_rx) = mpsc::channel(APP_EVENT_QUEUE);

    let orchestrator = Arc::new(Orchestrator::new(config.clone()));

    // Docker being down is survivable: captures proceed with an empty
    // record set and the stream reconnects once the engine is back.
    let docker_handle = match DockerWatcher::connect(app_tx, &config) {
        Ok(watcher) => Some(tokio::spawn(watcher.run(cancel_rx.clone()))),
        Err(e) => {
            warn!(error = %e, "docker unavailable, continuing without container events");
            None
        }
    };

    let events_handle = tokio::spawn(
        Arc::clone(&orchestrator).run_app_events(app_rx, cancel_rx.clone()),
    );

    // Capture pipeline: fatal if the kernel side cannot come up.
    let mut bus = CaptureBus::load(&config.ebpf_object)?;
    let ring = bus.ring()?;
    let capture_orchestrator = Arc::clone(&orchestrator);
    let capture_handle = tokio::spawn(capture::stream(ring, cancel_rx, move |event| {
        capture_orchestrator.handle_capture(&event);
    }));

    info!("monitoring started (press Ctrl+C to stop)");

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    info!("shutting down");
    let _ = cancel_tx.send(true);

    match capture_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "capture stream failed"),
        Err(e) => warn!(error = %e, "capture task join failed"),
    }
    let _ = events_handle.await;
    if let Some(handle) = docker_handle {
        let _ = handle.await;
    }
    // The ring buffer reader is gone; dropping the bus detaches the
    // tracepoint and releases the program objects.
    drop(bus);

    let stats = orchestrator.stats();
    info!(
        received = stats.events_received,
        processed = stats.events_processed,
        injected = stats.responses_injected,
        "final statistics"
    );

    Ok(())
}
