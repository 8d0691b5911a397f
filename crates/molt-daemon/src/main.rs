//! molt-daemon - a small TCP greeting daemon that can replace itself without
//! dropping its listening socket.
//!
//! Send `SIGHUP` to hand over to a fresh instance; `SIGINT`, or `SIGTERM`
//! outside of a handoff, stops it.

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use molt::{Coordinator, ErrorCode, ListenerSet, Origin, RestartConfig};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

mod service;
mod telemetry;

use service::{Greeter, HandoffFlag, Server, HTTP_LISTENER};

/// Greeting daemon with zero-downtime restarts
#[derive(Parser, Debug)]
#[command(name = "molt-daemon")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on when no listener is inherited
    #[arg(short, long, default_value = "127.0.0.1:7878")]
    listen: String,

    /// Seconds to wait for a replacement to report ready (0 waits forever)
    #[arg(short, long)]
    timeout_secs: Option<u64>,

    /// Restart marker placed at argv[1] of a replacement (overrides MOLT_RESTART_MARKER)
    #[arg(long)]
    marker: Option<String>,

    /// Seconds to let in-flight connections finish before exiting
    #[arg(long, default_value_t = 30)]
    drain_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let origin = Origin::capture();
    let mut config = RestartConfig::from_env();

    // The marker decides what argv[1] is, so it is needed before clap runs.
    if let Some(marker) = marker_flag(origin.args()) {
        config.marker = marker;
    }
    let from_restart = origin.is_replacement(config.effective_marker());
    let cli = Cli::parse_from(origin.args_without_marker(config.effective_marker()));

    telemetry::init().map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;

    if let Some(secs) = cli.timeout_secs {
        config.timeout = Duration::from_secs(secs);
    }

    let generation = service::current_generation();
    info!(
        pid = std::process::id(),
        generation,
        from_restart,
        marker = ?cli.marker,
        "molt-daemon starting"
    );

    let inherited = ListenerSet::from_env().context("Failed to adopt inherited listeners")?;
    let listener = match inherited {
        Some(mut inherited) => {
            let listener = inherited.take(HTTP_LISTENER).with_context(|| {
                format!("Parent did not pass the '{HTTP_LISTENER}' listener")
            })?;
            if !inherited.is_empty() {
                warn!(unused = ?inherited.names(), "Ignoring unexpected inherited listeners");
            }
            listener
        }
        None => TcpListener::bind(&cli.listen)
            .await
            .with_context(|| format!("Failed to bind {}", cli.listen))?,
    };
    info!(addr = ?listener.local_addr().ok(), "Listening");

    let server = Arc::new(Server::new());
    let handoff = HandoffFlag::default();
    let greeter = Greeter::new(&listener, generation, server.stop_token(), handoff.clone())
        .context("Failed to prepare handoff capability")?;

    let coordinator = Coordinator::new(config)
        .with_origin(origin)
        .with_process(Arc::new(greeter));

    let greeting: Arc<str> = Arc::from(format!(
        "hello from pid {} (generation {})\n",
        std::process::id(),
        generation
    ));
    let accept_loop = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener, greeting).await }
    });

    // Registered before any handoff can start.
    let shutdown = shutdown_signal(handoff.clone());
    tokio::pin!(shutdown);

    // Serving already, so the previous generation may go.
    coordinator
        .start(from_restart)
        .context("Failed to notify parent process")?;

    loop {
        tokio::select! {
            result = coordinator.notify_restart() => match result {
                Ok(()) => break,
                Err(e) if e.is(ErrorCode::Signal) => {
                    return Err(e).context("Cannot listen for restart signals");
                }
                Err(e) => {
                    handoff.clear();
                    if e.is(ErrorCode::Timeout) {
                        warn!(
                            error = %e,
                            "Replacement never reported ready; it may still be running"
                        );
                    } else {
                        error!(error = %e, "Restart failed, continuing to serve");
                    }
                }
            },
            signal = &mut shutdown => {
                signal?;
                info!("Shutdown requested");
                server.stop_token().cancel();
                break;
            }
        }
    }

    accept_loop.await.context("Accept loop panicked")?;
    if !server.drain(Duration::from_secs(cli.drain_secs)).await {
        warn!(
            remaining_connections = server.active_connections(),
            "Exiting with connections still open"
        );
    }
    info!(generation, "molt-daemon exiting");
    Ok(())
}

/// Value of `--marker <s>` or `--marker=<s>` in a raw argv.
fn marker_flag(args: &[OsString]) -> Option<String> {
    let mut args = args.iter().skip(1).filter_map(|arg| arg.to_str());
    while let Some(arg) = args.next() {
        if arg == "--marker" {
            return args.next().map(str::to_owned);
        }
        if let Some(value) = arg.strip_prefix("--marker=") {
            return Some(value.to_owned());
        }
    }
    None
}

/// Resolves on `SIGINT`, or on `SIGTERM` while no handoff is in flight.
async fn shutdown_signal(handoff: HandoffFlag) -> Result<()> {
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    loop {
        tokio::select! {
            _ = sigint.recv() => return Ok(()),
            _ = sigterm.recv() => {
                if !handoff.is_set() {
                    return Ok(());
                }
                debug!("SIGTERM during handoff, left to the coordinator");
            }
        }
    }
}
