//! The greeting service and its handoff capability.
//!
//! A generation serves until its [`Server`] stop token fires, either because
//! a replacement took over ([`Greeter::kill`]) or because shutdown was
//! requested. Connections still open at that point get a bounded grace
//! period in [`Server::drain`].

use std::io;
use std::os::unix::io::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use molt::{BoxError, CommandSpec, Process};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Name under which the listening socket is passed to a replacement.
pub const HTTP_LISTENER: &str = "http";

/// Environment variable carrying the generation counter.
pub const GENERATION_VAR: &str = "MOLT_GENERATION";

/// Accept loop plus the connections it has handed out.
#[derive(Default)]
pub struct Server {
    stop: CancellationToken,
    connections: TaskTracker,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancelling it ends [`serve`](Self::serve).
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Greet every connection until the stop token fires.
    pub async fn serve(&self, listener: TcpListener, greeting: Arc<str>) {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let greeting = greeting.clone();
                        self.connections.spawn(async move {
                            if let Err(e) = greet(stream, &greeting).await {
                                debug!(%peer, error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                }
            }
        }
        info!("Stopped accepting connections");
    }

    /// Wait up to `limit` for open connections. `false` if some outlived it.
    pub async fn drain(&self, limit: Duration) -> bool {
        self.connections.close();
        let active = self.active_connections();
        if active == 0 {
            return true;
        }

        info!(
            active_connections = active,
            limit_secs = limit.as_secs(),
            "Waiting for open connections"
        );
        tokio::time::timeout(limit, self.connections.wait())
            .await
            .is_ok()
    }
}

async fn greet(mut stream: TcpStream, greeting: &str) -> io::Result<()> {
    stream.write_all(greeting.as_bytes()).await?;
    stream.shutdown().await
}

/// Set from `begin_restart` until the handoff is over.
///
/// While set, `SIGTERM` belongs to the coordinator: it is the replacement
/// saying it is ready, not a shutdown request.
#[derive(Debug, Clone, Default)]
pub struct HandoffFlag(Arc<AtomicBool>);

impl HandoffFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Hands the listening socket over to the next generation.
pub struct Greeter {
    listener_fd: OwnedFd,
    generation: u64,
    stop: CancellationToken,
    handoff: HandoffFlag,
}

impl Greeter {
    pub fn new(
        listener: &TcpListener,
        generation: u64,
        stop: CancellationToken,
        handoff: HandoffFlag,
    ) -> io::Result<Self> {
        Ok(Self {
            listener_fd: listener.as_fd().try_clone_to_owned()?,
            generation,
            stop,
            handoff,
        })
    }
}

impl Process for Greeter {
    fn begin_restart(&self, cmd: &mut CommandSpec) -> Result<(), BoxError> {
        self.handoff.set();
        // The socket is shared with the replacement, so nothing has to be
        // closed before it starts accepting.
        cmd.pass_fd(HTTP_LISTENER, self.listener_fd.as_fd())?;
        cmd.env(GENERATION_VAR, (self.generation + 1).to_string());
        info!(next_generation = self.generation + 1, "Passing listener to replacement");
        Ok(())
    }

    fn kill(&self) {
        info!(generation = self.generation, "Replacement took over, stopping");
        self.stop.cancel();
    }
}

/// Read the generation this process belongs to (`0` for a cold start).
pub fn current_generation() -> u64 {
    std::env::var(GENERATION_VAR)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}
