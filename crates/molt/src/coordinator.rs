//! Restart coordination.
//!
//! The old process drives the handshake:
//!
//! ```text
//!  trigger   ┌──────────────┐ prepare ┌─────────────────────┐  spawn   ┌─────────────┐
//!  ─────────▶│ old process  │────────▶│ begin_restart(spec) │─ ─ ─ ─ ─▶│ replacement │
//!            └──────────────┘         └─────────────────────┘          └─────────────┘
//!                   ▲        ┌────────┐                                       │
//!                   └────────│ kill() │◀─ ─ ─ ─ ─ ─ terminate signal ─ ─ ─ ─ ─┘
//!                            └────────┘
//! ```
//!
//! The replacement calls [`Coordinator::start`] with `true` once it is ready
//! to serve, which sends the termination signal back to its parent.

use std::process::Child;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::CommandSpec;
use crate::config::RestartConfig;
use crate::error::{BoxError, Error, ErrorCode, Result};
use crate::origin::Origin;
use crate::signal::{OsSignals, SignalBridge, SignalKind};

/// A process that can hand its work over to a replacement of itself.
///
/// Only one is intended to exist per program.
pub trait Process: Send + Sync {
    /// Release everything a replacement would conflict with.
    ///
    /// Must not return until every critical resource (listening sockets,
    /// exclusive locks, pid files) is released; non-critical cleanup may
    /// continue in the background. `cmd` may be adjusted here, e.g. to pass
    /// descriptors or environment to the replacement.
    ///
    /// Stop handling the termination signal here: the coordinator relies on
    /// it to learn that the replacement is ready.
    fn begin_restart(&self, cmd: &mut CommandSpec) -> Result<(), BoxError>;

    /// Called once the replacement has signaled it is ready. The program is
    /// expected to exit.
    fn kill(&self);
}

/// How often an unconfirmed replacement is checked for exit.
const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// States of one restart handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    PreparingHandoff,
    Spawning,
    AwaitingTermSignal,
    Completed,
    TimedOut,
    Failed,
}

struct Handshake {
    phase: Phase,
}

impl Handshake {
    fn new() -> Self {
        Self { phase: Phase::Idle }
    }

    fn advance(&mut self, next: Phase) {
        debug!(from = ?self.phase, to = ?next, "Restart phase transition");
        self.phase = next;
    }

    fn fail(&mut self, err: Error) -> Error {
        warn!(phase = ?self.phase, error = %err, "Restart failed");
        self.advance(Phase::Failed);
        err
    }
}

/// Restarts the host process and notifies the previous generation.
pub struct Coordinator {
    process: Option<Arc<dyn Process>>,
    config: RestartConfig,
    origin: Origin,
    signals: Arc<dyn SignalBridge>,
}

impl Coordinator {
    /// A coordinator using real signals and the captured invocation of the
    /// running process. No [`Process`] is set yet.
    pub fn new(config: RestartConfig) -> Self {
        Self {
            process: None,
            signals: Arc::new(OsSignals::from_config(&config)),
            origin: Origin::capture(),
            config,
        }
    }

    pub fn with_process(mut self, process: Arc<dyn Process>) -> Self {
        self.process = Some(process);
        self
    }

    /// Use an origin captured earlier, ideally first thing in `main`.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_signals(mut self, signals: Arc<dyn SignalBridge>) -> Self {
        self.signals = signals;
        self
    }

    pub fn config(&self) -> &RestartConfig {
        &self.config
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Whether this process was spawned by a handoff.
    pub fn is_replacement(&self) -> bool {
        self.origin.is_replacement(self.config.effective_marker())
    }

    /// Announce startup.
    ///
    /// When `from_restart` is true the parent process is sent the
    /// termination signal so it can exit. Call this once the process is
    /// ready to serve and before it starts listening for the trigger itself.
    pub fn start(&self, from_restart: bool) -> Result<()> {
        if !from_restart {
            return Ok(());
        }

        let parent = self.origin.parent_pid();
        self.signals
            .deliver(parent, SignalKind::Terminate)
            .map_err(|e| Error::with_cause(ErrorCode::KillProcess, e))?;

        info!(parent_pid = parent, "Notified parent process that replacement is ready");
        Ok(())
    }

    /// Run one handoff to a freshly spawned replacement.
    ///
    /// Returns `Ok(())` after [`Process::kill`] has been called; the
    /// replacement is not waited on since this process is expected to exit.
    /// On [`ErrorCode::Timeout`] the replacement keeps running alongside this
    /// process, `kill` is not called, and a background task reaps the
    /// replacement once it exits.
    pub async fn restart(&self) -> Result<()> {
        let Some(process) = self.process.as_deref() else {
            return Err(Error::new(ErrorCode::NoProcess));
        };

        let mut handshake = Handshake::new();
        let marker = self.config.effective_marker();

        handshake.advance(Phase::PreparingHandoff);
        let mut cmd = CommandSpec::for_restart(marker, &self.origin);
        info!(program = ?cmd.program(), marker, "Preparing handoff");

        if let Err(e) = process.begin_restart(&mut cmd) {
            return Err(handshake.fail(Error::with_cause(ErrorCode::Restart, e)));
        }
        if !cmd.is_marked(marker) {
            warn!(
                marker,
                "Replacement command lost the restart marker at argv[1]; it will not report ready"
            );
        }

        handshake.advance(Phase::Spawning);

        // Subscribe before spawning so an early ready signal is not lost.
        let mut terminated = self
            .signals
            .subscribe(SignalKind::Terminate)
            .map_err(|e| handshake.fail(Error::with_cause(ErrorCode::Signal, e)))?;

        let child = cmd
            .spawn()
            .map_err(|e| handshake.fail(Error::with_cause(ErrorCode::NewProcess, e)))?;
        let pid = child.id();
        info!(pid, "Spawned replacement process");

        handshake.advance(Phase::AwaitingTermSignal);
        let ready = async {
            if terminated.recv().await.is_none() {
                // Nothing can be delivered any more; only a timeout ends this.
                std::future::pending::<()>().await;
            }
        };

        match self.config.deadline() {
            Some(limit) => {
                tokio::select! {
                    _ = ready => {}
                    _ = tokio::time::sleep(limit) => {
                        handshake.advance(Phase::TimedOut);
                        warn!(
                            pid,
                            timeout_ms = limit.as_millis() as u64,
                            "Replacement did not signal readiness in time, both processes are running"
                        );
                        reap_in_background(child);
                        return Err(Error::new(ErrorCode::Timeout));
                    }
                }
            }
            None => ready.await,
        }
        drop(terminated);

        handshake.advance(Phase::Completed);
        info!(pid, "Replacement is ready, handing off");
        process.kill();
        Ok(())
    }

    /// Wait for one trigger signal, then [`restart`](Self::restart).
    ///
    /// Blocks the calling task until the trigger arrives; see
    /// [`spawn_listener`](Self::spawn_listener) to run it in the background.
    pub async fn notify_restart(&self) -> Result<()> {
        let mut trigger = self
            .signals
            .subscribe(SignalKind::Trigger)
            .map_err(|e| Error::with_cause(ErrorCode::Signal, e))?;

        debug!("Waiting for restart trigger");
        if trigger.recv().await.is_none() {
            return Err(Error::with_cause(
                ErrorCode::Signal,
                "trigger signal stream closed",
            ));
        }

        info!("Restart triggered");
        let result = self.restart().await;
        drop(trigger);
        result
    }

    /// Run [`notify_restart`](Self::notify_restart) on its own task.
    pub fn spawn_listener(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.notify_restart().await })
    }
}

/// Wait for a replacement that never reported ready, so it does not linger
/// as a zombie once it exits.
fn reap_in_background(mut child: Child) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pid = child.id();
        let mut tick = tokio::time::interval(REAP_INTERVAL);
        loop {
            tick.tick().await;
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!(pid, %status, "Unconfirmed replacement exited");
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(pid, error = %e, "Cannot wait for replacement");
                    return;
                }
            }
        }
    })
}
