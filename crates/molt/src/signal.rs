//! Signal subscription and delivery.
//!
//! The handshake only ever deals with two signals: the trigger that starts a
//! handoff and the termination signal a ready replacement sends back. The
//! [`SignalBridge`] trait is the single substitution point for both;
//! [`OsSignals`] is the real implementation. With the `test-util` feature,
//! `ManualSignals` provides an in-process one for tests.

use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::signal::unix;
use tracing::{debug, warn};

use crate::config::RestartConfig;

#[cfg(any(test, feature = "test-util"))]
mod manual;

#[cfg(any(test, feature = "test-util"))]
pub use manual::ManualSignals;

/// Which of the two handshake signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Starts a handoff (default `SIGHUP`).
    Trigger,
    /// Sent by a ready replacement to its parent (default `SIGTERM`).
    Terminate,
}

/// A live registration for one signal kind.
///
/// Buffers at most one pending delivery; further deliveries before a
/// `recv` coalesce into it. Dropping the subscription deregisters it.
pub trait Subscription: Send {
    /// Wait for the next delivery. `None` means no more can arrive.
    fn recv(&mut self) -> BoxFuture<'_, Option<()>>;
}

/// Subscribe to and send the handshake signals.
pub trait SignalBridge: Send + Sync {
    /// Register for `kind`. Deliveries after this call returns are observed.
    fn subscribe(&self, kind: SignalKind) -> io::Result<Box<dyn Subscription>>;

    /// Send `kind` to process `pid`.
    fn deliver(&self, pid: u32, kind: SignalKind) -> io::Result<()>;
}

/// Signal bridge backed by real POSIX signals.
///
/// While at least one subscription for a signal is alive the signal is
/// routed to tokio. When the last one is dropped the signal gets back the
/// disposition it had before the first, so a `SIGTERM` after a failed
/// handoff terminates the process again. A tokio listener for the same
/// signal created elsewhere in the program keeps working only if it existed
/// before the first subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsSignals {
    trigger: i32,
    terminate: i32,
}

impl OsSignals {
    pub fn new(trigger: i32, terminate: i32) -> Self {
        Self { trigger, terminate }
    }

    pub fn from_config(config: &RestartConfig) -> Self {
        Self::new(config.trigger_signal, config.terminate_signal)
    }

    /// The OS signal number behind `kind`.
    pub fn number(&self, kind: SignalKind) -> i32 {
        match kind {
            SignalKind::Trigger => self.trigger,
            SignalKind::Terminate => self.terminate,
        }
    }
}

impl Default for OsSignals {
    fn default() -> Self {
        Self::from_config(&RestartConfig::default())
    }
}

impl SignalBridge for OsSignals {
    fn subscribe(&self, kind: SignalKind) -> io::Result<Box<dyn Subscription>> {
        let signum = self.number(kind);
        let claim = Claim::acquire(signum)?;
        let signal = unix::signal(unix::SignalKind::from_raw(signum))?;
        debug!(?kind, signum, "Subscribed to signal");
        Ok(Box::new(OsSubscription {
            signal,
            _claim: claim,
        }))
    }

    fn deliver(&self, pid: u32, kind: SignalKind) -> io::Result<()> {
        let target = match i32::try_from(pid) {
            Ok(target) if target > 0 => target,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("refusing to signal pid {pid}"),
                ))
            }
        };
        let signum = self.number(kind);
        if unsafe { libc::kill(target, signum) } != 0 {
            return Err(io::Error::last_os_error());
        }
        debug!(?kind, signum, pid, "Delivered signal");
        Ok(())
    }
}

struct OsSubscription {
    signal: unix::Signal,
    // Dropped after `signal`.
    _claim: Claim,
}

impl Subscription for OsSubscription {
    fn recv(&mut self) -> BoxFuture<'_, Option<()>> {
        Box::pin(self.signal.recv())
    }
}

/// Per-signal bookkeeping shared by every [`OsSignals`] in the process.
struct Registration {
    signum: i32,
    live: usize,
    /// Disposition found when `live` last went from zero to one.
    previous: libc::sigaction,
    /// tokio's handler, set aside while `live` is zero.
    parked: Option<libc::sigaction>,
}

static REGISTRATIONS: Mutex<Vec<Registration>> = Mutex::new(Vec::new());

fn registrations() -> MutexGuard<'static, Vec<Registration>> {
    REGISTRATIONS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps one signal routed to tokio while alive.
struct Claim {
    signum: i32,
}

impl Claim {
    fn acquire(signum: i32) -> io::Result<Self> {
        let mut table = registrations();
        match table.iter_mut().find(|r| r.signum == signum) {
            Some(reg) => {
                if reg.live == 0 {
                    reg.previous = swap_disposition(signum, None)?;
                    if let Some(parked) = reg.parked {
                        swap_disposition(signum, Some(&parked))?;
                        reg.parked = None;
                    }
                }
                reg.live += 1;
            }
            None => {
                let previous = swap_disposition(signum, None)?;
                table.push(Registration {
                    signum,
                    live: 1,
                    previous,
                    parked: None,
                });
            }
        }
        Ok(Self { signum })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut table = registrations();
        let Some(reg) = table.iter_mut().find(|r| r.signum == self.signum) else {
            return;
        };
        reg.live = reg.live.saturating_sub(1);
        if reg.live > 0 {
            return;
        }
        match swap_disposition(self.signum, Some(&reg.previous)) {
            Ok(handler) => {
                reg.parked = Some(handler);
                debug!(signum = self.signum, "Restored signal disposition");
            }
            Err(e) => warn!(
                signum = self.signum,
                error = %e,
                "Failed to restore signal disposition"
            ),
        }
    }
}

/// Install `action` for `signum` (or only read when `None`) and return the
/// disposition that was in place.
pub(crate) fn swap_disposition(
    signum: i32,
    action: Option<&libc::sigaction>,
) -> io::Result<libc::sigaction> {
    // SAFETY: an all-zero sigaction is valid; the kernel overwrites it.
    let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
    let new = action.map_or(std::ptr::null(), |a| a as *const libc::sigaction);
    if unsafe { libc::sigaction(signum, new, &mut old) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(old)
}
