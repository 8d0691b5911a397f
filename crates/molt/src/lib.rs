//! # molt
//!
//! Zero-downtime process replacement for long-running Unix daemons.
//!
//! ## Overview
//!
//! A handoff replaces a running daemon with a fresh instance of itself:
//! 1. The old process receives the trigger signal (`SIGHUP` by default)
//! 2. Its [`Process`] capability releases conflicting resources and may pass
//!    listening sockets to the replacement through the [`CommandSpec`]
//! 3. The replacement is spawned with the restart marker at argv[1]
//! 4. Once ready, the replacement sends the termination signal (`SIGTERM`)
//!    to its parent via [`Coordinator::start`]
//! 5. The old process calls [`Process::kill`] and exits
//!
//! If the replacement does not report in within the configured timeout the
//! handoff fails with [`ErrorCode::Timeout`] and both processes keep running.
//!
//! ## Environment Variables
//!
//! - `MOLT_RESTART_MARKER`: restart marker (default: `-restart`)
//! - `MOLT_RESTART_TIMEOUT_SECS`: handoff timeout, `0` for none (default: 0)
//! - `LISTEN_FDS` / `LISTEN_FD_NAMES`: descriptors passed to a replacement
//!
//! ## Features
//!
//! - `test-util`: exports `ManualSignals`, an in-process [`SignalBridge`]
//!   for driving a [`Coordinator`] in tests without real signals
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("molt requires a Unix platform (Linux or macOS)");

mod command;
mod config;
mod coordinator;
mod error;
mod listener;
mod origin;
mod signal;

pub use command::{CommandSpec, StdioMode, LISTEN_FDS_START};
pub use config::{RestartConfig, DEFAULT_MARKER};
pub use coordinator::{Coordinator, Process};
pub use error::{BoxError, Error, ErrorCode, Result};
pub use listener::ListenerSet;
pub use origin::Origin;
pub use signal::{OsSignals, SignalBridge, SignalKind, Subscription};

#[cfg(any(test, feature = "test-util"))]
pub use signal::ManualSignals;
