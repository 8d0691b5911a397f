//! Process-wide state captured once at startup.

use std::ffi::{OsStr, OsString};

/// The invocation this process was started with.
///
/// Capture it as early as possible in `main`, before anything can reparent
/// the process or rewrite its arguments, and pass it to the
/// [`Coordinator`](crate::Coordinator) explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    parent_pid: u32,
    args: Vec<OsString>,
}

impl Origin {
    /// Read the parent pid and argv of the running process.
    pub fn capture() -> Self {
        Self {
            parent_pid: std::os::unix::process::parent_id(),
            args: std::env::args_os().collect(),
        }
    }

    /// Build an origin from explicit values.
    pub fn new<I, S>(parent_pid: u32, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            parent_pid,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn parent_pid(&self) -> u32 {
        self.parent_pid
    }

    /// Full argv, including argv[0].
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// argv[0], or an empty string if the process was started without one.
    pub fn program(&self) -> &OsStr {
        self.args.first().map(OsString::as_os_str).unwrap_or_default()
    }

    /// Whether argv[1] is `marker`, i.e. this process was spawned by a handoff.
    pub fn is_replacement(&self, marker: &str) -> bool {
        self.args.get(1).is_some_and(|arg| arg == marker)
    }

    /// argv with a leading `marker` removed, for handing to a CLI parser.
    pub fn args_without_marker(&self, marker: &str) -> Vec<OsString> {
        let mut args = self.args.clone();
        if self.is_replacement(marker) {
            args.remove(1);
        }
        args
    }
}
