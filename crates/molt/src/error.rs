//! Error taxonomy for the restart handshake.
//!
//! Every failure carries an [`ErrorCode`] identifying the phase it came from,
//! plus an optional wrapped cause. There are no un-coded errors.

use std::fmt;

use thiserror::Error;

/// Boxed cause type accepted from process capabilities.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Stable identity of a handshake failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The termination signal did not arrive within the configured window.
    Timeout,
    /// Spawning the replacement process failed.
    NewProcess,
    /// Signaling the parent process during startup failed.
    KillProcess,
    /// `Process::begin_restart` failed.
    Restart,
    /// No process capability is configured.
    NoProcess,
    /// A signal subscription could not be registered.
    Signal,
    /// A raw code this version does not know about.
    Unknown(u16),
}

impl ErrorCode {
    /// Map a raw numeric code back to its variant.
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::Timeout,
            1 => Self::NewProcess,
            2 => Self::KillProcess,
            3 => Self::Restart,
            4 => Self::NoProcess,
            5 => Self::Signal,
            other => Self::Unknown(other),
        }
    }

    /// The stable numeric value of this code.
    pub fn raw(self) -> u16 {
        match self {
            Self::Timeout => 0,
            Self::NewProcess => 1,
            Self::KillProcess => 2,
            Self::Restart => 3,
            Self::NoProcess => 4,
            Self::Signal => 5,
            Self::Unknown(other) => other,
        }
    }

    /// Fixed message rendered for this code.
    pub fn message(self) -> &'static str {
        match self {
            Self::Timeout => "molt: process restart timed out",
            Self::NewProcess => "molt: error starting new process",
            Self::KillProcess => "molt: error killing parent process",
            Self::Restart => "molt: restart error",
            Self::NoProcess => "molt: no process configured",
            Self::Signal => "molt: error registering signal handler",
            Self::Unknown(_) => "molt: unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A handshake failure: a code and the cause that triggered it, if any.
#[derive(Debug, Error)]
#[error("{}", render(.code, .inner.as_deref()))]
pub struct Error {
    code: ErrorCode,
    #[source]
    inner: Option<BoxError>,
}

impl Error {
    /// An error with no underlying cause.
    pub fn new(code: ErrorCode) -> Self {
        Self { code, inner: None }
    }

    /// An error wrapping `cause`.
    pub fn with_cause(code: ErrorCode, cause: impl Into<BoxError>) -> Self {
        Self {
            code,
            inner: Some(cause.into()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Whether this error carries `code`.
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }

    /// The wrapped cause, if any.
    pub fn inner(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.inner.as_deref()
    }

    /// Consume the error, returning the wrapped cause.
    pub fn into_inner(self) -> Option<BoxError> {
        self.inner
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

fn render(
    code: &ErrorCode,
    inner: Option<&(dyn std::error::Error + Send + Sync + 'static)>,
) -> String {
    let mut msg = code.message().to_string();
    if let Some(cause) = inner {
        let cause = cause.to_string();
        if !cause.is_empty() {
            msg.push_str(": ");
            msg.push_str(&cause);
        }
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use std::io;

    #[test]
    fn test_known_code_renders_fixed_message() {
        assert_eq!(
            Error::new(ErrorCode::Timeout).to_string(),
            "molt: process restart timed out"
        );
        assert_eq!(
            Error::new(ErrorCode::NoProcess).to_string(),
            "molt: no process configured"
        );
    }

    #[test]
    fn test_unknown_code_renders_fallback() {
        let err = Error::new(ErrorCode::from_raw(42));
        assert_eq!(err.code(), ErrorCode::Unknown(42));
        assert_eq!(err.to_string(), "molt: unknown error");
    }

    #[test]
    fn test_cause_appended_after_separator() {
        let err = Error::with_cause(
            ErrorCode::NewProcess,
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        );
        assert_eq!(
            err.to_string(),
            "molt: error starting new process: no such file"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn test_empty_cause_omitted() {
        let err = Error::with_cause(ErrorCode::Restart, "");
        assert_eq!(err.to_string(), "molt: restart error");
        assert!(err.inner().is_some());
    }

    #[test]
    fn test_raw_codes_are_stable() {
        for raw in 0..6 {
            assert_eq!(ErrorCode::from_raw(raw).raw(), raw);
            assert!(!matches!(ErrorCode::from_raw(raw), ErrorCode::Unknown(_)));
        }
        assert_eq!(ErrorCode::KillProcess.raw(), 2);
    }

    #[test]
    fn test_dispatch_by_code() {
        let err: Error = ErrorCode::Signal.into();
        assert!(err.is(ErrorCode::Signal));
        assert!(!err.is(ErrorCode::Timeout));
        assert!(err.into_inner().is_none());
    }
}
