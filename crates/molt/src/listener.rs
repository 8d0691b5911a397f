//! Adopting listeners passed down by the previous generation.
//!
//! The receiving end of [`CommandSpec::pass_fd`](crate::CommandSpec::pass_fd):
//! reads `LISTEN_FDS` and `LISTEN_FD_NAMES` (the systemd socket activation
//! convention) and turns descriptors `3..3+n` back into tokio listeners.

use std::io;
use std::os::unix::io::{FromRawFd, RawFd};

use tokio::net::TcpListener;
use tracing::info;

use crate::command::LISTEN_FDS_START;

/// Named listeners inherited from the parent process.
#[derive(Debug)]
pub struct ListenerSet {
    listeners: Vec<(String, TcpListener)>,
}

impl ListenerSet {
    /// Adopt inherited listeners described by the environment.
    ///
    /// Returns `Ok(None)` on a cold start (`LISTEN_FDS` absent or `0`).
    /// Must be called from within a tokio runtime.
    pub fn from_env() -> io::Result<Option<Self>> {
        let count = match std::env::var("LISTEN_FDS") {
            Ok(raw) => raw.trim().parse::<usize>().map_err(|e| {
                invalid(format!("LISTEN_FDS is not a number ({raw:?}): {e}"))
            })?,
            Err(_) => 0,
        };
        if count == 0 {
            return Ok(None);
        }

        let names_raw = std::env::var("LISTEN_FD_NAMES")
            .map_err(|_| invalid("LISTEN_FDS is set but LISTEN_FD_NAMES is missing"))?;
        let names: Vec<&str> = names_raw.split(':').collect();
        if names.len() != count {
            return Err(invalid(format!(
                "LISTEN_FD_NAMES has {} entries but LISTEN_FDS says {}",
                names.len(),
                count
            )));
        }

        let mut listeners = Vec::with_capacity(count);
        for (i, name) in names.into_iter().enumerate() {
            let fd = LISTEN_FDS_START + i as RawFd;
            if !is_socket(fd) {
                return Err(invalid(format!(
                    "inherited fd {fd} (name: {name}) is not a valid socket"
                )));
            }

            // SAFETY: fstat confirmed fd is an open socket, and the parent
            // handed ownership of it to this process.
            let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
            std_listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(std_listener)?;

            let addr = listener.local_addr().ok();
            info!(fd, name, addr = ?addr, "Inherited listener from parent process");
            listeners.push((name.to_string(), listener));
        }

        // A later handoff describes its own descriptors.
        std::env::remove_var("LISTEN_FDS");
        std::env::remove_var("LISTEN_FD_NAMES");

        Ok(Some(Self { listeners }))
    }

    /// Remove and return the listener called `name`.
    pub fn take(&mut self, name: &str) -> Option<TcpListener> {
        let pos = self.listeners.iter().position(|(n, _)| n == name)?;
        Some(self.listeners.remove(pos).1)
    }

    /// Names of the listeners not taken yet.
    pub fn names(&self) -> Vec<&str> {
        self.listeners.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn is_socket(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, IntoRawFd};

    async fn listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    #[test]
    fn test_socket_detection() {
        let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(is_socket(sock.as_raw_fd()));

        let file = std::fs::File::open("/dev/null").unwrap();
        assert!(!is_socket(file.as_raw_fd()));

        assert!(!is_socket(9999));
        assert!(!is_socket(-1));
    }

    /// Adopting a duplicated descriptor yields a listener on the same address.
    #[tokio::test]
    async fn test_adopted_fd_accepts_connections() {
        let original = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = original.local_addr().unwrap();
        let dup = original.try_clone().unwrap().into_raw_fd();
        assert!(is_socket(dup));

        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(dup) };
        std_listener.set_nonblocking(true).unwrap();
        let adopted = TcpListener::from_std(std_listener).unwrap();
        assert_eq!(adopted.local_addr().unwrap(), addr);

        let connect = tokio::net::TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(adopted.accept(), connect);
        assert!(accepted.is_ok());
        assert!(connected.is_ok());
    }

    #[tokio::test]
    async fn test_take_by_name() {
        let mut set = ListenerSet {
            listeners: vec![
                ("http".to_string(), listener().await),
                ("admin".to_string(), listener().await),
            ],
        };
        assert_eq!(set.names(), ["http", "admin"]);

        assert!(set.take("missing").is_none());
        assert!(set.take("http").is_some());
        assert!(set.take("http").is_none());
        assert_eq!(set.names(), ["admin"]);

        assert!(set.take("admin").is_some());
        assert!(set.is_empty());
    }

    // Environment-driven paths of from_env() are covered in one test to keep
    // them from racing each other on the process-wide environment.
    #[tokio::test]
    async fn test_from_env_validation() {
        std::env::remove_var("LISTEN_FDS");
        std::env::remove_var("LISTEN_FD_NAMES");
        assert!(ListenerSet::from_env().unwrap().is_none());

        std::env::set_var("LISTEN_FDS", "0");
        assert!(ListenerSet::from_env().unwrap().is_none());

        std::env::set_var("LISTEN_FDS", "two");
        let err = ListenerSet::from_env().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        std::env::set_var("LISTEN_FDS", "2");
        let err = ListenerSet::from_env().unwrap_err();
        assert!(err.to_string().contains("LISTEN_FD_NAMES is missing"));

        std::env::set_var("LISTEN_FD_NAMES", "http");
        let err = ListenerSet::from_env().unwrap_err();
        assert!(err.to_string().contains("has 1 entries"));

        std::env::remove_var("LISTEN_FDS");
        std::env::remove_var("LISTEN_FD_NAMES");
    }
}
