//! The command used to spawn a replacement process.
//!
//! Built from the running process's own invocation with the restart marker
//! pinned at argv[1]. A [`Process`](crate::Process) capability can adjust it
//! in `begin_restart` before it is spawned, most commonly to pass listening
//! sockets to the new process with [`CommandSpec::pass_fd`].

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use tracing::debug;

use crate::origin::Origin;

/// First descriptor number handed to the replacement.
pub const LISTEN_FDS_START: RawFd = 3;

/// How one standard stream of the replacement is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    /// Share the current process's stream.
    #[default]
    Inherit,
    /// Connect the stream to `/dev/null`.
    Null,
}

impl From<StdioMode> for Stdio {
    fn from(mode: StdioMode) -> Self {
        match mode {
            StdioMode::Inherit => Stdio::inherit(),
            StdioMode::Null => Stdio::null(),
        }
    }
}

/// Executable, arguments, environment and descriptors for a replacement.
#[derive(Debug)]
pub struct CommandSpec {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    fds: Vec<(String, OwnedFd)>,
    pub stdin: StdioMode,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
}

impl CommandSpec {
    /// Derive the replacement command from `origin`.
    ///
    /// The program is argv[0]. The argument list is argv[0], then `marker`,
    /// then the remaining original arguments in order. If argv[1] already is
    /// `marker` it is reused, so repeated restarts never stack markers.
    ///
    /// All three standard streams are inherited.
    pub fn for_restart(marker: &str, origin: &Origin) -> Self {
        let program = origin.program().to_os_string();

        let rest = origin.args().get(1..).unwrap_or_default();
        let rest = match rest.split_first() {
            Some((first, tail)) if first == marker => tail,
            _ => rest,
        };

        let mut args = Vec::with_capacity(rest.len() + 2);
        args.push(program.clone());
        args.push(OsString::from(marker));
        args.extend(rest.iter().cloned());

        Self {
            program,
            args,
            envs: Vec::new(),
            fds: Vec::new(),
            stdin: StdioMode::Inherit,
            stdout: StdioMode::Inherit,
            stderr: StdioMode::Inherit,
        }
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Argument list including argv[0].
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Replace the executable that will be spawned. argv[0] is left as is.
    pub fn set_program(&mut self, program: impl Into<OsString>) {
        self.program = program.into();
    }

    /// Replace everything after argv[0], the restart marker included.
    ///
    /// A replacement spawned without the marker at argv[1] cannot tell it
    /// was started by a handoff and will not notify its parent. Put the
    /// marker back first unless the program is not a replacement at all;
    /// [`is_marked`](Self::is_marked) checks it.
    pub fn set_args<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.truncate(1);
        self.args.extend(args.into_iter().map(Into::into));
    }

    /// Whether argv[1] is `marker`.
    pub fn is_marked(&self, marker: &str) -> bool {
        self.args.get(1).is_some_and(|arg| arg == marker)
    }

    /// Add an environment variable for the replacement.
    pub fn env(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> &mut Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn envs(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.envs.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    /// Pass a duplicate of `fd` to the replacement under `name`.
    ///
    /// Descriptors land at 3, 4, ... in the order they were added, and the
    /// child sees `LISTEN_FDS` and `LISTEN_FD_NAMES` describing them. Names
    /// must be non-empty and must not contain `:`.
    pub fn pass_fd(&mut self, name: impl Into<String>, fd: BorrowedFd<'_>) -> io::Result<()> {
        let name = name.into();
        if name.is_empty() || name.contains(':') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid descriptor name {name:?}"),
            ));
        }
        let owned = fd.try_clone_to_owned()?;
        self.fds.push((name, owned));
        Ok(())
    }

    /// Names of passed descriptors, in fd order.
    pub fn fd_names(&self) -> impl Iterator<Item = &str> {
        self.fds.iter().map(|(name, _)| name.as_str())
    }

    /// Start the replacement, consuming the spec.
    pub fn spawn(self) -> io::Result<Child> {
        let mut cmd = Command::new(&self.program);
        if let Some((arg0, rest)) = self.args.split_first() {
            cmd.arg0(arg0).args(rest);
        }
        cmd.stdin(self.stdin)
            .stdout(self.stdout)
            .stderr(self.stderr)
            .envs(self.envs.iter().map(|(k, v)| (k, v)));

        if self.fds.is_empty() {
            return cmd.spawn();
        }

        let count = self.fds.len();
        let names: Vec<&str> = self.fds.iter().map(|(n, _)| n.as_str()).collect();

        // Stage every source above the target range so that placing one
        // descriptor can never overwrite another that is still to be placed.
        let floor = LISTEN_FDS_START + count as RawFd;
        let staged = self
            .fds
            .iter()
            .map(|(_, fd)| dup_at_least(fd.as_fd(), floor))
            .collect::<io::Result<Vec<OwnedFd>>>()?;
        let sources: Vec<RawFd> = staged.iter().map(AsRawFd::as_raw_fd).collect();

        cmd.env("LISTEN_FDS", count.to_string())
            .env("LISTEN_FD_NAMES", names.join(":"));

        debug!(fds = ?sources, names = ?names, "Passing descriptors to replacement");

        // SAFETY: the hook only calls dup2, which is async-signal-safe, and
        // touches no memory other than the captured vector.
        unsafe {
            cmd.pre_exec(move || {
                for (i, source) in sources.iter().enumerate() {
                    // dup2 leaves FD_CLOEXEC cleared on the target.
                    if libc::dup2(*source, LISTEN_FDS_START + i as RawFd) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let child = cmd.spawn();
        drop(staged);
        child
    }
}

/// Duplicate `fd` onto the lowest free descriptor `>= floor`, close-on-exec.
fn dup_at_least(fd: BorrowedFd<'_>, floor: RawFd) -> io::Result<OwnedFd> {
    let new_fd = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
    if new_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fcntl returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(args: &[&str]) -> CommandSpec {
        CommandSpec::for_restart("-restart", &Origin::new(1, args.iter().copied()))
    }

    fn strings(spec: &CommandSpec) -> Vec<String> {
        spec.args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_marker_inserted_at_index_one() {
        let spec = spec(&["/usr/sbin/daemon", "--port", "8080"]);
        assert_eq!(spec.program(), OsStr::new("/usr/sbin/daemon"));
        assert_eq!(
            strings(&spec),
            ["/usr/sbin/daemon", "-restart", "--port", "8080"]
        );
    }

    #[test]
    fn test_existing_marker_not_duplicated() {
        let spec = spec(&["/usr/sbin/daemon", "-restart", "--port", "8080"]);
        assert_eq!(
            strings(&spec),
            ["/usr/sbin/daemon", "-restart", "--port", "8080"]
        );
    }

    #[test]
    fn test_marker_later_in_argv_is_kept() {
        let spec = spec(&["daemon", "-v", "-restart"]);
        assert_eq!(strings(&spec), ["daemon", "-restart", "-v", "-restart"]);
    }

    #[test]
    fn test_no_user_arguments() {
        let spec = spec(&["daemon"]);
        assert_eq!(strings(&spec), ["daemon", "-restart"]);
    }

    #[test]
    fn test_marker_appears_once_for_any_marker() {
        for marker in ["-restart", "--handoff", "x"] {
            for argv in [vec!["d"], vec!["d", marker], vec!["d", marker, "a"], vec!["d", "a"]] {
                let spec = CommandSpec::for_restart(marker, &Origin::new(1, argv));
                assert_eq!(spec.args()[1].as_os_str(), OsStr::new(marker));
                let leading = spec.args()[1..]
                    .iter()
                    .take_while(|a| a.as_os_str() == OsStr::new(marker))
                    .count();
                assert_eq!(leading, 1);
            }
        }
    }

    #[test]
    fn test_set_args_replaces_marker() {
        let mut spec = spec(&["daemon", "--port", "1"]);
        assert!(spec.is_marked("-restart"));
        assert!(!spec.is_marked("--other"));

        spec.set_args(["--port", "2"]);
        assert!(!spec.is_marked("-restart"));
        assert_eq!(strings(&spec), ["daemon", "--port", "2"]);

        spec.set_args(["-restart", "--port", "2"]);
        assert!(spec.is_marked("-restart"));
    }

    #[test]
    fn test_streams_inherited_by_default() {
        let spec = spec(&["daemon"]);
        assert_eq!(spec.stdin, StdioMode::Inherit);
        assert_eq!(spec.stdout, StdioMode::Inherit);
        assert_eq!(spec.stderr, StdioMode::Inherit);
    }

    #[test]
    fn test_spawn_runs_program() {
        let mut spec = spec(&["molt-test"]);
        spec.set_program("true");
        spec.set_args(Vec::<String>::new());
        let status = spec.spawn().unwrap().wait().unwrap();
        assert!(status.success());
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let mut spec = spec(&["/nonexistent/molt-replacement"]);
        spec.stdout = StdioMode::Null;
        assert!(spec.spawn().is_err());
    }

    #[test]
    fn test_env_reaches_child() {
        let mut spec = spec(&["molt-test"]);
        spec.set_program("sh");
        spec.set_args(["-c", r#"[ "$MOLT_PROBE" = present ]"#]);
        spec.env("MOLT_PROBE", "present");
        let status = spec.spawn().unwrap().wait().unwrap();
        assert!(status.success());
    }

    #[test]
    fn test_invalid_fd_name_rejected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut spec = spec(&["daemon"]);
        assert!(spec.pass_fd("", listener.as_fd()).is_err());
        assert!(spec.pass_fd("a:b", listener.as_fd()).is_err());
        assert!(spec.pass_fd("http", listener.as_fd()).is_ok());
        assert_eq!(spec.fd_names().collect::<Vec<_>>(), ["http"]);
    }

    /// Passed sockets show up at fd 3.. with the LISTEN_* env describing them.
    #[test]
    fn test_passed_fds_visible_in_child() {
        let http = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let admin = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let mut spec = spec(&["molt-test"]);
        spec.set_program("sh");
        spec.set_args([
            "-c",
            r#"[ "$LISTEN_FDS" = 2 ] && [ "$LISTEN_FD_NAMES" = http:admin ] && exec 5<&3 6<&4"#,
        ]);
        spec.pass_fd("http", http.as_fd()).unwrap();
        spec.pass_fd("admin", admin.as_fd()).unwrap();

        let status = spec.spawn().unwrap().wait().unwrap();
        assert!(status.success());
    }

    #[test]
    fn test_dup_at_least_respects_floor() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dup = dup_at_least(listener.as_fd(), 100).unwrap();
        assert!(dup.as_raw_fd() >= 100);

        let flags = unsafe { libc::fcntl(dup.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }
}
