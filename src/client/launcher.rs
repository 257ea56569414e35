//! Launching the daemon as a detached background process.

use std::fs::File;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use tracing::debug;

/// Name of the daemon executable.
pub const DAEMON_BIN: &str = "llxd";

/// Upper bound on the descriptors swept in the child.
const MAX_FD_SWEEP: libc::c_int = 4096;

/// What to launch and where its output goes.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub model_path: PathBuf,
    pub log_path: PathBuf,
}

/// A launched daemon the prober can watch for early exit.
pub trait DaemonProcess: Send {
    fn id(&self) -> u32;

    /// Non-blocking check for termination.
    fn try_exit(&mut self) -> io::Result<Option<ExitStatus>>;
}

impl DaemonProcess for Child {
    fn id(&self) -> u32 {
        Child::id(self)
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.try_wait()
    }
}

/// Starts a daemon process.
pub trait Launcher: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> io::Result<Box<dyn DaemonProcess>>;
}

/// Spawns the real `llxd` executable.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    executable: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific daemon executable instead of searching for one.
    pub fn with_executable(path: impl Into<PathBuf>) -> Self {
        Self {
            executable: Some(path.into()),
        }
    }

    /// Locate `llxd`: next to the running executable, then on `PATH`, then
    /// in the current directory.
    pub fn daemon_path(&self) -> PathBuf {
        if let Some(path) = &self.executable {
            return path.clone();
        }

        if let Some(sibling) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DAEMON_BIN)))
            .filter(|p| p.exists())
        {
            return sibling;
        }

        if let Ok(found) = which::which(DAEMON_BIN) {
            return found;
        }

        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(DAEMON_BIN)
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, request: &LaunchRequest) -> io::Result<Box<dyn DaemonProcess>> {
        let daemon = self.daemon_path();
        if !daemon.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("could not find {} executable at {}", DAEMON_BIN, daemon.display()),
            ));
        }

        let log = open_fresh_log(&request.log_path)?;
        let log_err = log.try_clone()?;

        let mut command = Command::new(&daemon);
        command
            .arg("-m")
            .arg(&request.model_path)
            .arg("-d")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        // SAFETY: the hook only calls async-signal-safe libc functions.
        unsafe {
            command.pre_exec(detach_child);
        }

        let child = command.spawn()?;
        debug!(pid = child.id(), daemon = %daemon.display(), "Spawned daemon");
        Ok(Box::new(child))
    }
}

/// Truncate (or create) the log so it only holds this launch's output.
fn open_fresh_log(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    File::create(path)
}

/// Runs in the forked child before exec.
///
/// Starts a new session so the daemon outlives the client's terminal, and
/// marks every descriptor above stdio close-on-exec so nothing the client
/// holds leaks into the daemon.
fn detach_child() -> io::Result<()> {
    // SAFETY: plain syscalls on the child's own process state.
    unsafe {
        if libc::setsid() < 0 {
            return Err(io::Error::last_os_error());
        }

        let open_max = libc::sysconf(libc::_SC_OPEN_MAX);
        let limit = if open_max <= 0 {
            1024
        } else {
            (open_max as libc::c_int).min(MAX_FD_SWEEP)
        };

        for fd in 3..limit {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags >= 0 {
                libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
            }
        }
    }
    Ok(())
}
