//! Detecting a running daemon and launching one when needed.

use super::fetch::{FetchError, HttpFetcher, ModelFetcher, ModelSpec};
use super::launcher::{LaunchRequest, Launcher, ProcessLauncher};
use super::socket;
use crate::config::{Config, Paths, SOCKET_PATH};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Delay between two liveness checks after a launch.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Liveness checks before giving up (6 s at the default interval).
pub const MAX_POLLS: u32 = 30;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("model '{id}' is unavailable: {source}")]
    Model {
        id: String,
        #[source]
        source: FetchError,
    },

    #[error("failed to launch daemon: {0}")]
    Launch(#[from] std::io::Error),

    #[error("daemon process exited with {status}")]
    Exited { status: ExitStatus, log: String },

    #[error("daemon did not start listening within {waited:?}")]
    Timeout { waited: Duration, log: String },
}

impl ProbeError {
    /// Log captured from the failed daemon, if it got that far.
    pub fn daemon_log(&self) -> Option<&str> {
        match self {
            ProbeError::Exited { log, .. } | ProbeError::Timeout { log, .. } => Some(log),
            _ => None,
        }
    }
}

/// Client-side view of the daemon: is it up, and if not, bring it up.
pub struct DaemonManager {
    socket_path: PathBuf,
    paths: Paths,
    default_model: String,
    fetcher: Arc<dyn ModelFetcher>,
    launcher: Arc<dyn Launcher>,
    poll_interval: Duration,
    max_polls: u32,
}

impl DaemonManager {
    pub fn new(config: &Config) -> Self {
        Self {
            socket_path: PathBuf::from(SOCKET_PATH),
            paths: Paths::discover(),
            default_model: config.model.id.clone(),
            fetcher: Arc::new(HttpFetcher::new()),
            launcher: Arc::new(ProcessLauncher::new()),
            poll_interval: POLL_INTERVAL,
            max_polls: MAX_POLLS,
        }
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_paths(mut self, paths: Paths) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ModelFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn is_running(&self) -> bool {
        socket::is_running(&self.socket_path).await
    }

    /// Make sure a daemon is listening, launching one if needed.
    ///
    /// Prints the cause and any daemon log to stderr on failure.
    pub async fn ensure_running(&self, model: Option<&str>) -> bool {
        match self.try_ensure_running(model).await {
            Ok(()) => true,
            Err(e) => {
                eprintln!("{e}");
                if let Some(log) = e.daemon_log() {
                    eprintln!("Daemon failed to start. Log contents:");
                    eprint!("{log}");
                    if !log.is_empty() && !log.ends_with('\n') {
                        eprintln!();
                    }
                }
                false
            }
        }
    }

    pub async fn try_ensure_running(&self, model: Option<&str>) -> Result<(), ProbeError> {
        if self.is_running().await {
            return Ok(());
        }

        let spec = ModelSpec::resolve(model.unwrap_or(&self.default_model));
        let model_path = spec.path_in(self.paths.cache_dir());
        if !model_path.exists() {
            info!(model = %spec.id, path = %model_path.display(), "Model not cached, fetching");
            self.fetcher
                .fetch(&spec, &model_path)
                .await
                .map_err(|source| ProbeError::Model {
                    id: spec.id.clone(),
                    source,
                })?;
        }

        let request = LaunchRequest {
            model_path,
            log_path: self.paths.daemon_log(),
        };
        let mut child = self.launcher.launch(&request)?;
        debug!(pid = child.id(), "Waiting for daemon to listen");

        for _ in 0..self.max_polls {
            if self.is_running().await {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;

            match child.try_exit() {
                Ok(Some(status)) => {
                    warn!(%status, "Daemon exited during startup");
                    return Err(ProbeError::Exited {
                        status,
                        log: read_log(&request.log_path),
                    });
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Could not poll daemon process"),
            }
        }

        if self.is_running().await {
            return Ok(());
        }

        Err(ProbeError::Timeout {
            waited: self.poll_interval * self.max_polls,
            log: read_log(&request.log_path),
        })
    }
}

fn read_log(path: &Path) -> String {
    std::fs::read_to_string(path)
        .unwrap_or_else(|e| format!("(could not read {}: {})\n", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::launcher::DaemonProcess;
    use async_trait::async_trait;
    use std::process::Command;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingFetcher;

    #[async_trait]
    impl ModelFetcher for FailingFetcher {
        async fn fetch(&self, spec: &ModelSpec, _dest: &Path) -> Result<(), FetchError> {
            Err(FetchError::NoSource(spec.id.clone()))
        }
    }

    /// Runs a shell snippet in place of the daemon, writing to the log.
    struct ShellLauncher {
        script: String,
        launches: AtomicUsize,
    }

    impl ShellLauncher {
        fn new(script: &str) -> Self {
            Self {
                script: script.to_string(),
                launches: AtomicUsize::new(0),
            }
        }
    }

    impl Launcher for ShellLauncher {
        fn launch(&self, request: &LaunchRequest) -> std::io::Result<Box<dyn DaemonProcess>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            std::fs::create_dir_all(request.log_path.parent().unwrap())?;
            let log = std::fs::File::create(&request.log_path)?;
            let child = Command::new("sh")
                .arg("-c")
                .arg(&self.script)
                .stdout(log.try_clone()?)
                .stderr(log)
                .spawn()?;
            Ok(Box::new(child))
        }
    }

    fn manager(dir: &Path, launcher: Arc<ShellLauncher>) -> DaemonManager {
        DaemonManager::new(&Config::default())
            .with_socket_path(dir.join("llx.sock"))
            .with_paths(Paths::with_cache_dir(dir))
            .with_fetcher(Arc::new(FailingFetcher))
            .with_launcher(launcher)
            .with_polling(Duration::from_millis(50), 40)
    }

    #[tokio::test]
    async fn test_not_running_without_socket() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(ShellLauncher::new("exit 0"));
        assert!(!manager(dir.path(), launcher).is_running().await);
    }

    #[tokio::test]
    async fn test_missing_model_never_launches() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(ShellLauncher::new("exit 0"));
        let manager = manager(dir.path(), Arc::clone(&launcher));

        let err = manager.try_ensure_running(Some("absent")).await.unwrap_err();
        assert!(matches!(err, ProbeError::Model { ref id, .. } if id == "absent"));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
        assert!(!manager.ensure_running(Some("absent")).await);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_early_exit_surfaces_log() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tiny.gguf"), b"gguf").unwrap();
        let launcher = Arc::new(ShellLauncher::new("echo 'out of memory'; exit 3"));
        let manager = manager(dir.path(), Arc::clone(&launcher));

        let err = manager.try_ensure_running(Some("tiny")).await.unwrap_err();
        match &err {
            ProbeError::Exited { status, log } => {
                assert_eq!(status.code(), Some(3));
                assert!(log.contains("out of memory"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_silent_daemon_times_out() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tiny.gguf"), b"gguf").unwrap();
        let launcher = Arc::new(ShellLauncher::new("echo loading; sleep 2"));
        let manager = manager(dir.path(), launcher).with_polling(Duration::from_millis(20), 10);

        let err = manager.try_ensure_running(Some("tiny")).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout { .. }));
        assert!(err.daemon_log().unwrap().contains("loading"));
    }

    #[tokio::test]
    async fn test_already_running_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let _listener = std::os::unix::net::UnixListener::bind(dir.path().join("llx.sock")).unwrap();
        let launcher = Arc::new(ShellLauncher::new("exit 1"));
        let manager = manager(dir.path(), Arc::clone(&launcher));

        assert!(manager.ensure_running(None).await);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }
}
