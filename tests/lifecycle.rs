//! End-to-end daemon lifecycle tests on a temporary socket.

use async_trait::async_trait;
use llx::client::fetch::{FetchError, ModelFetcher, ModelSpec};
use llx::client::launcher::{DaemonProcess, LaunchRequest, Launcher};
use llx::client::{is_running, send_prompt, send_shutdown, DaemonManager};
use llx::config::{Config, Paths};
use llx::daemon::engine::{
    ChatTurn, ContextParams, EngineContext, EngineError, ModelEngine, SamplingParams, Token,
};
use llx::daemon::{Daemon, DaemonConfig, DaemonHandle};
use llx::protocol::{ControlCommand, Envelope, SHUTDOWN_ACK};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const EOG: Token = Token(2);
const ANSWER: &[&str] = &["```bash", "\n", "ls -la", "\n", "```"];

/// Always answers with the same fenced command.
struct CannedEngine {
    dropped: Arc<AtomicBool>,
}

impl CannedEngine {
    fn new() -> (Self, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        (
            Self {
                dropped: Arc::clone(&dropped),
            },
            dropped,
        )
    }

    fn boxed() -> Box<dyn ModelEngine> {
        Box::new(Self::new().0)
    }
}

impl Drop for CannedEngine {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

struct CannedContext {
    step: usize,
}

impl ModelEngine for CannedEngine {
    fn describe(&self) -> String {
        "canned".to_string()
    }

    fn create_context(
        &self,
        _params: &ContextParams,
        _sampling: &SamplingParams,
    ) -> Result<Box<dyn EngineContext + '_>, EngineError> {
        Ok(Box::new(CannedContext { step: 0 }))
    }

    fn apply_chat_template(&self, turns: &[ChatTurn]) -> Result<String, EngineError> {
        Ok(turns
            .iter()
            .map(|t| format!("<{}>{}", t.role.as_str(), t.content))
            .collect())
    }

    fn token_to_text(&self, token: Token) -> Result<Vec<u8>, EngineError> {
        ANSWER
            .get((token.0 - 10) as usize)
            .map(|piece| piece.as_bytes().to_vec())
            .ok_or(EngineError::Detokenize(token))
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        token == EOG
    }

    fn is_sequence_boundary(&self, token: Token) -> bool {
        token == Token(1) || token == EOG
    }
}

impl EngineContext for CannedContext {
    fn tokenize(&mut self, text: &str) -> Result<Vec<Token>, EngineError> {
        Ok(text.split_whitespace().map(|_| Token(3)).collect())
    }

    fn evaluate(&mut self, _tokens: &[Token], _logits_last: bool) -> Result<(), EngineError> {
        Ok(())
    }

    fn sample_next(&mut self) -> Result<Token, EngineError> {
        let token = if self.step < ANSWER.len() {
            Token(10 + self.step as i32)
        } else {
            EOG
        };
        self.step += 1;
        Ok(token)
    }
}

fn start(socket: &Path, engine: Box<dyn ModelEngine>) -> DaemonHandle {
    let config = DaemonConfig::new(socket)
        .with_system_prompt("You answer with one command.")
        .with_read_timeout(Duration::from_millis(300));
    Daemon::start(config, engine).unwrap()
}

async fn prompt(socket: &Path, text: &str) -> String {
    let mut out = Vec::new();
    send_prompt(socket, text, |chunk| {
        out.extend_from_slice(chunk);
        Ok(())
    })
    .await
    .unwrap();
    String::from_utf8(out).unwrap()
}

async fn wait_stopped(handle: &mut DaemonHandle) {
    tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("daemon did not stop");
}

/// Starts the daemon inside the test process instead of forking.
struct InProcessLauncher {
    socket: PathBuf,
    handle: Mutex<Option<DaemonHandle>>,
    launches: AtomicUsize,
}

struct InProcessDaemon;

impl DaemonProcess for InProcessDaemon {
    fn id(&self) -> u32 {
        std::process::id()
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        Ok(None)
    }
}

impl Launcher for InProcessLauncher {
    fn launch(&self, request: &LaunchRequest) -> io::Result<Box<dyn DaemonProcess>> {
        assert!(request.model_path.exists());
        self.launches.fetch_add(1, Ordering::SeqCst);
        let handle = start(&self.socket, CannedEngine::boxed());
        *self.handle.lock().unwrap() = Some(handle);
        Ok(Box::new(InProcessDaemon))
    }
}

struct NoFetch;

#[async_trait]
impl ModelFetcher for NoFetch {
    async fn fetch(&self, spec: &ModelSpec, _dest: &Path) -> Result<(), FetchError> {
        Err(FetchError::NoSource(spec.id.clone()))
    }
}

#[tokio::test]
async fn test_prompt_launches_daemon_and_streams_response() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("llx.sock");
    std::fs::write(dir.path().join("tiny.gguf"), b"gguf").unwrap();

    let launcher = Arc::new(InProcessLauncher {
        socket: socket.clone(),
        handle: Mutex::new(None),
        launches: AtomicUsize::new(0),
    });
    let manager = DaemonManager::new(&Config::default())
        .with_socket_path(&socket)
        .with_paths(Paths::with_cache_dir(dir.path()))
        .with_fetcher(Arc::new(NoFetch))
        .with_launcher(launcher.clone());

    assert!(!manager.is_running().await);
    assert!(manager.ensure_running(Some("tiny")).await);
    assert!(manager.ensure_running(Some("tiny")).await);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

    let response = prompt(&socket, "list files in the current directory").await;
    assert_eq!(response, "```bash\nls -la\n```\n");

    let mut handle = launcher.handle.lock().unwrap().take().unwrap();
    assert!(handle.shutdown());
    wait_stopped(&mut handle).await;
}

#[tokio::test]
async fn test_missing_model_is_not_launched() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("llx.sock");
    let launcher = Arc::new(InProcessLauncher {
        socket: socket.clone(),
        handle: Mutex::new(None),
        launches: AtomicUsize::new(0),
    });
    let manager = DaemonManager::new(&Config::default())
        .with_socket_path(&socket)
        .with_paths(Paths::with_cache_dir(dir.path()))
        .with_fetcher(Arc::new(NoFetch))
        .with_launcher(launcher.clone());

    assert!(!manager.ensure_running(Some("absent")).await);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_shutdown_request_removes_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("llx.sock");
    let (engine, dropped) = CannedEngine::new();
    let mut handle = start(&socket, Box::new(engine));
    assert!(is_running(&socket).await);

    let reply = send_shutdown(&socket).await.unwrap();
    assert_eq!(reply, SHUTDOWN_ACK);

    wait_stopped(&mut handle).await;
    assert!(!socket.exists());
    assert!(!is_running(&socket).await);
    assert!(dropped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_empty_prompt_does_not_crash_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("llx.sock");
    let mut handle = start(&socket, CannedEngine::boxed());

    let _ = prompt(&socket, "").await;
    assert_eq!(prompt(&socket, "list files").await, "```bash\nls -la\n```\n");

    handle.shutdown();
    wait_stopped(&mut handle).await;
}

#[tokio::test]
async fn test_malformed_clients_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("llx.sock");
    let mut handle = start(&socket, CannedEngine::boxed());

    // Announces 10 bytes, delivers 3, then hangs up.
    let mut short = UnixStream::connect(&socket).unwrap();
    short.write_all(&[0, 0, 0, 0, 10]).unwrap();
    short.write_all(b"abc").unwrap();
    short.shutdown(std::net::Shutdown::Write).unwrap();
    let mut rest = Vec::new();
    short.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    // Unknown message type.
    let mut bogus = UnixStream::connect(&socket).unwrap();
    bogus.write_all(&[9, 0, 0, 0, 0]).unwrap();
    let mut rest = Vec::new();
    bogus.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    // Connects and never sends anything; the read timeout releases it.
    let _silent = UnixStream::connect(&socket).unwrap();

    assert_eq!(prompt(&socket, "list files").await, "```bash\nls -la\n```\n");

    handle.shutdown();
    wait_stopped(&mut handle).await;
}

#[tokio::test]
async fn test_concurrent_prompts_are_served_in_turn() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("llx.sock");
    let mut handle = start(&socket, CannedEngine::boxed());

    let (a, b, c) = tokio::join!(
        prompt(&socket, "first"),
        prompt(&socket, "second"),
        prompt(&socket, "third"),
    );
    for response in [a, b, c] {
        assert_eq!(response, "```bash\nls -la\n```\n");
    }

    handle.shutdown();
    wait_stopped(&mut handle).await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("llx.sock");
    let (engine, dropped) = CannedEngine::new();
    let mut handle = start(&socket, Box::new(engine));

    let mut raw = UnixStream::connect(&socket).unwrap();
    raw.write_all(&Envelope::control(ControlCommand::Shutdown).encode())
        .unwrap();
    let first = handle.shutdown();
    let second = handle.shutdown();
    assert!(!(first && second));

    wait_stopped(&mut handle).await;
    wait_stopped(&mut handle).await;
    assert!(handle.is_shutting_down());
    assert!(!handle.shutdown());
    assert!(!socket.exists());
    assert!(dropped.load(Ordering::SeqCst));
}
