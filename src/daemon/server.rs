//! Unix socket server for the daemon.
//!
//! Two long-lived threads share a request queue: the acceptor reads one
//! envelope per connection and queues it, the worker runs inference for one
//! request at a time and streams the answer back on the same connection.

use crate::daemon::engine::{ContextParams, ModelEngine, SamplingParams, COMMAND_SAMPLING};
use crate::daemon::inference::Pipeline;
use crate::daemon::metrics::Metrics;
use crate::daemon::prompts::HostContext;
use crate::daemon::queue::{PendingRequest, QueueEntry, RequestQueue};
use crate::daemon::shutdown::ShutdownCoordinator;
use crate::protocol::{read_envelope, ControlCommand, ProtocolError, SHUTDOWN_ACK};
use anyhow::{Context, Result};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// How long the acceptor waits for a client to deliver its envelope.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// How often an idle acceptor re-checks whether it should stop.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Everything the daemon needs besides the model itself.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub context: ContextParams,
    pub sampling: SamplingParams,
    /// System instruction for every request. Gathered from the host when
    /// the worker starts if left unset.
    pub system_prompt: Option<String>,
    pub read_timeout: Duration,
}

impl DaemonConfig {
    /// Defaults for a daemon listening on `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            context: ContextParams::default(),
            sampling: COMMAND_SAMPLING,
            system_prompt: None,
            read_timeout: READ_TIMEOUT,
        }
    }

    /// Override the engine context parameters.
    pub fn with_context(mut self, context: ContextParams) -> Self {
        self.context = context;
        self
    }

    /// Use a fixed system instruction instead of the host-derived one.
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// How long a client may take to deliver its envelope.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

type Engine = Box<dyn ModelEngine>;

#[derive(Default)]
struct Threads {
    acceptor: Option<JoinHandle<UnixListener>>,
    worker: Option<JoinHandle<Engine>>,
}

/// Identity of the socket file this daemon bound, as `(dev, ino)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EndpointId(u64, u64);

impl EndpointId {
    fn of(path: &Path) -> io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self(meta.dev(), meta.ino()))
    }
}

/// State shared by the acceptor, the worker and the teardown thread.
struct Shared {
    socket_path: PathBuf,
    endpoint: Option<EndpointId>,
    queue: RequestQueue,
    accepting: AtomicBool,
    shutdown: ShutdownCoordinator,
    threads: Mutex<Threads>,
    finished: Mutex<Option<oneshot::Sender<()>>>,
}

impl Shared {
    fn threads(&self) -> MutexGuard<'_, Threads> {
        self.threads.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn begin_shutdown(self: &Arc<Self>) -> bool {
        let shared = Arc::clone(self);
        self.shutdown.trigger(move || shared.teardown())
    }

    /// Stop the acceptor and remove the endpoint if it is still ours.
    fn stop_listening(&self) {
        self.accepting.store(false, Ordering::SeqCst);

        let acceptor = self.threads().acceptor.take();
        let listener = acceptor.and_then(|acceptor| match acceptor.join() {
            Ok(listener) => Some(listener),
            Err(_) => {
                error!("Acceptor thread panicked");
                None
            }
        });

        // The bound listener pins the file's inode, so a replacement endpoint
        // can never share our identity while we check it.
        self.remove_endpoint();
        drop(listener);
    }

    fn remove_endpoint(&self) {
        let path = &self.socket_path;
        match EndpointId::of(path) {
            Ok(id) if Some(id) == self.endpoint => match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed socket {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove socket {}: {}", path.display(), e),
            },
            Ok(_) => info!("Socket {} was replaced, leaving it in place", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to inspect socket {}: {}", path.display(), e),
        }
    }

    /// Stop accepting, remove the endpoint, join both threads, release the
    /// model and report completion.
    fn teardown(&self) {
        info!("Shutting down daemon");
        self.stop_listening();

        self.queue.stop();
        self.queue.push_wake();
        let worker = self.threads().worker.take();
        if let Some(worker) = worker {
            match worker.join() {
                Ok(engine) => {
                    info!("Releasing model {}", engine.describe());
                    drop(engine);
                }
                Err(_) => error!("Worker thread panicked"),
            }
        }

        info!("Daemon stopped");
        let finished = self.finished.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(tx) = finished {
            let _ = tx.send(());
        }
    }
}

/// The llxd daemon.
pub struct Daemon;

impl Daemon {
    /// Bind the endpoint and start the acceptor and worker threads.
    ///
    /// Any stale socket file is replaced. Failing to bind or to start a
    /// thread is fatal and leaves nothing listening.
    pub fn start(config: DaemonConfig, engine: Engine) -> Result<DaemonHandle> {
        let socket_path = config.socket_path.clone();

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create socket directory: {}", parent.display())
            })?;
        }

        match std::fs::remove_file(&socket_path) {
            Ok(()) => debug!("Removed stale socket {}", socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove existing socket: {}", socket_path.display())
                })
            }
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind to socket: {}", socket_path.display()))?;
        let endpoint = match EndpointId::of(&socket_path) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Failed to inspect socket {}: {}", socket_path.display(), e);
                None
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            drop(listener);
            let _ = std::fs::remove_file(&socket_path);
            return Err(e).context("Failed to configure listener");
        }
        info!("Daemon listening on {}", socket_path.display());

        let (finished_tx, finished_rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            socket_path,
            endpoint,
            queue: RequestQueue::new(),
            accepting: AtomicBool::new(true),
            shutdown: ShutdownCoordinator::new(),
            threads: Mutex::new(Threads::default()),
            finished: Mutex::new(Some(finished_tx)),
        });

        let spawned = {
            // Hold the lock so a very early shutdown cannot miss the handles.
            let mut threads = shared.threads();
            spawn_threads(&mut threads, &shared, listener, engine, config)
        };
        if let Err(e) = spawned {
            shared.stop_listening();
            return Err(e);
        }

        Ok(DaemonHandle {
            shared,
            finished: finished_rx,
            stopped: false,
        })
    }
}

fn spawn_threads(
    threads: &mut Threads,
    shared: &Arc<Shared>,
    listener: UnixListener,
    engine: Engine,
    config: DaemonConfig,
) -> Result<()> {
    let read_timeout = config.read_timeout;
    let acceptor_shared = Arc::clone(shared);
    threads.acceptor = Some(
        thread::Builder::new()
            .name("llxd-accept".to_string())
            .spawn(move || accept_loop(listener, acceptor_shared, read_timeout))
            .context("Failed to spawn acceptor thread")?,
    );

    let worker_shared = Arc::clone(shared);
    threads.worker = Some(
        thread::Builder::new()
            .name("llxd-worker".to_string())
            .spawn(move || worker_loop(engine, worker_shared, config))
            .context("Failed to spawn worker thread")?,
    );
    Ok(())
}

/// Owner-side view of a running daemon.
pub struct DaemonHandle {
    shared: Arc<Shared>,
    finished: oneshot::Receiver<()>,
    stopped: bool,
}

impl DaemonHandle {
    /// The endpoint this daemon bound.
    pub fn socket_path(&self) -> &Path {
        &self.shared.socket_path
    }

    /// Request shutdown from outside the daemon, e.g. on a signal.
    pub fn shutdown(&self) -> bool {
        self.shared.begin_shutdown()
    }

    /// Whether teardown has been started, by any path.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_shutting_down()
    }

    /// Resolve once teardown has completed. Safe to cancel and call again.
    pub async fn wait(&mut self) {
        if self.stopped {
            return;
        }
        // A dropped sender means teardown is gone too.
        let _ = (&mut self.finished).await;
        self.stopped = true;
    }
}

/// Delay after a failed accept, doubling up to a ceiling.
#[derive(Debug)]
struct AcceptBackoff {
    next: Duration,
}

impl AcceptBackoff {
    const FLOOR: Duration = Duration::from_millis(10);
    const CEILING: Duration = Duration::from_secs(1);

    fn new() -> Self {
        Self { next: Self::FLOOR }
    }

    fn failed(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(Self::CEILING);
        delay
    }

    fn reset(&mut self) {
        self.next = Self::FLOOR;
    }
}

/// Wait up to `timeout` for a pending connection.
fn wait_readable(listener: &UnixListener, timeout: Duration) -> io::Result<bool> {
    let mut fd = libc::pollfd {
        fd: listener.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: `fd` is a valid pollfd for the duration of the call.
    let ready = unsafe { libc::poll(&mut fd, 1, millis) };
    if ready < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(ready > 0)
}

/// Accept and queue requests until told to stop. Hands the listener back so
/// the endpoint stays bound until teardown has dealt with the socket file.
fn accept_loop(
    listener: UnixListener,
    shared: Arc<Shared>,
    read_timeout: Duration,
) -> UnixListener {
    let mut backoff = AcceptBackoff::new();

    while shared.accepting.load(Ordering::SeqCst) {
        match wait_readable(&listener, ACCEPT_POLL) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                let delay = backoff.failed();
                warn!("Failed to poll listener: {} (retrying in {:?})", e, delay);
                thread::sleep(delay);
                continue;
            }
        }

        let stream = match listener.accept() {
            Ok((stream, _)) => {
                backoff.reset();
                stream
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                let delay = backoff.failed();
                warn!("Failed to accept connection: {} (retrying in {:?})", e, delay);
                thread::sleep(delay);
                continue;
            }
        };
        if !shared.accepting.load(Ordering::SeqCst) {
            break;
        }
        debug!("Client connected");

        let request = match read_request(stream, read_timeout) {
            Ok(request) => request,
            Err(e) => {
                debug!("Dropping connection: {}", e);
                continue;
            }
        };

        let is_shutdown = request.envelope.is_shutdown();
        shared.queue.push(request);

        if is_shutdown {
            info!("Shutdown requested, no longer accepting connections");
            shared.accepting.store(false, Ordering::SeqCst);
            break;
        }
    }
    debug!("Acceptor stopped");
    listener
}

fn read_request(
    mut stream: UnixStream,
    read_timeout: Duration,
) -> Result<PendingRequest, ProtocolError> {
    // Accepted sockets may inherit the listener's non-blocking mode.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(read_timeout))?;
    let envelope = read_envelope(&mut stream)?;
    stream.set_read_timeout(None)?;
    Ok(PendingRequest {
        connection: stream,
        envelope,
    })
}

fn worker_loop(engine: Engine, shared: Arc<Shared>, config: DaemonConfig) -> Engine {
    info!("Worker ready with model {}", engine.describe());
    let system_prompt = config
        .system_prompt
        .unwrap_or_else(|| HostContext::gather().system_prompt());
    let mut metrics = Metrics::new();
    {
        let pipeline = Pipeline::new(
            engine.as_ref(),
            config.context,
            config.sampling,
            &system_prompt,
        );
        while let Some(entry) = shared.queue.pop() {
            match entry {
                QueueEntry::Request(request) => {
                    handle_request(&pipeline, &shared, request, &mut metrics)
                }
                QueueEntry::Wake => debug!("Discarding wake entry"),
            }
        }
    }
    debug!("Worker stopped");
    engine
}

fn handle_request(
    pipeline: &Pipeline<'_>,
    shared: &Arc<Shared>,
    request: PendingRequest,
    metrics: &mut Metrics,
) {
    let PendingRequest {
        mut connection,
        envelope,
    } = request;

    match envelope.control_command() {
        Ok(Some(ControlCommand::Shutdown)) => {
            info!("Received shutdown request");
            if let Err(e) = connection.write_all(SHUTDOWN_ACK.as_bytes()) {
                debug!("Failed to confirm shutdown: {}", e);
            }
            drop(connection);
            shared.begin_shutdown();
        }
        Ok(None) => {
            let prompt = envelope.prompt_text();
            debug!(prompt = %prompt, "Serving prompt");
            metrics.on_request_start();
            match pipeline.run(&prompt, &mut connection, metrics) {
                Ok(completion) => debug!(rounds = completion.rounds.len(), "Request complete"),
                Err(e) => warn!("Request aborted: {}", e),
            }
            metrics.on_request_end();
        }
        Err(e) => warn!("Ignoring malformed control message: {}", e),
    }
}
