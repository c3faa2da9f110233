//! Session bridge
//!
//! Owns the start/stop lifecycle, the single PTY session, and the entry
//! points the transport calls into (connect, input, resize).

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::pty::{PtyError, PtySession, TerminalSize};
use crate::relay::{PtyOutput, RelayExit, RelayLoop};
use crate::server;

/// Capacity of the outbound output channel
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// How long `stop` waits for the accept loop to wind down
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors that can occur during bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Bridge is not running")]
    NotRunning,

    #[error("PTY error: {0}")]
    Pty(#[from] PtyError),
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Lifecycle phase of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgePhase {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl BridgePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BridgePhase::Starting,
            2 => BridgePhase::Running,
            3 => BridgePhase::Stopping,
            _ => BridgePhase::Idle,
        }
    }
}

/// Outcome of a connect event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new child was spawned for this connection
    Spawned { pid: Option<u32> },
    /// A session already exists; the event was ignored
    AlreadyAttached,
}

/// Held across the whole of `start` and `stop` so they never interleave
struct Lifecycle {
    shutdown_tx: Option<broadcast::Sender<()>>,
    server_task: Option<JoinHandle<()>>,
}

struct Inner {
    config: SessionConfig,
    running: Arc<AtomicBool>,
    listen_port: AtomicU16,
    phase: AtomicU8,
    lifecycle: Mutex<Lifecycle>,
    session: RwLock<Option<Arc<PtySession>>>,
    relay_task: Mutex<Option<JoinHandle<RelayExit>>>,
    output_tx: broadcast::Sender<PtyOutput>,
}

/// Bridge between one PTY session and a network transport
///
/// Cheap to clone; clones share the same state. At most one child process
/// is attached at a time. The first connect spawns it and later connects
/// are ignored until [`SessionBridge::stop`] detaches it.
#[derive(Clone)]
pub struct SessionBridge {
    inner: Arc<Inner>,
}

impl SessionBridge {
    /// Create an idle bridge
    pub fn new(config: SessionConfig) -> Self {
        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let listen_port = AtomicU16::new(config.port);

        Self {
            inner: Arc::new(Inner {
                config,
                running: Arc::new(AtomicBool::new(false)),
                listen_port,
                phase: AtomicU8::new(BridgePhase::Idle as u8),
                lifecycle: Mutex::new(Lifecycle {
                    shutdown_tx: None,
                    server_task: None,
                }),
                session: RwLock::new(None),
                relay_task: Mutex::new(None),
                output_tx,
            }),
        }
    }

    /// The configuration this bridge was built with
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Current lifecycle phase; does not wait for an in-flight start or stop
    pub fn phase(&self) -> BridgePhase {
        BridgePhase::from_u8(self.inner.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: BridgePhase) {
        debug!(?phase, "Bridge phase");
        self.inner.phase.store(phase as u8, Ordering::Release);
    }

    /// Sender side of the output channel, for the relay loop
    pub(crate) fn output_sender(&self) -> broadcast::Sender<PtyOutput> {
        self.inner.output_tx.clone()
    }

    /// Whether the bridge is running
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Port the transport listens on (the configured port before `start`)
    pub fn port(&self) -> u16 {
        self.inner.listen_port.load(Ordering::Acquire)
    }

    /// Connection URL for clients
    pub fn get_url(&self) -> String {
        format!("ws://{}:{}", self.inner.config.host, self.port())
    }

    /// Subscribe to PTY output chunks
    pub fn subscribe_output(&self) -> broadcast::Receiver<PtyOutput> {
        self.inner.output_tx.subscribe()
    }

    /// Process id of the attached child, if any
    pub async fn child_pid(&self) -> Option<u32> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .and_then(|session| session.child_pid())
    }

    /// The attached session, if any
    pub async fn session(&self) -> Option<Arc<PtySession>> {
        self.inner.session.read().await.clone()
    }

    /// Bind the listener and start accepting connections
    ///
    /// Idempotent: when already running, returns the bound port without side
    /// effects. The listener is bound before this returns, so the port is
    /// accepting connections as soon as the caller sees it.
    pub async fn start(&self) -> BridgeResult<u16> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.phase() == BridgePhase::Running {
            return Ok(self.port());
        }

        self.set_phase(BridgePhase::Starting);

        let addr = format!("{}:{}", self.inner.config.host, self.inner.config.port);
        let bound = match TcpListener::bind(&addr).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local.port())),
            Err(e) => Err(e),
        };
        let (listener, port) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                self.set_phase(BridgePhase::Idle);
                return Err(BridgeError::Bind { addr, source });
            }
        };

        self.inner.listen_port.store(port, Ordering::Release);
        self.inner.running.store(true, Ordering::Release);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server_task = tokio::spawn(server::serve(
            listener,
            self.clone(),
            shutdown_tx.clone(),
            shutdown_rx,
        ));

        lifecycle.shutdown_tx = Some(shutdown_tx);
        lifecycle.server_task = Some(server_task);
        self.set_phase(BridgePhase::Running);

        info!(port, url = %self.get_url(), "Bridge started");
        Ok(port)
    }

    /// Stop the bridge and tear down the attached session
    ///
    /// Safe to call repeatedly and before any connect.
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.phase() == BridgePhase::Idle {
            debug!("Stop requested while idle");
            return;
        }

        self.set_phase(BridgePhase::Stopping);
        self.inner.running.store(false, Ordering::Release);

        if let Some(shutdown_tx) = lifecycle.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        let session = self.inner.session.write().await.take();
        if let Some(session) = session {
            info!(session = %session.id(), pid = ?session.child_pid(), "Terminating PTY session");
            session.terminate().await;
        }

        if let Some(relay_task) = self.inner.relay_task.lock().await.take() {
            match tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, relay_task).await {
                Ok(Ok(exit)) => debug!(reason = ?exit, "Relay loop joined"),
                Ok(Err(e)) => warn!("Relay task failed: {}", e),
                Err(_) => warn!("Relay loop did not exit in time"),
            }
        }

        if let Some(server_task) = lifecycle.server_task.take() {
            if tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, server_task)
                .await
                .is_err()
            {
                warn!("Accept loop did not exit in time");
            }
        }

        self.set_phase(BridgePhase::Idle);
        info!("Bridge stopped");
    }

    /// Handle a client connecting
    ///
    /// The first connect spawns the configured command on a fresh PTY sized
    /// 24x80 and starts the relay loop. Later connects are ignored while a
    /// session is attached; a spawn failure leaves the bridge running with
    /// no session so a later connect can retry.
    pub async fn handle_connect(&self) -> BridgeResult<ConnectOutcome> {
        let mut slot = self.inner.session.write().await;

        if !self.is_running() {
            return Err(BridgeError::NotRunning);
        }

        if let Some(session) = slot.as_ref() {
            debug!(session = %session.id(), "Session already attached, ignoring connect");
            return Ok(ConnectOutcome::AlreadyAttached);
        }

        let session = Arc::new(PtySession::open(
            &self.inner.config,
            TerminalSize::default(),
        )?);
        let pid = session.child_pid();

        let relay = RelayLoop::new(
            &session,
            Arc::clone(&self.inner.running),
            self.output_sender(),
        )
        .spawn();

        *slot = Some(session);
        *self.inner.relay_task.lock().await = Some(relay);

        info!(pid = ?pid, "Attached PTY session");
        Ok(ConnectOutcome::Spawned { pid })
    }

    /// Forward client input to the child; ignored without a session
    pub async fn handle_input(&self, data: &[u8]) -> BridgeResult<()> {
        let slot = self.inner.session.read().await;
        let Some(session) = slot.as_ref() else {
            debug!(bytes = data.len(), "No session attached, dropping input");
            return Ok(());
        };

        session.write(data).await?;
        Ok(())
    }

    /// Resize the child's terminal; ignored without a session
    pub async fn handle_resize(&self, rows: u16, cols: u16) -> BridgeResult<()> {
        self.handle_resize_to(TerminalSize::new(rows, cols)).await
    }

    /// Resize the child's terminal including pixel dimensions
    pub async fn handle_resize_to(&self, size: TerminalSize) -> BridgeResult<()> {
        let slot = self.inner.session.read().await;
        let Some(session) = slot.as_ref() else {
            debug!(rows = size.rows, cols = size.cols, "No session attached, ignoring resize");
            return Ok(());
        };

        session.resize(size).await?;
        Ok(())
    }
}
