//! I/O relay loop
//!
//! Copies PTY output to the outbound broadcast channel while the bridge is
//! running. Level-triggered: every tick re-checks readiness with a
//! zero-timeout poll and reads at most one bounded chunk, so a dead
//! descriptor never blocks the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::pty::{PtyError, PtySession, MAX_READ_BYTES};

/// Delay between readiness checks
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A decoded chunk of PTY output, forwarded as one outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyOutput {
    pub data: String,
}

/// Why the relay loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The bridge's running flag was cleared
    Stopped,
    /// The session was dropped or its descriptor closed
    SessionClosed,
    /// A read or poll failed, usually because the child exited
    ReadFailed,
}

/// Background task moving bytes from one PTY session to the output channel
pub struct RelayLoop {
    session: Weak<PtySession>,
    running: Arc<AtomicBool>,
    output_tx: broadcast::Sender<PtyOutput>,
    max_read_bytes: usize,
}

impl RelayLoop {
    /// Create a relay for `session`
    ///
    /// Only a weak reference is kept; the bridge owns the session.
    pub fn new(
        session: &Arc<PtySession>,
        running: Arc<AtomicBool>,
        output_tx: broadcast::Sender<PtyOutput>,
    ) -> Self {
        Self {
            session: Arc::downgrade(session),
            running,
            output_tx,
            max_read_bytes: MAX_READ_BYTES,
        }
    }

    /// Override the per-read byte bound
    pub fn with_max_read_bytes(mut self, max_read_bytes: usize) -> Self {
        self.max_read_bytes = max_read_bytes;
        self
    }

    /// Spawn the loop on the tokio runtime
    pub fn spawn(self) -> JoinHandle<RelayExit> {
        tokio::spawn(self.run())
    }

    /// Run until stopped or the PTY goes away
    pub async fn run(self) -> RelayExit {
        let exit = loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            if !self.running.load(Ordering::Acquire) {
                break RelayExit::Stopped;
            }

            let Some(session) = self.session.upgrade() else {
                break RelayExit::SessionClosed;
            };

            match session.is_readable().await {
                Ok(false) => continue,
                Ok(true) => {}
                Err(PtyError::Closed) => break RelayExit::SessionClosed,
                Err(e) => {
                    debug!(session = %session.id(), "PTY poll failed: {}", e);
                    break RelayExit::ReadFailed;
                }
            }

            match session.read(self.max_read_bytes).await {
                Ok(data) if data.is_empty() => {}
                Ok(data) => {
                    // No subscribers is fine; output is dropped.
                    let _ = self.output_tx.send(PtyOutput { data });
                }
                Err(PtyError::Closed) => break RelayExit::SessionClosed,
                Err(e) => {
                    debug!(session = %session.id(), "PTY read ended: {}", e);
                    break RelayExit::ReadFailed;
                }
            }
        };

        info!(reason = ?exit, "Relay loop exited");
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::pty::TerminalSize;
    use tokio::time::timeout;

    fn open(command: &str, args: &[&str]) -> Arc<PtySession> {
        let config = SessionConfig::new(command)
            .with_args(args.iter().map(|s| s.to_string()).collect());
        Arc::new(PtySession::open(&config, TerminalSize::default()).unwrap())
    }

    async fn collect_until(rx: &mut broadcast::Receiver<PtyOutput>, needle: &str) -> String {
        let mut collected = String::new();
        let _ = timeout(Duration::from_secs(3), async {
            while let Ok(chunk) = rx.recv().await {
                collected.push_str(&chunk.data);
                if collected.contains(needle) {
                    break;
                }
            }
        })
        .await;
        collected
    }

    #[tokio::test]
    async fn test_forwards_output_then_exits_on_child_exit() {
        let session = open("echo", &["relayed"]);
        let running = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = broadcast::channel(64);

        let handle = RelayLoop::new(&session, Arc::clone(&running), tx).spawn();

        let output = collect_until(&mut rx, "relayed").await;
        assert!(output.contains("relayed"));

        // EIO on Linux, EOF elsewhere
        let exit = timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
        assert_ne!(exit, RelayExit::Stopped);

        session.terminate().await;
    }

    #[tokio::test]
    async fn test_stops_when_running_cleared() {
        let session = open("cat", &[]);
        let running = Arc::new(AtomicBool::new(true));
        let (tx, _rx) = broadcast::channel(64);

        let handle = RelayLoop::new(&session, Arc::clone(&running), tx).spawn();
        running.store(false, Ordering::Release);

        let exit = timeout(POLL_INTERVAL * 20, handle).await.unwrap().unwrap();
        assert_eq!(exit, RelayExit::Stopped);

        session.terminate().await;
    }

    #[tokio::test]
    async fn test_exits_when_session_terminated() {
        let session = open("cat", &[]);
        let running = Arc::new(AtomicBool::new(true));
        let (tx, _rx) = broadcast::channel(64);

        let handle = RelayLoop::new(&session, Arc::clone(&running), tx).spawn();
        session.terminate().await;

        let exit = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(exit, RelayExit::SessionClosed);
    }

    #[tokio::test]
    async fn test_exits_when_session_dropped() {
        let session = open("cat", &[]);
        let running = Arc::new(AtomicBool::new(true));
        let (tx, _rx) = broadcast::channel(64);

        let handle = RelayLoop::new(&session, Arc::clone(&running), tx).spawn();
        drop(session);

        let exit = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(exit, RelayExit::SessionClosed);
    }

    #[tokio::test]
    async fn test_preserves_order_with_small_reads() {
        let session = open("cat", &[]);
        let running = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = broadcast::channel(1024);

        let handle = RelayLoop::new(&session, Arc::clone(&running), tx)
            .with_max_read_bytes(4)
            .spawn();

        session.write(b"abcdefghijklmnop\n").await.unwrap();
        let output = collect_until(&mut rx, "abcdefghijklmnop\r\nabcdefghijklmnop").await;
        assert!(output.starts_with("abcdefghijklmnop"));

        running.store(false, Ordering::Release);
        let _ = handle.await;
        session.terminate().await;
    }
}
