//! PTY session
//!
//! Owns one pseudo-terminal and the child process attached to it:
//! - Spawning the command on the slave side
//! - Readiness polling and reads on the master
//! - Input writes
//! - Window size changes (TIOCSWINSZ)
//! - Teardown with SIGTERM and descriptor close

use std::io::{Read, Write};
use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Utf8Decoder;
use crate::config::SessionConfig;

/// Recommended upper bound for a single read from the master
pub const MAX_READ_BYTES: usize = 20 * 1024;

/// Errors that can occur during PTY operations
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    OpenFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to write to PTY: {0}")]
    WriteFailed(String),

    #[error("Failed to read from PTY: {0}")]
    ReadFailed(String),

    #[error("Failed to resize PTY: {0}")]
    ResizeFailed(String),

    #[error("PTY descriptor is closed")]
    Closed,
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Terminal window size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

impl TerminalSize {
    /// Create a size with zeroed pixel fields
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Set the pixel dimensions
    pub fn with_pixels(mut self, pixel_width: u16, pixel_height: u16) -> Self {
        self.pixel_width = pixel_width;
        self.pixel_height = pixel_height;
        self
    }

    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: self.pixel_width,
            pixel_height: self.pixel_height,
        }
    }
}

impl From<PtySize> for TerminalSize {
    fn from(size: PtySize) -> Self {
        Self {
            rows: size.rows,
            cols: size.cols,
            pixel_width: size.pixel_width,
            pixel_height: size.pixel_height,
        }
    }
}

/// Master side of the PTY. Present until the session is terminated.
struct MasterIo {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    fd: RawFd,
    decoder: Utf8Decoder,
}

/// A child process running on its own pseudo-terminal
pub struct PtySession {
    id: Uuid,
    child_pid: Option<u32>,
    io: Mutex<Option<MasterIo>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    size: Mutex<TerminalSize>,
}

impl PtySession {
    /// Allocate a PTY and spawn the configured command on it
    pub fn open(config: &SessionConfig, size: TerminalSize) -> PtyResult<Self> {
        let id = Uuid::new_v4();

        let pair = native_pty_system()
            .openpty(size.to_pty_size())
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&config.command);
        cmd.args(&config.args);
        if let Some(dir) = config
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
        {
            cmd.cwd(dir);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("{}: {}", config.command, e)))?;

        // The child holds its own slave handle; ours would keep the PTY alive
        // after the child exits.
        drop(pair.slave);

        let fd = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| PtyError::OpenFailed("master has no file descriptor".to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let child_pid = child.process_id();
        info!(session = %id, pid = ?child_pid, command = %config.command, "Spawned PTY child");

        Ok(Self {
            id,
            child_pid,
            io: Mutex::new(Some(MasterIo {
                master: pair.master,
                reader,
                fd,
                decoder: Utf8Decoder::new(),
            })),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(Some(child)),
            size: Mutex::new(size),
        })
    }

    /// Session identifier used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Process id of the child
    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Last size set through this session
    pub async fn size(&self) -> TerminalSize {
        *self.size.lock().await
    }

    /// Whether the master descriptor has been closed
    pub async fn is_closed(&self) -> bool {
        self.io.lock().await.is_none()
    }

    /// Read the window size back from the kernel
    pub async fn window_size(&self) -> PtyResult<TerminalSize> {
        let io = self.io.lock().await;
        let io = io.as_ref().ok_or(PtyError::Closed)?;
        io.master
            .get_size()
            .map(TerminalSize::from)
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))
    }

    /// Set the terminal window size, delivering SIGWINCH to the child
    pub async fn resize(&self, size: TerminalSize) -> PtyResult<()> {
        let io = self.io.lock().await;
        let io = io
            .as_ref()
            .ok_or_else(|| PtyError::ResizeFailed("descriptor closed".to_string()))?;

        io.master
            .resize(size.to_pty_size())
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;
        *self.size.lock().await = size;

        debug!(session = %self.id, rows = size.rows, cols = size.cols, "Resized PTY");
        Ok(())
    }

    /// Zero-timeout readiness check on the master
    ///
    /// Hang-up and error conditions count as ready so the following read
    /// observes them.
    pub async fn is_readable(&self) -> PtyResult<bool> {
        let io = self.io.lock().await;
        let io = io.as_ref().ok_or(PtyError::Closed)?;

        // SAFETY: `io.fd` belongs to `io.master`, which outlives this borrow
        // because the lock is held until we return.
        let fd = unsafe { BorrowedFd::borrow_raw(io.fd) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];

        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(fds[0].revents().is_some_and(|revents| {
                revents.intersects(
                    PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL,
                )
            })),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(PtyError::ReadFailed(e.to_string())),
        }
    }

    /// Read up to `max_bytes` from the master and decode them
    ///
    /// Blocks if nothing is available, so callers check [`Self::is_readable`]
    /// first. End of file is reported as [`PtyError::Closed`].
    pub async fn read(&self, max_bytes: usize) -> PtyResult<String> {
        let mut io = self.io.lock().await;
        let io = io.as_mut().ok_or(PtyError::Closed)?;

        let mut buf = vec![0u8; max_bytes.max(1)];
        match io.reader.read(&mut buf) {
            Ok(0) => Err(PtyError::Closed),
            Ok(n) => Ok(io.decoder.decode(&buf[..n])),
            Err(e) => Err(PtyError::ReadFailed(e.to_string())),
        }
    }

    /// Write raw bytes to the child's terminal input
    pub async fn write(&self, data: &[u8]) -> PtyResult<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(PtyError::Closed)?;

        writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;

        Ok(())
    }

    /// Send SIGTERM to the child and close the master
    ///
    /// Never fails: an already exited child or an already closed descriptor
    /// is ignored, so calling this twice is harmless.
    pub async fn terminate(&self) {
        let io = self.io.lock().await.take();
        let writer = self.writer.lock().await.take();

        if let Some(pid) = self.child_pid {
            signal_child(self.id, pid);
        }

        match io {
            Some(mut io) => {
                let tail = io.decoder.finish();
                if !tail.is_empty() {
                    debug!(session = %self.id, bytes = tail.len(), "Discarding undelivered PTY output");
                }
                drop(io);
                drop(writer);
                debug!(session = %self.id, "Closed PTY master");
            }
            None => debug!(session = %self.id, "PTY master already closed"),
        }

        if let Some(child) = self.child.lock().await.take() {
            reap_child(self.id, child);
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if self.io.get_mut().is_some() {
            if let Some(pid) = self.child_pid {
                signal_child(self.id, pid);
            }
        }
        if let Some(child) = self.child.get_mut().take() {
            reap_child(self.id, child);
        }
    }
}

/// Wait for the child off the async threads so it does not linger as a zombie
fn reap_child(session: Uuid, mut child: Box<dyn Child + Send + Sync>) {
    let wait = move || match child.wait() {
        Ok(status) => debug!(session = %session, ?status, "Reaped PTY child"),
        Err(e) => debug!(session = %session, "Failed to reap PTY child: {}", e),
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(wait);
        }
        Err(_) => {
            std::thread::spawn(wait);
        }
    }
}

fn signal_child(session: Uuid, pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        warn!(session = %session, pid, "Child pid out of range, not signalling");
        return;
    };

    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => debug!(session = %session, pid, "Sent SIGTERM to PTY child"),
        Err(Errno::ESRCH) => debug!(session = %session, pid, "PTY child already exited"),
        Err(e) => warn!(session = %session, pid, "Failed to signal PTY child: {}", e),
    }
}
