//! Local socket channel to the monitor.
//!
//! The monitor listens on a unix socket in the cache directory. We poll until
//! it accepts, then read newline-framed messages and write JSON commands.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::unix::OwnedWriteHalf;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::protocol::Command;

/// Errors that can occur while opening the channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Monitor exited before opening its socket")]
    MonitorExited,
}

/// How long and how often to poll for the monitor's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    /// Fixed wait before the first attempt.
    pub initial_delay: Duration,

    /// First retry delay, doubled after every failed attempt.
    pub backoff: Duration,

    /// Retry delay cap.
    pub max_backoff: Duration,

    /// Give up after this long.
    pub timeout: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(25),
            backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Callbacks for inbound traffic.
#[derive(Clone)]
pub struct ChannelHandlers {
    /// Called once the socket is connected, before any line is read.
    pub on_connected: Arc<dyn Fn() + Send + Sync>,

    /// Called with every non-empty inbound line, verbatim.
    pub on_line: Arc<dyn Fn(String) + Send + Sync>,

    /// Called with the text of a socket error.
    pub on_error: Arc<dyn Fn(String) + Send + Sync>,

    /// Called when the monitor closes the socket or the socket fails.
    pub on_closed: Arc<dyn Fn() + Send + Sync>,
}

/// An open channel to the monitor.
pub struct Channel {
    writer: Option<OwnedWriteHalf>,
    reader: JoinHandle<()>,
    handlers: ChannelHandlers,
}

impl Channel {
    /// Connect to the monitor's socket.
    ///
    /// Refused or missing sockets are retried with backoff until the policy's
    /// timeout. Gives up early if `abandon` fires (the process exited).
    /// `on_connected` returns before the reader starts, so it precedes every
    /// `on_line`.
    pub async fn connect(
        path: &Path,
        policy: &ConnectPolicy,
        abandon: &CancellationToken,
        handlers: ChannelHandlers,
    ) -> Result<Self, ChannelError> {
        let stream = wait_for_socket(path, policy, abandon).await?;
        info!("Connected to monitor socket {}", path.display());
        (handlers.on_connected)();

        let (read_half, write_half) = stream.into_split();
        let reader = tokio::spawn(read_loop(read_half, handlers.clone(), abandon.clone()));

        Ok(Self {
            writer: Some(write_half),
            reader,
            handlers,
        })
    }

    /// Whether commands can still be written.
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Write a command. Dropped silently when the channel is closed.
    pub async fn send(&mut self, command: &Command) {
        let Some(writer) = self.writer.as_mut() else {
            debug!("Channel closed, dropping {}", command.name());
            return;
        };

        trace!("Sending {}", command.name());
        if let Err(e) = writer.write_all(command.to_line().as_bytes()).await {
            warn!("Failed to send {}: {}", command.name(), e);
            self.writer = None;
            (self.handlers.on_error)(e.to_string());
            (self.handlers.on_closed)();
        }
    }

    /// Close both directions.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take()
            && let Err(e) = writer.shutdown().await
        {
            debug!("Socket shutdown failed: {}", e);
        }
        self.reader.abort();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn wait_for_socket(
    path: &Path,
    policy: &ConnectPolicy,
    abandon: &CancellationToken,
) -> Result<UnixStream, ChannelError> {
    tokio::select! {
        () = tokio::time::sleep(policy.initial_delay) => {}
        () = abandon.cancelled() => return Err(ChannelError::MonitorExited),
    }

    let deadline = Instant::now() + policy.timeout;
    let mut backoff = policy.backoff;

    loop {
        if abandon.is_cancelled() {
            return Err(ChannelError::MonitorExited);
        }

        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() + backoff < deadline => {
                trace!("Monitor socket not ready ({}), retrying in {:?}", e, backoff);
            }
            Err(source) => {
                return Err(ChannelError::Connect {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            () = abandon.cancelled() => return Err(ChannelError::MonitorExited),
        }
        backoff = std::cmp::min(backoff * 2, policy.max_backoff);
    }
}

async fn read_loop(reader: OwnedReadHalf, handlers: ChannelHandlers, stop: CancellationToken) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        let next = tokio::select! {
            next = lines.next_line() => next,
            () = stop.cancelled() => {
                trace!("Monitor gone, closing channel reader");
                return;
            }
        };

        match next {
            Ok(Some(line)) => {
                let line = line.trim();
                if !line.is_empty() {
                    (handlers.on_line)(line.to_string());
                }
            }
            Ok(None) => {
                info!("Monitor closed the channel");
                (handlers.on_closed)();
                return;
            }
            Err(e) => {
                warn!("Channel read error: {}", e);
                (handlers.on_error)(e.to_string());
                (handlers.on_closed)();
                return;
            }
        }
    }
}
