//! Newline-framed byte transport.
//!
//! Frames follow the MCP stdio convention:
//!
//! - Messages are UTF-8 encoded JSON-RPC
//! - Messages are delimited by newlines
//! - Messages must not contain embedded newlines
//! - stderr may be used for logging (never for frames)
//!
//! A [`Transport`] can be bound three ways:
//!
//! - [`Transport::spawn`]: a child process's stdin/stdout (client side)
//! - [`Transport::stdio`]: this process's own stdin/stdout (server side)
//! - [`Transport::from_stream`]: any async byte stream (sockets, in-memory
//!   pipes)
//!
//! # Thread Safety
//!
//! The read and write sides sit behind separate locks, so one task can be
//! parked in [`Transport::receive`] while others call [`Transport::send`].
//! Writes are serialised: a frame is always written and flushed whole.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::mcp::error::TransportError;

/// How long a child gets to exit on its own after its stdin is closed.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type FrameReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How to start a server process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Executable to run.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Environment variables set on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Start from an empty environment instead of inheriting this one.
    pub clear_env: bool,
    /// Silence the child's stderr instead of passing it through.
    pub quiet_stderr: bool,
}

impl ProcessConfig {
    /// Creates a config for `command` with no arguments.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Overrides one environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Result of a [`Transport::receive`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// One complete frame, without its line terminator.
    Frame(Vec<u8>),
    /// The peer closed the stream cleanly.
    Closed,
}

/// A bidirectional, newline-framed byte channel.
pub struct Transport {
    /// Buffered read side.
    reader: Mutex<Option<FrameReader>>,
    /// Write side; `None` once closed.
    writer: Mutex<Option<FrameWriter>>,
    /// The child process, for the spawned variant.
    child: Mutex<Option<Child>>,
    /// Exit status captured by `close`.
    exit_status: OnceLock<ExitStatus>,
    /// Set once any side has been bound.
    bound: bool,
    /// Set by `close`.
    closed: AtomicBool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("bound", &self.bound)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("exit_status", &self.exit_status.get())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Creates an unbound transport. Call [`Transport::open`] to spawn a
    /// server into it.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            child: Mutex::new(None),
            exit_status: OnceLock::new(),
            bound: false,
            closed: AtomicBool::new(false),
        }
    }

    /// Spawns a server process and binds to its stdin/stdout.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Spawn`] if the executable cannot be started.
    pub fn spawn(config: &ProcessConfig) -> Result<Self, TransportError> {
        let mut transport = Self::new();
        transport.open(config)?;
        Ok(transport)
    }

    /// Binds to this process's own stdin/stdout.
    #[must_use]
    pub fn stdio() -> Self {
        Self::from_parts(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Binds to an arbitrary async byte stream.
    #[must_use]
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::from_parts(read_half, write_half)
    }

    /// Binds to separate read and write halves.
    #[must_use]
    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut transport = Self::new();
        transport.bind(Box::new(reader), Box::new(writer));
        transport
    }

    fn bind(&mut self, reader: Box<dyn AsyncRead + Send + Unpin>, writer: FrameWriter) {
        *self.reader.get_mut() = Some(BufReader::new(reader));
        *self.writer.get_mut() = Some(writer);
        self.bound = true;
    }

    /// Spawns `config` and binds to its pipes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AlreadyOpen`] if this transport is already
    /// bound, or [`TransportError::Spawn`] if the process cannot be started.
    pub fn open(&mut self, config: &ProcessConfig) -> Result<(), TransportError> {
        if self.bound {
            return Err(TransportError::AlreadyOpen);
        }

        tracing::info!(program = %config.command, args = ?config.args, "Spawning server process");

        let mut command = Command::new(&config.command);
        command.args(&config.args);
        if config.clear_env {
            command.env_clear();
        }
        command
            .envs(config.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if config.quiet_stderr {
                Stdio::null()
            } else {
                Stdio::inherit()
            })
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            command: config.command.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("failed to capture server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("failed to capture server stdout"))?;

        tracing::debug!(pid = ?child.id(), "Server process started");

        self.bind(Box::new(stdout), Box::new(stdin));
        *self.child.get_mut() = Some(child);
        Ok(())
    }

    /// Whether [`Transport::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Writes one frame followed by a newline, then flushes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the write side is gone or the
    /// peer has hung up.
    pub async fn send(&self, frame: &str) -> Result<(), TransportError> {
        debug_assert!(
            !frame.contains('\n'),
            "frame must not contain embedded newlines"
        );

        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None if self.bound => return Err(TransportError::Closed),
            None => return Err(TransportError::NotOpen),
        };

        let result = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        result.map_err(|e| match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => TransportError::Closed,
            _ => TransportError::Io(e),
        })
    }

    /// Waits for the next complete frame.
    ///
    /// Blank lines are skipped. Bytes of a frame that arrive over several
    /// reads are accumulated until the terminator shows up.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is unbound or reading fails.
    pub async fn receive(&self) -> Result<Received, TransportError> {
        if self.is_closed() {
            return Ok(Received::Closed);
        }

        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::NotOpen)?;

        let mut frame = Vec::new();
        loop {
            frame.clear();
            let bytes_read = reader.read_until(b'\n', &mut frame).await?;
            if bytes_read == 0 {
                return Ok(Received::Closed);
            }

            if frame.ends_with(b"\n") {
                frame.pop();
                if frame.ends_with(b"\r") {
                    frame.pop();
                }
            }

            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Received::Frame(frame));
        }
    }

    /// Closes the write side and terminates the child process, if any.
    ///
    /// The child first gets a short grace period to exit on its own after
    /// its stdin closes; after that it is killed. Returns the child's exit
    /// status. Calling this more than once is harmless.
    pub async fn close(&self) -> Option<ExitStatus> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return self.exit_status.get().copied();
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "Failed to shut down write side");
            }
        }

        let mut guard = self.child.lock().await;
        let child = guard.as_mut()?;

        let status = match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to wait for server process");
                None
            }
            Err(_) => {
                tracing::debug!("Server process did not exit, killing it");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill server process");
                }
                child.wait().await.ok()
            }
        };

        if let Some(status) = status {
            tracing::info!(%status, "Server process exited");
            if self.exit_status.set(status).is_err() {
                tracing::debug!("Exit status already recorded");
            }
        }
        status
    }

    /// The child's exit status, if it has exited.
    pub async fn exit_status(&self) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status.get() {
            return Some(*status);
        }
        let mut guard = self.child.lock().await;
        let status = guard.as_mut()?.try_wait().ok().flatten()?;
        Some(*self.exit_status.get_or_init(|| status))
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}
