//! PTY process backend.
//!
//! Owns one child process attached to a pseudo-terminal. Output is pumped by
//! a blocking reader thread into a bounded channel, input is drained by a
//! blocking writer thread, and a third blocking task waits for the child to
//! exit, closes the master handle, and fires the `exited` token exactly once.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::Slave;

/// Default bound on how long [`PtyBackend::close`] waits for the child.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default read chunk size for the output pump.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

const INITIAL_COLS: u16 = 80;
const INITIAL_ROWS: u16 = 24;

/// Chunks buffered between the reader thread and the outbound pump.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;
const INPUT_CHANNEL_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to start command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("pty read failed: {0}")]
    Read(#[from] io::Error),

    #[error("pty is closed")]
    Closed,
}

/// Options applied when a backend is started.
#[derive(Debug, Clone)]
pub struct PtyOptions {
    /// `None` waits for the child forever.
    pub close_timeout: Option<Duration>,
    pub buffer_size: usize,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            close_timeout: Some(DEFAULT_CLOSE_TIMEOUT),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Environment variable name synthesized for a forwarded request header.
///
/// `X-Forwarded-User` becomes `HTTP_X_FORWARDED_USER`.
pub fn header_env_name(header: &str) -> String {
    let mut name = String::with_capacity(header.len() + 5);
    name.push_str("HTTP_");
    for c in header.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_uppercase());
        } else {
            name.push('_');
        }
    }
    name
}

pub struct PtyBackend {
    command: String,
    pid: Option<u32>,
    master: Arc<Mutex<Option<Box<dyn MasterPty + Send>>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    input_tx: mpsc::Sender<Bytes>,
    output_rx: tokio::sync::Mutex<mpsc::Receiver<io::Result<Bytes>>>,
    exited: CancellationToken,
    close_timeout: Option<Duration>,
}

impl std::fmt::Debug for PtyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyBackend")
            .field("command", &self.command)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl PtyBackend {
    /// Start `command` with `argv` inside a new pseudo-terminal.
    ///
    /// The child inherits this process's environment plus
    /// `TERM=xterm-256color` and one `HTTP_*` variable per entry in
    /// `headers`, with multiple values joined by `,`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        command: &str,
        argv: &[String],
        headers: &BTreeMap<String, Vec<String>>,
        options: PtyOptions,
    ) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: INITIAL_ROWS,
                cols: INITIAL_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::OpenPty)?;

        let mut cmd = CommandBuilder::new(command);
        cmd.args(argv);
        cmd.env("TERM", "xterm-256color");
        for (key, values) in headers {
            cmd.env(header_env_name(key), values.join(","));
        }

        let mut child = pair.slave.spawn_command(cmd).map_err(|source| PtyError::Spawn {
            command: command.to_string(),
            source,
        })?;
        // Only the child may hold the slave side, otherwise reads never see EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair.master.try_clone_reader().map_err(PtyError::CloneReader)?;
        let writer = pair.master.take_writer().map_err(PtyError::TakeWriter)?;
        let master = Arc::new(Mutex::new(Some(pair.master)));
        let exited = CancellationToken::new();

        tracing::debug!(command, ?pid, "pty child started");

        {
            let master = master.clone();
            let exited = exited.clone();
            tokio::task::spawn_blocking(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    match child.wait() {
                        Ok(status) => tracing::debug!(?status, "pty child exited"),
                        Err(e) => tracing::error!(?e, "error waiting for pty child"),
                    }
                }));
                if let Err(e) = result {
                    tracing::error!("pty wait task panicked: {:?}", e);
                }
                master.lock().take();
                exited.cancel();
            });
        }

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let buffer_size = options.buffer_size.max(1);
        tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut reader = reader;
            let mut buf = vec![0u8; buffer_size];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        if output_tx.blocking_send(Ok(data)).is_err() {
                            break;
                        }
                    }
                    // EIO is what Linux reports once the slave side is gone.
                    Err(e) if e.raw_os_error() == Some(5) => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = output_tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        });

        let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut writer = writer;
            let mut rx = input_rx;
            while let Some(data) = rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        Ok(Self {
            command: command.to_string(),
            pid,
            master,
            killer: Mutex::new(killer),
            input_tx,
            output_rx: tokio::sync::Mutex::new(output_rx),
            exited,
            close_timeout: options.close_timeout,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Token that fires once the child has exited and the master is closed.
    pub fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    /// Next chunk of terminal output, or `None` once the terminal is closed.
    pub async fn read(&self) -> Result<Option<Bytes>, PtyError> {
        let mut rx = self.output_rx.lock().await;
        match rx.recv().await {
            Some(Ok(data)) => Ok(Some(data)),
            Some(Err(e)) => Err(PtyError::Read(e)),
            None => Ok(None),
        }
    }

    pub async fn write(&self, data: Bytes) -> Result<(), PtyError> {
        self.input_tx.send(data).await.map_err(|_| PtyError::Closed)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let master = self.master.lock();
        let master = master.as_ref().ok_or(PtyError::Closed)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }

    /// Terminate the child and wait for it to exit, at most `close_timeout`.
    ///
    /// Safe to call any number of times.
    pub async fn close(&self) {
        if !self.exited.is_cancelled() {
            if let Err(e) = self.killer.lock().kill() {
                tracing::debug!(?e, "kill on pty child failed (already exiting?)");
            }
        }
        match self.close_timeout {
            Some(timeout) => {
                if tokio::time::timeout(timeout, self.exited.cancelled())
                    .await
                    .is_err()
                {
                    tracing::warn!(pid = ?self.pid, ?timeout, "pty child did not exit before close timeout");
                }
            }
            None => self.exited.cancelled().await,
        }
    }

    pub fn window_title(&self) -> String {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        format!("{} ({})", self.command, host)
    }
}

impl Drop for PtyBackend {
    fn drop(&mut self) {
        if !self.exited.is_cancelled() {
            let _ = self.killer.get_mut().kill();
        }
    }
}

#[async_trait]
impl Slave for PtyBackend {
    async fn read(&self) -> Result<Option<Bytes>, PtyError> {
        PtyBackend::read(self).await
    }

    async fn write(&self, data: Bytes) -> Result<(), PtyError> {
        PtyBackend::write(self, data).await
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        PtyBackend::resize(self, cols, rows)
    }

    async fn close(&self) {
        PtyBackend::close(self).await
    }

    fn window_title(&self) -> String {
        PtyBackend::window_title(self)
    }
}
