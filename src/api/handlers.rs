use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
    Json,
};
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::auth::credential_matches;
use super::error::ApiError;
use super::AppState;
use crate::mux::{ControllerOptions, MuxController};
use crate::protocol::{Frame, InitMessage, ProtocolError, SUBPROTOCOL};
use crate::pty::{PtyBackend, PtyOptions};
use crate::session::{Session, SessionOptions};

/// How long a new socket has to send its handshake document.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Clipboard payloads queued for the clipboard command.
const CLIPBOARD_QUEUE: usize = 16;

/// Headers never exported to the child.
const PRIVATE_HEADERS: &[&str] = &["authorization", "cookie"];

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.connections.load(Ordering::Acquire),
    })
}

/// One slot of the `max_connections` budget, released on drop.
#[derive(Debug)]
pub(crate) struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    /// `max == 0` means unlimited.
    pub(crate) fn acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let previous = counter.fetch_add(1, Ordering::AcqRel);
        if max > 0 && previous >= max {
            counter.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self(counter.clone()))
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Request headers exported to the child, grouped by lowercase name.
fn exported_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        if PRIVATE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    out
}

pub(super) async fn ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let guard = ConnectionGuard::acquire(&state.connections, state.config.max_connections)
        .ok_or_else(|| {
            tracing::warn!(
                max = state.config.max_connections,
                "connection limit reached, rejecting websocket"
            );
            ApiError::TooManyConnections
        })?;

    let headers = if state.config.pass_headers {
        exported_headers(&headers)
    } else {
        BTreeMap::new()
    };

    Ok(ws.protocols([SUBPROTOCOL]).on_upgrade(move |socket| async move {
        let _guard = guard;
        handle_socket(socket, state, headers).await;
    }))
}

#[derive(Debug, Error)]
enum HandshakeError {
    #[error("timed out waiting for handshake")]
    Timeout,

    #[error("socket closed before handshake")]
    Closed,

    #[error("socket error: {0}")]
    Socket(#[from] axum::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

async fn read_handshake(socket: &mut WebSocket) -> Result<InitMessage, HandshakeError> {
    let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        let msg = tokio::time::timeout_at(deadline, socket.recv())
            .await
            .map_err(|_| HandshakeError::Timeout)?;
        match msg {
            Some(Ok(Message::Text(text))) => return Ok(InitMessage::parse(text.as_str().as_bytes())?),
            Some(Ok(Message::Binary(data))) => return Ok(InitMessage::parse(&data)?),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Err(HandshakeError::Closed),
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn start_controller(state: &AppState) -> Option<MuxController> {
    let mux = state.config.mux.as_ref()?;
    let controller = MuxController::new(
        mux.kind,
        mux.session.clone(),
        ControllerOptions {
            poll_interval: mux.poll_interval(),
        },
    );
    match controller.start().await {
        Ok(()) => Some(controller),
        Err(e) => {
            tracing::warn!(error = %e, kind = %mux.kind, "multiplexer controller unavailable, continuing without it");
            None
        }
    }
}

/// Pipe one clipboard payload to the configured command's stdin.
async fn pipe_to_command(argv: &[String], payload: &[u8]) -> std::io::Result<()> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(payload).await?;
    }
    let status = child.wait().await?;
    if !status.success() {
        tracing::debug!(?status, %program, "clipboard command exited unsuccessfully");
    }
    Ok(())
}

/// Clipboard sink for one session; the task ends when the sender is dropped.
fn spawn_clipboard(argv: Vec<String>) -> mpsc::Sender<Bytes> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(CLIPBOARD_QUEUE);
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if let Err(e) = pipe_to_command(&argv, &payload).await {
                tracing::warn!(error = %e, "failed to run clipboard command");
            }
        }
    });
    tx
}

async fn handle_socket(mut socket: WebSocket, state: AppState, headers: BTreeMap<String, Vec<String>>) {
    let config = state.config.clone();

    let init = match read_handshake(&mut socket).await {
        Ok(init) => init,
        Err(e) => {
            tracing::warn!(error = %e, "websocket handshake failed");
            close_with(socket, close_code::PROTOCOL, "invalid handshake").await;
            return;
        }
    };

    if let Some(credential) = &config.credential {
        if !credential_matches(credential, &init.auth_token) {
            tracing::warn!("handshake token rejected, closing websocket");
            close_with(socket, close_code::POLICY, "authentication failed").await;
            return;
        }
    }

    let mut argv = config.args.clone();
    if config.permit_arguments {
        argv.extend(init.args());
    }

    let controller = start_controller(&state).await;

    let pty = match PtyBackend::start(
        &config.command,
        &argv,
        &headers,
        PtyOptions {
            close_timeout: config.close_timeout(),
            buffer_size: config.buffer_size,
        },
    ) {
        Ok(pty) => pty,
        Err(e) => {
            tracing::error!(error = %e, command = %config.command, "failed to start session");
            if let Some(controller) = &controller {
                controller.stop();
            }
            close_with(socket, close_code::ERROR, "failed to start command").await;
            return;
        }
    };
    tracing::info!(command = %config.command, pid = ?pty.pid(), "session started");

    let mut session = Session::new(
        Arc::new(pty),
        SessionOptions {
            permit_write: config.permit_write,
            buffer_size: config.buffer_size,
            preferences: config.preferences.clone(),
            reconnect: config.reconnect,
        },
    )
    .with_shutdown(&state.shutdown);
    if let Some(controller) = controller {
        session = session.with_controller(controller);
    }
    if let Some(argv) = config.clipboard_command.clone() {
        session = session.with_clipboard(spawn_clipboard(argv));
    }

    let (ws_tx, ws_rx) = socket.split();
    let tx = ws_tx.with(|frame: Frame| {
        future::ready(Ok::<_, axum::Error>(Message::Text(frame.to_text().into())))
    });
    let rx = ws_rx
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes()))),
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });

    match session.run(tx, rx).await {
        Ok(()) => tracing::info!("session closed"),
        Err(e) => tracing::warn!(error = %e, "session ended with error"),
    }
}
