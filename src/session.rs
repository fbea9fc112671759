//! Protocol/session engine.
//!
//! One [`Session`] bridges one [`Slave`] (normally a PTY backend) and one
//! socket. Two pumps run concurrently while the session is active:
//!
//! - outbound: slave output and controller events → socket frames
//! - inbound: socket frames → slave input, resize, and multiplexer requests
//!
//! Either pump ending, or the session's cancellation token firing, moves the
//! session to `Closing`; it reaches `Closed` once the slave's bounded close
//! has returned.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::mux::{Event, MuxController, MuxError, MuxReply};
use crate::protocol::{ClientMessage, ClipboardInterceptor, Encoding, Frame, ProtocolError};
use crate::pty::PtyError;

/// The process end of a session.
#[async_trait]
pub trait Slave: Send + Sync + 'static {
    /// Next chunk of output, or `None` once the process side has closed.
    async fn read(&self) -> Result<Option<Bytes>, PtyError>;
    async fn write(&self, data: Bytes) -> Result<(), PtyError>;
    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;
    /// Terminate and wait (bounded). Safe to call more than once.
    async fn close(&self);
    fn window_title(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Forward `Input` messages to the slave.
    pub permit_write: bool,
    pub buffer_size: usize,
    pub preferences: Option<serde_json::Value>,
    /// Reconnect hint in seconds.
    pub reconnect: Option<u64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            permit_write: false,
            buffer_size: crate::pty::DEFAULT_BUFFER_SIZE,
            preferences: None,
            reconnect: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("socket error: {0}")]
    Socket(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SessionError {
    /// Whether this error ends the session. Everything else fails only the
    /// message that caused it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Pty(_) | Self::Socket(_))
    }

    fn socket<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        Self::Socket(Box::new(e))
    }
}

/// Observes and closes a running [`Session`] from elsewhere.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Request shutdown. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub async fn wait_closed(&mut self) {
        let _ = self
            .state
            .wait_for(|state| *state == SessionState::Closed)
            .await;
    }
}

pub struct Session {
    slave: Arc<dyn Slave>,
    controller: Option<MuxController>,
    clipboard: Option<mpsc::Sender<Bytes>>,
    options: SessionOptions,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl Session {
    pub fn new(slave: Arc<dyn Slave>, options: SessionOptions) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            slave,
            controller: None,
            clipboard: None,
            options,
            cancel: CancellationToken::new(),
            state,
        }
    }

    /// Attach a multiplexer controller; it is stopped when the session ends.
    pub fn with_controller(mut self, controller: MuxController) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Strip clipboard sequences from output and send their payloads here.
    pub fn with_clipboard(mut self, tx: mpsc::Sender<Bytes>) -> Self {
        self.clipboard = Some(tx);
        self
    }

    /// Close the session when `parent` is cancelled.
    pub fn with_shutdown(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            cancel: self.cancel.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Drive the session until either side closes.
    ///
    /// Returns `Ok(())` on an orderly close and the fatal error otherwise.
    /// The slave is closed and any controller stopped before this returns.
    pub async fn run<Tx, Rx, E>(self, tx: Tx, mut rx: Rx) -> Result<(), SessionError>
    where
        Tx: Sink<Frame> + Unpin + Send,
        Tx::Error: std::error::Error + Send + Sync + 'static,
        Rx: Stream<Item = Result<Bytes, E>> + Unpin + Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        let writer = Mutex::new(tx);

        let result = match self.send_initial(&writer).await {
            Ok(()) => {
                self.state.send_replace(SessionState::Active);
                tracing::debug!("session active");
                let events = self.controller.as_ref().and_then(MuxController::events);
                tokio::select! {
                    r = self.outbound(&writer, events) => r,
                    r = self.inbound(&writer, &mut rx) => r,
                    _ = self.cancel.cancelled() => {
                        tracing::debug!("session cancelled");
                        Ok(())
                    }
                }
            }
            Err(e) => Err(e),
        };

        self.state.send_replace(SessionState::Closing);
        if let Some(controller) = &self.controller {
            controller.stop();
        }
        self.slave.close().await;
        let _ = writer.lock().await.close().await;
        self.state.send_replace(SessionState::Closed);

        match &result {
            Ok(()) => tracing::debug!("session closed"),
            Err(e) => tracing::warn!(error = %e, "session closed with error"),
        }
        result
    }

    async fn send<Tx>(writer: &Mutex<Tx>, frame: Frame) -> Result<(), SessionError>
    where
        Tx: Sink<Frame> + Unpin + Send,
        Tx::Error: std::error::Error + Send + Sync + 'static,
    {
        writer
            .lock()
            .await
            .send(frame)
            .await
            .map_err(SessionError::socket)
    }

    async fn send_initial<Tx>(&self, writer: &Mutex<Tx>) -> Result<(), SessionError>
    where
        Tx: Sink<Frame> + Unpin + Send,
        Tx::Error: std::error::Error + Send + Sync + 'static,
    {
        Self::send(writer, Frame::window_title(&self.slave.window_title())).await?;
        Self::send(writer, Frame::buffer_size(self.options.buffer_size)).await?;
        if let Some(prefs) = &self.options.preferences {
            Self::send(writer, Frame::preferences(prefs)?).await?;
        }
        if let Some(seconds) = self.options.reconnect {
            Self::send(writer, Frame::reconnect(seconds)).await?;
        }
        if let Some(layout) = self.controller.as_ref().and_then(MuxController::layout) {
            Self::send(writer, Frame::layout(&layout)?).await?;
        }
        Ok(())
    }

    async fn outbound<Tx>(
        &self,
        writer: &Mutex<Tx>,
        mut events: Option<mpsc::Receiver<Event>>,
    ) -> Result<(), SessionError>
    where
        Tx: Sink<Frame> + Unpin + Send,
        Tx::Error: std::error::Error + Send + Sync + 'static,
    {
        let mut interceptor = self.clipboard.as_ref().map(|_| ClipboardInterceptor::new());

        loop {
            tokio::select! {
                read = self.slave.read() => {
                    let Some(data) = read? else {
                        if let Some(rest) = interceptor.as_mut().map(ClipboardInterceptor::flush) {
                            if !rest.is_empty() {
                                Self::send(writer, Frame::output(&rest)).await?;
                            }
                        }
                        tracing::debug!("slave closed");
                        return Ok(());
                    };
                    let data = match interceptor.as_mut() {
                        Some(icp) => {
                            let out = icp.feed(&data);
                            self.forward_clipboard(out.clipboard);
                            out.output
                        }
                        None => data,
                    };
                    if !data.is_empty() {
                        Self::send(writer, Frame::output(&data)).await?;
                    }
                }

                event = async {
                    match &mut events {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match event {
                        Some(Event::LayoutChanged(layout)) => match Frame::layout(&layout) {
                            Ok(frame) => Self::send(writer, frame).await?,
                            Err(e) => tracing::warn!(error = %e, "failed to encode layout"),
                        },
                        Some(Event::SessionSwitched(name)) => {
                            tracing::debug!(session = %name, "multiplexer session switched");
                        }
                        None => events = None,
                    }
                }
            }
        }
    }

    fn forward_clipboard(&self, payloads: Vec<Bytes>) {
        let Some(tx) = &self.clipboard else {
            return;
        };
        for payload in payloads {
            if tx.try_send(payload).is_err() {
                tracing::warn!("clipboard channel unavailable, dropping payload");
            }
        }
    }

    async fn inbound<Tx, Rx, E>(&self, writer: &Mutex<Tx>, rx: &mut Rx) -> Result<(), SessionError>
    where
        Tx: Sink<Frame> + Unpin + Send,
        Tx::Error: std::error::Error + Send + Sync + 'static,
        Rx: Stream<Item = Result<Bytes, E>> + Unpin + Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut encoding = Encoding::default();
        while let Some(msg) = rx.next().await {
            let data = msg.map_err(SessionError::socket)?;
            match self.dispatch(writer, &data, &mut encoding).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!(error = %e, "failed to handle message"),
            }
        }
        tracing::debug!("socket closed");
        Ok(())
    }

    async fn dispatch<Tx>(
        &self,
        writer: &Mutex<Tx>,
        data: &[u8],
        encoding: &mut Encoding,
    ) -> Result<(), SessionError>
    where
        Tx: Sink<Frame> + Unpin + Send,
        Tx::Error: std::error::Error + Send + Sync + 'static,
    {
        match ClientMessage::decode(data)? {
            ClientMessage::Input(payload) => {
                if !self.options.permit_write {
                    return Ok(());
                }
                let input = encoding.decode(&payload)?;
                if !input.is_empty() {
                    self.slave.write(input).await?;
                }
            }
            ClientMessage::Ping => Self::send(writer, Frame::pong()).await?,
            ClientMessage::Resize(size) => {
                if size.columns > 0 && size.rows > 0 {
                    self.slave.resize(size.columns, size.rows)?;
                }
            }
            ClientMessage::SetEncoding(next) => *encoding = next,
            ClientMessage::Mux(request) => {
                let Some(controller) = &self.controller else {
                    return Ok(());
                };
                match controller.handle(request).await? {
                    MuxReply::Layout(layout) => Self::send(writer, Frame::layout(&layout)?).await?,
                    MuxReply::Mode(mode) => Self::send(writer, Frame::mode(&mode)?).await?,
                    MuxReply::Nothing => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{ControllerOptions, MuxKind, MuxRunner};
    use crate::protocol::ServerTag;
    use futures::channel::mpsc as fmpsc;
    use std::convert::Infallible;
    use std::time::Duration;

    /// Slave fed by a channel; records writes and resizes.
    struct FakeSlave {
        output: Mutex<mpsc::Receiver<Bytes>>,
        written: parking_lot::Mutex<Vec<Bytes>>,
        resized: parking_lot::Mutex<Vec<(u16, u16)>>,
        closes: std::sync::atomic::AtomicUsize,
    }

    impl FakeSlave {
        fn new() -> (Arc<Self>, mpsc::Sender<Bytes>) {
            let (tx, rx) = mpsc::channel(16);
            let slave = Arc::new(Self {
                output: Mutex::new(rx),
                written: Default::default(),
                resized: Default::default(),
                closes: Default::default(),
            });
            (slave, tx)
        }

        fn closes(&self) -> usize {
            self.closes.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Slave for FakeSlave {
        async fn read(&self) -> Result<Option<Bytes>, PtyError> {
            Ok(self.output.lock().await.recv().await)
        }

        async fn write(&self, data: Bytes) -> Result<(), PtyError> {
            self.written.lock().push(data);
            Ok(())
        }

        fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
            self.resized.lock().push((cols, rows));
            Ok(())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        fn window_title(&self) -> String {
            "sh (test)".to_string()
        }
    }

    /// Socket halves for driving a session from a test.
    struct Client {
        to_server: fmpsc::UnboundedSender<Result<Bytes, Infallible>>,
        from_server: fmpsc::UnboundedReceiver<Frame>,
    }

    impl Client {
        fn send(&self, data: &'static [u8]) {
            self.to_server
                .unbounded_send(Ok(Bytes::from_static(data)))
                .unwrap();
        }

        async fn recv(&mut self) -> Frame {
            tokio::time::timeout(Duration::from_secs(5), self.from_server.next())
                .await
                .expect("timed out waiting for frame")
                .expect("server hung up")
        }

        /// Skip the greeting frames up to and including `SetBufferSize`.
        async fn skip_greeting(&mut self) {
            while self.recv().await.tag != ServerTag::SetBufferSize {}
        }
    }

    fn spawn_session(
        session: Session,
    ) -> (Client, tokio::task::JoinHandle<Result<(), SessionError>>) {
        let (to_server, server_rx) = fmpsc::unbounded();
        let (server_tx, from_server) = fmpsc::unbounded();
        let task = tokio::spawn(session.run(server_tx, server_rx));
        (
            Client {
                to_server,
                from_server,
            },
            task,
        )
    }

    #[tokio::test]
    async fn greeting_is_sent_in_order() {
        let (slave, _out) = FakeSlave::new();
        let options = SessionOptions {
            buffer_size: 4096,
            preferences: Some(serde_json::json!({ "fontSize": 14 })),
            reconnect: Some(10),
            ..SessionOptions::default()
        };
        let (mut client, _task) = spawn_session(Session::new(slave, options));

        assert_eq!(client.recv().await.to_text(), "3sh (test)");
        assert_eq!(client.recv().await.to_text(), "64096");
        assert_eq!(client.recv().await.to_text(), r#"4{"fontSize":14}"#);
        assert_eq!(client.recv().await.to_text(), "510");
    }

    #[tokio::test]
    async fn output_is_base64_and_ping_is_answered() {
        let (slave, out) = FakeSlave::new();
        let (mut client, _task) = spawn_session(Session::new(slave, SessionOptions::default()));
        client.skip_greeting().await;

        out.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(client.recv().await.to_text(), "1aGVsbG8=");

        client.send(b"2");
        assert_eq!(client.recv().await.tag, ServerTag::Pong);
    }

    #[tokio::test]
    async fn input_respects_permit_write_and_encoding() {
        let (slave, _out) = FakeSlave::new();
        let options = SessionOptions {
            permit_write: true,
            ..SessionOptions::default()
        };
        let (mut client, _task) = spawn_session(Session::new(slave.clone(), options));
        client.skip_greeting().await;

        client.send(b"1ls\r");
        client.send(b"4base64");
        client.send(b"1ZWNobw0=");
        client.send(b"1***");
        client.send(br#"3{"columns":100,"rows":30}"#);
        client.send(br#"3{"columns":0,"rows":30}"#);
        client.send(b"2");
        assert_eq!(client.recv().await.tag, ServerTag::Pong);

        assert_eq!(
            *slave.written.lock(),
            vec![Bytes::from_static(b"ls\r"), Bytes::from_static(b"echo\r")]
        );
        assert_eq!(*slave.resized.lock(), vec![(100, 30)]);
    }

    #[tokio::test]
    async fn input_is_dropped_without_permit_write() {
        let (slave, _out) = FakeSlave::new();
        let (mut client, _task) =
            spawn_session(Session::new(slave.clone(), SessionOptions::default()));
        client.skip_greeting().await;

        client.send(b"1rm -rf /\r");
        client.send(b"2");
        assert_eq!(client.recv().await.tag, ServerTag::Pong);
        assert!(slave.written.lock().is_empty());
    }

    #[tokio::test]
    async fn bad_messages_do_not_end_the_session() {
        let (slave, _out) = FakeSlave::new();
        let (mut client, task) = spawn_session(Session::new(slave, SessionOptions::default()));
        client.skip_greeting().await;

        client.send(b"Zbogus");
        client.send(b"3not json");
        client.send(b"");
        // No controller attached: silently ignored.
        client.send(b"5%1");
        client.send(b"2");
        assert_eq!(client.recv().await.tag, ServerTag::Pong);
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn slave_eof_closes_session() {
        let (slave, out) = FakeSlave::new();
        let session = Session::new(slave.clone(), SessionOptions::default());
        let mut handle = session.handle();
        assert_eq!(handle.state(), SessionState::Connecting);
        let (mut client, task) = spawn_session(session);
        client.skip_greeting().await;
        client.send(b"2");
        assert_eq!(client.recv().await.tag, ServerTag::Pong);
        assert_eq!(handle.state(), SessionState::Active);

        drop(out);
        task.await.unwrap().unwrap();
        handle.wait_closed().await;
        assert_eq!(handle.state(), SessionState::Closed);
        assert_eq!(slave.closes(), 1);
    }

    #[tokio::test]
    async fn socket_close_closes_slave() {
        let (slave, _out) = FakeSlave::new();
        let (mut client, task) =
            spawn_session(Session::new(slave.clone(), SessionOptions::default()));
        client.skip_greeting().await;

        drop(client.to_server);
        task.await.unwrap().unwrap();
        assert_eq!(slave.closes(), 1);
    }

    #[tokio::test]
    async fn closing_twice_is_harmless() {
        let (slave, _out) = FakeSlave::new();
        let session = Session::new(slave.clone(), SessionOptions::default());
        let mut handle = session.handle();
        let (mut client, task) = spawn_session(session);
        client.skip_greeting().await;

        handle.close();
        handle.close();
        task.await.unwrap().unwrap();
        handle.wait_closed().await;
        handle.close();
        assert_eq!(handle.state(), SessionState::Closed);
        assert_eq!(slave.closes(), 1);
    }

    #[tokio::test]
    async fn parent_shutdown_cancels_session() {
        let root = CancellationToken::new();
        let (slave, _out) = FakeSlave::new();
        let session = Session::new(slave.clone(), SessionOptions::default()).with_shutdown(&root);
        let (mut client, task) = spawn_session(session);
        client.skip_greeting().await;

        root.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(slave.closes(), 1);
    }

    #[tokio::test]
    async fn clipboard_payloads_are_diverted() {
        let (slave, out) = FakeSlave::new();
        let (clip_tx, mut clip_rx) = mpsc::channel(4);
        let session = Session::new(slave, SessionOptions::default()).with_clipboard(clip_tx);
        let (mut client, _task) = spawn_session(session);
        client.skip_greeting().await;

        out.send(Bytes::from_static(b"a\x1b]52;c;aGk=\x07b"))
            .await
            .unwrap();
        assert_eq!(client.recv().await.to_text(), "1YWI=");
        assert_eq!(clip_rx.recv().await.unwrap(), Bytes::from_static(b"hi"));
    }

    /// Answers listings for one session `main` with panes `%1` and `%2`.
    struct TwoPanes {
        active: parking_lot::Mutex<&'static str>,
    }

    #[async_trait]
    impl MuxRunner for TwoPanes {
        async fn run(&self, args: &[&str]) -> Result<String, MuxError> {
            let fail = || MuxError::CommandFailed {
                command: args.join(" "),
                status: Some(1),
                stderr: "can't find pane".into(),
            };
            match args {
                ["has-session", ..] => Ok(String::new()),
                ["ls"] => Ok("main: 1 windows (created today) [80x24]\n".into()),
                ["list-windows", ..] => Ok("0: sh* (2 panes) [80x24]\n".into()),
                ["list-panes", ..] => {
                    let active = *self.active.lock();
                    let (first, second) = if active == "%1" { ("%1", "%2") } else { ("%2", "%1") };
                    Ok(format!("{first}: [40x24]\n{second}: [39x24]\n"))
                }
                ["select-pane", "-t", "%1"] => {
                    *self.active.lock() = "%1";
                    Ok(String::new())
                }
                ["select-pane", "-t", "%2"] => {
                    *self.active.lock() = "%2";
                    Ok(String::new())
                }
                ["copy-mode", ..] | ["send-keys", ..] => Ok(String::new()),
                _ => Err(fail()),
            }
        }
    }

    async fn controller(kind: MuxKind) -> MuxController {
        let runner = Arc::new(TwoPanes {
            active: parking_lot::Mutex::new("%1"),
        });
        let ctrl = MuxController::with_runner(kind, "main", runner, ControllerOptions::default());
        ctrl.start().await.unwrap();
        ctrl
    }

    #[tokio::test]
    async fn mux_requests_push_layout_updates() {
        let (slave, _out) = FakeSlave::new();
        let session =
            Session::new(slave, SessionOptions::default()).with_controller(controller(MuxKind::Psmux).await);
        let (mut client, task) = spawn_session(session);
        client.skip_greeting().await;

        let initial = client.recv().await;
        assert_eq!(initial.tag, ServerTag::LayoutUpdate);
        assert_eq!(initial.parse_json::<crate::mux::Layout>().unwrap().active_pane_id, "%1");

        client.send(b"5%2");
        let update = client.recv().await;
        assert_eq!(update.tag, ServerTag::LayoutUpdate);
        assert_eq!(update.parse_json::<crate::mux::Layout>().unwrap().active_pane_id, "%2");

        // Operation failure and unsupported copy mode are reported, not fatal.
        client.send(b"5%9");
        client.send(b"91");
        client.send(b"2");
        assert_eq!(client.recv().await.tag, ServerTag::Pong);
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn tmux_copy_mode_answers_with_mode_update() {
        let (slave, _out) = FakeSlave::new();
        let session =
            Session::new(slave, SessionOptions::default()).with_controller(controller(MuxKind::Tmux).await);
        let (mut client, _task) = spawn_session(session);
        client.skip_greeting().await;
        assert_eq!(client.recv().await.tag, ServerTag::LayoutUpdate);

        client.send(b"91");
        let mode = client.recv().await;
        assert_eq!(mode.to_text(), r#"9{"inCopyMode":true,"paneId":"%1"}"#);

        client.send(b"B3");
        client.send(b"2");
        assert_eq!(client.recv().await.tag, ServerTag::Pong);
    }

    #[tokio::test]
    async fn session_end_stops_controller() {
        let ctrl = controller(MuxKind::Psmux).await;
        let (slave, out) = FakeSlave::new();
        let session = Session::new(slave, SessionOptions::default()).with_controller(ctrl.clone());
        let (mut client, task) = spawn_session(session);
        client.skip_greeting().await;

        drop(out);
        task.await.unwrap().unwrap();
        assert!(ctrl.multiplexer().controller().is_stopped());
    }
}
