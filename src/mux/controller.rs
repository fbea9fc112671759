use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::parser::{parse_panes, parse_sessions, parse_windows};
use super::runner::{MuxRunner, ProcessRunner};
use super::types::{Event, Layout, ModeState};
use super::{MuxError, MuxKind};
use crate::protocol::MuxRequest;

/// Capacity of the controller event queue.
pub const EVENT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    /// Refresh the layout on this interval and publish changes as events.
    pub poll_interval: Option<Duration>,
}

/// State shared by every multiplexer variant: the target session, the cached
/// layout, and the event queue.
pub struct Controller {
    kind: MuxKind,
    runner: Arc<dyn MuxRunner>,
    target: RwLock<String>,
    layout: RwLock<Option<Arc<Layout>>>,
    events_tx: mpsc::Sender<Event>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    /// Held across a listing pass and the cache swap, and across a mutation
    /// and the refresh that follows it.
    refresh: tokio::sync::Mutex<()>,
    stopped: CancellationToken,
    poll_interval: Option<Duration>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("kind", &self.kind)
            .field("target", &*self.target.read())
            .finish_non_exhaustive()
    }
}

impl Controller {
    pub fn new(
        kind: MuxKind,
        session: impl Into<String>,
        runner: Arc<dyn MuxRunner>,
        options: ControllerOptions,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            kind,
            runner,
            target: RwLock::new(session.into()),
            layout: RwLock::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            refresh: tokio::sync::Mutex::new(()),
            stopped: CancellationToken::new(),
            poll_interval: options.poll_interval,
        }
    }

    pub fn kind(&self) -> MuxKind {
        self.kind
    }

    /// Name of the session the controller currently targets.
    pub fn target(&self) -> String {
        self.target.read().clone()
    }

    /// Most recently published layout, if any refresh has succeeded.
    pub fn layout(&self) -> Option<Arc<Layout>> {
        self.layout.read().clone()
    }

    /// Take the receiving end of the event queue. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<Event>> {
        self.events_rx.lock().take()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Make sure the target session exists, load the first layout, and start
    /// the poller if one is configured.
    pub async fn start(self: &Arc<Self>) -> Result<(), MuxError> {
        let session = self.target();
        let start_error = |source| MuxError::Start {
            kind: self.kind,
            session: session.clone(),
            source: Box::new(source),
        };

        if self.runner.run(&["has-session", "-t", &session]).await.is_err() {
            tracing::info!(kind = %self.kind, %session, "creating multiplexer session");
            self.runner
                .run(&["new-session", "-d", "-s", &session])
                .await
                .map_err(start_error)?;
        }

        self.refresh_layout().await.map_err(start_error)?;

        if let Some(every) = self.poll_interval.filter(|d| !d.is_zero()) {
            self.spawn_poller(every);
        }
        tracing::debug!(kind = %self.kind, %session, "controller started");
        Ok(())
    }

    /// Signal shutdown. Later calls are no-ops.
    pub fn stop(&self) {
        if !self.stopped.is_cancelled() {
            tracing::debug!(kind = %self.kind, "controller stopping");
            self.stopped.cancel();
        }
    }

    /// Rebuild the layout from three listings and swap it into the cache.
    ///
    /// Failing to list sessions or windows leaves the cached layout alone;
    /// a window whose panes cannot be listed is published without panes.
    pub async fn refresh_layout(&self) -> Result<Arc<Layout>, MuxError> {
        let held = self.refresh.lock().await;
        self.refresh_held(&held).await.map(|(_, layout)| layout)
    }

    /// One listing pass under the refresh lock. Returns the layout it
    /// replaced along with the new one.
    async fn refresh_held(
        &self,
        _held: &tokio::sync::MutexGuard<'_, ()>,
    ) -> Result<(Option<Arc<Layout>>, Arc<Layout>), MuxError> {
        let session = self.target();

        let output = self
            .runner
            .run(&["ls"])
            .await
            .map_err(MuxError::operation("list sessions"))?;
        let mut sessions = parse_sessions(&output).map_err(|e| MuxError::operation("list sessions")(e.into()))?;

        let mut layout = Layout {
            session_name: session.clone(),
            ..Layout::default()
        };
        for summary in &mut sessions {
            summary.active = summary.name == session;
            if summary.active {
                layout.session_id = summary.id.clone();
            }
        }
        layout.sessions = sessions;

        let output = self
            .runner
            .run(&["list-windows", "-t", &session])
            .await
            .map_err(MuxError::operation("list windows"))?;
        let mut windows = parse_windows(&output).map_err(|e| MuxError::operation("list windows")(e.into()))?;

        for window in &mut windows {
            let target = format!("{}:{}", session, window.index);
            let panes = match self.runner.run(&["list-panes", "-t", &target]).await {
                Ok(output) => parse_panes(&output).map_err(MuxError::from),
                Err(e) => Err(e),
            };
            match panes {
                Ok(panes) => window.panes = panes,
                Err(e) => {
                    tracing::debug!(%target, error = %e, "skipping panes for window");
                    continue;
                }
            }
            if window.active {
                if let Some(pane) = window.panes.iter().find(|p| p.active) {
                    layout.active_pane_id = pane.id.clone();
                }
            }
        }
        if let Some(active) = windows.iter().find(|w| w.active) {
            layout.active_window_id = active.id.clone();
        }
        layout.windows = windows;

        let layout = Arc::new(layout);
        let previous = self.layout.write().replace(layout.clone());
        Ok((previous, layout))
    }

    /// Refresh under a lock the caller already holds. A failed refresh
    /// falls back to the cached layout.
    async fn refresh_after(
        &self,
        held: &tokio::sync::MutexGuard<'_, ()>,
        op: &'static str,
    ) -> Option<Arc<Layout>> {
        match self.refresh_held(held).await {
            Ok((_, layout)) => Some(layout),
            Err(e) => {
                tracing::warn!(op, error = %e, "layout refresh after mutation failed");
                self.layout()
            }
        }
    }

    /// Run one mutating command, then refresh so callers see its effect.
    /// Returns the layout that refresh produced.
    async fn mutate(&self, op: &'static str, args: &[&str]) -> Result<Option<Arc<Layout>>, MuxError> {
        let held = self.refresh.lock().await;
        self.runner
            .run(args)
            .await
            .map_err(MuxError::operation(op))?;
        Ok(self.refresh_after(&held, op).await)
    }

    pub async fn select_pane(&self, pane_id: &str) -> Result<Option<Arc<Layout>>, MuxError> {
        self.mutate("select pane", &["select-pane", "-t", pane_id]).await
    }

    pub async fn select_window(&self, window_id: &str) -> Result<Option<Arc<Layout>>, MuxError> {
        self.mutate("select window", &["select-window", "-t", window_id])
            .await
    }

    pub async fn switch_session(&self, name: &str) -> Result<Option<Arc<Layout>>, MuxError> {
        let held = self.refresh.lock().await;
        self.runner
            .run(&["switch-client", "-t", name])
            .await
            .map_err(MuxError::operation("switch session"))?;
        *self.target.write() = name.to_string();
        self.publish(Event::SessionSwitched(name.to_string()));
        Ok(self.refresh_after(&held, "switch session").await)
    }

    pub async fn split_pane(&self, horizontal: bool) -> Result<Option<Arc<Layout>>, MuxError> {
        let flag = if horizontal { "-h" } else { "-v" };
        let session = self.target();
        self.mutate("split pane", &["split-window", "-t", &session, flag])
            .await
    }

    pub async fn close_pane(&self, pane_id: &str) -> Result<Option<Arc<Layout>>, MuxError> {
        self.mutate("close pane", &["kill-pane", "-t", pane_id]).await
    }

    pub async fn new_window(&self) -> Result<Option<Arc<Layout>>, MuxError> {
        let session = self.target();
        self.mutate("create new window", &["new-window", "-t", &session])
            .await
    }

    /// Queue an event without ever blocking; a full queue drops it.
    fn publish(&self, event: Event) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(kind = %self.kind, "controller event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn spawn_poller(self: &Arc<Self>, every: Duration) {
        let ctrl = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ctrl.stopped.cancelled() => break,
                    _ = ticker.tick() => {
                        let held = ctrl.refresh.lock().await;
                        match ctrl.refresh_held(&held).await {
                            Ok((before, after)) => {
                                if before.as_deref() != Some(after.as_ref()) {
                                    ctrl.publish(Event::LayoutChanged(after));
                                }
                            }
                            Err(e) => tracing::debug!(error = %e, "layout poll failed"),
                        }
                    }
                }
            }
            tracing::debug!(kind = %ctrl.kind, "layout poller exited");
        });
    }
}

/// Operations every multiplexer variant supports.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    fn controller(&self) -> &Arc<Controller>;

    fn kind(&self) -> MuxKind {
        self.controller().kind()
    }

    fn layout(&self) -> Option<Arc<Layout>> {
        self.controller().layout()
    }

    fn events(&self) -> Option<mpsc::Receiver<Event>> {
        self.controller().take_events()
    }

    fn stop(&self) {
        self.controller().stop()
    }

    async fn refresh_layout(&self) -> Result<Arc<Layout>, MuxError> {
        self.controller().refresh_layout().await
    }

    async fn select_pane(&self, pane_id: &str) -> Result<Option<Arc<Layout>>, MuxError> {
        self.controller().select_pane(pane_id).await
    }

    async fn select_window(&self, window_id: &str) -> Result<Option<Arc<Layout>>, MuxError> {
        self.controller().select_window(window_id).await
    }

    async fn switch_session(&self, name: &str) -> Result<Option<Arc<Layout>>, MuxError> {
        self.controller().switch_session(name).await
    }

    async fn split_pane(&self, horizontal: bool) -> Result<Option<Arc<Layout>>, MuxError> {
        self.controller().split_pane(horizontal).await
    }

    async fn close_pane(&self, pane_id: &str) -> Result<Option<Arc<Layout>>, MuxError> {
        self.controller().close_pane(pane_id).await
    }

    async fn new_window(&self) -> Result<Option<Arc<Layout>>, MuxError> {
        self.controller().new_window().await
    }
}

/// Scrollback navigation, only offered by multiplexers that have a copy mode.
#[async_trait]
pub trait CopyMode: Multiplexer {
    fn in_copy_mode(&self) -> bool;
    async fn enter_copy_mode(&self) -> Result<(), MuxError>;
    async fn exit_copy_mode(&self) -> Result<(), MuxError>;
    async fn scroll_up(&self, lines: u32) -> Result<(), MuxError>;
    async fn scroll_down(&self, lines: u32) -> Result<(), MuxError>;
}

#[derive(Debug)]
pub struct TmuxController {
    core: Arc<Controller>,
    copy_mode: AtomicBool,
}

impl TmuxController {
    pub fn new(session: impl Into<String>, runner: Arc<dyn MuxRunner>, options: ControllerOptions) -> Self {
        Self {
            core: Arc::new(Controller::new(MuxKind::Tmux, session, runner, options)),
            copy_mode: AtomicBool::new(false),
        }
    }

    /// Copy mode can be left from the terminal itself, so it is entered
    /// again before every scroll. `copy-mode` on a pane already in the mode
    /// is a no-op.
    async fn scroll(&self, direction: &'static str, lines: u32) -> Result<(), MuxError> {
        self.enter_copy_mode().await?;
        let target = self.core.target();
        let count = lines.max(1).to_string();
        self.core
            .runner
            .run(&["send-keys", "-t", &target, "-X", "-N", &count, direction])
            .await
            .map_err(MuxError::operation("scroll"))?;
        Ok(())
    }
}

impl Multiplexer for TmuxController {
    fn controller(&self) -> &Arc<Controller> {
        &self.core
    }
}

#[async_trait]
impl CopyMode for TmuxController {
    fn in_copy_mode(&self) -> bool {
        self.copy_mode.load(Ordering::Acquire)
    }

    async fn enter_copy_mode(&self) -> Result<(), MuxError> {
        let target = self.core.target();
        self.core
            .runner
            .run(&["copy-mode", "-t", &target])
            .await
            .map_err(MuxError::operation("enter copy mode"))?;
        self.copy_mode.store(true, Ordering::Release);
        Ok(())
    }

    async fn exit_copy_mode(&self) -> Result<(), MuxError> {
        let target = self.core.target();
        self.core
            .runner
            .run(&["send-keys", "-t", &target, "-X", "cancel"])
            .await
            .map_err(MuxError::operation("exit copy mode"))?;
        self.copy_mode.store(false, Ordering::Release);
        Ok(())
    }

    async fn scroll_up(&self, lines: u32) -> Result<(), MuxError> {
        self.scroll("scroll-up", lines).await
    }

    async fn scroll_down(&self, lines: u32) -> Result<(), MuxError> {
        self.scroll("scroll-down", lines).await
    }
}

#[derive(Debug)]
pub struct PsmuxController {
    core: Arc<Controller>,
}

impl PsmuxController {
    pub fn new(session: impl Into<String>, runner: Arc<dyn MuxRunner>, options: ControllerOptions) -> Self {
        Self {
            core: Arc::new(Controller::new(MuxKind::Psmux, session, runner, options)),
        }
    }
}

impl Multiplexer for PsmuxController {
    fn controller(&self) -> &Arc<Controller> {
        &self.core
    }
}

/// What the engine should push back after a handled request.
#[derive(Debug, Clone, PartialEq)]
pub enum MuxReply {
    Layout(Arc<Layout>),
    Mode(ModeState),
    Nothing,
}

fn layout_reply(layout: Option<Arc<Layout>>) -> MuxReply {
    layout.map_or(MuxReply::Nothing, MuxReply::Layout)
}

/// The controller attached to one session, tmux or psmux.
#[derive(Debug, Clone)]
pub enum MuxController {
    Tmux(Arc<TmuxController>),
    Psmux(Arc<PsmuxController>),
}

impl MuxController {
    /// Controller that shells out to the real multiplexer binary.
    pub fn new(kind: MuxKind, session: impl Into<String>, options: ControllerOptions) -> Self {
        let runner = Arc::new(ProcessRunner::new(kind.binary()));
        Self::with_runner(kind, session, runner, options)
    }

    pub fn with_runner(
        kind: MuxKind,
        session: impl Into<String>,
        runner: Arc<dyn MuxRunner>,
        options: ControllerOptions,
    ) -> Self {
        match kind {
            MuxKind::Tmux => Self::Tmux(Arc::new(TmuxController::new(session, runner, options))),
            MuxKind::Psmux => Self::Psmux(Arc::new(PsmuxController::new(session, runner, options))),
        }
    }

    pub fn multiplexer(&self) -> &dyn Multiplexer {
        match self {
            Self::Tmux(t) => &**t,
            Self::Psmux(p) => &**p,
        }
    }

    pub fn kind(&self) -> MuxKind {
        self.multiplexer().kind()
    }

    pub async fn start(&self) -> Result<(), MuxError> {
        self.multiplexer().controller().start().await
    }

    pub fn stop(&self) {
        self.multiplexer().stop()
    }

    pub fn layout(&self) -> Option<Arc<Layout>> {
        self.multiplexer().layout()
    }

    pub fn events(&self) -> Option<mpsc::Receiver<Event>> {
        self.multiplexer().events()
    }

    /// Perform one client request and say what to push back on success.
    ///
    /// Copy-mode and scroll requests sent to a psmux controller are
    /// [`MuxError::UnknownMessage`].
    pub async fn handle(&self, request: MuxRequest) -> Result<MuxReply, MuxError> {
        let mux = self.multiplexer();
        match request {
            MuxRequest::SelectPane(id) => mux.select_pane(&id).await.map(layout_reply),
            MuxRequest::SelectWindow(id) => mux.select_window(&id).await.map(layout_reply),
            MuxRequest::SplitPane { horizontal } => {
                mux.split_pane(horizontal).await.map(layout_reply)
            }
            MuxRequest::ClosePane(id) => mux.close_pane(&id).await.map(layout_reply),
            MuxRequest::NewWindow => mux.new_window().await.map(layout_reply),
            MuxRequest::SwitchSession(name) => mux.switch_session(&name).await.map(layout_reply),
            MuxRequest::CopyMode { enter } => {
                let tmux = self.copy_mode(&request)?;
                if enter {
                    tmux.enter_copy_mode().await?;
                } else {
                    tmux.exit_copy_mode().await?;
                }
                Ok(MuxReply::Mode(ModeState {
                    in_copy_mode: enter,
                    pane_id: self
                        .layout()
                        .map(|l| l.active_pane_id.clone())
                        .filter(|id| !id.is_empty()),
                }))
            }
            MuxRequest::ScrollUp(lines) => {
                self.copy_mode(&request)?.scroll_up(lines).await?;
                Ok(MuxReply::Nothing)
            }
            MuxRequest::ScrollDown(lines) => {
                self.copy_mode(&request)?.scroll_down(lines).await?;
                Ok(MuxReply::Nothing)
            }
        }
    }

    fn copy_mode(&self, request: &MuxRequest) -> Result<&dyn CopyMode, MuxError> {
        match self {
            Self::Tmux(t) => Ok(&**t),
            Self::Psmux(_) => Err(MuxError::UnknownMessage {
                kind: MuxKind::Psmux,
                tag: request.tag() as char,
            }),
        }
    }
}
