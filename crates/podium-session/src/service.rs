//! The session service: a single-writer actor owning the document.
//!
//! Commands arrive on an mpsc channel, snapshots and status go out on
//! watch channels, and rich events (state changed, log appended, reset
//! form) go through the event bus. Exactly one task mutates state;
//! everything else observes. Collaborators hold a cloneable
//! [`SessionHandle`].
//!
//! Every mutation runs the same commit pipeline: compute the next full
//! document, overwrite the previous one, write the local mirror, and, on
//! the host, broadcast the complete snapshot to every live link. There is
//! no delta sync. A mutation producing an identical document skips the
//! pipeline entirely.

use crate::config::SessionConfig;
use crate::mirror::{FileMirror, LocalChannel};
use crate::supervisor::{LinkSupervisor, SupervisorAction};
use crate::transport::{LinkId, Role, Transport, TransportError, TransportEvent};
use podium_core::clock::now_ms;
use podium_core::{
    ConnectionStatus, DisplaySelection, EventBus, LogBuffer, LogEntry, ResponseId, RoomCode,
    SessionEvent, SessionMessage, SessionState, Severity, Subscription,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How long a join waits for the first snapshot before failing.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before the redundant second `resetForm` broadcast.
pub const RESET_FORM_RESEND_MS: u64 = 700;

/// Service loop housekeeping cadence (resend deadline, probe schedule).
const TICK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No snapshot arrived within [`JOIN_TIMEOUT`] after connecting.
    #[error("Timed out joining room {0}: no snapshot from the host")]
    JoinTimeout(RoomCode),
}

/// Commands handled by the service task.
#[derive(Debug)]
enum Command {
    SetPrompt { text: String, max_score: u32 },
    SetAccepting(bool),
    SetDisplay(DisplaySelection),
    RecordResponse { name: String, text: String },
    SetScore { id: ResponseId, score: u32 },
    SetAiAssist { id: ResponseId, score: u32, feedback: String },
    ResetRound,
    StartNewClass,
    SubmitAnswer { text: String },
    Shutdown,
}

/// Cloneable handle to a running session.
///
/// Mutators are fire-and-forget sends into the service task; reads come
/// from watch channels and are always the latest committed snapshot. The
/// host-only mutators are silently ignored by a follower service, and
/// `submit_answer` by a host.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<SessionState>,
    status_rx: watch::Receiver<ConnectionStatus>,
    bus: Arc<EventBus>,
    logs: Arc<Mutex<LogBuffer>>,
    local: LocalChannel,
}

impl SessionHandle {
    /// The latest committed document.
    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    pub fn room_code(&self) -> Option<RoomCode> {
        self.state_rx.borrow().room_code
    }

    /// Watch channel over committed snapshots, for awaiting changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Subscribe to document changes. Dropping the subscription
    /// unsubscribes.
    pub fn subscribe(
        &self,
        on_change: impl Fn(SessionState) + Send + Sync + 'static,
    ) -> Subscription {
        self.bus.subscribe(move |event| {
            if let SessionEvent::StateChanged { state } = event {
                on_change(state);
            }
        })
    }

    /// Subscribe to operator-facing log entries.
    pub fn subscribe_logs(&self, on_log: impl Fn(LogEntry) + Send + Sync + 'static) -> Subscription {
        self.bus.subscribe(move |event| {
            if let SessionEvent::Log { entry } = event {
                on_log(entry);
            }
        })
    }

    /// The full event bus, for collaborators that need every event kind
    /// (notably `resetForm` on follower UIs).
    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Same-device snapshot channel for secondary read-only views on this
    /// machine. Only the host publishes to it; local views only apply.
    pub fn local_channel(&self) -> LocalChannel {
        self.local.clone()
    }

    /// Current contents of the operator log ring buffer.
    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries()
    }

    pub fn set_prompt(&self, text: &str, max_score: u32) {
        self.send(Command::SetPrompt {
            text: text.to_string(),
            max_score,
        });
    }

    pub fn toggle_accepting(&self, accepting: bool) {
        self.send(Command::SetAccepting(accepting));
    }

    pub fn set_display(&self, selection: DisplaySelection) {
        self.send(Command::SetDisplay(selection));
    }

    pub fn record_response(&self, name: &str, text: &str) {
        self.send(Command::RecordResponse {
            name: name.to_string(),
            text: text.to_string(),
        });
    }

    pub fn set_score(&self, id: ResponseId, score: u32) {
        self.send(Command::SetScore { id, score });
    }

    pub fn set_ai_assist(&self, id: ResponseId, score: u32, feedback: &str) {
        self.send(Command::SetAiAssist {
            id,
            score,
            feedback: feedback.to_string(),
        });
    }

    pub fn reset_round(&self) {
        self.send(Command::ResetRound);
    }

    pub fn start_new_class(&self) {
        self.send(Command::StartNewClass);
    }

    /// Submit an answer under the name given at join. Follower only.
    pub fn submit_answer(&self, text: &str) {
        self.send(Command::SubmitAnswer {
            text: text.to_string(),
        });
    }

    /// Stop the service task and tear down the transport.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    fn send(&self, command: Command) {
        // A send after shutdown has nowhere to go; that is fine
        let _ = self.cmd_tx.send(command);
    }
}

/// The actor task behind a [`SessionHandle`].
pub struct SessionService {
    role: Role,
    room: RoomCode,
    /// Follower display name, sent with joins and submissions.
    name: Option<String>,
    state: SessionState,
    transport: Box<dyn Transport>,
    supervisor: LinkSupervisor,
    mirror: FileMirror,
    local: LocalChannel,
    bus: Arc<EventBus>,
    logs: Arc<Mutex<LogBuffer>>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<SessionState>,
    status_tx: watch::Sender<ConnectionStatus>,
    status: ConnectionStatus,
    /// When due, the redundant second `resetForm` goes out.
    reset_resend_at: Option<u64>,
}

impl SessionService {
    /// Start hosting. Resumes the room code from the local mirror when a
    /// prior document exists, otherwise generates a fresh one.
    pub async fn host(config: &SessionConfig) -> Result<SessionHandle, SessionError> {
        Self::host_with(config, config.build_transport()).await
    }

    /// Start hosting over an externally built transport.
    pub async fn host_with(
        config: &SessionConfig,
        mut transport: Box<dyn Transport>,
    ) -> Result<SessionHandle, SessionError> {
        let mirror = FileMirror::new(&config.data_dir);
        let mut state = match mirror.load() {
            Ok(Some(prior)) => {
                debug!("Resuming from mirrored session document");
                prior
            }
            Ok(None) => SessionState::default(),
            Err(e) => {
                warn!("Ignoring unreadable session mirror: {}", e);
                SessionState::default()
            }
        };
        let room = match state.room_code {
            Some(room) => room,
            None => RoomCode::generate(),
        };
        state.room_code = Some(room);

        transport.open(Role::Host, room).await?;

        let (mut service, handle) = Self::build(Role::Host, room, None, state, transport, mirror);
        service.supervisor.on_connected(now_ms());
        service.set_status(ConnectionStatus::Connected);
        if let Err(e) = service.mirror.save(&service.state) {
            warn!("Failed to write session mirror: {}", e);
        }
        service.local.publish(&service.state);
        service.log(Severity::Success, format!("Hosting room {}", room));

        tokio::spawn(service.run());
        Ok(handle)
    }

    /// Join a room as a follower. Fails with [`SessionError::JoinTimeout`]
    /// when no snapshot arrives within [`JOIN_TIMEOUT`].
    pub async fn join(
        config: &SessionConfig,
        room: RoomCode,
        name: &str,
    ) -> Result<SessionHandle, SessionError> {
        Self::join_with(config, config.build_transport(), room, name).await
    }

    /// Join over an externally built transport.
    pub async fn join_with(
        config: &SessionConfig,
        mut transport: Box<dyn Transport>,
        room: RoomCode,
        name: &str,
    ) -> Result<SessionHandle, SessionError> {
        let mirror = FileMirror::new(&config.data_dir);
        transport.open(Role::Follower, room).await?;

        let (mut service, handle) = Self::build(
            Role::Follower,
            room,
            Some(name.to_string()),
            SessionState::default(),
            transport,
            mirror,
        );
        service.set_status(ConnectionStatus::Connecting);
        service.log(Severity::Info, format!("Joining room {} as {}", room, name));

        let mut state_rx = handle.state_rx.clone();
        tokio::spawn(service.run());

        // The first applied snapshot marks the join as complete
        match timeout(JOIN_TIMEOUT, state_rx.changed()).await {
            Ok(Ok(())) => Ok(handle),
            _ => {
                handle.shutdown();
                Err(SessionError::JoinTimeout(room))
            }
        }
    }

    fn build(
        role: Role,
        room: RoomCode,
        name: Option<String>,
        state: SessionState,
        transport: Box<dyn Transport>,
        mirror: FileMirror,
    ) -> (Self, SessionHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(state.clone());
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let bus = Arc::new(EventBus::new());
        let logs = Arc::new(Mutex::new(LogBuffer::new()));
        let supervisor = LinkSupervisor::new(transport.needs_probe());
        let local = LocalChannel::new();

        let service = Self {
            role,
            room,
            name,
            state,
            transport,
            supervisor,
            mirror,
            local: local.clone(),
            bus: Arc::clone(&bus),
            logs: Arc::clone(&logs),
            cmd_rx,
            state_tx,
            status_tx,
            status: ConnectionStatus::Disconnected,
            reset_resend_at: None,
        };
        let handle = SessionHandle {
            cmd_tx,
            state_rx,
            status_rx,
            bus,
            logs,
            local,
        };
        (service, handle)
    }

    /// The service event loop. Runs until shutdown or transport closure.
    pub async fn run(mut self) {
        let mut tick = interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = self.transport.next_event() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        debug!("Transport closed, stopping session service");
                        break;
                    }
                },
                _ = tick.tick() => self.handle_tick().await,
            }
        }

        self.transport.close().await;
        self.set_status(ConnectionStatus::Disconnected);
        debug!("Session service for room {} stopped", self.room);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetPrompt { text, max_score } => {
                self.mutate(|state| state.set_prompt(&text, max_score)).await;
            }
            Command::SetAccepting(accepting) => {
                self.mutate(|state| state.set_accepting(accepting)).await;
            }
            Command::SetDisplay(selection) => {
                self.mutate(|state| state.set_display(selection)).await;
            }
            Command::RecordResponse { name, text } => {
                let timestamp = now_ms();
                self.mutate(|state| state.record_response(&name, &text, timestamp))
                    .await;
            }
            Command::SetScore { id, score } => {
                self.mutate(|state| state.set_score(&id, score)).await;
            }
            Command::SetAiAssist { id, score, feedback } => {
                self.mutate(|state| state.set_ai_assist(&id, score, &feedback))
                    .await;
            }
            Command::ResetRound => self.reset_round().await,
            Command::StartNewClass => self.start_new_class().await,
            Command::SubmitAnswer { text } => self.submit_answer(&text).await,
            Command::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    /// Host commit pipeline. Identical documents skip it entirely.
    async fn mutate(&mut self, f: impl FnOnce(&mut SessionState)) {
        if self.role != Role::Host {
            debug!("Ignoring host mutation on a follower");
            return;
        }
        let mut next = self.state.clone();
        f(&mut next);
        if next == self.state {
            return;
        }
        self.commit(next).await;
    }

    async fn commit(&mut self, next: SessionState) {
        self.state = next;
        if let Err(e) = self.mirror.save(&self.state) {
            // Best-effort: the session carries on without the mirror
            warn!("Failed to write session mirror: {}", e);
            self.log(Severity::Error, "Failed to write local session mirror");
        }
        self.state_tx.send_replace(self.state.clone());
        self.local.publish(&self.state);
        self.bus.emit(SessionEvent::StateChanged {
            state: self.state.clone(),
        });

        let snapshot = SessionMessage::SyncState {
            state: self.state.clone(),
        };
        if let Err(e) = self.transport.broadcast(&snapshot).await {
            warn!("Failed to broadcast snapshot: {}", e);
        }
    }

    /// `reset_round` plus the out-of-band draft-clear broadcast. The clear
    /// is sent twice (now and after [`RESET_FORM_RESEND_MS`]) because no
    /// delivery acknowledgment exists; followers apply it idempotently.
    async fn reset_round(&mut self) {
        if self.role != Role::Host {
            return;
        }
        self.mutate(|state| state.reset_round()).await;
        if let Err(e) = self.transport.broadcast(&SessionMessage::ResetForm).await {
            warn!("Failed to broadcast form reset: {}", e);
        }
        self.reset_resend_at = Some(now_ms() + RESET_FORM_RESEND_MS);
        self.log(Severity::Info, "Round reset, responses cleared");
    }

    /// Tear everything down and start hosting again under a fresh room code.
    async fn start_new_class(&mut self) {
        if self.role != Role::Host {
            return;
        }
        self.transport.close().await;
        self.set_status(ConnectionStatus::Connecting);

        let room = RoomCode::generate();
        self.room = room;
        self.reset_resend_at = None;
        let mut next = self.state.clone();
        next.reset_for_new_class(room);
        self.commit(next).await;

        match self.transport.open(Role::Host, room).await {
            Ok(()) => {
                self.supervisor.on_connected(now_ms());
                self.set_status(ConnectionStatus::Connected);
                self.log(Severity::Success, format!("Hosting new class in room {}", room));
            }
            Err(e) => {
                self.supervisor.on_disconnected();
                self.set_status(ConnectionStatus::Error);
                self.log(Severity::Error, format!("Failed to restart hosting: {}", e));
            }
        }
    }

    async fn submit_answer(&mut self, text: &str) {
        if self.role != Role::Follower {
            debug!("Ignoring submission on the host");
            return;
        }
        let name = self.name.clone().unwrap_or_default();
        let message = SessionMessage::SubmitAnswer {
            name,
            text: text.to_string(),
        };
        if let Err(e) = self.transport.broadcast(&message).await {
            warn!("Failed to send submission: {}", e);
            self.log(Severity::Error, "Failed to send answer to the host");
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LinkOpened { link } => match self.role {
                Role::Host => {
                    // First reaction to any opened link is a full snapshot
                    let snapshot = SessionMessage::SyncState {
                        state: self.state.clone(),
                    };
                    if let Err(e) = self.transport.send_to(link, &snapshot).await {
                        warn!("Failed to send snapshot to {}: {}", link, e);
                    }
                    self.log(Severity::Info, "A participant connected");
                }
                Role::Follower => {
                    let name = self.name.clone().unwrap_or_default();
                    let join = SessionMessage::JoinRequest { name };
                    if let Err(e) = self.transport.send_to(link, &join).await {
                        warn!("Failed to send join request: {}", e);
                    }
                    self.supervisor.on_connected(now_ms());
                    self.set_status(ConnectionStatus::Connected);
                }
            },
            TransportEvent::LinkClosed { link } => match self.role {
                Role::Host => {
                    debug!("Follower {} disconnected", link);
                    self.log(Severity::Info, "A participant left");
                }
                Role::Follower => {
                    // Upstream is gone; reuse the signaling-loss schedule to
                    // drive the redial
                    self.supervisor.on_signaling_lost(now_ms());
                    self.set_status(ConnectionStatus::Connecting);
                    self.log(Severity::Error, "Lost the connection to the host");
                }
            },
            TransportEvent::Message { link, message } => self.handle_message(link, message).await,
            TransportEvent::SignalingLost => {
                self.supervisor.on_signaling_lost(now_ms());
                if self.transport.link_count() == 0 && self.role == Role::Follower {
                    self.set_status(ConnectionStatus::Connecting);
                }
                self.log(Severity::Error, "Lost the server connection, reconnecting");
            }
            TransportEvent::Fault { detail } => {
                warn!("Transport fault: {}", detail);
                self.set_status(ConnectionStatus::Error);
                self.log(Severity::Error, format!("Connection fault: {}", detail));
            }
        }
    }

    async fn handle_message(&mut self, link: LinkId, message: SessionMessage) {
        match (self.role, message) {
            (Role::Host, SessionMessage::JoinRequest { name }) => {
                info!("{} joined room {}", name, self.room);
                self.log(Severity::Success, format!("{} joined", name));
            }
            (Role::Host, SessionMessage::SubmitAnswer { name, text }) => {
                let timestamp = now_ms();
                self.mutate(|state| state.record_response(&name, &text, timestamp))
                    .await;
                self.log(Severity::Info, format!("Answer received from {}", name));
            }
            (Role::Follower, SessionMessage::SyncState { state }) => {
                // Replicas apply unconditionally: last write wins
                self.state = state;
                self.state_tx.send_replace(self.state.clone());
                self.bus.emit(SessionEvent::StateChanged {
                    state: self.state.clone(),
                });
            }
            (Role::Follower, SessionMessage::ResetForm) => {
                // Duplicates expected; subscribers clear idempotently
                self.bus.emit(SessionEvent::ResetForm);
            }
            (_, message) => {
                debug!("Dropping unexpected message on {}: {:?}", link, message);
            }
        }
    }

    async fn handle_tick(&mut self) {
        let now = now_ms();

        if self.reset_resend_at.is_some_and(|at| now >= at) {
            self.reset_resend_at = None;
            if let Err(e) = self.transport.broadcast(&SessionMessage::ResetForm).await {
                warn!("Failed to resend form reset: {}", e);
            }
        }

        match self.supervisor.poll(now) {
            Some(SupervisorAction::Probe) => {
                if !self.transport.probe().await {
                    debug!("Signaling probe failed");
                    self.supervisor.on_signaling_lost(now_ms());
                    if self.transport.link_count() == 0 && self.role == Role::Follower {
                        self.set_status(ConnectionStatus::Connecting);
                    }
                    self.log(Severity::Error, "Lost the server connection, reconnecting");
                }
            }
            Some(SupervisorAction::Reconnect) => match self.transport.reconnect().await {
                Ok(()) => {
                    self.supervisor.on_connected(now_ms());
                    self.log(Severity::Success, "Server connection re-established");
                    if self.role == Role::Host {
                        // Members may have rejoined while we were away
                        let snapshot = SessionMessage::SyncState { state: self.state.clone() };
                        if let Err(e) = self.transport.broadcast(&snapshot).await {
                            warn!("Failed to push state after reconnect: {}", e);
                        }
                    }
                }
                Err(e) => {
                    debug!("Reconnect attempt failed: {}", e);
                    self.supervisor.on_reconnect_failed(now_ms());
                }
            },
            None => {}
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if status == self.status {
            return;
        }
        self.status = status;
        self.status_tx.send_replace(status);
        self.bus.emit(SessionEvent::StatusChanged { status });
    }

    fn log(&self, severity: Severity, message: impl Into<String>) {
        let entry = self
            .logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(now_ms(), severity, message);
        self.bus.emit(SessionEvent::Log { entry });
    }
}
