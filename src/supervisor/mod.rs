mod backoff;

pub use backoff::ReconnectPolicy;

use crate::credentials::{CredentialState, CredentialStore};
use crate::events::{EventSink, PanelEvent};
use crate::model::{ConnectionPhase, ConnectionStatus};
use crate::pipeline::ResponsePipeline;
use crate::transport::{
    disconnect_message, disconnect_status_code, ConnectOptions, ConnectionCell, ConnectionHandle,
    ConnectionSignal, ConnectionUpdate, DisconnectReason, OpenedConnection, Transport,
    TransportEvent,
};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Reconnect,
}

#[derive(Default)]
struct State {
    phase: ConnectionPhase,
    connected: bool,
    attempts: u32,
    generation: u64,
    starting: bool,
    stopped: bool,
    qr: Option<String>,
    reconnect_timer: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    options: ConnectOptions,
    policy: ReconnectPolicy,
    events: EventSink,
    pipeline: ResponsePipeline,
    connection: ConnectionCell,
    state: Mutex<State>,
    commands: mpsc::UnboundedSender<Command>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

pub struct SupervisorParts {
    pub transport: Arc<dyn Transport>,
    pub credentials: Arc<dyn CredentialStore>,
    pub options: ConnectOptions,
    pub policy: ReconnectPolicy,
    pub events: EventSink,
    pub pipeline: ResponsePipeline,
    pub connection: ConnectionCell,
}

impl Supervisor {
    pub fn spawn(parts: SupervisorParts) -> Self {
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            transport: parts.transport,
            credentials: parts.credentials,
            options: parts.options,
            policy: parts.policy,
            events: parts.events,
            pipeline: parts.pipeline,
            connection: parts.connection,
            state: Mutex::new(State::default()),
            commands,
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match command {
                    Command::Reconnect => {
                        if inner.lock_state().stopped {
                            tracing::debug!("reconnect skipped: supervisor stopped");
                            continue;
                        }
                        Supervisor { inner }.start().await;
                    }
                }
            }
        });

        Self { inner }
    }

    /// A call made while another start is in progress returns the current
    /// handle unchanged.
    pub async fn start(&self) -> Option<ConnectionHandle> {
        let Some(_guard) = StartGuard::acquire(&self.inner) else {
            tracing::debug!("start already in progress");
            return self.inner.connection.current();
        };

        self.inner.cancel_reconnect_timer();
        let generation = self.inner.teardown();
        self.inner.lock_state().phase = ConnectionPhase::Authenticating;
        tracing::info!(generation, "starting connection");

        let credentials = match self.inner.credentials.load() {
            Ok(credentials) => credentials,
            Err(err) => {
                tracing::error!(error = %err, "failed to load credentials");
                self.inner.schedule_reconnect(DisconnectReason::Other(None));
                return None;
            }
        };

        let opened = self.inner.transport.open(&self.inner.options, credentials).await;
        let OpenedConnection { handle, events } = match opened {
            Ok(opened) => opened,
            Err(err) => {
                tracing::error!(error = %err, "failed to open connection");
                self.inner.schedule_reconnect(DisconnectReason::Other(None));
                return None;
            }
        };

        let mut state = self.inner.lock_state();
        if state.generation != generation {
            // stop or force_pair ran while the transport was opening
            let stopped = state.stopped;
            drop(state);
            handle.end();
            drop(_guard);
            if !stopped {
                let _ = self.inner.commands.send(Command::Reconnect);
            }
            return self.inner.connection.current();
        }

        self.inner.connection.replace(handle.clone());
        let listener = tokio::spawn(self.inner.clone().listen(generation, events));
        state.listener = Some(listener);
        Some(handle)
    }

    pub async fn force_pair(&self) -> Option<ConnectionHandle> {
        tracing::info!("regenerating pairing code");
        self.inner.cancel_reconnect_timer();
        if let Some(handle) = self.inner.connection.current() {
            if let Err(err) = handle.logout().await {
                tracing::debug!(error = %err, "logout before re-pairing failed");
            }
        }
        self.inner.teardown();
        self.inner.wipe_credentials();
        {
            let mut state = self.inner.lock_state();
            state.qr = None;
            state.attempts = 0;
            state.stopped = false;
            state.connected = false;
        }
        self.inner.events.emit(PanelEvent::Qr(None));
        self.inner.events.emit(PanelEvent::Connected(false));
        self.start().await
    }

    pub async fn stop(&self) {
        {
            let mut state = self.inner.lock_state();
            state.stopped = true;
        }
        self.inner.cancel_reconnect_timer();

        if let Some(handle) = self.inner.connection.current() {
            match handle.logout().await {
                Ok(()) => tracing::info!("client disconnected"),
                Err(err) => tracing::warn!(error = %err, "logout failed"),
            }
        }
        self.inner.teardown();

        {
            let mut state = self.inner.lock_state();
            state.qr = None;
            state.phase = ConnectionPhase::Idle;
            state.connected = false;
        }
        self.inner.events.emit(PanelEvent::Connected(false));
    }

    pub fn status(&self) -> ConnectionStatus {
        let state = self.inner.lock_state();
        ConnectionStatus {
            phase: state.phase,
            connected: state.connected,
            qr: state.qr.clone(),
            reconnect_attempts: state.attempts,
        }
    }

    pub fn last_qr(&self) -> Option<String> {
        self.inner.lock_state().qr.clone()
    }
}

struct StartGuard {
    inner: Arc<Inner>,
}

impl StartGuard {
    fn acquire(inner: &Arc<Inner>) -> Option<Self> {
        let mut state = inner.lock_state();
        if state.starting {
            return None;
        }
        state.starting = true;
        state.stopped = false;
        Some(Self {
            inner: inner.clone(),
        })
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        self.inner.lock_state().starting = false;
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Invalidates the current generation, stops its listener and ends its
    /// handle. Returns the new generation.
    fn teardown(&self) -> u64 {
        let (generation, listener) = {
            let mut state = self.lock_state();
            state.generation += 1;
            (state.generation, state.listener.take())
        };
        if let Some(listener) = listener {
            listener.abort();
        }
        if let Some(handle) = self.connection.take() {
            handle.end();
        }
        generation
    }

    fn cancel_reconnect_timer(&self) {
        if let Some(timer) = self.lock_state().reconnect_timer.take() {
            timer.abort();
        }
    }

    fn wipe_credentials(&self) {
        if let Err(err) = self.credentials.wipe() {
            tracing::error!(error = %err, "failed to wipe session credentials");
        }
    }

    fn schedule_reconnect(&self, reason: DisconnectReason) {
        let mut state = self.lock_state();
        if state.stopped {
            return;
        }

        let wait = self.policy.delay(state.attempts, reason);
        state.attempts = state.attempts.saturating_add(1);
        state.phase = ConnectionPhase::Closed;
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }

        tracing::warn!(
            wait_ms = wait.as_millis() as u64,
            attempt = state.attempts,
            code = ?reason.status_code(),
            "reconnect scheduled"
        );

        let commands = self.commands.clone();
        state.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = commands.send(Command::Reconnect);
        }));
    }

    async fn listen(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if self.lock_state().generation != generation {
                tracing::debug!(generation, "dropping event from superseded connection");
                break;
            }
            match event {
                TransportEvent::CredentialsUpdated(credentials) => {
                    self.persist_credentials(&credentials)
                }
                TransportEvent::ConnectionUpdate(update) => self.on_connection_update(update),
                TransportEvent::Messages(envelopes) => self.pipeline.handle_envelopes(&envelopes),
            }
        }
        tracing::debug!(generation, "connection event stream ended");
    }

    fn persist_credentials(&self, credentials: &CredentialState) {
        if let Err(err) = self.credentials.persist(credentials) {
            tracing::error!(error = %err, "failed to persist credentials");
        }
    }

    fn on_connection_update(&self, update: ConnectionUpdate) {
        if let Some(qr) = update.qr.filter(|qr| !qr.is_empty()) {
            self.lock_state().qr = Some(qr.clone());
            self.events.emit(PanelEvent::Qr(Some(qr)));
            tracing::info!("new pairing code ready");
        }

        match update.connection {
            Some(ConnectionSignal::Open) => {
                {
                    let mut state = self.lock_state();
                    state.attempts = 0;
                    state.qr = None;
                    state.phase = ConnectionPhase::Open;
                    state.connected = true;
                }
                tracing::info!("connection open");
                self.events.emit(PanelEvent::Connected(true));
            }
            Some(ConnectionSignal::Close) => self.on_close(update.last_disconnect),
            Some(ConnectionSignal::Connecting) | None => {}
        }
    }

    fn on_close(&self, last_disconnect: Option<serde_json::Value>) {
        let stopped = {
            let mut state = self.lock_state();
            state.connected = false;
            state.stopped
        };
        self.events.emit(PanelEvent::Connected(false));

        let (code, message) = match &last_disconnect {
            Some(raw) => (disconnect_status_code(raw), disconnect_message(raw)),
            None => (None, "Connection Failure".to_string()),
        };
        let reason = DisconnectReason::from_status_code(code);
        tracing::warn!(code = ?code, message = %message, "connection closed");

        if stopped {
            return;
        }

        match reason {
            DisconnectReason::LoggedOut => {
                tracing::warn!("session logged out, a new pairing is required");
                self.cancel_reconnect_timer();
                self.teardown();
                self.wipe_credentials();
                let mut state = self.lock_state();
                state.qr = None;
                state.phase = ConnectionPhase::Idle;
            }
            DisconnectReason::BadSession => {
                tracing::warn!("session data rejected, wiping and reconnecting");
                self.wipe_credentials();
                {
                    let mut state = self.lock_state();
                    state.qr = None;
                    state.phase = ConnectionPhase::Closed;
                }
                self.events.emit(PanelEvent::Qr(None));
                let _ = self.commands.send(Command::Reconnect);
            }
            DisconnectReason::Replaced => {
                tracing::warn!("connection replaced by another session, not reconnecting");
                self.cancel_reconnect_timer();
                self.teardown();
                self.lock_state().phase = ConnectionPhase::Closed;
            }
            DisconnectReason::RateLimited
            | DisconnectReason::Blocked
            | DisconnectReason::Other(_) => self.schedule_reconnect(reason),
        }
    }
}
