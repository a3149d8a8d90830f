//! Per-connection session state and the host/viewer drivers.
//!
//! [`Session`] owns the negotiator and multiplexer for one control
//! connection. Drivers feed it server envelopes and transport events from a
//! single task and act on the [`SessionEvent`]s it returns.

pub mod host;
pub mod viewer;

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use rand::Rng;
use serde_json::Value;
use tether_proto::{PeerEnvelope, Role, ServerControl, ServerEnvelope, UserProfile};
use tokio::sync::mpsc;

use crate::identity::StateStore;
use crate::signaling::SignalingClient;
use crate::transport::{
    DIRECT_CLOSED, Multiplexer, Negotiator, Path, PeerConnector, PeerEvent, PeerEventKind,
    RelayLink, Route, TransportError, TransportState,
};

/// Ctrl-] ends the local session.
pub const DETACH_BYTE: u8 = 0x1d;
pub const TERMINAL_READY: &str = "terminal_ready";

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Status(String),
    Registered(String),
    PairingCode(String),
    LoginRequired(String),
    Authenticated { token: String, user: UserProfile },
    AuthRejected(String),
    Paired { peer_id: String },
    PeerLost,
    CodeExpired,
    ServerError(String),
    TransportChanged(TransportState),
    TerminalInput(Vec<u8>),
    TerminalOutput(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    System { kind: String, payload: Option<Value> },
}

pub struct Session<C> {
    role: Role,
    negotiator: Negotiator<C>,
    multiplexer: Multiplexer,
    relay: Arc<dyn RelayLink>,
    paired_with: Option<String>,
}

impl<C: PeerConnector> Session<C> {
    pub fn new(
        role: Role,
        connector: C,
        discovery_timeout: Duration,
        relay: Arc<dyn RelayLink>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (negotiator, events) = Negotiator::new(connector, role, discovery_timeout);
        let session = Self {
            role,
            negotiator,
            multiplexer: Multiplexer::new(),
            relay,
            paired_with: None,
        };
        (session, events)
    }

    pub fn is_paired(&self) -> bool {
        self.paired_with.is_some()
    }

    pub fn transport_state(&self) -> TransportState {
        self.negotiator.state()
    }

    /// Send a session envelope on whichever path is live. A failed direct
    /// write retires the direct transport; the session carries on via relay.
    pub async fn send(&mut self, envelope: PeerEnvelope) -> Result<Route, TransportError> {
        let direct = self.negotiator.direct();
        let route = self.multiplexer.send(
            self.negotiator.state(),
            direct.as_deref(),
            self.relay.as_ref(),
            envelope,
        )?;
        if route == Route::RelayFallback {
            self.negotiator.teardown().await;
        }
        Ok(route)
    }

    pub async fn handle_server(
        &mut self,
        envelope: ServerEnvelope,
    ) -> Result<Vec<SessionEvent>, TransportError> {
        let control = match envelope {
            ServerEnvelope::Peer(peer) => return self.handle_peer(Path::Relay, peer).await,
            ServerEnvelope::Control(control) => control,
        };
        let mut events = Vec::new();
        match control {
            ServerControl::Registered {
                pairing_code,
                message,
            } => match pairing_code {
                Some(code) => events.push(SessionEvent::PairingCode(code)),
                None => events.push(SessionEvent::Registered(message)),
            },
            ServerControl::LoginRequired { login_url } => {
                events.push(SessionEvent::LoginRequired(login_url));
            }
            ServerControl::AuthError { message } => events.push(SessionEvent::AuthRejected(message)),
            ServerControl::Authenticated { token, user } => {
                events.push(SessionEvent::Authenticated { token, user });
            }
            ServerControl::Paired { peer_id, message } => {
                tracing::info!(target = "tether::session", peer = %peer_id, "{message}");
                self.negotiator.teardown().await;
                self.paired_with = Some(peer_id.clone());
                events.push(SessionEvent::Paired { peer_id });
                if self.role == Role::Host {
                    self.begin_negotiation(&mut events).await?;
                }
            }
            ServerControl::WaitingForPeer { message } => events.push(SessionEvent::Status(message)),
            ServerControl::PairedDeviceDisconnected { message } => {
                tracing::info!(target = "tether::session", "{message}");
                self.paired_with = None;
                self.negotiator.teardown().await;
                events.push(SessionEvent::PeerLost);
                events.push(SessionEvent::TransportChanged(self.negotiator.state()));
            }
            ServerControl::PairingCodeExpired { expired_code, .. } => {
                tracing::debug!(target = "tether::session", code = %expired_code, "pairing code expired");
                events.push(SessionEvent::CodeExpired);
            }
            ServerControl::Error { message } => events.push(SessionEvent::ServerError(message)),
        }
        Ok(events)
    }

    pub async fn handle_transport(
        &mut self,
        event: PeerEvent,
    ) -> Result<Vec<SessionEvent>, TransportError> {
        let event = match event.kind {
            PeerEventKind::Message(envelope) => {
                if !self.negotiator.is_current(event.generation) {
                    return Ok(Vec::new());
                }
                return self.handle_peer(Path::Direct, envelope).await;
            }
            PeerEventKind::Undelivered(envelopes) => {
                if !self.negotiator.is_current(event.generation) {
                    return Ok(Vec::new());
                }
                tracing::warn!(
                    target = "tether::session",
                    count = envelopes.len(),
                    "direct writes failed, resending via relay"
                );
                self.retire_direct().await?;
                for envelope in envelopes {
                    self.relay.send_peer(envelope)?;
                }
                return Ok(vec![SessionEvent::TransportChanged(self.negotiator.state())]);
            }
            kind => PeerEvent {
                generation: event.generation,
                kind,
            },
        };

        let before = self.negotiator.state();
        let mut events = Vec::new();
        if let Some(signal) = self.negotiator.handle_peer_event(event) {
            self.relay.send_peer(signal)?;
        }
        let after = self.negotiator.state();
        if after != before {
            events.push(SessionEvent::TransportChanged(after));
            if after.is_terminal() {
                tracing::info!(target = "tether::session", state = ?after, "direct transport down, staying on relay");
                self.retire_direct().await?;
            }
        }
        Ok(events)
    }

    pub async fn shutdown(&mut self) {
        self.negotiator.teardown().await;
        self.paired_with = None;
    }

    /// Drop the direct transport and tell the partner, so relayed terminal
    /// bytes that follow are not discarded as duplicates.
    async fn retire_direct(&mut self) -> Result<(), TransportError> {
        self.negotiator.teardown().await;
        if self.paired_with.is_some() {
            self.relay.send_peer(PeerEnvelope::system(DIRECT_CLOSED))?;
        }
        Ok(())
    }

    async fn begin_negotiation(
        &mut self,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), TransportError> {
        match self.negotiator.start_offer().await {
            Ok(offer) => {
                self.relay.send_peer(offer)?;
                events.push(SessionEvent::TransportChanged(self.negotiator.state()));
            }
            Err(err) => {
                tracing::warn!(target = "tether::session", error = %err, "direct transport unavailable, relay only");
            }
        }
        Ok(())
    }

    async fn handle_peer(
        &mut self,
        path: Path,
        envelope: PeerEnvelope,
    ) -> Result<Vec<SessionEvent>, TransportError> {
        let mut events = Vec::new();
        match envelope {
            PeerEnvelope::Offer { description } => {
                if self.role != Role::Viewer {
                    tracing::debug!(target = "tether::session", "host ignoring offer");
                    return Ok(events);
                }
                match self.negotiator.handle_offer(description).await {
                    Ok(answer) => {
                        self.relay.send_peer(answer)?;
                        events.push(SessionEvent::TransportChanged(self.negotiator.state()));
                    }
                    Err(err) => {
                        tracing::warn!(target = "tether::session", error = %err, "could not answer, relay only");
                    }
                }
            }
            PeerEnvelope::Answer { description } => {
                let before = self.negotiator.state();
                if let Err(err) = self.negotiator.handle_answer(description).await {
                    tracing::warn!(target = "tether::session", error = %err, "answer rejected, relay only");
                }
                if self.negotiator.state() != before {
                    events.push(SessionEvent::TransportChanged(self.negotiator.state()));
                }
            }
            PeerEnvelope::IceCandidate { candidate } => {
                self.negotiator.handle_candidate(candidate).await;
            }
            PeerEnvelope::SystemMessage { kind, .. } if kind == DIRECT_CLOSED => {
                if self.negotiator.state() != TransportState::Idle {
                    tracing::info!(target = "tether::session", "partner closed the direct transport");
                    self.negotiator.teardown().await;
                    events.push(SessionEvent::TransportChanged(self.negotiator.state()));
                }
            }
            other => {
                if !self
                    .multiplexer
                    .accept(self.negotiator.state(), path, &other)
                {
                    return Ok(events);
                }
                if let Some(event) = self.session_event(other) {
                    events.push(event);
                }
            }
        }
        Ok(events)
    }

    fn session_event(&self, envelope: PeerEnvelope) -> Option<SessionEvent> {
        match (self.role, envelope) {
            (Role::Host, PeerEnvelope::TerminalInput { data }) => {
                Some(SessionEvent::TerminalInput(data))
            }
            (
                Role::Host,
                PeerEnvelope::TerminalResize { cols, rows }
                | PeerEnvelope::TerminalDimensions { cols, rows },
            ) => Some(SessionEvent::Resize { cols, rows }),
            (Role::Viewer, PeerEnvelope::TerminalOutput { data }) => {
                Some(SessionEvent::TerminalOutput(data))
            }
            (_, PeerEnvelope::SystemMessage { kind, payload }) => {
                Some(SessionEvent::System { kind, payload })
            }
            (role, other) => {
                tracing::debug!(target = "tether::session", role = %role, kind = other.kind(), "ignoring envelope for the other role");
                None
            }
        }
    }
}

/// Exponential reconnect delay with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        let base = self.min.saturating_mul(factor).min(self.max);
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        (base + Duration::from_millis(jitter)).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

pub struct RawModeGuard(bool);

impl RawModeGuard {
    pub fn new(enable: bool) -> Self {
        if enable {
            match enable_raw_mode() {
                Ok(()) => Self(true),
                Err(err) => {
                    eprintln!("failed to enable raw mode: {err}");
                    Self(false)
                }
            }
        } else {
            Self(false)
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.0 {
            let _ = disable_raw_mode();
        }
    }
}

/// Print a status line. Raw mode needs the explicit carriage return.
pub fn notice(message: impl AsRef<str>) {
    let mut stderr = std::io::stderr();
    let _ = write!(stderr, "\r[tether] {}\r\n", message.as_ref());
    let _ = stderr.flush();
}

pub fn write_stdout(bytes: &[u8]) {
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(bytes);
    let _ = stdout.flush();
}

pub fn terminal_size() -> (u16, u16) {
    crossterm::terminal::size()
        .ok()
        .filter(|(cols, rows)| *cols > 0 && *rows > 0)
        .unwrap_or((80, 24))
}

/// Blocking stdin reader on its own thread.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("tether-stdin".into())
        .spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buffer = [0u8; 1024];
            loop {
                match stdin.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buffer[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(target = "tether::session", error = %err, "failed to start stdin reader");
    }
    rx
}

/// Everything before the detach byte, and whether it was present.
pub fn split_detach(bytes: &[u8]) -> (&[u8], bool) {
    match bytes.iter().position(|byte| *byte == DETACH_BYTE) {
        Some(index) => (&bytes[..index], true),
        None => (bytes, false),
    }
}

/// Connect the control connection and register with the persisted identity.
pub async fn connect_and_register(
    url: &url::Url,
    store: &StateStore,
    role: Role,
) -> anyhow::Result<(Arc<SignalingClient>, mpsc::UnboundedReceiver<ServerEnvelope>)> {
    let state = store.load_or_create(role)?;
    let (client, inbound) = SignalingClient::connect(url).await?;
    client.register(role, &state.device_id, state.token)?;
    tracing::debug!(target = "tether::session", role = %role, device = %state.device_id, "registered");
    Ok((Arc::new(client), inbound))
}

/// Handles the account-level events both roles share. Returns the event back
/// when the caller has to deal with it.
pub fn handle_account_event(
    event: SessionEvent,
    store: &StateStore,
    client: &SignalingClient,
    role: Role,
) -> anyhow::Result<Option<SessionEvent>> {
    match event {
        SessionEvent::LoginRequired(url) => {
            notice(format!("Sign in to continue: {url}"));
        }
        SessionEvent::Authenticated { token, user } => {
            store.store_token(role, &token)?;
            let who = user.email.or(user.name).unwrap_or(user.id);
            notice(format!("Signed in as {who}"));
        }
        SessionEvent::AuthRejected(message) => {
            notice(format!("Stored login rejected ({message}), continuing anonymously"));
            let state = store.clear_token(role)?;
            client.register(role, &state.device_id, None)?;
        }
        SessionEvent::Status(message) => notice(message),
        SessionEvent::TransportChanged(state) => {
            tracing::debug!(target = "tether::session", ?state, "transport state changed");
            if state == TransportState::Connected {
                notice("Direct connection established");
            }
        }
        other => return Ok(Some(other)),
    }
    Ok(None)
}
