use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tether_proto::{decode_client, encode, ClientControl, ClientEnvelope, ServerEnvelope};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::AuthService;
use crate::metrics;
use crate::registry::{
    ConnectionId, Credential, Delivery, DeviceCounts, RegistryOptions, SessionRegistry,
};
use crate::router;

/// Shared server state: the registry behind one lock and the outbound queue
/// of every open connection.
#[derive(Clone)]
pub struct SignalingState {
    registry: Arc<Mutex<SessionRegistry>>,
    connections: Arc<DashMap<ConnectionId, mpsc::UnboundedSender<ServerEnvelope>>>,
    next_connection: Arc<AtomicU64>,
    pub auth: Arc<AuthService>,
}

/// What one socket knows about itself.
struct ConnectionContext {
    id: ConnectionId,
    device_id: Option<String>,
}

impl SignalingState {
    pub fn new(options: RegistryOptions, auth: AuthService) -> Self {
        Self {
            registry: Arc::new(Mutex::new(SessionRegistry::new(options))),
            connections: Arc::new(DashMap::new()),
            next_connection: Arc::new(AtomicU64::new(1)),
            auth: Arc::new(auth),
        }
    }

    pub fn device_counts(&self) -> DeviceCounts {
        self.registry.lock().device_counts()
    }

    /// Hand each delivery to its connection's writer. Missing or closed
    /// connections lose the message.
    pub fn dispatch(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            match self.connections.get(&delivery.connection) {
                Some(tx) => {
                    if tx.send(delivery.envelope).is_err() {
                        debug!(connection = delivery.connection, "writer closed, dropping");
                        metrics::DROPPED.with_label_values(&["closed"]).inc();
                    }
                }
                None => {
                    debug!(connection = delivery.connection, "no such connection, dropping");
                    metrics::DROPPED.with_label_values(&["missing"]).inc();
                }
            }
        }
    }

    /// Push a message to whichever connection currently owns `device_id`.
    pub fn push_to_device(&self, device_id: &str, envelope: ServerEnvelope) -> bool {
        let connection = self
            .registry
            .lock()
            .endpoint(device_id)
            .map(|endpoint| endpoint.connection);
        match connection {
            Some(connection) => {
                self.dispatch(vec![Delivery {
                    connection,
                    envelope,
                }]);
                true
            }
            None => false,
        }
    }

    pub fn attach_identity(&self, device_id: &str, identity: &str) {
        let deliveries = self.registry.lock().attach_identity(device_id, identity);
        self.dispatch(deliveries);
    }

    pub fn spawn_code_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let deliveries = state.registry.lock().expire_codes(Instant::now());
                if !deliveries.is_empty() {
                    debug!(count = deliveries.len(), "expired pairing codes");
                }
                state.dispatch(deliveries);
            }
        })
    }

    fn open(&self) -> (ConnectionContext, mpsc::UnboundedReceiver<ServerEnvelope>) {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(id, tx);
        metrics::CONNECTIONS.inc();
        (
            ConnectionContext {
                id,
                device_id: None,
            },
            rx,
        )
    }

    fn close(&self, ctx: &ConnectionContext) {
        self.connections.remove(&ctx.id);
        metrics::CONNECTIONS.dec();
        if let Some(device_id) = &ctx.device_id {
            let deliveries = self.registry.lock().unregister(device_id, ctx.id);
            self.dispatch(deliveries);
        }
    }

    fn reply(&self, ctx: &ConnectionContext, envelope: ServerEnvelope) {
        self.dispatch(vec![Delivery {
            connection: ctx.id,
            envelope,
        }]);
    }

    fn handle_envelope(&self, ctx: &mut ConnectionContext, envelope: ClientEnvelope) {
        match envelope {
            ClientEnvelope::Control(ClientControl::Register {
                role,
                device_id,
                token,
            }) => {
                let credential = match token {
                    None => Credential::Absent,
                    Some(token) => match self.auth.tokens.verify(&token) {
                        Ok(claims) => Credential::Valid(claims.sub),
                        Err(err) => Credential::Invalid(err.to_string()),
                    },
                };
                debug!(connection = ctx.id, device = %device_id, %role, "register");

                let deliveries = {
                    let mut registry = self.registry.lock();
                    let mut deliveries = Vec::new();
                    if let Some(previous) = ctx.device_id.as_deref() {
                        if previous != device_id {
                            deliveries.extend(registry.unregister(previous, ctx.id));
                        }
                    }
                    deliveries.extend(registry.register(
                        ctx.id,
                        &device_id,
                        role,
                        credential,
                        Instant::now(),
                    ));
                    deliveries
                };
                ctx.device_id = Some(device_id);
                self.dispatch(deliveries);
            }
            ClientEnvelope::Control(ClientControl::Pair {
                pairing_code,
                cols,
                rows,
            }) => {
                let Some(device_id) = ctx.device_id.as_deref() else {
                    self.reply(ctx, ServerEnvelope::error("Register before pairing"));
                    return;
                };
                let dimensions = cols.zip(rows);
                let result = self.registry.lock().redeem(
                    device_id,
                    pairing_code.trim(),
                    dimensions,
                    Instant::now(),
                );
                match result {
                    Ok(deliveries) => self.dispatch(deliveries),
                    Err(err) => {
                        debug!(device = %device_id, error = %err, "pair rejected");
                        self.reply(ctx, ServerEnvelope::error(err.to_string()));
                    }
                }
            }
            ClientEnvelope::Peer(envelope) => {
                let Some(device_id) = ctx.device_id.as_deref() else {
                    debug!(connection = ctx.id, kind = envelope.kind(), "peer message before register");
                    return;
                };
                let delivery = router::route(&self.registry.lock(), device_id, ctx.id, envelope);
                self.dispatch(delivery.into_iter().collect());
            }
        }
    }
}

pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<SignalingState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: SignalingState, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (mut ctx, mut rx) = state.open();
    let connection = ctx.id;
    info!(connection, %remote_addr, "websocket connected");

    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let json = match encode(&envelope) {
                Ok(json) => json,
                Err(err) => {
                    warn!(connection, error = %err, "failed to encode envelope");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        debug!(connection, "writer task ended");
    });

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(connection, error = %err, "websocket error");
                break;
            }
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!(connection, "ignoring non-utf8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        match decode_client(&text) {
            Ok(envelope) => state.handle_envelope(&mut ctx, envelope),
            Err(err) => {
                debug!(connection, error = %err, "malformed frame");
                state.reply(&ctx, ServerEnvelope::error("Invalid message format"));
            }
        }
    }

    state.close(&ctx);
    writer.abort();
    info!(connection, device = ?ctx.device_id, "websocket disconnected");
}
