//! Control connection to the relay server.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tether_proto::{ClientControl, ClientEnvelope, PeerEnvelope, Role, ServerEnvelope};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use url::Url;

use crate::transport::{RelayLink, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("websocket connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("control connection closed")]
    Closed,
    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct SignalingClient {
    send_tx: mpsc::UnboundedSender<ClientEnvelope>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connect and start the reader/writer tasks. The returned receiver
    /// yields every server envelope and ends when the socket closes.
    pub async fn connect(
        url: &Url,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEnvelope>), SignalingError> {
        let connect_error = |reason: String| SignalingError::Connect {
            url: url.to_string(),
            reason,
        };
        let (ws_stream, _) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| connect_error("timed out".into()))?
            .map_err(|err| connect_error(err.to_string()))?;
        tracing::debug!(target = "tether::signaling", url = %url, "control connection open");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientEnvelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerEnvelope>();

        let writer = tokio::spawn(async move {
            while let Some(envelope) = send_rx.recv().await {
                let text = match tether_proto::encode(&envelope) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target = "tether::signaling", error = %err, "failed to encode envelope");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "tether::signaling", "control connection closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "tether::signaling", "control connection error: {err}");
                            }
                        }
                        break;
                    }
                };
                match tether_proto::decode_server(&text) {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(target = "tether::signaling", error = %err, len = text.len(), "ignoring undecodable frame");
                    }
                }
            }
        });

        let client = SignalingClient {
            send_tx,
            tasks: Mutex::new(vec![writer, reader]),
        };
        Ok((client, inbound_rx))
    }

    pub fn send(&self, envelope: impl Into<ClientEnvelope>) -> Result<(), SignalingError> {
        self.send_tx
            .send(envelope.into())
            .map_err(|_| SignalingError::Closed)
    }

    pub fn register(
        &self,
        role: Role,
        device_id: &str,
        token: Option<String>,
    ) -> Result<(), SignalingError> {
        self.send(ClientControl::Register {
            role,
            device_id: device_id.to_string(),
            token,
        })
    }

    pub fn pair(&self, code: &str, dimensions: Option<(u16, u16)>) -> Result<(), SignalingError> {
        self.send(ClientControl::Pair {
            pairing_code: code.trim().to_string(),
            cols: dimensions.map(|(cols, _)| cols),
            rows: dimensions.map(|(_, rows)| rows),
        })
    }
}

impl RelayLink for SignalingClient {
    fn send_peer(&self, envelope: PeerEnvelope) -> Result<(), TransportError> {
        self.send_tx
            .send(envelope.into())
            .map_err(|_| TransportError::ChannelClosed)
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
