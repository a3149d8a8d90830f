//! Wire envelopes exchanged between tether endpoints and the tether-road
//! signaling server. Kept in a dedicated crate so the server and both client
//! roles agree on one closed set of message kinds.
//!
//! Every frame is a JSON object tagged by `type`. Control kinds are only ever
//! exchanged with the server; peer kinds are forwarded unchanged between the
//! two members of a pairing and are also the frames carried on the direct
//! data channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Side of a pairing. Hosts own the shell and offer; viewers drive it and answer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Viewer,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Host => Role::Viewer,
            Role::Viewer => Role::Host,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Viewer => "viewer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a fresh stable device id. Clients persist the result.
pub fn generate_device_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Messages forwarded unchanged between paired endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerEnvelope {
    #[serde(rename = "webrtc:offer")]
    Offer { description: SessionDescription },
    #[serde(rename = "webrtc:answer")]
    Answer { description: SessionDescription },
    #[serde(rename = "webrtc:ice-candidate")]
    IceCandidate { candidate: IceCandidate },
    #[serde(rename = "terminal:input")]
    TerminalInput {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    #[serde(rename = "terminal:output")]
    TerminalOutput {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    #[serde(rename = "terminal:resize")]
    TerminalResize { cols: u16, rows: u16 },
    #[serde(rename = "terminal:dimensions")]
    TerminalDimensions { cols: u16, rows: u16 },
    #[serde(rename = "system:message")]
    SystemMessage {
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

impl PeerEnvelope {
    /// Wire name of this kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerEnvelope::Offer { .. } => "webrtc:offer",
            PeerEnvelope::Answer { .. } => "webrtc:answer",
            PeerEnvelope::IceCandidate { .. } => "webrtc:ice-candidate",
            PeerEnvelope::TerminalInput { .. } => "terminal:input",
            PeerEnvelope::TerminalOutput { .. } => "terminal:output",
            PeerEnvelope::TerminalResize { .. } => "terminal:resize",
            PeerEnvelope::TerminalDimensions { .. } => "terminal:dimensions",
            PeerEnvelope::SystemMessage { .. } => "system:message",
        }
    }

    /// Terminal byte traffic. Only these kinds move to the direct transport
    /// and only these are de-duplicated on the relay path.
    pub fn is_data_plane(&self) -> bool {
        matches!(
            self,
            PeerEnvelope::TerminalInput { .. } | PeerEnvelope::TerminalOutput { .. }
        )
    }

    /// Role allowed to originate this kind; `None` means either side.
    pub fn origin(&self) -> Option<Role> {
        match self {
            PeerEnvelope::Offer { .. } | PeerEnvelope::TerminalOutput { .. } => Some(Role::Host),
            PeerEnvelope::Answer { .. }
            | PeerEnvelope::TerminalInput { .. }
            | PeerEnvelope::TerminalResize { .. }
            | PeerEnvelope::TerminalDimensions { .. } => Some(Role::Viewer),
            PeerEnvelope::IceCandidate { .. } | PeerEnvelope::SystemMessage { .. } => None,
        }
    }

    pub fn system(kind: impl Into<String>) -> Self {
        PeerEnvelope::SystemMessage {
            kind: kind.into(),
            payload: None,
        }
    }
}

/// Control messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientControl {
    Register {
        role: Role,
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Pair {
        pairing_code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
}

/// Everything a client may put on the control connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientEnvelope {
    Control(ClientControl),
    Peer(PeerEnvelope),
}

impl From<ClientControl> for ClientEnvelope {
    fn from(control: ClientControl) -> Self {
        ClientEnvelope::Control(control)
    }
}

impl From<PeerEnvelope> for ClientEnvelope {
    fn from(envelope: PeerEnvelope) -> Self {
        ClientEnvelope::Peer(envelope)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Control messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerControl {
    Registered {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pairing_code: Option<String>,
        message: String,
    },
    LoginRequired {
        login_url: String,
    },
    AuthError {
        message: String,
    },
    Authenticated {
        token: String,
        user: UserProfile,
    },
    Paired {
        peer_id: String,
        message: String,
    },
    WaitingForPeer {
        message: String,
    },
    PairedDeviceDisconnected {
        message: String,
    },
    PairingCodeExpired {
        message: String,
        expired_code: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerEnvelope {
    Control(ServerControl),
    Peer(PeerEnvelope),
}

impl From<ServerControl> for ServerEnvelope {
    fn from(control: ServerControl) -> Self {
        ServerEnvelope::Control(control)
    }
}

impl From<PeerEnvelope> for ServerEnvelope {
    fn from(envelope: PeerEnvelope) -> Self {
        ServerEnvelope::Peer(envelope)
    }
}

impl ServerEnvelope {
    pub fn error(message: impl Into<String>) -> Self {
        ServerControl::Error {
            message: message.into(),
        }
        .into()
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub fn decode_client(text: &str) -> Result<ClientEnvelope, serde_json::Error> {
    serde_json::from_str(text)
}

pub fn decode_server(text: &str) -> Result<ServerEnvelope, serde_json::Error> {
    serde_json::from_str(text)
}

pub fn decode_peer(text: &str) -> Result<PeerEnvelope, serde_json::Error> {
    serde_json::from_str(text)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
