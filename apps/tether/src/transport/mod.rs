//! Direct transport negotiation and the relay/direct multiplexer.

pub mod multiplexer;
pub mod negotiator;
pub mod webrtc;

#[cfg(test)]
pub(crate) mod mock;

use tether_proto::PeerEnvelope;
use thiserror::Error;

pub use multiplexer::{DIRECT_CLOSED, Multiplexer, Path, Route};
pub use negotiator::{Negotiator, PeerConnector, PeerEvent, PeerEventKind, RtcPeer};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("direct channel is not writable")]
    NotWritable,
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("{0} is not valid for the {1} role")]
    WrongRole(&'static str, tether_proto::Role),
    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Lifecycle of one direct transport object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Idle,
    Negotiating,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Start,
    DescriptionsApplied,
    ChannelOpen,
    Lost,
    Failed,
    Closed,
    Reset,
}

impl TransportState {
    /// Transition table. `None` means the event is not valid in this state.
    pub fn next(self, event: TransportEvent) -> Option<TransportState> {
        use TransportEvent as E;
        use TransportState as S;
        match (self, event) {
            (_, E::Reset) => Some(S::Idle),
            (S::Idle, E::Start) => Some(S::Negotiating),
            (S::Negotiating, E::DescriptionsApplied) => Some(S::Connecting),
            (S::Connecting, E::ChannelOpen) => Some(S::Connected),
            (S::Connected, E::Lost) => Some(S::Disconnected),
            (S::Negotiating | S::Connecting | S::Connected | S::Disconnected, E::Failed) => {
                Some(S::Failed)
            }
            (S::Negotiating | S::Connecting | S::Connected | S::Disconnected, E::Closed) => {
                Some(S::Closed)
            }
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }
}

/// A direct channel to the partner. `try_send` must not block: it either
/// queues the envelope or fails right away.
pub trait DirectChannel: Send + Sync {
    fn is_writable(&self) -> bool;
    fn try_send(&self, envelope: &PeerEnvelope) -> Result<(), TransportError>;
}

/// The relayed path through the signaling server.
pub trait RelayLink: Send + Sync {
    fn send_peer(&self, envelope: PeerEnvelope) -> Result<(), TransportError>;
}
