//! Chooses between the direct channel and the relay for each outbound
//! envelope, and filters duplicated data-plane traffic on the way in.
//!
//! Only terminal bytes ever take the direct channel. Control kinds always go
//! through the relay so the partner sees them in order with the signaling
//! that surrounds them.

use tether_proto::PeerEnvelope;

use super::{DirectChannel, RelayLink, TransportError, TransportState};

/// `system:message` kind telling the partner our direct channel is gone, so
/// it stops discarding relayed terminal bytes.
pub const DIRECT_CLOSED: &str = "direct_closed";

/// Where an outbound envelope went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Relay,
    /// The direct write failed. The partner was sent [`DIRECT_CLOSED`] and
    /// then the envelope, once, via the relay.
    RelayFallback,
}

/// Where an inbound envelope came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Path {
    Direct,
    Relay,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiplexerStats {
    pub direct: u64,
    pub relayed: u64,
    pub fallbacks: u64,
    pub dropped_duplicates: u64,
}

#[derive(Debug, Default)]
pub struct Multiplexer {
    stats: MultiplexerStats,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MultiplexerStats {
        self.stats
    }

    pub fn send<D, R>(
        &mut self,
        state: TransportState,
        direct: Option<&D>,
        relay: &R,
        envelope: PeerEnvelope,
    ) -> Result<Route, TransportError>
    where
        D: DirectChannel + ?Sized,
        R: RelayLink + ?Sized,
    {
        if state == TransportState::Connected && envelope.is_data_plane() {
            if let Some(channel) = direct.filter(|channel| channel.is_writable()) {
                match channel.try_send(&envelope) {
                    Ok(()) => {
                        self.stats.direct += 1;
                        return Ok(Route::Direct);
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "tether::multiplexer",
                            kind = envelope.kind(),
                            error = %err,
                            "direct send failed, falling back to relay"
                        );
                        relay.send_peer(PeerEnvelope::system(DIRECT_CLOSED))?;
                        relay.send_peer(envelope)?;
                        self.stats.fallbacks += 1;
                        return Ok(Route::RelayFallback);
                    }
                }
            }
        }
        relay.send_peer(envelope)?;
        self.stats.relayed += 1;
        Ok(Route::Relay)
    }

    /// Whether an inbound envelope should be processed. Relayed data-plane
    /// traffic is a duplicate once the direct channel is up.
    pub fn accept(&mut self, state: TransportState, path: Path, envelope: &PeerEnvelope) -> bool {
        if path == Path::Relay && state == TransportState::Connected && envelope.is_data_plane() {
            self.stats.dropped_duplicates += 1;
            tracing::trace!(
                target = "tether::multiplexer",
                kind = envelope.kind(),
                "dropping relayed duplicate"
            );
            return false;
        }
        true
    }
}
