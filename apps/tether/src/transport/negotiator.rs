//! Offer/answer and candidate exchange for the direct transport.
//!
//! The host always offers and the viewer always answers. Each transport
//! object gets a generation number; events from any other generation are
//! stale and dropped. Remote candidates that arrive before the remote
//! description are queued and applied in arrival order right after it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tether_proto::{IceCandidate, PeerEnvelope, Role, SessionDescription};
use tokio::sync::mpsc;

use super::{DirectChannel, TransportError, TransportEvent, TransportState};

pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(2500);
pub const MIN_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(2000);
pub const MAX_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    ChannelOpen,
    ChannelClosed,
    Lost,
    Failed,
    Closed,
    Message(PeerEnvelope),
    /// Envelopes the channel accepted but could not deliver. The transport
    /// reports `Failed` right after.
    Undelivered(Vec<PeerEnvelope>),
}

/// Something a transport object reported, tagged with its generation.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// One direct transport object.
#[async_trait]
pub trait RtcPeer: DirectChannel {
    /// Create the local offer and apply it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    /// Create the local answer and apply it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    /// Resolves once local candidate gathering is complete.
    async fn gathering_complete(&self);
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        role: Role,
        generation: u64,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn RtcPeer>, TransportError>;
}

pub struct Negotiator<C> {
    connector: C,
    role: Role,
    discovery_timeout: Duration,
    generation: u64,
    peer: Option<Arc<dyn RtcPeer>>,
    state: TransportState,
    remote_description: Option<SessionDescription>,
    pending: VecDeque<IceCandidate>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
}

impl<C: PeerConnector> Negotiator<C> {
    /// Returns the negotiator and the stream of events its transport objects
    /// report.
    pub fn new(
        connector: C,
        role: Role,
        discovery_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let negotiator = Self {
            connector,
            role,
            discovery_timeout: discovery_timeout.clamp(MIN_DISCOVERY_TIMEOUT, MAX_DISCOVERY_TIMEOUT),
            generation: 0,
            peer: None,
            state: TransportState::Idle,
            remote_description: None,
            pending: VecDeque::new(),
            events_tx,
        };
        (negotiator, events_rx)
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description.is_some()
    }

    pub fn direct(&self) -> Option<Arc<dyn RtcPeer>> {
        self.peer.clone()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.peer.is_some() && generation == self.generation
    }

    /// Host side: replace any transport object with a fresh one and produce
    /// the offer to relay.
    pub async fn start_offer(&mut self) -> Result<PeerEnvelope, TransportError> {
        if self.role != Role::Host {
            return Err(TransportError::WrongRole("offer", self.role));
        }
        let result = self.offer_inner().await;
        if let Err(err) = &result {
            tracing::warn!(target = "tether::negotiator", error = %err, "offer failed");
            self.teardown().await;
        }
        result
    }

    async fn offer_inner(&mut self) -> Result<PeerEnvelope, TransportError> {
        let peer = self.fresh_peer().await?;
        let offer = peer.create_offer().await?;
        self.await_discovery(&peer).await;
        let description = peer.local_description().await.unwrap_or(offer);
        tracing::debug!(
            target = "tether::negotiator",
            generation = self.generation,
            "offer ready"
        );
        Ok(PeerEnvelope::Offer { description })
    }

    /// Viewer side: any offer discards the current transport object and its
    /// queue, stale or not.
    pub async fn handle_offer(
        &mut self,
        description: SessionDescription,
    ) -> Result<PeerEnvelope, TransportError> {
        if self.role != Role::Viewer {
            return Err(TransportError::WrongRole("answer", self.role));
        }
        let result = self.answer_inner(description).await;
        if let Err(err) = &result {
            tracing::warn!(target = "tether::negotiator", error = %err, "answer failed");
            self.teardown().await;
        }
        result
    }

    async fn answer_inner(
        &mut self,
        description: SessionDescription,
    ) -> Result<PeerEnvelope, TransportError> {
        let peer = self.fresh_peer().await?;
        peer.set_remote_description(description.clone()).await?;
        self.remote_description = Some(description);
        self.drain_pending(&peer).await;

        let answer = peer.create_answer().await?;
        self.await_discovery(&peer).await;
        let description = peer.local_description().await.unwrap_or(answer);
        self.transition(TransportEvent::DescriptionsApplied);
        Ok(PeerEnvelope::Answer { description })
    }

    pub async fn handle_answer(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let Some(peer) = self.peer.clone() else {
            tracing::debug!(target = "tether::negotiator", "answer without transport, dropping");
            return Ok(());
        };
        if self.role != Role::Host {
            return Err(TransportError::WrongRole("answer", self.role));
        }
        if self.remote_description.is_some() {
            tracing::debug!(target = "tether::negotiator", "duplicate answer ignored");
            return Ok(());
        }
        if let Err(err) = peer.set_remote_description(description.clone()).await {
            tracing::warn!(target = "tether::negotiator", error = %err, "applying answer failed");
            self.teardown().await;
            return Err(err);
        }
        self.remote_description = Some(description);
        self.transition(TransportEvent::DescriptionsApplied);
        self.drain_pending(&peer).await;
        Ok(())
    }

    pub async fn handle_candidate(&mut self, candidate: IceCandidate) {
        let Some(peer) = self.peer.clone() else {
            tracing::debug!(target = "tether::negotiator", "candidate without transport, dropping");
            return;
        };
        if self.remote_description.is_none() {
            self.pending.push_back(candidate);
            tracing::trace!(
                target = "tether::negotiator",
                queued = self.pending.len(),
                "queued remote candidate"
            );
            return;
        }
        apply_candidate(&peer, candidate).await;
    }

    /// Feed a transport event through the state machine. Returns a signal to
    /// relay to the partner, if the event produced one.
    pub fn handle_peer_event(&mut self, event: PeerEvent) -> Option<PeerEnvelope> {
        if !self.is_current(event.generation) {
            tracing::trace!(
                target = "tether::negotiator",
                generation = event.generation,
                current = self.generation,
                "dropping stale transport event"
            );
            return None;
        }
        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                Some(PeerEnvelope::IceCandidate { candidate })
            }
            PeerEventKind::ChannelOpen => {
                if self.transition(TransportEvent::ChannelOpen) {
                    tracing::info!(
                        target = "tether::negotiator",
                        generation = self.generation,
                        "direct transport connected"
                    );
                }
                None
            }
            PeerEventKind::Lost => {
                self.transition(TransportEvent::Lost);
                None
            }
            PeerEventKind::Failed => {
                self.transition(TransportEvent::Failed);
                None
            }
            PeerEventKind::ChannelClosed | PeerEventKind::Closed => {
                self.transition(TransportEvent::Closed);
                None
            }
            PeerEventKind::Message(_) | PeerEventKind::Undelivered(_) => None,
        }
    }

    /// Close the transport object and forget everything about it.
    pub async fn teardown(&mut self) {
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
        self.remote_description = None;
        self.pending.clear();
        if self.state != TransportState::Idle {
            self.transition(TransportEvent::Reset);
        }
    }

    async fn fresh_peer(&mut self) -> Result<Arc<dyn RtcPeer>, TransportError> {
        self.teardown().await;
        self.generation += 1;
        let peer = self
            .connector
            .connect(self.role, self.generation, self.events_tx.clone())
            .await?;
        self.peer = Some(Arc::clone(&peer));
        self.transition(TransportEvent::Start);
        Ok(peer)
    }

    async fn await_discovery(&self, peer: &Arc<dyn RtcPeer>) {
        if tokio::time::timeout(self.discovery_timeout, peer.gathering_complete())
            .await
            .is_err()
        {
            tracing::debug!(
                target = "tether::negotiator",
                timeout_ms = self.discovery_timeout.as_millis() as u64,
                "candidate discovery timed out"
            );
        }
    }

    async fn drain_pending(&mut self, peer: &Arc<dyn RtcPeer>) {
        while let Some(candidate) = self.pending.pop_front() {
            apply_candidate(peer, candidate).await;
        }
    }

    fn transition(&mut self, event: TransportEvent) -> bool {
        match self.state.next(event) {
            Some(next) => {
                tracing::debug!(
                    target = "tether::negotiator",
                    from = ?self.state,
                    to = ?next,
                    "transport state"
                );
                self.state = next;
                true
            }
            None => {
                tracing::debug!(
                    target = "tether::negotiator",
                    state = ?self.state,
                    event = ?event,
                    "ignoring invalid transition"
                );
                false
            }
        }
    }
}

async fn apply_candidate(peer: &Arc<dyn RtcPeer>, candidate: IceCandidate) {
    if let Err(err) = peer.add_ice_candidate(candidate).await {
        tracing::warn!(target = "tether::negotiator", error = %err, "failed to add remote candidate");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{Call, MockConnector};
    use tether_proto::SdpKind;

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000{n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    fn host(connector: &MockConnector) -> (Negotiator<MockConnector>, mpsc::UnboundedReceiver<PeerEvent>) {
        Negotiator::new(connector.clone(), Role::Host, DEFAULT_DISCOVERY_TIMEOUT)
    }

    fn viewer(connector: &MockConnector) -> (Negotiator<MockConnector>, mpsc::UnboundedReceiver<PeerEvent>) {
        Negotiator::new(connector.clone(), Role::Viewer, DEFAULT_DISCOVERY_TIMEOUT)
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_waits_for_discovery_then_emits() {
        tokio::time::pause();
        let connector = MockConnector::default();
        connector.hang_gathering();
        let (mut negotiator, _events) = host(&connector);

        let started = tokio::time::Instant::now();
        let offer = negotiator.start_offer().await.expect("offer");
        assert!(started.elapsed() >= DEFAULT_DISCOVERY_TIMEOUT);
        assert!(matches!(
            offer,
            PeerEnvelope::Offer { ref description } if description.kind == SdpKind::Offer
        ));
        assert_eq!(negotiator.state(), TransportState::Negotiating);
        assert_eq!(negotiator.generation(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn early_candidates_apply_in_order_after_answer() {
        let connector = MockConnector::default();
        let (mut negotiator, _events) = host(&connector);
        negotiator.start_offer().await.expect("offer");

        for n in 1..=5 {
            negotiator.handle_candidate(candidate(n)).await;
        }
        assert_eq!(negotiator.pending_candidates(), 5);
        assert!(connector.calls_of(1).iter().all(|c| !matches!(c, Call::AddCandidate(_))));

        negotiator
            .handle_answer(SessionDescription::answer("remote"))
            .await
            .expect("answer");
        assert_eq!(negotiator.pending_candidates(), 0);
        assert_eq!(negotiator.state(), TransportState::Connecting);

        let applied: Vec<String> = connector
            .calls_of(1)
            .into_iter()
            .filter_map(|call| match call {
                Call::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect();
        let expected: Vec<String> = (1..=5).map(|n| candidate(n).candidate).collect();
        assert_eq!(applied, expected);

        // Later candidates apply immediately.
        negotiator.handle_candidate(candidate(6)).await;
        assert_eq!(negotiator.pending_candidates(), 0);
        assert_eq!(
            connector.calls_of(1).last(),
            Some(&Call::AddCandidate(candidate(6).candidate))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn new_offer_while_connecting_discards_previous_transport() {
        let connector = MockConnector::default();
        let (mut negotiator, _events) = viewer(&connector);

        negotiator
            .handle_offer(SessionDescription::offer("first"))
            .await
            .expect("first answer");
        assert_eq!(negotiator.state(), TransportState::Connecting);
        assert_eq!(negotiator.generation(), 1);

        let answer = negotiator
            .handle_offer(SessionDescription::offer("second"))
            .await
            .expect("second answer");
        assert!(matches!(answer, PeerEnvelope::Answer { .. }));
        assert_eq!(negotiator.generation(), 2);
        assert_eq!(negotiator.pending_candidates(), 0);
        assert_eq!(negotiator.state(), TransportState::Connecting);
        assert!(connector.calls_of(1).contains(&Call::Close));
        assert!(!connector.calls_of(2).contains(&Call::Close));

        // The first transport object's events no longer count.
        let stale = PeerEvent {
            generation: 1,
            kind: PeerEventKind::ChannelOpen,
        };
        assert_eq!(negotiator.handle_peer_event(stale), None);
        assert_eq!(negotiator.state(), TransportState::Connecting);
    }

    #[test_timeout::tokio_timeout_test]
    async fn signals_without_transport_are_dropped() {
        let connector = MockConnector::default();
        let (mut negotiator, _events) = host(&connector);

        negotiator.handle_candidate(candidate(1)).await;
        negotiator
            .handle_answer(SessionDescription::answer("nobody asked"))
            .await
            .expect("dropped quietly");
        assert_eq!(negotiator.pending_candidates(), 0);
        assert_eq!(negotiator.state(), TransportState::Idle);
        assert!(connector.peers().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn duplicate_answer_is_ignored() {
        let connector = MockConnector::default();
        let (mut negotiator, _events) = host(&connector);
        negotiator.start_offer().await.expect("offer");
        negotiator
            .handle_answer(SessionDescription::answer("one"))
            .await
            .expect("answer");
        negotiator
            .handle_answer(SessionDescription::answer("two"))
            .await
            .expect("duplicate");
        let remote_sets = connector
            .calls_of(1)
            .into_iter()
            .filter(|call| matches!(call, Call::SetRemote(_)))
            .count();
        assert_eq!(remote_sets, 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn local_candidates_and_channel_open_drive_state() {
        let connector = MockConnector::default();
        let (mut negotiator, mut events) = host(&connector);
        negotiator.start_offer().await.expect("offer");
        negotiator
            .handle_answer(SessionDescription::answer("remote"))
            .await
            .expect("answer");

        let peer = connector.last_peer().expect("peer");
        peer.emit(PeerEventKind::LocalCandidate(candidate(3)));
        peer.emit(PeerEventKind::ChannelOpen);

        let first = events.recv().await.expect("event");
        assert_eq!(
            negotiator.handle_peer_event(first),
            Some(PeerEnvelope::IceCandidate {
                candidate: candidate(3)
            })
        );
        let second = events.recv().await.expect("event");
        assert_eq!(negotiator.handle_peer_event(second), None);
        assert_eq!(negotiator.state(), TransportState::Connected);

        peer.emit(PeerEventKind::Failed);
        let third = events.recv().await.expect("event");
        negotiator.handle_peer_event(third);
        assert_eq!(negotiator.state(), TransportState::Failed);

        negotiator.teardown().await;
        assert_eq!(negotiator.state(), TransportState::Idle);
        assert!(negotiator.direct().is_none());
        assert!(!negotiator.has_remote_description());
    }

    #[test_timeout::tokio_timeout_test]
    async fn roles_are_fixed() {
        let connector = MockConnector::default();
        let (mut as_viewer, _a) = viewer(&connector);
        assert!(matches!(
            as_viewer.start_offer().await,
            Err(TransportError::WrongRole(_, Role::Viewer))
        ));
        let (mut as_host, _b) = host(&connector);
        assert!(as_host
            .handle_offer(SessionDescription::offer("x"))
            .await
            .is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_connect_leaves_negotiator_idle() {
        let connector = MockConnector::default();
        connector.fail_connect();
        let (mut negotiator, _events) = host(&connector);
        assert!(negotiator.start_offer().await.is_err());
        assert_eq!(negotiator.state(), TransportState::Idle);
        assert!(negotiator.direct().is_none());
    }

    #[test_timeout::timeout]
    fn discovery_timeout_is_clamped() {
        let connector = MockConnector::default();
        let (short, _a) = Negotiator::new(connector.clone(), Role::Host, Duration::from_millis(10));
        let (long, _b) = Negotiator::new(connector, Role::Host, Duration::from_secs(60));
        assert_eq!(short.discovery_timeout, MIN_DISCOVERY_TIMEOUT);
        assert_eq!(long.discovery_timeout, MAX_DISCOVERY_TIMEOUT);
    }
}
