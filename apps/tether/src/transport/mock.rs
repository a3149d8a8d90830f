use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_proto::{IceCandidate, PeerEnvelope, Role, SdpKind, SessionDescription};
use tokio::sync::mpsc;

use super::negotiator::{PeerConnector, PeerEvent, PeerEventKind, RtcPeer};
use super::{DirectChannel, RelayLink, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

type CallLog = Arc<Mutex<Vec<(u64, Call)>>>;

pub struct MockPeer {
    generation: u64,
    calls: CallLog,
    gathering_hangs: bool,
    writable: AtomicBool,
    fail_send: AtomicBool,
    sent: Mutex<Vec<PeerEnvelope>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl MockPeer {
    pub fn emit(&self, kind: PeerEventKind) {
        let _ = self.events.send(PeerEvent {
            generation: self.generation,
            kind,
        });
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    pub fn fail_sends(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<PeerEnvelope> {
        self.sent.lock().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push((self.generation, call));
    }
}

impl DirectChannel for MockPeer {
    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    fn try_send(&self, envelope: &PeerEnvelope) -> Result<(), TransportError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.sent.lock().push(envelope.clone());
        Ok(())
    }
}

#[async_trait]
impl RtcPeer for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateOffer);
        Ok(SessionDescription::offer(format!("offer-{}", self.generation)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::answer(format!("answer-{}", self.generation)))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(Call::SetRemote(description.kind));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn gathering_complete(&self) {
        if self.gathering_hangs {
            std::future::pending::<()>().await;
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        None
    }

    async fn close(&self) {
        self.record(Call::Close);
        self.set_writable(false);
    }
}

#[derive(Default)]
struct ConnectorState {
    peers: Vec<Arc<MockPeer>>,
    gathering_hangs: bool,
    fail_connect: bool,
}

/// Connector handing out [`MockPeer`]s. Clones share state so a test can keep
/// a handle after giving one to a negotiator.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
    calls: CallLog,
}

impl MockConnector {
    pub fn hang_gathering(&self) {
        self.state.lock().gathering_hangs = true;
    }

    pub fn fail_connect(&self) {
        self.state.lock().fail_connect = true;
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.state.lock().peers.clone()
    }

    pub fn last_peer(&self) -> Option<Arc<MockPeer>> {
        self.state.lock().peers.last().cloned()
    }

    pub fn calls_of(&self, generation: u64) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|(g, _)| *g == generation)
            .map(|(_, call)| call.clone())
            .collect()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        _role: Role,
        generation: u64,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn RtcPeer>, TransportError> {
        let mut state = self.state.lock();
        if state.fail_connect {
            return Err(TransportError::Setup("mock connect refused".into()));
        }
        let peer = Arc::new(MockPeer {
            generation,
            calls: Arc::clone(&self.calls),
            gathering_hangs: state.gathering_hangs,
            writable: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            events,
        });
        state.peers.push(Arc::clone(&peer));
        Ok(peer)
    }
}

/// Relay link that records what it was given.
#[derive(Default)]
pub struct MockRelay {
    sent: Mutex<Vec<PeerEnvelope>>,
    closed: AtomicBool,
}

impl MockRelay {
    pub fn sent(&self) -> Vec<PeerEnvelope> {
        self.sent.lock().clone()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl RelayLink for MockRelay {
    fn send_peer(&self, envelope: PeerEnvelope) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.sent.lock().push(envelope);
        Ok(())
    }
}
