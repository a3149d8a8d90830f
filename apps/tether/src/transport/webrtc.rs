//! Production transport objects backed by the `webrtc` crate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_proto::{IceCandidate, PeerEnvelope, Role, SdpKind, SessionDescription};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::negotiator::{PeerConnector, PeerEvent, PeerEventKind, RtcPeer};
use super::{DirectChannel, TransportError};

pub const CHANNEL_LABEL: &str = "terminal";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(Duration::from_secs(3)),
        Some(Duration::from_secs(10)),
        Some(Duration::from_millis(500)),
    );

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

/// Creates one peer connection per negotiation generation.
#[derive(Debug, Clone, Default)]
pub struct WebRtcConnector {
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    /// An empty list gathers host candidates only.
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        role: Role,
        generation: u64,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn RtcPeer>, TransportError> {
        let api = build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(self.configuration())
                .await
                .map_err(to_setup_error)?,
        );
        tracing::debug!(target = "tether::webrtc", generation, role = %role, "peer connection created");

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent {
                            generation,
                            kind: PeerEventKind::LocalCandidate(from_init(init)),
                        });
                    }
                    Err(err) => {
                        tracing::warn!(target = "tether::webrtc", error = %err, "failed to serialise local candidate");
                    }
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(target = "tether::webrtc", generation, ?state, "peer connection state changed");
                let kind = match state {
                    RTCPeerConnectionState::Disconnected => PeerEventKind::Lost,
                    RTCPeerConnectionState::Failed => PeerEventKind::Failed,
                    RTCPeerConnectionState::Closed => PeerEventKind::Closed,
                    _ => return,
                };
                let _ = events.send(PeerEvent { generation, kind });
            })
        }));

        let slot = Arc::new(ChannelSlot::default());
        match role {
            Role::Host => {
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(CHANNEL_LABEL, Some(init))
                    .await
                    .map_err(to_setup_error)?;
                wire_channel(dc, &slot, generation, &events);
            }
            Role::Viewer => {
                let slot_for_remote = Arc::clone(&slot);
                let remote_events = events.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = Arc::clone(&slot_for_remote);
                    let events = remote_events.clone();
                    Box::pin(async move {
                        if dc.label() != CHANNEL_LABEL {
                            tracing::debug!(target = "tether::webrtc", label = dc.label(), "ignoring unexpected data channel");
                            return;
                        }
                        wire_channel(dc, &slot, generation, &events);
                    })
                }));
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(
            Arc::clone(&slot),
            outbound_rx,
            generation,
            events.clone(),
        ));

        Ok(Arc::new(WebRtcPeer {
            generation,
            pc,
            slot,
            outbound_tx,
            writer,
            gathering: AsyncMutex::new(None),
        }))
    }
}

#[derive(Default)]
struct ChannelSlot {
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
    open: AtomicBool,
}

impl ChannelSlot {
    fn current(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.lock().clone()
    }
}

fn wire_channel(
    dc: Arc<RTCDataChannel>,
    slot: &Arc<ChannelSlot>,
    generation: u64,
    events: &mpsc::UnboundedSender<PeerEvent>,
) {
    *slot.channel.lock() = Some(Arc::clone(&dc));

    let open_slot = Arc::clone(slot);
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            tracing::debug!(target = "tether::webrtc", generation, "data channel open");
            open_slot.open.store(true, Ordering::SeqCst);
            let _ = open_events.send(PeerEvent {
                generation,
                kind: PeerEventKind::ChannelOpen,
            });
        })
    }));

    let close_slot = Arc::clone(slot);
    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let slot = Arc::clone(&close_slot);
        let events = close_events.clone();
        Box::pin(async move {
            tracing::debug!(target = "tether::webrtc", generation, "data channel closed");
            slot.open.store(false, Ordering::SeqCst);
            let _ = events.send(PeerEvent {
                generation,
                kind: PeerEventKind::ChannelClosed,
            });
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            let decoded = std::str::from_utf8(&msg.data)
                .ok()
                .and_then(|text| tether_proto::decode_peer(text).ok());
            match decoded {
                Some(envelope) => {
                    let _ = events.send(PeerEvent {
                        generation,
                        kind: PeerEventKind::Message(envelope),
                    });
                }
                None => {
                    tracing::warn!(
                        target = "tether::webrtc",
                        generation,
                        frame_len = msg.data.len(),
                        "failed to decode data channel frame"
                    );
                }
            }
        })
    }));
}

/// A queued frame keeps its envelope so it can be handed back if the write
/// fails.
type Outbound = (PeerEnvelope, String);

async fn run_writer(
    slot: Arc<ChannelSlot>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    generation: u64,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    while let Some((envelope, text)) = outbound_rx.recv().await {
        let Some(dc) = slot.current() else {
            tracing::debug!(target = "tether::webrtc", generation, "no data channel, dropping frame");
            continue;
        };
        match timeout(SEND_TIMEOUT, dc.send_text(text)).await {
            Ok(Ok(written)) => {
                tracing::trace!(target = "tether::webrtc", generation, written, "sent frame");
                continue;
            }
            Ok(Err(err)) => {
                tracing::warn!(target = "tether::webrtc", generation, error = %err, "data channel send failed");
            }
            Err(_) => {
                tracing::warn!(target = "tether::webrtc", generation, "data channel send timed out");
            }
        }
        slot.open.store(false, Ordering::SeqCst);
        let undelivered = drain_undelivered(envelope, &mut outbound_rx);
        let _ = events.send(PeerEvent {
            generation,
            kind: PeerEventKind::Undelivered(undelivered),
        });
        let _ = events.send(PeerEvent {
            generation,
            kind: PeerEventKind::Failed,
        });
        break;
    }
    tracing::trace!(target = "tether::webrtc", generation, "writer loop ended");
}

/// The failed envelope followed by everything still queued behind it.
fn drain_undelivered(
    failed: PeerEnvelope,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Vec<PeerEnvelope> {
    let mut undelivered = vec![failed];
    outbound_rx.close();
    while let Ok((envelope, _)) = outbound_rx.try_recv() {
        undelivered.push(envelope);
    }
    undelivered
}

pub struct WebRtcPeer {
    generation: u64,
    pc: Arc<RTCPeerConnection>,
    slot: Arc<ChannelSlot>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    writer: JoinHandle<()>,
    gathering: AsyncMutex<Option<mpsc::Receiver<()>>>,
}

impl WebRtcPeer {
    async fn apply_local(&self, description: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
        // The promise must exist before gathering starts.
        let gather = self.pc.gathering_complete_promise().await;
        *self.gathering.lock().await = Some(gather);
        let local = from_rtc(&description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_setup_error)?;
        Ok(local)
    }
}

impl DirectChannel for WebRtcPeer {
    fn is_writable(&self) -> bool {
        self.slot.open.load(Ordering::SeqCst)
            && self
                .slot
                .current()
                .is_some_and(|dc| dc.ready_state() == RTCDataChannelState::Open)
    }

    fn try_send(&self, envelope: &PeerEnvelope) -> Result<(), TransportError> {
        if !self.is_writable() {
            return Err(TransportError::NotWritable);
        }
        let text = tether_proto::encode(envelope)?;
        self.outbound_tx
            .send((envelope.clone(), text))
            .map_err(|_| TransportError::ChannelClosed)
    }
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        self.apply_local(offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
        self.apply_local(answer).await
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let remote = to_rtc(description)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(to_setup_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(to_setup_error)
    }

    async fn gathering_complete(&self) {
        let gather = self.gathering.lock().await.take();
        if let Some(mut gather) = gather {
            let _ = gather.recv().await;
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.pc.local_description().await?;
        from_rtc(&description).ok()
    }

    async fn close(&self) {
        self.slot.open.store(false, Ordering::SeqCst);
        self.writer.abort();
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "tether::webrtc", generation = self.generation, error = %err, "peer connection close failed");
        }
    }
}

impl Drop for WebRtcPeer {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(to_setup_error)
}

fn from_rtc(description: &RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp.clone())),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp.clone())),
        other => Err(TransportError::Setup(format!(
            "unsupported description type {other}"
        ))),
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
    }
}
