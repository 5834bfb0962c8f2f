//! The WebRTC Peer Engine: builds one peer connection, negotiates SDP, and
//! wires RTP between that connection and a [`RelayTrack`].
//!
//! Both ingest and fan-out peers share the same codec registration and the
//! same small lifecycle state machine; they differ only in which direction
//! RTP flows and in whether ICE gathering is awaited before the answer is
//! returned (ingest: non-trickle; fan-out: trickle).

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::relay_track::RelayTrack;

/// Bounded wait applied to every negotiation step (offer ingestion, answer
/// readiness, ICE completion on the ingest side). See the design notes on
/// the suggested value.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

const VIDEO_MIME_TYPE: &str = webrtc::api::media_engine::MIME_TYPE_H264;
const VIDEO_PAYLOAD_TYPE: u8 = 102;
const VIDEO_FMTP: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

#[derive(Debug, Clone)]
pub struct IceServerConfig {
    pub url: String,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerEngineError {
    #[error("failed to parse remote description: {0}")]
    SignalingError(String),
    #[error("negotiation failed: {0}")]
    NegotiationError(String),
    #[error("failed to attach track: {0}")]
    TrackAttachError(String),
    #[error("signaling timed out waiting for {0}")]
    SignalingTimeout(&'static str),
}

/// Decode the wire-contract JSON-encoded `RTCSessionDescription` carried in
/// an offer's `sdp` field. Callers never hand the engine literal SDP text.
fn decode_remote_description(json: &str) -> Result<RTCSessionDescription, PeerEngineError> {
    serde_json::from_str(json)
        .map_err(|e| PeerEngineError::SignalingError(format!("invalid session description json: {e}")))
}

/// Encode a local `RTCSessionDescription` back into the wire-contract JSON
/// form carried in an answer's `sdp` field.
fn encode_local_description(desc: &RTCSessionDescription) -> Result<String, PeerEngineError> {
    serde_json::to_string(desc)
        .map_err(|e| PeerEngineError::NegotiationError(format!("failed to encode local description: {e}")))
}

/// `NEW -> NEGOTIATING -> CONNECTED -> CLOSED`, with a terminal `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    New = 0,
    Negotiating = 1,
    Connected = 2,
    Closed = 3,
    Failed = 4,
}

impl From<u8> for PeerState {
    fn from(value: u8) -> Self {
        match value {
            0 => PeerState::New,
            1 => PeerState::Negotiating,
            2 => PeerState::Connected,
            3 => PeerState::Closed,
            _ => PeerState::Failed,
        }
    }
}

/// Shared, atomically-updated peer lifecycle state, readable from outside
/// the WebRTC callbacks that drive it.
#[derive(Debug, Default)]
pub struct PeerStateCell(AtomicU8);

impl PeerStateCell {
    fn set(&self, state: PeerState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> PeerState {
        PeerState::from(self.0.load(Ordering::Relaxed))
    }
}

/// A bound peer connection plus its lifecycle state. Dropping the handle
/// does not close the connection; call [`PeerHandle::close`] explicitly
/// (the Session Registry and the subscriber signaler both hold handles
/// whose lifetime outlives any single stack frame).
pub struct PeerHandle {
    pub state: Arc<PeerStateCell>,
    pc: Arc<RTCPeerConnection>,
}

impl PeerHandle {
    /// Release all resources, transitioning the peer to `CLOSED`.
    pub async fn close(&self) {
        let _ = self.pc.close().await;
    }
}

fn video_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: VIDEO_MIME_TYPE.to_owned(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: VIDEO_FMTP.to_owned(),
        rtcp_feedback: vec![],
    }
}

fn build_media_engine() -> Result<MediaEngine, PeerEngineError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: video_capability(),
                payload_type: VIDEO_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| PeerEngineError::NegotiationError(format!("register codec: {e}")))?;
    Ok(media_engine)
}

async fn new_peer_connection(
    ice_servers: &[IceServerConfig],
) -> Result<Arc<RTCPeerConnection>, PeerEngineError> {
    let mut media_engine = build_media_engine()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| PeerEngineError::NegotiationError(format!("interceptors: {e}")))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: vec![s.url.clone()],
                username: s.username.clone(),
                credential: s.credential.clone(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };

    let pc = api
        .new_peer_connection(config)
        .await
        .map_err(|e| PeerEngineError::NegotiationError(format!("new_peer_connection: {e}")))?;
    Ok(Arc::new(pc))
}

/// Build a bare, unconnected `PeerHandle` for tests that need to exercise
/// teardown/replacement plumbing without a real negotiation.
#[cfg(test)]
pub(crate) async fn test_handle() -> PeerHandle {
    let pc = new_peer_connection(&[]).await.expect("failed to build test peer connection");
    PeerHandle {
        state: Arc::new(PeerStateCell::default()),
        pc,
    }
}

/// Build a real, locally-negotiable offer (a data channel only, no media) and
/// return it JSON-encoded as the wire contract expects. Mirrors the pack's
/// own `new_pair`/`signal_pair` test helpers: a data channel is enough to
/// trigger ICE gathering so the offer carries host candidates.
#[cfg(test)]
pub(crate) async fn test_offer_json() -> String {
    let pc = new_peer_connection(&[]).await.expect("failed to build offering peer connection");
    pc.create_data_channel("probe", None)
        .await
        .expect("failed to create probe data channel");

    let offer = pc.create_offer(None).await.expect("failed to create offer");
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(offer)
        .await
        .expect("failed to set local description");
    let _ = gather_complete.recv().await;

    let local = pc
        .local_description()
        .await
        .expect("offering peer has no local description");
    encode_local_description(&local).expect("failed to encode test offer")
}

fn watch_connection_state(pc: &Arc<RTCPeerConnection>, state: Arc<PeerStateCell>) {
    state.set(PeerState::Negotiating);
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let state = state.clone();
        match s {
            RTCPeerConnectionState::Connected => state.set(PeerState::Connected),
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                state.set(PeerState::Failed)
            }
            RTCPeerConnectionState::Closed => state.set(PeerState::Closed),
            _ => {}
        }
        Box::pin(async {})
    }));
}

/// Ingest mode: attach a write-only sink that copies every inbound RTP
/// packet into `relay_track`, wait for ICE gathering to finish (non-trickle),
/// and return the answer.
pub async fn bind_publisher(
    ice_servers: &[IceServerConfig],
    remote_offer_sdp: &str,
    relay_track: Arc<RelayTrack>,
) -> Result<(String, PeerHandle), PeerEngineError> {
    let pc = new_peer_connection(ice_servers).await?;
    let state = Arc::new(PeerStateCell::default());
    watch_connection_state(&pc, state.clone());

    let pc_weak = Arc::downgrade(&pc);
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let relay_track = relay_track.clone();
        let pc_weak = pc_weak.clone();
        let media_ssrc = track.ssrc();

        // Keep the publisher producing keyframes by nudging it with PLI
        // until the first viewer attaches (mirrors the teacher's reflect
        // example's keepalive-PLI loop).
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(3)).await;
                let Some(pc) = pc_weak.upgrade() else {
                    break;
                };
                if pc
                    .write_rtcp(&[Box::new(PictureLossIndication {
                        sender_ssrc: 0,
                        media_ssrc,
                    })])
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Ok((packet, _attrs)) = track.read_rtp().await {
                relay_track.publish(Arc::new(packet));
            }
        });

        Box::pin(async {})
    }));

    let offer = decode_remote_description(remote_offer_sdp)?;

    timeout(NEGOTIATION_TIMEOUT, pc.set_remote_description(offer))
        .await
        .map_err(|_| PeerEngineError::SignalingTimeout("remote description"))?
        .map_err(|e| PeerEngineError::SignalingError(e.to_string()))?;

    let answer = timeout(NEGOTIATION_TIMEOUT, pc.create_answer(None))
        .await
        .map_err(|_| PeerEngineError::SignalingTimeout("answer creation"))?
        .map_err(|e| PeerEngineError::NegotiationError(e.to_string()))?;

    let mut gather_complete = pc.gathering_complete_promise().await;

    pc.set_local_description(answer)
        .await
        .map_err(|e| PeerEngineError::NegotiationError(e.to_string()))?;

    timeout(NEGOTIATION_TIMEOUT, gather_complete.recv())
        .await
        .map_err(|_| PeerEngineError::SignalingTimeout("ice gathering"))?;

    let local_desc = pc
        .local_description()
        .await
        .ok_or_else(|| PeerEngineError::NegotiationError("no local description".into()))?;

    Ok((encode_local_description(&local_desc)?, PeerHandle { state, pc }))
}

/// Fan-out mode: attach `relay_track` as an outbound track that forwards
/// every packet published on it, and negotiate with trickle ICE.
pub async fn bind_subscriber(
    ice_servers: &[IceServerConfig],
    remote_offer_sdp: &str,
    relay_track: Arc<RelayTrack>,
    send_candidate: impl Fn(String) + Send + Sync + 'static,
    mut recv_candidate: mpsc::Receiver<String>,
) -> Result<(String, PeerHandle), PeerEngineError> {
    let pc = new_peer_connection(ice_servers).await?;
    let state = Arc::new(PeerStateCell::default());
    watch_connection_state(&pc, state.clone());

    let output_track = Arc::new(TrackLocalStaticRTP::new(
        video_capability(),
        "relay".to_string(),
        "broadcast-relay".to_string(),
    ));

    let rtp_sender = pc
        .add_track(Arc::clone(&output_track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| PeerEngineError::TrackAttachError(e.to_string()))?;

    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while rtp_sender.read(&mut buf).await.is_ok() {}
    });

    let mut packets = relay_track.subscribe();
    let forward_track = output_track.clone();
    tokio::spawn(async move {
        loop {
            match packets.recv().await {
                Ok(packet) => {
                    if forward_track.write_rtp(&packet).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(candidate) = candidate {
            if let Ok(init) = candidate.to_json() {
                match serde_json::to_string(&init) {
                    Ok(json) => send_candidate(json),
                    Err(e) => warn!("failed to encode local ice candidate: {e}"),
                }
            }
        }
        Box::pin(async {})
    }));

    let pc_for_candidates = pc.clone();
    tokio::spawn(async move {
        while let Some(candidate_json) = recv_candidate.recv().await {
            match serde_json::from_str::<RTCIceCandidateInit>(&candidate_json) {
                Ok(init) => {
                    let _ = pc_for_candidates.add_ice_candidate(init).await;
                }
                Err(e) => warn!("dropping malformed remote ice candidate: {e}"),
            }
        }
    });

    let offer = decode_remote_description(remote_offer_sdp)?;

    timeout(NEGOTIATION_TIMEOUT, pc.set_remote_description(offer))
        .await
        .map_err(|_| PeerEngineError::SignalingTimeout("remote description"))?
        .map_err(|e| PeerEngineError::SignalingError(e.to_string()))?;

    let answer = timeout(NEGOTIATION_TIMEOUT, pc.create_answer(None))
        .await
        .map_err(|_| PeerEngineError::SignalingTimeout("answer creation"))?
        .map_err(|e| PeerEngineError::NegotiationError(e.to_string()))?;

    pc.set_local_description(answer)
        .await
        .map_err(|e| PeerEngineError::NegotiationError(e.to_string()))?;

    // Trickle ICE: return the answer immediately, without waiting for gathering.
    let local_desc = pc
        .local_description()
        .await
        .ok_or_else(|| PeerEngineError::NegotiationError("no local description".into()))?;

    Ok((encode_local_description(&local_desc)?, PeerHandle { state, pc }))
}
