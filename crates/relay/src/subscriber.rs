//! Subscriber Signaler: terminates viewer web-socket connections and drives
//! fan-out Peer Engines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{
    ErrorCode, ErrorData, Envelope, NewIceCandidateData, SessionMeta, TrackSource, VideoAnswerData,
    VideoOfferData, EVENT_ERROR, EVENT_NEW_ICE_CANDIDATE, EVENT_VIDEO_ANSWER, EVENT_VIDEO_OFFER,
};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::AppState;
use crate::peer::{self, PeerHandle};

const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Close the connection after this many consecutive missed pongs (90s at
/// the default interval).
const MAX_MISSED_PONGS: u32 = 3;
const CANDIDATE_QUEUE_CAPACITY: usize = 16;
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

pub async fn signal_ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(65_536)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection state: one pending-candidate queue per `Track Source`
/// (per the design, keyed by track source, not by viewer-chosen id), and
/// the handles of every fan-out peer currently active on this connection.
#[derive(Default)]
struct ConnectionState {
    candidate_queues: Mutex<HashMap<TrackSource, mpsc::Sender<String>>>,
    active_peers: Mutex<Vec<PeerHandle>>,
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
    let conn = Arc::new(ConnectionState::default());

    // Serializes all writes to this socket so envelopes from concurrent
    // fan-out peers never interleave.
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut missed_pongs: u32 = 0;
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("server shutting down, closing viewer connection");
                let _ = out_tx.send(Message::Close(Some(CloseFrame {
                    code: 1000,
                    reason: "server shutting down".into(),
                }))).await;
                break;
            }
            _ = ping_interval.tick() => {
                missed_pongs += 1;
                if missed_pongs >= MAX_MISSED_PONGS {
                    warn!("viewer connection timed out waiting for pong, closing");
                    break;
                }
                if out_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        missed_pongs = 0;
                        handle_envelope(text.to_string(), &state, &conn, &out_tx).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("viewer read error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    conn.candidate_queues.lock().await.clear();
    for peer in conn.active_peers.lock().await.drain(..) {
        peer.close().await;
    }
    writer.abort();
    info!("viewer connection closed");
}

async fn handle_envelope(
    text: String,
    state: &Arc<AppState>,
    conn: &Arc<ConnectionState>,
    out_tx: &mpsc::Sender<Message>,
) {
    let envelope: Envelope = match serde_json::from_str(&text) {
        Ok(e) => e,
        Err(e) => {
            warn!("unreadable envelope: {e}");
            send_error(out_tx, "", None, ErrorCode::UnmarshalJson, "invalid envelope").await;
            return;
        }
    };

    match envelope.event.as_str() {
        EVENT_VIDEO_OFFER => handle_video_offer(envelope, state, conn, out_tx).await,
        EVENT_NEW_ICE_CANDIDATE => handle_new_ice_candidate(envelope, state, conn, out_tx).await,
        other => {
            debug!("ignoring unrecognized event: {other}");
        }
    }
}

async fn handle_video_offer(
    envelope: Envelope,
    state: &Arc<AppState>,
    conn: &Arc<ConnectionState>,
    out_tx: &mpsc::Sender<Message>,
) {
    let data: VideoOfferData = match serde_json::from_value(envelope.data) {
        Ok(d) => d,
        Err(e) => {
            warn!("malformed video-offer payload: {e}");
            send_error(
                out_tx,
                &envelope.id,
                None,
                ErrorCode::UnmarshalPayload,
                "malformed video-offer payload",
            )
            .await;
            return;
        }
    };

    if data.meta.id.trim().is_empty() {
        send_error(
            out_tx,
            &envelope.id,
            Some(data.meta),
            ErrorCode::IncorrectMetadata,
            "meta.id must not be empty",
        )
        .await;
        return;
    }

    let session_key = data.meta.session_key();
    let Some(relay_track) = state.registry.get(&session_key).await else {
        send_error(
            out_tx,
            &envelope.id,
            Some(data.meta.clone()),
            ErrorCode::MetadataNotMatched,
            "no publisher for this session",
        )
        .await;
        return;
    };

    let (candidate_tx, candidate_rx) = mpsc::channel(CANDIDATE_QUEUE_CAPACITY);
    conn.candidate_queues
        .lock()
        .await
        .insert(data.meta.track_source, candidate_tx);

    let meta_for_candidates = data.meta.clone();
    let corr_id = envelope.id.clone();
    let corr_id_for_candidates = envelope.id.clone();
    let out_tx_for_candidates = out_tx.clone();
    let send_candidate = move |candidate: String| {
        let envelope = Envelope::new(
            EVENT_NEW_ICE_CANDIDATE,
            corr_id_for_candidates.clone(),
            NewIceCandidateData {
                meta: meta_for_candidates.clone(),
                candidate,
            },
        );
        let out_tx = out_tx_for_candidates.clone();
        tokio::spawn(async move {
            let _ = out_tx
                .send(Message::Text(serde_json::to_string(&envelope).unwrap_or_default().into()))
                .await;
        });
    };

    match peer::bind_subscriber(
        &state.ice_servers,
        &data.sdp,
        relay_track,
        send_candidate,
        candidate_rx,
    )
    .await
    {
        Ok((answer_sdp, handle)) => {
            conn.active_peers.lock().await.push(handle);
            let answer = Envelope::new(
                EVENT_VIDEO_ANSWER,
                envelope.id,
                VideoAnswerData {
                    meta: data.meta,
                    sdp: answer_sdp,
                },
            );
            let _ = out_tx
                .send(Message::Text(serde_json::to_string(&answer).unwrap_or_default().into()))
                .await;
        }
        Err(e) => {
            warn!("fan-out bind failed: {e}");
            let code = match e {
                peer::PeerEngineError::SignalingTimeout(_) => ErrorCode::SignalingTimeout,
                peer::PeerEngineError::NegotiationError(_) => ErrorCode::NegotiationError,
                peer::PeerEngineError::TrackAttachError(_) => ErrorCode::FailedToCreateSubscriber,
                peer::PeerEngineError::SignalingError(_) => ErrorCode::FailedToCreateSubscriber,
            };
            send_error(out_tx, &corr_id, Some(data.meta), code, &e.to_string()).await;
        }
    }
}

async fn handle_new_ice_candidate(
    envelope: Envelope,
    state: &Arc<AppState>,
    conn: &Arc<ConnectionState>,
    out_tx: &mpsc::Sender<Message>,
) {
    let data: NewIceCandidateData = match serde_json::from_value(envelope.data) {
        Ok(d) => d,
        Err(e) => {
            warn!("malformed new-ice-candidate payload: {e}");
            send_error(
                out_tx,
                &envelope.id,
                None,
                ErrorCode::UnmarshalPayload,
                "malformed new-ice-candidate payload",
            )
            .await;
            return;
        }
    };

    if data.meta.id.trim().is_empty() {
        send_error(
            out_tx,
            &envelope.id,
            Some(data.meta),
            ErrorCode::IncorrectMetadata,
            "meta.id must not be empty",
        )
        .await;
        return;
    }

    let session_key = data.meta.session_key();
    if state.registry.get(&session_key).await.is_none() {
        send_error(
            out_tx,
            &envelope.id,
            Some(data.meta),
            ErrorCode::MetadataNotMatched,
            "no publisher for this session",
        )
        .await;
        return;
    }

    let queues = conn.candidate_queues.lock().await;
    if let Some(sender) = queues.get(&data.meta.track_source) {
        let _ = sender.send(data.candidate).await;
    }
}

async fn send_error(
    out_tx: &mpsc::Sender<Message>,
    corr_id: &str,
    meta: Option<SessionMeta>,
    code: ErrorCode,
    message: &str,
) {
    let envelope = Envelope::new(
        EVENT_ERROR,
        corr_id,
        ErrorData {
            meta,
            code,
            message: message.to_string(),
        },
    );
    let _ = out_tx
        .send(Message::Text(serde_json::to_string(&envelope).unwrap_or_default().into()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::RelayConfig;
    use tokio_util::sync::CancellationToken;

    fn test_app_state() -> Arc<AppState> {
        Arc::new(AppState::new(&RelayConfig::default(), CancellationToken::new()))
    }

    async fn recv_envelope(out_rx: &mut mpsc::Receiver<Message>) -> Envelope {
        match out_rx.recv().await.expect("expected an outbound message") {
            Message::Text(text) => serde_json::from_str(&text).expect("valid envelope json"),
            other => panic!("expected a text message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn video_offer_against_empty_registry_yields_metadata_not_matched() {
        let state = test_app_state();
        let conn = Arc::new(ConnectionState::default());
        let (out_tx, mut out_rx) = mpsc::channel(4);

        let meta = SessionMeta {
            id: "drone-A".to_string(),
            track_source: TrackSource::Drone,
        };
        let envelope = Envelope::new(
            EVENT_VIDEO_OFFER,
            "corr-1",
            VideoOfferData {
                meta,
                sdp: r#"{"type":"offer","sdp":"v=0"}"#.to_string(),
            },
        );

        handle_video_offer(envelope, &state, &conn, &out_tx).await;

        let reply = recv_envelope(&mut out_rx).await;
        assert_eq!(reply.event, EVENT_ERROR);
        let data: ErrorData = serde_json::from_value(reply.data).unwrap();
        assert_eq!(data.code, ErrorCode::MetadataNotMatched);
    }

    #[tokio::test]
    async fn video_offer_against_populated_registry_yields_matching_answer() {
        let state = test_app_state();
        let conn = Arc::new(ConnectionState::default());
        let (out_tx, mut out_rx) = mpsc::channel(4);

        let meta = SessionMeta {
            id: "drone-A".to_string(),
            track_source: TrackSource::Drone,
        };
        state
            .registry
            .insert(
                meta.session_key(),
                Arc::new(crate::relay_track::RelayTrack::new()),
                peer::test_handle().await,
            )
            .await;

        let offer_sdp = peer::test_offer_json().await;
        let envelope = Envelope::new(
            EVENT_VIDEO_OFFER,
            "corr-2",
            VideoOfferData {
                meta: meta.clone(),
                sdp: offer_sdp,
            },
        );

        handle_video_offer(envelope, &state, &conn, &out_tx).await;

        let reply = recv_envelope(&mut out_rx).await;
        assert_eq!(reply.event, EVENT_VIDEO_ANSWER);
        let data: VideoAnswerData = serde_json::from_value(reply.data).unwrap();
        assert_eq!(data.meta.id, meta.id);
        assert_eq!(data.meta.track_source, meta.track_source);
        assert!(serde_json::from_str::<serde_json::Value>(&data.sdp).is_ok());
        assert!(!conn.active_peers.lock().await.is_empty());
    }

    #[tokio::test]
    async fn new_ice_candidate_routes_into_the_matching_queue() {
        let state = test_app_state();
        let conn = Arc::new(ConnectionState::default());
        let (out_tx, mut out_rx) = mpsc::channel(4);

        let meta = SessionMeta {
            id: "drone-A".to_string(),
            track_source: TrackSource::Drone,
        };
        state
            .registry
            .insert(
                meta.session_key(),
                Arc::new(crate::relay_track::RelayTrack::new()),
                peer::test_handle().await,
            )
            .await;

        let (tx, mut rx) = mpsc::channel(4);
        conn.candidate_queues
            .lock()
            .await
            .insert(meta.track_source, tx);

        let envelope = Envelope::new(
            EVENT_NEW_ICE_CANDIDATE,
            "corr-3",
            NewIceCandidateData {
                meta: meta.clone(),
                candidate: "candidate-json".to_string(),
            },
        );

        handle_new_ice_candidate(envelope, &state, &conn, &out_tx).await;

        let routed = rx.recv().await.expect("candidate forwarded to queue");
        assert_eq!(routed, "candidate-json");
        assert!(out_rx.try_recv().is_err());
    }
}
