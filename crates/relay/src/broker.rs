//! Publisher Signaler: terminates the edge-side signaling protocol over an
//! MQTT-style pub/sub broker and populates the Session Registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_protocol::{RelayConfig, SessionDescription, SessionMeta};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::AppState;
use crate::peer;
use crate::relay_track::RelayTrack;

/// Serializes processing of offers for the same Session Key while letting
/// distinct keys proceed in parallel: one lock per key, created on demand.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn qos_from(value: u8) -> QoS {
    match value {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Splits a `scheme://host:port` broker URL into `(host, port)`. Accepts a
/// bare `host:port` too, defaulting to no scheme stripping in that case.
fn parse_broker_url(url: &str) -> anyhow::Result<(String, u16)> {
    let without_scheme = url.split("://").next_back().unwrap_or(url);
    let (host, port) = without_scheme
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("broker.server '{url}' must be host:port"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("broker.server '{url}' has a non-numeric port"))?;
    Ok((host.to_string(), port))
}

/// Runs forever, consuming offers from the broker until the process is
/// cancelled. The broker client owns reconnection; a poll error is logged
/// and retried rather than propagated.
pub async fn run_publisher_signaler(state: Arc<AppState>, config: RelayConfig) -> anyhow::Result<()> {
    let (host, port) = parse_broker_url(&config.broker.server)?;

    let mut mqtt_options = MqttOptions::new(config.broker.client_id.clone(), host, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    if !config.broker.username.is_empty() {
        mqtt_options.set_credentials(config.broker.username.clone(), config.broker.password.clone());
    }

    let (client, mut event_loop) = AsyncClient::new(mqtt_options, 256);
    client
        .subscribe(&config.topics.offer, qos_from(config.topics.qos))
        .await
        .map_err(|e| anyhow::anyhow!("failed to subscribe to {}: {e}", config.topics.offer))?;

    info!(topic = %config.topics.offer, "subscribed to offer topic");

    let key_locks = Arc::new(KeyLocks::default());

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("publisher signaler shutting down");
                let _ = client.disconnect().await;
                break;
            }
            polled = event_loop.poll() => {
                match polled {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let state = state.clone();
                        let client = client.clone();
                        let config = config.clone();
                        let key_locks = key_locks.clone();
                        tokio::spawn(async move {
                            handle_offer(publish.payload.to_vec(), state, client, config, key_locks).await;
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("broker poll error: {e}, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn handle_offer(
    payload: Vec<u8>,
    state: Arc<AppState>,
    client: AsyncClient,
    config: RelayConfig,
    key_locks: Arc<KeyLocks>,
) {
    let description = match SessionDescription::decode(&payload) {
        Ok(d) => d,
        Err(e) => {
            warn!("dropping malformed publisher payload: {e}");
            return;
        }
    };

    let meta = SessionMeta {
        id: description.id.clone(),
        track_source: description.track_source,
    };
    let session_key = meta.session_key();
    let lock = key_locks.lock_for(&session_key).await;
    let _guard = lock.lock().await;

    let relay_track = Arc::new(RelayTrack::new());

    let (answer_sdp, handle) = match peer::bind_publisher(
        &state.ice_servers,
        &description.sdp,
        relay_track.clone(),
    )
    .await
    {
        Ok(result) => result,
        Err(e) => {
            error!(
                offer_topic = %config.topics.offer,
                id = %description.id,
                track_source = %description.track_source,
                "ingest bind failed: {e}"
            );
            return;
        }
    };

    let answer = SessionDescription::new(description.id.clone(), description.track_source, answer_sdp);
    let answer_topic = format!(
        "{}/{}/{}",
        config.topics.answer_prefix,
        description.id,
        description.track_source.as_u8()
    );

    if let Err(e) = client
        .publish(
            &answer_topic,
            qos_from(config.topics.qos),
            config.topics.retained,
            answer.encode(),
        )
        .await
    {
        error!(topic = %answer_topic, "failed to publish answer: {e}");
        handle.close().await;
        return;
    }

    if let Some(previous) = state.registry.insert(session_key, relay_track, handle).await {
        info!(
            id = %description.id,
            track_source = %description.track_source,
            "replacing existing ingest peer for this session"
        );
        previous.ingest.close().await;
    }

    info!(
        id = %description.id,
        track_source = %description.track_source,
        "ingest peer bound and answer published"
    );
}
