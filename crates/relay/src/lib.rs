//! Broadcast relay: bridges edge-device publishers to browser viewers over
//! WebRTC, using an MQTT-style broker for the publisher side and a
//! WebSocket for the viewer side.

pub mod broker;
pub mod config;
pub mod peer;
pub mod registry;
pub mod relay_track;
pub mod router;
pub mod subscriber;

use std::time::Instant;

use peer::IceServerConfig;
use registry::SessionRegistry;
use relay_protocol::RelayConfig;
use tokio_util::sync::CancellationToken;

/// Shared application state, reachable from every HTTP handler and from the
/// Publisher Signaler task.
pub struct AppState {
    pub registry: SessionRegistry,
    pub ice_servers: Vec<IceServerConfig>,
    pub started_at: Instant,
    /// Fires once on process shutdown; every long-lived loop (the publisher
    /// signaler's poll loop, each viewer connection's read loop) selects on
    /// it so in-flight work winds down instead of blocking shutdown forever.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: &RelayConfig, shutdown: CancellationToken) -> Self {
        let ice_servers = config
            .webrtc
            .ice_servers
            .iter()
            .map(|entry| IceServerConfig {
                url: entry.url.clone(),
                username: entry.username.clone(),
                credential: entry.credential.clone(),
            })
            .collect();

        Self {
            registry: SessionRegistry::new(),
            ice_servers,
            started_at: Instant::now(),
            shutdown,
        }
    }
}
