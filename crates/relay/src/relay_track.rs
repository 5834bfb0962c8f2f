//! The in-memory RTP sink/source shared between one ingest peer and zero or
//! more fan-out peers.

use std::sync::Arc;

use tokio::sync::broadcast;
use webrtc::rtp::packet::Packet;

/// Capacity of the broadcast channel backing a relay track. A slow fan-out
/// reader that falls this far behind drops packets (reported as a lagged
/// receive) rather than blocking the ingest side.
const CHANNEL_CAPACITY: usize = 512;

/// Written by exactly one ingest peer; read, by copy-forward, by zero or
/// more fan-out peers. Cloning a `broadcast::Receiver` per subscriber is how
/// "zero or more readers without blocking the writer" is realized here.
pub struct RelayTrack {
    sender: broadcast::Sender<Arc<Packet>>,
}

impl RelayTrack {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Copy one inbound RTP packet into the track. Never blocks; if there
    /// are no subscribers yet the packet is simply dropped.
    pub fn publish(&self, packet: Arc<Packet>) {
        let _ = self.sender.send(packet);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Packet>> {
        self.sender.subscribe()
    }
}

impl Default for RelayTrack {
    fn default() -> Self {
        Self::new()
    }
}
