//! The Session Registry: a concurrent map from Session Key to Relay Track.
//!
//! Readers (subscribers) run concurrently with each other and with writers
//! (publishers); a writer replaces an entry atomically so an in-flight
//! lookup observes either the old or the new track, never a torn state.
//! No lock here is ever held across network I/O.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::peer::PeerHandle;
use crate::relay_track::RelayTrack;

/// One registered ingest track plus the handle of the peer connection that
/// is writing to it. Replacing an entry hands the previous `SessionEntry`
/// back to the caller so its ingest peer can be torn down.
pub struct SessionEntry {
    pub track: Arc<RelayTrack>,
    pub ingest: PeerHandle,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, session_key: &str) -> Option<Arc<RelayTrack>> {
        self.sessions.read().await.get(session_key).map(|entry| entry.track.clone())
    }

    /// Replace (or create) the entry for `session_key`. Returns the previous
    /// entry, if any, so the caller can tear down its ingest peer.
    pub async fn insert(
        &self,
        session_key: String,
        track: Arc<RelayTrack>,
        ingest: PeerHandle,
    ) -> Option<SessionEntry> {
        self.sessions
            .write()
            .await
            .insert(session_key, SessionEntry { track, ingest })
    }

    /// Number of sessions currently registered, reported on the health endpoint.
    pub async fn len_for_health(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
