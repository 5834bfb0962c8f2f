//! Binary wire format for `SessionDescription` payloads exchanged with the
//! edge broker (both the offer topic and the per-device answer topic use it).
//!
//! Little-endian, length-delimited:
//! ```text
//! [0..4]   magic: 0x43534453 ("SDSC")
//! [4]      version: 1
//! [5]      track_source: 0 = drone, 1 = monitor
//! [6..8]   id_len (u16)
//! [8..12]  sdp_len (u32)
//! [12..]   id bytes (utf-8), then sdp bytes (utf-8)
//! ```

use crate::messages::TrackSource;

pub const SESSION_DESC_HEADER_SIZE: usize = 12;
pub const SESSION_DESC_MAGIC: u32 = 0x4353_4453; // "SDSC" in LE
pub const SESSION_DESC_VERSION: u8 = 1;

/// The `{id, track_source, sdp}` payload carried on the offer and answer topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub id: String,
    pub track_source: TrackSource,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(id: impl Into<String>, track_source: TrackSource, sdp: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            track_source,
            sdp: sdp.into(),
        }
    }

    /// Encode as the binary wire format described above.
    pub fn encode(&self) -> Vec<u8> {
        let id_bytes = self.id.as_bytes();
        let sdp_bytes = self.sdp.as_bytes();
        let mut buf = Vec::with_capacity(SESSION_DESC_HEADER_SIZE + id_bytes.len() + sdp_bytes.len());

        buf.extend_from_slice(&SESSION_DESC_MAGIC.to_le_bytes());
        buf.push(SESSION_DESC_VERSION);
        buf.push(self.track_source.as_u8());
        buf.extend_from_slice(&(id_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(sdp_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(id_bytes);
        buf.extend_from_slice(sdp_bytes);
        buf
    }

    /// Decode from the binary wire format, validating magic, version, and lengths.
    pub fn decode(buf: &[u8]) -> Result<Self, SessionDescriptionError> {
        if buf.len() < SESSION_DESC_HEADER_SIZE {
            return Err(SessionDescriptionError::TooShort(buf.len()));
        }

        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != SESSION_DESC_MAGIC {
            return Err(SessionDescriptionError::BadMagic(magic));
        }

        let version = buf[4];
        if version != SESSION_DESC_VERSION {
            return Err(SessionDescriptionError::UnsupportedVersion(version));
        }

        let track_source = TrackSource::try_from(buf[5])
            .map_err(|e| SessionDescriptionError::BadTrackSource(e.0))?;

        let id_len = u16::from_le_bytes([buf[6], buf[7]]) as usize;
        let sdp_len = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;

        let expected = SESSION_DESC_HEADER_SIZE + id_len + sdp_len;
        if buf.len() < expected {
            return Err(SessionDescriptionError::Truncated {
                expected,
                actual: buf.len(),
            });
        }

        let id_start = SESSION_DESC_HEADER_SIZE;
        let sdp_start = id_start + id_len;
        let id = std::str::from_utf8(&buf[id_start..sdp_start])
            .map_err(|_| SessionDescriptionError::InvalidUtf8)?
            .to_string();
        let sdp = std::str::from_utf8(&buf[sdp_start..sdp_start + sdp_len])
            .map_err(|_| SessionDescriptionError::InvalidUtf8)?
            .to_string();

        if id.is_empty() {
            return Err(SessionDescriptionError::EmptyId);
        }

        Ok(Self {
            id,
            track_source,
            sdp,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionDescriptionError {
    #[error("buffer too short: {0} bytes (need at least {SESSION_DESC_HEADER_SIZE})")]
    TooShort(usize),
    #[error("bad magic: 0x{0:08x} (expected 0x{SESSION_DESC_MAGIC:08x})")]
    BadMagic(u32),
    #[error("unsupported version: {0} (expected {SESSION_DESC_VERSION})")]
    UnsupportedVersion(u8),
    #[error("bad track source byte: {0}")]
    BadTrackSource(u8),
    #[error("truncated payload: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("id or sdp is not valid utf-8")]
    InvalidUtf8,
    #[error("id is empty")]
    EmptyId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_drone() {
        let desc = SessionDescription::new("drone-A", TrackSource::Drone, "v=0\r\n...");
        let encoded = desc.encode();
        let decoded = SessionDescription::decode(&encoded).unwrap();
        assert_eq!(desc, decoded);
    }

    #[test]
    fn roundtrip_monitor_empty_sdp() {
        let desc = SessionDescription::new("monitor-7", TrackSource::Monitor, "");
        let encoded = desc.encode();
        let decoded = SessionDescription::decode(&encoded).unwrap();
        assert_eq!(desc, decoded);
    }

    #[test]
    fn decode_too_short() {
        let buf = [0u8; 4];
        match SessionDescription::decode(&buf) {
            Err(SessionDescriptionError::TooShort(4)) => {}
            other => panic!("expected TooShort(4), got {other:?}"),
        }
    }

    #[test]
    fn decode_bad_magic() {
        let mut buf = vec![0u8; SESSION_DESC_HEADER_SIZE];
        buf[0..4].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        match SessionDescription::decode(&buf) {
            Err(SessionDescriptionError::BadMagic(0xDEADBEEF)) => {}
            other => panic!("expected BadMagic, got {other:?}"),
        }
    }

    #[test]
    fn decode_bad_version() {
        let desc = SessionDescription::new("drone-A", TrackSource::Drone, "sdp");
        let mut encoded = desc.encode();
        encoded[4] = 99;
        match SessionDescription::decode(&encoded) {
            Err(SessionDescriptionError::UnsupportedVersion(99)) => {}
            other => panic!("expected UnsupportedVersion(99), got {other:?}"),
        }
    }

    #[test]
    fn decode_bad_track_source() {
        let desc = SessionDescription::new("drone-A", TrackSource::Drone, "sdp");
        let mut encoded = desc.encode();
        encoded[5] = 7;
        match SessionDescription::decode(&encoded) {
            Err(SessionDescriptionError::BadTrackSource(7)) => {}
            other => panic!("expected BadTrackSource(7), got {other:?}"),
        }
    }

    #[test]
    fn decode_truncated_payload() {
        let desc = SessionDescription::new("drone-A", TrackSource::Drone, "sdp-body");
        let mut encoded = desc.encode();
        encoded.truncate(encoded.len() - 3);
        match SessionDescription::decode(&encoded) {
            Err(SessionDescriptionError::Truncated { .. }) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_empty_id() {
        let desc = SessionDescription::new("", TrackSource::Drone, "sdp");
        let encoded = desc.encode();
        match SessionDescription::decode(&encoded) {
            Err(SessionDescriptionError::EmptyId) => {}
            other => panic!("expected EmptyId, got {other:?}"),
        }
    }

    #[test]
    fn magic_bytes_spell_sdsc() {
        assert_eq!(&SESSION_DESC_MAGIC.to_le_bytes(), b"SDSC");
    }
}
