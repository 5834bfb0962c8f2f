//! Wire types for the two signaling surfaces: the viewer-facing web-socket
//! envelope and the shared session metadata used on both the broker and
//! web-socket sides.

use serde::{Deserialize, Serialize};

/// The two video sources an edge device owns. Stable integer encoding on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Drone,
    Monitor,
}

impl TrackSource {
    pub fn as_u8(self) -> u8 {
        match self {
            TrackSource::Drone => 0,
            TrackSource::Monitor => 1,
        }
    }
}

impl TryFrom<u8> for TrackSource {
    type Error = InvalidTrackSource;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TrackSource::Drone),
            1 => Ok(TrackSource::Monitor),
            other => Err(InvalidTrackSource(other)),
        }
    }
}

impl std::fmt::Display for TrackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TrackSource::Drone => "drone",
            TrackSource::Monitor => "monitor",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid track source: {0}")]
pub struct InvalidTrackSource(pub u8);

impl Serialize for TrackSource {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for TrackSource {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        TrackSource::try_from(value).map_err(serde::de::Error::custom)
    }
}

/// `(Device Identifier, Track Source)`, the pair that names one ingest track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub track_source: TrackSource,
}

impl SessionMeta {
    /// Canonical, deterministic, collision-free serialization used to index the registry.
    pub fn session_key(&self) -> String {
        format!("{}\u{1f}{}", self.id, self.track_source.as_u8())
    }
}

/// Outer framing on the viewer web-socket: `{event, id, data}`.
///
/// `data` is left as raw JSON here rather than a strictly-tagged enum so that
/// unrecognized events can be logged and ignored instead of failing to parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub id: String,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(event: &str, id: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            event: event.to_string(),
            id: id.into(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }
}

pub const EVENT_VIDEO_OFFER: &str = "video-offer";
pub const EVENT_VIDEO_ANSWER: &str = "video-answer";
pub const EVENT_NEW_ICE_CANDIDATE: &str = "new-ice-candidate";
pub const EVENT_ERROR: &str = "error";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoOfferData {
    pub meta: SessionMeta,
    /// JSON-encoded `RTCSessionDescription`.
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoAnswerData {
    pub meta: SessionMeta,
    /// JSON-encoded `RTCSessionDescription`.
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIceCandidateData {
    pub meta: SessionMeta,
    /// JSON-encoded `RTCIceCandidateInit`.
    pub candidate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<SessionMeta>,
    pub code: ErrorCode,
    pub message: String,
}

/// Stable numeric error codes on the wire (error taxonomy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    ReadMessage = 0,
    UnmarshalJson = 1,
    UnmarshalPayload = 2,
    IncorrectMetadata = 3,
    MetadataNotMatched = 4,
    FailedToCreateSubscriber = 5,
    NegotiationError = 6,
    SignalingTimeout = 7,
    TrackAttachError = 8,
}

impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u16(*self as u16)
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = u16::deserialize(deserializer)?;
        match value {
            0 => Ok(ErrorCode::ReadMessage),
            1 => Ok(ErrorCode::UnmarshalJson),
            2 => Ok(ErrorCode::UnmarshalPayload),
            3 => Ok(ErrorCode::IncorrectMetadata),
            4 => Ok(ErrorCode::MetadataNotMatched),
            5 => Ok(ErrorCode::FailedToCreateSubscriber),
            6 => Ok(ErrorCode::NegotiationError),
            7 => Ok(ErrorCode::SignalingTimeout),
            8 => Ok(ErrorCode::TrackAttachError),
            other => Err(serde::de::Error::custom(format!(
                "unknown error code: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_source_roundtrips_through_u8() {
        assert_eq!(TrackSource::try_from(0).unwrap(), TrackSource::Drone);
        assert_eq!(TrackSource::try_from(1).unwrap(), TrackSource::Monitor);
        assert!(TrackSource::try_from(2).is_err());
    }

    #[test]
    fn track_source_serializes_as_int() {
        let json = serde_json::to_string(&TrackSource::Monitor).unwrap();
        assert_eq!(json, "1");
    }

    #[test]
    fn session_key_is_deterministic_and_distinguishes_track_source() {
        let a = SessionMeta {
            id: "drone-A".to_string(),
            track_source: TrackSource::Drone,
        };
        let b = SessionMeta {
            id: "drone-A".to_string(),
            track_source: TrackSource::Monitor,
        };
        assert_ne!(a.session_key(), b.session_key());
        assert_eq!(a.session_key(), a.session_key());
    }

    #[test]
    fn envelope_roundtrip_video_offer() {
        let data = VideoOfferData {
            meta: SessionMeta {
                id: "drone-A".to_string(),
                track_source: TrackSource::Drone,
            },
            sdp: "{\"type\":\"offer\",\"sdp\":\"...\"}".to_string(),
        };
        let env = Envelope::new(EVENT_VIDEO_OFFER, "corr-1", &data);
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"event\":\"video-offer\""));
        assert!(json.contains("\"id\":\"corr-1\""));

        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event, EVENT_VIDEO_OFFER);
        let parsed_data: VideoOfferData = serde_json::from_value(parsed.data).unwrap();
        assert_eq!(parsed_data.meta.id, "drone-A");
    }

    #[test]
    fn unrecognized_event_still_parses_as_envelope() {
        let json = r#"{"event":"something-else","id":"x","data":{"foo":1}}"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.event, "something-else");
    }

    #[test]
    fn error_data_omits_meta_when_absent() {
        let data = ErrorData {
            meta: None,
            code: ErrorCode::MetadataNotMatched,
            message: "no such session".to_string(),
        };
        let json = serde_json::to_string(&data).unwrap();
        assert!(!json.contains("meta"));
        assert!(json.contains("\"code\":4"));
    }

    #[test]
    fn error_code_rejects_unknown_values() {
        let json = "99";
        let result: Result<ErrorCode, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
