//! JSON message protocol between the capture context and the service context.
//!
//! The two contexts share no memory; everything crosses as one of these
//! messages over a FIFO transport.

use crate::config::SettingsUpdate;
use serde::{Deserialize, Serialize};

/// One chunk of 16-bit PCM for a speaker, sequenced for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioChunk {
    pub speaker_id: String,
    pub samples: Vec<i16>,
    /// Wall-clock milliseconds at the first sample's frame boundary.
    pub capture_timestamp_ms: i64,
    pub sample_rate: u32,
    /// Process-monotonic sequence number. The transport already guarantees
    /// order; receivers only use this to flag out-of-order delivery.
    pub sequence: u64,
}

impl AudioChunk {
    /// Duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Messages sent by the capture context to the service context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaptureMessage {
    AudioChunk(AudioChunk),
    CaptureStarted {
        speaker_id: String,
    },
    CaptureStopped {
        speaker_id: String,
    },
    SpeakerJoined {
        speaker_id: String,
        display_name: String,
    },
    SpeakerLeft {
        speaker_id: String,
        display_name: String,
    },
    Reconnect,
    ForceTranscribe {
        speaker_id: String,
    },
    UpdateSpeakerMapping {
        speaker_id: String,
        display_name: String,
    },
    SetApiKey {
        api_key: String,
    },
    UpdateSettings {
        settings: SettingsUpdate,
    },
    GetStatus,
    GetHistory,
    ClearHistory,
}

impl CaptureMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Speaker this message concerns, when it has one.
    pub fn speaker_id(&self) -> Option<&str> {
        match self {
            CaptureMessage::AudioChunk(chunk) => Some(&chunk.speaker_id),
            CaptureMessage::CaptureStarted { speaker_id }
            | CaptureMessage::CaptureStopped { speaker_id }
            | CaptureMessage::SpeakerJoined { speaker_id, .. }
            | CaptureMessage::SpeakerLeft { speaker_id, .. }
            | CaptureMessage::ForceTranscribe { speaker_id }
            | CaptureMessage::UpdateSpeakerMapping { speaker_id, .. } => Some(speaker_id),
            _ => None,
        }
    }
}

/// Messages sent by the service context back to the capture context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceReply {
    Transcription {
        speaker_id: String,
        display_name: String,
        text: String,
        start_time_ms: i64,
        duration_secs: f64,
    },
    BufferStatus {
        buffer_seconds: f64,
        is_processing: bool,
        active_speakers: usize,
        per_speaker_seconds: Vec<(String, f64)>,
        transcriptions_sent: u64,
        total_duration_secs: f64,
        errors: u64,
    },
    Error {
        context: String,
        speaker_id: Option<String>,
        message: String,
    },
}

impl ServiceReply {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> AudioChunk {
        AudioChunk {
            speaker_id: "ALICE01".to_string(),
            samples: vec![0, 100, -100],
            capture_timestamp_ms: 1_700_000_000_000,
            sample_rate: 16000,
            sequence: 7,
        }
    }

    #[test]
    fn test_audio_chunk_json_roundtrip() {
        let msg = CaptureMessage::AudioChunk(sample_chunk());
        let json = msg.to_json().expect("should serialize");
        let deserialized = CaptureMessage::from_json(&json).expect("should deserialize");
        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_json_format_is_snake_case() {
        let msg = CaptureMessage::AudioChunk(sample_chunk());
        let json = msg.to_json().expect("should serialize");
        assert!(json.contains(r#""type":"audio_chunk""#));
        assert!(json.contains(r#""speaker_id":"ALICE01""#));
    }

    #[test]
    fn test_control_messages_roundtrip() {
        let messages = vec![
            CaptureMessage::CaptureStarted {
                speaker_id: "A".to_string(),
            },
            CaptureMessage::SpeakerLeft {
                speaker_id: "A".to_string(),
                display_name: "Alice".to_string(),
            },
            CaptureMessage::Reconnect,
            CaptureMessage::ForceTranscribe {
                speaker_id: "A".to_string(),
            },
            CaptureMessage::SetApiKey {
                api_key: "sk-test".to_string(),
            },
            CaptureMessage::GetStatus,
            CaptureMessage::ClearHistory,
        ];

        for msg in messages {
            let json = msg.to_json().expect("should serialize");
            let deserialized = CaptureMessage::from_json(&json).expect("should deserialize");
            assert_eq!(msg, deserialized, "roundtrip failed for {:?}", msg);
        }
    }

    #[test]
    fn test_speaker_id_accessor() {
        let msg = CaptureMessage::ForceTranscribe {
            speaker_id: "BOB".to_string(),
        };
        assert_eq!(msg.speaker_id(), Some("BOB"));
        assert_eq!(CaptureMessage::Reconnect.speaker_id(), None);
    }

    #[test]
    fn test_chunk_duration() {
        let chunk = AudioChunk {
            speaker_id: "A".to_string(),
            samples: vec![0; 16000],
            capture_timestamp_ms: 0,
            sample_rate: 16000,
            sequence: 0,
        };
        assert_eq!(chunk.duration_secs(), 1.0);
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(CaptureMessage::from_json("{not json").is_err());
        assert!(CaptureMessage::from_json(r#"{"type":"no_such_message"}"#).is_err());
    }

    #[test]
    fn test_service_reply_roundtrip() {
        let reply = ServiceReply::Transcription {
            speaker_id: "A".to_string(),
            display_name: "Alice".to_string(),
            text: "hello".to_string(),
            start_time_ms: 123,
            duration_secs: 2.0,
        };
        let json = reply.to_json().expect("should serialize");
        assert_eq!(
            ServiceReply::from_json(&json).expect("should deserialize"),
            reply
        );
    }
}
