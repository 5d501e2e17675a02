//! Error types for confscribe.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScribeError {
    // Host bridge errors
    #[error("Host page state not found after {attempts} attempts")]
    HostNotFound { attempts: u32 },

    // Audio capture errors
    #[error("Audio initialization failed: {message}")]
    AudioInit { message: String },

    #[error("Stream for speaker {speaker_id} not ready: {message}")]
    StreamNotReady {
        speaker_id: String,
        message: String,
    },

    #[error("Stream for speaker {speaker_id} went inactive")]
    StreamInactive { speaker_id: String },

    #[error("Stream for speaker {speaker_id} has no audio track")]
    NoAudioTrack { speaker_id: String },

    #[error("Capture limit of {limit} concurrent speakers reached")]
    CaptureLimitReached { limit: usize },

    #[error("Speaker {speaker_id} is already being captured")]
    DuplicateCapture { speaker_id: String },

    // Transfer errors
    #[error("Transport is not valid")]
    TransportInvalid,

    #[error("Transport send failed: {message}")]
    TransportSendFailed { message: String },

    // Transcription errors
    #[error("Transcription request failed with status {status}: {body}")]
    TranscriptionHttp { status: u16, body: String },

    #[error("Authentication failed: {message}")]
    Auth { message: String },

    // Configuration errors
    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl ScribeError {
    /// Returns true for credential failures, which must never be retried.
    ///
    /// Classification is by HTTP status (401/403) or the parsed error field
    /// of the response body, never by substring-matching free-form messages.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, ScribeError::Auth { .. })
    }

    /// Returns true for errors worth retrying after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ScribeError::Auth { .. } => false,
            ScribeError::TranscriptionHttp { status, .. } => !matches!(*status, 401 | 403),
            ScribeError::TransportSendFailed { .. } | ScribeError::TransportInvalid => true,
            _ => false,
        }
    }

    /// Builds the error for a non-2xx speech-to-text response.
    ///
    /// 401/403, or a parsed `error` field naming a key problem, becomes
    /// [`ScribeError::Auth`]; anything else is a retryable HTTP error.
    pub fn from_stt_response(status: u16, body: &str) -> Self {
        if status == 401 || status == 403 {
            return ScribeError::Auth {
                message: format!("STT endpoint returned {status}: {body}"),
            };
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            let code = value["error"]
                .as_str()
                .or_else(|| value["error"]["code"].as_str());
            if let Some(code) = code
                && matches!(code, "invalid_api_key" | "missing_api_key" | "invalid_request_key")
            {
                return ScribeError::Auth {
                    message: format!("STT endpoint rejected credentials: {code}"),
                };
            }
        }
        ScribeError::TranscriptionHttp {
            status,
            body: body.to_string(),
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, ScribeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_not_found_display() {
        let error = ScribeError::HostNotFound { attempts: 10 };
        assert_eq!(
            error.to_string(),
            "Host page state not found after 10 attempts"
        );
    }

    #[test]
    fn test_duplicate_capture_display() {
        let error = ScribeError::DuplicateCapture {
            speaker_id: "ALICE01".to_string(),
        };
        assert_eq!(error.to_string(), "Speaker ALICE01 is already being captured");
    }

    #[test]
    fn test_capture_limit_display() {
        let error = ScribeError::CaptureLimitReached { limit: 50 };
        assert_eq!(
            error.to_string(),
            "Capture limit of 50 concurrent speakers reached"
        );
    }

    #[test]
    fn test_auth_classification_by_status() {
        let error = ScribeError::from_stt_response(401, r#"{"error":"invalid_api_key"}"#);
        assert!(error.is_auth_error());
        assert!(!error.is_retryable());

        let error = ScribeError::from_stt_response(403, "forbidden");
        assert!(error.is_auth_error());
    }

    #[test]
    fn test_auth_classification_by_error_field() {
        let error = ScribeError::from_stt_response(400, r#"{"error":"invalid_api_key"}"#);
        assert!(error.is_auth_error());
    }

    #[test]
    fn test_server_error_is_retryable() {
        let error = ScribeError::from_stt_response(500, "internal server error");
        assert!(!error.is_auth_error());
        assert!(error.is_retryable());
    }

    #[test]
    fn test_unparseable_body_is_not_auth() {
        let error = ScribeError::from_stt_response(429, "rate limited {not json");
        assert!(matches!(
            error,
            ScribeError::TranscriptionHttp { status: 429, .. }
        ));
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(ScribeError::TransportInvalid.is_retryable());
        assert!(
            ScribeError::TransportSendFailed {
                message: "channel closed".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: ScribeError = io_error.into();
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<ScribeError>();
        assert_sync::<ScribeError>();
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(returns_result().ok(), Some(42));
    }
}
