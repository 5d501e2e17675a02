//! Speech-to-text client seam.
//!
//! The real client posts a multipart form to an HTTP endpoint; the mock
//! plays back scripted responses for tests.

use crate::config::SttConfig;
use crate::error::{Result, ScribeError};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Request metadata accompanying the audio body.
#[derive(Debug, Clone)]
pub struct SttRequest {
    /// Complete WAV file bytes.
    pub wav: Vec<u8>,
    /// Resolved display name, used as context in the prompt field.
    pub display_name: String,
}

/// Speech-to-text over an opaque backend.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribes one utterance. Empty or whitespace-only text is a
    /// successful no-op for callers.
    async fn transcribe(&self, request: SttRequest) -> Result<String>;

    /// Installs the credential used by subsequent requests. Backends
    /// without one still reject empty keys.
    fn set_api_key(&self, api_key: &str) -> Result<()> {
        if api_key.trim().is_empty() {
            return Err(ScribeError::ConfigInvalidValue {
                key: "api_key".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SttResponse {
    #[serde(default)]
    text: String,
}

/// HTTP client for an OpenAI-compatible transcription endpoint.
pub struct HttpSttClient {
    client: reqwest::Client,
    config: SttConfig,
    api_key: Arc<Mutex<String>>,
}

impl HttpSttClient {
    pub fn new(config: SttConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            api_key: Arc::new(Mutex::new(String::new())),
        }
    }

    fn current_key(&self) -> Result<String> {
        let key = self
            .api_key
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if key.is_empty() {
            return Err(ScribeError::Auth {
                message: "no API key configured".to_string(),
            });
        }
        Ok(key)
    }
}

#[async_trait]
impl SpeechToText for HttpSttClient {
    /// Installs the bearer token used for subsequent requests.
    fn set_api_key(&self, api_key: &str) -> Result<()> {
        if api_key.trim().is_empty() {
            return Err(ScribeError::ConfigInvalidValue {
                key: "api_key".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        *self.api_key.lock().unwrap_or_else(|e| e.into_inner()) = api_key.to_string();
        Ok(())
    }

    async fn transcribe(&self, request: SttRequest) -> Result<String> {
        let api_key = self.current_key()?;

        let part = reqwest::multipart::Part::bytes(request.wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| ScribeError::Other(format!("multipart build failed: {e}")))?;

        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone())
            .text("language", self.config.language.clone())
            .text("response_format", "json")
            .text(
                "prompt",
                format!("Conference call, speaker: {}.", request.display_name),
            );

        debug!("posting transcription request to {}", self.config.endpoint);
        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("Bearer {api_key}"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ScribeError::TransportSendFailed {
                message: format!("STT request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScribeError::from_stt_response(status.as_u16(), &body));
        }

        let parsed: SttResponse = response
            .json()
            .await
            .map_err(|e| ScribeError::Other(format!("STT response parse failed: {e}")))?;
        Ok(parsed.text)
    }
}

/// A scripted response for [`MockSttClient`].
pub enum MockSttResponse {
    Text(String),
    HttpError { status: u16, body: String },
}

/// Mock speech-to-text for tests: plays back scripted responses in order,
/// then repeats the last one. Records every request it receives.
#[derive(Clone, Default)]
pub struct MockSttClient {
    script: Arc<Mutex<VecDeque<MockSttResponse>>>,
    requests: Arc<Mutex<Vec<SttRequest>>>,
}

impl MockSttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer with this text.
    pub fn with_text(self, text: &str) -> Self {
        self.push(MockSttResponse::Text(text.to_string()));
        self
    }

    pub fn push(&self, response: MockSttResponse) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
    }

    /// Queue `n` HTTP failures followed by a success.
    pub fn fail_then_succeed(&self, n: usize, status: u16, body: &str, text: &str) {
        for _ in 0..n {
            self.push(MockSttResponse::HttpError {
                status,
                body: body.to_string(),
            });
        }
        self.push(MockSttResponse::Text(text.to_string()));
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<SttRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl SpeechToText for MockSttClient {
    async fn transcribe(&self, request: SttRequest) -> Result<String> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        let response = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().map(|r| match r {
                MockSttResponse::Text(t) => MockSttResponse::Text(t.clone()),
                MockSttResponse::HttpError { status, body } => MockSttResponse::HttpError {
                    status: *status,
                    body: body.clone(),
                },
            })
        };

        match response {
            Some(MockSttResponse::Text(text)) => Ok(text),
            Some(MockSttResponse::HttpError { status, body }) => {
                Err(ScribeError::from_stt_response(status, &body))
            }
            None => Ok(String::new()),
        }
    }
}
