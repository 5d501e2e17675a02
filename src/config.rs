//! Runtime configuration for the capture and transcription pipeline.

use crate::defaults;
use crate::error::{Result, ScribeError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub buffering: BufferingConfig,
    pub transfer: TransferConfig,
    pub capture: CaptureConfig,
    pub discovery: DiscoveryConfig,
    pub stt: SttConfig,
}

/// Per-speaker buffering and transcription scheduling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferingConfig {
    /// Seconds of audio before a speaker becomes transcription-ready.
    pub buffer_duration_secs: f64,
    /// Hard cap on buffered audio per speaker, in seconds.
    pub max_buffer_duration_secs: f64,
    /// Milliseconds without appends before a forced flush.
    pub silence_timeout_ms: u64,
    /// Maximum transcription attempts between successes.
    pub max_retries: u32,
    /// Initial retry backoff in milliseconds.
    pub initial_backoff_ms: u64,
    /// Retry backoff ceiling in milliseconds.
    pub max_backoff_ms: u64,
    /// Transcriptions retained in the history ring.
    pub max_transcription_history: usize,
    /// Keep-alive tick interval while capture is active, in milliseconds.
    pub keep_alive_interval_ms: u64,
    /// Audio sample rate in Hz.
    pub sample_rate: u32,
}

/// Cross-context chunk transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Samples per transferred chunk.
    pub chunk_size: usize,
    /// Maximum backlog per speaker, in samples.
    pub max_pending_size: usize,
    /// Send attempts before a chunk is parked in the failed buffer.
    pub retry_attempts: u32,
    /// Base delay between send retries, in milliseconds.
    pub retry_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_backoff_ms: u64,
}

/// Per-speaker audio capture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Samples per processor frame.
    pub frame_size: usize,
    /// Peak amplitude below which frames are dropped.
    pub silence_amplitude_threshold: f32,
    /// Maximum simultaneously captured speakers.
    pub max_concurrent_captures: usize,
    /// Audio sample rate in Hz.
    pub sample_rate: u32,
    /// Delay before retrying a capture that failed transiently, in milliseconds.
    pub retry_delay_ms: u64,
}

/// Remote-audio element discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Milliseconds between media-stream attachment polls.
    pub poll_interval_ms: u64,
    /// Total attachment polling budget, in milliseconds.
    pub max_poll_time_ms: u64,
    /// Stream readiness verification timeout, in milliseconds.
    pub stream_ready_timeout_ms: u64,
    /// Maximum concurrently running stream watchers.
    pub max_active_watchers: usize,
}

/// Speech-to-text endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SttConfig {
    pub endpoint: String,
    pub model: String,
    pub language: String,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            buffer_duration_secs: defaults::BUFFER_DURATION_SECS,
            max_buffer_duration_secs: defaults::MAX_BUFFER_DURATION_SECS,
            silence_timeout_ms: defaults::SILENCE_TIMEOUT_MS,
            max_retries: defaults::MAX_RETRIES,
            initial_backoff_ms: defaults::INITIAL_BACKOFF_MS,
            max_backoff_ms: defaults::MAX_BACKOFF_MS,
            max_transcription_history: defaults::MAX_TRANSCRIPTION_HISTORY,
            keep_alive_interval_ms: defaults::KEEP_ALIVE_INTERVAL_MS,
            sample_rate: defaults::SAMPLE_RATE,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: defaults::CHUNK_SIZE,
            max_pending_size: defaults::MAX_PENDING_SIZE,
            retry_attempts: defaults::TRANSPORT_RETRY_ATTEMPTS,
            retry_delay_ms: defaults::TRANSPORT_RETRY_DELAY_MS,
            max_backoff_ms: defaults::MAX_BACKOFF_MS,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_size: defaults::FRAME_SIZE,
            silence_amplitude_threshold: defaults::SILENCE_AMPLITUDE_THRESHOLD,
            max_concurrent_captures: defaults::MAX_CONCURRENT_CAPTURES,
            sample_rate: defaults::SAMPLE_RATE,
            retry_delay_ms: defaults::CAPTURE_RETRY_DELAY_MS,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::STREAM_POLL_INTERVAL_MS,
            max_poll_time_ms: defaults::MAX_POLL_TIME_MS,
            stream_ready_timeout_ms: defaults::STREAM_READY_TIMEOUT_MS,
            max_active_watchers: defaults::MAX_CONCURRENT_CAPTURES,
        }
    }
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::STT_ENDPOINT.to_string(),
            model: defaults::STT_MODEL.to_string(),
            language: defaults::STT_LANGUAGE.to_string(),
        }
    }
}

impl BufferingConfig {
    /// Samples needed before a speaker is transcription-ready.
    pub fn ready_samples(&self) -> usize {
        (self.buffer_duration_secs * self.sample_rate as f64) as usize
    }

    /// Hard cap on buffered samples per speaker.
    pub fn max_samples(&self) -> usize {
        (self.max_buffer_duration_secs * self.sample_rate as f64) as usize
    }

    /// Silence timeout as a [`Duration`].
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    /// Backoff before attempt number `retries + 1`, capped at the ceiling.
    pub fn backoff_for(&self, retries: u32) -> Duration {
        let exp = self
            .initial_backoff_ms
            .saturating_mul(1u64 << retries.min(16));
        Duration::from_millis(exp.min(self.max_backoff_ms))
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing fields use default values; invalid TOML is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: ServiceConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, or defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: ServiceConfig = toml::from_str(&contents)?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Supported variables:
    /// - `CONFSCRIBE_STT_ENDPOINT` → stt.endpoint
    /// - `CONFSCRIBE_STT_MODEL` → stt.model
    /// - `CONFSCRIBE_STT_LANGUAGE` → stt.language
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(endpoint) = std::env::var("CONFSCRIBE_STT_ENDPOINT")
            && !endpoint.is_empty()
        {
            self.stt.endpoint = endpoint;
        }
        if let Ok(model) = std::env::var("CONFSCRIBE_STT_MODEL")
            && !model.is_empty()
        {
            self.stt.model = model;
        }
        if let Ok(language) = std::env::var("CONFSCRIBE_STT_LANGUAGE")
            && !language.is_empty()
        {
            self.stt.language = language;
        }
        self
    }

    /// Reject values that would wedge or starve the pipeline.
    pub fn validate(&self) -> Result<()> {
        fn invalid(key: &str, message: &str) -> ScribeError {
            ScribeError::ConfigInvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            }
        }

        if self.buffering.sample_rate == 0 {
            return Err(invalid("buffering.sample_rate", "must be positive"));
        }
        if self.buffering.buffer_duration_secs <= 0.0 {
            return Err(invalid("buffering.buffer_duration_secs", "must be positive"));
        }
        if self.buffering.max_buffer_duration_secs < self.buffering.buffer_duration_secs {
            return Err(invalid(
                "buffering.max_buffer_duration_secs",
                "must be at least buffer_duration_secs",
            ));
        }
        if self.transfer.chunk_size == 0 {
            return Err(invalid("transfer.chunk_size", "must be positive"));
        }
        if self.transfer.max_pending_size < self.transfer.chunk_size {
            return Err(invalid(
                "transfer.max_pending_size",
                "must be at least chunk_size",
            ));
        }
        if self.capture.frame_size == 0 {
            return Err(invalid("capture.frame_size", "must be positive"));
        }
        if self.capture.max_concurrent_captures == 0 {
            return Err(invalid(
                "capture.max_concurrent_captures",
                "must be positive",
            ));
        }
        if self.discovery.poll_interval_ms == 0 {
            return Err(invalid("discovery.poll_interval_ms", "must be positive"));
        }
        Ok(())
    }

    /// Apply a runtime settings update.
    ///
    /// Chunk sizing changes take effect on the next append; nothing already
    /// queued is re-chunked.
    pub fn apply_update(&mut self, update: SettingsUpdate) -> Result<()> {
        let mut next = self.clone();
        if let Some(v) = update.buffer_duration_secs {
            next.buffering.buffer_duration_secs = v;
        }
        if let Some(v) = update.max_buffer_duration_secs {
            next.buffering.max_buffer_duration_secs = v;
        }
        if let Some(v) = update.silence_timeout_ms {
            next.buffering.silence_timeout_ms = v;
        }
        if let Some(v) = update.max_retries {
            next.buffering.max_retries = v;
        }
        if let Some(v) = update.initial_backoff_ms {
            next.buffering.initial_backoff_ms = v;
        }
        if let Some(v) = update.max_backoff_ms {
            next.buffering.max_backoff_ms = v;
            next.transfer.max_backoff_ms = v;
        }
        if let Some(v) = update.max_transcription_history {
            next.buffering.max_transcription_history = v;
        }
        if let Some(v) = update.chunk_size {
            next.transfer.chunk_size = v;
        }
        if let Some(v) = update.max_pending_size {
            next.transfer.max_pending_size = v;
        }
        if let Some(v) = update.silence_amplitude_threshold {
            next.capture.silence_amplitude_threshold = v;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// Partial settings change carried by the `update_settings` control message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SettingsUpdate {
    pub buffer_duration_secs: Option<f64>,
    pub max_buffer_duration_secs: Option<f64>,
    pub silence_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub max_transcription_history: Option<usize>,
    pub chunk_size: Option<usize>,
    pub max_pending_size: Option<usize>,
    pub silence_amplitude_threshold: Option<f32>,
}
