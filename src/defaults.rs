//! Default configuration constants for confscribe.
//!
//! Shared constants used across the component configuration types to keep
//! the pipeline stages in agreement about rates and sizes.

/// Target audio sample rate in Hz.
///
/// 16kHz is the standard rate for speech recognition; every stage downstream
/// of the capture engine assumes frames at this rate.
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per frame emitted by the frame processor.
///
/// The audio thread delivers ~128-sample quanta; the processor re-blocks
/// them into frames of this size (256ms at 16kHz).
pub const FRAME_SIZE: usize = 4096;

/// Samples per chunk transferred across the context boundary.
///
/// 16384 samples is roughly one second of audio at 16kHz.
pub const CHUNK_SIZE: usize = 16384;

/// Maximum samples a speaker's transfer backlog may hold (~10s at 16kHz).
///
/// When exceeded, the oldest samples are dropped first.
pub const MAX_PENDING_SIZE: usize = 163_840;

/// Seconds of buffered audio before a speaker becomes transcription-ready.
pub const BUFFER_DURATION_SECS: f64 = 1.5;

/// Hard cap on buffered audio per speaker, in seconds.
pub const MAX_BUFFER_DURATION_SECS: f64 = 30.0;

/// Milliseconds without new audio before a speaker's buffer is force-flushed.
pub const SILENCE_TIMEOUT_MS: u64 = 2000;

/// Peak amplitude below which a frame is considered silent and dropped.
pub const SILENCE_AMPLITUDE_THRESHOLD: f32 = 1e-3;

/// Maximum transcription attempts per speaker between successes.
pub const MAX_RETRIES: u32 = 5;

/// Initial transcription retry backoff in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1000;

/// Backoff ceiling in milliseconds, for both transcription and transport.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Maximum transcriptions retained in the history ring.
pub const MAX_TRANSCRIPTION_HISTORY: usize = 1000;

/// Interval of the keep-alive tick while capture is active, in milliseconds.
pub const KEEP_ALIVE_INTERVAL_MS: u64 = 20_000;

/// Maximum simultaneously captured speakers.
pub const MAX_CONCURRENT_CAPTURES: usize = 50;

/// Interval at which a stream watcher polls for media-stream attachment.
pub const STREAM_POLL_INTERVAL_MS: u64 = 50;

/// Total budget for media-stream attachment polling, in milliseconds.
pub const MAX_POLL_TIME_MS: u64 = 5000;

/// Timeout for the stream readiness verification, in milliseconds.
pub const STREAM_READY_TIMEOUT_MS: u64 = 5000;

/// Transport send attempts before a chunk is parked in the failed buffer.
pub const TRANSPORT_RETRY_ATTEMPTS: u32 = 3;

/// Base delay between transport send retries, in milliseconds.
pub const TRANSPORT_RETRY_DELAY_MS: u64 = 500;

/// Maximum chunks held in the failed-chunk buffer.
pub const MAX_FAILED_CHUNKS: usize = 100;

/// Failed chunks older than this are discarded by the retry sweep.
pub const FAILED_CHUNK_MAX_AGE_SECS: u64 = 60;

/// Interval of the failed-chunk retry sweep, in milliseconds.
pub const FAILED_CHUNK_SWEEP_INTERVAL_MS: u64 = 5000;

/// Volume difference below which gain updates are suppressed.
pub const VOLUME_HYSTERESIS: f64 = 0.01;

/// Interval of the host-volume follower task, in milliseconds.
pub const VOLUME_POLL_INTERVAL_MS: u64 = 1000;

/// Delay before retrying a capture that failed with a transient audio error.
pub const CAPTURE_RETRY_DELAY_MS: u64 = 2000;

/// Default speech-to-text endpoint.
pub const STT_ENDPOINT: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Default speech-to-text model identifier.
pub const STT_MODEL: &str = "whisper-1";

/// Default transcription language code.
pub const STT_LANGUAGE: &str = "en";

/// Number of leading speaker-id characters used for the fallback display name.
pub const DISPLAY_NAME_PREFIX_LEN: usize = 6;
