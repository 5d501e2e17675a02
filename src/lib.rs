//! confscribe - Per-speaker capture and transcription for conference audio
//!
//! Watches a host conferencing page for remote-audio elements, captures each
//! speaker's stream as 16kHz mono PCM, ships it across the context boundary
//! in sequenced chunks, and turns buffered speech into speaker-attributed
//! transcripts through an HTTP speech-to-text backend.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod capture;
pub mod config;
pub mod defaults;
pub mod discovery;
pub mod error;
pub mod events;
pub mod host;
pub mod messages;
pub mod service;
pub mod storage;
pub mod transcription;
pub mod transfer;

// Core pipeline seams (host → discovery → capture → transfer → transcription)
pub use capture::{AudioGraphBackend, CaptureEngine, CapturedFrame, VolumeSource};
pub use discovery::{AudioDom, ElementDiscovery, MediaStream, RemoteAudioElement};
pub use host::{HostBridge, HostPage, SessionState};
pub use transcription::{SpeechToText, TranscriptionService};
pub use transfer::{ChunkSender, Transport};

// Service loop and wire protocol
pub use messages::{AudioChunk, CaptureMessage, ServiceReply};
pub use service::{spawn_service, ServiceLoop};
pub use storage::{KeyValueStore, MemoryStore};

// Error handling
pub use error::{Result, ScribeError};

// Config
pub use config::{ServiceConfig, SettingsUpdate};

// Events
pub use events::{EventEmitter, SubscriptionId};
