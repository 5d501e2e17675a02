//! Transcription service: per-speaker buffering, scheduling, and dispatch
//! to the speech-to-text backend.

pub mod buffer;
pub mod client;
pub mod service;
pub mod wav;

pub use buffer::{DrainedAudio, SpeakerBuffer};
pub use client::{HttpSttClient, MockSttClient, MockSttResponse, SpeechToText, SttRequest};
pub use service::{
    SchedulerEvent, ServiceStats, ServiceStatus, SpeakerStatus, Transcription,
    TranscriptionEvent, TranscriptionService,
};
pub use wav::{encode_wav, encode_wav_i16};
