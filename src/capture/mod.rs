//! Per-speaker audio capture.
//!
//! [`CaptureEngine`] turns a discovered `(element, stream, speaker_id)` into
//! an audio graph (`source → gain → frame processor → silent sink`) built by
//! an [`AudioGraphBackend`], and pumps the graph's real-time quanta into
//! fixed-size frames for the transfer layer.

pub mod engine;
pub mod mock;
pub mod processor;

use crate::discovery::MediaStream;
use crate::error::Result;
use std::sync::Arc;

pub use engine::{CaptureEngine, CapturedFrame, VolumeSource};
pub use mock::MockGraphBackend;
pub use processor::{Frame, FrameProcessor};

/// Which frame-processor variant a graph runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    /// Preferred: callbacks on the real-time audio thread.
    RealTime,
    /// Deprecated main-thread callback path, same contract.
    MainThreadFallback,
}

/// Gain stage of one speaker's audio graph.
pub trait GainControl: Send + Sync {
    fn set_gain(&self, gain: f64);
    fn gain(&self) -> f64;
}

/// A built per-speaker audio graph.
///
/// Raw quanta arrive on `quanta` from the audio thread; dropping the graph
/// (or calling `teardown`) disconnects the feed and stops the track.
pub struct AudioGraph {
    pub quanta: crossbeam_channel::Receiver<Vec<f32>>,
    pub gain: Arc<dyn GainControl>,
    /// Rate the backend actually opened at; may differ from the target.
    pub sample_rate: u32,
    pub processor_kind: ProcessorKind,
    pub teardown: Box<dyn FnOnce() + Send>,
}

/// Host-side audio plumbing: creates and wires per-speaker graphs.
pub trait AudioGraphBackend: Send + Sync {
    /// Prepares the processing host. Called once by the engine.
    fn initialize(&self) -> Result<()>;

    /// Builds the graph for one speaker's stream.
    fn build_graph(&self, speaker_id: &str, stream: Arc<dyn MediaStream>) -> Result<AudioGraph>;
}

/// Audio-quality heuristics surfaced per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityWarning {
    /// Sustained full-scale peaks.
    Clipping,
    /// No frame passed the silence gate for an extended stretch.
    ProlongedSilence,
}

/// Why a capture session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Caller,
    TrackEnded,
    Error,
}

/// Events emitted by [`CaptureEngine`].
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    CaptureStarted { speaker_id: String },
    CaptureStopped { speaker_id: String, reason: StopReason },
    CaptureError { speaker_id: String, message: String },
    AudioQualityWarning { speaker_id: String, warning: QualityWarning },
}
