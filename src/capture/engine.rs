//! Capture engine: session registry and per-session frame pumps.

use crate::capture::{
    AudioGraphBackend, CaptureEvent, Frame, FrameProcessor, GainControl, ProcessorKind,
    QualityWarning, StopReason,
};
use crate::config::CaptureConfig;
use crate::defaults;
use crate::discovery::{MediaStream, RemoteAudioElement, TrackState};
use crate::error::{Result, ScribeError};
use crate::events::EventEmitter;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Peak level treated as clipping by the quality heuristic.
const CLIPPING_PEAK: f32 = 0.99;

/// Consecutive gated frames before a prolonged-silence warning.
const SILENT_STREAK_WARN: u64 = 20;

/// How long the pump waits for a quantum before checking track state.
const PUMP_IDLE_POLL: Duration = Duration::from_millis(50);

/// A processed frame tagged with its speaker.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub speaker_id: String,
    pub frame: Frame,
}

/// Source of the host's current playback volume, in [0, 1].
pub trait VolumeSource: Send + Sync {
    fn current_volume(&self) -> f64;
}

struct Session {
    stop: Arc<AtomicBool>,
    gain: Arc<dyn GainControl>,
    teardown: Option<Box<dyn FnOnce() + Send>>,
    processor_kind: ProcessorKind,
}

/// Owns active capture sessions and routes their frames to one sink.
pub struct CaptureEngine {
    config: CaptureConfig,
    backend: Arc<dyn AudioGraphBackend>,
    frames: mpsc::UnboundedSender<CapturedFrame>,
    events: EventEmitter<CaptureEvent>,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    initialized: AtomicBool,
}

impl CaptureEngine {
    /// Frames from every session are delivered through `frames` in capture
    /// order per speaker.
    pub fn new(
        config: CaptureConfig,
        backend: Arc<dyn AudioGraphBackend>,
        frames: mpsc::UnboundedSender<CapturedFrame>,
    ) -> Self {
        Self {
            config,
            backend,
            frames,
            events: EventEmitter::new(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn events(&self) -> EventEmitter<CaptureEvent> {
        self.events.clone()
    }

    /// Prepares the audio backend. Safe to call more than once.
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.backend.initialize()?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Number of active capture sessions.
    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Processor variant in use for a speaker, if captured.
    pub fn processor_kind_of(&self, speaker_id: &str) -> Option<ProcessorKind> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(speaker_id)
            .map(|s| s.processor_kind)
    }

    /// Starts capturing a speaker's stream.
    ///
    /// Rejects duplicates, enforces the concurrent-capture limit, and
    /// requires at least one audio track. A transient audio-host failure
    /// schedules one delayed retry in the background; the error is still
    /// returned to the caller.
    pub fn capture_element(
        self: &Arc<Self>,
        element: Arc<dyn RemoteAudioElement>,
        stream: Arc<dyn MediaStream>,
        speaker_id: &str,
    ) -> Result<()> {
        self.capture_inner(element, stream, speaker_id, true)
    }

    fn capture_inner(
        self: &Arc<Self>,
        element: Arc<dyn RemoteAudioElement>,
        stream: Arc<dyn MediaStream>,
        speaker_id: &str,
        allow_retry: bool,
    ) -> Result<()> {
        self.initialize()?;

        {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if sessions.contains_key(speaker_id) {
                return Err(ScribeError::DuplicateCapture {
                    speaker_id: speaker_id.to_string(),
                });
            }
            if sessions.len() >= self.config.max_concurrent_captures {
                return Err(ScribeError::CaptureLimitReached {
                    limit: self.config.max_concurrent_captures,
                });
            }
        }
        if stream.audio_tracks().is_empty() {
            return Err(ScribeError::NoAudioTrack {
                speaker_id: speaker_id.to_string(),
            });
        }

        let graph = match self.backend.build_graph(speaker_id, stream.clone()) {
            Ok(graph) => graph,
            Err(e @ ScribeError::AudioInit { .. }) if allow_retry => {
                warn!("capture of {speaker_id} failed transiently ({e}); retrying once");
                let engine = self.clone();
                let speaker = speaker_id.to_string();
                let delay = Duration::from_millis(self.config.retry_delay_ms);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = engine.capture_inner(element, stream, &speaker, false) {
                        engine.events.emit(&CaptureEvent::CaptureError {
                            speaker_id: speaker.clone(),
                            message: e.to_string(),
                        });
                    }
                });
                return Err(e);
            }
            Err(e) => {
                self.events.emit(&CaptureEvent::CaptureError {
                    speaker_id: speaker_id.to_string(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        debug!(
            "capturing {} ({:?}, backend at {}Hz, element {})",
            speaker_id,
            graph.processor_kind,
            graph.sample_rate,
            element.element_id()
        );

        let stop = Arc::new(AtomicBool::new(false));
        let processor = FrameProcessor::new(
            self.config.frame_size,
            self.config.sample_rate,
            graph.sample_rate,
            self.config.silence_amplitude_threshold,
        );
        let pump = Pump {
            speaker_id: speaker_id.to_string(),
            quanta: graph.quanta,
            stream,
            stop: stop.clone(),
            processor,
            frames: self.frames.clone(),
            events: self.events.clone(),
            sessions: self.sessions.clone(),
        };
        // Dedicated thread: the quantum feed is a blocking channel fed by
        // the real-time audio thread.
        std::thread::spawn(move || pump.run());

        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                speaker_id.to_string(),
                Session {
                    stop,
                    gain: graph.gain,
                    teardown: Some(graph.teardown),
                    processor_kind: graph.processor_kind,
                },
            );
        self.events.emit(&CaptureEvent::CaptureStarted {
            speaker_id: speaker_id.to_string(),
        });
        Ok(())
    }

    /// Tears down one session. Returns false if none was active.
    pub fn stop_capture(&self, speaker_id: &str) -> bool {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(speaker_id);
        let Some(mut session) = session else {
            return false;
        };
        session.stop.store(true, Ordering::SeqCst);
        if let Some(teardown) = session.teardown.take() {
            teardown();
        }
        self.events.emit(&CaptureEvent::CaptureStopped {
            speaker_id: speaker_id.to_string(),
            reason: StopReason::Caller,
        });
        true
    }

    /// Stops every session; returns how many were stopped.
    pub fn stop_all(&self) -> usize {
        let speakers: Vec<String> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        speakers
            .iter()
            .filter(|speaker| self.stop_capture(speaker))
            .count()
    }

    /// Writes a clamped volume to every active gain stage.
    pub fn update_volume(&self, volume: f64) {
        let volume = volume.clamp(0.0, 1.0);
        for session in self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            session.gain.set_gain(volume);
        }
    }

    /// Spawns the low-frequency volume follower.
    ///
    /// Polls `source` at `interval` and pushes the value to active gains
    /// when it drifts more than the hysteresis threshold. The task ends
    /// when the engine is dropped.
    pub fn start_volume_follower(
        self: &Arc<Self>,
        source: Arc<dyn VolumeSource>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let engine: Weak<CaptureEngine> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut applied = 1.0f64;
            loop {
                tokio::time::sleep(interval).await;
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                let volume = source.current_volume().clamp(0.0, 1.0);
                if (volume - applied).abs() > defaults::VOLUME_HYSTERESIS {
                    engine.update_volume(volume);
                    applied = volume;
                }
            }
        })
    }
}

/// Per-session loop on its own thread: drains quanta, re-blocks, forwards
/// frames, and watches the track for end-of-life.
struct Pump {
    speaker_id: String,
    quanta: crossbeam_channel::Receiver<Vec<f32>>,
    stream: Arc<dyn MediaStream>,
    stop: Arc<AtomicBool>,
    processor: FrameProcessor,
    frames: mpsc::UnboundedSender<CapturedFrame>,
    events: EventEmitter<CaptureEvent>,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl Pump {
    fn run(mut self) {
        let mut clip_warned = false;
        let mut silence_warned = false;
        let mut silent_streak = 0u64;
        let mut last_dropped = 0u64;
        let mut was_muted = false;

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            match self.quanta.recv_timeout(PUMP_IDLE_POLL) {
                Ok(quantum) => {
                    let produced = self.processor.push(&quantum, now_ms());
                    let dropped = self.processor.dropped_silent();
                    if produced.is_empty() {
                        silent_streak += dropped - last_dropped;
                    } else {
                        silent_streak = 0;
                        silence_warned = false;
                    }
                    last_dropped = dropped;

                    if silent_streak >= SILENT_STREAK_WARN && !silence_warned {
                        silence_warned = true;
                        self.events.emit(&CaptureEvent::AudioQualityWarning {
                            speaker_id: self.speaker_id.clone(),
                            warning: QualityWarning::ProlongedSilence,
                        });
                    }
                    for frame in produced {
                        if frame.max_sample >= CLIPPING_PEAK && !clip_warned {
                            clip_warned = true;
                            self.events.emit(&CaptureEvent::AudioQualityWarning {
                                speaker_id: self.speaker_id.clone(),
                                warning: QualityWarning::Clipping,
                            });
                        }
                        if self
                            .frames
                            .send(CapturedFrame {
                                speaker_id: self.speaker_id.clone(),
                                frame,
                            })
                            .is_err()
                        {
                            // Frame sink gone; nothing left to capture for.
                            return;
                        }
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    let tracks = self.stream.audio_tracks();
                    if tracks
                        .iter()
                        .any(|t| t.ready_state() == TrackState::Ended)
                    {
                        self.stop_on_track_end();
                        return;
                    }
                    let muted = !tracks.is_empty() && tracks.iter().all(|t| t.is_muted());
                    if muted != was_muted {
                        info!(
                            "{} track {}",
                            self.speaker_id,
                            if muted { "muted" } else { "unmuted" }
                        );
                        was_muted = muted;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn stop_on_track_end(&self) {
        info!("track for {} ended; stopping capture", self.speaker_id);
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.speaker_id);
        if let Some(mut session) = session {
            session.stop.store(true, Ordering::SeqCst);
            if let Some(teardown) = session.teardown.take() {
                teardown();
            }
            self.events.emit(&CaptureEvent::CaptureStopped {
                speaker_id: self.speaker_id.clone(),
                reason: StopReason::TrackEnded,
            });
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockGraphBackend;
    use crate::discovery::{MockMediaStream, MockRemoteAudioElement};
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            frame_size: 128,
            silence_amplitude_threshold: 1e-3,
            max_concurrent_captures: 2,
            sample_rate: 16000,
            retry_delay_ms: 20,
        }
    }

    fn ready_element(id: &str) -> (Arc<MockRemoteAudioElement>, Arc<MockMediaStream>) {
        let element = MockRemoteAudioElement::new(id);
        let stream = MockMediaStream::live();
        element.attach_stream(stream.clone());
        (element, stream)
    }

    fn engine_with_backend(
        config: CaptureConfig,
    ) -> (
        Arc<CaptureEngine>,
        Arc<MockGraphBackend>,
        mpsc::UnboundedReceiver<CapturedFrame>,
    ) {
        let backend = MockGraphBackend::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(CaptureEngine::new(config, backend.clone(), tx));
        (engine, backend, rx)
    }

    #[tokio::test]
    async fn test_capture_delivers_frames() {
        let (engine, backend, mut frames) = engine_with_backend(test_config());
        let (element, stream) = ready_element("remoteAudio-ALICE");
        engine
            .capture_element(element, stream, "ALICE")
            .expect("capture");

        backend.feed("ALICE", vec![0.5f32; 128]);
        let captured = tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .expect("timely")
            .expect("frame");
        assert_eq!(captured.speaker_id, "ALICE");
        assert_eq!(captured.frame.samples.len(), 128);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (engine, backend, _frames) = engine_with_backend(test_config());
        engine.initialize().expect("init");
        engine.initialize().expect("init again");
        assert_eq!(backend.init_calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_capture_rejected() {
        let (engine, _backend, _frames) = engine_with_backend(test_config());
        let (element, stream) = ready_element("remoteAudio-A");
        engine
            .capture_element(element.clone(), stream.clone(), "A")
            .expect("first");
        let err = engine.capture_element(element, stream, "A").unwrap_err();
        assert!(matches!(err, ScribeError::DuplicateCapture { .. }));
    }

    #[tokio::test]
    async fn test_capture_limit_enforced() {
        let (engine, _backend, _frames) = engine_with_backend(test_config());
        for id in ["A", "B"] {
            let (element, stream) = ready_element(&format!("remoteAudio-{id}"));
            engine.capture_element(element, stream, id).expect("capture");
        }
        let (element, stream) = ready_element("remoteAudio-C");
        let err = engine.capture_element(element, stream, "C").unwrap_err();
        assert!(matches!(err, ScribeError::CaptureLimitReached { limit: 2 }));
    }

    #[tokio::test]
    async fn test_fallback_processor_kind_reported() {
        let (engine, backend, _frames) = engine_with_backend(test_config());
        backend.set_fallback(true);
        let (element, stream) = ready_element("remoteAudio-A");
        engine.capture_element(element, stream, "A").expect("capture");
        assert_eq!(
            engine.processor_kind_of("A"),
            Some(ProcessorKind::MainThreadFallback)
        );
    }

    #[tokio::test]
    async fn test_trackless_stream_rejected() {
        let (engine, _backend, _frames) = engine_with_backend(test_config());
        let element = MockRemoteAudioElement::new("remoteAudio-A");
        let stream = MockMediaStream::without_tracks();
        element.attach_stream(stream.clone());
        let err = engine.capture_element(element, stream, "A").unwrap_err();
        assert!(matches!(err, ScribeError::NoAudioTrack { .. }));
    }

    #[tokio::test]
    async fn test_stop_capture_is_idempotent() {
        let (engine, _backend, _frames) = engine_with_backend(test_config());
        let (element, stream) = ready_element("remoteAudio-A");
        engine.capture_element(element, stream, "A").expect("capture");

        assert!(engine.stop_capture("A"));
        assert!(!engine.stop_capture("A"));
        assert_eq!(engine.active_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_all_counts_sessions() {
        let (engine, _backend, _frames) = engine_with_backend(test_config());
        for id in ["A", "B"] {
            let (element, stream) = ready_element(&format!("remoteAudio-{id}"));
            engine.capture_element(element, stream, id).expect("capture");
        }
        assert_eq!(engine.stop_all(), 2);
        assert_eq!(engine.active_count(), 0);
    }

    #[tokio::test]
    async fn test_track_end_stops_capture() {
        let (engine, _backend, _frames) = engine_with_backend(test_config());
        let stopped = Arc::new(AtomicUsize::new(0));
        let stopped_clone = stopped.clone();
        engine.events().on(move |event| {
            if matches!(
                event,
                CaptureEvent::CaptureStopped {
                    reason: StopReason::TrackEnded,
                    ..
                }
            ) {
                stopped_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let (element, stream) = ready_element("remoteAudio-A");
        engine
            .capture_element(element, stream.clone(), "A")
            .expect("capture");
        stream.end_tracks();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(engine.active_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let (engine, backend, _frames) = engine_with_backend(test_config());
        backend.fail_builds(1);

        let (element, stream) = ready_element("remoteAudio-A");
        let err = engine.capture_element(element, stream, "A").unwrap_err();
        assert!(matches!(err, ScribeError::AudioInit { .. }));
        assert_eq!(engine.active_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.active_count(), 1);
    }

    #[tokio::test]
    async fn test_update_volume_writes_gains() {
        let (engine, backend, _frames) = engine_with_backend(test_config());
        let (element, stream) = ready_element("remoteAudio-A");
        engine.capture_element(element, stream, "A").expect("capture");

        engine.update_volume(0.4);
        assert_eq!(backend.gain_of("A"), Some(0.4));
        // Out-of-range input is clamped.
        engine.update_volume(1.7);
        assert_eq!(backend.gain_of("A"), Some(1.0));
    }

    #[tokio::test]
    async fn test_volume_follower_applies_hysteresis() {
        struct FixedVolume(Mutex<f64>);
        impl VolumeSource for FixedVolume {
            fn current_volume(&self) -> f64 {
                *self.0.lock().expect("lock")
            }
        }

        let (engine, backend, _frames) = engine_with_backend(test_config());
        let (element, stream) = ready_element("remoteAudio-A");
        engine.capture_element(element, stream, "A").expect("capture");

        let source = Arc::new(FixedVolume(Mutex::new(0.995)));
        let _follower =
            engine.start_volume_follower(source.clone(), Duration::from_millis(10));

        // Within hysteresis of the initial 1.0: no write.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(backend.gain_of("A"), Some(1.0));

        *source.0.lock().expect("lock") = 0.2;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(backend.gain_of("A"), Some(0.2));
    }

    #[tokio::test]
    async fn test_silence_gated_frames_not_delivered() {
        let (engine, backend, mut frames) = engine_with_backend(test_config());
        let (element, stream) = ready_element("remoteAudio-A");
        engine.capture_element(element, stream, "A").expect("capture");

        backend.feed("A", vec![1e-5f32; 128]);
        backend.feed("A", vec![0.5f32; 128]);

        let captured = tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .expect("timely")
            .expect("frame");
        // The silent frame was gated; only the voiced one arrives.
        assert!((captured.frame.max_sample - 0.5).abs() < 1e-6);
        assert!(frames.try_recv().is_err());
    }
}
