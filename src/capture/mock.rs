//! In-memory audio-graph backend for tests.

use crate::capture::{AudioGraph, AudioGraphBackend, GainControl, ProcessorKind};
use crate::discovery::MediaStream;
use crate::error::{Result, ScribeError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Gain stage whose value tests can read back.
pub struct MockGain {
    value: Mutex<f64>,
}

impl GainControl for MockGain {
    fn set_gain(&self, gain: f64) {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = gain;
    }

    fn gain(&self) -> f64 {
        *self.value.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Backend that hands out channel-fed graphs and lets tests push quanta.
#[derive(Default)]
pub struct MockGraphBackend {
    feeds: Arc<Mutex<HashMap<String, crossbeam_channel::Sender<Vec<f32>>>>>,
    gains: Mutex<HashMap<String, Arc<MockGain>>>,
    /// Remaining build attempts that fail with a transient audio error.
    fail_builds: AtomicUsize,
    /// Sample rate the backend pretends to have opened at.
    sample_rate: Mutex<u32>,
    /// When set, graphs report the main-thread fallback processor.
    fallback: std::sync::atomic::AtomicBool,
    init_calls: AtomicUsize,
}

impl MockGraphBackend {
    pub fn new() -> Arc<Self> {
        let backend = Self::default();
        *backend.sample_rate.lock().unwrap_or_else(|e| e.into_inner()) = 16000;
        Arc::new(backend)
    }

    /// Next `n` `build_graph` calls fail with [`ScribeError::AudioInit`].
    pub fn fail_builds(&self, n: usize) {
        self.fail_builds.store(n, Ordering::SeqCst);
    }

    /// Pretend the audio host refused 16kHz and opened at `rate` instead.
    pub fn set_sample_rate(&self, rate: u32) {
        *self.sample_rate.lock().unwrap_or_else(|e| e.into_inner()) = rate;
    }

    /// Pretend the real-time processor is unavailable on this host.
    pub fn set_fallback(&self, fallback: bool) {
        self.fallback.store(fallback, Ordering::SeqCst);
    }

    /// Pushes one quantum into a speaker's graph.
    pub fn feed(&self, speaker_id: &str, quantum: Vec<f32>) {
        if let Some(tx) = self
            .feeds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(speaker_id)
        {
            let _ = tx.send(quantum);
        }
    }

    /// Gain value last written to a speaker's graph, if it exists.
    pub fn gain_of(&self, speaker_id: &str) -> Option<f64> {
        self.gains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(speaker_id)
            .map(|g| g.gain())
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }
}

impl AudioGraphBackend for MockGraphBackend {
    fn initialize(&self) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn build_graph(&self, speaker_id: &str, _stream: Arc<dyn MediaStream>) -> Result<AudioGraph> {
        let remaining = self.fail_builds.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_builds.store(remaining - 1, Ordering::SeqCst);
            return Err(ScribeError::AudioInit {
                message: "simulated audio host failure".to_string(),
            });
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let gain = Arc::new(MockGain {
            value: Mutex::new(1.0),
        });
        self.feeds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(speaker_id.to_string(), tx);
        self.gains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(speaker_id.to_string(), gain.clone());

        let sample_rate = *self.sample_rate.lock().unwrap_or_else(|e| e.into_inner());
        let feeds = self.feeds.clone();
        let speaker = speaker_id.to_string();
        Ok(AudioGraph {
            quanta: rx,
            gain,
            sample_rate,
            processor_kind: if self.fallback.load(Ordering::SeqCst) {
                ProcessorKind::MainThreadFallback
            } else {
                ProcessorKind::RealTime
            },
            // Disconnects the feed so the pump sees the channel close.
            teardown: Box::new(move || {
                feeds
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&speaker);
            }),
        })
    }
}
