//! Per-speaker PCM accumulation with a frame-granular size cap.

use std::collections::VecDeque;

/// One appended frame: samples plus the wall-clock time of its boundary.
#[derive(Debug, Clone)]
struct BufferedFrame {
    samples: Vec<i16>,
    timestamp_ms: i64,
}

/// Drained buffer contents: a contiguous sample run and its placement.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainedAudio {
    pub samples: Vec<i16>,
    /// Earliest frame timestamp in the drained run.
    pub start_time_ms: i64,
    pub duration_secs: f64,
}

/// Append-only frame list per speaker.
///
/// The cap drops whole oldest frames, never partial ones, so the retained
/// window always starts on a frame boundary.
#[derive(Debug)]
pub struct SpeakerBuffer {
    frames: VecDeque<BufferedFrame>,
    total_samples: usize,
    ready_samples: usize,
    max_samples: usize,
    sample_rate: u32,
    /// Samples dropped by the cap since creation.
    pub dropped_samples: u64,
    /// Wall-clock milliseconds of the most recent append.
    pub last_append_ms: i64,
}

impl SpeakerBuffer {
    pub fn new(ready_samples: usize, max_samples: usize, sample_rate: u32) -> Self {
        Self {
            frames: VecDeque::new(),
            total_samples: 0,
            ready_samples,
            max_samples,
            sample_rate,
            dropped_samples: 0,
            last_append_ms: 0,
        }
    }

    /// Adjusts thresholds at runtime. Existing frames are re-capped.
    pub fn set_limits(&mut self, ready_samples: usize, max_samples: usize) {
        self.ready_samples = ready_samples;
        self.max_samples = max_samples;
        self.enforce_cap();
    }

    /// Appends one frame. Empty input is a no-op; callers must not arm the
    /// silence timer for it.
    pub fn append(&mut self, samples: &[i16], timestamp_ms: i64) {
        if samples.is_empty() {
            return;
        }
        self.total_samples += samples.len();
        self.frames.push_back(BufferedFrame {
            samples: samples.to_vec(),
            timestamp_ms,
        });
        self.last_append_ms = timestamp_ms;
        self.enforce_cap();
    }

    fn enforce_cap(&mut self) {
        while self.total_samples > self.max_samples {
            let Some(oldest) = self.frames.pop_front() else {
                break;
            };
            self.total_samples -= oldest.samples.len();
            self.dropped_samples += oldest.samples.len() as u64;
        }
    }

    /// True once enough audio has accumulated to be worth transcribing.
    pub fn is_ready(&self) -> bool {
        self.total_samples >= self.ready_samples
    }

    pub fn is_empty(&self) -> bool {
        self.total_samples == 0
    }

    pub fn total_samples(&self) -> usize {
        self.total_samples
    }

    /// Buffered audio duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.total_samples as f64 / self.sample_rate as f64
    }

    /// Removes all frames atomically, returning them as one contiguous run.
    pub fn drain(&mut self) -> Option<DrainedAudio> {
        let start_time_ms = self.frames.front()?.timestamp_ms;
        let mut samples = Vec::with_capacity(self.total_samples);
        for frame in self.frames.drain(..) {
            samples.extend_from_slice(&frame.samples);
        }
        self.total_samples = 0;
        let duration_secs = samples.len() as f64 / self.sample_rate as f64;
        Some(DrainedAudio {
            samples,
            start_time_ms,
            duration_secs,
        })
    }

    /// Discards all frames without returning them.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.total_samples = 0;
    }
}
