//! Re-blocking frame processor.
//!
//! The audio thread delivers small quanta (typically 128 samples). The
//! processor accumulates them into fixed-size frames, computes per-frame
//! peak and RMS, gates silent frames, and resamples at the edge when the
//! backend could not be opened at the target rate.

use log::warn;

/// One fixed-size frame produced by the processor.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Mono samples at the target rate, clamped to [-1, 1].
    pub samples: Vec<f32>,
    /// Peak absolute amplitude in the frame.
    pub max_sample: f32,
    /// Root-mean-square amplitude of the frame.
    pub rms: f32,
    /// Position of this frame in the session's re-blocked stream.
    pub chunk_index: u64,
    /// Capture timestamp of the frame in unix milliseconds.
    pub timestamp_ms: i64,
}

/// Accumulates audio quanta into frames of `frame_size` samples.
pub struct FrameProcessor {
    frame_size: usize,
    target_rate: u32,
    source_rate: u32,
    silence_threshold: f32,
    pending: Vec<f32>,
    chunk_index: u64,
    dropped_silent: u64,
    // Linear resampler state across quantum boundaries.
    resample_pos: f64,
    resample_prev: f32,
    rate_warned: bool,
}

impl FrameProcessor {
    pub fn new(
        frame_size: usize,
        target_rate: u32,
        source_rate: u32,
        silence_threshold: f32,
    ) -> Self {
        Self {
            frame_size,
            target_rate,
            source_rate,
            silence_threshold,
            pending: Vec::with_capacity(frame_size * 2),
            chunk_index: 0,
            dropped_silent: 0,
            resample_pos: 0.0,
            resample_prev: 0.0,
            rate_warned: false,
        }
    }

    /// Frames dropped by the silence gate so far.
    pub fn dropped_silent(&self) -> u64 {
        self.dropped_silent
    }

    /// Feeds one quantum and returns any completed, non-silent frames.
    pub fn push(&mut self, quantum: &[f32], timestamp_ms: i64) -> Vec<Frame> {
        if quantum.is_empty() {
            return Vec::new();
        }

        if self.source_rate != self.target_rate {
            if !self.rate_warned {
                warn!(
                    "audio backend runs at {}Hz; resampling to {}Hz at the edge",
                    self.source_rate, self.target_rate
                );
                self.rate_warned = true;
            }
            let resampled = self.resample(quantum);
            self.pending
                .extend(resampled.iter().map(|s| s.clamp(-1.0, 1.0)));
        } else {
            self.pending
                .extend(quantum.iter().map(|s| s.clamp(-1.0, 1.0)));
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let rest = self.pending.split_off(self.frame_size);
            let samples = std::mem::replace(&mut self.pending, rest);
            let index = self.chunk_index;
            self.chunk_index += 1;

            let max_sample = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            if max_sample < self.silence_threshold {
                // Gated at the source; never counted against any buffer.
                self.dropped_silent += 1;
                continue;
            }
            let rms = (samples.iter().map(|s| (s * s) as f64).sum::<f64>()
                / samples.len() as f64)
                .sqrt() as f32;

            frames.push(Frame {
                samples,
                max_sample,
                rms,
                chunk_index: index,
                timestamp_ms,
            });
        }
        frames
    }

    /// Linear interpolation from the source rate to the target rate, with
    /// state carried across quantum boundaries.
    fn resample(&mut self, input: &[f32]) -> Vec<f32> {
        let step = self.source_rate as f64 / self.target_rate as f64;
        let mut out = Vec::with_capacity((input.len() as f64 / step) as usize + 2);
        while self.resample_pos < input.len() as f64 {
            let idx = self.resample_pos.floor();
            let frac = (self.resample_pos - idx) as f32;
            let i = idx as isize;
            let a = if i < 0 {
                self.resample_prev
            } else {
                input[i as usize]
            };
            let b = if (i + 1) < input.len() as isize {
                input[(i + 1) as usize]
            } else {
                input[input.len() - 1]
            };
            out.push(a + (b - a) * frac);
            self.resample_pos += step;
        }
        self.resample_pos -= input.len() as f64;
        self.resample_prev = input[input.len() - 1];
        out
    }
}
