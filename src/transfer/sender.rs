//! Chunked, sequenced delivery of audio frames across the context boundary.
//!
//! Accumulates encoded samples per speaker and emits fixed-size chunks:
//! - Exactly `chunk_size` samples per message while enough are pending
//! - Drop-oldest backpressure when a speaker's backlog exceeds the cap
//! - Exponential-backoff retry, then a bounded failed-chunk buffer swept
//!   when the transport recovers

use crate::config::TransferConfig;
use crate::defaults;
use crate::error::Result;
use crate::messages::{AudioChunk, CaptureMessage};
use crate::transfer::pcm::encode_i16;
use crate::transfer::transport::Transport;
use log::{debug, warn};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Aggregate transfer counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStats {
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    pub retries: u64,
    pub errors: u64,
    pub dropped_samples: u64,
    pub pending_samples: usize,
    pub failed_chunks: usize,
    /// Age of the oldest parked chunk, if any.
    pub oldest_failed_age: Option<Duration>,
}

/// Per-speaker transfer counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeakerTransferStats {
    pub chunks_sent: u64,
    pub dropped_samples: u64,
    pub pending_samples: usize,
}

struct PendingQueue {
    samples: VecDeque<i16>,
    /// Wall-clock milliseconds of the sample at the queue head.
    head_timestamp_ms: i64,
    stats: SpeakerTransferStats,
}

impl PendingQueue {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            head_timestamp_ms: 0,
            stats: SpeakerTransferStats::default(),
        }
    }
}

struct FailedChunk {
    chunk: AudioChunk,
    parked_at: Instant,
}

/// Sender half of the transfer layer, owned by the capture context.
pub struct ChunkSender {
    transport: Arc<dyn Transport>,
    config: TransferConfig,
    sample_rate: u32,
    pending: HashMap<String, PendingQueue>,
    failed: VecDeque<FailedChunk>,
    next_sequence: u64,
    stats: TransferStats,
}

impl ChunkSender {
    pub fn new(transport: Arc<dyn Transport>, config: TransferConfig, sample_rate: u32) -> Self {
        Self {
            transport,
            config,
            sample_rate,
            pending: HashMap::new(),
            failed: VecDeque::new(),
            next_sequence: 0,
            stats: TransferStats::default(),
        }
    }

    /// Replaces the transfer configuration. Takes effect on the next append.
    pub fn update_config(&mut self, config: TransferConfig) {
        self.config = config;
    }

    /// Appends a frame of Float32 samples for a speaker and sends any chunks
    /// that became complete.
    pub async fn append(
        &mut self,
        speaker_id: &str,
        samples: &[f32],
        timestamp_ms: i64,
    ) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let encoded = encode_i16(samples);
        self.enqueue(speaker_id, encoded, timestamp_ms);
        self.drain_complete_chunks(speaker_id).await
    }

    /// Appends already-encoded PCM (used when frames arrive pre-encoded).
    pub async fn append_i16(
        &mut self,
        speaker_id: &str,
        samples: Vec<i16>,
        timestamp_ms: i64,
    ) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        self.enqueue(speaker_id, samples, timestamp_ms);
        self.drain_complete_chunks(speaker_id).await
    }

    fn enqueue(&mut self, speaker_id: &str, samples: Vec<i16>, timestamp_ms: i64) {
        let max_pending = self.config.max_pending_size;
        let queue = self
            .pending
            .entry(speaker_id.to_string())
            .or_insert_with(PendingQueue::new);

        if queue.samples.is_empty() {
            queue.head_timestamp_ms = timestamp_ms;
        }

        // Drop-oldest backpressure before queueing the new samples.
        let total = queue.samples.len() + samples.len();
        if total > max_pending {
            let excess = (total - max_pending).min(queue.samples.len());
            if excess > 0 {
                queue.samples.drain(..excess);
                queue.head_timestamp_ms += Self::samples_to_ms(excess, self.sample_rate);
                queue.stats.dropped_samples += excess as u64;
                self.stats.dropped_samples += excess as u64;
                warn!(
                    "transfer backlog for {speaker_id} over {max_pending}; dropped {excess} oldest samples"
                );
            }
            // A single oversized append can still exceed the cap on its own.
            let mut samples = samples;
            if samples.len() > max_pending {
                let extra = samples.len() - max_pending;
                samples.drain(..extra);
                queue.head_timestamp_ms = timestamp_ms + Self::samples_to_ms(extra, self.sample_rate);
                queue.stats.dropped_samples += extra as u64;
                self.stats.dropped_samples += extra as u64;
            }
            queue.samples.extend(samples);
        } else {
            queue.samples.extend(samples);
        }
    }

    async fn drain_complete_chunks(&mut self, speaker_id: &str) -> Result<()> {
        loop {
            let chunk = {
                let Some(queue) = self.pending.get_mut(speaker_id) else {
                    return Ok(());
                };
                if queue.samples.len() < self.config.chunk_size {
                    self.stats.pending_samples = self.total_pending();
                    return Ok(());
                }
                let samples: Vec<i16> = queue.samples.drain(..self.config.chunk_size).collect();
                let timestamp_ms = queue.head_timestamp_ms;
                queue.head_timestamp_ms +=
                    Self::samples_to_ms(self.config.chunk_size, self.sample_rate);
                AudioChunk {
                    speaker_id: speaker_id.to_string(),
                    samples,
                    capture_timestamp_ms: timestamp_ms,
                    sample_rate: self.sample_rate,
                    sequence: 0, // assigned at send time
                }
            };
            self.send_chunk(chunk).await;
        }
    }

    /// Sends one chunk with retry; exhaustion parks it in the failed buffer.
    async fn send_chunk(&mut self, mut chunk: AudioChunk) {
        chunk.sequence = self.next_sequence;
        self.next_sequence += 1;

        let bytes = (chunk.samples.len() * 2) as u64;
        let mut attempt = 0u32;
        loop {
            match self
                .transport
                .send(CaptureMessage::AudioChunk(chunk.clone()))
                .await
            {
                Ok(()) => {
                    self.stats.chunks_sent += 1;
                    self.stats.bytes_sent += bytes;
                    if let Some(queue) = self.pending.get_mut(&chunk.speaker_id) {
                        queue.stats.chunks_sent += 1;
                    }
                    return;
                }
                Err(e) if attempt < self.config.retry_attempts => {
                    self.stats.retries += 1;
                    let delay = self
                        .config
                        .retry_delay_ms
                        .saturating_mul(1 << attempt.min(16))
                        .min(self.config.max_backoff_ms);
                    debug!(
                        "transport send failed for {} (attempt {}): {e}; retrying in {delay}ms",
                        chunk.speaker_id,
                        attempt + 1
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.stats.errors += 1;
                    warn!(
                        "transport send for {} exhausted {} retries: {e}; parking chunk",
                        chunk.speaker_id, self.config.retry_attempts
                    );
                    self.park_failed(chunk);
                    return;
                }
            }
        }
    }

    fn park_failed(&mut self, chunk: AudioChunk) {
        if self.failed.len() >= defaults::MAX_FAILED_CHUNKS {
            // Drop the oldest half to make room.
            let drop_count = self.failed.len() / 2;
            self.failed.drain(..drop_count);
            warn!("failed-chunk buffer full; discarded {drop_count} oldest entries");
        }
        self.failed.push_back(FailedChunk {
            chunk,
            parked_at: Instant::now(),
        });
    }

    /// Retries parked chunks if the transport is valid again.
    ///
    /// Entries older than the maximum age are discarded. Chunks that fail
    /// again go back to the end of the buffer with their original park time.
    pub async fn sweep_failed(&mut self) {
        let max_age = Duration::from_secs(defaults::FAILED_CHUNK_MAX_AGE_SECS);
        let now = Instant::now();
        self.failed
            .retain(|entry| now.duration_since(entry.parked_at) <= max_age);

        if self.failed.is_empty() || !self.transport.is_valid() {
            return;
        }

        let mut requeue = VecDeque::new();
        while let Some(entry) = self.failed.pop_front() {
            match self
                .transport
                .send(CaptureMessage::AudioChunk(entry.chunk.clone()))
                .await
            {
                Ok(()) => {
                    self.stats.chunks_sent += 1;
                    self.stats.bytes_sent += (entry.chunk.samples.len() * 2) as u64;
                }
                Err(_) => {
                    requeue.push_back(entry);
                }
            }
        }
        self.failed = requeue;
    }

    /// Pads a speaker's partial chunk with zeros to full size and sends it
    /// once, without retry amplification.
    pub async fn flush(&mut self, speaker_id: &str) -> Result<()> {
        // A runtime chunk-size decrease can leave a backlog of more than one
        // chunk; emit the full chunks first so padding never truncates.
        self.drain_complete_chunks(speaker_id).await?;
        let chunk = {
            let Some(queue) = self.pending.get_mut(speaker_id) else {
                return Ok(());
            };
            if queue.samples.is_empty() {
                return Ok(());
            }
            let mut samples: Vec<i16> = queue.samples.drain(..).collect();
            samples.resize(self.config.chunk_size, 0);
            AudioChunk {
                speaker_id: speaker_id.to_string(),
                samples,
                capture_timestamp_ms: queue.head_timestamp_ms,
                sample_rate: self.sample_rate,
                sequence: 0,
            }
        };
        self.send_chunk(chunk).await;
        self.stats.pending_samples = self.total_pending();
        Ok(())
    }

    /// Flushes every speaker and makes one retry pass over parked chunks.
    pub async fn flush_all(&mut self) -> Result<()> {
        let speakers: Vec<String> = self.pending.keys().cloned().collect();
        for speaker_id in speakers {
            self.flush(&speaker_id).await?;
        }
        self.sweep_failed().await;
        Ok(())
    }

    /// Discards a speaker's backlog without sending.
    pub fn drop_speaker(&mut self, speaker_id: &str) {
        self.pending.remove(speaker_id);
        self.stats.pending_samples = self.total_pending();
    }

    pub fn stats(&self) -> TransferStats {
        let mut stats = self.stats.clone();
        stats.pending_samples = self.total_pending();
        stats.failed_chunks = self.failed.len();
        stats.oldest_failed_age = self
            .failed
            .front()
            .map(|entry| entry.parked_at.elapsed());
        stats
    }

    pub fn speaker_stats(&self, speaker_id: &str) -> Option<SpeakerTransferStats> {
        self.pending.get(speaker_id).map(|queue| {
            let mut stats = queue.stats.clone();
            stats.pending_samples = queue.samples.len();
            stats
        })
    }

    fn total_pending(&self) -> usize {
        self.pending.values().map(|q| q.samples.len()).sum()
    }

    fn samples_to_ms(samples: usize, sample_rate: u32) -> i64 {
        (samples as i64 * 1000) / sample_rate as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::transport::MockTransport;

    fn small_config() -> TransferConfig {
        TransferConfig {
            chunk_size: 8,
            max_pending_size: 16,
            retry_attempts: 2,
            retry_delay_ms: 1,
            max_backoff_ms: 10,
        }
    }

    fn sender_with(transport: &MockTransport, config: TransferConfig) -> ChunkSender {
        ChunkSender::new(Arc::new(transport.clone()), config, 16000)
    }

    #[tokio::test]
    async fn test_no_chunk_below_chunk_size() {
        let transport = MockTransport::new();
        let mut sender = sender_with(&transport, small_config());

        sender
            .append("A", &[0.1f32; 7], 0)
            .await
            .expect("append");
        assert!(transport.sent_chunks("A").is_empty());
        assert_eq!(sender.stats().pending_samples, 7);
    }

    #[tokio::test]
    async fn test_emits_exact_chunk_size() {
        let transport = MockTransport::new();
        let mut sender = sender_with(&transport, small_config());

        sender
            .append("A", &[0.1f32; 10], 0)
            .await
            .expect("append");
        let chunks = transport.sent_chunks("A");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].samples.len(), 8);
        assert_eq!(sender.stats().pending_samples, 2);
    }

    #[tokio::test]
    async fn test_chunking_preserves_order_and_content() {
        let transport = MockTransport::new();
        let mut sender = sender_with(&transport, small_config());

        // Distinct ascending values survive encode (small positive floats)
        let input: Vec<f32> = (1..=16).map(|i| i as f32 / 100.0).collect();
        sender.append("A", &input, 0).await.expect("append");

        let chunks = transport.sent_chunks("A");
        assert_eq!(chunks.len(), 2);
        let rejoined: Vec<i16> = chunks
            .iter()
            .flat_map(|c| c.samples.iter().copied())
            .collect();
        assert_eq!(rejoined, encode_i16(&input));
        assert!(chunks[0].sequence < chunks[1].sequence);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let transport = MockTransport::new();
        // Large chunk size so nothing is emitted; cap at 16 samples.
        let config = TransferConfig {
            chunk_size: 100,
            max_pending_size: 16,
            ..small_config()
        };
        let mut sender = sender_with(&transport, config);

        let first: Vec<f32> = (0..16).map(|i| i as f32 / 100.0).collect();
        sender.append("A", &first, 0).await.expect("append");
        // 16 more: all 16 old samples must be dropped.
        let second: Vec<f32> = (16..32).map(|i| i as f32 / 100.0).collect();
        sender.append("A", &second, 1000).await.expect("append");

        assert_eq!(sender.stats().dropped_samples, 16);
        assert_eq!(sender.stats().pending_samples, 16);
        sender.flush("A").await.expect("flush");
        let chunks = transport.sent_chunks("A");
        assert_eq!(chunks.len(), 1);
        // The surviving prefix is the most recent window.
        assert_eq!(chunks[0].samples[..16].to_vec(), encode_i16(&second));
    }

    #[tokio::test]
    async fn test_single_oversized_append_keeps_most_recent_window() {
        let transport = MockTransport::new();
        let config = TransferConfig {
            chunk_size: 100,
            max_pending_size: 16,
            ..small_config()
        };
        let mut sender = sender_with(&transport, config);

        let burst: Vec<f32> = (0..32).map(|i| i as f32 / 100.0).collect();
        sender.append("A", &burst, 0).await.expect("append");

        assert_eq!(sender.stats().dropped_samples, 16);
        assert_eq!(sender.stats().pending_samples, 16);
        sender.flush("A").await.expect("flush");
        let chunks = transport.sent_chunks("A");
        assert_eq!(chunks[0].samples[..16].to_vec(), encode_i16(&burst[16..]));
    }

    #[tokio::test]
    async fn test_flush_pads_partial_chunk() {
        let transport = MockTransport::new();
        let mut sender = sender_with(&transport, small_config());

        sender.append("A", &[0.5f32; 3], 42).await.expect("append");
        sender.flush("A").await.expect("flush");

        let chunks = transport.sent_chunks("A");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].samples.len(), 8);
        assert_eq!(chunks[0].capture_timestamp_ms, 42);
        assert!(chunks[0].samples[3..].iter().all(|&s| s == 0));
    }

    #[tokio::test]
    async fn test_flush_after_chunk_size_decrease_keeps_all_samples() {
        let transport = MockTransport::new();
        let mut sender = sender_with(&transport, small_config());

        // Backlog accumulated under chunk_size 8, then shrunk to 4.
        let input: Vec<f32> = (1..=6).map(|i| i as f32 / 100.0).collect();
        sender.append("A", &input, 0).await.expect("append");
        sender.update_config(TransferConfig {
            chunk_size: 4,
            ..small_config()
        });
        sender.flush("A").await.expect("flush");

        let chunks = transport.sent_chunks("A");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].samples.len(), 4);
        assert_eq!(chunks[1].samples.len(), 4);
        let rejoined: Vec<i16> = chunks
            .iter()
            .flat_map(|c| c.samples.iter().copied())
            .collect();
        assert_eq!(rejoined[..6].to_vec(), encode_i16(&input));
        assert!(rejoined[6..].iter().all(|&s| s == 0));
        assert_eq!(sender.stats().dropped_samples, 0);
        assert_eq!(sender.stats().pending_samples, 0);
    }

    #[tokio::test]
    async fn test_flush_empty_speaker_is_noop() {
        let transport = MockTransport::new();
        let mut sender = sender_with(&transport, small_config());
        sender.flush("ghost").await.expect("flush");
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let transport = MockTransport::new();
        let mut sender = sender_with(&transport, small_config());
        transport.fail_next(1);

        sender.append("A", &[0.1f32; 8], 0).await.expect("append");
        assert_eq!(transport.sent_chunks("A").len(), 1);
        assert_eq!(sender.stats().retries, 1);
        assert_eq!(sender.stats().errors, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_park_chunk() {
        let transport = MockTransport::new();
        let mut sender = sender_with(&transport, small_config());
        // retry_attempts = 2, so 3 total sends fail.
        transport.fail_next(3);

        sender.append("A", &[0.1f32; 8], 0).await.expect("append");
        assert!(transport.sent_chunks("A").is_empty());
        assert_eq!(sender.stats().errors, 1);
        assert_eq!(sender.stats().failed_chunks, 1);

        // Sweep delivers the parked chunk once the transport recovers.
        sender.sweep_failed().await;
        assert_eq!(transport.sent_chunks("A").len(), 1);
        assert_eq!(sender.stats().failed_chunks, 0);
    }

    #[tokio::test]
    async fn test_sweep_skips_invalid_transport() {
        let transport = MockTransport::new();
        let mut sender = sender_with(&transport, small_config());
        transport.fail_next(3);
        sender.append("A", &[0.1f32; 8], 0).await.expect("append");

        transport.set_invalid(true);
        sender.sweep_failed().await;
        assert_eq!(sender.stats().failed_chunks, 1);
    }

    #[tokio::test]
    async fn test_sequences_are_process_monotonic_across_speakers() {
        let transport = MockTransport::new();
        let mut sender = sender_with(&transport, small_config());

        sender.append("A", &[0.1f32; 8], 0).await.expect("append");
        sender.append("B", &[0.1f32; 8], 0).await.expect("append");
        sender.append("A", &[0.1f32; 8], 0).await.expect("append");

        let sequences: Vec<u64> = transport
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                CaptureMessage::AudioChunk(c) => Some(c.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_empty_append_is_noop() {
        let transport = MockTransport::new();
        let mut sender = sender_with(&transport, small_config());
        sender.append("A", &[], 0).await.expect("append");
        assert_eq!(sender.stats().pending_samples, 0);
        assert!(sender.speaker_stats("A").is_none());
    }
}
