//! Per-speaker transcription scheduling.
//!
//! Owns the speaker buffers and decides when each one is worth sending to
//! the speech-to-text backend:
//! - Ready flush once `buffer_duration_secs` of audio has accumulated
//! - Forced flush when the silence timer fires
//! - At most one request in flight per speaker; appends during a request
//!   accumulate without cancelling it
//! - Exponential-backoff retry on failure, buffer dropped at the retry cap
//! - Credential failures are terminal and never retried

use crate::config::BufferingConfig;
use crate::defaults;
use crate::error::ScribeError;
use crate::events::EventEmitter;
use crate::messages::AudioChunk;
use crate::transcription::buffer::{DrainedAudio, SpeakerBuffer};
use crate::transcription::client::{SpeechToText, SttRequest};
use crate::transcription::wav::encode_wav_i16;
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// A completed, speaker-attributed transcription.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Transcription {
    pub speaker_id: String,
    pub display_name: String,
    pub text: String,
    pub start_time_ms: i64,
    pub duration_secs: f64,
    pub stored_at_ms: i64,
}

impl Transcription {
    /// Stable identity used for deduplication by consumers.
    pub fn identity(&self) -> String {
        format!("{}-{}", self.start_time_ms, self.speaker_id)
    }
}

/// Events fanned out to transcript subscribers.
#[derive(Debug, Clone)]
pub enum TranscriptionEvent {
    Completed(Transcription),
    Failed {
        speaker_id: String,
        message: String,
        auth: bool,
    },
}

/// Internal scheduling events, delivered back into the owning loop.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// An in-flight request resolved.
    Finished {
        speaker_id: String,
        audio: DrainedAudio,
        result: crate::error::Result<String>,
    },
    /// A speaker's silence timer elapsed.
    SilenceElapsed { speaker_id: String, generation: u64 },
    /// A retry backoff elapsed.
    RetryDue { speaker_id: String },
}

/// Aggregate service counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceStats {
    pub transcriptions_sent: u64,
    pub total_duration_secs: f64,
    pub errors: u64,
}

/// Per-speaker view for the status query.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerStatus {
    pub speaker_id: String,
    pub display_name: String,
    pub buffered_samples: usize,
    pub buffered_secs: f64,
    pub in_flight: bool,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_append_ms: i64,
}

/// Full status snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStatus {
    pub stats: ServiceStats,
    pub active_speakers: usize,
    pub is_processing: bool,
    pub buffer_seconds: f64,
    pub speakers: Vec<SpeakerStatus>,
    pub history_len: usize,
}

struct SpeakerState {
    buffer: SpeakerBuffer,
    in_flight: bool,
    /// Audio drained for a failed attempt, held for the next retry.
    retry_audio: Option<DrainedAudio>,
    retry_scheduled: bool,
    retry_count: u32,
    last_error: Option<String>,
    /// Bumped on every append; stale silence timers are ignored.
    silence_generation: u64,
    /// Set when the speaker left while a request was in flight; the state
    /// is deleted once that request resolves.
    leaving: bool,
}

impl SpeakerState {
    fn new(config: &BufferingConfig) -> Self {
        Self {
            buffer: SpeakerBuffer::new(
                config.ready_samples(),
                config.max_samples(),
                config.sample_rate,
            ),
            in_flight: false,
            retry_audio: None,
            retry_scheduled: false,
            retry_count: 0,
            last_error: None,
            silence_generation: 0,
            leaving: false,
        }
    }
}

/// The transcription scheduler. Single-owner: all methods are called from
/// the service loop; background tasks communicate only through
/// [`SchedulerEvent`]s.
pub struct TranscriptionService {
    config: BufferingConfig,
    stt: Arc<dyn SpeechToText>,
    speakers: HashMap<String, SpeakerState>,
    display_names: HashMap<String, String>,
    history: VecDeque<Transcription>,
    stats: ServiceStats,
    events: EventEmitter<TranscriptionEvent>,
    scheduler_tx: mpsc::UnboundedSender<SchedulerEvent>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl TranscriptionService {
    /// Creates the service and the receiver its owner must pump
    /// [`SchedulerEvent`]s from.
    pub fn new(
        config: BufferingConfig,
        stt: Arc<dyn SpeechToText>,
    ) -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                stt,
                speakers: HashMap::new(),
                display_names: HashMap::new(),
                history: VecDeque::new(),
                stats: ServiceStats::default(),
                events: EventEmitter::new(),
                scheduler_tx,
            },
            scheduler_rx,
        )
    }

    /// Subscribable transcript/error event stream.
    pub fn events(&self) -> EventEmitter<TranscriptionEvent> {
        self.events.clone()
    }

    /// Replaces the buffering configuration; thresholds apply immediately,
    /// already-buffered audio is re-capped.
    pub fn update_config(&mut self, config: BufferingConfig) {
        for state in self.speakers.values_mut() {
            state
                .buffer
                .set_limits(config.ready_samples(), config.max_samples());
        }
        self.config = config;
    }

    /// Resolves a speaker's display name: installed mapping, or a prefix of
    /// the opaque id.
    pub fn display_name(&self, speaker_id: &str) -> String {
        if let Some(name) = self.display_names.get(speaker_id) {
            return name.clone();
        }
        let prefix: String = speaker_id
            .chars()
            .take(defaults::DISPLAY_NAME_PREFIX_LEN)
            .collect();
        format!("Speaker {prefix}")
    }

    pub fn update_speaker_mapping(&mut self, speaker_id: &str, display_name: &str) {
        self.display_names
            .insert(speaker_id.to_string(), display_name.to_string());
    }

    /// Accepts one PCM chunk. Arms the silence timer and schedules a
    /// transcription if the buffer became ready.
    pub fn append_chunk(&mut self, chunk: &AudioChunk) {
        if chunk.samples.is_empty() {
            return;
        }
        let config = self.config.clone();
        let state = self
            .speakers
            .entry(chunk.speaker_id.clone())
            .or_insert_with(|| SpeakerState::new(&config));

        state
            .buffer
            .append(&chunk.samples, chunk.capture_timestamp_ms);

        // (Re)arm the silence timer.
        state.silence_generation += 1;
        let generation = state.silence_generation;
        let speaker_id = chunk.speaker_id.clone();
        let timeout = config.silence_timeout();
        let tx = self.scheduler_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(SchedulerEvent::SilenceElapsed {
                speaker_id,
                generation,
            });
        });

        if state.buffer.is_ready() {
            self.try_dispatch(&chunk.speaker_id.clone());
        }
    }

    /// Forces a transcription of whatever is buffered. No-op while a
    /// request is in flight or a retry is pending.
    pub fn force_transcribe(&mut self, speaker_id: &str) {
        self.try_dispatch(speaker_id);
    }

    /// Handles one scheduler event. The owner loop feeds these in.
    pub fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Finished {
                speaker_id,
                audio,
                result,
            } => self.handle_finished(&speaker_id, audio, result),
            SchedulerEvent::SilenceElapsed {
                speaker_id,
                generation,
            } => {
                let stale = self
                    .speakers
                    .get(&speaker_id)
                    .is_none_or(|s| s.silence_generation != generation);
                if !stale {
                    debug!("silence timeout for {speaker_id}; forcing flush");
                    self.try_dispatch(&speaker_id);
                }
            }
            SchedulerEvent::RetryDue { speaker_id } => {
                if let Some(state) = self.speakers.get_mut(&speaker_id) {
                    state.retry_scheduled = false;
                }
                self.try_dispatch(&speaker_id);
            }
        }
    }

    /// Starts a request for the speaker if one can start now: not already
    /// in flight, no retry backoff pending, and audio available.
    fn try_dispatch(&mut self, speaker_id: &str) {
        let Some(state) = self.speakers.get_mut(speaker_id) else {
            return;
        };
        if state.in_flight || state.retry_scheduled {
            return;
        }
        let audio = match state.retry_audio.take() {
            Some(audio) => audio,
            None => match state.buffer.drain() {
                Some(audio) => audio,
                None => return,
            },
        };
        state.in_flight = true;

        let display_name = self.display_name(speaker_id);
        let wav = encode_wav_i16(&audio.samples, self.config.sample_rate);
        let stt = self.stt.clone();
        let tx = self.scheduler_tx.clone();
        let speaker = speaker_id.to_string();
        debug!(
            "dispatching {:.2}s of audio for {speaker}",
            audio.duration_secs
        );
        tokio::spawn(async move {
            let result = stt
                .transcribe(SttRequest {
                    wav,
                    display_name,
                })
                .await;
            let _ = tx.send(SchedulerEvent::Finished {
                speaker_id: speaker,
                audio,
                result,
            });
        });
    }

    fn handle_finished(
        &mut self,
        speaker_id: &str,
        audio: DrainedAudio,
        result: crate::error::Result<String>,
    ) {
        match result {
            Ok(text) => {
                if let Some(state) = self.speakers.get_mut(speaker_id) {
                    state.in_flight = false;
                    state.retry_count = 0;
                    state.last_error = None;
                }
                // Empty or whitespace-only text is a successful no-op.
                if !text.trim().is_empty() {
                    self.record_transcription(speaker_id, &audio, text.trim());
                }
                self.finish_leaving(speaker_id);
                // Audio that accumulated during the request may already be
                // ready.
                self.try_dispatch(speaker_id);
            }
            Err(e) => self.handle_failure(speaker_id, audio, e),
        }
    }

    fn record_transcription(&mut self, speaker_id: &str, audio: &DrainedAudio, text: &str) {
        let transcription = Transcription {
            speaker_id: speaker_id.to_string(),
            display_name: self.display_name(speaker_id),
            text: text.to_string(),
            start_time_ms: audio.start_time_ms,
            duration_secs: audio.duration_secs,
            stored_at_ms: now_ms(),
        };
        self.stats.transcriptions_sent += 1;
        self.stats.total_duration_secs += audio.duration_secs;

        self.history.push_back(transcription.clone());
        while self.history.len() > self.config.max_transcription_history {
            self.history.pop_front();
        }
        info!(
            "transcribed {:.2}s for {}: {:?}",
            audio.duration_secs, transcription.display_name, transcription.text
        );
        self.events
            .emit(&TranscriptionEvent::Completed(transcription));
    }

    fn handle_failure(&mut self, speaker_id: &str, audio: DrainedAudio, error: ScribeError) {
        self.stats.errors += 1;
        let auth = error.is_auth_error();
        let message = error.to_string();

        let Some(state) = self.speakers.get_mut(speaker_id) else {
            warn!("transcription failed for departed speaker {speaker_id}: {message}");
            return;
        };
        state.in_flight = false;
        state.last_error = Some(message.clone());

        if auth {
            // Terminal: no retries, surface prominently, drop the audio.
            warn!("authentication failure for {speaker_id}: {message}");
            state.buffer.clear();
            state.retry_audio = None;
            state.retry_count = 0;
            self.events.emit(&TranscriptionEvent::Failed {
                speaker_id: speaker_id.to_string(),
                message,
                auth: true,
            });
            self.finish_leaving(speaker_id);
            return;
        }

        state.retry_count += 1;
        if state.retry_count >= self.config.max_retries {
            warn!(
                "transcription for {speaker_id} failed {} times; dropping buffer",
                state.retry_count
            );
            state.buffer.clear();
            state.retry_audio = None;
            state.retry_count = 0;
            self.events.emit(&TranscriptionEvent::Failed {
                speaker_id: speaker_id.to_string(),
                message,
                auth: false,
            });
            self.finish_leaving(speaker_id);
            return;
        }

        // Keep the drained audio for the retry and back off.
        let backoff = self.config.backoff_for(state.retry_count - 1);
        debug!(
            "transcription for {speaker_id} failed (attempt {}); retrying in {backoff:?}",
            state.retry_count
        );
        state.retry_audio = Some(audio);
        state.retry_scheduled = true;
        let tx = self.scheduler_tx.clone();
        let speaker = speaker_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = tx.send(SchedulerEvent::RetryDue { speaker_id: speaker });
        });
    }

    /// Deletes a leaving speaker's state once nothing is in flight.
    fn finish_leaving(&mut self, speaker_id: &str) {
        if let Some(state) = self.speakers.get(speaker_id)
            && state.leaving
            && !state.in_flight
            && state.retry_audio.is_none()
            && state.buffer.is_empty()
        {
            self.speakers.remove(speaker_id);
            debug!("released state for departed speaker {speaker_id}");
        }
    }

    /// Final-flushes a departing speaker, then deletes its state.
    pub fn on_speaker_left(&mut self, speaker_id: &str) {
        let Some(state) = self.speakers.get_mut(speaker_id) else {
            return;
        };
        state.leaving = true;
        if !state.buffer.is_empty() && !state.in_flight && !state.retry_scheduled {
            self.try_dispatch(speaker_id);
        } else if !state.in_flight && state.retry_audio.is_none() {
            self.speakers.remove(speaker_id);
        }
        // Otherwise the in-flight request resolves first; its result is
        // still persisted, then the state is released.
    }

    /// Reconnect: every buffer and retry state clears. In-flight requests
    /// complete and their results still land in history.
    pub fn on_reconnect(&mut self) {
        info!("reconnect: clearing {} speaker buffers", self.speakers.len());
        let ids: Vec<String> = self.speakers.keys().cloned().collect();
        for id in ids {
            let Some(state) = self.speakers.get_mut(&id) else {
                continue;
            };
            state.buffer.clear();
            state.retry_audio = None;
            state.retry_count = 0;
            state.retry_scheduled = false;
            state.silence_generation += 1;
            if !state.in_flight {
                self.speakers.remove(&id);
            } else {
                // Released when the in-flight request resolves.
                state.leaving = true;
            }
        }
    }

    /// Immutable snapshot of recent transcriptions, oldest first.
    pub fn history(&self) -> Vec<Transcription> {
        self.history.iter().cloned().collect()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn stats(&self) -> &ServiceStats {
        &self.stats
    }

    /// True if any speaker has a request in flight.
    pub fn is_processing(&self) -> bool {
        self.speakers.values().any(|s| s.in_flight)
    }

    pub fn status(&self) -> ServiceStatus {
        let speakers: Vec<SpeakerStatus> = self
            .speakers
            .iter()
            .map(|(id, state)| SpeakerStatus {
                speaker_id: id.clone(),
                display_name: self.display_name(id),
                buffered_samples: state.buffer.total_samples(),
                buffered_secs: state.buffer.duration_secs(),
                in_flight: state.in_flight,
                retry_count: state.retry_count,
                last_error: state.last_error.clone(),
                last_append_ms: state.buffer.last_append_ms,
            })
            .collect();
        ServiceStatus {
            stats: self.stats.clone(),
            active_speakers: self.speakers.len(),
            is_processing: self.is_processing(),
            buffer_seconds: speakers.iter().map(|s| s.buffered_secs).sum(),
            speakers,
            history_len: self.history.len(),
        }
    }
}
