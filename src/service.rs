//! Service-context event loop.
//!
//! One task owns everything on the service side: it consumes capture
//! messages from the transport, feeds scheduler events back into the
//! transcription service, ticks the keep-alive while capture is active, and
//! persists the small bits of state worth surviving a reload.

use crate::config::ServiceConfig;
use crate::messages::{AudioChunk, CaptureMessage, ServiceReply};
use crate::storage::{keys, KeyValueStore};
use crate::transcription::{
    SchedulerEvent, SpeechToText, Transcription, TranscriptionEvent, TranscriptionService,
};
use log::{debug, info, warn};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// The service side of the pipeline, driven by [`ServiceLoop::run`].
pub struct ServiceLoop {
    config: ServiceConfig,
    transcription: TranscriptionService,
    scheduler_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
    inbound: mpsc::Receiver<CaptureMessage>,
    replies: mpsc::UnboundedSender<ServiceReply>,
    stt: Arc<dyn SpeechToText>,
    store: Arc<dyn KeyValueStore>,
    mappings: HashMap<String, String>,
    active_captures: HashSet<String>,
    last_sequence: Option<u64>,
    out_of_order: u64,
    persisted_sent: u64,
    initialized: bool,
}

impl ServiceLoop {
    /// Builds the loop around an inbound message receiver. Replies and
    /// completed transcriptions come back on the returned channel.
    pub fn new(
        config: ServiceConfig,
        stt: Arc<dyn SpeechToText>,
        store: Arc<dyn KeyValueStore>,
        inbound: mpsc::Receiver<CaptureMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceReply>) {
        let (replies, replies_rx) = mpsc::unbounded_channel();
        let (transcription, scheduler_rx) =
            TranscriptionService::new(config.buffering.clone(), stt.clone());

        // Completions and failures stream straight back to the capture side.
        let reply_tx = replies.clone();
        transcription.events().on(move |event| match event {
            TranscriptionEvent::Completed(t) => {
                let _ = reply_tx.send(ServiceReply::Transcription {
                    speaker_id: t.speaker_id.clone(),
                    display_name: t.display_name.clone(),
                    text: t.text.clone(),
                    start_time_ms: t.start_time_ms,
                    duration_secs: t.duration_secs,
                });
            }
            TranscriptionEvent::Failed {
                speaker_id,
                message,
                ..
            } => {
                let _ = reply_tx.send(ServiceReply::Error {
                    context: "transcription".to_string(),
                    speaker_id: Some(speaker_id.clone()),
                    message: message.clone(),
                });
            }
        });

        (
            Self {
                config,
                transcription,
                scheduler_rx,
                inbound,
                replies,
                stt,
                store,
                mappings: HashMap::new(),
                active_captures: HashSet::new(),
                last_sequence: None,
                out_of_order: 0,
                persisted_sent: 0,
                initialized: false,
            },
            replies_rx,
        )
    }

    /// Runs until the inbound channel closes.
    pub async fn run(mut self) {
        let mut keep_alive = tokio::time::interval(Duration::from_millis(
            self.config.buffering.keep_alive_interval_ms,
        ));
        keep_alive.tick().await; // the first tick is immediate

        loop {
            tokio::select! {
                message = self.inbound.recv() => {
                    match message {
                        Some(message) => self.handle_message(message).await,
                        None => break,
                    }
                }
                Some(event) = self.scheduler_rx.recv() => {
                    self.transcription.handle_event(event);
                    self.persist_history().await;
                }
                _ = keep_alive.tick(), if !self.active_captures.is_empty() => {
                    // Touching the loop is the whole point: the host runtime
                    // must see the service context stay live.
                    debug!("keep-alive tick ({} captures)", self.active_captures.len());
                }
            }
        }
        self.persist_history().await;
        debug!("inbound channel closed; service loop ending");
    }

    /// Entry point for raw JSON payloads from an untyped host boundary.
    /// Malformed payloads are logged and dropped.
    pub async fn handle_json(&mut self, payload: &str) {
        match CaptureMessage::from_json(payload) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => warn!("ignoring malformed capture message: {e}"),
        }
    }

    pub async fn handle_message(&mut self, message: CaptureMessage) {
        self.ensure_initialized().await;
        match message {
            CaptureMessage::AudioChunk(chunk) => self.handle_chunk(chunk),
            CaptureMessage::CaptureStarted { speaker_id } => {
                self.active_captures.insert(speaker_id);
            }
            CaptureMessage::CaptureStopped { speaker_id } => {
                self.active_captures.remove(&speaker_id);
            }
            CaptureMessage::SpeakerJoined {
                speaker_id,
                display_name,
            }
            | CaptureMessage::UpdateSpeakerMapping {
                speaker_id,
                display_name,
            } => {
                self.transcription
                    .update_speaker_mapping(&speaker_id, &display_name);
                self.mappings.insert(speaker_id, display_name);
                self.persist_mappings().await;
            }
            CaptureMessage::SpeakerLeft {
                speaker_id,
                display_name,
            } => {
                info!("speaker {display_name} ({speaker_id}) left");
                self.transcription.on_speaker_left(&speaker_id);
                self.active_captures.remove(&speaker_id);
            }
            CaptureMessage::Reconnect => {
                self.transcription.on_reconnect();
                self.last_sequence = None;
            }
            CaptureMessage::ForceTranscribe { speaker_id } => {
                self.transcription.force_transcribe(&speaker_id);
            }
            CaptureMessage::SetApiKey { api_key } => match self.stt.set_api_key(&api_key) {
                Ok(()) => {
                    let _ = self.store.set(keys::API_KEY, json!(api_key)).await;
                }
                Err(e) => self.reply_error("set_api_key", None, &e.to_string()),
            },
            CaptureMessage::UpdateSettings { settings } => {
                match self.config.apply_update(settings) {
                    Ok(()) => {
                        self.transcription
                            .update_config(self.config.buffering.clone());
                        if let Ok(value) = serde_json::to_value(&self.config) {
                            let _ = self.store.set(keys::SETTINGS, value).await;
                        }
                    }
                    Err(e) => self.reply_error("update_settings", None, &e.to_string()),
                }
            }
            CaptureMessage::GetStatus => self.reply_status(),
            CaptureMessage::GetHistory => {
                for t in self.transcription.history() {
                    let _ = self.replies.send(ServiceReply::Transcription {
                        speaker_id: t.speaker_id,
                        display_name: t.display_name,
                        text: t.text,
                        start_time_ms: t.start_time_ms,
                        duration_secs: t.duration_secs,
                    });
                }
            }
            CaptureMessage::ClearHistory => {
                self.transcription.clear_history();
                let _ = self.store.set(keys::TRANSCRIPTIONS, json!([])).await;
            }
        }
    }

    fn handle_chunk(&mut self, chunk: AudioChunk) {
        if let Some(last) = self.last_sequence {
            if chunk.sequence <= last {
                self.out_of_order += 1;
                warn!(
                    "out-of-order chunk for {} (sequence {} after {})",
                    chunk.speaker_id, chunk.sequence, last
                );
            } else if chunk.sequence != last + 1 {
                debug!(
                    "sequence gap before {} ({} -> {})",
                    chunk.speaker_id, last, chunk.sequence
                );
            }
        }
        self.last_sequence = Some(self.last_sequence.unwrap_or(0).max(chunk.sequence));
        self.transcription.append_chunk(&chunk);
    }

    /// Out-of-order chunk receipts observed so far.
    pub fn out_of_order_count(&self) -> u64 {
        self.out_of_order
    }

    /// Restores persisted state on the first inbound message.
    async fn ensure_initialized(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;

        if let Ok(Some(value)) = self.store.get(keys::API_KEY).await
            && let Some(key) = value.as_str()
            && let Err(e) = self.stt.set_api_key(key)
        {
            warn!("persisted API key rejected: {e}");
        }
        if let Ok(Some(value)) = self.store.get(keys::SPEAKER_MAPPINGS).await
            && let Ok(mappings) = serde_json::from_value::<HashMap<String, String>>(value)
        {
            for (speaker_id, display_name) in &mappings {
                self.transcription
                    .update_speaker_mapping(speaker_id, display_name);
            }
            self.mappings = mappings;
        }
        if let Ok(Some(value)) = self.store.get(keys::SETTINGS).await {
            match serde_json::from_value::<ServiceConfig>(value) {
                Ok(config) if config.validate().is_ok() => {
                    self.transcription.update_config(config.buffering.clone());
                    self.config = config;
                }
                _ => warn!("persisted settings invalid; keeping current configuration"),
            }
        }
        debug!("service state restored ({} mappings)", self.mappings.len());
    }

    async fn persist_mappings(&self) {
        if let Ok(value) = serde_json::to_value(&self.mappings) {
            let _ = self.store.set(keys::SPEAKER_MAPPINGS, value).await;
        }
    }

    /// Writes the history ring through the store when it grew.
    async fn persist_history(&mut self) {
        let sent = self.transcription.stats().transcriptions_sent;
        if sent == self.persisted_sent {
            return;
        }
        self.persisted_sent = sent;
        let history: Vec<Transcription> = self.transcription.history();
        if let Ok(value) = serde_json::to_value(&history) {
            let _ = self.store.set(keys::TRANSCRIPTIONS, value).await;
        }
    }

    fn reply_status(&self) {
        let status = self.transcription.status();
        let _ = self.replies.send(ServiceReply::BufferStatus {
            buffer_seconds: status.buffer_seconds,
            is_processing: status.is_processing,
            active_speakers: status.active_speakers,
            per_speaker_seconds: status
                .speakers
                .iter()
                .map(|s| (s.speaker_id.clone(), s.buffered_secs))
                .collect(),
            transcriptions_sent: status.stats.transcriptions_sent,
            total_duration_secs: status.stats.total_duration_secs,
            errors: status.stats.errors,
        });
    }

    fn reply_error(&self, context: &str, speaker_id: Option<String>, message: &str) {
        warn!("{context} failed: {message}");
        let _ = self.replies.send(ServiceReply::Error {
            context: context.to_string(),
            speaker_id,
            message: message.to_string(),
        });
    }
}

/// Spawns the service loop on the current runtime.
pub fn spawn_service(
    config: ServiceConfig,
    stt: Arc<dyn SpeechToText>,
    store: Arc<dyn KeyValueStore>,
    inbound: mpsc::Receiver<CaptureMessage>,
) -> (tokio::task::JoinHandle<()>, mpsc::UnboundedReceiver<ServiceReply>) {
    let (service, replies) = ServiceLoop::new(config, stt, store, inbound);
    (tokio::spawn(service.run()), replies)
}
