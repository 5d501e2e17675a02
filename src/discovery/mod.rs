//! Discovery of remote-audio elements and their media streams.
//!
//! The host DOM is reached only through the seam traits here, so the
//! pipeline can run against the real host or the in-memory mocks.

pub mod mock;
pub mod watcher;

use crate::config::DiscoveryConfig;
use crate::events::EventEmitter;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use mock::{MockAudioDom, MockAudioTrack, MockMediaStream, MockRemoteAudioElement};
pub use watcher::{WatchOutcome, watch_element};

/// Playback state of an audio track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

/// One audio track of a media stream.
pub trait AudioTrack: Send + Sync {
    fn ready_state(&self) -> TrackState;
    fn is_muted(&self) -> bool;
}

/// A host media stream: active flag plus its audio tracks.
pub trait MediaStream: Send + Sync {
    fn is_active(&self) -> bool;
    fn audio_tracks(&self) -> Vec<Arc<dyn AudioTrack>>;
}

/// A remote-audio element in the host DOM.
pub trait RemoteAudioElement: Send + Sync {
    /// The element's id attribute, e.g. `remoteAudio-ALICE01`.
    fn element_id(&self) -> String;
    /// The attached media stream, once the host wires it up.
    fn media_stream(&self) -> Option<Arc<dyn MediaStream>>;
}

/// Mutations observed on the host container, at any depth.
#[derive(Clone)]
pub enum DomMutation {
    Added(Arc<dyn RemoteAudioElement>),
    Removed { element_id: String },
}

/// Observable host DOM container.
pub trait AudioDom: Send + Sync {
    /// Subscribes to child additions/removals.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DomMutation>;
}

/// Events produced by [`ElementDiscovery`].
#[derive(Clone)]
pub enum DiscoveryEvent {
    /// Stream attached and verified ready for capture.
    StreamReady {
        speaker_id: String,
        element: Arc<dyn RemoteAudioElement>,
        stream: Arc<dyn MediaStream>,
    },
    /// The element left the DOM; any in-flight watcher was cancelled.
    Removed { speaker_id: String },
    /// No stream attached within the poll budget.
    Timeout { speaker_id: String },
    /// Stream attached but failed the readiness check.
    StreamFailed { speaker_id: String, message: String },
}

/// Watches the host DOM for remote-audio elements keyed by speaker id.
///
/// Each matching element gets one independent watcher; terminal watcher
/// states emit exactly one event.
pub struct ElementDiscovery {
    config: DiscoveryConfig,
    prefix: String,
    events: EventEmitter<DiscoveryEvent>,
    watchers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl ElementDiscovery {
    /// `prefix` is the token preceding the speaker id in element ids,
    /// including any separator (e.g. `remoteAudio-`).
    pub fn new(prefix: &str, config: DiscoveryConfig) -> Self {
        Self {
            config,
            prefix: prefix.to_string(),
            events: EventEmitter::new(),
            watchers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn events(&self) -> EventEmitter<DiscoveryEvent> {
        self.events.clone()
    }

    /// Extracts the speaker id from a matching element id.
    pub fn speaker_id_of(&self, element_id: &str) -> Option<String> {
        let rest = element_id.strip_prefix(&self.prefix)?;
        if rest.is_empty() {
            return None;
        }
        Some(rest.to_string())
    }

    /// Number of watchers currently waiting on a stream.
    pub fn active_watchers(&self) -> usize {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        watchers.retain(|_, handle| !handle.is_finished());
        watchers.len()
    }

    /// Consumes DOM mutations until the subscription closes.
    pub fn run(self: Arc<Self>, dom: Arc<dyn AudioDom>) -> JoinHandle<()> {
        let mut mutations = dom.subscribe();
        tokio::spawn(async move {
            while let Some(mutation) = mutations.recv().await {
                match mutation {
                    DomMutation::Added(element) => self.on_added(element),
                    DomMutation::Removed { element_id } => self.on_removed(&element_id),
                }
            }
            debug!("dom subscription closed; discovery loop ending");
        })
    }

    fn on_added(&self, element: Arc<dyn RemoteAudioElement>) {
        let element_id = element.element_id();
        let Some(speaker_id) = self.speaker_id_of(&element_id) else {
            return;
        };

        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        watchers.retain(|_, handle| !handle.is_finished());
        if watchers.contains_key(&speaker_id) {
            warn!("duplicate watcher for {speaker_id} rejected");
            return;
        }
        if watchers.len() >= self.config.max_active_watchers {
            warn!(
                "watcher limit {} reached; ignoring element {element_id}",
                self.config.max_active_watchers
            );
            return;
        }

        debug!("watching {element_id} for stream attachment");
        let config = self.config.clone();
        let events = self.events.clone();
        let speaker = speaker_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = watch_element(element.clone(), &config).await;
            match outcome {
                WatchOutcome::Ready { stream } => events.emit(&DiscoveryEvent::StreamReady {
                    speaker_id: speaker,
                    element,
                    stream,
                }),
                WatchOutcome::Timeout => {
                    events.emit(&DiscoveryEvent::Timeout { speaker_id: speaker })
                }
                WatchOutcome::Failed(error) => events.emit(&DiscoveryEvent::StreamFailed {
                    speaker_id: speaker,
                    message: error.to_string(),
                }),
            }
        });
        watchers.insert(speaker_id, handle);
    }

    fn on_removed(&self, element_id: &str) {
        let Some(speaker_id) = self.speaker_id_of(element_id) else {
            return;
        };
        if let Some(handle) = self
            .watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&speaker_id)
        {
            // Cancelled watchers never emit a stream callback.
            handle.abort();
        }
        self.events
            .emit(&DiscoveryEvent::Removed { speaker_id });
    }
}
