//! In-memory implementations of the host DOM seam, for tests and
//! development against a simulated host.

use crate::discovery::{
    AudioDom, AudioTrack, DomMutation, MediaStream, RemoteAudioElement, TrackState,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Audio track with settable state.
pub struct MockAudioTrack {
    live: AtomicBool,
    muted: AtomicBool,
}

impl MockAudioTrack {
    pub fn live() -> Arc<Self> {
        Arc::new(Self {
            live: AtomicBool::new(true),
            muted: AtomicBool::new(false),
        })
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }
}

impl AudioTrack for MockAudioTrack {
    fn ready_state(&self) -> TrackState {
        if self.live.load(Ordering::SeqCst) {
            TrackState::Live
        } else {
            TrackState::Ended
        }
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }
}

/// Media stream with settable activity and tracks.
pub struct MockMediaStream {
    active: AtomicBool,
    tracks: Mutex<Vec<Arc<MockAudioTrack>>>,
}

impl MockMediaStream {
    /// Active stream with one live unmuted track.
    pub fn live() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicBool::new(true),
            tracks: Mutex::new(vec![MockAudioTrack::live()]),
        })
    }

    /// Active stream with no audio tracks.
    pub fn without_tracks() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicBool::new(true),
            tracks: Mutex::new(Vec::new()),
        })
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn mute_tracks(&self, muted: bool) {
        for track in self.tracks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            track.set_muted(muted);
        }
    }

    pub fn end_tracks(&self) {
        for track in self.tracks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            track.set_live(false);
        }
    }
}

impl MediaStream for MockMediaStream {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn audio_tracks(&self) -> Vec<Arc<dyn AudioTrack>> {
        self.tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|t| t.clone() as Arc<dyn AudioTrack>)
            .collect()
    }
}

/// Remote-audio element whose stream can be attached later, as the host
/// does in practice.
pub struct MockRemoteAudioElement {
    element_id: String,
    stream: Mutex<Option<Arc<MockMediaStream>>>,
}

impl MockRemoteAudioElement {
    pub fn new(element_id: &str) -> Arc<Self> {
        Arc::new(Self {
            element_id: element_id.to_string(),
            stream: Mutex::new(None),
        })
    }

    pub fn attach_stream(&self, stream: Arc<MockMediaStream>) {
        *self.stream.lock().unwrap_or_else(|e| e.into_inner()) = Some(stream);
    }

    pub fn detach_stream(&self) {
        *self.stream.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl RemoteAudioElement for MockRemoteAudioElement {
    fn element_id(&self) -> String {
        self.element_id.clone()
    }

    fn media_stream(&self) -> Option<Arc<dyn MediaStream>> {
        self.stream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .map(|s| s as Arc<dyn MediaStream>)
    }
}

/// Observable container broadcasting mutations to all subscribers.
#[derive(Default)]
pub struct MockAudioDom {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DomMutation>>>,
}

impl MockAudioDom {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_element(&self, element: Arc<dyn RemoteAudioElement>) {
        self.broadcast(DomMutation::Added(element));
    }

    pub fn remove_element(&self, element_id: &str) {
        self.broadcast(DomMutation::Removed {
            element_id: element_id.to_string(),
        });
    }

    fn broadcast(&self, mutation: DomMutation) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(mutation.clone()).is_ok());
    }
}

impl AudioDom for MockAudioDom {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DomMutation> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }
}
