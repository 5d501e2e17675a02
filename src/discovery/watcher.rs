//! Stream watcher: polls one element for media-stream attachment, then
//! verifies the stream is ready for capture.
//!
//! State machine: waiting-for-stream → (attached | timeout | cancelled);
//! from attached: → (ready | failed). Each watcher resolves exactly once.

use crate::config::DiscoveryConfig;
use crate::discovery::{MediaStream, RemoteAudioElement, TrackState};
use crate::error::ScribeError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Interval of the readiness re-check, standing in for the UI render clock.
const READY_CHECK_INTERVAL_MS: u64 = 16;

/// Terminal result of one watch.
pub enum WatchOutcome {
    Ready { stream: Arc<dyn MediaStream> },
    Timeout,
    Failed(ScribeError),
}

/// Polls for stream attachment within the poll budget, then runs the
/// readiness verification.
pub async fn watch_element(
    element: Arc<dyn RemoteAudioElement>,
    config: &DiscoveryConfig,
) -> WatchOutcome {
    let speaker_hint = element.element_id();
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let deadline = Instant::now() + Duration::from_millis(config.max_poll_time_ms);

    let stream = loop {
        if let Some(stream) = element.media_stream() {
            break stream;
        }
        if Instant::now() >= deadline {
            return WatchOutcome::Timeout;
        }
        tokio::time::sleep(poll_interval).await;
    };

    match verify_ready(&stream, &speaker_hint, config).await {
        Ok(()) => WatchOutcome::Ready { stream },
        Err(e) => WatchOutcome::Failed(e),
    }
}

/// Waits until the stream is active with a live, unmuted audio track.
///
/// Fails immediately if the stream goes inactive or loses all audio
/// tracks; a track that never reaches live-and-unmuted fails with a
/// distinct readiness timeout.
async fn verify_ready(
    stream: &Arc<dyn MediaStream>,
    speaker_hint: &str,
    config: &DiscoveryConfig,
) -> crate::error::Result<()> {
    let deadline = Instant::now() + Duration::from_millis(config.stream_ready_timeout_ms);
    let check_interval = Duration::from_millis(READY_CHECK_INTERVAL_MS);

    loop {
        if !stream.is_active() {
            return Err(ScribeError::StreamInactive {
                speaker_id: speaker_hint.to_string(),
            });
        }
        let tracks = stream.audio_tracks();
        if tracks.is_empty() {
            return Err(ScribeError::NoAudioTrack {
                speaker_id: speaker_hint.to_string(),
            });
        }
        if tracks
            .iter()
            .any(|t| t.ready_state() == TrackState::Live && !t.is_muted())
        {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ScribeError::StreamNotReady {
                speaker_id: speaker_hint.to_string(),
                message: format!(
                    "no live unmuted audio track within {}ms",
                    config.stream_ready_timeout_ms
                ),
            });
        }
        tokio::time::sleep(check_interval).await;
    }
}
