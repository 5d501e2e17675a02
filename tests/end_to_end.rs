//! Full-pipeline scenarios over the in-memory mocks: host DOM, audio graph,
//! channel transport, and scripted speech-to-text.

use confscribe::capture::{CaptureEngine, MockGraphBackend};
use confscribe::config::ServiceConfig;
use confscribe::defaults;
use confscribe::discovery::{
    DiscoveryEvent, ElementDiscovery, MockAudioDom, MockMediaStream, MockRemoteAudioElement,
};
use confscribe::host::{HostBridge, MockHostPage};
use confscribe::messages::{CaptureMessage, ServiceReply};
use confscribe::service::spawn_service;
use confscribe::storage::MemoryStore;
use confscribe::transcription::{MockSttClient, MockSttResponse, SpeakerBuffer};
use confscribe::transfer::{ChannelTransport, ChunkSender, MockTransport, Transport};
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Scaled-down config: 4000-sample frames and 16000-sample chunks divide a
/// two-second utterance evenly, so dispatched audio lengths are exact.
///
/// Run with `RUST_LOG=confscribe=debug` to watch the pipeline.
fn test_config() -> ServiceConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = ServiceConfig::default();
    config.capture.frame_size = 4000;
    config.capture.max_concurrent_captures = 4;
    config.transfer.chunk_size = 16000;
    config.transfer.retry_delay_ms = 1;
    config.buffering.buffer_duration_secs = 2.0;
    config.buffering.silence_timeout_ms = 500;
    config.buffering.initial_backoff_ms = 10;
    config.buffering.max_backoff_ms = 100;
    config.discovery.poll_interval_ms = 5;
    config.discovery.max_poll_time_ms = 500;
    config.discovery.stream_ready_timeout_ms = 500;
    config
}

/// 440Hz sine at the given amplitude, 16kHz mono.
fn sine(seconds: f64, amplitude: f32) -> Vec<f32> {
    let samples = (seconds * 16000.0) as usize;
    (0..samples)
        .map(|i| amplitude * (TAU * 440.0 * i as f32 / 16000.0).sin())
        .collect()
}

async fn recv_reply(replies: &mut mpsc::UnboundedReceiver<ServiceReply>) -> ServiceReply {
    tokio::time::timeout(Duration::from_secs(5), replies.recv())
        .await
        .expect("reply within deadline")
        .expect("replies channel open")
}

/// An element appears after startup, its stream goes live, two seconds
/// of tone flow through discovery, capture, transfer, and transcription.
#[tokio::test]
async fn cold_start_to_first_transcription() {
    let config = test_config();
    let stt = MockSttClient::new().with_text("hello from alice");
    let store = Arc::new(MemoryStore::new());

    let (transport, service_rx) = ChannelTransport::new(64);
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let (_service, mut replies) =
        spawn_service(config.clone(), Arc::new(stt.clone()), store, service_rx);

    let backend = MockGraphBackend::new();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(CaptureEngine::new(
        config.capture.clone(),
        backend.clone(),
        frame_tx,
    ));

    // The host page must look valid before anything else starts.
    let page = MockHostPage::new();
    let bridge = Arc::new(HostBridge::new(page));
    bridge
        .wait_for_ready(10, Duration::from_millis(5))
        .await
        .expect("host ready");
    let _follower = engine.start_volume_follower(
        bridge.clone(),
        Duration::from_millis(defaults::VOLUME_POLL_INTERVAL_MS),
    );

    // Capture-side glue: frames into the chunk sender, with the periodic
    // retry sweep over parked chunks.
    let mut sender = ChunkSender::new(transport, config.transfer.clone(), 16000);
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(Duration::from_millis(
            defaults::FAILED_CHUNK_SWEEP_INTERVAL_MS,
        ));
        loop {
            tokio::select! {
                captured = frame_rx.recv() => {
                    let Some(captured) = captured else { break };
                    let _ = sender
                        .append(
                            &captured.speaker_id,
                            &captured.frame.samples,
                            captured.frame.timestamp_ms,
                        )
                        .await;
                }
                _ = sweep.tick() => sender.sweep_failed().await,
            }
        }
    });

    // Discovery feeds ready streams straight into the engine.
    let discovery = Arc::new(ElementDiscovery::new(
        "remoteAudio-",
        config.discovery.clone(),
    ));
    let engine_clone = engine.clone();
    discovery.events().on(move |event| {
        if let DiscoveryEvent::StreamReady {
            speaker_id,
            element,
            stream,
        } = event
        {
            engine_clone
                .capture_element(element.clone(), stream.clone(), speaker_id)
                .expect("capture starts");
        }
    });
    let dom = Arc::new(MockAudioDom::new());
    let _discovery_loop = discovery.clone().run(dom.clone());

    // Nothing exists yet; the element arrives later, its stream later still.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let element = MockRemoteAudioElement::new("remoteAudio-ALICE01");
    dom.add_element(element.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    element.attach_stream(MockMediaStream::live());

    // Wait for the capture to start, then feed the tone in audio quanta.
    for _ in 0..100 {
        if engine.active_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.active_count(), 1);

    for quantum in sine(2.0, 0.3).chunks(128) {
        backend.feed("ALICE01", quantum.to_vec());
    }

    match recv_reply(&mut replies).await {
        ServiceReply::Transcription {
            speaker_id,
            text,
            duration_secs,
            ..
        } => {
            assert_eq!(speaker_id, "ALICE01");
            assert_eq!(text, "hello from alice");
            assert!((duration_secs - 2.0).abs() < 1e-9);
        }
        other => panic!("unexpected reply {other:?}"),
    }
    // Exactly one dispatch, with the full 2s WAV: 44 + 2 * 32000 bytes.
    assert_eq!(stt.request_count(), 1);
    assert_eq!(stt.requests()[0].wav.len(), 64044);
}

/// One second of audio, then nothing. The silence timer flushes it once
/// even though the readiness threshold was never reached.
#[tokio::test]
async fn silence_flush_dispatches_once() {
    let mut config = test_config();
    config.buffering.silence_timeout_ms = 100;
    let stt = MockSttClient::new().with_text("short utterance");
    let store = Arc::new(MemoryStore::new());

    let (tx, rx) = mpsc::channel(16);
    let (_service, mut replies) = spawn_service(config, Arc::new(stt.clone()), store, rx);

    tx.send(CaptureMessage::AudioChunk(confscribe::messages::AudioChunk {
        speaker_id: "BOB".to_string(),
        samples: vec![3000i16; 16000],
        capture_timestamp_ms: 0,
        sample_rate: 16000,
        sequence: 0,
    }))
    .await
    .expect("send");

    match recv_reply(&mut replies).await {
        ServiceReply::Transcription { duration_secs, .. } => {
            assert!((duration_secs - 1.0).abs() < 1e-9);
        }
        other => panic!("unexpected reply {other:?}"),
    }

    // No further dispatches follow the single flush.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(stt.request_count(), 1);
}

/// A burst far over the cap keeps only the most recent two-second
/// window, dropping whole oldest frames.
#[test]
fn overflow_drops_oldest_frames() {
    // Cap at 2s = 32000 samples; readiness high enough not to matter.
    let mut buffer = SpeakerBuffer::new(32000, 32000, 16000);
    for i in 0..12 {
        buffer.append(&vec![1i16; 4000], i * 250);
    }

    assert_eq!(buffer.total_samples(), 32000);
    assert_eq!(buffer.dropped_samples, 16000);
    // The retained window starts at the ninth frame's timestamp.
    let drained = buffer.drain().expect("non-empty");
    assert_eq!(drained.start_time_ms, 4 * 250);
}

/// Three server errors, then success. One transcription comes out and
/// the retry counter resets.
#[tokio::test]
async fn retry_with_backoff_then_success() {
    let config = test_config();
    let stt = MockSttClient::new();
    stt.fail_then_succeed(3, 500, "server error", "hello");
    let store = Arc::new(MemoryStore::new());

    let (tx, rx) = mpsc::channel(16);
    let (_service, mut replies) = spawn_service(config, Arc::new(stt.clone()), store, rx);

    tx.send(CaptureMessage::AudioChunk(confscribe::messages::AudioChunk {
        speaker_id: "A".to_string(),
        samples: vec![3000i16; 32000],
        capture_timestamp_ms: 0,
        sample_rate: 16000,
        sequence: 0,
    }))
    .await
    .expect("send");

    match recv_reply(&mut replies).await {
        ServiceReply::Transcription { text, .. } => assert_eq!(text, "hello"),
        other => panic!("unexpected reply {other:?}"),
    }
    assert_eq!(stt.request_count(), 4);

    tx.send(CaptureMessage::GetStatus).await.expect("send");
    match recv_reply(&mut replies).await {
        ServiceReply::BufferStatus {
            transcriptions_sent,
            errors,
            ..
        } => {
            assert_eq!(transcriptions_sent, 1);
            assert_eq!(errors, 3);
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

/// A credential failure is terminal. No retries, buffer cleared, error
/// surfaced through the reply channel and the status query.
#[tokio::test]
async fn auth_failure_is_terminal() {
    let config = test_config();
    let stt = MockSttClient::new();
    stt.push(MockSttResponse::HttpError {
        status: 401,
        body: r#"{"error":"invalid_api_key"}"#.to_string(),
    });
    let store = Arc::new(MemoryStore::new());

    let (tx, rx) = mpsc::channel(16);
    let (_service, mut replies) = spawn_service(config, Arc::new(stt.clone()), store, rx);

    tx.send(CaptureMessage::AudioChunk(confscribe::messages::AudioChunk {
        speaker_id: "A".to_string(),
        samples: vec![3000i16; 32000],
        capture_timestamp_ms: 0,
        sample_rate: 16000,
        sequence: 0,
    }))
    .await
    .expect("send");

    match recv_reply(&mut replies).await {
        ServiceReply::Error {
            context,
            speaker_id,
            ..
        } => {
            assert_eq!(context, "transcription");
            assert_eq!(speaker_id.as_deref(), Some("A"));
        }
        other => panic!("unexpected reply {other:?}"),
    }
    assert_eq!(stt.request_count(), 1);

    tx.send(CaptureMessage::GetStatus).await.expect("send");
    match recv_reply(&mut replies).await {
        ServiceReply::BufferStatus {
            errors,
            buffer_seconds,
            ..
        } => {
            assert_eq!(errors, 1);
            assert_eq!(buffer_seconds, 0.0);
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

/// Reconnect with one request in flight and one partial buffer. The
/// partial chunk is padded and transferred, per-speaker state clears, and
/// the in-flight result still lands.
#[tokio::test]
async fn reconnect_mid_flight() {
    let config = test_config();
    let stt = MockSttClient::new().with_text("landed");
    let store = Arc::new(MemoryStore::new());

    let (transport, service_rx) = ChannelTransport::new(64);
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let (_service, mut replies) =
        spawn_service(config.clone(), Arc::new(stt.clone()), store, service_rx);

    let mut sender = ChunkSender::new(transport.clone(), config.transfer.clone(), 16000);

    // Speaker A reaches readiness (two full chunks); B stays partial.
    sender
        .append("A", &sine(2.0, 0.3), 0)
        .await
        .expect("append A");
    sender
        .append("B", &sine(0.5, 0.3), 0)
        .await
        .expect("append B");

    // Host reconnect: flush everything, then notify the service.
    sender.flush_all().await.expect("flush");
    transport
        .send(CaptureMessage::Reconnect)
        .await
        .expect("reconnect notice");

    // A's in-flight transcription still lands.
    match recv_reply(&mut replies).await {
        ServiceReply::Transcription { speaker_id, text, .. } => {
            assert_eq!(speaker_id, "A");
            assert_eq!(text, "landed");
        }
        other => panic!("unexpected reply {other:?}"),
    }

    // All per-speaker state cleared; fresh appends start clean buffers.
    transport.send(CaptureMessage::GetStatus).await.expect("status");
    loop {
        match recv_reply(&mut replies).await {
            ServiceReply::BufferStatus {
                active_speakers,
                buffer_seconds,
                ..
            } => {
                assert_eq!(active_speakers, 0);
                assert_eq!(buffer_seconds, 0.0);
                break;
            }
            // A follow-up dispatch of audio accumulated during the in-flight
            // request may emit one more transcription first.
            ServiceReply::Transcription { .. } => continue,
            other => panic!("unexpected reply {other:?}"),
        }
    }
}

/// Flushing a partial chunk pads it to the
/// configured size with zeros and sends it exactly once.
#[tokio::test]
async fn flush_pads_partial_chunk() {
    let config = test_config();
    let transport = Arc::new(MockTransport::new());
    let mut sender = ChunkSender::new(transport.clone(), config.transfer.clone(), 16000);

    sender
        .append("B", &sine(0.5, 0.3), 0)
        .await
        .expect("append");
    assert!(transport.sent_chunks("B").is_empty());

    sender.flush_all().await.expect("flush");
    let chunks = transport.sent_chunks("B");
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].samples.len(), 16000);
    // The tail is zero padding beyond the half second of audio.
    assert!(chunks[0].samples[8000..].iter().all(|&s| s == 0));
}
