//! Transport seam between the capture context and the service context.
//!
//! The real transport is a FIFO channel; the trait exists so tests can
//! script delivery failures and inspect what was sent.

use crate::error::{Result, ScribeError};
use crate::messages::CaptureMessage;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Ordered, reliable-when-valid message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers one message to the service context.
    async fn send(&self, message: CaptureMessage) -> Result<()>;

    /// Returns true if the transport is currently able to deliver.
    fn is_valid(&self) -> bool;
}

/// Transport backed by a tokio mpsc channel.
pub struct ChannelTransport {
    tx: mpsc::Sender<CaptureMessage>,
}

impl ChannelTransport {
    /// Creates the transport pair: the sender half and the service-side
    /// receiver.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<CaptureMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: CaptureMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| ScribeError::TransportSendFailed {
                message: "service context channel closed".to_string(),
            })
    }

    fn is_valid(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Scriptable transport for tests.
///
/// Captures every successfully sent message and can be told to fail the
/// next N sends or to report itself invalid.
#[derive(Clone, Default)]
pub struct MockTransport {
    sent: Arc<Mutex<Vec<CaptureMessage>>>,
    fail_next: Arc<AtomicUsize>,
    invalid: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Toggle the validity probe.
    pub fn set_invalid(&self, invalid: bool) {
        self.invalid.store(invalid, Ordering::SeqCst);
    }

    /// Everything successfully sent so far.
    pub fn sent(&self) -> Vec<CaptureMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Audio chunks successfully sent for one speaker, in order.
    pub fn sent_chunks(&self, speaker_id: &str) -> Vec<crate::messages::AudioChunk> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                CaptureMessage::AudioChunk(c) if c.speaker_id == speaker_id => Some(c),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: CaptureMessage) -> Result<()> {
        if self.invalid.load(Ordering::SeqCst) {
            return Err(ScribeError::TransportInvalid);
        }
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(ScribeError::TransportSendFailed {
                message: "scripted failure".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.invalid.load(Ordering::SeqCst)
    }
}
