//! # Provider Connection Manager
//!
//! Owns the outbound streaming session to the STT provider: one session per
//! client connection, opened with process-wide credentials, configured once at
//! open time, and torn down idempotently. Provider-generation differences
//! (handshake shape, message vocabulary, graceful-terminate signal) live
//! entirely behind the [`SttConnector`] trait, selected at process start by
//! configuration — the relay core only ever sees `open`, `send_audio`,
//! `close` and a stream of [`ProviderEvent`]s.

pub mod mock;
pub mod streaming;

use crate::config::ProviderConfig;
use crate::error::ProviderError;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Capacity of the actor → connector audio channel. If the connector's write
/// task falls this far behind, further frames are dropped rather than queued
/// (at-most-once relay; unbounded buffering only adds latency).
pub const AUDIO_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the connector → actor event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Fixed audio format for the deployment, sent to the provider once at
/// connection-open time. Frames are raw PCM with no framing header; frame
/// boundaries are transport-message boundaries.
#[derive(Debug, Clone)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub encoding: String,
}

/// Lifecycle and transcript events surfaced by a connector to the relay core,
/// in the order received from the provider.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// A provider-native message, still in provider wire shape; the Message
    /// Translator decides what (if anything) reaches the client
    Message(serde_json::Value),

    /// The provider closed the session from its side
    Closed,

    /// Unrecoverable transport or protocol error mid-stream
    Error(String),
}

/// A frame on the actor → connector channel.
#[derive(Debug)]
pub enum OutboundFrame {
    /// Raw binary audio, forwarded 1:1 in the order received from the client
    Audio(Vec<u8>),

    /// Graceful termination request; the connector sends the provider's
    /// terminate signal (if the protocol has one) and closes the transport
    Terminate,
}

/// Handle to one open provider session, exclusively owned by its client
/// connection. Closing the client connection always closes the handle, and a
/// provider-initiated close tears down the client side.
pub struct ProviderHandle {
    session_id: String,
    audio_tx: mpsc::Sender<OutboundFrame>,
    events: Option<mpsc::Receiver<ProviderEvent>>,
    closed: Arc<AtomicBool>,
    frames_forwarded: Arc<AtomicU64>,
}

impl ProviderHandle {
    pub fn new(
        session_id: String,
        audio_tx: mpsc::Sender<OutboundFrame>,
        events: mpsc::Receiver<ProviderEvent>,
    ) -> Self {
        Self {
            session_id,
            audio_tx,
            events: Some(events),
            closed: Arc::new(AtomicBool::new(false)),
            frames_forwarded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Provider-assigned session identifier (from the open confirmation).
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Take the event receiver. The relay core calls this exactly once when
    /// the session becomes active and feeds it into its mailbox as a stream.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ProviderEvent>> {
        self.events.take()
    }

    /// Forward one raw audio frame upstream, after throttle admission.
    ///
    /// Returns `false` if the frame was dropped — either the session is
    /// already closed or the connector's write task is saturated. Frames are
    /// never re-framed or reordered.
    pub fn send_audio(&self, frame: Vec<u8>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        match self.audio_tx.try_send(OutboundFrame::Audio(frame)) {
            Ok(()) => {
                self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                debug!(session_id = %self.session_id, "audio channel saturated, frame dropped");
                false
            }
        }
    }

    /// Close the session: send the graceful terminate signal, then let the
    /// connector close the transport. Safe to call on an already-closed
    /// session; only the first call does anything.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Best effort: if the write task is already gone the transport is
        // closed anyway
        let _ = self.audio_tx.try_send(OutboundFrame::Terminate);
        info!(session_id = %self.session_id, "provider session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Accumulated count of frames accepted onto the upstream channel.
    pub fn frames_forwarded(&self) -> u64 {
        self.frames_forwarded.load(Ordering::Relaxed)
    }
}

/// The single provider-adapter capability: open one streaming session per
/// client. `send_audio` and `close` live on the returned [`ProviderHandle`].
///
/// Implementations must not retry internally — retry policy belongs to the
/// caller, and the relay core deliberately never retries within one client
/// session (mid-stream audio cannot be safely replayed without client
/// cooperation).
#[async_trait]
pub trait SttConnector: Send + Sync {
    /// Short name for logs and the health endpoint.
    fn name(&self) -> &'static str;

    /// Open and configure one provider session for `client_id`, resolving
    /// once the provider confirms the session (the caller bounds this with
    /// the connection timeout and aborts on client disconnect).
    async fn open(
        &self,
        client_id: &str,
        format: &AudioFormat,
    ) -> Result<ProviderHandle, ProviderError>;
}

/// Build the connector selected by configuration. Called once at startup.
pub fn connector_from_config(provider: &ProviderConfig) -> anyhow::Result<Arc<dyn SttConnector>> {
    match provider.kind.as_str() {
        "streaming" => Ok(Arc::new(streaming::StreamingConnector::new(
            provider.clone(),
        ))),
        "mock" => Ok(Arc::new(mock::MockConnector::default())),
        other => anyhow::bail!("unknown provider kind: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminates_once() {
        let (audio_tx, mut audio_rx) = mpsc::channel(8);
        let (_event_tx, event_rx) = mpsc::channel(8);
        let handle = ProviderHandle::new("sess-1".to_string(), audio_tx, event_rx);

        handle.close();
        handle.close();
        handle.close();
        assert!(handle.is_closed());

        // Exactly one terminate signal reaches the connector
        assert!(matches!(audio_rx.recv().await, Some(OutboundFrame::Terminate)));
        assert!(audio_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_audio_after_close_is_dropped() {
        let (audio_tx, mut audio_rx) = mpsc::channel(8);
        let (_event_tx, event_rx) = mpsc::channel(8);
        let handle = ProviderHandle::new("sess-2".to_string(), audio_tx, event_rx);

        assert!(handle.send_audio(vec![0, 1]));
        handle.close();
        assert!(!handle.send_audio(vec![2, 3]));
        assert_eq!(handle.frames_forwarded(), 1);

        assert!(matches!(audio_rx.recv().await, Some(OutboundFrame::Audio(_))));
        assert!(matches!(audio_rx.recv().await, Some(OutboundFrame::Terminate)));
    }

    #[tokio::test]
    async fn test_frames_keep_client_order() {
        let (audio_tx, mut audio_rx) = mpsc::channel(16);
        let (_event_tx, event_rx) = mpsc::channel(8);
        let handle = ProviderHandle::new("sess-3".to_string(), audio_tx, event_rx);

        for i in 0..10u8 {
            assert!(handle.send_audio(vec![i; 4]));
        }
        for i in 0..10u8 {
            match audio_rx.recv().await {
                Some(OutboundFrame::Audio(frame)) => assert_eq!(frame, vec![i; 4]),
                other => panic!("expected audio frame, got {:?}", other),
            }
        }
    }
}
