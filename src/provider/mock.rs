//! No-op fallback connector: opens instantly, accepts and counts audio
//! frames, emits no transcripts. Used when no provider credentials are
//! configured (local development, protocol testing against the client).

use crate::error::ProviderError;
use crate::provider::{
    AudioFormat, OutboundFrame, ProviderEvent, ProviderHandle, SttConnector,
    AUDIO_CHANNEL_CAPACITY, EVENT_CHANNEL_CAPACITY,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Default)]
pub struct MockConnector;

#[async_trait]
impl SttConnector for MockConnector {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn open(
        &self,
        client_id: &str,
        _format: &AudioFormat,
    ) -> Result<ProviderHandle, ProviderError> {
        let session_id = format!("mock-{}", Uuid::new_v4());
        info!(client_id, %session_id, "mock provider session opened");

        let (audio_tx, mut audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let task_session_id = session_id.clone();
        tokio::spawn(async move {
            let mut frames: u64 = 0;
            while let Some(frame) = audio_rx.recv().await {
                match frame {
                    OutboundFrame::Audio(bytes) => {
                        frames += 1;
                        debug!(
                            session_id = %task_session_id,
                            frames,
                            bytes = bytes.len(),
                            "mock provider discarded audio frame"
                        );
                    }
                    OutboundFrame::Terminate => break,
                }
            }
            info!(session_id = %task_session_id, frames, "mock provider session finished");
            let _ = event_tx.send(ProviderEvent::Closed).await;
        });

        Ok(ProviderHandle::new(session_id, audio_tx, event_rx))
    }
}
