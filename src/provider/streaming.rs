//! # Streaming WSS Connector
//!
//! Real provider connector: one outbound WSS session per client, opened with
//! the process-wide API key, configured once, then driven by two tasks — a
//! write task forwarding audio frames 1:1 and a read task surfacing
//! provider-native messages to the relay core in arrival order.
//!
//! ## Open handshake:
//! 1. WSS upgrade with `Authorization: Token <key>` on the request
//! 2. One `configure` payload (sample rate, encoding, channels, optional
//!    end-of-utterance tuning)
//! 3. Wait for the provider's open confirmation and extract the
//!    provider-assigned session id (shape varies by API generation, see
//!    [`crate::translate::session_open_id`])
//!
//! The caller bounds the whole handshake with the connection timeout and
//! aborts it if the client disconnects first; nothing here retries.

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::provider::{
    AudioFormat, OutboundFrame, ProviderEvent, ProviderHandle, SttConnector,
    AUDIO_CHANNEL_CAPACITY, EVENT_CHANNEL_CAPACITY,
};
use crate::translate;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct StreamingConnector {
    cfg: ProviderConfig,
}

impl StreamingConnector {
    pub fn new(cfg: ProviderConfig) -> Self {
        Self { cfg }
    }

    /// Initial configuration payload, sent exactly once at connection open.
    fn configure_payload(&self, format: &AudioFormat) -> Value {
        let mut payload = json!({
            "type": "configure",
            "audio": {
                "sample_rate": format.sample_rate,
                "channels": format.channels,
                "encoding": format.encoding,
            }
        });
        if let Some(threshold) = self.cfg.end_of_utterance_confidence {
            payload["end_of_utterance_confidence"] = json!(threshold);
        }
        payload
    }

    /// Read provider messages until the open confirmation arrives, returning
    /// the provider-assigned session id.
    async fn await_open_confirmation(
        &self,
        stream: &mut WsStream,
        client_id: &str,
    ) -> Result<String, ProviderError> {
        loop {
            let item = stream.next().await;
            match item {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = match serde_json::from_str(&text) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(client_id, %err, "unparseable provider frame during handshake");
                            continue;
                        }
                    };
                    if let Some(session_id) = translate::session_open_id(&value) {
                        return Ok(session_id);
                    }
                    if value.get("type").and_then(Value::as_str) == Some("Error") {
                        let description = value
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or("unspecified");
                        return Err(ProviderError::Rejected(description.to_string()));
                    }
                    // Pre-open chatter that is neither a confirmation nor a
                    // rejection is skipped
                    debug!(client_id, "ignoring pre-open provider message");
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(ProviderError::Handshake(format!(
                        "provider closed during handshake: {:?}",
                        frame
                    )));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(ProviderError::Transport(err.to_string())),
                None => {
                    return Err(ProviderError::Handshake(
                        "provider dropped the connection during handshake".to_string(),
                    ));
                }
            }
        }
    }
}

#[async_trait]
impl SttConnector for StreamingConnector {
    fn name(&self) -> &'static str {
        "streaming"
    }

    async fn open(
        &self,
        client_id: &str,
        format: &AudioFormat,
    ) -> Result<ProviderHandle, ProviderError> {
        let mut request = self
            .cfg
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|err| ProviderError::Handshake(err.to_string()))?;

        let auth = HeaderValue::from_str(&format!("Token {}", self.cfg.api_key))
            .map_err(|err| ProviderError::Handshake(err.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (mut stream, _response) = connect_async(request)
            .await
            .map_err(|err| ProviderError::Handshake(err.to_string()))?;

        stream
            .send(Message::Text(self.configure_payload(format).to_string()))
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let session_id = self.await_open_confirmation(&mut stream, client_id).await?;
        info!(client_id, %session_id, "provider session opened");

        let (sink, source) = stream.split();
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(run_writer(sink, audio_rx, session_id.clone()));
        tokio::spawn(run_reader(source, event_tx, session_id.clone()));

        Ok(ProviderHandle::new(session_id, audio_tx, event_rx))
    }
}

/// Forward audio frames to the provider in channel order; on `Terminate`,
/// send the graceful termination signal then close the transport.
async fn run_writer(
    mut sink: futures_util::stream::SplitSink<WsStream, Message>,
    mut audio_rx: mpsc::Receiver<OutboundFrame>,
    session_id: String,
) {
    while let Some(frame) = audio_rx.recv().await {
        match frame {
            OutboundFrame::Audio(bytes) => {
                if let Err(err) = sink.send(Message::Binary(bytes)).await {
                    debug!(%session_id, %err, "provider write failed, stopping writer");
                    break;
                }
            }
            OutboundFrame::Terminate => {
                let terminate = json!({ "type": "CloseStream" }).to_string();
                let _ = sink.send(Message::Text(terminate)).await;
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    debug!(%session_id, "provider writer finished");
}

/// Surface provider messages to the relay core in arrival order.
async fn run_reader(
    mut source: futures_util::stream::SplitStream<WsStream>,
    event_tx: mpsc::Sender<ProviderEvent>,
    session_id: String,
) {
    while let Some(item) = source.next().await {
        match item {
            Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => {
                    if event_tx.send(ProviderEvent::Message(value)).await.is_err() {
                        // Relay side is gone; nothing left to deliver to
                        return;
                    }
                }
                Err(err) => {
                    warn!(%session_id, %err, "provider sent unparseable text frame");
                }
            },
            Ok(Message::Close(_)) => {
                info!(%session_id, "provider closed the session");
                let _ = event_tx.send(ProviderEvent::Closed).await;
                return;
            }
            // Binary and ping/pong frames are not part of the transcript
            // protocol
            Ok(_) => {}
            Err(err) => {
                error!(%session_id, %err, "provider transport error");
                let _ = event_tx.send(ProviderEvent::Error(err.to_string())).await;
                return;
            }
        }
    }
    let _ = event_tx.send(ProviderEvent::Closed).await;
}
