//! # Relay Core — WebSocket Audio Relay
//!
//! One actor per accepted client connection. Clients connect to `/ws/audio`,
//! send raw binary audio frames (16-bit, 16 kHz, mono PCM; frame boundaries
//! are WebSocket message boundaries) and receive canonical transcript events
//! as JSON. The actor owns the connection's whole lifecycle and relays
//! between two independently-failing peers: the client socket and the
//! provider session opened by the connector.
//!
//! ## Lifecycle state machine:
//! `connecting → active → closing → closed`
//!
//! - **connecting**: socket accepted, provider open in flight (bounded by the
//!   connection timeout; aborted if the client leaves first)
//! - **active**: provider confirmed; audio flows client → throttle →
//!   provider, transcripts flow provider → translator → client
//! - **closing**: either peer closed, a provider error surfaced, or the
//!   reaper evicted the connection; in-flight sends drain, both sides close
//! - **closed**: terminal; the registry entry is gone and no further
//!   messages are processed
//!
//! Audio received outside `active` is a defined no-op, not an error. The
//! actor mailbox serializes every transition, so client frames, provider
//! events and reaper evictions can never race for the same connection.

use crate::config::AppConfig;
use crate::provider::{ProviderEvent, ProviderHandle};
use crate::registry::{ConnectionEntry, ForceClose};
use crate::state::AppState;
use crate::throttle::ThrottleWindow;
use crate::translate::{self, ControlIntent, Translation, TranscriptEvent, TranscriptKind};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Application-range close code sent when the provider connection fails or
/// never opens within the connection timeout. Distinguishable from a normal
/// close by the client application layer, which owns reconnection.
pub const CLOSE_UPSTREAM_FAILURE: u16 = 4001;

/// Connection lifecycle states. Transitions only ever move rightward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Canonical client-facing events.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ClientEvent {
    /// The provider session opened; transcripts may follow
    #[serde(rename = "session.created")]
    SessionCreated { session_id: String, timestamp: String },

    /// Answer to the identify-client handshake
    #[serde(rename = "client_identified")]
    ClientIdentified {
        #[serde(rename = "clientId")]
        client_id: String,
        timestamp: String,
    },

    /// Provisional transcript, superseded by later events
    #[serde(rename = "custom_transcription_partial")]
    TranscriptionPartial {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
        timestamp: String,
    },

    /// Completed utterance segment
    #[serde(rename = "custom_transcription_final")]
    TranscriptionFinal {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
        timestamp: String,
    },

    /// Unrecoverable failure, sent once before the socket closes
    #[serde(rename = "error")]
    Error { error: String },
}

impl ClientEvent {
    fn from_transcript(event: TranscriptEvent) -> Self {
        let timestamp = event.timestamp.to_rfc3339();
        match event.kind {
            TranscriptKind::Partial => ClientEvent::TranscriptionPartial {
                text: event.text,
                confidence: event.confidence,
                timestamp,
            },
            TranscriptKind::Final => ClientEvent::TranscriptionFinal {
                text: event.text,
                confidence: event.confidence,
                timestamp,
            },
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Mailbox message: the connector finished opening the provider session.
#[derive(Message)]
#[rtype(result = "()")]
struct ProviderOpened(ProviderHandle);

/// Mailbox message: the provider session could not be opened.
#[derive(Message)]
#[rtype(result = "()")]
struct ProviderOpenFailed(String);

/// Per-connection relay actor.
pub struct RelayWebSocket {
    /// Opaque client identifier, generated at accept time
    client_id: String,

    state: RelayState,

    created_at: Instant,

    /// Shared with the reaper through the registry entry; written only here
    last_activity: Arc<RwLock<Instant>>,

    throttle: ThrottleWindow,

    /// Present exactly while the state is `active`
    provider: Option<ProviderHandle>,

    /// In-flight provider handshake, aborted if the client leaves first
    open_task: Option<tokio::task::JoinHandle<()>>,

    app_state: web::Data<AppState>,

    config: AppConfig,
}

impl RelayWebSocket {
    pub fn new(app_state: web::Data<AppState>) -> Self {
        let config = app_state.get_config();
        let now = Instant::now();
        Self {
            client_id: Uuid::new_v4().to_string(),
            state: RelayState::Connecting,
            created_at: now,
            last_activity: Arc::new(RwLock::new(now)),
            throttle: ThrottleWindow::per_minute(config.limits.frames_per_minute),
            provider: None,
            open_task: None,
            app_state,
            config,
        }
    }

    /// Record client activity. Called for every inbound client frame (audio
    /// or control), and for nothing else — transport-level pongs don't count,
    /// or auto-responding clients would never hit the idle budget.
    fn touch(&self) {
        *self.last_activity.write().unwrap() = Instant::now();
    }

    fn send_event(&self, ctx: &mut ws::WebsocketContext<Self>, event: &ClientEvent) {
        match serde_json::to_string(event) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(client_id = %self.client_id, %err, "failed to serialize client event"),
        }
    }

    /// `active`/`connecting` → `closing`: close the provider side, close the
    /// client socket, stop the actor. Already-closing connections ignore
    /// further close requests.
    fn begin_close(&mut self, ctx: &mut ws::WebsocketContext<Self>, reason: Option<ws::CloseReason>) {
        if matches!(self.state, RelayState::Closing | RelayState::Closed) {
            return;
        }
        self.state = RelayState::Closing;
        if let Some(handle) = &self.provider {
            handle.close();
        }
        ctx.close(reason);
        ctx.stop();
    }

    /// Surface an upstream failure: exactly one `error` event, then the
    /// distinguished abnormal close code. Never retried.
    fn fail_upstream(&mut self, ctx: &mut ws::WebsocketContext<Self>, message: &str) {
        self.send_event(
            ctx,
            &ClientEvent::Error {
                error: message.to_string(),
            },
        );
        self.app_state.record_provider_failure();
        self.begin_close(
            ctx,
            Some(ws::CloseReason {
                code: ws::CloseCode::Other(CLOSE_UPSTREAM_FAILURE),
                description: Some(message.to_string()),
            }),
        );
    }

    /// Binary path: throttle admission, then 1:1 forwarding to the provider.
    /// Outside `active` the frame is dropped silently (a defined no-op).
    fn handle_audio_frame(&mut self, data: &[u8]) {
        self.touch();

        if self.state != RelayState::Active {
            debug!(client_id = %self.client_id, state = ?self.state, "audio frame outside active state, dropped");
            return;
        }

        // 16-bit samples: an odd byte count means a torn frame
        if data.len() % 2 != 0 {
            debug!(client_id = %self.client_id, len = data.len(), "malformed audio frame, dropped");
            return;
        }

        if !self.throttle.admit(data.len()) {
            // Expected under overload, not an error; never reported upstream
            self.app_state.record_frame_throttled();
            debug!(client_id = %self.client_id, "frame cap reached, dropped");
            return;
        }

        if let Some(handle) = &self.provider {
            if handle.send_audio(data.to_vec()) {
                self.app_state.record_frame_forwarded();
            }
        }
    }

    /// Text path: exactly one recognized control message, answered locally.
    /// Everything else — including malformed JSON, which transport framing
    /// can produce — is ignored and never forwarded upstream.
    fn handle_text_frame(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        self.touch();

        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => {
                debug!(client_id = %self.client_id, "non-JSON text frame ignored");
                return;
            }
        };

        match translate::control_intent(&value) {
            ControlIntent::IdentifyClient => {
                self.send_event(
                    ctx,
                    &ClientEvent::ClientIdentified {
                        client_id: self.client_id.clone(),
                        timestamp: now_rfc3339(),
                    },
                );
            }
            ControlIntent::None => {
                debug!(client_id = %self.client_id, "unrecognized client JSON ignored");
            }
        }
    }
}

impl Actor for RelayWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, "client connection accepted");
        self.app_state.connection_opened();
        self.app_state.registry.insert(
            self.client_id.clone(),
            ConnectionEntry {
                created_at: self.created_at,
                last_activity: self.last_activity.clone(),
                recipient: ctx.address().recipient(),
            },
        );

        // Open the provider session off the actor; the outcome comes back
        // through the mailbox so state transitions stay serialized
        let connector = self.app_state.connector.clone();
        let format = self.config.audio.to_format();
        let client_id = self.client_id.clone();
        let timeout = self.config.provider.connect_timeout();
        let addr = ctx.address();

        self.open_task = Some(tokio::spawn(async move {
            match tokio::time::timeout(timeout, connector.open(&client_id, &format)).await {
                Ok(Ok(handle)) => addr.do_send(ProviderOpened(handle)),
                Ok(Err(err)) => addr.do_send(ProviderOpenFailed(err.to_string())),
                Err(_) => addr.do_send(ProviderOpenFailed(format!(
                    "provider did not open within {}s",
                    timeout.as_secs()
                ))),
            }
        }));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state = RelayState::Closed;

        // Cancel an in-flight handshake; closing the client socket must not
        // leave a half-open provider session behind
        if let Some(task) = self.open_task.take() {
            task.abort();
        }
        if let Some(handle) = self.provider.take() {
            handle.close();
        }

        self.app_state.registry.remove(&self.client_id);
        self.app_state.connection_closed();
        info!(client_id = %self.client_id, "client connection closed");
    }
}

impl Handler<ProviderOpened> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: ProviderOpened, ctx: &mut Self::Context) {
        let mut handle = msg.0;

        if self.state != RelayState::Connecting {
            // Client already left; tear the fresh upstream session down
            handle.close();
            return;
        }

        self.state = RelayState::Active;
        self.app_state.record_session_opened();
        info!(
            client_id = %self.client_id,
            session_id = %handle.session_id(),
            "relay active"
        );

        // The confirmation always precedes any transcript event
        self.send_event(
            ctx,
            &ClientEvent::SessionCreated {
                session_id: handle.session_id().to_string(),
                timestamp: now_rfc3339(),
            },
        );

        // Provider events enter the mailbox as a stream, preserving the
        // order they arrived from the provider
        if let Some(events) = handle.take_events() {
            ctx.add_stream(ReceiverStream::new(events));
        }
        self.provider = Some(handle);
    }
}

impl Handler<ProviderOpenFailed> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: ProviderOpenFailed, ctx: &mut Self::Context) {
        if self.state != RelayState::Connecting {
            return;
        }
        warn!(client_id = %self.client_id, error = %msg.0, "provider open failed");
        self.fail_upstream(ctx, &format!("upstream connection failed: {}", msg.0));
    }
}

/// Reaper eviction. Indistinguishable from a client-initiated close on the
/// provider side; the client socket closes with the reason "timeout".
impl Handler<ForceClose> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: ForceClose, ctx: &mut Self::Context) {
        if matches!(self.state, RelayState::Closing | RelayState::Closed) {
            return;
        }
        warn!(
            client_id = %self.client_id,
            reason = msg.reason.as_str(),
            "connection evicted"
        );
        self.app_state.record_eviction();
        self.begin_close(
            ctx,
            Some(ws::CloseReason {
                code: ws::CloseCode::Normal,
                description: Some("timeout".to_string()),
            }),
        );
    }
}

/// Provider → client direction.
impl StreamHandler<ProviderEvent> for RelayWebSocket {
    fn handle(&mut self, event: ProviderEvent, ctx: &mut Self::Context) {
        match event {
            ProviderEvent::Message(raw) => match translate::translate_event(&raw) {
                Translation::Transcript(transcript) => {
                    if self.state == RelayState::Active {
                        self.app_state.record_transcript(transcript.kind);
                        self.send_event(ctx, &ClientEvent::from_transcript(transcript));
                    }
                }
                Translation::Lifecycle(marker) => {
                    debug!(client_id = %self.client_id, marker, "provider lifecycle event");
                }
                Translation::Unrecognized(tag) => {
                    warn!(client_id = %self.client_id, %tag, "unrecognized provider message tag, skipped");
                }
                Translation::Malformed => {
                    warn!(client_id = %self.client_id, "untagged provider message, skipped");
                }
            },
            ProviderEvent::Closed => {
                info!(client_id = %self.client_id, "provider closed, tearing down client side");
                self.begin_close(
                    ctx,
                    Some(ws::CloseReason {
                        code: ws::CloseCode::Normal,
                        description: Some("upstream closed".to_string()),
                    }),
                );
            }
            ProviderEvent::Error(err) => {
                error!(client_id = %self.client_id, error = %err, "provider error mid-stream");
                self.fail_upstream(ctx, &format!("upstream error: {}", err));
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // Event stream ended without an explicit close frame (connector task
        // dropped its sender); treat like a provider close
        if self.state == RelayState::Active {
            self.begin_close(
                ctx,
                Some(ws::CloseReason {
                    code: ws::CloseCode::Normal,
                    description: Some("upstream closed".to_string()),
                }),
            );
        }
    }
}

/// Client → provider direction.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelayWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => self.handle_audio_frame(&data),
            Ok(ws::Message::Text(text)) => self.handle_text_frame(&text, ctx),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(client_id = %self.client_id, ?reason, "client closed the connection");
                self.begin_close(ctx, reason);
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(client_id = %self.client_id, "unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                // Client-transport error: recover locally by tearing this
                // one connection down
                error!(client_id = %self.client_id, %err, "client transport error");
                self.begin_close(
                    ctx,
                    Some(ws::CloseReason {
                        code: ws::CloseCode::Protocol,
                        description: None,
                    }),
                );
            }
        }
    }
}

/// WebSocket endpoint handler: upgrades the HTTP request and hands the
/// connection to a fresh relay actor.
pub async fn audio_relay(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        peer = ?req.connection_info().peer_addr(),
        "new relay connection request"
    );
    ws::start(RelayWebSocket::new(app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::mock::MockConnector;
    use crate::provider::{
        AudioFormat, OutboundFrame, SttConnector, AUDIO_CHANNEL_CAPACITY, EVENT_CHANNEL_CAPACITY,
    };

    use actix_web::{App, HttpServer};
    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message as WireMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    /// Bind a relay server on an ephemeral port with the given connector.
    async fn spawn_relay(
        config: AppConfig,
        connector: Arc<dyn SttConnector>,
    ) -> (AppState, String) {
        let state = AppState::new(config, connector);
        let data = web::Data::new(state.clone());

        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/ws/audio", web::get().to(audio_relay))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();

        let addr = server.addrs()[0];
        tokio::spawn(server.run());
        (state, format!("ws://{}/ws/audio", addr))
    }

    async fn connect(url: &str) -> WsClient {
        let (ws, _) = connect_async(url).await.expect("WS connect failed");
        ws
    }

    /// Next text frame as JSON, skipping transport frames.
    async fn next_json(ws: &mut WsClient) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for server message")
                .expect("stream ended unexpectedly")
                .expect("websocket error");
            if let WireMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Read until the next close frame, asserting no `error` event shows up
    /// on the way, and return its code.
    async fn next_close_code(ws: &mut WsClient) -> Option<u16> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for close")?
                .expect("websocket error");
            match msg {
                WireMessage::Close(frame) => return frame.map(|f| u16::from(f.code)),
                WireMessage::Text(text) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    assert_ne!(value["type"], "error", "unexpected error event: {}", text);
                }
                _ => {}
            }
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, pred: F) {
        for _ in 0..100 {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    /// Connector that replays a scripted event sequence after opening.
    struct ScriptedConnector {
        script: Vec<ProviderEvent>,
    }

    #[async_trait]
    impl SttConnector for ScriptedConnector {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn open(
            &self,
            client_id: &str,
            _format: &AudioFormat,
        ) -> Result<ProviderHandle, ProviderError> {
            let (audio_tx, mut audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
            let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let script = self.script.clone();

            tokio::spawn(async move {
                let errored = script
                    .iter()
                    .any(|event| matches!(event, ProviderEvent::Error(_)));
                for event in script {
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
                while let Some(frame) = audio_rx.recv().await {
                    if matches!(frame, OutboundFrame::Terminate) {
                        break;
                    }
                }
                if !errored {
                    let _ = event_tx.send(ProviderEvent::Closed).await;
                }
            });

            Ok(ProviderHandle::new(
                format!("scripted-{}", client_id),
                audio_tx,
                event_rx,
            ))
        }
    }

    /// Connector that records every forwarded audio frame.
    struct CountingConnector {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl SttConnector for CountingConnector {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn open(
            &self,
            client_id: &str,
            _format: &AudioFormat,
        ) -> Result<ProviderHandle, ProviderError> {
            let (audio_tx, mut audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
            let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let frames = self.frames.clone();

            tokio::spawn(async move {
                while let Some(frame) = audio_rx.recv().await {
                    match frame {
                        OutboundFrame::Audio(bytes) => frames.lock().unwrap().push(bytes),
                        OutboundFrame::Terminate => break,
                    }
                }
                let _ = event_tx.send(ProviderEvent::Closed).await;
            });

            Ok(ProviderHandle::new(
                format!("counting-{}", client_id),
                audio_tx,
                event_rx,
            ))
        }
    }

    /// Connector whose handshake never completes.
    struct StalledConnector;

    #[async_trait]
    impl SttConnector for StalledConnector {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn open(
            &self,
            _client_id: &str,
            _format: &AudioFormat,
        ) -> Result<ProviderHandle, ProviderError> {
            std::future::pending().await
        }
    }

    fn identify_message() -> WireMessage {
        WireMessage::Text(
            json!({ "type": "ping", "message": "identify_client" })
                .to_string()
                .into(),
        )
    }

    #[test]
    fn test_client_event_wire_shapes() {
        let created = ClientEvent::SessionCreated {
            session_id: "s-1".to_string(),
            timestamp: "2025-01-01T00:00:00+00:00".to_string(),
        };
        let json = serde_json::to_string(&created).unwrap();
        assert!(json.contains(r#""type":"session.created""#));
        assert!(json.contains(r#""session_id":"s-1""#));

        let identified = ClientEvent::ClientIdentified {
            client_id: "c-1".to_string(),
            timestamp: "2025-01-01T00:00:00+00:00".to_string(),
        };
        let json = serde_json::to_string(&identified).unwrap();
        assert!(json.contains(r#""type":"client_identified""#));
        assert!(json.contains(r#""clientId":"c-1""#));

        // Confidence is omitted when the provider didn't supply one
        let partial = ClientEvent::TranscriptionPartial {
            text: "Hel".to_string(),
            confidence: None,
            timestamp: "2025-01-01T00:00:00+00:00".to_string(),
        };
        let json = serde_json::to_string(&partial).unwrap();
        assert!(json.contains(r#""type":"custom_transcription_partial""#));
        assert!(!json.contains("confidence"));

        let fin = ClientEvent::TranscriptionFinal {
            text: "Hello".to_string(),
            confidence: Some(0.9),
            timestamp: "2025-01-01T00:00:00+00:00".to_string(),
        };
        let json = serde_json::to_string(&fin).unwrap();
        assert!(json.contains(r#""type":"custom_transcription_final""#));
        assert!(json.contains("confidence"));
    }

    #[actix_web::test]
    async fn test_identify_client_round_trip() {
        let (_state, url) = spawn_relay(AppConfig::default(), Arc::new(MockConnector)).await;
        let mut ws = connect(&url).await;

        ws.send(identify_message()).await.unwrap();

        // session.created may interleave; read until the identity answer
        loop {
            let value = next_json(&mut ws).await;
            if value["type"] == "client_identified" {
                assert!(!value["clientId"].as_str().unwrap().is_empty());
                assert!(!value["timestamp"].as_str().unwrap().is_empty());
                break;
            }
            assert_eq!(value["type"], "session.created");
        }
        let _ = ws.close(None).await;
    }

    #[actix_web::test]
    async fn test_session_created_precedes_transcripts_in_order() {
        let connector = ScriptedConnector {
            script: vec![
                ProviderEvent::Message(json!({
                    "type": "Results",
                    "is_final": false,
                    "channel": { "alternatives": [ { "transcript": "Hel" } ] }
                })),
                ProviderEvent::Message(json!({
                    "type": "Results",
                    "is_final": true,
                    "channel": { "alternatives": [ { "transcript": "Hello" } ] }
                })),
            ],
        };
        let (_state, url) = spawn_relay(AppConfig::default(), Arc::new(connector)).await;
        let mut ws = connect(&url).await;

        let first = next_json(&mut ws).await;
        assert_eq!(first["type"], "session.created");
        assert!(!first["session_id"].as_str().unwrap().is_empty());

        let second = next_json(&mut ws).await;
        assert_eq!(second["type"], "custom_transcription_partial");
        assert_eq!(second["text"], "Hel");

        let third = next_json(&mut ws).await;
        assert_eq!(third["type"], "custom_transcription_final");
        assert_eq!(third["text"], "Hello");

        let _ = ws.close(None).await;
    }

    #[actix_web::test]
    async fn test_audio_frames_forwarded_in_order() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let connector = CountingConnector {
            frames: frames.clone(),
        };
        let (_state, url) = spawn_relay(AppConfig::default(), Arc::new(connector)).await;
        let mut ws = connect(&url).await;

        // Audio is only forwarded once the session is active
        let first = next_json(&mut ws).await;
        assert_eq!(first["type"], "session.created");

        for i in 0..10u8 {
            ws.send(WireMessage::Binary(vec![i; 320].into())).await.unwrap();
        }

        wait_for("10 forwarded frames", || frames.lock().unwrap().len() == 10).await;
        let received = frames.lock().unwrap().clone();
        for (i, frame) in received.iter().enumerate() {
            assert_eq!(frame, &vec![i as u8; 320]);
        }
        let _ = ws.close(None).await;
    }

    #[actix_web::test]
    async fn test_throttle_forwards_cap_and_drops_rest_without_error() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let connector = CountingConnector {
            frames: frames.clone(),
        };
        let (state, url) = spawn_relay(AppConfig::default(), Arc::new(connector)).await;
        let mut ws = connect(&url).await;

        let first = next_json(&mut ws).await;
        assert_eq!(first["type"], "session.created");

        // 150 frames into one 60-second window with cap 120
        for i in 0..150u32 {
            ws.send(WireMessage::Binary(vec![(i % 251) as u8; 320].into()))
                .await
                .unwrap();
        }

        wait_for("120 forwarded frames", || frames.lock().unwrap().len() == 120).await;
        wait_for("30 throttled frames", || {
            state.metrics_snapshot().frames_throttled == 30
        })
        .await;
        assert_eq!(frames.lock().unwrap().len(), 120);

        // No error was raised: the connection still answers control messages
        ws.send(identify_message()).await.unwrap();
        let answer = next_json(&mut ws).await;
        assert_eq!(answer["type"], "client_identified");

        let _ = ws.close(None).await;
    }

    #[actix_web::test]
    async fn test_handshake_timeout_yields_one_error_and_abnormal_close() {
        let mut config = AppConfig::default();
        config.provider.connect_timeout_secs = 1;
        let (state, url) = spawn_relay(config, Arc::new(StalledConnector)).await;
        let mut ws = connect(&url).await;

        let first = next_json(&mut ws).await;
        assert_eq!(first["type"], "error");
        assert!(!first["error"].as_str().unwrap().is_empty());

        // No session.created may follow the error; the next frame is the
        // distinguished abnormal close
        assert_eq!(next_close_code(&mut ws).await, Some(CLOSE_UPSTREAM_FAILURE));

        wait_for("registry cleanup", || state.registry.is_empty()).await;
        assert_eq!(state.metrics_snapshot().provider_failures, 1);
    }

    #[actix_web::test]
    async fn test_provider_error_mid_stream_closes_with_abnormal_code() {
        let connector = ScriptedConnector {
            script: vec![
                ProviderEvent::Message(json!({ "type": "transcript.partial", "text": "Hel" })),
                ProviderEvent::Error("connection reset by provider".to_string()),
            ],
        };
        let (state, url) = spawn_relay(AppConfig::default(), Arc::new(connector)).await;
        let mut ws = connect(&url).await;

        assert_eq!(next_json(&mut ws).await["type"], "session.created");
        assert_eq!(
            next_json(&mut ws).await["type"],
            "custom_transcription_partial"
        );

        let error = next_json(&mut ws).await;
        assert_eq!(error["type"], "error");

        // Damage is contained to this connection
        let close = loop {
            match tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for close")
            {
                Some(Ok(WireMessage::Close(frame))) => break frame,
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break None,
            }
        };
        if let Some(frame) = close {
            assert_eq!(u16::from(frame.code), CLOSE_UPSTREAM_FAILURE);
        }

        wait_for("registry cleanup", || state.registry.is_empty()).await;
    }

    #[actix_web::test]
    async fn test_malformed_json_and_early_audio_are_tolerated() {
        let (_state, url) = spawn_relay(AppConfig::default(), Arc::new(MockConnector)).await;
        let mut ws = connect(&url).await;

        // Neither of these may kill the connection or reach the provider
        ws.send(WireMessage::Text("{not json".to_string().into()))
            .await
            .unwrap();
        ws.send(WireMessage::Text(
            json!({ "type": "configure", "sample_rate": 8000 }).to_string().into(),
        ))
        .await
        .unwrap();
        ws.send(WireMessage::Binary(vec![0u8; 0].into())).await.unwrap();

        ws.send(identify_message()).await.unwrap();
        loop {
            let value = next_json(&mut ws).await;
            if value["type"] == "client_identified" {
                break;
            }
            assert_eq!(value["type"], "session.created");
        }
        let _ = ws.close(None).await;
    }

    #[actix_web::test]
    async fn test_reaper_eviction_closes_with_timeout_reason() {
        let (state, url) = spawn_relay(AppConfig::default(), Arc::new(MockConnector)).await;
        let mut ws = connect(&url).await;
        assert_eq!(next_json(&mut ws).await["type"], "session.created");

        wait_for("registration", || state.registry.len() == 1).await;

        // Sweep with zero budgets: everything is overdue immediately
        let policy = crate::registry::ReaperPolicy {
            idle_budget: Duration::from_secs(0),
            session_budget: Duration::from_secs(0),
        };
        let evicted = state.registry.sweep(Instant::now(), &policy);
        assert_eq!(evicted.len(), 1);

        let close = loop {
            match tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for close")
            {
                Some(Ok(WireMessage::Close(frame))) => break frame,
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break None,
            }
        };
        let frame = close.expect("expected a close frame with a reason");
        assert_eq!(frame.reason, "timeout");

        wait_for("registry cleanup", || state.registry.is_empty()).await;
        assert_eq!(state.metrics_snapshot().evictions, 1);
    }
}
