//! # Message Translator
//!
//! Converts provider-native transcript/session event shapes into the relay's
//! canonical transcript representation, and classifies inbound client control
//! JSON into relay-local intents. Both directions are pure functions over
//! `serde_json::Value`, so they can be tested without any sockets.
//!
//! ## Provider vocabulary:
//! The provider message-type vocabulary is an evolving, versioned set. The
//! mapping table below covers every known tag across the provider API
//! generations the relay has been pointed at:
//!
//! - **gen-1 results envelope**: `Results` with an `is_final` flag and the
//!   transcript nested under `channel.alternatives[0]`, plus the lifecycle
//!   markers `Metadata`, `SpeechStarted` and `UtteranceEnd`.
//! - **gen-2 turn envelope**: `Turn` with a `turn_is_formatted` flag, plus the
//!   lifecycle markers `Begin` and `Termination`.
//! - **gen-3 dotted names**: `transcript.partial` / `transcript.final`, plus
//!   `session.begins` / `session.closed`.
//!
//! Anything outside the table is reported as unrecognized: the caller logs it
//! and moves on — an unknown tag must never crash the relay.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// The two canonical transcript kinds.
///
/// `Partial` results are superseded by later events and are safe to drop under
/// load; `Final` results represent a completed utterance segment and must not
/// be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptKind {
    Partial,
    Final,
}

/// Canonical client-facing transcript event. Produced here, written to the
/// client socket by the relay core, never stored.
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub text: String,
    pub confidence: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of translating one provider-native event.
#[derive(Debug)]
pub enum Translation {
    /// Exactly one canonical event to deliver to the client
    Transcript(TranscriptEvent),

    /// Known session-lifecycle marker; nothing to deliver
    Lifecycle(&'static str),

    /// Tag not in the mapping table — logged by the caller, never fatal
    Unrecognized(String),

    /// Payload is not a tagged object at all
    Malformed,
}

/// Translate one provider-native event into zero-or-one canonical event.
pub fn translate_event(raw: &Value) -> Translation {
    let tag = match raw.get("type").and_then(Value::as_str) {
        Some(tag) => tag,
        None => return Translation::Malformed,
    };

    match tag {
        // gen-1 results envelope
        "Results" => {
            let alternative = raw
                .pointer("/channel/alternatives/0")
                .unwrap_or(&Value::Null);
            let text = alternative
                .get("transcript")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let confidence = alternative
                .get("confidence")
                .and_then(Value::as_f64)
                .map(|c| c as f32);
            let kind = if raw.get("is_final").and_then(Value::as_bool).unwrap_or(false) {
                TranscriptKind::Final
            } else {
                TranscriptKind::Partial
            };
            transcript(kind, text, confidence)
        }

        // gen-2 turn envelope. Tie-break rule: the unformatted variant is a
        // partial, the formatted variant is a final — never the reverse.
        "Turn" => {
            let text = raw
                .get("transcript")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let confidence = raw
                .get("end_of_turn_confidence")
                .and_then(Value::as_f64)
                .map(|c| c as f32);
            let kind = if raw
                .get("turn_is_formatted")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                TranscriptKind::Final
            } else {
                TranscriptKind::Partial
            };
            transcript(kind, text, confidence)
        }

        // gen-3 dotted names
        "transcript.partial" | "transcript.final" => {
            let text = raw
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let confidence = raw
                .get("confidence")
                .and_then(Value::as_f64)
                .map(|c| c as f32);
            let kind = if tag == "transcript.final" {
                TranscriptKind::Final
            } else {
                TranscriptKind::Partial
            };
            transcript(kind, text, confidence)
        }

        // Session-lifecycle markers across generations: known, not transcripts
        "Metadata" => Translation::Lifecycle("metadata"),
        "SpeechStarted" => Translation::Lifecycle("speech_started"),
        "UtteranceEnd" => Translation::Lifecycle("utterance_end"),
        "Begin" | "session.begins" => Translation::Lifecycle("session_open"),
        "Termination" | "session.closed" => Translation::Lifecycle("session_closed"),

        other => Translation::Unrecognized(other.to_string()),
    }
}

fn transcript(kind: TranscriptKind, text: String, confidence: Option<f32>) -> Translation {
    Translation::Transcript(TranscriptEvent {
        kind,
        text,
        confidence,
        timestamp: Utc::now(),
    })
}

/// Relay-local intent of an inbound client JSON message.
///
/// Exactly one control message is recognized (the identify-client handshake);
/// every other JSON shape is a no-op and is never forwarded upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlIntent {
    /// `{"type":"ping","message":"identify_client"}` — answered locally
    IdentifyClient,

    /// Anything else, including JSON the provider protocol does not require
    None,
}

pub fn control_intent(raw: &Value) -> ControlIntent {
    let is_ping = raw.get("type").and_then(Value::as_str) == Some("ping");
    let is_identify = raw.get("message").and_then(Value::as_str) == Some("identify_client");

    if is_ping && is_identify {
        ControlIntent::IdentifyClient
    } else {
        ControlIntent::None
    }
}

/// Extract the provider-assigned session identifier from an open-confirmation
/// message, across provider generations. Used by the streaming connector to
/// detect that the upstream session is established.
pub fn session_open_id(raw: &Value) -> Option<String> {
    let tag = raw.get("type").and_then(Value::as_str)?;
    let id = match tag {
        "Metadata" => raw.get("request_id"),
        "Begin" => raw.get("id"),
        "session.begins" => raw.get("session_id"),
        _ => None,
    };
    id.and_then(Value::as_str).map(str::to_string)
}
