//! Shared event model for the realtime transcription wire protocol.
//!
//! This crate owns the wire representation consumed by the `voxline` live
//! client: the closed set of event kinds, the typed inbound event payloads,
//! and the outbound control frames. The envelope is typed while payload
//! sub-structures stay flexible (`serde_json::Value`), so unknown fields on
//! the wire never break a session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error returned by [`decode_event`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The frame text is not valid JSON.
    #[error("malformed event frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The frame carried a recognized `type` but its payload did not match
    /// the typed shape for that kind.
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: EventKind,
        source: serde_json::Error,
    },
}

// =============================================================================
// EVENT KINDS
// =============================================================================

/// Closed set of semantic event categories on the live wire.
///
/// Inbound frames carry the kind in their JSON `type` field; any value
/// outside this set classifies as [`EventKind::Unhandled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Open,
    Transcript,
    Metadata,
    SpeechStarted,
    UtteranceEnd,
    Close,
    Error,
    Unhandled,
}

impl EventKind {
    /// Every recognized kind, in wire order.
    pub const ALL: [EventKind; 8] = [
        EventKind::Open,
        EventKind::Transcript,
        EventKind::Metadata,
        EventKind::SpeechStarted,
        EventKind::UtteranceEnd,
        EventKind::Close,
        EventKind::Error,
        EventKind::Unhandled,
    ];

    /// Wire name of this kind (the value of the `type` discriminator).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Open => "Open",
            EventKind::Transcript => "Transcript",
            EventKind::Metadata => "Metadata",
            EventKind::SpeechStarted => "SpeechStarted",
            EventKind::UtteranceEnd => "UtteranceEnd",
            EventKind::Close => "Close",
            EventKind::Error => "Error",
            EventKind::Unhandled => "Unhandled",
        }
    }

    /// Parse a `type` discriminator value. `None` for anything outside the
    /// closed set (including `"Unhandled"`, which is never a wire value).
    #[must_use]
    pub fn from_type(value: &str) -> Option<EventKind> {
        match value {
            "Open" => Some(EventKind::Open),
            "Transcript" => Some(EventKind::Transcript),
            "Metadata" => Some(EventKind::Metadata),
            "SpeechStarted" => Some(EventKind::SpeechStarted),
            "UtteranceEnd" => Some(EventKind::UtteranceEnd),
            "Close" => Some(EventKind::Close),
            "Error" => Some(EventKind::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// INBOUND PAYLOADS
// =============================================================================

/// Connection-established marker. Carries no payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenEvent {}

/// A transcription result for a slice of the audio stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptEvent {
    pub channel_index: Vec<i64>,
    pub duration: f64,
    pub start: f64,
    pub is_final: bool,
    pub speech_final: bool,
    /// Channel payload: `{ "alternatives": [{ "transcript", "confidence",
    /// "words" }, ...] }`. Kept flexible; see [`TranscriptEvent::transcript`].
    pub channel: Value,
}

impl TranscriptEvent {
    /// Best-alternative transcript text, when present.
    #[must_use]
    pub fn transcript(&self) -> Option<&str> {
        self.channel
            .get("alternatives")?
            .get(0)?
            .get("transcript")?
            .as_str()
    }
}

/// Stream metadata sent by the server, typically once per session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataEvent {
    pub request_id: String,
    pub created: String,
    pub duration: f64,
    pub channels: i64,
    pub model_info: Value,
}

/// Voice activity detected at a point in the stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechStartedEvent {
    pub channel: Value,
    pub timestamp: f64,
}

/// The end of a spoken utterance, keyed by the last word's end time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UtteranceEndEvent {
    pub channel: Value,
    pub last_word_end: f64,
}

/// Session-closed marker. Carries no payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloseEvent {}

/// A failure, either reported by the server or raised locally by the client
/// loops to describe a transport condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorEvent {
    /// Where the failure surfaced, e.g. `"receive loop"`.
    pub description: String,
    /// Human-readable failure detail.
    pub message: String,
    /// Failure category label, e.g. `"ConnectionClosed"`.
    pub variant: String,
}

impl ErrorEvent {
    /// Build a locally-raised error event.
    pub fn new(
        description: impl Into<String>,
        message: impl Into<String>,
        variant: impl Into<String>,
    ) -> Self {
        Self {
            description: description.into(),
            message: message.into(),
            variant: variant.into(),
        }
    }
}

/// A frame whose `type` discriminator is missing or outside the closed set.
/// Carries the raw frame text untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnhandledEvent {
    pub raw: String,
}

// =============================================================================
// EVENT UNION
// =============================================================================

/// One decoded inbound event: the tagged union over every payload kind.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Open(OpenEvent),
    Transcript(TranscriptEvent),
    Metadata(MetadataEvent),
    SpeechStarted(SpeechStartedEvent),
    UtteranceEnd(UtteranceEndEvent),
    Close(CloseEvent),
    Error(ErrorEvent),
    Unhandled(UnhandledEvent),
}

impl LiveEvent {
    /// The kind tag of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            LiveEvent::Open(_) => EventKind::Open,
            LiveEvent::Transcript(_) => EventKind::Transcript,
            LiveEvent::Metadata(_) => EventKind::Metadata,
            LiveEvent::SpeechStarted(_) => EventKind::SpeechStarted,
            LiveEvent::UtteranceEnd(_) => EventKind::UtteranceEnd,
            LiveEvent::Close(_) => EventKind::Close,
            LiveEvent::Error(_) => EventKind::Error,
            LiveEvent::Unhandled(_) => EventKind::Unhandled,
        }
    }
}

// =============================================================================
// DECODE
// =============================================================================

/// Decode one inbound text frame into a typed event.
///
/// Returns `Ok(None)` for frames with no usable content (empty text), which
/// callers skip. A missing or unrecognized `type` discriminator yields an
/// [`LiveEvent::Unhandled`] carrying the raw text.
///
/// # Errors
///
/// [`DecodeError::Malformed`] for text that is not JSON and
/// [`DecodeError::Payload`] for a recognized kind whose payload does not
/// match its typed shape.
pub fn decode_event(text: &str) -> Result<Option<LiveEvent>, DecodeError> {
    if text.trim().is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(text)?;
    let Some(kind) = value
        .get("type")
        .and_then(Value::as_str)
        .and_then(EventKind::from_type)
    else {
        return Ok(Some(LiveEvent::Unhandled(UnhandledEvent {
            raw: text.to_owned(),
        })));
    };

    let event = match kind {
        EventKind::Open => LiveEvent::Open(payload(kind, value)?),
        EventKind::Transcript => LiveEvent::Transcript(payload(kind, value)?),
        EventKind::Metadata => LiveEvent::Metadata(payload(kind, value)?),
        EventKind::SpeechStarted => LiveEvent::SpeechStarted(payload(kind, value)?),
        EventKind::UtteranceEnd => LiveEvent::UtteranceEnd(payload(kind, value)?),
        EventKind::Close => LiveEvent::Close(payload(kind, value)?),
        EventKind::Error => LiveEvent::Error(payload(kind, value)?),
        EventKind::Unhandled => LiveEvent::Unhandled(UnhandledEvent {
            raw: text.to_owned(),
        }),
    };
    Ok(Some(event))
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: EventKind,
    value: Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|source| DecodeError::Payload { kind, source })
}

// =============================================================================
// OUTBOUND CONTROL FRAMES
// =============================================================================

/// Outbound control messages the client sends over the live wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ControlFrame {
    /// Periodic liveness signal preventing idle-timeout termination.
    KeepAlive,
    /// Ask the server to flush any buffered transcription results.
    Finalize,
    /// Announce the end of the outbound stream before disconnecting.
    CloseStream,
}

impl ControlFrame {
    /// Wire encoding, e.g. `{"type":"KeepAlive"}`.
    #[must_use]
    pub fn to_text(self) -> String {
        // Serializing a unit-variant tagged enum is infallible.
        serde_json::to_string(&self).unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
