//! JSON wire envelope for client-bound messages.
//!
//! Every message serializes to a flat object with a `type` discriminant,
//! an ISO-8601 `timestamp`, and a protocol `version`, matching the shapes
//! the client transport already speaks.

use crate::request::Stage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Protocol version stamped on every message.
pub const WIRE_VERSION: &str = "1.0";

/// A client-bound message body, discriminated by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    /// Stage transition for a request.
    PipelineStatus {
        request_id: String,
        status: Stage,
        data: Value,
    },
    /// Intermediate transcription text.
    TranscriptionPartial {
        request_id: String,
        text: String,
        is_final: bool,
    },
    /// Final transcription result.
    Transcription {
        request_id: String,
        text: String,
        metadata: Value,
    },
    /// Intermediate generated text.
    LlmResponsePartial {
        request_id: String,
        text: String,
        is_final: bool,
    },
    /// Final generated text.
    LlmResponse {
        request_id: String,
        text: String,
        metadata: Value,
    },
    /// Synthesized audio delivery begins.
    TtsStart { request_id: String },
    /// One chunk of synthesized audio.
    TtsChunk {
        request_id: String,
        /// Base64-encoded audio bytes.
        audio_chunk: String,
        /// Audio container format (e.g. `wav`).
        format: String,
    },
    /// Synthesized audio delivery complete.
    TtsEnd { request_id: String },
    /// Terminal failure for a request.
    Error {
        request_id: String,
        error: String,
        code: &'static str,
    },
}

impl EventBody {
    /// The wire `type` discriminant for this body.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PipelineStatus { .. } => "pipeline_status",
            Self::TranscriptionPartial { .. } => "transcription_partial",
            Self::Transcription { .. } => "transcription",
            Self::LlmResponsePartial { .. } => "llm_response_partial",
            Self::LlmResponse { .. } => "llm_response",
            Self::TtsStart { .. } => "tts_start",
            Self::TtsChunk { .. } => "tts_chunk",
            Self::TtsEnd { .. } => "tts_end",
            Self::Error { .. } => "error",
        }
    }
}

/// Complete wire message: body plus the common envelope fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireEvent {
    /// Message payload, flattened so `type` sits at the top level.
    #[serde(flatten)]
    pub body: EventBody,
    /// Emission time, serialized as ISO-8601.
    pub timestamp: DateTime<Utc>,
    /// Protocol version.
    pub version: &'static str,
}

impl WireEvent {
    /// Wrap a body in the envelope, stamping the current time.
    #[must_use]
    pub fn new(body: EventBody) -> Self {
        Self {
            body,
            timestamp: Utc::now(),
            version: WIRE_VERSION,
        }
    }

    /// The wire `type` discriminant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }
}
