//! Best-effort event delivery to the originating client.
//!
//! The pipeline does not own the client transport; it hands every message
//! to an [`EventSink`] bound to the request. Delivery is fire-and-forget:
//! failures are logged and never surface to the scheduling path.

use crate::events::{EventBody, WireEvent};
use crate::request::{PipelineResult, Stage};
use async_trait::async_trait;
use base64::Engine as _;
use serde_json::Value;
use tracing::warn;

/// Delivery contract for client-bound events. Transports only need to
/// implement this trait.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one wire event to the client.
    async fn send(&self, event: WireEvent) -> anyhow::Result<()>;
}

/// Send an event, logging (never propagating) delivery failures.
pub(crate) async fn emit(sink: &dyn EventSink, body: EventBody) {
    let event = WireEvent::new(body);
    let kind = event.kind();
    if let Err(e) = sink.send(event).await {
        warn!("failed to deliver {kind} event: {e}");
    }
}

/// Emit a stage-transition status event.
pub(crate) async fn emit_status(sink: &dyn EventSink, request_id: &str, status: Stage, data: Value) {
    emit(
        sink,
        EventBody::PipelineStatus {
            request_id: request_id.to_owned(),
            status,
            data,
        },
    )
    .await;
}

/// Deliver a final result as its wire message sequence.
///
/// Success fans out, in order: `transcription` (when a transcript exists),
/// `llm_response` (when response text exists), then `tts_start`,
/// `tts_chunk`, `tts_end` when audio was produced. Failure is a single
/// `error` message with the coarse code.
pub(crate) async fn emit_result(sink: &dyn EventSink, result: &PipelineResult, audio_format: &str) {
    if !result.success {
        emit(
            sink,
            EventBody::Error {
                request_id: result.request_id.clone(),
                error: result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_owned()),
                code: result.error_code.unwrap_or("UNKNOWN_ERROR"),
            },
        )
        .await;
        return;
    }

    if let Some(transcript) = &result.transcript {
        emit(
            sink,
            EventBody::Transcription {
                request_id: result.request_id.clone(),
                text: transcript.clone(),
                metadata: result
                    .metadata
                    .get("stt_metadata")
                    .cloned()
                    .unwrap_or(Value::Null),
            },
        )
        .await;
    }

    if let Some(text) = &result.response_text {
        emit(
            sink,
            EventBody::LlmResponse {
                request_id: result.request_id.clone(),
                text: text.clone(),
                metadata: result
                    .metadata
                    .get("llm_metadata")
                    .cloned()
                    .unwrap_or(Value::Null),
            },
        )
        .await;
    }

    if let Some(audio) = &result.audio {
        emit(
            sink,
            EventBody::TtsStart {
                request_id: result.request_id.clone(),
            },
        )
        .await;
        emit(
            sink,
            EventBody::TtsChunk {
                request_id: result.request_id.clone(),
                audio_chunk: base64::engine::general_purpose::STANDARD.encode(audio),
                format: audio_format.to_owned(),
            },
        )
        .await;
        emit(
            sink,
            EventBody::TtsEnd {
                request_id: result.request_id.clone(),
            },
        )
        .await;
    }
}
