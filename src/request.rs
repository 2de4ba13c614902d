//! Request, result, and stage types flowing through the scheduler.

use crate::error::PipelineError;
use crate::sink::EventSink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Types of client turns the pipeline can handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// Assistant-initiated greeting when the client starts listening.
    Greeting,
    /// A recorded user utterance to transcribe, answer, and voice.
    Audio,
    /// Assistant follow-up after the user stayed silent.
    SilentFollowup,
}

impl RequestType {
    /// Stable identifier used in request ids and metadata.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::Audio => "audio",
            Self::SilentFollowup => "silent_followup",
        }
    }

    /// Priority assigned when the submitter does not override it.
    ///
    /// Silent follow-ups are the most latency-sensitive (the user is
    /// already waiting in silence), greetings next, audio turns normal.
    #[must_use]
    pub fn default_priority(self) -> u8 {
        match self {
            Self::Audio => 1,
            Self::Greeting => 2,
            Self::SilentFollowup => 3,
        }
    }

    /// Base processing-time estimate for this request type.
    #[must_use]
    pub fn base_estimate(self) -> Duration {
        match self {
            Self::Greeting => Duration::from_secs(3),
            Self::Audio => Duration::from_secs(8),
            Self::SilentFollowup => Duration::from_secs(4),
        }
    }
}

impl FromStr for RequestType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "greeting" => Ok(Self::Greeting),
            "audio" => Ok(Self::Audio),
            "silent_followup" => Ok(Self::SilentFollowup),
            other => Err(PipelineError::UnknownRequestType(other.to_owned())),
        }
    }
}

/// Request-specific payload counted against the resource limits.
#[derive(Debug, Clone, Default)]
pub struct RequestPayload {
    /// Encoded audio bytes for [`RequestType::Audio`] turns.
    pub audio: Option<Vec<u8>>,
    /// Silence escalation tier for [`RequestType::SilentFollowup`] turns.
    pub tier: usize,
    /// Optional free-form text attachment.
    pub text: Option<String>,
}

impl RequestPayload {
    /// Payload with only audio bytes.
    #[must_use]
    pub fn audio(bytes: Vec<u8>) -> Self {
        Self {
            audio: Some(bytes),
            ..Self::default()
        }
    }

    /// Payload carrying a silence tier.
    #[must_use]
    pub fn tier(tier: usize) -> Self {
        Self {
            tier,
            ..Self::default()
        }
    }

    /// Aggregate size of all string/byte fields.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.audio.as_ref().map_or(0, Vec::len) + self.text.as_ref().map_or(0, String::len)
    }
}

/// An admitted request waiting in the queue or executing.
///
/// Immutable after admission; destroyed once its result is delivered.
#[derive(Clone)]
pub struct PipelineRequest {
    /// Unique request id (`<type>_<uuid>`).
    pub id: String,
    /// What kind of turn this is.
    pub request_type: RequestType,
    /// Owning client IP, used for concurrency accounting.
    pub client_ip: String,
    /// Session token the request was admitted under.
    pub session_token: String,
    /// Request payload.
    pub payload: RequestPayload,
    /// When the request was admitted.
    pub submitted_at: DateTime<Utc>,
    /// Scheduling priority; higher is dispatched first.
    pub priority: u8,
    /// Advisory processing-time estimate, used only for wait estimates.
    pub estimated_duration: Duration,
    /// Sink receiving this request's status, partial, and final events.
    pub sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for PipelineRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRequest")
            .field("id", &self.id)
            .field("request_type", &self.request_type)
            .field("client_ip", &self.client_ip)
            .field("priority", &self.priority)
            .field("estimated_duration", &self.estimated_duration)
            .finish_non_exhaustive()
    }
}

/// Final outcome of one request.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Id of the request this result belongs to.
    pub request_id: String,
    /// Whether processing completed.
    pub success: bool,
    /// Transcript for audio turns (may be present and empty).
    pub transcript: Option<String>,
    /// Generated response text.
    pub response_text: Option<String>,
    /// Synthesized audio bytes.
    pub audio: Option<Vec<u8>>,
    /// Failure message, set when `success` is false.
    pub error_message: Option<String>,
    /// Coarse wire code for the failure.
    pub error_code: Option<&'static str>,
    /// Stage metadata (`stt_metadata`, `llm_metadata`, request type, flags).
    pub metadata: serde_json::Value,
}

impl PipelineResult {
    /// A successful result skeleton for the given request.
    #[must_use]
    pub fn success(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            transcript: None,
            response_text: None,
            audio: None,
            error_message: None,
            error_code: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// A failure result carrying the error's message and wire code.
    #[must_use]
    pub fn failure(request_id: impl Into<String>, error: &PipelineError) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            transcript: None,
            response_text: None,
            audio: None,
            error_message: Some(error.to_string()),
            error_code: Some(error.code()),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Wire-visible processing stage of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// No request in flight.
    Idle,
    /// Connection-level authentication in progress.
    Authenticating,
    /// Admitted and waiting in the priority queue.
    Queued,
    /// Speech-to-text running (audio turns only).
    Transcribing,
    /// Text generation running.
    ProcessingLlm,
    /// Speech synthesis running.
    GeneratingSpeech,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Error,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn default_priorities() {
        assert_eq!(RequestType::Audio.default_priority(), 1);
        assert_eq!(RequestType::Greeting.default_priority(), 2);
        assert_eq!(RequestType::SilentFollowup.default_priority(), 3);
    }

    #[test]
    fn request_type_round_trips_through_str() {
        for ty in [RequestType::Greeting, RequestType::Audio, RequestType::SilentFollowup] {
            assert_eq!(ty.as_str().parse::<RequestType>().unwrap(), ty);
        }
    }

    #[test]
    fn unknown_type_string_is_a_typed_error() {
        let err = "telepathy".parse::<RequestType>().unwrap_err();
        assert_eq!(err.code(), "INVALID_MESSAGE_TYPE");
    }

    #[test]
    fn stage_serializes_to_wire_names() {
        let json = serde_json::to_value(Stage::ProcessingLlm).unwrap();
        assert_eq!(json, serde_json::json!("processing_llm"));
        let json = serde_json::to_value(Stage::GeneratingSpeech).unwrap();
        assert_eq!(json, serde_json::json!("generating_speech"));
    }

    #[test]
    fn failure_result_carries_message_and_code() {
        let result = PipelineResult::failure("req_1", &PipelineError::QueueFull);
        assert!(!result.success);
        assert_eq!(result.error_code, Some("QUEUE_FULL"));
        assert_eq!(result.error_message.as_deref(), Some("request queue is full"));
    }
}
