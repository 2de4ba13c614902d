//! Error types for the admission and scheduling pipeline.

use std::time::Duration;

/// Pipeline stage whose external collaborator failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Speech-to-text transcription.
    Stt,
    /// Text generation.
    Llm,
    /// Speech synthesis.
    Tts,
}

impl StageKind {
    /// Human-readable label used in error messages.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Stt => "STT",
            Self::Llm => "LLM",
            Self::Tts => "TTS",
        }
    }

    /// Coarse wire code for a failure in this stage.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Stt => "STT_FAILED",
            Self::Llm => "LLM_FAILED",
            Self::Tts => "TTS_FAILED",
        }
    }
}

/// Top-level error type for the request pipeline.
///
/// Admission-time variants are returned synchronously from `submit` and
/// never enqueue; execution-time variants are converted into a failure
/// result and delivered through the request's sink.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Session token is unknown or has expired.
    #[error("invalid or expired session token")]
    InvalidSession,

    /// Client exceeded the sliding-window request rate.
    #[error("rate limit exceeded; retry after {:.1}s", retry_after.as_secs_f64())]
    RateLimitExceeded {
        /// Time until the oldest windowed request ages out.
        retry_after: Duration,
    },

    /// Client has too many admitted-but-unfinished requests.
    #[error("too many concurrent requests")]
    ConcurrentLimitExceeded,

    /// The request queue is at capacity.
    #[error("request queue is full")]
    QueueFull,

    /// Payload failed resource validation (size caps, corrupt audio).
    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    /// Overall per-request wall-clock timeout fired.
    #[error("request processing timeout after {secs}s")]
    ProcessingTimeout {
        /// The configured timeout that was exceeded.
        secs: u64,
    },

    /// An external collaborator failed during a stage.
    #[error("{} error: {message}", stage.label())]
    Stage {
        /// Which stage failed.
        stage: StageKind,
        /// Collaborator-supplied failure message.
        message: String,
    },

    /// Request type string not recognized at the protocol boundary.
    #[error("unknown request type: {0}")]
    UnknownRequestType(String),

    /// Internal channel or task coordination failure.
    #[error("channel error: {0}")]
    Channel(String),
}

impl PipelineError {
    /// Coarse wire code delivered in `error` envelopes.
    ///
    /// Classification is an exhaustive match over the taxonomy; the
    /// transport layer above only forwards the code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSession => "SESSION_INVALID",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::ConcurrentLimitExceeded => "CONCURRENT_LIMIT_EXCEEDED",
            Self::QueueFull => "QUEUE_FULL",
            Self::ResourceLimitExceeded(_) => "RESOURCE_LIMIT_EXCEEDED",
            Self::ProcessingTimeout { .. } => "PROCESSING_TIMEOUT",
            Self::Stage { stage, .. } => stage.code(),
            Self::UnknownRequestType(_) => "INVALID_MESSAGE_TYPE",
            Self::Channel(_) => "UNKNOWN_ERROR",
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, PipelineError>;
