//! Contracts for the external transcription, generation, and synthesis
//! services.
//!
//! The pipeline consumes these at the signature level only; engines live
//! elsewhere. The transcriber is blocking and is always run off the
//! dispatch path via `spawn_blocking`.

use crate::error::Result;
use crate::session::ChatMessage;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Speech-to-text engine. Blocking and CPU-bound.
pub trait Transcriber: Send + Sync + 'static {
    /// Transcribe encoded audio, returning the text and engine metadata.
    fn transcribe(&self, audio: &[u8]) -> Result<(String, Value)>;
}

/// Input to one text generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// The user-facing prompt for this turn.
    pub prompt: String,
    /// System prompt for the generation.
    pub system_prompt: String,
    /// Conversation context for the generation. One-off generations pass
    /// their transient context here instead of mutating shared history.
    pub context: Vec<ChatMessage>,
    /// Sampling temperature.
    pub temperature: f32,
}

/// Output of one text generation.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Generated response text.
    pub text: String,
    /// Engine metadata (token counts, model id, timings).
    pub metadata: Value,
}

/// Text generation engine.
#[async_trait]
pub trait Generator: Send + Sync + 'static {
    /// Generate a response for the given prompt and context.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutput>;
}

/// Speech synthesis engine.
#[async_trait]
pub trait Synthesizer: Send + Sync + 'static {
    /// Synthesize speech audio for the given text.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;

    /// Audio container format of synthesized output.
    fn output_format(&self) -> &str {
        "wav"
    }
}

/// The external collaborators one pipeline instance drives.
pub struct Collaborators {
    /// Speech-to-text engine.
    pub transcriber: Arc<dyn Transcriber>,
    /// Text generation engine.
    pub generator: Arc<dyn Generator>,
    /// Speech synthesis engine.
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl Clone for Collaborators {
    fn clone(&self) -> Self {
        Self {
            transcriber: Arc::clone(&self.transcriber),
            generator: Arc::clone(&self.generator),
            synthesizer: Arc::clone(&self.synthesizer),
        }
    }
}
