//! Per-request stage machine driving the external collaborators.
//!
//! `QUEUED → [TRANSCRIBING] → PROCESSING_LLM → GENERATING_SPEECH →
//! COMPLETED | ERROR`, with the transcription stage applying only to
//! audio turns. A status event is emitted before each stage's work
//! begins. Any stage failure aborts the remaining stages; nothing is
//! retried here.

use crate::error::{PipelineError, Result, StageKind};
use crate::request::{PipelineRequest, PipelineResult, RequestType, Stage};
use crate::scheduler::executor::ExecutorContext;
use crate::session::{ChatMessage, SessionState};
use crate::sink;
use crate::stages::GenerationRequest;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Sampling temperature for all pipeline generations.
const GENERATION_TEMPERATURE: f32 = 0.7;

/// Marker appended to the transcript when a vision context is set.
const VISION_MARKER: &str = " [Note: This question refers to the image I just analyzed.]";

/// Silence markers by escalation tier; tiers past the end clamp to the
/// last entry.
const SILENCE_MARKERS: [&str; 3] = ["[silent]", "[no response]", "[still waiting]"];

pub(crate) fn silence_marker(tier: usize) -> &'static str {
    SILENCE_MARKERS[tier.min(SILENCE_MARKERS.len() - 1)]
}

/// Wrap a collaborator failure in the stage it occurred in, keeping
/// already-classified stage errors as they are.
fn into_stage(stage: StageKind, error: PipelineError) -> PipelineError {
    match error {
        classified @ PipelineError::Stage { .. } => classified,
        other => PipelineError::Stage {
            stage,
            message: other.to_string(),
        },
    }
}

/// Drive one request through its stage sequence.
pub(crate) async fn process(
    ctx: &ExecutorContext,
    request: PipelineRequest,
) -> Result<PipelineResult> {
    let session = ctx.sessions.session(&request.session_token);

    // Bound the session history before any stage runs; anchors survive.
    {
        let mut history = session.history.lock().await;
        if history.truncate_to_recent_half(ctx.limits.max_conversation_len) {
            warn!(
                "trimmed conversation history to {} messages for request {}",
                history.len(),
                request.id
            );
        }
    }

    match request.request_type {
        RequestType::Greeting => process_greeting(ctx, &session, request).await,
        RequestType::Audio => process_audio(ctx, &session, request).await,
        RequestType::SilentFollowup => process_silent_followup(ctx, &session, request).await,
    }
}

/// Instruction template chosen on (known user name) × (non-empty history).
fn greeting_instruction(user_name: Option<&str>, has_history: bool) -> String {
    let familiarity = if has_history {
        "treat it like you've met them before"
    } else {
        "treat it like you're meeting them for the first time"
    };
    match user_name {
        Some(name) => format!(
            "Create a friendly greeting for {name} who just activated their microphone. \
             Be brief and conversational, but {familiarity}. Do not do anything else."
        ),
        None => format!(
            "Create a friendly greeting for someone who just activated their microphone. \
             Be brief and conversational, but {familiarity}. Do not do anything else."
        ),
    }
}

async fn process_greeting(
    ctx: &ExecutorContext,
    session: &Arc<SessionState>,
    request: PipelineRequest,
) -> Result<PipelineResult> {
    let request_id = request.id.clone();
    let sink = request.sink.as_ref();

    sink::emit_status(sink, &request_id, Stage::ProcessingLlm, Value::Null).await;

    let user_name = ctx.profile.user_name.as_deref();
    let has_history = !session.history.lock().await.is_empty();
    let instruction = greeting_instruction(user_name, has_history);

    // One-off generation: the greeting is not part of the conversation, so
    // it runs against an explicit empty context and the session history is
    // never touched. A generation failure therefore cannot corrupt it.
    let output = ctx
        .collaborators
        .generator
        .generate(GenerationRequest {
            prompt: instruction,
            system_prompt: ctx.profile.system_prompt.clone(),
            context: Vec::new(),
            temperature: GENERATION_TEMPERATURE,
        })
        .await
        .map_err(|e| into_stage(StageKind::Llm, e))?;

    sink::emit(
        sink,
        crate::events::EventBody::LlmResponsePartial {
            request_id: request_id.clone(),
            text: output.text.clone(),
            is_final: false,
        },
    )
    .await;

    // (Re)assert the user-context anchor now that the user is engaged.
    if let Some(name) = user_name {
        let mut history = session.history.lock().await;
        history.set_user_context(format!("USER CONTEXT: The user's name is {name}."));
    }

    sink::emit_status(sink, &request_id, Stage::GeneratingSpeech, Value::Null).await;
    let audio = ctx
        .collaborators
        .synthesizer
        .synthesize(&output.text)
        .await
        .map_err(|e| into_stage(StageKind::Tts, e))?;

    let mut result = PipelineResult::success(request_id);
    result.response_text = Some(output.text);
    result.audio = Some(audio);
    result.metadata = json!({ "type": "greeting", "llm_metadata": output.metadata });
    Ok(result)
}

async fn process_audio(
    ctx: &ExecutorContext,
    session: &Arc<SessionState>,
    request: PipelineRequest,
) -> Result<PipelineResult> {
    let request_id = request.id.clone();
    let sink = request.sink.as_ref();

    let audio = request.payload.audio.ok_or_else(|| {
        PipelineError::ResourceLimitExceeded("no audio data provided".to_owned())
    })?;

    sink::emit_status(sink, &request_id, Stage::Transcribing, Value::Null).await;

    // The transcriber is blocking and CPU-bound; keep it off the
    // scheduling path.
    let transcriber = Arc::clone(&ctx.collaborators.transcriber);
    let (transcript, stt_metadata) =
        tokio::task::spawn_blocking(move || transcriber.transcribe(&audio))
            .await
            .map_err(|e| PipelineError::Channel(format!("transcription task failed: {e}")))?
            .map_err(|e| into_stage(StageKind::Stt, e))?;

    if transcript.trim().is_empty() {
        // Nothing was said: report success without ever invoking
        // generation or synthesis.
        info!("empty transcript for request {request_id}; skipping generation");
        let mut result = PipelineResult::success(request_id);
        result.transcript = Some(transcript);
        result.metadata = json!({ "type": "audio", "empty_transcript": true });
        return Ok(result);
    }

    sink::emit(
        sink,
        crate::events::EventBody::TranscriptionPartial {
            request_id: request_id.clone(),
            text: transcript.clone(),
            is_final: false,
        },
    )
    .await;

    sink::emit_status(sink, &request_id, Stage::ProcessingLlm, Value::Null).await;

    let mut prompt = transcript.clone();
    if let Some(vision) = session.vision_context() {
        prompt.push_str(VISION_MARKER);
        let mut history = session.history.lock().await;
        history.push_vision_context(&vision);
    }

    let context = session.history.lock().await.messages().to_vec();
    let output = ctx
        .collaborators
        .generator
        .generate(GenerationRequest {
            prompt: prompt.clone(),
            system_prompt: ctx.profile.system_prompt.clone(),
            context,
            temperature: GENERATION_TEMPERATURE,
        })
        .await
        .map_err(|e| into_stage(StageKind::Llm, e))?;

    // This turn joins the conversation; append it under the session lock.
    {
        let mut history = session.history.lock().await;
        history.push(ChatMessage::user(prompt));
        history.push(ChatMessage::assistant(output.text.clone()));
    }

    sink::emit(
        sink,
        crate::events::EventBody::LlmResponsePartial {
            request_id: request_id.clone(),
            text: output.text.clone(),
            is_final: false,
        },
    )
    .await;

    sink::emit_status(sink, &request_id, Stage::GeneratingSpeech, Value::Null).await;
    let synthesized = ctx
        .collaborators
        .synthesizer
        .synthesize(&output.text)
        .await
        .map_err(|e| into_stage(StageKind::Tts, e))?;

    let mut result = PipelineResult::success(request_id);
    result.transcript = Some(transcript);
    result.response_text = Some(output.text);
    result.audio = Some(synthesized);
    result.metadata = json!({
        "type": "audio",
        "stt_metadata": stt_metadata,
        "llm_metadata": output.metadata,
    });
    Ok(result)
}

async fn process_silent_followup(
    ctx: &ExecutorContext,
    session: &Arc<SessionState>,
    request: PipelineRequest,
) -> Result<PipelineResult> {
    let request_id = request.id.clone();
    let sink = request.sink.as_ref();
    let tier = request.payload.tier;

    sink::emit_status(sink, &request_id, Stage::ProcessingLlm, Value::Null).await;

    // One-off generation against the current history snapshot; the
    // marker never joins the conversation.
    let context = session.history.lock().await.messages().to_vec();
    let output = ctx
        .collaborators
        .generator
        .generate(GenerationRequest {
            prompt: silence_marker(tier).to_owned(),
            system_prompt: ctx.profile.system_prompt.clone(),
            context,
            temperature: GENERATION_TEMPERATURE,
        })
        .await
        .map_err(|e| into_stage(StageKind::Llm, e))?;

    sink::emit(
        sink,
        crate::events::EventBody::LlmResponsePartial {
            request_id: request_id.clone(),
            text: output.text.clone(),
            is_final: false,
        },
    )
    .await;

    sink::emit_status(sink, &request_id, Stage::GeneratingSpeech, Value::Null).await;
    let audio = ctx
        .collaborators
        .synthesizer
        .synthesize(&output.text)
        .await
        .map_err(|e| into_stage(StageKind::Tts, e))?;

    let mut result = PipelineResult::success(request_id);
    result.response_text = Some(output.text);
    result.audio = Some(audio);
    result.metadata = json!({
        "type": "silent_followup",
        "tier": tier,
        "llm_metadata": output.metadata,
    });
    Ok(result)
}
