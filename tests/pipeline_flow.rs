//! End-to-end pipeline tests with fake collaborators and a collecting
//! sink.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use voxgate::admission::Submission;
use voxgate::config::PipelineConfig;
use voxgate::events::{EventBody, WireEvent};
use voxgate::stages::{Generator, Synthesizer, Transcriber};
use voxgate::{
    Collaborators, EventSink, GenerationOutput, GenerationRequest, PipelineError, RequestPayload,
    RequestType, Stage, StageKind, VoicePipeline,
};

struct FakeTranscriber {
    transcript: String,
    calls: AtomicUsize,
}

impl Transcriber for FakeTranscriber {
    fn transcribe(&self, _audio: &[u8]) -> voxgate::Result<(String, Value)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.transcript.clone(), json!({ "engine": "fake-stt" })))
    }
}

struct FakeGenerator {
    delay: Duration,
    fail: bool,
    calls: AtomicUsize,
    inflight: AtomicUsize,
    max_inflight: AtomicUsize,
    last_request: Mutex<Option<GenerationRequest>>,
}

impl FakeGenerator {
    fn new(delay: Duration, fail: bool) -> Self {
        Self {
            delay,
            fail,
            calls: AtomicUsize::new(0),
            inflight: AtomicUsize::new(0),
            max_inflight: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(&self, request: GenerationRequest) -> voxgate::Result<GenerationOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inflight.fetch_max(now, Ordering::SeqCst);
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        self.inflight.fetch_sub(1, Ordering::SeqCst);

        let prompt = request.prompt.clone();
        *self.last_request.lock().unwrap() = Some(request);
        if self.fail {
            return Err(PipelineError::Stage {
                stage: StageKind::Llm,
                message: "model crashed".to_owned(),
            });
        }
        Ok(GenerationOutput {
            text: format!("echo: {prompt}"),
            metadata: json!({ "model": "fake-llm" }),
        })
    }
}

struct FakeSynthesizer {
    calls: AtomicUsize,
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, _text: &str) -> voxgate::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![7u8; 16])
    }
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<WireEvent>>,
}

impl CollectingSink {
    fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(WireEvent::kind).collect()
    }

    fn statuses(&self) -> Vec<Stage> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match &e.body {
                EventBody::PipelineStatus { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    fn has(&self, kind: &str) -> bool {
        self.kinds().iter().any(|k| *k == kind)
    }

    fn error_code(&self) -> Option<&'static str> {
        self.events.lock().unwrap().iter().find_map(|e| match &e.body {
            EventBody::Error { code, .. } => Some(*code),
            _ => None,
        })
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn send(&self, event: WireEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

struct Harness {
    pipeline: VoicePipeline,
    transcriber: Arc<FakeTranscriber>,
    generator: Arc<FakeGenerator>,
    synthesizer: Arc<FakeSynthesizer>,
}

/// Initialize test logging once; override verbosity with RUST_LOG.
fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voxgate=info")),
            )
            .with_test_writer()
            .init();
    });
}

impl Harness {
    fn new(config: PipelineConfig, transcript: &str, delay: Duration, fail: bool) -> Self {
        init_logging();
        let transcriber = Arc::new(FakeTranscriber {
            transcript: transcript.to_owned(),
            calls: AtomicUsize::new(0),
        });
        let generator = Arc::new(FakeGenerator::new(delay, fail));
        let synthesizer = Arc::new(FakeSynthesizer {
            calls: AtomicUsize::new(0),
        });
        let pipeline = VoicePipeline::new(
            config,
            Collaborators {
                transcriber: Arc::clone(&transcriber) as Arc<dyn Transcriber>,
                generator: Arc::clone(&generator) as Arc<dyn Generator>,
                synthesizer: Arc::clone(&synthesizer) as Arc<dyn Synthesizer>,
            },
        );
        pipeline.start();
        Self {
            pipeline,
            transcriber,
            generator,
            synthesizer,
        }
    }

    fn token(&self, client_ip: &str) -> String {
        self.pipeline.auth().authenticate("", client_ip).unwrap()
    }

    async fn submit(
        &self,
        request_type: RequestType,
        token: &str,
        payload: RequestPayload,
        sink: Arc<CollectingSink>,
    ) -> voxgate::Result<String> {
        self.pipeline
            .submit(Submission {
                request_type,
                session_token: token.to_owned(),
                payload,
                priority: None,
                sink,
            })
            .await
    }
}

/// Poll until the condition holds, panicking after two seconds.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[tokio::test]
async fn audio_turn_emits_the_full_event_sequence() {
    let harness = Harness::new(PipelineConfig::default(), "what time is it", Duration::ZERO, false);
    let token = harness.token("10.0.0.1");
    let sink = Arc::new(CollectingSink::default());

    let audio = vec![0u8; 2 * 1024 * 1024];
    harness
        .submit(RequestType::Audio, &token, RequestPayload::audio(audio), Arc::clone(&sink))
        .await
        .unwrap();

    wait_until(|| sink.has("tts_end")).await;
    assert_eq!(
        sink.kinds(),
        vec![
            "pipeline_status",
            "pipeline_status",
            "transcription_partial",
            "pipeline_status",
            "llm_response_partial",
            "pipeline_status",
            "transcription",
            "llm_response",
            "tts_start",
            "tts_chunk",
            "tts_end",
        ]
    );
    assert_eq!(
        sink.statuses(),
        vec![Stage::Queued, Stage::Transcribing, Stage::ProcessingLlm, Stage::GeneratingSpeech]
    );

    // The turn joined the conversation.
    let session = harness.pipeline.sessions().session(&token);
    let history = session.history.lock().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history.messages()[0].content, "what time is it");
    assert_eq!(history.messages()[1].content, "echo: what time is it");
}

#[tokio::test]
async fn completed_request_releases_its_slot() {
    let harness = Harness::new(PipelineConfig::default(), "hello", Duration::ZERO, false);
    let token = harness.token("10.0.0.1");
    let sink = Arc::new(CollectingSink::default());

    harness
        .submit(
            RequestType::Audio,
            &token,
            RequestPayload::audio(vec![0u8; 4096]),
            Arc::clone(&sink),
        )
        .await
        .unwrap();

    wait_until(|| sink.has("tts_end")).await;
    wait_until(|| harness.pipeline.stats().active_count == 0).await;
    assert_eq!(harness.pipeline.auth().concurrent_count("10.0.0.1"), 0);

    let stats = harness.pipeline.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.completed_requests, 1);
    assert_eq!(stats.failed_requests, 0);
    assert!(stats.is_running);

    harness.pipeline.shutdown().await;
    assert!(!harness.pipeline.stats().is_running);
}

#[tokio::test]
async fn empty_transcript_invokes_no_generation_or_synthesis() {
    let harness = Harness::new(PipelineConfig::default(), "   ", Duration::ZERO, false);
    let token = harness.token("10.0.0.1");
    let sink = Arc::new(CollectingSink::default());

    harness
        .submit(
            RequestType::Audio,
            &token,
            RequestPayload::audio(vec![0u8; 4096]),
            Arc::clone(&sink),
        )
        .await
        .unwrap();

    wait_until(|| harness.pipeline.stats().completed_requests == 1).await;
    assert_eq!(harness.transcriber.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.generator.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.synthesizer.calls.load(Ordering::SeqCst), 0);

    // Only the transcription (empty) made it to the wire.
    let kinds = sink.kinds();
    assert!(kinds.contains(&"transcription"));
    assert!(!kinds.contains(&"llm_response"));
    assert!(!kinds.contains(&"tts_start"));

    let session = harness.pipeline.sessions().session(&token);
    assert!(session.history.lock().await.is_empty());
}

#[tokio::test]
async fn execution_parallelism_never_exceeds_the_permit_pool() {
    let harness = Harness::new(
        PipelineConfig::default(),
        "hello",
        Duration::from_millis(50),
        false,
    );
    let token_a = harness.token("10.0.0.1");
    let token_b = harness.token("10.0.0.2");

    for token in [&token_a, &token_a, &token_a, &token_b, &token_b, &token_b] {
        harness
            .submit(
                RequestType::Audio,
                token,
                RequestPayload::audio(vec![0u8; 4096]),
                Arc::new(CollectingSink::default()),
            )
            .await
            .unwrap();
    }

    wait_until(|| harness.pipeline.stats().completed_requests == 6).await;
    assert!(harness.generator.max_inflight.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn slow_request_times_out_with_its_slot_released() {
    let mut config = PipelineConfig::default();
    config.limits.max_processing_time_secs = 0;
    let harness = Harness::new(config, "hello", Duration::from_millis(50), false);
    let token = harness.token("10.0.0.1");
    let sink = Arc::new(CollectingSink::default());

    harness
        .submit(
            RequestType::Audio,
            &token,
            RequestPayload::audio(vec![0u8; 4096]),
            Arc::clone(&sink),
        )
        .await
        .unwrap();

    wait_until(|| sink.has("error")).await;
    assert_eq!(sink.error_code(), Some("PROCESSING_TIMEOUT"));

    wait_until(|| harness.pipeline.stats().active_count == 0).await;
    assert_eq!(harness.pipeline.auth().concurrent_count("10.0.0.1"), 0);
    assert_eq!(harness.pipeline.stats().failed_requests, 1);
}

#[tokio::test]
async fn failed_greeting_leaves_history_untouched() {
    let mut config = PipelineConfig::default();
    config.profile.user_name = Some("Ada".to_owned());
    let harness = Harness::new(config, "unused", Duration::ZERO, true);
    let token = harness.token("10.0.0.1");

    {
        let session = harness.pipeline.sessions().session(&token);
        let mut history = session.history.lock().await;
        history.push(voxgate::session::ChatMessage::user("earlier turn"));
    }

    let sink = Arc::new(CollectingSink::default());
    harness
        .submit(RequestType::Greeting, &token, RequestPayload::default(), Arc::clone(&sink))
        .await
        .unwrap();

    wait_until(|| sink.has("error")).await;
    assert_eq!(sink.error_code(), Some("LLM_FAILED"));
    assert!(!sink.has("tts_start"));

    let session = harness.pipeline.sessions().session(&token);
    let history = session.history.lock().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history.messages()[0].content, "earlier turn");
}

#[tokio::test]
async fn greeting_asserts_the_user_context_anchor() {
    let mut config = PipelineConfig::default();
    config.profile.user_name = Some("Ada".to_owned());
    let harness = Harness::new(config, "unused", Duration::ZERO, false);
    let token = harness.token("10.0.0.1");
    let sink = Arc::new(CollectingSink::default());

    harness
        .submit(RequestType::Greeting, &token, RequestPayload::default(), Arc::clone(&sink))
        .await
        .unwrap();

    wait_until(|| sink.has("tts_end")).await;
    let request = harness.generator.last_request.lock().unwrap().clone().unwrap();
    assert!(request.prompt.contains("Ada"));
    assert!(request.context.is_empty());

    let session = harness.pipeline.sessions().session(&token);
    let history = session.history.lock().await;
    assert!(history
        .messages()
        .iter()
        .any(|m| m.content.contains("The user's name is Ada")));
}

#[tokio::test]
async fn silent_followup_generates_without_joining_the_history() {
    let harness = Harness::new(PipelineConfig::default(), "unused", Duration::ZERO, false);
    let token = harness.token("10.0.0.1");
    let sink = Arc::new(CollectingSink::default());

    harness
        .submit(
            RequestType::SilentFollowup,
            &token,
            RequestPayload::tier(4),
            Arc::clone(&sink),
        )
        .await
        .unwrap();

    wait_until(|| sink.has("tts_end")).await;
    let request = harness.generator.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(request.prompt, "[still waiting]");

    let session = harness.pipeline.sessions().session(&token);
    assert!(session.history.lock().await.is_empty());
}

#[tokio::test]
async fn vision_context_marks_the_prompt_and_the_history() {
    let harness = Harness::new(PipelineConfig::default(), "what is in it", Duration::ZERO, false);
    let token = harness.token("10.0.0.1");
    harness
        .pipeline
        .sessions()
        .session(&token)
        .set_vision_context(Some("a photo of a bridge".to_owned()));

    let sink = Arc::new(CollectingSink::default());
    harness
        .submit(
            RequestType::Audio,
            &token,
            RequestPayload::audio(vec![0u8; 4096]),
            Arc::clone(&sink),
        )
        .await
        .unwrap();

    wait_until(|| sink.has("tts_end")).await;
    let request = harness.generator.last_request.lock().unwrap().clone().unwrap();
    assert!(request
        .prompt
        .ends_with("[Note: This question refers to the image I just analyzed.]"));
    assert!(request
        .context
        .iter()
        .any(|m| m.content == "[VISION CONTEXT]: a photo of a bridge"));
}

#[tokio::test]
async fn undersized_audio_is_rejected_before_any_stage_runs() {
    let harness = Harness::new(PipelineConfig::default(), "hello", Duration::ZERO, false);
    let token = harness.token("10.0.0.1");

    let err = harness
        .submit(
            RequestType::Audio,
            &token,
            RequestPayload::audio(vec![0u8; 512]),
            Arc::new(CollectingSink::default()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "RESOURCE_LIMIT_EXCEEDED");

    assert_eq!(harness.transcriber.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.generator.calls.load(Ordering::SeqCst), 0);
    let stats = harness.pipeline.stats();
    assert_eq!(stats.rejected_requests, 1);
    assert_eq!(stats.total_requests, 0);
}
