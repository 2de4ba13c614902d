//! Synchronous admission checks in front of the queue.
//!
//! Every submission passes the full gate in a fixed order — session
//! validation, rate limit, per-client concurrency, queue capacity,
//! payload validation — and a failure at any step is a typed rejection
//! that never enqueues anything. Only an admitted request consumes a
//! concurrency slot.

use crate::auth::AuthGate;
use crate::config::ResourceLimits;
use crate::error::{PipelineError, Result};
use crate::request::{PipelineRequest, RequestPayload, RequestType, Stage};
use crate::scheduler::SchedulerCore;
use crate::sink::{self, EventSink};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One client turn offered for admission.
pub struct Submission {
    /// What kind of turn this is.
    pub request_type: RequestType,
    /// Session token presented by the client.
    pub session_token: String,
    /// Request payload.
    pub payload: RequestPayload,
    /// Explicit priority; `None` takes the type's default.
    pub priority: Option<u8>,
    /// Sink that will receive this request's events.
    pub sink: Arc<dyn EventSink>,
}

/// Gatekeeper between the serving layer and the scheduler.
pub struct AdmissionController {
    auth: Arc<AuthGate>,
    core: Arc<SchedulerCore>,
    limits: ResourceLimits,
}

impl AdmissionController {
    pub(crate) fn new(auth: Arc<AuthGate>, core: Arc<SchedulerCore>, limits: ResourceLimits) -> Self {
        Self { auth, core, limits }
    }

    /// Admit a submission into the queue or reject it.
    ///
    /// On success the request id is returned, the client's concurrency
    /// count has been incremented (it is released when execution finishes),
    /// and a `queued` status event carrying the queue position and an
    /// advisory wait estimate has been sent to the sink.
    ///
    /// # Errors
    ///
    /// One typed error per failed check: [`PipelineError::InvalidSession`],
    /// [`PipelineError::RateLimitExceeded`],
    /// [`PipelineError::ConcurrentLimitExceeded`],
    /// [`PipelineError::QueueFull`], or
    /// [`PipelineError::ResourceLimitExceeded`].
    pub async fn submit(&self, submission: Submission) -> Result<String> {
        match self.admit(submission).await {
            Ok(id) => Ok(id),
            Err(e) => {
                self.core.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("submission rejected: {e}");
                Err(e)
            }
        }
    }

    async fn admit(&self, submission: Submission) -> Result<String> {
        let client_ip = self
            .auth
            .validate_session_token(&submission.session_token)
            .ok_or(PipelineError::InvalidSession)?;

        if let Err(retry_after) = self.auth.check_rate_limit(&client_ip) {
            return Err(PipelineError::RateLimitExceeded { retry_after });
        }

        if !self.auth.check_concurrent_limit(&client_ip) {
            return Err(PipelineError::ConcurrentLimitExceeded);
        }

        if self.core.queue.is_full() {
            return Err(PipelineError::QueueFull);
        }

        self.validate_payload(submission.request_type, &submission.payload)?;

        let priority = submission
            .priority
            .unwrap_or_else(|| submission.request_type.default_priority());
        let estimated_duration = estimate_duration(submission.request_type, &submission.payload);
        let id = format!(
            "{}_{}",
            submission.request_type.as_str(),
            uuid::Uuid::new_v4()
        );

        // The slot is held from admission until execution cleanup, so a
        // client is throttled on admitted-but-unfinished work, queued
        // requests included.
        self.auth.increment_concurrent(&client_ip);

        let request = PipelineRequest {
            id: id.clone(),
            request_type: submission.request_type,
            client_ip: client_ip.clone(),
            session_token: submission.session_token,
            payload: submission.payload,
            submitted_at: chrono::Utc::now(),
            priority,
            estimated_duration,
            sink: Arc::clone(&submission.sink),
        };

        // Capacity was checked above, but another submission may have won
        // the race; a late rejection must release the slot it took.
        let position = match self.core.queue.try_push(request) {
            Ok(position) => position,
            Err(e) => {
                self.auth.decrement_concurrent(&client_ip);
                return Err(e);
            }
        };

        self.core.counters.total.fetch_add(1, Ordering::Relaxed);
        let estimated_wait = self.core.estimated_wait_secs();
        info!(
            "admitted request {id} (priority {priority}, queue position {position}, \
             est. wait {estimated_wait:.1}s)"
        );

        sink::emit_status(
            submission.sink.as_ref(),
            &id,
            Stage::Queued,
            json!({
                "queue_position": position,
                "estimated_wait": estimated_wait,
            }),
        )
        .await;

        Ok(id)
    }

    fn validate_payload(&self, request_type: RequestType, payload: &RequestPayload) -> Result<()> {
        if payload.total_bytes() > self.limits.max_payload_bytes {
            return Err(PipelineError::ResourceLimitExceeded(format!(
                "payload size {} bytes exceeds {} byte limit",
                payload.total_bytes(),
                self.limits.max_payload_bytes
            )));
        }

        if request_type == RequestType::Audio {
            let Some(audio) = payload.audio.as_ref() else {
                return Err(PipelineError::ResourceLimitExceeded(
                    "no audio data provided".to_owned(),
                ));
            };
            let size_mb = audio.len() as f64 / (1024.0 * 1024.0);
            if size_mb > self.limits.max_audio_size_mb {
                return Err(PipelineError::ResourceLimitExceeded(format!(
                    "audio size {size_mb:.1}MB exceeds {:.1}MB limit",
                    self.limits.max_audio_size_mb
                )));
            }
            if audio.len() < self.limits.min_audio_size_bytes {
                return Err(PipelineError::ResourceLimitExceeded(format!(
                    "audio data too short: {} bytes (minimum {})",
                    audio.len(),
                    self.limits.min_audio_size_bytes
                )));
            }
        }

        Ok(())
    }
}

/// Advisory processing-time estimate: the type's base plus an audio-size
/// term of half a second per megabyte, capped at five seconds.
fn estimate_duration(request_type: RequestType, payload: &RequestPayload) -> Duration {
    let base = request_type.base_estimate();
    let audio_bytes = payload.audio.as_ref().map_or(0, Vec::len);
    if audio_bytes == 0 {
        return base;
    }
    let size_mb = audio_bytes as f64 / (1024.0 * 1024.0);
    base + Duration::from_secs_f64(f64::min(size_mb * 0.5, 5.0))
}
