//! Dispatch loop and bounded concurrent execution.
//!
//! The loop pops one request at a time and spawns an execution unit for
//! it; it never limits parallelism itself. Each unit registers in the
//! active set, acquires a permit from the fixed pool, runs the stage
//! machine under the overall timeout, and delivers the result. Cleanup
//! (active-set removal and the per-client concurrency decrement) is a
//! drop guard, so it runs exactly once on every exit path.

use crate::auth::AuthGate;
use crate::config::{ProfileConfig, ResourceLimits};
use crate::error::PipelineError;
use crate::orchestrator;
use crate::request::{PipelineRequest, PipelineResult};
use crate::scheduler::{ActiveEntry, SchedulerCore};
use crate::session::SessionStore;
use crate::sink;
use crate::stages::Collaborators;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Everything an execution unit needs, shared across units.
pub(crate) struct ExecutorContext {
    pub core: Arc<SchedulerCore>,
    pub auth: Arc<AuthGate>,
    pub sessions: Arc<SessionStore>,
    pub collaborators: Collaborators,
    pub limits: ResourceLimits,
    pub profile: ProfileConfig,
}

/// Run the dispatch loop until cancelled.
pub(crate) async fn run_dispatch_loop(ctx: Arc<ExecutorContext>, cancel: CancellationToken) {
    info!("dispatch loop started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            request = ctx.core.queue.pop() => {
                debug!(
                    "dispatching request {} (type: {}, priority: {})",
                    request.id,
                    request.request_type.as_str(),
                    request.priority
                );
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    execute(ctx, request).await;
                });
            }
        }
    }
    ctx.core.running.store(false, Ordering::SeqCst);
    info!("dispatch loop stopped");
}

/// Cleanup that must run exactly once per request, on every exit path.
struct CleanupGuard {
    core: Arc<SchedulerCore>,
    auth: Arc<AuthGate>,
    request_id: String,
    client_ip: String,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.core.lock_active().remove(&self.request_id);
        self.auth.decrement_concurrent(&self.client_ip);
    }
}

/// Run one admitted request to completion and deliver its result.
async fn execute(ctx: Arc<ExecutorContext>, request: PipelineRequest) {
    let request_id = request.id.clone();
    let client_ip = request.client_ip.clone();
    let sink = Arc::clone(&request.sink);
    let audio_format = ctx.collaborators.synthesizer.output_format().to_owned();

    ctx.core.lock_active().insert(
        request_id.clone(),
        ActiveEntry {
            request_type: request.request_type,
            client_ip: client_ip.clone(),
        },
    );
    let _cleanup = CleanupGuard {
        core: Arc::clone(&ctx.core),
        auth: Arc::clone(&ctx.auth),
        request_id: request_id.clone(),
        client_ip,
    };

    let timeout_secs = ctx.limits.max_processing_time_secs;
    let outcome = match ctx.core.semaphore.acquire().await {
        Ok(permit) => {
            let outcome = match tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                orchestrator::process(&ctx, request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::ProcessingTimeout { secs: timeout_secs }),
            };
            drop(permit);
            outcome
        }
        Err(e) => Err(PipelineError::Channel(format!("permit pool closed: {e}"))),
    };

    let result = match outcome {
        Ok(result) => {
            ctx.core.counters.completed.fetch_add(1, Ordering::Relaxed);
            result
        }
        Err(e) => {
            error!("request {request_id} failed: {e}");
            ctx.core.counters.failed.fetch_add(1, Ordering::Relaxed);
            PipelineResult::failure(&request_id, &e)
        }
    };

    sink::emit_result(sink.as_ref(), &result, &audio_format).await;
}
