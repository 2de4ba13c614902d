//! Pipeline facade wiring the gate, sessions, admission, and scheduler.

use crate::admission::{AdmissionController, Submission};
use crate::auth::AuthGate;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::scheduler::executor::{self, ExecutorContext};
use crate::scheduler::{SchedulerCore, SchedulerStats};
use crate::session::SessionStore;
use crate::stages::Collaborators;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A fully wired voice pipeline instance.
///
/// Construction wires the components; nothing executes until [`start`]
/// spawns the dispatch loop. [`shutdown`] cancels it and waits for the
/// loop (not in-flight requests) to exit.
///
/// [`start`]: VoicePipeline::start
/// [`shutdown`]: VoicePipeline::shutdown
pub struct VoicePipeline {
    auth: Arc<AuthGate>,
    sessions: Arc<SessionStore>,
    core: Arc<SchedulerCore>,
    admission: AdmissionController,
    ctx: Arc<ExecutorContext>,
    cancel: CancellationToken,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl VoicePipeline {
    /// Wire a pipeline from configuration and collaborators.
    #[must_use]
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
        let auth = Arc::new(AuthGate::new(config.auth));
        let sessions = Arc::new(SessionStore::new());
        let core = Arc::new(SchedulerCore::new(&config.queue));
        let admission = AdmissionController::new(
            Arc::clone(&auth),
            Arc::clone(&core),
            config.limits.clone(),
        );
        let ctx = Arc::new(ExecutorContext {
            core: Arc::clone(&core),
            auth: Arc::clone(&auth),
            sessions: Arc::clone(&sessions),
            collaborators,
            limits: config.limits,
            profile: config.profile,
        });
        Self {
            auth,
            sessions,
            core,
            admission,
            ctx,
            cancel: CancellationToken::new(),
            dispatch: Mutex::new(None),
        }
    }

    /// Start the dispatch loop. Calling it on a running pipeline is a no-op.
    pub fn start(&self) {
        let mut dispatch = self.lock_dispatch();
        if dispatch.is_some() {
            warn!("pipeline already started");
            return;
        }
        self.core.running.store(true, Ordering::SeqCst);
        let ctx = Arc::clone(&self.ctx);
        let cancel = self.cancel.child_token();
        *dispatch = Some(tokio::spawn(executor::run_dispatch_loop(ctx, cancel)));
        info!("pipeline started");
    }

    /// Cancel the dispatch loop and wait for it to exit.
    ///
    /// Requests already handed to execution units run to completion;
    /// queued requests stay queued and are dropped with the pipeline.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.lock_dispatch().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("dispatch loop join failed: {e}");
            }
        }
        info!("pipeline shut down");
    }

    /// Submit one turn for admission.
    ///
    /// # Errors
    ///
    /// Propagates the admission rejection; see
    /// [`AdmissionController::submit`].
    pub async fn submit(&self, submission: Submission) -> Result<String> {
        self.admission.submit(submission).await
    }

    /// Point-in-time scheduler statistics.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.core.stats()
    }

    /// The authentication gate, for the serving layer's connection
    /// handshake and disconnect-time maintenance.
    #[must_use]
    pub fn auth(&self) -> &Arc<AuthGate> {
        &self.auth
    }

    /// Per-session conversation state.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    fn lock_dispatch(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.dispatch
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
