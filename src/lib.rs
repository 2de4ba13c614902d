//! Voxgate: request admission and execution scheduling for real-time
//! voice conversation pipelines.
//!
//! Each client turn passes through a gate of checks before any model work
//! happens: session validation, sliding-window rate limiting, per-client
//! concurrency caps, queue capacity, and payload validation. Admitted
//! requests enter a bounded priority queue; a dispatch loop hands them to
//! execution units whose parallelism is capped by a fixed permit pool.
//! Each unit drives the transcribe → generate → synthesize stage machine
//! against externally supplied collaborators and delivers status, partial,
//! and final events to the request's sink.
//!
//! # Architecture
//!
//! - **Auth gate**: session tokens, rate windows, concurrency counters
//! - **Admission**: synchronous accept/reject before anything queues
//! - **Scheduler**: bounded priority queue + permit-capped executor
//! - **Orchestrator**: per-request stage machine over the collaborators
//! - **Sink**: best-effort JSON event delivery back to the client

pub mod admission;
pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub(crate) mod orchestrator;
pub mod pipeline;
pub mod request;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod stages;

pub use admission::Submission;
pub use config::PipelineConfig;
pub use error::{PipelineError, Result, StageKind};
pub use events::{EventBody, WireEvent};
pub use pipeline::VoicePipeline;
pub use request::{PipelineRequest, PipelineResult, RequestPayload, RequestType, Stage};
pub use scheduler::SchedulerStats;
pub use sink::EventSink;
pub use stages::{Collaborators, GenerationOutput, GenerationRequest};
