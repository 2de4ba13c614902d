//! Configuration types for the request pipeline.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Authentication, rate limiting, and per-client concurrency caps.
    pub auth: AuthConfig,
    /// Per-request resource validation and execution limits.
    pub limits: ResourceLimits,
    /// Queue capacity and executor parallelism.
    pub queue: QueueConfig,
    /// Assistant profile used when building prompts.
    pub profile: ProfileConfig,
}

/// Authentication and per-client limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether token authentication is enforced. When disabled every
    /// client is issued a session token for tracking.
    pub enabled: bool,
    /// Shared secret clients must present when authentication is enabled.
    pub shared_secret: String,
    /// Requests allowed per client IP within one rate window.
    pub requests_per_window: usize,
    /// Rate window length in seconds.
    pub window_secs: u64,
    /// Maximum admitted-but-unfinished requests per client IP.
    pub max_concurrent_per_client: u32,
    /// Session token lifetime in seconds.
    pub session_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            shared_secret: String::new(),
            requests_per_window: 10,
            window_secs: 60,
            max_concurrent_per_client: 5,
            session_ttl_secs: 86_400,
        }
    }
}

/// Per-request resource validation and execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum audio payload size in megabytes.
    pub max_audio_size_mb: f64,
    /// Audio payloads below this size are treated as corrupt.
    pub min_audio_size_bytes: usize,
    /// Ceiling on the aggregate string/byte payload of one request.
    pub max_payload_bytes: usize,
    /// Conversation history length above which the oldest half is dropped.
    pub max_conversation_len: usize,
    /// Overall wall-clock timeout per request in seconds.
    pub max_processing_time_secs: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_audio_size_mb: 10.0,
            min_audio_size_bytes: 1024,
            max_payload_bytes: 50 * 1024 * 1024,
            max_conversation_len: 100,
            max_processing_time_secs: 60,
        }
    }
}

/// Queue and executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of queued requests; admission beyond this is a
    /// hard rejection, never a block.
    pub max_queue_size: usize,
    /// Size of the permit pool capping concurrently executing requests.
    pub max_concurrent: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 50,
            max_concurrent: 3,
        }
    }
}

/// Assistant profile used when building prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// The user's name, when known. Drives greeting phrasing and the
    /// user-context anchor message.
    pub user_name: Option<String>,
    /// System prompt passed to every generation.
    pub system_prompt: String,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            user_name: None,
            system_prompt: "You are a helpful, friendly, and concise voice assistant. \
                            Respond to user queries in a natural, conversational manner. \
                            Keep responses brief and to the point, as you're communicating via voice."
                .to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn defaults_match_deployment_values() {
        let config = PipelineConfig::default();
        assert!(!config.auth.enabled);
        assert_eq!(config.auth.requests_per_window, 10);
        assert_eq!(config.auth.window_secs, 60);
        assert_eq!(config.auth.max_concurrent_per_client, 5);
        assert_eq!(config.auth.session_ttl_secs, 86_400);
        assert_eq!(config.queue.max_queue_size, 50);
        assert_eq!(config.queue.max_concurrent, 3);
        assert_eq!(config.limits.max_processing_time_secs, 60);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"queue": {"max_concurrent": 8}}"#).unwrap();
        assert_eq!(config.queue.max_concurrent, 8);
        assert_eq!(config.queue.max_queue_size, 50);
        assert_eq!(config.auth.requests_per_window, 10);
    }
}
