//! Authentication, session tokens, and per-client rate and concurrency
//! limits.
//!
//! The gate owns three pieces of per-client state: issued session tokens
//! (with creation time and owning IP), a sliding window of request
//! timestamps per IP, and a counter of admitted-but-unfinished requests
//! per IP. All checks are short and synchronous; callers hold no locks
//! across await points.

use crate::config::AuthConfig;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Why an authentication attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    /// No token was presented.
    MissingToken,
    /// The presented token does not match the configured secret.
    InvalidToken,
}

impl AuthRejection {
    /// Client-facing reason string.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::MissingToken => "authentication token required",
            Self::InvalidToken => "invalid authentication token",
        }
    }
}

struct SessionRecord {
    client_ip: String,
    created_at: Instant,
}

#[derive(Default)]
struct GateState {
    sessions: HashMap<String, SessionRecord>,
    rate_windows: HashMap<String, VecDeque<Instant>>,
    concurrent: HashMap<String, u32>,
}

/// Authentication and rate-limiting gate.
pub struct AuthGate {
    config: AuthConfig,
    window: Duration,
    ttl: Duration,
    state: Mutex<GateState>,
}

impl AuthGate {
    /// Create a gate from configuration.
    #[must_use]
    pub fn new(config: AuthConfig) -> Self {
        let window = Duration::from_secs(config.window_secs);
        let ttl = Duration::from_secs(config.session_ttl_secs);
        info!(
            "auth gate initialized: enabled={}, rate_limit={}/{}s, max_concurrent={}",
            config.enabled, config.requests_per_window, config.window_secs,
            config.max_concurrent_per_client
        );
        Self {
            config,
            window,
            ttl,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Authenticate a client and issue a session token.
    ///
    /// With authentication disabled every client succeeds; a session token
    /// is still issued for tracking. With authentication enabled the token
    /// must exactly match the configured secret.
    pub fn authenticate(
        &self,
        token: &str,
        client_ip: &str,
    ) -> std::result::Result<String, AuthRejection> {
        if self.config.enabled {
            if token.is_empty() {
                return Err(AuthRejection::MissingToken);
            }
            if token != self.config.shared_secret {
                return Err(AuthRejection::InvalidToken);
            }
        }
        Ok(self.issue_session_token(client_ip))
    }

    /// Validate a session token, returning the owning client IP.
    ///
    /// A token older than the TTL is deleted as a side effect and reported
    /// invalid.
    #[must_use]
    pub fn validate_session_token(&self, token: &str) -> Option<String> {
        let mut state = self.lock_state();
        match state.sessions.get(token) {
            Some(record) if record.created_at.elapsed() < self.ttl => {
                Some(record.client_ip.clone())
            }
            Some(_) => {
                state.sessions.remove(token);
                debug!("purged expired session token");
                None
            }
            None => None,
        }
    }

    /// Check the sliding-window rate limit for a client.
    ///
    /// On allow, the current timestamp is recorded in the window. On deny,
    /// returns how long until the oldest recorded request ages out.
    pub fn check_rate_limit(&self, client_ip: &str) -> std::result::Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.lock_state();
        let window = state.rate_windows.entry(client_ip.to_owned()).or_default();

        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.config.requests_per_window {
            let oldest = *window.front().unwrap_or(&now);
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return Err(retry_after);
        }

        window.push_back(now);
        Ok(())
    }

    /// Whether the client is below its concurrent-request cap.
    #[must_use]
    pub fn check_concurrent_limit(&self, client_ip: &str) -> bool {
        let state = self.lock_state();
        state.concurrent.get(client_ip).copied().unwrap_or(0)
            < self.config.max_concurrent_per_client
    }

    /// Record one more admitted request for the client.
    pub fn increment_concurrent(&self, client_ip: &str) {
        let mut state = self.lock_state();
        *state.concurrent.entry(client_ip.to_owned()).or_insert(0) += 1;
    }

    /// Record completion of one admitted request; floors at zero.
    pub fn decrement_concurrent(&self, client_ip: &str) {
        let mut state = self.lock_state();
        if let Some(count) = state.concurrent.get_mut(client_ip) {
            *count = count.saturating_sub(1);
        }
    }

    /// Current admitted-but-unfinished count for a client.
    #[must_use]
    pub fn concurrent_count(&self, client_ip: &str) -> u32 {
        let state = self.lock_state();
        state.concurrent.get(client_ip).copied().unwrap_or(0)
    }

    /// Sweep all sessions, deleting any at or past the TTL.
    ///
    /// Maintenance operation for the serving layer to call off the hot
    /// path — the original deployment invokes it every tenth client
    /// disconnection. Returns the number of sessions removed.
    pub fn cleanup_expired_sessions(&self) -> usize {
        let mut state = self.lock_state();
        let before = state.sessions.len();
        let ttl = self.ttl;
        state.sessions.retain(|_, record| record.created_at.elapsed() < ttl);
        let removed = before - state.sessions.len();
        if removed > 0 {
            info!("cleaned up {removed} expired session tokens");
        }
        removed
    }

    /// Number of live session records.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock_state().sessions.len()
    }

    fn issue_session_token(&self, client_ip: &str) -> String {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut hasher = Sha256::new();
        hasher.update(client_ip.as_bytes());
        hasher.update(chrono::Utc::now().timestamp_micros().to_le_bytes());
        hasher.update(salt);
        let digest = hasher.finalize();

        let mut token = String::with_capacity(32);
        for byte in &digest[..16] {
            let _ = write!(token, "{byte:02x}");
        }

        let mut state = self.lock_state();
        state.sessions.insert(
            token.clone(),
            SessionRecord {
                client_ip: client_ip.to_owned(),
                created_at: Instant::now(),
            },
        );
        token
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GateState> {
        // A poisoned gate mutex means a panic mid-update; recover with the
        // inner state rather than taking the whole pipeline down.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
