//! Per-session conversation state.
//!
//! Conversation history is owned per session and mutated only under that
//! session's async mutex, so concurrently executing requests for one
//! session cannot interleave history updates. Anchor system messages
//! (user context, vision context) are tracked by tag, never by position.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instruction or context message.
    System,
    /// End-user message.
    User,
    /// Generated assistant message.
    Assistant,
}

/// Tag identifying anchor messages that survive replacement and
/// truncation by identity rather than index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
    /// Ordinary conversation message.
    None,
    /// The "USER CONTEXT" system anchor.
    UserContext,
    /// A "[VISION CONTEXT]" system message.
    VisionContext,
}

/// One conversation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Author role.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// Anchor tag.
    pub tag: MessageTag,
}

impl ChatMessage {
    /// An untagged system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tag: MessageTag::None,
        }
    }

    /// An untagged user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tag: MessageTag::None,
        }
    }

    /// An untagged assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tag: MessageTag::None,
        }
    }
}

/// Ordered conversation history for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationHistory {
    messages: Vec<ChatMessage>,
}

impl ConversationHistory {
    /// Empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message.
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// All messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the history holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Set or replace the user-context anchor.
    ///
    /// An existing anchor is updated in place wherever it sits. Otherwise
    /// the anchor is inserted after a leading system prompt if there is
    /// one, else at the front.
    pub fn set_user_context(&mut self, content: impl Into<String>) {
        let content = content.into();
        if let Some(existing) = self
            .messages
            .iter_mut()
            .find(|m| m.tag == MessageTag::UserContext)
        {
            existing.content = content;
            return;
        }

        let at = usize::from(
            self.messages
                .first()
                .is_some_and(|m| m.role == Role::System && m.tag == MessageTag::None),
        );
        self.messages.insert(
            at,
            ChatMessage {
                role: Role::System,
                content,
                tag: MessageTag::UserContext,
            },
        );
    }

    /// Insert a vision-context system message after the last non-vision
    /// system message, or at the front when there is none.
    pub fn push_vision_context(&mut self, context: &str) {
        let at = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::System && m.tag != MessageTag::VisionContext)
            .map_or(0, |i| i + 1);
        self.messages.insert(
            at,
            ChatMessage {
                role: Role::System,
                content: format!("[VISION CONTEXT]: {context}"),
                tag: MessageTag::VisionContext,
            },
        );
    }

    /// When over `max_len`, keep the most recent `max_len / 2` messages
    /// plus a leading system prompt and the user-context anchor.
    ///
    /// Returns whether anything was dropped.
    pub fn truncate_to_recent_half(&mut self, max_len: usize) -> bool {
        if self.messages.len() <= max_len {
            return false;
        }
        let keep = max_len / 2;
        let cut = self.messages.len() - keep;
        let mut kept = Vec::with_capacity(keep + 2);
        for (i, message) in self.messages.iter().enumerate() {
            let anchored = message.tag == MessageTag::UserContext
                || (i == 0 && message.role == Role::System && message.tag == MessageTag::None);
            if i >= cut || anchored {
                kept.push(message.clone());
            }
        }
        self.messages = kept;
        true
    }
}

/// Shared state for one client session.
pub struct SessionState {
    /// Conversation history; the mutex is the single-writer serialization
    /// point for all history mutation.
    pub history: AsyncMutex<ConversationHistory>,
    vision_context: Mutex<Option<String>>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            history: AsyncMutex::new(ConversationHistory::new()),
            vision_context: Mutex::new(None),
        }
    }

    /// Set or clear the pending vision context for this session.
    pub fn set_vision_context(&self, context: Option<String>) {
        *self.lock_vision() = context;
    }

    /// The currently set vision context, if any. The context stays set
    /// until the serving layer clears it.
    #[must_use]
    pub fn vision_context(&self) -> Option<String> {
        self.lock_vision().clone()
    }

    fn lock_vision(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.vision_context
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Registry of per-session state, keyed by session token.
#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<HashMap<String, Arc<SessionState>>>,
}

impl SessionStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the state for a session token.
    #[must_use]
    pub fn session(&self, token: &str) -> Arc<SessionState> {
        let mut inner = self.lock_inner();
        Arc::clone(
            inner
                .entry(token.to_owned())
                .or_insert_with(|| Arc::new(SessionState::new())),
        )
    }

    /// Drop the state for a session token (e.g. after disconnect).
    pub fn remove(&self, token: &str) {
        self.lock_inner().remove(token);
    }

    /// Number of tracked sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_inner().len()
    }

    /// Whether no sessions are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_inner().is_empty()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SessionState>>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
