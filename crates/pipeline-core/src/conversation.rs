//! `MessageHistory` and `ConversationContext` (spec §3, §4.4).
//!
//! New to this core: the grounding corpus keeps an immutable `Arc<[ChatMessage]>`
//! snapshot per turn rather than a mutable bookmarked log, so this module is
//! built fresh in the corpus's idiom (plain structs, builder-style mutators,
//! `thiserror` errors) rather than adapted from an existing file.

use llm_core::{Message, Role, ToolCall};
use std::collections::HashMap;
use thiserror::Error;

/// An opaque handle to a prior conversation length, used to restore earlier
/// state (spec glossary: Bookmark).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BookmarkId(u64);

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("unknown bookmark")]
    UnknownBookmark,

    #[error("tool message references tool_call_id '{0}' not seen earlier in the conversation")]
    DanglingToolCallId(String),
}

/// Token-counting function; defaults to the corpus's usual fallback when no
/// provider tokenizer is wired in: `len / 4`.
pub type TokenCounter = fn(&str) -> u32;

fn default_token_counter(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4)
}

/// Ordered sequence of messages with bookmarks and a token budget (spec §3).
///
/// Invariants upheld by construction: every bookmark index is `<=`
/// `messages.len()`; `clear_after_bookmark` removes the bookmark it
/// restores to; `add_tool_message` rejects a `tool_call_id` that was never
/// emitted by an earlier assistant message.
pub struct MessageHistory {
    messages: Vec<Message>,
    bookmarks: HashMap<BookmarkId, usize>,
    next_bookmark: u64,
    max_tokens: u32,
    token_counter: TokenCounter,
    seen_tool_call_ids: std::collections::HashSet<String>,
}

impl MessageHistory {
    pub fn new(max_tokens: u32) -> Self {
        MessageHistory {
            messages: Vec::new(),
            bookmarks: HashMap::new(),
            next_bookmark: 1,
            max_tokens,
            token_counter: default_token_counter,
            seen_tool_call_ids: std::collections::HashSet::new(),
        }
    }

    pub fn with_token_counter(mut self, counter: TokenCounter) -> Self {
        self.token_counter = counter;
        self
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn add_system_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::system(content));
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    pub fn add_assistant_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }

    pub fn add_assistant_message_with_tool_calls(&mut self, tool_calls: Vec<ToolCall>) {
        for call in &tool_calls {
            self.seen_tool_call_ids.insert(call.id.clone());
        }
        self.messages
            .push(Message::assistant_with_tool_calls(tool_calls));
    }

    pub fn add_tool_message(
        &mut self,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), ConversationError> {
        let tool_call_id = tool_call_id.into();
        if !self.seen_tool_call_ids.contains(&tool_call_id) {
            return Err(ConversationError::DanglingToolCallId(tool_call_id));
        }
        self.messages.push(Message::tool(tool_call_id, content));
        Ok(())
    }

    /// Returns a fresh bookmark mapped to the current tail index.
    pub fn create_bookmark(&mut self) -> BookmarkId {
        let id = BookmarkId(self.next_bookmark);
        self.next_bookmark += 1;
        self.bookmarks.insert(id, self.messages.len());
        id
    }

    /// Truncates the sequence back to the bookmarked index and removes the
    /// bookmark. Restoring an unknown id fails explicitly.
    pub fn restore_bookmark(&mut self, bookmark: BookmarkId) -> Result<(), ConversationError> {
        let index = self
            .bookmarks
            .remove(&bookmark)
            .ok_or(ConversationError::UnknownBookmark)?;
        self.messages.truncate(index);
        Ok(())
    }

    /// Removes the bookmark without truncating — used once a retry attempt
    /// has committed and the earlier state no longer needs restoring.
    pub fn clear_after_bookmark(&mut self, bookmark: BookmarkId) {
        self.bookmarks.remove(&bookmark);
    }

    /// Deep-copies this history (spec §4.3: branches must not share mutable
    /// conversation state).
    pub fn clone_deep(&self) -> Self {
        MessageHistory {
            messages: self.messages.clone(),
            bookmarks: self.bookmarks.clone(),
            next_bookmark: self.next_bookmark,
            max_tokens: self.max_tokens,
            token_counter: self.token_counter,
            seen_tool_call_ids: self.seen_tool_call_ids.clone(),
        }
    }

    /// Selects messages for the next LLM call per spec §4.4, counting tokens
    /// with this history's own `token_counter`. Most callers want the
    /// provider's real tokenizer instead — see
    /// `get_messages_for_request_with_counter`.
    pub fn get_messages_for_request(
        &self,
        max_tokens: Option<u32>,
        from_bookmark: Option<BookmarkId>,
        use_sliding_window: bool,
    ) -> Vec<Message> {
        let counter = self.token_counter;
        self.get_messages_for_request_with_counter(
            max_tokens,
            from_bookmark,
            use_sliding_window,
            &|text| counter(text),
        )
    }

    /// Same selection as `get_messages_for_request`, but tokens are counted
    /// with a caller-supplied function rather than this history's own
    /// `token_counter` — lets a provider's real tokenizer (spec §4.4,
    /// `LlmProvider::estimate_token_count`) drive the sliding window instead
    /// of the generic `len / 4` fallback.
    ///
    /// Never splits a message: the last message that fits under `max_tokens`
    /// goes in whole, the next is dropped whole — unless the single most
    /// recent message alone exceeds the budget, in which case that message
    /// alone is returned.
    pub fn get_messages_for_request_with_counter(
        &self,
        max_tokens: Option<u32>,
        from_bookmark: Option<BookmarkId>,
        use_sliding_window: bool,
        token_counter: &dyn Fn(&str) -> u32,
    ) -> Vec<Message> {
        if self.messages.is_empty() {
            return Vec::new();
        }

        if let Some(bookmark) = from_bookmark {
            if let Some(&index) = self.bookmarks.get(&bookmark) {
                return self.messages[index..].to_vec();
            }
            return Vec::new();
        }

        let budget = max_tokens.unwrap_or(self.max_tokens);

        if use_sliding_window {
            const KEEP_FIRST_N: usize = 2;
            let first_n = self.messages.len().min(KEEP_FIRST_N);
            let head = &self.messages[..first_n];
            let head_tokens: u32 = head.iter().map(|m| token_counter(&m.content)).sum();

            let tail_budget = budget.saturating_sub(head_tokens);
            let tail = self.walk_back_within_budget(first_n, tail_budget, token_counter);

            let mut result = head.to_vec();
            result.extend(tail);
            result
        } else {
            self.walk_back_within_budget(0, budget, token_counter)
        }
    }

    /// Walks backward from the tail, accumulating messages with indices
    /// `>= floor`, until the next addition would exceed `budget`. If even
    /// the single most recent message exceeds `budget`, that message alone
    /// is returned.
    fn walk_back_within_budget(
        &self,
        floor: usize,
        budget: u32,
        token_counter: &dyn Fn(&str) -> u32,
    ) -> Vec<Message> {
        let mut selected: Vec<Message> = Vec::new();
        let mut used_tokens: u32 = 0;

        for message in self.messages[floor..].iter().rev() {
            let tokens = token_counter(&message.content);
            if selected.is_empty() {
                selected.push(message.clone());
                used_tokens = tokens;
                continue;
            }
            if used_tokens + tokens > budget {
                break;
            }
            selected.push(message.clone());
            used_tokens += tokens;
        }

        selected.reverse();
        selected
    }
}

/// Owns a `MessageHistory`, a conversation id, and an untyped metadata map
/// for provider-level hints (cache names, feature toggles).
pub struct ConversationContext {
    pub conversation_id: String,
    pub history: MessageHistory,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ConversationContext {
    pub fn new(conversation_id: impl Into<String>, max_tokens: u32) -> Self {
        ConversationContext {
            conversation_id: conversation_id.into(),
            history: MessageHistory::new(max_tokens),
            metadata: HashMap::new(),
        }
    }

    /// Deep-copies the conversation for a branch: same id, independently
    /// mutable history and metadata (spec §4.3).
    pub fn clone_for_branch(&self) -> Self {
        ConversationContext {
            conversation_id: self.conversation_id.clone(),
            history: self.history.clone_deep(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Helper used by the LLM step's `finalize` hook: leaves exactly one role
/// pair in the history regardless of how many retries or tool calls
/// happened in between (spec §4.7, invariant 4).
pub fn normalize_to_single_exchange(
    history: &mut MessageHistory,
    bookmark: BookmarkId,
    user_content: impl Into<String>,
    assistant_content: impl Into<String>,
) -> Result<(), ConversationError> {
    history.restore_bookmark(bookmark)?;
    history.add_user_message(user_content);
    history.add_assistant_message(assistant_content);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role_is(message: &Message, role: Role) -> bool {
        message.role == role
    }

    #[test]
    fn bookmark_restore_returns_to_prior_state() {
        let mut history = MessageHistory::new(1000);
        history.add_user_message("hi");
        let bookmark = history.create_bookmark();
        history.add_user_message("x");
        history.add_assistant_message("y");
        history.restore_bookmark(bookmark).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn restoring_unknown_bookmark_fails_explicitly() {
        let mut history = MessageHistory::new(1000);
        let bookmark = history.create_bookmark();
        history.restore_bookmark(bookmark).unwrap();
        assert!(matches!(
            history.restore_bookmark(bookmark),
            Err(ConversationError::UnknownBookmark)
        ));
    }

    #[test]
    fn idempotent_restore_law() {
        let mut history = MessageHistory::new(1000);
        history.add_user_message("seed");
        let bookmark = history.create_bookmark();
        let snapshot_len = history.len();

        history.add_user_message("x");
        history.add_assistant_message("y");
        history.restore_bookmark(bookmark).unwrap();
        assert_eq!(history.len(), snapshot_len);

        let bookmark2 = history.create_bookmark();
        history.add_user_message("x2");
        history.add_assistant_message("y2");
        history.restore_bookmark(bookmark2).unwrap();
        assert_eq!(history.len(), snapshot_len);
    }

    #[test]
    fn tool_message_requires_known_tool_call_id() {
        let mut history = MessageHistory::new(1000);
        assert!(matches!(
            history.add_tool_message("missing", "result"),
            Err(ConversationError::DanglingToolCallId(_))
        ));

        history.add_assistant_message_with_tool_calls(vec![ToolCall {
            id: "c1".into(),
            name: "now".into(),
            arguments: "{}".into(),
        }]);
        assert!(history.add_tool_message("c1", "result").is_ok());
    }

    #[test]
    fn empty_conversation_returns_empty_selection() {
        let history = MessageHistory::new(1000);
        assert!(history
            .get_messages_for_request(None, None, false)
            .is_empty());
    }

    #[test]
    fn sliding_window_keeps_first_n_then_fits_tail() {
        let mut history = MessageHistory::new(1000);
        history.add_system_message("sys");
        history.add_user_message("first user");
        for i in 0..20 {
            history.add_user_message(format!("filler message number {i}"));
            history.add_assistant_message(format!("filler reply number {i}"));
        }
        history.add_user_message("final question");

        let selected = history.get_messages_for_request(Some(40), None, true);
        assert!(role_is(&selected[0], Role::System));
        assert_eq!(selected.last().unwrap().content, "final question");
    }

    #[test]
    fn never_splits_a_message_even_if_the_last_one_overflows_budget() {
        let mut history = MessageHistory::new(1000);
        let huge = "x".repeat(10_000);
        history.add_user_message(huge.clone());
        let selected = history.get_messages_for_request(Some(1), None, false);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].content, huge);
    }

    #[test]
    fn from_bookmark_returns_every_message_at_or_after_it() {
        let mut history = MessageHistory::new(1000);
        history.add_user_message("before");
        let bookmark = history.create_bookmark();
        history.add_user_message("after-1");
        history.add_assistant_message("after-2");

        let selected = history.get_messages_for_request(None, Some(bookmark), false);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].content, "after-1");
    }

    #[test]
    fn clone_for_branch_is_independent() {
        let mut ctx = ConversationContext::new("conv-1", 1000);
        ctx.history.add_user_message("shared");
        let mut branch = ctx.clone_for_branch();
        branch.history.add_user_message("branch-only");

        assert_eq!(ctx.history.len(), 1);
        assert_eq!(branch.history.len(), 2);
        assert_eq!(branch.conversation_id, ctx.conversation_id);
    }

    #[test]
    fn normalize_to_single_exchange_collapses_retry_noise() {
        let mut history = MessageHistory::new(1000);
        let bookmark = history.create_bookmark();
        history.add_assistant_message_with_tool_calls(vec![ToolCall {
            id: "c1".into(),
            name: "now".into(),
            arguments: "{}".into(),
        }]);
        history.add_tool_message("c1", "result").unwrap();
        history.add_user_message("retry feedback");
        history.add_assistant_message("bad attempt");

        normalize_to_single_exchange(&mut history, bookmark, "clean question", "clean answer")
            .unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history.messages()[0].content, "clean question");
        assert_eq!(history.messages()[1].content, "clean answer");
    }
}
