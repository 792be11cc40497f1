//! `PipelineContext`: per-execution state shared across the step list
//! (spec §3, §4.3). Grounded on the corpus's `ConversationContext::clone`
//! pattern in `middleware/state.rs`, generalized to deep-copy conversation
//! branches while sharing the event channel and correlation id.

use crate::conversation::ConversationContext;
use crate::event_channel::EventChannel;
use crate::events::EventKind;
use crate::result::StepResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Per-execution record. Immutable for the lifetime of a top-level
/// execution except for its concurrent maps (metadata, step results),
/// which the scheduler — never a step directly — writes to.
#[derive(Clone)]
pub struct PipelineContext {
    pub correlation_id: String,
    pub conversation: Arc<RwLock<ConversationContext>>,
    metadata: Arc<RwLock<HashMap<String, serde_json::Value>>>,
    step_results: Arc<RwLock<HashMap<String, StepResult<serde_json::Value>>>>,
    pub current_path: String,
    pub events: Option<Arc<EventChannel>>,
}

impl PipelineContext {
    pub fn new(conversation: ConversationContext) -> Self {
        PipelineContext {
            correlation_id: Uuid::new_v4().to_string(),
            conversation: Arc::new(RwLock::new(conversation)),
            metadata: Arc::new(RwLock::new(HashMap::new())),
            step_results: Arc::new(RwLock::new(HashMap::new())),
            current_path: String::new(),
            events: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_events(mut self, events: Arc<EventChannel>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn metadata_get(&self, key: &str) -> Option<serde_json::Value> {
        self.metadata.read().get(key).cloned()
    }

    pub fn metadata_set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.write().insert(key.into(), value);
    }

    pub fn record_step_result(&self, path: impl Into<String>, result: StepResult<serde_json::Value>) {
        self.step_results.write().insert(path.into(), result);
    }

    pub fn step_result(&self, path: &str) -> Option<StepResult<serde_json::Value>> {
        self.step_results.read().get(path).cloned()
    }

    /// Joins `current_path` with `child_name`, the slash-joined addressing
    /// scheme composite steps use for named intermediate results.
    pub fn child_path(&self, child_name: &str) -> String {
        if self.current_path.is_empty() {
            child_name.to_string()
        } else {
            format!("{}/{}", self.current_path, child_name)
        }
    }

    pub fn with_path(&self, path: String) -> Self {
        let mut clone = self.clone();
        clone.current_path = path;
        clone
    }

    /// Returns a new context for a parallel/sub-pipeline branch: the
    /// conversation is deep-copied so branches cannot corrupt each other's
    /// history, the event channel and correlation id are shared so traces
    /// reassemble, the step-result map starts empty (branch-local), and
    /// metadata is preserved by shallow copy (spec §4.3).
    pub fn clone_for_branch(&self) -> Self {
        let branched_conversation = self.conversation.read().clone_for_branch();
        PipelineContext {
            correlation_id: self.correlation_id.clone(),
            conversation: Arc::new(RwLock::new(branched_conversation)),
            metadata: Arc::new(RwLock::new(self.metadata.read().clone())),
            step_results: Arc::new(RwLock::new(HashMap::new())),
            current_path: self.current_path.clone(),
            events: self.events.clone(),
        }
    }

    pub fn emit(&self, step_name: Option<&str>, kind: EventKind) {
        if let Some(events) = &self.events {
            events.send(&self.correlation_id, step_name, kind);
        }
    }
}
