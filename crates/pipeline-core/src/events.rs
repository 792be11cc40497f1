//! Event records and the subscriber contract (spec §4.2).
//!
//! Events are immutable and share a common envelope (`step_name`,
//! `event_type`, `timestamp`, `correlation_id`, `suppress_from_user`); the
//! payload varies by kind.

use async_trait::async_trait;
use llm_core::{FinishReason, Usage};
use serde::{Deserialize, Serialize};

/// Required event kinds (spec §4.2). Unknown kinds must be tolerated by
/// subscribers — this enum is `#[non_exhaustive]` in spirit (new kinds may
/// be added) even though Rust enums don't model that across crates without
/// a catch-all; subscribers should match conservatively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    PipelineStarted {
        pipeline_name: String,
    },
    PipelineCompleted {
        success: bool,
        error: Option<String>,
    },
    StepStarted,
    StepCompleted {
        success: bool,
        duration_ms: u64,
    },
    StepProgress {
        message: String,
    },
    StepRouting {
        next_steps: Vec<String>,
    },
    StepValidation {
        attempt: u32,
        passed: bool,
        diagnostic: Option<String>,
    },
    LlmResponse {
        /// `streaming` for interim chunks; the terminal event carries the
        /// provider's real finish reason.
        finish_reason: FinishReason,
        delta: Option<String>,
        is_thinking: bool,
        usage: Option<Usage>,
        model: Option<String>,
    },
    ToolStarted {
        tool_call_id: String,
        tool_name: String,
        arguments: String,
    },
    ToolCompleted {
        tool_call_id: String,
        tool_name: String,
        success: bool,
        result: String,
    },
    TagStarted {
        tag_name: String,
    },
    TagCompleted {
        tag_name: String,
    },
}

impl EventKind {
    /// Severity used by the event channel's backpressure policy: progress
    /// and streaming response chunks drop first under load (spec §4.2, §9).
    pub fn is_low_severity(&self) -> bool {
        matches!(
            self,
            EventKind::StepProgress { .. }
                | EventKind::LlmResponse {
                    finish_reason: FinishReason::Streaming,
                    ..
                }
        )
    }

    /// Whether a UI should show this event by default. Internal retry
    /// noise (`step.validation`) is suppressed unless a subscriber opts in.
    pub fn suppress_from_user(&self) -> bool {
        matches!(self, EventKind::StepValidation { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp_ms: i64,
    pub step_name: Option<String>,
    pub correlation_id: String,
    pub suppress_from_user: bool,
    pub kind: EventKind,
}

/// A durable, fire-and-forget sink (trace exporter, log forwarder). Runs off
/// the hot path; failures are logged, not propagated.
#[async_trait]
pub trait EventObserver: Send + Sync {
    async fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}
