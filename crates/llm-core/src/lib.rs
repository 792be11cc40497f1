//! Provider-facing types shared by the pipeline engine: chat messages, tool
//! declarations, sampling parameters, and the [`LlmProvider`](provider::LlmProvider)
//! boundary a concrete model adapter implements.
//!
//! This crate carries no HTTP client, no provider-specific wire format, and
//! no plugin host — those live in adapter crates outside this workspace.
//! What's here is the vocabulary the pipeline core's LLM step speaks.

/// Chat messages, roles, tool declarations, and response shapes.
pub mod chat;

/// Error types returned by an [`LlmProvider`](provider::LlmProvider).
pub mod error;

/// Sampling parameters attached to a request.
pub mod params;

/// The request/response/streaming contract a provider adapter implements.
pub mod provider;

pub use chat::{
    FinishReason, FunctionTool, Message, ParameterProperty, ParametersSchema, Role,
    StructuredOutputFormat, Tool, ToolCall, ToolChoice, Usage,
};
pub use error::LLMError;
pub use params::LLMParams;
pub use provider::{ChunkStream, LlmProvider, LlmRequest, LlmResponse, StreamChunk, ToolCallDelta};
