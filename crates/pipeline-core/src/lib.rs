pub mod context;
pub mod conversation;
pub mod error;
pub mod event_channel;
pub mod events;
pub mod executor;
pub mod llm_step;
pub mod result;
pub mod step;
pub mod streaming_tag;
pub mod tool;

pub use context::PipelineContext;
pub use conversation::{BookmarkId, ConversationContext, ConversationError, MessageHistory};
pub use error::{ParseError, PipelineError, StepFault, ToolError};
pub use event_channel::{EventChannel, EventReceiver, ObserverToken};
pub use events::{Event, EventKind, EventObserver};
pub use executor::{run_pipeline, run_step_chain, Middleware, PipelineStep, StepInvocation};
pub use llm_step::{JsonCapability, LlmStep, LlmStepConfig, MessageBuilder, OutputSpec};
pub use result::{StepRef, StepResult};
pub use step::{DynStep, LambdaStep, ParallelGroup, SequentialGroup, Step, StepConfig, Switch};
pub use tool::{Tool, ToolRegistry};
