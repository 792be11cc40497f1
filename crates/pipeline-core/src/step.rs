//! Step abstractions (spec §3, §4.5). Grounded on the corpus's
//! `MiddlewareDriver` trait (`middleware/driver.rs`): a capability-set trait
//! with default no-op methods, generalized here from "middleware phase" to
//! "step operation" (`execute`/`validate`/`finalize`).

use crate::context::PipelineContext;
use crate::error::StepFault;
use crate::events::EventKind;
use crate::executor::{StepInvocation, run_step_chain};
use crate::result::{StepRef, StepResult};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-step configuration: retry budget and timeout.
#[derive(Debug, Clone)]
pub struct StepConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout: Duration,
}

impl Default for StepConfig {
    fn default() -> Self {
        StepConfig {
            max_retries: 0,
            retry_delay_ms: 0,
            timeout: Duration::from_secs(30),
        }
    }
}

/// A step's public contract: typed input, typed output, three suspendable
/// operations. `validate` defaults to accept-all; `finalize` defaults to a
/// no-op and always runs once per invocation regardless of outcome.
#[async_trait]
pub trait Step: Send + Sync {
    type Input: Send + Sync;
    type Output: Send + Sync + Clone;

    fn name(&self) -> &str;

    fn config(&self) -> &StepConfig;

    /// `attempt` is 1-indexed; `last_result` is the previous attempt's
    /// output, available so a retrying step can inspect what failed.
    async fn execute(
        &self,
        input: &Self::Input,
        ctx: &PipelineContext,
        attempt: u32,
        last_result: Option<&Self::Output>,
        cancel: &CancellationToken,
    ) -> Result<Self::Output, StepFault>;

    async fn validate(
        &self,
        _result: &Self::Output,
        _ctx: &PipelineContext,
        _cancel: &CancellationToken,
    ) -> Result<(), StepFault> {
        Ok(())
    }

    async fn finalize(
        &self,
        _result: &StepResult<Self::Output>,
        _ctx: &PipelineContext,
        _cancel: &CancellationToken,
    ) {
    }
}

/// A sequential group of steps sharing one output type, run in order; the
/// group stops at the first error (forward-only, same as the executor).
pub struct SequentialGroup<T: Send + Sync + Clone> {
    pub name: String,
    pub config: StepConfig,
    pub steps: Vec<Arc<dyn DynStep<Output = T>>>,
}

/// A parallel group: every branch runs concurrently against an
/// independently branched `PipelineContext` (spec §4.3, §5). Results are
/// collected into `StepResult::Parallel`.
pub struct ParallelGroup<T: Send + Sync + Clone> {
    pub name: String,
    pub config: StepConfig,
    pub branches: Vec<(String, Arc<dyn DynStep<Output = T>>)>,
}

/// Selects a sub-step based on a function of the ambient `PipelineContext`
/// (e.g. a routing key a prior step recorded via `metadata_set`).
pub struct Switch<T: Send + Sync + Clone> {
    pub name: String,
    pub config: StepConfig,
    pub select: Arc<dyn Fn(&PipelineContext) -> String + Send + Sync>,
    pub branches: std::collections::HashMap<String, Arc<dyn DynStep<Output = T>>>,
}

type LambdaFn<T> = Arc<
    dyn Fn(
            PipelineContext,
            CancellationToken,
        ) -> Pin<Box<dyn Future<Output = Result<T, StepFault>> + Send>>
        + Send
        + Sync,
>;

/// A step constructed from an inline closure — no declared input type
/// beyond the ambient `PipelineContext`, used for glue code between named
/// steps.
pub struct LambdaStep<T: Send + Sync + Clone> {
    pub name: String,
    pub config: StepConfig,
    f: LambdaFn<T>,
}

impl<T: Send + Sync + Clone> LambdaStep<T> {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(PipelineContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StepFault>> + Send + 'static,
    {
        LambdaStep {
            name: name.into(),
            config: StepConfig::default(),
            f: Arc::new(move |ctx, cancel| Box::pin(f(ctx, cancel))),
        }
    }
}

/// Converts a finished child `StepResult` into the `Result<T, StepFault>`
/// shape `RetryMiddleware`'s attempt contract expects. `Parallel` has no
/// single-`T` reading, so it surfaces as a validation fault — no composite
/// step here ever nests a `ParallelGroup` result directly into this path.
pub(crate) fn step_result_into_attempt<T>(
    result: StepResult<T>,
    empty_message: &str,
) -> Result<T, StepFault> {
    match result {
        StepResult::Success { value, .. } => Ok(value),
        StepResult::Error { message, .. } => Err(StepFault::Validation(message)),
        StepResult::Empty => Err(StepFault::Validation(empty_message.to_string())),
        StepResult::Parallel(_) => Err(StepFault::Validation(
            "unexpected Parallel result where a single value was expected".to_string(),
        )),
    }
}

/// Type-erased step invocation, the shape the executor actually schedules.
/// Mirrors `Step::execute`/`validate`/`finalize` but over `PipelineContext`
/// alone, letting composite steps hold heterogeneous children behind one
/// vtable (spec §9's "single interface for a deep hierarchy").
#[async_trait]
pub trait DynStep: Send + Sync {
    type Output: Send + Sync + Clone;

    fn name(&self) -> &str;
    fn config(&self) -> &StepConfig;

    async fn invoke(
        &self,
        ctx: &PipelineContext,
        cancel: &CancellationToken,
    ) -> StepResult<Self::Output>;
}

#[async_trait]
impl<T: Send + Sync + Clone + 'static> DynStep for LambdaStep<T> {
    type Output = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &StepConfig {
        &self.config
    }

    async fn invoke(
        &self,
        ctx: &PipelineContext,
        cancel: &CancellationToken,
    ) -> StepResult<Self::Output> {
        let f = self.f.clone();
        let owned_ctx = ctx.clone();
        let owned_cancel = cancel.clone();
        let invocation = StepInvocation {
            step_name: self.name.clone(),
            max_retries: self.config.max_retries,
            retry_delay_ms: self.config.retry_delay_ms,
            timeout: self.config.timeout,
            attempt_fn: Arc::new(move |_attempt, _last: Option<T>| {
                let f = f.clone();
                let ctx = owned_ctx.clone();
                let cancel = owned_cancel.clone();
                Box::pin(async move { f(ctx, cancel).await })
            }),
            validate_fn: Arc::new(|_value: T| Box::pin(async { Ok(()) })),
        };
        run_step_chain(invocation, ctx, cancel, &[]).await
    }
}

#[async_trait]
impl<T: Send + Sync + Clone + 'static> DynStep for SequentialGroup<T> {
    type Output = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &StepConfig {
        &self.config
    }

    async fn invoke(
        &self,
        ctx: &PipelineContext,
        cancel: &CancellationToken,
    ) -> StepResult<Self::Output> {
        let steps = self.steps.clone();
        let name = self.name.clone();
        let owned_ctx = ctx.clone();
        let owned_cancel = cancel.clone();
        let invocation = StepInvocation {
            step_name: self.name.clone(),
            max_retries: self.config.max_retries,
            retry_delay_ms: self.config.retry_delay_ms,
            timeout: self.config.timeout,
            attempt_fn: Arc::new(move |_attempt, _last: Option<T>| {
                let steps = steps.clone();
                let name = name.clone();
                let ctx = owned_ctx.clone();
                let cancel = owned_cancel.clone();
                Box::pin(async move {
                    let child_ctx = ctx.with_path(ctx.child_path(&name));
                    let mut last = StepResult::Empty;
                    for step in &steps {
                        last = step.invoke(&child_ctx, &cancel).await;
                        if last.has_error() {
                            break;
                        }
                    }
                    step_result_into_attempt(last, "sequential group had no steps")
                })
            }),
            validate_fn: Arc::new(|_value: T| Box::pin(async { Ok(()) })),
        };
        run_step_chain(invocation, ctx, cancel, &[]).await
    }
}

/// `ParallelGroup`'s success shape (`StepResult::Parallel`) doesn't fit
/// `RetryMiddleware`'s single-`T` attempt contract, so it skips
/// `run_step_chain` and instead applies observability and a timeout ceiling
/// directly — retrying a fan-out whose result is itself an aggregate isn't a
/// meaningful operation.
#[async_trait]
impl<T: Send + Sync + Clone + 'static> DynStep for ParallelGroup<T> {
    type Output = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &StepConfig {
        &self.config
    }

    async fn invoke(
        &self,
        ctx: &PipelineContext,
        cancel: &CancellationToken,
    ) -> StepResult<Self::Output> {
        let child_ctx = ctx.with_path(ctx.child_path(&self.name));
        let branches = self.branches.clone();
        let branch_cancel = cancel.clone();
        let step_name = self.name.clone();

        let run_branches = async move {
            let futures = branches.iter().map(|(branch_name, step)| {
                let branch_ctx = child_ctx.clone_for_branch();
                let cancel = branch_cancel.clone();
                let branch_name = branch_name.clone();
                async move {
                    let result = step.invoke(&branch_ctx, &cancel).await;
                    (branch_name, result)
                }
            });
            let results = futures::future::join_all(futures).await;
            StepResult::Parallel(results.into_iter().collect())
        };

        ctx.emit(Some(&step_name), EventKind::StepStarted);
        let started = std::time::Instant::now();
        let result = match tokio::time::timeout(self.config.timeout, run_branches).await {
            Ok(result) => result,
            Err(_elapsed) => StepResult::error(
                format!(
                    "step '{step_name}' timed out after {}ms",
                    self.config.timeout.as_millis()
                ),
                StepRef::new(step_name.clone(), ctx.child_path(&step_name)),
            ),
        };
        let success = match &result {
            StepResult::Parallel(branches) => branches.values().all(|r| !r.has_error()),
            other => !other.has_error(),
        };
        ctx.emit(
            Some(&step_name),
            EventKind::StepCompleted {
                success,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        );
        result
    }
}

#[async_trait]
impl<T: Send + Sync + Clone + 'static> DynStep for Switch<T> {
    type Output = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &StepConfig {
        &self.config
    }

    async fn invoke(
        &self,
        ctx: &PipelineContext,
        cancel: &CancellationToken,
    ) -> StepResult<Self::Output> {
        let select = self.select.clone();
        let branches = self.branches.clone();
        let name = self.name.clone();
        let owned_ctx = ctx.clone();
        let owned_cancel = cancel.clone();
        let invocation = StepInvocation {
            step_name: self.name.clone(),
            max_retries: self.config.max_retries,
            retry_delay_ms: self.config.retry_delay_ms,
            timeout: self.config.timeout,
            attempt_fn: Arc::new(move |_attempt, _last: Option<T>| {
                let select = select.clone();
                let branches = branches.clone();
                let name = name.clone();
                let ctx = owned_ctx.clone();
                let cancel = owned_cancel.clone();
                Box::pin(async move {
                    let branch_name = select(&ctx);
                    match branches.get(&branch_name) {
                        Some(step) => {
                            let result = step.invoke(&ctx, &cancel).await;
                            step_result_into_attempt(result, "switch branch returned no result")
                        }
                        None => Err(StepFault::Validation(format!(
                            "Switch step '{name}' has no branch named '{branch_name}'"
                        ))),
                    }
                })
            }),
            validate_fn: Arc::new(|_value: T| Box::pin(async { Ok(()) })),
        };
        run_step_chain(invocation, ctx, cancel, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationContext;

    fn make_context() -> PipelineContext {
        PipelineContext::new(ConversationContext::new("conv-1", 1000))
    }

    #[tokio::test]
    async fn lambda_step_success() {
        let step = LambdaStep::new("echo", |_ctx, _cancel| async { Ok(42) });
        let ctx = make_context();
        let cancel = CancellationToken::new();
        let result = step.invoke(&ctx, &cancel).await;
        assert_eq!(result.value(), Some(&42));
    }

    #[tokio::test]
    async fn sequential_group_stops_on_first_error() {
        let ok_step = Arc::new(LambdaStep::new("ok", |_ctx, _cancel| async { Ok(1) }))
            as Arc<dyn DynStep<Output = i32>>;
        let err_step = Arc::new(LambdaStep::new("bad", |_ctx, _cancel| async {
            Err(StepFault::Validation("nope".into()))
        })) as Arc<dyn DynStep<Output = i32>>;
        let never_step = Arc::new(LambdaStep::new("never", |_ctx, _cancel| async { Ok(3) }))
            as Arc<dyn DynStep<Output = i32>>;

        let group = SequentialGroup {
            name: "group".into(),
            config: StepConfig::default(),
            steps: vec![ok_step, err_step, never_step],
        };

        let ctx = make_context();
        let cancel = CancellationToken::new();
        let result = group.invoke(&ctx, &cancel).await;
        assert!(result.has_error());
    }

    #[tokio::test]
    async fn switch_routes_to_selected_branch() {
        let a = Arc::new(LambdaStep::new("a", |_ctx, _cancel| async { Ok(1) }))
            as Arc<dyn DynStep<Output = i32>>;
        let b = Arc::new(LambdaStep::new("b", |_ctx, _cancel| async { Ok(2) }))
            as Arc<dyn DynStep<Output = i32>>;
        let mut branches = std::collections::HashMap::new();
        branches.insert("a".to_string(), a);
        branches.insert("b".to_string(), b);

        let switch = Switch {
            name: "switch".into(),
            config: StepConfig::default(),
            select: Arc::new(|ctx| {
                ctx.metadata_get("route")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default()
            }),
            branches,
        };

        let ctx = make_context();
        ctx.metadata_set("route", serde_json::json!("b"));
        let cancel = CancellationToken::new();
        let result = switch.invoke(&ctx, &cancel).await;
        assert_eq!(result.value(), Some(&2));
    }

    #[tokio::test]
    async fn parallel_group_runs_all_branches() {
        let a = Arc::new(LambdaStep::new("a", |_ctx, _cancel| async { Ok(1) }))
            as Arc<dyn DynStep<Output = i32>>;
        let b = Arc::new(LambdaStep::new("b", |_ctx, _cancel| async { Ok(2) }))
            as Arc<dyn DynStep<Output = i32>>;

        let group = ParallelGroup {
            name: "par".into(),
            config: StepConfig::default(),
            branches: vec![("a".into(), a), ("b".into(), b)],
        };

        let ctx = make_context();
        let cancel = CancellationToken::new();
        let result = group.invoke(&ctx, &cancel).await;
        match result {
            StepResult::Parallel(branches) => assert_eq!(branches.len(), 2),
            _ => panic!("expected Parallel"),
        }
    }
}
