//! Pipeline executor and the fixed middleware chain (spec §4.6). Grounded
//! on the corpus's `CompositeDriver` (`middleware/driver.rs`): an ordered
//! phase dispatch over `Arc<dyn Trait>` children, re-specialized here to
//! the spec's fixed `Observability -> Timeout -> Retry` chain wrapping any
//! user middlewares.

use crate::context::PipelineContext;
use crate::error::{PipelineError, StepFault};
use crate::events::EventKind;
use crate::result::{StepRef, StepResult};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};

type BoxFuture<T> = Pin<Box<dyn Future<Output = StepResult<T>> + Send>>;

/// The remainder of the chain. A well-behaved middleware calls this exactly
/// once and returns its result, optionally observing it first.
pub struct Next<T> {
    inner: Box<dyn FnOnce() -> BoxFuture<T> + Send>,
}

impl<T: Send + 'static> Next<T> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StepResult<T>> + Send + 'static,
    {
        Next {
            inner: Box::new(move || Box::pin(f())),
        }
    }

    pub async fn call(self) -> StepResult<T> {
        (self.inner)().await
    }
}

/// `invoke(step_name, ctx, cancel, next)` — matches spec §4.6's
/// `invoke(step, input, ctx, next, cancel)`, with `input` implicit in the
/// closure `next` wraps.
#[async_trait]
pub trait Middleware<T: Send + Sync + Clone + 'static>: Send + Sync {
    async fn invoke(
        &self,
        step_name: &str,
        ctx: &PipelineContext,
        cancel: &CancellationToken,
        next: Next<T>,
    ) -> StepResult<T>;
}

/// One attempt of a step's `execute`, and its `validate`. The retry loop
/// calls `attempt_fn` up to `max_retries + 1` times.
pub struct StepInvocation<T: Send + Sync + Clone> {
    pub step_name: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout: Duration,
    #[allow(clippy::type_complexity)]
    pub attempt_fn: Arc<
        dyn Fn(u32, Option<T>) -> Pin<Box<dyn Future<Output = Result<T, StepFault>> + Send>>
            + Send
            + Sync,
    >,
    #[allow(clippy::type_complexity)]
    pub validate_fn: Arc<
        dyn Fn(T) -> Pin<Box<dyn Future<Output = Result<(), StepFault>> + Send>> + Send + Sync,
    >,
}

/// Emits `step.started`/`step.completed` and wraps `next` in a tracing span
/// tagged with step name, path, and correlation id.
pub struct ObservabilityMiddleware;

#[async_trait]
impl<T: Send + Sync + Clone + 'static> Middleware<T> for ObservabilityMiddleware {
    async fn invoke(
        &self,
        step_name: &str,
        ctx: &PipelineContext,
        _cancel: &CancellationToken,
        next: Next<T>,
    ) -> StepResult<T> {
        ctx.emit(Some(step_name), EventKind::StepStarted);
        let span = info_span!(
            "pipeline.step",
            name = %step_name,
            path = %ctx.current_path,
            correlation_id = %ctx.correlation_id,
        );
        let started = Instant::now();
        let result = next.call().instrument(span).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        ctx.emit(
            Some(step_name),
            EventKind::StepCompleted {
                success: !result.has_error(),
                duration_ms,
            },
        );
        result
    }
}

/// Enforces a ceiling over the whole retry loop (the per-attempt timeout is
/// already enforced inside `RetryMiddleware`; this is the pipeline-level
/// backstop spec §4.6 describes as "the step's declared timeout").
pub struct TimeoutMiddleware;

#[async_trait]
impl<T: Send + Sync + Clone + 'static> Middleware<T> for TimeoutMiddleware {
    async fn invoke(
        &self,
        step_name: &str,
        ctx: &PipelineContext,
        _cancel: &CancellationToken,
        next: Next<T>,
    ) -> StepResult<T> {
        let step_ref = StepRef::new(step_name.to_string(), ctx.child_path(step_name));
        // The retry loop owns the per-attempt timeout in `StepInvocation`;
        // this is a generous backstop in case a middleware above it hangs.
        match tokio::time::timeout(Duration::from_secs(3600), next.call()).await {
            Ok(result) => result,
            Err(_elapsed) => StepResult::error(format!("step '{step_name}' timed out"), step_ref),
        }
    }
}

/// Up to `max_retries` attempts with a delay between them. On each retry it
/// calls `execute(attempt=k, last_result=result_of_previous_attempt)` and
/// `validate(result)`; a structural validation failure is retryable in
/// exactly the same loop (spec §4.6).
pub struct RetryMiddleware;

impl RetryMiddleware {
    pub async fn run<T: Send + Sync + Clone + 'static>(
        invocation: StepInvocation<T>,
        ctx: &PipelineContext,
        cancel: &CancellationToken,
    ) -> StepResult<T> {
        let step_ref = StepRef::new(invocation.step_name.clone(), ctx.child_path(&invocation.step_name));
        let mut last_result: Option<T> = None;
        let mut attempt: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                return StepResult::error("execution cancelled", step_ref);
            }

            let execute_future = (invocation.attempt_fn)(attempt, last_result.clone());
            let outcome = match tokio::time::timeout(invocation.timeout, execute_future).await {
                // A timeout is not a structural-validation failure: it must
                // not re-enter the retry loop below (spec §7 — timeouts are
                // never retried by the core).
                Err(_elapsed) => {
                    let timeout = PipelineError::Timeout {
                        step: invocation.step_name.clone(),
                        elapsed_ms: invocation.timeout.as_millis() as u64,
                    };
                    return StepResult::error(timeout.to_string(), step_ref);
                }
                Ok(inner) => inner,
            };

            let validated = match outcome {
                Ok(value) => match (invocation.validate_fn)(value.clone()).await {
                    Ok(()) => Ok(value),
                    Err(fault) => Err(fault),
                },
                Err(fault) => Err(fault),
            };

            match validated {
                Ok(value) => {
                    ctx.emit(
                        Some(invocation.step_name.as_str()),
                        EventKind::StepValidation {
                            attempt,
                            passed: true,
                            diagnostic: None,
                        },
                    );
                    return StepResult::success(value, step_ref);
                }
                Err(fault) => {
                    ctx.emit(
                        Some(invocation.step_name.as_str()),
                        EventKind::StepValidation {
                            attempt,
                            passed: false,
                            diagnostic: Some(fault.to_string()),
                        },
                    );
                    if attempt >= invocation.max_retries + 1 {
                        return StepResult::error(fault.to_string(), step_ref);
                    }
                    if invocation.retry_delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(invocation.retry_delay_ms)).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Runs `[user...] -> Observability -> Timeout -> Retry` for one step
/// invocation and returns its final result.
pub async fn run_step_chain<T: Send + Sync + Clone + 'static>(
    invocation: StepInvocation<T>,
    ctx: &PipelineContext,
    cancel: &CancellationToken,
    user_middlewares: &[Arc<dyn Middleware<T>>],
) -> StepResult<T> {
    let step_name = invocation.step_name.clone();
    let ctx_for_retry = ctx.clone();
    let cancel_for_retry = cancel.clone();

    let retry_stage = Next::new(move || RetryMiddleware::run(invocation, &ctx_for_retry, &cancel_for_retry));

    let ctx_for_timeout = ctx.clone();
    let cancel_for_timeout = cancel.clone();
    let timeout_name = step_name.clone();
    let timeout_stage = Next::new(move || async move {
        TimeoutMiddleware
            .invoke(&timeout_name, &ctx_for_timeout, &cancel_for_timeout, retry_stage)
            .await
    });

    let ctx_for_obs = ctx.clone();
    let cancel_for_obs = cancel.clone();
    let obs_name = step_name.clone();
    let mut chain: Next<T> = Next::new(move || async move {
        ObservabilityMiddleware
            .invoke(&obs_name, &ctx_for_obs, &cancel_for_obs, timeout_stage)
            .await
    });

    for middleware in user_middlewares.iter().rev() {
        let middleware = Arc::clone(middleware);
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        let name = step_name.clone();
        let inner = chain;
        chain = Next::new(move || async move { middleware.invoke(&name, &ctx, &cancel, inner).await });
    }

    chain.call().await
}

/// One entry in the ordered step list the executor walks (spec §4.6).
#[derive(Clone)]
pub struct PipelineStep {
    pub name: String,
    #[allow(clippy::type_complexity)]
    pub invoke: Arc<
        dyn Fn(
                PipelineContext,
                CancellationToken,
            ) -> Pin<Box<dyn Future<Output = StepResult<serde_json::Value>> + Send>>
            + Send
            + Sync,
    >,
}

/// Walks an ordered step list forward-only: on `Error` it halts and emits
/// `pipeline.completed(success=false)`; on `next_steps` it substitutes them
/// for the remainder of the list (routing); otherwise it advances normally.
pub async fn run_pipeline(
    pipeline_name: &str,
    mut steps: Vec<PipelineStep>,
    ctx: &PipelineContext,
    cancel: &CancellationToken,
) -> StepResult<serde_json::Value> {
    ctx.emit(
        None,
        EventKind::PipelineStarted {
            pipeline_name: pipeline_name.to_string(),
        },
    );

    let mut last = StepResult::Empty;
    let mut index = 0usize;

    while index < steps.len() {
        if cancel.is_cancelled() {
            last = StepResult::error("execution cancelled", StepRef::new(pipeline_name, pipeline_name));
            break;
        }

        let step = steps[index].clone();
        last = (step.invoke)(ctx.clone(), cancel.clone()).await;

        if last.has_error() {
            break;
        }

        if let Some(next_names) = last.next_steps() {
            let by_name: std::collections::HashMap<&str, &PipelineStep> =
                steps.iter().map(|s| (s.name.as_str(), s)).collect();
            let routed: Vec<PipelineStep> = next_names
                .iter()
                .filter_map(|name| by_name.get(name.as_str()).copied().cloned())
                .collect();
            let head: Vec<PipelineStep> = steps[..=index].to_vec();
            steps = head.into_iter().chain(routed).collect();
        }

        index += 1;
    }

    ctx.emit(
        None,
        EventKind::PipelineCompleted {
            success: !last.has_error(),
            error: last.error_message().map(str::to_string),
        },
    );

    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationContext;

    fn make_context(step_name: &str) -> PipelineContext {
        PipelineContext::new(ConversationContext::new("conv-1", 1000)).with_path(step_name.to_string())
    }

    fn noop_validate<T: Send + 'static>()
    -> Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = Result<(), StepFault>> + Send>> + Send + Sync>
    {
        Arc::new(|_value: T| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn retry_middleware_succeeds_without_retry() {
        let invocation = StepInvocation {
            step_name: "s1".to_string(),
            max_retries: 0,
            retry_delay_ms: 0,
            timeout: Duration::from_secs(5),
            attempt_fn: Arc::new(|_attempt, _last| Box::pin(async { Ok(42) })),
            validate_fn: noop_validate(),
        };
        let ctx = make_context("s1");
        let cancel = CancellationToken::new();
        let result = RetryMiddleware::run(invocation, &ctx, &cancel).await;
        assert_eq!(result.value(), Some(&42));
    }

    #[tokio::test]
    async fn retry_middleware_retries_until_success() {
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let invocation = StepInvocation {
            step_name: "s1".to_string(),
            max_retries: 2,
            retry_delay_ms: 0,
            timeout: Duration::from_secs(5),
            attempt_fn: Arc::new(move |attempt, _last| {
                let attempts_clone = attempts_clone.clone();
                Box::pin(async move {
                    attempts_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if attempt < 3 {
                        Err(StepFault::Validation("not yet".into()))
                    } else {
                        Ok(99)
                    }
                })
            }),
            validate_fn: noop_validate(),
        };
        let ctx = make_context("s1");
        let cancel = CancellationToken::new();
        let result = RetryMiddleware::run(invocation, &ctx, &cancel).await;
        assert_eq!(result.value(), Some(&99));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_middleware_gives_up_after_max_retries() {
        let invocation = StepInvocation {
            step_name: "s1".to_string(),
            max_retries: 1,
            retry_delay_ms: 0,
            timeout: Duration::from_secs(5),
            attempt_fn: Arc::new(|_attempt, _last| {
                Box::pin(async { Err(StepFault::Validation("always fails".into())) })
            }),
            validate_fn: noop_validate(),
        };
        let ctx = make_context("s1");
        let cancel = CancellationToken::new();
        let result = RetryMiddleware::run(invocation, &ctx, &cancel).await;
        assert!(result.has_error());
    }

    #[tokio::test]
    async fn validation_failure_is_retryable() {
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let invocation: StepInvocation<i32> = StepInvocation {
            step_name: "s1".to_string(),
            max_retries: 1,
            retry_delay_ms: 0,
            timeout: Duration::from_secs(5),
            attempt_fn: Arc::new(move |_attempt, _last| {
                let attempts_clone = attempts_clone.clone();
                Box::pin(async move {
                    attempts_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(1)
                })
            }),
            validate_fn: Arc::new(|value: i32| {
                Box::pin(async move {
                    if value == 1 {
                        Err(StepFault::Validation("want 2".into()))
                    } else {
                        Ok(())
                    }
                })
            }),
        };
        let ctx = make_context("s1");
        let cancel = CancellationToken::new();
        let result = RetryMiddleware::run(invocation, &ctx, &cancel).await;
        assert!(result.has_error());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn chain_runs_observability_timeout_retry_in_order() {
        let invocation = StepInvocation {
            step_name: "s1".to_string(),
            max_retries: 0,
            retry_delay_ms: 0,
            timeout: Duration::from_secs(5),
            attempt_fn: Arc::new(|_attempt, _last| Box::pin(async { Ok(7) })),
            validate_fn: noop_validate(),
        };
        let events = Arc::new(crate::event_channel::EventChannel::new());
        let ctx = make_context("s1").with_events(events.clone());
        let mut rx = events.subscribe();
        let cancel = CancellationToken::new();
        let result: StepResult<i32> = run_step_chain(invocation, &ctx, &cancel, &[]).await;
        assert_eq!(result.value(), Some(&7));

        let started = rx.recv().await.unwrap();
        assert!(matches!(started.kind, EventKind::StepStarted));
        let validated = rx.recv().await.unwrap();
        assert!(matches!(
            validated.kind,
            EventKind::StepValidation { passed: true, .. }
        ));
        let completed = rx.recv().await.unwrap();
        assert!(matches!(
            completed.kind,
            EventKind::StepCompleted { success: true, .. }
        ));
    }

    #[tokio::test]
    async fn pipeline_halts_on_first_error() {
        let step_a = PipelineStep {
            name: "a".to_string(),
            invoke: Arc::new(|ctx, _cancel| {
                Box::pin(async move {
                    StepResult::success(serde_json::json!(1), StepRef::new("a", ctx.child_path("a")))
                })
            }),
        };
        let step_b = PipelineStep {
            name: "b".to_string(),
            invoke: Arc::new(|ctx, _cancel| {
                Box::pin(async move { StepResult::error("boom", StepRef::new("b", ctx.child_path("b"))) })
            }),
        };
        let step_c = PipelineStep {
            name: "c".to_string(),
            invoke: Arc::new(|ctx, _cancel| {
                Box::pin(async move {
                    StepResult::success(serde_json::json!(3), StepRef::new("c", ctx.child_path("c")))
                })
            }),
        };

        let ctx = make_context("pipeline");
        let cancel = CancellationToken::new();
        let result = run_pipeline("p", vec![step_a, step_b, step_c], &ctx, &cancel).await;
        assert!(result.has_error());
    }

    #[tokio::test]
    async fn pipeline_emits_started_and_completed() {
        let events = Arc::new(crate::event_channel::EventChannel::new());
        let ctx = make_context("pipeline").with_events(events.clone());
        let mut rx = events.subscribe();
        let cancel = CancellationToken::new();

        let step_a = PipelineStep {
            name: "a".to_string(),
            invoke: Arc::new(|ctx, _cancel| {
                Box::pin(async move {
                    StepResult::success(serde_json::json!(1), StepRef::new("a", ctx.child_path("a")))
                })
            }),
        };

        let result = run_pipeline("p", vec![step_a], &ctx, &cancel).await;
        assert!(!result.has_error());

        let started = rx.recv().await.unwrap();
        assert!(matches!(started.kind, EventKind::PipelineStarted { .. }));
    }
}
