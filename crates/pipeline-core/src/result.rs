//! Typed step outcomes carrying value, error, and forward-routing hints
//! (spec §3, §4.1). A tagged variant, not an exception: a step that raises a
//! fault is caught at the step boundary and converted into `Error` here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The producing step's identity, carried as a non-owning back-reference
/// (name/path), not a shared pointer to the step itself — steps are owned
/// by the pipeline; results only ever name one (spec §9, "cyclic object
/// graphs").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRef {
    pub name: String,
    pub path: String,
}

impl StepRef {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        StepRef {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// A step's typed result.
#[derive(Debug, Clone)]
pub enum StepResult<T> {
    Success {
        value: T,
        step: StepRef,
        next_steps: Option<Vec<String>>,
    },
    Error {
        message: String,
        underlying: Option<Arc<anyhow::Error>>,
        step: StepRef,
    },
    Empty,
    Parallel(HashMap<String, StepResult<T>>),
}

impl<T> StepResult<T> {
    pub fn success(value: T, step: StepRef) -> Self {
        StepResult::Success {
            value,
            step,
            next_steps: None,
        }
    }

    pub fn success_with_routing(value: T, step: StepRef, next_steps: Vec<String>) -> Self {
        StepResult::Success {
            value,
            step,
            next_steps: Some(next_steps),
        }
    }

    pub fn error(message: impl Into<String>, step: StepRef) -> Self {
        StepResult::Error {
            message: message.into(),
            underlying: None,
            step,
        }
    }

    pub fn error_with_cause(message: impl Into<String>, cause: anyhow::Error, step: StepRef) -> Self {
        StepResult::Error {
            message: message.into(),
            underlying: Some(Arc::new(cause)),
            step,
        }
    }

    pub fn has_error(&self) -> bool {
        matches!(self, StepResult::Error { .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            StepResult::Error { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn step(&self) -> Option<&StepRef> {
        match self {
            StepResult::Success { step, .. } | StepResult::Error { step, .. } => Some(step),
            StepResult::Empty | StepResult::Parallel(_) => None,
        }
    }

    pub fn next_steps(&self) -> Option<&[String]> {
        match self {
            StepResult::Success { next_steps, .. } => next_steps.as_deref(),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            StepResult::Success { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            StepResult::Success { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StepResult<U> {
        match self {
            StepResult::Success {
                value,
                step,
                next_steps,
            } => StepResult::Success {
                value: f(value),
                step,
                next_steps,
            },
            StepResult::Error {
                message,
                underlying,
                step,
            } => StepResult::Error {
                message,
                underlying,
                step,
            },
            StepResult::Empty => StepResult::Empty,
            StepResult::Parallel(branches) => {
                StepResult::Parallel(branches.into_iter().map(|(k, v)| (k, v.map(&f))).collect())
            }
        }
    }
}

impl<T> fmt::Display for StepResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepResult::Success { step, .. } => write!(f, "Success({})", step.name),
            StepResult::Error { message, step, .. } => {
                write!(f, "Error({}: {})", step.name, message)
            }
            StepResult::Empty => write!(f, "Empty"),
            StepResult::Parallel(branches) => write!(f, "Parallel({} branches)", branches.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_preserves_error_variant() {
        let result: StepResult<i32> = StepResult::error("boom", StepRef::new("s1", "s1"));
        let mapped = result.map(|v| v.to_string());
        assert!(mapped.has_error());
        assert_eq!(mapped.error_message(), Some("boom"));
    }

    #[test]
    fn success_carries_routing_hints() {
        let result = StepResult::success_with_routing(
            42,
            StepRef::new("router", "router"),
            vec!["next_a".into(), "next_b".into()],
        );
        assert_eq!(result.next_steps(), Some(&["next_a".to_string(), "next_b".to_string()][..]));
        assert_eq!(result.value(), Some(&42));
    }
}
