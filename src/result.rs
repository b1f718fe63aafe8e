//! Typed, non-panicking call outcomes.

use crate::error::{ErrorCode, TypedError};
use crate::metrics::Metrics;
use std::fmt;

/// Coarse outcome discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Success,
    Failure,
    Timeout,
    Aborted,
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultKind::Success => write!(f, "success"),
            ResultKind::Failure => write!(f, "failure"),
            ResultKind::Timeout => write!(f, "timeout"),
            ResultKind::Aborted => write!(f, "aborted"),
        }
    }
}

/// Outcome of one `run` call. Exactly one of data/error is present by
/// construction; `Timeout` and `Aborted` always carry errors with the
/// matching code.
#[derive(Debug, Clone)]
pub enum TaskResult<T> {
    Success { data: T, metrics: Metrics },
    Failure { error: TypedError, metrics: Metrics },
    Timeout { error: TypedError, metrics: Metrics },
    Aborted { error: TypedError, metrics: Metrics },
}

impl<T> TaskResult<T> {
    /// Classify a terminal error into the right variant by its code.
    pub(crate) fn from_error(error: TypedError, metrics: Metrics) -> Self {
        match error.code {
            ErrorCode::Timeout => TaskResult::Timeout { error, metrics },
            ErrorCode::Aborted => TaskResult::Aborted { error, metrics },
            _ => TaskResult::Failure { error, metrics },
        }
    }

    pub fn kind(&self) -> ResultKind {
        match self {
            TaskResult::Success { .. } => ResultKind::Success,
            TaskResult::Failure { .. } => ResultKind::Failure,
            TaskResult::Timeout { .. } => ResultKind::Timeout,
            TaskResult::Aborted { .. } => ResultKind::Aborted,
        }
    }

    /// True iff this is a success.
    pub fn ok(&self) -> bool {
        matches!(self, TaskResult::Success { .. })
    }

    /// The success value, if any.
    pub fn data(&self) -> Option<&T> {
        match self {
            TaskResult::Success { data, .. } => Some(data),
            _ => None,
        }
    }

    /// The terminal error, for every non-success outcome.
    pub fn error(&self) -> Option<&TypedError> {
        match self {
            TaskResult::Success { .. } => None,
            TaskResult::Failure { error, .. }
            | TaskResult::Timeout { error, .. }
            | TaskResult::Aborted { error, .. } => Some(error),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        match self {
            TaskResult::Success { metrics, .. }
            | TaskResult::Failure { metrics, .. }
            | TaskResult::Timeout { metrics, .. }
            | TaskResult::Aborted { metrics, .. } => metrics,
        }
    }

    /// Collapse into a plain `Result`, discarding metrics.
    pub fn into_result(self) -> Result<T, TypedError> {
        match self {
            TaskResult::Success { data, .. } => Ok(data),
            TaskResult::Failure { error, .. }
            | TaskResult::Timeout { error, .. }
            | TaskResult::Aborted { error, .. } => Err(error),
        }
    }
}

/// Batch results split by outcome. `errors` holds every non-success error in
/// input order; the kind-specific buckets partition the same errors.
#[derive(Debug, Clone, Default)]
pub struct Partitioned<T> {
    pub ok: Vec<T>,
    pub errors: Vec<TypedError>,
    pub failures: Vec<TypedError>,
    pub timeouts: Vec<TypedError>,
    pub aborted: Vec<TypedError>,
}

/// Split batch results into success values and error buckets.
pub fn partition<T>(results: Vec<TaskResult<T>>) -> Partitioned<T> {
    let mut out = Partitioned {
        ok: Vec::new(),
        errors: Vec::new(),
        failures: Vec::new(),
        timeouts: Vec::new(),
        aborted: Vec::new(),
    };
    for result in results {
        match result {
            TaskResult::Success { data, .. } => out.ok.push(data),
            TaskResult::Failure { error, .. } => {
                out.errors.push(error.clone());
                out.failures.push(error);
            }
            TaskResult::Timeout { error, .. } => {
                out.errors.push(error.clone());
                out.timeouts.push(error);
            }
            TaskResult::Aborted { error, .. } => {
                out.errors.push(error.clone());
                out.aborted.push(error);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(v: i32) -> TaskResult<i32> {
        TaskResult::Success { data: v, metrics: Metrics::default() }
    }

    fn erring(code: ErrorCode) -> TaskResult<i32> {
        TaskResult::from_error(TypedError::new(code, "x"), Metrics::default())
    }

    #[test]
    fn ok_iff_success() {
        assert!(success(1).ok());
        assert_eq!(success(1).kind(), ResultKind::Success);
        assert!(!erring(ErrorCode::Unknown).ok());
    }

    #[test]
    fn from_error_discriminates_by_code() {
        assert_eq!(erring(ErrorCode::Timeout).kind(), ResultKind::Timeout);
        assert_eq!(erring(ErrorCode::Aborted).kind(), ResultKind::Aborted);
        assert_eq!(erring(ErrorCode::Http).kind(), ResultKind::Failure);
        assert_eq!(erring(ErrorCode::CircuitOpen).kind(), ResultKind::Failure);
    }

    #[test]
    fn exactly_one_of_data_and_error() {
        let ok = success(7);
        assert!(ok.data().is_some() && ok.error().is_none());
        let err = erring(ErrorCode::Network);
        assert!(err.data().is_none() && err.error().is_some());
    }

    #[test]
    fn into_result_round_trips() {
        assert_eq!(success(7).into_result().unwrap(), 7);
        let err = erring(ErrorCode::Timeout).into_result().unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
    }

    #[test]
    fn partition_buckets_by_kind() {
        let results = vec![
            success(1),
            erring(ErrorCode::Timeout),
            success(2),
            erring(ErrorCode::Aborted),
            erring(ErrorCode::Http),
        ];
        let parts = partition(results);
        assert_eq!(parts.ok, vec![1, 2]);
        assert_eq!(parts.errors.len(), 3);
        assert_eq!(parts.timeouts.len(), 1);
        assert_eq!(parts.aborted.len(), 1);
        assert_eq!(parts.failures.len(), 1);
        // Input order is preserved within `errors`.
        assert_eq!(parts.errors[0].code, ErrorCode::Timeout);
        assert_eq!(parts.errors[1].code, ErrorCode::Aborted);
        assert_eq!(parts.errors[2].code, ErrorCode::Http);
    }
}
