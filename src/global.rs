//! Process-wide default executor and the crate-level shortcut functions.

use crate::config::RunOptions;
use crate::error::{BoxError, TypedError};
use crate::executor::{Executor, TaskContext};
use crate::result::TaskResult;
use std::future::Future;
use std::sync::OnceLock;

static DEFAULT_EXECUTOR: OnceLock<Executor> = OnceLock::new();

/// The lazily initialized executor behind the shortcut functions. All
/// shortcuts share this one instance (and therefore its breaker state, were
/// one configured through per-call options).
pub fn default_executor() -> &'static Executor {
    DEFAULT_EXECUTOR.get_or_init(Executor::new)
}

/// Run a task on the default executor.
pub async fn run<T, Op, Fut>(task: Op) -> TaskResult<T>
where
    T: Send,
    Op: FnMut(TaskContext) -> Fut + Send,
    Fut: Future<Output = Result<T, BoxError>> + Send,
{
    default_executor().run(task).await
}

/// Run a task on the default executor with per-call options.
pub async fn run_with<T, Op, Fut>(task: Op, options: RunOptions) -> TaskResult<T>
where
    T: Send,
    Op: FnMut(TaskContext) -> Fut + Send,
    Fut: Future<Output = Result<T, BoxError>> + Send,
{
    default_executor().run_with(task, options).await
}

/// Run a task on the default executor, collapsing into `Result`.
pub async fn try_run<T, Op, Fut>(task: Op) -> Result<T, TypedError>
where
    T: Send,
    Op: FnMut(TaskContext) -> Fut + Send,
    Fut: Future<Output = Result<T, BoxError>> + Send,
{
    default_executor().try_run(task).await
}

/// Run a batch on the default executor.
pub async fn run_all<T, Op, Fut>(tasks: Vec<Op>) -> Vec<TaskResult<T>>
where
    T: Send,
    Op: FnMut(TaskContext) -> Fut + Send,
    Fut: Future<Output = Result<T, BoxError>> + Send,
{
    default_executor().run_all(tasks).await
}

/// Run a batch on the default executor with per-call options.
pub async fn run_all_with<T, Op, Fut>(tasks: Vec<Op>, options: RunOptions) -> Vec<TaskResult<T>>
where
    T: Send,
    Op: FnMut(TaskContext) -> Fut + Send,
    Fut: Future<Output = Result<T, BoxError>> + Send,
{
    default_executor().run_all_with(tasks, options).await
}

/// Run a batch on the default executor, returning the success values or the
/// first non-success error in input order.
pub async fn try_run_all<T, Op, Fut>(tasks: Vec<Op>) -> Result<Vec<T>, TypedError>
where
    T: Send,
    Op: FnMut(TaskContext) -> Fut + Send,
    Fut: Future<Output = Result<T, BoxError>> + Send,
{
    default_executor().try_run_all(tasks).await
}
