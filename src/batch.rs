//! Batch execution: a bounded worker pool over an index-ordered task list.
//!
//! Workers pull indices monotonically from a shared counter and write each
//! outcome into its input slot, so the result vector is index-aligned with
//! the task list regardless of completion order. Workers are plain futures
//! driven together by `join_all` inside the calling task; nothing is
//! spawned. A fired caller signal is a soft stop: in-flight calls resolve
//! through the single-task engine (which observes the signal and reports an
//! abort), no new indices are taken, and a post-pass runs every untouched
//! task against the already-cancelled signal so each slot gets a
//! deterministic aborted entry.

use crate::config::RunOptions;
use crate::error::BoxError;
use crate::executor::{Executor, TaskContext};
use crate::result::TaskResult;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub(crate) async fn run_batch<T, Op, Fut>(
    executor: &Executor,
    tasks: Vec<Op>,
    options: RunOptions,
) -> Vec<TaskResult<T>>
where
    T: Send,
    Op: FnMut(TaskContext) -> Fut + Send,
    Fut: Future<Output = Result<T, BoxError>> + Send,
{
    let total = tasks.len();
    if total == 0 {
        return Vec::new();
    }

    let workers = options
        .concurrency
        .or(executor.default_concurrency())
        .map(|limit| limit.min(total))
        .unwrap_or(total);

    let cells: Vec<Mutex<Option<Op>>> = tasks.into_iter().map(|task| Mutex::new(Some(task))).collect();
    let slots: Vec<Mutex<Option<TaskResult<T>>>> = (0..total).map(|_| Mutex::new(None)).collect();
    let next = AtomicUsize::new(0);

    tracing::debug!(total, workers, "starting batch");

    let worker_futures: Vec<_> = (0..workers)
        .map(|_| {
            let cells = &cells;
            let slots = &slots;
            let next = &next;
            let options = &options;
            async move {
                loop {
                    // Soft stop: no new starts once the caller signal fires.
                    if options.signal.as_ref().is_some_and(|signal| signal.is_cancelled()) {
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    if index >= total {
                        break;
                    }
                    let task = cells[index]
                        .lock()
                        .unwrap()
                        .take()
                        .expect("each index is claimed exactly once");
                    let result = executor.run_with(task, per_task_options(options)).await;
                    *slots[index].lock().unwrap() = Some(result);
                }
            }
        })
        .collect();
    futures::future::join_all(worker_futures).await;

    // Post-pass: every untouched slot runs its task against the (cancelled)
    // signal, which short-circuits into an aborted result.
    for index in 0..total {
        let untouched = slots[index].lock().unwrap().is_none();
        if !untouched {
            continue;
        }
        let task = cells[index].lock().unwrap().take();
        if let Some(task) = task {
            let result = executor.run_with(task, per_task_options(&options)).await;
            *slots[index].lock().unwrap() = Some(result);
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.into_inner().unwrap().expect("every slot is filled"))
        .collect()
}

/// Options forwarded to each single-task run. `concurrency` only shapes the
/// pool itself.
fn per_task_options(options: &RunOptions) -> RunOptions {
    let mut per_task = options.clone();
    per_task.concurrency = None;
    per_task
}
