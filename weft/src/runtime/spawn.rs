//! Free functions for spawning and controlling tasks on the installed
//! runtime. These are thin wrappers over the thread's [`Scheduler`].
//!
//! [`Scheduler`]: crate::runtime::scheduler::Scheduler

use crate::context;
use crate::errors::{Result, RuntimeError};
use crate::runtime::outcome::Outcome;
use crate::task::{TaskRef, park_with_event};
use std::future::Future;

/// Spawns a task for `future` and queues it runnable.
///
/// # Panics
///
/// Panics if no runtime is active on this thread.
pub fn go<F>(future: F) -> TaskRef
where
    F: Future<Output = ()> + 'static,
{
    spawn(async move {
        future.await;
        Ok(())
    })
}

/// Spawns a fallible task. An `Err` return is captured as the task's result
/// and surfaced as an end-of-tick diagnostic unless some caller resolves it.
pub fn spawn<F>(future: F) -> TaskRef
where
    F: Future<Output = Result<()>> + 'static,
{
    context::scheduler().spawn(Box::pin(future))
}

/// Defers `cb` to the top of the next scheduler tick, before any reactor
/// work. The canonical way to move work out of a callback and into the
/// nearest scheduler frame.
pub fn next_tick(cb: impl FnOnce() + 'static) {
    context::scheduler().next_tick(cb);
}

/// Re-enters a parked task. See [`Scheduler::resume`].
///
/// [`Scheduler::resume`]: crate::runtime::scheduler::Scheduler::resume
#[track_caller]
pub fn resume(task: &TaskRef) -> Outcome {
    context::scheduler().resume(task)
}

/// Throws `err` into a parked task; it surfaces at the suspension site.
#[track_caller]
pub fn throw(task: &TaskRef, err: RuntimeError) -> Outcome {
    context::scheduler().throw(task, err)
}

/// Requests cooperative cancellation of `task`.
#[track_caller]
pub fn terminate(task: &TaskRef) -> Outcome {
    context::scheduler().terminate(task)
}

/// Parks the current task and re-queues it behind everything already
/// runnable on the next tick.
pub async fn yield_now() -> Result<()> {
    let me = context::current_task().expect("yield_now() requires a running weft task");
    context::scheduler().next_tick(move || {
        context::scheduler().wake(&me, Ok(()));
    });
    park_with_event("yield").await
}
