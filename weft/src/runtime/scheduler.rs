use crate::context;
use crate::errors::{ErrorKind, RuntimeError};
use crate::runtime::outcome::{ControlAction, Outcome};
use crate::task::{Priority, Resumption, Task, TaskFuture, TaskRef, TaskState};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, Location, catch_unwind, resume_unwind};
use std::task::{Context, Poll, Waker};
use tracing::trace;

/// Single-threaded cooperative scheduler.
///
/// Owns the runnable FIFO, the next-tick list and the current-task pointer.
/// All control operations (`start`, `resume`, `throw`, `terminate`) return an
/// [`Outcome`]; exceptional outcomes that nobody `resolve`s are surfaced on
/// the error sink at the end of the tick.
pub struct Scheduler {
    runnable: RefCell<VecDeque<TaskRef>>,

    next_tick: RefCell<VecDeque<Box<dyn FnOnce()>>>,

    /// The task whose entry is being polled right now. Nested control ops
    /// (a listener resuming another task) save and restore it.
    current: RefCell<Option<TaskRef>>,

    main: TaskRef,

    /// Set when the main task has a pending resumption; `tick` breaks so the
    /// outer `block_on` loop can poll the root future.
    root_woken: Cell<bool>,

    /// Exceptional outcomes awaiting resolution, flushed once per tick.
    pending: RefCell<Vec<Outcome>>,

    /// Include runtime/vendor capture sites in reports.
    debug: bool,
}

impl Scheduler {
    pub(crate) fn new(debug: bool) -> Self {
        Scheduler {
            runnable: RefCell::new(VecDeque::new()),
            next_tick: RefCell::new(VecDeque::new()),
            current: RefCell::new(None),
            main: Task::new_main(),
            // The root future must be polled on the first loop iteration.
            root_woken: Cell::new(true),
            pending: RefCell::new(Vec::new()),
            debug,
        }
    }

    /// The task currently being polled, if any.
    pub fn current(&self) -> Option<TaskRef> {
        self.current.borrow().clone()
    }

    pub(crate) fn set_root_woken(&self) {
        self.root_woken.set(true);
    }

    pub(crate) fn reset_root_woken(&self) -> bool {
        self.root_woken.replace(false)
    }

    /// Creates a task around `entry` and queues it runnable.
    pub(crate) fn spawn(&self, entry: TaskFuture) -> TaskRef {
        let task = Task::new(entry);
        self.enqueue(&task, false);
        task
    }

    /// Marks the task runnable. With `immediate`, runs it in place instead
    /// of appending to the queue.
    pub fn enqueue(&self, task: &TaskRef, immediate: bool) {
        match task.state() {
            // Already queued: keep the runnable-queue/state invariant.
            TaskState::Runnable => return,
            TaskState::Created | TaskState::Waiting => {}
            TaskState::Running | TaskState::Dead => return,
        }
        task.transition(TaskState::Runnable, "runnable");
        if immediate {
            self.run_task(task, Location::caller());
        } else {
            self.runnable.borrow_mut().push_back(task.clone());
        }
    }

    /// Delivers a resumption to a parked task and queues it runnable, in
    /// FIFO position. This is how primitives and reactor callbacks wake
    /// their waiters; the synchronous `resume`/`throw` control ops re-enter
    /// the task in place instead.
    pub(crate) fn wake(&self, task: &TaskRef, res: Resumption) -> bool {
        if task.state() != TaskState::Waiting || !task.deliver(res) {
            return false;
        }
        self.enqueue(task, false);
        true
    }

    /// Re-enters a parked task with a value-less resumption. Also accepts a
    /// task that has not started yet, routing through `start`.
    #[track_caller]
    pub fn resume(&self, task: &TaskRef) -> Outcome {
        let site = Location::caller();
        match task.state() {
            TaskState::Waiting if task.has_park() => {
                task.deliver(Ok(()));
                self.run_inner(task, ControlAction::Resume, site)
            }
            TaskState::Created => {
                task.transition(TaskState::Runnable, "runnable");
                self.run_inner(task, ControlAction::Start, site)
            }
            actual => self.invalid_state(task, ControlAction::Resume, "resume", actual, site),
        }
    }

    /// Re-enters a parked task with an error that surfaces at its suspension
    /// site.
    #[track_caller]
    pub fn throw(&self, task: &TaskRef, err: RuntimeError) -> Outcome {
        let site = Location::caller();
        match task.state() {
            TaskState::Waiting if task.has_park() => {
                task.deliver(Err(err));
                self.run_inner(task, ControlAction::Throw, site)
            }
            actual => self.invalid_state(task, ControlAction::Throw, "throw", actual, site),
        }
    }

    /// Cooperative cancellation. A running task is terminated at its next
    /// suspension point via a high-priority one-shot listener; a parked task
    /// is thrown into right away; a task that never ran is cancelled without
    /// being polled.
    #[track_caller]
    pub fn terminate(&self, task: &TaskRef) -> Outcome {
        let site = Location::caller();
        match task.state() {
            TaskState::Running => {
                task.on_state(TaskState::Waiting, Priority::High, |t| {
                    let sched = context::scheduler();
                    sched
                        .throw(t, RuntimeError::Terminated)
                        .resolve(ErrorKind::Terminated);
                });
                Outcome::new(ControlAction::Terminate, task.clone(), None, site)
            }
            TaskState::Waiting if task.has_park() => {
                task.deliver(Err(RuntimeError::Terminated));
                let outcome = self.run_inner(task, ControlAction::Terminate, site);
                outcome.resolve(ErrorKind::Terminated);
                outcome
            }
            TaskState::Created | TaskState::Runnable => {
                self.runnable
                    .borrow_mut()
                    .retain(|t| !TaskRef::ptr_eq(t, task));
                task.finish(Err(RuntimeError::Terminated));
                Outcome::new(ControlAction::Terminate, task.clone(), None, site)
            }
            _ => Outcome::new(ControlAction::Terminate, task.clone(), None, site),
        }
    }

    /// Defers `cb` to the very top of the next tick, before any reactor
    /// work.
    pub fn next_tick(&self, cb: impl FnOnce() + 'static) {
        self.next_tick.borrow_mut().push_back(Box::new(cb));
    }

    fn invalid_state(
        &self,
        task: &TaskRef,
        action: ControlAction,
        op: &'static str,
        actual: TaskState,
        site: &'static Location<'static>,
    ) -> Outcome {
        let err = RuntimeError::InvalidState {
            op,
            expected: TaskState::Waiting,
            actual,
        };
        let outcome = Outcome::new(action, task.clone(), Some(err), site);
        self.pending.borrow_mut().push(outcome.clone());
        outcome
    }

    /// Runs one task taken off the runnable queue.
    fn run_task(&self, task: &TaskRef, site: &'static Location<'static>) {
        let action = if task.started() {
            ControlAction::Resume
        } else {
            ControlAction::Start
        };
        self.run_inner(task, action, site);
    }

    /// Polls the task's entry with the current-task pointer switched over,
    /// then settles the resulting state and outcome.
    fn run_inner(
        &self,
        task: &TaskRef,
        action: ControlAction,
        site: &'static Location<'static>,
    ) -> Outcome {
        task.transition(TaskState::Running, "running");

        let prev = self.current.replace(Some(task.clone()));
        let mut cx = Context::from_waker(Waker::noop());
        let poll = task.poll_entry(&mut cx);
        *self.current.borrow_mut() = prev;

        match poll {
            Poll::Ready(res) => {
                let err = res.as_ref().err().cloned();
                task.finish(res);
                let outcome = Outcome::new(action, task.clone(), err.clone(), site);
                if err.is_some() {
                    self.pending.borrow_mut().push(outcome.clone());
                }
                outcome
            }
            Poll::Pending => {
                assert!(
                    task.has_park(),
                    "task #{} returned Pending without parking; \
                     foreign futures cannot suspend on this runtime",
                    task.id()
                );
                task.transition(TaskState::Waiting, "waiting");
                Outcome::new(action, task.clone(), None, site)
            }
        }
    }

    /// One driver iteration: next-tick drain (fault isolated), one reactor
    /// quantum, runnable drain, report flush.
    pub(crate) fn tick(&self) {
        // (a) Next-tick callbacks queued at tick start; entries added during
        // the drain wait for the next tick. A panicking callback must not
        // starve the rest: the first panic is re-raised after the drain.
        let mut cbs = {
            let mut queue = self.next_tick.borrow_mut();
            std::mem::take(&mut *queue)
        };
        let mut first_panic = None;
        for cb in cbs.drain(..) {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(cb)) {
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            resume_unwind(payload);
        }

        // (b) One batch of ready events.
        if let Some(reactor) = context::try_with(|ctx| ctx.reactor.clone()) {
            if reactor.is_active() {
                if let Err(err) = reactor.tick() {
                    context::report_line(&format!("[weft] reactor tick failed: {err:#}"));
                }
            }
        }

        // (c) Drain runnable FIFO to empty; tasks enqueued while draining
        // run within the same tick.
        loop {
            let task = self.runnable.borrow_mut().pop_front();
            let Some(task) = task else { break };
            if task.is_main() {
                trace!(task = %task.id(), "main task woken");
                self.set_root_woken();
                continue;
            }
            self.run_task(&task, Location::caller());
        }

        // (d) Surface whatever nobody resolved.
        self.flush_reports();
    }

    fn flush_reports(&self) {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        for outcome in pending {
            if outcome.needs_report() {
                context::report_line(&outcome.render_report(self.debug));
            }
        }
    }

    /// Polls the root future with the main task installed as current. The
    /// root is driven by `block_on` itself, so the main task carries no entry
    /// future of its own.
    pub(crate) fn poll_root<F: std::future::Future>(
        &self,
        fut: std::pin::Pin<&mut F>,
    ) -> Poll<F::Output> {
        let main = self.main.clone();
        if main.state() == TaskState::Created {
            main.transition(TaskState::Runnable, "runnable");
        }
        main.transition(TaskState::Running, "running");

        let prev = self.current.replace(Some(main.clone()));
        let mut cx = Context::from_waker(Waker::noop());
        let poll = fut.poll(&mut cx);
        *self.current.borrow_mut() = prev;

        if poll.is_pending() {
            assert!(
                main.has_park(),
                "the root future returned Pending without parking; \
                 foreign futures cannot suspend on this runtime"
            );
            main.transition(TaskState::Waiting, "waiting");
        }
        poll
    }

    /// Terminates the main task once the root future has completed and all
    /// remaining work has drained; root-level defers run here.
    pub(crate) fn finish_root(&self) {
        self.main.finish(Ok(()));
    }

    pub(crate) fn root_woken(&self) -> bool {
        self.root_woken.get()
    }

    pub(crate) fn has_work(&self) -> bool {
        !self.runnable.borrow().is_empty() || !self.next_tick.borrow().is_empty()
    }

    /// Drives ticks until no local or reactor work remains. Used by the
    /// forked child to let its spawned tasks finish before exiting.
    pub(crate) fn drive_until_idle(&self) {
        loop {
            let reactor_active = context::try_with(|ctx| ctx.reactor.is_active()).unwrap_or(false);
            if !self.has_work() && !reactor_active {
                break;
            }
            self.tick();
        }
    }

    /// Child-side reset after `fork`: queues, reports and the current-task
    /// pointer all belong to the parent.
    pub(crate) fn reset_after_fork(&self) {
        self.runnable.borrow_mut().clear();
        self.next_tick.borrow_mut().clear();
        self.pending.borrow_mut().clear();
        *self.current.borrow_mut() = None;
        self.root_woken.set(false);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("runnable", &self.runnable.borrow().len())
            .field("next_tick", &self.next_tick.borrow().len())
            .field("root_woken", &self.root_woken.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_sets_runnable_once() {
        let sched = Scheduler::new(false);
        let task = Task::new(Box::pin(async { Ok(()) }));
        sched.enqueue(&task, false);
        sched.enqueue(&task, false);
        assert_eq!(task.state(), TaskState::Runnable);
        assert_eq!(sched.runnable.borrow().len(), 1);
    }

    #[test]
    fn test_immediate_enqueue_runs_to_completion() {
        let sched = Scheduler::new(false);
        let task = Task::new(Box::pin(async { Ok(()) }));
        sched.enqueue(&task, true);
        assert_eq!(task.state(), TaskState::Dead);
        assert!(matches!(task.result(), Some(Ok(()))));
    }

    #[test]
    fn test_resume_on_dead_task_is_invalid_state() {
        let sched = Scheduler::new(false);
        let task = Task::new(Box::pin(async { Ok(()) }));
        sched.enqueue(&task, true);

        let outcome = sched.resume(&task);
        assert!(!outcome.is_ok());
        assert!(matches!(
            outcome.error(),
            Some(RuntimeError::InvalidState {
                op: "resume",
                actual: TaskState::Dead,
                ..
            })
        ));
    }

    #[test]
    fn test_terminate_unstarted_task_cancels_without_polling() {
        let sched = Scheduler::new(false);
        let polled = std::rc::Rc::new(Cell::new(false));
        let p = polled.clone();
        let task = Task::new(Box::pin(async move {
            p.set(true);
            Ok(())
        }));
        sched.enqueue(&task, false);

        let outcome = sched.terminate(&task);
        assert!(outcome.is_ok());
        assert_eq!(task.state(), TaskState::Dead);
        assert!(!polled.get());
        assert!(matches!(task.result(), Some(Err(RuntimeError::Terminated))));
        // Cancelled tasks must leave the runnable queue.
        assert!(sched.runnable.borrow().is_empty());
    }

    #[test]
    fn test_failed_task_outcome_is_pending_until_flush() {
        let sched = Scheduler::new(false);
        let task = Task::new(Box::pin(async { Err(RuntimeError::ChannelClosed) }));
        let outcome = sched.resume(&task);
        assert!(matches!(
            outcome.error(),
            Some(RuntimeError::ChannelClosed)
        ));
        assert_eq!(sched.pending.borrow().len(), 1);
        outcome.resolve(ErrorKind::ChannelClosed);
        sched.flush_reports();
        assert!(sched.pending.borrow().is_empty());
    }

    #[test]
    fn test_next_tick_runs_in_submission_order() {
        let sched = Scheduler::new(false);
        let order = std::rc::Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let o = order.clone();
            sched.next_tick(move || o.borrow_mut().push(i));
        }
        sched.tick();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_next_tick_panic_is_isolated_and_reraised() {
        let sched = Scheduler::new(false);
        let ran = std::rc::Rc::new(Cell::new(false));
        let r = ran.clone();
        sched.next_tick(|| panic!("boom"));
        sched.next_tick(move || r.set(true));

        let result = catch_unwind(AssertUnwindSafe(|| sched.tick()));
        assert!(result.is_err());
        // The callback after the panicking one still ran.
        assert!(ran.get());
    }
}
