//! The suspendable unit of execution and its state machine.
//!
//! A [`Task`] owns a pinned entry future, a defer list, a bounded trace ring
//! and two one-shot listener queues keyed on a target state. The scheduler
//! drives it through `Created → Runnable → Running → Waiting* → Dead`;
//! `recycle` rewinds a dead task to `Created` with a fresh entry so pools can
//! reuse the allocation.

use crate::context;
use crate::errors::{Result, RuntimeError};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::num::NonZeroU64;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

mod park;
pub use park::{Park, park};
pub(crate) use park::{ParkSlot, Resumption, park_with_event};

pub(crate) mod trace;
pub use trace::FrameClass;
use trace::TraceRing;

pub mod pool;

/// Task lifecycle states. Redundant transitions to the current state are
/// no-ops and fire no listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Created,
    Runnable,
    Running,
    Waiting,
    Dead,
}

/// An opaque ID that uniquely identifies a task for the lifetime of the
/// process. IDs are sequential only by accident; do not rely on ordering.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Id(NonZeroU64);

const MAIN_TASK_ID_VAL: u64 = 1;
pub(crate) static MAIN_TASK_ID: Id = Id(NonZeroU64::new(MAIN_TASK_ID_VAL).unwrap());

impl Id {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(MAIN_TASK_ID_VAL + 1);
        Id(NonZeroU64::new(NEXT.fetch_add(1, Ordering::Relaxed)).unwrap())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Listener dispatch order on a state transition: all `High` listeners fire
/// before any `Low` one, each queue in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

struct Listener {
    target: TaskState,
    priority: Priority,
    cb: Box<dyn FnOnce(&TaskRef)>,
}

pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = Result<()>>>>;

/// Fallback when no runtime context is installed (bare unit tests).
const DEFAULT_MAX_TRACES: usize = 20;

pub type TaskRef = Rc<Task>;

pub struct Task {
    id: Id,
    main: bool,

    state: Cell<TaskState>,

    /// The entry future. `None` for the main task (the root future is driven
    /// by `block_on` itself) and after termination.
    entry: RefCell<Option<TaskFuture>>,

    /// Outcome of the last run: `Ok` on normal return, the escaped error
    /// otherwise.
    result: RefCell<Option<Result<()>>>,

    defers: RefCell<Vec<Box<dyn FnOnce()>>>,
    defers_done: Cell<bool>,

    listeners: RefCell<SmallVec<[Listener; 4]>>,

    /// Mailbox of the currently parked suspension, if any.
    park: RefCell<Option<ParkSlot>>,

    /// Whether the entry has been polled at least once since creation or the
    /// last recycle.
    started: Cell<bool>,

    trace: RefCell<TraceRing>,
}

impl Task {
    pub(crate) fn new(entry: TaskFuture) -> TaskRef {
        Rc::new(Task {
            id: Id::next(),
            main: false,
            state: Cell::new(TaskState::Created),
            entry: RefCell::new(Some(entry)),
            result: RefCell::new(None),
            defers: RefCell::new(Vec::new()),
            defers_done: Cell::new(false),
            listeners: RefCell::new(SmallVec::new()),
            park: RefCell::new(None),
            started: Cell::new(false),
            trace: RefCell::new(TraceRing::new(max_traces())),
        })
    }

    /// The distinguished task standing in for the thread's outer context, so
    /// `current()` works uniformly inside `block_on`.
    pub(crate) fn new_main() -> TaskRef {
        Rc::new(Task {
            id: MAIN_TASK_ID,
            main: true,
            state: Cell::new(TaskState::Created),
            entry: RefCell::new(None),
            result: RefCell::new(None),
            defers: RefCell::new(Vec::new()),
            defers_done: Cell::new(false),
            listeners: RefCell::new(SmallVec::new()),
            park: RefCell::new(None),
            started: Cell::new(false),
            trace: RefCell::new(TraceRing::new(max_traces())),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn is_main(&self) -> bool {
        self.main
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    /// The stored result of the last run, if the task has terminated.
    pub fn result(&self) -> Option<Result<()>> {
        self.result.borrow().clone()
    }

    /// Registers a one-shot listener fired when the task next enters
    /// `target`. The callback runs inside a fresh task so a faulting listener
    /// cannot corrupt the emitter.
    pub fn on_state(
        self: &Rc<Self>,
        target: TaskState,
        priority: Priority,
        cb: impl FnOnce(&TaskRef) + 'static,
    ) {
        self.listeners.borrow_mut().push(Listener {
            target,
            priority,
            cb: Box::new(cb),
        });
    }

    pub(crate) fn add_defer(&self, cb: Box<dyn FnOnce()>) {
        self.defers.borrow_mut().push(cb);
    }

    /// Moves the task to `to`, recording the transition and firing matching
    /// listeners. A transition to the current state is a no-op.
    pub(crate) fn transition(self: &Rc<Self>, to: TaskState, event: &'static str) {
        if self.state.get() == to {
            return;
        }
        self.state.set(to);
        self.trace.borrow_mut().record(to, event);
        self.fire_listeners(to);
    }

    fn fire_listeners(self: &Rc<Self>, to: TaskState) {
        let all = std::mem::take(&mut *self.listeners.borrow_mut());
        let (mut fire, keep): (Vec<_>, Vec<_>) =
            all.into_iter().partition(|l| l.target == to);
        self.listeners.borrow_mut().extend(keep);
        if fire.is_empty() {
            return;
        }
        // Stable: high-priority listeners first, insertion order within each.
        fire.sort_by_key(|l| l.priority == Priority::Low);
        for listener in fire {
            let task = self.clone();
            match context::try_scheduler() {
                Some(sched) => {
                    sched.spawn(Box::pin(async move {
                        (listener.cb)(&task);
                        Ok(())
                    }));
                }
                // No runtime installed; dispatch inline rather than lose the
                // notification.
                None => (listener.cb)(&task),
            }
        }
    }

    pub(crate) fn install_park(&self, slot: ParkSlot, event: &'static str) {
        self.trace.borrow_mut().record(self.state.get(), event);
        *self.park.borrow_mut() = Some(slot);
    }

    pub(crate) fn has_park(&self) -> bool {
        self.park.borrow().is_some()
    }

    /// Hands a resumption to the parked suspension, consuming the slot.
    /// Returns false if the task was not parked.
    pub(crate) fn deliver(&self, res: Resumption) -> bool {
        match self.park.borrow_mut().take() {
            Some(slot) => {
                slot.deliver(res);
                true
            }
            None => false,
        }
    }

    pub(crate) fn started(&self) -> bool {
        self.started.get()
    }

    /// Polls the entry future, converting an escaping panic into a captured
    /// `Panicked` result.
    pub(crate) fn poll_entry(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.started.set(true);
        let mut entry = self.entry.borrow_mut();
        let fut = entry
            .as_mut()
            .expect("poll_entry on a task with no entry future");
        match catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(res)) => {
                *entry = None;
                Poll::Ready(res)
            }
            Err(payload) => {
                *entry = None;
                Poll::Ready(Err(RuntimeError::Panicked(panic_message(&payload))))
            }
        }
    }

    /// Marks the task dead with `res`; defers run exactly once, in
    /// registration order, on the same tick.
    pub(crate) fn finish(self: &Rc<Self>, res: Result<()>) {
        *self.result.borrow_mut() = Some(res);
        *self.entry.borrow_mut() = None;
        self.park.borrow_mut().take();
        self.transition(TaskState::Dead, "dead");
        self.run_defers();
    }

    fn run_defers(self: &Rc<Self>) {
        if self.defers_done.replace(true) {
            return;
        }
        let defers = std::mem::take(&mut *self.defers.borrow_mut());
        for cb in defers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(cb)) {
                context::report_line(&format!(
                    "defer panicked in task #{}: {}",
                    self.id,
                    panic_message(&payload)
                ));
            }
        }
    }

    /// Rebinds a dead task to a fresh entry, clearing listeners, defers,
    /// result and trace. Valid only in `Dead`.
    pub fn recycle(self: &Rc<Self>, entry: TaskFuture) -> Result<()> {
        if self.state.get() != TaskState::Dead {
            return Err(RuntimeError::InvalidState {
                op: "recycle",
                expected: TaskState::Dead,
                actual: self.state.get(),
            });
        }
        self.listeners.borrow_mut().clear();
        self.defers.borrow_mut().clear();
        self.defers_done.set(false);
        *self.result.borrow_mut() = None;
        self.park.borrow_mut().take();
        self.started.set(false);
        self.trace.borrow_mut().clear();
        *self.entry.borrow_mut() = Some(entry);
        self.state.set(TaskState::Created);
        self.trace.borrow_mut().record(TaskState::Created, "recycle");
        Ok(())
    }

    /// Renders the task's trace ring for diagnostics.
    pub fn dump_trace(&self, debug: bool) -> String {
        self.trace.borrow().dump(debug)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("main", &self.main)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

fn max_traces() -> usize {
    context::try_with(|ctx| ctx.config.max_traces).unwrap_or(DEFAULT_MAX_TRACES)
}

pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The currently running task, or `None` outside a runtime.
pub fn current() -> Option<TaskRef> {
    context::current_task()
}

/// Registers a callback on the current task that runs exactly once when the
/// task terminates, in registration order.
///
/// # Panics
///
/// Panics when called outside a running task.
pub fn defer(cb: impl FnOnce() + 'static) {
    let task = current().expect("defer() requires a running weft task");
    task.add_defer(Box::new(cb));
}

/// Suspends the current task until `task` terminates, then returns its
/// result. Returns immediately if it is already dead.
pub async fn join(task: &TaskRef) -> Result<()> {
    if task.state() == TaskState::Dead {
        return task.result().unwrap_or(Ok(()));
    }
    let me = current().expect("join() requires a running weft task");
    task.on_state(TaskState::Dead, Priority::Low, move |_| {
        context::scheduler().wake(&me, Ok(()));
    });
    park_with_event("task.join").await?;
    task.result().unwrap_or(Ok(()))
}
