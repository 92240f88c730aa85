use crate::errors::{ErrorKind, RuntimeError};
use crate::task::TaskRef;
use std::cell::Cell;
use std::fmt;
use std::panic::Location;
use std::rc::Rc;

/// The scheduler control operation an [`Outcome`] reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Start,
    Resume,
    Throw,
    Terminate,
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlAction::Start => "start",
            ControlAction::Resume => "resume",
            ControlAction::Throw => "throw",
            ControlAction::Terminate => "terminate",
        };
        f.write_str(name)
    }
}

/// Result-with-resolution-ack of a scheduler control operation.
///
/// Not a plain error result: the scheduler keeps a handle on every
/// exceptional outcome and surfaces it on the error sink at the end of the
/// tick unless the caller acknowledged that error category with
/// [`resolve`](Outcome::resolve) first.
#[derive(Clone)]
pub struct Outcome {
    inner: Rc<Inner>,
}

struct Inner {
    action: ControlAction,
    task: TaskRef,
    error: Option<RuntimeError>,
    /// Where the control operation was issued.
    site: &'static Location<'static>,
    resolved: Cell<Option<ErrorKind>>,
}

impl Outcome {
    pub(crate) fn new(
        action: ControlAction,
        task: TaskRef,
        error: Option<RuntimeError>,
        site: &'static Location<'static>,
    ) -> Self {
        Outcome {
            inner: Rc::new(Inner {
                action,
                task,
                error,
                site,
                resolved: Cell::new(None),
            }),
        }
    }

    pub fn action(&self) -> ControlAction {
        self.inner.action
    }

    pub fn task(&self) -> &TaskRef {
        &self.inner.task
    }

    pub fn is_ok(&self) -> bool {
        self.inner.error.is_none()
    }

    pub fn error(&self) -> Option<RuntimeError> {
        self.inner.error.clone()
    }

    /// Acknowledges an expected failure category. An outcome whose error
    /// matches a resolved kind is not reported at end of tick.
    pub fn resolve(&self, kind: ErrorKind) -> &Self {
        self.inner.resolved.set(Some(kind));
        self
    }

    pub(crate) fn needs_report(&self) -> bool {
        match &self.inner.error {
            None => false,
            Some(err) => self.inner.resolved.get() != Some(err.kind()),
        }
    }

    /// Renders the end-of-tick diagnostic: the failing operation with its
    /// capture site, then the task's own trace ring.
    pub(crate) fn render_report(&self, debug: bool) -> String {
        let err = match &self.inner.error {
            Some(err) => err,
            None => return String::new(),
        };
        let mut out = format!(
            "[weft] unresolved error from `{}` at {}:{}: {}\n  task #{} trace (oldest first):\n",
            self.inner.action,
            self.inner.site.file(),
            self.inner.site.line(),
            err,
            self.inner.task.id(),
        );
        out.push_str(&self.inner.task.dump_trace(debug));
        out
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outcome")
            .field("action", &self.inner.action)
            .field("task", &self.inner.task.id())
            .field("error", &self.inner.error)
            .field("resolved", &self.inner.resolved.get())
            .finish()
    }
}
