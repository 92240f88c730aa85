//! Thread-local root context.
//!
//! The scheduler, reactor and supervisor are process-wide singletons with an
//! explicit install/uninstall lifecycle: `Builder::try_build` installs the
//! context, dropping the `Runtime` removes it, and a forked child rebuilds
//! its own. Accessors clone an `Rc` out of the thread-local and release the
//! borrow immediately so reactor callbacks can re-enter the context freely.

use crate::process::Supervisor;
use crate::reactor::Reactor;
use crate::runtime::RuntimeConfig;
use crate::runtime::scheduler::Scheduler;
use crate::task::TaskRef;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::thread_local;

pub(crate) struct RootContext {
    pub(crate) scheduler: Rc<Scheduler>,
    pub(crate) reactor: Rc<dyn Reactor>,
    pub(crate) supervisor: Rc<Supervisor>,
    pub(crate) config: RuntimeConfig,
    /// Line-oriented sink for unresolved-error reports.
    pub(crate) sink: Rc<RefCell<Box<dyn Write>>>,
}

thread_local! {
    static CONTEXT: RefCell<Option<Rc<RootContext>>> = const { RefCell::new(None) };
}

pub(crate) fn install(ctx: RootContext) {
    CONTEXT.with(|cell| {
        let mut slot = cell.borrow_mut();
        assert!(
            slot.is_none(),
            "a weft runtime context is already installed on this thread"
        );
        *slot = Some(Rc::new(ctx));
    });
}

pub(crate) fn uninstall() {
    CONTEXT.with(|cell| {
        cell.borrow_mut().take();
    });
}

fn get() -> Option<Rc<RootContext>> {
    CONTEXT.with(|cell| cell.borrow().clone())
}

#[track_caller]
pub(crate) fn with<F, R>(f: F) -> R
where
    F: FnOnce(&RootContext) -> R,
{
    let ctx = get().expect("no weft runtime active on this thread");
    f(&ctx)
}

pub(crate) fn try_with<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&RootContext) -> R,
{
    get().map(|ctx| f(&ctx))
}

#[track_caller]
pub(crate) fn scheduler() -> Rc<Scheduler> {
    with(|ctx| ctx.scheduler.clone())
}

pub(crate) fn try_scheduler() -> Option<Rc<Scheduler>> {
    try_with(|ctx| ctx.scheduler.clone())
}

#[track_caller]
pub(crate) fn reactor() -> Rc<dyn Reactor> {
    with(|ctx| ctx.reactor.clone())
}

#[track_caller]
pub(crate) fn supervisor() -> Rc<Supervisor> {
    with(|ctx| ctx.supervisor.clone())
}

pub(crate) fn current_task() -> Option<TaskRef> {
    try_scheduler().and_then(|s| s.current())
}

/// Writes one line to the error sink; falls back to stderr when no runtime
/// is installed (bare unit tests, teardown paths).
pub(crate) fn report_line(line: &str) {
    match try_with(|ctx| ctx.sink.clone()) {
        Some(sink) => {
            let mut sink = sink.borrow_mut();
            let _ = writeln!(sink, "{line}");
            let _ = sink.flush();
        }
        None => eprintln!("{line}"),
    }
}
