//! Reactor interface and back-end selection.
//!
//! A reactor owns every external wake-up source: fd readiness, Unix signals
//! and timers. Registrations return an opaque monotonic [`WatchId`] used to
//! cancel; `unwatch` is idempotent and a dispatch for a cancelled id is a
//! no-op. The portable `poll(2)` driver is always available; alternative
//! back-ends over platform event libraries implement the same trait and are
//! chosen by name at runtime init.

use crate::errors::Result;
use anyhow::anyhow;
use bitflags::bitflags;
use nix::sys::signal::Signal;
use std::fmt;
use std::num::NonZeroU64;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

mod poll;
pub use poll::PollReactor;

pub(crate) mod signals;

/// Opaque, monotonically increasing watcher id. Never reused within a
/// reactor generation (ids restart after `on_fork`).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct WatchId(NonZeroU64);

impl WatchId {
    pub(crate) fn from_seq(seq: u64) -> Self {
        WatchId(NonZeroU64::new(seq).expect("watch id sequence must start at 1"))
    }

    pub(crate) fn seq(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

bitflags! {
    /// Readiness directions a watcher subscribes to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Interest: u8 {
        const READ = 1;
        const WRITE = 1 << 1;
    }
}

pub type IoCallback = Box<dyn FnMut(WatchId, RawFd)>;
pub type SignalCallback = Box<dyn FnMut(WatchId, i32)>;
pub type TimerCallback = Box<dyn FnMut(WatchId)>;

pub trait Reactor {
    /// Invokes `cb` with `(id, fd)` whenever `fd` is readable. Multiple
    /// watchers per fd and direction dispatch in insertion order.
    fn watch_read(&self, fd: RawFd, cb: IoCallback) -> Result<WatchId>;

    /// Writable-side counterpart of [`watch_read`](Reactor::watch_read).
    fn watch_write(&self, fd: RawFd, cb: IoCallback) -> Result<WatchId>;

    /// Invokes `cb` once per delivered signal, each invocation inside its
    /// own task so a slow handler cannot delay signal draining.
    fn watch_signal(&self, signal: Signal, cb: SignalCallback) -> Result<WatchId>;

    /// Fires once after `after`. With a non-zero `period` the timer re-arms
    /// from the previous trigger time, minimizing drift.
    fn timer(&self, after: Duration, period: Duration, cb: TimerCallback) -> Result<WatchId>;

    /// Cancels a registration. Idempotent; unknown ids are ignored.
    fn unwatch(&self, id: WatchId);

    /// One quantum: a readiness wait bounded by the next timer, then
    /// dispatch of ready readers, writers, pending signals and due timers.
    fn tick(&self) -> Result<()>;

    /// True iff any watcher, signal handler or timer is registered.
    fn is_active(&self) -> bool;

    /// Child-side cleanup after `fork`: drops every registration, resets the
    /// id sequence and unmarks `stop`.
    fn on_fork(&self);

    /// Drops everything; further `tick`s become no-ops.
    fn stop(&self);
}

/// Instantiates the reactor back-end selected by `name`.
pub(crate) fn new_reactor(name: &str) -> anyhow::Result<Rc<dyn Reactor>> {
    match name {
        "poll" => Ok(Rc::new(PollReactor::new())),
        other => Err(anyhow!("unknown reactor back-end `{other}`")),
    }
}
