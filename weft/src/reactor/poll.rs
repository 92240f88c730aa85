use crate::context;
use crate::errors::{Result, RuntimeError};
use crate::reactor::signals::{self, SignalPipe};
use crate::reactor::{Interest, IoCallback, Reactor, SignalCallback, TimerCallback, WatchId};
use crate::task::panic_message;
use nix::sys::signal::Signal;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::os::fd::RawFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Minimum sleep when only timers are registered, so a near-due timer does
/// not turn the loop into a busy spin.
const SLEEP_FLOOR: Duration = Duration::from_micros(700);

struct FdWatcher {
    fd: RawFd,
    interest: Interest,
    cb: RefCell<IoCallback>,
}

struct TimerWatcher {
    period: Duration,
    cb: RefCell<TimerCallback>,
}

struct SignalWatcher {
    signal: Signal,
    cb: Rc<RefCell<SignalCallback>>,
}

#[derive(Default)]
struct Timers {
    /// Min-heap of (trigger, id sequence); stale entries are pruned lazily
    /// against `table`.
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    table: HashMap<WatchId, Rc<TimerWatcher>>,
}

#[derive(Default)]
struct Signals {
    by_id: HashMap<WatchId, Rc<SignalWatcher>>,
    /// Dispatch order per signal is insertion order.
    by_signo: HashMap<i32, Vec<WatchId>>,
}

/// Portable readiness reactor over `poll(2)`.
///
/// Signals arrive through a self-pipe registered alongside user fds, so one
/// `poll` call covers I/O, signals and the timer budget at once.
pub struct PollReactor {
    seq: Cell<u64>,
    stopped: Cell<bool>,

    fd_watchers: RefCell<HashMap<WatchId, Rc<FdWatcher>>>,
    readers: RefCell<HashMap<RawFd, Vec<WatchId>>>,
    writers: RefCell<HashMap<RawFd, Vec<WatchId>>>,

    timers: RefCell<Timers>,
    signals: RefCell<Signals>,
    pipe: RefCell<Option<SignalPipe>>,
}

impl PollReactor {
    pub fn new() -> Self {
        PollReactor {
            seq: Cell::new(1),
            stopped: Cell::new(false),
            fd_watchers: RefCell::new(HashMap::new()),
            readers: RefCell::new(HashMap::new()),
            writers: RefCell::new(HashMap::new()),
            timers: RefCell::new(Timers::default()),
            signals: RefCell::new(Signals::default()),
            pipe: RefCell::new(None),
        }
    }

    fn next_id(&self) -> WatchId {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        WatchId::from_seq(seq)
    }

    fn check_stopped(&self) -> Result<()> {
        if self.stopped.get() {
            return Err(RuntimeError::Reactor(
                "registration on a stopped reactor".into(),
            ));
        }
        Ok(())
    }

    fn watch_fd(&self, fd: RawFd, interest: Interest, cb: IoCallback) -> Result<WatchId> {
        self.check_stopped()?;
        let id = self.next_id();
        self.fd_watchers.borrow_mut().insert(
            id,
            Rc::new(FdWatcher {
                fd,
                interest,
                cb: RefCell::new(cb),
            }),
        );
        let mut table = if interest.contains(Interest::READ) {
            self.readers.borrow_mut()
        } else {
            self.writers.borrow_mut()
        };
        table.entry(fd).or_default().push(id);
        Ok(id)
    }

    /// Earliest live timer trigger, pruning cancelled heap entries.
    fn next_deadline(&self) -> Option<Instant> {
        let mut timers = self.timers.borrow_mut();
        loop {
            let Reverse((at, seq)) = *timers.heap.peek()?;
            if timers.table.contains_key(&WatchId::from_seq(seq)) {
                return Some(at);
            }
            timers.heap.pop();
        }
    }

    fn dispatch_io(&self, id: WatchId) {
        let watcher = self.fd_watchers.borrow().get(&id).cloned();
        // A callback earlier in this batch may have unwatched this id; a
        // dispatch for a cancelled id is a no-op.
        let Some(watcher) = watcher else { return };
        let result = catch_unwind(AssertUnwindSafe(|| {
            (&mut *watcher.cb.borrow_mut())(id, watcher.fd);
        }));
        if let Err(payload) = result {
            context::report_line(&format!(
                "[weft] reactor callback for watcher {id} panicked: {}",
                panic_message(&payload)
            ));
        }
    }

    fn dispatch_signal(&self, signo: i32) {
        let ids: Vec<WatchId> = self
            .signals
            .borrow()
            .by_signo
            .get(&signo)
            .cloned()
            .unwrap_or_default();
        for id in ids {
            let watcher = self.signals.borrow().by_id.get(&id).cloned();
            let Some(watcher) = watcher else { continue };
            let cb = watcher.cb.clone();
            // Each delivery runs in its own task so one slow handler cannot
            // delay draining the rest.
            match context::try_scheduler() {
                Some(sched) => {
                    sched.spawn(Box::pin(async move {
                        (&mut *cb.borrow_mut())(id, signo);
                        Ok(())
                    }));
                }
                None => (&mut *cb.borrow_mut())(id, signo),
            }
        }
    }

    fn dispatch_due_timers(&self) {
        let now = Instant::now();
        loop {
            let entry = {
                let mut timers = self.timers.borrow_mut();
                match timers.heap.peek() {
                    Some(&Reverse((at, seq))) if at <= now => {
                        timers.heap.pop();
                        let id = WatchId::from_seq(seq);
                        match timers.table.get(&id) {
                            Some(watcher) => {
                                let watcher = watcher.clone();
                                if watcher.period.is_zero() {
                                    timers.table.remove(&id);
                                } else {
                                    // Re-arm from the previous trigger time,
                                    // not `now`, to minimize drift.
                                    timers.heap.push(Reverse((at + watcher.period, seq)));
                                }
                                Some((id, watcher))
                            }
                            // Cancelled while queued.
                            None => None,
                        }
                    }
                    _ => break,
                }
            };
            let Some((id, watcher)) = entry else { continue };
            let result = catch_unwind(AssertUnwindSafe(|| {
                (&mut *watcher.cb.borrow_mut())(id);
            }));
            if let Err(payload) = result {
                context::report_line(&format!(
                    "[weft] timer callback for watcher {id} panicked: {}",
                    panic_message(&payload)
                ));
            }
        }
    }

    fn clear_all(&self) {
        self.fd_watchers.borrow_mut().clear();
        self.readers.borrow_mut().clear();
        self.writers.borrow_mut().clear();
        {
            let mut timers = self.timers.borrow_mut();
            timers.heap.clear();
            timers.table.clear();
        }
        {
            let mut sigs = self.signals.borrow_mut();
            for signo in sigs.by_signo.keys() {
                if let Ok(signal) = Signal::try_from(*signo) {
                    signals::restore_default(signal);
                }
            }
            sigs.by_id.clear();
            sigs.by_signo.clear();
        }
        self.pipe.borrow_mut().take();
    }
}

impl Default for PollReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor for PollReactor {
    fn watch_read(&self, fd: RawFd, cb: IoCallback) -> Result<WatchId> {
        self.watch_fd(fd, Interest::READ, cb)
    }

    fn watch_write(&self, fd: RawFd, cb: IoCallback) -> Result<WatchId> {
        self.watch_fd(fd, Interest::WRITE, cb)
    }

    fn watch_signal(&self, signal: Signal, cb: SignalCallback) -> Result<WatchId> {
        self.check_stopped()?;
        if self.pipe.borrow().is_none() {
            *self.pipe.borrow_mut() = Some(SignalPipe::new()?);
        }

        let id = self.next_id();
        let signo = signal as i32;
        let mut sigs = self.signals.borrow_mut();
        let first_for_signo = !sigs.by_signo.contains_key(&signo);
        sigs.by_id.insert(
            id,
            Rc::new(SignalWatcher {
                signal,
                cb: Rc::new(RefCell::new(cb)),
            }),
        );
        sigs.by_signo.entry(signo).or_default().push(id);
        drop(sigs);

        if first_for_signo {
            signals::install_handler(signal)?;
        }
        Ok(id)
    }

    fn timer(&self, after: Duration, period: Duration, cb: TimerCallback) -> Result<WatchId> {
        self.check_stopped()?;
        let id = self.next_id();
        let mut timers = self.timers.borrow_mut();
        timers.table.insert(
            id,
            Rc::new(TimerWatcher {
                period,
                cb: RefCell::new(cb),
            }),
        );
        timers.heap.push(Reverse((Instant::now() + after, id.seq())));
        Ok(id)
    }

    fn unwatch(&self, id: WatchId) {
        if let Some(watcher) = self.fd_watchers.borrow_mut().remove(&id) {
            let mut table = if watcher.interest.contains(Interest::READ) {
                self.readers.borrow_mut()
            } else {
                self.writers.borrow_mut()
            };
            if let Some(ids) = table.get_mut(&watcher.fd) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    table.remove(&watcher.fd);
                }
            }
            return;
        }

        if self.timers.borrow_mut().table.remove(&id).is_some() {
            // The heap entry goes stale and is pruned on the next pass.
            return;
        }

        let mut sigs = self.signals.borrow_mut();
        if let Some(watcher) = sigs.by_id.remove(&id) {
            let signo = watcher.signal as i32;
            if let Some(ids) = sigs.by_signo.get_mut(&signo) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    sigs.by_signo.remove(&signo);
                    signals::restore_default(watcher.signal);
                }
            }
        }
    }

    fn tick(&self) -> Result<()> {
        if self.stopped.get() {
            return Ok(());
        }

        let budget = self
            .next_deadline()
            .map(|at| at.saturating_duration_since(Instant::now()));

        // Assemble the poll set: user fds plus the signal pipe.
        let mut fds: Vec<libc::pollfd> = Vec::new();
        {
            let mut events: HashMap<RawFd, libc::c_short> = HashMap::new();
            for fd in self.readers.borrow().keys() {
                *events.entry(*fd).or_insert(0) |= libc::POLLIN;
            }
            for fd in self.writers.borrow().keys() {
                *events.entry(*fd).or_insert(0) |= libc::POLLOUT;
            }
            if !self.signals.borrow().by_id.is_empty() {
                if let Some(pipe) = self.pipe.borrow().as_ref() {
                    *events.entry(pipe.read_fd()).or_insert(0) |= libc::POLLIN;
                }
            }
            fds.extend(events.into_iter().map(|(fd, ev)| libc::pollfd {
                fd,
                events: ev,
                revents: 0,
            }));
        }

        if fds.is_empty() {
            // Timers only: sleep out the budget, bounded below so a stream
            // of short timers cannot spin the loop.
            match budget {
                Some(budget) if budget.is_zero() => {}
                Some(budget) => std::thread::sleep(budget.max(SLEEP_FLOOR)),
                None => return Ok(()),
            }
        } else {
            let timeout_ms: libc::c_int = match budget {
                None => -1,
                Some(budget) => {
                    let ms = budget.as_millis();
                    if budget.is_zero() {
                        0
                    } else {
                        // Round up so we never wake just before the deadline.
                        ms.saturating_add(1).min(libc::c_int::MAX as u128) as libc::c_int
                    }
                }
            };
            trace!(nfds = fds.len(), timeout_ms, "poll");
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                // A signal interrupting the wait is normal; its delivery is
                // picked up through the pipe below.
                if err.raw_os_error() != Some(libc::EINTR) {
                    return Err(RuntimeError::Reactor(format!("poll failed: {err}")));
                }
            }
        }

        // Readers first, then writers, then signals, then due timers.
        let pipe_fd = self.pipe.borrow().as_ref().map(|p| p.read_fd());

        for pollfd in &fds {
            if pollfd.revents & libc::POLLNVAL != 0 {
                context::report_line(&format!(
                    "[weft] reactor: fd {} is invalid, dropping its watchers",
                    pollfd.fd
                ));
                let stale: Vec<WatchId> = self
                    .fd_watchers
                    .borrow()
                    .iter()
                    .filter(|(_, w)| w.fd == pollfd.fd)
                    .map(|(id, _)| *id)
                    .collect();
                for id in stale {
                    self.unwatch(id);
                }
            }
        }

        let read_ready = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
        for pollfd in &fds {
            if pollfd.revents & read_ready == 0 || Some(pollfd.fd) == pipe_fd {
                continue;
            }
            let ids: SmallVec<[WatchId; 2]> = self
                .readers
                .borrow()
                .get(&pollfd.fd)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default();
            for id in ids {
                self.dispatch_io(id);
            }
        }

        let write_ready = libc::POLLOUT | libc::POLLHUP | libc::POLLERR;
        for pollfd in &fds {
            if pollfd.revents & write_ready == 0 {
                continue;
            }
            let ids: SmallVec<[WatchId; 2]> = self
                .writers
                .borrow()
                .get(&pollfd.fd)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default();
            for id in ids {
                self.dispatch_io(id);
            }
        }

        let pending_signals = match (pipe_fd, &fds) {
            (Some(pipe_fd), fds)
                if fds
                    .iter()
                    .any(|p| p.fd == pipe_fd && p.revents & read_ready != 0) =>
            {
                self.pipe
                    .borrow()
                    .as_ref()
                    .map(|p| p.drain())
                    .unwrap_or_default()
            }
            _ => SmallVec::new(),
        };
        for signo in pending_signals {
            self.dispatch_signal(signo);
        }

        self.dispatch_due_timers();
        Ok(())
    }

    fn is_active(&self) -> bool {
        !self.fd_watchers.borrow().is_empty()
            || !self.timers.borrow().table.is_empty()
            || !self.signals.borrow().by_id.is_empty()
    }

    fn on_fork(&self) {
        self.clear_all();
        self.seq.set(1);
        self.stopped.set(false);
    }

    fn stop(&self) {
        self.clear_all();
        self.stopped.set(true);
    }
}
