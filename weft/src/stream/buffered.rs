use crate::context;
use crate::errors::{Result, RuntimeError};
use crate::reactor::WatchId;
use crate::stream::endpoint::{Endpoint, Shutdown};
use crate::stream::ring::RingBuf;
use crate::task::{TaskRef, park_with_event};
use crate::utils::ScopeGuard;
use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

/// Cooperative handshake driver (TLS or any other in-band negotiation).
///
/// `advance` pushes the handshake as far as it can without blocking:
/// `Ok(true)` when complete, `Ok(false)` when it needs more input, in which
/// case the stream parks on read readiness and retries.
pub trait Handshake<E: Endpoint> {
    fn advance(&mut self, endpoint: &mut E) -> Result<bool>;
}

struct Inner<E: Endpoint> {
    endpoint: RefCell<Option<E>>,

    /// Outbound bytes the endpoint was not ready for yet.
    out: RefCell<RingBuf>,

    buffer_max: usize,
    chunk: usize,

    closed: Cell<bool>,
    rd_shut: Cell<bool>,
    wr_shut: Cell<bool>,

    /// Task parked in `flush`, if any. One flusher at a time.
    flusher: RefCell<Option<TaskRef>>,
    /// Task parked in `wait_readable`, if any.
    reader: RefCell<Option<TaskRef>>,

    write_watch: Cell<Option<WatchId>>,
    read_watch: Cell<Option<WatchId>>,
}

/// Buffered stream over a non-blocking [`Endpoint`].
///
/// Writes go straight to the endpoint while it keeps up; the overflow lands
/// in a ring buffer drained chunk-by-chunk on write readiness. Reads are
/// non-blocking; a task that wants to block parks via
/// [`wait_readable`](Stream::wait_readable).
pub struct Stream<E: Endpoint + 'static> {
    inner: Rc<Inner<E>>,
}

impl<E: Endpoint + 'static> Clone for Stream<E> {
    fn clone(&self) -> Self {
        Stream {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Endpoint + 'static> Stream<E> {
    /// Wraps `endpoint` with the runtime's configured buffer knobs.
    pub fn new(endpoint: E) -> Result<Self> {
        let (size, max, chunk) = context::with(|ctx| {
            (
                ctx.config.write_buffer_size,
                ctx.config.write_buffer_max,
                ctx.config.write_chunk_size,
            )
        });
        Self::with_limits(endpoint, size, max, chunk)
    }

    /// Wraps `endpoint` with explicit knobs: initial ring size, the soft cap
    /// on buffered outbound bytes, and the largest single endpoint write.
    pub fn with_limits(
        endpoint: E,
        write_buffer_size: usize,
        write_buffer_max: usize,
        write_chunk_size: usize,
    ) -> Result<Self> {
        if write_chunk_size == 0 {
            return Err(RuntimeError::Argument(
                "write_chunk_size must be greater than 0".into(),
            ));
        }
        Ok(Stream {
            inner: Rc::new(Inner {
                endpoint: RefCell::new(Some(endpoint)),
                out: RefCell::new(RingBuf::new(write_buffer_size)?),
                buffer_max: write_buffer_max,
                chunk: write_chunk_size,
                closed: Cell::new(false),
                rd_shut: Cell::new(false),
                wr_shut: Cell::new(false),
                flusher: RefCell::new(None),
                reader: RefCell::new(None),
                write_watch: Cell::new(None),
                read_watch: Cell::new(None),
            }),
        })
    }

    fn fd(&self) -> Result<RawFd> {
        self.inner
            .endpoint
            .borrow()
            .as_ref()
            .map(|e| e.as_raw_fd())
            .ok_or_else(|| RuntimeError::connection("stream closed"))
    }

    fn check_writable(&self) -> Result<()> {
        if self.inner.closed.get() {
            return Err(RuntimeError::connection("stream closed"));
        }
        if self.inner.wr_shut.get() {
            return Err(RuntimeError::connection("write side shut down"));
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<()> {
        if self.inner.closed.get() {
            return Err(RuntimeError::connection("stream closed"));
        }
        if self.inner.rd_shut.get() {
            return Err(RuntimeError::connection("read side shut down"));
        }
        Ok(())
    }

    /// Outbound bytes still waiting on endpoint readiness.
    pub fn pending_out(&self) -> usize {
        self.inner.out.borrow().len()
    }

    /// Writes all of `data`, parking under back-pressure until the endpoint
    /// took everything. With `timeout` set, a write that cannot drain in
    /// time fails with a timeout error. Returns the byte count written.
    pub async fn write_all(&self, data: &[u8], timeout: Option<Duration>) -> Result<usize> {
        self.check_writable()?;

        let mut offset = 0;
        // Direct non-blocking writes first, but only while nothing is
        // queued: buffered bytes must reach the wire before new ones.
        if self.inner.out.borrow().is_empty() {
            while offset < data.len() {
                let end = (offset + self.inner.chunk).min(data.len());
                let res = self.endpoint_write(&data[offset..end]);
                match res {
                    Ok(0) => return Err(RuntimeError::connection("endpoint closed")),
                    Ok(n) => offset += n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(RuntimeError::connection_io("write failed", e)),
                }
            }
            if offset == data.len() {
                return Ok(data.len());
            }
        }

        self.buffer_remainder(&data[offset..])?;
        self.flush(timeout).await?;
        Ok(data.len())
    }

    /// Queues `data` without suspending or registering a watcher. Pair with
    /// [`flush_once`](Stream::flush_once) to drain opportunistically.
    pub fn write_async(&self, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.buffer_remainder(data)
    }

    fn buffer_remainder(&self, data: &[u8]) -> Result<()> {
        let mut out = self.inner.out.borrow_mut();
        if out.len() + data.len() > self.inner.buffer_max {
            return Err(RuntimeError::connection(format!(
                "write buffer overflow: {} pending + {} new exceeds {} cap",
                out.len(),
                data.len(),
                self.inner.buffer_max
            )));
        }
        out.write(data)
    }

    /// Drains whatever the endpoint will take right now, one chunk at a
    /// time. Never waits; stops on short write or back-pressure.
    pub fn flush_once(&self) -> Result<()> {
        loop {
            let chunk = {
                let out = self.inner.out.borrow();
                if out.is_empty() {
                    return Ok(());
                }
                out.peek(self.inner.chunk)
            };
            match self.endpoint_write(&chunk) {
                Ok(0) => return Err(RuntimeError::connection("endpoint closed during flush")),
                Ok(n) => {
                    self.inner.out.borrow_mut().consume(n);
                    if n < chunk.len() {
                        return Ok(());
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RuntimeError::connection_io("write failed", e)),
            }
        }
    }

    fn endpoint_write(&self, data: &[u8]) -> io::Result<usize> {
        let mut endpoint = self.inner.endpoint.borrow_mut();
        match endpoint.as_mut() {
            Some(endpoint) => endpoint.write(data),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed")),
        }
    }

    /// Parks until the outbound ring is drained. A write-ready watcher moves
    /// the bytes; with `timeout` set, a timer throws a timeout error into
    /// the parked flusher. Watcher and timer are released on every exit
    /// path.
    pub async fn flush(&self, timeout: Option<Duration>) -> Result<()> {
        if self.inner.out.borrow().is_empty() {
            return Ok(());
        }
        self.check_writable()?;
        if self.inner.flusher.borrow().is_some() {
            return Err(RuntimeError::SyncMisuse(
                "another task is already flushing this stream".into(),
            ));
        }

        let me = context::current_task().expect("stream flush requires a running weft task");
        let reactor = context::reactor();
        let fd = self.fd()?;

        let watcher_stream = self.clone();
        let watcher_task = me.clone();
        let watch = reactor.watch_write(
            fd,
            Box::new(move |_, _| match watcher_stream.flush_once() {
                Ok(()) => {
                    if watcher_stream.inner.out.borrow().is_empty() {
                        context::scheduler().wake(&watcher_task, Ok(()));
                    }
                }
                Err(err) => {
                    context::scheduler().wake(&watcher_task, Err(err));
                }
            }),
        )?;
        self.inner.write_watch.set(Some(watch));
        *self.inner.flusher.borrow_mut() = Some(me.clone());

        let timer = match timeout {
            Some(d) if !d.is_zero() => {
                let task = me.clone();
                Some(reactor.timer(
                    d,
                    Duration::ZERO,
                    Box::new(move |_| {
                        context::scheduler()
                            .wake(&task, Err(RuntimeError::Timeout("write timeout".into())));
                    }),
                )?)
            }
            _ => None,
        };

        let inner = self.inner.clone();
        let cleanup = reactor.clone();
        let _guard = ScopeGuard::new(move || {
            if let Some(id) = inner.write_watch.take() {
                cleanup.unwatch(id);
            }
            if let Some(id) = timer {
                cleanup.unwatch(id);
            }
            inner.flusher.borrow_mut().take();
        });

        park_with_event("stream.flush").await
    }

    /// Non-blocking read of up to `n` bytes. Empty result means no data was
    /// ready; end-of-stream and I/O failures are connection errors.
    pub fn read(&self, n: usize) -> Result<Bytes> {
        self.check_readable()?;
        if n == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = vec![0u8; n];
        let mut endpoint = self.inner.endpoint.borrow_mut();
        let endpoint = endpoint
            .as_mut()
            .ok_or_else(|| RuntimeError::connection("stream closed"))?;
        match endpoint.read(&mut buf) {
            Ok(0) => Err(RuntimeError::connection("endpoint closed")),
            Ok(m) => {
                buf.truncate(m);
                Ok(Bytes::from(buf))
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(Bytes::new())
            }
            Err(e) => Err(RuntimeError::connection_io("read failed", e)),
        }
    }

    /// Parks the current task until the endpoint is readable.
    pub async fn wait_readable(&self) -> Result<()> {
        self.check_readable()?;
        let me = context::current_task().expect("stream wait requires a running weft task");
        let reactor = context::reactor();
        let fd = self.fd()?;

        let task = me.clone();
        let watch = reactor.watch_read(
            fd,
            Box::new(move |_, _| {
                context::scheduler().wake(&task, Ok(()));
            }),
        )?;
        self.inner.read_watch.set(Some(watch));
        *self.inner.reader.borrow_mut() = Some(me);

        let inner = self.inner.clone();
        let cleanup = reactor.clone();
        let _guard = ScopeGuard::new(move || {
            if let Some(id) = inner.read_watch.take() {
                cleanup.unwatch(id);
            }
            inner.reader.borrow_mut().take();
        });

        park_with_event("stream.wait_readable").await
    }

    /// Half-closes one or both directions. The write side flushes
    /// best-effort first; a parked flusher or reader on a shut direction is
    /// failed out. Idempotent per direction.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        if self.inner.closed.get() {
            return Err(RuntimeError::connection("stream closed"));
        }
        if how.contains(Shutdown::WRITE) && !self.inner.wr_shut.replace(true) {
            let _ = self.flush_once();
            if let Some(id) = self.inner.write_watch.take() {
                context::reactor().unwatch(id);
            }
            if let Some(task) = self.inner.flusher.borrow_mut().take() {
                context::scheduler()
                    .wake(&task, Err(RuntimeError::connection("write side shut down")));
            }
            self.endpoint_shutdown(Shutdown::WRITE)?;
        }
        if how.contains(Shutdown::READ) && !self.inner.rd_shut.replace(true) {
            if let Some(id) = self.inner.read_watch.take() {
                context::reactor().unwatch(id);
            }
            if let Some(task) = self.inner.reader.borrow_mut().take() {
                context::scheduler()
                    .wake(&task, Err(RuntimeError::connection("read side shut down")));
            }
            self.endpoint_shutdown(Shutdown::READ)?;
        }
        Ok(())
    }

    fn endpoint_shutdown(&self, how: Shutdown) -> Result<()> {
        let mut endpoint = self.inner.endpoint.borrow_mut();
        if let Some(endpoint) = endpoint.as_mut() {
            endpoint
                .shutdown(how)
                .map_err(|e| RuntimeError::connection_io("shutdown failed", e))?;
        }
        Ok(())
    }

    /// Drives `handshake` to completion, parking on read readiness between
    /// attempts. With `timeout` set, the whole negotiation is bounded.
    pub async fn enable_ssl<H: Handshake<E>>(
        &self,
        mut handshake: H,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.check_readable()?;
        let me = context::current_task().expect("handshake requires a running weft task");
        let reactor = context::reactor();

        let timer = match timeout {
            Some(d) if !d.is_zero() => {
                let task = me.clone();
                Some(reactor.timer(
                    d,
                    Duration::ZERO,
                    Box::new(move |_| {
                        context::scheduler()
                            .wake(&task, Err(RuntimeError::Timeout("handshake timeout".into())));
                    }),
                )?)
            }
            _ => None,
        };
        let cleanup = reactor.clone();
        let _guard = ScopeGuard::new(move || {
            if let Some(id) = timer {
                cleanup.unwatch(id);
            }
        });

        loop {
            let done = {
                let mut endpoint = self.inner.endpoint.borrow_mut();
                let endpoint = endpoint
                    .as_mut()
                    .ok_or_else(|| RuntimeError::connection("stream closed"))?;
                handshake.advance(endpoint)?
            };
            if done {
                return Ok(());
            }
            self.wait_readable().await?;
        }
    }

    /// Releases watchers, fails out parked waiters and drops the endpoint.
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        if let Some(reactor) = context::try_with(|ctx| ctx.reactor.clone()) {
            if let Some(id) = self.inner.write_watch.take() {
                reactor.unwatch(id);
            }
            if let Some(id) = self.inner.read_watch.take() {
                reactor.unwatch(id);
            }
        }
        if let Some(sched) = context::try_scheduler() {
            if let Some(task) = self.inner.flusher.borrow_mut().take() {
                sched.wake(&task, Err(RuntimeError::connection("stream closed")));
            }
            if let Some(task) = self.inner.reader.borrow_mut().take() {
                sched.wake(&task, Err(RuntimeError::connection("stream closed")));
            }
        }
        self.inner.endpoint.borrow_mut().take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }
}

impl<E: Endpoint> Drop for Inner<E> {
    fn drop(&mut self) {
        if let Some(reactor) = context::try_with(|ctx| ctx.reactor.clone()) {
            if let Some(id) = self.write_watch.take() {
                reactor.unwatch(id);
            }
            if let Some(id) = self.read_watch.take() {
                reactor.unwatch(id);
            }
        }
    }
}

impl<E: Endpoint + 'static> std::fmt::Debug for Stream<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("pending_out", &self.inner.out.borrow().len())
            .field("closed", &self.inner.closed.get())
            .field("rd_shut", &self.inner.rd_shut.get())
            .field("wr_shut", &self.inner.wr_shut.get())
            .finish()
    }
}
