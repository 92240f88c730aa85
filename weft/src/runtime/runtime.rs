use crate::context::{self, RootContext};
use crate::process::Supervisor;
use crate::reactor::{self, Reactor};
use crate::runtime::scheduler::Scheduler;
use anyhow::{Result, anyhow};
use std::cell::Cell;
use std::future::Future;
use std::io::{self, Write};
use std::pin::pin;
use std::rc::Rc;
use std::task::Poll;

/// Per-task debug trace ring capacity.
const MAX_TRACES: usize = 20;

/// Initial outbound ring size for streams.
const WRITE_BUFFER_SIZE: usize = 32 * 1024;

/// Soft cap on buffered outbound bytes; `write_all` past it errors.
const WRITE_BUFFER_MAX: usize = 1024 * 1024;

/// Largest slice handed to a single endpoint write.
const WRITE_CHUNK_SIZE: usize = 60 * 1024;

const DEFAULT_REACTOR: &str = "poll";

pub struct Builder {
    max_traces: usize,

    /// Include runtime/vendor capture sites in diagnostic dumps.
    debug: bool,

    write_buffer_size: usize,
    write_buffer_max: usize,
    write_chunk_size: usize,

    /// Reactor back-end selector; `"poll"` is the portable driver.
    reactor: String,

    error_sink: Option<Box<dyn Write>>,
}

impl Builder {
    /// Returns a builder with defaults, honoring the `WEFT_MAX_TRACES` and
    /// `WEFT_DEBUG` environment overrides.
    pub fn new() -> Builder {
        let max_traces = std::env::var("WEFT_MAX_TRACES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(MAX_TRACES);
        let debug = std::env::var("WEFT_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Builder {
            max_traces,
            debug,
            write_buffer_size: WRITE_BUFFER_SIZE,
            write_buffer_max: WRITE_BUFFER_MAX,
            write_chunk_size: WRITE_CHUNK_SIZE,
            reactor: DEFAULT_REACTOR.to_string(),
            error_sink: None,
        }
    }

    pub fn max_traces(mut self, val: usize) -> Self {
        self.max_traces = val;
        self
    }

    pub fn debug(mut self, val: bool) -> Self {
        self.debug = val;
        self
    }

    pub fn write_buffer_size(mut self, val: usize) -> Self {
        self.write_buffer_size = val;
        self
    }

    pub fn write_buffer_max(mut self, val: usize) -> Self {
        self.write_buffer_max = val;
        self
    }

    pub fn write_chunk_size(mut self, val: usize) -> Self {
        self.write_chunk_size = val;
        self
    }

    /// Selects the reactor back-end by name.
    pub fn reactor(mut self, name: impl Into<String>) -> Self {
        self.reactor = name.into();
        self
    }

    /// Redirects unresolved-error reports away from standard output.
    pub fn error_sink(mut self, sink: Box<dyn Write>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Creates the configured `Runtime` and installs it on this thread.
    pub fn try_build(self) -> Result<Runtime> {
        IS_RUNTIME_ACTIVE.with(|is_active| -> Result<()> {
            if is_active.get() {
                Err(anyhow!(
                    "cannot create a new Runtime: one is already active on this thread"
                ))
            } else {
                is_active.set(true);
                Ok(())
            }
        })?;

        let result = self.try_install();
        if result.is_err() {
            IS_RUNTIME_ACTIVE.with(|is_active| is_active.set(false));
        }
        result
    }

    fn try_install(self) -> Result<Runtime> {
        let cfg: RuntimeConfig = (&self).try_into()?;

        let reactor: Rc<dyn Reactor> = reactor::new_reactor(&cfg.reactor)?;
        let scheduler = Rc::new(Scheduler::new(cfg.debug));
        let supervisor = Rc::new(Supervisor::new());
        let sink: Box<dyn Write> = match self.error_sink {
            Some(sink) => sink,
            None => Box::new(io::stdout()),
        };

        context::install(RootContext {
            scheduler,
            reactor,
            supervisor,
            config: cfg,
            sink: Rc::new(std::cell::RefCell::new(sink)),
        });

        Ok(Runtime {
            block_on_used: Cell::new(false),
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("max_traces", &self.max_traces)
            .field("debug", &self.debug)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("write_buffer_max", &self.write_buffer_max)
            .field("write_chunk_size", &self.write_chunk_size)
            .field("reactor", &self.reactor)
            .field("error_sink", &self.error_sink.as_ref().map(|_| "<writer>"))
            .finish()
    }
}

// One live runtime per thread; the context install/uninstall pair depends on
// it.
thread_local! {
    static IS_RUNTIME_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// A built, installed runtime. Dropping it uninstalls the thread context.
#[derive(Debug)]
pub struct Runtime {
    block_on_used: Cell<bool>,
}

impl Runtime {
    /// Runs `future` as the main task, driving scheduler ticks until it
    /// completes and no runnable, deferred or reactor work remains.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        assert!(
            !self.block_on_used.replace(true),
            "Runtime::block_on may only be called once"
        );

        let sched = context::scheduler();
        let reactor = context::reactor();
        let mut future = pin!(future);
        let mut result: Option<F::Output> = None;

        loop {
            if sched.reset_root_woken() && result.is_none() {
                if let Poll::Ready(v) = sched.poll_root(future.as_mut()) {
                    result = Some(v);
                }
            }

            if result.is_some() && !sched.has_work() && !reactor.is_active() {
                sched.finish_root();
                return result.take().expect("root result consumed twice");
            }

            if result.is_none()
                && !sched.root_woken()
                && !sched.has_work()
                && !reactor.is_active()
            {
                panic!(
                    "deadlock: the root task is parked and no runnable work \
                     or reactor registrations remain"
                );
            }

            sched.tick();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        context::uninstall();
        IS_RUNTIME_ACTIVE.with(|is_active| is_active.set(false));
    }
}

/// Validated runtime configuration, exported from the builder and consumed
/// by the context.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) max_traces: usize,
    pub(crate) debug: bool,
    pub(crate) write_buffer_size: usize,
    pub(crate) write_buffer_max: usize,
    pub(crate) write_chunk_size: usize,
    pub(crate) reactor: String,
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.write_chunk_size == 0 {
            return Err(anyhow!("write_chunk_size must be greater than 0"));
        }
        if self.write_buffer_size == 0 {
            return Err(anyhow!("write_buffer_size must be greater than 0"));
        }
        if self.write_buffer_size > self.write_buffer_max {
            return Err(anyhow!(
                "write_buffer_size ({}) exceeds write_buffer_max ({})",
                self.write_buffer_size,
                self.write_buffer_max
            ));
        }
        Ok(())
    }
}

impl TryFrom<&Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: &Builder) -> Result<Self, Self::Error> {
        let cfg = RuntimeConfig {
            max_traces: builder.max_traces,
            debug: builder.debug,
            write_buffer_size: builder.write_buffer_size,
            write_buffer_max: builder.write_buffer_max,
            write_chunk_size: builder.write_chunk_size,
            reactor: builder.reactor.clone(),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Convenience entry point: builds a default runtime and runs `future` on
/// it.
pub fn block_on<F: Future>(future: F) -> F::Output {
    Builder::new()
        .try_build()
        .expect("failed building the Runtime")
        .block_on(future)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_runtimes_on_one_thread_is_an_error() {
        let _rt = Builder::new().try_build().unwrap();
        assert!(Builder::new().try_build().is_err());
    }

    #[test]
    fn test_runtime_frees_thread_on_drop() {
        {
            let _rt = Builder::new().try_build().unwrap();
        }
        let again = Builder::new().try_build();
        assert!(again.is_ok());
    }

    #[test]
    fn test_config_rejects_oversized_write_buffer() {
        let res = Builder::new()
            .write_buffer_size(2 * 1024 * 1024)
            .write_buffer_max(1024)
            .try_build();
        assert!(res.is_err());
    }

    #[test]
    fn test_unknown_reactor_is_rejected() {
        let res = Builder::new().reactor("io_uring").try_build();
        assert!(res.is_err());
    }

    #[test]
    fn test_block_on_returns_root_value() {
        let rt = Builder::new().try_build().unwrap();
        let val = rt.block_on(async { 41 + 1 });
        assert_eq!(val, 42);
    }
}
