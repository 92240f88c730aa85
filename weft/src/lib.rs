//! weft — a single-threaded cooperative concurrency runtime.
//!
//! One thread, many tasks: a user-space scheduler drives suspendable tasks,
//! a reactor turns fd readiness, signals and timers into wake-ups, and the
//! synchronization primitives (channels, mutex, wait group) let tasks
//! coordinate without locks or atomics. Blocking never happens inside a
//! task; every would-block operation parks the task and yields the thread.
//!
//! ```no_run
//! #[weft::main]
//! async fn main() {
//!     let chan = weft::Channel::new(0);
//!     let tx = chan.clone();
//!     weft::go(async move {
//!         tx.send("hello").await.unwrap();
//!     });
//!     assert_eq!(chan.recv().await.unwrap(), Some("hello"));
//! }
//! ```

#[doc(inline)]
pub use weft_macros::main;

#[doc(inline)]
pub use weft_macros::test;

pub mod errors;
pub use errors::{ErrorKind, Result, RuntimeError};

pub(crate) mod context;

pub mod task;
pub use task::{Id, Park, Priority, Task, TaskRef, TaskState, current, defer, join, park};
pub use task::pool::TaskPool;

pub mod runtime;
pub use runtime::{
    Builder, ControlAction, Outcome, Runtime, block_on, go, next_tick, resume, spawn, terminate,
    throw, yield_now,
};

pub mod reactor;
pub use reactor::{Interest, PollReactor, Reactor, WatchId};

pub mod sync;
pub use sync::{Channel, Mutex, TryRecvError, TrySendError, WaitGroup};

pub mod time;
pub use time::{Ticker, Timer, after_func, sleep};

pub mod stream;
pub use stream::{Endpoint, FdEndpoint, Handshake, RingBuf, Shutdown, Stream};

pub mod process;
pub use process::{fork, forked, signal, wait};

pub(crate) mod utils;

#[cfg(test)]
mod tests {
    use crate as weft;
    use crate::errors::{ErrorKind, RuntimeError};
    use crate::runtime::{go, terminate, yield_now};
    use crate::sync::{Channel, WaitGroup};
    use crate::task::{self, Priority, TaskState};
    use anyhow::Result;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::time::Duration;

    #[weft::test]
    async fn test_go_runs_task_to_dead() -> Result<()> {
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        let task = go(async move {
            r.set(true);
        });
        task::join(&task).await?;
        assert!(ran.get());
        assert_eq!(task.state(), TaskState::Dead);
        Ok(())
    }

    #[weft::test]
    async fn test_current_inside_task_and_main() -> Result<()> {
        let main = task::current().expect("main task current");
        assert!(main.is_main());

        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        let spawned = go(async move {
            *s.borrow_mut() = task::current().map(|t| t.id());
        });
        task::join(&spawned).await?;
        assert_eq!(*seen.borrow(), Some(spawned.id()));
        Ok(())
    }

    #[weft::test]
    async fn test_defer_runs_once_on_termination() -> Result<()> {
        let counter = Rc::new(Cell::new(0));
        let c = counter.clone();
        let task = go(async move {
            let c2 = c.clone();
            task::defer(move || c2.set(c2.get() + 1));
        });
        task::join(&task).await?;
        assert_eq!(counter.get(), 1);
        Ok(())
    }

    #[weft::test]
    async fn test_defers_run_on_terminate_too() -> Result<()> {
        let cleaned = Rc::new(Cell::new(false));
        let c = cleaned.clone();
        let chan: Channel<u8> = Channel::new(0);
        let rx = chan.clone();
        let task = crate::runtime::spawn(async move {
            let c2 = c.clone();
            task::defer(move || c2.set(true));
            rx.recv().await?;
            Ok(())
        });
        yield_now().await?;
        assert_eq!(task.state(), TaskState::Waiting);

        terminate(&task);
        let _ = task::join(&task).await;
        assert!(cleaned.get());
        assert!(matches!(
            task.result(),
            Some(Err(RuntimeError::Terminated))
        ));
        Ok(())
    }

    #[weft::test]
    async fn test_task_panic_is_captured_not_propagated() -> Result<()> {
        let task = go(async {
            panic!("task goes boom");
        });
        let _ = task::join(&task).await;
        match task.result() {
            Some(Err(RuntimeError::Panicked(msg))) => assert!(msg.contains("boom")),
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }

    #[weft::test]
    async fn test_state_listener_fires_in_fresh_task() -> Result<()> {
        let chan: Channel<u8> = Channel::new(0);
        let rx = chan.clone();
        let watched = go(async move {
            let _ = rx.recv().await;
        });

        let observed = Rc::new(Cell::new(false));
        let o = observed.clone();
        watched.on_state(TaskState::Dead, Priority::Low, move |t| {
            assert_eq!(t.state(), TaskState::Dead);
            o.set(true);
        });

        yield_now().await?;
        chan.close();
        task::join(&watched).await?;
        // The listener task itself still needs a tick.
        yield_now().await?;
        assert!(observed.get());
        Ok(())
    }

    #[weft::test]
    async fn test_scheduler_tick_order_next_tick_before_tasks() -> Result<()> {
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        go(async move {
            o.borrow_mut().push("task");
        });
        let o = order.clone();
        crate::runtime::next_tick(move || o.borrow_mut().push("next_tick"));

        yield_now().await?;
        assert_eq!(*order.borrow(), vec!["next_tick", "task"]);
        Ok(())
    }

    #[weft::test]
    async fn test_unbuffered_rendezvous_end_to_end() -> Result<()> {
        // Scenario: A sends "H", B receives it; both reach Dead and the
        // channel never buffers.
        let chan: Channel<&'static str> = Channel::new(0);
        let got = Rc::new(RefCell::new(None));

        let tx = chan.clone();
        let a = go(async move {
            tx.send("H").await.unwrap();
        });
        let rx = chan.clone();
        let sink = got.clone();
        let b = go(async move {
            *sink.borrow_mut() = rx.recv().await.unwrap();
        });

        task::join(&a).await?;
        task::join(&b).await?;
        assert_eq!(*got.borrow(), Some("H"));
        assert_eq!(chan.len(), 0);
        assert_eq!(a.state(), TaskState::Dead);
        assert_eq!(b.state(), TaskState::Dead);
        Ok(())
    }

    #[weft::test]
    async fn test_sleepers_wake_in_deadline_order() -> Result<()> {
        let order: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let wg = WaitGroup::new();
        wg.add(2);

        for (tag, ms) in [(2u8, 6u64), (1u8, 2u64)] {
            let order = order.clone();
            let wg = wg.clone();
            go(async move {
                crate::time::sleep(Duration::from_millis(ms)).await.unwrap();
                order.borrow_mut().push(tag);
                wg.done().unwrap();
            });
        }
        wg.wait().await?;
        assert_eq!(*order.borrow(), vec![1, 2]);
        Ok(())
    }

    #[weft::test]
    async fn test_throw_surfaces_at_suspension_site() -> Result<()> {
        let chan: Channel<u8> = Channel::new(0);
        let rx = chan.clone();
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        let task = go(async move {
            *sink.borrow_mut() = Some(rx.recv().await);
        });
        yield_now().await?;

        let outcome = crate::runtime::throw(
            &task,
            RuntimeError::Timeout("injected".into()),
        );
        outcome.resolve(ErrorKind::Timeout);

        task::join(&task).await?;
        match seen.borrow().as_ref() {
            Some(Err(RuntimeError::Timeout(msg))) => assert_eq!(msg, "injected"),
            other => panic!("unexpected: {other:?}"),
        }
        Ok(())
    }
}
