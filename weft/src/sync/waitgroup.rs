//! Counter that parks waiters until it drains to zero.

use crate::context;
use crate::errors::{Result, RuntimeError};
use crate::task::{TaskRef, park_with_event};
use std::cell::RefCell;
use std::rc::Rc;

struct Inner {
    count: usize,
    waiters: Vec<TaskRef>,
}

#[derive(Clone)]
pub struct WaitGroup {
    inner: Rc<RefCell<Inner>>,
}

impl WaitGroup {
    pub fn new() -> Self {
        WaitGroup {
            inner: Rc::new(RefCell::new(Inner {
                count: 0,
                waiters: Vec::new(),
            })),
        }
    }

    /// Raises the counter by `n`.
    pub fn add(&self, n: usize) {
        self.inner.borrow_mut().count += n;
    }

    /// Drops the counter by one; reaching zero wakes every current waiter.
    /// Fails when the counter is already zero.
    pub fn done(&self) -> Result<()> {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            if inner.count == 0 {
                return Err(RuntimeError::SyncMisuse(
                    "waitgroup done() without a matching add()".into(),
                ));
            }
            inner.count -= 1;
            if inner.count > 0 {
                return Ok(());
            }
            std::mem::take(&mut inner.waiters)
        };
        if !waiters.is_empty() {
            let sched = context::scheduler();
            for task in waiters {
                sched.wake(&task, Ok(()));
            }
        }
        Ok(())
    }

    /// Parks until the counter reaches zero; returns immediately when it
    /// already is.
    pub async fn wait(&self) -> Result<()> {
        let me = {
            let mut inner = self.inner.borrow_mut();
            if inner.count == 0 {
                return Ok(());
            }
            let me = context::current_task().expect("waitgroup wait requires a running weft task");
            inner.waiters.push(me.clone());
            me
        };
        match park_with_event("waitgroup.wait").await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner
                    .borrow_mut()
                    .waiters
                    .retain(|t| !TaskRef::ptr_eq(t, &me));
                Err(err)
            }
        }
    }

    pub fn count(&self) -> usize {
        self.inner.borrow().count
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.borrow().waiters.len()
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        WaitGroup::new()
    }
}

impl std::fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("WaitGroup")
            .field("count", &inner.count)
            .field("waiting", &inner.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as weft;
    use crate::runtime::{go, yield_now};
    use anyhow::Result;

    #[weft::test]
    async fn test_wait_with_zero_counter_returns_immediately() -> Result<()> {
        let wg = WaitGroup::new();
        wg.wait().await?;
        assert_eq!(wg.waiting_count(), 0);
        Ok(())
    }

    #[weft::test]
    async fn test_done_without_add_fails() -> Result<()> {
        let wg = WaitGroup::new();
        assert!(matches!(wg.done(), Err(RuntimeError::SyncMisuse(_))));
        Ok(())
    }

    #[weft::test]
    async fn test_counter_reaching_zero_wakes_all_waiters() -> Result<()> {
        let wg = WaitGroup::new();
        wg.add(2);

        let finished = Rc::new(std::cell::Cell::new(0));
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let wg = wg.clone();
            let finished = finished.clone();
            waiters.push(go(async move {
                wg.wait().await.unwrap();
                finished.set(finished.get() + 1);
            }));
        }

        yield_now().await?;
        assert_eq!(wg.waiting_count(), 3);
        assert_eq!(finished.get(), 0);

        wg.done()?;
        yield_now().await?;
        assert_eq!(finished.get(), 0, "counter still above zero");

        wg.done()?;
        for task in &waiters {
            crate::task::join(task).await?;
        }
        assert_eq!(finished.get(), 3);
        assert_eq!(wg.count(), 0);
        Ok(())
    }

    #[weft::test]
    async fn test_reuse_after_drain() -> Result<()> {
        let wg = WaitGroup::new();
        wg.add(1);
        wg.done()?;
        wg.add(1);
        let wg2 = wg.clone();
        let worker = go(async move {
            wg2.done().unwrap();
        });
        wg.wait().await?;
        crate::task::join(&worker).await?;
        Ok(())
    }
}
