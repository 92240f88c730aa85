//! Advisory, non-reentrant mutex for serializing logical critical sections
//! between tasks.
//!
//! Ownership is sticky, not counted: a second `lock` by the owner is a no-op
//! and a single `unlock` fully releases. Contended waiters park in FIFO
//! order; `unlock` hands the lock to the queue head directly, so no task can
//! barge in between release and wake-up.

use crate::context;
use crate::errors::{Result, RuntimeError};
use crate::task::{Id, TaskRef, park_with_event};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

struct Inner {
    owner: Option<Id>,
    waiters: VecDeque<TaskRef>,
}

#[derive(Clone)]
pub struct Mutex {
    inner: Rc<RefCell<Inner>>,
}

impl Mutex {
    pub fn new() -> Self {
        Mutex {
            inner: Rc::new(RefCell::new(Inner {
                owner: None,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Acquires the lock, parking while another task owns it. Re-entry by
    /// the current owner returns immediately without deepening the lock.
    pub async fn lock(&self) -> Result<()> {
        let me = context::current_task().expect("mutex lock requires a running weft task");
        {
            let mut inner = self.inner.borrow_mut();
            match inner.owner {
                None => {
                    inner.owner = Some(me.id());
                    return Ok(());
                }
                Some(owner) if owner == me.id() => return Ok(()),
                Some(_) => inner.waiters.push_back(me.clone()),
            }
        }

        match park_with_event("mutex.lock").await {
            // Ownership was assigned by `unlock` before the wake.
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

    /// True if the lock was free or already held by the current task.
    pub fn try_lock(&self) -> bool {
        let me = context::current_task().expect("mutex try_lock requires a running weft task");
        let mut inner = self.inner.borrow_mut();
        match inner.owner {
            None => {
                inner.owner = Some(me.id());
                true
            }
            Some(owner) => owner == me.id(),
        }
    }

    /// Releases the lock; only the owner may call this. With waiters queued,
    /// the head inherits ownership and is woken.
    pub fn unlock(&self) -> Result<()> {
        let me = context::current_task().expect("mutex unlock requires a running weft task");
        let next = {
            let mut inner = self.inner.borrow_mut();
            if inner.owner != Some(me.id()) {
                return Err(RuntimeError::SyncMisuse(
                    "unlock of a mutex not owned by the current task".into(),
                ));
            }
            match inner.waiters.pop_front() {
                Some(next) => {
                    inner.owner = Some(next.id());
                    Some(next)
                }
                None => {
                    inner.owner = None;
                    None
                }
            }
        };
        if let Some(next) = next {
            context::scheduler().wake(&next, Ok(()));
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.inner.borrow().owner.is_some()
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.borrow().waiters.len()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Mutex::new()
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Mutex")
            .field("owner", &inner.owner)
            .field("waiting", &inner.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as weft;
    use crate::runtime::{go, yield_now};
    use crate::task::join;
    use anyhow::Result;
    use std::cell::RefCell as StdRefCell;

    #[weft::test]
    async fn test_lock_unlock_roundtrip() -> Result<()> {
        let mutex = Mutex::new();
        mutex.lock().await?;
        assert!(mutex.is_locked());
        mutex.unlock()?;
        assert!(!mutex.is_locked());
        assert_eq!(mutex.waiting_count(), 0);
        Ok(())
    }

    #[weft::test]
    async fn test_owner_relock_is_noop_and_single_unlock_releases() -> Result<()> {
        let mutex = Mutex::new();
        mutex.lock().await?;
        mutex.lock().await?;
        assert!(mutex.try_lock());
        mutex.unlock()?;
        // Ownership is sticky, not counted.
        assert!(!mutex.is_locked());
        Ok(())
    }

    #[weft::test]
    async fn test_unlock_by_non_owner_fails() -> Result<()> {
        let mutex = Mutex::new();
        mutex.lock().await?;

        let other = {
            let mutex = mutex.clone();
            go(async move {
                let err = mutex.unlock().unwrap_err();
                assert!(matches!(err, RuntimeError::SyncMisuse(_)));
            })
        };
        join(&other).await?;
        assert!(mutex.is_locked());
        mutex.unlock()?;
        Ok(())
    }

    #[weft::test]
    async fn test_unlock_without_lock_fails() -> Result<()> {
        let mutex = Mutex::new();
        assert!(matches!(
            mutex.unlock(),
            Err(RuntimeError::SyncMisuse(_))
        ));
        Ok(())
    }

    #[weft::test]
    async fn test_contended_wake_order_is_fifo() -> Result<()> {
        let mutex = Mutex::new();
        mutex.lock().await?;

        let order: Rc<StdRefCell<Vec<&'static str>>> = Rc::new(StdRefCell::new(Vec::new()));
        let counts: Rc<StdRefCell<Vec<usize>>> = Rc::new(StdRefCell::new(Vec::new()));
        let mut contenders = Vec::new();
        for name in ["A", "B", "C"] {
            let mutex = mutex.clone();
            let order = order.clone();
            let counts = counts.clone();
            contenders.push(go(async move {
                mutex.lock().await.unwrap();
                order.borrow_mut().push(name);
                counts.borrow_mut().push(mutex.waiting_count());
                mutex.unlock().unwrap();
            }));
        }

        // Let all three park on the lock before releasing it.
        yield_now().await?;
        assert_eq!(mutex.waiting_count(), 3);
        mutex.unlock()?;

        for task in &contenders {
            join(task).await?;
        }
        assert_eq!(*order.borrow(), vec!["A", "B", "C"]);
        // waiting_count drains monotonically as each contender runs.
        assert_eq!(*counts.borrow(), vec![2, 1, 0]);
        assert!(!mutex.is_locked());
        Ok(())
    }

    #[weft::test]
    async fn test_terminated_waiter_is_unlinked() -> Result<()> {
        let mutex = Mutex::new();
        mutex.lock().await?;
        let waiter = {
            let mutex = mutex.clone();
            go(async move {
                let _ = mutex.lock().await;
            })
        };
        yield_now().await?;
        assert_eq!(mutex.waiting_count(), 1);
        crate::runtime::terminate(&waiter);
        join(&waiter).await?;
        assert_eq!(mutex.waiting_count(), 0);
        // The lock is still ours and still releasable.
        mutex.unlock()?;
        Ok(())
    }
}
