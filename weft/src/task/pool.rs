//! Fixed-size cache of worker tasks fed over a rendezvous channel.
//!
//! Spawning a task per unit of work churns allocations under load; a pool
//! keeps `size` workers parked on a shared job channel instead. A worker
//! that dies (its process function panicked) is recycled in place on the
//! next dispatch rather than re-allocated.

use crate::context;
use crate::errors::Result;
use crate::sync::Channel;
use crate::task::{TaskFuture, TaskRef, TaskState, join};
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

pub struct TaskPool<T: 'static> {
    jobs: Channel<T>,
    workers: RefCell<Vec<TaskRef>>,
    process: Rc<dyn Fn(T) -> TaskFuture>,
}

impl<T: 'static> TaskPool<T> {
    /// Spawns `size` workers, each looping over the job channel and running
    /// `process` per job.
    pub fn new<F, Fut>(size: usize, process: F) -> Self
    where
        F: Fn(T) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let process: Rc<dyn Fn(T) -> TaskFuture> = Rc::new(move |job| {
            let fut = process(job);
            Box::pin(async move {
                fut.await;
                Ok(())
            })
        });

        let jobs = Channel::new(0);
        let sched = context::scheduler();
        let workers = (0..size)
            .map(|_| sched.spawn(worker_loop(jobs.clone(), process.clone())))
            .collect();

        TaskPool {
            jobs,
            workers: RefCell::new(workers),
            process,
        }
    }

    /// Hands `job` to an idle worker, parking until one is free. The
    /// rendezvous channel makes dispatch a direct handoff.
    pub async fn dispatch(&self, job: T) -> Result<()> {
        self.revive_dead_workers();
        self.jobs.send(job).await
    }

    /// Workers whose process function panicked are dead; rebind them to a
    /// fresh worker loop instead of allocating new tasks.
    fn revive_dead_workers(&self) {
        let sched = context::scheduler();
        for worker in self.workers.borrow().iter() {
            if worker.state() == TaskState::Dead
                && worker
                    .recycle(worker_loop(self.jobs.clone(), self.process.clone()))
                    .is_ok()
            {
                sched.enqueue(worker, false);
            }
        }
    }

    /// Closes the job channel and parks until every worker wound down.
    pub async fn close(&self) -> Result<()> {
        self.jobs.close();
        let workers = self.workers.borrow().clone();
        for worker in workers {
            let _ = join(&worker).await;
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.workers.borrow().len()
    }

    /// Workers currently parked on the job channel.
    pub fn idle(&self) -> usize {
        self.jobs.waiting_receivers()
    }
}

fn worker_loop<T: 'static>(jobs: Channel<T>, process: Rc<dyn Fn(T) -> TaskFuture>) -> TaskFuture {
    Box::pin(async move {
        while let Ok(Some(job)) = jobs.recv().await {
            process(job).await?;
        }
        Ok(())
    })
}

impl<T: 'static> std::fmt::Debug for TaskPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("size", &self.workers.borrow().len())
            .field("idle", &self.idle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as weft;
    use crate::runtime::yield_now;
    use anyhow::Result;
    use std::cell::RefCell as StdRefCell;

    #[weft::test]
    async fn test_jobs_run_on_pool_workers() -> Result<()> {
        let seen: Rc<StdRefCell<Vec<u32>>> = Rc::new(StdRefCell::new(Vec::new()));
        let sink = seen.clone();
        let pool = TaskPool::new(2, move |job: u32| {
            let sink = sink.clone();
            async move {
                sink.borrow_mut().push(job);
            }
        });

        for job in 0..5 {
            pool.dispatch(job).await?;
        }
        pool.close().await?;

        let mut got = seen.borrow().clone();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        Ok(())
    }

    #[weft::test]
    async fn test_workers_idle_between_jobs() -> Result<()> {
        let pool: TaskPool<u8> = TaskPool::new(3, |_| async {});
        // Let the workers reach their recv parks.
        yield_now().await?;
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.idle(), 3);
        pool.close().await?;
        Ok(())
    }

    #[weft::test]
    async fn test_panicked_worker_is_recycled() -> Result<()> {
        let pool = TaskPool::new(1, |job: u8| async move {
            if job == 13 {
                panic!("unlucky job");
            }
        });

        pool.dispatch(13).await?;
        // The worker dies processing the job; the pool notices on the next
        // dispatch and recycles the same task.
        yield_now().await?;
        yield_now().await?;
        pool.dispatch(1).await?;
        yield_now().await?;
        assert_eq!(pool.idle(), 1);
        pool.close().await?;
        Ok(())
    }
}
