//! Bounded FIFO channel with rendezvous semantics at capacity 0.
//!
//! A sender that would overrun the buffer parks in the waiting-senders queue;
//! a receiver that finds the buffer empty parks in the waiting-receivers
//! queue. At most one of the two queues is ever non-empty. Waiters are woken
//! in FIFO order through the scheduler's runnable queue.

use crate::context;
use crate::errors::{Result, RuntimeError};
use crate::task::{TaskRef, park_with_event};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Error from a non-suspending send attempt; carries the rejected value.
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// Buffer full and no receiver parked.
    Full(T),
    Closed(T),
}

/// Error from a non-suspending receive attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum TryRecvError {
    /// Nothing buffered and no sender parked.
    Empty,
    /// Closed and drained.
    Closed,
}

struct SendWaiter<T> {
    task: TaskRef,
    /// The value travels with the queue entry; the receiver that unblocks
    /// this sender takes it from here.
    value: Rc<RefCell<Option<T>>>,
}

struct RecvWaiter<T> {
    task: TaskRef,
    /// Filled by the sender that hands its value to this receiver; left
    /// empty by `close`, which the receiver reads as end-of-channel.
    slot: Rc<RefCell<Option<T>>>,
}

struct Inner<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    closed: bool,
    send_waiters: VecDeque<SendWaiter<T>>,
    recv_waiters: VecDeque<RecvWaiter<T>>,
}

pub struct Channel<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Channel<T> {
    /// A channel buffering up to `capacity` values; 0 makes every exchange a
    /// rendezvous.
    pub fn new(capacity: usize) -> Self {
        Channel {
            inner: Rc::new(RefCell::new(Inner {
                capacity,
                buffer: VecDeque::new(),
                closed: false,
                send_waiters: VecDeque::new(),
                recv_waiters: VecDeque::new(),
            })),
        }
    }

    /// Sends `value`, parking until the buffer has room or a receiver takes
    /// it. Fails on a closed channel and propagates anything thrown into the
    /// parked sender (terminate, timeout).
    pub async fn send(&self, value: T) -> Result<()> {
        let cell = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Err(RuntimeError::ChannelClosed);
            }
            if let Some(waiter) = inner.recv_waiters.pop_front() {
                *waiter.slot.borrow_mut() = Some(value);
                drop(inner);
                context::scheduler().wake(&waiter.task, Ok(()));
                return Ok(());
            }
            if inner.buffer.len() < inner.capacity {
                inner.buffer.push_back(value);
                return Ok(());
            }
            let me = context::current_task().expect("channel send requires a running weft task");
            let cell = Rc::new(RefCell::new(Some(value)));
            inner.send_waiters.push_back(SendWaiter {
                task: me,
                value: cell.clone(),
            });
            cell
        };

        match park_with_event("channel.send").await {
            Ok(()) => Ok(()),
            Err(err) => {
                // Thrown into while queued: unlink the stale entry.
                self.inner
                    .borrow_mut()
                    .send_waiters
                    .retain(|w| !Rc::ptr_eq(&w.value, &cell));
                Err(err)
            }
        }
    }

    /// Receives the next value in FIFO order. `Ok(None)` means the channel
    /// is closed and drained.
    pub async fn recv(&self) -> Result<Option<T>> {
        let slot = {
            let mut inner = self.inner.borrow_mut();
            if let Some(value) = inner.buffer.pop_front() {
                // A parked sender's value moves into the slot just vacated.
                if let Some(waiter) = inner.send_waiters.pop_front() {
                    let pending = waiter
                        .value
                        .borrow_mut()
                        .take()
                        .expect("parked sender lost its value");
                    inner.buffer.push_back(pending);
                    drop(inner);
                    context::scheduler().wake(&waiter.task, Ok(()));
                }
                return Ok(Some(value));
            }
            if let Some(waiter) = inner.send_waiters.pop_front() {
                // Rendezvous: take the value straight from the sender.
                let value = waiter
                    .value
                    .borrow_mut()
                    .take()
                    .expect("parked sender lost its value");
                drop(inner);
                context::scheduler().wake(&waiter.task, Ok(()));
                return Ok(Some(value));
            }
            if inner.closed {
                return Ok(None);
            }
            let me = context::current_task().expect("channel recv requires a running weft task");
            let slot = Rc::new(RefCell::new(None));
            inner.recv_waiters.push_back(RecvWaiter {
                task: me,
                slot: slot.clone(),
            });
            slot
        };

        match park_with_event("channel.recv").await {
            Ok(()) => Ok(slot.borrow_mut().take()),
            Err(err) => {
                self.inner
                    .borrow_mut()
                    .recv_waiters
                    .retain(|w| !Rc::ptr_eq(&w.slot, &slot));
                Err(err)
            }
        }
    }

    /// Non-suspending send; hands off to a parked receiver or buffers.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(TrySendError::Closed(value));
        }
        if let Some(waiter) = inner.recv_waiters.pop_front() {
            *waiter.slot.borrow_mut() = Some(value);
            drop(inner);
            context::scheduler().wake(&waiter.task, Ok(()));
            return Ok(());
        }
        if inner.buffer.len() < inner.capacity {
            inner.buffer.push_back(value);
            return Ok(());
        }
        Err(TrySendError::Full(value))
    }

    /// Non-suspending receive.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut inner = self.inner.borrow_mut();
        if let Some(value) = inner.buffer.pop_front() {
            if let Some(waiter) = inner.send_waiters.pop_front() {
                let pending = waiter
                    .value
                    .borrow_mut()
                    .take()
                    .expect("parked sender lost its value");
                inner.buffer.push_back(pending);
                drop(inner);
                context::scheduler().wake(&waiter.task, Ok(()));
            }
            return Ok(value);
        }
        if let Some(waiter) = inner.send_waiters.pop_front() {
            let value = waiter
                .value
                .borrow_mut()
                .take()
                .expect("parked sender lost its value");
            drop(inner);
            context::scheduler().wake(&waiter.task, Ok(()));
            return Ok(value);
        }
        if inner.closed {
            return Err(TryRecvError::Closed);
        }
        Err(TryRecvError::Empty)
    }

    /// Closes the channel: parked receivers resume and observe end-of-
    /// channel, parked senders fail with a closed-channel error. Idempotent.
    pub fn close(&self) {
        let (senders, receivers) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            (
                std::mem::take(&mut inner.send_waiters),
                std::mem::take(&mut inner.recv_waiters),
            )
        };
        if senders.is_empty() && receivers.is_empty() {
            return;
        }
        let sched = context::scheduler();
        for waiter in receivers {
            sched.wake(&waiter.task, Ok(()));
        }
        for waiter in senders {
            sched.wake(&waiter.task, Err(RuntimeError::ChannelClosed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Buffered value count.
    pub fn len(&self) -> usize {
        self.inner.borrow().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().capacity
    }

    pub fn waiting_senders(&self) -> usize {
        self.inner.borrow().send_waiters.len()
    }

    pub fn waiting_receivers(&self) -> usize {
        self.inner.borrow().recv_waiters.len()
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Channel")
            .field("capacity", &inner.capacity)
            .field("buffered", &inner.buffer.len())
            .field("closed", &inner.closed)
            .field("waiting_senders", &inner.send_waiters.len())
            .field("waiting_receivers", &inner.recv_waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as weft;
    use crate::runtime::go;
    use crate::sync::WaitGroup;
    use anyhow::Result;
    use static_assertions::assert_not_impl_any;
    use std::cell::RefCell as StdRefCell;

    // Single-threaded by contract; handing a channel to another thread
    // must not compile.
    assert_not_impl_any!(Channel<u8>: Send, Sync);

    #[weft::test]
    async fn test_unbuffered_rendezvous() -> Result<()> {
        let chan: Channel<&'static str> = Channel::new(0);
        let wg = WaitGroup::new();
        wg.add(2);

        let depth = Rc::new(std::cell::Cell::new(0usize));

        {
            let chan = chan.clone();
            let wg = wg.clone();
            let depth = depth.clone();
            go(async move {
                chan.send("H").await.unwrap();
                depth.set(depth.get().max(chan.len()));
                wg.done().unwrap();
            });
        }
        {
            let chan = chan.clone();
            let wg = wg.clone();
            go(async move {
                let got = chan.recv().await.unwrap();
                assert_eq!(got, Some("H"));
                wg.done().unwrap();
            });
        }

        wg.wait().await?;
        // Rendezvous never touches the buffer.
        assert_eq!(depth.get(), 0);
        assert_eq!(chan.len(), 0);
        Ok(())
    }

    #[weft::test]
    async fn test_buffered_fifo_with_one_producer_suspension() -> Result<()> {
        let chan: Channel<String> = Channel::new(3);
        let suspended = Rc::new(std::cell::Cell::new(0usize));
        let max_depth = Rc::new(std::cell::Cell::new(0usize));

        let producer = {
            let chan = chan.clone();
            let suspended = suspended.clone();
            let max_depth = max_depth.clone();
            go(async move {
                for i in 1..=5 {
                    if chan.len() == chan.capacity() {
                        suspended.set(suspended.get() + 1);
                    }
                    chan.send(format!("M{i}")).await.unwrap();
                    max_depth.set(max_depth.get().max(chan.len()));
                }
            })
        };

        let received: Rc<StdRefCell<Vec<String>>> = Rc::new(StdRefCell::new(Vec::new()));
        let consumer = {
            let chan = chan.clone();
            let received = received.clone();
            go(async move {
                for _ in 0..5 {
                    received
                        .borrow_mut()
                        .push(chan.recv().await.unwrap().unwrap());
                }
            })
        };

        crate::task::join(&producer).await?;
        crate::task::join(&consumer).await?;

        assert_eq!(
            *received.borrow(),
            vec!["M1", "M2", "M3", "M4", "M5"]
        );
        // The producer fills the buffer with M1..M3 and parks exactly once,
        // on the fourth send.
        assert_eq!(suspended.get(), 1);
        assert_eq!(max_depth.get(), 3);
        Ok(())
    }

    #[weft::test]
    async fn test_send_then_recv_is_fifo() -> Result<()> {
        let chan = Channel::new(4);
        chan.send(1).await?;
        chan.send(2).await?;
        assert_eq!(chan.recv().await?, Some(1));
        assert_eq!(chan.recv().await?, Some(2));
        Ok(())
    }

    #[weft::test]
    async fn test_send_on_closed_channel_fails() -> Result<()> {
        let chan = Channel::new(1);
        chan.close();
        chan.close(); // idempotent
        let err = chan.send(7).await.unwrap_err();
        assert_eq!(err, RuntimeError::ChannelClosed);
        Ok(())
    }

    #[weft::test]
    async fn test_recv_drains_buffer_after_close() -> Result<()> {
        let chan = Channel::new(2);
        chan.send(1).await?;
        chan.close();
        assert_eq!(chan.recv().await?, Some(1));
        assert_eq!(chan.recv().await?, None);
        assert_eq!(chan.recv().await?, None);
        Ok(())
    }

    #[weft::test]
    async fn test_close_wakes_parked_receiver_with_none() -> Result<()> {
        let chan: Channel<u8> = Channel::new(0);
        let receiver = {
            let chan = chan.clone();
            go(async move {
                assert_eq!(chan.recv().await.unwrap(), None);
            })
        };
        crate::runtime::yield_now().await?;
        assert_eq!(chan.waiting_receivers(), 1);
        chan.close();
        crate::task::join(&receiver).await?;
        assert_eq!(chan.waiting_receivers(), 0);
        Ok(())
    }

    #[weft::test]
    async fn test_close_fails_parked_senders() -> Result<()> {
        let chan = Channel::new(0);
        let sender = {
            let chan = chan.clone();
            go(async move {
                assert_eq!(chan.send(9).await.unwrap_err(), RuntimeError::ChannelClosed);
            })
        };
        crate::runtime::yield_now().await?;
        assert_eq!(chan.waiting_senders(), 1);
        chan.close();
        crate::task::join(&sender).await?;
        Ok(())
    }

    #[weft::test]
    async fn test_try_variants_never_suspend() -> Result<()> {
        let chan = Channel::new(1);
        assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
        chan.try_send(1).unwrap();
        assert_eq!(chan.try_send(2), Err(TrySendError::Full(2)));
        assert_eq!(chan.try_recv(), Ok(1));
        chan.close();
        assert_eq!(chan.try_send(3), Err(TrySendError::Closed(3)));
        assert_eq!(chan.try_recv(), Err(TryRecvError::Closed));
        Ok(())
    }

    #[weft::test]
    async fn test_rendezvous_try_send_needs_parked_receiver() -> Result<()> {
        let chan: Channel<u8> = Channel::new(0);
        // No receiver parked: the tick is dropped.
        assert_eq!(chan.try_send(1), Err(TrySendError::Full(1)));

        let receiver = {
            let chan = chan.clone();
            go(async move {
                assert_eq!(chan.recv().await.unwrap(), Some(2));
            })
        };
        crate::runtime::yield_now().await?;
        assert_eq!(chan.try_send(2), Ok(()));
        crate::task::join(&receiver).await?;
        Ok(())
    }

    #[weft::test]
    async fn test_terminated_sender_leaves_queue_clean() -> Result<()> {
        let chan = Channel::new(0);
        let sender = {
            let chan = chan.clone();
            go(async move {
                let _ = chan.send(1).await;
            })
        };
        crate::runtime::yield_now().await?;
        assert_eq!(chan.waiting_senders(), 1);

        crate::runtime::terminate(&sender);
        crate::task::join(&sender).await?;
        assert_eq!(chan.waiting_senders(), 0);
        Ok(())
    }
}
