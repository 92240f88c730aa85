use crate::context;
use crate::errors::Result;
use crate::reactor::WatchId;
use crate::sync::Channel;
use std::cell::Cell;
use std::time::{Duration, Instant};

/// One-shot timer exposed as a value: the fire time arrives on
/// [`channel`](Timer::channel) exactly once.
///
/// `stop` is idempotent; `reset` replaces the underlying reactor watcher
/// atomically, so a stale fire can never slip through between the two.
#[derive(Debug)]
pub struct Timer {
    id: Cell<Option<WatchId>>,
    chan: Channel<Instant>,
}

impl Timer {
    pub fn new(after: Duration) -> Result<Timer> {
        let chan = Channel::new(1);
        let id = arm(after, chan.clone())?;
        Ok(Timer {
            id: Cell::new(Some(id)),
            chan,
        })
    }

    /// Delivery channel; receives the fire time once per arm/reset.
    pub fn channel(&self) -> &Channel<Instant> {
        &self.chan
    }

    /// Cancels the pending fire, if any.
    pub fn stop(&self) {
        if let Some(id) = self.id.take() {
            context::reactor().unwatch(id);
        }
    }

    /// Re-arms for `after` from now.
    pub fn reset(&self, after: Duration) -> Result<()> {
        if let Some(id) = self.id.take() {
            context::reactor().unwatch(id);
        }
        let id = arm(after, self.chan.clone())?;
        self.id.set(Some(id));
        Ok(())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Some(reactor) = context::try_with(|ctx| ctx.reactor.clone()) {
                reactor.unwatch(id);
            }
        }
    }
}

fn arm(after: Duration, chan: Channel<Instant>) -> Result<WatchId> {
    context::reactor().timer(
        after,
        Duration::ZERO,
        Box::new(move |_| {
            // Capacity-1 channel: the value sticks around until someone
            // receives it, and a dangling fire after a reset cannot pile up.
            let _ = chan.try_send(Instant::now());
        }),
    )
}

/// Runs `f` once after `after`, inside the reactor's dispatch (no task is
/// spawned). The handle's `stop` cancels a pending fire.
pub fn after_func(after: Duration, f: impl FnOnce() + 'static) -> Result<Timer> {
    let chan = Channel::new(1);
    let mut f = Some(f);
    let id = context::reactor().timer(
        after,
        Duration::ZERO,
        Box::new(move |_| {
            if let Some(f) = f.take() {
                f();
            }
        }),
    )?;
    Ok(Timer {
        id: Cell::new(Some(id)),
        chan,
    })
}

/// Periodic timer delivering fire times on an unbuffered channel.
///
/// Sends are fire-and-forget: a tick with no receiver parked is dropped
/// silently. Periodic timers are a pacing signal, not a reliable queue;
/// dedicate a task per ticker if every tick matters.
#[derive(Debug)]
pub struct Ticker {
    id: Cell<Option<WatchId>>,
    chan: Channel<Instant>,
}

impl Ticker {
    pub fn new(period: Duration) -> Result<Ticker> {
        let chan = Channel::new(0);
        let sender = chan.clone();
        // Fires immediately, then at every period boundary.
        let id = context::reactor().timer(
            Duration::ZERO,
            period,
            Box::new(move |_| {
                let _ = sender.try_send(Instant::now());
            }),
        )?;
        Ok(Ticker {
            id: Cell::new(Some(id)),
            chan,
        })
    }

    pub fn channel(&self) -> &Channel<Instant> {
        &self.chan
    }

    pub fn stop(&self) {
        if let Some(id) = self.id.take() {
            context::reactor().unwatch(id);
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Some(reactor) = context::try_with(|ctx| ctx.reactor.clone()) {
                reactor.unwatch(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as weft;
    use crate::runtime::go;
    use anyhow::Result;

    #[weft::test]
    async fn test_timer_delivers_fire_time_once() -> Result<()> {
        let start = Instant::now();
        let timer = Timer::new(Duration::from_millis(2))?;
        let fired = timer.channel().recv().await?.expect("timer channel open");
        assert!(fired >= start);
        // Exactly once: nothing else is buffered.
        assert!(timer.channel().is_empty());
        Ok(())
    }

    #[weft::test]
    async fn test_stop_is_idempotent() -> Result<()> {
        let timer = Timer::new(Duration::from_secs(3600))?;
        timer.stop();
        timer.stop();
        assert!(!context::reactor().is_active());
        Ok(())
    }

    #[weft::test]
    async fn test_reset_rearms_a_stopped_timer() -> Result<()> {
        let timer = Timer::new(Duration::from_secs(3600))?;
        timer.stop();
        timer.reset(Duration::from_millis(1))?;
        assert!(timer.channel().recv().await?.is_some());
        Ok(())
    }

    #[weft::test]
    async fn test_after_func_runs_in_reactor_dispatch() -> Result<()> {
        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let f = fired.clone();
        let _handle = after_func(Duration::from_millis(1), move || f.set(true))?;
        crate::time::sleep(Duration::from_millis(5)).await?;
        assert!(fired.get());
        Ok(())
    }

    #[weft::test]
    async fn test_ticker_delivers_to_a_parked_receiver() -> Result<()> {
        let ticker = Ticker::new(Duration::from_millis(1))?;
        let chan = ticker.channel().clone();
        let counter = std::rc::Rc::new(std::cell::Cell::new(0));
        let c = counter.clone();
        let consumer = go(async move {
            for _ in 0..3 {
                chan.recv().await.unwrap();
                c.set(c.get() + 1);
            }
        });
        crate::task::join(&consumer).await?;
        ticker.stop();
        assert_eq!(counter.get(), 3);
        Ok(())
    }

    #[weft::test]
    async fn test_ticker_drops_ticks_with_no_receiver() -> Result<()> {
        let ticker = Ticker::new(Duration::from_millis(1))?;
        // Nobody receiving: ticks must vanish, not queue up.
        crate::time::sleep(Duration::from_millis(5)).await?;
        assert!(ticker.channel().is_empty());
        ticker.stop();
        Ok(())
    }
}
