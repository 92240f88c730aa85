//! Time: suspension-based sleep and timer/ticker values over reactor
//! timers.

use crate::context;
use crate::errors::Result;
use crate::task::park_with_event;
use crate::utils::ScopeGuard;
use std::time::Duration;

mod timer;
pub use timer::{Ticker, Timer, after_func};

/// Parks the current task for at least `duration`.
///
/// Cancellation (terminate, or an error thrown into the sleeper) surfaces
/// here; the underlying reactor timer is released on every exit path.
pub async fn sleep(duration: Duration) -> Result<()> {
    let me = context::current_task().expect("sleep() requires a running weft task");
    let reactor = context::reactor();
    let id = reactor.timer(
        duration,
        Duration::ZERO,
        Box::new(move |_| {
            context::scheduler().wake(&me, Ok(()));
        }),
    )?;

    let cleanup = reactor.clone();
    let _guard = ScopeGuard::new(move || cleanup.unwatch(id));
    park_with_event("sleep").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as weft;
    use crate::errors::RuntimeError;
    use crate::runtime::{go, yield_now};
    use anyhow::Result;
    use std::time::Instant;

    #[weft::test]
    async fn test_sleep_lasts_at_least_the_duration() -> Result<()> {
        let duration = Duration::from_millis(5);
        let start = Instant::now();
        sleep(duration).await?;
        assert!(start.elapsed() >= duration);
        Ok(())
    }

    #[weft::test]
    async fn test_sleep_zero_still_yields_through_the_reactor() -> Result<()> {
        sleep(Duration::ZERO).await?;
        Ok(())
    }

    #[weft::test]
    async fn test_terminated_sleeper_releases_its_timer() -> Result<()> {
        let sleeper = go(async {
            let err = sleep(Duration::from_secs(3600)).await.unwrap_err();
            assert_eq!(err, RuntimeError::Terminated);
        });
        yield_now().await?;
        crate::runtime::terminate(&sleeper);
        crate::task::join(&sleeper).await?;
        // The hour-long timer must be gone, or the runtime would hang on
        // exit waiting for it.
        assert!(!context::reactor().is_active());
        Ok(())
    }
}
