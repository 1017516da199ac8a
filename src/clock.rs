//! The injected delayed-execution capability (spec section 4.1's
//! `IDelayedExecutor`). The core never reads a wall clock directly; every
//! timer flows through this trait so hosts can trampoline onto whichever
//! executor they run on, and tests can run under `tokio::time::pause`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Platform-neutral source of delayed futures.
///
/// `delay(d)` must resolve no sooner than `d` has elapsed; it is the only
/// time source the core consults.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns a future that resolves after `duration`.
    fn delay(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Default [`Clock`] backed by `tokio::time::sleep`.
///
/// Under `#[tokio::test(start_paused = true)]`, `tokio::time::advance`
/// drives this deterministically, which is what this crate's test suite
/// uses in place of a hand-rolled fake executor.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn delay(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_waits_at_least_the_requested_duration() {
        let clock = TokioClock;
        let start = Instant::now();
        let delay = clock.delay(Duration::from_millis(200));
        tokio::time::advance(Duration::from_millis(200)).await;
        delay.await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
