//! Abstract delayed execution for retries (spec section 4.1).
//!
//! `Scheduler` is a try counter plus a single pending timer recomputed from
//! the counter, so the same type drives both [`crate::channel::Channel`]
//! rejoin and [`crate::socket::Socket`] reconnect.
//!
//! The scheduler never re-arms itself: firing only increments `tries` and
//! resolves the pending future. Callers that want a retry loop call
//! [`Scheduler::schedule_timeout`] again from within their own handling of
//! the fired action, exactly as spec section 4.1 specifies.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::clock::Clock;

/// A function computing the delay before the `n`th retry (1-indexed).
pub type TimerCalc = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Delayed retry scheduler backed by an injected [`Clock`].
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    timer_calc: TimerCalc,
    tries: u32,
    pending: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tries", &self.tries)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl Scheduler {
    /// Builds a scheduler with zero tries and nothing pending.
    pub fn new(clock: Arc<dyn Clock>, timer_calc: TimerCalc) -> Self {
        Self {
            clock,
            timer_calc,
            tries: 0,
            pending: None,
        }
    }

    /// Number of times this scheduler has fired since the last [`reset`](Self::reset).
    pub fn tries(&self) -> u32 {
        self.tries
    }

    /// Cancels any pending execution and schedules a new one after
    /// `timer_calc(tries + 1)`.
    pub fn schedule_timeout(&mut self) {
        let delay = (self.timer_calc)(self.tries + 1);
        self.pending = Some(self.clock.delay(delay));
    }

    /// Sets `tries` back to zero and cancels any pending execution.
    /// Idempotent.
    pub fn reset(&mut self) {
        self.tries = 0;
        self.pending = None;
    }

    /// Polls the pending timer, if any. Resolves exactly once per
    /// [`schedule_timeout`](Self::schedule_timeout) call, incrementing
    /// `tries` as it does.
    pub fn poll_fire(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self.pending.as_mut() {
            Some(fut) => match fut.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    self.pending = None;
                    self.tries += 1;
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Pending,
        }
    }
}

/// The reconnect schedule from spec section 4.2:
/// `10,50,100,150,200,250,500,1000,2000ms` then `5s`.
pub fn default_reconnect_after(tries: u32) -> Duration {
    const SCHEDULE_MS: &[u64] = &[10, 50, 100, 150, 200, 250, 500, 1000, 2000];
    SCHEDULE_MS
        .get((tries.saturating_sub(1)) as usize)
        .map(|ms| Duration::from_millis(*ms))
        .unwrap_or(Duration::from_secs(5))
}

/// The rejoin schedule from spec section 4.2: `1s,2s,5s` then `10s`.
pub fn default_rejoin_after(tries: u32) -> Duration {
    const SCHEDULE_S: &[u64] = &[1, 2, 5];
    SCHEDULE_S
        .get((tries.saturating_sub(1)) as usize)
        .map(|s| Duration::from_secs(*s))
        .unwrap_or(Duration::from_secs(10))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use futures::future::poll_fn;

    fn scheduler_with(calc: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Scheduler {
        Scheduler::new(Arc::new(TokioClock), Arc::new(calc))
    }

    #[test]
    fn default_schedules_match_spec_examples() {
        let reconnect: Vec<_> = (1..=10).map(default_reconnect_after).collect();
        assert_eq!(
            reconnect,
            vec![10, 50, 100, 150, 200, 250, 500, 1000, 2000, 5000]
                .into_iter()
                .map(Duration::from_millis)
                .collect::<Vec<_>>()
        );

        let rejoin: Vec<_> = (1..=5).map(default_rejoin_after).collect();
        assert_eq!(
            rejoin,
            vec![1, 2, 5, 10, 10]
                .into_iter()
                .map(Duration::from_secs)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_schedule_call_and_counts_tries() {
        let mut scheduler = scheduler_with(|_| Duration::from_millis(50));
        scheduler.schedule_timeout();

        tokio::time::advance(Duration::from_millis(50)).await;
        poll_fn(|cx| scheduler.poll_fire(cx)).await;
        assert_eq!(scheduler.tries(), 1);

        // Doesn't fire again until rescheduled.
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(scheduler.poll_fire(&mut cx), Poll::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_is_idempotent() {
        let mut scheduler = scheduler_with(|_| Duration::from_millis(50));
        scheduler.schedule_timeout();
        scheduler.reset();
        scheduler.reset();
        assert_eq!(scheduler.tries(), 0);
        assert!(scheduler.pending.is_none());
    }
}
