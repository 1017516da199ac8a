//! A single outbound request and its reply correlation (spec section 4.4).
//!
//! `Push` is deliberately inert: it has no access to the socket or its own
//! channel. Acquiring a fresh `ref`, enqueueing the serialized frame, and
//! routing an inbound `phx_reply` back to the right `Push` are all done by
//! [`crate::channel::Channel`], which owns every push it creates in a
//! `HashMap<PushId, Push>` keyed by a stable handle decoupled from the wire
//! `ref` (the `ref` changes on every resend; the handle doesn't). This
//! trades the subscription-table design spec section 9 describes for the
//! direct-map alternative it also allows, so a push's reply never has to
//! round-trip through the channel's general subscription dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::clock::Clock;
use crate::json::BoxedJson;
use crate::message::{Reply, ReplyStatus};

/// A callback registered via [`Push::receive`].
pub type ReplyHook = Box<dyn FnMut(&BoxedJson) + Send>;

/// A single outbound push and everything needed to resolve its reply.
pub struct Push {
    event: String,
    payload: BoxedJson,
    timeout: Duration,
    r#ref: Option<String>,
    join_ref: Option<String>,
    received: Option<Reply>,
    hooks: HashMap<ReplyStatus, Vec<ReplyHook>>,
    timer: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

impl std::fmt::Debug for Push {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Push")
            .field("event", &self.event)
            .field("ref", &self.r#ref)
            .field("received", &self.received)
            .field("pending_timeout", &self.timer.is_some())
            .finish()
    }
}

impl Push {
    /// Builds a push that hasn't been sent yet: no ref, no recorded reply,
    /// no pending timer.
    pub fn new(event: impl Into<String>, payload: BoxedJson, timeout: Duration) -> Self {
        Self {
            event: event.into(),
            payload,
            timeout,
            r#ref: None,
            join_ref: None,
            received: None,
            hooks: HashMap::new(),
            timer: None,
        }
    }

    /// The event name this push was constructed with.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// The payload as it will be (or was) sent.
    pub fn payload(&self) -> &BoxedJson {
        &self.payload
    }

    /// The timeout configured for this push.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The ref this push was last sent under, if any.
    pub fn r#ref(&self) -> Option<&str> {
        self.r#ref.as_deref()
    }

    /// The joinRef stamped on this push's last send, if any.
    pub fn join_ref(&self) -> Option<&str> {
        self.join_ref.as_deref()
    }

    /// The reply recorded so far, if one has arrived (or been synthesized).
    pub fn received(&self) -> Option<&Reply> {
        self.received.as_ref()
    }

    /// True once a `timeout` reply has been recorded — per spec section
    /// 4.4, `send()` becomes a no-op past this point.
    pub fn has_timed_out(&self) -> bool {
        matches!(
            self.received,
            Some(Reply {
                status: ReplyStatus::Timeout,
                ..
            })
        )
    }

    /// Registers `cb` for `status`. If a matching reply was already
    /// recorded, `cb` fires immediately with it; it is always appended to
    /// the hook list so a later rejoin can re-fire it.
    pub fn receive(&mut self, status: ReplyStatus, mut cb: ReplyHook) -> &mut Self {
        if let Some(reply) = &self.received {
            if reply.status == status {
                cb(&reply.response);
            }
        }
        self.hooks.entry(status).or_default().push(cb);
        self
    }

    /// Marks this push as freshly (re)sent: records the ref and joinRef it
    /// was sent under, clears any previously-recorded reply, and arms a
    /// fresh timeout timer.
    pub(crate) fn start_timeout(
        &mut self,
        r#ref: String,
        join_ref: Option<String>,
        clock: &Arc<dyn Clock>,
    ) {
        self.r#ref = Some(r#ref);
        self.join_ref = join_ref;
        self.received = None;
        self.timer = Some(clock.delay(self.timeout));
    }

    /// Cancels the pending timeout timer, if any. Idempotent.
    pub(crate) fn cancel_timeout(&mut self) {
        self.timer = None;
    }

    /// Resets this push so it can be resent with a new ref: clears the
    /// recorded ref, joinRef and reply, and updates the timeout if a new
    /// one is given. Does not touch the pending timer or hook table —
    /// the caller re-arms via [`start_timeout`](Self::start_timeout).
    pub(crate) fn prepare_resend(&mut self, new_timeout: Option<Duration>) {
        if let Some(timeout) = new_timeout {
            self.timeout = timeout;
        }
        self.r#ref = None;
        self.join_ref = None;
        self.received = None;
        self.timer = None;
    }

    /// Polls the pending timeout timer. Resolves at most once per
    /// [`start_timeout`](Self::start_timeout) call.
    pub(crate) fn poll_timeout(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self.timer.as_mut() {
            Some(fut) => {
                let poll = fut.as_mut().poll(cx);
                if poll.is_ready() {
                    self.timer = None;
                }
                poll
            }
            None => Poll::Pending,
        }
    }

    /// Records `reply`, cancels the pending timer, and invokes every hook
    /// registered for its status — in registration order, per spec
    /// section 5's ordering guarantees. A reply already recorded as
    /// `timeout` is not overwritten by this method; the caller is
    /// expected to still invoke matching-status hooks for late replies
    /// (spec section 4.4's "receiving a late ok/error after timeout still
    /// fires hooks") by calling [`fire_hooks`](Self::fire_hooks) directly.
    pub(crate) fn resolve(&mut self, reply: Reply) {
        self.cancel_timeout();
        self.fire_hooks(&reply);
        if self.received.is_none() {
            self.received = Some(reply);
        }
    }

    /// Invokes hooks registered for `reply.status`, without touching the
    /// recorded reply or the timer.
    pub(crate) fn fire_hooks(&mut self, reply: &Reply) {
        if let Some(hooks) = self.hooks.get_mut(&reply.status) {
            for hook in hooks.iter_mut() {
                hook(&reply.response);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use std::sync::{Arc as StdArc, Mutex};

    fn recorder() -> (StdArc<Mutex<Vec<String>>>, ReplyHook) {
        let log = StdArc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let hook: ReplyHook = Box::new(move |payload| {
            log2.lock()
                .unwrap()
                .push(payload.unbox::<serde_json::Value>().unwrap().to_string());
        });
        (log, hook)
    }

    #[test]
    fn receive_fires_immediately_for_an_already_recorded_reply() {
        let mut push = Push::new("echo", BoxedJson::null(), Duration::from_secs(1));
        push.resolve(Reply {
            status: ReplyStatus::Ok,
            response: BoxedJson::new(serde_json::json!({"a": 1})),
        });

        let (log, hook) = recorder();
        push.receive(ReplyStatus::Ok, hook);
        assert_eq!(log.lock().unwrap().as_slice(), [r#"{"a":1}"#]);
    }

    #[test]
    fn receive_fires_again_on_a_later_matching_resolve() {
        let mut push = Push::new("echo", BoxedJson::null(), Duration::from_secs(1));
        let (log, hook) = recorder();
        push.receive(ReplyStatus::Ok, hook);
        assert!(log.lock().unwrap().is_empty());

        push.resolve(Reply {
            status: ReplyStatus::Ok,
            response: BoxedJson::new(serde_json::json!({"a": 1})),
        });
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn late_reply_after_timeout_still_fires_hooks_but_keeps_recorded_timeout() {
        let mut push = Push::new("echo", BoxedJson::null(), Duration::from_secs(1));
        push.resolve(Reply::timeout());
        assert!(push.has_timed_out());

        let (log, hook) = recorder();
        push.receive(ReplyStatus::Ok, hook);
        push.resolve(Reply {
            status: ReplyStatus::Ok,
            response: BoxedJson::new(serde_json::json!({"late": true})),
        });

        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(push.has_timed_out(), "first-recorded reply is sticky");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_timer_fires_after_the_configured_duration() {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let mut push = Push::new("echo", BoxedJson::null(), Duration::from_millis(50));
        push.start_timeout("1".into(), Some("1".into()), &clock);

        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(push.poll_timeout(&mut cx), Poll::Pending);

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(push.poll_timeout(&mut cx), Poll::Ready(()));
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_resend_clears_ref_and_reply() {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let mut push = Push::new("echo", BoxedJson::null(), Duration::from_secs(1));
        push.start_timeout("1".into(), Some("1".into()), &clock);
        push.resolve(Reply {
            status: ReplyStatus::Ok,
            response: BoxedJson::null(),
        });

        push.prepare_resend(Some(Duration::from_secs(2)));
        assert_eq!(push.r#ref(), None);
        assert_eq!(push.received(), None);
        assert_eq!(push.timeout(), Duration::from_secs(2));
    }
}
