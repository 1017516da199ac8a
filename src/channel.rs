//! The per-topic join state machine, subscription table and push buffer
//! (spec section 4.3).
//!
//! A `Channel` never touches the transport or the serializer directly —
//! every operation that needs to emit a frame or mint a ref takes an
//! [`OutboundCtx`] built by [`crate::socket::Socket`] from its own fields.
//! This "borrow a context bundle instead of a back-reference" shape keeps
//! borrow-checking simple when one socket owns many channels at once.
//!
//! Reply correlation uses a direct `ref -> PushId` map rather than
//! synthesizing a `chan_reply_{ref}` subscription (spec section 9 notes
//! both designs are valid; this crate takes the direct-map alternative so
//! a push's reply never has to round-trip through the general subscription
//! table).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::task::Context as TaskContext;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::ChannelError;
use crate::json::{BoxedJson, Serializer};
use crate::message::{Message, Reply, ReplyStatus, PHX_CLOSE, PHX_ERROR, PHX_JOIN, PHX_LEAVE, PHX_REPLY};
use crate::push::{Push, ReplyHook};
use crate::refs::RefCounter;
use crate::scheduler::{Scheduler, TimerCalc};

/// A stable handle to a [`Push`] owned by a channel, decoupled from the
/// wire `ref` (which changes on every resend).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushId(u64);

/// A stable handle returned by [`Channel::on`], used to remove exactly one
/// subscription via [`Channel::off_subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Channel join state (spec section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Never joined, or joined and fully left.
    Closed,
    /// Join push sent, no reply yet.
    Joining,
    /// Join push replied `ok`.
    Joined,
    /// Leave push sent, no reply yet.
    Leaving,
    /// Join failed, rejected, or crashed after joining.
    Errored,
}

/// The pieces of [`crate::socket::Socket`] a channel operation needs,
/// borrowed for the duration of a single call.
pub(crate) struct OutboundCtx<'a> {
    pub ref_counter: &'a mut RefCounter,
    pub clock: &'a Arc<dyn Clock>,
    pub serializer: &'a dyn Serializer,
    pub send_buffer: &'a mut VecDeque<String>,
    pub connected: bool,
}

type OnMessageHook = Box<dyn FnMut(&str, BoxedJson) -> BoxedJson + Send>;

/// A client-side handle to a server-side topic subscription.
pub struct Channel {
    topic: String,
    params: BoxedJson,
    state: ChannelState,
    joined_once: bool,
    default_timeout: Duration,

    pushes: HashMap<PushId, Push>,
    next_push_id: u64,
    join_push_id: Option<PushId>,
    leave_push_id: Option<PushId>,
    reply_index: HashMap<String, PushId>,
    buffer: VecDeque<PushId>,

    subscriptions: HashMap<String, Vec<(SubscriptionId, ReplyHook)>>,
    next_subscription_id: u64,
    on_message: OnMessageHook,

    rejoin_scheduler: Scheduler,
    join_ref_cell: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.topic)
            .field("state", &self.state)
            .field("joined_once", &self.joined_once)
            .field("pushes", &self.pushes.len())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl Channel {
    /// Builds a channel that has not joined yet.
    pub(crate) fn new(
        topic: impl Into<String>,
        params: BoxedJson,
        default_timeout: Duration,
        clock: Arc<dyn Clock>,
        rejoin_after: TimerCalc,
    ) -> Self {
        Self {
            topic: topic.into(),
            params,
            state: ChannelState::Closed,
            joined_once: false,
            default_timeout,
            pushes: HashMap::new(),
            next_push_id: 0,
            join_push_id: None,
            leave_push_id: None,
            reply_index: HashMap::new(),
            buffer: VecDeque::new(),
            subscriptions: HashMap::new(),
            next_subscription_id: 0,
            on_message: Box::new(|_event, payload| payload),
            rejoin_scheduler: Scheduler::new(clock, rejoin_after),
            join_ref_cell: Arc::new(Mutex::new(None)),
        }
    }

    /// The topic this channel subscribes to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current join state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// The join push's current ref, i.e. this channel's join generation —
    /// `None` before the first successful `join()` call starts a push.
    pub fn join_ref(&self) -> Option<String> {
        self.current_join_ref()
    }

    /// A cell mirroring [`join_ref`](Self::join_ref), shared with
    /// [`crate::presence::Presence`] so it can observe join-generation
    /// changes without holding a reference to this channel.
    pub(crate) fn join_ref_cell(&self) -> Arc<Mutex<Option<String>>> {
        self.join_ref_cell.clone()
    }

    /// Overrides the default identity payload mapper.
    pub fn set_on_message(
        &mut self,
        hook: impl FnMut(&str, BoxedJson) -> BoxedJson + Send + 'static,
    ) {
        self.on_message = Box::new(hook);
    }

    /// Registers `cb` for `event`; returns a handle for later removal.
    /// Multiple subscriptions per event fire in insertion order.
    pub fn on(
        &mut self,
        event: impl Into<String>,
        cb: impl FnMut(&BoxedJson) + Send + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription_id);
        self.next_subscription_id += 1;
        self.subscriptions
            .entry(event.into())
            .or_default()
            .push((id, Box::new(cb)));
        id
    }

    /// Removes exactly the subscription `id` refers to.
    pub fn off_subscription(&mut self, id: SubscriptionId) {
        for subs in self.subscriptions.values_mut() {
            subs.retain(|(sid, _)| *sid != id);
        }
    }

    /// Removes every subscription registered for `event`.
    pub fn off_event(&mut self, event: &str) {
        self.subscriptions.remove(event);
    }

    /// Sends the join push. Single-shot: a channel instance may join at
    /// most once (spec section 3's invariant).
    pub(crate) fn join(&mut self, ctx: &mut OutboundCtx<'_>) -> Result<PushId, ChannelError> {
        if self.joined_once {
            return Err(ChannelError::AlreadyJoined {
                topic: self.topic.clone(),
            });
        }
        tracing::debug!(topic = %self.topic, "joining channel");
        self.joined_once = true;
        self.state = ChannelState::Joining;

        let id = self.alloc_push_id();
        self.pushes.insert(
            id,
            Push::new(PHX_JOIN, self.params.clone(), self.default_timeout),
        );
        self.join_push_id = Some(id);
        self.start_push(id, ctx);
        self.transmit(id, ctx);
        Ok(id)
    }

    /// Sends an application push. Requires a prior `join()` call, but not
    /// that the join has completed — the push buffers until `Joined`.
    pub fn push(
        &mut self,
        event: impl Into<String>,
        payload: BoxedJson,
        timeout: Option<Duration>,
        ctx: &mut OutboundCtx<'_>,
    ) -> Result<PushId, ChannelError> {
        let event = event.into();
        if !self.joined_once {
            return Err(ChannelError::NotJoinedYet {
                topic: self.topic.clone(),
                event,
            });
        }

        let push = Push::new(event, payload, timeout.unwrap_or(self.default_timeout));
        let id = self.alloc_push_id();
        self.pushes.insert(id, push);
        self.start_push(id, ctx);

        if self.state == ChannelState::Joined {
            self.transmit(id, ctx);
        } else {
            self.buffer.push_back(id);
        }
        Ok(id)
    }

    /// Registers `cb` to fire when the push identified by `id` receives a
    /// reply with the given `status`.
    pub fn receive(
        &mut self,
        id: PushId,
        status: ReplyStatus,
        cb: ReplyHook,
    ) {
        if let Some(push) = self.pushes.get_mut(&id) {
            push.receive(status, cb);
        }
    }

    /// Leaves the channel. A no-op if already leaving.
    pub(crate) fn leave(&mut self, ctx: &mut OutboundCtx<'_>) -> PushId {
        if self.state == ChannelState::Leaving {
            return self
                .leave_push_id
                .expect("state Leaving implies a leave push was created");
        }

        if let Some(join_id) = self.join_push_id {
            if let Some(push) = self.pushes.get_mut(&join_id) {
                push.cancel_timeout();
            }
        }

        self.state = ChannelState::Leaving;
        self.rejoin_scheduler.reset();

        let id = self.alloc_push_id();
        self.pushes.insert(
            id,
            Push::new(PHX_LEAVE, BoxedJson::empty_object(), self.default_timeout),
        );
        self.leave_push_id = Some(id);
        self.start_push(id, ctx);
        self.transmit(id, ctx);
        id
    }

    /// Re-sends the join push with a fresh ref. No-op while `Leaving`.
    pub(crate) fn rejoin(&mut self, ctx: &mut OutboundCtx<'_>) {
        if self.state == ChannelState::Leaving {
            return;
        }
        let id = match self.join_push_id {
            Some(id) => id,
            None => return,
        };
        self.state = ChannelState::Joining;
        self.start_push(id, ctx);
        self.transmit(id, ctx);
    }

    /// Polls the rejoin backoff timer. Returns `true` at most once per
    /// [`Scheduler::schedule_timeout`] call, when the channel is connected
    /// and due for a rejoin attempt. The caller — [`crate::socket::Socket`]
    /// — must run its own `leaveOpenTopic` sweep for this channel's topic
    /// before calling [`rejoin`](Self::rejoin) off the back of a `true`
    /// result, since a channel can't see its siblings on the same topic.
    pub(crate) fn poll_rejoin_ready(&mut self, cx: &mut TaskContext<'_>, connected: bool) -> bool {
        self.rejoin_scheduler.poll_fire(cx).is_ready() && connected
    }

    /// Called once per poll tick per outstanding push to drive reply
    /// timeouts.
    pub(crate) fn poll_push_timeouts(&mut self, cx: &mut TaskContext<'_>, ctx: &mut OutboundCtx<'_>) {
        let timed_out: Vec<PushId> = self
            .pushes
            .iter_mut()
            .filter_map(|(id, push)| push.poll_timeout(cx).is_ready().then_some(*id))
            .collect();
        for id in timed_out {
            self.resolve_timeout(id, ctx);
        }
    }

    fn resolve_timeout(&mut self, id: PushId, ctx: &mut OutboundCtx<'_>) {
        if let Some(r#ref) = self.pushes.get(&id).and_then(|p| p.r#ref()).map(str::to_owned) {
            self.reply_index.remove(&r#ref);
        }
        if Some(id) == self.join_push_id {
            if let Some(push) = self.pushes.get_mut(&id) {
                push.resolve(Reply::timeout());
            }
            tracing::warn!(topic = %self.topic, "join timed out");
            self.handle_join_timeout(id, ctx);
        } else if let Some(push) = self.pushes.get_mut(&id) {
            push.resolve(Reply::timeout());
        }
    }

    /// Fans an inbound message in for this channel: applies the payload
    /// hook, runs any protocol side effect, then dispatches to
    /// subscriptions registered for `message.event`.
    pub(crate) fn trigger(
        &mut self,
        message: Message,
        ctx: &mut OutboundCtx<'_>,
    ) -> Result<(), ChannelError> {
        let payload = self.apply_on_message(&message.event, message.payload)?;

        match message.event.as_str() {
            PHX_REPLY => {
                if let Some(r#ref) = message.r#ref.as_deref() {
                    if let Some(reply) = Reply::from_payload(&payload) {
                        self.handle_reply(r#ref, reply, ctx);
                    }
                }
            }
            PHX_CLOSE if self.state == ChannelState::Leaving => {
                self.finish_close();
            }
            PHX_ERROR
                if matches!(self.state, ChannelState::Joined | ChannelState::Joining) =>
            {
                self.handle_phx_error(ctx);
            }
            _ => {}
        }

        self.dispatch(&message.event, &payload);
        Ok(())
    }

    /// Reports whether `message` belongs to this channel: exact topic
    /// match, and (if the message carries a joinRef) it must match this
    /// channel's current join generation (spec section 4.2's `isMember`).
    pub(crate) fn is_member(&self, message: &Message) -> bool {
        if message.topic != self.topic {
            return false;
        }
        match &message.join_ref {
            None => true,
            Some(incoming) => self.current_join_ref().as_deref() == Some(incoming.as_str()),
        }
    }

    /// Called when the socket observes transport open: resets the rejoin
    /// backoff. Returns `true` if this channel had errored and is due to
    /// rejoin immediately, in which case the caller must run its own
    /// `leaveOpenTopic` sweep for this channel's topic before calling
    /// [`rejoin`](Self::rejoin) — see [`poll_rejoin_ready`](Self::poll_rejoin_ready).
    pub(crate) fn prepare_for_socket_open(&mut self) -> bool {
        self.rejoin_scheduler.reset();
        self.state == ChannelState::Errored
    }

    /// Called when the socket observes a transport-level error, for every
    /// channel not `Leaving`/`Closed`.
    pub(crate) fn on_socket_error(&mut self) {
        if !matches!(self.state, ChannelState::Leaving | ChannelState::Closed) {
            self.rejoin_scheduler.reset();
        }
    }

    /// Synthesizes the `phx_error` transition the socket fires on every
    /// eligible channel when the transport closes uncleanly.
    pub(crate) fn on_socket_close(&mut self, ctx: &mut OutboundCtx<'_>) {
        if matches!(self.state, ChannelState::Joined | ChannelState::Joining) {
            self.handle_phx_error(ctx);
        }
    }

    fn handle_reply(&mut self, r#ref: &str, reply: Reply, ctx: &mut OutboundCtx<'_>) {
        let Some(push_id) = self.reply_index.remove(r#ref) else {
            return;
        };
        if Some(push_id) == self.join_push_id {
            self.handle_join_reply(push_id, reply, ctx);
        } else if Some(push_id) == self.leave_push_id {
            self.handle_leave_reply(push_id, reply);
        } else if let Some(push) = self.pushes.get_mut(&push_id) {
            push.resolve(reply);
        }
    }

    fn handle_join_reply(&mut self, push_id: PushId, reply: Reply, ctx: &mut OutboundCtx<'_>) {
        let status = reply.status;
        if let Some(push) = self.pushes.get_mut(&push_id) {
            push.resolve(reply);
        }
        match status {
            ReplyStatus::Ok => {
                tracing::debug!(topic = %self.topic, "joined channel");
                self.state = ChannelState::Joined;
                self.rejoin_scheduler.reset();
                self.flush_buffer(ctx);
            }
            ReplyStatus::Error => {
                tracing::warn!(topic = %self.topic, "join rejected by server");
                self.state = ChannelState::Errored;
                if ctx.connected {
                    self.rejoin_scheduler.schedule_timeout();
                }
            }
            ReplyStatus::Timeout => {
                tracing::warn!(topic = %self.topic, "join timed out");
                self.handle_join_timeout(push_id, ctx);
            }
        }
    }

    /// Shared fallout from a join push resolving as `timeout`, whether the
    /// timeout was synthesized by the local timer ([`resolve_timeout`]) or
    /// arrived via `handle_join_reply` (spec §6 notes a `phx_reply` is
    /// never actually sent with `status: "timeout"`, so only the former
    /// path is reachable on the wire, but both route through here).
    /// Transitions to `Errored`, sends a defensive `phx_leave` so the
    /// server drops any partial join state, resets the join push so it can
    /// be resent fresh, and schedules a rejoin per spec §4.3.
    fn handle_join_timeout(&mut self, push_id: PushId, ctx: &mut OutboundCtx<'_>) {
        self.state = ChannelState::Errored;
        self.send_best_effort_leave(ctx);
        if let Some(push) = self.pushes.get_mut(&push_id) {
            push.cancel_timeout();
            push.prepare_resend(None);
        }
        if ctx.connected {
            self.rejoin_scheduler.schedule_timeout();
        }
    }

    fn handle_leave_reply(&mut self, push_id: PushId, reply: Reply) {
        if let Some(push) = self.pushes.get_mut(&push_id) {
            push.resolve(reply.clone());
        }
        if matches!(reply.status, ReplyStatus::Ok | ReplyStatus::Timeout) {
            self.finish_close();
        }
    }

    fn handle_phx_error(&mut self, ctx: &mut OutboundCtx<'_>) {
        tracing::warn!(topic = %self.topic, "channel errored");
        if self.state == ChannelState::Joining {
            if let Some(id) = self.join_push_id {
                if let Some(push) = self.pushes.get_mut(&id) {
                    push.cancel_timeout();
                }
            }
        }
        self.state = ChannelState::Errored;
        if ctx.connected {
            self.rejoin_scheduler.schedule_timeout();
        }
    }

    fn finish_close(&mut self) {
        self.state = ChannelState::Closed;
        self.rejoin_scheduler.reset();
    }

    fn flush_buffer(&mut self, ctx: &mut OutboundCtx<'_>) {
        let buffered: Vec<PushId> = self.buffer.drain(..).collect();
        for id in buffered {
            self.transmit(id, ctx);
        }
    }

    fn send_best_effort_leave(&mut self, ctx: &mut OutboundCtx<'_>) {
        let message = Message::new(
            self.current_join_ref(),
            None,
            self.topic.clone(),
            PHX_LEAVE,
            BoxedJson::empty_object(),
        );
        if let Ok(raw) = ctx.serializer.serialize(&message) {
            ctx.send_buffer.push_back(raw);
        }
    }

    fn apply_on_message(
        &mut self,
        event: &str,
        payload: BoxedJson,
    ) -> Result<BoxedJson, ChannelError> {
        let was_null = payload.is_null();
        let transformed = (self.on_message)(event, payload);
        if !was_null && transformed.is_null() {
            return Err(ChannelError::OnMessageDroppedPayload {
                topic: self.topic.clone(),
            });
        }
        Ok(transformed)
    }

    fn dispatch(&mut self, event: &str, payload: &BoxedJson) {
        if let Some(subs) = self.subscriptions.get_mut(event) {
            for (_, cb) in subs.iter_mut() {
                cb(payload);
            }
        }
    }

    fn start_push(&mut self, id: PushId, ctx: &mut OutboundCtx<'_>) {
        let r#ref = ctx.ref_counter.next();
        let join_ref = if Some(id) == self.join_push_id {
            Some(r#ref.clone())
        } else {
            self.current_join_ref()
        };
        if let Some(push) = self.pushes.get_mut(&id) {
            push.start_timeout(r#ref.clone(), join_ref, ctx.clock);
        }
        self.reply_index.insert(r#ref, id);
        if Some(id) == self.join_push_id {
            self.sync_join_ref_cell();
        }
    }

    fn transmit(&mut self, id: PushId, ctx: &mut OutboundCtx<'_>) {
        let Some(push) = self.pushes.get(&id) else {
            return;
        };
        if push.has_timed_out() {
            return;
        }
        let message = Message::new(
            self.current_join_ref(),
            push.r#ref().map(str::to_owned),
            self.topic.clone(),
            push.event().to_owned(),
            push.payload().clone(),
        );
        if let Ok(raw) = ctx.serializer.serialize(&message) {
            ctx.send_buffer.push_back(raw);
        }
    }

    fn current_join_ref(&self) -> Option<String> {
        self.join_push_id
            .and_then(|id| self.pushes.get(&id))
            .and_then(|push| push.r#ref().map(str::to_owned))
    }

    fn sync_join_ref_cell(&self) {
        *self.join_ref_cell.lock().expect("lock poisoned") = self.current_join_ref();
    }

    fn alloc_push_id(&mut self) -> PushId {
        let id = PushId(self.next_push_id);
        self.next_push_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::json::V2Serializer;
    use crate::scheduler::default_rejoin_after;
    use std::sync::{Arc as StdArc, Mutex as StdMutex};

    struct Harness {
        refs: RefCounter,
        clock: Arc<dyn Clock>,
        serializer: V2Serializer,
        send_buffer: VecDeque<String>,
        connected: bool,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                refs: RefCounter::default(),
                clock: Arc::new(TokioClock),
                serializer: V2Serializer,
                send_buffer: VecDeque::new(),
                connected: true,
            }
        }

        fn ctx(&mut self) -> OutboundCtx<'_> {
            OutboundCtx {
                ref_counter: &mut self.refs,
                clock: &self.clock,
                serializer: &self.serializer,
                send_buffer: &mut self.send_buffer,
                connected: self.connected,
            }
        }
    }

    fn new_channel(harness: &Harness) -> Channel {
        Channel::new(
            "room:lobby",
            BoxedJson::new(serde_json::json!({"token": "t"})),
            Duration::from_secs(10),
            harness.clock.clone(),
            Arc::new(default_rejoin_after),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn join_sends_frame_and_transitions_on_ok_reply() {
        let mut harness = Harness::new();
        let mut channel = new_channel(&harness);

        channel.join(&mut harness.ctx()).unwrap();
        assert_eq!(
            harness.send_buffer.pop_front().unwrap(),
            r#"["1","1","room:lobby","phx_join",{"token":"t"}]"#
        );
        assert_eq!(channel.state(), ChannelState::Joining);

        let reply = BoxedJson::new(serde_json::json!({"status": "ok", "response": {}}));
        let message = Message::new(Some("1".into()), Some("1".into()), "room:lobby", PHX_REPLY, reply);
        channel.trigger(message, &mut harness.ctx()).unwrap();

        assert_eq!(channel.state(), ChannelState::Joined);
        assert_eq!(channel.join_ref().as_deref(), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn push_before_joined_buffers_then_flushes() {
        let mut harness = Harness::new();
        let mut channel = new_channel(&harness);

        channel.join(&mut harness.ctx()).unwrap();
        harness.send_buffer.clear();

        channel
            .push("echo", BoxedJson::new(serde_json::json!({"a": 1})), None, &mut harness.ctx())
            .unwrap();
        assert!(harness.send_buffer.is_empty(), "buffers until Joined");

        let reply = BoxedJson::new(serde_json::json!({"status": "ok", "response": {}}));
        let message = Message::new(Some("1".into()), Some("1".into()), "room:lobby", PHX_REPLY, reply);
        channel.trigger(message, &mut harness.ctx()).unwrap();

        assert_eq!(
            harness.send_buffer.pop_front().unwrap(),
            r#"["1","2","room:lobby","echo",{"a":1}]"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn push_before_join_called_is_rejected() {
        let mut harness = Harness::new();
        let mut channel = new_channel(&harness);
        let err = channel
            .push("echo", BoxedJson::null(), None, &mut harness.ctx())
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotJoinedYet { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn joining_twice_is_an_error() {
        let mut harness = Harness::new();
        let mut channel = new_channel(&harness);
        channel.join(&mut harness.ctx()).unwrap();
        let err = channel.join(&mut harness.ctx()).unwrap_err();
        assert!(matches!(err, ChannelError::AlreadyJoined { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn join_timeout_errors_and_sends_best_effort_leave() {
        let mut harness = Harness::new();
        let mut channel = new_channel(&harness);
        channel.join(&mut harness.ctx()).unwrap();
        harness.send_buffer.clear();

        let waker = futures::task::noop_waker();
        let mut cx = TaskContext::from_waker(&waker);

        tokio::time::advance(Duration::from_secs(10)).await;
        channel.poll_push_timeouts(&mut cx, &mut harness.ctx());

        assert_eq!(channel.state(), ChannelState::Errored);
        assert_eq!(
            harness.send_buffer.pop_front().unwrap(),
            r#"["1",null,"room:lobby","phx_leave",{}]"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn receive_fires_for_already_resolved_push() {
        let mut harness = Harness::new();
        let mut channel = new_channel(&harness);
        let id = channel.join(&mut harness.ctx()).unwrap();

        let reply = BoxedJson::new(serde_json::json!({"status": "ok", "response": {"x": 1}}));
        let message = Message::new(Some("1".into()), Some("1".into()), "room:lobby", PHX_REPLY, reply);
        channel.trigger(message, &mut harness.ctx()).unwrap();

        let log = StdArc::new(StdMutex::new(Vec::new()));
        let log2 = log.clone();
        channel.receive(
            id,
            ReplyStatus::Ok,
            Box::new(move |payload| {
                log2.lock().unwrap().push(payload.clone());
            }),
        );
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn is_member_rejects_mismatched_join_ref() {
        let harness = Harness::new();
        let channel = new_channel(&harness);
        let msg = Message::new(Some("99".into()), None, "room:lobby", "custom", BoxedJson::null());
        assert!(!channel.is_member(&msg), "no join yet means joinRef never matches a non-null incoming one");

        let other_topic = Message::new(None, None, "room:other", "custom", BoxedJson::null());
        assert!(!channel.is_member(&other_topic));
    }
}
