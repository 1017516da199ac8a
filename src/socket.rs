//! Transport lifecycle, heartbeat, reconnect, multiplexing and the send
//! buffer (spec section 4.2) — the component that drives every
//! [`crate::channel::Channel`] it owns.
//!
//! `Socket::poll` is the crate's single entry point: it owns a `State` enum
//! over the transport and loops until it has a [`SocketEvent`] to report or
//! genuinely nothing left to do. It also owns a `HashMap<ChannelId, Channel>`
//! and fans dispatch out across every channel it's holding.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use url::Url;

use crate::channel::{Channel, ChannelState, OutboundCtx, PushId};
use crate::clock::{Clock, TokioClock};
use crate::endpoint::Endpoint;
use crate::error::ChannelError;
use crate::json::{BoxedJson, Serializer, V2Serializer};
use crate::message::{Message, ReplyStatus, HEARTBEAT_EVENT, HEARTBEAT_TOPIC, PHX_JOIN};
use crate::push::ReplyHook;
use crate::refs::RefCounter;
use crate::scheduler::{default_reconnect_after, default_rejoin_after, Scheduler, TimerCalc};
use crate::transport::{Transport, TransportEvent, TransportFactory};

/// A stable handle to a [`Channel`] owned by a [`Socket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

/// Socket-level configuration (spec section 4.2).
pub struct SocketConfig {
    /// Default push timeout, used by every channel unless overridden per push.
    pub timeout: Duration,
    /// Client-to-server heartbeat cadence. `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Backoff schedule for transport reconnect.
    pub reconnect_after: TimerCalc,
    /// Backoff schedule for channel rejoin.
    pub rejoin_after: TimerCalc,
    /// Wire protocol version, appended as the `vsn` query parameter.
    pub vsn: String,
    /// Connect-time query parameters (e.g. an auth token).
    pub params: Vec<(String, String)>,
    /// The wire codec.
    pub serializer: Arc<dyn Serializer>,
    /// The delayed-execution source for every timer this socket owns.
    pub clock: Arc<dyn Clock>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            heartbeat_interval: None,
            reconnect_after: Arc::new(default_reconnect_after),
            rejoin_after: Arc::new(default_rejoin_after),
            vsn: "2.0.0".to_string(),
            params: Vec::new(),
            serializer: Arc::new(V2Serializer),
            clock: Arc::new(TokioClock),
        }
    }
}

/// Events a [`Socket`] surfaces to its driving application, mirroring the
/// callbacks spec section 4.2 lists plus a non-fatal `Hiccup` for transient
/// failures worth logging but not worth ending the poll loop over.
#[derive(Debug)]
pub enum SocketEvent {
    /// Transport finished connecting.
    Open,
    /// Transport closed, cleanly or not.
    Close {
        /// Close code, if known.
        code: Option<u16>,
        /// Close reason, if known.
        reason: Option<String>,
    },
    /// The transport reported an error that doesn't by itself close the
    /// connection (the close, if any, is reported separately).
    Error(anyhow::Error),
    /// A frame was received and fanned out to member channels.
    Message(Message),
    /// A transient, non-fatal condition: a failed connect attempt, a
    /// malformed inbound frame, or an `onMessage` hook rejecting a payload.
    Hiccup(anyhow::Error),
}

enum TransportLifecycle<T: Transport> {
    Disconnected,
    Connecting(BoxFuture<'static, Result<T, anyhow::Error>>),
    Connected(T),
    Closing {
        transport: T,
        code: Option<u16>,
        reason: Option<String>,
        reconnect_on_finish: bool,
    },
}

struct Heartbeat {
    period: Option<Duration>,
    interval: Option<tokio::time::Interval>,
    pending_ref: Option<String>,
}

impl Heartbeat {
    fn new(period: Option<Duration>) -> Self {
        Self {
            period,
            interval: None,
            pending_ref: None,
        }
    }

    fn reset(&mut self) {
        self.pending_ref = None;
        self.interval = self.period.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });
    }

    fn cancel(&mut self) {
        self.interval = None;
        self.pending_ref = None;
    }

    /// Clears `pending_ref` if it matches `r#ref`. Returns whether it matched.
    fn acknowledge(&mut self, r#ref: &str) -> bool {
        if self.pending_ref.as_deref() == Some(r#ref) {
            self.pending_ref = None;
            true
        } else {
            false
        }
    }

    fn poll(
        &mut self,
        cx: &mut Context<'_>,
        send_buffer: &mut VecDeque<String>,
        ref_counter: &mut RefCounter,
        serializer: &dyn Serializer,
    ) -> Option<ConnectedOutcome> {
        let interval = self.interval.as_mut()?;
        if interval.poll_tick(cx).is_pending() {
            return None;
        }
        if self.pending_ref.take().is_some() {
            return Some(ConnectedOutcome::HeartbeatTimeout);
        }
        let r#ref = ref_counter.next();
        let message = Message::new(
            None,
            Some(r#ref.clone()),
            HEARTBEAT_TOPIC,
            HEARTBEAT_EVENT,
            BoxedJson::null(),
        );
        if let Ok(raw) = serializer.serialize(&message) {
            send_buffer.push_back(raw);
        }
        self.pending_ref = Some(r#ref);
        None
    }
}

enum ConnectedOutcome {
    Inbound(String),
    Closed(Option<u16>, Option<String>),
    TransportError(anyhow::Error),
    HeartbeatTimeout,
}

fn drive_connected<T: Transport>(
    transport: &mut T,
    cx: &mut Context<'_>,
    send_buffer: &mut VecDeque<String>,
    heartbeat: &mut Heartbeat,
    ref_counter: &mut RefCounter,
    serializer: &dyn Serializer,
) -> Option<ConnectedOutcome> {
    while !send_buffer.is_empty() {
        match transport.poll_send_ready(cx) {
            Poll::Ready(Ok(())) => {
                let raw = send_buffer.pop_front().expect("checked non-empty");
                if let Err(err) = transport.start_send(raw) {
                    return Some(ConnectedOutcome::TransportError(err));
                }
            }
            Poll::Ready(Err(err)) => return Some(ConnectedOutcome::TransportError(err)),
            Poll::Pending => break,
        }
    }
    if let Poll::Ready(Err(err)) = transport.poll_flush(cx) {
        return Some(ConnectedOutcome::TransportError(err));
    }

    if let Some(outcome) = heartbeat.poll(cx, send_buffer, ref_counter, serializer) {
        return Some(outcome);
    }

    match transport.poll_next_event(cx) {
        Poll::Ready(Some(Ok(TransportEvent::Text(raw)))) => Some(ConnectedOutcome::Inbound(raw)),
        Poll::Ready(Some(Ok(TransportEvent::Closed { code, reason }))) => {
            Some(ConnectedOutcome::Closed(code, reason))
        }
        Poll::Ready(Some(Err(err))) => Some(ConnectedOutcome::TransportError(err)),
        Poll::Ready(None) => Some(ConnectedOutcome::Closed(None, None)),
        Poll::Pending => None,
    }
}

const MAX_DISCONNECT_TRIES: u32 = 5;

fn disconnect_backoff(tries: u32) -> Duration {
    Duration::from_millis(150 * tries as u64)
}

/// The socket: one WebSocket connection multiplexing any number of
/// channels (spec section 2).
pub struct Socket<T: Transport> {
    endpoint: Endpoint,
    factory: Arc<dyn TransportFactory<T>>,
    config: SocketConfig,

    transport: TransportLifecycle<T>,
    channels: HashMap<ChannelId, Channel>,
    next_channel_id: u64,

    ref_counter: RefCounter,
    send_buffer: VecDeque<String>,
    heartbeat: Heartbeat,
    reconnect_scheduler: Scheduler,
    disconnect_scheduler: Scheduler,

    connected: bool,
    close_was_clean: bool,
}

impl<T: Transport> Socket<T> {
    /// Builds a socket that hasn't started connecting.
    pub fn new(endpoint: Endpoint, factory: Arc<dyn TransportFactory<T>>, config: SocketConfig) -> Self {
        let heartbeat = Heartbeat::new(config.heartbeat_interval);
        let reconnect_scheduler = Scheduler::new(config.clock.clone(), config.reconnect_after.clone());
        let disconnect_scheduler = Scheduler::new(config.clock.clone(), Arc::new(disconnect_backoff));
        Self {
            endpoint,
            factory,
            config,
            transport: TransportLifecycle::Disconnected,
            channels: HashMap::new(),
            next_channel_id: 0,
            ref_counter: RefCounter::default(),
            send_buffer: VecDeque::new(),
            heartbeat,
            reconnect_scheduler,
            disconnect_scheduler,
            connected: false,
            close_was_clean: false,
        }
    }

    /// Whether the transport is currently open.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether the most recent close was requested via [`disconnect`](Self::disconnect).
    pub fn close_was_clean(&self) -> bool {
        self.close_was_clean
    }

    /// Begins connecting. Idempotent while a transport already exists.
    pub fn connect(&mut self) {
        if !matches!(self.transport, TransportLifecycle::Disconnected) {
            return;
        }
        let url = self.connect_url();
        tracing::debug!(%url, "connecting to socket");
        self.close_was_clean = false;
        self.transport = TransportLifecycle::Connecting(self.factory.connect(url));
    }

    /// Initiates a graceful disconnect. Subsequent transport close will not
    /// trigger a reconnect.
    pub fn disconnect(&mut self, code: Option<u16>, reason: Option<String>) {
        tracing::info!(?code, ?reason, "disconnecting socket");
        self.close_was_clean = true;
        self.reconnect_scheduler.reset();
        if matches!(self.transport, TransportLifecycle::Connected(_)) {
            let TransportLifecycle::Connected(transport) =
                std::mem::replace(&mut self.transport, TransportLifecycle::Disconnected)
            else {
                unreachable!("just matched Connected");
            };
            self.transport = TransportLifecycle::Closing {
                transport,
                code,
                reason,
                reconnect_on_finish: false,
            };
            self.disconnect_scheduler.reset();
            self.disconnect_scheduler.schedule_timeout();
        }
    }

    /// Registers a new channel for `topic`. The channel doesn't join until
    /// [`Socket::join`] is called with the returned handle.
    pub fn channel(&mut self, topic: impl Into<String>, params: BoxedJson) -> ChannelId {
        let id = ChannelId(self.next_channel_id);
        self.next_channel_id += 1;
        let channel = Channel::new(
            topic,
            params,
            self.config.timeout,
            self.config.clock.clone(),
            self.config.rejoin_after.clone(),
        );
        self.channels.insert(id, channel);
        id
    }

    /// Joins the channel identified by `id`, first leaving any other
    /// channel already `Joined`/`Joining` on the same topic (spec section
    /// 4.2's duplicate-topic handling applies to the initial join too).
    pub fn join(&mut self, id: ChannelId) -> Result<PushId, ChannelError> {
        self.leave_open_topic_except(id);
        let connected = self.connected;
        let Some(channel) = self.channels.get_mut(&id) else {
            return Err(ChannelError::NotJoinedYet {
                topic: "<unknown channel>".to_string(),
                event: PHX_JOIN.to_string(),
            });
        };
        let mut ctx = OutboundCtx {
            ref_counter: &mut self.ref_counter,
            clock: &self.config.clock,
            serializer: self.config.serializer.as_ref(),
            send_buffer: &mut self.send_buffer,
            connected,
        };
        channel.join(&mut ctx)
    }

    /// Leaves the channel identified by `id`. A no-op for an unknown or
    /// already-leaving handle.
    pub fn leave(&mut self, id: ChannelId) {
        let connected = self.connected;
        if let Some(channel) = self.channels.get_mut(&id) {
            let mut ctx = OutboundCtx {
                ref_counter: &mut self.ref_counter,
                clock: &self.config.clock,
                serializer: self.config.serializer.as_ref(),
                send_buffer: &mut self.send_buffer,
                connected,
            };
            channel.leave(&mut ctx);
        }
    }

    /// Pushes an application event on channel `id`.
    pub fn push(
        &mut self,
        id: ChannelId,
        event: impl Into<String>,
        payload: BoxedJson,
        timeout: Option<Duration>,
    ) -> Result<PushId, ChannelError> {
        let connected = self.connected;
        let event = event.into();
        let Some(channel) = self.channels.get_mut(&id) else {
            return Err(ChannelError::NotJoinedYet {
                topic: "<unknown channel>".to_string(),
                event,
            });
        };
        let mut ctx = OutboundCtx {
            ref_counter: &mut self.ref_counter,
            clock: &self.config.clock,
            serializer: self.config.serializer.as_ref(),
            send_buffer: &mut self.send_buffer,
            connected,
        };
        channel.push(event, payload, timeout, &mut ctx)
    }

    /// Registers a reply hook for a push previously returned by [`push`](Self::push).
    pub fn receive(&mut self, channel_id: ChannelId, push_id: PushId, status: ReplyStatus, cb: ReplyHook) {
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.receive(push_id, status, cb);
        }
    }

    /// Subscribes to `event` on channel `id`.
    pub fn on(
        &mut self,
        id: ChannelId,
        event: impl Into<String>,
        cb: impl FnMut(&BoxedJson) + Send + 'static,
    ) -> Option<crate::channel::SubscriptionId> {
        self.channels.get_mut(&id).map(|channel| channel.on(event, cb))
    }

    /// Gives read access to a channel, e.g. to inspect its state.
    pub fn channel_ref(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    /// Drives the entire socket forward. Call this repeatedly from the
    /// host's own executor; it never blocks and never spawns.
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<SocketEvent> {
        loop {
            self.poll_channel_timers(cx);
            self.prune_closed_channels();

            match &mut self.transport {
                TransportLifecycle::Disconnected => {
                    if self.reconnect_scheduler.poll_fire(cx).is_ready() {
                        self.transport =
                            TransportLifecycle::Connecting(self.factory.connect(self.connect_url()));
                        continue;
                    }
                    return Poll::Pending;
                }
                TransportLifecycle::Connecting(fut) => match fut.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(transport)) => {
                        self.transport = TransportLifecycle::Connected(transport);
                        return Poll::Ready(self.handle_open());
                    }
                    Poll::Ready(Err(err)) => {
                        tracing::debug!(error = %err, "connect attempt failed, scheduling retry");
                        self.transport = TransportLifecycle::Disconnected;
                        self.reconnect_scheduler.schedule_timeout();
                        return Poll::Ready(SocketEvent::Hiccup(err));
                    }
                },
                TransportLifecycle::Closing { .. } => {
                    if let Some(event) = self.drive_closing(cx) {
                        return Poll::Ready(event);
                    }
                    return Poll::Pending;
                }
                TransportLifecycle::Connected(transport) => {
                    let outcome = drive_connected(
                        transport,
                        cx,
                        &mut self.send_buffer,
                        &mut self.heartbeat,
                        &mut self.ref_counter,
                        self.config.serializer.as_ref(),
                    );
                    match outcome {
                        None => return Poll::Pending,
                        Some(ConnectedOutcome::Inbound(raw)) => {
                            return Poll::Ready(self.handle_inbound(raw))
                        }
                        Some(ConnectedOutcome::Closed(code, reason)) => {
                            self.transport = TransportLifecycle::Disconnected;
                            return Poll::Ready(self.handle_close(code, reason, false));
                        }
                        Some(ConnectedOutcome::TransportError(err)) => {
                            return Poll::Ready(self.handle_transport_error(err))
                        }
                        Some(ConnectedOutcome::HeartbeatTimeout) => {
                            return Poll::Ready(self.handle_heartbeat_timeout())
                        }
                    }
                }
            }
        }
    }

    fn connect_url(&self) -> Url {
        self.endpoint.to_url(
            self.config
                .params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
            &self.config.vsn,
        )
    }

    fn leave_open_topic_except(&mut self, keep: ChannelId) {
        let Some(topic) = self.channels.get(&keep).map(|c| c.topic().to_owned()) else {
            return;
        };
        let ids: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(id, channel)| {
                **id != keep
                    && channel.topic() == topic
                    && matches!(channel.state(), ChannelState::Joined | ChannelState::Joining)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.leave(id);
        }
    }

    fn poll_channel_timers(&mut self, cx: &mut Context<'_>) {
        let connected = self.connected;
        let ready_to_rejoin: Vec<ChannelId> = self
            .channels
            .iter_mut()
            .filter_map(|(id, channel)| channel.poll_rejoin_ready(cx, connected).then_some(*id))
            .collect();
        for id in ready_to_rejoin {
            self.rejoin_channel(id);
        }

        let connected = self.connected;
        for channel in self.channels.values_mut() {
            let mut ctx = OutboundCtx {
                ref_counter: &mut self.ref_counter,
                clock: &self.config.clock,
                serializer: self.config.serializer.as_ref(),
                send_buffer: &mut self.send_buffer,
                connected,
            };
            channel.poll_push_timeouts(cx, &mut ctx);
        }
    }

    /// Runs `leaveOpenTopic` for `id`'s topic, then resends its join push.
    /// A channel can't see its siblings, so the socket — the only thing
    /// that holds every channel — is responsible for clearing out any
    /// other `Joined`/`Joining` channel on the same topic before a rejoin
    /// goes out (spec §4.3).
    fn rejoin_channel(&mut self, id: ChannelId) {
        self.leave_open_topic_except(id);
        let connected = self.connected;
        if let Some(channel) = self.channels.get_mut(&id) {
            let mut ctx = OutboundCtx {
                ref_counter: &mut self.ref_counter,
                clock: &self.config.clock,
                serializer: self.config.serializer.as_ref(),
                send_buffer: &mut self.send_buffer,
                connected,
            };
            channel.rejoin(&mut ctx);
        }
    }

    fn prune_closed_channels(&mut self) {
        self.channels.retain(|_, c| c.state() != ChannelState::Closed);
    }

    fn handle_open(&mut self) -> SocketEvent {
        tracing::info!("socket connected");
        self.close_was_clean = false;
        self.connected = true;
        self.reconnect_scheduler.reset();
        self.heartbeat.reset();
        let ready_to_rejoin: Vec<ChannelId> = self
            .channels
            .iter_mut()
            .filter_map(|(id, channel)| channel.prepare_for_socket_open().then_some(*id))
            .collect();
        for id in ready_to_rejoin {
            self.rejoin_channel(id);
        }
        SocketEvent::Open
    }

    fn handle_close(&mut self, code: Option<u16>, reason: Option<String>, force_reconnect: bool) -> SocketEvent {
        tracing::info!(?code, ?reason, clean = self.close_was_clean, "socket closed");
        self.connected = false;
        self.heartbeat.cancel();
        for channel in self.channels.values_mut() {
            let mut ctx = OutboundCtx {
                ref_counter: &mut self.ref_counter,
                clock: &self.config.clock,
                serializer: self.config.serializer.as_ref(),
                send_buffer: &mut self.send_buffer,
                connected: false,
            };
            channel.on_socket_close(&mut ctx);
        }
        let abnormal = !self.close_was_clean && code != Some(1000);
        if force_reconnect || abnormal {
            self.reconnect_scheduler.schedule_timeout();
        }
        SocketEvent::Close { code, reason }
    }

    fn handle_transport_error(&mut self, err: anyhow::Error) -> SocketEvent {
        tracing::warn!(error = %err, "transport error");
        for channel in self.channels.values_mut() {
            channel.on_socket_error();
        }
        SocketEvent::Error(err)
    }

    fn handle_heartbeat_timeout(&mut self) -> SocketEvent {
        tracing::warn!("heartbeat timed out, closing the connection");
        self.close_was_clean = false;
        if matches!(self.transport, TransportLifecycle::Connected(_)) {
            let TransportLifecycle::Connected(transport) =
                std::mem::replace(&mut self.transport, TransportLifecycle::Disconnected)
            else {
                unreachable!("just matched Connected");
            };
            self.transport = TransportLifecycle::Closing {
                transport,
                code: Some(1000),
                reason: Some("heartbeat timeout".to_string()),
                reconnect_on_finish: true,
            };
            self.disconnect_scheduler.reset();
            self.disconnect_scheduler.schedule_timeout();
        }
        SocketEvent::Hiccup(anyhow::anyhow!("heartbeat timeout"))
    }

    fn drive_closing(&mut self, cx: &mut Context<'_>) -> Option<SocketEvent> {
        let ready = match &mut self.transport {
            TransportLifecycle::Closing { transport, .. } => transport.poll_close(cx).is_ready(),
            _ => return None,
        };
        if ready {
            return Some(self.finish_closing());
        }
        if self.disconnect_scheduler.poll_fire(cx).is_ready() {
            if self.disconnect_scheduler.tries() >= MAX_DISCONNECT_TRIES {
                return Some(self.finish_closing());
            }
            self.disconnect_scheduler.schedule_timeout();
        }
        None
    }

    fn finish_closing(&mut self) -> SocketEvent {
        let (code, reason, force_reconnect) =
            match std::mem::replace(&mut self.transport, TransportLifecycle::Disconnected) {
                TransportLifecycle::Closing {
                    code,
                    reason,
                    reconnect_on_finish,
                    ..
                } => (code, reason, reconnect_on_finish),
                _ => (None, None, false),
            };
        self.handle_close(code, reason, force_reconnect)
    }

    fn handle_inbound(&mut self, raw: String) -> SocketEvent {
        let message = match self.config.serializer.deserialize(&raw) {
            Ok(message) => message,
            Err(err) => return SocketEvent::Hiccup(err.into()),
        };

        if let Some(r#ref) = message.r#ref.as_deref() {
            self.heartbeat.acknowledge(r#ref);
        }

        let mut first_err = None;
        for channel in self.channels.values_mut() {
            if channel.is_member(&message) {
                let mut ctx = OutboundCtx {
                    ref_counter: &mut self.ref_counter,
                    clock: &self.config.clock,
                    serializer: self.config.serializer.as_ref(),
                    send_buffer: &mut self.send_buffer,
                    connected: self.connected,
                };
                if let Err(err) = channel.trigger(message.clone(), &mut ctx) {
                    first_err.get_or_insert(err);
                }
            }
        }
        self.prune_closed_channels();

        match first_err {
            Some(err) => SocketEvent::Hiccup(err.into()),
            None => SocketEvent::Message(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{fake_transport, immediate_factory, FakeTransport, FakeTransportHandle};

    fn socket_with(handle_out: &mut Option<FakeTransportHandle>) -> Socket<FakeTransport> {
        let (transport, handle) = fake_transport();
        *handle_out = Some(handle);
        let endpoint = Endpoint::new("http://example.invalid/socket").unwrap();
        let factory: Arc<dyn TransportFactory<_>> = Arc::new(immediate_factory(transport));
        Socket::new(endpoint, factory, SocketConfig::default())
    }

    /// Drives `socket.poll` exactly once with a waker that records nothing;
    /// every scenario below steps the state machine explicitly instead of
    /// awaiting a wake that a fake transport never schedules on its own.
    fn poll_once(socket: &mut Socket<FakeTransport>) -> Poll<SocketEvent> {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        socket.poll(&mut cx)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_and_join_sends_expected_frame_and_reaches_joined() {
        let mut handle = None;
        let mut socket = socket_with(&mut handle);
        let handle = handle.unwrap();

        socket.connect();
        assert!(matches!(poll_once(&mut socket), Poll::Ready(SocketEvent::Open)));

        let id = socket.channel("room:1", BoxedJson::new(serde_json::json!({"token": "t"})));
        socket.join(id).unwrap();
        assert!(poll_once(&mut socket).is_pending(), "flushes the join frame onto the wire");

        assert_eq!(
            handle.drain_sent(),
            vec![r#"["1","1","room:1","phx_join",{"token":"t"}]"#.to_string()]
        );

        handle.receive_text(r#"["1","1","room:1","phx_reply",{"status":"ok","response":{}}]"#);
        assert!(matches!(poll_once(&mut socket), Poll::Ready(SocketEvent::Message(_))));
        assert_eq!(socket.channel_ref(id).unwrap().state(), ChannelState::Joined);
    }

    #[tokio::test(start_paused = true)]
    async fn push_before_joined_buffers_then_flushes_after_join_completes() {
        let mut handle = None;
        let mut socket = socket_with(&mut handle);
        let handle = handle.unwrap();

        let id = socket.channel("room:1", BoxedJson::null());
        socket.join(id).unwrap();
        socket.push(id, "a", BoxedJson::null(), None).unwrap();
        assert!(
            handle.drain_sent().is_empty(),
            "nothing reaches the wire before the transport connects"
        );

        socket.connect();
        assert!(matches!(poll_once(&mut socket), Poll::Ready(SocketEvent::Open)));
        assert!(poll_once(&mut socket).is_pending());
        assert_eq!(
            handle.drain_sent(),
            vec![r#"["1","1","room:1","phx_join",{}]"#.to_string()],
            "the push is still buffered pending the join reply"
        );

        handle.receive_text(r#"["1","1","room:1","phx_reply",{"status":"ok","response":{}}]"#);
        assert!(matches!(poll_once(&mut socket), Poll::Ready(SocketEvent::Message(_))));
        assert!(poll_once(&mut socket).is_pending());
        assert_eq!(handle.drain_sent(), vec![r#"["1","2","room:1","a",{}]"#.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_topic_leaves_the_first_channel() {
        let mut handle = None;
        let mut socket = socket_with(&mut handle);
        let handle = handle.unwrap();

        socket.connect();
        assert!(matches!(poll_once(&mut socket), Poll::Ready(SocketEvent::Open)));

        let first = socket.channel("t:1", BoxedJson::null());
        socket.join(first).unwrap();
        assert!(poll_once(&mut socket).is_pending());
        handle.drain_sent();

        handle.receive_text(r#"["1","1","t:1","phx_reply",{"status":"ok","response":{}}]"#);
        assert!(matches!(poll_once(&mut socket), Poll::Ready(SocketEvent::Message(_))));
        assert_eq!(socket.channel_ref(first).unwrap().state(), ChannelState::Joined);

        let second = socket.channel("t:1", BoxedJson::null());
        socket.join(second).unwrap();
        assert!(poll_once(&mut socket).is_pending());

        let sent = handle.drain_sent();
        assert!(sent[0].contains("phx_leave"), "first channel leaves before the new join: {sent:?}");
        assert!(sent[1].contains("phx_join"));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_timeout_closes_and_schedules_a_reconnect() {
        let mut handle = None;
        let mut socket = socket_with(&mut handle);
        socket.heartbeat = Heartbeat::new(Some(Duration::from_millis(10)));

        socket.connect();
        assert!(matches!(poll_once(&mut socket), Poll::Ready(SocketEvent::Open)));

        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(poll_once(&mut socket).is_pending(), "first heartbeat sent, no ack requested yet");

        tokio::time::advance(Duration::from_millis(10)).await;
        let hiccup = poll_once(&mut socket);
        assert!(matches!(hiccup, Poll::Ready(SocketEvent::Hiccup(_))));

        let close = poll_once(&mut socket);
        assert!(matches!(close, Poll::Ready(SocketEvent::Close { .. })));
        assert!(!socket.close_was_clean());
    }
}
