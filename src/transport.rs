//! The transport boundary (spec section 6): a narrow trait the core
//! drives, deliberately out of scope to implement for real in this crate.
//!
//! The method split (`poll_send_ready` / `start_send` / `poll_flush` /
//! `poll_next` / `poll_close`) is the idiomatic Rust shape for "a
//! sink+stream this struct drives with its own `poll`", expressed as a
//! trait instead of a concrete WebSocket dependency so the socket never
//! has to commit to one.

use std::fmt;
use std::future::Future;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use url::Url;

/// Connection state as observed from the outside, mirroring spec section 3's
/// `{Connecting, Open, Closing, Closed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in flight.
    Connecting,
    /// Ready to send and receive frames.
    Open,
    /// Close handshake in flight.
    Closing,
    /// Fully closed.
    Closed,
}

/// A single text frame received from the transport, or a close
/// notification carrying the server's code and reason.
#[derive(Debug)]
pub enum TransportEvent {
    /// A text frame arrived.
    Text(String),
    /// The peer closed the connection.
    Closed {
        /// Close code, if the transport exposes one.
        code: Option<u16>,
        /// Close reason, if the transport exposes one.
        reason: Option<String>,
    },
}

/// An established, bidirectional connection the [`crate::socket::Socket`]
/// drives directly, frame by frame.
pub trait Transport: Unpin + Send {
    /// Polls readiness to accept another frame via [`start_send`](Self::start_send).
    fn poll_send_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), anyhow::Error>>;
    /// Buffers a frame for sending. Only valid after `poll_send_ready`
    /// returned `Ready(Ok(()))`.
    fn start_send(&mut self, raw: String) -> Result<(), anyhow::Error>;
    /// Flushes buffered frames to the wire.
    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), anyhow::Error>>;
    /// Polls for the next inbound event.
    fn poll_next_event(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<TransportEvent, anyhow::Error>>>;
    /// Initiates (or continues) a graceful close.
    fn poll_close(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), anyhow::Error>>;
}

/// Produces a connected [`Transport`] for a given endpoint URL.
///
/// A boxed future that resolves to an already-connected transport, so the
/// socket's own state machine can poll it alongside everything else
/// instead of awaiting it directly.
pub trait TransportFactory<T: Transport>: Send + Sync {
    /// Begins connecting to `url`.
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<T, anyhow::Error>>;
}

impl<T, F, Fut> TransportFactory<T> for F
where
    T: Transport,
    F: Fn(Url) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
{
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<T, anyhow::Error>> {
        Box::pin((self)(url))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// An in-memory [`Transport`] used by this crate's own tests and useful to
/// downstream test suites that don't want a real socket: poll a hand-built
/// state machine under `#[tokio::test]`, with the full send/receive/close
/// surface a real transport needs.
pub mod testing {
    use std::collections::VecDeque;
    use std::task::Waker;

    use super::*;

    /// Shared state between a [`FakeTransport`] and the test driving it.
    #[derive(Debug, Default)]
    struct Shared {
        sent: VecDeque<String>,
        inbound: VecDeque<TransportEvent>,
        closed: bool,
        close_requested: bool,
        waker: Option<Waker>,
    }

    /// A [`Transport`] backed by in-memory queues, for tests.
    ///
    /// Clone [`FakeTransportHandle`] to feed frames in and drain frames
    /// sent by the code under test from a different part of the test.
    pub struct FakeTransport {
        shared: std::sync::Arc<std::sync::Mutex<Shared>>,
    }

    /// The test-facing half of a [`FakeTransport`] pair.
    #[derive(Clone)]
    pub struct FakeTransportHandle {
        shared: std::sync::Arc<std::sync::Mutex<Shared>>,
    }

    /// Builds a connected transport/handle pair.
    pub fn fake_transport() -> (FakeTransport, FakeTransportHandle) {
        let shared = std::sync::Arc::new(std::sync::Mutex::new(Shared::default()));
        (
            FakeTransport {
                shared: shared.clone(),
            },
            FakeTransportHandle { shared },
        )
    }

    impl FakeTransportHandle {
        /// Queues a frame as if the server had sent it.
        pub fn receive_text(&self, raw: impl Into<String>) {
            let mut shared = self.shared.lock().expect("lock poisoned");
            shared.inbound.push_back(TransportEvent::Text(raw.into()));
            wake(&mut shared);
        }

        /// Queues a server-initiated close.
        pub fn receive_close(&self, code: Option<u16>, reason: Option<String>) {
            let mut shared = self.shared.lock().expect("lock poisoned");
            shared.inbound.push_back(TransportEvent::Closed { code, reason });
            wake(&mut shared);
        }

        /// Drains every frame sent by the code under test so far, in order.
        pub fn drain_sent(&self) -> Vec<String> {
            let mut shared = self.shared.lock().expect("lock poisoned");
            shared.sent.drain(..).collect()
        }

        /// True once the transport under test has completed a close.
        pub fn is_closed(&self) -> bool {
            self.shared.lock().expect("lock poisoned").closed
        }
    }

    fn wake(shared: &mut Shared) {
        if let Some(waker) = shared.waker.take() {
            waker.wake();
        }
    }

    impl Transport for FakeTransport {
        fn poll_send_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), anyhow::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(&mut self, raw: String) -> Result<(), anyhow::Error> {
            self.shared.lock().expect("lock poisoned").sent.push_back(raw);
            Ok(())
        }

        fn poll_flush(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), anyhow::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_next_event(
            &mut self,
            cx: &mut Context<'_>,
        ) -> Poll<Option<Result<TransportEvent, anyhow::Error>>> {
            let mut shared = self.shared.lock().expect("lock poisoned");
            if let Some(event) = shared.inbound.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if shared.close_requested {
                shared.closed = true;
                return Poll::Ready(None);
            }
            shared.waker = Some(cx.waker().clone());
            Poll::Pending
        }

        fn poll_close(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), anyhow::Error>> {
            let mut shared = self.shared.lock().expect("lock poisoned");
            shared.close_requested = true;
            shared.closed = true;
            Poll::Ready(Ok(()))
        }
    }

    /// A [`TransportFactory`] handing out a single pre-built
    /// [`FakeTransport`], for tests that want to control exactly when/how
    /// the connect future resolves.
    pub fn immediate_factory(
        transport: FakeTransport,
    ) -> impl TransportFactory<FakeTransport> {
        let transport = std::sync::Mutex::new(Some(transport));
        move |_url: Url| {
            let transport = transport.lock().expect("lock poisoned").take();
            async move {
                transport.ok_or_else(|| anyhow::anyhow!("fake transport factory used twice"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use futures::future::poll_fn;

    #[tokio::test]
    async fn fake_transport_round_trips_frames() {
        let (mut transport, handle) = fake_transport();

        poll_fn(|cx| {
            assert!(transport.poll_send_ready(cx).is_ready());
            Poll::Ready(())
        })
        .await;
        transport.start_send("hello".into()).unwrap();
        assert_eq!(handle.drain_sent(), vec!["hello".to_string()]);

        handle.receive_text("world");
        let event = poll_fn(|cx| transport.poll_next_event(cx)).await;
        match event {
            Some(Ok(TransportEvent::Text(text))) => assert_eq!(text, "world"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fake_transport_factory_resolves_once() {
        let (transport, _handle) = fake_transport();
        let factory = immediate_factory(transport);
        let url = Url::parse("ws://example.invalid/socket/websocket").unwrap();

        assert!(factory.connect(url.clone()).await.is_ok());
        assert!(factory.connect(url).await.is_err());
    }
}
