//! A client library for the Phoenix Channels protocol.
//!
//! One [`Socket`] multiplexes any number of [`Channel`]s over a single
//! transport connection. The socket owns connection lifecycle, heartbeats,
//! reconnection and the send buffer; each channel owns its own join state
//! machine, outstanding [`push::Push`]es and subscriptions.
//!
//! The crate ships the protocol engine and a default `serde_json`-backed
//! wire codec ([`V2Serializer`]) and [`TokioClock`], but no production
//! transport: [`Transport`] and [`TransportFactory`] are narrow trait
//! interfaces a host implements over whatever WebSocket client it already
//! depends on. [`transport::testing::FakeTransport`] is an in-memory
//! implementation usable both by this crate's own tests and by a host's.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod channel;
mod clock;
mod endpoint;
mod error;
mod json;
mod message;
mod presence;
mod push;
mod refs;
mod scheduler;
mod socket;
mod transport;

pub use channel::{Channel, ChannelState, PushId, SubscriptionId};
pub use clock::{Clock, TokioClock};
pub use endpoint::{Endpoint, EndpointError};
pub use error::{ChannelError, CodecError, ReplyError};
pub use json::{BoxedJson, Serializer, V2Serializer};
pub use message::{Message, Reply, ReplyStatus};
pub use presence::{
    sync_diff, sync_state, Presence, PresenceDiff, PresenceMeta, PresencePayload, PresenceState,
};
pub use push::ReplyHook;
pub use scheduler::{default_reconnect_after, default_rejoin_after, Scheduler, TimerCalc};
pub use socket::{ChannelId, Socket, SocketConfig, SocketEvent};
pub use transport::{ConnectionState, Transport, TransportEvent, TransportFactory};

pub mod testing {
    //! In-memory [`Transport`](crate::Transport) for driving a [`Socket`](crate::Socket)
    //! without a real network connection.
    pub use crate::transport::testing::*;
}
