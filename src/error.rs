use std::fmt;

use crate::message::ReplyStatus;

/// Programming errors that are surfaced immediately instead of being
/// retried by the rejoin/reconnect machinery.
///
/// These correspond to `ProtocolMisuse` in the error taxonomy: joining a
/// channel twice, pushing before `join()`, or an `on_message` hook that
/// drops a non-null payload are all bugs in the calling code, not
/// transient failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// `join()` was called on a channel that already joined once.
    #[error("channel for topic {topic:?} has already been joined; create a new channel instance to rejoin from scratch")]
    AlreadyJoined {
        /// Topic of the offending channel.
        topic: String,
    },
    /// `push()` was called before `join()`.
    #[error("cannot push event {event:?} on topic {topic:?} before join() has been called")]
    NotJoinedYet {
        /// Topic of the channel.
        topic: String,
        /// Event that was attempted.
        event: String,
    },
    /// `on_message` returned a null payload for a non-null input.
    #[error("on_message hook for topic {topic:?} returned a null payload for a non-null input")]
    OnMessageDroppedPayload {
        /// Topic of the channel.
        topic: String,
    },
}

/// Errors from the wire codec ([`crate::json::Serializer`]).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame wasn't valid JSON, or not a 5-element array in v2 shape.
    #[error("malformed v2 envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    /// `unbox::<T>()` failed to project the boxed payload into `T`.
    #[error("failed to project payload into requested type: {0}")]
    Projection(#[source] serde_json::Error),
}

/// A reply status other than the one a caller asked to wait on arrived, or
/// no reply arrived before the timeout — surfaced through
/// [`crate::push::Push::receive`] hooks rather than as a `Result`, mirroring
/// the wire-level distinction between `ok`, `error` and the
/// client-synthesized `timeout`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("push for event {event:?} resolved with status {status}")]
pub struct ReplyError {
    /// Event the push was for.
    pub event: String,
    /// The status the reply actually carried.
    pub status: ReplyStatus,
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Error => "error",
            ReplyStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}
