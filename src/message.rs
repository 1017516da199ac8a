//! The protocol envelope and reply model (spec sections 3 and 6).

use crate::json::BoxedJson;

/// Outbound join request.
pub const PHX_JOIN: &str = "phx_join";
/// Outbound leave request.
pub const PHX_LEAVE: &str = "phx_leave";
/// Inbound: the server tore down the channel.
pub const PHX_CLOSE: &str = "phx_close";
/// Inbound: the channel crashed or was denied.
pub const PHX_ERROR: &str = "phx_error";
/// Inbound: a reply to a previous push, correlated by `ref`.
pub const PHX_REPLY: &str = "phx_reply";
/// Heartbeat event name, sent on the reserved `phoenix` topic.
pub const HEARTBEAT_EVENT: &str = "heartbeat";
/// Topic heartbeats are sent on.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// A single Phoenix v2 frame: `[join_ref, ref, topic, event, payload]`.
///
/// Messages are immutable once constructed; synthesizing a new logical
/// event (e.g. `chan_reply_{ref}`) always builds a fresh `Message` rather
/// than mutating an inbound one in place (spec section 9's "prefer the
/// fresh-message form" resolution).
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Identifies the joining instance of the sender's channel, if any.
    pub join_ref: Option<String>,
    /// Correlates a request with its reply, if any.
    pub r#ref: Option<String>,
    /// Server-side routing key.
    pub topic: String,
    /// Either a reserved control event or an application-defined name.
    pub event: String,
    /// Opaque payload.
    pub payload: BoxedJson,
}

impl Message {
    /// Builds an application/control message with the given fields.
    pub fn new(
        join_ref: Option<String>,
        r#ref: Option<String>,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: BoxedJson,
    ) -> Self {
        Self {
            join_ref,
            r#ref,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Name of the synthetic per-push reply event this message's `ref`
    /// would correlate with, if it carries a `phx_reply` event and a ref.
    pub(crate) fn chan_reply_event(&self) -> Option<String> {
        self.r#ref.as_deref().map(chan_reply_event)
    }
}

/// Synthetic event name a channel re-triggers a `phx_reply` under so a
/// [`crate::push::Push`] can subscribe to just its own reply.
pub(crate) fn chan_reply_event(r#ref: &str) -> String {
    format!("chan_reply_{ref}", r#ref = r#ref)
}

/// Status of a [`Reply`]. `Timeout` never appears on the wire; it is
/// synthesized locally when a push's timer elapses before a reply arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    /// Server accepted the request.
    Ok,
    /// Server rejected the request.
    Error,
    /// No reply arrived within the configured window.
    Timeout,
}

/// A deserialized `phx_reply` payload, or a locally-synthesized timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Outcome of the request.
    pub status: ReplyStatus,
    /// Opaque server response (or `null` for a synthesized timeout).
    pub response: BoxedJson,
}

impl Reply {
    /// A client-synthesized timeout reply.
    pub fn timeout() -> Self {
        Self {
            status: ReplyStatus::Timeout,
            response: BoxedJson::null(),
        }
    }

    /// Parses `{status, response}` out of a `phx_reply` payload.
    pub(crate) fn from_payload(payload: &BoxedJson) -> Option<Self> {
        #[derive(serde::Deserialize)]
        struct Wire {
            status: ReplyStatus,
            #[serde(default)]
            response: serde_json::Value,
        }

        let wire: Wire = payload.unbox().ok()?;
        Some(Self {
            status: wire.status,
            response: BoxedJson::from_value(wire.response),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ok_reply_payload() {
        let payload = BoxedJson::new(serde_json::json!({"status": "ok", "response": {"echo": "x"}}));
        let reply = Reply::from_payload(&payload).unwrap();
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(
            reply.response.unbox::<serde_json::Value>().unwrap(),
            serde_json::json!({"echo": "x"})
        );
    }

    #[test]
    fn chan_reply_event_name() {
        assert_eq!(chan_reply_event("42"), "chan_reply_42");
    }
}
