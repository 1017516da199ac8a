//! The boxed-JSON abstraction and the wire codec.
//!
//! [`BoxedJson`] decouples the core protocol engine from any particular
//! JSON representation: the core never inspects payload contents, it only
//! carries them between the transport and the application. [`Serializer`]
//! is the pluggable codec; [`V2Serializer`] is the default implementation
//! of the Phoenix v2 array envelope described in spec section 6.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::CodecError;
use crate::message::Message;

/// An opaque holder for a deserialized JSON subtree.
///
/// The core passes these around without ever looking inside; only the
/// application (via [`BoxedJson::unbox`]) and the [`Serializer`] implementation
/// project it into a concrete shape.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxedJson(Value);

impl BoxedJson {
    /// Boxes any serializable value.
    pub fn new(value: impl Serialize) -> Self {
        Self(serde_json::to_value(value).unwrap_or(Value::Null))
    }

    /// The empty JSON object `{}`, used for payload-less control frames.
    pub fn empty_object() -> Self {
        Self(Value::Object(Default::default()))
    }

    /// JSON `null`.
    pub fn null() -> Self {
        Self(Value::Null)
    }

    /// True if this wraps `null` (or an absent payload that normalized to
    /// it before boxing).
    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Projects the boxed value into an application-defined shape.
    pub fn unbox<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_value(self.0.clone()).map_err(CodecError::Projection)
    }

    pub(crate) fn from_value(value: Value) -> Self {
        Self(value)
    }

    pub(crate) fn as_value(&self) -> &Value {
        &self.0
    }

    /// Normalizes `null` to `{}`, matching what the server expects on the
    /// wire (spec section 6).
    pub(crate) fn wire_value(&self) -> Value {
        if self.0.is_null() {
            Value::Object(Default::default())
        } else {
            self.0.clone()
        }
    }
}

impl Default for BoxedJson {
    fn default() -> Self {
        Self::null()
    }
}

/// The wire codec: turns [`Message`]s into frames and back.
///
/// Implementations are expected to be cheap to clone/share; the socket
/// holds one behind an `Arc`.
pub trait Serializer: Send + Sync + std::fmt::Debug {
    /// Encodes a message into a frame ready to hand to the transport.
    fn serialize(&self, message: &Message) -> Result<String, CodecError>;
    /// Decodes a frame received from the transport into a [`Message`].
    fn deserialize(&self, raw: &str) -> Result<Message, CodecError>;
}

/// The Phoenix v2 wire format: a five-element JSON array
/// `[join_ref, ref, topic, event, payload]`, selected by `vsn=2.0.0`.
///
/// This is the only wire shape this crate implements; spec section 9 notes
/// that an older object-form envelope exists in the source material but is
/// not v2-compatible and is deliberately not reproduced here.
#[derive(Debug, Default, Clone, Copy)]
pub struct V2Serializer;

impl Serializer for V2Serializer {
    fn serialize(&self, message: &Message) -> Result<String, CodecError> {
        let frame = Value::Array(vec![
            opt_to_value(message.join_ref.as_deref()),
            opt_to_value(message.r#ref.as_deref()),
            Value::String(message.topic.clone()),
            Value::String(message.event.clone()),
            message.payload.wire_value(),
        ]);
        serde_json::to_string(&frame).map_err(CodecError::Malformed)
    }

    fn deserialize(&self, raw: &str) -> Result<Message, CodecError> {
        let value: Value = serde_json::from_str(raw).map_err(CodecError::Malformed)?;
        let mut elements = match value {
            Value::Array(elements) if elements.len() == 5 => elements,
            other => {
                return Err(CodecError::Malformed(
                    serde::de::Error::custom(format!(
                        "expected a 5-element v2 array envelope, got {other}"
                    )),
                ))
            }
        };

        // Drain in reverse so indices stay stable as we pop from the back.
        let payload = elements.pop().expect("checked len == 5");
        let event = value_to_string(elements.pop().expect("checked len == 5"))?;
        let topic = value_to_string(elements.pop().expect("checked len == 5"))?;
        let r#ref = value_to_opt_string(elements.pop().expect("checked len == 5"));
        let join_ref = value_to_opt_string(elements.pop().expect("checked len == 5"));

        Ok(Message {
            join_ref,
            r#ref,
            topic,
            event,
            payload: BoxedJson::from_value(payload),
        })
    }
}

fn opt_to_value(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::String(s.to_owned()),
        None => Value::Null,
    }
}

fn value_to_opt_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn value_to_string(value: Value) -> Result<String, CodecError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(CodecError::Malformed(serde::de::Error::custom(format!(
            "expected a JSON string, got {other}"
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PHX_JOIN;

    #[test]
    fn round_trips_well_formed_frame() {
        let codec = V2Serializer;
        let message = Message {
            join_ref: Some("1".into()),
            r#ref: Some("1".into()),
            topic: "room:lobby".into(),
            event: PHX_JOIN.into(),
            payload: BoxedJson::new(serde_json::json!({"token": "t"})),
        };

        let raw = codec.serialize(&message).unwrap();
        assert_eq!(
            raw,
            r#"["1","1","room:lobby","phx_join",{"token":"t"}]"#
        );

        let decoded = codec.deserialize(&raw).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn null_payload_normalizes_to_empty_object_on_encode() {
        let codec = V2Serializer;
        let message = Message {
            join_ref: Some("1".into()),
            r#ref: Some("2".into()),
            topic: "room:lobby".into(),
            event: "heartbeat".into(),
            payload: BoxedJson::null(),
        };

        let raw = codec.serialize(&message).unwrap();
        assert_eq!(raw, r#"["1","2","room:lobby","heartbeat",{}]"#);
    }

    #[test]
    fn rejects_non_array_frames() {
        let codec = V2Serializer;
        let err = codec.deserialize(r#"{"topic":"room:lobby"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn rejects_wrong_length_arrays() {
        let codec = V2Serializer;
        let err = codec.deserialize(r#"["1","1","room:lobby"]"#).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }
}
