// Envelope codec - the wire shape of every bridge message
// Pure and stateless: JSON in, JSON out

use crate::error::DecodeError;
use crate::protocol::{ChannelName, Direction, MessageKind};
use serde::Serialize;
use serde_json::{Map, Value};

/// Routing metadata plus an opaque payload.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub channel: ChannelName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    pub origin: String,
    pub kind: MessageKind,
    pub payload: Value,
}

impl Envelope {
    pub fn new(
        id: impl Into<String>,
        channel: ChannelName,
        kind: MessageKind,
        origin: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            channel,
            direction: None,
            origin: origin.into(),
            kind,
            payload,
        }
    }

    pub fn request(id: impl Into<String>, channel: ChannelName, origin: impl Into<String>, payload: Value) -> Self {
        Self::new(id, channel, MessageKind::Request, origin, payload)
    }

    pub fn event(id: impl Into<String>, channel: ChannelName, origin: impl Into<String>, payload: Value) -> Self {
        Self::new(id, channel, MessageKind::Event, origin, payload)
    }

    /// Response to `self`, reusing its id and channel.
    pub fn reply(&self, origin: impl Into<String>, payload: Value) -> Self {
        Self::new(
            self.id.clone(),
            self.channel,
            MessageKind::Response,
            origin,
            payload,
        )
    }

    pub fn ping(id: impl Into<String>, origin: impl Into<String>) -> Self {
        Self::new(
            id,
            ChannelName::ExtensionPing,
            MessageKind::Ping,
            origin,
            Value::Null,
        )
    }

    /// Pong answering this ping.
    pub fn pong(&self, origin: impl Into<String>) -> Self {
        Self::new(
            self.id.clone(),
            ChannelName::ExtensionPing,
            MessageKind::Pong,
            origin,
            Value::Null,
        )
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    /// Structured form, for surfaces that carry objects instead of bytes.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("envelope fields always serialize")
    }
}

/// Serialize an envelope to wire bytes.
///
/// All fields are strings, enums or a `serde_json::Value`, so serialization
/// cannot fail.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    serde_json::to_vec(envelope).expect("envelope fields always serialize")
}

/// Parse wire bytes into an envelope, rejecting anything outside the closed
/// vocabulary.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;
    decode_value(value)
}

/// Same as [`decode`] for data that is already structured (window messages).
pub fn decode_value(value: Value) -> Result<Envelope, DecodeError> {
    let Value::Object(mut map) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let id = take_string(&mut map, "id")?;
    let channel = take_string(&mut map, "channel")?;
    let channel = channel
        .parse::<ChannelName>()
        .map_err(|e| DecodeError::UnknownChannel(e.0))?;
    let origin = take_string(&mut map, "origin")?;
    let kind = take_string(&mut map, "kind")?
        .parse::<MessageKind>()
        .map_err(|e| DecodeError::UnknownKind(e.0))?;

    let direction = match map.remove("direction") {
        None | Some(Value::Null) => None,
        Some(Value::String(tag)) => Some(
            tag.parse::<Direction>()
                .map_err(|e| DecodeError::UnknownDirection(e.0))?,
        ),
        Some(_) => return Err(DecodeError::WrongType { field: "direction" }),
    };

    let payload = map.remove("payload").unwrap_or(Value::Null);

    Ok(Envelope {
        id,
        channel,
        direction,
        origin,
        kind,
        payload,
    })
}

fn take_string(map: &mut Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    match map.remove(field) {
        None | Some(Value::Null) => Err(DecodeError::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(DecodeError::WrongType { field }),
    }
}
