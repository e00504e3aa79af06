// Error taxonomy for the bridge
//
// Transport-level faults (decode, direction, origin, overflow) are handled
// inside the context and only surface through tracing and BridgeStats.
// Request-level faults (timeout, disconnect) reach the single caller.

use crate::protocol::{ChannelName, Direction, Link, PortName};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON envelope: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("envelope must be a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` has the wrong type")]
    WrongType { field: &'static str },

    #[error("unrecognized channel: {0}")]
    UnknownChannel(String),

    #[error("unrecognized direction tag: {0}")]
    UnknownDirection(String),

    #[error("unrecognized message kind: {0}")]
    UnknownKind(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a live port named {0} is already registered")]
    DuplicatePort(PortName),

    #[error("no port named {0}")]
    NotFound(PortName),

    #[error("port {0} is not open")]
    NotOpen(PortName),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("direction violation on {link}: expected {expected}, got {actual:?}")]
    DirectionViolation {
        link: Link,
        expected: Direction,
        actual: Option<Direction>,
    },

    #[error("origin mismatch on {link}: bound to {bound}, envelope claims {claimed}")]
    OriginMismatch {
        link: Link,
        bound: String,
        claimed: String,
    },

    #[error("channel {0} is not reachable from the page")]
    HiddenChannel(ChannelName),

    #[error("queue for {port} is full, dropped envelope {dropped_id}")]
    QueueOverflow { port: PortName, dropped_id: String },

    #[error("no route for {channel} from {from}")]
    NoRoute { channel: ChannelName, from: String },
}

/// Failure delivered to the caller that issued a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request {id} timed out after {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    #[error("port {port} disconnected before request {id} resolved")]
    PortDisconnected { id: String, port: PortName },

    #[error("request {id} was dropped before delivery: {reason}")]
    Dropped { id: String, reason: RouteError },

    #[error("peer rejected request {id}: {message}")]
    Remote { id: String, message: String },

    #[error("bridge event loop has shut down")]
    BridgeClosed,
}

/// Failure attaching a transport to a context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("bridge event loop has stopped")]
    BridgeClosed,
}

/// Inconsistent `BridgeConfig` values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be positive")]
    Zero(&'static str),

    #[error("keepalive.pong_timeout_ms ({pong_timeout_ms}) must be shorter than keepalive.interval_ms ({interval_ms})")]
    PongTimeoutTooLong { pong_timeout_ms: u64, interval_ms: u64 },

    #[error("router.relay_ttl_ms ({relay_ttl_ms}) must cover correlator.default_timeout_ms ({default_timeout_ms})")]
    RelayTtlTooShort { relay_ttl_ms: u64, default_timeout_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored value is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}
