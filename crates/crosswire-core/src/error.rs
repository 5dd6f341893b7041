//! Error types for Crosswire core

use thiserror::Error;

/// Rejected logic-gate name
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unrecognized logic gate: {0:?}")]
pub struct GateParseError(pub String);

/// Malformed channel specification string
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelSpecError {
    /// Key=value pair without an '='
    #[error("malformed channel field (expected key=value): {0:?}")]
    MalformedField(String),

    /// Unknown key in a channel spec
    #[error("unknown channel field: {0:?}")]
    UnknownField(String),

    /// Missing required field
    #[error("missing required channel field: {0}")]
    MissingField(&'static str),

    /// Unparseable transport kind
    #[error("unrecognized transport (expected datagram or stream): {0:?}")]
    BadTransport(String),

    /// Unparseable socket address
    #[error("invalid address for {field}: {value:?}")]
    BadAddress { field: &'static str, value: String },

    /// Dialed channels need both an endpoint and a proxy
    #[error("channel must declare bind=ADDR, or endpoint=HOST:PORT together with via=ADDR")]
    NoSource,
}
