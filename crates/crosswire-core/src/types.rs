//! Shared channel and observation types
//!
//! Everything here is immutable once constructed; listeners build
//! [`Observation`]s and hand them to the correlator, which owns all
//! mutable correlation state.

use crate::gate::LogicGate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

/// Maximum characters kept of a payload for history/display purposes
pub const SUMMARY_MAX_CHARS: usize = 256;

/// Stable identifier of a configured channel, unique per tunnel
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u16);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Transport kind a channel listener speaks
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Datagram,
    Stream,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Datagram => f.write_str("datagram"),
            Transport::Stream => f.write_str("stream"),
        }
    }
}

impl FromStr for Transport {
    type Err = crate::error::ChannelSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "datagram" | "udp" => Ok(Transport::Datagram),
            "stream" | "tcp" => Ok(Transport::Stream),
            _ => Err(crate::error::ChannelSpecError::BadTransport(s.to_string())),
        }
    }
}

/// Channel lifecycle as driven by the connection tracker
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Identity used to correlate events across channels.
///
/// BLAKE3 of the raw payload bytes: fixed-size for map keying while
/// preserving the default exact-byte-equality policy.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObservationKey(pub [u8; 32]);

impl ObservationKey {
    pub fn from_payload(payload: &[u8]) -> Self {
        ObservationKey(*blake3::hash(payload).as_bytes())
    }

    /// Short hex form for logs and status output
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for ObservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_hex())
    }
}

/// Immutable event record a listener pushes to the correlator
#[derive(Clone, Debug)]
pub struct Observation {
    pub channel: ChannelId,
    pub key: ObservationKey,
    /// Truncated printable form of the payload, history/display only
    pub summary: String,
    pub received_at: SystemTime,
}

impl Observation {
    pub fn new(channel: ChannelId, payload: &[u8]) -> Self {
        Self {
            channel,
            key: ObservationKey::from_payload(payload),
            summary: payload_summary(payload),
            received_at: SystemTime::now(),
        }
    }
}

/// Emitted when the active gate evaluates true for a key
#[derive(Clone, Debug, Serialize)]
pub struct GateSatisfied {
    pub key: ObservationKey,
    /// Distinct channels that had reported the key, sorted
    pub observed_by: Vec<ChannelId>,
    pub gate: LogicGate,
    #[serde(skip)]
    pub at: SystemTime,
}

/// Printable, bounded form of a payload for the history buffer.
///
/// Lossy UTF-8 with control characters replaced; truncated on a char
/// boundary at [`SUMMARY_MAX_CHARS`].
pub fn payload_summary(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    text.chars()
        .take(SUMMARY_MAX_CHARS)
        .map(|c| if c.is_control() { '.' } else { c })
        .collect()
}
