//! Logic-gate enumeration and evaluation
//!
//! The gate is a pure boolean function over `(k, N)` where `k` is the
//! number of distinct channels that reported a key and `N` is the
//! configured channel count. Representing it as a closed enum (rather
//! than dispatching on strings) makes an unrecognized gate a parse-time
//! error instead of a silent "never matches".

use crate::error::GateParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Boolean function applied to the set of channels that reported a key
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicGate {
    And,
    Or,
    Xor,
    Nand,
    Nor,
    Xnor,
}

impl LogicGate {
    /// All recognized gates, in configuration order
    pub const ALL: [LogicGate; 6] = [
        LogicGate::And,
        LogicGate::Or,
        LogicGate::Xor,
        LogicGate::Nand,
        LogicGate::Nor,
        LogicGate::Xnor,
    ];

    /// Evaluate the gate over an N-channel observation vector with
    /// `observed` distinct reporting channels.
    ///
    /// NOR's true case (`observed == 0`) is unreachable through normal
    /// observation, since evaluating at all implies at least one report;
    /// it is defined anyway so the table is total.
    pub fn evaluate(self, observed: usize, channel_count: usize) -> bool {
        match self {
            LogicGate::And => observed == channel_count,
            LogicGate::Or => observed >= 1,
            LogicGate::Xor => observed == 1,
            LogicGate::Nand => observed != channel_count,
            LogicGate::Nor => observed == 0,
            LogicGate::Xnor => observed != 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogicGate::And => "AND",
            LogicGate::Or => "OR",
            LogicGate::Xor => "XOR",
            LogicGate::Nand => "NAND",
            LogicGate::Nor => "NOR",
            LogicGate::Xnor => "XNOR",
        }
    }
}

impl fmt::Display for LogicGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicGate {
    type Err = GateParseError;

    /// Case-insensitive; rejects anything outside the six gates.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AND" => Ok(LogicGate::And),
            "OR" => Ok(LogicGate::Or),
            "XOR" => Ok(LogicGate::Xor),
            "NAND" => Ok(LogicGate::Nand),
            "NOR" => Ok(LogicGate::Nor),
            "XNOR" => Ok(LogicGate::Xnor),
            _ => Err(GateParseError(s.to_string())),
        }
    }
}
