//! Crosswire Core Library
//!
//! This crate provides the pure, I/O-free heart of the Crosswire
//! multi-channel event correlator:
//!
//! # Modules
//!
//! - [`gate`]: the closed logic-gate enumeration and its evaluation function
//! - [`types`]: channel/observation types shared across the workspace
//! - [`correlate`]: the per-key correlation map and satisfaction logic
//! - [`history`]: the bounded per-channel observation history
//! - [`error`]: error types

pub mod correlate;
pub mod error;
pub mod gate;
pub mod history;
pub mod types;

pub use correlate::CorrelationMap;
pub use error::{ChannelSpecError, GateParseError};
pub use gate::LogicGate;
pub use history::{HistoryBuffer, HistoryEntry};
pub use types::*;
