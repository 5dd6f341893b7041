//! crosswired - Crosswire multi-tunnel event correlation daemon
//!
//! This daemon provides:
//! - Per-channel listeners (UDP datagram, TCP stream, SOCKS5-dialed)
//! - A single-owner correlator task evaluating the active logic gate
//! - Connection tracking for externally controlled tunnels
//! - An HTTP control surface for status and runtime commands

pub mod config;
pub mod control;
pub mod correlator;
pub mod listener;
pub mod setup;
pub mod tracker;

pub use config::Config;
pub use control::ControlState;
pub use correlator::{CorrelatorHandle, CorrelatorStats, GateCell};
pub use tracker::ConnectionTracker;
