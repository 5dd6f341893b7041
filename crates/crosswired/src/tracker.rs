//! Connection tracking for externally controlled tunnels
//!
//! Per-channel state machine: Disconnected -> Connecting -> Connected,
//! rolled back to Disconnected on failure. The external control call
//! runs on its own task per operation, so a slow VPN client never
//! blocks listeners, the correlator, or the control surface.

use async_trait::async_trait;
use crosswire_core::types::{ChannelId, ConnectionState};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Tracker errors
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("unknown channel: {0:?}")]
    UnknownChannel(String),
    #[error("channel {0:?} has no tunnel configuration")]
    NoTunnel(String),
    #[error("tunnel control is not configured")]
    ControlDisabled,
    #[error("tunnel control exited with {0}")]
    ControlFailed(ExitStatus),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// External tunnel client boundary
#[async_trait]
pub trait TunnelControl: Send + Sync {
    async fn connect(&self, name: &str) -> Result<(), TrackerError>;
    async fn disconnect(&self, name: &str) -> Result<(), TrackerError>;
}

/// Shells out to a Tunnelblick-style CLI: `<cli> -c NAME` to connect,
/// `<cli> -d NAME` to disconnect. Non-zero exit is a failed transition,
/// never a crash.
pub struct VpnCli {
    program: PathBuf,
}

impl VpnCli {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    async fn run(&self, flag: &str, name: &str) -> Result<(), TrackerError> {
        debug!(program = %self.program.display(), flag, name, "invoking tunnel control");
        let status = Command::new(&self.program)
            .arg(flag)
            .arg(name)
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(TrackerError::ControlFailed(status))
        }
    }
}

#[async_trait]
impl TunnelControl for VpnCli {
    async fn connect(&self, name: &str) -> Result<(), TrackerError> {
        self.run("-c", name).await
    }

    async fn disconnect(&self, name: &str) -> Result<(), TrackerError> {
        self.run("-d", name).await
    }
}

/// Stand-in when no --vpn-cli is configured
pub struct NoTunnelControl;

#[async_trait]
impl TunnelControl for NoTunnelControl {
    async fn connect(&self, _name: &str) -> Result<(), TrackerError> {
        Err(TrackerError::ControlDisabled)
    }

    async fn disconnect(&self, _name: &str) -> Result<(), TrackerError> {
        Err(TrackerError::ControlDisabled)
    }
}

#[derive(Debug)]
struct Tracked {
    id: ChannelId,
    tunnel: Option<String>,
    state: ConnectionState,
}

type ChannelMap = Arc<RwLock<HashMap<String, Tracked>>>;

/// Exclusive owner of per-channel connection state
pub struct ConnectionTracker {
    control: Arc<dyn TunnelControl>,
    channels: ChannelMap,
}

impl ConnectionTracker {
    pub fn new(control: Arc<dyn TunnelControl>) -> Self {
        Self {
            control,
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a channel; `tunnel` names the external configuration
    /// the control calls act on, if any. Starts Disconnected.
    pub fn register(&self, name: &str, id: ChannelId, tunnel: Option<String>) {
        self.channels.write().insert(
            name.to_string(),
            Tracked {
                id,
                tunnel,
                state: ConnectionState::Disconnected,
            },
        );
    }

    pub fn state(&self, name: &str) -> Option<ConnectionState> {
        self.channels.read().get(name).map(|t| t.state)
    }

    /// Snapshot for status reporting, keyed by channel name
    pub fn states(&self) -> HashMap<String, ConnectionState> {
        self.channels
            .read()
            .iter()
            .map(|(name, t)| (name.clone(), t.state))
            .collect()
    }

    /// Begin connecting. Returns `Ok(true)` if an operation was
    /// started, `Ok(false)` for the guarded no-op when the channel is
    /// already Connecting or Connected.
    pub fn request_connect(&self, name: &str) -> Result<bool, TrackerError> {
        let tunnel = {
            let mut channels = self.channels.write();
            let tracked = channels
                .get_mut(name)
                .ok_or_else(|| TrackerError::UnknownChannel(name.to_string()))?;
            if tracked.state != ConnectionState::Disconnected {
                debug!(channel = name, state = ?tracked.state, "connect ignored");
                return Ok(false);
            }
            let tunnel = tracked
                .tunnel
                .clone()
                .ok_or_else(|| TrackerError::NoTunnel(name.to_string()))?;
            tracked.state = ConnectionState::Connecting;
            tunnel
        };

        let control = Arc::clone(&self.control);
        let channels = Arc::clone(&self.channels);
        let name = name.to_string();
        tokio::spawn(async move {
            run_connect(control, channels, &name, &tunnel).await;
        });
        Ok(true)
    }

    /// Begin disconnecting. Only defined from Connected: a channel
    /// that is Disconnected, or still Connecting, is a safe no-op
    /// (`Ok(false)`). Tearing down a connect that has not committed
    /// yet would let the late connect commit overwrite the result.
    pub fn request_disconnect(&self, name: &str) -> Result<bool, TrackerError> {
        let tunnel = {
            let channels = self.channels.read();
            let tracked = channels
                .get(name)
                .ok_or_else(|| TrackerError::UnknownChannel(name.to_string()))?;
            if tracked.state != ConnectionState::Connected {
                debug!(channel = name, state = ?tracked.state, "disconnect ignored");
                return Ok(false);
            }
            tracked
                .tunnel
                .clone()
                .ok_or_else(|| TrackerError::NoTunnel(name.to_string()))?
        };

        let control = Arc::clone(&self.control);
        let channels = Arc::clone(&self.channels);
        let name = name.to_string();
        tokio::spawn(async move {
            run_disconnect(control, channels, &name, &tunnel).await;
        });
        Ok(true)
    }

    /// Best-effort disconnect of every Connected channel at shutdown;
    /// errors are logged, not fatal.
    pub async fn shutdown_disconnect_all(&self) {
        let connected: Vec<(String, String)> = {
            let channels = self.channels.read();
            channels
                .iter()
                .filter(|(_, t)| t.state == ConnectionState::Connected)
                .filter_map(|(name, t)| t.tunnel.clone().map(|tun| (name.clone(), tun)))
                .collect()
        };

        for (name, tunnel) in connected {
            info!(channel = %name, "disconnecting before exit");
            run_disconnect(
                Arc::clone(&self.control),
                Arc::clone(&self.channels),
                &name,
                &tunnel,
            )
            .await;
        }
    }
}

async fn run_connect(
    control: Arc<dyn TunnelControl>,
    channels: ChannelMap,
    name: &str,
    tunnel: &str,
) {
    match control.connect(tunnel).await {
        Ok(()) => {
            commit_if(&channels, name, ConnectionState::Connecting, ConnectionState::Connected);
            info!(channel = name, tunnel, "tunnel connected");
        }
        Err(e) => {
            commit_if(
                &channels,
                name,
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
            );
            warn!(channel = name, tunnel, error = %e, "tunnel connect failed");
        }
    }
}

async fn run_disconnect(
    control: Arc<dyn TunnelControl>,
    channels: ChannelMap,
    name: &str,
    tunnel: &str,
) {
    match control.disconnect(tunnel).await {
        Ok(()) => {
            commit_if(&channels, name, ConnectionState::Connected, ConnectionState::Disconnected);
            info!(channel = name, tunnel, "tunnel disconnected");
        }
        Err(e) => {
            // State stays as it was; surfaced via status.
            warn!(channel = name, tunnel, error = %e, "tunnel disconnect failed");
        }
    }
}

/// Commit a terminal state only if the channel is still in the state
/// the operation started from; a commit racing a newer transition is
/// dropped instead of overwriting it.
fn commit_if(
    channels: &ChannelMap,
    name: &str,
    from: ConnectionState,
    to: ConnectionState,
) -> bool {
    let mut channels = channels.write();
    match channels.get_mut(name) {
        Some(tracked) if tracked.state == from => {
            debug!(channel = name, id = %tracked.id, ?to, "state committed");
            tracked.state = to;
            true
        }
        Some(tracked) => {
            debug!(channel = name, state = ?tracked.state, expected = ?from, "stale commit dropped");
            false
        }
        None => false,
    }
}
