//! Configuration for crosswired

use clap::Parser;
use crosswire_core::error::ChannelSpecError;
use crosswire_core::gate::LogicGate;
use crosswire_core::types::Transport;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// crosswired - Crosswire Multi-Tunnel Correlation Daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "crosswired")]
#[command(about = "Correlates events across tunnel channels through a configurable logic gate")]
pub struct Config {
    /// Channel specification, repeatable. Format:
    /// name=NAME,transport=datagram|stream,bind=ADDR[,vpn=NAME][,endpoint=HOST:PORT][,via=ADDR][,iface=NAME]
    #[arg(long = "channel", value_name = "SPEC", required = true)]
    pub channels: Vec<ChannelSpec>,

    /// Initial logic gate (AND, OR, XOR, NAND, NOR, XNOR)
    #[arg(long, default_value = "AND")]
    pub gate: LogicGate,

    /// Listen address for the HTTP control surface
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub control_listen: SocketAddr,

    /// Per-channel history capacity
    #[arg(long, default_value = "50")]
    pub history_cap: usize,

    /// Seconds an unmatched correlation entry may linger before expiry
    #[arg(long, default_value = "300")]
    pub entry_ttl_secs: u64,

    /// Seconds between expiry sweeps
    #[arg(long, default_value = "30")]
    pub sweep_interval_secs: u64,

    /// External VPN control binary (invoked as CLI -c NAME / CLI -d NAME)
    #[arg(long, env = "CROSSWIRE_VPN_CLI")]
    pub vpn_cli: Option<PathBuf>,

    /// Install host routes for resolved channel endpoints at startup
    #[arg(long)]
    pub install_routes: bool,

    /// Connect channels with a vpn= name at startup
    #[arg(long)]
    pub auto_connect: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log output format: pretty or json
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channels.is_empty() {
            anyhow::bail!("at least one --channel is required");
        }

        let mut names = HashSet::new();
        let mut binds = HashSet::new();
        for spec in &self.channels {
            if !names.insert(spec.name.as_str()) {
                anyhow::bail!("duplicate channel name: {:?}", spec.name);
            }
            if let Some(bind) = spec.bind {
                if !binds.insert(bind) {
                    anyhow::bail!("duplicate bind address: {}", bind);
                }
            }
            if spec.vpn.is_some() && self.vpn_cli.is_none() {
                anyhow::bail!(
                    "channel {:?} names a vpn configuration but no --vpn-cli is set",
                    spec.name
                );
            }
        }

        if self.log_format != "pretty" && self.log_format != "json" {
            anyhow::bail!(
                "unknown log format {:?} (expected pretty or json)",
                self.log_format
            );
        }
        Ok(())
    }
}

/// One configured tunnel channel.
///
/// A channel either binds locally (`bind=`) or dials out to a remote
/// rendezvous through a SOCKS5 relay (`endpoint=` + `via=`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub transport: Transport,
    pub bind: Option<SocketAddr>,
    /// External tunnel configuration name the connection tracker drives
    pub vpn: Option<String>,
    /// Remote rendezvous for dialed channels
    pub endpoint: Option<(String, u16)>,
    /// SOCKS5 relay address for dialed channels
    pub via: Option<SocketAddr>,
    /// Interface for setup-time host-route install
    pub iface: Option<String>,
}

impl FromStr for ChannelSpec {
    type Err = ChannelSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut name = None;
        let mut transport = None;
        let mut bind = None;
        let mut vpn = None;
        let mut endpoint = None;
        let mut via = None;
        let mut iface = None;

        for field in s.split(',').filter(|f| !f.trim().is_empty()) {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| ChannelSpecError::MalformedField(field.to_string()))?;
            let value = value.trim();
            match key.trim() {
                "name" => name = Some(value.to_string()),
                "transport" => transport = Some(value.parse::<Transport>()?),
                "bind" => {
                    bind = Some(value.parse::<SocketAddr>().map_err(|_| {
                        ChannelSpecError::BadAddress {
                            field: "bind",
                            value: value.to_string(),
                        }
                    })?)
                }
                "vpn" => vpn = Some(value.to_string()),
                "endpoint" => {
                    let (host, port) = value.rsplit_once(':').ok_or_else(|| {
                        ChannelSpecError::BadAddress {
                            field: "endpoint",
                            value: value.to_string(),
                        }
                    })?;
                    let port = port.parse::<u16>().map_err(|_| {
                        ChannelSpecError::BadAddress {
                            field: "endpoint",
                            value: value.to_string(),
                        }
                    })?;
                    endpoint = Some((host.to_string(), port));
                }
                "via" => {
                    via = Some(value.parse::<SocketAddr>().map_err(|_| {
                        ChannelSpecError::BadAddress {
                            field: "via",
                            value: value.to_string(),
                        }
                    })?)
                }
                "iface" => iface = Some(value.to_string()),
                other => return Err(ChannelSpecError::UnknownField(other.to_string())),
            }
        }

        let name = name.ok_or(ChannelSpecError::MissingField("name"))?;
        let transport = transport.ok_or(ChannelSpecError::MissingField("transport"))?;

        // Dialed channels are stream sources; everything else binds.
        if bind.is_none() {
            if endpoint.is_none() || via.is_none() {
                return Err(ChannelSpecError::NoSource);
            }
            if transport == Transport::Datagram {
                return Err(ChannelSpecError::BadTransport(
                    "dialed channels must be transport=stream".to_string(),
                ));
            }
        }

        Ok(ChannelSpec {
            name,
            transport,
            bind,
            vpn,
            endpoint,
            via,
            iface,
        })
    }
}
