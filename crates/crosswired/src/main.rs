//! crosswired - multi-tunnel event correlation daemon
//!
//! Listens on each configured channel, feeds observations into the
//! single-owner correlator, and serves the HTTP control surface.

use clap::Parser;
use crosswire_core::correlate::CorrelationMap;
use crosswire_core::history::HistoryBuffer;
use crosswire_core::types::{ChannelId, Transport};
use crosswired::config::Config;
use crosswired::control::{run_control_server, ChannelView, ControlState};
use crosswired::correlator::{spawn_correlator, CorrelatorStats, GateCell};
use crosswired::listener::{
    run_datagram_listener, run_dialed_channel, run_stream_listener, ChannelRuntime,
};
use crosswired::setup::{self, Socks5Dialer};
use crosswired::tracker::{ConnectionTracker, NoTunnelControl, TunnelControl, VpnCli};
use parking_lot::RwLock;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    // Initialize logging
    let default_directive = if config.verbose {
        "crosswired=debug"
    } else {
        "crosswired=info"
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(default_directive.parse().expect("static directive"));
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!(
        "crosswired v{} - multi-tunnel correlation daemon",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("daemon error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let gate = Arc::new(GateCell::new(config.gate));
    let stats = Arc::new(CorrelatorStats::default());
    let (satisfied_tx, _) = broadcast::channel(64);
    let (shutdown_tx, _) = broadcast::channel(1);

    let tunnel_control: Arc<dyn TunnelControl> = match &config.vpn_cli {
        Some(path) => Arc::new(VpnCli::new(path.clone())),
        None => Arc::new(NoTunnelControl),
    };
    let tracker = Arc::new(ConnectionTracker::new(tunnel_control));

    // Gate evaluation is defined over the fixed channel count N.
    let map = CorrelationMap::new(
        config.channels.len(),
        Duration::from_secs(config.entry_ttl_secs),
    );
    let (events, correlator_task) = spawn_correlator(
        map,
        gate.clone(),
        stats.clone(),
        satisfied_tx,
        Duration::from_secs(config.sweep_interval_secs),
        shutdown_tx.subscribe(),
    );

    let mut views = Vec::new();
    let mut listener_tasks = Vec::new();

    for (index, spec) in config.channels.iter().enumerate() {
        let id = ChannelId(index as u16);
        let name: Arc<str> = Arc::from(spec.name.as_str());
        let history = Arc::new(RwLock::new(HistoryBuffer::new(config.history_cap)));

        tracker.register(&spec.name, id, spec.vpn.clone());
        views.push(ChannelView {
            id,
            name: name.clone(),
            transport: spec.transport,
            history: history.clone(),
        });

        // Setup phase: resolve the endpoint and optionally steer it
        // over the requested interface. Failures degrade, never abort.
        if let Some((host, _)) = &spec.endpoint {
            if let Some(ip) = setup::resolve_endpoint(host).await {
                if config.install_routes {
                    if let Some(iface) = &spec.iface {
                        if let Err(e) = setup::install_host_route(ip, iface).await {
                            warn!(channel = %name, %ip, iface, error = %e, "route install failed");
                        }
                    }
                }
            }
        }

        let rt = ChannelRuntime {
            id,
            name: name.clone(),
            history,
            events: events.clone(),
        };
        let shutdown_rx = shutdown_tx.subscribe();

        let task = if let Some(bind) = spec.bind {
            match spec.transport {
                Transport::Datagram => tokio::spawn(async move {
                    if let Err(e) = run_datagram_listener(rt, bind, shutdown_rx).await {
                        error!(channel = %name, error = %e, "datagram listener failed");
                    }
                }),
                Transport::Stream => tokio::spawn(async move {
                    if let Err(e) = run_stream_listener(rt, bind, shutdown_rx).await {
                        error!(channel = %name, error = %e, "stream listener failed");
                    }
                }),
            }
        } else if let (Some((host, port)), Some(via)) = (&spec.endpoint, spec.via) {
            let dialer = Socks5Dialer::new(via);
            let host = host.clone();
            let port = *port;
            tokio::spawn(async move {
                if let Err(e) = run_dialed_channel(rt, dialer, host, port, shutdown_rx).await {
                    error!(channel = %name, error = %e, "dialed channel failed");
                }
            })
        } else {
            anyhow::bail!("channel {:?} has no source", spec.name);
        };
        listener_tasks.push(task);
    }

    if config.auto_connect {
        for spec in &config.channels {
            if spec.vpn.is_some() {
                if let Err(e) = tracker.request_connect(&spec.name) {
                    warn!(channel = %spec.name, error = %e, "startup connect failed");
                }
            }
        }
    }

    let control_state = Arc::new(ControlState {
        channels: views,
        gate,
        tracker: tracker.clone(),
        stats,
    });
    let control_task = tokio::spawn(run_control_server(
        config.control_listen,
        control_state,
        shutdown_tx.subscribe(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    let _ = shutdown_tx.send(());

    // Best-effort teardown of still-connected tunnels.
    tracker.shutdown_disconnect_all().await;

    let _ = correlator_task.await;
    for task in listener_tasks {
        task.abort();
    }
    control_task.abort();

    Ok(())
}
