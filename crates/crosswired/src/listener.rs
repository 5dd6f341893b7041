//! Per-channel listeners
//!
//! One task per channel. A listener converts each unit of received data
//! into an observation, appends it to the channel's history, and submits
//! it to the correlator. Failure to bind is fatal to that one listener
//! only; read errors on a stream close only that connection.

use crate::correlator::CorrelatorHandle;
use crate::setup::Socks5Dialer;
use crosswire_core::history::{HistoryBuffer, HistoryEntry};
use crosswire_core::types::{ChannelId, Observation};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Receive buffer per read
const READ_BUF_SIZE: usize = 4096;

/// Redial delay for dialed channels after the rendezvous drops
const REDIAL_DELAY: Duration = Duration::from_secs(5);

/// Listener errors
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-channel context shared between a listener and the rest of the daemon
#[derive(Clone)]
pub struct ChannelRuntime {
    pub id: ChannelId,
    pub name: Arc<str>,
    pub history: Arc<RwLock<HistoryBuffer>>,
    pub events: CorrelatorHandle,
}

impl ChannelRuntime {
    /// Record one received payload: history append, then correlator
    /// submission.
    async fn record(&self, payload: &[u8]) {
        let obs = Observation::new(self.id, payload);
        self.history
            .write()
            .push(HistoryEntry::new(obs.received_at, obs.summary.clone()));
        self.events.submit(obs).await;
    }
}

/// Bind and run a datagram listener. One datagram = one observation.
pub async fn run_datagram_listener(
    rt: ChannelRuntime,
    bind: SocketAddr,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), ListenerError> {
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|source| ListenerError::Bind { addr: bind, source })?;
    info!(channel = %rt.name, %bind, "datagram listener up");
    datagram_loop(socket, rt, shutdown).await;
    Ok(())
}

async fn datagram_loop(
    socket: UdpSocket,
    rt: ChannelRuntime,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, peer)) => {
                        debug!(channel = %rt.name, %peer, len, "datagram received");
                        rt.record(&buf[..len]).await;
                    }
                    Err(e) => {
                        // Transient: keep receiving.
                        warn!(channel = %rt.name, error = %e, "datagram receive error");
                    }
                }
            }
            _ = shutdown.recv() => {
                debug!(channel = %rt.name, "datagram listener shutting down");
                break;
            }
        }
    }
}

/// Bind and run a stream listener. Each complete read on an accepted
/// connection yields one observation; the accept loop never exits
/// except on shutdown.
pub async fn run_stream_listener(
    rt: ChannelRuntime,
    bind: SocketAddr,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), ListenerError> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|source| ListenerError::Bind { addr: bind, source })?;
    info!(channel = %rt.name, %bind, "stream listener up");
    stream_loop(listener, rt, shutdown).await;
    Ok(())
}

/// Why one connection's read loop ended
#[derive(Debug, PartialEq, Eq)]
enum ReadOutcome {
    PeerClosed,
    Shutdown,
}

async fn stream_loop(
    listener: TcpListener,
    rt: ChannelRuntime,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(channel = %rt.name, %peer, "connection accepted");
                        match read_stream(&rt, stream, &mut shutdown).await {
                            // A shutdown consumed mid-connection still
                            // ends the accept loop.
                            Ok(ReadOutcome::Shutdown) => {
                                debug!(channel = %rt.name, "stream listener shutting down");
                                return;
                            }
                            Ok(ReadOutcome::PeerClosed) => {}
                            Err(e) => {
                                // Closes this connection only.
                                warn!(channel = %rt.name, %peer, error = %e, "connection error");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(channel = %rt.name, error = %e, "accept error");
                    }
                }
            }
            _ = shutdown.recv() => {
                debug!(channel = %rt.name, "stream listener shutting down");
                return;
            }
        }
    }
}

/// Read observations off one connection until the peer closes it or
/// shutdown is signalled.
async fn read_stream(
    rt: &ChannelRuntime,
    mut stream: TcpStream,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<ReadOutcome, ListenerError> {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                let len = result?;
                if len == 0 {
                    debug!(channel = %rt.name, "peer closed connection");
                    return Ok(ReadOutcome::PeerClosed);
                }
                rt.record(&buf[..len]).await;
            }
            _ = shutdown.recv() => return Ok(ReadOutcome::Shutdown),
        }
    }
}

/// Run a dialed channel: reach the rendezvous through the SOCKS5 relay
/// and treat the resulting stream as this channel's source, redialing
/// with a fixed delay whenever it drops.
pub async fn run_dialed_channel(
    rt: ChannelRuntime,
    dialer: Socks5Dialer,
    host: String,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ListenerError> {
    loop {
        match dialer.dial(&host, port).await {
            Ok(stream) => {
                info!(channel = %rt.name, %host, port, "rendezvous connected");
                match read_stream(&rt, stream, &mut shutdown).await {
                    Ok(ReadOutcome::Shutdown) => {
                        debug!(channel = %rt.name, "dialed channel shutting down");
                        return Ok(());
                    }
                    Ok(ReadOutcome::PeerClosed) => {}
                    Err(e) => {
                        warn!(channel = %rt.name, error = %e, "rendezvous stream error");
                    }
                }
            }
            Err(e) => {
                warn!(channel = %rt.name, %host, port, error = %e, "rendezvous dial failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(REDIAL_DELAY) => {}
            _ = shutdown.recv() => {
                debug!(channel = %rt.name, "dialed channel shutting down");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{spawn_correlator, CorrelatorStats, GateCell};
    use crosswire_core::correlate::CorrelationMap;
    use crosswire_core::gate::LogicGate;
    use crosswire_core::types::GateSatisfied;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    struct Harness {
        rt: ChannelRuntime,
        satisfied_rx: broadcast::Receiver<GateSatisfied>,
        shutdown_tx: broadcast::Sender<()>,
    }

    /// One-channel harness under OR, so every observation satisfies.
    fn harness() -> Harness {
        let gate = Arc::new(GateCell::new(LogicGate::Or));
        let stats = Arc::new(CorrelatorStats::default());
        let (satisfied_tx, satisfied_rx) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (events, _join) = spawn_correlator(
            CorrelationMap::new(1, Duration::from_secs(300)),
            gate,
            stats,
            satisfied_tx,
            Duration::from_secs(3600),
            shutdown_rx,
        );
        let rt = ChannelRuntime {
            id: ChannelId(0),
            name: Arc::from("test"),
            history: Arc::new(RwLock::new(HistoryBuffer::new(50))),
            events,
        };
        Harness {
            rt,
            satisfied_rx,
            shutdown_tx,
        }
    }

    #[tokio::test]
    async fn datagram_becomes_observation_and_history_entry() {
        let mut h = harness();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let rt = h.rt.clone();
        let shutdown_rx = h.shutdown_tx.subscribe();
        tokio::spawn(datagram_loop(socket, rt, shutdown_rx));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"ping", addr).await.unwrap();

        let hit = timeout(Duration::from_secs(1), h.satisfied_rx.recv())
            .await
            .expect("datagram should reach the correlator")
            .unwrap();
        assert_eq!(hit.observed_by, vec![ChannelId(0)]);

        let history = h.rt.history.read();
        assert_eq!(history.len(), 1);
        assert_eq!(history.entries().next().unwrap().summary, "ping");
    }

    #[tokio::test]
    async fn stream_reads_become_observations_across_connections() {
        let mut h = harness();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let rt = h.rt.clone();
        let shutdown_rx = h.shutdown_tx.subscribe();
        tokio::spawn(stream_loop(listener, rt, shutdown_rx));

        // First connection, then a second one: the accept loop survives
        // the close in between.
        for payload in [b"one".as_slice(), b"two".as_slice()] {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            conn.write_all(payload).await.unwrap();
            conn.shutdown().await.unwrap();

            timeout(Duration::from_secs(1), h.satisfied_rx.recv())
                .await
                .expect("stream read should reach the correlator")
                .unwrap();
        }

        assert_eq!(h.rt.history.read().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_mid_connection_stops_accept_loop() {
        let mut h = harness();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let rt = h.rt.clone();
        let shutdown_rx = h.shutdown_tx.subscribe();
        let task = tokio::spawn(stream_loop(listener, rt, shutdown_rx));

        // Hold a connection open so the shutdown signal arrives while
        // the loop is inside a per-connection read.
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"held").await.unwrap();
        timeout(Duration::from_secs(1), h.satisfied_rx.recv())
            .await
            .expect("payload should reach the correlator")
            .unwrap();

        h.shutdown_tx.send(()).unwrap();
        timeout(Duration::from_secs(1), task)
            .await
            .expect("listener task should exit after shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported_not_panicked() {
        let h = harness();
        // Occupy a port, then ask the listener for the same one.
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = run_stream_listener(h.rt.clone(), addr, h.shutdown_tx.subscribe())
            .await
            .unwrap_err();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }
}
