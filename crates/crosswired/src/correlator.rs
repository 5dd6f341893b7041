//! Single-owner correlator task
//!
//! The correlation map is owned by exactly one task fed through an mpsc
//! queue, so every observe-evaluate-consume step for a key is serialized
//! without any locking of the map itself. The active gate lives in a
//! small shared cell read at evaluation time, which makes a hot swap
//! take effect on the very next evaluation.

use crosswire_core::correlate::CorrelationMap;
use crosswire_core::gate::LogicGate;
use crosswire_core::types::{GateSatisfied, Observation};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Queue depth between listeners and the correlator
pub const EVENT_QUEUE_DEPTH: usize = 1024;

/// Runtime-swappable active gate
#[derive(Debug)]
pub struct GateCell(RwLock<LogicGate>);

impl GateCell {
    pub fn new(gate: LogicGate) -> Self {
        Self(RwLock::new(gate))
    }

    pub fn get(&self) -> LogicGate {
        *self.0.read()
    }

    /// Atomic swap; applies to all future evaluations.
    pub fn set(&self, gate: LogicGate) -> LogicGate {
        std::mem::replace(&mut *self.0.write(), gate)
    }
}

/// Counters the control surface reports
#[derive(Debug, Default)]
pub struct CorrelatorStats {
    satisfied_total: AtomicU64,
    pending_entries: AtomicUsize,
}

impl CorrelatorStats {
    pub fn satisfied_total(&self) -> u64 {
        self.satisfied_total.load(Ordering::Relaxed)
    }

    pub fn pending_entries(&self) -> usize {
        self.pending_entries.load(Ordering::Relaxed)
    }
}

/// Listener-side handle to the correlator queue
#[derive(Clone)]
pub struct CorrelatorHandle {
    tx: mpsc::Sender<Observation>,
}

impl CorrelatorHandle {
    /// Deliver one observation, awaiting queue capacity. Per-channel
    /// ordering is preserved because each listener task submits
    /// sequentially.
    pub async fn submit(&self, observation: Observation) {
        if self.tx.send(observation).await.is_err() {
            warn!("correlator queue closed, dropping observation");
        }
    }
}

/// Spawn the correlator task.
///
/// Returns the handle listeners submit through and the task's join
/// handle. Satisfaction signals go out on `satisfied_tx`.
pub fn spawn_correlator(
    mut map: CorrelationMap,
    gate: Arc<GateCell>,
    stats: Arc<CorrelatorStats>,
    satisfied_tx: broadcast::Sender<GateSatisfied>,
    sweep_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> (CorrelatorHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Observation>(EVENT_QUEUE_DEPTH);

    let handle = tokio::spawn(async move {
        let mut ticker = interval(sweep_interval);
        ticker.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(obs) = event else { break };
                    let active = gate.get();
                    debug!(
                        channel = %obs.channel,
                        key = %obs.key,
                        gate = %active,
                        "observation"
                    );
                    if let Some(hit) = map.observe(obs.channel, obs.key, active, Instant::now()) {
                        info!(
                            gate = %hit.gate,
                            key = %hit.key,
                            observed_by = ?hit.observed_by,
                            "gate satisfied"
                        );
                        stats.satisfied_total.fetch_add(1, Ordering::Relaxed);
                        // No subscribers is fine; the signal is also logged.
                        let _ = satisfied_tx.send(hit);
                    }
                    stats.pending_entries.store(map.pending(), Ordering::Relaxed);
                }
                _ = ticker.tick() => {
                    let evicted = map.sweep(Instant::now());
                    if evicted > 0 {
                        debug!(evicted, "expired stale correlation entries");
                        stats.pending_entries.store(map.pending(), Ordering::Relaxed);
                    }
                }
                _ = shutdown.recv() => {
                    debug!("correlator shutting down");
                    break;
                }
            }
        }
    });

    (CorrelatorHandle { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosswire_core::types::ChannelId;
    use tokio::time::timeout;

    const TTL: Duration = Duration::from_secs(300);

    fn setup(
        n: usize,
        gate: LogicGate,
    ) -> (
        CorrelatorHandle,
        broadcast::Receiver<GateSatisfied>,
        Arc<GateCell>,
        Arc<CorrelatorStats>,
        broadcast::Sender<()>,
    ) {
        let gate = Arc::new(GateCell::new(gate));
        let stats = Arc::new(CorrelatorStats::default());
        let (satisfied_tx, satisfied_rx) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (handle, _join) = spawn_correlator(
            CorrelationMap::new(n, TTL),
            gate.clone(),
            stats.clone(),
            satisfied_tx,
            Duration::from_secs(3600),
            shutdown_rx,
        );
        (handle, satisfied_rx, gate, stats, shutdown_tx)
    }

    fn obs(channel: u16, payload: &str) -> Observation {
        Observation::new(ChannelId(channel), payload.as_bytes())
    }

    #[tokio::test]
    async fn concurrent_same_key_under_and_fires_exactly_once() {
        let n = 4;
        let (handle, mut satisfied_rx, _gate, stats, _shutdown) = setup(n, LogicGate::And);

        let mut senders = Vec::new();
        for ch in 0..n as u16 {
            let handle = handle.clone();
            senders.push(tokio::spawn(async move {
                handle.submit(obs(ch, "ping")).await;
            }));
        }
        for s in senders {
            s.await.unwrap();
        }

        let hit = timeout(Duration::from_secs(1), satisfied_rx.recv())
            .await
            .expect("one satisfaction expected")
            .unwrap();
        assert_eq!(hit.observed_by.len(), n);

        // Never a second signal from the same accumulation.
        assert!(timeout(Duration::from_millis(100), satisfied_rx.recv())
            .await
            .is_err());
        assert_eq!(stats.satisfied_total(), 1);
        assert_eq!(stats.pending_entries(), 0);
    }

    #[tokio::test]
    async fn hot_swap_changes_next_evaluation() {
        let (handle, mut satisfied_rx, gate, _stats, _shutdown) = setup(3, LogicGate::And);

        handle.submit(obs(0, "k")).await;
        // Pending at k=1 of 3 under AND.
        assert!(timeout(Duration::from_millis(100), satisfied_rx.recv())
            .await
            .is_err());

        gate.set(LogicGate::Xnor);
        handle.submit(obs(1, "k")).await;

        let hit = timeout(Duration::from_secs(1), satisfied_rx.recv())
            .await
            .expect("XNOR true at k == 2")
            .unwrap();
        assert_eq!(hit.gate, LogicGate::Xnor);
    }

    #[tokio::test]
    async fn lone_channel_under_and_stays_pending() {
        let (handle, mut satisfied_rx, _gate, stats, _shutdown) = setup(2, LogicGate::And);

        handle.submit(obs(0, "solo")).await;
        handle.submit(obs(0, "solo")).await;
        assert!(timeout(Duration::from_millis(100), satisfied_rx.recv())
            .await
            .is_err());
        assert_eq!(stats.pending_entries(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_the_task() {
        let (_handle, _satisfied_rx, _gate, _stats, shutdown) = setup(2, LogicGate::And);
        let _ = shutdown.send(());
        // Dropping the handle after shutdown must not hang anything.
    }

    #[test]
    fn gate_cell_swap_returns_previous() {
        let cell = GateCell::new(LogicGate::And);
        assert_eq!(cell.set(LogicGate::Nor), LogicGate::And);
        assert_eq!(cell.get(), LogicGate::Nor);
    }
}
