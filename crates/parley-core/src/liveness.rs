//! Liveness monitoring for Parley.
//!
//! The monitor pings every registered connection at a fixed interval and
//! evicts connections that left `max_missed` pings in a row unanswered.
//! Eviction only signals the connection's driver; the driver runs the normal
//! disconnect path.

use crate::link::now_millis;
use crate::registry::ConnectionRegistry;
use parley_protocol::{Envelope, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Liveness configuration.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Time between pings.
    pub interval: Duration,
    /// Unanswered pings before a connection is evicted.
    pub max_missed: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_missed: 2,
        }
    }
}

/// Result of one liveness sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections that were pinged.
    pub pinged: usize,
    /// Connections evicted in this sweep.
    pub evicted: Vec<PeerId>,
}

/// Periodic heartbeat sender and dead-connection detector.
pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    /// Create a monitor over the given registry.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, config: LivenessConfig) -> Self {
        Self { registry, config }
    }

    /// Run one sweep over all registered connections.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for (peer_id, link) in self.registry.links() {
            if link.is_evicted() {
                continue;
            }

            if link.missed_pongs() >= self.config.max_missed {
                if link.evict() {
                    info!(
                        peer = %peer_id,
                        missed = link.missed_pongs(),
                        last_seen = link.last_seen(),
                        "Evicting unresponsive connection"
                    );
                    report.evicted.push(peer_id);
                }
                continue;
            }

            link.record_ping_sent();
            let ping = Envelope::Ping {
                timestamp: Some(now_millis()),
            };
            if let Err(e) = link.send(ping) {
                // An unsent ping still counts as missed.
                debug!(peer = %peer_id, error = %e, "Failed to queue ping");
            }
            report.pinged += 1;
        }

        report
    }

    /// Sweep forever at the configured interval.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_missed = self.config.max_missed,
            "Liveness monitor started"
        );

        loop {
            ticker.tick().await;
            let report = self.sweep();
            debug!(
                pinged = report.pinged,
                evicted = report.evicted.len(),
                "Liveness sweep"
            );
        }
    }

    /// Spawn the monitor onto the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::PeerLink;

    fn monitor_with_peer() -> (LivenessMonitor, PeerId, PeerLink, crate::link::Outbox) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (link, outbox) = PeerLink::channel(16);
        let id = registry.register(link.clone());
        let monitor = LivenessMonitor::new(registry, LivenessConfig::default());
        (monitor, id, link, outbox)
    }

    #[test]
    fn test_evicts_after_two_silent_intervals() {
        let (monitor, id, link, mut outbox) = monitor_with_peer();

        assert_eq!(monitor.sweep().pinged, 1);
        assert!(monitor.sweep().evicted.is_empty());
        assert!(!link.is_evicted());

        let report = monitor.sweep();
        assert_eq!(report.evicted, vec![id]);
        assert!(outbox.is_evicted());

        let pings = std::iter::from_fn(|| outbox.try_recv())
            .filter(|e| matches!(**e, Envelope::Ping { .. }))
            .count();
        assert_eq!(pings, 2);

        // Already evicted connections are skipped until unregistered.
        assert_eq!(monitor.sweep(), SweepReport::default());
    }

    #[test]
    fn test_pong_keeps_connection_alive() {
        let (monitor, _id, link, _outbox) = monitor_with_peer();

        for _ in 0..5 {
            monitor.sweep();
            link.record_pong();
        }
        assert!(monitor.sweep().evicted.is_empty());
        assert!(!link.is_evicted());
    }

    #[test]
    fn test_full_queue_still_counts_as_missed() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (link, _outbox) = PeerLink::channel(1);
        let id = registry.register(link.clone());
        let monitor = LivenessMonitor::new(registry, LivenessConfig::default());

        monitor.sweep();
        monitor.sweep();
        assert_eq!(monitor.sweep().evicted, vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_pings_on_interval() {
        let (monitor, _id, _link, mut outbox) = monitor_with_peer();
        let handle = monitor.spawn();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(outbox.try_recv().is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(
            outbox.try_recv().as_deref(),
            Some(Envelope::Ping { .. })
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(outbox.is_evicted());

        handle.abort();
    }
}
