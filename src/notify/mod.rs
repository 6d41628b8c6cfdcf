//! Notification fan-out
//!
//! The orchestrator is the only writer. Subscribers receive JSON events over a
//! bounded broadcast channel; lagging or absent subscribers never block it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::orchestrator::AnalysisStats;
use crate::types::{MarketSnapshot, Signal, Symbol};

/// Event pushed to subscribers after a publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PipelineEvent {
    MarketUpdate(BTreeMap<Symbol, MarketSnapshot>),
    SignalsUpdate {
        signals: Vec<Signal>,
        stats: AnalysisStats,
    },
    Heartbeat(DateTime<Utc>),
}

/// Channel for broadcasting pipeline events
#[derive(Debug, Clone)]
pub struct SignalBroadcaster {
    tx: broadcast::Sender<String>,
}

impl SignalBroadcaster {
    /// Create a new broadcaster with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to receive broadcast messages
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Broadcast an event to all subscribers
    pub fn broadcast(&self, event: &PipelineEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                // Ignore send errors (no receivers is fine)
                let _ = self.tx.send(json);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode pipeline event"),
        }
    }

    pub fn broadcast_market(&self, snapshots: BTreeMap<Symbol, MarketSnapshot>) {
        self.broadcast(&PipelineEvent::MarketUpdate(snapshots));
    }

    pub fn broadcast_signals(&self, signals: Vec<Signal>, stats: AnalysisStats) {
        self.broadcast(&PipelineEvent::SignalsUpdate { signals, stats });
    }

    pub fn broadcast_heartbeat(&self) {
        self.broadcast(&PipelineEvent::Heartbeat(Utc::now()));
    }
}

impl Default for SignalBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcasting_without_subscribers_is_fine() {
        let broadcaster = SignalBroadcaster::new(4);
        broadcaster.broadcast_heartbeat();
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_tagged_json() {
        let broadcaster = SignalBroadcaster::new(4);
        let mut rx = broadcaster.subscribe();

        broadcaster.broadcast_market(BTreeMap::new());

        let msg = rx.recv().await.unwrap();
        let event: PipelineEvent = serde_json::from_str(&msg).unwrap();
        assert_eq!(event, PipelineEvent::MarketUpdate(BTreeMap::new()));
        assert!(msg.contains("\"type\":\"market_update\""));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let broadcaster = SignalBroadcaster::new(2);
        let mut rx = broadcaster.subscribe();

        for _ in 0..5 {
            broadcaster.broadcast_heartbeat();
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
