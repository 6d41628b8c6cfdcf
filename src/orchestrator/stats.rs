//! Signal-set statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{Signal, SignalType};

/// Summary of the published signal set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStats {
    pub total_signals: usize,
    pub confirmed_signals: usize,
    pub signal_distribution: BTreeMap<SignalType, usize>,
    pub avg_strength: f64,
    /// When the last full analysis cycle completed
    pub last_analysis: Option<DateTime<Utc>>,
}

impl AnalysisStats {
    pub fn from_signals(signals: &[Signal], at: DateTime<Utc>) -> Self {
        let mut distribution = BTreeMap::new();
        for signal in signals {
            *distribution.entry(signal.signal_type).or_insert(0) += 1;
        }

        let avg_strength = if signals.is_empty() {
            0.0
        } else {
            signals.iter().map(|s| s.strength).sum::<f64>() / signals.len() as f64
        };

        Self {
            total_signals: signals.len(),
            confirmed_signals: signals.iter().filter(|s| s.confirmation_status).count(),
            signal_distribution: distribution,
            avg_strength,
            last_analysis: Some(at),
        }
    }
}

/// Operational counters for one cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleStats {
    pub symbols_fetched: usize,
    pub symbols_failed: usize,
    pub detector_failures: usize,
    pub duration_ms: u64,
    pub cache_degraded: bool,
}
