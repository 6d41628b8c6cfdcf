//! Read accessors for the transport layer
//!
//! Every accessor serves the cached value while it is live. On a miss it asks
//! for a bounded recompute, then falls back to the last published value and
//! finally to an empty result. None of them return an error.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

use super::snapshot::mark_unknown;
use super::{AnalysisOrchestrator, AnalysisStats, CycleKind};
use crate::analysis::VOLUME_PROFILE_BASELINE;
use crate::cache::keys;
use crate::killzone::KillzoneReport;
use crate::types::{
    Fractal, MarketSnapshot, Signal, SignalType, Symbol, TrueOpens, VolumeAnomaly,
};

/// Criteria for [`AnalysisOrchestrator::signals`]; empty fields match everything
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignalFilter {
    #[serde(default)]
    pub types: Vec<SignalType>,
    pub symbol: Option<Symbol>,
    pub min_strength: Option<f64>,
    #[serde(default)]
    pub confirmed_only: bool,
    pub time_from: Option<DateTime<Utc>>,
    pub time_to: Option<DateTime<Utc>>,
}

impl SignalFilter {
    pub fn matches(&self, signal: &Signal) -> bool {
        if !self.types.is_empty() && !self.types.contains(&signal.signal_type) {
            return false;
        }
        if self.symbol.is_some_and(|s| s != signal.symbol) {
            return false;
        }
        if self.min_strength.is_some_and(|min| signal.strength < min) {
            return false;
        }
        if self.confirmed_only && !signal.confirmation_status {
            return false;
        }
        if self.time_from.is_some_and(|from| signal.timestamp < from) {
            return false;
        }
        if self.time_to.is_some_and(|to| signal.timestamp > to) {
            return false;
        }
        true
    }
}

/// Where a read was served from
enum Served<T> {
    Live(T),
    LastGood(T),
    Empty,
}

impl AnalysisOrchestrator {
    /// Latest snapshot per requested symbol; an empty slice means every symbol
    pub async fn latest_snapshot(&self, symbols: &[Symbol]) -> BTreeMap<Symbol, MarketSnapshot> {
        let snapshots: BTreeMap<Symbol, MarketSnapshot> =
            match self.read_through(keys::SNAPSHOTS, CycleKind::Market).await {
                Served::Live(map) => map,
                Served::LastGood(map) => map
                    .into_iter()
                    .map(|(symbol, s)| (symbol, mark_unknown(&s)))
                    .collect(),
                Served::Empty => BTreeMap::new(),
            };

        if symbols.is_empty() {
            return snapshots;
        }
        snapshots
            .into_iter()
            .filter(|(symbol, _)| symbols.contains(symbol))
            .collect()
    }

    /// Published signals matching `filter`, newest first
    pub async fn signals(&self, filter: &SignalFilter) -> Vec<Signal> {
        let signals: Vec<Signal> = self
            .read_through(keys::SIGNALS, CycleKind::Full)
            .await
            .into_value()
            .unwrap_or_default();
        signals.into_iter().filter(|s| filter.matches(s)).collect()
    }

    /// Killzone status at the current instant, with the current priority overrides
    pub fn killzones(&self) -> KillzoneReport {
        let settings = self.ctx.settings.current();
        self.ctx
            .killzones
            .with_priorities(&settings.killzone_priorities)
            .report(Utc::now())
    }

    pub async fn true_opens(&self) -> BTreeMap<Symbol, TrueOpens> {
        self.read_through(keys::TRUE_OPENS, CycleKind::Full)
            .await
            .into_value()
            .unwrap_or_default()
    }

    /// Up to `limit` fractals for `symbol`, newest first
    pub async fn fractals(&self, symbol: Symbol, limit: usize) -> Vec<Fractal> {
        let mut fractals: Vec<Fractal> = self
            .read_through(&keys::fractals(symbol), CycleKind::Full)
            .await
            .into_value()
            .unwrap_or_default();
        fractals.truncate(limit);
        fractals
    }

    /// Anomalies at or above `threshold` (default: the volume multiplier), newest first.
    ///
    /// The published profile only holds above-average candles, so thresholds
    /// are floored at [`VOLUME_PROFILE_BASELINE`].
    pub async fn volume_anomalies(
        &self,
        symbol: Symbol,
        threshold: Option<f64>,
        limit: usize,
    ) -> Vec<VolumeAnomaly> {
        let threshold = threshold
            .unwrap_or_else(|| self.ctx.settings.current().volume_multiplier)
            .max(VOLUME_PROFILE_BASELINE);
        let anomalies: Vec<VolumeAnomaly> = self
            .read_through(&keys::volume(symbol), CycleKind::Full)
            .await
            .into_value()
            .unwrap_or_default();

        let mut selected: Vec<VolumeAnomaly> = anomalies
            .into_iter()
            .filter(|a| a.ratio >= threshold)
            .collect();
        selected.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        selected.truncate(limit);
        selected
    }

    pub async fn analysis_stats(&self) -> AnalysisStats {
        self.read_through(keys::STATS, CycleKind::Full)
            .await
            .into_value()
            .unwrap_or_default()
    }

    async fn read_through<T: DeserializeOwned>(&self, key: &str, kind: CycleKind) -> Served<T> {
        let cache = &self.ctx.cache;
        if let Some(value) = cache.get_json(key).await {
            return Served::Live(value);
        }

        for attempt in 1..=self.ctx.config.read_attempts {
            debug!(key, attempt, "Cache miss, recomputing for read");
            if self.refresh_for_read(key, kind).await {
                if let Some(value) = cache.get_json(key).await {
                    return Served::Live(value);
                }
            }
        }

        match cache.last_good(key) {
            Some(value) => {
                debug!(key, "Serving last published value");
                Served::LastGood(value)
            }
            None => Served::Empty,
        }
    }
}

impl<T> Served<T> {
    fn into_value(self) -> Option<T> {
        match self {
            Served::Live(v) | Served::LastGood(v) => Some(v),
            Served::Empty => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalPayload;
    use chrono::{Duration, TimeZone};

    fn signal(signal_type: SignalType, strength: f64, confirmed: bool, minute: i64) -> Signal {
        let timestamp =
            Utc.with_ymd_and_hms(2024, 3, 4, 14, 0, 0).unwrap() + Duration::minutes(minute);
        Signal {
            id: Signal::make_id(signal_type, Symbol::NQ, timestamp),
            signal_type,
            symbol: Symbol::NQ,
            strength,
            divergence_percentage: 0.0,
            primary_price: 100.0,
            secondary_price: 100.0,
            confirmation_status: confirmed,
            timestamp,
            payload: SignalPayload::FalseBreak {
                level: 100.0,
                sweep_extreme: 100.2,
                close: 99.9,
                excursion_pct: 0.2,
            },
            details: BTreeMap::new(),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = SignalFilter::default();
        assert!(filter.matches(&signal(SignalType::FalseBreakUp, 0.1, false, 0)));
    }

    #[test]
    fn filter_combines_criteria() {
        let filter = SignalFilter {
            types: vec![SignalType::FalseBreakUp],
            min_strength: Some(0.6),
            confirmed_only: true,
            time_from: Some(Utc.with_ymd_and_hms(2024, 3, 4, 14, 10, 0).unwrap()),
            ..Default::default()
        };

        assert!(filter.matches(&signal(SignalType::FalseBreakUp, 0.7, true, 15)));
        assert!(!filter.matches(&signal(SignalType::FalseBreakDown, 0.7, true, 15)));
        assert!(!filter.matches(&signal(SignalType::FalseBreakUp, 0.5, true, 15)));
        assert!(!filter.matches(&signal(SignalType::FalseBreakUp, 0.7, false, 15)));
        assert!(!filter.matches(&signal(SignalType::FalseBreakUp, 0.7, true, 5)));
    }

    #[test]
    fn symbol_filter_is_exact() {
        let filter = SignalFilter {
            symbol: Some(Symbol::ES),
            ..Default::default()
        };
        assert!(!filter.matches(&signal(SignalType::VolumeSpike, 0.9, false, 0)));
    }

    #[test]
    fn filter_deserializes_from_partial_json() {
        let filter: SignalFilter =
            serde_json::from_str(r#"{"types":["volume_spike"],"confirmed_only":true}"#).unwrap();
        assert_eq!(filter.types, vec![SignalType::VolumeSpike]);
        assert!(filter.confirmed_only);
        assert!(filter.min_strength.is_none());
    }
}
