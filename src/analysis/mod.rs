//! Analysis module - Signal detectors and structural analyzers
//!
//! Detectors are stateless and read an immutable candle set shared across
//! threads. Incremental state (fractal index, true-open anchors) lives in
//! [`StructuralAnalyzers`] and is advanced once per cycle by the orchestrator.

pub mod divergence;
pub mod fractals;
pub mod indicators;
pub mod liquidity;
pub mod true_open;
pub mod volume;

pub use divergence::{detect_divergence, divergence_strength, synchronize};
pub use fractals::{detect_fractals, FractalTracker};
pub use indicators::technical_indicators;
pub use true_open::TrueOpenTracker;
pub use volume::{detect_volume_anomalies, severity_for, volume_signals};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::AnalysisSettings;
use crate::error::AnalysisError;
use crate::killzone::KillzoneScheduler;
use crate::types::{Candle, Fractal, Signal, Symbol, TrueOpens, VolumeAnomaly};

/// Baseline ratio for the published volume profile; readers filter above it
pub const VOLUME_PROFILE_BASELINE: f64 = 1.0;

/// Immutable input shared by every detector in a cycle
#[derive(Debug, Clone)]
pub struct DetectionInput {
    pub candles: HashMap<Symbol, Vec<Candle>>,
    pub primary: Symbol,
    pub secondary: Symbol,
    pub settings: AnalysisSettings,
    pub killzones: KillzoneScheduler,
}

impl DetectionInput {
    pub fn candles_for(&self, symbol: Symbol) -> &[Candle] {
        self.candles.get(&symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Symbols with candles, in stable order
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.candles.keys().copied().collect();
        symbols.sort();
        symbols
    }
}

/// A signal detector run once per cycle
pub trait SignalDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, input: &DetectionInput) -> Result<Vec<Signal>, AnalysisError>;
}

/// SMT divergence on the configured pair
#[derive(Debug, Default)]
pub struct DivergenceDetector;

impl SignalDetector for DivergenceDetector {
    fn name(&self) -> &'static str {
        "divergence"
    }

    fn detect(&self, input: &DetectionInput) -> Result<Vec<Signal>, AnalysisError> {
        detect_divergence(
            input.primary,
            input.candles_for(input.primary),
            input.secondary,
            input.candles_for(input.secondary),
            &input.settings,
        )
    }
}

/// Volume spikes and volume divergences for every symbol
#[derive(Debug, Default)]
pub struct VolumeDetector;

impl SignalDetector for VolumeDetector {
    fn name(&self) -> &'static str {
        "volume"
    }

    fn detect(&self, input: &DetectionInput) -> Result<Vec<Signal>, AnalysisError> {
        Ok(input
            .symbols()
            .into_iter()
            .flat_map(|s| volume_signals(s, input.candles_for(s), &input.settings))
            .collect())
    }
}

/// False breaks of the latest swing levels for every symbol
#[derive(Debug, Default)]
pub struct FalseBreakDetector;

impl SignalDetector for FalseBreakDetector {
    fn name(&self) -> &'static str {
        "false_break"
    }

    fn detect(&self, input: &DetectionInput) -> Result<Vec<Signal>, AnalysisError> {
        Ok(input
            .symbols()
            .into_iter()
            .flat_map(|s| liquidity::detect_false_breaks(s, input.candles_for(s), &input.settings))
            .collect())
    }
}

/// Judas swings inside the active killzone for every symbol
#[derive(Debug, Default)]
pub struct JudasSwingDetector;

impl SignalDetector for JudasSwingDetector {
    fn name(&self) -> &'static str {
        "judas_swing"
    }

    fn detect(&self, input: &DetectionInput) -> Result<Vec<Signal>, AnalysisError> {
        Ok(input
            .symbols()
            .into_iter()
            .filter_map(|s| {
                liquidity::detect_judas_swing(
                    s,
                    input.candles_for(s),
                    &input.killzones,
                    &input.settings,
                )
            })
            .collect())
    }
}

/// Every built-in detector
pub fn default_detectors() -> Vec<Arc<dyn SignalDetector>> {
    vec![
        Arc::new(DivergenceDetector),
        Arc::new(VolumeDetector),
        Arc::new(FalseBreakDetector),
        Arc::new(JudasSwingDetector),
    ]
}

/// Stateful structural analysis owned by the orchestrator
#[derive(Debug, Clone)]
pub struct StructuralAnalyzers {
    fractals: HashMap<Symbol, FractalTracker>,
    true_opens: TrueOpenTracker,
}

impl StructuralAnalyzers {
    pub fn new(feed_utc_offset_minutes: i32) -> Self {
        Self {
            fractals: HashMap::new(),
            true_opens: TrueOpenTracker::with_offset_minutes(feed_utc_offset_minutes),
        }
    }

    /// Advance the trackers for one symbol with freshly fetched candles
    pub fn observe(&mut self, symbol: Symbol, candles: &[Candle], settings: &AnalysisSettings) {
        let tracker = self
            .fractals
            .entry(symbol)
            .or_insert_with(|| FractalTracker::new(settings.fractal_period, settings.max_fractals));

        // A new half-window invalidates the index
        if tracker.period() != settings.fractal_period {
            *tracker = FractalTracker::new(settings.fractal_period, settings.max_fractals);
        } else {
            tracker.set_max_fractals(settings.max_fractals);
        }

        let new_fractals = tracker.update(candles);
        let new_anchors = self.true_opens.update(symbol, candles);
        tracing::debug!(
            symbol = %symbol,
            new_fractals,
            new_anchors,
            "Structural trackers advanced"
        );
    }

    /// Newest-first fractals for `symbol`, including unconfirmed candidates
    pub fn fractals(&self, symbol: Symbol, limit: usize) -> Vec<Fractal> {
        self.fractals
            .get(&symbol)
            .map(|t| t.recent(limit))
            .unwrap_or_default()
    }

    pub fn true_opens(&self) -> BTreeMap<Symbol, TrueOpens> {
        self.true_opens.all()
    }

    /// Volume profile for the published cache: every above-average candle
    pub fn volume_profile(candles: &[Candle], settings: &AnalysisSettings) -> Vec<VolumeAnomaly> {
        detect_volume_anomalies(
            candles,
            settings.volume_lookback,
            VOLUME_PROFILE_BASELINE,
            settings,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candles(len: usize) -> Vec<Candle> {
        (0..len)
            .map(|i| {
                let wave = ((i as f64) * 0.7).sin() * 5.0;
                Candle {
                    timestamp: Utc
                        .timestamp_opt(1_700_000_000 + i as i64 * 900, 0)
                        .unwrap(),
                    open: 100.0 + wave,
                    high: 101.0 + wave,
                    low: 99.0 + wave,
                    close: 100.0 + wave,
                    volume: if i % 10 == 9 { 5_000.0 } else { 1_000.0 },
                }
            })
            .collect()
    }

    fn input(settings: AnalysisSettings) -> DetectionInput {
        let mut map = HashMap::new();
        map.insert(Symbol::ES, candles(60));
        map.insert(Symbol::NQ, candles(60));
        DetectionInput {
            candles: map,
            primary: Symbol::ES,
            secondary: Symbol::NQ,
            settings,
            killzones: KillzoneScheduler::default(),
        }
    }

    #[test]
    fn detectors_are_deterministic() {
        let input = input(AnalysisSettings::default());
        for detector in default_detectors() {
            let first = detector.detect(&input);
            let second = detector.detect(&input);
            assert_eq!(first, second, "{}", detector.name());
        }
    }

    #[test]
    fn identical_series_never_diverge() {
        let signals = DivergenceDetector
            .detect(&input(AnalysisSettings::default()))
            .unwrap();
        assert!(signals.is_empty());
    }

    #[test]
    fn period_change_resets_fractal_index() {
        let mut analyzers = StructuralAnalyzers::new(0);
        let data = candles(60);
        let settings = AnalysisSettings::default();
        analyzers.observe(Symbol::ES, &data, &settings);
        assert!(!analyzers.fractals(Symbol::ES, 100).is_empty());

        let wider = AnalysisSettings {
            fractal_period: 3,
            ..settings
        };
        analyzers.observe(Symbol::ES, &data, &wider);
        assert!(analyzers
            .fractals(Symbol::ES, 100)
            .iter()
            .all(|f| !f.confirmed || f.index >= 3));
    }

    #[test]
    fn volume_profile_includes_every_above_average_candle() {
        let profile = StructuralAnalyzers::volume_profile(&candles(60), &AnalysisSettings::default());
        assert!(!profile.is_empty());
        assert!(profile.iter().all(|a| a.ratio > VOLUME_PROFILE_BASELINE));
    }
}
