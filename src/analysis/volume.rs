//! Volume anomaly detection

use serde_json::json;
use std::collections::BTreeMap;

use crate::config::AnalysisSettings;
use crate::types::{Candle, Severity, Signal, SignalPayload, SignalType, Symbol, VolumeAnomaly};

/// Severity bucket for a volume ratio
pub fn severity_for(ratio: f64, medium: f64, high: f64) -> Severity {
    if ratio >= high {
        Severity::High
    } else if ratio >= medium {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Volume over the average of the previous `lookback` candles.
///
/// `None` until `lookback` earlier candles exist or when their average is zero.
fn ratio_at(candles: &[Candle], i: usize, lookback: usize) -> Option<(f64, f64)> {
    if lookback == 0 || i < lookback {
        return None;
    }
    let avg = candles[i - lookback..i].iter().map(|c| c.volume).sum::<f64>() / lookback as f64;
    (avg > 0.0).then(|| (candles[i].volume / avg, avg))
}

/// All candles whose volume exceeds `multiplier` times the rolling average,
/// oldest first
pub fn detect_volume_anomalies(
    candles: &[Candle],
    lookback: usize,
    multiplier: f64,
    settings: &AnalysisSettings,
) -> Vec<VolumeAnomaly> {
    (0..candles.len())
        .filter_map(|i| {
            let (ratio, avg_volume) = ratio_at(candles, i, lookback)?;
            (ratio > multiplier).then(|| VolumeAnomaly {
                timestamp: candles[i].timestamp,
                volume: candles[i].volume,
                avg_volume,
                ratio,
                severity: severity_for(ratio, settings.severity_medium, settings.severity_high),
            })
        })
        .collect()
}

/// Signals for anomalous candles among the most recent `volume_signal_scan`.
///
/// A higher high than the previous candle on lower volume than it reads as
/// bearish divergence, a lower low on lower volume as bullish, anything else
/// as a plain spike.
pub fn volume_signals(
    symbol: Symbol,
    candles: &[Candle],
    settings: &AnalysisSettings,
) -> Vec<Signal> {
    let start = candles.len().saturating_sub(settings.volume_signal_scan);

    (start..candles.len())
        .filter_map(|i| {
            let (ratio, avg_volume) = ratio_at(candles, i, settings.volume_lookback)?;
            if ratio <= settings.volume_multiplier {
                return None;
            }

            let current = &candles[i];
            let signal_type = match i.checked_sub(1).map(|p| &candles[p]) {
                Some(prev) if current.high > prev.high && current.volume < prev.volume => {
                    SignalType::VolumeDivergenceBearish
                }
                Some(prev) if current.low < prev.low && current.volume < prev.volume => {
                    SignalType::VolumeDivergenceBullish
                }
                _ => SignalType::VolumeSpike,
            };

            let mut details = BTreeMap::new();
            details.insert("volume_ratio".to_string(), json!(ratio));

            Some(Signal {
                id: Signal::make_id(signal_type, symbol, current.timestamp),
                signal_type,
                symbol,
                strength: (ratio / 3.0).min(1.0),
                divergence_percentage: 0.0,
                primary_price: current.close,
                secondary_price: current.close,
                confirmation_status: false,
                timestamp: current.timestamp,
                payload: SignalPayload::Volume {
                    volume: current.volume,
                    avg_volume,
                    ratio,
                    severity: severity_for(ratio, settings.severity_medium, settings.severity_high),
                },
                details,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(i: usize, high: f64, low: f64, volume: f64) -> Candle {
        Candle {
            timestamp: Utc
                .timestamp_opt(1_700_000_000 + i as i64 * 900, 0)
                .unwrap(),
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume,
        }
    }

    fn flat(len: usize, volume: f64) -> Vec<Candle> {
        (0..len).map(|i| candle(i, 101.0, 99.0, volume)).collect()
    }

    #[test]
    fn five_times_average_is_high_severity() {
        let mut candles = flat(20, 1_000.0);
        candles.push(candle(20, 101.0, 99.0, 5_000.0));
        let settings = AnalysisSettings::default();

        let anomalies = detect_volume_anomalies(&candles, 20, 1.5, &settings);

        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].ratio, 5.0);
        assert_eq!(anomalies[0].avg_volume, 1_000.0);
        assert_eq!(anomalies[0].severity, Severity::High);
    }

    #[test]
    fn current_candle_is_excluded_from_average() {
        let mut candles = flat(3, 100.0);
        candles.push(candle(3, 101.0, 99.0, 160.0));
        let settings = AnalysisSettings::default();

        let anomalies = detect_volume_anomalies(&candles, 3, 1.5, &settings);

        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].ratio, 1.6);
    }

    #[test]
    fn severity_cut_points() {
        assert_eq!(severity_for(1.6, 2.0, 3.0), Severity::Low);
        assert_eq!(severity_for(2.0, 2.0, 3.0), Severity::Medium);
        assert_eq!(severity_for(3.0, 2.0, 3.0), Severity::High);
        assert_eq!(severity_for(2.5, 1.5, 2.5), Severity::High);
    }

    #[test]
    fn not_enough_history_yields_nothing() {
        let candles = flat(5, 1_000.0);
        let settings = AnalysisSettings::default();
        assert!(detect_volume_anomalies(&candles, 20, 1.5, &settings).is_empty());
        assert!(volume_signals(Symbol::ES, &candles, &settings).is_empty());
    }

    #[test]
    fn spike_signal_strength_is_capped() {
        let mut candles = flat(20, 1_000.0);
        candles.push(candle(20, 101.0, 99.0, 6_000.0));

        let signals = volume_signals(Symbol::NQ, &candles, &AnalysisSettings::default());

        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::VolumeSpike);
        assert_eq!(signals[0].strength, 1.0);
    }

    #[test]
    fn higher_high_on_falling_volume_is_bearish() {
        let mut candles = flat(19, 1_000.0);
        candles.push(candle(19, 101.0, 99.0, 4_000.0));
        candles.push(candle(20, 103.0, 100.0, 3_000.0));

        let signals = volume_signals(Symbol::ES, &candles, &AnalysisSettings::default());

        let last = signals.last().unwrap();
        assert_eq!(last.signal_type, SignalType::VolumeDivergenceBearish);
        assert_eq!(last.timestamp, candles[20].timestamp);
    }

    #[test]
    fn lower_low_on_falling_volume_is_bullish() {
        let mut candles = flat(19, 1_000.0);
        candles.push(candle(19, 101.0, 99.0, 4_000.0));
        candles.push(candle(20, 100.5, 97.0, 3_000.0));

        let signals = volume_signals(Symbol::ES, &candles, &AnalysisSettings::default());

        assert_eq!(
            signals.last().unwrap().signal_type,
            SignalType::VolumeDivergenceBullish
        );
    }
}
