//! SMT divergence between two correlated instruments
//!
//! Both windows are aligned on common timestamps and reduced to their last
//! `lookback_period` candles. Confirmed swing fractals inside the window are
//! compared: a bullish divergence is a higher low on the primary against a
//! lower low on the secondary, a bearish divergence a lower high against a
//! higher high.

use serde_json::json;
use std::collections::{BTreeMap, HashMap};

use crate::analysis::fractals::confirmed_fractals;
use crate::config::AnalysisSettings;
use crate::error::AnalysisError;
use crate::types::{Candle, Fractal, FractalKind, Signal, SignalPayload, SignalType, Symbol};

/// Window length at which the sample-size term saturates
const FULL_WINDOW: f64 = 50.0;
/// |divergence| in percent at which the magnitude term saturates
const FULL_DIVERGENCE_PCT: f64 = 2.0;

/// Candles of the pair aligned on shared timestamps
#[derive(Debug, Clone, PartialEq)]
pub struct SynchronizedWindow {
    pub primary: Vec<Candle>,
    pub secondary: Vec<Candle>,
}

impl SynchronizedWindow {
    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }
}

/// Intersect both sequences on timestamp and keep the last `lookback` pairs
pub fn synchronize(
    primary: &[Candle],
    secondary: &[Candle],
    lookback: usize,
) -> Result<SynchronizedWindow, AnalysisError> {
    let by_time: HashMap<_, &Candle> = secondary.iter().map(|c| (c.timestamp, c)).collect();

    let (mut p, mut s): (Vec<Candle>, Vec<Candle>) = primary
        .iter()
        .filter_map(|c| by_time.get(&c.timestamp).map(|o| (c.clone(), (*o).clone())))
        .unzip();

    if p.len() < lookback {
        return Err(AnalysisError::InsufficientHistory {
            needed: lookback,
            available: p.len(),
        });
    }

    let skip = p.len() - lookback;
    p.drain(..skip);
    s.drain(..skip);
    Ok(SynchronizedWindow {
        primary: p,
        secondary: s,
    })
}

/// Signal strength in [0, 1].
///
/// Non-decreasing in `abs_divergence_pct` for fixed volume confirmation and
/// window length.
pub fn divergence_strength(
    abs_divergence_pct: f64,
    volume_confirmed: bool,
    window_len: usize,
) -> f64 {
    let magnitude = (abs_divergence_pct / FULL_DIVERGENCE_PCT).min(1.0);
    let volume = if volume_confirmed { 1.0 } else { 0.0 };
    let sample = (window_len as f64 / FULL_WINDOW).min(1.0);
    (0.7 * magnitude + 0.2 * volume + 0.1 * sample).clamp(0.0, 1.0)
}

fn pct_change(from: f64, to: f64) -> f64 {
    (to - from) / from * 100.0
}

/// Last two confirmed swings of `kind`, oldest first
fn last_two(fractals: &[Fractal], kind: FractalKind) -> Option<(&Fractal, &Fractal)> {
    let mut it = fractals.iter().rev().filter(|f| f.kind == kind);
    let latest = it.next()?;
    let previous = it.next()?;
    Some((previous, latest))
}

/// Whether the first `needed` candles after the swing all hold it
fn swing_holds(candles: &[Candle], swing: &Fractal, needed: usize) -> bool {
    let following = &candles[swing.index + 1..];
    if following.len() < needed {
        return false;
    }
    following[..needed].iter().all(|c| match swing.kind {
        FractalKind::Low => c.low >= swing.price,
        FractalKind::High => c.high <= swing.price,
    })
}

/// Detect SMT divergence for a correlated pair.
///
/// Returns `InsufficientHistory` when the synchronized window is shorter than
/// `lookback_period`; callers treat that as "no signal". At most one signal
/// per direction is produced.
pub fn detect_divergence(
    primary_symbol: Symbol,
    primary: &[Candle],
    secondary_symbol: Symbol,
    secondary: &[Candle],
    settings: &AnalysisSettings,
) -> Result<Vec<Signal>, AnalysisError> {
    if primary.is_empty() {
        return Err(AnalysisError::MissingSymbol(primary_symbol));
    }
    if secondary.is_empty() {
        return Err(AnalysisError::MissingSymbol(secondary_symbol));
    }

    let window = synchronize(primary, secondary, settings.lookback_period)?;
    let primary_swings = confirmed_fractals(&window.primary, settings.fractal_period);
    let secondary_swings = confirmed_fractals(&window.secondary, settings.fractal_period);

    let mut signals = Vec::new();
    for (kind, signal_type) in [
        (FractalKind::Low, SignalType::BullishDivergence),
        (FractalKind::High, SignalType::BearishDivergence),
    ] {
        let (Some((p_prev, p_last)), Some((s_prev, s_last))) = (
            last_two(&primary_swings, kind),
            last_two(&secondary_swings, kind),
        ) else {
            continue;
        };

        let diverges = match kind {
            // Higher low against lower low
            FractalKind::Low => p_last.price > p_prev.price && s_last.price < s_prev.price,
            // Lower high against higher high
            FractalKind::High => p_last.price < p_prev.price && s_last.price > s_prev.price,
        };
        if !diverges {
            continue;
        }

        let primary_change = pct_change(p_prev.price, p_last.price);
        let secondary_change = pct_change(s_prev.price, s_last.price);
        let divergence = primary_change - secondary_change;
        if divergence.abs() < settings.divergence_threshold {
            continue;
        }

        let swing_candle = &window.primary[p_last.index];
        let avg_volume =
            window.primary.iter().map(|c| c.volume).sum::<f64>() / window.len() as f64;
        let volume_confirmed = avg_volume > 0.0 && swing_candle.volume >= avg_volume;
        let confirmed = swing_holds(&window.primary, p_last, settings.confirmation_candles);

        let primary_price = window.primary.last().map(|c| c.close).unwrap_or(p_last.price);
        let secondary_price = window
            .secondary
            .last()
            .map(|c| c.close)
            .unwrap_or(s_last.price);

        let mut details = BTreeMap::new();
        details.insert("window_start".to_string(), json!(window.primary[0].timestamp));
        details.insert("swing_index".to_string(), json!(p_last.index));

        signals.push(Signal {
            id: Signal::make_id(signal_type, primary_symbol, p_last.timestamp),
            signal_type,
            symbol: primary_symbol,
            strength: divergence_strength(divergence.abs(), volume_confirmed, window.len()),
            divergence_percentage: divergence,
            primary_price,
            secondary_price,
            confirmation_status: confirmed,
            timestamp: p_last.timestamp,
            payload: SignalPayload::Divergence {
                secondary: secondary_symbol,
                primary_change,
                secondary_change,
                primary_swings: (p_prev.price, p_last.price),
                secondary_swings: (s_prev.price, s_last.price),
                lookback: window.len(),
                volume_confirmed,
            },
            details,
        });
    }

    Ok(signals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candles_from_lows(lows: &[f64]) -> Vec<Candle> {
        lows.iter()
            .enumerate()
            .map(|(i, low)| Candle {
                timestamp: Utc
                    .timestamp_opt(1_700_000_000 + i as i64 * 900, 0)
                    .unwrap(),
                open: low + 1.0,
                high: low + 2.0,
                low: *low,
                close: low + 1.0,
                volume: 1_000.0,
            })
            .collect()
    }

    fn settings(lookback: usize) -> AnalysisSettings {
        AnalysisSettings {
            lookback_period: lookback,
            fractal_period: 2,
            confirmation_candles: 3,
            divergence_threshold: 0.5,
            ..Default::default()
        }
    }

    const PRIMARY: [f64; 12] = [
        105.0, 104.0, 100.0, 104.0, 105.0, 106.0, 105.0, 104.0, 101.0, 104.0, 105.0, 106.0,
    ];
    const SECONDARY: [f64; 12] = [
        105.0, 104.0, 100.0, 104.0, 105.0, 106.0, 105.0, 104.0, 99.0, 104.0, 105.0, 106.0,
    ];

    #[test]
    fn higher_low_against_lower_low_is_bullish() {
        let primary = candles_from_lows(&PRIMARY);
        let secondary = candles_from_lows(&SECONDARY);

        let signals =
            detect_divergence(Symbol::ES, &primary, Symbol::NQ, &secondary, &settings(12)).unwrap();

        assert_eq!(signals.len(), 1);
        let signal = &signals[0];
        assert_eq!(signal.signal_type, SignalType::BullishDivergence);
        assert!((signal.divergence_percentage - 2.0).abs() < 1e-9);
        assert!(signal.confirmation_status);
        assert_eq!(signal.timestamp, primary[8].timestamp);
    }

    #[test]
    fn confirmation_waits_for_enough_candles() {
        let primary = candles_from_lows(&PRIMARY[..11]);
        let secondary = candles_from_lows(&SECONDARY[..11]);

        let signals =
            detect_divergence(Symbol::ES, &primary, Symbol::NQ, &secondary, &settings(11)).unwrap();

        assert_eq!(signals.len(), 1);
        assert!((signals[0].divergence_percentage - 2.0).abs() < 1e-9);
        assert!(!signals[0].confirmation_status);

        // Same swing, same id once confirmed
        let full = detect_divergence(
            Symbol::ES,
            &candles_from_lows(&PRIMARY),
            Symbol::NQ,
            &candles_from_lows(&SECONDARY),
            &settings(12),
        )
        .unwrap();
        assert!(full[0].confirmation_status);
        assert_eq!(full[0].id, signals[0].id);
    }

    #[test]
    fn violated_swing_is_not_confirmed() {
        let mut lows = PRIMARY.to_vec();
        lows.push(100.5);
        let mut secondary = SECONDARY.to_vec();
        secondary.push(100.0);
        let settings = AnalysisSettings {
            confirmation_candles: 4,
            ..settings(13)
        };

        let signals = detect_divergence(
            Symbol::ES,
            &candles_from_lows(&lows),
            Symbol::NQ,
            &candles_from_lows(&secondary),
            &settings,
        )
        .unwrap();

        assert_eq!(signals.len(), 1);
        assert!(!signals[0].confirmation_status);
    }

    #[test]
    fn below_threshold_is_ignored() {
        let primary = candles_from_lows(&PRIMARY);
        let secondary = candles_from_lows(&SECONDARY);
        let settings = AnalysisSettings {
            divergence_threshold: 2.0,
            ..settings(12)
        };
        let mut shallow = SECONDARY;
        shallow[8] = 99.5;

        let signals = detect_divergence(
            Symbol::ES,
            &primary,
            Symbol::NQ,
            &candles_from_lows(&shallow),
            &settings,
        )
        .unwrap();
        assert!(signals.is_empty());

        // 2.0 exactly still passes
        let signals =
            detect_divergence(Symbol::ES, &primary, Symbol::NQ, &secondary, &settings).unwrap();
        assert_eq!(signals.len(), 1);
    }

    #[test]
    fn short_history_yields_no_signal() {
        let primary = candles_from_lows(&PRIMARY[..6]);
        let secondary = candles_from_lows(&SECONDARY[..6]);

        let result = detect_divergence(Symbol::ES, &primary, Symbol::NQ, &secondary, &settings(20));

        assert_eq!(
            result,
            Err(AnalysisError::InsufficientHistory {
                needed: 20,
                available: 6
            })
        );
    }

    #[test]
    fn missing_leg_is_reported() {
        let primary = candles_from_lows(&PRIMARY);
        let result = detect_divergence(Symbol::ES, &primary, Symbol::NQ, &[], &settings(12));
        assert_eq!(result, Err(AnalysisError::MissingSymbol(Symbol::NQ)));
    }

    #[test]
    fn synchronize_uses_common_timestamps_only() {
        let primary = candles_from_lows(&PRIMARY);
        let mut secondary = candles_from_lows(&SECONDARY);
        secondary.remove(3);

        let window = synchronize(&primary, &secondary, 10).unwrap();

        assert_eq!(window.len(), 10);
        assert!(window
            .primary
            .iter()
            .zip(&window.secondary)
            .all(|(p, s)| p.timestamp == s.timestamp));
    }

    #[test]
    fn strength_is_monotonic_in_divergence() {
        for volume_confirmed in [false, true] {
            for window_len in [5, 20, 50, 200] {
                let mut previous = 0.0;
                for step in 0..=400 {
                    let d = step as f64 * 0.0125;
                    let strength = divergence_strength(d, volume_confirmed, window_len);
                    assert!(strength >= previous);
                    assert!((0.0..=1.0).contains(&strength));
                    previous = strength;
                }
            }
        }
    }
}
