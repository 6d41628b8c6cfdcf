//! Liquidity sweeps: false breaks of swing levels and Judas swings
//!
//! Both look at the most recent candle only, so a replay over the same
//! candles yields the same signals.

use serde_json::json;
use std::collections::BTreeMap;

use crate::analysis::fractals::confirmed_fractals;
use crate::config::AnalysisSettings;
use crate::killzone::{KillzoneScheduler, Priority};
use crate::types::{Candle, FractalKind, Signal, SignalPayload, SignalType, Symbol};

/// Sweep depth in percent at which strength saturates
const FULL_SWEEP_PCT: f64 = 0.5;

fn sweep_strength(excursion_pct: f64) -> f64 {
    (0.4 + 0.6 * (excursion_pct / FULL_SWEEP_PCT).min(1.0)).clamp(0.0, 1.0)
}

fn priority_weight(priority: Priority) -> f64 {
    match priority {
        Priority::High => 1.0,
        Priority::Medium => 0.85,
        Priority::Low => 0.7,
    }
}

fn sweep_signal(
    signal_type: SignalType,
    symbol: Symbol,
    candle: &Candle,
    strength: f64,
    confirmed: bool,
    payload: SignalPayload,
) -> Signal {
    let mut details = BTreeMap::new();
    details.insert("candle_open".to_string(), json!(candle.open));

    Signal {
        id: Signal::make_id(signal_type, symbol, candle.timestamp),
        signal_type,
        symbol,
        strength,
        divergence_percentage: 0.0,
        primary_price: candle.close,
        secondary_price: candle.close,
        confirmation_status: confirmed,
        timestamp: candle.timestamp,
        payload,
        details,
    }
}

/// Latest candle trades through the last confirmed swing and closes back inside.
///
/// Sweeping a swing high gives `false_break_up`, sweeping a swing low
/// `false_break_down`. A candle whose body also closes against the sweep
/// counts as confirmed.
pub fn detect_false_breaks(
    symbol: Symbol,
    candles: &[Candle],
    settings: &AnalysisSettings,
) -> Vec<Signal> {
    let Some(latest) = candles.last() else {
        return Vec::new();
    };
    let swings = confirmed_fractals(candles, settings.fractal_period);
    let mut signals = Vec::new();

    for (kind, signal_type) in [
        (FractalKind::High, SignalType::FalseBreakUp),
        (FractalKind::Low, SignalType::FalseBreakDown),
    ] {
        let Some(level) = swings.iter().rev().find(|f| f.kind == kind) else {
            continue;
        };

        let (extreme, swept, closed_inside, reversal_body) = match kind {
            FractalKind::High => (
                latest.high,
                (latest.high - level.price) / level.price * 100.0,
                latest.close < level.price,
                latest.close < latest.open,
            ),
            FractalKind::Low => (
                latest.low,
                (level.price - latest.low) / level.price * 100.0,
                latest.close > level.price,
                latest.close > latest.open,
            ),
        };

        if swept < settings.false_break_min_pct || swept <= 0.0 || !closed_inside {
            continue;
        }

        signals.push(sweep_signal(
            signal_type,
            symbol,
            latest,
            sweep_strength(swept),
            reversal_body,
            SignalPayload::FalseBreak {
                level: level.price,
                sweep_extreme: extreme,
                close: latest.close,
                excursion_pct: swept,
            },
        ));
    }

    signals
}

/// Price runs against the session open early in an active killzone, then
/// closes back through it.
///
/// A sweep below the open followed by a close above it is bullish; a sweep
/// above followed by a close below is bearish. When both happened the deeper
/// sweep wins.
pub fn detect_judas_swing(
    symbol: Symbol,
    candles: &[Candle],
    scheduler: &KillzoneScheduler,
    settings: &AnalysisSettings,
) -> Option<Signal> {
    let latest = candles.last()?;
    let (window, session_start) = scheduler.current_session_start(latest.timestamp)?;

    let session: Vec<&Candle> = candles
        .iter()
        .filter(|c| c.timestamp >= session_start)
        .collect();
    if session.len() < 2 {
        return None;
    }

    let session_open = session[0].open;
    let session_high = session.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let session_low = session.iter().map(|c| c.low).fold(f64::MAX, f64::min);

    let down_sweep = (session_open - session_low) / session_open * 100.0;
    let up_sweep = (session_high - session_open) / session_open * 100.0;

    let bullish = down_sweep >= settings.judas_min_excursion_pct
        && down_sweep > 0.0
        && latest.close > session_open;
    let bearish = up_sweep >= settings.judas_min_excursion_pct
        && up_sweep > 0.0
        && latest.close < session_open;

    let (signal_type, extreme, excursion) = match (bullish, bearish) {
        (true, false) => (SignalType::JudasSwingBullish, session_low, down_sweep),
        (false, true) => (SignalType::JudasSwingBearish, session_high, up_sweep),
        (true, true) if down_sweep >= up_sweep => {
            (SignalType::JudasSwingBullish, session_low, down_sweep)
        }
        (true, true) => (SignalType::JudasSwingBearish, session_high, up_sweep),
        (false, false) => return None,
    };

    let strength = (sweep_strength(excursion) * priority_weight(window.priority)).clamp(0.0, 1.0);

    Some(sweep_signal(
        signal_type,
        symbol,
        latest,
        strength,
        false,
        SignalPayload::JudasSwing {
            session: window.name.clone(),
            session_open,
            sweep_extreme: extreme,
            close: latest.close,
            excursion_pct: excursion,
        },
    ))
}
