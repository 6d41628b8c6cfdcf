//! Technical indicators for market snapshots
//!
//! Stateless helpers over a candle window, oldest first. Each indicator is
//! `None` until the window holds enough candles for its period.

use crate::types::{Candle, TechnicalIndicators};

pub const RSI_PERIOD: usize = 14;
pub const SMA_PERIOD: usize = 20;
pub const EMA_FAST: usize = 12;
pub const EMA_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_WIDTH: f64 = 2.0;
pub const ATR_PERIOD: usize = 14;

/// Full indicator block for the latest candle
pub fn technical_indicators(candles: &[Candle]) -> TechnicalIndicators {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let (macd, macd_signal) = match macd(&closes) {
        Some((line, signal)) => (Some(line), signal),
        None => (None, None),
    };
    let (bollinger_upper, bollinger_lower) = match bollinger(&closes) {
        Some((upper, lower)) => (Some(upper), Some(lower)),
        None => (None, None),
    };

    TechnicalIndicators {
        rsi: rsi(&closes, RSI_PERIOD),
        sma_20: sma(&closes, SMA_PERIOD),
        ema_12: ema_series(&closes, EMA_FAST).and_then(|s| s.last().copied()),
        ema_26: ema_series(&closes, EMA_SLOW).and_then(|s| s.last().copied()),
        macd,
        macd_signal,
        bollinger_upper,
        bollinger_lower,
        atr: atr(candles, ATR_PERIOD),
    }
}

/// RSI from simple averages of the last `period` close-to-close changes
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let (mut gains, mut losses) = (0.0, 0.0);
    for pair in closes[closes.len() - period - 1..].windows(2) {
        let change = pair[1] - pair[0];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;

    if avg_gain == 0.0 && avg_loss == 0.0 {
        return Some(50.0);
    }
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    Some(values[values.len() - period..].iter().sum::<f64>() / period as f64)
}

/// EMA at every position, seeded with the first value
pub fn ema_series(values: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || values.len() < period {
        return None;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = values[0];
    let mut series = Vec::with_capacity(values.len());
    series.push(ema);
    for value in &values[1..] {
        ema = (value - ema) * multiplier + ema;
        series.push(ema);
    }
    Some(series)
}

/// MACD line and its signal line; the signal needs `MACD_SIGNAL` more candles
pub fn macd(closes: &[f64]) -> Option<(f64, Option<f64>)> {
    let fast = ema_series(closes, EMA_FAST)?;
    let slow = ema_series(closes, EMA_SLOW)?;
    let line: Vec<f64> = fast.iter().zip(&slow).map(|(f, s)| f - s).collect();
    let last = *line.last()?;

    let signal = if closes.len() >= EMA_SLOW + MACD_SIGNAL - 1 {
        ema_series(&line[EMA_SLOW - 1..], MACD_SIGNAL).and_then(|s| s.last().copied())
    } else {
        None
    };
    Some((last, signal))
}

/// Upper and lower bands around the SMA, using the sample deviation
pub fn bollinger(closes: &[f64]) -> Option<(f64, f64)> {
    let period = BOLLINGER_PERIOD;
    let mean = sma(closes, period)?;
    let window = &closes[closes.len() - period..];
    let variance =
        window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / (period as f64 - 1.0);
    let std = variance.sqrt();
    Some((mean + BOLLINGER_WIDTH * std, mean - BOLLINGER_WIDTH * std))
}

/// Mean true range over the last `period` candles
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let total: f64 = candles[candles.len() - period - 1..]
        .windows(2)
        .map(|pair| {
            let (prev, curr) = (&pair[0], &pair[1]);
            (curr.high - curr.low)
                .max((curr.high - prev.close).abs())
                .max((curr.low - prev.close).abs())
        })
        .sum();
    Some(total / period as f64)
}
