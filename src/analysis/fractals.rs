//! Swing fractal detection
//!
//! A fractal is the center of a `2k+1` candle window whose high (or low) is the
//! extreme of the window. Earlier candles must be strictly beaten, later ones
//! may tie, so a flat top resolves to its first candle.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use crate::types::{Candle, Fractal, FractalKind};

/// Classify `center` against its neighbours.
///
/// Outside bars that qualify as both a high and a low are not marked.
fn classify(before: &[Candle], center: &Candle, after: &[Candle]) -> Option<FractalKind> {
    let is_high = before.iter().all(|c| center.high > c.high)
        && after.iter().all(|c| center.high >= c.high);
    let is_low =
        before.iter().all(|c| center.low < c.low) && after.iter().all(|c| center.low <= c.low);

    match (is_high, is_low) {
        (true, false) => Some(FractalKind::High),
        (false, true) => Some(FractalKind::Low),
        _ => None,
    }
}

fn fractal_at(candle: &Candle, kind: FractalKind, index: usize, confirmed: bool) -> Fractal {
    Fractal {
        timestamp: candle.timestamp,
        price: match kind {
            FractalKind::High => candle.high,
            FractalKind::Low => candle.low,
        },
        kind,
        index,
        confirmed,
    }
}

/// Detect fractals over a complete window, oldest first.
///
/// Centers with `k` candles on both sides are confirmed. Centers near the end
/// with fewer than `k` later candles are reported as unconfirmed candidates.
/// `base_index` is the absolute index of `candles[0]`.
pub fn detect_fractals(candles: &[Candle], period: usize, base_index: usize) -> Vec<Fractal> {
    let k = period.max(1);
    let mut fractals = Vec::new();
    if candles.len() <= k {
        return fractals;
    }

    for i in k..candles.len() {
        let after_end = (i + k + 1).min(candles.len());
        let after = &candles[i + 1..after_end];
        if let Some(kind) = classify(&candles[i - k..i], &candles[i], after) {
            let confirmed = after.len() == k;
            fractals.push(fractal_at(&candles[i], kind, base_index + i, confirmed));
        }
    }
    fractals
}

/// Confirmed fractals only, oldest first
pub fn confirmed_fractals(candles: &[Candle], period: usize) -> Vec<Fractal> {
    detect_fractals(candles, period, 0)
        .into_iter()
        .filter(|f| f.confirmed)
        .collect()
}

/// Incremental per-symbol fractal index.
///
/// The newest candle of every update is treated as still forming: it is held
/// aside and replaced by the next update instead of being consumed. Only
/// closed candles enter the `2k` trailing buffer, so a confirmation is never
/// based on a bar the feed can still revise. At most `max_fractals` confirmed
/// fractals are kept.
#[derive(Debug, Clone)]
pub struct FractalTracker {
    period: usize,
    max_fractals: usize,
    buffer: VecDeque<Candle>,
    forming: Option<Candle>,
    /// Absolute index of the next closed candle
    next_index: usize,
    last_closed: Option<DateTime<Utc>>,
    confirmed: VecDeque<Fractal>,
}

impl FractalTracker {
    pub fn new(period: usize, max_fractals: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            max_fractals: max_fractals.max(1),
            buffer: VecDeque::with_capacity(2 * period + 1),
            forming: None,
            next_index: 0,
            last_closed: None,
            confirmed: VecDeque::with_capacity(max_fractals),
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn set_max_fractals(&mut self, max_fractals: usize) {
        self.max_fractals = max_fractals.max(1);
        self.trim();
    }

    /// Feed an ordered candle sequence; returns the number of newly confirmed fractals
    pub fn update(&mut self, candles: &[Candle]) -> usize {
        let fresh: Vec<&Candle> = candles
            .iter()
            .filter(|c| self.last_closed.map_or(true, |ts| c.timestamp > ts))
            .collect();
        let Some((newest, closed)) = fresh.split_last() else {
            return 0;
        };

        let mut added = 0;
        for candle in closed {
            added += self.close(candle);
        }
        self.forming = Some((*newest).clone());

        self.trim();
        added
    }

    fn close(&mut self, candle: &Candle) -> usize {
        let k = self.period;
        self.last_closed = Some(candle.timestamp);
        self.buffer.push_back(candle.clone());
        self.next_index += 1;

        if self.buffer.len() < 2 * k + 1 {
            return 0;
        }
        let window = self.buffer.make_contiguous();
        let center_index = self.next_index - 1 - k;
        let found = classify(&window[..k], &window[k], &window[k + 1..]);
        if let Some(kind) = found {
            self.confirmed
                .push_back(fractal_at(&window[k], kind, center_index, true));
        }
        self.buffer.pop_front();
        usize::from(found.is_some())
    }

    /// Confirmed fractals, oldest first
    pub fn confirmed(&self) -> impl Iterator<Item = &Fractal> {
        self.confirmed.iter()
    }

    /// Unconfirmed tail candidates from the trailing buffer and the forming candle
    pub fn candidates(&self) -> Vec<Fractal> {
        let k = self.period;
        let mut tail: Vec<Candle> = self.buffer.iter().cloned().collect();
        let first_index = self.next_index - tail.len();
        tail.extend(self.forming.iter().cloned());
        (k..tail.len())
            .filter_map(|i| {
                classify(&tail[i - k..i], &tail[i], &tail[i + 1..])
                    .map(|kind| fractal_at(&tail[i], kind, first_index + i, false))
            })
            .collect()
    }

    /// Confirmed fractals plus candidates, newest first, at most `limit`
    pub fn recent(&self, limit: usize) -> Vec<Fractal> {
        let mut all: Vec<Fractal> = self.confirmed.iter().cloned().collect();
        all.extend(self.candidates());
        all.reverse();
        all.truncate(limit);
        all
    }

    fn trim(&mut self) {
        while self.confirmed.len() > self.max_fractals {
            self.confirmed.pop_front();
        }
    }
}
