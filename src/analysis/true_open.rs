//! Daily, weekly and quarterly true opens
//!
//! Period boundaries are evaluated in the feed's declared UTC offset. A period
//! is anchored on its first candle, which is only known to be first once a
//! candle of the previous period has been seen.

use chrono::{DateTime, Datelike, FixedOffset, Offset, Utc};
use std::collections::{BTreeMap, HashMap};

use crate::types::{Candle, Granularity, Symbol, TrueOpen, TrueOpens};

const GRANULARITIES: [Granularity; 3] = [
    Granularity::Daily,
    Granularity::Weekly,
    Granularity::Quarterly,
];

/// Period identifier for comparing two instants
fn period_key(
    timestamp: DateTime<Utc>,
    offset: &FixedOffset,
    granularity: Granularity,
) -> (i32, u32) {
    let local = timestamp.with_timezone(offset);
    match granularity {
        Granularity::Daily => (local.year(), local.ordinal()),
        // ISO weeks start on Monday
        Granularity::Weekly => {
            let week = local.iso_week();
            (week.year(), week.week())
        }
        Granularity::Quarterly => (local.year(), local.month0() / 3),
    }
}

#[derive(Debug, Clone, Default)]
struct SymbolAnchors {
    last_seen: Option<DateTime<Utc>>,
    opens: TrueOpens,
}

/// Per-symbol true-open anchors, advanced incrementally
#[derive(Debug, Clone)]
pub struct TrueOpenTracker {
    offset: FixedOffset,
    symbols: HashMap<Symbol, SymbolAnchors>,
}

impl TrueOpenTracker {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            offset,
            symbols: HashMap::new(),
        }
    }

    /// Build from an offset in minutes east of UTC; out-of-range offsets fall back to UTC
    pub fn with_offset_minutes(minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| {
            tracing::warn!(minutes, "Invalid feed UTC offset, using UTC");
            Utc.fix()
        });
        Self::new(offset)
    }

    /// Consume candles newer than the last one seen; returns anchors recorded
    pub fn update(&mut self, symbol: Symbol, candles: &[Candle]) -> usize {
        let offset = self.offset;
        let anchors = self.symbols.entry(symbol).or_default();
        let mut recorded = 0;

        for candle in candles {
            let previous = match anchors.last_seen {
                Some(ts) if candle.timestamp <= ts => continue,
                Some(ts) => ts,
                None => {
                    anchors.last_seen = Some(candle.timestamp);
                    continue;
                }
            };

            for granularity in GRANULARITIES {
                if period_key(previous, &offset, granularity)
                    != period_key(candle.timestamp, &offset, granularity)
                {
                    let open = TrueOpen {
                        symbol,
                        granularity,
                        price: candle.open,
                        timestamp: candle.timestamp,
                    };
                    match granularity {
                        Granularity::Daily => anchors.opens.daily = Some(open),
                        Granularity::Weekly => anchors.opens.weekly = Some(open),
                        Granularity::Quarterly => anchors.opens.quarterly = Some(open),
                    }
                    recorded += 1;
                }
            }
            anchors.last_seen = Some(candle.timestamp);
        }

        recorded
    }

    pub fn get(&self, symbol: Symbol) -> TrueOpens {
        self.symbols
            .get(&symbol)
            .map(|a| a.opens.clone())
            .unwrap_or_default()
    }

    /// Anchors for every symbol seen so far
    pub fn all(&self) -> BTreeMap<Symbol, TrueOpens> {
        self.symbols
            .iter()
            .map(|(symbol, anchors)| (*symbol, anchors.opens.clone()))
            .collect()
    }
}
