//! Market snapshots derived from the latest candles

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

use crate::analysis::technical_indicators;
use crate::types::{Candle, MarketSnapshot, MarketState, Symbol};

/// Regular cash session in UTC minutes from midnight
const SESSION_OPEN_MINUTE: u32 = 14 * 60 + 30;
const SESSION_CLOSE_MINUTE: u32 = 21 * 60;

/// Trading state of the index futures cash session at `at`
pub fn market_state_at(at: DateTime<Utc>) -> MarketState {
    if matches!(at.weekday(), Weekday::Sat | Weekday::Sun) {
        return MarketState::Closed;
    }
    let minute = at.hour() * 60 + at.minute();
    if minute < SESSION_OPEN_MINUTE {
        MarketState::PreMarket
    } else if minute < SESSION_CLOSE_MINUTE {
        MarketState::Open
    } else {
        MarketState::AfterHours
    }
}

/// Snapshot from the two most recent candles plus indicators over the whole
/// window; `None` without candles
pub fn build_snapshot(
    symbol: Symbol,
    candles: &[Candle],
    now: DateTime<Utc>,
) -> Option<MarketSnapshot> {
    let last = candles.last()?;
    let change_percent = match candles.len().checked_sub(2).map(|i| &candles[i]) {
        Some(prev) if prev.close > 0.0 => (last.close - prev.close) / prev.close * 100.0,
        _ => 0.0,
    };

    Some(MarketSnapshot {
        symbol,
        current_price: last.close,
        change_percent,
        volume: last.volume,
        timestamp: last.timestamp,
        market_state: market_state_at(now),
        technical: technical_indicators(candles),
    })
}

/// Copy of a snapshot that can no longer be refreshed
pub fn mark_unknown(snapshot: &MarketSnapshot) -> MarketSnapshot {
    MarketSnapshot {
        market_state: MarketState::Unknown,
        ..snapshot.clone()
    }
}
