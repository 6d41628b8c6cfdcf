//! Feed module - Candle ingestion
//!
//! Fetches OHLCV candles from an external quote source, normalizes them into
//! ordered sequences and wraps every fetch in a bounded timeout/retry policy.

mod yahoo;

pub use yahoo::YahooFeed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::error::FeedError;
use crate::types::{Candle, Symbol, Timeframe};

const BACKOFF_JITTER_RATIO: f64 = 0.20;

/// Trait for candle sources
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedAdapter: Send + Sync {
    /// Get the source name
    fn name(&self) -> &'static str;

    /// Fetch up to `limit` most recent candles, oldest first
    async fn fetch_candles(
        &self,
        symbol: Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError>;
}

/// Hole in a candle sequence wider than one timeframe interval
#[derive(Debug, Clone, PartialEq)]
pub struct CandleGap {
    /// Timestamp of the candle before the gap
    pub after: DateTime<Utc>,
    /// Timestamp of the candle after the gap
    pub before: DateTime<Utc>,
    /// Whole intervals missing between the two
    pub missing_intervals: i64,
}

/// Ordered candles plus what normalization had to do to them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedCandles {
    pub candles: Vec<Candle>,
    pub gaps: Vec<CandleGap>,
    /// Records dropped as malformed or duplicate
    pub dropped: usize,
}

/// Sort, deduplicate and sanity-check raw candles.
///
/// Duplicated timestamps keep the last record. Records with non-finite or
/// non-positive prices are dropped; high/low are widened to bound open/close.
/// Gaps are reported, never treated as errors.
pub fn normalize_candles(raw: Vec<Candle>, timeframe: Timeframe) -> NormalizedCandles {
    let total = raw.len();
    let mut candles: Vec<Candle> = raw
        .into_iter()
        .filter(|c| {
            [c.open, c.high, c.low, c.close]
                .iter()
                .all(|p| p.is_finite() && *p > 0.0)
        })
        .map(|mut c| {
            c.high = c.high.max(c.open).max(c.close);
            c.low = c.low.min(c.open).min(c.close);
            if !c.volume.is_finite() || c.volume < 0.0 {
                c.volume = 0.0;
            }
            c
        })
        .collect();

    // Stable sort keeps feed order among equal timestamps, so the last one wins below
    candles.sort_by_key(|c| c.timestamp);
    let mut deduped: Vec<Candle> = Vec::with_capacity(candles.len());
    for candle in candles {
        match deduped.last_mut() {
            Some(last) if last.timestamp == candle.timestamp => *last = candle,
            _ => deduped.push(candle),
        }
    }

    let interval = timeframe.duration_secs();
    let gaps: Vec<CandleGap> = deduped
        .windows(2)
        .filter_map(|pair| {
            let step = (pair[1].timestamp - pair[0].timestamp).num_seconds();
            (step > interval).then(|| CandleGap {
                after: pair[0].timestamp,
                before: pair[1].timestamp,
                missing_intervals: step / interval - 1,
            })
        })
        .collect();

    NormalizedCandles {
        dropped: total - deduped.len(),
        candles: deduped,
        gaps,
    }
}

/// Timeout and backoff policy for feed fetches
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff (capped) with up to 20% jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let capped_attempt = attempt.min(16);
        let base_ms = self.base_backoff.as_millis() as u64;
        let max_ms = (self.max_backoff.as_millis() as u64).max(1);
        let bounded = base_ms
            .saturating_mul(1u64 << capped_attempt)
            .min(max_ms)
            .max(1);

        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_micros() as f64;
        let unit = (micros % 1_000.0) / 1_000.0;
        let jitter = 1.0 + ((unit * 2.0) - 1.0) * BACKOFF_JITTER_RATIO;
        let ms = ((bounded as f64) * jitter).round().clamp(1.0, max_ms as f64) as u64;
        Duration::from_millis(ms)
    }
}

/// Fetch and normalize candles, retrying transient failures with backoff.
///
/// `InvalidSymbol` returns immediately; transient errors are retried up to
/// `policy.max_retries` times and the last one is returned.
pub async fn fetch_with_retry(
    feed: &dyn FeedAdapter,
    symbol: Symbol,
    timeframe: Timeframe,
    limit: usize,
    policy: &RetryPolicy,
) -> Result<NormalizedCandles, FeedError> {
    let mut attempt = 0u32;
    loop {
        let outcome = match tokio::time::timeout(
            policy.attempt_timeout,
            feed.fetch_candles(symbol, timeframe, limit),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FeedError::Timeout {
                symbol,
                timeout: policy.attempt_timeout,
            }),
        };

        match outcome {
            Ok(raw) => {
                let normalized = normalize_candles(raw, timeframe);
                if !normalized.gaps.is_empty() || normalized.dropped > 0 {
                    debug!(
                        symbol = %symbol,
                        gaps = normalized.gaps.len(),
                        dropped = normalized.dropped,
                        "Candle sequence normalized with gaps or dropped records"
                    );
                }
                return Ok(normalized);
            }
            Err(e) if !e.is_transient() || attempt >= policy.max_retries => return Err(e),
            Err(e) => {
                let mut delay = policy.backoff_delay(attempt);
                if let FeedError::RateLimited {
                    retry_after: Some(retry_after),
                    ..
                } = &e
                {
                    delay = delay.max(*retry_after).min(policy.max_backoff);
                }
                warn!(
                    source = feed.name(),
                    symbol = %symbol,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Candle fetch failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn candle(minute: i64, price: f64) -> Candle {
        Candle {
            timestamp: Utc.timestamp_opt(1_700_000_000 + minute * 60, 0).unwrap(),
            open: price,
            high: price + 1.0,
            low: price - 1.0,
            close: price,
            volume: 100.0,
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: Duration::from_millis(200),
            max_retries,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn normalize_sorts_dedupes_and_flags_gaps() {
        let mut late_duplicate = candle(15, 101.0);
        late_duplicate.close = 102.0;
        let raw = vec![
            candle(15, 101.0),
            candle(0, 100.0),
            late_duplicate,
            candle(60, 103.0),
        ];

        let normalized = normalize_candles(raw, Timeframe::Min15);

        assert_eq!(normalized.candles.len(), 3);
        assert!(normalized
            .candles
            .windows(2)
            .all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(normalized.candles[1].close, 102.0);
        assert_eq!(normalized.dropped, 1);
        assert_eq!(normalized.gaps.len(), 1);
        assert_eq!(normalized.gaps[0].missing_intervals, 2);
    }

    #[test]
    fn normalize_drops_bad_prices_and_repairs_range() {
        let mut bad = candle(0, 100.0);
        bad.close = f64::NAN;
        let mut inverted = candle(15, 100.0);
        inverted.high = 99.0;
        inverted.low = 101.0;

        let normalized = normalize_candles(vec![bad, inverted], Timeframe::Min15);

        assert_eq!(normalized.candles.len(), 1);
        let c = &normalized.candles[0];
        assert!(c.high >= c.open && c.high >= c.close);
        assert!(c.low <= c.open && c.low <= c.close);
    }

    #[test]
    fn backoff_is_bounded() {
        let policy = RetryPolicy::default();
        for attempt in [0, 1, 5, 20] {
            let delay = policy.backoff_delay(attempt);
            assert!(delay >= Duration::from_millis(1));
            assert!(delay <= policy.max_backoff);
        }
    }

    #[tokio::test]
    async fn invalid_symbol_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut feed = MockFeedAdapter::new();
        feed.expect_name().return_const("mock");
        feed.expect_fetch_candles().returning(move |symbol, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FeedError::InvalidSymbol(symbol))
        });

        let result =
            fetch_with_retry(&feed, Symbol::RTY, Timeframe::Min15, 10, &fast_policy(3)).await;

        assert_eq!(result, Err(FeedError::InvalidSymbol(Symbol::RTY)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut feed = MockFeedAdapter::new();
        feed.expect_name().return_const("mock");
        feed.expect_fetch_candles().returning(move |symbol, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(FeedError::Unavailable {
                    symbol,
                    reason: "503".to_string(),
                })
            } else {
                Ok(vec![candle(0, 100.0)])
            }
        });

        let result = fetch_with_retry(&feed, Symbol::ES, Timeframe::Min15, 10, &fast_policy(3))
            .await
            .unwrap();

        assert_eq!(result.candles.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut feed = MockFeedAdapter::new();
        feed.expect_name().return_const("mock");
        feed.expect_fetch_candles().returning(move |symbol, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FeedError::RateLimited {
                symbol,
                retry_after: Some(Duration::from_millis(2)),
            })
        });

        let result =
            fetch_with_retry(&feed, Symbol::NQ, Timeframe::Min15, 10, &fast_policy(2)).await;

        assert!(matches!(result, Err(FeedError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
