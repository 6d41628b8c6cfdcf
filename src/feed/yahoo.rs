//! Yahoo chart API client for futures candles
//!
//! Fetches OHLCV bars over REST and maps HTTP failures onto the feed error
//! taxonomy.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::feed::FeedAdapter;
use crate::types::{Candle, Symbol, Timeframe};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; smtpulse/0.1)";

#[derive(Debug, Clone)]
pub struct YahooFeed {
    client: reqwest::Client,
    base_url: String,
}

impl YahooFeed {
    pub fn new(config: &FeedConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl FeedAdapter for YahooFeed {
    fn name(&self) -> &'static str {
        "Yahoo"
    }

    async fn fetch_candles(
        &self,
        symbol: Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        let url = format!("{}/v8/finance/chart/{}", self.base_url, symbol.feed_ticker());

        tracing::debug!(
            symbol = %symbol,
            timeframe = %timeframe,
            limit,
            "Fetching candles from Yahoo"
        );

        let response = self
            .client
            .get(&url)
            .query(&[
                ("interval", timeframe.feed_interval()),
                ("range", timeframe.feed_range(limit)),
            ])
            .send()
            .await
            .map_err(|e| FeedError::Unavailable {
                symbol,
                reason: e.to_string(),
            })?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                return Err(FeedError::RateLimited {
                    symbol,
                    retry_after,
                });
            }
            StatusCode::NOT_FOUND => return Err(FeedError::InvalidSymbol(symbol)),
            status if !status.is_success() => {
                return Err(FeedError::Unavailable {
                    symbol,
                    reason: format!("HTTP {status}"),
                })
            }
            _ => {}
        }

        let envelope: ChartEnvelope =
            response
                .json()
                .await
                .map_err(|e| FeedError::Unavailable {
                    symbol,
                    reason: format!("malformed chart payload: {e}"),
                })?;

        parse_chart(symbol, envelope, limit)
    }
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Convert a chart payload into candles, skipping rows with missing prices
fn parse_chart(
    symbol: Symbol,
    envelope: ChartEnvelope,
    limit: usize,
) -> Result<Vec<Candle>, FeedError> {
    if let Some(error) = envelope.chart.error {
        if error.code.eq_ignore_ascii_case("not found") {
            return Err(FeedError::InvalidSymbol(symbol));
        }
        return Err(FeedError::Unavailable {
            symbol,
            reason: format!("{}: {}", error.code, error.description),
        });
    }

    let result = envelope
        .chart
        .result
        .and_then(|results| results.into_iter().next())
        .ok_or_else(|| FeedError::Unavailable {
            symbol,
            reason: "empty chart result".to_string(),
        })?;

    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();

    let candles: Vec<Candle> = result
        .timestamp
        .iter()
        .enumerate()
        .filter_map(|(i, ts)| {
            let timestamp = Utc.timestamp_opt(*ts, 0).single()?;
            Some(Candle {
                timestamp,
                open: (*quote.open.get(i)?)?,
                high: (*quote.high.get(i)?)?,
                low: (*quote.low.get(i)?)?,
                close: (*quote.close.get(i)?)?,
                volume: quote.volume.get(i).copied().flatten().unwrap_or(0.0),
            })
        })
        .collect();

    let skip = candles.len().saturating_sub(limit);
    Ok(candles.into_iter().skip(skip).collect())
}
