//! Core types used throughout SMT Pulse
//!
//! Defines common data structures for candles, snapshots, signals and the
//! structural points the analyzers produce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Supported index futures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Symbol {
    /// E-mini S&P 500
    ES,
    /// E-mini Nasdaq-100
    NQ,
    /// E-mini Dow
    YM,
    /// E-mini Russell 2000
    RTY,
}

impl Default for Symbol {
    fn default() -> Self {
        Symbol::ES
    }
}

impl Symbol {
    pub const ALL: [Symbol; 4] = [Symbol::ES, Symbol::NQ, Symbol::YM, Symbol::RTY];

    /// Ticker used by the quote feed (e.g., "ES=F")
    pub fn feed_ticker(&self) -> &'static str {
        match self {
            Symbol::ES => "ES=F",
            Symbol::NQ => "NQ=F",
            Symbol::YM => "YM=F",
            Symbol::RTY => "RTY=F",
        }
    }

    /// Parse from string, accepting both "ES" and "ES=F"
    pub fn from_str(s: &str) -> Option<Self> {
        let upper = s.trim().to_uppercase();
        match upper.trim_end_matches("=F") {
            "ES" => Some(Symbol::ES),
            "NQ" => Some(Symbol::NQ),
            "YM" => Some(Symbol::YM),
            "RTY" => Some(Symbol::RTY),
            _ => None,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::ES => write!(f, "ES"),
            Symbol::NQ => write!(f, "NQ"),
            Symbol::YM => write!(f, "YM"),
            Symbol::RTY => write!(f, "RTY"),
        }
    }
}

/// Supported candle timeframes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    Min1,
    Min5,
    Min15,
    Hour1,
    Day1,
}

impl Default for Timeframe {
    fn default() -> Self {
        Timeframe::Min15
    }
}

impl Timeframe {
    /// Get duration in seconds
    pub fn duration_secs(&self) -> i64 {
        match self {
            Timeframe::Min1 => 60,
            Timeframe::Min5 => 5 * 60,
            Timeframe::Min15 => 15 * 60,
            Timeframe::Hour1 => 60 * 60,
            Timeframe::Day1 => 24 * 60 * 60,
        }
    }

    /// Interval string understood by the quote feed
    pub fn feed_interval(&self) -> &'static str {
        match self {
            Timeframe::Min1 => "1m",
            Timeframe::Min5 => "5m",
            Timeframe::Min15 => "15m",
            Timeframe::Hour1 => "60m",
            Timeframe::Day1 => "1d",
        }
    }

    /// Smallest feed range that covers `limit` candles of this timeframe
    pub fn feed_range(&self, limit: usize) -> &'static str {
        let days = (self.duration_secs() * limit as i64) / 86_400 + 1;
        match (self, days) {
            (Timeframe::Min1, d) if d <= 1 => "1d",
            (Timeframe::Min1, _) => "5d",
            (_, d) if d <= 5 => "5d",
            (_, d) if d <= 30 => "1mo",
            (Timeframe::Day1, d) if d > 90 => "1y",
            _ => "3mo",
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "1m" | "1min" => Some(Timeframe::Min1),
            "5m" | "5min" => Some(Timeframe::Min5),
            "15m" | "15min" => Some(Timeframe::Min15),
            "1h" | "60m" | "1hour" => Some(Timeframe::Hour1),
            "1d" | "1day" => Some(Timeframe::Day1),
            _ => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::Min1 => write!(f, "1m"),
            Timeframe::Min5 => write!(f, "5m"),
            Timeframe::Min15 => write!(f, "15m"),
            Timeframe::Hour1 => write!(f, "1h"),
            Timeframe::Day1 => write!(f, "1d"),
        }
    }
}

/// Candlestick data for one symbol/timeframe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time (start of period)
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Trading state of the market at snapshot time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketState {
    Open,
    Closed,
    PreMarket,
    AfterHours,
    Unknown,
}

impl fmt::Display for MarketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketState::Open => write!(f, "open"),
            MarketState::Closed => write!(f, "closed"),
            MarketState::PreMarket => write!(f, "pre_market"),
            MarketState::AfterHours => write!(f, "after_hours"),
            MarketState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Latest market view for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    pub current_price: f64,
    /// Change versus the previous candle close, in percent
    pub change_percent: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
    pub market_state: MarketState,
    #[serde(default)]
    pub technical: TechnicalIndicators,
}

/// Indicator block attached to each snapshot; `None` until enough history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TechnicalIndicators {
    pub rsi: Option<f64>,
    pub sma_20: Option<f64>,
    pub ema_12: Option<f64>,
    pub ema_26: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub bollinger_upper: Option<f64>,
    pub bollinger_lower: Option<f64>,
    pub atr: Option<f64>,
}

/// Signal classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    BullishDivergence,
    BearishDivergence,
    FalseBreakUp,
    FalseBreakDown,
    VolumeSpike,
    VolumeDivergenceBullish,
    VolumeDivergenceBearish,
    JudasSwingBullish,
    JudasSwingBearish,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::BullishDivergence => "bullish_divergence",
            SignalType::BearishDivergence => "bearish_divergence",
            SignalType::FalseBreakUp => "false_break_up",
            SignalType::FalseBreakDown => "false_break_down",
            SignalType::VolumeSpike => "volume_spike",
            SignalType::VolumeDivergenceBullish => "volume_divergence_bullish",
            SignalType::VolumeDivergenceBearish => "volume_divergence_bearish",
            SignalType::JudasSwingBullish => "judas_swing_bullish",
            SignalType::JudasSwingBearish => "judas_swing_bearish",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured, per-detector signal payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    Divergence {
        secondary: Symbol,
        /// Percent change between the primary's last two swings
        primary_change: f64,
        /// Percent change between the secondary's last two swings
        secondary_change: f64,
        primary_swings: (f64, f64),
        secondary_swings: (f64, f64),
        lookback: usize,
        volume_confirmed: bool,
    },
    FalseBreak {
        /// Swing level that was swept
        level: f64,
        /// Extreme printed beyond the level
        sweep_extreme: f64,
        close: f64,
        excursion_pct: f64,
    },
    Volume {
        volume: f64,
        avg_volume: f64,
        ratio: f64,
        severity: Severity,
    },
    JudasSwing {
        session: String,
        session_open: f64,
        sweep_extreme: f64,
        close: f64,
        excursion_pct: f64,
    },
}

/// Analysis signal, created once by a single detector and never mutated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub signal_type: SignalType,
    /// Symbol the signal was detected on (primary for divergences)
    pub symbol: Symbol,
    /// Strength in [0, 1]
    pub strength: f64,
    /// Signed divergence in percent (0.0 for non-divergence signals)
    pub divergence_percentage: f64,
    /// Reference price of the primary correlated symbol
    pub primary_price: f64,
    /// Reference price of the secondary correlated symbol
    pub secondary_price: f64,
    pub confirmation_status: bool,
    /// Timestamp of the candle that produced the signal
    pub timestamp: DateTime<Utc>,
    pub payload: SignalPayload,
    /// Unstructured diagnostics
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl Signal {
    /// Deterministic id, identical across replays of the same candles
    pub fn make_id(signal_type: SignalType, symbol: Symbol, timestamp: DateTime<Utc>) -> String {
        let name = format!(
            "{}:{}:{}",
            signal_type,
            symbol,
            timestamp.timestamp_millis()
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }
}

/// Fractal kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FractalKind {
    High,
    Low,
}

/// Swing point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fractal {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    #[serde(rename = "type")]
    pub kind: FractalKind,
    /// Position of the candle in the observed sequence
    pub index: usize,
    pub confirmed: bool,
}

/// Volume anomaly severity tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeAnomaly {
    pub timestamp: DateTime<Utc>,
    pub volume: f64,
    pub avg_volume: f64,
    pub ratio: f64,
    pub severity: Severity,
}

/// True-open period granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Daily,
    Weekly,
    Quarterly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrueOpen {
    pub symbol: Symbol,
    pub granularity: Granularity,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Latest anchors for one symbol; `None` until the period's first candle is seen
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrueOpens {
    pub daily: Option<TrueOpen>,
    pub weekly: Option<TrueOpen>,
    pub quarterly: Option<TrueOpen>,
}

impl TrueOpens {
    pub fn get(&self, granularity: Granularity) -> Option<&TrueOpen> {
        match granularity {
            Granularity::Daily => self.daily.as_ref(),
            Granularity::Weekly => self.weekly.as_ref(),
            Granularity::Quarterly => self.quarterly.as_ref(),
        }
    }
}
