//! Configuration management for SMT Pulse
//!
//! Loads from optional config files + environment variables via .env

mod settings;
mod types;

pub use settings::{AnalysisSettings, SettingsProvider, SettingsUpdate, SharedSettings};
pub use types::*;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::ConfigurationError;
use crate::killzone::Priority;
use crate::types::{Symbol, Timeframe};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub feed: FeedConfig,
    pub cache: CacheConfig,
    pub analysis: AnalysisSettings,
    pub killzones: KillzoneConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Symbols to fetch every cycle
    pub symbols: Vec<String>,
    /// Primary symbol of the correlated pair
    pub primary: String,
    /// Secondary symbol of the correlated pair
    pub secondary: String,
    /// Candle timeframe used by the detectors (1m, 5m, 15m, 1h, 1d)
    pub timeframe: String,
    /// Candles requested per symbol per fetch
    pub candle_limit: usize,
    /// Market-data refresh interval in seconds
    pub market_refresh_secs: u64,
    /// Per-attempt fetch timeout in milliseconds
    pub fetch_timeout_ms: u64,
    /// Retries after the first fetch attempt
    pub max_retries: u32,
    /// First backoff step in milliseconds
    pub retry_base_ms: u64,
    /// Backoff cap in milliseconds
    pub retry_max_ms: u64,
    /// Upper bound for a read-triggered recompute, in milliseconds
    pub read_timeout_ms: u64,
    /// Recompute attempts on a cache miss
    pub read_attempts: u32,
    /// Capacity of the notification channel
    pub broadcast_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Chart API base URL
    pub base_url: String,
    /// Declared timezone of the feed, as minutes east of UTC
    pub utc_offset_minutes: i32,
    /// HTTP request timeout in milliseconds
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// TTL for market snapshots in seconds
    pub snapshot_ttl_secs: u64,
    /// TTL for the signal set and stats in seconds
    pub signals_ttl_secs: u64,
    /// TTL for fractals, volume anomalies and true opens in seconds
    pub structure_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KillzoneConfig {
    /// Timezone of the window table, as minutes east of UTC
    pub utc_offset_minutes: i32,
    /// Custom window table; empty means the built-in sessions
    #[serde(default)]
    pub windows: Vec<KillzoneWindowConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KillzoneWindowConfig {
    pub name: String,
    /// Start time of day, "HH:MM"
    pub start: String,
    /// End time of day, "HH:MM" (may be earlier than start to wrap midnight)
    pub end: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is not set
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let defaults = AnalysisSettings::default();

        let config = Config::builder()
            // Pipeline defaults
            .set_default("pipeline.symbols", vec!["ES", "NQ"])?
            .set_default("pipeline.primary", "ES")?
            .set_default("pipeline.secondary", "NQ")?
            .set_default("pipeline.timeframe", "15m")?
            .set_default("pipeline.candle_limit", 200)?
            .set_default("pipeline.market_refresh_secs", 30)?
            .set_default("pipeline.fetch_timeout_ms", 10_000)?
            .set_default("pipeline.max_retries", 3)?
            .set_default("pipeline.retry_base_ms", 500)?
            .set_default("pipeline.retry_max_ms", 10_000)?
            .set_default("pipeline.read_timeout_ms", 15_000)?
            .set_default("pipeline.read_attempts", 2)?
            .set_default("pipeline.broadcast_capacity", 100)?
            // Feed defaults
            .set_default("feed.base_url", "https://query1.finance.yahoo.com")?
            .set_default("feed.utc_offset_minutes", -300)?
            .set_default("feed.request_timeout_ms", 10_000)?
            // Cache defaults
            .set_default("cache.snapshot_ttl_secs", 60)?
            .set_default("cache.signals_ttl_secs", 300)?
            .set_default("cache.structure_ttl_secs", 120)?
            // Analysis defaults (initial settings)
            .set_default("analysis.strength_threshold", defaults.strength_threshold)?
            .set_default("analysis.divergence_threshold", defaults.divergence_threshold)?
            .set_default(
                "analysis.confirmation_candles",
                defaults.confirmation_candles as u64,
            )?
            .set_default("analysis.volume_multiplier", defaults.volume_multiplier)?
            .set_default(
                "analysis.max_signals_display",
                defaults.max_signals_display as u64,
            )?
            .set_default("analysis.refresh_interval_ms", defaults.refresh_interval_ms)?
            .set_default("analysis.lookback_period", defaults.lookback_period as u64)?
            .set_default("analysis.fractal_period", defaults.fractal_period as u64)?
            .set_default("analysis.max_fractals", defaults.max_fractals as u64)?
            .set_default("analysis.volume_lookback", defaults.volume_lookback as u64)?
            .set_default(
                "analysis.volume_signal_scan",
                defaults.volume_signal_scan as u64,
            )?
            .set_default("analysis.severity_medium", defaults.severity_medium)?
            .set_default("analysis.severity_high", defaults.severity_high)?
            .set_default("analysis.false_break_min_pct", defaults.false_break_min_pct)?
            .set_default(
                "analysis.judas_min_excursion_pct",
                defaults.judas_min_excursion_pct,
            )?
            // Killzone defaults
            .set_default("killzones.utc_offset_minutes", 0)?
            // Logging defaults
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (SMTPULSE_*)
            .add_source(Environment::with_prefix("SMTPULSE").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Validate everything that would otherwise fail later at runtime
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.pipeline.active_symbols()?;
        self.pipeline.correlated_pair()?;
        self.pipeline.candle_timeframe()?;
        if self.pipeline.candle_limit < self.analysis.lookback_period {
            return Err(ConfigurationError::Invalid {
                field: "pipeline.candle_limit",
                reason: format!(
                    "{} is below analysis.lookback_period {}",
                    self.pipeline.candle_limit, self.analysis.lookback_period
                ),
            });
        }
        if self.pipeline.market_refresh_secs == 0 {
            return Err(ConfigurationError::Invalid {
                field: "pipeline.market_refresh_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.pipeline.broadcast_capacity == 0 {
            return Err(ConfigurationError::Invalid {
                field: "pipeline.broadcast_capacity",
                reason: "must be positive".to_string(),
            });
        }
        self.analysis.validate()?;
        crate::killzone::KillzoneScheduler::from_config(&self.killzones)?;
        Ok(())
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "symbols={:?} pair={}/{} tf={} limit={} market_refresh={}s signal_refresh={}ms",
            self.pipeline.symbols,
            self.pipeline.primary,
            self.pipeline.secondary,
            self.pipeline.timeframe,
            self.pipeline.candle_limit,
            self.pipeline.market_refresh_secs,
            self.analysis.refresh_interval_ms
        )
    }
}

impl PipelineConfig {
    /// Parsed symbol set, including both legs of the correlated pair
    pub fn active_symbols(&self) -> Result<Vec<Symbol>, ConfigurationError> {
        let mut symbols = Vec::new();
        for raw in &self.symbols {
            let symbol = Symbol::from_str(raw).ok_or_else(|| ConfigurationError::Invalid {
                field: "pipeline.symbols",
                reason: format!("unknown symbol {raw}"),
            })?;
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
        let (primary, secondary) = self.correlated_pair()?;
        for symbol in [primary, secondary] {
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
        Ok(symbols)
    }

    pub fn correlated_pair(&self) -> Result<(Symbol, Symbol), ConfigurationError> {
        let primary = Symbol::from_str(&self.primary).ok_or_else(|| ConfigurationError::Invalid {
            field: "pipeline.primary",
            reason: format!("unknown symbol {}", self.primary),
        })?;
        let secondary =
            Symbol::from_str(&self.secondary).ok_or_else(|| ConfigurationError::Invalid {
                field: "pipeline.secondary",
                reason: format!("unknown symbol {}", self.secondary),
            })?;
        if primary == secondary {
            return Err(ConfigurationError::Invalid {
                field: "pipeline.secondary",
                reason: "must differ from pipeline.primary".to_string(),
            });
        }
        Ok((primary, secondary))
    }

    pub fn candle_timeframe(&self) -> Result<Timeframe, ConfigurationError> {
        Timeframe::from_str(&self.timeframe).ok_or_else(|| ConfigurationError::Invalid {
            field: "pipeline.timeframe",
            reason: format!("unsupported timeframe {}", self.timeframe),
        })
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
