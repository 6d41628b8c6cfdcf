//! Runtime analysis settings
//!
//! Thresholds the detectors read at the start of every cycle. Updates are
//! validated at the boundary and only become visible to the next cycle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::ConfigurationError;
use crate::killzone::Priority;

/// Detector thresholds and display limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    /// Minimum signal strength kept in the published set
    pub strength_threshold: f64,
    /// Minimum |divergence| in percent for an SMT signal
    pub divergence_threshold: f64,
    /// Candles that must hold a divergence before it counts as confirmed
    pub confirmation_candles: usize,
    /// Volume / average ratio that flags an anomaly
    pub volume_multiplier: f64,
    /// Cap on the published signal list
    pub max_signals_display: usize,
    /// Signal-set refresh interval in milliseconds
    pub refresh_interval_ms: u64,
    /// Priority overrides keyed by killzone name
    #[serde(default)]
    pub killzone_priorities: BTreeMap<String, Priority>,
    /// Synchronized candles the divergence detector looks at
    pub lookback_period: usize,
    /// Fractal half-window `k` (window is 2k+1 candles)
    pub fractal_period: usize,
    /// Confirmed fractals retained per symbol
    pub max_fractals: usize,
    /// Rolling volume average length
    pub volume_lookback: usize,
    /// Most recent candles checked for volume signals
    pub volume_signal_scan: usize,
    /// Ratio cut point for medium severity
    pub severity_medium: f64,
    /// Ratio cut point for high severity
    pub severity_high: f64,
    /// Minimum sweep beyond a swing level, in percent, for a false break
    pub false_break_min_pct: f64,
    /// Minimum sweep beyond the session open, in percent, for a Judas swing
    pub judas_min_excursion_pct: f64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            strength_threshold: 0.5,
            divergence_threshold: 0.5,
            confirmation_candles: 3,
            volume_multiplier: 1.5,
            max_signals_display: 10,
            refresh_interval_ms: 300_000,
            killzone_priorities: BTreeMap::new(),
            lookback_period: 20,
            fractal_period: 2,
            max_fractals: 50,
            volume_lookback: 20,
            volume_signal_scan: 5,
            severity_medium: 2.0,
            severity_high: 3.0,
            false_break_min_pct: 0.05,
            judas_min_excursion_pct: 0.1,
        }
    }
}

impl AnalysisSettings {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        ConfigurationError::check_range("strength_threshold", self.strength_threshold, 0.0, 1.0)?;
        ConfigurationError::check_range(
            "divergence_threshold",
            self.divergence_threshold,
            0.1,
            2.0,
        )?;
        ConfigurationError::check_range(
            "confirmation_candles",
            self.confirmation_candles as f64,
            1.0,
            10.0,
        )?;
        ConfigurationError::check_range("volume_multiplier", self.volume_multiplier, 1.0, 5.0)?;
        ConfigurationError::check_range(
            "max_signals_display",
            self.max_signals_display as f64,
            1.0,
            100.0,
        )?;
        if self.refresh_interval_ms < 1_000 {
            return Err(ConfigurationError::Invalid {
                field: "refresh_interval_ms",
                reason: format!("{} is below 1000", self.refresh_interval_ms),
            });
        }
        ConfigurationError::check_range("fractal_period", self.fractal_period as f64, 1.0, 10.0)?;
        let min_lookback = 2 * self.fractal_period + 3;
        if self.lookback_period < min_lookback {
            return Err(ConfigurationError::Invalid {
                field: "lookback_period",
                reason: format!(
                    "{} cannot hold two swings of period {} (need {})",
                    self.lookback_period, self.fractal_period, min_lookback
                ),
            });
        }
        if self.max_fractals == 0 {
            return Err(ConfigurationError::Invalid {
                field: "max_fractals",
                reason: "must be positive".to_string(),
            });
        }
        if self.volume_lookback < 2 {
            return Err(ConfigurationError::Invalid {
                field: "volume_lookback",
                reason: format!("{} is below 2", self.volume_lookback),
            });
        }
        ConfigurationError::check_range(
            "severity_medium",
            self.severity_medium,
            1.0,
            self.severity_high,
        )?;
        ConfigurationError::check_range("severity_high", self.severity_high, 1.0, f64::MAX)?;
        ConfigurationError::check_range(
            "false_break_min_pct",
            self.false_break_min_pct,
            0.0,
            100.0,
        )?;
        ConfigurationError::check_range(
            "judas_min_excursion_pct",
            self.judas_min_excursion_pct,
            0.0,
            100.0,
        )?;
        Ok(())
    }

    /// Return a copy with the update applied, validated as a whole
    pub fn merged(&self, update: &SettingsUpdate) -> Result<Self, ConfigurationError> {
        let mut next = self.clone();
        if let Some(v) = update.strength_threshold {
            next.strength_threshold = v;
        }
        if let Some(v) = update.divergence_threshold {
            next.divergence_threshold = v;
        }
        if let Some(v) = update.confirmation_candles {
            next.confirmation_candles = v;
        }
        if let Some(v) = update.volume_multiplier {
            next.volume_multiplier = v;
        }
        if let Some(v) = update.max_signals_display {
            next.max_signals_display = v;
        }
        if let Some(v) = update.refresh_interval_ms {
            next.refresh_interval_ms = v;
        }
        if let Some(ref v) = update.killzone_priorities {
            next.killzone_priorities = v.clone();
        }
        if let Some(v) = update.severity_medium {
            next.severity_medium = v;
        }
        if let Some(v) = update.severity_high {
            next.severity_high = v;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Partial settings update as received from the transport layer
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub strength_threshold: Option<f64>,
    pub divergence_threshold: Option<f64>,
    pub confirmation_candles: Option<usize>,
    pub volume_multiplier: Option<f64>,
    pub max_signals_display: Option<usize>,
    pub refresh_interval_ms: Option<u64>,
    pub killzone_priorities: Option<BTreeMap<String, Priority>>,
    pub severity_medium: Option<f64>,
    pub severity_high: Option<f64>,
}

/// Source of the settings a cycle runs with
pub trait SettingsProvider: Send + Sync {
    /// Snapshot of the current settings
    fn current(&self) -> AnalysisSettings;
}

/// In-process settings provider backed by a lock
#[derive(Debug)]
pub struct SharedSettings {
    inner: RwLock<AnalysisSettings>,
}

impl SharedSettings {
    pub fn new(initial: AnalysisSettings) -> Result<Self, ConfigurationError> {
        initial.validate()?;
        Ok(Self {
            inner: RwLock::new(initial),
        })
    }

    /// Validate and apply an update; on error the current settings stay untouched
    pub fn apply(&self, update: &SettingsUpdate) -> Result<AnalysisSettings, ConfigurationError> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let next = guard.merged(update)?;
        *guard = next.clone();
        tracing::info!(
            strength_threshold = next.strength_threshold,
            divergence_threshold = next.divergence_threshold,
            max_signals = next.max_signals_display,
            "Analysis settings updated"
        );
        Ok(next)
    }
}

impl SettingsProvider for SharedSettings {
    fn current(&self) -> AnalysisSettings {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
