//! Killzone scheduler
//!
//! Static table of named intraday session windows. Activity, time remaining
//! and the next session are computed per query instant and never stored.

use chrono::{DateTime, FixedOffset, NaiveTime, Offset, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::KillzoneConfig;
use crate::error::ConfigurationError;

const SECS_PER_DAY: i64 = 86_400;

/// Session priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Named window `[start, end)` in the scheduler's offset; may wrap midnight
#[derive(Debug, Clone, PartialEq)]
pub struct KillzoneWindow {
    pub name: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub priority: Priority,
    pub description: String,
}

impl KillzoneWindow {
    fn new(
        name: &str,
        start: (u32, u32),
        end: (u32, u32),
        priority: Priority,
        description: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            start: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap_or(NaiveTime::MIN),
            priority,
            description: description.to_string(),
        }
    }

    fn start_secs(&self) -> i64 {
        self.start.num_seconds_from_midnight() as i64
    }

    fn end_secs(&self) -> i64 {
        self.end.num_seconds_from_midnight() as i64
    }

    /// Whether the time of day (seconds from midnight) falls inside the window
    pub fn contains_secs(&self, t: i64) -> bool {
        let (start, end) = (self.start_secs(), self.end_secs());
        if start < end {
            t >= start && t < end
        } else {
            t >= start || t < end
        }
    }

    /// Seconds from `t` until the window closes; only meaningful while active
    fn remaining_secs(&self, t: i64) -> i64 {
        (self.end_secs() - t).rem_euclid(SECS_PER_DAY)
    }

    /// Seconds from `t` until the next start, strictly in the future
    fn until_start_secs(&self, t: i64) -> i64 {
        let delta = (self.start_secs() - t).rem_euclid(SECS_PER_DAY);
        if delta == 0 {
            SECS_PER_DAY
        } else {
            delta
        }
    }
}

/// Built-in session table (UTC)
pub fn default_sessions() -> Vec<KillzoneWindow> {
    vec![
        KillzoneWindow::new(
            "Asia Open",
            (23, 0),
            (2, 0),
            Priority::Low,
            "Liquidity buildup before London",
        ),
        KillzoneWindow::new(
            "London Open",
            (7, 0),
            (10, 0),
            Priority::High,
            "High volatility in European session",
        ),
        KillzoneWindow::new(
            "London Close",
            (11, 30),
            (12, 30),
            Priority::Medium,
            "Profit taking and transition to NY session",
        ),
        KillzoneWindow::new(
            "New York Open",
            (13, 30),
            (16, 0),
            Priority::High,
            "Volatility spike and news releases",
        ),
        KillzoneWindow::new(
            "New York Close",
            (19, 0),
            (21, 0),
            Priority::Medium,
            "Final liquidity sweep of the day",
        ),
    ]
}

/// Window as seen at a query instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillzoneStatus {
    pub name: String,
    /// "HH:MM"
    pub start_time: String,
    pub end_time: String,
    pub priority: Priority,
    pub description: String,
    pub active: bool,
}

/// Scheduler output for one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillzoneReport {
    pub evaluated_at: DateTime<Utc>,
    /// Every window in table order
    pub windows: Vec<KillzoneStatus>,
    /// Highest-priority active window
    pub current: Option<String>,
    pub current_priority: Option<Priority>,
    /// Seconds until the current window ends
    pub time_remaining_secs: Option<i64>,
    /// Window with the soonest future start
    pub next_session: Option<String>,
    pub next_session_in_secs: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct KillzoneScheduler {
    offset: FixedOffset,
    windows: Vec<KillzoneWindow>,
}

impl Default for KillzoneScheduler {
    fn default() -> Self {
        Self {
            offset: Utc.fix(),
            windows: default_sessions(),
        }
    }
}

impl KillzoneScheduler {
    pub fn new(
        offset: FixedOffset,
        windows: Vec<KillzoneWindow>,
    ) -> Result<Self, ConfigurationError> {
        for (i, window) in windows.iter().enumerate() {
            if window.start == window.end {
                return Err(ConfigurationError::Invalid {
                    field: "killzones.windows",
                    reason: format!("{} has an empty range", window.name),
                });
            }
            if windows[..i].iter().any(|w| w.name == window.name) {
                return Err(ConfigurationError::Invalid {
                    field: "killzones.windows",
                    reason: format!("duplicate window name {}", window.name),
                });
            }
        }
        Ok(Self { offset, windows })
    }

    /// Build from configuration; an empty window list means the built-in table
    pub fn from_config(config: &KillzoneConfig) -> Result<Self, ConfigurationError> {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes.saturating_mul(60))
            .ok_or_else(|| ConfigurationError::Invalid {
                field: "killzones.utc_offset_minutes",
                reason: format!("{} is not a valid offset", config.utc_offset_minutes),
            })?;

        if config.windows.is_empty() {
            return Self::new(offset, default_sessions());
        }

        let parse = |value: &str| {
            NaiveTime::parse_from_str(value, "%H:%M").map_err(|e| ConfigurationError::Invalid {
                field: "killzones.windows",
                reason: format!("bad time {value}: {e}"),
            })
        };

        let windows = config
            .windows
            .iter()
            .map(|w| {
                Ok(KillzoneWindow {
                    name: w.name.clone(),
                    start: parse(&w.start)?,
                    end: parse(&w.end)?,
                    priority: w.priority,
                    description: String::new(),
                })
            })
            .collect::<Result<Vec<_>, ConfigurationError>>()?;

        Self::new(offset, windows)
    }

    /// Copy with priorities overridden by window name. Unknown names are ignored.
    pub fn with_priorities(&self, overrides: &BTreeMap<String, Priority>) -> Self {
        let mut scheduler = self.clone();
        for (name, priority) in overrides {
            match scheduler.windows.iter_mut().find(|w| &w.name == name) {
                Some(window) => window.priority = *priority,
                None => tracing::debug!(name = %name, "Ignoring priority for unknown killzone"),
            }
        }
        scheduler
    }

    pub fn windows(&self) -> &[KillzoneWindow] {
        &self.windows
    }

    fn seconds_of_day(&self, at: DateTime<Utc>) -> i64 {
        at.with_timezone(&self.offset).num_seconds_from_midnight() as i64
    }

    /// Highest-priority active window; table order breaks ties
    pub fn current_window(&self, at: DateTime<Utc>) -> Option<&KillzoneWindow> {
        let t = self.seconds_of_day(at);
        self.windows
            .iter()
            .filter(|w| w.contains_secs(t))
            .fold(None, |best: Option<&KillzoneWindow>, w| match best {
                Some(b) if b.priority >= w.priority => Some(b),
                _ => Some(w),
            })
    }

    /// Instant the current window opened, if one is active
    pub fn current_session_start(
        &self,
        at: DateTime<Utc>,
    ) -> Option<(&KillzoneWindow, DateTime<Utc>)> {
        let window = self.current_window(at)?;
        let t = self.seconds_of_day(at);
        let elapsed = (t - window.start_secs()).rem_euclid(SECS_PER_DAY);
        let start = Utc.timestamp_opt(at.timestamp() - elapsed, 0).single()?;
        Some((window, start))
    }

    /// Evaluate every window at `at`
    pub fn report(&self, at: DateTime<Utc>) -> KillzoneReport {
        let t = self.seconds_of_day(at);
        let current = self.current_window(at);

        let next = self
            .windows
            .iter()
            .map(|w| (w, w.until_start_secs(t)))
            .fold(None, |best: Option<(&KillzoneWindow, i64)>, (w, d)| match best {
                Some((_, bd)) if bd <= d => best,
                _ => Some((w, d)),
            });

        KillzoneReport {
            evaluated_at: at,
            windows: self
                .windows
                .iter()
                .map(|w| KillzoneStatus {
                    name: w.name.clone(),
                    start_time: w.start.format("%H:%M").to_string(),
                    end_time: w.end.format("%H:%M").to_string(),
                    priority: w.priority,
                    description: w.description.clone(),
                    active: w.contains_secs(t),
                })
                .collect(),
            current: current.map(|w| w.name.clone()),
            current_priority: current.map(|w| w.priority),
            time_remaining_secs: current.map(|w| w.remaining_secs(t)),
            next_session: next.map(|(w, _)| w.name.clone()),
            next_session_in_secs: next.map(|(_, d)| d),
        }
    }
}
