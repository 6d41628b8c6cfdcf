//! Analysis orchestrator
//!
//! Periodic coordinator: fetches candles for the active symbols, runs the
//! detectors concurrently on blocking threads, merges their output and
//! publishes one complete result set to the cache. Cycles never overlap; a
//! tick that finds one in flight is skipped.

mod reads;
mod snapshot;
mod stats;

pub use reads::SignalFilter;
pub use snapshot::{build_snapshot, market_state_at};
pub use stats::{AnalysisStats, CycleStats};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::analysis::{default_detectors, DetectionInput, SignalDetector, StructuralAnalyzers};
use crate::cache::{keys, PublishBatch, ResultCache};
use crate::config::{AnalysisSettings, AppConfig, SettingsProvider};
use crate::error::{CacheError, ConfigurationError, FeedError};
use crate::feed::{fetch_with_retry, FeedAdapter, RetryPolicy};
use crate::killzone::KillzoneScheduler;
use crate::notify::SignalBroadcaster;
use crate::types::{
    Candle, Fractal, MarketSnapshot, Signal, Symbol, Timeframe, TrueOpens, VolumeAnomaly,
};

/// Runtime parameters of the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub symbols: Vec<Symbol>,
    pub primary: Symbol,
    pub secondary: Symbol,
    pub timeframe: Timeframe,
    pub candle_limit: usize,
    pub market_refresh: Duration,
    pub retry: RetryPolicy,
    /// Bound on one read-triggered recompute
    pub read_timeout: Duration,
    pub read_attempts: u32,
    pub snapshot_ttl: Duration,
    pub signals_ttl: Duration,
    pub structure_ttl: Duration,
    pub feed_utc_offset_minutes: i32,
    pub broadcast_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            symbols: vec![Symbol::ES, Symbol::NQ],
            primary: Symbol::ES,
            secondary: Symbol::NQ,
            timeframe: Timeframe::Min15,
            candle_limit: 200,
            market_refresh: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            read_timeout: Duration::from_secs(15),
            read_attempts: 2,
            snapshot_ttl: Duration::from_secs(60),
            signals_ttl: Duration::from_secs(300),
            structure_ttl: Duration::from_secs(120),
            feed_utc_offset_minutes: -300,
            broadcast_capacity: 100,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_app(config: &AppConfig) -> Result<Self, ConfigurationError> {
        let pipeline = &config.pipeline;
        let (primary, secondary) = pipeline.correlated_pair()?;

        Ok(Self {
            symbols: pipeline.active_symbols()?,
            primary,
            secondary,
            timeframe: pipeline.candle_timeframe()?,
            candle_limit: pipeline.candle_limit,
            market_refresh: Duration::from_secs(pipeline.market_refresh_secs),
            retry: RetryPolicy {
                attempt_timeout: Duration::from_millis(pipeline.fetch_timeout_ms),
                max_retries: pipeline.max_retries,
                base_backoff: Duration::from_millis(pipeline.retry_base_ms),
                max_backoff: Duration::from_millis(pipeline.retry_max_ms),
            },
            read_timeout: Duration::from_millis(pipeline.read_timeout_ms),
            read_attempts: pipeline.read_attempts.max(1),
            snapshot_ttl: Duration::from_secs(config.cache.snapshot_ttl_secs),
            signals_ttl: Duration::from_secs(config.cache.signals_ttl_secs),
            structure_ttl: Duration::from_secs(config.cache.structure_ttl_secs),
            feed_utc_offset_minutes: config.feed.utc_offset_minutes,
            broadcast_capacity: pipeline.broadcast_capacity,
        })
    }
}

/// Everything the orchestrator depends on, injected at construction
pub struct AnalysisContext {
    pub feed: Arc<dyn FeedAdapter>,
    pub cache: Arc<ResultCache>,
    pub settings: Arc<dyn SettingsProvider>,
    pub killzones: KillzoneScheduler,
    pub config: OrchestratorConfig,
}

/// What a cycle refreshes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// Snapshots only
    Market,
    /// Snapshots, signals, stats and structural results
    Full,
}

/// State owned by whoever holds the cycle lock
struct CycleState {
    active: Vec<Symbol>,
    structural: StructuralAnalyzers,
    last_snapshots: BTreeMap<Symbol, MarketSnapshot>,
}

/// Fully computed, not yet published cycle result
struct CycleOutput {
    kind: CycleKind,
    snapshots: BTreeMap<Symbol, MarketSnapshot>,
    analysis: Option<AnalysisOutput>,
    stats: CycleStats,
}

struct AnalysisOutput {
    signals: Vec<Signal>,
    stats: AnalysisStats,
    true_opens: BTreeMap<Symbol, TrueOpens>,
    fractals: BTreeMap<Symbol, Vec<Fractal>>,
    volume: BTreeMap<Symbol, Vec<VolumeAnomaly>>,
}

pub struct AnalysisOrchestrator {
    ctx: AnalysisContext,
    detectors: Vec<Arc<dyn SignalDetector>>,
    state: Mutex<CycleState>,
    broadcaster: SignalBroadcaster,
    last_cycle: RwLock<Option<CycleStats>>,
}

impl AnalysisOrchestrator {
    pub fn new(ctx: AnalysisContext) -> Self {
        Self::with_detectors(ctx, default_detectors())
    }

    pub fn with_detectors(ctx: AnalysisContext, detectors: Vec<Arc<dyn SignalDetector>>) -> Self {
        let state = CycleState {
            active: ctx.config.symbols.clone(),
            structural: StructuralAnalyzers::new(ctx.config.feed_utc_offset_minutes),
            last_snapshots: BTreeMap::new(),
        };
        let broadcaster = SignalBroadcaster::new(ctx.config.broadcast_capacity);

        Self {
            ctx,
            detectors,
            state: Mutex::new(state),
            broadcaster,
            last_cycle: RwLock::new(None),
        }
    }

    pub fn broadcaster(&self) -> &SignalBroadcaster {
        &self.broadcaster
    }

    /// Symbols still being fetched
    pub async fn active_symbols(&self) -> Vec<Symbol> {
        self.state.lock().await.active.clone()
    }

    /// Counters of the last published cycle
    pub fn last_cycle(&self) -> Option<CycleStats> {
        self.last_cycle
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run one cycle to completion, waiting for any in-flight cycle first
    pub async fn run_once(&self, kind: CycleKind) -> CycleStats {
        let mut state = self.state.lock().await;
        let output = self.compute(&mut state, kind).await;
        self.publish(&mut state, output).await
    }

    /// Drive both refresh periods until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut market_tick = tokio::time::interval(self.ctx.config.market_refresh);
        market_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut next_full = tokio::time::Instant::now();
        let mut cycle_shutdown = shutdown.clone();

        info!(
            symbols = ?self.ctx.config.symbols,
            primary = %self.ctx.config.primary,
            secondary = %self.ctx.config.secondary,
            timeframe = %self.ctx.config.timeframe,
            "🚀 Analysis orchestrator started"
        );

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = market_tick.tick() => {
                    self.broadcaster.broadcast_heartbeat();
                    self.tick(CycleKind::Market, &mut cycle_shutdown).await;
                }
                _ = tokio::time::sleep_until(next_full) => {
                    self.tick(CycleKind::Full, &mut cycle_shutdown).await;
                    // Re-read every cycle so interval updates apply to the next one
                    let interval = self.ctx.settings.current().refresh_interval_ms;
                    next_full = tokio::time::Instant::now() + Duration::from_millis(interval);
                }
            }
        }

        info!("Analysis orchestrator stopped");
    }

    /// One scheduled cycle; skipped when another is in flight
    async fn tick(&self, kind: CycleKind, shutdown: &mut watch::Receiver<bool>) {
        let Ok(mut state) = self.state.try_lock() else {
            debug!(?kind, "Cycle in flight, skipping tick");
            return;
        };

        let output = tokio::select! {
            output = self.compute(&mut state, kind) => output,
            _ = wait_for_shutdown(shutdown) => {
                info!(?kind, "Shutdown during cycle, abandoning before publish");
                return;
            }
        };
        self.publish(&mut state, output).await;
    }

    /// Bounded recompute on behalf of a reader. Waits for an in-flight cycle
    /// and skips the work when that cycle already published `key`.
    async fn refresh_for_read(&self, key: &str, kind: CycleKind) -> bool {
        let timed = tokio::time::timeout(self.ctx.config.read_timeout, async {
            let mut state = self.state.lock().await;
            if self
                .ctx
                .cache
                .get_json::<serde_json::Value>(key)
                .await
                .is_some()
            {
                return (state, None);
            }
            let output = self.compute(&mut state, kind).await;
            (state, Some(output))
        })
        .await;

        match timed {
            Ok((mut state, Some(output))) => {
                self.publish(&mut state, output).await;
                true
            }
            Ok((_, None)) => true,
            Err(_) => {
                warn!(
                    key,
                    timeout_ms = self.ctx.config.read_timeout.as_millis() as u64,
                    "Read-triggered recompute timed out"
                );
                false
            }
        }
    }

    async fn compute(&self, state: &mut CycleState, kind: CycleKind) -> CycleOutput {
        let started = Instant::now();
        let now = Utc::now();
        let settings = self.ctx.settings.current();
        let mut stats = CycleStats::default();

        let candles = self.fetch_all(state, &mut stats).await;

        let mut snapshots = BTreeMap::new();
        for symbol in &state.active {
            let fresh = candles
                .get(symbol)
                .and_then(|c| build_snapshot(*symbol, c, now));
            let snapshot = match fresh {
                Some(s) => Some(s),
                None => state.last_snapshots.get(symbol).map(snapshot::mark_unknown),
            };
            if let Some(s) = snapshot {
                snapshots.insert(*symbol, s);
            }
        }

        let analysis = match kind {
            CycleKind::Full if !candles.is_empty() => {
                Some(self.analyze(state, candles, &settings, now, &mut stats).await)
            }
            CycleKind::Full => {
                warn!("No candles fetched, keeping last published analysis");
                None
            }
            CycleKind::Market => None,
        };

        stats.duration_ms = started.elapsed().as_millis() as u64;
        CycleOutput {
            kind,
            snapshots,
            analysis,
            stats,
        }
    }

    /// Fetch every active symbol concurrently, dropping permanently invalid ones
    async fn fetch_all(
        &self,
        state: &mut CycleState,
        stats: &mut CycleStats,
    ) -> BTreeMap<Symbol, Vec<Candle>> {
        let config = &self.ctx.config;
        let feed = self.ctx.feed.as_ref();

        let results = join_all(state.active.iter().map(|symbol| async move {
            let result = fetch_with_retry(
                feed,
                *symbol,
                config.timeframe,
                config.candle_limit,
                &config.retry,
            )
            .await;
            (*symbol, result)
        }))
        .await;

        let mut candles = BTreeMap::new();
        for (symbol, result) in results {
            match result {
                Ok(normalized) if !normalized.candles.is_empty() => {
                    stats.symbols_fetched += 1;
                    candles.insert(symbol, normalized.candles);
                }
                Ok(_) => {
                    stats.symbols_failed += 1;
                    warn!(symbol = %symbol, "Feed returned no candles");
                }
                Err(FeedError::InvalidSymbol(_)) => {
                    stats.symbols_failed += 1;
                    state.active.retain(|s| *s != symbol);
                    error!(
                        symbol = %symbol,
                        source = self.ctx.feed.name(),
                        "Feed rejected symbol, removing it from the active set"
                    );
                }
                Err(e) => {
                    stats.symbols_failed += 1;
                    warn!(symbol = %symbol, error = %e, "Candle fetch failed this cycle");
                }
            }
        }
        candles
    }

    async fn analyze(
        &self,
        state: &mut CycleState,
        candles: BTreeMap<Symbol, Vec<Candle>>,
        settings: &AnalysisSettings,
        now: DateTime<Utc>,
        stats: &mut CycleStats,
    ) -> AnalysisOutput {
        let input = Arc::new(DetectionInput {
            candles: candles.into_iter().collect(),
            primary: self.ctx.config.primary,
            secondary: self.ctx.config.secondary,
            settings: settings.clone(),
            killzones: self.ctx.killzones.with_priorities(&settings.killzone_priorities),
        });

        let tasks = self.detectors.iter().map(|detector| {
            let detector = Arc::clone(detector);
            let input = Arc::clone(&input);
            let name = detector.name();
            let handle = tokio::task::spawn_blocking(move || detector.detect(&input));
            async move { (name, handle.await) }
        });

        let mut raw = Vec::new();
        for (name, outcome) in join_all(tasks).await {
            match outcome {
                Ok(Ok(signals)) => {
                    debug!(detector = name, count = signals.len(), "Detector finished");
                    raw.extend(signals);
                }
                Ok(Err(e)) => {
                    debug!(detector = name, reason = %e, "Detector skipped this cycle");
                }
                Err(e) => {
                    stats.detector_failures += 1;
                    warn!(detector = name, error = %e, "Detector failed, continuing without it");
                }
            }
        }

        let signals = merge_signals(raw, settings);

        let mut fractals = BTreeMap::new();
        let mut volume = BTreeMap::new();
        for (symbol, series) in &input.candles {
            state.structural.observe(*symbol, series, settings);
            fractals.insert(*symbol, state.structural.fractals(*symbol, settings.max_fractals));
            volume.insert(*symbol, StructuralAnalyzers::volume_profile(series, settings));
        }

        AnalysisOutput {
            stats: AnalysisStats::from_signals(&signals, now),
            signals,
            true_opens: state.structural.true_opens(),
            fractals,
            volume,
        }
    }

    /// Serialize everything first, then swap it into the cache and notify
    async fn publish(&self, state: &mut CycleState, output: CycleOutput) -> CycleStats {
        let batch = match encode_output(&output, &self.ctx.config) {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "Failed to encode cycle results, nothing published");
                return output.stats;
            }
        };

        self.ctx.cache.publish(batch).await;

        let mut stats = output.stats;
        stats.cache_degraded = self.ctx.cache.is_degraded();

        for (symbol, snapshot) in &output.snapshots {
            state.last_snapshots.insert(*symbol, snapshot.clone());
        }
        if !output.snapshots.is_empty() {
            self.broadcaster.broadcast_market(output.snapshots);
        }

        if let Some(analysis) = output.analysis {
            info!(
                signals = analysis.signals.len(),
                confirmed = analysis.stats.confirmed_signals,
                fetched = stats.symbols_fetched,
                failed = stats.symbols_failed,
                detector_failures = stats.detector_failures,
                duration_ms = stats.duration_ms,
                cache_degraded = stats.cache_degraded,
                "Analysis cycle published"
            );
            self.broadcaster
                .broadcast_signals(analysis.signals, analysis.stats);
        } else {
            debug!(
                kind = ?output.kind,
                fetched = stats.symbols_fetched,
                failed = stats.symbols_failed,
                "Market cycle published"
            );
        }

        *self.last_cycle.write().unwrap_or_else(|e| e.into_inner()) = Some(stats.clone());
        stats
    }
}

fn encode_output(
    output: &CycleOutput,
    config: &OrchestratorConfig,
) -> Result<PublishBatch, CacheError> {
    let mut batch = PublishBatch::new();
    if !output.snapshots.is_empty() {
        batch.put(keys::SNAPSHOTS, &output.snapshots, config.snapshot_ttl)?;
    }
    if let Some(analysis) = &output.analysis {
        batch.put(keys::SIGNALS, &analysis.signals, config.signals_ttl)?;
        batch.put(keys::STATS, &analysis.stats, config.signals_ttl)?;
        batch.put(keys::TRUE_OPENS, &analysis.true_opens, config.structure_ttl)?;
        for (symbol, fractals) in &analysis.fractals {
            batch.put(keys::fractals(*symbol), fractals, config.structure_ttl)?;
        }
        for (symbol, anomalies) in &analysis.volume {
            batch.put(keys::volume(*symbol), anomalies, config.structure_ttl)?;
        }
    }
    Ok(batch)
}

/// Keep signals above the strength floor, newest first, capped
pub fn merge_signals(mut signals: Vec<Signal>, settings: &AnalysisSettings) -> Vec<Signal> {
    signals.retain(|s| s.strength >= settings.strength_threshold);
    signals.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.strength.total_cmp(&a.strength))
            .then_with(|| a.id.cmp(&b.id))
    });
    signals.dedup_by(|a, b| a.id == b.id);
    signals.truncate(settings.max_signals_display);
    signals
}

/// Resolves once shutdown is requested; never resolves if the sender is gone
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests;
