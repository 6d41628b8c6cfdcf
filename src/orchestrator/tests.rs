use super::*;
use crate::analysis::VolumeDetector;
use crate::cache::MemoryStore;
use crate::config::{SettingsUpdate, SharedSettings};
use crate::error::AnalysisError;
use crate::feed::MockFeedAdapter;
use crate::notify::PipelineEvent;
use crate::types::{MarketState, SignalPayload, SignalType};
use async_trait::async_trait;
use chrono::TimeZone;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn candles(spike: bool) -> Vec<Candle> {
    let start = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
    (0..60)
        .map(|i| {
            let wave = ((i as f64) * 0.9).sin() * 4.0;
            let volume = if spike && i == 59 { 5_000.0 } else { 1_000.0 };
            Candle {
                timestamp: start + chrono::Duration::minutes(15 * i),
                open: 100.0 + wave,
                high: 101.0 + wave,
                low: 99.0 + wave,
                close: 100.2 + wave,
                volume,
            }
        })
        .collect()
}

fn config(symbols: Vec<Symbol>) -> OrchestratorConfig {
    OrchestratorConfig {
        symbols,
        retry: RetryPolicy {
            attempt_timeout: Duration::from_secs(1),
            max_retries: 0,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        },
        read_timeout: Duration::from_secs(2),
        read_attempts: 1,
        ..Default::default()
    }
}

fn orchestrator(
    feed: impl FeedAdapter + 'static,
    config: OrchestratorConfig,
) -> (AnalysisOrchestrator, Arc<SharedSettings>) {
    let settings = Arc::new(SharedSettings::new(AnalysisSettings::default()).unwrap());
    let ctx = AnalysisContext {
        feed: Arc::new(feed),
        cache: Arc::new(ResultCache::new(Arc::new(MemoryStore::new()))),
        settings: settings.clone(),
        killzones: KillzoneScheduler::default(),
        config,
    };
    (AnalysisOrchestrator::new(ctx), settings)
}

fn healthy_feed() -> MockFeedAdapter {
    let mut feed = MockFeedAdapter::new();
    feed.expect_name().return_const("mock");
    feed.expect_fetch_candles()
        .returning(|_, _, _| Ok(candles(true)));
    feed
}

struct PanickingDetector;

impl SignalDetector for PanickingDetector {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn detect(&self, _input: &DetectionInput) -> Result<Vec<Signal>, AnalysisError> {
        panic!("detector bug")
    }
}

struct SlowFeed;

#[async_trait]
impl FeedAdapter for SlowFeed {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn fetch_candles(
        &self,
        _symbol: Symbol,
        _timeframe: Timeframe,
        _limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(candles(true))
    }
}

#[tokio::test]
async fn full_cycle_publishes_signals_and_structure() {
    let (orch, _) = orchestrator(healthy_feed(), config(vec![Symbol::ES, Symbol::NQ]));
    let mut rx = orch.broadcaster().subscribe();

    let stats = orch.run_once(CycleKind::Full).await;

    assert_eq!(stats.symbols_fetched, 2);
    assert_eq!(stats.detector_failures, 0);
    let signals = orch.signals(&SignalFilter::default()).await;
    assert!(signals
        .iter()
        .any(|s| s.signal_type == SignalType::VolumeSpike));
    assert!(signals.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    assert_eq!(orch.analysis_stats().await.total_signals, signals.len());
    assert!(!orch.fractals(Symbol::ES, 5).await.is_empty());
    assert!(orch.fractals(Symbol::ES, 5).await.len() <= 5);
    assert_eq!(orch.latest_snapshot(&[Symbol::NQ]).await.len(), 1);

    let spikes = orch.volume_anomalies(Symbol::ES, None, 10).await;
    assert_eq!(spikes.len(), 1);
    assert!((spikes[0].ratio - 5.0).abs() < 1e-9);

    let first: PipelineEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert!(matches!(first, PipelineEvent::MarketUpdate(_)));
}

#[tokio::test]
async fn volume_threshold_is_floored_at_the_profile_baseline() {
    let (orch, _) = orchestrator(healthy_feed(), config(vec![Symbol::ES, Symbol::NQ]));
    orch.run_once(CycleKind::Full).await;

    let low = orch.volume_anomalies(Symbol::ES, Some(0.2), 100).await;
    let floor = orch
        .volume_anomalies(Symbol::ES, Some(crate::analysis::VOLUME_PROFILE_BASELINE), 100)
        .await;

    assert!(!low.is_empty());
    assert_eq!(low, floor);
    assert!(low.iter().all(|a| a.ratio >= 1.0));
}

#[tokio::test]
async fn replaying_the_same_candles_is_idempotent() {
    let (orch, _) = orchestrator(healthy_feed(), config(vec![Symbol::ES, Symbol::NQ]));

    orch.run_once(CycleKind::Full).await;
    let first = orch.signals(&SignalFilter::default()).await;
    orch.run_once(CycleKind::Full).await;
    let second = orch.signals(&SignalFilter::default()).await;

    assert!(!first.is_empty());
    assert_eq!(first, second);
    assert_eq!(
        orch.fractals(Symbol::ES, 100).await,
        orch.fractals(Symbol::ES, 100).await
    );
}

#[tokio::test]
async fn feed_outage_serves_last_snapshot_as_unknown() {
    let failing = Arc::new(AtomicBool::new(false));
    let flag = failing.clone();
    let mut feed = MockFeedAdapter::new();
    feed.expect_name().return_const("mock");
    feed.expect_fetch_candles().returning(move |symbol, _, _| {
        if flag.load(Ordering::SeqCst) {
            Err(FeedError::Unavailable {
                symbol,
                reason: "connection refused".to_string(),
            })
        } else {
            Ok(candles(false))
        }
    });
    let mut cfg = config(vec![Symbol::ES]);
    cfg.snapshot_ttl = Duration::from_millis(20);
    let (orch, _) = orchestrator(feed, cfg);

    orch.run_once(CycleKind::Market).await;
    let live = orch.latest_snapshot(&[Symbol::ES]).await;
    assert_ne!(live[&Symbol::ES].market_state, MarketState::Unknown);

    failing.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stale = orch.latest_snapshot(&[Symbol::ES]).await;
    assert_eq!(stale[&Symbol::ES].market_state, MarketState::Unknown);
    assert_eq!(stale[&Symbol::ES].current_price, live[&Symbol::ES].current_price);
}

#[tokio::test]
async fn reads_without_any_history_are_empty() {
    let mut feed = MockFeedAdapter::new();
    feed.expect_name().return_const("mock");
    feed.expect_fetch_candles().returning(|symbol, _, _| {
        Err(FeedError::Unavailable {
            symbol,
            reason: "down".to_string(),
        })
    });
    let (orch, _) = orchestrator(feed, config(vec![Symbol::ES, Symbol::NQ]));

    assert!(orch.latest_snapshot(&[]).await.is_empty());
    assert!(orch.signals(&SignalFilter::default()).await.is_empty());
    assert!(orch.true_opens().await.is_empty());
    assert_eq!(orch.analysis_stats().await, AnalysisStats::default());
}

#[tokio::test]
async fn invalid_symbol_is_dropped_after_one_cycle() {
    let ym_calls = Arc::new(AtomicUsize::new(0));
    let counter = ym_calls.clone();
    let mut feed = MockFeedAdapter::new();
    feed.expect_name().return_const("mock");
    feed.expect_fetch_candles().returning(move |symbol, _, _| {
        if symbol == Symbol::YM {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FeedError::InvalidSymbol(symbol))
        } else {
            Ok(candles(true))
        }
    });
    let (orch, _) = orchestrator(feed, config(vec![Symbol::ES, Symbol::NQ, Symbol::YM]));

    let first = orch.run_once(CycleKind::Full).await;
    assert_eq!(first.symbols_failed, 1);
    assert_eq!(orch.active_symbols().await, vec![Symbol::ES, Symbol::NQ]);

    let second = orch.run_once(CycleKind::Full).await;
    assert_eq!(second.symbols_failed, 0);
    assert_eq!(ym_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicking_detector_is_isolated() {
    let settings = Arc::new(SharedSettings::new(AnalysisSettings::default()).unwrap());
    let ctx = AnalysisContext {
        feed: Arc::new(healthy_feed()),
        cache: Arc::new(ResultCache::new(Arc::new(MemoryStore::new()))),
        settings,
        killzones: KillzoneScheduler::default(),
        config: config(vec![Symbol::ES, Symbol::NQ]),
    };
    let orch = AnalysisOrchestrator::with_detectors(
        ctx,
        vec![Arc::new(PanickingDetector), Arc::new(VolumeDetector)],
    );

    let stats = orch.run_once(CycleKind::Full).await;

    assert_eq!(stats.detector_failures, 1);
    assert!(!orch.signals(&SignalFilter::default()).await.is_empty());
}

#[tokio::test]
async fn settings_update_applies_to_next_cycle() {
    let (orch, settings) = orchestrator(healthy_feed(), config(vec![Symbol::ES, Symbol::NQ]));

    orch.run_once(CycleKind::Full).await;
    assert!(orch.signals(&SignalFilter::default()).await.len() > 1);

    settings
        .apply(&SettingsUpdate {
            max_signals_display: Some(1),
            ..Default::default()
        })
        .unwrap();
    orch.run_once(CycleKind::Full).await;

    assert_eq!(orch.signals(&SignalFilter::default()).await.len(), 1);
}

#[tokio::test]
async fn tick_is_skipped_while_a_cycle_is_in_flight() {
    let mut feed = MockFeedAdapter::new();
    feed.expect_name().return_const("mock");
    feed.expect_fetch_candles().times(0);
    let (orch, _) = orchestrator(feed, config(vec![Symbol::ES]));
    let (_tx, mut rx) = watch::channel(false);

    let _in_flight = orch.state.lock().await;
    orch.tick(CycleKind::Full, &mut rx).await;

    assert!(orch.last_cycle().is_none());
}

#[tokio::test]
async fn shutdown_abandons_cycle_before_publish() {
    let (orch, _) = orchestrator(SlowFeed, config(vec![Symbol::ES]));
    let (tx, mut rx) = watch::channel(false);
    tx.send(true).unwrap();

    orch.tick(CycleKind::Full, &mut rx).await;

    assert!(orch.last_cycle().is_none());
    assert!(orch
        .ctx
        .cache
        .last_good::<Vec<Signal>>(keys::SIGNALS)
        .is_none());
}

#[tokio::test]
async fn run_loop_stops_on_shutdown() {
    let (orch, _) = orchestrator(healthy_feed(), config(vec![Symbol::ES, Symbol::NQ]));
    let orch = Arc::new(orch);
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(orch.clone().run(rx));
    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(orch.last_cycle().is_some());
}

#[test]
fn merge_filters_sorts_and_caps() {
    let at = |m| Utc.with_ymd_and_hms(2024, 3, 4, 14, m, 0).unwrap();
    let signal = |signal_type, strength, m| Signal {
        id: Signal::make_id(signal_type, Symbol::ES, at(m)),
        signal_type,
        symbol: Symbol::ES,
        strength,
        divergence_percentage: 0.0,
        primary_price: 1.0,
        secondary_price: 1.0,
        confirmation_status: false,
        timestamp: at(m),
        payload: SignalPayload::FalseBreak {
            level: 1.0,
            sweep_extreme: 1.0,
            close: 1.0,
            excursion_pct: 0.0,
        },
        details: BTreeMap::new(),
    };
    let settings = AnalysisSettings {
        max_signals_display: 2,
        ..Default::default()
    };

    let merged = merge_signals(
        vec![
            signal(SignalType::VolumeSpike, 0.9, 1),
            signal(SignalType::FalseBreakUp, 0.3, 5),
            signal(SignalType::FalseBreakDown, 0.6, 3),
            signal(SignalType::FalseBreakDown, 0.6, 3),
            signal(SignalType::JudasSwingBullish, 0.8, 3),
        ],
        &settings,
    );

    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].signal_type, SignalType::JudasSwingBullish);
    assert_eq!(merged[1].signal_type, SignalType::FalseBreakDown);
}
