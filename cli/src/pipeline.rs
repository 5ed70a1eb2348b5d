//! Pipeline assembly and lifecycle
//!
//! Every hot stage runs on its own named thread with its own stop flag;
//! shutdown walks the stages in pipeline order so each drains its input
//! before the next one stops.

use crate::sim::{SimBroker, SimFeed};
use adapter::{BrokerClient, DeadLetterQueue, OrderAdapter};
use bus::{Ring, StageSender};
use common::events::{ExecEvent, MarketEvent, OrderIntent, RecordEvent, StormFlag, Topic};
use common::{AccountId, CoreConfig, RecorderMode, StrategyId, SymbolDirectory, Timebase};
use execution::{ExecutionRouter, OrderDirectory, PositionStore, RawExecEnvelope};
use feeds::{MarketDataStage, Normalizer, RawEnvelope, RawKind};
use gateway::{ExposureStore, Gateway, RiskEngine, StormGuard};
use lob::{BookViews, LobEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use storage::{ColumnStore, DiskPressureMonitor, Loader, MemStore, Recorder, Wal};
use strategy::{ImbalanceMomentum, StrategyRunner};
use tracing::{info, warn};

/// How the pipeline is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Synthetic feed and broker
    Sim,
    /// Broker SDK callbacks (connector external to this build)
    Live,
    /// Re-drive recorded WAL market data
    Replay,
}

struct Stage {
    name: &'static str,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

fn stage_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

fn spawn_stage(
    stages: &mut Vec<Stage>,
    name: &'static str,
    stop: Arc<AtomicBool>,
    body: impl FnOnce() + Send + 'static,
) {
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .expect("spawn stage thread");
    stages.push(Stage { name, stop, handle });
}

/// A fully wired pipeline
pub struct Pipeline {
    stages: Vec<Stage>,
    raw_tx: StageSender<RawEnvelope>,
    feed_stop: Arc<AtomicBool>,
    dlq: Arc<DeadLetterQueue>,
    store: Arc<MemStore>,
    drain_ms: u64,
}

impl Pipeline {
    /// Build and start every stage
    pub fn start(config: &CoreConfig, mode: RunMode) -> anyhow::Result<Self> {
        // Anchor the process timebase before any stage stamps an event
        let _ = Timebase::global();

        let symbols = Arc::new(load_universe(config)?);

        // Bounded hand-offs
        let (raw_tx, raw_rx) = bus::bounded::<RawEnvelope>("raw", config.queues.raw);
        let (raw_exec_tx, raw_exec_rx) =
            bus::bounded::<RawExecEnvelope>("raw_exec", config.queues.raw_exec);
        let (intent_tx, intent_rx) = bus::bounded::<OrderIntent>("intent", config.queues.intent);
        let (order_tx, order_rx) = bus::bounded("order", config.queues.order);
        let (recorder_tx, recorder_rx) =
            bus::bounded::<RecordEvent>("recorder", config.queues.recorder);
        let (exec_event_tx, exec_event_rx) =
            bus::bounded::<ExecEvent>("exec_events", config.queues.raw_exec);

        let ring = Ring::<MarketEvent>::with_capacity(config.queues.bus);
        let runner_consumer = ring.subscribe();

        // Shared state
        let views = BookViews::new();
        let positions = Arc::new(PositionStore::new());
        let order_directory = Arc::new(OrderDirectory::new());
        let exposure = Arc::new(ExposureStore::new(config.exposure.clone()));
        let storm_flag = Arc::new(StormFlag::default());
        let dlq = Arc::new(DeadLetterQueue::new(config.adapter.dlq_capacity));
        let store = Arc::new(MemStore::new());
        let feed_pulse = Arc::new(AtomicI64::new(0));
        let adapter_pressure = Arc::new(AtomicBool::new(false));
        let kill_switch = Arc::new(AtomicBool::new(false));

        let mut stages = Vec::new();

        // Market-data stage
        let feed_stop = stage_flag();
        {
            let stage = MarketDataStage::new(
                raw_rx,
                Normalizer::new(Arc::clone(&symbols)),
                LobEngine::new(views.clone()),
                ring,
                recorder_tx.clone(),
                Arc::clone(&feed_stop),
                Arc::clone(&feed_pulse),
            );
            spawn_stage(&mut stages, "feed", Arc::clone(&feed_stop), move || {
                stage.run();
            });
        }

        // Strategy runner
        {
            let stop = stage_flag();
            let mut runner = StrategyRunner::new(
                runner_consumer,
                exec_event_rx,
                intent_tx,
                views.clone(),
                Arc::clone(&positions),
                Arc::clone(&symbols),
                Arc::clone(&storm_flag),
                config.runner.clone(),
                Arc::clone(&stop),
            );
            runner.register(Box::new(ImbalanceMomentum::new(StrategyId::new(1), 1, 2, 2)));
            spawn_stage(&mut stages, "runner", stop, move || runner.run());
        }

        // Gateway, or the audit-only sink when dispatch is disabled
        if config.gateway.enabled {
            let stop = stage_flag();
            let risk = RiskEngine::new(
                config.risk.clone(),
                views.clone(),
                Arc::clone(&positions),
                Arc::clone(&symbols),
            );
            let guard = StormGuard::new(
                config.risk.clone(),
                Arc::clone(&storm_flag),
                Timebase::global().now(),
            );
            let service = Gateway::new(
                intent_rx,
                order_tx,
                recorder_tx.clone(),
                Arc::clone(&exposure),
                risk,
                guard,
                Arc::clone(&positions),
                config.gateway.clone(),
                AccountId::new(1),
                Arc::clone(&feed_pulse),
                Arc::clone(&adapter_pressure),
                Arc::clone(&kill_switch),
                Arc::clone(&stop),
            );
            spawn_stage(&mut stages, "gateway", stop, move || service.run());
        } else {
            warn!("gateway disabled, intents drain to the audit sink");
            let stop = stage_flag();
            let sink_stop = Arc::clone(&stop);
            spawn_stage(&mut stages, "audit-sink", stop, move || {
                loop {
                    match intent_rx.recv_timeout(Duration::from_millis(1)) {
                        Some(intent) => {
                            info!(
                                intent_id = intent.intent_id,
                                trace_id = intent.trace_id,
                                "audit-only intent"
                            );
                        }
                        None => {
                            if sink_stop.load(Ordering::Acquire) {
                                break;
                            }
                        }
                    }
                }
            });
        }

        // Order adapter
        {
            let stop = stage_flag();
            let broker: Box<dyn BrokerClient> = match mode {
                RunMode::Sim | RunMode::Replay => Box::new(SimBroker::new(raw_exec_tx.clone())),
                RunMode::Live => {
                    warn!("live connector not linked in this build, using the sim broker");
                    Box::new(SimBroker::new(raw_exec_tx.clone()))
                }
            };
            let adapter = OrderAdapter::new(
                order_rx,
                broker,
                Arc::clone(&order_directory),
                &config.adapter,
                Arc::clone(&dlq),
                Arc::clone(&adapter_pressure),
                Arc::clone(&stop),
            );
            spawn_stage(&mut stages, "adapter", stop, move || adapter.run());
        }

        // Execution router
        {
            let stop = stage_flag();
            let router = ExecutionRouter::new(
                raw_exec_rx,
                Arc::clone(&order_directory),
                Arc::clone(&symbols),
                Arc::clone(&positions),
                exec_event_tx,
                recorder_tx.clone(),
                Arc::clone(&stop),
            );
            spawn_stage(&mut stages, "router", stop, move || router.run());
        }

        // Recorder + disk monitor + loader
        let monitor = DiskPressureMonitor::new(
            config.recorder.wal_dir.clone(),
            config.recorder.disk_warn_bytes,
            config.recorder.disk_critical_bytes,
            config.recorder.disk_halt_bytes,
        );
        let disk_handle = monitor.handle();
        {
            let stop = stage_flag();
            let recorder = Recorder::new(
                recorder_rx,
                config.recorder.clone(),
                Arc::clone(&store) as Arc<dyn ColumnStore>,
                disk_handle,
                Arc::clone(&kill_switch),
                Arc::clone(&stop),
            )?;
            spawn_stage(&mut stages, "recorder", stop, move || recorder.run());
        }
        {
            let stop = stage_flag();
            let monitor_stop = Arc::clone(&stop);
            let poll = Duration::from_millis(config.recorder.disk_poll_ms);
            let housekeeping_symbols = Arc::clone(&symbols);
            spawn_stage(&mut stages, "disk-monitor", stop, move || {
                while !monitor_stop.load(Ordering::Acquire) {
                    monitor.poll();
                    housekeeping_symbols.maybe_reload();
                    std::thread::sleep(poll);
                }
            });
        }
        if config.recorder.mode == RecorderMode::WalFirst {
            let stop = stage_flag();
            let loader = Loader::new(
                config.recorder.wal_dir.clone(),
                Arc::clone(&store) as Arc<dyn ColumnStore>,
                Duration::from_millis(config.recorder.disk_poll_ms),
                Arc::clone(&stop),
            );
            spawn_stage(&mut stages, "loader", stop, move || loader.run());
        }

        info!(mode = ?mode, stages = stages.len(), "pipeline started");
        Ok(Self {
            stages,
            raw_tx,
            feed_stop,
            dlq,
            store,
            drain_ms: config.shutdown_drain_ms,
        })
    }

    /// Sender broker market-data callbacks push into
    #[must_use]
    pub fn raw_sender(&self) -> StageSender<RawEnvelope> {
        self.raw_tx.clone()
    }

    /// The in-memory store backing sim/replay runs
    #[must_use]
    pub fn store(&self) -> Arc<MemStore> {
        Arc::clone(&self.store)
    }

    /// Feed-stage stop flag, shared with the sim generator
    #[must_use]
    pub fn feed_stop(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.feed_stop)
    }

    /// Stop stages in pipeline order, draining each before the next
    ///
    /// Each stage gets `shutdown_drain_ms` to drain its input and exit; a
    /// stage that blows the window is abandoned so one hung thread cannot
    /// wedge the whole shutdown.
    pub fn shutdown(self) {
        info!("pipeline shutting down");
        let window = Duration::from_millis(self.drain_ms);
        for stage in self.stages {
            stage.stop.store(true, Ordering::Release);
            let name = stage.name;

            // JoinHandle has no timed join; park a waiter on it and race
            // the drain window through a channel
            let (done_tx, done_rx) = mpsc::channel();
            let waiter = std::thread::spawn(move || {
                let panicked = stage.handle.join().is_err();
                let _ = done_tx.send(panicked);
            });
            match done_rx.recv_timeout(window) {
                Ok(panicked) => {
                    if panicked {
                        warn!(stage = name, "stage thread panicked");
                    }
                    let _ = waiter.join();
                }
                Err(_) => {
                    // The waiter stays parked on the hung join and dies with
                    // the process
                    warn!(
                        stage = name,
                        drain_ms = self.drain_ms,
                        "stage did not drain within the shutdown window, abandoned"
                    );
                }
            }
        }

        // Operator surface: persist the DLQ for `velostream dlq list`
        let dlq_entries = self.dlq.list();
        if let Err(e) = persist_dlq(&dlq_path(), &dlq_entries) {
            warn!(error = %e, "could not persist DLQ");
        }
        info!(dlq = dlq_entries.len(), "pipeline stopped");
    }
}

fn load_universe(config: &CoreConfig) -> anyhow::Result<SymbolDirectory> {
    Ok(match &config.symbols_path {
        Some(path) => SymbolDirectory::load(path)?,
        None => default_universe(),
    })
}

/// Default symbol universe for sim runs
fn default_universe() -> SymbolDirectory {
    let directory = SymbolDirectory::empty();
    directory.register("SIM0", "SIMX", 4, 2000);
    directory.register("SIM1", "SIMX", 4, 2000);
    directory.register("SIM2", "SIMX", 4, 1000);
    directory.register("SIM3", "SIMX", 4, 500);
    directory
}

/// Where the DLQ dump lands
#[must_use]
pub fn dlq_path() -> PathBuf {
    PathBuf::from("state/dlq.json")
}

fn persist_dlq(path: &Path, entries: &[adapter::DeadLetter]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(entries)?)?;
    Ok(())
}

/// Drive a sim session for `duration`
pub fn run_sim(config: &CoreConfig, duration: Duration, seed: u64) -> anyhow::Result<()> {
    let symbols = Arc::new(load_universe(config)?);
    let pipeline = Pipeline::start(config, RunMode::Sim)?;

    let feed = SimFeed::new(pipeline.raw_sender(), symbols, seed);
    let stop = pipeline.feed_stop();
    feed.run(duration, &stop);

    // Let the tail of the pipeline settle before the ordered shutdown
    std::thread::sleep(Duration::from_millis(200));
    let store = pipeline.store();
    pipeline.shutdown();

    info!(
        market_data = store.table_len(Topic::MarketData),
        orders = store.table_len(Topic::Orders),
        trades = store.table_len(Topic::Trades),
        "sim complete"
    );
    Ok(())
}

/// Drive the pipeline from broker callbacks until Ctrl-C
pub async fn run_live(config: &CoreConfig) -> anyhow::Result<()> {
    let pipeline = Pipeline::start(config, RunMode::Live)?;
    info!("live pipeline running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    pipeline.shutdown();
    Ok(())
}

/// Re-drive recorded market data through the pipeline
pub fn run_replay(config: &CoreConfig) -> anyhow::Result<()> {
    let wal_dir = config.recorder.wal_dir.clone();
    let rows = Wal::stream(&wal_dir)?;
    let market_rows: Vec<_> = rows
        .into_iter()
        .filter_map(|row| match row {
            RecordEvent::MarketData(row) => Some(row),
            _ => None,
        })
        .collect();
    if market_rows.is_empty() {
        anyhow::bail!("no market_data rows in {}", wal_dir.display());
    }
    info!(rows = market_rows.len(), "replaying recorded market data");

    let symbols = Arc::new(load_universe(config)?);
    // Replay must not re-capture into the WAL directory it reads from
    let mut replay_config = config.clone();
    replay_config.recorder.wal_dir = std::env::temp_dir().join("velostream-replay-wal");
    let pipeline = Pipeline::start(&replay_config, RunMode::Replay)?;
    let raw_tx = pipeline.raw_sender();

    for row in &market_rows {
        let Some(meta) = symbols.meta(row.symbol) else {
            continue;
        };
        let kind = match row.kind {
            common::events::MarketDataKind::Tick => RawKind::Tick,
            common::events::MarketDataKind::Snapshot => RawKind::Snapshot,
            common::events::MarketDataKind::BidAsk => RawKind::BidAsk,
            common::events::MarketDataKind::Stats => continue,
        };
        let body = match kind {
            RawKind::Tick => serde_json::json!({
                "symbol": meta.code,
                "lastPrice": meta.codec.unscale(common::Px::from_scaled(row.price)),
                "vol": row.volume,
                "exchTs": row.exch_ts.as_nanos(),
            }),
            _ => {
                let level = |px: &i64, vol: &i64| {
                    serde_json::json!({
                        "p": meta.codec.unscale(common::Px::from_scaled(*px)),
                        "v": vol,
                    })
                };
                serde_json::json!({
                    "symbol": meta.code,
                    "bids": row.bids_price.iter().zip(&row.bids_vol).map(|(p, v)| level(p, v)).collect::<Vec<_>>(),
                    "asks": row.asks_price.iter().zip(&row.asks_vol).map(|(p, v)| level(p, v)).collect::<Vec<_>>(),
                    "exchTs": row.exch_ts.as_nanos(),
                })
            }
        };
        let envelope = RawEnvelope::capture(kind, body.to_string().into_bytes());
        while raw_tx.try_send(envelope.clone()).is_err() {
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    std::thread::sleep(Duration::from_millis(200));
    pipeline.shutdown();
    Ok(())
}
