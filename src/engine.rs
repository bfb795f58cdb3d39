// =============================================================================
// Engine — registration surface, instance wiring and run entry points
// =============================================================================
//
// The engine ties the subsystems together: schema registry and validation,
// the shared candle cache, one ExchangeCore per exchange, one StrategyCore
// per (symbol, strategy), one RiskGate per risk profile, the event bus and
// the persistence adapter. Cloning an Engine clones a handle to the same
// state.
//
// Execution surfaces come in two shapes per mode: `run` returns a lazy
// stream driven by consumer demand (a capacity-1 channel suspends the
// producer between events), `background` detaches the run and returns a
// cancellation handle. Fatal background failures are published on `exit`.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::backtest::BacktestRun;
use crate::bus::{EngineEvent, ErrorEvent, EventBus, RunIdentity, SignalEvent, Topic, WalkerProgress};
use crate::config::EngineConfig;
use crate::context::MethodContext;
use crate::core::StrategyCore;
use crate::error::{ConfigError, EngineResult};
use crate::exchange::cache::CandleCache;
use crate::exchange::ExchangeCore;
use crate::frame;
use crate::live::LiveRun;
use crate::persist::{FilePersistence, PersistenceAdapter};
use crate::risk::RiskGate;
use crate::schema::connection::InstanceCache;
use crate::schema::registry::{SchemaKind, SchemaRegistry};
use crate::schema::validation::ValidationService;
use crate::schema::{
    ExchangeOverride, ExchangeSchema, FrameOverride, FrameSchema, RiskOverride, RiskSchema,
    StrategyOverride, StrategySchema, WalkerOverride, WalkerSchema,
};
use crate::walker::WalkerRun;

/// Lazy stream of opened/closed/cancelled events from one run.
pub type SignalStream = ReceiverStream<SignalEvent>;

/// Lazy stream of per-strategy walker progress.
pub type WalkerStream = ReceiverStream<WalkerProgress>;

struct EngineInner {
    config: Arc<EngineConfig>,
    registry: Arc<SchemaRegistry>,
    validation: ValidationService,
    bus: EventBus,
    persistence: Arc<dyn PersistenceAdapter>,
    candle_cache: Arc<CandleCache>,
    exchanges: InstanceCache<ExchangeCore>,
    cores: InstanceCache<StrategyCore>,
    gates: RwLock<HashMap<String, Arc<RiskGate>>>,
}

pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Engine {
    /// Engine with the default file-backed persistence adapter rooted at
    /// `config.persist_root`.
    pub fn new(config: EngineConfig) -> Self {
        let persistence = Arc::new(FilePersistence::new(config.persist_root.clone()));
        Self::with_persistence(config, persistence)
    }

    /// Engine with a custom persistence adapter.
    pub fn with_persistence(config: EngineConfig, persistence: Arc<dyn PersistenceAdapter>) -> Self {
        let registry = Arc::new(SchemaRegistry::new());
        Self {
            inner: Arc::new(EngineInner {
                config: Arc::new(config),
                validation: ValidationService::new(Arc::clone(&registry)),
                registry,
                bus: EventBus::new(),
                persistence,
                candle_cache: Arc::new(CandleCache::new()),
                exchanges: InstanceCache::new(),
                cores: InstanceCache::new(),
                gates: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Subscribe to a set of event topics.
    pub fn subscribe(&self, topics: &[Topic]) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.inner.bus.subscribe(topics)
    }

    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.inner.bus.subscribe_all()
    }

    // ── Schema registration ─────────────────────────────────────────────

    pub fn add_exchange(&self, schema: ExchangeSchema) -> Result<(), ConfigError> {
        self.inner.registry.add_exchange(schema)
    }

    pub fn add_frame(&self, schema: FrameSchema) -> Result<(), ConfigError> {
        self.inner.registry.add_frame(schema)
    }

    pub fn add_strategy(&self, schema: StrategySchema) -> Result<(), ConfigError> {
        self.inner.registry.add_strategy(schema)
    }

    /// Register a risk profile and create its process-wide gate.
    pub fn add_risk(&self, schema: RiskSchema) -> Result<(), ConfigError> {
        let name = schema.name.clone();
        self.inner.registry.add_risk(schema)?;
        self.inner.gates.write().insert(
            name.clone(),
            Arc::new(RiskGate::new(
                name,
                Arc::clone(&self.inner.registry),
                self.inner.bus.clone(),
            )),
        );
        Ok(())
    }

    pub fn add_walker(&self, schema: WalkerSchema) -> Result<(), ConfigError> {
        self.inner.registry.add_walker(schema)
    }

    // ── Partial overrides ───────────────────────────────────────────────

    pub fn override_exchange(&self, name: &str, patch: ExchangeOverride) -> Result<(), ConfigError> {
        self.inner.registry.override_exchange(name, patch)
    }

    pub fn override_frame(&self, name: &str, patch: FrameOverride) -> Result<(), ConfigError> {
        self.inner.registry.override_frame(name, patch)
    }

    pub fn override_strategy(&self, name: &str, patch: StrategyOverride) -> Result<(), ConfigError> {
        self.inner.registry.override_strategy(name, patch)
    }

    pub fn override_risk(&self, name: &str, patch: RiskOverride) -> Result<(), ConfigError> {
        self.inner.registry.override_risk(name, patch)
    }

    pub fn override_walker(&self, name: &str, patch: WalkerOverride) -> Result<(), ConfigError> {
        self.inner.registry.override_walker(name, patch)
    }

    // ── Instance wiring ─────────────────────────────────────────────────

    /// The memoized ExchangeCore for a registered exchange.
    pub fn exchange(&self, name: &str) -> EngineResult<Arc<ExchangeCore>> {
        self.inner.validation.validate(SchemaKind::Exchange, name)?;
        let schema = self.inner.registry.exchange(name)?;
        Ok(self.inner.exchanges.get_or_create(name, || {
            ExchangeCore::new(
                schema,
                Arc::clone(&self.inner.candle_cache),
                Arc::clone(&self.inner.config),
            )
        }))
    }

    /// The memoized StrategyCore for `{symbol}:{strategy}`. Repeated calls
    /// observe the same state object.
    fn core_for(&self, symbol: &str, ctx: &MethodContext) -> EngineResult<Arc<StrategyCore>> {
        self.inner
            .validation
            .validate(SchemaKind::Strategy, &ctx.strategy_name)?;
        let strategy = self.inner.registry.strategy(&ctx.strategy_name)?;
        let exchange = self.exchange(&ctx.exchange_name)?;

        let mut gates = Vec::new();
        for risk_name in strategy.risk_names() {
            self.inner.validation.validate(SchemaKind::Risk, &risk_name)?;
            let gate = self
                .inner
                .gates
                .read()
                .get(&risk_name)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownName {
                    kind: "risk",
                    name: risk_name.clone(),
                })?;
            gates.push(gate);
        }

        let key = format!("{symbol}:{}", ctx.strategy_name);
        Ok(self.inner.cores.get_or_create(&key, || {
            StrategyCore::new(
                symbol,
                strategy,
                exchange,
                gates,
                Arc::clone(&self.inner.persistence),
                Arc::clone(&self.inner.config),
                self.inner.bus.clone(),
            )
        }))
    }

    // ── Backtest ────────────────────────────────────────────────────────

    fn backtest_run(&self, symbol: &str, ctx: &MethodContext) -> EngineResult<BacktestRun> {
        let frame_name = ctx.frame_name.as_deref().ok_or(ConfigError::InvalidField {
            kind: "frame",
            name: String::new(),
            field: "frame_name",
            reason: "required for backtests".into(),
        })?;
        self.inner.validation.validate(SchemaKind::Frame, frame_name)?;
        let frame_schema = self.inner.registry.frame(frame_name)?;
        let frames = frame::generate(&frame_schema)?;

        let core = self.core_for(symbol, ctx)?;
        let exchange = self.exchange(&ctx.exchange_name)?;

        Ok(BacktestRun {
            core,
            exchange,
            frames,
            frame_interval_ms: frame_schema.interval.ms(),
            config: Arc::clone(&self.inner.config),
            bus: self.inner.bus.clone(),
        })
    }

    /// Run a backtest, returning the finite lazy event stream. The producer
    /// only advances as the stream is consumed.
    pub fn backtest(&self, symbol: &str, ctx: MethodContext) -> EngineResult<SignalStream> {
        let run = self.backtest_run(symbol, &ctx)?;
        // Clear any stop left over from a previous run before the task
        // starts, so a cancel issued right after this call is never erased.
        run.core.clear_stop();
        let identity = run.core.identity(true);
        let (tx, rx) = mpsc::channel(1);
        spawn_watched(self.inner.bus.clone(), identity, run.run(Some(tx)));
        Ok(ReceiverStream::new(rx))
    }

    /// Run a backtest detached; events are only observable on the bus.
    pub fn backtest_background(&self, symbol: &str, ctx: MethodContext) -> EngineResult<RunHandle> {
        let run = self.backtest_run(symbol, &ctx)?;
        run.core.clear_stop();
        let core = Arc::clone(&run.core);
        let identity = core.identity(true);
        let join = spawn_watched(self.inner.bus.clone(), identity, run.run(None));
        Ok(RunHandle { core, join })
    }

    // ── Live ────────────────────────────────────────────────────────────

    fn live_run(&self, symbol: &str, ctx: &MethodContext) -> EngineResult<LiveRun> {
        let core = self.core_for(symbol, ctx)?;
        Ok(LiveRun {
            core,
            persistence: Arc::clone(&self.inner.persistence),
            config: Arc::clone(&self.inner.config),
            bus: self.inner.bus.clone(),
        })
    }

    /// Run live trading, returning the infinite lazy event stream.
    pub fn live(&self, symbol: &str, ctx: MethodContext) -> EngineResult<SignalStream> {
        let run = self.live_run(symbol, &ctx)?;
        run.core.clear_stop();
        let identity = run.core.identity(false);
        let (tx, rx) = mpsc::channel(1);
        spawn_watched(self.inner.bus.clone(), identity, run.run(Some(tx)));
        Ok(ReceiverStream::new(rx))
    }

    /// Run live trading detached; returns the cancellation handle.
    pub fn live_background(&self, symbol: &str, ctx: MethodContext) -> EngineResult<RunHandle> {
        let run = self.live_run(symbol, &ctx)?;
        run.core.clear_stop();
        let core = Arc::clone(&run.core);
        let identity = core.identity(false);
        let join = spawn_watched(self.inner.bus.clone(), identity, run.run(None));
        Ok(RunHandle { core, join })
    }

    /// Request a graceful stop of a live run. Returns once the flag is set;
    /// the loop exits when the in-flight signal reaches a terminal state.
    /// Idempotent, and a no-op when no such instance exists.
    pub fn live_stop(&self, symbol: &str, strategy_name: &str) -> EngineResult<()> {
        if let Some(core) = self.inner.cores.get(&format!("{symbol}:{strategy_name}")) {
            core.stop();
        }
        Ok(())
    }

    // ── Walker ──────────────────────────────────────────────────────────

    fn walker_run(&self, symbol: &str, walker_name: &str) -> EngineResult<(WalkerRun, Arc<AtomicBool>)> {
        self.inner.validation.validate(SchemaKind::Walker, walker_name)?;
        let walker = self.inner.registry.walker(walker_name)?;
        self.inner
            .validation
            .validate(SchemaKind::Exchange, &walker.exchange_name)?;
        self.inner
            .validation
            .validate(SchemaKind::Frame, &walker.frame_name)?;

        let stopped = Arc::new(AtomicBool::new(false));
        let run = WalkerRun {
            engine: self.clone(),
            walker,
            symbol: symbol.to_string(),
            stopped: Arc::clone(&stopped),
            bus: self.inner.bus.clone(),
        };
        Ok((run, stopped))
    }

    /// Run a walker, returning the lazy per-strategy progress stream.
    pub fn walker(&self, symbol: &str, walker_name: &str) -> EngineResult<WalkerStream> {
        let (run, _stopped) = self.walker_run(symbol, walker_name)?;
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(run.run(Some(tx)));
        Ok(ReceiverStream::new(rx))
    }

    /// Run a walker detached; returns the cancellation handle.
    pub fn walker_background(&self, symbol: &str, walker_name: &str) -> EngineResult<WalkerHandle> {
        let (run, stopped) = self.walker_run(symbol, walker_name)?;
        let join = tokio::spawn(run.run(None));
        Ok(WalkerHandle { stopped, join })
    }
}

/// Publish a `exit` event if a detached run dies instead of finishing.
fn spawn_watched(
    bus: EventBus,
    identity: RunIdentity,
    fut: impl std::future::Future<Output = ()> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let inner = tokio::spawn(fut);
        if let Err(e) = inner.await {
            bus.publish(EngineEvent::Exit(ErrorEvent {
                identity: Some(identity),
                message: format!("background run crashed: {e}"),
                when: chrono::Utc::now().timestamp_millis(),
            }));
        }
    })
}

/// Cancellation handle for a detached backtest or live run.
pub struct RunHandle {
    core: Arc<StrategyCore>,
    join: JoinHandle<()>,
}

impl RunHandle {
    /// Request a graceful stop. In-flight ticks complete; live runs keep
    /// monitoring an open signal to its terminal state.
    pub fn cancel(&self) {
        self.core.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to wind down.
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// Cancellation handle for a detached walker run.
pub struct WalkerHandle {
    stopped: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl WalkerHandle {
    /// Stop after the strategy currently under test finishes.
    pub fn cancel(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        info!("walker cancellation requested");
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

// =============================================================================
// Tests
// =============================================================================
