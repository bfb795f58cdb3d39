// =============================================================================
// Vela — trading-strategy execution engine
// =============================================================================
//
// The core scheduler, signal state machine and persistence layer a
// backtesting / live-trading framework is built around:
//
//   - per-(symbol, strategy) signal life-cycle with validation, scheduled
//     entries, TP/SL/time monitoring and partial profit/loss milestones;
//   - a backtest orchestrator with a bulk-candle fast-path and frame
//     skipping, deterministic across runs;
//   - a live orchestrator with crash-safe signal persistence and graceful
//     shutdown;
//   - a walker that evaluates candidate strategies sequentially and ranks
//     them by a chosen metric;
//   - portfolio-level risk gating shared across strategies;
//   - ambient method/execution contexts propagated through task-local
//     scopes, and a topic-filtered event bus.
//
// Exchange access, indicators, reporting and transport surfaces stay
// outside; they plug in through the schema traits.
// =============================================================================

pub mod backtest;
pub mod bus;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod exchange;
pub mod frame;
pub mod live;
pub mod persist;
pub mod risk;
pub mod schema;
pub mod signal;
pub mod stats;
pub mod types;
pub mod walker;

mod engine;

#[cfg(test)]
pub(crate) mod testkit;

pub use bus::{
    BacktestProgress, EngineEvent, ErrorEvent, EventBus, PartialEvent, RiskEvent, RunIdentity,
    SignalEvent, Topic, WalkerCompleteEvent, WalkerProgress,
};
pub use config::EngineConfig;
pub use context::{ExecutionContext, MethodContext};
pub use core::{FastPathOutcome, StrategyCore};
pub use engine::{Engine, RunHandle, SignalStream, WalkerHandle, WalkerStream};
pub use error::{ConfigError, DataError, EngineError, EngineResult, PersistenceError, ValidationError};
pub use exchange::ExchangeCore;
pub use persist::{FilePersistence, PersistenceAdapter, SignalKind};
pub use risk::{ActivePosition, RiskCheckPayload, RiskGate};
pub use schema::{
    ExchangeAdapter, ExchangeOverride, ExchangeSchema, FnRiskValidator, FnSignalSource,
    FrameOverride, FrameSchema, NoRiskCallbacks, NoStrategyCallbacks, OrderBookSnapshot,
    RiskCallbacks, RiskOverride, RiskSchema, RiskValidator, SignalSource, StrategyCallbacks,
    StrategyOverride, StrategySchema, WalkerOverride, WalkerSchema,
};
pub use signal::{CancelledSignal, ClosedSignal, Signal, SignalDto, TickResult};
pub use stats::{BacktestStats, StatsAccumulator, WalkerMetric};
pub use types::{CancelReason, CandleData, CloseReason, Interval, Side};

/// Initialise a `tracing` subscriber driven by `RUST_LOG`, defaulting to
/// `info`. Intended for binaries and integration tests embedding the engine;
/// calling it more than once is harmless.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
