// =============================================================================
// StrategyCore — the per-(symbol, strategy) signal state machine
// =============================================================================
//
// Life-cycle:
//   flat      -> scheduled  (entry price supplied, away from VWAP)
//   flat      -> pending    (immediate entry at VWAP)
//   scheduled -> pending    (VWAP crossed the entry price)
//   scheduled -> cancelled  (activation timeout, or SL crossed first)
//   pending   -> closed     (TP / SL / time barrier)
//
// Priority rules:
//   - A scheduled signal whose stop-loss is violated on the same evaluation
//     as its entry price cancels; it never opens. The market already crossed
//     the trade thesis, and opening would produce a phantom round-trip.
//   - Live monitoring checks TP before SL (one VWAP value cannot satisfy
//     both) and TP before the time barrier.
//   - The backtest fast-path assumes the worst case inside a candle: SL
//     before TP, TP before time.
//
// Each instance's state is owned by its running task; the state mutex only
// arbitrates between a run loop and out-of-band calls such as restore.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{EngineEvent, ErrorEvent, EventBus, PartialEvent, RunIdentity};
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::{DataError, EngineResult};
use crate::exchange::{vwap, ExchangeCore};
use crate::persist::{PersistenceAdapter, SignalKind};
use crate::risk::{RiskCheckPayload, RiskGate};
use crate::schema::StrategySchema;
use crate::signal::{
    net_pnl_percent, validate_signal, CancelledSignal, ClosedSignal, Signal, TickResult,
};
use crate::types::{CancelReason, CandleData, CloseReason, Side};

/// Partial profit/loss events fire at multiples of this percentage.
const PARTIAL_LEVEL_STEP_PERCENT: i64 = 10;

#[derive(Default)]
struct CoreState {
    pending: Option<Signal>,
    scheduled: Option<Signal>,
    last_signal_at: Option<i64>,
    /// Signed 10 %-levels already announced for the current pending signal.
    partial_levels: HashSet<i64>,
}

/// Result of one backtest fast-path pass over a candle vector.
#[derive(Debug, Clone)]
pub struct FastPathOutcome {
    /// The terminal outcome of the in-flight signal.
    pub result: TickResult,
    /// Activation that happened inside the pass (scheduled signal promoted),
    /// with its timestamp.
    pub opened: Option<(Signal, i64)>,
    /// Candles consumed from the start of the vector.
    pub candles_consumed: usize,
}

pub struct StrategyCore {
    symbol: String,
    strategy: Arc<StrategySchema>,
    exchange: Arc<ExchangeCore>,
    gates: Vec<Arc<RiskGate>>,
    persistence: Arc<dyn PersistenceAdapter>,
    config: Arc<EngineConfig>,
    bus: EventBus,
    stopped: AtomicBool,
    state: Mutex<CoreState>,
    /// Serializes whole runs: a second backtest or live run for the same
    /// (symbol, strategy) queues behind the first.
    run_lock: Mutex<()>,
}

impl StrategyCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        strategy: Arc<StrategySchema>,
        exchange: Arc<ExchangeCore>,
        gates: Vec<Arc<RiskGate>>,
        persistence: Arc<dyn PersistenceAdapter>,
        config: Arc<EngineConfig>,
        bus: EventBus,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            strategy,
            exchange,
            gates,
            persistence,
            config,
            bus,
            stopped: AtomicBool::new(false),
            state: Mutex::new(CoreState::default()),
            run_lock: Mutex::new(()),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn strategy_name(&self) -> &str {
        &self.strategy.name
    }

    pub fn strategy_schema(&self) -> &Arc<StrategySchema> {
        &self.strategy
    }

    pub fn identity(&self, backtest: bool) -> RunIdentity {
        RunIdentity {
            symbol: self.symbol.clone(),
            strategy_name: self.strategy.name.clone(),
            exchange_name: self.exchange.name().to_string(),
            backtest,
        }
    }

    // ── Stop flag ───────────────────────────────────────────────────────

    /// Request a graceful stop. Idempotent; observed at loop checkpoints.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!(symbol = %self.symbol, strategy = %self.strategy.name, "stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_stop(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    pub(crate) async fn acquire_run(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.run_lock.lock().await
    }

    // ── State queries / resets ──────────────────────────────────────────

    /// Whether a pending or scheduled signal is in flight.
    pub async fn has_open_signal(&self) -> bool {
        let state = self.state.lock().await;
        state.pending.is_some() || state.scheduled.is_some()
    }

    /// Drop all in-memory state and this instance's risk-gate positions.
    /// Persisted records are untouched. Backtest runs call this at start so
    /// repeated runs are deterministic.
    pub async fn reset_state(&self) {
        let mut state = self.state.lock().await;
        state.pending = None;
        state.scheduled = None;
        state.last_signal_at = None;
        state.partial_levels.clear();
        for gate in &self.gates {
            gate.remove_position(&self.symbol, &self.strategy.name);
        }
    }

    // ── Recovery ────────────────────────────────────────────────────────

    /// Restore persisted pending and scheduled signals into the machine.
    /// Records whose identity no longer matches the current context are
    /// ignored (not deleted); read failures are treated as absent.
    pub async fn restore(&self) {
        let mut state = self.state.lock().await;

        if state.pending.is_none() {
            match self
                .persistence
                .read_value(SignalKind::Pending, &self.symbol, &self.strategy.name)
                .await
            {
                Ok(Some(sig)) => {
                    if self.record_matches(&sig) {
                        info!(
                            symbol = %self.symbol,
                            strategy = %self.strategy.name,
                            id = %sig.id,
                            "pending signal restored from persistence"
                        );
                        for gate in &self.gates {
                            gate.add_position(
                                &self.symbol,
                                &self.strategy.name,
                                sig.pending_at.unwrap_or(sig.created_at),
                            );
                        }
                        state.pending = Some(sig.clone());
                        state.partial_levels.clear();
                        self.strategy.callbacks.on_active(&sig).await;
                    } else {
                        warn!(
                            symbol = %self.symbol,
                            strategy = %self.strategy.name,
                            "persisted pending signal does not match the current context; ignored"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "pending signal read failed at startup; treating as absent");
                }
            }
        }

        if state.scheduled.is_none() && state.pending.is_none() {
            match self
                .persistence
                .read_value(SignalKind::Scheduled, &self.symbol, &self.strategy.name)
                .await
            {
                Ok(Some(sig)) => {
                    if self.record_matches(&sig) {
                        info!(
                            symbol = %self.symbol,
                            strategy = %self.strategy.name,
                            id = %sig.id,
                            "scheduled signal restored from persistence"
                        );
                        state.scheduled = Some(sig.clone());
                        self.strategy.callbacks.on_schedule(&sig).await;
                    } else {
                        warn!(
                            symbol = %self.symbol,
                            strategy = %self.strategy.name,
                            "persisted scheduled signal does not match the current context; ignored"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "scheduled signal read failed at startup; treating as absent");
                }
            }
        }
    }

    fn record_matches(&self, sig: &Signal) -> bool {
        sig.symbol == self.symbol
            && sig.strategy_name == self.strategy.name
            && sig.exchange_name == self.exchange.name()
    }

    // ── Tick ────────────────────────────────────────────────────────────

    /// One evaluation of the state machine at the ambient `when`.
    ///
    /// A stopped machine keeps monitoring an in-flight signal until it
    /// reaches a terminal state (graceful shutdown); it only refuses to
    /// produce new ones.
    pub async fn tick(&self) -> EngineResult<TickResult> {
        let ctx = ExecutionContext::current()?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.scheduled.is_some() {
            return self.tick_scheduled(state, &ctx).await;
        }
        if state.pending.is_some() {
            return self.tick_pending(state, &ctx).await;
        }
        if self.is_stopped() {
            return Ok(TickResult::Idle);
        }
        self.tick_flat(state, &ctx).await
    }

    async fn tick_scheduled(
        &self,
        state: &mut CoreState,
        ctx: &ExecutionContext,
    ) -> EngineResult<TickResult> {
        let sig = state.scheduled.clone().expect("scheduled signal present");
        let scheduled_at = sig.scheduled_at.unwrap_or(sig.created_at);

        // Strictly greater: activation exactly at the await boundary counts.
        if ctx.when - scheduled_at > self.config.schedule_await_ms() {
            let cancelled = self
                .cancel_scheduled(state, CancelReason::ScheduleTimeout, ctx.when, ctx.backtest)
                .await;
            return Ok(TickResult::Cancelled(cancelled));
        }

        let price = self.exchange.get_average_price(&self.symbol).await?;

        let (sl_crossed, entry_crossed) = match sig.position {
            Side::Long => (price <= sig.price_stop_loss, price <= sig.price_open),
            Side::Short => (price >= sig.price_stop_loss, price >= sig.price_open),
        };

        // SL priority over activation on the same evaluation.
        if sl_crossed {
            let cancelled = self
                .cancel_scheduled(
                    state,
                    CancelReason::StoplossBeforeActivation,
                    ctx.when,
                    ctx.backtest,
                )
                .await;
            return Ok(TickResult::Cancelled(cancelled));
        }
        if entry_crossed {
            let opened = self.activate(state, ctx.when, ctx.backtest).await;
            return Ok(TickResult::Opened(opened));
        }
        Ok(TickResult::Active(sig))
    }

    async fn tick_pending(
        &self,
        state: &mut CoreState,
        ctx: &ExecutionContext,
    ) -> EngineResult<TickResult> {
        let sig = state.pending.clone().expect("pending signal present");
        let price = self.exchange.get_average_price(&self.symbol).await?;
        let pending_at = sig.pending_at.unwrap_or(sig.created_at);

        let (tp_hit, sl_hit) = match sig.position {
            Side::Long => (
                price >= sig.price_take_profit,
                price <= sig.price_stop_loss,
            ),
            Side::Short => (
                price <= sig.price_take_profit,
                price >= sig.price_stop_loss,
            ),
        };

        if tp_hit {
            let closed = self
                .close_pending(
                    state,
                    CloseReason::TakeProfit,
                    sig.price_take_profit,
                    ctx.when,
                    ctx.backtest,
                )
                .await;
            return Ok(TickResult::Closed(closed));
        }
        if sl_hit {
            let closed = self
                .close_pending(
                    state,
                    CloseReason::StopLoss,
                    sig.price_stop_loss,
                    ctx.when,
                    ctx.backtest,
                )
                .await;
            return Ok(TickResult::Closed(closed));
        }
        if ctx.when - pending_at >= sig.lifetime_ms() {
            let closed = self
                .close_pending(state, CloseReason::TimeExpired, price, ctx.when, ctx.backtest)
                .await;
            return Ok(TickResult::Closed(closed));
        }

        let pnl = net_pnl_percent(
            sig.position,
            sig.price_open,
            price,
            self.config.fee_percent,
            self.config.slippage_percent,
        );
        self.emit_partials(&mut state.partial_levels, &sig, pnl, ctx.when, ctx.backtest);

        Ok(TickResult::Active(sig))
    }

    async fn tick_flat(
        &self,
        state: &mut CoreState,
        ctx: &ExecutionContext,
    ) -> EngineResult<TickResult> {
        // Throttle: the strategy's declared interval bounds get_signal calls.
        if let Some(last) = state.last_signal_at {
            if ctx.when - last < self.strategy.interval.ms() {
                return Ok(TickResult::Idle);
            }
        }

        let price = self.exchange.get_average_price(&self.symbol).await?;

        // Portfolio pre-flight across every declared risk profile, in order.
        let payload = RiskCheckPayload {
            symbol: self.symbol.clone(),
            strategy_name: self.strategy.name.clone(),
            exchange_name: self.exchange.name().to_string(),
            backtest: ctx.backtest,
            current_price: price,
            timestamp: ctx.when,
            pending_signal: None,
            active_position_count: 0,
            active_positions: Vec::new(),
        };
        for gate in &self.gates {
            if !gate.check_signal(payload.clone()).await {
                return Ok(TickResult::Idle);
            }
        }

        state.last_signal_at = Some(ctx.when);
        let dto = match self.strategy.source.get_signal(&self.symbol).await {
            Ok(Some(dto)) => dto,
            Ok(None) => return Ok(TickResult::Idle),
            Err(err) => {
                warn!(
                    symbol = %self.symbol,
                    strategy = %self.strategy.name,
                    error = %err,
                    "get_signal failed"
                );
                self.emit_error(ctx.when, ctx.backtest, format!("get_signal failed: {err:#}"));
                return Ok(TickResult::Idle);
            }
        };

        if let Err(err) =
            validate_signal(&dto, price, &self.config, &self.symbol, &self.strategy.name)
        {
            warn!(
                symbol = %self.symbol,
                strategy = %self.strategy.name,
                error = %err,
                "signal dropped by validation"
            );
            self.emit_error(ctx.when, ctx.backtest, err.to_string());
            return Ok(TickResult::Idle);
        }

        let id = dto
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let immediate = dto.is_immediate(price);

        let mut signal = Signal {
            id,
            symbol: self.symbol.clone(),
            exchange_name: self.exchange.name().to_string(),
            strategy_name: self.strategy.name.clone(),
            position: dto.position,
            price_open: if immediate {
                price
            } else {
                // Non-immediate implies a supplied entry price.
                dto.price_open.unwrap_or(price)
            },
            price_take_profit: dto.price_take_profit,
            price_stop_loss: dto.price_stop_loss,
            minute_estimated_time: dto.minute_estimated_time,
            note: dto.note.clone(),
            created_at: ctx.when,
            scheduled_at: None,
            pending_at: None,
        };

        if immediate {
            signal.pending_at = Some(ctx.when);
            state.pending = Some(signal.clone());
            state.partial_levels.clear();
            self.persist_write(SignalKind::Pending, &signal, ctx.backtest)
                .await;
            for gate in &self.gates {
                gate.add_position(&self.symbol, &self.strategy.name, ctx.when);
            }
            info!(
                symbol = %self.symbol,
                strategy = %self.strategy.name,
                id = %signal.id,
                position = %signal.position,
                price_open = signal.price_open,
                tp = signal.price_take_profit,
                sl = signal.price_stop_loss,
                "position opened"
            );
            self.strategy.callbacks.on_open(&signal).await;
            Ok(TickResult::Opened(signal))
        } else {
            signal.scheduled_at = Some(ctx.when);
            state.scheduled = Some(signal.clone());
            self.persist_write(SignalKind::Scheduled, &signal, ctx.backtest)
                .await;
            info!(
                symbol = %self.symbol,
                strategy = %self.strategy.name,
                id = %signal.id,
                position = %signal.position,
                price_open = signal.price_open,
                "signal scheduled"
            );
            self.strategy.callbacks.on_schedule(&signal).await;
            Ok(TickResult::Scheduled(signal))
        }
    }

    // ── Backtest fast-path ──────────────────────────────────────────────

    /// Walk a candle vector instead of ticking minute by minute. The vector
    /// starts at `when` and must cover the VWAP buffer, the schedule-await
    /// window and the signal lifetime.
    pub async fn backtest_pass(
        &self,
        candles: &[CandleData],
        when: i64,
    ) -> EngineResult<FastPathOutcome> {
        const BACKTEST: bool = true;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if candles.is_empty() {
            return Err(DataError::NoData {
                symbol: self.symbol.clone(),
                context: "backtest fast-path window".into(),
            }
            .into());
        }

        let mut opened: Option<(Signal, i64)> = None;
        let mut monitor_from = 0usize;

        // Phase A: resolve a scheduled signal — first candle that cancels or
        // activates decides.
        if let Some(sig) = state.scheduled.clone() {
            let scheduled_at = sig.scheduled_at.unwrap_or(sig.created_at);
            let await_ms = self.config.schedule_await_ms();

            enum Resolution {
                Activated(usize),
                Cancelled(usize, CancelReason),
            }

            let mut resolution = None;
            for (i, candle) in candles.iter().enumerate() {
                if candle.timestamp - scheduled_at > await_ms {
                    resolution = Some(Resolution::Cancelled(i, CancelReason::ScheduleTimeout));
                    break;
                }
                let (sl_crossed, entry_crossed) = match sig.position {
                    Side::Long => (
                        candle.low <= sig.price_stop_loss,
                        candle.low <= sig.price_open,
                    ),
                    Side::Short => (
                        candle.high >= sig.price_stop_loss,
                        candle.high >= sig.price_open,
                    ),
                };
                // SL priority over activation within the same candle.
                if sl_crossed {
                    resolution =
                        Some(Resolution::Cancelled(i, CancelReason::StoplossBeforeActivation));
                    break;
                }
                if entry_crossed {
                    resolution = Some(Resolution::Activated(i));
                    break;
                }
            }

            match resolution {
                Some(Resolution::Activated(i)) => {
                    let at = candles[i].timestamp;
                    let window_start =
                        i.saturating_sub(self.config.avg_price_candles_count.saturating_sub(1));
                    let activation_vwap = vwap(&candles[window_start..=i]);
                    debug!(
                        symbol = %self.symbol,
                        strategy = %self.strategy.name,
                        activation_vwap,
                        candle = i,
                        "scheduled signal activated in fast-path"
                    );
                    let promoted = self.activate(state, at, BACKTEST).await;
                    opened = Some((promoted, at));
                    monitor_from = i + 1;
                }
                Some(Resolution::Cancelled(i, reason)) => {
                    let cancelled = self
                        .cancel_scheduled(state, reason, candles[i].timestamp, BACKTEST)
                        .await;
                    return Ok(FastPathOutcome {
                        result: TickResult::Cancelled(cancelled),
                        opened: None,
                        candles_consumed: i + 1,
                    });
                }
                None => {
                    // The window is sized to cover the await timeout; running
                    // out of candles means a truncated feed. Cancel rather
                    // than wedge.
                    let last = candles.last().expect("non-empty window");
                    let cancelled = self
                        .cancel_scheduled(
                            state,
                            CancelReason::ScheduleTimeout,
                            last.timestamp,
                            BACKTEST,
                        )
                        .await;
                    return Ok(FastPathOutcome {
                        result: TickResult::Cancelled(cancelled),
                        opened: None,
                        candles_consumed: candles.len(),
                    });
                }
            }
        }

        // Phase B: monitor the pending signal candle by candle.
        let Some(sig) = state.pending.clone() else {
            return Ok(FastPathOutcome {
                result: TickResult::Idle,
                opened,
                candles_consumed: 1,
            });
        };
        let pending_at = sig.pending_at.unwrap_or(when);
        let lifetime_ms = sig.lifetime_ms();

        for (i, candle) in candles.iter().enumerate().skip(monitor_from) {
            let (sl_hit, tp_hit) = match sig.position {
                Side::Long => (
                    candle.low <= sig.price_stop_loss,
                    candle.high >= sig.price_take_profit,
                ),
                Side::Short => (
                    candle.high >= sig.price_stop_loss,
                    candle.low <= sig.price_take_profit,
                ),
            };

            // Worst-case intra-candle ordering: SL, then TP, then time.
            if sl_hit {
                let closed = self
                    .close_pending(
                        state,
                        CloseReason::StopLoss,
                        sig.price_stop_loss,
                        candle.timestamp,
                        BACKTEST,
                    )
                    .await;
                return Ok(FastPathOutcome {
                    result: TickResult::Closed(closed),
                    opened,
                    candles_consumed: i + 1,
                });
            }
            if tp_hit {
                let closed = self
                    .close_pending(
                        state,
                        CloseReason::TakeProfit,
                        sig.price_take_profit,
                        candle.timestamp,
                        BACKTEST,
                    )
                    .await;
                return Ok(FastPathOutcome {
                    result: TickResult::Closed(closed),
                    opened,
                    candles_consumed: i + 1,
                });
            }
            if candle.timestamp - pending_at >= lifetime_ms {
                let closed = self
                    .close_pending(
                        state,
                        CloseReason::TimeExpired,
                        candle.close,
                        candle.timestamp,
                        BACKTEST,
                    )
                    .await;
                return Ok(FastPathOutcome {
                    result: TickResult::Closed(closed),
                    opened,
                    candles_consumed: i + 1,
                });
            }

            let pnl = net_pnl_percent(
                sig.position,
                sig.price_open,
                candle.close,
                self.config.fee_percent,
                self.config.slippage_percent,
            );
            self.emit_partials(&mut state.partial_levels, &sig, pnl, candle.timestamp, BACKTEST);
        }

        // Candle data ran out before the lifetime elapsed: close at the last
        // close so the machine never wedges on a truncated feed.
        let last = candles.last().expect("non-empty window");
        let closed = self
            .close_pending(
                state,
                CloseReason::TimeExpired,
                last.close,
                last.timestamp,
                BACKTEST,
            )
            .await;
        Ok(FastPathOutcome {
            result: TickResult::Closed(closed),
            opened,
            candles_consumed: candles.len(),
        })
    }

    // ── Transitions ─────────────────────────────────────────────────────

    async fn activate(&self, state: &mut CoreState, at: i64, backtest: bool) -> Signal {
        let mut sig = state.scheduled.take().expect("scheduled signal present");
        sig.scheduled_at = None;
        sig.pending_at = Some(at);
        state.partial_levels.clear();
        state.pending = Some(sig.clone());

        self.persist_delete(SignalKind::Scheduled, backtest).await;
        self.persist_write(SignalKind::Pending, &sig, backtest).await;
        for gate in &self.gates {
            gate.add_position(&self.symbol, &self.strategy.name, at);
        }
        info!(
            symbol = %self.symbol,
            strategy = %self.strategy.name,
            id = %sig.id,
            position = %sig.position,
            price_open = sig.price_open,
            "scheduled signal activated"
        );
        self.strategy.callbacks.on_open(&sig).await;
        sig
    }

    async fn close_pending(
        &self,
        state: &mut CoreState,
        reason: CloseReason,
        price_close: f64,
        closed_at: i64,
        backtest: bool,
    ) -> ClosedSignal {
        let sig = state.pending.take().expect("pending signal present");
        let pnl_percent = net_pnl_percent(
            sig.position,
            sig.price_open,
            price_close,
            self.config.fee_percent,
            self.config.slippage_percent,
        );
        // Announce any levels the final move crossed before the close event.
        self.emit_partials(&mut state.partial_levels, &sig, pnl_percent, closed_at, backtest);
        state.partial_levels.clear();

        let closed = ClosedSignal {
            signal: sig.clone(),
            reason,
            price_close,
            pnl_percent,
            fee_percent: self.config.fee_percent,
            slippage_percent: self.config.slippage_percent,
            closed_at,
        };

        info!(
            symbol = %self.symbol,
            strategy = %self.strategy.name,
            id = %sig.id,
            reason = %reason,
            price_close,
            pnl_percent = format!("{pnl_percent:.4}"),
            "position closed"
        );

        for gate in &self.gates {
            gate.remove_position(&self.symbol, &self.strategy.name);
        }
        self.persist_delete(SignalKind::Pending, backtest).await;
        self.strategy.callbacks.on_close(&closed).await;
        closed
    }

    async fn cancel_scheduled(
        &self,
        state: &mut CoreState,
        reason: CancelReason,
        cancelled_at: i64,
        backtest: bool,
    ) -> CancelledSignal {
        let sig = state.scheduled.take().expect("scheduled signal present");
        let cancelled = CancelledSignal {
            signal: sig.clone(),
            reason,
            cancelled_at,
        };

        info!(
            symbol = %self.symbol,
            strategy = %self.strategy.name,
            id = %sig.id,
            reason = %reason,
            "scheduled signal cancelled"
        );

        self.persist_delete(SignalKind::Scheduled, backtest).await;
        self.strategy.callbacks.on_cancel(&cancelled).await;
        cancelled
    }

    // ── Emission helpers ────────────────────────────────────────────────

    fn emit_partials(
        &self,
        seen: &mut HashSet<i64>,
        sig: &Signal,
        pnl_percent: f64,
        when: i64,
        backtest: bool,
    ) {
        let magnitude =
            (pnl_percent.abs() / PARTIAL_LEVEL_STEP_PERCENT as f64).floor() as i64;
        if magnitude == 0 {
            return;
        }
        let sign = if pnl_percent >= 0.0 { 1 } else { -1 };
        for k in 1..=magnitude {
            let level = sign * k * PARTIAL_LEVEL_STEP_PERCENT;
            if !seen.insert(level) {
                continue;
            }
            let event = PartialEvent {
                identity: self.identity(backtest),
                signal: sig.clone(),
                level,
                pnl_percent,
                when,
            };
            debug!(
                symbol = %self.symbol,
                strategy = %self.strategy.name,
                id = %sig.id,
                level,
                pnl = format!("{pnl_percent:.4}"),
                "partial level crossed"
            );
            if level > 0 {
                self.bus.publish(EngineEvent::PartialProfit(event));
            } else {
                self.bus.publish(EngineEvent::PartialLoss(event));
            }
        }
    }

    fn emit_error(&self, when: i64, backtest: bool, message: String) {
        self.bus.publish(EngineEvent::Error(ErrorEvent {
            identity: Some(self.identity(backtest)),
            message,
            when,
        }));
    }

    async fn persist_write(&self, kind: SignalKind, signal: &Signal, backtest: bool) {
        if backtest {
            return;
        }
        if let Err(e) = self
            .persistence
            .write_value(kind, &self.symbol, &self.strategy.name, signal)
            .await
        {
            warn!(error = %e, "signal persistence write failed");
            self.emit_error(
                signal.created_at,
                backtest,
                format!("persistence write failed: {e}"),
            );
        }
    }

    async fn persist_delete(&self, kind: SignalKind, backtest: bool) {
        if backtest {
            return;
        }
        if let Err(e) = self
            .persistence
            .delete_value(kind, &self.symbol, &self.strategy.name)
            .await
        {
            warn!(error = %e, "signal persistence delete failed");
            self.emit_error(
                chrono::Utc::now().timestamp_millis(),
                backtest,
                format!("persistence delete failed: {e}"),
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topic;
    use crate::exchange::cache::CandleCache;
    use crate::schema::{ExchangeAdapter, ExchangeSchema, SignalSource};
    use crate::testkit::*;
    use crate::types::{Interval, MINUTE_MS};

    struct NullPersistence;

    #[async_trait::async_trait]
    impl PersistenceAdapter for NullPersistence {
        async fn wait_for_init(&self) -> Result<(), crate::error::PersistenceError> {
            Ok(())
        }
        async fn has_value(
            &self,
            _kind: SignalKind,
            _symbol: &str,
            _strategy_name: &str,
        ) -> Result<bool, crate::error::PersistenceError> {
            Ok(false)
        }
        async fn read_value(
            &self,
            _kind: SignalKind,
            _symbol: &str,
            _strategy_name: &str,
        ) -> Result<Option<Signal>, crate::error::PersistenceError> {
            Ok(None)
        }
        async fn write_value(
            &self,
            _kind: SignalKind,
            _symbol: &str,
            _strategy_name: &str,
            _signal: &Signal,
        ) -> Result<(), crate::error::PersistenceError> {
            Ok(())
        }
        async fn delete_value(
            &self,
            _kind: SignalKind,
            _symbol: &str,
            _strategy_name: &str,
        ) -> Result<(), crate::error::PersistenceError> {
            Ok(())
        }
    }

    struct Harness {
        core: Arc<StrategyCore>,
        bus: EventBus,
        callbacks: Arc<RecordingCallbacks>,
    }

    fn harness_with(
        adapter: Arc<dyn ExchangeAdapter>,
        source: Arc<dyn SignalSource>,
        config: EngineConfig,
    ) -> Harness {
        let callbacks = RecordingCallbacks::new();
        let strategy = Arc::new(
            crate::schema::StrategySchema::new("scalp", Interval::M1, source)
                .with_callbacks(callbacks.clone() as Arc<dyn crate::schema::StrategyCallbacks>),
        );
        let config = Arc::new(config);
        let exchange = Arc::new(ExchangeCore::new(
            Arc::new(ExchangeSchema::new("mockex", adapter)),
            Arc::new(CandleCache::new()),
            Arc::clone(&config),
        ));
        let bus = EventBus::new();
        let core = Arc::new(StrategyCore::new(
            "BTCUSDT",
            strategy,
            exchange,
            Vec::new(),
            Arc::new(NullPersistence),
            config,
            bus.clone(),
        ));
        Harness {
            core,
            bus,
            callbacks,
        }
    }

    /// Config with a one-candle VWAP window: the average price at `when` is
    /// exactly the scripted price at `when - 1m`.
    fn sharp_config() -> EngineConfig {
        EngineConfig {
            avg_price_candles_count: 1,
            ..EngineConfig::default()
        }
    }

    async fn tick_at(core: &Arc<StrategyCore>, when: i64) -> TickResult {
        ExecutionContext::new("BTCUSDT", when, true)
            .scope(core.tick())
            .await
            .unwrap()
    }

    // ── Opening ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn immediate_long_opens_at_vwap() {
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(OnceSignal::new(long_dto(105.0, 95.0, 60))),
            EngineConfig::default(),
        );

        match tick_at(&h.core, T0).await {
            TickResult::Opened(sig) => {
                assert!((sig.price_open - 100.0).abs() < 1e-9);
                assert_eq!(sig.pending_at, Some(T0));
                assert_eq!(sig.scheduled_at, None);
                assert!(!sig.id.is_empty());
            }
            other => panic!("expected opened, got {other:?}"),
        }
        assert!(h.core.has_open_signal().await);
        assert_eq!(h.callbacks.seen().len(), 1);
        assert!(h.callbacks.seen()[0].starts_with("open:"));
    }

    #[tokio::test]
    async fn stopped_machine_ticks_idle() {
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(OnceSignal::new(long_dto(105.0, 95.0, 60))),
            EngineConfig::default(),
        );
        h.core.stop();
        h.core.stop(); // idempotent
        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Idle));
        assert!(!h.core.has_open_signal().await);
    }

    #[tokio::test]
    async fn throttle_limits_get_signal_frequency() {
        struct CountingFlat {
            calls: std::sync::atomic::AtomicUsize,
        }

        #[async_trait::async_trait]
        impl SignalSource for CountingFlat {
            async fn get_signal(
                &self,
                _symbol: &str,
            ) -> anyhow::Result<Option<crate::signal::SignalDto>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        }

        let source = Arc::new(CountingFlat {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            source.clone() as Arc<dyn SignalSource>,
            EngineConfig::default(),
        );

        tick_at(&h.core, T0).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // A second tick inside the 1m interval is throttled.
        tick_at(&h.core, T0 + 1).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // The next interval boundary allows a call again.
        tick_at(&h.core, T0 + MINUTE_MS).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn supplied_id_is_kept() {
        let dto = crate::signal::SignalDto {
            id: Some("my-id".into()),
            ..long_dto(105.0, 95.0, 60)
        };
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(OnceSignal::new(dto)),
            EngineConfig::default(),
        );
        match tick_at(&h.core, T0).await {
            TickResult::Opened(sig) => assert_eq!(sig.id, "my-id"),
            other => panic!("expected opened, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_signal_is_dropped_with_error_event() {
        // TP below open for a long: validation failure.
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(OnceSignal::new(long_dto(95.0, 105.0, 60))),
            EngineConfig::default(),
        );
        let mut errors = h.bus.subscribe(&[Topic::Error]);

        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Idle));
        assert!(!h.core.has_open_signal().await);
        match errors.recv().await.unwrap() {
            EngineEvent::Error(ev) => assert!(ev.message.contains("signal rejected")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_source_is_caught() {
        struct Exploding;

        #[async_trait::async_trait]
        impl SignalSource for Exploding {
            async fn get_signal(
                &self,
                _symbol: &str,
            ) -> anyhow::Result<Option<crate::signal::SignalDto>> {
                anyhow::bail!("strategy blew up")
            }
        }

        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(Exploding),
            EngineConfig::default(),
        );
        let mut errors = h.bus.subscribe(&[Topic::Error]);

        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Idle));
        match errors.recv().await.unwrap() {
            EngineEvent::Error(ev) => assert!(ev.message.contains("strategy blew up")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // ── Scheduled life-cycle ────────────────────────────────────────────

    fn scheduled_long(open: f64, tp: f64, sl: f64) -> crate::signal::SignalDto {
        crate::signal::SignalDto {
            price_open: Some(open),
            ..long_dto(tp, sl, 60)
        }
    }

    #[tokio::test]
    async fn scheduled_signal_waits_for_entry() {
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(OnceSignal::new(scheduled_long(95.0, 105.0, 92.0))),
            sharp_config(),
        );

        match tick_at(&h.core, T0).await {
            TickResult::Scheduled(sig) => {
                assert_eq!(sig.scheduled_at, Some(T0));
                assert!((sig.price_open - 95.0).abs() < f64::EPSILON);
            }
            other => panic!("expected scheduled, got {other:?}"),
        }
        // Price stays away from the entry: still waiting.
        assert!(matches!(
            tick_at(&h.core, T0 + MINUTE_MS).await,
            TickResult::Active(_)
        ));
        let seen = h.callbacks.seen();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("schedule:"));
    }

    #[tokio::test]
    async fn stoploss_before_activation_wins_even_when_entry_also_crossed() {
        // Price collapses straight through entry (95) AND stop (92): the
        // schedule cancels, it does not open.
        let h = harness_with(
            Arc::new(PathExchange::new(step_path(100.0, 90.0, T0 + MINUTE_MS))),
            Arc::new(OnceSignal::new(scheduled_long(95.0, 105.0, 92.0))),
            sharp_config(),
        );

        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Scheduled(_)));

        match tick_at(&h.core, T0 + 2 * MINUTE_MS).await {
            TickResult::Cancelled(c) => {
                assert_eq!(c.reason, CancelReason::StoplossBeforeActivation);
            }
            other => panic!("expected cancelled, got {other:?}"),
        }
        assert!(!h.core.has_open_signal().await);
        let seen = h.callbacks.seen();
        assert!(seen.iter().all(|e| !e.starts_with("open:")), "no open: {seen:?}");
    }

    #[tokio::test]
    async fn scheduled_activates_when_entry_crossed_without_sl() {
        // Price eases to 94: below entry 95, above stop 92.
        let h = harness_with(
            Arc::new(PathExchange::new(step_path(100.0, 94.0, T0 + MINUTE_MS))),
            Arc::new(OnceSignal::new(scheduled_long(95.0, 105.0, 92.0))),
            sharp_config(),
        );

        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Scheduled(_)));

        match tick_at(&h.core, T0 + 2 * MINUTE_MS).await {
            TickResult::Opened(sig) => {
                assert_eq!(sig.pending_at, Some(T0 + 2 * MINUTE_MS));
                assert_eq!(sig.scheduled_at, None);
                // Entry stays at the scheduled price.
                assert!((sig.price_open - 95.0).abs() < f64::EPSILON);
            }
            other => panic!("expected opened, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn schedule_timeout_cancels_after_await_window() {
        let config = EngineConfig {
            schedule_await_minutes: 2,
            ..sharp_config()
        };
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(OnceSignal::new(scheduled_long(95.0, 105.0, 92.0))),
            config,
        );

        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Scheduled(_)));
        // At exactly the boundary the signal is still considered.
        assert!(matches!(
            tick_at(&h.core, T0 + 2 * MINUTE_MS).await,
            TickResult::Active(_)
        ));
        match tick_at(&h.core, T0 + 3 * MINUTE_MS).await {
            TickResult::Cancelled(c) => assert_eq!(c.reason, CancelReason::ScheduleTimeout),
            other => panic!("expected cancelled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn activation_on_exact_await_boundary_is_inclusive() {
        let config = EngineConfig {
            schedule_await_minutes: 2,
            ..sharp_config()
        };
        // Price reaches the entry exactly when the await window ends.
        let h = harness_with(
            Arc::new(PathExchange::new(step_path(100.0, 95.0, T0 + MINUTE_MS))),
            Arc::new(OnceSignal::new(scheduled_long(95.0, 105.0, 92.0))),
            config,
        );

        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Scheduled(_)));
        match tick_at(&h.core, T0 + 2 * MINUTE_MS).await {
            TickResult::Opened(_) => {}
            other => panic!("expected opened at the inclusive boundary, got {other:?}"),
        }
    }

    // ── Pending monitoring (live path) ──────────────────────────────────

    #[tokio::test]
    async fn take_profit_closes_with_reference_pnl() {
        let h = harness_with(
            Arc::new(PathExchange::new(step_path(100.0, 110.0, T0 + 4 * MINUTE_MS))),
            Arc::new(OnceSignal::new(long_dto(105.0, 95.0, 60))),
            sharp_config(),
        );

        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Opened(_)));
        assert!(matches!(
            tick_at(&h.core, T0 + MINUTE_MS).await,
            TickResult::Active(_)
        ));

        match tick_at(&h.core, T0 + 5 * MINUTE_MS).await {
            TickResult::Closed(closed) => {
                assert_eq!(closed.reason, CloseReason::TakeProfit);
                assert!((closed.price_close - 105.0).abs() < f64::EPSILON);
                let expected = net_pnl_percent(Side::Long, 100.0, 105.0, 0.1, 0.1);
                assert!((closed.pnl_percent - expected).abs() < 1e-9);
                assert!((closed.pnl_percent - 4.58).abs() < 0.01);
                assert!((closed.fee_percent - 0.1).abs() < f64::EPSILON);
                assert!((closed.slippage_percent - 0.1).abs() < f64::EPSILON);
            }
            other => panic!("expected closed, got {other:?}"),
        }
        assert!(!h.core.has_open_signal().await);
        let seen = h.callbacks.seen();
        assert!(seen.last().unwrap().contains("close"));
        assert!(seen.last().unwrap().contains("take_profit"));
    }

    #[tokio::test]
    async fn stop_loss_closes_short() {
        let h = harness_with(
            Arc::new(PathExchange::new(step_path(100.0, 111.0, T0 + 2 * MINUTE_MS))),
            Arc::new(OnceSignal::new(short_dto(90.0, 110.0, 60))),
            sharp_config(),
        );

        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Opened(_)));
        match tick_at(&h.core, T0 + 3 * MINUTE_MS).await {
            TickResult::Closed(closed) => {
                assert_eq!(closed.reason, CloseReason::StopLoss);
                assert!((closed.price_close - 110.0).abs() < f64::EPSILON);
                assert!(closed.pnl_percent < 0.0);
            }
            other => panic!("expected closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lifetime_expiry_closes_at_current_price() {
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(OnceSignal::new(long_dto(105.0, 95.0, 2))),
            sharp_config(),
        );

        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Opened(_)));
        assert!(matches!(
            tick_at(&h.core, T0 + MINUTE_MS).await,
            TickResult::Active(_)
        ));
        match tick_at(&h.core, T0 + 2 * MINUTE_MS).await {
            TickResult::Closed(closed) => {
                assert_eq!(closed.reason, CloseReason::TimeExpired);
                // Fees and slippage make a flat exit negative.
                assert!(closed.pnl_percent < 0.0);
            }
            other => panic!("expected closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn take_profit_beats_time_expiry_on_the_same_tick() {
        // Price reaches TP on the very tick the lifetime elapses.
        let h = harness_with(
            Arc::new(PathExchange::new(step_path(100.0, 110.0, T0 + MINUTE_MS))),
            Arc::new(OnceSignal::new(long_dto(105.0, 95.0, 2))),
            sharp_config(),
        );

        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Opened(_)));
        match tick_at(&h.core, T0 + 2 * MINUTE_MS).await {
            TickResult::Closed(closed) => assert_eq!(closed.reason, CloseReason::TakeProfit),
            other => panic!("expected closed, got {other:?}"),
        }
    }

    // ── Partial levels ──────────────────────────────────────────────────

    #[tokio::test]
    async fn partial_levels_fire_once_each() {
        let config = EngineConfig {
            fee_percent: 0.0,
            slippage_percent: 0.0,
            ..sharp_config()
        };
        // 100 → 112 → 135: crosses +10 then +20/+30.
        let h = harness_with(
            Arc::new(PathExchange::new(move |ts| {
                if ts < T0 + MINUTE_MS {
                    100.0
                } else if ts < T0 + 2 * MINUTE_MS {
                    112.0
                } else {
                    135.0
                }
            })),
            Arc::new(OnceSignal::new(long_dto(200.0, 85.0, 60))),
            config,
        );
        let mut partials = h.bus.subscribe(&[Topic::PartialProfit, Topic::PartialLoss]);

        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Opened(_)));
        tick_at(&h.core, T0 + 2 * MINUTE_MS).await; // pnl 12% → level 10
        tick_at(&h.core, T0 + 3 * MINUTE_MS).await; // pnl 35% → 20, 30
        tick_at(&h.core, T0 + 4 * MINUTE_MS).await; // pnl 35% → nothing new

        let mut levels = Vec::new();
        while let Ok(ev) = partials.try_recv() {
            match ev {
                EngineEvent::PartialProfit(p) => levels.push(p.level),
                EngineEvent::PartialLoss(p) => levels.push(p.level),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(levels, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn partial_loss_levels_are_signed() {
        let config = EngineConfig {
            fee_percent: 0.0,
            slippage_percent: 0.0,
            ..sharp_config()
        };
        let h = harness_with(
            Arc::new(PathExchange::new(step_path(100.0, 88.0, T0 + MINUTE_MS))),
            Arc::new(OnceSignal::new(long_dto(200.0, 85.0, 60))),
            config,
        );
        let mut partials = h.bus.subscribe(&[Topic::PartialLoss]);

        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Opened(_)));
        tick_at(&h.core, T0 + 2 * MINUTE_MS).await; // pnl -12% → level -10

        match partials.recv().await.unwrap() {
            EngineEvent::PartialLoss(p) => {
                assert_eq!(p.level, -10);
                assert!(p.pnl_percent < -10.0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // ── Backtest fast-path ──────────────────────────────────────────────

    async fn open_immediate(h: &Harness) -> Signal {
        match tick_at(&h.core, T0).await {
            TickResult::Opened(sig) => sig,
            other => panic!("expected opened, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fast_path_stop_loss_wins_when_both_barriers_hit_one_candle() {
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(OnceSignal::new(long_dto(105.0, 95.0, 60))),
            EngineConfig::default(),
        );
        open_immediate(&h).await;

        // One candle spans both barriers: low 94 ≤ SL, high 106 ≥ TP.
        let candles = vec![candle(T0, 100.0, 106.0, 94.0, 100.0)];
        let outcome = h.core.backtest_pass(&candles, T0).await.unwrap();

        match outcome.result {
            TickResult::Closed(closed) => {
                assert_eq!(closed.reason, CloseReason::StopLoss);
                assert!((closed.price_close - 95.0).abs() < f64::EPSILON);
            }
            other => panic!("expected closed, got {other:?}"),
        }
        assert_eq!(outcome.candles_consumed, 1);
    }

    #[tokio::test]
    async fn fast_path_take_profit_beats_time_on_the_expiry_candle() {
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(OnceSignal::new(long_dto(105.0, 95.0, 2))),
            EngineConfig::default(),
        );
        open_immediate(&h).await;

        let candles = vec![
            flat_candle(T0, 100.0),
            flat_candle(T0 + MINUTE_MS, 100.0),
            // Lifetime (2m) elapses here AND the high reaches TP.
            candle(T0 + 2 * MINUTE_MS, 100.0, 106.0, 99.0, 104.0),
        ];
        let outcome = h.core.backtest_pass(&candles, T0).await.unwrap();
        match outcome.result {
            TickResult::Closed(closed) => assert_eq!(closed.reason, CloseReason::TakeProfit),
            other => panic!("expected closed, got {other:?}"),
        }
        assert_eq!(outcome.candles_consumed, 3);
    }

    #[tokio::test]
    async fn fast_path_time_expiry_at_the_closing_candle_close() {
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(OnceSignal::new(long_dto(105.0, 95.0, 2))),
            EngineConfig::default(),
        );
        open_immediate(&h).await;

        let candles = vec![
            flat_candle(T0, 100.0),
            flat_candle(T0 + MINUTE_MS, 101.0),
            flat_candle(T0 + 2 * MINUTE_MS, 102.0),
            flat_candle(T0 + 3 * MINUTE_MS, 103.0),
        ];
        let outcome = h.core.backtest_pass(&candles, T0).await.unwrap();
        match outcome.result {
            TickResult::Closed(closed) => {
                assert_eq!(closed.reason, CloseReason::TimeExpired);
                assert!((closed.price_close - 102.0).abs() < f64::EPSILON);
            }
            other => panic!("expected closed, got {other:?}"),
        }
        assert_eq!(outcome.candles_consumed, 3);
    }

    #[tokio::test]
    async fn fast_path_scheduled_cancel_on_candle_crossing_both_entry_and_sl() {
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(OnceSignal::new(scheduled_long(95.0, 105.0, 92.0))),
            EngineConfig::default(),
        );
        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Scheduled(_)));

        let candles = vec![
            flat_candle(T0, 100.0),
            // Low 91 crosses the entry (95) and the stop (92) at once.
            candle(T0 + MINUTE_MS, 100.0, 100.0, 91.0, 93.0),
        ];
        let outcome = h.core.backtest_pass(&candles, T0).await.unwrap();
        match outcome.result {
            TickResult::Cancelled(c) => {
                assert_eq!(c.reason, CancelReason::StoplossBeforeActivation);
            }
            other => panic!("expected cancelled, got {other:?}"),
        }
        assert!(outcome.opened.is_none());
        assert_eq!(outcome.candles_consumed, 2);
    }

    #[tokio::test]
    async fn fast_path_scheduled_activation_then_monitoring() {
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(OnceSignal::new(scheduled_long(95.0, 105.0, 92.0))),
            EngineConfig::default(),
        );
        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Scheduled(_)));

        let candles = vec![
            flat_candle(T0, 100.0),
            candle(T0 + MINUTE_MS, 100.0, 100.0, 94.0, 95.0), // activation (low ≤ 95)
            flat_candle(T0 + 2 * MINUTE_MS, 98.0),
            candle(T0 + 3 * MINUTE_MS, 100.0, 106.0, 99.0, 105.0), // TP
        ];
        let outcome = h.core.backtest_pass(&candles, T0).await.unwrap();

        let (opened, at) = outcome.opened.expect("activation recorded");
        assert_eq!(at, T0 + MINUTE_MS);
        assert_eq!(opened.pending_at, Some(T0 + MINUTE_MS));
        assert!((opened.price_open - 95.0).abs() < f64::EPSILON);

        match outcome.result {
            TickResult::Closed(closed) => {
                assert_eq!(closed.reason, CloseReason::TakeProfit);
                let expected = net_pnl_percent(Side::Long, 95.0, 105.0, 0.1, 0.1);
                assert!((closed.pnl_percent - expected).abs() < 1e-9);
            }
            other => panic!("expected closed, got {other:?}"),
        }
        assert_eq!(outcome.candles_consumed, 4);
    }

    #[tokio::test]
    async fn fast_path_schedule_timeout() {
        let config = EngineConfig {
            schedule_await_minutes: 2,
            ..EngineConfig::default()
        };
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(OnceSignal::new(scheduled_long(95.0, 105.0, 92.0))),
            config,
        );
        assert!(matches!(tick_at(&h.core, T0).await, TickResult::Scheduled(_)));

        let candles: Vec<_> = (0..6)
            .map(|i| flat_candle(T0 + i * MINUTE_MS, 100.0))
            .collect();
        let outcome = h.core.backtest_pass(&candles, T0).await.unwrap();
        match outcome.result {
            TickResult::Cancelled(c) => {
                assert_eq!(c.reason, CancelReason::ScheduleTimeout);
                // First candle strictly past the window: T0 + 3m.
                assert_eq!(c.cancelled_at, T0 + 3 * MINUTE_MS);
            }
            other => panic!("expected cancelled, got {other:?}"),
        }
        assert_eq!(outcome.candles_consumed, 4);
    }

    #[tokio::test]
    async fn fast_path_truncated_feed_never_wedges() {
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(OnceSignal::new(long_dto(105.0, 95.0, 60))),
            EngineConfig::default(),
        );
        open_immediate(&h).await;

        // Far fewer candles than the lifetime needs.
        let candles = vec![flat_candle(T0, 100.0), flat_candle(T0 + MINUTE_MS, 101.0)];
        let outcome = h.core.backtest_pass(&candles, T0).await.unwrap();
        match outcome.result {
            TickResult::Closed(closed) => {
                assert_eq!(closed.reason, CloseReason::TimeExpired);
                assert!((closed.price_close - 101.0).abs() < f64::EPSILON);
            }
            other => panic!("expected closed, got {other:?}"),
        }
        assert!(!h.core.has_open_signal().await);
    }

    #[tokio::test]
    async fn fast_path_empty_window_is_a_data_error() {
        let h = harness_with(
            Arc::new(PathExchange::constant(100.0)),
            Arc::new(OnceSignal::new(long_dto(105.0, 95.0, 60))),
            EngineConfig::default(),
        );
        open_immediate(&h).await;
        assert!(h.core.backtest_pass(&[], T0).await.is_err());
    }

    // ── Recovery ────────────────────────────────────────────────────────

    fn persisted_signal(exchange_name: &str) -> Signal {
        Signal {
            id: "restored-1".into(),
            symbol: "BTCUSDT".into(),
            exchange_name: exchange_name.into(),
            strategy_name: "scalp".into(),
            position: Side::Long,
            price_open: 100.0,
            price_take_profit: 105.0,
            price_stop_loss: 95.0,
            minute_estimated_time: 60,
            note: None,
            created_at: T0,
            scheduled_at: None,
            pending_at: Some(T0),
        }
    }

    async fn harness_with_file_persistence(
        dir: &tempfile::TempDir,
    ) -> (Arc<StrategyCore>, Arc<RecordingCallbacks>, Arc<crate::persist::FilePersistence>) {
        let persistence = Arc::new(crate::persist::FilePersistence::new(dir.path()));
        persistence.wait_for_init().await.unwrap();

        let callbacks = RecordingCallbacks::new();
        let strategy = Arc::new(
            crate::schema::StrategySchema::new(
                "scalp",
                Interval::M1,
                Arc::new(NeverSignal) as Arc<dyn SignalSource>,
            )
            .with_callbacks(callbacks.clone() as Arc<dyn crate::schema::StrategyCallbacks>),
        );
        let config = Arc::new(EngineConfig::default());
        let exchange = Arc::new(ExchangeCore::new(
            Arc::new(ExchangeSchema::new(
                "mockex",
                Arc::new(PathExchange::constant(100.0)),
            )),
            Arc::new(CandleCache::new()),
            Arc::clone(&config),
        ));
        let core = Arc::new(StrategyCore::new(
            "BTCUSDT",
            strategy,
            exchange,
            Vec::new(),
            persistence.clone() as Arc<dyn PersistenceAdapter>,
            config,
            EventBus::new(),
        ));
        (core, callbacks, persistence)
    }

    #[tokio::test]
    async fn restore_rehydrates_pending_signal_and_fires_on_active() {
        let dir = tempfile::tempdir().unwrap();
        let (core, callbacks, persistence) = harness_with_file_persistence(&dir).await;

        persistence
            .write_value(SignalKind::Pending, "BTCUSDT", "scalp", &persisted_signal("mockex"))
            .await
            .unwrap();

        core.restore().await;
        assert!(core.has_open_signal().await);
        assert_eq!(callbacks.seen(), vec!["active:restored-1"]);
    }

    #[tokio::test]
    async fn restore_ignores_mismatched_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let (core, callbacks, persistence) = harness_with_file_persistence(&dir).await;

        persistence
            .write_value(
                SignalKind::Pending,
                "BTCUSDT",
                "scalp",
                &persisted_signal("otherex"),
            )
            .await
            .unwrap();

        core.restore().await;
        assert!(!core.has_open_signal().await);
        assert!(callbacks.seen().is_empty());
        // The mismatched record is ignored, not deleted.
        assert!(persistence
            .has_value(SignalKind::Pending, "BTCUSDT", "scalp")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn restore_rehydrates_scheduled_signal() {
        let dir = tempfile::tempdir().unwrap();
        let (core, callbacks, persistence) = harness_with_file_persistence(&dir).await;

        let mut sig = persisted_signal("mockex");
        sig.pending_at = None;
        sig.scheduled_at = Some(T0);
        persistence
            .write_value(SignalKind::Scheduled, "BTCUSDT", "scalp", &sig)
            .await
            .unwrap();

        core.restore().await;
        assert!(core.has_open_signal().await);
        assert_eq!(callbacks.seen(), vec!["schedule:restored-1"]);
    }

    #[tokio::test]
    async fn live_tick_persists_and_cleans_up_pending_signal() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(crate::persist::FilePersistence::new(dir.path()));
        persistence.wait_for_init().await.unwrap();

        let strategy = Arc::new(crate::schema::StrategySchema::new(
            "scalp",
            Interval::M1,
            Arc::new(OnceSignal::new(long_dto(105.0, 95.0, 60))) as Arc<dyn SignalSource>,
        ));
        let config = Arc::new(sharp_config());
        let exchange = Arc::new(ExchangeCore::new(
            Arc::new(ExchangeSchema::new(
                "mockex",
                Arc::new(PathExchange::new(step_path(100.0, 110.0, T0 + MINUTE_MS))),
            )),
            Arc::new(CandleCache::new()),
            Arc::clone(&config),
        ));
        let core = Arc::new(StrategyCore::new(
            "BTCUSDT",
            strategy,
            exchange,
            Vec::new(),
            persistence.clone() as Arc<dyn PersistenceAdapter>,
            config,
            EventBus::new(),
        ));

        // Live-mode open persists the pending record.
        let result = ExecutionContext::new("BTCUSDT", T0, false)
            .scope(core.tick())
            .await
            .unwrap();
        assert!(matches!(result, TickResult::Opened(_)));
        assert!(persistence
            .has_value(SignalKind::Pending, "BTCUSDT", "scalp")
            .await
            .unwrap());

        // Close deletes it.
        let result = ExecutionContext::new("BTCUSDT", T0 + 2 * MINUTE_MS, false)
            .scope(core.tick())
            .await
            .unwrap();
        assert!(matches!(result, TickResult::Closed(_)));
        assert!(!persistence
            .has_value(SignalKind::Pending, "BTCUSDT", "scalp")
            .await
            .unwrap());
    }
}
