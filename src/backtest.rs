// =============================================================================
// Backtest Orchestrator — drive the state machine over a frame sequence
// =============================================================================
//
// Produces a finite sequence of opened/closed/cancelled events. Scheduled
// and opened tick results hand control to the fast-path, which chews through
// a bulk candle window and reports how many frames to skip. Per-frame errors
// advance a single frame instead of wedging the run.
//
// Determinism: no wall clock is read inside the loop; every timestamp
// derives from the frame sequence.
// =============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::{BacktestProgress, EngineEvent, ErrorEvent, EventBus, SignalEvent};
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::core::StrategyCore;
use crate::error::EngineError;
use crate::exchange::ExchangeCore;
use crate::signal::TickResult;
use crate::types::{Interval, MINUTE_MS};

pub(crate) struct BacktestRun {
    pub core: Arc<StrategyCore>,
    pub exchange: Arc<ExchangeCore>,
    pub frames: Vec<i64>,
    pub frame_interval_ms: i64,
    pub config: Arc<EngineConfig>,
    pub bus: EventBus,
}

/// Send to the consumer, if one is attached. A closed receiver means the
/// consumer walked away; the run stops.
async fn forward(tx: &Option<mpsc::Sender<SignalEvent>>, event: SignalEvent) -> bool {
    match tx {
        Some(tx) => tx.send(event).await.is_ok(),
        None => true,
    }
}

impl BacktestRun {
    pub async fn run(self, tx: Option<mpsc::Sender<SignalEvent>>) {
        let _run = self.core.acquire_run().await;
        // Repeated runs over the same instance start from a clean machine.
        self.core.reset_state().await;

        let identity = self.core.identity(true);
        let symbol = self.core.symbol().to_string();
        let total = self.frames.len();

        info!(
            symbol = %symbol,
            strategy = %identity.strategy_name,
            exchange = %identity.exchange_name,
            frames = total,
            "backtest started"
        );

        let mut i = 0usize;
        'frames: while i < total {
            if self.core.is_stopped() {
                info!(symbol = %symbol, strategy = %identity.strategy_name, "backtest stopped");
                break;
            }
            let when = self.frames[i];
            let exec = ExecutionContext::new(symbol.clone(), when, true);

            let result = match exec.clone().scope(self.core.tick()).await {
                Ok(result) => result,
                Err(e) => {
                    // One bad frame must not wedge the whole run.
                    warn!(symbol = %symbol, when, error = %e, "tick failed; skipping frame");
                    self.emit_error(&identity, when, &e);
                    i += 1;
                    continue;
                }
            };

            self.bus.publish(EngineEvent::Signal(SignalEvent {
                identity: identity.clone(),
                when,
                result: result.clone(),
            }));
            self.bus.publish(EngineEvent::ProgressBacktest(BacktestProgress {
                identity: identity.clone(),
                total_frames: total,
                processed_frames: i + 1,
                progress: (i + 1) as f64 / total as f64,
            }));

            let window_signal = match &result {
                TickResult::Scheduled(sig) | TickResult::Opened(sig) => sig.clone(),
                _ => {
                    i += 1;
                    continue;
                }
            };

            if let TickResult::Opened(_) = &result {
                let surfaced = forward(
                    &tx,
                    SignalEvent {
                        identity: identity.clone(),
                        when,
                        result: result.clone(),
                    },
                )
                .await;
                if !surfaced {
                    break 'frames;
                }
            }

            // Window: VWAP buffer + schedule-await + lifetime + 1, in
            // 1-minute candles.
            let window = self.config.avg_price_candles_count
                + self.config.schedule_await_minutes as usize
                + window_signal.minute_estimated_time as usize
                + 1;

            let candles = match exec
                .clone()
                .scope(
                    self.exchange
                        .get_next_candles(&symbol, Interval::M1, window, when),
                )
                .await
            {
                Ok(candles) => candles,
                Err(e) => {
                    warn!(symbol = %symbol, when, error = %e, "candle window fetch failed");
                    self.emit_error(&identity, when, &e);
                    i += 1;
                    continue;
                }
            };

            let outcome = match exec.scope(self.core.backtest_pass(&candles, when)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(symbol = %symbol, when, error = %e, "fast-path failed");
                    self.emit_error(&identity, when, &e);
                    i += 1;
                    continue;
                }
            };

            // Activation inside the window (scheduled signal promoted).
            if let Some((opened, at)) = &outcome.opened {
                let event = SignalEvent {
                    identity: identity.clone(),
                    when: *at,
                    result: TickResult::Opened(opened.clone()),
                };
                self.bus.publish(EngineEvent::Signal(event.clone()));
                if !forward(&tx, event).await {
                    break 'frames;
                }
            }

            let terminal_when = match &outcome.result {
                TickResult::Closed(closed) => closed.closed_at,
                TickResult::Cancelled(cancelled) => cancelled.cancelled_at,
                _ => when,
            };
            let event = SignalEvent {
                identity: identity.clone(),
                when: terminal_when,
                result: outcome.result.clone(),
            };
            self.bus.publish(EngineEvent::Signal(event.clone()));
            if outcome.result.is_terminal() && !forward(&tx, event).await {
                break 'frames;
            }

            // Jump past the processed window, at least one frame.
            let consumed_ms = outcome.candles_consumed as i64 * MINUTE_MS;
            let frames_skipped = (consumed_ms / self.frame_interval_ms).max(1) as usize;
            i += frames_skipped;
        }

        info!(symbol = %symbol, strategy = %identity.strategy_name, "backtest done");
        self.bus.publish(EngineEvent::DoneBacktest(identity));
    }

    fn emit_error(&self, identity: &crate::bus::RunIdentity, when: i64, error: &EngineError) {
        self.bus.publish(EngineEvent::Error(ErrorEvent {
            identity: Some(identity.clone()),
            message: error.to_string(),
            when,
        }));
    }
}

// =============================================================================
// Tests
// =============================================================================
