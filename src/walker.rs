// =============================================================================
// Walker Orchestrator — sequential strategy tournament over one frame
// =============================================================================
//
// Runs each candidate strategy's backtest one at a time against the same
// (exchange, frame, symbol), accumulates per-trade statistics, and keeps the
// strategy whose chosen metric is highest. Sequential by design: determinism
// over throughput.
//
// A strategy whose backtest cannot start is skipped with its metric set to
// `None` and ranked last; the walker itself keeps going.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::bus::{EngineEvent, ErrorEvent, EventBus, WalkerCompleteEvent, WalkerProgress};
use crate::context::MethodContext;
use crate::engine::Engine;
use crate::schema::WalkerSchema;
use crate::signal::TickResult;
use crate::stats::{BacktestStats, StatsAccumulator};

pub(crate) struct WalkerRun {
    pub engine: Engine,
    pub walker: Arc<WalkerSchema>,
    pub symbol: String,
    pub stopped: Arc<AtomicBool>,
    pub bus: EventBus,
}

impl WalkerRun {
    pub async fn run(self, tx: Option<mpsc::Sender<WalkerProgress>>) {
        let total = self.walker.strategies.len();
        let mut best: Option<(String, BacktestStats, f64)> = None;

        info!(
            walker = %self.walker.name,
            symbol = %self.symbol,
            strategies = total,
            metric = %self.walker.metric,
            "walker started"
        );

        for (tested, strategy_name) in self.walker.strategies.iter().enumerate() {
            if self.stopped.load(Ordering::SeqCst) {
                info!(walker = %self.walker.name, "walker stopped");
                break;
            }

            let ctx = MethodContext::new(strategy_name, &self.walker.exchange_name)
                .with_frame(&self.walker.frame_name)
                .with_walker(&self.walker.name);

            // Fresh accumulator per candidate: no state bleeds between
            // strategies.
            let mut accumulator = StatsAccumulator::new();
            let evaluation = match self.engine.backtest(&self.symbol, ctx) {
                Ok(mut stream) => {
                    while let Some(event) = stream.next().await {
                        if let TickResult::Closed(closed) = &event.result {
                            accumulator.record(closed);
                        }
                    }
                    let stats = accumulator.compute();
                    let value = self.walker.metric.extract(&stats);
                    Some((stats, value))
                }
                Err(e) => {
                    // Skipped, metric None, ranked last. The walker goes on.
                    warn!(
                        walker = %self.walker.name,
                        strategy = %strategy_name,
                        error = %e,
                        "strategy backtest could not start; skipped"
                    );
                    self.bus.publish(EngineEvent::Error(ErrorEvent {
                        identity: None,
                        message: format!(
                            "walker {}: strategy {strategy_name} skipped: {e}",
                            self.walker.name
                        ),
                        when: 0,
                    }));
                    None
                }
            };

            let metric_value = evaluation.as_ref().map(|(_, value)| *value);
            if let Some((stats, value)) = evaluation {
                let improves = best.as_ref().map_or(true, |(_, _, current)| value > *current);
                if improves {
                    best = Some((strategy_name.clone(), stats, value));
                }
            }

            let progress = WalkerProgress {
                walker_name: self.walker.name.clone(),
                symbol: self.symbol.clone(),
                strategies_tested: tested + 1,
                total_strategies: total,
                best_strategy: best.as_ref().map(|(name, _, _)| name.clone()),
                best_metric: best.as_ref().map(|(_, _, value)| *value),
                metric_value,
            };
            self.bus
                .publish(EngineEvent::ProgressWalker(progress.clone()));
            if let Some(tx) = &tx {
                if tx.send(progress).await.is_err() {
                    info!(walker = %self.walker.name, "walker consumer gone; stopping");
                    break;
                }
            }
        }

        let (best_strategy, best_stats, best_metric) = match best {
            Some((name, stats, value)) => (Some(name), Some(stats), Some(value)),
            None => (None, None, None),
        };
        info!(
            walker = %self.walker.name,
            best = best_strategy.as_deref().unwrap_or("<none>"),
            "walker complete"
        );
        self.bus.publish(EngineEvent::WalkerComplete(WalkerCompleteEvent {
            walker_name: self.walker.name.clone(),
            symbol: self.symbol.clone(),
            best_strategy,
            best_metric,
            best_stats,
        }));
    }
}

// =============================================================================
// Tests
// =============================================================================
