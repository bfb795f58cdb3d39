// =============================================================================
// Live Orchestrator — wall-clock loop with crash-safe persistence
// =============================================================================
//
// An infinite sequence of opened/closed/cancelled events. Startup waits for
// the persistence adapter and restores any signals a previous process left
// behind; each tick runs at wall-clock `now`, and the loop sleeps
// `tick_ttl_ms` between evaluations (one millisecond past the minute so the
// tick never lands exactly on a candle close).
//
// Per-tick errors are logged, emitted, and retried after the sleep —
// network flakes must not kill the loop. A stop request exits only once the
// machine holds no in-flight signal.
// =============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::{EngineEvent, ErrorEvent, EventBus, SignalEvent};
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::core::StrategyCore;
use crate::persist::PersistenceAdapter;
use crate::signal::TickResult;

pub(crate) struct LiveRun {
    pub core: Arc<StrategyCore>,
    pub persistence: Arc<dyn PersistenceAdapter>,
    pub config: Arc<EngineConfig>,
    pub bus: EventBus,
}

async fn forward(tx: &Option<mpsc::Sender<SignalEvent>>, event: SignalEvent) -> bool {
    match tx {
        Some(tx) => tx.send(event).await.is_ok(),
        None => true,
    }
}

impl LiveRun {
    pub async fn run(self, tx: Option<mpsc::Sender<SignalEvent>>) {
        let _run = self.core.acquire_run().await;

        let identity = self.core.identity(false);
        let symbol = self.core.symbol().to_string();

        if let Err(e) = self.persistence.wait_for_init().await {
            // The next write attempts recovery; don't refuse to trade over it.
            warn!(symbol = %symbol, error = %e, "persistence init failed");
            self.bus.publish(EngineEvent::Error(ErrorEvent {
                identity: Some(identity.clone()),
                message: format!("persistence init failed: {e}"),
                when: chrono::Utc::now().timestamp_millis(),
            }));
        }
        self.core.restore().await;

        info!(
            symbol = %symbol,
            strategy = %identity.strategy_name,
            exchange = %identity.exchange_name,
            tick_ttl_ms = self.config.tick_ttl_ms,
            "live run started"
        );

        loop {
            let when = chrono::Utc::now().timestamp_millis();
            let exec = ExecutionContext::new(symbol.clone(), when, false);

            match exec.scope(self.core.tick()).await {
                Ok(result) => {
                    self.bus.publish(EngineEvent::Signal(SignalEvent {
                        identity: identity.clone(),
                        when,
                        result: result.clone(),
                    }));

                    let surfaced = match &result {
                        TickResult::Opened(_)
                        | TickResult::Closed(_)
                        | TickResult::Cancelled(_) => {
                            forward(
                                &tx,
                                SignalEvent {
                                    identity: identity.clone(),
                                    when,
                                    result: result.clone(),
                                },
                            )
                            .await
                        }
                        _ => true,
                    };
                    if !surfaced {
                        info!(symbol = %symbol, "live consumer gone; stopping");
                        break;
                    }
                }
                Err(e) => {
                    // Tick errors are retried after the usual sleep.
                    warn!(symbol = %symbol, error = %e, "live tick failed; retrying");
                    self.bus.publish(EngineEvent::Error(ErrorEvent {
                        identity: Some(identity.clone()),
                        message: e.to_string(),
                        when,
                    }));
                }
            }

            // Graceful shutdown: the stop flag alone is not enough while a
            // signal is still in flight.
            if self.core.is_stopped() && !self.core.has_open_signal().await {
                info!(symbol = %symbol, strategy = %identity.strategy_name, "live run stopped");
                break;
            }

            tokio::time::sleep(std::time::Duration::from_millis(self.config.tick_ttl_ms)).await;
        }

        self.bus.publish(EngineEvent::DoneLive(identity));
    }
}

// =============================================================================
// Tests
// =============================================================================
