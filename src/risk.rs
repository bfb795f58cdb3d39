// =============================================================================
// Risk Gate — portfolio-level position gating shared across strategies
// =============================================================================
//
// One gate exists per risk profile name. Every strategy core that declares
// the profile reports its opened and closed positions here, so validators
// see the portfolio, not just their own strategy. The gate is the only
// component that mutates the shared active-position set.
//
// Only rejections are emitted on the `risk` topic; allowed checks stay
// silent (anti-spam contract).
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{EngineEvent, EventBus, RiskEvent, RunIdentity};
use crate::schema::registry::SchemaRegistry;
use crate::signal::Signal;

/// One open position as seen by risk validators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePosition {
    pub symbol: String,
    pub strategy_name: String,
    pub opened_at: i64,
}

/// Everything a validator may inspect when judging a candidate signal.
#[derive(Debug, Clone)]
pub struct RiskCheckPayload {
    pub symbol: String,
    pub strategy_name: String,
    pub exchange_name: String,
    pub backtest: bool,
    /// Current VWAP at check time.
    pub current_price: f64,
    pub timestamp: i64,
    /// The candidate signal, when one already exists at check time.
    pub pending_signal: Option<Signal>,
    /// Snapshot of the shared set; filled in by the gate.
    pub active_position_count: usize,
    pub active_positions: Vec<ActivePosition>,
}

impl RiskCheckPayload {
    fn identity(&self) -> RunIdentity {
        RunIdentity {
            symbol: self.symbol.clone(),
            strategy_name: self.strategy_name.clone(),
            exchange_name: self.exchange_name.clone(),
            backtest: self.backtest,
        }
    }
}

pub struct RiskGate {
    name: String,
    registry: Arc<SchemaRegistry>,
    positions: RwLock<Vec<ActivePosition>>,
    bus: EventBus,
}

impl RiskGate {
    pub fn new(name: impl Into<String>, registry: Arc<SchemaRegistry>, bus: EventBus) -> Self {
        Self {
            name: name.into(),
            registry,
            positions: RwLock::new(Vec::new()),
            bus,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate the profile's validators against `payload` in declared
    /// order, fail-fast. Returns whether the signal is allowed. The position
    /// snapshot the validators see is consistent: it is captured and held
    /// for the whole evaluation.
    pub async fn check_signal(&self, mut payload: RiskCheckPayload) -> bool {
        let schema = match self.registry.risk(&self.name) {
            Ok(schema) => schema,
            Err(e) => {
                warn!(gate = %self.name, error = %e, "risk schema vanished; allowing signal");
                return true;
            }
        };

        // Validators are synchronous; evaluate under the read guard so the
        // snapshot cannot shift mid-list.
        let rejection: Option<String> = {
            let positions = self.positions.read();
            payload.active_position_count = positions.len();
            payload.active_positions = positions.clone();

            let mut rejection = None;
            for validator in &schema.validations {
                if let Err(err) = validator.check(&payload) {
                    let note = validator
                        .note()
                        .map(str::to_string)
                        .unwrap_or_else(|| err.to_string());
                    rejection = Some(note);
                    break;
                }
            }
            rejection
        };

        match rejection {
            Some(note) => {
                warn!(
                    gate = %self.name,
                    symbol = %payload.symbol,
                    strategy = %payload.strategy_name,
                    note = %note,
                    "signal rejected by risk gate"
                );
                schema.callbacks.on_rejected(&payload, &note).await;
                self.bus.publish(EngineEvent::Risk(RiskEvent {
                    identity: payload.identity(),
                    rejection_id: Uuid::new_v4().to_string(),
                    rejection_note: note,
                    timestamp: payload.timestamp,
                    current_price: payload.current_price,
                    active_position_count: payload.active_position_count,
                    pending_signal: payload.pending_signal.clone(),
                }));
                false
            }
            None => {
                schema.callbacks.on_allowed(&payload).await;
                true
            }
        }
    }

    /// Record an opened position. At most one entry exists per
    /// (symbol, strategy); re-adding replaces the previous entry.
    pub fn add_position(&self, symbol: &str, strategy_name: &str, opened_at: i64) {
        let mut positions = self.positions.write();
        positions.retain(|p| !(p.symbol == symbol && p.strategy_name == strategy_name));
        positions.push(ActivePosition {
            symbol: symbol.to_string(),
            strategy_name: strategy_name.to_string(),
            opened_at,
        });
        debug!(
            gate = %self.name,
            symbol,
            strategy = strategy_name,
            active = positions.len(),
            "position added to risk gate"
        );
    }

    /// Drop the position for (symbol, strategy), if present.
    pub fn remove_position(&self, symbol: &str, strategy_name: &str) {
        let mut positions = self.positions.write();
        positions.retain(|p| !(p.symbol == symbol && p.strategy_name == strategy_name));
        debug!(
            gate = %self.name,
            symbol,
            strategy = strategy_name,
            active = positions.len(),
            "position removed from risk gate"
        );
    }

    pub fn active_count(&self) -> usize {
        self.positions.read().len()
    }

    pub fn positions(&self) -> Vec<ActivePosition> {
        self.positions.read().clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
