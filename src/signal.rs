// =============================================================================
// Signals — candidate trades, validated rows, lifecycle outcomes, PnL
// =============================================================================
//
// A strategy produces a `SignalDto`. Validation turns it into a `Signal` row
// that is either *scheduled* (waiting for its entry price) or *pending* (an
// activated position under TP/SL/time monitoring). Terminal outcomes are
// `ClosedSignal` and `CancelledSignal`.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::ValidationError;
use crate::types::{CancelReason, CloseReason, Side};

/// Relative tolerance under which a supplied `price_open` counts as equal to
/// the current VWAP, making the signal immediate rather than scheduled.
pub const PRICE_OPEN_REL_TOLERANCE: f64 = 1e-9;

// =============================================================================
// SignalDto — what a strategy hands back
// =============================================================================

/// A candidate trade produced by a strategy's signal callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDto {
    /// Caller-supplied identifier; the engine assigns a UUID when absent.
    #[serde(default)]
    pub id: Option<String>,

    pub position: Side,

    /// Absent: enter immediately at the current VWAP. Present: a *scheduled*
    /// entry at this price.
    #[serde(default)]
    pub price_open: Option<f64>,

    pub price_take_profit: f64,
    pub price_stop_loss: f64,

    /// Maximum lifetime in minutes after activation.
    pub minute_estimated_time: u64,

    /// Opaque human-readable note carried through every emission.
    #[serde(default)]
    pub note: Option<String>,
}

impl SignalDto {
    /// Whether this signal enters immediately at `vwap` rather than waiting
    /// for a scheduled price. A supplied `price_open` within relative
    /// tolerance of the VWAP is treated as immediate.
    pub fn is_immediate(&self, vwap: f64) -> bool {
        match self.price_open {
            None => true,
            Some(open) => ((open - vwap) / vwap).abs() <= PRICE_OPEN_REL_TOLERANCE,
        }
    }
}

// =============================================================================
// Signal — the validated internal row
// =============================================================================

/// A validated signal with engine-assigned metadata. Exactly one of
/// `scheduled_at` / `pending_at` is set at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub exchange_name: String,
    pub strategy_name: String,

    pub position: Side,

    /// Concrete for scheduled signals; the activation VWAP for immediate
    /// ones.
    pub price_open: f64,
    pub price_take_profit: f64,
    pub price_stop_loss: f64,
    pub minute_estimated_time: u64,

    #[serde(default)]
    pub note: Option<String>,

    /// When the signal was accepted, epoch millis.
    pub created_at: i64,

    /// Set while the signal awaits price activation.
    #[serde(default)]
    pub scheduled_at: Option<i64>,

    /// Set once the position is activated and under monitoring.
    #[serde(default)]
    pub pending_at: Option<i64>,
}

impl Signal {
    pub fn is_scheduled(&self) -> bool {
        self.scheduled_at.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.pending_at.is_some()
    }

    /// Signal lifetime in milliseconds once activated.
    pub fn lifetime_ms(&self) -> i64 {
        self.minute_estimated_time as i64 * crate::types::MINUTE_MS
    }
}

// =============================================================================
// Terminal outcomes
// =============================================================================

/// A position that reached TP, SL or its time barrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedSignal {
    pub signal: Signal,
    pub reason: CloseReason,
    pub price_close: f64,
    /// Net PnL in percent after fees and slippage on both sides.
    pub pnl_percent: f64,
    /// The fee assumption the PnL was computed with, percent per side.
    pub fee_percent: f64,
    /// The slippage assumption the PnL was computed with, percent per side.
    pub slippage_percent: f64,
    pub closed_at: i64,
}

/// A scheduled signal that never became a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelledSignal {
    pub signal: Signal,
    pub reason: CancelReason,
    pub cancelled_at: i64,
}

/// Outcome of one state-machine evaluation. Each variant carries only the
/// fields that exist in that state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TickResult {
    /// Nothing to do: stopped, throttled, risk-rejected, or no signal.
    Idle,
    /// A new scheduled signal is waiting for its entry price.
    Scheduled(Signal),
    /// A position was just activated.
    Opened(Signal),
    /// An existing signal is still being monitored.
    Active(Signal),
    Closed(ClosedSignal),
    Cancelled(CancelledSignal),
}

impl TickResult {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scheduled(_) => "scheduled",
            Self::Opened(_) => "opened",
            Self::Active(_) => "active",
            Self::Closed(_) => "closed",
            Self::Cancelled(_) => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed(_) | Self::Cancelled(_))
    }
}

// =============================================================================
// PnL
// =============================================================================

/// Net PnL in percent after symmetric entry + exit fees and slippage, both
/// expressed in percent per side and applied against the trader.
pub fn net_pnl_percent(
    position: Side,
    price_open: f64,
    price_close: f64,
    fee_percent: f64,
    slippage_percent: f64,
) -> f64 {
    let cost = (fee_percent + slippage_percent) / 100.0;
    match position {
        Side::Long => {
            let open_eff = price_open * (1.0 + cost);
            let close_eff = price_close * (1.0 - cost);
            (close_eff - open_eff) / open_eff * 100.0
        }
        Side::Short => {
            let open_eff = price_open * (1.0 - cost);
            let close_eff = price_close * (1.0 + cost);
            (open_eff - close_eff) / open_eff * 100.0
        }
    }
}

// =============================================================================
// Validation
// =============================================================================

fn price_ok(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Validate a candidate signal against the acceptance rules. `vwap` is the
/// current average price; it doubles as the entry price for immediate
/// signals. All violations are collected before failing.
pub fn validate_signal(
    dto: &SignalDto,
    vwap: f64,
    config: &EngineConfig,
    symbol: &str,
    strategy_name: &str,
) -> Result<(), ValidationError> {
    let mut problems: Vec<String> = Vec::new();

    if let Some(id) = &dto.id {
        if id.trim().is_empty() {
            problems.push("id must not be empty when supplied".into());
        }
    }

    if !price_ok(dto.price_take_profit) {
        problems.push(format!(
            "price_take_profit must be positive and finite, got {}",
            dto.price_take_profit
        ));
    }
    if !price_ok(dto.price_stop_loss) {
        problems.push(format!(
            "price_stop_loss must be positive and finite, got {}",
            dto.price_stop_loss
        ));
    }
    if let Some(open) = dto.price_open {
        if !price_ok(open) {
            problems.push(format!(
                "price_open must be positive and finite, got {open}"
            ));
        }
    }

    if dto.minute_estimated_time == 0 {
        problems.push("minute_estimated_time must be positive".into());
    } else if dto.minute_estimated_time > config.max_signal_lifetime_minutes {
        problems.push(format!(
            "minute_estimated_time {} exceeds the {}-minute lifetime cap",
            dto.minute_estimated_time, config.max_signal_lifetime_minutes
        ));
    }

    // Price-relation rules only make sense on sane inputs.
    if problems.is_empty() {
        let immediate = dto.is_immediate(vwap);
        let open = if immediate {
            vwap
        } else {
            dto.price_open.unwrap_or(vwap)
        };
        let tp = dto.price_take_profit;
        let sl = dto.price_stop_loss;

        if tp == sl {
            problems.push("price_take_profit must differ from price_stop_loss".into());
        }
        if tp == open {
            problems.push("price_take_profit must differ from price_open".into());
        }
        if sl == open {
            problems.push("price_stop_loss must differ from price_open".into());
        }

        let (tp_distance_pct, sl_distance_pct) = match dto.position {
            Side::Long => {
                if tp <= open {
                    problems.push(format!(
                        "long: price_take_profit {tp} must exceed price_open {open}"
                    ));
                }
                if sl >= open {
                    problems.push(format!(
                        "long: price_stop_loss {sl} must be below price_open {open}"
                    ));
                }
                ((tp - open) / open * 100.0, (open - sl) / open * 100.0)
            }
            Side::Short => {
                if tp >= open {
                    problems.push(format!(
                        "short: price_take_profit {tp} must be below price_open {open}"
                    ));
                }
                if sl <= open {
                    problems.push(format!(
                        "short: price_stop_loss {sl} must exceed price_open {open}"
                    ));
                }
                ((open - tp) / open * 100.0, (sl - open) / open * 100.0)
            }
        };

        if tp_distance_pct > 0.0 && tp_distance_pct < config.min_takeprofit_distance_percent {
            problems.push(format!(
                "take-profit distance {:.4}% is under the {:.2}% minimum",
                tp_distance_pct, config.min_takeprofit_distance_percent
            ));
        }
        if sl_distance_pct > config.max_stoploss_distance_percent {
            problems.push(format!(
                "stop-loss distance {:.4}% exceeds the {:.2}% cap",
                sl_distance_pct, config.max_stoploss_distance_percent
            ));
        }

        // An immediate entry must still have room to trade: the VWAP may not
        // already sit past TP nor at/beyond SL.
        if immediate {
            match dto.position {
                Side::Long => {
                    if vwap >= tp {
                        problems.push(format!("vwap {vwap} already at/past take-profit {tp}"));
                    }
                    if vwap <= sl {
                        problems.push(format!("vwap {vwap} already at/past stop-loss {sl}"));
                    }
                }
                Side::Short => {
                    if vwap <= tp {
                        problems.push(format!("vwap {vwap} already at/past take-profit {tp}"));
                    }
                    if vwap >= sl {
                        problems.push(format!("vwap {vwap} already at/past stop-loss {sl}"));
                    }
                }
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            symbol: symbol.to_string(),
            strategy_name: strategy_name.to_string(),
            problems,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
