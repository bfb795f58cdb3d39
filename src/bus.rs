// =============================================================================
// Event Bus — topic-filtered publish/subscribe with per-subscriber ordering
// =============================================================================
//
// Each subscriber owns a private unbounded queue; publishing pushes a clone
// of the event into every queue whose topic filter matches. A subscriber
// therefore sees events in exactly the order the bus accepted them,
// independent of how slowly it drains. Dropping the receiver unsubscribes;
// dead queues are pruned on the next publish.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::signal::{Signal, TickResult};
use crate::stats::BacktestStats;

// =============================================================================
// Topics
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every tick result, both modes.
    Signal,
    /// Tick results from live runs only.
    SignalLive,
    /// Tick results from backtest runs only.
    SignalBacktest,
    /// Risk-gate rejections. Allowed checks are never emitted.
    Risk,
    PartialProfit,
    PartialLoss,
    ProgressBacktest,
    ProgressWalker,
    WalkerComplete,
    DoneBacktest,
    DoneLive,
    /// Recoverable errors.
    Error,
    /// Fatal background-task errors.
    Exit,
}

// =============================================================================
// Event payloads
// =============================================================================

/// Identity attached to every emission so consumers can filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    pub symbol: String,
    pub strategy_name: String,
    pub exchange_name: String,
    pub backtest: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    #[serde(flatten)]
    pub identity: RunIdentity,
    pub when: i64,
    pub result: TickResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    #[serde(flatten)]
    pub identity: RunIdentity,
    pub rejection_id: String,
    pub rejection_note: String,
    pub timestamp: i64,
    pub current_price: f64,
    pub active_position_count: usize,
    #[serde(default)]
    pub pending_signal: Option<Signal>,
}

/// A signal crossed a new 10 %-multiple of profit or loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialEvent {
    #[serde(flatten)]
    pub identity: RunIdentity,
    pub signal: Signal,
    /// The crossed level, signed (e.g. 20 or -10).
    pub level: i64,
    pub pnl_percent: f64,
    pub when: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestProgress {
    #[serde(flatten)]
    pub identity: RunIdentity,
    pub total_frames: usize,
    pub processed_frames: usize,
    /// Completion fraction in [0, 1].
    pub progress: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkerProgress {
    pub walker_name: String,
    pub symbol: String,
    pub strategies_tested: usize,
    pub total_strategies: usize,
    pub best_strategy: Option<String>,
    pub best_metric: Option<f64>,
    /// The metric of the strategy just tested; `None` when it errored.
    pub metric_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkerCompleteEvent {
    pub walker_name: String,
    pub symbol: String,
    pub best_strategy: Option<String>,
    pub best_metric: Option<f64>,
    pub best_stats: Option<BacktestStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(default)]
    pub identity: Option<RunIdentity>,
    pub message: String,
    pub when: i64,
}

// =============================================================================
// EngineEvent
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Signal(SignalEvent),
    Risk(RiskEvent),
    PartialProfit(PartialEvent),
    PartialLoss(PartialEvent),
    ProgressBacktest(BacktestProgress),
    ProgressWalker(WalkerProgress),
    WalkerComplete(WalkerCompleteEvent),
    DoneBacktest(RunIdentity),
    DoneLive(RunIdentity),
    Error(ErrorEvent),
    Exit(ErrorEvent),
}

impl EngineEvent {
    /// The topics this event is delivered on. Signal events fan out to the
    /// mode-specific topic as well as the combined one.
    pub fn topics(&self) -> Vec<Topic> {
        match self {
            Self::Signal(ev) => {
                if ev.identity.backtest {
                    vec![Topic::Signal, Topic::SignalBacktest]
                } else {
                    vec![Topic::Signal, Topic::SignalLive]
                }
            }
            Self::Risk(_) => vec![Topic::Risk],
            Self::PartialProfit(_) => vec![Topic::PartialProfit],
            Self::PartialLoss(_) => vec![Topic::PartialLoss],
            Self::ProgressBacktest(_) => vec![Topic::ProgressBacktest],
            Self::ProgressWalker(_) => vec![Topic::ProgressWalker],
            Self::WalkerComplete(_) => vec![Topic::WalkerComplete],
            Self::DoneBacktest(_) => vec![Topic::DoneBacktest],
            Self::DoneLive(_) => vec![Topic::DoneLive],
            Self::Error(_) => vec![Topic::Error],
            Self::Exit(_) => vec![Topic::Exit],
        }
    }
}

// =============================================================================
// EventBus
// =============================================================================

struct Subscriber {
    /// `None` subscribes to everything.
    topics: Option<HashSet<Topic>>,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Subscribe to the given topics. Dropping the returned receiver
    /// unsubscribes.
    pub fn subscribe(&self, topics: &[Topic]) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(Subscriber {
            topics: Some(topics.iter().copied().collect()),
            tx,
        });
        rx
    }

    /// Subscribe to every topic.
    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(Subscriber { topics: None, tx });
        rx
    }

    /// Deliver `event` to every matching subscriber, pruning queues whose
    /// receivers are gone.
    pub fn publish(&self, event: EngineEvent) {
        let topics = event.topics();
        let mut subs = self.subscribers.write();
        subs.retain(|sub| {
            let interested = match &sub.topics {
                None => true,
                Some(filter) => topics.iter().any(|t| filter.contains(t)),
            };
            if !interested {
                return !sub.tx.is_closed();
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
