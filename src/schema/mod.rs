// =============================================================================
// Schemas — plain configuration records carrying pluggable implementations
// =============================================================================
//
// Every dynamic callback of the engine is a trait object behind an Arc:
// strategies produce signals, exchanges fetch candles, risk profiles
// validate, callbacks observe lifecycle transitions. Schemas bundle an
// implementation with its name and static settings; the registry keys them
// by name.
// =============================================================================

pub mod connection;
pub mod registry;
pub mod validation;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::risk::RiskCheckPayload;
use crate::signal::{CancelledSignal, ClosedSignal, Signal, SignalDto};
use crate::stats::WalkerMetric;
use crate::types::{CandleData, Interval};

// =============================================================================
// Strategy capabilities
// =============================================================================

/// Produces candidate signals. Implementations read the ambient
/// [`ExecutionContext`](crate::context::ExecutionContext) for the current
/// timestamp and mode.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Return a candidate trade, or `None` to stay flat. Errors are caught,
    /// logged and emitted on the `error` topic; the tick returns idle.
    async fn get_signal(&self, symbol: &str) -> anyhow::Result<Option<SignalDto>>;
}

/// Lifecycle observers for a strategy. All methods default to no-ops.
#[async_trait]
pub trait StrategyCallbacks: Send + Sync {
    /// A scheduled signal was accepted and is waiting for its entry price.
    async fn on_schedule(&self, _signal: &Signal) {}

    /// A position was activated (immediately or from a scheduled signal).
    async fn on_open(&self, _signal: &Signal) {}

    /// A persisted pending signal was restored after a restart.
    async fn on_active(&self, _signal: &Signal) {}

    async fn on_close(&self, _closed: &ClosedSignal) {}

    async fn on_cancel(&self, _cancelled: &CancelledSignal) {}
}

/// The default callback set: observes nothing.
pub struct NoStrategyCallbacks;

#[async_trait]
impl StrategyCallbacks for NoStrategyCallbacks {}

/// Adapter turning a plain function into a [`SignalSource`].
pub struct FnSignalSource<F>(pub F);

#[async_trait]
impl<F> SignalSource for FnSignalSource<F>
where
    F: Fn(&str) -> anyhow::Result<Option<SignalDto>> + Send + Sync,
{
    async fn get_signal(&self, symbol: &str) -> anyhow::Result<Option<SignalDto>> {
        (self.0)(symbol)
    }
}

// =============================================================================
// Exchange capabilities
// =============================================================================

/// Point-in-time order book snapshot, best levels first.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookSnapshot {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

/// Raw market-data access. The engine layers caching, chunking and VWAP on
/// top of this; implementations only need to return candles.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Fetch up to `limit` candles of `interval` starting at `since`
    /// (epoch millis, inclusive), ordered by timestamp.
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        since: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<CandleData>>;

    /// Render a price for display. Default: two decimals.
    fn format_price(&self, _symbol: &str, price: f64) -> String {
        format!("{price:.2}")
    }

    /// Render a quantity for display. Default: eight decimals.
    fn format_quantity(&self, _symbol: &str, quantity: f64) -> String {
        format!("{quantity:.8}")
    }

    /// Optional order-book capability. Default: unsupported.
    async fn order_book(&self, _symbol: &str) -> anyhow::Result<Option<OrderBookSnapshot>> {
        Ok(None)
    }
}

// =============================================================================
// Risk capabilities
// =============================================================================

/// One risk rule. `check` returns `Ok(())` to allow; an `Err` rejects the
/// candidate signal. The rejection note is taken from [`Self::note`] when
/// set, otherwise from the error message.
pub trait RiskValidator: Send + Sync {
    fn check(&self, payload: &RiskCheckPayload) -> anyhow::Result<()>;

    /// Static rejection note attached to `risk` events from this validator.
    fn note(&self) -> Option<&str> {
        None
    }
}

/// Adapter turning a plain predicate into a [`RiskValidator`], optionally
/// carrying a static rejection note.
pub struct FnRiskValidator<F> {
    check: F,
    note: Option<String>,
}

impl<F> FnRiskValidator<F>
where
    F: Fn(&RiskCheckPayload) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(check: F) -> Self {
        Self { check, note: None }
    }

    pub fn with_note(check: F, note: impl Into<String>) -> Self {
        Self {
            check,
            note: Some(note.into()),
        }
    }
}

impl<F> RiskValidator for FnRiskValidator<F>
where
    F: Fn(&RiskCheckPayload) -> anyhow::Result<()> + Send + Sync,
{
    fn check(&self, payload: &RiskCheckPayload) -> anyhow::Result<()> {
        (self.check)(payload)
    }

    fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }
}

/// Observers on risk-gate decisions. All methods default to no-ops.
#[async_trait]
pub trait RiskCallbacks: Send + Sync {
    async fn on_rejected(&self, _payload: &RiskCheckPayload, _note: &str) {}

    async fn on_allowed(&self, _payload: &RiskCheckPayload) {}
}

/// The default risk callback set: observes nothing.
pub struct NoRiskCallbacks;

#[async_trait]
impl RiskCallbacks for NoRiskCallbacks {}

// =============================================================================
// Schema records
// =============================================================================

/// A named strategy: its signal source, cadence, callbacks and risk wiring.
#[derive(Clone)]
pub struct StrategySchema {
    pub name: String,
    /// Minimum spacing between `get_signal` invocations.
    pub interval: Interval,
    pub source: Arc<dyn SignalSource>,
    pub callbacks: Arc<dyn StrategyCallbacks>,
    /// Single risk profile, merged ahead of `risk_list` and de-duplicated.
    pub risk_name: Option<String>,
    pub risk_list: Vec<String>,
}

impl StrategySchema {
    pub fn new(name: impl Into<String>, interval: Interval, source: Arc<dyn SignalSource>) -> Self {
        Self {
            name: name.into(),
            interval,
            source,
            callbacks: Arc::new(NoStrategyCallbacks),
            risk_name: None,
            risk_list: Vec::new(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn StrategyCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_risk(mut self, risk_name: impl Into<String>) -> Self {
        self.risk_name = Some(risk_name.into());
        self
    }

    pub fn with_risk_list(mut self, risk_list: Vec<String>) -> Self {
        self.risk_list = risk_list;
        self
    }

    /// Referenced risk profiles in evaluation order, de-duplicated by name.
    pub fn risk_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        if let Some(primary) = &self.risk_name {
            names.push(primary.clone());
        }
        for name in &self.risk_list {
            if !names.iter().any(|n| n == name) {
                names.push(name.clone());
            }
        }
        names
    }
}

/// A named exchange: the adapter the engine pulls candles through.
#[derive(Clone)]
pub struct ExchangeSchema {
    pub name: String,
    pub adapter: Arc<dyn ExchangeAdapter>,
}

impl ExchangeSchema {
    pub fn new(name: impl Into<String>, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        Self {
            name: name.into(),
            adapter,
        }
    }
}

/// A named backtest timeframe window.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSchema {
    pub name: String,
    pub interval: Interval,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

/// A named risk profile: ordered validators plus optional observers.
#[derive(Clone)]
pub struct RiskSchema {
    pub name: String,
    pub validations: Vec<Arc<dyn RiskValidator>>,
    pub callbacks: Arc<dyn RiskCallbacks>,
}

impl RiskSchema {
    pub fn new(name: impl Into<String>, validations: Vec<Arc<dyn RiskValidator>>) -> Self {
        Self {
            name: name.into(),
            validations,
            callbacks: Arc::new(NoRiskCallbacks),
        }
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn RiskCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }
}

/// A named strategy tournament over a fixed exchange, frame and symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkerSchema {
    pub name: String,
    pub exchange_name: String,
    pub frame_name: String,
    /// Candidate strategies, evaluated sequentially in declared order.
    pub strategies: Vec<String>,
    /// The statistic to maximize. Higher is always better.
    pub metric: WalkerMetric,
}

// =============================================================================
// Partial overrides — update only the supplied fields of a registered schema
// =============================================================================

#[derive(Clone, Default)]
pub struct StrategyOverride {
    pub interval: Option<Interval>,
    pub source: Option<Arc<dyn SignalSource>>,
    pub callbacks: Option<Arc<dyn StrategyCallbacks>>,
    pub risk_name: Option<Option<String>>,
    pub risk_list: Option<Vec<String>>,
}

#[derive(Clone, Default)]
pub struct ExchangeOverride {
    pub adapter: Option<Arc<dyn ExchangeAdapter>>,
}

#[derive(Clone, Default)]
pub struct FrameOverride {
    pub interval: Option<Interval>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Clone, Default)]
pub struct RiskOverride {
    pub validations: Option<Vec<Arc<dyn RiskValidator>>>,
    pub callbacks: Option<Arc<dyn RiskCallbacks>>,
}

#[derive(Clone, Default)]
pub struct WalkerOverride {
    pub exchange_name: Option<String>,
    pub frame_name: Option<String>,
    pub strategies: Option<Vec<String>>,
    pub metric: Option<WalkerMetric>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    struct Flat;

    #[async_trait]
    impl SignalSource for Flat {
        async fn get_signal(&self, _symbol: &str) -> anyhow::Result<Option<SignalDto>> {
            Ok(None)
        }
    }

    #[test]
    fn risk_names_merge_and_dedupe() {
        let schema = StrategySchema::new("s", Interval::M1, Arc::new(Flat))
            .with_risk("shared")
            .with_risk_list(vec!["shared".into(), "tight".into(), "tight".into()]);
        assert_eq!(schema.risk_names(), vec!["shared", "tight"]);
    }

    #[test]
    fn risk_names_empty_without_wiring() {
        let schema = StrategySchema::new("s", Interval::M1, Arc::new(Flat));
        assert!(schema.risk_names().is_empty());
    }

    #[tokio::test]
    async fn fn_signal_source_adapts_closures() {
        let source = FnSignalSource(|_: &str| -> anyhow::Result<Option<SignalDto>> {
            Ok(Some(SignalDto {
                id: None,
                position: Side::Long,
                price_open: None,
                price_take_profit: 105.0,
                price_stop_loss: 95.0,
                minute_estimated_time: 60,
                note: None,
            }))
        });
        let dto = source.get_signal("BTCUSDT").await.unwrap();
        assert!(dto.is_some());
    }

    #[test]
    fn fn_risk_validator_carries_its_note() {
        let validator = FnRiskValidator::with_note(
            |_: &crate::risk::RiskCheckPayload| -> anyhow::Result<()> { Ok(()) },
            "portfolio cap",
        );
        assert_eq!(validator.note(), Some("portfolio cap"));
    }

    #[test]
    fn default_format_helpers() {
        struct Bare;

        #[async_trait]
        impl ExchangeAdapter for Bare {
            async fn fetch_candles(
                &self,
                _symbol: &str,
                _interval: Interval,
                _since: i64,
                _limit: usize,
            ) -> anyhow::Result<Vec<CandleData>> {
                Ok(Vec::new())
            }
        }

        let b = Bare;
        assert_eq!(b.format_price("BTCUSDT", 12345.6789), "12345.68");
        assert_eq!(b.format_quantity("BTCUSDT", 0.5), "0.50000000");
    }
}
