// =============================================================================
// Ambient contexts — which configuration to use, and where/when we are
// =============================================================================
//
// Both contexts are request-scoped: they are installed for the duration of a
// future via `tokio::task_local!` scopes and read anywhere down the call
// stack. Strategy, exchange and risk code can ask for the current symbol,
// timestamp and mode without threading parameters through every signature.
//
// There is deliberately no process-wide fallback: reading a context outside a
// scope is a `ConfigError::MissingContext`.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Which configuration objects an operation runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodContext {
    pub strategy_name: String,
    pub exchange_name: String,
    #[serde(default)]
    pub frame_name: Option<String>,
    #[serde(default)]
    pub walker_name: Option<String>,
}

impl MethodContext {
    pub fn new(strategy_name: impl Into<String>, exchange_name: impl Into<String>) -> Self {
        Self {
            strategy_name: strategy_name.into(),
            exchange_name: exchange_name.into(),
            frame_name: None,
            walker_name: None,
        }
    }

    pub fn with_frame(mut self, frame_name: impl Into<String>) -> Self {
        self.frame_name = Some(frame_name.into());
        self
    }

    pub fn with_walker(mut self, walker_name: impl Into<String>) -> Self {
        self.walker_name = Some(walker_name.into());
        self
    }
}

/// Where and when an evaluation is happening, and in which mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub symbol: String,
    /// Evaluation timestamp, epoch millis. Wall clock in live mode, a frame
    /// timestamp in backtest mode.
    pub when: i64,
    pub backtest: bool,
}

tokio::task_local! {
    static EXECUTION: ExecutionContext;
    static METHOD: MethodContext;
}

impl ExecutionContext {
    pub fn new(symbol: impl Into<String>, when: i64, backtest: bool) -> Self {
        Self {
            symbol: symbol.into(),
            when,
            backtest,
        }
    }

    /// Run `fut` with this context installed as the task-local ambient scope.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        EXECUTION.scope(self, fut).await
    }

    /// The context installed for the current task, if any.
    pub fn current() -> Result<Self, ConfigError> {
        EXECUTION
            .try_with(Clone::clone)
            .map_err(|_| ConfigError::MissingContext)
    }

    pub fn is_set() -> bool {
        EXECUTION.try_with(|_| ()).is_ok()
    }
}

impl MethodContext {
    /// Run `fut` with this context installed as the task-local ambient scope.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        METHOD.scope(self, fut).await
    }

    /// The context installed for the current task, if any.
    pub fn current() -> Result<Self, ConfigError> {
        METHOD
            .try_with(Clone::clone)
            .map_err(|_| ConfigError::MissingContext)
    }
}

// =============================================================================
// Tests
// =============================================================================
