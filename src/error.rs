// =============================================================================
// Error taxonomy — every recoverable and fatal failure family of the engine
// =============================================================================
//
// Handling policy:
//   - ConfigError    : surfaced, fatal to the call that caused it.
//   - ValidationError: logged + `error` topic, the signal is dropped.
//   - DataError      : logged + `error` topic; live sleeps and retries,
//                      backtest skips the frame.
//   - PersistenceError: emitted on `error`; the next write attempts recovery,
//                      startup read failures are treated as absent records.
//
// Risk rejections are not errors and never appear here; they travel on the
// `risk` topic.
// =============================================================================

use thiserror::Error;

/// Schema and wiring problems. Fatal to the operation that triggered them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate {kind} schema: {name}")]
    DuplicateName { kind: &'static str, name: String },

    #[error("unknown {kind} schema: {name}")]
    UnknownName { kind: &'static str, name: String },

    #[error("invalid {field} in {kind} schema {name}: {reason}")]
    InvalidField {
        kind: &'static str,
        name: String,
        field: &'static str,
        reason: String,
    },

    #[error("no execution context in scope")]
    MissingContext,
}

/// A signal failed one or more of the acceptance rules. Problems are
/// collected so the emitter sees every violation at once, not just the first.
#[derive(Debug, Error)]
#[error("signal rejected for {symbol}/{strategy_name}: {}", problems.join("; "))]
pub struct ValidationError {
    pub symbol: String,
    pub strategy_name: String,
    pub problems: Vec<String>,
}

/// Market-data trouble: empty responses, undefined VWAP, adapter failures.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("no candle data for {symbol} ({context})")]
    NoData { symbol: String, context: String },

    #[error("exchange adapter failed for {symbol}: {source}")]
    Exchange {
        symbol: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Stable-storage trouble around the signal persistence files.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence {op} failed at {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt persistence record at {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode persistence record for {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level error for the public surface.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub type EngineResult<T> = Result<T, EngineError>;
