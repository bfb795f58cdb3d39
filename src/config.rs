// =============================================================================
// Engine Configuration — tunable constants with atomic save
// =============================================================================
//
// Every numeric knob of the engine lives here. All fields carry
// `#[serde(default = "...")]` so that loading an older config file never
// breaks when new fields appear.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_avg_price_candles_count() -> usize {
    5
}

fn default_max_candles_per_request() -> usize {
    500
}

fn default_schedule_await_minutes() -> u64 {
    120
}

fn default_max_signal_lifetime_minutes() -> u64 {
    1440
}

fn default_min_takeprofit_distance_percent() -> f64 {
    0.3
}

fn default_max_stoploss_distance_percent() -> f64 {
    20.0
}

fn default_fee_percent() -> f64 {
    0.1
}

fn default_slippage_percent() -> f64 {
    0.1
}

fn default_tick_ttl_ms() -> u64 {
    60_001
}

fn default_persist_root() -> PathBuf {
    PathBuf::from("./persist")
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// VWAP window in 1-minute candles.
    #[serde(default = "default_avg_price_candles_count")]
    pub avg_price_candles_count: usize,

    /// Candle fetches above this size are split into chunks.
    #[serde(default = "default_max_candles_per_request")]
    pub max_candles_per_request: usize,

    /// How long a scheduled signal waits for its activation price before it
    /// is cancelled.
    #[serde(default = "default_schedule_await_minutes")]
    pub schedule_await_minutes: u64,

    /// Hard cap on a signal's `minute_estimated_time`.
    #[serde(default = "default_max_signal_lifetime_minutes")]
    pub max_signal_lifetime_minutes: u64,

    /// Take-profit must clear this distance from the entry price, in percent.
    /// Keeps TP above the round-trip fee cost.
    #[serde(default = "default_min_takeprofit_distance_percent")]
    pub min_takeprofit_distance_percent: f64,

    /// Stop-loss sanity cap: maximum distance from the entry price, percent.
    #[serde(default = "default_max_stoploss_distance_percent")]
    pub max_stoploss_distance_percent: f64,

    /// Exchange fee applied on entry and again on exit, in percent.
    #[serde(default = "default_fee_percent")]
    pub fee_percent: f64,

    /// Assumed slippage against the trader on each side, in percent.
    #[serde(default = "default_slippage_percent")]
    pub slippage_percent: f64,

    /// Live loop sleep between ticks. The extra millisecond over one minute
    /// avoids boundary aliasing with exactly-at-minute candle closes.
    #[serde(default = "default_tick_ttl_ms")]
    pub tick_ttl_ms: u64,

    /// Root directory for the default file-backed persistence adapter.
    #[serde(default = "default_persist_root")]
    pub persist_root: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            avg_price_candles_count: default_avg_price_candles_count(),
            max_candles_per_request: default_max_candles_per_request(),
            schedule_await_minutes: default_schedule_await_minutes(),
            max_signal_lifetime_minutes: default_max_signal_lifetime_minutes(),
            min_takeprofit_distance_percent: default_min_takeprofit_distance_percent(),
            max_stoploss_distance_percent: default_max_stoploss_distance_percent(),
            fee_percent: default_fee_percent(),
            slippage_percent: default_slippage_percent(),
            tick_ttl_ms: default_tick_ttl_ms(),
            persist_root: default_persist_root(),
        }
    }
}

impl EngineConfig {
    /// Schedule-await window in milliseconds.
    pub fn schedule_await_ms(&self) -> i64 {
        self.schedule_await_minutes as i64 * crate::types::MINUTE_MS
    }

    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(path = %path.display(), "engine config loaded");
        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
