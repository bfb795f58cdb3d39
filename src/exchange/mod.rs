// =============================================================================
// ExchangeCore — cached, chunked candle access and the canonical price
// =============================================================================
//
// Layers the engine's market-data behavior over a pluggable adapter:
//   - cache-first candle reads with contiguity checking,
//   - request chunking above the per-request cap,
//   - window filtering and timestamp dedup (last write wins),
//   - VWAP over the last N one-minute candles as the engine's current price.
//
// The evaluation timestamp and mode come from the ambient ExecutionContext;
// nothing here reads the wall clock.
// =============================================================================

pub mod cache;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::{DataError, EngineResult};
use crate::exchange::cache::{CacheKey, CandleCache};
use crate::schema::ExchangeSchema;
use crate::types::{CandleData, Interval};

pub struct ExchangeCore {
    schema: Arc<ExchangeSchema>,
    cache: Arc<CandleCache>,
    config: Arc<EngineConfig>,
}

impl ExchangeCore {
    pub fn new(
        schema: Arc<ExchangeSchema>,
        cache: Arc<CandleCache>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            schema,
            cache,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    fn cache_key(&self, symbol: &str, interval: Interval) -> CacheKey {
        CacheKey {
            exchange: self.schema.name.clone(),
            symbol: symbol.to_string(),
            interval,
        }
    }

    // ── Candle reads ────────────────────────────────────────────────────

    /// The last `limit` candles of `interval` ending at the ambient `when`.
    pub async fn get_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> EngineResult<Vec<CandleData>> {
        let ctx = ExecutionContext::current()?;
        let step = interval.ms();
        let now = ctx.when;
        let since = now - limit as i64 * step;
        // One extra step of headroom so an in-progress candle at `now` is
        // kept by the window filter.
        let until = now + step;

        let key = self.cache_key(symbol, interval);
        if let Some(hit) = self.cache.get_exact_range(&key, since, until, limit) {
            debug!(key = %key, limit, "candle cache hit");
            return Ok(hit);
        }

        let mut fetched = self.fetch_chunked(symbol, interval, since, limit).await?;
        fetched.retain(|c| c.timestamp >= since && c.timestamp < until);
        let mut deduped = dedup_by_timestamp(fetched);

        if deduped.len() < limit {
            warn!(
                key = %key,
                requested = limit,
                received = deduped.len(),
                "exchange returned fewer candles than requested"
            );
        }
        if deduped.len() > limit {
            // Keep the most recent `limit` candles.
            deduped.drain(..deduped.len() - limit);
        }

        self.cache.insert_many(&key, &deduped);
        Ok(deduped)
    }

    /// Candles of `interval` covering `[start, stop)`. Used by the backtest
    /// fast-path.
    pub async fn get_range_candles(
        &self,
        symbol: &str,
        start: i64,
        stop: i64,
        interval: Interval,
    ) -> EngineResult<Vec<CandleData>> {
        let step = interval.ms();
        let limit = ((stop - start).max(0) / step) as usize;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let key = self.cache_key(symbol, interval);
        if let Some(hit) = self.cache.get_exact_range(&key, start, stop, limit) {
            debug!(key = %key, limit, "candle cache hit (range)");
            return Ok(hit);
        }

        let mut fetched = self.fetch_chunked(symbol, interval, start, limit).await?;
        fetched.retain(|c| c.timestamp >= start && c.timestamp < stop);
        let deduped = dedup_by_timestamp(fetched);

        if deduped.len() < limit {
            warn!(
                key = %key,
                requested = limit,
                received = deduped.len(),
                "exchange returned fewer candles than requested"
            );
        }

        self.cache.insert_many(&key, &deduped);
        Ok(deduped)
    }

    /// The next `count` candles of `interval` starting at `when`.
    pub async fn get_next_candles(
        &self,
        symbol: &str,
        interval: Interval,
        count: usize,
        when: i64,
    ) -> EngineResult<Vec<CandleData>> {
        let stop = when + count as i64 * interval.ms();
        self.get_range_candles(symbol, when, stop, interval).await
    }

    // ── Canonical price ─────────────────────────────────────────────────

    /// VWAP over the last `avg_price_candles_count` one-minute candles: the
    /// engine's canonical current price. Falls back to the mean close when
    /// the window traded no volume.
    pub async fn get_average_price(&self, symbol: &str) -> EngineResult<f64> {
        let candles = self
            .get_candles(symbol, Interval::M1, self.config.avg_price_candles_count)
            .await?;
        if candles.is_empty() {
            return Err(DataError::NoData {
                symbol: symbol.to_string(),
                context: "average price window".into(),
            }
            .into());
        }
        Ok(vwap(&candles))
    }

    // ── Formatting ──────────────────────────────────────────────────────

    pub fn format_price(&self, symbol: &str, price: f64) -> String {
        self.schema.adapter.format_price(symbol, price)
    }

    pub fn format_quantity(&self, symbol: &str, quantity: f64) -> String {
        self.schema.adapter.format_quantity(symbol, quantity)
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Fetch `limit` candles starting at `since`, splitting into chunks of
    /// at most `max_candles_per_request` and walking `since` forward.
    async fn fetch_chunked(
        &self,
        symbol: &str,
        interval: Interval,
        since: i64,
        limit: usize,
    ) -> EngineResult<Vec<CandleData>> {
        let step = interval.ms();
        let mut collected: Vec<CandleData> = Vec::with_capacity(limit);
        let mut cursor = since;
        let mut remaining = limit;

        while remaining > 0 {
            let take = remaining.min(self.config.max_candles_per_request);
            let batch = self
                .schema
                .adapter
                .fetch_candles(symbol, interval, cursor, take)
                .await
                .map_err(|source| DataError::Exchange {
                    symbol: symbol.to_string(),
                    source,
                })?;

            if batch.is_empty() {
                break;
            }
            let received = batch.len();
            cursor = batch.last().expect("non-empty batch").timestamp + step;
            collected.extend(batch);
            remaining = remaining.saturating_sub(received);
            if received < take {
                break;
            }
        }

        Ok(collected)
    }
}

/// Volume-weighted average of typical prices; mean close when the window
/// traded no volume.
pub fn vwap(candles: &[CandleData]) -> f64 {
    let total_volume: f64 = candles.iter().map(|c| c.volume).sum();
    if total_volume > 0.0 {
        let weighted: f64 = candles.iter().map(|c| c.typical_price() * c.volume).sum();
        weighted / total_volume
    } else {
        candles.iter().map(|c| c.close).sum::<f64>() / candles.len() as f64
    }
}

fn dedup_by_timestamp(candles: Vec<CandleData>) -> Vec<CandleData> {
    let mut ordered: std::collections::BTreeMap<i64, CandleData> = std::collections::BTreeMap::new();
    for candle in candles {
        ordered.insert(candle.timestamp, candle);
    }
    ordered.into_values().collect()
}

// =============================================================================
// Tests
// =============================================================================
