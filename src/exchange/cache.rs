// =============================================================================
// Candle Cache — shared per-(exchange, symbol, interval) candle storage
// =============================================================================
//
// One ordered series per key. Writes are serialized per key and deduplicate
// by timestamp with last-write-wins; reads only take the outer map lock
// briefly to find the series. Each series is trimmed from the oldest end once
// it grows past the retention cap.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{CandleData, Interval};

/// Closed candles retained per series before the oldest are evicted.
const MAX_RETAINED_CANDLES: usize = 50_000;

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct CacheKey {
    pub exchange: String,
    pub symbol: String,
    pub interval: Interval,
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.exchange, self.symbol, self.interval)
    }
}

type Series = Arc<RwLock<BTreeMap<i64, CandleData>>>;

pub struct CandleCache {
    series: RwLock<HashMap<CacheKey, Series>>,
}

impl CandleCache {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }

    fn series_for(&self, key: &CacheKey) -> Series {
        if let Some(existing) = self.series.read().get(key) {
            return Arc::clone(existing);
        }
        let mut map = self.series.write();
        Arc::clone(
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new()))),
        )
    }

    /// A contiguous run of exactly `limit` candles in `[since, until)`,
    /// starting at `since` and stepped by the key's interval. `None` on any
    /// gap or shortfall.
    pub fn get_exact_range(
        &self,
        key: &CacheKey,
        since: i64,
        until: i64,
        limit: usize,
    ) -> Option<Vec<CandleData>> {
        let series = self.series_for(key);
        let guard = series.read();
        let step = key.interval.ms();

        let slice: Vec<CandleData> = guard.range(since..until).map(|(_, c)| c.clone()).collect();
        if slice.len() != limit || limit == 0 {
            return None;
        }
        if slice[0].timestamp != since {
            return None;
        }
        for window in slice.windows(2) {
            if window[1].timestamp - window[0].timestamp != step {
                return None;
            }
        }
        Some(slice)
    }

    /// Merge `candles` into the series, deduplicating by timestamp with
    /// last-write-wins, then trim the oldest entries past the retention cap.
    pub fn insert_many(&self, key: &CacheKey, candles: &[CandleData]) {
        if candles.is_empty() {
            return;
        }
        let series = self.series_for(key);
        let mut guard = series.write();
        for candle in candles {
            guard.insert(candle.timestamp, candle.clone());
        }
        while guard.len() > MAX_RETAINED_CANDLES {
            let oldest = *guard.keys().next().expect("non-empty series");
            guard.remove(&oldest);
        }
    }

    /// Number of candles stored for `key`.
    pub fn len(&self, key: &CacheKey) -> usize {
        self.series.read().get(key).map_or(0, |s| s.read().len())
    }

    pub fn is_empty(&self, key: &CacheKey) -> bool {
        self.len(key) == 0
    }
}

impl Default for CandleCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MINUTE_MS;

    fn key() -> CacheKey {
        CacheKey {
            exchange: "mockex".into(),
            symbol: "BTCUSDT".into(),
            interval: Interval::M1,
        }
    }

    fn candle(ts: i64, close: f64) -> CandleData {
        CandleData {
            timestamp: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn exact_range_hit() {
        let cache = CandleCache::new();
        let k = key();
        let candles: Vec<_> = (0..5).map(|i| candle(i * MINUTE_MS, 100.0)).collect();
        cache.insert_many(&k, &candles);

        let hit = cache.get_exact_range(&k, 0, 5 * MINUTE_MS, 5).unwrap();
        assert_eq!(hit.len(), 5);
        assert_eq!(hit[0].timestamp, 0);
    }

    #[test]
    fn gap_misses() {
        let cache = CandleCache::new();
        let k = key();
        // Candle at minute 2 is missing.
        let candles = vec![
            candle(0, 100.0),
            candle(MINUTE_MS, 100.0),
            candle(3 * MINUTE_MS, 100.0),
            candle(4 * MINUTE_MS, 100.0),
        ];
        cache.insert_many(&k, &candles);
        assert!(cache.get_exact_range(&k, 0, 5 * MINUTE_MS, 4).is_none());
    }

    #[test]
    fn shortfall_misses() {
        let cache = CandleCache::new();
        let k = key();
        cache.insert_many(&k, &[candle(0, 100.0)]);
        assert!(cache.get_exact_range(&k, 0, 5 * MINUTE_MS, 5).is_none());
    }

    #[test]
    fn wrong_start_misses() {
        let cache = CandleCache::new();
        let k = key();
        let candles: Vec<_> = (1..6).map(|i| candle(i * MINUTE_MS, 100.0)).collect();
        cache.insert_many(&k, &candles);
        // Five contiguous candles exist in range but the first is not at
        // `since`.
        assert!(cache.get_exact_range(&k, 0, 6 * MINUTE_MS, 5).is_none());
    }

    #[test]
    fn dedup_last_write_wins() {
        let cache = CandleCache::new();
        let k = key();
        cache.insert_many(&k, &[candle(0, 100.0)]);
        cache.insert_many(&k, &[candle(0, 101.0)]);

        assert_eq!(cache.len(&k), 1);
        let hit = cache.get_exact_range(&k, 0, MINUTE_MS, 1).unwrap();
        assert!((hit[0].close - 101.0).abs() < f64::EPSILON);
    }

    #[test]
    fn keys_are_isolated() {
        let cache = CandleCache::new();
        let k1 = key();
        let k2 = CacheKey {
            symbol: "ETHUSDT".into(),
            ..key()
        };
        cache.insert_many(&k1, &[candle(0, 100.0)]);
        assert_eq!(cache.len(&k1), 1);
        assert!(cache.is_empty(&k2));
    }
}
