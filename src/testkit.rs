// =============================================================================
// Shared test fixtures: scripted exchanges, canned strategies, recorders
// =============================================================================

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::schema::{ExchangeAdapter, SignalSource, StrategyCallbacks};
use crate::signal::{CancelledSignal, ClosedSignal, Signal, SignalDto};
use crate::types::{CandleData, Interval, Side};

/// Common test epoch, aligned to a minute boundary.
pub const T0: i64 = 1_701_000_000_000;

pub fn flat_candle(timestamp: i64, price: f64) -> CandleData {
    CandleData {
        timestamp,
        open: price,
        high: price,
        low: price,
        close: price,
        volume: 1.0,
    }
}

pub fn candle(timestamp: i64, open: f64, high: f64, low: f64, close: f64) -> CandleData {
    CandleData {
        timestamp,
        open,
        high,
        low,
        close,
        volume: 1.0,
    }
}

pub fn long_dto(tp: f64, sl: f64, minutes: u64) -> SignalDto {
    SignalDto {
        id: None,
        position: Side::Long,
        price_open: None,
        price_take_profit: tp,
        price_stop_loss: sl,
        minute_estimated_time: minutes,
        note: None,
    }
}

pub fn short_dto(tp: f64, sl: f64, minutes: u64) -> SignalDto {
    SignalDto {
        id: None,
        position: Side::Short,
        price_open: None,
        price_take_profit: tp,
        price_stop_loss: sl,
        minute_estimated_time: minutes,
        note: None,
    }
}

// =============================================================================
// PathExchange — price as a function of time, flat candles
// =============================================================================

/// Serves flat candles whose price follows a function of the candle
/// timestamp. Covers all of time; useful when only closes matter.
pub struct PathExchange {
    price: Box<dyn Fn(i64) -> f64 + Send + Sync>,
    pub fetches: AtomicUsize,
}

impl PathExchange {
    pub fn new(price: impl Fn(i64) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            price: Box::new(price),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn constant(price: f64) -> Self {
        Self::new(move |_| price)
    }
}

#[async_trait]
impl ExchangeAdapter for PathExchange {
    async fn fetch_candles(
        &self,
        _symbol: &str,
        interval: Interval,
        since: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<CandleData>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let step = interval.ms();
        Ok((0..limit as i64)
            .map(|i| {
                let ts = since + i * step;
                flat_candle(ts, (self.price)(ts))
            })
            .collect())
    }
}

/// A price path that is `before` up to (exclusive) `at`, then `after`.
pub fn step_path(before: f64, after: f64, at: i64) -> impl Fn(i64) -> f64 + Send + Sync {
    move |ts| if ts < at { before } else { after }
}

// =============================================================================
// Signal sources
// =============================================================================

/// Returns the canned signal on the first call, `None` afterwards.
pub struct OnceSignal {
    dto: SignalDto,
    served: AtomicBool,
    pub calls: AtomicUsize,
}

impl OnceSignal {
    pub fn new(dto: SignalDto) -> Self {
        Self {
            dto,
            served: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalSource for OnceSignal {
    async fn get_signal(&self, _symbol: &str) -> anyhow::Result<Option<SignalDto>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.served.swap(true, Ordering::SeqCst) {
            Ok(None)
        } else {
            Ok(Some(self.dto.clone()))
        }
    }
}

/// Returns the canned signal on every call.
pub struct AlwaysSignal {
    dto: SignalDto,
    pub calls: AtomicUsize,
}

impl AlwaysSignal {
    pub fn new(dto: SignalDto) -> Self {
        Self {
            dto,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalSource for AlwaysSignal {
    async fn get_signal(&self, _symbol: &str) -> anyhow::Result<Option<SignalDto>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(self.dto.clone()))
    }
}

/// Never signals.
pub struct NeverSignal;

#[async_trait]
impl SignalSource for NeverSignal {
    async fn get_signal(&self, _symbol: &str) -> anyhow::Result<Option<SignalDto>> {
        Ok(None)
    }
}

// =============================================================================
// RecordingCallbacks — captures lifecycle notifications in order
// =============================================================================

#[derive(Default)]
pub struct RecordingCallbacks {
    pub events: Mutex<Vec<String>>,
}

impl RecordingCallbacks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl StrategyCallbacks for RecordingCallbacks {
    async fn on_schedule(&self, signal: &Signal) {
        self.events.lock().push(format!("schedule:{}", signal.id));
    }

    async fn on_open(&self, signal: &Signal) {
        self.events.lock().push(format!("open:{}", signal.id));
    }

    async fn on_active(&self, signal: &Signal) {
        self.events.lock().push(format!("active:{}", signal.id));
    }

    async fn on_close(&self, closed: &ClosedSignal) {
        self.events
            .lock()
            .push(format!("close:{}:{}", closed.signal.id, closed.reason));
    }

    async fn on_cancel(&self, cancelled: &CancelledSignal) {
        self.events
            .lock()
            .push(format!("cancel:{}:{}", cancelled.signal.id, cancelled.reason));
    }
}
