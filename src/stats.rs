// =============================================================================
// Backtest statistics — per-trade accumulation and walker metrics
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::signal::ClosedSignal;

/// Cap applied to profit factor when there are no losing trades.
/// Avoids `f64::INFINITY`, which is not valid JSON.
const MAX_PROFIT_FACTOR: f64 = 999.99;

/// Aggregate statistics over the closed trades of one backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestStats {
    pub trade_count: usize,
    pub wins: usize,
    pub losses: usize,
    /// Fraction of trades with non-negative net PnL, in [0, 1].
    pub win_rate: f64,
    /// Sum of per-trade net PnL percentages.
    pub total_pnl_percent: f64,
    pub avg_pnl_percent: f64,
    /// Gross profit over gross loss, capped at 999.99.
    pub profit_factor: f64,
    /// Mean over standard deviation of per-trade returns; 0 when undefined.
    pub sharpe_ratio: f64,
    /// Deepest peak-to-trough drop of the cumulative PnL curve, percent.
    pub max_drawdown_percent: f64,
}

impl Default for BacktestStats {
    fn default() -> Self {
        Self {
            trade_count: 0,
            wins: 0,
            losses: 0,
            win_rate: 0.0,
            total_pnl_percent: 0.0,
            avg_pnl_percent: 0.0,
            profit_factor: 0.0,
            sharpe_ratio: 0.0,
            max_drawdown_percent: 0.0,
        }
    }
}

/// The statistic a walker maximizes. Higher is always better for every
/// member of this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WalkerMetric {
    SharpeRatio,
    TotalPnl,
    WinRate,
    ProfitFactor,
}

impl Default for WalkerMetric {
    fn default() -> Self {
        Self::SharpeRatio
    }
}

impl WalkerMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SharpeRatio => "sharpeRatio",
            Self::TotalPnl => "totalPnl",
            Self::WinRate => "winRate",
            Self::ProfitFactor => "profitFactor",
        }
    }

    pub fn extract(self, stats: &BacktestStats) -> f64 {
        match self {
            Self::SharpeRatio => stats.sharpe_ratio,
            Self::TotalPnl => stats.total_pnl_percent,
            Self::WinRate => stats.win_rate,
            Self::ProfitFactor => stats.profit_factor,
        }
    }
}

impl std::fmt::Display for WalkerMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collects per-trade results and turns them into [`BacktestStats`].
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    pnls: Vec<f64>,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.pnls.clear();
    }

    pub fn record(&mut self, closed: &ClosedSignal) {
        self.pnls.push(closed.pnl_percent);
    }

    pub fn record_pnl(&mut self, pnl_percent: f64) {
        self.pnls.push(pnl_percent);
    }

    pub fn trade_count(&self) -> usize {
        self.pnls.len()
    }

    pub fn compute(&self) -> BacktestStats {
        if self.pnls.is_empty() {
            return BacktestStats::default();
        }

        let n = self.pnls.len();
        let wins = self.pnls.iter().filter(|p| **p >= 0.0).count();
        let losses = n - wins;

        let total: f64 = self.pnls.iter().sum();
        let mean = total / n as f64;

        let gross_profit: f64 = self.pnls.iter().filter(|p| **p > 0.0).sum();
        let gross_loss: f64 = self.pnls.iter().filter(|p| **p < 0.0).map(|p| p.abs()).sum();
        let profit_factor = if gross_loss > 0.0 {
            (gross_profit / gross_loss).min(MAX_PROFIT_FACTOR)
        } else if gross_profit > 0.0 {
            MAX_PROFIT_FACTOR
        } else {
            0.0
        };

        let sharpe_ratio = {
            let std = std_dev(&self.pnls, mean);
            if std > 0.0 {
                mean / std
            } else {
                0.0
            }
        };

        // Drawdown over the cumulative PnL curve.
        let mut equity = 0.0_f64;
        let mut peak = 0.0_f64;
        let mut max_drawdown = 0.0_f64;
        for pnl in &self.pnls {
            equity += pnl;
            if equity > peak {
                peak = equity;
            }
            let drawdown = peak - equity;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }
        }

        BacktestStats {
            trade_count: n,
            wins,
            losses,
            win_rate: wins as f64 / n as f64,
            total_pnl_percent: total,
            avg_pnl_percent: mean,
            profit_factor,
            sharpe_ratio,
            max_drawdown_percent: max_drawdown,
        }
    }
}

/// Sample standard deviation; 0 for fewer than two samples.
fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

// =============================================================================
// Tests
// =============================================================================
