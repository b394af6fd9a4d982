// Trading strategy module
pub mod signals;

pub use signals::IndicatorCrossStrategy;

use serde::{Deserialize, Serialize};

use crate::models::{Conviction, IndicatorSnapshot, SignalKind};

/// Tunable strategy parameters, loaded from configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StrategyParams {
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub ma_short: usize,
    pub ma_long: usize,
    pub bollinger_period: usize,
    pub bollinger_k: f64,
    /// Candle resolution in minutes (1440 = daily)
    pub candle_interval_minutes: u32,
    pub candle_count: usize,
    /// Fraction of `max_investment_per_trade` spent on a normal buy
    pub buy_fraction: f64,
    /// Fraction of `max_investment_per_trade` spent on a strong buy
    pub strong_buy_fraction: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            ma_short: 5,
            ma_long: 20,
            bollinger_period: 20,
            bollinger_k: 2.0,
            candle_interval_minutes: 60,
            candle_count: 200,
            buy_fraction: 0.5,
            strong_buy_fraction: 1.0,
        }
    }
}

impl StrategyParams {
    /// Candles needed for one snapshot (longest indicator window)
    pub fn snapshot_window(&self) -> usize {
        [
            self.rsi_period + 1,
            self.macd_slow + self.macd_signal,
            self.bollinger_period,
            self.ma_short,
            self.ma_long,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    /// Candles needed to evaluate a signal (current + previous snapshot)
    pub fn min_candles_required(&self) -> usize {
        self.snapshot_window() + 1
    }
}

/// Pluggable signal-combination function.
///
/// Implementations are pure: the same snapshots and parameters always
/// produce the same decision.
pub trait Strategy: Send + Sync {
    /// Combine the latest and previous indicator snapshots into a decision
    fn decide(
        &self,
        current: &IndicatorSnapshot,
        previous: &IndicatorSnapshot,
        params: &StrategyParams,
    ) -> (SignalKind, Conviction);

    /// Get strategy name
    fn name(&self) -> &str;
}
