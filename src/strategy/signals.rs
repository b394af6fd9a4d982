use super::{Strategy, StrategyParams};
use crate::models::{Conviction, IndicatorSnapshot, SignalKind};

/// Default strategy: RSI bands plus MACD and moving-average crossovers
///
/// Buy votes:
/// - RSI below the oversold band
/// - MACD line crosses above its signal line
/// - Short MA crosses above long MA
///
/// Sell votes mirror these. A buy is strong when RSI is oversold, MACD is
/// above signal and short MA is above long MA all at once (and vice versa
/// for sells). Conflicting votes cancel out to Hold.
#[derive(Debug, Clone, Default)]
pub struct IndicatorCrossStrategy;

impl IndicatorCrossStrategy {
    pub fn new() -> Self {
        Self
    }
}

fn crossed_above(current_a: f64, current_b: f64, previous_a: f64, previous_b: f64) -> bool {
    current_a > current_b && previous_a <= previous_b
}

fn crossed_below(current_a: f64, current_b: f64, previous_a: f64, previous_b: f64) -> bool {
    current_a < current_b && previous_a >= previous_b
}

impl Strategy for IndicatorCrossStrategy {
    fn decide(
        &self,
        current: &IndicatorSnapshot,
        previous: &IndicatorSnapshot,
        params: &StrategyParams,
    ) -> (SignalKind, Conviction) {
        let oversold = current.rsi < params.rsi_oversold;
        let overbought = current.rsi > params.rsi_overbought;

        let macd_up = crossed_above(
            current.macd_line,
            current.macd_signal,
            previous.macd_line,
            previous.macd_signal,
        );
        let macd_down = crossed_below(
            current.macd_line,
            current.macd_signal,
            previous.macd_line,
            previous.macd_signal,
        );

        let ma_up = crossed_above(
            current.moving_average_short,
            current.moving_average_20d,
            previous.moving_average_short,
            previous.moving_average_20d,
        );
        let ma_down = crossed_below(
            current.moving_average_short,
            current.moving_average_20d,
            previous.moving_average_short,
            previous.moving_average_20d,
        );

        let strong_buy = oversold
            && current.macd_line > current.macd_signal
            && current.moving_average_short > current.moving_average_20d;
        let strong_sell = overbought
            && current.macd_line < current.macd_signal
            && current.moving_average_short < current.moving_average_20d;

        if strong_buy {
            return (SignalKind::Buy, Conviction::Strong);
        }
        if strong_sell {
            return (SignalKind::Sell, Conviction::Strong);
        }

        let buy = oversold || macd_up || ma_up;
        let sell = overbought || macd_down || ma_down;

        match (buy, sell) {
            (true, false) => (SignalKind::Buy, Conviction::Normal),
            (false, true) => (SignalKind::Sell, Conviction::Normal),
            _ => (SignalKind::Hold, Conviction::Normal),
        }
    }

    fn name(&self) -> &str {
        "IndicatorCrossStrategy"
    }
}
