//! Market analyzer: candles + current price -> signal and stop-loss verdict.
//!
//! Pure over its inputs. It never touches a position or places orders.

use chrono::Utc;
use std::sync::Arc;

use crate::error::IndicatorError;
use crate::execution::{Position, PositionStatus};
use crate::indicators::{calculate_bollinger, calculate_macd, calculate_rsi, calculate_sma, closes};
use crate::models::{Candle, IndicatorSnapshot, Signal};
use crate::risk::RiskConfig;
use crate::strategy::{Strategy, StrategyParams};

/// Stop-loss evaluation for an open position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopLossCheck {
    /// (entry - current) / entry
    pub loss_pct: f64,
    /// (highest - current) / highest
    pub drawdown_from_high_pct: f64,
    pub flat_stop_hit: bool,
    pub trail_stop_hit: bool,
}

impl StopLossCheck {
    pub fn triggered(&self) -> bool {
        self.flat_stop_hit || self.trail_stop_hit
    }
}

/// Output of one analysis tick
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub signal: Signal,
    pub stop_loss: Option<StopLossCheck>,
}

impl Evaluation {
    pub fn stop_loss_triggered(&self) -> bool {
        self.stop_loss.map(|s| s.triggered()).unwrap_or(false)
    }
}

/// Compute stop-loss fractions for a position at `current_price`.
///
/// Triggers when loss from entry reaches `stop_loss_percent` or the
/// drawdown from the post-entry high reaches `stop_loss_percent_high`.
pub fn check_stop_loss(position: &Position, current_price: f64, risk: &RiskConfig) -> StopLossCheck {
    let loss_pct = if position.entry_price > 0.0 {
        (position.entry_price - current_price) / position.entry_price
    } else {
        0.0
    };
    let drawdown_from_high_pct = if position.highest_price_since_entry > 0.0 {
        (position.highest_price_since_entry - current_price) / position.highest_price_since_entry
    } else {
        0.0
    };

    StopLossCheck {
        loss_pct,
        drawdown_from_high_pct,
        flat_stop_hit: loss_pct >= risk.stop_loss_fraction(),
        trail_stop_hit: drawdown_from_high_pct >= risk.stop_loss_high_fraction(),
    }
}

/// Indicator snapshot at the last of `prices`
pub fn compute_snapshot(
    prices: &[f64],
    params: &StrategyParams,
) -> Result<IndicatorSnapshot, IndicatorError> {
    let rsi = calculate_rsi(prices, params.rsi_period)?;
    let macd = calculate_macd(prices, params.macd_fast, params.macd_slow, params.macd_signal)?;
    let bands = calculate_bollinger(prices, params.bollinger_period, params.bollinger_k)?;
    let ma_short = calculate_sma(prices, params.ma_short)?;
    let ma_long = calculate_sma(prices, params.ma_long)?;

    Ok(IndicatorSnapshot {
        rsi,
        macd_line: macd.line,
        macd_signal: macd.signal,
        macd_histogram: macd.histogram,
        bollinger_upper: bands.upper,
        bollinger_lower: bands.lower,
        moving_average_short: ma_short,
        moving_average_20d: ma_long,
    })
}

#[derive(Clone)]
pub struct Analyzer {
    strategy: Arc<dyn Strategy>,
    risk: RiskConfig,
}

impl Analyzer {
    pub fn new(strategy: Arc<dyn Strategy>, risk: RiskConfig) -> Self {
        Self { strategy, risk }
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Evaluate one market.
    ///
    /// `position` is only consulted for the stop-loss check; pass `None`
    /// (or a flat position) when nothing is held.
    pub fn evaluate(
        &self,
        market: &str,
        candles: &[Candle],
        current_price: f64,
        params: &StrategyParams,
        position: Option<&Position>,
    ) -> Result<Evaluation, IndicatorError> {
        let required = params.min_candles_required();
        if candles.len() < required {
            return Err(IndicatorError::insufficient(
                "analyzer",
                required,
                candles.len(),
            ));
        }

        let prices = closes(candles);
        let current = compute_snapshot(&prices, params)?;
        let previous = compute_snapshot(&prices[..prices.len() - 1], params)?;

        let (kind, conviction) = self.strategy.decide(&current, &previous, params);

        let stop_loss = position
            .filter(|p| matches!(p.status, PositionStatus::Long | PositionStatus::Exiting))
            .map(|p| check_stop_loss(p, current_price, &self.risk));

        tracing::debug!(
            market,
            ?kind,
            rsi = current.rsi,
            macd_hist = current.macd_histogram,
            "Evaluated market"
        );

        Ok(Evaluation {
            signal: Signal {
                market: market.to_string(),
                timestamp: Utc::now(),
                kind,
                conviction,
                price: current_price,
                basis: current,
            },
            stop_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Conviction, SignalKind};
    use crate::strategy::IndicatorCrossStrategy;
    use chrono::Duration;

    fn candles_from(prices: &[f64]) -> Vec<Candle> {
        let start = Utc::now() - Duration::hours(prices.len() as i64);
        prices
            .iter()
            .enumerate()
            .map(|(i, &price)| Candle {
                market: "KRW-BTC".to_string(),
                open_time: start + Duration::hours(i as i64),
                open: price,
                high: price * 1.01,
                low: price * 0.99,
                close: price,
                volume: 1_000.0,
            })
            .collect()
    }

    fn long_position(entry: f64, high: f64) -> Position {
        Position {
            market: "KRW-BTC".to_string(),
            status: PositionStatus::Long,
            entry_price: entry,
            quantity: 1.0,
            highest_price_since_entry: high,
            entered_at: Some(Utc::now()),
        }
    }

    fn analyzer() -> Analyzer {
        Analyzer::new(Arc::new(IndicatorCrossStrategy::new()), RiskConfig::default())
    }

    #[test]
    fn test_trail_stop_binds_before_flat_stop() {
        let position = long_position(100.0, 120.0);
        let check = check_stop_loss(&position, 97.9, &RiskConfig::default());

        assert!((check.loss_pct - 0.021).abs() < 1e-9);
        assert!((check.drawdown_from_high_pct - 0.18416666).abs() < 1e-6);
        assert!(!check.flat_stop_hit);
        assert!(check.trail_stop_hit);
        assert!(check.triggered());
    }

    #[test]
    fn test_flat_stop_triggers() {
        let position = long_position(100.0, 100.0);
        let check = check_stop_loss(&position, 96.0, &RiskConfig::default());
        assert!(check.flat_stop_hit);
    }

    #[test]
    fn test_no_stop_near_high() {
        let position = long_position(100.0, 110.0);
        let check = check_stop_loss(&position, 109.0, &RiskConfig::default());
        assert!(!check.triggered());
    }

    #[test]
    fn test_evaluate_insufficient_data() {
        let candles = candles_from(&[100.0; 10]);
        let result = analyzer().evaluate(
            "KRW-BTC",
            &candles,
            100.0,
            &StrategyParams::default(),
            None,
        );
        assert!(matches!(
            result,
            Err(IndicatorError::InsufficientData { required: 36, available: 10, .. })
        ));
    }

    #[test]
    fn test_evaluate_flat_market_holds() {
        let candles = candles_from(&[100.0; 60]);
        let evaluation = analyzer()
            .evaluate("KRW-BTC", &candles, 100.0, &StrategyParams::default(), None)
            .unwrap();

        assert_eq!(evaluation.signal.kind, SignalKind::Hold);
        assert_eq!(evaluation.signal.basis.rsi, 50.0);
        assert!(!evaluation.stop_loss_triggered());
        assert!(evaluation.stop_loss.is_none());
    }

    #[test]
    fn test_evaluate_crash_is_oversold_buy() {
        // Accelerating decline: RSI pinned at 0, MACD stays below its signal
        let prices: Vec<f64> = (0..60).map(|i| 1_000.0 - 0.2 * (i * i) as f64).collect();
        let candles = candles_from(&prices);
        let evaluation = analyzer()
            .evaluate("KRW-BTC", &candles, 300.0, &StrategyParams::default(), None)
            .unwrap();

        assert!(evaluation.signal.basis.rsi < 30.0);
        assert!(evaluation.signal.basis.macd_line < evaluation.signal.basis.macd_signal);
        assert_eq!(evaluation.signal.kind, SignalKind::Buy);
        assert_eq!(evaluation.signal.conviction, Conviction::Normal);
    }

    #[test]
    fn test_evaluate_reports_stop_loss_for_long() {
        let candles = candles_from(&[100.0; 60]);
        let position = long_position(100.0, 120.0);
        let evaluation = analyzer()
            .evaluate(
                "KRW-BTC",
                &candles,
                97.9,
                &StrategyParams::default(),
                Some(&position),
            )
            .unwrap();

        assert!(evaluation.stop_loss_triggered());
    }
}
