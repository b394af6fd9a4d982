use super::moving_average::calculate_ema_series;
use crate::error::IndicatorError;

/// MACD line, signal line and histogram at the last price
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Calculate MACD (Moving Average Convergence Divergence)
///
/// - line = EMA(fast) - EMA(slow)
/// - signal = EMA(signal) of the line
/// - histogram = line - signal
///
/// Requires at least `slow + signal` prices.
pub fn calculate_macd(
    prices: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Result<Macd, IndicatorError> {
    if fast == 0 || signal == 0 || fast >= slow {
        return Err(IndicatorError::InvalidParameter {
            indicator: "MACD",
            reason: format!(
                "need 0 < fast < slow and signal > 0 (got {}/{}/{})",
                fast, slow, signal
            ),
        });
    }
    let required = slow + signal;
    if prices.len() < required {
        return Err(IndicatorError::insufficient("MACD", required, prices.len()));
    }

    let fast_ema = calculate_ema_series(prices, fast)?;
    let slow_ema = calculate_ema_series(prices, slow)?;

    // Both series end at the last price; align on the slow one
    let offset = slow - fast;
    let macd_line: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, slow_value)| fast_ema[i + offset] - slow_value)
        .collect();

    let signal_series = calculate_ema_series(&macd_line, signal)?;

    let line = *macd_line
        .last()
        .ok_or_else(|| IndicatorError::insufficient("MACD", required, prices.len()))?;
    let signal_value = *signal_series
        .last()
        .ok_or_else(|| IndicatorError::insufficient("MACD", required, prices.len()))?;

    Ok(Macd {
        line,
        signal: signal_value,
        histogram: line - signal_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macd_insufficient_data() {
        let prices: Vec<f64> = (0..34).map(|i| 100.0 + i as f64).collect();
        let err = calculate_macd(&prices, 12, 26, 9).unwrap_err();
        assert_eq!(err, IndicatorError::insufficient("MACD", 35, 34));
    }

    #[test]
    fn test_macd_constant_prices_is_zero() {
        let prices = vec![100.0; 60];
        let macd = calculate_macd(&prices, 12, 26, 9).unwrap();
        assert_eq!(macd.line, 0.0);
        assert_eq!(macd.signal, 0.0);
        assert_eq!(macd.histogram, 0.0);
    }

    #[test]
    fn test_macd_uptrend_positive() {
        let prices: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 2.0).collect();
        let macd = calculate_macd(&prices, 12, 26, 9).unwrap();
        assert!(macd.line > 0.0);
        assert!((macd.histogram - (macd.line - macd.signal)).abs() < 1e-12);
    }

    #[test]
    fn test_macd_downtrend_negative() {
        let prices: Vec<f64> = (0..60).map(|i| 300.0 - i as f64 * 2.0).collect();
        let macd = calculate_macd(&prices, 12, 26, 9).unwrap();
        assert!(macd.line < 0.0);
    }

    #[test]
    fn test_macd_rejects_inverted_periods() {
        let prices = vec![100.0; 60];
        assert!(matches!(
            calculate_macd(&prices, 26, 12, 9),
            Err(IndicatorError::InvalidParameter { .. })
        ));
    }
}
