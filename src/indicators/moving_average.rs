use crate::error::IndicatorError;

/// Calculate Simple Moving Average (SMA) over the trailing `period` prices
pub fn calculate_sma(prices: &[f64], period: usize) -> Result<f64, IndicatorError> {
    if period == 0 {
        return Err(IndicatorError::InvalidParameter {
            indicator: "SMA",
            reason: "period must be positive".to_string(),
        });
    }
    if prices.len() < period {
        return Err(IndicatorError::insufficient("SMA", period, prices.len()));
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Ok(sum / period as f64)
}

/// Calculate Exponential Moving Average (EMA) at the last price
pub fn calculate_ema(prices: &[f64], period: usize) -> Result<f64, IndicatorError> {
    let series = calculate_ema_series(prices, period)?;
    series
        .last()
        .copied()
        .ok_or_else(|| IndicatorError::insufficient("EMA", period, prices.len()))
}

/// EMA values from index `period - 1` onwards.
///
/// Seeded with the SMA of the first `period` prices, then smoothed with
/// `2 / (period + 1)`. The returned vector has `prices.len() - period + 1`
/// entries.
pub fn calculate_ema_series(prices: &[f64], period: usize) -> Result<Vec<f64>, IndicatorError> {
    if period == 0 {
        return Err(IndicatorError::InvalidParameter {
            indicator: "EMA",
            reason: "period must be positive".to_string(),
        });
    }
    if prices.len() < period {
        return Err(IndicatorError::insufficient("EMA", period, prices.len()));
    }

    let multiplier = 2.0 / (period as f64 + 1.0);

    // Start with SMA
    let initial_sma = calculate_sma(&prices[0..period], period)?;

    let mut series = Vec::with_capacity(prices.len() - period + 1);
    let mut ema = initial_sma;
    series.push(ema);
    for price in &prices[period..] {
        ema = (price - ema) * multiplier + ema;
        series.push(ema);
    }

    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0];
        assert_eq!(calculate_sma(&prices, 5).unwrap(), 104.0);
        // Trailing window only
        assert_eq!(calculate_sma(&prices, 2).unwrap(), 107.0);
    }

    #[test]
    fn test_sma_insufficient_data() {
        let prices = vec![100.0, 102.0];
        let err = calculate_sma(&prices, 5).unwrap_err();
        assert_eq!(err, IndicatorError::insufficient("SMA", 5, 2));
    }

    #[test]
    fn test_ema() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0, 110.0];
        let ema = calculate_ema(&prices, 5).unwrap();
        // Seed SMA = 104, then (110 - 104) / 3 + 104
        assert!((ema - 106.0).abs() < 1e-9);
    }

    #[test]
    fn test_ema_series_length() {
        let prices: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let series = calculate_ema_series(&prices, 10).unwrap();
        assert_eq!(series.len(), 21);
        assert_eq!(series[0], 4.5);
    }

    #[test]
    fn test_ema_constant_series() {
        let prices = vec![50.0; 12];
        assert_eq!(calculate_ema(&prices, 4).unwrap(), 50.0);
    }
}
