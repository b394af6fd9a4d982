use super::moving_average::calculate_sma;
use crate::error::IndicatorError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Calculate Bollinger Bands: SMA(period) +/- k * standard deviation
///
/// Uses the population standard deviation of the trailing `period` prices.
pub fn calculate_bollinger(
    prices: &[f64],
    period: usize,
    k: f64,
) -> Result<BollingerBands, IndicatorError> {
    let middle = calculate_sma(prices, period).map_err(|e| match e {
        IndicatorError::InsufficientData {
            required,
            available,
            ..
        } => IndicatorError::insufficient("Bollinger", required, available),
        other => other,
    })?;

    let variance = prices
        .iter()
        .rev()
        .take(period)
        .map(|p| (p - middle).powi(2))
        .sum::<f64>()
        / period as f64;
    let std_dev = variance.sqrt();

    Ok(BollingerBands {
        upper: middle + k * std_dev,
        middle,
        lower: middle - k * std_dev,
    })
}
