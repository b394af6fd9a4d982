use crate::error::IndicatorError;

/// Calculate Relative Strength Index (RSI) with Wilder smoothing
///
/// The first `period` price changes seed the average gain/loss with a
/// simple mean; every later change is folded in as
/// `avg = (avg * (period - 1) + x) / period`.
///
/// Values:
/// - RSI > 70: Overbought
/// - RSI < 30: Oversold
///
/// Needs `period + 1` closes (one value per `period` changes).
pub fn calculate_rsi(prices: &[f64], period: usize) -> Result<f64, IndicatorError> {
    if period == 0 {
        return Err(IndicatorError::InvalidParameter {
            indicator: "RSI",
            reason: "period must be positive".to_string(),
        });
    }
    if prices.len() < period + 1 {
        return Err(IndicatorError::insufficient("RSI", period + 1, prices.len()));
    }

    let mut changes = prices.windows(2).map(|w| w[1] - w[0]);

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for change in changes.by_ref().take(period) {
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    let p = period as f64;
    for change in changes {
        let (gain, loss) = if change > 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
    }

    if avg_loss == 0.0 {
        // Flat series has no direction
        return Ok(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }

    let rs = avg_gain / avg_loss;
    let rsi = 100.0 - (100.0 / (1.0 + rs));

    Ok(rsi.clamp(0.0, 100.0))
}
