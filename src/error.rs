//! Error taxonomy for the trading engine.
//!
//! Only [`ConfigError`](crate::config::ConfigError) is allowed to stop the
//! process. Everything in here is caught at the orchestrator boundary.

use thiserror::Error;

use crate::execution::position_manager::TransitionError;

/// Not enough candle history to compute an indicator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndicatorError {
    #[error("insufficient data for {indicator}: need {required} closes, have {available}")]
    InsufficientData {
        indicator: &'static str,
        required: usize,
        available: usize,
    },

    #[error("invalid parameter for {indicator}: {reason}")]
    InvalidParameter {
        indicator: &'static str,
        reason: String,
    },
}

impl IndicatorError {
    pub(crate) fn insufficient(indicator: &'static str, required: usize, available: usize) -> Self {
        Self::InsufficientData {
            indicator,
            required,
            available,
        }
    }
}

/// Failure reported by an exchange gateway.
///
/// The split matters: transient failures go through the retry policy,
/// permanent ones are escalated immediately.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// Network failure, timeout, 5xx or rate limit.
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// Invalid order parameters, insufficient balance, auth.
    #[error("permanent gateway error: {0}")]
    Permanent(String),

    /// The exchange has no such order.
    #[error("not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return Self::Transient(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                Self::Transient(err.to_string())
            }
            Some(_) => Self::Permanent(err.to_string()),
            // Body decode failures and the like
            None => Self::Permanent(err.to_string()),
        }
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Error surfaced by one orchestrator task invocation.
#[derive(Debug, Error)]
pub enum TradingError {
    #[error(transparent)]
    InsufficientData(#[from] IndicatorError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Retries exhausted or a permanent failure while acting on a decision.
    #[error("{action} failed for {market}: {reason}")]
    ActionFailed {
        action: &'static str,
        market: String,
        reason: String,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl TradingError {
    pub fn action_failed(action: &'static str, market: &str, reason: impl ToString) -> Self {
        Self::ActionFailed {
            action,
            market: market.to_string(),
            reason: reason.to_string(),
        }
    }
}
