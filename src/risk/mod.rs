// Risk management module
pub mod daily_loss;
pub mod risk_manager;

pub use daily_loss::DailyLossTracker;
pub use risk_manager::{RiskConfig, RiskManager, TradeAction, Verdict};
