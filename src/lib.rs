// Core modules
pub mod analyzer;
pub mod config;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod indicators;
pub mod models;
pub mod notifier;
pub mod orchestrator;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use analyzer::Analyzer;
pub use config::{AppConfig, ConfigError};
pub use error::{GatewayError, IndicatorError, TradingError};
pub use models::*;
pub use orchestrator::Orchestrator;
pub use strategy::Strategy;

// Error handling for startup and glue code
pub type Result<T> = anyhow::Result<T>;
