//! Application configuration.
//!
//! Loaded once at startup from `config/{env}_config.yaml`, overlaid with
//! `JATS__SECTION__KEY` environment variables, then validated. Nothing in
//! here is reloaded while trading.

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::execution::RetryPolicy;
use crate::models::split_market;
use crate::notifier::QuietHours;
use crate::risk::RiskConfig;
use crate::strategy::StrategyParams;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Exchange backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Live Upbit spot trading
    Upbit,
    /// Upbit market data with simulated orders
    Paper,
    /// Korea Investment & Securities domestic stocks
    Kis,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Upbit => "upbit",
            Platform::Paper => "paper",
            Platform::Kis => "kis",
        }
    }
}

/// Command-line values that take precedence over file and environment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Overrides {
    pub platform: Platform,
    pub dry_run: bool,
    pub signal_check_secs: Option<u64>,
}

impl Overrides {
    pub fn platform(platform: Platform) -> Self {
        Self {
            platform,
            dry_run: false,
            signal_check_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub fee_rate: f64,
    /// Smallest order the exchange accepts, in quote currency
    pub min_order_amount: f64,
    /// Status polls after submitting an order before giving up
    pub order_confirm_attempts: u32,
    pub order_confirm_poll_ms: u64,
    /// Non-terminal orders older than this are cancelled
    pub abnormal_order_age_secs: i64,
    /// Starting quote balance for the paper exchange
    pub paper_quote_balance: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fee_rate: 0.0005,
            min_order_amount: 5_000.0,
            order_confirm_attempts: 5,
            order_confirm_poll_ms: 1_000,
            abnormal_order_age_secs: 600,
            paper_quote_balance: 1_000_000.0,
        }
    }
}

/// Timer cadences, in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub price_tick_secs: u64,
    pub signal_check_secs: u64,
    pub order_cleanup_secs: u64,
    pub reconcile_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            price_tick_secs: 10,
            signal_check_secs: 60,
            order_cleanup_secs: 300,
            reconcile_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    /// `HH:MM`, local time
    pub quiet_hours_start: String,
    pub quiet_hours_end: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            quiet_hours_start: "22:00".to_string(),
            quiet_hours_end: "08:00".to_string(),
        }
    }
}

impl TelegramConfig {
    pub fn quiet_hours(&self) -> Result<QuietHours, ConfigError> {
        QuietHours::parse(&self.quiet_hours_start, &self.quiet_hours_end)
            .map_err(|e| invalid("telegram.quiet_hours", format!("expected HH:MM ({})", e)))
    }

    /// Token and chat id, when both are set
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.bot_token.as_deref(), self.chat_id.as_deref()) {
            (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty() => {
                Some((token, chat))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpbitConfig {
    pub access_key: String,
    pub secret_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub quotation_per_second: u32,
    pub orders_per_minute: u32,
}

impl Default for UpbitConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            base_url: "https://api.upbit.com".to_string(),
            timeout_secs: 10,
            quotation_per_second: 10,
            orders_per_minute: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KisConfig {
    pub app_key: String,
    pub app_secret: String,
    /// First 8 digits of the account number (CANO)
    pub account_number: String,
    /// Account product code (ACNT_PRDT_CD)
    pub account_code: String,
    pub base_url: String,
    /// Mock investment account; switches trading transaction ids
    pub virtual_account: bool,
    pub timeout_secs: u64,
    pub requests_per_second: u32,
}

impl Default for KisConfig {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            app_secret: String::new(),
            account_number: String::new(),
            account_code: "01".to_string(),
            base_url: "https://openapi.koreainvestment.com:9443".to_string(),
            virtual_account: false,
            timeout_secs: 10,
            requests_per_second: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive for this crate, e.g. `info` or `debug`
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub platform: Platform,
    /// Simulate orders against live market data
    pub dry_run: bool,
    pub quote_currency: String,
    /// Markets to trade; empty means every market quoted in `quote_currency`
    pub markets: Vec<String>,
    pub strategy: StrategyParams,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub schedule: ScheduleConfig,
    pub retry: RetryPolicy,
    pub telegram: TelegramConfig,
    pub upbit: UpbitConfig,
    pub kis: KisConfig,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            platform: Platform::Paper,
            dry_run: false,
            quote_currency: "KRW".to_string(),
            markets: Vec::new(),
            strategy: StrategyParams::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            schedule: ScheduleConfig::default(),
            retry: RetryPolicy::default(),
            telegram: TelegramConfig::default(),
            upbit: UpbitConfig::default(),
            kis: KisConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load `config/{env}_config.yaml`, apply CLI overrides and validate
    pub fn load(env: &str, overrides: &Overrides) -> Result<Self, ConfigError> {
        Self::load_from(Path::new("config"), env, overrides)
    }

    pub fn load_from(dir: &Path, env: &str, overrides: &Overrides) -> Result<Self, ConfigError> {
        let path = dir.join(format!("{}_config.yaml", env));
        let mut builder = Config::builder()
            .add_source(File::from(path.as_path()).format(FileFormat::Yaml))
            .add_source(
                Environment::with_prefix("JATS")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override("platform", overrides.platform.as_str())?;
        if overrides.dry_run {
            builder = builder.set_override("dry_run", true)?;
        }
        if let Some(secs) = overrides.signal_check_secs {
            builder = builder.set_override("schedule.signal_check_secs", secs as i64)?;
        }

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values before anything trades
    pub fn validate(&self) -> Result<(), ConfigError> {
        let risk = &self.risk;
        if !(risk.stop_loss_percent > 0.0 && risk.stop_loss_percent < 100.0) {
            return Err(invalid("risk.stop_loss_percent", "must be within (0, 100)"));
        }
        if !(risk.stop_loss_percent_high > 0.0) {
            return Err(invalid("risk.stop_loss_percent_high", "must be positive"));
        }
        if risk.stop_loss_percent_high >= risk.stop_loss_percent {
            return Err(invalid(
                "risk.stop_loss_percent_high",
                format!(
                    "{} must be below stop_loss_percent {}",
                    risk.stop_loss_percent_high, risk.stop_loss_percent
                ),
            ));
        }
        if !(risk.max_investment_per_trade > 0.0) {
            return Err(invalid("risk.max_investment_per_trade", "must be positive"));
        }
        if !(risk.max_daily_loss > 0.0) {
            return Err(invalid("risk.max_daily_loss", "must be positive"));
        }

        let strategy = &self.strategy;
        if strategy.rsi_period < 2 {
            return Err(invalid("strategy.rsi_period", "must be at least 2"));
        }
        if strategy.macd_fast == 0 || strategy.macd_fast >= strategy.macd_slow {
            return Err(invalid("strategy.macd_fast", "must satisfy 0 < macd_fast < macd_slow"));
        }
        if strategy.macd_signal == 0 {
            return Err(invalid("strategy.macd_signal", "must be at least 1"));
        }
        if !(0.0..=100.0).contains(&strategy.rsi_oversold)
            || !(0.0..=100.0).contains(&strategy.rsi_overbought)
            || strategy.rsi_oversold >= strategy.rsi_overbought
        {
            return Err(invalid(
                "strategy.rsi_oversold",
                "must satisfy 0 <= rsi_oversold < rsi_overbought <= 100",
            ));
        }
        if strategy.ma_short == 0 || strategy.ma_short >= strategy.ma_long {
            return Err(invalid("strategy.ma_short", "must satisfy 0 < ma_short < ma_long"));
        }
        if strategy.bollinger_period < 2 || !(strategy.bollinger_k > 0.0) {
            return Err(invalid(
                "strategy.bollinger_period",
                "needs period >= 2 and a positive k",
            ));
        }
        for (field, fraction) in [
            ("strategy.buy_fraction", strategy.buy_fraction),
            ("strategy.strong_buy_fraction", strategy.strong_buy_fraction),
        ] {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(invalid(field, "must be within (0, 1]"));
            }
        }
        if strategy.candle_interval_minutes == 0 {
            return Err(invalid("strategy.candle_interval_minutes", "must be positive"));
        }
        if strategy.candle_count < strategy.min_candles_required() {
            return Err(invalid(
                "strategy.candle_count",
                format!(
                    "{} candles cannot cover the {} the indicators need",
                    strategy.candle_count,
                    strategy.min_candles_required()
                ),
            ));
        }

        let execution = &self.execution;
        if !(0.0..0.01).contains(&execution.fee_rate) {
            return Err(invalid("execution.fee_rate", "must be within [0, 0.01)"));
        }
        if execution.min_order_amount < 0.0 {
            return Err(invalid("execution.min_order_amount", "must not be negative"));
        }
        if execution.order_confirm_attempts == 0 {
            return Err(invalid("execution.order_confirm_attempts", "must be at least 1"));
        }
        if execution.abnormal_order_age_secs <= 0 {
            return Err(invalid("execution.abnormal_order_age_secs", "must be positive"));
        }

        let schedule = &self.schedule;
        for (field, secs) in [
            ("schedule.price_tick_secs", schedule.price_tick_secs),
            ("schedule.signal_check_secs", schedule.signal_check_secs),
            ("schedule.order_cleanup_secs", schedule.order_cleanup_secs),
            ("schedule.reconcile_secs", schedule.reconcile_secs),
        ] {
            if secs == 0 {
                return Err(invalid(field, "cadence must be positive"));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }

        self.telegram.quiet_hours()?;

        if self.platform == Platform::Upbit
            && !self.dry_run
            && (self.upbit.access_key.is_empty() || self.upbit.secret_key.is_empty())
        {
            return Err(invalid(
                "upbit.access_key",
                "access and secret keys are required for live trading",
            ));
        }

        if self.platform == Platform::Kis {
            let kis = &self.kis;
            if !self.dry_run
                && (kis.app_key.is_empty()
                    || kis.app_secret.is_empty()
                    || kis.account_number.is_empty())
            {
                return Err(invalid(
                    "kis.app_key",
                    "app key, secret and account number are required for live trading",
                ));
            }
            if self.quote_currency != "KRW" {
                return Err(invalid("quote_currency", "KIS domestic stocks trade in KRW"));
            }
            if self.markets.is_empty() {
                return Err(invalid("markets", "KIS cannot list markets; name the stock codes"));
            }
            if self.strategy.candle_interval_minutes < 1_440 {
                return Err(invalid(
                    "strategy.candle_interval_minutes",
                    "KIS serves daily candles only (1440)",
                ));
            }
        }

        if self.quote_currency.is_empty() {
            return Err(invalid("quote_currency", "must not be empty"));
        }
        for market in &self.markets {
            match split_market(market) {
                Some((quote, _)) if quote == self.quote_currency => {}
                _ => {
                    return Err(invalid(
                        "markets",
                        format!("`{}` is not a {}-BASE market code", market, self.quote_currency),
                    ))
                }
            }
        }

        Ok(())
    }

    /// Simulated execution (paper platform or `--dry-run`)
    pub fn simulated(&self) -> bool {
        self.dry_run || self.platform == Platform::Paper
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
platform: upbit
markets: ["KRW-BTC", "KRW-ETH"]
strategy:
  rsi_period: 14
  macd_fast: 12
  macd_slow: 26
  macd_signal: 9
risk:
  stop_loss_percent: 3
  stop_loss_percent_high: 2
  max_investment_per_trade: 100000
  max_daily_loss: 50000
upbit:
  access_key: "ak"
  secret_key: "sk"
telegram:
  quiet_hours_start: "23:00"
  quiet_hours_end: "07:30"
"#;

    fn field_of(err: ConfigError) -> &'static str {
        match err {
            ConfigError::Invalid { field, .. } => field,
            ConfigError::Load(e) => panic!("unexpected load error: {}", e),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_parse_valid_yaml() {
        let config = AppConfig::from_yaml(VALID).unwrap();

        assert_eq!(config.platform, Platform::Upbit);
        assert_eq!(config.markets, vec!["KRW-BTC", "KRW-ETH"]);
        assert_eq!(config.risk.stop_loss_percent, 3.0);
        assert_eq!(config.upbit.access_key, "ak");
        // Unset sections keep their defaults
        assert_eq!(config.schedule.price_tick_secs, 10);
        assert_eq!(config.strategy.rsi_oversold, 30.0);
        assert_eq!(config.telegram.quiet_hours_start, "23:00");
    }

    #[test]
    fn test_high_trail_must_be_tighter_than_stop() {
        let mut config = AppConfig::default();
        config.risk.stop_loss_percent = 2.0;
        config.risk.stop_loss_percent_high = 2.0;

        assert_eq!(field_of(config.validate().unwrap_err()), "risk.stop_loss_percent_high");
    }

    #[test]
    fn test_rejects_bad_macd_periods() {
        let mut config = AppConfig::default();
        config.strategy.macd_fast = 26;
        config.strategy.macd_slow = 12;

        assert_eq!(field_of(config.validate().unwrap_err()), "strategy.macd_fast");
    }

    #[test]
    fn test_rejects_bad_quiet_hours() {
        let mut config = AppConfig::default();
        config.telegram.quiet_hours_end = "8am".to_string();

        assert_eq!(field_of(config.validate().unwrap_err()), "telegram.quiet_hours");
    }

    #[test]
    fn test_live_upbit_needs_keys() {
        let mut config = AppConfig::default();
        config.platform = Platform::Upbit;
        assert_eq!(field_of(config.validate().unwrap_err()), "upbit.access_key");

        config.dry_run = true;
        config.validate().unwrap();
    }

    #[test]
    fn test_kis_needs_keys_markets_and_daily_candles() {
        let mut config = AppConfig::default();
        config.platform = Platform::Kis;
        config.markets = vec!["KRW-005930".to_string()];
        config.strategy.candle_interval_minutes = 1_440;
        assert_eq!(field_of(config.validate().unwrap_err()), "kis.app_key");

        config.kis.app_key = "app".to_string();
        config.kis.app_secret = "secret".to_string();
        config.kis.account_number = "12345678".to_string();
        config.validate().unwrap();
        assert!(!config.simulated());

        config.strategy.candle_interval_minutes = 60;
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "strategy.candle_interval_minutes"
        );

        config.strategy.candle_interval_minutes = 1_440;
        config.markets.clear();
        assert_eq!(field_of(config.validate().unwrap_err()), "markets");
    }

    #[test]
    fn test_parse_kis_section() {
        let config = AppConfig::from_yaml(
            r#"
platform: kis
dry_run: true
markets: ["KRW-005930"]
strategy:
  candle_interval_minutes: 1440
kis:
  account_number: "12345678"
  virtual_account: true
"#,
        )
        .unwrap();

        assert_eq!(config.platform, Platform::Kis);
        assert!(config.kis.virtual_account);
        assert_eq!(config.kis.account_code, "01");
        assert_eq!(config.kis.requests_per_second, 20);
    }

    #[test]
    fn test_rejects_foreign_market() {
        let mut config = AppConfig::default();
        config.markets = vec!["BTC-ETH".to_string()];
        assert_eq!(field_of(config.validate().unwrap_err()), "markets");

        config.markets = vec!["KRWBTC".to_string()];
        assert_eq!(field_of(config.validate().unwrap_err()), "markets");
    }

    #[test]
    fn test_rejects_zero_cadence() {
        let mut config = AppConfig::default();
        config.schedule.order_cleanup_secs = 0;
        assert_eq!(field_of(config.validate().unwrap_err()), "schedule.order_cleanup_secs");
    }

    #[test]
    fn test_rejects_out_of_range_fee() {
        let mut config = AppConfig::default();
        config.execution.fee_rate = 0.05;
        assert_eq!(field_of(config.validate().unwrap_err()), "execution.fee_rate");
    }

    #[test]
    fn test_malformed_yaml_is_load_error() {
        let result = AppConfig::from_yaml("risk: [not, a, map]");
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_load_from_directory() {
        let dir = std::env::temp_dir().join(format!("jats-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("dev_config.yaml"), "markets: [\"KRW-XRP\"]\n").unwrap();

        let config = AppConfig::load_from(&dir, "dev", &Overrides::platform(Platform::Paper)).unwrap();
        assert_eq!(config.platform, Platform::Paper);
        assert_eq!(config.markets, vec!["KRW-XRP"]);

        // Live Upbit without keys is rejected unless it is a dry run
        let live = AppConfig::load_from(&dir, "dev", &Overrides::platform(Platform::Upbit));
        assert!(matches!(live, Err(ConfigError::Invalid { .. })));

        let overrides = Overrides {
            platform: Platform::Upbit,
            dry_run: true,
            signal_check_secs: Some(30),
        };
        let config = AppConfig::load_from(&dir, "dev", &overrides).unwrap();
        assert!(config.simulated());
        assert_eq!(config.schedule.signal_check_secs, 30);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_is_load_error() {
        let dir = std::env::temp_dir().join("jats-config-does-not-exist");
        let result = AppConfig::load_from(&dir, "prod", &Overrides::platform(Platform::Paper));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
