use serde::{Deserialize, Serialize};

/// Risk limits. Immutable for the lifetime of a run.
///
/// Percent fields are expressed in percent (3.0 == 3%).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskConfig {
    /// Flat stop: exit when loss from entry reaches this percent
    pub stop_loss_percent: f64,
    /// Trailing stop: exit when drawdown from the post-entry high reaches this percent
    pub stop_loss_percent_high: f64,
    /// Largest quote amount (KRW) a single buy may spend
    pub max_investment_per_trade: f64,
    /// Realized loss (KRW) since local midnight that halts new buys
    pub max_daily_loss: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_percent: 3.0,
            stop_loss_percent_high: 2.0,
            max_investment_per_trade: 100_000.0,
            max_daily_loss: 50_000.0,
        }
    }
}

impl RiskConfig {
    pub fn stop_loss_fraction(&self) -> f64 {
        self.stop_loss_percent / 100.0
    }

    pub fn stop_loss_high_fraction(&self) -> f64 {
        self.stop_loss_percent_high / 100.0
    }
}

/// What the orchestrator wants to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeAction {
    Buy,
    Sell,
    StopLoss,
}

impl TradeAction {
    pub fn is_exit(&self) -> bool {
        matches!(self, TradeAction::Sell | TradeAction::StopLoss)
    }
}

/// Risk gate outcome. A denial is normal control flow, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow,
    Deny(String),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Pure pre-trade gate. Only entries are ever denied.
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Check a proposed trade against the configured limits
    pub fn authorize(
        &self,
        action: TradeAction,
        market: &str,
        proposed_amount: f64,
        today_realized_loss: f64,
    ) -> Verdict {
        if action.is_exit() {
            // Risk exits are never blocked
            return Verdict::Allow;
        }

        if !proposed_amount.is_finite() || proposed_amount <= 0.0 {
            return Verdict::Deny(format!(
                "{}: invalid buy amount {}",
                market, proposed_amount
            ));
        }

        if today_realized_loss >= self.config.max_daily_loss {
            return Verdict::Deny(format!(
                "daily loss limit reached: {:.0} / {:.0} KRW",
                today_realized_loss, self.config.max_daily_loss
            ));
        }

        if proposed_amount > self.config.max_investment_per_trade {
            return Verdict::Deny(format!(
                "{}: buy amount {:.0} exceeds max investment per trade {:.0}",
                market, proposed_amount, self.config.max_investment_per_trade
            ));
        }

        Verdict::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RiskManager {
        RiskManager::new(RiskConfig::default())
    }

    #[test]
    fn test_denies_buy_above_max_investment() {
        let verdict = manager().authorize(TradeAction::Buy, "KRW-BTC", 150_000.0, 0.0);
        match verdict {
            Verdict::Deny(reason) => assert!(reason.contains("exceeds max investment")),
            Verdict::Allow => panic!("expected denial"),
        }
    }

    #[test]
    fn test_allows_buy_within_limit() {
        let verdict = manager().authorize(TradeAction::Buy, "KRW-BTC", 90_000.0, 0.0);
        assert_eq!(verdict, Verdict::Allow);
    }

    #[test]
    fn test_allows_buy_exactly_at_limit() {
        let verdict = manager().authorize(TradeAction::Buy, "KRW-BTC", 100_000.0, 0.0);
        assert!(verdict.is_allowed());
    }

    #[test]
    fn test_denies_buy_when_daily_loss_reached() {
        let verdict = manager().authorize(TradeAction::Buy, "KRW-ETH", 10_000.0, 50_000.0);
        match verdict {
            Verdict::Deny(reason) => assert!(reason.contains("daily loss limit")),
            Verdict::Allow => panic!("expected denial"),
        }
    }

    #[test]
    fn test_exits_never_denied() {
        let rm = manager();
        assert!(rm
            .authorize(TradeAction::Sell, "KRW-BTC", 1_000_000.0, 999_999.0)
            .is_allowed());
        assert!(rm
            .authorize(TradeAction::StopLoss, "KRW-BTC", 1_000_000.0, 999_999.0)
            .is_allowed());
    }

    #[test]
    fn test_denies_non_positive_amount() {
        assert!(!manager()
            .authorize(TradeAction::Buy, "KRW-BTC", 0.0, 0.0)
            .is_allowed());
        assert!(!manager()
            .authorize(TradeAction::Buy, "KRW-BTC", f64::NAN, 0.0)
            .is_allowed());
    }
}
