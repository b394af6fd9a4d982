// Trading orchestrator: drives analysis, risk, positions and the gateway
pub mod scheduler;

pub use scheduler::{Scheduler, TaskKind};

use chrono::{DateTime, Local, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use crate::analyzer::Analyzer;
use crate::config::AppConfig;
use crate::error::{GatewayError, TradingError};
use crate::execution::position_manager::QUANTITY_EPSILON;
use crate::execution::{
    with_retry, ClosedTrade, ExchangeHolding, ExitReason, PositionManager, PositionStatus,
    ReconciliationMismatch,
};
use crate::gateway::ExchangeGateway;
use crate::models::{
    split_market, CandleInterval, ClosedOrdersQuery, Conviction, Order, OrderSide, OrderStatus,
    SignalKind,
};
use crate::notifier::{Notifier, Severity};
use crate::risk::{DailyLossTracker, RiskManager, TradeAction, Verdict};

/// What one `check_signal` invocation did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No signal, or nothing to do
    Hold,
    /// An order is still unconfirmed; left for cleanup/reconciliation
    Pending,
    /// Risk manager vetoed the buy
    Denied(String),
    /// Buy wanted but not placeable (balance below the exchange minimum)
    Skipped(String),
    Entered {
        price: f64,
        quantity: f64,
    },
    Exited(ClosedTrade),
    /// Sell filled short of the held quantity; the rest is still LONG
    PartiallyExited(ClosedTrade),
}

/// Hourly portfolio summary
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub cash: f64,
    pub holdings_value: f64,
    pub total_assets: f64,
    /// Unrealized return on open positions, in percent
    pub profit_percent: f64,
    pub open_positions: usize,
    pub today_trades: usize,
    pub today_realized_loss: f64,
}

impl Report {
    fn message(&self, quote: &str) -> String {
        format!(
            "📊 Trading summary\n\nTotal assets: {:.0} {q}\nCash: {:.0} {q}\nHoldings: {:.0} {q}\nReturn: {:.2}%\nOpen positions: {}\nTrades today: {}\nRealized loss today: {:.0} {q}",
            self.total_assets,
            self.cash,
            self.holdings_value,
            self.profit_percent,
            self.open_positions,
            self.today_trades,
            self.today_realized_loss,
            q = quote
        )
    }
}

/// Schedules and serializes all trading work.
///
/// Each market owns one `PositionManager` behind its own async mutex; every
/// read or write of a market's position happens under that lock, so ticks
/// on different markets overlap freely while ticks on one market never
/// interleave. Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<AppConfig>,
    gateway: Arc<dyn ExchangeGateway>,
    notifier: Arc<dyn Notifier>,
    analyzer: Analyzer,
    risk: RiskManager,
    positions: Arc<BTreeMap<String, Arc<Mutex<PositionManager>>>>,
    daily: Arc<std::sync::Mutex<DailyLossTracker>>,
}

/// Markets to trade: the configured list, or every market in the quote
/// currency when none are configured
pub async fn discover_markets(
    config: &AppConfig,
    gateway: &dyn ExchangeGateway,
) -> Result<Vec<String>, GatewayError> {
    if !config.markets.is_empty() {
        return Ok(config.markets.clone());
    }
    let markets = with_retry(&config.retry, "list_markets", || {
        gateway.list_markets(&config.quote_currency)
    })
    .await?;
    tracing::info!("🔍 Discovered {} {} markets", markets.len(), config.quote_currency);
    Ok(markets)
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        markets: Vec<String>,
        gateway: Arc<dyn ExchangeGateway>,
        notifier: Arc<dyn Notifier>,
        analyzer: Analyzer,
    ) -> Self {
        let positions = markets
            .into_iter()
            .map(|m| {
                let manager = Arc::new(Mutex::new(PositionManager::new(&m)));
                (m, manager)
            })
            .collect();

        Self {
            risk: RiskManager::new(config.risk.clone()),
            config: Arc::new(config),
            gateway,
            notifier,
            analyzer,
            positions: Arc::new(positions),
            daily: Arc::new(std::sync::Mutex::new(DailyLossTracker::new(
                Local::now().date_naive(),
            ))),
        }
    }

    pub fn markets(&self) -> impl Iterator<Item = &str> {
        self.positions.keys().map(|m| m.as_str())
    }

    fn manager(&self, market: &str) -> Result<&Arc<Mutex<PositionManager>>, TradingError> {
        self.positions
            .get(market)
            .ok_or_else(|| TradingError::action_failed("lookup", market, "market is not tracked"))
    }

    /// Snapshot of a market's position state
    pub async fn position_status(&self, market: &str) -> Option<PositionStatus> {
        let manager = self.positions.get(market)?;
        let status = manager.lock().await.status();
        Some(status)
    }

    pub async fn position_manager(&self, market: &str) -> Option<PositionManager> {
        let manager = self.positions.get(market)?;
        let snapshot = manager.lock().await.clone();
        Some(snapshot)
    }

    fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    fn daily(&self) -> std::sync::MutexGuard<'_, DailyLossTracker> {
        self.daily.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn today_realized_loss(&self) -> f64 {
        self.daily().realized_loss(Self::today())
    }

    async fn current_price(&self, market: &str) -> Result<f64, GatewayError> {
        with_retry(&self.config.retry, "get_current_price", || {
            self.gateway.get_current_price(market)
        })
        .await
    }

    // ============== Price tick ==============

    /// Ratchet the high-water mark of a LONG position.
    ///
    /// Skips the market when another task holds it; the next tick catches up.
    pub async fn price_tick(&self, market: &str) -> Result<(), TradingError> {
        let Ok(mut pm) = self.manager(market)?.try_lock() else {
            tracing::debug!("{}: busy, skipping price tick", market);
            return Ok(());
        };
        if pm.status() != PositionStatus::Long {
            return Ok(());
        }

        let price = self.current_price(market).await?;
        if pm.update_price(price) {
            tracing::debug!("📈 {}: new high {:.2}", market, price);
        }
        Ok(())
    }

    // ============== Signal check ==============

    /// Run the analyzer for one market and act on its decision.
    ///
    /// FLAT evaluates the buy path only, LONG the sell/stop-loss path only.
    /// Positions waiting on an order are left alone.
    pub async fn check_signal(&self, market: &str) -> Result<TickOutcome, TradingError> {
        let mut pm = self.manager(market)?.lock().await;
        if matches!(
            pm.status(),
            PositionStatus::Entering | PositionStatus::Exiting
        ) {
            tracing::debug!("{}: order pending ({}), skipping signal check", market, pm.status());
            return Ok(TickOutcome::Pending);
        }

        let params = &self.config.strategy;
        let interval = if params.candle_interval_minutes >= 1_440 {
            CandleInterval::Days
        } else {
            CandleInterval::Minutes(params.candle_interval_minutes)
        };
        let candles = with_retry(&self.config.retry, "get_candles", || {
            self.gateway
                .get_candles(market, interval, params.candle_count, None)
        })
        .await?;
        let price = self.current_price(market).await?;

        let position = pm.position().clone();
        let evaluation = self
            .analyzer
            .evaluate(market, &candles, price, params, Some(&position))?;

        match pm.status() {
            PositionStatus::Flat => match evaluation.signal.kind {
                SignalKind::Buy => {
                    tracing::info!(
                        "🎯 {}: BUY signal ({:?}) at {:.2}, RSI {:.1}",
                        market,
                        evaluation.signal.conviction,
                        price,
                        evaluation.signal.basis.rsi
                    );
                    self.execute_buy(&mut pm, evaluation.signal.conviction, price)
                        .await
                }
                _ => Ok(TickOutcome::Hold),
            },
            PositionStatus::Long => {
                pm.update_price(price);
                if let Some(check) = evaluation.stop_loss.filter(|c| c.triggered()) {
                    tracing::warn!(
                        "🛑 {}: stop-loss at {:.2} (loss {:.2}%, drawdown from high {:.2}%)",
                        market,
                        price,
                        check.loss_pct * 100.0,
                        check.drawdown_from_high_pct * 100.0
                    );
                    self.execute_sell(&mut pm, ExitReason::StopLoss, price).await
                } else if evaluation.signal.kind == SignalKind::Sell {
                    tracing::info!("🎯 {}: SELL signal at {:.2}", market, price);
                    self.execute_sell(&mut pm, ExitReason::StrategySell, price)
                        .await
                } else {
                    Ok(TickOutcome::Hold)
                }
            }
            PositionStatus::Entering | PositionStatus::Exiting => Ok(TickOutcome::Pending),
        }
    }

    fn buy_amount(&self, conviction: Conviction) -> f64 {
        let fraction = match conviction {
            Conviction::Strong => self.config.strategy.strong_buy_fraction,
            Conviction::Normal => self.config.strategy.buy_fraction,
        };
        fraction * self.config.risk.max_investment_per_trade
    }

    async fn execute_buy(
        &self,
        pm: &mut PositionManager,
        conviction: Conviction,
        price: f64,
    ) -> Result<TickOutcome, TradingError> {
        let market = pm.market().to_string();
        let desired = self.buy_amount(conviction);
        let today_loss = self.today_realized_loss();

        if let Verdict::Deny(reason) =
            self.risk
                .authorize(TradeAction::Buy, &market, desired, today_loss)
        {
            tracing::warn!("🚫 {}: buy denied: {}", market, reason);
            // The daily limit repeats every tick until midnight; say it once
            let limit_hit = today_loss >= self.config.risk.max_daily_loss;
            if limit_hit {
                if self.daily().take_limit_notification(Self::today()) {
                    tracing::info!("⛔ Daily loss limit reached, new buys paused until midnight");
                    self.notifier
                        .notify(
                            &format!("Daily loss limit reached, new buys paused: {}", reason),
                            Severity::Info,
                        )
                        .await;
                }
            } else {
                self.notifier
                    .notify(&format!("Buy denied for {}: {}", market, reason), Severity::Info)
                    .await;
            }
            return Ok(TickOutcome::Denied(reason));
        }

        let balances = with_retry(&self.config.retry, "get_balances", || {
            self.gateway.get_balances()
        })
        .await?;
        let cash = balances
            .get(&self.config.quote_currency)
            .map(|b| b.balance)
            .unwrap_or(0.0);
        // Fee is charged on top of the spend
        let spend = (desired.min(cash) / (1.0 + self.config.execution.fee_rate)).floor();
        if spend < self.config.execution.min_order_amount {
            let reason = format!(
                "available {:.0} {} below minimum order {:.0}",
                cash, self.config.quote_currency, self.config.execution.min_order_amount
            );
            tracing::info!("{}: buy skipped, {}", market, reason);
            return Ok(TickOutcome::Skipped(reason));
        }

        pm.begin_entry(Utc::now())?;
        let order = match self.place_order(OrderSide::Buy, &market, spend).await {
            Ok(Some(order)) => order,
            Ok(None) => return Ok(self.unconfirmed(pm, OrderSide::Buy).await),
            Err(e) => {
                pm.fail_entry()?;
                tracing::error!("❌ {}: buy order failed: {}", market, e);
                self.notifier
                    .notify(&format!("Buy order failed for {}: {}", market, e), Severity::Error)
                    .await;
                return Err(TradingError::action_failed("buy", &market, e));
            }
        };
        pm.attach_order(&order.id)?;

        let order = self.await_terminal(order).await?;
        self.apply_order(pm, &order, price).await
    }

    async fn execute_sell(
        &self,
        pm: &mut PositionManager,
        reason: ExitReason,
        price: f64,
    ) -> Result<TickOutcome, TradingError> {
        let market = pm.market().to_string();
        let quantity = pm.position().quantity;
        let action = match reason {
            ExitReason::StopLoss => TradeAction::StopLoss,
            ExitReason::StrategySell => TradeAction::Sell,
        };
        if let Verdict::Deny(why) =
            self.risk
                .authorize(action, &market, quantity * price, self.today_realized_loss())
        {
            return Ok(TickOutcome::Denied(why));
        }

        pm.begin_exit(reason, Utc::now())?;
        let order = match self.place_order(OrderSide::Sell, &market, quantity).await {
            Ok(Some(order)) => order,
            Ok(None) => return Ok(self.unconfirmed(pm, OrderSide::Sell).await),
            Err(e) => {
                pm.fail_exit()?;
                tracing::error!("❌ {}: sell order failed: {}", market, e);
                let severity = if reason == ExitReason::StopLoss {
                    Severity::Critical
                } else {
                    Severity::Error
                };
                self.notifier
                    .notify(&format!("Sell order failed for {}: {}", market, e), severity)
                    .await;
                return Err(TradingError::action_failed("sell", &market, e));
            }
        };
        pm.attach_order(&order.id)?;

        let order = self.await_terminal(order).await?;
        self.apply_order(pm, &order, price).await
    }

    /// Submit a market order at most once per trading decision.
    ///
    /// A transient failure can hide an order the exchange already accepted,
    /// so the decision's identifier is looked up before anything is
    /// resubmitted. `Ok(None)` means the outcome could not be determined.
    async fn place_order(
        &self,
        side: OrderSide,
        market: &str,
        size: f64,
    ) -> Result<Option<Order>, GatewayError> {
        let identifier = Uuid::new_v4().to_string();
        let op = match side {
            OrderSide::Buy => "place_market_buy",
            OrderSide::Sell => "place_market_sell",
        };
        let policy = &self.config.retry;
        let mut backoff = policy.backoff();
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let placed = match side {
                OrderSide::Buy => {
                    self.gateway
                        .place_market_buy(market, size, &identifier)
                        .await
                }
                OrderSide::Sell => {
                    self.gateway
                        .place_market_sell(market, size, &identifier)
                        .await
                }
            };
            let err = match placed {
                Ok(order) => return Ok(Some(order)),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };
            tracing::warn!(op, attempt, max_attempts, %identifier, "Order submission failed: {}", err);

            let lookup = with_retry(policy, "find_order", || {
                self.gateway.find_order(&identifier)
            })
            .await;
            match lookup {
                Ok(Some(order)) => {
                    tracing::info!("{}: order {} was accepted before the error", market, order.id);
                    return Ok(Some(order));
                }
                Ok(None) if attempt < max_attempts => {
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Ok(None) => {
                    tracing::error!(op, attempt, "Retries exhausted: {}", err);
                    return Err(err);
                }
                Err(e) => {
                    tracing::warn!("{}: cannot confirm order {}: {}", market, identifier, e);
                    return Ok(None);
                }
            }
        }
    }

    /// Leave the position waiting when an order may or may not exist;
    /// reconciliation against balances settles it.
    async fn unconfirmed(&self, pm: &PositionManager, side: OrderSide) -> TickOutcome {
        let side = match side {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        };
        tracing::warn!(
            "⏳ {}: {} order unconfirmed, leaving position {} for reconciliation",
            pm.market(),
            side,
            pm.status()
        );
        self.notifier
            .notify(
                &format!(
                    "{} order for {} could not be confirmed; reconciliation will settle it",
                    side,
                    pm.market()
                ),
                Severity::Warning,
            )
            .await;
        TickOutcome::Pending
    }

    /// Poll an order until it is terminal or the confirmation budget runs out
    async fn await_terminal(&self, mut order: Order) -> Result<Order, TradingError> {
        let poll = Duration::from_millis(self.config.execution.order_confirm_poll_ms);
        let mut attempts = 0;
        while !order.status.is_terminal() && attempts < self.config.execution.order_confirm_attempts
        {
            attempts += 1;
            tokio::time::sleep(poll).await;
            let id = order.id.clone();
            order = with_retry(&self.config.retry, "get_order_status", || {
                self.gateway.get_order_status(&id)
            })
            .await?;
        }
        Ok(order)
    }

    /// Drive the position from an order's exchange status.
    ///
    /// Non-terminal orders leave the position pending.
    async fn apply_order(
        &self,
        pm: &mut PositionManager,
        order: &Order,
        reference_price: f64,
    ) -> Result<TickOutcome, TradingError> {
        let market = pm.market().to_string();
        if !order.status.is_terminal() {
            tracing::warn!(
                "⏳ {}: order {} still {:?}, leaving position {}",
                market,
                order.id,
                order.status,
                pm.status()
            );
            return Ok(TickOutcome::Pending);
        }

        let filled = order.executed_quantity > QUANTITY_EPSILON;
        let fill_price = order.avg_fill_price.unwrap_or(reference_price);

        match (pm.status(), filled) {
            (PositionStatus::Entering, true) => {
                pm.confirm_entry(fill_price, order.executed_quantity, Utc::now())?;
                tracing::info!(
                    "🟢 {}: bought {:.8} @ {:.2}",
                    market,
                    order.executed_quantity,
                    fill_price
                );
                self.notifier
                    .notify(
                        &format!(
                            "BUY {} {:.8} @ {:.2} ({:.0} {})",
                            market,
                            order.executed_quantity,
                            fill_price,
                            order.executed_funds(),
                            self.config.quote_currency
                        ),
                        Severity::Info,
                    )
                    .await;
                Ok(TickOutcome::Entered {
                    price: fill_price,
                    quantity: order.executed_quantity,
                })
            }
            (PositionStatus::Exiting, true) => {
                let trade =
                    pm.confirm_exit(fill_price, order.executed_quantity, order.paid_fee)?;
                self.daily().record(trade.realized_pnl, Self::today());

                let (label, severity) = match (trade.reason, trade.is_partial()) {
                    (ExitReason::StopLoss, false) => ("STOP-LOSS", Severity::Critical),
                    (ExitReason::StopLoss, true) => ("PARTIAL STOP-LOSS", Severity::Critical),
                    (ExitReason::StrategySell, false) => ("SELL", Severity::Info),
                    (ExitReason::StrategySell, true) => ("PARTIAL SELL", Severity::Warning),
                };
                tracing::info!(
                    "🔴 {}: {} {:.8} @ {:.2}, P&L {:.0}",
                    market,
                    label,
                    trade.quantity,
                    trade.exit_price,
                    trade.realized_pnl
                );
                self.notifier
                    .notify(
                        &format!(
                            "{} {} {:.8} @ {:.2} (entry {:.2}, P&L {:.0} {})",
                            label,
                            market,
                            trade.quantity,
                            trade.exit_price,
                            trade.entry_price,
                            trade.realized_pnl,
                            self.config.quote_currency
                        ),
                        severity,
                    )
                    .await;
                if trade.is_partial() {
                    tracing::warn!(
                        "{}: {:.8} still held after partial sell",
                        market,
                        trade.remaining_quantity
                    );
                    return Ok(TickOutcome::PartiallyExited(trade));
                }
                Ok(TickOutcome::Exited(trade))
            }
            (PositionStatus::Entering, false) => {
                pm.fail_entry()?;
                self.notify_unfilled(&market, order).await;
                Err(TradingError::action_failed(
                    "buy",
                    &market,
                    format!("order {} ended {:?} unfilled", order.id, order.status),
                ))
            }
            (PositionStatus::Exiting, false) => {
                pm.fail_exit()?;
                self.notify_unfilled(&market, order).await;
                Err(TradingError::action_failed(
                    "sell",
                    &market,
                    format!("order {} ended {:?} unfilled", order.id, order.status),
                ))
            }
            (status, _) => {
                tracing::warn!("{}: order {} resolved while {}", market, order.id, status);
                Ok(TickOutcome::Hold)
            }
        }
    }

    async fn notify_unfilled(&self, market: &str, order: &Order) {
        let side = match order.side {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        };
        tracing::warn!("{}: {} order {} ended {:?} unfilled", market, side, order.id, order.status);
        self.notifier
            .notify(
                &format!("{} order for {} ended {:?} without a fill", side, market, order.status),
                Severity::Warning,
            )
            .await;
    }

    // ============== Order cleanup ==============

    /// Cancel non-terminal orders older than the configured age.
    ///
    /// Positions waiting on a cancelled order are resolved from its final
    /// status. Returns how many orders were cancelled.
    pub async fn cancel_abnormal_orders(&self) -> Result<usize, TradingError> {
        let open = with_retry(&self.config.retry, "list_open_orders", || {
            self.gateway.list_open_orders(None)
        })
        .await?;

        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.execution.abnormal_order_age_secs);
        let mut cancelled = 0;

        for order in open.into_iter().filter(|o| o.created_at < cutoff) {
            let age = Utc::now() - order.created_at;
            tracing::warn!(
                "🧹 {}: cancelling stale order {} ({:?}, {}s old)",
                order.market,
                order.id,
                order.status,
                age.num_seconds()
            );

            let result = with_retry(&self.config.retry, "cancel_order", || {
                self.gateway.cancel_order(&order.id)
            })
            .await;
            match result {
                Ok(true) => {
                    cancelled += 1;
                    self.notifier
                        .notify(
                            &format!(
                                "Cancelled stale order {} on {} ({}s old)",
                                order.id,
                                order.market,
                                age.num_seconds()
                            ),
                            Severity::Warning,
                        )
                        .await;
                }
                Ok(false) => {
                    tracing::info!("{}: order {} completed before cancel", order.market, order.id)
                }
                Err(e) => {
                    // Keep going; the next cleanup pass retries this order
                    tracing::error!("{}: failed to cancel {}: {}", order.market, order.id, e);
                    continue;
                }
            }

            if let Some(manager) = self.positions.get(&order.market) {
                let mut pm = manager.lock().await;
                let waiting_on_it = pm
                    .pending()
                    .and_then(|p| p.order_id.as_deref())
                    .map(|id| id == order.id)
                    .unwrap_or(false);
                if waiting_on_it {
                    if let Err(e) = self.resolve_pending(&mut pm).await {
                        tracing::warn!("{}: {}", order.market, e);
                    }
                }
            }
        }

        Ok(cancelled)
    }

    /// Settle a pending order from its current exchange status
    async fn resolve_pending(&self, pm: &mut PositionManager) -> Result<TickOutcome, TradingError> {
        let Some(order_id) = pm.pending().and_then(|p| p.order_id.clone()) else {
            return Ok(TickOutcome::Pending);
        };
        let order = with_retry(&self.config.retry, "get_order_status", || {
            self.gateway.get_order_status(&order_id)
        })
        .await?;
        let reference = if order.side == OrderSide::Sell {
            pm.position().entry_price
        } else {
            0.0
        };
        self.apply_order(pm, &order, reference).await
    }

    // ============== Reconciliation ==============

    /// Overwrite the local position with the exchange's balances.
    ///
    /// A position waiting on a young, still-open order is left for a later
    /// pass. Returns the mismatch when local state was corrected.
    pub async fn check_position(
        &self,
        market: &str,
    ) -> Result<Option<ReconciliationMismatch>, TradingError> {
        self.reconcile_market(market, false).await
    }

    async fn reconcile_market(
        &self,
        market: &str,
        force: bool,
    ) -> Result<Option<ReconciliationMismatch>, TradingError> {
        let mut pm = self.manager(market)?.lock().await;

        if let Some(order_id) = pm.pending().and_then(|p| p.order_id.clone()) {
            match self.resolve_pending(&mut pm).await {
                Ok(TickOutcome::Pending) if force => {
                    tracing::warn!("{}: cancelling unconfirmed order {} before final reconciliation", market, order_id);
                    let cancel = with_retry(&self.config.retry, "cancel_order", || {
                        self.gateway.cancel_order(&order_id)
                    })
                    .await;
                    if let Err(e) = cancel {
                        tracing::error!("{}: cancel of {} failed: {}", market, order_id, e);
                    }
                    // Settle from the post-cancel status; reconciliation covers the rest
                    let _ = self.resolve_pending(&mut pm).await;
                }
                Ok(TickOutcome::Pending) => {
                    tracing::debug!("{}: order {} still open, reconciling later", market, order_id);
                    return Ok(None);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("{}: pending order settled with error: {}", market, e),
            }
        }

        let balances = with_retry(&self.config.retry, "get_balances", || {
            self.gateway.get_balances()
        })
        .await?;

        let base = split_market(market).map(|(_, base)| base).unwrap_or(market);
        let holding = balances
            .get(base)
            .map(|b| ExchangeHolding {
                quantity: b.total(),
                avg_buy_price: b.avg_buy_price,
            })
            .filter(|h| h.quantity > QUANTITY_EPSILON)
            // Dust below the minimum order cannot be sold; ignore it
            .filter(|h| {
                h.avg_buy_price <= 0.0
                    || h.quantity * h.avg_buy_price >= self.config.execution.min_order_amount
            });

        let mismatch = pm.reconcile(holding, Utc::now());
        if let Some(m) = &mismatch {
            tracing::warn!("⚖️ Reconciliation mismatch, exchange wins: {}", m);
            self.notifier
                .notify(&format!("Reconciled position: {}", m), Severity::Warning)
                .await;
        }
        Ok(mismatch)
    }

    // ============== Reporting ==============

    /// Build and send the portfolio summary
    pub async fn report(&self) -> Result<Report, TradingError> {
        let balances = with_retry(&self.config.retry, "get_balances", || {
            self.gateway.get_balances()
        })
        .await?;
        let cash = balances
            .get(&self.config.quote_currency)
            .map(|b| b.total())
            .unwrap_or(0.0);

        let mut holdings_value = 0.0;
        let mut invested = 0.0;
        let mut unrealized = 0.0;
        let mut open_positions = 0;
        let mut today_trades = 0;
        let today = Self::today();

        // One market's failure leaves it out of the summary instead of
        // dropping the summary
        for (market, manager) in self.positions.iter() {
            let position = manager.lock().await.position().clone();
            if position.quantity > 0.0 {
                open_positions += 1;
                match self.current_price(market).await {
                    Ok(price) => {
                        holdings_value += position.quantity * price;
                        invested += position.quantity * position.entry_price;
                        unrealized += position.unrealized_pnl(price);
                    }
                    Err(e) => tracing::warn!("{}: no price, holding left out of report: {}", market, e),
                }
            }

            let query = ClosedOrdersQuery::latest(market, 100);
            let closed = with_retry(&self.config.retry, "list_closed_orders", || {
                self.gateway.list_closed_orders(&query)
            })
            .await;
            match closed {
                Ok(closed) => {
                    today_trades += closed
                        .iter()
                        .filter(|o| o.status == OrderStatus::Filled)
                        .filter(|o| local_date(o.created_at) == today)
                        .count();
                }
                Err(e) => tracing::warn!("{}: closed orders unavailable for report: {}", market, e),
            }
        }

        let profit_percent = if invested > 0.0 {
            unrealized / invested * 100.0
        } else {
            0.0
        };
        let report = Report {
            cash,
            holdings_value,
            total_assets: cash + holdings_value,
            profit_percent,
            open_positions,
            today_trades,
            today_realized_loss: self.today_realized_loss(),
        };

        tracing::info!(
            "📊 Assets {:.0} (cash {:.0}, holdings {:.0}), {} open, {} trades today",
            report.total_assets,
            report.cash,
            report.holdings_value,
            report.open_positions,
            report.today_trades
        );
        self.notifier
            .notify(&report.message(&self.config.quote_currency), Severity::Info)
            .await;
        Ok(report)
    }

    // ============== Main loop ==============

    fn spawn_task(&self, tasks: &mut JoinSet<()>, kind: TaskKind) {
        match kind {
            TaskKind::PriceTick | TaskKind::SignalCheck | TaskKind::Reconcile => {
                for market in self.positions.keys() {
                    let this = self.clone();
                    let market = market.clone();
                    tasks.spawn(async move {
                        let result = match kind {
                            TaskKind::PriceTick => this.price_tick(&market).await.map(|_| ()),
                            TaskKind::SignalCheck => this.check_signal(&market).await.map(|_| ()),
                            _ => this.check_position(&market).await.map(|_| ()),
                        };
                        if let Err(e) = result {
                            log_task_error(kind, &market, &e);
                        }
                    });
                }
            }
            TaskKind::OrderCleanup => {
                let this = self.clone();
                tasks.spawn(async move {
                    if let Err(e) = this.cancel_abnormal_orders().await {
                        log_task_error(kind, "*", &e);
                    }
                });
            }
            TaskKind::Report => {
                let this = self.clone();
                tasks.spawn(async move {
                    if let Err(e) = this.report().await {
                        log_task_error(kind, "*", &e);
                    }
                });
            }
        }
    }

    /// Run the scheduler until `shutdown` resolves.
    ///
    /// On shutdown no new ticks are scheduled, in-flight tasks are awaited
    /// and every market gets a final reconciliation so no position is left
    /// ENTERING or EXITING.
    pub async fn run<F>(self, scheduler: Scheduler, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut scheduler = scheduler;
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        tracing::info!(
            "🚀 Trading {} markets on {} ({} strategy)",
            self.positions.len(),
            self.gateway.name(),
            self.analyzer.strategy_name()
        );
        self.notifier
            .notify(
                &format!(
                    "Automated trading started on {} ({} markets)",
                    self.gateway.name(),
                    self.positions.len()
                ),
                Severity::Info,
            )
            .await;

        let mut last = Instant::now();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(scheduler.until_next()) => {}
            }

            let now = Instant::now();
            let due = scheduler.advance(now - last);
            last = now;

            for kind in due {
                self.spawn_task(&mut tasks, kind);
            }

            // Reap finished tasks so the set does not grow unbounded
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!("Task panicked: {}", e);
                }
            }
        }

        tracing::info!("🛑 Shutdown requested, waiting for {} in-flight tasks", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Task panicked: {}", e);
            }
        }

        self.shutdown_reconcile().await;

        self.notifier
            .notify("Automated trading stopped", Severity::Critical)
            .await;
        tracing::info!("👋 Shutdown complete");
    }

    /// Final pass: settle or cancel every pending order and reconcile
    pub async fn shutdown_reconcile(&self) {
        for market in self.positions.keys() {
            if let Err(e) = self.reconcile_market(market, true).await {
                tracing::error!("{}: final reconciliation failed: {}", market, e);
            }
        }
    }
}

fn local_date(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&Local).date_naive()
}

/// Errors stop at the task boundary; other markets and ticks keep running
fn log_task_error(kind: TaskKind, market: &str, err: &TradingError) {
    match err {
        TradingError::InsufficientData(e) => tracing::debug!("{:?} {}: {}", kind, market, e),
        TradingError::Gateway(e) if e.is_retryable() => {
            tracing::warn!("{:?} {}: {}", kind, market, e)
        }
        _ => tracing::error!("{:?} {}: {}", kind, market, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::paper::FillMode;
    use crate::gateway::PaperGateway;
    use crate::models::Candle;
    use crate::strategy::IndicatorCrossStrategy;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: std::sync::Mutex<Vec<(String, Severity)>>,
    }

    impl RecordingNotifier {
        fn messages(&self) -> Vec<(String, Severity)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, message: &str, severity: Severity) {
            self.sent.lock().unwrap().push((message.to_string(), severity));
        }
    }

    fn candles(prices: &[f64]) -> Vec<Candle> {
        let start = Utc::now() - chrono::Duration::hours(prices.len() as i64);
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| Candle {
                market: "KRW-BTC".to_string(),
                open_time: start + chrono::Duration::hours(i as i64),
                open: p,
                high: p,
                low: p,
                close: p,
                volume: 1.0,
            })
            .collect()
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.markets = vec!["KRW-BTC".to_string()];
        config.execution.order_confirm_poll_ms = 1;
        config.execution.fee_rate = 0.0;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config
    }

    fn setup(config: AppConfig) -> (Orchestrator, Arc<PaperGateway>, Arc<RecordingNotifier>) {
        let gateway = Arc::new(PaperGateway::new("KRW", 1_000_000.0, config.execution.fee_rate));
        let notifier = Arc::new(RecordingNotifier::default());
        let analyzer = Analyzer::new(Arc::new(IndicatorCrossStrategy::new()), config.risk.clone());
        let markets = config.markets.clone();
        let orchestrator =
            Orchestrator::new(config, markets, gateway.clone(), notifier.clone(), analyzer);
        (orchestrator, gateway, notifier)
    }

    fn falling() -> Vec<f64> {
        (0..60).map(|i| 1_000.0 - 0.2 * (i * i) as f64).collect()
    }

    #[tokio::test]
    async fn test_oversold_buy_enters_long() {
        let (orch, gateway, notifier) = setup(test_config());
        gateway.set_candles("KRW-BTC", candles(&falling()));
        gateway.set_price("KRW-BTC", 300.0);

        let outcome = orch.check_signal("KRW-BTC").await.unwrap();

        // Normal conviction spends half of the 100k limit
        assert_eq!(
            outcome,
            TickOutcome::Entered {
                price: 300.0,
                quantity: 50_000.0 / 300.0
            }
        );
        let pm = orch.position_manager("KRW-BTC").await.unwrap();
        assert_eq!(pm.status(), PositionStatus::Long);
        assert!(pm.invariants_hold());
        assert_eq!(notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_daily_loss_limit_denies_and_notifies_once() {
        let (orch, gateway, notifier) = setup(test_config());
        gateway.set_candles("KRW-BTC", candles(&falling()));
        gateway.set_price("KRW-BTC", 300.0);
        orch.daily().record(-50_000.0, Orchestrator::today());

        for _ in 0..2 {
            let outcome = orch.check_signal("KRW-BTC").await.unwrap();
            assert!(matches!(outcome, TickOutcome::Denied(_)));
        }

        assert!(gateway.orders().is_empty());
        let notices: Vec<_> = notifier
            .messages()
            .into_iter()
            .filter(|(m, _)| m.contains("Daily loss limit reached"))
            .collect();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].1, Severity::Info);
    }

    #[tokio::test]
    async fn test_lost_buy_response_places_one_order() {
        let (orch, gateway, _) = setup(test_config());
        gateway.set_candles("KRW-BTC", candles(&falling()));
        gateway.set_price("KRW-BTC", 300.0);
        gateway.lose_next_response("place_market_buy");

        let outcome = orch.check_signal("KRW-BTC").await.unwrap();

        assert!(matches!(outcome, TickOutcome::Entered { .. }));
        assert_eq!(gateway.orders().len(), 1);
        let pm = orch.position_manager("KRW-BTC").await.unwrap();
        assert!((pm.position().quantity - gateway.balance("BTC")).abs() < QUANTITY_EPSILON);
    }

    #[tokio::test]
    async fn test_unconfirmable_buy_left_for_reconciliation() {
        let (orch, gateway, notifier) = setup(test_config());
        gateway.set_candles("KRW-BTC", candles(&falling()));
        gateway.set_price("KRW-BTC", 300.0);
        gateway.lose_next_response("place_market_buy");
        gateway.fail_next("find_order", GatewayError::Permanent("lookup disabled".into()));

        let outcome = orch.check_signal("KRW-BTC").await.unwrap();
        assert_eq!(outcome, TickOutcome::Pending);
        assert_eq!(gateway.orders().len(), 1);
        assert_eq!(
            orch.position_status("KRW-BTC").await,
            Some(PositionStatus::Entering)
        );
        assert!(notifier
            .messages()
            .iter()
            .any(|(m, s)| m.contains("could not be confirmed") && *s == Severity::Warning));

        // Balances show the fill; reconciliation adopts it
        assert!(orch.check_position("KRW-BTC").await.unwrap().is_some());
        let pm = orch.position_manager("KRW-BTC").await.unwrap();
        assert_eq!(pm.status(), PositionStatus::Long);
        assert!((pm.position().quantity - gateway.balance("BTC")).abs() < QUANTITY_EPSILON);
    }

    #[tokio::test]
    async fn test_partial_stop_loss_keeps_remainder_long() {
        let (orch, gateway, _) = setup(test_config());
        gateway.set_candles("KRW-BTC", candles(&falling()));
        gateway.set_holding("BTC", 1.0, 100_000.0);
        gateway.set_price("KRW-BTC", 100_000.0);
        orch.check_position("KRW-BTC").await.unwrap();

        gateway.set_price("KRW-BTC", 90_000.0);
        gateway.set_fill_ratio(0.5);
        let outcome = orch.check_signal("KRW-BTC").await.unwrap();

        let TickOutcome::PartiallyExited(trade) = outcome else {
            panic!("expected a partial exit, got {:?}", outcome);
        };
        assert_eq!(trade.quantity, 0.5);
        assert_eq!(trade.realized_pnl, -5_000.0);
        assert_eq!(orch.today_realized_loss(), 5_000.0);

        let pm = orch.position_manager("KRW-BTC").await.unwrap();
        assert_eq!(pm.status(), PositionStatus::Long);
        assert_eq!(pm.position().quantity, 0.5);
        assert_eq!(pm.position().entry_price, 100_000.0);
        assert!((pm.position().quantity - gateway.balance("BTC")).abs() < QUANTITY_EPSILON);

        // The next tick sells the rest
        gateway.set_fill_ratio(1.0);
        let outcome = orch.check_signal("KRW-BTC").await.unwrap();
        assert!(matches!(outcome, TickOutcome::Exited(_)));
        assert_eq!(
            orch.position_status("KRW-BTC").await,
            Some(PositionStatus::Flat)
        );
        assert_eq!(orch.today_realized_loss(), 10_000.0);
    }

    #[tokio::test]
    async fn test_failed_buy_returns_to_flat() {
        let (orch, gateway, _) = setup(test_config());
        gateway.set_candles("KRW-BTC", candles(&falling()));
        gateway.set_price("KRW-BTC", 300.0);
        gateway.fail_next(
            "place_market_buy",
            GatewayError::Permanent("invalid_volume".into()),
        );

        let result = orch.check_signal("KRW-BTC").await;

        assert!(matches!(result, Err(TradingError::ActionFailed { action: "buy", .. })));
        assert_eq!(
            orch.position_status("KRW-BTC").await,
            Some(PositionStatus::Flat)
        );
    }

    #[tokio::test]
    async fn test_unconfirmed_buy_stays_entering() {
        let (orch, gateway, _) = setup(test_config());
        gateway.set_candles("KRW-BTC", candles(&falling()));
        gateway.set_price("KRW-BTC", 300.0);
        gateway.set_fill_mode(FillMode::Resting);

        let outcome = orch.check_signal("KRW-BTC").await.unwrap();
        assert_eq!(outcome, TickOutcome::Pending);
        assert_eq!(
            orch.position_status("KRW-BTC").await,
            Some(PositionStatus::Entering)
        );

        // Young open order: reconciliation waits for it
        assert_eq!(orch.check_position("KRW-BTC").await.unwrap(), None);
        assert_eq!(
            orch.position_status("KRW-BTC").await,
            Some(PositionStatus::Entering)
        );

        // Once it fills, the next pass confirms the entry
        let order_id = gateway.orders()[0].id.clone();
        gateway.settle_order(&order_id).unwrap();
        assert_eq!(orch.check_position("KRW-BTC").await.unwrap(), None);
        assert_eq!(
            orch.position_status("KRW-BTC").await,
            Some(PositionStatus::Long)
        );
    }

    #[tokio::test]
    async fn test_price_tick_ratchets_high() {
        let (orch, gateway, _) = setup(test_config());
        gateway.set_holding("BTC", 1.0, 100_000.0);
        gateway.set_price("KRW-BTC", 100_000.0);
        orch.check_position("KRW-BTC").await.unwrap();

        gateway.set_price("KRW-BTC", 120_000.0);
        orch.price_tick("KRW-BTC").await.unwrap();
        gateway.set_price("KRW-BTC", 110_000.0);
        orch.price_tick("KRW-BTC").await.unwrap();

        let pm = orch.position_manager("KRW-BTC").await.unwrap();
        assert_eq!(pm.position().highest_price_since_entry, 120_000.0);
    }

    #[tokio::test]
    async fn test_unknown_market_is_error() {
        let (orch, _, _) = setup(test_config());
        assert!(orch.check_signal("KRW-DOGE").await.is_err());
    }

    #[tokio::test]
    async fn test_report_summarises_portfolio() {
        let (orch, gateway, notifier) = setup(test_config());
        gateway.set_holding("BTC", 1.0, 100_000.0);
        gateway.set_price("KRW-BTC", 110_000.0);
        orch.check_position("KRW-BTC").await.unwrap();

        let report = orch.report().await.unwrap();

        assert_eq!(report.cash, 1_000_000.0);
        assert_eq!(report.holdings_value, 110_000.0);
        assert_eq!(report.total_assets, 1_110_000.0);
        assert!((report.profit_percent - 10.0).abs() < 1e-9);
        assert_eq!(report.open_positions, 1);
        assert!(notifier
            .messages()
            .iter()
            .any(|(m, _)| m.contains("Trading summary")));
    }

    #[tokio::test]
    async fn test_report_skips_market_without_price() {
        let mut config = test_config();
        config.markets = vec!["KRW-BTC".to_string(), "KRW-ETH".to_string()];
        let (orch, gateway, _) = setup(config);
        gateway.set_holding("BTC", 1.0, 100_000.0);
        gateway.set_holding("ETH", 1.0, 3_000_000.0);
        gateway.set_price("KRW-BTC", 110_000.0);
        orch.check_position("KRW-BTC").await.unwrap();
        orch.check_position("KRW-ETH").await.unwrap();

        // No ETH quote at all
        let report = orch.report().await.unwrap();

        assert_eq!(report.open_positions, 2);
        assert_eq!(report.holdings_value, 110_000.0);
        assert!((report.profit_percent - 10.0).abs() < 1e-9);
    }
}
