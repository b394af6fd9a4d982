use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::ExchangeGateway;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{
    split_market, Balance, Candle, CandleInterval, ClosedOrdersQuery, Order, OrderBy, OrderSide,
    OrderStatus, OrderType,
};

/// How submitted orders behave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Fill at the current price on submission
    Immediate,
    /// Stay `Submitted` until [`PaperGateway::settle_order`] or cancel
    Resting,
}

#[derive(Debug)]
struct PaperState {
    quote: String,
    prices: HashMap<String, f64>,
    candles: HashMap<String, Vec<Candle>>,
    balances: HashMap<String, Balance>,
    orders: Vec<Order>,
    /// Client identifier -> order id
    identifiers: HashMap<String, String>,
    failures: HashMap<&'static str, VecDeque<GatewayError>>,
    lost_responses: HashMap<&'static str, usize>,
    fill_mode: FillMode,
    fill_ratio: f64,
}

/// In-memory exchange for dry runs and tests.
///
/// Market orders fill at the last known price and pay `fee_rate` on the
/// traded value, the way the live exchange charges it. With a quote source
/// attached, prices, candles and markets come from it and only orders and
/// balances are simulated.
pub struct PaperGateway {
    fee_rate: f64,
    quotes: Option<Arc<dyn ExchangeGateway>>,
    state: Mutex<PaperState>,
}

impl PaperGateway {
    pub fn new(quote: &str, quote_balance: f64, fee_rate: f64) -> Self {
        let mut balances = HashMap::new();
        balances.insert(
            quote.to_string(),
            Balance {
                currency: quote.to_string(),
                balance: quote_balance,
                locked: 0.0,
                avg_buy_price: 0.0,
            },
        );

        Self {
            fee_rate,
            quotes: None,
            state: Mutex::new(PaperState {
                quote: quote.to_string(),
                prices: HashMap::new(),
                candles: HashMap::new(),
                balances,
                orders: Vec::new(),
                identifiers: HashMap::new(),
                failures: HashMap::new(),
                lost_responses: HashMap::new(),
                fill_mode: FillMode::Immediate,
                fill_ratio: 1.0,
            }),
        }
    }

    /// Read market data from `quotes` instead of the local tables
    pub fn with_quotes(mut self, quotes: Arc<dyn ExchangeGateway>) -> Self {
        self.quotes = Some(quotes);
        self
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_failure(&self, op: &'static str) -> GatewayResult<()> {
        let mut state = self.state();
        match state.failures.get_mut(op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// True when the response of this call to `op` should be dropped
    fn take_lost_response(&self, op: &'static str) -> bool {
        let mut state = self.state();
        match state.lost_responses.get_mut(op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn set_price(&self, market: &str, price: f64) {
        self.state().prices.insert(market.to_string(), price);
    }

    pub fn set_candles(&self, market: &str, candles: Vec<Candle>) {
        self.state().candles.insert(market.to_string(), candles);
    }

    /// Put a base-asset holding on the book (e.g. bought outside the engine)
    pub fn set_holding(&self, currency: &str, quantity: f64, avg_buy_price: f64) {
        let mut state = self.state();
        if quantity <= 0.0 {
            state.balances.remove(currency);
            return;
        }
        state.balances.insert(
            currency.to_string(),
            Balance {
                currency: currency.to_string(),
                balance: quantity,
                locked: 0.0,
                avg_buy_price,
            },
        );
    }

    pub fn set_fill_mode(&self, mode: FillMode) {
        self.state().fill_mode = mode;
    }

    /// Fill only this fraction of each order's size (1.0 fills fully)
    pub fn set_fill_ratio(&self, ratio: f64) {
        self.state().fill_ratio = ratio.clamp(0.0, 1.0);
    }

    /// Make the next call to `op` fail with `err`. Queued per operation.
    pub fn fail_next(&self, op: &'static str, err: GatewayError) {
        self.state().failures.entry(op).or_default().push_back(err);
    }

    /// Let the next call to `op` take effect but report a timeout, as when
    /// the connection drops after the exchange accepted the request.
    pub fn lose_next_response(&self, op: &'static str) {
        *self.state().lost_responses.entry(op).or_default() += 1;
    }

    /// Shift an order's creation time, for stale-order scenarios
    pub fn backdate_order(&self, order_id: &str, created_at: DateTime<Utc>) {
        if let Some(order) = self.state().orders.iter_mut().find(|o| o.id == order_id) {
            order.created_at = created_at;
        }
    }

    /// Fill a resting order at the current price
    pub fn settle_order(&self, order_id: &str) -> GatewayResult<Order> {
        let mut state = self.state();
        let idx = state
            .orders
            .iter()
            .position(|o| o.id == order_id)
            .ok_or_else(|| GatewayError::NotFound(format!("order {}", order_id)))?;
        if state.orders[idx].status.is_terminal() {
            return Ok(state.orders[idx].clone());
        }
        let mut order = state.orders[idx].clone();
        self.fill(&mut state, &mut order)?;
        state.orders[idx] = order.clone();
        Ok(order)
    }

    pub fn orders(&self) -> Vec<Order> {
        self.state().orders.clone()
    }

    pub fn balance(&self, currency: &str) -> f64 {
        self.state()
            .balances
            .get(currency)
            .map(|b| b.total())
            .unwrap_or(0.0)
    }

    fn price_of(state: &PaperState, market: &str) -> GatewayResult<f64> {
        state
            .prices
            .get(market)
            .copied()
            .ok_or_else(|| GatewayError::Permanent(format!("unknown market: {}", market)))
    }

    /// Apply a fill to balances. Fails permanently on insufficient funds.
    fn fill(&self, state: &mut PaperState, order: &mut Order) -> GatewayResult<()> {
        let price = Self::price_of(state, &order.market)?;
        let (_, base) = split_market(&order.market)
            .ok_or_else(|| GatewayError::Permanent(format!("invalid market: {}", order.market)))?;
        let base = base.to_string();
        let quote = state.quote.clone();

        match order.side {
            OrderSide::Buy => {
                let spend = order.requested * state.fill_ratio;
                let fee = spend * self.fee_rate;
                let available = state.balances.get(&quote).map(|b| b.balance).unwrap_or(0.0);
                if spend + fee > available + 1e-9 {
                    return Err(GatewayError::Permanent(format!(
                        "insufficient funds: need {:.2} {}, have {:.2}",
                        spend + fee,
                        quote,
                        available
                    )));
                }
                let quantity = spend / price;

                if let Some(cash) = state.balances.get_mut(&quote) {
                    cash.balance -= spend + fee;
                }
                let holding = state.balances.entry(base.clone()).or_insert(Balance {
                    currency: base,
                    balance: 0.0,
                    locked: 0.0,
                    avg_buy_price: 0.0,
                });
                let cost = holding.total() * holding.avg_buy_price + spend;
                holding.balance += quantity;
                holding.avg_buy_price = cost / holding.total();

                order.executed_quantity = quantity;
                order.paid_fee = fee;
            }
            OrderSide::Sell => {
                let quantity = order.requested * state.fill_ratio;
                let held = state.balances.get(&base).map(|b| b.balance).unwrap_or(0.0);
                if quantity > held + 1e-9 {
                    return Err(GatewayError::Permanent(format!(
                        "insufficient funds: sell {} {}, have {}",
                        quantity, base, held
                    )));
                }
                let proceeds = quantity * price;
                let fee = proceeds * self.fee_rate;

                let remaining = held - quantity;
                if remaining <= 1e-9 {
                    state.balances.remove(&base);
                } else if let Some(holding) = state.balances.get_mut(&base) {
                    holding.balance = remaining;
                }
                if let Some(cash) = state.balances.get_mut(&quote) {
                    cash.balance += proceeds - fee;
                }

                order.executed_quantity = quantity;
                order.paid_fee = fee;
            }
        }

        order.avg_fill_price = Some(price);
        order.status = OrderStatus::Filled;
        Ok(())
    }

    fn submit(
        &self,
        market: &str,
        side: OrderSide,
        requested: f64,
        identifier: &str,
    ) -> GatewayResult<Order> {
        if !(requested > 0.0 && requested.is_finite()) {
            return Err(GatewayError::Permanent(format!(
                "invalid order size: {}",
                requested
            )));
        }

        let mut state = self.state();
        Self::price_of(&state, market)?;
        if state.identifiers.contains_key(identifier) {
            return Err(GatewayError::Permanent(format!(
                "duplicate identifier: {}",
                identifier
            )));
        }

        let mut order = Order {
            id: Uuid::new_v4().to_string(),
            market: market.to_string(),
            side,
            order_type: OrderType::Market,
            requested,
            status: OrderStatus::Submitted,
            executed_quantity: 0.0,
            avg_fill_price: None,
            paid_fee: 0.0,
            created_at: Utc::now(),
        };

        if state.fill_mode == FillMode::Immediate {
            self.fill(&mut state, &mut order)?;
        }

        state
            .identifiers
            .insert(identifier.to_string(), order.id.clone());
        state.orders.push(order.clone());
        Ok(order)
    }

    fn place(
        &self,
        op: &'static str,
        market: &str,
        side: OrderSide,
        requested: f64,
        identifier: &str,
    ) -> GatewayResult<Order> {
        self.take_failure(op)?;
        let order = self.submit(market, side, requested, identifier)?;
        if self.take_lost_response(op) {
            return Err(GatewayError::Transient(format!("{}: response lost", op)));
        }
        Ok(order)
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    fn name(&self) -> &str {
        "paper"
    }

    async fn list_markets(&self, quote: &str) -> GatewayResult<Vec<String>> {
        self.take_failure("list_markets")?;
        if let Some(quotes) = &self.quotes {
            return quotes.list_markets(quote).await;
        }
        let prefix = format!("{}-", quote);
        let mut markets: Vec<String> = self
            .state()
            .prices
            .keys()
            .filter(|m| m.starts_with(&prefix))
            .cloned()
            .collect();
        markets.sort();
        Ok(markets)
    }

    async fn get_current_price(&self, market: &str) -> GatewayResult<f64> {
        self.take_failure("get_current_price")?;
        if let Some(quotes) = &self.quotes {
            let price = quotes.get_current_price(market).await?;
            // Fills happen at the last price seen
            self.set_price(market, price);
            return Ok(price);
        }
        Self::price_of(&self.state(), market)
    }

    async fn get_candles(
        &self,
        market: &str,
        interval: CandleInterval,
        count: usize,
        to: Option<DateTime<Utc>>,
    ) -> GatewayResult<Vec<Candle>> {
        self.take_failure("get_candles")?;
        if let Some(quotes) = &self.quotes {
            return quotes.get_candles(market, interval, count, to).await;
        }
        let state = self.state();
        let candles: Vec<Candle> = state
            .candles
            .get(market)
            .map(|all| {
                all.iter()
                    .filter(|c| to.map(|t| c.open_time <= t).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let skip = candles.len().saturating_sub(count);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn place_market_buy(
        &self,
        market: &str,
        quote_amount: f64,
        identifier: &str,
    ) -> GatewayResult<Order> {
        self.place("place_market_buy", market, OrderSide::Buy, quote_amount, identifier)
    }

    async fn place_market_sell(
        &self,
        market: &str,
        quantity: f64,
        identifier: &str,
    ) -> GatewayResult<Order> {
        self.place("place_market_sell", market, OrderSide::Sell, quantity, identifier)
    }

    async fn find_order(&self, identifier: &str) -> GatewayResult<Option<Order>> {
        self.take_failure("find_order")?;
        let state = self.state();
        Ok(state
            .identifiers
            .get(identifier)
            .and_then(|id| state.orders.iter().find(|o| &o.id == id))
            .cloned())
    }

    async fn get_order_status(&self, order_id: &str) -> GatewayResult<Order> {
        self.take_failure("get_order_status")?;
        self.state()
            .orders
            .iter()
            .find(|o| o.id == order_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("order {}", order_id)))
    }

    async fn cancel_order(&self, order_id: &str) -> GatewayResult<bool> {
        self.take_failure("cancel_order")?;
        let mut state = self.state();
        let order = state
            .orders
            .iter_mut()
            .find(|o| o.id == order_id)
            .ok_or_else(|| GatewayError::NotFound(format!("order {}", order_id)))?;

        match order.status {
            OrderStatus::Cancelled => Ok(true),
            status if status.is_terminal() => Ok(false),
            _ => {
                order.status = OrderStatus::Cancelled;
                Ok(true)
            }
        }
    }

    async fn list_open_orders(&self, market: Option<&str>) -> GatewayResult<Vec<Order>> {
        self.take_failure("list_open_orders")?;
        Ok(self
            .state()
            .orders
            .iter()
            .filter(|o| !o.status.is_terminal())
            .filter(|o| market.map(|m| o.market == m).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_closed_orders(&self, query: &ClosedOrdersQuery) -> GatewayResult<Vec<Order>> {
        self.take_failure("list_closed_orders")?;
        let mut closed: Vec<Order> = self
            .state()
            .orders
            .iter()
            .filter(|o| o.market == query.market && o.status.is_terminal())
            .filter(|o| query.to.map(|t| o.created_at <= t).unwrap_or(true))
            .cloned()
            .collect();

        closed.sort_by_key(|o| o.created_at);
        if query.order_by == OrderBy::Desc {
            closed.reverse();
        }

        let limit = query.limit as usize;
        let skip = (query.page.max(1) as usize - 1) * limit;
        Ok(closed.into_iter().skip(skip).take(limit).collect())
    }

    async fn get_balances(&self) -> GatewayResult<HashMap<String, Balance>> {
        self.take_failure("get_balances")?;
        Ok(self.state().balances.clone())
    }
}
