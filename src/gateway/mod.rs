// Exchange gateway: the only boundary that talks to an exchange
pub mod kis;
pub mod paper;
pub mod upbit;

pub use kis::KisGateway;
pub use paper::PaperGateway;
pub use upbit::UpbitGateway;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::{GatewayError, GatewayResult};
use crate::models::{Balance, Candle, CandleInterval, ClosedOrdersQuery, Order};

/// Exchange operations the engine depends on.
///
/// Every call may fail with [`GatewayError::Transient`](crate::error::GatewayError)
/// (retry) or `Permanent` (escalate). Implementations must be shareable
/// across market tasks.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Short name used in logs and notifications
    fn name(&self) -> &str;

    /// Tradable markets quoted in `quote` (e.g. "KRW")
    async fn list_markets(&self, quote: &str) -> GatewayResult<Vec<String>>;

    async fn get_current_price(&self, market: &str) -> GatewayResult<f64>;

    /// Up to `count` candles, oldest first, ending at `to` (or now)
    async fn get_candles(
        &self,
        market: &str,
        interval: CandleInterval,
        count: usize,
        to: Option<DateTime<Utc>>,
    ) -> GatewayResult<Vec<Candle>>;

    /// Market buy spending `quote_amount` of the quote currency.
    ///
    /// `identifier` is a client-chosen id, unique per trading decision. A
    /// second order with the same identifier must be rejected.
    async fn place_market_buy(
        &self,
        market: &str,
        quote_amount: f64,
        identifier: &str,
    ) -> GatewayResult<Order>;

    /// Market sell of `quantity` base units
    async fn place_market_sell(
        &self,
        market: &str,
        quantity: f64,
        identifier: &str,
    ) -> GatewayResult<Order>;

    /// Order placed with `identifier`, or `None` if the exchange never
    /// accepted one.
    ///
    /// Exchanges without client identifiers keep the default, which fails
    /// permanently so callers treat the outcome as unknown.
    async fn find_order(&self, identifier: &str) -> GatewayResult<Option<Order>> {
        Err(GatewayError::Permanent(format!(
            "{} cannot look up order {} by identifier",
            self.name(),
            identifier
        )))
    }

    async fn get_order_status(&self, order_id: &str) -> GatewayResult<Order>;

    /// Cancel an open order.
    ///
    /// Returns `Ok(true)` when the order is (now or already) cancelled and
    /// `Ok(false)` when it reached another terminal state first.
    async fn cancel_order(&self, order_id: &str) -> GatewayResult<bool>;

    async fn list_open_orders(&self, market: Option<&str>) -> GatewayResult<Vec<Order>>;

    async fn list_closed_orders(&self, query: &ClosedOrdersQuery) -> GatewayResult<Vec<Order>>;

    /// Balances keyed by currency code
    async fn get_balances(&self) -> GatewayResult<HashMap<String, Balance>>;
}
