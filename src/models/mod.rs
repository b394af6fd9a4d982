use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OHLCV candle for one fixed interval. Immutable once closed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub market: String,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Candle resolution requested from a gateway
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CandleInterval {
    Minutes(u32),
    Days,
}

/// Indicator values at the latest candle. Always recomputed from candles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct IndicatorSnapshot {
    pub rsi: f64,
    pub macd_line: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub bollinger_upper: f64,
    pub bollinger_lower: f64,
    pub moving_average_short: f64,
    pub moving_average_20d: f64,
}

/// Trading decision kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalKind {
    Buy,
    Sell,
    /// No action
    Hold,
}

/// How many indicators agree on the decision.
///
/// Strong buys size at the full per-trade limit, normal buys at a fraction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Conviction {
    Normal,
    Strong,
}

/// Decision produced once per analysis tick. Not retained beyond logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub market: String,
    pub timestamp: DateTime<Utc>,
    pub kind: SignalKind,
    pub conviction: Conviction,
    pub price: f64,
    pub basis: IndicatorSnapshot,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Market,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }
}

/// Exchange order as seen through the gateway.
///
/// `requested` is a quote amount for market buys (KRW to spend) and a base
/// quantity for market sells.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: String,
    pub market: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub requested: f64,
    pub status: OrderStatus,
    pub executed_quantity: f64,
    pub avg_fill_price: Option<f64>,
    pub paid_fee: f64,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Quote value actually traded (price * quantity)
    pub fn executed_funds(&self) -> f64 {
        self.avg_fill_price.unwrap_or(0.0) * self.executed_quantity
    }
}

/// Holding of one asset on the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Balance {
    pub currency: String,
    pub balance: f64,
    pub locked: f64,
    pub avg_buy_price: f64,
}

impl Balance {
    pub fn total(&self) -> f64 {
        self.balance + self.locked
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderBy {
    Asc,
    Desc,
}

impl OrderBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderBy::Asc => "asc",
            OrderBy::Desc => "desc",
        }
    }
}

/// Page request for closed (terminal) orders
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedOrdersQuery {
    pub market: String,
    pub to: Option<DateTime<Utc>>,
    pub page: u32,
    pub limit: u32,
    pub order_by: OrderBy,
}

impl ClosedOrdersQuery {
    pub fn latest(market: &str, limit: u32) -> Self {
        Self {
            market: market.to_string(),
            to: None,
            page: 1,
            limit,
            order_by: OrderBy::Desc,
        }
    }
}

/// Split `KRW-BTC` into (`KRW`, `BTC`)
pub fn split_market(market: &str) -> Option<(&str, &str)> {
    let (quote, base) = market.split_once('-')?;
    if quote.is_empty() || base.is_empty() {
        return None;
    }
    Some((quote, base))
}
