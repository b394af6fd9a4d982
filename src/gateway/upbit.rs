use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::ExchangeGateway;
use crate::config::UpbitConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{
    Balance, Candle, CandleInterval, ClosedOrdersQuery, Order, OrderBy, OrderSide, OrderStatus,
    OrderType,
};

const MAX_CANDLES_PER_REQUEST: usize = 200;

type HmacSha256 = Hmac<Sha256>;

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
struct MarketInfo {
    market: String,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    trade_price: f64,
}

#[derive(Debug, Deserialize)]
struct CandleRaw {
    market: String,
    candle_date_time_utc: String,
    opening_price: f64,
    high_price: f64,
    low_price: f64,
    trade_price: f64,
    candle_acc_trade_volume: f64,
}

#[derive(Debug, Deserialize)]
struct OrderRaw {
    uuid: String,
    side: String,
    #[allow(dead_code)]
    ord_type: String,
    price: Option<String>,
    state: String,
    market: String,
    created_at: String,
    volume: Option<String>,
    executed_volume: String,
    paid_fee: String,
    #[serde(default)]
    trades: Vec<TradeRaw>,
}

#[derive(Debug, Deserialize)]
struct TradeRaw {
    volume: String,
    funds: String,
}

#[derive(Debug, Deserialize)]
struct AccountRaw {
    currency: String,
    balance: String,
    locked: String,
    avg_buy_price: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    name: Option<String>,
    message: Option<String>,
}

// ============== Conversions ==============

fn parse_num(value: &str, field: &str) -> GatewayResult<f64> {
    value
        .parse::<f64>()
        .map_err(|_| GatewayError::Permanent(format!("malformed {} in response: {}", field, value)))
}

fn parse_opt_num(value: Option<&String>, field: &str) -> GatewayResult<f64> {
    value.map(|v| parse_num(v, field)).transpose().map(|v| v.unwrap_or(0.0))
}

/// Map an Upbit order state to ours.
///
/// A market buy reports `cancel` once the unspent remainder is refunded, so
/// a cancelled order with executed volume is a fill.
fn map_state(state: &str, executed_volume: f64) -> OrderStatus {
    match state {
        "wait" | "watch" if executed_volume > 0.0 => OrderStatus::PartiallyFilled,
        "wait" | "watch" => OrderStatus::Submitted,
        "done" => OrderStatus::Filled,
        "cancel" if executed_volume > 0.0 => OrderStatus::Filled,
        "cancel" => OrderStatus::Cancelled,
        _ => OrderStatus::Failed,
    }
}

impl TryFrom<OrderRaw> for Order {
    type Error = GatewayError;

    fn try_from(raw: OrderRaw) -> GatewayResult<Self> {
        let side = match raw.side.as_str() {
            "bid" => OrderSide::Buy,
            "ask" => OrderSide::Sell,
            other => {
                return Err(GatewayError::Permanent(format!("unknown order side: {}", other)))
            }
        };
        let executed_quantity = parse_num(&raw.executed_volume, "executed_volume")?;
        let requested = match side {
            OrderSide::Buy => parse_opt_num(raw.price.as_ref(), "price")?,
            OrderSide::Sell => parse_opt_num(raw.volume.as_ref(), "volume")?,
        };

        let mut traded_volume = 0.0;
        let mut traded_funds = 0.0;
        for trade in &raw.trades {
            traded_volume += parse_num(&trade.volume, "trade volume")?;
            traded_funds += parse_num(&trade.funds, "trade funds")?;
        }
        let avg_fill_price = (traded_volume > 0.0).then(|| traded_funds / traded_volume);

        let created_at = DateTime::parse_from_rfc3339(&raw.created_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| GatewayError::Permanent(format!("malformed created_at: {}", e)))?;

        Ok(Order {
            id: raw.uuid,
            market: raw.market,
            side,
            order_type: OrderType::Market,
            requested,
            status: map_state(&raw.state, executed_quantity),
            executed_quantity,
            avg_fill_price,
            paid_fee: parse_num(&raw.paid_fee, "paid_fee")?,
            created_at,
        })
    }
}

impl TryFrom<CandleRaw> for Candle {
    type Error = GatewayError;

    fn try_from(raw: CandleRaw) -> GatewayResult<Self> {
        let open_time = NaiveDateTime::parse_from_str(&raw.candle_date_time_utc, "%Y-%m-%dT%H:%M:%S")
            .map_err(|e| GatewayError::Permanent(format!("malformed candle time: {}", e)))?
            .and_utc();
        Ok(Candle {
            market: raw.market,
            open_time,
            open: raw.opening_price,
            high: raw.high_price,
            low: raw.low_price,
            close: raw.trade_price,
            volume: raw.candle_acc_trade_volume,
        })
    }
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn query_string(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

// ============== Implementation ==============

/// Upbit REST v1 client.
///
/// Quotation endpoints and exchange (order/account) endpoints are throttled
/// by separate limiters, matching Upbit's separate quota groups.
#[derive(Clone)]
pub struct UpbitGateway {
    client: Client,
    base_url: String,
    access_key: String,
    secret_key: String,
    quotation_limiter: Arc<DirectRateLimiter>,
    exchange_limiter: Arc<DirectRateLimiter>,
}

impl UpbitGateway {
    pub fn new(config: &UpbitConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let quotation_quota = Quota::per_second(
            NonZeroU32::new(config.quotation_per_second).unwrap_or(NonZeroU32::MIN),
        );
        let exchange_quota = Quota::per_minute(
            NonZeroU32::new(config.orders_per_minute).unwrap_or(NonZeroU32::MIN),
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            quotation_limiter: Arc::new(RateLimiter::direct(quotation_quota)),
            exchange_limiter: Arc::new(RateLimiter::direct(exchange_quota)),
        })
    }

    /// HS256 JWT for the exchange endpoints.
    ///
    /// Requests with parameters carry `query_hash`, the SHA-512 of the
    /// unencoded query string.
    fn auth_token(&self, query: &str) -> GatewayResult<String> {
        let mut claims = serde_json::json!({
            "access_key": self.access_key,
            "nonce": Uuid::new_v4().to_string(),
        });
        if !query.is_empty() {
            claims["query_hash"] = hex::encode(Sha512::digest(query.as_bytes())).into();
            claims["query_hash_alg"] = "SHA512".into();
        }

        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        let signing_input = format!("{}.{}", header, payload);

        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| GatewayError::Permanent(format!("invalid secret key: {}", e)))?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", signing_input, signature))
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> GatewayResult<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| GatewayError::Permanent(format!("failed to decode response: {}", e)));
        }

        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| {
                format!(
                    "{}: {}",
                    b.error.name.unwrap_or_default(),
                    b.error.message.unwrap_or_default()
                )
            })
            .unwrap_or(body);

        if status.as_u16() == 429 || status.is_server_error() {
            Err(GatewayError::Transient(format!("Upbit HTTP {}: {}", status, detail)))
        } else if status.as_u16() == 404 {
            Err(GatewayError::NotFound(detail))
        } else {
            Err(GatewayError::Permanent(format!("Upbit HTTP {}: {}", status, detail)))
        }
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> GatewayResult<T> {
        self.quotation_limiter.until_ready().await;
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(params)
            .send()
            .await?;
        Self::read(response).await
    }

    async fn private<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> GatewayResult<T> {
        self.exchange_limiter.until_ready().await;

        let query = query_string(params);
        let token = self.auth_token(&query)?;
        let mut url = format!("{}{}", self.base_url, path);

        let request = if method == Method::POST {
            let body: serde_json::Map<String, serde_json::Value> = params
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                .collect();
            self.client.post(url).json(&body)
        } else {
            if !query.is_empty() {
                url = format!("{}?{}", url, query);
            }
            self.client.request(method, url)
        };

        let response = request.bearer_auth(token).send().await?;
        Self::read(response).await
    }
}

#[async_trait]
impl ExchangeGateway for UpbitGateway {
    fn name(&self) -> &str {
        "upbit"
    }

    async fn list_markets(&self, quote: &str) -> GatewayResult<Vec<String>> {
        let markets: Vec<MarketInfo> = self
            .public_get("/v1/market/all", &[("isDetails", "false".to_string())])
            .await?;
        let prefix = format!("{}-", quote);
        Ok(markets
            .into_iter()
            .map(|m| m.market)
            .filter(|m| m.starts_with(&prefix))
            .collect())
    }

    async fn get_current_price(&self, market: &str) -> GatewayResult<f64> {
        let tickers: Vec<Ticker> = self
            .public_get("/v1/ticker", &[("markets", market.to_string())])
            .await?;
        tickers
            .first()
            .map(|t| t.trade_price)
            .ok_or_else(|| GatewayError::Permanent(format!("no ticker for {}", market)))
    }

    async fn get_candles(
        &self,
        market: &str,
        interval: CandleInterval,
        count: usize,
        to: Option<DateTime<Utc>>,
    ) -> GatewayResult<Vec<Candle>> {
        let path = match interval {
            CandleInterval::Minutes(unit) => format!("/v1/candles/minutes/{}", unit),
            CandleInterval::Days => "/v1/candles/days".to_string(),
        };
        let mut params = vec![
            ("market", market.to_string()),
            ("count", count.min(MAX_CANDLES_PER_REQUEST).to_string()),
        ];
        if let Some(to) = to {
            params.push(("to", format_time(to)));
        }

        let raw: Vec<CandleRaw> = self.public_get(&path, &params).await?;
        // Upbit returns newest first
        let mut candles = raw
            .into_iter()
            .map(Candle::try_from)
            .collect::<GatewayResult<Vec<_>>>()?;
        candles.reverse();
        Ok(candles)
    }

    async fn place_market_buy(
        &self,
        market: &str,
        quote_amount: f64,
        identifier: &str,
    ) -> GatewayResult<Order> {
        let params = [
            ("market", market.to_string()),
            ("side", "bid".to_string()),
            ("price", quote_amount.floor().to_string()),
            ("ord_type", "price".to_string()),
            ("identifier", identifier.to_string()),
        ];
        let raw: OrderRaw = self.private(Method::POST, "/v1/orders", &params).await?;
        raw.try_into()
    }

    async fn place_market_sell(
        &self,
        market: &str,
        quantity: f64,
        identifier: &str,
    ) -> GatewayResult<Order> {
        // Round down so we never ask for more than is held
        let volume = (quantity * 1e8).floor() / 1e8;
        let params = [
            ("market", market.to_string()),
            ("side", "ask".to_string()),
            ("volume", format!("{:.8}", volume)),
            ("ord_type", "market".to_string()),
            ("identifier", identifier.to_string()),
        ];
        let raw: OrderRaw = self.private(Method::POST, "/v1/orders", &params).await?;
        raw.try_into()
    }

    async fn find_order(&self, identifier: &str) -> GatewayResult<Option<Order>> {
        let result: GatewayResult<OrderRaw> = self
            .private(Method::GET, "/v1/order", &[("identifier", identifier.to_string())])
            .await;
        match result {
            Ok(raw) => raw.try_into().map(Some),
            Err(GatewayError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_order_status(&self, order_id: &str) -> GatewayResult<Order> {
        let raw: OrderRaw = self
            .private(Method::GET, "/v1/order", &[("uuid", order_id.to_string())])
            .await?;
        raw.try_into()
    }

    async fn cancel_order(&self, order_id: &str) -> GatewayResult<bool> {
        let current = self.get_order_status(order_id).await?;
        match current.status {
            OrderStatus::Cancelled => return Ok(true),
            status if status.is_terminal() => return Ok(false),
            _ => {}
        }

        let _: OrderRaw = self
            .private(Method::DELETE, "/v1/order", &[("uuid", order_id.to_string())])
            .await?;
        Ok(true)
    }

    async fn list_open_orders(&self, market: Option<&str>) -> GatewayResult<Vec<Order>> {
        let mut params = Vec::new();
        if let Some(market) = market {
            params.push(("market", market.to_string()));
        }
        params.push(("states[]", "wait".to_string()));
        params.push(("states[]", "watch".to_string()));

        let raw: Vec<OrderRaw> = self.private(Method::GET, "/v1/orders/open", &params).await?;
        raw.into_iter().map(Order::try_from).collect()
    }

    /// The endpoint has no page parameter, only a time window. Later pages
    /// are reached by moving the window edge to the last order of the
    /// previous page; orders already returned are dropped.
    async fn list_closed_orders(&self, query: &ClosedOrdersQuery) -> GatewayResult<Vec<Order>> {
        let mut seen = HashSet::new();
        let mut start_time: Option<DateTime<Utc>> = None;
        let mut end_time = query.to;
        let mut page = Vec::new();

        for _ in 0..query.page.max(1) {
            let mut params = vec![
                ("market", query.market.clone()),
                ("states[]", "done".to_string()),
                ("states[]", "cancel".to_string()),
                ("limit", query.limit.to_string()),
                ("order_by", query.order_by.as_str().to_string()),
            ];
            if let Some(start) = start_time {
                params.push(("start_time", format_time(start)));
            }
            if let Some(end) = end_time {
                params.push(("end_time", format_time(end)));
            }

            let raw: Vec<OrderRaw> = self
                .private(Method::GET, "/v1/orders/closed", &params)
                .await?;
            let fetched = raw
                .into_iter()
                .map(Order::try_from)
                .collect::<GatewayResult<Vec<_>>>()?;

            let Some(edge) = fetched.last().map(|o| o.created_at) else {
                return Ok(Vec::new());
            };
            match query.order_by {
                OrderBy::Desc => end_time = Some(edge),
                OrderBy::Asc => start_time = Some(edge),
            }
            page = fetched
                .into_iter()
                .filter(|o| seen.insert(o.id.clone()))
                .collect();
        }
        Ok(page)
    }

    async fn get_balances(&self) -> GatewayResult<HashMap<String, Balance>> {
        let accounts: Vec<AccountRaw> = self.private(Method::GET, "/v1/accounts", &[]).await?;
        accounts
            .into_iter()
            .map(|a| {
                let balance = Balance {
                    currency: a.currency.clone(),
                    balance: parse_num(&a.balance, "balance")?,
                    locked: parse_num(&a.locked, "locked")?,
                    avg_buy_price: parse_num(&a.avg_buy_price, "avg_buy_price")?,
                };
                Ok((a.currency, balance))
            })
            .collect()
    }
}
