use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::ExchangeGateway;
use crate::config::KisConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{
    split_market, Balance, Candle, CandleInterval, ClosedOrdersQuery, Order, OrderBy, OrderSide,
    OrderStatus, OrderType,
};

/// Tokens are renewed this long before they expire
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Request rate exceeded
const RATE_LIMIT_CODE: &str = "EGW00201";
/// Access token expired
const EXPIRED_TOKEN_CODE: &str = "EGW00123";

/// Cash balances and stock prices are in won
const QUOTE: &str = "KRW";

/// Rows per daily chart request
const CHART_PAGE_DAYS: i64 = 140;

/// How far back order lookups search
const ORDER_LOOKBACK_DAYS: i64 = 7;
const CLOSED_ORDER_LOOKBACK_DAYS: i64 = 30;

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
struct TokenReply {
    access_token: String,
    expires_in: u64,
}

/// Status fields every `uapi` response carries
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Status {
    rt_cd: Option<String>,
    msg_cd: Option<String>,
    msg1: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PriceReply {
    output: PriceRaw,
}

#[derive(Debug, Deserialize)]
struct PriceRaw {
    stck_prpr: String,
}

#[derive(Debug, Deserialize)]
struct ChartReply {
    #[serde(default)]
    output2: Vec<DailyBarRaw>,
}

#[derive(Debug, Deserialize)]
struct DailyBarRaw {
    #[serde(default)]
    stck_bsop_date: String,
    #[serde(default)]
    stck_oprc: String,
    #[serde(default)]
    stck_hgpr: String,
    #[serde(default)]
    stck_lwpr: String,
    #[serde(default)]
    stck_clpr: String,
    #[serde(default)]
    acml_vol: String,
}

#[derive(Debug, Deserialize)]
struct OrderReply {
    output: PlacedRaw,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
struct PlacedRaw {
    odno: String,
}

#[derive(Debug, Deserialize)]
struct FillsReply {
    #[serde(default)]
    output1: Vec<FillRaw>,
}

#[derive(Debug, Clone, Deserialize)]
struct FillRaw {
    ord_dt: String,
    ord_tmd: String,
    ord_gno_brno: String,
    odno: String,
    /// Set on cancel and amend rows; empty for placed orders
    #[serde(default)]
    orgn_odno: String,
    /// "01" sell, "02" buy
    sll_buy_dvsn_cd: String,
    pdno: String,
    ord_qty: String,
    tot_ccld_qty: String,
    #[serde(default)]
    avg_prvs: String,
    #[serde(default)]
    rmn_qty: String,
    #[serde(default)]
    cncl_yn: String,
}

#[derive(Debug, Deserialize)]
struct BalanceReply {
    #[serde(default)]
    output1: Vec<HoldingRaw>,
    #[serde(default)]
    output2: Vec<CashRaw>,
}

#[derive(Debug, Deserialize)]
struct HoldingRaw {
    pdno: String,
    hldg_qty: String,
    #[serde(default)]
    ord_psbl_qty: String,
    pchs_avg_pric: String,
}

#[derive(Debug, Deserialize)]
struct CashRaw {
    /// Deposit after pending settlements (D+2)
    prvs_rcdl_excc_amt: String,
}

// ============== Conversions ==============

/// KIS sends numbers as strings and leaves unused ones empty
fn parse_num(value: &str, field: &str) -> GatewayResult<f64> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0.0);
    }
    value
        .parse::<f64>()
        .map_err(|_| GatewayError::Permanent(format!("malformed {} in response: {}", field, value)))
}

fn kst_now() -> NaiveDateTime {
    to_kst(Utc::now())
}

fn to_kst(at: DateTime<Utc>) -> NaiveDateTime {
    (at + chrono::Duration::hours(9)).naive_utc()
}

fn from_kst(local: NaiveDateTime) -> DateTime<Utc> {
    (local - chrono::Duration::hours(9)).and_utc()
}

fn ymd(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

fn parse_kst(date: &str, time: &str) -> GatewayResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(&format!("{}{:0<6}", date, time), "%Y%m%d%H%M%S")
        .map(from_kst)
        .map_err(|e| GatewayError::Permanent(format!("malformed order time {} {}: {}", date, time, e)))
}

/// `KRW-005930` -> `005930`
fn stock_code(market: &str) -> GatewayResult<&str> {
    match split_market(market) {
        Some((QUOTE, code)) => Ok(code),
        _ => Err(GatewayError::Permanent(format!(
            "not a {}-CODE stock market: {}",
            QUOTE, market
        ))),
    }
}

fn market_of(code: &str) -> String {
    format!("{}-{}", QUOTE, code)
}

/// Map a daily-fill row to an order status.
///
/// Domestic orders expire at the close, so a row with nothing remaining is
/// final; any executed quantity makes it a fill.
fn map_fill(ordered: f64, executed: f64, remaining: f64, cancelled: bool) -> OrderStatus {
    if ordered > 0.0 && executed >= ordered {
        OrderStatus::Filled
    } else if cancelled || remaining <= 0.0 {
        if executed > 0.0 {
            OrderStatus::Filled
        } else {
            OrderStatus::Cancelled
        }
    } else if executed > 0.0 {
        OrderStatus::PartiallyFilled
    } else {
        OrderStatus::Submitted
    }
}

impl TryFrom<FillRaw> for Order {
    type Error = GatewayError;

    fn try_from(raw: FillRaw) -> GatewayResult<Self> {
        let side = match raw.sll_buy_dvsn_cd.as_str() {
            "01" => OrderSide::Sell,
            "02" => OrderSide::Buy,
            other => {
                return Err(GatewayError::Permanent(format!("unknown order side: {}", other)))
            }
        };
        let ordered = parse_num(&raw.ord_qty, "ord_qty")?;
        let executed = parse_num(&raw.tot_ccld_qty, "tot_ccld_qty")?;
        let remaining = parse_num(&raw.rmn_qty, "rmn_qty")?;
        let avg_price = parse_num(&raw.avg_prvs, "avg_prvs")?;

        Ok(Order {
            id: raw.odno,
            market: market_of(&raw.pdno),
            side,
            order_type: OrderType::Market,
            requested: ordered,
            status: map_fill(ordered, executed, remaining, raw.cncl_yn == "Y"),
            executed_quantity: executed,
            avg_fill_price: (executed > 0.0 && avg_price > 0.0).then_some(avg_price),
            // Commission is settled on the account, not reported per order
            paid_fee: 0.0,
            created_at: parse_kst(&raw.ord_dt, &raw.ord_tmd)?,
        })
    }
}

impl DailyBarRaw {
    fn into_candle(self, market: &str) -> GatewayResult<Candle> {
        let open_time = NaiveDateTime::parse_from_str(
            &format!("{}000000", self.stck_bsop_date),
            "%Y%m%d%H%M%S",
        )
        .map(from_kst)
        .map_err(|e| GatewayError::Permanent(format!("malformed candle date: {}", e)))?;

        Ok(Candle {
            market: market.to_string(),
            open_time,
            open: parse_num(&self.stck_oprc, "stck_oprc")?,
            high: parse_num(&self.stck_hgpr, "stck_hgpr")?,
            low: parse_num(&self.stck_lwpr, "stck_lwpr")?,
            close: parse_num(&self.stck_clpr, "stck_clpr")?,
            volume: parse_num(&self.acml_vol, "acml_vol")?,
        })
    }
}

// ============== Implementation ==============

struct AccessToken {
    value: String,
    refresh_at: Instant,
}

/// Korea Investment & Securities Open API client for domestic (KRX) stocks.
///
/// Market codes are `KRW-<6-digit code>`. Market orders are sized in whole
/// shares, so a buy spends at most the requested amount. KIS has no client
/// order identifiers; [`ExchangeGateway::find_order`] keeps its default.
pub struct KisGateway {
    client: Client,
    base_url: String,
    app_key: String,
    app_secret: String,
    account_number: String,
    account_code: String,
    virtual_account: bool,
    limiter: Arc<DirectRateLimiter>,
    token: Mutex<Option<AccessToken>>,
}

impl KisGateway {
    pub fn new(config: &KisConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN),
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            app_key: config.app_key.clone(),
            app_secret: config.app_secret.clone(),
            account_number: config.account_number.clone(),
            account_code: config.account_code.clone(),
            virtual_account: config.virtual_account,
            limiter: Arc::new(RateLimiter::direct(quota)),
            token: Mutex::new(None),
        })
    }

    /// Transaction ids of trading endpoints start with `V` on the mock
    /// investment server instead of `T`
    fn tr_id(&self, id: &str) -> String {
        match id.strip_prefix('T') {
            Some(rest) if self.virtual_account => format!("V{}", rest),
            _ => id.to_string(),
        }
    }

    /// Cached OAuth token, renewed shortly before it expires
    async fn access_token(&self) -> GatewayResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(token.value.clone());
        }

        self.limiter.until_ready().await;
        let response = self
            .client
            .post(format!("{}/oauth2/tokenP", self.base_url))
            .json(&serde_json::json!({
                "grant_type": "client_credentials",
                "appkey": self.app_key,
                "appsecret": self.app_secret,
            }))
            .send()
            .await?;
        let issued: TokenReply = Self::read(response).await?;

        let lifetime = Duration::from_secs(issued.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        tracing::info!("🔑 KIS access token issued ({}s)", issued.expires_in);
        *cached = Some(AccessToken {
            value: issued.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(issued.access_token)
    }

    fn rejection(status: &Status) -> GatewayError {
        let code = status.msg_cd.clone().unwrap_or_default();
        let detail = format!("KIS {}: {}", code, status.msg1.clone().unwrap_or_default().trim());
        if code == RATE_LIMIT_CODE || code == EXPIRED_TOKEN_CODE {
            GatewayError::Transient(detail)
        } else {
            GatewayError::Permanent(detail)
        }
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> GatewayResult<T> {
        let http = response.status();
        let body = response.text().await?;
        let status = serde_json::from_str::<Status>(&body).unwrap_or_default();

        if http.as_u16() == 429 || http.is_server_error() {
            return Err(GatewayError::Transient(format!("KIS HTTP {}: {}", http, body)));
        }
        if !http.is_success() {
            if status.msg_cd.is_some() {
                return Err(Self::rejection(&status));
            }
            return Err(GatewayError::Permanent(format!("KIS HTTP {}: {}", http, body)));
        }
        if status.rt_cd.as_deref().map(|c| c != "0").unwrap_or(false) {
            return Err(Self::rejection(&status));
        }

        serde_json::from_str::<T>(&body)
            .map_err(|e| GatewayError::Permanent(format!("failed to decode response: {}", e)))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        tr_id: &str,
        params: &[(&str, String)],
    ) -> GatewayResult<T> {
        let token = self.access_token().await?;
        self.limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        let request = if method == Method::POST {
            let body: serde_json::Map<String, serde_json::Value> = params
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                .collect();
            self.client.post(url).json(&body)
        } else {
            self.client.request(method, url).query(params)
        };

        let response = request
            .bearer_auth(token)
            .header("appkey", self.app_key.as_str())
            .header("appsecret", self.app_secret.as_str())
            .header("tr_id", self.tr_id(tr_id))
            .header("custtype", "P")
            .send()
            .await?;

        let result = Self::read(response).await;
        if let Err(GatewayError::Transient(detail)) = &result {
            if detail.contains(EXPIRED_TOKEN_CODE) {
                tracing::warn!("KIS token expired early, renewing on next call");
                *self.token.lock().await = None;
            }
        }
        result
    }

    fn account(&self) -> [(&'static str, String); 2] {
        [
            ("CANO", self.account_number.clone()),
            ("ACNT_PRDT_CD", self.account_code.clone()),
        ]
    }

    async fn place(&self, market: &str, side: OrderSide, shares: u64) -> GatewayResult<Order> {
        let code = stock_code(market)?;
        let tr_id = match side {
            OrderSide::Buy => "TTTC0802U",
            OrderSide::Sell => "TTTC0801U",
        };
        let mut params = self.account().to_vec();
        params.extend([
            ("PDNO", code.to_string()),
            // 01 = market order
            ("ORD_DVSN", "01".to_string()),
            ("ORD_QTY", shares.to_string()),
            ("ORD_UNPR", "0".to_string()),
        ]);

        let reply: OrderReply = self
            .request(Method::POST, "/uapi/domestic-stock/v1/trading/order-cash", tr_id, &params)
            .await?;
        tracing::debug!("KIS order {} accepted: {:?} {} x{}", reply.output.odno, side, code, shares);

        Ok(Order {
            id: reply.output.odno,
            market: market.to_string(),
            side,
            order_type: OrderType::Market,
            requested: shares as f64,
            status: OrderStatus::Submitted,
            executed_quantity: 0.0,
            avg_fill_price: None,
            paid_fee: 0.0,
            created_at: Utc::now(),
        })
    }

    /// Placed order rows (cancel and amend rows dropped) in
    /// `[start, end]`, newest first
    async fn daily_fills(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        order_no: &str,
    ) -> GatewayResult<Vec<FillRaw>> {
        let mut params = self.account().to_vec();
        params.extend([
            ("INQR_STRT_DT", ymd(start)),
            ("INQR_END_DT", ymd(end)),
            ("SLL_BUY_DVSN_CD", "00".to_string()),
            ("INQR_DVSN", "00".to_string()),
            ("PDNO", String::new()),
            ("CCLD_DVSN", "00".to_string()),
            ("ORD_GNO_BRNO", String::new()),
            ("ODNO", order_no.to_string()),
            ("INQR_DVSN_3", "00".to_string()),
            ("INQR_DVSN_1", String::new()),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
        ]);

        let reply: FillsReply = self
            .request(
                Method::GET,
                "/uapi/domestic-stock/v1/trading/inquire-daily-ccld",
                "TTTC8001R",
                &params,
            )
            .await?;
        Ok(reply
            .output1
            .into_iter()
            .filter(|f| f.orgn_odno.trim().is_empty())
            .collect())
    }

    async fn find_fill(&self, order_id: &str) -> GatewayResult<FillRaw> {
        let today = kst_now().date();
        self.daily_fills(today - chrono::Duration::days(ORDER_LOOKBACK_DAYS), today, order_id)
            .await?
            .into_iter()
            .find(|f| f.odno == order_id)
            .ok_or_else(|| GatewayError::NotFound(format!("KIS order {}", order_id)))
    }
}

#[async_trait]
impl ExchangeGateway for KisGateway {
    fn name(&self) -> &str {
        "kis"
    }

    async fn list_markets(&self, _quote: &str) -> GatewayResult<Vec<String>> {
        Err(GatewayError::Permanent(
            "KIS has no market listing; configure `markets`".to_string(),
        ))
    }

    async fn get_current_price(&self, market: &str) -> GatewayResult<f64> {
        let params = [
            ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
            ("FID_INPUT_ISCD", stock_code(market)?.to_string()),
        ];
        let reply: PriceReply = self
            .request(
                Method::GET,
                "/uapi/domestic-stock/v1/quotations/inquire-price",
                "FHKST01010100",
                &params,
            )
            .await?;
        let price = parse_num(&reply.output.stck_prpr, "stck_prpr")?;
        if price <= 0.0 {
            return Err(GatewayError::Permanent(format!("no price for {}", market)));
        }
        Ok(price)
    }

    async fn get_candles(
        &self,
        market: &str,
        interval: CandleInterval,
        count: usize,
        to: Option<DateTime<Utc>>,
    ) -> GatewayResult<Vec<Candle>> {
        if interval != CandleInterval::Days {
            return Err(GatewayError::Permanent(format!(
                "KIS serves daily candles only, not {:?}",
                interval
            )));
        }
        let code = stock_code(market)?;

        let mut end = to.map(to_kst).unwrap_or_else(kst_now).date();
        let mut candles: Vec<Candle> = Vec::new();
        while candles.len() < count {
            let start = end - chrono::Duration::days(CHART_PAGE_DAYS);
            let params = [
                ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
                ("FID_INPUT_ISCD", code.to_string()),
                ("FID_INPUT_DATE_1", ymd(start)),
                ("FID_INPUT_DATE_2", ymd(end)),
                ("FID_PERIOD_DIV_CODE", "D".to_string()),
                ("FID_ORG_ADJ_PRC", "0".to_string()),
            ];
            let reply: ChartReply = self
                .request(
                    Method::GET,
                    "/uapi/domestic-stock/v1/quotations/inquire-daily-itemchartprice",
                    "FHKST03010100",
                    &params,
                )
                .await?;

            // Newest first; non-trading days come back as empty rows
            let mut page = reply
                .output2
                .into_iter()
                .filter(|bar| !bar.stck_bsop_date.is_empty())
                .map(|bar| bar.into_candle(market))
                .collect::<GatewayResult<Vec<_>>>()?;
            if page.is_empty() {
                break;
            }
            page.reverse();
            page.append(&mut candles);
            candles = page;
            end = start - chrono::Duration::days(1);
        }

        let skip = candles.len().saturating_sub(count);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn place_market_buy(
        &self,
        market: &str,
        quote_amount: f64,
        _identifier: &str,
    ) -> GatewayResult<Order> {
        let price = self.get_current_price(market).await?;
        let shares = (quote_amount / price).floor();
        if shares < 1.0 {
            return Err(GatewayError::Permanent(format!(
                "{:.0} {} buys no whole share of {} at {:.0}",
                quote_amount, QUOTE, market, price
            )));
        }
        let mut order = self.place(market, OrderSide::Buy, shares as u64).await?;
        order.requested = quote_amount;
        Ok(order)
    }

    async fn place_market_sell(
        &self,
        market: &str,
        quantity: f64,
        _identifier: &str,
    ) -> GatewayResult<Order> {
        // Whole shares only; round down so we never sell more than is held
        let shares = (quantity + 1e-9).floor();
        if shares < 1.0 {
            return Err(GatewayError::Permanent(format!(
                "cannot sell {} shares of {}",
                quantity, market
            )));
        }
        self.place(market, OrderSide::Sell, shares as u64).await
    }

    async fn get_order_status(&self, order_id: &str) -> GatewayResult<Order> {
        self.find_fill(order_id).await?.try_into()
    }

    async fn cancel_order(&self, order_id: &str) -> GatewayResult<bool> {
        let fill = self.find_fill(order_id).await?;
        let branch = fill.ord_gno_brno.clone();
        let current = Order::try_from(fill)?;
        match current.status {
            OrderStatus::Cancelled => return Ok(true),
            status if status.is_terminal() => return Ok(false),
            _ => {}
        }

        let mut params = self.account().to_vec();
        params.extend([
            ("KRX_FWDG_ORD_ORGNO", branch),
            ("ORGN_ODNO", order_id.to_string()),
            ("ORD_DVSN", "00".to_string()),
            // 02 = cancel
            ("RVSE_CNCL_DVSN_CD", "02".to_string()),
            ("ORD_QTY", "0".to_string()),
            ("ORD_UNPR", "0".to_string()),
            ("QTY_ALL_ORD_YN", "Y".to_string()),
        ]);
        let _: OrderReply = self
            .request(
                Method::POST,
                "/uapi/domestic-stock/v1/trading/order-rvsecncl",
                "TTTC0803U",
                &params,
            )
            .await?;
        Ok(true)
    }

    async fn list_open_orders(&self, market: Option<&str>) -> GatewayResult<Vec<Order>> {
        // Domestic orders do not outlive the trading day
        let today = kst_now().date();
        let orders = self
            .daily_fills(today, today, "")
            .await?
            .into_iter()
            .map(Order::try_from)
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(orders
            .into_iter()
            .filter(|o| !o.status.is_terminal())
            .filter(|o| market.map(|m| o.market == m).unwrap_or(true))
            .collect())
    }

    /// Searches the month up to `query.to`; paging is applied locally
    async fn list_closed_orders(&self, query: &ClosedOrdersQuery) -> GatewayResult<Vec<Order>> {
        let end = query.to.map(to_kst).unwrap_or_else(kst_now).date();
        let start = end - chrono::Duration::days(CLOSED_ORDER_LOOKBACK_DAYS);
        let mut closed = self
            .daily_fills(start, end, "")
            .await?
            .into_iter()
            .map(Order::try_from)
            .collect::<GatewayResult<Vec<_>>>()?
            .into_iter()
            .filter(|o| o.market == query.market && o.status.is_terminal())
            .filter(|o| query.to.map(|t| o.created_at <= t).unwrap_or(true))
            .collect::<Vec<_>>();

        closed.sort_by_key(|o| o.created_at);
        if query.order_by == OrderBy::Desc {
            closed.reverse();
        }
        let limit = query.limit as usize;
        let skip = (query.page.max(1) as usize - 1) * limit;
        Ok(closed.into_iter().skip(skip).take(limit).collect())
    }

    async fn get_balances(&self) -> GatewayResult<HashMap<String, Balance>> {
        let mut params = self.account().to_vec();
        params.extend([
            ("AFHR_FLPR_YN", "N".to_string()),
            ("OFL_YN", String::new()),
            ("INQR_DVSN", "02".to_string()),
            ("UNPR_DVSN", "01".to_string()),
            ("FUND_STTL_ICLD_YN", "N".to_string()),
            ("FNCG_AMT_AUTO_RDPT_YN", "N".to_string()),
            ("PRCS_DVSN", "01".to_string()),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
        ]);
        let reply: BalanceReply = self
            .request(
                Method::GET,
                "/uapi/domestic-stock/v1/trading/inquire-balance",
                "TTTC8434R",
                &params,
            )
            .await?;

        let mut balances = HashMap::new();
        let cash = reply
            .output2
            .first()
            .map(|c| parse_num(&c.prvs_rcdl_excc_amt, "prvs_rcdl_excc_amt"))
            .transpose()?
            .unwrap_or(0.0);
        balances.insert(
            QUOTE.to_string(),
            Balance {
                currency: QUOTE.to_string(),
                balance: cash,
                locked: 0.0,
                avg_buy_price: 0.0,
            },
        );

        for holding in reply.output1 {
            let held = parse_num(&holding.hldg_qty, "hldg_qty")?;
            if held <= 0.0 {
                continue;
            }
            let sellable = parse_num(&holding.ord_psbl_qty, "ord_psbl_qty")?.min(held);
            balances.insert(
                holding.pdno.clone(),
                Balance {
                    currency: holding.pdno,
                    balance: sellable,
                    locked: held - sellable,
                    avg_buy_price: parse_num(&holding.pchs_avg_pric, "pchs_avg_pric")?,
                },
            );
        }
        Ok(balances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn config(base_url: String) -> KisConfig {
        KisConfig {
            app_key: "test-app".to_string(),
            app_secret: "test-secret".to_string(),
            account_number: "12345678".to_string(),
            base_url,
            ..KisConfig::default()
        }
    }

    async fn token_mock(
        server: &mut mockito::ServerGuard,
        expires_in: u64,
        hits: usize,
    ) -> mockito::Mock {
        server
            .mock("POST", "/oauth2/tokenP")
            .expect(hits)
            .match_body(Matcher::PartialJsonString(
                r#"{"grant_type":"client_credentials","appkey":"test-app"}"#.to_string(),
            ))
            .with_status(200)
            .with_body(format!(
                r#"{{"access_token":"tok","token_type":"Bearer","expires_in":{}}}"#,
                expires_in
            ))
            .create_async()
            .await
    }

    async fn price_mock(
        server: &mut mockito::ServerGuard,
        price: &str,
        hits: usize,
    ) -> mockito::Mock {
        server
            .mock("GET", "/uapi/domestic-stock/v1/quotations/inquire-price")
            .expect(hits)
            .match_query(Matcher::UrlEncoded("FID_INPUT_ISCD".into(), "005930".into()))
            .match_header("authorization", "Bearer tok")
            .match_header("tr_id", "FHKST01010100")
            .with_status(200)
            .with_body(format!(
                r#"{{"rt_cd":"0","msg_cd":"MCA00000","msg1":"OK","output":{{"stck_prpr":"{}"}}}}"#,
                price
            ))
            .create_async()
            .await
    }

    #[test]
    fn test_map_fill() {
        assert_eq!(map_fill(10.0, 0.0, 10.0, false), OrderStatus::Submitted);
        assert_eq!(map_fill(10.0, 4.0, 6.0, false), OrderStatus::PartiallyFilled);
        assert_eq!(map_fill(10.0, 10.0, 0.0, false), OrderStatus::Filled);
        assert_eq!(map_fill(10.0, 0.0, 0.0, true), OrderStatus::Cancelled);
        assert_eq!(map_fill(10.0, 4.0, 0.0, true), OrderStatus::Filled);
    }

    #[test]
    fn test_virtual_account_transaction_ids() {
        let mut cfg = config("http://localhost".to_string());
        cfg.virtual_account = true;
        let gw = KisGateway::new(&cfg).unwrap();
        assert_eq!(gw.tr_id("TTTC0802U"), "VTTC0802U");
        // Quotation ids are shared by both servers
        assert_eq!(gw.tr_id("FHKST01010100"), "FHKST01010100");

        let live = KisGateway::new(&config("http://localhost".to_string())).unwrap();
        assert_eq!(live.tr_id("TTTC0802U"), "TTTC0802U");
    }

    #[test]
    fn test_market_code_must_be_krw() {
        assert_eq!(stock_code("KRW-005930").unwrap(), "005930");
        assert!(stock_code("USD-AAPL").is_err());
        assert!(stock_code("005930").is_err());
    }

    #[tokio::test]
    async fn test_token_is_cached_across_calls() {
        let mut server = mockito::Server::new_async().await;
        let token = token_mock(&mut server, 86_400, 1).await;
        let price = price_mock(&mut server, "71500", 2).await;

        let gw = KisGateway::new(&config(server.url())).unwrap();
        assert_eq!(gw.get_current_price("KRW-005930").await.unwrap(), 71_500.0);
        assert_eq!(gw.get_current_price("KRW-005930").await.unwrap(), 71_500.0);

        token.assert_async().await;
        price.assert_async().await;
    }

    #[tokio::test]
    async fn test_token_renewed_inside_refresh_margin() {
        let mut server = mockito::Server::new_async().await;
        // Expires within the margin, so every call renews it
        let token = token_mock(&mut server, 30, 2).await;
        price_mock(&mut server, "71500", 2).await;

        let gw = KisGateway::new(&config(server.url())).unwrap();
        gw.get_current_price("KRW-005930").await.unwrap();
        gw.get_current_price("KRW-005930").await.unwrap();

        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejections_are_classified() {
        let mut server = mockito::Server::new_async().await;
        token_mock(&mut server, 86_400, 1).await;
        server
            .mock("POST", "/uapi/domestic-stock/v1/trading/order-cash")
            .with_status(200)
            .with_body(r#"{"rt_cd":"1","msg_cd":"APBK0952","msg1":"주문가능금액을 초과 했습니다"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/uapi/domestic-stock/v1/trading/inquire-balance")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body(r#"{"rt_cd":"1","msg_cd":"EGW00201","msg1":"초당 거래건수를 초과하였습니다."}"#)
            .create_async()
            .await;

        let gw = KisGateway::new(&config(server.url())).unwrap();
        let err = gw
            .place_market_sell("KRW-005930", 1.0, "unused")
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("APBK0952"));

        assert!(gw.get_balances().await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_market_buy_rounds_down_to_whole_shares() {
        let mut server = mockito::Server::new_async().await;
        token_mock(&mut server, 86_400, 1).await;
        price_mock(&mut server, "70000", 1).await;
        let order = server
            .mock("POST", "/uapi/domestic-stock/v1/trading/order-cash")
            .match_header("tr_id", "TTTC0802U")
            .match_body(Matcher::PartialJsonString(
                r#"{"CANO":"12345678","ACNT_PRDT_CD":"01","PDNO":"005930","ORD_DVSN":"01","ORD_QTY":"2","ORD_UNPR":"0"}"#
                    .to_string(),
            ))
            .with_status(200)
            .with_body(
                r#"{"rt_cd":"0","msg_cd":"APBK0013","msg1":"주문 전송 완료 되었습니다.","output":{"KRX_FWDG_ORD_ORGNO":"91252","ODNO":"0000117057","ORD_TMD":"121052"}}"#,
            )
            .create_async()
            .await;

        let gw = KisGateway::new(&config(server.url())).unwrap();
        let placed = gw
            .place_market_buy("KRW-005930", 150_000.0, "unused")
            .await
            .unwrap();

        order.assert_async().await;
        assert_eq!(placed.id, "0000117057");
        assert_eq!(placed.status, OrderStatus::Submitted);
        assert_eq!(placed.requested, 150_000.0);
    }

    #[tokio::test]
    async fn test_buy_below_one_share_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        token_mock(&mut server, 86_400, 1).await;
        price_mock(&mut server, "70000", 1).await;
        let order = server
            .mock("POST", "/uapi/domestic-stock/v1/trading/order-cash")
            .expect(0)
            .create_async()
            .await;

        let gw = KisGateway::new(&config(server.url())).unwrap();
        let err = gw
            .place_market_buy("KRW-005930", 50_000.0, "unused")
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
        order.assert_async().await;
    }

    #[tokio::test]
    async fn test_order_status_from_daily_fills() {
        let mut server = mockito::Server::new_async().await;
        token_mock(&mut server, 86_400, 1).await;
        server
            .mock("GET", "/uapi/domestic-stock/v1/trading/inquire-daily-ccld")
            .match_query(Matcher::UrlEncoded("CANO".into(), "12345678".into()))
            .match_header("tr_id", "TTTC8001R")
            .with_status(200)
            .with_body(
                r#"{"rt_cd":"0","msg_cd":"KIOK0000","msg1":"OK","output1":[
                    {"ord_dt":"20240301","ord_tmd":"121052","ord_gno_brno":"91252","odno":"0000117057","orgn_odno":"","sll_buy_dvsn_cd":"02","pdno":"005930","ord_qty":"2","tot_ccld_qty":"2","avg_prvs":"70100","rmn_qty":"0","cncl_yn":"N"}
                ],"output2":{}}"#,
            )
            .create_async()
            .await;

        let gw = KisGateway::new(&config(server.url())).unwrap();
        let order = gw.get_order_status("0000117057").await.unwrap();

        assert_eq!(order.market, "KRW-005930");
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.executed_quantity, 2.0);
        assert_eq!(order.avg_fill_price, Some(70_100.0));
        // 12:10:52 KST
        assert_eq!(order.created_at.to_rfc3339(), "2024-03-01T03:10:52+00:00");

        let missing = gw.get_order_status("0000000001").await.unwrap_err();
        assert!(matches!(missing, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_balances() {
        let mut server = mockito::Server::new_async().await;
        token_mock(&mut server, 86_400, 1).await;
        server
            .mock("GET", "/uapi/domestic-stock/v1/trading/inquire-balance")
            .match_query(Matcher::UrlEncoded("CANO".into(), "12345678".into()))
            .match_header("tr_id", "TTTC8434R")
            .with_status(200)
            .with_body(
                r#"{"rt_cd":"0","msg_cd":"KIOT0000","msg1":"OK",
                    "output1":[
                        {"pdno":"005930","prdt_name":"삼성전자","hldg_qty":"10","ord_psbl_qty":"8","pchs_avg_pric":"70000.0000","prpr":"71500"},
                        {"pdno":"000660","prdt_name":"SK하이닉스","hldg_qty":"0","ord_psbl_qty":"0","pchs_avg_pric":"0","prpr":"180000"}
                    ],
                    "output2":[{"dnca_tot_amt":"1000000","prvs_rcdl_excc_amt":"860000"}]}"#,
            )
            .create_async()
            .await;

        let gw = KisGateway::new(&config(server.url())).unwrap();
        let balances = gw.get_balances().await.unwrap();

        assert_eq!(balances["KRW"].balance, 860_000.0);
        assert_eq!(balances["005930"].balance, 8.0);
        assert_eq!(balances["005930"].total(), 10.0);
        assert_eq!(balances["005930"].avg_buy_price, 70_000.0);
        assert!(!balances.contains_key("000660"));
    }

    #[tokio::test]
    async fn test_daily_candles_oldest_first() {
        let mut server = mockito::Server::new_async().await;
        token_mock(&mut server, 86_400, 1).await;
        server
            .mock(
                "GET",
                "/uapi/domestic-stock/v1/quotations/inquire-daily-itemchartprice",
            )
            .match_query(Matcher::UrlEncoded("FID_INPUT_DATE_2".into(), "20240304".into()))
            .with_status(200)
            .with_body(
                r#"{"rt_cd":"0","msg_cd":"MCA00000","msg1":"OK","output1":{},"output2":[
                    {"stck_bsop_date":"20240304","stck_clpr":"73000","stck_oprc":"72000","stck_hgpr":"73500","stck_lwpr":"71800","acml_vol":"1200"},
                    {"stck_bsop_date":"20240229","stck_clpr":"72000","stck_oprc":"71000","stck_hgpr":"72500","stck_lwpr":"70800","acml_vol":"1100"},
                    {"stck_bsop_date":"20240228","stck_clpr":"71000","stck_oprc":"70000","stck_hgpr":"71500","stck_lwpr":"69800","acml_vol":"1000"}
                ]}"#,
            )
            .create_async()
            .await;

        let gw = KisGateway::new(&config(server.url())).unwrap();
        let to = "2024-03-04T06:00:00Z".parse().unwrap();
        let candles = gw
            .get_candles("KRW-005930", CandleInterval::Days, 2, Some(to))
            .await
            .unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 72_000.0);
        assert_eq!(candles[1].close, 73_000.0);
        assert!(candles[0].open_time < candles[1].open_time);

        let minutes = gw
            .get_candles("KRW-005930", CandleInterval::Minutes(60), 2, None)
            .await;
        assert!(minutes.is_err());
    }
}
