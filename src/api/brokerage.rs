//! Brokerage API client
//! Clock, latest quote, and order place/get/cancel/replace over an Alpaca-compatible REST v2 API

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::api::ApiError;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc,
}

/// Order status as reported by the brokerage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerOrderStatus {
    New,
    Accepted,
    PendingNew,
    PartiallyFilled,
    Filled,
    PendingCancel,
    Canceled,
    Expired,
    Replaced,
    Rejected,
    #[serde(other)]
    Other,
}

impl BrokerOrderStatus {
    /// The order will never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BrokerOrderStatus::Filled
                | BrokerOrderStatus::Canceled
                | BrokerOrderStatus::Expired
                | BrokerOrderStatus::Replaced
                | BrokerOrderStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerOrderStatus::New => "new",
            BrokerOrderStatus::Accepted => "accepted",
            BrokerOrderStatus::PendingNew => "pending_new",
            BrokerOrderStatus::PartiallyFilled => "partially_filled",
            BrokerOrderStatus::Filled => "filled",
            BrokerOrderStatus::PendingCancel => "pending_cancel",
            BrokerOrderStatus::Canceled => "canceled",
            BrokerOrderStatus::Expired => "expired",
            BrokerOrderStatus::Replaced => "replaced",
            BrokerOrderStatus::Rejected => "rejected",
            BrokerOrderStatus::Other => "other",
        }
    }
}

/// Market session clock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clock {
    pub timestamp: DateTime<Utc>,
    pub is_open: bool,
    pub next_open: DateTime<Utc>,
    pub next_close: DateTime<Utc>,
}

impl Clock {
    /// How long until the session opens; zero when already open
    pub fn until_open(&self) -> Duration {
        if self.is_open {
            return Duration::ZERO;
        }
        (self.next_open - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Latest quote for a symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    #[serde(rename = "ap")]
    pub ask_price: f64,
    #[serde(rename = "bp", default)]
    pub bid_price: f64,
}

#[derive(Debug, Deserialize)]
struct LatestQuoteResponse {
    quote: Quote,
}

/// Order as returned by the brokerage; the canonical state of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub id: String,
    #[serde(default)]
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type", alias = "order_type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub qty: Option<Decimal>,
    #[serde(default)]
    pub filled_qty: Decimal,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub filled_avg_price: Option<Decimal>,
    pub status: BrokerOrderStatus,
    #[serde(default)]
    pub time_in_force: Option<TimeInForce>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub filled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub canceled_at: Option<DateTime<Utc>>,
}

impl BrokerOrder {
    pub fn is_filled(&self) -> bool {
        self.status == BrokerOrderStatus::Filled
    }

    /// Whole shares filled so far
    pub fn filled_quantity(&self) -> u64 {
        self.filled_qty.trunc().to_u64().unwrap_or(0)
    }

    /// Average fill price, zero when nothing filled
    pub fn fill_price(&self) -> f64 {
        self.filled_avg_price
            .and_then(|p| p.to_f64())
            .unwrap_or(0.0)
    }
}

/// New order request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: Decimal,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    pub client_order_id: String,
}

impl OrderRequest {
    /// Market order, good for the day
    pub fn market(symbol: &str, side: OrderSide, qty: u64) -> Self {
        Self {
            symbol: symbol.to_string(),
            qty: Decimal::from(qty),
            side,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
            limit_price: None,
            stop_price: None,
            client_order_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Stop-limit order, good till cancelled
    pub fn stop_limit(symbol: &str, side: OrderSide, qty: u64, limit_price: f64, stop_price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            qty: Decimal::from(qty),
            side,
            order_type: OrderType::StopLimit,
            time_in_force: TimeInForce::Gtc,
            limit_price: Some(round_price(limit_price)),
            stop_price: Some(round_price(stop_price)),
            client_order_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn quantity(&self) -> u64 {
        self.qty.trunc().to_u64().unwrap_or(0)
    }
}

/// Replace (modify) request for an open order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaceRequest {
    pub qty: Decimal,
    pub time_in_force: TimeInForce,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
}

impl ReplaceRequest {
    pub fn stop_limit(qty: u64, limit_price: f64, stop_price: f64) -> Self {
        Self {
            qty: Decimal::from(qty),
            time_in_force: TimeInForce::Gtc,
            limit_price: Some(round_price(limit_price)),
            stop_price: Some(round_price(stop_price)),
        }
    }
}

/// Round a price to the increment the brokerage accepts:
/// cents at or above 1.00, hundredths of a cent below.
pub fn round_price(price: f64) -> Decimal {
    let value = Decimal::from_f64(price).unwrap_or(Decimal::ZERO);
    let dp = if value >= Decimal::ONE { 2 } else { 4 };
    let mut rounded = value.round_dp(dp);
    rounded.rescale(dp);
    rounded
}

/// Brokerage operations the deal worker depends on
#[async_trait]
pub trait Brokerage: Send + Sync {
    /// Market session clock
    async fn get_clock(&self) -> Result<Clock, ApiError>;

    /// Latest quote for a symbol
    async fn get_latest_quote(&self, symbol: &str) -> Result<Quote, ApiError>;

    /// Submit a new order
    async fn place_order(&self, request: &OrderRequest) -> Result<BrokerOrder, ApiError>;

    /// Get an order by brokerage id
    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder, ApiError>;

    /// Look up an order by the client order id it was submitted with
    async fn get_order_by_client_id(&self, client_order_id: &str) -> Result<Option<BrokerOrder>, ApiError>;

    /// Request cancellation of an open order
    async fn cancel_order(&self, order_id: &str) -> Result<(), ApiError>;

    /// Replace an open order; returns the new order
    async fn replace_order(&self, order_id: &str, request: &ReplaceRequest) -> Result<BrokerOrder, ApiError>;
}

/// HTTP brokerage client
pub struct HttpBrokerage {
    client: Client,
    base_url: String,
    data_url: String,
}

impl HttpBrokerage {
    /// Create a new client with request timeouts and credential headers
    pub fn new(base_url: &str, data_url: &str, api_key: &str, api_secret: &str) -> Result<Self, ApiError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            "APCA-API-KEY-ID",
            reqwest::header::HeaderValue::from_str(api_key).map_err(|_| ApiError::ApiError {
                status: 0,
                message: "API key is not a valid header value".to_string(),
            })?,
        );
        headers.insert(
            "APCA-API-SECRET-KEY",
            reqwest::header::HeaderValue::from_str(api_secret).map_err(|_| ApiError::ApiError {
                status: 0,
                message: "API secret is not a valid header value".to_string(),
            })?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            data_url: data_url.trim_end_matches('/').to_string(),
        })
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(crate::api::sanitize_api_error(status.as_u16(), error_text));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Brokerage for HttpBrokerage {
    async fn get_clock(&self) -> Result<Clock, ApiError> {
        let url = format!("{}/v2/clock", self.base_url);
        let response = self.client.get(&url).send().await?;
        Self::parse(response).await
    }

    async fn get_latest_quote(&self, symbol: &str) -> Result<Quote, ApiError> {
        let url = format!("{}/v2/stocks/{}/quotes/latest", self.data_url, symbol);
        let response = self.client.get(&url).send().await?;
        let latest: LatestQuoteResponse = Self::parse(response).await?;
        Ok(latest.quote)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<BrokerOrder, ApiError> {
        let url = format!("{}/v2/orders", self.base_url);
        debug!(client_order_id = %request.client_order_id, "POST {}", url);
        let response = self.client.post(&url).json(request).send().await?;
        Self::parse(response).await
    }

    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder, ApiError> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        let response = self.client.get(&url).send().await?;
        Self::parse(response).await
    }

    async fn get_order_by_client_id(&self, client_order_id: &str) -> Result<Option<BrokerOrder>, ApiError> {
        let url = format!("{}/v2/orders:by_client_order_id", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("client_order_id", client_order_id)])
            .send()
            .await?;
        match Self::parse(response).await {
            Ok(order) => Ok(Some(order)),
            Err(ApiError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ApiError> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        let response = self.client.delete(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(crate::api::sanitize_api_error(status.as_u16(), error_text));
        }
        Ok(())
    }

    async fn replace_order(&self, order_id: &str, request: &ReplaceRequest) -> Result<BrokerOrder, ApiError> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        let response = self.client.patch(&url).json(request).send().await?;
        Self::parse(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn order_json(id: &str, status: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "client_order_id": "c-1",
            "symbol": "ASMB",
            "side": "buy",
            "type": "market",
            "qty": "15",
            "filled_qty": "15",
            "filled_avg_price": "10.00",
            "limit_price": null,
            "stop_price": null,
            "status": status,
            "time_in_force": "day",
            "extended_hours": false
        })
    }

    async fn client(server: &MockServer) -> HttpBrokerage {
        HttpBrokerage::new(&server.uri(), &server.uri(), "key", "secret").unwrap()
    }

    #[test]
    fn test_round_price() {
        assert_eq!(round_price(10.1), dec!(10.10));
        assert_eq!(round_price(9.8980001), dec!(9.90));
        assert_eq!(round_price(0.123456), dec!(0.1235));
    }

    #[test]
    fn test_stop_limit_request_serialization() {
        let request = OrderRequest::stop_limit("ASMB", OrderSide::Sell, 15, 10.1, 9.898);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "stop_limit");
        assert_eq!(json["side"], "sell");
        assert_eq!(json["time_in_force"], "gtc");
        assert_eq!(json["limit_price"], "10.10");
        assert_eq!(json["stop_price"], "9.90");
    }

    #[test]
    fn test_market_request_omits_prices() {
        let request = OrderRequest::market("ASMB", OrderSide::Buy, 15);
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("limit_price").is_none());
        assert_eq!(json["time_in_force"], "day");
        assert_eq!(request.quantity(), 15);
    }

    #[test]
    fn test_unknown_status_parses_as_other() {
        let mut json = order_json("o-1", "held");
        json["status"] = serde_json::json!("held");
        let order: BrokerOrder = serde_json::from_value(json).unwrap();
        assert_eq!(order.status, BrokerOrderStatus::Other);
        assert!(!order.status.is_terminal());
    }

    #[test]
    fn test_clock_until_open() {
        let clock: Clock = serde_json::from_value(serde_json::json!({
            "timestamp": "2024-01-02T08:30:00Z",
            "is_open": false,
            "next_open": "2024-01-02T09:30:00Z",
            "next_close": "2024-01-02T16:00:00Z"
        }))
        .unwrap();
        assert_eq!(clock.until_open(), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_place_order_sends_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/orders"))
            .and(header("APCA-API-KEY-ID", "key"))
            .and(body_partial_json(serde_json::json!({"symbol": "ASMB", "type": "market"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_json("o-1", "accepted")))
            .mount(&server)
            .await;

        let brokerage = client(&server).await;
        let order = brokerage
            .place_order(&OrderRequest::market("ASMB", OrderSide::Buy, 15))
            .await
            .unwrap();
        assert_eq!(order.id, "o-1");
        assert_eq!(order.status, BrokerOrderStatus::Accepted);
    }

    #[tokio::test]
    async fn test_get_order_fill_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/orders/o-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_json("o-1", "filled")))
            .mount(&server)
            .await;

        let order = client(&server).await.get_order("o-1").await.unwrap();
        assert!(order.is_filled());
        assert_eq!(order.filled_quantity(), 15);
        assert_eq!(order.fill_price(), 10.0);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/orders"))
            .respond_with(ResponseTemplate::new(403).set_body_string("insufficient buying power"))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .place_order(&OrderRequest::market("ASMB", OrderSide::Buy, 15))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("insufficient buying power"));
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/clock"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = client(&server).await.get_clock().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_lookup_by_client_id_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/orders:by_client_order_id"))
            .and(query_param("client_order_id", "c-404"))
            .respond_with(ResponseTemplate::new(404).set_body_string("order not found"))
            .mount(&server)
            .await;

        let found = client(&server).await.get_order_by_client_id("c-404").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_latest_quote() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/stocks/ASMB/quotes/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "ASMB",
                "quote": {"ap": 10.02, "bp": 9.98, "as": 3, "bs": 1}
            })))
            .mount(&server)
            .await;

        let quote = client(&server).await.get_latest_quote("ASMB").await.unwrap();
        assert_eq!(quote.ask_price, 10.02);
        assert_eq!(quote.bid_price, 9.98);
    }
}
