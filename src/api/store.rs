//! Document store client
//! Deal control record, order audit records and strategy counter over a PostgREST-style REST API

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::api::{ApiError, BrokerOrder, OrderSide, OrderType};

/// Deal status as stored in the control record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DealStatus {
    Running,
    Bought,
    Completed,
    Cancelled,
}

impl DealStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DealStatus::Completed | DealStatus::Cancelled)
    }
}

/// Deal control record
///
/// The four `*_by_user` flags are the only fields an operator may mutate
/// while the worker owns the deal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRecord {
    pub id: String,
    #[serde(default)]
    pub strategy_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub stock: String,
    pub status: DealStatus,
    #[serde(default)]
    pub target_profit: Option<String>,
    #[serde(default)]
    pub stop_loss_percent: Option<String>,
    #[serde(default)]
    pub max_safety_trade_count: Option<u32>,
    #[serde(default)]
    pub max_active_safety_trade_count: Option<u32>,
    #[serde(default)]
    pub deal_cancelled_by_user: bool,
    #[serde(default)]
    pub deal_closed_at_market_price_by_user: bool,
    #[serde(default)]
    pub deal_edited_by_user: bool,
    #[serde(default)]
    pub manual_order_placed_by_user: bool,
    #[serde(default)]
    pub avg_buying_price: Option<f64>,
    #[serde(default)]
    pub total_buying_price: Option<f64>,
    #[serde(default)]
    pub total_sell_price: Option<f64>,
    #[serde(default)]
    pub total_order_quantity: Option<u64>,
    #[serde(default)]
    pub next_safety_order_limit_price: Option<f64>,
    #[serde(default)]
    pub active_safety_order_count: Option<u32>,
    #[serde(default)]
    pub profit_percentage: Option<String>,
    #[serde(default)]
    pub profit_value: Option<f64>,
    #[serde(default)]
    pub closed_at: Option<String>,
}

impl DealRecord {
    /// Blank record for a deal in `running`
    pub fn new(id: &str, strategy_id: &str, user_id: &str, stock: &str) -> Self {
        Self {
            id: id.to_string(),
            strategy_id: strategy_id.to_string(),
            user_id: user_id.to_string(),
            stock: stock.to_string(),
            status: DealStatus::Running,
            target_profit: None,
            stop_loss_percent: None,
            max_safety_trade_count: None,
            max_active_safety_trade_count: None,
            deal_cancelled_by_user: false,
            deal_closed_at_market_price_by_user: false,
            deal_edited_by_user: false,
            manual_order_placed_by_user: false,
            avg_buying_price: None,
            total_buying_price: None,
            total_sell_price: None,
            total_order_quantity: None,
            next_safety_order_limit_price: None,
            active_safety_order_count: None,
            profit_percentage: None,
            profit_value: None,
            closed_at: None,
        }
    }

    /// Target profit percent, if set and numeric
    pub fn target_profit_percent(&self) -> Option<f64> {
        self.target_profit.as_deref().and_then(|v| v.trim().parse().ok())
    }

    /// Stop loss percent, if set and numeric
    pub fn stop_loss(&self) -> Option<f64> {
        self.stop_loss_percent.as_deref().and_then(|v| v.trim().parse().ok())
    }

    /// Apply a partial update the way the store would
    pub fn apply(&mut self, update: &DealUpdate) {
        macro_rules! set {
            ($field:ident) => {
                if let Some(value) = &update.$field {
                    self.$field = value.clone();
                }
            };
            ($field:ident, some) => {
                if let Some(value) = &update.$field {
                    self.$field = Some(value.clone());
                }
            };
        }
        set!(status);
        set!(deal_cancelled_by_user);
        set!(deal_closed_at_market_price_by_user);
        set!(deal_edited_by_user);
        set!(manual_order_placed_by_user);
        set!(avg_buying_price, some);
        set!(total_buying_price, some);
        set!(total_sell_price, some);
        set!(total_order_quantity, some);
        set!(next_safety_order_limit_price, some);
        set!(active_safety_order_count, some);
        set!(profit_percentage, some);
        set!(profit_value, some);
        set!(closed_at, some);
    }
}

/// Partial update of a deal record; unset fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DealUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DealStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_cancelled_by_user: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_closed_at_market_price_by_user: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_edited_by_user: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_order_placed_by_user: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_buying_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_buying_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_sell_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_order_quantity: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_safety_order_limit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_safety_order_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit_percentage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<String>,
}

/// Denormalized deal/strategy linkage stamped on every order record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderLinkage {
    pub user_id: String,
    pub exchange_id: String,
    pub strategy_id: String,
    pub strategy_name: String,
    pub deal_id: String,
}

/// Order audit record, one per placed brokerage order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    #[serde(default)]
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    #[serde(default)]
    pub qty: Option<f64>,
    #[serde(default)]
    pub filled_qty: f64,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub filled_avg_price: Option<f64>,
    pub status: String,
    #[serde(flatten)]
    pub linkage: OrderLinkage,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl OrderRecord {
    /// Snapshot the brokerage's canonical order state with deal linkage
    pub fn from_broker(order: &BrokerOrder, linkage: &OrderLinkage) -> Self {
        Self {
            order_id: order.id.clone(),
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            qty: order.qty.and_then(|q| q.to_f64()),
            filled_qty: order.filled_qty.to_f64().unwrap_or(0.0),
            limit_price: order.limit_price.and_then(|p| p.to_f64()),
            stop_price: order.stop_price.and_then(|p| p.to_f64()),
            filled_avg_price: order.filled_avg_price.and_then(|p| p.to_f64()),
            status: order.status.as_str().to_string(),
            linkage: linkage.clone(),
            updated_at: Some(Utc::now()),
        }
    }
}

/// Parent strategy record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: String,
    #[serde(default)]
    pub active_deals: i64,
    #[serde(default)]
    pub status: String,
}

/// Partial update of a strategy record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_deals: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Store operations the deal worker depends on
#[async_trait]
pub trait DealStore: Send + Sync {
    async fn get_deal(&self, deal_id: &str) -> Result<DealRecord, ApiError>;

    async fn update_deal(&self, deal_id: &str, update: &DealUpdate) -> Result<(), ApiError>;

    async fn insert_order(&self, record: &OrderRecord) -> Result<(), ApiError>;

    /// Insert or overwrite the record keyed by `order_id`
    async fn upsert_order(&self, record: &OrderRecord) -> Result<(), ApiError>;

    /// Order records for a deal on one side
    async fn find_orders(&self, deal_id: &str, side: OrderSide) -> Result<Vec<OrderRecord>, ApiError>;

    async fn get_strategy(&self, strategy_id: &str) -> Result<StrategyRecord, ApiError>;

    async fn update_strategy(&self, strategy_id: &str, update: &StrategyUpdate) -> Result<(), ApiError>;
}

/// HTTP document store client
pub struct HttpDocumentStore {
    client: Client,
    base_url: String,
}

impl HttpDocumentStore {
    /// Create a client sending `apikey` and bearer credentials on every request
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, ApiError> {
        let invalid = |what: &str| ApiError::ApiError {
            status: 0,
            message: format!("{} is not a valid header value", what),
        };

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "apikey",
            reqwest::header::HeaderValue::from_str(api_key).map_err(|_| invalid("store api key"))?,
        );
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|_| invalid("store authorization"))?,
        );
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn table(&self, name: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, name)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(crate::api::sanitize_api_error(status.as_u16(), error_text));
        }
        Ok(response)
    }

    async fn fetch_one<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
    ) -> Result<T, ApiError> {
        let response = self
            .client
            .get(self.table(table))
            .query(&[("id", format!("eq.{}", id)), ("limit", "1".to_string())])
            .send()
            .await?;
        let rows: Vec<T> = Self::check(response).await?.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| ApiError::NotFound(format!("{} {}", table, id)))
    }

    async fn patch<B: Serialize + Sync>(&self, table: &str, filter: (&str, String), body: &B) -> Result<(), ApiError> {
        let response = self
            .client
            .patch(self.table(table))
            .query(&[filter])
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl DealStore for HttpDocumentStore {
    async fn get_deal(&self, deal_id: &str) -> Result<DealRecord, ApiError> {
        self.fetch_one("deals", deal_id).await
    }

    async fn update_deal(&self, deal_id: &str, update: &DealUpdate) -> Result<(), ApiError> {
        debug!(deal_id, "PATCH deal {:?}", update);
        self.patch("deals", ("id", format!("eq.{}", deal_id)), update).await
    }

    async fn insert_order(&self, record: &OrderRecord) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.table("orders"))
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn upsert_order(&self, record: &OrderRecord) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.table("orders"))
            .query(&[("on_conflict", "order_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(record)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn find_orders(&self, deal_id: &str, side: OrderSide) -> Result<Vec<OrderRecord>, ApiError> {
        let side = match side {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        };
        let response = self
            .client
            .get(self.table("orders"))
            .query(&[("deal_id", format!("eq.{}", deal_id)), ("side", format!("eq.{}", side))])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn get_strategy(&self, strategy_id: &str) -> Result<StrategyRecord, ApiError> {
        self.fetch_one("strategies", strategy_id).await
    }

    async fn update_strategy(&self, strategy_id: &str, update: &StrategyUpdate) -> Result<(), ApiError> {
        self.patch("strategies", ("id", format!("eq.{}", strategy_id)), update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_json, header, headers, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn deal_json() -> serde_json::Value {
        serde_json::json!({
            "id": "deal-1",
            "strategy_id": "strat-1",
            "user_id": "user-1",
            "stock": "ASMB",
            "status": "bought",
            "target_profit": "1.5",
            "stop_loss_percent": "",
            "max_safety_trade_count": 5,
            "max_active_safety_trade_count": 2,
            "deal_edited_by_user": true
        })
    }

    #[tokio::test]
    async fn test_get_deal_parses_control_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/deals"))
            .and(query_param("id", "eq.deal-1"))
            .and(header("apikey", "store-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([deal_json()])))
            .mount(&server)
            .await;

        let store = HttpDocumentStore::new(&server.uri(), "store-key").unwrap();
        let deal = store.get_deal("deal-1").await.unwrap();

        assert_eq!(deal.status, DealStatus::Bought);
        assert!(deal.deal_edited_by_user);
        assert!(!deal.deal_cancelled_by_user);
        assert_eq!(deal.target_profit_percent(), Some(1.5));
        assert_eq!(deal.stop_loss(), None);
        assert_eq!(deal.max_active_safety_trade_count, Some(2));
    }

    #[tokio::test]
    async fn test_get_deal_missing_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/deals"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let store = HttpDocumentStore::new(&server.uri(), "k").unwrap();
        let err = store.get_deal("nope").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_deal_sends_only_set_fields() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/deals"))
            .and(query_param("id", "eq.deal-1"))
            .and(body_json(serde_json::json!({
                "deal_edited_by_user": false
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpDocumentStore::new(&server.uri(), "k").unwrap();
        let update = DealUpdate {
            deal_edited_by_user: Some(false),
            ..Default::default()
        };
        store.update_deal("deal-1", &update).await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_order_merges_on_order_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/orders"))
            .and(query_param("on_conflict", "order_id"))
            .and(headers("Prefer", vec!["resolution=merge-duplicates", "return=minimal"]))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpDocumentStore::new(&server.uri(), "k").unwrap();
        let record = OrderRecord {
            order_id: "o-1".into(),
            client_order_id: "c-1".into(),
            symbol: "ASMB".into(),
            side: OrderSide::Buy,
            order_type: OrderType::StopLimit,
            qty: Some(10.0),
            filled_qty: 0.0,
            limit_price: Some(9.9),
            stop_price: Some(10.1),
            filled_avg_price: None,
            status: "canceled".into(),
            linkage: OrderLinkage::default(),
            updated_at: None,
        };
        store.upsert_order(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_surfaces_as_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/strategies"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let store = HttpDocumentStore::new(&server.uri(), "k").unwrap();
        let err = store.get_strategy("strat-1").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_order_record_flattens_linkage() {
        let linkage = OrderLinkage {
            user_id: "u".into(),
            exchange_id: "e".into(),
            strategy_id: "s".into(),
            strategy_name: "dca".into(),
            deal_id: "d".into(),
        };
        let record = OrderRecord {
            order_id: "o-1".into(),
            client_order_id: String::new(),
            symbol: "ASMB".into(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            qty: None,
            filled_qty: 0.0,
            limit_price: None,
            stop_price: None,
            filled_avg_price: None,
            status: "new".into(),
            linkage,
            updated_at: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["deal_id"], "d");
        assert_eq!(json["order_type"], "market");
    }

    #[test]
    fn test_apply_update() {
        let mut deal = DealRecord::new("d", "s", "u", "ASMB");
        deal.deal_cancelled_by_user = true;
        deal.apply(&DealUpdate {
            status: Some(DealStatus::Cancelled),
            profit_percentage: Some("-100".into()),
            ..Default::default()
        });
        assert_eq!(deal.status, DealStatus::Cancelled);
        assert_eq!(deal.profit_percentage.as_deref(), Some("-100"));
        assert!(deal.deal_cancelled_by_user);
    }
}
