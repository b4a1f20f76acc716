//! Deribit v2 adapter over HTTP JSON-RPC (GET with query parameters).
//!
//! Auth uses client credentials read from `DERIBIT_CLIENT_ID` and
//! `DERIBIT_CLIENT_SECRET`. Public market data works without them.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::ExchangeGateway;
use crate::domain::{
    CancelOutcome, ExchangePosition, OrderRequest, OrderSide, OrderSnapshot, OrderState, Quote,
};
use crate::error::{CondorError, Result};

/// Refresh this long before the token actually expires
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

pub struct DeribitClient {
    http: Client,
    base_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    token: Mutex<Option<AccessToken>>,
}

impl DeribitClient {
    pub fn new(
        base_url: &str,
        client_id: Option<String>,
        client_secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent("condor/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| CondorError::Internal(format!("failed to build Deribit HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id,
            client_secret,
            token: Mutex::new(None),
        })
    }

    pub fn from_env(base_url: &str, timeout: Duration) -> Result<Self> {
        let client_id = std::env::var("DERIBIT_CLIENT_ID").ok().filter(|v| !v.is_empty());
        let client_secret = std::env::var("DERIBIT_CLIENT_SECRET")
            .ok()
            .filter(|v| !v.is_empty());
        Self::new(base_url, client_id, client_secret, timeout)
    }

    pub fn has_credentials(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }

    async fn access_token(&self) -> Result<String> {
        let mut token = self.token.lock().await;
        if let Some(current) = token.as_ref() {
            if Instant::now() + TOKEN_REFRESH_MARGIN < current.expires_at {
                return Ok(current.value.clone());
            }
        }

        let (id, secret) = match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => (id.clone(), secret.clone()),
            _ => {
                return Err(CondorError::Auth(
                    "DERIBIT_CLIENT_ID and DERIBIT_CLIENT_SECRET are required".to_string(),
                ))
            }
        };

        let result = self
            .call(
                "public/auth",
                &[
                    ("grant_type", "client_credentials".to_string()),
                    ("client_id", id),
                    ("client_secret", secret),
                ],
                None,
            )
            .await?;

        let value = result
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| CondorError::Auth("auth response without access_token".to_string()))?
            .to_string();
        let expires_in = result.get("expires_in").and_then(Value::as_u64).unwrap_or(900);

        debug!(expires_in, "deribit token refreshed");
        *token = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        Ok(value)
    }

    async fn public(&self, method: &str, params: &[(&str, String)]) -> Result<Value> {
        self.call(method, params, None).await
    }

    async fn private(&self, method: &str, params: &[(&str, String)]) -> Result<Value> {
        let token = self.access_token().await?;
        self.call(method, params, Some(&token)).await
    }

    async fn call(&self, method: &str, params: &[(&str, String)], token: Option<&str>) -> Result<Value> {
        let url = format!("{}/api/v2/{}", self.base_url, method);
        let mut req = self.http.get(&url).query(params);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CondorError::RateLimited(format!("Deribit rate limited on {}", method)));
        }

        let body: Value = serde_json::from_str(&text).map_err(|e| {
            CondorError::Exchange(format!(
                "Deribit {} returned non-JSON (status={}): {}",
                method, status, e
            ))
        })?;

        if let Some(error) = body.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(CondorError::Exchange(format!(
                "Deribit {} failed: code={} message={}",
                method, code, message
            )));
        }

        if !status.is_success() {
            return Err(CondorError::Exchange(format!(
                "Deribit {} failed: status={} body={}",
                method, status, text
            )));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| CondorError::Exchange(format!("Deribit {} response without result", method)))
    }

    fn parse_decimalish(value: &Value) -> Option<Decimal> {
        match value {
            Value::String(s) => Decimal::from_str_exact(s.trim()).ok(),
            Value::Number(n) => {
                let raw = n.to_string();
                Decimal::from_str_exact(&raw)
                    .or_else(|_| Decimal::from_scientific(&raw))
                    .ok()
            }
            _ => None,
        }
    }

    fn pick_decimal(root: &Value, key: &str) -> Option<Decimal> {
        root.get(key).and_then(Self::parse_decimalish)
    }

    fn parse_order_state(raw: &str) -> OrderState {
        match raw {
            "filled" => OrderState::Filled,
            "cancelled" => OrderState::Cancelled,
            "rejected" => OrderState::Rejected,
            // open, untriggered
            _ => OrderState::Open,
        }
    }

    fn parse_snapshot(order_id: &str, result: &Value) -> OrderSnapshot {
        let state = result
            .get("order_state")
            .and_then(Value::as_str)
            .map(Self::parse_order_state)
            .unwrap_or(OrderState::Open);
        OrderSnapshot {
            order_id: order_id.to_string(),
            state,
            filled_quantity: Self::pick_decimal(result, "filled_amount").unwrap_or(Decimal::ZERO),
            average_price: Self::pick_decimal(result, "average_price").filter(|p| !p.is_zero()),
        }
    }

    fn format_decimal(value: Decimal) -> String {
        value.normalize().to_string()
    }
}

#[async_trait]
impl ExchangeGateway for DeribitClient {
    fn name(&self) -> &'static str {
        "deribit"
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String> {
        let method = match request.side {
            OrderSide::Buy => "private/buy",
            OrderSide::Sell => "private/sell",
        };
        let mut params = vec![
            ("instrument_name", request.instrument.clone()),
            ("amount", Self::format_decimal(request.quantity)),
            ("type", "limit".to_string()),
            ("label", request.label.clone()),
        ];
        match request.price {
            Some(price) => params.push(("price", Self::format_decimal(price))),
            None => params[2].1 = "market".to_string(),
        }

        let result = self.private(method, &params).await.map_err(|e| match e {
            CondorError::Exchange(msg) => CondorError::OrderRejected(msg),
            other => other,
        })?;

        result
            .get("order")
            .and_then(|o| o.get("order_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CondorError::Exchange(format!("{} response without order_id", method)))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<CancelOutcome> {
        match self
            .private("private/cancel", &[("order_id", order_id.to_string())])
            .await
        {
            Ok(_) => Ok(CancelOutcome::Cancelled),
            Err(CondorError::Exchange(msg)) => {
                // Not cancellable: find out why.
                warn!(order_id, error = %msg, "deribit cancel refused, checking order state");
                match self.poll_order(order_id).await {
                    Ok(snapshot) => Ok(match snapshot.state {
                        OrderState::Filled => CancelOutcome::AlreadyFilled,
                        OrderState::Cancelled | OrderState::Rejected => CancelOutcome::Cancelled,
                        OrderState::Open => return Err(CondorError::Exchange(msg)),
                    }),
                    Err(CondorError::Exchange(_)) => Ok(CancelOutcome::NotFound),
                    Err(other) => Err(other),
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn poll_order(&self, order_id: &str) -> Result<OrderSnapshot> {
        let result = self
            .private("private/get_order_state", &[("order_id", order_id.to_string())])
            .await?;
        Ok(Self::parse_snapshot(order_id, &result))
    }

    async fn get_best_quote(&self, instrument: &str) -> Result<Quote> {
        let result = self
            .public("public/ticker", &[("instrument_name", instrument.to_string())])
            .await?;

        let mut quote = Quote::new(
            instrument,
            Self::pick_decimal(&result, "best_bid_price"),
            Self::pick_decimal(&result, "best_ask_price"),
        );
        if let Some(mark) = Self::pick_decimal(&result, "mark_price") {
            quote = quote.with_mark(mark);
        }
        if let Some(last) = Self::pick_decimal(&result, "last_price") {
            quote = quote.with_last(last);
        }
        if let Some(ts) = result
            .get("timestamp")
            .and_then(Value::as_i64)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        {
            quote.timestamp = ts;
        }
        Ok(quote)
    }

    async fn get_account_equity(&self, currency: &str) -> Result<Decimal> {
        let result = self
            .private("private/get_account_summary", &[("currency", currency.to_uppercase())])
            .await?;
        Self::pick_decimal(&result, "equity").ok_or_else(|| {
            CondorError::Exchange(format!("account summary for {} without equity", currency))
        })
    }

    async fn get_index_price(&self, currency: &str) -> Result<Decimal> {
        let result = self
            .public(
                "public/get_index_price",
                &[("index_name", format!("{}_usd", currency.to_lowercase()))],
            )
            .await?;
        Self::pick_decimal(&result, "index_price")
            .ok_or_else(|| CondorError::Exchange(format!("no index price for {}", currency)))
    }

    async fn get_positions(&self, currency: &str) -> Result<Vec<ExchangePosition>> {
        let result = self
            .private(
                "private/get_positions",
                &[
                    ("currency", currency.to_uppercase()),
                    ("kind", "option".to_string()),
                ],
            )
            .await?;

        let Some(entries) = result.as_array() else {
            return Ok(Vec::new());
        };

        Ok(entries
            .iter()
            .filter_map(|entry| {
                let instrument = entry.get("instrument_name")?.as_str()?.to_string();
                let mut size = Self::pick_decimal(entry, "size")?;
                if entry.get("direction").and_then(Value::as_str) == Some("sell") && size > Decimal::ZERO {
                    size = -size;
                }
                if size.is_zero() {
                    return None;
                }
                Some(ExchangePosition {
                    instrument,
                    size,
                    average_price: Self::pick_decimal(entry, "average_price"),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_snapshot() {
        let result = json!({
            "order_state": "filled",
            "filled_amount": 0.1,
            "average_price": 0.0125
        });
        let snap = DeribitClient::parse_snapshot("abc", &result);
        assert_eq!(snap.state, OrderState::Filled);
        assert_eq!(snap.filled_quantity, dec!(0.1));
        assert_eq!(snap.average_price, Some(dec!(0.0125)));
    }

    #[test]
    fn test_untriggered_counts_as_open() {
        assert_eq!(DeribitClient::parse_order_state("untriggered"), OrderState::Open);
        assert_eq!(DeribitClient::parse_order_state("rejected"), OrderState::Rejected);
    }

    #[test]
    fn test_parse_decimalish_handles_scientific_notation() {
        assert_eq!(DeribitClient::parse_decimalish(&json!(1e-5)), Some(dec!(0.00001)));
        assert_eq!(DeribitClient::parse_decimalish(&json!("0.5")), Some(dec!(0.5)));
        assert_eq!(DeribitClient::parse_decimalish(&json!(null)), None);
    }

    #[tokio::test]
    async fn test_private_call_without_credentials_is_auth_error() {
        let client =
            DeribitClient::new("http://127.0.0.1:9", None, None, Duration::from_millis(200)).unwrap();
        assert!(!client.has_credentials());
        let err = client.get_account_equity("BTC").await.unwrap_err();
        assert!(matches!(err, CondorError::Auth(_)));
    }
}
