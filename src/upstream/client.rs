//! Upstream exchange client (§4.1, §6, C1).
//!
//! Fetches the six per-trader endpoints concurrently, each under its own
//! timeout. A failing sub-call degrades its field to `None` rather than
//! aborting the record — the scraper retries nothing at the sub-request
//! level, retry is the caller's duty (§7).

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::upstream::filter::{filter_active_positions, PositionAudit};

const DEFAULT_TIME_RANGE: &str = "30D";
const ORDER_HISTORY_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderHistoryBlock {
    pub total: u64,
    pub all_orders: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamPayload {
    pub fetched_at: DateTime<Utc>,
    pub time_range: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub lead_common: Option<Value>,
    pub portfolio_detail: Option<Value>,
    pub active_positions: Option<Vec<Value>>,
    pub position_audit: Option<PositionAudit>,
    pub roi_series: Option<Value>,
    pub asset_preferences: Option<Value>,
    pub order_history: Option<OrderHistoryBlock>,
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        let http = Client::builder()
            .user_agent("copytrade-consensus/0.1")
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            http,
            base_url: base_url.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Issues one GET call and extracts `data` from `{success, data}`,
    /// returning `None` on transport error, timeout, non-2xx, or
    /// `success: false` — never propagating the error up (§4.1).
    async fn get(&self, path_and_query: &str) -> Option<Value> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let call = self.http.get(&url).send();
        let response = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                warn!(url, error = %err, "upstream GET failed");
                return None;
            }
            Err(_) => {
                warn!(url, "upstream GET timed out");
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(url, status = %response.status(), "upstream GET non-success status");
            return None;
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                warn!(url, error = %err, "upstream GET body not JSON");
                return None;
            }
        };

        extract_envelope(body, &url)
    }

    async fn post(&self, path: &str, body: &Value) -> Option<Value> {
        let url = format!("{}{}", self.base_url, path);
        let call = self.http.post(&url).json(body).send();
        let response = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                warn!(url, error = %err, "upstream POST failed");
                return None;
            }
            Err(_) => {
                warn!(url, "upstream POST timed out");
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(url, status = %response.status(), "upstream POST non-success status");
            return None;
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                warn!(url, error = %err, "upstream POST body not JSON");
                return None;
            }
        };

        extract_envelope(body, &url)
    }

    /// Fetches all six sub-payloads for one trader concurrently and
    /// assembles the record. Never returns `Err` — partial failure just
    /// leaves the corresponding field `None`.
    pub async fn fetch_trader_payload(&self, trader_id: &str) -> UpstreamPayload {
        let fetched_at = Utc::now();
        let time_range = DEFAULT_TIME_RANGE.to_string();
        let start_time = fetched_at - chrono::Duration::days(30);
        let end_time = fetched_at;

        let lead_common_path = format!(
            "/friendly/future/spot-copy-trade/common/spot-futures-last-lead?portfolioId={trader_id}"
        );
        let detail_path = format!(
            "/friendly/future/copy-trade/lead-portfolio/detail?portfolioId={trader_id}"
        );
        let positions_path = format!(
            "/friendly/future/copy-trade/lead-data/positions?portfolioId={trader_id}"
        );
        let roi_path = format!(
            "/public/future/copy-trade/lead-portfolio/chart-data?dataType=ROI&portfolioId={trader_id}&timeRange={time_range}"
        );
        let assets_path = format!(
            "/public/future/copy-trade/lead-portfolio/performance/coin?portfolioId={trader_id}&timeRange={time_range}"
        );

        let order_body = serde_json::json!({
            "portfolioId": trader_id,
            "startTime": start_time.timestamp_millis(),
            "endTime": end_time.timestamp_millis(),
            "pageSize": ORDER_HISTORY_PAGE_SIZE,
        });

        let (lead_common, portfolio_detail, active_positions_raw, roi_series, asset_preferences, order_history_raw) = tokio::join!(
            self.get(&lead_common_path),
            self.get(&detail_path),
            self.get(&positions_path),
            self.get(&roi_path),
            self.get(&assets_path),
            self.post(
                "/friendly/future/copy-trade/lead-portfolio/order-history",
                &order_body
            ),
        );

        let (active_positions, position_audit) = match active_positions_raw {
            Some(Value::Array(rows)) => {
                let (filtered, audit) = filter_active_positions(&rows);
                (Some(filtered), Some(audit))
            }
            Some(other) => {
                warn!(trader_id, shape = %other, "activePositions was not an array");
                (None, None)
            }
            None => (None, None),
        };

        let order_history = order_history_raw.map(|body| {
            let all_orders = body
                .get("allOrders")
                .or_else(|| body.get("orders"))
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let total = body
                .get("total")
                .and_then(|v| v.as_u64())
                .unwrap_or(all_orders.len() as u64);
            OrderHistoryBlock { total, all_orders }
        });

        UpstreamPayload {
            fetched_at,
            time_range,
            start_time,
            end_time,
            lead_common,
            portfolio_detail,
            active_positions,
            position_audit,
            roi_series,
            asset_preferences,
            order_history,
        }
    }
}

/// Pulls `data` out of `{success, data}`, treating `success: false` as a
/// failure that degrades to `None` (§4.1, §6).
fn extract_envelope(body: Value, url: &str) -> Option<Value> {
    let success = body.get("success").and_then(|v| v.as_bool()).unwrap_or(true);
    if !success {
        warn!(url, "upstream envelope reported success=false");
        return None;
    }
    body.get("data").cloned().or(Some(body))
}

/// Convenience free function mirroring `UpstreamClient::fetch_trader_payload`
/// for call sites that only need a one-off fetch.
pub async fn fetch_trader_payload(client: &UpstreamClient, trader_id: &str) -> UpstreamPayload {
    client.fetch_trader_payload(trader_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_data_on_success() {
        let body = json!({"success": true, "data": {"x": 1}});
        assert_eq!(extract_envelope(body, "test"), Some(json!({"x": 1})));
    }

    #[test]
    fn degrades_to_none_on_explicit_failure() {
        let body = json!({"success": false, "data": null});
        assert_eq!(extract_envelope(body, "test"), None);
    }

    #[test]
    fn treats_missing_success_as_ok() {
        let body = json!({"data": {"y": 2}});
        assert_eq!(extract_envelope(body, "test"), Some(json!({"y": 2})));
    }
}
