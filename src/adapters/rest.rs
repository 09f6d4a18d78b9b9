//! Generic REST supplier client.
//!
//! Speaks the wire dialect shared by the hosted diamond catalogs (count +
//! paged search + bearer auth). The supplier filters prices inclusively on
//! integer cents, so the half-open upper bound is converted at this
//! boundary; the rest of the pipeline never sees inclusive intervals.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    AdapterError, FeedMetadata, MappedStone, SearchPage, SupplierAdapter, SupplierItem,
    SupplierQuery,
};
use crate::models::{HeatmapTuning, Shape, StoneStatus};
use crate::store::allowlist;

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    items: Vec<serde_json::Value>,
    total_count: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Supplier item payload as this dialect ships it. Prices come as decimal
/// dollars and weights as decimal carats; conversion to cents/points happens
/// here and nowhere else.
#[derive(Debug, Deserialize)]
struct RestStonePayload {
    stone_id: String,
    offer_id: String,
    price: f64,
    shape: String,
    carats: f64,
    color: String,
    clarity: String,
    #[serde(default)]
    cut: Option<String>,
    #[serde(default)]
    lab: Option<String>,
    #[serde(default)]
    certificate: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    updated_at: String,
}

pub struct RestSupplierAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    session_token: Mutex<Option<String>>,
    count_cache: Mutex<HashMap<String, u64>>,
    metadata: FeedMetadata,
}

impl RestSupplierAdapter {
    pub fn new(
        feed_id: &str,
        base_url: &str,
        api_key: String,
        heatmap: HeatmapTuning,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build supplier HTTP client: {e}"))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            session_token: Mutex::new(None),
            count_cache: Mutex::new(HashMap::new()),
            metadata: FeedMetadata {
                feed_id: feed_id.to_string(),
                raw_table: allowlist::raw_table_for(feed_id)?,
                watermark_name: feed_id.to_string(),
                max_page_size: 200,
                heatmap,
            },
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer(&self) -> String {
        self.session_token
            .lock()
            .clone()
            .unwrap_or_else(|| self.api_key.clone())
    }

    async fn reauthenticate(&self) -> Result<(), AdapterError> {
        let resp = self
            .client
            .post(self.url("/v1/auth/token"))
            .json(&serde_json::json!({ "api_key": self.api_key }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Auth(format!(
                "token refresh failed: {status}: {text}"
            )));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("bad token response: {e}")))?;
        *self.session_token.lock() = Some(token.token);
        debug!(feed = %self.metadata.feed_id, "supplier session refreshed");
        Ok(())
    }

    /// GET with one re-authentication on 401 before the error surfaces.
    async fn authed_get(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<reqwest::Response, AdapterError> {
        for attempt in 0..2 {
            let resp = self
                .client
                .get(self.url(path))
                .bearer_auth(self.bearer())
                .query(params)
                .send()
                .await?;

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                warn!(feed = %self.metadata.feed_id, "supplier session expired; re-authenticating");
                self.reauthenticate().await?;
                continue;
            }
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, format!("GET {path} {status}: {text}")));
        }
        Err(AdapterError::Auth(format!(
            "GET {path}: still unauthorized after re-authentication"
        )))
    }

    fn query_params(&self, query: &SupplierQuery) -> Vec<(String, String)> {
        let mut qp: Vec<(String, String)> = Vec::with_capacity(8);
        if let Some(min) = query.price_min {
            qp.push(("price_min".to_string(), min.to_string()));
        }
        if let Some(max) = query.price_max {
            // Supplier bounds are inclusive; ours are half-open.
            qp.push(("price_max".to_string(), (max - 1).to_string()));
        }
        if let Some(from) = query.updated_from {
            qp.push(("updated_from".to_string(), from.to_rfc3339()));
        }
        if let Some(to) = query.updated_to {
            qp.push(("updated_to".to_string(), to.to_rfc3339()));
        }
        if !query.shapes.is_empty() {
            qp.push(("shapes".to_string(), query.shapes.join(",")));
        }
        if let Some(min) = query.size_min_points {
            qp.push(("size_min".to_string(), min.to_string()));
        }
        if let Some(max) = query.size_max_points {
            qp.push(("size_max".to_string(), max.to_string()));
        }
        qp
    }
}

fn classify_status(status: StatusCode, detail: String) -> AdapterError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AdapterError::Auth(detail),
        StatusCode::NOT_FOUND => AdapterError::NotFound(detail),
        StatusCode::TOO_MANY_REQUESTS => AdapterError::RateLimited(detail),
        s if s.is_server_error() => AdapterError::Network(detail),
        _ => AdapterError::Protocol(detail),
    }
}

fn item_field<'a>(item: &'a serde_json::Value, key: &str) -> Result<&'a str, AdapterError> {
    item.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| AdapterError::Protocol(format!("item missing '{key}'")))
}

fn parse_time(raw: &str, key: &str) -> Result<DateTime<Utc>, AdapterError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| AdapterError::Protocol(format!("bad '{key}' timestamp: {e}")))
}

#[async_trait]
impl SupplierAdapter for RestSupplierAdapter {
    fn metadata(&self) -> &FeedMetadata {
        &self.metadata
    }

    async fn get_count(&self, query: &SupplierQuery) -> Result<u64, AdapterError> {
        let fingerprint = query.fingerprint();
        if let Some(cached) = self.count_cache.lock().get(&fingerprint) {
            return Ok(*cached);
        }

        let qp = self.query_params(query);
        let resp = self.authed_get("/v1/stones/count", &qp).await?;
        let body: CountResponse = resp
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("bad count response: {e}")))?;

        self.count_cache.lock().insert(fingerprint, body.count);
        Ok(body.count)
    }

    async fn search(
        &self,
        query: &SupplierQuery,
        offset: u64,
        limit: u32,
    ) -> Result<SearchPage, AdapterError> {
        let limit = limit.min(self.metadata.max_page_size);
        let mut qp = self.query_params(query);
        qp.push(("offset".to_string(), offset.to_string()));
        qp.push(("limit".to_string(), limit.to_string()));
        // Fixed ordering keeps items from shifting between pages mid-run.
        qp.push(("order".to_string(), "created_at_asc".to_string()));

        let resp = self.authed_get("/v1/stones", &qp).await?;
        let body: SearchResponse = resp
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("bad search response: {e}")))?;

        let mut items = Vec::with_capacity(body.items.len());
        for item in &body.items {
            let supplier_stone_id = item_field(item, "stone_id")?.to_string();
            let offer_id = item_field(item, "offer_id")?.to_string();
            let source_updated_at = parse_time(item_field(item, "updated_at")?, "updated_at")?;
            let created_at = parse_time(item_field(item, "created_at")?, "created_at")?;
            items.push(SupplierItem {
                supplier_stone_id,
                offer_id,
                payload: item.to_string(),
                source_updated_at,
                created_at,
            });
        }

        Ok(SearchPage {
            items,
            total_count: body.total_count,
        })
    }

    fn map_raw(&self, payload: &str) -> Result<MappedStone, AdapterError> {
        let raw: RestStonePayload = serde_json::from_str(payload)
            .map_err(|e| AdapterError::Protocol(format!("unparsable payload: {e}")))?;

        let shape = Shape::parse(&raw.shape)
            .ok_or_else(|| AdapterError::Protocol(format!("unknown shape '{}'", raw.shape)))?;
        let status = match raw.status.as_deref() {
            None => StoneStatus::Available,
            Some(s) => match s.to_ascii_lowercase().as_str() {
                "available" | "a" => StoneStatus::Available,
                "hold" | "on_hold" | "h" => StoneStatus::OnHold,
                "sold" | "s" => StoneStatus::Sold,
                other => {
                    return Err(AdapterError::Protocol(format!("unknown status '{other}'")))
                }
            },
        };
        if !raw.price.is_finite() || raw.price < 0.0 {
            return Err(AdapterError::Protocol(format!("bad price {}", raw.price)));
        }
        if !raw.carats.is_finite() || raw.carats <= 0.0 {
            return Err(AdapterError::Protocol(format!("bad carats {}", raw.carats)));
        }

        Ok(MappedStone {
            supplier_stone_id: raw.stone_id,
            offer_id: raw.offer_id,
            shape,
            weight_points: (raw.carats * 100.0).round() as u32,
            color: raw.color,
            clarity: raw.clarity,
            cut: raw.cut,
            lab: raw.lab,
            certificate: raw.certificate,
            supplier_price_cents: (raw.price * 100.0).round() as i64,
            status,
            media_url: raw.image_url,
            source_updated_at: parse_time(&raw.updated_at, "updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> RestSupplierAdapter {
        RestSupplierAdapter::new(
            "lumera",
            "https://api.lumera.example/",
            "test-key".into(),
            HeatmapTuning::default(),
        )
        .unwrap()
    }

    #[test]
    fn half_open_upper_bound_becomes_inclusive() {
        let a = adapter();
        let qp = a.query_params(&SupplierQuery {
            price_min: Some(1_000),
            price_max: Some(2_000),
            ..Default::default()
        });
        assert!(qp.contains(&("price_min".to_string(), "1000".to_string())));
        assert!(qp.contains(&("price_max".to_string(), "1999".to_string())));
    }

    #[test]
    fn status_classification_matches_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            AdapterError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, String::new()),
            AdapterError::Network(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, String::new()),
            AdapterError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, String::new()),
            AdapterError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, String::new()),
            AdapterError::Protocol(_)
        ));
    }

    #[test]
    fn map_raw_converts_dollars_and_carats() {
        let a = adapter();
        let payload = serde_json::json!({
            "stone_id": "LUM-1",
            "offer_id": "OFF-1",
            "price": 1234.56,
            "shape": "Oval",
            "carats": 1.52,
            "color": "F",
            "clarity": "VS1",
            "cut": "excellent",
            "lab": "GIA",
            "certificate": "GIA-123",
            "status": "A",
            "image_url": "https://cdn.lumera.example/lum-1.jpg",
            "updated_at": "2024-06-01T10:00:00Z"
        })
        .to_string();

        let stone = a.map_raw(&payload).unwrap();
        assert_eq!(stone.supplier_price_cents, 123_456);
        assert_eq!(stone.weight_points, 152);
        assert_eq!(stone.shape, Shape::Oval);
        assert_eq!(stone.status, StoneStatus::Available);
        assert_eq!(stone.media_url.as_deref(), Some("https://cdn.lumera.example/lum-1.jpg"));
    }

    #[test]
    fn map_raw_defaults_missing_status_to_available() {
        let a = adapter();
        let payload = serde_json::json!({
            "stone_id": "LUM-2",
            "offer_id": "OFF-2",
            "price": 10.0,
            "shape": "round",
            "carats": 0.3,
            "color": "G",
            "clarity": "SI1",
            "updated_at": "2024-06-01T10:00:00Z"
        })
        .to_string();
        let stone = a.map_raw(&payload).unwrap();
        assert_eq!(stone.status, StoneStatus::Available);
    }

    #[test]
    fn map_raw_rejects_bad_values() {
        let a = adapter();
        let base = serde_json::json!({
            "stone_id": "LUM-3",
            "offer_id": "OFF-3",
            "price": -5.0,
            "shape": "round",
            "carats": 1.0,
            "color": "G",
            "clarity": "SI1",
            "updated_at": "2024-06-01T10:00:00Z"
        });
        assert!(a.map_raw(&base.to_string()).is_err());

        let mut bad_shape = base.clone();
        bad_shape["price"] = serde_json::json!(5.0);
        bad_shape["shape"] = serde_json::json!("trapezoid");
        assert!(a.map_raw(&bad_shape.to_string()).is_err());

        assert!(a.map_raw("{}").is_err());
    }
}
