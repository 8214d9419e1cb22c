use crate::{
    config::MerchantConfig,
    error::{GatewayError, PaymentError, Result},
    model::Amount,
    trust::TrustProfile,
};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const TRUST_TIER_HEADER: &str = "x-agent-trust-tier";
pub const TRUST_SIGNALS_HEADER: &str = "x-agent-trust-signals";
pub const AGENT_KEY_ID_HEADER: &str = "x-agent-keyid";

/// Request headers that must not cross the gateway unchanged.
const HOP_BY_HOP: [HeaderName; 6] = [
    header::HOST,
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
];

#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct ForwardResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The merchant resource handler behind the gateway.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Merchant: Send + Sync {
    /// Authoritative amount due for a cart; agents never state it themselves.
    async fn cart_total(&self, session_id: &str) -> Result<Amount>;

    async fn forward(&self, request: ForwardRequest) -> Result<ForwardResponse>;
}

/// Replaces any client-supplied trust headers with the gateway's own.
pub fn apply_trust_headers(headers: &mut HeaderMap, key_id: &str, profile: &TrustProfile) -> Result<()> {
    let invalid = |e: axum::http::header::InvalidHeaderValue| GatewayError::InvalidInput(e.to_string());

    let spoofed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("x-agent-"))
        .cloned()
        .collect();
    for name in spoofed {
        headers.remove(name);
    }

    headers.insert(TRUST_TIER_HEADER, HeaderValue::from_str(&profile.tier.to_string()).map_err(invalid)?);
    headers.insert(TRUST_SIGNALS_HEADER, HeaderValue::from_str(&profile.summary()).map_err(invalid)?);
    headers.insert(AGENT_KEY_ID_HEADER, HeaderValue::from_str(key_id).map_err(invalid)?);
    Ok(())
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}

#[derive(Debug, Deserialize)]
struct CartTotalResponse {
    total: String,
}

/// Merchant reached over HTTP.
///
/// Cart totals come from `GET {url}/api/cart/{session_id}/total` as
/// `{"total": "$12.34"}`.
pub struct HttpMerchant {
    endpoint: String,
    client: Client,
}

impl HttpMerchant {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: Client::builder().timeout(timeout).build()?,
        })
    }

    pub fn from_config(config: &MerchantConfig) -> Result<Self> {
        Self::new(&config.upstream_url, Duration::from_millis(config.request_timeout_ms))
    }
}

#[async_trait]
impl Merchant for HttpMerchant {
    async fn cart_total(&self, session_id: &str) -> Result<Amount> {
        let response = self
            .client
            .get(format!("{}/api/cart/{}/total", self.endpoint, session_id))
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(PaymentError::SessionNotFound(session_id.to_string()).into()),
            status if status.is_client_error() => {
                let detail = response.text().await.unwrap_or_default();
                Err(GatewayError::InvalidInput(format!("merchant refused cart {}: {}", session_id, detail)))
            }
            status if !status.is_success() => {
                Err(GatewayError::Upstream(format!("cart total returned {}", status)))
            }
            _ => {
                let body: CartTotalResponse = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::Upstream(e.to_string()))?;
                let total = body.total.parse()?;
                debug!(session_id, total = %total, "Cart total fetched");
                Ok(total)
            }
        }
    }

    async fn forward(&self, mut request: ForwardRequest) -> Result<ForwardResponse> {
        strip_hop_by_hop(&mut request.headers);
        let response = self
            .client
            .request(request.method, format!("{}{}", self.endpoint, request.path_and_query))
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        Ok(ForwardResponse { status, headers, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TrustTier;
    use chrono::Utc;

    #[test]
    fn test_trust_headers_replace_client_values() {
        let profile = TrustProfile {
            agent_id: "agent-1".to_string(),
            tier: TrustTier::REPUTABLE,
            contributing_signals: Vec::new(),
            computed_at: Utc::now(),
        };

        let mut headers = HeaderMap::new();
        headers.insert("x-agent-trust-tier", HeaderValue::from_static("4"));
        headers.insert("x-agent-clawkey-verified", HeaderValue::from_static("true"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        apply_trust_headers(&mut headers, "agent-1", &profile).unwrap();

        assert_eq!(headers.get(TRUST_TIER_HEADER).unwrap(), "2");
        assert_eq!(headers.get(AGENT_KEY_ID_HEADER).unwrap(), "agent-1");
        assert_eq!(
            headers.get(TRUST_SIGNALS_HEADER).unwrap(),
            "registry=absent;reputation=absent;biometric=absent"
        );
        assert!(headers.get("x-agent-clawkey-verified").is_none());
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "application/json");
    }

    #[test]
    fn test_hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert!(headers.get(header::CONTENT_TYPE).is_some());
    }
}
