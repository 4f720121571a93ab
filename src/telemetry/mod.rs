//! Telemetry - time-series queries that drive proposals and votes
//!
//! A rule's event expression is compiled into a query string
//! ([`query::QueryCompiler`]) and evaluated against a Prometheus-compatible
//! query API. The first series of the result is the signal:
//!
//! - trigger queries fire when the value is non-zero
//! - vote queries yield a boolean-like token mapped to a [`Stance`]

pub mod query;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::trace;

use crate::ledger::Stance;

/// Errors from the telemetry service
#[derive(Debug, Clone, thiserror::Error)]
pub enum TelemetryError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Query timed out after {0}s")]
    Timeout(u64),

    #[error("Query returned HTTP {0}")]
    Status(u16),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// One series of an instant-vector result
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Sample {
    #[serde(default)]
    pub metric: serde_json::Map<String, serde_json::Value>,
    /// `[timestamp, "value"]`
    pub value: (serde_json::Value, String),
}

/// Result of an instant query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub series: Vec<Sample>,
}

impl QueryResult {
    /// Raw value of the first series, if any
    pub fn first_value(&self) -> Option<&str> {
        self.series.first().map(|s| s.value.1.as_str())
    }

    /// Whether a trigger query fired. An empty result never fires.
    pub fn fired(&self) -> Result<bool, TelemetryError> {
        match self.first_value() {
            Some(raw) => signal_fired(raw),
            None => Ok(false),
        }
    }
}

/// Interpret a trigger value: any non-zero number fires
pub fn signal_fired(raw: &str) -> Result<bool, TelemetryError> {
    raw.trim()
        .parse::<f64>()
        .map(|v| v != 0.0 && !v.is_nan())
        .map_err(|_| TelemetryError::InvalidResponse(format!("non-numeric signal '{}'", raw)))
}

/// Interpret a vote-condition token. `None` means the token is malformed.
pub fn parse_vote_token(raw: &str) -> Option<Stance> {
    let token = raw.trim();
    match token {
        "true" | "True" => return Some(Stance::For),
        "false" | "False" => return Some(Stance::Against),
        _ => {}
    }

    match token.parse::<f64>() {
        Ok(v) if v.is_nan() => None,
        Ok(v) if v != 0.0 => Some(Stance::For),
        Ok(_) => Some(Stance::Against),
        Err(_) => None,
    }
}

/// Telemetry query service
#[async_trait]
pub trait TelemetryClient: Send + Sync {
    async fn query(&self, query: &str) -> Result<QueryResult, TelemetryError>;
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    data: Option<ApiData>,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    #[serde(default)]
    result: Vec<Sample>,
}

/// Prometheus HTTP API client (`GET /api/v1/query`)
pub struct PrometheusClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl PrometheusClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl TelemetryClient for PrometheusClient {
    async fn query(&self, query: &str) -> Result<QueryResult, TelemetryError> {
        trace!(query, "Querying telemetry");

        let response = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", query)])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TelemetryError::Timeout(self.timeout.as_secs())
                } else {
                    TelemetryError::Network(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(TelemetryError::Status(response.status().as_u16()));
        }

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| TelemetryError::InvalidResponse(e.to_string()))?;

        Ok(QueryResult {
            series: body.data.map(|d| d.result).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_signal_fired() {
        assert!(signal_fired("1").unwrap());
        assert!(signal_fired("0.5").unwrap());
        assert!(!signal_fired("0").unwrap());
        assert!(signal_fired("high").is_err());
    }

    #[test]
    fn test_parse_vote_token() {
        assert_eq!(parse_vote_token("1"), Some(Stance::For));
        assert_eq!(parse_vote_token("True"), Some(Stance::For));
        assert_eq!(parse_vote_token("0"), Some(Stance::Against));
        assert_eq!(parse_vote_token("0.0"), Some(Stance::Against));
        assert_eq!(parse_vote_token("False"), Some(Stance::Against));
        assert_eq!(parse_vote_token("maybe"), None);
        assert_eq!(parse_vote_token("NaN"), None);
    }

    #[test]
    fn test_empty_result_does_not_fire() {
        assert!(!QueryResult::default().fired().unwrap());
    }

    #[tokio::test]
    async fn test_prometheus_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param("query", "up"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {
                    "resultType": "vector",
                    "result": [
                        {"metric": {"node": "edge-1"}, "value": [1700000000.5, "1"]},
                        {"metric": {"node": "edge-2"}, "value": [1700000000.5, "0"]}
                    ]
                }
            })))
            .mount(&server)
            .await;

        let client = PrometheusClient::new(server.uri(), Duration::from_secs(2));
        let result = client.query("up").await.unwrap();

        assert_eq!(result.series.len(), 2);
        assert_eq!(result.first_value(), Some("1"));
        assert!(result.fired().unwrap());
    }

    #[tokio::test]
    async fn test_prometheus_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = PrometheusClient::new(server.uri(), Duration::from_secs(2));
        assert!(matches!(
            client.query("up").await,
            Err(TelemetryError::Status(503))
        ));
    }

    #[tokio::test]
    async fn test_prometheus_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = PrometheusClient::new(server.uri(), Duration::from_secs(2));
        assert!(matches!(
            client.query("up").await,
            Err(TelemetryError::InvalidResponse(_))
        ));
    }
}
