//! Delivery of position samples to the remote ingestion endpoint.
//!
//! One outbound POST per call, no retries and no state kept between calls.
//! The next change notification or poll tick is the retry opportunity.

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use log::{debug, error, warn};
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;

/// Fixed ingestion path appended to the configured server URL.
pub const INGEST_PATH: &str = "/api/ingest.php";

/// Request timeout for a single delivery.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON body sent to the ingestion endpoint.
///
/// Field names are part of the wire contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionReport {
    pub key: String,
    pub lat: f64,
    pub lon: f64,
    /// Seconds since the Unix epoch
    pub ts: i64,
    pub name: String,
    pub entity_id: String,
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Remote answered 200.
    Delivered,
    /// Remote reachable but answered with another status.
    RemoteRejected { status: u16, body: String },
    /// The request exceeded [`DELIVERY_TIMEOUT`].
    TimedOut,
    /// Any other network or protocol failure.
    TransportError(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryOutcome::Delivered => write!(f, "delivered"),
            DeliveryOutcome::RemoteRejected { status, body } => {
                write!(f, "rejected with status {}: {}", status, body)
            }
            DeliveryOutcome::TimedOut => write!(f, "timed out"),
            DeliveryOutcome::TransportError(detail) => write!(f, "transport error: {}", detail),
        }
    }
}

/// Sends position reports somewhere.
///
/// Implementations must be safe for concurrent use: every watcher in the
/// process shares one instance.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn post(
        &self,
        server_url: &str,
        report: &PositionReport,
        verify_ssl: bool,
    ) -> DeliveryOutcome;
}

/// Build the ingestion URL from a configured server URL.
pub fn ingest_url(server_url: &str) -> String {
    format!("{}{}", server_url.trim_end_matches('/'), INGEST_PATH)
}

/// HTTP delivery over a shared `reqwest` transport.
///
/// `reqwest` fixes certificate verification per client, so two pooled
/// clients are kept and `verify_ssl` selects between them per request.
pub struct HttpDelivery {
    verified: reqwest::Client,
    insecure: reqwest::Client,
}

impl HttpDelivery {
    /// Create the shared transport with the standard 10 second timeout.
    pub fn new() -> Result<Self> {
        Self::with_timeout(DELIVERY_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let user_agent = concat!("geomap-bridge/", env!("CARGO_PKG_VERSION"));

        let verified = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| BridgeError::HttpClientBuild(e.to_string()))?;

        let insecure = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| BridgeError::HttpClientBuild(e.to_string()))?;

        Ok(Self { verified, insecure })
    }
}

#[async_trait]
impl Delivery for HttpDelivery {
    async fn post(
        &self,
        server_url: &str,
        report: &PositionReport,
        verify_ssl: bool,
    ) -> DeliveryOutcome {
        let url = ingest_url(server_url);
        let client = if verify_ssl {
            &self.verified
        } else {
            &self.insecure
        };

        match client.post(&url).json(report).send().await {
            Ok(response) => {
                let status = response.status();
                if status == StatusCode::OK {
                    debug!(
                        "[Delivery] POST {} ok ({}: {}, {})",
                        url, report.entity_id, report.lat, report.lon
                    );
                    return DeliveryOutcome::Delivered;
                }

                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|e| format!("<unreadable body: {}>", e));
                warn!("[Delivery] POST {} failed ({}): {}", url, status.as_u16(), body);
                DeliveryOutcome::RemoteRejected {
                    status: status.as_u16(),
                    body,
                }
            }
            Err(e) if e.is_timeout() => {
                warn!("[Delivery] Timeout posting to {}", url);
                DeliveryOutcome::TimedOut
            }
            Err(e) => {
                let detail = error_chain(&e);
                error!("[Delivery] Error posting to {}: {}", url, detail);
                DeliveryOutcome::TransportError(detail)
            }
        }
    }
}

/// Render an error with all of its sources.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_url_strips_trailing_slashes() {
        assert_eq!(
            ingest_url("https://example.org/geomap"),
            "https://example.org/geomap/api/ingest.php"
        );
        assert_eq!(
            ingest_url("https://example.org/geomap/"),
            "https://example.org/geomap/api/ingest.php"
        );
        assert_eq!(
            ingest_url("http://10.0.0.5//"),
            "http://10.0.0.5/api/ingest.php"
        );
    }

    #[test]
    fn test_report_wire_format() {
        let report = PositionReport {
            key: "BANANA-1234".to_string(),
            lat: 48.137154,
            lon: 11.576124,
            ts: 1_700_000_000,
            name: "Phone".to_string(),
            entity_id: "device_tracker.phone".to_string(),
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "key": "BANANA-1234",
                "lat": 48.137154,
                "lon": 11.576124,
                "ts": 1_700_000_000,
                "name": "Phone",
                "entity_id": "device_tracker.phone",
            })
        );
        assert!(json["ts"].is_i64());
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(DeliveryOutcome::Delivered.to_string(), "delivered");
        assert_eq!(
            DeliveryOutcome::RemoteRejected {
                status: 403,
                body: "bad key".to_string()
            }
            .to_string(),
            "rejected with status 403: bad key"
        );
        assert!(!DeliveryOutcome::TimedOut.is_delivered());
    }

    #[test]
    fn test_http_delivery_builds() {
        assert!(HttpDelivery::new().is_ok());
    }
}
