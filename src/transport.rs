//! HTTP forwarder sending buffered batches to the telemetry gateway

use crate::codec::Forwarder;
use crate::errors::{BufferError, Result};
use crate::telemetry::SignalType;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Body posted to `{gateway}/v1/{signal}`
#[derive(Debug, Serialize)]
struct ForwardPayload<'a, T: Serialize> {
    batch_id: String,
    signal: SignalType,
    sent_at: DateTime<Utc>,
    items: &'a [T],
}

/// Forwards batches of any serializable item to the gateway over HTTP.
///
/// Each forward is retried with exponential backoff and jitter before it is
/// reported as failed.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: Client,
    gateway_url: String,
    signal: SignalType,
    timeout: Duration,
    max_retries: u32,
    retry_backoff_ms: u64,
    metrics: Arc<TransportMetrics>,
}

impl HttpForwarder {
    pub fn new(
        gateway_url: &str,
        signal: SignalType,
        http_timeout: Duration,
        max_retries: u32,
        retry_backoff_ms: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("otel-disk-buffer/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(BufferError::Http)?;

        Ok(Self {
            client,
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            signal,
            timeout: http_timeout,
            max_retries,
            retry_backoff_ms,
            metrics: Arc::new(TransportMetrics::default()),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/{}", self.gateway_url, self.signal)
    }

    /// Send one batch, retrying up to `max_retries` times
    pub async fn send<T: Serialize + Sync>(&self, items: &[T]) -> Result<()> {
        let url = self.endpoint();
        let payload = ForwardPayload {
            batch_id: uuid::Uuid::new_v4().to_string(),
            signal: self.signal,
            sent_at: Utc::now(),
            items,
        };

        debug!(
            "Sending batch {} with {} {} to {}",
            payload.batch_id,
            items.len(),
            self.signal,
            url
        );

        let started = Instant::now();
        let mut attempt = 0;

        let result = loop {
            match self.send_attempt(&url, &payload).await {
                Ok(()) => {
                    info!(
                        "Successfully sent batch {} (attempt {})",
                        payload.batch_id,
                        attempt + 1
                    );
                    break Ok(());
                }
                Err(err) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        error!(
                            "Failed to send batch {} after {} attempts: {}",
                            payload.batch_id, attempt, err
                        );
                        break Err(err);
                    }

                    let backoff = self.backoff(attempt);
                    warn!(
                        "Failed to send batch {} (attempt {}), retrying in {}ms: {}",
                        payload.batch_id,
                        attempt,
                        backoff.as_millis(),
                        err
                    );
                    sleep(backoff).await;
                }
            }
        };

        self.metrics
            .record(result.is_ok(), attempt, started.elapsed())
            .await;
        result
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .retry_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt - 1));
        let jitter = if base > 0 {
            rand::random_range(0..=base / 4)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    async fn send_attempt<T: Serialize>(
        &self,
        url: &str,
        payload: &ForwardPayload<'_, T>,
    ) -> Result<()> {
        let response = timeout(self.timeout, self.client.post(url).json(payload).send())
            .await
            .map_err(|_| BufferError::Transport("Request timeout".to_string()))?
            .map_err(BufferError::Http)?;

        self.handle_response(response, &payload.batch_id).await
    }

    async fn handle_response(&self, response: Response, batch_id: &str) -> Result<()> {
        let status = response.status();

        if status.is_success() {
            debug!("Batch {} accepted by gateway", batch_id);
            return Ok(());
        }

        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        let error_message = match status.as_u16() {
            400 => format!("Bad request for batch {}: {}", batch_id, error_body),
            401 => format!("Unauthorized for batch {}: {}", batch_id, error_body),
            403 => format!("Forbidden for batch {}: {}", batch_id, error_body),
            404 => format!("Gateway endpoint not found for batch {}: {}", batch_id, error_body),
            413 => format!("Batch {} too large: {}", batch_id, error_body),
            429 => format!("Rate limited for batch {}: {}", batch_id, error_body),
            500..=599 => format!("Gateway server error for batch {}: {}", batch_id, error_body),
            _ => format!("Unexpected response {} for batch {}: {}", status, batch_id, error_body),
        };

        Err(BufferError::Transport(error_message))
    }

    /// Health check the gateway endpoint
    pub async fn health_check(&self) -> Result<GatewayHealth> {
        let url = format!("{}/health", self.gateway_url);

        debug!("Performing health check against {}", url);

        let response = timeout(self.timeout, self.client.get(&url).send())
            .await
            .map_err(|_| BufferError::Transport("Health check timeout".to_string()))?
            .map_err(BufferError::Http)?;

        if !response.status().is_success() {
            return Err(BufferError::Transport(format!(
                "Health check failed with status: {}",
                response.status()
            )));
        }

        let health_data: Value = response.json().await.map_err(BufferError::Http)?;
        let field = |name: &str| {
            health_data[name]
                .as_str()
                .unwrap_or("unknown")
                .to_string()
        };

        Ok(GatewayHealth {
            status: field("status"),
            service: field("service"),
            version: field("version"),
        })
    }

    /// Whether the gateway answers its health check
    pub async fn test_connectivity(&self) -> bool {
        match self.health_check().await {
            Ok(health) => {
                info!(
                    "Gateway connectivity test successful: {} v{} - {}",
                    health.service, health.version, health.status
                );
                true
            }
            Err(e) => {
                warn!("Gateway connectivity test failed: {}", e);
                false
            }
        }
    }

    pub async fn metrics(&self) -> TransportMetricsSnapshot {
        self.metrics.snapshot().await
    }
}

#[async_trait]
impl<T: Serialize + Send + Sync> Forwarder<T> for HttpForwarder {
    async fn forward(&self, items: &[T]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.send(items).await
    }
}

/// Gateway health information
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayHealth {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Default)]
struct MetricsState {
    batches_sent: u64,
    batches_failed: u64,
    retries: u64,
    total_duration: Duration,
    max_duration: Option<Duration>,
}

/// Forwarding counters shared by clones of one forwarder
#[derive(Debug, Default)]
struct TransportMetrics {
    state: RwLock<MetricsState>,
}

impl TransportMetrics {
    async fn record(&self, succeeded: bool, failed_attempts: u32, duration: Duration) {
        let mut state = self.state.write().await;
        if succeeded {
            state.batches_sent += 1;
            state.retries += u64::from(failed_attempts);
        } else {
            state.batches_failed += 1;
            state.retries += u64::from(failed_attempts.saturating_sub(1));
        }
        state.total_duration += duration;
        state.max_duration = Some(state.max_duration.map_or(duration, |m| m.max(duration)));
    }

    async fn snapshot(&self) -> TransportMetricsSnapshot {
        let state = self.state.read().await;
        let batches = state.batches_sent + state.batches_failed;

        let success_rate = if batches > 0 {
            (state.batches_sent as f64 / batches as f64) * 100.0
        } else {
            0.0
        };

        let avg_duration_ms = if batches > 0 {
            state.total_duration.as_millis() as u64 / batches
        } else {
            0
        };

        TransportMetricsSnapshot {
            batches_sent: state.batches_sent,
            batches_failed: state.batches_failed,
            retries: state.retries,
            success_rate,
            avg_duration_ms,
            max_duration_ms: state.max_duration.map(|d| d.as_millis() as u64),
        }
    }
}

/// Snapshot of transport metrics
#[derive(Debug, Clone, Serialize)]
pub struct TransportMetricsSnapshot {
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub retries: u64,
    pub success_rate: f64,
    pub avg_duration_ms: u64,
    pub max_duration_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{LogEntry, LogLevel};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn forwarder(server: &MockServer, max_retries: u32) -> HttpForwarder {
        HttpForwarder::new(
            &server.uri(),
            SignalType::Logs,
            Duration::from_secs(2),
            max_retries,
            10,
        )
        .unwrap()
    }

    fn logs() -> Vec<LogEntry> {
        vec![LogEntry::new(
            LogLevel::Info,
            "User login successful".to_string(),
            "auth".to_string(),
        )]
    }

    #[test]
    fn test_endpoint_per_signal() {
        let forwarder = HttpForwarder::new(
            "http://localhost:8080/",
            SignalType::Spans,
            Duration::from_secs(10),
            3,
            1000,
        )
        .unwrap();

        assert_eq!(forwarder.endpoint(), "http://localhost:8080/v1/spans");
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let forwarder = HttpForwarder::new(
            "http://localhost:8080",
            SignalType::Logs,
            Duration::from_secs(1),
            3,
            100,
        )
        .unwrap();

        let first = forwarder.backoff(1).as_millis();
        let third = forwarder.backoff(3).as_millis();
        assert!((100..=125).contains(&first));
        assert!((400..=500).contains(&third));
    }

    #[tokio::test]
    async fn test_forward_posts_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/logs"))
            .and(body_partial_json(serde_json::json!({ "signal": "logs" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let forwarder = forwarder(&server, 0);
        forwarder.forward(logs().as_slice()).await.unwrap();

        let metrics = forwarder.metrics().await;
        assert_eq!(metrics.batches_sent, 1);
        assert_eq!(metrics.success_rate, 100.0);
    }

    #[tokio::test]
    async fn test_forward_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/logs"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/logs"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let forwarder = forwarder(&server, 2);
        forwarder.forward(logs().as_slice()).await.unwrap();

        assert_eq!(forwarder.metrics().await.retries, 1);
    }

    #[tokio::test]
    async fn test_forward_fails_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .expect(3)
            .mount(&server)
            .await;

        let forwarder = forwarder(&server, 2);
        let result = forwarder.forward(logs().as_slice()).await;

        match result {
            Err(BufferError::Transport(message)) => assert!(message.contains("Rate limited")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(forwarder.metrics().await.batches_failed, 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let empty: Vec<LogEntry> = Vec::new();
        forwarder(&server, 0).forward(empty.as_slice()).await.unwrap();
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "healthy",
                "service": "telemetry-gateway",
                "version": "1.0.0"
            })))
            .mount(&server)
            .await;

        let forwarder = forwarder(&server, 0);
        let health = forwarder.health_check().await.unwrap();

        assert_eq!(
            health,
            GatewayHealth {
                status: "healthy".to_string(),
                service: "telemetry-gateway".to_string(),
                version: "1.0.0".to_string(),
            }
        );
        assert!(forwarder.test_connectivity().await);
    }

    #[tokio::test]
    async fn test_connectivity_fails_on_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        assert!(!forwarder(&server, 0).test_connectivity().await);
    }
}
