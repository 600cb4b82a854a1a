//! HTTP client for a broker served by `handlers::broker_routes`.

use super::RouterError;
use super::protocol::*;
use super::types::*;

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);
const REQUEST_ATTEMPTS: usize = 4;

pub struct RemoteRouter {
    http_client: reqwest::Client,
    base_url: String,
}

impl RemoteRouter {
    pub fn new(addr: &str) -> Self {
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr)
        };
        Self {
            http_client: reqwest::Client::new(),
            base_url,
        }
    }

    /// Polls `/health` until the broker answers or `attempts` run out.
    pub async fn connect(addr: &str, attempts: usize) -> Result<Self, RouterError> {
        let router = Self::new(addr);
        let mut delay_ms = 200u64;
        for attempt in 0..attempts.max(1) {
            let response = router
                .http_client
                .get(router.url(ENDPOINT_HEALTH))
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!("Connected to router at {}", router.base_url);
                    return Ok(router);
                }
                Ok(resp) => tracing::debug!("Router not ready: {}", resp.status()),
                Err(e) => tracing::debug!("Router unreachable (attempt {}): {}", attempt + 1, e),
            }
            let jitter = rand::random::<u64>() % 100;
            tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
            delay_ms = (delay_ms * 2).min(2000);
        }
        Err(RouterError::TransportDisconnected(format!(
            "router at {} did not become healthy",
            router.base_url
        )))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<reqwest::Response, RouterError> {
        let mut delay_ms = 150u64;
        let mut last_error = String::new();

        for attempt in 0..REQUEST_ATTEMPTS {
            match build().timeout(timeout).send().await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 == REQUEST_ATTEMPTS {
                        break;
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(RouterError::TransportDisconnected(last_error))
    }

    async fn post_with_retry<T: serde::Serialize>(
        &self,
        url: String,
        payload: &T,
    ) -> Result<reqwest::Response, RouterError> {
        self.send_with_retry(
            || self.http_client.post(url.clone()).json(payload),
            REQUEST_TIMEOUT,
        )
        .await
    }

    async fn post_bytes_with_retry(
        &self,
        url: String,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, RouterError> {
        self.send_with_retry(
            || self.http_client.post(url.clone()).body(body.clone()),
            REQUEST_TIMEOUT,
        )
        .await
    }
}

/// Maps a non-success reply back onto the broker's error.
async fn check_status(
    response: reqwest::Response,
    subject: &str,
) -> Result<reqwest::Response, RouterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response
        .json::<ErrorResponse>()
        .await
        .map(|e| e.error)
        .unwrap_or_else(|_| status.to_string());
    if status == StatusCode::NOT_FOUND {
        if detail.contains("exchange") {
            return Err(RouterError::UnknownExchange(subject.to_string()));
        }
        if detail.contains("delivery") {
            return Err(RouterError::UnknownDelivery(
                subject.rsplit('/').next().and_then(|t| t.parse().ok()).unwrap_or(0),
            ));
        }
        return Err(RouterError::UnknownQueue(subject.to_string()));
    }
    Err(RouterError::TransportDisconnected(format!(
        "{} failed: {}",
        subject, detail
    )))
}

async fn read_count(response: reqwest::Response) -> Result<usize, RouterError> {
    response
        .json::<CountResponse>()
        .await
        .map(|c| c.count)
        .map_err(|e| RouterError::TransportDisconnected(e.to_string()))
}

#[async_trait]
impl MessageRouter for RemoteRouter {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), RouterError> {
        let payload = DeclareExchangeRequest {
            exchange: exchange.to_string(),
        };
        let response = self
            .post_with_retry(self.url(ENDPOINT_EXCHANGE), &payload)
            .await?;
        check_status(response, exchange).await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        exchange: &str,
        routing_key: &str,
        queue: &str,
    ) -> Result<QueueHandle, RouterError> {
        let payload = BindQueueRequest {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        };
        let response = self.post_with_retry(self.url(ENDPOINT_BIND), &payload).await?;
        check_status(response, queue).await?;
        Ok(QueueHandle(queue.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), RouterError> {
        let url = self.url(&format!("{}/{}/{}", ENDPOINT_PUBLISH, exchange, routing_key));
        let response = self.post_bytes_with_retry(url, body).await?;
        check_status(response, exchange).await?;
        Ok(())
    }

    async fn publish_next_routing_key(
        &self,
        exchange: &str,
        body: Vec<u8>,
    ) -> Result<String, RouterError> {
        let url = self.url(&format!("{}/{}", ENDPOINT_PUBLISH_NEXT, exchange));
        let response = self.post_bytes_with_retry(url, body).await?;
        let response = check_status(response, exchange).await?;
        response
            .json::<PublishNextResponse>()
            .await
            .map(|r| r.routing_key)
            .map_err(|e| RouterError::TransportDisconnected(e.to_string()))
    }

    async fn consume(
        &self,
        queue: &QueueHandle,
        timeout: Duration,
    ) -> Result<Option<Delivery>, RouterError> {
        let url = self.url(&format!(
            "{}/{}?timeout_ms={}",
            ENDPOINT_CONSUME,
            queue.name(),
            timeout.as_millis()
        ));
        let response = self
            .send_with_retry(
                || self.http_client.get(url.clone()),
                REQUEST_TIMEOUT + timeout,
            )
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = check_status(response, queue.name()).await?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let tag = header(HEADER_DELIVERY_TAG)
            .and_then(|t| t.parse::<u64>().ok())
            .ok_or_else(|| {
                RouterError::TransportDisconnected("delivery without tag header".to_string())
            })?;
        let redelivered = header(HEADER_REDELIVERED).as_deref() == Some("1");
        let body = response
            .bytes()
            .await
            .map_err(|e| RouterError::TransportDisconnected(e.to_string()))?;

        Ok(Some(Delivery {
            tag,
            body: body.to_vec(),
            redelivered,
        }))
    }

    async fn ack(&self, queue: &QueueHandle, tag: u64) -> Result<(), RouterError> {
        let subject = format!("{}/{}", queue.name(), tag);
        let url = self.url(&format!("{}/{}", ENDPOINT_ACK, subject));
        let response = self.post_bytes_with_retry(url, Vec::new()).await?;
        check_status(response, &subject).await?;
        Ok(())
    }

    async fn nack(&self, queue: &QueueHandle, tag: u64) -> Result<(), RouterError> {
        let subject = format!("{}/{}", queue.name(), tag);
        let url = self.url(&format!("{}/{}", ENDPOINT_NACK, subject));
        let response = self.post_bytes_with_retry(url, Vec::new()).await?;
        check_status(response, &subject).await?;
        Ok(())
    }

    async fn recover(&self, queue: &QueueHandle) -> Result<usize, RouterError> {
        let url = self.url(&format!("{}/{}", ENDPOINT_RECOVER, queue.name()));
        let response = self.post_bytes_with_retry(url, Vec::new()).await?;
        read_count(check_status(response, queue.name()).await?).await
    }

    async fn pending_count(&self, queue: &QueueHandle) -> Result<usize, RouterError> {
        let url = self.url(&format!("{}/{}", ENDPOINT_PENDING, queue.name()));
        let response = self
            .send_with_retry(|| self.http_client.get(url.clone()), REQUEST_TIMEOUT)
            .await?;
        read_count(check_status(response, queue.name()).await?).await
    }
}
