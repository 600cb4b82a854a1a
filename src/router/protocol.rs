//! HTTP contract of the broker service.
//!
//! Message bodies travel as raw bytes; delivery metadata rides in headers.

use serde::{Deserialize, Serialize};

pub const ENDPOINT_HEALTH: &str = "/health";
pub const ENDPOINT_EXCHANGE: &str = "/exchange";
pub const ENDPOINT_BIND: &str = "/bind";
pub const ENDPOINT_PUBLISH: &str = "/publish";
pub const ENDPOINT_PUBLISH_NEXT: &str = "/publish_next";
pub const ENDPOINT_CONSUME: &str = "/consume";
pub const ENDPOINT_ACK: &str = "/ack";
pub const ENDPOINT_NACK: &str = "/nack";
pub const ENDPOINT_RECOVER: &str = "/recover";
pub const ENDPOINT_PENDING: &str = "/pending";

pub const HEADER_DELIVERY_TAG: &str = "x-delivery-tag";
pub const HEADER_REDELIVERED: &str = "x-redelivered";

#[derive(Debug, Serialize, Deserialize)]
pub struct DeclareExchangeRequest {
    pub exchange: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BindQueueRequest {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishNextResponse {
    pub routing_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConsumeParams {
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
