use super::RouterError;
use super::broker::Broker;
use super::protocol::*;
use super::types::{MessageRouter, QueueHandle};

use axum::body::Bytes;
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use std::sync::Arc;
use std::time::Duration;

const MAX_CONSUME_WAIT: Duration = Duration::from_secs(10);

/// Routes exposing a `Broker` over HTTP.
pub fn broker_routes(broker: Arc<Broker>) -> Router {
    Router::new()
        .route(ENDPOINT_HEALTH, get(handle_health))
        .route(ENDPOINT_EXCHANGE, post(handle_declare_exchange))
        .route(ENDPOINT_BIND, post(handle_bind_queue))
        .route(
            &format!("{}/:exchange/:routing_key", ENDPOINT_PUBLISH),
            post(handle_publish),
        )
        .route(
            &format!("{}/:exchange", ENDPOINT_PUBLISH_NEXT),
            post(handle_publish_next),
        )
        .route(&format!("{}/:queue", ENDPOINT_CONSUME), get(handle_consume))
        .route(&format!("{}/:queue/:tag", ENDPOINT_ACK), post(handle_ack))
        .route(&format!("{}/:queue/:tag", ENDPOINT_NACK), post(handle_nack))
        .route(&format!("{}/:queue", ENDPOINT_RECOVER), post(handle_recover))
        .route(&format!("{}/:queue", ENDPOINT_PENDING), get(handle_pending))
        .layer(Extension(broker))
}

fn error_response(err: RouterError) -> Response {
    let status = match err {
        RouterError::UnknownQueue(_)
        | RouterError::UnknownExchange(_)
        | RouterError::UnknownDelivery(_) => StatusCode::NOT_FOUND,
        RouterError::TransportDisconnected(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    tracing::debug!("Broker request failed: {}", err);
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

async fn handle_health() -> StatusCode {
    StatusCode::OK
}

async fn handle_declare_exchange(
    Extension(broker): Extension<Arc<Broker>>,
    Json(req): Json<DeclareExchangeRequest>,
) -> Response {
    match broker.declare_exchange(&req.exchange).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_bind_queue(
    Extension(broker): Extension<Arc<Broker>>,
    Json(req): Json<BindQueueRequest>,
) -> Response {
    match broker
        .bind_queue(&req.exchange, &req.routing_key, &req.queue)
        .await
    {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_publish(
    Extension(broker): Extension<Arc<Broker>>,
    Path((exchange, routing_key)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    match broker.publish(&exchange, &routing_key, body.to_vec()).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_publish_next(
    Extension(broker): Extension<Arc<Broker>>,
    Path(exchange): Path<String>,
    body: Bytes,
) -> Response {
    match broker.publish_next_routing_key(&exchange, body.to_vec()).await {
        Ok(routing_key) => (StatusCode::OK, Json(PublishNextResponse { routing_key })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_consume(
    Extension(broker): Extension<Arc<Broker>>,
    Path(queue): Path<String>,
    Query(params): Query<ConsumeParams>,
) -> Response {
    let wait = params
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO)
        .min(MAX_CONSUME_WAIT);

    match broker.consume(&QueueHandle(queue), wait).await {
        Ok(Some(delivery)) => {
            let mut headers = HeaderMap::new();
            headers.insert(HEADER_DELIVERY_TAG, HeaderValue::from(delivery.tag));
            headers.insert(
                HEADER_REDELIVERED,
                HeaderValue::from_static(if delivery.redelivered { "1" } else { "0" }),
            );
            (StatusCode::OK, headers, delivery.body).into_response()
        }
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_ack(
    Extension(broker): Extension<Arc<Broker>>,
    Path((queue, tag)): Path<(String, u64)>,
) -> Response {
    match broker.ack(&QueueHandle(queue), tag).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_nack(
    Extension(broker): Extension<Arc<Broker>>,
    Path((queue, tag)): Path<(String, u64)>,
) -> Response {
    match broker.nack(&QueueHandle(queue), tag).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_recover(
    Extension(broker): Extension<Arc<Broker>>,
    Path(queue): Path<String>,
) -> Response {
    match broker.recover(&QueueHandle(queue)).await {
        Ok(count) => (StatusCode::OK, Json(CountResponse { count })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_pending(
    Extension(broker): Extension<Arc<Broker>>,
    Path(queue): Path<String>,
) -> Response {
    match broker.pending_count(&QueueHandle(queue)).await {
        Ok(count) => (StatusCode::OK, Json(CountResponse { count })).into_response(),
        Err(e) => error_response(e),
    }
}
