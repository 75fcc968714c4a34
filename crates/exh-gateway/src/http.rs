//! HTTP surface: stream management, ingest, findings, and push channels.

use std::borrow::Cow;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::stream;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use exh_broker::Subscription;
use exh_protocol::{CloseReason, ExhaustError, StreamId};
use exh_state::{IssuedStream, NewStream};

use crate::auth::bearer_token;
use crate::service::ExhaustService;

/// `ExhaustError` rendered as an HTTP response with a `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError(pub ExhaustError);

impl From<ExhaustError> for ApiError {
    fn from(e: ExhaustError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ExhaustError::Unauthorized => StatusCode::UNAUTHORIZED,
            ExhaustError::StreamNotFound(_) => StatusCode::NOT_FOUND,
            ExhaustError::StreamGone(_) => StatusCode::GONE,
            ExhaustError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ExhaustError::InvalidRequest(_) | ExhaustError::MalformedRecord(_) => StatusCode::BAD_REQUEST,
            ExhaustError::StreamEnded => StatusCode::GONE,
            ExhaustError::SlowConsumer
            | ExhaustError::TokenTimeout
            | ExhaustError::SequenceViolation { .. }
            | ExhaustError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if !self.0.is_client_error() {
            tracing::warn!(error = %self.0, "Request failed");
        }
        (status, Json(serde_json::json!({"error": self.0.to_string()}))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone)]
struct WebState {
    service: Arc<ExhaustService>,
}

/// Build the application router.
pub fn router(service: Arc<ExhaustService>) -> Router {
    Router::new()
        .route("/api/health", get(api_health))
        .route("/streams", get(list_streams).post(create_stream))
        .route("/streams/:id", get(get_stream).post(ingest).delete(delete_stream))
        .route("/streams/:id/disconnect", post(disconnect_stream))
        .route("/streams/:id/token", post(reissue_token))
        .route("/streams/:id/findings", get(list_findings))
        .route("/streams/:id/events", get(stream_events))
        .route("/streams/:id/ws", get(stream_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(WebState { service })
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    bind_addr: &str,
    service: Arc<ExhaustService>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), anyhow::Error> {
    let app = router(service);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Exhaust HTTP API listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

fn require_admin(web: &WebState, headers: &HeaderMap) -> ApiResult<()> {
    if web.service.admin().admits(bearer_token(headers)) {
        Ok(())
    } else {
        Err(ExhaustError::Unauthorized.into())
    }
}

async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "exhaust", "version": env!("CARGO_PKG_VERSION")}))
}

fn issued_body(issued: &IssuedStream) -> serde_json::Value {
    serde_json::json!({
        "stream_id": issued.info.stream_id,
        "stream_url": issued.info.stream_url,
        "token": issued.token.as_str(),
        "status": issued.info.status,
        "token_generation": issued.info.token_generation,
    })
}

async fn create_stream(
    State(web): State<WebState>,
    headers: HeaderMap,
    Json(req): Json<NewStream>,
) -> ApiResult<Response> {
    require_admin(&web, &headers)?;
    let issued = web.service.create_stream(req).await?;
    Ok((StatusCode::CREATED, Json(issued_body(&issued))).into_response())
}

async fn list_streams(State(web): State<WebState>, headers: HeaderMap) -> ApiResult<Response> {
    require_admin(&web, &headers)?;
    Ok(Json(web.service.list().await).into_response())
}

async fn get_stream(
    State(web): State<WebState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    require_admin(&web, &headers)?;
    let info = web.service.get(&StreamId::new(id)).await?;
    Ok(Json(info).into_response())
}

async fn ingest(
    State(web): State<WebState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Body,
) -> ApiResult<Response> {
    let stream_id = StreamId::new(id);
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let receipt = web
        .service
        .ingest(&stream_id, bearer_token(&headers), content_type, body.into_data_stream())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)).into_response())
}

async fn disconnect_stream(
    State(web): State<WebState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    require_admin(&web, &headers)?;
    let info = web.service.disconnect(&StreamId::new(id)).await?;
    Ok(Json(info).into_response())
}

async fn reissue_token(
    State(web): State<WebState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    require_admin(&web, &headers)?;
    let issued = web.service.reissue_token(&StreamId::new(id)).await?;
    Ok(Json(issued_body(&issued)).into_response())
}

async fn delete_stream(
    State(web): State<WebState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    require_admin(&web, &headers)?;
    web.service.delete(&StreamId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct FindingsQuery {
    #[serde(default)]
    since: usize,
}

async fn list_findings(
    State(web): State<WebState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<FindingsQuery>,
) -> ApiResult<Response> {
    require_admin(&web, &headers)?;
    let stream_id = StreamId::new(id);
    let findings = web.service.findings(&stream_id, q.since).await?;
    let analysis = web.service.analysis_status(&stream_id).await?;
    let next = q.since + findings.len();
    Ok(Json(serde_json::json!({
        "stream_id": stream_id,
        "analysis": analysis,
        "findings": findings,
        "next": next,
    }))
    .into_response())
}

fn close_reason(err: &ExhaustError) -> CloseReason {
    match err {
        ExhaustError::SlowConsumer => CloseReason::SlowConsumer,
        _ => CloseReason::StreamEnded,
    }
}

/// Server-Sent Events push channel: `record` and `finding` events, then a
/// final `end` event naming why the channel closed.
async fn stream_events(
    State(web): State<WebState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    require_admin(&web, &headers)?;
    let subscription = web.service.subscribe(&StreamId::new(id)).await?;
    let sse_stream = stream::unfold(Some(subscription), |state| async move {
        let mut subscription = state?;
        let (text, next) = match subscription.recv().await {
            Ok(event) => {
                let payload = serde_json::to_string(&event).unwrap_or_default();
                (format!("event: {}\ndata: {}\n\n", event.kind(), payload), Some(subscription))
            }
            Err(e) => {
                let payload = serde_json::json!({"reason": close_reason(&e).as_str()});
                (format!("event: end\ndata: {payload}\n\n"), None)
            }
        };
        Some((Ok::<Bytes, std::convert::Infallible>(Bytes::from(text)), next))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(sse_stream))
        .map_err(|e| ApiError(ExhaustError::InvalidRequest(e.to_string())))
}

async fn stream_ws(
    ws: WebSocketUpgrade,
    State(web): State<WebState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    require_admin(&web, &headers)?;
    let subscription = web.service.subscribe(&StreamId::new(id)).await?;
    Ok(ws.on_upgrade(move |socket| stream_loop(socket, subscription)))
}

async fn stream_loop(mut socket: WebSocket, mut subscription: Subscription) {
    let reason = loop {
        tokio::select! {
            next = subscription.recv() => match next {
                Ok(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    if socket.send(Message::Text(payload)).await.is_err() {
                        return;
                    }
                }
                Err(e) => break close_reason(&e),
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                    tracing::debug!(stream = %subscription.stream_id(), "Viewer left");
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    };

    let end = serde_json::json!({"type": "end", "data": {"reason": reason.as_str()}}).to_string();
    let _ = socket.send(Message::Text(end)).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code: 1000, reason: Cow::Borrowed(reason.as_str()) })))
        .await;
}
