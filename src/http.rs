//! HTTP surface over [`DocumentService`].
//!
//! | Method | Path                  | Body                           |
//! |--------|-----------------------|--------------------------------|
//! | GET    | `/healthz`            | `{ok, store}`                  |
//! | POST   | `/api/session`        | `{ok, token, expiresAt}`       |
//! | POST   | `/api/capture`        | `{ok, captureId}`              |
//! | POST   | `/api/ocr`            | `{ok, text}`                   |
//! | POST   | `/api/analyze`        | `{ok, result}`                 |
//! | POST   | `/api/analyze/stream` | NDJSON `card* (result\|error)` |
//! | POST   | `/api/qa`             | `{ok, answer}`                 |
//! | POST   | `/api/qa/stream`      | NDJSON `delta* (done\|error)`  |
//!
//! Every failure is a JSON body `{ok:false, error, code}` with the status of
//! the [`ApiError`]; rate-limit rejections also carry `Retry-After`.

use crate::error::ApiError;
use crate::guard::session::SESSION_HEADER;
use crate::guard::RequestMeta;
use crate::service::{AnalyzeRequest, CaptureRequest, DocumentService, OcrRequest, QaRequest};
use crate::stream::ndjson::encode_line;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use tracing::warn;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Slack on top of the base64-encoded images in a capture body.
const BODY_SLACK: usize = 64 * 1024;

/// Build the router. Capture bodies may hold two base64 images, so the body
/// limit is derived from `max_image_bytes`.
pub fn router(service: DocumentService) -> Router {
    let body_limit = service.config().max_image_bytes.saturating_mul(3) + BODY_SLACK;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/session", post(session))
        .route("/api/capture", post(capture))
        .route("/api/ocr", post(ocr))
        .route("/api/analyze", post(analyze))
        .route("/api/analyze/stream", post(analyze_stream))
        .route("/api/qa", post(qa))
        .route("/api/qa/stream", post(qa_stream))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(service)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!("{} {}: {}", status.as_u16(), self.code(), self);
        }
        let mut resp = (status, Json(self.to_body())).into_response();
        if let Some(secs) = self.retry_after_secs() {
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        resp
    }
}

/// Guard inputs from request headers.
pub fn request_meta(headers: &HeaderMap) -> RequestMeta {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    RequestMeta {
        origin: value("origin").map(str::to_string),
        referer: value("referer").map(str::to_string),
        session_token: value(SESSION_HEADER).map(str::to_string),
        client_ip: RequestMeta::client_ip_from(value("x-forwarded-for"), value("x-real-ip")),
    }
}

/// Unwrap a JSON body. A body over the router limit maps to `IMAGE_TOO_LARGE`.
fn body<T>(
    svc: &DocumentService,
    headers: &HeaderMap,
    payload: Result<Json<T>, JsonRejection>,
) -> Result<T, ApiError> {
    payload.map(|Json(v)| v).map_err(|e| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            let size = headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            ApiError::ImageTooLarge {
                size,
                limit: svc.config().max_image_bytes,
            }
        } else {
            ApiError::InvalidBody {
                detail: e.body_text(),
            }
        }
    })
}

/// Serialize each event as one NDJSON line.
fn ndjson<S, T>(events: S) -> Response
where
    S: Stream<Item = T> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let lines = events.filter_map(|event| async move {
        match encode_line(&event) {
            Ok(line) => Some(Ok::<_, Infallible>(line)),
            Err(e) => {
                warn!("dropping unserializable event: {}", e);
                None
            }
        }
    });
    (
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(lines),
    )
        .into_response()
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn healthz(State(svc): State<DocumentService>) -> Result<Json<Value>, ApiError> {
    let store = svc.health().await?;
    Ok(Json(json!({ "ok": true, "store": store })))
}

async fn session(State(svc): State<DocumentService>, headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    let issued = svc.issue_session(&request_meta(&headers)).await?;
    Ok(Json(json!({
        "ok": true,
        "token": issued.token,
        "expiresAt": issued.expires_at,
    })))
}

async fn capture(
    State(svc): State<DocumentService>,
    headers: HeaderMap,
    payload: Result<Json<CaptureRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let meta = request_meta(&headers);
    let id = svc.capture(&meta, &body(&svc, &headers, payload)?).await?;
    Ok(Json(json!({ "ok": true, "captureId": id })))
}

async fn ocr(
    State(svc): State<DocumentService>,
    headers: HeaderMap,
    payload: Result<Json<OcrRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let meta = request_meta(&headers);
    let text = svc.ocr(&meta, &body(&svc, &headers, payload)?).await?;
    Ok(Json(json!({ "ok": true, "text": text })))
}

async fn analyze(
    State(svc): State<DocumentService>,
    headers: HeaderMap,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let meta = request_meta(&headers);
    let result = svc.analyze(&meta, &body(&svc, &headers, payload)?).await?;
    Ok(Json(json!({ "ok": true, "result": result })))
}

async fn analyze_stream(
    State(svc): State<DocumentService>,
    headers: HeaderMap,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let meta = request_meta(&headers);
    let events = svc.analyze_stream(&meta, &body(&svc, &headers, payload)?).await?;
    Ok(ndjson(events))
}

async fn qa(
    State(svc): State<DocumentService>,
    headers: HeaderMap,
    payload: Result<Json<QaRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let meta = request_meta(&headers);
    let answer = svc.answer(&meta, &body(&svc, &headers, payload)?).await?;
    Ok(Json(json!({ "ok": true, "answer": answer })))
}

async fn qa_stream(
    State(svc): State<DocumentService>,
    headers: HeaderMap,
    payload: Result<Json<QaRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let meta = request_meta(&headers);
    let events = svc.answer_stream(&meta, &body(&svc, &headers, payload)?).await?;
    Ok(ndjson(events))
}
