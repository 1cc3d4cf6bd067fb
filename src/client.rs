//! HTTP client for a running plainpaper server.
//!
//! Mirrors the routes in [`crate::http`]: it sends the origin and session
//! headers the guards expect, turns structured error bodies into
//! [`ClientError::Api`] and reads the streaming routes with
//! [`read_ndjson`].
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use plainpaper::client::PlainpaperClient;
//! use plainpaper::service::QaRequest;
//! use plainpaper::stream::QaEvent;
//!
//! # async fn run() -> Result<(), plainpaper::ClientError> {
//! let mut client = PlainpaperClient::new("http://127.0.0.1:8080");
//! client.start_session().await?;
//! let req = QaRequest {
//!     question: "When do I have to pay?".into(),
//!     context: "Parking fine, 90 EUR, issued 3 March.".into(),
//!     lang: Some("en".into()),
//! };
//! let mut events = client.answer_stream(&req).await?;
//! while let Some(event) = events.next().await {
//!     if let QaEvent::Delta { text } = event {
//!         print!("{text}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::ClientError;
use crate::guard::session::{IssuedToken, SESSION_HEADER};
use crate::pipeline::postprocess::AnalysisResult;
use crate::service::{AnalyzeRequest, CaptureRequest, OcrRequest, QaRequest};
use crate::stream::ndjson::read_ndjson;
use crate::stream::{
    analyze_error, qa_error, until_terminal, AnalyzeEvent, AnalyzeStream, QaEvent, QaStream,
};
use futures::StreamExt;
use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Appended to a stream that ends without a terminal event.
const TRUNCATED: &str = "stream ended before a final event";

#[derive(Debug, Clone)]
pub struct PlainpaperClient {
    http: reqwest::Client,
    base_url: String,
    origin: Option<String>,
    token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureReply {
    capture_id: String,
}

#[derive(Deserialize)]
struct OcrReply {
    text: String,
}

#[derive(Deserialize)]
struct AnalyzeReply {
    result: AnalysisResult,
}

#[derive(Deserialize)]
struct QaReply {
    answer: String,
}

impl PlainpaperClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http(reqwest::Client::new(), base_url)
    }

    pub fn with_http(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            origin: None,
            token: None,
        }
    }

    /// Send `Origin: <origin>` on every request.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Use an existing session token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> reqwest::RequestBuilder {
        let mut req = self.http.post(format!("{}{}", self.base_url, path)).json(body);
        if let Some(origin) = &self.origin {
            req = req.header(reqwest::header::ORIGIN, origin);
        }
        if let Some(token) = &self.token {
            req = req.header(SESSION_HEADER, token);
        }
        req
    }

    async fn call<B, R>(&self, path: &str, body: &B) -> Result<R, ClientError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let resp = checked(self.post(path, body).send().await?).await?;
        resp.json::<R>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Mint a session token and keep it for later calls.
    pub async fn start_session(&mut self) -> Result<IssuedToken, ClientError> {
        let issued: IssuedToken = self.call("/api/session", &Value::Object(Default::default())).await?;
        debug!("session issued, expires at {}", issued.expires_at);
        self.token = Some(issued.token.clone());
        Ok(issued)
    }

    /// Upload a photo. Returns the capture id.
    pub async fn capture(&self, req: &CaptureRequest) -> Result<String, ClientError> {
        let reply: CaptureReply = self.call("/api/capture", req).await?;
        Ok(reply.capture_id)
    }

    pub async fn ocr(&self, capture_id: &str) -> Result<String, ClientError> {
        let req = OcrRequest {
            capture_id: capture_id.to_string(),
        };
        let reply: OcrReply = self.call("/api/ocr", &req).await?;
        Ok(reply.text)
    }

    pub async fn analyze(&self, req: &AnalyzeRequest) -> Result<AnalysisResult, ClientError> {
        let reply: AnalyzeReply = self.call("/api/analyze", req).await?;
        Ok(reply.result)
    }

    pub async fn answer(&self, req: &QaRequest) -> Result<String, ClientError> {
        let reply: QaReply = self.call("/api/qa", req).await?;
        Ok(reply.answer)
    }

    /// Stream analyze events. The stream always ends with exactly one
    /// `result` or `error`; undecodable lines and transport failures become
    /// an `error`.
    pub async fn analyze_stream(&self, req: &AnalyzeRequest) -> Result<AnalyzeStream, ClientError> {
        let resp = checked(self.post("/api/analyze/stream", req).send().await?).await?;
        let events = read_ndjson::<AnalyzeEvent, _, _, _>(Box::pin(resp.bytes_stream()))
            .map(|event| {
                event.unwrap_or_else(|e| AnalyzeEvent::Error {
                    message: e.to_string(),
                })
            })
            .chain(analyze_error(TRUNCATED));
        Ok(Box::pin(until_terminal(events)))
    }

    /// Stream answer events: `delta*` then exactly one `done` or `error`.
    pub async fn answer_stream(&self, req: &QaRequest) -> Result<QaStream, ClientError> {
        let resp = checked(self.post("/api/qa/stream", req).send().await?).await?;
        let events = read_ndjson::<QaEvent, _, _, _>(Box::pin(resp.bytes_stream()))
            .map(|event| {
                event.unwrap_or_else(|e| QaEvent::Error {
                    message: e.to_string(),
                })
            })
            .chain(qa_error(TRUNCATED));
        Ok(Box::pin(until_terminal(events)))
    }
}

/// Pass successful responses through; turn error statuses into
/// [`ClientError::Api`].
async fn checked(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after_secs = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok());
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    let text = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);
    Err(ClientError::Api {
        status: status.as_u16(),
        code: text("code").unwrap_or_else(|| "UNKNOWN".to_string()),
        message: text("error").unwrap_or_else(|| status.to_string()),
        retry_after_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalised() {
        let c = PlainpaperClient::new("http://127.0.0.1:8080/");
        assert_eq!(c.base_url, "http://127.0.0.1:8080");
        assert_eq!(c.token(), None);
        let c = c.with_token("a.b").with_origin("http://localhost:3000");
        assert_eq!(c.token(), Some("a.b"));
        assert_eq!(c.origin.as_deref(), Some("http://localhost:3000"));
    }

    #[test]
    fn requests_carry_origin_and_session_headers() {
        let c = PlainpaperClient::new("http://127.0.0.1:8080")
            .with_token("a.b")
            .with_origin("http://localhost:3000");
        let req = c.post("/api/ocr", &Value::Null).build().unwrap();
        assert_eq!(req.headers()[SESSION_HEADER], "a.b");
        assert_eq!(req.headers()[reqwest::header::ORIGIN], "http://localhost:3000");
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let mut c = PlainpaperClient::new("http://127.0.0.1:1");
        let err = c.start_session().await.unwrap_err();
        assert!(matches!(err, ClientError::Http(_)));
        assert_eq!(err.status(), None);
    }
}
