//! Request capture interceptor
//!
//! Wraps every route of an axum router. For each request cycle it:
//! - opens a [`RequestContext`] so logs and exceptions raised by the handler
//!   carry the request's correlation id
//! - reads the request body (and, for JSON/text responses, the response
//!   body) up to the capture limit; the wrapped side still receives every
//!   byte, and a failing body stream fails there exactly as it would unwrapped
//! - records exactly one [`RequestHit`] when the cycle ends, whether the
//!   handler returned, panicked (status 500) or was dropped (status 499)
//!
//! A handler panic is recorded as an exception and then resumed, so the
//! surrounding server (or a `CatchPanicLayer`) still sees it.

use crate::observability::context::RequestContext;
use crate::observability::hub::DispatchHub;
use crate::observability::live::InFlightRequest;
use crate::observability::model::{
    CapturedBody, ExceptionEvent, HitOutcome, RequestHit, StackFrame,
};
use crate::observability::panic;
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{header, HeaderMap, Method},
    middleware::{self, Next},
    response::Response,
    Router,
};
use futures::{stream, FutureExt, StreamExt};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

/// Status recorded for a cycle dropped before the handler finished
pub const CANCELLED_STATUS: u16 = 499;

/// Add the capture interceptor to every route of `router`
pub fn instrument<S>(router: Router<S>, hub: Arc<DispatchHub>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    panic::install_panic_hook();
    router.layer(middleware::from_fn_with_state(hub, capture_middleware))
}

/// Capture middleware
///
/// Use through [`instrument`] or directly with `middleware::from_fn_with_state`.
pub async fn capture_middleware(
    State(hub): State<Arc<DispatchHub>>,
    req: Request,
    next: Next,
) -> Response {
    if hub.is_excluded(req.method().as_str(), req.uri().path()) {
        return next.run(req).await;
    }

    let ctx = RequestContext::new(req.method().as_str(), req.uri().path());
    let mut cycle = CaptureCycle::begin(hub.clone(), &ctx, &req);
    let capture = hub.capture_config().clone();

    let req = if capture.enable_request_body && method_has_body(req.method()) {
        let (parts, body) = req.into_parts();
        let (captured, body) = capture_body(body, &parts.headers, capture.max_body_bytes).await;
        cycle.record_request_body(captured);
        Request::from_parts(parts, body)
    } else {
        req
    };

    let (result, report) = ctx
        .clone()
        .scope(async move {
            let result = AssertUnwindSafe(next.run(req)).catch_unwind().await;
            let report = if result.is_err() {
                panic::take_panic_report()
            } else {
                None
            };
            (result, report)
        })
        .await;

    match result {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            cycle.record_response_headers(&parts.headers);

            let body = if capture.enable_response_body && is_capturable_response(&parts.headers) {
                let (captured, body) = capture_body(body, &parts.headers, capture.max_body_bytes).await;
                cycle.record_response_body(captured);
                body
            } else {
                body
            };

            cycle.finish(parts.status.as_u16(), HitOutcome::Completed);
            Response::from_parts(parts, body)
        }
        Err(payload) => {
            let (message, frames) = match report {
                Some(report) => (report.message, report.frames),
                None => (
                    panic::panic_message(payload.as_ref()),
                    vec![StackFrame {
                        function: "<panic>".to_string(),
                        file: None,
                        line: None,
                    }],
                ),
            };

            let mut exception = ExceptionEvent::new("panic", message, frames);
            exception.correlation_id = Some(ctx.correlation_id().to_string());
            exception.endpoint = Some(ctx.path().to_string());
            exception.method = Some(ctx.method().to_string());
            if let Err(e) = hub.submit_exception(exception) {
                tracing::warn!(error = %e, "Failed to record handler panic");
            }

            cycle.finish(500, HitOutcome::Failed);
            std::panic::resume_unwind(payload)
        }
    }
}

/// Owns the pending hit of one cycle; records it as cancelled if dropped unfinished
struct CaptureCycle {
    hub: Arc<DispatchHub>,
    hit: Option<RequestHit>,
    correlation_id: String,
    started: Instant,
}

impl CaptureCycle {
    fn begin(hub: Arc<DispatchHub>, ctx: &RequestContext, req: &Request) -> Self {
        let mut hit = RequestHit::new(
            req.method().as_str(),
            req.uri().path(),
            200,
            std::time::Duration::ZERO,
        )
        .with_correlation_id(ctx.correlation_id());
        hit.timestamp = ctx.started_at();
        hit.route = req
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_string());
        hit.client = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string());
        hit.query = req
            .uri()
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        hit.request_headers = header_map(req.headers());

        hub.begin_request(InFlightRequest {
            correlation_id: ctx.correlation_id().to_string(),
            method: ctx.method().to_string(),
            path: ctx.path().to_string(),
            started_at: ctx.started_at(),
        });

        Self {
            hub,
            hit: Some(hit),
            correlation_id: ctx.correlation_id().to_string(),
            started: Instant::now(),
        }
    }

    fn record_request_body(&mut self, body: Option<CapturedBody>) {
        if let Some(hit) = self.hit.as_mut() {
            hit.request_body = body;
        }
    }

    fn record_response_headers(&mut self, headers: &HeaderMap) {
        if let Some(hit) = self.hit.as_mut() {
            hit.response_headers = header_map(headers);
        }
    }

    fn record_response_body(&mut self, body: Option<CapturedBody>) {
        if let Some(hit) = self.hit.as_mut() {
            hit.response_body = body;
        }
    }

    /// Submit the hit; later calls are no-ops
    fn finish(&mut self, status: u16, outcome: HitOutcome) {
        let Some(mut hit) = self.hit.take() else {
            return;
        };
        hit.status = status;
        hit.outcome = outcome;
        hit.duration_us = u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX);
        if let Err(e) = self.hub.submit_request_hit(hit) {
            tracing::warn!(error = %e, "Failed to record request hit");
        }
    }
}

impl Drop for CaptureCycle {
    fn drop(&mut self) {
        self.finish(CANCELLED_STATUS, HitOutcome::Cancelled);
        self.hub.end_request(&self.correlation_id);
    }
}

/// What [`buffer_body`] managed to read
enum BufferedBody {
    /// The whole body, within the limit
    Complete(Bytes),
    /// More than the limit; `body` yields `seen` followed by the unread rest
    OverLimit { seen: Bytes, body: Body },
    /// The stream failed; `body` yields what was read, then the same error
    Failed { error: String, body: Body },
}

/// Read at most a little over `limit` bytes of `body` without losing any of it
async fn buffer_body(body: Body, limit: usize) -> BufferedBody {
    let mut rest = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut seen = 0usize;

    while let Some(item) = rest.next().await {
        match item {
            Ok(chunk) => {
                seen += chunk.len();
                chunks.push(chunk);
                if seen > limit {
                    let seen = concat(&chunks, seen);
                    let replay = stream::iter(chunks.into_iter().map(Ok::<_, axum::Error>));
                    return BufferedBody::OverLimit {
                        seen,
                        body: Body::from_stream(replay.chain(rest)),
                    };
                }
            }
            Err(e) => {
                let error = e.to_string();
                let replay = chunks
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(e)));
                return BufferedBody::Failed {
                    error,
                    body: Body::from_stream(stream::iter(replay)),
                };
            }
        }
    }

    BufferedBody::Complete(concat(&chunks, seen))
}

fn concat(chunks: &[Bytes], len: usize) -> Bytes {
    match chunks {
        [] => Bytes::new(),
        [single] => single.clone(),
        _ => {
            let mut buf = Vec::with_capacity(len);
            for chunk in chunks {
                buf.extend_from_slice(chunk);
            }
            Bytes::from(buf)
        }
    }
}

/// Classify what can be read of `body` and hand back a body equivalent to the original
async fn capture_body(body: Body, headers: &HeaderMap, max_bytes: usize) -> (Option<CapturedBody>, Body) {
    match buffer_body(body, max_bytes).await {
        BufferedBody::Complete(bytes) => {
            let captured = classify_body(&bytes, content_type(headers), max_bytes);
            (captured, Body::from(bytes))
        }
        BufferedBody::OverLimit { seen, body } => {
            let size = content_length(headers).unwrap_or(seen.len());
            let captured = classify_body(&seen, content_type(headers), max_bytes)
                .map(|captured| with_original_size(captured, size));
            (captured, body)
        }
        BufferedBody::Failed { error, body } => {
            tracing::warn!(error = %error, "Body stream failed during capture");
            (None, body)
        }
    }
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Bodies cut off at the limit only know their size from `Content-Length`
fn with_original_size(body: CapturedBody, original: usize) -> CapturedBody {
    match body {
        CapturedBody::Text { text, truncated, .. } => CapturedBody::Text { text, truncated, size: original },
        CapturedBody::Omitted { content_type, .. } => CapturedBody::Omitted { content_type, size: original },
        json @ CapturedBody::Json { .. } => json,
    }
}

fn method_has_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
}

/// Essence of a content type: `Application/JSON; charset=utf-8` -> `application/json`
fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_json(mime: &str) -> bool {
    mime == "application/json" || mime.ends_with("+json")
}

fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime == "application/xml"
        || mime.ends_with("+xml")
        || mime == "application/javascript"
}

/// JSON and text responses are buffered; streams never are
fn is_capturable_response(headers: &HeaderMap) -> bool {
    match content_type(headers).map(mime_essence) {
        Some(mime) => mime != "text/event-stream" && (is_json(&mime) || is_textual(&mime)),
        None => false,
    }
}

/// Turn raw body bytes into what gets recorded. Empty bodies record nothing.
pub(crate) fn classify_body(
    bytes: &[u8],
    content_type: Option<&str>,
    max_bytes: usize,
) -> Option<CapturedBody> {
    if bytes.is_empty() {
        return None;
    }
    let mime = content_type.map(mime_essence);
    let omitted = || CapturedBody::Omitted {
        content_type: content_type.map(String::from),
        size: bytes.len(),
    };

    match mime.as_deref() {
        Some(m) if is_json(m) && bytes.len() <= max_bytes => {
            match serde_json::from_slice::<Value>(bytes) {
                Ok(value) => Some(CapturedBody::Json { value }),
                Err(_) => Some(text_body(bytes, max_bytes).unwrap_or_else(omitted)),
            }
        }
        Some("application/x-www-form-urlencoded") if bytes.len() <= max_bytes => {
            let fields: Map<String, Value> = url::form_urlencoded::parse(bytes)
                .into_owned()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            Some(CapturedBody::Json {
                value: Value::Object(fields),
            })
        }
        Some(m) if m.starts_with("multipart/") => Some(omitted()),
        Some(m) if is_json(m) || is_textual(m) || m == "application/x-www-form-urlencoded" => {
            Some(text_body(bytes, max_bytes).unwrap_or_else(omitted))
        }
        Some(_) => Some(omitted()),
        None => Some(text_body(bytes, max_bytes).unwrap_or_else(omitted)),
    }
}

/// UTF-8 text cut at `max_bytes` on a character boundary; `None` for binary data
fn text_body(bytes: &[u8], max_bytes: usize) -> Option<CapturedBody> {
    let cut = bytes.len().min(max_bytes);
    let text = match std::str::from_utf8(&bytes[..cut]) {
        Ok(text) => text,
        // The cut split a multi-byte character
        Err(e) if cut < bytes.len() && e.error_len().is_none() => {
            std::str::from_utf8(&bytes[..e.valid_up_to()]).ok()?
        }
        Err(_) => return None,
    };

    Some(CapturedBody::Text {
        text: text.to_string(),
        truncated: text.len() < bytes.len(),
        size: bytes.len(),
    })
}

/// Flatten a header map; repeated headers are joined with ", "
fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = value.to_str().unwrap_or("<binary>");
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_classify_json() {
        let body = classify_body(br#"{"name":"ada"}"#, Some("application/json; charset=utf-8"), 1024);
        assert_eq!(
            body,
            Some(CapturedBody::Json {
                value: json!({"name": "ada"})
            })
        );
    }

    #[test]
    fn test_classify_invalid_json_falls_back_to_text() {
        let body = classify_body(b"{not json", Some("application/json"), 1024).unwrap();
        assert!(matches!(body, CapturedBody::Text { ref text, truncated: false, .. } if text == "{not json"));
    }

    #[test]
    fn test_classify_form() {
        let body = classify_body(
            b"user=ada&password=hunter2",
            Some("application/x-www-form-urlencoded"),
            1024,
        );
        assert_eq!(
            body,
            Some(CapturedBody::Json {
                value: json!({"user": "ada", "password": "hunter2"})
            })
        );
    }

    #[test]
    fn test_classify_binary_and_multipart_omitted() {
        let png = classify_body(&[0x89, 0x50, 0x4e, 0x47], Some("image/png"), 1024).unwrap();
        assert!(matches!(png, CapturedBody::Omitted { size: 4, .. }));

        let multipart = classify_body(b"--x\r\n", Some("multipart/form-data; boundary=x"), 1024).unwrap();
        assert!(matches!(multipart, CapturedBody::Omitted { .. }));

        let unknown_binary = classify_body(&[0xff, 0xfe, 0x00], None, 1024).unwrap();
        assert!(matches!(unknown_binary, CapturedBody::Omitted { content_type: None, .. }));
    }

    #[test]
    fn test_classify_empty_records_nothing() {
        assert_eq!(classify_body(b"", Some("application/json"), 1024), None);
    }

    #[test]
    fn test_oversized_json_truncated_as_text() {
        let big = format!(r#"{{"data":"{}"}}"#, "x".repeat(100));
        let body = classify_body(big.as_bytes(), Some("application/json"), 16).unwrap();
        match body {
            CapturedBody::Text { text, truncated, size } => {
                assert_eq!(text.len(), 16);
                assert!(truncated);
                assert_eq!(size, big.len());
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        // "é" is two bytes; a 3-byte cut lands inside the second one
        let body = text_body("éé".as_bytes(), 3).unwrap();
        match body {
            CapturedBody::Text { text, truncated, .. } => {
                assert_eq!(text, "é");
                assert!(truncated);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_header_map_joins_repeated_values() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        headers.insert("x-raw", HeaderValue::from_bytes(&[0xfa]).unwrap());

        let map = header_map(&headers);
        assert_eq!(map["accept"], "text/html, application/json");
        assert_eq!(map["x-raw"], "<binary>");
    }

    fn chunked(chunks: Vec<Result<&'static str, std::io::Error>>) -> Body {
        Body::from_stream(stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_buffer_body_stops_past_limit_and_replays_everything() {
        let body = chunked(vec![Ok("aaaa"), Ok("bbbb"), Ok("cccc"), Ok("dddd")]);

        match buffer_body(body, 6).await {
            BufferedBody::OverLimit { seen, body } => {
                assert_eq!(&seen[..], b"aaaabbbb");
                let all = axum::body::to_bytes(body, usize::MAX).await.unwrap();
                assert_eq!(&all[..], b"aaaabbbbccccdddd");
            }
            _ => panic!("expected the limit to be hit"),
        }
    }

    #[tokio::test]
    async fn test_buffer_body_replays_stream_error() {
        let body = chunked(vec![
            Ok("abc"),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer went away")),
        ]);

        match buffer_body(body, 1024).await {
            BufferedBody::Failed { error, body } => {
                assert!(error.contains("peer went away"));
                assert!(axum::body::to_bytes(body, usize::MAX).await.is_err());
            }
            _ => panic!("expected the read to fail"),
        }
    }

    #[tokio::test]
    async fn test_capture_body_uses_content_length_for_cut_bodies() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        let body = chunked(vec![Ok("hello "), Ok("world!")]);

        let (captured, _) = capture_body(body, &headers, 4).await;
        assert_eq!(
            captured,
            Some(CapturedBody::Text {
                text: "hell".to_string(),
                truncated: true,
                size: 12
            })
        );
    }

    #[test]
    fn test_event_streams_not_buffered() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        assert!(!is_capturable_response(&headers));

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(is_capturable_response(&headers));

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        assert!(!is_capturable_response(&headers));
    }
}
