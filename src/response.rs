use crate::Version;
use bytes::Bytes;
use futures_util::stream::Stream;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const FOUND: StatusCode = StatusCode(302);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);

    pub fn custom(code: u16) -> Self {
        StatusCode(code)
    }

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn reason(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            302 => "Found",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            413 => "Payload Too Large",
            500 => "Internal Server Error",
            _ => "Unknown",
        }
    }

    pub fn as_str(&self) -> String {
        format!("{} {}", self.0, self.reason())
    }
}

pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// The response body is a closed two-case variant: a fully buffered byte
/// sequence, or a restartable-once stream of chunks. Never both.
pub enum ResponseBody {
    Buffered(Bytes),
    Stream(BodyStream),
}

impl ResponseBody {
    pub fn len(&self) -> Option<usize> {
        match self {
            ResponseBody::Buffered(data) => Some(data.len()),
            ResponseBody::Stream(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ResponseBody::Buffered(data) => data.is_empty(),
            ResponseBody::Stream(_) => false,
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Buffered(data) => write!(f, "Buffered({} bytes)", data.len()),
            ResponseBody::Stream(_) => write!(f, "Stream"),
        }
    }
}

/// An immutable response value. Handlers and middleware build these with the
/// factory functions below; `copy_with`/`with_headers` produce a modified
/// copy rather than mutating in place. The body is buffered xor streamed,
/// never both.
#[derive(Debug)]
pub struct Response {
    pub version: Version,
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub body: ResponseBody,
}

impl Response {
    fn bare(status: StatusCode, body: ResponseBody) -> Self {
        Self {
            version: Version::Http11,
            status,
            headers: HashMap::new(),
            body,
        }
    }

    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let mut response = Self::bare(status, ResponseBody::Buffered(body));
        response
            .headers
            .insert("content-length".into(), response.body.len().unwrap_or(0).to_string());
        response
    }

    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        Self::new(status, text.into().into_bytes())
            .with_header("content-type", "text/plain; charset=utf-8")
    }

    pub fn html(status: StatusCode, markup: impl Into<String>) -> Self {
        Self::new(status, markup.into().into_bytes())
            .with_header("content-type", "text/html; charset=utf-8")
    }

    pub fn json(status: StatusCode, value: &impl serde::Serialize) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(status, body)
                .with_header("content-type", "application/json; charset=utf-8"),
            Err(err) => Self::internal_server_error(&err.to_string()),
        }
    }

    pub fn bytes(status: StatusCode, data: impl Into<Bytes>) -> Self {
        Self::new(status, data).with_header("content-type", "application/octet-stream")
    }

    pub fn redirect(location: &str) -> Self {
        Self::new(StatusCode::FOUND, Vec::new()).with_header("location", location)
    }

    pub fn empty() -> Self {
        Self::new(StatusCode::NO_CONTENT, Vec::new())
    }

    pub fn stream<S>(status: StatusCode, chunks: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let mut response = Self::bare(status, ResponseBody::Stream(Box::pin(chunks)));
        response
            .headers
            .insert("transfer-encoding".into(), "chunked".into());
        response
    }

    fn error_json(status: StatusCode, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "error": message }))
    }

    pub fn not_found(message: &str) -> Self {
        Self::error_json(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::error_json(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: &str) -> Self {
        Self::error_json(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: &str) -> Self {
        Self::error_json(StatusCode::FORBIDDEN, message)
    }

    pub fn internal_server_error(message: &str) -> Self {
        Self::error_json(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    /// Merge a batch of headers; entries here override any existing ones
    /// with the same (lower-cased) key.
    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        for (k, v) in headers {
            self.headers.insert(k.to_lowercase(), v);
        }
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.body, ResponseBody::Stream(_))
    }

    /// Serialize the status line and headers. The body is appended by the
    /// caller for the buffered case, or streamed chunk-by-chunk for the
    /// stream case — see `write_to`.
    fn head_bytes(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {}\r\n", self.status.as_str());
        for (k, v) in &self.headers {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// Buffered-body convenience used by tests and by the single-shot trap
    /// path (error responses, etc). Panics if called on a streaming body;
    /// callers should check `is_streaming` first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.head_bytes();
        if let ResponseBody::Buffered(body) = &self.body {
            bytes.extend_from_slice(body);
        }
        bytes
    }

    /// Write this response to an async sink, chunk-encoding the stream case.
    pub async fn write_to<W>(self, writer: &mut W) -> io::Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        use futures_util::StreamExt;
        use tokio::io::AsyncWriteExt;

        writer.write_all(&self.head_bytes()).await?;

        match self.body {
            ResponseBody::Buffered(data) => {
                writer.write_all(&data).await?;
            }
            ResponseBody::Stream(mut stream) => {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    writer
                        .write_all(format!("{:X}\r\n", chunk.len()).as_bytes())
                        .await?;
                    writer.write_all(&chunk).await?;
                    writer.write_all(b"\r\n").await?;
                }
                writer.write_all(b"0\r\n\r\n").await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Payload {
        id: u32,
        name: String,
    }

    #[test]
    fn json_round_trips_through_decode() {
        let payload = Payload { id: 42, name: "ok".to_string() };
        let response = Response::json(StatusCode::OK, &payload);

        let ResponseBody::Buffered(body) = &response.body else {
            panic!("json() always produces a buffered body");
        };
        let decoded: Payload = serde_json::from_slice(body).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(response.headers.get("content-type").unwrap(), "application/json; charset=utf-8");
    }

    #[test]
    fn with_header_is_case_insensitive_and_last_write_wins() {
        let response = Response::text(StatusCode::OK, "hi")
            .with_header("X-Custom", "one")
            .with_header("x-custom", "two");
        assert_eq!(response.headers.get("x-custom").unwrap(), "two");
        assert_eq!(response.headers.len(), 2); // content-type + x-custom
    }

    #[test]
    fn with_headers_merges_overriding_existing_keys() {
        let response = Response::text(StatusCode::OK, "hi").with_headers(vec![
            ("content-type".to_string(), "text/csv".to_string()),
            ("x-extra".to_string(), "1".to_string()),
        ]);
        assert_eq!(response.headers.get("content-type").unwrap(), "text/csv");
        assert_eq!(response.headers.get("x-extra").unwrap(), "1");
    }

    #[test]
    fn with_status_replaces_status_only() {
        let response = Response::text(StatusCode::OK, "hi").with_status(StatusCode::CREATED);
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.headers.get("content-type").unwrap(), "text/plain; charset=utf-8");
    }

    #[test]
    fn empty_defaults_to_204() {
        let response = Response::empty();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert!(response.body.is_empty());
    }

    #[test]
    fn error_factories_use_canonical_status_and_shape() {
        let response = Response::not_found("missing");
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        let ResponseBody::Buffered(body) = &response.body else {
            panic!("expected buffered body");
        };
        let value: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(value["error"], "missing");
    }

    #[test]
    fn streaming_body_reports_no_length_and_is_not_empty() {
        use futures_util::stream;
        let response = Response::stream(StatusCode::OK, stream::iter(vec![Ok(Bytes::from_static(b"chunk"))]));
        assert!(response.is_streaming());
        assert_eq!(response.body.len(), None);
        assert!(!response.body.is_empty());
    }

    #[tokio::test]
    async fn write_to_emits_status_line_and_headers_then_buffered_body() {
        let response = Response::text(StatusCode::OK, "hi");
        let mut buf = Vec::new();
        response.write_to(&mut buf).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("hi"));
    }
}
