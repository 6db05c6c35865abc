//! Response Assembly
//!
//! Every response is a header block built in one buffer plus a body held as
//! [`Bytes`]. The body is never copied into the header buffer: the connection
//! writes both with a single vectored write.
//!
//! ```text
//! ┌────────────────────────────────────────────┐   ┌──────────────────┐
//! │ HTTP/1.1 200 OK\r\n                        │   │ {"major":0,...}  │
//! │ Date: ...\r\n Server: ...\r\n ...\r\n\r\n  │   │  (shared Bytes)  │
//! └────────────────────────────────────────────┘   └──────────────────┘
//!            header buffer (BytesMut)                    body
//! ```

use super::request::Version;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::fmt;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Longest argument echoed back in an error message.
const MAX_ERROR_ARG: usize = 80;

/// Status codes this server produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    RequestTimeout,
    InternalError,
    NotImplemented,
    ServiceUnavailable,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::RequestTimeout => 408,
            StatusCode::InternalError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::ServiceUnavailable => 503,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::InternalError => "Internal Error",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::ServiceUnavailable => "Service Temporarily Overloaded",
        }
    }

    /// Human-readable explanation. `arg` is the URL or method involved.
    pub fn describe(&self, arg: &str) -> String {
        match self {
            StatusCode::Ok => String::new(),
            StatusCode::BadRequest => {
                "Your request has bad syntax or is inherently impossible to satisfy.".to_string()
            }
            StatusCode::Forbidden => {
                format!("You do not have permission to get URL '{arg}' from this server.")
            }
            StatusCode::NotFound => {
                format!("The requested URL '{arg}' was not found on this server.")
            }
            StatusCode::RequestTimeout => {
                "No request appeared within a reasonable time period.".to_string()
            }
            StatusCode::InternalError => {
                format!("There was an unusual problem serving the requested URL '{arg}'.")
            }
            StatusCode::NotImplemented => {
                format!("The requested method '{arg}' is not implemented by this server.")
            }
            StatusCode::ServiceUnavailable => format!(
                "The requested URL '{arg}' is temporarily overloaded. Please try again later."
            ),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Ok)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.title())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// A response ready to be framed onto a connection.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl Response {
    /// A 200 response carrying a JSON document.
    pub fn json(body: Bytes) -> Self {
        Self {
            status: StatusCode::Ok,
            content_type: JSON_CONTENT_TYPE,
            body,
        }
    }

    /// An error response with a JSON body of the form
    /// `{"path", "content", "title", "status"}`. Falls back to a plain text
    /// body if the document cannot be serialized.
    pub fn error(status: StatusCode, path: &str, arg: &str) -> Self {
        let doc = serde_json::json!({
            "path": truncate(path, MAX_ERROR_ARG),
            "content": status.describe(truncate(arg, MAX_ERROR_ARG)),
            "title": status.title(),
            "status": status.code(),
        });

        match serde_json::to_vec(&doc) {
            Ok(body) => Self {
                status,
                content_type: JSON_CONTENT_TYPE,
                body: Bytes::from(body),
            },
            Err(_) => Self::plain_error(status),
        }
    }

    /// The plain text form of an error response.
    pub fn plain_error(status: StatusCode) -> Self {
        Self {
            status,
            content_type: TEXT_CONTENT_TYPE,
            body: Bytes::from(format!("{status}\n")),
        }
    }

    /// Appends the header block to `buf`. HTTP/0.9 responses have no headers.
    pub fn write_head(&self, version: Version, now: DateTime<Utc>, buf: &mut BytesMut) {
        let protocol = match version {
            Version::Http09 => return,
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        };

        let head = format!(
            "{protocol} {status}\r\n\
             Date: {date}\r\n\
             Server: sysmon/{server}\r\n\
             Content-Type: {ctype}\r\n\
             Content-Length: {len}\r\n\
             Cache-Control: no-cache, no-store\r\n\
             Connection: close\r\n\
             \r\n",
            status = self.status,
            date = now.format("%a, %d %b %Y %H:%M:%S GMT"),
            server = crate::VERSION,
            ctype = self.content_type,
            len = self.body.len(),
        );

        buf.reserve(head.len());
        buf.put_slice(head.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 3, 19, 7, 49, 28).unwrap()
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(StatusCode::Ok.code(), 200);
        assert_eq!(StatusCode::RequestTimeout.code(), 408);
        assert_eq!(StatusCode::NotImplemented.to_string(), "501 Not Implemented");
    }

    #[test]
    fn test_head_block() {
        let resp = Response::json(Bytes::from_static(b"{\"a\":1}"));
        let mut buf = BytesMut::new();
        resp.write_head(Version::Http10, fixed_time(), &mut buf);
        let text = std::str::from_utf8(&buf).unwrap();

        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Date: Sun, 19 Mar 2017 07:49:28 GMT\r\n"));
        assert!(text.contains(&format!("Server: sysmon/{}\r\n", crate::VERSION)));
        assert!(text.contains("Content-Type: application/json; charset=utf-8\r\n"));
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.contains("Cache-Control: no-cache, no-store\r\n"));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn test_http09_has_no_head() {
        let resp = Response::json(Bytes::from_static(b"{}"));
        let mut buf = BytesMut::new();
        resp.write_head(Version::Http09, fixed_time(), &mut buf);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_error_body_shape() {
        let resp = Response::error(StatusCode::NotFound, "/nope", "/nope");
        let doc: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();

        assert_eq!(resp.status, StatusCode::NotFound);
        assert_eq!(doc["status"], 404);
        assert_eq!(doc["title"], "Not Found");
        assert_eq!(doc["path"], "/nope");
        assert!(doc["content"].as_str().unwrap().contains("/nope"));
    }

    #[test]
    fn test_error_arg_truncated() {
        let long = "x".repeat(500);
        let resp = Response::error(StatusCode::Forbidden, &long, &long);
        let doc: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(doc["path"].as_str().unwrap().len(), MAX_ERROR_ARG);
    }

    #[test]
    fn test_plain_error() {
        let resp = Response::plain_error(StatusCode::BadRequest);
        assert_eq!(resp.content_type, TEXT_CONTENT_TYPE);
        assert_eq!(&resp.body[..], b"400 Bad Request\n");
    }
}
