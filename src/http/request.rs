//! Request Line and Header Parsing
//!
//! Runs once [`RequestScanner`](super::framing::RequestScanner) reports a
//! complete request. Produces a [`Request`] or a [`RequestError`] carrying the
//! status code to answer with.
//!
//! ## Steps
//!
//! 1. Split the request line into method, URL and optional protocol.
//! 2. Strip and validate an absolute `http://host` prefix.
//! 3. Check the method.
//! 4. Split off the query, percent-decode and canonicalize the path.
//! 5. Scan headers for `Host:` when the URL carried no host.

use super::framing::LineReader;
use super::response::StatusCode;
use super::url::{canonicalize_path, has_hidden_component, percent_decode};
use std::fmt;
use thiserror::Error;

/// Supported request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
}

impl Method {
    /// Case-insensitive match against the supported methods.
    pub fn parse(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("GET") {
            Some(Method::Get)
        } else if token.eq_ignore_ascii_case("HEAD") {
            Some(Method::Head)
        } else if token.eq_ignore_ascii_case("POST") {
            Some(Method::Post)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version spoken by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    /// No protocol token: body only, no headers.
    Http09,
    Http10,
    /// Anything other than `HTTP/1.0` is treated as 1.1.
    Http11,
}

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub version: Version,
    /// The URL as sent, minus any `http://host` prefix.
    pub encoded_url: String,
    /// Canonical root-relative path, e.g. `cpu` or `a/c`.
    pub path: String,
    pub query: Option<String>,
    /// Host from the request line or, failing that, the `Host:` header.
    pub host: Option<String>,
}

/// A request that cannot be served.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{status}: {detail}")]
pub struct RequestError {
    pub status: StatusCode,
    /// Server-side explanation for the log.
    pub detail: String,
    /// URL to echo in the error body, if one was parsed.
    pub url: String,
    /// Argument for the error message: the URL, or the method for 501.
    pub arg: String,
    /// Protocol version, once the request line got far enough to tell.
    pub version: Option<Version>,
}

impl RequestError {
    fn new(status: StatusCode, detail: impl Into<String>, url: &str) -> Self {
        Self {
            status,
            detail: detail.into(),
            url: url.to_string(),
            arg: url.to_string(),
            version: None,
        }
    }

    fn bad_request(detail: impl Into<String>, url: &str) -> Self {
        Self::new(StatusCode::BadRequest, detail, url)
    }
}

/// Result type for request parsing.
pub type RequestResult<T> = Result<T, RequestError>;

fn is_ws(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Splits off the next whitespace-delimited token.
fn next_token(s: &[u8]) -> (&[u8], &[u8]) {
    let end = s.iter().position(|&b| is_ws(b)).unwrap_or(s.len());
    let rest = &s[end..];
    let skip = rest.iter().position(|&b| !is_ws(b)).unwrap_or(rest.len());
    (&s[..end], &rest[skip..])
}

/// A host is usable if it is non-empty, has no `/` and does not start with `.`.
fn valid_host(host: &str) -> bool {
    !host.is_empty() && !host.starts_with('.') && !host.contains('/')
}

/// Parses the buffered request head.
pub fn parse_request(buf: &[u8]) -> RequestResult<Request> {
    let mut lines = LineReader::new(buf);
    let line = lines
        .next_line()
        .ok_or_else(|| RequestError::bad_request("no request line", ""))?;

    let (method_tok, rest) = next_token(line);
    if rest.is_empty() {
        return Err(RequestError::bad_request("missing URL", ""));
    }
    let (url_tok, rest) = next_token(rest);
    let (proto_tok, _) = next_token(rest);

    let version = if proto_tok.is_empty() {
        Version::Http09
    } else if proto_tok.eq_ignore_ascii_case(b"HTTP/1.0") {
        Version::Http10
    } else {
        Version::Http11
    };

    parse_target(method_tok, url_tok, version, lines).map_err(|mut e| {
        e.version = Some(version);
        e
    })
}

/// Everything after the request line has been split: URL, method and Host.
fn parse_target(
    method_tok: &[u8],
    url_tok: &[u8],
    version: Version,
    mut lines: LineReader<'_>,
) -> RequestResult<Request> {
    let method_str = String::from_utf8_lossy(method_tok);
    let mut url = String::from_utf8_lossy(url_tok).into_owned();

    // Absolute URL: http://host/path
    let mut host = None;
    if url.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("http://")) {
        if version != Version::Http11 {
            return Err(RequestError::bad_request(
                "absolute URL requires HTTP/1.1",
                &url,
            ));
        }
        let after = &url[7..];
        let Some(slash) = after.find('/') else {
            return Err(RequestError::bad_request("absolute URL has no path", &url));
        };
        let req_host = &after[..slash];
        if !valid_host(req_host) {
            return Err(RequestError::bad_request("invalid request-line host", &url));
        }
        host = Some(req_host.to_string());
        url = after[slash..].to_string();
    }

    if !url.starts_with('/') {
        return Err(RequestError::bad_request("URL is not absolute", &url));
    }

    let Some(method) = Method::parse(&method_str) else {
        let mut err = RequestError::new(
            StatusCode::NotImplemented,
            format!("unsupported method {method_str}"),
            &url,
        );
        err.arg = method_str.into_owned();
        return Err(err);
    };

    let (raw_path, query) = match url.split_once('?') {
        Some((p, q)) => (p, Some(q.to_string())),
        None => (url.as_str(), None),
    };
    let decoded = percent_decode(raw_path);
    let path = canonicalize_path(&decoded)
        .map_err(|e| RequestError::bad_request(e.to_string(), &url))?;

    if version != Version::Http09 && host.is_none() {
        while let Some(header) = lines.next_line() {
            if header.is_empty() {
                break;
            }
            if header.len() >= 5 && header[..5].eq_ignore_ascii_case(b"Host:") {
                let value = String::from_utf8_lossy(&header[5..]);
                let value = value.trim_matches(|c| c == ' ' || c == '\t');
                let name = value.split(':').next().unwrap_or_default();
                if !valid_host(name) {
                    return Err(RequestError::bad_request("invalid Host header", &url));
                }
                host = Some(name.to_string());
                break;
            }
        }
    }

    if version == Version::Http11 && host.is_none() {
        return Err(RequestError::bad_request("HTTP/1.1 request without host", &url));
    }

    if has_hidden_component(&path) {
        return Err(RequestError::new(
            StatusCode::Forbidden,
            format!("hidden path component in {path}"),
            &url,
        ));
    }

    Ok(Request {
        method,
        version,
        encoded_url: url,
        path,
        query,
        host,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(req: &[u8]) -> StatusCode {
        parse_request(req).unwrap_err().status
    }

    #[test]
    fn test_parse_simple_get() {
        let req = parse_request(b"GET /smver HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.version, Version::Http10);
        assert_eq!(req.path, "smver");
        assert_eq!(req.encoded_url, "/smver");
        assert_eq!(req.query, None);
        assert_eq!(req.host, None);
    }

    #[test]
    fn test_method_case_insensitive() {
        assert_eq!(parse_request(b"head /cpu HTTP/1.0\r\n\r\n").unwrap().method, Method::Head);
        assert_eq!(parse_request(b"Post /cpu HTTP/1.0\r\n\r\n").unwrap().method, Method::Post);
    }

    #[test]
    fn test_http09() {
        let req = parse_request(b"GET /uname\r\n").unwrap();
        assert_eq!(req.version, Version::Http09);
        assert_eq!(req.path, "uname");
    }

    #[test]
    fn test_unsupported_method() {
        let err = parse_request(b"PUT /cpu HTTP/1.0\r\n\r\n").unwrap_err();
        assert_eq!(err.status, StatusCode::NotImplemented);
        assert_eq!(err.arg, "PUT");
    }

    #[test]
    fn test_query_split_before_decode() {
        let req = parse_request(b"GET /a%3Fb?x=%41 HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(req.path, "a?b");
        assert_eq!(req.query.as_deref(), Some("x=%41"));
    }

    #[test]
    fn test_path_canonicalized() {
        let req = parse_request(b"GET /a/b/../c HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(req.path, "a/c");
        let req = parse_request(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(req.path, ".");
    }

    #[test]
    fn test_traversal_rejected() {
        assert_eq!(status_of(b"GET /../etc HTTP/1.0\r\n\r\n"), StatusCode::BadRequest);
        assert_eq!(status_of(b"GET /%2e%2e/x HTTP/1.0\r\n\r\n"), StatusCode::BadRequest);
        assert_eq!(status_of(b"GET //x HTTP/1.0\r\n\r\n"), StatusCode::BadRequest);
    }

    #[test]
    fn test_hidden_component_forbidden() {
        assert_eq!(status_of(b"GET /.secret HTTP/1.0\r\n\r\n"), StatusCode::Forbidden);
    }

    #[test]
    fn test_relative_url_rejected() {
        assert_eq!(status_of(b"GET cpu HTTP/1.0\r\n\r\n"), StatusCode::BadRequest);
    }

    #[test]
    fn test_http11_requires_host() {
        assert_eq!(status_of(b"GET /cpu HTTP/1.1\r\n\r\n"), StatusCode::BadRequest);

        let req = parse_request(b"GET /cpu HTTP/1.1\r\nAccept: */*\r\nhost: example.com:7070\r\n\r\n")
            .unwrap();
        assert_eq!(req.host.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_bad_host_header() {
        assert_eq!(
            status_of(b"GET /cpu HTTP/1.1\r\nHost: .evil\r\n\r\n"),
            StatusCode::BadRequest
        );
    }

    #[test]
    fn test_absolute_url() {
        let req = parse_request(b"GET http://example.com/smver HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.host.as_deref(), Some("example.com"));
        assert_eq!(req.path, "smver");
        assert_eq!(req.encoded_url, "/smver");
    }

    #[test]
    fn test_absolute_url_rules() {
        // Only allowed on 1.1.
        assert_eq!(
            status_of(b"GET http://example.com/x HTTP/1.0\r\n\r\n"),
            StatusCode::BadRequest
        );
        assert_eq!(status_of(b"GET http://.x/y HTTP/1.1\r\n\r\n"), StatusCode::BadRequest);
        assert_eq!(status_of(b"GET http:///y HTTP/1.1\r\n\r\n"), StatusCode::BadRequest);
        assert_eq!(status_of(b"GET http://host HTTP/1.1\r\n\r\n"), StatusCode::BadRequest);
    }

    #[test]
    fn test_missing_url() {
        assert_eq!(status_of(b"GET\r\n\r\n"), StatusCode::BadRequest);
    }

    #[test]
    fn test_error_carries_version() {
        let err = parse_request(b"GET /cpu HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err.version, Some(Version::Http11));

        let err = parse_request(b"PUT /cpu HTTP/1.0\r\n\r\n").unwrap_err();
        assert_eq!(err.version, Some(Version::Http10));

        let err = parse_request(b"GET /../x\r\n").unwrap_err();
        assert_eq!(err.version, Some(Version::Http09));

        // Nothing past the method: the version is unknown.
        assert_eq!(parse_request(b"GET\r\n\r\n").unwrap_err().version, None);
    }

    #[test]
    fn test_unknown_protocol_is_http11() {
        let req = parse_request(b"GET /cpu HTTP/2.0\r\nHost: h\r\n\r\n").unwrap();
        assert_eq!(req.version, Version::Http11);
    }
}
