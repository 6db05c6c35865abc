//! HTTP Framing, Parsing and Response Assembly
//!
//! This module covers the wire protocol: HTTP/0.9, 1.0 and 1.1 requests, one
//! request per connection, answered with a JSON body and `Connection: close`.
//!
//! ## Modules
//!
//! - `framing`: detects when a complete request head has been buffered
//! - `request`: parses the request line and the `Host:` header
//! - `url`: percent-decoding and path canonicalization
//! - `response`: status codes, header block and error bodies
//!
//! ## Example
//!
//! ```ignore
//! use sysmon::http::{parse_request, Framing, RequestScanner};
//!
//! let buf = b"GET /cpu HTTP/1.0\r\n\r\n";
//! let mut scanner = RequestScanner::new();
//! if scanner.scan(buf) == Framing::GotRequest {
//!     let request = parse_request(&buf[..scanner.checked()])?;
//!     assert_eq!(request.path, "cpu");
//! }
//! ```

pub mod framing;
pub mod request;
pub mod response;
pub mod url;

// Re-export commonly used types for convenience
pub use framing::{Framing, LineReader, RequestScanner};
pub use request::{parse_request, Method, Request, RequestError, RequestResult, Version};
pub use response::{Response, StatusCode};
pub use url::{canonicalize_path, canonicalize_relative, percent_decode, PathError};
