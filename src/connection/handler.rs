//! Connection Handler Module
//!
//! One [`Connection`] per accepted socket. It owns the socket, the request
//! buffer and the response being sent, and knows how to make progress on
//! each of them without ever blocking. Deciding *when* to call it is the
//! event loop's job.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. accept()                       state: Reading, read interest
//!        │
//!        ▼
//! 2. read_request()  ──partial──►   (wait for more bytes)
//!        │
//!        │ complete head
//!        ▼
//! 3. prepare_response()             state: Sending, write interest
//!        │
//!        ▼
//! 4. write_pending() ──blocked──►   state: Pausing, no interest, wakeup timer
//!        │
//!        │ all bytes sent
//!        ▼
//! 5. close, or linger:              state: Lingering, read interest,
//!    shutdown(Write) + drain()             linger timer
//! ```
//!
//! ## Buffer Management
//!
//! The read buffer starts small, doubles whenever it fills and never
//! shrinks, so a slot that once handled a large request keeps its capacity
//! for the next one. The header block is compacted to the front after a
//! partial write; the body is a shared [`Bytes`] indexed by `next_byte`.

use super::ConnState;
use crate::http::{
    parse_request, Framing, Request, RequestError, RequestScanner, Response, StatusCode, Version,
};
use crate::timer::TimerHandle;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Initial read buffer capacity.
pub const INITIAL_BUFFER_SIZE: usize = 600;

/// A request head larger than this is answered with 400.
pub const MAX_REQUEST_SIZE: usize = 5000;

/// Most bytes handed to a single write call.
pub const MAX_WRITE_CHUNK: usize = 100_000;

/// Scratch space used while draining a lingering connection.
const DRAIN_CHUNK: usize = 4096;

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Peer closed before a full request arrived
    #[error("Peer closed the connection")]
    PeerClosed,

    /// Request head exceeded the size limit
    #[error("Request exceeds {MAX_REQUEST_SIZE} bytes")]
    RequestTooLarge,

    /// Request framing is malformed
    #[error("Malformed request line")]
    BadFraming,
}

/// Result of a read attempt while in the Reading state.
#[derive(Debug)]
pub enum ReadEvent {
    /// No complete request yet.
    Incomplete,
    /// A request was framed and parsed.
    Request(Request),
    /// A request was framed but cannot be served.
    Invalid(RequestError),
}

/// Result of a write attempt while in the Sending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// Everything has been sent.
    Done,
    /// Some bytes went out; more remain.
    Partial,
    /// The socket would block.
    Blocked,
    /// Interrupted before anything was sent; try again on the next event.
    Interrupted,
}

/// Write backoff for a connection whose socket keeps blocking.
///
/// Each blocked write adds one increment to the delay; each successful
/// write takes one increment away, never dropping below one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    delay: Duration,
    increment: Duration,
}

impl Backoff {
    pub fn new(increment: Duration) -> Self {
        Self {
            delay: Duration::ZERO,
            increment,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Records a blocked write and returns the delay before retrying.
    pub fn on_would_block(&mut self) -> Duration {
        self.delay += self.increment;
        self.delay
    }

    /// Records a successful write.
    pub fn on_progress(&mut self) {
        if self.delay > self.increment {
            self.delay -= self.increment;
        }
    }

    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }
}

/// Buffers kept by a pool slot between connections.
#[derive(Debug, Default)]
pub struct Buffers {
    read_buf: BytesMut,
    head: BytesMut,
}

impl Buffers {
    pub fn new() -> Self {
        Self {
            read_buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            head: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
        }
    }

    /// Clears contents while keeping capacity.
    fn recycle(mut self) -> Self {
        self.read_buf.clear();
        self.head.clear();
        self
    }
}

/// A client connection.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    pub state: ConnState,

    read_buf: BytesMut,
    scanner: RequestScanner,

    /// Request line facts kept for logging.
    method: Option<&'static str>,
    url: String,

    head: BytesMut,
    body: Bytes,
    next_byte: usize,
    end_byte: usize,
    status: Option<StatusCode>,
    should_linger: bool,

    pub started_at: Instant,
    pub active_at: Instant,
    pub wakeup: Option<TimerHandle>,
    pub linger: Option<TimerHandle>,
    pub backoff: Backoff,

    bytes_read: u64,
    bytes_sent: u64,
}

impl Connection {
    /// Wraps an accepted, already non-blocking socket.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        now: Instant,
        backoff_increment: Duration,
        buffers: Buffers,
    ) -> Self {
        let buffers = buffers.recycle();
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            read_buf: buffers.read_buf,
            scanner: RequestScanner::new(),
            method: None,
            url: String::new(),
            head: buffers.head,
            body: Bytes::new(),
            next_byte: 0,
            end_byte: 0,
            status: None,
            should_linger: false,
            started_at: now,
            active_at: now,
            wakeup: None,
            linger: None,
            backoff: Backoff::new(backoff_increment),
            bytes_read: 0,
            bytes_sent: 0,
        }
    }

    /// Gives back the buffers for reuse by the next connection in this slot.
    pub fn into_buffers(self) -> Buffers {
        Buffers {
            read_buf: self.read_buf,
            head: self.head,
        }
        .recycle()
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> Option<&'static str> {
        self.method
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Capacity of the read buffer.
    pub fn read_capacity(&self) -> usize {
        self.read_buf.capacity()
    }

    pub fn should_linger(&self) -> bool {
        self.should_linger
    }

    /// Bytes of the response still to be written.
    pub fn pending(&self) -> usize {
        self.head.len() + self.end_byte.saturating_sub(self.next_byte)
    }

    /// Reads what is available and checks whether a full request arrived.
    pub fn read_request(&mut self, now: Instant) -> Result<ReadEvent, ConnectionError> {
        if self.read_buf.len() > MAX_REQUEST_SIZE {
            return Err(ConnectionError::RequestTooLarge);
        }
        if self.read_buf.len() == self.read_buf.capacity() {
            // Double until sufficient; BytesMut never shrinks on clear.
            let grow = self.read_buf.capacity().max(INITIAL_BUFFER_SIZE);
            self.read_buf.reserve(grow);
        }

        let start = self.read_buf.len();
        let cap = self.read_buf.capacity();
        self.read_buf.resize(cap, 0);
        let result = self.stream.read(&mut self.read_buf[start..]);
        let n = match result {
            Ok(n) => n,
            Err(e) => {
                self.read_buf.truncate(start);
                return match e.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
                        Ok(ReadEvent::Incomplete)
                    }
                    _ => Err(ConnectionError::IoError(e)),
                };
            }
        };
        self.read_buf.truncate(start + n);

        if n == 0 {
            return Err(ConnectionError::PeerClosed);
        }
        self.bytes_read += n as u64;
        self.active_at = now;
        trace!(peer = %self.peer, bytes = n, buffered = self.read_buf.len(), "read");

        match self.scanner.scan(&self.read_buf) {
            Framing::NoRequest => {
                if self.read_buf.len() > MAX_REQUEST_SIZE {
                    return Err(ConnectionError::RequestTooLarge);
                }
                Ok(ReadEvent::Incomplete)
            }
            Framing::BadRequest => Err(ConnectionError::BadFraming),
            Framing::GotRequest => {
                let head_len = self.scanner.checked();
                let trailing = self.read_buf[head_len..]
                    .iter()
                    .any(|b| !b.is_ascii_whitespace());
                self.should_linger = trailing;

                match parse_request(&self.read_buf[..head_len]) {
                    Ok(request) => {
                        self.method = Some(request.method.as_str());
                        self.url = request.encoded_url.clone();
                        if request.method == crate::http::Method::Post {
                            self.should_linger = true;
                        }
                        Ok(ReadEvent::Request(request))
                    }
                    Err(e) => {
                        self.url = e.url.clone();
                        Ok(ReadEvent::Invalid(e))
                    }
                }
            }
        }
    }

    /// Frames `response` for sending. With `head_only` the body is not sent
    /// (HEAD requests); Content-Length still describes it.
    pub fn prepare_response(&mut self, response: &Response, version: Version, head_only: bool) {
        self.head.clear();
        response.write_head(version, Utc::now(), &mut self.head);
        self.body = response.body.clone();
        self.next_byte = 0;
        self.end_byte = if head_only { 0 } else { self.body.len() };
        self.status = Some(response.status);
        self.backoff.reset();
    }

    /// Writes the next chunk of the pending response.
    pub fn write_pending(&mut self, now: Instant) -> Result<WriteProgress, ConnectionError> {
        if self.head.is_empty() && self.next_byte >= self.end_byte {
            return Ok(WriteProgress::Done);
        }

        let chunk_end = self.end_byte.min(self.next_byte + MAX_WRITE_CHUNK);
        let body = &self.body[self.next_byte..chunk_end];

        let result = if self.head.is_empty() {
            self.stream.write(body)
        } else {
            self.stream
                .write_vectored(&[IoSlice::new(&self.head), IoSlice::new(body)])
        };

        let mut n = match result {
            Ok(0) => return Ok(WriteProgress::Blocked),
            Ok(n) => n,
            Err(e) => {
                return match e.kind() {
                    io::ErrorKind::WouldBlock => Ok(WriteProgress::Blocked),
                    io::ErrorKind::Interrupted => Ok(WriteProgress::Interrupted),
                    _ => Err(ConnectionError::IoError(e)),
                }
            }
        };

        self.active_at = now;
        self.bytes_sent += n as u64;

        if !self.head.is_empty() {
            let head_len = self.head.len();
            if n < head_len {
                self.head.copy_within(n.., 0);
                self.head.truncate(head_len - n);
                n = 0;
            } else {
                n -= head_len;
                self.head.clear();
            }
        }
        self.next_byte += n;

        if self.head.is_empty() && self.next_byte >= self.end_byte {
            return Ok(WriteProgress::Done);
        }
        self.backoff.on_progress();
        Ok(WriteProgress::Partial)
    }

    /// One non-blocking attempt to push out whatever is pending, used right
    /// before closing. Errors are ignored.
    pub fn flush_best_effort(&mut self) {
        if let Err(e) = self.write_pending(Instant::now()) {
            trace!(peer = %self.peer, error = %e, "final flush failed");
        }
    }

    /// Frames an error response for a connection that is about to close.
    pub fn prepare_error(&mut self, status: StatusCode) {
        let url = if self.url.is_empty() { "" } else { self.url.as_str() };
        let response = Response::error(status, url, url);
        self.prepare_response(&response, Version::Http10, false);
    }

    /// Half-closes the socket ahead of lingering.
    pub fn shutdown_write(&mut self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Write)
    }

    /// Reads and discards input while lingering. Returns `Ok(true)` when the
    /// peer has finished sending (EOF).
    pub fn drain(&mut self) -> Result<bool, ConnectionError> {
        let mut scratch = [0u8; DRAIN_CHUNK];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.bytes_read += n as u64;
                    trace!(peer = %self.peer, bytes = n, "drained");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "drain failed");
                    return Err(ConnectionError::IoError(e));
                }
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("url", &self.url)
            .field("pending", &self.pending())
            .finish()
    }
}
