//! Incremental Request Framing
//!
//! Two small scanners over the connection's read buffer:
//!
//! - [`RequestScanner`] watches the raw character stream and says when a
//!   complete request (request line plus headers) has arrived. It keeps its
//!   state between calls, so bytes are examined exactly once no matter how
//!   the request is split across reads.
//! - [`LineReader`] hands out one line at a time once the request is framed.
//!
//! ## Scanner States
//!
//! ```text
//!  FirstWord ─sp─► FirstWs ─ch─► SecondWord ─sp─► SecondWs ─ch─► ThirdWord
//!                                    │                              │
//!                                    └─ CR/LF: HTTP/0.9 request     ├─ LF ─► Lf
//!                                                                   └─ CR ─► Cr
//!
//!  Line ─LF─► Lf ─LF──────────────► done
//!  Line ─CR─► Cr ─CR──────────────► done
//!             Cr ─LF─► CrLf ─LF───► done
//!                      CrLf ─CR─► CrLfCr ─CR/LF─► done
//! ```
//!
//! A CR or LF before the second word starts is a bad request.

/// Outcome of scanning the bytes received so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Keep reading.
    NoRequest,
    /// A complete request is buffered.
    GotRequest,
    /// The request line is malformed.
    BadRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ScanState {
    #[default]
    FirstWord,
    FirstWs,
    SecondWord,
    SecondWs,
    ThirdWord,
    ThirdWs,
    Line,
    Lf,
    Cr,
    CrLf,
    CrLfCr,
    Bogus,
}

/// Detects the end of a request's header block.
#[derive(Debug, Clone, Default)]
pub struct RequestScanner {
    state: ScanState,
    checked: usize,
}

impl RequestScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// How far into the buffer scanning has progressed. After
    /// [`Framing::GotRequest`] this is the length of the request head.
    pub fn checked(&self) -> usize {
        self.checked
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Scans `buf[checked..]`. `buf` must be the same buffer, possibly
    /// extended, that earlier calls saw.
    pub fn scan(&mut self, buf: &[u8]) -> Framing {
        use ScanState::*;

        while self.checked < buf.len() {
            let c = buf[self.checked];
            self.checked += 1;

            self.state = match (self.state, c) {
                (Bogus, _) => return Framing::BadRequest,

                (FirstWord, b' ' | b'\t') => FirstWs,
                (FirstWord, b'\r' | b'\n') => Bogus,
                (FirstWord, _) => FirstWord,

                (FirstWs, b' ' | b'\t') => FirstWs,
                (FirstWs, b'\r' | b'\n') => Bogus,
                (FirstWs, _) => SecondWord,

                (SecondWord, b' ' | b'\t') => SecondWs,
                // Only two words: an HTTP/0.9 request.
                (SecondWord, b'\r' | b'\n') => return Framing::GotRequest,
                (SecondWord, _) => SecondWord,

                (SecondWs, b' ' | b'\t') => SecondWs,
                (SecondWs, b'\r' | b'\n') => Bogus,
                (SecondWs, _) => ThirdWord,

                (ThirdWord, b' ' | b'\t') => ThirdWs,
                (ThirdWord, b'\n') => Lf,
                (ThirdWord, b'\r') => Cr,
                (ThirdWord, _) => ThirdWord,

                (ThirdWs, b' ' | b'\t') => ThirdWs,
                (ThirdWs, b'\n') => Lf,
                (ThirdWs, b'\r') => Cr,
                (ThirdWs, _) => Bogus,

                (Line | Lf | Cr | CrLf | CrLfCr, _) => match (self.state, c) {
                    (Lf, b'\n') | (Cr, b'\r') | (CrLf, b'\n') => return Framing::GotRequest,
                    (CrLfCr, b'\r' | b'\n') => return Framing::GotRequest,
                    (Cr, b'\n') => CrLf,
                    (CrLf, b'\r') => CrLfCr,
                    (_, b'\n') => Lf,
                    (_, b'\r') => Cr,
                    _ => Line,
                },
            };

            if self.state == Bogus {
                return Framing::BadRequest;
            }
        }

        Framing::NoRequest
    }
}

/// Splits a buffer into lines terminated by CR, LF or CRLF.
#[derive(Debug, Clone)]
pub struct LineReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> LineReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Unconsumed bytes.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Returns the next line without its terminator, or `None` if no
    /// terminator follows the current position. The position only advances
    /// when a line is returned.
    pub fn next_line(&mut self) -> Option<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        let end = rest.iter().position(|&b| b == b'\r' || b == b'\n')?;

        let line = &rest[..end];
        let mut advance = end + 1;
        if rest[end] == b'\r' && rest.get(end + 1) == Some(&b'\n') {
            advance += 1;
        }

        self.pos += advance;
        Some(line)
    }
}

impl<'a> Iterator for LineReader<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        self.next_line()
    }
}
