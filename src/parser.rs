// src/parser.rs
//! Incremental HTTP/1.1 request parsing over a connection's read buffer.
//!
//! A line scanner sub-FSM carves CRLF-terminated lines out of the buffered
//! bytes; the request FSM consumes those lines one state at a time. Parsed
//! values are byte ranges into the read buffer, never copies.

use std::ops::Range;
use tracing::debug;

/// Outcome of scanning for a single CRLF-terminated line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line was found; the scanner sits just past its CRLF.
    Complete,
    /// Ran out of bytes mid-line; wait for the next ingest.
    Open,
    /// Bare CR or bare LF; the request is malformed.
    Bad,
}

/// Request FSM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Header,
    Content,
}

/// Result codes for the request-parse pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// Need more bytes; keep reading.
    NoRequest,
    /// A complete request is in hand.
    GetRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    /// Target resolved and mapped; build a 200 response.
    FileRequest,
    InternalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        if b.eq_ignore_ascii_case(b"GET") {
            Method::Get
        } else {
            Method::Unknown
        }
    }
}

#[derive(Debug)]
pub struct RequestParser {
    pub state: ParseState,
    /// Scanner position: first byte not yet examined for CRLF.
    pub checked_idx: usize,
    /// Offset of the line currently being assembled.
    pub start_line: usize,
    pub method: Method,
    pub url: Range<usize>,
    pub host: Option<Range<usize>>,
    pub content_length: usize,
    pub linger: bool,
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            checked_idx: 0,
            start_line: 0,
            method: Method::Unknown,
            url: 0..0,
            host: None,
            content_length: 0,
            linger: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// The request target as raw bytes of `buf`.
    pub fn url_bytes<'b>(&self, buf: &'b [u8]) -> &'b [u8] {
        &buf[self.url.clone()]
    }

    pub fn host_bytes<'b>(&self, buf: &'b [u8]) -> Option<&'b [u8]> {
        self.host.clone().map(|r| &buf[r])
    }

    /// Line scanner sub-FSM: advances `checked_idx` across `[checked_idx, buf.len())`.
    pub fn parse_line(&mut self, buf: &[u8]) -> LineStatus {
        while self.checked_idx < buf.len() {
            match buf[self.checked_idx] {
                b'\r' => {
                    if self.checked_idx + 1 == buf.len() {
                        return LineStatus::Open;
                    }
                    if buf[self.checked_idx + 1] == b'\n' {
                        self.checked_idx += 2;
                        return LineStatus::Complete;
                    }
                    return LineStatus::Bad;
                }
                // A LF is only ever consumed together with its CR above.
                b'\n' => return LineStatus::Bad,
                _ => self.checked_idx += 1,
            }
        }
        LineStatus::Open
    }

    /// Request FSM driver. `buf` is the valid region of the read buffer.
    pub fn process(&mut self, buf: &[u8]) -> HttpCode {
        let mut line_status = LineStatus::Complete;

        loop {
            // Body bytes need no CRLF delimiter: when the header section just
            // ended in a complete line, fall straight through to the body.
            if !(self.state == ParseState::Content && line_status == LineStatus::Complete) {
                line_status = self.parse_line(buf);
                match line_status {
                    LineStatus::Complete => {}
                    LineStatus::Open => return HttpCode::NoRequest,
                    LineStatus::Bad => return HttpCode::BadRequest,
                }
            }

            match self.state {
                ParseState::RequestLine => {
                    let line = self.take_line();
                    match self.parse_request_line(buf, line) {
                        HttpCode::NoRequest => {}
                        code => return code,
                    }
                }
                ParseState::Header => {
                    let line = self.take_line();
                    match self.parse_header(buf, line) {
                        HttpCode::NoRequest => {}
                        code => return code,
                    }
                }
                ParseState::Content => {
                    return self.parse_content(buf);
                }
            }
        }
    }

    /// Range of the line just completed by the scanner, excluding its CRLF.
    fn take_line(&mut self) -> Range<usize> {
        let line = self.start_line..self.checked_idx - 2;
        self.start_line = self.checked_idx;
        line
    }

    /// `METHOD SP URI SP VERSION`, whitespace being spaces or tabs.
    fn parse_request_line(&mut self, buf: &[u8], line: Range<usize>) -> HttpCode {
        let base = line.start;
        let text = &buf[line];

        let sp1 = match text.iter().position(|&b| is_ws(b)) {
            Some(i) => i,
            None => return HttpCode::BadRequest,
        };
        self.method = Method::from_bytes(&text[..sp1]);
        if self.method != Method::Get {
            return HttpCode::BadRequest;
        }

        let uri_start = skip_ws(text, sp1);
        let sp2 = match text[uri_start..].iter().position(|&b| is_ws(b)) {
            Some(i) => uri_start + i,
            None => return HttpCode::BadRequest,
        };
        let ver_start = skip_ws(text, sp2);
        if !text[ver_start..].eq_ignore_ascii_case(b"HTTP/1.1") {
            return HttpCode::BadRequest;
        }

        // An absolute-form target carries a scheme and authority; strip down
        // to the path.
        let mut url_start = uri_start;
        let mut url = &text[uri_start..sp2];
        if url.len() >= 7 && url[..7].eq_ignore_ascii_case(b"http://") {
            url = &url[7..];
            url_start += 7;
            match url.iter().position(|&b| b == b'/') {
                Some(i) => {
                    url = &url[i..];
                    url_start += i;
                }
                None => return HttpCode::BadRequest,
            }
        }
        if url.is_empty() || url[0] != b'/' {
            return HttpCode::BadRequest;
        }

        self.url = (base + url_start)..(base + url_start + url.len());
        self.state = ParseState::Header;
        HttpCode::NoRequest
    }

    fn parse_header(&mut self, buf: &[u8], line: Range<usize>) -> HttpCode {
        if line.is_empty() {
            // Blank line: headers are done. A body, if announced, follows.
            if self.content_length != 0 {
                self.state = ParseState::Content;
                return HttpCode::NoRequest;
            }
            return HttpCode::GetRequest;
        }

        let base = line.start;
        let text = &buf[line];

        if let Some(rest) = strip_prefix_ci(text, b"Connection:") {
            let value = &rest[skip_ws(rest, 0)..];
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.linger = true;
            }
        } else if let Some(rest) = strip_prefix_ci(text, b"Content-Length:") {
            let value = &rest[skip_ws(rest, 0)..];
            self.content_length = parse_decimal(value);
        } else if let Some(rest) = strip_prefix_ci(text, b"Host:") {
            let value_off = b"Host:".len() + skip_ws(rest, 0);
            self.host = Some(base + value_off..base + text.len());
        } else {
            debug!(
                header = %String::from_utf8_lossy(text),
                "ignoring unrecognized header"
            );
        }
        HttpCode::NoRequest
    }

    /// The body is not interpreted; just wait until it has fully arrived.
    /// Saturating arithmetic keeps an absurd Content-Length from wrapping
    /// the cursor; such a request simply never completes.
    fn parse_content(&mut self, buf: &[u8]) -> HttpCode {
        if buf.len() >= self.checked_idx.saturating_add(self.content_length) {
            self.checked_idx = self.checked_idx.saturating_add(self.content_length);
            return HttpCode::GetRequest;
        }
        HttpCode::NoRequest
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn is_ws(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Index of the first non-whitespace byte at or after `from`.
fn skip_ws(text: &[u8], from: usize) -> usize {
    let mut i = from;
    while i < text.len() && is_ws(text[i]) {
        i += 1;
    }
    i
}

fn strip_prefix_ci<'a>(text: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if text.len() >= prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

/// Leading-digits decimal parse; anything else yields 0.
fn parse_decimal(text: &[u8]) -> usize {
    let mut n: usize = 0;
    for &b in text {
        if !b.is_ascii_digit() {
            break;
        }
        n = n.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    n
}
