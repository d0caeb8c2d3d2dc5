// src/response.rs
use crate::parser::HttpCode;
use crate::resolve::MappedFile;
use std::fmt::{self, Write as _};

pub const WRITE_BUFFER_SIZE: usize = 1024;

const OK_200_TITLE: &str = "OK";
const ERROR_400_TITLE: &str = "Bad Request";
const ERROR_400_FORM: &str = "Your request has bad syntax or is inherently impossible to satisfy.\n";
const ERROR_403_TITLE: &str = "Forbidden";
const ERROR_403_FORM: &str = "You do not have permission to get file from this server.\n";
const ERROR_404_TITLE: &str = "Not Found";
const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
const ERROR_500_TITLE: &str = "Internal Error";
const ERROR_500_FORM: &str = "There was an unusual problem serving the requested file.\n";

/// Fixed-capacity buffer for the status line, headers and canned error
/// bodies. One byte of capacity stays reserved.
pub struct WriteBuf {
    buf: [u8; WRITE_BUFFER_SIZE],
    write_idx: usize,
}

impl WriteBuf {
    pub fn new() -> Self {
        Self {
            buf: [0; WRITE_BUFFER_SIZE],
            write_idx: 0,
        }
    }

    pub fn clear(&mut self) {
        self.write_idx = 0;
    }

    pub fn len(&self) -> usize {
        self.write_idx
    }

    pub fn is_empty(&self) -> bool {
        self.write_idx == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.write_idx]
    }

    /// Format into the free region. Returns false when it does not fit.
    pub fn add_response(&mut self, args: fmt::Arguments<'_>) -> bool {
        let mut sink = BufSink {
            buf: &mut self.buf[..WRITE_BUFFER_SIZE - 1],
            idx: self.write_idx,
        };
        if sink.write_fmt(args).is_err() {
            return false;
        }
        self.write_idx = sink.idx;
        true
    }

    pub fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.add_response(format_args!("HTTP/1.1 {} {}\r\n", status, title))
    }

    pub fn add_content_length(&mut self, len: usize) -> bool {
        self.add_response(format_args!("Content-Length: {}\r\n", len))
    }

    pub fn add_content_type(&mut self) -> bool {
        self.add_response(format_args!("Content-Type:{}\r\n", "text/html"))
    }

    pub fn add_linger(&mut self, linger: bool) -> bool {
        self.add_response(format_args!(
            "Connection: {}\r\n",
            if linger { "keep-alive" } else { "close" }
        ))
    }

    pub fn add_blank_line(&mut self) -> bool {
        self.add_response(format_args!("\r\n"))
    }

    pub fn add_content(&mut self, content: &str) -> bool {
        self.add_response(format_args!("{}", content))
    }

    fn add_headers(&mut self, content_len: usize, linger: bool) -> bool {
        self.add_content_length(content_len)
            && self.add_content_type()
            && self.add_linger(linger)
            && self.add_blank_line()
    }
}

impl Default for WriteBuf {
    fn default() -> Self {
        Self::new()
    }
}

struct BufSink<'a> {
    buf: &'a mut [u8],
    idx: usize,
}

impl fmt::Write for BufSink<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        if self.idx + bytes.len() > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.idx..self.idx + bytes.len()].copy_from_slice(bytes);
        self.idx += bytes.len();
        Ok(())
    }
}

/// Two-segment gather vector for a single response: headers out of the write
/// buffer, body out of the mapping. Re-slices itself across partial writes so
/// no byte is ever sent twice.
#[derive(Debug, Default, Clone, Copy)]
pub struct GatherState {
    head_len: usize,
    body_len: usize,
    sent: usize,
}

impl GatherState {
    pub fn new(head_len: usize, body_len: usize) -> Self {
        Self {
            head_len,
            body_len,
            sent: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn total(&self) -> usize {
        self.head_len + self.body_len
    }

    pub fn remaining(&self) -> usize {
        self.total() - self.sent
    }

    pub fn is_done(&self) -> bool {
        self.sent >= self.total()
    }

    pub fn iv_count(&self) -> usize {
        if self.body_len > 0 {
            2
        } else if self.head_len > 0 {
            1
        } else {
            0
        }
    }

    pub fn advance(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.total());
    }

    /// The segments still owed to the peer, sliced past what was already sent.
    pub fn segments<'a>(
        &self,
        head: &'a [u8],
        body: Option<&'a [u8]>,
    ) -> ([&'a [u8]; 2], usize) {
        let mut segs: [&[u8]; 2] = [&[], &[]];
        let mut n = 0;

        if self.sent < self.head_len {
            segs[n] = &head[self.sent..self.head_len];
            n += 1;
            if self.body_len > 0 {
                if let Some(b) = body {
                    segs[n] = &b[..self.body_len];
                    n += 1;
                }
            }
        } else if self.sent < self.total() {
            let off = self.sent - self.head_len;
            if let Some(b) = body {
                segs[n] = &b[off..self.body_len];
                n += 1;
            }
        }

        (segs, n)
    }
}

/// Fill `out` for the given pipeline outcome and describe the wire segments.
/// `None` means the response did not fit; the connection must close.
pub fn build_response(
    code: HttpCode,
    file: Option<&MappedFile>,
    linger: bool,
    out: &mut WriteBuf,
) -> Option<GatherState> {
    out.clear();

    let (status, title, form) = match code {
        HttpCode::FileRequest => {
            let file = file?;
            if !(out.add_status_line(200, OK_200_TITLE) && out.add_headers(file.len(), linger)) {
                return None;
            }
            return Some(GatherState::new(out.len(), file.len()));
        }
        HttpCode::BadRequest => (400, ERROR_400_TITLE, ERROR_400_FORM),
        HttpCode::ForbiddenRequest => (403, ERROR_403_TITLE, ERROR_403_FORM),
        HttpCode::NoResource => (404, ERROR_404_TITLE, ERROR_404_FORM),
        HttpCode::InternalError => (500, ERROR_500_TITLE, ERROR_500_FORM),
        // Not response-producing outcomes.
        HttpCode::NoRequest | HttpCode::GetRequest => return None,
    };

    if !(out.add_status_line(status, title)
        && out.add_headers(form.len(), linger)
        && out.add_content(form))
    {
        return None;
    }
    Some(GatherState::new(out.len(), 0))
}
