// src/conn.rs
use crate::driver::{EventDriver, Interest};
use crate::error::RavelResult;
use crate::metrics::Metrics;
use crate::parser::{HttpCode, RequestParser};
use crate::resolve::{self, MappedFile, Resolution};
use crate::response::{self, GatherState, WriteBuf};
use crate::syscalls;
use libc::c_int;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub const READ_BUFFER_SIZE: usize = 2048;

/// Keep-alive connections are recycled after this many responses.
const MAX_REQUESTS_PER_CONN: u32 = 10_000;

enum WriteStep {
    Wrote(usize),
    WouldBlock,
    Fatal,
}

/// One accepted socket: its buffers, parser state, resolved file and the
/// shared event-loop handle it rearms itself through.
pub struct Connection {
    fd: c_int,
    token: u64,
    peer: Option<SocketAddr>,
    driver: Arc<dyn EventDriver>,
    metrics: Arc<Metrics>,
    doc_root: Arc<PathBuf>,

    read_buf: [u8; READ_BUFFER_SIZE],
    /// Next free byte of the read buffer.
    read_idx: usize,
    parser: RequestParser,

    write_buf: WriteBuf,
    gather: GatherState,
    file: Option<MappedFile>,

    /// Peer shut its write side; no further request bytes will arrive.
    peer_closed: bool,
    requests_served: u32,
    last_active: u32,
}

impl Connection {
    /// An unused slot; `init` binds it to a socket.
    pub fn vacant(
        driver: Arc<dyn EventDriver>,
        metrics: Arc<Metrics>,
        doc_root: Arc<PathBuf>,
    ) -> Self {
        Self {
            fd: -1,
            token: 0,
            peer: None,
            driver,
            metrics,
            doc_root,
            read_buf: [0; READ_BUFFER_SIZE],
            read_idx: 0,
            parser: RequestParser::new(),
            write_buf: WriteBuf::new(),
            gather: GatherState::default(),
            file: None,
            peer_closed: false,
            requests_served: 0,
            last_active: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.fd == -1
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn last_active(&self) -> u32 {
        self.last_active
    }

    pub fn touch(&mut self, now: u32) {
        self.last_active = now;
    }

    /// Take ownership of an accepted socket and register read interest.
    pub fn init(&mut self, fd: c_int, peer: SocketAddr, token: u64, now: u32) -> RavelResult<()> {
        syscalls::set_reuse_addr(fd);
        syscalls::set_nodelay(fd);
        syscalls::set_nonblocking(fd);

        self.fd = fd;
        self.token = token;
        self.peer = Some(peer);
        self.peer_closed = false;
        self.requests_served = 0;
        self.last_active = now;
        self.reset();

        if let Err(e) = self.driver.register(fd, token) {
            syscalls::close_fd(fd);
            self.fd = -1;
            self.peer = None;
            return Err(e);
        }
        self.metrics.inc_conn();
        debug!(fd, peer = %peer, "connection opened");
        Ok(())
    }

    /// Clear parser and response state for the next request.
    fn reset(&mut self) {
        self.read_idx = 0;
        self.parser.reset();
        self.write_buf.clear();
        self.gather.reset();
        self.unmap();
    }

    /// Release the file mapping. Idempotent.
    fn unmap(&mut self) {
        self.file = None;
    }

    // ---- Event-loop entry points ----

    /// Read-readiness. Returns whether the connection stays registered.
    pub fn on_readable(&mut self) -> bool {
        if !self.ingest() {
            self.close_conn();
            return false;
        }
        self.process()
    }

    /// Write-readiness. Returns whether the connection stays registered.
    pub fn on_writable(&mut self) -> bool {
        if !self.emit() {
            self.close_conn();
            return false;
        }
        true
    }

    /// Peer hung up.
    pub fn on_hangup(&mut self) {
        self.close_conn();
    }

    /// Remove the socket from the event set and release it. Idempotent.
    pub fn close_conn(&mut self) {
        if self.fd == -1 {
            return;
        }
        self.unmap();
        if let Err(e) = self.driver.unregister(self.fd) {
            debug!(fd = self.fd, error = %e, "unregister failed");
        }
        syscalls::close_fd(self.fd);
        debug!(fd = self.fd, peer = ?self.peer, "connection closed");
        self.fd = -1;
        self.peer = None;
        self.metrics.dec_conn();
    }

    // ---- Read side ----

    /// Drain the socket into the read buffer until would-block.
    ///
    /// False means the connection is done for: peer EOF with nothing
    /// buffered, a hard receive error, or a request that outgrew the
    /// buffer. EOF after buffered bytes is a half-close: whatever arrived
    /// still gets parsed and answered before the connection goes down.
    pub fn ingest(&mut self) -> bool {
        loop {
            if self.read_idx >= READ_BUFFER_SIZE {
                warn!(fd = self.fd, "request exceeds read buffer");
                return false;
            }
            match syscalls::recv_nonblocking(self.fd, &mut self.read_buf[self.read_idx..]) {
                Ok(0) => {
                    self.peer_closed = true;
                    return self.read_idx > 0;
                }
                Ok(n) => self.read_idx += n,
                Err(e) if e.is_would_block() => return true,
                Err(e) => {
                    warn!(fd = self.fd, error = %e, "recv failed");
                    return false;
                }
            }
        }
    }

    /// Parse buffered bytes; once a request completes, resolve its target.
    fn process_read(&mut self) -> HttpCode {
        match self.parser.process(&self.read_buf[..self.read_idx]) {
            HttpCode::GetRequest => self.do_request(),
            code => code,
        }
    }

    fn do_request(&mut self) -> HttpCode {
        let url = match std::str::from_utf8(self.parser.url_bytes(&self.read_buf)) {
            Ok(t) => t,
            Err(_) => return HttpCode::BadRequest,
        };
        trace!(fd = self.fd, url, "request parsed");

        match resolve::resolve(self.doc_root.as_path(), url) {
            Resolution::File(f) => {
                self.file = Some(f);
                HttpCode::FileRequest
            }
            Resolution::NotFound => HttpCode::NoResource,
            Resolution::Forbidden => HttpCode::ForbiddenRequest,
            Resolution::Directory => HttpCode::BadRequest,
            Resolution::Error => HttpCode::InternalError,
        }
    }

    /// Stage the response for `code` in the write buffer and gather vector.
    fn process_write(&mut self, code: HttpCode) -> bool {
        match response::build_response(code, self.file.as_ref(), self.parser.linger, &mut self.write_buf)
        {
            Some(gather) => {
                self.gather = gather;
                true
            }
            None => false,
        }
    }

    /// Ingest already happened; drive the parser and stage a response.
    fn process(&mut self) -> bool {
        let code = self.process_read();
        if code == HttpCode::NoRequest {
            if self.peer_closed {
                // The request can never complete now.
                self.close_conn();
                return false;
            }
            self.rearm(Interest::Read);
            return true;
        }
        if !self.process_write(code) {
            self.close_conn();
            return false;
        }
        self.rearm(Interest::Write);
        true
    }

    // ---- Write side ----

    /// Vectored write loop; drains until done or would-block.
    ///
    /// False means the caller must close the connection.
    pub fn emit(&mut self) -> bool {
        if self.write_buf.is_empty() {
            self.rearm(Interest::Read);
            self.reset();
            return true;
        }

        loop {
            let step = {
                let head = self.write_buf.as_slice();
                let body = self.file.as_ref().and_then(|f| f.bytes());
                let (segs, n) = self.gather.segments(head, body);
                match syscalls::writev_nonblocking(self.fd, &segs[..n]) {
                    Ok(w) => WriteStep::Wrote(w),
                    Err(e) if e.is_would_block() => WriteStep::WouldBlock,
                    Err(e) => {
                        warn!(fd = self.fd, error = %e, "writev failed");
                        WriteStep::Fatal
                    }
                }
            };

            match step {
                WriteStep::WouldBlock => {
                    self.rearm(Interest::Write);
                    return true;
                }
                WriteStep::Fatal => {
                    self.unmap();
                    return false;
                }
                WriteStep::Wrote(0) => {
                    // No progress; wait for the next writable event.
                    self.rearm(Interest::Write);
                    return true;
                }
                WriteStep::Wrote(w) => {
                    self.gather.advance(w);
                    self.metrics.add_bytes(w as u64);
                    if !self.gather.is_done() {
                        continue;
                    }

                    self.unmap();
                    self.metrics.inc_req();
                    self.requests_served += 1;
                    if self.parser.linger
                        && !self.peer_closed
                        && self.requests_served < MAX_REQUESTS_PER_CONN
                    {
                        self.reset();
                        self.rearm(Interest::Read);
                        return true;
                    }
                    self.rearm(Interest::Read);
                    return false;
                }
            }
        }
    }

    fn rearm(&self, interest: Interest) {
        if let Err(e) = self.driver.rearm(self.fd, self.token, interest) {
            warn!(fd = self.fd, error = %e, "failed to rearm event interest");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close_conn();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Interest;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Action {
        Register(c_int),
        Rearm(c_int, Interest),
        Unregister(c_int),
    }

    #[derive(Default)]
    struct RecordingDriver {
        actions: Mutex<Vec<Action>>,
    }

    impl RecordingDriver {
        fn take(&self) -> Vec<Action> {
            std::mem::take(&mut self.actions.lock().unwrap())
        }
    }

    impl EventDriver for RecordingDriver {
        fn register(&self, fd: c_int, _token: u64) -> RavelResult<()> {
            self.actions.lock().unwrap().push(Action::Register(fd));
            Ok(())
        }
        fn rearm(&self, fd: c_int, _token: u64, interest: Interest) -> RavelResult<()> {
            self.actions.lock().unwrap().push(Action::Rearm(fd, interest));
            Ok(())
        }
        fn unregister(&self, fd: c_int) -> RavelResult<()> {
            self.actions.lock().unwrap().push(Action::Unregister(fd));
            Ok(())
        }
    }

    fn socket_pair() -> (c_int, c_int) {
        let mut fds = [0 as c_int; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        (fds[0], fds[1])
    }

    fn send_bytes(fd: c_int, bytes: &[u8]) {
        let n = unsafe { libc::send(fd, bytes.as_ptr() as *const libc::c_void, bytes.len(), 0) };
        assert_eq!(n, bytes.len() as isize);
    }

    fn recv_all(fd: c_int) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n =
                unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
        }
        out
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    struct Fixture {
        driver: Arc<RecordingDriver>,
        conn: Connection,
        client_fd: c_int,
        _root: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let index = root.path().join("index.html");
        fs::write(&index, b"hello world").unwrap();
        fs::set_permissions(&index, fs::Permissions::from_mode(0o644)).unwrap();

        let driver = Arc::new(RecordingDriver::default());
        let mut conn = Connection::vacant(
            driver.clone(),
            Arc::new(Metrics::new()),
            Arc::new(root.path().to_path_buf()),
        );
        let (server_fd, client_fd) = socket_pair();
        conn.init(server_fd, peer(), 1, 0).unwrap();

        Fixture {
            driver,
            conn,
            client_fd,
            _root: root,
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.client_fd);
            }
        }
    }

    #[test]
    fn every_event_rearms_once_or_closes() {
        let mut fx = fixture();
        let fd = fx.conn.fd();
        assert_eq!(fx.driver.take(), vec![Action::Register(fd)]);

        // Incomplete request: exactly one rearm, for reads.
        send_bytes(fx.client_fd, b"GET /index.html HT");
        assert!(fx.conn.on_readable());
        assert_eq!(fx.driver.take(), vec![Action::Rearm(fd, Interest::Read)]);

        // Completed request: exactly one rearm, for writes.
        send_bytes(fx.client_fd, b"TP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert!(fx.conn.on_readable());
        assert_eq!(fx.driver.take(), vec![Action::Rearm(fd, Interest::Write)]);

        // Flushed keep-alive response: exactly one rearm, back to reads.
        assert!(fx.conn.on_writable());
        assert_eq!(fx.driver.take(), vec![Action::Rearm(fd, Interest::Read)]);
    }

    #[test]
    fn keep_alive_resets_all_cursors() {
        let mut fx = fixture();
        send_bytes(
            fx.client_fd,
            b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
        );
        assert!(fx.conn.on_readable());
        assert!(fx.conn.on_writable());

        assert_eq!(fx.conn.read_idx, 0);
        assert_eq!(fx.conn.parser.checked_idx, 0);
        assert_eq!(fx.conn.parser.start_line, 0);
        assert_eq!(fx.conn.parser.state, crate::parser::ParseState::RequestLine);
        assert!(fx.conn.write_buf.is_empty());
        assert!(fx.conn.gather.is_done());
        assert!(fx.conn.file.is_none());
        assert!(!fx.conn.is_free());
    }

    #[test]
    fn close_after_response_without_keep_alive() {
        let mut fx = fixture();
        let fd = fx.conn.fd();
        send_bytes(fx.client_fd, b"GET /index.html HTTP/1.1\r\n\r\n");
        assert!(fx.conn.on_readable());
        fx.driver.take();

        assert!(!fx.conn.on_writable());
        assert!(fx.conn.is_free());
        let actions = fx.driver.take();
        assert!(actions.contains(&Action::Unregister(fd)));
    }

    #[test]
    fn oversized_request_is_fatal() {
        let mut fx = fixture();
        // No CRLF anywhere: the request line alone overflows the buffer.
        let big = vec![b'a'; READ_BUFFER_SIZE + 16];
        send_bytes(fx.client_fd, &big);
        assert!(!fx.conn.on_readable());
        assert!(fx.conn.is_free());
    }

    #[test]
    fn peer_eof_closes_the_connection() {
        let mut fx = fixture();
        unsafe {
            libc::shutdown(fx.client_fd, libc::SHUT_WR);
        }
        assert!(!fx.conn.on_readable());
        assert!(fx.conn.is_free());
    }

    #[test]
    fn half_close_after_full_request_is_still_served() {
        let mut fx = fixture();
        send_bytes(
            fx.client_fd,
            b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
        );
        unsafe {
            libc::shutdown(fx.client_fd, libc::SHUT_WR);
        }

        // The buffered request is read and answered despite the EOF.
        assert!(fx.conn.on_readable());
        // Keep-alive cannot survive a half-closed peer: flush, then close.
        assert!(!fx.conn.on_writable());
        assert!(fx.conn.is_free());

        let got = recv_all(fx.client_fd);
        assert!(got.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(got.ends_with(b"hello world"));
    }

    #[test]
    fn half_close_with_incomplete_request_closes() {
        let mut fx = fixture();
        send_bytes(fx.client_fd, b"GET /index.html HT");
        unsafe {
            libc::shutdown(fx.client_fd, libc::SHUT_WR);
        }
        assert!(!fx.conn.on_readable());
        assert!(fx.conn.is_free());
    }

    #[test]
    fn close_conn_is_idempotent() {
        let mut fx = fixture();
        fx.conn.close_conn();
        assert!(fx.conn.is_free());
        fx.conn.close_conn();
        assert!(fx.conn.is_free());

        let unregisters = fx
            .driver
            .take()
            .into_iter()
            .filter(|a| matches!(a, Action::Unregister(_)))
            .count();
        assert_eq!(unregisters, 1);
    }

    #[test]
    fn hangup_closes_and_frees() {
        let mut fx = fixture();
        fx.conn.on_hangup();
        assert!(fx.conn.is_free());
    }

    #[test]
    fn served_response_is_byte_exact_on_the_wire() {
        let mut fx = fixture();
        send_bytes(
            fx.client_fd,
            b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
        );
        assert!(fx.conn.on_readable());
        assert!(fx.conn.on_writable());

        let got = recv_all(fx.client_fd);
        let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\nContent-Type:text/html\r\nConnection: keep-alive\r\n\r\nhello world";
        assert_eq!(got, expected);
    }
}
