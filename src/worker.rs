// src/worker.rs
use crate::slab::ConnectionSlab;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// A readiness notification handed from the event loop to the pool.
#[derive(Debug, Clone, Copy)]
pub struct Dispatch {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub now: u32,
}

/// Worker threads draining a shared dispatch queue. One-shot registration
/// guarantees no two dispatches for the same connection are in flight, so a
/// worker never contends with another over a slot.
pub struct WorkerPool {
    tx: Option<Sender<Dispatch>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(workers: usize, slab: Arc<ConnectionSlab>) -> Self {
        let (tx, rx) = channel();
        let rx = Arc::new(Mutex::new(rx));
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = rx.clone();
            let slab = slab.clone();
            let core_id = core_ids.get(i % core_ids.len().max(1)).copied();

            let handle = thread::Builder::new()
                .name(format!("ravel-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }
                    run_worker(i, rx, slab);
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            tx: Some(tx),
            handles,
        }
    }

    pub fn dispatch(&self, d: Dispatch) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(d);
        }
    }

    /// Drain outstanding dispatches, then join every worker.
    pub fn shutdown(mut self) {
        self.tx = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_worker(id: usize, rx: Arc<Mutex<Receiver<Dispatch>>>, slab: Arc<ConnectionSlab>) {
    debug!(worker = id, "worker started");
    loop {
        let dispatch = {
            let guard = rx.lock().unwrap();
            match guard.recv() {
                Ok(d) => d,
                Err(_) => break,
            }
        };
        handle_event(&slab, dispatch);
    }
    debug!(worker = id, "worker exiting");
}

fn handle_event(slab: &ConnectionSlab, d: Dispatch) {
    let Some(slot) = slab.get(d.token) else {
        return;
    };
    let mut conn = slot.lock().unwrap();
    if conn.is_free() {
        // Stale dispatch for a slot that was already recycled.
        return;
    }
    conn.touch(d.now);

    // A peer that half-closes right after its final request delivers RDHUP
    // and IN in the same event; the buffered bytes must still be read and
    // answered, and a staged response must still be flushed. The receive
    // path sees the EOF itself, so a hangup only forces the close when it
    // arrives with nothing else to do.
    let keep = if d.readable {
        conn.on_readable()
    } else if d.writable {
        conn.on_writable()
    } else if d.hangup {
        conn.on_hangup();
        false
    } else {
        true
    };

    if !keep {
        drop(conn);
        slab.release(d.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{EventDriver, Interest};
    use crate::error::RavelResult;
    use crate::metrics::Metrics;
    use libc::c_int;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    struct NullDriver;

    impl EventDriver for NullDriver {
        fn register(&self, _fd: c_int, _token: u64) -> RavelResult<()> {
            Ok(())
        }
        fn rearm(&self, _fd: c_int, _token: u64, _interest: Interest) -> RavelResult<()> {
            Ok(())
        }
        fn unregister(&self, _fd: c_int) -> RavelResult<()> {
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

    #[test]
    fn stale_and_out_of_range_dispatches_are_ignored() {
        let slab = Arc::new(ConnectionSlab::new(
            2,
            Arc::new(NullDriver),
            Arc::new(Metrics::new()),
            Arc::new(PathBuf::from("/tmp")),
        ));
        let pool = WorkerPool::spawn(2, slab.clone());

        // Token 0 is a free slot, token 99 does not exist; neither may wedge
        // or panic a worker.
        pool.dispatch(Dispatch {
            token: 0,
            readable: true,
            writable: false,
            hangup: false,
            now: 0,
        });
        pool.dispatch(Dispatch {
            token: 99,
            readable: true,
            writable: false,
            hangup: false,
            now: 0,
        });
        pool.shutdown();
        assert_eq!(slab.available(), 2);
    }

    #[test]
    fn hangup_bundled_with_data_still_answers_the_request() {
        let root = tempfile::tempdir().unwrap();
        let index = root.path().join("index.html");
        fs::write(&index, b"hello world").unwrap();
        fs::set_permissions(&index, fs::Permissions::from_mode(0o644)).unwrap();

        let slab = Arc::new(ConnectionSlab::new(
            2,
            Arc::new(NullDriver),
            Arc::new(Metrics::new()),
            Arc::new(root.path().to_path_buf()),
        ));
        let (server_fd, client_fd) = socket_pair();
        let idx = slab.allocate().unwrap();
        slab.get(idx)
            .unwrap()
            .lock()
            .unwrap()
            .init(server_fd, "127.0.0.1:0".parse().unwrap(), idx as u64, 0)
            .unwrap();

        // Final request and half-close land as one RDHUP|IN event.
        let req = b"GET /index.html HTTP/1.1\r\n\r\n";
        let n = unsafe { libc::send(client_fd, req.as_ptr() as *const libc::c_void, req.len(), 0) };
        assert_eq!(n, req.len() as isize);
        unsafe {
            libc::shutdown(client_fd, libc::SHUT_WR);
        }

        handle_event(
            &slab,
            Dispatch {
                token: idx,
                readable: true,
                writable: false,
                hangup: true,
                now: 1,
            },
        );
        // The request was drained and a response staged, not discarded.
        assert!(!slab.get(idx).unwrap().lock().unwrap().is_free());

        handle_event(
            &slab,
            Dispatch {
                token: idx,
                readable: false,
                writable: true,
                hangup: true,
                now: 1,
            },
        );
        assert!(slab.get(idx).unwrap().lock().unwrap().is_free());
        assert_eq!(slab.available(), 2);

        let mut wire = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = unsafe {
                libc::recv(client_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if n <= 0 {
                break;
            }
            wire.extend_from_slice(&buf[..n as usize]);
        }
        assert!(wire.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(wire.ends_with(b"hello world"));

        unsafe {
            libc::close(client_fd);
        }
    }

    #[test]
    fn bare_hangup_closes_the_connection() {
        let slab = Arc::new(ConnectionSlab::new(
            2,
            Arc::new(NullDriver),
            Arc::new(Metrics::new()),
            Arc::new(PathBuf::from("/tmp")),
        ));
        let (server_fd, client_fd) = socket_pair();
        let idx = slab.allocate().unwrap();
        slab.get(idx)
            .unwrap()
            .lock()
            .unwrap()
            .init(server_fd, "127.0.0.1:0".parse().unwrap(), idx as u64, 0)
            .unwrap();

        handle_event(
            &slab,
            Dispatch {
                token: idx,
                readable: false,
                writable: false,
                hangup: true,
                now: 1,
            },
        );
        assert!(slab.get(idx).unwrap().lock().unwrap().is_free());
        assert_eq!(slab.available(), 2);

        unsafe {
            libc::close(client_fd);
        }
    }
}
