// src/server.rs
use crate::config::ServerConfig;
use crate::driver::{EpollDriver, EventDriver};
use crate::error::{RavelError, RavelResult};
use crate::metrics::Metrics;
use crate::slab::ConnectionSlab;
use crate::syscalls;
use crate::worker::{Dispatch, WorkerPool};
use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const LISTENER_TOKEN: u64 = u64::MAX;
const EVENT_BATCH: usize = 1024;

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Run the accept path and the shared event loop until SIGINT.
    pub fn serve(self) -> RavelResult<()> {
        // A peer resetting mid-write must surface as an error, not a signal.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_signal = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("received SIGINT, initiating shutdown");
            shutdown_signal.store(true, Ordering::SeqCst);
        })
        .map_err(|e| RavelError::Other(format!("failed to install signal handler: {}", e)))?;

        let listen_fd = syscalls::create_listen_socket(&self.config.host, self.config.port)?;
        info!(
            host = %self.config.host,
            port = self.config.port,
            workers = self.config.workers,
            root = %self.config.document_root.display(),
            "listening"
        );

        let driver = Arc::new(EpollDriver::new()?);
        let metrics = Arc::new(Metrics::new());
        let doc_root = Arc::new(self.config.document_root.clone());
        let slab = Arc::new(ConnectionSlab::new(
            self.config.max_connections,
            driver.clone() as Arc<dyn EventDriver>,
            metrics.clone(),
            doc_root,
        ));

        driver.epoll().add(listen_fd, LISTENER_TOKEN, EPOLLIN)?;

        let pool = WorkerPool::spawn(self.config.workers, slab.clone());
        spawn_metrics_reporter(metrics.clone(), shutdown.clone());

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; EVENT_BATCH];
        let mut now = unix_now();
        let mut last_prune = now;

        while !shutdown.load(Ordering::Acquire) {
            let n = match driver.epoll().wait(&mut events, 500) {
                Ok(n) => n,
                Err(_) => continue,
            };
            now = unix_now();

            for event in events.iter().take(n) {
                let token = event.u64;
                let flags = event.events as i32;

                if token == LISTENER_TOKEN {
                    accept_loop(listen_fd, &slab, now);
                    continue;
                }

                pool.dispatch(Dispatch {
                    token: token as usize,
                    readable: flags & EPOLLIN != 0,
                    writable: flags & EPOLLOUT != 0,
                    hangup: flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0,
                    now,
                });
            }

            if self.config.keep_alive_secs > 0 && now.saturating_sub(last_prune) >= 1 {
                prune_connections(&slab, now, self.config.keep_alive_secs);
                last_prune = now;
            }
        }

        // Stop accepting first, then let workers drain their queue.
        driver.epoll().delete(listen_fd).ok();
        syscalls::close_fd(listen_fd);
        pool.shutdown();

        for idx in 0..slab.capacity() {
            if let Some(slot) = slab.get(idx) {
                let mut conn = slot.lock().unwrap();
                if !conn.is_free() {
                    conn.close_conn();
                }
            }
        }

        info!("server shut down");
        Ok(())
    }
}

/// Drain the accept queue; edge-triggered listeners report once per burst.
fn accept_loop(listen_fd: libc::c_int, slab: &ConnectionSlab, now: u32) {
    loop {
        match syscalls::accept_connection(listen_fd) {
            Ok(Some((fd, peer))) => match slab.allocate() {
                Some(idx) => {
                    let Some(slot) = slab.get(idx) else {
                        syscalls::close_fd(fd);
                        continue;
                    };
                    let mut conn = slot.lock().unwrap();
                    if let Err(e) = conn.init(fd, peer, idx as u64, now) {
                        warn!(peer = %peer, error = %e, "failed to register connection");
                        drop(conn);
                        slab.release(idx);
                    }
                }
                None => {
                    warn!(peer = %peer, "connection table full, rejecting");
                    syscalls::close_fd(fd);
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

/// Close connections idle for longer than `max_idle` seconds. Slots whose
/// lock is held are being worked on right now and are skipped.
fn prune_connections(slab: &ConnectionSlab, now: u32, max_idle: u32) {
    for idx in 0..slab.capacity() {
        let Some(slot) = slab.get(idx) else {
            continue;
        };
        let Ok(mut conn) = slot.try_lock() else {
            continue;
        };
        if conn.is_free() {
            continue;
        }
        if now.saturating_sub(conn.last_active()) > max_idle {
            debug!(fd = conn.fd(), "closing idle connection");
            conn.close_conn();
            drop(conn);
            slab.release(idx);
        }
    }
}

fn spawn_metrics_reporter(metrics: Arc<Metrics>, shutdown: Arc<AtomicBool>) {
    thread::Builder::new()
        .name("ravel-metrics".to_string())
        .spawn(move || {
            use std::sync::atomic::Ordering::Relaxed;
            while !shutdown.load(Ordering::Acquire) {
                thread::sleep(Duration::from_secs(5));
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                info!(
                    active = metrics.active_conns.load(Relaxed),
                    requests = metrics.req_count.load(Relaxed),
                    bytes = metrics.bytes_sent.load(Relaxed),
                    "metrics"
                );
            }
        })
        .ok();
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
