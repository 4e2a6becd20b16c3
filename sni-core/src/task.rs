//! Background task plumbing: cancellation, bind retry, accept loops.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Fixed delay between failed bind attempts.
pub const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Only the first failure in each window of this many attempts is logged.
pub const BIND_RETRY_LOG_WINDOW: u32 = 30;

/// How often an idle accept loop checks for cancellation.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Clonable cancellation flag with a timed wait.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        if let Ok(mut cancelled) = flag.lock() {
            *cancelled = true;
        }
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        // a poisoned flag can never be reset, so treat it as cancelled
        self.inner.0.lock().map(|c| *c).unwrap_or(true)
    }

    /// Sleep up to `timeout`, waking early on cancellation.
    ///
    /// Returns whether the token is cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let Ok(cancelled) = flag.lock() else {
            return true;
        };
        match cvar.wait_timeout_while(cancelled, timeout, |c| !*c) {
            Ok((cancelled, _)) => *cancelled,
            Err(_) => true,
        }
    }
}

/// Retry state for a listener that failed to bind.
///
/// Retries forever at a fixed delay; only success ends it.
#[derive(Debug, Default)]
pub struct BindRetry {
    attempts: u32,
}

impl BindRetry {
    /// Record a failed attempt. Returns whether this failure should be logged.
    pub fn failed(&mut self) -> bool {
        let log_it = self.attempts == 0;
        self.attempts += 1;
        if self.attempts >= BIND_RETRY_LOG_WINDOW {
            self.attempts = 0;
        }
        log_it
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Run a TCP accept loop on its own thread until `cancel` fires.
///
/// The loop starts `Unbound` and retries binding every second. Once bound it
/// calls `on_bound` with the local address (each time it rebinds) and hands
/// every accepted connection to `on_accept`. A fatal accept error drops back
/// to `Unbound`.
pub fn spawn_listener<B, A>(
    name: &'static str,
    addr: String,
    cancel: CancelToken,
    mut on_bound: B,
    mut on_accept: A,
) -> io::Result<JoinHandle<()>>
where
    B: FnMut(SocketAddr) + Send + 'static,
    A: FnMut(TcpStream, SocketAddr) + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{}-listener", name))
        .spawn(move || {
            let mut retry = BindRetry::default();
            while let Some(listener) = bind_with_retry(name, &addr, &cancel, &mut retry) {
                let local = match listener.local_addr() {
                    Ok(local) => local,
                    Err(e) => {
                        log::warn!("{}: listener has no local address: {}", name, e);
                        continue;
                    }
                };
                log::info!("{}: listening on {}", name, local);
                on_bound(local);

                if accept_loop(name, &listener, &cancel, &mut on_accept) {
                    break;
                }
                log::info!("{}: listener lost; rebinding {}", name, addr);
            }
            log::debug!("{}: listener stopped", name);
        })
}

/// Bind `addr`, retrying until success or cancellation.
fn bind_with_retry(
    name: &str,
    addr: &str,
    cancel: &CancelToken,
    retry: &mut BindRetry,
) -> Option<TcpListener> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        let bound = TcpListener::bind(addr).and_then(|l| {
            l.set_nonblocking(true)?;
            Ok(l)
        });
        match bound {
            Ok(listener) => {
                retry.reset();
                return Some(listener);
            }
            Err(e) => {
                if retry.failed() {
                    log::warn!("{}: could not start server on {}: {}", name, addr, e);
                }
                if cancel.wait(BIND_RETRY_DELAY) {
                    return None;
                }
            }
        }
    }
}

/// Accept until cancelled (returns true) or a fatal error (returns false).
fn accept_loop<A>(name: &str, listener: &TcpListener, cancel: &CancelToken, on_accept: &mut A) -> bool
where
    A: FnMut(TcpStream, SocketAddr),
{
    loop {
        if cancel.is_cancelled() {
            return true;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    log::warn!("{}: dropping connection from {}: {}", name, peer, e);
                    continue;
                }
                log::debug!("{}: accepted connection from {}", name, peer);
                on_accept(stream, peer);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if cancel.wait(ACCEPT_POLL) {
                    return true;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::warn!("{}: accept failed: {}", name, e);
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let cancelled = token.wait(Duration::from_secs(30));
                (cancelled, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();

        let (cancelled, elapsed) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_wait_times_out_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.wait(Duration::from_millis(5)));
    }

    #[test]
    fn test_bind_retry_log_window() {
        let mut retry = BindRetry::default();
        let logged: Vec<bool> = (0..61).map(|_| retry.failed()).collect();
        let logged_at: Vec<usize> = logged
            .iter()
            .enumerate()
            .filter(|(_, &l)| l)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(logged_at, vec![0, 30, 60]);

        retry.reset();
        assert!(retry.failed());
    }

    #[test]
    fn test_listener_binds_accepts_and_stops() {
        let cancel = CancelToken::new();
        let (bound_tx, bound_rx) = mpsc::channel();
        let (conn_tx, conn_rx) = mpsc::channel();

        let handle = spawn_listener(
            "test",
            "127.0.0.1:0".to_string(),
            cancel.clone(),
            move |addr| {
                let _ = bound_tx.send(addr);
            },
            move |_stream, peer| {
                let _ = conn_tx.send(peer);
            },
        )
        .unwrap();

        let addr = bound_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let peer = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(peer, client.local_addr().unwrap());

        cancel.cancel();
        handle.join().unwrap();
    }

    #[test]
    fn test_listener_keeps_retrying_occupied_port() {
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = occupied.local_addr().unwrap();
        let cancel = CancelToken::new();
        let (bound_tx, bound_rx) = mpsc::channel();

        let handle = spawn_listener(
            "test",
            addr.to_string(),
            cancel.clone(),
            move |a| {
                let _ = bound_tx.send(a);
            },
            |_, _| {},
        )
        .unwrap();

        // stays unbound while the port is taken
        assert!(bound_rx.recv_timeout(Duration::from_millis(300)).is_err());

        drop(occupied);
        let bound = bound_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(bound, addr);

        cancel.cancel();
        handle.join().unwrap();
    }
}
