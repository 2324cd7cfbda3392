//! TCP accept loop with a bounded graceful drain on shutdown: stop
//! accepting, let active connections finish up to a grace period, then
//! exit.

use crate::handler::ConnectionHandler;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

/// The public TLS-passthrough listener: accepts raw TCP connections on
/// `PORT` and hands each one to a fresh [`ConnectionHandler`] task.
pub struct ProxyListener {
    inner: TcpListener,
    handler: Arc<ConnectionHandler>,
    active: Arc<AtomicU64>,
}

impl ProxyListener {
    pub async fn bind(addr: &str, handler: Arc<ConnectionHandler>) -> std::io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self {
            inner,
            handler,
            active: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept connections until a shutdown signal arrives, then drain active
    /// connections for up to `grace_period` before returning. A second
    /// SIGTERM/SIGINT received at any point (including mid-drain) cuts the
    /// wait short; it never panics or re-triggers the first shutdown path.
    pub async fn run(self, grace_period: Duration) {
        let (tx, mut rx) = watch::channel(0u32);
        tokio::spawn(signal_watch(tx));

        loop {
            tokio::select! {
                accepted = self.inner.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            self.active.fetch_add(1, Ordering::Relaxed);
                            let handler = Arc::clone(&self.handler);
                            let active = Arc::clone(&self.active);
                            tokio::spawn(async move {
                                handler.handle(socket, addr).await;
                                active.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = rx.changed() => {
                    info!(grace_period_ms = grace_period.as_millis(), "shutdown signal received, draining");
                    break;
                }
            }
        }

        drain(&self.active, grace_period, &mut rx).await;
    }
}

/// Wait for `active` to reach zero, polling every 100ms, until `grace_period`
/// elapses or a second shutdown signal arrives on `rx`, whichever is first.
/// Split out from [`ProxyListener::run`] so it can be driven by a synthetic
/// `watch` sender in tests, without depending on real signals.
async fn drain(active: &AtomicU64, grace_period: Duration, rx: &mut watch::Receiver<u32>) {
    let deadline = Instant::now() + grace_period;
    const POLL: Duration = Duration::from_millis(100);

    loop {
        if active.load(Ordering::Relaxed) == 0 {
            return;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(
                active = active.load(Ordering::Relaxed),
                "grace period expired; forcing shutdown"
            );
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL.min(remaining)) => {}
            _ = rx.changed() => {
                warn!("second shutdown signal received; forcing immediate shutdown");
                return;
            }
        }
    }
}

/// Listens for SIGTERM and SIGINT and republishes each as an incrementing
/// generation on `tx`, so the first signal and any subsequent one are both
/// observable and distinguishable by `watch::Receiver::changed`.
async fn signal_watch(tx: watch::Sender<u32>) {
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    let mut generation = 0u32;
    loop {
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        generation += 1;
        if tx.send(generation).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_returns_immediately_when_nothing_active() {
        let active = AtomicU64::new(0);
        let (_tx, mut rx) = watch::channel(0u32);
        let start = Instant::now();
        drain(&active, Duration::from_secs(5), &mut rx).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn drain_waits_for_active_to_reach_zero() {
        let active = Arc::new(AtomicU64::new(1));
        let (_tx, mut rx) = watch::channel(0u32);

        let active_clone = Arc::clone(&active);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            active_clone.fetch_sub(1, Ordering::Relaxed);
        });

        let start = Instant::now();
        drain(&active, Duration::from_secs(5), &mut rx).await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn second_signal_cuts_the_drain_short() {
        let active = AtomicU64::new(1); // never reaches zero on its own
        let (tx, mut rx) = watch::channel(0u32);

        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            tx.send(1).unwrap();
        });

        let start = Instant::now();
        drain(&active, Duration::from_secs(30), &mut rx).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1));
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn grace_period_expiry_forces_return_without_panicking() {
        let active = AtomicU64::new(1);
        let (_tx, mut rx) = watch::channel(0u32);
        let start = Instant::now();
        drain(&active, Duration::from_millis(150), &mut rx).await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
