//! The per-connection protocol state machine: `AwaitingHello → Dialing →
//! Splicing → Closing`.
//!
//! Each state is a value and each transition is a function returning the
//! next state (or the terminal [`CloseReason`]); `Closing` is reached from
//! exactly one place per connection.

use crate::error::CloseReason;
use crate::policy::AddressPolicy;
use crate::ratelimit::RateLimiter;
use crate::routes::{RouteTable, Upstream};
use crate::sni::{self, Probe};
use crate::stats::Stats;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at};
use tracing::{debug, info, warn};

/// Hard cap on the preread buffer: 16 KiB.
const PREREAD_CAP: usize = 16 * 1024;

/// How long to wait for the second splice direction to finish cleanly after
/// the first direction reaches EOF, before forcing both sides closed.
const HALF_CLOSE_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 4096;
const COPY_BUFFER: usize = 16 * 1024;

#[derive(Clone)]
pub struct HandlerConfig {
    pub preread_timeout: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Orchestrates admission, preread, SNI parse, upstream dial, and splice for
/// one accepted client connection. Owns no per-connection state itself:
/// every field here is shared, immutable infrastructure, and the connection
/// state (`preread_buf`, `sni`, `upstream`, deadlines) lives on the stack of
/// [`ConnectionHandler::run`].
pub struct ConnectionHandler {
    policy: Arc<AddressPolicy>,
    rate_limiter: Arc<RateLimiter>,
    routes: Arc<RouteTable>,
    stats: Arc<Stats>,
    config: HandlerConfig,
}

impl ConnectionHandler {
    pub fn new(
        policy: Arc<AddressPolicy>,
        rate_limiter: Arc<RateLimiter>,
        routes: Arc<RouteTable>,
        stats: Arc<Stats>,
        config: HandlerConfig,
    ) -> Self {
        Self {
            policy,
            rate_limiter,
            routes,
            stats,
            config,
        }
    }

    /// Drive one client connection to completion. Never panics and never
    /// propagates an error past this call: every failure is local to this
    /// connection.
    pub async fn handle(&self, client: TcpStream, client_addr: SocketAddr) {
        let reason = self.run(client, client_addr).await;

        if reason.is_success() {
            info!(client_addr = %client_addr, "connection closed");
        } else {
            debug!(client_addr = %client_addr, reason = reason.label(), "connection closed");
        }
    }

    async fn run(&self, mut client: TcpStream, client_addr: SocketAddr) -> CloseReason {
        // --- AwaitingHello ---
        if !self.policy.is_allowed(client_addr.ip()) {
            self.stats.record_pre_admission_failure();
            return CloseReason::IpDenied;
        }

        let source_key = client_addr.ip().to_string();
        if !self.rate_limiter.check(&source_key) {
            self.stats.record_pre_admission_failure();
            return CloseReason::RateLimited;
        }

        let preread_buf = match self.read_client_hello(&mut client).await {
            Ok(buf) => buf,
            Err(reason) => {
                self.stats.record_pre_admission_failure();
                return reason;
            }
        };

        let sni = match sni::parse(&preread_buf) {
            Some(sni) => sni,
            None => {
                self.stats.record_pre_admission_failure();
                return CloseReason::NoSni;
            }
        };

        // Recorded here, before the route-table check, so the domain is
        // counted at admission time even if the SNI is denied below.
        self.stats.record_admission(&source_key, &sni);

        let upstream = match self.routes.lookup(&sni).cloned() {
            Some(upstream) => upstream,
            None => {
                warn!(sni = %sni, client_addr = %client_addr, "SNI not in route table");
                self.stats.record_failure();
                return CloseReason::SniNotAllowed;
            }
        };

        // --- Dialing ---
        let upstream_stream = match self.dial(&upstream).await {
            Ok(stream) => stream,
            Err(()) => {
                self.stats.record_failure();
                return CloseReason::UpstreamUnreachable;
            }
        };

        let _ = client.set_nodelay(true);
        let _ = upstream_stream.set_nodelay(true);

        debug!(sni = %sni, upstream = %format!("{}:{}", upstream.host, upstream.port), client_addr = %client_addr, "splicing");

        // --- Splicing ---
        match self.splice(client, upstream_stream, preread_buf).await {
            Ok(()) => {
                self.stats.record_success();
                CloseReason::Ok
            }
            Err(()) => {
                self.stats.record_failure();
                CloseReason::TransportError
            }
        }
        // --- Closing --- (implicit: both sockets drop here, cancelling any
        // outstanding timers; stats already updated above)
    }

    /// Read into a bounded buffer until `sni::probe` reports `Complete`,
    /// enforcing the first-byte TLS check and the 16 KiB cap on every
    /// iteration. The whole phase is bounded by one absolute deadline armed
    /// before the first read, not a per-read timeout, so a peer that
    /// dribbles bytes slowly enough to always beat an individual read
    /// timeout still cannot hold the connection open indefinitely.
    async fn read_client_hello(&self, client: &mut TcpStream) -> Result<Vec<u8>, CloseReason> {
        let mut buf = Vec::new();
        let deadline = tokio::time::Instant::now() + self.config.preread_timeout;

        loop {
            let mut chunk = [0u8; READ_CHUNK];
            let n = match timeout_at(deadline, client.read(&mut chunk)).await {
                Ok(Ok(n)) => n,
                Ok(Err(_)) => return Err(CloseReason::TransportError),
                Err(_) => return Err(CloseReason::PrereadTimeout),
            };

            if n == 0 {
                // Peer closed before completing a ClientHello we could parse.
                return Err(CloseReason::NotTls);
            }

            buf.extend_from_slice(&chunk[..n]);

            if buf[0] != 0x16 {
                return Err(CloseReason::NotTls);
            }

            if buf.len() > PREREAD_CAP {
                return Err(CloseReason::HelloTooLarge);
            }

            match sni::probe(&buf) {
                Probe::Incomplete => continue,
                Probe::NotTls => return Err(CloseReason::NotTls),
                Probe::Complete(_) => return Ok(buf),
            }
        }
    }

    async fn dial(&self, upstream: &Upstream) -> Result<TcpStream, ()> {
        match timeout(
            self.config.connect_timeout,
            TcpStream::connect((upstream.host.as_str(), upstream.port)),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => {
                warn!(upstream = %upstream.host, error = %e, "upstream dial failed");
                Err(())
            }
            Err(_) => {
                warn!(upstream = %upstream.host, "upstream dial timed out");
                Err(())
            }
        }
    }

    /// Write the buffered ClientHello to upstream, then copy bytes
    /// bidirectionally until either side closes, half-closing the opposite
    /// peer and waiting a grace period before forcing both sides shut.
    async fn splice(
        &self,
        client: TcpStream,
        mut upstream: TcpStream,
        preread_buf: Vec<u8>,
    ) -> Result<(), ()> {
        if timeout(self.config.idle_timeout, upstream.write_all(&preread_buf))
            .await
            .map_err(|_| ())?
            .is_err()
        {
            return Err(());
        }

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let idle = self.config.idle_timeout;
        let mut c2u = tokio::spawn(copy_until_eof(client_read, upstream_write, idle));
        let mut u2c = tokio::spawn(copy_until_eof(upstream_read, client_write, idle));

        let (first, mut remaining) = tokio::select! {
            res = &mut c2u => (join_result(res), u2c),
            res = &mut u2c => (join_result(res), c2u),
        };

        first?;

        match timeout(HALF_CLOSE_GRACE, &mut remaining).await {
            Ok(res) => {
                join_result(res)?;
                Ok(())
            }
            Err(_) => {
                // Grace period expired: force-close by aborting the lingering
                // copy task. This still counts as a clean teardown, not a
                // transport error.
                remaining.abort();
                Ok(())
            }
        }
    }
}

fn join_result(res: Result<io::Result<()>, tokio::task::JoinError>) -> Result<(), ()> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(()),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(_) => Err(()),
    }
}

/// Copy bytes from `reader` to `writer` until EOF, error, or idle timeout.
/// A fresh timeout is armed before every read, so the idle deadline resets
/// on each byte transferred in either direction.
async fn copy_until_eof<R, W>(mut reader: R, mut writer: W, idle: Duration) -> io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = match timeout(idle, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
        };
        writer.write_all(&buf[..n]).await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}
