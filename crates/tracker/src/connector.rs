//! TCP endpoint registry with backoff-scheduled reconnection.
//!
//! One attempt task runs per registered endpoint. Successful sockets
//! are handed to the owner over a channel; the task then parks until
//! the owner reports the socket closed, at which point it retries on
//! the backoff schedule.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use e133_protocol::constants::{TCP_CONNECT_TIMEOUT, TCP_RETRY_INTERVAL};

/// Schedule for the delay between connect attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Fixed interval between attempts.
    Constant(Duration),
    /// Doubling-style backoff capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        factor: f64,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Constant(TCP_RETRY_INTERVAL)
    }
}

impl BackoffPolicy {
    /// Delay before the given attempt number (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant(interval) => *interval,
            Self::Exponential {
                initial,
                max,
                factor,
            } => {
                let exp = attempt.saturating_sub(1).min(63) as i32;
                let secs = initial.as_secs_f64() * factor.powi(exp);
                Duration::from_secs_f64(secs.min(max.as_secs_f64()))
            }
        }
    }
}

struct Endpoint {
    cancel: CancellationToken,
    retry: Arc<Notify>,
}

/// Registry of peer endpoints the owner wants connected.
pub struct Connector {
    policy: BackoffPolicy,
    connect_timeout: Duration,
    connects_tx: mpsc::UnboundedSender<(SocketAddrV4, TcpStream)>,
    endpoints: HashMap<SocketAddrV4, Endpoint>,
}

impl Connector {
    /// Creates the connector and the channel on which established
    /// sockets arrive.
    pub fn new(
        policy: BackoffPolicy,
        connect_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<(SocketAddrV4, TcpStream)>) {
        let (connects_tx, connects_rx) = mpsc::unbounded_channel();
        (
            Self {
                policy,
                connect_timeout,
                connects_tx,
                endpoints: HashMap::new(),
            },
            connects_rx,
        )
    }

    pub fn with_defaults() -> (Self, mpsc::UnboundedReceiver<(SocketAddrV4, TcpStream)>) {
        Self::new(BackoffPolicy::default(), TCP_CONNECT_TIMEOUT)
    }

    /// Begins connect attempts to `addr`. Adding a known endpoint is a
    /// no-op.
    pub fn add_endpoint(&mut self, addr: SocketAddrV4) {
        if self.endpoints.contains_key(&addr) {
            return;
        }

        let cancel = CancellationToken::new();
        let retry = Arc::new(Notify::new());
        tokio::spawn(attempt_loop(
            addr,
            self.policy.clone(),
            self.connect_timeout,
            self.connects_tx.clone(),
            cancel.clone(),
            retry.clone(),
        ));
        self.endpoints.insert(addr, Endpoint { cancel, retry });
    }

    /// Tears down the connection attempt. With `remove` the endpoint is
    /// forgotten; otherwise the attempt task retries after backoff
    /// (used when the owner observed the socket close).
    pub fn disconnect(&mut self, addr: SocketAddrV4, remove: bool) {
        if remove {
            if let Some(endpoint) = self.endpoints.remove(&addr) {
                endpoint.cancel.cancel();
            }
        } else if let Some(endpoint) = self.endpoints.get(&addr) {
            endpoint.retry.notify_one();
        }
    }

    pub fn has_endpoint(&self, addr: SocketAddrV4) -> bool {
        self.endpoints.contains_key(&addr)
    }

    pub fn shutdown(&mut self) {
        for (_, endpoint) in self.endpoints.drain() {
            endpoint.cancel.cancel();
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn attempt_loop(
    addr: SocketAddrV4,
    policy: BackoffPolicy,
    connect_timeout: Duration,
    connects_tx: mpsc::UnboundedSender<(SocketAddrV4, TcpStream)>,
    cancel: CancellationToken,
    retry: Arc<Notify>,
) {
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);

        let connect = tokio::time::timeout(connect_timeout, TcpStream::connect(SocketAddr::V4(addr)));
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = connect => match result {
                Ok(Ok(stream)) => {
                    debug!(peer = %addr, "connected");
                    if connects_tx.send((addr, stream)).is_err() {
                        return;
                    }
                    // Park until the owner reports the socket closed.
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = retry.notified() => attempt = 0,
                    }
                }
                Ok(Err(e)) => warn!(peer = %addr, attempt, "connect failed: {e}"),
                Err(_) => warn!(peer = %addr, attempt, "connect timed out"),
            }
        }

        let delay = policy.delay_for_attempt(attempt.max(1));
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
