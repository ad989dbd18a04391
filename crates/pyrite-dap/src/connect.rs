//! Reaching an embedded debug server: one [`WireClient::connect`] attempt at a
//! time, retried with exponential backoff until an overall deadline.

use std::net::SocketAddr;
use std::time::Duration;

use pyrite_config::DebuggerConfig;
use pyrite_wire::{EventReceiver, WireClient, WireClientConfig, WireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SessionError};

/// Hosts that name the local machine.
pub fn is_local_host(host: &str) -> bool {
    let host = host.trim();
    host.is_empty()
        || host.eq_ignore_ascii_case("localhost")
        || host == "127.0.0.1"
        || host == "::1"
        || host == "[::1]"
}

#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    /// Budget for the whole connect loop, retries and handshake included.
    pub timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub client: WireClientConfig,
}

impl ConnectPolicy {
    pub fn from_config(config: &DebuggerConfig, timeout: Duration) -> Self {
        Self {
            timeout,
            backoff_initial: config.backoff_initial(),
            backoff_max: config.backoff_max(),
            client: WireClientConfig {
                connect_timeout: config.connect_timeout(),
                handshake_timeout: config.handshake_timeout(),
                reply_timeout: config.reply_timeout(),
            },
        }
    }

    /// Delay before the attempt following one that waited `previous`.
    pub fn next_delay(&self, previous: Duration) -> Duration {
        previous.saturating_mul(2).min(self.backoff_max)
    }
}

async fn resolve(host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
    // Pin local names to IPv4 loopback; `localhost` may resolve to `::1` first
    // while debug servers commonly bind 127.0.0.1 only.
    let host = if host.is_empty() || host.eq_ignore_ascii_case("localhost") {
        "127.0.0.1"
    } else {
        host.trim_start_matches('[').trim_end_matches(']')
    };
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("{host} did not resolve to any address"),
        ));
    }
    Ok(addrs)
}

enum Attempt {
    Connected(WireClient, EventReceiver),
    Retry(WireError),
    Fatal(WireError),
}

async fn attempt(host: &str, port: u16, config: &WireClientConfig) -> Attempt {
    let addrs = match resolve(host, port).await {
        Ok(addrs) => addrs,
        // Name resolution can fail transiently while a container or VM starts.
        Err(err) => return Attempt::Retry(WireError::Io(err)),
    };

    let mut last = WireError::ConnectionClosed;
    for addr in addrs {
        match WireClient::connect(addr, config.clone()).await {
            Ok((client, events)) => return Attempt::Connected(client, events),
            Err(err) if err.is_retryable_connect_error() => last = err,
            Err(err) => return Attempt::Fatal(err),
        }
    }
    Attempt::Retry(last)
}

/// Connects to `host:port`, retrying refused or unreachable attempts until
/// `policy.timeout` elapses. Dropping the in-flight attempt on timeout or
/// cancellation closes its socket.
pub async fn connect_with_retry(
    host: &str,
    port: u16,
    policy: &ConnectPolicy,
    cancel: &CancellationToken,
) -> Result<(WireClient, EventReceiver)> {
    let deadline = Instant::now() + policy.timeout;

    let attempts = async {
        let mut delay = policy.backoff_initial;
        let mut tries = 0u32;
        loop {
            tries += 1;
            match attempt(host, port, &policy.client).await {
                Attempt::Connected(client, events) => {
                    tracing::debug!(
                        target = "pyrite.dap",
                        host,
                        port,
                        tries,
                        "connected to debug server"
                    );
                    return Ok((client, events));
                }
                Attempt::Fatal(source) => {
                    return Err(SessionError::Connect {
                        host: host.to_string(),
                        port,
                        source,
                    });
                }
                Attempt::Retry(err) => {
                    tracing::trace!(
                        target = "pyrite.dap",
                        host,
                        port,
                        tries,
                        error = %err,
                        "debug server not reachable yet"
                    );
                }
            }
            tokio::time::sleep(delay).await;
            delay = policy.next_delay(delay);
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        res = tokio::time::timeout_at(deadline, attempts) => match res {
            Ok(res) => res,
            Err(_elapsed) => Err(SessionError::ConnectTimeout {
                host: host.to_string(),
                port,
                timeout_ms: policy.timeout.as_millis(),
            }),
        },
    }
}
