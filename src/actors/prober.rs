//! Prober - one bounded HTTP request per invocation
//!
//! ## Classification
//!
//! | Outcome                                  | Result                       |
//! |------------------------------------------|------------------------------|
//! | response with `expected_status`          | up                           |
//! | response with any other status           | down, `unexpected-status`    |
//! | no response within the monitor timeout   | down, `timeout`              |
//! | host name did not resolve                | down, `dns-failure`          |
//! | TCP connect failed                       | down, `connection-refused`   |
//! | anything else (TLS, redirect loop, ...)  | down, `request-error`        |
//!
//! Latency is measured from dispatch until the response headers arrived; the
//! body is never read. The prober never retries, one invocation is exactly one
//! `CheckResult`.

use std::error::Error as _;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{instrument, trace, warn};

use crate::monitor::{CheckError, CheckResult, MonitorConfig};

/// Anything that can turn a monitor snapshot into a check result
///
/// The scheduler is generic over this so tests can substitute a scripted
/// prober for the network.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn probe(&self, config: &MonitorConfig) -> CheckResult;
}

/// reqwest-backed prober
#[derive(Debug, Clone)]
pub struct HttpProber {
    /// Shared client (connection pool reused across probes)
    client: reqwest::Client,
}

impl HttpProber {
    /// Build a prober
    ///
    /// `connect_timeout` applies to the TCP/TLS handshake. Each request is
    /// additionally bounded by its monitor's `timeout`, so the effective
    /// connect timeout is the smaller of the two.
    pub fn new(user_agent: &str, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { client })
    }

    fn classify(error: &reqwest::Error, timeout_secs: u64) -> (CheckError, String) {
        if error.is_timeout() {
            return (
                CheckError::Timeout,
                format!("Request timeout after {timeout_secs}s"),
            );
        }

        let detail = error_chain(error);

        if is_dns_error(error) {
            (CheckError::DnsFailure, format!("DNS lookup failed: {detail}"))
        } else if error.is_connect() {
            (CheckError::ConnectionRefused, format!("Network error: {detail}"))
        } else {
            (CheckError::RequestError, format!("Request error: {detail}"))
        }
    }
}

#[async_trait]
impl Probe for HttpProber {
    #[instrument(skip(self, config), fields(monitor_id = config.id, url = %config.url))]
    async fn probe(&self, config: &MonitorConfig) -> CheckResult {
        let timeout = Duration::from_secs(config.timeout);

        let mut request = self
            .client
            .request(config.method.into(), &config.url)
            .timeout(timeout);
        for (name, value) in &config.headers {
            request = request.header(name, value);
        }

        let dispatched_at = Utc::now();
        let start = Instant::now();

        // the request timeout already covers this, the outer one makes the
        // bound independent of the HTTP stack
        let outcome = tokio::time::timeout(timeout, request.send()).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                trace!("received {status} after {latency_ms}ms");
                if status == config.expected_status {
                    CheckResult::up(config.id, status, latency_ms)
                } else {
                    CheckResult::unexpected_status(
                        config.id,
                        config.expected_status,
                        status,
                        latency_ms,
                    )
                }
            }
            Ok(Err(e)) => {
                let (error, message) = Self::classify(&e, config.timeout);
                warn!("probe failed ({error}): {message}");
                CheckResult::down(config.id, error, message)
            }
            Err(_) => {
                warn!("probe exceeded {}s", config.timeout);
                CheckResult::down(
                    config.id,
                    CheckError::Timeout,
                    format!("Request timeout after {}s", config.timeout),
                )
            }
        };

        result.at(dispatched_at)
    }
}

/// Render an error with all of its sources
fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_message = cause.to_string();
        if !message.contains(&cause_message) {
            message.push_str(": ");
            message.push_str(&cause_message);
        }
        source = cause.source();
    }
    message
}

/// reqwest has no dedicated DNS flag; hyper's resolver errors say "dns error"
fn is_dns_error(error: &reqwest::Error) -> bool {
    let mut source = error.source();
    while let Some(cause) = source {
        let message = cause.to_string().to_ascii_lowercase();
        if message.contains("dns error") || message.contains("failed to lookup address") {
            return true;
        }
        source = cause.source();
    }
    false
}
