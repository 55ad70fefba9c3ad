//! Health check probe logic.
//!
//! Performs HTTP liveness checks against instance endpoints and debounces
//! the results with consecutive-success/failure thresholds.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, warn};

use edgeshift_state::HealthState;

/// Boxed future returned by [`LivenessProbe`] implementations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint answered with non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error, timeout).
    Failed,
}

/// Probe timing and thresholds.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// HTTP path to probe.
    pub endpoint: String,
    /// Interval between probes.
    pub interval: Duration,
    /// Timeout per probe.
    pub timeout: Duration,
    /// Consecutive successes before an instance is healthy.
    pub healthy_threshold: u32,
    /// Consecutive failures before an instance is unhealthy.
    pub unhealthy_threshold: u32,
    /// Cap on the retry backoff after transient failures.
    pub max_backoff: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            endpoint: "/healthz".to_string(),
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(1),
            healthy_threshold: 3,
            unhealthy_threshold: 3,
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Something that can check whether an endpoint is alive.
pub trait LivenessProbe: Send + Sync {
    fn check<'a>(&'a self, address: &'a str) -> BoxFuture<'a, ProbeResult>;
}

/// `GET {path}` over HTTP/1; 2xx means alive.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    path: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(path: &str, timeout: Duration) -> Self {
        Self {
            path: path.to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(&config.endpoint, config.timeout)
    }
}

impl LivenessProbe for HttpProbe {
    fn check<'a>(&'a self, address: &'a str) -> BoxFuture<'a, ProbeResult> {
        Box::pin(http_probe(address, &self.path, self.timeout))
    }
}

/// Tracks consecutive probe results for a single instance.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
    /// Delay before the next probe.
    current_backoff: Duration,
    base_interval: Duration,
    max_backoff: Duration,
}

impl HealthTracker {
    /// Create a tracker for an instance currently in `initial` health.
    pub fn new(config: &ProbeConfig, initial: HealthState) -> Self {
        Self {
            status: initial,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: config.unhealthy_threshold.max(1),
            healthy_threshold: config.healthy_threshold.max(1),
            current_backoff: config.interval,
            base_interval: config.interval,
            max_backoff: config.max_backoff.max(config.interval),
        }
    }

    /// Record a probe result and return the (possibly new) health state.
    pub fn record(&mut self, result: ProbeResult) -> HealthState {
        match result {
            ProbeResult::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                self.current_backoff = self.base_interval;

                if self.consecutive_successes >= self.healthy_threshold
                    && self.status != HealthState::Healthy
                {
                    debug!(successes = self.consecutive_successes, "instance became healthy");
                    self.status = HealthState::Healthy;
                }
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;

                self.current_backoff = if result == ProbeResult::Failed {
                    // Transient: retry with exponential backoff.
                    (self.current_backoff * 2).min(self.max_backoff)
                } else {
                    self.base_interval
                };

                if self.consecutive_failures >= self.unhealthy_threshold
                    && self.status != HealthState::Unhealthy
                {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.unhealthy_threshold,
                        "instance marked unhealthy"
                    );
                    self.status = HealthState::Unhealthy;
                }
            }
        }

        self.status
    }

    pub fn status(&self) -> HealthState {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Delay before the next probe.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "edgeshift-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request malformed");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}
