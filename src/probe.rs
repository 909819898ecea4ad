//! Reachability probes.
//!
//! A [`Probe`] performs a single attempt; [`run_probe`] wraps it with the
//! timeout and fixed-delay retry policy from [`ProbeConfig`] and always
//! yields a [`ProbeOutcome`]. Failures are data here, never errors.

use crate::model::{ErrorCategory, ProbeConfig, ProbeOutcome, Protocol, Target};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration, Instant};
use trust_dns_resolver::TokioAsyncResolver;

pub const MIN_RETRIES: u32 = 1;
pub const MAX_RETRIES: u32 = 5;
pub const MIN_RETRY_DELAY_MS: u64 = 500;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("network error: {0}")]
    Network(String),
    #[error("DNS error: {0}")]
    Dns(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("unexpected HTTP status {0}")]
    Http(u16),
    #[error("HTTP {status}: {detail}")]
    Content { status: u16, detail: String },
    #[error("invalid target configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Unknown(String),
}

impl ProbeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProbeError::Network(_) => ErrorCategory::Network,
            ProbeError::Dns(_) => ErrorCategory::Dns,
            ProbeError::Timeout(_) => ErrorCategory::Timeout,
            ProbeError::Http(_) => ErrorCategory::Http,
            ProbeError::Content { .. } => ErrorCategory::Content,
            ProbeError::Config(_) => ErrorCategory::Config,
            ProbeError::Unknown(_) => ErrorCategory::Unknown,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProbeError::Http(status) | ProbeError::Content { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// A broken target definition will not fix itself between attempts.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProbeError::Config(_))
    }
}

/// Result of one successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub latency_ms: u64,
    pub status_code: Option<u16>,
}

#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    async fn attempt(&self, target: &Target, config: &ProbeConfig) -> Result<Attempt, ProbeError>;
}

/// Probe `target` with up to `config.retries` sequential attempts, waiting a
/// fixed `retry_delay_ms` between them.
pub async fn run_probe(probe: &dyn Probe, target: &Target, config: &ProbeConfig) -> ProbeOutcome {
    let retries = config.retries.clamp(MIN_RETRIES, MAX_RETRIES);
    let delay = Duration::from_millis(config.retry_delay_ms.max(MIN_RETRY_DELAY_MS));
    let timeout = Duration::from_millis(config.timeout_ms);

    let mut attempts = 0;
    loop {
        attempts += 1;
        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, probe.attempt(target, config)).await {
            Ok(r) => r,
            Err(_) => Err(ProbeError::Timeout(format!("no answer within {}ms", config.timeout_ms))),
        };

        match result {
            Ok(ok) => {
                return ProbeOutcome {
                    target_id: target.id.clone(),
                    timestamp: Utc::now(),
                    success: true,
                    latency_ms: ok.latency_ms,
                    status_code: ok.status_code,
                    error_category: None,
                    attempts_used: attempts,
                    message: None,
                };
            }
            Err(e) => {
                tracing::debug!("Probe attempt {}/{} for {} failed: {}", attempts, retries, target.id, e);
                if !e.is_retryable() || attempts >= retries {
                    return ProbeOutcome {
                        target_id: target.id.clone(),
                        timestamp: Utc::now(),
                        success: false,
                        latency_ms: elapsed_ms(start),
                        status_code: e.status_code(),
                        error_category: Some(e.category()),
                        attempts_used: attempts,
                        message: Some(e.to_string()),
                    };
                }
                sleep(delay).await;
            }
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Dispatches to the protocol specific probe.
pub struct NetworkProbe;

#[async_trait::async_trait]
impl Probe for NetworkProbe {
    async fn attempt(&self, target: &Target, config: &ProbeConfig) -> Result<Attempt, ProbeError> {
        match target.protocol {
            Protocol::Tcp => TcpProbe.attempt(target, config).await,
            Protocol::Http | Protocol::Https => HttpProbe.attempt(target, config).await,
        }
    }
}

pub struct TcpProbe;

#[async_trait::async_trait]
impl Probe for TcpProbe {
    async fn attempt(&self, target: &Target, _config: &ProbeConfig) -> Result<Attempt, ProbeError> {
        let host = validate_host(target)?;
        let port = match target.port {
            Some(p) if p != 0 => p,
            _ => return Err(ProbeError::Config(format!("tcp target {} has no port", target.id))),
        };
        if target.path.is_some() || target.expected_status_codes.is_some() || target.expected_content.is_some() {
            return Err(ProbeError::Config("HTTP expectations on a tcp target".into()));
        }

        let addr = resolve(host, port).await?;
        let start = Instant::now();
        TcpStream::connect(addr).await.map_err(classify_io)?;
        Ok(Attempt { latency_ms: elapsed_ms(start), status_code: None })
    }
}

static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true) // Allow self-signed certs for monitoring flexibility
        .no_gzip()
        .user_agent(concat!("ReachWatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("Failed to build HTTP client")
});

pub struct HttpProbe;

#[async_trait::async_trait]
impl Probe for HttpProbe {
    async fn attempt(&self, target: &Target, config: &ProbeConfig) -> Result<Attempt, ProbeError> {
        let host = validate_host(target)?;
        let port = target
            .effective_port()
            .filter(|p| *p != 0)
            .ok_or_else(|| ProbeError::Config(format!("invalid port for {}", target.id)))?;
        let url = build_url(target, host, port)?;
        let pattern = match &target.expected_content {
            Some(p) => Some(Regex::new(p).map_err(|e| ProbeError::Config(format!("bad content pattern: {}", e)))?),
            None => None,
        };
        if let Some(codes) = &target.expected_status_codes {
            if let Some(bad) = codes.iter().find(|c| !(100..=599).contains(*c)) {
                return Err(ProbeError::Config(format!("invalid expected status code {}", bad)));
            }
        }

        // Resolve up front so name resolution failures are reported as DNS.
        resolve(host, port).await?;

        let start = Instant::now();
        let res = HTTP_CLIENT
            .get(url)
            .timeout(Duration::from_millis(config.timeout_ms))
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = res.status().as_u16();
        let expected = match &target.expected_status_codes {
            Some(codes) if !codes.is_empty() => codes.contains(&status),
            _ => res.status().is_success(),
        };
        if !expected {
            return Err(ProbeError::Http(status));
        }

        if let Some(re) = pattern {
            let body = res.text().await.map_err(classify_reqwest)?;
            if !re.is_match(&body) {
                return Err(ProbeError::Content {
                    status,
                    detail: format!("body does not match /{}/", re.as_str()),
                });
            }
        }

        Ok(Attempt { latency_ms: elapsed_ms(start), status_code: Some(status) })
    }
}

fn validate_host(target: &Target) -> Result<&str, ProbeError> {
    let host = target.address.trim();
    if host.is_empty() {
        return Err(ProbeError::Config(format!("target {} has an empty address", target.id)));
    }
    if host.contains("://") || host.contains('/') || host.chars().any(char::is_whitespace) {
        return Err(ProbeError::Config(format!("unparsable address '{}'", target.address)));
    }
    Ok(host)
}

fn build_url(target: &Target, host: &str, port: u16) -> Result<reqwest::Url, ProbeError> {
    let scheme = match target.protocol {
        Protocol::Https => "https",
        _ => "http",
    };
    let path = target.path.as_deref().unwrap_or("/");
    if !path.starts_with('/') {
        return Err(ProbeError::Config(format!("path '{}' must start with '/'", path)));
    }
    let host = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{}]", v6),
        _ => host.to_string(),
    };
    reqwest::Url::parse(&format!("{}://{}:{}{}", scheme, host, port, path))
        .map_err(|e| ProbeError::Config(format!("invalid url: {}", e)))
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let resolver = TokioAsyncResolver::tokio_from_system_conf()
        .map_err(|e| ProbeError::Dns(format!("resolver init failed: {}", e)))?;
    let ips = resolver.lookup_ip(host).await.map_err(|e| ProbeError::Dns(e.to_string()))?;
    ips.iter()
        .next()
        .map(|ip| SocketAddr::new(ip, port))
        .ok_or_else(|| ProbeError::Dns(format!("no address for {}", host)))
}

pub(crate) fn classify_io(e: io::Error) -> ProbeError {
    use io::ErrorKind::*;
    match e.kind() {
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | BrokenPipe
        | AddrNotAvailable | HostUnreachable | NetworkUnreachable | NetworkDown => {
            ProbeError::Network(e.to_string())
        }
        TimedOut => ProbeError::Timeout(e.to_string()),
        _ => ProbeError::Unknown(e.to_string()),
    }
}

fn classify_reqwest(e: reqwest::Error) -> ProbeError {
    if e.is_timeout() {
        return ProbeError::Timeout(e.to_string());
    }
    if e.is_builder() {
        return ProbeError::Config(e.to_string());
    }
    if e.is_connect() {
        // The underlying io error tells refused from unreachable from timed out.
        let mut source = std::error::Error::source(&e);
        while let Some(err) = source {
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                return match classify_io(io::Error::new(io_err.kind(), e.to_string())) {
                    ProbeError::Unknown(msg) => ProbeError::Network(msg),
                    other => other,
                };
            }
            source = err.source();
        }
        return ProbeError::Network(e.to_string());
    }
    ProbeError::Unknown(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use std::collections::{BTreeSet, VecDeque};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    struct ScriptedProbe {
        script: Mutex<VecDeque<Result<Attempt, ProbeError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedProbe {
        fn new(script: Vec<Result<Attempt, ProbeError>>) -> Self {
            Self { script: Mutex::new(script.into()), calls: Mutex::new(0) }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl Probe for ScriptedProbe {
        async fn attempt(&self, _target: &Target, _config: &ProbeConfig) -> Result<Attempt, ProbeError> {
            *self.calls.lock().unwrap() += 1;
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProbeError::Unknown("script exhausted".into())))
        }
    }

    struct HangingProbe;

    #[async_trait::async_trait]
    impl Probe for HangingProbe {
        async fn attempt(&self, _target: &Target, _config: &ProbeConfig) -> Result<Attempt, ProbeError> {
            std::future::pending().await
        }
    }

    fn refused() -> Result<Attempt, ProbeError> {
        Err(ProbeError::Network("Connection refused (os error 111)".into()))
    }

    fn probe_config(retries: u32) -> ProbeConfig {
        ProbeConfig { timeout_ms: 1000, retries, retry_delay_ms: 500 }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_third_attempt() {
        let probe = ScriptedProbe::new(vec![
            refused(),
            refused(),
            Ok(Attempt { latency_ms: 120, status_code: None }),
        ]);
        let target = Target::tcp("db1", 5432);

        let started = Instant::now();
        let outcome = run_probe(&probe, &target, &probe_config(3)).await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts_used, 3);
        assert_eq!(outcome.latency_ms, 120);
        assert_eq!(outcome.error_category, None);
        assert_eq!(outcome.target_id, "db1:5432");
        // two fixed delays, no backoff
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_retries() {
        let probe = ScriptedProbe::new(vec![refused(), refused(), refused(), refused()]);
        let outcome = run_probe(&probe, &Target::tcp("db1", 5432), &probe_config(3)).await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts_used, 3);
        assert_eq!(probe.calls(), 3);
        assert_eq!(outcome.error_category, Some(ErrorCategory::Network));
        assert!(outcome.message.unwrap().contains("refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_error_fails_fast() {
        let probe = ScriptedProbe::new(vec![Err(ProbeError::Config("bad".into())), refused()]);
        let outcome = run_probe(&probe, &Target::tcp("db1", 5432), &probe_config(5)).await;

        assert_eq!(outcome.attempts_used, 1);
        assert_eq!(probe.calls(), 1);
        assert_eq!(outcome.error_category, Some(ErrorCategory::Config));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bounds_are_clamped() {
        let probe = ScriptedProbe::new(vec![refused(); 10]);
        let outcome = run_probe(&probe, &Target::tcp("db1", 5432), &probe_config(9)).await;
        assert_eq!(outcome.attempts_used, MAX_RETRIES);

        let probe = ScriptedProbe::new(vec![refused(); 10]);
        let outcome = run_probe(&probe, &Target::tcp("db1", 5432), &probe_config(0)).await;
        assert_eq!(outcome.attempts_used, MIN_RETRIES);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout() {
        let outcome = run_probe(&HangingProbe, &Target::tcp("db1", 5432), &probe_config(2)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts_used, 2);
        assert_eq!(outcome.error_category, Some(ErrorCategory::Timeout));
    }

    #[test]
    fn test_classify_io() {
        let e = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(classify_io(e).category(), ErrorCategory::Network);
        let e = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(classify_io(e).category(), ErrorCategory::Timeout);
        let e = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(classify_io(e).category(), ErrorCategory::Unknown);
    }

    #[tokio::test]
    async fn test_tcp_probe_open_and_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let target = Target::tcp("127.0.0.1", open);
        let outcome = run_probe(&NetworkProbe, &target, &probe_config(1)).await;
        assert!(outcome.success, "{:?}", outcome.message);

        // grab a free port and close it again
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let outcome = run_probe(&NetworkProbe, &Target::tcp("127.0.0.1", closed), &probe_config(1)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_category, Some(ErrorCategory::Network));
    }

    #[tokio::test]
    async fn test_malformed_targets_are_config_errors() {
        let mut no_port = Target::tcp("127.0.0.1", 1);
        no_port.port = None;
        let mut bad_addr = Target::tcp("not a host", 22);
        bad_addr.id = "bad".into();
        let mut url_addr = Target::tcp("http://example.com", 80);
        url_addr.id = "url".into();

        for target in [no_port, bad_addr, url_addr] {
            let outcome = run_probe(&NetworkProbe, &target, &probe_config(3)).await;
            assert_eq!(outcome.error_category, Some(ErrorCategory::Config), "{}", target.id);
            assert_eq!(outcome.attempts_used, 1);
        }
    }

    async fn spawn_http() -> u16 {
        let app = Router::new()
            .route("/health", get(|| async { "status: ok" }))
            .route("/down", get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn http_target(port: u16, path: &str) -> Target {
        Target {
            id: format!("web{}", path),
            address: "127.0.0.1".into(),
            port: Some(port),
            protocol: Protocol::Http,
            path: Some(path.into()),
            expected_status_codes: None,
            expected_content: None,
        }
    }

    #[tokio::test]
    async fn test_http_probe_expectations() {
        let port = spawn_http().await;
        let cfg = probe_config(1);

        let outcome = run_probe(&NetworkProbe, &http_target(port, "/health"), &cfg).await;
        assert!(outcome.success, "{:?}", outcome.message);
        assert_eq!(outcome.status_code, Some(200));

        let outcome = run_probe(&NetworkProbe, &http_target(port, "/down"), &cfg).await;
        assert_eq!(outcome.error_category, Some(ErrorCategory::Http));
        assert_eq!(outcome.status_code, Some(503));

        let mut accepts_503 = http_target(port, "/down");
        accepts_503.expected_status_codes = Some(BTreeSet::from([503]));
        let outcome = run_probe(&NetworkProbe, &accepts_503, &cfg).await;
        assert!(outcome.success);

        let mut wants_content = http_target(port, "/health");
        wants_content.expected_content = Some("status: (ok|degraded)".into());
        assert!(run_probe(&NetworkProbe, &wants_content, &cfg).await.success);

        wants_content.expected_content = Some("^ready$".into());
        let outcome = run_probe(&NetworkProbe, &wants_content, &cfg).await;
        assert_eq!(outcome.error_category, Some(ErrorCategory::Content));

        wants_content.expected_content = Some("([unclosed".into());
        let outcome = run_probe(&NetworkProbe, &wants_content, &cfg).await;
        assert_eq!(outcome.error_category, Some(ErrorCategory::Config));
    }
}
