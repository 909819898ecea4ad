use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use uuid::Uuid;

pub const FLEET_SCOPE: &str = "FLEET";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Http,
    Https,
}

impl Protocol {
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Protocol::Tcp => None,
            Protocol::Http => Some(80),
            Protocol::Https => Some(443),
        }
    }
}

/// A monitored endpoint. Built from configuration and never mutated by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    #[serde(default)]
    pub id: String,
    pub address: String, // IP or Domain
    #[serde(default)]
    pub port: Option<u16>, // http/https fall back to 80/443
    #[serde(default = "default_proto")]
    pub protocol: Protocol,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub expected_status_codes: Option<BTreeSet<u16>>,
    /// Regex the response body must match.
    #[serde(default)]
    pub expected_content: Option<String>,
}

fn default_proto() -> Protocol { Protocol::Tcp }

impl Target {
    pub fn tcp(address: &str, port: u16) -> Self {
        Self {
            id: format!("{}:{}", address, port),
            address: address.to_string(),
            port: Some(port),
            protocol: Protocol::Tcp,
            path: None,
            expected_status_codes: None,
            expected_content: None,
        }
    }

    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.protocol.default_port())
    }

    /// Stable identifier used when the configuration does not name the target.
    pub fn derived_id(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.address, port),
            None => self.address.clone(),
        }
    }
}

/// Failure taxonomy for a probe. Aggregated by the metric sink; the state
/// tracker only looks at success/failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorCategory {
    Network,
    Dns,
    Timeout,
    Http,
    Content,
    Config,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 7] = [
        ErrorCategory::Network,
        ErrorCategory::Dns,
        ErrorCategory::Timeout,
        ErrorCategory::Http,
        ErrorCategory::Content,
        ErrorCategory::Config,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::Dns => "DNS",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::Http => "HTTP",
            ErrorCategory::Content => "CONTENT",
            ErrorCategory::Config => "CONFIG",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeOutcome {
    pub target_id: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: u64,
    pub status_code: Option<u16>,
    pub error_category: Option<ErrorCategory>,
    pub attempts_used: u32,
    pub message: Option<String>, // 错误信息
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RawStatus {
    Online,
    Offline,
}

impl RawStatus {
    pub fn from_success(success: bool) -> Self {
        if success { RawStatus::Online } else { RawStatus::Offline }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RawStatus::Online => "ONLINE",
            RawStatus::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for RawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a target's rolling history. `success == None` means the run
/// produced no data for the target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeSample {
    pub timestamp: DateTime<Utc>,
    pub success: Option<bool>,
    pub latency_ms: Option<u64>,
}

impl ProbeSample {
    pub fn observed(outcome: &ProbeOutcome) -> Self {
        Self {
            timestamp: outcome.timestamp,
            success: Some(outcome.success),
            latency_ms: outcome.success.then_some(outcome.latency_ms),
        }
    }

    pub fn missing(timestamp: DateTime<Utc>) -> Self {
        Self { timestamp, success: None, latency_ms: None }
    }
}

/// Per-target durable state, persisted across runs.
///
/// Exactly one of `consecutive_failures` / `consecutive_successes` is non-zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceState {
    pub target_id: String,
    pub raw_status: RawStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_change: DateTime<Utc>,
    #[serde(default)]
    pub last_notified_raw_status: Option<RawStatus>,
    #[serde(default)]
    pub last_error: Option<ErrorCategory>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub history: VecDeque<ProbeSample>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmTier {
    Normal,
    Warning,
    Escalated,
}

impl AlarmTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmTier::Normal => "NORMAL",
            AlarmTier::Warning => "WARNING",
            AlarmTier::Escalated => "ESCALATED",
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            AlarmTier::Normal => 0,
            AlarmTier::Warning => 1,
            AlarmTier::Escalated => 2,
        }
    }
}

impl fmt::Display for AlarmTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    Reachability,
    Latency,
    SuccessRate,
    Fleet,
}

impl AlarmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmKind::Reachability => "reachability",
            AlarmKind::Latency => "latency",
            AlarmKind::SuccessRate => "success_rate",
            AlarmKind::Fleet => "fleet",
        }
    }
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Thresholds {
    pub alarm_threshold: u32,
    pub escalation_threshold: u32,
    pub enable_escalation: bool,
}

/// Escalation tier of one alarm. Always recomputed from `DeviceState`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmState {
    pub scope: String,
    pub kind: AlarmKind,
    pub tier: AlarmTier,
    pub entered_at: DateTime<Utc>,
    /// Consecutive breaching periods that produced `tier`.
    pub streak: u32,
    pub thresholds: Thresholds,
}

impl AlarmState {
    pub fn key(kind: AlarmKind, scope: &str) -> String {
        format!("{}:{}", kind.as_str(), scope)
    }
}

// ---------------------------------------------------------------- config

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    pub timeout_ms: u64,
    pub retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { timeout_ms: 5000, retries: 3, retry_delay_ms: 1000 }
    }
}

/// How a period without data counts for an alarm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissingDataPolicy {
    Breaching,
    NotBreaching,
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReachabilityAlarmConfig {
    pub enabled: bool,
    #[serde(alias = "evaluation_periods")]
    pub alarm_threshold: u32,
    pub escalation_threshold: u32,
    pub enable_escalation: bool,
    pub missing_data: MissingDataPolicy,
}

impl Default for ReachabilityAlarmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alarm_threshold: 2,
            escalation_threshold: 5,
            enable_escalation: true,
            missing_data: MissingDataPolicy::Breaching,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LatencyAlarmConfig {
    pub enabled: bool,
    pub threshold_ms: u64,
    #[serde(alias = "evaluation_periods")]
    pub alarm_threshold: u32,
    pub escalation_threshold: u32,
    pub enable_escalation: bool,
    pub missing_data: MissingDataPolicy,
}

impl Default for LatencyAlarmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_ms: 5000,
            alarm_threshold: 3,
            escalation_threshold: 6,
            enable_escalation: false,
            missing_data: MissingDataPolicy::NotBreaching,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SuccessRateAlarmConfig {
    pub enabled: bool,
    pub min_rate: f64,
    /// Samples per rolling window.
    pub window: usize,
    #[serde(alias = "evaluation_periods")]
    pub alarm_threshold: u32,
    pub escalation_threshold: u32,
    pub enable_escalation: bool,
    pub missing_data: MissingDataPolicy,
}

impl Default for SuccessRateAlarmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_rate: 0.8,
            window: 10,
            alarm_threshold: 2,
            escalation_threshold: 4,
            enable_escalation: false,
            missing_data: MissingDataPolicy::Breaching,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetAlarmConfig {
    pub enabled: bool,
}

impl Default for FleetAlarmConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

macro_rules! impl_thresholds {
    ($($ty:ty),*) => {
        $(impl $ty {
            pub fn thresholds(&self) -> Thresholds {
                Thresholds {
                    alarm_threshold: self.alarm_threshold,
                    escalation_threshold: self.escalation_threshold,
                    enable_escalation: self.enable_escalation,
                }
            }
        })*
    };
}

impl_thresholds!(ReachabilityAlarmConfig, LatencyAlarmConfig, SuccessRateAlarmConfig);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AlarmsConfig {
    pub reachability: ReachabilityAlarmConfig,
    pub latency: LatencyAlarmConfig,
    pub success_rate: SuccessRateAlarmConfig,
    pub fleet: FleetAlarmConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Webhook,
    Slack,
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    #[serde(default = "generate_uuid")]
    pub id: String,
    pub name: String,
    pub kind: ChannelKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub template: Option<String>, // Optional override
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn generate_uuid() -> String {
    Uuid::new_v4().to_string()
}

fn default_true() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Also notify on raw ONLINE/OFFLINE flips, not only on tier changes.
    #[serde(default)]
    pub notify_on_status_change: bool,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self { enabled: true, notify_on_status_change: false, channels: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    Log,
    JsonLines { path: String },
    Textfile { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    pub namespace: String,
    pub batch_size: usize,
    pub sink: SinkConfig,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: "ReachWatch".to_string(),
            batch_size: 20,
            sink: SinkConfig::Log,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub concurrency: usize,
    /// Overall budget for probing; unprobed targets count as missing data.
    pub deadline_ms: Option<u64>,
    pub state_path: String,
    pub history_len: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            deadline_ms: None,
            state_path: "state.json".to_string(),
            history_len: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub targets: Vec<Target>,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub alarms: AlarmsConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub run: RunConfig,
}
