use crate::model::{
    AlarmKind, AlarmState, AlarmTier, AlertConfig, ChannelConfig, ChannelKind, DeviceState, ErrorCategory, RawStatus,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    Status { old: RawStatus, new: RawStatus },
    Tier { alarm: AlarmKind, old: AlarmTier, new: AlarmTier },
}

/// An edge worth telling a human about.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Transition {
    pub scope: String,
    pub change: Change,
    pub at: DateTime<Utc>,
    /// Breaching streak behind the change: failed checks for reachability,
    /// slow or low-success periods for latency and success rate.
    pub consecutive_failures: u32,
    pub error_category: Option<ErrorCategory>,
    pub detail: Option<String>,
}

impl Transition {
    pub fn old_label(&self) -> &'static str {
        match self.change {
            Change::Status { old, .. } => old.as_str(),
            Change::Tier { old, .. } => old.as_str(),
        }
    }

    pub fn new_label(&self) -> &'static str {
        match self.change {
            Change::Status { new, .. } => new.as_str(),
            Change::Tier { new, .. } => new.as_str(),
        }
    }

    fn headline(&self) -> String {
        match self.change {
            Change::Status { new: RawStatus::Online, .. } => "🟢 UP".to_string(),
            Change::Status { new: RawStatus::Offline, .. } => "🔴 DOWN".to_string(),
            Change::Tier { new: AlarmTier::Normal, .. } => "🟢 RECOVERED".to_string(),
            Change::Tier { new: AlarmTier::Warning, .. } => "🟠 WARNING".to_string(),
            Change::Tier { new: AlarmTier::Escalated, .. } => "🔴 ESCALATED".to_string(),
        }
    }

    pub fn message(&self) -> String {
        let timestamp = self.at.format("%Y-%m-%d %H:%M:%S UTC");
        let subject = match self.change {
            Change::Status { .. } => self.scope.clone(),
            Change::Tier { alarm, .. } => format!("{} alarm for {}", alarm, self.scope),
        };
        let mut msg = format!(
            "{} {}: {} -> {} at {}",
            self.headline(),
            subject,
            self.old_label(),
            self.new_label(),
            timestamp
        );
        let recovering = matches!(
            self.change,
            Change::Status { new: RawStatus::Online, .. } | Change::Tier { new: AlarmTier::Normal, .. }
        );
        if !recovering {
            let periods = match self.change {
                Change::Tier { alarm: AlarmKind::Latency | AlarmKind::SuccessRate, .. } => "breaching periods",
                _ => "failed checks",
            };
            msg.push_str(&format!(" after {} consecutive {}", self.consecutive_failures, periods));
            if let Some(category) = self.error_category {
                msg.push_str(&format!(" (last error {}", category));
                if let Some(detail) = &self.detail {
                    msg.push_str(&format!(": {}", detail));
                }
                msg.push(')');
            }
        }
        msg
    }
}

/// Compare this run's state with what was persisted and list the edges.
///
/// A target seen for the first time only confirms its initial raw status;
/// `last_notified_raw_status` is updated in place for every status edge so it
/// fires once.
pub fn detect_transitions(
    devices: &mut BTreeMap<String, DeviceState>,
    prior_alarms: &BTreeMap<String, AlarmState>,
    alarms: &BTreeMap<String, AlarmState>,
    config: &AlertConfig,
    now: DateTime<Utc>,
) -> Vec<Transition> {
    let mut transitions = Vec::new();

    for state in devices.values_mut() {
        match state.last_notified_raw_status {
            None => {
                tracing::info!("Initial state confirmed for {}: {}", state.target_id, state.raw_status);
                state.last_notified_raw_status = Some(state.raw_status);
            }
            Some(old) if old != state.raw_status => {
                state.last_notified_raw_status = Some(state.raw_status);
                if config.notify_on_status_change {
                    transitions.push(Transition {
                        scope: state.target_id.clone(),
                        change: Change::Status { old, new: state.raw_status },
                        at: now,
                        consecutive_failures: state.consecutive_failures,
                        error_category: state.last_error,
                        detail: state.last_message.clone(),
                    });
                }
            }
            Some(_) => {}
        }
    }

    for (key, alarm) in alarms {
        let old = prior_alarms.get(key).map(|a| a.tier).unwrap_or(AlarmTier::Normal);
        if old == alarm.tier {
            continue;
        }
        let device = devices.get(&alarm.scope);
        let (error_category, detail) = match alarm.kind {
            AlarmKind::Fleet => worst_device(devices),
            _ => (device.and_then(|d| d.last_error), device.and_then(|d| d.last_message.clone())),
        };
        tracing::info!("Alarm {} changed: {} -> {}", key, old, alarm.tier);
        transitions.push(Transition {
            scope: alarm.scope.clone(),
            change: Change::Tier { alarm: alarm.kind, old, new: alarm.tier },
            at: now,
            consecutive_failures: alarm.streak,
            error_category,
            detail,
        });
    }

    transitions
}

fn worst_device(devices: &BTreeMap<String, DeviceState>) -> (Option<ErrorCategory>, Option<String>) {
    devices
        .values()
        .max_by_key(|d| d.consecutive_failures)
        .filter(|d| d.consecutive_failures > 0)
        .map(|d| (d.last_error, Some(format!("{}: {}", d.target_id, d.last_message.as_deref().unwrap_or("unreachable")))))
        .unwrap_or((None, None))
}

// ---------------------------------------------------------------- channels

#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, transition: &Transition) -> anyhow::Result<()>;
}

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Generic JSON POST, optionally rendered from a template.
pub struct WebhookChannel {
    name: String,
    url: String,
    template: Option<String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(name: &str, url: &str, template: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            template,
            client: reqwest::Client::new(),
        }
    }

    fn payload(&self, transition: &Transition) -> serde_json::Value {
        let timestamp = transition.at.format("%Y-%m-%d %H:%M:%S").to_string();
        let message = transition.message();
        let category = transition.error_category.map(|c| c.as_str()).unwrap_or("");

        // 如果有模板，使用模板替换
        if let Some(tmpl) = &self.template {
            let body = tmpl
                .replace("{{SCOPE}}", &transition.scope)
                .replace("{{TARGET}}", &transition.scope)
                .replace("{{STATUS}}", transition.new_label())
                .replace("{{OLD}}", transition.old_label())
                .replace("{{NEW}}", transition.new_label())
                .replace("{{TIME}}", &timestamp)
                .replace("{{MESSAGE}}", &message)
                .replace("{{FAILURES}}", &transition.consecutive_failures.to_string())
                .replace("{{CATEGORY}}", category);

            match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(v) => v,
                Err(_) => json!({ "text": body }), // Fallback
            }
        } else {
            let alarm = match transition.change {
                Change::Status { .. } => None,
                Change::Tier { alarm, .. } => Some(alarm.as_str()),
            };
            json!({
                "scope": transition.scope,
                "alarm": alarm,
                "old": transition.old_label(),
                "new": transition.new_label(),
                "timestamp": timestamp,
                "consecutive_failures": transition.consecutive_failures,
                "error_category": transition.error_category,
                "message": message,
            })
        }
    }
}

#[async_trait::async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, transition: &Transition) -> anyhow::Result<()> {
        post_json(&self.client, &self.url, &self.payload(transition)).await
    }
}

/// Slack-style incoming webhook.
pub struct SlackChannel {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl SlackChannel {
    pub fn new(name: &str, url: &str) -> Self {
        Self { name: name.to_string(), url: url.to_string(), client: reqwest::Client::new() }
    }
}

#[async_trait::async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, transition: &Transition) -> anyhow::Result<()> {
        post_json(&self.client, &self.url, &json!({ "text": transition.message() })).await
    }
}

pub struct LogChannel {
    name: String,
}

impl LogChannel {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }
}

#[async_trait::async_trait]
impl Channel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, transition: &Transition) -> anyhow::Result<()> {
        tracing::warn!("{}", transition.message());
        Ok(())
    }
}

async fn post_json(client: &reqwest::Client, url: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
    tracing::debug!("Sending webhook to {}", url);
    let res = client.post(url).timeout(WEBHOOK_TIMEOUT).json(payload).send().await?;
    let status = res.status();
    if !status.is_success() {
        if let Ok(text) = res.text().await {
            tracing::debug!("Response body: {}", text);
        }
        anyhow::bail!("webhook {} answered {}", url, status);
    }
    Ok(())
}

// ---------------------------------------------------------------- notifier

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChannelFailure {
    pub channel: String,
    pub error: String,
}

/// What happened to one transition's fan-out.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeliveryReport {
    pub transition: Transition,
    pub message: String,
    pub attempted: Vec<String>,
    pub succeeded: Vec<String>,
    pub failures: Vec<ChannelFailure>,
}

impl DeliveryReport {
    pub fn delivered(&self) -> bool {
        !self.succeeded.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        !self.succeeded.is_empty() && !self.failures.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Notifier {
    channels: Vec<Box<dyn Channel>>,
}

impl Notifier {
    pub fn new(channels: Vec<Box<dyn Channel>>) -> Self {
        Self { channels }
    }

    pub fn from_config(config: &AlertConfig) -> Self {
        if !config.enabled {
            return Self::new(Vec::new());
        }
        let channels = config
            .channels
            .iter()
            .filter(|c| c.enabled)
            .filter_map(build_channel)
            .collect();
        Self::new(channels)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Attempt every channel once, in order. A failing channel is logged and
    /// skipped; it never stops the others.
    pub async fn notify(&self, transition: &Transition) -> DeliveryReport {
        let mut report = DeliveryReport {
            transition: transition.clone(),
            message: transition.message(),
            attempted: Vec::new(),
            succeeded: Vec::new(),
            failures: Vec::new(),
        };

        for channel in &self.channels {
            report.attempted.push(channel.name().to_string());
            match channel.send(transition).await {
                Ok(()) => report.succeeded.push(channel.name().to_string()),
                Err(e) => {
                    tracing::error!("Failed to notify {} via {}: {:#}", transition.scope, channel.name(), e);
                    report.failures.push(ChannelFailure { channel: channel.name().to_string(), error: format!("{:#}", e) });
                }
            }
        }
        report
    }
}

fn build_channel(config: &ChannelConfig) -> Option<Box<dyn Channel>> {
    let url = config.url.as_deref().filter(|u| !u.is_empty());
    match (config.kind, url) {
        (ChannelKind::Log, _) => Some(Box::new(LogChannel::new(&config.name))),
        (ChannelKind::Webhook, Some(url)) => {
            Some(Box::new(WebhookChannel::new(&config.name, url, config.template.clone())))
        }
        (ChannelKind::Slack, Some(url)) => Some(Box::new(SlackChannel::new(&config.name, url))),
        (_, None) => {
            tracing::warn!("Channel {} has no url, skipping", config.name);
            None
        }
    }
}
