use crate::model::{AppConfig, ChannelConfig, ChannelKind, Protocol, Target};
use anyhow::Context;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_TARGET_PORT: u16 = 8443;

/// Load, apply `REACHWATCH_*` overrides, fill in derived ids and validate.
/// A missing file is replaced by the default configuration.
pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let mut config = if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str::<AppConfig>(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?
    } else {
        tracing::info!("Config file {} not found, creating default.", path.display());
        let defaults = get_default_config();
        save_config(path, &defaults)?;
        defaults
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    normalize(&mut config);
    validate(&config)?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &AppConfig) -> anyhow::Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    let mut tmp_file = path.as_os_str().to_owned();
    tmp_file.push(".tmp");
    fs::write(&tmp_file, content).context("Failed to write temp config file")?;
    fs::rename(&tmp_file, path).context("Failed to replace config file")?;
    Ok(())
}

/// Environment wins over the file. `lookup` is `std::env::var` outside tests.
pub fn apply_env_overrides(
    config: &mut AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    let default_port = match lookup("REACHWATCH_TARGET_PORT") {
        Some(v) => v.trim().parse::<u16>().context("REACHWATCH_TARGET_PORT is not a port")?,
        None => DEFAULT_TARGET_PORT,
    };

    if let Some(list) = lookup("REACHWATCH_TARGETS") {
        let mut targets = Vec::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (host, port) = match entry.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port
                        .parse::<u16>()
                        .with_context(|| format!("REACHWATCH_TARGETS: bad port in {}", entry))?;
                    (host, port)
                }
                None => (entry, default_port),
            };
            targets.push(Target::tcp(host, port));
        }
        tracing::info!("Using {} targets from REACHWATCH_TARGETS", targets.len());
        config.targets = targets;
    }

    if let Some(v) = lookup("REACHWATCH_TIMEOUT_MS") {
        config.probe.timeout_ms = v.trim().parse().context("REACHWATCH_TIMEOUT_MS is not a number")?;
    }
    if let Some(v) = lookup("REACHWATCH_RETRIES") {
        config.probe.retries = v.trim().parse().context("REACHWATCH_RETRIES is not a number")?;
    }
    if let Some(v) = lookup("REACHWATCH_STATE_PATH") {
        config.run.state_path = v;
    }
    if let Some(v) = lookup("REACHWATCH_NAMESPACE") {
        config.metrics.namespace = v;
    }
    Ok(())
}

/// Give unnamed targets their `address:port` id.
pub fn normalize(config: &mut AppConfig) {
    for target in &mut config.targets {
        if target.id.trim().is_empty() {
            target.id = target.derived_id();
        }
    }
}

/// Report every problem at once. Malformed addresses are left to the probe.
pub fn validate(config: &AppConfig) -> anyhow::Result<()> {
    let mut problems = Vec::new();

    let probe = &config.probe;
    if !(1..=5).contains(&probe.retries) {
        problems.push(format!("probe.retries must be within 1..=5, got {}", probe.retries));
    }
    if probe.retry_delay_ms < 500 {
        problems.push(format!("probe.retry_delay_ms must be at least 500, got {}", probe.retry_delay_ms));
    }
    if probe.timeout_ms == 0 {
        problems.push("probe.timeout_ms must be positive".to_string());
    }

    let alarms = &config.alarms;
    let history = config.run.history_len;
    let sections = [
        ("reachability", alarms.reachability.enabled, alarms.reachability.thresholds()),
        ("latency", alarms.latency.enabled, alarms.latency.thresholds()),
        ("success_rate", alarms.success_rate.enabled, alarms.success_rate.thresholds()),
    ];
    for (name, enabled, t) in sections {
        if !enabled {
            continue;
        }
        if t.alarm_threshold < 1 {
            problems.push(format!("alarms.{}.alarm_threshold must be at least 1", name));
        }
        if t.enable_escalation && t.escalation_threshold <= t.alarm_threshold {
            problems.push(format!(
                "alarms.{}.escalation_threshold ({}) must exceed alarm_threshold ({})",
                name, t.escalation_threshold, t.alarm_threshold
            ));
        }
    }

    if alarms.latency.enabled {
        let t = alarms.latency.thresholds();
        let needed = (if t.enable_escalation { t.escalation_threshold } else { t.alarm_threshold }) as usize;
        if needed > history {
            problems.push(format!("alarms.latency needs {} samples but run.history_len is {}", needed, history));
        }
    }
    if alarms.success_rate.enabled {
        let sr = &alarms.success_rate;
        if !(sr.min_rate > 0.0 && sr.min_rate <= 1.0) {
            problems.push(format!("alarms.success_rate.min_rate must be within (0, 1], got {}", sr.min_rate));
        }
        if sr.window < 1 {
            problems.push("alarms.success_rate.window must be at least 1".to_string());
        }
        let periods = (if sr.enable_escalation { sr.escalation_threshold } else { sr.alarm_threshold }) as usize;
        let needed = sr.window + periods.saturating_sub(1);
        if needed > history {
            problems.push(format!(
                "alarms.success_rate needs {} samples but run.history_len is {}",
                needed, history
            ));
        }
    }

    if config.run.concurrency < 1 {
        problems.push("run.concurrency must be at least 1".to_string());
    }

    let mut seen = HashSet::new();
    for target in &config.targets {
        if !seen.insert(target.id.as_str()) {
            problems.push(format!("duplicate target id {}", target.id));
        }
    }

    for channel in config.alert.channels.iter().filter(|c| c.enabled) {
        let needs_url = matches!(channel.kind, ChannelKind::Webhook | ChannelKind::Slack);
        if needs_url && channel.url.as_deref().map_or(true, str::is_empty) {
            problems.push(format!("channel {} has no url", channel.name));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("invalid configuration:\n  - {}", problems.join("\n  - "))
    }
}

pub fn get_default_config() -> AppConfig {
    AppConfig {
        targets: vec![
            Target::tcp("8.8.8.8", 53),
            Target {
                id: "example.com".to_string(),
                address: "example.com".to_string(),
                port: None,
                protocol: Protocol::Https,
                path: Some("/".to_string()),
                expected_status_codes: None,
                expected_content: None,
            },
        ],
        probe: Default::default(),
        alarms: Default::default(),
        alert: crate::model::AlertConfig {
            channels: vec![ChannelConfig {
                id: uuid::Uuid::new_v4().to_string(),
                name: "log".to_string(),
                kind: ChannelKind::Log,
                url: None,
                template: None,
                enabled: true,
            }],
            ..Default::default()
        },
        metrics: Default::default(),
        run: Default::default(),
    }
}
