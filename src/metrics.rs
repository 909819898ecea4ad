//! Per-run metrics.
//!
//! Emitted every run whether or not anything changed; downstream alarms treat
//! a gap in the series as meaningful.

use crate::model::{AlarmState, DeviceState, ErrorCategory, ProbeOutcome, RawStatus, SinkConfig};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum Unit {
    Count,
    Milliseconds,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricDatum {
    pub name: String,
    pub value: f64,
    pub unit: Unit,
    pub dimensions: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl MetricDatum {
    fn new(name: &str, value: f64, unit: Unit, timestamp: DateTime<Utc>) -> Self {
        Self { name: name.to_string(), value, unit, dimensions: BTreeMap::new(), timestamp }
    }

    fn dim(mut self, key: &str, value: &str) -> Self {
        self.dimensions.insert(key.to_string(), value.to_string());
        self
    }
}

/// Everything one run knows that ends up as metrics.
pub struct RunMetrics<'a> {
    pub timestamp: DateTime<Utc>,
    pub total_targets: usize,
    pub devices: &'a BTreeMap<String, DeviceState>,
    pub outcomes: &'a BTreeMap<String, ProbeOutcome>,
    pub alarms: &'a BTreeMap<String, AlarmState>,
    pub removed: &'a [String],
}

pub fn build_metrics(run: &RunMetrics<'_>) -> Vec<MetricDatum> {
    let ts = run.timestamp;
    let mut data = Vec::new();
    let mut online = 0;
    let mut offline = 0;

    for (id, state) in run.devices {
        let up = state.raw_status == RawStatus::Online;
        if up { online += 1 } else { offline += 1 }

        data.push(MetricDatum::new("TargetStatus", if up { 1.0 } else { 0.0 }, Unit::Count, ts).dim("TargetId", id));
        data.push(
            MetricDatum::new("ConsecutiveFailures", state.consecutive_failures as f64, Unit::Count, ts)
                .dim("TargetId", id),
        );
        // Response time only for targets that answered this run
        if let Some(outcome) = run.outcomes.get(id).filter(|o| o.success) {
            data.push(
                MetricDatum::new("ResponseTime", outcome.latency_ms as f64, Unit::Milliseconds, ts).dim("TargetId", id),
            );
        }
    }

    let mut failures: BTreeMap<ErrorCategory, usize> = ErrorCategory::ALL.iter().map(|c| (*c, 0)).collect();
    for category in run.outcomes.values().filter_map(|o| o.error_category) {
        *failures.entry(category).or_default() += 1;
    }
    for (category, count) in failures {
        data.push(MetricDatum::new("ProbeFailures", count as f64, Unit::Count, ts).dim("ErrorCategory", category.as_str()));
    }

    for alarm in run.alarms.values() {
        data.push(
            MetricDatum::new("AlarmTier", alarm.tier.level() as f64, Unit::Count, ts)
                .dim("Alarm", alarm.kind.as_str())
                .dim("Scope", &alarm.scope),
        );
    }

    for id in run.removed {
        data.push(MetricDatum::new("TargetRemoved", 1.0, Unit::Count, ts).dim("TargetId", id));
    }

    // Liveness series: a gap means the monitor itself did not run.
    data.push(MetricDatum::new("MonitorHeartbeat", 1.0, Unit::Count, ts));
    data.push(MetricDatum::new("TotalOnline", online as f64, Unit::Count, ts));
    data.push(MetricDatum::new("TotalOffline", offline as f64, Unit::Count, ts));
    data.push(MetricDatum::new("TotalDevices", run.total_targets as f64, Unit::Count, ts));
    data
}

#[async_trait::async_trait]
pub trait MetricSink: Send + Sync {
    async fn emit(&self, namespace: &str, batch: &[MetricDatum]) -> anyhow::Result<()>;

    /// Called once after the last batch of a run.
    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn build_sink(config: &SinkConfig) -> Arc<dyn MetricSink> {
    match config {
        SinkConfig::Log => Arc::new(LogSink),
        SinkConfig::JsonLines { path } => Arc::new(JsonLinesSink::new(path)),
        SinkConfig::Textfile { path } => Arc::new(TextfileSink::new(path)),
    }
}

pub struct LogSink;

#[async_trait::async_trait]
impl MetricSink for LogSink {
    async fn emit(&self, namespace: &str, batch: &[MetricDatum]) -> anyhow::Result<()> {
        for datum in batch {
            tracing::info!(
                namespace,
                metric = %datum.name,
                value = datum.value,
                dimensions = ?datum.dimensions,
                "metric"
            );
        }
        Ok(())
    }
}

/// Appends one JSON object per datum.
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl MetricSink for JsonLinesSink {
    async fn emit(&self, namespace: &str, batch: &[MetricDatum]) -> anyhow::Result<()> {
        let mut out = String::new();
        for datum in batch {
            let line = serde_json::json!({ "namespace": namespace, "metric": datum });
            out.push_str(&line.to_string());
            out.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(out.as_bytes()).context("Failed to append metrics")?;
        Ok(())
    }
}

/// Prometheus text exposition, rewritten in full on every flush.
pub struct TextfileSink {
    path: PathBuf,
    pending: Mutex<Vec<(String, MetricDatum)>>,
}

impl TextfileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), pending: Mutex::new(Vec::new()) }
    }
}

#[async_trait::async_trait]
impl MetricSink for TextfileSink {
    async fn emit(&self, namespace: &str, batch: &[MetricDatum]) -> anyhow::Result<()> {
        let mut pending = self.pending.lock().map_err(|_| anyhow::anyhow!("metric buffer poisoned"))?;
        pending.extend(batch.iter().map(|d| (namespace.to_string(), d.clone())));
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let data = {
            let mut pending = self.pending.lock().map_err(|_| anyhow::anyhow!("metric buffer poisoned"))?;
            std::mem::take(&mut *pending)
        };
        let content = render_prometheus(&data);
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        fs::write(&tmp, content).context("Failed to write temp metrics file")?;
        fs::rename(&tmp, &self.path).context("Failed to replace metrics file")?;
        Ok(())
    }
}

pub fn render_prometheus(data: &[(String, MetricDatum)]) -> String {
    let mut out = String::new();
    for (namespace, datum) in data {
        let name = format!("{}_{}", snake_case(namespace), snake_case(&datum.name));
        let labels: Vec<String> = datum
            .dimensions
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", snake_case(k), v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        if labels.is_empty() {
            out.push_str(&format!("{} {}\n", name, datum.value));
        } else {
            out.push_str(&format!("{}{{{}}} {}\n", name, labels.join(","), datum.value));
        }
    }
    out
}

fn snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, ch) in s.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out
}

/// Keeps everything in memory. Useful for embedding and tests.
#[derive(Default, Clone)]
pub struct MemorySink {
    data: Arc<Mutex<Vec<MetricDatum>>>,
    fail: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let sink = Self::default();
        if let Ok(mut fail) = sink.fail.lock() {
            *fail = true;
        }
        sink
    }

    pub fn take(&self) -> Vec<MetricDatum> {
        self.data.lock().map(|mut d| std::mem::take(&mut *d)).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl MetricSink for MemorySink {
    async fn emit(&self, _namespace: &str, batch: &[MetricDatum]) -> anyhow::Result<()> {
        if self.fail.lock().map(|f| *f).unwrap_or(true) {
            anyhow::bail!("metric endpoint unavailable");
        }
        let mut data = self.data.lock().map_err(|_| anyhow::anyhow!("metric buffer poisoned"))?;
        data.extend_from_slice(batch);
        Ok(())
    }
}
