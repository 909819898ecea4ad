use crate::alarm::AlarmEvaluator;
use crate::alert::{detect_transitions, DeliveryReport, Notifier};
use crate::metrics::{build_metrics, build_sink, MetricSink, RunMetrics};
use crate::model::{AppConfig, ProbeOutcome, RawStatus, Target};
use crate::probe::{run_probe, NetworkProbe, Probe};
use crate::state::StateTracker;
use crate::store::{FileStateStore, StateSnapshot, StateStore};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// Run-level problems. Reported in the summary, never raised.
#[derive(Error, Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunError {
    #[error("deadline reached before {0} target(s) were probed")]
    PartialRun(usize),
    #[error("failed to persist state: {0}")]
    Persistence(String),
    #[error("failed to load prior state: {0}")]
    StateUnavailable(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: chrono::DateTime<Utc>,
    pub elapsed_ms: u64,
    pub targets_total: usize,
    pub targets_probed: usize,
    pub online: usize,
    pub offline: usize,
    /// Probes that completed but did not reach their target.
    pub probe_failures: usize,
    /// Targets whose probe task crashed instead of returning an outcome.
    pub failed_targets: Vec<String>,
    pub unprobed_targets: Vec<String>,
    pub removed_targets: Vec<String>,
    pub transitions: usize,
    pub deliveries: Vec<DeliveryReport>,
    pub metric_errors: usize,
    pub state_version: Option<u64>,
    pub errors: Vec<RunError>,
}

impl RunSummary {
    pub fn persisted(&self) -> bool {
        self.state_version.is_some()
    }
}

/// One scheduled invocation: probe, fold, evaluate, report, persist.
pub struct Monitor {
    config: AppConfig,
    probe: Arc<dyn Probe>,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn MetricSink>,
    notifier: Notifier,
}

impl Monitor {
    pub fn new(
        config: AppConfig,
        probe: Arc<dyn Probe>,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn MetricSink>,
        notifier: Notifier,
    ) -> Self {
        Self { config, probe, store, sink, notifier }
    }

    /// Wire up the production collaborators described by `config`.
    pub fn from_config(config: AppConfig) -> Self {
        let store = Arc::new(FileStateStore::new(&config.run.state_path));
        let sink = build_sink(&config.metrics.sink);
        let notifier = Notifier::from_config(&config.alert);
        Self::new(config, Arc::new(NetworkProbe), store, sink, notifier)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn run_once(&self) -> RunSummary {
        let started = Instant::now();
        let now = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let targets = &self.config.targets;
        let mut errors = Vec::new();
        tracing::info!("Run {} started: {} targets", run_id, targets.len());

        // 1. 加载上次的状态
        let (prior, can_persist) = match self.store.load() {
            Ok(snapshot) => (snapshot, true),
            Err(e) => {
                // Start over only when the store moved the bad data out of the way.
                tracing::error!("Run {}: failed to load state: {}", run_id, e);
                errors.push(RunError::StateUnavailable(e.to_string()));
                (StateSnapshot::default(), e.is_recoverable())
            }
        };

        // 2. 并发探测
        let probed = self.probe_all(targets).await;
        if !probed.unprobed.is_empty() {
            tracing::error!("Run {}: deadline reached, {} targets not probed", run_id, probed.unprobed.len());
            errors.push(RunError::PartialRun(probed.unprobed.len()));
        }

        // 3. 折叠状态
        let tracker = StateTracker::new(self.config.run.history_len);
        let missing_policy = self.config.alarms.reachability.missing_data;
        let mut devices = BTreeMap::new();
        for target in targets {
            let prior_state = prior.devices.get(&target.id);
            let next = match probed.outcomes.get(&target.id) {
                Some(outcome) => Some(tracker.update(prior_state, outcome)),
                None => tracker.record_missing(prior_state, &target.id, missing_policy, now),
            };
            if let Some(state) = next {
                devices.insert(target.id.clone(), state);
            }
        }

        let configured: HashSet<&str> = targets.iter().map(|t| t.id.as_str()).collect();
        let removed: Vec<String> = prior
            .devices
            .keys()
            .filter(|id| !configured.contains(id.as_str()))
            .cloned()
            .collect();
        for id in &removed {
            tracing::info!("Target {} removed from configuration, dropping its state", id);
        }

        // 4. 告警评估 (sees the whole run)
        let alarms = AlarmEvaluator::new(&self.config.alarms).evaluate(&devices, &prior.alarms, now);

        // 5. 指标
        let metrics = build_metrics(&RunMetrics {
            timestamp: now,
            total_targets: targets.len(),
            devices: &devices,
            outcomes: &probed.outcomes,
            alarms: &alarms,
            removed: &removed,
        });
        let metric_errors = self.emit_metrics(&metrics).await;

        // 6. 通知
        let transitions = detect_transitions(&mut devices, &prior.alarms, &alarms, &self.config.alert, now);
        let mut deliveries = Vec::with_capacity(transitions.len());
        for transition in &transitions {
            deliveries.push(self.notifier.notify(transition).await);
        }

        // 7. 持久化
        let online = devices.values().filter(|d| d.raw_status == RawStatus::Online).count();
        let offline = devices.len() - online;
        let snapshot = StateSnapshot { version: prior.version, updated_at: Some(now), devices, alarms };
        let state_version = if can_persist {
            match self.store.save(&snapshot, prior.version) {
                Ok(version) => Some(version),
                Err(e) => {
                    tracing::error!("Run {}: failed to persist state: {}", run_id, e);
                    errors.push(RunError::Persistence(e.to_string()));
                    None
                }
            }
        } else {
            tracing::error!("Run {}: prior state unreadable, not overwriting it", run_id);
            errors.push(RunError::Persistence("prior state unreadable, not overwriting it".into()));
            None
        };

        let summary = RunSummary {
            run_id,
            started_at: now,
            elapsed_ms: started.elapsed().as_millis() as u64,
            targets_total: targets.len(),
            targets_probed: probed.outcomes.len(),
            online,
            offline,
            probe_failures: probed.outcomes.values().filter(|o| !o.success).count(),
            failed_targets: probed.crashed,
            unprobed_targets: probed.unprobed,
            removed_targets: removed,
            transitions: transitions.len(),
            deliveries,
            metric_errors,
            state_version,
            errors,
        };
        tracing::info!(
            "Run {} finished in {}ms: {} online, {} offline, {} transitions",
            summary.run_id,
            summary.elapsed_ms,
            summary.online,
            summary.offline,
            summary.transitions
        );
        summary
    }

    async fn probe_all(&self, targets: &[Target]) -> Probed {
        let results: Arc<DashMap<String, ProbeOutcome>> = Arc::new(DashMap::new());
        let semaphore = Arc::new(Semaphore::new(self.config.run.concurrency.max(1)));
        let deadline = self.config.run.deadline_ms.map(|ms| Instant::now() + Duration::from_millis(ms));

        let mut handles: Vec<(String, JoinHandle<()>)> = Vec::with_capacity(targets.len());
        for target in targets.iter().cloned() {
            let id = target.id.clone();
            let results = results.clone();
            let semaphore = semaphore.clone();
            let probe = self.probe.clone();
            let probe_config = self.config.probe.clone();

            handles.push((
                id,
                tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    let outcome = run_probe(probe.as_ref(), &target, &probe_config).await;
                    results.insert(target.id.clone(), outcome);
                }),
            ));
        }

        // 等待所有探测完成
        let mut crashed = Vec::new();
        let mut deadline_hit = false;
        for (id, handle) in handles.iter_mut() {
            // Past the deadline only collect tasks that already ended.
            if deadline_hit && !handle.is_finished() {
                continue;
            }
            let joined = match deadline {
                Some(at) if !deadline_hit => match tokio::time::timeout_at(at, &mut *handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        deadline_hit = true;
                        continue;
                    }
                },
                _ => handle.await,
            };
            if let Err(e) = joined {
                tracing::error!("Probe task for {} failed: {}", id, e);
                crashed.push(id.clone());
            }
        }
        if deadline_hit {
            for (_, handle) in &handles {
                handle.abort();
            }
        }

        let outcomes: BTreeMap<String, ProbeOutcome> =
            results.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        let unprobed = targets
            .iter()
            .filter(|t| !outcomes.contains_key(&t.id) && !crashed.contains(&t.id))
            .map(|t| t.id.clone())
            .collect();
        Probed { outcomes, crashed, unprobed }
    }

    async fn emit_metrics(&self, metrics: &[crate::metrics::MetricDatum]) -> usize {
        let namespace = &self.config.metrics.namespace;
        let mut errors = 0;
        for batch in metrics.chunks(self.config.metrics.batch_size.max(1)) {
            if let Err(e) = self.sink.emit(namespace, batch).await {
                tracing::error!("Failed to send {} metrics: {:#}", batch.len(), e);
                errors += 1;
            }
        }
        if let Err(e) = self.sink.flush().await {
            tracing::error!("Failed to flush metrics: {:#}", e);
            errors += 1;
        }
        errors
    }
}

struct Probed {
    outcomes: BTreeMap<String, ProbeOutcome>,
    crashed: Vec<String>,
    unprobed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{Change, Channel, Transition};
    use crate::metrics::MemorySink;
    use crate::model::{AlarmTier, ErrorCategory, ProbeConfig, FLEET_SCOPE};
    use crate::probe::{Attempt, ProbeError};
    use crate::store::MemoryStateStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Reports targets up or down from a table the test flips between runs.
    #[derive(Default)]
    struct SwitchProbe {
        up: Mutex<HashMap<String, bool>>,
        panics: Mutex<HashSet<String>>,
        hangs: Mutex<HashSet<String>>,
        latency: Mutex<HashMap<String, u64>>,
    }

    impl SwitchProbe {
        fn set(&self, id: &str, up: bool) {
            self.up.lock().unwrap().insert(id.to_string(), up);
        }
    }

    #[async_trait::async_trait]
    impl Probe for SwitchProbe {
        async fn attempt(&self, target: &Target, _config: &ProbeConfig) -> Result<Attempt, ProbeError> {
            if self.panics.lock().unwrap().contains(&target.id) {
                panic!("probe for {} blew up", target.id);
            }
            if self.hangs.lock().unwrap().contains(&target.id) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let up = self.up.lock().unwrap().get(&target.id).copied().unwrap_or(true);
            if up {
                let latency_ms = self.latency.lock().unwrap().get(&target.id).copied().unwrap_or(120);
                Ok(Attempt { latency_ms, status_code: None })
            } else {
                Err(ProbeError::Network("Connection refused".into()))
            }
        }
    }

    /// Tracks how many attempts run at the same time.
    #[derive(Default)]
    struct CountingProbe {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Probe for CountingProbe {
        async fn attempt(&self, _target: &Target, _config: &ProbeConfig) -> Result<Attempt, ProbeError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Attempt { latency_ms: 100, status_code: None })
        }
    }

    #[derive(Default, Clone)]
    struct RecordingChannel {
        sent: Arc<Mutex<Vec<Transition>>>,
    }

    #[async_trait::async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn send(&self, transition: &Transition) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(transition.clone());
            Ok(())
        }
    }

    struct Harness {
        monitor: Monitor,
        probe: Arc<SwitchProbe>,
        store: Arc<MemoryStateStore>,
        sink: MemorySink,
        sent: Arc<Mutex<Vec<Transition>>>,
    }

    impl Harness {
        fn sent(&self) -> Vec<Transition> {
            self.sent.lock().unwrap().clone()
        }
    }

    fn config(ids: &[&str]) -> AppConfig {
        let mut config: AppConfig = serde_json::from_str(r#"{"targets": []}"#).unwrap();
        config.targets = ids
            .iter()
            .map(|id| Target { id: id.to_string(), ..Target::tcp("127.0.0.1", 9) })
            .collect();
        config.probe = ProbeConfig { timeout_ms: 1000, retries: 1, retry_delay_ms: 500 };
        config.alarms.latency.enabled = false;
        config.alarms.success_rate.enabled = false;
        config.alarms.fleet.enabled = false;
        config
    }

    fn harness(config: AppConfig) -> Harness {
        harness_with_sink(config, MemorySink::new())
    }

    fn harness_with_sink(config: AppConfig, sink: MemorySink) -> Harness {
        let probe = Arc::new(SwitchProbe::default());
        let store = Arc::new(MemoryStateStore::new());
        let recorder = RecordingChannel::default();
        let sent = recorder.sent.clone();
        let monitor = Monitor::new(
            config,
            probe.clone(),
            store.clone(),
            Arc::new(sink.clone()),
            Notifier::new(vec![Box::new(recorder)]),
        );
        Harness { monitor, probe, store, sink, sent }
    }

    fn tiers(sent: &[Transition]) -> Vec<(AlarmTier, AlarmTier)> {
        sent.iter()
            .filter_map(|t| match t.change {
                Change::Tier { old, new, .. } => Some((old, new)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_no_duplicate_alerts() {
        let h = harness(config(&["db1:5432"]));
        h.probe.set("db1:5432", false);

        for _ in 0..4 {
            h.monitor.run_once().await;
        }

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(tiers(&sent), vec![(AlarmTier::Normal, AlarmTier::Warning)]);
        assert_eq!(sent[0].consecutive_failures, 2);
        let snapshot = h.store.snapshot();
        assert_eq!(snapshot.version, 4);
        assert_eq!(snapshot.devices["db1:5432"].consecutive_failures, 4);
    }

    #[tokio::test]
    async fn test_escalation_and_immediate_recovery() {
        let h = harness(config(&["db1:5432"]));
        h.probe.set("db1:5432", false);

        let mut fired_at = Vec::new();
        for run in 1..=6 {
            let summary = h.monitor.run_once().await;
            if summary.transitions > 0 {
                fired_at.push(run);
            }
        }
        assert_eq!(fired_at, vec![2, 5]);
        assert_eq!(
            tiers(&h.sent()),
            vec![(AlarmTier::Normal, AlarmTier::Warning), (AlarmTier::Warning, AlarmTier::Escalated)]
        );
        assert_eq!(h.sent()[1].consecutive_failures, 5);
        assert_eq!(h.sent()[1].error_category, Some(ErrorCategory::Network));

        h.probe.set("db1:5432", true);
        let summary = h.monitor.run_once().await;
        assert_eq!(summary.transitions, 1);
        assert_eq!(tiers(&h.sent())[2], (AlarmTier::Escalated, AlarmTier::Normal));

        h.monitor.run_once().await;
        assert_eq!(h.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_partial_failure_isolation() {
        let mut cfg = config(&["a", "b", "c"]);
        cfg.alarms.reachability.missing_data = crate::model::MissingDataPolicy::Breaching;
        let h = harness(cfg);
        h.probe.panics.lock().unwrap().insert("b".to_string());

        let summary = h.monitor.run_once().await;

        assert_eq!(summary.failed_targets, vec!["b"]);
        assert_eq!(summary.targets_probed, 2);
        assert!(summary.persisted());

        let snapshot = h.store.snapshot();
        assert_eq!(snapshot.devices["a"].raw_status, RawStatus::Online);
        assert_eq!(snapshot.devices["c"].raw_status, RawStatus::Online);
        // missing data is breaching for reachability
        assert_eq!(snapshot.devices["b"].consecutive_failures, 1);
        assert_eq!(snapshot.devices["b"].last_error, Some(ErrorCategory::Timeout));

        let metrics = h.sink.take();
        for id in ["a", "c"] {
            let status = metrics
                .iter()
                .find(|d| d.name == "TargetStatus" && d.dimensions["TargetId"] == id)
                .unwrap();
            assert_eq!(status.value, 1.0);
        }
    }

    #[tokio::test]
    async fn test_persists_despite_metric_failures() {
        let h = harness_with_sink(config(&["a"]), MemorySink::failing());
        h.probe.set("a", false);

        let summary = h.monitor.run_once().await;
        assert!(summary.metric_errors > 0);
        assert!(summary.persisted());
        assert_eq!(h.store.snapshot().version, 1);
    }

    #[tokio::test]
    async fn test_notifies_even_when_persistence_fails() {
        let mut cfg = config(&["a"]);
        cfg.alarms.reachability.alarm_threshold = 1;
        let h = harness(cfg);
        h.probe.set("a", false);
        h.store.set_fail_writes(true);

        let summary = h.monitor.run_once().await;
        assert!(!summary.persisted());
        assert!(matches!(summary.errors.as_slice(), [RunError::Persistence(_)]));
        assert_eq!(h.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_metrics_are_identical_across_reset_runs() {
        async fn values(h: &Harness) -> Vec<(String, BTreeMap<String, String>, f64)> {
            for up in [true, false, false, true] {
                h.probe.set("a", up);
                h.monitor.run_once().await;
            }
            h.sink
                .take()
                .into_iter()
                .map(|d| (d.name, d.dimensions, d.value))
                .collect()
        }

        let first = harness(config(&["a"]));
        let second = harness(config(&["a"]));
        let mut cfg = config(&["a"]);
        cfg.alert.notify_on_status_change = true;
        let chatty = harness(cfg);

        let expected = values(&first).await;
        assert!(!first.sent().is_empty());
        assert_eq!(values(&second).await, expected);
        assert_eq!(values(&chatty).await, expected);
        assert!(chatty.sent().len() > first.sent().len());
    }

    #[tokio::test]
    async fn test_removed_target_state_is_dropped() {
        let h = harness(config(&["a", "b"]));
        h.probe.set("b", false);
        h.monitor.run_once().await;
        h.monitor.run_once().await;
        assert!(h.store.snapshot().alarms.contains_key("reachability:b"));

        let shrunk = Monitor::new(
            config(&["a"]),
            h.probe.clone(),
            h.store.clone(),
            Arc::new(h.sink.clone()),
            Notifier::new(Vec::new()),
        );
        let summary = shrunk.run_once().await;
        assert_eq!(summary.removed_targets, vec!["b"]);

        let snapshot = h.store.snapshot();
        assert!(!snapshot.devices.contains_key("b"));
        assert!(!snapshot.alarms.contains_key("reachability:b"));
        assert!(h.sink.take().iter().any(|d| d.name == "TargetRemoved" && d.dimensions["TargetId"] == "b"));
    }

    #[tokio::test]
    async fn test_fleet_alarm_fires_once_per_edge() {
        let mut cfg = config(&["a", "b", "c"]);
        cfg.alarms.fleet.enabled = true;
        cfg.alarms.reachability.alarm_threshold = 1;
        cfg.alert.channels.clear();
        let h = harness(cfg);

        h.probe.set("b", false);
        h.monitor.run_once().await;
        h.monitor.run_once().await;
        let fleet: Vec<_> = h.sent().into_iter().filter(|t| t.scope == FLEET_SCOPE).collect();
        assert_eq!(fleet.len(), 1);
        assert_eq!(fleet[0].consecutive_failures, 1);
    }

    fn file_monitor(cfg: AppConfig, store_path: &std::path::Path, probe: Arc<SwitchProbe>) -> (Monitor, RecordingChannel) {
        let recorder = RecordingChannel::default();
        let monitor = Monitor::new(
            cfg,
            probe,
            Arc::new(FileStateStore::new(store_path)),
            Arc::new(MemorySink::new()),
            Notifier::new(vec![Box::new(recorder.clone())]),
        );
        (monitor, recorder)
    }

    #[tokio::test]
    async fn test_corrupt_state_is_moved_aside_and_alerting_resumes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ truncated").unwrap();

        let probe = Arc::new(SwitchProbe::default());
        probe.set("a", false);
        let (monitor, recorder) = file_monitor(config(&["a"]), &path, probe);

        let first = monitor.run_once().await;
        assert!(matches!(first.errors.as_slice(), [RunError::StateUnavailable(_)]));
        assert!(first.persisted());
        assert!(recorder.sent.lock().unwrap().is_empty());

        let second = monitor.run_once().await;
        assert!(second.errors.is_empty());
        assert_eq!(second.state_version, Some(2));
        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(tiers(&sent), vec![(AlarmTier::Normal, AlarmTier::Warning)]);
        assert_eq!(sent[0].consecutive_failures, 2);

        let kept: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with("state.json.corrupt-"))
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(std::fs::read_to_string(&kept[0]).unwrap(), "{ truncated");
    }

    #[tokio::test]
    async fn test_unreadable_state_path_is_not_overwritten() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = config(&["a"]);
        cfg.alarms.reachability.alarm_threshold = 1;
        let probe = Arc::new(SwitchProbe::default());
        probe.set("a", false);
        // a directory cannot be read as a state file
        let (monitor, recorder) = file_monitor(cfg, dir.path(), probe);

        let summary = monitor.run_once().await;
        assert!(!summary.persisted());
        assert!(matches!(
            summary.errors.as_slice(),
            [RunError::StateUnavailable(_), RunError::Persistence(_)]
        ));
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
        assert!(dir.path().is_dir());
    }

    #[tokio::test]
    async fn test_latency_alarm_reports_breaching_streak() {
        let mut cfg = config(&["a"]);
        cfg.alarms.latency.enabled = true;
        let h = harness(cfg);
        h.probe.latency.lock().unwrap().insert("a".to_string(), 9000);

        for _ in 0..3 {
            h.monitor.run_once().await;
        }

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            sent[0].change,
            Change::Tier { alarm: crate::model::AlarmKind::Latency, old: AlarmTier::Normal, new: AlarmTier::Warning }
        ));
        assert_eq!(sent[0].consecutive_failures, 3);
        assert!(sent[0].message().contains("after 3 consecutive breaching periods"));
        assert_eq!(h.store.snapshot().devices["a"].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_is_respected() {
        let ids: Vec<String> = (0..20).map(|i| format!("t{}", i)).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let mut cfg = config(&refs);
        cfg.run.concurrency = 3;
        let probe = Arc::new(CountingProbe::default());
        let monitor = Monitor::new(
            cfg,
            probe.clone(),
            Arc::new(MemoryStateStore::new()),
            Arc::new(MemorySink::new()),
            Notifier::new(Vec::new()),
        );

        let summary = monitor.run_once().await;
        assert_eq!(probe.peak.load(Ordering::SeqCst), 3);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 20);
        assert_eq!(summary.targets_probed, 20);
        assert_eq!(summary.online, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_still_sorts_out_crashed_tasks() {
        let mut cfg = config(&["slow", "boom"]);
        cfg.run.deadline_ms = Some(2000);
        cfg.probe.timeout_ms = 10_000_000;
        let h = harness(cfg);
        h.probe.hangs.lock().unwrap().insert("slow".to_string());
        h.probe.panics.lock().unwrap().insert("boom".to_string());

        let summary = h.monitor.run_once().await;
        assert_eq!(summary.failed_targets, vec!["boom"]);
        assert_eq!(summary.unprobed_targets, vec!["slow"]);
        assert!(summary.errors.contains(&RunError::PartialRun(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_keeps_partial_results() {
        let mut cfg = config(&["fast", "slow"]);
        cfg.run.deadline_ms = Some(2000);
        cfg.probe.timeout_ms = 10_000_000;
        let h = harness(cfg);
        h.probe.hangs.lock().unwrap().insert("slow".to_string());

        let summary = h.monitor.run_once().await;
        assert_eq!(summary.unprobed_targets, vec!["slow"]);
        assert!(summary.errors.contains(&RunError::PartialRun(1)));
        assert!(summary.persisted());

        let snapshot = h.store.snapshot();
        assert_eq!(snapshot.devices["fast"].raw_status, RawStatus::Online);
        assert_eq!(snapshot.devices["slow"].raw_status, RawStatus::Offline);
    }
}
