//! Alarm evaluation.
//!
//! Every tier is a pure function of the current [`DeviceState`] and the
//! configured thresholds. Nothing here is updated incrementally: the previous
//! [`AlarmState`] is consulted only to carry `entered_at` forward while the
//! tier is unchanged.
//!
//! ```text
//!            streak >= alarm_threshold        streak >= escalation_threshold
//!   NORMAL ───────────────────────────► WARNING ─────────────────────────────► ESCALATED
//!     ▲                                    │                                      │
//!     └──────── one good period ───────────┴──────────────────────────────────────┘
//! ```

use crate::model::{
    AlarmKind, AlarmState, AlarmTier, AlarmsConfig, DeviceState, LatencyAlarmConfig, MissingDataPolicy,
    SuccessRateAlarmConfig, Thresholds, FLEET_SCOPE,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub fn tier_for(streak: u32, thresholds: &Thresholds) -> AlarmTier {
    if thresholds.enable_escalation && streak >= thresholds.escalation_threshold {
        AlarmTier::Escalated
    } else if streak >= thresholds.alarm_threshold.max(1) {
        AlarmTier::Warning
    } else {
        AlarmTier::Normal
    }
}

/// Consecutive most-recent samples whose latency exceeds the threshold.
/// Failed probes and gaps carry no latency and go through `missing_data`.
pub fn latency_streak(state: &DeviceState, cfg: &LatencyAlarmConfig) -> u32 {
    let mut streak = 0;
    for sample in state.history.iter().rev() {
        let breaching = match (sample.success, sample.latency_ms) {
            (Some(true), Some(latency)) => latency > cfg.threshold_ms,
            _ => match cfg.missing_data {
                MissingDataPolicy::Breaching => true,
                MissingDataPolicy::NotBreaching => false,
                MissingDataPolicy::Ignore => continue,
            },
        };
        if !breaching {
            break;
        }
        streak += 1;
    }
    streak
}

/// Consecutive most-recent windows whose success fraction is below `min_rate`.
/// Windows are only evaluated once `window` samples exist.
pub fn success_rate_streak(state: &DeviceState, cfg: &SuccessRateAlarmConfig) -> u32 {
    let window = cfg.window.max(1);
    let samples: Vec<bool> = state
        .history
        .iter()
        .rev()
        .filter_map(|s| match s.success {
            Some(ok) => Some(ok),
            None => match cfg.missing_data {
                MissingDataPolicy::Breaching => Some(false),
                MissingDataPolicy::NotBreaching => Some(true),
                MissingDataPolicy::Ignore => None,
            },
        })
        .collect();

    let mut streak = 0;
    for slice in samples.windows(window) {
        let ok = slice.iter().filter(|s| **s).count();
        if (ok as f64 / window as f64) >= cfg.min_rate {
            break;
        }
        streak += 1;
    }
    streak
}

pub struct AlarmEvaluator<'a> {
    config: &'a AlarmsConfig,
}

impl<'a> AlarmEvaluator<'a> {
    pub fn new(config: &'a AlarmsConfig) -> Self {
        Self { config }
    }

    /// Recompute every enabled alarm from `devices`. Keys follow [`AlarmState::key`].
    pub fn evaluate(
        &self,
        devices: &BTreeMap<String, DeviceState>,
        prior: &BTreeMap<String, AlarmState>,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, AlarmState> {
        let mut alarms = BTreeMap::new();
        let cfg = self.config;

        for (id, state) in devices {
            if cfg.reachability.enabled {
                let thresholds = cfg.reachability.thresholds();
                insert(&mut alarms, prior, AlarmKind::Reachability, id, state.consecutive_failures, thresholds, now);
            }
            if cfg.latency.enabled {
                let streak = latency_streak(state, &cfg.latency);
                insert(&mut alarms, prior, AlarmKind::Latency, id, streak, cfg.latency.thresholds(), now);
            }
            if cfg.success_rate.enabled {
                let streak = success_rate_streak(state, &cfg.success_rate);
                insert(&mut alarms, prior, AlarmKind::SuccessRate, id, streak, cfg.success_rate.thresholds(), now);
            }
        }

        // Any single device down: the fleet follows its worst target.
        if cfg.fleet.enabled && cfg.reachability.enabled {
            let thresholds = cfg.reachability.thresholds();
            let streak = devices.values().map(|s| s.consecutive_failures).max().unwrap_or(0);
            insert(&mut alarms, prior, AlarmKind::Fleet, FLEET_SCOPE, streak, thresholds, now);
        }

        alarms
    }
}

fn insert(
    alarms: &mut BTreeMap<String, AlarmState>,
    prior: &BTreeMap<String, AlarmState>,
    kind: AlarmKind,
    scope: &str,
    streak: u32,
    thresholds: Thresholds,
    now: DateTime<Utc>,
) {
    let key = AlarmState::key(kind, scope);
    let tier = tier_for(streak, &thresholds);
    let entered_at = match prior.get(&key) {
        Some(p) if p.tier == tier => p.entered_at,
        _ => now,
    };
    alarms.insert(
        key,
        AlarmState {
            scope: scope.to_string(),
            kind,
            tier,
            entered_at,
            streak,
            thresholds,
        },
    );
}
