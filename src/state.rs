//! Folds probe outcomes into per-target [`DeviceState`].

use crate::model::{DeviceState, ErrorCategory, MissingDataPolicy, ProbeOutcome, ProbeSample, RawStatus};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

pub struct StateTracker {
    history_len: usize,
}

impl StateTracker {
    pub fn new(history_len: usize) -> Self {
        Self { history_len: history_len.max(1) }
    }

    /// Returns the state after observing `outcome`. `prior` is left untouched.
    pub fn update(&self, prior: Option<&DeviceState>, outcome: &ProbeOutcome) -> DeviceState {
        self.fold(
            prior,
            &outcome.target_id,
            outcome.success,
            outcome.error_category,
            outcome.message.clone(),
            outcome.timestamp,
            ProbeSample::observed(outcome),
        )
    }

    /// A configured target produced no outcome this run (probe task crashed,
    /// or the run deadline hit first).
    ///
    /// `Breaching` counts the gap as a TIMEOUT failure; the other policies
    /// leave the counters alone and only record the gap in the history.
    pub fn record_missing(
        &self,
        prior: Option<&DeviceState>,
        target_id: &str,
        policy: MissingDataPolicy,
        now: DateTime<Utc>,
    ) -> Option<DeviceState> {
        let sample = ProbeSample::missing(now);
        match policy {
            MissingDataPolicy::Breaching => Some(self.fold(
                prior,
                target_id,
                false,
                Some(ErrorCategory::Timeout),
                Some("no probe result this run".to_string()),
                now,
                sample,
            )),
            MissingDataPolicy::NotBreaching | MissingDataPolicy::Ignore => prior.map(|p| {
                let mut state = p.clone();
                push_sample(&mut state.history, sample, self.history_len);
                state
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fold(
        &self,
        prior: Option<&DeviceState>,
        target_id: &str,
        success: bool,
        error: Option<ErrorCategory>,
        message: Option<String>,
        at: DateTime<Utc>,
        sample: ProbeSample,
    ) -> DeviceState {
        let raw_status = RawStatus::from_success(success);
        let mut state = match prior {
            Some(p) => p.clone(),
            None => DeviceState {
                target_id: target_id.to_string(),
                raw_status,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_change: at,
                last_notified_raw_status: None,
                last_error: None,
                last_message: None,
                history: VecDeque::with_capacity(self.history_len),
            },
        };

        if success {
            state.consecutive_successes = state.consecutive_successes.saturating_add(1);
            state.consecutive_failures = 0;
            state.last_error = None;
            state.last_message = None;
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.consecutive_successes = 0;
            state.last_error = error;
            state.last_message = message;
        }

        if state.raw_status != raw_status {
            tracing::info!("State changed for {}: {} -> {}", target_id, state.raw_status, raw_status);
            state.raw_status = raw_status;
            state.last_change = at;
        }

        push_sample(&mut state.history, sample, self.history_len);
        state
    }
}

fn push_sample(history: &mut VecDeque<ProbeSample>, sample: ProbeSample, limit: usize) {
    history.push_back(sample);
    while history.len() > limit {
        history.pop_front();
    }
}
