use crate::cache::TriggerCache;
use crate::error::{CheckError, CheckResult};
use crate::expression::{eval_condition, parse, Node, Value};
use crate::functions::TimeSeries;
use crate::target::TargetEvaluator;
use chrono::Utc;
use klaxon_common::types::{
    CheckData, EventData, MetricState, MetricValue, State, TriggerData,
};
use klaxon_store::Store;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Consecutive EXCEPTION checks before the administrators are paged.
const EXCEPTION_ESCALATION_THRESHOLD: u32 = 3;

/// Reschedule jitter bound, fraction of the base interval.
const JITTER_FRACTION: i64 = 10;

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Base per-trigger check cadence.
    pub check_interval: Duration,
    /// Advisory lock TTL. Longer than any evaluation, short enough to
    /// recover a crashed holder within one check interval.
    pub lock_ttl: Duration,
    /// Seconds the evaluation window reaches back past the last check.
    pub window_slack: i64,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(30),
            window_slack: 600,
        }
    }
}

/// Evaluates one trigger at a time under the store advisory lock: fetches
/// the metric windows, derives per-metric state, emits transition events and
/// persists the new check record.
pub struct TriggerChecker {
    store: Arc<dyn Store>,
    cache: TriggerCache,
    targets: TargetEvaluator,
    config: CheckerConfig,
    exception_counts: Mutex<HashMap<String, u32>>,
    escalations: mpsc::Sender<String>,
}

impl TriggerChecker {
    pub fn new(
        store: Arc<dyn Store>,
        cache: TriggerCache,
        config: CheckerConfig,
        escalations: mpsc::Sender<String>,
    ) -> Self {
        Self {
            targets: TargetEvaluator::new(store.clone()),
            store,
            cache,
            config,
            exception_counts: Mutex::new(HashMap::new()),
            escalations,
        }
    }

    /// Runs one check cycle for `trigger_id`. Skips silently when another
    /// worker holds the trigger lock.
    pub async fn check(&self, trigger_id: &str) -> CheckResult<()> {
        if !self
            .store
            .acquire_trigger_check_lock(trigger_id, self.config.lock_ttl)
            .await?
        {
            return Ok(());
        }
        let result = self.check_locked(trigger_id).await;
        if let Err(e) = self.store.release_trigger_check_lock(trigger_id).await {
            tracing::warn!(trigger_id = %trigger_id, error = %e, "Failed to release check lock");
        }
        result
    }

    async fn check_locked(&self, trigger_id: &str) -> CheckResult<()> {
        let Some(trigger) = self.cache.get(trigger_id).await? else {
            tracing::info!(trigger_id = %trigger_id, "Trigger no longer exists, dropping check state");
            self.store.delete_trigger_last_check(trigger_id).await?;
            return Ok(());
        };

        let now = Utc::now().timestamp();
        let last_check = self
            .store
            .get_trigger_last_check(trigger_id)
            .await?
            .unwrap_or_else(|| CheckData::new(State::NoData, now));

        let mut from = last_check.timestamp - self.config.window_slack;
        if trigger.ttl > 0 {
            from = from.max(now - trigger.ttl);
        }

        match self.evaluate(&trigger, &last_check, from, now).await {
            Ok((mut check, mut events)) => {
                self.exception_counts.lock().remove(trigger_id);

                // Recovery from a trigger-level exception is itself a
                // transition.
                if last_check.state == State::Exception && check.state != State::Exception {
                    if trigger.schedule.is_scheduled(now) {
                        events.push(EventData {
                            trigger_id: trigger.id.clone(),
                            metric: trigger.name.clone(),
                            old_state: State::Exception,
                            state: check.state,
                            timestamp: now,
                            value: None,
                            message: Some("Trigger evaluation recovered".to_string()),
                        });
                    }
                    check.event_timestamp = now;
                }

                check.update_score();
                self.store.set_trigger_last_check(trigger_id, &check).await?;

                events.sort_by_key(|event| event.timestamp);
                for event in events {
                    self.store.push_event(&event).await?;
                }
            }
            Err(CheckError::Store(e)) => {
                // Transient; the next scheduled check retries.
                self.reschedule(trigger_id, now).await?;
                return Err(e.into());
            }
            Err(error) => {
                self.record_exception(&trigger, &last_check, now, &error).await?;
            }
        }

        self.reschedule(trigger_id, now).await
    }

    async fn reschedule(&self, trigger_id: &str, now: i64) -> CheckResult<()> {
        let base = self.config.check_interval.as_secs().max(1) as i64;
        let jitter = rand::thread_rng().gen_range(0..=base / JITTER_FRACTION);
        self.store
            .reschedule_trigger(trigger_id, now + base + jitter)
            .await?;
        Ok(())
    }

    async fn record_exception(
        &self,
        trigger: &TriggerData,
        last_check: &CheckData,
        now: i64,
        error: &CheckError,
    ) -> CheckResult<()> {
        tracing::error!(trigger_id = %trigger.id, error = %error, "Trigger evaluation failed");

        let count = {
            let mut counts = self.exception_counts.lock();
            let count = counts.entry(trigger.id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let mut check = last_check.clone();
        let old_state = check.state;
        check.state = State::Exception;
        check.timestamp = now;
        check.message = Some(error.to_string());

        let mut event = None;
        if old_state != State::Exception {
            check.event_timestamp = now;
            if trigger.schedule.is_scheduled(now) {
                event = Some(EventData {
                    trigger_id: trigger.id.clone(),
                    metric: trigger.name.clone(),
                    old_state,
                    state: State::Exception,
                    timestamp: now,
                    value: None,
                    message: Some(error.to_string()),
                });
            }
        }

        check.update_score();
        self.store.set_trigger_last_check(&trigger.id, &check).await?;
        if let Some(event) = event {
            self.store.push_event(&event).await?;
        }

        if count == EXCEPTION_ESCALATION_THRESHOLD {
            let message = format!(
                "Trigger '{}' ({}) failed {count} consecutive checks: {error}",
                trigger.name, trigger.id
            );
            if self.escalations.try_send(message).is_err() {
                tracing::warn!(trigger_id = %trigger.id, "Escalation channel unavailable, dropping admin alert");
            }
        }
        Ok(())
    }

    /// Evaluates every target, derives the candidate state for each metric
    /// and folds transitions into a fresh check record.
    async fn evaluate(
        &self,
        trigger: &TriggerData,
        last_check: &CheckData,
        from: i64,
        now: i64,
    ) -> CheckResult<(CheckData, Vec<EventData>)> {
        let condition = trigger
            .expression
            .as_deref()
            .map(parse)
            .transpose()?;

        let mut target_series: Vec<HashMap<String, TimeSeries>> = Vec::new();
        for target in &trigger.targets {
            let series = self.targets.evaluate(target, from, now).await?;
            let mut by_name = HashMap::new();
            for s in series {
                by_name.insert(s.name.clone(), s);
            }
            target_series.push(by_name);
        }

        let metric_names: BTreeSet<String> = target_series
            .iter()
            .flat_map(|map| map.keys().cloned())
            .collect();

        let scheduled = trigger.schedule.is_scheduled(now);
        let mut events = Vec::new();
        let mut new_metrics: HashMap<String, MetricState> = HashMap::new();

        for name in &metric_names {
            let prior = last_check.metrics.get(name);
            let values: Option<Vec<MetricValue>> =
                target_values(&target_series, name).into_iter().collect();

            let (candidate, candidate_ts, candidate_value) = match values {
                Some(values) => {
                    let primary = values[0];
                    let state = derive_state(trigger, condition.as_ref(), &values, prior)?;
                    (state, primary.timestamp, Some(primary.value))
                }
                None => {
                    // A target lost this metric: per-metric NODATA policy.
                    let ts = prior.map(|p| p.timestamp).unwrap_or(now);
                    (State::NoData, ts, None)
                }
            };

            let mut metric_state = prior.cloned().unwrap_or_else(|| {
                // A fresh metric starts from OK so its first crossing emits
                // a transition.
                MetricState {
                    state: State::Ok,
                    timestamp: candidate_ts,
                    value: None,
                    suppressed_until: None,
                    maintenance_until: None,
                    event_timestamp: candidate_ts,
                }
            });

            let old_state = metric_state.state;
            if candidate != old_state {
                let event_ts = candidate_ts.max(metric_state.event_timestamp);
                if scheduled && !metric_state.is_suppressed(now) {
                    events.push(EventData {
                        trigger_id: trigger.id.clone(),
                        metric: name.clone(),
                        old_state,
                        state: candidate,
                        timestamp: event_ts,
                        value: candidate_value,
                        message: None,
                    });
                    metric_state.event_timestamp = event_ts;
                }
                metric_state.state = candidate;
            }
            metric_state.timestamp = candidate_ts.max(metric_state.timestamp);
            metric_state.value = candidate_value;
            new_metrics.insert(name.clone(), metric_state);
        }

        // Metrics present last time but absent now: convert to the TTL state
        // once history runs out, carry over otherwise.
        for (name, prior) in &last_check.metrics {
            if metric_names.contains(name) {
                continue;
            }
            if trigger.ttl > 0 && now - prior.timestamp >= trigger.ttl {
                let Some(ttl_target) = trigger.ttl_state.to_state() else {
                    // DEL: forget the metric without an event.
                    continue;
                };
                let mut metric_state = prior.clone();
                if ttl_target != metric_state.state {
                    let event_ts = now.max(metric_state.event_timestamp);
                    if scheduled && !metric_state.is_suppressed(now) {
                        events.push(EventData {
                            trigger_id: trigger.id.clone(),
                            metric: name.clone(),
                            old_state: metric_state.state,
                            state: ttl_target,
                            timestamp: event_ts,
                            value: None,
                            message: None,
                        });
                        metric_state.event_timestamp = event_ts;
                    }
                    metric_state.state = ttl_target;
                }
                new_metrics.insert(name.clone(), metric_state);
            } else {
                new_metrics.insert(name.clone(), prior.clone());
            }
        }

        let worst = new_metrics
            .values()
            .map(|m| m.state)
            .max_by_key(|state| state.weight())
            .unwrap_or(State::Ok);

        let check = CheckData {
            state: worst,
            timestamp: now,
            score: 0,
            message: None,
            metrics: new_metrics,
            event_timestamp: last_check.event_timestamp,
        };
        Ok((check, events))
    }
}

/// Latest value of each target at `name`. A target missing the metric but
/// carrying exactly one series acts as a scalar for every metric.
fn target_values(
    target_series: &[HashMap<String, TimeSeries>],
    name: &str,
) -> Vec<Option<MetricValue>> {
    target_series
        .iter()
        .map(|map| {
            map.get(name)
                .and_then(TimeSeries::last_value)
                .or_else(|| {
                    if map.len() == 1 {
                        map.values().next().and_then(TimeSeries::last_value)
                    } else {
                        None
                    }
                })
        })
        .collect()
}

fn derive_state(
    trigger: &TriggerData,
    condition: Option<&Node>,
    values: &[MetricValue],
    prior: Option<&MetricState>,
) -> CheckResult<State> {
    if let Some(node) = condition {
        let mut vars = HashMap::new();
        for (i, point) in values.iter().enumerate() {
            vars.insert(format!("t{}", i + 1), Value::Num(point.value));
        }
        if let Some(warn) = trigger.warn_value {
            vars.insert("warn_value".to_string(), Value::Num(warn));
            vars.insert("WARN_VALUE".to_string(), Value::Num(warn));
        }
        if let Some(error) = trigger.error_value {
            vars.insert("error_value".to_string(), Value::Num(error));
            vars.insert("ERROR_VALUE".to_string(), Value::Num(error));
        }
        let prev = prior.map(|p| p.state).unwrap_or(State::Ok);
        vars.insert("prev_state".to_string(), Value::State(prev));
        vars.insert("PREV_STATE".to_string(), Value::State(prev));

        return match eval_condition(node, &vars)? {
            Value::State(state) => Ok(state),
            other => Err(CheckError::Type(format!(
                "condition must evaluate to a state, got {other:?}"
            ))),
        };
    }

    let (Some(warn), Some(error)) = (trigger.warn_value, trigger.error_value) else {
        return Err(CheckError::Type(
            "trigger has neither an expression nor warn/error thresholds".into(),
        ));
    };
    let value = values[0].value;

    // warn_value > error_value encodes "low is bad".
    let state = if error >= warn {
        if value >= error {
            State::Error
        } else if value >= warn {
            State::Warn
        } else {
            State::Ok
        }
    } else if value <= error {
        State::Error
    } else if value <= warn {
        State::Warn
    } else {
        State::Ok
    };
    Ok(state)
}
