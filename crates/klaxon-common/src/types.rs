use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A parsed metric line ready for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    pub timestamp: i64,
    pub value: f64,
    /// How far back history is kept for this metric, in seconds.
    pub retention: i64,
}

/// One sample inside a stored metric series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    Ok,
    Warn,
    Error,
    NoData,
    Exception,
}

impl State {
    /// Weight used for check scoring; worse states weigh more so the UI can
    /// sort triggers by severity.
    pub fn weight(self) -> i64 {
        match self {
            State::Ok => 0,
            State::Warn => 1,
            State::Error => 100,
            State::NoData => 1000,
            State::Exception => 100_000,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Ok => write!(f, "OK"),
            State::Warn => write!(f, "WARN"),
            State::Error => write!(f, "ERROR"),
            State::NoData => write!(f, "NODATA"),
            State::Exception => write!(f, "EXCEPTION"),
        }
    }
}

impl std::str::FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(State::Ok),
            "WARN" => Ok(State::Warn),
            "ERROR" => Ok(State::Error),
            "NODATA" => Ok(State::NoData),
            "EXCEPTION" => Ok(State::Exception),
            _ => Err(format!("unknown state: {s}")),
        }
    }
}

/// The state a vanished metric converts to once the trigger TTL elapses.
/// `Del` removes the metric sub-state without emitting an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TtlState {
    Ok,
    Warn,
    Error,
    NoData,
    Del,
}

impl TtlState {
    /// The transition state this TTL policy maps to, or `None` for `Del`.
    pub fn to_state(self) -> Option<State> {
        match self {
            TtlState::Ok => Some(State::Ok),
            TtlState::Warn => Some(State::Warn),
            TtlState::Error => Some(State::Error),
            TtlState::NoData => Some(State::NoData),
            TtlState::Del => None,
        }
    }
}

impl Default for TtlState {
    fn default() -> Self {
        TtlState::NoData
    }
}

/// A state-transition event produced by the checker and consumed by the
/// notifier event fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub trigger_id: String,
    pub metric: String,
    pub old_state: State,
    pub state: State,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A weekly schedule window with a timezone offset. Checks and subscriptions
/// outside the window are suppressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleData {
    /// Enabled days, Monday first.
    pub days: [bool; 7],
    /// Window start, minutes from local midnight.
    pub start_offset: i64,
    /// Window end, minutes from local midnight (inclusive).
    pub end_offset: i64,
    /// Minutes subtracted from UTC to obtain local time.
    pub tzoffset: i64,
}

impl Default for ScheduleData {
    fn default() -> Self {
        Self {
            days: [true; 7],
            start_offset: 0,
            end_offset: 1439,
            tzoffset: 0,
        }
    }
}

impl ScheduleData {
    /// Whether `timestamp` (Unix seconds, UTC) falls inside the window.
    pub fn is_scheduled(&self, timestamp: i64) -> bool {
        let local = timestamp - self.tzoffset * 60;
        let Some(dt) = DateTime::<Utc>::from_timestamp(local, 0) else {
            return false;
        };
        let day = dt.weekday().num_days_from_monday() as usize;
        if !self.days[day] {
            return false;
        }
        let minute_of_day = (dt.hour() * 60 + dt.minute()) as i64;
        minute_of_day >= self.start_offset && minute_of_day <= self.end_offset
    }
}

/// A user-defined alerting rule over metric series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerData {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    /// Metric-query expressions, each yielding a set of named series.
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_value: Option<f64>,
    /// Seconds without fresh data before a metric converts to `ttl_state`.
    pub ttl: i64,
    #[serde(default)]
    pub ttl_state: TtlState,
    #[serde(default)]
    pub schedule: ScheduleData,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Optional boolean formula over `t1..tn`, `warn_value`, `error_value`
    /// and `prev_state`. When absent the threshold defaults apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Wildcard patterns referenced by the targets.
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Per-metric check sub-state. `event_timestamp` always equals the timestamp
/// of the last transition event emitted for this metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricState {
    pub state: State,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppressed_until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_until: Option<i64>,
    pub event_timestamp: i64,
}

impl MetricState {
    pub fn new(state: State, timestamp: i64) -> Self {
        Self {
            state,
            timestamp,
            value: None,
            suppressed_until: None,
            maintenance_until: None,
            event_timestamp: timestamp,
        }
    }

    /// Transitions are suppressed inside a maintenance window or while an
    /// explicit suppression is active.
    pub fn is_suppressed(&self, now: i64) -> bool {
        self.maintenance_until.is_some_and(|until| now < until)
            || self.suppressed_until.is_some_and(|until| now < until)
    }
}

/// The persisted result of one trigger check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckData {
    pub state: State,
    pub timestamp: i64,
    pub score: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub metrics: HashMap<String, MetricState>,
    /// Timestamp of the last trigger-level transition event.
    pub event_timestamp: i64,
}

impl CheckData {
    pub fn new(state: State, timestamp: i64) -> Self {
        Self {
            state,
            timestamp,
            score: state.weight(),
            message: None,
            metrics: HashMap::new(),
            event_timestamp: timestamp,
        }
    }

    /// Recomputes the score from the trigger state and every metric sub-state.
    pub fn update_score(&mut self) {
        self.score = self.state.weight()
            + self
                .metrics
                .values()
                .map(|m| m.state.weight())
                .sum::<i64>();
    }
}

/// A matcher over trigger tags routing events to contacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub id: String,
    pub tags: Vec<String>,
    pub contacts: Vec<String>,
    #[serde(default)]
    pub schedule: ScheduleData,
    #[serde(default = "default_true")]
    pub throttling_enabled: bool,
    #[serde(default = "default_true")]
    pub sendings_enabled: bool,
    #[serde(default)]
    pub plotting_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl SubscriptionData {
    /// Matches when every subscription tag appears in the trigger tags.
    pub fn matches_tags(&self, trigger_tags: &[String]) -> bool {
        self.tags.iter().all(|tag| trigger_tags.contains(tag))
    }
}

/// A typed destination for notifications. `contact_type` selects the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactData {
    pub id: String,
    #[serde(rename = "type")]
    pub contact_type: String,
    pub value: String,
    #[serde(default)]
    pub user: String,
}

/// A notification waiting in the send-time sorted set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    pub event: EventData,
    /// Trigger snapshot taken at scheduling time.
    pub trigger: TriggerData,
    pub contact: ContactData,
    pub send_at: i64,
    pub throttled: bool,
    #[serde(default)]
    pub retries: u32,
}

/// Throttle record for one `(contact, trigger)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThrottlingRecord {
    /// Earliest allowed send time, Unix seconds.
    pub next_allowed: i64,
    /// Events counted when the current throttle step was applied.
    pub count: i64,
}
