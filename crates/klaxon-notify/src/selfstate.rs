use chrono::Utc;
use klaxon_common::types::{
    ContactData, EventData, ScheduleData, ScheduledNotification, State, TriggerData, TtlState,
};
use klaxon_store::{Store, HEARTBEAT_CHECKER, HEARTBEAT_FILTER};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Trigger ID stamped on synthetic watchdog notifications.
const SELFSTATE_TRIGGER_ID: &str = "klaxon-selfstate";

#[derive(Debug, Clone)]
pub struct SelfStateConfig {
    pub enabled: bool,
    /// Probe cadence, clamped to at least ten seconds.
    pub check_interval: Duration,
    /// Max age of the filter heartbeat before the engine counts as deaf.
    pub last_metric_delay: i64,
    /// Max age of the checker heartbeat before checks count as stalled.
    pub last_check_delay: i64,
    /// Seconds before an uncleared condition is alerted again.
    pub realert_interval: i64,
    pub admin_contacts: Vec<ContactData>,
}

impl Default for SelfStateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval: Duration::from_secs(10),
            last_metric_delay: 60,
            last_check_delay: 120,
            realert_interval: 600,
            admin_contacts: Vec::new(),
        }
    }
}

/// Liveness watchdog. Reads the heartbeat keys the other components write,
/// probes store reachability, and schedules administrator notifications
/// directly into the notifier's sorted set, bypassing trigger evaluation.
/// Checker exception escalations arrive over a channel and are forwarded
/// the same way.
pub struct SelfStateWorker {
    store: Arc<dyn Store>,
    config: SelfStateConfig,
    escalations: mpsc::Receiver<String>,
    /// Condition key to the last alert time; cleared when the condition
    /// recovers.
    alerted: HashMap<String, i64>,
    started_at: i64,
}

impl SelfStateWorker {
    pub fn new(
        store: Arc<dyn Store>,
        config: SelfStateConfig,
        escalations: mpsc::Receiver<String>,
    ) -> Self {
        Self {
            store,
            config,
            escalations,
            alerted: HashMap::new(),
            started_at: Utc::now().timestamp(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let interval = self.config.check_interval.max(Duration::from_secs(10));
        let mut tick = tokio::time::interval(interval);
        let mut escalations_open = true;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    self.probe().await;
                }
                message = self.escalations.recv(), if escalations_open => {
                    match message {
                        Some(message) => {
                            let now = Utc::now().timestamp();
                            self.notify_admins("checker-exceptions", &message, now).await;
                        }
                        None => escalations_open = false,
                    }
                }
            }
        }
        tracing::info!("Self-state watchdog stopped");
    }

    pub(crate) async fn probe(&mut self) {
        let now = Utc::now().timestamp();
        let mut conditions: Vec<(&'static str, String)> = Vec::new();

        if let Err(e) = self.store.ping().await {
            conditions.push(("store", format!("Store is unreachable: {e}")));
        } else {
            match self.heartbeat_age(HEARTBEAT_FILTER, now).await {
                Some(age) if age > self.config.last_metric_delay => {
                    conditions.push(("filter", format!("No metrics received for {age} seconds")));
                }
                _ => {}
            }
            match self.heartbeat_age(HEARTBEAT_CHECKER, now).await {
                Some(age) if age > self.config.last_check_delay => {
                    conditions.push(("checker", format!("No trigger checks for {age} seconds")));
                }
                _ => {}
            }
        }

        for (key, message) in &conditions {
            if self.should_alert(key, now) {
                self.notify_admins(key, message, now).await;
                self.alerted.insert(key.to_string(), now);
            }
        }

        // A cleared condition re-alerts immediately on its next breach.
        self.alerted
            .retain(|key, _| conditions.iter().any(|(active, _)| key.as_str() == *active));
    }

    /// `None` means the heartbeat read failed; the next probe retries.
    async fn heartbeat_age(&self, key: &str, now: i64) -> Option<i64> {
        match self.store.get_heartbeat(key).await {
            Ok(timestamp) => Some(now - timestamp.unwrap_or(self.started_at)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to read heartbeat");
                None
            }
        }
    }

    fn should_alert(&self, key: &str, now: i64) -> bool {
        match self.alerted.get(key) {
            None => true,
            Some(last) => now - last >= self.config.realert_interval,
        }
    }

    async fn notify_admins(&self, condition: &str, message: &str, now: i64) {
        tracing::error!(condition = %condition, message = %message, "Self-state alert");

        let event = EventData {
            trigger_id: SELFSTATE_TRIGGER_ID.to_string(),
            metric: condition.to_string(),
            old_state: State::NoData,
            state: State::Error,
            timestamp: now,
            value: None,
            message: Some(message.to_string()),
        };
        let trigger = TriggerData {
            id: SELFSTATE_TRIGGER_ID.to_string(),
            name: "Klaxon self-state".to_string(),
            desc: Some("Engine liveness watchdog".to_string()),
            targets: Vec::new(),
            warn_value: None,
            error_value: None,
            ttl: 0,
            ttl_state: TtlState::NoData,
            schedule: ScheduleData::default(),
            tags: Vec::new(),
            expression: None,
            patterns: Vec::new(),
        };

        for contact in &self.config.admin_contacts {
            let notification = ScheduledNotification {
                event: event.clone(),
                trigger: trigger.clone(),
                contact: contact.clone(),
                send_at: now,
                throttled: false,
                retries: 0,
            };
            if let Err(e) = self.store.add_notification(&notification).await {
                tracing::error!(
                    contact_id = %contact.id,
                    error = %e,
                    "Failed to schedule self-state notification"
                );
            }
        }
    }
}
