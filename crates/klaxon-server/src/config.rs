use klaxon_common::types::ContactData;
use klaxon_notify::notifications::NotificationsConfig;
use klaxon_notify::plugin::SenderSettings;
use klaxon_notify::scheduler::ThrottlingPolicy;
use klaxon_notify::selfstate::SelfStateConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Hierarchical daemon configuration, one section per component.
/// Every field has a default, so an empty file is a valid configuration and
/// `--default-config` prints the complete effective settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub graphite: GraphiteConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub checker: CheckerConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config '{}': {e}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("cannot parse config '{}': {e}", path.display()))?;
        Ok(config)
    }

    /// The complete settings as TOML; reading this back yields an identical
    /// configuration.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default level for the `klaxon` crates; `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Deadline applied to store calls, including the startup probe.
    #[serde(default = "default_store_timeout_secs")]
    pub op_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            op_timeout_secs: default_store_timeout_secs(),
        }
    }
}

/// Settings for the external metrics reporter. Parsed and validated here;
/// the reporter itself runs outside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphiteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_graphite_uri")]
    pub uri: String,
    #[serde(default = "default_graphite_prefix")]
    pub prefix: String,
    #[serde(default = "default_graphite_interval_secs")]
    pub interval_secs: u64,
}

impl Default for GraphiteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            uri: default_graphite_uri(),
            prefix: default_graphite_prefix(),
            interval_secs: default_graphite_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// TCP and UDP bind address for the metric line protocol.
    #[serde(default = "default_filter_listen")]
    pub listen: String,
    /// Retention stamped on accepted points, seconds.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: i64,
    #[serde(default = "default_parser_workers")]
    pub parser_workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_queue_size")]
    pub line_queue_size: usize,
    #[serde(default = "default_queue_size")]
    pub point_queue_size: usize,
    #[serde(default = "default_index_refresh_secs")]
    pub index_refresh_secs: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            listen: default_filter_listen(),
            retention_secs: default_retention_secs(),
            parser_workers: default_parser_workers(),
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval_secs(),
            line_queue_size: default_queue_size(),
            point_queue_size: default_queue_size(),
            index_refresh_secs: default_index_refresh_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// Base per-trigger check cadence, jittered by up to 10 % on reschedule.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Full-sweep cadence guaranteeing NODATA transitions for idle triggers.
    #[serde(default = "default_nodata_check_interval_secs")]
    pub nodata_check_interval_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_checker_workers")]
    pub worker_count: usize,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Seconds the evaluation window reaches back past the last check.
    #[serde(default = "default_window_slack_secs")]
    pub window_slack_secs: i64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            nodata_check_interval_secs: default_nodata_check_interval_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            worker_count: default_checker_workers(),
            lock_ttl_secs: default_lock_ttl_secs(),
            window_slack_secs: default_window_slack_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            queue_size: default_queue_size(),
        }
    }
}

impl CheckerConfig {
    pub fn checker_config(&self) -> klaxon_checker::check::CheckerConfig {
        klaxon_checker::check::CheckerConfig {
            check_interval: Duration::from_secs(self.check_interval_secs),
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            window_slack: self.window_slack_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_sender_workers")]
    pub sender_workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: i64,
    #[serde(default)]
    pub throttling: ThrottlingConfig,
    #[serde(default)]
    pub self_state: SelfStateSection,
    /// Sender definitions; each map carries at least `type`.
    #[serde(default)]
    pub senders: Vec<SenderDefinition>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            sender_workers: default_sender_workers(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
            throttling: ThrottlingConfig::default(),
            self_state: SelfStateSection::default(),
            senders: Vec::new(),
        }
    }
}

impl NotifierConfig {
    pub fn notifications_config(&self) -> NotificationsConfig {
        NotificationsConfig {
            tick: Duration::from_secs(1),
            max_retries: self.max_retries,
            retry_backoff: self.retry_backoff_secs,
            sender_workers: self.sender_workers,
        }
    }

    pub fn sender_definitions(&self) -> Vec<SenderSettings> {
        self.senders.iter().map(|s| s.settings.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottlingConfig {
    #[serde(default = "default_throttle_low_count")]
    pub low_count: i64,
    #[serde(default = "default_throttle_medium_count")]
    pub medium_count: i64,
    #[serde(default = "default_throttle_high_count")]
    pub high_count: i64,
    #[serde(default = "default_throttle_first_delay_secs")]
    pub first_delay_secs: i64,
    #[serde(default = "default_throttle_second_delay_secs")]
    pub second_delay_secs: i64,
    #[serde(default = "default_throttle_third_delay_secs")]
    pub third_delay_secs: i64,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            low_count: default_throttle_low_count(),
            medium_count: default_throttle_medium_count(),
            high_count: default_throttle_high_count(),
            first_delay_secs: default_throttle_first_delay_secs(),
            second_delay_secs: default_throttle_second_delay_secs(),
            third_delay_secs: default_throttle_third_delay_secs(),
        }
    }
}

impl ThrottlingConfig {
    pub fn policy(&self) -> ThrottlingPolicy {
        ThrottlingPolicy {
            low_count: self.low_count,
            medium_count: self.medium_count,
            high_count: self.high_count,
            first_delay: self.first_delay_secs,
            second_delay: self.second_delay_secs,
            third_delay: self.third_delay_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfStateSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_selfstate_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_last_metric_delay_secs")]
    pub last_metric_delay_secs: i64,
    #[serde(default = "default_last_check_delay_secs")]
    pub last_check_delay_secs: i64,
    #[serde(default = "default_realert_interval_secs")]
    pub realert_interval_secs: i64,
    #[serde(default)]
    pub admin_contacts: Vec<AdminContact>,
}

impl Default for SelfStateSection {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_secs: default_selfstate_interval_secs(),
            last_metric_delay_secs: default_last_metric_delay_secs(),
            last_check_delay_secs: default_last_check_delay_secs(),
            realert_interval_secs: default_realert_interval_secs(),
            admin_contacts: Vec::new(),
        }
    }
}

impl SelfStateSection {
    pub fn self_state_config(&self) -> SelfStateConfig {
        SelfStateConfig {
            enabled: self.enabled,
            check_interval: Duration::from_secs(self.check_interval_secs),
            last_metric_delay: self.last_metric_delay_secs,
            last_check_delay: self.last_check_delay_secs,
            realert_interval: self.realert_interval_secs,
            admin_contacts: self
                .admin_contacts
                .iter()
                .enumerate()
                .map(|(i, admin)| ContactData {
                    id: format!("selfstate-admin-{i}"),
                    contact_type: admin.contact_type.clone(),
                    value: admin.value.clone(),
                    user: String::new(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminContact {
    #[serde(rename = "type")]
    pub contact_type: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderDefinition {
    #[serde(flatten)]
    pub settings: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_store_timeout_secs() -> u64 {
    5
}

fn default_graphite_uri() -> String {
    "localhost:2003".to_string()
}

fn default_graphite_prefix() -> String {
    "klaxon".to_string()
}

fn default_graphite_interval_secs() -> u64 {
    60
}

fn default_filter_listen() -> String {
    "127.0.0.1:2003".to_string()
}

fn default_retention_secs() -> i64 {
    3600
}

fn default_parser_workers() -> usize {
    4
}

fn default_batch_size() -> usize {
    500
}

fn default_flush_interval_secs() -> u64 {
    1
}

fn default_queue_size() -> usize {
    16384
}

fn default_index_refresh_secs() -> u64 {
    1
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_nodata_check_interval_secs() -> u64 {
    60
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_checker_workers() -> usize {
    4
}

fn default_lock_ttl_secs() -> u64 {
    30
}

fn default_window_slack_secs() -> i64 {
    600
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_sender_workers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_secs() -> i64 {
    30
}

fn default_throttle_low_count() -> i64 {
    10
}

fn default_throttle_medium_count() -> i64 {
    20
}

fn default_throttle_high_count() -> i64 {
    30
}

fn default_throttle_first_delay_secs() -> i64 {
    1800
}

fn default_throttle_second_delay_secs() -> i64 {
    3600
}

fn default_throttle_third_delay_secs() -> i64 {
    10800
}

fn default_selfstate_interval_secs() -> u64 {
    10
}

fn default_last_metric_delay_secs() -> i64 {
    60
}

fn default_last_check_delay_secs() -> i64 {
    120
}

fn default_realert_interval_secs() -> i64 {
    600
}
