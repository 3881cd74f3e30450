use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `CAMPAIGN_OUTREACH__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

// ─── Engine Config ──────────────────────────────────────────────────────

/// What a condition node does when its metric never arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionTimeoutPolicy {
    /// Take the `no` branch and keep going.
    #[default]
    NoBranch,
    /// Halt the journey as `failed`.
    Fail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_condition_timeout_hours")]
    pub condition_timeout_hours: u32,
    #[serde(default)]
    pub on_condition_timeout: ConditionTimeoutPolicy,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_condition_timeout_hours() -> u32 { 168 }
fn default_tick_interval_ms() -> u64 { 1000 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            condition_timeout_hours: default_condition_timeout_hours(),
            on_condition_timeout: ConditionTimeoutPolicy::default(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

// ─── Dispatcher Config ──────────────────────────────────────────────────

/// Which budget the daily action limit is charged against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    /// One budget per channel account, shared by every campaign using it.
    #[default]
    Account,
    /// One budget per campaign.
    Campaign,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_retry_backoff_max_secs")]
    pub retry_backoff_max_secs: u64,
    #[serde(default = "default_in_flight_timeout_secs")]
    pub in_flight_timeout_secs: u64,
    #[serde(default)]
    pub quota_scope: QuotaScope,
    #[serde(default = "default_daily_limit")]
    pub default_daily_limit: u32,
}

fn default_max_concurrent_dispatches() -> usize { 16 }
fn default_retry_backoff_secs() -> u64 { 300 }
fn default_retry_backoff_max_secs() -> u64 { 3600 }
fn default_in_flight_timeout_secs() -> u64 { 900 }
fn default_daily_limit() -> u32 { 100 }

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
            retry_backoff_secs: default_retry_backoff_secs(),
            retry_backoff_max_secs: default_retry_backoff_max_secs(),
            in_flight_timeout_secs: default_in_flight_timeout_secs(),
            quota_scope: QuotaScope::default(),
            default_daily_limit: default_daily_limit(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            engine: EngineConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("CAMPAIGN_OUTREACH")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
