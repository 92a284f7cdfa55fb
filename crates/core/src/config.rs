use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.kiss/config.toml`, overlaid with
/// environment variables. Every field has a conservative default so the
/// process starts even against an empty or missing file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub detectors: DetectorsConfig,
    #[serde(default)]
    pub timezone: TimezoneConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub crm: CrmConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
}

impl Config {
    /// Load config from `~/.kiss/config.toml`, falling back to defaults
    /// when the file does not exist. Environment variables named in this
    /// module's `env_*` accessors always take precedence over the file.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            Config::default()
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let mut cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".kiss")
            .join("config.toml")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("KISS_KV_URL") {
            self.kv.url = Some(v);
        }
        if let Ok(v) = std::env::var("KISS_ADMIN_TOKEN") {
            self.admin.token = Some(v);
        }
        if let Ok(v) = std::env::var("KISS_WORKER_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                self.queue.concurrency = n;
            }
        }
        if let Ok(v) = std::env::var("KISS_QUEUE_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.queue.max_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("KISS_QUEUE_BACKOFF_BASE_MS") {
            if let Ok(n) = v.parse() {
                self.queue.backoff_base_ms = n;
            }
        }
        if let Ok(v) = std::env::var("KISS_LOCK_TTL_SECS") {
            if let Ok(n) = v.parse() {
                self.lock.default_ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("KISS_LOCK_WAIT_SECS") {
            if let Ok(n) = v.parse() {
                self.lock.default_wait_secs = n;
            }
        }
        if let Ok(v) = std::env::var("KISS_QUEUE_NAME") {
            self.queue.default_queue_name = v;
        }
        if let Ok(v) = std::env::var("KISS_TIMEZONE") {
            self.timezone.name = v;
        }
        if let Ok(v) = std::env::var("KISS_CRM_TOKEN") {
            self.crm.api_token = Some(v);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_json")]
    pub log_json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: default_log_json(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_json() -> bool {
    false
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// Backend connection string. `None` means "local SQLite file under the
    /// data dir" — there is no requirement to run a separate KV service.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_kv_path")]
    pub sqlite_path: String,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: default_kv_path(),
        }
    }
}

fn default_kv_path() -> String {
    "~/.kiss/kv.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_lock_wait")]
    pub default_wait_secs: u64,
    #[serde(default = "default_case_lock_ttl")]
    pub case_lock_ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_lock_ttl(),
            default_wait_secs: default_lock_wait(),
            case_lock_ttl_secs: default_case_lock_ttl(),
        }
    }
}

fn default_lock_ttl() -> u64 {
    30
}
fn default_lock_wait() -> u64 {
    15
}
fn default_case_lock_ttl() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_job_deadline_secs")]
    pub job_deadline_secs: u64,
    #[serde(default = "default_stall_lease_secs")]
    pub stall_lease_secs: u64,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_queue_name")]
    pub default_queue_name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            job_deadline_secs: default_job_deadline_secs(),
            stall_lease_secs: default_stall_lease_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            default_queue_name: default_queue_name(),
        }
    }
}

fn default_concurrency() -> u32 {
    8
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_job_deadline_secs() -> u64 {
    45
}
fn default_stall_lease_secs() -> u64 {
    90
}
fn default_drain_timeout_secs() -> u64 {
    30
}
fn default_queue_name() -> String {
    "default".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_outbound_daily_cap")]
    pub outbound_daily_cap_per_recipient: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            outbound_daily_cap_per_recipient: default_outbound_daily_cap(),
        }
    }
}

fn default_outbound_daily_cap() -> i64 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorsConfig {
    #[serde(default = "default_detector_concurrency")]
    pub concurrency_cap: u32,
    #[serde(default = "default_starts_per_minute")]
    pub starts_per_minute: i64,
    #[serde(default)]
    pub registry_path: Option<String>,
}

impl Default for DetectorsConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: default_detector_concurrency(),
            starts_per_minute: default_starts_per_minute(),
            registry_path: None,
        }
    }
}

fn default_detector_concurrency() -> u32 {
    3
}
fn default_starts_per_minute() -> i64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimezoneConfig {
    /// Single process-wide timezone used for all cron schedules and
    /// quiet-hours windows (Open Question 4: the source varied this per
    /// module; we standardize on one).
    #[serde(default = "default_timezone")]
    pub name: String,
}

impl Default for TimezoneConfig {
    fn default() -> Self {
        Self {
            name: default_timezone(),
        }
    }
}

fn default_timezone() -> String {
    "America/Mexico_City".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminConfig {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CrmConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PaymentsConfig {
    #[serde(default)]
    pub providers: Vec<PaymentProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentProviderConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub webhook_secret: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_a_file() {
        let cfg = Config::default();
        assert_eq!(cfg.lock.default_ttl_secs, 30);
        assert_eq!(cfg.queue.job_deadline_secs, 45);
        assert_eq!(cfg.timezone.name, "America/Mexico_City");
    }

    #[test]
    fn roundtrips_through_toml() {
        let cfg = Config::default();
        let text = cfg.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.queue.max_attempts, cfg.queue.max_attempts);
    }
}
