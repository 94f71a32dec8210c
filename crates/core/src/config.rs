use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ── Top-level config ──────────────────────────────────────────

/// Full configuration for a task manager and its watchdog.
///
/// Parsed from `taskmill.toml` (every field has a default) with support for
/// environment variable overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskmillConfig {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,

    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

impl TaskmillConfig {
    /// Build config from defaults plus environment overrides (call `load_dotenv()` first).
    /// Profile is read from `TASKMILL_PROFILE`. When set (e.g. `PROD`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let profile = env_opt("TASKMILL_PROFILE").unwrap_or_default().to_uppercase();
        let mut config = Self {
            profile: profile.clone(),
            ..Self::default()
        };
        config.apply_overrides(|key| profiled_env_opt(&profile, key));
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        let profile = config.profile.to_uppercase();
        config.apply_overrides(|key| profiled_env_opt(&profile, key));
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply overrides from `lookup`.
    ///
    /// Convention: `TASKMILL_SECTION_KEY` overrides `section.key`.
    /// - `TASKMILL_MANAGER_MAX_CONCURRENT_TASKS` → `manager.max_concurrent_tasks`
    /// - `TASKMILL_MANAGER_ENABLE_WATCHDOG` → `manager.enable_watchdog`
    /// - `TASKMILL_MANAGER_AUTO_CANCEL_ON_TIMEOUT` → `manager.auto_cancel_on_timeout`
    /// - `TASKMILL_MANAGER_DEQUEUE_TIMEOUT_MS` → `manager.dequeue_timeout_ms`
    /// - `TASKMILL_MANAGER_STOP_GRACE_PERIOD_SECS` → `manager.stop_grace_period_secs`
    /// - `TASKMILL_WATCHDOG_CHECK_INTERVAL_MS` → `watchdog.check_interval_ms`
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, raw: String) -> Option<T> {
            let value = raw.trim().parse().ok();
            if value.is_none() {
                tracing::warn!(key, value = %raw, "ignoring unparseable config override");
            }
            value
        }

        if let Some(v) = lookup("TASKMILL_MANAGER_MAX_CONCURRENT_TASKS")
            .and_then(|raw| parsed("TASKMILL_MANAGER_MAX_CONCURRENT_TASKS", raw))
        {
            self.manager.max_concurrent_tasks = v;
        }
        if let Some(raw) = lookup("TASKMILL_MANAGER_ENABLE_WATCHDOG") {
            match parse_bool(&raw) {
                Some(v) => self.manager.enable_watchdog = v,
                None => tracing::warn!(value = %raw, "ignoring unparseable TASKMILL_MANAGER_ENABLE_WATCHDOG"),
            }
        }
        if let Some(raw) = lookup("TASKMILL_MANAGER_AUTO_CANCEL_ON_TIMEOUT") {
            match parse_bool(&raw) {
                Some(v) => self.manager.auto_cancel_on_timeout = v,
                None => tracing::warn!(value = %raw, "ignoring unparseable TASKMILL_MANAGER_AUTO_CANCEL_ON_TIMEOUT"),
            }
        }
        if let Some(v) = lookup("TASKMILL_MANAGER_DEQUEUE_TIMEOUT_MS")
            .and_then(|raw| parsed("TASKMILL_MANAGER_DEQUEUE_TIMEOUT_MS", raw))
        {
            self.manager.dequeue_timeout_ms = v;
        }
        if let Some(v) = lookup("TASKMILL_MANAGER_STOP_GRACE_PERIOD_SECS")
            .and_then(|raw| parsed("TASKMILL_MANAGER_STOP_GRACE_PERIOD_SECS", raw))
        {
            self.manager.stop_grace_period_secs = v;
        }
        if let Some(v) = lookup("TASKMILL_WATCHDOG_CHECK_INTERVAL_MS")
            .and_then(|raw| parsed("TASKMILL_WATCHDOG_CHECK_INTERVAL_MS", raw))
        {
            self.watchdog.check_interval_ms = v;
        }
    }

    // ── Validation ──────────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.manager.validate()?;
        self.watchdog.validate()?;
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  manager:   max_concurrent={}, watchdog={}, auto_cancel_on_timeout={}",
            self.manager.max_concurrent_tasks,
            self.manager.enable_watchdog,
            self.manager.auto_cancel_on_timeout
        );
        tracing::info!(
            "  loop:      dequeue_timeout={}ms, stop_grace={}s",
            self.manager.dequeue_timeout_ms,
            self.manager.stop_grace_period_secs
        );
        tracing::info!("  watchdog:  check_interval={}ms", self.watchdog.check_interval_ms);
    }

    /// Config as JSON, for status endpoints and reports.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "manager": self.manager,
            "watchdog": self.watchdog,
        })
    }
}

// ── Manager ───────────────────────────────────────────────────

/// Task manager section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Size of the global concurrency gate.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Construct and drive a watchdog alongside the manager.
    #[serde(default = "default_true")]
    pub enable_watchdog: bool,

    /// Cancel a task when the watchdog reports it overran its timeout.
    #[serde(default = "default_true")]
    pub auto_cancel_on_timeout: bool,

    /// Upper bound on one ready-queue wait in the scheduling loop.
    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,

    /// How long a graceful `stop()` waits before force-cancelling stragglers.
    #[serde(default = "default_stop_grace_period_secs")]
    pub stop_grace_period_secs: u64,
}

fn default_max_concurrent_tasks() -> usize { 10 }
fn default_true() -> bool { true }
fn default_dequeue_timeout_ms() -> u64 { 100 }
fn default_stop_grace_period_secs() -> u64 { 30 }

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            enable_watchdog: true,
            auto_cancel_on_timeout: true,
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
            stop_grace_period_secs: default_stop_grace_period_secs(),
        }
    }
}

impl ManagerConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "manager.max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if self.dequeue_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "manager.dequeue_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// ── Watchdog ──────────────────────────────────────────────────

/// Watchdog section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Interval between supervision passes.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

fn default_check_interval_ms() -> u64 { 1000 }

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl WatchdogConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.check_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults() {
        let cfg = TaskmillConfig::default();
        assert_eq!(cfg.manager.max_concurrent_tasks, 10);
        assert!(cfg.manager.enable_watchdog);
        assert!(cfg.manager.auto_cancel_on_timeout);
        assert_eq!(cfg.manager.dequeue_timeout(), Duration::from_millis(100));
        assert_eq!(cfg.manager.stop_grace_period(), Duration::from_secs(30));
        assert_eq!(cfg.watchdog.check_interval(), Duration::from_secs(1));
        assert_eq!(cfg.profile_label(), "default");
    }

    #[test]
    fn parse_partial_toml() {
        let toml = r#"
[manager]
max_concurrent_tasks = 4
enable_watchdog = false
"#;
        let cfg: TaskmillConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.manager.max_concurrent_tasks, 4);
        assert!(!cfg.manager.enable_watchdog);
        assert!(cfg.manager.auto_cancel_on_timeout); // default
        assert_eq!(cfg.watchdog.check_interval_ms, 1000); // default
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
profile = "staging"

[manager]
max_concurrent_tasks = 2
enable_watchdog = true
auto_cancel_on_timeout = false
dequeue_timeout_ms = 25
stop_grace_period_secs = 5

[watchdog]
check_interval_ms = 50
"#;
        let cfg: TaskmillConfig = toml::from_str(toml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.profile_label(), "staging");
        assert_eq!(cfg.manager.dequeue_timeout(), Duration::from_millis(25));
        assert_eq!(cfg.manager.stop_grace_period(), Duration::from_secs(5));
        assert!(!cfg.manager.auto_cancel_on_timeout);
        assert_eq!(cfg.watchdog.check_interval(), Duration::from_millis(50));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let toml = r#"
[manager]
max_concurrent_tasks = 0
"#;
        let err = TaskmillConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("max_concurrent_tasks"));
    }

    #[test]
    fn rejects_zero_check_interval() {
        let mut cfg = TaskmillConfig::default();
        cfg.watchdog.check_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = TaskmillConfig::from_toml("[manager\nmax = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn overrides_apply_known_keys() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TASKMILL_MANAGER_MAX_CONCURRENT_TASKS", "3"),
            ("TASKMILL_MANAGER_ENABLE_WATCHDOG", "off"),
            ("TASKMILL_MANAGER_AUTO_CANCEL_ON_TIMEOUT", "no"),
            ("TASKMILL_MANAGER_DEQUEUE_TIMEOUT_MS", "20"),
            ("TASKMILL_MANAGER_STOP_GRACE_PERIOD_SECS", "1"),
            ("TASKMILL_WATCHDOG_CHECK_INTERVAL_MS", "10"),
        ]);
        let mut cfg = TaskmillConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.manager.max_concurrent_tasks, 3);
        assert!(!cfg.manager.enable_watchdog);
        assert!(!cfg.manager.auto_cancel_on_timeout);
        assert_eq!(cfg.manager.dequeue_timeout_ms, 20);
        assert_eq!(cfg.manager.stop_grace_period_secs, 1);
        assert_eq!(cfg.watchdog.check_interval_ms, 10);
    }

    #[test]
    fn overrides_ignore_garbage() {
        let mut cfg = TaskmillConfig::default();
        cfg.apply_overrides(|k| match k {
            "TASKMILL_MANAGER_MAX_CONCURRENT_TASKS" => Some("many".to_string()),
            "TASKMILL_MANAGER_ENABLE_WATCHDOG" => Some("maybe".to_string()),
            _ => None,
        });
        assert_eq!(cfg.manager.max_concurrent_tasks, 10);
        assert!(cfg.manager.enable_watchdog);
    }

    #[test]
    fn summary_is_json() {
        let cfg = TaskmillConfig::default();
        let summary = cfg.summary();
        assert_eq!(summary["profile"], "default");
        assert_eq!(summary["manager"]["max_concurrent_tasks"], 10);
        assert_eq!(summary["watchdog"]["check_interval_ms"], 1000);
    }
}
