use crate::error::ReconcileError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Минимально допустимый порог простоя
pub const MIN_IDLE_THRESHOLD_SECS: u64 = 60;

/// Окна "тишины" после локальных действий: reconciler не спорит с переходом,
/// который пользователь только что сделал, пока сервер не догнал.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraceWindows {
    /// After a local start: server STOPPED / no active entry is ignored
    pub post_start_secs: u64,
    /// After a local resume: server PAUSED or STOPPED is ignored
    pub resume_protection_secs: u64,
    /// After a local pause: server RUNNING does not resume the engine
    pub post_pause_secs: u64,
    /// After a local stop: server RUNNING does not restart the engine
    pub post_stop_secs: u64,
}

impl Default for GraceWindows {
    fn default() -> Self {
        Self {
            post_start_secs: 15,
            resume_protection_secs: 30,
            post_pause_secs: 15,
            post_stop_secs: 15,
        }
    }
}

impl GraceWindows {
    pub fn post_start(&self) -> Duration {
        Duration::from_secs(self.post_start_secs)
    }

    pub fn resume_protection(&self) -> Duration {
        Duration::from_secs(self.resume_protection_secs)
    }

    pub fn post_pause(&self) -> Duration {
        Duration::from_secs(self.post_pause_secs)
    }

    pub fn post_stop(&self) -> Duration {
        Duration::from_secs(self.post_stop_secs)
    }
}

/// Конфигурация движка согласования (api_base_url, таймауты, интервалы, окна)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub api_base_url: String,
    /// App version sent in X-App-Version header for debugging version skew
    pub app_version: String,
    pub http_timeout_secs: u64,
    /// Batched activity uploads may take longer than ordinary calls
    pub upload_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
    pub idle_check_interval_secs: u64,
    pub audit_interval_secs: u64,
    pub flush_interval_secs: u64,
    pub save_state_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub idle_threshold_secs: u64,
    pub max_retries: i32,
    /// Consecutive audit cycles a held lock is tolerated before force release
    pub max_lock_skips: u32,
    pub max_activity_batch: usize,
    /// Window in which concurrent "load active entry" callers share one result
    pub entry_load_coalesce_ms: u64,
    pub online_probe_urls: Vec<String>,
    pub grace: GraceWindows,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://app.automatonsoft.de/api".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            http_timeout_secs: 30,
            upload_timeout_secs: 120,
            reconcile_interval_secs: 30,
            idle_check_interval_secs: 10,
            audit_interval_secs: 5,
            flush_interval_secs: 60,
            save_state_interval_secs: 30,
            heartbeat_interval_secs: 60,
            idle_threshold_secs: 120,
            max_retries: 5,
            max_lock_skips: 6,
            max_activity_batch: 100,
            entry_load_coalesce_ms: 2000,
            online_probe_urls: vec![
                "https://www.cloudflare.com/cdn-cgi/trace".to_string(),
                "https://www.google.com/generate_204".to_string(),
            ],
            grace: GraceWindows::default(),
        }
    }
}

impl ReconcileConfig {
    /// Defaults with `HUBNITY_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("HUBNITY_API_URL") {
            if !url.trim().is_empty() {
                config.api_base_url = url.trim().trim_end_matches('/').to_string();
            }
        }
        if let Some(secs) = env_u64("HUBNITY_IDLE_THRESHOLD_SECS") {
            config.idle_threshold_secs = secs;
        }
        if let Some(secs) = env_u64("HUBNITY_HTTP_TIMEOUT_SECS") {
            config.http_timeout_secs = secs;
        }
        if let Some(secs) = env_u64("HUBNITY_RECONCILE_INTERVAL_SECS") {
            config.reconcile_interval_secs = secs;
        }
        config
    }

    /// Parse a JSON config; missing fields fall back to defaults.
    pub fn from_json(json: &str) -> Result<Self, ReconcileError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ReconcileError::Config(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.idle_threshold_secs < MIN_IDLE_THRESHOLD_SECS {
            return Err(ReconcileError::Config(format!(
                "idle_threshold_secs must be >= {} (got {})",
                MIN_IDLE_THRESHOLD_SECS, self.idle_threshold_secs
            )));
        }
        if self.max_retries <= 0 {
            return Err(ReconcileError::Config("max_retries must be positive".into()));
        }
        if self.max_activity_batch == 0 {
            return Err(ReconcileError::Config(
                "max_activity_batch must be positive".into(),
            ));
        }
        let intervals = [
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("idle_check_interval_secs", self.idle_check_interval_secs),
            ("audit_interval_secs", self.audit_interval_secs),
            ("flush_interval_secs", self.flush_interval_secs),
            ("save_state_interval_secs", self.save_state_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("http_timeout_secs", self.http_timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ReconcileError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn entry_load_coalesce(&self) -> Duration {
        Duration::from_millis(self.entry_load_coalesce_ms)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("[CONFIG] Ignoring {}: not a number ({:?})", key, raw);
            None
        }
    }
}
