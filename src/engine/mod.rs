use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Authoritative timer engine (FSM lives in another process).
/// Каждый вызов возвращает полный снимок состояния.
#[async_trait]
pub trait TimerEngineApi: Send + Sync {
    async fn start(&self) -> Result<EngineSnapshot, EngineError>;
    async fn pause(&self) -> Result<EngineSnapshot, EngineError>;
    /// Running → Paused, засчитывая в сессию только `work_seconds` (без простоя)
    async fn pause_idle(&self, work_seconds: u64) -> Result<EngineSnapshot, EngineError>;
    async fn resume(&self) -> Result<EngineSnapshot, EngineError>;
    async fn stop(&self) -> Result<EngineSnapshot, EngineError>;
    async fn get_state(&self) -> Result<EngineSnapshot, EngineError>;
    async fn reset_day(&self) -> Result<EngineSnapshot, EngineError>;
    async fn save_state(&self) -> Result<EngineSnapshot, EngineError>;
}

/// Снимок состояния движка (без Instant)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    #[serde(flatten)]
    pub state: EngineStateTag,
    pub elapsed_seconds: u64,
    /// Накопленное время за день
    pub accumulated_seconds: u64,
    /// Unix timestamp начала сессии (только для Running)
    pub session_start: Option<u64>,
    /// Unix timestamp начала дня
    pub day_start: Option<u64>,
    /// Выставляется один раз после рестарта, если таймер был RUNNING:
    /// движок поднимается в PAUSED и ждёт явного решения пользователя
    #[serde(default)]
    pub restored_from_running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "state")]
pub enum EngineStateTag {
    Stopped,
    Running { started_at: u64 },
    Paused,
}

impl EngineSnapshot {
    pub fn stopped() -> Self {
        Self {
            state: EngineStateTag::Stopped,
            elapsed_seconds: 0,
            accumulated_seconds: 0,
            session_start: None,
            day_start: None,
            restored_from_running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, EngineStateTag::Running { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.state, EngineStateTag::Paused)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.state, EngineStateTag::Stopped)
    }

    /// RUNNING или PAUSED
    pub fn is_tracking(&self) -> bool {
        !self.is_stopped()
    }

    /// Секунды текущей сессии (elapsed - accumulated)
    pub fn session_seconds(&self) -> u64 {
        self.elapsed_seconds.saturating_sub(self.accumulated_seconds)
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            EngineStateTag::Stopped => "STOPPED",
            EngineStateTag::Running { .. } => "RUNNING",
            EngineStateTag::Paused => "PAUSED",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Transition invalid in the current state ("Timer is already paused", ...)
    Rejected(String),
    /// Engine could not be reached
    Unavailable(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Rejected(s) => write!(f, "Engine rejected transition: {}", s),
            EngineError::Unavailable(s) => write!(f, "Engine unavailable: {}", s),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<EngineError> for crate::error::ReconcileError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Rejected(s) => crate::error::ReconcileError::EngineRejection(s),
            EngineError::Unavailable(s) => crate::error::ReconcileError::EngineUnavailable(s),
        }
    }
}
