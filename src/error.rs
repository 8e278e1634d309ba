use std::fmt;

/// Ошибки движка согласования (таксономия для логирования и уведомлений)
///
/// Только `EngineUnavailable`, `Storage` и `Config` доходят до пользователя.
/// Остальное восстанавливается на месте и попадает лишь в лог.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileError {
    /// Transition invalid in the current FSM state
    EngineRejection(String),
    /// The authoritative engine cannot be reached at all
    EngineUnavailable(String),
    /// Transient network problem, the operation stays queued
    Network(String),
    /// A foreign user's entry showed up in "active" results
    SecurityViolation { entry_id: String, owner: String },
    /// Duplicate active entries or malformed payloads
    DataIntegrity(String),
    /// Operation lock held past the audit bound
    LockTimeout { holder: String, held_secs: u64 },
    /// Local storage (sync queue) unavailable
    Storage(String),
    /// No credentials for the current session
    NotAuthenticated,
    Config(String),
}

impl ReconcileError {
    /// Должна ли ошибка быть показана пользователю
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            ReconcileError::EngineUnavailable(_)
                | ReconcileError::Storage(_)
                | ReconcileError::Config(_)
        )
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::EngineRejection(s) => write!(f, "Engine rejection: {}", s),
            ReconcileError::EngineUnavailable(s) => write!(f, "Timer engine unavailable: {}", s),
            ReconcileError::Network(s) => write!(f, "Network: {}", s),
            ReconcileError::SecurityViolation { entry_id, owner } => write!(
                f,
                "Security violation: entry {} belongs to user {}",
                entry_id, owner
            ),
            ReconcileError::DataIntegrity(s) => write!(f, "Data integrity: {}", s),
            ReconcileError::LockTimeout { holder, held_secs } => write!(
                f,
                "Operation lock held by '{}' for {}s, force released",
                holder, held_secs
            ),
            ReconcileError::Storage(s) => write!(f, "Storage: {}", s),
            ReconcileError::NotAuthenticated => {
                write!(f, "Not authenticated: credentials not set")
            }
            ReconcileError::Config(s) => write!(f, "Config: {}", s),
        }
    }
}

impl std::error::Error for ReconcileError {}

impl From<rusqlite::Error> for ReconcileError {
    fn from(e: rusqlite::Error) -> Self {
        ReconcileError::Storage(crate::database::enqueue_error_to_user_message(&e))
    }
}
