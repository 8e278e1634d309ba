mod auditor;
mod auth;
mod cache;
mod config;
mod context;
mod database;
mod engine;
mod error;
mod ipc;
mod lock;
mod models;
mod monitor;
mod network;
mod reconciler;
mod remote;
mod sequencer;
mod session;
mod sync;

pub use crate::auditor::{AuditOutcome, InvariantAuditor};
pub use crate::auth::{AuthManager, Credentials, TokenEncryption};
pub use crate::cache::{CacheProjection, CacheView, Stamp, TimerStateCache};
pub use crate::config::{GraceWindows, ReconcileConfig, MIN_IDLE_THRESHOLD_SECS};
pub use crate::context::SessionContext;
pub use crate::engine::{EngineError, EngineSnapshot, EngineStateTag, TimerEngineApi};
pub use crate::error::ReconcileError;
pub use crate::ipc::{events, EventBus, IdleDecision, SessionEvent};
pub use crate::lock::{OperationGuard, OperationLock};
pub use crate::models::{
    CreateEntryRequest, EntryStatus, FailedTaskInfo, IdlePromptState, OperationKind,
    OperationPayload, PendingOperation, ProjectSnapshot, QueueStats, QueueStatus, RemoteEntry,
    UrlActivity,
};
pub use crate::monitor::{IdleMonitor, IdleTick};
pub use crate::network::{check_online_status, extract_domain};
pub use crate::reconciler::{
    canonicalize, decide, Canonical, DecisionContext, ReconcileAction, ReconcileOutcome,
    RemoteReconciler, ServerStatus, SkipCause,
};
pub use crate::remote::{HttpRemote, RemoteApi, RemoteError};
pub use crate::sequencer::{idle_work_seconds, OperationSequencer, SkipReason, TransitionOutcome};
pub use crate::session::{SyncStatus, TrackingSession};
pub use crate::sync::{DeliveryOutcome, FlushReport, SyncError, SyncManager, TaskPriority};
pub use database::Database;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

/// Инициализация логирования: по умолчанию info (если RUST_LOG не задан), чтобы [SEQ]/[SYNC] были видны.
/// Повторный вызов (тесты, встраивание) не ошибка.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
