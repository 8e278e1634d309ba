use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::context::SessionContext;
use crate::error::ReconcileError;

#[derive(Debug, Clone, PartialEq)]
pub enum AuditOutcome {
    Consistent,
    /// Cache flags rewritten from the engine snapshot
    Corrected,
    /// Lock held; carries consecutive skip count
    SkippedLockHeld(u32),
    /// Lock held past the bound and force released
    ForcedUnlock { holder: String, held_secs: u64 },
    /// Drift seen, but a transition took the lock before correction
    Deferred,
    EngineUnavailable,
    TornDown,
}

/// Периодическая проверка: флаги кэша совпадают с движком, lock не завис.
/// Lock берётся только для исправления расхождения.
pub struct InvariantAuditor {
    ctx: Arc<SessionContext>,
    lock_skips: AtomicU32,
}

impl InvariantAuditor {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            ctx,
            lock_skips: AtomicU32::new(0),
        }
    }

    pub async fn audit_once(&self) -> AuditOutcome {
        let ctx = &self.ctx;
        if ctx.is_torn_down() {
            return AuditOutcome::TornDown;
        }

        if ctx.lock.is_held() {
            let skips = self.lock_skips.fetch_add(1, Ordering::AcqRel) + 1;
            if skips <= ctx.config.max_lock_skips {
                debug!("[AUDIT] Lock held, skip {}/{}", skips, ctx.config.max_lock_skips);
                return AuditOutcome::SkippedLockHeld(skips);
            }
            self.lock_skips.store(0, Ordering::Release);
            let (holder, held_secs) = ctx
                .lock
                .force_release()
                .map(|(name, held)| (name.to_string(), held.as_secs()))
                .unwrap_or_else(|| ("unknown".to_string(), 0));
            let err = ReconcileError::LockTimeout {
                holder: holder.clone(),
                held_secs,
            };
            error!("[AUDIT] {}", err);
            return AuditOutcome::ForcedUnlock { holder, held_secs };
        }
        self.lock_skips.store(0, Ordering::Release);

        // чтение без lock: пользовательские переходы не получают Busy
        let snapshot = match ctx.engine.get_state().await {
            Ok(s) => s,
            Err(e) => {
                ctx.report(e.into());
                return AuditOutcome::EngineUnavailable;
            }
        };
        if ctx.cache.is_consistent_with(&snapshot) {
            return AuditOutcome::Consistent;
        }

        // расхождение: перепроверить под lock, снимок мог устареть
        let Some(_guard) = ctx.lock.try_acquire("audit") else {
            debug!("[AUDIT] Transition started during read, correction deferred");
            return AuditOutcome::Deferred;
        };
        let snapshot = match ctx.engine.get_state().await {
            Ok(s) => s,
            Err(e) => {
                ctx.report(e.into());
                return AuditOutcome::EngineUnavailable;
            }
        };
        if ctx.cache.is_consistent_with(&snapshot) {
            return AuditOutcome::Consistent;
        }

        let cache = ctx.cache.snapshot();
        warn!(
            "[AUDIT] Cache drift: cache tracking={} paused={}, engine {}; correcting",
            cache.is_tracking,
            cache.is_paused,
            snapshot.state_name()
        );
        ctx.cache.apply_engine(&snapshot);
        ctx.publish_state();
        AuditOutcome::Corrected
    }
}
