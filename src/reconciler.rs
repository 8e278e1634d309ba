use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheProjection, Stamp};
use crate::context::SessionContext;
use crate::engine::{EngineError, EngineSnapshot};
use crate::error::ReconcileError;
use crate::models::{EntryStatus, PendingKinds, RemoteEntry};

/// Активные записи после разбора: одна каноническая, дубликаты, чужие
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Canonical {
    pub keep: Option<RemoteEntry>,
    /// Own active entries older than `keep`; must be stopped remotely
    pub duplicates: Vec<RemoteEntry>,
    /// Entries of other users (never touched)
    pub foreign: Vec<RemoteEntry>,
}

/// Разобрать ответ "активные записи": чужие отбросить, из своих оставить самую новую.
pub fn canonicalize(entries: Vec<RemoteEntry>, user_id: &str) -> Canonical {
    let mut canonical = Canonical::default();
    let mut own = Vec::new();
    for entry in entries {
        if entry.user_id != user_id {
            let err = ReconcileError::SecurityViolation {
                entry_id: entry.id.clone(),
                owner: entry.user_id.clone(),
            };
            error!("[SECURITY] {}", err);
            canonical.foreign.push(entry);
        } else if entry.status.is_active() {
            own.push(entry);
        }
    }
    // newest first; id as tie-break keeps the choice stable across devices
    own.sort_by(|a, b| {
        b.start_time
            .cmp(&a.start_time)
            .then_with(|| b.id.cmp(&a.id))
    });
    let mut own = own.into_iter();
    canonical.keep = own.next();
    canonical.duplicates = own.collect();
    if !canonical.duplicates.is_empty() {
        let err = ReconcileError::DataIntegrity(format!(
            "{} duplicate active entries for user {}",
            canonical.duplicates.len(),
            user_id
        ));
        warn!("[RECONCILE] {}", err);
    }
    canonical
}

/// Состояние сервера относительно отслеживаемой записи
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Running,
    Paused,
    /// The entry we track is no longer active
    Stopped,
    NoActiveEntry,
}

pub fn server_status(canonical: &Canonical, tracked_entry_id: Option<&str>) -> ServerStatus {
    match &canonical.keep {
        Some(entry) => match entry.status {
            EntryStatus::Running => ServerStatus::Running,
            EntryStatus::Paused => ServerStatus::Paused,
            EntryStatus::Stopped => ServerStatus::Stopped,
        },
        None if tracked_entry_id.is_some() => ServerStatus::Stopped,
        None => ServerStatus::NoActiveEntry,
    }
}

/// Локальные обстоятельства, блокирующие корректировку
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionContext {
    pub idle_pause_pending: bool,
    pub within_post_start_grace: bool,
    pub within_resume_protection: bool,
    pub within_post_pause_grace: bool,
    pub within_post_stop_grace: bool,
    pub pending: PendingKinds,
}

impl DecisionContext {
    pub fn from_cache(cache: &CacheProjection, ctx: &SessionContext, pending: PendingKinds) -> Self {
        let grace = &ctx.config.grace;
        Self {
            idle_pause_pending: cache.is_idle_paused(),
            within_post_start_grace: CacheProjection::within(
                cache.local_timer_start_time,
                grace.post_start(),
            ),
            within_resume_protection: CacheProjection::within(
                cache.last_resume_time,
                grace.resume_protection(),
            ),
            within_post_pause_grace: CacheProjection::within(
                cache.last_pause_time,
                grace.post_pause(),
            ),
            within_post_stop_grace: CacheProjection::within(
                cache.last_stop_time,
                grace.post_stop(),
            ),
            pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipCause {
    IdlePausePending,
    /// Engine restored as PAUSED after restart, waiting for the user
    RestoredAwaitingUser,
    PostStartGrace,
    ResumeProtection,
    PostPauseGrace,
    PostStopGrace,
    /// Local transition still queued; the server has not seen it yet
    PendingLocalOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    None,
    ResumeEngine,
    StartEngine,
    PauseEngine,
    StopEngine,
    Skip(SkipCause),
}

/// Решение reconcile: как привести движок к серверу (или почему не трогать)
pub fn decide(engine: &EngineSnapshot, server: ServerStatus, ctx: &DecisionContext) -> ReconcileAction {
    use ReconcileAction::*;

    // idle pause ждёт решения пользователя; сервер его не отменяет
    if ctx.idle_pause_pending {
        return Skip(SkipCause::IdlePausePending);
    }

    match server {
        ServerStatus::Running if !engine.is_running() => {
            if ctx.within_post_pause_grace {
                Skip(SkipCause::PostPauseGrace)
            } else if ctx.within_post_stop_grace {
                Skip(SkipCause::PostStopGrace)
            } else if ctx.pending.pause || ctx.pending.stop {
                Skip(SkipCause::PendingLocalOperation)
            } else if engine.is_paused() && engine.restored_from_running {
                Skip(SkipCause::RestoredAwaitingUser)
            } else if engine.is_paused() {
                ResumeEngine
            } else {
                StartEngine
            }
        }
        ServerStatus::Paused if engine.is_running() => {
            if ctx.within_resume_protection {
                Skip(SkipCause::ResumeProtection)
            } else if ctx.within_post_start_grace {
                Skip(SkipCause::PostStartGrace)
            } else if ctx.pending.resume || ctx.pending.start {
                Skip(SkipCause::PendingLocalOperation)
            } else {
                PauseEngine
            }
        }
        ServerStatus::Stopped | ServerStatus::NoActiveEntry if !engine.is_stopped() => {
            if ctx.within_post_start_grace {
                Skip(SkipCause::PostStartGrace)
            } else if ctx.within_resume_protection {
                Skip(SkipCause::ResumeProtection)
            } else if ctx.pending.start || ctx.pending.resume {
                Skip(SkipCause::PendingLocalOperation)
            } else if engine.is_paused() && engine.restored_from_running {
                Skip(SkipCause::RestoredAwaitingUser)
            } else {
                StopEngine
            }
        }
        _ => None,
    }
}

/// Результат одного цикла reconcile
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Acted(ReconcileAction),
    /// Operation lock held by a local transition
    Busy,
    Offline,
    NotAuthenticated,
    TornDown,
}

/// Периодическое согласование движка с сервером.
/// Сервер читается без lock; решение и применение только под lock.
pub struct RemoteReconciler {
    ctx: Arc<SessionContext>,
}

impl RemoteReconciler {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self { ctx }
    }

    pub async fn reconcile_once(&self) -> Result<ReconcileOutcome, ReconcileError> {
        let ctx = &self.ctx;
        if ctx.is_torn_down() {
            return Ok(ReconcileOutcome::TornDown);
        }
        let Some(creds) = ctx.auth.credentials().await else {
            return Ok(ReconcileOutcome::NotAuthenticated);
        };
        if ctx.lock.is_held() {
            debug!("[RECONCILE] Skipped: operation in progress");
            return Ok(ReconcileOutcome::Busy);
        }

        ctx.invalidate_entry_load().await;
        let canonical = match ctx.load_active(&creds).await {
            Ok(c) => c,
            Err(e) => {
                debug!("[RECONCILE] Server unreachable, skipping: {}", e);
                return Ok(ReconcileOutcome::Offline);
            }
        };

        let Some(_guard) = ctx.lock.try_acquire("reconcile") else {
            debug!("[RECONCILE] Skipped: lock taken while fetching");
            return Ok(ReconcileOutcome::Busy);
        };
        if ctx.is_torn_down() {
            return Ok(ReconcileOutcome::TornDown);
        }

        // re-read after acquire: engine is authoritative, cache is not
        let engine = ctx.engine_state().await?;
        ctx.cache.apply_engine(&engine);

        if !canonical.duplicates.is_empty() {
            ctx.stop_duplicates(&canonical.duplicates, &creds)?;
        }

        let cache = ctx.cache.snapshot();
        if let Some(keep) = &canonical.keep {
            if cache.current_entry_id() != Some(keep.id.as_str()) && !engine.is_stopped() {
                info!("[RECONCILE] Adopting server entry {}", keep.id);
                ctx.remember_entry(Some(keep));
            }
        }

        let status = server_status(&canonical, cache.current_entry_id());
        let pending = ctx.db.pending_kinds().unwrap_or_else(|e| {
            // без знания очереди считаем, что всё ещё в пути
            warn!("[RECONCILE] Failed to read pending kinds: {}", e);
            PendingKinds {
                start: true,
                pause: true,
                resume: true,
                stop: true,
            }
        });
        let decision = DecisionContext::from_cache(&cache, ctx, pending);
        let action = decide(&engine, status, &decision);

        match action {
            ReconcileAction::None => {}
            ReconcileAction::Skip(cause) => {
                debug!(
                    "[RECONCILE] engine={} server={:?}: skipped ({:?})",
                    engine.state_name(),
                    status,
                    cause
                );
            }
            _ => {
                info!(
                    "[RECONCILE] engine={} server={:?}: {:?}",
                    engine.state_name(),
                    status,
                    action
                );
                self.apply(action, &canonical.keep).await?;
            }
        }
        Ok(ReconcileOutcome::Acted(action))
    }

    /// Применить решение напрямую к движку. В очередь ничего не ставим:
    /// сервер уже в этом состоянии.
    async fn apply(
        &self,
        action: ReconcileAction,
        server_entry: &Option<RemoteEntry>,
    ) -> Result<(), ReconcileError> {
        let ctx = &self.ctx;
        let result = match action {
            ReconcileAction::ResumeEngine => ctx.engine.resume().await,
            ReconcileAction::StartEngine => ctx.engine.start().await,
            ReconcileAction::PauseEngine => ctx.engine.pause().await,
            ReconcileAction::StopEngine => ctx.engine.stop().await,
            ReconcileAction::None | ReconcileAction::Skip(_) => return Ok(()),
        };
        let snapshot = match result {
            Ok(s) => s,
            Err(EngineError::Rejected(msg)) => {
                // движок уже сдвинулся сам; берём его состояние как есть
                debug!("[RECONCILE] Engine rejected {:?}: {}", action, msg);
                ctx.engine_state().await?
            }
            Err(e) => return Err(ctx.report(e.into())),
        };
        if ctx.is_torn_down() {
            return Ok(());
        }

        ctx.cache.apply_engine(&snapshot);
        match action {
            ReconcileAction::StopEngine => ctx.remember_entry(None),
            ReconcileAction::StartEngine | ReconcileAction::ResumeEngine => {
                // сервер только что запустил трекинг: простой считается заново
                let now = Stamp::now();
                ctx.cache.update(|c| {
                    c.idle_pause_start = None;
                    c.last_activity = Some(now);
                    if action == ReconcileAction::StartEngine {
                        c.local_timer_start_time = Some(now.at);
                    } else {
                        c.last_resume_time = Some(now.at);
                    }
                });
                if let Some(entry) = server_entry {
                    ctx.remember_entry(Some(entry));
                }
            }
            _ => {}
        }
        ctx.publish_state();
        Ok(())
    }
}
