use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::cache::Stamp;
use crate::context::SessionContext;
use crate::engine::{EngineError, EngineSnapshot};
use crate::error::ReconcileError;
use crate::models::{CreateEntryRequest, EntryStatus, OperationPayload};

/// Почему переход не выполнен (не ошибка, просто no-op)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Engine state does not allow the transition (e.g. start while PAUSED)
    InvalidState,
    /// Resume requested while an idle pause waits for the user's decision
    IdlePausePending,
    TornDown,
}

/// Результат пользовательского перехода
#[derive(Debug)]
pub enum TransitionOutcome {
    Applied {
        snapshot: EngineSnapshot,
        /// Queue id of the primary remote operation
        queue_id: Option<i64>,
        /// Background deliveries spawned for this transition
        deliveries: Vec<JoinHandle<()>>,
    },
    AlreadyInState(EngineSnapshot),
    Skipped(SkipReason),
    /// Another transition holds the operation lock
    Busy,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }

    pub fn snapshot(&self) -> Option<&EngineSnapshot> {
        match self {
            TransitionOutcome::Applied { snapshot, .. } => Some(snapshot),
            TransitionOutcome::AlreadyInState(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    /// Дождаться фоновой доставки (тесты, shutdown)
    pub async fn wait_delivery(self) -> Self {
        match self {
            TransitionOutcome::Applied {
                snapshot,
                queue_id,
                deliveries,
            } => {
                for handle in deliveries {
                    if let Err(e) = handle.await {
                        warn!("[SEQ] Delivery task failed: {}", e);
                    }
                }
                TransitionOutcome::Applied {
                    snapshot,
                    queue_id,
                    deliveries: Vec::new(),
                }
            }
            other => other,
        }
    }
}

/// Рабочее время сессии без хвоста простоя
pub fn idle_work_seconds(session_seconds: u64, idle_for: Duration) -> u64 {
    session_seconds.saturating_sub(idle_for.as_secs())
}

/// Упорядочивает пользовательские переходы.
///
/// Порядок всегда один: lock → перечитать движок → переход в движке →
/// оптимистичный кэш → запись в очередь → фоновая доставка.
/// Движок никогда не откатывается из-за сетевой ошибки.
#[derive(Clone)]
pub struct OperationSequencer {
    ctx: Arc<SessionContext>,
}

impl OperationSequencer {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self { ctx }
    }

    /// Ответ движка на отклонённый переход: если целевое состояние уже
    /// достигнуто, это no-op, иначе переход просто неприменим.
    async fn settle_rejection(
        &self,
        op: &str,
        msg: String,
        reached: fn(&EngineSnapshot) -> bool,
    ) -> Result<TransitionOutcome, ReconcileError> {
        debug!("[SEQ] {}: engine rejected ({})", op, msg);
        let current = self.ctx.engine_state().await?;
        self.ctx.cache.apply_engine(&current);
        if reached(&current) {
            Ok(TransitionOutcome::AlreadyInState(current))
        } else {
            Ok(TransitionOutcome::Skipped(SkipReason::InvalidState))
        }
    }

    /// id записи для pause/resume: кэш, потом app_meta. None = решится при доставке.
    fn known_entry_id(&self) -> Option<String> {
        if let Some(id) = self.ctx.cache.snapshot().current_entry_id() {
            return Some(id.to_string());
        }
        match self.ctx.db.last_entry_id() {
            Ok(id) => id,
            Err(e) => {
                warn!("[SEQ] Failed to read last entry id: {}", e);
                None
            }
        }
    }

    fn enqueue_and_deliver(
        &self,
        payload: OperationPayload,
        creds: Option<&Credentials>,
        deliveries: &mut Vec<JoinHandle<()>>,
    ) -> Result<i64, ReconcileError> {
        let id = self.ctx.enqueue(&payload, creds)?;
        debug!("[SEQ] Queued {:?} as task {}", payload.kind(), id);
        deliveries.push(self.ctx.spawn_delivery(id));
        Ok(id)
    }

    pub async fn start(
        &self,
        project_id: &str,
        description: Option<String>,
    ) -> Result<TransitionOutcome, ReconcileError> {
        let ctx = &self.ctx;
        if ctx.is_torn_down() {
            return Ok(TransitionOutcome::Skipped(SkipReason::TornDown));
        }
        let Some(_guard) = ctx.lock.try_acquire("start") else {
            return Ok(TransitionOutcome::Busy);
        };
        let creds = ctx
            .auth
            .credentials()
            .await
            .ok_or(ReconcileError::NotAuthenticated)?;

        let current = ctx.engine_state().await?;
        if current.is_running() {
            ctx.cache.apply_engine(&current);
            return Ok(TransitionOutcome::AlreadyInState(current));
        }
        if current.is_paused() {
            debug!("[SEQ] start: engine PAUSED, use resume");
            ctx.cache.apply_engine(&current);
            return Ok(TransitionOutcome::Skipped(SkipReason::InvalidState));
        }

        let snapshot = match ctx.engine.start().await {
            Ok(s) => s,
            Err(EngineError::Rejected(msg)) => {
                return self
                    .settle_rejection("start", msg, EngineSnapshot::is_running)
                    .await
            }
            Err(e) => return Err(ctx.report(e.into())),
        };
        if ctx.is_torn_down() {
            return Ok(TransitionOutcome::Skipped(SkipReason::TornDown));
        }

        let now = Stamp::now();
        ctx.cache.update(|c| {
            c.is_tracking = true;
            c.is_paused = false;
            c.current_entry = None;
            c.idle_pause_start = None;
            c.local_timer_start_time = Some(now.at);
            c.last_activity = Some(now);
        });
        ctx.publish_state();
        info!("[SEQ] Started tracking project {}", project_id);

        let mut deliveries = Vec::new();

        // на сервере уже может быть активная запись (другое устройство, прошлый запуск)
        ctx.invalidate_entry_load().await;
        match ctx.load_active(&creds).await {
            Ok(canonical) => {
                deliveries.extend(ctx.stop_duplicates(&canonical.duplicates, &creds)?);
                if let Some(entry) = canonical.keep {
                    info!("[SEQ] Adopting active server entry {}", entry.id);
                    ctx.remember_entry(Some(&entry));
                    ctx.publish_state();
                    let mut queue_id = None;
                    if entry.status == EntryStatus::Paused {
                        queue_id = Some(self.enqueue_and_deliver(
                            OperationPayload::Resume {
                                entry_id: Some(entry.id.clone()),
                                at: now.wall_ms,
                            },
                            Some(&creds),
                            &mut deliveries,
                        )?);
                    }
                    return Ok(TransitionOutcome::Applied {
                        snapshot,
                        queue_id,
                        deliveries,
                    });
                }
            }
            Err(e) => warn!("[SEQ] start: active entries unavailable ({}), queueing create", e),
        }

        let request = CreateEntryRequest {
            project_id: project_id.to_string(),
            user_id: creds.user_id.clone(),
            description,
            start_time: now.wall_ms,
        };
        let queue_id = self.enqueue_and_deliver(
            OperationPayload::Start { request },
            Some(&creds),
            &mut deliveries,
        )?;
        Ok(TransitionOutcome::Applied {
            snapshot,
            queue_id: Some(queue_id),
            deliveries,
        })
    }

    /// `is_idle`: pause triggered by the idle monitor; the idle tail is
    /// excluded from the session and the prompt state is recorded.
    pub async fn pause(&self, is_idle: bool) -> Result<TransitionOutcome, ReconcileError> {
        let ctx = &self.ctx;
        if ctx.is_torn_down() {
            return Ok(TransitionOutcome::Skipped(SkipReason::TornDown));
        }
        let op = if is_idle { "idle_pause" } else { "pause" };
        let Some(_guard) = ctx.lock.try_acquire(op) else {
            return Ok(TransitionOutcome::Busy);
        };

        let current = ctx.engine_state().await?;
        if current.is_paused() {
            ctx.cache.apply_engine(&current);
            return Ok(TransitionOutcome::AlreadyInState(current));
        }
        if current.is_stopped() {
            ctx.cache.apply_engine(&current);
            return Ok(TransitionOutcome::Skipped(SkipReason::InvalidState));
        }

        let result = if is_idle {
            let idle_for = ctx
                .cache
                .snapshot()
                .last_activity
                .map(|s| s.elapsed())
                .unwrap_or_default();
            let work = idle_work_seconds(current.session_seconds(), idle_for);
            info!(
                "[IDLE] Pausing: session {}s, idle {}s, counting {}s",
                current.session_seconds(),
                idle_for.as_secs(),
                work
            );
            ctx.engine.pause_idle(work).await
        } else {
            ctx.engine.pause().await
        };
        let snapshot = match result {
            Ok(s) => s,
            Err(EngineError::Rejected(msg)) => {
                return self
                    .settle_rejection(op, msg, EngineSnapshot::is_paused)
                    .await
            }
            Err(e) => return Err(ctx.report(e.into())),
        };
        if ctx.is_torn_down() {
            return Ok(TransitionOutcome::Skipped(SkipReason::TornDown));
        }

        let now = Stamp::now();
        ctx.cache.update(|c| {
            c.is_tracking = true;
            c.is_paused = true;
            c.last_pause_time = Some(now.at);
            if is_idle {
                c.idle_pause_start = Some(now);
            }
        });
        ctx.publish_state();

        let creds = ctx.auth.credentials().await;
        let mut deliveries = Vec::new();
        let queue_id = self.enqueue_and_deliver(
            OperationPayload::Pause {
                entry_id: self.known_entry_id(),
                at: now.wall_ms,
            },
            creds.as_ref(),
            &mut deliveries,
        )?;
        Ok(TransitionOutcome::Applied {
            snapshot,
            queue_id: Some(queue_id),
            deliveries,
        })
    }

    /// `from_idle_window`: the user's explicit decision in the idle prompt.
    /// Other callers cannot clear an idle pause.
    pub async fn resume(&self, from_idle_window: bool) -> Result<TransitionOutcome, ReconcileError> {
        let ctx = &self.ctx;
        if ctx.is_torn_down() {
            return Ok(TransitionOutcome::Skipped(SkipReason::TornDown));
        }
        let Some(_guard) = ctx.lock.try_acquire("resume") else {
            return Ok(TransitionOutcome::Busy);
        };

        if ctx.cache.snapshot().is_idle_paused() && !from_idle_window {
            info!("[SEQ] resume: idle pause awaits user decision, ignoring");
            return Ok(TransitionOutcome::Skipped(SkipReason::IdlePausePending));
        }

        let current = ctx.engine_state().await?;
        if !current.is_paused() {
            ctx.cache.apply_engine(&current);
            if from_idle_window {
                ctx.cache.update(|c| c.idle_pause_start = None);
            }
            return Ok(if current.is_running() {
                TransitionOutcome::AlreadyInState(current)
            } else {
                TransitionOutcome::Skipped(SkipReason::InvalidState)
            });
        }

        let snapshot = match ctx.engine.resume().await {
            Ok(s) => s,
            Err(EngineError::Rejected(msg)) => {
                return self
                    .settle_rejection("resume", msg, EngineSnapshot::is_running)
                    .await
            }
            Err(e) => return Err(ctx.report(e.into())),
        };
        if ctx.is_torn_down() {
            return Ok(TransitionOutcome::Skipped(SkipReason::TornDown));
        }

        let now = Stamp::now();
        ctx.cache.update(|c| {
            c.is_tracking = true;
            c.is_paused = false;
            c.idle_pause_start = None;
            c.last_resume_time = Some(now.at);
            c.last_activity = Some(now);
        });
        ctx.publish_state();

        let creds = ctx.auth.credentials().await;
        let mut deliveries = Vec::new();
        let queue_id = self.enqueue_and_deliver(
            OperationPayload::Resume {
                entry_id: self.known_entry_id(),
                at: now.wall_ms,
            },
            creds.as_ref(),
            &mut deliveries,
        )?;
        Ok(TransitionOutcome::Applied {
            snapshot,
            queue_id: Some(queue_id),
            deliveries,
        })
    }

    pub async fn stop(&self) -> Result<TransitionOutcome, ReconcileError> {
        let ctx = &self.ctx;
        if ctx.is_torn_down() {
            return Ok(TransitionOutcome::Skipped(SkipReason::TornDown));
        }
        let Some(_guard) = ctx.lock.try_acquire("stop") else {
            return Ok(TransitionOutcome::Busy);
        };

        let current = ctx.engine_state().await?;
        if current.is_stopped() {
            ctx.cache.apply_engine(&current);
            return Ok(TransitionOutcome::AlreadyInState(current));
        }

        // локальный стоп первым: пользователь видит результат сразу
        let snapshot = match ctx.engine.stop().await {
            Ok(s) => s,
            Err(EngineError::Rejected(msg)) => {
                return self
                    .settle_rejection("stop", msg, EngineSnapshot::is_stopped)
                    .await
            }
            Err(e) => return Err(ctx.report(e.into())),
        };
        if ctx.is_torn_down() {
            return Ok(TransitionOutcome::Skipped(SkipReason::TornDown));
        }

        let now = Stamp::now();
        let cached_entry = ctx.cache.update(|c| {
            c.is_tracking = false;
            c.is_paused = false;
            c.idle_pause_start = None;
            c.last_stop_time = Some(now.at);
            c.current_entry.take()
        });
        ctx.publish_state();

        let creds = ctx.auth.credentials().await;
        let mut deliveries = Vec::new();
        let entry_id = match cached_entry {
            Some(entry) => Some(entry.id),
            None => self.resolve_stop_target(creds.as_ref(), &mut deliveries).await?,
        };
        if entry_id.is_none() {
            warn!("[SEQ] stop: entry id unresolved, queueing sweep of own active entries");
        }

        let queue_id = self.enqueue_and_deliver(
            OperationPayload::Stop {
                entry_id,
                at: now.wall_ms,
            },
            creds.as_ref(),
            &mut deliveries,
        )?;
        ctx.invalidate_entry_load().await;
        Ok(TransitionOutcome::Applied {
            snapshot,
            queue_id: Some(queue_id),
            deliveries,
        })
    }

    /// Кэш пуст: общий load, прямой запрос к серверу, app_meta, очередь
    async fn resolve_stop_target(
        &self,
        creds: Option<&Credentials>,
        deliveries: &mut Vec<JoinHandle<()>>,
    ) -> Result<Option<String>, ReconcileError> {
        let ctx = &self.ctx;
        if let Some(creds) = creds {
            if let Ok(canonical) = ctx.load_active(creds).await {
                if let Some(entry) = canonical.keep {
                    deliveries.extend(ctx.stop_duplicates(&canonical.duplicates, creds)?);
                    return Ok(Some(entry.id));
                }
            }
            // coalesced result may be stale: ask the server directly
            match ctx.remote.list_active_entries(creds).await {
                Ok(entries) => {
                    let canonical = crate::reconciler::canonicalize(entries, &creds.user_id);
                    if let Some(entry) = canonical.keep {
                        deliveries.extend(ctx.stop_duplicates(&canonical.duplicates, creds)?);
                        return Ok(Some(entry.id));
                    }
                }
                Err(e) => debug!("[SEQ] stop: direct lookup failed: {}", e),
            }
        }
        if let Ok(Some(id)) = ctx.db.last_entry_id() {
            return Ok(Some(id));
        }
        match ctx.db.get_last_time_entry_id_from_queue() {
            Ok(id) => Ok(id),
            Err(e) => {
                warn!("[SEQ] stop: queue lookup failed: {}", e);
                Ok(None)
            }
        }
    }

    /// Смена дня в движке. Если сессия при этом закрылась, закрываем и запись.
    pub async fn reset_day(&self) -> Result<TransitionOutcome, ReconcileError> {
        let ctx = &self.ctx;
        if ctx.is_torn_down() {
            return Ok(TransitionOutcome::Skipped(SkipReason::TornDown));
        }
        let Some(_guard) = ctx.lock.try_acquire("reset_day") else {
            return Ok(TransitionOutcome::Busy);
        };

        let before = ctx.engine_state().await?;
        let snapshot = ctx
            .engine
            .reset_day()
            .await
            .map_err(|e| ctx.report(e.into()))?;
        if ctx.is_torn_down() {
            return Ok(TransitionOutcome::Skipped(SkipReason::TornDown));
        }
        ctx.cache.apply_engine(&snapshot);
        info!(
            "[SEQ] Day reset: {} -> {}",
            before.state_name(),
            snapshot.state_name()
        );

        let mut deliveries = Vec::new();
        let mut queue_id = None;
        if before.is_tracking() && snapshot.is_stopped() {
            let now = Stamp::now();
            let entry = ctx.cache.update(|c| {
                c.last_stop_time = Some(now.at);
                c.current_entry.take()
            });
            let creds = ctx.auth.credentials().await;
            let entry_id = entry.map(|e| e.id).or_else(|| self.known_entry_id());
            queue_id = Some(self.enqueue_and_deliver(
                OperationPayload::Stop {
                    entry_id,
                    at: now.wall_ms,
                },
                creds.as_ref(),
                &mut deliveries,
            )?);
        }
        ctx.publish_state();
        Ok(TransitionOutcome::Applied {
            snapshot,
            queue_id,
            deliveries,
        })
    }
}
