use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthManager, Credentials};
use crate::cache::TimerStateCache;
use crate::config::ReconcileConfig;
use crate::database::Database;
use crate::engine::{EngineSnapshot, TimerEngineApi};
use crate::error::ReconcileError;
use crate::ipc::{EventBus, SessionEvent};
use crate::lock::OperationLock;
use crate::models::{OperationPayload, RemoteEntry};
use crate::reconciler::{canonicalize, Canonical};
use crate::remote::{RemoteApi, RemoteError};
use crate::sync::{DeliveryOutcome, FlushReport, SyncError, SyncManager};

/// Всё общее состояние одной сессии трекинга.
/// Компоненты (sequencer, idle monitor, reconciler, auditor) держат Arc на него.
pub struct SessionContext {
    pub config: ReconcileConfig,
    pub engine: Arc<dyn TimerEngineApi>,
    pub remote: Arc<dyn RemoteApi>,
    pub db: Arc<Database>,
    pub auth: Arc<AuthManager>,
    pub sync: SyncManager,
    pub cache: TimerStateCache,
    pub lock: OperationLock,
    pub events: EventBus,
    /// Dedicated idle-pause mutex, separate from the operation lock
    pub(crate) idle_guard: tokio::sync::Mutex<()>,
    torn_down: AtomicBool,
    /// Single-flight "load active entry": concurrent callers share one fetch
    entry_load: tokio::sync::Mutex<Option<(Instant, Canonical)>>,
}

impl SessionContext {
    pub fn new(
        config: ReconcileConfig,
        engine: Arc<dyn TimerEngineApi>,
        remote: Arc<dyn RemoteApi>,
        db: Arc<Database>,
        auth: Arc<AuthManager>,
    ) -> Self {
        let sync = SyncManager::new(db.clone(), remote.clone(), auth.clone(), config.max_retries);
        Self {
            config,
            engine,
            remote,
            db,
            auth,
            sync,
            cache: TimerStateCache::new(),
            lock: OperationLock::new(),
            events: EventBus::default(),
            idle_guard: tokio::sync::Mutex::new(()),
            torn_down: AtomicBool::new(false),
            entry_load: tokio::sync::Mutex::new(None),
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// In-flight callbacks become no-ops after this
    pub fn tear_down(&self) {
        self.torn_down.store(true, Ordering::Release);
    }

    pub fn revive(&self) {
        self.torn_down.store(false, Ordering::Release);
    }

    /// Залогировать ошибку; пользователю показываем только неустранимые
    pub fn report(&self, err: ReconcileError) -> ReconcileError {
        if err.is_user_visible() {
            error!("[SEQ] {}", err);
            let title = match &err {
                ReconcileError::Storage(_) => "Sync unavailable",
                ReconcileError::Config(_) => "Configuration error",
                _ => "Timer unavailable",
            };
            self.events.emit(SessionEvent::Notification {
                title: title.to_string(),
                body: err.to_string(),
            });
        } else {
            warn!("[SEQ] {}", err);
        }
        err
    }

    /// Authoritative engine state (never the cache)
    pub async fn engine_state(&self) -> Result<EngineSnapshot, ReconcileError> {
        self.engine
            .get_state()
            .await
            .map_err(|e| self.report(e.into()))
    }

    pub fn publish_state(&self) {
        if self.is_torn_down() {
            return;
        }
        self.events
            .emit(SessionEvent::TimerStateUpdate(self.cache.view()));
    }

    /// Durably record a remote mutation. Storage failure is user-visible.
    pub fn enqueue(
        &self,
        payload: &OperationPayload,
        credentials: Option<&Credentials>,
    ) -> Result<i64, ReconcileError> {
        self.sync
            .enqueue(payload, credentials)
            .map_err(|e| self.report(ReconcileError::from(e)))
    }

    /// Фоновая доставка задачи; временная ошибка оставляет её в очереди
    pub fn spawn_delivery(self: &Arc<Self>, id: i64) -> JoinHandle<()> {
        let ctx = self.clone();
        tokio::spawn(async move {
            if ctx.is_torn_down() {
                return;
            }
            let outcome = ctx.sync.deliver_one(id).await;
            if ctx.is_torn_down() {
                return;
            }
            match outcome {
                Ok(DeliveryOutcome::Created(entry)) => ctx.adopt_created(&entry),
                Ok(DeliveryOutcome::AlreadyAchieved) => {
                    // сервер уже имел активную запись: узнаём её id
                    let cache = ctx.cache.snapshot();
                    if cache.is_tracking && cache.current_entry.is_none() {
                        ctx.reload_current_entry().await;
                    }
                }
                Ok(_) => {}
                Err(SyncError::Exhausted { task_id, cause }) => {
                    warn!("[SYNC] Background delivery gave up on task {}: {}", task_id, cause);
                    ctx.notify_exhausted(&[task_id]);
                }
                Err(e) => debug!("[SYNC] Task {} left queued: {}", id, e),
            }
        })
    }

    /// Новая запись с сервера: в кэш, если трекинг всё ещё идёт и id ещё не известен
    fn adopt_created(&self, entry: &RemoteEntry) {
        let adopted = self.cache.update(|c| {
            if c.is_tracking && c.current_entry.is_none() {
                c.current_entry = Some(entry.clone());
                true
            } else {
                false
            }
        });
        if adopted {
            info!("[SYNC] Entry {} created on server", entry.id);
            self.publish_state();
        }
    }

    /// Запомнить текущую запись (кэш + app_meta)
    pub fn remember_entry(&self, entry: Option<&RemoteEntry>) {
        self.cache.update(|c| c.current_entry = entry.cloned());
        if let Err(e) = self.db.set_last_entry_id(entry.map(|e| e.id.as_str())) {
            warn!("[DB] Failed to persist last entry id: {}", e);
        }
    }

    /// Active entries, canonicalized. Concurrent callers share one fetch;
    /// a result younger than the coalesce window is reused.
    pub async fn load_active(&self, creds: &Credentials) -> Result<Canonical, RemoteError> {
        let mut slot = self.entry_load.lock().await;
        if let Some((at, canonical)) = slot.as_ref() {
            if at.elapsed() < self.config.entry_load_coalesce() {
                return Ok(canonical.clone());
            }
        }
        let entries = self.remote.list_active_entries(creds).await?;
        let canonical = canonicalize(entries, &creds.user_id);
        *slot = Some((Instant::now(), canonical.clone()));
        Ok(canonical)
    }

    /// Сбросить закэшированный результат load_active (после локального перехода)
    pub async fn invalidate_entry_load(&self) {
        *self.entry_load.lock().await = None;
    }

    /// Stop duplicate active entries through the outbox
    pub fn stop_duplicates(
        self: &Arc<Self>,
        duplicates: &[RemoteEntry],
        creds: &Credentials,
    ) -> Result<Vec<JoinHandle<()>>, ReconcileError> {
        let mut deliveries = Vec::with_capacity(duplicates.len());
        for dup in duplicates {
            warn!(
                "[RECONCILE] Stopping duplicate active entry {} (started {})",
                dup.id, dup.start_time
            );
            let id = self.enqueue(
                &OperationPayload::Stop {
                    entry_id: Some(dup.id.clone()),
                    at: chrono::Utc::now().timestamp_millis(),
                },
                Some(creds),
            )?;
            deliveries.push(self.spawn_delivery(id));
        }
        Ok(deliveries)
    }

    /// Прогнать очередь и применить результат к кэшу
    pub async fn flush_queue(&self, aggressive_retry: bool) -> Result<FlushReport, ReconcileError> {
        if self.is_torn_down() {
            return Ok(FlushReport::default());
        }
        let report = self.sync.flush(aggressive_retry).await.map_err(|e| match e {
            SyncError::Db(s) => self.report(ReconcileError::Storage(s)),
            other => ReconcileError::Network(other.to_string()),
        })?;

        for entry in &report.created {
            self.adopt_created(entry);
        }
        if report.needs_entry_reload {
            self.reload_current_entry().await;
        }
        if !report.exhausted.is_empty() {
            self.notify_exhausted(&report.exhausted);
        }
        Ok(report)
    }

    /// Задачи ушли в failed: QueueFailed + уведомление пользователю
    pub fn notify_exhausted(&self, task_ids: &[i64]) {
        error!("[SYNC] {} tasks exhausted retries: {:?}", task_ids.len(), task_ids);
        self.events.emit(SessionEvent::QueueFailed {
            count: task_ids.len(),
        });
        self.events.emit(SessionEvent::Notification {
            title: "Sync failed".to_string(),
            body: format!(
                "{} operations could not be sent to the server",
                task_ids.len()
            ),
        });
    }

    /// Перечитать активную запись с сервера и запомнить её (best effort)
    pub async fn reload_current_entry(&self) {
        let Some(creds) = self.auth.credentials().await else {
            return;
        };
        self.invalidate_entry_load().await;
        match self.load_active(&creds).await {
            Ok(canonical) => {
                if let Some(entry) = canonical.keep {
                    if self.cache.snapshot().is_tracking {
                        self.remember_entry(Some(&entry));
                        self.publish_state();
                    }
                }
            }
            Err(e) => debug!("[SYNC] Active entry reload failed: {}", e),
        }
    }
}
