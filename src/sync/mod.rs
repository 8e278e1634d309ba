use crate::auth::{AuthManager, Credentials};
use crate::database::Database;
use crate::models::{OperationKind, OperationPayload, PendingOperation, QueueStatus, RemoteEntry};
use crate::remote::{RemoteApi, RemoteError};
use scopeguard::guard;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Ошибки синхронизации (для разбора и логирования)
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    Remote(RemoteError),
    /// No credentials in the session and no snapshot on the task
    NotAuthenticated,
    /// Entry id still unknown (start not delivered yet)
    UnresolvedEntry(String),
    Db(String),
    /// Задача переведена в failed: повторов больше не будет
    Exhausted { task_id: i64, cause: Box<SyncError> },
}

impl SyncError {
    /// Ошибку не исправит повторная попытка: задача сразу failed
    fn is_permanent(&self) -> bool {
        matches!(self, SyncError::Remote(RemoteError::InvalidBatch(_)))
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Remote(e) => write!(f, "{}", e),
            SyncError::NotAuthenticated => write!(f, "Not authenticated"),
            SyncError::UnresolvedEntry(s) => write!(f, "Unresolved entry: {}", s),
            SyncError::Db(s) => write!(f, "DB: {}", s),
            SyncError::Exhausted { task_id, cause } => {
                write!(f, "Task {} gave up: {}", task_id, cause)
            }
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        SyncError::Remote(e)
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Db(e.to_string())
    }
}

/// Приоритет задачи синхронизации (используется sync и database)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Critical = 0, // start, stop
    High = 1,     // pause, resume
    Normal = 2,   // activities
}

impl TaskPriority {
    pub fn from_kind(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Start | OperationKind::Stop => TaskPriority::Critical,
            OperationKind::Pause | OperationKind::Resume => TaskPriority::High,
            OperationKind::ActivityBatch => TaskPriority::Normal,
        }
    }
}

/// Результат доставки одной задачи
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Sent,
    /// Server already in the requested state ("Only running entries can be paused", ...)
    AlreadyAchieved,
    /// Start delivered, server returned the new entry
    Created(RemoteEntry),
    /// Stop without entry id: stopped this many own active entries
    Swept(usize),
    /// Task not pending or claimed by another sender
    Skipped,
}

impl DeliveryOutcome {
    /// Start прошёл, но новой записи в ответе нет: её нужно перечитать
    pub fn needs_entry_reload(&self, kind: OperationKind) -> bool {
        kind == OperationKind::Start && !matches!(self, DeliveryOutcome::Created(_))
    }
}

/// Итог одного прохода flush
#[derive(Debug, Default)]
pub struct FlushReport {
    pub synced: usize,
    pub failed: usize,
    pub created: Vec<RemoteEntry>,
    /// Tasks moved to `failed` in this run (retries exhausted)
    pub exhausted: Vec<i64>,
    pub needs_entry_reload: bool,
}

/// Менеджер синхронизации offline очереди.
/// Single-flight flush via AtomicBool; DB lock is held only for DB ops, not network I/O.
#[derive(Clone)]
pub struct SyncManager {
    pub(crate) db: Arc<Database>,
    pub(crate) remote: Arc<dyn RemoteApi>,
    pub(crate) auth_manager: Arc<AuthManager>,
    /// Single-flight: prevents concurrent flush runs
    pub(crate) is_syncing: Arc<AtomicBool>,
    pub(crate) max_retries: i32,
}

impl SyncManager {
    pub fn new(
        db: Arc<Database>,
        remote: Arc<dyn RemoteApi>,
        auth_manager: Arc<AuthManager>,
        max_retries: i32,
    ) -> Self {
        Self {
            db,
            remote,
            auth_manager,
            is_syncing: Arc::new(AtomicBool::new(false)),
            max_retries,
        }
    }

    /// Вычислить адаптивный batch size на основе количества pending задач
    fn calculate_batch_size(&self, pending_count: i32) -> i32 {
        match pending_count {
            0..=20 => 5,
            21..=100 => 20,
            101..=500 => 50,
            501..=2000 => 100,
            _ => 150,
        }
    }

    /// Записать операцию в очередь (до любого сетевого вызова)
    pub fn enqueue(
        &self,
        payload: &OperationPayload,
        credentials: Option<&Credentials>,
    ) -> Result<i64, rusqlite::Error> {
        let id = self.db.enqueue_operation(payload, credentials)?;
        debug!(
            "[SYNC] Enqueued {} as task {}",
            payload.kind().entity_type(),
            id
        );
        Ok(id)
    }

    /// Текущие credentials сессии, если они того же пользователя; иначе snapshot задачи
    async fn credentials_for(&self, task: &PendingOperation) -> Result<Credentials, SyncError> {
        let current = self.auth_manager.credentials().await;
        match (current, task.credentials.clone()) {
            (Some(cur), Some(snap)) if cur.user_id == snap.user_id => Ok(cur),
            (_, Some(snap)) => Ok(snap),
            (Some(cur), None) => Ok(cur),
            (None, None) => Err(SyncError::NotAuthenticated),
        }
    }

    /// Собственные активные записи (чужие отбрасываются с логом)
    async fn own_active_entries(&self, creds: &Credentials) -> Result<Vec<RemoteEntry>, SyncError> {
        let entries = self.remote.list_active_entries(creds).await?;
        Ok(entries
            .into_iter()
            .filter(|e| {
                if e.user_id != creds.user_id {
                    error!(
                        "[SECURITY] Entry {} belongs to user {}, not {}; ignoring",
                        e.id, e.user_id, creds.user_id
                    );
                    return false;
                }
                e.status.is_active()
            })
            .collect())
    }

    /// id записи для отложенной pause/resume: app_meta, затем сервер.
    /// Ok(None): активной записи нет, операция уже не нужна.
    async fn resolve_entry_id(
        &self,
        task: &PendingOperation,
        creds: &Credentials,
    ) -> Result<Option<String>, SyncError> {
        if let Some(id) = task.payload.entry_id() {
            return Ok(Some(id.to_string()));
        }
        self.ensure_no_pending_start(task)?;
        if let Some(id) = self.db.last_entry_id()? {
            return Ok(Some(id));
        }
        let newest = self
            .own_active_entries(creds)
            .await?
            .into_iter()
            .max_by_key(|e| e.start_time);
        Ok(newest.map(|e| e.id))
    }

    /// Задачи без id ждут доставки start из очереди
    fn ensure_no_pending_start(&self, task: &PendingOperation) -> Result<(), SyncError> {
        if self.db.pending_kinds()?.start {
            return Err(SyncError::UnresolvedEntry(format!(
                "task {} waits for the queued start",
                task.id
            )));
        }
        Ok(())
    }

    fn with_entry_id(payload: &OperationPayload, entry_id: &str) -> OperationPayload {
        let id = Some(entry_id.to_string());
        match payload {
            OperationPayload::Pause { at, .. } => OperationPayload::Pause {
                entry_id: id,
                at: *at,
            },
            OperationPayload::Resume { at, .. } => OperationPayload::Resume {
                entry_id: id,
                at: *at,
            },
            OperationPayload::Stop { at, .. } => OperationPayload::Stop {
                entry_id: id,
                at: *at,
            },
            other => other.clone(),
        }
    }

    /// Выполнить удалённый вызов для задачи. "Already in state" = успех.
    async fn send_task(&self, task: &PendingOperation) -> Result<DeliveryOutcome, SyncError> {
        let creds = self.credentials_for(task).await?;
        let key = task.idempotency_key.as_deref();

        let achieved = |r: Result<(), RemoteError>| -> Result<DeliveryOutcome, SyncError> {
            match r {
                Ok(()) => Ok(DeliveryOutcome::Sent),
                Err(e) if e.is_state_already_achieved() => {
                    info!(
                        "[SYNC] Task {} state-already-achieved ({}), dropping task",
                        task.id, e
                    );
                    Ok(DeliveryOutcome::AlreadyAchieved)
                }
                Err(e) => Err(SyncError::Remote(e)),
            }
        };

        match &task.payload {
            OperationPayload::Start { request } => {
                match self.remote.create_entry(&creds, request, key).await {
                    Ok(entry) => {
                        self.db.set_last_entry_id(Some(&entry.id))?;
                        Ok(DeliveryOutcome::Created(entry))
                    }
                    Err(e) if e.is_state_already_achieved() => {
                        info!(
                            "[SYNC] Task {} start: user already has an active entry",
                            task.id
                        );
                        Ok(DeliveryOutcome::AlreadyAchieved)
                    }
                    Err(e) => Err(SyncError::Remote(e)),
                }
            }
            OperationPayload::Pause { .. } | OperationPayload::Resume { .. } => {
                let Some(entry_id) = self.resolve_entry_id(task, &creds).await? else {
                    info!(
                        "[SYNC] Task {} has no active entry to {:?}, dropping",
                        task.id,
                        task.kind()
                    );
                    return Ok(DeliveryOutcome::AlreadyAchieved);
                };
                if task.payload.entry_id().is_none() {
                    self.db
                        .update_task_payload(task.id, &Self::with_entry_id(&task.payload, &entry_id))?;
                }
                let result = if task.kind() == OperationKind::Pause {
                    self.remote.pause_entry(&creds, &entry_id, key).await
                } else {
                    self.remote.resume_entry(&creds, &entry_id, key).await
                };
                achieved(result)
            }
            OperationPayload::Stop { entry_id, .. } => match entry_id {
                Some(entry_id) => {
                    let outcome = achieved(self.remote.stop_entry(&creds, entry_id, key).await)?;
                    if self.db.last_entry_id()?.as_deref() == Some(entry_id.as_str()) {
                        self.db.set_last_entry_id(None)?;
                    }
                    Ok(outcome)
                }
                None => {
                    // Stop без id: останавливаем все свои активные записи
                    self.ensure_no_pending_start(task)?;
                    let active = self.own_active_entries(&creds).await?;
                    let mut stopped = 0;
                    for entry in &active {
                        achieved(self.remote.stop_entry(&creds, &entry.id, None).await)?;
                        stopped += 1;
                    }
                    if stopped > 0 {
                        warn!(
                            "[SYNC] Task {}: stop without entry id swept {} active entries",
                            task.id, stopped
                        );
                    }
                    self.db.set_last_entry_id(None)?;
                    Ok(DeliveryOutcome::Swept(stopped))
                }
            },
            OperationPayload::ActivityBatch { activities } => {
                achieved(self.remote.upload_activities(&creds, activities, key).await)
            }
        }
    }

    /// Пометить задачу sent с повтором (100ms, 200ms, 400ms).
    /// HTTP уже прошёл: лучше повторная отправка, чем потерянная задача.
    async fn mark_sent_with_retry(&self, id: i64) -> bool {
        const MAX_ATTEMPTS: u32 = 3;
        let mut attempts = 0;
        loop {
            match self.db.mark_task_sent(id) {
                Ok(_) => return true,
                Err(e) => {
                    attempts += 1;
                    if attempts >= MAX_ATTEMPTS {
                        error!(
                            "[SYNC] CRITICAL: Failed to mark task {} sent after {} attempts: {}. Task stays in flight until restart.",
                            id, MAX_ATTEMPTS, e
                        );
                        return false;
                    }
                    let delay_ms = 100 * (1u64 << (attempts - 1));
                    warn!(
                        "[SYNC] Failed to mark task {} sent (attempt {}): {}. Retrying in {}ms...",
                        id, attempts, e, delay_ms
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    /// Записать неудачу; true: попытки исчерпаны, задача failed
    fn record_failure(&self, task: &PendingOperation, err: &SyncError) -> Result<bool, SyncError> {
        let new_retry_count = task.retry_count + 1;
        let error_msg = err.to_string();
        if err.is_permanent() || new_retry_count >= self.max_retries {
            self.db.update_sync_status_with_error(
                task.id,
                QueueStatus::Failed,
                new_retry_count,
                Some(&error_msg),
            )?;
            warn!(
                "[SYNC] Task {} failed after {} retries: {}",
                task.id, new_retry_count, error_msg
            );
            Ok(true)
        } else {
            self.db.update_sync_status_with_error(
                task.id,
                QueueStatus::Pending,
                new_retry_count,
                Some(&error_msg),
            )?;
            info!(
                "[SYNC] Task {} will retry later (attempt {}): {}",
                task.id, new_retry_count, error_msg
            );
            Ok(false)
        }
    }

    fn touch_last_sync(&self) {
        if let Err(e) = self.db.set_app_meta(
            crate::database::META_LAST_SYNC_AT,
            &chrono::Utc::now().timestamp().to_string(),
        ) {
            warn!("[SYNC] Failed to update last_sync_at: {}", e);
        }
    }

    /// Доставить уже взятую (claimed) задачу
    async fn deliver_claimed(&self, task: &PendingOperation) -> Result<DeliveryOutcome, SyncError> {
        match self.send_task(task).await {
            Ok(outcome) => {
                if self.mark_sent_with_retry(task.id).await {
                    self.touch_last_sync();
                }
                Ok(outcome)
            }
            Err(e) => {
                if self.record_failure(task, &e)? {
                    return Err(SyncError::Exhausted {
                        task_id: task.id,
                        cause: Box::new(e),
                    });
                }
                Err(e)
            }
        }
    }

    /// Background delivery of a single freshly enqueued task.
    /// Ошибка оставляет задачу pending для следующего flush.
    pub async fn deliver_one(&self, id: i64) -> Result<DeliveryOutcome, SyncError> {
        if !self.db.claim_task(id)? {
            debug!("[SYNC] Task {} not claimable (sent or in flight), skipping", id);
            return Ok(DeliveryOutcome::Skipped);
        }
        let Some(task) = self.db.get_task(id)? else {
            return Ok(DeliveryOutcome::Skipped);
        };
        if task.status != QueueStatus::InFlight {
            return Ok(DeliveryOutcome::Skipped);
        }
        self.deliver_claimed(&task).await
    }

    async fn run_flush_internal(&self, aggressive_retry: bool) -> Result<FlushReport, SyncError> {
        let mut report = FlushReport::default();

        let pending_count = self.db.get_pending_count()?;
        if pending_count == 0 {
            debug!("[SYNC] No pending tasks, skipping flush");
            self.touch_last_sync();
            return Ok(report);
        }

        let batch_size = self.calculate_batch_size(pending_count);
        let tasks = self
            .db
            .get_retry_tasks(self.max_retries, batch_size, aggressive_retry)?;
        if tasks.is_empty() {
            debug!("[SYNC] No tasks ready for retry (backoff), skipping");
            return Ok(report);
        }

        info!(
            "[SYNC] Starting flush: {} pending tasks, batch size: {}, aggressive: {}",
            pending_count, batch_size, aggressive_retry
        );

        let mut by_type_synced: HashMap<&'static str, i32> = HashMap::new();
        let mut by_type_failed: HashMap<&'static str, i32> = HashMap::new();

        for task in tasks {
            // Claim: another sender won't pick it during network I/O
            if !self.db.claim_task(task.id)? {
                continue;
            }
            let kind = task.kind();
            info!(
                "[SYNC] Processing task {}: {} (retry {})",
                task.id,
                kind.entity_type(),
                task.retry_count
            );
            match self.send_task(&task).await {
                Ok(outcome) => {
                    if outcome.needs_entry_reload(kind) {
                        report.needs_entry_reload = true;
                    }
                    if let DeliveryOutcome::Created(entry) = &outcome {
                        report.created.push(entry.clone());
                    }
                    if self.mark_sent_with_retry(task.id).await {
                        report.synced += 1;
                        *by_type_synced.entry(kind.entity_type()).or_insert(0) += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    *by_type_failed.entry(kind.entity_type()).or_insert(0) += 1;
                    if self.record_failure(&task, &e)? {
                        report.exhausted.push(task.id);
                    }
                }
            }
        }

        if report.synced > 0 {
            self.touch_last_sync();
        }
        if report.synced > 0 || report.failed > 0 {
            info!(
                "[SYNC] Flush completed: synced {:?}, failed {:?}",
                by_type_synced, by_type_failed
            );
        }
        Ok(report)
    }

    /// Обработать pending задачи очереди.
    /// Single-flight via AtomicBool; флаг сбрасывается scopeguard'ом даже при panic.
    pub async fn flush(&self, aggressive_retry: bool) -> Result<FlushReport, SyncError> {
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("[SYNC] Another flush already in progress, skipping");
            return Ok(FlushReport::default());
        }

        let _guard = guard((), |_| {
            self.is_syncing.store(false, Ordering::Release);
        });

        self.run_flush_internal(aggressive_retry).await
    }
}
