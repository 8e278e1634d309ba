use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

use crate::auth::{Credentials, TokenEncryption};

/// Log IO-related DB errors for easier diagnosis (disk full, permission denied).
/// Does not change error propagation: caller still returns Err.
fn log_io_error_if_any(context: &str, e: &rusqlite::Error) {
    use rusqlite::ffi::ErrorCode;
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = e {
        match ffi_err.code {
            ErrorCode::DiskFull => {
                error!(
                    "[DB] {}: Disk full. Free space on drive or check app data directory.",
                    context
                );
            }
            ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                error!(
                    "[DB] {}: Permission denied or read-only. Check app data directory is writable.",
                    context
                );
            }
            ErrorCode::SystemIoFailure => {
                error!("[DB] {}: I/O error. Check disk and permissions.", context);
            }
            _ => {}
        }
    }
}

/// Convert rusqlite errors from enqueue to user-friendly messages.
/// Disk full / read-only surface as "Data sync unavailable (...)".
pub fn enqueue_error_to_user_message(e: &rusqlite::Error) -> String {
    use rusqlite::ffi::ErrorCode;
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = e {
        match ffi_err.code {
            ErrorCode::DiskFull => "Data sync unavailable (Disk Full?)".to_string(),
            ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                "Data sync unavailable (Permission denied?)".to_string()
            }
            ErrorCode::SystemIoFailure => "Data sync unavailable (I/O error?)".to_string(),
            _ => format!("Failed to enqueue: {}", e),
        }
    } else {
        format!("Failed to enqueue: {}", e)
    }
}

use crate::models::{
    FailedTaskInfo, OperationKind, OperationPayload, PendingKinds, PendingOperation, QueueStats,
    QueueStatus,
};
use crate::sync::TaskPriority;
use chrono::Utc;
use rusqlite::Error::InvalidParameterName;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// app_meta keys
pub const META_LAST_ENTRY_ID: &str = "last_active_time_entry_id";
pub const META_CURRENT_USER: &str = "current_user_id";
pub const META_LAST_SYNC_AT: &str = "last_sync_at";
pub const META_IDLE_THRESHOLD: &str = "idle_threshold_secs";

/// Повторная отправка одной и той же операции в этом окне считается дублем
const DUPLICATE_WINDOW_SECS: i64 = 5;
const QUEUE_LIMIT: i32 = 10_000;

const TASK_COLUMNS: &str =
    "id, entity_type, payload, credentials, status, retry_count, created_at, idempotency_key";

type RawTask = (
    i64,
    String,
    String,
    Option<String>,
    String,
    i32,
    i64,
    Option<String>,
);

fn raw_task(row: &rusqlite::Row<'_>) -> SqliteResult<RawTask> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

/// Локальное хранилище: очередь синхронизации (outbox) и app_meta
pub struct Database {
    pub(crate) conn: Arc<Mutex<Connection>>,
    pub(crate) encryption: Arc<TokenEncryption>,
}

impl Database {
    /// Безопасная блокировка соединения с обработкой poisoned mutex
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, rusqlite::Error> {
        self.conn.lock().map_err(|e| {
            InvalidParameterName(format!(
                "Database mutex poisoned: {}. A panic occurred while holding the lock. \
                 Please restart the application to recover.",
                e
            ))
        })
    }

    pub fn new(db_path: &str) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;

        // GUARD: Integrity check on startup: detect corruption before init
        let integrity: String = conn
            .query_row("PRAGMA integrity_check", [], |r| r.get(0))
            .map_err(|e| InvalidParameterName(format!("Integrity check failed: {}", e)))?;
        if integrity.to_lowercase() != "ok" {
            return Err(InvalidParameterName(format!(
                "Database corruption detected: {}",
                integrity
            )));
        }

        // WAL: очередь переживает падение процесса посреди записи
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| {
                warn!(
                    "[DB] Failed to enable WAL mode: {}. Continuing with default journal mode.",
                    e
                );
            })
            .ok();
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");

        let key_dir = std::path::Path::new(db_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty());
        let encryption = TokenEncryption::new(key_dir).map_err(InvalidParameterName)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            encryption: Arc::new(encryption),
        };
        db.run_migrations()?;
        db.release_in_flight()?;
        Ok(db)
    }

    /// Current schema version (PRAGMA user_version). Bump when adding migrations.
    const SCHEMA_VERSION: i32 = 2;

    fn run_migrations(&self) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        let current: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

        if current < 1 {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS sync_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                credentials TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_retry_at INTEGER,
                error_message TEXT,
                priority INTEGER NOT NULL DEFAULT 2,
                idempotency_key TEXT
            )",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS app_meta (key TEXT PRIMARY KEY, value TEXT)",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status)",
                [],
            )?;
        }

        // Migration 2: lookup by idempotency key (duplicate window check)
        if current < 2 {
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_sync_queue_idempotency ON sync_queue(idempotency_key, status)",
                [],
            )?;
        }

        conn.pragma_update(None, "user_version", Self::SCHEMA_VERSION)?;
        Ok(())
    }

    fn decode_task(&self, raw: RawTask) -> Result<PendingOperation, String> {
        let (id, entity_type, payload, credentials, status, retry_count, created_at, key) = raw;
        let payload: OperationPayload = serde_json::from_str(&payload)
            .map_err(|e| format!("malformed {} payload: {}", entity_type, e))?;
        if OperationKind::from_entity_type(&entity_type) != Some(payload.kind()) {
            return Err(format!(
                "entity_type {} does not match payload {:?}",
                entity_type,
                payload.kind()
            ));
        }
        let status = QueueStatus::parse(&status)
            .ok_or_else(|| format!("unknown status {}", status))?;
        // Broken snapshot не блокирует задачу: отправим с текущими credentials
        let credentials = credentials.and_then(|enc| {
            self.encryption
                .decrypt_credentials(&enc)
                .map_err(|e| warn!("[DB] Task {}: credential snapshot unreadable ({})", id, e))
                .ok()
        });
        Ok(PendingOperation {
            id,
            payload,
            credentials,
            status,
            retry_count,
            created_at,
            idempotency_key: key,
        })
    }

    /// Decode rows; broken rows are marked failed so one bad task won't block the queue
    fn decode_tasks(&self, raw_rows: Vec<RawTask>) -> Vec<PendingOperation> {
        let mut result = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            let id = raw.0;
            match self.decode_task(raw) {
                Ok(task) => result.push(task),
                Err(e) => {
                    warn!("[DB] Skipping task {}: {}", id, e);
                    let _ = self.update_sync_status_with_error(id, QueueStatus::Failed, 0, Some(&e));
                }
            }
        }
        result
    }

    // ============================================
    // APP META
    // ============================================

    pub fn get_app_meta(&self, key: &str) -> SqliteResult<Option<String>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT value FROM app_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn set_app_meta(&self, key: &str, value: &str) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO app_meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    /// Последний известный id активной записи (пустая строка = нет)
    pub fn last_entry_id(&self) -> SqliteResult<Option<String>> {
        Ok(self
            .get_app_meta(META_LAST_ENTRY_ID)?
            .filter(|id| !id.is_empty()))
    }

    pub fn set_last_entry_id(&self, entry_id: Option<&str>) -> SqliteResult<()> {
        self.set_app_meta(META_LAST_ENTRY_ID, entry_id.unwrap_or(""))
    }

    /// Порог простоя для этого устройства (None = не задан)
    pub fn get_idle_threshold_secs(&self) -> SqliteResult<Option<u64>> {
        Ok(self
            .get_app_meta(META_IDLE_THRESHOLD)?
            .and_then(|v| v.parse::<u64>().ok()))
    }

    pub fn set_idle_threshold_secs(&self, secs: u64) -> SqliteResult<()> {
        self.set_app_meta(META_IDLE_THRESHOLD, &secs.to_string())
    }

    /// Очистить локальные данные пользователя (очередь, id записи).
    /// Вызывать только при реальной смене пользователя (A → B), не при входе после логаута ("" → A).
    pub fn clear_user_data(&self) -> SqliteResult<()> {
        {
            let conn = self.lock_conn()?;
            conn.execute("DELETE FROM sync_queue", [])?;
        }
        self.set_app_meta(META_LAST_ENTRY_ID, "")?;
        self.set_app_meta(META_LAST_SYNC_AT, "")?;
        Ok(())
    }

    /// id записи из последних pause/resume/stop в очереди: fallback когда app_meta пуст
    pub fn get_last_time_entry_id_from_queue(&self) -> SqliteResult<Option<String>> {
        let payloads: Vec<String> = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare(
                "SELECT payload FROM sync_queue
                 WHERE entity_type IN ('time_entry_pause', 'time_entry_resume', 'time_entry_stop')
                 ORDER BY created_at DESC, id DESC LIMIT 5",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.filter_map(|r| r.ok()).collect()
        };

        for payload in payloads {
            if let Ok(op) = serde_json::from_str::<OperationPayload>(&payload) {
                if let Some(id) = op.entry_id().filter(|id| !id.is_empty()) {
                    return Ok(Some(id.to_string()));
                }
            }
        }
        Ok(None)
    }

    // ============================================
    // SYNC QUEUE
    // ============================================

    /// Durably record a remote mutation before any network call.
    /// Защита от дублирования: тот же payload в статусе pending за последние 5 секунд
    /// возвращает id существующей задачи.
    pub fn enqueue_operation(
        &self,
        payload: &OperationPayload,
        credentials: Option<&Credentials>,
    ) -> SqliteResult<i64> {
        let kind = payload.kind();
        let entity_type = kind.entity_type();
        let payload_json = serde_json::to_string(payload)
            .map_err(|e| InvalidParameterName(format!("Payload serialization error: {}", e)))?;

        let mut hasher = DefaultHasher::new();
        entity_type.hash(&mut hasher);
        payload_json.hash(&mut hasher);
        let idempotency_key = format!("{}-{:x}", entity_type, hasher.finish());

        let encrypted_credentials = match credentials {
            Some(c) => Some(self.encryption.encrypt_credentials(c).map_err(|e| {
                error!("[DB] Encryption failed for credentials: {}", e);
                InvalidParameterName(format!("Encryption error: {}", e))
            })?),
            None => None,
        };

        let conn = self.lock_conn()?;
        let now = Utc::now().timestamp();

        conn.execute("BEGIN IMMEDIATE TRANSACTION", []).map_err(|e| {
            log_io_error_if_any("enqueue_operation begin", &e);
            error!("[DB] Failed to begin transaction in enqueue_operation: {}", e);
            e
        })?;

        let existing: Option<i64> = match conn
            .query_row(
                "SELECT id FROM sync_queue
                 WHERE idempotency_key = ?1
                 AND status = 'pending'
                 AND created_at > ?2
                 ORDER BY created_at DESC
                 LIMIT 1",
                params![idempotency_key, now - DUPLICATE_WINDOW_SECS],
                |row| row.get(0),
            )
            .optional()
        {
            Ok(id) => id,
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                return Err(e);
            }
        };

        if let Some(existing_id) = existing {
            warn!(
                "[DB] Duplicate task detected: {} (returning existing id {})",
                entity_type, existing_id
            );
            conn.execute("COMMIT", []).map_err(|e| {
                let _ = conn.execute("ROLLBACK", []);
                e
            })?;
            return Ok(existing_id);
        }

        let priority = TaskPriority::from_kind(kind);

        // GUARD: лимит очереди
        let queue_size: i32 = match conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE status IN ('pending', 'in_flight', 'failed')",
            [],
            |row| row.get(0),
        ) {
            Ok(size) => size,
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                return Err(e);
            }
        };

        if queue_size >= QUEUE_LIMIT {
            if priority != TaskPriority::Critical {
                warn!(
                    "[DB] Queue limit reached ({} tasks), dropping non-critical task: {}",
                    queue_size, entity_type
                );
                let _ = conn.execute("ROLLBACK", []);
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
                    Some("Queue limit reached".to_string()),
                ));
            }
            // Для critical задач вытесняем самые старые normal задачи
            let _ = conn.execute(
                "DELETE FROM sync_queue
                 WHERE id IN (
                     SELECT id FROM sync_queue
                     WHERE status = 'pending' AND priority = ?1
                     ORDER BY created_at ASC
                     LIMIT 10
                 )",
                params![TaskPriority::Normal as i32],
            );
        }

        let result = conn.execute(
            "INSERT INTO sync_queue (entity_type, payload, credentials, status, created_at, priority, idempotency_key)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
            params![
                entity_type,
                payload_json,
                encrypted_credentials,
                now,
                priority as i32,
                idempotency_key
            ],
        );

        match result {
            Ok(_) => {
                conn.execute("COMMIT", []).map_err(|e| {
                    log_io_error_if_any("enqueue_operation commit", &e);
                    error!("[DB] Failed to commit transaction in enqueue_operation: {}", e);
                    let _ = conn.execute("ROLLBACK", []);
                    e
                })?;
                Ok(conn.last_insert_rowid())
            }
            Err(e) => {
                log_io_error_if_any("enqueue_operation", &e);
                error!(
                    "[DB] Failed to insert task in enqueue_operation: {}. Rolling back transaction.",
                    e
                );
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    pub fn get_task(&self, id: i64) -> SqliteResult<Option<PendingOperation>> {
        let raw = {
            let conn = self.lock_conn()?;
            conn.query_row(
                &format!("SELECT {} FROM sync_queue WHERE id = ?1", TASK_COLUMNS),
                params![id],
                raw_task,
            )
            .optional()?
        };
        Ok(raw.and_then(|r| self.decode_tasks(vec![r]).pop()))
    }

    /// Получить задачи для синхронизации с приоритетами и exponential backoff:
    /// 10 сек → 20 сек → 40 сек → 80 сек → 120 сек (max).
    /// aggressive_retry=true: при восстановлении сети 5 сек вместо полного backoff
    pub fn get_retry_tasks(
        &self,
        max_retries: i32,
        batch_size: i32,
        aggressive_retry: bool,
    ) -> SqliteResult<Vec<PendingOperation>> {
        let backoff_sql = if aggressive_retry {
            "5"
        } else {
            "CASE
              WHEN retry_count = 0 THEN 10
              WHEN retry_count = 1 THEN 20
              WHEN retry_count = 2 THEN 40
              WHEN retry_count = 3 THEN 80
              ELSE 120
          END"
        };

        let raw_rows: Vec<RawTask> = {
            let conn = self.lock_conn()?;
            let now = Utc::now().timestamp();
            let sql = format!(
                "SELECT {} FROM sync_queue
                 WHERE status = 'pending' AND retry_count < ?1
                 AND (last_retry_at IS NULL OR last_retry_at + {} <= ?2)
                 ORDER BY priority ASC, created_at ASC, id ASC
                 LIMIT ?3",
                TASK_COLUMNS, backoff_sql
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![max_retries, now, batch_size], raw_task)?;
            rows.filter_map(|r| r.ok()).collect()
        };

        Ok(self.decode_tasks(raw_rows))
    }

    /// Зарезервировать задачу для отправки: pending → in_flight.
    /// false: задача уже отправлена или её отправляет другой sender.
    /// Снять in_flight может только результат отправки (sent / pending / failed).
    pub fn claim_task(&self, id: i64) -> SqliteResult<bool> {
        let conn = self.lock_conn()?;
        let now = Utc::now().timestamp();
        let changed = conn.execute(
            "UPDATE sync_queue SET status = 'in_flight', last_retry_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![now, id],
        )?;
        Ok(changed == 1)
    }

    /// После падения процесса in_flight задачи никто не отправляет: вернуть в pending
    fn release_in_flight(&self) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        let released = conn.execute(
            "UPDATE sync_queue SET status = 'pending' WHERE status = 'in_flight'",
            [],
        )?;
        if released > 0 {
            warn!("[DB] Released {} tasks left in flight by the previous run", released);
        }
        Ok(())
    }

    /// Подставить id записи в отложенную операцию (id стал известен после start)
    pub fn update_task_payload(&self, id: i64, payload: &OperationPayload) -> SqliteResult<()> {
        let payload_json = serde_json::to_string(payload)
            .map_err(|e| InvalidParameterName(format!("Payload serialization error: {}", e)))?;
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE sync_queue SET payload = ?1 WHERE id = ?2",
            params![payload_json, id],
        )?;
        Ok(())
    }

    /// Обновить статус задачи на "sent" (успешная доставка)
    pub fn mark_task_sent(&self, id: i64) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE sync_queue SET status = 'sent', error_message = NULL WHERE id = ?1",
            params![id],
        )
        .map_err(|e| {
            log_io_error_if_any("mark_task_sent", &e);
            e
        })?;
        Ok(())
    }

    pub fn update_sync_status(
        &self,
        id: i64,
        status: QueueStatus,
        retry_count: i32,
    ) -> SqliteResult<()> {
        self.update_sync_status_with_error(id, status, retry_count, None)
    }

    /// Обновить статус задачи с причиной ошибки
    pub fn update_sync_status_with_error(
        &self,
        id: i64,
        status: QueueStatus,
        retry_count: i32,
        error_message: Option<&str>,
    ) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        let now = Utc::now().timestamp();

        if let Some(error) = error_message {
            conn.execute(
                "UPDATE sync_queue
                 SET status = ?1, retry_count = ?2, last_retry_at = ?3, error_message = ?4
                 WHERE id = ?5",
                params![status.as_str(), retry_count, now, error, id],
            )?;
        } else {
            conn.execute(
                "UPDATE sync_queue
                 SET status = ?1, retry_count = ?2, last_retry_at = ?3
                 WHERE id = ?4",
                params![status.as_str(), retry_count, now, id],
            )?;
        }

        Ok(())
    }

    pub fn get_pending_count(&self) -> SqliteResult<i32> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE status IN ('pending', 'in_flight')",
            [],
            |row| row.get(0),
        )
    }

    pub fn get_failed_count(&self) -> SqliteResult<i32> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE status = 'failed'",
            [],
            |row| row.get(0),
        )
    }

    /// Какие виды time entry операций ждут отправки
    pub fn pending_kinds(&self) -> SqliteResult<PendingKinds> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT entity_type FROM sync_queue WHERE status IN ('pending', 'in_flight')",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut kinds = PendingKinds::default();
        for row in rows {
            match OperationKind::from_entity_type(&row?) {
                Some(OperationKind::Start) => kinds.start = true,
                Some(OperationKind::Pause) => kinds.pause = true,
                Some(OperationKind::Resume) => kinds.resume = true,
                Some(OperationKind::Stop) => kinds.stop = true,
                _ => {}
            }
        }
        Ok(kinds)
    }

    /// Статистика очереди по типам задач
    pub fn get_queue_stats(&self) -> SqliteResult<QueueStats> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(
            "SELECT entity_type, COUNT(*) as count
             FROM sync_queue
             WHERE status IN ('pending', 'in_flight')
             GROUP BY entity_type",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i32>(1)?))
        })?;
        let mut by_type = std::collections::HashMap::new();
        for row in rows {
            let (entity_type, count) = row?;
            by_type.insert(entity_type, count);
        }

        let count_by = |status: &str| -> SqliteResult<i32> {
            conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE status = ?1",
                params![status],
                |row| row.get(0),
            )
        };

        Ok(QueueStats {
            pending_count: count_by("pending")? + count_by("in_flight")?,
            failed_count: count_by("failed")?,
            sent_count: count_by("sent")?,
            pending_by_type: by_type,
        })
    }

    /// Список failed задач с деталями
    pub fn get_failed_tasks(&self, limit: i32) -> SqliteResult<Vec<FailedTaskInfo>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, entity_type, payload, retry_count, created_at, last_retry_at, error_message
             FROM sync_queue
             WHERE status = 'failed'
             ORDER BY created_at DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit], |row| {
            Ok(FailedTaskInfo {
                id: row.get(0)?,
                entity_type: row.get(1)?,
                payload: row.get(2)?,
                retry_count: row.get(3)?,
                created_at: row.get(4)?,
                last_retry_at: row.get(5)?,
                error_message: row.get(6)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Очистить всю очередь синхронизации (safety valve для пользователей)
    pub fn clear_sync_queue(&self) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM sync_queue", [])?;
        Ok(())
    }

    /// Сбросить failed задачи обратно в pending для повторной попытки
    pub fn reset_failed_tasks(&self, limit: i32) -> SqliteResult<i32> {
        let conn = self.lock_conn()?;
        let count = conn.execute(
            "UPDATE sync_queue
             SET status = 'pending', retry_count = 0, last_retry_at = NULL
             WHERE id IN (
                 SELECT id FROM sync_queue
                 WHERE status = 'failed'
                 ORDER BY created_at ASC
                 LIMIT ?1
             )",
            params![limit],
        )?;
        Ok(count as i32)
    }

    /// Снять backoff со всех pending задач (для тестов: не ждать 10+ секунд)
    #[cfg(test)]
    pub(crate) fn expire_backoff(&self) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE sync_queue SET last_retry_at = NULL WHERE status = 'pending'",
            [],
        )?;
        Ok(())
    }
}
