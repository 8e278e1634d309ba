use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Статус записи времени на сервере
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Running,
    Paused,
    Stopped,
}

impl EntryStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, EntryStatus::Running | EntryStatus::Paused)
    }
}

/// Денормализованный снимок проекта внутри записи
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

/// Запись времени на сервере (владелец: один пользователь)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub id: String,
    pub user_id: String,
    pub project_id: String,
    /// Unix timestamp (ms)
    pub start_time: i64,
    pub status: EntryStatus,
    #[serde(default)]
    pub project: Option<ProjectSnapshot>,
}

impl RemoteEntry {
    pub fn project_label(&self) -> Option<String> {
        self.project.as_ref().map(|p| p.name.clone())
    }
}

/// Тело запроса на создание записи
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEntryRequest {
    pub project_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Client-observed start time (ms)
    pub start_time: i64,
}

/// Одна запись URL-активности для пакетной выгрузки
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlActivity {
    pub url: String,
    pub domain: String,
    pub title: Option<String>,
    pub time_entry_id: Option<String>,
    pub started_at: i64,
    pub duration_seconds: u64,
}

/// Вид удалённой мутации в очереди
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Start,
    Pause,
    Resume,
    Stop,
    ActivityBatch,
}

impl OperationKind {
    /// entity_type column value
    pub fn entity_type(&self) -> &'static str {
        match self {
            OperationKind::Start => "time_entry_start",
            OperationKind::Pause => "time_entry_pause",
            OperationKind::Resume => "time_entry_resume",
            OperationKind::Stop => "time_entry_stop",
            OperationKind::ActivityBatch => "url_activity_batch",
        }
    }

    pub fn from_entity_type(entity_type: &str) -> Option<Self> {
        match entity_type {
            "time_entry_start" => Some(OperationKind::Start),
            "time_entry_pause" => Some(OperationKind::Pause),
            "time_entry_resume" => Some(OperationKind::Resume),
            "time_entry_stop" => Some(OperationKind::Stop),
            "url_activity_batch" => Some(OperationKind::ActivityBatch),
            _ => None,
        }
    }
}

/// Payload строки очереди. Хранится в sync_queue.payload как JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperationPayload {
    Start {
        request: CreateEntryRequest,
    },
    /// `entry_id == None`: id not known yet (start still queued), resolved at flush
    Pause {
        entry_id: Option<String>,
        at: i64,
    },
    Resume {
        entry_id: Option<String>,
        at: i64,
    },
    Stop {
        entry_id: Option<String>,
        at: i64,
    },
    ActivityBatch {
        activities: Vec<UrlActivity>,
    },
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationPayload::Start { .. } => OperationKind::Start,
            OperationPayload::Pause { .. } => OperationKind::Pause,
            OperationPayload::Resume { .. } => OperationKind::Resume,
            OperationPayload::Stop { .. } => OperationKind::Stop,
            OperationPayload::ActivityBatch { .. } => OperationKind::ActivityBatch,
        }
    }

    pub fn entry_id(&self) -> Option<&str> {
        match self {
            OperationPayload::Pause { entry_id, .. }
            | OperationPayload::Resume { entry_id, .. }
            | OperationPayload::Stop { entry_id, .. } => entry_id.as_deref(),
            OperationPayload::Start { .. } | OperationPayload::ActivityBatch { .. } => None,
        }
    }
}

/// Статус строки очереди
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    /// Claimed by a sender; only the send result moves it on
    InFlight,
    Sent,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InFlight => "in_flight",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "in_flight" => Some(QueueStatus::InFlight),
            "sent" => Some(QueueStatus::Sent),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

/// Строка очереди синхронизации (decoded)
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub id: i64,
    pub payload: OperationPayload,
    pub credentials: Option<crate::auth::Credentials>,
    pub status: QueueStatus,
    pub retry_count: i32,
    pub created_at: i64,
    pub idempotency_key: Option<String>,
}

impl PendingOperation {
    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }
}

/// Какие виды операций сейчас ждут отправки (для guard'ов reconciler'а)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingKinds {
    pub start: bool,
    pub pause: bool,
    pub resume: bool,
    pub stop: bool,
}

/// Статистика очереди синхронизации
#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub pending_count: i32,
    pub failed_count: i32,
    pub sent_count: i32,
    pub pending_by_type: HashMap<String, i32>,
}

/// Информация о failed задаче
#[derive(Debug, Serialize)]
pub struct FailedTaskInfo {
    pub id: i64,
    pub entity_type: String,
    pub payload: String,
    pub retry_count: i32,
    pub created_at: i64,
    pub last_retry_at: Option<i64>,
    pub error_message: Option<String>,
}

/// Результат обновления токена
#[derive(Debug)]
pub struct TokenRefreshResult {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Состояние, которое получает окно простоя
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdlePromptState {
    /// Unix ms
    pub pause_start_time: Option<i64>,
    /// Unix ms
    pub last_activity_time: Option<i64>,
    pub project_label: Option<String>,
    pub is_loading: bool,
}
