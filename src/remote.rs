use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::{AuthManager, Credentials};
use crate::config::ReconcileConfig;
use crate::models::{CreateEntryRequest, RemoteEntry, UrlActivity};

/// Тела ответов 400, означающие "сервер уже в нужном состоянии"
const STATE_ALREADY_ACHIEVED: [&str; 4] = [
    "Only running entries can be paused",
    "Only paused entries can be resumed",
    "Time entry is already stopped",
    "User already has an active time entry",
];

/// Ошибки удалённого сервиса (для разбора и логирования)
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteError {
    Network(String),
    Timeout(String),
    Http { status: u16, message: String },
    Auth(String),
    ParsePayload(String),
    /// Empty or oversized activity batch, rejected before sending
    InvalidBatch(String),
}

impl RemoteError {
    /// Сервер отказал, потому что желаемое состояние уже достигнуто
    pub fn is_state_already_achieved(&self) -> bool {
        match self {
            RemoteError::Http { status: 409, .. } => true,
            RemoteError::Http {
                status: 400,
                message,
            } => STATE_ALREADY_ACHIEVED.iter().any(|m| message.contains(m)),
            _ => false,
        }
    }

    /// Retrying later can help
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout(_) => true,
            RemoteError::Http { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            _ => false,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Network(s) => write!(f, "Network: {}", s),
            RemoteError::Timeout(s) => write!(f, "Timeout: {}", s),
            RemoteError::Http { status, message } => write!(f, "HTTP {}: {}", status, message),
            RemoteError::Auth(s) => write!(f, "Auth: {}", s),
            RemoteError::ParsePayload(s) => write!(f, "Parse payload: {}", s),
            RemoteError::InvalidBatch(s) => write!(f, "Invalid batch: {}", s),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout(e.to_string())
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

/// Remote time-entry service
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Активные (RUNNING/PAUSED) записи пользователя. Может содержать чужие записи:
    /// фильтрация и проверка владельца на стороне вызывающего.
    async fn list_active_entries(
        &self,
        creds: &Credentials,
    ) -> Result<Vec<RemoteEntry>, RemoteError>;

    async fn create_entry(
        &self,
        creds: &Credentials,
        request: &CreateEntryRequest,
        idempotency_key: Option<&str>,
    ) -> Result<RemoteEntry, RemoteError>;

    async fn pause_entry(
        &self,
        creds: &Credentials,
        entry_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<(), RemoteError>;

    async fn resume_entry(
        &self,
        creds: &Credentials,
        entry_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<(), RemoteError>;

    async fn stop_entry(
        &self,
        creds: &Credentials,
        entry_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<(), RemoteError>;

    async fn heartbeat(&self, creds: &Credentials, entry_id: Option<&str>)
        -> Result<(), RemoteError>;

    async fn upload_activities(
        &self,
        creds: &Credentials,
        activities: &[UrlActivity],
        idempotency_key: Option<&str>,
    ) -> Result<(), RemoteError>;
}

/// Проверка размера пакета активности до отправки
pub fn validate_activity_batch(len: usize, max_batch: usize) -> Result<(), RemoteError> {
    if len == 0 {
        return Err(RemoteError::InvalidBatch("empty batch".into()));
    }
    if len > max_batch {
        return Err(RemoteError::InvalidBatch(format!(
            "batch of {} exceeds limit {}",
            len, max_batch
        )));
    }
    Ok(())
}

/// reqwest client for the time-entry API
pub struct HttpRemote {
    client: reqwest::Client,
    api_base_url: String,
    app_version: String,
    upload_timeout: std::time::Duration,
    max_activity_batch: usize,
    auth_manager: Arc<AuthManager>,
}

impl HttpRemote {
    pub fn new(config: &ReconcileConfig, auth_manager: Arc<AuthManager>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            app_version: config.app_version.clone(),
            upload_timeout: config.upload_timeout(),
            max_activity_batch: config.max_activity_batch,
            auth_manager,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }

    fn authorized(
        &self,
        builder: reqwest::RequestBuilder,
        access_token: &str,
        idempotency_key: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut request = builder
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", access_token))
            .header("X-App-Version", &self.app_version);
        if let Some(key) = idempotency_key {
            request = request.header("X-Idempotency-Key", key);
        }
        request
    }

    /// Отправить запрос; при 401 один раз обновить токен и повторить.
    /// `build` получает access token и собирает запрос заново.
    async fn send<F>(
        &self,
        creds: &Credentials,
        what: &str,
        build: F,
    ) -> Result<reqwest::Response, RemoteError>
    where
        F: Fn(&str) -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut access_token = creds.access_token.clone();
        let mut retry_with_refresh = true;

        loop {
            let response = build(&access_token).send().await?;
            let status = response.status();

            if status == 401 && retry_with_refresh {
                let Some(refresh) = creds.refresh_token.as_deref() else {
                    let err = RemoteError::Auth(
                        "Token expired (401) but no refresh token available".into(),
                    );
                    warn!("[SYNC] {} ({})", err, what);
                    return Err(err);
                };
                info!("[SYNC] Token expired (401), refreshing token for {}", what);
                match self.auth_manager.refresh_token(refresh).await {
                    Ok(token_result) => {
                        access_token = token_result.access_token.clone();
                        // Обновляем менеджер только для того же пользователя
                        if self.auth_manager.current_user_id().await.as_deref()
                            == Some(creds.user_id.as_str())
                        {
                            self.auth_manager
                                .update_tokens(token_result.access_token, token_result.refresh_token)
                                .await;
                        }
                        retry_with_refresh = false;
                        continue;
                    }
                    Err(e) => {
                        let err = RemoteError::Auth(e);
                        warn!("[SYNC] Failed to refresh token for {}: {}", what, err);
                        return Err(err);
                    }
                }
            }

            if status.is_success() {
                return Ok(response);
            }

            let body = response.text().await.unwrap_or_default();
            if status == 400 && !body.is_empty() {
                warn!("[SYNC] {} HTTP 400 response body: {}", what, body);
            }
            let message = if body.is_empty() {
                status.canonical_reason().unwrap_or("Unknown").into()
            } else {
                body
            };
            return Err(RemoteError::Http {
                status: status.as_u16(),
                message,
            });
        }
    }

    async fn put_transition(
        &self,
        creds: &Credentials,
        entry_id: &str,
        action: &str,
        idempotency_key: Option<&str>,
    ) -> Result<(), RemoteError> {
        let url = self.url(&format!("/time-entries/{}/{}", entry_id, action));
        let what = format!("{} {}", action, entry_id);
        // pause/resume/stop: id в URL, тело пустое
        self.send(creds, &what, |token| {
            self.authorized(self.client.put(&url), token, idempotency_key)
                .json(&serde_json::json!({}))
        })
        .await?;
        Ok(())
    }
}

/// Ответ списка: массив или {"data": [...]}. Битые записи отбрасываются.
fn parse_entry_list(json: serde_json::Value) -> Result<Vec<RemoteEntry>, RemoteError> {
    let items = match json {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut obj) => match obj.remove("data") {
            Some(serde_json::Value::Array(items)) => items,
            _ => {
                return Err(RemoteError::ParsePayload(
                    "expected an array of time entries".into(),
                ))
            }
        },
        _ => {
            return Err(RemoteError::ParsePayload(
                "expected an array of time entries".into(),
            ))
        }
    };

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<RemoteEntry>(item) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("[SYNC] Dropping malformed time entry from server: {}", e),
        }
    }
    Ok(entries)
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn list_active_entries(
        &self,
        creds: &Credentials,
    ) -> Result<Vec<RemoteEntry>, RemoteError> {
        let url = self.url("/time-entries/active");
        let response = self
            .send(creds, "list active entries", |token| {
                self.authorized(self.client.get(&url), token, None)
                    .query(&[("userId", creds.user_id.as_str())])
            })
            .await?;
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RemoteError::ParsePayload(e.to_string()))?;
        parse_entry_list(json)
    }

    async fn create_entry(
        &self,
        creds: &Credentials,
        request: &CreateEntryRequest,
        idempotency_key: Option<&str>,
    ) -> Result<RemoteEntry, RemoteError> {
        let url = self.url("/time-entries");
        let response = self
            .send(creds, "create entry", |token| {
                self.authorized(self.client.post(&url), token, idempotency_key)
                    .json(request)
            })
            .await?;
        response
            .json::<RemoteEntry>()
            .await
            .map_err(|e| RemoteError::ParsePayload(e.to_string()))
    }

    async fn pause_entry(
        &self,
        creds: &Credentials,
        entry_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.put_transition(creds, entry_id, "pause", idempotency_key)
            .await
    }

    async fn resume_entry(
        &self,
        creds: &Credentials,
        entry_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.put_transition(creds, entry_id, "resume", idempotency_key)
            .await
    }

    async fn stop_entry(
        &self,
        creds: &Credentials,
        entry_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.put_transition(creds, entry_id, "stop", idempotency_key)
            .await
    }

    async fn heartbeat(
        &self,
        creds: &Credentials,
        entry_id: Option<&str>,
    ) -> Result<(), RemoteError> {
        let url = self.url("/heartbeat");
        let body = serde_json::json!({
            "timeEntryId": entry_id,
            "appVersion": self.app_version,
        });
        self.send(creds, "heartbeat", |token| {
            self.authorized(self.client.post(&url), token, None)
                .json(&body)
        })
        .await?;
        Ok(())
    }

    async fn upload_activities(
        &self,
        creds: &Credentials,
        activities: &[UrlActivity],
        idempotency_key: Option<&str>,
    ) -> Result<(), RemoteError> {
        validate_activity_batch(activities.len(), self.max_activity_batch)?;
        let url = self.url("/url-activities/batch");
        let body = serde_json::json!({ "activities": activities });
        self.send(creds, "upload activities", |token| {
            self.authorized(self.client.post(&url), token, idempotency_key)
                .timeout(self.upload_timeout)
                .json(&body)
        })
        .await?;
        Ok(())
    }
}
