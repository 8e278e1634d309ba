//! Фейковые движок и сервер для тестов сценариев.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::{AuthManager, Credentials};
use crate::config::ReconcileConfig;
use crate::context::SessionContext;
use crate::database::Database;
use crate::engine::{EngineError, EngineSnapshot, EngineStateTag, TimerEngineApi};
use crate::models::{CreateEntryRequest, EntryStatus, RemoteEntry, UrlActivity};
use crate::remote::{validate_activity_batch, RemoteApi, RemoteError};

pub fn test_config() -> ReconcileConfig {
    ReconcileConfig {
        api_base_url: "http://127.0.0.1:9".to_string(),
        online_probe_urls: Vec::new(),
        ..ReconcileConfig::default()
    }
}

pub fn creds(user_id: &str) -> Credentials {
    Credentials {
        user_id: user_id.to_string(),
        access_token: format!("token-{}", user_id),
        refresh_token: None,
    }
}

/// Контекст поверх временной БД (без credentials)
pub fn session_context(
    engine: Arc<FakeEngine>,
    remote: Arc<FakeRemote>,
) -> (Arc<SessionContext>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let config = test_config();
    let auth = Arc::new(AuthManager::new(config.api_base_url.clone()));
    let ctx = SessionContext::new(config, engine, remote, db, auth);
    (Arc::new(ctx), dir)
}

pub fn open_db(dir: &tempfile::TempDir) -> Arc<Database> {
    let path = dir.path().join("hubnity.db");
    Arc::new(Database::new(path.to_str().unwrap()).unwrap())
}

pub async fn login(ctx: &SessionContext, user_id: &str) {
    ctx.auth.set_credentials(Some(creds(user_id))).await;
}

/// Дождаться условия, выставляемого фоновой доставкой
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub fn entry(id: &str, user_id: &str, start_time: i64, status: EntryStatus) -> RemoteEntry {
    RemoteEntry {
        id: id.to_string(),
        user_id: user_id.to_string(),
        project_id: "p1".to_string(),
        start_time,
        status,
        project: None,
    }
}

struct FakeEngineState {
    tag: EngineStateTag,
    accumulated: u64,
    session: u64,
    restored: bool,
}

/// FSM движка в памяти с ручными часами
pub struct FakeEngine {
    state: Mutex<FakeEngineState>,
    unavailable: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::with_state(EngineStateTag::Stopped, 0, false)
    }

    /// RUNNING with `session_secs` already on the clock
    pub fn running(session_secs: u64) -> Self {
        Self::with_state(EngineStateTag::Running { started_at: 1_700_000_000 }, session_secs, false)
    }

    /// PAUSED after a restart that found the timer RUNNING
    pub fn restored_paused() -> Self {
        Self::with_state(EngineStateTag::Paused, 0, true)
    }

    fn with_state(tag: EngineStateTag, session: u64, restored: bool) -> Self {
        Self {
            state: Mutex::new(FakeEngineState {
                tag,
                accumulated: 0,
                session,
                restored,
            }),
            unavailable: AtomicBool::new(false),
            delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == name).count()
    }

    pub fn accumulated(&self) -> u64 {
        self.state.lock().unwrap().accumulated
    }

    fn snapshot(st: &FakeEngineState) -> EngineSnapshot {
        let running = matches!(st.tag, EngineStateTag::Running { .. });
        EngineSnapshot {
            state: st.tag,
            elapsed_seconds: st.accumulated + if running { st.session } else { 0 },
            accumulated_seconds: st.accumulated,
            session_start: match st.tag {
                EngineStateTag::Running { started_at } => Some(started_at),
                _ => None,
            },
            day_start: Some(1_699_990_000),
            restored_from_running: st.restored,
        }
    }

    async fn enter(&self, name: &str) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(name.to_string());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable("engine process not responding".into()));
        }
        Ok(())
    }

    fn transition(
        &self,
        f: impl FnOnce(&mut FakeEngineState) -> Result<(), &'static str>,
    ) -> Result<EngineSnapshot, EngineError> {
        let mut st = self.state.lock().unwrap();
        f(&mut st).map_err(|msg| EngineError::Rejected(msg.to_string()))?;
        st.restored = false;
        Ok(Self::snapshot(&st))
    }

    fn close_session(st: &mut FakeEngineState, counted: u64) {
        st.accumulated += counted;
        st.session = 0;
    }
}

#[async_trait]
impl TimerEngineApi for FakeEngine {
    async fn start(&self) -> Result<EngineSnapshot, EngineError> {
        self.enter("start").await?;
        self.transition(|st| match st.tag {
            EngineStateTag::Running { .. } => Err("Timer is already running"),
            EngineStateTag::Paused => Err("Cannot start paused timer. Use resume() instead"),
            EngineStateTag::Stopped => {
                st.tag = EngineStateTag::Running { started_at: 1_700_000_000 };
                st.session = 0;
                Ok(())
            }
        })
    }

    async fn pause(&self) -> Result<EngineSnapshot, EngineError> {
        self.enter("pause").await?;
        self.transition(|st| match st.tag {
            EngineStateTag::Running { .. } => {
                let session = st.session;
                Self::close_session(st, session);
                st.tag = EngineStateTag::Paused;
                Ok(())
            }
            EngineStateTag::Paused => Err("Timer is already paused"),
            EngineStateTag::Stopped => Err("Cannot pause stopped timer"),
        })
    }

    async fn pause_idle(&self, work_seconds: u64) -> Result<EngineSnapshot, EngineError> {
        self.enter("pause_idle").await?;
        self.transition(|st| match st.tag {
            EngineStateTag::Running { .. } => {
                let counted = work_seconds.min(st.session);
                Self::close_session(st, counted);
                st.tag = EngineStateTag::Paused;
                Ok(())
            }
            EngineStateTag::Paused => Err("Timer is already paused"),
            EngineStateTag::Stopped => Err("Cannot pause stopped timer"),
        })
    }

    async fn resume(&self) -> Result<EngineSnapshot, EngineError> {
        self.enter("resume").await?;
        self.transition(|st| match st.tag {
            EngineStateTag::Paused => {
                st.tag = EngineStateTag::Running { started_at: 1_700_000_000 };
                st.session = 0;
                Ok(())
            }
            EngineStateTag::Running { .. } => Err("Timer is already running"),
            EngineStateTag::Stopped => Err("Cannot resume stopped timer. Use start() instead"),
        })
    }

    async fn stop(&self) -> Result<EngineSnapshot, EngineError> {
        self.enter("stop").await?;
        self.transition(|st| match st.tag {
            EngineStateTag::Stopped => Err("Timer is already stopped"),
            _ => {
                let session = if matches!(st.tag, EngineStateTag::Running { .. }) {
                    st.session
                } else {
                    0
                };
                Self::close_session(st, session);
                st.tag = EngineStateTag::Stopped;
                Ok(())
            }
        })
    }

    async fn get_state(&self) -> Result<EngineSnapshot, EngineError> {
        self.enter("get_state").await?;
        Ok(Self::snapshot(&self.state.lock().unwrap()))
    }

    async fn reset_day(&self) -> Result<EngineSnapshot, EngineError> {
        self.enter("reset_day").await?;
        let mut st = self.state.lock().unwrap();
        if matches!(st.tag, EngineStateTag::Running { .. }) {
            st.tag = EngineStateTag::Stopped;
        }
        st.accumulated = 0;
        st.session = 0;
        Ok(Self::snapshot(&st))
    }

    async fn save_state(&self) -> Result<EngineSnapshot, EngineError> {
        self.enter("save_state").await?;
        Ok(Self::snapshot(&self.state.lock().unwrap()))
    }
}

/// Сервер записей в памяти. Тексты ошибок как у настоящего API.
pub struct FakeRemote {
    entries: Mutex<Vec<RemoteEntry>>,
    offline: AtomicBool,
    fail_create: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
    next_id: AtomicU64,
    uploaded: Mutex<Vec<UrlActivity>>,
    calls: Mutex<Vec<String>>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::with_entries(Vec::new())
    }

    pub fn with_entries(entries: Vec<RemoteEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            offline: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            create_delay: Mutex::new(None),
            next_id: AtomicU64::new(1),
            uploaded: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Медленный сервер: create отвечает после задержки
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn entries(&self) -> Vec<RemoteEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn active_for(&self, user_id: &str) -> Vec<RemoteEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.user_id == user_id && e.status.is_active())
            .collect()
    }

    pub fn status_of(&self, entry_id: &str) -> Option<EntryStatus> {
        self.entries()
            .into_iter()
            .find(|e| e.id == entry_id)
            .map(|e| e.status)
    }

    pub fn set_status(&self, entry_id: &str, status: EntryStatus) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(e) = entries.iter_mut().find(|e| e.id == entry_id) {
            e.status = status;
        }
    }

    pub fn push(&self, entry: RemoteEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn uploaded(&self) -> Vec<UrlActivity> {
        self.uploaded.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == name).count()
    }

    fn enter(&self, name: &str) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(name.to_string());
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("connection refused".into()));
        }
        Ok(())
    }

    fn bad_request(message: &str) -> RemoteError {
        RemoteError::Http {
            status: 400,
            message: format!(r#"{{"message":"{}"}}"#, message),
        }
    }

    fn update(
        &self,
        entry_id: &str,
        f: impl FnOnce(&mut RemoteEntry) -> Result<(), RemoteError>,
    ) -> Result<(), RemoteError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.id == entry_id) {
            Some(entry) => f(entry),
            None => Err(RemoteError::Http {
                status: 404,
                message: r#"{"message":"Time entry not found"}"#.into(),
            }),
        }
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn list_active_entries(
        &self,
        _creds: &Credentials,
    ) -> Result<Vec<RemoteEntry>, RemoteError> {
        self.enter("list")?;
        Ok(self
            .entries()
            .into_iter()
            .filter(|e| e.status.is_active())
            .collect())
    }

    async fn create_entry(
        &self,
        creds: &Credentials,
        request: &CreateEntryRequest,
        _idempotency_key: Option<&str>,
    ) -> Result<RemoteEntry, RemoteError> {
        self.enter("create")?;
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RemoteError::Http {
                status: 500,
                message: "Internal Server Error".into(),
            });
        }
        let mut entries = self.entries.lock().unwrap();
        if entries
            .iter()
            .any(|e| e.user_id == creds.user_id && e.status.is_active())
        {
            return Err(Self::bad_request("User already has an active time entry"));
        }
        let entry = RemoteEntry {
            id: format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            user_id: creds.user_id.clone(),
            project_id: request.project_id.clone(),
            start_time: request.start_time,
            status: EntryStatus::Running,
            project: None,
        };
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn pause_entry(
        &self,
        _creds: &Credentials,
        entry_id: &str,
        _idempotency_key: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.enter("pause")?;
        self.update(entry_id, |e| match e.status {
            EntryStatus::Running => {
                e.status = EntryStatus::Paused;
                Ok(())
            }
            _ => Err(Self::bad_request("Only running entries can be paused")),
        })
    }

    async fn resume_entry(
        &self,
        _creds: &Credentials,
        entry_id: &str,
        _idempotency_key: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.enter("resume")?;
        self.update(entry_id, |e| match e.status {
            EntryStatus::Paused => {
                e.status = EntryStatus::Running;
                Ok(())
            }
            _ => Err(Self::bad_request("Only paused entries can be resumed")),
        })
    }

    async fn stop_entry(
        &self,
        _creds: &Credentials,
        entry_id: &str,
        _idempotency_key: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.enter("stop")?;
        self.update(entry_id, |e| match e.status {
            EntryStatus::Stopped => Err(Self::bad_request("Time entry is already stopped")),
            _ => {
                e.status = EntryStatus::Stopped;
                Ok(())
            }
        })
    }

    async fn heartbeat(
        &self,
        _creds: &Credentials,
        _entry_id: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.enter("heartbeat")
    }

    async fn upload_activities(
        &self,
        _creds: &Credentials,
        activities: &[UrlActivity],
        _idempotency_key: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.enter("upload")?;
        validate_activity_batch(activities.len(), 100)?;
        self.uploaded.lock().unwrap().extend_from_slice(activities);
        Ok(())
    }
}
