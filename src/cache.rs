use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::engine::{EngineError, EngineSnapshot, TimerEngineApi};
use crate::models::RemoteEntry;

/// Момент времени: wall clock для UI/API + монотонный для расчётов
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stamp {
    /// Unix ms
    pub wall_ms: i64,
    pub at: Instant,
}

impl Stamp {
    pub fn now() -> Self {
        Self {
            wall_ms: chrono::Utc::now().timestamp_millis(),
            at: Instant::now(),
        }
    }

    /// Stamp `ago` in the past (both clocks shifted)
    pub fn ago(ago: Duration) -> Self {
        let now = Instant::now();
        Self {
            wall_ms: chrono::Utc::now().timestamp_millis() - ago.as_millis() as i64,
            at: now.checked_sub(ago).unwrap_or(now),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.at.elapsed()
    }
}

/// Локальная проекция состояния движка для UI. Никогда не источник истины.
#[derive(Debug, Clone, Default)]
pub struct CacheProjection {
    pub is_tracking: bool,
    pub is_paused: bool,
    pub current_entry: Option<RemoteEntry>,
    /// Set only by an idle-triggered pause; cleared only by the user's idle decision
    pub idle_pause_start: Option<Stamp>,
    pub last_activity: Option<Stamp>,
    pub last_resume_time: Option<Instant>,
    pub local_timer_start_time: Option<Instant>,
    pub last_pause_time: Option<Instant>,
    pub last_stop_time: Option<Instant>,
}

impl CacheProjection {
    pub fn is_idle_paused(&self) -> bool {
        self.idle_pause_start.is_some()
    }

    pub fn current_entry_id(&self) -> Option<&str> {
        self.current_entry.as_ref().map(|e| e.id.as_str())
    }

    pub fn project_label(&self) -> Option<String> {
        self.current_entry.as_ref().and_then(|e| e.project_label())
    }

    /// Прошло ли меньше `window` с момента `since`
    pub fn within(since: Option<Instant>, window: Duration) -> bool {
        since.map(|t| t.elapsed() < window).unwrap_or(false)
    }
}

/// Сериализуемый вид кэша для UI событий
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheView {
    pub is_tracking: bool,
    pub is_paused: bool,
    pub current_entry_id: Option<String>,
    pub project_label: Option<String>,
    pub idle_pause_start_time: Option<i64>,
    pub last_activity_time: Option<i64>,
}

/// Флаги, которые кэш обязан иметь для данного снимка движка
pub fn expected_flags(snapshot: &EngineSnapshot) -> (bool, bool) {
    (snapshot.is_tracking(), snapshot.is_paused())
}

pub struct TimerStateCache {
    inner: Mutex<CacheProjection>,
}

impl Default for TimerStateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerStateCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheProjection::default()),
        }
    }

    /// Poisoned mutex: проекция восстанавливается аудитором, берём данные как есть
    fn lock(&self) -> MutexGuard<'_, CacheProjection> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Пересчитать is_tracking / is_paused из снимка движка
    pub fn apply_engine(&self, snapshot: &EngineSnapshot) {
        let (tracking, paused) = expected_flags(snapshot);
        let mut cache = self.lock();
        cache.is_tracking = tracking;
        cache.is_paused = paused;
        if !tracking {
            cache.idle_pause_start = None;
        }
    }

    /// Re-read the engine and recompute flags. Engine state is never mutated.
    pub async fn refresh(
        &self,
        engine: &dyn TimerEngineApi,
    ) -> Result<EngineSnapshot, EngineError> {
        let snapshot = engine.get_state().await?;
        self.apply_engine(&snapshot);
        Ok(snapshot)
    }

    pub fn is_consistent_with(&self, snapshot: &EngineSnapshot) -> bool {
        let cache = self.lock();
        (cache.is_tracking, cache.is_paused) == expected_flags(snapshot)
    }

    pub fn snapshot(&self) -> CacheProjection {
        self.lock().clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut CacheProjection) -> R) -> R {
        let mut cache = self.lock();
        f(&mut cache)
    }

    pub fn record_activity(&self) {
        self.lock().last_activity = Some(Stamp::now());
    }

    pub fn clear(&self) {
        *self.lock() = CacheProjection::default();
    }

    pub fn view(&self) -> CacheView {
        let cache = self.lock();
        CacheView {
            is_tracking: cache.is_tracking,
            is_paused: cache.is_paused,
            current_entry_id: cache.current_entry_id().map(str::to_string),
            project_label: cache.project_label(),
            idle_pause_start_time: cache.idle_pause_start.map(|s| s.wall_ms),
            last_activity_time: cache.last_activity.map(|s| s.wall_ms),
        }
    }
}
