//! Centralized event names and the outbound session event bus.
//! Prevents typos and keeps the UI contract in one place.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cache::CacheView;
use crate::models::IdlePromptState;

/// Event names (engine emit ↔ UI listen)
pub mod events {
    pub const TIMER_STATE_UPDATE: &str = "timer-state-update";
    pub const IDLE_STATE_UPDATE: &str = "idle-state-update";
    pub const IDLE_PROMPT_CLOSED: &str = "idle-prompt-closed";
    pub const NOTIFICATION: &str = "notification";
    pub const QUEUE_FAILED: &str = "sync-queue-failed";
    /// Inbound: idle window asks for the current idle state
    pub const REQUEST_IDLE_STATE: &str = "request-idle-state-for-idle-window";
    /// Inbound: idle window decisions
    pub const RESUME_TRACKING: &str = "resume-tracking";
    pub const STOP_TRACKING: &str = "stop-tracking";
}

/// Исходящие события сессии
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum SessionEvent {
    TimerStateUpdate(CacheView),
    IdleStateUpdate(IdlePromptState),
    IdlePromptClosed,
    /// User-visible notification (only unrecoverable failures)
    Notification { title: String, body: String },
    QueueFailed { count: usize },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::TimerStateUpdate(_) => events::TIMER_STATE_UPDATE,
            SessionEvent::IdleStateUpdate(_) => events::IDLE_STATE_UPDATE,
            SessionEvent::IdlePromptClosed => events::IDLE_PROMPT_CLOSED,
            SessionEvent::Notification { .. } => events::NOTIFICATION,
            SessionEvent::QueueFailed { .. } => events::QUEUE_FAILED,
        }
    }
}

/// Idle window decision (inbound)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDecision {
    Resume,
    Stop,
}

impl IdleDecision {
    pub fn from_event(name: &str) -> Option<Self> {
        match name {
            events::RESUME_TRACKING => Some(IdleDecision::Resume),
            events::STOP_TRACKING => Some(IdleDecision::Stop),
            _ => None,
        }
    }
}

/// Broadcast шина событий; отсутствие подписчиков не ошибка
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            debug!("[IPC] No listeners for {}", name);
        }
    }
}
