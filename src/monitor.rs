use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::MIN_IDLE_THRESHOLD_SECS;
use crate::context::SessionContext;
use crate::error::ReconcileError;
use crate::ipc::{IdleDecision, SessionEvent};
use crate::models::IdlePromptState;
use crate::sequencer::{OperationSequencer, TransitionOutcome};

/// Результат одной проверки простоя
#[derive(Debug, Clone, PartialEq)]
pub enum IdleTick {
    /// Below threshold; carries the current idle duration
    Active(Duration),
    /// Idle pause applied, prompt state published
    Triggered(IdlePromptState),
    AlreadyPaused,
    NotTracking,
    /// Another idle check or transition in flight
    Busy,
    Disabled,
}

/// Детектор простоя: по порогу ставит idle-паузу и ведёт окно решения пользователя.
pub struct IdleMonitor {
    ctx: Arc<SessionContext>,
    sequencer: OperationSequencer,
    pub is_monitoring: AtomicBool,
    threshold_secs: AtomicU64,
}

impl IdleMonitor {
    pub fn new(ctx: Arc<SessionContext>, sequencer: OperationSequencer) -> Self {
        // сохранённый порог пользователя важнее конфига
        let threshold = match ctx.db.get_idle_threshold_secs() {
            Ok(Some(secs)) if secs >= MIN_IDLE_THRESHOLD_SECS => secs,
            Ok(_) => ctx.config.idle_threshold_secs,
            Err(e) => {
                warn!("[IDLE] Failed to read stored threshold: {}", e);
                ctx.config.idle_threshold_secs
            }
        };
        Self {
            ctx,
            sequencer,
            is_monitoring: AtomicBool::new(true),
            threshold_secs: AtomicU64::new(threshold),
        }
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_secs.load(Ordering::Relaxed))
    }

    pub fn set_threshold(&self, secs: u64) -> Result<(), ReconcileError> {
        if secs < MIN_IDLE_THRESHOLD_SECS {
            return Err(ReconcileError::Config(format!(
                "idle threshold must be at least {}s, got {}s",
                MIN_IDLE_THRESHOLD_SECS, secs
            )));
        }
        self.ctx
            .db
            .set_idle_threshold_secs(secs)
            .map_err(|e| self.ctx.report(e.into()))?;
        self.threshold_secs.store(secs, Ordering::Relaxed);
        info!("[IDLE] Threshold set to {}s", secs);
        Ok(())
    }

    /// Input observed. An idle pause keeps its pre-idle timestamp for the prompt.
    pub fn record_activity(&self) {
        self.ctx.cache.update(|c| {
            if c.idle_pause_start.is_none() {
                c.last_activity = Some(crate::cache::Stamp::now());
            }
        });
    }

    pub fn idle_for(&self) -> Duration {
        self.ctx
            .cache
            .snapshot()
            .last_activity
            .map(|s| s.elapsed())
            .unwrap_or_default()
    }

    pub async fn tick(&self) -> Result<IdleTick, ReconcileError> {
        if !self.is_monitoring.load(Ordering::Relaxed) || self.ctx.is_torn_down() {
            return Ok(IdleTick::Disabled);
        }
        let cache = self.ctx.cache.snapshot();
        if cache.is_idle_paused() {
            return Ok(IdleTick::AlreadyPaused);
        }
        if !cache.is_tracking {
            // кэш мог отстать: решает движок
            let engine = match self.ctx.engine.get_state().await {
                Ok(engine) => engine,
                Err(e) => {
                    debug!("[IDLE] Engine state unavailable: {}", e);
                    return Ok(IdleTick::NotTracking);
                }
            };
            if engine.is_stopped() {
                return Ok(IdleTick::NotTracking);
            }
            self.ctx.cache.apply_engine(&engine);
            self.ctx.publish_state();
            if !engine.is_running() {
                return Ok(IdleTick::AlreadyPaused);
            }
            debug!("[IDLE] Cache was behind a running engine, flags refreshed");
        }
        let idle_for = self.idle_for();
        if idle_for < self.threshold() {
            return Ok(IdleTick::Active(idle_for));
        }

        // один idle-переход за раз, независимо от operation lock
        let Ok(_idle) = self.ctx.idle_guard.try_lock() else {
            return Ok(IdleTick::Busy);
        };

        let engine = self.ctx.engine_state().await?;
        if !engine.is_running() {
            // кэш отстал: поправляем молча, пауза не нужна
            self.ctx.cache.apply_engine(&engine);
            self.ctx.publish_state();
            return Ok(if engine.is_paused() {
                IdleTick::AlreadyPaused
            } else {
                IdleTick::NotTracking
            });
        }

        info!("[IDLE] No activity for {}s, pausing", idle_for.as_secs());
        match self.sequencer.pause(true).await? {
            TransitionOutcome::Applied { .. } => {
                let state = self.prompt_state(false);
                self.ctx
                    .events
                    .emit(SessionEvent::IdleStateUpdate(state.clone()));
                Ok(IdleTick::Triggered(state))
            }
            TransitionOutcome::AlreadyInState(_) => Ok(IdleTick::AlreadyPaused),
            TransitionOutcome::Busy => Ok(IdleTick::Busy),
            TransitionOutcome::Skipped(reason) => {
                debug!("[IDLE] Pause skipped: {:?}", reason);
                Ok(IdleTick::NotTracking)
            }
        }
    }

    fn prompt_state(&self, is_loading: bool) -> IdlePromptState {
        let cache = self.ctx.cache.snapshot();
        IdlePromptState {
            pause_start_time: cache.idle_pause_start.map(|s| s.wall_ms),
            last_activity_time: cache.last_activity.map(|s| s.wall_ms),
            project_label: cache.project_label(),
            is_loading,
        }
    }

    /// Idle window asked for the current state (it may have opened late)
    pub fn request_state(&self) -> IdlePromptState {
        let state = self.prompt_state(false);
        self.ctx
            .events
            .emit(SessionEvent::IdleStateUpdate(state.clone()));
        state
    }

    /// Решение пользователя в окне простоя
    pub async fn handle_decision(
        &self,
        decision: IdleDecision,
    ) -> Result<TransitionOutcome, ReconcileError> {
        self.ctx
            .events
            .emit(SessionEvent::IdleStateUpdate(self.prompt_state(true)));

        let result = match decision {
            IdleDecision::Resume => self.sequencer.resume(true).await,
            IdleDecision::Stop => self.sequencer.stop().await,
        };

        match &result {
            Ok(TransitionOutcome::Applied { .. }) | Ok(TransitionOutcome::AlreadyInState(_)) => {
                info!("[IDLE] User decision {:?} applied", decision);
                // AlreadyInState после stop/resume: флаг idle тоже больше не нужен
                self.ctx.cache.update(|c| c.idle_pause_start = None);
                self.ctx.events.emit(SessionEvent::IdlePromptClosed);
            }
            _ => {
                self.ctx
                    .events
                    .emit(SessionEvent::IdleStateUpdate(self.prompt_state(false)));
            }
        }
        result
    }
}
