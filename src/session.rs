use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::auditor::{AuditOutcome, InvariantAuditor};
use crate::auth::{AuthManager, Credentials};
use crate::config::ReconcileConfig;
use crate::context::SessionContext;
use crate::database::{Database, META_CURRENT_USER, META_LAST_SYNC_AT};
use crate::engine::TimerEngineApi;
use crate::error::ReconcileError;
use crate::ipc::{events, IdleDecision, SessionEvent};
use crate::models::{FailedTaskInfo, OperationPayload, QueueStats, UrlActivity};
use crate::monitor::IdleMonitor;
use crate::network::{check_online_status, extract_domain};
use crate::reconciler::RemoteReconciler;
use crate::remote::{HttpRemote, RemoteApi};
use crate::sequencer::{OperationSequencer, TransitionOutcome};
use crate::sync::FlushReport;

#[derive(Debug, serde::Serialize)]
pub struct SyncStatus {
    pub pending_count: i32,
    pub failed_count: i32,
    pub is_online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<i64>,
}

/// Сессия трекинга: владеет контекстом, компонентами и фоновыми циклами.
pub struct TrackingSession {
    ctx: Arc<SessionContext>,
    sequencer: OperationSequencer,
    idle: Arc<IdleMonitor>,
    reconciler: Arc<RemoteReconciler>,
    auditor: Arc<InvariantAuditor>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TrackingSession {
    pub fn new(
        config: ReconcileConfig,
        engine: Arc<dyn TimerEngineApi>,
        remote: Arc<dyn RemoteApi>,
        db: Arc<Database>,
        auth: Arc<AuthManager>,
    ) -> Result<Self, ReconcileError> {
        config.validate()?;
        let ctx = Arc::new(SessionContext::new(config, engine, remote, db, auth));
        let sequencer = OperationSequencer::new(ctx.clone());
        Ok(Self {
            idle: Arc::new(IdleMonitor::new(ctx.clone(), sequencer.clone())),
            reconciler: Arc::new(RemoteReconciler::new(ctx.clone())),
            auditor: Arc::new(InvariantAuditor::new(ctx.clone())),
            sequencer,
            ctx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Production wiring: HTTP remote and the on-disk queue at `db_path`
    pub fn with_http(
        config: ReconcileConfig,
        engine: Arc<dyn TimerEngineApi>,
        db_path: &str,
    ) -> Result<Self, ReconcileError> {
        let db = Arc::new(Database::new(db_path)?);
        let auth = Arc::new(AuthManager::new(config.api_base_url.clone()));
        let remote = Arc::new(HttpRemote::new(&config, auth.clone()));
        Self::new(config, engine, remote, db, auth)
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn sequencer(&self) -> &OperationSequencer {
        &self.sequencer
    }

    pub fn idle_monitor(&self) -> &IdleMonitor {
        &self.idle
    }

    pub fn reconciler(&self) -> &RemoteReconciler {
        &self.reconciler
    }

    pub fn auditor(&self) -> &InvariantAuditor {
        &self.auditor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    /// Вход пользователя. Смена пользователя очищает локальные данные прошлого.
    pub async fn login(&self, credentials: Credentials) -> Result<(), ReconcileError> {
        let ctx = &self.ctx;
        let previous = ctx.db.get_app_meta(META_CURRENT_USER)?;
        if let Some(prev) = previous.filter(|p| !p.is_empty() && *p != credentials.user_id) {
            warn!(
                "[AUTH] User switch {} -> {}: clearing local queue and state",
                prev, credentials.user_id
            );
            ctx.db.clear_user_data()?;
            ctx.cache.clear();
            ctx.invalidate_entry_load().await;
        }
        ctx.db.set_app_meta(META_CURRENT_USER, &credentials.user_id)?;
        ctx.auth.set_credentials(Some(credentials)).await;
        ctx.revive();

        let snapshot = ctx
            .cache
            .refresh(ctx.engine.as_ref())
            .await
            .map_err(|e| ctx.report(e.into()))?;
        if snapshot.is_tracking() {
            ctx.reload_current_entry().await;
        }
        ctx.publish_state();
        Ok(())
    }

    /// Выход: фоновые циклы и кэш сбрасываются, очередь остаётся на диске
    pub async fn logout(&self) {
        self.stop_background();
        self.ctx.auth.clear().await;
        self.ctx.cache.clear();
        self.ctx.invalidate_entry_load().await;
        self.ctx.publish_state();
        info!("[AUTH] Logged out");
    }

    pub async fn start(
        &self,
        project_id: &str,
        description: Option<String>,
    ) -> Result<TransitionOutcome, ReconcileError> {
        self.sequencer.start(project_id, description).await
    }

    pub async fn pause(&self) -> Result<TransitionOutcome, ReconcileError> {
        self.sequencer.pause(false).await
    }

    pub async fn resume(&self) -> Result<TransitionOutcome, ReconcileError> {
        self.sequencer.resume(false).await
    }

    pub async fn stop(&self) -> Result<TransitionOutcome, ReconcileError> {
        self.sequencer.stop().await
    }

    pub async fn reset_day(&self) -> Result<TransitionOutcome, ReconcileError> {
        self.sequencer.reset_day().await
    }

    pub fn record_activity(&self) {
        self.idle.record_activity();
    }

    pub fn set_idle_threshold(&self, secs: u64) -> Result<(), ReconcileError> {
        self.idle.set_threshold(secs)
    }

    /// Inbound events from the idle window
    pub async fn handle_ui_event(&self, name: &str) -> Result<(), ReconcileError> {
        if name == events::REQUEST_IDLE_STATE {
            self.idle.request_state();
            return Ok(());
        }
        match IdleDecision::from_event(name) {
            Some(decision) => {
                self.idle.handle_decision(decision).await?;
                Ok(())
            }
            None => {
                debug!("[IPC] Ignoring unknown event {}", name);
                Ok(())
            }
        }
    }

    /// Поставить URL-активность в очередь пакетами не больше лимита
    pub async fn record_url_activities(
        &self,
        activities: Vec<UrlActivity>,
    ) -> Result<Vec<i64>, ReconcileError> {
        if activities.is_empty() {
            return Ok(Vec::new());
        }
        let ctx = &self.ctx;
        let entry_id = ctx.cache.snapshot().current_entry_id().map(str::to_string);
        let activities: Vec<UrlActivity> = activities
            .into_iter()
            .map(|mut a| {
                if a.domain.is_empty() {
                    a.domain = extract_domain(&a.url).unwrap_or_default();
                }
                if a.time_entry_id.is_none() {
                    a.time_entry_id = entry_id.clone();
                }
                a
            })
            .collect();

        let creds = ctx.auth.credentials().await;
        let mut ids = Vec::new();
        for chunk in activities.chunks(ctx.config.max_activity_batch) {
            let id = ctx.enqueue(
                &OperationPayload::ActivityBatch {
                    activities: chunk.to_vec(),
                },
                creds.as_ref(),
            )?;
            ctx.spawn_delivery(id);
            ids.push(id);
        }
        debug!(
            "[SYNC] Queued {} activities in {} batches",
            activities.len(),
            ids.len()
        );
        Ok(ids)
    }

    pub async fn flush_now(&self) -> Result<FlushReport, ReconcileError> {
        let online = check_online_status(&self.ctx.config.online_probe_urls).await;
        self.ctx.flush_queue(online).await
    }

    /// Сеть вернулась: сразу агрессивный flush
    pub async fn on_reconnect(&self) -> Result<FlushReport, ReconcileError> {
        info!("[NET] Connectivity restored, flushing queue");
        self.ctx.flush_queue(true).await
    }

    pub async fn on_credentials_refreshed(
        &self,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Result<FlushReport, ReconcileError> {
        self.ctx.auth.update_tokens(access_token, refresh_token).await;
        self.ctx.flush_queue(true).await
    }

    pub fn queue_stats(&self) -> Result<QueueStats, ReconcileError> {
        Ok(self.ctx.db.get_queue_stats()?)
    }

    pub async fn sync_status(&self) -> Result<SyncStatus, ReconcileError> {
        let db = &self.ctx.db;
        Ok(SyncStatus {
            pending_count: db.get_pending_count()?,
            failed_count: db.get_failed_count()?,
            is_online: check_online_status(&self.ctx.config.online_probe_urls).await,
            last_sync_at: db
                .get_app_meta(META_LAST_SYNC_AT)?
                .and_then(|s| s.parse().ok()),
        })
    }

    pub fn failed_tasks(&self, limit: i32) -> Result<Vec<FailedTaskInfo>, ReconcileError> {
        Ok(self.ctx.db.get_failed_tasks(limit)?)
    }

    /// Вернуть failed задачи в pending (ручной retry из UI)
    pub fn retry_failed(&self, limit: i32) -> Result<i32, ReconcileError> {
        let count = self.ctx.db.reset_failed_tasks(limit)?;
        info!("[SYNC] Reset {} failed tasks to pending", count);
        Ok(count)
    }

    pub fn clear_queue(&self) -> Result<(), ReconcileError> {
        Ok(self.ctx.db.clear_sync_queue()?)
    }

    fn spawn_loop<F, Fut>(&self, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // первый tick срабатывает сразу
            interval.tick().await;
            loop {
                interval.tick().await;
                if ctx.is_torn_down() {
                    debug!("[SESSION] {} loop stopped", name);
                    break;
                }
                tick().await;
            }
        })
    }

    /// Фоновые циклы: reconcile, idle, audit, flush, save_state, heartbeat
    pub fn start_background(&self) {
        self.stop_background();
        let config = &self.ctx.config;
        let mut handles = Vec::with_capacity(6);

        let reconciler = self.reconciler.clone();
        handles.push(self.spawn_loop(
            "reconcile",
            Duration::from_secs(config.reconcile_interval_secs),
            move || {
                let reconciler = reconciler.clone();
                async move {
                    if let Err(e) = reconciler.reconcile_once().await {
                        warn!("[RECONCILE] Cycle failed: {}", e);
                    }
                }
            },
        ));

        let idle = self.idle.clone();
        handles.push(self.spawn_loop(
            "idle",
            Duration::from_secs(config.idle_check_interval_secs),
            move || {
                let idle = idle.clone();
                async move {
                    if let Err(e) = idle.tick().await {
                        warn!("[IDLE] Check failed: {}", e);
                    }
                }
            },
        ));

        let auditor = self.auditor.clone();
        handles.push(self.spawn_loop(
            "audit",
            Duration::from_secs(config.audit_interval_secs),
            move || {
                let auditor = auditor.clone();
                async move {
                    if let AuditOutcome::ForcedUnlock { holder, held_secs } =
                        auditor.audit_once().await
                    {
                        warn!("[AUDIT] Recovered lock from '{}' after {}s", holder, held_secs);
                    }
                }
            },
        ));

        let ctx = self.ctx.clone();
        handles.push(self.spawn_loop(
            "flush",
            Duration::from_secs(config.flush_interval_secs),
            move || {
                let ctx = ctx.clone();
                async move {
                    // jitter: не бить сервер одновременно со всех клиентов
                    let jitter_ms = rand::random::<u64>() % 2000;
                    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                    let online = check_online_status(&ctx.config.online_probe_urls).await;
                    match ctx.flush_queue(online).await {
                        Ok(report) if report.synced > 0 || report.failed > 0 => info!(
                            "[SYNC] Background flush: synced={} failed={}",
                            report.synced, report.failed
                        ),
                        Ok(_) => debug!("[SYNC] Background flush: nothing to do"),
                        Err(e) => error!("[SYNC] Background flush error: {}", e),
                    }
                }
            },
        ));

        let ctx = self.ctx.clone();
        handles.push(self.spawn_loop(
            "save_state",
            Duration::from_secs(config.save_state_interval_secs),
            move || {
                let ctx = ctx.clone();
                async move {
                    if !ctx.cache.snapshot().is_tracking {
                        return;
                    }
                    match ctx.engine.save_state().await {
                        Ok(_) => debug!("[TIMER] State saved periodically"),
                        Err(e) => warn!("[TIMER] Failed to save state periodically: {}", e),
                    }
                }
            },
        ));

        let ctx = self.ctx.clone();
        handles.push(self.spawn_loop(
            "heartbeat",
            Duration::from_secs(config.heartbeat_interval_secs),
            move || {
                let ctx = ctx.clone();
                async move {
                    let cache = ctx.cache.snapshot();
                    if !cache.is_tracking || cache.is_paused {
                        return;
                    }
                    let Some(creds) = ctx.auth.credentials().await else {
                        return;
                    };
                    if let Err(e) = ctx.remote.heartbeat(&creds, cache.current_entry_id()).await {
                        debug!("[SYNC] Heartbeat failed: {}", e);
                    }
                }
            },
        ));

        info!("[SESSION] Started {} background loops", handles.len());
        *self.tasks.lock().unwrap_or_else(|e| e.into_inner()) = handles;
    }

    pub fn stop_background(&self) {
        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            handle.abort();
        }
    }

    /// Завершение: in-flight колбэки становятся no-op, состояние движка сохраняется
    pub async fn shutdown(&self) {
        self.ctx.tear_down();
        self.stop_background();
        match self.ctx.engine.save_state().await {
            Ok(_) => info!("[SHUTDOWN] Timer state saved successfully on exit"),
            Err(e) => error!("[SHUTDOWN] Failed to save timer state on exit: {}", e),
        }
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        self.ctx.tear_down();
        self.stop_background();
    }
}
