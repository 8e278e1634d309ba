use crate::context::SessionContext;
use crate::database::*;
use crate::engine::*;
use crate::models::PendingKinds;
use crate::sync::*;
use crate::testing::*;
use crate::*;
use chrono::Utc;
use rusqlite::params;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        ctx: Arc<SessionContext>,
        seq: OperationSequencer,
        engine: Arc<FakeEngine>,
        remote: Arc<FakeRemote>,
        _dir: tempfile::TempDir,
    }

    async fn setup(engine: FakeEngine, remote: FakeRemote) -> Harness {
        let engine = Arc::new(engine);
        let remote = Arc::new(remote);
        let (ctx, dir) = session_context(engine.clone(), remote.clone());
        login(&ctx, "u1").await;
        Harness {
            seq: OperationSequencer::new(ctx.clone()),
            ctx,
            engine,
            remote,
            _dir: dir,
        }
    }

    fn start_request(user_id: &str) -> OperationPayload {
        OperationPayload::Start {
            request: CreateEntryRequest {
                project_id: "p1".to_string(),
                user_id: user_id.to_string(),
                description: None,
                start_time: Utc::now().timestamp_millis(),
            },
        }
    }

    /// Кэш "идёт трекинг, последняя активность `idle` назад"
    fn mark_tracking(ctx: &SessionContext, idle: Duration) {
        ctx.cache.update(|c| {
            c.is_tracking = true;
            c.is_paused = false;
            c.last_activity = Some(Stamp::ago(idle));
        });
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    mod sequencer_tests {
        use super::*;

        #[tokio::test]
        async fn test_start_creates_remote_entry() {
            let h = setup(FakeEngine::new(), FakeRemote::new()).await;

            let outcome = h.seq.start("p1", None).await.unwrap().wait_delivery().await;

            assert!(outcome.is_applied());
            assert!(outcome.snapshot().unwrap().is_running());
            assert_eq!(h.remote.active_for("u1").len(), 1);
            assert_eq!(h.ctx.cache.snapshot().current_entry_id(), Some("srv-1"));
            assert_eq!(h.ctx.db.last_entry_id().unwrap().as_deref(), Some("srv-1"));
            assert_eq!(h.ctx.db.get_pending_count().unwrap(), 0);
        }

        #[tokio::test]
        async fn test_transitions_reach_server() {
            let h = setup(FakeEngine::new(), FakeRemote::new()).await;
            h.seq.start("p1", None).await.unwrap().wait_delivery().await;

            h.seq.pause(false).await.unwrap().wait_delivery().await;
            assert_eq!(h.remote.status_of("srv-1"), Some(EntryStatus::Paused));
            assert!(h.ctx.cache.snapshot().is_paused);

            h.seq.resume(false).await.unwrap().wait_delivery().await;
            assert_eq!(h.remote.status_of("srv-1"), Some(EntryStatus::Running));

            h.seq.stop().await.unwrap().wait_delivery().await;
            assert_eq!(h.remote.status_of("srv-1"), Some(EntryStatus::Stopped));
            let cache = h.ctx.cache.snapshot();
            assert!(!cache.is_tracking);
            assert!(cache.current_entry.is_none());
            assert_eq!(h.ctx.db.last_entry_id().unwrap(), None);
        }

        #[tokio::test]
        async fn test_repeated_transitions_are_noops() {
            let h = setup(FakeEngine::new(), FakeRemote::new()).await;
            h.seq.start("p1", None).await.unwrap().wait_delivery().await;
            assert!(matches!(
                h.seq.start("p1", None).await.unwrap(),
                TransitionOutcome::AlreadyInState(_)
            ));

            h.seq.pause(false).await.unwrap().wait_delivery().await;
            assert!(matches!(
                h.seq.pause(false).await.unwrap(),
                TransitionOutcome::AlreadyInState(_)
            ));
            assert_eq!(h.engine.count("pause"), 1);

            h.seq.resume(false).await.unwrap().wait_delivery().await;
            assert!(matches!(
                h.seq.resume(false).await.unwrap(),
                TransitionOutcome::AlreadyInState(_)
            ));
            assert_eq!(h.engine.count("resume"), 1);

            h.seq.stop().await.unwrap().wait_delivery().await;
            assert!(matches!(
                h.seq.stop().await.unwrap(),
                TransitionOutcome::AlreadyInState(_)
            ));
            assert_eq!(h.engine.count("stop"), 1);
            assert_eq!(h.remote.count("stop"), 1);
        }

        #[tokio::test]
        async fn test_concurrent_starts_single_transition() {
            let h = setup(FakeEngine::new(), FakeRemote::new()).await;
            h.engine.set_delay(Duration::from_millis(50));

            let (a, b) = tokio::join!(h.seq.start("p1", None), h.seq.start("p1", None));
            let outcomes = [a.unwrap(), b.unwrap()];

            assert_eq!(outcomes.iter().filter(|o| o.is_applied()).count(), 1);
            assert_eq!(
                outcomes
                    .iter()
                    .filter(|o| matches!(o, TransitionOutcome::Busy))
                    .count(),
                1
            );
            assert_eq!(h.engine.count("start"), 1);

            for outcome in outcomes {
                outcome.wait_delivery().await;
            }
            assert!(h.remote.count("create") <= 1);
            assert_eq!(h.remote.active_for("u1").len(), 1);
        }

        #[tokio::test]
        async fn test_start_adopts_paused_server_entry() {
            let remote = FakeRemote::with_entries(vec![entry("e1", "u1", 100, EntryStatus::Paused)]);
            let h = setup(FakeEngine::new(), remote).await;

            h.seq.start("p1", None).await.unwrap().wait_delivery().await;

            assert_eq!(h.remote.count("create"), 0);
            assert_eq!(h.remote.status_of("e1"), Some(EntryStatus::Running));
            assert_eq!(h.ctx.cache.snapshot().current_entry_id(), Some("e1"));
        }

        #[tokio::test]
        async fn test_start_stops_duplicate_entries() {
            let remote = FakeRemote::with_entries(vec![
                entry("e-old", "u1", 100, EntryStatus::Running),
                entry("e-new", "u1", 200, EntryStatus::Running),
            ]);
            let h = setup(FakeEngine::new(), remote).await;

            h.seq.start("p1", None).await.unwrap().wait_delivery().await;

            assert_eq!(h.remote.status_of("e-old"), Some(EntryStatus::Stopped));
            assert_eq!(h.remote.status_of("e-new"), Some(EntryStatus::Running));
            assert_eq!(h.ctx.cache.snapshot().current_entry_id(), Some("e-new"));
        }

        #[tokio::test]
        async fn test_failed_create_keeps_engine_running() {
            let remote = FakeRemote::new();
            remote.set_fail_create(true);
            let h = setup(FakeEngine::new(), remote).await;

            let outcome = h.seq.start("p1", None).await.unwrap().wait_delivery().await;
            let TransitionOutcome::Applied {
                queue_id: Some(queue_id),
                ..
            } = outcome
            else {
                panic!("start should be applied");
            };

            // движок не откатывается из-за сервера
            assert!(h.engine.get_state().await.unwrap().is_running());
            let task = h.ctx.db.get_task(queue_id).unwrap().unwrap();
            assert_eq!(task.status, QueueStatus::Pending);
            assert_eq!(task.retry_count, 1);
        }

        #[tokio::test]
        async fn test_engine_unavailable_is_user_visible() {
            let h = setup(FakeEngine::new(), FakeRemote::new()).await;
            let mut rx = h.ctx.events.subscribe();
            h.engine.set_unavailable(true);

            let result = h.seq.start("p1", None).await;

            assert!(matches!(result, Err(ReconcileError::EngineUnavailable(_))));
            assert!(drain(&mut rx).contains(&events::NOTIFICATION));
            assert_eq!(h.ctx.db.get_pending_count().unwrap(), 0);
        }

        #[tokio::test]
        async fn test_idle_pause_excludes_idle_time() {
            let h = setup(FakeEngine::running(120), FakeRemote::new()).await;
            mark_tracking(&h.ctx, Duration::from_secs(30));

            let outcome = h.seq.pause(true).await.unwrap().wait_delivery().await;

            assert!(outcome.is_applied());
            assert_eq!(h.engine.accumulated(), 90);
            assert!(h.ctx.cache.snapshot().is_idle_paused());
        }

        #[tokio::test]
        async fn test_resume_refused_during_idle_pause() {
            let h = setup(FakeEngine::running(120), FakeRemote::new()).await;
            mark_tracking(&h.ctx, Duration::from_secs(30));
            h.seq.pause(true).await.unwrap().wait_delivery().await;

            let outcome = h.seq.resume(false).await.unwrap();

            assert!(matches!(
                outcome,
                TransitionOutcome::Skipped(SkipReason::IdlePausePending)
            ));
            assert_eq!(h.engine.count("resume"), 0);
            assert!(h.ctx.cache.snapshot().is_idle_paused());

            // решение из окна простоя разрешено
            let outcome = h.seq.resume(true).await.unwrap().wait_delivery().await;
            assert!(outcome.is_applied());
            assert!(!h.ctx.cache.snapshot().is_idle_paused());
        }

        #[tokio::test]
        async fn test_offline_stop_sweeps_when_online() {
            let remote = FakeRemote::new();
            remote.set_offline(true);
            let h = setup(FakeEngine::running(60), remote).await;
            mark_tracking(&h.ctx, Duration::ZERO);

            let outcome = h.seq.stop().await.unwrap().wait_delivery().await;
            let TransitionOutcome::Applied {
                queue_id: Some(queue_id),
                ..
            } = outcome
            else {
                panic!("stop should be applied");
            };
            assert!(h.engine.get_state().await.unwrap().is_stopped());
            let task = h.ctx.db.get_task(queue_id).unwrap().unwrap();
            assert!(matches!(
                task.payload,
                OperationPayload::Stop { entry_id: None, .. }
            ));

            h.remote.set_offline(false);
            h.remote.push(entry("e9", "u1", 100, EntryStatus::Running));
            h.ctx.db.expire_backoff().unwrap();
            let report = h.ctx.flush_queue(false).await.unwrap();

            assert_eq!(report.synced, 1);
            assert_eq!(h.remote.status_of("e9"), Some(EntryStatus::Stopped));
        }

        #[tokio::test]
        async fn test_offline_start_then_stop_leaves_no_active_entry() {
            let remote = FakeRemote::new();
            remote.set_offline(true);
            let h = setup(FakeEngine::new(), remote).await;

            h.seq.start("p1", None).await.unwrap().wait_delivery().await;
            h.seq.stop().await.unwrap().wait_delivery().await;
            assert_eq!(h.ctx.db.get_pending_count().unwrap(), 2);

            h.remote.set_offline(false);
            h.ctx.db.expire_backoff().unwrap();
            let report = h.ctx.flush_queue(false).await.unwrap();

            assert_eq!(report.synced, 2);
            assert!(h.remote.active_for("u1").is_empty());
            assert_eq!(h.remote.entries().len(), 1);
            assert!(!h.ctx.cache.snapshot().is_tracking);
        }

        #[tokio::test]
        async fn test_reset_day_stops_running_entry() {
            let h = setup(FakeEngine::new(), FakeRemote::new()).await;
            h.seq.start("p1", None).await.unwrap().wait_delivery().await;

            let outcome = h.seq.reset_day().await.unwrap().wait_delivery().await;

            assert!(outcome.snapshot().unwrap().is_stopped());
            assert_eq!(h.remote.status_of("srv-1"), Some(EntryStatus::Stopped));
            assert!(!h.ctx.cache.snapshot().is_tracking);
        }

        #[tokio::test]
        async fn test_torn_down_session_skips_transitions() {
            let h = setup(FakeEngine::new(), FakeRemote::new()).await;
            h.ctx.tear_down();

            assert!(matches!(
                h.seq.start("p1", None).await.unwrap(),
                TransitionOutcome::Skipped(SkipReason::TornDown)
            ));
            assert_eq!(h.engine.count("start"), 0);
        }

        #[tokio::test]
        async fn test_start_requires_credentials() {
            let engine = Arc::new(FakeEngine::new());
            let (ctx, _dir) = session_context(engine.clone(), Arc::new(FakeRemote::new()));
            let seq = OperationSequencer::new(ctx.clone());

            assert!(matches!(
                seq.start("p1", None).await,
                Err(ReconcileError::NotAuthenticated)
            ));
            assert_eq!(engine.count("start"), 0);
            assert!(!ctx.lock.is_held());
        }
    }

    mod idle_tests {
        use super::*;

        fn monitor(h: &Harness) -> IdleMonitor {
            IdleMonitor::new(h.ctx.clone(), h.seq.clone())
        }

        #[tokio::test]
        async fn test_threshold_breach_triggers_idle_pause() {
            let h = setup(FakeEngine::running(600), FakeRemote::new()).await;
            mark_tracking(&h.ctx, Duration::from_secs(130));
            let mut rx = h.ctx.events.subscribe();
            let idle = monitor(&h);

            let IdleTick::Triggered(state) = idle.tick().await.unwrap() else {
                panic!("idle pause expected");
            };

            assert!(state.pause_start_time.is_some());
            assert!(!state.is_loading);
            assert!((468..=470).contains(&h.engine.accumulated()));
            assert!(drain(&mut rx).contains(&events::IDLE_STATE_UPDATE));
            assert_eq!(idle.tick().await.unwrap(), IdleTick::AlreadyPaused);
        }

        #[tokio::test]
        async fn test_resume_decision_closes_prompt() {
            let h = setup(FakeEngine::running(600), FakeRemote::new()).await;
            mark_tracking(&h.ctx, Duration::from_secs(130));
            let idle = monitor(&h);
            idle.tick().await.unwrap();
            let mut rx = h.ctx.events.subscribe();

            let outcome = idle.handle_decision(IdleDecision::Resume).await.unwrap();

            assert!(outcome.is_applied());
            assert!(h.engine.get_state().await.unwrap().is_running());
            assert!(!h.ctx.cache.snapshot().is_idle_paused());
            assert!(drain(&mut rx).contains(&events::IDLE_PROMPT_CLOSED));
        }

        #[tokio::test]
        async fn test_stop_decision_stops_timer() {
            let h = setup(FakeEngine::running(600), FakeRemote::new()).await;
            mark_tracking(&h.ctx, Duration::from_secs(130));
            let idle = monitor(&h);
            idle.tick().await.unwrap();

            idle.handle_decision(IdleDecision::Stop).await.unwrap();

            assert!(h.engine.get_state().await.unwrap().is_stopped());
            let cache = h.ctx.cache.snapshot();
            assert!(!cache.is_tracking);
            assert!(!cache.is_idle_paused());
        }

        #[tokio::test]
        async fn test_paused_engine_not_idle_paused_again() {
            let h = setup(FakeEngine::new(), FakeRemote::new()).await;
            h.seq.start("p1", None).await.unwrap().wait_delivery().await;
            h.seq.pause(false).await.unwrap().wait_delivery().await;
            // кэш отстал от движка
            mark_tracking(&h.ctx, Duration::from_secs(600));

            assert_eq!(monitor(&h).tick().await.unwrap(), IdleTick::AlreadyPaused);
            assert_eq!(h.engine.count("pause_idle"), 0);
            assert!(!h.ctx.cache.snapshot().is_idle_paused());
        }

        #[tokio::test]
        async fn test_idle_detected_when_cache_missed_start() {
            let h = setup(FakeEngine::running(600), FakeRemote::new()).await;
            // движок запущен, кэш об этом не знает
            h.ctx.cache.update(|c| {
                c.is_tracking = false;
                c.last_activity = Some(Stamp::ago(Duration::from_secs(130)));
            });

            let tick = monitor(&h).tick().await.unwrap();

            assert!(matches!(tick, IdleTick::Triggered(_)));
            assert_eq!(h.engine.count("pause_idle"), 1);
            assert!(h.ctx.cache.snapshot().is_idle_paused());
        }

        #[tokio::test]
        async fn test_stopped_engine_not_tracking() {
            let h = setup(FakeEngine::new(), FakeRemote::new()).await;
            h.ctx.cache.update(|c| {
                c.last_activity = Some(Stamp::ago(Duration::from_secs(600)));
            });

            assert_eq!(monitor(&h).tick().await.unwrap(), IdleTick::NotTracking);
            assert_eq!(h.engine.count("pause_idle"), 0);
        }
    }

    mod reconcile_tests {
        use super::*;

        fn reconciler(h: &Harness) -> RemoteReconciler {
            RemoteReconciler::new(h.ctx.clone())
        }

        #[tokio::test]
        async fn test_never_resumes_idle_pause() {
            let remote = FakeRemote::with_entries(vec![entry("e1", "u1", 100, EntryStatus::Running)]);
            let h = setup(FakeEngine::running(300), remote).await;
            mark_tracking(&h.ctx, Duration::from_secs(200));
            h.seq.pause(true).await.unwrap().wait_delivery().await;
            // другое устройство возобновило запись
            h.remote.set_status("e1", EntryStatus::Running);

            let outcome = reconciler(&h).reconcile_once().await.unwrap();

            assert_eq!(
                outcome,
                ReconcileOutcome::Acted(ReconcileAction::Skip(SkipCause::IdlePausePending))
            );
            assert_eq!(h.engine.count("resume"), 0);
            assert!(h.engine.get_state().await.unwrap().is_paused());
        }

        #[tokio::test]
        async fn test_applies_remote_stop() {
            let h = setup(FakeEngine::running(10), FakeRemote::new()).await;
            mark_tracking(&h.ctx, Duration::ZERO);
            h.ctx
                .remember_entry(Some(&entry("e1", "u1", 100, EntryStatus::Running)));

            let outcome = reconciler(&h).reconcile_once().await.unwrap();

            assert_eq!(outcome, ReconcileOutcome::Acted(ReconcileAction::StopEngine));
            assert!(h.engine.get_state().await.unwrap().is_stopped());
            assert!(h.ctx.cache.snapshot().current_entry.is_none());
            assert_eq!(h.ctx.db.last_entry_id().unwrap(), None);
            // сервер уже в этом состоянии: в очередь ничего не ставится
            assert_eq!(h.ctx.db.get_pending_count().unwrap(), 0);
        }

        #[tokio::test]
        async fn test_starts_engine_for_remote_running_entry() {
            let remote = FakeRemote::with_entries(vec![entry("e1", "u1", 100, EntryStatus::Running)]);
            let h = setup(FakeEngine::new(), remote).await;

            let outcome = reconciler(&h).reconcile_once().await.unwrap();

            assert_eq!(outcome, ReconcileOutcome::Acted(ReconcileAction::StartEngine));
            assert!(h.engine.get_state().await.unwrap().is_running());
            assert_eq!(h.ctx.cache.snapshot().current_entry_id(), Some("e1"));
        }

        #[tokio::test]
        async fn test_remote_resume_not_idle_paused_right_away() {
            let h = setup(FakeEngine::new(), FakeRemote::new()).await;
            h.seq.start("p1", None).await.unwrap().wait_delivery().await;
            h.seq.pause(false).await.unwrap().wait_delivery().await;
            // пользователь давно отошёл, запись возобновили на другом устройстве
            h.ctx.cache.update(|c| {
                c.last_activity = Some(Stamp::ago(Duration::from_secs(900)));
                c.last_pause_time = None;
            });
            h.remote.set_status("srv-1", EntryStatus::Running);

            let outcome = reconciler(&h).reconcile_once().await.unwrap();
            assert_eq!(outcome, ReconcileOutcome::Acted(ReconcileAction::ResumeEngine));

            let cache = h.ctx.cache.snapshot();
            assert!(cache.last_resume_time.is_some());
            let tick = IdleMonitor::new(h.ctx.clone(), h.seq.clone()).tick().await.unwrap();
            assert!(matches!(tick, IdleTick::Active(_)));
            assert!(h.engine.get_state().await.unwrap().is_running());
            assert_eq!(h.remote.status_of("srv-1"), Some(EntryStatus::Running));
        }

        #[tokio::test]
        async fn test_post_start_grace_protects_local_start() {
            let remote = FakeRemote::new();
            remote.set_fail_create(true);
            let h = setup(FakeEngine::new(), remote).await;
            h.seq.start("p1", None).await.unwrap().wait_delivery().await;

            let outcome = reconciler(&h).reconcile_once().await.unwrap();

            assert_eq!(
                outcome,
                ReconcileOutcome::Acted(ReconcileAction::Skip(SkipCause::PostStartGrace))
            );
            assert!(h.engine.get_state().await.unwrap().is_running());
        }

        #[tokio::test]
        async fn test_two_devices_converge_to_newest_entry() {
            let remote = FakeRemote::with_entries(vec![
                entry("e-old", "u1", 100, EntryStatus::Running),
                entry("e-new", "u1", 200, EntryStatus::Running),
            ]);
            let h = setup(FakeEngine::running(5), remote).await;
            mark_tracking(&h.ctx, Duration::ZERO);
            h.ctx
                .remember_entry(Some(&entry("e-old", "u1", 100, EntryStatus::Running)));

            let outcome = reconciler(&h).reconcile_once().await.unwrap();

            assert_eq!(outcome, ReconcileOutcome::Acted(ReconcileAction::None));
            assert_eq!(h.ctx.cache.snapshot().current_entry_id(), Some("e-new"));
            let remote = h.remote.clone();
            wait_until(|| remote.status_of("e-old") == Some(EntryStatus::Stopped)).await;
            assert_eq!(h.remote.active_for("u1").len(), 1);
        }

        #[tokio::test]
        async fn test_foreign_entries_ignored() {
            let remote = FakeRemote::with_entries(vec![entry("x", "u2", 100, EntryStatus::Running)]);
            let h = setup(FakeEngine::new(), remote).await;

            let outcome = reconciler(&h).reconcile_once().await.unwrap();

            assert_eq!(outcome, ReconcileOutcome::Acted(ReconcileAction::None));
            assert_eq!(h.engine.count("start"), 0);
            assert_eq!(h.remote.status_of("x"), Some(EntryStatus::Running));
        }

        #[tokio::test]
        async fn test_offline_and_busy_are_skipped() {
            let h = setup(FakeEngine::running(5), FakeRemote::new()).await;

            let guard = h.ctx.lock.try_acquire("stop").unwrap();
            assert_eq!(
                reconciler(&h).reconcile_once().await.unwrap(),
                ReconcileOutcome::Busy
            );
            drop(guard);

            h.remote.set_offline(true);
            assert_eq!(
                reconciler(&h).reconcile_once().await.unwrap(),
                ReconcileOutcome::Offline
            );
            assert_eq!(h.engine.count("stop"), 0);
        }

        #[tokio::test]
        async fn test_restored_pause_waits_for_user() {
            // после перезапуска движок PAUSED, а запись на сервере всё ещё RUNNING
            let remote = FakeRemote::with_entries(vec![entry("e1", "u1", 100, EntryStatus::Running)]);
            let h = setup(FakeEngine::restored_paused(), remote).await;

            let outcome = reconciler(&h).reconcile_once().await.unwrap();

            assert_eq!(
                outcome,
                ReconcileOutcome::Acted(ReconcileAction::Skip(SkipCause::RestoredAwaitingUser))
            );
            assert_eq!(h.engine.count("resume"), 0);
            assert_eq!(h.ctx.cache.snapshot().current_entry_id(), Some("e1"));

            // явный resume пользователя возобновляет и запись
            h.seq.resume(false).await.unwrap().wait_delivery().await;
            assert!(h.engine.get_state().await.unwrap().is_running());
            assert_eq!(h.remote.status_of("e1"), Some(EntryStatus::Running));
            assert_eq!(h.ctx.db.get_pending_count().unwrap(), 0);
        }

        #[tokio::test]
        async fn test_audit_restores_invariant() {
            let h = setup(FakeEngine::running(5), FakeRemote::new()).await;
            h.ctx.cache.update(|c| {
                c.is_tracking = false;
                c.is_paused = true;
            });
            let auditor = InvariantAuditor::new(h.ctx.clone());

            assert_eq!(auditor.audit_once().await, AuditOutcome::Corrected);
            let snapshot = h.engine.get_state().await.unwrap();
            assert!(h.ctx.cache.is_consistent_with(&snapshot));
        }
    }

    mod sync_manager_tests {
        use super::*;

        fn create_sync_manager(
            dir: &tempfile::TempDir,
            remote: Arc<FakeRemote>,
        ) -> (SyncManager, Arc<Database>) {
            let db = open_db(dir);
            let auth = Arc::new(AuthManager::new(test_config().api_base_url));
            (SyncManager::new(db.clone(), remote, auth, 5), db)
        }

        #[tokio::test]
        async fn test_queued_operation_survives_restart() {
            let dir = tempfile::tempdir().unwrap();
            {
                let db = open_db(&dir);
                db.enqueue_operation(&start_request("u1"), Some(&creds("u1")))
                    .unwrap();
            }

            // новый процесс: токенов в памяти нет, используется snapshot из очереди
            let remote = Arc::new(FakeRemote::new());
            let (sync, db) = create_sync_manager(&dir, remote.clone());
            let report = sync.flush(false).await.unwrap();

            assert_eq!(report.synced, 1);
            assert_eq!(report.created.len(), 1);
            assert_eq!(remote.active_for("u1").len(), 1);
            assert_eq!(db.get_pending_count().unwrap(), 0);
        }

        #[tokio::test]
        async fn test_pause_without_id_resolved_after_start() {
            let dir = tempfile::tempdir().unwrap();
            let remote = Arc::new(FakeRemote::new());
            let (sync, db) = create_sync_manager(&dir, remote.clone());

            sync.enqueue(&start_request("u1"), Some(&creds("u1"))).unwrap();
            let pause_id = sync
                .enqueue(
                    &OperationPayload::Pause {
                        entry_id: None,
                        at: 1,
                    },
                    Some(&creds("u1")),
                )
                .unwrap();

            let report = sync.flush(false).await.unwrap();

            assert_eq!(report.synced, 2);
            assert_eq!(remote.status_of("srv-1"), Some(EntryStatus::Paused));
            let task = db.get_task(pause_id).unwrap().unwrap();
            assert_eq!(task.payload.entry_id(), Some("srv-1"));
        }

        #[tokio::test]
        async fn test_pause_waits_for_pending_start() {
            let dir = tempfile::tempdir().unwrap();
            let remote = Arc::new(FakeRemote::new());
            let (sync, db) = create_sync_manager(&dir, remote.clone());

            sync.enqueue(&start_request("u1"), Some(&creds("u1"))).unwrap();
            let pause_id = sync
                .enqueue(
                    &OperationPayload::Pause {
                        entry_id: None,
                        at: 1,
                    },
                    Some(&creds("u1")),
                )
                .unwrap();

            let result = sync.deliver_one(pause_id).await;

            assert!(matches!(result, Err(SyncError::UnresolvedEntry(_))));
            assert_eq!(remote.count("pause"), 0);
            assert_eq!(
                db.get_task(pause_id).unwrap().unwrap().status,
                QueueStatus::Pending
            );
        }

        #[tokio::test]
        async fn test_state_already_achieved_counts_as_success() {
            let dir = tempfile::tempdir().unwrap();
            let remote = Arc::new(FakeRemote::with_entries(vec![entry(
                "e1",
                "u1",
                100,
                EntryStatus::Paused,
            )]));
            let (sync, db) = create_sync_manager(&dir, remote.clone());
            let id = sync
                .enqueue(
                    &OperationPayload::Pause {
                        entry_id: Some("e1".into()),
                        at: 1,
                    },
                    Some(&creds("u1")),
                )
                .unwrap();

            let outcome = sync.deliver_one(id).await.unwrap();

            assert_eq!(outcome, DeliveryOutcome::AlreadyAchieved);
            assert_eq!(db.get_task(id).unwrap().unwrap().status, QueueStatus::Sent);
            assert_eq!(db.get_failed_count().unwrap(), 0);
        }

        #[tokio::test]
        async fn test_sweep_never_touches_foreign_entries() {
            let dir = tempfile::tempdir().unwrap();
            let remote = Arc::new(FakeRemote::with_entries(vec![
                entry("mine", "u1", 100, EntryStatus::Running),
                entry("theirs", "u2", 200, EntryStatus::Running),
            ]));
            let (sync, _db) = create_sync_manager(&dir, remote.clone());
            let id = sync
                .enqueue(
                    &OperationPayload::Stop {
                        entry_id: None,
                        at: 1,
                    },
                    Some(&creds("u1")),
                )
                .unwrap();

            assert_eq!(sync.deliver_one(id).await.unwrap(), DeliveryOutcome::Swept(1));
            assert_eq!(remote.status_of("mine"), Some(EntryStatus::Stopped));
            assert_eq!(remote.status_of("theirs"), Some(EntryStatus::Running));
        }

        #[tokio::test]
        async fn test_exhausted_task_reported() {
            let remote = FakeRemote::new();
            remote.set_fail_create(true);
            let h = setup(FakeEngine::new(), remote).await;
            h.ctx
                .enqueue(&start_request("u1"), Some(&creds("u1")))
                .unwrap();
            let mut rx = h.ctx.events.subscribe();

            let mut exhausted = Vec::new();
            for _ in 0..5 {
                h.ctx.db.expire_backoff().unwrap();
                exhausted = h.ctx.flush_queue(false).await.unwrap().exhausted;
            }

            assert_eq!(exhausted.len(), 1);
            assert_eq!(h.ctx.db.get_failed_count().unwrap(), 1);
            assert!(drain(&mut rx).contains(&events::QUEUE_FAILED));
        }

        #[tokio::test]
        async fn test_concurrent_flush_single_flight() {
            let dir = tempfile::tempdir().unwrap();
            let remote = Arc::new(FakeRemote::new());
            let (sync, _db) = create_sync_manager(&dir, remote.clone());
            sync.enqueue(&start_request("u1"), Some(&creds("u1"))).unwrap();

            let (a, b) = tokio::join!(sync.flush(false), sync.flush(false));

            assert_eq!(a.unwrap().synced + b.unwrap().synced, 1);
            assert_eq!(remote.count("create"), 1);
        }

        #[tokio::test]
        async fn test_flush_skips_task_with_slow_send() {
            let remote = FakeRemote::new();
            remote.set_create_delay(Some(Duration::from_millis(300)));
            let h = setup(FakeEngine::new(), remote).await;

            let outcome = h.seq.start("p1", None).await.unwrap();
            wait_until(|| h.remote.count("create") == 1).await;
            h.ctx.db.expire_backoff().unwrap();
            let report = h.ctx.flush_queue(true).await.unwrap();
            assert_eq!(report.synced, 0);

            outcome.wait_delivery().await;
            assert_eq!(h.remote.count("create"), 1);
            assert_eq!(h.remote.active_for("u1").len(), 1);
            assert_eq!(h.ctx.db.get_pending_count().unwrap(), 0);
        }

        #[tokio::test]
        async fn test_background_delivery_reports_rejected_batch() {
            let h = setup(FakeEngine::new(), FakeRemote::new()).await;
            let id = h
                .ctx
                .enqueue(
                    &OperationPayload::ActivityBatch {
                        activities: Vec::new(),
                    },
                    Some(&creds("u1")),
                )
                .unwrap();
            let mut rx = h.ctx.events.subscribe();

            h.ctx.spawn_delivery(id).await.unwrap();

            let names = drain(&mut rx);
            assert!(names.contains(&events::QUEUE_FAILED));
            assert!(names.contains(&events::NOTIFICATION));
            assert_eq!(h.ctx.db.get_failed_count().unwrap(), 1);
            assert_eq!(h.ctx.db.get_pending_count().unwrap(), 0);
        }
    }

    mod database_tests {
        use super::*;
        use tempfile::TempDir;

        fn create_test_db() -> (Arc<Database>, TempDir) {
            let temp_dir = TempDir::new().unwrap();
            let db = open_db(&temp_dir);
            (db, temp_dir)
        }

        fn stop_payload(entry_id: &str) -> OperationPayload {
            OperationPayload::Stop {
                entry_id: Some(entry_id.to_string()),
                at: 1_700_000_000_000,
            }
        }

        #[test]
        fn test_database_init_schema() {
            let (db, _temp_dir) = create_test_db();

            let conn = db.conn.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table'")
                .unwrap();
            let tables: Vec<String> = stmt
                .query_map([], |row| row.get(0))
                .unwrap()
                .map(|r| r.unwrap())
                .collect();

            assert!(tables.contains(&"sync_queue".to_string()));
            assert!(tables.contains(&"app_meta".to_string()));
            let version: i32 = conn
                .query_row("PRAGMA user_version", [], |r| r.get(0))
                .unwrap();
            assert_eq!(version, 2);
        }

        #[test]
        fn test_enqueue_duplicate_within_window() {
            let (db, _temp_dir) = create_test_db();

            let first = db.enqueue_operation(&stop_payload("e1"), None).unwrap();
            let second = db.enqueue_operation(&stop_payload("e1"), None).unwrap();
            let other = db.enqueue_operation(&stop_payload("e2"), None).unwrap();

            assert_eq!(first, second);
            assert_ne!(first, other);
            assert_eq!(db.get_pending_count().unwrap(), 2);
        }

        #[test]
        fn test_credentials_encrypted_at_rest() {
            let (db, _temp_dir) = create_test_db();
            let id = db
                .enqueue_operation(&stop_payload("e1"), Some(&creds("u1")))
                .unwrap();

            let raw: String = {
                let conn = db.conn.lock().unwrap();
                conn.query_row(
                    "SELECT credentials FROM sync_queue WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .unwrap()
            };
            assert!(!raw.contains("token-u1"));

            let task = db.get_task(id).unwrap().unwrap();
            assert_eq!(task.credentials, Some(creds("u1")));
        }

        #[test]
        fn test_claim_task_only_once() {
            let (db, _temp_dir) = create_test_db();
            let id = db.enqueue_operation(&stop_payload("e1"), None).unwrap();

            assert!(db.claim_task(id).unwrap());
            assert_eq!(db.get_task(id).unwrap().unwrap().status, QueueStatus::InFlight);
            // долгая отправка: окно backoff истекло, задача всё ещё не доступна
            db.expire_backoff().unwrap();
            assert!(!db.claim_task(id).unwrap());
            assert!(db.get_retry_tasks(5, 10, true).unwrap().is_empty());
            assert_eq!(db.get_pending_count().unwrap(), 1);

            db.mark_task_sent(id).unwrap();
            db.expire_backoff().unwrap();
            assert!(!db.claim_task(id).unwrap());
        }

        #[test]
        fn test_in_flight_released_on_reopen() {
            let temp_dir = TempDir::new().unwrap();
            let id = {
                let db = open_db(&temp_dir);
                let id = db.enqueue_operation(&stop_payload("e1"), None).unwrap();
                assert!(db.claim_task(id).unwrap());
                id
            };

            let db = open_db(&temp_dir);
            let task = db.get_task(id).unwrap().unwrap();
            assert_eq!(task.status, QueueStatus::Pending);
            assert!(db.claim_task(id).unwrap());
        }

        #[test]
        fn test_get_retry_tasks_backoff() {
            let (db, _temp_dir) = create_test_db();
            let id = db.enqueue_operation(&stop_payload("e1"), None).unwrap();
            db.update_sync_status_with_error(id, QueueStatus::Pending, 1, Some("HTTP 503"))
                .unwrap();

            // retry_count = 1: задержка 20 сек
            assert!(db.get_retry_tasks(5, 10, false).unwrap().is_empty());
            assert!(db.get_retry_tasks(5, 10, true).unwrap().is_empty());

            let thirty_seconds_ago = Utc::now().timestamp() - 30;
            {
                let conn = db.conn.lock().unwrap();
                conn.execute(
                    "UPDATE sync_queue SET last_retry_at = ?1 WHERE id = ?2",
                    params![thirty_seconds_ago, id],
                )
                .unwrap();
            }
            let tasks = db.get_retry_tasks(5, 10, false).unwrap();
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].id, id);
        }

        #[test]
        fn test_retry_tasks_ordered_by_priority() {
            let (db, _temp_dir) = create_test_db();
            let batch = db
                .enqueue_operation(
                    &OperationPayload::ActivityBatch {
                        activities: Vec::new(),
                    },
                    None,
                )
                .unwrap();
            let pause = db
                .enqueue_operation(
                    &OperationPayload::Pause {
                        entry_id: Some("e1".into()),
                        at: 1,
                    },
                    None,
                )
                .unwrap();
            let stop = db.enqueue_operation(&stop_payload("e1"), None).unwrap();

            let ids: Vec<i64> = db
                .get_retry_tasks(5, 10, false)
                .unwrap()
                .iter()
                .map(|t| t.id)
                .collect();
            assert_eq!(ids, vec![stop, pause, batch]);
        }

        #[test]
        fn test_malformed_row_marked_failed() {
            let (db, _temp_dir) = create_test_db();
            {
                let conn = db.conn.lock().unwrap();
                conn.execute(
                    "INSERT INTO sync_queue (entity_type, payload, status, created_at, priority)
                     VALUES ('time_entry_stop', 'not json', 'pending', ?1, 0)",
                    params![Utc::now().timestamp()],
                )
                .unwrap();
            }

            assert!(db.get_retry_tasks(5, 10, false).unwrap().is_empty());
            assert_eq!(db.get_failed_count().unwrap(), 1);
        }

        #[test]
        fn test_reset_failed_tasks() {
            let (db, _temp_dir) = create_test_db();
            let id = db.enqueue_operation(&stop_payload("e1"), None).unwrap();
            db.update_sync_status(id, QueueStatus::Failed, 5).unwrap();
            assert_eq!(db.get_failed_tasks(10).unwrap().len(), 1);

            assert_eq!(db.reset_failed_tasks(10).unwrap(), 1);
            assert_eq!(db.get_pending_count().unwrap(), 1);
            assert_eq!(db.get_retry_tasks(5, 10, false).unwrap().len(), 1);
        }

        #[test]
        fn test_pending_kinds() {
            let (db, _temp_dir) = create_test_db();
            assert_eq!(db.pending_kinds().unwrap(), PendingKinds::default());

            db.enqueue_operation(&start_request("u1"), None).unwrap();
            db.enqueue_operation(&stop_payload("e1"), None).unwrap();

            let kinds = db.pending_kinds().unwrap();
            assert!(kinds.start && kinds.stop);
            assert!(!kinds.pause && !kinds.resume);
        }

        #[test]
        fn test_last_entry_id_fallback_from_queue() {
            let (db, _temp_dir) = create_test_db();
            assert_eq!(db.get_last_time_entry_id_from_queue().unwrap(), None);

            db.enqueue_operation(
                &OperationPayload::Pause {
                    entry_id: Some("e7".into()),
                    at: 1,
                },
                None,
            )
            .unwrap();
            assert_eq!(
                db.get_last_time_entry_id_from_queue().unwrap().as_deref(),
                Some("e7")
            );
        }

        #[test]
        fn test_clear_user_data() {
            let (db, _temp_dir) = create_test_db();
            db.enqueue_operation(&stop_payload("e1"), None).unwrap();
            db.set_last_entry_id(Some("e1")).unwrap();

            db.clear_user_data().unwrap();

            assert_eq!(db.get_pending_count().unwrap(), 0);
            assert_eq!(db.last_entry_id().unwrap(), None);
        }

        #[test]
        fn test_queue_stats_by_type() {
            let (db, _temp_dir) = create_test_db();
            db.enqueue_operation(&stop_payload("e1"), None).unwrap();
            db.enqueue_operation(&stop_payload("e2"), None).unwrap();

            let stats = db.get_queue_stats().unwrap();
            assert_eq!(stats.pending_count, 2);
            assert_eq!(stats.pending_by_type.get("time_entry_stop"), Some(&2));
        }
    }

    mod session_tests {
        use super::*;
        use tempfile::TempDir;

        fn create_session(engine: Arc<FakeEngine>, remote: Arc<FakeRemote>) -> (TrackingSession, TempDir) {
            let dir = TempDir::new().unwrap();
            let db = open_db(&dir);
            let auth = Arc::new(AuthManager::new(test_config().api_base_url));
            let session = TrackingSession::new(test_config(), engine, remote, db, auth).unwrap();
            (session, dir)
        }

        #[test]
        fn test_invalid_config_rejected() {
            let dir = TempDir::new().unwrap();
            let config = ReconcileConfig {
                idle_threshold_secs: 30,
                ..test_config()
            };
            let result = TrackingSession::new(
                config,
                Arc::new(FakeEngine::new()),
                Arc::new(FakeRemote::new()),
                open_db(&dir),
                Arc::new(AuthManager::new(test_config().api_base_url)),
            );
            assert!(matches!(result, Err(ReconcileError::Config(_))));
        }

        #[tokio::test]
        async fn test_user_switch_clears_local_queue() {
            let (session, _dir) =
                create_session(Arc::new(FakeEngine::new()), Arc::new(FakeRemote::new()));
            let db = session.context().db.clone();

            session.login(creds("u1")).await.unwrap();
            db.enqueue_operation(&start_request("u1"), Some(&creds("u1")))
                .unwrap();

            // тот же пользователь: очередь сохраняется
            session.login(creds("u1")).await.unwrap();
            assert_eq!(db.get_pending_count().unwrap(), 1);

            session.login(creds("u2")).await.unwrap();
            assert_eq!(db.get_pending_count().unwrap(), 0);
            assert_eq!(
                session.context().auth.current_user_id().await.as_deref(),
                Some("u2")
            );
        }

        #[tokio::test]
        async fn test_url_activities_chunked_and_enriched() {
            let remote = Arc::new(FakeRemote::new());
            let (session, _dir) = create_session(Arc::new(FakeEngine::new()), remote.clone());
            session.login(creds("u1")).await.unwrap();

            let activities: Vec<UrlActivity> = (0..250)
                .map(|i| UrlActivity {
                    url: format!("https://github.com/repo/{}", i),
                    domain: String::new(),
                    title: None,
                    time_entry_id: None,
                    started_at: 1_700_000_000_000 + i,
                    duration_seconds: 5,
                })
                .collect();

            let ids = session.record_url_activities(activities).await.unwrap();

            assert_eq!(ids.len(), 3);
            wait_until(|| remote.uploaded().len() == 250).await;
            assert!(remote.uploaded().iter().all(|a| a.domain == "github.com"));
        }

        #[tokio::test]
        async fn test_request_idle_state_event() {
            let (session, _dir) =
                create_session(Arc::new(FakeEngine::new()), Arc::new(FakeRemote::new()));
            let mut rx = session.subscribe();

            session
                .handle_ui_event(events::REQUEST_IDLE_STATE)
                .await
                .unwrap();

            assert!(drain(&mut rx).contains(&events::IDLE_STATE_UPDATE));
        }

        #[tokio::test]
        async fn test_shutdown_saves_state_and_stops_transitions() {
            let engine = Arc::new(FakeEngine::new());
            let (session, _dir) = create_session(engine.clone(), Arc::new(FakeRemote::new()));
            session.login(creds("u1")).await.unwrap();
            session.start_background();

            session.shutdown().await;

            assert_eq!(engine.count("save_state"), 1);
            assert!(matches!(
                session.start("p1", None).await.unwrap(),
                TransitionOutcome::Skipped(SkipReason::TornDown)
            ));
        }

        #[tokio::test]
        async fn test_full_cycle_through_session() {
            let remote = Arc::new(FakeRemote::new());
            let (session, _dir) = create_session(Arc::new(FakeEngine::new()), remote.clone());
            session.login(creds("u1")).await.unwrap();

            session.start("p1", None).await.unwrap().wait_delivery().await;
            session.pause().await.unwrap().wait_delivery().await;
            session.resume().await.unwrap().wait_delivery().await;
            session.stop().await.unwrap().wait_delivery().await;

            assert!(remote.active_for("u1").is_empty());
            let status = session.sync_status().await.unwrap();
            assert_eq!(status.pending_count, 0);
            assert_eq!(status.failed_count, 0);
            assert!(!status.is_online);
        }
    }
}
