use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug)]
struct LockState {
    held: AtomicBool,
    /// Bumped on every acquire and force release: a stale guard never releases a newer holder
    generation: AtomicU64,
    holder: Mutex<Option<(&'static str, Instant)>>,
}

/// Single-holder guard for high-level transitions (start/pause/resume/stop, reconcile apply).
/// Acquire never waits: a held lock means "busy, skip".
#[derive(Debug, Clone)]
pub struct OperationLock {
    state: Arc<LockState>,
}

impl Default for OperationLock {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(LockState {
                held: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                holder: Mutex::new(None),
            }),
        }
    }

    pub fn try_acquire(&self, holder: &'static str) -> Option<OperationGuard> {
        if self
            .state
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("[LOCK] '{}' rejected: lock held by {:?}", holder, self.holder());
            return None;
        }
        let generation = self.state.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Ok(mut h) = self.state.holder.lock() {
            *h = Some((holder, Instant::now()));
        }
        Some(OperationGuard {
            state: self.state.clone(),
            generation,
        })
    }

    pub fn is_held(&self) -> bool {
        self.state.held.load(Ordering::Acquire)
    }

    /// Текущий владелец и сколько он держит lock
    pub fn holder(&self) -> Option<(&'static str, Duration)> {
        if !self.is_held() {
            return None;
        }
        self.state
            .holder
            .lock()
            .ok()
            .and_then(|h| h.map(|(name, since)| (name, since.elapsed())))
    }

    /// Принудительно снять lock (подвисший владелец). Его guard станет no-op.
    pub fn force_release(&self) -> Option<(&'static str, Duration)> {
        let previous = self.holder();
        self.state.generation.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut h) = self.state.holder.lock() {
            *h = None;
        }
        self.state.held.store(false, Ordering::Release);
        if let Some((name, held_for)) = previous {
            warn!(
                "[LOCK] Force released lock held by '{}' for {}s",
                name,
                held_for.as_secs()
            );
        }
        previous
    }
}

/// RAII: lock снимается при drop на любом пути выхода (включая ошибки и panic)
#[derive(Debug)]
pub struct OperationGuard {
    state: Arc<LockState>,
    generation: u64,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if self.state.generation.load(Ordering::Acquire) != self.generation {
            // force released meanwhile; the lock may belong to someone else now
            return;
        }
        if let Ok(mut h) = self.state.holder.lock() {
            *h = None;
        }
        self.state.held.store(false, Ordering::Release);
    }
}
