use orm_config::ResolvedConfig;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Open-connection cap used when the configuration asks for no cap.
///
/// sqlx sizes its idle queue up front from `max_connections`, so "unlimited"
/// has to become a concrete number.
pub const OPEN_CONNS_CEILING: u32 = 1024;

/// Size and lifetime limits of the connection pool.
///
/// Zero follows the usual `database/sql` conventions: no lifetime cap and
/// no idle connections kept. Zero open connections means "as many as the
/// pool allows", which is [`OPEN_CONNS_CEILING`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_idle: u32,
    pub max_open: u32,
    pub max_lifetime: Duration,
}

impl PoolLimits {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            max_idle: config.max_idle_conns,
            max_open: config.max_open_conns,
            max_lifetime: config.conn_max_lifetime(),
        }
    }

    /// Open connections the pool may hold.
    pub fn effective_max_open(&self) -> u32 {
        if self.max_open == 0 {
            OPEN_CONNS_CEILING
        } else {
            self.max_open
        }
    }

    /// Idle connections the pool may keep; never more than it may open.
    pub fn effective_max_idle(&self) -> u32 {
        self.max_idle.min(self.effective_max_open())
    }

    pub fn effective_max_lifetime(&self) -> Option<Duration> {
        (!self.max_lifetime.is_zero()).then_some(self.max_lifetime)
    }

    pub(crate) fn apply(&self, options: AnyPoolOptions, idle: &IdleLimiter) -> AnyPoolOptions {
        let on_release = idle.clone();
        let on_acquire = idle.clone();
        options
            .min_connections(0)
            .max_connections(self.effective_max_open())
            .max_lifetime(self.effective_max_lifetime())
            .idle_timeout(None::<Duration>)
            .after_release(move |_conn, _meta| {
                let keep = on_release.try_reserve();
                Box::pin(async move { Ok(keep) })
            })
            .before_acquire(move |_conn, _meta| {
                on_acquire.release();
                Box::pin(async move { Ok(true) })
            })
    }
}

/// Closes released connections once enough idle ones are spoken for.
///
/// sqlx has no idle-count cap of its own. A released connection only reaches
/// the idle queue after the release hook and a ping, so counting the queue
/// from the hook lets simultaneous releases all slip through. Instead each
/// kept connection takes a slot here atomically, and gives it back when it
/// is handed out again.
///
/// Idle connections can also leave without passing `before_acquire` (lifetime
/// expiry, failed pings). Their slots are recovered on the next release: the
/// connection being released holds no slot, so at most `size - 1` slots can
/// be live.
#[derive(Clone)]
pub(crate) struct IdleLimiter {
    max_idle: usize,
    reserved: Arc<AtomicUsize>,
    pool: Arc<RwLock<Option<AnyPool>>>,
}

impl IdleLimiter {
    pub(crate) fn new(max_idle: u32) -> Self {
        Self {
            max_idle: max_idle as usize,
            reserved: Arc::new(AtomicUsize::new(0)),
            pool: Arc::new(RwLock::new(None)),
        }
    }

    pub(crate) fn attach(&self, pool: &AnyPool) {
        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(pool.clone());
    }

    /// Drop the pool reference, breaking the pool -> hook -> pool cycle.
    pub(crate) fn detach(&self) {
        self.pool.write().unwrap_or_else(PoisonError::into_inner).take();
        self.reserved.store(0, Ordering::SeqCst);
    }

    /// Whether a connection being released may go back to the idle set.
    pub(crate) fn try_reserve(&self) -> bool {
        let slot = self.pool.read().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(pool) => self.reserve_with(|| pool.size() as usize),
            // Not attached yet: the connection sqlx opens while connecting.
            None => self.reserve_with(|| usize::MAX),
        }
    }

    fn reserve_with(&self, live: impl Fn() -> usize) -> bool {
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| {
                let held = held.min(live().saturating_sub(1));
                (held < self.max_idle).then_some(held + 1)
            })
            .is_ok()
    }

    /// An idle connection is leaving the idle set.
    pub(crate) fn release(&self) {
        let _ = self
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| {
                held.checked_sub(1)
            });
    }

    #[cfg(test)]
    fn reserved(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
    pub max_open: u32,
    pub max_idle: u32,
}

impl PoolStats {
    pub fn utilization(&self) -> f64 {
        if self.max_open == 0 {
            return 0.0;
        }
        (self.size as f64 - self.idle as f64) / self.max_open as f64
    }
}
