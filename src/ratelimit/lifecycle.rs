//! Ownership of the counter store and its background sweep.
//!
//! [`RateLimitRuntime`] is the single owner of the store. Limiters borrow it
//! through [`RateLimitRuntime::limiter`]; the sweep runs on a tokio task whose
//! cancellation handle lives here too, so shutting the runtime down stops the
//! task before the store is cleared.

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::clock::{Clock, SystemClock};
use super::limiter::RateLimiter;
use super::policy::duration_ms;
use super::store::{CounterStore, MemoryStore, SweepStats};
use crate::config::Environment;

struct Sweeper {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns the counter store and schedules its sweeps.
pub struct RateLimitRuntime {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

impl RateLimitRuntime {
    /// Start a runtime with an in-memory store on the system clock.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(sweep_interval: Duration) -> Self {
        Self::with_clock(Arc::new(SystemClock::new()), sweep_interval)
    }

    /// Start a runtime with an in-memory store on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>, sweep_interval: Duration) -> Self {
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        Self::with_store(store, clock, sweep_interval)
    }

    /// Start a runtime around an existing store.
    ///
    /// `clock` must be the clock `store` measures windows with.
    pub fn with_store(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        sweep_interval: Duration,
    ) -> Self {
        let sweep_interval = if sweep_interval.is_zero() {
            warn!("Sweep interval of zero requested, using one second");
            Duration::from_secs(1)
        } else {
            sweep_interval
        };

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(sweep_loop(store.clone(), sweep_interval, stopped));

        info!(
            sweep_interval_ms = duration_ms(sweep_interval),
            "Rate limit runtime started"
        );

        Self {
            store,
            clock,
            sweep_interval,
            sweeper: Mutex::new(Some(Sweeper { stop, task })),
        }
    }

    /// A limiter sharing this runtime's store.
    pub fn limiter(&self, environment: Environment) -> RateLimiter {
        RateLimiter::new(self.store.clone(), self.clock.clone(), environment)
    }

    /// The shared store.
    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Interval between sweeps.
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Whether the sweep task is still scheduled.
    pub fn is_running(&self) -> bool {
        self.sweeper.lock().is_some()
    }

    /// Run one sweep immediately, outside the schedule.
    pub fn sweep_now(&self) -> SweepStats {
        self.store.sweep()
    }

    /// Stop the sweep task and drop every counter.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();

        if let Some(Sweeper { stop, task }) = sweeper {
            // The task may already be gone if it panicked outside a sweep.
            let _ = stop.send(());
            if let Err(err) = task.await {
                warn!(error = %err, "Sweep task ended abnormally");
            }
            info!("Rate limit runtime stopped");
        }

        self.store.clear();
    }
}

impl Drop for RateLimitRuntime {
    fn drop(&mut self) {
        if let Some(Sweeper { task, .. }) = self.sweeper.get_mut().take() {
            debug!("Rate limit runtime dropped without shutdown, aborting sweep task");
            task.abort();
        }
    }
}

impl std::fmt::Debug for RateLimitRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitRuntime")
            .field("sweep_interval", &self.sweep_interval)
            .field("entries", &self.store.len())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn sweep_loop(
    store: Arc<dyn CounterStore>,
    interval: Duration,
    mut stopped: oneshot::Receiver<()>,
) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = ticker.tick() => run_sweep(store.as_ref()),
        }
    }

    debug!("Sweep task exiting");
}

fn run_sweep(store: &dyn CounterStore) {
    match panic::catch_unwind(AssertUnwindSafe(|| store.sweep())) {
        Ok(stats) if stats.removed() > 0 => info!(
            expired = stats.expired,
            invalid = stats.invalid,
            retained = stats.retained,
            "Swept rate limit counters"
        ),
        Ok(stats) => debug!(retained = stats.retained, "Sweep found nothing to remove"),
        Err(_) => error!("Rate limit sweep panicked, will retry on next tick"),
    }
}
