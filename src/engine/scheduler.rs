use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::engine::registry::RegistryListener;
use crate::engine::task::TaskId;

/// A timer firing for one task.
///
/// `generation` identifies the arming that produced the tick so ticks issued
/// before a reconfiguration can be told apart from current ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub id: TaskId,
    pub generation: u64,
}

struct TimerSlot {
    interval_seconds: u64,
    generation: u64,
    handle: JoinHandle<()>,
}

/// One cancellable recurring timer per task.
///
/// Ticks are not executed here; they are sent to the receiver returned by
/// [`Scheduler::new`]. Arming always disarms the previous timer first.
pub struct Scheduler {
    timers: Mutex<HashMap<TaskId, TimerSlot>>,
    next_generation: AtomicU64,
    ticks: mpsc::UnboundedSender<Tick>,
}

impl Scheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Tick>) {
        let (ticks, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            timers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            ticks,
        };
        (scheduler, receiver)
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<TaskId, TimerSlot>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the recurring interval of a task; 0 disables it.
    ///
    /// Must be called from within a tokio runtime when `seconds > 0`.
    pub fn configure(&self, id: TaskId, seconds: u64) {
        let mut timers = self.timers();

        if let Some(previous) = timers.remove(&id) {
            previous.handle.abort();
            debug!(
                "Disarmed timer for task {} ({}s, generation {})",
                id, previous.interval_seconds, previous.generation
            );
        }

        if seconds == 0 {
            return;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let period = Duration::from_secs(seconds);
        let handle = tokio::spawn(run_timer(id, generation, period, self.ticks.clone()));

        timers.insert(
            id,
            TimerSlot {
                interval_seconds: seconds,
                generation,
                handle,
            },
        );
        info!("Armed timer for task {} every {}s", id, seconds);
    }

    pub fn cancel(&self, id: TaskId) {
        self.configure(id, 0);
    }

    pub fn cancel_all(&self) {
        let mut timers = self.timers();
        let count = timers.len();
        for (_, slot) in timers.drain() {
            slot.handle.abort();
        }
        if count > 0 {
            debug!("Disarmed {} timers", count);
        }
    }

    /// Whether `tick` comes from the timer currently armed for its task
    pub fn is_current(&self, tick: &Tick) -> bool {
        self.timers()
            .get(&tick.id)
            .map_or(false, |slot| slot.generation == tick.generation)
    }

    pub fn interval_of(&self, id: TaskId) -> Option<u64> {
        self.timers().get(&id).map(|slot| slot.interval_seconds)
    }

    pub fn is_armed(&self, id: TaskId) -> bool {
        self.timers().contains_key(&id)
    }

    pub fn active_timers(&self) -> usize {
        self.timers().len()
    }
}

impl RegistryListener for Scheduler {
    fn interval_changed(&self, id: TaskId, seconds: u64) {
        self.configure(id, seconds);
    }

    fn task_removed(&self, id: TaskId) {
        self.cancel(id);
    }

    fn registry_cleared(&self) {
        self.cancel_all();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn run_timer(
    id: TaskId,
    generation: u64,
    period: Duration,
    ticks: mpsc::UnboundedSender<Tick>,
) {
    let mut interval = time::interval_at(Instant::now() + period, period);
    // Ticks missed while the runtime was busy are dropped, not queued
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        debug!("Timer tick for task {}", id);
        if ticks.send(Tick { id, generation }).is_err() {
            break;
        }
    }
}
