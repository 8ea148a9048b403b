use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::Duration,
};
use tokio::time::Instant;

#[derive(Debug, PartialEq, Eq, Clone)]
struct TimerKey {
    execute_at: Instant,
    task_id: u64,
}

impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.execute_at
            .cmp(&other.execute_at)
            .then(self.task_id.cmp(&other.task_id))
    }
}

impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Deadline-ordered set of pending timer values, polled by the
/// transaction layer's timer loop.
pub struct Timer<T> {
    tasks: RwLock<BTreeMap<TimerKey, T>>,
    last_task_id: AtomicU64,
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            tasks: RwLock::new(BTreeMap::new()),
            last_task_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.read().map(|ts| ts.len()).unwrap_or_default()
    }

    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, execute_at: Instant, value: T) -> u64 {
        let task_id = self.last_task_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tasks) = self.tasks.write() {
            tasks.insert(
                TimerKey {
                    execute_at,
                    task_id,
                },
                value,
            );
        }
        task_id
    }

    /// Removes and returns every value due at or before `now`, earliest first.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let Ok(mut tasks) = self.tasks.write() else {
            return vec![];
        };
        let later = tasks.split_off(&TimerKey {
            execute_at: now,
            task_id: u64::MAX,
        });
        let due = std::mem::replace(&mut *tasks, later);
        due.into_values().collect()
    }

    pub fn clear(&self) {
        if let Ok(mut tasks) = self.tasks.write() {
            tasks.clear();
        }
    }
}
