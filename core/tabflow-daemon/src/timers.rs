//! In-process one-shot timers.
//!
//! Named timers at absolute epoch-millisecond deadlines, served by one thread
//! parked on a condition variable. Scheduling an existing name replaces it.
//! Timers do not survive a restart; reconciliation re-arms them from state.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tabflow_core::{now_ms, Millis};

#[derive(Default)]
struct TimerTable {
    deadlines: HashMap<String, Millis>,
    shutdown: bool,
}

struct Shared {
    table: Mutex<TimerTable>,
    wakeup: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TimerTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct TimerService {
    shared: Arc<Shared>,
}

impl TimerService {
    /// Spawns the timer thread. `on_fire` runs on that thread with the timer name.
    pub fn start(on_fire: impl Fn(String) + Send + 'static) -> Self {
        let shared = Arc::new(Shared {
            table: Mutex::new(TimerTable::default()),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        thread::spawn(move || run(worker, on_fire));
        Self { shared }
    }

    pub fn schedule(&self, name: &str, at: Millis) {
        self.shared.lock().deadlines.insert(name.to_string(), at);
        self.shared.wakeup.notify_one();
    }

    pub fn cancel(&self, name: &str) {
        if self.shared.lock().deadlines.remove(name).is_some() {
            self.shared.wakeup.notify_one();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().deadlines.len()
    }

    #[cfg(test)]
    pub fn deadline(&self, name: &str) -> Option<Millis> {
        self.shared.lock().deadlines.get(name).copied()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wakeup.notify_one();
    }
}

fn run(shared: Arc<Shared>, on_fire: impl Fn(String)) {
    let mut table = shared.lock();
    loop {
        if table.shutdown {
            return;
        }

        let next = table
            .deadlines
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(name, at)| (name.clone(), *at));

        table = match next {
            None => shared
                .wakeup
                .wait(table)
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
            Some((name, at)) => {
                let now = now_ms();
                if at <= now {
                    table.deadlines.remove(&name);
                    drop(table);
                    tracing::debug!(timer = %name, late_ms = now - at, "Timer fired");
                    on_fire(name);
                    shared.lock()
                } else {
                    let wait = Duration::from_millis((at - now) as u64);
                    shared
                        .wakeup
                        .wait_timeout(table, wait)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
            }
        };
    }
}
