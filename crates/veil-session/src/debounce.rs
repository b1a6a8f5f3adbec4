// SPDX-License-Identifier: Apache-2.0
//! Cancellable single-fire broadcast timer.
//!
//! Each `schedule` arms exactly one pending fire at `now + interval`
//! and cancels any prior pending fire (generation counter). The
//! waiting thread parks on a condvar so cancellation and disposal
//! wake it immediately, and it never holds the session lock while
//! waiting. After [`Debouncer::dispose`], nothing fires again.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct DebounceState {
    generation: u64,
    disposed: bool,
}

/// Cancellable delayed-execution primitive for debounced broadcasts.
#[derive(Debug)]
pub(crate) struct Debouncer {
    shared: Arc<(Mutex<DebounceState>, Condvar)>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self {
            shared: Arc::new((
                Mutex::new(DebounceState {
                    generation: 0,
                    disposed: false,
                }),
                Condvar::new(),
            )),
        }
    }
}

impl Debouncer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Schedules `task` to run after `delay`, cancelling any pending
    /// fire. A zero delay still goes through the timer thread; callers
    /// wanting synchronous execution run the task themselves.
    pub(crate) fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let armed_generation = {
            let mut state = lock(&self.shared.0);
            if state.disposed {
                return;
            }
            state.generation += 1;
            self.shared.1.notify_all();
            state.generation
        };

        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || {
            let deadline = Instant::now() + delay;
            let mut state = lock(&shared.0);
            loop {
                if state.disposed || state.generation != armed_generation {
                    return; // cancelled or superseded
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (next, _timeout) = shared
                    .1
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                state = next;
            }
            drop(state);
            task();
        });
    }

    /// Cancels any pending fire without disposing.
    pub(crate) fn cancel(&self) {
        let mut state = lock(&self.shared.0);
        state.generation += 1;
        self.shared.1.notify_all();
    }

    /// Cancels pending fires and refuses all future schedules.
    pub(crate) fn dispose(&self) {
        let mut state = lock(&self.shared.0);
        state.disposed = true;
        state.generation += 1;
        self.shared.1.notify_all();
    }
}

fn lock(mutex: &Mutex<DebounceState>) -> MutexGuard<'_, DebounceState> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wait_for(fired: &Arc<AtomicUsize>, expected: usize, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        while Instant::now() < deadline {
            if fired.load(Ordering::SeqCst) == expected {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        fired.load(Ordering::SeqCst) == expected
    }

    #[test]
    fn fires_once_after_the_delay() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        debouncer.schedule(Duration::from_millis(10), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait_for(&fired, 1, Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rescheduling_cancels_the_pending_fire() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f1 = Arc::clone(&fired);
        debouncer.schedule(Duration::from_millis(50), move || {
            f1.fetch_add(10, Ordering::SeqCst);
        });
        let f2 = Arc::clone(&fired);
        debouncer.schedule(Duration::from_millis(10), move || {
            f2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait_for(&fired, 1, Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nothing_fires_after_dispose() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        debouncer.schedule(Duration::from_millis(20), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        debouncer.dispose();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Schedules after dispose are refused outright.
        let f = Arc::clone(&fired);
        debouncer.schedule(Duration::from_millis(1), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_stops_the_pending_fire_but_allows_new_ones() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        debouncer.schedule(Duration::from_millis(20), move || {
            f.fetch_add(10, Ordering::SeqCst);
        });
        debouncer.cancel();
        let f = Arc::clone(&fired);
        debouncer.schedule(Duration::from_millis(5), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait_for(&fired, 1, Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
