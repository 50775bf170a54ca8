//! Performance measurement for the fitting steps.

use std::{
    fmt,
    sync::Mutex,
    time::{Duration, Instant},
};

/// A timer that accumulates the time spent in an operation.
///
/// Timers are shared between all fits run by the same [`ModelFitter`], which may happen on several
/// threads at once, so the collected state is behind a [`Mutex`].
///
/// [`ModelFitter`]: crate::fitting::ModelFitter
pub struct Timer {
    name: &'static str,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    total: Duration,
    count: usize,
}

impl Timer {
    /// Creates a new timer.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(State::default()),
        }
    }

    /// Returns the name this timer was created with.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Invokes a closure, measuring and recording the time it takes.
    pub fn time<T>(&self, timee: impl FnOnce() -> T) -> T {
        let _guard = self.start();
        timee()
    }

    /// Starts timing an operation using a drop guard.
    ///
    /// When the returned [`TimerGuard`] is dropped, the time between the call to `start` and the
    /// drop is measured and recorded.
    pub fn start(&self) -> TimerGuard<'_> {
        TimerGuard {
            start: Instant::now(),
            timer: self,
        }
    }

    /// Returns the number of recorded measurements.
    pub fn count(&self) -> usize {
        self.lock().count
    }

    /// Returns the average duration of all recorded measurements.
    pub fn average(&self) -> Duration {
        let state = self.lock();
        match u32::try_from(state.count) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(count) => state.total / count,
        }
    }

    /// Discards all recorded measurements.
    pub fn reset(&self) {
        *self.lock() = State::default();
    }

    fn stop(&self, start: Instant) {
        let duration = start.elapsed();
        let mut state = self.lock();
        state.total += duration;
        state.count += 1;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave `State` inconsistent.
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.count();
        let avg_ms = self.average().as_secs_f32() * 1000.0;
        write!(f, "{}: {count}x{avg_ms:.02}ms", self.name)
    }
}

/// Cloning a timer resets its collected timings.
impl Clone for Timer {
    fn clone(&self) -> Self {
        Self::new(self.name)
    }
}

/// Guard returned by [`Timer::start`]. Stops timing the operation when dropped.
pub struct TimerGuard<'a> {
    start: Instant,
    timer: &'a Timer,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.timer.stop(self.start);
    }
}
