//! Injectable wall-clock abstraction.
//!
//! Every time-dependent decision in the rotation subsystem (schedule
//! deadlines, `started`/`last_rotated` stamps) goes through an injected
//! [`Clock`] rather than reading system time directly. This keeps the
//! transition engine a pure function and makes schedule-driven behavior
//! deterministic under test.
//!
//! Lock poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Trait for clock implementations.
pub trait Clock: Send + Sync {
    /// Returns the current wall-clock time in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// System clock that reads the real system time.
///
/// This is the default clock for production use.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock pinned to an explicit instant.
///
/// Cloning yields a handle onto the same instant, so a test can hold one
/// handle, hand another to the component under test, and move time forward
/// with [`FixedClock::advance`].
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl FixedClock {
    /// Creates a fixed clock pinned to `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(now)),
        }
    }

    /// Re-pins the clock to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write().expect("clock lock poisoned") = now;
    }

    /// Moves the clock forward by `step`.
    ///
    /// # Panics
    ///
    /// Panics if `step` does not fit a chrono duration. Test schedules are
    /// always far below that bound.
    pub fn advance(&self, step: Duration) {
        let step = chrono::Duration::from_std(step).expect("clock step out of range");
        let mut now = self.now.write().expect("clock lock poisoned");
        *now += step;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().expect("clock lock poisoned")
    }
}
