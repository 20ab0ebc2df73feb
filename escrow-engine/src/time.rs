//! Time source abstraction
//!
//! All wall-clock deadlines (pending timeout, deposit timeout, dispute
//! window) are evaluated against a [`TimeSource`] so sweeps can be driven
//! deterministically in tests.

use chrono::{DateTime, Duration, Utc};
use std::sync::RwLock;

/// Provider of the current wall-clock time
pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production time source backed by the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced time source
#[derive(Debug)]
pub struct ManualTimeSource {
    time: RwLock<DateTime<Utc>>,
}

impl ManualTimeSource {
    pub fn new(initial: DateTime<Utc>) -> Self {
        Self {
            time: RwLock::new(initial),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut time) = self.time.write() {
            *time += by;
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut time) = self.time.write() {
            *time = at;
        }
    }
}

impl Default for ManualTimeSource {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> DateTime<Utc> {
        self.time.read().map(|time| *time).unwrap_or_else(|_| Utc::now())
    }
}
