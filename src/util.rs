//! Utility helpers shared across the pipeline.
//!
//! This module exposes the injectable clock used by the rate limiter and
//! the explicit `Outcome` type used by stages whose failures are absorbed
//! rather than propagated (catalog fetch, conversation logging).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of wall-clock time in Unix milliseconds.  Production code uses
/// [`SystemClock`]; tests substitute a [`ManualClock`] so that window
/// boundaries can be crossed deterministically.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Result of a stage that is allowed to degrade.
///
/// `Ok` carries the full value.  `Degraded` carries a substitute value and
/// the cause that forced it, so the caller can keep going while still
/// seeing (and counting) the failure.  `Err` means no usable value exists.
#[derive(Debug)]
pub enum Outcome<T, E> {
    Ok(T),
    Degraded { value: T, cause: E },
    Err(E),
}

impl<T, E> Outcome<T, E> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Ok(v) | Outcome::Degraded { value: v, .. } => Some(v),
            Outcome::Err(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Ok(v) | Outcome::Degraded { value: v, .. } => Some(v),
            Outcome::Err(_) => None,
        }
    }

    pub fn cause(&self) -> Option<&E> {
        match self {
            Outcome::Ok(_) => None,
            Outcome::Degraded { cause, .. } | Outcome::Err(cause) => Some(cause),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded { .. })
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Outcome::Err(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_ms(), 1_250);
        clock.set(5);
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn degraded_outcome_still_exposes_value_and_cause() {
        let degraded: Outcome<Vec<u8>, &str> = Outcome::Degraded {
            value: Vec::new(),
            cause: "catalog offline",
        };
        assert!(degraded.is_degraded());
        assert_eq!(degraded.value().map(Vec::len), Some(0));
        assert_eq!(degraded.cause(), Some(&"catalog offline"));

        let failed: Outcome<(), &str> = Outcome::Err("insert failed");
        assert!(failed.is_err());
        assert!(failed.value().is_none());
    }
}
