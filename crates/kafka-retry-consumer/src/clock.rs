//! Time abstraction so stale-lease reclaim and maintenance sweeps can be
//! tested without sleeping real wall-clock seconds.

use chrono::{DateTime, Utc};

/// A source of "now". Production code uses [`SystemClock`]; tests use
/// `testkit::FakeClock`.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Delegates to [`Utc::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
