//! Time source abstraction.
//!
//! All timestamps are unix seconds (`u64`). Client operations take `now` as a
//! parameter so tests can advance time freely; the server consults a [`Clock`]
//! so it can run on wall clock in production and on controlled time in tests.

use std::time::{SystemTime, UNIX_EPOCH};

/// A source of the current unix time in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs())
    }
}
