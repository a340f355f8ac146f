//! Timestamp provider external interface: `now() -> u64`,
//! millisecond epoch. Trait-object so callers (and tests) can substitute a
//! deterministic clock.

use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| crate::num::u128_to_u64_saturating(d.as_millis()))
            .unwrap_or(0)
    }
}
