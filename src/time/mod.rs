//! Wall-clock access for lease deadlines.
//!
//! Lease records carry absolute Unix-millisecond deadlines, so every replica
//! judges expiry against its own wall clock. [`Clock`] makes that source
//! injectable; [`ManualClock`] lets tests step time across lease expiry
//! without sleeping.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Get current Unix timestamp in milliseconds.
///
/// Returns 0 if system time is before UNIX epoch instead of panicking.
#[inline]
pub fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Injectable time source.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current Unix timestamp in milliseconds.
    fn now_unix_ms(&self) -> u64;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_unix_ms(&self) -> u64 {
        now_unix_ms()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current_ms: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at `initial_ms`.
    pub fn new(initial_ms: u64) -> Self {
        Self {
            current_ms: Arc::new(AtomicU64::new(initial_ms)),
        }
    }

    /// Move time forward by `delta_ms`.
    pub fn advance_ms(&self, delta_ms: u64) {
        self.current_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix_ms(&self) -> u64 {
        self.current_ms.load(Ordering::SeqCst)
    }
}
