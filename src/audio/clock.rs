//! Free-running output clock abstraction.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time reference the playback scheduler plans against.
///
/// Read-only to the core; implementations must never go backwards.
pub trait OutputClock: Send + Sync {
    /// Time elapsed since the clock's epoch.
    fn now(&self) -> Duration;
}

/// Real clock anchored at creation, backed by `Instant`.
pub struct StreamClock {
    epoch: Instant,
}

impl StreamClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { epoch: Instant::now() })
    }
}

impl OutputClock for StreamClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}
