use std::time::Duration;

/// Exponential retry delay with a cap and a reset, used only on
/// registration/watch errors — never on clean shutdown.
///
/// Produces `d_0, d_1, ..., d_k, cap, cap, ...` where
/// `d_i = min(initial * mult^i, cap)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    mult: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration, mult: u32) -> Self {
        let mult = mult.max(1);
        Self {
            initial,
            cap,
            mult,
            current: initial.min(cap),
        }
    }

    /// A `Backoff` with the component defaults: `initial = 500ms`,
    /// `cap = ttl_secs`, `mult = 2`.
    pub fn with_ttl_cap(ttl_secs: i64) -> Self {
        Self::new(
            Duration::from_millis(500),
            Duration::from_secs(ttl_secs.max(1) as u64),
            2,
        )
    }

    /// Returns the next delay in the sequence and advances the counter.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(self.mult).min(self.cap);
        delay
    }

    /// Returns the sequence to `d_0`.
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.cap);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(5), 2)
    }
}
