//! Utility functions for sharekv

use rand::Rng;
use std::time::Duration;

/// Lock-contention backoff for the election loop.
///
/// Two regimes, picked per attempt:
/// - the store is locked but nobody answered on the socket: some other process
///   is mid-promotion, so wait the fixed retry delay;
/// - we were following a leader that just went away: retry at once, then back
///   off exponentially up to the same fixed delay while the OS releases the lock.
#[derive(Debug, Clone)]
pub struct Backoff {
    retry_delay: Duration,
    initial: Duration,
    contended: u32,
}

impl Backoff {
    pub fn new(retry_delay: Duration, initial: Duration) -> Self {
        Self {
            retry_delay,
            initial,
            contended: 0,
        }
    }

    /// Delay before the next attempt after the engine reported the lock held.
    pub fn next_delay(&mut self, had_connection: bool) -> Duration {
        if !had_connection {
            return jittered(self.retry_delay);
        }

        let attempt = self.contended;
        self.contended = self.contended.saturating_add(1);
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.retry_delay)
    }

    /// Forget past contention, e.g. after a successful handshake.
    pub fn reset(&mut self) {
        self.contended = 0;
    }
}

/// Add up to 10% random jitter so racing followers do not retry in lockstep.
pub fn jittered(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
