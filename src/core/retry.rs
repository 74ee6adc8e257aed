//! Bounded exponential backoff for blocking probes.

use std::time::Duration;

/// Backoff policy: delays start at `initial`, double after each failure, are
/// capped at `max_delay`, and stop once their sum would exceed `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max_delay: Duration,
    pub window: Duration,
}

impl Backoff {
    /// Database reachability: 2s initial, 30s cap.
    pub fn database(window_secs: u64) -> Self {
        Self {
            initial: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            window: Duration::from_secs(window_secs),
        }
    }

    /// Delays slept between attempts. Attempts = delays + 1.
    pub fn schedule(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        if self.initial.is_zero() {
            return delays;
        }
        let mut next = self.initial;
        let mut total = Duration::ZERO;
        while total + next <= self.window {
            total += next;
            delays.push(next);
            next = std::cmp::min(next.saturating_mul(2), self.max_delay);
        }
        delays
    }

    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.schedule().len()).map_or(u32::MAX, |n| n.saturating_add(1))
    }
}

/// All attempts failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted {
    pub attempts: u32,
    pub waited: Duration,
    pub last_error: String,
}

/// Run `op` until it succeeds or the backoff schedule is used up.
/// `op` receives the 1-based attempt number.
pub fn retry<T>(
    backoff: &Backoff,
    op: impl FnMut(u32) -> Result<T, String>,
) -> Result<T, Exhausted> {
    retry_with(backoff, std::thread::sleep, op)
}

/// [`retry`] with an explicit sleep function.
pub fn retry_with<T>(
    backoff: &Backoff,
    mut sleep: impl FnMut(Duration),
    mut op: impl FnMut(u32) -> Result<T, String>,
) -> Result<T, Exhausted> {
    let mut delays = backoff.schedule().into_iter();
    let mut attempt = 0u32;
    let mut waited = Duration::ZERO;
    loop {
        attempt += 1;
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) => match delays.next() {
                Some(delay) => {
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    sleep(delay);
                    waited += delay;
                }
                None => {
                    return Err(Exhausted {
                        attempts: attempt,
                        waited,
                        last_error: e,
                    })
                }
            },
        }
    }
}
