use std::time::Duration;

/// Exponential reconnect schedule: `base * 2^(attempt - 1)` for attempts
/// `1..=max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Backoff { base, max_attempts }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before reconnect attempt `attempt`, or `None` once the budget is spent.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_budget_is_spent() {
        let backoff = Backoff::new(Duration::from_secs(1), 5);
        let delays: Vec<_> = (1..=6).map(|n| backoff.delay(n)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(4)),
                Some(Duration::from_secs(8)),
                Some(Duration::from_secs(16)),
                None,
            ]
        );
    }

    #[test]
    fn zero_attempts_never_reconnects() {
        let backoff = Backoff::new(Duration::from_millis(10), 0);
        assert_eq!(backoff.delay(1), None);
        assert_eq!(backoff.delay(0), None);
    }

    #[test]
    fn large_attempt_counts_saturate() {
        let backoff = Backoff::new(Duration::from_secs(1), 64);
        assert!(backoff.delay(40).is_some());
    }
}
