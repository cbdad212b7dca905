use std::time::Duration;

/// Bounded retry policy shared by the id allocator and the status poller.
///
/// Attempt counts are always finite and the interval is fixed; there is no
/// exponential backoff because both call sites retry against services whose
/// failure modes are either instant (conditional-write collision) or resolved
/// by a short fixed wait (merge still in flight).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    interval: Duration,
}

impl RetryPolicy {
    /// Create a policy with a fixed wait between attempts
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Create a policy that retries immediately, with no wait
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Total number of attempts allowed (including the first)
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Fixed interval between attempts
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleep for one interval before the next attempt
    pub async fn wait(&self) {
        if !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_bound() {
        let policy = RetryPolicy::immediate(5);
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.interval(), Duration::ZERO);
    }

    #[test]
    fn test_at_least_one_attempt() {
        let policy = RetryPolicy::immediate(0);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_wait_returns_immediately() {
        let policy = RetryPolicy::immediate(3);
        // Must not hang
        policy.wait().await;
    }
}
