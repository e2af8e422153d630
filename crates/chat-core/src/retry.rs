use std::time::Duration;

/// Linear backoff with a hard cap on automatic reconnect attempts.
///
/// Attempt `n` (1-based) waits `base_delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base_delay_ms: u64,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_attempts,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before `attempt`, or `None` once the attempt cap is exceeded.
    ///
    /// A server retry hint wins when it is longer than the computed delay.
    pub fn delay_for_attempt(
        &self,
        attempt: u32,
        retry_after_hint_ms: Option<u64>,
    ) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let calculated = self.base_delay_ms.saturating_mul(u64::from(attempt));
        let hinted = retry_after_hint_ms.unwrap_or(0);
        Some(Duration::from_millis(calculated.max(hinted)))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(5_000, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_waits_base_delay() {
        let policy = ReconnectPolicy::new(250, 5);
        assert_eq!(
            policy.delay_for_attempt(1, None),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn scales_with_attempt_number() {
        let policy = ReconnectPolicy::new(100, 5);
        assert_eq!(
            policy.delay_for_attempt(4, None),
            Some(Duration::from_millis(400))
        );
    }

    #[test]
    fn stops_after_max_attempts() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.delay_for_attempt(5, None),
            Some(Duration::from_millis(25_000))
        );
        assert_eq!(policy.delay_for_attempt(6, None), None);
        assert_eq!(policy.delay_for_attempt(0, None), None);
    }

    #[test]
    fn honors_retry_after_hint_when_larger() {
        let policy = ReconnectPolicy::new(500, 5);
        assert_eq!(
            policy.delay_for_attempt(1, Some(10_000)),
            Some(Duration::from_millis(10_000))
        );
    }
}
