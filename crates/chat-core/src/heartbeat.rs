use std::time::Duration;

use tokio::time::Instant;

/// Detects a silent push connection.
///
/// The connection counts as lost once no inbound frame (data or heartbeat)
/// arrived for `interval + grace`. A zero interval disables detection.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    grace: Duration,
    last_inbound: Instant,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, grace: Duration, now: Instant) -> Self {
        Self {
            interval,
            grace,
            last_inbound: now,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn record_inbound(&mut self, now: Instant) {
        if now > self.last_inbound {
            self.last_inbound = now;
        }
    }

    /// Start a fresh window, used right after a handshake.
    pub fn reset(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.is_enabled()
            .then(|| self.last_inbound + self.interval + self.grace)
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }
}
