use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::types::ConversationKey;

/// Debounces outbound read receipts per conversation.
///
/// The first arrival schedules a receipt `delay` later; arrivals before the
/// deadline fold into that same receipt.
#[derive(Debug, Clone)]
pub struct ReadReceiptScheduler {
    delay: Duration,
    due: HashMap<ConversationKey, Instant>,
}

impl ReadReceiptScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            due: HashMap::new(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule a receipt for `key`; returns `false` when one is already due.
    pub fn schedule(&mut self, key: ConversationKey, now: Instant) -> bool {
        if self.due.contains_key(&key) {
            return false;
        }
        self.due.insert(key, now + self.delay);
        true
    }

    pub fn is_scheduled(&self, key: ConversationKey) -> bool {
        self.due.contains_key(&key)
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.due.values().min().copied()
    }

    /// Remove and return every conversation whose deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Vec<ConversationKey> {
        let mut ready = self
            .due
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        ready.sort();
        for key in &ready {
            self.due.remove(key);
        }
        ready
    }

    pub fn cancel(&mut self, key: ConversationKey) -> bool {
        self.due.remove(&key).is_some()
    }

    pub fn clear(&mut self) {
        self.due.clear();
    }
}
