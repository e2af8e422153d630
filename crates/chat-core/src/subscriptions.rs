use std::collections::HashMap;

use crate::error::ChatError;

/// Transport-level identity of one channel subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    /// Subscription id sent with `SUBSCRIBE`/`UNSUBSCRIBE` (`sub-N`).
    pub id: String,
    /// Destination channel.
    pub channel: String,
}

/// Result of [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// New subscription; the transport must subscribe.
    Created(SubscriptionHandle),
    /// Handler replaced on an existing subscription; nothing to send.
    Replaced(SubscriptionHandle),
}

impl SubscribeOutcome {
    /// Handle of the subscription, whether new or replaced.
    pub fn handle(&self) -> &SubscriptionHandle {
        match self {
            SubscribeOutcome::Created(handle) | SubscribeOutcome::Replaced(handle) => handle,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry<H> {
    handle: SubscriptionHandle,
    handler: H,
}

/// Channel table with at most one subscription per destination.
///
/// The registry is attached while a connection is live; `release_all`
/// detaches and empties it in one step so no handler outlives the connection.
#[derive(Debug, Clone)]
pub struct SubscriptionRegistry<H> {
    entries: HashMap<String, Entry<H>>,
    attached: bool,
    next_id: u64,
}

impl<H> Default for SubscriptionRegistry<H> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            attached: false,
            next_id: 0,
        }
    }
}

impl<H: Clone> SubscriptionRegistry<H> {
    /// Bind the registry to a freshly established connection.
    pub fn attach(&mut self) {
        self.attached = true;
    }

    /// Whether subscribe calls currently reach a live connection.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no channel is subscribed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `channel` has an active subscription.
    pub fn contains(&self, channel: &str) -> bool {
        self.entries.contains_key(channel)
    }

    /// Register `handler` for `channel`.
    ///
    /// An existing subscription keeps its handle and gets the new handler.
    /// Fails with `not_connected` while detached.
    pub fn subscribe(
        &mut self,
        channel: impl Into<String>,
        handler: H,
    ) -> Result<SubscribeOutcome, ChatError> {
        let channel = channel.into();
        if !self.attached {
            return Err(ChatError::not_connected(format!("subscribe {channel}")));
        }

        if let Some(entry) = self.entries.get_mut(&channel) {
            entry.handler = handler;
            return Ok(SubscribeOutcome::Replaced(entry.handle.clone()));
        }

        self.next_id += 1;
        let handle = SubscriptionHandle {
            id: format!("sub-{}", self.next_id),
            channel: channel.clone(),
        };
        self.entries.insert(
            channel,
            Entry {
                handle: handle.clone(),
                handler,
            },
        );
        Ok(SubscribeOutcome::Created(handle))
    }

    /// Remove `channel`; unknown channels are a no-op.
    pub fn unsubscribe(&mut self, channel: &str) -> Option<SubscriptionHandle> {
        self.entries.remove(channel).map(|entry| entry.handle)
    }

    /// Snapshot of the handler for `channel`, taken before dispatch.
    pub fn handler_for(&self, channel: &str) -> Option<H> {
        self.entries.get(channel).map(|entry| entry.handler.clone())
    }

    /// Detach from the connection and drop every subscription.
    pub fn release_all(&mut self) -> Vec<SubscriptionHandle> {
        self.attached = false;
        let mut handles = self
            .entries
            .drain()
            .map(|(_, entry)| entry.handle)
            .collect::<Vec<_>>();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }
}
