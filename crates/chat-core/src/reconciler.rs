//! Conversation and message state merged from push deliveries, send
//! responses, and history fetches.

use std::collections::{HashMap, HashSet};

use chrono::{NaiveDateTime, TimeDelta};
use tracing::{debug, trace, warn};

use crate::{
    error::ChatError,
    timeline::{AppendOutcome, ConversationTimeline, PendingMessage},
    types::{
        ChatMessage, ConversationKey, ConversationSummary, MessageId, SendRequest, TimelineEntry,
        UserId,
    },
};

/// Identifies one history request; stale tickets are discarded on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryTicket {
    pub conversation: ConversationKey,
    generation: u64,
}

/// Where an inbound message landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Offered to the open conversation's timeline.
    OpenTimeline(AppendOutcome),
    /// Recorded on a background conversation's summary.
    SummaryUpdated {
        conversation: ConversationKey,
        unread_count: u32,
    },
}

/// Result of marking a conversation read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Messages whose read flag flipped in the open timeline.
    pub flipped: usize,
    /// Unread count before the reset.
    pub previous_unread: u32,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    own_user_id: UserId,
    timeline_max_items: usize,
    dedupe_window: TimeDelta,
    conversations: Vec<ConversationSummary>,
    open: Option<ConversationTimeline>,
    in_flight: HashMap<String, (ConversationKey, PendingMessage)>,
    unread_ids: HashMap<ConversationKey, HashSet<MessageId>>,
    load_generation: u64,
}

impl Reconciler {
    pub fn new(own_user_id: UserId, timeline_max_items: usize, dedupe_window: TimeDelta) -> Self {
        Self {
            own_user_id,
            timeline_max_items: timeline_max_items.max(1),
            dedupe_window,
            conversations: Vec::new(),
            open: None,
            in_flight: HashMap::new(),
            unread_ids: HashMap::new(),
            load_generation: 0,
        }
    }

    /// Session user the reconciler works for.
    pub fn own_user_id(&self) -> UserId {
        self.own_user_id
    }

    /// Known conversation summaries, in the order they were listed or first seen.
    pub fn conversations(&self) -> &[ConversationSummary] {
        &self.conversations
    }

    /// Summary for `key`, if known.
    pub fn conversation(&self, key: ConversationKey) -> Option<&ConversationSummary> {
        self.conversations.iter().find(|summary| summary.id == key)
    }

    /// Key of the open conversation, if any.
    pub fn open_key(&self) -> Option<ConversationKey> {
        self.open.as_ref().map(ConversationTimeline::key)
    }

    /// Timeline of the open conversation.
    pub fn timeline(&self) -> Option<&ConversationTimeline> {
        self.open.as_ref()
    }

    /// Render rows of the open conversation.
    pub fn open_entries(&self) -> Option<(ConversationKey, Vec<TimelineEntry>)> {
        self.open
            .as_ref()
            .map(|timeline| (timeline.key(), timeline.entries()))
    }

    /// Replace summaries with the server list, keeping local-only conversations.
    pub fn replace_conversations(&mut self, conversations: Vec<ConversationSummary>) {
        let listed = conversations
            .iter()
            .map(|summary| summary.id)
            .collect::<HashSet<_>>();
        let local_only = self
            .conversations
            .drain(..)
            .filter(|summary| !listed.contains(&summary.id))
            .collect::<Vec<_>>();

        let local_keys = local_only
            .iter()
            .map(|summary| summary.id)
            .collect::<HashSet<_>>();
        self.conversations = conversations;
        self.conversations.extend(local_only);
        // Server counts are authoritative for listed conversations.
        self.unread_ids.retain(|key, _| local_keys.contains(key));
        debug!(
            conversation_count = self.conversations.len(),
            "conversation list replaced"
        );
    }

    /// Insert a summary, or refresh the counterparty name of an existing one.
    pub fn upsert_conversation(&mut self, summary: ConversationSummary) -> ConversationSummary {
        if let Some(existing) = self
            .conversations
            .iter_mut()
            .find(|existing| existing.id == summary.id)
        {
            if !summary.other_user_name.trim().is_empty() {
                existing.other_user_name = summary.other_user_name;
            }
            return existing.clone();
        }
        self.conversations.push(summary.clone());
        summary
    }

    /// Make `key` the open conversation and issue a history ticket for it.
    pub fn open(&mut self, key: ConversationKey) -> HistoryTicket {
        self.load_generation += 1;
        if self.open_key() != Some(key) {
            let mut timeline = ConversationTimeline::new(
                key,
                self.own_user_id,
                self.timeline_max_items,
                self.dedupe_window,
            );
            let mut in_flight = self
                .in_flight
                .values()
                .filter(|(pending_key, _)| *pending_key == key)
                .map(|(_, pending)| pending.clone())
                .collect::<Vec<_>>();
            in_flight.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            for pending in in_flight {
                timeline.push_pending(pending);
            }
            self.open = Some(timeline);
            debug!(conversation = %key, "conversation opened");
        }
        HistoryTicket {
            conversation: key,
            generation: self.load_generation,
        }
    }

    /// Leave the open conversation; outstanding history loads become stale.
    pub fn close(&mut self) -> Option<ConversationKey> {
        self.load_generation += 1;
        let closed = self.open.take().map(|timeline| timeline.key());
        if let Some(key) = closed {
            debug!(conversation = %key, "conversation closed");
        }
        closed
    }

    /// Merge a fetched history; returns `false` when the ticket is stale.
    pub fn apply_history(&mut self, ticket: HistoryTicket, fetched: Vec<ChatMessage>) -> bool {
        let current = ticket.generation == self.load_generation
            && self.open_key() == Some(ticket.conversation);
        let Some(timeline) = self.open.as_mut().filter(|_| current) else {
            debug!(
                conversation = %ticket.conversation,
                "discarding stale history load"
            );
            return false;
        };

        trace!(
            conversation = %ticket.conversation,
            fetched = fetched.len(),
            "merging history"
        );
        timeline.merge_history(fetched);
        let latest = timeline.messages().last().cloned();
        if let Some(latest) = latest
            && let Some(summary) = self.summary_mut(ticket.conversation)
        {
            summary.record_last_message(&latest);
        }
        true
    }

    /// Validate and record an optimistic send; returns the persistence request.
    pub fn prepare_send(
        &mut self,
        key: ConversationKey,
        client_txn_id: impl Into<String>,
        text: &str,
        now: NaiveDateTime,
    ) -> Result<SendRequest, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::validation(
                "empty_message",
                "message text must not be empty",
            ));
        }
        let receiver_id = key.other(self.own_user_id).ok_or_else(|| {
            ChatError::validation(
                "not_a_participant",
                format!("user {} is not part of {key}", self.own_user_id),
            )
        })?;
        let client_txn_id = client_txn_id.into();
        if self.in_flight.contains_key(&client_txn_id) {
            return Err(ChatError::validation(
                "duplicate_transaction",
                format!("transaction {client_txn_id} is already in flight"),
            ));
        }

        let pending = PendingMessage {
            client_txn_id: client_txn_id.clone(),
            sender_id: self.own_user_id,
            receiver_id,
            text: text.to_owned(),
            created_at: now,
        };
        if let Some(timeline) = self.open.as_mut().filter(|timeline| timeline.key() == key) {
            timeline.push_pending(pending.clone());
        }
        self.in_flight.insert(client_txn_id, (key, pending));

        Ok(SendRequest {
            sender_id: self.own_user_id,
            receiver_id,
            text: text.to_owned(),
        })
    }

    /// Apply a successful send response.
    ///
    /// Returns the timeline outcome when the conversation is open.
    pub fn confirm_send(
        &mut self,
        client_txn_id: &str,
        message: ChatMessage,
    ) -> Result<Option<AppendOutcome>, ChatError> {
        self.in_flight.remove(client_txn_id);
        let key = message.conversation_key()?;
        self.record_summary(key, &message, false);

        let outcome = self
            .open
            .as_mut()
            .filter(|timeline| timeline.key() == key)
            .map(|timeline| timeline.confirm(client_txn_id, message));
        trace!(client_txn_id, ?outcome, "send confirmed");
        Ok(outcome)
    }

    /// Drop the optimistic entry of a failed send and hand its text back.
    pub fn fail_send(&mut self, client_txn_id: &str) -> Option<String> {
        let (_, pending) = self.in_flight.remove(client_txn_id)?;
        if let Some(timeline) = self.open.as_mut() {
            timeline.remove_pending(client_txn_id);
        }
        warn!(client_txn_id, "send failed; restoring input text");
        Some(pending.text)
    }

    /// Merge a message delivered by the push channel.
    pub fn on_inbound_message(&mut self, message: ChatMessage) -> Result<InboundOutcome, ChatError> {
        let key = message.conversation_key()?;
        if !key.contains(self.own_user_id) {
            return Err(ChatError::validation(
                "foreign_message",
                format!("message {} does not involve user {}", message.id, self.own_user_id),
            ));
        }

        if let Some(timeline) = self.open.as_mut().filter(|timeline| timeline.key() == key) {
            let outcome = timeline.append(message.clone());
            if outcome != AppendOutcome::Duplicate {
                self.record_summary(key, &message, false);
            }
            trace!(conversation = %key, message_id = message.id, ?outcome, "inbound message for open conversation");
            return Ok(InboundOutcome::OpenTimeline(outcome));
        }

        let counts = message.sender_id != self.own_user_id
            && !message.is_read
            && self.unread_ids.entry(key).or_default().insert(message.id);
        let unread_count = self.record_summary(key, &message, counts);
        debug!(conversation = %key, message_id = message.id, unread_count, "inbound message for background conversation");
        Ok(InboundOutcome::SummaryUpdated {
            conversation: key,
            unread_count,
        })
    }

    /// Mark the counterparty's messages in `key` read and reset its unread count.
    pub fn mark_read(&mut self, key: ConversationKey) -> ReadOutcome {
        let flipped = self
            .open
            .as_mut()
            .filter(|timeline| timeline.key() == key)
            .map(ConversationTimeline::mark_counterparty_read)
            .unwrap_or(0);
        let previous_unread = self
            .summary_mut(key)
            .map(|summary| std::mem::take(&mut summary.unread_count))
            .unwrap_or(0);
        self.unread_ids.remove(&key);
        ReadOutcome {
            flipped,
            previous_unread,
        }
    }

    /// Apply a receipt saying `reader` read the local user's messages in `key`.
    pub fn apply_read_receipt(&mut self, key: ConversationKey, reader: UserId) -> usize {
        if reader == self.own_user_id {
            return 0;
        }
        self.open
            .as_mut()
            .filter(|timeline| timeline.key() == key)
            .map(|timeline| timeline.mark_own_read_by(reader))
            .unwrap_or(0)
    }

    fn summary_mut(&mut self, key: ConversationKey) -> Option<&mut ConversationSummary> {
        self.conversations
            .iter_mut()
            .find(|summary| summary.id == key)
    }

    fn record_summary(&mut self, key: ConversationKey, message: &ChatMessage, bump_unread: bool) -> u32 {
        let own = self.own_user_id;
        let idx = match self.conversations.iter().position(|summary| summary.id == key) {
            Some(idx) => idx,
            None => {
                let other = key.other(own).unwrap_or(message.sender_id);
                let name = if message.sender_id == own {
                    message.receiver_name.clone()
                } else {
                    message.sender_name.clone()
                }
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| format!("User {other}"));
                self.conversations
                    .push(ConversationSummary::empty(key, other, name));
                self.conversations.len() - 1
            }
        };

        let summary = &mut self.conversations[idx];
        summary.record_last_message(message);
        if bump_unread {
            summary.unread_count = summary.unread_count.saturating_add(1);
        }
        summary.unread_count
    }
}
