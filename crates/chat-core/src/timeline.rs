use std::collections::HashSet;

use chrono::{NaiveDateTime, TimeDelta};

use crate::types::{ChatMessage, ConversationKey, MessageId, TimelineEntry, UserId};

/// Optimistic local copy of a send that has no server id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub client_txn_id: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
    pub created_at: NaiveDateTime,
}

/// What happened to a confirmed message offered to the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// New message appended.
    Appended,
    /// Same identity already present; nothing changed.
    Duplicate,
    /// Same identity already present, but the optimistic entry for
    /// `client_txn_id` was still listed and has been dropped.
    SettledPending { client_txn_id: String },
    /// Replaced the optimistic entry for `client_txn_id`.
    PromotedPending { client_txn_id: String },
}

/// Message list of the open conversation.
///
/// Confirmed messages are append-only in arrival order; a full sort by
/// `(sent_at, id)` only happens when a history fetch is merged. Pending
/// entries always render after confirmed ones.
#[derive(Debug, Clone)]
pub struct ConversationTimeline {
    key: ConversationKey,
    own_user_id: UserId,
    confirmed: Vec<ChatMessage>,
    pending: Vec<PendingMessage>,
    max_items: usize,
    dedupe_window: TimeDelta,
}

impl ConversationTimeline {
    /// Create an empty timeline retaining at most `max_items` (>= 1) messages.
    pub fn new(
        key: ConversationKey,
        own_user_id: UserId,
        max_items: usize,
        dedupe_window: TimeDelta,
    ) -> Self {
        Self {
            key,
            own_user_id,
            confirmed: Vec::new(),
            pending: Vec::new(),
            max_items: max_items.max(1),
            dedupe_window,
        }
    }

    pub fn key(&self) -> ConversationKey {
        self.key
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.confirmed
    }

    pub fn pending(&self) -> &[PendingMessage] {
        &self.pending
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.confirmed.iter().any(|message| message.id == id)
    }

    /// Render-ready rows: confirmed messages, then pending sends.
    pub fn entries(&self) -> Vec<TimelineEntry> {
        let confirmed = self.confirmed.iter().map(|message| TimelineEntry {
            message_id: Some(message.id),
            client_txn_id: None,
            sender_id: message.sender_id,
            text: message.text.clone(),
            sent_at: message.sent_at,
            is_read: message.is_read,
            is_own: message.sender_id == self.own_user_id,
            pending: false,
        });
        let pending = self.pending.iter().map(|pending| TimelineEntry {
            message_id: None,
            client_txn_id: Some(pending.client_txn_id.clone()),
            sender_id: pending.sender_id,
            text: pending.text.clone(),
            sent_at: pending.created_at,
            is_read: false,
            is_own: true,
            pending: true,
        });
        confirmed.chain(pending).collect()
    }

    pub fn push_pending(&mut self, pending: PendingMessage) {
        self.pending.push(pending);
    }

    pub fn remove_pending(&mut self, client_txn_id: &str) -> Option<PendingMessage> {
        let idx = self
            .pending
            .iter()
            .position(|pending| pending.client_txn_id == client_txn_id)?;
        Some(self.pending.remove(idx))
    }

    /// Offer a confirmed message that arrived from the push channel.
    pub fn append(&mut self, message: ChatMessage) -> AppendOutcome {
        if self.contains(message.id) {
            return AppendOutcome::Duplicate;
        }

        let twin = self
            .pending
            .iter()
            .position(|pending| self.matches_pending(pending, &message));
        let promoted = twin.map(|idx| self.pending.remove(idx));

        self.confirmed.push(message);
        self.trim_to_max();

        match promoted {
            Some(pending) => AppendOutcome::PromotedPending {
                client_txn_id: pending.client_txn_id,
            },
            None => AppendOutcome::Appended,
        }
    }

    /// Apply the send response for `client_txn_id`.
    pub fn confirm(&mut self, client_txn_id: &str, message: ChatMessage) -> AppendOutcome {
        let removed = self.remove_pending(client_txn_id);
        if self.contains(message.id) {
            return match removed {
                Some(pending) => AppendOutcome::SettledPending {
                    client_txn_id: pending.client_txn_id,
                },
                None => AppendOutcome::Duplicate,
            };
        }
        self.confirmed.push(message);
        self.trim_to_max();
        AppendOutcome::Appended
    }

    /// Replace confirmed state with a fetched history.
    ///
    /// Confirmed messages missing from the fetch (arrived after the request
    /// started) are kept, as are pending sends with no confirmed twin.
    pub fn merge_history(&mut self, fetched: Vec<ChatMessage>) {
        let mut seen = HashSet::new();
        let mut merged = fetched
            .into_iter()
            .filter(|message| seen.insert(message.id))
            .collect::<Vec<_>>();

        for local in self.confirmed.drain(..) {
            if seen.insert(local.id) {
                merged.push(local);
            }
        }

        let mut claimed = HashSet::new();
        let pending = std::mem::take(&mut self.pending);
        for entry in pending {
            let twin = merged
                .iter()
                .find(|message| {
                    !claimed.contains(&message.id) && self.matches_pending(&entry, message)
                })
                .map(|message| message.id);
            match twin {
                Some(id) => {
                    claimed.insert(id);
                }
                None => self.pending.push(entry),
            }
        }

        merged.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.id.cmp(&b.id)));
        self.confirmed = merged;
        self.trim_to_max();
    }

    /// Mark every counterparty message read; returns how many flipped.
    pub fn mark_counterparty_read(&mut self) -> usize {
        let own = self.own_user_id;
        self.flip_read(|message| message.sender_id != own)
    }

    /// Apply a receipt: `reader` has read the local user's messages.
    pub fn mark_own_read_by(&mut self, reader: UserId) -> usize {
        let own = self.own_user_id;
        self.flip_read(|message| message.sender_id == own && message.receiver_id == reader)
    }

    fn flip_read(&mut self, mut selector: impl FnMut(&ChatMessage) -> bool) -> usize {
        let mut flipped = 0;
        for message in self.confirmed.iter_mut() {
            if !message.is_read && selector(message) {
                message.is_read = true;
                flipped += 1;
            }
        }
        flipped
    }

    fn matches_pending(&self, pending: &PendingMessage, message: &ChatMessage) -> bool {
        if pending.sender_id != message.sender_id || pending.text != message.text {
            return false;
        }
        let delta = message.sent_at.signed_duration_since(pending.created_at);
        delta <= self.dedupe_window && delta >= -self.dedupe_window
    }

    fn trim_to_max(&mut self) {
        if self.confirmed.len() <= self.max_items {
            return;
        }

        let excess = self.confirmed.len() - self.max_items;
        self.confirmed.drain(0..excess);
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    const ALICE: UserId = 1;
    const BOB: UserId = 2;

    fn at(seconds: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|date| date.and_hms_opt(10, 0, seconds))
            .expect("valid timestamp")
    }

    fn message(id: MessageId, sender: UserId, text: &str, seconds: u32) -> ChatMessage {
        let receiver = if sender == ALICE { BOB } else { ALICE };
        ChatMessage {
            id,
            sender_id: sender,
            sender_name: None,
            receiver_id: receiver,
            receiver_name: None,
            text: text.to_owned(),
            sent_at: at(seconds),
            is_read: false,
        }
    }

    fn pending(txn: &str, text: &str, seconds: u32) -> PendingMessage {
        PendingMessage {
            client_txn_id: txn.to_owned(),
            sender_id: ALICE,
            receiver_id: BOB,
            text: text.to_owned(),
            created_at: at(seconds),
        }
    }

    fn timeline(max_items: usize) -> ConversationTimeline {
        ConversationTimeline::new(
            ConversationKey::new(ALICE, BOB).expect("key"),
            ALICE,
            max_items,
            TimeDelta::seconds(60),
        )
    }

    #[test]
    fn same_identity_is_stored_once_across_all_paths() {
        let mut timeline = timeline(50);
        timeline.push_pending(pending("tx-1", "hello", 0));

        assert_eq!(
            timeline.confirm("tx-1", message(42, ALICE, "hello", 1)),
            AppendOutcome::Appended
        );
        assert_eq!(
            timeline.append(message(42, ALICE, "hello", 1)),
            AppendOutcome::Duplicate
        );
        timeline.merge_history(vec![message(42, ALICE, "hello", 1)]);

        assert_eq!(timeline.messages().len(), 1);
        assert!(timeline.pending().is_empty());
    }

    #[test]
    fn push_before_send_response_promotes_pending_entry() {
        let mut timeline = timeline(50);
        timeline.push_pending(pending("tx-1", "on my way", 0));

        assert_eq!(
            timeline.append(message(7, ALICE, "on my way", 2)),
            AppendOutcome::PromotedPending {
                client_txn_id: "tx-1".into()
            }
        );
        assert_eq!(
            timeline.confirm("tx-1", message(7, ALICE, "on my way", 2)),
            AppendOutcome::Duplicate
        );
        assert_eq!(timeline.entries().len(), 1);
        assert!(!timeline.entries()[0].pending);
    }

    #[test]
    fn pending_outside_window_is_not_promoted() {
        let mut timeline = timeline(50);
        timeline.push_pending(pending("tx-1", "ok", 0));
        timeline.append(message(3, ALICE, "ok", 59));
        assert!(timeline.pending().is_empty());

        let mut strict = ConversationTimeline::new(
            ConversationKey::new(ALICE, BOB).expect("key"),
            ALICE,
            50,
            TimeDelta::seconds(5),
        );
        strict.push_pending(pending("tx-2", "ok", 0));
        assert_eq!(strict.append(message(4, ALICE, "ok", 30)), AppendOutcome::Appended);
        assert_eq!(strict.pending().len(), 1);
    }

    #[test]
    fn response_after_unmatched_push_drops_pending_row() {
        let mut timeline = timeline(50);
        timeline.push_pending(pending("tx-1", "Hello", 0));

        // Server clock two hours behind: the push cannot be paired with the pending row.
        let skewed = NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|date| date.and_hms_opt(8, 0, 0))
            .expect("valid timestamp");
        let mut pushed = message(100, ALICE, "Hello", 0);
        pushed.sent_at = skewed;
        assert_eq!(timeline.append(pushed.clone()), AppendOutcome::Appended);
        assert_eq!(timeline.entries().len(), 2);

        assert_eq!(
            timeline.confirm("tx-1", pushed),
            AppendOutcome::SettledPending {
                client_txn_id: "tx-1".into()
            }
        );
        let entries = timeline.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message_id, Some(100));
        assert!(!entries[0].pending);
    }

    #[test]
    fn history_merge_keeps_late_arrivals_and_unmatched_pending() {
        let mut timeline = timeline(50);
        timeline.append(message(5, BOB, "arrived during load", 30));
        timeline.push_pending(pending("tx-1", "still sending", 40));
        timeline.push_pending(pending("tx-2", "confirmed in fetch", 20));

        timeline.merge_history(vec![
            message(2, BOB, "older", 10),
            message(1, BOB, "oldest", 10),
            message(4, ALICE, "confirmed in fetch", 21),
        ]);

        let ids = timeline
            .messages()
            .iter()
            .map(|message| message.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 4, 5]);
        assert_eq!(timeline.pending().len(), 1);
        assert_eq!(timeline.pending()[0].client_txn_id, "tx-1");
        assert!(timeline.entries().last().expect("entries").pending);
    }

    #[test]
    fn read_flags_flip_by_author() {
        let mut timeline = timeline(50);
        timeline.append(message(1, BOB, "hi", 0));
        timeline.append(message(2, ALICE, "hey", 1));
        timeline.append(message(3, BOB, "there?", 2));

        assert_eq!(timeline.mark_counterparty_read(), 2);
        assert_eq!(timeline.mark_counterparty_read(), 0);
        assert!(!timeline.messages()[1].is_read);

        assert_eq!(timeline.mark_own_read_by(BOB), 1);
        assert!(timeline.messages().iter().all(|message| message.is_read));
    }

    #[test]
    fn trims_oldest_when_over_max_items() {
        let mut timeline = timeline(2);
        timeline.append(message(1, BOB, "one", 0));
        timeline.append(message(2, BOB, "two", 1));
        timeline.append(message(3, BOB, "three", 2));

        let ids = timeline
            .messages()
            .iter()
            .map(|message| message.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 3]);
    }
}
