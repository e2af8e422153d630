use std::{fmt, str::FromStr};

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ChatError;

/// Numeric FixItNow user identifier.
pub type UserId = u64;

/// Server-assigned message identifier.
pub type MessageId = u64;

/// Connection lifecycle state reported to consumers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport is open and no reconnect is pending.
    Disconnected,
    /// A handshake is in flight.
    Connecting,
    /// Handshake completed; subscriptions and signals are accepted.
    Connected,
    /// Transport dropped unexpectedly; waiting for the next backoff slot.
    Reconnecting,
}

/// Canonical identity of a two-party conversation.
///
/// Built from two participant ids in either order; the wire form is
/// `"{low}-{high}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    /// Build the key for a conversation between `a` and `b`.
    pub fn new(a: UserId, b: UserId) -> Result<Self, ChatError> {
        if a == b {
            return Err(ChatError::validation(
                "self_conversation",
                format!("user {a} cannot open a conversation with themselves"),
            ));
        }
        Ok(Self {
            low: a.min(b),
            high: a.max(b),
        })
    }

    /// Smaller participant id.
    pub fn low(&self) -> UserId {
        self.low
    }

    /// Larger participant id.
    pub fn high(&self) -> UserId {
        self.high
    }

    /// Whether `user` is one of the two participants.
    pub fn contains(&self, user: UserId) -> bool {
        self.low == user || self.high == user
    }

    /// The participant that is not `user`, if `user` participates at all.
    pub fn other(&self, user: UserId) -> Option<UserId> {
        if user == self.low {
            Some(self.high)
        } else if user == self.high {
            Some(self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

impl FromStr for ConversationKey {
    type Err = ChatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            ChatError::validation(
                "invalid_conversation_id",
                format!("invalid conversation id '{value}'"),
            )
        };
        let (a, b) = value.split_once('-').ok_or_else(invalid)?;
        let a = a.trim().parse::<UserId>().map_err(|_| invalid())?;
        let b = b.trim().parse::<UserId>().map_err(|_| invalid())?;
        Self::new(a, b)
    }
}

impl Serialize for ConversationKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConversationKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Chat message as returned by the persistence API and the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server-assigned id.
    pub id: MessageId,
    /// Author.
    pub sender_id: UserId,
    /// Author display name, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Addressee.
    pub receiver_id: UserId,
    /// Addressee display name, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_name: Option<String>,
    /// Message body.
    #[serde(rename = "content")]
    pub text: String,
    /// Server timestamp (local date-time, no offset).
    pub sent_at: NaiveDateTime,
    /// Whether the receiver has read the message.
    #[serde(default, deserialize_with = "null_as_false")]
    pub is_read: bool,
}

impl ChatMessage {
    /// Conversation this message belongs to.
    pub fn conversation_key(&self) -> Result<ConversationKey, ChatError> {
        ConversationKey::new(self.sender_id, self.receiver_id)
    }
}

fn null_as_false<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// Conversation list row as returned by the persistence API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Canonical conversation key.
    pub id: ConversationKey,
    /// Counterparty id.
    pub other_user_id: UserId,
    /// Counterparty display name.
    #[serde(default)]
    pub other_user_name: String,
    /// Text of the latest message.
    #[serde(default)]
    pub last_message_text: Option<String>,
    /// Timestamp of the latest message.
    #[serde(default)]
    pub last_message_time: Option<NaiveDateTime>,
    /// Messages from the counterparty not yet read by the local user.
    #[serde(default)]
    pub unread_count: u32,
    /// Display name of the latest message author.
    #[serde(default)]
    pub last_message_sender: Option<String>,
    /// Id of the latest message author (tracked locally).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_sender_id: Option<UserId>,
}

impl ConversationSummary {
    /// Empty summary for a conversation the server has not listed yet.
    pub fn empty(id: ConversationKey, other_user_id: UserId, other_user_name: String) -> Self {
        Self {
            id,
            other_user_id,
            other_user_name,
            last_message_text: None,
            last_message_time: None,
            unread_count: 0,
            last_message_sender: None,
            last_message_sender_id: None,
        }
    }

    /// Record `message` as the latest message of this conversation.
    pub fn record_last_message(&mut self, message: &ChatMessage) {
        self.last_message_text = Some(message.text.clone());
        self.last_message_time = Some(message.sent_at);
        self.last_message_sender = message.sender_name.clone();
        self.last_message_sender_id = Some(message.sender_id);
    }
}

/// Minimal user profile used for conversation labels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
}

/// Body of the persistence send call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
}

/// Render-ready row of the open conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineEntry {
    /// Server id; `None` while the send is still in flight.
    pub message_id: Option<MessageId>,
    /// Client transaction id of an optimistic entry.
    pub client_txn_id: Option<String>,
    pub sender_id: UserId,
    pub text: String,
    pub sent_at: NaiveDateTime,
    pub is_read: bool,
    /// Authored by the local user.
    pub is_own: bool,
    /// Optimistic entry awaiting server confirmation.
    pub pending: bool,
}

/// Outbound control signal sent over the push channel.
///
/// Also parsed from inbound payloads (`READ` receipts on a conversation topic).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "UPPERCASE", rename_all_fields = "camelCase")]
pub enum ChatSignal {
    /// Announce presence in a conversation.
    Join { sender: String, user_id: UserId },
    /// Send a message through the push channel.
    Chat {
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
    },
    /// Mark the counterparty's messages as read by `user_id`.
    Read { user_id: UserId },
}

impl ChatSignal {
    /// Application destination this signal is published to.
    pub fn destination(&self, conversation: ConversationKey) -> String {
        match self {
            ChatSignal::Join { .. } => format!("/app/chat.addUser/{conversation}"),
            ChatSignal::Chat { .. } => format!("/app/chat.sendMessage/{conversation}"),
            ChatSignal::Read { .. } => format!("/app/chat.markAsRead/{conversation}"),
        }
    }
}

/// JSON body delivered on a push subscription.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PushPayload {
    Message(ChatMessage),
    Signal(ChatSignal),
}

/// Per-user queue receiving every message addressed to `user`.
pub fn user_notification_channel(user: UserId) -> String {
    format!("/user/{user}/queue/notifications")
}

/// Topic receiving messages for clients viewing `conversation`.
pub fn conversation_channel(conversation: ConversationKey) -> String {
    format!("/topic/conversation/{conversation}")
}

/// Command channel input accepted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatCommand {
    /// Open the push channel (no-op when already connected).
    Connect,
    /// Tear down the push channel and every subscription.
    Disconnect,
    /// Fetch the conversation list for the session user.
    LoadConversations,
    /// Open (or create) the conversation with `peer_id` and load its history.
    OpenConversation { peer_id: UserId },
    /// Leave the open conversation.
    CloseConversation,
    /// Send a text message.
    SendMessage {
        conversation: ConversationKey,
        /// Caller-provided transaction id echoed in `SendAck`.
        client_txn_id: String,
        text: String,
    },
    /// Send a read receipt now.
    MarkRead { conversation: ConversationKey },
}

/// Acknowledgement for `SendMessage`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Original transaction id.
    pub client_txn_id: String,
    /// Server message id on success.
    pub message_id: Option<MessageId>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
    /// Input text handed back to the caller on failure.
    pub restored_text: Option<String>,
}

/// Event channel output emitted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatEvent {
    /// Connection lifecycle transition.
    StateChanged { state: ConnectionState },
    /// Connectivity indicator flipped.
    ConnectivityChanged { connected: bool },
    /// Result of a `Connect` command.
    ConnectResult {
        success: bool,
        error_code: Option<String>,
    },
    /// Automatic reconnect attempt scheduled after a transport drop.
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    /// Automatic reconnects gave up; the client stays offline.
    ReconnectExhausted { attempts: u32 },
    /// Full conversation list replacement.
    ConversationsUpdated {
        conversations: Vec<ConversationSummary>,
    },
    /// A conversation became the open one.
    ConversationOpened { conversation: ConversationSummary },
    /// Snapshot of the open conversation's timeline.
    TimelineUpdated {
        conversation: ConversationKey,
        entries: Vec<TimelineEntry>,
    },
    /// Send acknowledgement.
    SendAck(SendAck),
    /// A read receipt was published.
    ReadReceiptSent { conversation: ConversationKey },
    /// Data-level failure surfaced to the caller.
    Failure {
        code: String,
        message: String,
        recoverable: bool,
    },
}
