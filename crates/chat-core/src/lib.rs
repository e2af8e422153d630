//! Transport-independent core of the FixItNow chat client.
//!
//! This crate defines the command/event protocol, the connection lifecycle,
//! the subscription table, and the reconciliation of conversation state from
//! push deliveries, send responses and history fetches.

/// Async command/event channel primitives.
pub mod channel;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Silent-connection detection.
pub mod heartbeat;
/// Event normalization helpers (send acknowledgements, failures).
pub mod normalization;
/// Read receipt debouncing.
pub mod read_state;
/// Conversation list and open timeline bookkeeping.
pub mod reconciler;
/// Reconnect backoff policy.
pub mod retry;
/// Connection lifecycle state machine.
pub mod state_machine;
/// Channel subscription table.
pub mod subscriptions;
/// Open conversation message list.
pub mod timeline;
/// Protocol types (commands, events, payloads).
pub mod types;

pub use channel::{ChatChannelError, ChatChannels, EventStream};
pub use error::{ChatError, ChatErrorCategory, classify_http_status};
pub use heartbeat::HeartbeatMonitor;
pub use normalization::{SendOutcome, normalize_failure, normalize_send_outcome};
pub use read_state::ReadReceiptScheduler;
pub use reconciler::{HistoryTicket, InboundOutcome, ReadOutcome, Reconciler};
pub use retry::ReconnectPolicy;
pub use state_machine::{ConnectStep, ConnectionStateMachine, FailureOutcome, Transition};
pub use subscriptions::{SubscribeOutcome, SubscriptionHandle, SubscriptionRegistry};
pub use timeline::{AppendOutcome, ConversationTimeline, PendingMessage};
pub use types::{
    ChatCommand, ChatEvent, ChatMessage, ChatSignal, ConnectionState, ConversationKey,
    ConversationSummary, MessageId, PushPayload, SendAck, SendRequest, TimelineEntry, UserId,
    UserProfile, conversation_channel, user_notification_channel,
};
