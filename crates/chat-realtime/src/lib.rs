//! Runtime actor that drives the FixItNow chat core over a push channel and
//! the persistence API.

pub mod api;
pub mod stomp;
pub mod transport;

use std::{future::Future, sync::Arc, time::Duration};

use chat_core::{
    AppendOutcome, ChatChannelError, ChatChannels, ChatCommand, ChatError, ChatErrorCategory,
    ChatEvent, ChatMessage, ChatSignal, ConnectStep, ConnectionState, ConnectionStateMachine,
    ConversationKey, ConversationSummary, EventStream, FailureOutcome, HeartbeatMonitor,
    HistoryTicket, InboundOutcome, PushPayload, ReadReceiptScheduler, Reconciler, ReconnectPolicy,
    SendOutcome, SubscribeOutcome, SubscriptionRegistry, Transition, UserId, UserProfile,
    conversation_channel, normalize_failure, normalize_send_outcome, user_notification_channel,
};
use chat_platform::{BearerToken, SessionTokens, TokenStore, TokenStoreError};
use chrono::{Local, TimeDelta};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub use api::{ChatApi, HttpChatApi};
pub use stomp::{DEFAULT_WS_URL, StompTransport, StompTransportConfig, negotiate_heartbeat};
pub use transport::{HeartbeatTerms, InboundFrame, OutboundFrame, PushConnection, PushTransport};

#[derive(Debug, Clone)]
pub struct ChatRuntimeConfig {
    /// Session user.
    pub user_id: UserId,
    /// Name announced in `JOIN` signals.
    pub display_name: String,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_attempts: u32,
    /// Heartbeat period offered to the server; zero disables heartbeats and
    /// silence detection. Transports that negotiate (STOMP) may settle on a
    /// different period per direction.
    pub heartbeat_interval: Duration,
    /// Extra silence tolerated on top of `heartbeat_interval`.
    pub heartbeat_grace: Duration,
    pub read_receipt_delay: Duration,
    pub handshake_timeout: Duration,
    /// Max distance between a pending send and its pushed copy.
    pub dedupe_window: Duration,
    pub timeline_max_items: usize,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl ChatRuntimeConfig {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            reconnect_base_delay: Duration::from_millis(5_000),
            reconnect_max_attempts: 5,
            heartbeat_interval: Duration::from_millis(4_000),
            heartbeat_grace: Duration::from_millis(1_000),
            read_receipt_delay: Duration::from_millis(1_000),
            handshake_timeout: Duration::from_millis(10_000),
            dedupe_window: Duration::from_secs(60),
            timeline_max_items: 500,
            command_buffer: 128,
            event_buffer: 512,
        }
    }

    fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.reconnect_base_delay.as_millis() as u64,
            self.reconnect_max_attempts,
        )
    }
}

/// External services the runtime talks to.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub api: Arc<dyn ChatApi>,
    pub transport: Arc<dyn PushTransport>,
    pub tokens: Arc<dyn TokenStore>,
}

#[derive(Clone, Debug)]
pub struct ChatRuntimeHandle {
    channels: ChatChannels,
    shutdown: CancellationToken,
}

impl ChatRuntimeHandle {
    pub async fn send(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Stop the runtime; the push channel is torn down before the task exits.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub fn spawn_runtime(config: ChatRuntimeConfig, deps: RuntimeDeps) -> ChatRuntimeHandle {
    let (channels, command_rx) = ChatChannels::new(config.command_buffer, config.event_buffer);
    let shutdown = CancellationToken::new();
    let runtime = ChatRuntime::new(config, deps, channels.clone(), command_rx, shutdown.clone());
    tokio::spawn(runtime.run());

    ChatRuntimeHandle { channels, shutdown }
}

/// What a subscribed destination carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushRoute {
    UserQueue,
    ConversationTopic(ConversationKey),
}

/// Completions reported back by spawned tasks.
#[derive(Debug)]
enum Internal {
    Handshake {
        generation: u64,
        result: Result<PushConnection, ChatError>,
    },
    ConversationsLoaded(Result<Vec<ConversationSummary>, ChatError>),
    HistoryLoaded {
        ticket: HistoryTicket,
        result: Result<Vec<ChatMessage>, ChatError>,
    },
    SendCompleted {
        client_txn_id: String,
        result: Result<ChatMessage, ChatError>,
    },
    ProfileResolved {
        conversation: ConversationKey,
        result: Result<UserProfile, ChatError>,
    },
    ReadPersisted {
        conversation: ConversationKey,
        result: Result<(), ChatError>,
    },
}

enum Wake {
    Shutdown,
    Command(Option<ChatCommand>),
    Internal(Internal),
    Inbound(Option<InboundFrame>),
    Heartbeat,
    ReadReceiptsDue,
    ReconnectDue,
}

struct ChatRuntime {
    config: ChatRuntimeConfig,
    deps: RuntimeDeps,
    tokens: SessionTokens<Arc<dyn TokenStore>>,
    channels: ChatChannels,
    command_rx: mpsc::Receiver<ChatCommand>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    shutdown: CancellationToken,
    connection: ConnectionStateMachine,
    registry: SubscriptionRegistry<PushRoute>,
    reconciler: Reconciler,
    receipts: ReadReceiptScheduler,
    heartbeat: HeartbeatMonitor,
    outgoing_heartbeat: Duration,
    push: Option<PushConnection>,
    connect_generation: u64,
    reconnect_at: Option<Instant>,
    next_heartbeat: Instant,
    pending_profile: Option<ConversationKey>,
}

impl ChatRuntime {
    fn new(
        config: ChatRuntimeConfig,
        deps: RuntimeDeps,
        channels: ChatChannels,
        command_rx: mpsc::Receiver<ChatCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::channel(config.command_buffer.max(1));
        let dedupe_window =
            TimeDelta::from_std(config.dedupe_window).unwrap_or_else(|_| TimeDelta::seconds(60));
        let now = Instant::now();

        Self {
            tokens: SessionTokens::new(Arc::clone(&deps.tokens), config.user_id),
            connection: ConnectionStateMachine::new(config.reconnect_policy()),
            registry: SubscriptionRegistry::default(),
            reconciler: Reconciler::new(config.user_id, config.timeline_max_items, dedupe_window),
            receipts: ReadReceiptScheduler::new(config.read_receipt_delay),
            heartbeat: HeartbeatMonitor::new(config.heartbeat_interval, config.heartbeat_grace, now),
            outgoing_heartbeat: config.heartbeat_interval,
            push: None,
            connect_generation: 0,
            reconnect_at: None,
            next_heartbeat: now,
            pending_profile: None,
            config,
            deps,
            channels,
            command_rx,
            internal_tx,
            internal_rx,
            shutdown,
        }
    }

    async fn run(mut self) {
        info!(user_id = self.config.user_id, "chat runtime started");
        loop {
            match self.next_wake().await {
                Wake::Shutdown | Wake::Command(None) => break,
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Internal(internal) => self.handle_internal(internal).await,
                Wake::Inbound(frame) => self.handle_inbound(frame),
                Wake::Heartbeat => self.handle_heartbeat_tick().await,
                Wake::ReadReceiptsDue => self.flush_read_receipts().await,
                Wake::ReconnectDue => self.handle_reconnect_due(),
            }
        }
        self.teardown().await;
        info!(user_id = self.config.user_id, "chat runtime stopped");
    }

    async fn next_wake(&mut self) -> Wake {
        let heartbeat_at = self.heartbeat_deadline();
        let receipts_at = self.receipts.next_deadline();
        let reconnect_at = self.reconnect_at;

        tokio::select! {
            _ = self.shutdown.cancelled() => Wake::Shutdown,
            command = self.command_rx.recv() => Wake::Command(command),
            Some(internal) = self.internal_rx.recv() => Wake::Internal(internal),
            frame = recv_inbound(&mut self.push) => Wake::Inbound(frame),
            _ = sleep_until_some(heartbeat_at) => Wake::Heartbeat,
            _ = sleep_until_some(receipts_at) => Wake::ReadReceiptsDue,
            _ = sleep_until_some(reconnect_at) => Wake::ReconnectDue,
        }
    }

    async fn handle_command(&mut self, command: ChatCommand) {
        trace!(?command, "handling command");
        match command {
            ChatCommand::Connect => self.handle_connect(),
            ChatCommand::Disconnect => self.teardown().await,
            ChatCommand::LoadConversations => self.handle_load_conversations(),
            ChatCommand::OpenConversation { peer_id } => {
                self.handle_open_conversation(peer_id).await
            }
            ChatCommand::CloseConversation => self.leave_open_conversation().await,
            ChatCommand::SendMessage {
                conversation,
                client_txn_id,
                text,
            } => self.handle_send_message(conversation, client_txn_id, text),
            ChatCommand::MarkRead { conversation } => {
                if let Err(err) = self.mark_read_now(conversation).await {
                    self.emit_failure(err);
                }
            }
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Handshake { generation, result } => {
                self.handle_handshake(generation, result).await
            }
            Internal::ConversationsLoaded(Ok(conversations)) => {
                self.reconciler.replace_conversations(conversations);
                self.emit_conversations();
            }
            Internal::ConversationsLoaded(Err(err)) => {
                warn!(code = %err.code, "conversation list load failed");
                self.emit_failure(err.into_delivery());
            }
            Internal::HistoryLoaded { ticket, result } => self.handle_history(ticket, result),
            Internal::SendCompleted {
                client_txn_id,
                result,
            } => self.handle_send_completed(client_txn_id, result),
            Internal::ProfileResolved {
                conversation,
                result,
            } => self.handle_profile(conversation, result).await,
            Internal::ReadPersisted {
                conversation,
                result,
            } => self.handle_read_persisted(conversation, result),
        }
    }

    fn handle_connect(&mut self) {
        let Transition { outcome, events } = self.connection.begin_connect();
        self.channels.emit_all(events);
        match outcome {
            ConnectStep::AlreadyConnected => self.channels.emit(ChatEvent::ConnectResult {
                success: true,
                error_code: None,
            }),
            ConnectStep::InProgress => debug!("connect already in progress"),
            ConnectStep::Start => {
                self.reconnect_at = None;
                self.start_handshake();
            }
        }
    }

    fn start_handshake(&mut self) {
        self.connect_generation += 1;
        let generation = self.connect_generation;
        let transport = Arc::clone(&self.deps.transport);
        let tokens = self.tokens.clone();
        let internal = self.internal_tx.clone();
        let handshake_timeout = self.config.handshake_timeout;
        debug!(generation, "starting push handshake");

        tokio::spawn(async move {
            let result = match tokens.bearer() {
                Ok(bearer) => timeout(handshake_timeout, transport.connect(&bearer))
                    .await
                    .unwrap_or_else(|_| {
                        Err(ChatError::transport(
                            "handshake_timeout",
                            format!("no CONNECTED frame within {handshake_timeout:?}"),
                        ))
                    }),
                Err(err) => Err(token_error(err)),
            };
            let _ = internal.send(Internal::Handshake { generation, result }).await;
        });
    }

    async fn handle_handshake(
        &mut self,
        generation: u64,
        result: Result<PushConnection, ChatError>,
    ) {
        if generation != self.connect_generation
            || self.connection.state() != ConnectionState::Connecting
        {
            debug!(generation, "discarding stale handshake result");
            return;
        }

        match result {
            Ok(connection) => self.on_connected(connection).await,
            Err(err) => self.on_handshake_failed(err),
        }
    }

    async fn on_connected(&mut self, connection: PushConnection) {
        let events = match self.connection.on_connected() {
            Ok(events) => events,
            Err(err) => {
                self.emit_failure(err);
                return;
            }
        };

        let now = Instant::now();
        let terms = connection
            .heartbeat()
            .unwrap_or_else(|| HeartbeatTerms::symmetric(self.config.heartbeat_interval));
        debug!(
            outgoing_ms = terms.outgoing.as_millis() as u64,
            incoming_ms = terms.incoming.as_millis() as u64,
            "heartbeat terms"
        );
        self.push = Some(connection);
        self.heartbeat = HeartbeatMonitor::new(terms.incoming, self.config.heartbeat_grace, now);
        self.outgoing_heartbeat = terms.outgoing;
        self.next_heartbeat = now + terms.outgoing;
        self.registry.attach();
        info!(user_id = self.config.user_id, "push channel connected");
        self.channels.emit_all(events);
        self.channels.emit(ChatEvent::ConnectResult {
            success: true,
            error_code: None,
        });

        self.subscribe_channel(
            user_notification_channel(self.config.user_id),
            PushRoute::UserQueue,
        )
        .await;

        // Messages pushed while offline were missed; resync the open conversation.
        if let Some(key) = self.reconciler.open_key() {
            let ticket = self.reconciler.open(key);
            self.subscribe_conversation(key).await;
            self.start_history_load(ticket);
            if let Err(err) = self.mark_read_now(key).await {
                debug!(code = %err.code, "read receipt after reconnect skipped");
            }
        }
    }

    fn on_handshake_failed(&mut self, err: ChatError) {
        warn!(code = %err.code, message = %err.message, "push handshake failed");
        let transition = match self.connection.on_connect_failed(err.retry_after_ms) {
            Ok(transition) => transition,
            Err(state_err) => {
                self.emit_failure(state_err);
                return;
            }
        };
        self.channels.emit_all(transition.events);
        self.channels.emit(ChatEvent::ConnectResult {
            success: false,
            error_code: Some(err.code),
        });
        self.apply_failure_outcome(transition.outcome);
    }

    fn on_transport_lost(&mut self, reason: &str) {
        if self.push.take().is_none() {
            return;
        }
        warn!(reason, "push channel lost");
        self.registry.release_all();
        self.receipts.clear();

        match self.connection.on_transport_lost(None) {
            Ok(transition) => {
                self.channels.emit_all(transition.events);
                self.apply_failure_outcome(transition.outcome);
            }
            Err(err) => self.emit_failure(err),
        }
    }

    fn apply_failure_outcome(&mut self, outcome: FailureOutcome) {
        match outcome {
            FailureOutcome::Offline => self.reconnect_at = None,
            FailureOutcome::RetryScheduled { attempt, delay } => {
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            FailureOutcome::Exhausted { attempts } => {
                error!(attempts, "push channel reconnect attempts exhausted; staying offline");
                self.reconnect_at = None;
            }
        }
    }

    fn handle_reconnect_due(&mut self) {
        self.reconnect_at = None;
        match self.connection.begin_reconnect_attempt() {
            Ok(events) => {
                self.channels.emit_all(events);
                self.start_handshake();
            }
            Err(err) => debug!(code = %err.code, "scheduled reconnect no longer applies"),
        }
    }

    /// Release subscriptions, close the transport and cancel timers.
    async fn teardown(&mut self) {
        self.connect_generation += 1;
        self.reconnect_at = None;
        self.receipts.clear();

        let handles = self.registry.release_all();
        if let Some(push) = self.push.take() {
            for handle in handles {
                let _ = push.send(OutboundFrame::Unsubscribe { id: handle.id }).await;
            }
            push.close();
            debug!("push channel closed");
        }
        let events = self.connection.disconnect();
        self.channels.emit_all(events);
    }

    fn handle_load_conversations(&mut self) {
        let user_id = self.config.user_id;
        self.spawn_api(
            move |api, bearer| async move { api.fetch_conversations(&bearer, user_id).await },
            Internal::ConversationsLoaded,
        );
    }

    async fn handle_open_conversation(&mut self, peer_id: UserId) {
        let key = match ConversationKey::new(self.config.user_id, peer_id) {
            Ok(key) => key,
            Err(err) => {
                self.emit_failure(err);
                return;
            }
        };

        if self.reconciler.open_key() != Some(key) {
            self.leave_open_conversation().await;
        }
        if self.reconciler.conversation(key).is_some() {
            self.open_known(key).await;
            return;
        }

        debug!(conversation = %key, peer_id, "resolving counterparty profile");
        self.pending_profile = Some(key);
        self.spawn_api(
            move |api, bearer| async move { api.fetch_user_profile(&bearer, peer_id).await },
            move |result| Internal::ProfileResolved {
                conversation: key,
                result,
            },
        );
    }

    async fn handle_profile(
        &mut self,
        conversation: ConversationKey,
        result: Result<UserProfile, ChatError>,
    ) {
        if self.pending_profile != Some(conversation) {
            debug!(%conversation, "discarding stale profile lookup");
            return;
        }
        self.pending_profile = None;
        let peer_id = conversation
            .other(self.config.user_id)
            .unwrap_or(conversation.high());

        match result {
            Ok(profile) => {
                self.reconciler.upsert_conversation(ConversationSummary::empty(
                    conversation,
                    peer_id,
                    profile.name,
                ));
                self.emit_conversations();
                self.open_known(conversation).await;
            }
            Err(err) => {
                warn!(%conversation, code = %err.code, "counterparty lookup failed");
                self.emit_failure(ChatError::not_found(
                    "user_not_found",
                    format!("user {peer_id} could not be resolved: {}", err.message),
                ));
                self.leave_open_conversation().await;
            }
        }
    }

    async fn open_known(&mut self, key: ConversationKey) {
        let ticket = self.reconciler.open(key);
        if let Some(summary) = self.reconciler.conversation(key).cloned() {
            self.channels.emit(ChatEvent::ConversationOpened {
                conversation: summary,
            });
        }
        self.emit_timeline();
        self.start_history_load(ticket);

        if self.connection.is_connected() {
            self.subscribe_conversation(key).await;
            if let Err(err) = self.mark_read_now(key).await {
                debug!(code = %err.code, "read receipt on open skipped");
            }
        } else {
            self.persist_read_offline(key);
        }
    }

    /// Without a push channel the read state is stored through the
    /// persistence API instead of the `READ` signal.
    fn persist_read_offline(&self, key: ConversationKey) {
        let Some(peer_id) = key.other(self.config.user_id) else {
            return;
        };
        let user_id = self.config.user_id;
        self.spawn_api(
            move |api, bearer| async move { api.mark_read(&bearer, peer_id, user_id).await },
            move |result| Internal::ReadPersisted {
                conversation: key,
                result,
            },
        );
    }

    fn handle_read_persisted(&mut self, key: ConversationKey, result: Result<(), ChatError>) {
        match result {
            Ok(()) if self.reconciler.open_key() == Some(key) => self.apply_local_read(key),
            Ok(()) => debug!(conversation = %key, "read state persisted after leaving conversation"),
            Err(err) => warn!(conversation = %key, code = %err.code, "read state not persisted"),
        }
    }

    async fn leave_open_conversation(&mut self) {
        self.pending_profile = None;
        let Some(key) = self.reconciler.close() else {
            return;
        };
        self.receipts.cancel(key);
        if let Some(handle) = self.registry.unsubscribe(&conversation_channel(key)) {
            let _ = self
                .send_frame(OutboundFrame::Unsubscribe { id: handle.id })
                .await;
        }
    }

    fn start_history_load(&self, ticket: HistoryTicket) {
        let key = ticket.conversation;
        self.spawn_api(
            move |api, bearer| async move { api.fetch_messages(&bearer, key).await },
            move |result| Internal::HistoryLoaded { ticket, result },
        );
    }

    fn handle_history(&mut self, ticket: HistoryTicket, result: Result<Vec<ChatMessage>, ChatError>) {
        match result {
            Ok(messages) => {
                if self.reconciler.apply_history(ticket, messages) {
                    self.emit_timeline();
                    self.emit_conversations();
                }
            }
            Err(err) if self.reconciler.open_key() == Some(ticket.conversation) => {
                warn!(conversation = %ticket.conversation, code = %err.code, "history load failed");
                self.emit_failure(err.into_delivery());
            }
            Err(err) => debug!(code = %err.code, "ignoring failure of stale history load"),
        }
    }

    fn handle_send_message(
        &mut self,
        conversation: ConversationKey,
        client_txn_id: String,
        text: String,
    ) {
        let now = Local::now().naive_local();
        let request =
            match self
                .reconciler
                .prepare_send(conversation, client_txn_id.clone(), &text, now)
            {
                Ok(request) => request,
                Err(error) => {
                    debug!(client_txn_id, code = %error.code, "send rejected");
                    self.channels.emit(normalize_send_outcome(
                        client_txn_id,
                        SendOutcome::Failure {
                            error,
                            restored_text: Some(text),
                        },
                    ));
                    return;
                }
            };

        if self.reconciler.open_key() == Some(conversation) {
            self.emit_timeline();
        }
        self.spawn_api(
            move |api, bearer| async move { api.send_message(&bearer, &request).await },
            move |result| Internal::SendCompleted {
                client_txn_id,
                result,
            },
        );
    }

    fn handle_send_completed(&mut self, client_txn_id: String, result: Result<ChatMessage, ChatError>) {
        match result {
            Ok(message) => {
                match self.reconciler.confirm_send(&client_txn_id, message.clone()) {
                    Ok(Some(AppendOutcome::Duplicate)) | Ok(None) => {}
                    Ok(Some(_)) => self.emit_timeline(),
                    Err(err) => warn!(client_txn_id, code = %err.code, "send response rejected"),
                }
                self.emit_conversations();
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Success { message },
                ));
            }
            Err(error) => {
                let restored_text = self.reconciler.fail_send(&client_txn_id);
                self.emit_timeline();
                let error = error.into_delivery();
                self.channels.emit(normalize_failure(error.clone()));
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Failure {
                        error,
                        restored_text,
                    },
                ));
            }
        }
    }

    fn handle_inbound(&mut self, frame: Option<InboundFrame>) {
        let now = Instant::now();
        match frame {
            None => self.on_transport_lost("push channel closed"),
            Some(InboundFrame::Heartbeat) => {
                trace!("heartbeat received");
                self.heartbeat.record_inbound(now);
            }
            Some(InboundFrame::Error { message }) => {
                warn!(%message, "broker reported an error");
                self.on_transport_lost("broker error");
            }
            Some(InboundFrame::Message { destination, body }) => {
                self.heartbeat.record_inbound(now);
                self.dispatch(&destination, &body, now);
            }
        }
    }

    fn dispatch(&mut self, destination: &str, body: &str, now: Instant) {
        let Some(route) = self.registry.handler_for(destination) else {
            trace!(destination, "no subscription for destination");
            return;
        };
        let payload = match serde_json::from_str::<PushPayload>(body) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(destination, error = %err, "dropping undecodable push payload");
                return;
            }
        };

        match (route, payload) {
            (_, PushPayload::Message(message)) => self.on_push_message(message, now),
            (PushRoute::ConversationTopic(key), PushPayload::Signal(ChatSignal::Read { user_id })) => {
                let flipped = self.reconciler.apply_read_receipt(key, user_id);
                trace!(conversation = %key, reader = user_id, flipped, "read receipt received");
                if flipped > 0 {
                    self.emit_timeline();
                }
            }
            (_, PushPayload::Signal(signal)) => {
                trace!(destination, ?signal, "ignoring control signal");
            }
        }
    }

    fn on_push_message(&mut self, message: ChatMessage, now: Instant) {
        let from_counterparty = message.sender_id != self.config.user_id;
        let message_id = message.id;
        match self.reconciler.on_inbound_message(message) {
            Ok(InboundOutcome::OpenTimeline(AppendOutcome::Duplicate)) => {
                trace!(message_id, "duplicate push delivery ignored");
            }
            Ok(InboundOutcome::OpenTimeline(_)) => {
                self.emit_timeline();
                self.emit_conversations();
                if from_counterparty
                    && let Some(key) = self.reconciler.open_key()
                    && self.receipts.schedule(key, now)
                {
                    trace!(conversation = %key, "read receipt scheduled");
                }
            }
            Ok(InboundOutcome::SummaryUpdated { .. }) => self.emit_conversations(),
            Err(err) => warn!(message_id, code = %err.code, "rejected inbound message"),
        }
    }

    async fn flush_read_receipts(&mut self) {
        for key in self.receipts.take_due(Instant::now()) {
            if self.reconciler.open_key() != Some(key) {
                continue;
            }
            if let Err(err) = self.mark_read_now(key).await {
                debug!(conversation = %key, code = %err.code, "debounced read receipt skipped");
            }
        }
    }

    async fn mark_read_now(&mut self, key: ConversationKey) -> Result<(), ChatError> {
        if !self.connection.is_connected() {
            return Err(ChatError::not_connected("mark_read"));
        }
        self.send_signal(
            key,
            ChatSignal::Read {
                user_id: self.config.user_id,
            },
        )
        .await?;
        self.apply_local_read(key);
        Ok(())
    }

    fn apply_local_read(&mut self, key: ConversationKey) {
        self.receipts.cancel(key);
        let outcome = self.reconciler.mark_read(key);
        debug!(
            conversation = %key,
            flipped = outcome.flipped,
            previous_unread = outcome.previous_unread,
            "read state applied"
        );
        self.channels
            .emit(ChatEvent::ReadReceiptSent { conversation: key });
        if outcome.flipped > 0 {
            self.emit_timeline();
        }
        if outcome.previous_unread > 0 {
            self.emit_conversations();
        }
    }

    async fn handle_heartbeat_tick(&mut self) {
        let now = Instant::now();
        if self.heartbeat.is_overdue(now) {
            self.on_transport_lost("heartbeat timeout");
            return;
        }
        if !self.outgoing_heartbeat.is_zero() && now >= self.next_heartbeat {
            self.next_heartbeat = now + self.outgoing_heartbeat;
            if let Err(err) = self.send_frame(OutboundFrame::Heartbeat).await {
                debug!(code = %err.code, "heartbeat not sent");
            }
        }
    }

    fn heartbeat_deadline(&self) -> Option<Instant> {
        if self.push.is_none() {
            return None;
        }
        let silence = self.heartbeat.deadline();
        let outgoing = (!self.outgoing_heartbeat.is_zero()).then_some(self.next_heartbeat);
        match (silence, outgoing) {
            (Some(silence), Some(outgoing)) => Some(silence.min(outgoing)),
            (silence, outgoing) => silence.or(outgoing),
        }
    }

    async fn subscribe_conversation(&mut self, key: ConversationKey) {
        let created = self
            .subscribe_channel(conversation_channel(key), PushRoute::ConversationTopic(key))
            .await;
        if !created {
            return;
        }
        let join = ChatSignal::Join {
            sender: self.config.display_name.clone(),
            user_id: self.config.user_id,
        };
        if let Err(err) = self.send_signal(key, join).await {
            debug!(conversation = %key, code = %err.code, "join signal not sent");
        }
    }

    /// Returns `true` when a transport subscription was issued.
    async fn subscribe_channel(&mut self, channel: String, route: PushRoute) -> bool {
        match self.registry.subscribe(channel, route) {
            Ok(SubscribeOutcome::Created(handle)) => {
                debug!(channel = %handle.channel, id = %handle.id, "subscribing");
                let frame = OutboundFrame::Subscribe {
                    id: handle.id,
                    destination: handle.channel,
                };
                match self.send_frame(frame).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(code = %err.code, "subscribe frame not sent");
                        false
                    }
                }
            }
            Ok(SubscribeOutcome::Replaced(handle)) => {
                trace!(channel = %handle.channel, "subscription handler replaced");
                false
            }
            Err(err) => {
                debug!(code = %err.code, "subscription skipped");
                false
            }
        }
    }

    async fn send_signal(&self, key: ConversationKey, signal: ChatSignal) -> Result<(), ChatError> {
        let body = serde_json::to_string(&signal).map_err(|err| {
            ChatError::new(
                ChatErrorCategory::Serialization,
                "signal_encode_error",
                err.to_string(),
            )
        })?;
        self.send_frame(OutboundFrame::Send {
            destination: signal.destination(key),
            body,
        })
        .await
    }

    async fn send_frame(&self, frame: OutboundFrame) -> Result<(), ChatError> {
        let push = self
            .push
            .as_ref()
            .ok_or_else(|| ChatError::not_connected("send_frame"))?;
        push.send(frame).await
    }

    /// Run an API call off the actor and feed its result back in.
    fn spawn_api<T, F, Fut, R>(&self, call: F, report: R)
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn ChatApi>, BearerToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ChatError>> + Send,
        R: FnOnce(Result<T, ChatError>) -> Internal + Send + 'static,
    {
        let api = Arc::clone(&self.deps.api);
        let tokens = self.tokens.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = match tokens.bearer() {
                Ok(bearer) => call(api, bearer).await,
                Err(err) => Err(token_error(err)),
            };
            let _ = internal.send(report(result)).await;
        });
    }

    fn emit_conversations(&self) {
        self.channels.emit(ChatEvent::ConversationsUpdated {
            conversations: self.reconciler.conversations().to_vec(),
        });
    }

    fn emit_timeline(&self) {
        if let Some((conversation, entries)) = self.reconciler.open_entries() {
            self.channels.emit(ChatEvent::TimelineUpdated {
                conversation,
                entries,
            });
        }
    }

    fn emit_failure(&self, err: ChatError) {
        self.channels.emit(normalize_failure(err));
    }
}

async fn recv_inbound(push: &mut Option<PushConnection>) -> Option<InboundFrame> {
    match push {
        Some(connection) => connection.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn token_error(err: TokenStoreError) -> ChatError {
    match err {
        TokenStoreError::NotFound | TokenStoreError::Empty => ChatError::new(
            ChatErrorCategory::Auth,
            "token_missing",
            "no bearer token stored for the session user",
        ),
        TokenStoreError::Unavailable(message) | TokenStoreError::Backend(message) => {
            ChatError::new(ChatErrorCategory::Auth, "token_store_unavailable", message)
        }
    }
}
