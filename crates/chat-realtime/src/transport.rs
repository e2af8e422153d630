//! Push channel seam between the runtime and the wire protocol.

use std::time::Duration;

use async_trait::async_trait;
use chat_core::ChatError;
use chat_platform::BearerToken;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Frame the runtime asks the transport to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Subscribe { id: String, destination: String },
    Unsubscribe { id: String },
    Send { destination: String, body: String },
    Heartbeat,
}

/// Frame the transport read from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Message { destination: String, body: String },
    Heartbeat,
    /// Server-side error; the connection is about to close.
    Error { message: String },
}

/// Heartbeat periods agreed with the server; zero disables a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTerms {
    /// How often the client must send a heartbeat.
    pub outgoing: Duration,
    /// How often the server promised to send one.
    pub incoming: Duration,
}

impl HeartbeatTerms {
    pub fn disabled() -> Self {
        Self {
            outgoing: Duration::ZERO,
            incoming: Duration::ZERO,
        }
    }

    pub fn symmetric(interval: Duration) -> Self {
        Self {
            outgoing: interval,
            incoming: interval,
        }
    }
}

/// Established push connection.
///
/// The inbound side returns `None` once the transport is gone. Dropping the
/// connection stops its pump task.
#[derive(Debug)]
pub struct PushConnection {
    outbound: mpsc::Sender<OutboundFrame>,
    inbound: mpsc::Receiver<InboundFrame>,
    shutdown: CancellationToken,
    heartbeat: Option<HeartbeatTerms>,
}

impl PushConnection {
    pub fn new(
        outbound: mpsc::Sender<OutboundFrame>,
        inbound: mpsc::Receiver<InboundFrame>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            inbound,
            shutdown,
            heartbeat: None,
        }
    }

    /// Attach the heartbeat periods negotiated during the handshake.
    pub fn with_heartbeat(mut self, terms: HeartbeatTerms) -> Self {
        self.heartbeat = Some(terms);
        self
    }

    /// Negotiated heartbeat periods; `None` when the transport has no
    /// heartbeat negotiation of its own.
    pub fn heartbeat(&self) -> Option<HeartbeatTerms> {
        self.heartbeat
    }

    pub async fn send(&self, frame: OutboundFrame) -> Result<(), ChatError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ChatError::transport("transport_closed", "push connection is closed"))
    }

    pub async fn recv(&mut self) -> Option<InboundFrame> {
        self.inbound.recv().await
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for PushConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Open the channel and complete the protocol handshake.
    async fn connect(&self, bearer: &BearerToken) -> Result<PushConnection, ChatError>;
}
