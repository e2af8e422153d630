//! STOMP 1.2 framing and the WebSocket push transport built on it.

use std::time::Duration;

use async_trait::async_trait;
use chat_core::{ChatError, ChatErrorCategory, classify_http_status};
use chat_platform::BearerToken;
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message, client::IntoClientRequest, http::HeaderValue},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::transport::{HeartbeatTerms, InboundFrame, OutboundFrame, PushConnection, PushTransport};

/// Raw WebSocket endpoint of the FixItNow push broker.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/api/ws/websocket";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One decoded text message: either a heartbeat (bare EOL) or a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompPacket {
    Heartbeat,
    Frame(StompFrame),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of `name`; repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn encode(&self) -> String {
        let escape = escapes_headers(&self.command);
        let mut out = String::with_capacity(self.command.len() + self.body.len() + 64);
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    pub fn decode(raw: &str) -> Result<StompPacket, ChatError> {
        let raw = raw.trim_start_matches(['\r', '\n']);
        if raw.is_empty() {
            return Ok(StompPacket::Heartbeat);
        }

        let mut offset = 0;
        let mut lines = Vec::new();
        loop {
            let end = raw[offset..]
                .find('\n')
                .map(|idx| offset + idx)
                .ok_or_else(|| malformed("frame has no header terminator"))?;
            let line = raw[offset..end].trim_end_matches('\r');
            offset = end + 1;
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }

        let mut lines = lines.into_iter();
        let command = lines
            .next()
            .map(str::trim)
            .filter(|command| !command.is_empty())
            .ok_or_else(|| malformed("frame has no command"))?
            .to_owned();
        let escape = escapes_headers(&command);

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| malformed(format!("invalid header line '{line}'")))?;
            if escape {
                headers.push((unescape_header(name), unescape_header(value)));
            } else {
                headers.push((name.to_owned(), value.to_owned()));
            }
        }

        let rest = &raw[offset..];
        let content_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .and_then(|(_, value)| value.trim().parse::<usize>().ok());
        let body = match content_length {
            Some(len) => rest
                .get(..len)
                .ok_or_else(|| malformed("body shorter than content-length"))?,
            None => rest.find('\0').map_or(rest, |end| &rest[..end]),
        };

        Ok(StompPacket::Frame(StompFrame {
            command,
            headers,
            body: body.to_owned(),
        }))
    }
}

/// `CONNECT` frame for a session.
pub fn connect_frame(host: &str, bearer: &BearerToken, heartbeat: Duration) -> StompFrame {
    let heartbeat_ms = heartbeat.as_millis();
    StompFrame::new("CONNECT")
        .header("accept-version", "1.2")
        .header("host", host)
        .header("heart-beat", format!("{heartbeat_ms},{heartbeat_ms}"))
        .header("Authorization", bearer.authorization_header())
}

/// Combine the client's `heart-beat` offer with the server's reply.
///
/// The client offered `local` in both directions. A missing or zero side
/// disables that direction; otherwise the slower of the two periods wins.
pub fn negotiate_heartbeat(local: Duration, server: Option<&str>) -> HeartbeatTerms {
    let Some((server_sends, server_wants)) = server.and_then(parse_heart_beat) else {
        return HeartbeatTerms::disabled();
    };
    let combine = |ours: Duration, theirs: Duration| {
        if ours.is_zero() || theirs.is_zero() {
            Duration::ZERO
        } else {
            ours.max(theirs)
        }
    };
    HeartbeatTerms {
        outgoing: combine(local, server_wants),
        incoming: combine(local, server_sends),
    }
}

fn parse_heart_beat(value: &str) -> Option<(Duration, Duration)> {
    let (sends, wants) = value.split_once(',')?;
    let sends = sends.trim().parse::<u64>().ok()?;
    let wants = wants.trim().parse::<u64>().ok()?;
    Some((Duration::from_millis(sends), Duration::from_millis(wants)))
}

/// Wire text for an outbound frame.
pub fn encode_outbound(frame: &OutboundFrame) -> String {
    match frame {
        OutboundFrame::Subscribe { id, destination } => StompFrame::new("SUBSCRIBE")
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
            .encode(),
        OutboundFrame::Unsubscribe { id } => StompFrame::new("UNSUBSCRIBE").header("id", id).encode(),
        OutboundFrame::Send { destination, body } => StompFrame::new("SEND")
            .header("destination", destination)
            .header("content-type", "application/json")
            .header("content-length", body.len().to_string())
            .with_body(body.as_str())
            .encode(),
        OutboundFrame::Heartbeat => "\n".to_owned(),
    }
}

fn escapes_headers(command: &str) -> bool {
    !matches!(command, "CONNECT" | "CONNECTED")
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn malformed(message: impl Into<String>) -> ChatError {
    ChatError::new(
        ChatErrorCategory::Serialization,
        "malformed_stomp_frame",
        message,
    )
}

#[derive(Debug, Clone)]
pub struct StompTransportConfig {
    pub url: Url,
    /// Heart-beat interval advertised in both directions; zero disables.
    pub heartbeat: Duration,
    /// Capacity of the inbound and outbound frame queues.
    pub frame_buffer: usize,
}

impl StompTransportConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            heartbeat: Duration::from_millis(4_000),
            frame_buffer: 256,
        }
    }
}

/// Push transport speaking STOMP over a raw WebSocket.
#[derive(Debug, Clone)]
pub struct StompTransport {
    config: StompTransportConfig,
}

impl StompTransport {
    pub fn new(config: StompTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PushTransport for StompTransport {
    async fn connect(&self, bearer: &BearerToken) -> Result<PushConnection, ChatError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| ChatError::new(ChatErrorCategory::Config, "invalid_ws_url", err.to_string()))?;
        let authorization = HeaderValue::from_str(&bearer.authorization_header()).map_err(|err| {
            ChatError::new(ChatErrorCategory::Auth, "invalid_token", err.to_string())
        })?;
        request.headers_mut().insert("Authorization", authorization);

        debug!(url = %self.config.url, "opening push channel");
        let (mut ws, _) = connect_async(request).await.map_err(map_ws_error)?;

        let host = self.config.url.host_str().unwrap_or("localhost");
        let connect = connect_frame(host, bearer, self.config.heartbeat);
        ws.send(Message::Text(connect.encode().into()))
            .await
            .map_err(map_ws_error)?;
        let connected = await_connected(&mut ws).await?;
        let heartbeat = negotiate_heartbeat(self.config.heartbeat, connected.get("heart-beat"));
        debug!(
            version = connected.get("version").unwrap_or("?"),
            outgoing_ms = heartbeat.outgoing.as_millis() as u64,
            incoming_ms = heartbeat.incoming.as_millis() as u64,
            "stomp session established"
        );

        let buffer = self.config.frame_buffer.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
        let shutdown = CancellationToken::new();
        tokio::spawn(pump(ws, outbound_rx, inbound_tx, shutdown.clone()));

        Ok(PushConnection::new(outbound_tx, inbound_rx, shutdown).with_heartbeat(heartbeat))
    }
}

async fn await_connected(ws: &mut WsStream) -> Result<StompFrame, ChatError> {
    while let Some(message) = ws.next().await {
        let text = match message.map_err(map_ws_error)? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match StompFrame::decode(text.as_str())? {
            StompPacket::Heartbeat => {}
            StompPacket::Frame(frame) if frame.command == "CONNECTED" => return Ok(frame),
            StompPacket::Frame(frame) if frame.command == "ERROR" => {
                let message = frame
                    .get("message")
                    .map(ToOwned::to_owned)
                    .unwrap_or(frame.body);
                return Err(ChatError::new(
                    ChatErrorCategory::Auth,
                    "connect_rejected",
                    message,
                ));
            }
            StompPacket::Frame(frame) => {
                trace!(command = %frame.command, "ignoring frame before CONNECTED");
            }
        }
    }
    Err(ChatError::transport(
        "connection_closed",
        "push channel closed during handshake",
    ))
}

async fn pump(
    ws: WsStream,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    inbound: mpsc::Sender<InboundFrame>,
    shutdown: CancellationToken,
) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let disconnect = StompFrame::new("DISCONNECT").encode();
                let _ = sink.send(Message::Text(disconnect.into())).await;
                let _ = sink.close().await;
                break;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                trace!(?frame, "stomp frame out");
                if let Err(err) = sink.send(Message::Text(encode_outbound(&frame).into())).await {
                    warn!(error = %err, "push channel write failed");
                    let _ = inbound.send(InboundFrame::Error { message: err.to_string() }).await;
                    break;
                }
            }
            message = stream.next() => {
                let keep_going = match message {
                    Some(Ok(Message::Text(text))) => forward_text(text.as_str(), &inbound).await,
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                        true
                    }
                    Some(Ok(Message::Close(_))) | None => false,
                    Some(Ok(_)) => true,
                    Some(Err(err)) => {
                        warn!(error = %err, "push channel read failed");
                        let _ = inbound.send(InboundFrame::Error { message: err.to_string() }).await;
                        false
                    }
                };
                if !keep_going {
                    break;
                }
            }
        }
    }
    debug!("push channel pump stopped");
}

/// Forward one text message; returns `false` when the pump should stop.
async fn forward_text(text: &str, inbound: &mpsc::Sender<InboundFrame>) -> bool {
    let frame = match StompFrame::decode(text) {
        Ok(StompPacket::Heartbeat) => return inbound.send(InboundFrame::Heartbeat).await.is_ok(),
        Ok(StompPacket::Frame(frame)) => frame,
        Err(err) => {
            warn!(error = %err, "dropping undecodable push frame");
            return true;
        }
    };

    trace!(command = %frame.command, destination = frame.get("destination"), "stomp frame in");
    match frame.command.as_str() {
        "MESSAGE" => {
            let destination = frame.get("destination").unwrap_or_default().to_owned();
            inbound
                .send(InboundFrame::Message {
                    destination,
                    body: frame.body,
                })
                .await
                .is_ok()
        }
        "ERROR" => {
            let message = frame
                .get("message")
                .map(ToOwned::to_owned)
                .unwrap_or(frame.body);
            let _ = inbound.send(InboundFrame::Error { message }).await;
            false
        }
        _ => true,
    }
}

fn map_ws_error(err: tungstenite::Error) -> ChatError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            ChatError::new(
                classify_http_status(status),
                format!("ws_http_{status}"),
                format!("websocket upgrade rejected with status {status}"),
            )
        }
        other => ChatError::transport("websocket_error", other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(raw: &str) -> StompFrame {
        match StompFrame::decode(raw).expect("decodes") {
            StompPacket::Frame(frame) => frame,
            StompPacket::Heartbeat => panic!("expected a frame"),
        }
    }

    #[test]
    fn decodes_message_frame_with_json_body() {
        let parsed = frame(
            "MESSAGE\ndestination:/topic/conversation/1-2\nsubscription:sub-1\nmessage-id:7\n\n{\"id\":42}\0",
        );
        assert_eq!(parsed.command, "MESSAGE");
        assert_eq!(parsed.get("destination"), Some("/topic/conversation/1-2"));
        assert_eq!(parsed.body, "{\"id\":42}");
    }

    #[test]
    fn bare_end_of_line_is_a_heartbeat() {
        assert_eq!(StompFrame::decode("\n").expect("heartbeat"), StompPacket::Heartbeat);
        assert_eq!(StompFrame::decode("\r\n").expect("heartbeat"), StompPacket::Heartbeat);
    }

    #[test]
    fn honors_content_length_and_crlf_lines() {
        let parsed = frame("MESSAGE\r\ndestination:/user/2/queue/notifications\r\ncontent-length:5\r\n\r\nab\0cd\0");
        assert_eq!(parsed.body, "ab\0cd");
        assert_eq!(parsed.get("destination"), Some("/user/2/queue/notifications"));
    }

    #[test]
    fn header_escaping_survives_encode_decode() {
        let original = StompFrame::new("SEND")
            .header("destination", "/app/chat.markAsRead/1-2")
            .header("note", "a:b\\c\nd")
            .with_body("{}");
        let parsed = frame(&original.encode());
        assert_eq!(parsed.get("note"), Some("a:b\\c\nd"));
        assert_eq!(parsed.body, "{}");
    }

    #[test]
    fn connect_frames_keep_header_values_verbatim() {
        let bearer = BearerToken::new("abc:def").expect("token");
        let encoded = connect_frame("localhost", &bearer, Duration::from_millis(4_000)).encode();
        assert!(encoded.starts_with("CONNECT\n"));
        assert!(encoded.contains("accept-version:1.2\n"));
        assert!(encoded.contains("heart-beat:4000,4000\n"));
        assert!(encoded.contains("Authorization:Bearer abc:def\n"));
        assert!(encoded.ends_with("\n\n\0"));

        let connected = frame("CONNECTED\nversion:1.2\nheart-beat:0,0\n\n\0");
        assert_eq!(connected.get("version"), Some("1.2"));
    }

    #[test]
    fn heartbeat_negotiation_follows_server_reply() {
        let local = Duration::from_millis(4_000);
        assert_eq!(
            negotiate_heartbeat(local, Some("0,0")),
            HeartbeatTerms::disabled()
        );
        assert_eq!(negotiate_heartbeat(local, None), HeartbeatTerms::disabled());
        assert_eq!(
            negotiate_heartbeat(local, Some("10000,1000")),
            HeartbeatTerms {
                outgoing: Duration::from_millis(4_000),
                incoming: Duration::from_millis(10_000),
            }
        );
        assert_eq!(
            negotiate_heartbeat(local, Some("0, 5000")),
            HeartbeatTerms {
                outgoing: Duration::from_millis(5_000),
                incoming: Duration::ZERO,
            }
        );
        assert_eq!(
            negotiate_heartbeat(Duration::ZERO, Some("4000,4000")),
            HeartbeatTerms::disabled()
        );
        assert_eq!(
            negotiate_heartbeat(local, Some("soon")),
            HeartbeatTerms::disabled()
        );
    }

    #[tokio::test]
    async fn broker_without_heartbeats_yields_disabled_terms() {
        use tokio::{net::TcpListener, time::timeout};

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let broker = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream)
                .await
                .expect("upgrade");
            let connect = ws.next().await.expect("connect frame").expect("readable");
            assert!(connect.to_text().expect("text").starts_with("CONNECT\n"));
            ws.send(Message::Text(
                "CONNECTED\nversion:1.2\nheart-beat:0,0\n\n\0".into(),
            ))
            .await
            .expect("connected frame");
            ws
        });

        let url = Url::parse(&format!("ws://{addr}/api/ws/websocket")).expect("url");
        let mut config = StompTransportConfig::new(url);
        config.heartbeat = Duration::from_millis(100);
        let connection = timeout(
            Duration::from_secs(5),
            StompTransport::new(config).connect(&BearerToken::new("abc").expect("token")),
        )
        .await
        .expect("handshake in time")
        .expect("handshake succeeds");
        let _broker = broker.await.expect("broker task");

        assert_eq!(connection.heartbeat(), Some(HeartbeatTerms::disabled()));
    }

    #[test]
    fn rejects_frames_without_header_terminator() {
        let err = StompFrame::decode("MESSAGE\ndestination:/x").expect_err("truncated frame");
        assert_eq!(err.code, "malformed_stomp_frame");
        assert!(StompFrame::decode("MESSAGE\nbroken header\n\n\0").is_err());
    }

    #[test]
    fn encodes_outbound_frames() {
        let subscribe = encode_outbound(&OutboundFrame::Subscribe {
            id: "sub-1".into(),
            destination: "/topic/conversation/1-2".into(),
        });
        assert_eq!(
            subscribe,
            "SUBSCRIBE\nid:sub-1\ndestination:/topic/conversation/1-2\nack:auto\n\n\0"
        );

        let send = frame(&encode_outbound(&OutboundFrame::Send {
            destination: "/app/chat.markAsRead/1-2".into(),
            body: r#"{"type":"READ","userId":2}"#.into(),
        }));
        assert_eq!(send.get("content-type"), Some("application/json"));
        assert_eq!(send.body, r#"{"type":"READ","userId":2}"#);

        assert_eq!(encode_outbound(&OutboundFrame::Heartbeat), "\n");
    }
}
