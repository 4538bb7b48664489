use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use crate::engine::{ExecutionEngine, ExecutionRequest};
use crate::error::InboundError;
use crate::protocol::{ClientMessage, Outbound, ServerMessage};
use crate::registry::{ChannelId, ConnectionRegistry};

// ---------------------------------------------------------------------------
// Origin validation
// ---------------------------------------------------------------------------

/// Decide whether a WebSocket upgrade with this `Origin` is accepted.
///
/// Accepted without configuration:
/// - no `Origin` header (non-browser clients)
/// - `null` (file:// contexts)
/// - `http(s)://localhost[:port]` and `http(s)://127.0.0.1[:port]`
///
/// Anything else must appear verbatim in `allowed`.
pub fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    if origin == "null" || allowed.iter().any(|a| a == origin) {
        return true;
    }
    let host = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"));
    match host {
        Some(rest) => {
            let host = rest.split(':').next().unwrap_or(rest);
            host == "localhost" || host == "127.0.0.1"
        }
        None => false,
    }
}

fn forbidden() -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some("Origin not allowed".into()));
    *resp.status_mut() = http::StatusCode::FORBIDDEN;
    resp
}

// ---------------------------------------------------------------------------
// WsServer
// ---------------------------------------------------------------------------

const DEFAULT_MAX_CONNECTIONS: usize = 256;
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Channel endpoint: one WebSocket connection per channel, JSON text frames
/// in both directions.
pub struct WsServer {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    engine: ExecutionEngine,
    cancel: CancellationToken,
    max_connections: usize,
    queue_capacity: usize,
    allowed_origins: Arc<Vec<String>>,
}

impl WsServer {
    pub fn new(
        addr: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        engine: ExecutionEngine,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            addr,
            registry,
            engine,
            cancel,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            allowed_origins: Arc::new(Vec::new()),
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Outbound queue depth per channel.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = Arc::new(origins);
        self
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, max_connections = self.max_connections, "ws server listening");
        self.serve(listener).await
    }

    /// Bind and report the actual local address (useful with port 0).
    pub async fn bind(&self) -> std::io::Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, max_connections = self.max_connections, "ws server bound");
        Ok((listener, local_addr))
    }

    /// Accept loop on a pre-bound listener. Returns when cancelled.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!(error = %e, "ws: TCP accept failed");
                            continue;
                        }
                    };
                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        tracing::warn!(
                            peer = %peer,
                            max = self.max_connections,
                            "ws: connection limit reached, rejecting"
                        );
                        drop(stream);
                        continue;
                    };
                    let channel = ChannelTask {
                        registry: Arc::clone(&self.registry),
                        engine: self.engine.clone(),
                        cancel: self.cancel.clone(),
                        queue_capacity: self.queue_capacity,
                        peer,
                    };
                    let allowed = Arc::clone(&self.allowed_origins);
                    tokio::spawn(async move {
                        let _permit = permit;
                        let check = |req: &Request, resp: Response| {
                            let origin = req.headers().get("origin").map(|v| v.to_str().unwrap_or(""));
                            if origin_allowed(origin, &allowed) {
                                Ok(resp)
                            } else {
                                tracing::warn!(peer = %peer, origin = ?origin, "ws: origin rejected");
                                Err(forbidden())
                            }
                        };
                        match tokio_tungstenite::accept_hdr_async(stream, check).await {
                            Ok(ws) => channel.run(ws).await,
                            Err(e) => tracing::debug!(peer = %peer, error = %e, "ws handshake failed"),
                        }
                    });
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("ws server: cancellation requested, shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-channel task
// ---------------------------------------------------------------------------

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

struct ChannelTask {
    registry: Arc<ConnectionRegistry>,
    engine: ExecutionEngine,
    cancel: CancellationToken,
    queue_capacity: usize,
    peer: SocketAddr,
}

impl ChannelTask {
    async fn run(self, ws: WebSocketStream<TcpStream>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.registry.register(tx);
        tracing::info!(channel_id = %id, peer = %self.peer, "channel connected");

        match self.pump(&id, ws, rx).await {
            Ok(()) => tracing::info!(channel_id = %id, "channel disconnected"),
            Err(e) => tracing::info!(channel_id = %id, error = %e, "channel lost"),
        }
        self.registry.remove(&id);
    }

    async fn pump(
        &self,
        id: &ChannelId,
        ws: WebSocketStream<TcpStream>,
        mut rx: mpsc::Receiver<Outbound>,
    ) -> Result<(), WsError> {
        let (mut ws_tx, mut ws_rx) = ws.split();

        let hello = ServerMessage::ConnectionEstablished {
            connection_id: id.to_string(),
            timestamp: Utc::now(),
        };
        send(&mut ws_tx, &hello).await?;

        loop {
            tokio::select! {
                frame = ws_rx.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => return Err(e),
                        None => return Ok(()),
                    };
                    self.registry.mark_alive(id);

                    let parsed = match frame {
                        Message::Text(text) => ClientMessage::parse(&text),
                        Message::Binary(_) => Err(InboundError::Binary),
                        Message::Close(_) => return Ok(()),
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    };
                    let reply = match parsed {
                        Ok(msg) => self.handle(id, msg),
                        Err(e) => {
                            tracing::warn!(channel_id = %id, error = %e, "malformed inbound frame");
                            Some(ServerMessage::error(e.to_string()))
                        }
                    };
                    if let Some(reply) = reply {
                        send(&mut ws_tx, &reply).await?;
                    }
                }
                item = rx.recv() => {
                    match item {
                        Some(Outbound::Message(msg)) => send(&mut ws_tx, &msg).await?,
                        Some(Outbound::Probe) => ws_tx.send(Message::Ping(Vec::new())).await?,
                        Some(Outbound::Close) | None => {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    /// Apply one inbound message. Returns the direct reply, if any.
    fn handle(&self, id: &ChannelId, msg: ClientMessage) -> Option<ServerMessage> {
        match msg {
            ClientMessage::Authenticate {
                user_id,
                session_id,
            } => {
                if user_id.is_empty() {
                    return Some(ServerMessage::error("userId must not be empty"));
                }
                if !self.registry.bind(id, &user_id, session_id.as_deref()) {
                    return None;
                }
                Some(ServerMessage::AuthenticationSuccess {
                    user_id,
                    session_id,
                })
            }
            ClientMessage::Subscribe { channel } => {
                if channel.is_empty() {
                    return Some(ServerMessage::error("channel must not be empty"));
                }
                self.registry.subscribe(id, &channel);
                tracing::debug!(channel_id = %id, topic = %channel, "subscribed");
                Some(ServerMessage::SubscriptionSuccess { channel })
            }
            ClientMessage::Unsubscribe { channel } => {
                self.registry.unsubscribe(id, &channel);
                tracing::debug!(channel_id = %id, topic = %channel, "unsubscribed");
                Some(ServerMessage::UnsubscriptionSuccess { channel })
            }
            ClientMessage::Ping => Some(ServerMessage::Pong {
                timestamp: Utc::now(),
            }),
            ClientMessage::StartExecution {
                test_case_id,
                params,
                fault_injection,
            } => {
                let Some(user_id) = self.user(id) else {
                    return Some(ServerMessage::error("authenticate before starting executions"));
                };
                // The owner's channels, this one included, receive execution_queued.
                self.engine.submit(
                    ExecutionRequest::new(test_case_id, user_id)
                        .with_params(params)
                        .with_fault_injection(fault_injection),
                );
                None
            }
            ClientMessage::CancelExecution { execution_id } => {
                let Some(user_id) = self.user(id) else {
                    return Some(ServerMessage::error("authenticate before cancelling executions"));
                };
                match self.engine.get(&execution_id) {
                    None => Some(ServerMessage::error(format!("unknown execution {execution_id}"))),
                    Some(e) if e.user_id != user_id => Some(ServerMessage::error(format!(
                        "execution {execution_id} belongs to another user"
                    ))),
                    Some(_) if self.engine.cancel(&execution_id) => None,
                    Some(_) => Some(ServerMessage::error(format!(
                        "execution {execution_id} is not running"
                    ))),
                }
            }
        }
    }

    fn user(&self, id: &ChannelId) -> Option<String> {
        self.registry.snapshot(id).and_then(|view| view.user_id)
    }
}

async fn send(ws_tx: &mut WsSink, msg: &ServerMessage) -> Result<(), WsError> {
    match serde_json::to_string(msg) {
        Ok(text) => ws_tx.send(Message::Text(text)).await,
        Err(e) => {
            tracing::error!(kind = msg.kind(), error = %e, "outbound serialization failed");
            Ok(())
        }
    }
}
