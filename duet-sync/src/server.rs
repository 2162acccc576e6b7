//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌── ReplicationLog ── coordination store
//!            ├── connection task ── SyncGateway ─┤
//! Client B ──┘        ▲                          └── DocumentRuntime ── BroadcastGroup
//!                     │                                                    │
//!                     └──────────── frames from other connections ─────────┘
//! ```
//!
//! Each connection task owns its [`Session`]. Replies and errors go to the
//! originating connection only; document and awareness changes reach the
//! other connections through the document's broadcast group.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::PeerReceiver;
use crate::config::ServerConfig;
use crate::error::SyncError;
use crate::gateway::{Session, SyncGateway};
use crate::protocol::{ClientMessage, ServerMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
    pub active_documents: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    rejected_messages: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    gateway: Arc<SyncGateway>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, gateway: Arc<SyncGateway>) -> Self {
        Self {
            config,
            gateway,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind the configured address. Port 0 picks a free port.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until the accept loop fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let gateway = self.gateway.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);

                if let Err(e) = Self::handle_connection(stream, addr, gateway, stats.clone()).await {
                    log::error!("Connection error from {addr}: {e}");
                }

                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        gateway: Arc<SyncGateway>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let connection_id = Uuid::new_v4();

        log::info!("WebSocket connection {connection_id} established from {addr}");

        let mut session: Option<Session> = None;
        let result = Self::connection_loop(
            &mut ws_sender,
            &mut ws_receiver,
            &gateway,
            &stats,
            connection_id,
            addr,
            &mut session,
        )
        .await;

        // Cleanup runs on every exit path.
        if let Some(session) = session.take() {
            gateway.leave(session);
        }
        log::info!("Connection {connection_id} from {addr} closed");
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn connection_loop(
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        gateway: &SyncGateway,
        stats: &AtomicServerStats,
        connection_id: Uuid,
        addr: SocketAddr,
        session: &mut Option<Session>,
    ) -> Result<(), BoxError> {
        let mut peer_rx: Option<PeerReceiver> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

                            let replies = Self::handle_message(
                                gateway,
                                connection_id,
                                session,
                                &mut peer_rx,
                                &data,
                            )
                            .await;
                            for reply in replies {
                                if matches!(reply, ServerMessage::Error { .. }) {
                                    stats.rejected_messages.fetch_add(1, Ordering::Relaxed);
                                }
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Close received from {addr}");
                            return Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                // Outgoing frames from other connections of the same document
                frame = async {
                    match peer_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not joined yet
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Process one client message; returns what goes back to this connection.
    async fn handle_message(
        gateway: &SyncGateway,
        connection_id: Uuid,
        session: &mut Option<Session>,
        peer_rx: &mut Option<PeerReceiver>,
        data: &[u8],
    ) -> Vec<ServerMessage> {
        let message = match ClientMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Failed to decode message on {connection_id}: {e}");
                return vec![error_message(&SyncError::from(e))];
            }
        };

        match message {
            ClientMessage::JoinRoom {
                room_code,
                client_handle,
                participant_id,
            } => {
                if let Some(previous) = session.take() {
                    *peer_rx = None;
                    gateway.leave(previous);
                }
                match gateway
                    .join(connection_id, &room_code, &client_handle, participant_id)
                    .await
                {
                    Ok((joined, rx)) => {
                        let reply = joined.joined();
                        *session = Some(joined);
                        *peer_rx = Some(rx);
                        vec![reply]
                    }
                    Err(e) => {
                        log::warn!("Join of {room_code:?} by {client_handle} failed: {e}");
                        vec![error_message(&e)]
                    }
                }
            }

            ClientMessage::Ping => vec![ServerMessage::Pong],

            other => {
                let Some(session) = session.as_mut() else {
                    return vec![error_message(&SyncError::NotJoined)];
                };
                let result = match other {
                    ClientMessage::RequestDoc => gateway.request_full_state(session).map(Some),
                    ClientMessage::RequestAwareness => gateway.request_awareness(session).map(Some),
                    ClientMessage::UpdateFile { message } => {
                        gateway.apply_client_update(session, &message).await
                    }
                    ClientMessage::UpdateAwareness { message } => gateway
                        .apply_awareness_update(session, &message)
                        .map(|()| None),
                    ClientMessage::JoinRoom { .. } | ClientMessage::Ping => Ok(None),
                };
                match result {
                    Ok(reply) => reply.into_iter().collect(),
                    Err(e) => {
                        log::debug!("Rejected message on {connection_id}: {e}");
                        vec![error_message(&e)]
                    }
                }
            }
        }
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            rejected_messages: self.stats.rejected_messages.load(Ordering::Relaxed),
            active_documents: self.gateway.registry().len(),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn gateway(&self) -> &Arc<SyncGateway> {
        &self.gateway
    }
}

fn error_message(error: &SyncError) -> ServerMessage {
    ServerMessage::Error {
        kind: error.kind(),
        message: error.to_string(),
    }
}
