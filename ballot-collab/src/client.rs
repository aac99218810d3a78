//! WebSocket client for the room server.
//!
//! Provides:
//! - Connection with identity handshake
//! - Request/ack correlation with a per-request timeout
//! - A stream of server-pushed [`ServerEvent`]s

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::protocol::{
    AckPayload, ClientEvent, ClientFrame, CreateRoom, ProtocolError, RoomRef, ServerEvent,
    ServerFrame, SubmitVote,
};
use crate::room::{RoomSnapshot, VoteValue};
use crate::server::IDENTITY_PARAM;

/// Default time to wait for an ack.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with `{error: ...}`.
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<AckPayload>>>>;

/// Connected client. Dropping it closes the socket.
pub struct RoomClient {
    identity: String,
    outgoing: mpsc::Sender<String>,
    pending: PendingAcks,
    next_ack: AtomicU64,
    request_timeout: Duration,
}

impl RoomClient {
    /// Connect as `identity`. Returns the client and the receiver of pushed events.
    pub async fn connect(
        url: &str,
        identity: &str,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>), ClientError> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair(IDENTITY_PARAM, identity)
            .finish();
        let target = if url.contains('?') {
            format!("{url}&{query}")
        } else {
            format!("{}/?{query}", url.trim_end_matches('/'))
        };

        let (ws_stream, _) = tokio_tungstenite::connect_async(&target)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(resp) => {
                    ClientError::Protocol(ProtocolError::HandshakeRejected(resp.status().to_string()))
                }
                other => ClientError::Connect(other.to_string()),
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing frames, close the socket when the client is dropped.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route acks to their waiters and events to the application.
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::channel(256);
        let acks = pending.clone();
        let who = identity.to_string();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerFrame::decode(text.as_str()) {
                        Ok(ServerFrame::Ack(frame)) => {
                            if let Some(waiter) = acks.lock().await.remove(&frame.ack) {
                                let _ = waiter.send(frame.data);
                            }
                        }
                        Ok(ServerFrame::Event(event)) => {
                            let _ = event_tx.send(event).await;
                        }
                        Err(e) => log::warn!("Undecodable frame for {who}: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            // Waiters see a closed channel.
            acks.lock().await.clear();
            log::debug!("Client connection for {who} ended");
        });

        let client = Self {
            identity: identity.to_string(),
            outgoing: out_tx,
            pending,
            next_ack: AtomicU64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        };
        Ok((client, event_rx))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Send a request and wait for its ack. `{error}` acks become [`ClientError::Rejected`].
    pub async fn request(&self, event: &ClientEvent) -> Result<AckPayload, ClientError> {
        let ack = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let text = ClientFrame::request(event, Some(ack))?.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(ack, tx);
        if self.outgoing.send(text).await.is_err() {
            self.pending.lock().await.remove(&ack);
            return Err(ProtocolError::ConnectionClosed.into());
        }

        let payload = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(_)) => return Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => {
                self.pending.lock().await.remove(&ack);
                return Err(ProtocolError::Timeout.into());
            }
        };
        match payload.error {
            Some(message) => Err(ClientError::Rejected(message)),
            None => Ok(payload),
        }
    }

    pub async fn create_room(
        &self,
        name: &str,
        voting_scale: Vec<VoteValue>,
    ) -> Result<RoomSnapshot, ClientError> {
        let event = ClientEvent::CreateRoom(CreateRoom {
            name: name.to_string(),
            voting_scale,
        });
        room_of(self.request(&event).await?)
    }

    pub async fn join_room(&self, room_id: &str) -> Result<RoomSnapshot, ClientError> {
        room_of(self.request(&ClientEvent::JoinRoom(room_ref(room_id))).await?)
    }

    pub async fn leave_room(&self, room_id: &str) -> Result<(), ClientError> {
        self.request(&ClientEvent::LeaveRoom(room_ref(room_id))).await?;
        Ok(())
    }

    pub async fn submit_vote(
        &self,
        room_id: &str,
        value: impl Into<VoteValue>,
    ) -> Result<(), ClientError> {
        let event = ClientEvent::SubmitVote(SubmitVote {
            room_id: room_id.to_string(),
            value: value.into(),
        });
        self.request(&event).await?;
        Ok(())
    }

    pub async fn reveal_votes(&self, room_id: &str) -> Result<(), ClientError> {
        self.request(&ClientEvent::RevealVotes(room_ref(room_id))).await?;
        Ok(())
    }

    pub async fn reset_votes(&self, room_id: &str) -> Result<(), ClientError> {
        self.request(&ClientEvent::ResetVotes(room_ref(room_id))).await?;
        Ok(())
    }
}

fn room_ref(room_id: &str) -> RoomRef {
    RoomRef {
        room_id: room_id.to_string(),
    }
}

fn room_of(payload: AckPayload) -> Result<RoomSnapshot, ClientError> {
    payload
        .room
        .ok_or_else(|| ProtocolError::Deserialization("ack carries no room".into()).into())
}
