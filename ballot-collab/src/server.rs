//! WebSocket server for planning-poker rooms.
//!
//! Architecture:
//! ```text
//! ws://host/?username=A ──┐
//!                          ├── handshake (identity) ── connection task ── RoomCoordinator
//! ws://host/?username=B ──┘                                │                   │
//!                                                          │  ack              │ events
//!                                                          ◄───────────────────┘
//!                                                     per-socket outbox (bounded)
//! ```
//!
//! Each socket gets its own task running a `select!` loop over inbound
//! frames, its outbox and a heartbeat ping. Requests are handled one at a
//! time per socket and acknowledged on the same socket. A panicking handler
//! is answered with "Internal server error" and the socket stays open.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::coordinator::{CoordinatorConfig, RoomCoordinator, Session};
use crate::error::RoomError;
use crate::grace::DEFAULT_GRACE_PERIOD;
use crate::protocol::{AckFrame, AckPayload, ClientFrame};

/// Query parameter carrying the connecting identity.
pub const IDENTITY_PARAM: &str = "username";
/// Header alternative to [`IDENTITY_PARAM`].
pub const IDENTITY_HEADER: &str = "x-username";

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// How long a disconnected identity keeps its place
    pub grace_period: Duration,
    /// Outbox capacity per socket
    pub outbox_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Reject votes outside the room's voting scale
    pub enforce_voting_scale: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            grace_period: DEFAULT_GRACE_PERIOD,
            outbox_capacity: 256,
            heartbeat_interval_secs: 30,
            enforce_voting_scale: false,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `BALLOT_*` environment variables (and `PORT`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("BALLOT_BIND_ADDR") {
            config.bind_addr = addr;
        } else if let Some(port) = lookup("PORT") {
            let port: u16 = parse_var("PORT", &port)?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(ms) = lookup("BALLOT_GRACE_MS") {
            config.grace_period = Duration::from_millis(parse_var("BALLOT_GRACE_MS", &ms)?);
        }
        if let Some(cap) = lookup("BALLOT_OUTBOX_CAPACITY") {
            let cap: usize = parse_var("BALLOT_OUTBOX_CAPACITY", &cap)?;
            if cap == 0 {
                return Err(ConfigError::Invalid {
                    key: "BALLOT_OUTBOX_CAPACITY",
                    value: "0".into(),
                    reason: "must be at least 1".into(),
                });
            }
            config.outbox_capacity = cap;
        }
        if let Some(secs) = lookup("BALLOT_HEARTBEAT_SECS") {
            config.heartbeat_interval_secs = parse_var("BALLOT_HEARTBEAT_SECS", &secs)?;
        }
        if let Some(flag) = lookup("BALLOT_ENFORCE_SCALE") {
            config.enforce_voting_scale = parse_flag("BALLOT_ENFORCE_SCALE", &flag)?;
        }
        Ok(config)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            grace_period: self.grace_period,
            outbox_capacity: self.outbox_capacity,
            enforce_voting_scale: self.enforce_voting_scale,
        }
    }
}

fn parse_var<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected true, false, 1 or 0".into(),
        }),
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

/// The room server.
pub struct RoomServer {
    config: ServerConfig,
    coordinator: RoomCoordinator,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl RoomServer {
    pub fn new(config: ServerConfig) -> Self {
        let coordinator = RoomCoordinator::new(config.coordinator_config());
        Self {
            config,
            coordinator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Room server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, coordinator, stats, config).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection from handshake to close.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: RoomCoordinator,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> ConnectionResult {
        let mut identity = None;
        let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match identity_from_request(req) {
                Some(who) => {
                    identity = Some(who);
                    Ok(resp)
                }
                None => Err(unauthorized()),
            }
        })
        .await;

        let (ws_stream, identity) = match (handshake, identity) {
            (Ok(ws), Some(identity)) => (ws, identity),
            (result, _) => {
                stats.write().await.rejected_handshakes += 1;
                if let Err(e) = result {
                    log::warn!("Handshake from {addr} rejected: {e}");
                }
                return Ok(());
            }
        };

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let session = Session::new(identity);
        log::info!("WebSocket connection established from {addr} as {}", session.identity);
        let outbox = coordinator.connect(&session).await;

        let outcome = Self::serve(ws_stream, &coordinator, &session, outbox, &stats, &config).await;

        coordinator.disconnect(&session).await;
        stats.write().await.active_connections -= 1;
        log::info!("Connection closed from {addr} ({})", session.identity);
        outcome
    }

    /// Pump frames until the socket closes or fails.
    async fn serve(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        coordinator: &RoomCoordinator,
        session: &Session,
        mut outbox: mpsc::Receiver<Arc<str>>,
        stats: &Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
    ) -> ConnectionResult {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.write().await.total_messages += 1;
                            if let Some(reply) = Self::dispatch(coordinator, session, text.as_str()).await {
                                ws_sender.send(Message::text(reply)).await?;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Binary(_))) => {
                            log::warn!("Binary frame from {} ignored", session.identity);
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error for {}: {e}", session.identity);
                            break;
                        }

                        _ => {}
                    }
                }

                frame = outbox.recv() => {
                    match frame {
                        Some(data) => ws_sender.send(Message::text(data.to_string())).await?,
                        None => break,
                    }
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Default::default())).await?;
                }
            }
        }

        Ok(())
    }

    /// Decode one request, run it and build the ack frame, if one was asked for.
    async fn dispatch(coordinator: &RoomCoordinator, session: &Session, text: &str) -> Option<String> {
        let frame = match ClientFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Malformed frame from {}: {e}", session.identity);
                let ack = salvage_ack(text)?;
                return encode_ack(ack, AckPayload::error(e.to_string()));
            }
        };

        let payload = match frame.parse_event() {
            Ok(event) => {
                let handled = AssertUnwindSafe(coordinator.handle(session, event))
                    .catch_unwind()
                    .await;
                handled.unwrap_or_else(|_| {
                    let err = RoomError::Internal(format!("{} handler panicked", frame.event));
                    log::error!("{err:?} for {}", session.identity);
                    AckPayload::error(err.ack_message())
                })
            }
            Err(e) => {
                log::warn!("Rejected frame from {}: {e}", session.identity);
                AckPayload::error(e.to_string())
            }
        };

        encode_ack(frame.ack?, payload)
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.coordinator.room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared coordinator, for in-process inspection.
    pub fn coordinator(&self) -> &RoomCoordinator {
        &self.coordinator
    }
}

/// Identity from `?username=` or the `x-username` header. Blank is missing.
fn identity_from_request(req: &Request) -> Option<String> {
    let from_query = req.uri().query().and_then(|query| {
        form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == IDENTITY_PARAM)
            .map(|(_, value)| value.into_owned())
    });
    let from_header = || {
        req.headers()
            .get(IDENTITY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    from_query
        .or_else(from_header)
        .map(|who| who.trim().to_string())
        .filter(|who| !who.is_empty())
}

fn unauthorized() -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some("Username required".to_string()));
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp
}

/// Ack id from a frame that failed to decode as a request.
fn salvage_ack(text: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("ack")?
        .as_u64()
}

fn encode_ack(ack: u64, data: AckPayload) -> Option<String> {
    match (AckFrame { ack, data }).encode() {
        Ok(text) => Some(text),
        Err(e) => {
            log::error!("Failed to encode ack {ack}: {e}");
            None
        }
    }
}
