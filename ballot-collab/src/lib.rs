//! # ballot-collab: Real-time planning-poker rooms
//!
//! Connected users create estimation rooms, join them, cast hidden votes and
//! let the room owner reveal or reset the ballot. Every change is pushed to
//! the affected sockets over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ RoomClient  │ ◄─────────────────► │ RoomServer  │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────────┐
//!                                     │ RoomCoordinator │
//!                                     └──────┬──────────┘
//!                        ┌───────────────┬───┴──────────┬──────────────────┐
//!                        ▼               ▼              ▼                  ▼
//!                   RoomStore   PresenceRegistry  GraceScheduler   BroadcastGateway
//! ```
//!
//! ## Modules
//!
//! - [`room`]: Room, ballot and the snapshots sent on the wire
//! - [`store`]: Room id → room, in creation order
//! - [`presence`]: Connected identities, across sockets
//! - [`grace`]: Deferred eviction after the last socket closes
//! - [`broadcast`]: Fan-out to sockets and room channels
//! - [`coordinator`]: Operations, authorization and broadcast ordering
//! - [`protocol`]: JSON frames, events and acks
//! - [`server`]: WebSocket server with identity handshake
//! - [`client`]: WebSocket client with ack correlation

pub mod error;
pub mod room;
pub mod store;
pub mod presence;
pub mod grace;
pub mod broadcast;
pub mod coordinator;
pub mod protocol;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use error::{OwnerAction, RoomError};
pub use room::{Ballot, Room, RoomId, RoomSnapshot, VoteCast, VoteValue, VotesUpdate};
pub use store::RoomStore;
pub use presence::{PresenceRegistry, Release};
pub use grace::{GraceError, GraceScheduler, DEFAULT_GRACE_PERIOD};
pub use broadcast::{BroadcastGateway, BroadcastStats, ConnectionId};
pub use coordinator::{CoordinatorConfig, RoomCoordinator, Session};
pub use protocol::{AckPayload, ClientEvent, ClientFrame, ProtocolError, ServerEvent, ServerFrame};
pub use server::{ConfigError, RoomServer, ServerConfig, ServerStats};
pub use client::{ClientError, RoomClient};
