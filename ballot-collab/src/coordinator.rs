//! Room coordinator: the protocol state machine.
//!
//! ```text
//!  socket task ──ClientEvent──► RoomCoordinator::handle ──► AckPayload ──► same socket
//!                                      │
//!                         ┌────────────┼─────────────┐
//!                         ▼            ▼             ▼
//!                     RoomStore  PresenceRegistry  GraceScheduler
//!                         └────────────┬─────────────┘
//!                                      ▼
//!                              BroadcastGateway ──► room members / everyone
//! ```
//!
//! All mutable state sits behind one async mutex. An operation holds it from
//! validation through every broadcast it triggers, so operations (and grace
//! expiries) are applied one at a time, and broadcasts for one room leave in
//! the order the operations were applied. Sends are non-blocking `try_send`s
//! into per-socket outboxes; the lock is never held across socket I/O.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::broadcast::{BroadcastGateway, ConnectionId};
use crate::error::{OwnerAction, RoomError};
use crate::grace::{GraceScheduler, DEFAULT_GRACE_PERIOD};
use crate::presence::{PresenceRegistry, Release};
use crate::protocol::{AckPayload, ClientEvent, CreateRoom, ServerEvent};
use crate::room::{Room, RoomSnapshot, VoteCast, VoteValue};
use crate::store::RoomStore;

/// One authenticated socket: a connection id plus the identity it claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub conn: ConnectionId,
    pub identity: String,
}

impl Session {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            conn: Uuid::new_v4(),
            identity: identity.into(),
        }
    }
}

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Delay between an identity's last socket closing and its eviction.
    pub grace_period: Duration,
    /// Bounded outbox size per socket.
    pub outbox_capacity: usize,
    /// Reject votes that are not on the room's voting scale.
    pub enforce_voting_scale: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            outbox_capacity: 256,
            enforce_voting_scale: false,
        }
    }
}

#[derive(Default)]
struct RoomState {
    store: RoomStore,
    presence: PresenceRegistry,
    grace: GraceScheduler,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RoomCoordinator {
    state: Arc<Mutex<RoomState>>,
    gateway: Arc<BroadcastGateway>,
    config: CoordinatorConfig,
    /// Makes the next room creation panic while holding the state lock.
    #[cfg(test)]
    fault_next: Arc<std::sync::atomic::AtomicBool>,
}

impl RoomCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(RoomState::default())),
            gateway: Arc::new(BroadcastGateway::new(config.outbox_capacity)),
            config,
            #[cfg(test)]
            fault_next: Arc::default(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CoordinatorConfig::default())
    }

    // ── Connection lifecycle ────────────────────────────────────

    /// Register a new socket for `session.identity`.
    ///
    /// Cancels a pending grace removal, broadcasts the presence list to
    /// everyone and sends the current room list to the new socket. Returns
    /// the socket's outbox receiver.
    pub async fn connect(&self, session: &Session) -> mpsc::Receiver<Arc<str>> {
        let mut state = self.state.lock().await;
        let identity = session.identity.as_str();

        if state.grace.cancel(identity) {
            log::info!("{identity} reconnected within grace window");
        }
        let first = state.presence.connect(identity);
        let rx = self.gateway.register(session.conn, identity).await;
        log::info!(
            "{identity} connected ({}, {} socket(s))",
            if first { "new" } else { "known" },
            state.presence.socket_count(identity)
        );

        self.emit_all(ServerEvent::UsersUpdate(state.presence.snapshot()))
            .await;
        let rooms = ServerEvent::RoomsUpdate(state.store.snapshots());
        if let Err(e) = self.gateway.to_connection(&session.conn, &rooms).await {
            log::error!("Failed to send initial rooms to {identity}: {e}");
        }
        rx
    }

    /// Unregister a closed socket. If it was the identity's last one, arm
    /// the grace timer; presence and room membership are untouched until it
    /// fires.
    pub async fn disconnect(&self, session: &Session) {
        let mut state = self.state.lock().await;
        let identity = session.identity.as_str();
        self.gateway.unregister(&session.conn).await;

        match state.presence.disconnect(identity) {
            Release::LastSocket => {
                let coordinator = self.clone();
                let who = identity.to_string();
                let armed = state.grace.schedule(
                    identity,
                    self.config.grace_period,
                    move |generation| async move {
                        coordinator.expire(&who, generation).await;
                    },
                );
                match armed {
                    Ok(_) => log::info!(
                        "{identity} disconnected, removal in {:?}",
                        self.config.grace_period
                    ),
                    Err(e) => log::warn!("Grace timer not armed: {e}"),
                }
            }
            Release::StillConnected => {
                log::debug!("{identity} closed a socket, others remain");
            }
            Release::Unknown => {
                log::warn!("Disconnect for unknown identity {identity}");
            }
        }
    }

    /// Grace timer callback: evict `identity` unless the timer was cancelled.
    async fn expire(&self, identity: &str, generation: u64) {
        let mut state = self.state.lock().await;
        if !state.grace.claim(identity, generation) {
            log::debug!("Stale grace timer #{generation} for {identity} ignored");
            return;
        }
        if !state.presence.remove(identity) {
            log::warn!("Grace expired for {identity} but sockets are open; keeping");
            return;
        }
        log::info!("Grace window expired for {identity}, evicting");

        for room_id in state.store.rooms_of(identity) {
            self.gateway.unsubscribe(&room_id, identity).await;
            let remaining = match state.store.get_mut(&room_id) {
                Some(room) => {
                    room.remove_participant(identity);
                    (!room.is_empty()).then(|| room.snapshot())
                }
                None => continue,
            };
            match remaining {
                Some(snapshot) => {
                    self.emit_room(&room_id, ServerEvent::RoomUpdated(snapshot))
                        .await;
                }
                None => {
                    state.store.delete(&room_id);
                    self.gateway.close_channel(&room_id).await;
                    log::info!("Room {room_id} deleted (empty after eviction)");
                }
            }
        }

        self.emit_all(ServerEvent::UsersUpdate(state.presence.snapshot()))
            .await;
        self.emit_all(ServerEvent::RoomsUpdate(state.store.snapshots()))
            .await;
    }

    // ── Client operations ───────────────────────────────────────

    /// Dispatch a client request and build its ack.
    pub async fn handle(&self, session: &Session, event: ClientEvent) -> AckPayload {
        let name = event.name();
        let result = match event {
            ClientEvent::CreateRoom(req) => self
                .create_room(session, req)
                .await
                .map(AckPayload::with_room),
            ClientEvent::JoinRoom(r) => self
                .join_room(session, &r.room_id)
                .await
                .map(AckPayload::with_room),
            ClientEvent::LeaveRoom(r) => self
                .leave_room(session, &r.room_id)
                .await
                .map(|()| AckPayload::ok()),
            ClientEvent::SubmitVote(v) => self
                .submit_vote(session, &v.room_id, v.value)
                .await
                .map(|()| AckPayload::ok()),
            ClientEvent::RevealVotes(r) => self
                .reveal_votes(session, &r.room_id)
                .await
                .map(|()| AckPayload::ok()),
            ClientEvent::ResetVotes(r) => self
                .reset_votes(session, &r.room_id)
                .await
                .map(|()| AckPayload::ok()),
        };

        result.unwrap_or_else(|err| {
            match &err {
                RoomError::Internal(detail) => {
                    log::error!("{name} from {} failed: {detail}", session.identity)
                }
                _ => log::debug!("{name} from {} rejected: {err}", session.identity),
            }
            AckPayload::error(err.ack_message())
        })
    }

    /// Create a room owned by the requester, who becomes its sole participant.
    pub async fn create_room(
        &self,
        session: &Session,
        req: CreateRoom,
    ) -> Result<RoomSnapshot, RoomError> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(RoomError::validation("Room name is required"));
        }
        if req.voting_scale.is_empty() {
            return Err(RoomError::validation("Voting scale must not be empty"));
        }

        let mut state = self.state.lock().await;
        #[cfg(test)]
        if self.fault_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
            panic!("injected fault in create_room");
        }
        let identity = session.identity.as_str();
        let id = state.store.allocate_id();
        let room = Room::new(id.clone(), name.to_string(), identity, req.voting_scale);
        let snapshot = room.snapshot();
        state.store.create(room);
        self.gateway.subscribe(&id, identity).await;
        log::info!("{identity} created room {id} ({name})");

        self.emit_all(ServerEvent::RoomsUpdate(state.store.snapshots()))
            .await;
        Ok(snapshot)
    }

    /// Join a room. Joining twice is a no-op, not an error.
    pub async fn join_room(
        &self,
        session: &Session,
        room_id: &str,
    ) -> Result<RoomSnapshot, RoomError> {
        let mut state = self.state.lock().await;
        let identity = session.identity.as_str();
        let room = state.store.get_mut(room_id).ok_or(RoomError::RoomNotFound)?;
        if room.add_participant(identity) {
            log::info!("{identity} joined room {room_id}");
        }
        let snapshot = room.snapshot();
        self.gateway.subscribe(room_id, identity).await;

        self.emit_room(room_id, ServerEvent::RoomUpdated(snapshot.clone()))
            .await;
        self.emit_all(ServerEvent::RoomsUpdate(state.store.snapshots()))
            .await;
        Ok(snapshot)
    }

    /// Leave a room, withdrawing any vote. The last one out deletes the room.
    pub async fn leave_room(&self, session: &Session, room_id: &str) -> Result<(), RoomError> {
        let mut state = self.state.lock().await;
        let identity = session.identity.as_str();
        let room = state.store.get_mut(room_id).ok_or(RoomError::RoomNotFound)?;
        room.remove_participant(identity);
        let remaining = (!room.is_empty()).then(|| room.snapshot());
        self.gateway.unsubscribe(room_id, identity).await;
        log::info!("{identity} left room {room_id}");

        match remaining {
            Some(snapshot) => {
                self.emit_room(room_id, ServerEvent::RoomUpdated(snapshot))
                    .await;
            }
            None => {
                state.store.delete(room_id);
                self.gateway.close_channel(room_id).await;
                log::info!("Room {room_id} deleted (empty)");
            }
        }
        self.emit_all(ServerEvent::RoomsUpdate(state.store.snapshots()))
            .await;
        Ok(())
    }

    /// Record or overwrite the requester's vote. Room members only learn
    /// that the requester has voted.
    ///
    /// Only current participants may vote. Someone who left the room, or
    /// was evicted after the grace window, gets `NotParticipant` and must
    /// join again first.
    pub async fn submit_vote(
        &self,
        session: &Session,
        room_id: &str,
        value: VoteValue,
    ) -> Result<(), RoomError> {
        let mut state = self.state.lock().await;
        let identity = session.identity.as_str();
        let room = state.store.get_mut(room_id).ok_or(RoomError::RoomNotFound)?;
        if !room.is_participant(identity) {
            return Err(RoomError::NotParticipant);
        }
        if self.config.enforce_voting_scale && !room.accepts_vote(&value) {
            return Err(RoomError::Validation(format!(
                "Vote {value} is not on this room's voting scale"
            )));
        }
        room.cast_vote(identity, value);
        log::debug!("{identity} voted in room {room_id}");

        let cast = VoteCast {
            username: identity.to_string(),
            has_voted: true,
        };
        self.emit_room(room_id, ServerEvent::VoteCast(cast)).await;
        Ok(())
    }

    /// Owner only: expose every ballot value to the room.
    ///
    /// Revealing an empty ballot succeeds, but the room stays hidden and the
    /// `room:votes` broadcast carries `revealed: false`.
    pub async fn reveal_votes(&self, session: &Session, room_id: &str) -> Result<(), RoomError> {
        let mut state = self.state.lock().await;
        let room = state.store.get_mut(room_id).ok_or(RoomError::RoomNotFound)?;
        if !room.is_owner(&session.identity) {
            return Err(RoomError::NotAuthorized {
                action: OwnerAction::Reveal,
            });
        }
        room.reveal();
        let update = room.votes_update();
        log::info!("Votes revealed in room {room_id} ({} ballots)", update.votes.len());

        self.emit_room(room_id, ServerEvent::Votes(update)).await;
        Ok(())
    }

    /// Owner only: clear the ballot and hide values again.
    pub async fn reset_votes(&self, session: &Session, room_id: &str) -> Result<(), RoomError> {
        let mut state = self.state.lock().await;
        let room = state.store.get_mut(room_id).ok_or(RoomError::RoomNotFound)?;
        if !room.is_owner(&session.identity) {
            return Err(RoomError::NotAuthorized {
                action: OwnerAction::Reset,
            });
        }
        room.reset();
        let update = room.votes_update();
        log::info!("Votes reset in room {room_id}");

        self.emit_room(room_id, ServerEvent::Votes(update)).await;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_next_create(&self) {
        self.fault_next
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    // ── Queries ─────────────────────────────────────────────────

    pub async fn rooms(&self) -> Vec<RoomSnapshot> {
        self.state.lock().await.store.snapshots()
    }

    pub async fn room(&self, room_id: &str) -> Option<RoomSnapshot> {
        self.state.lock().await.store.get(room_id).map(Room::snapshot)
    }

    pub async fn room_count(&self) -> usize {
        self.state.lock().await.store.len()
    }

    /// Present identities, including those inside their grace window.
    pub async fn presence(&self) -> Vec<String> {
        self.state.lock().await.presence.snapshot()
    }

    pub async fn is_connected(&self, identity: &str) -> bool {
        self.state.lock().await.presence.is_connected(identity)
    }

    pub async fn is_removal_pending(&self, identity: &str) -> bool {
        self.state.lock().await.grace.is_armed(identity)
    }

    pub fn gateway(&self) -> &Arc<BroadcastGateway> {
        &self.gateway
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ── Broadcast helpers ───────────────────────────────────────

    async fn emit_all(&self, event: ServerEvent) {
        if let Err(e) = self.gateway.to_all(&event).await {
            log::error!("Failed to broadcast {}: {e}", event.name());
        }
    }

    async fn emit_room(&self, room_id: &str, event: ServerEvent) {
        if let Err(e) = self.gateway.to_room(room_id, &event).await {
            log::error!("Failed to broadcast {} to room {room_id}: {e}", event.name());
        }
    }
}
