//! In-memory room store.
//!
//! Pure data holder: no authorization or protocol validation happens here.
//! Rooms are kept in creation order so room lists render stably.

use std::collections::HashMap;

use crate::room::{generate_room_id, Room, RoomId, RoomSnapshot};

/// Maps room ids to rooms. Exclusively owns every [`Room`].
#[derive(Debug, Default)]
pub struct RoomStore {
    rooms: HashMap<RoomId, Room>,
    order: Vec<RoomId>,
}

impl RoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw room tokens until one is not in use.
    pub fn allocate_id(&self) -> RoomId {
        loop {
            let id = generate_room_id();
            if !self.rooms.contains_key(&id) {
                return id;
            }
            log::debug!("Room id {id} collided, regenerating");
        }
    }

    /// Insert a room, replacing any room with the same id.
    pub fn create(&mut self, room: Room) {
        let id = room.id().to_string();
        if self.rooms.insert(id.clone(), room).is_none() {
            self.order.push(id);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Room> {
        self.rooms.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(id)
    }

    pub fn delete(&mut self, id: &str) -> Option<Room> {
        let room = self.rooms.remove(id)?;
        self.order.retain(|r| r != id);
        Some(room)
    }

    /// All rooms in creation order.
    pub fn all(&self) -> impl Iterator<Item = &Room> {
        self.order.iter().filter_map(|id| self.rooms.get(id))
    }

    /// Ids of rooms the identity participates in.
    pub fn rooms_of(&self, identity: &str) -> Vec<RoomId> {
        self.all()
            .filter(|room| room.is_participant(identity))
            .map(|room| room.id().to_string())
            .collect()
    }

    /// Masked snapshots of every room, for `rooms:update`.
    pub fn snapshots(&self) -> Vec<RoomSnapshot> {
        self.all().map(Room::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
