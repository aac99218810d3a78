//! Room state: membership, the hidden ballot, and the reveal flag.
//!
//! ```text
//!            create                 reveal
//!   ───────────────► Active ───────────────► VotesRevealed
//!                      ▲  │                      │
//!                      │  │ last participant     │ reset
//!                      │  ▼ leaves               │
//!                    Destroyed ◄─────────────────┘ (last participant leaves)
//! ```
//!
//! A [`Room`] never serializes itself directly. Everything that leaves the
//! process goes through [`RoomSnapshot`], which masks vote values until the
//! owner reveals them.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Short collision-resistant room token.
pub type RoomId = String;

const ROOM_ID_LEN: usize = 9;
const ROOM_ID_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a 9-character base-36 room token from v4 UUID entropy.
///
/// Uniqueness against live rooms is the store's concern, see
/// [`RoomStore::allocate_id`](crate::store::RoomStore::allocate_id).
pub fn generate_room_id() -> RoomId {
    let mut bits = Uuid::new_v4().as_u128();
    (0..ROOM_ID_LEN)
        .map(|_| {
            let c = ROOM_ID_ALPHABET[(bits % 36) as usize] as char;
            bits /= 36;
            c
        })
        .collect()
}

/// A single vote or voting-scale entry. Carried opaquely as a JSON string or number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VoteValue {
    Number(serde_json::Number),
    Text(String),
}

impl VoteValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Scale membership compares the rendered form, so `3` and `"3"` match.
    pub fn same_as(&self, other: &VoteValue) -> bool {
        self.to_string() == other.to_string()
    }
}

impl fmt::Display for VoteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for VoteValue {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

impl From<&str> for VoteValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Identity → vote, in first-vote order. Re-voting overwrites in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ballot {
    entries: Vec<(String, VoteValue)>,
}

impl Ballot {
    /// Record or overwrite a vote. Returns `true` for a first vote.
    pub fn cast(&mut self, identity: &str, value: VoteValue) -> bool {
        match self.entries.iter_mut().find(|(who, _)| who == identity) {
            Some((_, existing)) => {
                *existing = value;
                false
            }
            None => {
                self.entries.push((identity.to_string(), value));
                true
            }
        }
    }

    pub fn withdraw(&mut self, identity: &str) -> Option<VoteValue> {
        let idx = self.entries.iter().position(|(who, _)| who == identity)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn get(&self, identity: &str) -> Option<&VoteValue> {
        self.entries
            .iter()
            .find(|(who, _)| who == identity)
            .map(|(_, value)| value)
    }

    pub fn has_voted(&self, identity: &str) -> bool {
        self.get(identity).is_some()
    }

    pub fn entries(&self) -> &[(String, VoteValue)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Authoritative in-memory room.
#[derive(Debug, Clone)]
pub struct Room {
    id: RoomId,
    name: String,
    owner: String,
    participants: Vec<String>,
    voting_scale: Vec<VoteValue>,
    ballot: Ballot,
    revealed: bool,
}

impl Room {
    /// New room with `owner` as its sole participant.
    pub fn new(id: RoomId, name: String, owner: &str, voting_scale: Vec<VoteValue>) -> Self {
        Self {
            id,
            name,
            owner: owner.to_string(),
            participants: vec![owner.to_string()],
            voting_scale,
            ballot: Ballot::default(),
            revealed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn participants(&self) -> &[String] {
        &self.participants
    }

    pub fn voting_scale(&self) -> &[VoteValue] {
        &self.voting_scale
    }

    pub fn ballot(&self) -> &Ballot {
        &self.ballot
    }

    pub fn is_revealed(&self) -> bool {
        self.revealed
    }

    pub fn is_owner(&self, identity: &str) -> bool {
        self.owner == identity
    }

    pub fn is_participant(&self, identity: &str) -> bool {
        self.participants.iter().any(|p| p == identity)
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Append a participant. Re-joining is a no-op and returns `false`.
    pub fn add_participant(&mut self, identity: &str) -> bool {
        if self.is_participant(identity) {
            return false;
        }
        self.participants.push(identity.to_string());
        true
    }

    /// Drop a participant together with their ballot entry.
    ///
    /// Returns `false` if the identity was not a participant.
    pub fn remove_participant(&mut self, identity: &str) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p != identity);
        self.ballot.withdraw(identity);
        if self.ballot.is_empty() {
            self.revealed = false;
        }
        self.participants.len() != before
    }

    pub fn accepts_vote(&self, value: &VoteValue) -> bool {
        self.voting_scale.iter().any(|v| v.same_as(value))
    }

    pub fn cast_vote(&mut self, identity: &str, value: VoteValue) -> bool {
        self.ballot.cast(identity, value)
    }

    /// Expose all ballot values. An empty ballot stays hidden.
    pub fn reveal(&mut self) {
        self.revealed = !self.ballot.is_empty();
    }

    /// Clear the ballot and hide values again.
    pub fn reset(&mut self) {
        self.ballot.clear();
        self.revealed = false;
    }

    /// Wire view of this room with hidden values masked.
    pub fn snapshot(&self) -> RoomSnapshot {
        let votes = self
            .ballot
            .entries()
            .iter()
            .map(|(who, value)| (who.clone(), self.revealed.then(|| value.clone())))
            .collect();
        RoomSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            owner: self.owner.clone(),
            participants: self.participants.clone(),
            voting_scale: self.voting_scale.clone(),
            votes,
            revealed: self.revealed,
        }
    }

    /// Full ballot as broadcast on reveal/reset.
    pub fn votes_update(&self) -> VotesUpdate {
        let votes = if self.revealed {
            self.ballot.entries().to_vec()
        } else {
            Vec::new()
        };
        VotesUpdate {
            votes,
            revealed: self.revealed,
        }
    }
}

/// Serialized room. Vote values are `null` until revealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub id: RoomId,
    pub name: String,
    pub owner: String,
    pub participants: Vec<String>,
    pub voting_scale: Vec<VoteValue>,
    pub votes: Vec<(String, Option<VoteValue>)>,
    pub revealed: bool,
}

impl RoomSnapshot {
    pub fn has_voted(&self, identity: &str) -> bool {
        self.votes.iter().any(|(who, _)| who == identity)
    }
}

/// `room:votes` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotesUpdate {
    pub votes: Vec<(String, VoteValue)>,
    pub revealed: bool,
}

/// `room:vote` payload. Never carries the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteCast {
    pub username: String,
    pub has_voted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn fibonacci() -> Vec<VoteValue> {
        [1u64, 2, 3, 5, 8].into_iter().map(VoteValue::from).collect()
    }

    fn sprint(owner: &str) -> Room {
        Room::new("abc123xyz".into(), "Sprint1".into(), owner, fibonacci())
    }

    #[test]
    fn test_room_id_shape() {
        let id = generate_room_id();
        assert_eq!(id.len(), 9);
        assert!(id.bytes().all(|b| ROOM_ID_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_room_ids_distinct() {
        let ids: HashSet<_> = (0..1000).map(|_| generate_room_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_new_room_owner_is_sole_participant() {
        let room = sprint("A");
        assert_eq!(room.owner(), "A");
        assert_eq!(room.participants(), ["A".to_string()]);
        assert!(!room.is_revealed());
        assert!(room.ballot().is_empty());
    }

    #[test]
    fn test_rejoin_is_noop() {
        let mut room = sprint("A");
        assert!(room.add_participant("B"));
        assert!(!room.add_participant("B"));
        assert_eq!(room.participants(), ["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_remove_participant_withdraws_vote() {
        let mut room = sprint("A");
        room.add_participant("B");
        room.cast_vote("B", 5u64.into());
        assert!(room.remove_participant("B"));
        assert!(!room.ballot().has_voted("B"));
        assert!(!room.remove_participant("B"));
    }

    #[test]
    fn test_ballot_overwrite_keeps_order() {
        let mut ballot = Ballot::default();
        assert!(ballot.cast("A", 3u64.into()));
        assert!(ballot.cast("B", 5u64.into()));
        assert!(!ballot.cast("A", 8u64.into()));
        let voters: Vec<_> = ballot.entries().iter().map(|(w, _)| w.as_str()).collect();
        assert_eq!(voters, ["A", "B"]);
        assert_eq!(ballot.get("A"), Some(&VoteValue::from(8u64)));
    }

    #[test]
    fn test_snapshot_masks_hidden_votes() {
        let mut room = sprint("A");
        room.cast_vote("A", 3u64.into());
        let snapshot = room.snapshot();
        assert_eq!(snapshot.votes, vec![("A".to_string(), None::<VoteValue>)]);
        assert!(snapshot.has_voted("A"));

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains(r#""votes":[["A",null]]"#), "{json}");
        assert!(json.contains(r#""votingScale":[1,2,3,5,8]"#), "{json}");
    }

    #[test]
    fn test_reveal_exposes_values() {
        let mut room = sprint("A");
        room.add_participant("B");
        room.cast_vote("A", "3".into());
        room.cast_vote("B", "5".into());
        room.reveal();

        let update = room.votes_update();
        assert!(update.revealed);
        let expected: Vec<(String, VoteValue)> =
            vec![("A".into(), "3".into()), ("B".into(), "5".into())];
        assert_eq!(update.votes, expected);
        let masked: (String, Option<VoteValue>) = ("B".into(), Some("5".into()));
        assert_eq!(room.snapshot().votes[1], masked);
    }

    #[test]
    fn test_reveal_empty_ballot_stays_hidden() {
        let mut room = sprint("A");
        room.reveal();
        assert!(!room.is_revealed());
    }

    #[test]
    fn test_reset_clears_ballot_and_flag() {
        let mut room = sprint("A");
        room.cast_vote("A", 3u64.into());
        room.reveal();
        room.reset();
        assert!(room.ballot().is_empty());
        assert!(!room.is_revealed());
        assert_eq!(room.votes_update(), VotesUpdate { votes: vec![], revealed: false });
    }

    #[test]
    fn test_last_vote_withdrawn_hides_again() {
        let mut room = sprint("A");
        room.add_participant("B");
        room.cast_vote("B", 2u64.into());
        room.reveal();
        room.remove_participant("B");
        assert!(!room.is_revealed());
    }

    #[test]
    fn test_scale_membership_by_rendered_value() {
        let room = sprint("A");
        assert!(room.accepts_vote(&"3".into()));
        assert!(room.accepts_vote(&3u64.into()));
        assert!(!room.accepts_vote(&"13".into()));
    }

    #[test]
    fn test_vote_value_json_shapes() {
        let values: Vec<VoteValue> = serde_json::from_str(r#"[1, "?", 0.5]"#).unwrap();
        assert_eq!(values[0], VoteValue::from(1u64));
        assert_eq!(values[1], VoteValue::text("?"));
        assert_eq!(values[2].to_string(), "0.5");
        assert!(serde_json::from_str::<VoteValue>("true").is_err());
    }

    #[test]
    fn test_vote_cast_payload() {
        let cast = VoteCast { username: "A".into(), has_voted: true };
        assert_eq!(
            serde_json::to_string(&cast).unwrap(),
            r#"{"username":"A","hasVoted":true}"#
        );
    }
}
