//! Rooms and connection identifiers; relay-side membership directory.

use std::collections::{HashMap, HashSet};
use std::fmt;

use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Length of generated room tokens.
pub const ROOM_ID_LEN: usize = 10;

/// Longest room id accepted on join.
pub const MAX_ROOM_ID_LEN: usize = 128;

const ROOM_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Opaque rendezvous token. Whoever knows it can join.
///
/// Deserializing goes through [`RoomId::parse`], so an empty or oversized id never
/// reaches the relay or the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("room id must be 1 to 128 bytes")]
pub struct InvalidRoomId;

impl RoomId {
    /// Fresh URL-safe token; unique with overwhelming probability, never checked server-side.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let token = (0..ROOM_ID_LEN)
            .map(|_| ROOM_ALPHABET[rng.gen_range(0..ROOM_ALPHABET.len())] as char)
            .collect();
        RoomId(token)
    }

    /// Accept any non-empty id up to `MAX_ROOM_ID_LEN` bytes.
    pub fn parse(s: &str) -> Option<Self> {
        if Self::is_valid(s) {
            Some(RoomId(s.to_owned()))
        } else {
            None
        }
    }

    pub fn is_valid(s: &str) -> bool {
        !s.is_empty() && s.len() <= MAX_ROOM_ID_LEN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomId {
    type Error = InvalidRoomId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if Self::is_valid(&s) {
            Ok(RoomId(s))
        } else {
            Err(InvalidRoomId)
        }
    }
}

impl From<RoomId> for String {
    fn from(room: RoomId) -> String {
        room.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relay-assigned address of one live relay connection. No identity across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        ConnectionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Room id -> members, plus the reverse index for disconnect pruning.
/// Rooms exist only while they have members.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<RoomId>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `room`. Returns the other members at the time of joining.
    /// Re-joining is a no-op at the set level but still reports the others.
    pub fn join(&mut self, room: &RoomId, conn: &ConnectionId) -> Vec<ConnectionId> {
        let members = self.rooms.entry(room.clone()).or_default();
        let mut others: Vec<ConnectionId> =
            members.iter().filter(|m| *m != conn).cloned().collect();
        others.sort();
        members.insert(conn.clone());
        self.memberships
            .entry(conn.clone())
            .or_default()
            .insert(room.clone());
        others
    }

    /// Remove `conn` from every room; rooms left empty are dropped.
    /// Returns the rooms it was in.
    pub fn leave_all(&mut self, conn: &ConnectionId) -> Vec<RoomId> {
        let Some(rooms) = self.memberships.remove(conn) else {
            return vec![];
        };
        let mut left: Vec<RoomId> = rooms.into_iter().collect();
        left.sort();
        for room in &left {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(conn);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        left
    }

    pub fn members(&self, room: &RoomId) -> Vec<ConnectionId> {
        let mut out: Vec<ConnectionId> = self
            .rooms
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn contains_room(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(s: &str) -> RoomId {
        RoomId::parse(s).unwrap()
    }

    #[test]
    fn generated_ids_use_url_safe_alphabet() {
        let id = RoomId::generate();
        assert_eq!(id.as_str().len(), ROOM_ID_LEN);
        assert!(id
            .as_str()
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-'));
        assert_ne!(RoomId::generate(), RoomId::generate());
    }

    #[test]
    fn parse_rejects_empty_and_oversized() {
        assert!(RoomId::parse("").is_none());
        assert!(RoomId::parse(&"x".repeat(MAX_ROOM_ID_LEN + 1)).is_none());
        assert!(RoomId::parse("abc123").is_some());
    }

    #[test]
    fn deserializing_validates_like_parse() {
        let ok: RoomId = serde_json::from_str("\"abc123\"").unwrap();
        assert_eq!(ok, room("abc123"));
        assert!(serde_json::from_str::<RoomId>("\"\"").is_err());
        let long = format!("\"{}\"", "x".repeat(MAX_ROOM_ID_LEN + 1));
        assert!(serde_json::from_str::<RoomId>(&long).is_err());
        assert_eq!(serde_json::to_string(&ok).unwrap(), "\"abc123\"");
    }

    #[test]
    fn join_reports_existing_members_only() {
        let mut dir = RoomDirectory::new();
        let a = ConnectionId::new("a");
        let b = ConnectionId::new("b");
        assert!(dir.join(&room("abc123"), &a).is_empty());
        assert_eq!(dir.join(&room("abc123"), &b), vec![a.clone()]);
        assert_eq!(dir.members(&room("abc123")), vec![a, b]);
    }

    #[test]
    fn rejoin_is_idempotent() {
        let mut dir = RoomDirectory::new();
        let a = ConnectionId::new("a");
        dir.join(&room("r"), &a);
        dir.join(&room("r"), &a);
        assert_eq!(dir.members(&room("r")).len(), 1);
    }

    #[test]
    fn leave_prunes_empty_rooms() {
        let mut dir = RoomDirectory::new();
        let a = ConnectionId::new("a");
        let b = ConnectionId::new("b");
        dir.join(&room("r1"), &a);
        dir.join(&room("r2"), &a);
        dir.join(&room("r2"), &b);
        assert_eq!(dir.leave_all(&a), vec![room("r1"), room("r2")]);
        assert!(!dir.contains_room(&room("r1")));
        assert_eq!(dir.members(&room("r2")), vec![b]);
        assert_eq!(dir.room_count(), 1);
    }

    #[test]
    fn leave_unknown_connection_is_noop() {
        let mut dir = RoomDirectory::new();
        assert!(dir.leave_all(&ConnectionId::new("ghost")).is_empty());
    }
}
