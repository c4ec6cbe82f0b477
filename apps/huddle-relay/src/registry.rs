use std::sync::Mutex;

use dashmap::DashMap;
use tokio::sync::mpsc;

use huddle_proto::{ParticipantInfo, ServerMessage};

/// Outbound handle for one connected client. The writer task on the other
/// end drains this into the websocket.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// One live member of a room: wire-visible identity plus the connection
/// handle used to reach it.
#[derive(Clone, Debug)]
pub struct Participant {
    pub info: ParticipantInfo,
    pub sender: MessageSender,
}

/// Result of a join: the members that were already present (join order,
/// joiner excluded) and whether the joiner is actually new to the room.
/// A retried join reports `newly_joined = false` so the router can skip
/// the duplicate broadcast.
#[derive(Debug)]
pub struct JoinOutcome {
    pub roster: Vec<Participant>,
    pub newly_joined: bool,
}

/// Result of removing a connection from its room.
pub struct Departure {
    pub room_id: String,
    pub participant: Participant,
    pub remaining: Vec<Participant>,
    pub room_now_empty: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("connection is already in room {current}")]
    AlreadyJoined { current: String },
}

/// Room membership state. Rooms are created lazily on first join and
/// deleted the moment they empty; nothing survives a relay restart.
///
/// The member list of each room sits behind its own mutex, so mutations
/// to one room are strictly ordered while unrelated rooms proceed in
/// parallel. The maps themselves never leak out of this type.
#[derive(Default)]
pub struct RoomRegistry {
    /// room id -> members in join order
    rooms: DashMap<String, Mutex<Vec<Participant>>>,
    /// connection id -> room id
    membership: DashMap<String, String>,
}

impl RoomRegistry {
    /// Register `participant` in `room_id`, creating the room if needed.
    ///
    /// Idempotent per connection id: a retried join returns the current
    /// roster without duplicating the entry. Joining a second room while
    /// still a member of another is rejected.
    pub fn create_or_join(
        &self,
        room_id: &str,
        participant: Participant,
    ) -> Result<JoinOutcome, JoinError> {
        let connection_id = participant.info.connection_id.clone();

        if let Some(current) = self.membership.get(&connection_id) {
            if current.value() != room_id {
                return Err(JoinError::AlreadyJoined {
                    current: current.value().clone(),
                });
            }
        }

        let room = self.rooms.entry(room_id.to_string()).or_default();
        let mut members = room.lock().unwrap();
        let newly_joined = !members
            .iter()
            .any(|m| m.info.connection_id == connection_id);
        let roster = members
            .iter()
            .filter(|m| m.info.connection_id != connection_id)
            .cloned()
            .collect();
        if newly_joined {
            members.push(participant);
        }
        drop(members);
        drop(room);

        self.membership
            .insert(connection_id, room_id.to_string());
        Ok(JoinOutcome {
            roster,
            newly_joined,
        })
    }

    /// Remove a connection from whatever room it is in. Returns `None` if
    /// the connection was not a member anywhere. Deletes the room when the
    /// last member leaves.
    pub fn remove(&self, connection_id: &str) -> Option<Departure> {
        let (_, room_id) = self.membership.remove(connection_id)?;

        let mut departed = None;
        let mut remaining = Vec::new();
        let mut room_now_empty = false;
        if let Some(room) = self.rooms.get(&room_id) {
            let mut members = room.lock().unwrap();
            if let Some(pos) = members
                .iter()
                .position(|m| m.info.connection_id == connection_id)
            {
                departed = Some(members.remove(pos));
            }
            remaining = members.clone();
            room_now_empty = members.is_empty();
        }

        if room_now_empty {
            // Re-check under the shard lock: a join may have raced in
            // between dropping the member-list guard and this call.
            self.rooms
                .remove_if(&room_id, |_, members| members.lock().unwrap().is_empty());
        }

        Some(Departure {
            room_id,
            participant: departed?,
            remaining,
            room_now_empty,
        })
    }

    /// Resolve a connection id inside a specific room.
    pub fn lookup(&self, room_id: &str, connection_id: &str) -> Option<Participant> {
        let room = self.rooms.get(room_id)?;
        let members = room.lock().unwrap();
        members
            .iter()
            .find(|m| m.info.connection_id == connection_id)
            .cloned()
    }

    /// Which room a connection currently belongs to, if any.
    pub fn room_of(&self, connection_id: &str) -> Option<String> {
        self.membership
            .get(connection_id)
            .map(|room| room.value().clone())
    }

    /// A connection's own membership record: its room and participant entry.
    pub fn member(&self, connection_id: &str) -> Option<(String, Participant)> {
        let room_id = self.room_of(connection_id)?;
        let participant = self.lookup(&room_id, connection_id)?;
        Some((room_id, participant))
    }

    /// Point-in-time copy of a room's member list, join order preserved.
    pub fn snapshot(&self, room_id: &str) -> Vec<Participant> {
        self.rooms
            .get(room_id)
            .map(|room| room.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// Wire-visible view of a room, or `None` if the room does not exist.
    pub fn participants(&self, room_id: &str) -> Option<Vec<ParticipantInfo>> {
        self.rooms.get(room_id).map(|room| {
            room.lock()
                .unwrap()
                .iter()
                .map(|m| m.info.clone())
                .collect()
        })
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(user_id: &str, connection_id: &str) -> Participant {
        let (sender, _rx) = mpsc::unbounded_channel();
        Participant {
            info: ParticipantInfo {
                user_id: user_id.to_string(),
                username: user_id.to_uppercase(),
                connection_id: connection_id.to_string(),
            },
            sender,
        }
    }

    #[test]
    fn roster_reflects_join_order_excluding_joiner() {
        let registry = RoomRegistry::default();
        let a = registry
            .create_or_join("r1", participant("a", "c-a"))
            .unwrap();
        assert!(a.roster.is_empty());
        assert!(a.newly_joined);

        let b = registry
            .create_or_join("r1", participant("b", "c-b"))
            .unwrap();
        assert_eq!(b.roster.len(), 1);
        assert_eq!(b.roster[0].info.user_id, "a");

        let c = registry
            .create_or_join("r1", participant("c", "c-c"))
            .unwrap();
        let ids: Vec<_> = c.roster.iter().map(|m| m.info.user_id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn rejoin_is_idempotent() {
        let registry = RoomRegistry::default();
        registry
            .create_or_join("r1", participant("a", "c-a"))
            .unwrap();
        registry
            .create_or_join("r1", participant("b", "c-b"))
            .unwrap();

        let again = registry
            .create_or_join("r1", participant("a", "c-a"))
            .unwrap();
        assert!(!again.newly_joined);
        assert_eq!(again.roster.len(), 1);
        assert_eq!(registry.participants("r1").unwrap().len(), 2);
    }

    #[test]
    fn second_room_rejected_while_joined() {
        let registry = RoomRegistry::default();
        registry
            .create_or_join("r1", participant("a", "c-a"))
            .unwrap();

        let err = registry
            .create_or_join("r2", participant("a", "c-a"))
            .unwrap_err();
        assert_eq!(
            err,
            JoinError::AlreadyJoined {
                current: "r1".to_string()
            }
        );
        // First membership intact, second room never materialized.
        assert_eq!(registry.room_of("c-a").as_deref(), Some("r1"));
        assert!(registry.participants("r2").is_none());
    }

    #[test]
    fn emptied_room_is_deleted() {
        let registry = RoomRegistry::default();
        assert_eq!(registry.room_count(), 0);

        registry
            .create_or_join("r1", participant("a", "c-a"))
            .unwrap();
        assert_eq!(registry.room_count(), 1);

        let departure = registry.remove("c-a").unwrap();
        assert!(departure.room_now_empty);
        assert!(departure.remaining.is_empty());
        assert_eq!(registry.room_count(), 0);

        // A later join to the same id starts from scratch.
        let fresh = registry
            .create_or_join("r1", participant("b", "c-b"))
            .unwrap();
        assert!(fresh.roster.is_empty());
    }

    #[test]
    fn remove_reports_remaining_members() {
        let registry = RoomRegistry::default();
        registry
            .create_or_join("r1", participant("a", "c-a"))
            .unwrap();
        registry
            .create_or_join("r1", participant("b", "c-b"))
            .unwrap();

        let departure = registry.remove("c-a").unwrap();
        assert_eq!(departure.room_id, "r1");
        assert_eq!(departure.participant.info.user_id, "a");
        assert!(!departure.room_now_empty);
        assert_eq!(departure.remaining.len(), 1);
        assert_eq!(departure.remaining[0].info.user_id, "b");

        assert!(registry.remove("c-a").is_none());
    }

    #[test]
    fn lookup_misses_are_none() {
        let registry = RoomRegistry::default();
        registry
            .create_or_join("r1", participant("a", "c-a"))
            .unwrap();

        assert!(registry.lookup("r1", "c-ghost").is_none());
        assert!(registry.lookup("r-ghost", "c-a").is_none());
        assert!(registry.room_of("c-ghost").is_none());
    }

    #[test]
    fn concurrent_joins_to_one_room_stay_consistent() {
        use std::sync::Arc;

        let registry = Arc::new(RoomRegistry::default());
        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                let user = format!("u{i}");
                let conn = format!("c{i}");
                registry
                    .create_or_join("busy", participant(&user, &conn))
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let members = registry.participants("busy").unwrap();
        assert_eq!(members.len(), 16);
        let mut ids: Vec<_> = members.iter().map(|m| m.user_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 16);
    }
}
