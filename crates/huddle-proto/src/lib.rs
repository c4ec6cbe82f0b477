//! Shared wire protocol between the huddle relay and its clients.
//! Keeping this in a dedicated crate lets the server and the mesh client
//! agree on envelope shapes without either pulling in the other's runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One visible participant of a room, as reported over the wire.
///
/// `connection_id` is the relay-assigned handle for the underlying
/// transport connection; a user with two live connections shows up twice
/// with distinct handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: String,
    pub username: String,
    pub connection_id: String,
}

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Enter a room, creating it if this is the first join.
    JoinRoom {
        room_id: String,
        user_id: String,
        username: String,
    },
    /// Leave the current room. Carries no payload; the relay already knows
    /// which room this connection is in.
    LeaveRoom,
    /// Session-description offer for one remote participant.
    Offer { target: String, sdp: String },
    /// Session-description answer for one remote participant.
    Answer { target: String, sdp: String },
    /// Connectivity candidate for one remote participant.
    IceCandidate { target: String, candidate: String },
    /// Announce the local microphone state to the room.
    ToggleAudio { enabled: bool },
    /// Announce the local camera state to the room.
    ToggleVideo { enabled: bool },
    StartSharing,
    StopSharing,
    /// Chat message for the whole room. The body is opaque to the relay;
    /// sender identity and timestamp are attached server-side.
    SendMessage { body: Value },
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to a successful join: the members already present, excluding
    /// the joiner itself, in join order.
    RoomJoined {
        room_id: String,
        participants: Vec<ParticipantInfo>,
    },
    /// A new participant entered the room.
    UserJoined { participant: ParticipantInfo },
    /// A participant left or its connection dropped; the two are not
    /// distinguishable downstream.
    UserLeft {
        user_id: String,
        connection_id: String,
    },
    /// Relayed session-description offer. `from` is the sender's
    /// connection handle.
    Offer { from: String, sdp: String },
    /// Relayed session-description answer.
    Answer { from: String, sdp: String },
    /// Relayed connectivity candidate.
    IceCandidate { from: String, candidate: String },
    AudioToggled {
        user_id: String,
        connection_id: String,
        enabled: bool,
    },
    VideoToggled {
        user_id: String,
        connection_id: String,
        enabled: bool,
    },
    SharingStarted {
        user_id: String,
        connection_id: String,
    },
    SharingStopped {
        user_id: String,
        connection_id: String,
    },
    /// Chat message echoed to every member of the room, sender included.
    /// The timestamp is assigned by the relay at relay time.
    NewMessage {
        sender_id: String,
        sender_name: String,
        timestamp: DateTime<Utc>,
        body: Value,
    },
    Error { message: String },
}

/// Generate a connection handle for a freshly accepted transport connection.
pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}
