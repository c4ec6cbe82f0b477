use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use huddle_proto::{generate_connection_id, ClientMessage, ParticipantInfo, ServerMessage};

use crate::registry::{JoinError, MessageSender, Participant, RoomRegistry};

/// Shared state handed to every websocket connection.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<RoomRegistry>,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RoomRegistry::default()),
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one client connection: a writer task drains the outbound channel
/// into the socket while this task dispatches inbound envelopes. The
/// outbound sender doubles as the connection handle stored in the registry.
async fn handle_socket(socket: WebSocket, state: RelayState) {
    let connection_id = generate_connection_id();
    let (mut sink, mut stream) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let writer_conn = connection_id.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(connection = %writer_conn, "writer task ended");
    });

    debug!(connection = %connection_id, "websocket connected");

    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => {
                warn!(connection = %connection_id, "websocket error: {err}");
                break;
            }
        };

        match msg {
            Message::Text(text) => dispatch_text(&text, &connection_id, &state, &tx),
            Message::Binary(data) => {
                // Some clients frame JSON as binary; accept it for compatibility.
                match String::from_utf8(data) {
                    Ok(text) => dispatch_text(&text, &connection_id, &state, &tx),
                    Err(_) => debug!(connection = %connection_id, "ignoring non-UTF8 binary frame"),
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    // A dropped transport and an explicit leave look identical downstream.
    remove_and_notify(&state, &connection_id);
    debug!(connection = %connection_id, "websocket disconnected");
}

fn dispatch_text(text: &str, connection_id: &str, state: &RelayState, tx: &MessageSender) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => handle_client_message(message, connection_id, state, tx),
        Err(err) => {
            debug!(connection = %connection_id, "failed to parse client message: {err}");
            let _ = tx.send(ServerMessage::Error {
                message: format!("invalid message format: {err}"),
            });
        }
    }
}

fn handle_client_message(
    message: ClientMessage,
    connection_id: &str,
    state: &RelayState,
    tx: &MessageSender,
) {
    match message {
        ClientMessage::JoinRoom {
            room_id,
            user_id,
            username,
        } => {
            let participant = Participant {
                info: ParticipantInfo {
                    user_id,
                    username,
                    connection_id: connection_id.to_string(),
                },
                sender: tx.clone(),
            };
            let info = participant.info.clone();

            match state.registry.create_or_join(&room_id, participant) {
                Ok(outcome) => {
                    let _ = tx.send(ServerMessage::RoomJoined {
                        room_id: room_id.clone(),
                        participants: outcome.roster.iter().map(|m| m.info.clone()).collect(),
                    });
                    if outcome.newly_joined {
                        info!(
                            room = %room_id,
                            user = %info.user_id,
                            connection = %connection_id,
                            "participant joined"
                        );
                        for member in &outcome.roster {
                            let _ = member.sender.send(ServerMessage::UserJoined {
                                participant: info.clone(),
                            });
                        }
                    }
                }
                Err(err @ JoinError::AlreadyJoined { .. }) => {
                    let _ = tx.send(ServerMessage::Error {
                        message: err.to_string(),
                    });
                }
            }
        }

        ClientMessage::LeaveRoom => remove_and_notify(state, connection_id),

        ClientMessage::Offer { target, sdp } => relay_to_target(
            state,
            connection_id,
            &target,
            ServerMessage::Offer {
                from: connection_id.to_string(),
                sdp,
            },
        ),

        ClientMessage::Answer { target, sdp } => relay_to_target(
            state,
            connection_id,
            &target,
            ServerMessage::Answer {
                from: connection_id.to_string(),
                sdp,
            },
        ),

        ClientMessage::IceCandidate { target, candidate } => relay_to_target(
            state,
            connection_id,
            &target,
            ServerMessage::IceCandidate {
                from: connection_id.to_string(),
                candidate,
            },
        ),

        ClientMessage::ToggleAudio { enabled } => {
            broadcast_from(state, connection_id, |me| ServerMessage::AudioToggled {
                user_id: me.user_id.clone(),
                connection_id: me.connection_id.clone(),
                enabled,
            });
        }

        ClientMessage::ToggleVideo { enabled } => {
            broadcast_from(state, connection_id, |me| ServerMessage::VideoToggled {
                user_id: me.user_id.clone(),
                connection_id: me.connection_id.clone(),
                enabled,
            });
        }

        ClientMessage::StartSharing => {
            broadcast_from(state, connection_id, |me| ServerMessage::SharingStarted {
                user_id: me.user_id.clone(),
                connection_id: me.connection_id.clone(),
            });
        }

        ClientMessage::StopSharing => {
            broadcast_from(state, connection_id, |me| ServerMessage::SharingStopped {
                user_id: me.user_id.clone(),
                connection_id: me.connection_id.clone(),
            });
        }

        ClientMessage::SendMessage { body } => {
            let Some((room_id, me)) = state.registry.member(connection_id) else {
                debug!(connection = %connection_id, "chat from connection outside any room; dropping");
                return;
            };
            // The relay, not the sender, stamps the message: one clock
            // decides ordering for the whole room.
            let message = ServerMessage::NewMessage {
                sender_id: me.info.user_id.clone(),
                sender_name: me.info.username.clone(),
                timestamp: chrono::Utc::now(),
                body,
            };
            for member in state.registry.snapshot(&room_id) {
                let _ = member.sender.send(message.clone());
            }
        }
    }
}

/// Remove the connection from its room and tell the remaining members.
/// Shared by the explicit leave and the disconnect path so both are
/// externally indistinguishable.
fn remove_and_notify(state: &RelayState, connection_id: &str) {
    if let Some(departure) = state.registry.remove(connection_id) {
        info!(
            room = %departure.room_id,
            user = %departure.participant.info.user_id,
            connection = %connection_id,
            "participant left"
        );
        for member in &departure.remaining {
            let _ = member.sender.send(ServerMessage::UserLeft {
                user_id: departure.participant.info.user_id.clone(),
                connection_id: connection_id.to_string(),
            });
        }
        if departure.room_now_empty {
            debug!(room = %departure.room_id, "room deleted (empty)");
        }
    }
}

/// Forward an envelope to a single member of the sender's room. An
/// unresolvable target is dropped without telling the sender: the target
/// may simply have disconnected a moment ago.
fn relay_to_target(
    state: &RelayState,
    connection_id: &str,
    target: &str,
    message: ServerMessage,
) {
    let Some(room_id) = state.registry.room_of(connection_id) else {
        debug!(connection = %connection_id, "relay from connection outside any room; dropping");
        return;
    };
    match state.registry.lookup(&room_id, target) {
        Some(peer) => {
            let _ = peer.sender.send(message);
        }
        None => debug!(
            room = %room_id,
            target = %target,
            "relay target not found; dropping"
        ),
    }
}

/// Send a sender-attributed event to every other member of the sender's
/// room. Dropped silently when the sender is not in a room.
fn broadcast_from(
    state: &RelayState,
    connection_id: &str,
    build: impl Fn(&ParticipantInfo) -> ServerMessage,
) {
    let Some((room_id, me)) = state.registry.member(connection_id) else {
        debug!(connection = %connection_id, "broadcast from connection outside any room; dropping");
        return;
    };
    let message = build(&me.info);
    for member in state.registry.snapshot(&room_id) {
        if member.info.connection_id != connection_id {
            let _ = member.sender.send(message.clone());
        }
    }
}
