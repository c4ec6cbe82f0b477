use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex as AsyncMutex, RwLock, broadcast, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use huddle_proto::{ClientMessage, ParticipantInfo, ServerMessage};

use crate::MeshError;

/// Who the local client is, as presented to the room.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub user_id: String,
    pub username: String,
}

/// Reply to a successful join.
#[derive(Debug, Clone)]
pub struct RoomJoinedInfo {
    pub room_id: String,
    pub participants: Vec<ParticipantInfo>,
}

/// Typed inbound events, fanned out to every subscriber in the order the
/// relay delivered them. No reordering, no deduplication.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Inbound(ServerMessage),
    /// The websocket to the relay ended; no further events will arrive
    /// until a new channel is connected.
    Disconnected,
}

type PendingJoin = oneshot::Sender<Result<RoomJoinedInfo, String>>;

const EVENT_BUFFER: usize = 1024;

/// One logical connection to the relay. A writer task drains outbound
/// envelopes into the socket; a reader task parses inbound frames and
/// publishes them on a broadcast channel so the mesh coordinator, UI and
/// tests can all observe the same stream independently.
pub struct SignalingChannel {
    identity: LocalIdentity,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    events_tx: broadcast::Sender<SignalingEvent>,
    pending_join: Arc<AsyncMutex<Option<PendingJoin>>>,
    room: RwLock<Option<String>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Connect to the relay's websocket endpoint. Accepts `ws`/`wss` URLs
    /// directly and maps `http`/`https` to their websocket schemes.
    pub async fn connect(relay_url: &str, identity: LocalIdentity) -> Result<Arc<Self>, MeshError> {
        let url = websocket_url(relay_url)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| MeshError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target: "signaling", url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let pending_join: Arc<AsyncMutex<Option<PendingJoin>>> = Arc::new(AsyncMutex::new(None));

        let channel = Arc::new(SignalingChannel {
            identity,
            send_tx,
            events_tx: events_tx.clone(),
            pending_join: Arc::clone(&pending_join),
            room: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                if let Ok(text) = serde_json::to_string(&message) {
                    if ws_write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        });

        let reader_events = events_tx.clone();
        let reader_pending = Arc::clone(&pending_join);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(message) => {
                                route_inbound(message, &reader_events, &reader_pending).await;
                            }
                            Err(err) => {
                                tracing::warn!(target: "signaling", "unparseable server message: {err}");
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(target: "signaling", "relay websocket error: {err}");
                        break;
                    }
                }
            }
            // A join still waiting at teardown fails rather than hangs.
            if let Some(pending) = reader_pending.lock().await.take() {
                let _ = pending.send(Err("signaling channel closed".to_string()));
            }
            let _ = reader_events.send(SignalingEvent::Disconnected);
        });

        {
            let mut tasks = channel.tasks.lock().unwrap();
            tasks.push(writer);
            tasks.push(reader);
        }

        Ok(channel)
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Subscribe to the inbound event stream. Every subscriber sees the
    /// same events in the same order; a subscriber that falls too far
    /// behind observes a lag gap rather than blocking the rest.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events_tx.subscribe()
    }

    /// Join a room and wait for the relay's roster reply. An `error`
    /// envelope received while the join is pending rejects it.
    pub async fn join(&self, room_id: &str) -> Result<RoomJoinedInfo, MeshError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_join.lock().await;
            *pending = Some(tx);
        }
        self.send(ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
            user_id: self.identity.user_id.clone(),
            username: self.identity.username.clone(),
        })?;

        match rx.await {
            Ok(Ok(info)) => {
                *self.room.write().await = Some(info.room_id.clone());
                Ok(info)
            }
            Ok(Err(reason)) => Err(MeshError::JoinRejected(reason)),
            Err(_) => Err(MeshError::ChannelClosed),
        }
    }

    /// Leave the current room. The relay infers which room from the
    /// connection, so this carries no payload.
    pub async fn leave(&self) -> Result<(), MeshError> {
        self.send(ClientMessage::LeaveRoom)?;
        *self.room.write().await = None;
        Ok(())
    }

    pub async fn current_room(&self) -> Option<String> {
        self.room.read().await.clone()
    }

    /// Queue an envelope for the relay. Fire-and-forget: delivery is
    /// at-most-once end to end.
    pub fn send(&self, message: ClientMessage) -> Result<(), MeshError> {
        self.send_tx
            .send(message)
            .map_err(|_| MeshError::ChannelClosed)
    }

    pub(crate) fn outbound(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.send_tx.clone()
    }

    /// Tear the connection down. Subscribers observe `Disconnected` once
    /// the reader notices the socket closing.
    pub fn close(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for handle in tasks.drain(..) {
            handle.abort();
        }
        let _ = self.events_tx.send(SignalingEvent::Disconnected);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

fn websocket_url(relay_url: &str) -> Result<Url, MeshError> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| MeshError::Setup(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(MeshError::Setup(format!(
                "unsupported relay url scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| MeshError::Setup("invalid websocket scheme".into()))?;
    Ok(url)
}

async fn route_inbound(
    message: ServerMessage,
    events: &broadcast::Sender<SignalingEvent>,
    pending_join: &AsyncMutex<Option<PendingJoin>>,
) {
    match &message {
        ServerMessage::RoomJoined {
            room_id,
            participants,
        } => {
            if let Some(pending) = pending_join.lock().await.take() {
                let _ = pending.send(Ok(RoomJoinedInfo {
                    room_id: room_id.clone(),
                    participants: participants.clone(),
                }));
            }
        }
        ServerMessage::Error { message: reason } => {
            if let Some(pending) = pending_join.lock().await.take() {
                let _ = pending.send(Err(reason.clone()));
            }
        }
        _ => {}
    }
    let _ = events.send(SignalingEvent::Inbound(message));
}
