//! Room-level coordination: one peer link per remote participant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tracing::{debug, warn};

use huddle_proto::{ClientMessage, ParticipantInfo, ServerMessage};

use crate::MeshError;
use crate::channel::{RoomJoinedInfo, SignalingChannel, SignalingEvent};
use crate::engine::{LocalMedia, MediaEngine};
use crate::peer::{LinkCommand, PeerLink};
use crate::policy::{Discovery, negotiation_role};

/// Owns the full set of peer links for one client in one room.
///
/// The coordinator never asks the relay who is present: it learns about
/// membership purely from relayed envelopes, creating a link when a
/// participant is discovered and tearing it down when that participant
/// leaves. Links operate independently; nothing here blocks one link on
/// another.
pub struct MeshCoordinator {
    channel: Arc<SignalingChannel>,
    engine: Arc<dyn MediaEngine>,
    links: AsyncMutex<HashMap<String, Arc<PeerLink>>>,
    /// Shared capture, acquired before the first link and dropped when the
    /// last link goes away.
    local_media: AsyncMutex<Option<Arc<dyn LocalMedia>>>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MeshCoordinator {
    /// Attach a coordinator to a connected channel. Subscribes before
    /// anything else so no membership event can slip past.
    pub fn new(channel: Arc<SignalingChannel>, engine: Arc<dyn MediaEngine>) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            channel,
            engine,
            links: AsyncMutex::new(HashMap::new()),
            local_media: AsyncMutex::new(None),
            driver: Mutex::new(None),
        });
        let events = coordinator.channel.subscribe();
        let driver = tokio::spawn(Self::drive(Arc::clone(&coordinator), events));
        *coordinator.driver.lock().unwrap() = Some(driver);
        coordinator
    }

    pub fn channel(&self) -> &Arc<SignalingChannel> {
        &self.channel
    }

    /// Join a room. Links toward the members already present are created
    /// by the event driver as the roster arrives.
    pub async fn join(&self, room_id: &str) -> Result<RoomJoinedInfo, MeshError> {
        self.channel.join(room_id).await
    }

    /// Leave the room: every link is torn down and every engine resource
    /// released before the leave is sent. No link outlives membership.
    pub async fn leave(&self) -> Result<(), MeshError> {
        self.teardown_links().await;
        self.channel.leave().await
    }

    /// Tear everything down and close the signaling channel.
    pub async fn close(&self) {
        self.teardown_links().await;
        if let Some(driver) = self.driver.lock().unwrap().take() {
            driver.abort();
        }
        self.channel.close();
    }

    pub async fn links(&self) -> Vec<Arc<PeerLink>> {
        self.links.lock().await.values().cloned().collect()
    }

    pub async fn link(&self, connection_id: &str) -> Option<Arc<PeerLink>> {
        self.links.lock().await.get(connection_id).cloned()
    }

    pub async fn link_count(&self) -> usize {
        self.links.lock().await.len()
    }

    /// Toggle the local microphone and tell the room.
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<(), MeshError> {
        if let Some(media) = self.local_media.lock().await.as_ref() {
            media.set_audio_enabled(enabled);
        }
        self.channel.send(ClientMessage::ToggleAudio { enabled })
    }

    /// Toggle the local camera and tell the room.
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), MeshError> {
        if let Some(media) = self.local_media.lock().await.as_ref() {
            media.set_video_enabled(enabled);
        }
        self.channel.send(ClientMessage::ToggleVideo { enabled })
    }

    /// Announce screen sharing and renegotiate the changed track set.
    pub async fn start_sharing(&self) -> Result<(), MeshError> {
        self.channel.send(ClientMessage::StartSharing)?;
        self.renegotiate_links().await;
        Ok(())
    }

    pub async fn stop_sharing(&self) -> Result<(), MeshError> {
        self.channel.send(ClientMessage::StopSharing)?;
        self.renegotiate_links().await;
        Ok(())
    }

    pub fn send_chat(&self, body: Value) -> Result<(), MeshError> {
        self.channel.send(ClientMessage::SendMessage { body })
    }

    async fn drive(self: Arc<Self>, mut events: broadcast::Receiver<SignalingEvent>) {
        loop {
            match events.recv().await {
                Ok(SignalingEvent::Inbound(message)) => self.handle_message(message).await,
                Ok(SignalingEvent::Disconnected) => {
                    self.teardown_links().await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "mesh", skipped, "signaling event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handle_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::RoomJoined { participants, .. } => {
                // Everyone already present will offer toward us.
                for participant in participants {
                    self.ensure_link(participant, Discovery::AlreadyPresent)
                        .await;
                }
            }
            ServerMessage::UserJoined { participant } => {
                self.ensure_link(participant, Discovery::Newcomer).await;
            }
            ServerMessage::UserLeft { connection_id, .. } => {
                self.drop_link(&connection_id).await;
            }
            ServerMessage::Offer { from, sdp } => {
                self.deliver(&from, LinkCommand::RemoteOffer { sdp }).await;
            }
            ServerMessage::Answer { from, sdp } => {
                self.deliver(&from, LinkCommand::RemoteAnswer { sdp }).await;
            }
            ServerMessage::IceCandidate { from, candidate } => {
                self.deliver(&from, LinkCommand::RemoteCandidate { candidate })
                    .await;
            }
            // Chat, media-state and error events are for the application's
            // own subscribers; negotiation does not react to them.
            _ => {}
        }
    }

    async fn ensure_link(&self, participant: ParticipantInfo, discovery: Discovery) {
        let role = negotiation_role(discovery);
        let mut links = self.links.lock().await;
        if links.contains_key(&participant.connection_id) {
            return;
        }

        let media = match self.ensure_local_media().await {
            Ok(media) => media,
            Err(err) => {
                warn!(target: "mesh", "local media acquisition failed: {err}");
                return;
            }
        };
        let session = match self.engine.create_session(&participant).await {
            Ok(session) => session,
            Err(err) => {
                warn!(
                    target: "mesh",
                    peer = %participant.connection_id,
                    "media session creation failed: {err}"
                );
                return;
            }
        };

        debug!(
            target: "mesh",
            peer = %participant.connection_id,
            ?role,
            "creating peer link"
        );
        let link = PeerLink::spawn(
            participant.clone(),
            role,
            session,
            self.channel.outbound(),
            media,
        );
        links.insert(participant.connection_id, Arc::new(link));
    }

    async fn drop_link(&self, connection_id: &str) {
        let link = { self.links.lock().await.remove(connection_id) };
        if let Some(link) = link {
            debug!(target: "mesh", peer = %connection_id, "closing peer link");
            link.close().await;
        }
        self.release_media_if_idle().await;
    }

    async fn deliver(&self, from: &str, command: LinkCommand) {
        match self.link(from).await {
            Some(link) => link.deliver(command),
            None => debug!(
                target: "mesh",
                peer = %from,
                "signal for unknown peer; dropping"
            ),
        }
    }

    async fn renegotiate_links(&self) {
        for link in self.links.lock().await.values() {
            link.deliver(LinkCommand::Renegotiate);
        }
    }

    async fn ensure_local_media(&self) -> Result<Arc<dyn LocalMedia>, MeshError> {
        let mut media = self.local_media.lock().await;
        if let Some(media) = media.as_ref() {
            return Ok(Arc::clone(media));
        }
        let acquired = self.engine.acquire_local_media().await?;
        *media = Some(Arc::clone(&acquired));
        Ok(acquired)
    }

    async fn release_media_if_idle(&self) {
        let links = self.links.lock().await;
        if links.is_empty() {
            let mut media = self.local_media.lock().await;
            if media.take().is_some() {
                debug!(target: "mesh", "released local media (no peer links remain)");
            }
        }
    }

    async fn teardown_links(&self) {
        let links: Vec<_> = {
            let mut guard = self.links.lock().await;
            guard.drain().map(|(_, link)| link).collect()
        };
        for link in links {
            link.close().await;
        }
        let mut media = self.local_media.lock().await;
        media.take();
    }
}
