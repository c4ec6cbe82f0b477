//! The media-transport collaborator boundary.
//!
//! The mesh never inspects session descriptions or connectivity
//! candidates: they are opaque strings produced and consumed by whatever
//! engine sits behind these traits, and relayed verbatim through the
//! signaling channel.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use huddle_proto::ParticipantInfo;

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("media setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

/// Transport-level connectivity of one peer session, as reported by the
/// engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Events a [`MediaSession`] surfaces to its negotiation link.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// A locally discovered connectivity candidate, to be forwarded to the
    /// remote peer the moment it appears.
    LocalCandidate(String),
    Connectivity(Connectivity),
    /// The local track set changed (screen sharing started or stopped);
    /// the session wants a fresh description exchange.
    RenegotiationNeeded,
}

/// One engine-side peer session, paired with exactly one [`PeerLink`].
///
/// [`PeerLink`]: crate::peer::PeerLink
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self) -> Result<String, MediaError>;
    async fn create_answer(&self) -> Result<String, MediaError>;
    async fn apply_remote_description(&self, sdp: &str) -> Result<(), MediaError>;
    /// Apply a remote candidate. Callers must have applied a remote
    /// description first; the link buffers early candidates to guarantee
    /// that.
    async fn apply_remote_candidate(&self, candidate: &str) -> Result<(), MediaError>;
    /// Take the session's event stream. Yields `None` after the first call.
    async fn events(&self) -> Option<mpsc::UnboundedReceiver<MediaEvent>>;
    async fn close(&self);
}

/// Locally captured microphone/camera state, acquired once and shared
/// read-only by every peer session. Released when the last holder drops.
pub trait LocalMedia: Send + Sync {
    fn set_audio_enabled(&self, enabled: bool);
    fn set_video_enabled(&self, enabled: bool);
}

/// Factory for peer sessions and the scoped local-media acquisition.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn acquire_local_media(&self) -> Result<Arc<dyn LocalMedia>, MediaError>;
    async fn create_session(
        &self,
        remote: &ParticipantInfo,
    ) -> Result<Arc<dyn MediaSession>, MediaError>;
}
