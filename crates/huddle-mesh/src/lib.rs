//! Client-side mesh coordination for huddle rooms.
//!
//! A [`SignalingChannel`] owns the connection to the relay and fans
//! inbound envelopes out to any number of subscribers. A
//! [`MeshCoordinator`] consumes that stream and keeps one independent
//! [`PeerLink`] negotiation per remote participant, driving the
//! [`MediaEngine`] collaborator that actually moves media.

pub mod channel;
pub mod engine;
pub mod mesh;
pub mod mock;
pub mod peer;
pub mod policy;

pub use channel::{LocalIdentity, RoomJoinedInfo, SignalingChannel, SignalingEvent};
pub use engine::{Connectivity, LocalMedia, MediaEngine, MediaError, MediaEvent, MediaSession};
pub use mesh::MeshCoordinator;
pub use peer::{LinkState, PeerLink};
pub use policy::{Discovery, NegotiationRole, negotiation_role};

/// Errors surfaced by the signaling channel and the mesh coordinator.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("signaling setup failed: {0}")]
    Setup(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("join rejected: {0}")]
    JoinRejected(String),
    #[error(transparent)]
    Media(#[from] MediaError),
}
