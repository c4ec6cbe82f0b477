//! Initiator assignment for peer negotiation.

/// How the local client learned about a remote participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    /// The remote appeared via a `user_joined` event: the local client was
    /// already in the room when it arrived.
    Newcomer,
    /// The remote was listed in the `room_joined` roster: it was already in
    /// the room when the local client arrived.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Initiator,
    Responder,
}

/// Existing members initiate toward a newcomer; a newcomer answers toward
/// every existing member. Because the relay tells exactly one side that the
/// other is the newcomer, both ends of every pair derive opposite roles
/// from the same rule, and offer glare cannot occur.
pub fn negotiation_role(discovery: Discovery) -> NegotiationRole {
    match discovery {
        Discovery::Newcomer => NegotiationRole::Initiator,
        Discovery::AlreadyPresent => NegotiationRole::Responder,
    }
}
