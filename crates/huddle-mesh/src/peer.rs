//! Per-remote-participant negotiation.
//!
//! Each [`PeerLink`] owns one [`MediaSession`] and runs the
//! offer/answer/candidate exchange for exactly one remote participant.
//! Signaling events, locally discovered candidates and connectivity
//! reports all funnel through a single ordered queue, so description
//! application always happens-before candidate flushing without any
//! ad-hoc flags.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use huddle_proto::{ClientMessage, ParticipantInfo};

use crate::engine::{Connectivity, LocalMedia, MediaError, MediaEvent, MediaSession};
use crate::policy::NegotiationRole;

/// How long an initiator waits for an answer before giving up on the link.
pub const ANSWER_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Offering,
    AwaitingAnswer,
    Answering,
    Connected,
    Closed,
    /// Negotiation failed terminally for this link only; other links and
    /// room membership are unaffected.
    Failed,
}

#[derive(Debug)]
pub(crate) enum LinkCommand {
    RemoteOffer { sdp: String },
    RemoteAnswer { sdp: String },
    RemoteCandidate { candidate: String },
    Renegotiate,
    Close,
}

enum LinkInput {
    Command(LinkCommand),
    Media(MediaEvent),
}

/// Handle to one running peer link. Dropping the handle does not stop the
/// link; call [`PeerLink::close`] for synchronous teardown.
pub struct PeerLink {
    remote: ParticipantInfo,
    role: NegotiationRole,
    cmd_tx: mpsc::UnboundedSender<LinkInput>,
    state_rx: watch::Receiver<LinkState>,
    task: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PeerLink {
    pub(crate) fn spawn(
        remote: ParticipantInfo,
        role: NegotiationRole,
        session: Arc<dyn MediaSession>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        local_media: Arc<dyn LocalMedia>,
    ) -> PeerLink {
        Self::spawn_with_answer_wait(remote, role, session, outbound, local_media, ANSWER_WAIT)
    }

    pub(crate) fn spawn_with_answer_wait(
        remote: ParticipantInfo,
        role: NegotiationRole,
        session: Arc<dyn MediaSession>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        local_media: Arc<dyn LocalMedia>,
        answer_wait: Duration,
    ) -> PeerLink {
        let (cmd_tx, inputs) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::Idle);

        // Engine events merge into the same queue as signaling commands:
        // one consumer, one order.
        let forward_tx = cmd_tx.clone();
        let event_session = Arc::clone(&session);
        tokio::spawn(async move {
            if let Some(mut events) = event_session.events().await {
                while let Some(event) = events.recv().await {
                    if forward_tx.send(LinkInput::Media(event)).is_err() {
                        break;
                    }
                }
            }
        });

        let runner = LinkRunner {
            remote: remote.clone(),
            role,
            session,
            outbound,
            state_tx,
            pending_remote: Vec::new(),
            remote_description_applied: false,
            answer_deadline: None,
            answer_wait,
            _local_media: local_media,
        };
        let task = tokio::spawn(runner.run(inputs));

        PeerLink {
            remote,
            role,
            cmd_tx,
            state_rx,
            task: AsyncMutex::new(Some(task)),
        }
    }

    pub fn remote(&self) -> &ParticipantInfo {
        &self.remote
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Watch for state transitions (`Receiver::wait_for` friendly).
    pub fn state_changes(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    pub(crate) fn deliver(&self, command: LinkCommand) {
        let _ = self.cmd_tx.send(LinkInput::Command(command));
    }

    /// Stop the link and wait for the engine session to be released. Safe
    /// to call more than once; a link that already failed is simply
    /// reaped.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(LinkInput::Command(LinkCommand::Close));
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

struct LinkRunner {
    remote: ParticipantInfo,
    role: NegotiationRole,
    session: Arc<dyn MediaSession>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    state_tx: watch::Sender<LinkState>,
    /// Candidates received before the matching remote description; flushed
    /// exactly once, in receipt order, right after application.
    pending_remote: Vec<String>,
    remote_description_applied: bool,
    answer_deadline: Option<Instant>,
    answer_wait: Duration,
    /// Held so the shared capture outlives every active link.
    _local_media: Arc<dyn LocalMedia>,
}

impl LinkRunner {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<LinkInput>) {
        if self.role == NegotiationRole::Initiator {
            if let Err(err) = self.begin_offer().await {
                self.fail(&err).await;
                return;
            }
        }

        loop {
            let next = match self.answer_deadline {
                Some(deadline) => match timeout_at(deadline, inputs.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        let err = MediaError::Negotiation(format!(
                            "no answer from {} within {:?}",
                            self.remote.connection_id, self.answer_wait
                        ));
                        self.fail(&err).await;
                        return;
                    }
                },
                None => inputs.recv().await,
            };
            let Some(input) = next else { break };

            match self.handle(input).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(err) => {
                    self.fail(&err).await;
                    break;
                }
            }
        }
    }

    async fn handle(&mut self, input: LinkInput) -> Result<Flow, MediaError> {
        match input {
            LinkInput::Command(LinkCommand::RemoteOffer { sdp }) => {
                match self.state() {
                    // Idle: first negotiation. Connected: the remote
                    // re-offers to renegotiate; same role as before.
                    LinkState::Idle | LinkState::Connected => {
                        self.set_state(LinkState::Answering);
                        self.session.apply_remote_description(&sdp).await?;
                        self.remote_description_applied = true;
                        self.flush_pending().await?;
                        let answer = self.session.create_answer().await?;
                        self.send_signal(ClientMessage::Answer {
                            target: self.remote.connection_id.clone(),
                            sdp: answer,
                        });
                    }
                    state => warn!(
                        target: "mesh",
                        peer = %self.remote.connection_id,
                        ?state,
                        "unexpected offer; ignoring"
                    ),
                }
                Ok(Flow::Continue)
            }

            LinkInput::Command(LinkCommand::RemoteAnswer { sdp }) => {
                if self.state() == LinkState::AwaitingAnswer {
                    self.answer_deadline = None;
                    self.session.apply_remote_description(&sdp).await?;
                    self.remote_description_applied = true;
                    self.flush_pending().await?;
                } else {
                    warn!(
                        target: "mesh",
                        peer = %self.remote.connection_id,
                        state = ?self.state(),
                        "unexpected answer; ignoring"
                    );
                }
                Ok(Flow::Continue)
            }

            LinkInput::Command(LinkCommand::RemoteCandidate { candidate }) => {
                if self.remote_description_applied {
                    self.session.apply_remote_candidate(&candidate).await?;
                } else {
                    self.pending_remote.push(candidate);
                }
                Ok(Flow::Continue)
            }

            LinkInput::Command(LinkCommand::Renegotiate)
            | LinkInput::Media(MediaEvent::RenegotiationNeeded) => {
                // Only the original initiator re-offers; the responder
                // re-enters Answering when the fresh offer arrives.
                if self.state() == LinkState::Connected && self.role == NegotiationRole::Initiator {
                    self.begin_offer().await?;
                }
                Ok(Flow::Continue)
            }

            LinkInput::Command(LinkCommand::Close) => {
                self.session.close().await;
                self.set_state(LinkState::Closed);
                Ok(Flow::Stop)
            }

            LinkInput::Media(MediaEvent::LocalCandidate(candidate)) => {
                // Forwarded the moment it appears; no batching.
                self.send_signal(ClientMessage::IceCandidate {
                    target: self.remote.connection_id.clone(),
                    candidate,
                });
                Ok(Flow::Continue)
            }

            LinkInput::Media(MediaEvent::Connectivity(Connectivity::Connected)) => {
                match self.state() {
                    LinkState::Offering | LinkState::AwaitingAnswer | LinkState::Answering => {
                        self.answer_deadline = None;
                        self.set_state(LinkState::Connected);
                        debug!(
                            target: "mesh",
                            peer = %self.remote.connection_id,
                            "peer link connected"
                        );
                    }
                    _ => {}
                }
                Ok(Flow::Continue)
            }

            LinkInput::Media(MediaEvent::Connectivity(Connectivity::Failed)) => Err(
                MediaError::Negotiation("transport reported failure".to_string()),
            ),

            LinkInput::Media(MediaEvent::Connectivity(_)) => Ok(Flow::Continue),
        }
    }

    async fn begin_offer(&mut self) -> Result<(), MediaError> {
        self.set_state(LinkState::Offering);
        let sdp = self.session.create_offer().await?;
        self.send_signal(ClientMessage::Offer {
            target: self.remote.connection_id.clone(),
            sdp,
        });
        self.set_state(LinkState::AwaitingAnswer);
        self.answer_deadline = Some(Instant::now() + self.answer_wait);
        Ok(())
    }

    async fn flush_pending(&mut self) -> Result<(), MediaError> {
        for candidate in std::mem::take(&mut self.pending_remote) {
            self.session.apply_remote_candidate(&candidate).await?;
        }
        Ok(())
    }

    async fn fail(&mut self, err: &MediaError) {
        warn!(
            target: "mesh",
            peer = %self.remote.connection_id,
            "peer link failed: {err}"
        );
        self.session.close().await;
        self.set_state(LinkState::Failed);
    }

    fn send_signal(&self, message: ClientMessage) {
        // Fire-and-forget: a closed channel means we are tearing down.
        let _ = self.outbound.send(message);
    }

    fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLocalMedia, MockMediaSession};
    use crate::policy::NegotiationRole;
    use tokio::time::timeout;

    fn remote(connection_id: &str) -> ParticipantInfo {
        ParticipantInfo {
            user_id: format!("user-{connection_id}"),
            username: format!("User {connection_id}"),
            connection_id: connection_id.to_string(),
        }
    }

    fn local_media() -> Arc<dyn LocalMedia> {
        Arc::new(MockLocalMedia::detached())
    }

    async fn wait_for_state(link: &PeerLink, wanted: LinkState) {
        let mut states = link.state_changes();
        timeout(Duration::from_secs(5), states.wait_for(|s| *s == wanted))
            .await
            .expect("timed out waiting for link state")
            .expect("state watch closed");
    }

    async fn next_outbound(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> ClientMessage {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("outbound channel closed")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            if Instant::now() > deadline {
                panic!("timed out waiting for condition");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn initiator_offers_then_connects_after_answer_and_candidate() {
        let session = MockMediaSession::new("c-b", 2);
        let (outbound, mut sent) = mpsc::unbounded_channel();
        let link = PeerLink::spawn(
            remote("c-b"),
            NegotiationRole::Initiator,
            session.clone(),
            outbound,
            local_media(),
        );

        let offer = next_outbound(&mut sent).await;
        let ClientMessage::Offer { target, sdp } = offer else {
            panic!("expected offer first, got {offer:?}");
        };
        assert_eq!(target, "c-b");
        assert!(!sdp.is_empty());
        assert_eq!(link.state(), LinkState::AwaitingAnswer);

        // Local candidates trickle out right after the local description.
        for _ in 0..2 {
            let msg = next_outbound(&mut sent).await;
            assert!(matches!(msg, ClientMessage::IceCandidate { .. }));
        }

        link.deliver(LinkCommand::RemoteAnswer {
            sdp: "answer-blob".into(),
        });
        link.deliver(LinkCommand::RemoteCandidate {
            candidate: "remote-cand-0".into(),
        });

        wait_for_state(&link, LinkState::Connected).await;
        assert_eq!(session.remote_description(), Some("answer-blob".into()));
        assert_eq!(session.applied_candidates(), vec!["remote-cand-0"]);
    }

    #[tokio::test]
    async fn responder_buffers_candidates_until_description_applied() {
        let session = MockMediaSession::new("c-a", 0);
        let (outbound, mut sent) = mpsc::unbounded_channel();
        let link = PeerLink::spawn(
            remote("c-a"),
            NegotiationRole::Responder,
            session.clone(),
            outbound,
            local_media(),
        );
        assert_eq!(link.state(), LinkState::Idle);

        // Candidates racing ahead of the offer must not touch the engine.
        link.deliver(LinkCommand::RemoteCandidate {
            candidate: "early-0".into(),
        });
        link.deliver(LinkCommand::RemoteCandidate {
            candidate: "early-1".into(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.applied_candidates().is_empty());

        link.deliver(LinkCommand::RemoteOffer {
            sdp: "offer-blob".into(),
        });

        let answer = next_outbound(&mut sent).await;
        assert!(matches!(answer, ClientMessage::Answer { .. }));
        // Buffered candidates flushed once, in receipt order, then later
        // ones go straight through.
        assert_eq!(session.applied_candidates(), vec!["early-0", "early-1"]);

        link.deliver(LinkCommand::RemoteCandidate {
            candidate: "late-2".into(),
        });
        wait_for_state(&link, LinkState::Connected).await;
        wait_until(|| session.applied_candidates().len() == 3).await;
        assert_eq!(
            session.applied_candidates(),
            vec!["early-0", "early-1", "late-2"]
        );
    }

    #[tokio::test]
    async fn initiator_fails_after_bounded_answer_wait() {
        let session = MockMediaSession::new("c-b", 0);
        let (outbound, mut sent) = mpsc::unbounded_channel();
        let link = PeerLink::spawn_with_answer_wait(
            remote("c-b"),
            NegotiationRole::Initiator,
            session.clone(),
            outbound,
            local_media(),
            Duration::from_millis(50),
        );

        let _offer = next_outbound(&mut sent).await;
        wait_for_state(&link, LinkState::Failed).await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn failed_offer_creation_is_terminal_for_that_link_only() {
        let session = MockMediaSession::new("c-b", 0);
        session.fail_offers(true);
        let (outbound, _sent) = mpsc::unbounded_channel();
        let link = PeerLink::spawn(
            remote("c-b"),
            NegotiationRole::Initiator,
            session.clone(),
            outbound,
            local_media(),
        );

        wait_for_state(&link, LinkState::Failed).await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn renegotiation_reoffers_with_original_role() {
        let session = MockMediaSession::new("c-b", 0);
        let (outbound, mut sent) = mpsc::unbounded_channel();
        let link = PeerLink::spawn(
            remote("c-b"),
            NegotiationRole::Initiator,
            session.clone(),
            outbound,
            local_media(),
        );

        let _first_offer = next_outbound(&mut sent).await;
        link.deliver(LinkCommand::RemoteAnswer {
            sdp: "answer-1".into(),
        });
        link.deliver(LinkCommand::RemoteCandidate {
            candidate: "cand-1".into(),
        });
        wait_for_state(&link, LinkState::Connected).await;

        link.deliver(LinkCommand::Renegotiate);
        let second = next_outbound(&mut sent).await;
        assert!(matches!(second, ClientMessage::Offer { .. }));
        assert_eq!(session.offers_created(), 2);

        link.deliver(LinkCommand::RemoteAnswer {
            sdp: "answer-2".into(),
        });
        wait_for_state(&link, LinkState::Connected).await;

        // The engine can also ask for a fresh exchange itself (a track
        // change it noticed on its own).
        session.push_event(MediaEvent::RenegotiationNeeded);
        let third = next_outbound(&mut sent).await;
        assert!(matches!(third, ClientMessage::Offer { .. }));
        assert_eq!(session.offers_created(), 3);
    }

    #[tokio::test]
    async fn close_releases_the_session() {
        let session = MockMediaSession::new("c-b", 0);
        let (outbound, _sent) = mpsc::unbounded_channel();
        let link = PeerLink::spawn(
            remote("c-b"),
            NegotiationRole::Responder,
            session.clone(),
            outbound,
            local_media(),
        );

        link.close().await;
        assert_eq!(link.state(), LinkState::Closed);
        assert!(session.is_closed());
    }
}
