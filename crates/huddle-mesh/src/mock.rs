//! In-memory media engine for tests.
//!
//! Produces deterministic opaque blobs and reports a session connected
//! once it holds a local description, a remote description and at least
//! one remote candidate, the same shape a real handshake settles into.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use huddle_proto::ParticipantInfo;

use crate::engine::{
    Connectivity, LocalMedia, MediaEngine, MediaError, MediaEvent, MediaSession,
};

pub struct MockMediaSession {
    remote_id: String,
    /// How many local candidates to surface after each local description.
    auto_candidates: usize,
    events_tx: mpsc::UnboundedSender<MediaEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MediaEvent>>>,
    remote_description: Mutex<Option<String>>,
    applied_candidates: Mutex<Vec<String>>,
    local_described: AtomicBool,
    offers: AtomicUsize,
    answers: AtomicUsize,
    candidate_seq: AtomicUsize,
    connected_latch: AtomicBool,
    closed: AtomicBool,
    fail_offers: AtomicBool,
}

impl MockMediaSession {
    pub fn new(remote_id: &str, auto_candidates: usize) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            remote_id: remote_id.to_string(),
            auto_candidates,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            remote_description: Mutex::new(None),
            applied_candidates: Mutex::new(Vec::new()),
            local_described: AtomicBool::new(false),
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            candidate_seq: AtomicUsize::new(0),
            connected_latch: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_offers: AtomicBool::new(false),
        })
    }

    /// Script the next `create_offer` calls to fail.
    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    /// Inject an event as if the transport had surfaced it.
    pub fn push_event(&self, event: MediaEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn remote_description(&self) -> Option<String> {
        self.remote_description.lock().unwrap().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied_candidates.lock().unwrap().clone()
    }

    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answers_created(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn describe_local(&self) {
        self.local_described.store(true, Ordering::SeqCst);
        for _ in 0..self.auto_candidates {
            let seq = self.candidate_seq.fetch_add(1, Ordering::SeqCst);
            let _ = self.events_tx.send(MediaEvent::LocalCandidate(format!(
                "cand/{}/{seq}",
                self.remote_id
            )));
        }
    }

    fn maybe_connect(&self) {
        let ready = self.local_described.load(Ordering::SeqCst)
            && self.remote_description.lock().unwrap().is_some()
            && !self.applied_candidates.lock().unwrap().is_empty();
        if ready && !self.connected_latch.swap(true, Ordering::SeqCst) {
            let _ = self
                .events_tx
                .send(MediaEvent::Connectivity(Connectivity::Connected));
        }
    }
}

#[async_trait]
impl MediaSession for MockMediaSession {
    async fn create_offer(&self) -> Result<String, MediaError> {
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(MediaError::Setup("scripted offer failure".to_string()));
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        self.describe_local();
        Ok(format!("offer/{}/{n}", self.remote_id))
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        let n = self.answers.fetch_add(1, Ordering::SeqCst) + 1;
        self.describe_local();
        self.maybe_connect();
        Ok(format!("answer/{}/{n}", self.remote_id))
    }

    async fn apply_remote_description(&self, sdp: &str) -> Result<(), MediaError> {
        let mut description = self.remote_description.lock().unwrap();
        if description.is_some() {
            // Renegotiation: a fresh description restarts the connected
            // report for this round.
            self.connected_latch.store(false, Ordering::SeqCst);
        }
        *description = Some(sdp.to_string());
        drop(description);
        self.maybe_connect();
        Ok(())
    }

    async fn apply_remote_candidate(&self, candidate: &str) -> Result<(), MediaError> {
        if self.remote_description.lock().unwrap().is_none() {
            return Err(MediaError::Negotiation(
                "candidate applied before remote description".to_string(),
            ));
        }
        self.applied_candidates
            .lock()
            .unwrap()
            .push(candidate.to_string());
        self.maybe_connect();
        Ok(())
    }

    async fn events(&self) -> Option<mpsc::UnboundedReceiver<MediaEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockLocalMedia {
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    released: Arc<AtomicBool>,
}

impl MockLocalMedia {
    fn new(released: Arc<AtomicBool>) -> Self {
        Self {
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
            released,
        }
    }

    /// A handle not tracked by any engine, for link-level tests.
    pub fn detached() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)))
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }
}

impl LocalMedia for MockLocalMedia {
    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }
}

impl Drop for MockLocalMedia {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

pub struct MockMediaEngine {
    sessions: Mutex<Vec<Arc<MockMediaSession>>>,
    media_released: Arc<AtomicBool>,
    media_acquisitions: AtomicUsize,
    auto_candidates: usize,
}

impl MockMediaEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(Vec::new()),
            media_released: Arc::new(AtomicBool::new(false)),
            media_acquisitions: AtomicUsize::new(0),
            auto_candidates: 2,
        })
    }

    /// The session created for a given remote connection id, if any.
    pub fn session_for(&self, remote_connection_id: &str) -> Option<Arc<MockMediaSession>> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.remote_id == remote_connection_id)
            .cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<MockMediaSession>> {
        self.sessions.lock().unwrap().clone()
    }

    /// True once every holder of the acquired local media dropped it.
    pub fn local_media_released(&self) -> bool {
        self.media_released.load(Ordering::SeqCst)
    }

    pub fn media_acquisitions(&self) -> usize {
        self.media_acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn acquire_local_media(&self) -> Result<Arc<dyn LocalMedia>, MediaError> {
        self.media_released.store(false, Ordering::SeqCst);
        self.media_acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockLocalMedia::new(Arc::clone(
            &self.media_released,
        ))))
    }

    async fn create_session(
        &self,
        remote: &ParticipantInfo,
    ) -> Result<Arc<dyn MediaSession>, MediaError> {
        let session = MockMediaSession::new(&remote.connection_id, self.auto_candidates);
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }
}
