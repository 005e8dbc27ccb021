use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::peer::connection::{EngineState, PeerHandle};
use crate::peer::ice::{apply_pending_candidates, PendingCandidates};
use crate::peer::state::{NegotiationEvent, NegotiationState};
use crate::peer::types::{IceCandidate, ParticipantKey, Role, SessionDescription};
use crate::{Error, Result};

/// Negotiation progress and connection handle for one remote participant
pub struct PeerSession {
    key: ParticipantKey,
    role: Role,
    state: NegotiationState,
    engine_state: EngineState,
    handle: Arc<dyn PeerHandle>,
    pending: PendingCandidates,
    remote_description_set: bool,
    local_tracks: usize,
    created_at: Instant,
    deadline_task: Option<JoinHandle<()>>,
    grace_task: Option<JoinHandle<()>>,
}

impl PeerSession {
    pub fn new(
        key: ParticipantKey,
        role: Role,
        handle: Arc<dyn PeerHandle>,
        local_tracks: usize,
    ) -> Self {
        Self {
            key,
            role,
            state: NegotiationState::Created,
            engine_state: EngineState::New,
            handle,
            pending: PendingCandidates::default(),
            remote_description_set: false,
            local_tracks,
            created_at: Instant::now(),
            deadline_task: None,
            grace_task: None,
        }
    }

    pub fn key(&self) -> &ParticipantKey {
        &self.key
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine_state
    }

    pub fn connection_id(&self) -> &str {
        self.handle.connection_id()
    }

    pub fn local_tracks(&self) -> usize {
        self.local_tracks
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn advance(&mut self, event: NegotiationEvent) -> Result<NegotiationState> {
        let next = self.state.on(event)?;
        if next != self.state {
            debug!(peer = %self.key, "negotiation {} -> {}", self.state, next);
            if next == NegotiationState::Connected {
                info!(
                    peer = %self.key,
                    role = ?self.role,
                    elapsed_ms = self.created_at.elapsed().as_millis() as u64,
                    "peer connected"
                );
            }
            self.state = next;
        }
        Ok(next)
    }

    /// Initiator: create the offer and store it as local description
    pub async fn send_offer(&mut self) -> Result<SessionDescription> {
        self.expect_role(Role::Initiator, "send_offer")?;
        let offer = self.handle.create_offer().await?;
        self.handle.set_local_description(offer.clone()).await?;
        self.advance(NegotiationEvent::OfferSent)?;
        Ok(offer)
    }

    /// Responder: apply the offer, then create and store the answer
    pub async fn answer_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription> {
        self.expect_role(Role::Responder, "answer_offer")?;
        if self.state != NegotiationState::Created {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                event: "offer".into(),
            });
        }
        self.apply_remote_description(offer).await?;
        let answer = self.handle.create_answer().await?;
        self.handle.set_local_description(answer.clone()).await?;
        self.advance(NegotiationEvent::AnswerSent)?;
        Ok(answer)
    }

    /// Initiator: apply the peer's answer
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<()> {
        self.expect_role(Role::Initiator, "accept_answer")?;
        if self.state != NegotiationState::OfferSent || self.remote_description_set {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                event: "answer".into(),
            });
        }
        self.apply_remote_description(answer).await
    }

    /// Applies a remote candidate now, or queues it until the remote description is set.
    /// Returns true when it was handed to the engine.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<bool> {
        if !self.remote_description_set {
            debug!(peer = %self.key, "Remote description not set yet, queuing candidate");
            self.pending.push(candidate);
            return Ok(false);
        }
        self.handle.add_ice_candidate(candidate).await?;
        Ok(true)
    }

    /// Hands over candidates still waiting for a remote description
    pub fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        self.pending.drain()
    }

    async fn apply_remote_description(&mut self, desc: SessionDescription) -> Result<()> {
        self.handle.set_remote_description(desc).await?;
        self.remote_description_set = true;
        apply_pending_candidates(self.handle.as_ref(), &self.key, &mut self.pending).await;
        Ok(())
    }

    pub fn set_engine_state(&mut self, state: EngineState) {
        self.engine_state = state;
    }

    pub fn set_deadline(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.deadline_task.replace(task) {
            old.abort();
        }
    }

    pub fn clear_deadline(&mut self) {
        if let Some(task) = self.deadline_task.take() {
            task.abort();
        }
    }

    pub fn grace_pending(&self) -> bool {
        self.grace_task.is_some()
    }

    pub fn set_grace(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.grace_task.replace(task) {
            old.abort();
        }
    }

    pub fn clear_grace(&mut self) {
        if let Some(task) = self.grace_task.take() {
            task.abort();
        }
    }

    pub async fn report(&self, moment: &str) {
        self.handle.report(moment).await;
    }

    /// Moves to a terminal state and releases the connection
    pub async fn close(&mut self, terminal: NegotiationEvent) {
        if let Err(e) = self.advance(terminal) {
            debug!(peer = %self.key, "close: {}", e);
        }
        self.clear_deadline();
        self.clear_grace();
        if let Err(e) = self.handle.close().await {
            warn!(peer = %self.key, "error closing connection: {}", e);
        }
    }

    fn expect_role(&self, role: Role, op: &str) -> Result<()> {
        if self.role != role {
            return Err(Error::InvalidTransition {
                from: format!("{:?}/{}", self.role, self.state),
                event: op.to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.clear_deadline();
        self.clear_grace();
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("key", &self.key)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("engine_state", &self.engine_state)
            .field("connection_id", &self.connection_id())
            .field("pending_candidates", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::stub::StubHandle;

    fn candidate(c: &str) -> IceCandidate {
        IceCandidate {
            candidate: c.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn session(role: Role) -> (PeerSession, Arc<StubHandle>) {
        let handle = Arc::new(StubHandle::default());
        let session = PeerSession::new(ParticipantKey::from("remote"), role, handle.clone(), 0);
        (session, handle)
    }

    #[tokio::test]
    async fn test_early_candidates_flushed_after_answer() {
        let (mut s, handle) = session(Role::Initiator);
        s.send_offer().await.unwrap();
        assert_eq!(s.state(), NegotiationState::OfferSent);

        assert!(!s.add_remote_candidate(candidate("c1")).await.unwrap());
        assert!(!s.add_remote_candidate(candidate("c2")).await.unwrap());
        assert_eq!(s.pending_candidates(), 2);

        s.accept_answer(SessionDescription::answer("a")).await.unwrap();
        assert_eq!(s.pending_candidates(), 0);
        assert_eq!(*handle.applied.lock().unwrap(), vec!["c1", "c2"]);

        assert!(s.add_remote_candidate(candidate("c3")).await.unwrap());
        assert_eq!(handle.applied.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_bad_pending_candidate_does_not_block_flush() {
        let (mut s, handle) = session(Role::Responder);
        s.add_remote_candidate(candidate("bogus")).await.unwrap();
        s.add_remote_candidate(candidate("good")).await.unwrap();

        s.answer_offer(SessionDescription::offer("o")).await.unwrap();
        assert_eq!(s.state(), NegotiationState::AnswerSent);
        assert_eq!(*handle.applied.lock().unwrap(), vec!["good"]);
    }

    #[tokio::test]
    async fn test_role_guards() {
        let (mut s, _) = session(Role::Responder);
        assert!(s.send_offer().await.is_err());
        assert!(s.accept_answer(SessionDescription::answer("a")).await.is_err());

        let (mut s, _) = session(Role::Initiator);
        assert!(s.answer_offer(SessionDescription::offer("o")).await.is_err());
        // answer before our offer went out
        assert!(s.accept_answer(SessionDescription::answer("a")).await.is_err());
    }

    #[tokio::test]
    async fn test_second_answer_rejected() {
        let (mut s, _) = session(Role::Initiator);
        s.send_offer().await.unwrap();
        s.accept_answer(SessionDescription::answer("a")).await.unwrap();
        assert!(matches!(
            s.accept_answer(SessionDescription::answer("a")).await,
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_is_terminal_and_releases_handle() {
        let (mut s, handle) = session(Role::Initiator);
        s.send_offer().await.unwrap();
        s.advance(NegotiationEvent::EngineConnected).unwrap();
        s.close(NegotiationEvent::Fail).await;
        assert_eq!(s.state(), NegotiationState::Failed);
        assert!(handle.closed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
