//! In-crate stand-in engine for unit tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::media::LocalTracks;
use crate::peer::connection::{EngineEventSender, PeerConnector, PeerHandle};
use crate::peer::types::{IceCandidate, ParticipantKey, SessionDescription};
use crate::utils::random_id;
use crate::{Error, Result};

#[derive(Default)]
pub struct StubConnector {
    connects: AtomicUsize,
}

impl StubConnector {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnector for StubConnector {
    async fn connect(
        &self,
        _peer: &ParticipantKey,
        _local: Option<&LocalTracks>,
        _events: EngineEventSender,
    ) -> Result<Arc<dyn PeerHandle>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StubHandle::default()) as Arc<dyn PeerHandle>)
    }
}

/// Records what the session asked of it; candidates are rejected until a remote description is set
pub struct StubHandle {
    id: String,
    remote_set: AtomicBool,
    pub applied: Mutex<Vec<String>>,
    pub closed: AtomicBool,
}

impl Default for StubHandle {
    fn default() -> Self {
        Self {
            id: random_id(),
            remote_set: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PeerHandle for StubHandle {
    fn connection_id(&self) -> &str {
        &self.id
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer("stub-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(Error::Sdp("no remote offer".into()));
        }
        Ok(SessionDescription::answer("stub-answer"))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
        Ok(())
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(Error::IceCandidate("remote description not set".into()));
        }
        if candidate.candidate.contains("bogus") {
            return Err(Error::IceCandidate("unparseable".into()));
        }
        self.applied
            .lock()
            .map_err(|_| Error::IceCandidate("poisoned".into()))?
            .push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
