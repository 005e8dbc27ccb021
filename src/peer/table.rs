use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::media::LocalMedia;
use crate::peer::connection::{EngineEventSender, PeerConnector};
use crate::peer::session::PeerSession;
use crate::peer::types::{ParticipantKey, Role};
use crate::{Error, Result};

/// The authoritative map from participant key to its session; at most one session per key
pub struct PeerSessionTable {
    sessions: HashMap<ParticipantKey, PeerSession>,
    connector: Arc<dyn PeerConnector>,
    local_media: Arc<LocalMedia>,
    events: EngineEventSender,
}

impl PeerSessionTable {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        local_media: Arc<LocalMedia>,
        events: EngineEventSender,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            connector,
            local_media,
            events,
        }
    }

    /// Returns the session for `key`, creating it in `role` with local tracks attached if absent.
    /// `role` is ignored for an existing session.
    pub async fn get_or_create(&mut self, key: &ParticipantKey, role: Role) -> Result<&mut PeerSession> {
        match self.sessions.entry(key.clone()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let local = self.local_media.tracks();
                let handle = self
                    .connector
                    .connect(key, local, self.events.clone())
                    .await?;
                let tracks = local.map(|t| t.len()).unwrap_or(0);
                debug!(peer = %key, ?role, tracks, "session created");
                Ok(v.insert(PeerSession::new(key.clone(), role, handle, tracks)))
            }
        }
    }

    pub fn get(&self, key: &ParticipantKey) -> Result<&PeerSession> {
        self.sessions
            .get(key)
            .ok_or_else(|| Error::UnknownPeerReference(key.to_string()))
    }

    pub fn get_mut(&mut self, key: &ParticipantKey) -> Result<&mut PeerSession> {
        self.sessions
            .get_mut(key)
            .ok_or_else(|| Error::UnknownPeerReference(key.to_string()))
    }

    pub fn remove(&mut self, key: &ParticipantKey) -> Option<PeerSession> {
        self.sessions.remove(key)
    }

    pub fn contains(&self, key: &ParticipantKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn keys(&self) -> Vec<ParticipantKey> {
        self.sessions.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
