//! Key exchange over the relay: who else is in the room

use std::collections::HashSet;
use tracing::debug;

use crate::peer::types::ParticipantKey;
use crate::signaling::{Outbound, RoomId, Topic};

/// Outcome of an inbound key announce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    SelfEcho,
    AlreadyKnown,
    NewPeer,
}

#[derive(Debug)]
pub struct Membership {
    me: ParticipantKey,
    room: RoomId,
    known: HashSet<ParticipantKey>,
}

impl Membership {
    pub fn new(me: ParticipantKey, room: RoomId) -> Self {
        Self {
            me,
            room,
            known: HashSet::new(),
        }
    }

    pub fn me(&self) -> &ParticipantKey {
        &self.me
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Relay paths this participant listens on
    pub fn subscriptions(&self) -> Vec<String> {
        Topic::inbound(&self.me)
            .iter()
            .map(|t| t.path(&self.room))
            .collect()
    }

    /// Someone asked for keys; answer with ours
    pub fn on_key_request(&self) -> Outbound {
        Outbound::key_announce(&self.me)
    }

    pub fn on_key_announce(&mut self, key: &ParticipantKey) -> Discovery {
        if *key == self.me {
            debug!("ignoring own key announce");
            return Discovery::SelfEcho;
        }
        if self.known.insert(key.clone()) {
            debug!(peer = %key, known = self.known.len(), "discovered peer");
            Discovery::NewPeer
        } else {
            Discovery::AlreadyKnown
        }
    }

    /// Records a key learnt some other way (an unsolicited offer). Returns false for self or an
    /// already known key.
    pub fn remember(&mut self, key: &ParticipantKey) -> bool {
        *key != self.me && self.known.insert(key.clone())
    }

    pub fn forget(&mut self, key: &ParticipantKey) -> bool {
        self.known.remove(key)
    }

    pub fn is_known(&self, key: &ParticipantKey) -> bool {
        self.known.contains(key)
    }

    /// Known keys, sorted
    pub fn known_peers(&self) -> Vec<ParticipantKey> {
        let mut keys: Vec<_> = self.known.iter().cloned().collect();
        keys.sort();
        keys
    }

    pub fn key_request(&self) -> Outbound {
        Outbound::key_request()
    }

    pub fn leave_notice(&self) -> Outbound {
        Outbound::leave(&self.me)
    }
}
