use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::peer::connection::PeerHandle;
use crate::peer::types::{IceCandidate, ParticipantKey};

/// Remote candidates received before the remote description was applied
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }
}

/// Applies every queued candidate in arrival order. A rejected candidate is logged and skipped;
/// returns how many were accepted.
pub async fn apply_pending_candidates(
    handle: &dyn PeerHandle,
    peer: &ParticipantKey,
    pending: &mut PendingCandidates,
) -> usize {
    let candidates = pending.drain();
    let total = candidates.len();
    let mut applied = 0;

    for candidate in candidates {
        debug!(%peer, "Applying pending candidate: {}", candidate.candidate);
        match handle.add_ice_candidate(candidate).await {
            Ok(()) => applied += 1,
            Err(e) => warn!(%peer, "Failed to apply pending candidate: {}", e),
        }
    }

    if total > 0 {
        debug!(%peer, applied, total, "flushed pending candidates");
    }
    applied
}
