//! Error types for room signaling

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating a room
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Local capture device unavailable or permission denied
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// Answer or candidate addressed from a key with no session
    #[error("Unknown peer reference: {0}")]
    UnknownPeerReference(String),

    /// Negotiation never reached a connected state
    #[error("Negotiation stalled for peer {0}")]
    NegotiationStall(String),

    /// Frame that could not be decoded at the relay boundary
    #[error("Malformed envelope on {topic}: {reason}")]
    MalformedEnvelope { topic: String, reason: String },

    /// State machine received an event it cannot accept in its current state
    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    /// Relay connection lost
    #[error("Relay disconnected")]
    RelayDisconnected,

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    Sdp(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidate(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// Room loop is no longer running
    #[error("Room closed")]
    RoomClosed,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

impl Error {
    /// Check if this error is worth retrying at the transport boundary
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RelayDisconnected | Error::Io(_))
    }

    pub(crate) fn malformed(topic: &str, reason: impl ToString) -> Self {
        Error::MalformedEnvelope {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}
