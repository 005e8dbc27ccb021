pub mod connection;
pub mod ice;
pub mod session;
pub mod state;
pub mod table;
pub mod types;

#[cfg(test)]
pub(crate) mod stub;

pub use connection::{
    EngineEvent, EngineEventKind, EngineEventSender, EngineState, PeerConnector, PeerHandle,
    RtcConnector,
};
pub use session::PeerSession;
pub use state::{NegotiationEvent, NegotiationState};
pub use table::PeerSessionTable;
pub use types::{IceCandidate, ParticipantKey, Role, SdpType, ServerConfig, SessionDescription};
