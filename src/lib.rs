//! Peer-to-peer audio/video mesh signaling.
//!
//! Participants in a room discover each other's keys over a pub/sub relay and then negotiate one
//! WebRTC connection per peer through offer/answer/ICE exchange. Media never touches the relay.

pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod membership;
pub mod peer;
pub mod room;
pub mod signaling;
pub mod utils;

pub use config::MeshConfig;
pub use error::{Error, Result};
pub use media::{LocalTracks, MediaCapture, RemoteStream, Renderer};
pub use peer::{ParticipantKey, PeerConnector, PeerHandle, RtcConnector};
pub use room::{Room, RoomHandle, RoomSnapshot, SessionInfo};
pub use signaling::{Relay, RoomId};
