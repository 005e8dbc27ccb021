//! Relay boundary: topic naming, the wire codec, and the transport seam.
//!
//! Nothing above this module sees raw relay frames. Inbound frames are parsed into a [`Topic`] and
//! decoded into a [`SignalMessage`] here; anything that does not fit is rejected as
//! [`Error::MalformedEnvelope`](crate::Error::MalformedEnvelope).

pub mod message;
pub mod relay;
pub mod topic;

pub use message::{Envelope, Outbound, SignalMessage};
pub use relay::{MemoryBroker, MemoryRelay, ReconnectPolicy, ReconnectingRelay, Relay, RelayFrame};
pub use topic::{RoomId, Topic};
