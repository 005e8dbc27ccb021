use crate::peer::types::ParticipantKey;
use crate::{Error, Result};
use std::fmt;

/// Room identifier supplied by the "enter room" action; scopes every topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidConfig("room id must not be empty".into()));
        }
        if id.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "room id must not contain '/': {}",
                id
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relay topics. Peer topics carry the *target* key; the sender travels in the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    KeyRequest,
    KeyAnnounce,
    Leave,
    Offer(ParticipantKey),
    Answer(ParticipantKey),
    IceCandidate(ParticipantKey),
}

impl Topic {
    pub fn path(&self, room: &RoomId) -> String {
        match self {
            Topic::KeyRequest => format!("call/key/{room}"),
            Topic::KeyAnnounce => format!("send/key/{room}"),
            Topic::Leave => format!("leave/key/{room}"),
            Topic::Offer(target) => format!("peer/offer/{target}/{room}"),
            Topic::Answer(target) => format!("peer/answer/{target}/{room}"),
            Topic::IceCandidate(target) => format!("peer/iceCandidate/{target}/{room}"),
        }
    }

    /// Parses a topic path belonging to `room`; paths for other rooms are rejected
    pub fn parse(path: &str, room: &RoomId) -> Result<Self> {
        let parts: Vec<&str> = path.split('/').collect();
        let topic = match parts.as_slice() {
            ["call", "key", r] if *r == room.as_str() => Topic::KeyRequest,
            ["send", "key", r] if *r == room.as_str() => Topic::KeyAnnounce,
            ["leave", "key", r] if *r == room.as_str() => Topic::Leave,
            ["peer", kind, target, r] if *r == room.as_str() && !target.is_empty() => {
                let target = ParticipantKey::from(*target);
                match *kind {
                    "offer" => Topic::Offer(target),
                    "answer" => Topic::Answer(target),
                    "iceCandidate" => Topic::IceCandidate(target),
                    _ => return Err(Error::malformed(path, "unknown peer topic")),
                }
            }
            _ => return Err(Error::malformed(path, "not a topic of this room")),
        };
        Ok(topic)
    }

    /// Topics a participant listens on for the lifetime of the room
    pub fn inbound(me: &ParticipantKey) -> Vec<Topic> {
        vec![
            Topic::KeyRequest,
            Topic::KeyAnnounce,
            Topic::Leave,
            Topic::Offer(me.clone()),
            Topic::Answer(me.clone()),
            Topic::IceCandidate(me.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let room = RoomId::new("r1").unwrap();
        let target = ParticipantKey::from("abc");
        assert_eq!(Topic::KeyRequest.path(&room), "call/key/r1");
        assert_eq!(Topic::KeyAnnounce.path(&room), "send/key/r1");
        assert_eq!(
            Topic::IceCandidate(target).path(&room),
            "peer/iceCandidate/abc/r1"
        );
    }

    #[test]
    fn test_parse_matches_path() {
        let room = RoomId::new("r1").unwrap();
        let me = ParticipantKey::from("me");
        for topic in Topic::inbound(&me) {
            assert_eq!(Topic::parse(&topic.path(&room), &room).unwrap(), topic);
        }
    }

    #[test]
    fn test_parse_rejects_other_rooms_and_junk() {
        let room = RoomId::new("r1").unwrap();
        assert!(Topic::parse("call/key/r2", &room).is_err());
        assert!(Topic::parse("peer/hangup/abc/r1", &room).is_err());
        assert!(Topic::parse("peer/offer//r1", &room).is_err());
        assert!(Topic::parse("", &room).is_err());
    }

    #[test]
    fn test_room_id_validation() {
        assert!(RoomId::new("").is_err());
        assert!(RoomId::new("  ").is_err());
        assert!(RoomId::new("a/b").is_err());
        assert_eq!(RoomId::new("lobby").unwrap().as_str(), "lobby");
    }
}
