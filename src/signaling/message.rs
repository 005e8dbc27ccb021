use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::topic::Topic;
use crate::peer::types::{IceCandidate, ParticipantKey, SdpType, SessionDescription};
use crate::{Error, Result};

/// Peer-addressed payload: `{ "key": <sender>, "body": ... }`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub key: ParticipantKey,
    pub body: T,
}

/// Every message the room understands. The variant is chosen by the topic a frame arrived on,
/// never by a tag inside the payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalMessage {
    KeyRequest,
    KeyAnnounce(ParticipantKey),
    Leave(ParticipantKey),
    Offer(Envelope<SessionDescription>),
    Answer(Envelope<SessionDescription>),
    IceCandidate(Envelope<IceCandidate>),
}

impl SignalMessage {
    pub fn decode(topic: &Topic, path: &str, payload: &str) -> Result<Self> {
        let msg = match topic {
            Topic::KeyRequest => SignalMessage::KeyRequest,
            Topic::KeyAnnounce => SignalMessage::KeyAnnounce(parse_key(path, payload)?),
            Topic::Leave => SignalMessage::Leave(parse_key(path, payload)?),
            Topic::Offer(_) => {
                let env: Envelope<SessionDescription> = parse_envelope(path, payload)?;
                expect_sdp(path, &env.body, SdpType::Offer)?;
                SignalMessage::Offer(env)
            }
            Topic::Answer(_) => {
                let env: Envelope<SessionDescription> = parse_envelope(path, payload)?;
                expect_sdp(path, &env.body, SdpType::Answer)?;
                SignalMessage::Answer(env)
            }
            Topic::IceCandidate(_) => SignalMessage::IceCandidate(parse_envelope(path, payload)?),
        };
        Ok(msg)
    }

    pub fn encode(&self) -> Result<String> {
        let json = match self {
            SignalMessage::KeyRequest => serde_json::to_string("")?,
            SignalMessage::KeyAnnounce(key) | SignalMessage::Leave(key) => {
                serde_json::to_string(key)?
            }
            SignalMessage::Offer(env) | SignalMessage::Answer(env) => serde_json::to_string(env)?,
            SignalMessage::IceCandidate(env) => serde_json::to_string(env)?,
        };
        Ok(json)
    }
}

fn parse<T: DeserializeOwned>(path: &str, payload: &str) -> Result<T> {
    serde_json::from_str(payload).map_err(|e| Error::malformed(path, e))
}

fn parse_key(path: &str, payload: &str) -> Result<ParticipantKey> {
    let key: ParticipantKey = parse(path, payload)?;
    check_key(path, &key)?;
    Ok(key)
}

fn parse_envelope<T: DeserializeOwned>(path: &str, payload: &str) -> Result<Envelope<T>> {
    let env: Envelope<T> = parse(path, payload)?;
    check_key(path, &env.key)?;
    Ok(env)
}

/// Keys end up as topic segments, so they must be non-empty and free of '/'
fn check_key(path: &str, key: &ParticipantKey) -> Result<()> {
    if key.as_str().is_empty() {
        return Err(Error::malformed(path, "empty participant key"));
    }
    if key.as_str().contains('/') {
        return Err(Error::malformed(
            path,
            format!("participant key must not contain '/': {}", key),
        ));
    }
    Ok(())
}

fn expect_sdp(path: &str, desc: &SessionDescription, expected: SdpType) -> Result<()> {
    if desc.sdp_type != expected {
        return Err(Error::malformed(
            path,
            format!("expected {:?} description, got {:?}", expected, desc.sdp_type),
        ));
    }
    Ok(())
}

/// A message ready to publish
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub topic: Topic,
    pub message: SignalMessage,
}

impl Outbound {
    pub fn key_request() -> Self {
        Self {
            topic: Topic::KeyRequest,
            message: SignalMessage::KeyRequest,
        }
    }

    pub fn key_announce(me: &ParticipantKey) -> Self {
        Self {
            topic: Topic::KeyAnnounce,
            message: SignalMessage::KeyAnnounce(me.clone()),
        }
    }

    pub fn leave(me: &ParticipantKey) -> Self {
        Self {
            topic: Topic::Leave,
            message: SignalMessage::Leave(me.clone()),
        }
    }

    pub fn offer(to: &ParticipantKey, from: &ParticipantKey, body: SessionDescription) -> Self {
        Self {
            topic: Topic::Offer(to.clone()),
            message: SignalMessage::Offer(Envelope {
                key: from.clone(),
                body,
            }),
        }
    }

    pub fn answer(to: &ParticipantKey, from: &ParticipantKey, body: SessionDescription) -> Self {
        Self {
            topic: Topic::Answer(to.clone()),
            message: SignalMessage::Answer(Envelope {
                key: from.clone(),
                body,
            }),
        }
    }

    pub fn candidate(to: &ParticipantKey, from: &ParticipantKey, body: IceCandidate) -> Self {
        Self {
            topic: Topic::IceCandidate(to.clone()),
            message: SignalMessage::IceCandidate(Envelope {
                key: from.clone(),
                body,
            }),
        }
    }
}
