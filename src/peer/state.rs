//! Per-peer negotiation state machine
//!
//! ```text
//! Created --offer sent-->  OfferSent  --engine connected--> Connected
//! Created --answer sent--> AnswerSent --engine connected--> Connected
//! any non-terminal --fail--> Failed
//! any --close--> Closed
//! ```

use serde::Serialize;
use std::fmt;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NegotiationState {
    Created,
    OfferSent,
    AnswerSent,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationEvent {
    OfferSent,
    AnswerSent,
    EngineConnected,
    Fail,
    Close,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }

    /// Offer/answer exchanged but connectivity not yet confirmed
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            NegotiationState::Created | NegotiationState::OfferSent | NegotiationState::AnswerSent
        )
    }

    pub fn on(self, event: NegotiationEvent) -> Result<Self> {
        use NegotiationEvent as E;
        use NegotiationState as S;

        let next = match (self, event) {
            (S::Created, E::OfferSent) => S::OfferSent,
            (S::Created, E::AnswerSent) => S::AnswerSent,
            (S::OfferSent | S::AnswerSent | S::Connected, E::EngineConnected) => S::Connected,
            (s, E::Fail) if !s.is_terminal() => S::Failed,
            (S::Failed, E::Fail) => S::Failed,
            (_, E::Close) => S::Closed,
            (from, event) => {
                return Err(Error::InvalidTransition {
                    from: from.to_string(),
                    event: format!("{:?}", event),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::NegotiationEvent as E;
    use super::NegotiationState as S;
    use super::*;

    #[test]
    fn test_initiator_path() {
        let s = S::Created.on(E::OfferSent).unwrap();
        assert_eq!(s, S::OfferSent);
        assert_eq!(s.on(E::EngineConnected).unwrap(), S::Connected);
    }

    #[test]
    fn test_responder_path() {
        let s = S::Created.on(E::AnswerSent).unwrap();
        assert_eq!(s.on(E::EngineConnected).unwrap(), S::Connected);
    }

    #[test]
    fn test_cannot_answer_after_offering() {
        assert!(S::OfferSent.on(E::AnswerSent).is_err());
        assert!(S::AnswerSent.on(E::OfferSent).is_err());
        assert!(S::Created.on(E::EngineConnected).is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert_eq!(S::Connected.on(E::Fail).unwrap(), S::Failed);
        assert_eq!(S::OfferSent.on(E::Close).unwrap(), S::Closed);
        assert!(S::Closed.on(E::Fail).is_err());
        assert!(S::Failed.on(E::EngineConnected).is_err());
        assert!(S::Failed.is_terminal());
        assert!(!S::Connected.is_negotiating());
    }
}
