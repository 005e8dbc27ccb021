use crate::peer::types::{IceServerKind, ServerConfig};
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Adds the `stun:`/`turn:` scheme to a server url that lacks one
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if ["turn:", "turns:", "stun:", "stuns:"]
        .iter()
        .any(|scheme| config.url.starts_with(scheme))
    {
        config.url.clone()
    } else {
        let scheme = match config.kind {
            IceServerKind::Turn => "turn:",
            IceServerKind::Stun => "stun:",
        };
        format!("{}{}", scheme, config.url)
    }
}
