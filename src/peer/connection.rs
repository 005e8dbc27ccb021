//! Peer-connection engine seam and its webrtc-rs implementation
//!
//! The engine runs its callbacks on its own tasks. None of them touch room state: each one posts an
//! [`EngineEvent`] tagged with the peer key and the connection id, and the room loop applies it.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalTracks, RemoteStream};
use crate::peer::types::{IceCandidate, ParticipantKey, ServerConfig, SessionDescription};
use crate::utils::{add_ice_url_scheme, random_id};
use crate::{Error, Result};

/// Connectivity as reported by the engine's own checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for EngineState {
    fn from(s: RTCPeerConnectionState) -> Self {
        match s {
            RTCPeerConnectionState::Connecting => EngineState::Connecting,
            RTCPeerConnectionState::Connected => EngineState::Connected,
            RTCPeerConnectionState::Disconnected => EngineState::Disconnected,
            RTCPeerConnectionState::Failed => EngineState::Failed,
            RTCPeerConnectionState::Closed => EngineState::Closed,
            _ => EngineState::New,
        }
    }
}

#[derive(Debug)]
pub enum EngineEventKind {
    /// `None` is the end-of-candidates signal
    LocalCandidate(Option<IceCandidate>),
    RemoteTrack(RemoteStream),
    StateChanged(EngineState),
}

#[derive(Debug)]
pub struct EngineEvent {
    pub peer: ParticipantKey,
    pub connection_id: String,
    pub kind: EngineEventKind,
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// One underlying peer connection
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Distinguishes this handle from earlier ones for the same peer
    fn connection_id(&self) -> &str;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Diagnostics hook called before a connection is given up on
    async fn report(&self, _moment: &str) {}
}

/// Creates connections with local tracks attached and callbacks wired to `events`
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        peer: &ParticipantKey,
        local: Option<&LocalTracks>,
        events: EngineEventSender,
    ) -> Result<Arc<dyn PeerHandle>>;
}

/// webrtc-rs backed connector
pub struct RtcConnector {
    ice_servers: Vec<ServerConfig>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Self {
        Self { ice_servers }
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: get_ice_servers(&self.ice_servers),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

pub fn get_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| {
            RTCIceServer {
                urls: vec![add_ice_url_scheme(config)],
                username: config.username.clone().unwrap_or_default(),
                credential: config.credential.clone().unwrap_or_default(),
            }
        })
        .collect()
}

fn post(
    events: &EngineEventSender,
    peer: &ParticipantKey,
    connection_id: &str,
    kind: EngineEventKind,
) {
    let event = EngineEvent {
        peer: peer.clone(),
        connection_id: connection_id.to_string(),
        kind,
    };
    if events.send(event).is_err() {
        debug!(%peer, "room loop gone, dropping engine event");
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        peer: &ParticipantKey,
        local: Option<&LocalTracks>,
        events: EngineEventSender,
    ) -> Result<Arc<dyn PeerHandle>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(self.rtc_config()).await?);
        let connection_id = random_id();

        if let Some(local) = local {
            for track in local.tracks() {
                pc.add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;
            }
            debug!(%peer, tracks = local.len(), "local tracks attached");
        }

        {
            let events = events.clone();
            let peer = peer.clone();
            let cid = connection_id.clone();
            pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                let kind = match cand {
                    Some(c) => {
                        dump_candidate("LOCAL", &peer, &c);
                        match c.to_json() {
                            Ok(init) => Some(EngineEventKind::LocalCandidate(Some(init.into()))),
                            Err(e) => {
                                warn!(%peer, "unserializable local candidate: {}", e);
                                None
                            }
                        }
                    }
                    None => Some(EngineEventKind::LocalCandidate(None)),
                };
                if let Some(kind) = kind {
                    post(&events, &peer, &cid, kind);
                }
                Box::pin(async {})
            }));
        }

        {
            let peer = peer.clone();
            pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
                debug!(%peer, "ICE gathering state changed to: {:?}", state);
                Box::pin(async {})
            }));
        }

        {
            let events = events.clone();
            let peer = peer.clone();
            let cid = connection_id.clone();
            pc.on_track(Box::new(
                move |track: Arc<TrackRemote>,
                      _receiver: Arc<RTCRtpReceiver>,
                      _transceiver: Arc<RTCRtpTransceiver>| {
                post(
                    &events,
                    &peer,
                    &cid,
                    EngineEventKind::RemoteTrack(RemoteStream::from_track(track)),
                );
                Box::pin(async {})
            },
            ));
        }

        {
            let peer = peer.clone();
            let cid = connection_id.clone();
            pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                debug!(%peer, "Peer connection state changed to: {:?}", st);
                post(&events, &peer, &cid, EngineEventKind::StateChanged(st.into()));
                Box::pin(async {})
            }));
        }

        info!(%peer, %connection_id, "peer connection created");
        Ok(Arc::new(RtcPeer {
            peer: peer.clone(),
            connection_id,
            pc,
        }))
    }
}

pub struct RtcPeer {
    peer: ParticipantKey,
    connection_id: String,
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    use crate::peer::types::SdpType;
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    rtc.map_err(|e| Error::Sdp(format!("invalid description: {}", e)))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(Error::Sdp(format!("unexpected description type {}", other))),
    }
}

#[async_trait]
impl PeerHandle for RtcPeer {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to create offer: {}", e)))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to create answer: {}", e)))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| Error::IceCandidate(format!("{}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| Error::PeerConnection(format!("Failed to close: {}", e)))
    }

    async fn report(&self, moment: &str) {
        dump_selected_pair(&self.pc, &self.peer, moment).await;
    }
}
