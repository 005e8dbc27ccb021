#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use roomcall::config::MeshConfig;
use roomcall::media::{LocalTracks, MediaCapture, MediaKind, RemoteStream, Renderer};
use roomcall::peer::{
    EngineEvent, EngineEventKind, EngineEventSender, EngineState, IceCandidate, ParticipantKey,
    PeerConnector, PeerHandle, SessionDescription,
};
use roomcall::signaling::{MemoryBroker, MemoryRelay, Relay, RelayFrame, RoomId};
use roomcall::utils::random_id;
use roomcall::{Error, Result, RoomHandle, RoomSnapshot};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn room_id() -> RoomId {
    RoomId::new("r1").unwrap()
}

pub fn fast_config() -> MeshConfig {
    let mut config = MeshConfig {
        ice_servers: Vec::new(),
        discovery_window_ms: 50,
        negotiation_timeout_ms: 3_000,
        grace_period_ms: 150,
        ..Default::default()
    };
    config.reconnect.backoff_initial_ms = 10;
    config.reconnect.backoff_max_ms = 50;
    config.reconnect.jitter_enabled = false;
    config
}

/// Polls the room until `pred` holds
pub async fn wait_for<F>(handle: &RoomHandle, mut pred: F) -> RoomSnapshot
where
    F: FnMut(&RoomSnapshot) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        let snapshot = handle.snapshot().await.expect("room is running");
        if pred(&snapshot) {
            return snapshot;
        }
        if Instant::now() > deadline {
            panic!("condition not reached, last snapshot: {:#?}", snapshot);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT;
    while !check().await {
        if Instant::now() > deadline {
            panic!("condition not reached in {:?}", WAIT);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Scripted engine
// ---------------------------------------------------------------------------

/// Engine stand-in. Every connection gathers two local candidates when its local description is
/// set, reports one remote track per `tracks=N` in the remote description, and goes `Connected`
/// once both descriptions are set and a remote candidate was applied.
pub struct FakeConnector {
    auto_connect: bool,
    /// Connect attempts still to be refused
    refusals: AtomicUsize,
    calls: AtomicUsize,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            auto_connect: true,
            refusals: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            peers: Mutex::new(Vec::new()),
        })
    }

    /// The first `n` connect attempts fail
    pub fn refusing(n: usize) -> Arc<Self> {
        let connector = Self::new();
        connector.refusals.store(n, Ordering::SeqCst);
        connector
    }

    pub fn connect_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Connections never report connectivity
    pub fn stalling() -> Arc<Self> {
        Arc::new(Self {
            auto_connect: false,
            refusals: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            peers: Mutex::new(Vec::new()),
        })
    }

    pub fn peers_for(&self, key: &ParticipantKey) -> Vec<Arc<FakePeer>> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .filter(|p| &p.peer == key)
            .cloned()
            .collect()
    }

    pub fn latest(&self, key: &ParticipantKey) -> Arc<FakePeer> {
        self.peers_for(key).pop().expect("no connection for peer")
    }

    /// Reports a connectivity change on the newest connection to `key`
    pub fn emit_state(&self, key: &ParticipantKey, state: EngineState) {
        self.latest(key).emit(EngineEventKind::StateChanged(state));
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        peer: &ParticipantKey,
        local: Option<&LocalTracks>,
        events: EngineEventSender,
    ) -> Result<Arc<dyn PeerHandle>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::PeerConnection("engine unavailable".into()));
        }
        let fake = Arc::new(FakePeer {
            peer: peer.clone(),
            id: random_id(),
            tracks: local.map(|t| t.len()).unwrap_or(0),
            auto_connect: self.auto_connect,
            events,
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
        });
        self.peers.lock().unwrap().push(fake.clone());
        Ok(fake as Arc<dyn PeerHandle>)
    }
}

pub struct FakePeer {
    pub peer: ParticipantKey,
    id: String,
    pub tracks: usize,
    auto_connect: bool,
    events: EngineEventSender,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
    applied: Mutex<Vec<String>>,
}

impl FakePeer {
    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, kind: EngineEventKind) {
        let _ = self.events.send(EngineEvent {
            peer: self.peer.clone(),
            connection_id: self.id.clone(),
            kind,
        });
    }

    fn sdp(&self) -> String {
        format!("v=0 fake={} tracks={}", self.id, self.tracks)
    }

    fn maybe_connect(&self) {
        if !self.auto_connect
            || !self.local_set.load(Ordering::SeqCst)
            || !self.remote_set.load(Ordering::SeqCst)
            || self.applied.lock().unwrap().is_empty()
        {
            return;
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.emit(EngineEventKind::StateChanged(EngineState::Connected));
        }
    }
}

fn tracks_in(sdp: &str) -> usize {
    sdp.split_whitespace()
        .find_map(|field| field.strip_prefix("tracks="))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl PeerHandle for FakePeer {
    fn connection_id(&self) -> &str {
        &self.id
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(self.sdp()))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(Error::Sdp("answer without remote offer".into()));
        }
        Ok(SessionDescription::answer(self.sdp()))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
        self.local_set.store(true, Ordering::SeqCst);
        for n in 0..2 {
            self.emit(EngineEventKind::LocalCandidate(Some(IceCandidate {
                candidate: format!("candidate:{} {} udp 1 10.0.0.1 {} typ host", self.id, n, 9000 + n),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            })));
        }
        self.emit(EngineEventKind::LocalCandidate(None));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.remote_set.store(true, Ordering::SeqCst);
        for n in 0..tracks_in(&desc.sdp) {
            self.emit(EngineEventKind::RemoteTrack(RemoteStream {
                stream_id: format!("stream-{}", self.peer),
                track_id: format!("track-{}", n),
                kind: if n == 0 { MediaKind::Audio } else { MediaKind::Video },
                track: None,
            }));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(Error::IceCandidate("remote description not set".into()));
        }
        self.applied.lock().unwrap().push(candidate.candidate);
        self.maybe_connect();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.emit(EngineEventKind::StateChanged(EngineState::Closed));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Media collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingRenderer {
    attached: Mutex<Vec<(ParticipantKey, String)>>,
    detached: Mutex<Vec<ParticipantKey>>,
}

impl RecordingRenderer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attached(&self) -> Vec<(ParticipantKey, String)> {
        self.attached.lock().unwrap().clone()
    }

    pub fn attached_for(&self, key: &ParticipantKey) -> usize {
        self.attached().iter().filter(|(k, _)| k == key).count()
    }

    pub fn detached(&self) -> Vec<ParticipantKey> {
        self.detached.lock().unwrap().clone()
    }
}

impl Renderer for RecordingRenderer {
    fn attach_remote_stream(&self, peer: &ParticipantKey, stream: RemoteStream) {
        self.attached
            .lock()
            .unwrap()
            .push((peer.clone(), stream.track_id));
    }

    fn detach_remote_stream(&self, peer: &ParticipantKey) {
        self.detached.lock().unwrap().push(peer.clone());
    }
}

pub struct DeniedCapture;

#[async_trait]
impl MediaCapture for DeniedCapture {
    async fn acquire_local_tracks(&self) -> Result<LocalTracks> {
        Err(Error::MediaAcquisition("permission denied".into()))
    }
}

// ---------------------------------------------------------------------------
// Hand-driven participant on the relay
// ---------------------------------------------------------------------------

/// A participant scripted directly on the relay, for driving one room through edge cases
pub struct RawPeer {
    pub key: ParticipantKey,
    relay: MemoryRelay,
    inbox: mpsc::UnboundedReceiver<RelayFrame>,
}

impl RawPeer {
    pub async fn join(broker: &MemoryBroker, key: &str) -> Self {
        let relay = broker.endpoint();
        let inbox = relay.connect().await.unwrap();
        for topic in ["offer", "answer", "iceCandidate"] {
            relay
                .subscribe(&format!("peer/{}/{}/r1", topic, key))
                .await
                .unwrap();
        }
        Self {
            key: ParticipantKey::from(key),
            relay,
            inbox,
        }
    }

    pub async fn send(&self, topic: &str, payload: serde_json::Value) {
        self.relay
            .publish(topic, payload.to_string())
            .await
            .unwrap();
    }

    pub async fn announce(&self) {
        self.send("send/key/r1", serde_json::json!(self.key.as_str()))
            .await;
    }

    pub async fn offer_to(&self, target: &ParticipantKey) {
        self.send(
            &format!("peer/offer/{}/r1", target),
            serde_json::json!({ "key": self.key.as_str(), "body": { "type": "offer", "sdp": "v=0 raw tracks=1" } }),
        )
        .await;
    }

    pub async fn answer_to(&self, target: &ParticipantKey) {
        self.send(
            &format!("peer/answer/{}/r1", target),
            serde_json::json!({ "key": self.key.as_str(), "body": { "type": "answer", "sdp": "v=0 raw tracks=1" } }),
        )
        .await;
    }

    pub async fn candidate_to(&self, target: &ParticipantKey, candidate: &str) {
        self.send(
            &format!("peer/iceCandidate/{}/r1", target),
            serde_json::json!({
                "key": self.key.as_str(),
                "body": { "candidate": candidate, "sdpMid": "0", "sdpMLineIndex": 0 }
            }),
        )
        .await;
    }

    /// Next frame addressed to this participant
    pub async fn recv(&mut self) -> RelayFrame {
        tokio::time::timeout(WAIT, self.inbox.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("relay closed")
    }

    /// Next frame on `topic`, skipping anything else
    pub async fn recv_on(&mut self, topic: &str) -> RelayFrame {
        loop {
            let frame = self.recv().await;
            if frame.topic == topic {
                return frame;
            }
        }
    }
}
