//! Room orchestrator
//!
//! One task per joined room owns every piece of mutable room state: the membership set, the
//! session table and the set of peers with a rendering surface. Relay frames, engine callbacks,
//! timers and [`RoomHandle`] commands all arrive on channels and are applied one at a time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::MeshConfig;
use crate::media::{LocalMedia, MediaCapture, Renderer};
use crate::membership::{Discovery, Membership};
use crate::peer::connection::{EngineEvent, EngineEventKind, EngineState, PeerConnector};
use crate::peer::state::{NegotiationEvent, NegotiationState};
use crate::peer::table::PeerSessionTable;
use crate::peer::types::{IceCandidate, ParticipantKey, Role, SessionDescription};
use crate::signaling::{Outbound, Relay, RelayFrame, RoomId, SignalMessage, Topic};
use crate::{Error, Result};

/// Builder for a room session: collaborators plus configuration
pub struct Room {
    config: MeshConfig,
    key: ParticipantKey,
    relay: Arc<dyn Relay>,
    connector: Arc<dyn PeerConnector>,
    renderer: Arc<dyn Renderer>,
    capture: Option<Arc<dyn MediaCapture>>,
}

impl Room {
    pub fn new(
        config: MeshConfig,
        relay: Arc<dyn Relay>,
        connector: Arc<dyn PeerConnector>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            config,
            key: ParticipantKey::generate(),
            relay,
            connector,
            renderer,
            capture: None,
        }
    }

    /// Local media source; without one the room is receive-only
    pub fn with_capture(mut self, capture: Arc<dyn MediaCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Overrides the generated participant key
    pub fn with_key(mut self, key: ParticipantKey) -> Self {
        self.key = key;
        self
    }

    pub fn key(&self) -> &ParticipantKey {
        &self.key
    }

    /// Acquires local media, subscribes to the room's topics, asks everyone present for their keys
    /// and starts the orchestrator task.
    pub async fn join(self, room: RoomId) -> Result<RoomHandle> {
        self.config.validate()?;

        let local_media = Arc::new(LocalMedia::new());
        match &self.capture {
            Some(capture) => local_media.acquire_from(capture.as_ref()).await,
            None => {
                info!("no capture configured, joining receive-only");
                local_media.set(None);
            }
        }

        let inbox = self.relay.connect().await?;
        let membership = Membership::new(self.key.clone(), room.clone());
        for path in membership.subscriptions() {
            self.relay.subscribe(&path).await?;
        }

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let ctx = RoomContext {
            membership,
            table: PeerSessionTable::new(self.connector, local_media, engine_tx),
            relay: self.relay,
            renderer: self.renderer,
            rendered: HashSet::new(),
            timers: timer_tx,
            config: self.config,
            joined_at: Utc::now(),
        };

        ctx.publish(ctx.membership.key_request()).await?;
        spawn_timer(
            ctx.timers.clone(),
            ctx.config.discovery_window(),
            Timer::DiscoveryWindow,
        );
        info!(room = %room, key = %self.key, "joined room");

        let span = info_span!("room", room = %room, key = %self.key);
        let task = tokio::spawn(
            ctx.run(inbox, engine_rx, timer_rx, command_rx)
                .instrument(span),
        );

        Ok(RoomHandle {
            key: self.key,
            room,
            commands: command_tx,
            task,
        })
    }
}

/// Per-session view exposed by [`RoomHandle::snapshot`]
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub key: ParticipantKey,
    pub role: Role,
    pub state: NegotiationState,
    pub pending_candidates: usize,
    pub local_tracks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub key: ParticipantKey,
    pub room: String,
    pub joined_at: DateTime<Utc>,
    pub known_peers: Vec<ParticipantKey>,
    pub sessions: Vec<SessionInfo>,
}

impl RoomSnapshot {
    pub fn session(&self, key: &ParticipantKey) -> Option<&SessionInfo> {
        self.sessions.iter().find(|s| &s.key == key)
    }
}

enum Command {
    Snapshot(oneshot::Sender<RoomSnapshot>),
    Rediscover,
    Leave(oneshot::Sender<()>),
}

/// Handle to a running room. Dropping it leaves the room.
pub struct RoomHandle {
    key: ParticipantKey,
    room: RoomId,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl RoomHandle {
    pub fn key(&self) -> &ParticipantKey {
        &self.key
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .map_err(|_| Error::RoomClosed)?;
        rx.await.map_err(|_| Error::RoomClosed)
    }

    /// Broadcasts the key request again
    pub fn rediscover(&self) -> Result<()> {
        self.commands
            .send(Command::Rediscover)
            .map_err(|_| Error::RoomClosed)
    }

    /// Announces departure, closes every session and waits for the orchestrator to stop
    pub async fn leave(self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Leave(tx))
            .map_err(|_| Error::RoomClosed)?;
        rx.await.map_err(|_| Error::RoomClosed)?;
        self.task.await.map_err(|_| Error::RoomClosed)
    }

    /// True once the orchestrator stopped, either after `leave` or because the relay was lost
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[derive(Debug)]
enum Timer {
    DiscoveryWindow,
    NegotiationDeadline {
        peer: ParticipantKey,
        connection_id: String,
    },
    GraceExpired {
        peer: ParticipantKey,
        connection_id: String,
    },
}

fn spawn_timer(tx: mpsc::UnboundedSender<Timer>, after: Duration, timer: Timer) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = tx.send(timer);
    })
}

/// State owned by the orchestrator task
struct RoomContext {
    membership: Membership,
    table: PeerSessionTable,
    relay: Arc<dyn Relay>,
    renderer: Arc<dyn Renderer>,
    /// Peers that already have a rendering surface
    rendered: HashSet<ParticipantKey>,
    timers: mpsc::UnboundedSender<Timer>,
    config: MeshConfig,
    joined_at: DateTime<Utc>,
}

impl RoomContext {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<RelayFrame>,
        mut engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
        mut timer_rx: mpsc::UnboundedReceiver<Timer>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        loop {
            tokio::select! {
                frame = inbox.recv() => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => {
                        warn!("relay stream closed, stopping room");
                        self.close_all().await;
                        return;
                    }
                },
                Some(event) = engine_rx.recv() => self.on_engine_event(event).await,
                Some(timer) = timer_rx.recv() => self.on_timer(timer).await,
                command = commands.recv() => match command {
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Rediscover) => {
                        info!("re-broadcasting key request");
                        self.report(self.publish(self.membership.key_request()).await);
                    }
                    Some(Command::Leave(done)) => {
                        self.leave().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        debug!("room handle dropped");
                        self.leave().await;
                        return;
                    }
                },
            }
        }
    }

    fn me(&self) -> &ParticipantKey {
        self.membership.me()
    }

    fn report(&self, result: Result<()>) {
        match result {
            Ok(()) => {}
            Err(e @ Error::UnknownPeerReference(_)) => warn!("dropping message: {}", e),
            Err(e @ Error::InvalidTransition { .. }) => debug!("ignored: {}", e),
            Err(e) => warn!("{}", e),
        }
    }

    async fn publish(&self, out: Outbound) -> Result<()> {
        let path = out.topic.path(self.membership.room());
        let payload = out.message.encode()?;
        self.relay.publish(&path, payload).await
    }

    async fn on_frame(&mut self, frame: RelayFrame) {
        let message = Topic::parse(&frame.topic, self.membership.room()).and_then(|topic| {
            match &topic {
                Topic::Offer(target) | Topic::Answer(target) | Topic::IceCandidate(target)
                    if target != self.me() =>
                {
                    Err(Error::malformed(&frame.topic, "addressed to another participant"))
                }
                _ => SignalMessage::decode(&topic, &frame.topic, &frame.payload),
            }
        });

        match message {
            Ok(message) => {
                let result = self.dispatch(message).await;
                self.report(result);
            }
            Err(e) => warn!("dropping relay frame: {}", e),
        }
    }

    async fn dispatch(&mut self, message: SignalMessage) -> Result<()> {
        match message {
            SignalMessage::KeyRequest => self.publish(self.membership.on_key_request()).await,
            SignalMessage::KeyAnnounce(key) => match self.membership.on_key_announce(&key) {
                Discovery::NewPeer => self.initiate(&key).await,
                Discovery::SelfEcho | Discovery::AlreadyKnown => Ok(()),
            },
            SignalMessage::Leave(key) => {
                self.on_leave(&key).await;
                Ok(())
            }
            SignalMessage::Offer(env) => self.on_offer(env.key, env.body).await,
            SignalMessage::Answer(env) => self.on_answer(&env.key, env.body).await,
            SignalMessage::IceCandidate(env) => self.on_remote_candidate(&env.key, env.body).await,
        }
    }

    /// Creates an initiator session for a newly discovered peer and sends it our offer
    async fn initiate(&mut self, peer: &ParticipantKey) -> Result<()> {
        let session = match self.table.get_or_create(peer, Role::Initiator).await {
            Ok(session) => session,
            Err(e) => {
                // no session to retry through, so a later announce must count as new
                self.membership.forget(peer);
                return Err(e);
            }
        };
        if session.role() != Role::Initiator || session.state() != NegotiationState::Created {
            debug!(%peer, state = %session.state(), "negotiation already under way");
            return Ok(());
        }

        let offer = match session.send_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.teardown(peer, NegotiationEvent::Fail).await;
                return Err(e);
            }
        };
        self.arm_deadline(peer)?;
        info!(%peer, "sending offer");
        self.publish(Outbound::offer(peer, self.me(), offer)).await
    }

    async fn on_offer(&mut self, from: ParticipantKey, offer: SessionDescription) -> Result<()> {
        if from == *self.me() {
            return Ok(());
        }
        if self.membership.remember(&from) {
            debug!(peer = %from, "offer from a peer we had not discovered");
        }

        let mut carried = Vec::new();
        if self.table.contains(&from) {
            let existing = self.table.get_mut(&from)?;
            let crossed = existing.role() == Role::Initiator
                && existing.state() == NegotiationState::OfferSent
                && !existing.remote_description_set();
            if !crossed {
                debug!(peer = %from, state = %existing.state(), "offer for an existing session ignored");
                return Ok(());
            }
            // Both sides offered; the lower key keeps its offer.
            if self.membership.me() < &from {
                // the other side answers ours instead
                info!(peer = %from, "offers crossed, keeping ours");
                return Ok(());
            }
            info!(peer = %from, "offers crossed, answering theirs");
            carried = existing.take_pending_candidates();
            self.discard(&from, NegotiationEvent::Close).await;
        }

        let session = match self.table.get_or_create(&from, Role::Responder).await {
            Ok(session) => session,
            Err(e) => {
                self.membership.forget(&from);
                return Err(e);
            }
        };
        for candidate in carried {
            session.add_remote_candidate(candidate).await?;
        }
        let answer = match session.answer_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                self.teardown(&from, NegotiationEvent::Fail).await;
                return Err(e);
            }
        };
        self.arm_deadline(&from)?;
        info!(peer = %from, "sending answer");
        self.publish(Outbound::answer(&from, self.me(), answer)).await
    }

    async fn on_answer(&mut self, from: &ParticipantKey, answer: SessionDescription) -> Result<()> {
        let session = self.table.get_mut(from)?;
        match session.accept_answer(answer).await {
            Ok(()) => {
                debug!(peer = %from, "answer applied");
                Ok(())
            }
            Err(e @ Error::InvalidTransition { .. }) => Err(e),
            Err(e) => {
                self.teardown(from, NegotiationEvent::Fail).await;
                Err(e)
            }
        }
    }

    async fn on_remote_candidate(
        &mut self,
        from: &ParticipantKey,
        candidate: IceCandidate,
    ) -> Result<()> {
        let session = self.table.get_mut(from)?;
        session.add_remote_candidate(candidate).await?;
        Ok(())
    }

    async fn on_leave(&mut self, peer: &ParticipantKey) {
        if peer == self.me() {
            return;
        }
        if self.membership.is_known(peer) || self.table.contains(peer) {
            info!(%peer, "peer left the room");
            self.teardown(peer, NegotiationEvent::Close).await;
        }
    }

    fn is_current(&self, peer: &ParticipantKey, connection_id: &str) -> bool {
        self.table
            .get(peer)
            .is_ok_and(|s| s.connection_id() == connection_id)
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        let EngineEvent {
            peer,
            connection_id,
            kind,
        } = event;
        if !self.is_current(&peer, &connection_id) {
            debug!(%peer, %connection_id, "stale engine event");
            return;
        }

        match kind {
            EngineEventKind::LocalCandidate(None) => {
                debug!(%peer, "ICE gathering complete");
            }
            EngineEventKind::LocalCandidate(Some(candidate)) => {
                let result = self
                    .publish(Outbound::candidate(&peer, self.me(), candidate))
                    .await;
                self.report(result);
            }
            EngineEventKind::RemoteTrack(stream) => {
                if self.rendered.insert(peer.clone()) {
                    self.renderer.attach_remote_stream(&peer, stream);
                } else {
                    debug!(%peer, track = %stream.track_id, "surface already attached");
                }
            }
            EngineEventKind::StateChanged(state) => {
                let result = self.on_engine_state(&peer, state).await;
                self.report(result);
            }
        }
    }

    async fn on_engine_state(&mut self, peer: &ParticipantKey, state: EngineState) -> Result<()> {
        let timers = self.timers.clone();
        let grace = self.config.grace_period();
        let session = self.table.get_mut(peer)?;
        session.set_engine_state(state);

        match state {
            EngineState::Connected => {
                session.clear_grace();
                session.clear_deadline();
                if session.state() != NegotiationState::Connected {
                    session.advance(NegotiationEvent::EngineConnected)?;
                }
            }
            EngineState::Disconnected | EngineState::Failed => {
                if !session.grace_pending() {
                    warn!(%peer, ?state, ?grace, "connection lost, waiting for recovery");
                    session.report("BEFORE-FAIL").await;
                    let timer = Timer::GraceExpired {
                        peer: peer.clone(),
                        connection_id: session.connection_id().to_string(),
                    };
                    session.set_grace(spawn_timer(timers, grace, timer));
                }
            }
            EngineState::Closed => {
                self.teardown(peer, NegotiationEvent::Close).await;
            }
            EngineState::New | EngineState::Connecting => {}
        }
        Ok(())
    }

    async fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::DiscoveryWindow => {
                info!(
                    known = self.membership.known_peers().len(),
                    "discovery window closed"
                );
            }
            Timer::NegotiationDeadline {
                peer,
                connection_id,
            } => {
                if !self.is_current(&peer, &connection_id) {
                    return;
                }
                let stalled = self
                    .table
                    .get(&peer)
                    .is_ok_and(|s| s.state().is_negotiating());
                if stalled {
                    let e = Error::NegotiationStall(format!(
                        "{} not connected after {:?}",
                        peer,
                        self.config.negotiation_timeout()
                    ));
                    warn!(%peer, "{}", e);
                    self.teardown(&peer, NegotiationEvent::Fail).await;
                }
            }
            Timer::GraceExpired {
                peer,
                connection_id,
            } => {
                if !self.is_current(&peer, &connection_id) {
                    return;
                }
                let Ok(session) = self.table.get_mut(&peer) else {
                    return;
                };
                session.clear_grace();
                if session.engine_state() == EngineState::Connected {
                    return;
                }
                let e = Error::NegotiationStall(format!(
                    "{} did not recover within {:?}",
                    peer,
                    self.config.grace_period()
                ));
                warn!(%peer, "{}", e);
                session.report("FAILED").await;
                self.teardown(&peer, NegotiationEvent::Fail).await;
            }
        }
    }

    fn arm_deadline(&mut self, peer: &ParticipantKey) -> Result<()> {
        let timers = self.timers.clone();
        let after = self.config.negotiation_timeout();
        let session = self.table.get_mut(peer)?;
        let timer = Timer::NegotiationDeadline {
            peer: peer.clone(),
            connection_id: session.connection_id().to_string(),
        };
        session.set_deadline(spawn_timer(timers, after, timer));
        Ok(())
    }

    /// Closes and removes the session for `peer` and drops its surface; the key stays known
    async fn discard(&mut self, peer: &ParticipantKey, terminal: NegotiationEvent) {
        if let Some(mut session) = self.table.remove(peer) {
            session.close(terminal).await;
            info!(%peer, state = %session.state(), "session closed");
        }
        if self.rendered.remove(peer) {
            self.renderer.detach_remote_stream(peer);
        }
    }

    /// Discards the session and forgets the key, so a later announce starts over
    async fn teardown(&mut self, peer: &ParticipantKey, terminal: NegotiationEvent) {
        self.discard(peer, terminal).await;
        self.membership.forget(peer);
    }

    async fn close_all(&mut self) {
        for peer in self.table.keys() {
            self.discard(&peer, NegotiationEvent::Close).await;
        }
    }

    async fn leave(&mut self) {
        if let Err(e) = self.publish(self.membership.leave_notice()).await {
            warn!("could not announce departure: {}", e);
        }
        self.close_all().await;
        info!("left room");
    }

    fn snapshot(&self) -> RoomSnapshot {
        let mut sessions: Vec<SessionInfo> = self
            .table
            .iter()
            .map(|s| SessionInfo {
                key: s.key().clone(),
                role: s.role(),
                state: s.state(),
                pending_candidates: s.pending_candidates(),
                local_tracks: s.local_tracks(),
            })
            .collect();
        sessions.sort_by(|a, b| a.key.cmp(&b.key));

        RoomSnapshot {
            key: self.me().clone(),
            room: self.membership.room().to_string(),
            joined_at: self.joined_at,
            known_peers: self.membership.known_peers(),
            sessions,
        }
    }
}
