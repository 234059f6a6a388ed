//! Signaling coordinator.
//!
//! Turns relay events into peer-session operations and keeps the participant
//! roster as a projection of peer state. Roster messages and pings are
//! handled inline as they arrive. Negotiation for each peer runs on its own
//! worker, in delivery order, so a slow peer never holds up the others.
//! Shared state sits behind short synchronous locks that are never held
//! across an await, so every handler re-fetches the current session after it
//! resumes.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::audio::AudioActivityDetector;
use crate::config::CoordinatorConfig;
use crate::connection::PeerPhase;
use crate::error::Result;
use crate::media::{LocalMediaProvider, LocalMediaState, LocalStream, RemoteStream};
use crate::metrics::{PeerQuality, QualityMonitor};
use crate::peers::{PeerConnectionManager, SessionInfo};
use crate::room::{self, MediaFlags, Participant, RoomContext};
use crate::signaling::{ClientMessage, ParticipantInfo, ServerMessage, SignalingSink};
use crate::transport::{
    CandidateHandler, IceCandidate, MediaTransport, SessionDescription, TrackEndedHandler,
    TrackHandler, TransportFactory, TransportHandlers,
};

#[derive(Debug, Clone, Copy)]
struct PeerEntry {
    phase: PeerPhase,
    /// Set once a failed session has been rebuilt and kept for the life of the
    /// peer id; a further failure drops the peer.
    recreated: bool,
}

#[derive(Clone)]
pub struct SignalingCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: CoordinatorConfig,
    local_id: Mutex<Option<String>>,
    peers: PeerConnectionManager,
    audio: AudioActivityDetector,
    signaling: Arc<dyn SignalingSink>,
    media: Arc<dyn LocalMediaProvider>,
    room: RoomContext,
    roster: watch::Sender<Vec<Participant>>,
    phases: Mutex<HashMap<String, PeerEntry>>,
    quality: tokio::sync::Mutex<QualityMonitor>,
    quality_updates: watch::Receiver<Vec<PeerQuality>>,
    outgoing_video: Mutex<Option<String>>,
    quality_task: Mutex<Option<JoinHandle<()>>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingCoordinator {
    /// Builds the coordinator and starts watching local media and room
    /// membership. Must be called inside a Tokio runtime.
    pub fn new(
        config: CoordinatorConfig,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingSink>,
        media: Arc<dyn LocalMediaProvider>,
        room: RoomContext,
    ) -> Self {
        let quality = QualityMonitor::new();
        let quality_updates = quality.subscribe();
        let (roster, _) = watch::channel(Vec::new());
        let initial_video = media
            .subscribe()
            .borrow()
            .outgoing_video()
            .map(|t| t.id().to_owned());

        let inner = Arc::new(Inner {
            audio: AudioActivityDetector::new(config.audio_sample_interval),
            config,
            local_id: Mutex::new(None),
            peers: PeerConnectionManager::new(factory),
            signaling,
            media,
            room,
            roster,
            phases: Mutex::new(HashMap::new()),
            quality: tokio::sync::Mutex::new(quality),
            quality_updates,
            outgoing_video: Mutex::new(initial_video),
            quality_task: Mutex::new(None),
            watchers: Mutex::new(Vec::new()),
        });

        let watchers = vec![inner.spawn_media_watcher(), inner.spawn_room_watcher()];
        *inner.watchers.lock() = watchers;
        if inner.room.current_room().is_some() {
            inner.start_quality_loop();
        }

        Self { inner }
    }

    /// Records the id the relay assigned to this client, used to keep it out of the roster.
    pub fn set_local_id(&self, id: impl Into<String>) {
        *self.inner.local_id.lock() = Some(id.into());
    }

    pub fn username(&self) -> &str {
        &self.inner.config.username
    }

    /// Enters `room_id`, announces this client and publishes its media flags.
    pub async fn join_room(&self, room_id: &str) -> Result<()> {
        self.inner.room.enter(room_id);
        self.inner.start_quality_loop();
        self.inner
            .signaling
            .send(ClientMessage::JoinRoom {
                room_id: room_id.to_owned(),
                username: self.inner.config.username.clone(),
            })
            .await?;

        let state = self.inner.media.subscribe().borrow().clone();
        self.inner.broadcast_media_state(&state).await;
        Ok(())
    }

    /// Sends `leave-room` and tears down every peer. A send failure does not
    /// stop the teardown.
    pub async fn leave_room(&self) {
        self.inner.leave_room().await;
    }

    /// Process exit hook: leaves the room and stops all background work.
    pub async fn shutdown(&self) {
        self.inner.leave_room().await;
        for watcher in self.inner.watchers.lock().drain(..) {
            watcher.abort();
        }
    }

    /// Handles relay messages until the channel closes.
    ///
    /// Pings and roster messages are answered immediately. Everything that
    /// concerns a single peer's session is queued on that peer's worker, so
    /// one peer waiting for local media never delays the keepalive or another
    /// peer's negotiation.
    pub async fn run(&self, mut inbound: mpsc::Receiver<ServerMessage>) {
        let mut workers: HashMap<String, mpsc::UnboundedSender<ServerMessage>> = HashMap::new();
        while let Some(msg) = inbound.recv().await {
            let peer_id = match &msg {
                ServerMessage::Ping
                | ServerMessage::SetParticipants { .. }
                | ServerMessage::UserJoined { .. }
                | ServerMessage::StreamStateChanged { .. } => None,
                other => other.peer_id().map(str::to_owned),
            };
            let Some(peer_id) = peer_id else {
                self.handle_message(msg).await;
                continue;
            };

            let leaving = matches!(msg, ServerMessage::UserLeft { .. });
            let worker = workers
                .entry(peer_id.clone())
                .or_insert_with(|| self.spawn_peer_worker(&peer_id));
            if let Err(mpsc::error::SendError(msg)) = worker.send(msg) {
                warn!(peer_id = %peer_id, "Peer worker stopped, restarting it");
                let worker = self.spawn_peer_worker(&peer_id);
                let _ = worker.send(msg);
                workers.insert(peer_id.clone(), worker);
            }
            // The worker drains what it already has, then exits
            if leaving {
                workers.remove(&peer_id);
            }
        }
        debug!("Signaling channel closed");
    }

    fn spawn_peer_worker(&self, peer_id: &str) -> mpsc::UnboundedSender<ServerMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let coordinator = self.clone();
        let peer_id = peer_id.to_owned();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                coordinator.handle_message(msg).await;
            }
            debug!(peer_id = %peer_id, "Peer worker finished");
        });
        tx
    }

    /// Handles one relay message. Per-peer failures are logged and never returned.
    pub async fn handle_message(&self, msg: ServerMessage) {
        self.inner.handle(msg).await;
    }

    /// Runs one adaptive bitrate pass immediately.
    pub async fn optimize_quality(&self) -> Vec<PeerQuality> {
        self.inner.optimize_quality().await
    }

    pub fn subscribe_roster(&self) -> watch::Receiver<Vec<Participant>> {
        self.inner.roster.subscribe()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner.roster.borrow().clone()
    }

    pub fn participant(&self, peer_id: &str) -> Option<Participant> {
        self.inner
            .roster
            .borrow()
            .iter()
            .find(|p| p.socket_id == peer_id)
            .cloned()
    }

    pub fn subscribe_quality(&self) -> watch::Receiver<Vec<PeerQuality>> {
        self.inner.quality_updates.clone()
    }

    pub fn phase(&self, peer_id: &str) -> Option<PeerPhase> {
        self.inner.phases.lock().get(peer_id).map(|e| e.phase)
    }

    pub fn session(&self, peer_id: &str) -> Option<SessionInfo> {
        self.inner.peers.session_info(peer_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids = self.inner.peers.peer_ids();
        ids.sort();
        ids
    }

    pub fn is_detecting_speech(&self, peer_id: &str) -> bool {
        self.inner.audio.is_running(peer_id)
    }
}

impl Inner {
    async fn handle(self: &Arc<Self>, msg: ServerMessage) {
        match msg {
            ServerMessage::UserJoined { socket_id, username } => {
                self.on_user_joined(&socket_id, &username)
            }
            ServerMessage::SetParticipants { participants } => {
                self.on_set_participants(participants).await
            }
            ServerMessage::StreamStateChanged {
                socket_id,
                is_camera_enabled,
                is_mic_enabled,
                is_screen_sharing,
            } => self.on_remote_media_state(
                &socket_id,
                is_camera_enabled,
                is_mic_enabled,
                is_screen_sharing,
            ),
            ServerMessage::UserLeft { socket_id } => self.remove_peer(&socket_id).await,
            ServerMessage::RequestOffer { socket_id } => {
                if let Err(e) = self.send_offer(&socket_id).await {
                    warn!(peer_id = %socket_id, error = %e, "Error creating offer");
                }
            }
            ServerMessage::Offer { offer, from } => {
                if let Err(e) = self.answer_offer(&from, offer).await {
                    warn!(peer_id = %from, error = %e, "Error handling offer");
                }
            }
            ServerMessage::Answer { answer, from } => {
                match self.peers.apply_answer(&from, answer).await {
                    Ok(()) => {}
                    Err(e) if e.is_benign_race() => {
                        debug!(peer_id = %from, "Answer for unknown peer ignored")
                    }
                    Err(e) => warn!(peer_id = %from, error = %e, "Error handling answer"),
                }
            }
            ServerMessage::IceCandidate { candidate, from } => {
                if let Err(e) = self.peers.apply_remote_candidate(&from, candidate).await {
                    debug!(peer_id = %from, error = %e, "Ignoring ICE candidate");
                }
            }
            ServerMessage::Ping => {
                if let Err(e) = self.signaling.send(ClientMessage::Pong).await {
                    warn!(error = %e, "Failed to answer ping");
                }
            }
        }
    }

    /// Matches by socket id once the relay id is known, by username before that.
    fn is_local(&self, socket_id: &str, username: &str) -> bool {
        match self.local_id.lock().as_deref() {
            Some(id) => socket_id == id,
            None => username == self.config.username,
        }
    }

    fn on_user_joined(&self, socket_id: &str, username: &str) {
        if self.is_local(socket_id, username) {
            debug!(peer_id = socket_id, "Ignoring own join");
            return;
        }
        info!(peer_id = socket_id, username, "User joined");
        self.roster.send_modify(|roster| {
            room::upsert_joined(roster, socket_id, username, MediaFlags::default())
        });
    }

    async fn on_set_participants(&self, participants: Vec<ParticipantInfo>) {
        let mut roster = Vec::with_capacity(participants.len());
        for info in participants
            .iter()
            .filter(|p| !self.is_local(&p.socket_id, &p.username))
        {
            room::upsert_joined(&mut roster, &info.socket_id, &info.username, info.flags());
        }
        debug!(count = roster.len(), "Roster synchronized");

        // Streams never survive a sync, so neither do their analysers
        self.audio.stop_all();
        let stale: Vec<String> = self
            .peers
            .peer_ids()
            .into_iter()
            .filter(|id| !roster.iter().any(|p| &p.socket_id == id))
            .collect();
        self.roster.send_replace(roster);

        for peer_id in stale {
            debug!(peer_id = %peer_id, "Closing session for peer missing from roster");
            self.phases.lock().remove(&peer_id);
            self.peers.close(&peer_id).await;
        }
    }

    fn on_remote_media_state(
        &self,
        socket_id: &str,
        camera: Option<bool>,
        mic: Option<bool>,
        screen: Option<bool>,
    ) {
        self.roster.send_if_modified(|roster| {
            let Some(participant) = room::find_mut(roster, socket_id) else {
                debug!(peer_id = socket_id, "Media state for unknown participant");
                return false;
            };
            let mut flags = participant.flags();
            if let Some(camera) = camera {
                flags.is_camera_enabled = camera;
            }
            if let Some(mic) = mic {
                flags.is_mic_enabled = mic;
            }
            if let Some(screen) = screen {
                flags.is_screen_sharing = screen;
            }
            participant.apply_flags(flags);
            true
        });
    }

    async fn send_offer(self: &Arc<Self>, peer_id: &str) -> Result<()> {
        let local = self.media.ensure_stream().await?;
        let transport = match self.peers.connection(peer_id) {
            Some(transport) => transport,
            None => self.build_session(peer_id, Some(&local)).await?,
        };

        let offer = self.peers.create_offer(transport.as_ref()).await?;
        self.send_if_current(peer_id, &transport, |target| ClientMessage::Offer {
            target,
            offer,
        })
        .await
    }

    async fn answer_offer(self: &Arc<Self>, peer_id: &str, offer: SessionDescription) -> Result<()> {
        let local = self.media.ensure_stream().await?;
        // A failed session cannot take a new offer; rebuild it instead
        let existing = self
            .peers
            .connection(peer_id)
            .filter(|t| !t.connection_state().borrow().is_failure());
        let transport = match existing {
            Some(transport) => transport,
            None => self.build_session(peer_id, Some(&local)).await?,
        };

        let answer = self.peers.accept_offer(peer_id, offer).await?;
        self.send_if_current(peer_id, &transport, |target| ClientMessage::Answer {
            target,
            answer,
        })
        .await
    }

    /// Sends a negotiation message unless the session was replaced while it was being produced.
    async fn send_if_current(
        &self,
        peer_id: &str,
        transport: &Arc<dyn MediaTransport>,
        message: impl FnOnce(String) -> ClientMessage,
    ) -> Result<()> {
        if !self.peers.is_current(peer_id, transport) {
            debug!(peer_id, "Session replaced during negotiation, dropping message");
            return Ok(());
        }
        self.signaling.send(message(peer_id.to_owned())).await
    }

    async fn build_session(
        self: &Arc<Self>,
        peer_id: &str,
        local: Option<&LocalStream>,
    ) -> Result<Arc<dyn MediaTransport>> {
        let username = self
            .roster
            .borrow()
            .iter()
            .find(|p| p.socket_id == peer_id)
            .map(|p| p.username.clone())
            .or_else(|| self.peers.username(peer_id))
            .unwrap_or_default();

        let on_track: TrackHandler = {
            let weak = Arc::downgrade(self);
            let peer_id = peer_id.to_owned();
            Arc::new(move |stream: RemoteStream| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_remote_track(&peer_id, stream);
                }
            })
        };
        let on_ice_candidate: CandidateHandler = {
            let signaling = Arc::clone(&self.signaling);
            let peer_id = peer_id.to_owned();
            Arc::new(move |candidate: IceCandidate| {
                let signaling = Arc::clone(&signaling);
                let target = peer_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = signaling
                        .send(ClientMessage::IceCandidate { target, candidate })
                        .await
                    {
                        warn!(error = %e, "Failed to send ICE candidate");
                    }
                });
            })
        };

        let on_track_ended: TrackEndedHandler = {
            let weak = Arc::downgrade(self);
            let peer_id = peer_id.to_owned();
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_remote_track_ended(&peer_id);
                }
            })
        };
        let handlers = TransportHandlers {
            on_track,
            on_track_ended,
            on_ice_candidate,
        };

        let transport = self
            .peers
            .create_connection(peer_id, &username, local, handlers)
            .await?;
        self.set_phase(peer_id, PeerPhase::Connecting);

        // Screen sharing replaces the camera track the session was built with
        let outgoing = self.media.subscribe().borrow().outgoing_video();
        let built_with = local.and_then(LocalStream::video_track).map(|t| t.id());
        if let Some(track) = outgoing.filter(|t| Some(t.id()) != built_with) {
            if let Err(e) = transport.replace_video_track(Some(track)).await {
                warn!(peer_id, error = %e, "Failed to attach outgoing video");
            }
        }

        let weak = Arc::downgrade(self);
        self.peers.monitor(
            peer_id,
            Arc::new(move |peer_id| {
                if let Some(inner) = weak.upgrade() {
                    tokio::spawn(failure_task(inner, peer_id));
                }
            }),
        );
        Ok(transport)
    }

    fn on_remote_track(self: &Arc<Self>, peer_id: &str, stream: RemoteStream) {
        let attached = self.roster.send_if_modified(|roster| {
            match room::find_mut(roster, peer_id) {
                Some(participant) => {
                    participant.attach_stream(stream.clone());
                    true
                }
                None => false,
            }
        });

        if attached {
            info!(peer_id, stream_id = stream.id(), "Remote stream attached");
            let weak: Weak<Inner> = Arc::downgrade(self);
            let id = peer_id.to_owned();
            self.audio.start(
                &stream,
                peer_id,
                Arc::new(move |speaking| {
                    if let Some(inner) = weak.upgrade() {
                        inner.set_speaking(&id, speaking);
                    }
                }),
            );
        } else {
            debug!(peer_id, "Track arrived for peer missing from roster");
        }

        self.peers.mark_connected(peer_id);
        if let Some(entry) = self.phases.lock().get_mut(peer_id) {
            if entry.phase != PeerPhase::Closed {
                entry.phase = PeerPhase::Connected;
            }
        }
    }

    /// A remote track stopped delivering media; `active` follows the stream's liveness.
    fn on_remote_track_ended(&self, peer_id: &str) {
        let changed = self.roster.send_if_modified(|roster| {
            let Some(participant) = room::find_mut(roster, peer_id) else {
                return false;
            };
            let was_active = participant.active;
            participant.refresh_active();
            participant.active != was_active
        });
        if changed {
            debug!(peer_id, "Remote track ended");
        }
    }

    fn set_speaking(&self, peer_id: &str, speaking: bool) {
        self.roster.send_if_modified(|roster| match room::find_mut(roster, peer_id) {
            Some(participant) if participant.is_speaking != speaking => {
                participant.is_speaking = speaking;
                true
            }
            _ => false,
        });
    }

    fn set_phase(&self, peer_id: &str, phase: PeerPhase) {
        self.phases
            .lock()
            .entry(peer_id.to_owned())
            .or_insert(PeerEntry {
                phase,
                recreated: false,
            })
            .phase = phase;
    }

    async fn on_connection_failure(self: Arc<Self>, peer_id: String) {
        let retry = {
            let mut phases = self.phases.lock();
            let Some(entry) = phases.get_mut(&peer_id) else {
                return;
            };
            if matches!(entry.phase, PeerPhase::Closed | PeerPhase::Recreating) {
                return;
            }
            entry.phase = PeerPhase::Failed;
            if entry.recreated {
                false
            } else {
                entry.phase = PeerPhase::Recreating;
                entry.recreated = true;
                true
            }
        };

        if !retry {
            warn!(peer_id = %peer_id, "Connection failed again after recreation, dropping peer");
            self.remove_peer(&peer_id).await;
            return;
        }

        info!(peer_id = %peer_id, "Recreating peer connection");
        let local = self.media.stream();
        let transport = match self.build_session(&peer_id, local.as_ref()).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Failed to recreate peer connection");
                self.remove_peer(&peer_id).await;
                return;
            }
        };

        let renegotiated = match self.peers.create_offer(transport.as_ref()).await {
            Ok(offer) => {
                self.send_if_current(&peer_id, &transport, |target| ClientMessage::Offer {
                    target,
                    offer,
                })
                .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = renegotiated {
            warn!(peer_id = %peer_id, error = %e, "Error renegotiating recreated connection");
        }
    }

    /// Stops the analyser, closes the session and drops the roster entry. Safe to repeat.
    async fn remove_peer(&self, peer_id: &str) {
        if let Some(entry) = self.phases.lock().get_mut(peer_id) {
            entry.phase = PeerPhase::Closed;
        }
        self.audio.stop(peer_id);
        self.peers.close(peer_id).await;
        self.phases.lock().remove(peer_id);

        if self
            .roster
            .send_if_modified(|roster| room::remove(roster, peer_id))
        {
            info!(peer_id, "User left");
        }
    }

    async fn leave_room(&self) {
        if let Err(e) = self.signaling.send(ClientMessage::LeaveRoom).await {
            warn!(error = %e, "Failed to send leave-room");
        }
        self.room.leave();
        self.teardown().await;
    }

    async fn teardown(&self) {
        if let Some(task) = self.quality_task.lock().take() {
            task.abort();
        }
        self.audio.stop_all();
        self.phases.lock().clear();
        self.peers.close_all().await;
        self.roster.send_if_modified(|roster| {
            let had_any = !roster.is_empty();
            roster.clear();
            had_any
        });
        debug!("Peer connections cleared");
    }

    async fn broadcast_media_state(&self, state: &LocalMediaState) {
        let msg = ClientMessage::StreamStateChanged {
            is_camera_enabled: state.is_camera_enabled,
            is_mic_enabled: state.is_mic_enabled,
            is_screen_sharing: state.is_screen_sharing,
            room_id: self.room.current_room(),
            stream_id: state.stream.as_ref().map(|s| s.id().to_owned()),
        };
        if let Err(e) = self.signaling.send(msg).await {
            warn!(error = %e, "Failed to broadcast media state");
        }
    }

    async fn on_local_media_changed(&self, state: LocalMediaState) {
        self.broadcast_media_state(&state).await;

        let outgoing = state.outgoing_video();
        let id = outgoing.as_ref().map(|t| t.id().to_owned());
        {
            let mut current = self.outgoing_video.lock();
            if *current == id {
                return;
            }
            *current = id;
        }

        for (peer_id, transport) in self.peers.sessions() {
            match transport.replace_video_track(outgoing.clone()).await {
                Ok(()) => debug!(peer_id = %peer_id, "Replaced outgoing video track"),
                Err(e) => warn!(peer_id = %peer_id, error = %e, "Failed to replace video track"),
            }
        }
    }

    async fn optimize_quality(&self) -> Vec<PeerQuality> {
        let sessions = self.peers.sessions();
        self.quality.lock().await.optimize(sessions).await
    }

    fn start_quality_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.config.quality_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.optimize_quality().await;
            }
        });

        if let Some(old) = self.quality_task.lock().replace(handle) {
            old.abort();
        }
    }

    fn spawn_media_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut updates = self.media.subscribe();
        updates.borrow_and_update();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let state = updates.borrow_and_update().clone();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_local_media_changed(state).await;
            }
        })
    }

    fn spawn_room_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut room = self.room.subscribe();
        let mut in_room = room.borrow_and_update().is_some();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while room.changed().await.is_ok() {
                let now_in_room = room.borrow_and_update().is_some();
                if in_room && !now_in_room {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.teardown().await;
                }
                in_room = now_in_room;
            }
        })
    }
}

/// Boxed so the monitor callback does not make `build_session` a recursive future type.
fn failure_task(inner: Arc<Inner>, peer_id: String) -> BoxFuture<'static, ()> {
    Box::pin(async move { inner.on_connection_failure(peer_id).await })
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.quality_task.lock().take() {
            task.abort();
        }
        for watcher in self.watchers.lock().drain(..) {
            watcher.abort();
        }
    }
}
