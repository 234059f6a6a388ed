//! In-memory transport and signaling doubles.
//!
//! [`FakeTransport`] walks the offer/answer state machine without any
//! network: completing a negotiation marks it connected and delivers a live
//! audio+video remote stream through its `on_track` handler.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::connection::{ConnectionMonitor, ConnectionState};
use crate::error::{Error, Result};
use crate::media::{LocalStream, LocalTrack, RemoteStream, RemoteTrack, TrackKind};
use crate::metrics::{EncodingProfile, StatsSnapshot};
use crate::signaling::{ClientMessage, SignalingSink};
use crate::transport::{
    IceCandidate, MediaTransport, SdpKind, SessionDescription, SignalingState, TransportFactory,
    TransportHandlers,
};

#[derive(Debug, Default)]
struct FakeState {
    signaling: Option<SignalingState>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    encodings: Vec<EncodingProfile>,
    replaced: Vec<Option<String>>,
    offers: usize,
    closed: bool,
    stats: Option<StatsSnapshot>,
}

pub struct FakeTransport {
    label: String,
    video_track: Mutex<Option<String>>,
    state: Mutex<FakeState>,
    monitor: ConnectionMonitor,
    handlers: TransportHandlers,
    remote: Mutex<Option<RemoteStream>>,
}

impl FakeTransport {
    fn new(label: String, local: Option<&LocalStream>, handlers: TransportHandlers) -> Self {
        let video_track = local
            .and_then(LocalStream::video_track)
            .map(|t| t.id().to_owned());
        Self {
            label,
            video_track: Mutex::new(video_track),
            state: Mutex::new(FakeState::default()),
            monitor: ConnectionMonitor::new(),
            handlers,
            remote: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn encodings(&self) -> Vec<EncodingProfile> {
        self.state.lock().encodings.clone()
    }

    /// Track ids passed to `replace_video_track`, in order.
    pub fn replaced_tracks(&self) -> Vec<Option<String>> {
        self.state.lock().replaced.clone()
    }

    pub fn video_track_id(&self) -> Option<String> {
        self.video_track.lock().clone()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn set_stats(&self, stats: StatsSnapshot) {
        self.state.lock().stats = Some(stats);
    }

    /// Drives the connectivity monitor as the native transport would.
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.monitor.update_state(state);
    }

    pub fn fail(&self) {
        self.set_connection_state(ConnectionState::Failed);
    }

    /// Ends every remote track delivered so far, as a remote hangup of its media would.
    pub fn end_remote_media(&self) {
        let Some(stream) = self.remote.lock().clone() else {
            return;
        };
        for track in stream.tracks() {
            track.end();
            (self.handlers.on_track_ended)();
        }
    }

    fn current(&self) -> SignalingState {
        self.state.lock().signaling.unwrap_or(SignalingState::Stable)
    }

    fn complete_negotiation(&self) {
        self.monitor.update_state(ConnectionState::Connected);
        let stream_id = format!("{}-remote", self.label);
        let stream = RemoteStream::new(
            stream_id.clone(),
            vec![
                RemoteTrack::new(format!("{stream_id}-audio"), TrackKind::Audio),
                RemoteTrack::new(format!("{stream_id}-video"), TrackKind::Video),
            ],
        );
        *self.remote.lock() = Some(stream.clone());
        (self.handlers.on_track)(stream);
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Negotiation("transport closed".into()));
        }
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "offer {} #{}",
            self.label, state.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        if state.signaling != Some(SignalingState::HaveRemoteOffer) {
            return Err(Error::Negotiation("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!("answer {}", self.label)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let completed = {
            let mut state = self.state.lock();
            let current = state.signaling.unwrap_or(SignalingState::Stable);
            let (next, completed) = match (desc.kind, current) {
                (SdpKind::Offer, SignalingState::Stable) => (SignalingState::HaveLocalOffer, false),
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => (SignalingState::Stable, true),
                (kind, current) => {
                    return Err(Error::Negotiation(format!(
                        "cannot apply local {:?} in {}",
                        kind, current
                    )))
                }
            };
            state.signaling = Some(next);
            state.local = Some(desc);
            completed
        };

        (self.handlers.on_ice_candidate)(IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 127.0.0.1 9 typ host",
            self.label
        )));
        if completed {
            self.complete_negotiation();
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let completed = {
            let mut state = self.state.lock();
            let current = state.signaling.unwrap_or(SignalingState::Stable);
            let (next, completed) = match (desc.kind, current) {
                (SdpKind::Offer, SignalingState::Stable) => (SignalingState::HaveRemoteOffer, false),
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => (SignalingState::Stable, true),
                (kind, current) => {
                    return Err(Error::Negotiation(format!(
                        "cannot apply remote {:?} in {}",
                        kind, current
                    )))
                }
            };
            state.signaling = Some(next);
            state.remote = Some(desc);
            completed
        };

        if completed {
            self.complete_negotiation();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(Error::Negotiation("remote description not set".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.current()
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.monitor.subscribe()
    }

    async fn stats(&self) -> Result<StatsSnapshot> {
        self.state
            .lock()
            .stats
            .clone()
            .ok_or_else(|| Error::ConnectionFailure("stats unavailable".into()))
    }

    async fn has_video_sender(&self) -> bool {
        self.video_track.lock().is_some()
    }

    async fn apply_encoding(&self, profile: EncodingProfile) -> Result<()> {
        self.state.lock().encodings.push(profile);
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<LocalTrack>) -> Result<()> {
        let id = track.map(|t| t.id().to_owned());
        *self.video_track.lock() = id.clone();
        self.state.lock().replaced.push(id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.signaling = Some(SignalingState::Closed);
        }
        self.monitor.update_state(ConnectionState::Closed);
        Ok(())
    }
}

/// Hands out [`FakeTransport`]s and remembers every one it built.
pub struct FakeTransportFactory {
    name: String,
    created: Mutex<Vec<Arc<FakeTransport>>>,
    failures: AtomicUsize,
}

impl FakeTransportFactory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` calls to `create` fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<FakeTransport>> {
        self.created.lock().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn last(&self) -> Option<Arc<FakeTransport>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        local: Option<&LocalStream>,
        handlers: TransportHandlers,
    ) -> Result<Arc<dyn MediaTransport>> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(Error::ConnectionFailure("transport creation refused".into()));
        }

        let mut created = self.created.lock();
        let label = format!("{}#{}", self.name, created.len() + 1);
        let transport = Arc::new(FakeTransport::new(label, local, handlers));
        created.push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// Records outbound signaling and optionally forwards it.
#[derive(Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<ClientMessage>>,
    forward: Option<mpsc::UnboundedSender<ClientMessage>>,
}

impl RecordingSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarding(forward: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            forward: Some(forward),
        }
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    pub fn take(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn count(&self, pred: impl Fn(&ClientMessage) -> bool) -> usize {
        self.sent.lock().iter().filter(|m| pred(m)).count()
    }
}

#[async_trait]
impl SignalingSink for RecordingSignaling {
    async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.sent.lock().push(msg.clone());
        if let Some(forward) = &self.forward {
            forward
                .send(msg)
                .map_err(|e| Error::Signaling(format!("relay closed: {}", e)))?;
        }
        Ok(())
    }
}
