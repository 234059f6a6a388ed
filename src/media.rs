//! Local and remote media stream handles.
//!
//! Capture itself lives outside this crate: a host hands finished
//! [`LocalStream`]s to [`LocalMedia`], and transports hand arrived
//! [`RemoteStream`]s to the coordinator.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{Error, Result};

/// Samples kept per audio tap; matches a 2048-point analysis window.
pub const PCM_WINDOW: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        }
    }
}

/// Enabled and live flags shared by every clone of a track.
#[derive(Debug, Clone)]
struct TrackFlags {
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl TrackFlags {
    fn new() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }
}

/// A captured track bound into outgoing sessions.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    flags: TrackFlags,
    handle: Arc<dyn TrackLocal + Send + Sync>,
}

impl LocalTrack {
    pub fn new(handle: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self {
            id: handle.id().to_owned(),
            kind: handle.kind().into(),
            flags: TrackFlags::new(),
            handle,
        }
    }

    /// Sample-fed track with the default codec for `kind`.
    pub fn sample(kind: TrackKind, id: &str, stream_id: &str) -> Self {
        let mime_type = match kind {
            TrackKind::Audio => "audio/opus",
            TrackKind::Video => "video/VP8",
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            stream_id.to_owned(),
        ));
        Self::new(track)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn handle(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.handle)
    }

    pub fn is_enabled(&self) -> bool {
        self.flags.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.flags.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.flags.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.flags.live.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Camera + microphone pair of sample-fed tracks.
    pub fn camera(id: &str) -> Self {
        Self::new(
            id,
            vec![
                LocalTrack::sample(TrackKind::Audio, &format!("{id}-audio"), id),
                LocalTrack::sample(TrackKind::Video, &format!("{id}-video"), id),
            ],
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Video)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Rolling window of decoded PCM for one remote audio track.
#[derive(Clone, Default)]
pub struct PcmTap {
    window: Arc<Mutex<VecDeque<f32>>>,
}

impl PcmTap {
    pub fn push(&self, samples: &[f32]) {
        let mut window = self.window.lock();
        window.extend(samples.iter().copied());
        let excess = window.len().saturating_sub(PCM_WINDOW);
        window.drain(..excess);
    }

    /// Copies the current window into `out`, zero-padded to [`PCM_WINDOW`].
    pub fn snapshot(&self, out: &mut Vec<f32>) {
        out.clear();
        out.extend(self.window.lock().iter().copied());
        out.resize(PCM_WINDOW, 0.0);
    }
}

#[derive(Clone)]
pub struct RemoteTrack {
    id: String,
    kind: TrackKind,
    flags: TrackFlags,
    pcm: Option<PcmTap>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            flags: TrackFlags::new(),
            pcm: (kind == TrackKind::Audio).then(PcmTap::default),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn pcm(&self) -> Option<&PcmTap> {
        self.pcm.as_ref()
    }

    pub fn is_live(&self) -> bool {
        self.flags.live.load(Ordering::SeqCst)
    }

    /// Marks the track ended; set by the transport when the remote side stops sending.
    pub fn end(&self) {
        self.flags.live.store(false, Ordering::SeqCst);
    }
}

/// Media arriving from one remote peer.
#[derive(Clone)]
pub struct RemoteStream {
    id: String,
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>, tracks: Vec<RemoteTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    /// A stream is live while at least one of its tracks has not ended.
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(RemoteTrack::is_live)
    }

    pub fn audio_tap(&self) -> Option<PcmTap> {
        self.tracks
            .iter()
            .find(|t| t.kind == TrackKind::Audio)
            .and_then(|t| t.pcm.clone())
    }

    pub(crate) fn add_track(&mut self, track: RemoteTrack) {
        if !self.tracks.iter().any(|t| t.id == track.id) {
            self.tracks.push(track);
        }
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Snapshot published by a [`LocalMediaProvider`] on every change.
#[derive(Debug, Clone)]
pub struct LocalMediaState {
    pub is_camera_enabled: bool,
    pub is_mic_enabled: bool,
    pub is_screen_sharing: bool,
    pub stream: Option<LocalStream>,
    pub screen_stream: Option<LocalStream>,
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self {
            is_camera_enabled: true,
            is_mic_enabled: true,
            is_screen_sharing: false,
            stream: None,
            screen_stream: None,
        }
    }
}

impl LocalMediaState {
    /// The video track remote peers should currently receive.
    pub fn outgoing_video(&self) -> Option<LocalTrack> {
        if self.is_screen_sharing {
            if let Some(track) = self.screen_stream.as_ref().and_then(LocalStream::video_track) {
                return Some(track.clone());
            }
        }
        self.stream.as_ref().and_then(LocalStream::video_track).cloned()
    }
}

#[async_trait]
pub trait LocalMediaProvider: Send + Sync {
    fn stream(&self) -> Option<LocalStream>;

    /// Waits for a capture stream, failing with [`Error::NoLocalStream`].
    async fn ensure_stream(&self) -> Result<LocalStream>;

    fn subscribe(&self) -> watch::Receiver<LocalMediaState>;
}

/// Current-value holder for local capture state.
pub struct LocalMedia {
    state: watch::Sender<LocalMediaState>,
    attempts: u32,
    retry: Duration,
}

impl LocalMedia {
    pub fn new(attempts: u32, retry: Duration) -> Self {
        let (state, _) = watch::channel(LocalMediaState::default());
        Self {
            state,
            attempts,
            retry,
        }
    }

    pub fn state(&self) -> LocalMediaState {
        self.state.borrow().clone()
    }

    /// Installs a freshly captured stream, replacing any previous one.
    pub fn set_stream(&self, stream: LocalStream) {
        self.state.send_modify(|state| {
            if let Some(track) = stream.video_track() {
                track.set_enabled(state.is_camera_enabled);
            }
            if let Some(track) = stream.audio_track() {
                track.set_enabled(state.is_mic_enabled);
            }
            state.stream = Some(stream);
        });
    }

    pub fn toggle_camera(&self) -> bool {
        let mut enabled = self.state.borrow().is_camera_enabled;
        self.state.send_if_modified(|state| {
            let Some(track) = state.stream.as_ref().and_then(LocalStream::video_track) else {
                debug!("No video track to toggle");
                return false;
            };
            enabled = !state.is_camera_enabled;
            track.set_enabled(enabled);
            state.is_camera_enabled = enabled;
            true
        });
        enabled
    }

    pub fn toggle_microphone(&self) -> bool {
        let mut enabled = self.state.borrow().is_mic_enabled;
        self.state.send_if_modified(|state| {
            let Some(track) = state.stream.as_ref().and_then(LocalStream::audio_track) else {
                debug!("No audio track to toggle");
                return false;
            };
            enabled = !state.is_mic_enabled;
            track.set_enabled(enabled);
            state.is_mic_enabled = enabled;
            true
        });
        enabled
    }

    pub fn start_screen_share(&self, screen: LocalStream) {
        self.state.send_modify(|state| {
            if let Some(old) = state.screen_stream.replace(screen) {
                old.stop();
            }
            state.is_screen_sharing = true;
            state.is_camera_enabled = false;
        });
    }

    pub fn stop_screen_share(&self) {
        self.state.send_if_modified(|state| {
            if !state.is_screen_sharing {
                return false;
            }
            if let Some(screen) = state.screen_stream.take() {
                screen.stop();
            }
            state.is_screen_sharing = false;
            state.is_camera_enabled = true;
            true
        });
    }

    /// Stops every captured track and resets flags to their defaults.
    pub fn stop_stream(&self) {
        self.state.send_modify(|state| {
            if let Some(stream) = state.stream.take() {
                stream.stop();
            }
            if let Some(screen) = state.screen_stream.take() {
                screen.stop();
            }
            *state = LocalMediaState::default();
        });
    }
}

impl Default for LocalMedia {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

#[async_trait]
impl LocalMediaProvider for LocalMedia {
    fn stream(&self) -> Option<LocalStream> {
        self.state.borrow().stream.clone()
    }

    async fn ensure_stream(&self) -> Result<LocalStream> {
        let mut attempts = 0;
        while self.stream().is_none() && attempts < self.attempts {
            sleep(self.retry).await;
            attempts += 1;
        }
        self.stream().ok_or_else(|| {
            warn!(attempts, "Failed to get local stream after waiting");
            Error::NoLocalStream
        })
    }

    fn subscribe(&self) -> watch::Receiver<LocalMediaState> {
        self.state.subscribe()
    }
}
