//! The seam between the peer manager and a native media transport.
//!
//! [`crate::webrtc`] implements it over `webrtc` peer connections; the
//! `testing` module implements it in memory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::connection::ConnectionState;
use crate::error::Result;
use crate::media::{LocalStream, LocalTrack, RemoteStream};
use crate::metrics::{EncodingProfile, StatsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP payload in the browser's `{type, sdp}` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPranswer => "have-local-pranswer",
            SignalingState::HaveRemotePranswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub type TrackHandler = Arc<dyn Fn(RemoteStream) + Send + Sync>;
pub type TrackEndedHandler = Arc<dyn Fn() + Send + Sync>;
pub type CandidateHandler = Arc<dyn Fn(IceCandidate) + Send + Sync>;

/// Callbacks a transport invokes for inbound media and locally gathered candidates.
#[derive(Clone)]
pub struct TransportHandlers {
    pub on_track: TrackHandler,
    /// Called after a remote track has been marked ended.
    pub on_track_ended: TrackEndedHandler,
    pub on_ice_candidate: CandidateHandler,
}

/// One point-to-point media session.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Creates an offer that requests both audio and video from the remote side.
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    async fn has_remote_description(&self) -> bool;

    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    async fn stats(&self) -> Result<StatsSnapshot>;

    async fn has_video_sender(&self) -> bool;

    async fn apply_encoding(&self, profile: EncodingProfile) -> Result<()>;

    /// Swaps the outgoing video track in place, without renegotiation.
    async fn replace_video_track(&self, track: Option<LocalTrack>) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Builds a transport with every track of `local` attached.
    async fn create(
        &self,
        local: Option<&LocalStream>,
        handlers: TransportHandlers,
    ) -> Result<Arc<dyn MediaTransport>>;
}
