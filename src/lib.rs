//! Peer-connection core of a mesh video conferencing client.
//!
//! A [`SignalingCoordinator`] consumes relay messages, drives one media
//! session per remote participant through offer/answer/ICE, recovers failed
//! sessions, adapts outgoing video to measured quality and publishes the
//! participant roster to observers.

pub mod audio;
pub mod codec;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod media;
pub mod metrics;
pub mod peers;
pub mod room;
pub mod signaling;
pub mod transport;
pub mod webrtc;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use crate::config::{ClientConfig, CoordinatorConfig};
pub use crate::connection::{ConnectionState, PeerPhase};
pub use crate::coordinator::SignalingCoordinator;
pub use crate::error::{Error, Result};
pub use crate::media::{LocalMedia, LocalMediaProvider, LocalStream, RemoteStream};
pub use crate::metrics::{EncodingProfile, PeerQuality, QualityGrade};
pub use crate::room::{Participant, RoomContext};
pub use crate::signaling::{ClientMessage, ServerMessage, SignalingClient};
pub use crate::webrtc::WebRtcTransportFactory;
