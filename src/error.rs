use thiserror::Error as ThisError;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, ThisError)]
pub enum Error {
    /// Local capture stream still missing after the bounded wait.
    #[error("No local stream available")]
    NoLocalStream,

    #[error("No peer connection found for {0}")]
    PeerNotFound(String),

    /// SDP generation or application failed for a single exchange.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Unrecognized signaling message: {0}")]
    UnknownMessage(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors that a late or racing signaling message is expected to hit.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Error::PeerNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
