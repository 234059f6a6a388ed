use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::room::MediaFlags;
use crate::transport::{IceCandidate, SessionDescription};

/// Roster entry as carried by `set-participants`; live media is never part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub socket_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_camera_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_mic_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_screen_sharing: Option<bool>,
}

impl ParticipantInfo {
    pub fn new(socket_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            socket_id: socket_id.into(),
            username: username.into(),
            is_camera_enabled: None,
            is_mic_enabled: None,
            is_screen_sharing: None,
        }
    }

    /// Unspecified flags fall back to [`MediaFlags::default`].
    pub fn flags(&self) -> MediaFlags {
        let defaults = MediaFlags::default();
        MediaFlags {
            is_camera_enabled: self.is_camera_enabled.unwrap_or(defaults.is_camera_enabled),
            is_mic_enabled: self.is_mic_enabled.unwrap_or(defaults.is_mic_enabled),
            is_screen_sharing: self.is_screen_sharing.unwrap_or(defaults.is_screen_sharing),
        }
    }
}

/// Messages delivered by the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    UserJoined { socket_id: String, username: String },
    SetParticipants { participants: Vec<ParticipantInfo> },
    /// Absent flags leave the current value untouched.
    #[serde(rename_all = "camelCase")]
    StreamStateChanged {
        socket_id: String,
        #[serde(default)]
        is_camera_enabled: Option<bool>,
        #[serde(default)]
        is_mic_enabled: Option<bool>,
        #[serde(default)]
        is_screen_sharing: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft { socket_id: String },
    #[serde(rename_all = "camelCase")]
    RequestOffer { socket_id: String },
    Offer {
        offer: SessionDescription,
        from: String,
    },
    Answer {
        answer: SessionDescription,
        from: String,
    },
    IceCandidate {
        candidate: IceCandidate,
        from: String,
    },
    Ping,
}

impl ServerMessage {
    /// Decodes one relay frame, naming the tag when it is not part of the protocol.
    pub fn parse(text: &str) -> Result<Self> {
        match serde_json::from_str(text) {
            Ok(msg) => Ok(msg),
            Err(err) => {
                let tag = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_owned));
                match tag {
                    Some(tag) if !Self::is_known_tag(&tag) => Err(Error::UnknownMessage(tag)),
                    _ => Err(err.into()),
                }
            }
        }
    }

    fn is_known_tag(tag: &str) -> bool {
        matches!(
            tag,
            "user-joined"
                | "set-participants"
                | "stream-state-changed"
                | "user-left"
                | "request-offer"
                | "offer"
                | "answer"
                | "ice-candidate"
                | "ping"
        )
    }

    /// The remote peer a message concerns, if any.
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            ServerMessage::UserJoined { socket_id, .. }
            | ServerMessage::StreamStateChanged { socket_id, .. }
            | ServerMessage::UserLeft { socket_id }
            | ServerMessage::RequestOffer { socket_id } => Some(socket_id),
            ServerMessage::Offer { from, .. }
            | ServerMessage::Answer { from, .. }
            | ServerMessage::IceCandidate { from, .. } => Some(from),
            ServerMessage::SetParticipants { .. } | ServerMessage::Ping => None,
        }
    }
}

/// Messages this client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String, username: String },
    LeaveRoom,
    Offer {
        target: String,
        offer: SessionDescription,
    },
    Answer {
        target: String,
        answer: SessionDescription,
    },
    IceCandidate {
        target: String,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    StreamStateChanged {
        is_camera_enabled: bool,
        is_mic_enabled: bool,
        is_screen_sharing: bool,
        room_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
    },
    Pong,
}

#[async_trait]
pub trait SignalingSink: Send + Sync {
    async fn send(&self, msg: ClientMessage) -> Result<()>;
}

/// Cloneable outbound half of a [`SignalingClient`].
#[derive(Clone)]
pub struct SignalingSender {
    tx: mpsc::Sender<ClientMessage>,
}

#[async_trait]
impl SignalingSink for SignalingSender {
    async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|e| Error::Signaling(format!("Failed to send message: {}", e)))
    }
}

pub struct SignalingClient {
    tx: mpsc::Sender<ClientMessage>,
    rx: mpsc::Receiver<ServerMessage>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        info!(url, "Connected to signaling relay");
        let (mut write, mut read) = ws_stream.split();

        let (tx, rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientMessage>(100);

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode signaling message"),
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "Signaling connection error");
                        break;
                    }
                };
                match ServerMessage::parse(&text) {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping signaling frame"),
                }
            }
            debug!("Signaling reader finished");
        });

        Ok(Self {
            tx: outgoing_tx,
            rx,
        })
    }

    /// Splits into the sink handed to the coordinator and the inbound message stream.
    pub fn into_parts(self) -> (SignalingSender, mpsc::Receiver<ServerMessage>) {
        (SignalingSender { tx: self.tx }, self.rx)
    }
}
