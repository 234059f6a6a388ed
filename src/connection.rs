use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Connectivity of one native transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// `Disconnected` and `Failed` count as failure; `Closed` is a deliberate teardown.
    pub fn is_failure(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "New"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Failed => write!(f, "Failed"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

/// Where a remote peer sits in the coordinator's lifecycle.
///
/// A peer with no entry is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerPhase {
    Connecting,
    Connected,
    Failed,
    Recreating,
    Closed,
}

impl fmt::Display for PeerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerPhase::Connecting => write!(f, "Connecting"),
            PeerPhase::Connected => write!(f, "Connected"),
            PeerPhase::Failed => write!(f, "Failed"),
            PeerPhase::Recreating => write!(f, "Recreating"),
            PeerPhase::Closed => write!(f, "Closed"),
        }
    }
}

/// Current-value holder for a transport's connectivity.
#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConnectionState::New);
        Self {
            status: Arc::new(status),
        }
    }

    pub fn update_state(&self, state: ConnectionState) {
        self.status.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.status.subscribe()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_states() {
        assert!(ConnectionState::Failed.is_failure());
        assert!(ConnectionState::Disconnected.is_failure());
        assert!(!ConnectionState::Connecting.is_failure());
        assert!(!ConnectionState::Closed.is_failure());
    }

    #[test]
    fn maps_native_states() {
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
    }

    #[tokio::test]
    async fn monitor_skips_repeated_states() {
        let monitor = ConnectionMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.update_state(ConnectionState::Connecting);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        monitor.update_state(ConnectionState::Connecting);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(monitor.state(), ConnectionState::Connecting);
    }
}
