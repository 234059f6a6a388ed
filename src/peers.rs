//! Owns one media session per remote participant.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::ConnectionState;
use crate::error::{Error, Result};
use crate::media::LocalStream;
use crate::transport::{
    IceCandidate, MediaTransport, SessionDescription, SignalingState, TransportFactory,
    TransportHandlers,
};

/// Invoked with the peer id when a session enters a failure state.
pub type FailureHandler = Arc<dyn Fn(String) + Send + Sync>;

pub struct PeerSession {
    transport: Arc<dyn MediaTransport>,
    username: String,
    connected: bool,
    last_activity: Instant,
    monitor: Option<JoinHandle<()>>,
}

impl PeerSession {
    fn new(transport: Arc<dyn MediaTransport>, username: String) -> Self {
        Self {
            transport,
            username,
            connected: false,
            last_activity: Instant::now(),
            monitor: None,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

/// Read-only view of a session for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub peer_id: String,
    pub username: String,
    pub connected: bool,
    pub last_activity: Instant,
}

pub(crate) fn same_transport(a: &Arc<dyn MediaTransport>, b: &Arc<dyn MediaTransport>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

pub struct PeerConnectionManager {
    factory: Arc<dyn TransportFactory>,
    sessions: Mutex<HashMap<String, PeerSession>>,
}

impl PeerConnectionManager {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a fresh session for `peer_id`, closing whatever session existed.
    pub async fn create_connection(
        &self,
        peer_id: &str,
        username: &str,
        local: Option<&LocalStream>,
        handlers: TransportHandlers,
    ) -> Result<Arc<dyn MediaTransport>> {
        self.close(peer_id).await;

        let transport = self.factory.create(local, handlers).await?;

        // Another task may have created a session while the factory was busy
        let previous = self.sessions.lock().insert(
            peer_id.to_owned(),
            PeerSession::new(Arc::clone(&transport), username.to_owned()),
        );
        if let Some(previous) = previous {
            debug!(peer_id, "Replacing session created concurrently");
            Self::shutdown(peer_id, previous).await;
        }

        info!(peer_id, username, "Created peer connection");
        Ok(transport)
    }

    /// Creates an offer on `transport` and installs it as the local description.
    pub async fn create_offer(&self, transport: &dyn MediaTransport) -> Result<SessionDescription> {
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Applies a remote offer to the session for `peer_id` and returns the local answer.
    pub async fn accept_offer(
        &self,
        peer_id: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let transport = self.touch(peer_id)?;
        transport.set_remote_description(offer).await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Applies a remote answer; a session that is already stable ignores it.
    pub async fn apply_answer(&self, peer_id: &str, answer: SessionDescription) -> Result<()> {
        let transport = self.touch(peer_id)?;
        if transport.signaling_state() == SignalingState::Stable {
            debug!(peer_id, "Ignoring answer, connection already stable");
            return Ok(());
        }
        transport.set_remote_description(answer).await
    }

    /// Adds a remote candidate. Unknown peers and sessions without a remote
    /// description drop the candidate.
    pub async fn apply_remote_candidate(&self, peer_id: &str, candidate: IceCandidate) -> Result<()> {
        let Ok(transport) = self.touch(peer_id) else {
            debug!(peer_id, "Dropping candidate for unknown peer");
            return Ok(());
        };
        if !transport.has_remote_description().await {
            debug!(peer_id, "Dropping candidate received before remote description");
            return Ok(());
        }
        transport.add_ice_candidate(candidate).await
    }

    pub fn connection(&self, peer_id: &str) -> Option<Arc<dyn MediaTransport>> {
        self.sessions
            .lock()
            .get(peer_id)
            .map(|s| Arc::clone(&s.transport))
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.sessions.lock().contains_key(peer_id)
    }

    /// Whether `transport` is still the live session for `peer_id`.
    pub fn is_current(&self, peer_id: &str, transport: &Arc<dyn MediaTransport>) -> bool {
        self.sessions
            .lock()
            .get(peer_id)
            .is_some_and(|s| same_transport(&s.transport, transport))
    }

    pub fn username(&self, peer_id: &str) -> Option<String> {
        self.sessions.lock().get(peer_id).map(|s| s.username.clone())
    }

    pub fn mark_connected(&self, peer_id: &str) {
        if let Some(session) = self.sessions.lock().get_mut(peer_id) {
            session.connected = true;
            session.touch();
        }
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn sessions(&self) -> Vec<(String, Arc<dyn MediaTransport>)> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, s)| (id.clone(), Arc::clone(&s.transport)))
            .collect()
    }

    pub fn session_info(&self, peer_id: &str) -> Option<SessionInfo> {
        self.sessions.lock().get(peer_id).map(|s| SessionInfo {
            peer_id: peer_id.to_owned(),
            username: s.username.clone(),
            connected: s.connected,
            last_activity: s.last_activity,
        })
    }

    /// Watches the session's connectivity and calls `on_failure` each time it
    /// moves into a failure state. Stops once the session closes.
    pub fn monitor(&self, peer_id: &str, on_failure: FailureHandler) {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(peer_id) else {
            return;
        };

        let mut states = session.transport.connection_state();
        let mut previous = *states.borrow_and_update();
        let id = peer_id.to_owned();
        let handle = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                debug!(peer_id = %id, %state, "Peer connection state changed");
                if state == ConnectionState::Closed {
                    break;
                }
                if state.is_failure() && !previous.is_failure() {
                    warn!(peer_id = %id, %state, "Peer connection lost");
                    on_failure(id.clone());
                }
                previous = state;
            }
        });

        if let Some(old) = session.monitor.replace(handle) {
            old.abort();
        }
    }

    /// Closes and forgets the session for `peer_id`. Unknown ids are a no-op.
    pub async fn close(&self, peer_id: &str) {
        let session = self.sessions.lock().remove(peer_id);
        if let Some(session) = session {
            Self::shutdown(peer_id, session).await;
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.lock().drain().collect();
        join_all(
            drained
                .into_iter()
                .map(|(peer_id, session)| async move { Self::shutdown(&peer_id, session).await }),
        )
        .await;
    }

    fn touch(&self, peer_id: &str) -> Result<Arc<dyn MediaTransport>> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_owned()))?;
        session.touch();
        Ok(Arc::clone(&session.transport))
    }

    async fn shutdown(peer_id: &str, mut session: PeerSession) {
        if let Some(monitor) = session.monitor.take() {
            monitor.abort();
        }
        if let Err(e) = session.transport.close().await {
            warn!(peer_id, error = %e, "Error closing peer connection");
        }
        info!(peer_id, "Closed peer connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::RemoteStream;
    use crate::testing::FakeTransportFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handlers() -> TransportHandlers {
        TransportHandlers {
            on_track: Arc::new(|_: RemoteStream| {}),
            on_track_ended: Arc::new(|| {}),
            on_ice_candidate: Arc::new(|_: IceCandidate| {}),
        }
    }

    fn manager() -> (Arc<FakeTransportFactory>, PeerConnectionManager) {
        let factory = Arc::new(FakeTransportFactory::new("local"));
        let manager = PeerConnectionManager::new(Arc::clone(&factory) as Arc<dyn TransportFactory>);
        (factory, manager)
    }

    #[tokio::test]
    async fn create_replaces_existing_session() {
        let (factory, manager) = manager();
        let first = manager
            .create_connection("p1", "alice", None, handlers())
            .await
            .unwrap();
        let second = manager
            .create_connection("p1", "alice", None, handlers())
            .await
            .unwrap();

        assert!(!same_transport(&first, &second));
        assert!(manager.is_current("p1", &second));
        assert!(factory.created()[0].is_closed());
        assert_eq!(manager.peer_ids(), vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn answer_on_stable_session_is_ignored() {
        let (factory, manager) = manager();
        manager
            .create_connection("p1", "alice", None, handlers())
            .await
            .unwrap();

        manager
            .apply_answer("p1", SessionDescription::answer("late"))
            .await
            .unwrap();
        assert!(factory.last().unwrap().remote_description().is_none());
    }

    #[tokio::test]
    async fn answer_for_unknown_peer_is_not_found() {
        let (_, manager) = manager();
        let err = manager
            .apply_answer("ghost", SessionDescription::answer("x"))
            .await
            .unwrap_err();
        assert!(err.is_benign_race());
    }

    #[tokio::test]
    async fn candidates_need_a_known_peer_and_remote_description() {
        let (factory, manager) = manager();
        manager
            .apply_remote_candidate("ghost", IceCandidate::new("c0"))
            .await
            .unwrap();

        let transport = manager
            .create_connection("p1", "alice", None, handlers())
            .await
            .unwrap();
        manager
            .apply_remote_candidate("p1", IceCandidate::new("early"))
            .await
            .unwrap();

        manager.create_offer(transport.as_ref()).await.unwrap();
        manager
            .apply_answer("p1", SessionDescription::answer("remote"))
            .await
            .unwrap();
        manager
            .apply_remote_candidate("p1", IceCandidate::new("c1"))
            .await
            .unwrap();

        let fake = factory.last().unwrap();
        assert_eq!(fake.candidates(), vec![IceCandidate::new("c1")]);
        assert_eq!(transport.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn accept_offer_produces_answer() {
        let (factory, manager) = manager();
        manager
            .create_connection("p1", "alice", None, handlers())
            .await
            .unwrap();

        let answer = manager
            .accept_offer("p1", SessionDescription::offer("remote"))
            .await
            .unwrap();
        assert_eq!(answer.kind, crate::transport::SdpKind::Answer);
        assert_eq!(factory.last().unwrap().local_description(), Some(answer));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (factory, manager) = manager();
        manager
            .create_connection("p1", "alice", None, handlers())
            .await
            .unwrap();

        manager.close("p1").await;
        manager.close("p1").await;
        manager.close("never-existed").await;

        assert!(!manager.contains("p1"));
        assert!(factory.last().unwrap().is_closed());
    }

    #[tokio::test]
    async fn monitor_fires_on_entering_failure() {
        let (factory, manager) = manager();
        manager
            .create_connection("p1", "alice", None, handlers())
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        manager.monitor(
            "p1",
            Arc::new(move |peer_id| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(peer_id);
            }),
        );
        tokio::task::yield_now().await;

        let fake = factory.last().unwrap();
        fake.set_connection_state(ConnectionState::Disconnected);
        assert_eq!(rx.recv().await.as_deref(), Some("p1"));

        // still failing: no second notification
        fake.set_connection_state(ConnectionState::Failed);
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mark_connected_updates_info() {
        let (_, manager) = manager();
        manager
            .create_connection("p1", "alice", None, handlers())
            .await
            .unwrap();

        assert!(!manager.session_info("p1").unwrap().connected);
        manager.mark_connected("p1");
        let info = manager.session_info("p1").unwrap();
        assert!(info.connected);
        assert_eq!(info.username, "alice");
        assert_eq!(manager.username("p1").as_deref(), Some("alice"));
    }
}
