#![allow(dead_code)]

use meshcall::signaling::ParticipantInfo;
use meshcall::testing::{FakeTransport, FakeTransportFactory, RecordingSignaling};
use meshcall::transport::SessionDescription;
use meshcall::{
    ClientMessage, CoordinatorConfig, LocalMedia, LocalStream, RoomContext, ServerMessage,
    SignalingCoordinator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const ROOM: &str = "standup";

/// One coordinator wired to in-memory collaborators.
pub struct Client {
    pub id: String,
    pub username: String,
    pub coordinator: SignalingCoordinator,
    pub factory: Arc<FakeTransportFactory>,
    pub signaling: Arc<RecordingSignaling>,
    pub media: Arc<LocalMedia>,
    pub room: RoomContext,
}

impl Client {
    pub fn new(id: &str, username: &str) -> Self {
        Self::build(id, username, Arc::new(RecordingSignaling::new()), true, true)
    }

    /// A client whose local capture never becomes available.
    pub fn without_stream(id: &str, username: &str) -> Self {
        Self::build(id, username, Arc::new(RecordingSignaling::new()), false, true)
    }

    /// A client that was never told its relay socket id, as the binary runs.
    pub fn unidentified(id: &str, username: &str) -> Self {
        Self::build(id, username, Arc::new(RecordingSignaling::new()), true, false)
    }

    pub fn forwarding(id: &str, username: &str, relay: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self::build(id, username, Arc::new(RecordingSignaling::forwarding(relay)), true, true)
    }

    fn build(
        id: &str,
        username: &str,
        signaling: Arc<RecordingSignaling>,
        with_stream: bool,
        identified: bool,
    ) -> Self {
        let factory = Arc::new(FakeTransportFactory::new(id));
        let media = Arc::new(LocalMedia::new(2, Duration::from_millis(10)));
        if with_stream {
            media.set_stream(LocalStream::camera(&format!("{id}-cam")));
        }
        let room = RoomContext::new();

        let coordinator = SignalingCoordinator::new(
            CoordinatorConfig::new(username),
            factory.clone(),
            signaling.clone(),
            media.clone(),
            room.clone(),
        );
        if identified {
            coordinator.set_local_id(id);
        }

        Self {
            id: id.to_owned(),
            username: username.to_owned(),
            coordinator,
            factory,
            signaling,
            media,
            room,
        }
    }

    pub async fn handle(&self, msg: ServerMessage) {
        self.coordinator.handle_message(msg).await;
        settle().await;
    }

    pub async fn user_joined(&self, id: &str, username: &str) {
        self.handle(ServerMessage::UserJoined {
            socket_id: id.to_owned(),
            username: username.to_owned(),
        })
        .await;
    }

    /// Plays the remote side of an offer from `id` and returns the transport that answered.
    pub async fn receive_offer(&self, id: &str) -> Arc<FakeTransport> {
        self.handle(ServerMessage::Offer {
            offer: SessionDescription::offer(format!("offer from {id}")),
            from: id.to_owned(),
        })
        .await;
        self.factory.last().expect("transport created")
    }

    /// Runs the request-offer flow for `id` through to a delivered answer.
    pub async fn connect_outbound(&self, id: &str) -> Arc<FakeTransport> {
        self.handle(ServerMessage::RequestOffer {
            socket_id: id.to_owned(),
        })
        .await;
        let transport = self.factory.last().expect("transport created");
        self.handle(ServerMessage::Answer {
            answer: SessionDescription::answer(format!("answer from {id}")),
            from: id.to_owned(),
        })
        .await;
        transport
    }

    pub fn sent_offers(&self, target: &str) -> usize {
        self.signaling
            .count(|m| matches!(m, ClientMessage::Offer { target: t, .. } if t == target))
    }

    pub fn media_broadcasts(&self) -> Vec<ClientMessage> {
        self.signaling
            .sent()
            .into_iter()
            .filter(|m| matches!(m, ClientMessage::StreamStateChanged { .. }))
            .collect()
    }
}

pub fn participant(id: &str, username: &str) -> ParticipantInfo {
    ParticipantInfo::new(id, username)
}

/// Lets spawned tasks (watchers, monitors, candidate sends) run.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
