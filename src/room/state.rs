use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Room membership: the current room id and a left-room notification.
#[derive(Clone)]
pub struct RoomContext {
    current: Arc<watch::Sender<Option<String>>>,
}

impl RoomContext {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self {
            current: Arc::new(current),
        }
    }

    pub fn enter(&self, room_id: impl Into<String>) {
        let room_id = room_id.into();
        info!(room_id = %room_id, "Entered room");
        self.current.send_replace(Some(room_id));
    }

    pub fn leave(&self) {
        if let Some(room_id) = self.current.send_replace(None) {
            info!(room_id = %room_id, "Left room");
        }
    }

    pub fn current_room(&self) -> Option<String> {
        self.current.borrow().clone()
    }

    /// Yields `None` once the room has been left.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.current.subscribe()
    }
}

impl Default for RoomContext {
    fn default() -> Self {
        Self::new()
    }
}
