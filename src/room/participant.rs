use serde::{Deserialize, Serialize};

use crate::media::RemoteStream;

/// Camera, microphone and screen-share flags as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFlags {
    pub is_camera_enabled: bool,
    pub is_mic_enabled: bool,
    pub is_screen_sharing: bool,
}

impl Default for MediaFlags {
    fn default() -> Self {
        Self {
            is_camera_enabled: true,
            is_mic_enabled: true,
            is_screen_sharing: false,
        }
    }
}

/// One remote room member as seen by this client.
#[derive(Debug, Clone)]
pub struct Participant {
    pub socket_id: String,
    pub username: String,
    pub is_camera_enabled: bool,
    pub is_mic_enabled: bool,
    pub is_screen_sharing: bool,
    pub is_speaking: bool,
    pub active: bool,
    /// Attached and detached only by the coordinator.
    pub stream: Option<RemoteStream>,
}

impl Participant {
    pub fn new(socket_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self::with_flags(socket_id, username, MediaFlags::default())
    }

    pub fn with_flags(
        socket_id: impl Into<String>,
        username: impl Into<String>,
        flags: MediaFlags,
    ) -> Self {
        Self {
            socket_id: socket_id.into(),
            username: username.into(),
            is_camera_enabled: flags.is_camera_enabled,
            is_mic_enabled: flags.is_mic_enabled,
            is_screen_sharing: flags.is_screen_sharing,
            is_speaking: false,
            active: false,
            stream: None,
        }
    }

    pub fn flags(&self) -> MediaFlags {
        MediaFlags {
            is_camera_enabled: self.is_camera_enabled,
            is_mic_enabled: self.is_mic_enabled,
            is_screen_sharing: self.is_screen_sharing,
        }
    }

    pub fn apply_flags(&mut self, flags: MediaFlags) {
        self.is_camera_enabled = flags.is_camera_enabled;
        self.is_mic_enabled = flags.is_mic_enabled;
        self.is_screen_sharing = flags.is_screen_sharing;
        self.refresh_active();
    }

    /// `active` holds iff a live stream is attached and the peer sends camera or screen video.
    pub fn refresh_active(&mut self) {
        let live = self.stream.as_ref().is_some_and(RemoteStream::is_live);
        self.active = live && (self.is_screen_sharing || self.is_camera_enabled);
    }

    pub fn attach_stream(&mut self, stream: RemoteStream) {
        self.stream = Some(stream);
        self.is_speaking = false;
        self.refresh_active();
    }
}

pub(crate) fn find_mut<'a>(roster: &'a mut [Participant], socket_id: &str) -> Option<&'a mut Participant> {
    roster.iter_mut().find(|p| p.socket_id == socket_id)
}

/// Inserts a joined peer, or overwrites the existing entry's identity and flags in place.
///
/// An attached stream survives the overwrite so a late duplicate join does not blank the tile.
pub(crate) fn upsert_joined(roster: &mut Vec<Participant>, socket_id: &str, username: &str, flags: MediaFlags) {
    match find_mut(roster, socket_id) {
        Some(existing) => {
            existing.username = username.to_owned();
            existing.apply_flags(flags);
        }
        None => roster.push(Participant::with_flags(socket_id, username, flags)),
    }
}

pub(crate) fn remove(roster: &mut Vec<Participant>, socket_id: &str) -> bool {
    let before = roster.len();
    roster.retain(|p| p.socket_id != socket_id);
    roster.len() != before
}
