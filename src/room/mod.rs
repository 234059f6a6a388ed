mod participant;
mod state;

pub(crate) use participant::{find_mut, remove, upsert_joined};
pub use participant::{MediaFlags, Participant};
pub use state::RoomContext;
