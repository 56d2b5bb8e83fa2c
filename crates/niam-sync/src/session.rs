use tokio::sync::watch;

use niam_types::{LocalUser, Room};

/// Per-login context shared by every component: who we are and which room is open.
pub struct Session {
    user: LocalUser,
    room_tx: watch::Sender<Room>,
}

impl Session {
    pub fn new(user: LocalUser, room: Room) -> Self {
        let (room_tx, _) = watch::channel(room);
        Self { user, room_tx }
    }

    pub fn user(&self) -> &LocalUser {
        &self.user
    }

    pub fn active_room(&self) -> Room {
        *self.room_tx.borrow()
    }

    /// Returns false if `room` was already active.
    pub fn set_active_room(&self, room: Room) -> bool {
        self.room_tx.send_if_modified(|current| {
            if *current == room {
                false
            } else {
                *current = room;
                true
            }
        })
    }

    pub fn watch_room(&self) -> watch::Receiver<Room> {
        self.room_tx.subscribe()
    }
}
