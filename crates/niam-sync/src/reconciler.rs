use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use niam_types::{ChangeEvent, ChangeOp, Message, MessageId, Payload, Room};

use crate::presence::PresenceAggregator;
use crate::session::Session;
use crate::store::{Store, Upsert};

/// Outcome of applying one change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Updated,
    Unchanged,
    Deleted,
    /// Insert for an id already held.
    Duplicate,
    /// Insert or update for a tombstoned id.
    DroppedTombstoned,
    /// Message for a room other than the active one.
    StaleRoom,
    Presence { changed: bool },
    Announcement { added: bool },
}

/// The single path from change events to the store.
pub struct Reconciler {
    store: Arc<Store>,
    presence: Arc<PresenceAggregator>,
    session: Arc<Session>,
    /// Messages already counted toward each room's unread badge.
    counted: Mutex<HashMap<Room, HashSet<MessageId>>>,
}

impl Reconciler {
    pub fn new(store: Arc<Store>, presence: Arc<PresenceAggregator>, session: Arc<Session>) -> Self {
        Self {
            store,
            presence,
            session,
            counted: Mutex::new(HashMap::new()),
        }
    }

    pub fn apply(&self, event: ChangeEvent) -> Applied {
        let op = event.op;
        match event.payload {
            Payload::Message(msg) => self.apply_message(op, msg),
            Payload::User(mut record) => {
                if op == ChangeOp::Delete {
                    record.online = false;
                    record.typing = false;
                }
                Applied::Presence {
                    changed: self.presence.apply(record),
                }
            }
            Payload::Announcement(announcement) => Applied::Announcement {
                added: self.store.add_announcement(announcement),
            },
        }
    }

    fn apply_message(&self, op: ChangeOp, msg: Message) -> Applied {
        let active = self.session.active_room();
        if msg.room != active {
            return self.apply_stale(op, msg);
        }

        match op {
            ChangeOp::Insert => match self.store.insert_message(msg) {
                Upsert::Inserted => Applied::Inserted,
                Upsert::Tombstoned => Applied::Deleted,
                Upsert::Ignored => Applied::DroppedTombstoned,
                _ => Applied::Duplicate,
            },
            ChangeOp::Update => match self.store.upsert_message(msg) {
                Upsert::Inserted | Upsert::Replaced => Applied::Updated,
                Upsert::Unchanged | Upsert::Held => Applied::Unchanged,
                Upsert::Tombstoned => Applied::Deleted,
                Upsert::Ignored => Applied::DroppedTombstoned,
            },
            ChangeOp::Delete => self.tombstone(msg),
        }
    }

    /// Other-room events only tombstone what is already held and feed the unread counter.
    fn apply_stale(&self, op: ChangeOp, msg: Message) -> Applied {
        let id = msg.id;
        let room = msg.room;

        if op == ChangeOp::Delete || msg.deleted {
            if self.store.contains(id) {
                self.store.mark_deleted(id);
            }
            return Applied::StaleRoom;
        }

        let from_other_user = msg.sender_id != self.session.user().id;
        if op == ChangeOp::Insert && from_other_user && !self.store.contains(id) {
            let first_sighting = self
                .counted
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .entry(room)
                .or_default()
                .insert(id);
            if first_sighting {
                let count = self.store.bump_unread(room);
                trace!("Unread in {} now {}", room, count);
            }
        }
        Applied::StaleRoom
    }

    /// Zero `room`'s badge and forget what was counted toward it.
    pub fn reset_unread(&self, room: Room) {
        self.counted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&room);
        self.store.clear_unread(room);
    }

    fn tombstone(&self, mut msg: Message) -> Applied {
        if self.store.mark_deleted(msg.id) {
            return Applied::Deleted;
        }
        if self.store.contains(msg.id) {
            return Applied::Unchanged;
        }
        // Keep a tombstone for ids deleted before we saw them.
        msg.deleted = true;
        self.store.upsert_message(msg);
        Applied::Deleted
    }

    /// Drain the event channel until every sender is gone or shutdown is signalled.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ChangeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let entity = event.entity();
                    let outcome = self.apply(event);
                    debug!("Reconciled {} event: {:?}", entity, outcome);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use niam_types::{LocalUser, Role, Room};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    const ME: u128 = 500;

    fn setup(room: Room) -> (Reconciler, Arc<Store>, Arc<Session>) {
        let store = Arc::new(Store::new());
        let session = Arc::new(Session::new(
            LocalUser {
                id: Uuid::from_u128(ME),
                username: "me".into(),
                display_name: "me".into(),
                role: Role::Owner,
            },
            room,
        ));
        let presence = Arc::new(PresenceAggregator::new(store.clone(), Uuid::from_u128(ME)));
        (
            Reconciler::new(store.clone(), presence, session.clone()),
            store,
            session,
        )
    }

    fn msg(id: u128, room: Room, sender: u128) -> Message {
        Message {
            id: Uuid::from_u128(id),
            room,
            sender_id: Uuid::from_u128(sender),
            sender_display_name: "someone".into(),
            text: "hello".into(),
            timestamp: Utc.timestamp_opt(1_714_557_600 + id as i64, 0).unwrap(),
            likes: BTreeSet::new(),
            dislikes: BTreeSet::new(),
            reply_to_id: None,
            image_ref: None,
            deleted: false,
        }
    }

    #[test]
    fn insert_twice_equals_insert_once() {
        let (rec, store, _) = setup(Room::Public);
        let event = ChangeEvent::message(ChangeOp::Insert, msg(1, Room::Public, 2));

        assert_eq!(rec.apply(event.clone()), Applied::Inserted);
        let once = store.list_visible(Room::Public);
        assert_eq!(rec.apply(event), Applied::Duplicate);
        assert_eq!(store.list_visible(Room::Public), once);
    }

    #[test]
    fn insert_does_not_overwrite_but_update_does() {
        let (rec, store, _) = setup(Room::Public);
        rec.apply(ChangeEvent::message(ChangeOp::Insert, msg(1, Room::Public, 2)));

        let mut edited = msg(1, Room::Public, 2);
        edited.likes.insert(Uuid::from_u128(7));
        assert_eq!(
            rec.apply(ChangeEvent::message(ChangeOp::Insert, edited.clone())),
            Applied::Duplicate
        );
        assert!(store.get(edited.id).unwrap().likes.is_empty());

        assert_eq!(
            rec.apply(ChangeEvent::message(ChangeOp::Update, edited.clone())),
            Applied::Updated
        );
        assert_eq!(
            rec.apply(ChangeEvent::message(ChangeOp::Update, edited.clone())),
            Applied::Unchanged
        );
        assert_eq!(store.get(edited.id).unwrap(), edited);
    }

    #[test]
    fn delete_dominates_later_events() {
        let (rec, store, _) = setup(Room::Public);
        let m = msg(1, Room::Public, 2);

        // Delete first, before the id was ever seen.
        assert_eq!(
            rec.apply(ChangeEvent::message(ChangeOp::Delete, m.clone())),
            Applied::Deleted
        );
        for op in [ChangeOp::Insert, ChangeOp::Update, ChangeOp::Insert] {
            assert_eq!(
                rec.apply(ChangeEvent::message(op, m.clone())),
                Applied::DroppedTombstoned
            );
        }
        assert!(store.list_visible(Room::Public).is_empty());

        // And after it was seen.
        let other = msg(2, Room::Public, 2);
        rec.apply(ChangeEvent::message(ChangeOp::Insert, other.clone()));
        rec.apply(ChangeEvent::message(ChangeOp::Delete, other.clone()));
        rec.apply(ChangeEvent::message(ChangeOp::Update, other));
        assert!(store.list_visible(Room::Public).is_empty());
    }

    #[test]
    fn update_carrying_tombstone_deletes() {
        let (rec, store, _) = setup(Room::Public);
        let mut m = msg(1, Room::Public, 2);
        rec.apply(ChangeEvent::message(ChangeOp::Insert, m.clone()));
        m.deleted = true;
        assert_eq!(rec.apply(ChangeEvent::message(ChangeOp::Update, m)), Applied::Deleted);
        assert!(store.list_visible(Room::Public).is_empty());
    }

    #[test]
    fn stale_room_is_isolated_but_counts_unread_once() {
        let (rec, store, _) = setup(Room::Public);
        rec.apply(ChangeEvent::message(ChangeOp::Insert, msg(1, Room::Public, 2)));
        let before = store.list_visible(Room::Public);

        let admin = msg(2, Room::Admin, 3);
        assert_eq!(
            rec.apply(ChangeEvent::message(ChangeOp::Insert, admin.clone())),
            Applied::StaleRoom
        );
        assert_eq!(
            rec.apply(ChangeEvent::message(ChangeOp::Insert, admin)),
            Applied::StaleRoom
        );
        // Own messages never count.
        rec.apply(ChangeEvent::message(ChangeOp::Insert, msg(3, Room::Admin, ME)));

        assert_eq!(store.list_visible(Room::Public), before);
        assert!(store.list_visible(Room::Admin).is_empty());
        assert_eq!(store.unread(Room::Admin), 1);
    }

    #[test]
    fn reset_unread_clears_badge_and_counted_ids() {
        let (rec, store, _) = setup(Room::Public);
        let admin = msg(1, Room::Admin, 3);
        rec.apply(ChangeEvent::message(ChangeOp::Insert, admin.clone()));
        assert_eq!(store.unread(Room::Admin), 1);

        rec.reset_unread(Room::Admin);
        assert_eq!(store.unread(Room::Admin), 0);
        assert!(rec.counted.lock().unwrap().is_empty());

        rec.apply(ChangeEvent::message(ChangeOp::Insert, admin));
        assert_eq!(store.unread(Room::Admin), 1);
    }

    #[test]
    fn concurrent_inserts_of_one_id_keep_a_single_version() {
        let (rec, store, _) = setup(Room::Public);
        let rec = Arc::new(rec);

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let rec = rec.clone();
                std::thread::spawn(move || {
                    let mut m = msg(1, Room::Public, 2);
                    m.text = format!("version {}", n);
                    rec.apply(ChangeEvent::message(ChangeOp::Insert, m))
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let inserted = outcomes.iter().filter(|o| **o == Applied::Inserted).count();
        let duplicates = outcomes.iter().filter(|o| **o == Applied::Duplicate).count();
        assert_eq!((inserted, duplicates), (1, 7));
        assert_eq!(store.list_visible(Room::Public).len(), 1);
    }

    #[test]
    fn events_follow_room_switch() {
        let (rec, store, session) = setup(Room::Public);
        session.set_active_room(Room::Admin);

        let m = msg(1, Room::Admin, 2);
        assert_eq!(rec.apply(ChangeEvent::message(ChangeOp::Insert, m)), Applied::Inserted);
        assert_eq!(
            rec.apply(ChangeEvent::message(ChangeOp::Insert, msg(2, Room::Public, 2))),
            Applied::StaleRoom
        );
        assert_eq!(store.list_visible(Room::Admin).len(), 1);
        assert!(store.list_visible(Room::Public).is_empty());
    }

    #[test]
    fn stale_delete_still_tombstones_held_message() {
        let (rec, store, session) = setup(Room::Admin);
        let m = msg(1, Room::Admin, 2);
        rec.apply(ChangeEvent::message(ChangeOp::Insert, m.clone()));

        session.set_active_room(Room::Public);
        rec.apply(ChangeEvent::message(ChangeOp::Delete, m.clone()));
        assert!(store.is_tombstoned(m.id));
        assert!(store.list_visible(Room::Admin).is_empty());
    }

    #[test]
    fn like_dislike_exclusivity_survives_toggle_sequences() {
        let (rec, store, _) = setup(Room::Public);
        let me = Uuid::from_u128(ME);
        let mut m = msg(1, Room::Public, 2);
        rec.apply(ChangeEvent::message(ChangeOp::Insert, m.clone()));

        for step in 0..12 {
            if step % 2 == 0 || step % 5 == 0 {
                m.toggle_like(me);
            } else {
                m.toggle_dislike(me);
            }
            rec.apply(ChangeEvent::message(ChangeOp::Update, m.clone()));
            let held = store.get(m.id).unwrap();
            assert!(!(held.likes.contains(&me) && held.dislikes.contains(&me)));
        }
    }
}
