use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use niam_types::{Announcement, Message, MessageId, PresenceRecord, Room, UserId};

/// Notification fired after a Store mutation, for selective re-render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Messages { room: Room, ids: Vec<MessageId> },
    Presence { user_ids: Vec<UserId> },
    Unread { room: Room, count: usize },
    Announcement { id: Uuid },
}

/// What [`Store::upsert_message`] or [`Store::insert_message`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
    Unchanged,
    /// The entry is now (or was inserted as) a tombstone.
    Tombstoned,
    /// The existing entry is a tombstone; nothing changed.
    Ignored,
    /// [`Store::insert_message`] only: a live entry with this id is already held.
    Held,
}

/// Visible messages of one calendar day (UTC).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateGroup {
    pub date: NaiveDate,
    pub messages: Vec<Message>,
}

#[derive(Default)]
struct StoreInner {
    messages: HashMap<MessageId, Message>,
    /// Per-room (timestamp, id) keys, kept sorted ascending.
    order: HashMap<Room, Vec<(DateTime<Utc>, MessageId)>>,
    presence: HashMap<UserId, PresenceRecord>,
    unread: HashMap<Room, usize>,
    announcements: Vec<Announcement>,
}

impl StoreInner {
    fn index_insert(&mut self, room: Room, key: (DateTime<Utc>, MessageId)) {
        let keys = self.order.entry(room).or_default();
        if let Err(pos) = keys.binary_search(&key) {
            keys.insert(pos, key);
        }
    }

    fn index_remove(&mut self, room: Room, key: (DateTime<Utc>, MessageId)) {
        if let Some(keys) = self.order.get_mut(&room) {
            if let Ok(pos) = keys.binary_search(&key) {
                keys.remove(pos);
            }
        }
    }
}

/// Local view of messages and presence. Every method takes the lock for
/// one synchronous read-modify-write and notifies observers after releasing it.
pub struct Store {
    inner: Mutex<StoreInner>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(StoreInner::default()),
            changes,
        }
    }

    /// Observe mutations. Slow receivers see `Lagged` rather than blocking writers.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A panic mid-update leaves plain data behind; keep serving it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, change: StoreChange) {
        let _ = self.changes.send(change);
    }

    // -- Messages --

    /// Insert `msg`, or replace the entry with the same id. A tombstone is
    /// never revived, and an incoming tombstone always wins.
    pub fn upsert_message(&self, msg: Message) -> Upsert {
        let room = msg.room;
        let id = msg.id;
        let outcome = {
            let mut inner = self.lock();
            match inner.messages.get(&id).cloned() {
                None => {
                    inner.index_insert(room, (msg.timestamp, id));
                    let deleted = msg.deleted;
                    inner.messages.insert(id, msg);
                    if deleted { Upsert::Tombstoned } else { Upsert::Inserted }
                }
                Some(existing) if existing.deleted => Upsert::Ignored,
                Some(existing) if existing == msg => Upsert::Unchanged,
                Some(existing) => {
                    if existing.room != msg.room || existing.timestamp != msg.timestamp {
                        inner.index_remove(existing.room, (existing.timestamp, id));
                        inner.index_insert(msg.room, (msg.timestamp, id));
                    }
                    let deleted = msg.deleted;
                    inner.messages.insert(id, msg);
                    if deleted { Upsert::Tombstoned } else { Upsert::Replaced }
                }
            }
        };

        if !matches!(outcome, Upsert::Unchanged | Upsert::Ignored) {
            self.notify(StoreChange::Messages { room, ids: vec![id] });
        }
        outcome
    }

    /// Insert `msg` unless its id is already held. The check and the insert
    /// happen under one lock, so concurrent inserts of one id keep the first.
    pub fn insert_message(&self, msg: Message) -> Upsert {
        let room = msg.room;
        let id = msg.id;
        let outcome = {
            let mut inner = self.lock();
            match inner.messages.get(&id) {
                Some(existing) if existing.deleted => return Upsert::Ignored,
                Some(_) => return Upsert::Held,
                None => {
                    inner.index_insert(room, (msg.timestamp, id));
                    let deleted = msg.deleted;
                    inner.messages.insert(id, msg);
                    if deleted { Upsert::Tombstoned } else { Upsert::Inserted }
                }
            }
        };
        self.notify(StoreChange::Messages { room, ids: vec![id] });
        outcome
    }

    /// Tombstone `id`. Returns false if absent or already tombstoned.
    pub fn mark_deleted(&self, id: MessageId) -> bool {
        let room = {
            let mut inner = self.lock();
            match inner.messages.get_mut(&id) {
                Some(msg) if !msg.deleted => {
                    msg.deleted = true;
                    msg.room
                }
                _ => return false,
            }
        };
        self.notify(StoreChange::Messages { room, ids: vec![id] });
        true
    }

    /// Any entry with this id, tombstones included.
    pub fn get(&self, id: MessageId) -> Option<Message> {
        self.lock().messages.get(&id).cloned()
    }

    pub fn get_visible(&self, id: MessageId) -> Option<Message> {
        self.get(id).filter(|m| !m.deleted)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.lock().messages.contains_key(&id)
    }

    pub fn is_tombstoned(&self, id: MessageId) -> bool {
        self.lock().messages.get(&id).is_some_and(|m| m.deleted)
    }

    /// Non-deleted messages of `room`, oldest first.
    pub fn list_visible(&self, room: Room) -> Vec<Message> {
        let inner = self.lock();
        inner
            .order
            .get(&room)
            .map(|keys| {
                keys.iter()
                    .filter_map(|(_, id)| inner.messages.get(id))
                    .filter(|m| !m.deleted)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list_visible_by_date(&self, room: Room) -> Vec<DateGroup> {
        group_by_date(self.list_visible(room))
    }

    /// The visible message `id` replies to; `None` for dangling or deleted targets.
    pub fn reply_target(&self, id: MessageId) -> Option<Message> {
        let inner = self.lock();
        let target = inner.messages.get(&id)?.reply_to_id?;
        inner.messages.get(&target).filter(|m| !m.deleted).cloned()
    }

    // -- Presence --

    /// Returns false if the stored record was already identical.
    pub fn upsert_presence(&self, record: PresenceRecord) -> bool {
        let user_id = record.user_id;
        {
            let mut inner = self.lock();
            if inner.presence.get(&user_id) == Some(&record) {
                return false;
            }
            inner.presence.insert(user_id, record);
        }
        self.notify(StoreChange::Presence {
            user_ids: vec![user_id],
        });
        true
    }

    pub fn remove_presence(&self, user_id: UserId) -> Option<PresenceRecord> {
        let removed = self.lock().presence.remove(&user_id);
        if removed.is_some() {
            self.notify(StoreChange::Presence {
                user_ids: vec![user_id],
            });
        }
        removed
    }

    pub fn presence(&self, user_id: UserId) -> Option<PresenceRecord> {
        self.lock().presence.get(&user_id).cloned()
    }

    pub fn presence_records(&self) -> Vec<PresenceRecord> {
        self.lock().presence.values().cloned().collect()
    }

    // -- Room counters --

    pub fn bump_unread(&self, room: Room) -> usize {
        let count = {
            let mut inner = self.lock();
            let count = inner.unread.entry(room).or_default();
            *count += 1;
            *count
        };
        self.notify(StoreChange::Unread { room, count });
        count
    }

    pub fn clear_unread(&self, room: Room) {
        let had = self.lock().unread.remove(&room).unwrap_or(0);
        if had > 0 {
            self.notify(StoreChange::Unread { room, count: 0 });
        }
    }

    pub fn unread(&self, room: Room) -> usize {
        self.lock().unread.get(&room).copied().unwrap_or(0)
    }

    // -- Announcements --

    /// Returns false for an announcement already held.
    pub fn add_announcement(&self, announcement: Announcement) -> bool {
        let id = announcement.id;
        {
            let mut inner = self.lock();
            if inner.announcements.iter().any(|a| a.id == id) {
                return false;
            }
            let pos = inner
                .announcements
                .partition_point(|a| a.created_at <= announcement.created_at);
            inner.announcements.insert(pos, announcement);
        }
        self.notify(StoreChange::Announcement { id });
        true
    }

    pub fn announcements(&self) -> Vec<Announcement> {
        self.lock().announcements.clone()
    }
}

/// Group an ascending message list by UTC calendar date.
pub fn group_by_date(messages: Vec<Message>) -> Vec<DateGroup> {
    let mut groups: Vec<DateGroup> = Vec::new();
    for msg in messages {
        let date = msg.timestamp.date_naive();
        match groups.last_mut() {
            Some(group) if group.date == date => group.messages.push(msg),
            _ => groups.push(DateGroup {
                date,
                messages: vec![msg],
            }),
        }
    }
    groups
}

/// Unread badge text: empty for zero, capped at "99+".
pub fn badge_text(count: usize) -> String {
    match count {
        0 => String::new(),
        1..=99 => count.to_string(),
        _ => "99+".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn msg(id: u128, room: Room, secs: i64) -> Message {
        Message {
            id: Uuid::from_u128(id),
            room,
            sender_id: Uuid::from_u128(100),
            sender_display_name: "alice".into(),
            text: format!("m{}", id),
            timestamp: Utc.timestamp_opt(1_714_557_600 + secs, 0).unwrap(),
            likes: BTreeSet::new(),
            dislikes: BTreeSet::new(),
            reply_to_id: None,
            image_ref: None,
            deleted: false,
        }
    }

    fn ids(messages: &[Message]) -> Vec<u128> {
        messages.iter().map(|m| m.id.as_u128()).collect()
    }

    #[test]
    fn keeps_ascending_order_regardless_of_arrival() {
        let store = Store::new();
        store.upsert_message(msg(3, Room::Public, 30));
        store.upsert_message(msg(1, Room::Public, 10));
        store.upsert_message(msg(2, Room::Public, 20));
        store.upsert_message(msg(9, Room::Admin, 0));

        assert_eq!(ids(&store.list_visible(Room::Public)), vec![1, 2, 3]);
        assert_eq!(ids(&store.list_visible(Room::Admin)), vec![9]);
    }

    #[test]
    fn replacing_with_new_timestamp_repositions() {
        let store = Store::new();
        store.upsert_message(msg(1, Room::Public, 10));
        store.upsert_message(msg(2, Room::Public, 20));

        let mut moved = msg(1, Room::Public, 30);
        moved.text = "edited".into();
        assert_eq!(store.upsert_message(moved), Upsert::Replaced);
        assert_eq!(ids(&store.list_visible(Room::Public)), vec![2, 1]);
    }

    #[test]
    fn same_upsert_twice_is_unchanged() {
        let store = Store::new();
        let mut rx = store.subscribe();
        assert_eq!(store.upsert_message(msg(1, Room::Public, 0)), Upsert::Inserted);
        assert_eq!(store.upsert_message(msg(1, Room::Public, 0)), Upsert::Unchanged);

        assert_eq!(
            rx.try_recv().unwrap(),
            StoreChange::Messages {
                room: Room::Public,
                ids: vec![Uuid::from_u128(1)]
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn tombstones_are_final() {
        let store = Store::new();
        store.upsert_message(msg(1, Room::Public, 0));
        assert!(store.mark_deleted(Uuid::from_u128(1)));
        assert!(!store.mark_deleted(Uuid::from_u128(1)));
        assert!(!store.mark_deleted(Uuid::from_u128(2)));

        assert_eq!(store.upsert_message(msg(1, Room::Public, 0)), Upsert::Ignored);
        assert!(store.list_visible(Room::Public).is_empty());
        assert!(store.contains(Uuid::from_u128(1)));
    }

    #[test]
    fn insert_keeps_the_first_version() {
        let store = Store::new();
        let first = msg(1, Room::Public, 0);
        let mut second = first.clone();
        second.text = "second".into();

        assert_eq!(store.insert_message(first.clone()), Upsert::Inserted);
        assert_eq!(store.insert_message(second), Upsert::Held);
        assert_eq!(store.get(first.id), Some(first.clone()));

        store.mark_deleted(first.id);
        assert_eq!(store.insert_message(first), Upsert::Ignored);
    }

    #[test]
    fn reply_target_tolerates_dangling_and_deleted() {
        let store = Store::new();
        let parent = msg(1, Room::Public, 0);
        let mut reply = msg(2, Room::Public, 10);
        reply.reply_to_id = Some(parent.id);
        let mut orphan = msg(3, Room::Public, 20);
        orphan.reply_to_id = Some(Uuid::from_u128(42));

        store.upsert_message(parent.clone());
        store.upsert_message(reply.clone());
        store.upsert_message(orphan.clone());

        assert_eq!(store.reply_target(reply.id).map(|m| m.id), Some(parent.id));
        assert!(store.reply_target(orphan.id).is_none());

        store.mark_deleted(parent.id);
        assert!(store.reply_target(reply.id).is_none());
    }

    #[test]
    fn groups_by_calendar_date() {
        let store = Store::new();
        store.upsert_message(msg(1, Room::Public, 0));
        store.upsert_message(msg(2, Room::Public, 60));
        store.upsert_message(msg(3, Room::Public, 86_400));

        let groups = store.list_visible_by_date(Room::Public);
        assert_eq!(groups.len(), 2);
        assert_eq!(ids(&groups[0].messages), vec![1, 2]);
        assert_eq!(ids(&groups[1].messages), vec![3]);
    }

    #[test]
    fn badge_caps_at_99() {
        assert_eq!(badge_text(0), "");
        assert_eq!(badge_text(7), "7");
        assert_eq!(badge_text(99), "99");
        assert_eq!(badge_text(100), "99+");
    }

    #[test]
    fn announcements_dedupe_and_sort() {
        let store = Store::new();
        let at = |secs: i64| Utc.timestamp_opt(1_714_557_600 + secs, 0).unwrap();
        let a = Announcement {
            id: Uuid::from_u128(1),
            author_id: None,
            author_name: "owner".into(),
            text: "later".into(),
            created_at: at(100),
        };
        let b = Announcement {
            id: Uuid::from_u128(2),
            created_at: at(0),
            text: "earlier".into(),
            ..a.clone()
        };

        assert!(store.add_announcement(a.clone()));
        assert!(store.add_announcement(b));
        assert!(!store.add_announcement(a));

        let texts: Vec<_> = store.announcements().into_iter().map(|a| a.text).collect();
        assert_eq!(texts, vec!["earlier", "later"]);
    }
}
