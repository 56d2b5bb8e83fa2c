use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use niam_types::{PresenceRecord, UserId};

use crate::store::Store;

#[derive(Default)]
struct PresenceSets {
    online: BTreeSet<UserId>,
    typing: BTreeSet<UserId>,
}

/// Derives the online and typing sets from user record updates.
pub struct PresenceAggregator {
    store: Arc<Store>,
    local_user: UserId,
    sets: Mutex<PresenceSets>,
}

impl PresenceAggregator {
    pub fn new(store: Arc<Store>, local_user: UserId) -> Self {
        Self {
            store,
            local_user,
            sets: Mutex::new(PresenceSets::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PresenceSets> {
        self.sets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fold one user record into the store and the derived sets.
    /// Returns true if anything observable changed.
    pub fn apply(&self, mut record: PresenceRecord) -> bool {
        // Typing is only meaningful while online.
        record.typing &= record.online;

        let user_id = record.user_id;
        let sets_changed = {
            let mut sets = self.lock();
            if record.online {
                let mut changed = sets.online.insert(user_id);
                changed |= if record.typing {
                    sets.typing.insert(user_id)
                } else {
                    sets.typing.remove(&user_id)
                };
                changed
            } else {
                let was_online = sets.online.remove(&user_id);
                sets.typing.remove(&user_id) || was_online
            }
        };

        debug!(
            "User update: {} online: {} typing: {}",
            record.username, record.online, record.typing
        );

        // The record stays in the store when the user goes offline.
        let record_changed = self.store.upsert_presence(record);
        sets_changed || record_changed
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.lock().online.contains(&user_id)
    }

    pub fn online_ids(&self) -> Vec<UserId> {
        self.lock().online.iter().copied().collect()
    }

    pub fn typing_ids(&self) -> Vec<UserId> {
        self.lock().typing.iter().copied().collect()
    }

    /// Online users, sorted by username.
    pub fn online_users(&self) -> Vec<PresenceRecord> {
        let mut users: Vec<_> = self
            .online_ids()
            .into_iter()
            .filter_map(|id| self.store.presence(id))
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    /// Other users currently typing, in user id order.
    pub fn typing_users(&self) -> Vec<PresenceRecord> {
        self.typing_ids()
            .into_iter()
            .filter(|id| *id != self.local_user)
            .filter_map(|id| self.store.presence(id))
            .collect()
    }

    pub fn typing_text(&self) -> Option<String> {
        let users = self.typing_users();
        let names: Vec<&str> = users.iter().map(PresenceRecord::shown_name).collect();
        format_typing(&names)
    }
}

/// Typing indicator text for an ordered list of names; `None` hides the indicator.
pub fn format_typing(names: &[&str]) -> Option<String> {
    match names {
        [] => None,
        [one] => Some(format!("{} is typing...", one)),
        [first, second] => Some(format!("{} and {} are typing...", first, second)),
        many => Some(format!("{} people are typing...", many.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use niam_types::Role;
    use uuid::Uuid;

    fn record(id: u128, name: &str, online: bool, typing: bool) -> PresenceRecord {
        PresenceRecord {
            user_id: Uuid::from_u128(id),
            username: name.into(),
            display_name: name.into(),
            role: Role::User,
            online,
            typing,
            last_seen: Utc::now(),
        }
    }

    fn aggregator() -> PresenceAggregator {
        PresenceAggregator::new(Arc::new(Store::new()), Uuid::from_u128(999))
    }

    #[test]
    fn typing_text_forms() {
        assert_eq!(format_typing(&[]), None);
        assert_eq!(format_typing(&["alice"]).unwrap(), "alice is typing...");
        assert_eq!(
            format_typing(&["alice", "bob"]).unwrap(),
            "alice and bob are typing..."
        );
        assert_eq!(
            format_typing(&["alice", "bob", "carol"]).unwrap(),
            "3 people are typing..."
        );
    }

    #[test]
    fn offline_clears_both_sets_but_keeps_record() {
        let agg = aggregator();
        agg.apply(record(1, "alice", true, true));
        assert!(agg.is_online(Uuid::from_u128(1)));
        assert_eq!(agg.typing_text().unwrap(), "alice is typing...");

        agg.apply(record(1, "alice", false, true));
        assert!(agg.online_ids().is_empty());
        assert!(agg.typing_ids().is_empty());
        assert!(agg.store.presence(Uuid::from_u128(1)).is_some());
    }

    #[test]
    fn typing_false_only_leaves_typing_set() {
        let agg = aggregator();
        agg.apply(record(1, "alice", true, true));
        agg.apply(record(2, "bob", true, true));
        assert_eq!(agg.typing_text().unwrap(), "alice and bob are typing...");

        agg.apply(record(2, "bob", true, false));
        assert_eq!(agg.online_ids().len(), 2);
        assert_eq!(agg.typing_text().unwrap(), "alice is typing...");
    }

    #[test]
    fn local_user_is_not_shown_typing() {
        let agg = aggregator();
        agg.apply(record(999, "me", true, true));
        agg.apply(record(3, "carol", true, true));
        assert_eq!(agg.typing_text().unwrap(), "carol is typing...");
    }

    #[test]
    fn repeated_update_reports_no_change() {
        let agg = aggregator();
        let rec = record(1, "alice", true, false);
        assert!(agg.apply(rec.clone()));
        assert!(!agg.apply(rec));
    }

    #[test]
    fn online_users_sorted_by_username() {
        let agg = aggregator();
        agg.apply(record(1, "zed", true, false));
        agg.apply(record(2, "amy", true, false));
        let names: Vec<_> = agg.online_users().into_iter().map(|u| u.username).collect();
        assert_eq!(names, vec!["amy", "zed"]);
    }
}
