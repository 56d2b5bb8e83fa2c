use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use niam_types::records::{decode_message, decode_user};
use niam_types::remote::{Filter, Order, RemoteStore};
use niam_types::{ChangeEvent, ChangeOp, Entity, Message, PresenceRecord, RemoteError};

use crate::config::{PollMode, tick_period};
use crate::feed::FeedState;
use crate::session::Session;
use crate::store::Store;

/// The event a snapshot row warrants, or `None` if the store already agrees.
/// A tombstoned row becomes a delete unless the store already holds a tombstone.
pub fn diff_message(store: &Store, msg: &Message) -> Option<ChangeOp> {
    match store.get(msg.id) {
        Some(held) if held.deleted => None,
        _ if msg.deleted => Some(ChangeOp::Delete),
        None => Some(ChangeOp::Insert),
        Some(held) if held.same_content(msg) => None,
        Some(_) => Some(ChangeOp::Update),
    }
}

pub fn diff_presence(store: &Store, record: &PresenceRecord) -> Option<ChangeOp> {
    match store.presence(record.user_id) {
        None => Some(ChangeOp::Insert),
        Some(held) if held.same_presence(record) => None,
        Some(_) => Some(ChangeOp::Update),
    }
}

/// Periodically snapshots the remote and emits events for what the store is missing.
pub struct Poller {
    remote: Arc<dyn RemoteStore>,
    store: Arc<Store>,
    session: Arc<Session>,
    events: mpsc::UnboundedSender<ChangeEvent>,
    poll_limit: u32,
    mode: PollMode,
}

impl Poller {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<Store>,
        session: Arc<Session>,
        events: mpsc::UnboundedSender<ChangeEvent>,
        poll_limit: u32,
        mode: PollMode,
    ) -> Self {
        Self {
            remote,
            store,
            session,
            events,
            poll_limit,
            mode,
        }
    }

    fn emit(&self, event: ChangeEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Newest `poll_limit` messages of the active room, tombstones included,
    /// emitted oldest first. Returns the number of events emitted.
    pub async fn poll_messages(&self) -> Result<usize, RemoteError> {
        let room = self.session.active_room();
        let rows = self
            .remote
            .query(
                Entity::Messages,
                &Filter::room(room),
                Order::Descending,
                Some(self.poll_limit),
            )
            .await?;

        // A snapshot of a room switched away from still goes through the
        // reconciler, which only counts it toward that room's unread badge.
        let mut emitted = 0;
        for value in rows.into_iter().rev() {
            let msg = match decode_message(value) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("Skipping malformed message row: {}", e);
                    continue;
                }
            };
            if let Some(op) = diff_message(&self.store, &msg) {
                if self.emit(ChangeEvent::message(op, msg)) {
                    emitted += 1;
                }
            }
        }
        Ok(emitted)
    }

    /// All online users. Anyone held as online but missing from the snapshot
    /// gets a synthetic offline update.
    pub async fn poll_users(&self) -> Result<usize, RemoteError> {
        let rows = self
            .remote
            .query(Entity::Users, &Filter::online(), Order::ByUsername, None)
            .await?;

        let mut seen = HashSet::new();
        let mut emitted = 0;
        for value in rows {
            let record = match decode_user(value) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping malformed user row: {}", e);
                    continue;
                }
            };
            seen.insert(record.user_id);
            if let Some(op) = diff_presence(&self.store, &record) {
                if self.emit(ChangeEvent::user(op, record)) {
                    emitted += 1;
                }
            }
        }

        for mut held in self.store.presence_records() {
            if held.online && !seen.contains(&held.user_id) {
                held.online = false;
                held.typing = false;
                if self.emit(ChangeEvent::user(ChangeOp::Update, held)) {
                    emitted += 1;
                }
            }
        }
        Ok(emitted)
    }

    async fn tick(&self, entity: Entity) {
        let result = match entity {
            Entity::Messages => self.poll_messages().await,
            Entity::Users => self.poll_users().await,
            Entity::Announcements => Ok(0),
        };
        match result {
            Ok(0) => {}
            Ok(n) => debug!("{} poll produced {} events", entity, n),
            Err(e) => warn!("{} poll failed: {}", entity, e),
        }
    }

    /// Tick `entity` every `interval` until shutdown. A feed dropping to
    /// DISCONNECTED triggers an immediate extra tick.
    pub async fn run(
        self: Arc<Self>,
        entity: Entity,
        interval: Duration,
        mut feed: watch::Receiver<FeedState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(tick_period(interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut feed_alive = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.mode == PollMode::Fallback && *feed.borrow() == FeedState::Subscribed {
                        trace!("{} feed subscribed; skipping poll", entity);
                        continue;
                    }
                    self.tick(entity).await;
                }
                changed = feed.changed(), if feed_alive => {
                    if changed.is_err() {
                        feed_alive = false;
                        continue;
                    }
                    let state = *feed.borrow_and_update();
                    if state == FeedState::Disconnected {
                        debug!("{} feed disconnected; polling now", entity);
                        self.tick(entity).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("{} poller stopped", entity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use niam_types::{Role, Room};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn msg(id: u128) -> Message {
        Message {
            id: Uuid::from_u128(id),
            room: Room::Public,
            sender_id: Uuid::from_u128(2),
            sender_display_name: "bob".into(),
            text: "hey".into(),
            timestamp: Utc.timestamp_opt(1_714_557_600, 0).unwrap(),
            likes: BTreeSet::new(),
            dislikes: BTreeSet::new(),
            reply_to_id: None,
            image_ref: None,
            deleted: false,
        }
    }

    #[test]
    fn diff_skips_identical_and_tombstoned() {
        let store = Store::new();
        let m = msg(1);
        assert_eq!(diff_message(&store, &m), Some(ChangeOp::Insert));

        store.upsert_message(m.clone());
        assert_eq!(diff_message(&store, &m), None);

        let mut liked = m.clone();
        liked.toggle_like(Uuid::from_u128(9));
        assert_eq!(diff_message(&store, &liked), Some(ChangeOp::Update));

        let mut gone = m.clone();
        gone.deleted = true;
        assert_eq!(diff_message(&store, &gone), Some(ChangeOp::Delete));

        store.mark_deleted(m.id);
        assert_eq!(diff_message(&store, &liked), None);
        assert_eq!(diff_message(&store, &gone), None);
    }

    #[test]
    fn unseen_tombstone_row_becomes_a_delete() {
        let store = Store::new();
        let mut m = msg(1);
        m.deleted = true;
        assert_eq!(diff_message(&store, &m), Some(ChangeOp::Delete));
    }

    #[test]
    fn presence_diff_ignores_last_seen_only_changes() {
        let store = Store::new();
        let rec = PresenceRecord {
            user_id: Uuid::from_u128(1),
            username: "alice".into(),
            display_name: "Alice".into(),
            role: Role::User,
            online: true,
            typing: false,
            last_seen: Utc::now(),
        };
        assert_eq!(diff_presence(&store, &rec), Some(ChangeOp::Insert));
        store.upsert_presence(rec.clone());

        let mut later = rec.clone();
        later.last_seen = rec.last_seen + chrono::Duration::seconds(30);
        assert_eq!(diff_presence(&store, &later), None);

        later.typing = true;
        assert_eq!(diff_presence(&store, &later), Some(ChangeOp::Update));
    }
}
