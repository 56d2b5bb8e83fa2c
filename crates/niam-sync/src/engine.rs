use std::sync::{Arc, Mutex};

use chrono::{SubsecRound, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use niam_types::records::{
    MessagePatch, decode_announcement, decode_message, decode_user, encode_message,
    validate_message_text,
};
use niam_types::remote::{Filter, Order, RemoteStore};
use niam_types::{
    Announcement, ChangeEvent, ChangeOp, Entity, LocalUser, Message, MessageId, PresenceRecord,
    RemoteError, Role, Room,
};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::feed::{FeedClient, FeedState};
use crate::heartbeat::LocalPresence;
use crate::poll::{Poller, diff_message, diff_presence};
use crate::presence::PresenceAggregator;
use crate::reconciler::Reconciler;
use crate::session::Session;
use crate::store::{DateGroup, Store, StoreChange};

/// Check a delete against local role state.
///
/// Owners may delete anything, admins anything not written by an owner, and
/// users only their own messages. `author_role` is `None` when the author's
/// role is not known locally; the remote has the final word then.
pub fn authorize_delete(
    user: &LocalUser,
    msg: &Message,
    author_role: Option<Role>,
) -> SyncResult<()> {
    if msg.sender_id == user.id {
        return Ok(());
    }
    match user.role {
        Role::Owner => Ok(()),
        Role::Admin if author_role != Some(Role::Owner) => Ok(()),
        Role::Admin => Err(SyncError::Authorization(
            "admins cannot delete an owner's message".into(),
        )),
        Role::User => Err(SyncError::Authorization(
            "you can only delete your own messages".into(),
        )),
    }
}

fn room_access(user: &LocalUser, room: Room) -> SyncResult<()> {
    if user.role.can_access(room) {
        Ok(())
    } else {
        Err(SyncError::Authorization(format!(
            "the {} room is for admins only",
            room
        )))
    }
}

/// The sync engine for one logged-in user.
///
/// Owns the store and every background task feeding it. All user actions
/// apply optimistically through the reconciler before the remote write.
pub struct ChatEngine {
    remote: Arc<dyn RemoteStore>,
    session: Arc<Session>,
    store: Arc<Store>,
    presence: Arc<PresenceAggregator>,
    reconciler: Arc<Reconciler>,
    local: Arc<LocalPresence>,
    poller: Arc<Poller>,
    feeds: Vec<Arc<FeedClient>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    history_limit: u32,
}

impl ChatEngine {
    /// Spawn the reconciler, feeds, pollers and heartbeat, then load the
    /// active room's history and the online users.
    pub async fn start(
        remote: Arc<dyn RemoteStore>,
        user: LocalUser,
        room: Room,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        room_access(&user, room)?;
        info!("Starting sync for {} ({}) in {}", user.username, user.role, room);

        let session = Arc::new(Session::new(user, room));
        let store = Arc::new(Store::new());
        let presence = Arc::new(PresenceAggregator::new(store.clone(), session.user().id));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            presence.clone(),
            session.clone(),
        ));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let local = Arc::new(LocalPresence::new(
            remote.clone(),
            session.clone(),
            events_tx.clone(),
            config.typing_idle,
            shutdown_rx.clone(),
        ));
        let poller = Arc::new(Poller::new(
            remote.clone(),
            store.clone(),
            session.clone(),
            events_tx.clone(),
            config.poll_limit,
            config.poll_mode,
        ));
        let feeds: Vec<Arc<FeedClient>> = Entity::ALL
            .iter()
            .map(|&entity| {
                Arc::new(FeedClient::new(
                    entity,
                    remote.clone(),
                    session.clone(),
                    events_tx.clone(),
                    config.reconnect_delay,
                ))
            })
            .collect();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            reconciler.clone().run(events_rx, shutdown_rx.clone()),
        ));
        for feed in &feeds {
            tasks.push(tokio::spawn(feed.clone().run(shutdown_rx.clone())));
        }

        if let Err(e) = local.announce().await {
            warn!("Failed to announce presence: {}", e);
        }

        let engine = Self {
            remote,
            session,
            store,
            presence,
            reconciler,
            local,
            poller,
            feeds,
            shutdown: shutdown_tx,
            tasks: Mutex::new(tasks),
            history_limit: config.history_limit,
        };

        if let Err(e) = engine.load_room(room).await {
            warn!("Failed to load history for {}: {}", room, e);
        }
        if let Err(e) = engine.load_presence().await {
            warn!("Failed to load online users: {}", e);
        }
        if let Err(e) = engine.load_announcements().await {
            warn!("Failed to load announcements: {}", e);
        }

        for (entity, interval) in [
            (Entity::Messages, config.message_poll_interval),
            (Entity::Users, config.user_poll_interval),
        ] {
            let feed_state = engine.watch_feed(entity);
            let handle = tokio::spawn(engine.poller.clone().run(
                entity,
                interval,
                feed_state,
                shutdown_rx.clone(),
            ));
            engine.track(handle);
        }
        let heartbeat = tokio::spawn(
            engine
                .local
                .clone()
                .run_heartbeat(config.heartbeat_interval, shutdown_rx),
        );
        engine.track(heartbeat);

        Ok(engine)
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if *self.shutdown.borrow() {
            Err(SyncError::Closed)
        } else {
            Ok(())
        }
    }

    fn feed(&self, entity: Entity) -> Option<&Arc<FeedClient>> {
        self.feeds.iter().find(|f| f.entity() == entity)
    }

    fn watch_feed(&self, entity: Entity) -> watch::Receiver<FeedState> {
        match self.feed(entity) {
            Some(feed) => feed.watch_state(),
            // Every entity has a feed; a closed receiver just never fires.
            None => watch::channel(FeedState::Closed).1,
        }
    }

    /// Newest `history_limit` messages of `room`, applied oldest first.
    /// Tombstone rows delete anything held that was removed while away.
    async fn load_room(&self, room: Room) -> Result<usize, RemoteError> {
        let rows = self
            .remote
            .query(
                Entity::Messages,
                &Filter::room(room),
                Order::Descending,
                Some(self.history_limit),
            )
            .await?;

        if self.session.active_room() != room {
            debug!("Left {} while loading its history", room);
            return Ok(0);
        }

        let mut loaded = 0;
        for value in rows.into_iter().rev() {
            match decode_message(value) {
                Ok(msg) => {
                    if let Some(op) = diff_message(&self.store, &msg) {
                        self.reconciler.apply(ChangeEvent::message(op, msg));
                        loaded += 1;
                    }
                }
                Err(e) => warn!("Skipping malformed message in history: {}", e),
            }
        }
        info!("Loaded {} messages for {}", loaded, room);
        Ok(loaded)
    }

    async fn load_presence(&self) -> Result<(), RemoteError> {
        let rows = self
            .remote
            .query(Entity::Users, &Filter::online(), Order::ByUsername, None)
            .await?;
        for value in rows {
            match decode_user(value) {
                Ok(record) => {
                    if let Some(op) = diff_presence(&self.store, &record) {
                        self.reconciler.apply(ChangeEvent::user(op, record));
                    }
                }
                Err(e) => warn!("Skipping malformed user row: {}", e),
            }
        }
        Ok(())
    }

    async fn load_announcements(&self) -> Result<(), RemoteError> {
        let rows = self
            .remote
            .query(Entity::Announcements, &Filter::default(), Order::Ascending, None)
            .await?;
        for value in rows {
            match decode_announcement(value) {
                Ok(a) => {
                    self.reconciler
                        .apply(ChangeEvent::announcement(ChangeOp::Insert, a));
                }
                Err(e) => warn!("Skipping malformed announcement: {}", e),
            }
        }
        Ok(())
    }

    // -- User actions --

    /// Validate, insert optimistically, then write to the remote. On failure the
    /// optimistic copy is tombstoned and the error returned.
    pub async fn send_message(
        &self,
        text: &str,
        reply_to: Option<MessageId>,
        image_ref: Option<String>,
    ) -> SyncResult<Message> {
        self.ensure_open()?;
        let image_ref = image_ref.filter(|s| !s.trim().is_empty());
        let text = validate_message_text(text, image_ref.is_some())?;

        let user = self.session.user();
        let room = self.session.active_room();
        room_access(user, room)?;

        let sender_display_name = if user.display_name.is_empty() {
            user.username.clone()
        } else {
            user.display_name.clone()
        };
        let msg = Message {
            id: Uuid::new_v4(),
            room,
            sender_id: user.id,
            sender_display_name,
            text,
            timestamp: Utc::now().trunc_subsecs(6),
            likes: Default::default(),
            dislikes: Default::default(),
            reply_to_id: reply_to,
            image_ref,
            deleted: false,
        };

        self.reconciler
            .apply(ChangeEvent::message(ChangeOp::Insert, msg.clone()));
        debug!("Sending message {} to {}", msg.id, room);

        match self.remote.insert(Entity::Messages, encode_message(&msg)).await {
            Ok(stored) => match decode_message(stored) {
                Ok(stored) => {
                    // The remote copy is authoritative for normalised fields.
                    self.reconciler
                        .apply(ChangeEvent::message(ChangeOp::Update, stored.clone()));
                    Ok(stored)
                }
                Err(e) => {
                    warn!("Remote returned an unreadable message: {}", e);
                    Ok(msg)
                }
            },
            Err(e) => {
                warn!("Failed to send message {}: {}", msg.id, e);
                self.store.mark_deleted(msg.id);
                Err(e.into())
            }
        }
    }

    pub async fn toggle_like(&self, id: MessageId) -> SyncResult<Message> {
        let me = self.session.user().id;
        self.react(id, |msg| msg.toggle_like(me)).await
    }

    pub async fn toggle_dislike(&self, id: MessageId) -> SyncResult<Message> {
        let me = self.session.user().id;
        self.react(id, |msg| msg.toggle_dislike(me)).await
    }

    async fn react(&self, id: MessageId, toggle: impl FnOnce(&mut Message)) -> SyncResult<Message> {
        self.ensure_open()?;
        let before = self.visible_in_active_room(id)?;
        let mut after = before.clone();
        toggle(&mut after);

        self.reconciler
            .apply(ChangeEvent::message(ChangeOp::Update, after.clone()));

        let patch = serde_json::to_value(MessagePatch::reactions(&after))
            .map_err(|e| SyncError::Remote(RemoteError::InvalidPayload(e.to_string())))?;
        match self
            .remote
            .update(Entity::Messages, &id.to_string(), patch)
            .await
        {
            Ok(stored) => {
                if let Ok(stored) = decode_message(stored) {
                    self.reconciler
                        .apply(ChangeEvent::message(ChangeOp::Update, stored));
                }
                Ok(self.store.get(id).unwrap_or(after))
            }
            Err(e) => {
                warn!("Failed to update reactions on {}: {}", id, e);
                // Roll back only if nothing newer landed meanwhile.
                if self.store.get(id).as_ref() == Some(&after) {
                    self.reconciler
                        .apply(ChangeEvent::message(ChangeOp::Update, before));
                }
                Err(e.into())
            }
        }
    }

    /// Tombstone locally, then remotely. A failed remote write leaves the
    /// local tombstone in place.
    pub async fn delete_message(&self, id: MessageId) -> SyncResult<()> {
        self.ensure_open()?;
        let msg = self.visible_in_active_room(id)?;
        let author_role = self.store.presence(msg.sender_id).map(|p| p.role);
        authorize_delete(self.session.user(), &msg, author_role)?;

        self.reconciler
            .apply(ChangeEvent::message(ChangeOp::Delete, msg));

        let patch = serde_json::to_value(MessagePatch::tombstone())
            .map_err(|e| SyncError::Remote(RemoteError::InvalidPayload(e.to_string())))?;
        self.remote
            .update(Entity::Messages, &id.to_string(), patch)
            .await
            .map_err(|e| {
                warn!("Failed to delete message {}: {}", id, e);
                SyncError::from(e)
            })?;
        info!("Deleted message {}", id);
        Ok(())
    }

    fn visible_in_active_room(&self, id: MessageId) -> SyncResult<Message> {
        let room = self.session.active_room();
        self.store
            .get_visible(id)
            .filter(|m| m.room == room)
            .ok_or(SyncError::NotFound(id))
    }

    /// Make `room` active: the messages feed resubscribes, its unread counter
    /// clears and its history loads. A no-op for the current room.
    pub async fn switch_room(&self, room: Room) -> SyncResult<()> {
        self.ensure_open()?;
        room_access(self.session.user(), room)?;
        if !self.session.set_active_room(room) {
            return Ok(());
        }
        info!("Switched to {}", room);
        self.reconciler.reset_unread(room);

        if let Err(e) = self.load_room(room).await {
            warn!("Failed to load history for {}: {}", room, e);
        }
        if let Err(e) = self.load_presence().await {
            warn!("Failed to load online users: {}", e);
        }
        Ok(())
    }

    // -- Typing and presence --

    pub fn note_keystroke(&self) {
        if self.ensure_open().is_ok() {
            self.local.note_keystroke();
        }
    }

    pub async fn set_typing(&self, typing: bool) -> SyncResult<()> {
        self.ensure_open()?;
        Ok(self.local.set_typing(typing).await?)
    }

    /// Re-assert online presence and catch up on anything missed meanwhile.
    pub async fn on_foreground(&self) -> SyncResult<()> {
        self.ensure_open()?;
        self.local.set_online(true).await?;
        if let Err(e) = self.poller.poll_messages().await {
            warn!("Catch-up poll failed: {}", e);
        }
        if let Err(e) = self.poller.poll_users().await {
            warn!("Catch-up poll failed: {}", e);
        }
        Ok(())
    }

    pub async fn on_background(&self) -> SyncResult<()> {
        self.ensure_open()?;
        Ok(self.local.set_online(false).await?)
    }

    /// Mark the user offline, then shut down. The offline write is awaited
    /// here but its failure does not prevent shutdown.
    pub async fn logout(&self) -> SyncResult<()> {
        self.ensure_open()?;
        let offline = self.local.set_online(false).await;
        self.stop().await;
        offline.map_err(SyncError::from)
    }

    /// Close the feeds, stop pollers and heartbeat, and fire an offline write
    /// without waiting for it.
    pub async fn shutdown(&self) {
        if *self.shutdown.borrow() {
            return;
        }
        drop(self.local.go_offline_detached());
        self.stop().await;
    }

    async fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        let tasks: Vec<_> = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Sync stopped for {}", self.session.user().username);
    }

    // -- Read accessors --

    pub fn user(&self) -> &LocalUser {
        self.session.user()
    }

    pub fn active_room(&self) -> Room {
        self.session.active_room()
    }

    pub fn list_visible(&self, room: Room) -> Vec<Message> {
        self.store.list_visible(room)
    }

    pub fn list_visible_by_date(&self, room: Room) -> Vec<DateGroup> {
        self.store.list_visible_by_date(room)
    }

    pub fn message(&self, id: MessageId) -> Option<Message> {
        self.store.get_visible(id)
    }

    pub fn reply_target(&self, id: MessageId) -> Option<Message> {
        self.store.reply_target(id)
    }

    pub fn online_users(&self) -> Vec<PresenceRecord> {
        self.presence.online_users()
    }

    pub fn typing_users(&self) -> Vec<PresenceRecord> {
        self.presence.typing_users()
    }

    pub fn typing_text(&self) -> Option<String> {
        self.presence.typing_text()
    }

    pub fn unread(&self, room: Room) -> usize {
        self.store.unread(room)
    }

    pub fn announcements(&self) -> Vec<Announcement> {
        self.store.announcements()
    }

    pub fn feed_state(&self, entity: Entity) -> FeedState {
        self.feed(entity).map_or(FeedState::Closed, |f| f.state())
    }

    // -- Change notification --

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.store.subscribe()
    }

    /// Call `callback` after every store mutation until shutdown.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(StoreChange) + Send + 'static,
    {
        let mut changes = self.store.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = changes.recv() => match result {
                        Ok(change) => callback(change),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Change observer lagged by {} notifications", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        self.track(handle);
    }
}

impl Drop for ChatEngine {
    fn drop(&mut self) {
        // Stop background tasks if shutdown was never called.
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn user(id: u128, role: Role) -> LocalUser {
        LocalUser {
            id: Uuid::from_u128(id),
            username: format!("u{}", id),
            display_name: String::new(),
            role,
        }
    }

    fn msg_by(sender: u128) -> Message {
        Message {
            id: Uuid::from_u128(77),
            room: Room::Public,
            sender_id: Uuid::from_u128(sender),
            sender_display_name: "x".into(),
            text: "t".into(),
            timestamp: Utc.timestamp_opt(0, 0).unwrap(),
            likes: BTreeSet::new(),
            dislikes: BTreeSet::new(),
            reply_to_id: None,
            image_ref: None,
            deleted: false,
        }
    }

    #[test]
    fn delete_rules_follow_roles() {
        let own = msg_by(1);
        let others = msg_by(2);

        assert!(authorize_delete(&user(1, Role::User), &own, None).is_ok());
        assert!(matches!(
            authorize_delete(&user(1, Role::User), &others, Some(Role::User)),
            Err(SyncError::Authorization(_))
        ));

        assert!(authorize_delete(&user(1, Role::Admin), &others, Some(Role::User)).is_ok());
        assert!(authorize_delete(&user(1, Role::Admin), &others, None).is_ok());
        assert!(authorize_delete(&user(1, Role::Admin), &others, Some(Role::Owner)).is_err());

        assert!(authorize_delete(&user(1, Role::Owner), &others, Some(Role::Owner)).is_ok());
    }

    #[test]
    fn admin_room_requires_privilege() {
        assert!(room_access(&user(1, Role::User), Room::Public).is_ok());
        assert!(room_access(&user(1, Role::User), Room::Admin).is_err());
        assert!(room_access(&user(1, Role::Admin), Room::Admin).is_ok());
        assert!(room_access(&user(1, Role::Owner), Room::Admin).is_ok());
    }
}
