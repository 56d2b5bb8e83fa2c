use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use niam_types::records::{UserPatch, UserRecord, decode_user};
use niam_types::remote::RemoteStore;
use niam_types::{ChangeEvent, ChangeOp, Entity, PresenceRecord, RemoteError};

use crate::config::tick_period;
use crate::session::Session;

/// Writes the local user's own presence: heartbeats, online state and typing.
pub struct LocalPresence {
    remote: Arc<dyn RemoteStore>,
    session: Arc<Session>,
    events: mpsc::UnboundedSender<ChangeEvent>,
    /// False while backgrounded; heartbeats are skipped.
    online: AtomicBool,
    typing: AtomicBool,
    /// Bumped on every keystroke; a pending idle clear only fires if unchanged.
    keystrokes: AtomicU64,
    typing_idle: Duration,
    shutdown: watch::Receiver<bool>,
    /// Held across heartbeat and online writes; a beat never lands after going offline.
    online_writes: Mutex<()>,
}

impl LocalPresence {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        session: Arc<Session>,
        events: mpsc::UnboundedSender<ChangeEvent>,
        typing_idle: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            remote,
            session,
            events,
            online: AtomicBool::new(true),
            typing: AtomicBool::new(false),
            keystrokes: AtomicU64::new(0),
            typing_idle,
            shutdown,
            online_writes: Mutex::new(()),
        }
    }

    /// Foregrounded and not shut down.
    fn active(&self) -> bool {
        self.online.load(Ordering::Acquire) && !*self.shutdown.borrow()
    }

    fn user_key(&self) -> String {
        self.session.user().id.to_string()
    }

    /// Create or refresh the local user's row, marked online.
    pub async fn announce(&self) -> Result<(), RemoteError> {
        let user = self.session.user();
        let record = UserRecord::from(&PresenceRecord {
            user_id: user.id,
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            role: user.role,
            online: true,
            typing: false,
            last_seen: Utc::now(),
        });
        let value =
            serde_json::to_value(record).map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;
        let stored = self.remote.insert(Entity::Users, value).await?;
        self.echo(stored);
        Ok(())
    }

    /// Refresh `last_seen`. Skipped while backgrounded.
    pub async fn heartbeat(&self) -> Result<(), RemoteError> {
        let _guard = self.online_writes.lock().await;
        if !self.online.load(Ordering::Acquire) {
            return Ok(());
        }
        self.write(UserPatch::heartbeat(Utc::now())).await
    }

    /// Going offline also clears typing.
    pub async fn set_online(&self, online: bool) -> Result<(), RemoteError> {
        self.online.store(online, Ordering::Release);
        if !online {
            self.typing.store(false, Ordering::Release);
        }
        let _guard = self.online_writes.lock().await;
        self.write(UserPatch::presence(online, Utc::now())).await
    }

    /// Write the typing flag; a no-op when it already has this value.
    pub async fn set_typing(&self, typing: bool) -> Result<(), RemoteError> {
        if self.typing.swap(typing, Ordering::AcqRel) == typing {
            return Ok(());
        }
        let result = self.write(UserPatch::typing(typing)).await;
        if result.is_err() {
            // Let the next call retry the write.
            self.typing.store(!typing, Ordering::Release);
        }
        result
    }

    /// Mark the user typing and clear it after `typing_idle` without another
    /// keystroke. Ignored while backgrounded; shutdown cancels a pending clear.
    pub fn note_keystroke(self: &Arc<Self>) -> JoinHandle<()> {
        let generation = self.keystrokes.fetch_add(1, Ordering::AcqRel) + 1;
        let this = self.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if !this.active() {
                return;
            }
            if let Err(e) = this.set_typing(true).await {
                warn!("Failed to set typing: {}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(this.typing_idle) => {}
                _ = shutdown.changed() => return,
            }
            if this.active() && this.keystrokes.load(Ordering::Acquire) == generation {
                if let Err(e) = this.set_typing(false).await {
                    warn!("Failed to clear typing: {}", e);
                }
            }
        })
    }

    /// Refresh `last_seen` every `interval` until shutdown. The first beat is immediate.
    pub async fn run_heartbeat(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(tick_period(interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.online.load(Ordering::Acquire) {
                        continue;
                    }
                    match self.heartbeat().await {
                        Ok(()) => debug!("Heartbeat sent"),
                        Err(e) => warn!("Heartbeat failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Heartbeat stopped");
    }

    /// Best-effort offline write that outlives the caller.
    pub fn go_offline_detached(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.set_online(false).await {
                warn!("Failed to mark user offline: {}", e);
            }
        })
    }

    async fn write(&self, patch: UserPatch) -> Result<(), RemoteError> {
        let patch =
            serde_json::to_value(patch).map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;
        let stored = self
            .remote
            .update(Entity::Users, &self.user_key(), patch)
            .await?;
        self.echo(stored);
        Ok(())
    }

    /// Feed the stored row back so local presence does not wait for the push echo.
    fn echo(&self, stored: Value) {
        match decode_user(stored) {
            Ok(record) => {
                let _ = self.events.send(ChangeEvent::user(ChangeOp::Update, record));
            }
            Err(e) => warn!("Remote returned an unreadable user row: {}", e),
        }
    }
}
