use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, warn};
use uuid::Uuid;

use niam_types::error::RemoteError;
use niam_types::events::{ChangeOp, Entity};
use niam_types::models::{Announcement, Message, PresenceRecord};
use niam_types::records::{AnnouncementRecord, MessagePatch, MessageRecord, UserPatch, UserRecord};
use niam_types::remote::{Filter, Order, RemoteStore, Subscription};

use crate::Database;
use crate::hub::ChangeHub;

/// [`RemoteStore`] backed by a SQLite database, with in-process change delivery.
pub struct SqliteRemote {
    db: Arc<Database>,
    hub: ChangeHub,
    realtime: AtomicBool,
}

impl SqliteRemote {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            hub: ChangeHub::new(),
            realtime: AtomicBool::new(true),
        }
    }

    /// Turning realtime off drops live subscriptions and refuses new ones.
    pub async fn set_realtime(&self, enabled: bool) {
        self.realtime.store(enabled, Ordering::Release);
        if !enabled {
            self.hub.disconnect_all().await;
        }
    }

    pub fn realtime_enabled(&self) -> bool {
        self.realtime.load(Ordering::Acquire)
    }

    /// Run blocking DB work off the async runtime.
    async fn blocking<F, T>(&self, f: F) -> Result<T, RemoteError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db.as_ref()))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                RemoteError::Transient(e.to_string())
            })?
            .map_err(storage_error)
    }

    async fn publish(&self, entity: Entity, op: ChangeOp, record: &Value) {
        if self.realtime_enabled() {
            self.hub.publish(entity, op, record.clone()).await;
        }
    }
}

#[async_trait]
impl RemoteStore for SqliteRemote {
    async fn query(
        &self,
        entity: Entity,
        filter: &Filter,
        order: Order,
        limit: Option<u32>,
    ) -> Result<Vec<Value>, RemoteError> {
        let filter = filter.clone();
        match entity {
            Entity::Messages => {
                let rows = self
                    .blocking(move |db| db.query_messages(&filter, order, limit))
                    .await?;
                rows.into_iter().map(|r| to_value(r.into_record())).collect()
            }
            Entity::Users => {
                let rows = self.blocking(move |db| db.query_users(&filter, limit)).await?;
                rows.into_iter().map(|r| to_value(r.into_record())).collect()
            }
            Entity::Announcements => {
                let rows = self
                    .blocking(move |db| db.query_announcements(order, limit))
                    .await?;
                rows.into_iter().map(|r| to_value(r.into_record())).collect()
            }
        }
    }

    async fn insert(&self, entity: Entity, record: Value) -> Result<Value, RemoteError> {
        let stored = match entity {
            Entity::Messages => {
                let rec: MessageRecord = from_value(record)?;
                // Reject what a reader could not decode.
                Message::try_from(rec.clone()).map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;
                let row = self.blocking(move |db| db.insert_message(&rec)).await?;
                to_value(row.into_record())?
            }
            Entity::Users => {
                let rec: UserRecord = from_value(record)?;
                PresenceRecord::try_from(rec.clone())
                    .map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;
                let row = self.blocking(move |db| db.upsert_user(&rec)).await?;
                to_value(row.into_record())?
            }
            Entity::Announcements => {
                let rec: AnnouncementRecord = from_value(record)?;
                Announcement::try_from(rec.clone())
                    .map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;
                let row = self.blocking(move |db| db.insert_announcement(&rec)).await?;
                to_value(row.into_record())?
            }
        };

        self.publish(entity, ChangeOp::Insert, &stored).await;
        Ok(stored)
    }

    async fn update(&self, entity: Entity, id: &str, patch: Value) -> Result<Value, RemoteError> {
        let key = id.to_string();
        let updated = match entity {
            Entity::Messages => {
                let patch: MessagePatch = from_value(patch)?;
                self.blocking(move |db| db.update_message(&key, &patch))
                    .await?
                    .map(|row| to_value(row.into_record()))
                    .transpose()?
            }
            Entity::Users => {
                let patch: UserPatch = from_value(patch)?;
                self.blocking(move |db| db.update_user(&key, &patch))
                    .await?
                    .map(|row| to_value(row.into_record()))
                    .transpose()?
            }
            Entity::Announcements => {
                return Err(RemoteError::Rejected("announcements are immutable".into()));
            }
        };

        let updated = updated.ok_or_else(|| RemoteError::NotFound {
            entity: entity.as_str(),
            id: id.to_string(),
        })?;

        self.publish(entity, ChangeOp::Update, &updated).await;
        Ok(updated)
    }

    async fn subscribe(&self, entity: Entity, filter: &Filter) -> Result<Subscription, RemoteError> {
        if !self.realtime_enabled() {
            return Err(RemoteError::Transient("realtime unavailable".into()));
        }
        Ok(self.hub.subscribe(entity, filter.clone()).await)
    }

    async fn unsubscribe(&self, id: Uuid) {
        self.hub.unsubscribe(id).await;
    }
}

fn storage_error(e: anyhow::Error) -> RemoteError {
    if let Some(rusqlite::Error::SqliteFailure(err, _)) = e.downcast_ref::<rusqlite::Error>() {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return RemoteError::Rejected(e.to_string());
        }
    }
    warn!("Storage error: {}", e);
    RemoteError::Transient(e.to_string())
}

fn to_value<T: serde::Serialize>(rec: T) -> Result<Value, RemoteError> {
    serde_json::to_value(rec).map_err(|e| RemoteError::InvalidPayload(e.to_string()))
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, RemoteError> {
    serde_json::from_value(value).map_err(|e| RemoteError::InvalidPayload(e.to_string()))
}
