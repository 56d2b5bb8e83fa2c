use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::RemoteError;
use crate::events::{ChangeOp, Entity};
use crate::models::Room;

/// Row filter for queries and subscriptions. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub room: Option<Room>,
    pub deleted: Option<bool>,
    pub online: Option<bool>,
}

impl Filter {
    pub fn room(room: Room) -> Self {
        Self {
            room: Some(room),
            ..Default::default()
        }
    }

    pub fn visible_in(room: Room) -> Self {
        Self {
            room: Some(room),
            deleted: Some(false),
            online: None,
        }
    }

    pub fn online() -> Self {
        Self {
            online: Some(true),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Oldest first (`timestamp` for messages, `created_at` for announcements).
    Ascending,
    /// Newest first.
    Descending,
    ByUsername,
}

/// Raw change delivered on a subscription, before validation.
#[derive(Debug, Clone)]
pub struct RemoteChange {
    pub entity: Entity,
    pub op: ChangeOp,
    pub record: Value,
}

/// A live subscription. The remote closes `changes` when the subscription is lost.
#[derive(Debug)]
pub struct Subscription {
    pub id: Uuid,
    pub changes: mpsc::UnboundedReceiver<RemoteChange>,
}

/// The authoritative store the engine keeps in sync with.
///
/// Records cross this boundary as raw JSON; callers validate them into
/// typed models before use.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn query(
        &self,
        entity: Entity,
        filter: &Filter,
        order: Order,
        limit: Option<u32>,
    ) -> Result<Vec<Value>, RemoteError>;

    async fn insert(&self, entity: Entity, record: Value) -> Result<Value, RemoteError>;

    /// Apply `patch` to the record `id`. Deletion is a patch setting the tombstone flag.
    async fn update(&self, entity: Entity, id: &str, patch: Value) -> Result<Value, RemoteError>;

    async fn subscribe(&self, entity: Entity, filter: &Filter) -> Result<Subscription, RemoteError>;

    async fn unsubscribe(&self, id: Uuid);
}
