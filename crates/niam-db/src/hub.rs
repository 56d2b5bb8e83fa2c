use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use niam_types::events::{ChangeOp, Entity};
use niam_types::remote::{Filter, RemoteChange, Subscription};

struct Subscriber {
    entity: Entity,
    filter: Filter,
    tx: mpsc::UnboundedSender<RemoteChange>,
}

/// Fans committed writes out to live subscriptions.
#[derive(Clone, Default)]
pub struct ChangeHub {
    subscribers: Arc<RwLock<HashMap<Uuid, Subscriber>>>,
}

impl ChangeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. Returns its id and the receiving end.
    pub async fn subscribe(&self, entity: Entity, filter: Filter) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .insert(id, Subscriber { entity, filter, tx });
        debug!("Subscription {} opened on {}", id, entity);
        Subscription { id, changes: rx }
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        if self.subscribers.write().await.remove(&id).is_some() {
            debug!("Subscription {} closed", id);
        }
    }

    /// Deliver a change to every matching subscriber, pruning the ones that hung up.
    pub async fn publish(&self, entity: Entity, op: ChangeOp, record: Value) {
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, sub) in subscribers.iter() {
                if sub.entity != entity || !matches(&sub.filter, &record) {
                    continue;
                }
                let change = RemoteChange {
                    entity,
                    op,
                    record: record.clone(),
                };
                if sub.tx.send(change).is_err() {
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }

    /// Drop every subscription, as a lost realtime connection would.
    pub async fn disconnect_all(&self) -> usize {
        let mut subscribers = self.subscribers.write().await;
        let count = subscribers.len();
        subscribers.clear();
        if count > 0 {
            info!("Dropped {} realtime subscriptions", count);
        }
        count
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

fn matches(filter: &Filter, record: &Value) -> bool {
    if let Some(room) = filter.room {
        if record.get("room").and_then(Value::as_str) != Some(room.as_str()) {
            return false;
        }
    }
    if let Some(deleted) = filter.deleted {
        if record.get("deleted").and_then(Value::as_bool).unwrap_or(false) != deleted {
            return false;
        }
    }
    if let Some(online) = filter.online {
        if record.get("online").and_then(Value::as_bool).unwrap_or(false) != online {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use niam_types::Room;
    use serde_json::json;

    #[tokio::test]
    async fn room_filter_applies_to_published_changes() {
        let hub = ChangeHub::new();
        let mut public = hub.subscribe(Entity::Messages, Filter::room(Room::Public)).await;
        let mut users = hub.subscribe(Entity::Users, Filter::default()).await;

        hub.publish(Entity::Messages, ChangeOp::Insert, json!({ "room": "admin" })).await;
        hub.publish(Entity::Messages, ChangeOp::Insert, json!({ "room": "public" })).await;

        let change = public.changes.try_recv().unwrap();
        assert_eq!(change.record["room"], "public");
        assert!(public.changes.try_recv().is_err());
        assert!(users.changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_closes_receivers() {
        let hub = ChangeHub::new();
        let mut sub = hub.subscribe(Entity::Users, Filter::default()).await;
        assert_eq!(hub.disconnect_all().await, 1);
        assert!(sub.changes.recv().await.is_none());
        assert_eq!(hub.subscriber_count().await, 0);
    }
}
