/// Integration tests for the SQLite remote store: writes, queries and
/// change delivery through subscriptions.
use niam_db::{Database, SqliteRemote};
use niam_types::error::RemoteError;
use niam_types::events::{ChangeOp, Entity};
use niam_types::records::{MessagePatch, decode_message, decode_user};
use niam_types::remote::{Filter, Order, RemoteStore};
use niam_types::Room;
use serde_json::json;
use uuid::Uuid;

fn message_json(id: Uuid, room: &str, text: &str) -> serde_json::Value {
    json!({
        "id": id.to_string(),
        "room": room,
        "sender_id": Uuid::from_u128(100).to_string(),
        "sender_name": "alice",
        "text": text,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

#[tokio::test]
async fn insert_is_delivered_to_matching_subscription() {
    let remote = SqliteRemote::new(Database::open_in_memory().unwrap());
    let mut public = remote
        .subscribe(Entity::Messages, &Filter::room(Room::Public))
        .await
        .unwrap();

    let id = Uuid::new_v4();
    remote
        .insert(Entity::Messages, message_json(Uuid::new_v4(), "admin", "secret"))
        .await
        .unwrap();
    remote
        .insert(Entity::Messages, message_json(id, "public", "hi"))
        .await
        .unwrap();

    let change = public.changes.recv().await.unwrap();
    assert_eq!(change.op, ChangeOp::Insert);
    let msg = decode_message(change.record).unwrap();
    assert_eq!(msg.id, id);
    assert_eq!(msg.text, "hi");
}

#[tokio::test]
async fn tombstone_update_is_published_and_hidden_from_visible_query() {
    let remote = SqliteRemote::new(Database::open_in_memory().unwrap());
    let id = Uuid::new_v4();
    remote
        .insert(Entity::Messages, message_json(id, "public", "bye"))
        .await
        .unwrap();

    let mut sub = remote.subscribe(Entity::Messages, &Filter::default()).await.unwrap();
    let patch = serde_json::to_value(MessagePatch::tombstone()).unwrap();
    remote
        .update(Entity::Messages, &id.to_string(), patch)
        .await
        .unwrap();

    let change = sub.changes.recv().await.unwrap();
    assert_eq!(change.op, ChangeOp::Update);
    assert!(decode_message(change.record).unwrap().deleted);

    let visible = remote
        .query(Entity::Messages, &Filter::visible_in(Room::Public), Order::Descending, Some(10))
        .await
        .unwrap();
    assert!(visible.is_empty());
}

#[tokio::test]
async fn malformed_and_duplicate_inserts_are_rejected() {
    let remote = SqliteRemote::new(Database::open_in_memory().unwrap());

    let err = remote
        .insert(Entity::Messages, json!({ "id": "x", "room": "public" }))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::InvalidPayload(_)));

    let id = Uuid::new_v4();
    remote
        .insert(Entity::Messages, message_json(id, "public", "one"))
        .await
        .unwrap();
    let err = remote
        .insert(Entity::Messages, message_json(id, "public", "two"))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Rejected(_)));

    let err = remote
        .update(Entity::Messages, &Uuid::new_v4().to_string(), json!({ "deleted": true }))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::NotFound { .. }));
}

#[tokio::test]
async fn realtime_outage_refuses_subscriptions() {
    let remote = SqliteRemote::new(Database::open_in_memory().unwrap());
    let mut sub = remote.subscribe(Entity::Users, &Filter::default()).await.unwrap();

    remote.set_realtime(false).await;
    assert!(sub.changes.recv().await.is_none());
    assert!(matches!(
        remote.subscribe(Entity::Users, &Filter::default()).await,
        Err(RemoteError::Transient(_))
    ));

    remote.set_realtime(true).await;
    assert!(remote.subscribe(Entity::Users, &Filter::default()).await.is_ok());
}

#[tokio::test]
async fn users_persist_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("niam.db");
    let id = Uuid::new_v4();

    {
        let remote = SqliteRemote::new(Database::open(&path).unwrap());
        remote
            .insert(
                Entity::Users,
                json!({ "id": id.to_string(), "username": "carol", "role": "admin", "online": true }),
            )
            .await
            .unwrap();
    }

    let remote = SqliteRemote::new(Database::open(&path).unwrap());
    let online = remote
        .query(Entity::Users, &Filter::online(), Order::ByUsername, None)
        .await
        .unwrap();
    assert_eq!(online.len(), 1);
    let user = decode_user(online[0].clone()).unwrap();
    assert_eq!(user.user_id, id);
    assert_eq!(user.role, niam_types::Role::Admin);
}
