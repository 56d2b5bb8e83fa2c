use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;

use niam_db::{Database, SqliteRemote};
use niam_sync::{ChatEngine, StoreChange, SyncConfig, badge_text};
use niam_types::records::decode_user;
use niam_types::remote::{Filter, Order, RemoteStore};
use niam_types::{Entity, LocalUser, MessageId, Role, Room};

/// A line typed at the prompt.
enum Command {
    Send(String),
    Room(Room),
    Like(MessageId),
    Dislike(MessageId),
    Delete(MessageId),
    Who,
    Quit,
}

fn parse_command(line: &str) -> anyhow::Result<Command> {
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Send(line.to_string()));
    };
    let (name, arg) = rest.split_once(' ').unwrap_or((rest, ""));
    let arg = arg.trim();
    Ok(match name {
        "room" => Command::Room(arg.parse()?),
        "like" => Command::Like(arg.parse()?),
        "dislike" => Command::Dislike(arg.parse()?),
        "delete" => Command::Delete(arg.parse()?),
        "who" => Command::Who,
        "quit" => Command::Quit,
        other => anyhow::bail!("unknown command /{}", other),
    })
}

/// Reuse the id of an existing account with this username, if any.
async fn resolve_user(
    remote: &SqliteRemote,
    username: &str,
    display_name: String,
    role: Role,
) -> anyhow::Result<LocalUser> {
    let existing = remote
        .query(Entity::Users, &Filter::default(), Order::ByUsername, None)
        .await?
        .into_iter()
        .filter_map(|v| decode_user(v).ok())
        .find(|u| u.username == username);

    let id = match existing {
        Some(user) => {
            info!("Resuming as existing user {} ({})", user.username, user.user_id);
            user.user_id
        }
        None => Uuid::new_v4(),
    };
    Ok(LocalUser {
        id,
        username: username.to_string(),
        display_name,
        role,
    })
}

async fn run_command(engine: &ChatEngine, command: Command) -> niam_sync::SyncResult<()> {
    match command {
        Command::Send(text) => {
            let msg = engine.send_message(&text, None, None).await?;
            info!("Sent {}", msg.id);
        }
        Command::Room(room) => engine.switch_room(room).await?,
        Command::Like(id) => {
            engine.toggle_like(id).await?;
        }
        Command::Dislike(id) => {
            engine.toggle_dislike(id).await?;
        }
        Command::Delete(id) => engine.delete_message(id).await?,
        Command::Who => {
            let names: Vec<_> = engine
                .online_users()
                .into_iter()
                .map(|u| u.shown_name().to_string())
                .collect();
            info!("Online: {}", names.join(", "));
        }
        Command::Quit => {}
    }
    Ok(())
}

fn log_change(engine: &ChatEngine, change: &StoreChange) {
    match change {
        StoreChange::Messages { room, ids } => {
            for id in ids {
                match engine.message(*id) {
                    Some(msg) => info!(
                        "[{}] {} {}: {} (+{} -{})",
                        room,
                        msg.id,
                        msg.sender_display_name,
                        msg.text,
                        msg.likes.len(),
                        msg.dislikes.len()
                    ),
                    None => info!("[{}] {} deleted", room, id),
                }
            }
        }
        StoreChange::Presence { .. } => {
            if let Some(text) = engine.typing_text() {
                info!("{}", text);
            }
        }
        StoreChange::Unread { room, count } => {
            let badge = badge_text(*count);
            if !badge.is_empty() {
                info!("{} unread in {}", badge, room);
            }
        }
        StoreChange::Announcement { .. } => {
            if let Some(a) = engine.announcements().last() {
                info!("Announcement from {}: {}", a.author_name, a.text);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "niam=debug".into()),
        )
        .init();

    // Config
    let db_path = std::env::var("NIAM_DB_PATH").unwrap_or_else(|_| "niam.db".into());
    let username = std::env::var("NIAM_USERNAME")
        .map_err(|_| anyhow::anyhow!("NIAM_USERNAME must be set"))?;
    let display_name = std::env::var("NIAM_DISPLAY_NAME").unwrap_or_else(|_| username.clone());
    let role: Role = std::env::var("NIAM_ROLE")
        .unwrap_or_else(|_| "user".into())
        .parse()?;
    let room: Room = std::env::var("NIAM_ROOM")
        .unwrap_or_else(|_| "public".into())
        .parse()?;
    let realtime: bool = std::env::var("NIAM_REALTIME")
        .unwrap_or_else(|_| "true".into())
        .parse()?;
    let config = SyncConfig::from_env();

    // Init database
    let db = Database::open(&PathBuf::from(&db_path))?;
    let remote = Arc::new(SqliteRemote::new(db));
    remote.set_realtime(realtime).await;
    if !realtime {
        info!("Realtime disabled; relying on polling");
    }

    let user = resolve_user(&remote, &username, display_name, role).await?;
    let engine = Arc::new(ChatEngine::start(remote.clone(), user, room, config).await?);

    let observer = engine.clone();
    let mut changes = engine.subscribe_changes();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => log_change(&observer, &change),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Change log lagged by {} notifications", n);
                }
                Err(_) => break,
            }
        }
    });

    for msg in engine.list_visible(room) {
        info!("[{}] {} {}: {}", room, msg.id, msg.sender_display_name, msg.text);
    }
    info!("Niam ready as {} in {}", engine.user().username, room);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_command(line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => {
                        if let Err(e) = run_command(&engine, command).await {
                            warn!("{}", e);
                        }
                    }
                    Err(e) => warn!("{}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
