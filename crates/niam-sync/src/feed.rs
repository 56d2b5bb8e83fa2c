use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use niam_types::records::{decode_announcement, decode_message, decode_user};
use niam_types::remote::{Filter, RemoteChange, RemoteStore};
use niam_types::{ChangeEvent, ChangeOp, Entity, Room, ValidationError};

use crate::session::Session;

/// Lifecycle of one push subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Init,
    Subscribing,
    Subscribed,
    Disconnected,
    Closed,
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeedState::Init => "INIT",
            FeedState::Subscribing => "SUBSCRIBING",
            FeedState::Subscribed => "SUBSCRIBED",
            FeedState::Disconnected => "DISCONNECTED",
            FeedState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Why the pump loop returned.
enum PumpExit {
    Lost,
    RoomChanged,
    Shutdown,
}

/// Keeps one subscription alive for an entity and forwards its changes as events.
pub struct FeedClient {
    entity: Entity,
    remote: Arc<dyn RemoteStore>,
    session: Arc<Session>,
    events: mpsc::UnboundedSender<ChangeEvent>,
    state: watch::Sender<FeedState>,
    reconnect_delay: Duration,
}

impl FeedClient {
    pub fn new(
        entity: Entity,
        remote: Arc<dyn RemoteStore>,
        session: Arc<Session>,
        events: mpsc::UnboundedSender<ChangeEvent>,
        reconnect_delay: Duration,
    ) -> Self {
        let (state, _) = watch::channel(FeedState::Init);
        Self {
            entity,
            remote,
            session,
            events,
            state,
            reconnect_delay,
        }
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    pub fn state(&self) -> FeedState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<FeedState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: FeedState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!("{} feed is {}", self.entity, next);
        }
    }

    fn filter(&self, room: Room) -> Filter {
        match self.entity {
            Entity::Messages => Filter::room(room),
            Entity::Users | Entity::Announcements => Filter::default(),
        }
    }

    /// Subscribe, pump, and resubscribe until shutdown. Never gives up on its own.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut room_rx = self.session.watch_room();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(FeedState::Subscribing);
            let room = *room_rx.borrow_and_update();
            let filter = self.filter(room);

            match self.remote.subscribe(self.entity, &filter).await {
                Ok(sub) => {
                    self.set_state(FeedState::Subscribed);
                    let exit = self.pump(sub.changes, &mut room_rx, &mut shutdown).await;
                    self.remote.unsubscribe(sub.id).await;
                    match exit {
                        PumpExit::Shutdown => break,
                        PumpExit::RoomChanged => {
                            debug!("Room changed; resubscribing {} feed", self.entity);
                            continue;
                        }
                        PumpExit::Lost => warn!("{} subscription lost", self.entity),
                    }
                }
                Err(e) => warn!("Failed to subscribe to {}: {}", self.entity, e),
            }

            self.set_state(FeedState::Disconnected);
            if self.wait_before_retry(&mut shutdown).await {
                break;
            }
        }

        self.set_state(FeedState::Closed);
    }

    async fn pump(
        &self,
        mut changes: mpsc::UnboundedReceiver<RemoteChange>,
        room_rx: &mut watch::Receiver<Room>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PumpExit {
        let room_scoped = self.entity == Entity::Messages;

        loop {
            tokio::select! {
                change = changes.recv() => {
                    let Some(change) = change else { return PumpExit::Lost };
                    self.forward(change);
                }
                changed = room_rx.changed(), if room_scoped => {
                    return match changed {
                        Ok(()) => PumpExit::RoomChanged,
                        Err(_) => PumpExit::Shutdown,
                    };
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return PumpExit::Shutdown;
                    }
                }
            }
        }
    }

    fn forward(&self, change: RemoteChange) {
        match decode_change(change) {
            Ok(event) => {
                trace!("{} {:?} event from feed", event.entity(), event.op);
                if self.events.send(event).is_err() {
                    debug!("Reconciler gone; dropping {} event", self.entity);
                }
            }
            Err(e) => warn!("Dropping malformed {} payload: {}", self.entity, e),
        }
    }

    /// Returns true if shutdown was signalled while waiting.
    async fn wait_before_retry(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.reconnect_delay + jitter(self.reconnect_delay);
        debug!("Retrying {} feed in {:?}", self.entity, delay);

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return true;
                    }
                }
            }
        }
    }
}

/// Up to a quarter of the base delay.
fn jitter(base: Duration) -> Duration {
    let max = (base.as_millis() / 4) as u64;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max))
}

/// Validate a raw remote change into a typed event. A message carrying the
/// tombstone flag becomes a delete.
pub(crate) fn decode_change(change: RemoteChange) -> Result<ChangeEvent, ValidationError> {
    match change.entity {
        Entity::Messages => {
            let msg = decode_message(change.record)?;
            let op = if msg.deleted { ChangeOp::Delete } else { change.op };
            Ok(ChangeEvent::message(op, msg))
        }
        Entity::Users => Ok(ChangeEvent::user(change.op, decode_user(change.record)?)),
        Entity::Announcements => Ok(ChangeEvent::announcement(
            change.op,
            decode_announcement(change.record)?,
        )),
    }
}
