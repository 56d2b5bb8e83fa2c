//! Real-time sync and presence for the niamchat client.
//!
//! Push feeds and periodic polls both publish [`ChangeEvent`]s onto one channel;
//! a single [`Reconciler`] applies them to the local [`Store`], which notifies
//! observers after every mutation. [`ChatEngine`] composes the pieces.
//!
//! [`ChangeEvent`]: niam_types::ChangeEvent

pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod heartbeat;
pub mod poll;
pub mod presence;
pub mod reconciler;
pub mod session;
pub mod store;

pub use config::{PollMode, SyncConfig};
pub use engine::{ChatEngine, authorize_delete};
pub use error::{SyncError, SyncResult};
pub use feed::{FeedClient, FeedState};
pub use presence::{PresenceAggregator, format_typing};
pub use reconciler::{Applied, Reconciler};
pub use session::Session;
pub use store::{DateGroup, Store, StoreChange, Upsert, badge_text, group_by_date};
