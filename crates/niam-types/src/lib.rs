//! Shared types for the niamchat sync engine: the local data model, change
//! events, the remote wire records and the remote store interface.
pub mod error;
pub mod events;
pub mod models;
pub mod records;
pub mod remote;

pub use error::{RemoteError, ValidationError};
pub use events::{ChangeEvent, ChangeOp, Entity, Payload};
pub use models::{Announcement, LocalUser, Message, MessageId, PresenceRecord, Role, Room, UserId};
