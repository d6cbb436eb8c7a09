pub mod gitter;
pub mod retry;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Deserialize;

/// What happened to a chat message. Only `Create` events are answered.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Remove,
    Patch,
    #[serde(other)]
    Other,
}

/// A message received from a room stream
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub text: String,
    /// Backend user id of the author
    pub sender_id: String,
    /// Display handle of the author, without the leading `@`
    pub sender_name: String,
    pub room_id: String,
    /// Room uri, e.g. `bothelp/testing`
    pub room_name: String,
    pub operation: Operation,
    pub timestamp: DateTime<Utc>,
}

/// A room as reported by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct RoomInfo {
    pub id: String,
    pub name: String,
    pub one_to_one: bool,
}

/// The identity the backend assigns to the bot's own account
#[derive(Debug, Clone, PartialEq)]
pub struct BotIdentity {
    pub id: String,
    pub username: String,
}

pub type MessageStream = BoxStream<'static, Result<InboundMessage>>;

/// Session API of the chat backend
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// The account the bot is logged in as
    async fn current_user(&self) -> Result<BotIdentity>;

    /// Join a room by uri. Joining an already-joined room succeeds.
    async fn join(&self, uri: &str) -> Result<RoomInfo>;

    /// Every room the user is currently a member of
    async fn list_rooms(&self, user_id: &str) -> Result<Vec<RoomInfo>>;

    /// Open the message stream of a room
    async fn subscribe(&self, room: &RoomInfo) -> Result<MessageStream>;

    async fn send(&self, room_id: &str, text: &str) -> Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
    },
    #[error("{operation} abandoned after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: String,
    },
    #[error("backend rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}
