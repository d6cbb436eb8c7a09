use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{BackendError, BotIdentity, ChatBackend, InboundMessage, MessageStream, Operation, RoomInfo};
use crate::config::GitterConfig;

#[derive(Debug, Deserialize)]
struct GitterUser {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GitterRoom {
    id: String,
    name: String,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    one_to_one: bool,
}

impl From<GitterRoom> for RoomInfo {
    fn from(room: GitterRoom) -> Self {
        RoomInfo {
            id: room.id,
            // one-to-one rooms have no uri, only the peer's name
            name: room.uri.unwrap_or(room.name),
            one_to_one: room.one_to_one,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GitterMessage {
    #[serde(default)]
    text: String,
    from_user: GitterUser,
    #[serde(default)]
    sent: Option<DateTime<Utc>>,
}

/// Stream frames come either bare or wrapped with the operation that produced them
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamFrame {
    Wrapped { operation: Operation, model: GitterMessage },
    Bare(GitterMessage),
}

#[derive(Debug, Serialize)]
struct JoinRequest<'a> {
    uri: &'a str,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    text: &'a str,
}

/// Gitter REST + streaming backend
pub struct GitterBackend {
    client: reqwest::Client,
    config: GitterConfig,
}

impl GitterBackend {
    pub fn new(config: GitterConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.config.token)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Rejected {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        Ok(response)
    }
}

/// Decode one line of the chat stream. Blank keep-alive lines yield `None`.
fn parse_stream_line(line: &[u8], room: &RoomInfo) -> Option<Result<InboundMessage>> {
    let line = std::str::from_utf8(line).ok()?.trim();
    if line.is_empty() {
        return None;
    }

    let frame: StreamFrame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(e) => {
            return Some(Err(
                anyhow::Error::from(e).context(format!("Bad stream frame in {}", room.name))
            ))
        }
    };

    let (operation, model) = match frame {
        StreamFrame::Wrapped { operation, model } => (operation, model),
        StreamFrame::Bare(model) => (Operation::Create, model),
    };

    Some(Ok(InboundMessage {
        text: model.text,
        sender_id: model.from_user.id,
        sender_name: model.from_user.username,
        room_id: room.id.clone(),
        room_name: room.name.clone(),
        operation,
        timestamp: model.sent.unwrap_or_else(Utc::now),
    }))
}

#[async_trait]
impl ChatBackend for GitterBackend {
    async fn current_user(&self) -> Result<BotIdentity> {
        let url = format!("{}/v1/user", self.config.api_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let users: Vec<GitterUser> = Self::check(response)
            .await?
            .json()
            .await
            .context("Failed to parse current user")?;

        users
            .into_iter()
            .next()
            .map(|u| BotIdentity {
                id: u.id,
                username: u.username,
            })
            .context("Backend returned no current user")
    }

    async fn join(&self, uri: &str) -> Result<RoomInfo> {
        let url = format!("{}/v1/rooms", self.config.api_url);
        debug!("Joining room {}", uri);

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth())
            .json(&JoinRequest { uri })
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let room: GitterRoom = Self::check(response)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse join response for {}", uri))?;
        Ok(room.into())
    }

    async fn list_rooms(&self, user_id: &str) -> Result<Vec<RoomInfo>> {
        let url = format!("{}/v1/user/{}/rooms", self.config.api_url, user_id);
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let rooms: Vec<GitterRoom> = Self::check(response)
            .await?
            .json()
            .await
            .context("Failed to parse room list")?;
        Ok(rooms.into_iter().map(RoomInfo::from).collect())
    }

    async fn subscribe(&self, room: &RoomInfo) -> Result<MessageStream> {
        let url = format!("{}/v1/rooms/{}/chatMessages", self.config.stream_url, room.id);
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let response = Self::check(response).await?;

        let room = room.clone();
        let bytes = Box::pin(response.bytes_stream());

        let lines = futures::stream::unfold((bytes, Vec::new()), |(mut bytes, mut buf)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    return Some((Ok(line), (bytes, buf)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        warn!("Chat stream read error: {}", e);
                        return Some((Err(anyhow::Error::from(e)), (bytes, buf)));
                    }
                    None if buf.is_empty() => return None,
                    None => {
                        let rest = std::mem::take(&mut buf);
                        return Some((Ok(rest), (bytes, buf)));
                    }
                }
            }
        });

        let messages = lines.filter_map(move |line| {
            let parsed = match line {
                Ok(line) => parse_stream_line(&line, &room),
                Err(e) => Some(Err(e)),
            };
            futures::future::ready(parsed)
        });

        Ok(messages.boxed())
    }

    async fn send(&self, room_id: &str, text: &str) -> Result<()> {
        let url = format!("{}/v1/rooms/{}/chatMessages", self.config.api_url, room_id);
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth())
            .json(&SendRequest { text })
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }
}
