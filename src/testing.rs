//! Test infrastructure: fixtures, MockKnowledge and MockBackend.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Notify;

use crate::commands::Services;
use crate::config::Config;
use crate::knowledge::{KnowledgeBase, Topic};
use crate::session::Announcement;
use crate::platform::{
    BotIdentity, ChatBackend, InboundMessage, MessageStream, Operation, RoomInfo,
};

pub const TEST_CONFIG: &str = r#"
[gitter]
token = "test-token"

[bot]
name = "bothelp"
version = "9.9.9"
env = "test"
community = "FreeCodeCamp"
quiet_rooms = ["bothelp/Quiet"]

[[rooms]]
title = "bothelp"
name = "bothelp/testing"
icon = "question"
topics = ["chitchat", "bots"]

[[rooms]]
title = "PrivateRoomTest"
name = "bothelp/PrivateRoomTest"
private = true
topics = ["general"]

[[rooms]]
title = "GeneralChat"
name = "bothelp/GeneralChat"
topics = ["general", "intros"]
"#;

pub fn test_config() -> Config {
    Config::parse(TEST_CONFIG).unwrap()
}

pub fn message(text: &str) -> InboundMessage {
    InboundMessage {
        text: text.to_string(),
        sender_id: "u-alice".to_string(),
        sender_name: "alice".to_string(),
        room_id: "r1".to_string(),
        room_name: "bothelp/testing".to_string(),
        operation: Operation::Create,
        timestamp: Utc::now(),
    }
}

/// Knowledge base backed by plain maps
#[derive(Default)]
pub struct MockKnowledge {
    pub topics: HashMap<String, Topic>,
    pub replies: HashMap<String, String>,
}

impl MockKnowledge {
    pub fn with_topic(mut self, key: &str, topic: &str, data: &str) -> Self {
        self.topics.insert(
            key.to_string(),
            Topic {
                topic: topic.to_string(),
                data: data.to_string(),
            },
        );
        self
    }

    pub fn with_reply(mut self, key: &str, reply: &str) -> Self {
        self.replies.insert(key.to_string(), reply.to_string());
        self
    }
}

impl KnowledgeBase for MockKnowledge {
    fn static_reply(&self, key: &str) -> Option<String> {
        self.replies.get(key).cloned()
    }

    fn get_topic(&self, key: &str) -> Result<Option<Topic>> {
        Ok(self.topics.get(key).cloned())
    }

    fn find_topics(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .topics
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn search(&self, query: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .topics
            .iter()
            .filter(|(_, t)| t.data.contains(query))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn topic_names(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.topics.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

pub fn services(knowledge: MockKnowledge) -> Services {
    services_with_announcements(knowledge).0
}

pub fn services_with_announcements(
    knowledge: MockKnowledge,
) -> (Services, UnboundedReceiver<Announcement>) {
    let (tx, rx) = unbounded_channel();
    let services = Services {
        config: test_config(),
        knowledge: Arc::new(knowledge),
        rescan: Arc::new(Notify::new()),
        announcements: tx,
    };
    (services, rx)
}

#[derive(Default)]
struct MockState {
    failing_joins: HashSet<String>,
    list_fails: bool,
    send_fails: bool,
    failing_send_rooms: HashSet<String>,
    listed: Vec<RoomInfo>,
    joins: Vec<String>,
    subscriptions: HashMap<String, usize>,
    streams: HashMap<String, mpsc::UnboundedSender<Result<InboundMessage>>>,
    sent: Vec<(String, String)>,
}

/// Scriptable in-memory chat backend.
///
/// Joined rooms get id `id:<uri>`; messages are pushed into a room's stream
/// with [`MockBackend::push`].
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_id(uri: &str) -> String {
        format!("id:{}", uri)
    }

    pub fn fail_join(&self, uri: &str, fail: bool) {
        let mut state = self.state.lock().unwrap();
        if fail {
            state.failing_joins.insert(uri.to_string());
        } else {
            state.failing_joins.remove(uri);
        }
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.lock().unwrap().list_fails = fail;
    }

    pub fn fail_send(&self, fail: bool) {
        self.state.lock().unwrap().send_fails = fail;
    }

    /// Make sends to one room fail while other rooms keep working
    pub fn fail_send_in(&self, room_id: &str, fail: bool) {
        let mut state = self.state.lock().unwrap();
        if fail {
            state.failing_send_rooms.insert(room_id.to_string());
        } else {
            state.failing_send_rooms.remove(room_id);
        }
    }

    pub fn set_listed_rooms(&self, rooms: Vec<RoomInfo>) {
        self.state.lock().unwrap().listed = rooms;
    }

    /// Deliver a message on a room's open stream. Returns false if no stream is open.
    pub fn push(&self, room_id: &str, message: InboundMessage) -> bool {
        let state = self.state.lock().unwrap();
        match state.streams.get(room_id) {
            Some(tx) => tx.unbounded_send(Ok(message)).is_ok(),
            None => false,
        }
    }

    /// Close a room's stream as if the backend hung up
    pub fn close_stream(&self, room_id: &str) {
        self.state.lock().unwrap().streams.remove(room_id);
    }

    pub fn joins(&self) -> Vec<String> {
        self.state.lock().unwrap().joins.clone()
    }

    pub fn subscriptions(&self, room_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .get(room_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn current_user(&self) -> Result<BotIdentity> {
        Ok(BotIdentity {
            id: "u-bot".to_string(),
            username: "bothelp".to_string(),
        })
    }

    async fn join(&self, uri: &str) -> Result<RoomInfo> {
        let mut state = self.state.lock().unwrap();
        state.joins.push(uri.to_string());
        if state.failing_joins.contains(uri) {
            anyhow::bail!("join rejected: {}", uri);
        }
        Ok(RoomInfo {
            id: Self::room_id(uri),
            name: uri.to_string(),
            one_to_one: false,
        })
    }

    async fn list_rooms(&self, _user_id: &str) -> Result<Vec<RoomInfo>> {
        let state = self.state.lock().unwrap();
        if state.list_fails {
            anyhow::bail!("room listing unavailable");
        }
        Ok(state.listed.clone())
    }

    async fn subscribe(&self, room: &RoomInfo) -> Result<MessageStream> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.lock().unwrap();
        *state.subscriptions.entry(room.id.clone()).or_insert(0) += 1;
        state.streams.insert(room.id.clone(), tx);
        Ok(rx.boxed())
    }

    async fn send(&self, room_id: &str, text: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.send_fails || state.failing_send_rooms.contains(room_id) {
            anyhow::bail!("send failed");
        }
        state.sent.push((room_id.to_string(), text.to_string()));
        Ok(())
    }
}
