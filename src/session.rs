//! Room membership and message listeners.
//!
//! The manager owns the set of joined rooms and keeps at most one listener
//! task per room. Each listener drains its room's stream in order:
//! filter, parse, route, send. Failures stay inside the room they happen in.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use once_cell::sync::OnceCell;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::commands::{BotContext, Reply};
use crate::config::RoomConfig;
use crate::parser::InputParser;
use crate::platform::retry::{with_retry, RetryPolicy};
use crate::platform::{BotIdentity, ChatBackend, InboundMessage, MessageStream, Operation, RoomInfo};
use crate::router::Router;

/// A room the bot has joined
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSession {
    pub room_id: String,
    pub uri: String,
    pub display_name: String,
    pub listener_attached: bool,
    pub is_private: bool,
    pub one_to_one: bool,
    pub topic_keywords: Vec<String>,
}

impl RoomSession {
    fn configured(room: &RoomInfo, config: &RoomConfig) -> Self {
        Self {
            room_id: room.id.clone(),
            uri: config.name.clone(),
            display_name: config.title.clone(),
            listener_attached: false,
            is_private: config.private,
            one_to_one: room.one_to_one,
            topic_keywords: config.topics.clone(),
        }
    }

    fn discovered(room: &RoomInfo) -> Self {
        Self {
            room_id: room.id.clone(),
            uri: room.name.clone(),
            display_name: room.name.clone(),
            listener_attached: false,
            is_private: room.one_to_one,
            one_to_one: room.one_to_one,
            topic_keywords: Vec::new(),
        }
    }

    fn room_info(&self) -> RoomInfo {
        RoomInfo {
            id: self.room_id.clone(),
            name: self.uri.clone(),
            one_to_one: self.one_to_one,
        }
    }
}

/// Who and what to announce in a room
#[derive(Debug, Clone)]
pub struct Announcement {
    pub room: RoomConfig,
    pub who: Option<String>,
    pub topic: Option<String>,
}

/// Announcement text, or `None` when there is nobody and nothing to announce
pub fn announce_message(who: Option<&str>, topic: Option<&str>) -> Option<String> {
    let body = match (who, topic) {
        (Some(who), Some(topic)) => format!("@{} has a question on **{}**", who, topic),
        (None, Some(topic)) => format!("a question on **{}**", topic),
        (Some(who), None) => format!("welcome @{}", who),
        (None, None) => return None,
    };
    Some(format!("----\n{}", body))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
    Attached,
    AlreadyListening,
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub rejoined: usize,
    pub reattached: usize,
    pub discovered: usize,
}

struct Listener {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SessionState {
    /// Joined rooms by backend id; the only record of membership
    sessions: HashMap<String, RoomSession>,
    listeners: HashMap<String, Listener>,
    /// Configured rooms whose join failed, by uri; retried on scan
    unreachable: HashMap<String, RoomConfig>,
}

pub struct RoomSessionManager {
    backend: Arc<dyn ChatBackend>,
    router: Arc<Router>,
    parser: InputParser,
    context: Mutex<BotContext>,
    policy: RetryPolicy,
    bot_name: String,
    identity: OnceCell<BotIdentity>,
    state: Mutex<SessionState>,
}

impl RoomSessionManager {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        router: Arc<Router>,
        parser: InputParser,
        policy: RetryPolicy,
        bot_name: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            router,
            parser,
            context: Mutex::new(BotContext::default()),
            policy,
            bot_name: bot_name.to_string(),
            identity: OnceCell::new(),
            state: Mutex::new(SessionState::default()),
        })
    }

    /// Confirm identity, then join every configured room
    pub async fn start(self: &Arc<Self>, rooms: &[RoomConfig]) -> usize {
        self.confirm_identity().await;
        self.join_configured(rooms).await
    }

    /// Ask the backend who we are. Until this succeeds, self-messages are
    /// recognized by the configured bot name alone.
    pub async fn confirm_identity(&self) -> Option<&BotIdentity> {
        if let Some(identity) = self.identity.get() {
            return Some(identity);
        }

        match with_retry(self.policy, "current_user", || self.backend.current_user()).await {
            Ok(identity) => {
                if !identity.username.eq_ignore_ascii_case(&self.bot_name) {
                    warn!(
                        "Backend reports bot as '{}' but config names it '{}'; filtering on backend identity",
                        identity.username, self.bot_name
                    );
                }
                info!("Bot identity confirmed: {} ({})", identity.username, identity.id);
                Some(self.identity.get_or_init(|| identity))
            }
            Err(e) => {
                warn!(
                    "Could not confirm bot identity, filtering on configured name '{}': {:#}",
                    self.bot_name, e
                );
                None
            }
        }
    }

    fn is_self(&self, message: &InboundMessage) -> bool {
        match self.identity.get() {
            Some(identity) => {
                message.sender_id == identity.id
                    || message.sender_name.eq_ignore_ascii_case(&identity.username)
            }
            None => message.sender_name.eq_ignore_ascii_case(&self.bot_name),
        }
    }

    /// Only new messages from other users are answered
    pub fn should_handle(&self, message: &InboundMessage) -> bool {
        message.operation == Operation::Create && !self.is_self(message)
    }

    /// Join each room; a room that can't be joined is logged and skipped.
    /// Returns how many rooms were joined.
    pub async fn join_configured(self: &Arc<Self>, rooms: &[RoomConfig]) -> usize {
        let results = futures::future::join_all(rooms.iter().map(|room| self.join_room(room))).await;
        let joined = results.into_iter().filter(|ok| *ok).count();
        info!("Joined {}/{} configured rooms", joined, rooms.len());
        joined
    }

    async fn join_room(self: &Arc<Self>, config: &RoomConfig) -> bool {
        let operation = format!("join {}", config.name);
        let room = match with_retry(self.policy, &operation, || self.backend.join(&config.name)).await {
            Ok(room) => room,
            Err(e) => {
                warn!("Not possible to join the room {}: {:#}", config.name, e);
                self.state
                    .lock()
                    .await
                    .unreachable
                    .insert(config.name.clone(), config.clone());
                return false;
            }
        };

        {
            let mut state = self.state.lock().await;
            state.unreachable.remove(&config.name);
            state
                .sessions
                .entry(room.id.clone())
                .or_insert_with(|| RoomSession::configured(&room, config));
        }
        info!("joined> {}", config.name);

        if let Err(e) = self.listen(&room).await {
            warn!("Joined {} but could not listen: {:#}", config.name, e);
        }
        true
    }

    /// Attach a listener to a room unless one is already attached
    pub async fn listen(self: &Arc<Self>, room: &RoomInfo) -> Result<ListenOutcome> {
        {
            let mut state = self.state.lock().await;
            let session = state
                .sessions
                .entry(room.id.clone())
                .or_insert_with(|| RoomSession::discovered(room));
            if session.listener_attached {
                debug!("Already listening to {}", room.name);
                return Ok(ListenOutcome::AlreadyListening);
            }
            // claimed before the subscribe await so a concurrent call sees it
            session.listener_attached = true;
        }

        let operation = format!("subscribe {}", room.name);
        let stream = match with_retry(self.policy, &operation, || self.backend.subscribe(room)).await {
            Ok(stream) => stream,
            Err(e) => {
                self.mark_detached(&room.id).await;
                return Err(e).with_context(|| format!("Failed to listen to {}", room.name));
            }
        };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run_listener(room.clone(), stream, cancel.clone()));
        self.state
            .lock()
            .await
            .listeners
            .insert(room.id.clone(), Listener { cancel, handle });

        info!("Listening to {}", room.name);
        Ok(ListenOutcome::Attached)
    }

    async fn run_listener(self: Arc<Self>, room: RoomInfo, mut stream: MessageStream, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Listener for {} cancelled", room.name);
                    return;
                }
                next = stream.next() => match next {
                    Some(Ok(message)) => self.process(message).await,
                    Some(Err(e)) => warn!("Stream error in {}: {:#}", room.name, e),
                    None => break,
                }
            }
        }

        warn!("Message stream for {} ended; will re-attach on next scan", room.name);
        let mut state = self.state.lock().await;
        state.listeners.remove(&room.id);
        if let Some(session) = state.sessions.get_mut(&room.id) {
            session.listener_attached = false;
        }
    }

    async fn mark_detached(&self, room_id: &str) {
        if let Some(session) = self.state.lock().await.sessions.get_mut(room_id) {
            session.listener_attached = false;
        }
    }

    /// Filter, parse, route and answer one message
    async fn process(&self, message: InboundMessage) {
        if !self.should_handle(&message) {
            debug!(
                "Skipping {:?} message from {} in {}",
                message.operation, message.sender_name, message.room_name
            );
            return;
        }

        info!(" in| {}> {}", message.sender_name, message.text);
        let input = self.parser.parse(&message);
        let reply = {
            let mut ctx = self.context.lock().await;
            self.router.route(&input, &mut ctx)
        };

        match reply {
            Reply::Text(text) => {
                info!("out| {}", text);
                if let Err(e) = self.say(&message.room_id, &text).await {
                    error!("Failed to reply in {}: {:#}", message.room_name, e);
                }
            }
            Reply::Suppressed => info!("out| (suppressed) in {}", message.room_name),
        }
    }

    pub async fn say(&self, room_id: &str, text: &str) -> Result<()> {
        with_retry(self.policy, "send", || self.backend.send(room_id, text)).await
    }

    /// Stop listening to a room. Returns the cancelled listener task, or
    /// `None` if no listener was attached.
    pub async fn detach(&self, room_id: &str) -> Option<JoinHandle<()>> {
        let mut state = self.state.lock().await;
        let listener = state.listeners.remove(room_id)?;
        listener.cancel.cancel();
        if let Some(session) = state.sessions.get_mut(room_id) {
            session.listener_attached = false;
        }
        Some(listener.handle)
    }

    /// Detach every room and wait for the listeners to finish
    pub async fn shutdown(&self) {
        let room_ids: Vec<String> = self.state.lock().await.listeners.keys().cloned().collect();
        let mut handles = Vec::with_capacity(room_ids.len());
        for room_id in &room_ids {
            if let Some(handle) = self.detach(room_id).await {
                handles.push(handle);
            }
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Listener task ended abnormally: {}", e);
            }
        }
        info!("All room listeners stopped");
    }

    /// Reconcile membership with the backend.
    ///
    /// Lists the bot's rooms first; if that query fails the pass is logged
    /// and abandoned without effect. Otherwise retries unreachable configured
    /// rooms, re-attaches listeners whose stream ended, and starts listening
    /// to one-to-one rooms not yet tracked.
    pub async fn scan_rooms(self: &Arc<Self>) -> ScanReport {
        let mut report = ScanReport::default();

        let Some(identity) = self.confirm_identity().await.cloned() else {
            warn!("cant scanRooms: bot identity unknown");
            return report;
        };

        let listed = match with_retry(self.policy, "list rooms", || self.backend.list_rooms(&identity.id)).await {
            Ok(rooms) => rooms,
            Err(e) => {
                warn!("cant scanRooms: {:#}", e);
                return report;
            }
        };

        let retry: Vec<RoomConfig> = self.state.lock().await.unreachable.values().cloned().collect();
        for config in &retry {
            if self.join_room(config).await {
                report.rejoined += 1;
            }
        }

        let detached: Vec<RoomInfo> = self
            .state
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| !s.listener_attached)
            .map(RoomSession::room_info)
            .collect();
        for room in &detached {
            match self.listen(room).await {
                Ok(ListenOutcome::Attached) => report.reattached += 1,
                Ok(ListenOutcome::AlreadyListening) => {}
                Err(e) => warn!("Could not re-attach {}: {:#}", room.name, e),
            }
        }

        for room in listed.iter().filter(|r| r.one_to_one) {
            let known = self.state.lock().await.sessions.contains_key(&room.id);
            if known {
                continue;
            }
            debug!("oneToOne {}", room.name);
            match self.listen(room).await {
                Ok(ListenOutcome::Attached) => report.discovered += 1,
                Ok(ListenOutcome::AlreadyListening) => {}
                Err(e) => warn!("Could not listen to one-to-one room {}: {:#}", room.name, e),
            }
        }

        info!(
            "Room scan: {} rejoined, {} re-attached, {} discovered",
            report.rejoined, report.reattached, report.discovered
        );
        report
    }

    /// Post an announcement to a room after a membership scan.
    /// Returns whether it was sent.
    pub async fn announce(self: &Arc<Self>, announcement: &Announcement) -> bool {
        let Some(text) = announce_message(announcement.who.as_deref(), announcement.topic.as_deref()) else {
            warn!("Nothing to announce in {}", announcement.room.name);
            return false;
        };

        self.scan_rooms().await;
        if !self.join_room(&announcement.room).await {
            return false;
        }

        let room_id = {
            let state = self.state.lock().await;
            state
                .sessions
                .values()
                .find(|s| s.uri == announcement.room.name)
                .map(|s| s.room_id.clone())
        };
        let Some(room_id) = room_id else {
            return false;
        };

        match self.say(&room_id, &text).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to announce in {}: {:#}", announcement.room.name, e);
                false
            }
        }
    }

    #[cfg(test)]
    pub async fn is_listening(&self, room_id: &str) -> bool {
        self.state
            .lock()
            .await
            .sessions
            .get(room_id)
            .is_some_and(|s| s.listener_attached)
    }

    pub async fn sessions(&self) -> Vec<RoomSession> {
        self.state.lock().await.sessions.values().cloned().collect()
    }

    pub async fn unreachable_rooms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.unreachable.keys().cloned().collect();
        names.sort();
        names
    }
}
