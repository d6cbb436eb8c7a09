use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::scheduler::Scheduler;
use crate::session::{Announcement, RoomSessionManager};

/// Register the periodic room scan and the heartbeat
pub async fn register_builtin_tasks(
    scheduler: &mut Scheduler,
    sessions: Arc<RoomSessionManager>,
    scan_cron: &str,
) -> anyhow::Result<()> {
    scheduler
        .every(scan_cron, "room-scan", move || {
            let sessions = Arc::clone(&sessions);
            async move {
                sessions.scan_rooms().await;
            }
            .boxed()
        })
        .await?;

    // hourly
    scheduler
        .every("0 0 * * * *", "heartbeat", || {
            async {
                info!("Heartbeat: bot is alive");
            }
            .boxed()
        })
        .await?;

    Ok(())
}

/// Run a scan each time `rescan` is notified, until cancelled
pub async fn run_rescan_listener(
    sessions: Arc<RoomSessionManager>,
    rescan: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = rescan.notified() => {
                info!("Rescan requested");
                sessions.scan_rooms().await;
            }
        }
    }
    debug!("Rescan listener stopped");
}

/// Post queued announcements one at a time, until cancelled or the queue closes
pub async fn run_announcer(
    sessions: Arc<RoomSessionManager>,
    mut queue: UnboundedReceiver<Announcement>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(announcement) => {
                    if !sessions.announce(&announcement).await {
                        warn!("Announcement for {} was not posted", announcement.room.name);
                    }
                }
                None => break,
            }
        }
    }
    debug!("Announcer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::builtin::builtin_registry;
    use crate::config::RoomConfig;
    use crate::parser::InputParser;
    use crate::platform::retry::RetryPolicy;
    use crate::platform::RoomInfo;
    use crate::router::Router;
    use crate::testing::{services, MockBackend, MockKnowledge};
    use std::time::Duration;

    #[tokio::test]
    async fn test_rescan_notification_runs_a_scan() {
        let backend = Arc::new(MockBackend::new());
        let router = Router::new(
            builtin_registry().unwrap().freeze(),
            Arc::new(services(MockKnowledge::default())),
        );
        let sessions = RoomSessionManager::new(
            backend.clone(),
            Arc::new(router),
            InputParser::new("bothelp").unwrap(),
            RetryPolicy {
                timeout: Duration::from_millis(500),
                max_retries: 0,
                backoff: Duration::from_millis(1),
            },
            "bothelp",
        );
        sessions
            .start(&[RoomConfig {
                title: "A".to_string(),
                name: "org/A".to_string(),
                icon: None,
                private: false,
                topics: Vec::new(),
            }])
            .await;
        backend.set_listed_rooms(vec![RoomInfo {
            id: "dm-carol".to_string(),
            name: "carol".to_string(),
            one_to_one: true,
        }]);

        let rescan = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_rescan_listener(
            Arc::clone(&sessions),
            Arc::clone(&rescan),
            cancel.clone(),
        ));

        rescan.notify_one();
        for _ in 0..200 {
            if backend.subscriptions("dm-carol") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(backend.subscriptions("dm-carol"), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_announcer_posts_queued_announcements() {
        let backend = Arc::new(MockBackend::new());
        let router = Router::new(
            builtin_registry().unwrap().freeze(),
            Arc::new(services(MockKnowledge::default())),
        );
        let sessions = RoomSessionManager::new(
            backend.clone(),
            Arc::new(router),
            InputParser::new("bothelp").unwrap(),
            RetryPolicy::default(),
            "bothelp",
        );

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_announcer(Arc::clone(&sessions), rx, cancel.clone()));

        let room = RoomConfig {
            title: "A".to_string(),
            name: "org/A".to_string(),
            icon: None,
            private: false,
            topics: Vec::new(),
        };
        tx.send(Announcement {
            room,
            who: None,
            topic: Some("loops".to_string()),
        })
        .unwrap();

        for _ in 0..200 {
            if !backend.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            backend.sent(),
            vec![(
                "id:org/A".to_string(),
                "----\na question on **loops**".to_string()
            )]
        );

        // closing the queue ends the task
        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_accepts_scan_cron() {
        let backend = Arc::new(MockBackend::new());
        let router = Router::new(
            builtin_registry().unwrap().freeze(),
            Arc::new(services(MockKnowledge::default())),
        );
        let sessions = RoomSessionManager::new(
            backend,
            Arc::new(router),
            InputParser::new("bothelp").unwrap(),
            RetryPolicy::default(),
            "bothelp",
        );
        let mut scheduler = Scheduler::new().await.unwrap();
        register_builtin_tasks(&mut scheduler, sessions, "0 */5 * * * *")
            .await
            .unwrap();
        assert_eq!(scheduler.jobs(), ["room-scan", "heartbeat"]);

        let bad = scheduler.every("not a cron", "broken", || async {}.boxed()).await;
        assert!(bad.is_err());
        assert_eq!(scheduler.jobs().len(), 2);
    }
}
