use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::time::Instant;

use social_relay::channel::NotificationChannel;
use social_relay::dispatcher::Dispatcher;
use social_relay::model::{ContentItem, Platform};
use social_relay::poller::{CycleReport, Poller, PollerConfig};
use social_relay::queue::{
    InProcessQueue, MessageHandler, QueueBackend, QueueFactory, QueueKind,
};
use social_relay::source::{ContentSource, SourceRegistry};
use social_relay::storage::{FileStorage, StorageBackend, StorageFactory};

fn item(id: &str, platform: Platform, username: &str) -> ContentItem {
    ContentItem {
        id: id.into(),
        platform,
        content: "hello".into(),
        url: format!("https://instagram.com/p/{id}"),
        username: username.into(),
        image_url: None,
        timestamp: Utc::now(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceCall {
    username: String,
    last_seen: Option<String>,
}

/// Returns queued answers per username and records every call.
#[derive(Clone)]
struct ScriptedSource {
    platform: Platform,
    answers: Arc<Mutex<HashMap<String, VecDeque<Option<ContentItem>>>>>,
    calls: Arc<Mutex<Vec<SourceCall>>>,
}

impl ScriptedSource {
    fn new(platform: Platform) -> Self {
        Self {
            platform,
            answers: Arc::default(),
            calls: Arc::default(),
        }
    }

    async fn push(&self, username: &str, answer: Option<ContentItem>) {
        self.answers
            .lock()
            .await
            .entry(username.to_string())
            .or_default()
            .push_back(answer);
    }

    async fn calls(&self) -> Vec<SourceCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl ContentSource for ScriptedSource {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn check_latest(&self, username: &str, last_seen: Option<&str>) -> Option<ContentItem> {
        self.calls.lock().await.push(SourceCall {
            username: username.to_string(),
            last_seen: last_seen.map(str::to_string),
        });
        self.answers
            .lock()
            .await
            .get_mut(username)
            .and_then(|q| q.pop_front())
            .flatten()
    }
}

/// Takes `slow` to answer and records when each check started.
#[derive(Clone)]
struct SlowSource {
    slow: Duration,
    started: Arc<Mutex<Vec<Instant>>>,
}

#[async_trait]
impl ContentSource for SlowSource {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    async fn check_latest(&self, _username: &str, _last_seen: Option<&str>) -> Option<ContentItem> {
        self.started.lock().await.push(Instant::now());
        tokio::time::sleep(self.slow).await;
        None
    }
}

/// Records published items; ids in `failing` are rejected.
#[derive(Default)]
struct RecordingQueue {
    published: Mutex<Vec<ContentItem>>,
    failing: HashSet<String>,
}

#[async_trait]
impl QueueBackend for RecordingQueue {
    fn kind(&self) -> QueueKind {
        QueueKind::InProcess
    }

    async fn publish(&self, item: &ContentItem) -> Result<()> {
        if self.failing.contains(&item.id) {
            return Err(anyhow!("broker rejected {}", item.id));
        }
        self.published.lock().await.push(item.clone());
        Ok(())
    }

    async fn consume(&self, _handler: Arc<dyn MessageHandler>) -> Result<()> {
        Ok(())
    }
}

/// Records sends; destinations in `failing` error out.
#[derive(Clone, Default)]
struct RecordingChannel {
    sent: Arc<Mutex<Vec<(String, String)>>>,
    failing: Arc<HashSet<String>>,
}

impl RecordingChannel {
    fn failing_for(destinations: &[&str]) -> Self {
        Self {
            failing: Arc::new(destinations.iter().map(|d| d.to_string()).collect()),
            ..Default::default()
        }
    }

    async fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn send(&self, destination_id: &str, body: &str) -> Result<()> {
        if self.failing.contains(destination_id) {
            return Err(anyhow!("destination {destination_id} unavailable"));
        }
        self.sent
            .lock()
            .await
            .push((destination_id.to_string(), body.to_string()));
        Ok(())
    }
}

async fn file_storage() -> (TempDir, Arc<FileStorage>) {
    let td = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::open(td.path().join("db.json")).await);
    (td, storage)
}

fn poller(
    storage: Arc<dyn StorageBackend>,
    queue: Arc<dyn QueueBackend>,
    sources: &[Arc<dyn ContentSource>],
) -> Poller {
    let mut registry = SourceRegistry::new();
    for source in sources {
        registry.register(source.clone());
    }
    Poller::new(
        Arc::new(StorageFactory::with_backend(storage)),
        Arc::new(QueueFactory::with_backend(queue)),
        registry,
        PollerConfig {
            interval: Duration::from_millis(10),
            startup_delay: Duration::ZERO,
        },
    )
}

#[tokio::test]
async fn end_to_end_scenario_publishes_once_then_dedups() {
    let (_td, storage) = file_storage().await;
    let alice = storage.add_account("alice", Platform::Instagram).await.unwrap();
    let source = ScriptedSource::new(Platform::Instagram);
    let queue = Arc::new(RecordingQueue::default());
    let poller = poller(storage.clone(), queue.clone(), &[Arc::new(source.clone())]);

    source.push("alice", Some(item("123", Platform::Instagram, "alice"))).await;
    let first = poller.poll_once().await;
    assert_eq!(first, CycleReport { checked: 1, published: 1, failed: 0 });
    let published = queue.published.lock().await.clone();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].id, "123");
    assert_eq!(published[0].url, "https://instagram.com/p/123");

    let accounts = storage.list_accounts().await.unwrap();
    assert_eq!(accounts[0].id, alice.id);
    assert_eq!(accounts[0].last_seen_item_id.as_deref(), Some("123"));

    source.push("alice", None).await;
    let second = poller.poll_once().await;
    assert_eq!(second.published, 0);
    assert_eq!(queue.published.lock().await.len(), 1);
    assert_eq!(
        storage.list_accounts().await.unwrap()[0].last_seen_item_id.as_deref(),
        Some("123")
    );

    let calls = source.calls().await;
    assert_eq!(
        calls,
        vec![
            SourceCall { username: "alice".into(), last_seen: None },
            SourceCall { username: "alice".into(), last_seen: Some("123".into()) },
        ]
    );
}

#[tokio::test]
async fn item_matching_last_seen_is_not_republished() {
    let (_td, storage) = file_storage().await;
    let account = storage.add_account("alice", Platform::Instagram).await.unwrap();
    storage.update_last_seen_item_id(account.id, "X").await.unwrap();

    // A misbehaving source hands back the already seen item.
    let source = ScriptedSource::new(Platform::Instagram);
    source.push("alice", Some(item("X", Platform::Instagram, "alice"))).await;
    let queue = Arc::new(RecordingQueue::default());
    let poller = poller(storage.clone(), queue.clone(), &[Arc::new(source)]);

    let report = poller.poll_once().await;
    assert_eq!(report.published, 0);
    assert!(queue.published.lock().await.is_empty());
    assert_eq!(
        storage.list_accounts().await.unwrap()[0].last_seen_item_id.as_deref(),
        Some("X")
    );
}

#[tokio::test]
async fn publish_failure_keeps_last_seen_and_continues() {
    let (_td, storage) = file_storage().await;
    storage.add_account("alice", Platform::Instagram).await.unwrap();
    storage.add_account("bob", Platform::Twitter).await.unwrap();

    let insta = ScriptedSource::new(Platform::Instagram);
    let twitter = ScriptedSource::new(Platform::Twitter);
    insta.push("alice", Some(item("a1", Platform::Instagram, "alice"))).await;
    twitter.push("bob", Some(item("b1", Platform::Twitter, "bob"))).await;

    let queue = Arc::new(RecordingQueue {
        failing: HashSet::from(["a1".to_string()]),
        ..Default::default()
    });
    let poller = poller(
        storage.clone(),
        queue.clone(),
        &[Arc::new(insta.clone()), Arc::new(twitter)],
    );

    let report = poller.poll_once().await;
    assert_eq!(report, CycleReport { checked: 2, published: 1, failed: 1 });

    let accounts = storage.list_accounts().await.unwrap();
    let alice = accounts.iter().find(|a| a.username == "alice").unwrap();
    let bob = accounts.iter().find(|a| a.username == "bob").unwrap();
    assert!(alice.last_seen_item_id.is_none());
    assert_eq!(bob.last_seen_item_id.as_deref(), Some("b1"));

    // next cycle reconsiders the same item
    insta.push("alice", Some(item("a1", Platform::Instagram, "alice"))).await;
    poller.poll_once().await;
    let calls = insta.calls().await;
    assert_eq!(calls[1].last_seen, None);
}

#[tokio::test]
async fn account_without_source_is_skipped() {
    let (_td, storage) = file_storage().await;
    storage.add_account("carol", Platform::Twitter).await.unwrap();
    let queue = Arc::new(RecordingQueue::default());
    let poller = poller(storage, queue.clone(), &[]);

    let report = poller.poll_once().await;
    assert_eq!(report, CycleReport { checked: 1, published: 0, failed: 0 });
    assert!(queue.published.lock().await.is_empty());
}

#[tokio::test]
async fn dispatch_without_groups_sends_nothing() {
    let (_td, storage) = file_storage().await;
    storage.add_group("tw", Platform::Twitter, "d2").await.unwrap();
    let channel = RecordingChannel::default();
    let dispatcher = Dispatcher::new(
        Arc::new(StorageFactory::with_backend(storage)),
        Arc::new(channel.clone()),
    );

    let report = dispatcher
        .dispatch(&item("1", Platform::Instagram, "alice"))
        .await
        .unwrap();
    assert_eq!(report.delivered, 0);
    assert!(channel.sent().await.is_empty());
}

#[tokio::test]
async fn dispatch_failure_for_one_group_does_not_block_others() {
    let (_td, storage) = file_storage().await;
    storage.add_group("G1", Platform::Instagram, "d1").await.unwrap();
    storage.add_group("G2", Platform::Instagram, "d2").await.unwrap();
    storage.add_group("G3", Platform::Instagram, "d3").await.unwrap();
    storage.add_group("T1", Platform::Twitter, "t1").await.unwrap();

    let channel = RecordingChannel::failing_for(&["d2"]);
    let dispatcher = Dispatcher::new(
        Arc::new(StorageFactory::with_backend(storage)),
        Arc::new(channel.clone()),
    );

    let report = dispatcher
        .handle(item("1", Platform::Instagram, "alice"))
        .await;
    assert!(report.is_ok());

    let sent = channel.sent().await;
    let destinations: Vec<_> = sent.iter().map(|(d, _)| d.as_str()).collect();
    assert_eq!(destinations, vec!["d1", "d3"]);
    assert!(sent[0].1.contains("alice"));
    assert!(sent[0].1.contains("New Instagram post"));
}

#[tokio::test]
async fn in_process_pipeline_delivers_to_groups() {
    let (_td, storage) = file_storage().await;
    storage.add_account("alice", Platform::Instagram).await.unwrap();
    storage.add_group("G1", Platform::Instagram, "d1").await.unwrap();

    let storage_factory = Arc::new(StorageFactory::with_backend(storage.clone()));
    let queue: Arc<dyn QueueBackend> = Arc::new(InProcessQueue::new());
    let channel = RecordingChannel::default();
    let dispatcher = Arc::new(Dispatcher::new(
        storage_factory.clone(),
        Arc::new(channel.clone()),
    ));
    queue.consume(dispatcher).await.unwrap();

    let source = ScriptedSource::new(Platform::Instagram);
    source.push("alice", Some(item("123", Platform::Instagram, "alice"))).await;
    let mut registry = SourceRegistry::new();
    registry.register(Arc::new(source));
    let poller = Poller::new(
        storage_factory,
        Arc::new(QueueFactory::with_backend(queue)),
        registry,
        PollerConfig {
            interval: Duration::from_millis(10),
            startup_delay: Duration::ZERO,
        },
    );
    poller.poll_once().await;

    let mut sent = Vec::new();
    for _ in 0..100 {
        sent = channel.sent().await;
        if !sent.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(channel.sent().await.len(), 1);
    assert_eq!(sent[0].0, "d1");
    assert!(sent[0].1.contains("https://instagram.com/p/123"));
}

#[tokio::test(start_paused = true)]
async fn run_honours_startup_delay_and_never_overlaps_cycles() {
    let (_td, storage) = file_storage().await;
    storage.add_account("alice", Platform::Instagram).await.unwrap();

    let slow = Duration::from_secs(45);
    let interval = Duration::from_secs(30);
    let startup_delay = Duration::from_secs(5);
    let source = SlowSource {
        slow,
        started: Arc::default(),
    };
    let mut registry = SourceRegistry::new();
    registry.register(Arc::new(source.clone()));
    let poller = Poller::new(
        Arc::new(StorageFactory::with_backend(storage)),
        Arc::new(QueueFactory::with_backend(Arc::new(RecordingQueue::default()))),
        registry,
        PollerConfig {
            interval,
            startup_delay,
        },
    );

    let start = Instant::now();
    let handle = tokio::spawn(poller.run());
    tokio::time::sleep(startup_delay + (slow + interval) * 3).await;
    handle.abort();

    let started = source.started.lock().await.clone();
    assert!(started.len() >= 3, "only {} cycles ran", started.len());
    let first = started[0] - start;
    assert!(first >= startup_delay, "first check after {first:?}");
    assert!(first < startup_delay + interval, "first check after {first:?}");
    // The interval counts from the end of the previous cycle.
    for pair in started.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= slow + interval, "cycles {gap:?} apart");
    }
}
