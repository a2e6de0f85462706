use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use herald_channel::{EventProducer, MemoryChannel};
use herald_core::{
    types::{DestinationStatus, NewPlatform, NewPost, Platform, PostDestination},
    DeliverySink, PublicationEvent, PublicationStore, RetryPolicy, SinkError,
};
use herald_store::SqliteStore;
use herald_worker::{DeliveryWorker, Dispatcher, Outcome};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

#[derive(Default)]
struct FakeSink {
    sent: Mutex<Vec<(String, String, String)>>,
    /// Scripted failures per channel, consumed front to back.
    failures: Mutex<HashMap<String, VecDeque<SinkError>>>,
    pause: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeSink {
    fn failing(channel: &str, errors: Vec<SinkError>) -> Self {
        let sink = Self::default();
        sink.failures
            .lock()
            .unwrap()
            .insert(channel.to_string(), errors.into());
        sink
    }

    fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliverySink for FakeSink {
    fn platform(&self) -> &str {
        "Telegram"
    }

    async fn send(&self, channel_id: &str, credential: &str, text: &str) -> Result<(), SinkError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.pause.is_zero() {
            tokio::time::sleep(self.pause).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(channel_id)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }
        self.sent.lock().unwrap().push((
            channel_id.to_string(),
            credential.to_string(),
            text.to_string(),
        ));
        Ok(())
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

fn worker(store: &Arc<SqliteStore>, sink: &Arc<FakeSink>, delay: Duration) -> DeliveryWorker {
    DeliveryWorker::new(store.clone(), sink.clone(), delay, fast_retry())
        .with_claim_grace(Duration::ZERO)
}

fn platform(store: &SqliteStore, channels: &[(&str, &str)], active: bool) -> Platform {
    store
        .create_platform(&NewPlatform {
            user_id: 9,
            name: "Telegram".into(),
            credentials: channels
                .iter()
                .map(|(c, t)| (c.to_string(), t.to_string()))
                .collect::<BTreeMap<_, _>>(),
            is_active: active,
        })
        .unwrap()
}

/// A destination whose event has been acknowledged (`kafka_ready`).
async fn ready(store: &SqliteStore, platform: &Platform) -> (PostDestination, PublicationEvent) {
    let (_, mut dests) = store
        .create_post(&NewPost {
            user_id: platform.user_id,
            title: "Launch".into(),
            content: "We are live".into(),
            platform_ids: vec![platform.id],
            scheduled_for: Some(Utc::now() - ChronoDuration::minutes(1)),
        })
        .unwrap();
    let dest = dests.remove(0);
    let due = store.fetch_due(100, Utc::now()).await.unwrap();
    let claimed = due
        .iter()
        .find(|d| d.destination_id == dest.id)
        .expect("destination was not claimed");
    assert!(store.mark_kafka_ready(dest.id).await.unwrap());
    (dest, PublicationEvent::from_due(claimed))
}

fn row(store: &SqliteStore, dest: &PostDestination) -> PostDestination {
    store.destination(dest.id).unwrap().unwrap()
}

#[tokio::test]
async fn delivers_to_every_channel_then_publishes() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let sink = Arc::new(FakeSink::default());
    let tg = platform(&store, &[("@alpha", "tok-a"), ("-100123", "tok-b")], true);
    let (dest, event) = ready(&store, &tg).await;

    let outcome = worker(&store, &sink, Duration::ZERO).deliver(&event).await;
    assert_eq!(outcome, Outcome::Published);

    let sent = sink.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.contains(&("@alpha".into(), "tok-a".into(), "Launch\nWe are live".into())));
    assert!(sent.contains(&("-100123".into(), "tok-b".into(), "Launch\nWe are live".into())));

    let row = row(&store, &dest);
    assert_eq!(row.status, DestinationStatus::Published);
    assert!(row.event_sent);
    assert!(row.published_at.is_some());
    assert_eq!(store.attempts(dest.id).unwrap().len(), 2);
}

#[tokio::test]
async fn duplicate_event_is_a_noop() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let sink = Arc::new(FakeSink::default());
    let tg = platform(&store, &[("@alpha", "tok")], true);
    let (_, event) = ready(&store, &tg).await;
    let worker = worker(&store, &sink, Duration::ZERO);

    assert_eq!(worker.deliver(&event).await, Outcome::Published);
    assert_eq!(worker.deliver(&event).await, Outcome::Duplicate);
    assert_eq!(sink.sent().len(), 1);
}

#[tokio::test]
async fn event_without_acknowledgement_is_not_delivered() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let sink = Arc::new(FakeSink::default());
    let tg = platform(&store, &[("@alpha", "tok")], true);
    let (_, mut dests) = store
        .create_post(&NewPost {
            user_id: 9,
            title: "Early".into(),
            content: "bird".into(),
            platform_ids: vec![tg.id],
            scheduled_for: Some(Utc::now() - ChronoDuration::minutes(1)),
        })
        .unwrap();
    let due = store.fetch_due(10, Utc::now()).await.unwrap();
    let event = PublicationEvent::from_due(&due[0]);

    // Still `processing`: the scheduler never recorded event_sent.
    let outcome = worker(&store, &sink, Duration::ZERO).deliver(&event).await;
    assert_eq!(outcome, Outcome::Duplicate);
    assert!(sink.sent().is_empty());
    assert_eq!(
        row(&store, &dests.remove(0)).status,
        DestinationStatus::Processing
    );
}

#[tokio::test]
async fn acknowledgement_landing_after_the_event_is_still_delivered() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let sink = Arc::new(FakeSink::default());
    let tg = platform(&store, &[("@alpha", "tok")], true);
    let (_, mut dests) = store
        .create_post(&NewPost {
            user_id: 9,
            title: "Racing".into(),
            content: "the scheduler".into(),
            platform_ids: vec![tg.id],
            scheduled_for: Some(Utc::now() - ChronoDuration::minutes(1)),
        })
        .unwrap();
    let dest = dests.remove(0);
    let due = store.fetch_due(10, Utc::now()).await.unwrap();
    let event = PublicationEvent::from_due(&due[0]);

    let scheduler_side = store.clone();
    let dest_id = dest.id;
    let ack = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler_side.mark_kafka_ready(dest_id).await.unwrap()
    });

    let worker = DeliveryWorker::new(store.clone(), sink.clone(), Duration::ZERO, fast_retry())
        .with_claim_grace(Duration::from_secs(2));
    assert_eq!(worker.deliver(&event).await, Outcome::Published);
    assert!(ack.await.unwrap());
    assert_eq!(row(&store, &dest).status, DestinationStatus::Published);
    assert_eq!(sink.sent().len(), 1);
}

#[tokio::test]
async fn post_to_two_accounts_of_one_platform_reaches_both() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let sink = Arc::new(FakeSink::default());
    let first = platform(&store, &[("@first", "tok-1")], true);
    let second = platform(&store, &[("@second", "tok-2")], true);
    let (_, dests) = store
        .create_post(&NewPost {
            user_id: 9,
            title: "Twice".into(),
            content: "two accounts".into(),
            platform_ids: vec![first.id, second.id],
            scheduled_for: Some(Utc::now() - ChronoDuration::minutes(1)),
        })
        .unwrap();
    let due = store.fetch_due(10, Utc::now()).await.unwrap();
    assert_eq!(due.len(), 2);

    let worker = worker(&store, &sink, Duration::ZERO);
    for d in &due {
        assert!(store.mark_kafka_ready(d.destination_id).await.unwrap());
        let outcome = worker.deliver(&PublicationEvent::from_due(d)).await;
        assert_eq!(outcome, Outcome::Published);
    }

    let mut sent: Vec<(String, String)> = sink.sent().into_iter().map(|(c, t, _)| (c, t)).collect();
    sent.sort();
    assert_eq!(
        sent,
        vec![
            ("@first".to_string(), "tok-1".to_string()),
            ("@second".to_string(), "tok-2".to_string()),
        ]
    );
    for dest in &dests {
        assert_eq!(row(&store, dest).status, DestinationStatus::Published);
    }
}

#[tokio::test]
async fn inactive_platform_fails_without_sending() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let sink = Arc::new(FakeSink::default());
    let tg = platform(&store, &[("@alpha", "tok")], true);
    let (dest, event) = ready(&store, &tg).await;
    store.set_platform_active(tg.id, false).unwrap();

    let outcome = worker(&store, &sink, Duration::ZERO).deliver(&event).await;
    assert!(matches!(outcome, Outcome::Failed(ref reason) if reason.contains("inactive")));
    assert!(sink.sent().is_empty());

    let row = row(&store, &dest);
    assert_eq!(row.status, DestinationStatus::Failed);
    assert!(row.error_message.unwrap().contains("inactive"));
}

#[tokio::test]
async fn account_without_channels_fails() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let sink = Arc::new(FakeSink::default());
    let tg = platform(&store, &[], true);
    let (dest, event) = ready(&store, &tg).await;

    let outcome = worker(&store, &sink, Duration::ZERO).deliver(&event).await;
    assert!(matches!(outcome, Outcome::Failed(_)));
    assert_eq!(row(&store, &dest).status, DestinationStatus::Failed);
}

#[tokio::test]
async fn transient_errors_are_retried() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let sink = Arc::new(FakeSink::failing(
        "@alpha",
        vec![SinkError::Unavailable("timeout".into())],
    ));
    let tg = platform(&store, &[("@alpha", "tok")], true);
    let (dest, event) = ready(&store, &tg).await;

    let outcome = worker(&store, &sink, Duration::ZERO).deliver(&event).await;
    assert_eq!(outcome, Outcome::Published);

    let attempts = store.attempts(dest.id).unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(!attempts[0].succeeded);
    assert_eq!(attempts[1].attempt, 2);
    assert!(attempts[1].succeeded);
}

#[tokio::test]
async fn retries_stop_at_the_budget() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let sink = Arc::new(FakeSink::failing(
        "@alpha",
        (0..5)
            .map(|_| SinkError::Unavailable("503".into()))
            .collect(),
    ));
    let tg = platform(&store, &[("@alpha", "tok")], true);
    let (dest, event) = ready(&store, &tg).await;

    let outcome = worker(&store, &sink, Duration::ZERO).deliver(&event).await;
    assert!(matches!(outcome, Outcome::Failed(_)));
    assert_eq!(store.attempts(dest.id).unwrap().len(), 3);
}

#[tokio::test]
async fn partial_failure_fails_destination_with_summary() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let sink = Arc::new(FakeSink::failing(
        "@broken",
        vec![SinkError::Rejected("chat not found".into())],
    ));
    let tg = platform(&store, &[("@alpha", "tok"), ("@broken", "tok")], true);
    let (dest, event) = ready(&store, &tg).await;

    let outcome = worker(&store, &sink, Duration::ZERO).deliver(&event).await;
    assert!(matches!(outcome, Outcome::Failed(_)));
    // Rejections are not retried.
    assert_eq!(store.attempts(dest.id).unwrap().len(), 2);
    assert_eq!(sink.sent().len(), 1);

    let row = row(&store, &dest);
    assert_eq!(row.status, DestinationStatus::Failed);
    let message = row.error_message.unwrap();
    assert!(message.contains("@broken"));
    assert!(message.contains("chat not found"));
}

#[tokio::test]
async fn cancelled_worker_leaves_event_untouched() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let sink = Arc::new(FakeSink::default());
    let tg = platform(&store, &[("@alpha", "tok")], true);
    let (dest, event) = ready(&store, &tg).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = worker(&store, &sink, Duration::ZERO)
        .process(event, cancel)
        .await;
    assert_eq!(outcome, Outcome::Skipped);
    assert_eq!(row(&store, &dest).status, DestinationStatus::KafkaReady);
}

#[tokio::test]
async fn cancellation_cuts_the_delay_short() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let sink = Arc::new(FakeSink::default());
    let tg = platform(&store, &[("@alpha", "tok")], true);
    let (dest, event) = ready(&store, &tg).await;

    let cancel = CancellationToken::new();
    let worker = worker(&store, &sink, Duration::from_secs(60));
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.process(event, cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("worker kept waiting after cancellation")
        .unwrap();
    assert_eq!(outcome, Outcome::Published);
    assert_eq!(row(&store, &dest).status, DestinationStatus::Published);
}

async fn wait_for_status(store: &SqliteStore, dest: &PostDestination, status: DestinationStatus) {
    for _ in 0..200 {
        if row(store, dest).status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("destination {} never reached {status}", dest.id);
}

#[tokio::test]
async fn dispatcher_skips_malformed_and_delivers_the_rest() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let sink = Arc::new(FakeSink::default());
    let tg = platform(&store, &[("@alpha", "tok")], true);
    let (dest, event) = ready(&store, &tg).await;

    let channel = MemoryChannel::new("publications.pending", 1);
    channel.publish_raw("1", b"{\"message_id\":\"oops\"}".to_vec()).unwrap();
    channel.publish(&event).await.unwrap();

    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(worker(&store, &sink, Duration::ZERO), 4, tracker.clone());
    let consumer = Box::new(channel.consumer("workers").unwrap());
    let run = tokio::spawn(dispatcher.run(consumer, cancel.clone()));

    wait_for_status(&store, &dest, DestinationStatus::Published).await;
    cancel.cancel();
    run.await.unwrap();
    tracker.close();
    tracker.wait().await;

    assert_eq!(sink.sent().len(), 1);
    // Both the malformed message and the event were committed.
    assert_eq!(channel.committed("workers", 0).unwrap(), Some(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatcher_bounds_concurrent_workers() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let sink = Arc::new(FakeSink {
        pause: Duration::from_millis(50),
        ..FakeSink::default()
    });
    let tg = platform(&store, &[("@alpha", "tok")], true);
    let channel = MemoryChannel::new("t", 2);
    let mut dests = Vec::new();
    for _ in 0..6 {
        let (dest, event) = ready(&store, &tg).await;
        channel.publish(&event).await.unwrap();
        dests.push(dest);
    }

    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(worker(&store, &sink, Duration::ZERO), 2, tracker.clone());
    let run = tokio::spawn(dispatcher.run(Box::new(channel.consumer("g").unwrap()), cancel.clone()));

    for dest in &dests {
        wait_for_status(&store, dest, DestinationStatus::Published).await;
    }
    cancel.cancel();
    run.await.unwrap();

    assert_eq!(sink.sent().len(), 6);
    assert!(sink.max_in_flight.load(Ordering::SeqCst) <= 2);
}
