//! Tests for the subscription registry: task:init on attach, bus fan-out,
//! per-request isolation, heartbeats, and teardown of failed subscribers.

use std::sync::Arc;
use std::time::Duration;

use kiln::bus::{Envelope, EventBus, EventType, LocalBus};
use kiln::db::Db;
use kiln::error::KilnError;
use kiln::model::{Image, ImageJob, Request};
use kiln::registry::SubscriptionRegistry;
use kiln::store::Store;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const HEARTBEAT: Duration = Duration::from_millis(50);

async fn seeded() -> (Arc<Store>, Request) {
    let db = Arc::new(Db::open_in_memory().unwrap());
    let store = Arc::new(Store::new(db, "http://proxy.local"));
    let request = Request::new("user-1", "a small pink donkey");
    let images: Vec<Image> = (0..4).map(|i| Image::new(&request.id, i)).collect();
    let jobs: Vec<ImageJob> = images.iter().map(|img| ImageJob::new(&img.id, 0, 3)).collect();
    store
        .insert_request_graph(request.clone(), images, jobs)
        .await
        .unwrap();
    (store, request)
}

#[tokio::test]
async fn attach_rejects_unknown_request() {
    let (store, _) = seeded().await;
    let registry = Arc::new(SubscriptionRegistry::new(store, HEARTBEAT));
    let err = registry.attach("ghost").await.unwrap_err();
    assert!(matches!(err, KilnError::NotFound(_)));
}

#[tokio::test]
async fn attach_delivers_task_init_first() {
    let (store, request) = seeded().await;
    let registry = Arc::new(SubscriptionRegistry::new(store, Duration::from_secs(30)));

    let mut subscription = registry.attach(&request.id).await.unwrap();
    let first = subscription.recv().await.unwrap();
    assert_eq!(first.event_type, EventType::TaskInit);
    assert_eq!(first.task_id, request.id);
    assert_eq!(first.data["request"]["status"], "IMAGE_PENDING");
    assert_eq!(first.data["images"].as_array().unwrap().len(), 4);
    assert!(first.data["model"].is_null());
}

#[tokio::test]
async fn pump_fans_out_to_matching_bucket_only() {
    let (store, request) = seeded().await;
    let other = Request::new("user-2", "a different thing");
    // Second request exists only so there is a second bucket to miss.
    let images: Vec<Image> = (0..4).map(|i| Image::new(&other.id, i)).collect();
    let jobs: Vec<ImageJob> = images.iter().map(|img| ImageJob::new(&img.id, 0, 3)).collect();
    store.insert_request_graph(other.clone(), images, jobs).await.unwrap();

    let registry = Arc::new(SubscriptionRegistry::new(store, Duration::from_secs(30)));
    let bus = LocalBus::new();
    let shutdown = CancellationToken::new();
    registry.spawn_pump(&bus, shutdown.clone());

    let mut ours = registry.attach(&request.id).await.unwrap();
    let mut theirs = registry.attach(&other.id).await.unwrap();
    assert_eq!(ours.recv().await.unwrap().event_type, EventType::TaskInit);
    assert_eq!(theirs.recv().await.unwrap().event_type, EventType::TaskInit);

    bus.publish(Envelope::new(
        &request.id,
        EventType::ImageGenerating,
        json!({ "imageId": "img-1", "index": 0, "prompt": "p" }),
    ))
    .await;

    let received = tokio::time::timeout(Duration::from_secs(2), ours.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.event_type, EventType::ImageGenerating);

    // The other bucket sees nothing but its own heartbeat-free silence.
    let nothing = tokio::time::timeout(Duration::from_millis(100), theirs.recv()).await;
    assert!(nothing.is_err());

    shutdown.cancel();
}

#[tokio::test]
async fn all_subscribers_of_a_request_receive_events() {
    let (store, request) = seeded().await;
    let registry = Arc::new(SubscriptionRegistry::new(store, Duration::from_secs(30)));
    let bus = LocalBus::new();
    let shutdown = CancellationToken::new();
    registry.spawn_pump(&bus, shutdown.clone());

    let mut a = registry.attach(&request.id).await.unwrap();
    let mut b = registry.attach(&request.id).await.unwrap();
    a.recv().await.unwrap();
    b.recv().await.unwrap();
    assert_eq!(registry.subscriber_count(&request.id), 2);

    bus.publish(Envelope::task_updated(&request.id, "IMAGE_COMPLETED", "AWAITING_SELECTION"))
        .await;

    for sub in [&mut a, &mut b] {
        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, EventType::TaskUpdated);
        assert_eq!(event.data["status"], "IMAGE_COMPLETED");
    }

    shutdown.cancel();
}

#[tokio::test]
async fn heartbeats_arrive_on_schedule() {
    let (store, request) = seeded().await;
    let registry = Arc::new(SubscriptionRegistry::new(store, HEARTBEAT));

    let mut subscription = registry.attach(&request.id).await.unwrap();
    subscription.recv().await.unwrap(); // task:init

    let heartbeat = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(heartbeat.event_type, EventType::Heartbeat);
    assert!(heartbeat.data["timestamp"].is_string());
}

#[tokio::test]
async fn dropped_subscriber_is_removed_on_next_send() {
    let (store, request) = seeded().await;
    let registry = Arc::new(SubscriptionRegistry::new(store, Duration::from_secs(30)));

    let subscription = registry.attach(&request.id).await.unwrap();
    assert_eq!(registry.subscriber_count(&request.id), 1);
    drop(subscription);

    registry.dispatch(&Envelope::heartbeat(&request.id));
    assert_eq!(registry.subscriber_count(&request.id), 0);
}

#[tokio::test]
async fn detach_removes_subscriber_immediately() {
    let (store, request) = seeded().await;
    let registry = Arc::new(SubscriptionRegistry::new(store, Duration::from_secs(30)));

    let subscription = registry.attach(&request.id).await.unwrap();
    registry.detach(&request.id, subscription.id);
    assert_eq!(registry.subscriber_count(&request.id), 0);
}
