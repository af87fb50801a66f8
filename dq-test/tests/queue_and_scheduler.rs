//! End-to-end scenarios against a real Redis, one container per test.

use std::time::Duration;

use chrono::Utc;
use dq_core::{ContentKind, Value};
use dq_queue::Queue;
use dq_scheduler::Scheduler;
use dq_test::RedisFixture;

fn json(value: serde_json::Value) -> Value {
    Value::Structured(value)
}

#[tokio::test]
async fn fifo_basic() {
    let redis = RedisFixture::start().await;
    let queue = Queue::builder()
        .server(redis.url())
        .namespace("stuff")
        .unwrap()
        .content_kind(ContentKind::Structured)
        .build()
        .unwrap();

    let task = json(serde_json::json!({"hello": "world"}));
    queue.push(&task, None).await.unwrap();

    assert_eq!(queue.peek().await.unwrap(), Some(task.clone()));

    let popped = queue.pop(true, false).await.unwrap().unwrap();
    assert_eq!(popped.into_value(), task);

    assert!(queue.pop(true, false).await.unwrap().is_none());
}

#[tokio::test]
async fn lease_and_complete() {
    let redis = RedisFixture::start().await;
    let queue = Queue::builder()
        .server(redis.url())
        .namespace("stuff3")
        .unwrap()
        .content_kind(ContentKind::Structured)
        .build()
        .unwrap();

    let task = json(serde_json::json!({"a": 1}));
    queue.push(&task, None).await.unwrap();

    let popped = queue.pop(false, false).await.unwrap().unwrap();
    assert_eq!(popped.into_value(), task.clone());
    assert_eq!(queue.number_in_progress().await.unwrap(), 1);

    queue.complete(&task, None).await.unwrap();
    assert_eq!(queue.size().await.unwrap(), 0);
    assert_eq!(queue.number_in_progress().await.unwrap(), 0);
    assert_eq!(queue.number_active_workers().await.unwrap(), 1);
}

#[tokio::test]
async fn reclaim_across_workers() {
    let redis = RedisFixture::start().await;
    let qa = Queue::builder()
        .server(redis.url())
        .namespace("stuff2")
        .unwrap()
        .content_kind(ContentKind::Structured)
        .worker_id("a")
        .work_ttl(Duration::from_secs(1))
        .build()
        .unwrap();
    let qb = Queue::builder()
        .server(redis.url())
        .namespace("stuff2")
        .unwrap()
        .content_kind(ContentKind::Structured)
        .worker_id("b")
        .work_ttl(Duration::from_secs(1))
        .build()
        .unwrap();

    let task = json(serde_json::json!({"hello": "cruelworld"}));
    qa.push(&task, None).await.unwrap();

    let popped = qb.pop(false, false).await.unwrap().unwrap();
    assert_eq!(popped.into_value(), task);

    tokio::time::sleep(Duration::from_millis(1750)).await;
    qa.reclaim_tasks().await.unwrap();

    assert_eq!(qb.size().await.unwrap(), 1);
    assert_eq!(qb.number_in_progress().await.unwrap(), 0);
}

#[tokio::test]
async fn dedup_on_push() {
    let redis = RedisFixture::start().await;
    let queue = Queue::builder()
        .server(redis.url())
        .namespace("stuff5")
        .unwrap()
        .content_kind(ContentKind::String)
        .track_entries(true)
        .build()
        .unwrap();

    queue
        .push(&Value::from("hello"), Some(&Value::from("payload1")))
        .await
        .unwrap();
    queue
        .push(&Value::from("hello"), Some(&Value::from("payload2")))
        .await
        .unwrap();

    assert_eq!(queue.size().await.unwrap(), 1);

    let popped = queue.pop(true, false).await.unwrap().unwrap();
    assert_eq!(popped.into_value(), Value::from("payload2"));
}

#[tokio::test]
async fn pipe_on_completion() {
    let redis = RedisFixture::start().await;
    let second = Queue::builder()
        .server(redis.url())
        .namespace("abc_errors")
        .unwrap()
        .content_kind(ContentKind::String)
        .build()
        .unwrap();
    let first = Queue::builder()
        .server(redis.url())
        .namespace("abc")
        .unwrap()
        .content_kind(ContentKind::String)
        .pipe("error", second.clone())
        .build()
        .unwrap();

    first
        .push(&Value::from("a"), Some(&Value::from("aaa")))
        .await
        .unwrap();

    let popped = first.pop(false, false).await.unwrap().unwrap();
    let (key, payload) = popped.into_key_and_payload();
    assert_eq!(key, Value::from("a"));
    assert_eq!(payload, Value::from("aaa"));

    first.complete(&Value::from("a"), Some("error")).await.unwrap();
    assert_eq!(first.size().await.unwrap(), 0);

    assert_eq!(second.size().await.unwrap(), 1);
    assert_eq!(second.peek().await.unwrap(), Some(Value::from("a")));
    let routed = second.pop(true, false).await.unwrap().unwrap();
    assert_eq!(routed.into_value(), Value::from("aaa"));
}

#[tokio::test]
async fn scheduler_lifecycle() {
    let redis = RedisFixture::start().await;
    let scheduler = Scheduler::builder()
        .server(redis.url())
        .namespace("reminders")
        .unwrap()
        .content_kind(ContentKind::String)
        .build()
        .unwrap();

    let foo = Value::from("foo");
    let fire_at = Utc::now() + chrono::Duration::seconds(1);
    scheduler.schedule(&foo, fire_at, None, None).await.unwrap();
    assert!(scheduler.is_scheduled(&foo).await.unwrap());
    assert!(scheduler.pop_due(None, false).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_secs(1)).await;
    let (key, payload) = scheduler
        .pop_due(Some(Duration::from_secs(1)), false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key, foo.clone());
    assert_eq!(payload, foo.clone());
    assert!(!scheduler.is_scheduled(&foo).await.unwrap());

    tokio::time::sleep(Duration::from_secs(2)).await;
    scheduler.reschedule_dropped_items().await.unwrap();
    assert!(scheduler.is_scheduled(&foo).await.unwrap());
    assert_eq!(scheduler.peek_due().await.unwrap(), Some(foo.clone()));

    let (key, payload) = scheduler.pop_due(None, false).await.unwrap().unwrap();
    assert_eq!(key, foo.clone());
    assert_eq!(payload, foo.clone());
    scheduler.complete(&foo).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    scheduler.reschedule_dropped_items().await.unwrap();
    assert!(!scheduler.is_scheduled(&foo).await.unwrap());
}
