//! End-to-end bus behavior over the in-process transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use bus::message::fields;
use bus::{BusConfig, HandlerError, Message, MessageBroker};

type Seen = Arc<Mutex<Vec<Message>>>;

fn recorder() -> Seen {
    Arc::new(Mutex::new(Vec::new()))
}

async fn subscribe_recording(broker: &MessageBroker, pattern: &str, seen: &Seen) {
    let sink = Arc::clone(seen);
    broker
        .subscribe(pattern, move |msg| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(msg);
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap();
}

/// Poll until `seen` holds at least `count` messages or the budget runs out.
async fn wait_for(seen: &Seen, count: usize) {
    for _ in 0..200 {
        if seen.lock().unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn saga_started_reaches_its_subscriber() {
    let broker = MessageBroker::from_config(&BusConfig::memory());
    let seen = recorder();
    subscribe_recording(&broker, "saga.started", &seen).await;

    broker.start().await.unwrap();
    broker
        .emit(
            "saga.started",
            fields(json!({ "saga_id": "s1" })),
            Some(fields(json!({ "actor_id": "a1" }))),
        )
        .await
        .unwrap();

    wait_for(&seen, 1).await;
    // Give a duplicate a chance to show up before asserting exactly once.
    tokio::time::sleep(Duration::from_millis(30)).await;

    let messages = seen.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic, "saga.started");
    assert_eq!(messages[0].payload, fields(json!({ "saga_id": "s1" })));
    assert_eq!(messages[0].metadata, fields(json!({ "actor_id": "a1" })));

    drop(messages);
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn non_matching_topic_is_never_delivered() {
    let broker = MessageBroker::from_config(&BusConfig::memory());
    let seen = recorder();
    subscribe_recording(&broker, "story.created", &seen).await;

    broker.start().await.unwrap();
    broker
        .emit("story.deleted", fields(json!({})), None)
        .await
        .unwrap();
    // FIFO: once the sentinel arrives, story.deleted has been fanned out.
    broker
        .emit("story.created", fields(json!({ "sentinel": true })), None)
        .await
        .unwrap();

    wait_for(&seen, 1).await;
    let messages = seen.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic, "story.created");

    drop(messages);
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn wildcard_and_exact_patterns_fan_out() {
    let broker = MessageBroker::from_config(&BusConfig::memory());
    let wildcard = recorder();
    let twin = recorder();
    let exact = recorder();
    subscribe_recording(&broker, "story.*", &wildcard).await;
    subscribe_recording(&broker, "story.*", &twin).await;
    subscribe_recording(&broker, "story.created", &exact).await;

    broker.start().await.unwrap();
    broker
        .emit("story.created", fields(json!({ "story_id": "s1" })), None)
        .await
        .unwrap();
    broker
        .emit("story.updated", fields(json!({ "story_id": "s1" })), None)
        .await
        .unwrap();
    broker
        .emit("saga.started", fields(json!({})), None)
        .await
        .unwrap();

    wait_for(&wildcard, 2).await;
    wait_for(&twin, 2).await;
    wait_for(&exact, 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(wildcard.lock().unwrap().len(), 2);
    assert_eq!(twin.lock().unwrap().len(), 2);
    assert_eq!(exact.lock().unwrap().len(), 1);

    // Both same-pattern handlers saw an equivalent value.
    let a = wildcard.lock().unwrap()[0].clone();
    let b = twin.lock().unwrap()[0].clone();
    assert_eq!(a, b);

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn double_start_delivers_each_message_once() {
    let broker = MessageBroker::from_config(&BusConfig::memory());
    let seen = recorder();
    subscribe_recording(&broker, "story.*", &seen).await;

    broker.start().await.unwrap();
    broker.start().await.unwrap();
    broker
        .emit("story.created", fields(json!({})), None)
        .await
        .unwrap();

    wait_for(&seen, 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn stop_when_already_stopped_is_ok() {
    let broker = MessageBroker::from_config(&BusConfig::memory());
    assert!(broker.stopped());
    broker.stop().await.unwrap();
    broker.start().await.unwrap();
    broker.stop().await.unwrap();
    broker.stop().await.unwrap();
    assert!(broker.stopped());
}

#[tokio::test]
async fn subscribe_after_start_takes_effect() {
    let broker = MessageBroker::from_config(&BusConfig::memory());
    broker.start().await.unwrap();

    let seen = recorder();
    subscribe_recording(&broker, "saga.*", &seen).await;
    broker
        .emit("saga.advanced", fields(json!({})), None)
        .await
        .unwrap();

    wait_for(&seen, 1).await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn subscription_added_mid_fan_out_waits_for_next_message() {
    let broker = Arc::new(MessageBroker::from_config(&BusConfig::memory()));
    let outer = recorder();
    let late = recorder();

    // The outer handler registers a second recorder for the same pattern
    // from inside its own invocation.
    let registrar = Arc::clone(&broker);
    let outer_sink = Arc::clone(&outer);
    let late_sink = Arc::clone(&late);
    broker
        .subscribe("story.*", move |msg| {
            let registrar = Arc::clone(&registrar);
            let outer_sink = Arc::clone(&outer_sink);
            let late_sink = Arc::clone(&late_sink);
            async move {
                subscribe_recording(&registrar, "story.*", &late_sink).await;
                outer_sink.lock().unwrap().push(msg);
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap();

    broker.start().await.unwrap();
    broker
        .emit("story.created", fields(json!({})), None)
        .await
        .unwrap();

    wait_for(&outer, 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    // The fan-out snapshot was taken at dequeue; the handler registered
    // during it must not see the message that triggered its registration.
    assert!(late.lock().unwrap().is_empty());

    broker
        .emit("story.updated", fields(json!({})), None)
        .await
        .unwrap();
    wait_for(&late, 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let late_seen = late.lock().unwrap();
    assert_eq!(late_seen.len(), 1);
    assert_eq!(late_seen[0].topic, "story.updated");

    drop(late_seen);
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn messages_queued_while_stopped_survive_restart() {
    let broker = MessageBroker::from_config(&BusConfig::memory());
    let seen = recorder();
    subscribe_recording(&broker, "story.*", &seen).await;

    // Not started yet: publish queues, nothing is delivered.
    broker
        .emit("story.created", fields(json!({})), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(seen.lock().unwrap().is_empty());

    broker.start().await.unwrap();
    wait_for(&seen, 1).await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn restart_after_stop_resumes_delivery() {
    let broker = MessageBroker::from_config(&BusConfig::memory());
    let seen = recorder();
    subscribe_recording(&broker, "story.*", &seen).await;

    broker.start().await.unwrap();
    broker
        .emit("story.created", fields(json!({})), None)
        .await
        .unwrap();
    wait_for(&seen, 1).await;

    broker.stop().await.unwrap();
    assert!(broker.stopped());

    // No consumer task is running; the message sits in the queue.
    broker
        .emit("story.updated", fields(json!({})), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    // A fresh consumer task drains what accumulated while stopped.
    broker.start().await.unwrap();
    wait_for(&seen, 2).await;

    let messages = seen.lock().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].topic, "story.updated");

    drop(messages);
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn emit_message_preserves_identity_in_process() {
    let broker = MessageBroker::from_config(&BusConfig::memory());
    let seen = recorder();
    subscribe_recording(&broker, "saga.*", &seen).await;
    broker.start().await.unwrap();

    let cause = Message::new("saga.started", fields(json!({}))).unwrap();
    let follow = Message::new("saga.advanced", fields(json!({})))
        .unwrap()
        .with_causation_id(cause.id)
        .with_correlation_id(cause.id);
    let expected_id = follow.id;

    broker.emit_message(follow).await.unwrap();

    wait_for(&seen, 1).await;
    let messages = seen.lock().unwrap();
    assert_eq!(messages[0].id, expected_id);
    assert_eq!(messages[0].causation_id, Some(cause.id));
    assert_eq!(messages[0].correlation_id, Some(cause.id));

    drop(messages);
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn failing_handler_does_not_starve_the_rest() {
    let broker = MessageBroker::from_config(&BusConfig::memory());
    broker
        .subscribe("story.*", |_| async {
            Err::<(), HandlerError>("handler exploded".into())
        })
        .await
        .unwrap();
    let seen = recorder();
    subscribe_recording(&broker, "story.*", &seen).await;

    broker.start().await.unwrap();
    broker
        .emit("story.created", fields(json!({})), None)
        .await
        .unwrap();
    broker
        .emit("story.updated", fields(json!({})), None)
        .await
        .unwrap();

    wait_for(&seen, 2).await;
    assert_eq!(seen.lock().unwrap().len(), 2);

    broker.stop().await.unwrap();
}
