//! Dispatcher acknowledgment discipline and run-loop failure recovery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier::transport::memory::SettleAction;
use courier::{AmqpConfig, AmqpService, Context, MemoryBroker, MessageSpec};

fn test_service(broker: &MemoryBroker) -> Arc<AmqpService> {
    let mut config = AmqpConfig::new("memory://test").with_app_id("consume-test");
    config.event_wait_seconds = 1;
    AmqpService::new(config, Arc::new(broker.clone()))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

async fn publish_task(service: &Arc<AmqpService>, queue: &str, message_type: &str) {
    let context = Context::new("POST", "/publish");
    let session = service.session(&context);
    session
        .publish(
            MessageSpec::new()
                .routing_key(queue)
                .message_type(message_type)
                .body(b"payload".to_vec()),
        )
        .await
        .unwrap();
    context.finish();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_handler_message_is_rejected_once_and_loop_continues() {
    let broker = MemoryBroker::new();
    let service = test_service(&broker);
    service.consumer("worker").add_queue("jobs");

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    service.task("worker", "ok", move |_context, delivery| {
        let counter = Arc::clone(&counter);
        async move {
            delivery.ack().await?;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    // fails without acking or rejecting
    service.task("worker", "boom", |_context, _delivery| async move {
        anyhow::bail!("handler exploded")
    });

    let runner = Arc::clone(&service);
    let run = tokio::spawn(async move { runner.run().await.unwrap() });

    publish_task(&service, "jobs", "boom").await;
    publish_task(&service, "jobs", "ok").await;

    wait_until(|| handled.load(Ordering::SeqCst) == 1).await;
    wait_until(|| !broker.settlements().is_empty()).await;

    let published = broker.published();
    let boom_id = published
        .iter()
        .find(|m| m.message_type.as_deref() == Some("boom"))
        .unwrap()
        .message_id
        .clone();
    let ok_id = published
        .iter()
        .find(|m| m.message_type.as_deref() == Some("ok"))
        .unwrap()
        .message_id
        .clone();

    wait_until(|| broker.settlements().len() >= 2).await;
    let settlements = broker.settlements();
    let boom_settlements: Vec<_> = settlements.iter().filter(|(id, _)| *id == boom_id).collect();
    assert_eq!(boom_settlements.len(), 1, "rejected exactly once");
    assert_eq!(
        boom_settlements[0].1,
        SettleAction::Reject { requeue: false }
    );
    assert!(settlements.contains(&(ok_id, SettleAction::Ack)));

    service.stop();
    run.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_without_handler_is_rejected() {
    let broker = MemoryBroker::new();
    let service = test_service(&broker);
    service.consumer("worker").add_queue("jobs");
    service.task("worker", "known", |_context, delivery| async move {
        delivery.ack().await?;
        Ok(())
    });

    let runner = Arc::clone(&service);
    let run = tokio::spawn(async move { runner.run().await.unwrap() });

    publish_task(&service, "jobs", "mystery").await;
    wait_until(|| !broker.settlements().is_empty()).await;

    let settlements = broker.settlements();
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].1, SettleAction::Reject { requeue: false });

    service.stop();
    run.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_loop_revives_consumers_after_connection_loss() {
    let broker = MemoryBroker::new();
    let service = test_service(&broker);
    service.consumer("worker").add_queue("jobs");

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    service.task("worker", "ok", move |_context, delivery| {
        let counter = Arc::clone(&counter);
        async move {
            delivery.ack().await?;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let runner = Arc::clone(&service);
    let run = tokio::spawn(async move { runner.run().await.unwrap() });

    publish_task(&service, "jobs", "ok").await;
    wait_until(|| handled.load(Ordering::SeqCst) == 1).await;
    let connects_before = broker.connect_count();

    broker.drop_connections();
    wait_until(|| broker.connect_count() > connects_before).await;

    // routing by (consumer, type) survived the reconnect
    publish_task(&service, "jobs", "ok").await;
    wait_until(|| handled.load(Ordering::SeqCst) == 2).await;

    service.stop();
    run.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_connection_loss_is_caught_by_heartbeat_probe() {
    let broker = MemoryBroker::new();
    let service = test_service(&broker);
    service.consumer("worker").add_queue("jobs");

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    service.task("worker", "ok", move |_context, delivery| {
        let counter = Arc::clone(&counter);
        async move {
            delivery.ack().await?;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let runner = Arc::clone(&service);
    let run = tokio::spawn(async move { runner.run().await.unwrap() });

    publish_task(&service, "jobs", "ok").await;
    wait_until(|| handled.load(Ordering::SeqCst) == 1).await;
    let connects_before = broker.connect_count();

    broker.drop_connections_silently();
    // next idle drain slice ends in a heartbeat probe, which notices
    wait_until(|| broker.connect_count() > connects_before).await;

    publish_task(&service, "jobs", "ok").await;
    wait_until(|| handled.load(Ordering::SeqCst) == 2).await;

    service.stop();
    run.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_flag_exits_the_loop() {
    let broker = MemoryBroker::new();
    let service = test_service(&broker);
    service.consumer("worker").add_queue("jobs");

    let runner = Arc::clone(&service);
    let run = tokio::spawn(async move { runner.run().await.unwrap() });
    wait_until({
        let service = Arc::clone(&service);
        move || service.is_running()
    })
    .await;

    service.stop();
    tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .expect("run loop did not exit after stop")
        .unwrap();
}
