//! Session staging, commit/rollback and publish-revival behavior, driven
//! through the public API against the in-memory broker backend.

use std::sync::Arc;

use courier::{AmqpConfig, AmqpService, Context, MemoryBroker, MessageSpec};

fn test_service(broker: &MemoryBroker) -> Arc<AmqpService> {
    let config = AmqpConfig::new("memory://test").with_app_id("test-app");
    AmqpService::new(config, Arc::new(broker.clone()))
}

#[tokio::test]
async fn commit_publishes_staged_messages_in_order() {
    let broker = MemoryBroker::new();
    let service = test_service(&broker);
    let pool = service.pool();

    let context = Context::new("POST", "/orders");
    let session = pool.acquire(&context);
    session.add(MessageSpec::new().routing_key("first").body(b"1".to_vec()));
    session.add(MessageSpec::new().routing_key("second").body(b"2".to_vec()));
    session.commit().await.unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].routing_key, "first");
    assert_eq!(published[1].routing_key, "second");
    assert_eq!(published[0].app_id.as_deref(), Some("test-app"));

    // staged and prepared lists are empty now: another commit is a no-op
    session.commit().await.unwrap();
    assert_eq!(broker.published().len(), 2);
}

#[tokio::test]
async fn message_ids_are_unique_across_commits() {
    let broker = MemoryBroker::new();
    let service = test_service(&broker);
    let pool = service.pool();

    let context = Context::new("POST", "/batch");
    let session = pool.acquire(&context);
    for _ in 0..5 {
        session.add(MessageSpec::new().routing_key("q"));
    }
    session.commit().await.unwrap();
    session.add(MessageSpec::new().routing_key("q"));
    session.commit().await.unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 6);
    let mut ids: Vec<&str> = published.iter().map(|m| m.message_id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 6);
}

#[tokio::test]
async fn rollback_discards_staged_work() {
    let broker = MemoryBroker::new();
    let service = test_service(&broker);
    let pool = service.pool();

    let context = Context::new("POST", "/abandoned");
    let session = pool.acquire(&context);
    session.add(MessageSpec::new().routing_key("q").body(b"x".to_vec()));
    session.rollback();
    session.commit().await.unwrap();
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn publish_revives_once_and_retries_after_transport_error() {
    let broker = MemoryBroker::new();
    let service = test_service(&broker);
    let pool = service.pool();

    let context = Context::new("POST", "/flaky");
    let session = pool.acquire(&context);

    broker.fail_next_publishes(1);
    session
        .publish(MessageSpec::new().routing_key("q").body(b"x".to_vec()))
        .await
        .unwrap();

    // published exactly once, over a revived connection
    assert_eq!(broker.published().len(), 1);
    assert_eq!(broker.connect_count(), 2);
    assert!(session.is_connected());
}

#[tokio::test]
async fn second_publish_failure_keeps_message_prepared_for_retry() {
    let broker = MemoryBroker::new();
    let service = test_service(&broker);
    let pool = service.pool();

    let context = Context::new("POST", "/flaky");
    let session = pool.acquire(&context);
    session.add(MessageSpec::new().routing_key("q").body(b"x".to_vec()));

    broker.fail_next_publishes(2);
    let err = session.commit().await.unwrap_err();
    assert!(matches!(err, courier::AmqpError::PublishFailed(_)));
    assert!(broker.published().is_empty());

    // the prepared message survived the failure; a later commit delivers it
    session.commit().await.unwrap();
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "q");
}

#[tokio::test]
async fn lazy_payload_is_materialized_by_flush() {
    let broker = MemoryBroker::new();
    let service = test_service(&broker);
    let pool = service.pool();

    let context = Context::new("POST", "/lazy");
    let session = pool.acquire(&context);
    let secret = "deferred".to_string();
    session.add(
        MessageSpec::new()
            .routing_key("q")
            .json_lazy(move || serde_json::json!({ "value": secret })),
    );
    session.flush().unwrap();
    session.commit().await.unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].content_type.as_deref(), Some("application/json"));
    let value: serde_json::Value = serde_json::from_slice(&published[0].body).unwrap();
    assert_eq!(value["value"], "deferred");
}
