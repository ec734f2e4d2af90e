//! Request/reply over the direct-reply queue: correlation-id matching,
//! timeouts and connection loss.

use std::sync::Arc;
use std::time::Duration;

use courier::{
    AmqpConfig, AmqpError, AmqpService, Context, MemoryBroker, MessageSpec, DIRECT_REPLY_QUEUE,
};

fn test_service(broker: &MemoryBroker) -> Arc<AmqpService> {
    let mut config = AmqpConfig::new("memory://test").with_app_id("rpc-test");
    config.event_wait_seconds = 1;
    AmqpService::new(config, Arc::new(broker.clone()))
}

/// Consumes `rpc.worker` and answers `ping` requests with a JSON pong.
fn spawn_responder(service: &Arc<AmqpService>) -> tokio::task::JoinHandle<()> {
    service.consumer("worker").add_queue("rpc.worker");
    let pool = service.pool();
    service.task("worker", "ping", move |context, delivery| {
        let pool = Arc::clone(&pool);
        async move {
            let session = pool.acquire(&context);
            session
                .respond(
                    &context,
                    MessageSpec::new().json(&serde_json::json!({ "pong": true }))?,
                )
                .await?;
            delivery.ack().await?;
            Ok(())
        }
    });
    let runner = Arc::clone(service);
    tokio::spawn(async move {
        runner.run().await.unwrap();
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_receives_correlated_reply() {
    let broker = MemoryBroker::new();
    let service = test_service(&broker);
    let run = spawn_responder(&service);

    let context = Context::new("POST", "/check");
    let session = service.session(&context);
    let reply = session
        .request(
            MessageSpec::new()
                .routing_key("rpc.worker")
                .message_type("ping")
                .json(&serde_json::json!({ "n": 1 }))
                .unwrap(),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let value: serde_json::Value = reply.json().unwrap();
    assert_eq!(value["pong"], true);

    // The request went out with a generated correlation id equal to its
    // message id, and the reply came back under the same id, addressed to
    // the requester's private reply queue.
    let published = broker.published();
    let request = published
        .iter()
        .find(|m| m.routing_key == "rpc.worker")
        .unwrap();
    assert_eq!(
        request.correlation_id.as_deref(),
        Some(request.message_id.as_str())
    );
    let reply_to = request.reply_to.clone().unwrap();
    assert!(reply_to.starts_with(DIRECT_REPLY_QUEUE));
    let response = published.iter().find(|m| m.routing_key == reply_to).unwrap();
    assert_eq!(response.correlation_id, request.correlation_id);
    assert_eq!(
        reply.properties.correlation_id,
        request.correlation_id
    );

    service.stop();
    run.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_request_leaves_session_usable() {
    let broker = MemoryBroker::new();
    let service = test_service(&broker);
    let run = spawn_responder(&service);

    let context = Context::new("POST", "/check");
    let session = service.session(&context);

    // nobody consumes this queue, so the reply never comes
    let err = session
        .request(
            MessageSpec::new()
                .routing_key("rpc.nowhere")
                .message_type("ping"),
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AmqpError::RequestTimeout(_)));
    assert!(session.is_connected());

    // the same session still does RPC with a fresh correlation id
    let reply = session
        .request(
            MessageSpec::new()
                .routing_key("rpc.worker")
                .message_type("ping"),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    let value: serde_json::Value = reply.json().unwrap();
    assert_eq!(value["pong"], true);

    service.stop();
    run.await.unwrap();
}

#[tokio::test]
async fn connection_loss_during_wait_closes_session() {
    let broker = MemoryBroker::new();
    let service = test_service(&broker);

    let context = Context::new("POST", "/check");
    let session = service.session(&context);

    // arm the reply consumer by publishing a direct-reply request
    session
        .publish(
            MessageSpec::new()
                .routing_key("rpc.nowhere")
                .message_type("ping")
                .reply_to(DIRECT_REPLY_QUEUE),
        )
        .await
        .unwrap();

    broker.drop_connections();
    let err = session
        .wait("no-such-correlation", Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, AmqpError::ConnectionLost(_)));
    assert!(!session.is_connected());

    // a closed session does not go back to the pool
    drop(context);
    assert_eq!(service.pool().idle_count(), 0);
}

#[tokio::test]
async fn unreachable_broker_fails_after_bounded_attempts() {
    let broker = MemoryBroker::new();
    let mut config = AmqpConfig::new("memory://test");
    config.connect_attempts = 1;
    let service = AmqpService::new(config, Arc::new(broker.clone()));

    broker.refuse_next_connects(1);
    let err = service.run().await.unwrap_err();
    assert!(matches!(
        err,
        AmqpError::BrokerUnreachable { attempts: 1, .. }
    ));
}
