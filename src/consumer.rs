use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::context::Context;
use crate::message::Delivery;
use crate::transport::{DeliveryCallback, Link, LinkError};

/// Context attribute carrying the raw inbound message, so `respond` can
/// address its reply.
pub const INBOUND_MESSAGE_ATTR: &str = "amqp.message";

/// Handler invoked for one consumed message.
pub type TaskHandler =
    Arc<dyn Fn(Arc<Context>, Delivery) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// One named consumer: a delivery-tag prefix plus the queues it reads.
/// Queues must be declared and bound by the caller before `run` starts;
/// nothing here auto-declares.
pub struct Consumer {
    name: String,
    queues: Mutex<Vec<String>>,
}

impl Consumer {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queues: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_queue(&self, queue: impl Into<String>) {
        self.queues.lock().unwrap().push(queue.into());
    }

    fn queues(&self) -> Vec<String> {
        self.queues.lock().unwrap().clone()
    }
}

/// Maps (consumer name, message type) to task handlers and creates named
/// consumers lazily.
pub struct ConsumerRegistry {
    handlers: Mutex<HashMap<(String, String), TaskHandler>>,
    consumers: Mutex<HashMap<String, Arc<Consumer>>>,
}

impl ConsumerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// Register `handler` for `message_type` on `consumer`. Registering the
    /// same pair again replaces the previous handler.
    pub fn register(&self, consumer: &str, message_type: &str, handler: TaskHandler) {
        let prior = self
            .handlers
            .lock()
            .unwrap()
            .insert((consumer.to_string(), message_type.to_string()), handler);
        if prior.is_some() {
            warn!(consumer, message_type, "replacing registered task handler");
        }
    }

    /// The consumer registered under `name`, created on first reference.
    pub fn consumer(&self, name: &str) -> Arc<Consumer> {
        let mut consumers = self.consumers.lock().unwrap();
        Arc::clone(
            consumers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Consumer::new(name))),
        )
    }

    fn handler(&self, consumer: &str, message_type: &str) -> Option<TaskHandler> {
        self.handlers
            .lock()
            .unwrap()
            .get(&(consumer.to_string(), message_type.to_string()))
            .cloned()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Consumer>> {
        self.consumers.lock().unwrap().values().cloned().collect()
    }
}

/// Start consuming every queue registered on `consumer`, with tags prefixed
/// by the consumer name so deliveries route back to its handler map.
pub(crate) async fn arm_consumer(
    registry: &Arc<ConsumerRegistry>,
    link: &Arc<dyn Link>,
    consumer: &Consumer,
) -> Result<(), LinkError> {
    let callback = dispatch_callback(Arc::clone(registry));
    for queue in consumer.queues() {
        let tag = format!("{}:{}", consumer.name(), Uuid::new_v4().simple());
        link.consume(&queue, &tag, false, Arc::clone(&callback)).await?;
        debug!(consumer = consumer.name(), queue = %queue, "consumer armed");
    }
    Ok(())
}

fn dispatch_callback(registry: Arc<ConsumerRegistry>) -> DeliveryCallback {
    Arc::new(move |delivery: Delivery| {
        let registry = Arc::clone(&registry);
        Box::pin(async move {
            dispatch(registry, delivery).await;
        })
    })
}

/// Run one delivery through its task handler inside a fresh execution
/// context. Handler failures are logged, never propagated: a message left
/// unsettled by its handler is rejected so it is not silently lost.
async fn dispatch(registry: Arc<ConsumerRegistry>, delivery: Delivery) {
    let consumer_name = delivery
        .consumer_tag
        .split(':')
        .next()
        .unwrap_or_default()
        .to_string();
    let message_type = delivery.properties.message_type.clone().unwrap_or_default();

    let context = Arc::new(consume_context(&consumer_name, &message_type, &delivery));
    match registry.handler(&consumer_name, &message_type) {
        Some(handler) => {
            if let Err(err) = handler(Arc::clone(&context), delivery.clone()).await {
                error!(
                    consumer = %consumer_name,
                    message_type = %message_type,
                    error = ?err,
                    "task handler failed"
                );
            }
        }
        None => {
            error!(
                consumer = %consumer_name,
                message_type = %message_type,
                "no task handler registered for message"
            );
        }
    }
    if !delivery.is_settled() {
        warn!(
            consumer = %consumer_name,
            message_type = %message_type,
            "message left unsettled, rejecting"
        );
        if let Err(err) = delivery.reject(false).await {
            error!(error = %err, "failed to reject unsettled message");
        }
    }
    context.finish();
}

fn consume_context(consumer: &str, message_type: &str, delivery: &Delivery) -> Context {
    let properties = &delivery.properties;
    let mut headers = properties.headers.clone();
    if let Some(value) = &properties.message_id {
        headers.insert("message_id".to_string(), value.clone());
    }
    if let Some(value) = &properties.correlation_id {
        headers.insert("correlation_id".to_string(), value.clone());
    }
    if let Some(value) = &properties.reply_to {
        headers.insert("reply_to".to_string(), value.clone());
    }
    if let Some(value) = &properties.app_id {
        headers.insert("app_id".to_string(), value.clone());
    }
    if let Some(value) = &properties.message_type {
        headers.insert("type".to_string(), value.clone());
    }

    let context = Context::with_request(
        "CONSUME",
        format!("/{consumer}/{message_type}"),
        headers,
        properties.content_type.clone(),
        delivery.payload.clone(),
    );
    context.set(INBOUND_MESSAGE_ATTR, delivery.clone());
    context
}
