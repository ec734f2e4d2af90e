use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::transport::{LinkError, DIRECT_REPLY_QUEUE};

/// Body of a staged message.
pub enum Payload {
    Empty,
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    /// Evaluated once, at flush time.
    LazyJson(Box<dyn FnOnce() -> serde_json::Value + Send>),
}

/// An outgoing message as described by the caller: routing and delivery
/// options plus a payload, before addressing is resolved. Staged specs are
/// materialized into [`WireMessage`]s by `Session::flush`.
pub struct MessageSpec {
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub message_type: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub persistent: bool,
    pub content_type: Option<String>,
    pub headers: HashMap<String, String>,
    payload: Payload,
}

impl MessageSpec {
    pub fn new() -> Self {
        Self {
            exchange: None,
            routing_key: None,
            message_type: None,
            reply_to: None,
            correlation_id: None,
            persistent: false,
            content_type: None,
            headers: HashMap::new(),
            payload: Payload::Empty,
        }
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, bytes: Vec<u8>) -> Self {
        self.payload = Payload::Bytes(bytes);
        self
    }

    /// Serialize `value` as the JSON body of this message.
    pub fn json<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.payload = Payload::Json(serde_json::to_value(value)?);
        Ok(self)
    }

    /// Defer the JSON body: `produce` runs once when the message is
    /// flushed, not when it is staged.
    pub fn json_lazy<F>(mut self, produce: F) -> Self
    where
        F: FnOnce() -> serde_json::Value + Send + 'static,
    {
        self.payload = Payload::LazyJson(Box::new(produce));
        self
    }

    /// Materialize a fully-addressed wire message: assigns the message id,
    /// resolves the correlation id for direct-reply requests, and evaluates
    /// lazy payloads.
    pub(crate) fn into_wire(self, app_id: Option<&str>) -> Result<WireMessage> {
        let message_id = Uuid::new_v4().to_string();

        let mut correlation_id = self.correlation_id;
        if self.reply_to.as_deref() == Some(DIRECT_REPLY_QUEUE) && correlation_id.is_none() {
            correlation_id = Some(message_id.clone());
        }

        let (body, content_type) = match self.payload {
            Payload::Empty => (Vec::new(), self.content_type),
            Payload::Bytes(bytes) => (bytes, self.content_type),
            Payload::Json(value) => (
                serde_json::to_vec(&value)?,
                Some(
                    self.content_type
                        .unwrap_or_else(|| "application/json".to_string()),
                ),
            ),
            Payload::LazyJson(produce) => (
                serde_json::to_vec(&produce())?,
                Some(
                    self.content_type
                        .unwrap_or_else(|| "application/json".to_string()),
                ),
            ),
        };

        Ok(WireMessage {
            exchange: self.exchange.unwrap_or_default(),
            routing_key: self.routing_key.unwrap_or_default(),
            reply_to: self.reply_to,
            app_id: app_id.map(str::to_string),
            message_id,
            correlation_id,
            message_type: self.message_type,
            persistent: self.persistent,
            content_type,
            headers: self.headers,
            timestamp: chrono::Utc::now().timestamp(),
            body,
        })
    }
}

impl Default for MessageSpec {
    fn default() -> Self {
        Self::new()
    }
}

/// A fully-addressed message ready to hand to the broker.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub exchange: String,
    pub routing_key: String,
    pub reply_to: Option<String>,
    pub app_id: Option<String>,
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    pub persistent: bool,
    pub content_type: Option<String>,
    pub headers: HashMap<String, String>,
    pub timestamp: i64,
    pub body: Vec<u8>,
}

/// Broker properties carried by an inbound message.
#[derive(Debug, Clone, Default)]
pub struct MessageProperties {
    pub message_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub app_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: HashMap<String, String>,
}

/// Backend hook for settling a delivery with the broker.
#[async_trait]
pub trait Settle: Send + Sync {
    async fn ack(&self) -> std::result::Result<(), LinkError>;
    async fn reject(&self, requeue: bool) -> std::result::Result<(), LinkError>;
}

/// Settlement for no-ack deliveries (direct replies); nothing to tell the
/// broker.
pub(crate) struct NoopSettle;

#[async_trait]
impl Settle for NoopSettle {
    async fn ack(&self) -> std::result::Result<(), LinkError> {
        Ok(())
    }

    async fn reject(&self, _requeue: bool) -> std::result::Result<(), LinkError> {
        Ok(())
    }
}

/// One message received from the broker. Cloning shares the settlement
/// state: a delivery is acknowledged or rejected at most once no matter how
/// many handles exist.
#[derive(Clone)]
pub struct Delivery {
    pub consumer_tag: String,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
    settled: Arc<AtomicBool>,
    settle: Arc<dyn Settle>,
}

impl Delivery {
    pub(crate) fn new(
        consumer_tag: String,
        properties: MessageProperties,
        payload: Vec<u8>,
        settle: Arc<dyn Settle>,
    ) -> Self {
        Self {
            consumer_tag,
            properties,
            payload,
            settled: Arc::new(AtomicBool::new(false)),
            settle,
        }
    }

    /// Acknowledge the message. A no-op if it was already settled.
    pub async fn ack(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.settle.ack().await.map_err(Into::into)
    }

    /// Reject the message. A no-op if it was already settled.
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.settle.reject(requeue).await.map_err(Into::into)
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Deserialize the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(Into::into)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("consumer_tag", &self.consumer_tag)
            .field("properties", &self.properties)
            .field("payload_len", &self.payload.len())
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_reply_generates_correlation_id_from_message_id() {
        let wire = MessageSpec::new()
            .routing_key("rpc.queue")
            .reply_to(DIRECT_REPLY_QUEUE)
            .into_wire(Some("app"))
            .unwrap();
        assert_eq!(wire.correlation_id.as_deref(), Some(wire.message_id.as_str()));
    }

    #[test]
    fn explicit_correlation_id_is_preserved() {
        let wire = MessageSpec::new()
            .reply_to(DIRECT_REPLY_QUEUE)
            .correlation_id("given")
            .into_wire(None)
            .unwrap();
        assert_eq!(wire.correlation_id.as_deref(), Some("given"));
    }

    #[test]
    fn foreign_reply_queue_gets_no_correlation_id() {
        let wire = MessageSpec::new()
            .reply_to("some.other.queue")
            .into_wire(None)
            .unwrap();
        assert!(wire.correlation_id.is_none());
    }

    #[test]
    fn lazy_payload_evaluated_at_materialization() {
        let secret = "s3cret".to_string();
        let wire = MessageSpec::new()
            .json_lazy(move || serde_json::json!({ "secret": secret }))
            .into_wire(None)
            .unwrap();
        assert_eq!(wire.content_type.as_deref(), Some("application/json"));
        let value: serde_json::Value = serde_json::from_slice(&wire.body).unwrap();
        assert_eq!(value["secret"], "s3cret");
    }

    #[test]
    fn message_ids_are_unique() {
        let a = MessageSpec::new().into_wire(None).unwrap();
        let b = MessageSpec::new().into_wire(None).unwrap();
        assert_ne!(a.message_id, b.message_id);
    }
}
