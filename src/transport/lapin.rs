//! Broker backend on `lapin`.
//!
//! Each [`LapinLink`] owns one AMQP connection plus a channel used for
//! declarations and consuming. Consumer streams are forwarded into an inbox
//! channel by background tasks; `drain` pops one event at a time with a
//! bounded timeout, which gives the session and run-loop code the same
//! drive-the-event-loop shape the memory backend has. Producers get their
//! own channel so publishing never interleaves with consuming.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery as LapinDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::message::{Delivery, MessageProperties, NoopSettle, Settle};

use super::{Broker, DeliveryCallback, DrainOutcome, ExchangeKind, Link, LinkError, Producer};

/// Connection factory for a real broker.
pub struct LapinBroker {
    url: String,
}

impl LapinBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn url_with_heartbeat(&self, heartbeat: Option<u16>) -> String {
        match heartbeat {
            None => self.url.clone(),
            Some(heartbeat) => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}heartbeat={}", self.url, separator, heartbeat)
            }
        }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn open(&self, heartbeat: Option<u16>) -> Result<Arc<dyn Link>, LinkError> {
        let url = self.url_with_heartbeat(heartbeat);
        let connection = Connection::connect(&url, ConnectionProperties::default())
            .await
            .map_err(|e| LinkError::Connection(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| LinkError::Channel(e.to_string()))?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        debug!("connected to broker");
        Ok(Arc::new(LapinLink {
            connection,
            channel,
            consumers: Mutex::new(HashMap::new()),
            inbox_tx,
            inbox_rx: AsyncMutex::new(inbox_rx),
        }))
    }
}

enum InboxEvent {
    Deliver {
        tag: String,
        delivery: LapinDelivery,
        no_ack: bool,
    },
    Dropped(LinkError),
}

struct LapinLink {
    connection: Connection,
    channel: Channel,
    consumers: Mutex<HashMap<String, DeliveryCallback>>,
    inbox_tx: mpsc::UnboundedSender<InboxEvent>,
    inbox_rx: AsyncMutex<mpsc::UnboundedReceiver<InboxEvent>>,
}

#[async_trait]
impl Link for LapinLink {
    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn open_producer(&self) -> Result<Arc<dyn Producer>, LinkError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| LinkError::Channel(e.to_string()))?;
        Ok(Arc::new(LapinProducer { channel }))
    }

    async fn consume(
        &self,
        queue: &str,
        tag: &str,
        no_ack: bool,
        on_delivery: DeliveryCallback,
    ) -> Result<(), LinkError> {
        let options = BasicConsumeOptions {
            no_ack,
            ..BasicConsumeOptions::default()
        };
        let mut consumer = self
            .channel
            .basic_consume(queue, tag, options, FieldTable::default())
            .await
            .map_err(|e| LinkError::Consume(e.to_string()))?;
        self.consumers
            .lock()
            .unwrap()
            .insert(tag.to_string(), on_delivery);

        let inbox = self.inbox_tx.clone();
        let tag = tag.to_string();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let event = InboxEvent::Deliver {
                            tag: tag.clone(),
                            delivery,
                            no_ack,
                        };
                        if inbox.send(event).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = inbox.send(InboxEvent::Dropped(LinkError::Connection(
                            err.to_string(),
                        )));
                        break;
                    }
                }
            }
            debug!(tag = %tag, "consumer stream ended");
        });
        Ok(())
    }

    async fn drain(&self, timeout: Duration) -> DrainOutcome {
        let mut inbox = self.inbox_rx.lock().await;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Err(_) => {
                if self.is_connected() {
                    DrainOutcome::TimedOut
                } else {
                    DrainOutcome::Disconnected(LinkError::Connection(
                        "connection closed".to_string(),
                    ))
                }
            }
            Ok(None) => DrainOutcome::Disconnected(LinkError::Connection(
                "event channel closed".to_string(),
            )),
            Ok(Some(InboxEvent::Dropped(err))) => DrainOutcome::Disconnected(err),
            Ok(Some(InboxEvent::Deliver {
                tag,
                delivery,
                no_ack,
            })) => {
                let callback = { self.consumers.lock().unwrap().get(&tag).cloned() };
                match callback {
                    Some(callback) => callback(convert_delivery(tag, delivery, no_ack)).await,
                    None => warn!(tag = %tag, "delivery for unknown consumer tag"),
                }
                DrainOutcome::Delivered
            }
        }
    }

    async fn heartbeat_check(&self) -> Result<(), LinkError> {
        // lapin exchanges protocol heartbeats on its own; the probe here is
        // whether the connection survived them.
        if self.is_connected() {
            Ok(())
        } else {
            Err(LinkError::Connection(
                "connection is no longer alive".to_string(),
            ))
        }
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), LinkError> {
        let options = ExchangeDeclareOptions {
            durable,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(name, map_exchange_kind(kind), options, FieldTable::default())
            .await
            .map_err(|e| LinkError::Declare(e.to_string()))
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), LinkError> {
        let options = QueueDeclareOptions {
            durable,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| LinkError::Declare(e.to_string()))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), LinkError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| LinkError::Declare(e.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close(200, "closing").await {
            debug!(error = %err, "channel close failed");
        }
        if let Err(err) = self.connection.close(200, "closing").await {
            debug!(error = %err, "connection close failed");
        }
    }
}

struct LapinProducer {
    channel: Channel,
}

#[async_trait]
impl Producer for LapinProducer {
    async fn send(&self, message: &crate::message::WireMessage) -> Result<(), LinkError> {
        let mut properties = BasicProperties::default()
            .with_message_id(message.message_id.clone().into())
            .with_delivery_mode(if message.persistent { 2 } else { 1 })
            .with_timestamp(message.timestamp as u64);
        if let Some(app_id) = &message.app_id {
            properties = properties.with_app_id(app_id.clone().into());
        }
        if let Some(correlation_id) = &message.correlation_id {
            properties = properties.with_correlation_id(correlation_id.clone().into());
        }
        if let Some(reply_to) = &message.reply_to {
            properties = properties.with_reply_to(reply_to.clone().into());
        }
        if let Some(content_type) = &message.content_type {
            properties = properties.with_content_type(content_type.clone().into());
        }
        if let Some(message_type) = &message.message_type {
            properties = properties.with_kind(message_type.clone().into());
        }
        if !message.headers.is_empty() {
            let mut table = FieldTable::default();
            for (name, value) in &message.headers {
                table.insert(name.clone().into(), AMQPValue::LongString(value.clone().into()));
            }
            properties = properties.with_headers(table);
        }

        self.channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map(|_| ())
            .map_err(|e| LinkError::Publish(e.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close(200, "closing producer").await {
            debug!(error = %err, "producer channel close failed");
        }
    }
}

struct LapinSettle {
    acker: Acker,
}

#[async_trait]
impl Settle for LapinSettle {
    async fn ack(&self) -> Result<(), LinkError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| LinkError::Consume(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), LinkError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| LinkError::Consume(e.to_string()))
    }
}

fn convert_delivery(tag: String, delivery: LapinDelivery, no_ack: bool) -> Delivery {
    let LapinDelivery {
        properties,
        data,
        acker,
        ..
    } = delivery;

    let mut headers = HashMap::new();
    if let Some(table) = properties.headers() {
        for (name, value) in table.inner() {
            headers.insert(name.to_string(), field_to_string(value));
        }
    }

    let converted = MessageProperties {
        message_type: properties.kind().as_ref().map(|v| v.as_str().to_string()),
        message_id: properties.message_id().as_ref().map(|v| v.as_str().to_string()),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|v| v.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|v| v.as_str().to_string()),
        app_id: properties.app_id().as_ref().map(|v| v.as_str().to_string()),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|v| v.as_str().to_string()),
        headers,
    };

    let settle: Arc<dyn Settle> = if no_ack {
        Arc::new(NoopSettle)
    } else {
        Arc::new(LapinSettle { acker })
    };
    Delivery::new(tag, converted, data, settle)
}

fn field_to_string(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        other => format!("{other:?}"),
    }
}

fn map_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}
