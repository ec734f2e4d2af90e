//! In-process broker backend.
//!
//! Implements the same capability surface as the lapin backend with
//! deterministic routing: default-exchange publishes go straight to the
//! queue named by the routing key, bound exchanges route per binding, and
//! direct-reply requests are rewritten to a per-connection reply address the
//! way RabbitMQ does. Publish failures and connection loss can be injected,
//! and every accepted publish and settlement is recorded, which is what the
//! test suite asserts against.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::message::{Delivery, MessageProperties, NoopSettle, Settle, WireMessage};

use super::{
    Broker, DeliveryCallback, DrainOutcome, ExchangeKind, Link, LinkError, Producer,
    DIRECT_REPLY_QUEUE,
};

/// How a consumer settled a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleAction {
    Ack,
    Reject { requeue: bool },
}

#[derive(Clone)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

struct ConsumerEntry {
    queue: String,
    tag: String,
    no_ack: bool,
    callback: DeliveryCallback,
}

enum InboxEvent {
    Deliver {
        tag: String,
        message: WireMessage,
        no_ack: bool,
    },
    Dropped(LinkError),
}

struct LinkInner {
    id: u64,
    state: Arc<BrokerState>,
    connected: AtomicBool,
    consumers: Mutex<Vec<ConsumerEntry>>,
    inbox_tx: mpsc::UnboundedSender<InboxEvent>,
    inbox_rx: AsyncMutex<mpsc::UnboundedReceiver<InboxEvent>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: Mutex<HashMap<String, ExchangeKind>>,
    bindings: Mutex<Vec<Binding>>,
    backlog: Mutex<HashMap<String, VecDeque<WireMessage>>>,
    links: Mutex<Vec<Arc<LinkInner>>>,
    published: Mutex<Vec<WireMessage>>,
    settlements: Mutex<Vec<(String, SettleAction)>>,
    fail_publishes: AtomicUsize,
    refuse_connects: AtomicUsize,
    connects: AtomicUsize,
}

impl BrokerState {
    fn route(&self, origin: u64, mut message: WireMessage) -> Result<(), LinkError> {
        // A request addressed to the direct-reply queue gets a reply
        // address naming the connection that sent it.
        if message.reply_to.as_deref() == Some(DIRECT_REPLY_QUEUE) {
            message.reply_to = Some(format!("{DIRECT_REPLY_QUEUE}.{origin}"));
        }

        let reply_prefix = format!("{DIRECT_REPLY_QUEUE}.");
        if let Some(id) = message.routing_key.strip_prefix(reply_prefix.as_str()) {
            let target = id.parse::<u64>().ok().and_then(|id| {
                self.links
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|link| link.id == id)
                    .cloned()
            });
            let Some(target) = target else {
                return Err(LinkError::Publish(
                    "direct-reply target connection is gone".to_string(),
                ));
            };
            let entry = target
                .consumers
                .lock()
                .unwrap()
                .iter()
                .find(|consumer| consumer.queue == DIRECT_REPLY_QUEUE)
                .map(|consumer| (consumer.tag.clone(), consumer.no_ack));
            let Some((tag, no_ack)) = entry else {
                return Err(LinkError::Publish(
                    "no reply consumer on target connection".to_string(),
                ));
            };
            self.published.lock().unwrap().push(message.clone());
            let _ = target.inbox_tx.send(InboxEvent::Deliver { tag, message, no_ack });
            return Ok(());
        }

        self.published.lock().unwrap().push(message.clone());

        let queues: Vec<String> = if message.exchange.is_empty() {
            vec![message.routing_key.clone()]
        } else {
            let fanout = matches!(
                self.exchanges.lock().unwrap().get(&message.exchange),
                Some(ExchangeKind::Fanout)
            );
            self.bindings
                .lock()
                .unwrap()
                .iter()
                .filter(|binding| {
                    binding.exchange == message.exchange
                        && (fanout || binding.routing_key == message.routing_key)
                })
                .map(|binding| binding.queue.clone())
                .collect()
        };

        for queue in queues {
            self.deliver_or_park(&queue, message.clone());
        }
        Ok(())
    }

    fn deliver_or_park(&self, queue: &str, message: WireMessage) {
        let target = {
            let links = self.links.lock().unwrap();
            links.iter().find_map(|link| {
                if !link.connected.load(Ordering::SeqCst) {
                    return None;
                }
                link.consumers
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|consumer| consumer.queue == queue)
                    .map(|consumer| (Arc::clone(link), consumer.tag.clone(), consumer.no_ack))
            })
        };
        match target {
            Some((link, tag, no_ack)) => {
                let _ = link.inbox_tx.send(InboxEvent::Deliver { tag, message, no_ack });
            }
            None => {
                self.backlog
                    .lock()
                    .unwrap()
                    .entry(queue.to_string())
                    .or_default()
                    .push_back(message);
            }
        }
    }
}

struct MemorySettle {
    message_id: String,
    state: Arc<BrokerState>,
}

#[async_trait]
impl Settle for MemorySettle {
    async fn ack(&self) -> Result<(), LinkError> {
        self.state
            .settlements
            .lock()
            .unwrap()
            .push((self.message_id.clone(), SettleAction::Ack));
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), LinkError> {
        self.state
            .settlements
            .lock()
            .unwrap()
            .push((self.message_id.clone(), SettleAction::Reject { requeue }));
        Ok(())
    }
}

struct MemoryLink {
    inner: Arc<LinkInner>,
}

impl MemoryLink {
    fn make_delivery(&self, tag: String, message: WireMessage, no_ack: bool) -> Delivery {
        let properties = MessageProperties {
            message_type: message.message_type,
            message_id: Some(message.message_id.clone()),
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
            app_id: message.app_id,
            content_type: message.content_type,
            headers: message.headers,
        };
        let settle: Arc<dyn Settle> = if no_ack {
            Arc::new(NoopSettle)
        } else {
            Arc::new(MemorySettle {
                message_id: message.message_id,
                state: Arc::clone(&self.inner.state),
            })
        };
        Delivery::new(tag, properties, message.body, settle)
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn open_producer(&self) -> Result<Arc<dyn Producer>, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Channel("link is disconnected".to_string()));
        }
        Ok(Arc::new(MemoryProducer {
            link: Arc::clone(&self.inner),
        }))
    }

    async fn consume(
        &self,
        queue: &str,
        tag: &str,
        no_ack: bool,
        on_delivery: DeliveryCallback,
    ) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Consume("link is disconnected".to_string()));
        }
        self.inner.consumers.lock().unwrap().push(ConsumerEntry {
            queue: queue.to_string(),
            tag: tag.to_string(),
            no_ack,
            callback: on_delivery,
        });
        // Hand over anything parked while the queue had no consumer.
        if queue != DIRECT_REPLY_QUEUE {
            let parked: Vec<WireMessage> = {
                self.inner
                    .state
                    .backlog
                    .lock()
                    .unwrap()
                    .get_mut(queue)
                    .map(|messages| messages.drain(..).collect())
                    .unwrap_or_default()
            };
            for message in parked {
                let _ = self.inner.inbox_tx.send(InboxEvent::Deliver {
                    tag: tag.to_string(),
                    message,
                    no_ack,
                });
            }
        }
        Ok(())
    }

    async fn drain(&self, timeout: Duration) -> DrainOutcome {
        let mut inbox = self.inner.inbox_rx.lock().await;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Err(_) => DrainOutcome::TimedOut,
            Ok(None) => DrainOutcome::Disconnected(LinkError::Connection(
                "event channel closed".to_string(),
            )),
            Ok(Some(InboxEvent::Dropped(err))) => DrainOutcome::Disconnected(err),
            Ok(Some(InboxEvent::Deliver { tag, message, no_ack })) => {
                let callback = {
                    self.inner
                        .consumers
                        .lock()
                        .unwrap()
                        .iter()
                        .find(|consumer| consumer.tag == tag)
                        .map(|consumer| Arc::clone(&consumer.callback))
                };
                if let Some(callback) = callback {
                    let delivery = self.make_delivery(tag, message, no_ack);
                    callback(delivery).await;
                }
                DrainOutcome::Delivered
            }
        }
    }

    async fn heartbeat_check(&self) -> Result<(), LinkError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(LinkError::Connection("link is disconnected".to_string()))
        }
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), LinkError> {
        self.inner
            .state
            .exchanges
            .lock()
            .unwrap()
            .insert(name.to_string(), kind);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, _durable: bool) -> Result<(), LinkError> {
        self.inner
            .state
            .backlog
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), LinkError> {
        self.inner.state.bindings.lock().unwrap().push(Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        });
        Ok(())
    }

    async fn close(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner
            .state
            .links
            .lock()
            .unwrap()
            .retain(|link| link.id != self.inner.id);
    }
}

struct MemoryProducer {
    link: Arc<LinkInner>,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, message: &WireMessage) -> Result<(), LinkError> {
        let state = &self.link.state;
        if state.fail_publishes.load(Ordering::SeqCst) > 0 {
            state.fail_publishes.fetch_sub(1, Ordering::SeqCst);
            return Err(LinkError::Publish("injected publish failure".to_string()));
        }
        if !self.link.connected.load(Ordering::SeqCst) {
            return Err(LinkError::Connection("link is disconnected".to_string()));
        }
        state.route(self.link.id, message.clone())
    }

    async fn close(&self) {}
}

/// A shared in-process broker. Clones share state, so a test can keep one
/// handle for its knobs while the service under test holds another.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
    next_link_id: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` publishes, across all connections.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.fail_publishes.store(count, Ordering::SeqCst);
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next_connects(&self, count: usize) {
        self.state.refuse_connects.store(count, Ordering::SeqCst);
    }

    /// Sever every live connection, surfacing a connection error on each.
    pub fn drop_connections(&self) {
        let links: Vec<Arc<LinkInner>> = self.state.links.lock().unwrap().drain(..).collect();
        for link in links {
            link.connected.store(false, Ordering::SeqCst);
            let _ = link.inbox_tx.send(InboxEvent::Dropped(LinkError::Connection(
                "connection dropped".to_string(),
            )));
        }
    }

    /// Sever every live connection without surfacing an error event. The
    /// loss is only observable through `is_connected` and heartbeat probes.
    pub fn drop_connections_silently(&self) {
        let links: Vec<Arc<LinkInner>> = self.state.links.lock().unwrap().drain(..).collect();
        for link in links {
            link.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Every publish the broker accepted, in order.
    pub fn published(&self) -> Vec<WireMessage> {
        self.state.published.lock().unwrap().clone()
    }

    /// Every ack/reject received, in order, keyed by message id.
    pub fn settlements(&self) -> Vec<(String, SettleAction)> {
        self.state.settlements.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Messages parked on `queue` waiting for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .backlog
            .lock()
            .unwrap()
            .get(queue)
            .map(|messages| messages.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open(&self, _heartbeat: Option<u16>) -> Result<Arc<dyn Link>, LinkError> {
        if self.state.refuse_connects.load(Ordering::SeqCst) > 0 {
            self.state.refuse_connects.fetch_sub(1, Ordering::SeqCst);
            return Err(LinkError::Connection(
                "injected connect failure".to_string(),
            ));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(LinkInner {
            id: self.next_link_id.fetch_add(1, Ordering::SeqCst),
            state: Arc::clone(&self.state),
            connected: AtomicBool::new(true),
            consumers: Mutex::new(Vec::new()),
            inbox_tx,
            inbox_rx: AsyncMutex::new(inbox_rx),
        });
        self.state.links.lock().unwrap().push(Arc::clone(&inner));
        Ok(Arc::new(MemoryLink { inner }))
    }
}
