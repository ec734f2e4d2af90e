use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::consumer::INBOUND_MESSAGE_ATTR;
use crate::context::Context;
use crate::error::{AmqpError, Result};
use crate::message::{Delivery, MessageSpec, WireMessage};
use crate::transport::{DeliveryCallback, DrainOutcome, Link, Producer, DIRECT_REPLY_QUEUE};

/// Length of one bounded slice of the reply event loop.
const REPLY_SLICE: Duration = Duration::from_secs(1);

type ReplyTable = Arc<Mutex<HashMap<String, Delivery>>>;

/// A unit of work against the broker.
///
/// Messages staged with [`add`](Session::add) are published together by
/// [`commit`](Session::commit) and discarded by
/// [`rollback`](Session::rollback). [`request`](Session::request) publishes
/// over the direct-reply queue and blocks for the correlated reply. The
/// connection is opened lazily on first use and replaced transparently
/// ([`revive`](Session::revive)) when a publish hits a transport error.
///
/// A session belongs to exactly one execution context between checkout and
/// teardown, so its internals are never contended.
pub struct Session {
    app_id: Option<String>,
    connections: Arc<ConnectionManager>,
    reply_timeout: Duration,
    link: RwLock<Option<Arc<dyn Link>>>,
    producer: Mutex<Option<Arc<dyn Producer>>>,
    reply_armed: AtomicBool,
    staged: Mutex<Vec<MessageSpec>>,
    prepared: Mutex<Vec<WireMessage>>,
    replies: ReplyTable,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        app_id: Option<String>,
        connections: Arc<ConnectionManager>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            app_id,
            connections,
            reply_timeout,
            link: RwLock::new(None),
            producer: Mutex::new(None),
            reply_armed: AtomicBool::new(false),
            staged: Mutex::new(Vec::new()),
            prepared: Mutex::new(Vec::new()),
            replies: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
        }
    }

    /// Reset per-checkout state. Called once when the pool hands the
    /// session to a context.
    pub(crate) fn begin(&self) {
        self.staged.lock().unwrap().clear();
        self.prepared.lock().unwrap().clear();
        self.replies.lock().unwrap().clear();
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .read()
            .unwrap()
            .as_ref()
            .map(|link| link.is_connected())
            .unwrap_or(false)
    }

    /// Stage a message for the next `commit`. No I/O happens here.
    pub fn add(&self, spec: MessageSpec) {
        self.staged.lock().unwrap().push(spec);
    }

    /// Materialize every staged message into a fully-addressed wire message
    /// on the prepared list: message ids are assigned, correlation ids
    /// resolved, lazy payloads evaluated. A no-op when nothing is staged.
    pub fn flush(&self) -> Result<()> {
        let staged: Vec<MessageSpec> = {
            let mut staged = self.staged.lock().unwrap();
            staged.drain(..).collect()
        };
        let mut specs = staged.into_iter();
        while let Some(spec) = specs.next() {
            match spec.into_wire(self.app_id.as_deref()) {
                Ok(message) => self.prepared.lock().unwrap().push(message),
                Err(err) => {
                    // The failing spec is dropped; everything staged after
                    // it stays staged.
                    self.staged.lock().unwrap().extend(specs);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Publish every staged and prepared message in staging order.
    ///
    /// Messages already handed to the broker stay published; on failure the
    /// unpublished tail (the failed message first) stays prepared so a
    /// later `commit` can retry it.
    pub async fn commit(&self) -> Result<()> {
        if !self.staged.lock().unwrap().is_empty() {
            self.flush()?;
        }
        loop {
            let next = { self.prepared.lock().unwrap().first().cloned() };
            let Some(message) = next else {
                return Ok(());
            };
            self.publish_wire(&message).await?;
            self.prepared.lock().unwrap().remove(0);
        }
    }

    /// Discard staged and prepared messages without publishing. The reply
    /// table is left alone.
    pub fn rollback(&self) {
        self.staged.lock().unwrap().clear();
        self.prepared.lock().unwrap().clear();
    }

    /// Publish one message immediately, bypassing staging. Returns the
    /// resolved correlation id, if any.
    pub async fn publish(&self, spec: MessageSpec) -> Result<Option<String>> {
        let message = spec.into_wire(self.app_id.as_deref())?;
        let correlation_id = message.correlation_id.clone();
        self.publish_wire(&message).await?;
        Ok(correlation_id)
    }

    /// Publish a request and block for its reply. The reply destination
    /// defaults to this session's direct-reply queue.
    pub async fn request(
        &self,
        mut spec: MessageSpec,
        timeout: Option<Duration>,
    ) -> Result<Delivery> {
        if spec.reply_to.is_none() {
            spec.reply_to = Some(DIRECT_REPLY_QUEUE.to_string());
        }
        let correlation_id = self
            .publish(spec)
            .await?
            .ok_or(AmqpError::NoCorrelationId)?;
        self.wait(&correlation_id, timeout).await
    }

    /// Drive this session's connection in bounded slices until the reply
    /// with `correlation_id` arrives, or until `timeout` worth of idle
    /// slices have elapsed.
    ///
    /// A transport error here closes the session: a direct-reply queue is
    /// tied to the connection that consumed it, so the reply can never
    /// arrive on a replacement.
    pub async fn wait(&self, correlation_id: &str, timeout: Option<Duration>) -> Result<Delivery> {
        let timeout = timeout.unwrap_or(self.reply_timeout);
        let mut elapsed = Duration::ZERO;
        while elapsed < timeout {
            if let Some(reply) = self.replies.lock().unwrap().remove(correlation_id) {
                return Ok(reply);
            }
            let link = self.ensure_link().await?;
            match link.drain(REPLY_SLICE).await {
                DrainOutcome::Delivered => {}
                DrainOutcome::TimedOut => elapsed += REPLY_SLICE,
                DrainOutcome::Disconnected(err) => {
                    warn!(error = %err, "connection lost while waiting for reply");
                    self.close().await;
                    return Err(AmqpError::ConnectionLost(err.to_string()));
                }
            }
        }
        Err(AmqpError::RequestTimeout(timeout))
    }

    /// Reply to the inbound message carried by `context`: the routing key
    /// defaults to its `reply_to` and the correlation id to its
    /// `correlation_id`.
    pub async fn respond(&self, context: &Context, mut spec: MessageSpec) -> Result<Option<String>> {
        let inbound = context
            .get::<Delivery>(INBOUND_MESSAGE_ATTR)
            .ok_or(AmqpError::NoInboundMessage)?;
        if spec.routing_key.is_none() {
            spec.routing_key = inbound.properties.reply_to.clone();
        }
        if spec.correlation_id.is_none() {
            spec.correlation_id = inbound.properties.correlation_id.clone();
        }
        self.publish(spec).await
    }

    /// Replace the connection and re-create the handles bound to it.
    pub async fn revive(&self) -> Result<()> {
        let old_producer = { self.producer.lock().unwrap().take() };
        let had_producer = old_producer.is_some();
        if let Some(producer) = old_producer {
            producer.close().await;
        }
        let old_link = { self.link.write().unwrap().take() };
        if let Some(link) = old_link {
            link.close().await;
        }
        let was_armed = self.reply_armed.swap(false, Ordering::SeqCst);

        let link = self.connections.session_link().await?;
        *self.link.write().unwrap() = Some(Arc::clone(&link));
        if had_producer {
            let producer = link.open_producer().await?;
            *self.producer.lock().unwrap() = Some(producer);
        }
        if was_armed {
            self.arm_reply_consumer(&link).await?;
        }
        debug!("session connection revived");
        Ok(())
    }

    /// Tear down consumer, producer and connection. The session must not be
    /// used afterwards.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reply_armed.store(false, Ordering::SeqCst);
        let producer = { self.producer.lock().unwrap().take() };
        if let Some(producer) = producer {
            producer.close().await;
        }
        let link = { self.link.write().unwrap().take() };
        if let Some(link) = link {
            link.close().await;
        }
    }

    async fn ensure_link(&self) -> Result<Arc<dyn Link>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::SessionClosed);
        }
        let existing = { self.link.read().unwrap().clone() };
        if let Some(link) = existing {
            return Ok(link);
        }
        let link = self.connections.session_link().await?;
        *self.link.write().unwrap() = Some(Arc::clone(&link));
        Ok(link)
    }

    async fn ensure_producer(&self) -> Result<Arc<dyn Producer>> {
        let existing = { self.producer.lock().unwrap().clone() };
        if let Some(producer) = existing {
            return Ok(producer);
        }
        let link = self.ensure_link().await?;
        let producer = link.open_producer().await?;
        *self.producer.lock().unwrap() = Some(Arc::clone(&producer));
        Ok(producer)
    }

    /// Consume this session's direct-reply queue, recording replies by
    /// correlation id.
    async fn arm_reply_consumer(&self, link: &Arc<dyn Link>) -> Result<()> {
        let replies = Arc::clone(&self.replies);
        let callback: DeliveryCallback = Arc::new(move |delivery: Delivery| {
            let replies = Arc::clone(&replies);
            Box::pin(async move {
                if let Some(correlation_id) = delivery.properties.correlation_id.clone() {
                    replies.lock().unwrap().insert(correlation_id, delivery);
                }
            })
        });
        let tag = format!("reply:{}", Uuid::new_v4().simple());
        link.consume(DIRECT_REPLY_QUEUE, &tag, true, callback).await?;
        self.reply_armed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Hand one wire message to the broker. A transport error triggers
    /// exactly one `revive` and one retry; the second failure propagates as
    /// `PublishFailed`.
    async fn publish_wire(&self, message: &WireMessage) -> Result<()> {
        let producer = self.ensure_producer().await?;
        if message.reply_to.as_deref() == Some(DIRECT_REPLY_QUEUE)
            && !self.reply_armed.load(Ordering::SeqCst)
        {
            let link = self.ensure_link().await?;
            self.arm_reply_consumer(&link).await?;
        }
        match producer.send(message).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, "publish failed, reviving session connection");
                self.revive().await?;
                let producer = self.ensure_producer().await?;
                producer
                    .send(message)
                    .await
                    .map_err(|retry_err| AmqpError::PublishFailed(retry_err.to_string()))
            }
        }
    }
}
