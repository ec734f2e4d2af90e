//! Broker capability interface.
//!
//! The messaging core only needs a handful of primitives from the broker
//! client: connect, create a producer handle, consume with a callback,
//! drive the event loop for a bounded slice, probe the heartbeat, declare
//! and bind, and signal connection-level errors. These are spelled out as
//! the [`Broker`]/[`Link`]/[`Producer`] traits so any client exposing them
//! is substitutable; [`lapin`] talks to a real broker, [`memory`] is a
//! deterministic in-process stand-in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::message::{Delivery, WireMessage};

pub mod lapin;
pub mod memory;

/// RabbitMQ's direct-reply pseudo-queue. Consuming it (no-ack) lets a
/// publisher receive RPC replies without declaring a reply queue; the
/// subscription is tied to the connection that created it.
pub const DIRECT_REPLY_QUEUE: &str = "amq.rabbitmq.reply-to";

#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("consume error: {0}")]
    Consume(String),

    #[error("declare error: {0}")]
    Declare(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

/// Callback invoked for each delivery routed to a registered consumer.
pub type DeliveryCallback = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Outcome of one bounded slice of the broker event loop.
#[derive(Debug)]
pub enum DrainOutcome {
    /// A delivery was dispatched to its consumer callback.
    Delivered,
    /// The slice elapsed without broker activity.
    TimedOut,
    /// The transport failed; the link is no longer usable.
    Disconnected(LinkError),
}

/// Connection factory derived from configuration. Every `open` yields an
/// independent connection sharing no socket state with any other.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn open(&self, heartbeat: Option<u16>) -> Result<Arc<dyn Link>, LinkError>;
}

/// One live connection to the broker.
#[async_trait]
pub trait Link: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Create a producer handle bound to this connection.
    async fn open_producer(&self) -> Result<Arc<dyn Producer>, LinkError>;

    /// Register a consumer with `tag` on `queue`. Deliveries surface
    /// through `drain` on this link, which invokes `on_delivery`.
    async fn consume(
        &self,
        queue: &str,
        tag: &str,
        no_ack: bool,
        on_delivery: DeliveryCallback,
    ) -> Result<(), LinkError>;

    /// Drive the event loop for at most `timeout`, dispatching at most one
    /// delivery.
    async fn drain(&self, timeout: Duration) -> DrainOutcome;

    async fn heartbeat_check(&self) -> Result<(), LinkError>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), LinkError>;

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), LinkError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), LinkError>;

    async fn close(&self);
}

/// A publish handle bound to one connection.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, message: &WireMessage) -> Result<(), LinkError>;
    async fn close(&self);
}
