//! courier — a transactional AMQP session runtime.
//!
//! The crate manages a pool of reusable publish/consume sessions bound to
//! request-like execution contexts. A session stages outgoing messages and
//! publishes them on `commit`, supports synchronous request/reply RPC over
//! RabbitMQ's direct-reply queue with correlation-id matching, and revives
//! its connection transparently when the transport fails mid-publish. The
//! consume side runs a single resilient loop that dispatches deliveries to
//! registered task handlers by (consumer name, message type) and reconnects
//! without losing routing.
//!
//! The broker is reached through the capability traits in [`transport`];
//! the [`transport::lapin`] backend talks to a real broker and the
//! [`transport::memory`] backend provides a deterministic in-process one.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod context;
pub mod error;
pub mod message;
pub mod pool;
pub mod service;
pub mod session;
pub mod transport;

pub use config::AmqpConfig;
pub use connection::ConnectionManager;
pub use consumer::{Consumer, INBOUND_MESSAGE_ATTR};
pub use context::Context;
pub use error::{AmqpError, Result};
pub use message::{Delivery, MessageSpec, WireMessage};
pub use pool::SessionPool;
pub use service::AmqpService;
pub use session::Session;
pub use transport::lapin::LapinBroker;
pub use transport::memory::MemoryBroker;
pub use transport::{Broker, ExchangeKind, DIRECT_REPLY_QUEUE};
