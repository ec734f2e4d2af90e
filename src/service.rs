use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::AmqpConfig;
use crate::connection::ConnectionManager;
use crate::consumer::{arm_consumer, Consumer, ConsumerRegistry, TaskHandler};
use crate::context::Context;
use crate::error::Result;
use crate::message::Delivery;
use crate::pool::SessionPool;
use crate::session::Session;
use crate::transport::{Broker, DrainOutcome, ExchangeKind, Link};

/// The top-level messaging runtime: a session pool for the producer side, a
/// consumer registry for the subscriber side, and the resilient consume
/// loop tying them to one broker.
pub struct AmqpService {
    connections: Arc<ConnectionManager>,
    pool: Arc<SessionPool>,
    registry: Arc<ConsumerRegistry>,
    running: Arc<AtomicBool>,
    event_wait: Duration,
}

impl AmqpService {
    pub fn new(config: AmqpConfig, broker: Arc<dyn Broker>) -> Arc<Self> {
        let connections = Arc::new(ConnectionManager::new(
            broker,
            config.heartbeat_seconds,
            config.connect_attempts,
        ));
        let pool = Arc::new(SessionPool::new(
            config.app_id.clone(),
            Arc::clone(&connections),
            Duration::from_secs(config.reply_timeout_seconds),
        ));
        Arc::new(Self {
            connections,
            pool,
            registry: Arc::new(ConsumerRegistry::new()),
            running: Arc::new(AtomicBool::new(false)),
            event_wait: Duration::from_secs(config.event_wait_seconds),
        })
    }

    pub fn pool(&self) -> Arc<SessionPool> {
        Arc::clone(&self.pool)
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// The session bound to `context` (checked out on first use).
    pub fn session(&self, context: &Context) -> Arc<Session> {
        self.pool.acquire(context)
    }

    /// Register a task handler for `message_type` messages delivered to
    /// `consumer`.
    pub fn task<F, Fut>(&self, consumer: &str, message_type: &str, handler: F)
    where
        F: Fn(Arc<Context>, Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped: TaskHandler = Arc::new(move |context, delivery| {
            Box::pin(handler(context, delivery))
        });
        self.registry.register(consumer, message_type, wrapped);
    }

    /// The consumer registered under `name`, created lazily. Queues added
    /// to it are consumed once `run` starts; declaring and binding them
    /// first is the caller's responsibility.
    pub fn consumer(&self, name: &str) -> Arc<Consumer> {
        self.registry.consumer(name)
    }

    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<()> {
        let link = self.connections.connect().await?;
        link.declare_exchange(name, kind, durable).await?;
        Ok(())
    }

    pub async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        let link = self.connections.connect().await?;
        link.declare_queue(name, durable).await?;
        Ok(())
    }

    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let link = self.connections.connect().await?;
        link.bind_queue(queue, exchange, routing_key).await?;
        Ok(())
    }

    /// Consume registered queues until the running flag is flipped by
    /// `stop` or by SIGINT/SIGTERM.
    ///
    /// Each turn drains the control connection with a bounded wait; an idle
    /// turn sends a heartbeat probe. A transport failure triggers one
    /// reconnect-and-revive cycle; if reconnecting itself exhausts its
    /// retries the error propagates and the loop terminates.
    pub async fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.arm_stop_signals();

        let mut control = self.connections.connect().await?;
        self.arm_consumers(&control).await?;
        info!("consume loop started");

        while self.running.load(Ordering::SeqCst) {
            match control.drain(self.event_wait).await {
                DrainOutcome::Delivered => {}
                DrainOutcome::TimedOut => {
                    if let Err(err) = control.heartbeat_check().await {
                        warn!(error = %err, "heartbeat probe failed, reviving consumers");
                        control = self.revive_consumers().await?;
                    }
                }
                DrainOutcome::Disconnected(err) => {
                    warn!(error = %err, "control connection lost, reviving consumers");
                    control = self.revive_consumers().await?;
                }
            }
        }

        info!("consume loop stopped");
        Ok(())
    }

    /// Flip the running flag; the consume loop exits after its current
    /// bounded wait returns.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Replace the control connection and re-arm every registered consumer
    /// on it.
    pub async fn revive_consumers(&self) -> Result<Arc<dyn Link>> {
        let link = self.connections.reconnect().await?;
        self.arm_consumers(&link).await?;
        Ok(link)
    }

    /// Stop consuming, drain and close every idle pooled session, and close
    /// the control connection.
    pub async fn close(&self) {
        self.stop();
        self.pool.close().await;
        self.connections.close().await;
    }

    async fn arm_consumers(&self, link: &Arc<dyn Link>) -> Result<()> {
        for consumer in self.registry.all() {
            arm_consumer(&self.registry, link, &consumer).await?;
        }
        Ok(())
    }

    fn arm_stop_signals(&self) {
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            wait_for_stop_signal().await;
            info!("stop signal received, shutting down consume loop");
            running.store(false, Ordering::SeqCst);
        });
    }
}

#[cfg(unix)]
async fn wait_for_stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
