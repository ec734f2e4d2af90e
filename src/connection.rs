use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::{AmqpError, Result};
use crate::transport::{Broker, Link};

/// Initial pause between connection attempts.
const INITIAL_BACKOFF_MS: u64 = 500;
/// Cap on the backoff pause.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Establish a connection with bounded retries and jittered exponential
/// backoff. Fails with `BrokerUnreachable` once the attempts are spent.
pub(crate) async fn connect_with_retry(
    broker: &dyn Broker,
    heartbeat: Option<u16>,
    max_attempts: u32,
) -> Result<Arc<dyn Link>> {
    let max_attempts = max_attempts.max(1);
    let mut delay = INITIAL_BACKOFF_MS;
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match broker.open(heartbeat).await {
            Ok(link) => {
                if attempt > 1 {
                    info!(attempt, "connected to broker after retry");
                }
                return Ok(link);
            }
            Err(err) => {
                warn!(attempt, max_attempts, error = %err, "broker connection attempt failed");
                last_error = err.to_string();
                if attempt < max_attempts {
                    let jitter = (rand::random::<f64>() * 0.25 * delay as f64) as u64;
                    sleep(Duration::from_millis(delay + jitter)).await;
                    delay = (delay * 2).min(MAX_BACKOFF_MS);
                }
            }
        }
    }

    error!(max_attempts, "broker unreachable, giving up");
    Err(AmqpError::BrokerUnreachable {
        attempts: max_attempts,
        reason: last_error,
    })
}

/// Owns the long-lived control connection used by consumers and opens the
/// fresh connections that seed pooled sessions.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    heartbeat: u16,
    connect_attempts: u32,
    control: RwLock<Option<Arc<dyn Link>>>,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, heartbeat: u16, connect_attempts: u32) -> Self {
        Self {
            broker,
            heartbeat,
            connect_attempts,
            control: RwLock::new(None),
        }
    }

    /// Idempotently establish the heartbeat-enabled control connection.
    pub async fn connect(&self) -> Result<Arc<dyn Link>> {
        {
            let control = self.control.read().unwrap();
            if let Some(link) = control.as_ref() {
                if link.is_connected() {
                    return Ok(Arc::clone(link));
                }
            }
        }
        let link =
            connect_with_retry(self.broker.as_ref(), Some(self.heartbeat), self.connect_attempts)
                .await?;
        *self.control.write().unwrap() = Some(Arc::clone(&link));
        Ok(link)
    }

    /// The current control connection, if one was established.
    pub fn control(&self) -> Option<Arc<dyn Link>> {
        self.control.read().unwrap().clone()
    }

    /// Open a fresh, independent connection for a session. Shares no socket
    /// state with the control connection.
    pub async fn session_link(&self) -> Result<Arc<dyn Link>> {
        connect_with_retry(self.broker.as_ref(), None, self.connect_attempts).await
    }

    /// Close the control connection and establish a replacement. Re-arming
    /// consumers on the new connection is the caller's job.
    pub async fn reconnect(&self) -> Result<Arc<dyn Link>> {
        let old = { self.control.write().unwrap().take() };
        if let Some(link) = old {
            link.close().await;
        }
        let link =
            connect_with_retry(self.broker.as_ref(), Some(self.heartbeat), self.connect_attempts)
                .await?;
        *self.control.write().unwrap() = Some(Arc::clone(&link));
        Ok(link)
    }

    pub async fn close(&self) {
        let old = { self.control.write().unwrap().take() };
        if let Some(link) = old {
            link.close().await;
        }
    }
}
