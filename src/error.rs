// src/error.rs

use std::time::Duration;

use thiserror::Error;

use crate::transport::LinkError;

#[derive(Debug, Error)]
pub enum AmqpError {
    #[error("broker unreachable after {attempts} attempts: {reason}")]
    BrokerUnreachable { attempts: u32, reason: String },

    #[error("publish failed after connection revival: {0}")]
    PublishFailed(String),

    #[error("no reply within {0:?}")]
    RequestTimeout(Duration),

    #[error("connection lost while draining replies: {0}")]
    ConnectionLost(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("message has no correlation id to wait on")]
    NoCorrelationId,

    #[error("no inbound message attached to the current context")]
    NoInboundMessage,

    #[error("message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] LinkError),
}

pub type Result<T> = std::result::Result<T, AmqpError>;
