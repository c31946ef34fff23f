//! Error types for the producer core.

use thiserror::Error;

/// Transport/connection-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to broker at {broker_url}")]
    ConnectFailed { broker_url: String },

    #[error("io error: {0}")]
    Io(#[source] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("frame exceeds maximum permitted size ({size} bytes)")]
    FrameTooLarge { size: u32 },

    #[error("malformed frame: {reason}")]
    Malformed { reason: String },
}

impl TransportError {
    /// Mirrors the teacher's `StreamError::is_retryable` classifier: does
    /// this failure mean the connection itself is dead and must be torn
    /// down, or can the actor keep using the same socket?
    pub fn is_fatal_to_connection(&self) -> bool {
        match self {
            TransportError::ConnectFailed { .. } => true,
            TransportError::Io(_) => true,
            TransportError::Timeout => true,
            TransportError::FrameTooLarge { .. } => true,
            TransportError::Malformed { .. } => false,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            TransportError::Timeout
        } else {
            TransportError::Io(err)
        }
    }
}

/// Durable-queue failures.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),

    #[error("segment file corrupt: {reason}")]
    SegmentCorrupt { reason: String },

    #[error("queue is closed")]
    Closed,

    #[error("unknown ack reference")]
    UnknownAckRef,
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Io(err)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::SegmentCorrupt {
            reason: err.to_string(),
        }
    }
}

/// Producer-level failures, surfaced to `send_sync` callers and to the
/// async-path user callback.
#[derive(Debug, Clone, Error)]
pub enum ProducerError {
    #[error("producer is closed")]
    Closed,

    #[error("durable queue append failed: {reason}")]
    QueueAppendFailed { reason: String },

    #[error("send timed out waiting for broker receipt")]
    SendTimedOut,

    #[error("sequence_id allocation blocked: wrap would collide with an in-flight request")]
    SequenceIdExhausted,

    #[error("broker closed the producer")]
    BrokerClosed,

    #[error("transport error: {reason}")]
    Transport { reason: String },
}

impl From<TransportError> for ProducerError {
    fn from(err: TransportError) -> Self {
        ProducerError::Transport {
            reason: err.to_string(),
        }
    }
}

impl From<QueueError> for ProducerError {
    fn from(err: QueueError) -> Self {
        ProducerError::QueueAppendFailed {
            reason: err.to_string(),
        }
    }
}
