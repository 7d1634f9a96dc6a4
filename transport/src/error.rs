use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to applications using a reliable stream. Transient problems (a failed send,
///  a malformed ACK) are handled inside the stream and never show up here.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("stream is closed")]
    Closed,

    #[error("no data arrived within {0:?}")]
    Timeout(Duration),

    #[error("connection is dead: {0}")]
    ConnectionDead(String),

    #[error("sequence numbers for this stream are exhausted")]
    SequenceExhausted,

    #[error("stream delivers messages to a listener and can not be read directly")]
    ListenerMode,
}

pub type TransportResult<T> = Result<T, TransportError>;
