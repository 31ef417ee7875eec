use thiserror::Error;

/// Errors surfaced by the transport core.
///
/// Hot-path buffer acquisition and timed waits do *not* produce these;
/// they return empty handles and let the caller decide whether to retry.
/// Flow-control conditions reported by a device arrive as
/// [`StreamEvent`](crate::stream::StreamEvent)s, not errors.
#[derive(Error, Debug)]
pub enum RfnocError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("sequence error: {0}")]
    Sequence(String),

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("topology error: {0}")]
    Topology(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RfnocError>;
