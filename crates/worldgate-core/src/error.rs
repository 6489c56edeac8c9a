use thiserror::Error;

/// Errors produced by the worldgate protocol and relay layers.
///
/// Routing and correlation outcomes (world offline, timeout, session
/// loss, cancellation) are modeled where they occur, in the dispatcher's
/// wait outcome and the auth adapter's error type; this enum covers the
/// transport and infrastructure failures that propagate with `?`.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("session closed")]
    SessionClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type GateResult<T> = Result<T, GateError>;
