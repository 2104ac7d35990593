// ===============================
// src/error.rs
// ===============================
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

/// Outcome taxonomy of a signed REST call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("venue http {status}")]
    Http { status: u16 },
    #[error("rate limited on {0}")]
    RateLimited(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("venue error {code}: {msg}")]
    Venue { code: i64, msg: String },
    #[error("circuit open for {endpoint}, retry in {remaining:?}")]
    CircuitOpen { endpoint: String, remaining: Duration },
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("shutting down")]
    Cancelled,
}

impl TransportError {
    /// Transport-level failures are retried with backoff and count against
    /// the circuit breaker. Venue answers (even rejections) do not.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout | TransportError::Connection(_) => true,
            TransportError::Http { status } => *status >= 500,
            _ => false,
        }
    }
}

/// Local validation failures raised before anything reaches the venue.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("no instrument metadata for {0}")]
    UnknownInstrument(String),
    /// Order parameters the venue would refuse, e.g. a size under the
    /// instrument minimum after step rounding.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("no open position for {0}")]
    NoPosition(String),
    #[error("position already open for {0}")]
    PositionOpen(String),
    #[error("pyramid limit {0} reached")]
    PyramidLimit(u32),
    #[error("stop {new} does not tighten current stop {current:?}")]
    StopNotTighter { new: Decimal, current: Option<Decimal> },
    #[error("{0} is divergent from venue state; new exposure refused")]
    Divergent(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("state file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file encoding: {0}")]
    Json(#[from] serde_json::Error),
}

/// Startup failures; anything after startup is handled inside the tasks.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Persist(#[from] PersistError),
}
