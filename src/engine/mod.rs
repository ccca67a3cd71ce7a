//! Transfer engine contract
//!
//! The reactor never performs HTTP itself. It drives an engine that accepts new
//! transfers, asks to have sockets watched, asks for a single timer, and reports
//! finished transfers when polled. Everything the engine wants from the reactor
//! is pushed through [`EngineHooks`], which the reactor passes into every call.

pub mod http;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, EXPECT};
use thiserror::Error;

pub use http::{HttpEngine, TransferLimits};

/// Engine-assigned identity of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A readiness source the engine wants watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket {}", self.0)
    }
}

/// What the engine wants done with a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketAction {
    In,
    Out,
    InOut,
    Remove,
}

impl fmt::Display for SocketAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketAction::In => "IN",
            SocketAction::Out => "OUT",
            SocketAction::InOut => "INOUT",
            SocketAction::Remove => "REMOVE",
        };
        f.write_str(name)
    }
}

/// Readiness bitmask handed back to the engine on a socket advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketEvents {
    pub input: bool,
    pub output: bool,
}

/// Headers shared by every POST transfer.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    set: HeaderMap,
    suppressed: Vec<HeaderName>,
}

impl RequestHeaders {
    /// JSON payload headers with `Expect` explicitly suppressed.
    pub fn json_post() -> Self {
        let mut set = HeaderMap::new();
        set.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            set,
            suppressed: vec![EXPECT],
        }
    }

    pub fn suppressed(&self) -> &[HeaderName] {
        &self.suppressed
    }

    /// Headers to put on the wire: everything set, minus anything suppressed.
    pub fn header_map(&self) -> HeaderMap {
        let mut headers = self.set.clone();
        for name in &self.suppressed {
            headers.remove(name);
        }
        headers
    }
}

/// One fetch handed to the engine.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub post: Option<Bytes>,
    pub headers: Option<Arc<RequestHeaders>>,
}

impl TransferRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            post: None,
            headers: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Bytes, headers: Arc<RequestHeaders>) -> Self {
        Self {
            url: url.into(),
            post: Some(body),
            headers: Some(headers),
        }
    }
}

/// Why a single transfer failed. Never fatal to the run.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("Operation too slow. Less than {limit} bytes/sec transferred the last {secs} seconds")]
    TooSlow { limit: u64, secs: u64 },

    #[error("{0}")]
    Other(String),
}

/// A finished transfer as reported by [`TransferEngine::next_completed`].
#[derive(Debug)]
pub struct Completion {
    pub transfer: TransferId,
    pub effective_url: String,
    pub result: Result<(), TransferError>,
}

/// Errors from engine control calls.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("bad handle")]
    BadHandle,

    #[error("unknown transfer {0}")]
    UnknownTransfer(TransferId),

    #[error("bad {0}")]
    BadSocket(SocketId),

    #[error("out of memory")]
    OutOfMemory,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("unknown option: {0}")]
    UnknownOption(String),

    #[error("engine initialization failed: {0}")]
    Init(String),
}

impl EngineError {
    /// The one class of control-call failure that is logged and ignored.
    pub fn is_bad_socket(&self) -> bool {
        matches!(self, EngineError::BadSocket(_))
    }
}

/// Callbacks from the engine into the reactor.
pub trait EngineHooks {
    /// Start, change, or stop watching `socket`.
    fn socket(&mut self, socket: SocketId, owner: Option<TransferId>, action: SocketAction);

    /// Next deadline: `None` disarms, zero means "advance now", anything else
    /// replaces the previously armed timer.
    fn timer(&mut self, timeout: Option<Duration>);

    /// Body bytes arrived for `transfer`.
    fn data(&mut self, transfer: TransferId, chunk: Bytes);
}

/// Non-blocking multi-transfer HTTP engine.
pub trait TransferEngine {
    fn add(
        &mut self,
        request: TransferRequest,
        hooks: &mut dyn EngineHooks,
    ) -> Result<TransferId, EngineError>;

    /// Advance after `socket` became ready. Returns the still-running count.
    fn socket_action(
        &mut self,
        socket: SocketId,
        events: SocketEvents,
        hooks: &mut dyn EngineHooks,
    ) -> Result<usize, EngineError>;

    /// Advance for the timeout reason. Returns the still-running count.
    fn timeout_action(&mut self, hooks: &mut dyn EngineHooks) -> Result<usize, EngineError>;

    fn next_completed(&mut self) -> Option<Completion>;

    /// Detach a finished transfer and release it.
    fn remove(&mut self, transfer: TransferId) -> Result<(), EngineError>;
}
