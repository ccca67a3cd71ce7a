//! I/O readiness and timer multiplexer contract.

pub mod tokio_poller;

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::engine::SocketId;

pub use tokio_poller::{ReadySignal, TokioPoller};

/// Something the reactor can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKey {
    /// The line input stream.
    Input,
    /// A socket the transfer engine asked for.
    Socket(SocketId),
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchKey::Input => f.write_str("input"),
            WatchKey::Socket(socket) => write!(f, "{socket}"),
        }
    }
}

/// Directions to watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };
}

/// Directions that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxEvent {
    Ready { key: WatchKey, readiness: Readiness },
    Timer,
}

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("no readiness source registered for {0}")]
    UnknownSource(WatchKey),

    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Single-threaded readiness/timer loop.
///
/// `watch` replaces any previous watch on the same key. There is exactly one
/// timer; arming it again replaces the earlier deadline. `wait` blocks for the
/// next event and returns `Ok(None)` once nothing is watched and no timer is
/// armed.
pub trait Multiplexer {
    fn watch(&mut self, key: WatchKey, interest: Interest) -> Result<(), MuxError>;
    fn unwatch(&mut self, key: WatchKey);
    fn arm_timer(&mut self, after: Duration);
    fn disarm_timer(&mut self);
    fn wait(&mut self) -> Result<Option<MuxEvent>, MuxError>;
}
