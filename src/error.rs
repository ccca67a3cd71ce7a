use thiserror::Error;

use crate::engine::{EngineError, TransferId};
use crate::mux::MuxError;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{op} returned {source}")]
    Engine {
        op: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("Multiplexer error: {0}")]
    Mux(#[from] MuxError),

    #[error("transfer {0} completed without a queued record")]
    OrphanCompletion(TransferId),
}

pub type Result<T> = std::result::Result<T, FetchError>;
