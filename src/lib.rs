//! Concurrent URL fetcher: reads lines, runs their transfers concurrently
//! under a ceiling, and writes each response in the order its line arrived.

pub mod admission;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod input;
pub mod logging;
pub mod metrics;
pub mod mux;
pub mod queue;
pub mod reactor;
pub mod record;

pub use config::Config;
pub use engine::{HttpEngine, TransferEngine};
pub use error::{FetchError, Result};
pub use input::LineChannel;
pub use mux::{Multiplexer, ReadySignal, TokioPoller, WatchKey};
pub use reactor::{Reactor, ReactorOptions, RunSummary};
