use std::fs;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{FetchError, Result};

/// Initializes logging on stderr, plus a daily-rolling JSON file when
/// `config.directory` is set. Stdout is left to the fetched output.
///
/// Keep the returned guard alive so buffered file logs are flushed on exit.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let directive = format!("hiperfetch={}", config.level)
        .parse::<Directive>()
        .map_err(|e| FetchError::Config(format!("invalid log level '{}': {}", config.level, e)))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let (file_layer, guard) = match &config.directory {
        Some(directory) => {
            fs::create_dir_all(directory)?;
            let file_appender = tracing_appender::rolling::daily(directory, "hiperfetch.log");
            let (writer, guard) = tracing_appender::non_blocking(file_appender);
            (Some(fmt::layer().json().with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    let (pretty, json) = if config.json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stderr)), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(pretty)
        .with(json)
        .try_init()
        .map_err(|e| FetchError::Config(format!("logging already initialized: {}", e)))?;

    Ok(guard)
}
