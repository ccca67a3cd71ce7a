use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::admission::DEFAULT_MAX_RUNNING;
use crate::engine::TransferLimits;
use crate::error::{FetchError, Result};
use crate::ingest::DEFAULT_MAX_LINE_LEN;
use crate::reactor::ReactorOptions;

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "hiperfetch.toml";

pub const ENV_MAX_RUNNING: &str = "HIPERFETCH_MAX_RUNNING";
pub const ENV_LOG_LEVEL: &str = "HIPERFETCH_LOG_LEVEL";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fetch: FetchConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub max_running: usize,
    pub max_line_len: usize,
    /// Zero disables the low-speed abort.
    pub low_speed_time_secs: u64,
    pub low_speed_limit: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: Option<String>,
    /// Lines read ahead of the reactor.
    pub input_buffer_lines: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_running: DEFAULT_MAX_RUNNING,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            low_speed_time_secs: 3,
            low_speed_limit: 10,
            connect_timeout_secs: 10,
            user_agent: None,
            input_buffer_lines: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub delimiter: String,
    pub emit_errors: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            delimiter: "\n".to_string(),
            emit_errors: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Write JSON to stderr instead of the human-readable format.
    pub json: bool,
    /// Also write daily-rolling JSON logs here.
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            FetchError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// `path` if given, else `hiperfetch.toml` if present, else defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::load(Path::new(DEFAULT_CONFIG_FILE))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(ENV_MAX_RUNNING) {
            self.fetch.max_running = value.trim().parse().map_err(|_| {
                FetchError::Config(format!("{ENV_MAX_RUNNING} must be a positive integer, got '{value}'"))
            })?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch.max_running == 0 {
            return Err(FetchError::Config("max_running must be at least 1".into()));
        }
        if self.fetch.max_line_len == 0 {
            return Err(FetchError::Config("max_line_len must be at least 1".into()));
        }
        self.delimiter_byte()?;
        Ok(())
    }

    pub fn delimiter_byte(&self) -> Result<u8> {
        parse_delimiter(&self.output.delimiter)
    }

    pub fn transfer_limits(&self) -> TransferLimits {
        TransferLimits {
            low_speed_time: Duration::from_secs(self.fetch.low_speed_time_secs),
            low_speed_limit: self.fetch.low_speed_limit,
            connect_timeout: Duration::from_secs(self.fetch.connect_timeout_secs),
            user_agent: self.fetch.user_agent.clone(),
        }
    }

    pub fn reactor_options(&self) -> Result<ReactorOptions> {
        Ok(ReactorOptions {
            max_running: self.fetch.max_running,
            delimiter: self.delimiter_byte()?,
            max_line_len: self.fetch.max_line_len,
            emit_errors: self.output.emit_errors,
        })
    }
}

/// One byte, or one of the escapes `\n`, `\t`, `\r`, `\0` as typed on a
/// command line.
pub fn parse_delimiter(text: &str) -> Result<u8> {
    let byte = match text {
        "\\n" => b'\n',
        "\\t" => b'\t',
        "\\r" => b'\r',
        "\\0" => 0,
        _ if text.len() == 1 => text.as_bytes()[0],
        _ => {
            return Err(FetchError::Config(format!(
                "delimiter must be a single byte, got {text:?}"
            )))
        }
    };
    Ok(byte)
}
