use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use hiperfetch::logging;
use hiperfetch::metrics::FetchMetrics;
use hiperfetch::{
    Config, HttpEngine, LineChannel, Reactor, ReadySignal, RunSummary, TokioPoller, WatchKey,
};

#[derive(Parser)]
#[command(name = "hiperfetch")]
#[command(about = "Fetch URLs read line by line, writing responses in input order")]
#[command(version)]
struct Cli {
    /// Maximum concurrent transfers
    #[arg(short = 'n', long)]
    max_running: Option<usize>,

    /// Configuration file (defaults to ./hiperfetch.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Read lines from this file or FIFO instead of stdin
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output delimiter: one byte, or \n, \t, \r, \0
    #[arg(short, long)]
    delimiter: Option<String>,

    /// Append the error text of failed transfers to their output
    #[arg(long)]
    emit_errors: bool,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::discover(cli.config.as_deref()).context("loading configuration")?;
    config.apply_env()?;
    if let Some(max_running) = cli.max_running {
        config.fetch.max_running = max_running;
    }
    if let Some(delimiter) = cli.delimiter {
        config.output.delimiter = delimiter;
    }
    if cli.emit_errors {
        config.output.emit_errors = true;
    }
    config.validate()?;

    let _guard = logging::init_logging(&config.logging)?;
    FetchMetrics::register_metrics();

    match run(&config, cli.input.as_deref()) {
        Ok(summary) => {
            info!(
                "done: {} lines, {} transfers, {} failed",
                summary.lines, summary.transfers, summary.failures
            );
            Ok(())
        }
        Err(e) => {
            error!("hiperfetch failed: {:#}", e);
            Err(e)
        }
    }
}

fn run(config: &Config, input: Option<&Path>) -> Result<RunSummary> {
    let mut poller = TokioPoller::new().context("starting event loop")?;
    let handle = poller.handle().clone();

    let engine = HttpEngine::new(handle.clone(), config.transfer_limits())
        .context("initializing transfer engine")?;
    poller.register(WatchKey::Socket(HttpEngine::EVENT_SOCKET), engine.signal());

    let input_signal = ReadySignal::new();
    poller.register(WatchKey::Input, input_signal.clone());
    let capacity = config.fetch.input_buffer_lines;
    let lines = match input {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("opening input {}", path.display()))?;
            LineChannel::spawn(&handle, tokio::fs::File::from_std(file), input_signal, capacity)
        }
        None => LineChannel::spawn(&handle, tokio::io::stdin(), input_signal, capacity),
    };

    let sink = BufWriter::new(std::io::stdout().lock());
    let mut reactor = Reactor::new(engine, poller, lines, sink, config.reactor_options()?);
    let summary = reactor.run()?;
    Ok(summary)
}
