use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use formwatch::config::DEFAULT_LOG_PATH;
use formwatch::{
    EngineOptions, NullSink, RunConfig, RunLogger, Runner, UpdateEvent, UpdateSink,
};

#[derive(Parser)]
#[command(
    name = "formwatch",
    version,
    about = "Record-driven web form automation with mailbox response correlation"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every record in the input file against the configured page
    Run {
        /// Path to the JSON run configuration
        #[arg(short, long)]
        config: PathBuf,
        /// Override the input record file
        #[arg(long)]
        input: Option<PathBuf>,
        /// Override the durable output log
        #[arg(long)]
        log: Option<PathBuf>,
        /// Run the browser with a visible window
        #[arg(long)]
        headed: bool,
    },
    /// Truncate the durable output log
    Reset {
        /// The output log to clear
        #[arg(long, default_value = DEFAULT_LOG_PATH)]
        log: PathBuf,
    },
}

/// Prints every update event to the terminal.
struct ConsoleSink;

impl UpdateSink for ConsoleSink {
    fn notify(&self, event: UpdateEvent) {
        match event {
            UpdateEvent::Log { line } => print!("{line}"),
            UpdateEvent::Status {
                message,
                status,
                current_line,
                total_lines,
            } => println!("[status] {message} ({status:?}, {current_line}/{total_lines})"),
            UpdateEvent::ProgressInit { total_lines } => {
                println!("[progress] 0/{total_lines}")
            }
            UpdateEvent::ProgressUpdate {
                current_line,
                total_lines,
                line_content,
            } => println!("[progress] {current_line}/{total_lines}: {line_content}"),
            UpdateEvent::Error { message } => eprintln!("[error] {message}"),
            UpdateEvent::LogReset { message } => println!("[reset] {message}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            input,
            log,
            headed,
        } => run(config, input, log, headed).await,
        Commands::Reset { log } => {
            let logger = RunLogger::new(Arc::new(NullSink), &log);
            logger
                .truncate()
                .with_context(|| format!("failed to clear {}", log.display()))?;
            println!("Cleared {}", log.display());
            Ok(())
        }
    }
}

async fn run(
    config_path: PathBuf,
    input: Option<PathBuf>,
    log: Option<PathBuf>,
    headed: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let mut config: RunConfig = serde_json::from_str(&raw)
        .with_context(|| format!("invalid run configuration in {}", config_path.display()))?;
    if input.is_some() {
        config.input_file_path = input;
    }
    if log.is_some() {
        config.output_log_path = log;
    }

    let runner = Arc::new(
        Runner::new(Arc::new(ConsoleSink)).with_engine_options(EngineOptions {
            headless: !headed,
            ..EngineOptions::default()
        }),
    );

    // First Ctrl-C stops cooperatively after the current record.
    let stopper = runner.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping after the current record");
            stopper.stop();
        }
    });

    runner.start(config).await?;
    Ok(())
}
