// Module-specific lints configuration
#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError, error, info, warn};
use regex::Regex;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::watch;

use corpus_translator::app_config::{self, Config, PipelineOverrides};
use corpus_translator::translation::scheduler::text_size;
use corpus_translator::{AppError, Controller, RunError};

/// CLI Wrapper for LogLevel to implement ValueEnum
#[derive(Debug, Clone, ValueEnum)]
enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for app_config::LogLevel {
    fn from(cli_level: CliLogLevel) -> Self {
        match cli_level {
            CliLogLevel::Error => app_config::LogLevel::Error,
            CliLogLevel::Warn => app_config::LogLevel::Warn,
            CliLogLevel::Info => app_config::LogLevel::Info,
            CliLogLevel::Debug => app_config::LogLevel::Debug,
            CliLogLevel::Trace => app_config::LogLevel::Trace,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Translate every untranslated sentence of the store (default command)
    Translate(RunArgs),

    /// Print the batch plan per book without calling the service
    Plan(RunArgs),

    /// Generate shell completions for corpus-translator
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "conf.json")]
    config_path: PathBuf,

    /// Set logging level
    #[arg(short, long, value_enum)]
    log_level: Option<CliLogLevel>,

    /// Sentence store to translate (overrides the configuration file)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Only process books whose id matches this regular expression
    #[arg(short, long)]
    book: Option<String>,

    /// Concurrent batches per book
    #[arg(long, env = "WORKER_COUNT")]
    worker_count: Option<usize>,

    /// Maximum characters per batch
    #[arg(long, env = "MAX_CHUNK_CHARS")]
    max_chunk_chars: Option<usize>,

    /// Timeout of the first call attempt, in seconds
    #[arg(long, env = "CALL_TIMEOUT_SECONDS")]
    call_timeout_seconds: Option<u64>,

    /// Timeout of every retry attempt, in seconds
    #[arg(long, env = "RETRY_CALL_TIMEOUT_SECONDS")]
    retry_call_timeout_seconds: Option<u64>,

    /// Additional attempts after a failed one
    #[arg(long, env = "MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Time limit for a whole book, in seconds
    #[arg(long, env = "BOOK_DEADLINE_SECONDS")]
    book_deadline_seconds: Option<u64>,
}

impl RunArgs {
    fn overrides(&self) -> PipelineOverrides {
        PipelineOverrides {
            worker_count: self.worker_count,
            max_chunk_chars: self.max_chunk_chars,
            call_timeout_secs: self.call_timeout_seconds,
            retry_call_timeout_secs: self.retry_call_timeout_seconds,
            max_retries: self.max_retries,
            book_deadline_secs: self.book_deadline_seconds,
        }
    }

    fn book_filter(&self) -> Result<Option<Regex>> {
        self.book
            .as_deref()
            .map(|pattern| Regex::new(pattern).with_context(|| format!("Invalid book pattern: {}", pattern)))
            .transpose()
    }
}

/// corpus-translator - bulk sentence translation with an LLM backend
#[derive(Parser, Debug)]
#[command(name = "corpus-translator")]
#[command(version)]
#[command(about = "Translate the untranslated sentences of a SQLite store with an LLM")]
#[command(long_about = "corpus-translator reads every sentence without a translation from the store,
packs them into batches per book and translates the batches concurrently. A batch is only
written when the response names exactly the sentences that were sent.

EXAMPLES:
    corpus-translator                              # Translate using conf.json
    corpus-translator -d texts.db -b '^mn'         # Only books whose id starts with 'mn'
    MAX_RETRIES=2 corpus-translator translate      # Retry failed batches twice
    corpus-translator plan --max-chunk-chars 800   # Show the batches without calling the service
    corpus-translator completions bash > ct.bash   # Generate bash completions

CONFIGURATION:
    Configuration is stored in conf.json by default. If the file doesn't exist, a default
    one is created. Keys are read from GEMINI_API_KEYS (one per line, '#' comments allowed);
    a .env file in the working directory is loaded first.")]
#[command(args_conflicts_with_subcommands = true)]
struct CommandLineOptions {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

// @struct: Custom logger implementation
struct CustomLogger {
    level: LevelFilter,
}

impl CustomLogger {
    // @creates: New logger with specified level
    fn new(level: LevelFilter) -> Self {
        CustomLogger { level }
    }

    // @initializes: Global logger
    fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
        let logger = Box::new(CustomLogger::new(level));
        log::set_boxed_logger(logger)?;
        log::set_max_level(level);
        Ok(())
    }

    // @returns: Label and color for log level
    fn style_for_level(level: Level) -> (&'static str, &'static str) {
        match level {
            Level::Error => ("ERROR", "1;31"),
            Level::Warn => ("WARN ", "1;33"),
            Level::Info => ("INFO ", "1;32"),
            Level::Debug => ("DEBUG", "1;36"),
            Level::Trace => ("TRACE", "1;35"),
        }
    }
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now = chrono::Local::now().format("%H:%M:%S.%3f");
            let (label, color) = Self::style_for_level(record.level());

            let _ = writeln!(
                std::io::stderr(),
                "\x1B[{}m{} {} {}\x1B[0m",
                color,
                now,
                label,
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is not an error
    dotenv::dotenv().ok();

    // Initialize the logger with the most verbose level; the effective level is
    // set through log::set_max_level once the configuration is known
    CustomLogger::init(LevelFilter::Trace)?;
    log::set_max_level(LevelFilter::Info);

    let cli = CommandLineOptions::parse();

    match cli.command {
        Some(Commands::Completions { shell }) => {
            let mut cmd = CommandLineOptions::command();
            generate(shell, &mut cmd, "corpus-translator", &mut std::io::stdout());
            Ok(())
        }
        Some(Commands::Plan(args)) => run_plan(args),
        Some(Commands::Translate(args)) => run_translate(args).await,
        None => run_translate(cli.run).await,
    }
}

/// Load the configuration and apply command line and environment overrides
fn load_config(args: &RunArgs) -> Result<Config> {
    let mut config = Config::load_or_create(&args.config_path)?;
    config.apply_overrides(&args.overrides());

    if let Some(database) = &args.database {
        config.database_path = database.clone();
    }

    if let Some(level) = &args.log_level {
        config.log_level = level.clone().into();
    }
    log::set_max_level(config.log_level.to_level_filter());

    Ok(config)
}

fn run_plan(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    let filter = args.book_filter()?;
    let controller = Controller::with_config(config)?;

    let plans = controller.plan(filter.as_ref())?;
    if plans.is_empty() {
        println!("No untranslated sentences found");
        return Ok(());
    }

    for plan in &plans {
        let sentences: usize = plan.batches.iter().map(|b| b.len()).sum();
        println!(
            "{} (ref {}): {} sentence(s) in {} batch(es)",
            plan.book_id,
            plan.book_ref,
            sentences,
            plan.batches.len()
        );
        for batch in &plan.batches {
            let oversized = batch.len() == 1
                && batch
                    .lines
                    .first()
                    .is_some_and(|l| text_size(&l.source_text) > controller.config().pipeline.max_chunk_chars);
            println!(
                "  batch {:>4}: {:>3} sentence(s), {:>6} char(s){}",
                batch.batch_id,
                batch.len(),
                batch.total_size,
                if oversized { " [oversized]" } else { "" }
            );
        }
    }

    Ok(())
}

async fn run_translate(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    let filter = args.book_filter()?;
    let controller = Controller::with_config(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after cleanup...");
            let _ = shutdown_tx.send(true);
        }
    });

    let start_time = std::time::Instant::now();
    match controller.run(filter.as_ref(), shutdown_rx).await {
        Ok(summary) => {
            summary.log();
            info!("Total time: {:.1}s", start_time.elapsed().as_secs_f32());
            Ok(())
        }
        Err(e) => {
            let error = match e.downcast::<RunError>() {
                Ok(run_error) => AppError::Run(run_error),
                Err(other) => AppError::from(other),
            };
            error!("Run aborted: {}", error);
            Err(error.into())
        }
    }
}
