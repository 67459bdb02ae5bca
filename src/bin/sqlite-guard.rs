use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use resilient_sqlite::{
    BackupDriver, Connection, ConnectionOptions, RetryPolicy, StorageConfig, StorageError,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Backups and health checks for SQLite databases")]
struct Args {
    /// Storage configuration (JSON). Command-line flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Retries on lock contention; -1 retries until interrupted.
    #[arg(long, global = true, allow_hyphen_values = true)]
    retries: Option<i32>,
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    backoff: Option<Duration>,
    /// Sleep inside SQLite's busy callback; defaults to the backoff.
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    busy_timeout: Option<Duration>,
    #[arg(long, global = true, value_enum, default_value = "info")]
    log_level: LogLevel,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy a database (or every backup target of the configuration) to a new file.
    Backup {
        source: Option<PathBuf>,
        dest: Option<PathBuf>,
        #[arg(long, default_value = "main")]
        schema: String,
        /// Pages copied per step; -1 copies everything in one step.
        #[arg(long, allow_hyphen_values = true)]
        pages: Option<i32>,
        /// Skip when the destination is younger than this.
        #[arg(long, value_parser = humantime::parse_duration)]
        max_age: Option<Duration>,
    },
    /// Run the quick and foreign key integrity checks.
    Check { db: Option<PathBuf> },
    /// Refresh planner statistics.
    Analyze {
        db: Option<PathBuf>,
        /// Also run `PRAGMA incremental_vacuum` and `PRAGMA optimize`.
        #[arg(long)]
        optimize: bool,
    },
}

fn connection_options(
    args: &Args,
    config: Option<&StorageConfig>,
    path: Option<&Path>,
) -> Result<ConnectionOptions, StorageError> {
    let mut options = match (config, path) {
        (Some(config), None) => config.into_connection_options()?,
        (Some(config), Some(path)) => config
            .into_connection_options()?
            .for_path(path.to_string_lossy()),
        (None, Some(path)) => ConnectionOptions::new(path.to_string_lossy()),
        (None, None) => {
            return Err(StorageError::Config(
                "pass a database path or --config".into(),
            ));
        }
    };
    if args.retries.is_some() || args.backoff.is_some() {
        options.retry = RetryPolicy::new(
            args.retries.unwrap_or(options.retry.max_retries),
            args.backoff.unwrap_or(options.retry.backoff),
        );
        options.busy_timeout = options.retry.backoff;
    }
    if let Some(timeout) = args.busy_timeout {
        options.busy_timeout = timeout;
    }
    options.validate()?;
    Ok(options)
}

fn run(args: &Args, cancel: &CancellationToken) -> Result<(), StorageError> {
    let config = args
        .config
        .as_deref()
        .map(StorageConfig::from_json_file)
        .transpose()?;

    match &args.command {
        Command::Backup {
            source,
            dest,
            schema,
            pages,
            max_age,
        } => {
            let options = connection_options(args, config.as_ref(), source.as_deref())?;
            let pages = pages
                .or(config.as_ref().map(|c| c.backup.pages_per_step))
                .unwrap_or(-1);
            let max_age = max_age
                .or(config.as_ref().map(StorageConfig::backup_max_age))
                .unwrap_or(Duration::ZERO);
            let targets = match (dest, &config) {
                (Some(dest), _) => vec![(schema.clone(), dest.clone())],
                (None, Some(config)) => config
                    .backup_targets()
                    .into_iter()
                    .map(|(schema, path)| (schema.to_owned(), path))
                    .collect(),
                (None, None) => {
                    return Err(StorageError::Config(
                        "pass a destination or a configuration with backup targets".into(),
                    ));
                }
            };

            let conn = Connection::open(options, cancel.clone())?;
            let driver = BackupDriver::new(pages)?;
            for (schema, dest) in targets {
                match driver.backup_if_older(&conn, &schema, &dest, max_age)? {
                    Some(report) => println!(
                        "{} -> {}: {} pages in {}",
                        report.source_schema,
                        report.destination.display(),
                        report.pages,
                        humantime::format_duration(report.elapsed)
                    ),
                    None => println!("{}: recent enough, skipped", dest.display()),
                }
            }
            Ok(())
        }
        Command::Check { db } => {
            let options = connection_options(args, config.as_ref(), db.as_deref())?;
            let conn = Connection::open(options, cancel.clone())?;
            let problems = conn.quick_check()?;
            let violations = conn.foreign_key_check()?;
            for problem in &problems {
                println!("integrity: {problem}");
            }
            for violation in &violations {
                println!("foreign key: {violation}");
            }
            if problems.is_empty() && violations.is_empty() {
                println!("{}: ok", conn.path());
                Ok(())
            } else {
                Err(StorageError::Integrity(format!(
                    "{} integrity problems, {} foreign key violations",
                    problems.len(),
                    violations.len()
                )))
            }
        }
        Command::Analyze { db, optimize } => {
            let options = connection_options(args, config.as_ref(), db.as_deref())?;
            let conn = Connection::open(options, cancel.clone())?;
            conn.analyze()?;
            if *optimize {
                conn.optimize()?;
            }
            if let Some(at) = conn.last_analyze_time() {
                println!("{}: analyzed at {}", conn.path(), at.to_rfc3339());
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(Level::from(args.log_level))
        .init();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let outcome = tokio::task::spawn_blocking(move || run(&args, &cancel)).await;
    match outcome {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            tracing::error!(error = %err, "sqlite-guard failed");
            ExitCode::FAILURE
        }
        Err(err) => {
            tracing::error!(error = %err, "sqlite-guard worker panicked");
            ExitCode::FAILURE
        }
    }
}
