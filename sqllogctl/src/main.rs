//! `sqllogctl` -- a small demonstration CLI over the `sqllog` engine.
//!
//! Scoped to the operations the core actually exposes (put/get/list/watch/
//! compact/status): no gRPC server, no SQL REPL, no npm-registry-flavored
//! subcommands -- those belong to the higher-level surface this crate's
//! spec treats as an external collaborator.

mod commands;
mod config;
mod trace;

use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::info;
use sqllog::dialect::sqlite::SqliteDialect;
use sqllog::{KvLog, SQLLog};

#[derive(Debug, Parser)]
#[command(author, version, about = "demonstration client for the sqllog engine")]
struct Args {
    /// Configuration file path.
    #[clap(short = 'c', long = "config", default_value = "sqllogctl.json")]
    config: String,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or update a key.
    Put { key: String, value: String },
    /// Print the current value of a key.
    Get { key: String },
    /// List the live keys under a prefix.
    List { prefix: String },
    /// Stream committed events under a prefix for the given duration.
    Watch {
        prefix: String,
        #[clap(long, default_value_t = 30)]
        seconds: u64,
    },
    /// Run one compaction pass immediately.
    Compact,
    /// Print the current revision and live key count.
    Status,
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: "".into(),
    };

    let default_hook = panic::take_hook();
    if std::env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);
            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta)
                .expect("human-panic: printing error message to console failed");
        }));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_panic_hooks();

    let args = Args::parse();
    let cfg = config::Config::load(std::path::Path::new(&args.config))?;

    let level: log::LevelFilter = args.log_level.parse().unwrap_or(log::LevelFilter::Info);
    trace::init_logging(&cfg.log_dir, level)?;
    info!("sqllogctl starting, db={} table={}", cfg.db_path, cfg.table);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let dialect = SqliteDialect::open(&cfg.db_path, &cfg.table)?;
    let engine: Arc<dyn KvLog> = Arc::new(SQLLog::new(dialect, cfg.to_options()));
    engine.start().await?;

    match args.cmd {
        Command::Put { key, value } => commands::put(engine, key, value).await?,
        Command::Get { key } => commands::get(engine, key).await?,
        Command::List { prefix } => commands::list(engine, prefix).await?,
        Command::Watch { prefix, seconds } => commands::watch(engine, prefix, seconds, running).await?,
        Command::Status => commands::status(engine).await?,
        Command::Compact => {
            let dialect = Arc::new(SqliteDialect::open(&cfg.db_path, &cfg.table)?);
            commands::compact(dialect, cfg.to_options()).await?
        }
    }

    Ok(())
}
