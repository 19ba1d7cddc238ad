//! Logging setup: colored level output to the terminal, plus a daily
//! rolling file under the configured log directory.

use std::path::Path;

use colored::Colorize;

/// Initializes the global logger. Safe to call once per process; a second
/// call returns the `SetLoggerError` from the underlying `log` crate,
/// wrapped here as a plain `anyhow::Error`.
pub fn init_logging(log_dir: &Path, level: log::LevelFilter) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "sqllogctl.log");

    fern::Dispatch::new()
        .format(|out, message, record| {
            let level = match record.level() {
                log::Level::Error => record.level().to_string().red(),
                log::Level::Warn => record.level().to_string().yellow(),
                log::Level::Info => record.level().to_string().green(),
                log::Level::Debug => record.level().to_string().blue(),
                log::Level::Trace => record.level().to_string().dimmed(),
            };
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level,
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .chain(fern::Output::writer(Box::new(file_appender), ""))
        .apply()?;

    Ok(())
}
