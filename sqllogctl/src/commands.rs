//! Subcommand bodies. Each takes the shared engine handle and whatever
//! arguments its CLI variant carries; `main.rs` only does argument parsing
//! and dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use sqllog::{AppendRequest, Dialect, KvLog};

pub async fn put(log: Arc<dyn KvLog>, key: String, value: String) -> anyhow::Result<()> {
    let (_, existing) = log.list(&key, "", 1, 0, false).await.unwrap_or((0, Vec::new()));
    let request = match existing.first() {
        Some(tip) => AppendRequest {
            key: key.into_bytes(),
            value: value.into_bytes(),
            prev_revision: tip.kv.mod_revision,
            create_revision: tip.kv.create_revision,
            ..Default::default()
        },
        None => AppendRequest { key: key.into_bytes(), value: value.into_bytes(), create: true, ..Default::default() },
    };
    let revision = log.append(request).await?;
    println!("{} revision {}", "OK".green(), revision);
    Ok(())
}

pub async fn get(log: Arc<dyn KvLog>, key: String) -> anyhow::Result<()> {
    let (_, events) = log.list(&key, "", 1, 0, false).await?;
    match events.first() {
        Some(event) if !event.is_delete() => {
            println!("{}", String::from_utf8_lossy(&event.kv.value));
        }
        _ => println!("{}", "not found".red()),
    }
    Ok(())
}

pub async fn list(log: Arc<dyn KvLog>, prefix: String) -> anyhow::Result<()> {
    let (revision, events) = log.list(&prefix, "", 0, 0, false).await?;
    println!("revision {revision}");
    for event in events {
        println!(
            "{}\t{}\t(mod_revision {})",
            String::from_utf8_lossy(&event.kv.key),
            String::from_utf8_lossy(&event.kv.value),
            event.kv.mod_revision
        );
    }
    Ok(())
}

pub async fn watch(log: Arc<dyn KvLog>, prefix: String, seconds: u64, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let mut rx = log.watch(&prefix).await?;
    println!("watching {prefix} for {seconds}s (ctrl-c to stop earlier)");
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    let mut poll_shutdown = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = poll_shutdown.tick() => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
            batch = rx.recv() => {
                match batch {
                    Some(events) => {
                        for event in events {
                            println!(
                                "{:?}\t{}\t(mod_revision {})",
                                event.kind,
                                String::from_utf8_lossy(&event.kv.key),
                                event.kv.mod_revision
                            );
                        }
                    }
                    None => break,
                }
            }
        }
    }
    Ok(())
}

pub async fn status(log: Arc<dyn KvLog>) -> anyhow::Result<()> {
    let revision = log.current_revision().await?;
    let (_, count) = log.count("/").await?;
    println!("current_revision: {revision}");
    println!("live_keys_under_/: {count}");
    Ok(())
}

pub async fn compact(
    dialect: Arc<sqllog::dialect::sqlite::SqliteDialect>,
    options: sqllog::Options,
) -> anyhow::Result<()> {
    let compactor = sqllog::compactor::Compactor::new(dialect.clone(), &options);
    let deleted = compactor.run_once().await?;
    let compact_revision = dialect.get_compact_revision()?;
    println!("deleted {deleted} rows, compact_revision now {compact_revision}");
    Ok(())
}
