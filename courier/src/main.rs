//! `courier`: demo driver for the offline delivery pipeline.
//!
//! Composes a few messages while offline, restores connectivity, cycles the
//! app through background and foreground, and prints what happened. The
//! outbound queue is persisted under the data directory, so messages left
//! over from an interrupted run are picked up on the next one.
//!
//! ```bash
//! cargo run --bin courier -- --user alice --chat general --messages 5
//! COURIER_LOG=debug cargo run --bin courier -- --log-file /tmp/courier.log
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::StreamExt;
use tracing_appender::non_blocking::WorkerGuard;

use courier::config::{CliArgs, CourierConfig};
use courier::connectivity::{Interface, Reachability};
use courier::pipeline::{Courier, Started};
use courier::remote::memory::MemoryRemote;
use courier::storage::file::FileStore;
use courier_proto::message::{ChatId, UserId};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match CourierConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("courier starting");

    let result = run(&cli, &config).await;
    tracing::info!("courier exiting");
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging so stdout stays free for the demo output.
///
/// Returns a guard that must be held until the program exits to ensure
/// buffered logs are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("courier.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(cli: &CliArgs, config: &CourierConfig) -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = config.resolved_data_dir();
    let store = FileStore::open(data_dir.clone())?;
    let remote = Arc::new(MemoryRemote::new());
    let chat = ChatId::new(cli.chat.as_str());

    let Started {
        courier,
        reachability,
        inbound: _inbound,
    } = Courier::start(config, UserId::new(cli.user.as_str()), store, Arc::clone(&remote)).await?;

    println!("queue: {}", data_dir.display());
    let leftover = courier.pending().await?;
    if !leftover.is_empty() {
        println!("recovered {} message(s) from a previous run", leftover.len());
    }

    courier.watch_chat(chat.clone());
    let mut changes = courier.observe(chat.clone());
    let printer = tokio::spawn(async move {
        while let Some(change) = changes.next().await {
            let previous = change
                .previous
                .map_or_else(|| "new".to_string(), |s| s.to_string());
            println!(
                "  {} {previous} -> {} (retries: {})",
                change.message_id, change.status, change.retry_count
            );
        }
    });

    println!("offline: composing {} message(s)", cli.messages);
    for n in 1..=cli.messages {
        let receipt = courier.send_text(&chat, &format!("message {n}")).await?;
        println!("composed {} [{}]", receipt.message.id, receipt.status);
    }

    println!("connectivity restored");
    reachability.push(Reachability::Up(Interface::Wifi));
    let mut connection = courier.connection();
    while !connection.borrow_and_update().is_online() {
        connection.changed().await?;
    }
    let synced = courier.drain().await?;
    println!("synced {synced} message(s), {} document(s) in {chat}", remote.documents(&chat).len());

    let background = courier.lifecycle().on_background().await?;
    println!(
        "background in {:?} (pending {}, within budget: {})",
        background.duration, background.pending, background.within_budget
    );
    let foreground = courier.lifecycle().on_foreground().await?;
    println!(
        "foreground in {:?} (pending {}, within budget: {})",
        foreground.duration, foreground.pending, foreground.within_budget
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let shutdown = courier.shutdown().await?;
    println!("terminated with {} message(s) still queued", shutdown.pending);
    printer.abort();
    Ok(())
}
