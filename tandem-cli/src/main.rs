//! Tandem sync simulator
//!
//! Runs the sync engine against the in-memory remote store and walks through
//! an offline session:
//! 1. Another device writes a few activities while we are online
//! 2. We go offline and create, edit and delete locally
//! 3. We reconnect; the outbox is committed and the stream settles
//!
//! Usage:
//!   tandem-sim --writes 3 --cache ./tandem-cache.db

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tandem_remote::memory::MemoryRemote;
use tandem_sync::{SyncConfig, SyncOrchestrator};
use tandem_types::{AccountId, Collection, EntityId, Payload};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tandem-sim")]
#[command(about = "Simulate an offline sync session against an in-memory remote store")]
struct Args {
    /// Account to sign in as
    #[arg(short, long, default_value = "demo-account")]
    account: String,

    /// Number of activities to create while offline
    #[arg(short, long, default_value = "3")]
    writes: usize,

    /// Cache database file (in-memory if omitted)
    #[arg(long)]
    cache: Option<PathBuf>,

    /// JSON sync configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let mut config = match &args.config {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if args.cache.is_some() {
        config.cache.path = args.cache.clone();
    }

    let account = AccountId::new(args.account.clone());
    let remote = MemoryRemote::new();
    for (i, title) in ["Morning run", "Read", "Standup"].iter().enumerate() {
        remote.server_put(
            &account,
            Collection::Activity,
            &EntityId::new(format!("seed-{i}")),
            payload(json!({ "title": title, "done": false })),
        );
    }

    let mut engine = SyncOrchestrator::new(Arc::new(remote.clone()), config);
    engine.initialize(account.clone()).await?;
    info!("Session started for {}", account);

    let mut activities = engine.subscribe(Collection::Activity).await?;
    let printer = tokio::spawn(async move {
        while let Some(event) = activities.next().await {
            println!(
                "  {:<8} {:<8} {:<40} {}",
                format!("{:?}", event.origin),
                format!("{:?}", event.kind),
                event.entity_id,
                serde_json::Value::Object(event.payload)
            );
        }
    });

    let mut errors = engine.channel_errors();
    tokio::spawn(async move {
        while let Ok(failure) = errors.recv().await {
            warn!("{} channel: {}", failure.collection, failure.error);
        }
    });

    // Let the push channels deliver the server's view.
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("Going offline");
    remote.set_reachable(false);
    engine.set_online(false);

    let mut handles = Vec::new();
    for n in 0..args.writes {
        let created = engine
            .create(
                Collection::Activity,
                payload(json!({ "title": format!("Offline note {n}"), "done": false })),
            )
            .await?;
        handles.push(created.handle);
    }
    handles.push(
        engine
            .update(
                Collection::Activity,
                &EntityId::new("seed-0"),
                payload(json!({ "done": true })),
                None,
            )
            .await?,
    );
    handles.push(
        engine
            .delete(Collection::Activity, &EntityId::new("seed-2"), None)
            .await?,
    );
    print_status(&engine, "offline").await?;

    info!("Reconnecting");
    remote.set_reachable(true);
    engine.set_online(true);

    for handle in handles {
        match handle.wait().await {
            Ok(receipt) => info!("Confirmed {} as {}", receipt.operation_id, receipt.entity_id),
            Err(err) => warn!("Mutation failed: {}", err),
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let summary = engine.force_resync().await?;
    info!(
        "Resync: {} replayed, {} confirmed, {} failed",
        summary.replayed, summary.confirmed, summary.failed
    );
    print_status(&engine, "reconnected").await?;

    println!("\n  Server now holds:");
    for record in remote.records(&account, Collection::Activity) {
        println!("  {:<12} {}", record.id, serde_json::Value::Object(record.payload));
    }
    println!();

    engine.teardown().await?;
    printer.await.context("event printer panicked")?;
    Ok(())
}

async fn print_status(engine: &SyncOrchestrator, label: &str) -> Result<()> {
    let status = engine.status().await?;
    println!("\n  [{label}] {}\n", serde_json::to_string(&status)?);
    Ok(())
}
