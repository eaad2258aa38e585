use anyhow::{Context, Result, anyhow};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use shiftsync::{DeadLetterQuarantine, QuarantineRetryOutcome, QueuePolicy, QueueStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Parser)]
#[command(name = "queue-tool")]
#[command(about = "Operator tooling for the shiftsync mutation queue")]
struct Cli {
    /// Directory holding the queue snapshot and journal.
    #[arg(long)]
    root: PathBuf,
    /// Optional JSON policy file; defaults apply otherwise.
    #[arg(long)]
    policy: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Stats,
    Pending,
    Backlog,
    Misses,
    Quarantine {
        #[command(subcommand)]
        action: QuarantineAction,
    },
    Cleanup {
        #[arg(long)]
        retention_days: Option<u32>,
    },
    Snapshot,
}

#[derive(Subcommand)]
enum QuarantineAction {
    List,
    Stats,
    Retry { id: String },
    Discard { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let policy = load_policy(cli.policy.as_deref())?;
    let store = QueueStore::open(&cli.root, policy)
        .await
        .with_context(|| format!("failed to open queue at {}", cli.root.display()))?;
    let store = Arc::new(Mutex::new(store));
    let quarantine = DeadLetterQuarantine::new(store.clone());

    match cli.command {
        Command::Stats => print_json(&store.lock().await.stats()),
        Command::Pending => print_json(&store.lock().await.list_active()),
        Command::Backlog => print_json(&store.lock().await.unreconciled()),
        Command::Misses => print_json(&store.lock().await.reconciliation_misses()),
        Command::Quarantine { action } => match action {
            QuarantineAction::List => print_json(&quarantine.list().await),
            QuarantineAction::Stats => print_json(&quarantine.stats().await),
            QuarantineAction::Retry { id } => match quarantine.retry(&id).await? {
                QuarantineRetryOutcome::Requeued { new_id } => {
                    println!("requeued {} as {}", id, new_id);
                    Ok(())
                }
                QuarantineRetryOutcome::NotFound => {
                    Err(anyhow!("no quarantined mutation with id {}", id))
                }
            },
            QuarantineAction::Discard { id } => {
                if !quarantine.discard(&id).await? {
                    return Err(anyhow!("no quarantined mutation with id {}", id));
                }
                println!("discarded {}", id);
                Ok(())
            }
        },
        Command::Cleanup { retention_days } => {
            cleanup(&store, &quarantine, retention_days).await
        }
        Command::Snapshot => {
            let mut store = store.lock().await;
            store.snapshot_now().await?;
            println!("snapshot written to {}", store.paths().snapshot_file.display());
            Ok(())
        }
    }
}

fn load_policy(path: Option<&Path>) -> Result<QueuePolicy> {
    match path {
        Some(path) => QueuePolicy::from_json_file(path)
            .with_context(|| format!("failed to load policy {}", path.display())),
        None => Ok(QueuePolicy::default()),
    }
}

/// Offline counterpart of the engine's retention sweep.
async fn cleanup(
    store: &Arc<Mutex<QueueStore>>,
    quarantine: &DeadLetterQuarantine,
    retention_days: Option<u32>,
) -> Result<()> {
    let policy = store.lock().await.policy().clone();
    let retention_days = retention_days.unwrap_or(policy.retention.retention_days);
    let now = Utc::now();

    let retention_cutoff = now
        .checked_sub_signed(Duration::days(i64::from(retention_days)))
        .ok_or_else(|| anyhow!("retention window of {} days is out of range", retention_days))?;
    let purged = quarantine.purge_created_before(retention_cutoff).await?;

    let max_execution_ms = i64::try_from(policy.drain.max_execution_ms)
        .context("drain.max_execution_ms is out of range")?;
    let stuck_cutoff = now
        .checked_sub_signed(Duration::milliseconds(max_execution_ms))
        .ok_or_else(|| anyhow!("max execution window is out of range"))?;
    let reset = store.lock().await.reset_stuck(stuck_cutoff).await?;

    println!(
        "purged {} quarantined mutation(s), reset {} stuck mutation(s)",
        purged,
        reset.len()
    );
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{}", rendered);
    Ok(())
}
