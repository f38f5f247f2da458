use anyhow::{Context, Result};
use changefeed_processor::{ConsumerConfig, PartitionId, ProcessorContext};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "changefeed-processor")]
#[command(about = "Copies every change of a monitored container into an output container")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Join the consumer group and process changes until interrupted (default)
    Run,
    /// Print every lease of this processor
    Status,
    /// Delete leases so processing restarts from the configured start position
    ResetLeases {
        #[arg(long)]
        partition: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = ConsumerConfig::from_env().context("Failed to load configuration")?;
    let context = ProcessorContext::new(config).context("Invalid configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&context).await,
        Command::Status => status(&context).await,
        Command::ResetLeases { partition } => reset_leases(&context, partition).await,
    }
}

async fn run(context: &ProcessorContext) -> Result<()> {
    let config = context.config();
    info!(
        host = %config.host_id,
        generated = config.host_id_generated,
        "starting consumer"
    );
    info!("{}", config);

    context
        .bootstrap()
        .await
        .context("Failed to create the lease container")?;
    let processor = context.copy_processor().context("Failed to build processor")?;
    processor.start().await.context("Failed to start processor")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown requested");

    processor.stop().await.context("Failed to stop processor")?;
    let stats = processor.stats();
    info!(
        batches = stats.batches_delivered,
        failed = stats.batches_failed,
        records = stats.records_delivered,
        checkpoints = stats.checkpoints,
        "consumer stopped"
    );
    Ok(())
}

async fn status(context: &ProcessorContext) -> Result<()> {
    let leases = context.lease_manager();
    let now = leases.now();
    let all = leases.leases().await.context("Failed to list leases")?;
    if all.is_empty() {
        println!("No leases.");
        return Ok(());
    }

    println!(
        "{:<12} {:<38} {:>6} {:>12}  {:<25} {}",
        "PARTITION", "OWNER", "EPOCH", "CONTINUATION", "LAST RENEWED", "EXPIRED"
    );
    for lease in all {
        let owner = lease
            .owner
            .as_ref()
            .map(|owner| owner.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<38} {:>6} {:>12}  {:<25} {}",
            lease.partition_id.as_str(),
            owner,
            lease.epoch,
            lease.continuation.lsn(),
            lease.last_renewed.to_rfc3339(),
            lease.is_expired_at(now, leases.ttl())
        );
    }
    Ok(())
}

async fn reset_leases(context: &ProcessorContext, partition: Option<String>) -> Result<()> {
    let leases = context.lease_manager();
    match partition {
        Some(partition) => {
            let removed = leases
                .reset(&PartitionId::from(partition.clone()))
                .await
                .with_context(|| format!("Failed to reset lease of partition '{}'", partition))?;
            if removed {
                println!("Lease of partition '{}' deleted.", partition);
            } else {
                println!("Partition '{}' has no lease.", partition);
            }
        }
        None => {
            let removed = leases.reset_all().await.context("Failed to reset leases")?;
            println!("{} lease(s) deleted.", removed);
        }
    }
    Ok(())
}
